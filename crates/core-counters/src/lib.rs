//! Master-owned frame bookkeeping: completion grids, FFT batching queues and
//! the live-frame tracker.
//!
//! Everything in this crate is written only by the master thread. Safety and
//! correctness follow from that single-writer rule, not from locks.

mod grid;
pub use grid::CounterGrid;

use std::collections::VecDeque;
use std::time::Instant;

use bitflags::bitflags;
use core_events::Tag;

bitflags! {
    /// Per-frame stage bitset.
    ///
    /// `*_SCHED` flags gate the schedule cursor: both set (or pre-asserted
    /// for a direction with zero symbols) lets `cur_sched_frame` advance.
    /// `*_PROC` flags gate retirement.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const UL_SCHED_DONE = 1 << 0;
        const DL_SCHED_DONE = 1 << 1;
        const UL_PROC_DONE = 1 << 2;
        const DL_PROC_DONE = 1 << 3;
    }
}

impl FrameFlags {
    pub fn sched_done(self) -> bool {
        self.contains(FrameFlags::UL_SCHED_DONE | FrameFlags::DL_SCHED_DONE)
    }

    pub fn proc_done(self) -> bool {
        self.contains(FrameFlags::UL_PROC_DONE | FrameFlags::DL_PROC_DONE)
    }
}

/// Per-(slot, symbol) FIFOs of RX packet tags awaiting FFT batching.
#[derive(Debug)]
pub struct FftQueue {
    window: usize,
    stride: usize,
    queues: Vec<VecDeque<Tag>>,
}

impl FftQueue {
    pub fn new(window: usize, stride: usize) -> Self {
        Self {
            window,
            stride,
            queues: (0..window * stride).map(|_| VecDeque::new()).collect(),
        }
    }

    fn index(&self, frame_id: u32, symbol_id: u16) -> usize {
        let sym = symbol_id as usize;
        assert!(sym < self.stride);
        (frame_id as usize % self.window) * self.stride + sym
    }

    pub fn push(&mut self, tag: Tag) {
        let idx = self.index(tag.frame_id(), tag.symbol_id());
        self.queues[idx].push_back(tag);
    }

    pub fn len(&self, frame_id: u32, symbol_id: u16) -> usize {
        self.queues[self.index(frame_id, symbol_id)].len()
    }

    pub fn is_empty(&self, frame_id: u32, symbol_id: u16) -> bool {
        self.len(frame_id, symbol_id) == 0
    }

    /// Remove up to `n` tags in arrival order.
    pub fn drain_batch(&mut self, frame_id: u32, symbol_id: u16, n: usize) -> Vec<Tag> {
        let idx = self.index(frame_id, symbol_id);
        let take = n.min(self.queues[idx].len());
        self.queues[idx].drain(..take).collect()
    }
}

/// Timing marks recorded per live frame and reported at shutdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameTimings {
    pub first_rx: Option<Instant>,
    pub fft_done: Option<Instant>,
    pub beam_done: Option<Instant>,
    pub decode_done: Option<Instant>,
    pub tx_first: Option<Instant>,
    pub tx_done: Option<Instant>,
    pub retired: Option<Instant>,
}

#[derive(Debug, Clone)]
struct SlotState {
    frame_id: Option<u32>,
    flags: FrameFlags,
    timings: FrameTimings,
}

/// Tracks which frame occupies each window slot and its stage bitset.
#[derive(Debug)]
pub struct FrameTracker {
    window: usize,
    slots: Vec<SlotState>,
}

impl FrameTracker {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            slots: vec![
                SlotState {
                    frame_id: None,
                    flags: FrameFlags::empty(),
                    timings: FrameTimings::default(),
                };
                window
            ],
        }
    }

    fn slot(&self, frame_id: u32) -> usize {
        frame_id as usize % self.window
    }

    /// Frame currently occupying the slot `frame_id` maps to, if any.
    pub fn occupant(&self, frame_id: u32) -> Option<u32> {
        self.slots[self.slot(frame_id)].frame_id
    }

    pub fn is_live(&self, frame_id: u32) -> bool {
        self.occupant(frame_id) == Some(frame_id)
    }

    /// Admit a frame into its slot. The caller has already verified the slot
    /// is free; occupying over a live predecessor is a window violation.
    pub fn begin(&mut self, frame_id: u32, preassert: FrameFlags, now: Instant) {
        let slot = self.slot(frame_id);
        let state = &mut self.slots[slot];
        assert!(
            state.frame_id.is_none(),
            "slot {slot} still owned by frame {:?}",
            state.frame_id
        );
        state.frame_id = Some(frame_id);
        state.flags = preassert;
        state.timings = FrameTimings {
            first_rx: Some(now),
            ..FrameTimings::default()
        };
    }

    pub fn flags(&self, frame_id: u32) -> FrameFlags {
        debug_assert!(self.is_live(frame_id));
        self.slots[self.slot(frame_id)].flags
    }

    pub fn set_flags(&mut self, frame_id: u32, flags: FrameFlags) {
        debug_assert!(self.is_live(frame_id));
        let slot = self.slot(frame_id);
        self.slots[slot].flags.insert(flags);
    }

    pub fn timings(&self, frame_id: u32) -> &FrameTimings {
        &self.slots[self.slot(frame_id)].timings
    }

    pub fn timings_mut(&mut self, frame_id: u32) -> &mut FrameTimings {
        debug_assert!(self.is_live(frame_id));
        let slot = self.slot(frame_id);
        &mut self.slots[slot].timings
    }

    /// Release the slot. Returns the final timings for the stats report.
    pub fn retire(&mut self, frame_id: u32, now: Instant) -> FrameTimings {
        let slot = self.slot(frame_id);
        let state = &mut self.slots[slot];
        assert_eq!(state.frame_id, Some(frame_id), "retiring a non-live frame");
        state.frame_id = None;
        state.flags = FrameFlags::empty();
        state.timings.retired = Some(now);
        state.timings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fft_queue_batches_in_arrival_order() {
        let mut q = FftQueue::new(4, 8);
        for ant in [3u32, 0, 2, 1] {
            q.push(Tag::for_antenna(1, 2, ant));
        }
        let batch = q.drain_batch(1, 2, 3);
        let ants: Vec<u32> = batch.iter().map(|t| t.inner()).collect();
        assert_eq!(ants, vec![3, 0, 2]);
        assert_eq!(q.len(1, 2), 1);
    }

    #[test]
    fn fft_queue_is_per_symbol() {
        let mut q = FftQueue::new(4, 8);
        q.push(Tag::for_antenna(0, 1, 0));
        q.push(Tag::for_antenna(0, 2, 0));
        assert_eq!(q.len(0, 1), 1);
        assert_eq!(q.len(0, 2), 1);
        assert!(q.drain_batch(0, 1, 8).len() == 1);
        assert!(q.is_empty(0, 1));
    }

    #[test]
    fn tracker_lifecycle() {
        let mut t = FrameTracker::new(4);
        let now = Instant::now();
        assert_eq!(t.occupant(5), None);
        t.begin(5, FrameFlags::DL_SCHED_DONE | FrameFlags::DL_PROC_DONE, now);
        assert!(t.is_live(5));
        assert!(!t.flags(5).proc_done());
        t.set_flags(5, FrameFlags::UL_PROC_DONE | FrameFlags::UL_SCHED_DONE);
        assert!(t.flags(5).proc_done());
        assert!(t.flags(5).sched_done());
        let timings = t.retire(5, now);
        assert!(timings.retired.is_some());
        assert!(!t.is_live(5));
        // Slot 1 is free again for frame 9.
        t.begin(9, FrameFlags::empty(), now);
        assert!(t.is_live(9));
    }

    #[test]
    #[should_panic(expected = "still owned")]
    fn double_begin_asserts() {
        let mut t = FrameTracker::new(4);
        let now = Instant::now();
        t.begin(0, FrameFlags::empty(), now);
        t.begin(4, FrameFlags::empty(), now);
    }
}
