//! Per-producer enqueue tokens.
//!
//! Each producer (the master, every worker, every streamer thread) owns its
//! tokens; nothing about a token is shared. A token buffers events that did
//! not fit their ring in a local pending queue and replays them on `flush`,
//! so a full ring degrades to allocation, never to loss or reordering of
//! one producer's events.
//!
//! Producers must call `flush` once per loop iteration; a token with parked
//! events and an idle producer would otherwise strand them.

use std::collections::VecDeque;
use std::sync::atomic::Ordering;

use tracing::warn;

use core_events::{DoerKind, Event, FABRIC_FALLBACK_ALLOCS};

use crate::{FabricHandle, PARITY_BUCKETS, bucket_of};

/// Non-task ring families a [`LaneToken`] can produce into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Completion,
    Rx,
    Tx,
}

fn record_park(lane: &str, pending_len: usize, was_draining: bool) {
    FABRIC_FALLBACK_ALLOCS.fetch_add(1, Ordering::Relaxed);
    // One warning per burst; the counter captures the volume.
    if !was_draining {
        warn!(
            target: "fabric",
            lane,
            pending = pending_len,
            "ring full, parking events in producer token"
        );
    }
}

/// Producer token for the completion, rx or tx ring family.
pub struct LaneToken {
    fabric: FabricHandle,
    lane: Lane,
    pending: [VecDeque<Event>; PARITY_BUCKETS],
}

impl LaneToken {
    pub fn new(fabric: FabricHandle, lane: Lane) -> Self {
        Self {
            fabric,
            lane,
            pending: [VecDeque::new(), VecDeque::new()],
        }
    }

    fn try_push(&self, bucket: usize, ev: Event) -> Result<(), Event> {
        match self.lane {
            Lane::Completion => self.fabric.try_push_completion(bucket, ev),
            Lane::Rx => self.fabric.try_push_rx(bucket, ev),
            Lane::Tx => self.fabric.try_push_tx(bucket, ev),
        }
    }

    /// Enqueue one event on its frame's parity bucket.
    pub fn enqueue(&mut self, ev: Event) {
        let bucket = bucket_of(ev.frame_id());
        if !self.pending[bucket].is_empty() {
            // FIFO: nothing overtakes parked events.
            self.pending[bucket].push_back(ev);
            record_park(self.lane_name(), self.pending[bucket].len(), true);
            return;
        }
        if let Err(ev) = self.try_push(bucket, ev) {
            self.pending[bucket].push_back(ev);
            record_park(self.lane_name(), self.pending[bucket].len(), false);
        }
    }

    pub fn enqueue_bulk<I: IntoIterator<Item = Event>>(&mut self, events: I) {
        for ev in events {
            self.enqueue(ev);
        }
    }

    /// Replay parked events. Returns true when nothing remains parked.
    pub fn flush(&mut self) -> bool {
        let mut clean = true;
        for bucket in 0..PARITY_BUCKETS {
            while let Some(ev) = self.pending[bucket].pop_front() {
                if let Err(ev) = self.try_push(bucket, ev) {
                    self.pending[bucket].push_front(ev);
                    clean = false;
                    break;
                }
            }
        }
        clean
    }

    pub fn pending_len(&self) -> usize {
        self.pending.iter().map(VecDeque::len).sum()
    }

    fn lane_name(&self) -> &'static str {
        match self.lane {
            Lane::Completion => "completion",
            Lane::Rx => "rx",
            Lane::Tx => "tx",
        }
    }
}

/// Master-side token for the task rings: routes by kernel kind and frame
/// parity.
pub struct TaskToken {
    fabric: FabricHandle,
    /// Pending queues keyed by (bucket, kernel).
    pending: Vec<VecDeque<Event>>,
}

impl TaskToken {
    pub fn new(fabric: FabricHandle) -> Self {
        Self {
            fabric,
            pending: (0..PARITY_BUCKETS * DoerKind::COUNT)
                .map(|_| VecDeque::new())
                .collect(),
        }
    }

    fn key(bucket: usize, doer: DoerKind) -> usize {
        bucket * DoerKind::COUNT + doer.index()
    }

    /// Enqueue a task event. The kernel is derived from the event kind;
    /// handing a non-task event to the task fabric is a programming error.
    pub fn enqueue(&mut self, ev: Event) {
        let doer = ev
            .kind
            .doer()
            .unwrap_or_else(|| panic!("{} is not a worker task", ev.kind));
        let bucket = bucket_of(ev.frame_id());
        let key = Self::key(bucket, doer);
        if !self.pending[key].is_empty() {
            self.pending[key].push_back(ev);
            record_park("task", self.pending[key].len(), true);
            return;
        }
        if let Err(ev) = self.fabric.try_push_task(bucket, doer, ev) {
            self.pending[key].push_back(ev);
            record_park("task", self.pending[key].len(), false);
        }
    }

    pub fn flush(&mut self) -> bool {
        let mut clean = true;
        for bucket in 0..PARITY_BUCKETS {
            for doer in DoerKind::POLL_ORDER {
                let key = Self::key(bucket, doer);
                while let Some(ev) = self.pending[key].pop_front() {
                    if let Err(ev) = self.fabric.try_push_task(bucket, doer, ev) {
                        self.pending[key].push_front(ev);
                        clean = false;
                        break;
                    }
                }
            }
        }
        clean
    }

    pub fn pending_len(&self) -> usize {
        self.pending.iter().map(VecDeque::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskFabric;
    use core_events::{EventKind, Tag};
    use std::sync::Arc;

    fn fft_ev(frame: u32, inner: u32) -> Event {
        Event::single(EventKind::Fft, Tag::for_antenna(frame, 0, inner))
    }

    #[test]
    fn task_token_routes_by_parity() {
        let fabric = Arc::new(TaskFabric::new(8));
        let mut tok = TaskToken::new(fabric.clone());
        for frame in [0u32, 1, 2, 3] {
            tok.enqueue(fft_ev(frame, 0));
        }
        assert_eq!(fabric.task_len(0, DoerKind::Fft), 2);
        assert_eq!(fabric.task_len(1, DoerKind::Fft), 2);
        for bucket in 0..2 {
            while let Some(ev) = fabric.pop_task(bucket, DoerKind::Fft) {
                assert_eq!(bucket_of(ev.frame_id()), bucket);
            }
        }
    }

    #[test]
    fn full_ring_parks_and_flush_preserves_order() {
        let fabric = Arc::new(TaskFabric::new(2));
        let mut tok = TaskToken::new(fabric.clone());
        // Frames all even: one bucket, one kernel, capacity 2.
        for inner in 0..6 {
            tok.enqueue(fft_ev(0, inner));
        }
        assert_eq!(tok.pending_len(), 4);

        let mut seen = Vec::new();
        // Interleave consumption and flushing, as the real loops do.
        while seen.len() < 6 {
            while let Some(ev) = fabric.pop_task(0, DoerKind::Fft) {
                seen.push(ev.tag().inner());
            }
            tok.flush();
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(tok.pending_len(), 0);
        assert!(tok.flush());
    }

    #[test]
    fn lane_token_alternating_full_ring_keeps_order() {
        let fabric = Arc::new(TaskFabric::new(1));
        let mut tok = LaneToken::new(fabric.clone(), Lane::Completion);
        let mut seen = Vec::new();
        for inner in 0..8 {
            tok.enqueue(fft_ev(2, inner));
            // Every other iteration the ring is full at enqueue time.
            if inner % 2 == 1
                && let Some(ev) = fabric.pop_completion(0)
            {
                seen.push(ev.tag().inner());
            }
            tok.flush();
        }
        // Drain whatever is left, flushing between pops.
        loop {
            let clean = tok.flush();
            match fabric.pop_completion(0) {
                Some(ev) => seen.push(ev.tag().inner()),
                None if clean => break,
                None => {}
            }
        }
        let mut sorted = seen.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), seen.len(), "duplicated event");
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "reordered: {seen:?}");
    }

    #[test]
    #[should_panic(expected = "not a worker task")]
    fn task_token_rejects_non_task_kinds() {
        let fabric = Arc::new(TaskFabric::new(2));
        let mut tok = TaskToken::new(fabric);
        tok.enqueue(Event::single(EventKind::PacketRx, Tag::for_frame(0)));
    }
}
