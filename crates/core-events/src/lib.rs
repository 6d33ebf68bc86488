//! Core event vocabulary and loop primitives for Pylon.
//!
//! The master scheduler, the worker pool and the streamer boundary all speak
//! one message type: [`Event`], a kind plus a small bounded list of packed
//! [`Tag`]s. Bounding the tag list keeps events `Copy`-cheap and allocation
//! free on the hot path while still allowing bulk-coalesced tasks (an FFT
//! over a block of antennas travels as one event with N tags).

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arrayvec::ArrayVec;

mod tag;
pub use tag::{MAX_INNER_ID, MAX_SYMBOL_ID, Tag};

// -------------------------------------------------------------------------------------------------
// Telemetry
// -------------------------------------------------------------------------------------------------
// Relaxed atomic counters, incremented from hot paths without locking. They are inspected by unit
// tests and logged once at shutdown; persistent growth of the fallback counters is the capacity
// misconfiguration signal described in the fabric crate.
// -------------------------------------------------------------------------------------------------
pub static FABRIC_FALLBACK_ALLOCS: AtomicU64 = AtomicU64::new(0); // ring full, event parked in token pending
pub static FABRIC_PARITY_FLIPS: AtomicU64 = AtomicU64::new(0); // consumer-side bucket flips after empty polls
pub static DEFERRAL_PUSHES: AtomicU64 = AtomicU64::new(0); // downlink starts postponed by window saturation
pub static MAC_SEND_FAILURES: AtomicU64 = AtomicU64::new(0); // mac request channel full or disconnected

/// Maximum tags one event may carry. Batch emitters must respect this cap.
pub const MAX_EVENT_TAGS: usize = 16;

/// Every message kind that crosses a queue in the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// RX packet landed in a socket buffer (streamer -> master).
    PacketRx,
    /// FFT task / completion.
    Fft,
    /// Beam-weight computation task / completion.
    Beam,
    /// Demodulation (equalize + demap) task / completion.
    Demul,
    /// Code-block decode task / completion.
    Decode,
    /// Decoded uplink payload handed to the MAC (master -> mac).
    ToMac,
    /// MAC delivered a downlink frame payload (mac -> master).
    FromMac,
    /// Code-block encode task / completion.
    Encode,
    /// Precode task / completion.
    Precode,
    /// IFFT task / completion.
    Ifft,
    /// TX symbol handed to / transmitted by the streamer.
    PacketTx,
    /// Per-frame SNR measurement (master -> mac).
    SnrReport,
    /// MCS change pushed by the MAC (mac -> master).
    RanUpdate,
}

/// Compute kernels hosted by every worker, in the fixed poll order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DoerKind {
    Beam,
    Fft,
    Decode,
    Demul,
    Ifft,
    Precode,
    Encode,
}

impl DoerKind {
    /// Fixed worker poll order.
    pub const POLL_ORDER: [DoerKind; 7] = [
        DoerKind::Beam,
        DoerKind::Fft,
        DoerKind::Decode,
        DoerKind::Demul,
        DoerKind::Ifft,
        DoerKind::Precode,
        DoerKind::Encode,
    ];

    pub const COUNT: usize = 7;

    /// Dense index used for per-kernel queue arrays.
    pub fn index(self) -> usize {
        match self {
            DoerKind::Beam => 0,
            DoerKind::Fft => 1,
            DoerKind::Decode => 2,
            DoerKind::Demul => 3,
            DoerKind::Ifft => 4,
            DoerKind::Precode => 5,
            DoerKind::Encode => 6,
        }
    }

    pub fn event_kind(self) -> EventKind {
        match self {
            DoerKind::Beam => EventKind::Beam,
            DoerKind::Fft => EventKind::Fft,
            DoerKind::Decode => EventKind::Decode,
            DoerKind::Demul => EventKind::Demul,
            DoerKind::Ifft => EventKind::Ifft,
            DoerKind::Precode => EventKind::Precode,
            DoerKind::Encode => EventKind::Encode,
        }
    }
}

impl EventKind {
    /// The kernel that executes this kind, if it is a worker task.
    pub fn doer(self) -> Option<DoerKind> {
        match self {
            EventKind::Beam => Some(DoerKind::Beam),
            EventKind::Fft => Some(DoerKind::Fft),
            EventKind::Decode => Some(DoerKind::Decode),
            EventKind::Demul => Some(DoerKind::Demul),
            EventKind::Ifft => Some(DoerKind::Ifft),
            EventKind::Precode => Some(DoerKind::Precode),
            EventKind::Encode => Some(DoerKind::Encode),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One message: a kind plus up to [`MAX_EVENT_TAGS`] task tags.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub tags: ArrayVec<Tag, MAX_EVENT_TAGS>,
}

impl Event {
    pub fn single(kind: EventKind, tag: Tag) -> Self {
        let mut tags = ArrayVec::new();
        tags.push(tag);
        Self { kind, tags }
    }

    /// Build a bulk-coalesced event. Panics if the batch exceeds the cap;
    /// emitters size batches from configuration, so overflow is a bug.
    pub fn batched<I: IntoIterator<Item = Tag>>(kind: EventKind, tags: I) -> Self {
        let mut out: ArrayVec<Tag, MAX_EVENT_TAGS> = ArrayVec::new();
        for t in tags {
            out.try_push(t)
                .unwrap_or_else(|_| panic!("event batch exceeds {MAX_EVENT_TAGS} tags"));
        }
        debug_assert!(!out.is_empty(), "event without tags");
        Self { kind, tags: out }
    }

    /// First tag; every event carries at least one.
    pub fn tag(&self) -> Tag {
        self.tags[0]
    }

    pub fn frame_id(&self) -> u32 {
        self.tag().frame_id()
    }

    /// Completion event mirroring this task's tags.
    pub fn completion(&self) -> Event {
        self.clone()
    }
}

// -------------------------------------------------------------------------------------------------
// Cancellation
// -------------------------------------------------------------------------------------------------

/// Shared stop flag observed by every loop (master, workers, streamers, mac).
/// The OS signal bridge in the binary is the only other writer.
#[derive(Clone, Debug, Default)]
pub struct RunFlag {
    inner: Arc<AtomicBool>,
}

impl RunFlag {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.load(Ordering::Acquire)
    }

    pub fn stop(&self) {
        self.inner.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batched_event_holds_all_tags() {
        let tags: Vec<Tag> = (0..8).map(|a| Tag::for_antenna(1, 2, a)).collect();
        let ev = Event::batched(EventKind::Fft, tags.clone());
        assert_eq!(ev.tags.len(), 8);
        assert_eq!(ev.tags.as_slice(), tags.as_slice());
        assert_eq!(ev.frame_id(), 1);
    }

    #[test]
    #[should_panic(expected = "exceeds")]
    fn batched_event_rejects_oversize() {
        let tags = (0..MAX_EVENT_TAGS as u32 + 1).map(|a| Tag::for_antenna(0, 0, a));
        let _ = Event::batched(EventKind::Fft, tags);
    }

    #[test]
    fn doer_poll_order_is_dense_and_complete() {
        let mut seen = [false; DoerKind::COUNT];
        for d in DoerKind::POLL_ORDER {
            assert!(!seen[d.index()], "duplicate doer index");
            seen[d.index()] = true;
            assert_eq!(d.event_kind().doer(), Some(d));
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn non_task_kinds_have_no_doer() {
        for k in [
            EventKind::PacketRx,
            EventKind::PacketTx,
            EventKind::ToMac,
            EventKind::FromMac,
            EventKind::SnrReport,
            EventKind::RanUpdate,
        ] {
            assert!(k.doer().is_none());
        }
    }

    #[test]
    fn run_flag_stops_once() {
        let f = RunFlag::new();
        assert!(f.is_running());
        let g = f.clone();
        g.stop();
        assert!(!f.is_running());
    }
}
