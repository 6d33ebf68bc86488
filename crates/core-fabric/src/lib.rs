//! Message fabric: bounded lock-free queues between master, workers and the
//! streamer boundary.
//!
//! Four ring families, each split into two parity buckets keyed by
//! `frame_id % 2`:
//! - task rings, one per kernel kind (master -> workers),
//! - completion rings (workers -> master),
//! - rx rings (streamer -> master),
//! - tx rings (master -> streamer).
//!
//! Parity lets workers drain one bucket while the master fills the other, so
//! a flood of frame N+2 completions never blocks frame N+1 behind it.
//!
//! Channel policy: rings are sized from configuration to absorb a full frame
//! plus slack. Producers never block and consumers never wait; when a ring is
//! full the producer token parks the event in a local pending queue
//! (allocating) and retries on `flush`. Parked events preserve per-producer
//! FIFO order. Every park increments `FABRIC_FALLBACK_ALLOCS`; persistent
//! growth of that counter is a capacity misconfiguration signal, not a
//! correctness problem.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crossbeam_queue::ArrayQueue;

use core_events::{DoerKind, Event, FABRIC_PARITY_FLIPS};

mod token;
pub use token::{Lane, LaneToken, TaskToken};

/// Number of parity buckets; also the scheduling-horizon constant the
/// deferral policy compares against.
pub const PARITY_BUCKETS: usize = 2;

/// Bucket a frame's traffic belongs to.
pub fn bucket_of(frame_id: u32) -> usize {
    (frame_id % 2) as usize
}

struct BucketRings {
    tasks: Vec<ArrayQueue<Event>>,
    completions: ArrayQueue<Event>,
    rx: ArrayQueue<Event>,
    tx: ArrayQueue<Event>,
}

impl BucketRings {
    fn new(capacity: usize) -> Self {
        Self {
            tasks: (0..DoerKind::COUNT)
                .map(|_| ArrayQueue::new(capacity))
                .collect(),
            completions: ArrayQueue::new(capacity),
            rx: ArrayQueue::new(capacity),
            tx: ArrayQueue::new(capacity),
        }
    }
}

/// The shared queue fabric. Cheap to share via `Arc`; every operation is
/// lock-free.
pub struct TaskFabric {
    buckets: Vec<BucketRings>,
    capacity: usize,
}

impl TaskFabric {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        Self {
            buckets: (0..PARITY_BUCKETS)
                .map(|_| BucketRings::new(capacity))
                .collect(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn try_push_task(&self, bucket: usize, doer: DoerKind, ev: Event) -> Result<(), Event> {
        self.buckets[bucket].tasks[doer.index()].push(ev)
    }

    pub fn pop_task(&self, bucket: usize, doer: DoerKind) -> Option<Event> {
        self.buckets[bucket].tasks[doer.index()].pop()
    }

    pub fn task_len(&self, bucket: usize, doer: DoerKind) -> usize {
        self.buckets[bucket].tasks[doer.index()].len()
    }

    pub fn try_push_completion(&self, bucket: usize, ev: Event) -> Result<(), Event> {
        self.buckets[bucket].completions.push(ev)
    }

    pub fn pop_completion(&self, bucket: usize) -> Option<Event> {
        self.buckets[bucket].completions.pop()
    }

    pub fn try_push_rx(&self, bucket: usize, ev: Event) -> Result<(), Event> {
        self.buckets[bucket].rx.push(ev)
    }

    pub fn pop_rx(&self, bucket: usize) -> Option<Event> {
        self.buckets[bucket].rx.pop()
    }

    pub fn try_push_tx(&self, bucket: usize, ev: Event) -> Result<(), Event> {
        self.buckets[bucket].tx.push(ev)
    }

    pub fn pop_tx(&self, bucket: usize) -> Option<Event> {
        self.buckets[bucket].tx.pop()
    }
}

/// Shared handle type used throughout the runtime.
pub type FabricHandle = Arc<TaskFabric>;

/// Consumer-side parity fairness.
///
/// A consumer drains one bucket at a time; after
/// [`EMPTY_POLLS_BEFORE_FLIP`] consecutive empty polls it flips to the
/// other bucket so both live frames keep making progress. A consumer that
/// knows where the producer is writing can flip immediately with
/// [`BucketCursor::follow`].
#[derive(Debug)]
pub struct BucketCursor {
    current: usize,
    empty_polls: u32,
}

pub const EMPTY_POLLS_BEFORE_FLIP: u32 = 5;

impl Default for BucketCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl BucketCursor {
    pub fn new() -> Self {
        Self {
            current: 0,
            empty_polls: 0,
        }
    }

    pub fn bucket(&self) -> usize {
        self.current
    }

    pub fn record_hit(&mut self) {
        self.empty_polls = 0;
    }

    /// Record an empty poll; returns true if the cursor flipped.
    pub fn record_empty(&mut self) -> bool {
        self.empty_polls += 1;
        if self.empty_polls >= EMPTY_POLLS_BEFORE_FLIP {
            self.flip();
            true
        } else {
            false
        }
    }

    pub fn flip(&mut self) {
        self.current ^= 1;
        self.empty_polls = 0;
        FABRIC_PARITY_FLIPS.fetch_add(1, Ordering::Relaxed);
    }

    /// Jump straight to the bucket serving `frame_id`.
    pub fn follow(&mut self, frame_id: u32) {
        let target = bucket_of(frame_id);
        if target != self.current {
            self.flip();
        } else {
            self.empty_polls = 0;
        }
    }
}
