//! Worker pool: pinned threads hosting every compute kernel.
//!
//! Workers synchronize with the master only through the fabric queues; there
//! is no shared mutable state beyond the buffer pool's stage discipline.
//! Each worker polls its current parity bucket in the fixed kernel order,
//! runs at most one task per kernel per round, and flips buckets after five
//! all-empty rounds so both live frames progress.

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tracing::{debug, info};

use core_buffers::BufferPool;
use core_config::Config;
use core_events::RunFlag;
use core_fabric::{BucketCursor, FabricHandle, Lane, LaneToken};

mod doers;
pub mod platform;
pub use doers::{Doer, DoerContext, all_doers};

/// One worker's kernels, cursor and completion token. Also reused by the
/// master in single-thread mode, where one context runs inline between event
/// dispatches.
pub struct WorkerContext {
    doers: Vec<Box<dyn Doer>>,
    cursor: BucketCursor,
    completions: LaneToken,
    fabric: FabricHandle,
}

impl WorkerContext {
    pub fn new(cfg: Arc<Config>, pool: Arc<BufferPool>, fabric: FabricHandle) -> Self {
        let ctx = DoerContext { cfg, pool };
        Self {
            doers: all_doers(&ctx),
            cursor: BucketCursor::new(),
            completions: LaneToken::new(fabric.clone(), Lane::Completion),
            fabric,
        }
    }

    /// One poll round: each kernel in order, at most one task each.
    /// Returns true if any task ran.
    pub fn poll_round(&mut self) -> bool {
        let bucket = self.cursor.bucket();
        let mut any = false;
        for doer in &mut self.doers {
            if let Some(task) = self.fabric.pop_task(bucket, doer.kind()) {
                let completion = doer.run(&task);
                self.completions.enqueue(completion);
                any = true;
            }
        }
        self.completions.flush();
        if any {
            self.cursor.record_hit();
        } else {
            self.cursor.record_empty();
        }
        any
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn the configured worker threads, pinned from `core_offset + 1`
    /// (the master owns `core_offset`).
    pub fn spawn(
        cfg: Arc<Config>,
        pool: Arc<BufferPool>,
        fabric: FabricHandle,
        run: RunFlag,
    ) -> Result<Self> {
        let mut handles = Vec::with_capacity(cfg.worker_thread_num());
        for i in 0..cfg.worker_thread_num() {
            let core = cfg.core_offset() + 1 + i;
            let mut ctx = WorkerContext::new(cfg.clone(), pool.clone(), fabric.clone());
            let run = run.clone();
            let handle = std::thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || {
                    platform::pin_or_warn(core, "worker");
                    debug!(target: "worker", worker = i, core, "worker_started");
                    while run.is_running() {
                        if !ctx.poll_round() {
                            std::hint::spin_loop();
                        }
                    }
                    debug!(target: "worker", worker = i, "worker_stopped");
                })
                .with_context(|| format!("spawn worker-{i}"))?;
            handles.push(handle);
        }
        info!(target: "worker", count = handles.len(), "worker_pool_started");
        Ok(Self { handles })
    }

    pub fn join(self) {
        for h in self.handles {
            let _ = h.join();
        }
    }
}
