//! Master scheduler: the single-threaded event loop driving the per-frame
//! pipeline.
//!
//! The master alternates strictly between its two sources, the streamer
//! lane and the worker completion lane, so neither can starve the other.
//! Handlers are non-blocking: they only update counters and emit new task,
//! TX or MAC events. The master performs no DSP work (except in
//! single-thread mode, where one inline worker round runs between
//! dispatches and the queues still carry every event).
//!
//! Frame window: two cursors bound the live frames.
//! `cur_proc_frame <= cur_sched_frame < cur_proc_frame + W` holds at every
//! observable point. The schedule cursor advances over frames whose uplink
//! and downlink scheduling both completed (flags pre-asserted for a
//! direction with zero symbols), capped by the window; the process cursor
//! advances over consecutively retired frames.
//!
//! Downlink deferral: a frame whose encode start would run ahead of the
//! scheduling horizon (`cur_sched_frame + kScheduleQueues` with
//! kScheduleQueues = 2, the parity bucket count), or that arrives while an
//! earlier frame sits deferred, is parked on a FIFO. Each retirement
//! releases at most one deferred frame, in arrival order.
//!
//! Error policy on the hot path: an RX packet beyond
//! `cur_sched_frame + W` is a fatal pipeline stall (the CPU cannot keep
//! up): the loop stores the status and signals shutdown. An event kind the
//! master does not understand is a programming error and aborts.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tracing::{debug, error, info};

use core_buffers::BufferPool;
use core_config::Config;
use core_counters::{CounterGrid, FftQueue, FrameFlags, FrameTimings, FrameTracker};
use core_events::{Event, RunFlag};
use core_fabric::{BucketCursor, FabricHandle, Lane, LaneToken, PARITY_BUCKETS, TaskToken};
use core_mac::CoreMac;
use core_worker::WorkerContext;

mod handlers;
mod stats;
pub use stats::RunReport;

/// Scheduling horizon for downlink deferral, in frames ahead of the
/// schedule cursor. Matches the parity bucket count: at most two frames'
/// tasks are ever interleaved in the fabric.
pub const SCHEDULE_QUEUES: u32 = PARITY_BUCKETS as u32;

/// Deferral overflows tolerated before the stuck frame is declared fatal.
const DEFERRAL_OVERFLOW_FATAL: u32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedStatus {
    Running,
    /// `frames_to_test` frames retired; clean shutdown.
    Finished,
    /// Pipeline stall: an RX packet landed beyond the frame window.
    Stalled { frame_id: u32 },
}

/// One completion grid per pipeline stage.
pub(crate) struct StageCounters {
    pub(crate) rx: CounterGrid,
    pub(crate) pilot_fft: CounterGrid,
    pub(crate) ul_fft: CounterGrid,
    pub(crate) beam: CounterGrid,
    pub(crate) demul: CounterGrid,
    pub(crate) decode: CounterGrid,
    pub(crate) encode: CounterGrid,
    pub(crate) precode: CounterGrid,
    pub(crate) ifft: CounterGrid,
    pub(crate) tx: CounterGrid,
}

impl StageCounters {
    fn new(cfg: &Config) -> Self {
        let w = cfg.window();
        let stride = cfg.schedule().frame_len();
        let n_pilot = cfg.schedule().pilot_symbols().len();
        let n_ul = cfg.schedule().uplink_symbols().len();
        let n_dl = cfg.schedule().downlink_symbols().len();
        let ants = cfg.bs_ant_num();
        Self {
            rx: CounterGrid::new(w, stride, ants, cfg.schedule().rx_symbol_count()),
            pilot_fft: CounterGrid::new(w, stride, ants, n_pilot),
            ul_fft: CounterGrid::new(w, stride, ants, n_ul),
            beam: CounterGrid::new(w, 1, cfg.beam_task_count(), 1),
            demul: CounterGrid::new(w, stride, cfg.demul_tasks_per_symbol(), n_ul),
            decode: CounterGrid::new(w, stride, cfg.code_blocks_per_symbol(), n_ul),
            encode: CounterGrid::new(w, stride, cfg.code_blocks_per_symbol(), n_dl),
            precode: CounterGrid::new(w, stride, cfg.demul_tasks_per_symbol(), n_dl),
            ifft: CounterGrid::new(w, stride, ants, n_dl),
            tx: CounterGrid::new(w, stride, ants, n_dl),
        }
    }

    fn reset(&mut self, frame_id: u32) {
        self.rx.reset(frame_id);
        self.pilot_fft.reset(frame_id);
        self.ul_fft.reset(frame_id);
        self.beam.reset(frame_id);
        self.demul.reset(frame_id);
        self.decode.reset(frame_id);
        self.encode.reset(frame_id);
        self.precode.reset(frame_id);
        self.ifft.reset(frame_id);
        self.tx.reset(frame_id);
    }
}

pub struct Scheduler {
    pub(crate) cfg: Arc<Config>,
    pub(crate) pool: Arc<BufferPool>,
    fabric: FabricHandle,
    pub(crate) tasks: TaskToken,
    pub(crate) tx_out: LaneToken,
    pub(crate) mac: Option<CoreMac>,
    run: RunFlag,
    inline_worker: Option<WorkerContext>,
    rx_cursor: BucketCursor,
    comp_cursor: BucketCursor,

    pub(crate) counters: StageCounters,
    pub(crate) fft_pending: FftQueue,
    pub(crate) frames: FrameTracker,
    cur_sched_frame: u32,
    cur_proc_frame: u32,
    deferred: VecDeque<u32>,
    deferral_overflow: u32,
    pub(crate) demul_requested: Vec<bool>,
    pub(crate) precode_requested: Vec<bool>,
    pub(crate) dl_requested: Vec<bool>,
    status: SchedStatus,
    frames_retired: u64,
    stats: stats::StatsAggregator,
    last_retired: Option<FrameTimings>,
    pub(crate) ue_mcs: Vec<u8>,
}

impl Scheduler {
    pub fn new(
        cfg: Arc<Config>,
        pool: Arc<BufferPool>,
        fabric: FabricHandle,
        mac: Option<CoreMac>,
        run: RunFlag,
    ) -> Self {
        let stride = cfg.schedule().frame_len();
        let w = cfg.window();
        let inline_worker = cfg
            .single_threaded()
            .then(|| WorkerContext::new(cfg.clone(), pool.clone(), fabric.clone()));
        Self {
            counters: StageCounters::new(&cfg),
            fft_pending: FftQueue::new(w, stride),
            frames: FrameTracker::new(w),
            tasks: TaskToken::new(fabric.clone()),
            tx_out: LaneToken::new(fabric.clone(), Lane::Tx),
            rx_cursor: BucketCursor::new(),
            comp_cursor: BucketCursor::new(),
            cur_sched_frame: 0,
            cur_proc_frame: 0,
            deferred: VecDeque::with_capacity(w),
            deferral_overflow: 0,
            demul_requested: vec![false; w * stride],
            precode_requested: vec![false; w * stride],
            dl_requested: vec![false; w],
            status: SchedStatus::Running,
            frames_retired: 0,
            stats: stats::StatsAggregator::default(),
            last_retired: None,
            ue_mcs: vec![0; cfg.ue_num()],
            inline_worker,
            mac,
            cfg,
            pool,
            fabric,
            run,
        }
    }

    // ---- Observability -------------------------------------------------

    pub fn cur_sched_frame(&self) -> u32 {
        self.cur_sched_frame
    }

    pub fn cur_proc_frame(&self) -> u32 {
        self.cur_proc_frame
    }

    pub fn status(&self) -> SchedStatus {
        self.status
    }

    pub fn frames_retired(&self) -> u64 {
        self.frames_retired
    }

    pub fn deferred_frames(&self) -> Vec<u32> {
        self.deferred.iter().copied().collect()
    }

    /// Timing marks of the most recently retired frame.
    pub fn last_retired_timings(&self) -> Option<FrameTimings> {
        self.last_retired
    }

    // ---- Event loop ----------------------------------------------------

    /// One loop iteration: at most one streamer event, then at most one
    /// completion event, then MAC responses and (in single-thread mode) one
    /// inline worker round. Returns true if anything happened.
    pub fn tick(&mut self) -> bool {
        let mut did = false;
        if let Some(ev) = self.pop_streamer_event() {
            self.dispatch(ev);
            did = true;
        }
        if let Some(ev) = self.pop_completion_event() {
            self.dispatch(ev);
            did = true;
        }
        if self.poll_mac() {
            did = true;
        }
        if let Some(worker) = self.inline_worker.as_mut()
            && worker.poll_round()
        {
            did = true;
        }
        self.tasks.flush();
        self.tx_out.flush();
        self.debug_check_window();
        did
    }

    /// Run until shutdown, then emit the timing report.
    pub fn run(&mut self) -> Result<RunReport> {
        info!(
            target: "sched",
            window = self.cfg.window(),
            frames_to_test = self.cfg.frames_to_test(),
            single_thread = self.cfg.single_threaded(),
            "master_loop_started"
        );
        while self.run.is_running() {
            if !self.tick() {
                std::hint::spin_loop();
            }
        }
        // Shutdown path: replay anything a token still holds so queues end
        // drained, then snapshot stats.
        self.tasks.flush();
        self.tx_out.flush();
        let stalled = matches!(self.status, SchedStatus::Stalled { .. });
        let report = self.stats.report(self.frames_retired, stalled);
        info!(
            target: "sched",
            frames = report.frames_retired,
            stalled = report.stalled,
            avg_frame_us = report.avg_frame.as_micros() as u64,
            max_frame_us = report.max_frame.as_micros() as u64,
            "master_loop_stopped"
        );
        Ok(report)
    }

    fn pop_streamer_event(&mut self) -> Option<Event> {
        let bucket = self.rx_cursor.bucket();
        if let Some(ev) = self.fabric.pop_rx(bucket) {
            self.rx_cursor.record_hit();
            return Some(ev);
        }
        if let Some(ev) = self.fabric.pop_rx(bucket ^ 1) {
            self.rx_cursor.follow(ev.frame_id());
            return Some(ev);
        }
        self.rx_cursor.record_empty();
        None
    }

    fn pop_completion_event(&mut self) -> Option<Event> {
        let bucket = self.comp_cursor.bucket();
        if let Some(ev) = self.fabric.pop_completion(bucket) {
            self.comp_cursor.record_hit();
            return Some(ev);
        }
        if let Some(ev) = self.fabric.pop_completion(bucket ^ 1) {
            self.comp_cursor.follow(ev.frame_id());
            return Some(ev);
        }
        self.comp_cursor.record_empty();
        None
    }

    // ---- Frame window --------------------------------------------------

    pub(crate) fn preassert_flags(&self) -> FrameFlags {
        let mut flags = FrameFlags::empty();
        if self.cfg.schedule().uplink_symbols().is_empty() {
            flags |= FrameFlags::UL_SCHED_DONE | FrameFlags::UL_PROC_DONE;
        }
        if self.cfg.schedule().downlink_symbols().is_empty() {
            flags |= FrameFlags::DL_SCHED_DONE | FrameFlags::DL_PROC_DONE;
        }
        flags
    }

    pub(crate) fn fatal_stall(&mut self, frame_id: u32) {
        if matches!(self.status, SchedStatus::Stalled { .. }) {
            return;
        }
        error!(
            target: "sched",
            frame_id,
            cur_sched = self.cur_sched_frame,
            cur_proc = self.cur_proc_frame,
            window = self.cfg.window(),
            "pipeline stall: rx beyond frame window, shutting down"
        );
        self.status = SchedStatus::Stalled { frame_id };
        self.run.stop();
    }

    pub(crate) fn stopped(&self) -> bool {
        !matches!(self.status, SchedStatus::Running)
    }

    /// Mark scheduling progress flags and move the schedule cursor over
    /// fully-scheduled frames, capped by the window.
    pub(crate) fn try_advance_sched(&mut self) {
        if self.cur_sched_frame < self.cur_proc_frame {
            self.cur_sched_frame = self.cur_proc_frame;
        }
        let window = self.cfg.window() as u32;
        loop {
            let frame = self.cur_sched_frame;
            if frame + 1 >= self.cur_proc_frame + window {
                break;
            }
            if !(self.frames.is_live(frame) && self.frames.flags(frame).sched_done()) {
                break;
            }
            self.cur_sched_frame += 1;
            debug!(target: "sched.window", cur_sched = self.cur_sched_frame, "sched_cursor_advance");
        }
    }

    /// Retirement predicate: retire consecutively finished frames starting
    /// at the process cursor. A no-op when the oldest frame is unfinished
    /// or already retired.
    pub fn advance_proc(&mut self) {
        while self.frames.is_live(self.cur_proc_frame)
            && self.frames.flags(self.cur_proc_frame).proc_done()
        {
            let frame = self.cur_proc_frame;
            self.retire_frame(frame);
            if self.stopped() {
                break;
            }
        }
    }

    fn retire_frame(&mut self, frame_id: u32) {
        let now = Instant::now();
        self.counters.reset(frame_id);
        let slot = frame_id as usize % self.cfg.window();
        let stride = self.cfg.schedule().frame_len();
        self.demul_requested[slot * stride..(slot + 1) * stride].fill(false);
        self.precode_requested[slot * stride..(slot + 1) * stride].fill(false);
        self.dl_requested[slot] = false;

        let timings = self.frames.retire(frame_id, now);
        self.stats.record(&timings);
        self.last_retired = Some(timings);
        self.frames_retired += 1;
        self.cur_proc_frame = frame_id + 1;
        debug!(
            target: "sched.window",
            frame_id,
            cur_proc = self.cur_proc_frame,
            retired = self.frames_retired,
            "frame_retired"
        );

        self.try_advance_sched();
        self.release_deferred();

        if self.frames_retired >= self.cfg.frames_to_test() {
            info!(target: "sched", frames = self.frames_retired, "frames_to_test reached");
            self.status = SchedStatus::Finished;
            self.run.stop();
        }
    }

    // ---- Downlink deferral ---------------------------------------------

    /// Ask for this frame's downlink encode to be scheduled, deferring when
    /// the frame runs ahead of the scheduling horizon or behind an already
    /// deferred frame.
    pub(crate) fn request_downlink(&mut self, frame_id: u32) {
        let slot = frame_id as usize % self.cfg.window();
        if self.dl_requested[slot] || self.deferred.contains(&frame_id) {
            return;
        }
        let beyond_horizon = frame_id >= self.cur_sched_frame + SCHEDULE_QUEUES;
        if beyond_horizon || !self.deferred.is_empty() {
            if self.deferred.len() >= self.cfg.window() {
                // Clamped at capacity; repeated overflow means a frame is
                // stuck and the run cannot recover.
                self.deferral_overflow += 1;
                core_events::DEFERRAL_PUSHES.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                if self.deferral_overflow >= DEFERRAL_OVERFLOW_FATAL {
                    self.fatal_stall(frame_id);
                }
                return;
            }
            core_events::DEFERRAL_PUSHES.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            self.deferred.push_back(frame_id);
            debug!(target: "sched.defer", frame_id, depth = self.deferred.len(), "downlink_deferred");
        } else {
            self.schedule_encode(frame_id);
        }
    }

    /// Release at most one deferred frame, FIFO, if it is now within the
    /// scheduling horizon. Called once per retirement.
    fn release_deferred(&mut self) {
        if let Some(&head) = self.deferred.front()
            && head < self.cur_sched_frame + SCHEDULE_QUEUES
        {
            self.deferred.pop_front();
            debug!(target: "sched.defer", frame_id = head, "downlink_released");
            self.schedule_encode(head);
        }
    }

    fn debug_check_window(&self) {
        debug_assert!(
            self.cur_proc_frame <= self.cur_sched_frame
                && self.cur_sched_frame < self.cur_proc_frame + self.cfg.window() as u32,
            "window invariant broken: proc {} sched {} window {}",
            self.cur_proc_frame,
            self.cur_sched_frame,
            self.cfg.window()
        );
    }
}
