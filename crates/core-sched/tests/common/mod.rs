//! Shared test rig: a scheduler wired to a real fabric, with the streamer
//! and (optionally) the workers emulated by the test.
//!
//! Two servicing modes:
//! - inline: `worker_thread_num = 0`, the scheduler's inline worker runs the
//!   real kernels; the rig only emulates the streamer TX side.
//! - manual: `worker_thread_num = 1` but no pool is spawned; the test pops
//!   task events itself and echoes completions, which lets scenarios
//!   withhold, reorder or inspect individual tasks.
#![allow(dead_code)] // each test binary uses a different slice of the rig

use std::sync::Arc;

use core_buffers::BufferPool;
use core_config::{Config, ConfigFile};
use core_events::{DoerKind, Event, EventKind, RunFlag, Tag};
use core_fabric::{Lane, LaneToken, PARITY_BUCKETS, TaskFabric, bucket_of};
use core_mac::CoreMac;
use core_sched::Scheduler;

pub struct Rig {
    pub cfg: Arc<Config>,
    pub pool: Arc<BufferPool>,
    pub fabric: Arc<TaskFabric>,
    pub run: RunFlag,
    pub sched: Scheduler,
    /// Every task observed by manual servicing, in pop order.
    pub task_log: Vec<(EventKind, u32)>,
    rx_in: LaneToken,
    comp_in: LaneToken,
}

pub fn base_file() -> ConfigFile {
    let mut f = ConfigFile::default();
    f.bs_ant_num = 4;
    f.ue_ant_num = 2;
    f.fft_size = 64;
    f.ofdm_data_num = 48;
    f.cp_size = 8;
    f.sample_rate = 1_000_000.0;
    f.fft_block_size = 2;
    f.beam_block_size = 16;
    f.demul_block_size = 16;
    f.encode_block_size = 2;
    f.data_bytes_per_code_block = 8;
    f.frame_schedule = "PUD".into();
    f.frames_to_test = 100;
    f.worker_thread_num = 0;
    f
}

impl Rig {
    pub fn new(file: ConfigFile, mac: Option<CoreMac>) -> Self {
        let cfg = Arc::new(Config::from_parts(file).expect("test config"));
        let pool = Arc::new(BufferPool::new(&cfg));
        pool.preload_downlink(&cfg);
        let fabric = Arc::new(TaskFabric::new(cfg.fabric_capacity()));
        let run = RunFlag::new();
        let sched = Scheduler::new(cfg.clone(), pool.clone(), fabric.clone(), mac, run.clone());
        let rx_in = LaneToken::new(fabric.clone(), Lane::Rx);
        let comp_in = LaneToken::new(fabric.clone(), Lane::Completion);
        Self {
            cfg,
            pool,
            fabric,
            run,
            sched,
            task_log: Vec::new(),
            rx_in,
            comp_in,
        }
    }

    pub fn inject_rx(&mut self, frame_id: u32, symbol_id: u16, ant_id: u32) {
        let slot = frame_id as usize % self.cfg.window();
        // SAFETY: the test plays the streamer role, the sole writer of this
        // RX row before the packet event is dispatched.
        let row = unsafe {
            self.pool
                .rx()
                .row_mut(slot, symbol_id as usize, ant_id as usize)
        };
        for (i, s) in row.iter_mut().enumerate() {
            *s = ((frame_id as usize + symbol_id as usize * 3 + ant_id as usize * 7 + i) % 101)
                as i16
                - 50;
        }
        self.rx_in.enqueue(Event::single(
            EventKind::PacketRx,
            Tag::for_antenna(frame_id, symbol_id, ant_id),
        ));
        self.rx_in.flush();
    }

    /// Inject every RX packet of a frame (pilot-like then uplink symbols,
    /// antennas ascending).
    pub fn inject_frame_rx(&mut self, frame_id: u32) {
        let symbols: Vec<u16> = self
            .cfg
            .schedule()
            .pilot_symbols()
            .iter()
            .chain(self.cfg.schedule().uplink_symbols())
            .copied()
            .collect();
        for symbol_id in symbols {
            for ant_id in 0..self.cfg.bs_ant_num() as u32 {
                self.inject_rx(frame_id, symbol_id, ant_id);
            }
        }
    }

    /// Emulate the streamer TX side: every transmitted symbol is acked back
    /// on the streamer lane.
    pub fn service_tx(&mut self) -> bool {
        let mut did = false;
        for bucket in 0..PARITY_BUCKETS {
            while let Some(ev) = self.fabric.pop_tx(bucket) {
                assert_eq!(bucket_of(ev.frame_id()), bucket, "tx event on wrong bucket");
                self.rx_in.enqueue(ev);
                did = true;
            }
        }
        self.rx_in.flush();
        did
    }

    /// Manual worker emulation: pop every queued task, withholding those the
    /// predicate selects, echoing completions for the rest.
    pub fn service_tasks(
        &mut self,
        withhold: &mut impl FnMut(&Event) -> bool,
        withheld: &mut Vec<Event>,
    ) -> bool {
        let mut did = false;
        for bucket in 0..PARITY_BUCKETS {
            for doer in DoerKind::POLL_ORDER {
                while let Some(ev) = self.fabric.pop_task(bucket, doer) {
                    assert_eq!(
                        bucket_of(ev.frame_id()),
                        bucket,
                        "task for frame {} on bucket {bucket}",
                        ev.frame_id()
                    );
                    self.task_log.push((ev.kind, ev.frame_id()));
                    did = true;
                    if withhold(&ev) {
                        withheld.push(ev);
                    } else {
                        self.comp_in.enqueue(ev.completion());
                    }
                }
            }
        }
        self.comp_in.flush();
        did
    }

    /// Deliver a previously withheld task's completion.
    pub fn deliver(&mut self, ev: Event) {
        self.comp_in.enqueue(ev.completion());
        self.comp_in.flush();
    }

    /// Pop queued TX events without acking them (for reordering tests).
    pub fn pop_tx_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        for bucket in 0..PARITY_BUCKETS {
            while let Some(ev) = self.fabric.pop_tx(bucket) {
                assert_eq!(bucket_of(ev.frame_id()), bucket, "tx event on wrong bucket");
                out.push(ev);
            }
        }
        out
    }

    /// Ack one transmitted symbol back to the master.
    pub fn ack_tx(&mut self, ev: Event) {
        self.rx_in.enqueue(ev);
        self.rx_in.flush();
    }

    pub fn check_window(&self) {
        let proc = self.sched.cur_proc_frame();
        let sched = self.sched.cur_sched_frame();
        assert!(
            proc <= sched && sched < proc + self.cfg.window() as u32,
            "window invariant: proc {proc} sched {sched}"
        );
    }

    /// Inline mode: tick until idle.
    pub fn pump(&mut self) {
        let mut idle = 0;
        let mut guard = 0u32;
        while idle < 8 {
            let mut did = self.sched.tick();
            if self.service_tx() {
                did = true;
            }
            self.check_window();
            if did {
                idle = 0;
            } else {
                idle += 1;
            }
            guard += 1;
            assert!(guard < 1_000_000, "rig did not go idle");
        }
    }

    /// Manual mode: tick + service until idle.
    pub fn pump_manual(
        &mut self,
        withhold: &mut impl FnMut(&Event) -> bool,
        withheld: &mut Vec<Event>,
    ) {
        let mut idle = 0;
        let mut guard = 0u32;
        while idle < 8 {
            let mut did = self.sched.tick();
            if self.service_tasks(withhold, withheld) {
                did = true;
            }
            if self.service_tx() {
                did = true;
            }
            self.check_window();
            if did {
                idle = 0;
            } else {
                idle += 1;
            }
            guard += 1;
            assert!(guard < 1_000_000, "rig did not go idle");
        }
    }
}
