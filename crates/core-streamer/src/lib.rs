//! Radio boundary adapter.
//!
//! The streamer sits between the radio/network I/O threads and the core:
//! its RX side writes antenna samples into the pool's socket buffers and
//! emits `PacketRx` events through per-thread producer tokens; its TX side
//! drains `PacketTx` events, reads the TX antenna buffers and reports each
//! transmitted symbol back to the master on the streamer lane.
//!
//! RX packets for the same (frame, symbol) may arrive on any streamer
//! thread in any antenna order; each thread owns its token so out-of-order
//! interleaving across threads never contends.
//!
//! [`LoopbackStreamer`] is the in-process implementation used when no radio
//! is attached: it synthesizes wire packets for a configured number of
//! frames (exercising the real packet codec), paced at the nominal symbol
//! period, and drains TX events as an ideal sink.

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use tracing::{debug, info, trace};

use core_buffers::BufferPool;
use core_config::Config;
use core_events::{Event, EventKind, RunFlag, Tag};
use core_fabric::{FabricHandle, Lane, LaneToken, PARITY_BUCKETS};
use core_worker::platform;

pub mod wire;
pub use wire::{HEADER_BYTES, PacketHeader, WireError, decode_packet_into, encode_packet, packet_len};

/// Boundary contract between the core and any radio frontend.
pub trait Streamer {
    /// Arm hardware and start the I/O threads. RX events begin flowing
    /// once this returns.
    fn start_tx_rx(&mut self) -> Result<()>;
    /// Stop and join the I/O threads. Idempotent.
    fn stop(&mut self);
}

/// Synthesized-traffic streamer: M threads, antennas striped across them.
pub struct LoopbackStreamer {
    cfg: Arc<Config>,
    pool: Arc<BufferPool>,
    fabric: FabricHandle,
    run: RunFlag,
    frames: u64,
    handles: Vec<JoinHandle<()>>,
}

impl LoopbackStreamer {
    pub fn new(
        cfg: Arc<Config>,
        pool: Arc<BufferPool>,
        fabric: FabricHandle,
        run: RunFlag,
        frames: u64,
    ) -> Self {
        Self {
            cfg,
            pool,
            fabric,
            run,
            frames,
            handles: Vec::new(),
        }
    }

    /// Deterministic I/Q pattern for one packet.
    fn synthesize(frame_id: u32, symbol_id: u16, ant_id: u32, iq: &mut [i16]) {
        let seed = frame_id
            .wrapping_mul(31)
            .wrapping_add(u32::from(symbol_id).wrapping_mul(7))
            .wrapping_add(ant_id.wrapping_mul(3));
        for (i, s) in iq.iter_mut().enumerate() {
            *s = ((seed as usize + i) % 251) as i16 - 125;
        }
    }
}

impl Streamer for LoopbackStreamer {
    fn start_tx_rx(&mut self) -> Result<()> {
        let threads = self.cfg.socket_thread_num();
        let first_core = self.cfg.core_offset() + 1 + self.cfg.worker_thread_num();
        info!(
            target: "streamer",
            threads,
            frames = self.frames,
            "loopback_start"
        );
        for tid in 0..threads {
            let cfg = self.cfg.clone();
            let pool = self.pool.clone();
            let run = self.run.clone();
            let mut events = LaneToken::new(self.fabric.clone(), Lane::Rx);
            let fabric = self.fabric.clone();
            let frames = self.frames;
            let core = first_core + tid;
            let handle = std::thread::Builder::new()
                .name(format!("streamer-{tid}"))
                .spawn(move || {
                    platform::pin_or_warn(core, "streamer");
                    run_loopback_thread(
                        &cfg, &pool, &fabric, &run, &mut events, tid, threads, frames,
                    );
                })
                .with_context(|| format!("spawn streamer-{tid}"))?;
            self.handles.push(handle);
        }
        Ok(())
    }

    fn stop(&mut self) {
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
        debug!(target: "streamer", "loopback_stopped");
    }
}

#[allow(clippy::too_many_arguments)]
fn run_loopback_thread(
    cfg: &Config,
    pool: &BufferPool,
    fabric: &FabricHandle,
    run: &RunFlag,
    events: &mut LaneToken,
    tid: usize,
    threads: usize,
    frames: u64,
) {
    let samps = cfg.samps_per_symbol();
    let mut packet = vec![0u8; packet_len(samps)];
    let mut iq = vec![0i16; samps * 2];
    let period = cfg.symbol_period();
    let my_ants: Vec<u32> = (0..cfg.bs_ant_num() as u32)
        .filter(|a| *a as usize % threads == tid)
        .collect();

    'frames: for frame_id in 0..frames as u32 {
        for &symbol_id in cfg
            .schedule()
            .pilot_symbols()
            .iter()
            .chain(cfg.schedule().uplink_symbols())
        {
            if !run.is_running() {
                break 'frames;
            }
            for &ant_id in &my_ants {
                deliver_rx(cfg, pool, events, &mut packet, &mut iq, frame_id, symbol_id, ant_id);
            }
            drain_tx(cfg, pool, fabric, events);
            events.flush();
            std::thread::sleep(period);
        }
    }
    // Keep servicing TX until shutdown so tail frames drain.
    while run.is_running() {
        drain_tx(cfg, pool, fabric, events);
        events.flush();
        std::thread::sleep(period);
    }
    events.flush();
    debug!(target: "streamer", tid, "rx_generator_done");
}

#[allow(clippy::too_many_arguments)]
fn deliver_rx(
    cfg: &Config,
    pool: &BufferPool,
    events: &mut LaneToken,
    packet: &mut [u8],
    iq: &mut [i16],
    frame_id: u32,
    symbol_id: u16,
    ant_id: u32,
) {
    // Synthesize the wire packet, then take the same parse-and-copy path a
    // radio-facing receiver takes.
    LoopbackStreamer::synthesize(frame_id, symbol_id, ant_id, iq);
    let header = PacketHeader {
        frame_id,
        symbol_id: u32::from(symbol_id),
        cell_id: 0,
        ant_id,
    };
    encode_packet(&header, iq, packet).expect("sized at startup");

    let slot = frame_id as usize % cfg.window();
    // SAFETY: the streamer is the sole writer of the RX row for
    // (frame, symbol, antenna); the master schedules no reader until this
    // packet's event is processed.
    let row = unsafe { pool.rx().row_mut(slot, symbol_id as usize, ant_id as usize) };
    let parsed = decode_packet_into(packet, row).expect("sized at startup");
    debug_assert_eq!(parsed.frame_id, frame_id);

    events.enqueue(Event::single(
        EventKind::PacketRx,
        Tag::for_antenna(frame_id, symbol_id, ant_id),
    ));
    trace!(target: "streamer", frame_id, symbol_id, ant_id, "rx_packet");
}

/// Drain pending TX events: read the TX buffer (an ideal sink transmits
/// instantly) and report the completion back to the master.
fn drain_tx(cfg: &Config, pool: &BufferPool, fabric: &FabricHandle, events: &mut LaneToken) {
    for bucket in 0..PARITY_BUCKETS {
        while let Some(ev) = fabric.pop_tx(bucket) {
            debug_assert_eq!(ev.kind, EventKind::PacketTx);
            for &tag in &ev.tags {
                let slot = tag.frame_id() as usize % cfg.window();
                let dl_ord = cfg
                    .schedule()
                    .downlink_ordinal(tag.symbol_id())
                    .expect("tx task on a non-downlink symbol");
                let samples = pool.tx().row(slot, dl_ord, tag.inner() as usize);
                trace!(
                    target: "streamer",
                    frame_id = tag.frame_id(),
                    symbol_id = tag.symbol_id(),
                    ant_id = tag.inner(),
                    first = samples.first().copied().unwrap_or(0),
                    "tx_packet"
                );
            }
            events.enqueue(ev);
        }
    }
}
