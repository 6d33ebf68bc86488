//! Per-event-kind handlers and task emitters.
//!
//! The dependency chain each handler enforces, per frame:
//! RX pilots -> FFT -> Beam, then per uplink symbol FFT + Beam -> Demul ->
//! Decode -> MAC, and per downlink symbol (MAC or first RX) -> Encode,
//! Encode + Beam -> Precode -> IFFT -> TX. Terminal closures on both
//! branches retire the frame.
//!
//! Emission order inside a stage is ascending (antenna | subcarrier base |
//! code block); frames are never reordered against each other except
//! through the deferral FIFO.

use std::time::Instant;

use tracing::{debug, trace, warn};

use core_counters::FrameFlags;
use core_events::{Event, EventKind, Tag};
use core_mac::{MacRequest, MacResponse};

use crate::Scheduler;

impl Scheduler {
    pub(crate) fn dispatch(&mut self, ev: Event) {
        if self.stopped() {
            // A stall or finished run emits nothing further; events already
            // in flight are dropped on the floor during shutdown.
            return;
        }
        match ev.kind {
            EventKind::PacketRx => {
                for &tag in &ev.tags {
                    self.handle_packet_rx(tag);
                }
            }
            EventKind::Fft => self.handle_fft_done(&ev),
            EventKind::Beam => self.handle_beam_done(&ev),
            EventKind::Demul => self.handle_demul_done(&ev),
            EventKind::Decode => self.handle_decode_done(&ev),
            EventKind::Encode => self.handle_encode_done(&ev),
            EventKind::Precode => self.handle_precode_done(&ev),
            EventKind::Ifft => self.handle_ifft_done(&ev),
            EventKind::PacketTx => self.handle_tx_done(&ev),
            other => panic!("master received unknown event kind {other:?}"),
        }
    }

    fn guard_index(&self, frame_id: u32, symbol_id: u16) -> usize {
        let stride = self.cfg.schedule().frame_len();
        (frame_id as usize % self.cfg.window()) * stride + symbol_id as usize
    }

    fn emit_task(&mut self, ev: Event) {
        trace!(
            target: "sched.emit",
            kind = %ev.kind,
            frame_id = ev.frame_id(),
            tags = ev.tags.len(),
            "task"
        );
        self.tasks.enqueue(ev);
    }

    // ---- RX / FFT ------------------------------------------------------

    fn handle_packet_rx(&mut self, tag: Tag) {
        if self.stopped() {
            return;
        }
        let frame_id = tag.frame_id();
        let symbol_id = tag.symbol_id();
        let role = self.cfg.schedule().role(symbol_id);
        assert!(role.is_rx(), "rx packet for non-rx symbol {symbol_id}");

        if frame_id >= self.cur_sched_frame() + self.cfg.window() as u32 {
            self.fatal_stall(frame_id);
            return;
        }
        if !self.frames.is_live(frame_id) {
            if self.frames.occupant(frame_id).is_some() {
                // Slot collision with an unfinished predecessor.
                self.fatal_stall(frame_id);
                return;
            }
            let flags = self.preassert_flags();
            self.frames.begin(frame_id, flags, Instant::now());
            debug!(target: "sched", frame_id, "frame_admitted");
            if !self.cfg.schedule().downlink_symbols().is_empty() && !self.cfg.mac_enabled() {
                // Without a MAC the downlink payload is preloaded; encoding
                // starts as soon as the frame exists.
                self.request_downlink(frame_id);
            }
        }

        let symbol_closed = self.counters.rx.complete_task(frame_id, symbol_id);
        self.fft_pending.push(tag);
        self.schedule_fft(frame_id, symbol_id, symbol_closed);
        if symbol_closed {
            let _ = self.counters.rx.complete_symbol(frame_id);
        }
    }

    /// Batch pending RX tags into FFT task events. Full blocks are emitted
    /// eagerly; the remainder flushes when the symbol's last packet lands.
    fn schedule_fft(&mut self, frame_id: u32, symbol_id: u16, flush_remainder: bool) {
        let block = self.cfg.fft_block_size();
        while self.fft_pending.len(frame_id, symbol_id) >= block {
            let tags = self.fft_pending.drain_batch(frame_id, symbol_id, block);
            self.emit_task(Event::batched(EventKind::Fft, tags));
        }
        if flush_remainder && !self.fft_pending.is_empty(frame_id, symbol_id) {
            let tags = self.fft_pending.drain_batch(frame_id, symbol_id, block);
            self.emit_task(Event::batched(EventKind::Fft, tags));
        }
    }

    fn handle_fft_done(&mut self, ev: &Event) {
        for &tag in &ev.tags {
            let frame_id = tag.frame_id();
            let symbol_id = tag.symbol_id();
            if self.cfg.schedule().role(symbol_id).is_pilot_like() {
                let closed = self.counters.pilot_fft.complete_task(frame_id, symbol_id);
                if closed && self.counters.pilot_fft.complete_symbol(frame_id) {
                    self.frames.timings_mut(frame_id).fft_done = Some(Instant::now());
                    self.schedule_beam(frame_id);
                }
            } else {
                let closed = self.counters.ul_fft.complete_task(frame_id, symbol_id);
                if closed && self.counters.beam.frame_done(frame_id) {
                    self.request_demul(frame_id, symbol_id);
                }
            }
        }
    }

    // ---- Beam ----------------------------------------------------------

    fn schedule_beam(&mut self, frame_id: u32) {
        let block = self.cfg.beam_block_size();
        let mut sc_base = 0;
        while sc_base < self.cfg.ofdm_data_num() {
            self.emit_task(Event::single(
                EventKind::Beam,
                Tag::for_subcarrier(frame_id, 0, sc_base as u32),
            ));
            sc_base += block;
        }
    }

    fn handle_beam_done(&mut self, ev: &Event) {
        for &tag in &ev.tags {
            let frame_id = tag.frame_id();
            let closed = self.counters.beam.complete_task(frame_id, 0);
            if !(closed && self.counters.beam.complete_symbol(frame_id)) {
                continue;
            }
            self.frames.timings_mut(frame_id).beam_done = Some(Instant::now());
            debug!(target: "sched", frame_id, "beam_complete");

            // Uplink symbols whose FFT already closed go first; downlink
            // symbols whose encode already closed follow.
            let uplinks = self.cfg.schedule().uplink_symbols().to_vec();
            for symbol_id in uplinks {
                if self.counters.ul_fft.symbol_done(frame_id, symbol_id) {
                    self.request_demul(frame_id, symbol_id);
                }
            }
            let downlinks = self.cfg.schedule().downlink_symbols().to_vec();
            for symbol_id in downlinks {
                if self.counters.encode.symbol_done(frame_id, symbol_id) {
                    self.request_precode(frame_id, symbol_id);
                }
            }
            self.send_snr_reports(frame_id);
        }
    }

    // ---- Uplink: Demul / Decode / MAC delivery -------------------------

    fn request_demul(&mut self, frame_id: u32, symbol_id: u16) {
        let idx = self.guard_index(frame_id, symbol_id);
        if self.demul_requested[idx] {
            return;
        }
        self.demul_requested[idx] = true;

        let block = self.cfg.demul_block_size();
        let mut sc_base = 0;
        while sc_base < self.cfg.ofdm_data_num() {
            self.emit_task(Event::single(
                EventKind::Demul,
                Tag::for_subcarrier(frame_id, symbol_id, sc_base as u32),
            ));
            sc_base += block;
        }

        let all_requested = self
            .cfg
            .schedule()
            .uplink_symbols()
            .iter()
            .all(|&s| self.demul_requested[self.guard_index(frame_id, s)]);
        if all_requested {
            self.frames.set_flags(frame_id, FrameFlags::UL_SCHED_DONE);
            self.try_advance_sched();
        }
    }

    fn handle_demul_done(&mut self, ev: &Event) {
        for &tag in &ev.tags {
            let frame_id = tag.frame_id();
            let symbol_id = tag.symbol_id();
            let closed = self.counters.demul.complete_task(frame_id, symbol_id);
            if !closed {
                continue;
            }
            let frame_demul_done = self.counters.demul.complete_symbol(frame_id);
            if self.cfg.hard_demod() {
                // Hard demod skips decode: the demapped bits are the
                // uplink terminal product.
                self.deliver_uplink_payload(frame_id, symbol_id);
                if frame_demul_done {
                    self.uplink_complete(frame_id);
                }
            } else {
                self.schedule_decode(frame_id, symbol_id);
            }
        }
    }

    fn schedule_decode(&mut self, frame_id: u32, symbol_id: u16) {
        self.schedule_code_blocks(EventKind::Decode, frame_id, symbol_id);
    }

    /// Emit encode/decode tasks for every code block of a symbol, batched
    /// by `encode_block_size`, in ascending block order.
    fn schedule_code_blocks(&mut self, kind: EventKind, frame_id: u32, symbol_id: u16) {
        let total = self.cfg.code_blocks_per_symbol();
        let block = self.cfg.encode_block_size();
        let mut cb = 0;
        while cb < total {
            let end = (cb + block).min(total);
            let tags = (cb..end).map(|b| Tag::for_code_block(frame_id, symbol_id, b as u32));
            self.emit_task(Event::batched(kind, tags));
            cb = end;
        }
    }

    fn handle_decode_done(&mut self, ev: &Event) {
        for &tag in &ev.tags {
            let frame_id = tag.frame_id();
            let symbol_id = tag.symbol_id();
            let closed = self.counters.decode.complete_task(frame_id, symbol_id);
            if !closed {
                continue;
            }
            self.deliver_uplink_payload(frame_id, symbol_id);
            if self.counters.decode.complete_symbol(frame_id) {
                self.uplink_complete(frame_id);
            }
        }
    }

    fn deliver_uplink_payload(&mut self, frame_id: u32, symbol_id: u16) {
        if self.mac.is_none() {
            return;
        }
        let slot = frame_id as usize % self.cfg.window();
        let ul_ord = self
            .cfg
            .schedule()
            .uplink_ordinal(symbol_id)
            .expect("uplink payload for a non-uplink symbol");
        let payload_len = self.cfg.code_blocks_per_ue() * self.cfg.data_bytes_per_code_block();
        for ue in 0..self.cfg.ue_num() {
            let bytes: Vec<u8> = if self.cfg.hard_demod() {
                self.pool
                    .llr()
                    .row(slot, ul_ord, ue)
                    .iter()
                    .take(payload_len)
                    .map(|&v| v as u8)
                    .collect()
            } else {
                self.pool.decoded().row(slot, ul_ord, ue).to_vec()
            };
            let sent = self.mac.as_ref().is_some_and(|mac| {
                mac.try_send(MacRequest::PacketToMac {
                    frame_id,
                    symbol_id,
                    ue_id: ue as u32,
                    bytes,
                })
            });
            if !sent {
                // Non-fatal: surfaces as a per-frame stall / deferral.
                warn!(target: "sched.mac", frame_id, symbol_id, ue, "mac request queue full");
                break;
            }
        }
    }

    fn uplink_complete(&mut self, frame_id: u32) {
        self.frames.timings_mut(frame_id).decode_done = Some(Instant::now());
        self.frames.set_flags(frame_id, FrameFlags::UL_PROC_DONE);
        debug!(target: "sched", frame_id, "uplink_complete");
        self.advance_proc();
    }

    // ---- Downlink: Encode / Precode / IFFT / TX ------------------------

    /// Emit encode tasks for every downlink symbol of the frame. Reached
    /// through `request_downlink`, never directly.
    pub(crate) fn schedule_encode(&mut self, frame_id: u32) {
        let slot = frame_id as usize % self.cfg.window();
        if self.dl_requested[slot] {
            return;
        }
        self.dl_requested[slot] = true;
        debug!(target: "sched", frame_id, "downlink_encode_scheduled");
        let downlinks = self.cfg.schedule().downlink_symbols().to_vec();
        for symbol_id in downlinks {
            self.schedule_code_blocks(EventKind::Encode, frame_id, symbol_id);
        }
    }

    fn handle_encode_done(&mut self, ev: &Event) {
        for &tag in &ev.tags {
            let frame_id = tag.frame_id();
            let symbol_id = tag.symbol_id();
            let closed = self.counters.encode.complete_task(frame_id, symbol_id);
            if !closed {
                continue;
            }
            let _ = self.counters.encode.complete_symbol(frame_id);
            if self.counters.beam.frame_done(frame_id) {
                self.request_precode(frame_id, symbol_id);
            }
            // Otherwise the beam closure handler picks this symbol up.
        }
    }

    fn request_precode(&mut self, frame_id: u32, symbol_id: u16) {
        let idx = self.guard_index(frame_id, symbol_id);
        if self.precode_requested[idx] {
            return;
        }
        self.precode_requested[idx] = true;

        let block = self.cfg.demul_block_size();
        let mut sc_base = 0;
        while sc_base < self.cfg.ofdm_data_num() {
            self.emit_task(Event::single(
                EventKind::Precode,
                Tag::for_subcarrier(frame_id, symbol_id, sc_base as u32),
            ));
            sc_base += block;
        }

        let all_requested = self
            .cfg
            .schedule()
            .downlink_symbols()
            .iter()
            .all(|&s| self.precode_requested[self.guard_index(frame_id, s)]);
        if all_requested {
            self.frames.set_flags(frame_id, FrameFlags::DL_SCHED_DONE);
            self.try_advance_sched();
        }
    }

    fn handle_precode_done(&mut self, ev: &Event) {
        for &tag in &ev.tags {
            let frame_id = tag.frame_id();
            let symbol_id = tag.symbol_id();
            let closed = self.counters.precode.complete_task(frame_id, symbol_id);
            if !closed {
                continue;
            }
            let _ = self.counters.precode.complete_symbol(frame_id);
            for ant in 0..self.cfg.bs_ant_num() {
                self.emit_task(Event::single(
                    EventKind::Ifft,
                    Tag::for_antenna(frame_id, symbol_id, ant as u32),
                ));
            }
        }
    }

    fn handle_ifft_done(&mut self, ev: &Event) {
        for &tag in &ev.tags {
            let frame_id = tag.frame_id();
            let symbol_id = tag.symbol_id();
            let closed = self.counters.ifft.complete_task(frame_id, symbol_id);
            if !closed {
                continue;
            }
            let _ = self.counters.ifft.complete_symbol(frame_id);
            self.schedule_tx(frame_id, symbol_id);
        }
    }

    fn schedule_tx(&mut self, frame_id: u32, symbol_id: u16) {
        let timings = self.frames.timings_mut(frame_id);
        if timings.tx_first.is_none() {
            timings.tx_first = Some(Instant::now());
        }
        for ant in 0..self.cfg.bs_ant_num() {
            self.tx_out.enqueue(Event::single(
                EventKind::PacketTx,
                Tag::for_antenna(frame_id, symbol_id, ant as u32),
            ));
        }
        trace!(target: "sched.emit", frame_id, symbol_id, "tx_symbol");
    }

    fn handle_tx_done(&mut self, ev: &Event) {
        for &tag in &ev.tags {
            let frame_id = tag.frame_id();
            let symbol_id = tag.symbol_id();
            let closed = self.counters.tx.complete_task(frame_id, symbol_id);
            if closed && self.counters.tx.complete_symbol(frame_id) {
                self.frames.timings_mut(frame_id).tx_done = Some(Instant::now());
                self.frames.set_flags(frame_id, FrameFlags::DL_PROC_DONE);
                debug!(target: "sched", frame_id, "downlink_complete");
                self.advance_proc();
            }
        }
    }

    // ---- MAC responses -------------------------------------------------

    pub(crate) fn poll_mac(&mut self) -> bool {
        let mut did = false;
        loop {
            let Some(resp) = self.mac.as_ref().and_then(|mac| mac.try_recv()) else {
                break;
            };
            did = true;
            match resp {
                MacResponse::PacketFromMac { frame_id } => self.handle_from_mac(frame_id),
                MacResponse::RanUpdate { ue_id, mcs_index } => {
                    if let Some(mcs) = self.ue_mcs.get_mut(ue_id as usize) {
                        *mcs = mcs_index;
                        debug!(target: "sched.mac", ue_id, mcs_index, "ran_update");
                    } else {
                        warn!(target: "sched.mac", ue_id, "ran update for unknown ue");
                    }
                }
            }
        }
        did
    }

    fn handle_from_mac(&mut self, frame_id: u32) {
        if self.stopped() {
            return;
        }
        if !self.frames.is_live(frame_id) {
            // The MAC answered after the frame left the window.
            warn!(target: "sched.mac", frame_id, "downlink payload for a non-live frame");
            return;
        }
        self.request_downlink(frame_id);
    }

    fn send_snr_reports(&mut self, frame_id: u32) {
        if self.mac.is_none() {
            return;
        }
        let slot = frame_id as usize % self.cfg.window();
        for ue in 0..self.cfg.ue_num() {
            // Beam closed, so the CSI rows are stable; antenna 0 is a
            // representative sample.
            let row = self.pool.csi().row(slot, ue, 0);
            let energy: f32 = row.iter().map(|v| v * v).sum::<f32>() / row.len().max(1) as f32;
            let snr_db = 10.0 * (energy + 1e-12).log10();
            let _ = self.mac.as_ref().is_some_and(|mac| {
                mac.try_send(MacRequest::SnrReport {
                    frame_id,
                    ue_id: ue as u32,
                    snr_db,
                })
            });
        }
    }
}
