//! Compute kernels (doers).
//!
//! Each doer takes a task event, touches exactly the buffer spans its stage
//! owns, and returns the mirrored completion event. The numerical DSP inside
//! each kernel is a placeholder honoring the real kernels' input/output
//! contract (shapes, element types, stage ordering); swapping in production
//! FFT/LDPC/beamforming math changes nothing outside this module.
//!
//! Buffer writes go through `unsafe` span accessors. The scheduler guarantees
//! each task is the unique live writer of the spans it touches; every unsafe
//! block below states which span that is.

use std::sync::Arc;

use core_buffers::BufferPool;
use core_config::Config;
use core_events::{DoerKind, Event, Tag};

/// Shared read-only context cloned into every doer.
#[derive(Clone)]
pub struct DoerContext {
    pub cfg: Arc<Config>,
    pub pool: Arc<BufferPool>,
}

impl DoerContext {
    fn slot(&self, frame_id: u32) -> usize {
        frame_id as usize % self.cfg.window()
    }
}

pub trait Doer: Send {
    fn kind(&self) -> DoerKind;
    /// Execute one task; the returned completion mirrors the task tags.
    fn run(&mut self, task: &Event) -> Event;
}

/// Instantiate every kernel in worker poll order.
pub fn all_doers(ctx: &DoerContext) -> Vec<Box<dyn Doer>> {
    DoerKind::POLL_ORDER
        .iter()
        .map(|kind| -> Box<dyn Doer> {
            match kind {
                DoerKind::Beam => Box::new(BeamDoer { ctx: ctx.clone() }),
                DoerKind::Fft => Box::new(FftDoer { ctx: ctx.clone() }),
                DoerKind::Decode => Box::new(DecodeDoer { ctx: ctx.clone() }),
                DoerKind::Demul => Box::new(DemulDoer { ctx: ctx.clone() }),
                DoerKind::Ifft => Box::new(IfftDoer { ctx: ctx.clone() }),
                DoerKind::Precode => Box::new(PrecodeDoer { ctx: ctx.clone() }),
                DoerKind::Encode => Box::new(EncodeDoer { ctx: ctx.clone() }),
            }
        })
        .collect()
}

/// Time samples -> frequency-domain subcarriers; pilots additionally land in
/// the CSI estimate.
pub struct FftDoer {
    ctx: DoerContext,
}

impl FftDoer {
    fn transform(&self, tag: Tag) {
        let cfg = &self.ctx.cfg;
        let slot = self.ctx.slot(tag.frame_id());
        let symbol = tag.symbol_id();
        let ant = tag.inner() as usize;
        let cp2 = cfg.cp_size() * 2;
        let sc2 = cfg.ofdm_data_num() * 2;

        let rx = self.ctx.pool.rx().row(slot, symbol as usize, ant);
        // SAFETY: the FFT task for (frame, symbol, ant) is the sole writer
        // of this freq row while the FFT counter is open.
        let freq = unsafe { self.ctx.pool.freq().row_mut(slot, symbol as usize, ant) };
        for k in 0..sc2 {
            let src = rx[(cp2 + k) % rx.len()];
            freq[k] = f32::from(src) / 32768.0;
        }

        if let Some(pilot_ord) = cfg.schedule().pilot_ordinal(symbol) {
            let ue = pilot_ord % cfg.ue_num();
            // SAFETY: pilot (symbol, ant) maps to exactly one (ue, ant) CSI
            // row; no other task writes it this frame.
            let csi = unsafe { self.ctx.pool.csi().row_mut(slot, ue, ant) };
            csi.copy_from_slice(freq);
        }
    }
}

impl Doer for FftDoer {
    fn kind(&self) -> DoerKind {
        DoerKind::Fft
    }

    fn run(&mut self, task: &Event) -> Event {
        for &tag in &task.tags {
            self.transform(tag);
        }
        task.completion()
    }
}

/// Channel estimates -> per-subcarrier combining weights.
pub struct BeamDoer {
    ctx: DoerContext,
}

impl Doer for BeamDoer {
    fn kind(&self) -> DoerKind {
        DoerKind::Beam
    }

    fn run(&mut self, task: &Event) -> Event {
        let cfg = &self.ctx.cfg;
        let tag = task.tag();
        let slot = self.ctx.slot(tag.frame_id());
        let sc_base = tag.inner() as usize;
        let sc_end = (sc_base + cfg.beam_block_size()).min(cfg.ofdm_data_num());
        let ants = cfg.bs_ant_num();
        let ues = cfg.ue_num();

        for sc in sc_base..sc_end {
            // SAFETY: beam tasks partition subcarriers; this task owns rows
            // [sc_base, sc_end).
            let w = unsafe { self.ctx.pool.beam().row_mut(slot, 0, sc) };
            for ue in 0..ues {
                let mut energy = 1e-6f32;
                for ant in 0..ants {
                    let h = self.ctx.pool.csi().span(slot, ue, ant, sc * 2, 2);
                    energy += h[0] * h[0] + h[1] * h[1];
                }
                for ant in 0..ants {
                    let h = self.ctx.pool.csi().span(slot, ue, ant, sc * 2, 2);
                    let at = (ue * ants + ant) * 2;
                    // Matched filter: conj(h) / ||h||^2.
                    w[at] = h[0] / energy;
                    w[at + 1] = -h[1] / energy;
                }
            }
        }
        task.completion()
    }
}

/// Equalize one subcarrier block of an uplink symbol and demap to LLRs.
pub struct DemulDoer {
    ctx: DoerContext,
}

impl Doer for DemulDoer {
    fn kind(&self) -> DoerKind {
        DoerKind::Demul
    }

    fn run(&mut self, task: &Event) -> Event {
        let cfg = &self.ctx.cfg;
        let tag = task.tag();
        let slot = self.ctx.slot(tag.frame_id());
        let symbol = tag.symbol_id();
        let ul_ord = cfg
            .schedule()
            .uplink_ordinal(symbol)
            .expect("demul task on a non-uplink symbol");
        let sc_base = tag.inner() as usize;
        let sc_len = cfg.demul_block_size().min(cfg.ofdm_data_num() - sc_base);
        let ants = cfg.bs_ant_num();
        let ues = cfg.ue_num();

        // SAFETY: demul tasks partition the symbol's subcarriers; this task
        // owns the equalized span [sc_base, sc_base + sc_len) and the same
        // subcarrier span of each user's LLR row.
        let equal = unsafe {
            self.ctx
                .pool
                .equal()
                .span_mut(slot, ul_ord, 0, sc_base * ues * 2, sc_len * ues * 2)
        };
        for i in 0..sc_len {
            let sc = sc_base + i;
            for ue in 0..ues {
                let mut re = 0.0f32;
                let mut im = 0.0f32;
                for ant in 0..ants {
                    let w = self
                        .ctx
                        .pool
                        .beam()
                        .span(slot, 0, sc, (ue * ants + ant) * 2, 2);
                    let x = self.ctx.pool.freq().span(slot, symbol as usize, ant, sc * 2, 2);
                    re += w[0] * x[0] - w[1] * x[1];
                    im += w[0] * x[1] + w[1] * x[0];
                }
                let at = (i * ues + ue) * 2;
                equal[at] = re;
                equal[at + 1] = im;
            }
        }
        for ue in 0..ues {
            let llr =
                unsafe { self.ctx.pool.llr().span_mut(slot, ul_ord, ue, sc_base, sc_len) };
            for (i, v) in llr.iter_mut().enumerate() {
                let at = (i * ues + ue) * 2;
                *v = (equal[at] * 64.0).clamp(-127.0, 127.0) as i8;
            }
        }
        task.completion()
    }
}

/// LLRs -> decoded payload bytes, one code block per tag.
pub struct DecodeDoer {
    ctx: DoerContext,
}

impl Doer for DecodeDoer {
    fn kind(&self) -> DoerKind {
        DoerKind::Decode
    }

    fn run(&mut self, task: &Event) -> Event {
        let cfg = &self.ctx.cfg;
        for &tag in &task.tags {
            let slot = self.ctx.slot(tag.frame_id());
            let ul_ord = cfg
                .schedule()
                .uplink_ordinal(tag.symbol_id())
                .expect("decode task on a non-uplink symbol");
            let cb_flat = tag.inner() as usize;
            let ue = cb_flat / cfg.code_blocks_per_ue();
            let cb = cb_flat % cfg.code_blocks_per_ue();
            let n = cfg.data_bytes_per_code_block();

            let llr = self.ctx.pool.llr().row(slot, ul_ord, ue);
            // SAFETY: one decode task per code block; this span belongs to
            // (ue, cb) alone.
            let out = unsafe {
                self.ctx
                    .pool
                    .decoded()
                    .span_mut(slot, ul_ord, ue, cb * n, n)
            };
            for (i, b) in out.iter_mut().enumerate() {
                *b = llr[(cb * n + i) % llr.len()] as u8;
            }
        }
        task.completion()
    }
}

/// Downlink payload bytes -> coded bytes, one code block per tag.
pub struct EncodeDoer {
    ctx: DoerContext,
}

impl Doer for EncodeDoer {
    fn kind(&self) -> DoerKind {
        DoerKind::Encode
    }

    fn run(&mut self, task: &Event) -> Event {
        let cfg = &self.ctx.cfg;
        for &tag in &task.tags {
            let slot = self.ctx.slot(tag.frame_id());
            let dl_ord = cfg
                .schedule()
                .downlink_ordinal(tag.symbol_id())
                .expect("encode task on a non-downlink symbol");
            let cb_flat = tag.inner() as usize;
            let ue = cb_flat / cfg.code_blocks_per_ue();
            let cb = cb_flat % cfg.code_blocks_per_ue();
            let data_len = cfg.data_bytes_per_code_block();
            let coded_len = cfg.dl_coded_bytes_per_code_block();

            let bits = self
                .ctx
                .pool
                .dl_bits()
                .span(slot, dl_ord, ue, cb * data_len, data_len);
            // SAFETY: one encode task per code block.
            let coded = unsafe {
                self.ctx
                    .pool
                    .dl_encoded()
                    .span_mut(slot, dl_ord, ue, cb * coded_len, coded_len)
            };
            for (i, c) in coded.iter_mut().enumerate() {
                *c = bits[i % data_len].wrapping_add((i / data_len) as u8);
            }
        }
        task.completion()
    }
}

/// Coded downlink bytes + beam weights -> per-antenna frequency samples for
/// one subcarrier block.
pub struct PrecodeDoer {
    ctx: DoerContext,
}

impl Doer for PrecodeDoer {
    fn kind(&self) -> DoerKind {
        DoerKind::Precode
    }

    fn run(&mut self, task: &Event) -> Event {
        let cfg = &self.ctx.cfg;
        let tag = task.tag();
        let slot = self.ctx.slot(tag.frame_id());
        let dl_ord = cfg
            .schedule()
            .downlink_ordinal(tag.symbol_id())
            .expect("precode task on a non-downlink symbol");
        let sc_base = tag.inner() as usize;
        let sc_len = cfg.demul_block_size().min(cfg.ofdm_data_num() - sc_base);
        let ants = cfg.bs_ant_num();
        let ues = cfg.ue_num();
        let coded_row = cfg.code_blocks_per_ue() * cfg.dl_coded_bytes_per_code_block();

        for ant in 0..ants {
            // SAFETY: precode tasks partition subcarriers; this task owns
            // span [sc_base, sc_base + sc_len) of every antenna row for this
            // symbol.
            let out = unsafe {
                self.ctx
                    .pool
                    .dl_mod()
                    .span_mut(slot, dl_ord, ant, sc_base * 2, sc_len * 2)
            };
            for i in 0..sc_len {
                let sc = sc_base + i;
                let mut re = 0.0f32;
                let mut im = 0.0f32;
                for ue in 0..ues {
                    let byte =
                        self.ctx.pool.dl_encoded().row(slot, dl_ord, ue)[sc % coded_row];
                    let x = (f32::from(byte) - 128.0) / 128.0;
                    let w = self
                        .ctx
                        .pool
                        .beam()
                        .span(slot, 0, sc, (ue * ants + ant) * 2, 2);
                    // Transmit conjugate of the uplink combiner.
                    re += w[0] * x;
                    im -= w[1] * x;
                }
                out[i * 2] = re;
                out[i * 2 + 1] = im;
            }
        }
        task.completion()
    }
}

/// Frequency samples -> time-domain TX samples for one antenna.
pub struct IfftDoer {
    ctx: DoerContext,
}

impl Doer for IfftDoer {
    fn kind(&self) -> DoerKind {
        DoerKind::Ifft
    }

    fn run(&mut self, task: &Event) -> Event {
        let cfg = &self.ctx.cfg;
        for &tag in &task.tags {
            let slot = self.ctx.slot(tag.frame_id());
            let dl_ord = cfg
                .schedule()
                .downlink_ordinal(tag.symbol_id())
                .expect("ifft task on a non-downlink symbol");
            let ant = tag.inner() as usize;

            let freq = self.ctx.pool.dl_mod().row(slot, dl_ord, ant);
            // SAFETY: one IFFT task per (symbol, antenna) TX row.
            let tx = unsafe { self.ctx.pool.tx().row_mut(slot, dl_ord, ant) };
            for (i, s) in tx.iter_mut().enumerate() {
                let v = freq[i % freq.len()];
                *s = (v.clamp(-1.0, 1.0) * 8192.0) as i16;
            }
        }
        task.completion()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_config::ConfigFile;
    use core_events::EventKind;

    fn ctx() -> DoerContext {
        let mut f = ConfigFile::default();
        f.bs_ant_num = 2;
        f.ue_ant_num = 2;
        f.fft_size = 64;
        f.ofdm_data_num = 32;
        f.cp_size = 8;
        f.fft_block_size = 2;
        f.beam_block_size = 16;
        f.demul_block_size = 16;
        f.encode_block_size = 2;
        f.data_bytes_per_code_block = 16;
        f.frame_schedule = "PPUD".into();
        let cfg = Arc::new(Config::from_parts(f).unwrap());
        let pool = Arc::new(BufferPool::new(&cfg));
        DoerContext { cfg, pool }
    }

    fn fill_rx(ctx: &DoerContext, symbol: usize) {
        for ant in 0..ctx.cfg.bs_ant_num() {
            // SAFETY: single-threaded test setup.
            let row = unsafe { ctx.pool.rx().row_mut(0, symbol, ant) };
            for (i, s) in row.iter_mut().enumerate() {
                *s = ((i + ant * 7 + symbol) % 97) as i16 - 48;
            }
        }
    }

    #[test]
    fn fft_fills_freq_and_pilot_csi() {
        let ctx = ctx();
        fill_rx(&ctx, 0);
        fill_rx(&ctx, 2);
        let mut fft = FftDoer { ctx: ctx.clone() };

        let pilot = Event::batched(
            EventKind::Fft,
            (0..2).map(|a| Tag::for_antenna(0, 0, a)),
        );
        let comp = fft.run(&pilot);
        assert_eq!(comp.tags.len(), 2);
        assert!(ctx.pool.freq().row(0, 0, 0).iter().any(|&v| v != 0.0));
        // Pilot ordinal 0 -> ue 0 CSI mirrors the freq row.
        assert_eq!(ctx.pool.csi().row(0, 0, 1), ctx.pool.freq().row(0, 0, 1));

        let ul = Event::single(EventKind::Fft, Tag::for_antenna(0, 2, 0));
        fft.run(&ul);
        assert!(ctx.pool.freq().row(0, 2, 0).iter().any(|&v| v != 0.0));
        // Uplink FFT does not touch CSI for ue 1 written by pilot 1 only.
        assert!(ctx.pool.csi().row(0, 1, 0).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn uplink_chain_produces_decoded_bytes() {
        let ctx = ctx();
        for sym in [0usize, 1, 2] {
            fill_rx(&ctx, sym);
        }
        let mut fft = FftDoer { ctx: ctx.clone() };
        for sym in [0u16, 1, 2] {
            for ant in 0..2 {
                fft.run(&Event::single(EventKind::Fft, Tag::for_antenna(0, sym, ant)));
            }
        }
        let mut beam = BeamDoer { ctx: ctx.clone() };
        for sc_base in [0u32, 16] {
            beam.run(&Event::single(
                EventKind::Beam,
                Tag::for_subcarrier(0, 0, sc_base),
            ));
        }
        let mut demul = DemulDoer { ctx: ctx.clone() };
        for sc_base in [0u32, 16] {
            demul.run(&Event::single(
                EventKind::Demul,
                Tag::for_subcarrier(0, 2, sc_base),
            ));
        }
        let mut decode = DecodeDoer { ctx: ctx.clone() };
        decode.run(&Event::batched(
            EventKind::Decode,
            (0..2).map(|cb| Tag::for_code_block(0, 2, cb)),
        ));
        // Both users decoded from a nonzero LLR row.
        assert!(ctx.pool.llr().row(0, 0, 0).iter().any(|&v| v != 0));
        let d0 = ctx.pool.decoded().row(0, 0, 0);
        let d1 = ctx.pool.decoded().row(0, 0, 1);
        assert_eq!(d0.len(), 16);
        assert_ne!(d0, d1);
    }

    #[test]
    fn downlink_chain_produces_tx_samples() {
        let ctx = ctx();
        ctx.pool.preload_downlink(&ctx.cfg);
        // Seed CSI so beam weights are nonzero.
        for ue in 0..2 {
            for ant in 0..2 {
                // SAFETY: single-threaded test setup.
                let row = unsafe { ctx.pool.csi().row_mut(0, ue, ant) };
                for (i, v) in row.iter_mut().enumerate() {
                    *v = 0.1 + (i % 5) as f32 * 0.05;
                }
            }
        }
        let mut beam = BeamDoer { ctx: ctx.clone() };
        for sc_base in [0u32, 16] {
            beam.run(&Event::single(
                EventKind::Beam,
                Tag::for_subcarrier(0, 0, sc_base),
            ));
        }
        let mut encode = EncodeDoer { ctx: ctx.clone() };
        encode.run(&Event::batched(
            EventKind::Encode,
            (0..2).map(|cb| Tag::for_code_block(0, 3, cb)),
        ));
        assert!(
            ctx.pool
                .dl_encoded()
                .row(0, 0, 0)
                .iter()
                .any(|&b| b != 0)
        );
        let mut precode = PrecodeDoer { ctx: ctx.clone() };
        for sc_base in [0u32, 16] {
            precode.run(&Event::single(
                EventKind::Precode,
                Tag::for_subcarrier(0, 3, sc_base),
            ));
        }
        let mut ifft = IfftDoer { ctx: ctx.clone() };
        for ant in 0..2 {
            ifft.run(&Event::single(EventKind::Ifft, Tag::for_antenna(0, 3, ant)));
        }
        assert!(ctx.pool.tx().row(0, 0, 0).iter().any(|&s| s != 0));
        assert!(ctx.pool.tx().row(0, 0, 1).iter().any(|&s| s != 0));
    }

    #[test]
    fn encode_expands_by_code_rate() {
        let ctx = ctx();
        ctx.pool.preload_downlink(&ctx.cfg);
        let mut encode = EncodeDoer { ctx: ctx.clone() };
        encode.run(&Event::single(
            EventKind::Encode,
            Tag::for_code_block(0, 3, 0),
        ));
        let coded = ctx.pool.dl_encoded().row(0, 0, 0);
        assert_eq!(coded.len(), ctx.cfg.dl_coded_bytes_per_code_block());
        assert_eq!(coded.len(), 32); // 16 bytes at rate 0.5
        let bits = ctx.pool.dl_bits().row(0, 0, 0);
        assert_eq!(coded[0], bits[0]);
        assert_eq!(coded[16], bits[0].wrapping_add(1));
    }
}
