//! Startup-allocated buffer pool for every pipeline stage.
//!
//! All buffers are sized once from configuration and live for the process.
//! Stages receive index-based views: a stage may mutate a region only while
//! its counter is open; after closure the region is read-only to downstream
//! stages. See `cell` for the aliasing contract.
//!
//! Layout summary (slot = frame id mod window):
//! - `rx`       (slot, symbol, antenna) -> interleaved i16 I/Q samples
//! - `freq`     (slot, symbol, antenna) -> f32 I/Q per data subcarrier
//! - `csi`      (slot, user, antenna)   -> f32 I/Q channel estimate per subcarrier
//! - `beam`     (slot, subcarrier)      -> f32 I/Q weight per (user, antenna)
//! - `equal`    (slot, ul symbol)       -> f32 I/Q per (subcarrier, user)
//! - `llr`      (slot, ul symbol, user) -> one demapped value per subcarrier
//! - `decoded`  (slot, ul symbol, user) -> decoded payload bytes
//! - `dl_bits`  (slot, dl symbol, user) -> downlink payload bytes (from MAC or preload)
//! - `dl_encoded` (slot, dl symbol, user) -> coded downlink bytes
//! - `dl_mod`   (slot, dl symbol, antenna) -> precoded f32 I/Q per subcarrier
//! - `tx`       (slot, dl symbol, antenna) -> interleaved i16 I/Q samples

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use tracing::info;

use core_config::Config;

mod cell;
pub use cell::{Grid, StageCell};

pub struct BufferPool {
    rx: Grid<i16>,
    freq: Grid<f32>,
    csi: Grid<f32>,
    beam: Grid<f32>,
    equal: Grid<f32>,
    llr: Grid<i8>,
    decoded: Grid<u8>,
    dl_bits: Grid<u8>,
    dl_encoded: Grid<u8>,
    dl_mod: Grid<f32>,
    tx: Grid<i16>,
    window: usize,
    dl_symbols: usize,
    ul_symbols: usize,
}

impl BufferPool {
    pub fn new(cfg: &Config) -> Self {
        let w = cfg.window();
        let sched = cfg.schedule();
        let frame_len = sched.frame_len();
        let n_ul = sched.uplink_symbols().len();
        let n_dl = sched.downlink_symbols().len();
        let ants = cfg.bs_ant_num();
        let ues = cfg.ue_num();
        let samps2 = cfg.samps_per_symbol() * 2;
        let sc2 = cfg.ofdm_data_num() * 2;

        let pool = Self {
            rx: Grid::new(w, frame_len, ants, samps2),
            freq: Grid::new(w, frame_len, ants, sc2),
            csi: Grid::new(w, ues, ants, sc2),
            beam: Grid::new(w, 1, cfg.ofdm_data_num(), ues * ants * 2),
            equal: Grid::new(w, n_ul.max(1), 1, cfg.ofdm_data_num() * ues * 2),
            llr: Grid::new(w, n_ul.max(1), ues, cfg.ofdm_data_num()),
            decoded: Grid::new(
                w,
                n_ul.max(1),
                ues,
                cfg.code_blocks_per_ue() * cfg.data_bytes_per_code_block(),
            ),
            dl_bits: Grid::new(
                w,
                n_dl.max(1),
                ues,
                cfg.code_blocks_per_ue() * cfg.data_bytes_per_code_block(),
            ),
            dl_encoded: Grid::new(
                w,
                n_dl.max(1),
                ues,
                cfg.code_blocks_per_ue() * cfg.dl_coded_bytes_per_code_block(),
            ),
            dl_mod: Grid::new(w, n_dl.max(1), ants, sc2),
            tx: Grid::new(w, n_dl.max(1), ants, samps2),
            window: w,
            dl_symbols: n_dl,
            ul_symbols: n_ul,
        };
        info!(
            target: "runtime.buffers",
            rx_bytes = pool.rx.total_len() * 2,
            freq_bytes = pool.freq.total_len() * 4,
            tx_bytes = pool.tx.total_len() * 2,
            "pool_allocated"
        );
        pool
    }

    pub fn rx(&self) -> &Grid<i16> {
        &self.rx
    }
    pub fn freq(&self) -> &Grid<f32> {
        &self.freq
    }
    pub fn csi(&self) -> &Grid<f32> {
        &self.csi
    }
    pub fn beam(&self) -> &Grid<f32> {
        &self.beam
    }
    pub fn equal(&self) -> &Grid<f32> {
        &self.equal
    }
    pub fn llr(&self) -> &Grid<i8> {
        &self.llr
    }
    pub fn decoded(&self) -> &Grid<u8> {
        &self.decoded
    }
    pub fn dl_bits(&self) -> &Grid<u8> {
        &self.dl_bits
    }
    pub fn dl_encoded(&self) -> &Grid<u8> {
        &self.dl_encoded
    }
    pub fn dl_mod(&self) -> &Grid<f32> {
        &self.dl_mod
    }
    pub fn tx(&self) -> &Grid<i16> {
        &self.tx
    }

    /// Fill downlink payload bytes with a deterministic pattern. Used when
    /// the MAC is disabled and at test setup, before any thread starts.
    pub fn preload_downlink(&self, cfg: &Config) {
        for slot in 0..self.window {
            for sym in 0..self.dl_symbols {
                for ue in 0..cfg.ue_num() {
                    // SAFETY: runs single-threaded before startup completes.
                    let row = unsafe { self.dl_bits.row_mut(slot, sym, ue) };
                    for (i, b) in row.iter_mut().enumerate() {
                        *b = (slot as u8)
                            .wrapping_add(sym as u8)
                            .wrapping_mul(31)
                            .wrapping_add(ue as u8)
                            .wrapping_add(i as u8);
                    }
                }
            }
        }
    }

    /// Dump transmitted I/Q: slots outer, then symbols, antennas inner.
    /// Contiguous little-endian i16, no header.
    pub fn dump_tx(&self, path: &Path, ants: usize) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        for slot in 0..self.window {
            for sym in 0..self.dl_symbols {
                for ant in 0..ants {
                    for &s in self.tx.row(slot, sym, ant) {
                        out.write_all(&s.to_le_bytes())?;
                    }
                }
            }
        }
        out.flush()
    }

    /// Dump decoded uplink bits: slots outer, then symbols, users inner.
    pub fn dump_decoded(&self, path: &Path, ues: usize) -> io::Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        for slot in 0..self.window {
            for sym in 0..self.ul_symbols {
                for ue in 0..ues {
                    out.write_all(self.decoded.row(slot, sym, ue))?;
                }
            }
        }
        out.flush()
    }
}
