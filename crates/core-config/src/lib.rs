//! Configuration loading and validation.
//!
//! The configuration is a JSON document read once at startup, validated, and
//! then used read-only: a [`Config`] value is passed by reference into every
//! component. Nothing in the hot path mutates it and there is no process-wide
//! config state.
//!
//! Unknown fields are ignored (serde tolerance) to allow forward evolution;
//! invalid values are fatal at startup. Derived task geometry (tasks per
//! symbol, batch counts) lives here so counters and batch emitters never
//! recompute it from raw fields.

use serde::Deserialize;
use std::path::PathBuf;
use std::{fs, path::Path};
use thiserror::Error;
use tracing::info;

mod schedule;
pub use schedule::{FrameSchedule, SymbolRole};

// Batch sizes must fit under the per-event tag cap.
use core_events::MAX_EVENT_TAGS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("config invalid: {0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct McsConfig {
    /// Bits per modulated symbol (2 = QPSK, 4 = 16QAM, 6 = 64QAM).
    #[serde(default = "McsConfig::default_modulation")]
    pub modulation: u8,
    /// Code rate as a fraction in (0, 1].
    #[serde(default = "McsConfig::default_code_rate")]
    pub code_rate: f32,
}

impl McsConfig {
    const fn default_modulation() -> u8 {
        4
    }
    const fn default_code_rate() -> f32 {
        0.5
    }
}

impl Default for McsConfig {
    fn default() -> Self {
        Self {
            modulation: Self::default_modulation(),
            code_rate: Self::default_code_rate(),
        }
    }
}

/// Raw deserialized document. Field names match the JSON keys.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConfigFile {
    // Fabric sizing
    pub bs_radio_num: usize,
    pub ue_radio_num: usize,
    pub bs_ant_num: usize,
    pub ue_ant_num: usize,

    // OFDM layout
    pub fft_size: usize,
    pub ofdm_data_num: usize,
    pub cp_size: usize,
    pub sample_rate: f64,
    /// Samples per symbol on the wire; 0 derives `fft_size + cp_size`.
    pub samps_per_symbol: usize,

    pub frame_schedule: String,

    pub ul_mcs: McsConfig,
    pub dl_mcs: McsConfig,
    pub code_blocks_per_ue: usize,
    pub data_bytes_per_code_block: usize,

    // Thread and core assignment
    pub worker_thread_num: usize,
    pub socket_thread_num: usize,
    pub core_offset: usize,

    // Task granularity
    pub beam_block_size: usize,
    pub demul_block_size: usize,
    pub fft_block_size: usize,
    pub encode_block_size: usize,

    // Run control
    pub frames_to_test: u64,
    pub frame_window: usize,
    pub mac_enabled: bool,
    pub hard_demod: bool,

    // Persistence
    pub dump_tx_data: bool,
    pub dump_decode_data: bool,
    pub log_dir: Option<PathBuf>,
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            bs_radio_num: 1,
            ue_radio_num: 1,
            bs_ant_num: 8,
            ue_ant_num: 4,
            fft_size: 2048,
            ofdm_data_num: 1200,
            cp_size: 160,
            sample_rate: 30_720_000.0,
            samps_per_symbol: 0,
            frame_schedule: "PPPPUUUUUUDDG".into(),
            ul_mcs: McsConfig::default(),
            dl_mcs: McsConfig::default(),
            code_blocks_per_ue: 1,
            data_bytes_per_code_block: 512,
            worker_thread_num: 4,
            socket_thread_num: 1,
            core_offset: 0,
            beam_block_size: 48,
            demul_block_size: 48,
            fft_block_size: 4,
            encode_block_size: 4,
            frames_to_test: 100,
            frame_window: 4,
            mac_enabled: false,
            hard_demod: false,
            dump_tx_data: false,
            dump_decode_data: false,
            log_dir: None,
        }
    }
}

/// Validated configuration plus parsed schedule. Read-only after startup.
#[derive(Debug, Clone)]
pub struct Config {
    file: ConfigFile,
    schedule: FrameSchedule,
}

impl Config {
    /// Validate a raw document and derive the schedule.
    pub fn from_parts(file: ConfigFile) -> Result<Self, ConfigError> {
        let schedule = FrameSchedule::parse(&file.frame_schedule)?;
        let cfg = Self { file, schedule };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(json)?;
        Self::from_parts(file)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let f = &self.file;
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if f.bs_ant_num == 0 || f.ue_ant_num == 0 {
            return invalid("antenna counts must be nonzero".into());
        }
        if f.ue_ant_num > f.bs_ant_num {
            return invalid(format!(
                "ue_ant_num {} exceeds bs_ant_num {}",
                f.ue_ant_num, f.bs_ant_num
            ));
        }
        if f.ofdm_data_num == 0 || f.ofdm_data_num > f.fft_size {
            return invalid(format!(
                "ofdm_data_num {} must be in 1..={}",
                f.ofdm_data_num, f.fft_size
            ));
        }
        if !(0.0..=1.0).contains(&f.ul_mcs.code_rate)
            || !(0.0..=1.0).contains(&f.dl_mcs.code_rate)
            || f.ul_mcs.code_rate == 0.0
            || f.dl_mcs.code_rate == 0.0
        {
            return invalid("mcs code_rate must be in (0, 1]".into());
        }
        for (name, val, max) in [
            ("beam_block_size", f.beam_block_size, f.ofdm_data_num),
            ("demul_block_size", f.demul_block_size, f.ofdm_data_num),
            ("fft_block_size", f.fft_block_size, f.bs_ant_num),
            (
                "encode_block_size",
                f.encode_block_size,
                f.ue_ant_num * f.code_blocks_per_ue,
            ),
        ] {
            if val == 0 || val > max {
                return invalid(format!("{name} {val} must be in 1..={max}"));
            }
        }
        for (name, val) in [
            ("fft_block_size", f.fft_block_size),
            ("encode_block_size", f.encode_block_size),
        ] {
            if val > MAX_EVENT_TAGS {
                return invalid(format!(
                    "{name} {val} exceeds the {MAX_EVENT_TAGS}-tag event cap"
                ));
            }
        }
        if f.frame_window < 2 {
            return invalid(format!("frame_window {} must be >= 2", f.frame_window));
        }
        if f.code_blocks_per_ue == 0 || f.data_bytes_per_code_block == 0 {
            return invalid("code block geometry must be nonzero".into());
        }
        if f.frames_to_test == 0 {
            return invalid("frames_to_test must be >= 1".into());
        }
        if f.socket_thread_num == 0 {
            return invalid("socket_thread_num must be >= 1".into());
        }
        Ok(())
    }

    pub fn raw(&self) -> &ConfigFile {
        &self.file
    }

    pub fn schedule(&self) -> &FrameSchedule {
        &self.schedule
    }

    // ---- Fabric sizing -------------------------------------------------

    pub fn bs_ant_num(&self) -> usize {
        self.file.bs_ant_num
    }

    pub fn ue_num(&self) -> usize {
        self.file.ue_ant_num
    }

    // ---- OFDM layout ---------------------------------------------------

    pub fn fft_size(&self) -> usize {
        self.file.fft_size
    }

    pub fn ofdm_data_num(&self) -> usize {
        self.file.ofdm_data_num
    }

    pub fn cp_size(&self) -> usize {
        self.file.cp_size
    }

    pub fn samps_per_symbol(&self) -> usize {
        if self.file.samps_per_symbol != 0 {
            self.file.samps_per_symbol
        } else {
            self.file.fft_size + self.file.cp_size
        }
    }

    /// Nominal on-air duration of one symbol.
    pub fn symbol_period(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.samps_per_symbol() as f64 / self.file.sample_rate)
    }

    // ---- Frame window and run control ---------------------------------

    pub fn window(&self) -> usize {
        self.file.frame_window
    }

    pub fn frames_to_test(&self) -> u64 {
        self.file.frames_to_test
    }

    pub fn mac_enabled(&self) -> bool {
        self.file.mac_enabled
    }

    pub fn hard_demod(&self) -> bool {
        self.file.hard_demod
    }

    /// Worker count of zero selects single-thread mode: the master runs the
    /// worker loop inline between event dispatches.
    pub fn single_threaded(&self) -> bool {
        self.file.worker_thread_num == 0
    }

    pub fn worker_thread_num(&self) -> usize {
        self.file.worker_thread_num
    }

    pub fn socket_thread_num(&self) -> usize {
        self.file.socket_thread_num
    }

    pub fn core_offset(&self) -> usize {
        self.file.core_offset
    }

    // ---- Task geometry -------------------------------------------------

    pub fn fft_block_size(&self) -> usize {
        self.file.fft_block_size
    }

    pub fn encode_block_size(&self) -> usize {
        self.file.encode_block_size
    }

    pub fn beam_block_size(&self) -> usize {
        self.file.beam_block_size
    }

    pub fn demul_block_size(&self) -> usize {
        self.file.demul_block_size
    }

    /// Beam tasks per frame: one per beam_block_size-wide subcarrier chunk.
    pub fn beam_task_count(&self) -> usize {
        self.file.ofdm_data_num.div_ceil(self.file.beam_block_size)
    }

    /// Demul (and precode) tasks per data symbol.
    pub fn demul_tasks_per_symbol(&self) -> usize {
        self.file.ofdm_data_num.div_ceil(self.file.demul_block_size)
    }

    /// Code blocks per symbol: one encode/decode task each.
    pub fn code_blocks_per_symbol(&self) -> usize {
        self.file.ue_ant_num * self.file.code_blocks_per_ue
    }

    pub fn code_blocks_per_ue(&self) -> usize {
        self.file.code_blocks_per_ue
    }

    pub fn data_bytes_per_code_block(&self) -> usize {
        self.file.data_bytes_per_code_block
    }

    /// Coded (post-encode) bytes per code block for the downlink MCS.
    pub fn dl_coded_bytes_per_code_block(&self) -> usize {
        coded_len(
            self.file.data_bytes_per_code_block,
            self.file.dl_mcs.code_rate,
        )
    }

    /// Coded bytes per code block for the uplink MCS.
    pub fn ul_coded_bytes_per_code_block(&self) -> usize {
        coded_len(
            self.file.data_bytes_per_code_block,
            self.file.ul_mcs.code_rate,
        )
    }

    /// Per-ring fabric capacity: sized to absorb a full frame plus slack.
    pub fn fabric_capacity(&self) -> usize {
        const SLACK_PER_SYMBOL: usize = 64;
        (SLACK_PER_SYMBOL * self.schedule.frame_len()).max(512)
    }
}

fn coded_len(data_bytes: usize, code_rate: f32) -> usize {
    (data_bytes as f32 / code_rate).ceil() as usize
}

/// Best-effort config path: local `pylon.json` in the working directory.
pub fn discover() -> PathBuf {
    PathBuf::from("pylon.json")
}

pub fn load_from(path: Option<PathBuf>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(discover);
    let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    let cfg = Config::from_json(&content)?;
    info!(
        target: "runtime.config",
        path = %Path::new(&path).display(),
        frame_len = cfg.schedule().frame_len(),
        window = cfg.window(),
        workers = cfg.worker_thread_num(),
        "config_loaded"
    );
    Ok(cfg)
}
