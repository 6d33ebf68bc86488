//! Per-frame timing aggregation.
//!
//! The master stamps timing marks into the live frame's slot as stages
//! close; retirement folds them into this aggregator. The aggregate is read
//! once at shutdown; there is no mid-run reader.

use std::time::Duration;

use core_counters::FrameTimings;

#[derive(Debug, Default, Clone, Copy)]
struct StageAccum {
    sum: Duration,
    max: Duration,
    samples: u64,
}

impl StageAccum {
    fn record(&mut self, d: Duration) {
        self.sum += d;
        self.max = self.max.max(d);
        self.samples += 1;
    }

    fn avg(&self) -> Duration {
        if self.samples == 0 {
            Duration::ZERO
        } else {
            self.sum / self.samples as u32
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct StatsAggregator {
    frame: StageAccum,
    uplink: StageAccum,
    downlink: StageAccum,
}

impl StatsAggregator {
    pub(crate) fn record(&mut self, t: &FrameTimings) {
        let Some(start) = t.first_rx else { return };
        if let Some(end) = t.retired {
            self.frame.record(end.duration_since(start));
        }
        if let Some(end) = t.decode_done {
            self.uplink.record(end.duration_since(start));
        }
        if let Some(end) = t.tx_done {
            self.downlink.record(end.duration_since(start));
        }
    }

    pub(crate) fn report(&self, frames_retired: u64, stalled: bool) -> RunReport {
        RunReport {
            frames_retired,
            stalled,
            avg_frame: self.frame.avg(),
            max_frame: self.frame.max,
            avg_uplink: self.uplink.avg(),
            avg_downlink: self.downlink.avg(),
        }
    }
}

/// Shutdown summary returned by the master loop.
#[derive(Debug, Clone, Copy)]
pub struct RunReport {
    pub frames_retired: u64,
    pub stalled: bool,
    pub avg_frame: Duration,
    pub max_frame: Duration,
    pub avg_uplink: Duration,
    pub avg_downlink: Duration,
}
