//! Experiment data model.
//!
//! [`ExperimentConfig`] is the durable description of a time-lapse (laser powers, the two
//! focus positions, interval, cycle count, naming prefix). It is persisted through the
//! settings store after setup and again when a run is interrupted.
//!
//! [`AcquisitionSpec`] and [`CycleResult`] are ephemeral: one spec is built per phase from
//! the config, one result is produced per cycle for logging and interval accounting.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::instrument::{BundleHandle, CropRegion};

/// One of the two acquisitions run in every cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Phase {
    /// First acquisition of the cycle (e.g. brightfield).
    A1,
    /// Second acquisition of the cycle (e.g. fluorescence).
    A2,
}

impl Phase {
    /// Both phases in execution order.
    pub const ALL: [Phase; 2] = [Phase::A1, Phase::A2];
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::A1 => write!(f, "A1"),
            Phase::A2 => write!(f, "A2"),
        }
    }
}

/// Persisted experiment parameters.
///
/// `interval_ms` and `cycle_count` are unsigned, so the non-negativity invariants hold by
/// construction. Laser powers are kept in a `BTreeMap` so the record encodes identically
/// across runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Illumination intensity per laser channel id (e.g. `"488" -> 12.5`).
    pub laser_powers: BTreeMap<String, f64>,
    /// Focus (Z) position for the first phase.
    pub focus_a1: f64,
    /// Focus (Z) position for the second phase.
    pub focus_a2: f64,
    /// Target spacing between the starts of consecutive cycles.
    pub interval_ms: u64,
    /// Number of cycles to run.
    pub cycle_count: u32,
    /// Naming prefix for captured files.
    pub prefix: String,
    /// Calibrated pixel size, when known.
    pub pixel_size: Option<f64>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            laser_powers: BTreeMap::new(),
            focus_a1: 0.0,
            focus_a2: 0.0,
            interval_ms: 10_000,
            cycle_count: 5,
            prefix: "timelapse".to_string(),
            pixel_size: None,
        }
    }
}

impl ExperimentConfig {
    /// Focus position recorded for `phase`.
    pub fn focus(&self, phase: Phase) -> f64 {
        match phase {
            Phase::A1 => self.focus_a1,
            Phase::A2 => self.focus_a2,
        }
    }

    /// Records the focus position for `phase`.
    pub fn set_focus(&mut self, phase: Phase, z: f64) {
        match phase {
            Phase::A1 => self.focus_a1 = z,
            Phase::A2 => self.focus_a2 = z,
        }
    }

    /// Copy of this config with the planned cycle count replaced by `completed`.
    pub fn with_completed_cycles(&self, completed: u32) -> Self {
        Self {
            cycle_count: completed,
            ..self.clone()
        }
    }

    /// `name : value` lines for the plain-text export.
    pub fn export_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (channel, power) in &self.laser_powers {
            lines.push(format!("laser_{channel} : {power}"));
        }
        lines.push(format!("focus_a1 : {}", self.focus_a1));
        lines.push(format!("focus_a2 : {}", self.focus_a2));
        lines.push(format!("interval_ms : {}", self.interval_ms));
        lines.push(format!("cycle_count : {}", self.cycle_count));
        lines.push(format!("prefix : {}", self.prefix));
        if let Some(pixel_size) = self.pixel_size {
            lines.push(format!("pixel_size : {pixel_size}"));
        }
        lines
    }
}

/// Everything needed to run one acquisition phase.
#[derive(Clone, Debug, PartialEq)]
pub struct AcquisitionSpec {
    /// Which phase this spec drives.
    pub phase: Phase,
    /// Configuration bundle loaded onto the instrument before capture.
    pub config_handle: BundleHandle,
    /// Camera crop applied before capture, if the session has one.
    pub crop_region: Option<CropRegion>,
    /// Focus position for the capture.
    pub focus: f64,
    /// Directory the instrument writes into.
    pub output_dir: PathBuf,
    /// File name prefix, e.g. `A1-timelapse`.
    pub base_name: String,
}

impl AcquisitionSpec {
    /// Name used in log output.
    pub fn name(&self) -> String {
        self.phase.to_string()
    }
}

/// Timing of one completed cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleResult {
    /// Zero-based cycle index.
    pub cycle_index: u32,
    /// Time spent in the first phase.
    pub phase_a1_ms: u64,
    /// Time spent in the second phase.
    pub phase_a2_ms: u64,
    /// Time from cycle start to end of the second phase.
    pub total_ms: u64,
    /// Interval sleep actually performed after the cycle.
    pub waited_ms: u64,
}

impl CycleResult {
    /// Remaining interval budget; zero or negative means the cycle ran over.
    pub fn time_remaining_ms(&self, interval_ms: u64) -> i128 {
        i128::from(interval_ms) - i128::from(self.total_ms)
    }
}
