//! Configuration system using Figment.
//!
//! Configuration is layered, lowest to highest precedence:
//! 1. Built-in defaults ([`AppConfig::default`])
//! 2. An optional TOML file (`timelapse.toml` unless a path is given)
//! 3. Environment variables prefixed with `TIMELAPSE_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! TIMELAPSE_APPLICATION__LOG_LEVEL=debug
//! TIMELAPSE_PATHS__SAVE_DIR=/data/timelapse
//! TIMELAPSE_ACQUISITION__CAPTURE_TIMEOUT_MS=600000
//! ```
//!
//! The laser channel table is part of the configuration and is handed to
//! [`LaserPowerSync`](crate::laser::LaserPowerSync) at construction; nothing reads it
//! from process-wide state.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, TimelapseError};
use crate::experiment::{ExperimentConfig, Phase};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "timelapse.toml";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// File locations
    #[serde(default)]
    pub paths: PathsConfig,
    /// Capture protocol settings
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    /// Laser channel table
    #[serde(default)]
    pub lasers: LaserChannelMap,
    /// Experiment defaults used when no saved settings exist
    #[serde(default)]
    pub defaults: ExperimentDefaults,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "timelapse".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Where the experiment keeps its files.
///
/// Bundle, region and settings files live directly in `save_dir`; each run gets its own
/// timestamped subdirectory for captured data and the text export. Without a configured
/// `save_dir` the instrument's current sequence directory is used (see
/// [`crate::session::resolve_save_dir`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Base save directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_dir: Option<PathBuf>,
    /// Binary experiment settings record
    #[serde(default = "default_settings_file")]
    pub settings_file: String,
    /// Human-readable settings export, written into the run directory
    #[serde(default = "default_export_file")]
    pub export_file: String,
    /// Configuration bundle for the first phase
    #[serde(default = "default_bundle_a1")]
    pub bundle_a1: String,
    /// Configuration bundle for the second phase
    #[serde(default = "default_bundle_a2")]
    pub bundle_a2: String,
    /// Saved camera crop region
    #[serde(default = "default_crop_region")]
    pub crop_region: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            save_dir: None,
            settings_file: default_settings_file(),
            export_file: default_export_file(),
            bundle_a1: default_bundle_a1(),
            bundle_a2: default_bundle_a2(),
            crop_region: default_crop_region(),
        }
    }
}

impl PathsConfig {
    /// Base save directory, or the working directory while it is unresolved.
    pub fn base_dir(&self) -> &Path {
        self.save_dir.as_deref().unwrap_or(Path::new("."))
    }

    /// Full path of the binary settings record.
    pub fn settings_path(&self) -> PathBuf {
        self.base_dir().join(&self.settings_file)
    }

    /// Full path of the configuration bundle for `phase`.
    pub fn bundle_path(&self, phase: Phase) -> PathBuf {
        match phase {
            Phase::A1 => self.base_dir().join(&self.bundle_a1),
            Phase::A2 => self.base_dir().join(&self.bundle_a2),
        }
    }

    /// Full path of the saved crop region.
    pub fn crop_region_path(&self) -> PathBuf {
        self.base_dir().join(&self.crop_region)
    }
}

/// Capture protocol settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// File name tag of the first phase
    #[serde(default = "default_tag_a1")]
    pub phase_a1: String,
    /// File name tag of the second phase
    #[serde(default = "default_tag_a2")]
    pub phase_a2: String,
    /// Longest a single capture may run before it is reported as stalled
    #[serde(default = "default_capture_timeout")]
    pub capture_timeout_ms: u64,
    /// How often the running state of a capture is polled
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Delay between hiding and re-showing the illumination panel
    #[serde(default = "default_panel_settle")]
    pub panel_settle_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            phase_a1: default_tag_a1(),
            phase_a2: default_tag_a2(),
            capture_timeout_ms: default_capture_timeout(),
            poll_interval_ms: default_poll_interval(),
            panel_settle_ms: default_panel_settle(),
        }
    }
}

impl AcquisitionConfig {
    /// File name tag of `phase`.
    pub fn tag(&self, phase: Phase) -> &str {
        match phase {
            Phase::A1 => &self.phase_a1,
            Phase::A2 => &self.phase_a2,
        }
    }

    /// Capture deadline as a `Duration`.
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    /// Poll period as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Panel settling delay as a `Duration`.
    pub fn panel_settle(&self) -> Duration {
        Duration::from_millis(self.panel_settle_ms)
    }
}

/// One logical laser channel and the slider that controls it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaserChannel {
    /// Logical id, usually the wavelength (`"488"`)
    pub id: String,
    /// Instrument-specific slider name
    pub slider: String,
}

/// Static lookup from logical laser channel to instrument slider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaserChannelMap {
    channels: Vec<LaserChannel>,
}

impl Default for LaserChannelMap {
    fn default() -> Self {
        Self::new([
            ("405", "Toptica405_Laser405"),
            ("488", "Toptica488_Laser488"),
            ("561", "MMC D/A_Laser561"),
            ("640", "Toptica640_Laser640"),
        ])
    }
}

impl LaserChannelMap {
    /// Table from `(id, slider)` pairs, in display order.
    pub fn new<I, A, B>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<String>,
        B: Into<String>,
    {
        Self {
            channels: pairs
                .into_iter()
                .map(|(id, slider)| LaserChannel {
                    id: id.into(),
                    slider: slider.into(),
                })
                .collect(),
        }
    }

    /// Slider name for `id`, if the channel is known.
    pub fn slider(&self, id: &str) -> Option<&str> {
        self.channels
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.slider.as_str())
    }

    /// Known channels in table order.
    pub fn channels(&self) -> &[LaserChannel] {
        &self.channels
    }
}

/// Experiment defaults for a first run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentDefaults {
    /// Target cycle interval
    pub interval_ms: u64,
    /// Number of cycles
    pub cycle_count: u32,
    /// File name prefix
    pub prefix: String,
}

impl Default for ExperimentDefaults {
    fn default() -> Self {
        let experiment = ExperimentConfig::default();
        Self {
            interval_ms: experiment.interval_ms,
            cycle_count: experiment.cycle_count,
            prefix: experiment.prefix,
        }
    }
}

impl ExperimentDefaults {
    /// A fresh experiment built from these defaults.
    pub fn to_experiment(&self) -> ExperimentConfig {
        ExperimentConfig {
            interval_ms: self.interval_ms,
            cycle_count: self.cycle_count,
            prefix: self.prefix.clone(),
            ..ExperimentConfig::default()
        }
    }
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_settings_file() -> String {
    "expt-settings.bin".to_string()
}

fn default_export_file() -> String {
    "Settings.txt".to_string()
}

fn default_bundle_a1() -> String {
    "biop-macro-a1.acq".to_string()
}

fn default_bundle_a2() -> String {
    "biop-macro-a2.acq".to_string()
}

fn default_crop_region() -> String {
    "crop-area-camera".to_string()
}

fn default_tag_a1() -> String {
    "A1".to_string()
}

fn default_tag_a2() -> String {
    "A2".to_string()
}

fn default_capture_timeout() -> u64 {
    60 * 60 * 1000
}

fn default_poll_interval() -> u64 {
    100
}

fn default_panel_settle() -> u64 {
    200
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl AppConfig {
    /// Load configuration from `timelapse.toml` (if present) and the environment.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment overrides still apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or environment cannot be parsed, or if validation fails.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("TIMELAPSE_").split("__"))
    }

    /// Validate configuration after loading.
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Phase tags are non-empty and distinct
    /// - Capture timeout and poll interval are non-zero
    /// - Laser channel ids are unique
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(TimelapseError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let acq = &self.acquisition;
        if acq.phase_a1.trim().is_empty() || acq.phase_a2.trim().is_empty() {
            return Err(TimelapseError::Configuration(
                "Phase tags cannot be empty".to_string(),
            ));
        }
        if acq.phase_a1 == acq.phase_a2 {
            return Err(TimelapseError::Configuration(format!(
                "Both phases use the tag '{}'",
                acq.phase_a1
            )));
        }
        if acq.capture_timeout_ms == 0 {
            return Err(TimelapseError::Configuration(
                "capture_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if acq.poll_interval_ms == 0 {
            return Err(TimelapseError::Configuration(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for channel in self.lasers.channels() {
            if !seen.insert(channel.id.as_str()) {
                return Err(TimelapseError::Configuration(format!(
                    "Duplicate laser channel id '{}'",
                    channel.id
                )));
            }
        }

        Ok(())
    }
}
