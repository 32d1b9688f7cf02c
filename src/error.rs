//! Custom error types for the time-lapse scheduler.
//!
//! This module defines the primary error type, `TimelapseError`, for the whole crate.
//! Using the `thiserror` crate, it gives a single, consistent way to report the kinds of
//! failure a long unattended run can hit, from configuration mistakes to a camera that
//! never reports the end of a capture.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically TOML parsing or type mismatches
//!   in the configuration file or `TIMELAPSE_` environment overrides.
//! - **`Configuration`**: Semantic errors that pass parsing but are logically wrong
//!   (e.g. two phases sharing the same tag).
//! - **`Io`**: Wraps `std::io::Error` for run directory creation and settings files.
//! - **`Encoding`**: The binary settings record could not be encoded or decoded.
//! - **`Instrument`**: A command sent through the instrument API failed.
//! - **`CaptureTimeout`**: The instrument kept reporting a running capture past the
//!   configured deadline. This replaces the unbounded wait of a naive polling loop.
//! - **`CaptureAborted`**: The operator asked for a hard abort while a capture was running.
//!
//! Persistence failures are deliberately *not* propagated to the scheduler; the settings
//! store logs them and degrades to defaults. The variants exist so the store itself can use `?`.

use std::time::Duration;
use thiserror::Error;

use crate::experiment::Phase;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, TimelapseError>;

/// Every failure the scheduler and its collaborators can report.
#[derive(Error, Debug)]
pub enum TimelapseError {
    /// Configuration could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but is logically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File system failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The binary settings record could not be (de)serialized.
    #[error("Settings encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// An instrument command failed.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// The instrument did not finish a capture before the deadline.
    #[error("{phase} capture still running after {waited:?}")]
    CaptureTimeout {
        /// Phase whose capture stalled.
        phase: Phase,
        /// How long the runner waited before giving up.
        waited: Duration,
    },

    /// The capture was stopped on operator request.
    #[error("{phase} capture aborted by operator")]
    CaptureAborted {
        /// Phase whose capture was stopped.
        phase: Phase,
    },
}

impl From<figment::Error> for TimelapseError {
    fn from(err: figment::Error) -> Self {
        TimelapseError::Config(Box::new(err))
    }
}

impl TimelapseError {
    /// True for the faults that come from the capture-completion wait.
    pub fn is_capture_fault(&self) -> bool {
        matches!(
            self,
            TimelapseError::CaptureTimeout { .. } | TimelapseError::CaptureAborted { .. }
        )
    }
}
