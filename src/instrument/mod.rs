//! Instrument API boundary.
//!
//! Everything the scheduler needs from the microscope goes through the [`Microscope`]
//! trait: configuration bundles, focus, sequence naming, capture start/stop/status,
//! result windows, illumination sliders and the settling panel. Vendor backends implement
//! it in their own crates; [`mock::MockMicroscope`] simulates one for tests and dry runs.
//!
//! All methods take `&self`, implementations use interior mutability. The scheduler never
//! issues two commands concurrently, so backends do not need to serialize callers.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::AppResult;

pub mod mock;

/// Opaque reference to a saved acquisition configuration bundle (`.acq`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BundleHandle(PathBuf);

impl BundleHandle {
    /// Handle for the bundle stored at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Location of the bundle on disk.
    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// Opaque reference to a saved camera crop region.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CropRegion(PathBuf);

impl CropRegion {
    /// Handle for the region stored at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    /// Location of the region file on disk.
    pub fn path(&self) -> &Path {
        &self.0
    }
}

/// Identifier of an open result window.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WindowId(pub u64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An open result window as reported by the instrument.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WindowInfo {
    /// Stable identifier used to close the window.
    pub id: WindowId,
    /// Display name, e.g. `A1-timelapse-3`.
    pub name: String,
}

/// Operations consumed from the microscope control software.
#[async_trait]
pub trait Microscope: Send + Sync {
    /// Loads a saved configuration bundle. Fails if the bundle does not exist.
    async fn load_settings(&self, bundle: &BundleHandle) -> AppResult<()>;

    /// Saves the current acquisition configuration as a bundle.
    async fn save_settings(&self, bundle: &BundleHandle) -> AppResult<()>;

    /// Current focus (Z) position.
    async fn focus(&self) -> AppResult<f64>;

    /// Moves the focus drive to `z`.
    async fn set_focus(&self, z: f64) -> AppResult<()>;

    /// Directory the next capture sequence writes into.
    async fn sequence_directory(&self) -> AppResult<PathBuf>;

    /// Sets the directory the next capture sequence writes into.
    async fn set_sequence_directory(&self, dir: &Path) -> AppResult<()>;

    /// Sets the file name prefix of the next capture sequence.
    async fn set_base_name(&self, name: &str) -> AppResult<()>;

    /// Number of regions currently drawn on the live window.
    async fn region_count(&self) -> AppResult<usize>;

    /// Saves the single drawn region so it can be applied as a camera crop.
    async fn save_camera_region(&self, region: &CropRegion) -> AppResult<()>;

    /// Applies a saved region as camera crop.
    async fn load_camera_region(&self, region: &CropRegion) -> AppResult<()>;

    /// Starts the configured capture sequence. Returns immediately.
    async fn start_sequence(&self) -> AppResult<()>;

    /// Stops a running capture sequence.
    async fn stop_sequence(&self) -> AppResult<()>;

    /// Whether a capture sequence is still running.
    async fn is_running(&self) -> AppResult<bool>;

    /// All open result windows.
    async fn open_windows(&self) -> AppResult<Vec<WindowInfo>>;

    /// Closes one result window without saving.
    async fn close_window(&self, id: WindowId) -> AppResult<()>;

    /// Reads an illumination slider by its instrument-specific name.
    async fn slider(&self, name: &str) -> AppResult<f64>;

    /// Writes an illumination slider by its instrument-specific name.
    async fn set_slider(&self, name: &str, value: f64) -> AppResult<()>;

    /// Shows the illumination control panel.
    async fn show_panel(&self) -> AppResult<()>;

    /// Hides the illumination control panel.
    async fn hide_panel(&self) -> AppResult<()>;
}
