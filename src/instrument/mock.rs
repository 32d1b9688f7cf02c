//! Simulated microscope.
//!
//! Provides a [`Microscope`] implementation that needs no hardware. Captures take a
//! configurable amount of (tokio) time, finished captures open a result window named
//! `<base name>-<n>` just like the real acquisition software, and every command is
//! recorded so tests can assert on the exact protocol the scheduler followed.
//!
//! # Timing
//!
//! Capture completion is computed from `tokio::time::Instant`, so tests running on a
//! paused clock (`#[tokio::test(start_paused = true)]`) get exact, repeatable durations.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use tracing::debug;

use super::{BundleHandle, CropRegion, Microscope, WindowId, WindowInfo};
use crate::error::{AppResult, TimelapseError};

/// A command received by the mock, in arrival order.
#[derive(Clone, Debug, PartialEq)]
#[allow(missing_docs)]
pub enum MockCall {
    LoadSettings(PathBuf),
    SaveSettings(PathBuf),
    SetFocus(f64),
    SetDirectory(PathBuf),
    SetBaseName(String),
    SaveCameraRegion(PathBuf),
    LoadCameraRegion(PathBuf),
    StartSequence,
    StopSequence,
    CloseWindow(WindowId),
    SetSlider(String, f64),
    ShowPanel,
    HidePanel,
}

struct Capture {
    base_name: String,
    ends_at: Option<Instant>,
}

struct MockState {
    calls: Vec<MockCall>,
    focus: f64,
    directory: PathBuf,
    base_name: String,
    sliders: HashMap<String, f64>,
    saved_bundles: HashSet<PathBuf>,
    require_saved_bundles: bool,
    region_count: usize,
    capture: Option<Capture>,
    capture_durations: VecDeque<Duration>,
    default_capture: Duration,
    stalled: bool,
    stop_fails: bool,
    windows: Vec<WindowInfo>,
    next_window: u64,
    sequence_numbers: HashMap<String, u32>,
}

impl MockState {
    fn open_window(&mut self, name: String) {
        self.next_window += 1;
        self.windows.push(WindowInfo {
            id: WindowId(self.next_window),
            name,
        });
    }

    fn finish_capture_if_due(&mut self) {
        let due = match &self.capture {
            Some(capture) => capture.ends_at.is_some_and(|end| Instant::now() >= end),
            None => false,
        };
        if !due {
            return;
        }
        if let Some(capture) = self.capture.take() {
            let n = self
                .sequence_numbers
                .entry(capture.base_name.clone())
                .or_insert(0);
            *n += 1;
            let name = format!("{}-{}", capture.base_name, n);
            debug!("MockMicroscope: capture finished, opening '{}'", name);
            self.open_window(name);
        }
    }
}

/// Simulated microscope with recorded command history.
///
/// # Example
///
/// ```rust,ignore
/// let scope = MockMicroscope::new().with_capture_duration(Duration::from_millis(300));
/// scope.start_sequence().await?;
/// assert!(scope.is_running().await?);
/// ```
#[derive(Clone)]
pub struct MockMicroscope {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockMicroscope {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMicroscope {
    /// Mock with 100ms captures, the standard four laser sliders at zero and no drawn region.
    pub fn new() -> Self {
        let sliders = [
            "Toptica405_Laser405",
            "Toptica488_Laser488",
            "MMC D/A_Laser561",
            "Toptica640_Laser640",
        ]
        .into_iter()
        .map(|name| (name.to_string(), 0.0))
        .collect();

        Self {
            state: Arc::new(Mutex::new(MockState {
                calls: Vec::new(),
                focus: 0.0,
                directory: PathBuf::from("."),
                base_name: String::new(),
                sliders,
                saved_bundles: HashSet::new(),
                require_saved_bundles: false,
                region_count: 0,
                capture: None,
                capture_durations: VecDeque::new(),
                default_capture: Duration::from_millis(100),
                stalled: false,
                stop_fails: false,
                windows: Vec::new(),
                next_window: 0,
                sequence_numbers: HashMap::new(),
            })),
        }
    }

    fn map_state(self, f: impl FnOnce(&mut MockState)) -> Self {
        // Builders run before the mock is shared, so the lock is always free.
        if let Ok(mut state) = self.state.try_lock() {
            f(&mut state);
        }
        self
    }

    /// Every capture takes `duration`.
    pub fn with_capture_duration(self, duration: Duration) -> Self {
        self.map_state(|s| s.default_capture = duration)
    }

    /// Captures take these durations in order, then fall back to the default.
    pub fn with_capture_durations(self, durations: impl IntoIterator<Item = Duration>) -> Self {
        self.map_state(|s| s.capture_durations = durations.into_iter().collect())
    }

    /// Captures never finish on their own.
    pub fn stalled(self) -> Self {
        self.map_state(|s| s.stalled = true)
    }

    /// Stopping a sequence is refused by the instrument.
    pub fn failing_stop(self) -> Self {
        self.map_state(|s| s.stop_fails = true)
    }

    /// Loading a bundle that was never saved fails, like on a first run.
    pub fn require_saved_bundles(self) -> Self {
        self.map_state(|s| s.require_saved_bundles = true)
    }

    /// Number of regions drawn on the live window.
    pub fn with_region_count(self, count: usize) -> Self {
        self.map_state(|s| s.region_count = count)
    }

    /// Initial sequence directory.
    pub fn with_directory(self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.map_state(|s| s.directory = dir)
    }

    /// Pre-existing result windows.
    pub fn with_windows<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.map_state(|s| {
            for name in names {
                s.open_window(name.into());
            }
        })
    }

    /// Commands received so far.
    pub async fn calls(&self) -> Vec<MockCall> {
        self.state.lock().await.calls.clone()
    }

    /// Names of the windows still open.
    pub async fn window_names(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.windows.iter().map(|w| w.name.clone()).collect()
    }

    /// Slider values by instrument name.
    pub async fn sliders(&self) -> HashMap<String, f64> {
        self.state.lock().await.sliders.clone()
    }

    /// Current sequence directory.
    pub async fn directory(&self) -> PathBuf {
        self.state.lock().await.directory.clone()
    }
}

#[async_trait]
impl Microscope for MockMicroscope {
    async fn load_settings(&self, bundle: &BundleHandle) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state
            .calls
            .push(MockCall::LoadSettings(bundle.path().to_path_buf()));
        if state.require_saved_bundles && !state.saved_bundles.contains(bundle.path()) {
            return Err(TimelapseError::Instrument(format!(
                "settings file '{}' not found",
                bundle.path().display()
            )));
        }
        Ok(())
    }

    async fn save_settings(&self, bundle: &BundleHandle) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state
            .calls
            .push(MockCall::SaveSettings(bundle.path().to_path_buf()));
        state.saved_bundles.insert(bundle.path().to_path_buf());
        Ok(())
    }

    async fn focus(&self) -> AppResult<f64> {
        Ok(self.state.lock().await.focus)
    }

    async fn set_focus(&self, z: f64) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(MockCall::SetFocus(z));
        state.focus = z;
        Ok(())
    }

    async fn sequence_directory(&self) -> AppResult<PathBuf> {
        Ok(self.state.lock().await.directory.clone())
    }

    async fn set_sequence_directory(&self, dir: &Path) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(MockCall::SetDirectory(dir.to_path_buf()));
        state.directory = dir.to_path_buf();
        Ok(())
    }

    async fn set_base_name(&self, name: &str) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(MockCall::SetBaseName(name.to_string()));
        state.base_name = name.to_string();
        Ok(())
    }

    async fn region_count(&self) -> AppResult<usize> {
        Ok(self.state.lock().await.region_count)
    }

    async fn save_camera_region(&self, region: &CropRegion) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.region_count != 1 {
            return Err(TimelapseError::Instrument(format!(
                "expected one region, found {}",
                state.region_count
            )));
        }
        state
            .calls
            .push(MockCall::SaveCameraRegion(region.path().to_path_buf()));
        Ok(())
    }

    async fn load_camera_region(&self, region: &CropRegion) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state
            .calls
            .push(MockCall::LoadCameraRegion(region.path().to_path_buf()));
        Ok(())
    }

    async fn start_sequence(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if state.capture.is_some() {
            return Err(TimelapseError::Instrument(
                "a capture sequence is already running".to_string(),
            ));
        }
        state.calls.push(MockCall::StartSequence);
        let duration = state
            .capture_durations
            .pop_front()
            .unwrap_or(state.default_capture);
        let ends_at = if state.stalled {
            None
        } else {
            Some(Instant::now() + duration)
        };
        state.capture = Some(Capture {
            base_name: state.base_name.clone(),
            ends_at,
        });
        Ok(())
    }

    async fn stop_sequence(&self) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(MockCall::StopSequence);
        if state.stop_fails {
            return Err(TimelapseError::Instrument(
                "sequence could not be stopped".to_string(),
            ));
        }
        state.capture = None;
        Ok(())
    }

    async fn is_running(&self) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        state.finish_capture_if_due();
        Ok(state.capture.is_some())
    }

    async fn open_windows(&self) -> AppResult<Vec<WindowInfo>> {
        Ok(self.state.lock().await.windows.clone())
    }

    async fn close_window(&self, id: WindowId) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.calls.push(MockCall::CloseWindow(id));
        state.windows.retain(|w| w.id != id);
        Ok(())
    }

    async fn slider(&self, name: &str) -> AppResult<f64> {
        self.state
            .lock()
            .await
            .sliders
            .get(name)
            .copied()
            .ok_or_else(|| TimelapseError::Instrument(format!("unknown slider '{name}'")))
    }

    async fn set_slider(&self, name: &str, value: f64) -> AppResult<()> {
        let mut state = self.state.lock().await;
        if !state.sliders.contains_key(name) {
            return Err(TimelapseError::Instrument(format!("unknown slider '{name}'")));
        }
        state.calls.push(MockCall::SetSlider(name.to_string(), value));
        state.sliders.insert(name.to_string(), value);
        Ok(())
    }

    async fn show_panel(&self) -> AppResult<()> {
        self.state.lock().await.calls.push(MockCall::ShowPanel);
        Ok(())
    }

    async fn hide_panel(&self) -> AppResult<()> {
        self.state.lock().await.calls.push(MockCall::HidePanel);
        Ok(())
    }
}
