//! Single acquisition execution.
//!
//! [`AcquisitionRunner::run`] drives one phase through the instrument:
//!
//! 1. load the phase's configuration bundle
//! 2. apply the camera crop, if the session has one
//! 3. set base name and output directory
//! 4. move focus
//! 5. start the capture and wait until the instrument reports it idle
//!
//! The completion wait polls with a deadline. A capture still running at the deadline is
//! stopped and reported as [`TimelapseError::CaptureTimeout`]; cancelling the abort token
//! stops it early with [`TimelapseError::CaptureAborted`].
//!
//! Windows opened by the capture are recorded in the caller's [`WindowHandleSet`] under
//! the phase and iteration, so reaping never depends on window names.

use std::collections::HashSet;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::AcquisitionConfig;
use crate::error::{AppResult, TimelapseError};
use crate::experiment::{AcquisitionSpec, Phase};
use crate::instrument::{Microscope, WindowId};
use crate::reaper::WindowHandleSet;

/// Runs acquisitions on one instrument.
pub struct AcquisitionRunner<'a, M: Microscope + ?Sized> {
    scope: &'a M,
    capture_timeout: Duration,
    poll_interval: Duration,
}

impl<'a, M: Microscope + ?Sized> AcquisitionRunner<'a, M> {
    /// Runner using the deadline and poll period from `config`.
    pub fn new(scope: &'a M, config: &AcquisitionConfig) -> Self {
        Self {
            scope,
            capture_timeout: config.capture_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Executes `spec` and blocks until the capture finished.
    ///
    /// New result windows are added to `windows` under `(spec.phase, iteration)`.
    pub async fn run(
        &self,
        spec: &AcquisitionSpec,
        iteration: u32,
        windows: &mut WindowHandleSet,
        abort: &CancellationToken,
    ) -> AppResult<()> {
        self.scope.load_settings(&spec.config_handle).await?;
        if let Some(region) = &spec.crop_region {
            self.scope.load_camera_region(region).await?;
        }
        self.scope.set_base_name(&spec.base_name).await?;
        self.scope.set_sequence_directory(&spec.output_dir).await?;
        self.scope.set_focus(spec.focus).await?;

        let before: HashSet<WindowId> = self
            .scope
            .open_windows()
            .await?
            .iter()
            .map(|w| w.id)
            .collect();

        debug!(
            "Starting {} capture '{}' at z={}",
            spec.name(),
            spec.base_name,
            spec.focus
        );
        self.scope.start_sequence().await?;
        self.wait_until_idle(spec.phase, abort).await?;

        for window in self.scope.open_windows().await? {
            if !before.contains(&window.id) {
                windows.insert(spec.phase, iteration, window.id);
            }
        }
        Ok(())
    }

    /// Polls until the instrument is no longer capturing.
    pub async fn wait_until_idle(&self, phase: Phase, abort: &CancellationToken) -> AppResult<()> {
        let started = Instant::now();
        let deadline = started + self.capture_timeout;
        loop {
            if !self.scope.is_running().await? {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                let waited = now - started;
                warn!("{} capture still running after {:?}, stopping it", phase, waited);
                if let Err(e) = self.scope.stop_sequence().await {
                    warn!("Could not stop {} capture: {}", phase, e);
                }
                return Err(TimelapseError::CaptureTimeout { phase, waited });
            }
            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = abort.cancelled() => {
                    warn!("Aborting {} capture on operator request", phase);
                    if let Err(e) = self.scope.stop_sequence().await {
                        warn!("Could not stop {} capture: {}", phase, e);
                    }
                    return Err(TimelapseError::CaptureAborted { phase });
                }
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}
