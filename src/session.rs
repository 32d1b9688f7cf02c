//! Experiment setup and session preparation.
//!
//! Setting up a run follows the operator's workflow at the microscope:
//!
//! 0. [`resolve_save_dir`] takes the base save directory from the instrument when the
//!    configuration does not name one.
//! 1. [`ExperimentSetup::load_experiment`] restores the previous experiment record, or
//!    defaults on a first run.
//! 2. For each phase, [`ExperimentSetup::begin_phase`] loads the previous configuration
//!    bundle (and, for A2, the saved laser powers) so the operator starts from last time's
//!    settings. The operator then adjusts the instrument interactively.
//! 3. [`ExperimentSetup::finish_phase`] records the focus, saves the bundle and, for A1,
//!    the camera crop region if exactly one region is drawn.
//! 4. [`ExperimentSetup::prepare`] creates the run directory, persists the record, writes
//!    the text export and builds the two acquisition specs.
//!
//! The interactive dialogs themselves live outside this crate.

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{AppConfig, PathsConfig};
use crate::error::AppResult;
use crate::experiment::{AcquisitionSpec, ExperimentConfig, Phase};
use crate::instrument::{BundleHandle, CropRegion, Microscope};
use crate::laser::LaserPowerSync;
use crate::settings_store::{export_text, SettingsStore};

/// A prepared run, ready for the scheduler.
#[derive(Debug, Clone)]
pub struct Session {
    /// Experiment parameters for this run.
    pub experiment: ExperimentConfig,
    /// Acquisition specs for A1 and A2, in that order.
    pub specs: [AcquisitionSpec; 2],
    /// Store the experiment record is persisted to.
    pub store: SettingsStore,
    /// Base save directory; the sequence directory is reset to it after the run.
    pub save_dir: PathBuf,
    /// Timestamped directory receiving this run's captures.
    pub run_dir: PathBuf,
}

/// Drives the setup steps against one instrument.
pub struct ExperimentSetup<'a, M: Microscope + ?Sized> {
    scope: &'a M,
    config: &'a AppConfig,
    store: SettingsStore,
}

impl<'a, M: Microscope + ?Sized> ExperimentSetup<'a, M> {
    /// Setup for `scope` using the files named in `config`.
    pub fn new(scope: &'a M, config: &'a AppConfig) -> Self {
        Self {
            scope,
            config,
            store: SettingsStore::new(config.paths.settings_path()),
        }
    }

    fn lasers(&self) -> LaserPowerSync<'a, M> {
        LaserPowerSync::new(
            self.scope,
            self.config.lasers.clone(),
            self.config.acquisition.panel_settle(),
        )
    }

    fn bundle(&self, phase: Phase) -> BundleHandle {
        BundleHandle::new(self.config.paths.bundle_path(phase))
    }

    /// The previous experiment record, or the configured defaults.
    pub async fn load_experiment(&self) -> ExperimentConfig {
        match self.store.load::<ExperimentConfig>().await {
            Some(experiment) => {
                info!(
                    "Loaded previous settings: {} cycle(s), interval {} ms",
                    experiment.cycle_count, experiment.interval_ms
                );
                experiment
            }
            None => self.config.defaults.to_experiment(),
        }
    }

    /// Restores last time's settings for `phase` onto the instrument.
    ///
    /// A missing bundle is expected on a first run and only logged.
    pub async fn begin_phase(&self, phase: Phase, experiment: &ExperimentConfig) -> AppResult<()> {
        if let Err(e) = self.scope.load_settings(&self.bundle(phase)).await {
            info!("{}: No previous {} settings exist", e, phase);
        }
        if phase == Phase::A2 && !experiment.laser_powers.is_empty() {
            self.lasers().sync_all(&experiment.laser_powers).await?;
        }
        Ok(())
    }

    /// Captures what the operator configured for `phase`.
    ///
    /// Returns the crop region saved for A1, if the operator drew exactly one.
    pub async fn finish_phase(
        &self,
        phase: Phase,
        experiment: &mut ExperimentConfig,
    ) -> AppResult<Option<CropRegion>> {
        let mut crop = None;
        if phase == Phase::A1 {
            let regions = self.scope.region_count().await?;
            if regions == 1 {
                let region = CropRegion::new(self.config.paths.crop_region_path());
                self.scope.save_camera_region(&region).await?;
                info!("Saved camera crop region");
                crop = Some(region);
            } else {
                info!("{} region(s) drawn, acquiring the full camera area", regions);
            }
        }

        let z = self.scope.focus().await?;
        experiment.set_focus(phase, z);
        self.scope.save_settings(&self.bundle(phase)).await?;

        if phase == Phase::A2 {
            experiment.laser_powers = self.lasers().read_all().await?;
        }
        info!("{} configured at z={}", phase, z);
        Ok(crop)
    }

    /// Creates the run directory, persists the experiment and builds the specs.
    pub async fn prepare(
        &self,
        experiment: ExperimentConfig,
        crop_region: Option<CropRegion>,
    ) -> AppResult<Session> {
        let save_dir = self.config.paths.base_dir().to_path_buf();
        let run_dir = create_run_dir(&save_dir).await?;

        self.store.save(&experiment).await;
        export_text(&run_dir.join(&self.config.paths.export_file), &experiment).await;

        let specs = Phase::ALL.map(|phase| AcquisitionSpec {
            phase,
            config_handle: self.bundle(phase),
            crop_region: crop_region.clone(),
            focus: experiment.focus(phase),
            output_dir: run_dir.clone(),
            base_name: format!("{}-{}", self.config.acquisition.tag(phase), experiment.prefix),
        });

        Ok(Session {
            experiment,
            specs,
            store: self.store.clone(),
            save_dir,
            run_dir,
        })
    }
}

/// Fills in the base save directory from the instrument's current sequence directory
/// unless one is configured. Returns the directory in use.
pub async fn resolve_save_dir<M: Microscope + ?Sized>(
    scope: &M,
    paths: &mut PathsConfig,
) -> AppResult<PathBuf> {
    if let Some(dir) = &paths.save_dir {
        return Ok(dir.clone());
    }
    let dir = scope.sequence_directory().await?;
    info!("Saving under the current sequence directory {}", dir.display());
    paths.save_dir = Some(dir.clone());
    Ok(dir)
}

/// Creates `<save_dir>/<unix seconds>`, adding a suffix if that name is taken.
async fn create_run_dir(save_dir: &Path) -> AppResult<PathBuf> {
    let stamp = chrono::Utc::now().timestamp();
    let mut run_dir = save_dir.join(stamp.to_string());
    let mut n = 1;
    while tokio::fs::try_exists(&run_dir).await? {
        warn!("{} already exists", run_dir.display());
        run_dir = save_dir.join(format!("{stamp}-{n}"));
        n += 1;
    }
    tokio::fs::create_dir_all(&run_dir).await?;
    Ok(run_dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::{MockCall, MockMicroscope};
    use tempfile::tempdir;

    fn config_in(dir: &Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.paths.save_dir = Some(dir.to_path_buf());
        config.acquisition.panel_settle_ms = 0;
        config
    }

    #[tokio::test]
    async fn test_save_dir_defaults_to_sequence_directory() {
        let dir = tempdir().unwrap();
        let scope = MockMicroscope::new().with_directory(dir.path());
        let mut config = AppConfig::default();
        config.acquisition.panel_settle_ms = 0;

        let resolved = resolve_save_dir(&scope, &mut config.paths).await.unwrap();
        assert_eq!(resolved, dir.path());
        assert_eq!(config.paths.settings_path(), dir.path().join("expt-settings.bin"));

        let session = ExperimentSetup::new(&scope, &config)
            .prepare(ExperimentConfig::default(), None)
            .await
            .unwrap();
        assert_eq!(session.save_dir, dir.path());
        assert!(session.run_dir.starts_with(dir.path()));
    }

    #[tokio::test]
    async fn test_configured_save_dir_wins() {
        let dir = tempdir().unwrap();
        let scope = MockMicroscope::new().with_directory("/instrument/default");
        let mut config = config_in(dir.path());

        let resolved = resolve_save_dir(&scope, &mut config.paths).await.unwrap();
        assert_eq!(resolved, dir.path());
        assert_eq!(config.paths.save_dir.as_deref(), Some(dir.path()));
    }

    #[tokio::test]
    async fn test_first_run_uses_defaults() {
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.defaults.cycle_count = 12;
        let scope = MockMicroscope::new();
        let setup = ExperimentSetup::new(&scope, &config);

        let experiment = setup.load_experiment().await;
        assert_eq!(experiment.cycle_count, 12);
        assert!(experiment.laser_powers.is_empty());
    }

    #[tokio::test]
    async fn test_missing_bundle_is_not_an_error() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let scope = MockMicroscope::new().require_saved_bundles();
        let setup = ExperimentSetup::new(&scope, &config);

        let experiment = ExperimentConfig::default();
        assert!(setup.begin_phase(Phase::A1, &experiment).await.is_ok());
    }

    #[tokio::test]
    async fn test_finish_phase_records_focus_and_crop() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let scope = MockMicroscope::new().with_region_count(1);
        scope.set_focus(2048.5).await.unwrap();
        let setup = ExperimentSetup::new(&scope, &config);
        let mut experiment = ExperimentConfig::default();

        let crop = setup.finish_phase(Phase::A1, &mut experiment).await.unwrap();

        assert_eq!(experiment.focus_a1, 2048.5);
        assert_eq!(
            crop,
            Some(CropRegion::new(dir.path().join("crop-area-camera")))
        );
        let calls = scope.calls().await;
        assert!(calls.contains(&MockCall::SaveSettings(dir.path().join("biop-macro-a1.acq"))));
    }

    #[tokio::test]
    async fn test_no_crop_without_single_region() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let scope = MockMicroscope::new().with_region_count(2);
        let setup = ExperimentSetup::new(&scope, &config);
        let mut experiment = ExperimentConfig::default();

        assert_eq!(
            setup.finish_phase(Phase::A1, &mut experiment).await.unwrap(),
            None
        );
        assert_eq!(
            setup.finish_phase(Phase::A2, &mut experiment).await.unwrap(),
            None
        );
        assert_eq!(experiment.laser_powers.len(), 4);
    }

    #[tokio::test]
    async fn test_previous_laser_powers_restored_for_a2() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let scope = MockMicroscope::new();
        let setup = ExperimentSetup::new(&scope, &config);
        let mut experiment = ExperimentConfig::default();
        experiment.laser_powers.insert("488".into(), 17.0);

        setup.begin_phase(Phase::A1, &experiment).await.unwrap();
        assert_eq!(scope.sliders().await["Toptica488_Laser488"], 0.0);

        setup.begin_phase(Phase::A2, &experiment).await.unwrap();
        assert_eq!(scope.sliders().await["Toptica488_Laser488"], 17.0);
    }

    #[tokio::test]
    async fn test_prepare_persists_and_builds_specs() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());
        let scope = MockMicroscope::new();
        let setup = ExperimentSetup::new(&scope, &config);
        let mut experiment = ExperimentConfig::default();
        experiment.prefix = "yeast".into();
        experiment.focus_a1 = 10.0;
        experiment.focus_a2 = 12.0;

        let session = setup.prepare(experiment.clone(), None).await.unwrap();

        assert!(session.run_dir.starts_with(dir.path()));
        assert!(session.run_dir.join("Settings.txt").is_file());
        assert_eq!(setup.load_experiment().await, experiment);

        let [a1, a2] = &session.specs;
        assert_eq!(a1.base_name, "A1-yeast");
        assert_eq!(a2.base_name, "A2-yeast");
        assert_eq!(a1.focus, 10.0);
        assert_eq!(a2.focus, 12.0);
        assert_eq!(a2.output_dir, session.run_dir);
        assert!(a1.crop_region.is_none());
    }

    #[tokio::test]
    async fn test_run_dirs_are_unique() {
        let dir = tempdir().unwrap();
        let first = create_run_dir(dir.path()).await.unwrap();
        let second = create_run_dir(dir.path()).await.unwrap();
        assert_ne!(first, second);
        assert!(first.is_dir() && second.is_dir());
    }
}
