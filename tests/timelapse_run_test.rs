//! End-to-end scheduler runs against the simulated microscope.
//!
//! All tests run on a paused tokio clock, so captures and interval sleeps take
//! simulated time only.

use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;
use timelapse_daq::config::AppConfig;
use timelapse_daq::experiment::{ExperimentConfig, Phase};
use timelapse_daq::instrument::mock::{MockCall, MockMicroscope};
use timelapse_daq::instrument::Microscope;
use timelapse_daq::scheduler::{CycleScheduler, RunControl, RunOutcome, SchedulerState};
use timelapse_daq::session::{resolve_save_dir, ExperimentSetup, Session};
use timelapse_daq::settings_store::SettingsStore;
use timelapse_daq::TimelapseError;

fn test_config(save_dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.paths.save_dir = Some(save_dir.to_path_buf());
    config.acquisition.poll_interval_ms = 10;
    config.acquisition.panel_settle_ms = 0;
    config
}

fn experiment(cycles: u32, interval_ms: u64) -> ExperimentConfig {
    ExperimentConfig {
        interval_ms,
        cycle_count: cycles,
        prefix: "cells".to_string(),
        focus_a1: 100.0,
        focus_a2: 105.0,
        ..ExperimentConfig::default()
    }
}

/// Runs the setup steps the operator would go through, then prepares the session.
async fn prepare(
    scope: &MockMicroscope,
    config: &AppConfig,
    mut experiment: ExperimentConfig,
) -> Session {
    let setup = ExperimentSetup::new(scope, config);
    let mut crop = None;
    for phase in Phase::ALL {
        setup.begin_phase(phase, &experiment).await.unwrap();
        scope.set_focus(experiment.focus(phase)).await.unwrap();
        if let Some(region) = setup.finish_phase(phase, &mut experiment).await.unwrap() {
            crop = Some(region);
        }
    }
    setup.prepare(experiment, crop).await.unwrap()
}

async fn saved_cycle_count(config: &AppConfig) -> u32 {
    let store = SettingsStore::new(config.paths.settings_path());
    let saved: ExperimentConfig = store.load().await.expect("settings were saved");
    saved.cycle_count
}

fn count(calls: &[MockCall], pred: impl Fn(&MockCall) -> bool) -> usize {
    calls.iter().filter(|c| pred(c)).count()
}

#[tokio::test(start_paused = true)]
async fn test_uninterrupted_run_alternates_phases() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let scope = MockMicroscope::new().with_capture_duration(Duration::from_millis(100));
    let session = prepare(&scope, &config, experiment(3, 1_000)).await;
    let mut scheduler = CycleScheduler::new(&scope, &config, session).unwrap();

    let summary = scheduler.run(&RunControl::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.completed_cycles, 3);
    assert_eq!(scheduler.state(), SchedulerState::Idle);

    let calls = scope.calls().await;
    assert_eq!(count(&calls, |c| matches!(c, MockCall::StartSequence)), 6);
    let names: Vec<String> = calls
        .iter()
        .filter_map(|c| match c {
            MockCall::SetBaseName(name) => Some(name.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        names,
        vec!["A1-cells", "A2-cells", "A1-cells", "A2-cells", "A1-cells", "A2-cells"]
    );

    assert_eq!(saved_cycle_count(&config).await, 3);
    assert_eq!(scope.directory().await, dir.path());
    assert_eq!(
        calls.last(),
        Some(&MockCall::SetDirectory(dir.path().to_path_buf()))
    );
}

#[tokio::test(start_paused = true)]
async fn test_interval_accounting() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let scope = MockMicroscope::new().with_capture_durations([
        Duration::from_millis(200),
        Duration::from_millis(300),
        Duration::from_millis(400),
        Duration::from_millis(100),
        Duration::from_millis(250),
        Duration::from_millis(250),
    ]);
    let session = prepare(&scope, &config, experiment(3, 2_000)).await;
    let mut scheduler = CycleScheduler::new(&scope, &config, session).unwrap();

    let start = tokio::time::Instant::now();
    let summary = scheduler.run(&RunControl::new()).await.unwrap();
    let elapsed = start.elapsed();

    let results = &summary.results;
    assert_eq!(results.len(), 3);
    for result in results {
        assert_eq!(result.phase_a1_ms + result.phase_a2_ms, result.total_ms);
        assert_eq!(result.waited_ms, 2_000 - result.total_ms);
    }
    assert!(results[0].phase_a1_ms >= 200 && results[0].phase_a1_ms < 220);
    assert!(results[0].phase_a2_ms >= 300 && results[0].phase_a2_ms < 320);
    assert_eq!(results[2].waited_ms, 2_000 - results[2].total_ms);

    let expected = Duration::from_millis(6_000);
    assert!(elapsed >= expected, "{elapsed:?} < {expected:?}");
    assert!(elapsed < expected + Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn test_final_cycle_waits_out_interval() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let scope = MockMicroscope::new().with_capture_duration(Duration::from_millis(100));
    let session = prepare(&scope, &config, experiment(1, 1_000)).await;
    let mut scheduler = CycleScheduler::new(&scope, &config, session).unwrap();

    let start = tokio::time::Instant::now();
    let summary = scheduler.run(&RunControl::new()).await.unwrap();
    let elapsed = start.elapsed();

    let result = &summary.results[0];
    assert_eq!(result.waited_ms, 1_000 - result.total_ms);
    assert!(elapsed >= Duration::from_millis(1_000));
    assert!(elapsed < Duration::from_millis(1_050));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_final_interval_still_completes() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let scope = MockMicroscope::new().with_capture_duration(Duration::from_millis(100));
    let session = prepare(&scope, &config, experiment(2, 1_000)).await;
    let mut scheduler = CycleScheduler::new(&scope, &config, session).unwrap();

    let control = RunControl::new();
    let trigger = control.clone();
    tokio::spawn(async move {
        // Second cycle ends at ~1.2s and sleeps until ~2s.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        trigger.cancel();
    });

    let summary = scheduler.run(&control).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.completed_cycles, 2);
    assert!(summary.results[1].waited_ms < 1_000 - summary.results[1].total_ms);
    assert_eq!(saved_cycle_count(&config).await, 2);
    assert_eq!(scheduler.state(), SchedulerState::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_over_budget_cycle_does_not_sleep() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let scope = MockMicroscope::new().with_capture_duration(Duration::from_millis(600));
    let session = prepare(&scope, &config, experiment(2, 1_000)).await;
    let mut scheduler = CycleScheduler::new(&scope, &config, session).unwrap();

    let summary = scheduler.run(&RunControl::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert!(summary.results.iter().all(|r| r.total_ms >= 1_200));
    assert!(summary.results.iter().all(|r| r.waited_ms == 0));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_interval_persists_completed_cycles() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let scope = MockMicroscope::new().with_capture_duration(Duration::from_millis(100));
    let session = prepare(&scope, &config, experiment(5, 1_000)).await;
    let mut scheduler = CycleScheduler::new(&scope, &config, session).unwrap();

    let control = RunControl::new();
    let trigger = control.clone();
    tokio::spawn(async move {
        // Cycle 1 ends at ~1.2s and sleeps until ~2s.
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        trigger.cancel();
    });

    let summary = scheduler.run(&control).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert_eq!(summary.completed_cycles, 2);
    assert_eq!(summary.planned_cycles, 5);
    assert_eq!(
        scheduler.state(),
        SchedulerState::Cancelled { completed: 2 }
    );
    assert_eq!(saved_cycle_count(&config).await, 2);
    assert_eq!(scope.directory().await, dir.path());

    let calls = scope.calls().await;
    assert_eq!(count(&calls, |c| matches!(c, MockCall::StartSequence)), 4);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_capture_lets_capture_finish() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let scope = MockMicroscope::new().with_capture_duration(Duration::from_millis(100));
    let session = prepare(&scope, &config, experiment(5, 1_000)).await;
    let mut scheduler = CycleScheduler::new(&scope, &config, session).unwrap();

    let control = RunControl::new();
    let trigger = control.clone();
    tokio::spawn(async move {
        // Lands while A1 of cycle 1 is capturing.
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        trigger.cancel();
    });

    let summary = scheduler.run(&control).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Cancelled);
    assert_eq!(summary.completed_cycles, 1);
    assert_eq!(saved_cycle_count(&config).await, 1);

    let calls = scope.calls().await;
    assert_eq!(count(&calls, |c| matches!(c, MockCall::StartSequence)), 3);
    assert_eq!(count(&calls, |c| matches!(c, MockCall::StopSequence)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_capture_timeout_ends_run_and_saves_progress() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.acquisition.capture_timeout_ms = 500;
    let scope = MockMicroscope::new().with_capture_durations([
        Duration::from_millis(100),
        Duration::from_millis(100),
        Duration::from_secs(60),
    ]);
    let session = prepare(&scope, &config, experiment(4, 1_000)).await;
    let mut scheduler = CycleScheduler::new(&scope, &config, session).unwrap();

    let err = scheduler.run(&RunControl::new()).await.unwrap_err();

    assert!(matches!(
        err,
        TimelapseError::CaptureTimeout {
            phase: Phase::A1,
            ..
        }
    ));
    assert_eq!(saved_cycle_count(&config).await, 1);
    assert_eq!(scope.directory().await, dir.path());
    assert!(!scope.is_running().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_abort_stops_capture_in_flight() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let scope = MockMicroscope::new().with_capture_durations([
        Duration::from_millis(100),
        Duration::from_millis(100),
        Duration::from_secs(30),
    ]);
    let session = prepare(&scope, &config, experiment(3, 1_000)).await;
    let mut scheduler = CycleScheduler::new(&scope, &config, session).unwrap();

    let control = RunControl::new();
    let trigger = control.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        trigger.request_stop();
        trigger.request_stop();
    });

    let err = scheduler.run(&control).await.unwrap_err();

    assert!(matches!(err, TimelapseError::CaptureAborted { .. }));
    assert_eq!(saved_cycle_count(&config).await, 1);
    let calls = scope.calls().await;
    assert_eq!(count(&calls, |c| matches!(c, MockCall::StopSequence)), 1);
}

#[tokio::test(start_paused = true)]
async fn test_only_latest_cycle_windows_stay_open() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let scope = MockMicroscope::new().with_windows(["Live"]);
    let session = prepare(&scope, &config, experiment(3, 500)).await;
    let mut scheduler = CycleScheduler::new(&scope, &config, session).unwrap();

    scheduler.run(&RunControl::new()).await.unwrap();

    assert_eq!(
        scope.window_names().await,
        vec!["Live", "A1-cells-3", "A2-cells-3"]
    );
    assert_eq!(scheduler.windows().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_crop_region_applied_every_phase() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let scope = MockMicroscope::new().with_region_count(1);
    let session = prepare(&scope, &config, experiment(2, 500)).await;
    assert!(session.specs.iter().all(|s| s.crop_region.is_some()));
    let mut scheduler = CycleScheduler::new(&scope, &config, session).unwrap();

    scheduler.run(&RunControl::new()).await.unwrap();

    let calls = scope.calls().await;
    assert_eq!(
        count(&calls, |c| matches!(c, MockCall::LoadCameraRegion(_))),
        4
    );
}

#[tokio::test(start_paused = true)]
async fn test_zero_cycles_is_a_completed_noop() {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path());
    let scope = MockMicroscope::new();
    let session = prepare(&scope, &config, experiment(0, 1_000)).await;
    let mut scheduler = CycleScheduler::new(&scope, &config, session).unwrap();

    let summary = scheduler.run(&RunControl::new()).await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Completed);
    assert_eq!(summary.completed_cycles, 0);
    let calls = scope.calls().await;
    assert_eq!(count(&calls, |c| matches!(c, MockCall::StartSequence)), 0);
    assert_eq!(scope.directory().await, dir.path());
}

#[tokio::test(start_paused = true)]
async fn test_unconfigured_save_dir_resets_to_instrument_directory() {
    let dir = tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.paths.save_dir = None;
    let scope = MockMicroscope::new().with_directory(dir.path());
    resolve_save_dir(&scope, &mut config.paths).await.unwrap();
    let session = prepare(&scope, &config, experiment(1, 500)).await;
    let run_dir = session.run_dir.clone();
    let mut scheduler = CycleScheduler::new(&scope, &config, session).unwrap();

    scheduler.run(&RunControl::new()).await.unwrap();

    assert!(run_dir.starts_with(dir.path()));
    assert_eq!(scope.directory().await, dir.path());
    assert_eq!(saved_cycle_count(&config).await, 1);
    let calls = scope.calls().await;
    assert!(calls.contains(&MockCall::SetDirectory(run_dir)));
}
