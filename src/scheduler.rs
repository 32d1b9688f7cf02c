//! Acquisition cycle scheduler.
//!
//! The scheduler runs `cycle_count` cycles. Each cycle captures phase A1, then phase A2,
//! then sleeps whatever is left of the interval and reaps result windows from older
//! cycles:
//!
//! ```text
//! Idle -> Running(0) -> SleepingForInterval(0) -> Running(1) -> ... -> Idle
//!                 \______________________________________________/
//!                              cancel -> Cancelled(completed)
//! ```
//!
//! # Cancellation
//!
//! A graceful stop ([`RunControl::cancel`]) is observed before each phase starts and
//! during the interval sleep. A capture in flight is never cut short by it, so a cycle is
//! either fully captured or not started. A hard stop ([`RunControl::abort`]) additionally
//! stops the capture in flight.
//!
//! Whatever way the run ends, the sequence directory is reset to the base save directory.
//! If it ends early, the experiment record is saved again with `cycle_count` set to the
//! cycles actually completed.

use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::acquisition::AcquisitionRunner;
use crate::config::AppConfig;
use crate::error::AppResult;
use crate::experiment::{AcquisitionSpec, CycleResult, ExperimentConfig};
use crate::instrument::Microscope;
use crate::reaper::{WindowHandleSet, WindowNamePattern, WindowReaper};
use crate::session::Session;
use crate::settings_store::SettingsStore;
use crate::stopwatch::Stopwatch;

/// Where the scheduler is in its run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    /// Not running.
    Idle,
    /// Capturing cycle `cycle` (zero-based).
    Running {
        /// Current cycle.
        cycle: u32,
    },
    /// Waiting out the rest of the interval after cycle `cycle`.
    SleepingForInterval {
        /// Cycle just finished.
        cycle: u32,
        /// Planned sleep.
        remaining_ms: u64,
    },
    /// Stopped early after `completed` full cycles.
    Cancelled {
        /// Cycles fully captured.
        completed: u32,
    },
}

/// How a run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// All planned cycles ran.
    Completed,
    /// The operator stopped the run.
    Cancelled,
}

/// Result of [`CycleScheduler::run`].
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    /// Cycles requested.
    pub planned_cycles: u32,
    /// Cycles fully captured.
    pub completed_cycles: u32,
    /// How the run ended.
    pub outcome: RunOutcome,
    /// Timing of every completed cycle.
    pub results: Vec<CycleResult>,
    /// Directory the captures were written to.
    pub run_dir: PathBuf,
}

/// What a stop request did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopLevel {
    /// The run ends at the next checkpoint.
    Graceful,
    /// The capture in flight is stopped too.
    Abort,
}

/// Stop signals for a running scheduler.
#[derive(Clone, Debug, Default)]
pub struct RunControl {
    cancel: CancellationToken,
    abort: CancellationToken,
}

impl RunControl {
    /// Fresh, untriggered control.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ends the run at the next checkpoint.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Ends the run and stops the capture in flight.
    pub fn abort(&self) {
        self.cancel.cancel();
        self.abort.cancel();
    }

    /// First call cancels, any further call aborts.
    pub fn request_stop(&self) -> StopLevel {
        if self.cancel.is_cancelled() {
            self.abort();
            StopLevel::Abort
        } else {
            self.cancel();
            StopLevel::Graceful
        }
    }

    /// Whether a stop was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Runs the two-phase time-lapse for one session.
pub struct CycleScheduler<'a, M: Microscope + ?Sized> {
    scope: &'a M,
    runner: AcquisitionRunner<'a, M>,
    reaper: WindowReaper,
    windows: WindowHandleSet,
    experiment: ExperimentConfig,
    specs: [AcquisitionSpec; 2],
    store: SettingsStore,
    save_dir: PathBuf,
    run_dir: PathBuf,
    state: SchedulerState,
    completed: u32,
    results: Vec<CycleResult>,
}

impl<'a, M: Microscope + ?Sized> CycleScheduler<'a, M> {
    /// Scheduler for a prepared session.
    pub fn new(scope: &'a M, config: &AppConfig, session: Session) -> AppResult<Self> {
        let pattern =
            WindowNamePattern::new(&config.acquisition.phase_a1, &config.acquisition.phase_a2)?;
        Ok(Self {
            scope,
            runner: AcquisitionRunner::new(scope, &config.acquisition),
            reaper: WindowReaper::new(pattern),
            windows: WindowHandleSet::new(),
            experiment: session.experiment,
            specs: session.specs,
            store: session.store,
            save_dir: session.save_dir,
            run_dir: session.run_dir,
            state: SchedulerState::Idle,
            completed: 0,
            results: Vec::new(),
        })
    }

    /// Current state.
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Result windows currently tracked.
    pub fn windows(&self) -> &WindowHandleSet {
        &self.windows
    }

    /// Runs every cycle, or until `control` stops the run.
    ///
    /// Instrument faults (including capture timeouts and aborts) end the run with an
    /// error after the completed cycle count has been saved and the directory reset.
    pub async fn run(&mut self, control: &RunControl) -> AppResult<RunSummary> {
        let planned = self.experiment.cycle_count;
        self.completed = 0;
        self.results.clear();
        info!(
            "Starting {} cycle(s), interval {} ms, saving to {}",
            planned,
            self.experiment.interval_ms,
            self.run_dir.display()
        );

        let result = self.run_cycles(control).await;
        match &result {
            Err(e) if e.is_capture_fault() => {
                warn!("Capture did not complete in cycle {}: {}", self.completed, e)
            }
            Err(e) => error!("Run failed after {} cycle(s): {}", self.completed, e),
            Ok(_) => {}
        }

        if let Err(e) = self.scope.set_sequence_directory(&self.save_dir).await {
            warn!(
                "Could not reset sequence directory to {}: {}",
                self.save_dir.display(),
                e
            );
        }

        let ended_early = !matches!(result, Ok(RunOutcome::Completed));
        if ended_early {
            self.state = SchedulerState::Cancelled {
                completed: self.completed,
            };
            let resumed = self.experiment.with_completed_cycles(self.completed);
            if self.store.save(&resumed).await {
                info!(
                    "Saved settings with {} of {} cycle(s) completed",
                    self.completed, planned
                );
            }
        } else {
            self.state = SchedulerState::Idle;
        }

        let outcome = result?;
        info!("Finished in {}", self.run_dir.display());
        Ok(RunSummary {
            planned_cycles: planned,
            completed_cycles: self.completed,
            outcome,
            results: self.results.clone(),
            run_dir: self.run_dir.clone(),
        })
    }

    async fn run_cycles(&mut self, control: &RunControl) -> AppResult<RunOutcome> {
        let planned = self.experiment.cycle_count;
        let interval_ms = self.experiment.interval_ms;
        let mut watch = Stopwatch::new();

        for cycle in 0..planned {
            let iteration = cycle + 1;
            self.state = SchedulerState::Running { cycle };

            if control.cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            watch.mark_start();
            self.runner
                .run(&self.specs[0], iteration, &mut self.windows, &control.abort)
                .await?;
            let phase_a1_ms = watch.mark_elapsed();
            info!("{} took {} ms", self.specs[0].name(), phase_a1_ms);

            if control.cancel.is_cancelled() {
                return Ok(RunOutcome::Cancelled);
            }
            self.runner
                .run(&self.specs[1], iteration, &mut self.windows, &control.abort)
                .await?;
            let total_ms = watch.mark_elapsed();
            let phase_a2_ms = total_ms.saturating_sub(phase_a1_ms);
            info!("{} took {} ms", self.specs[1].name(), phase_a2_ms);
            info!("Acquisition #{} took {} ms", cycle, total_ms);
            self.completed = iteration;

            let mut result = CycleResult {
                cycle_index: cycle,
                phase_a1_ms,
                phase_a2_ms,
                total_ms,
                waited_ms: 0,
            };
            let remaining = result.time_remaining_ms(interval_ms);
            let mut interrupted = false;

            if remaining <= 0 {
                warn!(
                    "Cycle time negative ({} ms over the {} ms interval). Continuing immediately",
                    -remaining, interval_ms
                );
            } else {
                let remaining_ms = interval_ms - total_ms;
                self.state = SchedulerState::SleepingForInterval {
                    cycle,
                    remaining_ms,
                };
                info!("Waiting {} ms before next cycle...", remaining_ms);
                let (waited_ms, cancelled) = sleep_or_cancel(remaining_ms, control).await;
                result.waited_ms = waited_ms;
                interrupted = cancelled;
            }
            self.results.push(result);

            if let Err(e) = self.reaper.reap(self.scope, &mut self.windows).await {
                warn!("Could not close old result windows: {}", e);
            }

            if interrupted && iteration < planned {
                return Ok(RunOutcome::Cancelled);
            }
        }

        Ok(RunOutcome::Completed)
    }
}

/// Sleeps `ms`, returning early on cancellation. Returns the time slept and whether the
/// sleep was cut short.
async fn sleep_or_cancel(ms: u64, control: &RunControl) -> (u64, bool) {
    let mut watch = Stopwatch::new();
    watch.mark_start();
    tokio::select! {
        _ = control.cancel.cancelled() => (watch.mark_elapsed(), true),
        _ = tokio::time::sleep(std::time::Duration::from_millis(ms)) => (ms, false),
    }
}
