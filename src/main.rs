//! Timelapse command line.
//!
//! ## Commands
//!
//! - `run`: set up and run a two-phase time-lapse on the simulated microscope
//! - `show-settings`: print the saved experiment record
//!
//! Press Ctrl-C once to stop after the capture in flight, twice to abort it.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use timelapse_daq::config::AppConfig;
use timelapse_daq::experiment::{ExperimentConfig, Phase};
use timelapse_daq::instrument::mock::MockMicroscope;
use timelapse_daq::instrument::Microscope;
use timelapse_daq::scheduler::{CycleScheduler, RunControl, RunOutcome, StopLevel};
use timelapse_daq::session::{resolve_save_dir, ExperimentSetup};
use timelapse_daq::settings_store::SettingsStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "timelapse")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Two-phase, two-focus microscopy time-lapse scheduler", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, default_value = timelapse_daq::config::DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Base save directory (overrides the configuration)
    #[arg(long, global = true)]
    save_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a time-lapse against the simulated microscope
    Run {
        /// Interval between cycle starts in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Number of cycles
        #[arg(long)]
        cycles: Option<u32>,

        /// File name prefix
        #[arg(long)]
        prefix: Option<String>,

        /// Focus position for A1
        #[arg(long)]
        focus_a1: Option<f64>,

        /// Focus position for A2
        #[arg(long)]
        focus_a2: Option<f64>,

        /// Simulated duration of each capture in milliseconds
        #[arg(long, default_value = "500")]
        capture_ms: u64,
    },

    /// Print the saved experiment settings
    ShowSettings {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(dir) = cli.save_dir {
        config.paths.save_dir = Some(dir);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.application.log_level)),
        )
        .init();

    match cli.command {
        Commands::Run {
            interval_ms,
            cycles,
            prefix,
            focus_a1,
            focus_a2,
            capture_ms,
        } => {
            let scope = MockMicroscope::new()
                .with_capture_duration(Duration::from_millis(capture_ms))
                .with_directory(std::env::current_dir()?);
            let overrides = Overrides {
                interval_ms,
                cycles,
                prefix,
                focus: [focus_a1, focus_a2],
            };
            run(&scope, &mut config, overrides).await
        }
        Commands::ShowSettings { json } => show_settings(&config, json).await,
    }
}

struct Overrides {
    interval_ms: Option<u64>,
    cycles: Option<u32>,
    prefix: Option<String>,
    focus: [Option<f64>; 2],
}

impl Overrides {
    fn apply(&self, experiment: &mut ExperimentConfig) {
        if let Some(interval_ms) = self.interval_ms {
            experiment.interval_ms = interval_ms;
        }
        if let Some(cycles) = self.cycles {
            experiment.cycle_count = cycles;
        }
        if let Some(prefix) = &self.prefix {
            experiment.prefix = prefix.clone();
        }
    }
}

async fn run<M: Microscope>(
    scope: &M,
    config: &mut AppConfig,
    overrides: Overrides,
) -> Result<()> {
    info!("Welcome to the two-phase time-lapse v{}", env!("CARGO_PKG_VERSION"));
    resolve_save_dir(scope, &mut config.paths).await?;
    let config = &*config;

    let setup = ExperimentSetup::new(scope, config);
    let mut experiment = setup.load_experiment().await;
    overrides.apply(&mut experiment);

    let mut crop = None;
    for (phase, focus) in Phase::ALL.into_iter().zip(overrides.focus) {
        setup.begin_phase(phase, &experiment).await?;
        let z = focus.unwrap_or_else(|| experiment.focus(phase));
        scope.set_focus(z).await?;
        if let Some(region) = setup.finish_phase(phase, &mut experiment).await? {
            crop = Some(region);
        }
    }

    let session = setup.prepare(experiment, crop).await?;
    let mut scheduler = CycleScheduler::new(scope, config, session)?;

    let control = RunControl::new();
    let signals = control.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            match signals.request_stop() {
                StopLevel::Graceful => {
                    warn!("Stop requested, finishing the capture in flight (Ctrl-C again to abort)")
                }
                StopLevel::Abort => warn!("Aborting the capture in flight"),
            }
        }
    });

    let summary = scheduler.run(&control).await?;
    match summary.outcome {
        RunOutcome::Completed => info!(
            "Completed {} cycle(s) in {}",
            summary.completed_cycles,
            summary.run_dir.display()
        ),
        RunOutcome::Cancelled => info!(
            "Stopped after {} of {} cycle(s)",
            summary.completed_cycles, summary.planned_cycles
        ),
    }
    Ok(())
}

async fn show_settings(config: &AppConfig, json: bool) -> Result<()> {
    let store = SettingsStore::new(config.paths.settings_path());
    let Some(experiment) = store.try_load::<ExperimentConfig>().await? else {
        println!("No saved settings at {}", store.path().display());
        return Ok(());
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&experiment)?);
    } else {
        for line in experiment.export_lines() {
            println!("{line}");
        }
    }
    Ok(())
}
