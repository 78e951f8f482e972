//! CLI entry point for mx_daq
//!
//! Runs one beamline procedure against the simulated devices and prints every
//! emitted event as a JSON line:
//! - `center`: beam centering over the configured axes
//! - `collect`: a shutter-synchronised rotation collection
//! - `energy`: a monochromator energy change with threshold settle
//! - `config`: print the resolved configuration
//!
//! # Usage
//!
//! ```bash
//! mx_daq center --axis slit1_h --axis slit1_v
//! mx_daq collect --images 100 --exposure 0.1 --increment 0.1 --shutterless
//! mx_daq energy 12.66
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mx_daq::config::BeamlineConfig;
use mx_daq::error::DaqError;
use mx_daq::events::{BeamlineEvent, EventBus};
use mx_daq::hardware::simulated::SimulatedBeamline;
use mx_daq::logging;
use mx_daq::procedures::acquisition::AcquisitionSequencer;
use mx_daq::procedures::centering::{CenteringOrchestrator, CenteringStatus, ScanParameters};
use mx_daq::procedures::lease::BeamLease;
use mx_daq::procedures::plan::AcquisitionPlan;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

#[derive(Parser)]
#[command(name = "mx_daq")]
#[command(about = "MX beamline sequencing against simulated hardware", long_about = None)]
struct Cli {
    /// Beamline configuration file
    #[arg(long, default_value = "config/beamline.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Centre the beam on the configured axes
    Center {
        /// Axes to centre (default: all configured axes)
        #[arg(long = "axis")]
        axes: Vec<String>,

        /// Step for every axis (default: the per-axis configured step)
        #[arg(long)]
        step: Option<f64>,

        /// Sweep half-width for every axis (default: the configured distance)
        #[arg(long)]
        distance: Option<f64>,

        /// Sweep the whole travel range instead of a distance
        #[arg(long)]
        full_path: bool,

        /// Cancel after this many seconds
        #[arg(long)]
        cancel_after: Option<f64>,
    },

    /// Collect a rotation dataset
    Collect {
        #[arg(long, default_value_t = 0.0)]
        start: f64,

        #[arg(long, default_value_t = 0.1)]
        increment: f64,

        #[arg(long, default_value_t = 100)]
        images: u32,

        /// Exposure per frame in seconds
        #[arg(long, default_value_t = 0.1)]
        exposure: f64,

        #[arg(long)]
        shutterless: bool,

        /// Change to this energy (keV) first
        #[arg(long)]
        energy: Option<f64>,

        /// Frames per wedge
        #[arg(long)]
        wedge_size: Option<u32>,

        /// Overlap between wedges in degrees
        #[arg(long, default_value_t = 0.0)]
        overlap: f64,

        #[arg(long, default_value = "/tmp/mx_daq")]
        directory: PathBuf,

        #[arg(long, default_value = "test_1_%05d.cbf")]
        template: String,

        /// Stop the collection after this many seconds
        #[arg(long)]
        stop_after: Option<f64>,
    },

    /// Change the beam energy
    Energy {
        /// Target energy in keV
        kev: f64,

        /// Return without waiting for the threshold to settle
        #[arg(long)]
        no_wait: bool,
    },

    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            let rejected = e
                .downcast_ref::<DaqError>()
                .is_some_and(DaqError::is_rejection);
            if rejected {
                eprintln!("Request rejected before any hardware command was sent");
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = BeamlineConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.validate()?;
    logging::init_from_config(&config)?;

    let events = EventBus::default();
    let printer = print_events(&events);
    let beamline = SimulatedBeamline::from_config(&config);
    let lease = BeamLease::new();

    let result = match cli.command {
        Commands::Center {
            axes,
            step,
            distance,
            full_path,
            cancel_after,
        } => {
            let orchestrator = CenteringOrchestrator::new(
                &config,
                beamline.centering_devices(),
                events.clone(),
                lease,
            )?;
            let plan = centering_plan(&orchestrator, &axes, step, distance, full_path);
            run_centering(&orchestrator, plan, cancel_after).await
        }
        Commands::Collect {
            start,
            increment,
            images,
            exposure,
            shutterless,
            energy,
            wedge_size,
            overlap,
            directory,
            template,
            stop_after,
        } => {
            let coordinator = Arc::new(beamline.energy_coordinator(&config, events.clone())?);
            let sequencer = Arc::new(AcquisitionSequencer::new(
                &config,
                beamline.acquisition_devices(),
                Some(coordinator),
                events.clone(),
                lease,
            ));
            let mut plan = AcquisitionPlan::new(start, increment, images, exposure, shutterless)
                .with_files(directory, template);
            if let Some(kev) = energy {
                plan = plan.with_energy(kev);
            }
            if let Some(size) = wedge_size {
                plan = plan.with_wedges(size, overlap);
            }
            run_collection(sequencer, plan, stop_after).await
        }
        Commands::Energy { kev, no_wait } => {
            let coordinator = beamline.energy_coordinator(&config, events.clone())?;
            coordinator.set_energy(kev, !no_wait).await?;
            let (min, max) = coordinator.energy_limits().await?;
            println!(
                "Energy {:.4} keV, wavelength {:.4} Å (range {min:.3}..{max:.3} keV)",
                coordinator.current_energy().await?,
                coordinator.current_wavelength().await?
            );
            Ok(())
        }
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    };

    // Give the printer a chance to drain what is buffered.
    tokio::time::sleep(Duration::from_millis(50)).await;
    printer.abort();
    result
}

fn centering_plan(
    orchestrator: &CenteringOrchestrator,
    axes: &[String],
    step: Option<f64>,
    distance: Option<f64>,
    full_path: bool,
) -> Vec<ScanParameters> {
    orchestrator
        .defaults()
        .into_iter()
        .map(|defaults| ScanParameters {
            enabled: axes.is_empty() || axes.contains(&defaults.axis),
            distance: if full_path { None } else { distance.or(defaults.distance) },
            step: step.or(defaults.step),
            full_path,
            axis: defaults.axis,
        })
        .collect()
}

async fn run_centering(
    orchestrator: &CenteringOrchestrator,
    plan: Vec<ScanParameters>,
    cancel_after: Option<f64>,
) -> Result<()> {
    orchestrator.start(plan)?;
    if let Some(seconds) = cancel_after {
        tokio::select! {
            _ = orchestrator.wait_until_done() => {}
            _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => orchestrator.cancel().await?,
        }
    }

    match orchestrator.wait_until_done().await {
        CenteringStatus::Failed(message) => anyhow::bail!("centering failed: {message}"),
        status => {
            println!("Centering ended: {status:?}");
            for (axis, position) in orchestrator.last_centred_positions() {
                println!("  {axis}: {position:.4}");
            }
            Ok(())
        }
    }
}

async fn run_collection(
    sequencer: Arc<AcquisitionSequencer>,
    plan: AcquisitionPlan,
    stop_after: Option<f64>,
) -> Result<()> {
    let stopper = stop_after.map(|seconds| {
        let sequencer = sequencer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
            sequencer.stop_collect().await
        })
    });

    let result = sequencer.collect(plan).await;
    if let Some(stopper) = stopper {
        if matches!(result, Err(DaqError::Cancelled)) {
            // Collect has already waited for the safing; this picks up its outcome.
            match stopper.await {
                Ok(Err(e)) => tracing::error!(error = %e, "Stop finished with errors"),
                Err(e) => tracing::error!(error = %e, "Stop task failed"),
                Ok(Ok(())) => {}
            }
        } else {
            // The timer has not fired, or the stop found nothing to claim.
            stopper.abort();
        }
    }
    let report = result?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Print every event as a timestamped JSON line until aborted.
fn print_events(events: &EventBus) -> JoinHandle<()> {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event printer lagging");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn print_event(event: &BeamlineEvent) {
    let line = serde_json::json!({
        "time": chrono::Utc::now().to_rfc3339(),
        "payload": event,
    });
    println!("{line}");
}
