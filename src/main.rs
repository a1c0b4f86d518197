//! daq-fleet: command-line front end of the fleet orchestrator.
//!
//! ```text
//! daq-fleet check-config
//! daq-fleet status
//! daq-fleet runs --output runs.csv
//! daq-fleet simulate --poll-ms 200
//! daq-fleet control < requests.jsonl
//! ```
//!
//! `simulate` and `control` talk to simulated device controllers. Pass
//! `--data-dir` to run the post-run jobs against the local filesystem.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use daq_fleet::client::mock::{Completion, MockClientProvider};
use daq_fleet::config::{Settings, DEFAULT_CONFIG_PATH};
use daq_fleet::control::ControlService;
use daq_fleet::device::{DeviceState, OverallState, TargetState};
use daq_fleet::export;
use daq_fleet::fleet::{fleet_status, FleetCoordinator};
use daq_fleet::ids::ExperimentId;
use daq_fleet::inventory::Inventory;
use daq_fleet::log_capture::LogBuffer;
use daq_fleet::logging;
use daq_fleet::store::Store;
use daq_fleet::worker::local::{LocalWorkerAgent, LocalWorkerProvider};
use daq_fleet::worker::mock::MockWorkerProvider;
use daq_fleet::worker::WorkerProvider;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "daq-fleet", about = "ECC device fleet orchestrator")]
struct Cli {
    /// Settings file
    #[arg(long, short, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the settings and the inventory.
    CheckConfig,
    /// Print the status of the active experiment as JSON.
    Status,
    /// Export the run metadata of the active experiment as CSV.
    Runs {
        /// Write to this file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Drive the active experiment through Idle → Running → Idle against simulated controllers.
    Simulate {
        /// State reconciliation period in milliseconds (overrides the settings)
        #[arg(long)]
        poll_ms: Option<u64>,
        /// Run post-run jobs against this local staging directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Number of Idle → Running → Idle cycles
        #[arg(long, default_value = "1")]
        cycles: u32,
    },
    /// Serve JSON control requests from stdin, one per line.
    Control {
        /// Run post-run jobs against this local staging directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    if let Command::Simulate {
        poll_ms: Some(ms), ..
    } = &cli.command
    {
        settings.reconciliation.state_interval_ms = *ms;
    }

    let logs = LogBuffer::with_capacity(settings.application.log_buffer_capacity);
    logging::init(&settings.application, &logs)?;

    match cli.command {
        Command::CheckConfig => check_config(&settings),
        Command::Status => {
            let store = load_store(&settings)?;
            let experiment = store.require_active()?;
            let status = fleet_status(&store, experiment.id)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        }
        Command::Runs { output } => export_runs(&settings, output),
        Command::Simulate {
            data_dir, cycles, ..
        } => simulate(settings, data_dir, cycles).await,
        Command::Control { data_dir } => control(settings, logs, data_dir).await,
    }
}

fn check_config(settings: &Settings) -> anyhow::Result<()> {
    let store = load_store(settings)?;
    for experiment in store.experiments() {
        println!(
            "{}{}: {} devices, {} routers",
            experiment.name,
            if experiment.is_active { " (active)" } else { "" },
            store.devices_in(experiment.id).len(),
            store.routers_in(experiment.id).len(),
        );
    }
    println!("Configuration OK");
    Ok(())
}

fn export_runs(settings: &Settings, output: Option<PathBuf>) -> anyhow::Result<()> {
    let store = load_store(settings)?;
    let experiment = store.require_active()?;
    let rows = match &output {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("creating {}", path.display()))?;
            export::write_run_metadata(&store, experiment.id, file)?
        }
        None => export::write_run_metadata(&store, experiment.id, std::io::stdout().lock())?,
    };
    info!(experiment = %experiment.name, rows, "Run metadata written");
    Ok(())
}

/// Snapshot when one is configured and present, else the inventory file.
fn load_store(settings: &Settings) -> anyhow::Result<Store> {
    if let Some(path) = &settings.inventory.snapshot_path {
        if path.exists() {
            info!(path = %path.display(), "Loading store snapshot");
            return Ok(Store::load_snapshot(path)?);
        }
    }
    let path = &settings.inventory.path;
    let inventory = Inventory::load(path)
        .with_context(|| format!("loading inventory from {}", path.display()))?;
    Ok(inventory.into_store()?)
}

fn worker_provider(data_dir: Option<PathBuf>) -> Arc<dyn WorkerProvider> {
    match data_dir {
        Some(dir) => Arc::new(LocalWorkerProvider::new(LocalWorkerAgent::new(dir))),
        None => Arc::new(MockWorkerProvider::new()),
    }
}

fn save_snapshot(settings: &Settings, store: &Store) {
    if let Some(path) = &settings.inventory.snapshot_path {
        match store.save_snapshot(path) {
            Ok(()) => info!(path = %path.display(), "Saved store snapshot"),
            Err(e) => error!(path = %path.display(), "Could not save store snapshot: {}", e),
        }
    }
}

async fn simulate(settings: Settings, data_dir: Option<PathBuf>, cycles: u32) -> anyhow::Result<()> {
    let store = Arc::new(load_store(&settings)?);
    let experiment = store.require_active()?;
    let fleet = FleetCoordinator::start(
        &settings,
        store.clone(),
        Arc::new(MockClientProvider::new(Completion::OnNextPoll)),
        worker_provider(data_dir),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = fleet.clone();
    let reconcile_handle = tokio::spawn(async move {
        reconciler.run_reconciliation(shutdown_rx).await;
    });

    let settle = Duration::from_millis(settings.reconciliation.state_interval_ms * 10)
        + settings.timeouts.transition.hard();
    let outcome = drive_cycles(&fleet, experiment.id, cycles, settle).await;

    fleet.dispatcher().wait_idle(settle).await;
    let _ = shutdown_tx.send(true);
    if let Err(e) = reconcile_handle.await {
        error!("Reconciliation task failed: {}", e);
    }
    fleet.shutdown(settings.dispatcher.shutdown_timeout()).await;
    save_snapshot(&settings, &store);
    outcome
}

async fn drive_cycles(
    fleet: &FleetCoordinator,
    experiment: ExperimentId,
    cycles: u32,
    settle: Duration,
) -> anyhow::Result<()> {
    let path = [
        DeviceState::Described,
        DeviceState::Prepared,
        DeviceState::Ready,
        DeviceState::Running,
        DeviceState::Ready,
        DeviceState::Prepared,
        DeviceState::Described,
        DeviceState::Idle,
    ];

    for cycle in 0..cycles {
        info!(cycle, experiment = %experiment, "Starting simulated cycle");
        for target in path {
            let result = fleet
                .transition_fleet(experiment, TargetState::State(target))
                .await?;
            if let Some(run) = &result.run_started {
                info!(run_number = run.run_number, "Run started");
            }
            if let Some(run) = &result.run_stopped {
                info!(run_number = run.run_number, "Run stopped");
            }
            if !wait_for(fleet, experiment, target, settle).await {
                warn!(target = %target, "Fleet did not settle in time");
                bail!("fleet did not reach {} within {:?}", target, settle);
            }
            let status = fleet.status(experiment)?;
            println!("{}", serde_json::to_string(&status)?);
        }
    }
    Ok(())
}

/// Wait until every device reports `target` and nothing is in flight.
async fn wait_for(
    fleet: &FleetCoordinator,
    experiment: ExperimentId,
    target: DeviceState,
    limit: Duration,
) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        let devices = fleet.store().devices_in(experiment);
        let settled = OverallState::of(devices.iter().map(|d| d.state))
            == OverallState::Unanimous(target)
            && devices.iter().all(|d| !d.transitioning);
        if settled {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(50)).await;
    }
}

async fn control(settings: Settings, logs: LogBuffer, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let store = Arc::new(load_store(&settings)?);
    let fleet = FleetCoordinator::start(
        &settings,
        store.clone(),
        Arc::new(MockClientProvider::new(Completion::OnNextPoll)),
        worker_provider(data_dir),
    );
    let service = ControlService::new(fleet.clone(), logs);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = fleet.clone();
    let reconcile_handle = tokio::spawn(async move {
        reconciler.run_reconciliation(shutdown_rx).await;
    });

    let outcome = serve(&service).await;

    let _ = shutdown_tx.send(true);
    if let Err(e) = reconcile_handle.await {
        error!("Reconciliation task failed: {}", e);
    }
    fleet.shutdown(settings.dispatcher.shutdown_timeout()).await;
    save_snapshot(&settings, &store);
    outcome
}

/// Answer one JSON request per stdin line until EOF or Ctrl-C.
async fn serve(service: &ControlService) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { return Ok(()) };
                if line.trim().is_empty() {
                    continue;
                }
                let mut response = service.handle_json(&line).await;
                response.push('\n');
                stdout.write_all(response.as_bytes()).await?;
                stdout.flush().await?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                return Ok(());
            }
        }
    }
}
