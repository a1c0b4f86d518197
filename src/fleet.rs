//! Fleet coordination: experiment-wide transitions, aggregate state and run gating.
//!
//! [`FleetCoordinator::transition_fleet`] submits one transition per device and
//! returns as soon as they are queued. Per-device failures are recorded in the
//! [`FleetResult`] and never abort the batch. The run lifecycle is coupled to
//! the *requested* target, not to confirmed device states:
//!
//! - target Running while no run is open: a new run is started
//! - target Ready while a run is open: the run is stopped and post-run jobs
//!   (organize files per router, back up configs per device) are fanned out
//!
//! Device state converges afterwards through [`FleetCoordinator::run_reconciliation`].

use crate::client::ClientProvider;
use crate::config::{ReconciliationConfig, Settings};
use crate::device::{DeviceState, OverallState, TargetState};
use crate::dispatch::{TaskDispatcher, TaskUnit};
use crate::error::{AppResult, DaqError};
use crate::experiment::{RunClass, RunRecord};
use crate::ids::{DeviceId, ExperimentId, RouterId};
use crate::jobs::HostJobs;
use crate::orchestrator::TransitionOrchestrator;
use crate::store::Store;
use crate::worker::WorkerProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What happened to one device's transition request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Submission {
    /// A transition unit was queued.
    Queued {
        /// Dispatcher task id
        task: Uuid,
    },
    /// Rejected before anything was queued.
    Rejected {
        /// Why
        error: String,
    },
}

/// Per-device entry of a [`FleetResult`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSubmission {
    /// Device id
    pub device_id: DeviceId,
    /// Device name
    pub device_name: String,
    /// State the device was asked to move to
    pub target: DeviceState,
    /// Outcome of the submission
    pub submission: Submission,
}

/// Returned by [`FleetCoordinator::transition_fleet`] once every request is queued.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FleetResult {
    /// Experiment addressed
    pub experiment_id: ExperimentId,
    /// Requested target
    pub target: TargetState,
    /// One entry per device
    pub submissions: Vec<DeviceSubmission>,
    /// Run opened by this request
    pub run_started: Option<RunRecord>,
    /// Run closed by this request
    pub run_stopped: Option<RunRecord>,
}

impl FleetResult {
    /// Number of devices whose transition was queued.
    pub fn queued(&self) -> usize {
        self.submissions
            .iter()
            .filter(|s| matches!(s.submission, Submission::Queued { .. }))
            .count()
    }
}

/// Device line of a [`FleetStatus`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Device id
    pub id: DeviceId,
    /// Device name
    pub name: String,
    /// State code
    pub state: i32,
    /// State name
    pub state_name: String,
    /// Transition in flight
    pub transitioning: bool,
    /// Controller process alive
    pub online: bool,
    /// Selected config, formatted `describe/prepare/configure`
    pub selected_config: Option<String>,
}

/// Router line of a [`FleetStatus`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterStatus {
    /// Router id
    pub id: RouterId,
    /// Router name
    pub name: String,
    /// Router process alive
    pub online: bool,
    /// Nothing waiting in the staging area
    pub staging_clean: bool,
}

/// Snapshot of an experiment for operators.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FleetStatus {
    /// Experiment id
    pub experiment_id: ExperimentId,
    /// Experiment name
    pub experiment_name: String,
    /// Unanimous state code, `None` when mixed
    pub overall_state: Option<i32>,
    /// Unanimous state name or "Mixed"
    pub overall_state_name: String,
    /// A run is open
    pub running: bool,
    /// Latest run number
    pub run_number: Option<u32>,
    /// Latest run start
    pub run_start: Option<DateTime<Utc>>,
    /// Latest run duration, `HH:MM:SS`
    pub run_duration: Option<String>,
    /// Latest run title
    pub run_title: Option<String>,
    /// Latest run class
    pub run_class: Option<RunClass>,
    /// Devices
    pub devices: Vec<DeviceStatus>,
    /// Routers
    pub routers: Vec<RouterStatus>,
}

/// Coordinates the whole fleet of an experiment.
#[derive(Clone)]
pub struct FleetCoordinator {
    store: Arc<Store>,
    orchestrator: TransitionOrchestrator,
    jobs: HostJobs,
    dispatcher: Arc<TaskDispatcher>,
    reconciliation: ReconciliationConfig,
}

impl FleetCoordinator {
    /// Start a dispatcher from `settings` and wire up the orchestrator and jobs.
    pub fn start(
        settings: &Settings,
        store: Arc<Store>,
        clients: Arc<dyn ClientProvider>,
        workers: Arc<dyn WorkerProvider>,
    ) -> Self {
        let dispatcher = Arc::new(TaskDispatcher::start(
            &settings.dispatcher,
            settings.timeouts.clone(),
        ));
        let orchestrator = TransitionOrchestrator::new(
            store.clone(),
            clients,
            workers.clone(),
            dispatcher.clone(),
            settings.timeouts.clone(),
            settings.reconciliation.stuck_after_failed_polls,
        );
        let jobs = HostJobs::new(store.clone(), workers);
        Self {
            store,
            orchestrator,
            jobs,
            dispatcher,
            reconciliation: settings.reconciliation.clone(),
        }
    }

    /// Shared store
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Single-device orchestrator
    pub fn orchestrator(&self) -> &TransitionOrchestrator {
        &self.orchestrator
    }

    /// Router and post-run jobs
    pub fn jobs(&self) -> &HostJobs {
        &self.jobs
    }

    /// Task dispatcher
    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    /// Unanimous device state of an experiment, else `Mixed` (also for no devices).
    pub fn aggregate_state(&self, experiment: ExperimentId) -> AppResult<OverallState> {
        self.store.experiment(experiment)?;
        Ok(OverallState::of(
            self.store
                .devices_in(experiment)
                .into_iter()
                .map(|d| d.state),
        ))
    }

    /// Ask every device of `experiment` to move toward `target`.
    ///
    /// # Errors
    ///
    /// `NotReady` when the target is Running and a router's staging area is
    /// not clean (no device is touched). `AlreadyRunning`/`NotRunning` from
    /// the run lifecycle. Per-device failures are only recorded.
    pub async fn transition_fleet(
        &self,
        experiment: ExperimentId,
        target: TargetState,
    ) -> AppResult<FleetResult> {
        let exp = self.store.experiment(experiment)?;
        let concrete = target.concrete();

        if concrete == Some(DeviceState::Running) {
            let dirty: Vec<String> = self
                .store
                .routers_in(experiment)
                .into_iter()
                .filter(|r| !r.staging_clean)
                .map(|r| r.name)
                .collect();
            if !dirty.is_empty() {
                error!(experiment = %exp.name, routers = ?dirty, "Data routers are not ready");
                return Err(DaqError::NotReady(format!(
                    "staging area not clean on {}",
                    dirty.join(", ")
                )));
            }
        }

        let devices = self.store.devices_in(experiment);
        let mut submissions = Vec::with_capacity(devices.len());
        for device in devices {
            let resolved = target.resolve(device.state);
            let submission = match self.orchestrator.request_transition(device.id, target).await {
                Ok(task) => Submission::Queued { task },
                Err(e) => {
                    warn!(device = %device.name, target = %resolved, "Failed to submit transition: {}", e);
                    Submission::Rejected {
                        error: e.to_string(),
                    }
                }
            };
            submissions.push(DeviceSubmission {
                device_id: device.id,
                device_name: device.name,
                target: resolved,
                submission,
            });
        }

        let mut result = FleetResult {
            experiment_id: experiment,
            target,
            submissions,
            run_started: None,
            run_stopped: None,
        };

        let running = self.store.is_running(experiment);
        match concrete {
            Some(DeviceState::Running) if !running => {
                result.run_started = Some(self.store.start_run(experiment)?);
            }
            Some(DeviceState::Ready) if running => {
                let run = self.store.stop_run(experiment)?;
                self.dispatch_post_run(experiment, &run).await;
                result.run_stopped = Some(run);
            }
            _ => {}
        }

        info!(
            experiment = %exp.name,
            ?target,
            queued = result.queued(),
            devices = result.submissions.len(),
            "Fleet transition submitted"
        );
        Ok(result)
    }

    async fn dispatch_post_run(&self, experiment: ExperimentId, run: &RunRecord) {
        let mut units = self.jobs.organize_units(experiment, run.id);
        units.extend(self.jobs.backup_units(experiment, run.id));
        if let Err(e) = self.dispatcher.fan_out(units).await {
            error!(run_number = run.run_number, "Could not queue post-run jobs: {}", e);
        }
    }

    /// Status of an experiment.
    pub fn status(&self, experiment: ExperimentId) -> AppResult<FleetStatus> {
        fleet_status(&self.store, experiment)
    }

    async fn fan_out_devices<F>(&self, what: &str, unit: F) -> AppResult<usize>
    where
        F: Fn(&TransitionOrchestrator, DeviceId, String) -> TaskUnit,
    {
        let experiment = self.store.require_active()?;
        let units: Vec<TaskUnit> = self
            .store
            .devices_in(experiment.id)
            .into_iter()
            .map(|d| unit(&self.orchestrator, d.id, format!("{what} {}", d.name)))
            .collect();
        let count = units.len();
        self.dispatcher.fan_out(units).await?;
        Ok(count)
    }

    /// Queue a state reconciliation for every device of the active experiment.
    pub async fn refresh_all(&self) -> AppResult<usize> {
        self.fan_out_devices("refresh state of", TransitionOrchestrator::refresh_unit)
            .await
    }

    /// Queue an online check for every device of the active experiment.
    pub async fn check_online_all(&self) -> AppResult<usize> {
        self.fan_out_devices("check online", TransitionOrchestrator::check_online_unit)
            .await
    }

    /// Queue a config list refresh for every device of the active experiment.
    pub async fn refresh_configs_all(&self) -> AppResult<usize> {
        self.fan_out_devices("refresh configs of", TransitionOrchestrator::refresh_configs_unit)
            .await
    }

    /// Queue a router check for every router of the active experiment.
    pub async fn check_routers_all(&self) -> AppResult<usize> {
        let experiment = self.store.require_active()?;
        let units: Vec<TaskUnit> = self
            .store
            .routers_in(experiment.id)
            .into_iter()
            .map(|r| self.jobs.check_router_unit(r.id, format!("check router {}", r.name)))
            .collect();
        let count = units.len();
        self.dispatcher.fan_out(units).await?;
        Ok(count)
    }

    /// Run the polling fan-outs on their configured intervals until `shutdown` turns true.
    pub async fn run_reconciliation(&self, mut shutdown: watch::Receiver<bool>) {
        let period = |ms: u64| {
            let mut tick = interval(Duration::from_millis(ms.max(1)));
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tick
        };
        let mut state_tick = period(self.reconciliation.state_interval_ms);
        let mut online_tick = period(self.reconciliation.online_interval_ms);
        let mut router_tick = period(self.reconciliation.router_interval_ms);

        info!("Reconciliation loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = state_tick.tick() => poll("state refresh", self.refresh_all()).await,
                _ = online_tick.tick() => poll("online check", self.check_online_all()).await,
                _ = router_tick.tick() => poll("router check", self.check_routers_all()).await,
            }
        }
        info!("Reconciliation loop stopped");
    }

    /// Stop the dispatcher, waiting up to `grace` for queued units.
    pub async fn shutdown(&self, grace: Duration) {
        self.dispatcher.shutdown(grace).await;
    }
}

/// Status of an experiment, read straight from the store.
pub fn fleet_status(store: &Store, experiment: ExperimentId) -> AppResult<FleetStatus> {
    let exp = store.experiment(experiment)?;
    let devices = store.devices_in(experiment);
    let overall = OverallState::of(devices.iter().map(|d| d.state));
    let latest = store.latest_run(experiment);
    let now = Utc::now();

    Ok(FleetStatus {
        experiment_id: exp.id,
        experiment_name: exp.name,
        overall_state: overall.code(),
        overall_state_name: overall.name().to_string(),
        running: store.is_running(experiment),
        run_number: latest.as_ref().map(|r| r.run_number),
        run_start: latest.as_ref().map(|r| r.start),
        run_duration: latest.as_ref().map(|r| r.duration_string(now)),
        run_title: latest.as_ref().and_then(|r| r.title.clone()),
        run_class: latest.as_ref().and_then(|r| r.run_class),
        devices: devices
            .into_iter()
            .map(|d| DeviceStatus {
                id: d.id,
                state: d.state.code(),
                state_name: d.state.name().to_string(),
                transitioning: d.transitioning,
                online: d.online,
                selected_config: d.selected_config.as_ref().map(ToString::to_string),
                name: d.name,
            })
            .collect(),
        routers: store
            .routers_in(experiment)
            .into_iter()
            .map(|r| RouterStatus {
                id: r.id,
                name: r.name,
                online: r.online,
                staging_clean: r.staging_clean,
            })
            .collect(),
    })
}

async fn poll<F>(what: &str, fan_out: F)
where
    F: Future<Output = AppResult<usize>>,
{
    match fan_out.await {
        Ok(count) => debug!(count, "Queued {}", what),
        Err(DaqError::NoActiveExperiment) => debug!("Skipping {}: no active experiment", what),
        Err(e) => warn!("Could not queue {}: {}", what, e),
    }
}
