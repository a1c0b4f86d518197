//! Operator control surface.
//!
//! Requests and responses are serde types, so the same service backs the
//! JSON-lines `control` command of the binary and in-process callers.
//!
//! ```json
//! {"request": "transition_fleet", "target_state": 2}
//! {"request": "transition_device", "device_id": 4, "target_state": -1}
//! {"request": "status"}
//! ```
//!
//! Everything except `activate` and `recent_logs` needs an active experiment.

use crate::device::TargetState;
use crate::error::{AppResult, DaqError};
use crate::export::{run_metadata_csv, run_metadata_file_name};
use crate::fleet::{FleetCoordinator, FleetResult, FleetStatus};
use crate::ids::{DeviceId, ExperimentId};
use crate::log_capture::{LogBuffer, LogLine};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Default number of log lines returned by `tail_log`.
pub const DEFAULT_TAIL_LINES: usize = 50;

fn default_tail_lines() -> usize {
    DEFAULT_TAIL_LINES
}

fn default_log_limit() -> usize {
    100
}

/// A request from an operator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Move one device one step; `-1` steps it back from its current state.
    TransitionDevice {
        /// Device to move
        device_id: DeviceId,
        /// State code, or `-1` for RESET
        target_state: i32,
    },
    /// Move every device of the active experiment; `-1` resets each one step.
    TransitionFleet {
        /// State code, or `-1` for RESET
        target_state: i32,
    },
    /// Status of the active experiment.
    Status,
    /// Queue state, online, config and router checks for the active experiment.
    Refresh,
    /// Make another experiment the active one.
    Activate {
        /// Experiment to activate
        experiment_id: ExperimentId,
    },
    /// Last lines of a device controller's log file.
    TailLog {
        /// Device whose log to read
        device_id: DeviceId,
        /// Number of lines
        #[serde(default = "default_tail_lines")]
        lines: usize,
    },
    /// Recent entries of this process's own log.
    RecentLogs {
        /// Maximum number of entries
        #[serde(default = "default_log_limit")]
        limit: usize,
    },
    /// Run metadata of the active experiment as CSV.
    ExportRuns,
}

/// Answer to a [`ControlRequest`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum ControlResponse {
    /// Fleet transition submitted.
    Fleet {
        /// Per-device submissions and run changes
        result: FleetResult,
        /// Status right after submission
        status: FleetStatus,
    },
    /// Single-device transition queued.
    Device {
        /// Device asked to move
        device_id: DeviceId,
        /// Dispatcher task id
        task: Uuid,
        /// Status right after submission
        status: FleetStatus,
    },
    /// Current status.
    Status {
        /// Status of the active experiment
        status: FleetStatus,
    },
    /// Polling units queued.
    Refreshed {
        /// Number of units queued
        queued: usize,
    },
    /// Log text from a worker host.
    Log {
        /// Device the log belongs to
        device_id: DeviceId,
        /// Last lines of the file
        text: String,
    },
    /// Entries from the in-memory log buffer.
    Logs {
        /// Oldest first
        entries: Vec<LogLine>,
    },
    /// Run metadata export.
    Runs {
        /// Suggested download name
        file_name: String,
        /// CSV text with a header row
        csv: String,
    },
    /// The request failed.
    Error {
        /// Stable error name, see [`error_kind`]
        kind: String,
        /// Human-readable message
        message: String,
    },
}

impl ControlResponse {
    /// Error response for `err`.
    pub fn error(err: &DaqError) -> Self {
        ControlResponse::Error {
            kind: error_kind(err).to_string(),
            message: err.to_string(),
        }
    }

    /// True unless this is an error response.
    pub fn is_ok(&self) -> bool {
        !matches!(self, ControlResponse::Error { .. })
    }
}

/// Stable short name of an error for clients.
pub fn error_kind(err: &DaqError) -> &'static str {
    match err {
        DaqError::InvalidTransition(_) => "invalid_transition",
        DaqError::ConfigMissing(_) => "config_missing",
        DaqError::DeviceError(_) => "device_error",
        DaqError::RemoteTimeout(_) => "remote_timeout",
        DaqError::NotReady(_) => "not_ready",
        DaqError::AlreadyRunning => "already_running",
        DaqError::NotRunning => "not_running",
        DaqError::NotFound { .. } => "not_found",
        DaqError::NoActiveExperiment => "no_active_experiment",
        DaqError::ExperimentBusy(_) => "experiment_busy",
        DaqError::Duplicate { .. } => "duplicate",
        DaqError::Remote(_) => "remote",
        DaqError::Config(_) | DaqError::Configuration(_) => "configuration",
        DaqError::Io(_) | DaqError::Csv(_) => "io",
        DaqError::Json(_) => "bad_request",
        DaqError::Xml(_) => "xml",
        DaqError::DispatcherClosed => "dispatcher_closed",
    }
}

/// Serves [`ControlRequest`]s against a [`FleetCoordinator`].
#[derive(Clone)]
pub struct ControlService {
    fleet: FleetCoordinator,
    logs: LogBuffer,
}

impl ControlService {
    /// Serve `fleet`, answering log requests from `logs`.
    pub fn new(fleet: FleetCoordinator, logs: LogBuffer) -> Self {
        Self { fleet, logs }
    }

    /// Coordinator behind the service
    pub fn fleet(&self) -> &FleetCoordinator {
        &self.fleet
    }

    /// Handle one request; failures become [`ControlResponse::Error`].
    pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Control request failed: {}", e);
                ControlResponse::error(&e)
            }
        }
    }

    /// Handle one JSON request and return the JSON response.
    pub async fn handle_json(&self, line: &str) -> String {
        let response = match serde_json::from_str::<ControlRequest>(line) {
            Ok(request) => self.handle(request).await,
            Err(e) => ControlResponse::error(&DaqError::from(e)),
        };
        serde_json::to_string(&response).unwrap_or_else(|e| {
            format!(r#"{{"response":"error","kind":"io","message":"{}"}}"#, e)
        })
    }

    async fn dispatch(&self, request: ControlRequest) -> AppResult<ControlResponse> {
        let store = self.fleet.store();
        match request {
            ControlRequest::TransitionDevice {
                device_id,
                target_state,
            } => {
                let experiment = store.require_active()?;
                let target = TargetState::from_code(target_state)?;
                let device = store.device(device_id)?;
                if device.experiment_id != experiment.id {
                    return Err(DaqError::not_found(
                        "Device",
                        format!("{} in experiment {}", device_id, experiment.name),
                    ));
                }
                let task = self
                    .fleet
                    .orchestrator()
                    .request_transition(device_id, target)
                    .await?;
                info!(device = %device.name, ?target, %task, "Device transition requested");
                Ok(ControlResponse::Device {
                    device_id,
                    task,
                    status: self.fleet.status(experiment.id)?,
                })
            }
            ControlRequest::TransitionFleet { target_state } => {
                let experiment = store.require_active()?;
                let target = TargetState::from_code(target_state)?;
                let result = self.fleet.transition_fleet(experiment.id, target).await?;
                Ok(ControlResponse::Fleet {
                    result,
                    status: self.fleet.status(experiment.id)?,
                })
            }
            ControlRequest::Status => {
                let experiment = store.require_active()?;
                Ok(ControlResponse::Status {
                    status: self.fleet.status(experiment.id)?,
                })
            }
            ControlRequest::Refresh => {
                let mut queued = self.fleet.refresh_all().await?;
                queued += self.fleet.check_online_all().await?;
                queued += self.fleet.refresh_configs_all().await?;
                queued += self.fleet.check_routers_all().await?;
                Ok(ControlResponse::Refreshed { queued })
            }
            ControlRequest::Activate { experiment_id } => {
                store.activate_experiment(experiment_id)?;
                Ok(ControlResponse::Status {
                    status: self.fleet.status(experiment_id)?,
                })
            }
            ControlRequest::TailLog { device_id, lines } => {
                let experiment = store.require_active()?;
                let device = store.device(device_id)?;
                if device.experiment_id != experiment.id {
                    return Err(DaqError::not_found("Device", device_id));
                }
                let agent = self.fleet.orchestrator().workers().agent_for(device.address)?;
                let text = agent.tail_file(&device.log_path, lines).await?;
                Ok(ControlResponse::Log { device_id, text })
            }
            ControlRequest::RecentLogs { limit } => Ok(ControlResponse::Logs {
                entries: self.logs.recent(limit),
            }),
            ControlRequest::ExportRuns => {
                let experiment = store.require_active()?;
                Ok(ControlResponse::Runs {
                    file_name: run_metadata_file_name(&experiment.name),
                    csv: run_metadata_csv(store, experiment.id)?,
                })
            }
        }
    }
}
