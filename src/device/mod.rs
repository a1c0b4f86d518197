//! Device controller records and the single-device state machine.
//!
//! Every ECC server drives its electronics through the same five-state
//! protocol:
//!
//! ```text
//!          Describe      Prepare      Configure      Start
//!   Idle ───────────▶ Described ──▶ Prepared ───▶ Ready ──────▶ Running
//!        ◀───────────           ◀──          ◀───        ◀──────
//!            Undo              Undo         Breakup        Stop
//! ```
//!
//! Only single steps are legal. Nothing in this module performs I/O; the
//! remote side of a transition lives in [`crate::orchestrator`].

pub mod config_id;

pub use config_id::ConfigId;

use crate::error::{AppResult, DaqError};
use crate::ids::{DeviceId, ExperimentId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Default TCP port of an ECC server.
pub const DEFAULT_ECC_PORT: u16 = 8083;

/// Target code meaning "step back one state from each device's own state".
pub const RESET_SENTINEL: i32 = -1;

/// State of a device controller with respect to the acquisition state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// Powered and reachable, nothing loaded.
    Idle = 1,
    /// Describe config applied.
    Described = 2,
    /// Prepare config applied.
    Prepared = 3,
    /// Configured and armed; ready to start acquisition.
    Ready = 4,
    /// Acquiring data.
    Running = 5,
}

impl DeviceState {
    /// All states in protocol order.
    pub const ALL: [DeviceState; 5] = [
        DeviceState::Idle,
        DeviceState::Described,
        DeviceState::Prepared,
        DeviceState::Ready,
        DeviceState::Running,
    ];

    /// Integer code used on the wire and in status responses.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Parse a wire code; `None` for anything outside 1..=5.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    /// Human-readable state name.
    pub fn name(self) -> &'static str {
        match self {
            DeviceState::Idle => "Idle",
            DeviceState::Described => "Described",
            DeviceState::Prepared => "Prepared",
            DeviceState::Ready => "Ready",
            DeviceState::Running => "Running",
        }
    }

    /// One state back, saturating at Idle.
    pub fn step_back(self) -> Self {
        Self::from_code(self.code() - 1).unwrap_or(DeviceState::Idle)
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState::Idle
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What a transition request asks for: a concrete state or a per-device step back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetState {
    /// Move toward this state.
    State(DeviceState),
    /// Step back one state from whatever state each device is in.
    Reset,
}

impl TargetState {
    /// Parse a control-surface code; [`RESET_SENTINEL`] maps to [`TargetState::Reset`].
    pub fn from_code(code: i32) -> AppResult<Self> {
        if code == RESET_SENTINEL {
            return Ok(TargetState::Reset);
        }
        DeviceState::from_code(code)
            .map(TargetState::State)
            .ok_or_else(|| DaqError::InvalidTransition(format!("unknown target state {code}")))
    }

    /// Resolve against one device's current state.
    pub fn resolve(self, current: DeviceState) -> DeviceState {
        match self {
            TargetState::State(state) => state,
            TargetState::Reset => current.step_back(),
        }
    }

    /// The concrete state, if this is not a reset.
    pub fn concrete(self) -> Option<DeviceState> {
        match self {
            TargetState::State(state) => Some(state),
            TargetState::Reset => None,
        }
    }
}

impl From<DeviceState> for TargetState {
    fn from(state: DeviceState) -> Self {
        TargetState::State(state)
    }
}

/// Remote operation that performs one edge of the state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    /// Idle → Described
    Describe,
    /// Described → Prepared
    Prepare,
    /// Prepared → Ready
    Configure,
    /// Ready → Running
    Start,
    /// Running → Ready
    Stop,
    /// Ready → Prepared
    Breakup,
    /// Described → Idle and Prepared → Described
    Undo,
}

impl Operation {
    /// Operation name as the device controller knows it.
    pub fn name(self) -> &'static str {
        match self {
            Operation::Describe => "Describe",
            Operation::Prepare => "Prepare",
            Operation::Configure => "Configure",
            Operation::Start => "Start",
            Operation::Stop => "Stop",
            Operation::Breakup => "Breakup",
            Operation::Undo => "Undo",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Look up the operation that moves a device from `current` to `target`.
///
/// # Errors
///
/// [`DaqError::InvalidTransition`] if the states are equal or not adjacent.
pub fn compute_transition(current: DeviceState, target: DeviceState) -> AppResult<Operation> {
    use DeviceState::*;

    if current == target {
        return Err(DaqError::InvalidTransition("no transition needed".to_string()));
    }

    let operation = match (current, target) {
        (Idle, Described) => Operation::Describe,
        (Described, Idle) => Operation::Undo,
        (Described, Prepared) => Operation::Prepare,
        (Prepared, Described) => Operation::Undo,
        (Prepared, Ready) => Operation::Configure,
        (Ready, Prepared) => Operation::Breakup,
        (Ready, Running) => Operation::Start,
        (Running, Ready) => Operation::Stop,
        _ => {
            return Err(DaqError::InvalidTransition(
                "can only transition one step at a time".to_string(),
            ))
        }
    };
    Ok(operation)
}

/// Fleet-wide state: unanimous or mixed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverallState {
    /// Every device reports this state.
    Unanimous(DeviceState),
    /// Devices disagree (or there are none).
    Mixed,
}

impl OverallState {
    /// Aggregate a set of device states.
    pub fn of<I>(states: I) -> Self
    where
        I: IntoIterator<Item = DeviceState>,
    {
        let mut states = states.into_iter();
        let Some(first) = states.next() else {
            return OverallState::Mixed;
        };
        if states.all(|s| s == first) {
            OverallState::Unanimous(first)
        } else {
            OverallState::Mixed
        }
    }

    /// State code, `None` when mixed.
    pub fn code(self) -> Option<i32> {
        match self {
            OverallState::Unanimous(state) => Some(state.code()),
            OverallState::Mixed => None,
        }
    }

    /// State name, or "Mixed".
    pub fn name(self) -> &'static str {
        match self {
            OverallState::Unanimous(state) => state.name(),
            OverallState::Mixed => "Mixed",
        }
    }
}

/// An ECC server controlling one or more data sources.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Store id
    pub id: DeviceId,
    /// Owning experiment
    pub experiment_id: ExperimentId,
    /// Unique (per experiment) name
    pub name: String,
    /// Host address of the ECC server
    pub address: IpAddr,
    /// TCP port the ECC server listens on
    pub port: u16,
    /// Config set used for transitions
    pub selected_config: Option<ConfigId>,
    /// Config sets last reported by the device
    #[serde(default)]
    pub available_configs: Vec<ConfigId>,
    /// Last known state
    pub state: DeviceState,
    /// A transition request is in flight and not yet confirmed
    pub transitioning: bool,
    /// Controller process seen alive by the last online check
    pub online: bool,
    /// Consecutive failed reconciliations
    #[serde(default)]
    pub failed_polls: u32,
    /// Path to the ECC server log on its host
    pub log_path: String,
    /// Directory holding the config files on the device host
    pub config_root: String,
    /// Directory receiving config backups at the end of each run
    pub config_backup_root: String,
}

impl Device {
    /// A fresh device in the Idle state with the usual ECC defaults.
    pub fn new(
        id: DeviceId,
        experiment_id: ExperimentId,
        name: impl Into<String>,
        address: IpAddr,
    ) -> Self {
        Self {
            id,
            experiment_id,
            name: name.into(),
            address,
            port: DEFAULT_ECC_PORT,
            selected_config: None,
            available_configs: Vec::new(),
            state: DeviceState::Idle,
            transitioning: false,
            online: false,
            failed_polls: 0,
            log_path: "~/Library/Logs/getEccSoapServer.log".to_string(),
            config_root: "/Volumes/configs".to_string(),
            config_backup_root: "~/config_backups".to_string(),
        }
    }

    /// URL of the ECC server endpoint.
    pub fn url(&self) -> String {
        format!("http://{}:{}/", self.address, self.port)
    }

    /// Selected config, or [`DaqError::ConfigMissing`].
    pub fn require_config(&self) -> AppResult<&ConfigId> {
        self.selected_config
            .as_ref()
            .ok_or_else(|| DaqError::ConfigMissing(self.name.clone()))
    }

    /// Full paths of the describe/prepare/configure files on the device host.
    pub fn config_file_paths(&self) -> AppResult<Vec<String>> {
        let config = self.require_config()?;
        let root = self.config_root.trim_end_matches('/');
        Ok(config
            .file_names()
            .into_iter()
            .map(|file| format!("{root}/{file}"))
            .collect())
    }
}
