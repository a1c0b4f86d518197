//! Custom error types for the fleet orchestrator.
//!
//! This module defines the primary error type, `DaqError`, for the entire crate.
//! Using the `thiserror` crate, it gives every layer (state machine, orchestrator,
//! fleet coordinator, dispatcher, configuration) one consistent error vocabulary.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidTransition`**: a no-op or multi-step request. Local, no remote call made.
//! - **`ConfigMissing`**: the device has no configuration selected.
//! - **`DeviceError`**: the device controller answered with a nonzero error code.
//! - **`RemoteTimeout`**: a unit of work hit its soft or hard time limit.
//! - **`NotReady`**: the fleet-level Running precondition failed (dirty staging area).
//! - **`AlreadyRunning`** / **`NotRunning`**: run-lifecycle misuse.
//! - **`NotFound`**: unknown device, router, experiment or run id.
//! - **`NoActiveExperiment`**: an operation needing the active experiment found none.
//!
//! Transport failures of the consumed capabilities are reported as `Remote`, and the
//! ambient layers (figment, I/O, JSON, CSV, XML) wrap their own errors with `#[from]` where
//! the source type is available.

use std::fmt;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Which time limit expired for a unit of work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutKind {
    /// Cooperative limit: the unit was cancelled at an await point.
    Soft,
    /// Forced limit: the supervising worker aborted the unit.
    Hard,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Soft => write!(f, "soft"),
            TimeoutKind::Hard => write!(f, "hard"),
        }
    }
}

/// Error type of the whole crate.
#[derive(Error, Debug)]
pub enum DaqError {
    /// No-op or multi-step transition request.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// The device has no configuration selected.
    #[error("No configuration selected for device '{0}'")]
    ConfigMissing(String),

    /// The device controller answered with a nonzero error code.
    #[error("Device error: {0}")]
    DeviceError(String),

    /// A unit of work hit a time limit.
    #[error("Remote call exceeded its {0} time limit")]
    RemoteTimeout(TimeoutKind),

    /// Running was requested while a staging area is not clean.
    #[error("Fleet not ready: {0}")]
    NotReady(String),

    /// A run is already open.
    #[error("Stop the current run before starting a new one")]
    AlreadyRunning,

    /// No run is open.
    #[error("No run is currently running")]
    NotRunning,

    /// Unknown record id.
    #[error("{kind} {id} not found")]
    NotFound {
        /// Record type
        kind: &'static str,
        /// Requested id
        id: String,
    },

    /// The operation needs the active experiment.
    #[error("No experiment is active")]
    NoActiveExperiment,

    /// Activation refused; lists the busy devices.
    #[error("Cannot change experiments while devices are not idle: {0}")]
    ExperimentBusy(String),

    /// Unique-name violation.
    #[error("Duplicate {kind} name '{name}'")]
    Duplicate {
        /// Record type
        kind: &'static str,
        /// Clashing name
        name: String,
    },

    /// Transport failure of a device or worker call.
    #[error("Remote call failed: {0}")]
    Remote(String),

    /// Figment extraction failure.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Settings or inventory failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem or stream failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV write failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// XML read or write failure.
    #[error("XML error: {0}")]
    Xml(String),

    /// Submit after dispatcher shutdown.
    #[error("Task dispatcher is shut down")]
    DispatcherClosed,
}

impl DaqError {
    /// Shorthand for a [`DaqError::NotFound`] with a displayable id.
    pub fn not_found(kind: &'static str, id: impl fmt::Display) -> Self {
        DaqError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Wrap any XML reader/writer failure.
    pub fn xml(err: impl fmt::Display) -> Self {
        DaqError::Xml(err.to_string())
    }

    /// True for failures detected locally, before any remote call was made.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            DaqError::InvalidTransition(_)
                | DaqError::ConfigMissing(_)
                | DaqError::NotFound { .. }
                | DaqError::NoActiveExperiment
        )
    }
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}
