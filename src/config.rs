//! Settings for the fleet orchestrator, loaded with Figment.
//!
//! Configuration is layered, lowest precedence first:
//! 1. Built-in defaults ([`Settings::default`])
//! 2. TOML file (default: `config/daq_fleet.toml`)
//! 3. Environment variables prefixed with `DAQ_FLEET_`, nested keys split on `__`
//!
//! ```text
//! DAQ_FLEET_APPLICATION__LOG_LEVEL=debug
//! DAQ_FLEET_DISPATCHER__WORKERS=16
//! DAQ_FLEET_TIMEOUTS__TRANSITION__SOFT_MS=30000
//! ```

use crate::dispatch::TaskKind;
use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default settings file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq_fleet.toml";

/// Top-level settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Task dispatcher sizing
    pub dispatcher: DispatcherConfig,
    /// Soft/hard limits per task kind
    pub timeouts: TimeoutConfig,
    /// Periodic reconciliation
    pub reconciliation: ReconciliationConfig,
    /// Fleet inventory location
    pub inventory: InventoryConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, json)
    pub log_format: String,
    /// Entries kept in the in-memory log buffer
    pub log_buffer_capacity: usize,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "daq-fleet".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            log_buffer_capacity: 1000,
        }
    }
}

/// Task dispatcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of worker tasks
    pub workers: usize,
    /// Bounded queue length
    pub queue_capacity: usize,
    /// Grace period for in-flight units on shutdown, in milliseconds
    pub shutdown_timeout_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 256,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl DispatcherConfig {
    /// Shutdown grace period
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Soft and hard limit of one task kind, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLimits {
    /// Cooperative cancellation deadline
    pub soft_ms: u64,
    /// Forced abort deadline
    pub hard_ms: u64,
}

impl TaskLimits {
    /// Limits from whole seconds.
    pub const fn secs(soft: u64, hard: u64) -> Self {
        Self {
            soft_ms: soft * 1000,
            hard_ms: hard * 1000,
        }
    }

    /// Soft limit
    pub fn soft(&self) -> Duration {
        Duration::from_millis(self.soft_ms)
    }

    /// Hard limit
    pub fn hard(&self) -> Duration {
        Duration::from_millis(self.hard_ms)
    }
}

/// Limits per task kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Device state transition
    pub transition: TaskLimits,
    /// Device state query
    pub refresh_state: TaskLimits,
    /// Device controller liveness check
    pub check_online: TaskLimits,
    /// Router liveness and staging check
    pub check_router: TaskLimits,
    /// Config list refresh
    pub refresh_configs: TaskLimits,
    /// Post-run data file organization
    pub organize_files: TaskLimits,
    /// Post-run config backup
    pub backup_config: TaskLimits,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            transition: TaskLimits::secs(45, 60),
            refresh_state: TaskLimits::secs(5, 10),
            check_online: TaskLimits::secs(10, 40),
            check_router: TaskLimits::secs(10, 40),
            refresh_configs: TaskLimits::secs(10, 20),
            organize_files: TaskLimits::secs(30, 40),
            backup_config: TaskLimits::secs(30, 40),
        }
    }
}

impl TimeoutConfig {
    /// Limits for a task kind.
    pub fn limits(&self, kind: TaskKind) -> TaskLimits {
        match kind {
            TaskKind::Transition => self.transition,
            TaskKind::RefreshState => self.refresh_state,
            TaskKind::CheckOnline => self.check_online,
            TaskKind::CheckRouter => self.check_router,
            TaskKind::RefreshConfigs => self.refresh_configs,
            TaskKind::OrganizeFiles => self.organize_files,
            TaskKind::BackupConfig => self.backup_config,
        }
    }

    /// The same limits for every kind; handy in tests.
    pub fn uniform(limits: TaskLimits) -> Self {
        Self {
            transition: limits,
            refresh_state: limits,
            check_online: limits,
            check_router: limits,
            refresh_configs: limits,
            organize_files: limits,
            backup_config: limits,
        }
    }
}

/// Periodic reconciliation configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Device state refresh period, in milliseconds
    pub state_interval_ms: u64,
    /// Device online check period, in milliseconds
    pub online_interval_ms: u64,
    /// Router check period, in milliseconds
    pub router_interval_ms: u64,
    /// Failed polls after which a transitioning flag is considered stuck (0 = never)
    pub stuck_after_failed_polls: u32,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            state_interval_ms: 2000,
            online_interval_ms: 10_000,
            router_interval_ms: 10_000,
            stuck_after_failed_polls: 3,
        }
    }
}

/// Inventory file configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// TOML or JSON file listing experiments, devices, routers and sources
    pub path: PathBuf,
    /// Optional JSON store snapshot, preferred over the inventory when present
    pub snapshot_path: Option<PathBuf>,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("config/inventory.toml"),
            snapshot_path: None,
        }
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment, then validate.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific TOML file and the environment, then validate.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("DAQ_FLEET_").split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Log format is valid (pretty, json)
    /// - Dispatcher workers and queue capacity are nonzero
    /// - Every soft limit is nonzero and below its hard limit
    /// - Reconciliation intervals are nonzero
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.dispatcher.workers == 0 {
            return Err(DaqError::Configuration(
                "dispatcher.workers must be at least 1".to_string(),
            ));
        }
        if self.dispatcher.queue_capacity == 0 {
            return Err(DaqError::Configuration(
                "dispatcher.queue_capacity must be at least 1".to_string(),
            ));
        }

        for kind in TaskKind::ALL {
            let limits = self.timeouts.limits(kind);
            if limits.soft_ms == 0 || limits.soft_ms >= limits.hard_ms {
                return Err(DaqError::Configuration(format!(
                    "Invalid limits for {kind}: soft {}ms must be nonzero and below hard {}ms",
                    limits.soft_ms, limits.hard_ms
                )));
            }
        }

        let r = &self.reconciliation;
        if r.state_interval_ms == 0 || r.online_interval_ms == 0 || r.router_interval_ms == 0 {
            return Err(DaqError::Configuration(
                "reconciliation intervals must be nonzero".to_string(),
            ));
        }

        Ok(())
    }
}
