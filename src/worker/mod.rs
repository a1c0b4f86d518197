//! Worker Agent capability: file and process operations on DAQ hosts.
//!
//! Routers and device controllers run on hosts that the orchestrator reaches
//! through a [`WorkerAgent`]. Post-run jobs (organizing data files, backing up
//! config files) and the router/online checks all go through this trait.

pub mod local;
pub mod mock;

use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

/// Process whose liveness can be checked on a host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostProcess {
    /// The ECC server process
    DeviceController,
    /// The data router process
    DataRouter,
}

impl HostProcess {
    /// Executable name looked up in the host's process table.
    pub fn process_name(self) -> &'static str {
        match self {
            HostProcess::DeviceController => "getEccSoapServer",
            HostProcess::DataRouter => "dataRouter",
        }
    }
}

impl fmt::Display for HostProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.process_name())
    }
}

/// Name of the directory holding one run's files: `run_0007`.
pub fn run_dir_name(run_number: u32) -> String {
    format!("run_{run_number:04}")
}

/// Operations available on one DAQ host.
#[async_trait]
pub trait WorkerAgent: Send + Sync {
    /// Move the staged data files into `EXPERIMENT/run_NNNN`.
    async fn organize_files(&self, experiment_name: &str, run_number: u32) -> AppResult<()>;

    /// Copy `source_paths` into `DEST_ROOT/EXPERIMENT/run_NNNN`.
    async fn backup_config_files(
        &self,
        experiment_name: &str,
        run_number: u32,
        source_paths: &[String],
        dest_root: &str,
    ) -> AppResult<()>;

    /// Whether `process` is running on the host.
    async fn check_status(&self, process: HostProcess) -> AppResult<bool>;

    /// True if no data files are waiting in the staging area.
    async fn staging_dir_is_clean(&self) -> AppResult<bool>;

    /// The last `lines` lines of a text file on the host.
    async fn tail_file(&self, path: &str, lines: usize) -> AppResult<String>;
}

/// Hands out the agent for a host.
pub trait WorkerProvider: Send + Sync {
    /// Agent operating on `host`.
    fn agent_for(&self, host: IpAddr) -> AppResult<Arc<dyn WorkerAgent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_dir_name_is_zero_padded() {
        assert_eq!(run_dir_name(0), "run_0000");
        assert_eq!(run_dir_name(42), "run_0042");
        assert_eq!(run_dir_name(12345), "run_12345");
    }
}
