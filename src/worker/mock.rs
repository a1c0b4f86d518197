//! Scriptable worker agents that record every call.

use super::{HostProcess, WorkerAgent, WorkerProvider};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// A call received by a mock agent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerCall {
    /// `organize_files`
    Organize {
        /// Host the agent runs on
        host: IpAddr,
        /// Experiment directory
        experiment: String,
        /// Run number
        run_number: u32,
    },
    /// `backup_config_files`
    Backup {
        /// Host the agent runs on
        host: IpAddr,
        /// Experiment directory
        experiment: String,
        /// Run number
        run_number: u32,
        /// Files copied
        sources: Vec<String>,
        /// Backup root
        dest_root: String,
    },
    /// `check_status`
    CheckStatus {
        /// Host the agent runs on
        host: IpAddr,
        /// Process checked
        process: HostProcess,
    },
    /// `staging_dir_is_clean`
    StagingCheck {
        /// Host the agent runs on
        host: IpAddr,
    },
    /// `tail_file`
    Tail {
        /// Host the agent runs on
        host: IpAddr,
        /// File read
        path: String,
        /// Lines requested
        lines: usize,
    },
}

#[derive(Debug, Default)]
struct Shared {
    calls: Mutex<Vec<WorkerCall>>,
    dirty: Mutex<HashSet<IpAddr>>,
    offline: Mutex<HashSet<IpAddr>>,
    failing: Mutex<HashSet<IpAddr>>,
    latency: Mutex<Option<Duration>>,
}

/// Provider of [`MockWorkerAgent`]s sharing one call log.
#[derive(Clone, Debug, Default)]
pub struct MockWorkerProvider {
    shared: Arc<Shared>,
}

impl MockWorkerProvider {
    /// All hosts clean, online and healthy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Leave data files in `host`'s staging area until it is organized.
    pub fn set_dirty(&self, host: IpAddr, dirty: bool) {
        let mut set = self.shared.dirty.lock();
        if dirty {
            set.insert(host);
        } else {
            set.remove(&host);
        }
    }

    /// Report every process on `host` as not running.
    pub fn set_offline(&self, host: IpAddr, offline: bool) {
        let mut set = self.shared.offline.lock();
        if offline {
            set.insert(host);
        } else {
            set.remove(&host);
        }
    }

    /// Fail every call to `host` with a remote error.
    pub fn set_failing(&self, host: IpAddr, failing: bool) {
        let mut set = self.shared.failing.lock();
        if failing {
            set.insert(host);
        } else {
            set.remove(&host);
        }
    }

    /// Delay every call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.shared.latency.lock() = latency;
    }

    /// Calls received so far, across all hosts.
    pub fn calls(&self) -> Vec<WorkerCall> {
        self.shared.calls.lock().clone()
    }
}

impl WorkerProvider for MockWorkerProvider {
    fn agent_for(&self, host: IpAddr) -> AppResult<Arc<dyn WorkerAgent>> {
        Ok(Arc::new(MockWorkerAgent {
            host,
            shared: self.shared.clone(),
        }))
    }
}

/// Mock agent bound to one host.
#[derive(Debug)]
pub struct MockWorkerAgent {
    host: IpAddr,
    shared: Arc<Shared>,
}

impl MockWorkerAgent {
    async fn record(&self, call: WorkerCall) -> AppResult<()> {
        let latency = *self.shared.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.shared.calls.lock().push(call);
        if self.shared.failing.lock().contains(&self.host) {
            return Err(DaqError::Remote(format!("host {} unreachable", self.host)));
        }
        Ok(())
    }
}

#[async_trait]
impl WorkerAgent for MockWorkerAgent {
    async fn organize_files(&self, experiment_name: &str, run_number: u32) -> AppResult<()> {
        self.record(WorkerCall::Organize {
            host: self.host,
            experiment: experiment_name.to_string(),
            run_number,
        })
        .await?;
        self.shared.dirty.lock().remove(&self.host);
        Ok(())
    }

    async fn backup_config_files(
        &self,
        experiment_name: &str,
        run_number: u32,
        source_paths: &[String],
        dest_root: &str,
    ) -> AppResult<()> {
        self.record(WorkerCall::Backup {
            host: self.host,
            experiment: experiment_name.to_string(),
            run_number,
            sources: source_paths.to_vec(),
            dest_root: dest_root.to_string(),
        })
        .await
    }

    async fn check_status(&self, process: HostProcess) -> AppResult<bool> {
        self.record(WorkerCall::CheckStatus {
            host: self.host,
            process,
        })
        .await?;
        Ok(!self.shared.offline.lock().contains(&self.host))
    }

    async fn staging_dir_is_clean(&self) -> AppResult<bool> {
        self.record(WorkerCall::StagingCheck { host: self.host }).await?;
        Ok(!self.shared.dirty.lock().contains(&self.host))
    }

    async fn tail_file(&self, path: &str, lines: usize) -> AppResult<String> {
        self.record(WorkerCall::Tail {
            host: self.host,
            path: path.to_string(),
            lines,
        })
        .await?;
        Ok((1..=lines)
            .map(|i| format!("{path}: line {i}"))
            .collect::<Vec<_>>()
            .join("\n"))
    }
}
