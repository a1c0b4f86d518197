//! Background jobs that run on worker hosts: router checks and post-run bookkeeping.
//!
//! Post-run jobs look their records up when they run. A record that has
//! vanished by then is logged and skipped; nothing here ever rolls back a
//! stopped run.

use crate::dispatch::{TaskKind, TaskUnit};
use crate::error::{AppResult, DaqError};
use crate::ids::{DeviceId, ExperimentId, RouterId, RunId};
use crate::store::Store;
use crate::worker::{HostProcess, WorkerProvider};
use std::sync::Arc;
use tracing::{error, info, warn};

fn skip_missing(job: &str, result: AppResult<()>) -> AppResult<()> {
    match result {
        Err(e @ DaqError::NotFound { .. }) => {
            warn!("{} skipped: {}", job, e);
            Ok(())
        }
        other => other,
    }
}

/// Router checks and post-run jobs against the worker hosts.
#[derive(Clone)]
pub struct HostJobs {
    store: Arc<Store>,
    workers: Arc<dyn WorkerProvider>,
}

impl HostJobs {
    /// Jobs reading records from `store` and reaching hosts through `workers`.
    pub fn new(store: Arc<Store>, workers: Arc<dyn WorkerProvider>) -> Self {
        Self { store, workers }
    }

    /// Check the router process and its staging area; store both results.
    pub async fn check_router(&self, id: RouterId) -> AppResult<(bool, bool)> {
        let router = self.store.router(id)?;
        let agent = self.workers.agent_for(router.address)?;
        let online = agent.check_status(HostProcess::DataRouter).await?;
        let clean = agent.staging_dir_is_clean().await?;
        self.store.update_router(id, |r| {
            r.online = online;
            r.staging_clean = clean;
        })?;
        Ok((online, clean))
    }

    /// Move the router's data files into the run directory and mark its staging area clean.
    pub async fn organize_files(
        &self,
        router: RouterId,
        experiment: ExperimentId,
        run: RunId,
    ) -> AppResult<()> {
        let result = async {
            let router_rec = self.store.router(router)?;
            let experiment_rec = self.store.experiment(experiment)?;
            let run_rec = self.store.run(run)?;
            let agent = self.workers.agent_for(router_rec.address)?;
            agent
                .organize_files(&experiment_rec.name, run_rec.run_number)
                .await?;
            self.store.update_router(router, |r| r.staging_clean = true)?;
            info!(
                router = %router_rec.name,
                run_number = run_rec.run_number,
                "Organized data files"
            );
            Ok::<(), DaqError>(())
        }
        .await;
        skip_missing("organize_files", result)
    }

    /// Copy the device's three config files into `BACKUP_ROOT/EXPERIMENT/run_NNNN`.
    pub async fn backup_config_files(
        &self,
        device: DeviceId,
        experiment: ExperimentId,
        run: RunId,
    ) -> AppResult<()> {
        let result = async {
            let device_rec = self.store.device(device)?;
            let experiment_rec = self.store.experiment(experiment)?;
            let run_rec = self.store.run(run)?;
            let paths = device_rec.config_file_paths()?;
            let agent = self.workers.agent_for(device_rec.address)?;
            agent
                .backup_config_files(
                    &experiment_rec.name,
                    run_rec.run_number,
                    &paths,
                    &device_rec.config_backup_root,
                )
                .await?;
            info!(
                device = %device_rec.name,
                run_number = run_rec.run_number,
                "Backed up config files"
            );
            Ok::<(), DaqError>(())
        }
        .await;
        skip_missing("backup_config_files", result)
    }

    /// Unit running [`Self::check_router`].
    pub fn check_router_unit(&self, id: RouterId, label: String) -> TaskUnit {
        let this = self.clone();
        TaskUnit::new(TaskKind::CheckRouter, label, async move {
            this.check_router(id).await.map(|_| ())
        })
    }

    /// One organize unit per router of the experiment.
    pub fn organize_units(&self, experiment: ExperimentId, run: RunId) -> Vec<TaskUnit> {
        self.store
            .routers_in(experiment)
            .into_iter()
            .map(|router| {
                let this = self.clone();
                TaskUnit::new(
                    TaskKind::OrganizeFiles,
                    format!("organize files on {}", router.name),
                    async move { this.organize_files(router.id, experiment, run).await },
                )
            })
            .collect()
    }

    /// One backup unit per device of the experiment that has a selected config.
    pub fn backup_units(&self, experiment: ExperimentId, run: RunId) -> Vec<TaskUnit> {
        let devices = self.store.devices_in(experiment);
        if devices.is_empty() {
            error!(experiment = %experiment, "No devices to back up config files from");
        }
        devices
            .into_iter()
            .filter(|device| device.selected_config.is_some())
            .map(|device| {
                let this = self.clone();
                TaskUnit::new(
                    TaskKind::BackupConfig,
                    format!("back up configs of {}", device.name),
                    async move { this.backup_config_files(device.id, experiment, run).await },
                )
            })
            .collect()
    }
}
