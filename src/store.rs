//! In-memory record store for experiments, devices, topology and runs.
//!
//! All tables live behind one `parking_lot::RwLock`. Critical sections are
//! short and never span an await point, so each field write is atomic and
//! concurrent writers resolve as last-write-wins. Readers get clones.
//!
//! The whole store round-trips through a JSON [`Snapshot`]; saving writes a
//! temporary file next to the target and renames it into place.

use crate::device::Device;
use crate::error::{AppResult, DaqError};
use crate::experiment::{Experiment, RunRecord};
use crate::ids::{DeviceId, ExperimentId, RouterId, RunId, SourceId};
use crate::topology::{links_for_device, DataLink, DataRouter, DataSource};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

#[derive(Debug, Default)]
pub(crate) struct Tables {
    pub(crate) experiments: BTreeMap<ExperimentId, Experiment>,
    pub(crate) devices: BTreeMap<DeviceId, Device>,
    pub(crate) routers: BTreeMap<RouterId, DataRouter>,
    pub(crate) sources: BTreeMap<SourceId, DataSource>,
    pub(crate) runs: BTreeMap<RunId, RunRecord>,
    pub(crate) next_id: u64,
}

impl Tables {
    pub(crate) fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Serializable image of the whole store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Experiments
    pub experiments: Vec<Experiment>,
    /// Device controllers
    pub devices: Vec<Device>,
    /// Data routers
    pub routers: Vec<DataRouter>,
    /// Topology entries
    pub sources: Vec<DataSource>,
    /// Run records
    pub runs: Vec<RunRecord>,
    /// Last id handed out
    pub next_id: u64,
}

/// Thread-safe record store shared by the coordinator, orchestrator and jobs.
#[derive(Debug, Default)]
pub struct Store {
    pub(crate) tables: RwLock<Tables>,
}

impl Store {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    // ---- experiments -------------------------------------------------------

    /// Add an inactive experiment.
    pub fn add_experiment(&self, name: &str) -> AppResult<ExperimentId> {
        let mut tables = self.tables.write();
        if tables.experiments.values().any(|e| e.name == name) {
            return Err(DaqError::Duplicate {
                kind: "experiment",
                name: name.to_string(),
            });
        }
        let id = ExperimentId(tables.allocate());
        tables.experiments.insert(
            id,
            Experiment {
                id,
                name: name.to_string(),
                is_active: false,
            },
        );
        Ok(id)
    }

    /// Experiment by id.
    pub fn experiment(&self, id: ExperimentId) -> AppResult<Experiment> {
        self.tables
            .read()
            .experiments
            .get(&id)
            .cloned()
            .ok_or_else(|| DaqError::not_found("Experiment", id))
    }

    /// Experiment by name.
    pub fn experiment_by_name(&self, name: &str) -> Option<Experiment> {
        self.tables
            .read()
            .experiments
            .values()
            .find(|e| e.name == name)
            .cloned()
    }

    /// All experiments in id order.
    pub fn experiments(&self) -> Vec<Experiment> {
        self.tables.read().experiments.values().cloned().collect()
    }

    // ---- devices -----------------------------------------------------------

    /// Add a device; its `id` field is replaced by a fresh id.
    pub fn add_device(&self, mut device: Device) -> AppResult<DeviceId> {
        let mut tables = self.tables.write();
        if !tables.experiments.contains_key(&device.experiment_id) {
            return Err(DaqError::not_found("Experiment", device.experiment_id));
        }
        let taken = tables
            .devices
            .values()
            .any(|d| d.experiment_id == device.experiment_id && d.name == device.name);
        if taken {
            return Err(DaqError::Duplicate {
                kind: "device",
                name: device.name,
            });
        }
        let id = DeviceId(tables.allocate());
        device.id = id;
        tables.devices.insert(id, device);
        Ok(id)
    }

    /// Snapshot of one device.
    pub fn device(&self, id: DeviceId) -> AppResult<Device> {
        self.tables
            .read()
            .devices
            .get(&id)
            .cloned()
            .ok_or_else(|| DaqError::not_found("Device", id))
    }

    /// Snapshots of every device of an experiment, in id order.
    pub fn devices_in(&self, experiment: ExperimentId) -> Vec<Device> {
        self.tables
            .read()
            .devices
            .values()
            .filter(|d| d.experiment_id == experiment)
            .cloned()
            .collect()
    }

    /// Apply `f` to the stored device under the write lock.
    pub fn update_device<F, R>(&self, id: DeviceId, f: F) -> AppResult<R>
    where
        F: FnOnce(&mut Device) -> R,
    {
        let mut tables = self.tables.write();
        let device = tables
            .devices
            .get_mut(&id)
            .ok_or_else(|| DaqError::not_found("Device", id))?;
        Ok(f(device))
    }

    // ---- topology ----------------------------------------------------------

    /// Add a router; its `id` field is replaced by a fresh id.
    pub fn add_router(&self, mut router: DataRouter) -> AppResult<RouterId> {
        let mut tables = self.tables.write();
        if !tables.experiments.contains_key(&router.experiment_id) {
            return Err(DaqError::not_found("Experiment", router.experiment_id));
        }
        let taken = tables
            .routers
            .values()
            .any(|r| r.experiment_id == router.experiment_id && r.name == router.name);
        if taken {
            return Err(DaqError::Duplicate {
                kind: "data router",
                name: router.name,
            });
        }
        let id = RouterId(tables.allocate());
        router.id = id;
        tables.routers.insert(id, router);
        Ok(id)
    }

    /// Snapshot of one router.
    pub fn router(&self, id: RouterId) -> AppResult<DataRouter> {
        self.tables
            .read()
            .routers
            .get(&id)
            .cloned()
            .ok_or_else(|| DaqError::not_found("DataRouter", id))
    }

    /// Routers of an experiment, in id order.
    pub fn routers_in(&self, experiment: ExperimentId) -> Vec<DataRouter> {
        self.tables
            .read()
            .routers
            .values()
            .filter(|r| r.experiment_id == experiment)
            .cloned()
            .collect()
    }

    /// Apply `f` to the stored router under the write lock.
    pub fn update_router<F, R>(&self, id: RouterId, f: F) -> AppResult<R>
    where
        F: FnOnce(&mut DataRouter) -> R,
    {
        let mut tables = self.tables.write();
        let router = tables
            .routers
            .get_mut(&id)
            .ok_or_else(|| DaqError::not_found("DataRouter", id))?;
        Ok(f(router))
    }

    /// Route data from `device` to `router` under the sender name `name`.
    pub fn add_source(
        &self,
        name: &str,
        device: DeviceId,
        router: RouterId,
    ) -> AppResult<SourceId> {
        let mut tables = self.tables.write();
        let experiment = tables
            .devices
            .get(&device)
            .map(|d| d.experiment_id)
            .ok_or_else(|| DaqError::not_found("Device", device))?;
        if !tables.routers.contains_key(&router) {
            return Err(DaqError::not_found("DataRouter", router));
        }
        let taken = tables.sources.values().any(|s| {
            s.name == name
                && tables
                    .devices
                    .get(&s.device_id)
                    .is_some_and(|d| d.experiment_id == experiment)
        });
        if taken {
            return Err(DaqError::Duplicate {
                kind: "data source",
                name: name.to_string(),
            });
        }
        let id = SourceId(tables.allocate());
        tables.sources.insert(
            id,
            DataSource {
                id,
                name: name.to_string(),
                device_id: device,
                router_id: router,
            },
        );
        Ok(id)
    }

    /// Topology entries pointing at `device`.
    pub fn sources_for(&self, device: DeviceId) -> Vec<DataSource> {
        self.tables
            .read()
            .sources
            .values()
            .filter(|s| s.device_id == device)
            .cloned()
            .collect()
    }

    /// Resolved datalinks of `device`.
    ///
    /// # Errors
    ///
    /// `NotFound` if the device is unknown or a source names a missing router.
    pub fn datalinks_for(&self, device: DeviceId) -> AppResult<Vec<DataLink>> {
        let tables = self.tables.read();
        if !tables.devices.contains_key(&device) {
            return Err(DaqError::not_found("Device", device));
        }
        let routers: Vec<DataRouter> = tables.routers.values().cloned().collect();
        links_for_device(device, tables.sources.values(), &routers)
    }

    // ---- runs --------------------------------------------------------------

    /// Run record by id.
    pub fn run(&self, id: RunId) -> AppResult<RunRecord> {
        self.tables
            .read()
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| DaqError::not_found("RunRecord", id))
    }

    /// Runs of an experiment ordered by run number.
    pub fn runs_for(&self, experiment: ExperimentId) -> Vec<RunRecord> {
        let mut runs: Vec<RunRecord> = self
            .tables
            .read()
            .runs
            .values()
            .filter(|r| r.experiment_id == experiment)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.run_number);
        runs
    }

    // ---- snapshots ---------------------------------------------------------

    /// Copy the whole store.
    pub fn snapshot(&self) -> Snapshot {
        let tables = self.tables.read();
        Snapshot {
            experiments: tables.experiments.values().cloned().collect(),
            devices: tables.devices.values().cloned().collect(),
            routers: tables.routers.values().cloned().collect(),
            sources: tables.sources.values().cloned().collect(),
            runs: tables.runs.values().cloned().collect(),
            next_id: tables.next_id,
        }
    }

    /// Rebuild a store from a snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let tables = Tables {
            experiments: snapshot.experiments.into_iter().map(|e| (e.id, e)).collect(),
            devices: snapshot.devices.into_iter().map(|d| (d.id, d)).collect(),
            routers: snapshot.routers.into_iter().map(|r| (r.id, r)).collect(),
            sources: snapshot.sources.into_iter().map(|s| (s.id, s)).collect(),
            runs: snapshot.runs.into_iter().map(|r| (r.id, r)).collect(),
            next_id: snapshot.next_id,
        };
        Self {
            tables: RwLock::new(tables),
        }
    }

    /// Write a JSON snapshot to `path` atomically.
    pub fn save_snapshot(&self, path: &Path) -> AppResult<()> {
        let json = serde_json::to_vec_pretty(&self.snapshot())?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        info!(path = %path.display(), "Saved store snapshot");
        Ok(())
    }

    /// Load a store from a JSON snapshot written by [`Store::save_snapshot`].
    pub fn load_snapshot(path: &Path) -> AppResult<Self> {
        let bytes = std::fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        Ok(Self::from_snapshot(snapshot))
    }
}
