//! Experiments and the run lifecycle.
//!
//! At most one experiment is active at a time. Runs are numbered per
//! experiment from 0 and the numbers only grow. An experiment is running
//! while any of its runs has no stop timestamp; start times play no part,
//! so a wall clock stepping backwards cannot reopen or reuse a run number.
//! Run records are never deleted.

use crate::device::DeviceState;
use crate::error::{AppResult, DaqError};
use crate::ids::{ExperimentId, RunId};
use crate::store::Store;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::info;

/// An experiment owning devices, routers and runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    /// Store id
    pub id: ExperimentId,
    /// Unique name, also used as the data directory name
    pub name: String,
    /// The single active experiment
    pub is_active: bool,
}

/// Classification attached to a run by the operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunClass {
    /// Test run
    Testing,
    /// Production data
    Production,
    /// Beam on target
    Beam,
    /// Discard
    Junk,
    /// Pulser run
    Pulser,
}

impl RunClass {
    /// Name shown to operators and written to exports.
    pub fn as_str(self) -> &'static str {
        match self {
            RunClass::Testing => "Testing",
            RunClass::Production => "Production",
            RunClass::Beam => "Beam",
            RunClass::Junk => "Junk",
            RunClass::Pulser => "Pulser",
        }
    }
}

impl fmt::Display for RunClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One acquisition run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Store id
    pub id: RunId,
    /// Owning experiment
    pub experiment_id: ExperimentId,
    /// Sequential number within the experiment
    pub run_number: u32,
    /// When `start_run` was called
    pub start: DateTime<Utc>,
    /// When `stop_run` was called
    pub stop: Option<DateTime<Utc>>,
    /// Configure-step names in effect when the run started
    pub config_names: Vec<String>,
    /// Optional operator title
    #[serde(default)]
    pub title: Option<String>,
    /// Optional classification
    #[serde(default)]
    pub run_class: Option<RunClass>,
}

impl RunRecord {
    /// Config names joined as they are shown to operators.
    pub fn config_name(&self) -> String {
        self.config_names.join(", ")
    }

    /// Elapsed time; measured up to `now` while the run is open.
    pub fn duration(&self, now: DateTime<Utc>) -> Duration {
        self.stop.unwrap_or(now) - self.start
    }

    /// Duration formatted as `HH:MM:SS`.
    pub fn duration_string(&self, now: DateTime<Utc>) -> String {
        let secs = self.duration(now).num_seconds().max(0);
        format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

impl Store {
    /// The active experiment, if any.
    pub fn active_experiment(&self) -> Option<Experiment> {
        self.tables
            .read()
            .experiments
            .values()
            .find(|e| e.is_active)
            .cloned()
    }

    /// The active experiment, or [`DaqError::NoActiveExperiment`].
    pub fn require_active(&self) -> AppResult<Experiment> {
        self.active_experiment().ok_or(DaqError::NoActiveExperiment)
    }

    /// Make `id` the single active experiment.
    ///
    /// Swapping away from another active experiment is refused with
    /// [`DaqError::ExperimentBusy`] while any device is not Idle or is
    /// transitioning. Check and write happen under one lock.
    pub fn activate_experiment(&self, id: ExperimentId) -> AppResult<()> {
        let mut tables = self.tables.write();
        if !tables.experiments.contains_key(&id) {
            return Err(DaqError::not_found("Experiment", id));
        }

        let current = tables.experiments.values().find(|e| e.is_active).map(|e| e.id);
        if current == Some(id) {
            return Ok(());
        }
        if current.is_some() {
            let busy: Vec<String> = tables
                .devices
                .values()
                .filter(|d| d.state != DeviceState::Idle || d.transitioning)
                .map(|d| d.name.clone())
                .collect();
            if !busy.is_empty() {
                return Err(DaqError::ExperimentBusy(busy.join(", ")));
            }
        }

        for experiment in tables.experiments.values_mut() {
            experiment.is_active = experiment.id == id;
        }
        info!(experiment = %id, previous = ?current, "Activated experiment");
        Ok(())
    }

    /// The run with the highest run number.
    pub fn latest_run(&self, experiment: ExperimentId) -> Option<RunRecord> {
        self.tables
            .read()
            .runs
            .values()
            .filter(|r| r.experiment_id == experiment)
            .max_by_key(|r| r.run_number)
            .cloned()
    }

    /// The run without a stop timestamp, if any.
    pub fn open_run(&self, experiment: ExperimentId) -> Option<RunRecord> {
        self.tables
            .read()
            .runs
            .values()
            .find(|r| r.experiment_id == experiment && r.stop.is_none())
            .cloned()
    }

    /// True if some run of the experiment has not been stopped.
    pub fn is_running(&self, experiment: ExperimentId) -> bool {
        self.open_run(experiment).is_some()
    }

    /// Number the next run will get.
    pub fn next_run_number(&self, experiment: ExperimentId) -> u32 {
        self.latest_run(experiment)
            .map_or(0, |run| run.run_number + 1)
    }

    /// Open a new run, recording the configure names of the experiment's devices.
    pub fn start_run(&self, experiment: ExperimentId) -> AppResult<RunRecord> {
        let mut tables = self.tables.write();
        if !tables.experiments.contains_key(&experiment) {
            return Err(DaqError::not_found("Experiment", experiment));
        }

        let runs = tables.runs.values().filter(|r| r.experiment_id == experiment);
        if runs.clone().any(|r| r.stop.is_none()) {
            return Err(DaqError::AlreadyRunning);
        }
        let run_number = runs.map(|r| r.run_number).max().map_or(0, |n| n + 1);

        let config_names: BTreeSet<String> = tables
            .devices
            .values()
            .filter(|d| d.experiment_id == experiment)
            .filter_map(|d| d.selected_config.as_ref().map(|c| c.configure.clone()))
            .collect();

        let id = RunId(tables.allocate());
        let run = RunRecord {
            id,
            experiment_id: experiment,
            run_number,
            start: Utc::now(),
            stop: None,
            config_names: config_names.into_iter().collect(),
            title: None,
            run_class: None,
        };
        tables.runs.insert(id, run.clone());
        info!(experiment = %experiment, run_number, "Started run");
        Ok(run)
    }

    /// Close the open run, whatever its start time.
    pub fn stop_run(&self, experiment: ExperimentId) -> AppResult<RunRecord> {
        let mut tables = self.tables.write();
        let run = tables
            .runs
            .values_mut()
            .find(|r| r.experiment_id == experiment && r.stop.is_none())
            .ok_or(DaqError::NotRunning)?;
        run.stop = Some(Utc::now());
        info!(experiment = %experiment, run_number = run.run_number, "Stopped run");
        Ok(run.clone())
    }

    /// Set the operator-facing title and class of a run.
    pub fn annotate_run(
        &self,
        id: RunId,
        title: Option<String>,
        run_class: Option<RunClass>,
    ) -> AppResult<RunRecord> {
        let mut tables = self.tables.write();
        let run = tables
            .runs
            .get_mut(&id)
            .ok_or_else(|| DaqError::not_found("RunRecord", id))?;
        run.title = title;
        run.run_class = run_class;
        Ok(run.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ConfigId, Device};
    use crate::ids::DeviceId;
    use chrono::TimeZone;
    use std::net::{IpAddr, Ipv4Addr};

    fn add_device(store: &Store, exp: ExperimentId, name: &str, configure: Option<&str>) -> DeviceId {
        let mut device = Device::new(
            DeviceId(0),
            exp,
            name,
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        );
        device.selected_config = configure.map(|c| ConfigId::new("cobo", "base", c));
        store.add_device(device).unwrap()
    }

    #[test]
    fn test_run_numbering_and_guards() {
        let store = Store::new();
        let exp = store.add_experiment("e15503").unwrap();

        assert!(!store.is_running(exp));
        assert_eq!(store.next_run_number(exp), 0);
        assert!(matches!(store.stop_run(exp), Err(DaqError::NotRunning)));

        for expected in 0..3 {
            let run = store.start_run(exp).unwrap();
            assert_eq!(run.run_number, expected);
            assert!(store.is_running(exp));
            assert!(matches!(store.start_run(exp), Err(DaqError::AlreadyRunning)));

            let stopped = store.stop_run(exp).unwrap();
            assert!(stopped.stop.is_some());
            assert!(!store.is_running(exp));
            assert!(matches!(store.stop_run(exp), Err(DaqError::NotRunning)));
        }
        assert_eq!(store.runs_for(exp).len(), 3);
    }

    #[test]
    fn test_run_lifecycle_ignores_start_times() {
        let store = Store::new();
        let exp = store.add_experiment("e15503").unwrap();
        store.start_run(exp).unwrap();
        store.stop_run(exp).unwrap();

        // Clock stepped back after run 0 was recorded.
        let mut snapshot = store.snapshot();
        snapshot.runs[0].start = Utc::now() + Duration::hours(1);
        let store = Store::from_snapshot(snapshot);

        let run = store.start_run(exp).unwrap();
        assert_eq!(run.run_number, 1);
        assert!(store.is_running(exp));
        assert_eq!(store.open_run(exp).unwrap().id, run.id);
        assert!(matches!(store.start_run(exp), Err(DaqError::AlreadyRunning)));

        let stopped = store.stop_run(exp).unwrap();
        assert_eq!(stopped.id, run.id);
        assert!(!store.is_running(exp));
        assert_eq!(store.latest_run(exp).unwrap().run_number, 1);

        assert_eq!(store.start_run(exp).unwrap().run_number, 2);
        let numbers: Vec<u32> = store.runs_for(exp).iter().map(|r| r.run_number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[test]
    fn test_config_names_snapshot() {
        let store = Store::new();
        let exp = store.add_experiment("e15503").unwrap();
        add_device(&store, exp, "ecc0", Some("beam"));
        add_device(&store, exp, "ecc1", Some("beam"));
        add_device(&store, exp, "ecc2", Some("pulser"));
        add_device(&store, exp, "ecc3", None);

        let run = store.start_run(exp).unwrap();
        assert_eq!(run.config_names, vec!["beam", "pulser"]);
        assert_eq!(run.config_name(), "beam, pulser");
    }

    #[test]
    fn test_activation_swap_refused_while_busy() {
        let store = Store::new();
        let first = store.add_experiment("first").unwrap();
        let second = store.add_experiment("second").unwrap();
        let dev = add_device(&store, first, "ecc0", Some("beam"));

        store.activate_experiment(first).unwrap();
        assert_eq!(store.require_active().unwrap().id, first);

        store
            .update_device(dev, |d| d.state = DeviceState::Described)
            .unwrap();
        assert!(matches!(
            store.activate_experiment(second),
            Err(DaqError::ExperimentBusy(names)) if names == "ecc0"
        ));
        assert_eq!(store.require_active().unwrap().id, first);

        store
            .update_device(dev, |d| {
                d.state = DeviceState::Idle;
                d.transitioning = true;
            })
            .unwrap();
        assert!(store.activate_experiment(second).is_err());

        store.update_device(dev, |d| d.transitioning = false).unwrap();
        store.activate_experiment(second).unwrap();
        let active: Vec<_> = store
            .experiments()
            .into_iter()
            .filter(|e| e.is_active)
            .map(|e| e.id)
            .collect();
        assert_eq!(active, vec![second]);
    }

    #[test]
    fn test_no_active_experiment() {
        let store = Store::new();
        store.add_experiment("idle").unwrap();
        assert!(matches!(store.require_active(), Err(DaqError::NoActiveExperiment)));
    }

    #[test]
    fn test_duration_string() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let mut run = RunRecord {
            id: RunId(1),
            experiment_id: ExperimentId(1),
            run_number: 0,
            start,
            stop: None,
            config_names: Vec::new(),
            title: None,
            run_class: None,
        };
        let now = start + Duration::seconds(3 * 3600 + 25 * 60 + 7);
        assert_eq!(run.duration_string(now), "03:25:07");

        run.stop = Some(start + Duration::seconds(59));
        assert_eq!(run.duration_string(now), "00:00:59");
    }
}
