//! Run numbering, run gating and experiment activation.

mod common;

use chrono::{Duration, Utc};
use common::{test_settings, Harness};
use daq_fleet::client::mock::Completion;
use daq_fleet::device::{DeviceState, TargetState};
use daq_fleet::error::DaqError;
use daq_fleet::experiment::RunClass;
use daq_fleet::export;
use daq_fleet::store::Store;
use std::fs::File;

async fn move_fleet(h: &Harness, target: DeviceState) {
    h.fleet
        .transition_fleet(h.experiment, TargetState::State(target))
        .await
        .unwrap();
    h.settle().await;
    h.reconcile_all().await;
    assert_eq!(
        h.store
            .devices_in(h.experiment)
            .iter()
            .filter(|d| d.state == target && !d.transitioning)
            .count(),
        h.devices.len()
    );
}

#[tokio::test]
async fn test_runs_are_numbered_per_experiment() {
    let h = Harness::with_settings(2, 1, DeviceState::Ready, Completion::Immediate, test_settings());

    for expected in 0..3 {
        move_fleet(&h, DeviceState::Running).await;
        let run = h.store.latest_run(h.experiment).unwrap();
        assert_eq!(run.run_number, expected);
        assert!(run.stop.is_none());
        assert_eq!(run.config_names, vec!["beam".to_string()]);

        move_fleet(&h, DeviceState::Ready).await;
        assert!(h.store.latest_run(h.experiment).unwrap().stop.is_some());
    }

    let numbers: Vec<u32> = h
        .store
        .runs_for(h.experiment)
        .iter()
        .map(|r| r.run_number)
        .collect();
    assert_eq!(numbers, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_run_guards() {
    let h = Harness::new(1, 1, DeviceState::Idle);

    assert!(matches!(h.store.stop_run(h.experiment), Err(DaqError::NotRunning)));
    h.store.start_run(h.experiment).unwrap();
    assert!(matches!(h.store.start_run(h.experiment), Err(DaqError::AlreadyRunning)));
    h.store.stop_run(h.experiment).unwrap();
    assert!(matches!(h.store.stop_run(h.experiment), Err(DaqError::NotRunning)));
}

#[tokio::test]
async fn test_running_target_while_running_opens_no_new_run() {
    let h = Harness::new(2, 1, DeviceState::Ready);
    h.store.start_run(h.experiment).unwrap();

    let result = h
        .fleet
        .transition_fleet(h.experiment, TargetState::State(DeviceState::Running))
        .await
        .unwrap();
    assert!(result.run_started.is_none());
    assert_eq!(h.store.runs_for(h.experiment).len(), 1);
}

#[tokio::test]
async fn test_activation_refused_while_devices_busy() {
    let h = Harness::new(2, 1, DeviceState::Idle);
    let other = h.store.add_experiment("e16010").unwrap();

    h.store
        .update_device(h.devices[0], |d| d.transitioning = true)
        .unwrap();
    let err = h.store.activate_experiment(other).unwrap_err();
    assert!(matches!(err, DaqError::ExperimentBusy(ref names) if names == "ecc0"));

    h.store
        .update_device(h.devices[0], |d| {
            d.transitioning = false;
            d.state = DeviceState::Prepared;
        })
        .unwrap();
    assert!(h.store.activate_experiment(other).is_err());

    h.store
        .update_device(h.devices[0], |d| d.state = DeviceState::Idle)
        .unwrap();
    h.store.activate_experiment(other).unwrap();
    assert_eq!(h.store.require_active().unwrap().name, "e16010");
    assert!(!h.store.experiment(h.experiment).unwrap().is_active);
}

#[tokio::test]
async fn test_polling_needs_an_active_experiment() {
    let store = Store::new();
    assert!(matches!(store.require_active(), Err(DaqError::NoActiveExperiment)));

    let h = Harness::new(1, 1, DeviceState::Idle);
    assert_eq!(h.fleet.refresh_all().await.unwrap(), 1);
    assert_eq!(h.fleet.check_routers_all().await.unwrap(), 1);
    h.settle().await;
}

#[tokio::test]
async fn test_snapshot_survives_a_run() {
    let h = Harness::with_settings(2, 2, DeviceState::Ready, Completion::Immediate, test_settings());
    move_fleet(&h, DeviceState::Running).await;
    move_fleet(&h, DeviceState::Ready).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fleet.json");
    h.store.save_snapshot(&path).unwrap();

    let restored = Store::load_snapshot(&path).unwrap();
    assert_eq!(restored.snapshot(), h.store.snapshot());
    assert_eq!(restored.runs_for(h.experiment).len(), 1);
    assert_eq!(restored.require_active().unwrap().id, h.experiment);
}

#[tokio::test]
async fn test_clock_step_back_does_not_reopen_runs() {
    let h = Harness::new(1, 1, DeviceState::Idle);
    h.store.start_run(h.experiment).unwrap();
    h.store.stop_run(h.experiment).unwrap();

    let mut snapshot = h.store.snapshot();
    snapshot.runs[0].start = Utc::now() + Duration::hours(1);
    let store = Store::from_snapshot(snapshot);

    let second = store.start_run(h.experiment).unwrap();
    assert_eq!(second.run_number, 1);
    assert!(store.is_running(h.experiment));
    assert!(matches!(store.start_run(h.experiment), Err(DaqError::AlreadyRunning)));
    assert_eq!(store.stop_run(h.experiment).unwrap().id, second.id);

    store.start_run(h.experiment).unwrap();
    let numbers: Vec<u32> = store
        .runs_for(h.experiment)
        .iter()
        .map(|r| r.run_number)
        .collect();
    assert_eq!(numbers, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_run_metadata_export() {
    let h = Harness::with_settings(2, 1, DeviceState::Ready, Completion::Immediate, test_settings());
    for _ in 0..2 {
        move_fleet(&h, DeviceState::Running).await;
        move_fleet(&h, DeviceState::Ready).await;
    }
    let first = h.store.runs_for(h.experiment)[0].id;
    h.store
        .annotate_run(first, Some("Calibration".into()), Some(RunClass::Testing))
        .unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(export::run_metadata_file_name("e15503"));
    let rows = export::write_run_metadata(&h.store, h.experiment, File::create(&path).unwrap()).unwrap();
    assert_eq!(rows, 2);

    let mut reader = csv::Reader::from_path(&path).unwrap();
    let records: Vec<csv::StringRecord> = reader.records().map(Result::unwrap).collect();
    let numbers: Vec<&str> = records.iter().map(|r| &r[0]).collect();
    assert_eq!(numbers, vec!["0", "1"]);
    assert_eq!(&records[0][1], "Testing");
    assert_eq!(&records[0][2], "Calibration");
    assert_eq!(&records[1][5], "beam");
    assert!(records.iter().all(|r| !r[4].is_empty()));
}
