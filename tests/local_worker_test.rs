//! Post-run jobs against the local filesystem agent.

mod common;

use common::{device_ip, router_ip, test_settings, SETTLE};
use daq_fleet::client::mock::{Completion, MockClientProvider};
use daq_fleet::device::{ConfigId, Device, DeviceState, TargetState};
use daq_fleet::error::DaqError;
use daq_fleet::fleet::FleetCoordinator;
use daq_fleet::ids::{DeviceId, RouterId};
use daq_fleet::store::Store;
use daq_fleet::topology::DataRouter;
use daq_fleet::worker::local::{LocalWorkerAgent, LocalWorkerProvider};
use daq_fleet::config::{Settings, TaskLimits, TimeoutConfig};
use std::fs;
use std::sync::Arc;

/// Process table scans can be slow on loaded machines.
fn settings() -> Settings {
    let mut settings = test_settings();
    settings.timeouts = TimeoutConfig::uniform(TaskLimits::secs(5, 10));
    settings
}

#[tokio::test]
async fn test_stop_moves_data_and_backs_up_configs() {
    let root = tempfile::tempdir().unwrap();
    let staging = root.path().join("staging");
    let configs = root.path().join("configs");
    let backups = root.path().join("backups");
    fs::create_dir_all(&staging).unwrap();
    fs::create_dir_all(&configs).unwrap();
    for step in ["describe-cobo", "prepare-base", "configure-beam"] {
        fs::write(configs.join(format!("{step}.xcfg")), step).unwrap();
    }

    let store = Arc::new(Store::new());
    let exp = store.add_experiment("e15503").unwrap();
    let mut device = Device::new(DeviceId(0), exp, "ecc0", device_ip(0));
    device.state = DeviceState::Running;
    device.selected_config = Some(ConfigId::new("cobo", "base", "beam"));
    device.config_root = configs.display().to_string();
    device.config_backup_root = backups.display().to_string();
    let device = store.add_device(device).unwrap();
    let router = store
        .add_router(DataRouter::new(RouterId(0), exp, "router-0", router_ip(0)))
        .unwrap();
    store.add_source("CoBo[0]", device, router).unwrap();
    store.activate_experiment(exp).unwrap();
    store.start_run(exp).unwrap();

    let fleet = FleetCoordinator::start(
        &settings(),
        store.clone(),
        Arc::new(MockClientProvider::new(Completion::Immediate)),
        Arc::new(LocalWorkerProvider::new(LocalWorkerAgent::new(&staging))),
    );

    fs::write(staging.join("run.graw"), b"frames").unwrap();
    let (online, clean) = fleet.jobs().check_router(router).await.unwrap();
    assert!(!clean);
    assert_eq!(store.router(router).unwrap().online, online);

    fleet
        .transition_fleet(exp, TargetState::State(DeviceState::Ready))
        .await
        .unwrap();
    assert!(fleet.dispatcher().wait_idle(SETTLE).await);

    let run_dir = staging.join("e15503").join("run_0000");
    assert!(run_dir.join("run.graw").is_file());
    assert!(!staging.join("run.graw").exists());
    assert!(store.router(router).unwrap().staging_clean);

    let backup_dir = backups.join("e15503").join("run_0000");
    assert_eq!(
        fs::read_to_string(backup_dir.join("configure-beam.xcfg")).unwrap(),
        "configure-beam"
    );
    assert!(backup_dir.join("describe-cobo.xcfg").is_file());
}

#[tokio::test]
async fn test_leftover_data_blocks_next_run() {
    let staging = tempfile::tempdir().unwrap();
    fs::write(staging.path().join("orphan.graw"), b"frames").unwrap();

    let store = Arc::new(Store::new());
    let exp = store.add_experiment("e15503").unwrap();
    let mut device = Device::new(DeviceId(0), exp, "ecc0", device_ip(0));
    device.state = DeviceState::Ready;
    device.selected_config = Some(ConfigId::new("cobo", "base", "beam"));
    store.add_device(device).unwrap();
    let router = store
        .add_router(DataRouter::new(RouterId(0), exp, "router-0", router_ip(0)))
        .unwrap();
    store.activate_experiment(exp).unwrap();

    let fleet = FleetCoordinator::start(
        &settings(),
        store.clone(),
        Arc::new(MockClientProvider::new(Completion::Immediate)),
        Arc::new(LocalWorkerProvider::new(LocalWorkerAgent::new(staging.path()))),
    );

    assert_eq!(fleet.check_routers_all().await.unwrap(), 1);
    assert!(fleet.dispatcher().wait_idle(SETTLE).await);
    assert!(!store.router(router).unwrap().staging_clean);

    let err = fleet
        .transition_fleet(exp, TargetState::State(DeviceState::Running))
        .await
        .unwrap_err();
    assert!(matches!(err, DaqError::NotReady(_)));
    assert!(!store.is_running(exp));
}
