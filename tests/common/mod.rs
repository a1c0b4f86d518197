//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use daq_fleet::client::mock::{Completion, MockClientProvider, MockDeviceClient};
use daq_fleet::config::{Settings, TaskLimits, TimeoutConfig};
use daq_fleet::device::{ConfigId, Device, DeviceState};
use daq_fleet::fleet::FleetCoordinator;
use daq_fleet::ids::{DeviceId, ExperimentId, RouterId};
use daq_fleet::store::Store;
use daq_fleet::topology::DataRouter;
use daq_fleet::worker::mock::MockWorkerProvider;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

/// Generous bound for background units in tests.
pub const SETTLE: Duration = Duration::from_secs(5);

pub fn device_ip(index: usize) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 10 + index as u8))
}

pub fn router_ip(index: usize) -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 1, 10 + index as u8))
}

/// Small limits so timeout paths finish quickly.
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.dispatcher.workers = 4;
    settings.timeouts = TimeoutConfig::uniform(TaskLimits {
        soft_ms: 300,
        hard_ms: 600,
    });
    settings.reconciliation.state_interval_ms = 20;
    settings.reconciliation.online_interval_ms = 50;
    settings.reconciliation.router_interval_ms = 50;
    settings.reconciliation.stuck_after_failed_polls = 3;
    settings
}

/// An active experiment with `devices` configured ECC servers, each routed
/// to one of `routers` data routers, all starting in `state`.
pub struct Harness {
    pub store: Arc<Store>,
    pub clients: Arc<MockClientProvider>,
    pub workers: MockWorkerProvider,
    pub fleet: FleetCoordinator,
    pub experiment: ExperimentId,
    pub devices: Vec<DeviceId>,
    pub routers: Vec<RouterId>,
}

impl Harness {
    pub fn new(devices: usize, routers: usize, state: DeviceState) -> Self {
        Self::with_settings(devices, routers, state, Completion::OnNextPoll, test_settings())
    }

    pub fn with_settings(
        devices: usize,
        routers: usize,
        state: DeviceState,
        completion: Completion,
        settings: Settings,
    ) -> Self {
        let store = Arc::new(Store::new());
        let experiment = store.add_experiment("e15503").unwrap();

        let router_ids: Vec<RouterId> = (0..routers)
            .map(|i| {
                store
                    .add_router(DataRouter::new(
                        RouterId(0),
                        experiment,
                        format!("router-{i}"),
                        router_ip(i),
                    ))
                    .unwrap()
            })
            .collect();

        let device_ids: Vec<DeviceId> = (0..devices)
            .map(|i| {
                let mut device = Device::new(DeviceId(0), experiment, format!("ecc{i}"), device_ip(i));
                device.state = state;
                device.selected_config = Some(ConfigId::new("cobo", "base", "beam"));
                let id = store.add_device(device).unwrap();
                if !router_ids.is_empty() {
                    store
                        .add_source(&format!("CoBo[{i}]"), id, router_ids[i % router_ids.len()])
                        .unwrap();
                }
                id
            })
            .collect();

        store.activate_experiment(experiment).unwrap();

        let clients = Arc::new(MockClientProvider::new(completion));
        for id in &device_ids {
            clients.client(&store.device(*id).unwrap());
        }
        let workers = MockWorkerProvider::new();
        let fleet = FleetCoordinator::start(
            &settings,
            store.clone(),
            clients.clone(),
            Arc::new(workers.clone()),
        );

        Self {
            store,
            clients,
            workers,
            fleet,
            experiment,
            devices: device_ids,
            routers: router_ids,
        }
    }

    pub fn client(&self, index: usize) -> Arc<MockDeviceClient> {
        self.clients.get(self.devices[index]).unwrap()
    }

    pub fn device(&self, index: usize) -> Device {
        self.store.device(self.devices[index]).unwrap()
    }

    /// Wait for every queued unit to finish.
    pub async fn settle(&self) {
        assert!(
            self.fleet.dispatcher().wait_idle(SETTLE).await,
            "dispatcher did not go idle"
        );
    }

    /// Reconcile every device once, ignoring failures.
    pub async fn reconcile_all(&self) {
        for id in &self.devices {
            let _ = self.fleet.orchestrator().reconcile(*id).await;
        }
    }
}
