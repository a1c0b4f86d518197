//! Single-device transitions and state reconciliation.
//!
//! A transition request marks the device `transitioning` before the device
//! confirms anything; the device's `state` only changes when reconciliation
//! reads it back. Remote timeouts leave the flag alone, so a device can sit
//! with `transitioning = true` and a stale `state` until the next successful
//! poll, or until the watchdog gives up on it.

use crate::client::ClientProvider;
use crate::config::{TaskLimits, TimeoutConfig};
use crate::device::{compute_transition, ConfigId, Device, DeviceState, TargetState};
use crate::dispatch::{TaskDispatcher, TaskKind, TaskUnit};
use crate::error::{AppResult, DaqError, TimeoutKind};
use crate::ids::DeviceId;
use crate::store::Store;
use crate::topology::datalink_xml;
use crate::worker::{HostProcess, WorkerProvider};
use std::future::Future;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

async fn within<T, F>(limits: TaskLimits, call: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    timeout(limits.soft(), call)
        .await
        .map_err(|_| DaqError::RemoteTimeout(TimeoutKind::Soft))?
}

/// Counts a failed poll unless disarmed; also fires when the poll is cancelled.
struct FailedPoll<'a> {
    orchestrator: &'a TransitionOrchestrator,
    device: DeviceId,
    armed: bool,
}

impl Drop for FailedPoll<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.orchestrator.record_failed_poll(self.device);
        }
    }
}

/// Validates and executes transitions of individual devices.
#[derive(Clone)]
pub struct TransitionOrchestrator {
    store: Arc<Store>,
    clients: Arc<dyn ClientProvider>,
    workers: Arc<dyn WorkerProvider>,
    dispatcher: Arc<TaskDispatcher>,
    limits: Arc<TimeoutConfig>,
    stuck_after_failed_polls: u32,
}

impl TransitionOrchestrator {
    /// New orchestrator; `stuck_after_failed_polls = 0` disables the watchdog.
    pub fn new(
        store: Arc<Store>,
        clients: Arc<dyn ClientProvider>,
        workers: Arc<dyn WorkerProvider>,
        dispatcher: Arc<TaskDispatcher>,
        limits: TimeoutConfig,
        stuck_after_failed_polls: u32,
    ) -> Self {
        Self {
            store,
            clients,
            workers,
            dispatcher,
            limits: Arc::new(limits),
            stuck_after_failed_polls,
        }
    }

    /// Shared store
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Shared dispatcher
    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    /// Worker agents
    pub fn workers(&self) -> &Arc<dyn WorkerProvider> {
        &self.workers
    }

    /// Issue the operation moving `device` one step to `target`.
    ///
    /// Only `device.transitioning` is modified: `true` when the controller
    /// accepts, `false` when it answers with a nonzero error code. Timeouts
    /// and transport failures leave it unchanged.
    ///
    /// # Errors
    ///
    /// `InvalidTransition`, `ConfigMissing`, `NotFound` (topology),
    /// `DeviceError`, `RemoteTimeout` or `Remote`.
    pub async fn apply_transition(&self, device: &mut Device, target: DeviceState) -> AppResult<()> {
        let operation = compute_transition(device.state, target)?;
        let config_xml = device.require_config()?.to_xml()?;
        let links = self.store.datalinks_for(device.id)?;
        let datalink = datalink_xml(&links)?;
        let client = self.clients.client_for(device)?;

        let reply = within(
            self.limits.transition,
            client.transition(operation, &config_xml, &datalink),
        )
        .await?;

        if reply.is_ok() {
            device.transitioning = true;
            info!(device = %device.name, %operation, %target, "Transition accepted");
            Ok(())
        } else {
            device.transitioning = false;
            warn!(
                device = %device.name,
                %operation,
                error_code = reply.error_code,
                "Device refused transition: {}",
                reply.error_message
            );
            Err(DaqError::DeviceError(reply.error_message))
        }
    }

    /// Validate and execute one transition against the stored device.
    pub async fn transition_one(&self, id: DeviceId, target: DeviceState) -> AppResult<()> {
        let mut device = self.store.device(id)?;
        let result = self.apply_transition(&mut device, target).await;
        if matches!(result, Ok(()) | Err(DaqError::DeviceError(_))) {
            let transitioning = device.transitioning;
            self.store.update_device(id, |d| d.transitioning = transitioning)?;
        }
        result
    }

    /// Pre-validate, mark the device transitioning and enqueue the transition.
    ///
    /// Validation failures return immediately and enqueue nothing. If the
    /// queued unit later fails before reaching the device, the previous
    /// `transitioning` value is restored.
    pub async fn request_transition(&self, id: DeviceId, target: TargetState) -> AppResult<Uuid> {
        let device = self.store.device(id)?;
        let resolved = target.resolve(device.state);
        compute_transition(device.state, resolved)?;
        device.require_config()?;

        let previous = self
            .store
            .update_device(id, |d| std::mem::replace(&mut d.transitioning, true))?;

        let this = self.clone();
        let unit = TaskUnit::new(
            TaskKind::Transition,
            format!("{}: {} -> {}", device.name, device.state, resolved),
            async move {
                let result = this.transition_one(id, resolved).await;
                if let Err(e) = &result {
                    if e.is_local() {
                        let _ = this.store.update_device(id, |d| d.transitioning = previous);
                    }
                }
                result
            },
        );

        match self.dispatcher.submit(unit).await {
            Ok(task) => Ok(task),
            Err(e) => {
                let _ = self.store.update_device(id, |d| d.transitioning = previous);
                Err(e)
            }
        }
    }

    /// Read the device's state back and overwrite `state` and `transitioning`.
    ///
    /// Any failure, including cancellation by a time limit, counts toward the
    /// stuck-transition watchdog.
    pub async fn reconcile(&self, id: DeviceId) -> AppResult<DeviceState> {
        let device = self.store.device(id)?;
        let mut guard = FailedPoll {
            orchestrator: self,
            device: id,
            armed: true,
        };

        let client = self.clients.client_for(&device)?;
        let reply = within(self.limits.refresh_state, client.get_state()).await?;
        if reply.error_code != 0 {
            return Err(DaqError::DeviceError(reply.error_message));
        }
        let state = DeviceState::from_code(reply.state).ok_or_else(|| {
            DaqError::DeviceError(format!(
                "{} reported unknown state code {}",
                device.name, reply.state
            ))
        })?;

        guard.armed = false;
        self.store.update_device(id, |d| {
            d.state = state;
            d.transitioning = reply.transitioning;
            d.failed_polls = 0;
        })?;
        debug!(device = %device.name, %state, transitioning = reply.transitioning, "Reconciled");
        Ok(state)
    }

    fn record_failed_poll(&self, id: DeviceId) {
        let threshold = self.stuck_after_failed_polls;
        let result = self.store.update_device(id, |d| {
            d.failed_polls = d.failed_polls.saturating_add(1);
            let stuck = threshold > 0 && d.failed_polls >= threshold && d.transitioning;
            if stuck {
                d.transitioning = false;
                d.online = false;
            }
            (d.name.clone(), d.failed_polls, stuck)
        });
        match result {
            Ok((name, polls, true)) => warn!(
                device = %name,
                failed_polls = polls,
                "Transition presumed stuck; cleared transitioning and marked device offline"
            ),
            Ok((name, polls, false)) => debug!(device = %name, failed_polls = polls, "Poll failed"),
            Err(e) => debug!("Failed poll for vanished device: {}", e),
        }
    }

    /// Fetch the config sets available on the device.
    ///
    /// A selection that no longer exists on the device is cleared.
    pub async fn refresh_configs(&self, id: DeviceId) -> AppResult<Vec<ConfigId>> {
        let device = self.store.device(id)?;
        let client = self.clients.client_for(&device)?;
        let configs = within(self.limits.refresh_configs, client.get_config_ids()).await?;

        let dropped = self.store.update_device(id, |d| {
            d.available_configs = configs.clone();
            let stale = d
                .selected_config
                .as_ref()
                .is_some_and(|selected| !configs.contains(selected));
            if stale {
                d.selected_config.take()
            } else {
                None
            }
        })?;
        if let Some(config) = dropped {
            warn!(device = %device.name, %config, "Selected config no longer offered by device; cleared");
        }
        Ok(configs)
    }

    /// Ask the device host whether the controller process is running.
    pub async fn check_online(&self, id: DeviceId) -> AppResult<bool> {
        let device = self.store.device(id)?;
        let agent = self.workers.agent_for(device.address)?;
        let online = within(
            self.limits.check_online,
            agent.check_status(HostProcess::DeviceController),
        )
        .await?;
        self.store.update_device(id, |d| d.online = online)?;
        Ok(online)
    }

    /// Unit running [`Self::reconcile`].
    pub fn refresh_unit(&self, id: DeviceId, label: String) -> TaskUnit {
        let this = self.clone();
        TaskUnit::new(TaskKind::RefreshState, label, async move {
            this.reconcile(id).await.map(|_| ())
        })
    }

    /// Unit running [`Self::check_online`].
    pub fn check_online_unit(&self, id: DeviceId, label: String) -> TaskUnit {
        let this = self.clone();
        TaskUnit::new(TaskKind::CheckOnline, label, async move {
            this.check_online(id).await.map(|_| ())
        })
    }

    /// Unit running [`Self::refresh_configs`].
    pub fn refresh_configs_unit(&self, id: DeviceId, label: String) -> TaskUnit {
        let this = self.clone();
        TaskUnit::new(TaskKind::RefreshConfigs, label, async move {
            this.refresh_configs(id).await.map(|_| ())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock::{Completion, MockClientProvider};
    use crate::config::DispatcherConfig;
    use crate::device::Operation;
    use crate::ids::RouterId;
    use crate::topology::DataRouter;
    use crate::worker::mock::MockWorkerProvider;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    struct Fixture {
        store: Arc<Store>,
        clients: Arc<MockClientProvider>,
        orchestrator: TransitionOrchestrator,
        device: DeviceId,
    }

    fn fixture(state: DeviceState, with_config: bool) -> Fixture {
        let store = Arc::new(Store::new());
        let exp = store.add_experiment("e15503").unwrap();
        let mut device = Device::new(
            DeviceId(0),
            exp,
            "ecc0",
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
        );
        device.state = state;
        if with_config {
            device.selected_config = Some(ConfigId::new("cobo", "base", "beam"));
        }
        let id = store.add_device(device).unwrap();
        let router = store
            .add_router(DataRouter::new(
                RouterId(0),
                exp,
                "dr0",
                IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1)),
            ))
            .unwrap();
        store.add_source("CoBo[0]", id, router).unwrap();

        let clients = Arc::new(MockClientProvider::new(Completion::OnNextPoll));
        let dispatcher = Arc::new(TaskDispatcher::start(
            &DispatcherConfig::default(),
            TimeoutConfig::uniform(TaskLimits { soft_ms: 200, hard_ms: 400 }),
        ));
        let orchestrator = TransitionOrchestrator::new(
            store.clone(),
            clients.clone(),
            Arc::new(MockWorkerProvider::new()),
            dispatcher,
            TimeoutConfig::uniform(TaskLimits { soft_ms: 200, hard_ms: 400 }),
            3,
        );
        Fixture {
            store,
            clients,
            orchestrator,
            device: id,
        }
    }

    #[tokio::test]
    async fn test_transition_sets_only_the_flag() {
        let f = fixture(DeviceState::Idle, true);
        f.orchestrator
            .transition_one(f.device, DeviceState::Described)
            .await
            .unwrap();

        let device = f.store.device(f.device).unwrap();
        assert!(device.transitioning);
        assert_eq!(device.state, DeviceState::Idle);

        let client = f.clients.get(f.device).unwrap();
        let calls = client.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, Operation::Describe);
        assert!(calls[0].1.contains("<SubConfigId type=\"describe\">cobo</SubConfigId>"));
        assert!(calls[0].2.contains("<DataSender id=\"CoBo[0]\"/>"));
    }

    #[tokio::test]
    async fn test_device_error_clears_flag() {
        let f = fixture(DeviceState::Ready, true);
        f.store.update_device(f.device, |d| d.transitioning = true).unwrap();
        let device = f.store.device(f.device).unwrap();
        f.clients
            .client(&device)
            .fail_operation(Operation::Start, 3, "CoBo[0] not armed");

        let err = f
            .orchestrator
            .transition_one(f.device, DeviceState::Running)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::DeviceError(ref m) if m == "CoBo[0] not armed"));
        let device = f.store.device(f.device).unwrap();
        assert!(!device.transitioning);
        assert_eq!(device.state, DeviceState::Ready);
    }

    #[tokio::test]
    async fn test_invalid_transition_checked_before_config() {
        let f = fixture(DeviceState::Idle, false);
        let err = f
            .orchestrator
            .transition_one(f.device, DeviceState::Ready)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::InvalidTransition(_)));

        let err = f
            .orchestrator
            .transition_one(f.device, DeviceState::Described)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::ConfigMissing(_)));
        assert!(f.clients.get(f.device).is_none());
    }

    #[tokio::test]
    async fn test_timeout_leaves_flag_unchanged() {
        let f = fixture(DeviceState::Idle, true);
        let device = f.store.device(f.device).unwrap();
        f.clients
            .client(&device)
            .set_latency(Some(Duration::from_secs(5)));

        let err = f
            .orchestrator
            .transition_one(f.device, DeviceState::Described)
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::RemoteTimeout(TimeoutKind::Soft)));
        assert!(!f.store.device(f.device).unwrap().transitioning);
    }

    #[tokio::test]
    async fn test_request_rejects_without_enqueueing() {
        let f = fixture(DeviceState::Prepared, true);
        let err = f
            .orchestrator
            .request_transition(f.device, DeviceState::Prepared.into())
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::InvalidTransition(ref m) if m == "no transition needed"));
        assert_eq!(f.orchestrator.dispatcher().pending(), 0);
        assert!(!f.store.device(f.device).unwrap().transitioning);
    }

    #[tokio::test]
    async fn test_reconcile_overwrites_and_unknown_code_fails() {
        let f = fixture(DeviceState::Idle, true);
        let device = f.store.device(f.device).unwrap();
        let client = f.clients.client(&device);
        client.force_state(DeviceState::Prepared, false);

        assert_eq!(
            f.orchestrator.reconcile(f.device).await.unwrap(),
            DeviceState::Prepared
        );
        assert_eq!(f.store.device(f.device).unwrap().state, DeviceState::Prepared);

        client.report_raw_state(Some(42));
        assert!(matches!(
            f.orchestrator.reconcile(f.device).await,
            Err(DaqError::DeviceError(_))
        ));
        let device = f.store.device(f.device).unwrap();
        assert_eq!(device.state, DeviceState::Prepared);
        assert_eq!(device.failed_polls, 1);
    }

    #[tokio::test]
    async fn test_refresh_configs_drops_vanished_selection() {
        let f = fixture(DeviceState::Idle, true);
        let device = f.store.device(f.device).unwrap();
        let offered = vec![ConfigId::new("cobo", "base", "pulser")];
        f.clients.client(&device).set_configs(offered.clone());

        let configs = f.orchestrator.refresh_configs(f.device).await.unwrap();
        assert_eq!(configs, offered);
        let device = f.store.device(f.device).unwrap();
        assert_eq!(device.available_configs, offered);
        assert_eq!(device.selected_config, None);
    }

    #[tokio::test]
    async fn test_check_online_stores_result() {
        let f = fixture(DeviceState::Idle, true);
        assert!(f.orchestrator.check_online(f.device).await.unwrap());
        assert!(f.store.device(f.device).unwrap().online);
    }
}
