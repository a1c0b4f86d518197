//! A simulated ECC server.
//!
//! The mock keeps its own state machine. A transition call records the
//! operation and, depending on [`Completion`], either applies the new state
//! immediately, leaves it pending until the next state query, or never
//! finishes (a controller stuck mid-transition).

use super::{CallReply, ClientProvider, DeviceControlClient, StateReply};
use crate::device::{ConfigId, Device, DeviceState, Operation};
use crate::error::{AppResult, DaqError};
use crate::ids::DeviceId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// When a simulated transition takes effect.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Completion {
    /// Applied inside the transition call.
    Immediate,
    /// Reported by the next `get_state`.
    #[default]
    OnNextPoll,
    /// Never completes; `get_state` keeps reporting `transitioning`.
    Never,
}

#[derive(Debug)]
struct MockState {
    state: DeviceState,
    transitioning: bool,
    pending: Option<DeviceState>,
    completion: Completion,
    latency: Option<Duration>,
    unreachable: bool,
    failures: HashMap<Operation, CallReply>,
    state_failure: Option<StateReply>,
    raw_state_code: Option<i32>,
    configs: Vec<ConfigId>,
    calls: Vec<(Operation, String, String)>,
    state_queries: usize,
}

/// Simulated device controller.
#[derive(Debug)]
pub struct MockDeviceClient {
    inner: Mutex<MockState>,
}

impl Default for MockDeviceClient {
    fn default() -> Self {
        Self::new(DeviceState::Idle)
    }
}

fn next_state(current: DeviceState, operation: Operation) -> DeviceState {
    let step = match operation {
        Operation::Describe | Operation::Prepare | Operation::Configure | Operation::Start => 1,
        Operation::Stop | Operation::Breakup | Operation::Undo => -1,
    };
    DeviceState::from_code(current.code() + step).unwrap_or(current)
}

impl MockDeviceClient {
    /// A controller sitting in `state`.
    pub fn new(state: DeviceState) -> Self {
        Self {
            inner: Mutex::new(MockState {
                state,
                transitioning: false,
                pending: None,
                completion: Completion::default(),
                latency: None,
                unreachable: false,
                failures: HashMap::new(),
                state_failure: None,
                raw_state_code: None,
                configs: Vec::new(),
                calls: Vec::new(),
                state_queries: 0,
            }),
        }
    }

    /// Set how transitions complete.
    pub fn set_completion(&self, completion: Completion) {
        self.inner.lock().completion = completion;
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.lock().latency = latency;
    }

    /// Make every call fail at the transport level.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.lock().unreachable = unreachable;
    }

    /// Refuse `operation` with a nonzero error code.
    pub fn fail_operation(&self, operation: Operation, code: i32, message: &str) {
        self.inner
            .lock()
            .failures
            .insert(operation, CallReply::failed(code, message));
    }

    /// Answer state queries with a nonzero error code.
    pub fn fail_state_query(&self, code: i32, message: &str) {
        self.inner.lock().state_failure = Some(StateReply {
            state: 0,
            transitioning: false,
            error_code: code,
            error_message: message.to_string(),
        });
    }

    /// Report this raw state code instead of the simulated state.
    pub fn report_raw_state(&self, code: Option<i32>) {
        self.inner.lock().raw_state_code = code;
    }

    /// Force the simulated state (out-of-band change on the controller).
    pub fn force_state(&self, state: DeviceState, transitioning: bool) {
        let mut inner = self.inner.lock();
        inner.state = state;
        inner.transitioning = transitioning;
        inner.pending = None;
    }

    /// Config sets returned by `get_config_ids`.
    pub fn set_configs(&self, configs: Vec<ConfigId>) {
        self.inner.lock().configs = configs;
    }

    /// Current simulated state.
    pub fn state(&self) -> DeviceState {
        self.inner.lock().state
    }

    /// Operations received so far.
    pub fn operations(&self) -> Vec<Operation> {
        self.inner.lock().calls.iter().map(|(op, _, _)| *op).collect()
    }

    /// Full transition calls received so far (operation, config XML, datalink XML).
    pub fn calls(&self) -> Vec<(Operation, String, String)> {
        self.inner.lock().calls.clone()
    }

    /// Number of state queries answered.
    pub fn state_queries(&self) -> usize {
        self.inner.lock().state_queries
    }

    async fn delay(&self) -> AppResult<()> {
        let (latency, unreachable) = {
            let inner = self.inner.lock();
            (inner.latency, inner.unreachable)
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if unreachable {
            return Err(DaqError::Remote("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceControlClient for MockDeviceClient {
    async fn get_state(&self) -> AppResult<StateReply> {
        self.delay().await?;
        let mut inner = self.inner.lock();
        inner.state_queries += 1;
        if let Some(failure) = inner.state_failure.clone() {
            return Ok(failure);
        }
        if let Some(target) = inner.pending.take() {
            if inner.completion == Completion::Never {
                inner.pending = Some(target);
            } else {
                inner.state = target;
                inner.transitioning = false;
            }
        }
        Ok(StateReply {
            state: inner.raw_state_code.unwrap_or(inner.state.code()),
            transitioning: inner.transitioning,
            error_code: 0,
            error_message: String::new(),
        })
    }

    async fn transition(
        &self,
        operation: Operation,
        config_xml: &str,
        datalink_xml: &str,
    ) -> AppResult<CallReply> {
        self.delay().await?;
        let mut inner = self.inner.lock();
        inner
            .calls
            .push((operation, config_xml.to_string(), datalink_xml.to_string()));
        if let Some(reply) = inner.failures.get(&operation) {
            return Ok(reply.clone());
        }

        let target = next_state(inner.state, operation);
        debug!(%operation, from = %inner.state, to = %target, "mock controller accepted transition");
        match inner.completion {
            Completion::Immediate => {
                inner.state = target;
                inner.transitioning = false;
            }
            Completion::OnNextPoll | Completion::Never => {
                inner.pending = Some(target);
                inner.transitioning = true;
            }
        }
        Ok(CallReply::ok())
    }

    async fn get_config_ids(&self) -> AppResult<Vec<ConfigId>> {
        self.delay().await?;
        Ok(self.inner.lock().configs.clone())
    }
}

/// Hands out one [`MockDeviceClient`] per device, created on first use in
/// the device's recorded state.
#[derive(Debug, Default)]
pub struct MockClientProvider {
    clients: Mutex<HashMap<DeviceId, Arc<MockDeviceClient>>>,
    completion: Completion,
}

impl MockClientProvider {
    /// New provider whose clients complete transitions as `completion` says.
    pub fn new(completion: Completion) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            completion,
        }
    }

    /// The mock for `device`, creating it from the device record if needed.
    pub fn client(&self, device: &Device) -> Arc<MockDeviceClient> {
        self.clients
            .lock()
            .entry(device.id)
            .or_insert_with(|| {
                let client = MockDeviceClient::new(device.state);
                client.set_completion(self.completion);
                if let Some(config) = &device.selected_config {
                    client.set_configs(vec![config.clone()]);
                }
                Arc::new(client)
            })
            .clone()
    }

    /// The mock for `id`, if one was created.
    pub fn get(&self, id: DeviceId) -> Option<Arc<MockDeviceClient>> {
        self.clients.lock().get(&id).cloned()
    }
}

impl ClientProvider for MockClientProvider {
    fn client_for(&self, device: &Device) -> AppResult<Arc<dyn DeviceControlClient>> {
        Ok(self.client(device))
    }
}
