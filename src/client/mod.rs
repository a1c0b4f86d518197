//! Device Control Client capability.
//!
//! One client per ECC server. The orchestrator only ever talks to devices
//! through this trait; the wire protocol behind it is not part of this crate.
//! [`mock::MockDeviceClient`] simulates a controller for tests and the
//! `simulate` CLI mode.

pub mod mock;

use crate::device::{ConfigId, Device, Operation};
use crate::error::AppResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Reply to a state query.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateReply {
    /// Integer state code (1..=5)
    pub state: i32,
    /// The controller is still working through a transition
    pub transitioning: bool,
    /// Zero on success
    pub error_code: i32,
    /// Controller's explanation of a nonzero `error_code`
    pub error_message: String,
}

/// Reply to one of the transition operations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallReply {
    /// Zero on success
    pub error_code: i32,
    /// Controller's explanation of a nonzero `error_code`
    pub error_message: String,
}

impl CallReply {
    /// A successful reply.
    pub fn ok() -> Self {
        Self::default()
    }

    /// A failed reply with the given code and message.
    pub fn failed(error_code: i32, error_message: impl Into<String>) -> Self {
        Self {
            error_code,
            error_message: error_message.into(),
        }
    }

    /// True if the controller accepted the request.
    pub fn is_ok(&self) -> bool {
        self.error_code == 0
    }
}

/// Remote control of one device controller.
///
/// Transport failures are returned as [`crate::error::DaqError::Remote`];
/// refusals by the controller come back inside the reply's `error_code`.
#[async_trait]
pub trait DeviceControlClient: Send + Sync {
    /// Query the controller's current state.
    async fn get_state(&self) -> AppResult<StateReply>;

    /// Perform one state-machine edge.
    async fn transition(
        &self,
        operation: Operation,
        config_xml: &str,
        datalink_xml: &str,
    ) -> AppResult<CallReply>;

    /// List the config sets available on the controller.
    async fn get_config_ids(&self) -> AppResult<Vec<ConfigId>>;
}

/// Hands out the client for a device.
pub trait ClientProvider: Send + Sync {
    /// Client bound to `device`'s address and port.
    fn client_for(&self, device: &Device) -> AppResult<Arc<dyn DeviceControlClient>>;
}
