//! Fleet inventory file: experiments with their devices, routers and data sources.
//!
//! The inventory is TOML (or JSON when the file ends in `.json`):
//!
//! ```toml
//! [[experiments]]
//! name = "e15503"
//! active = true
//!
//! [[experiments.devices]]
//! name = "ecc0"
//! address = "10.0.0.1"
//! config = { describe = "cobo", prepare = "base", configure = "beam" }
//!
//! [[experiments.routers]]
//! name = "dr0"
//! address = "10.0.0.9"
//! connection_type = "TCP"
//!
//! [[experiments.sources]]
//! name = "CoBo[0]"
//! device = "ecc0"
//! router = "dr0"
//! ```
//!
//! Sources refer to devices and routers by name within their experiment.

use crate::device::{ConfigId, Device, DEFAULT_ECC_PORT};
use crate::error::{AppResult, DaqError};
use crate::ids::{DeviceId, RouterId};
use crate::store::Store;
use crate::topology::{ConnectionType, DataRouter, DEFAULT_ROUTER_PORT};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use tracing::info;

/// Whole inventory file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    /// Experiments, each with its own fleet
    #[serde(default)]
    pub experiments: Vec<ExperimentSpec>,
}

/// One experiment and its fleet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    /// Unique experiment name
    pub name: String,
    /// Activate after loading (at most one)
    #[serde(default)]
    pub active: bool,
    /// Device controllers
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
    /// Data routers
    #[serde(default)]
    pub routers: Vec<RouterSpec>,
    /// Sender to router routes
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
}

/// Inventory entry for an ECC server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Unique name within the experiment
    pub name: String,
    /// ECC server address
    pub address: IpAddr,
    /// ECC server port
    #[serde(default = "default_ecc_port")]
    pub port: u16,
    /// Preselected config set
    #[serde(default)]
    pub config: Option<ConfigId>,
    /// Controller log file on the device host
    #[serde(default)]
    pub log_path: Option<String>,
    /// Directory holding the `.xcfg` files
    #[serde(default)]
    pub config_root: Option<String>,
    /// Where post-run config backups go
    #[serde(default)]
    pub config_backup_root: Option<String>,
}

/// Inventory entry for a data router.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouterSpec {
    /// Unique name within the experiment
    pub name: String,
    /// Router host address
    pub address: IpAddr,
    /// Listening port
    #[serde(default = "default_router_port")]
    pub port: u16,
    /// Transport used by senders
    #[serde(default)]
    pub connection_type: ConnectionType,
    /// Router log file
    #[serde(default)]
    pub log_path: Option<String>,
}

/// Inventory entry routing a named sender on `device` to `router`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpec {
    /// Sender id, e.g. `CoBo[0]`
    pub name: String,
    /// Name of the sending device
    pub device: String,
    /// Name of the receiving router
    pub router: String,
}

fn default_ecc_port() -> u16 {
    DEFAULT_ECC_PORT
}

fn default_router_port() -> u16 {
    DEFAULT_ROUTER_PORT
}

impl Inventory {
    /// Read an inventory file; `.json` files are JSON, anything else TOML.
    pub fn load(path: &Path) -> AppResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_str(&text)?)
        } else {
            Self::from_toml(&text)
        }
    }

    /// Parse TOML text.
    pub fn from_toml(text: &str) -> AppResult<Self> {
        toml::from_str(text)
            .map_err(|e| DaqError::Configuration(format!("Invalid inventory: {}", e)))
    }

    /// Check cross-references that serde cannot express.
    pub fn validate(&self) -> AppResult<()> {
        let active: Vec<&str> = self
            .experiments
            .iter()
            .filter(|e| e.active)
            .map(|e| e.name.as_str())
            .collect();
        if active.len() > 1 {
            return Err(DaqError::Configuration(format!(
                "At most one experiment may be active, found: {}",
                active.join(", ")
            )));
        }

        for experiment in &self.experiments {
            for source in &experiment.sources {
                if !experiment.devices.iter().any(|d| d.name == source.device) {
                    return Err(DaqError::not_found(
                        "Device",
                        format!("'{}' (source '{}')", source.device, source.name),
                    ));
                }
                if !experiment.routers.iter().any(|r| r.name == source.router) {
                    return Err(DaqError::not_found(
                        "DataRouter",
                        format!("'{}' (source '{}')", source.router, source.name),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Validate and load everything into `store`.
    ///
    /// Name uniqueness is enforced by the store itself.
    pub fn populate(&self, store: &Store) -> AppResult<()> {
        self.validate()?;

        for spec in &self.experiments {
            let experiment = store.add_experiment(&spec.name)?;

            let mut devices: HashMap<&str, DeviceId> = HashMap::new();
            for d in &spec.devices {
                let mut device = Device::new(DeviceId(0), experiment, d.name.clone(), d.address);
                device.port = d.port;
                device.selected_config = d.config.clone();
                if let Some(path) = &d.log_path {
                    device.log_path = path.clone();
                }
                if let Some(root) = &d.config_root {
                    device.config_root = root.clone();
                }
                if let Some(root) = &d.config_backup_root {
                    device.config_backup_root = root.clone();
                }
                devices.insert(d.name.as_str(), store.add_device(device)?);
            }

            let mut routers: HashMap<&str, RouterId> = HashMap::new();
            for r in &spec.routers {
                let mut router = DataRouter::new(RouterId(0), experiment, r.name.clone(), r.address);
                router.port = r.port;
                router.connection_type = r.connection_type;
                if let Some(path) = &r.log_path {
                    router.log_path = path.clone();
                }
                routers.insert(r.name.as_str(), store.add_router(router)?);
            }

            for s in &spec.sources {
                let device = devices
                    .get(s.device.as_str())
                    .copied()
                    .ok_or_else(|| DaqError::not_found("Device", &s.device))?;
                let router = routers
                    .get(s.router.as_str())
                    .copied()
                    .ok_or_else(|| DaqError::not_found("DataRouter", &s.router))?;
                store.add_source(&s.name, device, router)?;
            }

            if spec.active {
                store.activate_experiment(experiment)?;
            }
            info!(
                experiment = %spec.name,
                devices = spec.devices.len(),
                routers = spec.routers.len(),
                sources = spec.sources.len(),
                "Loaded experiment from inventory"
            );
        }
        Ok(())
    }

    /// A fresh store holding this inventory.
    pub fn into_store(&self) -> AppResult<Store> {
        let store = Store::new();
        self.populate(&store)?;
        Ok(store)
    }
}
