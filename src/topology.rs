//! Data routers, data sources and the datalink descriptor sent with each transition.
//!
//! A [`DataSource`] ties one device controller to the router that receives its
//! data. The datalink descriptor for a device lists every source that points
//! at it, together with the router it sends to.

use crate::error::{AppResult, DaqError};
use crate::ids::{DeviceId, ExperimentId, RouterId, SourceId};
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::writer::Writer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Default listening port of a data router.
pub const DEFAULT_ROUTER_PORT: u16 = 46005;

/// Transport used between a data sender and its router.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionType {
    /// Plain TCP
    #[default]
    Tcp,
    /// ZeroC ICE
    Ice,
    /// Fast data transfer
    Fdt,
    /// ZeroMQ buffer
    Zbuf,
}

impl ConnectionType {
    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Tcp => "TCP",
            ConnectionType::Ice => "ICE",
            ConnectionType::Fdt => "FDT",
            ConnectionType::Zbuf => "ZBUF",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A data router process receiving data from one or more sources.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DataRouter {
    /// Store id
    pub id: RouterId,
    /// Owning experiment
    pub experiment_id: ExperimentId,
    /// Unique (per experiment) name
    pub name: String,
    /// Host address
    pub address: IpAddr,
    /// Listening port
    pub port: u16,
    /// Transport to the sender
    pub connection_type: ConnectionType,
    /// Path to the router log on its host
    pub log_path: String,
    /// Router process seen alive by the last check
    pub online: bool,
    /// No data files are waiting in the staging area
    pub staging_clean: bool,
}

impl DataRouter {
    /// A router with default port, TCP transport and a clean staging area.
    pub fn new(
        id: RouterId,
        experiment_id: ExperimentId,
        name: impl Into<String>,
        address: IpAddr,
    ) -> Self {
        Self {
            id,
            experiment_id,
            name: name.into(),
            address,
            port: DEFAULT_ROUTER_PORT,
            connection_type: ConnectionType::Tcp,
            log_path: "~/Library/Logs/dataRouter.log".to_string(),
            online: false,
            staging_clean: true,
        }
    }
}

/// Topology entry: a named data sender on a device, routed to one router.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    /// Store id
    pub id: SourceId,
    /// Sender name (e.g. `CoBo[0]`)
    pub name: String,
    /// Device controller driving this source
    pub device_id: DeviceId,
    /// Router receiving the data
    pub router_id: RouterId,
}

/// One resolved `<DataLink>`: a sender and the router it sends to.
#[derive(Clone, Debug, PartialEq)]
pub struct DataLink {
    /// Sender name
    pub sender: String,
    /// Receiving router
    pub router: DataRouter,
}

/// Resolve the datalinks of `device` against the known routers.
///
/// # Errors
///
/// [`DaqError::NotFound`] if a source references a router that does not exist.
pub fn links_for_device<'a, I>(
    device: DeviceId,
    sources: I,
    routers: &[DataRouter],
) -> AppResult<Vec<DataLink>>
where
    I: IntoIterator<Item = &'a DataSource>,
{
    sources
        .into_iter()
        .filter(|source| source.device_id == device)
        .map(|source| {
            let router = routers
                .iter()
                .find(|r| r.id == source.router_id)
                .ok_or_else(|| DaqError::not_found("DataRouter", source.router_id))?;
            Ok(DataLink {
                sender: source.name.clone(),
                router: router.clone(),
            })
        })
        .collect()
}

/// Serialize datalinks into a `<DataLinkSet>` document.
pub fn datalink_xml(links: &[DataLink]) -> AppResult<String> {
    let mut writer = Writer::new(Vec::new());

    writer
        .write_event(Event::Start(BytesStart::new("DataLinkSet")))
        .map_err(DaqError::xml)?;
    for link in links {
        writer
            .write_event(Event::Start(BytesStart::new("DataLink")))
            .map_err(DaqError::xml)?;

        let mut sender = BytesStart::new("DataSender");
        sender.push_attribute(("id", link.sender.as_str()));
        writer.write_event(Event::Empty(sender)).map_err(DaqError::xml)?;

        let address = link.router.address.to_string();
        let port = link.router.port.to_string();
        let mut router = BytesStart::new("DataRouter");
        router.push_attribute(("name", link.router.name.as_str()));
        router.push_attribute(("ipAddress", address.as_str()));
        router.push_attribute(("port", port.as_str()));
        router.push_attribute(("type", link.router.connection_type.as_str()));
        writer.write_event(Event::Empty(router)).map_err(DaqError::xml)?;

        writer
            .write_event(Event::End(BytesEnd::new("DataLink")))
            .map_err(DaqError::xml)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("DataLinkSet")))
        .map_err(DaqError::xml)?;

    String::from_utf8(writer.into_inner()).map_err(DaqError::xml)
}
