use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use crate::utils::DhtError;

use super::node_id::NodeId;

/// Where a node listens: one host, a TCP port for bulk transfer and a UDP
/// port for RPCs. Written as `host:tcp_port/udp_port`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: IpAddr,
    pub tcp_port: u16,
    pub udp_port: u16,
}

impl NodeAddress {
    pub fn new(host: IpAddr, tcp_port: u16, udp_port: u16) -> Self {
        Self {
            host,
            tcp_port,
            udp_port,
        }
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.tcp_port)
    }

    pub fn udp_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.udp_port)
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.host {
            IpAddr::V4(host) => write!(f, "{}:{}/{}", host, self.tcp_port, self.udp_port),
            IpAddr::V6(host) => write!(f, "[{}]:{}/{}", host, self.tcp_port, self.udp_port),
        }
    }
}

impl FromStr for NodeAddress {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || DhtError::Config(format!("invalid node address '{}', expected host:tcp/udp", s));

        let (host, ports) = s.rsplit_once(':').ok_or_else(invalid)?;
        let (tcp, udp) = ports.split_once('/').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');

        Ok(Self {
            host: host.parse().map_err(|_| invalid())?,
            tcp_port: tcp.parse().map_err(|_| invalid())?,
            udp_port: udp.parse().map_err(|_| invalid())?,
        })
    }
}

/// Represents a contact (peer) in the DHT network
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Contact {
    pub node_id: NodeId,
    pub address: NodeAddress,
    /// Scratch value written by `calc_distance` and read while sorting.
    #[serde(skip)]
    distance: Option<NodeId>,
}

impl Contact {
    /// Create a new contact
    pub fn new(node_id: NodeId, address: NodeAddress) -> Self {
        Self {
            node_id,
            address,
            distance: None,
        }
    }

    /// Store this contact's distance to `target` for a following sort.
    pub fn calc_distance(&mut self, target: &NodeId) {
        self.distance = Some(self.node_id.distance(target));
    }

    /// Distance recorded by the last `calc_distance` call.
    pub fn distance(&self) -> Option<&NodeId> {
        self.distance.as_ref()
    }

    /// Order two contacts by their computed distances. A contact that was
    /// never measured sorts last.
    pub fn closer_than(&self, other: &Contact) -> bool {
        match (&self.distance, &other.distance) {
            (Some(a), Some(b)) => a.less(b),
            (Some(_), None) => true,
            _ => false,
        }
    }
}

/// Sort contacts by XOR distance to `target`, closest first.
pub fn sort_by_distance(contacts: &mut [Contact], target: &NodeId) {
    for contact in contacts.iter_mut() {
        contact.calc_distance(target);
    }
    contacts.sort_by(|a, b| a.distance.cmp(&b.distance));
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.node_id == other.node_id && self.address == other.address
    }
}

impl Eq for Contact {}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "contact({}, {})", self.node_id, self.address)
    }
}
