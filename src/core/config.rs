use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use crate::network::dht::{encode_payload, Contact, MessageType, NetworkMessage, NodeAddress, NodeId, MAX_MESSAGE_SIZE};
use crate::network::transport::MAX_DATAGRAM_SIZE;
use crate::utils::{DhtError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Address peers reach this node at; must be routable from them
    pub host: IpAddr,
    /// TCP port for content transfer (0 picks a free port)
    pub tcp_port: u16,
    /// UDP port for RPCs (0 picks a free port)
    pub udp_port: u16,
    pub bootstrap_peer: Option<NodeAddress>,
    /// Contacts queried in parallel when a lookup starts
    pub alpha: usize,
    /// Bucket size and replication factor
    pub k: usize,
    pub eviction_ttl: Duration,
    pub republish_interval: Duration,
    pub connection_timeout: Duration,
    pub connection_retry_delay: Duration,
    pub receive_buffer_size: usize,
    pub max_transfer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            tcp_port: 4000,
            udp_port: 4001,
            bootstrap_peer: None,
            alpha: 3,
            k: 20,
            eviction_ttl: Duration::from_secs(24 * 60 * 60),
            republish_interval: Duration::from_secs(60 * 60),
            connection_timeout: Duration::from_secs(5),
            connection_retry_delay: Duration::from_secs(1),
            receive_buffer_size: 1 << 20,
            max_transfer_size: 64 << 20,
        }
    }
}

impl Config {
    /// Loopback node on OS-assigned ports.
    pub fn local() -> Self {
        Self {
            tcp_port: 0,
            udp_port: 0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.alpha < 1 {
            return Err(DhtError::Config("alpha must be at least 1".to_string()));
        }
        if self.k < 1 {
            return Err(DhtError::Config("k must be at least 1".to_string()));
        }
        if self.eviction_ttl.is_zero() {
            return Err(DhtError::Config("eviction TTL must be positive".to_string()));
        }
        if self.republish_interval.is_zero() {
            return Err(DhtError::Config("republish interval must be positive".to_string()));
        }
        if self.connection_timeout.is_zero() {
            return Err(DhtError::Config("connection timeout must be positive".to_string()));
        }
        if self.connection_retry_delay.is_zero() {
            return Err(DhtError::Config("connection retry delay must be positive".to_string()));
        }
        if self.max_transfer_size as u64 > MAX_MESSAGE_SIZE {
            return Err(DhtError::Config(format!(
                "max transfer size {} exceeds the {} byte message limit",
                self.max_transfer_size, MAX_MESSAGE_SIZE
            )));
        }
        if self.receive_buffer_size < 1024 {
            return Err(DhtError::Config(format!(
                "receive buffer of {} bytes is too small",
                self.receive_buffer_size
            )));
        }
        let datagram_limit = self.receive_buffer_size.min(MAX_DATAGRAM_SIZE);
        if self.k > datagram_limit || largest_contact_reply(self.k)? > datagram_limit {
            return Err(DhtError::Config(format!(
                "k = {} makes FIND_CONTACT replies larger than a {} byte datagram",
                self.k, datagram_limit
            )));
        }
        if self.host.is_unspecified() {
            return Err(DhtError::Config(format!(
                "host {} cannot be advertised to peers",
                self.host
            )));
        }
        Ok(())
    }
}

/// Encoded size of a FIND_CONTACT reply carrying `k` contacts with the
/// widest possible addresses.
fn largest_contact_reply(k: usize) -> Result<usize> {
    let widest = Contact::new(
        NodeId::zero(),
        NodeAddress::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), u16::MAX, u16::MAX),
    );
    let contacts = vec![widest.clone(); k];
    let request = NetworkMessage::request(MessageType::FindContact, widest.clone(), Vec::new());
    let reply = request.reply(MessageType::FindContact, widest, encode_payload(&contacts)?);
    Ok(reply.encode()?.len())
}
