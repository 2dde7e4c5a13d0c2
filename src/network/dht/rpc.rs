use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::Result;

use super::contact::Contact;
use super::node_id::NodeId;

/// Upper bound on any decoded message, so a hostile length prefix cannot
/// make the decoder allocate without limit.
pub const MAX_MESSAGE_SIZE: u64 = 256 * 1024 * 1024;

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE)
        .reject_trailing_bytes()
}

/// Encode a payload with the wire codec.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(codec().serialize(value)?)
}

/// Decode a payload with the wire codec.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(codec().deserialize(bytes)?)
}

/// RPC kinds. The declaration order fixes the wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Request raw content over TCP; the response carries the bytes
    TransferData,
    /// Request the k contacts closest to an identifier
    FindContact,
    /// Request the owner list stored under a key
    FindData,
    /// Announce the origin as an owner of a key (no response)
    StoreData,
    /// Liveness probe
    Ping,
    /// Answer to `Ping`
    Pong,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TransferData => "TRANSFER_DATA",
            MessageType::FindContact => "FIND_CONTACT",
            MessageType::FindData => "FIND_DATA",
            MessageType::StoreData => "STORE_DATA",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
        }
    }
}

/// One datagram (or one TCP frame) of the DHT protocol.
///
/// `rpc_id` is a random correlation token chosen by the requester and echoed
/// by the responder. `data` holds an encoded payload whose type depends on
/// `msg_type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkMessage {
    pub msg_type: MessageType,
    pub origin: Contact,
    pub rpc_id: NodeId,
    pub data: Vec<u8>,
}

impl NetworkMessage {
    /// A fresh request with a random correlation token.
    pub fn request(msg_type: MessageType, origin: Contact, data: Vec<u8>) -> Self {
        Self {
            msg_type,
            origin,
            rpc_id: NodeId::random(),
            data,
        }
    }

    /// A response echoing this message's correlation token.
    pub fn reply(&self, msg_type: MessageType, origin: Contact, data: Vec<u8>) -> Self {
        Self {
            msg_type,
            origin,
            rpc_id: self.rpc_id,
            data,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_payload(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode_payload(bytes)
    }

    /// Decode `data` as a `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        decode_payload(&self.data)
    }
}

impl fmt::Display for NetworkMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} from {} rpc={:?} ({} bytes)",
            self.msg_type.as_str(),
            self.origin,
            self.rpc_id,
            self.data.len()
        )
    }
}
