//! Mini Kademlia
//!
//! A Kademlia distributed hash table node: XOR-routed k-buckets, correlated
//! UDP RPCs with TCP bulk transfer, and a content-addressed store whose
//! entries expire unless pinned and are periodically re-announced.

pub mod core;
pub mod network;
pub mod storage;
pub mod utils;

// Re-export main types
pub use core::{Config, Node};
pub use network::dht::{Contact, DhtNode, MessageType, NetworkMessage, NodeAddress, NodeId, RoutingTable};
pub use storage::{KvEntry, KvStore};
pub use utils::error::{DhtError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
