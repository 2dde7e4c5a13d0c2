//! Kademlia distributed hash table
//!
//! Identifiers, contacts and k-buckets, the routing table built from them,
//! the RPC wire format, and `DhtNode`, which serves and issues those RPCs.

mod bucket;
mod contact;
mod dht_node;
mod node_id;
mod routing_table;
mod rpc;

pub use bucket::{Bucket, BucketInsert};
pub use contact::{sort_by_distance, Contact, NodeAddress};
pub use dht_node::DhtNode;
pub use node_id::{NodeId, ID_LENGTH};
pub use routing_table::{Pinger, RoutingTable, BUCKET_COUNT};
pub use rpc::{decode_payload, encode_payload, MessageType, NetworkMessage, MAX_MESSAGE_SIZE};
