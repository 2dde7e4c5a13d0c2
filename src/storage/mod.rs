pub mod hash;
pub mod kv_store;

pub use hash::HashUtils;
pub use kv_store::{KvEntry, KvStore, RepublishFn};
