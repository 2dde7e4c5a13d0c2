pub mod dht;
pub mod transport;

pub use transport::{Connection, Protocol, Transport};
