pub mod bootstrap;
pub mod config;
pub mod lookup;
pub mod node;

pub use config::Config;
pub use node::Node;
