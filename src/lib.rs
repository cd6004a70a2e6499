// CoreLink - GPU Cluster Communication Framework
// Core library module

pub mod error;
pub mod gossip;
pub mod gpu;
pub mod monitor;

pub use error::{LinkError, Result};
pub use gossip::message::GpuInfo;
pub use gossip::table::{NodeSnapshot, NodeStatus};
pub use gossip::{GossipConfig, GossipNode};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
