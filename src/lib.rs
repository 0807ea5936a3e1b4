//! ENI CNI plugin for Kubernetes
//!
//! Attaches each pod to an elastic network interface that is already
//! attached to the node:
//! - Requests the pod address from an external allocation service
//! - Connects the pod namespace to the host with a veth pair
//! - Routes the pod address through the ENI's own table with policy rules
//! - Releases the address and removes the routing state on deletion

pub mod commands;
pub mod config;
pub mod error;
pub mod ipam;
pub mod logging;
pub mod netlink;
pub mod netns;
pub mod plugin;
pub mod types;

// Re-export commonly used items
pub use commands::{cmd_add, cmd_check, cmd_del, run_cni, run_ipam};
pub use config::NetConf;
pub use error::CniError;
pub use plugin::EniPlugin;
