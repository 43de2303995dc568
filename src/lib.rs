//! Kubernetes monitoring agent.
//!
//! Mirrors a configured set of cluster resource kinds through streaming
//! watches and publishes derived health and capacity signals to a Zabbix
//! server (low-level discovery + trapper items) and to a generic web API.

pub mod config;
pub mod daemon;
pub mod errors;
pub mod k8s;
pub mod scheduler;
pub mod sinks;
