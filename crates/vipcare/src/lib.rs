//! Node-local virtual IP care.
//!
//! Maintains one IPVS virtual service and its backend pool on the node this
//! process runs on: reconciles the kernel table against declared state,
//! health-probes every backend on a fixed interval with drain-then-remove
//! semantics, and installs the rule plane (dummy device, ipset, iptables
//! masquerade or a host route) that makes the VIP reachable.

pub mod cli;
pub mod endpoint;
pub mod prober;
pub mod proxier;
pub mod runner;

pub use endpoint::Endpoint;
pub use prober::{HttpProber, Prober};
pub use proxier::Proxier;
pub use runner::{Config, Runner};
