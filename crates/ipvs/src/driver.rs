//! The narrow interface the reconciliation engine uses to drive the kernel
//! IPVS table.

use crate::types::{RealServer, VirtualServer};
use async_trait::async_trait;
use common::Result;

/// Kernel IPVS table operations.
///
/// The table is keyed by (address, port, protocol) per virtual server, each
/// holding a list of (backend, weight) members. Implementations must make
/// `get_virtual_server` return `None` (not an error) when the service is
/// absent, so callers can implement get-or-create-or-update.
#[async_trait]
pub trait IpvsDriver: Send + Sync {
    /// Look up the kernel's view of a virtual server by identity.
    async fn get_virtual_server(&self, vs: &VirtualServer) -> Result<Option<VirtualServer>>;

    /// Create a virtual server. Fails if it already exists.
    async fn add_virtual_server(&self, vs: &VirtualServer) -> Result<()>;

    /// Replace the attributes (scheduler, flags, timeout) of an existing
    /// virtual server.
    async fn update_virtual_server(&self, vs: &VirtualServer) -> Result<()>;

    /// Remove a virtual server and its pool.
    async fn delete_virtual_server(&self, vs: &VirtualServer) -> Result<()>;

    /// List the pool members of a virtual server.
    async fn get_real_servers(&self, vs: &VirtualServer) -> Result<Vec<RealServer>>;

    /// Add a backend to a virtual server's pool.
    async fn add_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()>;

    /// Update a backend's weight.
    async fn update_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()>;

    /// Remove a backend from the pool.
    async fn delete_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()>;
}
