//! IPVS (IP Virtual Server) table driver.
//!
//! Exposes the kernel's layer-4 load-balancing table behind the narrow
//! [`IpvsDriver`] trait: virtual servers keyed by (address, port, protocol),
//! each with a pool of weighted real servers. Two implementations are
//! provided: [`IpvsAdm`] drives the real kernel table through the `ipvsadm`
//! utility, and [`MemoryDriver`] keeps the same contract in process memory
//! for tests and platforms without IPVS.

mod adm;
mod driver;
mod memory;
mod types;

pub use adm::IpvsAdm;
pub use driver::IpvsDriver;
pub use memory::MemoryDriver;
pub use types::{Protocol, RealServer, Scheduler, ServiceFlags, VirtualServer};

use std::sync::Arc;

/// Driver for the platform this process runs on: the kernel table on Linux,
/// the in-memory table elsewhere. The in-memory fallback keeps the control
/// loop's behavior identical so higher layers need no platform branches.
pub fn system_driver() -> Arc<dyn IpvsDriver> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(IpvsAdm::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(MemoryDriver::new())
    }
}
