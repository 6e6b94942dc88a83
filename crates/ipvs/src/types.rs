//! IPVS data types and structures.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// IP protocol for IPVS services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    TCP,
    UDP,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::TCP => write!(f, "TCP"),
            Protocol::UDP => write!(f, "UDP"),
        }
    }
}

/// IPVS scheduling algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheduler {
    RoundRobin,
    WeightedRoundRobin,
    LeastConnection,
    WeightedLeastConnection,
    SourceHashing,
    MaglevHashing,
    Other(String),
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scheduler::RoundRobin => write!(f, "rr"),
            Scheduler::WeightedRoundRobin => write!(f, "wrr"),
            Scheduler::LeastConnection => write!(f, "lc"),
            Scheduler::WeightedLeastConnection => write!(f, "wlc"),
            Scheduler::SourceHashing => write!(f, "sh"),
            Scheduler::MaglevHashing => write!(f, "mh"),
            Scheduler::Other(s) => write!(f, "{}", s),
        }
    }
}

impl FromStr for Scheduler {
    type Err = std::convert::Infallible;

    /// Unknown names are passed through as `Other`; the kernel rejects
    /// schedulers it has no module for at service-creation time.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "rr" => Scheduler::RoundRobin,
            "wrr" => Scheduler::WeightedRoundRobin,
            "lc" => Scheduler::LeastConnection,
            "wlc" => Scheduler::WeightedLeastConnection,
            "sh" => Scheduler::SourceHashing,
            "mh" => Scheduler::MaglevHashing,
            other => Scheduler::Other(other.to_string()),
        })
    }
}

/// Service flags for IPVS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServiceFlags(pub u32);

impl ServiceFlags {
    pub const PERSISTENT: u32 = 0x1;
    pub const HASHED: u32 = 0x2;
    pub const ONE_PACKET: u32 = 0x4;
}

/// An IPVS virtual server: one VIP:port with its scheduling policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualServer {
    pub address: IpAddr,
    pub protocol: Protocol,
    pub port: u16,
    pub scheduler: Scheduler,
    pub flags: ServiceFlags,
    pub timeout: u32,
}

impl VirtualServer {
    /// Whether `other` refers to the same kernel table entry. Identity is
    /// (address, port, protocol); scheduler and flags are attributes that
    /// an update can change in place.
    pub fn same_service(&self, other: &VirtualServer) -> bool {
        self.address == other.address && self.port == other.port && self.protocol == other.protocol
    }
}

impl fmt::Display for VirtualServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} ({})",
            self.protocol, self.address, self.port, self.scheduler
        )
    }
}

/// An IPVS real server: one backend member of a virtual server's pool.
///
/// Weight is the sole traffic-admission control: 1 means eligible for new
/// connections, 0 means drained but kept in the table so in-flight
/// connections can finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealServer {
    pub address: IpAddr,
    pub port: u16,
    pub weight: u32,
}

impl RealServer {
    /// Whether `other` is the same pool member. Weight is mutable state,
    /// not identity.
    pub fn same_endpoint(&self, other: &RealServer) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl fmt::Display for RealServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}
