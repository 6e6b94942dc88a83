//! In-memory IPVS table.
//!
//! Implements the full `IpvsDriver` contract against a process-local map.
//! Used by the test suite and as the stand-in driver on platforms without
//! IPVS, so higher-level logic behaves identically everywhere.

use crate::driver::IpvsDriver;
use crate::types::{Protocol, RealServer, VirtualServer};
use async_trait::async_trait;
use common::{Error, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

type ServiceKey = (IpAddr, u16, Protocol);

/// In-memory `IpvsDriver`.
#[derive(Default)]
pub struct MemoryDriver {
    table: Mutex<HashMap<ServiceKey, (VirtualServer, Vec<RealServer>)>>,
    writes: AtomicU64,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of mutations applied so far. Lets tests assert that an
    /// idempotent ensure performed no write.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn key(vs: &VirtualServer) -> ServiceKey {
        (vs.address, vs.port, vs.protocol)
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl IpvsDriver for MemoryDriver {
    async fn get_virtual_server(&self, vs: &VirtualServer) -> Result<Option<VirtualServer>> {
        let table = self.table.lock().await;
        Ok(table.get(&Self::key(vs)).map(|(v, _)| v.clone()))
    }

    async fn add_virtual_server(&self, vs: &VirtualServer) -> Result<()> {
        let mut table = self.table.lock().await;
        if table.contains_key(&Self::key(vs)) {
            return Err(Error::ipvs(format!("service {} already exists", vs)));
        }
        table.insert(Self::key(vs), (vs.clone(), Vec::new()));
        self.record_write();
        Ok(())
    }

    async fn update_virtual_server(&self, vs: &VirtualServer) -> Result<()> {
        let mut table = self.table.lock().await;
        match table.get_mut(&Self::key(vs)) {
            Some((current, _)) => {
                *current = vs.clone();
                self.record_write();
                Ok(())
            }
            None => Err(Error::ipvs(format!("no such service {}", vs))),
        }
    }

    async fn delete_virtual_server(&self, vs: &VirtualServer) -> Result<()> {
        let mut table = self.table.lock().await;
        if table.remove(&Self::key(vs)).is_none() {
            return Err(Error::ipvs(format!("no such service {}", vs)));
        }
        self.record_write();
        Ok(())
    }

    async fn get_real_servers(&self, vs: &VirtualServer) -> Result<Vec<RealServer>> {
        let table = self.table.lock().await;
        match table.get(&Self::key(vs)) {
            Some((_, pool)) => Ok(pool.clone()),
            None => Err(Error::ipvs(format!("no such service {}", vs))),
        }
    }

    async fn add_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        let mut table = self.table.lock().await;
        let (_, pool) = table
            .get_mut(&Self::key(vs))
            .ok_or_else(|| Error::ipvs(format!("no such service {}", vs)))?;
        if pool.iter().any(|member| member.same_endpoint(rs)) {
            return Err(Error::ipvs(format!("destination {} already exists", rs)));
        }
        pool.push(rs.clone());
        self.record_write();
        Ok(())
    }

    async fn update_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        let mut table = self.table.lock().await;
        let (_, pool) = table
            .get_mut(&Self::key(vs))
            .ok_or_else(|| Error::ipvs(format!("no such service {}", vs)))?;
        match pool.iter_mut().find(|member| member.same_endpoint(rs)) {
            Some(member) => {
                member.weight = rs.weight;
                self.record_write();
                Ok(())
            }
            None => Err(Error::ipvs(format!("no such destination {}", rs))),
        }
    }

    async fn delete_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        let mut table = self.table.lock().await;
        let (_, pool) = table
            .get_mut(&Self::key(vs))
            .ok_or_else(|| Error::ipvs(format!("no such service {}", vs)))?;
        let before = pool.len();
        pool.retain(|member| !member.same_endpoint(rs));
        if pool.len() == before {
            return Err(Error::ipvs(format!("no such destination {}", rs)));
        }
        self.record_write();
        Ok(())
    }
}
