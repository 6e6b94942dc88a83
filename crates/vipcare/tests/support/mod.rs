//! Shared test fixtures.
#![allow(dead_code)]

use async_trait::async_trait;
use common::{Error, Result};
use ipvs::{IpvsDriver, Protocol, RealServer, Scheduler, ServiceFlags, VirtualServer};
use rules::Ruler;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use vipcare::Prober;

/// Prober whose verdict per backend is controlled by the test: backends in
/// the down set fail, everything else succeeds.
#[derive(Default)]
pub struct ScriptedProber {
    down: Mutex<HashSet<String>>,
    probes: AtomicU64,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, endpoint: &str) {
        self.down
            .lock()
            .unwrap()
            .insert(endpoint.to_string());
    }

    pub fn set_up(&self, endpoint: &str) {
        self.down.lock().unwrap().remove(endpoint);
    }

    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for ScriptedProber {
    async fn probe(&self, address: &str, port: u16) -> Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let endpoint = format!("{}:{}", address, port);
        if self.down.lock().unwrap().contains(&endpoint) {
            Err(Error::probe(format!("{} is down", endpoint)))
        } else {
            Ok(())
        }
    }
}

/// Driver whose every call fails, for exercising fail-fast startup paths.
pub struct FailingDriver;

#[async_trait]
impl IpvsDriver for FailingDriver {
    async fn get_virtual_server(&self, _vs: &VirtualServer) -> Result<Option<VirtualServer>> {
        Err(Error::ipvs("kernel unavailable"))
    }

    async fn add_virtual_server(&self, _vs: &VirtualServer) -> Result<()> {
        Err(Error::ipvs("kernel unavailable"))
    }

    async fn update_virtual_server(&self, _vs: &VirtualServer) -> Result<()> {
        Err(Error::ipvs("kernel unavailable"))
    }

    async fn delete_virtual_server(&self, _vs: &VirtualServer) -> Result<()> {
        Err(Error::ipvs("kernel unavailable"))
    }

    async fn get_real_servers(&self, _vs: &VirtualServer) -> Result<Vec<RealServer>> {
        Err(Error::ipvs("kernel unavailable"))
    }

    async fn add_real_server(&self, _vs: &VirtualServer, _rs: &RealServer) -> Result<()> {
        Err(Error::ipvs("kernel unavailable"))
    }

    async fn update_real_server(&self, _vs: &VirtualServer, _rs: &RealServer) -> Result<()> {
        Err(Error::ipvs("kernel unavailable"))
    }

    async fn delete_real_server(&self, _vs: &VirtualServer, _rs: &RealServer) -> Result<()> {
        Err(Error::ipvs("kernel unavailable"))
    }
}

/// Ruler that records whether setup/cleanup ran, optionally failing setup.
/// Clones share the recorded state so a test can keep one and hand the
/// other to a runner.
#[derive(Clone, Default)]
pub struct RecordingRuler {
    fail_setup: bool,
    setup_called: Arc<AtomicBool>,
    cleanup_called: Arc<AtomicBool>,
}

impl RecordingRuler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_setup() -> Self {
        Self {
            fail_setup: true,
            ..Self::default()
        }
    }

    pub fn setup_called(&self) -> bool {
        self.setup_called.load(Ordering::SeqCst)
    }

    pub fn cleanup_called(&self) -> bool {
        self.cleanup_called.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Ruler for RecordingRuler {
    async fn setup(&self) -> Result<()> {
        self.setup_called.store(true, Ordering::SeqCst);
        if self.fail_setup {
            Err(Error::rules("setup failed"))
        } else {
            Ok(())
        }
    }

    async fn cleanup(&self) -> Result<()> {
        self.cleanup_called.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// The virtual server the proxier builds for `ip:port` with the given
/// scheduler, for direct driver assertions.
pub fn virtual_server(vs: &str, scheduler: Scheduler) -> VirtualServer {
    let (addr, port) = vs.rsplit_once(':').unwrap();
    VirtualServer {
        address: addr.parse().unwrap(),
        protocol: Protocol::TCP,
        port: port.parse().unwrap(),
        scheduler,
        flags: ServiceFlags::default(),
        timeout: 0,
    }
}

pub fn weight_of(pool: &[RealServer], rs: &str) -> Option<u32> {
    let (addr, port) = rs.rsplit_once(':').unwrap();
    pool.iter()
        .find(|member| {
            member.address.to_string() == addr && member.port == port.parse::<u16>().unwrap()
        })
        .map(|member| member.weight)
}
