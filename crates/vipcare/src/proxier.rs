//! The reconciliation engine.
//!
//! The proxier owns the desired-state map of virtual servers and their
//! backend pools, drives it into the kernel IPVS table with bounded-retry
//! idempotent operations, and health-probes every backend on a fixed
//! interval. Unreachable backends are drained (weight set to 0) first and
//! only removed after failing a second consecutive pass, so in-flight
//! connections are never severed abruptly; backends that come back, or that
//! were wiped from the table out-of-band, are restored automatically.

use crate::endpoint::Endpoint;
use crate::prober::Prober;
use common::{Error, Result, RetryPolicy, retry};
use ipvs::{IpvsDriver, Protocol, RealServer, Scheduler, ServiceFlags, VirtualServer};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Hook invoked at the start of every reconciliation pass. An error from
/// the hook is fatal to the run loop.
pub type SyncHook = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// Desired state: virtual server endpoint -> backend endpoints, keyed by
/// their canonical string form.
type ServiceMap = HashMap<Endpoint, HashMap<String, Endpoint>>;

pub struct Proxier {
    scheduler: Scheduler,
    interval: Duration,
    driver: Arc<dyn IpvsDriver>,
    prober: Arc<dyn Prober>,
    sync_hook: Option<SyncHook>,
    ensure_retry: RetryPolicy,
    probe_retry: RetryPolicy,

    // Mutated by Ensure/Delete calls and snapshotted by the probe loop;
    // the mutex is what makes external calls safe while a pass is running.
    service_map: Mutex<ServiceMap>,

    try_tx: mpsc::Sender<()>,
    try_rx: Mutex<Option<mpsc::Receiver<()>>>,
    stop_tx: Mutex<Option<mpsc::Sender<Error>>>,
    stop_rx: Mutex<Option<mpsc::Receiver<Error>>>,
}

impl Proxier {
    pub fn new(
        scheduler: Scheduler,
        interval: Duration,
        driver: Arc<dyn IpvsDriver>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let (try_tx, try_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        Self {
            scheduler,
            interval,
            driver,
            prober,
            sync_hook: None,
            ensure_retry: RetryPolicy::ENSURE,
            probe_retry: RetryPolicy::PROBE,
            service_map: Mutex::new(HashMap::new()),
            try_tx,
            try_rx: Mutex::new(Some(try_rx)),
            stop_tx: Mutex::new(Some(stop_tx)),
            stop_rx: Mutex::new(Some(stop_rx)),
        }
    }

    /// Install a hook run at the start of every reconciliation pass.
    pub fn with_sync_hook(mut self, hook: SyncHook) -> Self {
        self.sync_hook = Some(hook);
        self
    }

    /// Override the retry policies for ensure operations and probe-driven
    /// mutations.
    pub fn with_retry_policies(mut self, ensure: RetryPolicy, probe: RetryPolicy) -> Self {
        self.ensure_retry = ensure;
        self.probe_retry = probe;
        self
    }

    fn virtual_server(&self, ep: &Endpoint) -> VirtualServer {
        VirtualServer {
            address: IpAddr::V4(ep.address),
            protocol: Protocol::TCP,
            port: ep.port,
            scheduler: self.scheduler.clone(),
            flags: ServiceFlags::default(),
            timeout: 0,
        }
    }

    fn real_server(ep: &Endpoint) -> RealServer {
        RealServer {
            address: IpAddr::V4(ep.address),
            port: ep.port,
            weight: 1,
        }
    }

    /// Get-or-create-or-update under bounded retry: create the service if
    /// absent, update it if its attributes differ, no-op otherwise.
    async fn ensure_virtual(&self, desired: &VirtualServer) -> Result<()> {
        let driver = &*self.driver;
        retry(self.ensure_retry, || async move {
            let applied = match driver.get_virtual_server(desired).await {
                Ok(applied) => applied,
                Err(_) => None,
            };
            match applied {
                None => {
                    debug!(service = %desired, "adding new IPVS service");
                    driver
                        .add_virtual_server(desired)
                        .await
                        .map_err(|e| Error::ipvs(format!("failed to add IPVS service: {}", e)))
                }
                Some(current) if current != *desired => {
                    debug!(service = %current, "IPVS service changed, updating");
                    driver
                        .update_virtual_server(desired)
                        .await
                        .map_err(|e| Error::ipvs(format!("failed to update IPVS service: {}", e)))
                }
                Some(_) => Ok(()),
            }
        })
        .await
    }

    async fn find_real_server(
        &self,
        vsrv: &VirtualServer,
        rs: &RealServer,
    ) -> Result<Option<RealServer>> {
        let pool = self.driver.get_real_servers(vsrv).await?;
        Ok(pool.into_iter().find(|member| member.same_endpoint(rs)))
    }

    /// Idempotently establish the virtual server for `vs` ("ip:port") and
    /// register it in the desired-state map.
    pub async fn ensure_virtual_server(&self, vs: &str) -> Result<()> {
        let ep: Endpoint = vs.parse()?;
        self.ensure_virtual(&self.virtual_server(&ep)).await?;
        let mut map = self.service_map.lock().await;
        map.entry(ep).or_default();
        Ok(())
    }

    /// Remove the virtual server from the kernel table if present. The
    /// desired-state entry is pruned regardless of the kernel outcome; it
    /// is rebuilt from configuration at startup anyway.
    pub async fn delete_virtual_server(&self, vs: &str) -> Result<()> {
        let ep: Endpoint = vs.parse()?;
        let desired = self.virtual_server(&ep);
        let applied = self
            .driver
            .get_virtual_server(&desired)
            .await
            .unwrap_or(None);
        let mut result = Ok(());
        if applied.is_some() {
            if let Err(e) = self.driver.delete_virtual_server(&desired).await {
                error!(service = %desired, error = %e, "failed to delete IPVS service");
                result = Err(e);
            }
        }
        self.service_map.lock().await.remove(&ep);
        result
    }

    /// Declare a backend for `vs`, auto-creating the virtual server if it
    /// is missing. A backend already present in the kernel table is left
    /// untouched so a weight the probe loop set to 0 is not clobbered.
    pub async fn ensure_real_server(&self, vs: &str, rs: &str) -> Result<()> {
        let vs_ep: Endpoint = vs.parse()?;
        let rs_ep: Endpoint = rs.parse()?;
        let vsrv = self.virtual_server(&vs_ep);
        self.ensure_virtual(&vsrv).await?;

        let desired = Self::real_server(&rs_ep);
        if self.find_real_server(&vsrv, &desired).await?.is_none() {
            let driver = &*self.driver;
            let vsrv = &vsrv;
            let desired = &desired;
            retry(self.ensure_retry, || async move {
                driver
                    .add_real_server(vsrv, desired)
                    .await
                    .map_err(|e| Error::ipvs(format!("failed to add real server: {}", e)))
            })
            .await?;
        }

        self.service_map
            .lock()
            .await
            .entry(vs_ep)
            .or_default()
            .insert(rs_ep.to_string(), rs_ep);
        Ok(())
    }

    /// Remove a backend from the kernel table and the desired-state map.
    /// A backend that is not in the table is a no-op.
    pub async fn delete_real_server(&self, vs: &str, rs: &str) -> Result<()> {
        let vs_ep: Endpoint = vs.parse()?;
        let rs_ep: Endpoint = rs.parse()?;
        let vsrv = self.virtual_server(&vs_ep);
        self.ensure_virtual(&vsrv).await?;

        let target = Self::real_server(&rs_ep);
        if let Some(applied) = self.find_real_server(&vsrv, &target).await? {
            self.driver
                .delete_real_server(&vsrv, &applied)
                .await
                .inspect_err(|e| error!(backend = %rs_ep, error = %e, "failed to delete real server"))?;
        }
        if let Some(pool) = self.service_map.lock().await.get_mut(&vs_ep) {
            pool.remove(&rs_ep.to_string());
        }
        Ok(())
    }

    /// Request an out-of-band reconciliation pass. Non-blocking with
    /// at-most-one in flight: if a pass is already queued this returns
    /// [`Error::Busy`] immediately instead of queuing a second request.
    pub fn try_run(&self) -> Result<()> {
        match self.try_tx.try_send(()) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(())) => Err(Error::Busy),
            Err(mpsc::error::TrySendError::Closed(())) => {
                Err(Error::other("reconciliation queue closed"))
            }
        }
    }

    /// One reconciliation pass: run the sync hook, then probe every
    /// declared backend and reconcile the kernel table accordingly.
    pub async fn run_pass(&self) -> Result<()> {
        if let Some(hook) = &self.sync_hook {
            hook()?;
        }
        self.run_check().await;
        Ok(())
    }

    /// Run the control loop until `cancel` fires (clean stop), [`stop`]
    /// is called (clean stop), or the sync hook fails (fatal).
    ///
    /// [`stop`]: Proxier::stop
    pub async fn run_loop(&self, cancel: CancellationToken) -> Result<()> {
        let mut try_rx = self
            .try_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::other("run loop already started"))?;
        let mut stop_rx = self
            .stop_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::other("run loop already started"))?;

        let mut ticker = tokio::time::interval(self.interval);
        // A probe pass can outlast the interval; do not try to catch up.
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // skip the immediate first tick

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    if let Err(e) = self.try_run() {
                        // A pass is already queued; expected, not a fault.
                        debug!(error = %e, "skipping scheduled pass");
                    }
                }
                request = try_rx.recv() => {
                    if request.is_some() {
                        self.run_pass().await?;
                    }
                }
                stop = stop_rx.recv() => {
                    return match stop {
                        Some(e) => Err(e),
                        None => Ok(()),
                    };
                }
            }
        }
    }

    /// Request a clean stop of the run loop by closing its stop channel.
    pub async fn stop(&self) {
        self.stop_tx.lock().await.take();
    }

    /// One probe pass over the whole desired-state map. Backends are
    /// probed concurrently, one task per backend, joined before the pass
    /// completes. Failures here degrade single operations, never the loop.
    async fn run_check(&self) {
        let snapshot: Vec<(Endpoint, Vec<Endpoint>)> = {
            let map = self.service_map.lock().await;
            map.iter()
                .map(|(vs, pool)| (*vs, pool.values().copied().collect()))
                .collect()
        };

        for (vs_ep, backends) in snapshot {
            let vsrv = self.virtual_server(&vs_ep);
            if let Err(e) = self.ensure_virtual(&vsrv).await {
                error!(service = %vsrv, error = %e, "failed to get or create IPVS service");
                continue;
            }
            let mut checks = JoinSet::new();
            for rs_ep in backends {
                let driver = self.driver.clone();
                let prober = self.prober.clone();
                let vsrv = vsrv.clone();
                let policy = self.probe_retry;
                checks.spawn(check_real_server(driver, prober, policy, vsrv, rs_ep));
            }
            while checks.join_next().await.is_some() {}
        }
    }
}

/// Probe one backend and reconcile its kernel entry.
///
/// Two-phase removal on failure: a live entry is drained to weight 0
/// first; only an entry that was already drained is deleted. On success,
/// a drained entry is restored to weight 1 and a missing entry is added
/// back.
async fn check_real_server(
    driver: Arc<dyn IpvsDriver>,
    prober: Arc<dyn Prober>,
    policy: RetryPolicy,
    vsrv: VirtualServer,
    rs_ep: Endpoint,
) {
    let probe_result = prober.probe(&rs_ep.address.to_string(), rs_ep.port).await;

    let desired = RealServer {
        address: IpAddr::V4(rs_ep.address),
        port: rs_ep.port,
        weight: 1,
    };
    let applied = match driver.get_real_servers(&vsrv).await {
        Ok(pool) => pool.into_iter().find(|member| member.same_endpoint(&desired)),
        Err(e) => {
            warn!(backend = %rs_ep, error = %e, "failed to get real server");
            return;
        }
    };

    let d = &*driver;
    let v = &vsrv;

    if let Err(probe_err) = probe_result {
        debug!(backend = %rs_ep, error = %probe_err, "probe failed");
        let Some(mut applied) = applied else {
            return;
        };
        if applied.weight != 0 {
            debug!(backend = %rs_ep, "draining: updating weight to 0 for graceful termination");
            applied.weight = 0;
            let a = &applied;
            if let Err(e) = retry(policy, || async move { d.update_real_server(v, a).await }).await
            {
                warn!(backend = %rs_ep, error = %e, "failed to update real server weight after retries");
            }
            return;
        }
        debug!(backend = %rs_ep, "removing drained real server");
        let a = &applied;
        if let Err(e) = retry(policy, || async move { d.delete_real_server(v, a).await }).await {
            warn!(backend = %rs_ep, error = %e, "failed to delete real server after retries");
        }
        return;
    }

    match applied {
        Some(applied) if applied.weight == 0 => {
            debug!(backend = %rs_ep, "restoring weight to 1 to receive traffic");
            let mut restored = applied;
            restored.weight = 1;
            let a = &restored;
            if let Err(e) = retry(policy, || async move { d.update_real_server(v, a).await }).await
            {
                warn!(backend = %rs_ep, error = %e, "failed to update real server weight after retries");
            }
        }
        Some(_) => {}
        None => {
            debug!(backend = %rs_ep, "adding real server back");
            let a = &desired;
            if let Err(e) = retry(policy, || async move { d.add_real_server(v, a).await }).await {
                warn!(backend = %rs_ep, error = %e, "failed to add real server back after retries");
            }
        }
    }
}
