//! Daemon orchestration: configuration, startup, shutdown.
//!
//! The runner wires a [`Proxier`] to a rule plane, installs both at
//! startup, and either exits immediately (run-once mode) or runs the
//! control loop until a shutdown signal, tearing everything down on the
//! way out.

use crate::endpoint::Endpoint;
use crate::prober::{HttpProber, Prober};
use crate::proxier::Proxier;
use common::{Error, Result};
use ipvs::{IpvsDriver, Scheduler};
use rules::{LinkRuler, Mode, RouteRuler, Ruler};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub const DEFAULT_VIP_PORT: u16 = 6443;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_IFACE: &str = "vipcare";
pub const DEFAULT_MASQUERADE_BIT: u8 = 14;

/// Validated runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// The virtual server endpoint.
    pub vip: Endpoint,
    /// Backend endpoints registered at startup.
    pub real_servers: Vec<Endpoint>,
    /// IPVS scheduling algorithm.
    pub scheduler: Scheduler,
    /// Health-check interval in daemon mode.
    pub interval: Duration,
    /// Per-backend probe timeout.
    pub probe_timeout: Duration,
    /// Rule-plane variant.
    pub mode: Mode,
    /// Dummy interface name for link mode.
    pub iface: String,
    /// Which fwmark bit to claim for masquerade marking.
    pub masquerade_bit: u8,
    /// Route-mode target node.
    pub target: Option<IpAddr>,
    /// Perform a single reconciliation pass, then exit.
    pub run_once: bool,
    /// Clean and exit: after the run-once pass, delete the virtual server
    /// and clean up the rule plane so nothing is left behind.
    pub clean: bool,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.real_servers.is_empty() {
            return Err(Error::config("at least one real server is required"));
        }
        if self.masquerade_bit > 31 {
            return Err(Error::config(format!(
                "masquerade bit {} out of range (0-31)",
                self.masquerade_bit
            )));
        }
        if self.mode == Mode::Route && self.target.is_none() {
            return Err(Error::config("route mode requires a target address"));
        }
        if self.interval.is_zero() {
            return Err(Error::config("health-check interval must be non-zero"));
        }
        if self.clean && !self.run_once {
            return Err(Error::config("clean requires run-once"));
        }
        Ok(())
    }

    fn ruler(&self) -> Option<Box<dyn Ruler>> {
        match self.mode {
            Mode::Link => Some(Box::new(LinkRuler::new(
                self.iface.clone(),
                self.masquerade_bit,
                vec![self.vip.socket_addr()],
            ))),
            Mode::Route => self
                .target
                .map(|target| Box::new(RouteRuler::new(IpAddr::V4(self.vip.address), target)) as _),
            Mode::Disabled => None,
        }
    }
}

pub struct Runner {
    config: Config,
    proxier: Arc<Proxier>,
    ruler: Option<Box<dyn Ruler>>,
}

impl Runner {
    /// Build a runner against the platform driver and HTTPS prober.
    pub fn new(config: Config) -> Result<Self> {
        let prober = Arc::new(HttpProber::new(config.probe_timeout)?);
        Ok(Self::with_driver(config, ipvs::system_driver(), prober))
    }

    /// Build a runner against explicit collaborators.
    pub fn with_driver(
        config: Config,
        driver: Arc<dyn IpvsDriver>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        let proxier = Arc::new(Proxier::new(
            config.scheduler.clone(),
            config.interval,
            driver,
            prober,
        ));
        let ruler = config.ruler();
        Self {
            config,
            proxier,
            ruler,
        }
    }

    /// Replace the rule plane chosen by configuration.
    pub fn with_ruler(mut self, ruler: Box<dyn Ruler>) -> Self {
        self.ruler = Some(ruler);
        self
    }

    pub fn proxier(&self) -> Arc<Proxier> {
        self.proxier.clone()
    }

    /// Run to completion. The initial reconciliation pass must establish
    /// the virtual server or the whole run fails fast, before the rule
    /// plane is touched. Run-once mode performs one probe pass and
    /// returns, tearing everything down afterwards when `clean` is set;
    /// daemon mode installs the rule plane, loops until `cancel` fires,
    /// and tears down on the way out.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.config.validate()?;

        let vip = self.config.vip.to_string();
        self.proxier.ensure_virtual_server(&vip).await?;
        for rs in &self.config.real_servers {
            self.proxier
                .ensure_real_server(&vip, &rs.to_string())
                .await?;
        }
        info!(
            vip = %self.config.vip,
            backends = self.config.real_servers.len(),
            scheduler = %self.config.scheduler,
            "virtual service established"
        );

        if self.config.run_once {
            self.proxier.run_pass().await?;
            if self.config.clean {
                info!("clean and exit: tearing down virtual service");
                self.teardown().await;
            }
            return Ok(());
        }

        if let Some(ruler) = &self.ruler {
            if let Err(e) = ruler.setup().await {
                self.teardown().await;
                return Err(e);
            }
        }

        let result = self.proxier.run_loop(cancel).await;
        if let Err(e) = &result {
            error!(error = %e, "control loop failed");
        }
        info!("shutting down, tearing down virtual service");
        self.teardown().await;
        result
    }

    /// Best-effort teardown of everything setup creates. Failures are
    /// logged, never propagated; teardown runs on shutdown paths where
    /// there is nothing left to do about them.
    async fn teardown(&self) {
        let vip = self.config.vip.to_string();
        if let Err(e) = self.proxier.delete_virtual_server(&vip).await {
            warn!(vip = %vip, error = %e, "failed to delete virtual service");
        }
        if let Some(ruler) = &self.ruler {
            if let Err(e) = ruler.cleanup().await {
                warn!(error = %e, "failed to clean up rule plane");
            }
        }
    }
}

/// Resolves when the process receives SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
