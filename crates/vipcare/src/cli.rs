//! Command-line interface.

use crate::endpoint::Endpoint;
use crate::runner::{Config, DEFAULT_IFACE, DEFAULT_MASQUERADE_BIT, DEFAULT_VIP_PORT};
use clap::Parser;
use common::Result;
use ipvs::Scheduler;
use rules::Mode;
use std::net::IpAddr;
use std::time::Duration;

/// A lightweight care daemon for a local IPVS-backed virtual IP.
#[derive(Debug, Parser)]
#[command(name = "vipcare", version, about)]
pub struct Cli {
    /// Virtual server address, `ip[:port]` (port defaults to 6443).
    #[arg(long, env = "VIPCARE_VIP")]
    pub vip: String,

    /// Real server address, `ip[:port]` (port defaults to the VIP's).
    /// Repeat for multiple backends.
    #[arg(long = "rs", required = true)]
    pub real_servers: Vec<String>,

    /// IPVS scheduling algorithm (rr, wrr, lc, wlc, sh, mh).
    #[arg(long, default_value = "rr")]
    pub scheduler: Scheduler,

    /// Health-check interval.
    #[arg(long, default_value = "5s", value_parser = humantime::parse_duration)]
    pub interval: Duration,

    /// Per-backend probe timeout.
    #[arg(long, default_value = "500ms", value_parser = humantime::parse_duration)]
    pub probe_timeout: Duration,

    /// Rule-plane mode: link, route, or disabled.
    #[arg(long, default_value = "link")]
    pub mode: Mode,

    /// Dummy interface name (link mode).
    #[arg(long, default_value = DEFAULT_IFACE)]
    pub iface: String,

    /// fwmark bit claimed for masquerade marking (link mode).
    #[arg(long, default_value_t = DEFAULT_MASQUERADE_BIT)]
    pub masquerade_bit: u8,

    /// Node the VIP routes to (route mode).
    #[arg(long)]
    pub target: Option<IpAddr>,

    /// Perform a single reconciliation pass, then exit.
    #[arg(long)]
    pub run_once: bool,

    /// Clean and exit: after the run-once pass, tear down the virtual
    /// service and rule plane. Only valid together with --run-once.
    #[arg(short = 'C', long)]
    pub clean: bool,

    /// Emit logs as JSON.
    #[arg(long, env = "VIPCARE_LOG_JSON")]
    pub log_json: bool,
}

impl Cli {
    pub fn into_config(self) -> Result<Config> {
        let vip = Endpoint::parse_with_default_port(&self.vip, DEFAULT_VIP_PORT)?;
        let real_servers = self
            .real_servers
            .iter()
            .map(|rs| Endpoint::parse_with_default_port(rs, vip.port))
            .collect::<Result<Vec<_>>>()?;
        Ok(Config {
            vip,
            real_servers,
            scheduler: self.scheduler,
            interval: self.interval,
            probe_timeout: self.probe_timeout,
            mode: self.mode,
            iface: self.iface,
            masquerade_bit: self.masquerade_bit,
            target: self.target,
            run_once: self.run_once,
            clean: self.clean,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{DEFAULT_INTERVAL, DEFAULT_PROBE_TIMEOUT};

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::try_parse_from([
            "vipcare",
            "--vip",
            "10.103.97.2",
            "--rs",
            "192.168.0.2",
            "--rs",
            "192.168.0.3:6444",
        ])
        .unwrap();
        let config = cli.into_config().unwrap();
        assert_eq!(config.vip.to_string(), "10.103.97.2:6443");
        assert_eq!(config.real_servers.len(), 2);
        assert_eq!(config.real_servers[0].to_string(), "192.168.0.2:6443");
        assert_eq!(config.real_servers[1].to_string(), "192.168.0.3:6444");
        assert_eq!(config.scheduler, Scheduler::RoundRobin);
        assert_eq!(config.interval, DEFAULT_INTERVAL);
        assert_eq!(config.probe_timeout, DEFAULT_PROBE_TIMEOUT);
        assert_eq!(config.mode, Mode::Link);
        assert!(!config.run_once);
        assert!(!config.clean);
    }

    #[test]
    fn requires_real_servers() {
        assert!(Cli::try_parse_from(["vipcare", "--vip", "10.103.97.2"]).is_err());
    }

    #[test]
    fn parses_durations_and_mode() {
        let cli = Cli::try_parse_from([
            "vipcare",
            "--vip",
            "10.103.97.2:8443",
            "--rs",
            "192.168.0.2",
            "--interval",
            "10s",
            "--scheduler",
            "wrr",
            "--mode",
            "route",
            "--target",
            "192.168.0.2",
            "--run-once",
        ])
        .unwrap();
        let config = cli.into_config().unwrap();
        assert_eq!(config.vip.port, 8443);
        assert_eq!(config.real_servers[0].port, 8443);
        assert_eq!(config.interval, Duration::from_secs(10));
        assert_eq!(config.scheduler, Scheduler::WeightedRoundRobin);
        assert_eq!(config.mode, Mode::Route);
        assert!(config.run_once);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_bad_vip() {
        let cli =
            Cli::try_parse_from(["vipcare", "--vip", "not-an-ip", "--rs", "192.168.0.2"]).unwrap();
        assert!(cli.into_config().is_err());
    }
}
