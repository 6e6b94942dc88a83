//! Kernel IPVS driver backed by the `ipvsadm` administration utility.
//!
//! The daemon deliberately does not speak netlink itself; `ipvsadm` is the
//! narrow, stable surface it drives the kernel table through. Reads go
//! through a full table dump (`-L -n`) and are filtered locally, so lookup
//! misses are represented as `None` rather than by matching error text.

use crate::driver::IpvsDriver;
use crate::types::{Protocol, RealServer, Scheduler, ServiceFlags, VirtualServer};
use async_trait::async_trait;
use common::{Error, Result};
use std::net::IpAddr;
use tokio::process::Command;
use tracing::debug;

const IPVSADM: &str = "ipvsadm";

/// `IpvsDriver` implementation that shells out to `ipvsadm`.
pub struct IpvsAdm {
    command: String,
}

impl IpvsAdm {
    pub fn new() -> Self {
        Self {
            command: IPVSADM.to_string(),
        }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        debug!(command = %self.command, args = ?args, "running ipvsadm");
        let output = Command::new(&self.command)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::ipvs(format!("failed to execute {}: {}", self.command, e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ipvs(format!(
                "{} {} failed ({}): {}",
                self.command,
                args.join(" "),
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn dump(&self) -> Result<Vec<(VirtualServer, Vec<RealServer>)>> {
        let out = self
            .run(&["-L".to_string(), "-n".to_string()])
            .await?;
        parse_table(&out)
    }

    fn host_port(addr: &IpAddr, port: u16) -> String {
        format!("{}:{}", addr, port)
    }

    fn service_args(vs: &VirtualServer) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            Self::host_port(&vs.address, vs.port),
            "-s".to_string(),
            vs.scheduler.to_string(),
        ];
        if vs.flags.0 & ServiceFlags::PERSISTENT != 0 {
            args.push("-p".to_string());
            args.push(vs.timeout.to_string());
        }
        args
    }

    fn dest_args(vs: &VirtualServer, rs: &RealServer) -> Vec<String> {
        vec![
            "-t".to_string(),
            Self::host_port(&vs.address, vs.port),
            "-r".to_string(),
            Self::host_port(&rs.address, rs.port),
            "-m".to_string(),
            "-w".to_string(),
            rs.weight.to_string(),
        ]
    }
}

impl Default for IpvsAdm {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IpvsDriver for IpvsAdm {
    async fn get_virtual_server(&self, vs: &VirtualServer) -> Result<Option<VirtualServer>> {
        let table = self.dump().await?;
        Ok(table
            .into_iter()
            .map(|(service, _)| service)
            .find(|service| service.same_service(vs)))
    }

    async fn add_virtual_server(&self, vs: &VirtualServer) -> Result<()> {
        let mut args = vec!["-A".to_string()];
        args.extend(Self::service_args(vs));
        self.run(&args).await.map(|_| ())
    }

    async fn update_virtual_server(&self, vs: &VirtualServer) -> Result<()> {
        let mut args = vec!["-E".to_string()];
        args.extend(Self::service_args(vs));
        self.run(&args).await.map(|_| ())
    }

    async fn delete_virtual_server(&self, vs: &VirtualServer) -> Result<()> {
        let args = vec![
            "-D".to_string(),
            "-t".to_string(),
            Self::host_port(&vs.address, vs.port),
        ];
        self.run(&args).await.map(|_| ())
    }

    async fn get_real_servers(&self, vs: &VirtualServer) -> Result<Vec<RealServer>> {
        let table = self.dump().await?;
        table
            .into_iter()
            .find(|(service, _)| service.same_service(vs))
            .map(|(_, pool)| pool)
            .ok_or_else(|| Error::ipvs(format!("no such service {}", vs)))
    }

    async fn add_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        let mut args = vec!["-a".to_string()];
        args.extend(Self::dest_args(vs, rs));
        self.run(&args).await.map(|_| ())
    }

    async fn update_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        let mut args = vec!["-e".to_string()];
        args.extend(Self::dest_args(vs, rs));
        self.run(&args).await.map(|_| ())
    }

    async fn delete_real_server(&self, vs: &VirtualServer, rs: &RealServer) -> Result<()> {
        let args = vec![
            "-d".to_string(),
            "-t".to_string(),
            Self::host_port(&vs.address, vs.port),
            "-r".to_string(),
            Self::host_port(&rs.address, rs.port),
        ];
        self.run(&args).await.map(|_| ())
    }
}

fn split_host_port(s: &str) -> Result<(IpAddr, u16)> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| Error::parse(format!("missing port in {:?}", s)))?;
    let address = host
        .parse::<IpAddr>()
        .map_err(|e| Error::parse(format!("bad address {:?}: {}", host, e)))?;
    let port = port
        .parse::<u16>()
        .map_err(|e| Error::parse(format!("bad port {:?}: {}", port, e)))?;
    Ok((address, port))
}

/// Parse the output of `ipvsadm -L -n` into (service, pool) pairs.
fn parse_table(output: &str) -> Result<Vec<(VirtualServer, Vec<RealServer>)>> {
    let mut table: Vec<(VirtualServer, Vec<RealServer>)> = Vec::new();

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("->") {
            // Destination line:  -> 192.168.0.2:6443  Masq  1  0  0
            let mut fields = trimmed.split_whitespace();
            fields.next(); // "->"
            let addr = fields
                .next()
                .ok_or_else(|| Error::parse("destination line missing address"))?;
            if addr == "RemoteAddress:Port" {
                // column header
                continue;
            }
            let _forward = fields.next();
            let weight = fields
                .next()
                .ok_or_else(|| Error::parse("destination line missing weight"))?
                .parse::<u32>()
                .map_err(|e| Error::parse(format!("bad weight: {}", e)))?;
            let (address, port) = split_host_port(addr)?;
            let (_, pool) = table
                .last_mut()
                .ok_or_else(|| Error::parse("destination listed before any service"))?;
            pool.push(RealServer {
                address,
                port,
                weight,
            });
            continue;
        }

        let protocol = if trimmed.starts_with("TCP") {
            Protocol::TCP
        } else if trimmed.starts_with("UDP") {
            Protocol::UDP
        } else {
            // version banner, column headers, blank lines
            continue;
        };

        // Service line:  TCP  10.103.97.2:6443 rr [persistent 300]
        let mut fields = trimmed.split_whitespace();
        fields.next(); // protocol
        let addr = fields
            .next()
            .ok_or_else(|| Error::parse("service line missing address"))?;
        let scheduler: Scheduler = fields
            .next()
            .unwrap_or("rr")
            .parse()
            .unwrap_or(Scheduler::RoundRobin);
        let mut flags = ServiceFlags::default();
        let mut timeout = 0;
        if fields.next() == Some("persistent") {
            flags = ServiceFlags(ServiceFlags::PERSISTENT);
            if let Some(secs) = fields.next() {
                timeout = secs.parse::<u32>().unwrap_or(0);
            }
        }
        let (address, port) = split_host_port(addr)?;
        table.push((
            VirtualServer {
                address,
                protocol,
                port,
                scheduler,
                flags,
                timeout,
            },
            Vec::new(),
        ));
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = "\
IP Virtual Server version 1.2.1 (size=4096)
Prot LocalAddress:Port Scheduler Flags
  -> RemoteAddress:Port           Forward Weight ActiveConn InActConn
TCP  10.103.97.2:6443 rr
  -> 192.168.0.2:6443             Masq    1      0          0
  -> 192.168.0.3:6443             Masq    0      2          1
UDP  10.96.0.10:53 wrr persistent 300
  -> 10.244.0.7:53                Masq    1      0          0
";

    #[test]
    fn parses_full_listing() {
        let table = parse_table(LISTING).unwrap();
        assert_eq!(table.len(), 2);

        let (vs, pool) = &table[0];
        assert_eq!(vs.protocol, Protocol::TCP);
        assert_eq!(vs.address, "10.103.97.2".parse::<IpAddr>().unwrap());
        assert_eq!(vs.port, 6443);
        assert_eq!(vs.scheduler, Scheduler::RoundRobin);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool[0].address, "192.168.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(pool[0].weight, 1);
        assert_eq!(pool[1].weight, 0);

        let (vs, pool) = &table[1];
        assert_eq!(vs.protocol, Protocol::UDP);
        assert_eq!(vs.scheduler, Scheduler::WeightedRoundRobin);
        assert_eq!(vs.flags.0 & ServiceFlags::PERSISTENT, ServiceFlags::PERSISTENT);
        assert_eq!(vs.timeout, 300);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn parses_empty_listing() {
        let table = parse_table(
            "IP Virtual Server version 1.2.1 (size=4096)\n\
             Prot LocalAddress:Port Scheduler Flags\n\
             \x20 -> RemoteAddress:Port           Forward Weight ActiveConn InActConn\n",
        )
        .unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn rejects_orphan_destination() {
        assert!(parse_table("  -> 192.168.0.2:6443 Masq 1 0 0\n").is_err());
    }

    #[test]
    fn split_host_port_cases() {
        let (addr, port) = split_host_port("10.0.0.5:6443").unwrap();
        assert_eq!(addr, "10.0.0.5".parse::<IpAddr>().unwrap());
        assert_eq!(port, 6443);
        assert!(split_host_port("10.0.0.5").is_err());
        assert!(split_host_port("10.0.0.5:http").is_err());
        assert!(split_host_port("not-an-ip:80").is_err());
    }

    #[test]
    fn builds_service_and_dest_args() {
        let vs = VirtualServer {
            address: "10.103.97.2".parse().unwrap(),
            protocol: Protocol::TCP,
            port: 6443,
            scheduler: Scheduler::RoundRobin,
            flags: ServiceFlags::default(),
            timeout: 0,
        };
        assert_eq!(
            IpvsAdm::service_args(&vs),
            vec!["-t", "10.103.97.2:6443", "-s", "rr"]
        );

        let rs = RealServer {
            address: "192.168.0.2".parse().unwrap(),
            port: 6443,
            weight: 1,
        };
        assert_eq!(
            IpvsAdm::dest_args(&vs, &rs),
            vec![
                "-t",
                "10.103.97.2:6443",
                "-r",
                "192.168.0.2:6443",
                "-m",
                "-w",
                "1"
            ]
        );
    }
}
