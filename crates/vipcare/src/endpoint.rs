//! Endpoint value type: an IPv4 address plus port.

use common::{Error, Result};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;

/// One `address:port` pair. Immutable; equality by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }

    /// Parse `host[:port]`, falling back to `default_port` when no port is
    /// given. Backends may omit their port to inherit the VIP's.
    pub fn parse_with_default_port(s: &str, default_port: u16) -> Result<Self> {
        if s.contains(':') {
            s.parse()
        } else {
            let address = s
                .parse::<Ipv4Addr>()
                .map_err(|e| Error::parse(format!("invalid address {:?}: {}", s, e)))?;
            Ok(Self::new(address, default_port))
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::parse(format!("missing port in endpoint {:?}", s)))?;
        let address = host
            .parse::<Ipv4Addr>()
            .map_err(|e| Error::parse(format!("invalid address {:?}: {}", host, e)))?;
        let port = port
            .parse::<u16>()
            .map_err(|e| Error::parse(format!("invalid port {:?}: {}", port, e)))?;
        Ok(Self { address, port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let ep: Endpoint = "10.0.0.5:6443".parse().unwrap();
        assert_eq!(ep.address, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(ep.port, 6443);
        assert_eq!(ep.to_string(), "10.0.0.5:6443");
    }

    #[test]
    fn rejects_malformed_endpoints() {
        assert!("10.0.0.5".parse::<Endpoint>().is_err());
        assert!("10.0.0.5:".parse::<Endpoint>().is_err());
        assert!("10.0.0.5:http".parse::<Endpoint>().is_err());
        assert!("10.0.0.5:99999".parse::<Endpoint>().is_err());
        assert!("example.com:6443".parse::<Endpoint>().is_err());
        assert!(":6443".parse::<Endpoint>().is_err());
    }

    #[test]
    fn default_port_applies_only_when_missing() {
        let ep = Endpoint::parse_with_default_port("192.168.0.2", 6443).unwrap();
        assert_eq!(ep.to_string(), "192.168.0.2:6443");

        let ep = Endpoint::parse_with_default_port("192.168.0.2:6444", 6443).unwrap();
        assert_eq!(ep.port, 6444);

        assert!(Endpoint::parse_with_default_port("not-an-ip", 6443).is_err());
    }

    #[test]
    fn socket_addr_conversion() {
        let ep: Endpoint = "10.103.97.2:6443".parse().unwrap();
        assert_eq!(ep.socket_addr().to_string(), "10.103.97.2:6443");
    }
}
