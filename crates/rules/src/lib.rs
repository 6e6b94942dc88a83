//! Rule-plane strategies that make a VIP reachable.
//!
//! Two variants share one contract: [`LinkRuler`] binds the VIP locally and
//! installs ipset/iptables masquerade rules; [`RouteRuler`] adds a host route
//! pointing the VIP at a designated node. The variant is a static
//! configuration choice made once at startup.

mod exec;
mod link;
mod route;

pub use link::LinkRuler;
pub use route::RouteRuler;

use async_trait::async_trait;
use common::{Error, Result};
use std::str::FromStr;

/// Owns the "how does the VIP become reachable" policy.
#[async_trait]
pub trait Ruler: Send + Sync {
    /// Install the rule plane. Idempotent; safe to re-run.
    async fn setup(&self) -> Result<()>;

    /// Tear the rule plane down. Resources that are already gone are
    /// treated as success.
    async fn cleanup(&self) -> Result<()>;
}

/// Which rule-plane variant to run, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Link,
    Route,
    Disabled,
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "link" => Ok(Mode::Link),
            "route" => Ok(Mode::Route),
            "" | "none" | "disabled" => Ok(Mode::Disabled),
            other => Err(Error::config(format!("unknown rule mode {:?}", other))),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Link => write!(f, "link"),
            Mode::Route => write!(f, "route"),
            Mode::Disabled => write!(f, "disabled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing() {
        assert_eq!("link".parse::<Mode>().unwrap(), Mode::Link);
        assert_eq!("route".parse::<Mode>().unwrap(), Mode::Route);
        assert_eq!("none".parse::<Mode>().unwrap(), Mode::Disabled);
        assert_eq!("disabled".parse::<Mode>().unwrap(), Mode::Disabled);
        assert_eq!("".parse::<Mode>().unwrap(), Mode::Disabled);
        assert!("bridge".parse::<Mode>().is_err());
    }

    #[test]
    fn mode_display_round_trip() {
        for mode in [Mode::Link, Mode::Route, Mode::Disabled] {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
    }
}
