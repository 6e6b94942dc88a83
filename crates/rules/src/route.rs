//! Route-mode rule plane: pin the VIP to one target node with a host route.
//!
//! Used on nodes that do not run IPVS themselves; the VIP simply routes to a
//! designated node that does.

use crate::Ruler;
use crate::exec::{already_exists, not_found, run};
use async_trait::async_trait;
use common::{Error, Result};
use std::net::IpAddr;
use tracing::info;

/// Fixed metric for the VIP host route, so it can coexist predictably with
/// routes installed by other agents.
const HOST_ROUTE_METRIC: u32 = 50;

/// Route-mode [`Ruler`].
pub struct RouteRuler {
    vip: IpAddr,
    target: IpAddr,
}

impl RouteRuler {
    pub fn new(vip: IpAddr, target: IpAddr) -> Self {
        Self { vip, target }
    }

    fn route_args(&self, verb: &str) -> Vec<String> {
        vec![
            "route".to_string(),
            verb.to_string(),
            format!("{}/32", self.vip),
            "via".to_string(),
            self.target.to_string(),
            "metric".to_string(),
            HOST_ROUTE_METRIC.to_string(),
        ]
    }
}

#[async_trait]
impl Ruler for RouteRuler {
    async fn setup(&self) -> Result<()> {
        info!(vip = %self.vip, target = %self.target, "adding host route");
        match run("ip", &self.route_args("add")).await {
            Ok(_) => Ok(()),
            Err(e) if already_exists(&e) => Ok(()),
            Err(e) => Err(Error::rules(format!(
                "failed to add route for {}: {}",
                self.vip, e
            ))),
        }
    }

    async fn cleanup(&self) -> Result<()> {
        info!(vip = %self.vip, target = %self.target, "deleting host route");
        match run("ip", &self.route_args("del")).await {
            Ok(_) => Ok(()),
            Err(e) if not_found(&e) => Ok(()),
            Err(e) => Err(Error::rules(format!(
                "failed to delete route for {}: {}",
                self.vip, e
            ))),
        }
    }
}
