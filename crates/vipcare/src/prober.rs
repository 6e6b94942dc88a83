//! Backend reachability probing.

use async_trait::async_trait;
use common::{Error, Result};
use std::time::Duration;
use tracing::debug;

/// Reachability check against one real server. Any error means
/// "unreachable"; no further contract is imposed.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, address: &str, port: u16) -> Result<()>;
}

/// HTTPS prober for API-server style backends.
///
/// Certificate verification is disabled on purpose: the probe targets the
/// backend by IP and only asks "is something answering TLS+HTTP here", so
/// any HTTP response counts as reachable, including 401/403 from an
/// unauthenticated API server.
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::probe(format!("failed to build probe client: {}", e)))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, address: &str, port: u16) -> Result<()> {
        let url = format!("https://{}:{}/", address, port);
        match self.client.get(&url).send().await {
            Ok(response) => {
                debug!(url = %url, status = response.status().as_u16(), "probe succeeded");
                Ok(())
            }
            Err(e) => Err(Error::probe(format!("{} unreachable: {}", url, e))),
        }
    }
}
