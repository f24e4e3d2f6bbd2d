//! Materialization service reachability probe.
//!
//! A cheap GET against the service's base URL, run once per cycle alongside
//! the sample query. The probe distinguishes "the service answered" from
//! "the service answered usefully" — a 5xx counts as unreachable because the
//! orchestrator-facing contract cares about serving capability, not TCP.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reachability signal consumed by the validator.
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub reachable: bool,
    /// Why, when unreachable. Empty otherwise.
    pub detail: String,
}

impl ServiceStatus {
    pub fn up() -> Self {
        Self {
            reachable: true,
            detail: String::new(),
        }
    }

    pub fn down(detail: impl Into<String>) -> Self {
        Self {
            reachable: false,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait ServiceProbe: Send + Sync {
    async fn status(&self) -> ServiceStatus;
}

/// Probes the materialization server over HTTP.
pub struct HttpServiceProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpServiceProbe {
    pub fn new(server_address: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: server_address.into(),
        })
    }
}

#[async_trait]
impl ServiceProbe for HttpServiceProbe {
    async fn status(&self) -> ServiceStatus {
        match self.client.get(&self.url).send().await {
            Ok(resp) if resp.status().is_server_error() => {
                ServiceStatus::down(format!("service returned {}", resp.status()))
            }
            Ok(resp) => {
                debug!(status = %resp.status(), url = %self.url, "service probe ok");
                ServiceStatus::up()
            }
            Err(e) => ServiceStatus::down(format!("service probe failed: {e}")),
        }
    }
}
