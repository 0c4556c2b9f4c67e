use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::SessionError;
use crate::models::ProxyEndpoint;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Health probe for a single proxy.
#[async_trait]
pub trait ProxyProber: Send + Sync {
    /// Returns the measured response time in seconds.
    async fn probe(&self, endpoint: &ProxyEndpoint) -> Result<f64, SessionError>;
}

/// Probes by fetching a fixed low-cost endpoint through the proxy.
pub struct HttpProber {
    probe_url: String,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(probe_url: impl Into<String>) -> Self {
        Self {
            probe_url: probe_url.into(),
            timeout: PROBE_TIMEOUT,
        }
    }
}

#[async_trait]
impl ProxyProber for HttpProber {
    async fn probe(&self, endpoint: &ProxyEndpoint) -> Result<f64, SessionError> {
        let client = reqwest::Client::builder()
            .proxy(reqwest::Proxy::all(endpoint.url())?)
            .timeout(self.timeout)
            .build()?;

        let started = Instant::now();
        let resp = client.get(&self.probe_url).send().await.map_err(|e| {
            if e.is_timeout() {
                SessionError::Timeout(self.timeout)
            } else {
                SessionError::Http(e)
            }
        })?;

        if !resp.status().is_success() {
            return Err(SessionError::Navigation {
                url: self.probe_url.clone(),
                reason: format!("probe returned {}", resp.status()),
            });
        }

        Ok(started.elapsed().as_secs_f64())
    }
}
