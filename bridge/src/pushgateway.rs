//! Periodic push of the metrics exposition to a Prometheus Pushgateway
//!
//! For deployments where nothing scrapes the bridge. Each push replaces the
//! job's group (`PUT {url}/metrics/job/{job}`). A failed push is logged and
//! tried again on the next tick.

use crate::config::PushgatewayConfig;
use crate::error::{BridgeError, Result};
use crate::upstream::transport::{HttpRequest, Method, Transport};
use bytes::Bytes;
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use vahti_core::SinkError;

pub struct PushgatewayPusher {
    url: String,
    interval: Duration,
    transport: Arc<dyn Transport>,
    /// Pushes the default registry when unset
    registry: Option<Registry>,
}

impl PushgatewayPusher {
    pub fn new(config: &PushgatewayConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            url: format!(
                "{}/metrics/job/{}",
                config.url.trim_end_matches('/'),
                config.job
            ),
            interval: config.interval,
            transport,
            registry: None,
        }
    }

    /// Push this registry instead of the default one
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn exposition(&self) -> String {
        match &self.registry {
            Some(registry) => crate::metrics::encode(&registry.gather()),
            None => crate::metrics::gather(),
        }
    }

    /// One push of the current exposition text
    pub async fn push_once(&self) -> Result<()> {
        let request = HttpRequest::new(Method::Put, self.url.clone())
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Bytes::from(self.exposition()));

        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| BridgeError::Sink(SinkError::Unavailable(e.to_string())))?;
        if response.is_success() {
            return Ok(());
        }
        Err(BridgeError::Sink(SinkError::Rejected {
            status: response.status,
            message: String::from_utf8_lossy(&response.body).into_owned(),
        }))
    }

    /// Push every interval until `shutdown` flips, with a final push on the way out
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(url = %self.url, interval_secs = self.interval.as_secs(), "Pushgateway pusher started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            match self.push_once().await {
                Ok(()) => debug!("Pushed metrics"),
                Err(e) => warn!(error = %e, "Pushgateway push failed"),
            }
        }

        if let Err(e) = self.push_once().await {
            warn!(error = %e, "Final pushgateway push failed");
        }
        info!("Pushgateway pusher stopped");
    }
}
