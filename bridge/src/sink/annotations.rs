//! Annotation sink: one point-in-time marker per event
//!
//! Posts to the dashboard server's annotation API:
//!
//! ```text
//! POST {url}/api/annotations
//! Authorization: Bearer <token>
//! X-Grafana-Org-Id: <org>
//! {"time": <ms>, "tags": [category, type, severity, "site:<site>"], "text": "[ACCESS] ..."}
//! ```

use crate::config::{GrafanaConfig, Secret};
use crate::upstream::transport::{HttpRequest, Transport, TransportError};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use vahti_core::{CanonicalEvent, Sink, SinkError};

/// Response bodies are cut to this many bytes in error messages
const MAX_ERROR_BODY: usize = 200;

pub struct AnnotationSink {
    url: String,
    token: Secret,
    org_id: u64,
    transport: Arc<dyn Transport>,
}

impl AnnotationSink {
    /// `None` when no API token is configured
    pub fn from_config(config: &GrafanaConfig, transport: Arc<dyn Transport>) -> Option<Self> {
        let token = config.api_key.clone()?;
        Some(Self {
            url: config.url.trim_end_matches('/').to_string(),
            token,
            org_id: config.org_id,
            transport,
        })
    }

    /// Annotation body for an event
    pub fn payload(event: &CanonicalEvent) -> Value {
        json!({
            "time": event.timestamp_millis(),
            "tags": event.tags(),
            "text": event.annotation_text(),
        })
    }

    fn authorized(&self, request: HttpRequest) -> HttpRequest {
        request
            .header("Authorization", format!("Bearer {}", self.token.expose()))
            .header("X-Grafana-Org-Id", self.org_id.to_string())
    }
}

#[async_trait]
impl Sink for AnnotationSink {
    fn name(&self) -> &'static str {
        "annotations"
    }

    async fn emit(&self, event: &CanonicalEvent) -> Result<(), SinkError> {
        let request = self.authorized(HttpRequest::post_json(
            format!("{}/api/annotations", self.url),
            &Self::payload(event),
        ));

        let response = self.transport.send(request).await.map_err(|e| match e {
            TransportError::Timeout => SinkError::Timeout,
            other => SinkError::Unavailable(other.to_string()),
        })?;

        if response.is_success() {
            return Ok(());
        }
        let body = String::from_utf8_lossy(&response.body);
        let message: String = body.chars().take(MAX_ERROR_BODY).collect();
        if response.status >= 500 {
            Err(SinkError::Unavailable(format!(
                "status {}: {message}",
                response.status
            )))
        } else {
            Err(SinkError::Rejected {
                status: response.status,
                message,
            })
        }
    }

    async fn health(&self) -> bool {
        let request = self.authorized(HttpRequest::get(format!("{}/api/health", self.url)));
        matches!(self.transport.send(request).await, Ok(r) if r.is_success())
    }
}
