//! Upstream client for the controller's three sub-APIs
//!
//! One [`UpstreamClient`] serves every category. Each call:
//!
//! 1. resolves a credential through the [`CredentialProvider`]
//! 2. sends the request, bounded by the configured timeout
//! 3. on 401/403 with the API key, retries once with the session credential
//!    and, if that works, keeps using the session for the category
//! 4. retries idempotent GETs on timeouts and network errors with backoff
//!
//! Any retry sleep happens in the calling poller's task and only holds up
//! that category.

pub mod backoff;
pub mod transport;

use crate::config::ControllerConfig;
use crate::credentials::{Credential, CredentialKind, CredentialProvider};
use crate::error::{ApiError, ApiErrorKind, BridgeError, Result};
use crate::health::HealthAggregator;
use crate::metrics::Metrics;
use backoff::RetryPolicy;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use transport::{HttpRequest, Method, Transport, TransportError};
use vahti_core::Category;

/// Path prefix of a category's API on the controller
pub fn base_path(category: Category) -> &'static str {
    match category {
        Category::Network => "/proxy/network/integrations/v1",
        Category::Access => "/proxy/access/api/v1",
        Category::Protect => "/proxy/protect/api",
    }
}

/// Authenticated HTTP access to the controller
pub struct UpstreamClient {
    base_url: String,
    transport: Arc<dyn Transport>,
    credentials: Arc<CredentialProvider>,
    health: Arc<HealthAggregator>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(
        controller: &ControllerConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<CredentialProvider>,
        health: Arc<HealthAggregator>,
    ) -> Self {
        Self {
            base_url: controller.base_url(),
            transport,
            credentials,
            health,
            retry: RetryPolicy::new(controller.retry_max),
            timeout: controller.timeout,
        }
    }

    /// Override the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn credentials(&self) -> &CredentialProvider {
        &self.credentials
    }

    /// Call `path` (relative to the category's base path)
    ///
    /// GET params become the query string; for other methods they are sent
    /// as a JSON object body. Returns the parsed JSON body (`null` when
    /// empty). Upstream failures are always `BridgeError::Api`; credential
    /// resolution can also fail with `AuthUnavailable` or `AuthRefreshFailed`.
    pub async fn call(
        &self,
        category: Category,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value> {
        let mut schedule = self.retry.schedule();
        loop {
            let error = match self.call_once(category, method, path, params).await {
                Err(BridgeError::Api(e)) if method.is_idempotent() && e.kind.is_transient() => e,
                other => return other,
            };
            let Some(delay) = schedule.next_delay() else {
                return Err(BridgeError::Api(error));
            };

            warn!(
                category = %category,
                path = path,
                attempt = schedule.retries(),
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient upstream failure, retrying"
            );
            if let Some(m) = Metrics::get() {
                m.record_retry(category.as_str());
            }
            tokio::time::sleep(delay).await;
        }
    }

    async fn call_once(
        &self,
        category: Category,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<serde_json::Value> {
        let credential = self.credentials.resolve(category).await?;

        match self.send(category, method, path, params, &credential).await {
            Ok(body) => {
                self.health.record_credential(category, credential.kind());
                Ok(body)
            }
            Err(e) if e.kind == ApiErrorKind::Unauthorized => {
                self.on_unauthorized(category, method, path, params, &credential, e)
                    .await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn on_unauthorized(
        &self,
        category: Category,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        rejected: &Credential,
        error: ApiError,
    ) -> Result<serde_json::Value> {
        match rejected.kind() {
            CredentialKind::ApiKey if self.credentials.has_secondary() => {
                warn!(category = %category, path = path, "API key rejected, falling back to session");
                if let Some(m) = Metrics::get() {
                    m.record_auth_fallback(category.as_str());
                }
                let secondary = self.credentials.secondary().await?;
                match self.send(category, method, path, params, &secondary).await {
                    Ok(body) => {
                        self.credentials.prefer_secondary(category);
                        self.health
                            .record_credential(category, CredentialKind::Session);
                        Ok(body)
                    }
                    Err(e) => {
                        if e.kind == ApiErrorKind::Unauthorized {
                            self.credentials.invalidate_secondary();
                        }
                        Err(e.into())
                    }
                }
            }
            CredentialKind::Session => {
                // Server-side expiry; the next cycle logs in again
                self.credentials.invalidate_secondary();
                Err(error.into())
            }
            CredentialKind::ApiKey => Err(error.into()),
        }
    }

    async fn send(
        &self,
        category: Category,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        credential: &Credential,
    ) -> std::result::Result<serde_json::Value, ApiError> {
        let url = format!("{}{}{}", self.base_url, base_path(category), path);
        let mut request = HttpRequest::new(method, url).header("Accept", "application/json");
        if method == Method::Get {
            for (name, value) in params {
                request = request.query(*name, value.clone());
            }
        } else if !params.is_empty() {
            let body: serde_json::Map<String, serde_json::Value> = params
                .iter()
                .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.clone())))
                .collect();
            request = request
                .header("Content-Type", "application/json")
                .body(Bytes::from(serde_json::Value::Object(body).to_string()));
        }
        let request = credential.apply(request);

        let result = self.send_with_timeout(method, path, request).await;
        if let Some(m) = Metrics::get() {
            let outcome = match &result {
                Ok(_) => "ok",
                Err(e) => e.kind.as_str(),
            };
            m.record_upstream(category.as_str(), outcome);
        }
        result
    }

    async fn send_with_timeout(
        &self,
        method: Method,
        path: &str,
        request: HttpRequest,
    ) -> std::result::Result<serde_json::Value, ApiError> {
        let response = match tokio::time::timeout(self.timeout, self.transport.send(request)).await
        {
            Err(_) | Ok(Err(TransportError::Timeout)) => {
                return Err(ApiError::new(
                    ApiErrorKind::Timeout,
                    format!("{} {path} timed out", method.as_str()),
                ));
            }
            Ok(Err(TransportError::Connect(msg))) | Ok(Err(TransportError::Other(msg))) => {
                return Err(ApiError::new(
                    ApiErrorKind::NetworkError,
                    format!("{} {path}: {msg}", method.as_str()),
                ));
            }
            Ok(Ok(response)) => response,
        };

        if !response.is_success() {
            return Err(ApiError::new(
                ApiErrorKind::from_status(response.status),
                format!("{} {path} returned {}", method.as_str(), response.status),
            ));
        }

        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(serde_json::Value::Null);
        }
        let body = serde_json::from_slice(&response.body).map_err(|e| {
            ApiError::new(
                ApiErrorKind::ServerError,
                format!("{} {path}: unparsable body: {e}", method.as_str()),
            )
        })?;
        debug!(path = path, status = response.status, "Upstream call succeeded");
        Ok(body)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::testing::ScriptedTransport;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use transport::HttpResponse;

    fn client(config: &Config, transport: Arc<ScriptedTransport>) -> UpstreamClient {
        let credentials = Arc::new(CredentialProvider::new(
            &config.controller,
            transport.clone(),
        ));
        let health = Arc::new(HealthAggregator::new(&config.categories));
        UpstreamClient::new(&config.controller, transport, credentials, health)
    }

    fn api_error_kind(result: Result<serde_json::Value>) -> ApiErrorKind {
        match result {
            Err(BridgeError::Api(e)) => e.kind,
            other => panic!("expected api error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_builds_url_query_and_key_header() {
        let transport = Arc::new(ScriptedTransport::new(|_| {
            Ok(HttpResponse::json(&json!({"data": []})))
        }));
        let config = Config::new("ctrl").with_api_key("key-1");
        let client = client(&config, Arc::clone(&transport));

        let body = client
            .call(
                Category::Access,
                Method::Get,
                "/events",
                &[("since", "10".to_string())],
            )
            .await
            .unwrap();
        assert_eq!(body, json!({"data": []}));

        let request = &transport.requests()[0];
        assert_eq!(request.url, "https://ctrl:443/proxy/access/api/v1/events");
        assert_eq!(request.query, vec![("since".to_string(), "10".to_string())]);
        assert_eq!(request.header_value("x-api-key"), Some("key-1"));
    }

    #[tokio::test]
    async fn test_status_codes_map_to_error_kinds() {
        for (status, kind) in [
            (404, ApiErrorKind::NotFound),
            (400, ApiErrorKind::Rejected),
            (500, ApiErrorKind::ServerError),
            (403, ApiErrorKind::Unauthorized),
        ] {
            let transport = Arc::new(ScriptedTransport::new(move |_| {
                Ok(HttpResponse::new(status, ""))
            }));
            let client = client(&Config::new("h").with_api_key("k"), Arc::clone(&transport));
            let result = client.call(Category::Protect, Method::Get, "/x", &[]).await;
            assert_eq!(api_error_kind(result), kind, "status {status}");
            // Non-transient failures are never retried
            assert_eq!(transport.request_count(), 1, "status {status}");
        }
    }

    #[tokio::test]
    async fn test_empty_body_is_null_and_garbage_is_server_error() {
        let transport = Arc::new(ScriptedTransport::new(|r| {
            if r.url.ends_with("/empty") {
                Ok(HttpResponse::new(200, ""))
            } else {
                Ok(HttpResponse::new(200, "<html>"))
            }
        }));
        let client = client(&Config::new("h").with_api_key("k"), transport);

        let body = client
            .call(Category::Network, Method::Get, "/empty", &[])
            .await
            .unwrap();
        assert!(body.is_null());

        let result = client.call(Category::Network, Method::Get, "/html", &[]).await;
        assert_eq!(api_error_kind(result), ApiErrorKind::ServerError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_retries_transient_failures_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let transport = Arc::new(ScriptedTransport::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(TransportError::Connect("reset".into()))
            } else {
                Ok(HttpResponse::json(&json!([])))
            }
        }));
        let client = client(&Config::new("h").with_api_key("k"), transport);

        let body = client
            .call(Category::Protect, Method::Get, "/events", &[])
            .await
            .unwrap();
        assert_eq!(body, json!([]));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bound_is_respected() {
        let transport = Arc::new(ScriptedTransport::new(|_| Err(TransportError::Timeout)));
        let client = client(&Config::new("h").with_api_key("k"), Arc::clone(&transport));

        let result = client.call(Category::Access, Method::Get, "/events", &[]).await;
        assert_eq!(api_error_kind(result), ApiErrorKind::Timeout);
        // Initial attempt plus the default two retries
        assert_eq!(transport.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_wait_out_the_schedule() {
        let transport = Arc::new(ScriptedTransport::new(|_| Err(TransportError::Timeout)));
        let retry = RetryPolicy::new(2)
            .with_delays(Duration::from_secs(1), Duration::from_secs(30))
            .with_jitter(Arc::new(backoff::FixedJitter(1.0)));
        let client = client(&Config::new("h").with_api_key("k"), Arc::clone(&transport))
            .with_retry_policy(retry);

        let started = tokio::time::Instant::now();
        let result = client.call(Category::Protect, Method::Get, "/events", &[]).await;
        assert_eq!(api_error_kind(result), ApiErrorKind::Timeout);
        assert_eq!(transport.request_count(), 3);
        // 1s then 2s between the three attempts
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_post_is_not_retried() {
        let transport = Arc::new(ScriptedTransport::new(|_| {
            Err(TransportError::Connect("refused".into()))
        }));
        let client = client(&Config::new("h").with_api_key("k"), Arc::clone(&transport));

        let result = client
            .call(Category::Access, Method::Post, "/doors/1/unlock", &[("reason", "x".into())])
            .await;
        assert_eq!(api_error_kind(result), ApiErrorKind::NetworkError);
        assert_eq!(transport.request_count(), 1);
        let request = &transport.requests()[0];
        assert_eq!(request.body.as_deref(), Some(&b"{\"reason\":\"x\"}"[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_upstream_times_out() {
        let transport = Arc::new(
            ScriptedTransport::new(|_| Ok(HttpResponse::json(&json!([]))))
                .with_delay(Duration::from_secs(3600)),
        );
        let config = Config::new("h")
            .with_api_key("k")
            .with_timeout(Duration::from_secs(5));
        let client = client(&config, Arc::clone(&transport))
            .with_retry_policy(RetryPolicy::no_retries());

        let result = client.call(Category::Protect, Method::Get, "/events", &[]).await;
        assert_eq!(api_error_kind(result), ApiErrorKind::Timeout);
    }

    fn key_rejected_session_ok(r: &HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        if r.url.ends_with("/api/auth/login") {
            return Ok(HttpResponse::new(200, "").with_header("Set-Cookie", "TOKEN=sess"));
        }
        if r.header_value("x-api-key").is_some() {
            Ok(HttpResponse::new(401, ""))
        } else {
            Ok(HttpResponse::json(&json!({"ok": true})))
        }
    }

    #[tokio::test]
    async fn test_auth_fallback_is_sticky_per_category() {
        let transport = Arc::new(ScriptedTransport::new(key_rejected_session_ok));
        let config = Config::new("h").with_api_key("bad").with_login("u", "p");
        let client = client(&config, Arc::clone(&transport));

        client
            .call(Category::Access, Method::Get, "/events", &[])
            .await
            .unwrap();
        client
            .call(Category::Access, Method::Get, "/events", &[])
            .await
            .unwrap();

        // key attempt, login, session call, then session call again
        let keyed = transport
            .requests()
            .iter()
            .filter(|r| r.header_value("x-api-key").is_some())
            .count();
        assert_eq!(keyed, 1);
        assert_eq!(transport.requests_matching("/api/auth/login").len(), 1);
        assert_eq!(transport.request_count(), 4);
        assert!(client.credentials().prefers_secondary(Category::Access));
        assert!(!client.credentials().prefers_secondary(Category::Protect));
        assert_eq!(
            client.health.get(Category::Access).unwrap().active_credential,
            Some(CredentialKind::Session)
        );
    }

    #[tokio::test]
    async fn test_both_credentials_rejected_is_unauthorized() {
        let transport = Arc::new(ScriptedTransport::new(|r| {
            if r.url.ends_with("/api/auth/login") {
                Ok(HttpResponse::new(200, "").with_header("Set-Cookie", "TOKEN=sess"))
            } else {
                Ok(HttpResponse::new(401, ""))
            }
        }));
        let config = Config::new("h").with_api_key("bad").with_login("u", "p");
        let client = client(&config, transport);

        let result = client.call(Category::Protect, Method::Get, "/events", &[]).await;
        assert_eq!(api_error_kind(result), ApiErrorKind::Unauthorized);
        assert!(!client.credentials().prefers_secondary(Category::Protect));
    }

    #[tokio::test]
    async fn test_key_rejected_without_secondary_is_unauthorized() {
        let transport = Arc::new(ScriptedTransport::new(|_| Ok(HttpResponse::new(401, ""))));
        let client = client(&Config::new("h").with_api_key("bad"), Arc::clone(&transport));

        let result = client.call(Category::Network, Method::Get, "/sites", &[]).await;
        assert_eq!(api_error_kind(result), ApiErrorKind::Unauthorized);
        assert_eq!(transport.request_count(), 1);
    }

    #[tokio::test]
    async fn test_no_credentials_is_auth_unavailable() {
        let transport = Arc::new(ScriptedTransport::new(|_| Ok(HttpResponse::new(200, ""))));
        let client = client(&Config::new("h"), Arc::clone(&transport));

        let result = client.call(Category::Network, Method::Get, "/sites", &[]).await;
        assert!(matches!(result, Err(BridgeError::AuthUnavailable { .. })));
        assert_eq!(transport.request_count(), 0);
    }
}
