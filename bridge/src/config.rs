//! Configuration for the bridge
//!
//! Loaded from environment variables (after an optional `secrets.env` file,
//! which never overrides variables already set). Embedders and tests can build
//! a [`Config`] directly with [`Config::new`] and the `with_*` setters.

use crate::error::{BridgeError, Result};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use vahti_core::Category;

const DEFAULT_PORT: u16 = 443;
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RETRY_MAX: u32 = 2;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_PUSH_INTERVAL_SECS: u64 = 60;
const DEFAULT_RECENT_EVENTS: usize = 500;

/// A credential string that never shows up in `Debug` output
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the raw value, only for building request headers
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human-readable
    Pretty,
}

/// Controller connection and credential material
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub host: String,
    pub port: u16,
    /// Per-install switch, applied when the HTTP client is built
    pub verify_tls: bool,
    /// Primary credential, sent as `X-API-Key`
    pub api_key: Option<Secret>,
    /// Secondary credential material for the legacy session login
    pub username: Option<String>,
    pub password: Option<Secret>,
    /// Applied to every upstream and sink call
    pub timeout: Duration,
    /// Retries for idempotent GETs on transient failures
    pub retry_max: u32,
}

impl ControllerConfig {
    /// `https://host:port`
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }

    /// True when username and password are both present
    pub fn has_login(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

/// Annotation sink settings
#[derive(Debug, Clone)]
pub struct GrafanaConfig {
    pub url: String,
    /// Service account token; the annotation sink is disabled without it
    pub api_key: Option<Secret>,
    pub org_id: u64,
}

/// Pushgateway settings
#[derive(Debug, Clone)]
pub struct PushgatewayConfig {
    pub url: String,
    pub job: String,
    pub interval: Duration,
}

/// Complete bridge configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub controller: ControllerConfig,
    pub grafana: GrafanaConfig,
    pub pushgateway: Option<PushgatewayConfig>,
    /// Enabled categories; each gets its own poller
    pub categories: Vec<Category>,
    /// Shared poll cadence
    pub poll_interval: Duration,
    /// Per-category cadence overrides
    pub poll_overrides: HashMap<Category, Duration>,
    pub metrics_addr: SocketAddr,
    /// Ring size for `latest_events`
    pub recent_events: usize,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Config {
    /// Minimal configuration for a controller host with every default applied
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            controller: ControllerConfig {
                host: host.into(),
                port: DEFAULT_PORT,
                verify_tls: false,
                api_key: None,
                username: None,
                password: None,
                timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
                retry_max: DEFAULT_RETRY_MAX,
            },
            grafana: GrafanaConfig {
                url: "http://localhost:3000".to_string(),
                api_key: None,
                org_id: 1,
            },
            pushgateway: None,
            categories: Category::ALL.to_vec(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            poll_overrides: HashMap::new(),
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            recent_events: DEFAULT_RECENT_EVENTS,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }

    /// Set the primary credential
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.controller.api_key = Some(Secret::new(key));
        self
    }

    /// Set the secondary credential material
    pub fn with_login(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.controller.username = Some(username.into());
        self.controller.password = Some(Secret::new(password));
        self
    }

    /// Restrict the enabled categories
    pub fn with_categories(mut self, categories: &[Category]) -> Self {
        self.categories = categories.to_vec();
        self
    }

    /// Set the shared poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the per-call timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.controller.timeout = timeout;
        self
    }

    /// Poll cadence for a category, honoring overrides
    pub fn poll_interval_for(&self, category: Category) -> Duration {
        self.poll_overrides
            .get(&category)
            .copied()
            .unwrap_or(self.poll_interval)
    }

    /// Load configuration from the process environment
    ///
    /// Reads `secrets.env` from the working directory first if it exists.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::from_filename("secrets.env") {
            if !e.not_found() {
                tracing::warn!(error = %e, "Failed to read secrets.env");
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let host = get("UNIFI_GATEWAY_HOST")
            .ok_or_else(|| BridgeError::Config("UNIFI_GATEWAY_HOST is required".to_string()))?;
        let mut config = Config::new(host);

        if let Some(port) = get("UNIFI_GATEWAY_PORT") {
            config.controller.port = parse_num("UNIFI_GATEWAY_PORT", &port)?;
        }
        if let Some(verify) = get("UNIFI_VERIFY_TLS") {
            config.controller.verify_tls = parse_bool(&verify);
        }
        config.controller.api_key = get("UNIFI_API_KEY").map(Secret::new);
        config.controller.username = get("UNIFI_USERNAME");
        config.controller.password = get("UNIFI_PASSWORD").map(Secret::new);
        if let Some(secs) = get("UNIFI_TIMEOUT_SECS") {
            config.controller.timeout = Duration::from_secs(parse_num("UNIFI_TIMEOUT_SECS", &secs)?);
        }
        if let Some(retries) = get("UNIFI_RETRY_MAX") {
            config.controller.retry_max = parse_num("UNIFI_RETRY_MAX", &retries)?;
        }

        if let Some(list) = get("UNIFI_CATEGORIES") {
            let mut categories = Vec::new();
            for name in list.split(',').filter(|s| !s.trim().is_empty()) {
                let category: Category = name
                    .parse()
                    .map_err(|e| BridgeError::Config(format!("UNIFI_CATEGORIES: {e}")))?;
                if !categories.contains(&category) {
                    categories.push(category);
                }
            }
            config.categories = categories;
        }

        if let Some(secs) = get("EVENT_POLL_INTERVAL") {
            config.poll_interval = Duration::from_secs(parse_num("EVENT_POLL_INTERVAL", &secs)?);
        }
        for category in Category::ALL {
            let key = format!(
                "EVENT_POLL_INTERVAL_{}",
                category.as_str().to_ascii_uppercase()
            );
            if let Some(secs) = get(&key) {
                config
                    .poll_overrides
                    .insert(category, Duration::from_secs(parse_num(&key, &secs)?));
            }
        }

        if let Some(url) = get("GRAFANA_URL") {
            config.grafana.url = url.trim_end_matches('/').to_string();
        }
        config.grafana.api_key = get("GRAFANA_API_KEY").map(Secret::new);
        if let Some(org) = get("GRAFANA_ORG_ID") {
            config.grafana.org_id = parse_num("GRAFANA_ORG_ID", &org)?;
        }

        if let Some(url) = get("PROMETHEUS_PUSHGATEWAY") {
            let interval = match get("METRICS_PUSH_INTERVAL") {
                Some(secs) => parse_num("METRICS_PUSH_INTERVAL", &secs)?,
                None => DEFAULT_PUSH_INTERVAL_SECS,
            };
            config.pushgateway = Some(PushgatewayConfig {
                url: url.trim_end_matches('/').to_string(),
                job: "unifi_events".to_string(),
                interval: Duration::from_secs(interval),
            });
        }

        if let Some(addr) = get("VAHTI_METRICS_ADDR") {
            config.metrics_addr = addr
                .parse()
                .map_err(|e| BridgeError::Config(format!("VAHTI_METRICS_ADDR: {e}")))?;
        }
        if let Some(n) = get("VAHTI_RECENT_EVENTS") {
            config.recent_events = parse_num("VAHTI_RECENT_EVENTS", &n)?;
        }
        if let Some(level) = get("VAHTI_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Some(format) = get("VAHTI_LOG_FORMAT") {
            config.log_format = match format.to_ascii_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" | "text" => LogFormat::Pretty,
                other => {
                    return Err(BridgeError::Config(format!(
                        "VAHTI_LOG_FORMAT: expected json or pretty, got {other}"
                    )));
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the bridge cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.controller.host.is_empty() {
            return Err(BridgeError::Config("controller host is empty".to_string()));
        }
        if self.controller.timeout.is_zero() {
            return Err(BridgeError::Config("timeout must be greater than zero".to_string()));
        }
        if self.categories.is_empty() {
            return Err(BridgeError::Config("no categories enabled".to_string()));
        }
        for category in &self.categories {
            if self.poll_interval_for(*category).is_zero() {
                return Err(BridgeError::Config(format!(
                    "poll interval for {category} must be greater than zero"
                )));
            }
        }
        if self.controller.api_key.is_none() && !self.controller.has_login() {
            return Err(BridgeError::Config(
                "no credentials configured: set UNIFI_API_KEY or UNIFI_USERNAME/UNIFI_PASSWORD"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

fn parse_num<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: fmt::Display,
{
    value
        .parse()
        .map_err(|e| BridgeError::Config(format!("{key}: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("UNIFI_GATEWAY_HOST", "10.0.0.1"),
            ("UNIFI_API_KEY", "k"),
        ]))
        .unwrap();

        assert_eq!(config.controller.base_url(), "https://10.0.0.1:443");
        assert!(!config.controller.verify_tls);
        assert_eq!(config.controller.timeout, Duration::from_secs(30));
        assert_eq!(config.controller.retry_max, 2);
        assert_eq!(config.categories, Category::ALL.to_vec());
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert!(config.pushgateway.is_none());
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_missing_host_is_error() {
        let err = Config::from_lookup(lookup(&[("UNIFI_API_KEY", "k")])).unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_no_credentials_is_fatal() {
        let err = Config::from_lookup(lookup(&[("UNIFI_GATEWAY_HOST", "h")])).unwrap_err();
        assert!(err.to_string().contains("no credentials configured"));

        // Username alone is not enough
        let err = Config::from_lookup(lookup(&[
            ("UNIFI_GATEWAY_HOST", "h"),
            ("UNIFI_USERNAME", "admin"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[test]
    fn test_login_only_is_enough() {
        let config = Config::from_lookup(lookup(&[
            ("UNIFI_GATEWAY_HOST", "h"),
            ("UNIFI_USERNAME", "admin"),
            ("UNIFI_PASSWORD", "pw"),
        ]))
        .unwrap();
        assert!(config.controller.has_login());
        assert!(config.controller.api_key.is_none());
    }

    #[test]
    fn test_per_category_interval_override() {
        let config = Config::from_lookup(lookup(&[
            ("UNIFI_GATEWAY_HOST", "h"),
            ("UNIFI_API_KEY", "k"),
            ("EVENT_POLL_INTERVAL", "20"),
            ("EVENT_POLL_INTERVAL_PROTECT", "5"),
        ]))
        .unwrap();

        assert_eq!(config.poll_interval_for(Category::Network), Duration::from_secs(20));
        assert_eq!(config.poll_interval_for(Category::Protect), Duration::from_secs(5));
    }

    #[test]
    fn test_categories_and_flags() {
        let config = Config::from_lookup(lookup(&[
            ("UNIFI_GATEWAY_HOST", "h"),
            ("UNIFI_API_KEY", "k"),
            ("UNIFI_VERIFY_TLS", "YES"),
            ("UNIFI_CATEGORIES", "protect, access,protect"),
            ("PROMETHEUS_PUSHGATEWAY", "http://pgw:9091/"),
            ("VAHTI_LOG_FORMAT", "json"),
        ]))
        .unwrap();

        assert!(config.controller.verify_tls);
        assert_eq!(config.categories, vec![Category::Protect, Category::Access]);
        let pgw = config.pushgateway.unwrap();
        assert_eq!(pgw.url, "http://pgw:9091");
        assert_eq!(pgw.interval, Duration::from_secs(60));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_values_are_errors() {
        for (key, value) in [
            ("UNIFI_GATEWAY_PORT", "https"),
            ("UNIFI_CATEGORIES", "network,talk"),
            ("VAHTI_LOG_FORMAT", "xml"),
            ("EVENT_POLL_INTERVAL", "0"),
        ] {
            let result = Config::from_lookup(lookup(&[
                ("UNIFI_GATEWAY_HOST", "h"),
                ("UNIFI_API_KEY", "k"),
                (key, value),
            ]));
            assert!(result.is_err(), "{key}={value} should be rejected");
        }
    }

    #[test]
    fn test_secrets_are_redacted_in_debug() {
        let config = Config::new("h").with_api_key("super-secret").with_login("admin", "pw123");
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(!debug.contains("pw123"));
        assert!(debug.contains("Secret(***)"));
    }
}
