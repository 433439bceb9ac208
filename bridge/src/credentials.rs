//! Credential provider
//!
//! Holds the primary (API key) and secondary (legacy session cookie)
//! credentials for the controller and decides which one a request uses.
//!
//! # Session lifecycle
//!
//! ```text
//! none ──login──► Arc<Session> ──expiry / 401──► none ──login──► Arc<Session>'
//! ```
//!
//! The session is never mutated in place. Readers clone the `Arc` they were
//! handed; a refresh swaps a brand new `Arc` into the slot, so a request that
//! is still using the old token keeps a consistent snapshot.

use crate::config::{ControllerConfig, Secret};
use crate::error::{BridgeError, Result};
use crate::upstream::transport::{HttpRequest, Transport};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use vahti_core::Category;

/// Sessions this close to expiry are refreshed before use
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);
/// Used when the login response does not say how long the cookie lives
const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(2 * 60 * 60);
/// Longer cookie lifetimes are clamped to this
const MAX_SESSION_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const LOGIN_PATH: &str = "/api/auth/login";

/// Which credential form served a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    /// `X-API-Key`
    ApiKey,
    /// Legacy `TOKEN` cookie
    Session,
}

/// A logged-in legacy session
pub struct Session {
    token: Secret,
    csrf_token: Option<String>,
    expires_at: Instant,
    refresh_at: Instant,
}

impl Session {
    /// `ttl` is clamped to 30 days. The refresh margin is 60s, or half the
    /// TTL for short-lived cookies.
    pub fn new(token: impl Into<String>, csrf_token: Option<String>, ttl: Duration) -> Self {
        let ttl = ttl.min(MAX_SESSION_TTL);
        let margin = EXPIRY_MARGIN.min(ttl / 2);
        let now = Instant::now();
        Self {
            token: Secret::new(token),
            csrf_token,
            expires_at: now.checked_add(ttl).unwrap_or(now),
            refresh_at: now.checked_add(ttl - margin).unwrap_or(now),
        }
    }

    /// True while the session is usable with some margin left
    pub fn is_fresh(&self) -> bool {
        Instant::now() < self.refresh_at
    }

    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token)
            .field("has_csrf", &self.csrf_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// A resolved credential, ready to be applied to a request
#[derive(Debug, Clone)]
pub enum Credential {
    ApiKey(Secret),
    Session(Arc<Session>),
}

impl Credential {
    pub fn kind(&self) -> CredentialKind {
        match self {
            Credential::ApiKey(_) => CredentialKind::ApiKey,
            Credential::Session(_) => CredentialKind::Session,
        }
    }

    /// Attach the credential headers to a request
    pub fn apply(&self, request: HttpRequest) -> HttpRequest {
        match self {
            Credential::ApiKey(key) => request.header("X-API-Key", key.expose()),
            Credential::Session(session) => {
                let request =
                    request.header("Cookie", format!("TOKEN={}", session.token.expose()));
                match &session.csrf_token {
                    Some(csrf) => request.header("X-CSRF-Token", csrf.as_str()),
                    None => request,
                }
            }
        }
    }
}

/// Resolves and refreshes controller credentials
pub struct CredentialProvider {
    api_key: Option<Secret>,
    login: Option<(String, Secret)>,
    login_url: String,
    timeout: Duration,
    transport: Arc<dyn Transport>,
    session: RwLock<Option<Arc<Session>>>,
    /// Serializes logins so concurrent pollers don't each log in
    refresh_lock: tokio::sync::Mutex<()>,
    /// Categories whose primary credential was rejected
    prefer_secondary: RwLock<HashSet<Category>>,
}

impl CredentialProvider {
    pub fn new(controller: &ControllerConfig, transport: Arc<dyn Transport>) -> Self {
        let login = match (&controller.username, &controller.password) {
            (Some(user), Some(password)) => Some((user.clone(), password.clone())),
            _ => None,
        };
        Self {
            api_key: controller.api_key.clone(),
            login,
            login_url: format!("{}{}", controller.base_url(), LOGIN_PATH),
            timeout: controller.timeout,
            transport,
            session: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
            prefer_secondary: RwLock::new(HashSet::new()),
        }
    }

    pub fn has_primary(&self) -> bool {
        self.api_key.is_some()
    }

    pub fn has_secondary(&self) -> bool {
        self.login.is_some()
    }

    /// Pick the credential for a category's next request
    ///
    /// The API key wins unless it was rejected for this category earlier, in
    /// which case the session is used (logging in first if needed).
    pub async fn resolve(&self, category: Category) -> Result<Credential> {
        if let Some(key) = &self.api_key {
            if !self.prefers_secondary(category) || !self.has_secondary() {
                return Ok(Credential::ApiKey(key.clone()));
            }
        }
        if self.has_secondary() {
            return self.secondary().await;
        }
        Err(BridgeError::AuthUnavailable { category })
    }

    /// Current session if still fresh, otherwise a new one
    pub async fn secondary(&self) -> Result<Credential> {
        if let Some(session) = self.current_session() {
            return Ok(Credential::Session(session));
        }

        let _guard = self.refresh_lock.lock().await;
        // Another poller may have logged in while we waited
        if let Some(session) = self.current_session() {
            return Ok(Credential::Session(session));
        }
        self.login().await.map(Credential::Session)
    }

    /// Perform the legacy login exchange and install a new session
    ///
    /// Failures are `AuthRefreshFailed` and retryable by the caller.
    pub async fn refresh_secondary(&self) -> Result<Arc<Session>> {
        let _guard = self.refresh_lock.lock().await;
        self.login().await
    }

    /// Drop the session after the upstream rejected it
    pub fn invalidate_secondary(&self) {
        if self.session.write().take().is_some() {
            debug!("Session invalidated");
        }
    }

    /// Stick to the secondary credential for this category from now on
    pub fn prefer_secondary(&self, category: Category) {
        if self.prefer_secondary.write().insert(category) {
            warn!(category = %category, "API key rejected, using session credential from now on");
        }
    }

    pub fn prefers_secondary(&self, category: Category) -> bool {
        self.prefer_secondary.read().contains(&category)
    }

    fn current_session(&self) -> Option<Arc<Session>> {
        self.session
            .read()
            .as_ref()
            .filter(|s| s.is_fresh())
            .map(Arc::clone)
    }

    async fn login(&self) -> Result<Arc<Session>> {
        let Some((username, password)) = &self.login else {
            return Err(BridgeError::AuthRefreshFailed(
                "no username/password configured".to_string(),
            ));
        };

        let body = serde_json::json!({
            "username": username,
            "password": password.expose(),
            "remember": true,
        });
        let request = HttpRequest::post_json(&self.login_url, &body);

        let response = tokio::time::timeout(self.timeout, self.transport.send(request))
            .await
            .map_err(|_| BridgeError::AuthRefreshFailed("login timed out".to_string()))?
            .map_err(|e| BridgeError::AuthRefreshFailed(e.to_string()))?;

        if !response.is_success() {
            return Err(BridgeError::AuthRefreshFailed(format!(
                "login rejected with status {}",
                response.status
            )));
        }

        let mut token = None;
        let mut ttl = DEFAULT_SESSION_TTL;
        for cookie in response.headers_all("set-cookie") {
            if let Some((value, max_age)) = parse_token_cookie(cookie) {
                token = Some(value);
                if let Some(max_age) = max_age {
                    ttl = max_age;
                }
            }
        }
        if token.is_none() {
            token = serde_json::from_slice::<serde_json::Value>(&response.body)
                .ok()
                .and_then(|v| v.get("token").and_then(|t| t.as_str()).map(str::to_string));
        }
        let token = token.ok_or_else(|| {
            BridgeError::AuthRefreshFailed("login response carried no session token".to_string())
        })?;

        let csrf = response
            .header("x-updated-csrf-token")
            .or_else(|| response.header("x-csrf-token"))
            .map(str::to_string);

        let session = Arc::new(Session::new(token, csrf, ttl));
        *self.session.write() = Some(Arc::clone(&session));
        info!(ttl_secs = ttl.min(MAX_SESSION_TTL).as_secs(), "Session login succeeded");
        Ok(session)
    }
}

/// Extract `TOKEN=<value>` and its `Max-Age` from a `Set-Cookie` header
fn parse_token_cookie(header: &str) -> Option<(String, Option<Duration>)> {
    let mut parts = header.split(';').map(str::trim);
    let (name, value) = parts.next()?.split_once('=')?;
    if !name.eq_ignore_ascii_case("TOKEN") || value.is_empty() {
        return None;
    }
    let max_age = parts
        .filter_map(|attr| attr.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("max-age"))
        .and_then(|(_, v)| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    Some((value.to_string(), max_age))
}
