//! HTTP server for Prometheus metrics and bridge introspection
//!
//! Runs a lightweight HTTP server on its own port for Prometheus scraping
//! and for whatever sits in front of the bridge (resource routers, probes).
//!
//! # Endpoints
//!
//! - `GET /metrics` - Prometheus metrics (default registry)
//! - `GET /health` - per-category health records; 503 when any is degraded
//! - `GET /events/{category}?limit=N` - recent canonical events, newest first
//!
//! # Example
//!
//! ```ignore
//! use vahti_bridge::metrics_server::MetricsServer;
//!
//! let handle = MetricsServer::start(config.metrics_addr, bridge.health(), bridge.recent());
//! ```

use crate::health::HealthAggregator;
use crate::recent::RecentEvents;
use axum::extract::{Path, Query, State};
use axum::{Json, Router, http::StatusCode, response::IntoResponse, routing::get};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info};
use vahti_core::Category;

const DEFAULT_EVENT_LIMIT: usize = 50;

/// Shared state for the metrics server
#[derive(Clone)]
struct AppState {
    health: Arc<HealthAggregator>,
    recent: Arc<RecentEvents>,
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

/// Metrics HTTP server
pub struct MetricsServer;

impl MetricsServer {
    /// Start the metrics server on `addr`
    ///
    /// Returns a JoinHandle that can be used to abort the server.
    /// The server runs until aborted or the process exits.
    pub fn start(
        addr: SocketAddr,
        health: Arc<HealthAggregator>,
        recent: Arc<RecentEvents>,
    ) -> JoinHandle<()> {
        let app = router(AppState { health, recent });

        tokio::spawn(async move {
            info!(addr = %addr, "Metrics server starting");

            let listener = match tokio::net::TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(e) => {
                    error!(error = %e, addr = %addr, "Failed to bind metrics server");
                    return;
                }
            };

            if let Err(e) = axum::serve(listener, app).await {
                error!(error = %e, "Metrics server error");
            }
        })
    }
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/events/:category", get(events_handler))
        .with_state(state)
}

/// Handler for /metrics endpoint
async fn metrics_handler() -> impl IntoResponse {
    let body = crate::metrics::gather();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Handler for /health endpoint
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let degraded = state.health.is_degraded();
    let body = serde_json::json!({
        "status": if degraded { "degraded" } else { "ok" },
        "categories": state.health.snapshot(),
    });
    let code = if degraded {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(body))
}

/// Handler for /events/{category}
async fn events_handler(
    State(state): State<AppState>,
    Path(category): Path<String>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let Ok(category) = category.parse::<Category>() else {
        return (StatusCode::NOT_FOUND, format!("unknown category: {category}")).into_response();
    };
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    (StatusCode::OK, Json(state.recent.latest(category, limit))).into_response()
}
