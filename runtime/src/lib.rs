//! vahti runtime - process wiring for the event bridge
//!
//! Provides [`run()`] for zero-boilerplate startup, and [`RuntimeBuilder`]
//! for embedders who need control over the metrics server or want to add
//! their own sinks.
//!
//! # Quick start
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     vahti_runtime::run(|bridge| async move { Ok(bridge) }).await
//! }
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use vahti_bridge::config::{Config, LogFormat};
use vahti_bridge::metrics::Metrics;
use vahti_bridge::{
    Bridge, BridgeBuilder, MetricsServer, MetricsSink, PushgatewayPusher, ReqwestTransport,
    Transport,
};

/// Run the bridge with settings from the environment.
///
/// Loads configuration, initialises tracing and metrics, lets `configure`
/// adjust the bridge builder, then polls until SIGINT or SIGTERM.
pub async fn run<F, Fut>(configure: F) -> anyhow::Result<()>
where
    F: FnOnce(BridgeBuilder) -> Fut,
    Fut: Future<Output = anyhow::Result<BridgeBuilder>>,
{
    RuntimeBuilder::new().configure(configure).await
}

/// Power-user builder for controlling runtime behaviour.
pub struct RuntimeBuilder {
    metrics_addr: Option<SocketAddr>,
    metrics_server: bool,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            metrics_addr: None,
            metrics_server: true,
        }
    }

    /// Override the metrics HTTP server address.
    ///
    /// Default: `VAHTI_METRICS_ADDR`, or `0.0.0.0:9090`.
    pub fn metrics_addr(mut self, addr: SocketAddr) -> Self {
        self.metrics_addr = Some(addr);
        self
    }

    /// Don't serve /metrics, /health and /events.
    pub fn disable_metrics_server(mut self) -> Self {
        self.metrics_server = false;
        self
    }

    /// Configure the bridge and run it to completion.
    ///
    /// This is the terminal method - it returns after shutdown.
    pub async fn configure<F, Fut>(self, configure: F) -> anyhow::Result<()>
    where
        F: FnOnce(BridgeBuilder) -> Fut,
        Fut: Future<Output = anyhow::Result<BridgeBuilder>>,
    {
        // ── 1. Load config from env ──────────────────────────────
        let config = Config::from_env()?;

        // ── 2. Init tracing ──────────────────────────────────────
        init_tracing(&config);

        let metrics_addr = self.metrics_addr.unwrap_or(config.metrics_addr);
        info!(
            controller = %config.controller.base_url(),
            categories = ?config.categories,
            poll_interval_secs = config.poll_interval.as_secs(),
            metrics_addr = %metrics_addr,
            "Starting vahti"
        );

        // ── 3. Init metrics ──────────────────────────────────────
        Metrics::init()?;
        let metrics_sink = MetricsSink::new(prometheus::default_registry())?;

        // ── 4. Wire the bridge ───────────────────────────────────
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(
            config.controller.verify_tls,
            config.controller.timeout,
        )?);
        let pushgateway = config.pushgateway.clone();
        let timeout = config.controller.timeout;

        let builder = Bridge::builder(config)
            .transport(transport)
            .sink(metrics_sink)
            .with_annotations();
        let bridge = configure(builder).await?.build()?;

        // ── 5. HTTP server and optional Pushgateway pusher ───────
        let server_handle = self
            .metrics_server
            .then(|| MetricsServer::start(metrics_addr, bridge.health(), bridge.recent()));

        let (push_tx, push_rx) = watch::channel(false);
        let push_handle = match pushgateway {
            Some(pg) => {
                let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(true, timeout)?);
                Some(tokio::spawn(PushgatewayPusher::new(&pg, transport).run(push_rx)))
            }
            None => None,
        };

        // ── 6. Poll until signalled ──────────────────────────────
        bridge.start()?;
        shutdown_signal().await;

        // ── 7. Shutdown ──────────────────────────────────────────
        bridge.stop().await;
        let _ = push_tx.send(true);
        if let Some(handle) = push_handle {
            let _ = handle.await;
        }
        if let Some(handle) = server_handle {
            handle.abort();
        }
        info!("vahti shutdown complete");

        Ok(())
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Initialise the tracing subscriber based on config.
fn init_tracing(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.log_level.clone().into());

    let registry = tracing_subscriber::registry().with(env_filter);

    match config.log_format {
        LogFormat::Json => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
