//! Bridge - lifecycle handle for the whole pipeline
//!
//! Owns the shared collaborators (credential provider, upstream client, sink
//! fan-out, health aggregator, recent-event rings) and one [`EventPoller`]
//! task per enabled category.
//!
//! # Example
//!
//! ```ignore
//! use vahti_bridge::{Bridge, Config, MetricsSink};
//!
//! let config = Config::from_env()?;
//! let bridge = Bridge::builder(config)
//!     .sink(MetricsSink::new(prometheus::default_registry())?)
//!     .build()?;
//!
//! bridge.start()?;
//! // ...
//! bridge.stop().await;
//! ```

use crate::config::Config;
use crate::credentials::CredentialProvider;
use crate::error::{BridgeError, ErrorKind, Result};
use crate::health::{HealthAggregator, HealthRecord, Outcome};
use crate::ingest::ingestor_for;
use crate::poller::{EventPoller, PollerContext, PollerState};
use crate::recent::RecentEvents;
use crate::sink::{AnnotationSink, SinkFanout};
use crate::upstream::UpstreamClient;
use crate::upstream::backoff::RetryPolicy;
use crate::upstream::transport::{ReqwestTransport, Transport};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use vahti_core::{CanonicalEvent, Category, Sink};

/// Builder for [`Bridge`]
pub struct BridgeBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    sinks: Vec<Arc<dyn Sink>>,
    annotations: bool,
    retry: Option<RetryPolicy>,
    start_at: Option<DateTime<Utc>>,
}

impl BridgeBuilder {
    /// HTTP transport for the controller and the annotation sink
    ///
    /// Defaults to a [`ReqwestTransport`] built from the controller config.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Add a sink
    pub fn sink<S: Sink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Add a sink (Arc version)
    pub fn sink_arc(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Add the annotation sink when the config carries a dashboard token
    pub fn with_annotations(mut self) -> Self {
        self.annotations = true;
        self
    }

    /// Override the upstream retry policy
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Initial cursor position for every poller (default: the time of `start()`)
    pub fn start_at(mut self, ts: DateTime<Utc>) -> Self {
        self.start_at = Some(ts);
        self
    }

    /// Validate the config and wire the pipeline
    ///
    /// Fails only with `BridgeError::Config`.
    pub fn build(self) -> Result<Bridge> {
        self.config.validate()?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(t) => t,
            None => Arc::new(ReqwestTransport::new(
                self.config.controller.verify_tls,
                self.config.controller.timeout,
            )?),
        };

        let mut sinks = self.sinks;
        if self.annotations {
            match AnnotationSink::from_config(&self.config.grafana, Arc::clone(&transport)) {
                Some(sink) => sinks.push(Arc::new(sink)),
                None => info!("No dashboard API token configured, annotations disabled"),
            }
        }
        if sinks.is_empty() {
            warn!("No sinks configured, events will only be kept in memory");
        }

        let health = Arc::new(HealthAggregator::new(&self.config.categories));
        let credentials = Arc::new(CredentialProvider::new(
            &self.config.controller,
            Arc::clone(&transport),
        ));
        let mut client = UpstreamClient::new(
            &self.config.controller,
            Arc::clone(&transport),
            credentials,
            Arc::clone(&health),
        );
        if let Some(retry) = self.retry {
            client = client.with_retry_policy(retry);
        }

        let ctx = PollerContext {
            client: Arc::new(client),
            fanout: Arc::new(SinkFanout::new(
                sinks,
                self.config.controller.timeout,
                Arc::clone(&health),
            )),
            health,
            recent: Arc::new(RecentEvents::new(self.config.recent_events)),
        };

        let resync = self
            .config
            .categories
            .iter()
            .map(|c| (*c, Arc::new(AtomicBool::new(false))))
            .collect();

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Bridge {
            config: self.config,
            ctx,
            resync,
            start_at: self.start_at,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }
}

/// Running (or runnable) event bridge
pub struct Bridge {
    config: Config,
    ctx: PollerContext,
    resync: HashMap<Category, Arc<AtomicBool>>,
    start_at: Option<DateTime<Utc>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<(Category, JoinHandle<()>)>>,
    started: AtomicBool,
}

impl Bridge {
    pub fn builder(config: Config) -> BridgeBuilder {
        BridgeBuilder {
            config,
            transport: None,
            sinks: Vec::new(),
            annotations: false,
            retry: None,
            start_at: None,
        }
    }

    /// Spawn one poller task per enabled category
    ///
    /// A category with no usable credential is recorded in health and
    /// skipped; the others still start. Must be called inside a tokio
    /// runtime. Fails if the bridge was already started or stopped.
    pub fn start(&self) -> Result<()> {
        if *self.shutdown_tx.borrow() {
            return Err(BridgeError::Shutdown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::Config("bridge already started".to_string()));
        }

        let start = self.start_at.unwrap_or_else(Utc::now);
        let credentials = self.ctx.client.credentials();
        let mut tasks = self.tasks.lock();

        for &category in &self.config.categories {
            if !credentials.has_primary() && !credentials.has_secondary() {
                let err = BridgeError::AuthUnavailable { category };
                warn!(category = %category, error = %err, "Category not started");
                self.ctx
                    .health
                    .record(category, Outcome::PollFailed(ErrorKind::AuthUnavailable));
                self.ctx.health.set_state(category, PollerState::Stopped);
                continue;
            }

            let mut poller = EventPoller::new(
                ingestor_for(category),
                self.ctx.clone(),
                self.config.poll_interval_for(category),
                start,
            );
            if let Some(flag) = self.resync.get(&category) {
                poller = poller.with_resync_flag(Arc::clone(flag));
            }

            let handle = tokio::spawn(poller.run(self.shutdown_tx.subscribe()));
            tasks.push((category, handle));
        }

        info!(
            categories = tasks.len(),
            sinks = ?self.ctx.fanout.sink_names(),
            "Bridge started"
        );
        Ok(())
    }

    /// Signal shutdown and wait for every poller to finish its cycle
    ///
    /// Sinks get their shutdown hook afterwards. Every category ends in
    /// `Stopped`.
    pub async fn stop(&self) {
        self.shutdown_tx.send_replace(true);

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for (category, handle) in tasks {
            if let Err(e) = handle.await {
                error!(category = %category, error = %e, "Poller task ended abnormally");
            }
        }

        self.ctx.fanout.shutdown().await;
        for &category in &self.config.categories {
            self.ctx.health.set_state(category, PollerState::Stopped);
        }
        info!("Bridge stopped");
    }

    /// Health snapshot for every enabled category
    pub fn poll_health(&self) -> BTreeMap<Category, HealthRecord> {
        self.ctx.health.snapshot()
    }

    /// Up to `limit` recently emitted events for a category, newest first
    pub fn latest_events(&self, category: Category, limit: usize) -> Vec<CanonicalEvent> {
        self.ctx.recent.latest(category, limit)
    }

    /// Reset a category's cursor to "now" on its next cycle
    ///
    /// Returns false when the category is not enabled.
    pub fn resync(&self, category: Category) -> bool {
        match self.resync.get(&category) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!(category = %category, "Resync requested");
                true
            }
            None => false,
        }
    }

    pub fn health(&self) -> Arc<HealthAggregator> {
        Arc::clone(&self.ctx.health)
    }

    pub fn recent(&self) -> Arc<RecentEvents> {
        Arc::clone(&self.ctx.recent)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
