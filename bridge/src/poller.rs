//! Event poller: one scheduling loop per category
//!
//! # State machine
//!
//! ```text
//! Idle ──► Fetching ──► Normalizing ──► Emitting ──► Sleeping ──► Fetching ...
//!              │                                         ▲
//!              └──────────── failure ────────────────────┘
//!
//! any state ──shutdown (at a cycle boundary)──► Stopped
//! ```
//!
//! Each cycle fetches `[cursor, now]`, normalizes (skipping malformed
//! records), dedups and orders, delivers to every sink, then advances the
//! cursor. Failures are recorded in health and retried on the next cycle;
//! nothing here ends the process.

use crate::dedup::{DedupBuffer, PollCursor};
use crate::error::{ApiErrorKind, ErrorKind, Result};
use crate::health::{HealthAggregator, Outcome};
use crate::ingest::{FetchWindow, Ingestor, normalize};
use crate::metrics::Metrics;
use crate::recent::RecentEvents;
use crate::sink::SinkFanout;
use crate::upstream::UpstreamClient;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use vahti_core::Category;

/// Lower bound on the sleep between cycles
pub const MIN_SLEEP: Duration = Duration::from_secs(1);

/// Where a poller is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollerState {
    Idle,
    Fetching,
    Normalizing,
    Emitting,
    Sleeping,
    Stopped,
}

/// Shared collaborators every poller uses
#[derive(Clone)]
pub struct PollerContext {
    pub client: Arc<UpstreamClient>,
    pub fanout: Arc<SinkFanout>,
    pub health: Arc<HealthAggregator>,
    pub recent: Arc<RecentEvents>,
}

/// What one successful cycle did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub fetched: usize,
    pub malformed: usize,
    pub duplicates: usize,
    pub emitted: usize,
    pub sink_failures: usize,
}

pub struct EventPoller {
    category: Category,
    ingestor: Box<dyn Ingestor>,
    ctx: PollerContext,
    buffer: DedupBuffer,
    interval: Duration,
    resync: Arc<AtomicBool>,
}

impl EventPoller {
    /// A poller whose cursor starts at `start`
    pub fn new(
        ingestor: Box<dyn Ingestor>,
        ctx: PollerContext,
        interval: Duration,
        start: DateTime<Utc>,
    ) -> Self {
        Self {
            category: ingestor.category(),
            ingestor,
            ctx,
            buffer: DedupBuffer::new(start),
            interval,
            resync: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn cursor(&self) -> &PollCursor {
        self.buffer.cursor()
    }

    /// Share an externally owned resync flag
    pub fn with_resync_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.resync = flag;
        self
    }

    /// Flag that resets the cursor to "now" at the start of the next cycle
    pub fn resync_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.resync)
    }

    /// Run one cycle as if the current time were `now`
    ///
    /// Fetch failures are recorded in health and returned; the cursor does
    /// not move. Per-record and per-sink failures never fail the cycle.
    pub async fn cycle_at(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        if self.resync.swap(false, Ordering::SeqCst) {
            info!(category = %self.category, "Resync: cursor reset to now");
            self.buffer.resync(now);
        }

        self.set_state(PollerState::Fetching);
        let window = FetchWindow::new(self.buffer.cursor().last_seen_timestamp, now);
        let raw = match self.ingestor.fetch(&self.ctx.client, &window).await {
            Ok(raw) => raw,
            Err(e) => {
                let kind = e
                    .kind()
                    .unwrap_or(ErrorKind::Api(ApiErrorKind::ServerError));
                self.ctx
                    .health
                    .record(self.category, Outcome::PollFailed(kind));
                return Err(e);
            }
        };

        let mut report = CycleReport {
            fetched: raw.len(),
            ..CycleReport::default()
        };

        self.set_state(PollerState::Normalizing);
        let mut events = Vec::with_capacity(raw.len());
        for record in &raw {
            match normalize(record) {
                Ok(event) => events.push(event),
                Err(e) => {
                    report.malformed += 1;
                    warn!(category = %self.category, error = %e, "Skipping malformed record");
                    self.ctx
                        .health
                        .record(self.category, Outcome::MalformedEvent);
                }
            }
        }

        let admitted = self.buffer.admit_batch(events);
        report.duplicates = admitted.duplicates;
        if let Some(m) = Metrics::get() {
            m.record_malformed(self.category.as_str(), report.malformed as u64);
            m.record_duplicates(self.category.as_str(), report.duplicates as u64);
        }

        self.set_state(PollerState::Emitting);
        for event in &admitted.events {
            let delivery = self.ctx.fanout.emit(event).await;
            report.sink_failures += delivery.failed;
            report.emitted += 1;
            debug!(category = %self.category, id = %event.id, event_type = %event.event_type, "Event emitted");
            self.ctx.recent.push(event.clone());
        }
        // Sink failures are best-effort and never hold the cursor back
        self.buffer.advance(&admitted.events);

        self.ctx
            .health
            .record(self.category, Outcome::PollSucceeded);
        Ok(report)
    }

    /// Poll until `shutdown` flips to true (or its sender is dropped)
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            category = %self.category,
            interval_secs = self.interval.as_secs(),
            "Poller started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let started = Instant::now();
            let result = self.cycle_at(Utc::now()).await;
            let elapsed = started.elapsed();

            let failed = result.is_err();

            if let Some(m) = Metrics::get() {
                m.record_poll(self.category.as_str(), !failed, elapsed.as_secs_f64());
            }
            match result {
                Ok(report) if report.emitted > 0 || report.malformed > 0 => info!(
                    category = %self.category,
                    emitted = report.emitted,
                    duplicates = report.duplicates,
                    malformed = report.malformed,
                    sink_failures = report.sink_failures,
                    "Poll cycle complete"
                ),
                Ok(report) => debug!(
                    category = %self.category,
                    fetched = report.fetched,
                    duplicates = report.duplicates,
                    "Poll cycle complete, nothing new"
                ),
                Err(e) => {
                    let failures = self
                        .ctx
                        .health
                        .get(self.category)
                        .map_or(0, |r| r.consecutive_failures);
                    error!(
                        category = %self.category,
                        error = %e,
                        consecutive_failures = failures,
                        "Poll cycle failed"
                    );
                }
            }

            self.set_state(PollerState::Sleeping);
            let sleep = next_sleep(self.interval, elapsed, failed);
            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.set_state(PollerState::Stopped);
        info!(category = %self.category, "Poller stopped");
    }

    fn set_state(&self, state: PollerState) {
        self.ctx.health.set_state(self.category, state);
    }
}

/// Pause before the next cycle
///
/// A successful cycle keeps the cadence (interval minus the time it took); a
/// failed one waits the full interval. Never shorter than [`MIN_SLEEP`].
fn next_sleep(interval: Duration, elapsed: Duration, failed: bool) -> Duration {
    let sleep = if failed {
        interval
    } else {
        interval.saturating_sub(elapsed)
    };
    sleep.max(MIN_SLEEP)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::credentials::CredentialProvider;
    use crate::ingest::ingestor_for;
    use crate::testing::{RecordingSink, ScriptedTransport};
    use crate::upstream::transport::{HttpRequest, HttpResponse, TransportError};
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use serde_json::{Value, json};
    use vahti_core::Sink;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    struct Harness {
        poller: EventPoller,
        sink: Arc<RecordingSink>,
        health: Arc<HealthAggregator>,
        transport: Arc<ScriptedTransport>,
    }

    fn harness<F>(category: Category, respond: F) -> Harness
    where
        F: Fn(&HttpRequest) -> std::result::Result<HttpResponse, TransportError>
            + Send
            + Sync
            + 'static,
    {
        harness_with(
            Config::new("h").with_api_key("k"),
            ScriptedTransport::new(respond),
            category,
        )
    }

    fn harness_with(config: Config, transport: ScriptedTransport, category: Category) -> Harness {
        let transport = Arc::new(transport);
        let health = Arc::new(HealthAggregator::new(&Category::ALL));
        let credentials = Arc::new(CredentialProvider::new(&config.controller, transport.clone()));
        let client = Arc::new(UpstreamClient::new(
            &config.controller,
            transport.clone(),
            credentials,
            Arc::clone(&health),
        ));
        let sink = Arc::new(RecordingSink::new("recording"));
        let sinks: Vec<Arc<dyn Sink>> = vec![sink.clone()];
        let fanout = Arc::new(SinkFanout::new(
            sinks,
            Duration::from_secs(5),
            Arc::clone(&health),
        ));
        let ctx = PollerContext {
            client,
            fanout,
            health: Arc::clone(&health),
            recent: Arc::new(RecentEvents::new(100)),
        };
        Harness {
            poller: EventPoller::new(ingestor_for(category), ctx, Duration::from_secs(30), at(0)),
            sink,
            health,
            transport,
        }
    }

    /// Access API serving whatever `events` currently holds
    fn access_feed(events: Arc<Mutex<Value>>) -> impl Fn(&HttpRequest) -> std::result::Result<HttpResponse, TransportError> {
        move |_| Ok(HttpResponse::json(&json!({"data": events.lock().clone()})))
    }

    #[tokio::test]
    async fn test_cycle_emits_in_order_and_advances_cursor() {
        let feed = Arc::new(Mutex::new(json!([
            {"id": "C", "timestamp": 12, "access_granted": true},
            {"id": "B", "timestamp": 10, "access_granted": true},
            {"id": "A", "timestamp": 10, "access_granted": false}
        ])));
        let mut h = harness(Category::Access, access_feed(Arc::clone(&feed)));

        let report = h.poller.cycle_at(at(15)).await.unwrap();
        assert_eq!(report.emitted, 3);
        assert_eq!(h.sink.ids(), ["access:A", "access:B", "access:C"]);
        assert_eq!(h.poller.cursor().last_seen_timestamp, at(12));

        *feed.lock() = json!([
            {"id": "C", "timestamp": 12},
            {"id": "D", "timestamp": 12},
            {"id": "E", "timestamp": 20}
        ]);
        let report = h.poller.cycle_at(at(40)).await.unwrap();
        assert_eq!(report.emitted, 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(
            h.sink.ids(),
            ["access:A", "access:B", "access:C", "access:D", "access:E"]
        );

        // The second window started at the previous boundary
        let since: Vec<_> = h
            .transport
            .requests()
            .iter()
            .filter_map(|r| r.query.iter().find(|(k, _)| k == "since").map(|(_, v)| v.clone()))
            .collect();
        assert_eq!(since, ["0", "12"]);
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped() {
        let feed = Arc::new(Mutex::new(json!([
            {"id": "1", "timestamp": 1},
            {"id": "2", "timestamp": 2},
            {"timestamp": 3},
            {"id": "4", "timestamp": 4},
            {"id": "5", "timestamp": 5},
        ])));
        let mut h = harness(Category::Access, access_feed(feed));

        let report = h.poller.cycle_at(at(10)).await.unwrap();
        assert_eq!(report.malformed, 1);
        assert_eq!(report.emitted, 4);
        let record = h.health.get(Category::Access).unwrap();
        assert_eq!(record.malformed_events, 1);
        assert_eq!(record.consecutive_failures, 0);
        assert!(record.last_success.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_failure_keeps_cursor_and_counts_streak() {
        let mut h = harness(Category::Protect, |_| Ok(HttpResponse::new(503, "")));

        for expected in 1..=3 {
            assert!(h.poller.cycle_at(at(100)).await.is_err());
            let record = h.health.get(Category::Protect).unwrap();
            assert_eq!(record.consecutive_failures, expected);
            assert_eq!(
                record.last_error,
                Some(ErrorKind::Api(ApiErrorKind::ServerError))
            );
        }
        assert!(h.health.get(Category::Protect).unwrap().is_degraded());
        assert_eq!(h.poller.cursor().last_seen_timestamp, at(0));
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_hold_cursor() {
        let feed = Arc::new(Mutex::new(json!([{"id": "X", "timestamp": 7}])));
        let mut h = harness(Category::Access, access_feed(feed));
        h.sink.set_failing(true);

        let report = h.poller.cycle_at(at(10)).await.unwrap();
        assert_eq!(report.sink_failures, 1);
        assert_eq!(h.poller.cursor().last_seen_timestamp, at(7));

        // Not re-delivered on the next cycle
        h.sink.set_failing(false);
        let report = h.poller.cycle_at(at(20)).await.unwrap();
        assert_eq!(report.emitted, 0);
        assert_eq!(h.sink.attempts(), 1);
    }

    #[tokio::test]
    async fn test_resync_moves_cursor_to_now() {
        let feed = Arc::new(Mutex::new(json!([{"id": "X", "timestamp": 7}])));
        let mut h = harness(Category::Access, access_feed(feed));
        h.poller.cycle_at(at(10)).await.unwrap();

        h.poller.resync_handle().store(true, Ordering::SeqCst);
        h.poller.cycle_at(at(50)).await.unwrap();
        assert_eq!(h.poller.cursor().last_seen_timestamp, at(50));
        assert!(h.poller.cursor().last_seen_ids.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let h = harness(Category::Access, |_| Ok(HttpResponse::json(&json!({"data": []}))));
        let health = Arc::clone(&h.health);
        let transport = Arc::clone(&h.transport);
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(h.poller.run(rx));

        // First cycle runs immediately, then one per interval
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(transport.request_count(), 3);

        tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(
            health.get(Category::Access).unwrap().state,
            PollerState::Stopped
        );
    }

    #[test]
    fn test_next_sleep() {
        let interval = Duration::from_secs(30);
        assert_eq!(next_sleep(interval, Duration::from_secs(4), false), Duration::from_secs(26));
        assert_eq!(next_sleep(interval, Duration::from_secs(45), false), MIN_SLEEP);
        assert_eq!(next_sleep(interval, Duration::from_secs(4), true), interval);
        assert_eq!(next_sleep(Duration::ZERO, Duration::ZERO, true), MIN_SLEEP);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_cycle_sleeps_only_the_floor() {
        // Each fetch takes 35s against a 30s interval
        let config = Config::new("h")
            .with_api_key("k")
            .with_timeout(Duration::from_secs(60));
        let transport = ScriptedTransport::new(|_| Ok(HttpResponse::json(&json!({"data": []}))))
            .with_delay(Duration::from_secs(35));
        let h = harness_with(config, transport, Category::Access);
        let transport = Arc::clone(&h.transport);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.poller.run(rx));

        tokio::time::sleep(Duration::from_millis(35_500)).await;
        assert_eq!(transport.request_count(), 1);

        // Next fetch starts MIN_SLEEP after the slow one returned
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(transport.request_count(), 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_sleeps_full_interval() {
        let transport = ScriptedTransport::new(|_| Ok(HttpResponse::new(503, "")))
            .with_delay(Duration::from_secs(5));
        let h = harness_with(
            Config::new("h").with_api_key("k"),
            transport,
            Category::Protect,
        );
        let transport = Arc::clone(&h.transport);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(h.poller.run(rx));

        // Failed at 5s; the retry is due at 35s, not 30s
        tokio::time::sleep(Duration::from_secs(32)).await;
        assert_eq!(transport.request_count(), 1);
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(transport.request_count(), 2);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
