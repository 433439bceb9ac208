//! End-to-end poll cycles against a scripted controller
//!
//! Each test drives one `EventPoller` through `cycle_at` with explicit
//! clock values, so windows and cursors are deterministic.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use vahti_bridge::config::{Config, GrafanaConfig, Secret};
use vahti_bridge::health::HealthAggregator;
use vahti_bridge::ingest::ingestor_for;
use vahti_bridge::testing::{RecordingSink, ScriptedTransport};
use vahti_bridge::upstream::transport::{HttpRequest, HttpResponse, TransportError};
use vahti_bridge::{
    AnnotationSink, Category, CredentialProvider, ErrorKind, EventPoller, MetricsSink,
    PollerContext, RecentEvents, Severity, Sink, SinkFanout, UpstreamClient,
};

// ============================================================================
// Harness
// ============================================================================

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

type Responder = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync>;

/// Scripted controller whose response body can be swapped between cycles
struct Controller {
    body: Arc<Mutex<Value>>,
    transport: Arc<ScriptedTransport>,
}

impl Controller {
    /// `grafana` answers annotation posts; everything else gets `body`
    fn new(grafana: Responder) -> Self {
        let body = Arc::new(Mutex::new(json!([])));
        let current = Arc::clone(&body);
        let transport = Arc::new(ScriptedTransport::new(move |req| {
            if req.url.starts_with("http://grafana") {
                grafana(req)
            } else {
                Ok(HttpResponse::json(&current.lock()))
            }
        }));
        Self { body, transport }
    }

    fn serve(&self, body: Value) {
        *self.body.lock() = body;
    }
}

fn grafana_ok() -> Responder {
    Box::new(|_| Ok(HttpResponse::json(&json!({"id": 1}))))
}

struct Pipeline {
    poller: EventPoller,
    health: Arc<HealthAggregator>,
    recent: Arc<RecentEvents>,
}

fn pipeline(category: Category, controller: &Controller, sinks: Vec<Arc<dyn Sink>>) -> Pipeline {
    let config = Config::new("udm.local").with_api_key("key");
    let health = Arc::new(HealthAggregator::new(&Category::ALL));
    let credentials = Arc::new(CredentialProvider::new(
        &config.controller,
        controller.transport.clone(),
    ));
    let client = UpstreamClient::new(
        &config.controller,
        controller.transport.clone(),
        credentials,
        Arc::clone(&health),
    );
    let recent = Arc::new(RecentEvents::new(50));
    let ctx = PollerContext {
        client: Arc::new(client),
        fanout: Arc::new(SinkFanout::new(
            sinks,
            Duration::from_secs(5),
            Arc::clone(&health),
        )),
        health: Arc::clone(&health),
        recent: Arc::clone(&recent),
    };
    Pipeline {
        poller: EventPoller::new(ingestor_for(category), ctx, Duration::from_secs(30), at(0)),
        health,
        recent,
    }
}

// ============================================================================
// Overlapping windows
// ============================================================================

#[tokio::test]
async fn overlapping_windows_deliver_each_event_once_in_order() {
    let controller = Controller::new(grafana_ok());
    let sink = Arc::new(RecordingSink::new("recording"));
    let mut p = pipeline(Category::Access, &controller, vec![sink.clone() as Arc<dyn Sink>]);

    controller.serve(json!({"data": [
        {"id": "C", "timestamp": 12, "type": "doorbell"},
        {"id": "B", "timestamp": 10, "access_granted": true},
        {"id": "A", "timestamp": 10, "access_granted": false},
    ]}));
    p.poller.cycle_at(at(15)).await.unwrap();

    assert_eq!(sink.ids(), ["access:A", "access:B", "access:C"]);
    let cursor = p.poller.cursor();
    assert_eq!(cursor.last_seen_timestamp, at(12));
    assert_eq!(cursor.last_seen_ids.len(), 1);
    assert!(cursor.last_seen_ids.contains("access:C"));

    controller.serve(json!({"data": [
        {"id": "C", "timestamp": 12, "type": "doorbell"},
        {"id": "D", "timestamp": 12, "type": "door_held_open"},
        {"id": "E", "timestamp": 20, "type": "door_forced_open"},
    ]}));
    let report = p.poller.cycle_at(at(40)).await.unwrap();

    assert_eq!(report.emitted, 2);
    assert_eq!(report.duplicates, 1);
    assert_eq!(
        sink.ids(),
        ["access:A", "access:B", "access:C", "access:D", "access:E"]
    );
    let events = sink.events();
    assert_eq!(events[3].event_type, "door.held_open");
    assert_eq!(events[4].severity, Severity::Critical);
    assert_eq!(p.poller.cursor().last_seen_timestamp, at(20));
}

#[tokio::test]
async fn emission_is_sorted_by_timestamp_then_id() {
    let controller = Controller::new(grafana_ok());
    let sink = Arc::new(RecordingSink::new("recording"));
    let mut p = pipeline(Category::Protect, &controller, vec![sink.clone() as Arc<dyn Sink>]);

    controller.serve(json!([
        {"id": "e5", "type": "motion", "start": 5_000},
        {"id": "e1", "type": "ring", "start": 1_000},
        {"id": "e3b", "type": "motion", "start": 3_000},
        {"id": "e3a", "type": "smartDetectZone", "smartDetectTypes": ["person"], "start": 3_000},
        {"id": "e2", "type": "sensorWaterLeak", "start": 2_000},
    ]));
    p.poller.cycle_at(at(10)).await.unwrap();

    let events = sink.events();
    let ids: Vec<_> = events.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(
        ids,
        ["protect:e1", "protect:e2", "protect:e3a", "protect:e3b", "protect:e5"]
    );
    assert!(events.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert_eq!(events[2].event_type, "smart_detect.person");

    // Recent history reads newest first
    let latest: Vec<_> = p
        .recent
        .latest(Category::Protect, 2)
        .into_iter()
        .map(|e| e.id)
        .collect();
    assert_eq!(latest, ["protect:e5", "protect:e3b"]);
}

#[tokio::test]
async fn cursor_never_moves_backwards() {
    let controller = Controller::new(grafana_ok());
    let mut p = pipeline(Category::Access, &controller, Vec::new());

    controller.serve(json!({"data": [{"id": "late", "timestamp": 30}]}));
    p.poller.cycle_at(at(35)).await.unwrap();
    assert_eq!(p.poller.cursor().last_seen_timestamp, at(30));

    // Nothing new in the next windows
    for now in [40, 50, 60] {
        controller.serve(json!({"data": []}));
        p.poller.cycle_at(at(now)).await.unwrap();
        assert_eq!(p.poller.cursor().last_seen_timestamp, at(30));
    }
}

// ============================================================================
// Per-record and per-sink failures
// ============================================================================

#[tokio::test]
async fn malformed_record_among_five_valid() {
    let controller = Controller::new(grafana_ok());
    let sink = Arc::new(RecordingSink::new("recording"));
    let mut p = pipeline(Category::Access, &controller, vec![sink.clone() as Arc<dyn Sink>]);

    controller.serve(json!({"data": [
        {"id": "1", "timestamp": 1, "access_granted": true},
        {"id": "2", "timestamp": 2, "access_granted": true},
        {"timestamp": 3, "access_granted": false},
        {"id": "4", "timestamp": 4, "type": "doorbell"},
        {"id": "5", "timestamp": 5, "access_granted": false},
        {"id": "6", "timestamp": 6, "type": "held_open"},
    ]}));
    let report = p.poller.cycle_at(at(10)).await.unwrap();

    assert_eq!(report.emitted, 5);
    assert_eq!(report.malformed, 1);
    assert_eq!(sink.ids().len(), 5);
    let record = p.health.get(Category::Access).unwrap();
    assert_eq!(record.malformed_events, 1);
    assert_eq!(record.last_error, Some(ErrorKind::MalformedEvent));
}

#[tokio::test]
async fn four_valid_and_one_malformed_emit_four() {
    let controller = Controller::new(grafana_ok());
    let sink = Arc::new(RecordingSink::new("recording"));
    let mut p = pipeline(Category::Protect, &controller, vec![sink.clone() as Arc<dyn Sink>]);

    controller.serve(json!([
        {"id": "m1", "type": "motion", "start": 1_000},
        {"id": "m2", "type": "motion", "start": 2_000},
        {"id": "m3", "start": 3_000},
        {"id": "m4", "type": "ring", "start": 4_000},
        {"id": "m5", "type": "offline", "start": 5_000},
    ]));
    let report = p.poller.cycle_at(at(10)).await.unwrap();

    assert_eq!(report.emitted, 4);
    assert_eq!(report.malformed, 1);
    assert_eq!(
        sink.ids(),
        ["protect:m1", "protect:m2", "protect:m4", "protect:m5"]
    );
    assert_eq!(p.health.get(Category::Protect).unwrap().malformed_events, 1);
}

#[tokio::test]
async fn annotation_failure_still_counts_the_event() {
    let controller = Controller::new(Box::new(|_| {
        Ok(HttpResponse::new(500, "database is locked"))
    }));
    let grafana = GrafanaConfig {
        url: "http://grafana:3000".to_string(),
        api_key: Some(Secret::new("glsa_token")),
        org_id: 1,
    };
    let annotations = AnnotationSink::from_config(&grafana, controller.transport.clone()).unwrap();
    let metrics = Arc::new(MetricsSink::new(&prometheus::Registry::new()).unwrap());
    let sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(annotations), metrics.clone()];
    let mut p = pipeline(Category::Access, &controller, sinks);

    controller.serve(json!({"data": [
        {"id": "denied-1", "timestamp": 8, "access_granted": false, "door_name": "Lobby"},
    ]}));
    let report = p.poller.cycle_at(at(10)).await.unwrap();

    assert_eq!(report.emitted, 1);
    assert_eq!(report.sink_failures, 1);
    assert_eq!(metrics.event_count(Category::Access, "door.access_denied"), 1.0);
    assert_eq!(metrics.last_event_timestamp(Category::Access), 8.0);

    let record = p.health.get(Category::Access).unwrap();
    assert_eq!(record.sink_failures, 1);
    assert_eq!(record.last_error, Some(ErrorKind::SinkUnavailable));
    assert_eq!(record.consecutive_failures, 0);

    // The annotation was attempted exactly once and is not retried
    assert_eq!(controller.transport.requests_matching("/api/annotations").len(), 1);
    p.poller.cycle_at(at(20)).await.unwrap();
    assert_eq!(controller.transport.requests_matching("/api/annotations").len(), 1);
}
