//! Protect application: cameras, sensors, doorbells
//!
//! | upstream `type`                                          | type                       | severity |
//! |----------------------------------------------------------|----------------------------|----------|
//! | `motion`                                                 | `motion.detected`          | info     |
//! | `smartDetectZone` / `smartDetectLine` / `smartAudioDetect` | `smart_detect.{first smart type}` | info |
//! | same, no smart types                                     | `smart_detect.unknown`     | info     |
//! | `ring`                                                   | `doorbell.ring`            | info     |
//! | `sensorAlarm`                                            | `sensor.alarm`             | warning  |
//! | `sensorWaterLeak`                                        | `sensor.water_leak`        | warning  |
//! | `sensorExtremeValues`                                    | `sensor.extreme_value`     | warning  |
//! | `sensorMotion`                                           | `sensor.motion`            | info     |
//! | `disconnect` / `offline`                                 | `camera.offline`           | critical |
//! | anything else                                            | `camera.{snake_case type}` | info     |

use super::{
    FetchWindow, Ingestor, MAX_PAGES, RawEvent, epoch_millis, extract_items, snake_case, str_field,
};
use crate::error::{MalformedEvent, Result};
use crate::upstream::UpstreamClient;
use crate::upstream::transport::Method;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tracing::warn;
use vahti_core::{CanonicalEvent, Category, Severity};

const PAGE_LIMIT: usize = 100;

pub struct ProtectIngestor;

#[async_trait]
impl Ingestor for ProtectIngestor {
    fn category(&self) -> Category {
        Category::Protect
    }

    /// Pages forward by `start` time, oldest first
    ///
    /// Each full page continues from its newest `start`. Records at that
    /// instant come back on the next page and are dropped by id.
    async fn fetch(&self, client: &UpstreamClient, window: &FetchWindow) -> Result<Vec<RawEvent>> {
        let end = window.end.timestamp_millis();
        let mut from = window.start.timestamp_millis();
        let mut seen = HashSet::new();
        let mut raw = Vec::new();

        for _ in 0..MAX_PAGES {
            let params = [
                ("start", from.to_string()),
                ("end", end.to_string()),
                ("limit", PAGE_LIMIT.to_string()),
                ("orderDirection", "ASC".to_string()),
            ];
            let body = client
                .call(Category::Protect, Method::Get, "/events", &params)
                .await?;
            let page = extract_items(body, &["events", "data"])?;
            let full = page.len() >= PAGE_LIMIT;
            let newest = page
                .iter()
                .filter_map(|r| r.get("start").and_then(Value::as_i64))
                .max();

            for record in page {
                if let Some(id) = str_field(&record, &["id"]) {
                    if !seen.insert(id) {
                        continue;
                    }
                }
                if event_time(&record).is_some_and(|ts| !window.contains(ts)) {
                    continue;
                }
                raw.push(RawEvent::Protect { record });
            }

            match newest {
                Some(newest) if full && newest > from => from = newest,
                Some(_) if full => {
                    warn!(start_ms = from, "Full page shares one start time, stopping here");
                    return Ok(raw);
                }
                _ => return Ok(raw),
            }
        }

        warn!(
            records = raw.len(),
            "Page cap reached, newer events deferred to the next cycle"
        );
        Ok(raw)
    }
}

/// `start` in epoch milliseconds
pub fn event_time(record: &Value) -> Option<DateTime<Utc>> {
    record
        .get("start")
        .and_then(Value::as_i64)
        .and_then(epoch_millis)
}

/// Type and severity from the table above
pub fn classify(raw_type: &str, smart_types: &[String]) -> (String, Severity) {
    match raw_type {
        "motion" => ("motion.detected".to_string(), Severity::Info),
        "smartDetectZone" | "smartDetectLine" | "smartAudioDetect" => {
            let kind = smart_types
                .first()
                .map(|t| snake_case(t))
                .unwrap_or_else(|| "unknown".to_string());
            (format!("smart_detect.{kind}"), Severity::Info)
        }
        "ring" => ("doorbell.ring".to_string(), Severity::Info),
        "sensorAlarm" => ("sensor.alarm".to_string(), Severity::Warning),
        "sensorWaterLeak" => ("sensor.water_leak".to_string(), Severity::Warning),
        "sensorExtremeValues" => ("sensor.extreme_value".to_string(), Severity::Warning),
        "sensorMotion" => ("sensor.motion".to_string(), Severity::Info),
        "disconnect" | "offline" => ("camera.offline".to_string(), Severity::Critical),
        other => (format!("camera.{}", snake_case(other)), Severity::Info),
    }
}

pub fn normalize(record: &Value) -> std::result::Result<CanonicalEvent, MalformedEvent> {
    let malformed = |reason: &str| MalformedEvent::new(Category::Protect, reason);

    let id = str_field(record, &["id"]).ok_or_else(|| malformed("missing id"))?;
    let timestamp = event_time(record).ok_or_else(|| malformed("missing or unparsable start"))?;
    let raw_type = record
        .get("type")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| malformed("missing type"))?;

    let smart_types: Vec<String> = record
        .get("smartDetectTypes")
        .and_then(Value::as_array)
        .map(|types| {
            types
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let (event_type, severity) = classify(raw_type, &smart_types);

    let camera = str_field(record, &["camera_name", "cameraName"])
        .unwrap_or_else(|| "Unknown Camera".to_string());
    let message = format!("Camera event: {event_type} on {camera}");

    let mut payload = Map::new();
    payload.insert("camera".into(), Value::String(camera));
    payload.insert("upstream_type".into(), Value::String(raw_type.to_string()));
    if let Some(score) = record.get("score").filter(|s| s.is_number()) {
        payload.insert("score".into(), score.clone());
    }
    let duration_ms = record
        .get("end")
        .and_then(Value::as_i64)
        .and_then(|end| end.checked_sub(timestamp.timestamp_millis()))
        .filter(|ms| *ms >= 0);
    if let Some(duration_ms) = duration_ms {
        payload.insert("duration_ms".into(), Value::from(duration_ms));
    }
    if !smart_types.is_empty() {
        payload.insert(
            "smart_detect_types".into(),
            Value::Array(smart_types.into_iter().map(Value::String).collect()),
        );
    }

    Ok(CanonicalEvent {
        id: CanonicalEvent::make_id(Category::Protect, &id),
        category: Category::Protect,
        event_type,
        timestamp,
        site: "default".to_string(),
        device: str_field(record, &["camera", "device"]),
        severity,
        message,
        payload,
    })
}
