//! Access application: door and reader events
//!
//! Classification looks at the event `type` first, then `access_granted`:
//!
//! | record                                   | type                  | severity |
//! |------------------------------------------|-----------------------|----------|
//! | `type` `door_forced_open` / `forced_open`| `door.forced_open`    | critical |
//! | `type` `door_held_open` / `held_open`    | `door.held_open`      | warning  |
//! | `type` `doorbell`                        | `door.doorbell`       | info     |
//! | `access_granted == false`                | `door.access_denied`  | warning  |
//! | `access_granted == true`                 | `door.access_granted` | info     |
//! | anything else                            | `door.unclassified`   | info     |

use super::{FetchWindow, Ingestor, RawEvent, fetch_pages, parse_time, str_field};
use crate::error::{MalformedEvent, Result};
use crate::upstream::UpstreamClient;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use vahti_core::{CanonicalEvent, Category, Severity};

const PAGE_LIMIT: usize = 200;

pub struct AccessIngestor;

#[async_trait]
impl Ingestor for AccessIngestor {
    fn category(&self) -> Category {
        Category::Access
    }

    async fn fetch(&self, client: &UpstreamClient, window: &FetchWindow) -> Result<Vec<RawEvent>> {
        let params = [
            ("sort", "timestamp".to_string()),
            ("since", window.start.timestamp().to_string()),
            ("until", window.end.timestamp().to_string()),
        ];
        let records = fetch_pages(
            client,
            Category::Access,
            "/events",
            &params,
            &["data"],
            PAGE_LIMIT,
        )
        .await?;

        Ok(records
            .into_iter()
            .filter(|record| !event_time(record).is_some_and(|ts| !window.contains(ts)))
            .map(|record| RawEvent::Access { record })
            .collect())
    }
}

pub fn event_time(record: &Value) -> Option<DateTime<Utc>> {
    record.get("timestamp").and_then(parse_time)
}

/// Type and severity from the table above
pub fn classify(raw_type: Option<&str>, access_granted: Option<bool>) -> (&'static str, Severity) {
    match raw_type {
        Some("door_forced_open" | "forced_open") => ("door.forced_open", Severity::Critical),
        Some("door_held_open" | "held_open") => ("door.held_open", Severity::Warning),
        Some("doorbell") => ("door.doorbell", Severity::Info),
        _ => match access_granted {
            Some(false) => ("door.access_denied", Severity::Warning),
            Some(true) => ("door.access_granted", Severity::Info),
            None => ("door.unclassified", Severity::Info),
        },
    }
}

pub fn normalize(record: &Value) -> std::result::Result<CanonicalEvent, MalformedEvent> {
    let malformed = |reason: &str| MalformedEvent::new(Category::Access, reason);

    let id = str_field(record, &["id"]).ok_or_else(|| malformed("missing id"))?;
    let timestamp = event_time(record).ok_or_else(|| malformed("missing or unparsable timestamp"))?;

    let raw_type = record.get("type").and_then(Value::as_str);
    let granted = record.get("access_granted").and_then(Value::as_bool);
    let (event_type, severity) = classify(raw_type, granted);

    let door = str_field(record, &["door_name"]).unwrap_or_else(|| "Unknown Door".to_string());
    let user = str_field(record, &["user_name"]);
    let who = user.as_deref().unwrap_or("unknown user");
    let message = match event_type {
        "door.forced_open" => format!("Door forced open at {door}"),
        "door.held_open" => format!("Door held open at {door}"),
        "door.doorbell" => format!("Doorbell at {door}"),
        "door.access_denied" => format!("Access denied for {who} at {door}"),
        "door.access_granted" => format!("Access granted to {who} at {door}"),
        _ => format!("Access {} at {door}", raw_type.unwrap_or("event")),
    };

    let mut payload = Map::new();
    payload.insert("door".into(), Value::String(door));
    if let Some(user) = user {
        payload.insert("user".into(), Value::String(user));
    }
    if let Some(granted) = granted {
        payload.insert("granted".into(), Value::Bool(granted));
    }
    if let Some(raw_type) = raw_type {
        payload.insert("upstream_type".into(), Value::String(raw_type.to_string()));
    }

    Ok(CanonicalEvent {
        id: CanonicalEvent::make_id(Category::Access, &id),
        category: Category::Access,
        event_type: event_type.to_string(),
        timestamp,
        site: str_field(record, &["site_id"]).unwrap_or_else(|| "default".to_string()),
        device: str_field(record, &["door_id"]),
        severity,
        message,
        payload,
    })
}
