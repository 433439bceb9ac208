//! Network application: client connections
//!
//! The integration API has no event feed, so connections are derived from the
//! per-site client lists. A client becomes one event per connection, keyed by
//! its MAC and connect time, which stays stable across polls.
//!
//! | record                            | type                  | severity |
//! |-----------------------------------|-----------------------|----------|
//! | `access.authorized == false`      | `client.auth_failed`  | warning  |
//! | `type` is `VPN` or `TELEPORT`     | `client.vpn_connected`| info     |
//! | otherwise                         | `client.connected`    | info     |

use super::{
    FetchWindow, Ingestor, RawEvent, epoch_secs, extract_items, fetch_pages, parse_time, str_field,
};
use crate::error::{MalformedEvent, Result};
use crate::upstream::UpstreamClient;
use crate::upstream::transport::Method;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::warn;
use vahti_core::{CanonicalEvent, Category, Severity};

const PAGE_LIMIT: usize = 200;

pub struct NetworkIngestor;

#[async_trait]
impl Ingestor for NetworkIngestor {
    fn category(&self) -> Category {
        Category::Network
    }

    async fn fetch(&self, client: &UpstreamClient, window: &FetchWindow) -> Result<Vec<RawEvent>> {
        let body = client
            .call(Category::Network, Method::Get, "/sites", &[])
            .await?;
        let sites = extract_items(body, &["data"])?;

        let mut raw = Vec::new();
        for site in sites {
            let Some(site_id) = str_field(&site, &["id", "name"]) else {
                warn!("Skipping site without id");
                continue;
            };
            let path = format!("/sites/{site_id}/clients");

            let records = fetch_pages(
                client,
                Category::Network,
                &path,
                &[],
                &["data"],
                PAGE_LIMIT,
            )
            .await?;

            for record in records {
                if event_time(&record).is_some_and(|ts| !window.contains(ts)) {
                    continue;
                }
                raw.push(RawEvent::Network {
                    site: site_id.clone(),
                    record,
                });
            }
        }
        Ok(raw)
    }
}

/// Connect time: `connectedAt` (RFC 3339) or `last_seen` (epoch seconds)
pub fn event_time(record: &Value) -> Option<DateTime<Utc>> {
    record
        .get("connectedAt")
        .and_then(parse_time)
        .or_else(|| record.get("last_seen").and_then(Value::as_i64).and_then(epoch_secs))
}

pub fn normalize(site: &str, record: &Value) -> std::result::Result<CanonicalEvent, MalformedEvent> {
    let malformed = |reason: &str| MalformedEvent::new(Category::Network, reason);

    let mac = str_field(record, &["macAddress", "mac"])
        .ok_or_else(|| malformed("missing macAddress"))?;
    let timestamp =
        event_time(record).ok_or_else(|| malformed("missing connectedAt/last_seen"))?;

    let authorized = record
        .get("access")
        .and_then(|a| a.get("authorized"))
        .and_then(Value::as_bool);
    let connection = record.get("type").and_then(Value::as_str).unwrap_or("");

    let (event_type, severity) = if authorized == Some(false) {
        ("client.auth_failed", Severity::Warning)
    } else if connection.eq_ignore_ascii_case("VPN") || connection.eq_ignore_ascii_case("TELEPORT") {
        ("client.vpn_connected", Severity::Info)
    } else {
        ("client.connected", Severity::Info)
    };

    let name = str_field(record, &["name", "hostname"]).unwrap_or_else(|| "Unknown".to_string());
    let message = match event_type {
        "client.auth_failed" => format!("Client {name} ({mac}) failed to authorize"),
        "client.vpn_connected" => format!("Client {name} ({mac}) connected over VPN"),
        _ => format!("Client {name} ({mac}) connected"),
    };

    let mut payload = Map::new();
    payload.insert("mac".into(), Value::String(mac.clone()));
    payload.insert("name".into(), Value::String(name));
    if let Some(ip) = str_field(record, &["ipAddress", "ip"]) {
        payload.insert("ip".into(), Value::String(ip));
    }
    if !connection.is_empty() {
        payload.insert("connection".into(), Value::String(connection.to_string()));
    }
    let device = str_field(record, &["uplinkDeviceId", "ap_mac"]);

    Ok(CanonicalEvent {
        id: CanonicalEvent::make_id(
            Category::Network,
            &format!("{mac}@{}", timestamp.timestamp()),
        ),
        category: Category::Network,
        event_type: event_type.to_string(),
        timestamp,
        site: site.to_string(),
        device,
        severity,
        message,
        payload,
    })
}
