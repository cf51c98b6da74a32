use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::{MispSettings, Settings};
use crate::ingest::normalize::parse_timestamp;
use crate::store::{AlertStore, StoredAlert};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MispAttribute {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    pub comment: String,
}

impl MispAttribute {
    fn new(kind: &str, value: &str, comment: &str) -> Self {
        Self {
            kind: kind.to_string(),
            value: value.to_string(),
            comment: comment.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MispEvent {
    pub info: String,
    #[serde(rename = "Attribute")]
    pub attributes: Vec<MispAttribute>,
}

/// Build the MISP event for one stored alert.
pub fn build_event(alert: &StoredAlert) -> Result<MispEvent> {
    let ts = parse_timestamp(&alert.attack_time)
        .ok_or_else(|| anyhow!("unparseable attack_time {:?}", alert.attack_time))?;
    let ts_zulu = ts.format("%Y-%m-%dT%H:%M:%SZ").to_string();

    let label = if alert.alert_type.is_empty() {
        "unknown"
    } else {
        alert.alert_type.as_str()
    };

    let mut attributes = vec![
        MispAttribute::new("ip-src", &alert.src_ip, "Attacker IP"),
        MispAttribute::new("datetime", &ts_zulu, "Attack time"),
    ];
    if !alert.alert_type.is_empty() {
        attributes.push(MispAttribute::new("text", &alert.alert_type, "Alert type"));
    }
    if !alert.sensor.is_empty() {
        attributes.push(MispAttribute::new("text", &alert.sensor, "Sensor"));
    }

    Ok(MispEvent {
        info: format!("TPOT alert — {label}"),
        attributes,
    })
}

/// Destination for threat-intel events.
#[async_trait]
pub trait ThreatIntelSink: Send + Sync {
    /// Create one event; returns the id the platform assigned.
    async fn add_event(&self, event: &MispEvent) -> Result<String>;
}

pub struct MispClient {
    base: String,
    api_key: String,
    client: Client,
}

impl MispClient {
    pub fn new(url: &str, api_key: &str, verify_ssl: bool) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(!verify_ssl)
            .build()
            .context("building misp http client")?;
        Ok(Self {
            base: url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            client,
        })
    }

    pub fn from_settings(cfg: &MispSettings) -> Result<Self> {
        let url = cfg.url.as_deref().ok_or_else(|| anyhow!("MISP_URL is not set"))?;
        let key = cfg
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("MISP_API_KEY is not set"))?;
        Self::new(url, key, cfg.verify_ssl)
    }
}

#[async_trait]
impl ThreatIntelSink for MispClient {
    async fn add_event(&self, event: &MispEvent) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/events/add", self.base))
            .header("Authorization", &self.api_key)
            .header("Accept", "application/json")
            .json(&json!({ "Event": event }))
            .send()
            .await
            .context("misp post")?
            .error_for_status()
            .context("misp non-2xx")?;
        let body: Value = resp.json().await.context("misp response json")?;
        event_id(&body).ok_or_else(|| anyhow!("unexpected misp response: {body}"))
    }
}

fn event_id(body: &Value) -> Option<String> {
    match body.pointer("/Event/id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ForwardReport {
    pub sent: usize,
    pub failed: usize,
}

/// Send one event per distinct stored alert, oldest first. A failed row is
/// logged and skipped; it does not stop the rest.
pub async fn forward_alerts(store: &AlertStore, sink: &dyn ThreatIntelSink) -> Result<ForwardReport> {
    let rows = store.list_for_forwarding().context("reading alerts")?;
    let mut report = ForwardReport::default();
    if rows.is_empty() {
        tracing::info!("No alerts to send");
        return Ok(report);
    }

    for alert in &rows {
        let sent = match build_event(alert) {
            Ok(ev) => sink.add_event(&ev).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(id) => {
                report.sent += 1;
                tracing::info!(ip = %alert.src_ip, event_id = %id, "sent to misp");
            }
            Err(e) => {
                report.failed += 1;
                tracing::error!(ip = %alert.src_ip, error = %e, "error sending to misp");
            }
        }
    }
    Ok(report)
}

/// The MISP forwarding job.
pub async fn write_to_misp(settings: &Settings) -> Result<ForwardReport> {
    if !settings.db_path.exists() {
        bail!("database not found at {}", settings.db_path.display());
    }
    let client = MispClient::from_settings(&settings.misp)?;
    tracing::info!(url = %client.base, "misp client initialized");
    let store = AlertStore::open(&settings.db_path).context("opening alert store")?;
    forward_alerts(&store, &client).await
}
