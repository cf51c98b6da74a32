// tests/export.rs
//
// Downstream jobs: text IP list and MISP forwarding (against a mock sink).

use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};

use tibana::config::Settings;
use tibana::export::misp::{forward_alerts, MispEvent, ThreatIntelSink};
use tibana::export::text::{export_ips, write_to_text};
use tibana::store::{AlertRecord, AlertStore};

fn record(ip: &str, kind: &str, age: Duration) -> AlertRecord {
    AlertRecord {
        alert_type: kind.into(),
        src_ip: ip.into(),
        sensor: "hive-01".into(),
        attack_time: Utc::now() - age,
    }
}

fn settings_in(dir: &std::path::Path) -> Settings {
    let db = dir.join("alerts.db").display().to_string();
    let out = dir.join("out/attacker_ips.txt").display().to_string();
    Settings::from_sources(None, move |k| match k {
        "ELASTIC_HOST" => Some("http://es:9200".into()),
        "RETENTION_DAYS" => Some("7".into()),
        "ALERTS_DB_PATH" => Some(db.clone()),
        "ATTACKER_IPS_PATH" => Some(out.clone()),
        _ => None,
    })
    .unwrap()
}

#[test]
fn text_export_writes_distinct_ips_one_per_line() {
    let dir = tempfile::tempdir().unwrap();
    let store = AlertStore::open_in_memory().unwrap();
    store
        .insert_batch(&[
            record("10.0.0.1", "cowrie.login.failed", Duration::hours(1)),
            record("10.0.0.1", "cowrie.command.input", Duration::hours(2)),
            record("10.0.0.2", "dionaea.connection", Duration::hours(3)),
        ])
        .unwrap();

    let path = dir.path().join("nested/ips.txt");
    let n = export_ips(&store, &path).unwrap();
    assert_eq!(n, 2);

    let mut lines: Vec<String> = std::fs::read_to_string(&path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    lines.sort();
    assert_eq!(lines, vec!["10.0.0.1", "10.0.0.2"]);
}

#[test]
fn text_job_prunes_before_exporting() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_in(dir.path());
    {
        let store = AlertStore::open(&settings.db_path).unwrap();
        store
            .insert_batch(&[
                record("10.0.0.1", "cowrie.login.failed", Duration::hours(1)),
                record("10.9.9.9", "cowrie.login.failed", Duration::days(40)),
            ])
            .unwrap();
    }

    assert_eq!(write_to_text(&settings).unwrap(), 1);
    let body = std::fs::read_to_string(&settings.text_export_path).unwrap();
    assert_eq!(body, "10.0.0.1\n");
}

#[test]
fn text_job_without_database_fails() {
    let dir = tempfile::tempdir().unwrap();
    let settings = settings_in(dir.path());
    let err = write_to_text(&settings).unwrap_err();
    assert!(err.to_string().contains("database not found"));
    assert!(!settings.text_export_path.exists());
}

/// Records every event; fails for one chosen IP.
#[derive(Default)]
struct MockSink {
    fail_ip: Option<String>,
    sent: Mutex<Vec<MispEvent>>,
}

#[async_trait]
impl ThreatIntelSink for MockSink {
    async fn add_event(&self, event: &MispEvent) -> Result<String> {
        let ip = &event.attributes[0].value;
        if self.fail_ip.as_deref() == Some(ip.as_str()) {
            bail!("misp returned 500");
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(event.clone());
        Ok(sent.len().to_string())
    }
}

#[tokio::test]
async fn forwarding_sends_oldest_first_and_skips_failures() {
    let store = AlertStore::open_in_memory().unwrap();
    store
        .insert_batch(&[
            record("10.0.0.1", "cowrie.login.failed", Duration::hours(1)),
            record("10.0.0.2", "dionaea.connection", Duration::hours(5)),
            record("10.0.0.3", "heralding.auth", Duration::hours(3)),
        ])
        .unwrap();

    let sink = MockSink {
        fail_ip: Some("10.0.0.3".into()),
        ..Default::default()
    };
    let report = forward_alerts(&store, &sink).await.unwrap();
    assert_eq!(report.sent, 2);
    assert_eq!(report.failed, 1);

    let sent = sink.sent.lock().unwrap();
    assert_eq!(sent[0].attributes[0].value, "10.0.0.2");
    assert_eq!(sent[0].info, "TPOT alert — dionaea.connection");
    assert_eq!(sent[1].attributes[0].value, "10.0.0.1");
    assert!(sent[1].attributes[1].value.ends_with('Z'));
}

#[tokio::test]
async fn forwarding_empty_store_sends_nothing() {
    let store = AlertStore::open_in_memory().unwrap();
    let sink = MockSink::default();
    let report = forward_alerts(&store, &sink).await.unwrap();
    assert_eq!((report.sent, report.failed), (0, 0));
    assert!(sink.sent.lock().unwrap().is_empty());
}
