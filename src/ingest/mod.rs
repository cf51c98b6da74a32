// src/ingest/mod.rs
pub mod backends;
pub mod normalize;
pub mod retention;
pub mod types;

use std::collections::BTreeMap;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use once_cell::sync::OnceCell;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::error::{BackendError, IngestError};
use crate::ingest::normalize::normalize;
use crate::ingest::retention::Pruner;
use crate::ingest::types::{Page, RawEvent, ScrollBackend, ScrollQuery};
use crate::store::AlertStore;

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!(
            "ingest_processed_total",
            "Raw events read from the search backend."
        );
        describe_counter!(
            "ingest_inserted_total",
            "Alerts that created a new row in the store."
        );
        describe_counter!(
            "ingest_rejected_total",
            "Raw events dropped by normalization, by reason."
        );
        describe_counter!("ingest_batches_total", "Committed page transactions.");
        describe_counter!("ingest_runs_total", "Ingest runs, by outcome.");
        describe_counter!(
            "retention_pruned_total",
            "Alerts deleted by the retention pruner."
        );
        describe_gauge!("ingest_last_run_ts", "Unix ts when an ingest run last finished.");
    });
}

/// Counters for one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    /// Raw events seen, whether or not they made it into the store.
    pub processed: u64,
    /// Rows actually created; duplicates of stored alerts do not count.
    pub inserted: u64,
    /// Pages committed to the store.
    pub batches: u64,
    /// Non-empty pages received from the backend.
    pub pages: u64,
    /// Normalization rejections keyed by reason.
    pub rejected: BTreeMap<&'static str, u64>,
}

impl IngestReport {
    pub fn rejected_total(&self) -> u64 {
        self.rejected.values().sum()
    }
}

enum Stop {
    Backend(BackendError),
    Storage(rusqlite::Error),
}

/// Scroll every page of `query` out of `backend` into `store`.
///
/// Each non-empty page is normalized and written in its own transaction, so
/// a failure mid-scroll leaves all earlier pages committed. Nothing is
/// retried; running the job again is safe because inserts are idempotent.
pub async fn ingest(
    backend: &dyn ScrollBackend,
    store: &AlertStore,
    query: &ScrollQuery,
) -> Result<IngestReport, IngestError> {
    ensure_metrics_described();
    connect(backend).await?;

    let mut report = IngestReport::default();
    let mut last_cursor: Option<String> = None;

    let stop = match backend.open(query).await {
        Err(e) => Some(Stop::Backend(e)),
        Ok(first) => {
            debug!(target: "ingest", hits = first.hits.len(), "got initial hits");
            scroll(backend, store, query, first, &mut report, &mut last_cursor).await
        }
    };

    if let Some(cursor) = last_cursor.as_deref() {
        if let Err(e) = backend.release(cursor).await {
            debug!(target: "ingest", error = %e, "scroll release failed");
        }
    }

    match stop {
        None => {
            info!(
                target: "ingest",
                processed = report.processed,
                inserted = report.inserted,
                rejected = report.rejected_total(),
                batches = report.batches,
                "all done"
            );
            Ok(report)
        }
        Some(Stop::Backend(source)) => {
            if source.is_expected() {
                error!(
                    target: "ingest",
                    processed = report.processed,
                    inserted = report.inserted,
                    error = %source,
                    "scroll error"
                );
            } else {
                error!(
                    target: "ingest",
                    report = ?report,
                    error = ?source,
                    backend = backend.name(),
                    index = %query.index,
                    "unexpected error during ingest"
                );
            }
            Err(IngestError::Backend { report, source })
        }
        Some(Stop::Storage(source)) => {
            error!(
                target: "ingest",
                report = ?report,
                error = ?source,
                "storage fault during ingest"
            );
            Err(IngestError::Storage { report, source })
        }
    }
}

/// Liveness probe. A `false` answer and a transport error are the same
/// fatal precondition.
async fn connect(backend: &dyn ScrollBackend) -> Result<(), IngestError> {
    let reason = match backend.ping().await {
        Ok(true) => {
            info!(target: "ingest", backend = backend.name(), "connected to search backend");
            return Ok(());
        }
        Ok(false) => "ping failed".to_string(),
        Err(e) => e.to_string(),
    };
    error!(target: "ingest", backend = backend.name(), %reason, "search backend connection failed");
    Err(IngestError::Unreachable {
        host: backend.name().to_string(),
        reason,
    })
}

/// Consume/advance until an empty page. Returns why it stopped early, if it did.
async fn scroll(
    backend: &dyn ScrollBackend,
    store: &AlertStore,
    query: &ScrollQuery,
    first: Page,
    report: &mut IngestReport,
    last_cursor: &mut Option<String>,
) -> Option<Stop> {
    let mut page = first;
    loop {
        if page.cursor.is_some() {
            last_cursor.clone_from(&page.cursor);
        }
        if page.is_empty() {
            return None;
        }

        report.pages += 1;
        if let Err(e) = commit_page(store, &page.hits, report) {
            return Some(Stop::Storage(e));
        }

        let Some(cursor) = page.cursor.take() else {
            warn!(target: "ingest", "page without continuation token; treating as last page");
            return None;
        };
        page = match backend.advance(&cursor, query.keep_alive).await {
            Ok(next) => next,
            Err(e) => return Some(Stop::Backend(e)),
        };
    }
}

fn commit_page(
    store: &AlertStore,
    hits: &[RawEvent],
    report: &mut IngestReport,
) -> Result<(), rusqlite::Error> {
    let mut records = Vec::with_capacity(hits.len());
    for raw in hits {
        report.processed += 1;
        match normalize(raw) {
            Ok(rec) => records.push(rec),
            Err(why) => {
                *report.rejected.entry(why.as_str()).or_default() += 1;
                counter!("ingest_rejected_total", "reason" => why.as_str()).increment(1);
            }
        }
    }

    let created = store.insert_batch(&records)? as u64;
    report.inserted += created;
    report.batches += 1;

    counter!("ingest_processed_total").increment(hits.len() as u64);
    counter!("ingest_inserted_total").increment(created);
    counter!("ingest_batches_total").increment(1);

    info!(
        target: "ingest",
        processed = report.processed,
        inserted = report.inserted,
        "batch done"
    );
    Ok(())
}

/// The whole fetch job: open the store, prune it, then scroll new alerts in.
///
/// The prune runs first and is fatal on failure, so nothing is ever ingested
/// into a store that could not be pruned.
pub async fn fetch_and_write(
    settings: &Settings,
    backend: &dyn ScrollBackend,
) -> Result<IngestReport, IngestError> {
    let store = AlertStore::open(&settings.db_path).map_err(|e| {
        error!(target: "ingest", path = %settings.db_path.display(), error = %e, "cannot open alert store");
        IngestError::Store(e)
    })?;
    run_with_store(settings, backend, &store).await
}

/// [`fetch_and_write`] against an already opened store.
pub async fn run_with_store(
    settings: &Settings,
    backend: &dyn ScrollBackend,
    store: &AlertStore,
) -> Result<IngestReport, IngestError> {
    ensure_metrics_described();

    let result = prune_then_ingest(settings, backend, store).await;

    let outcome = match &result {
        Ok(_) => "completed",
        Err(e) => e.outcome_label(),
    };
    counter!("ingest_runs_total", "outcome" => outcome).increment(1);
    gauge!("ingest_last_run_ts").set(chrono::Utc::now().timestamp() as f64);

    result
}

async fn prune_then_ingest(
    settings: &Settings,
    backend: &dyn ScrollBackend,
    store: &AlertStore,
) -> Result<IngestReport, IngestError> {
    Pruner::new(settings.retention_days)
        .prune(store)
        .map_err(|e| {
            error!(target: "ingest", error = %e, "retention prune failed; skipping ingest");
            IngestError::Prune(e)
        })?;

    let query = settings
        .scroll_query()
        .map_err(|e| IngestError::Config(e.to_string()))?;
    ingest(backend, store, &query).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::{KeepAlive, TypeFilter};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Replays a fixed list of page results and records every call.
    struct Scripted {
        alive: bool,
        pages: Mutex<Vec<Result<Page, BackendError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(alive: bool, mut pages: Vec<Result<Page, BackendError>>) -> Self {
            pages.reverse();
            Self {
                alive,
                pages: Mutex::new(pages),
                calls: Mutex::new(vec![]),
            }
        }

        fn next(&self, call: String) -> Result<Page, BackendError> {
            self.calls.lock().unwrap().push(call);
            self.pages.lock().unwrap().pop().unwrap_or_else(|| Ok(Page::default()))
        }
    }

    #[async_trait]
    impl ScrollBackend for Scripted {
        async fn ping(&self) -> Result<bool, BackendError> {
            Ok(self.alive)
        }
        async fn open(&self, _q: &ScrollQuery) -> Result<Page, BackendError> {
            self.next("open".into())
        }
        async fn advance(&self, cursor: &str, _ka: KeepAlive) -> Result<Page, BackendError> {
            self.next(format!("advance:{cursor}"))
        }
        async fn release(&self, cursor: &str) -> Result<(), BackendError> {
            self.calls.lock().unwrap().push(format!("release:{cursor}"));
            Ok(())
        }
        fn name(&self) -> &str {
            "scripted"
        }
    }

    fn query() -> ScrollQuery {
        ScrollQuery {
            index: "logstash-*".into(),
            lookback_days: 7,
            filter: TypeFilter::new("eventid.keyword", vec!["cowrie.*".into()]).unwrap(),
            page_size: 2,
            keep_alive: KeepAlive::default(),
        }
    }

    fn page(cursor: &str, hits: Vec<RawEvent>) -> Result<Page, BackendError> {
        Ok(Page {
            cursor: Some(cursor.into()),
            hits,
        })
    }

    fn ev(ip: &str) -> RawEvent {
        json!({ "eventid": "cowrie.session.connect", "src_ip": ip, "@timestamp": "2024-05-01T12:00:00Z" })
    }

    #[tokio::test]
    async fn dead_backend_aborts_before_any_query() {
        let backend = Scripted::new(false, vec![page("c1", vec![ev("1.1.1.1")])]);
        let store = AlertStore::open_in_memory().unwrap();
        let err = ingest(&backend, &store, &query()).await.unwrap_err();
        assert!(matches!(err, IngestError::Unreachable { .. }));
        assert!(backend.calls.lock().unwrap().is_empty());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[tokio::test]
    async fn follows_cursor_and_releases_last_one() {
        let backend = Scripted::new(
            true,
            vec![
                page("c1", vec![ev("1.1.1.1"), ev("1.1.1.2")]),
                page("c2", vec![ev("1.1.1.3")]),
                page("c3", vec![]),
            ],
        );
        let store = AlertStore::open_in_memory().unwrap();
        let report = ingest(&backend, &store, &query()).await.unwrap();
        assert_eq!(report.processed, 3);
        assert_eq!(report.inserted, 3);
        assert_eq!(report.batches, 2);
        assert_eq!(
            *backend.calls.lock().unwrap(),
            vec!["open", "advance:c1", "advance:c2", "release:c3"]
        );
    }

    #[tokio::test]
    async fn rejected_events_are_counted_not_inserted() {
        let backend = Scripted::new(
            true,
            vec![page(
                "c1",
                vec![
                    ev("1.1.1.1"),
                    json!({ "src_ip": "1.1.1.2", "@timestamp": "2024-05-01T12:00:00Z" }),
                    json!({ "eventid": "cowrie.x", "@timestamp": "2024-05-01T12:00:00Z" }),
                    json!({ "eventid": "cowrie.x", "src_ip": "1.1.1.4", "@timestamp": "not a date" }),
                ],
            )],
        );
        let store = AlertStore::open_in_memory().unwrap();
        let report = ingest(&backend, &store, &query()).await.unwrap();
        assert_eq!(report.processed, 4);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.rejected_total(), 3);
        assert_eq!(report.rejected.get("bad_timestamp"), Some(&1));
    }

    #[tokio::test]
    async fn malformed_response_is_unexpected() {
        let backend = Scripted::new(
            true,
            vec![
                page("c1", vec![ev("1.1.1.1")]),
                Err(BackendError::Malformed("hits missing".into())),
            ],
        );
        let store = AlertStore::open_in_memory().unwrap();
        let err = ingest(&backend, &store, &query()).await.unwrap_err();
        assert_eq!(err.outcome_label(), "unexpected");
        assert_eq!(err.partial_report().map(|r| r.inserted), Some(1));
        assert_eq!(store.count().unwrap(), 1);
    }
}
