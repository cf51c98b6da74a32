use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;

use crate::error::BackendError;
use crate::ingest::normalize::parse_timestamp;
use crate::ingest::types::{KeepAlive, Page, RawEvent, ScrollBackend, ScrollQuery};

/// In-process backend serving documents from a JSON fixture.
///
/// Applies the same window, type filter and sort order the real backend
/// would, then hands the result out in scroll pages. Used for offline runs
/// (`ELASTIC_FIXTURE_PATH`) and tests.
pub struct FixtureBackend {
    docs: Vec<RawEvent>,
    now: Option<DateTime<Utc>>,
    alive: AtomicBool,
    next_scroll: AtomicU64,
    scrolls: Mutex<HashMap<String, Scroll>>,
}

struct Scroll {
    docs: Vec<RawEvent>,
    page_size: usize,
}

impl FixtureBackend {
    pub fn from_documents(docs: Vec<RawEvent>) -> Self {
        Self {
            docs,
            now: None,
            alive: AtomicBool::new(true),
            next_scroll: AtomicU64::new(1),
            scrolls: Mutex::new(HashMap::new()),
        }
    }

    /// Accepts either a plain array of `_source` documents or a saved search
    /// response (`{"hits":{"hits":[{"_source":..}]}}`).
    pub fn from_json_str(s: &str) -> Result<Self> {
        let v: Value = serde_json::from_str(s).context("parsing fixture json")?;
        let docs = match v {
            Value::Array(items) => items,
            Value::Object(_) => v
                .pointer("/hits/hits")
                .and_then(Value::as_array)
                .ok_or_else(|| anyhow!("fixture object has no hits.hits array"))?
                .iter()
                .map(|h| h.get("_source").cloned().unwrap_or(Value::Null))
                .collect(),
            _ => return Err(anyhow!("fixture must be an array or a search response")),
        };
        Ok(Self::from_documents(docs))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("reading fixture from {}", path.display()))?;
        Self::from_json_str(&s)
    }

    /// Pin the clock the lookback window is measured from.
    pub fn with_now(mut self, now: DateTime<Utc>) -> Self {
        self.now = Some(now);
        self
    }

    /// Make the liveness probe fail.
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// Scroll contexts not yet released.
    pub fn open_scrolls(&self) -> usize {
        self.scrolls.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn select(&self, query: &ScrollQuery) -> Vec<RawEvent> {
        let now = self.now.unwrap_or_else(Utc::now);
        let since = now - ChronoDuration::days(i64::from(query.lookback_days));

        let mut hits: Vec<(DateTime<Utc>, RawEvent)> = self
            .docs
            .iter()
            .filter(|d| {
                lookup(d, query.filter.source_field())
                    .and_then(Value::as_str)
                    .is_some_and(|t| query.filter.matches(t))
            })
            .filter_map(|d| {
                let ts = d.get("@timestamp").and_then(Value::as_str).and_then(parse_timestamp)?;
                (ts >= since).then(|| (ts, d.clone()))
            })
            .collect();
        // newest first; stable so equal timestamps keep fixture order
        hits.sort_by(|a, b| b.0.cmp(&a.0));
        hits.into_iter().map(|(_, d)| d).collect()
    }

    fn page_at(&self, id: &str, offset: usize) -> Result<Page, BackendError> {
        let scrolls = self
            .scrolls
            .lock()
            .map_err(|_| BackendError::Malformed("fixture scroll table poisoned".into()))?;
        let scroll = scrolls.get(id).ok_or_else(|| BackendError::Protocol {
            status: 404,
            body: format!("No search context found for id [{id}]"),
        })?;
        let end = (offset + scroll.page_size).min(scroll.docs.len());
        let hits = scroll.docs.get(offset..end).map(<[_]>::to_vec).unwrap_or_default();
        Ok(Page {
            cursor: Some(format!("{id}:{end}")),
            hits,
        })
    }
}

/// Dotted-path lookup (`event.kind` -> `{"event":{"kind":..}}`), falling back
/// to a literal key containing dots.
fn lookup<'a>(doc: &'a Value, field: &str) -> Option<&'a Value> {
    if let Some(v) = doc.get(field) {
        return Some(v);
    }
    field.split('.').try_fold(doc, |cur, key| cur.get(key))
}

#[async_trait]
impl ScrollBackend for FixtureBackend {
    async fn ping(&self) -> Result<bool, BackendError> {
        Ok(self.alive.load(Ordering::SeqCst))
    }

    async fn open(&self, query: &ScrollQuery) -> Result<Page, BackendError> {
        let docs = self.select(query);
        let id = format!("fixture-{}", self.next_scroll.fetch_add(1, Ordering::SeqCst));
        self.scrolls
            .lock()
            .map_err(|_| BackendError::Malformed("fixture scroll table poisoned".into()))?
            .insert(
                id.clone(),
                Scroll {
                    docs,
                    page_size: query.page_size.max(1),
                },
            );
        self.page_at(&id, 0)
    }

    async fn advance(&self, cursor: &str, _keep_alive: KeepAlive) -> Result<Page, BackendError> {
        let (id, offset) = cursor
            .rsplit_once(':')
            .and_then(|(id, off)| Some((id, off.parse::<usize>().ok()?)))
            .ok_or_else(|| BackendError::Protocol {
                status: 400,
                body: format!("invalid scroll id [{cursor}]"),
            })?;
        self.page_at(id, offset)
    }

    async fn release(&self, cursor: &str) -> Result<(), BackendError> {
        let id = cursor.rsplit_once(':').map_or(cursor, |(id, _)| id);
        if let Ok(mut scrolls) = self.scrolls.lock() {
            scrolls.remove(id);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "fixture"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::types::TypeFilter;
    use chrono::TimeZone;
    use serde_json::json;

    fn query(page_size: usize) -> ScrollQuery {
        ScrollQuery {
            index: "logstash-*".into(),
            lookback_days: 1,
            filter: TypeFilter::new("eventid.keyword", vec!["cowrie.*".into(), "dionaea.*".into()])
                .unwrap(),
            page_size,
            keep_alive: KeepAlive::default(),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn filters_window_and_sorts_desc() {
        let backend = FixtureBackend::from_documents(vec![
            json!({ "eventid": "cowrie.a", "@timestamp": "2024-05-01T10:00:00Z" }),
            json!({ "eventid": "suricata.alert", "@timestamp": "2024-05-01T11:00:00Z" }),
            json!({ "eventid": "dionaea.b", "@timestamp": "2024-05-01T12:00:00Z" }),
            json!({ "eventid": "cowrie.old", "@timestamp": "2024-04-01T12:00:00Z" }),
            json!({ "@timestamp": "2024-05-01T12:00:00Z" }),
        ])
        .with_now(now());

        let first = backend.open(&query(10)).await.unwrap();
        let types: Vec<_> = first.hits.iter().map(|h| h["eventid"].as_str().unwrap()).collect();
        assert_eq!(types, vec!["dionaea.b", "cowrie.a"]);

        let next = backend
            .advance(first.cursor.as_deref().unwrap(), KeepAlive::default())
            .await
            .unwrap();
        assert!(next.is_empty());
    }

    #[tokio::test]
    async fn pages_then_release() {
        let docs = (0..5)
            .map(|i| json!({ "eventid": "cowrie.x", "@timestamp": format!("2024-05-01T10:00:0{i}Z") }))
            .collect();
        let backend = FixtureBackend::from_documents(docs).with_now(now());
        let mut page = backend.open(&query(2)).await.unwrap();
        let mut sizes = vec![];
        loop {
            sizes.push(page.hits.len());
            if page.is_empty() {
                break;
            }
            page = backend
                .advance(page.cursor.as_deref().unwrap(), KeepAlive::default())
                .await
                .unwrap();
        }
        assert_eq!(sizes, vec![2, 2, 1, 0]);
        assert_eq!(backend.open_scrolls(), 1);
        backend.release(page.cursor.as_deref().unwrap()).await.unwrap();
        assert_eq!(backend.open_scrolls(), 0);
    }

    #[tokio::test]
    async fn unknown_scroll_is_protocol_error() {
        let backend = FixtureBackend::from_documents(vec![]);
        let err = backend.advance("fixture-99:0", KeepAlive::default()).await.unwrap_err();
        assert!(matches!(err, BackendError::Protocol { status: 404, .. }));
    }

    #[test]
    fn saved_search_response_is_accepted() {
        let s = r#"{"hits":{"hits":[{"_source":{"eventid":"cowrie.a"}},{"_id":"x"}]}}"#;
        let b = FixtureBackend::from_json_str(s).unwrap();
        assert_eq!(b.docs.len(), 2);
        assert!(FixtureBackend::from_json_str("42").is_err());
    }
}
