// src/ingest/types.rs
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use once_cell::sync::OnceCell;
use regex::Regex;
use serde_json::{json, Value};

use crate::error::BackendError;

/// One `_source` document as returned by the search backend.
pub type RawEvent = Value;

/// One page of a scroll.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Continuation token for the next page. Backends may rotate it per page.
    pub cursor: Option<String>,
    pub hits: Vec<RawEvent>,
}

impl Page {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Scroll keep-alive, written the way Elasticsearch expects (`2m`, `30s`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAlive(Duration);

impl KeepAlive {
    pub fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Default for KeepAlive {
    fn default() -> Self {
        Self::from_secs(120)
    }
}

impl fmt::Display for KeepAlive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0.as_millis();
        if ms % 3_600_000 == 0 {
            write!(f, "{}h", ms / 3_600_000)
        } else if ms % 60_000 == 0 {
            write!(f, "{}m", ms / 60_000)
        } else if ms % 1_000 == 0 {
            write!(f, "{}s", ms / 1_000)
        } else {
            write!(f, "{ms}ms")
        }
    }
}

impl FromStr for KeepAlive {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        static RE: OnceCell<Regex> = OnceCell::new();
        let re = RE.get_or_init(|| {
            Regex::new(r"^\s*(\d+)\s*(ms|s|m|h|d)\s*$").expect("static keep-alive regex")
        });
        let caps = re
            .captures(s)
            .ok_or_else(|| anyhow::anyhow!("invalid keep-alive {s:?} (expected e.g. 2m, 30s)"))?;
        let n: u64 = caps[1].parse()?;
        let factor: u64 = match &caps[2] {
            "ms" => 1,
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            _ => 86_400_000,
        };
        let ms = n
            .checked_mul(factor)
            .ok_or_else(|| anyhow::anyhow!("keep-alive {s:?} out of range"))?;
        if ms == 0 {
            anyhow::bail!("keep-alive must be positive");
        }
        Ok(Self(Duration::from_millis(ms)))
    }
}

/// Match-any wildcard filter on the event type field.
///
/// `*` matches any run of characters and `?` a single one, as in the
/// backend's `wildcard` query. The backend evaluates the filter itself;
/// [`matches`](Self::matches) is the same rule applied client-side.
#[derive(Debug, Clone)]
pub struct TypeFilter {
    field: String,
    patterns: Vec<String>,
    compiled: Vec<Regex>,
}

impl TypeFilter {
    pub fn new(field: impl Into<String>, patterns: Vec<String>) -> anyhow::Result<Self> {
        let compiled = patterns
            .iter()
            .map(|p| wildcard_to_regex(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            field: field.into(),
            patterns,
            compiled,
        })
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    /// True when `value` satisfies at least one pattern.
    pub fn matches(&self, value: &str) -> bool {
        self.compiled.iter().any(|re| re.is_match(value))
    }

    /// Document field the filter reads, with any `.keyword` sub-field stripped.
    pub fn source_field(&self) -> &str {
        self.field.strip_suffix(".keyword").unwrap_or(&self.field)
    }

    fn should_clauses(&self) -> Vec<Value> {
        self.patterns
            .iter()
            .map(|p| json!({ "wildcard": { self.field.as_str(): p } }))
            .collect()
    }
}

fn wildcard_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re)
}

/// Everything the initial scroll request needs.
#[derive(Debug, Clone)]
pub struct ScrollQuery {
    pub index: String,
    pub lookback_days: u32,
    pub filter: TypeFilter,
    pub page_size: usize,
    pub keep_alive: KeepAlive,
}

impl ScrollQuery {
    /// Search body: newest first, inside the lookback window, and matching at
    /// least one type pattern.
    pub fn to_body(&self) -> Value {
        json!({
            "sort": [{ "@timestamp": { "order": "desc" } }],
            "query": {
                "bool": {
                    "must": [
                        { "range": { "@timestamp": { "gte": format!("now-{}d", self.lookback_days) } } }
                    ],
                    "should": self.filter.should_clauses(),
                    "minimum_should_match": 1
                }
            }
        })
    }
}

/// Narrow view of a search backend that supports server-side cursors.
#[async_trait::async_trait]
pub trait ScrollBackend: Send + Sync {
    /// Liveness probe. `Ok(false)` and `Err(_)` both mean "do not ingest".
    async fn ping(&self) -> Result<bool, BackendError>;

    /// Run the query and open a cursor; returns the first page.
    async fn open(&self, query: &ScrollQuery) -> Result<Page, BackendError>;

    /// Fetch the page after `cursor`. An empty page means the scroll is exhausted.
    async fn advance(&self, cursor: &str, keep_alive: KeepAlive) -> Result<Page, BackendError>;

    /// Free server-side cursor state. Best effort.
    async fn release(&self, _cursor: &str) -> Result<(), BackendError> {
        Ok(())
    }

    /// Host/label for log lines.
    fn name(&self) -> &str;
}
