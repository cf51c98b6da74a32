// src/ingest/retention.rs
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use metrics::counter;

use crate::store::{format_attack_time, AlertStore};

/// Deletes alerts that fell out of the retention window.
///
/// The cutoff is computed once per call, so one prune sees a stable snapshot
/// of "now" regardless of how many rows it touches.
#[derive(Debug, Clone, Copy)]
pub struct Pruner {
    retention_days: u32,
}

impl Pruner {
    pub fn new(retention_days: u32) -> Self {
        Self { retention_days }
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// Oldest `attack_time` that survives a prune run at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::days(i64::from(self.retention_days))
    }

    pub fn prune(&self, store: &AlertStore) -> Result<usize, rusqlite::Error> {
        self.prune_at(store, Utc::now())
    }

    pub fn prune_at(&self, store: &AlertStore, now: DateTime<Utc>) -> Result<usize, rusqlite::Error> {
        let cutoff = self.cutoff(now);
        let deleted = store.delete_older_than(&cutoff)?;
        counter!("retention_pruned_total").increment(deleted as u64);
        tracing::info!(
            target: "ingest",
            deleted,
            cutoff = %format_attack_time(&cutoff),
            "purged rows older than cutoff"
        );
        Ok(deleted)
    }
}
