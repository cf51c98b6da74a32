// src/error.rs
//! Error types shared by the search backends and the ingestion loop.

use thiserror::Error;

use crate::ingest::IngestReport;

/// Failure talking to the search backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Network-level failure (connect refused, timeout, reset).
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend answered with a non-success status.
    #[error("backend returned HTTP {status}: {body}")]
    Protocol { status: u16, body: String },

    /// The backend answered 2xx but the body is not what a scroll response looks like.
    #[error("malformed backend response: {0}")]
    Malformed(String),
}

impl BackendError {
    /// Transport and protocol faults are an expected way for a run to end.
    /// Anything else gets logged with full context.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Protocol { .. })
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Malformed(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Protocol {
                status: status.as_u16(),
                body: e.to_string(),
            }
        } else {
            Self::Transport(e.to_string())
        }
    }
}

/// Why an ingestion run stopped early.
///
/// Variants raised after the scroll was opened carry the partial report, so
/// callers can still log how much work was committed.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("search backend unreachable at {host}: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("retention prune failed: {0}")]
    Prune(#[source] rusqlite::Error),

    #[error("invalid ingest configuration: {0}")]
    Config(String),

    #[error("could not open alert store: {0}")]
    Store(#[source] rusqlite::Error),

    #[error("scroll aborted after {} processed / {} inserted: {source}", .report.processed, .report.inserted)]
    Backend {
        report: IngestReport,
        #[source]
        source: BackendError,
    },

    #[error("storage fault after {} processed / {} inserted: {source}", .report.processed, .report.inserted)]
    Storage {
        report: IngestReport,
        #[source]
        source: rusqlite::Error,
    },
}

impl IngestError {
    /// Work committed before the failure, if the scroll got that far.
    pub fn partial_report(&self) -> Option<&IngestReport> {
        match self {
            Self::Backend { report, .. } | Self::Storage { report, .. } => Some(report),
            _ => None,
        }
    }

    /// Stable label for the `ingest_runs_total{outcome}` series.
    pub fn outcome_label(&self) -> &'static str {
        match self {
            Self::Unreachable { .. } => "unreachable",
            Self::Config(_) => "config_error",
            Self::Prune(_) | Self::Store(_) => "store_error",
            Self::Backend { source, .. } if source.is_expected() => "scroll_error",
            Self::Backend { .. } => "unexpected",
            Self::Storage { .. } => "storage_error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_protocol_are_expected() {
        assert!(BackendError::Transport("reset".into()).is_expected());
        assert!(BackendError::Protocol {
            status: 500,
            body: "boom".into()
        }
        .is_expected());
        assert!(!BackendError::Malformed("no hits".into()).is_expected());
    }

    #[test]
    fn partial_report_only_after_scroll_opened() {
        let e = IngestError::Unreachable {
            host: "http://es:9200".into(),
            reason: "ping failed".into(),
        };
        assert!(e.partial_report().is_none());
        assert_eq!(e.outcome_label(), "unreachable");

        let e = IngestError::Backend {
            report: IngestReport {
                processed: 10,
                inserted: 7,
                ..Default::default()
            },
            source: BackendError::Malformed("x".into()),
        };
        assert_eq!(e.partial_report().map(|r| r.inserted), Some(7));
        assert_eq!(e.outcome_label(), "unexpected");
    }
}
