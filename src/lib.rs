// src/lib.rs
// Public library surface for the binaries and integration tests.

pub mod api;
pub mod config;
pub mod error;
pub mod export;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod store;

pub use crate::api::router;
pub use crate::config::Settings;
pub use crate::error::{BackendError, IngestError};
pub use crate::ingest::{fetch_and_write, IngestReport};
pub use crate::store::AlertStore;
