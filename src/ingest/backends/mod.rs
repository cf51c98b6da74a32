// src/ingest/backends/mod.rs
pub mod elastic;
pub mod fixture;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Settings;
use crate::ingest::backends::{elastic::ElasticBackend, fixture::FixtureBackend};
use crate::ingest::types::ScrollBackend;

/// Pick the backend the settings ask for: the JSON fixture when
/// `fixture_path` is set, the Elasticsearch scroll client otherwise.
pub fn from_settings(settings: &Settings) -> Result<Arc<dyn ScrollBackend>> {
    if let Some(path) = &settings.fixture_path {
        tracing::info!(path = %path.display(), "using fixture search backend");
        return Ok(Arc::new(FixtureBackend::from_path(path)?));
    }
    let backend = ElasticBackend::new(&settings.elastic_host, settings.request_timeout())
        .context("building elasticsearch client")?;
    Ok(Arc::new(backend))
}
