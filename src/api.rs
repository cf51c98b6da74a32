use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use tokio::runtime::Handle;
use tower_http::cors::CorsLayer;

use crate::config::Settings;
use crate::export::{misp, text};
use crate::ingest::{self, types::ScrollBackend};
use crate::store::{AlertStore, StoredAlert};

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub backend: Arc<dyn ScrollBackend>,
    /// Overrides the MISP client built from `settings.misp`.
    pub sink: Option<Arc<dyn misp::ThreatIntelSink>>,
}

impl AppState {
    pub fn new(settings: Settings, backend: Arc<dyn ScrollBackend>) -> Self {
        Self {
            settings: Arc::new(settings),
            backend,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn misp::ThreatIntelSink>) -> Self {
        self.sink = Some(sink);
        self
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/alerts", get(list_alerts))
        .route("/run_fetch", post(run_fetch))
        .route("/run_text", post(run_text))
        .route("/run_misp", post(run_misp))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct RunStatus {
    pub status: &'static str,
    pub message: String,
}

type RunResponse = (StatusCode, Json<RunStatus>);

fn ok(message: String) -> RunResponse {
    (
        StatusCode::OK,
        Json(RunStatus {
            status: "ok",
            message,
        }),
    )
}

fn failed(job: &str, err: impl std::fmt::Display) -> RunResponse {
    tracing::error!(job, error = %err, "job failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(RunStatus {
            status: "error",
            message: format!("{job} failed: {err}"),
        }),
    )
}

async fn list_alerts(
    State(state): State<AppState>,
) -> Result<Json<Vec<StoredAlert>>, (StatusCode, String)> {
    let path = state.settings.db_path.clone();
    let rows = tokio::task::spawn_blocking(move || {
        AlertStore::open(&path).and_then(|store| store.list_recent())
    })
    .await
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
    .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    Ok(Json(rows))
}

async fn run_fetch(State(state): State<AppState>) -> RunResponse {
    let settings = state.settings.clone();
    let backend = state.backend.clone();
    let res = blocking(move |rt| {
        rt.block_on(ingest::fetch_and_write(&settings, backend.as_ref()))
    })
    .await;
    match res {
        Ok(Ok(r)) => ok(format!(
            "fetched {} alerts, inserted {} new",
            r.processed, r.inserted
        )),
        Ok(Err(e)) => failed("fetch", e),
        Err(e) => failed("fetch", e),
    }
}

async fn run_text(State(state): State<AppState>) -> RunResponse {
    let settings = state.settings.clone();
    let res = tokio::task::spawn_blocking(move || text::write_to_text(&settings)).await;
    match res {
        Ok(Ok(n)) => ok(format!(
            "wrote {n} ips to {}",
            state.settings.text_export_path.display()
        )),
        Ok(Err(e)) => failed("text export", format!("{e:#}")),
        Err(e) => failed("text export", e),
    }
}

async fn run_misp(State(state): State<AppState>) -> RunResponse {
    let settings = state.settings.clone();
    let sink = state.sink.clone();
    let res = blocking(move |rt| match sink {
        Some(sink) => rt.block_on(forward_with(&settings, sink.as_ref())),
        None => rt.block_on(misp::write_to_misp(&settings)),
    })
    .await;
    match res {
        Ok(Ok(r)) => ok(format!("sent {} events to misp, {} failed", r.sent, r.failed)),
        Ok(Err(e)) => failed("misp export", format!("{e:#}")),
        Err(e) => failed("misp export", e),
    }
}

async fn forward_with(
    settings: &Settings,
    sink: &dyn misp::ThreatIntelSink,
) -> anyhow::Result<misp::ForwardReport> {
    let store = AlertStore::open(&settings.db_path)?;
    misp::forward_alerts(&store, sink).await
}

/// Run a job that mixes store I/O with backend calls on the blocking pool,
/// driving its async parts through the current runtime handle.
async fn blocking<T, F>(job: F) -> Result<T, tokio::task::JoinError>
where
    F: FnOnce(&Handle) -> T + Send + 'static,
    T: Send + 'static,
{
    let rt = Handle::current();
    tokio::task::spawn_blocking(move || job(&rt)).await
}
