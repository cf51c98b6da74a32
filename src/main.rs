//! Tibana HTTP service: alert list plus on-demand fetch and export jobs.

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use tibana::api::{self, AppState};
use tibana::config::Settings;
use tibana::ingest::backends;
use tibana::{logging, metrics::Metrics};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();
    logging::init();

    let settings = Settings::load_default().context("loading settings")?;
    let metrics = Metrics::init()?;
    let backend = backends::from_settings(&settings)?;

    let bind = settings.bind.clone();
    let app = api::router(AppState::new(settings, backend)).merge(metrics.router());

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {bind}"))?;
    tracing::info!(addr = %bind, "listening");
    axum::serve(listener, app).await.context("http server")?;
    Ok(())
}
