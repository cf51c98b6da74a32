//! One-shot fetch job: prune the store, then scroll new alerts in.

use anyhow::{Context, Result};

use tibana::config::Settings;
use tibana::ingest::{self, backends};
use tibana::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    logging::init();

    let settings = Settings::load_default().context("loading settings")?;
    let backend = backends::from_settings(&settings)?;
    let report = ingest::fetch_and_write(&settings, backend.as_ref()).await?;
    tracing::info!(
        processed = report.processed,
        inserted = report.inserted,
        rejected = report.rejected_total(),
        "fetch finished"
    );
    Ok(())
}
