//! Forward every distinct stored alert to MISP as one event.

use anyhow::{Context, Result};

use tibana::config::Settings;
use tibana::export::misp;
use tibana::logging;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    logging::init();

    let settings = Settings::load_default().context("loading settings")?;
    let report = misp::write_to_misp(&settings).await?;
    tracing::info!(sent = report.sent, failed = report.failed, "misp export finished");
    Ok(())
}
