//! Prune the store and write the distinct attacker IPs to a text file.

use anyhow::{Context, Result};

use tibana::config::Settings;
use tibana::export::text;
use tibana::logging;

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    logging::init();

    let settings = Settings::load_default().context("loading settings")?;
    text::write_to_text(&settings)?;
    Ok(())
}
