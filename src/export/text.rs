use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::config::Settings;
use crate::ingest::retention::Pruner;
use crate::store::AlertStore;

/// Write every distinct source IP in `store` to `path`, one per line.
/// Returns the number of IPs written.
pub fn export_ips(store: &AlertStore, path: &Path) -> Result<usize> {
    let ips = store
        .distinct_source_ips()
        .context("reading distinct source ips")?;

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let file = File::create(path).with_context(|| format!("writing {}", path.display()))?;
    let mut out = BufWriter::new(file);
    for ip in &ips {
        writeln!(out, "{ip}")?;
    }
    out.flush().with_context(|| format!("flushing {}", path.display()))?;
    Ok(ips.len())
}

/// The text export job: prune the store to the retention window, then
/// export the surviving attacker IPs.
pub fn write_to_text(settings: &Settings) -> Result<usize> {
    if !settings.db_path.exists() {
        bail!("database not found at {}", settings.db_path.display());
    }
    let store = AlertStore::open(&settings.db_path).context("opening alert store")?;

    let pruner = Pruner::new(settings.retention_days);
    let deleted = pruner.prune(&store).context("pruning alert store")?;
    tracing::info!(
        deleted,
        days = pruner.retention_days(),
        "deleted alerts older than retention window"
    );

    let n = export_ips(&store, &settings.text_export_path)?;
    tracing::info!(
        count = n,
        path = %settings.text_export_path.display(),
        "exported unique ips"
    );
    Ok(n)
}
