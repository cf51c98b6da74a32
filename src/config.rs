// src/config.rs
//! Runtime settings: TOML file + environment overrides, validated once and
//! then passed around as an immutable value.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ingest::types::{KeepAlive, ScrollQuery, TypeFilter};

pub const ENV_CONFIG_PATH: &str = "TIBANA_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/tibana.toml";

/// Honeypot event families shipped by a stock T-Pot install.
pub const DEFAULT_TYPE_PATTERNS: [&str; 9] = [
    "cowrie.*",
    "dionaea.*",
    "heralding.*",
    "mailoney.*",
    "log4pot.*",
    "redishoneypot.*",
    "beelzebub.*",
    "ciscoasa.*",
    "citrixhoneypot.*",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Base URL of the search backend, e.g. `http://127.0.0.1:9200`.
    pub elastic_host: String,
    pub index_pattern: String,
    /// Retention horizon in days; also the ingest lookback window.
    pub retention_days: u32,
    pub batch_size: usize,
    /// Scroll keep-alive in backend notation (`2m`).
    pub scroll_keep_alive: String,
    pub type_field: String,
    pub type_patterns: Vec<String>,
    pub request_timeout_secs: u64,
    pub db_path: PathBuf,
    pub text_export_path: PathBuf,
    /// Serve documents from this JSON file instead of a live backend.
    pub fixture_path: Option<PathBuf>,
    pub bind: String,
    pub misp: MispSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MispSettings {
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub verify_ssl: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            elastic_host: String::new(),
            index_pattern: "logstash-*".into(),
            retention_days: 0,
            batch_size: 1000,
            scroll_keep_alive: "2m".into(),
            type_field: "eventid.keyword".into(),
            type_patterns: DEFAULT_TYPE_PATTERNS.iter().map(|s| s.to_string()).collect(),
            request_timeout_secs: 30,
            db_path: PathBuf::from("data/alerts.db"),
            text_export_path: PathBuf::from("data/attacker_ips.txt"),
            fixture_path: None,
            bind: "127.0.0.1:5000".into(),
            misp: MispSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings using env var + fallbacks, then apply env overrides:
    /// 1) $TIBANA_CONFIG_PATH
    /// 2) config/tibana.toml
    /// 3) built-in defaults
    pub fn load_default() -> Result<Self> {
        let file = match std::env::var(ENV_CONFIG_PATH) {
            Ok(p) => {
                let pb = PathBuf::from(p);
                if !pb.exists() {
                    bail!("{ENV_CONFIG_PATH} points to non-existent path {}", pb.display());
                }
                Some(pb)
            }
            Err(_) => Some(PathBuf::from(DEFAULT_CONFIG_PATH)).filter(|p| p.exists()),
        };
        Self::from_sources(file.as_deref(), |k| std::env::var(k).ok())
    }

    /// Build from an optional TOML file and an env lookup, then validate.
    pub fn from_sources<F>(file: Option<&Path>, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut s = match file {
            Some(p) => Self::from_toml_file(p)?,
            None => Self::default(),
        };
        s.apply_env(env)?;
        s.normalize();
        s.validate()?;
        Ok(s)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading settings from {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    fn apply_env<F>(&mut self, env: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| env(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("ELASTIC_HOST") {
            self.elastic_host = v;
        }
        if let Some(v) = get("ELASTIC_INDEX") {
            self.index_pattern = v;
        }
        if let Some(v) = get("RETENTION_DAYS") {
            self.retention_days = v
                .parse()
                .with_context(|| format!("RETENTION_DAYS must be a whole number of days, got {v:?}"))?;
        }
        if let Some(v) = get("BATCH_SIZE") {
            self.batch_size = v
                .parse()
                .with_context(|| format!("BATCH_SIZE must be a positive integer, got {v:?}"))?;
        }
        if let Some(v) = get("SCROLL_TIMEOUT") {
            self.scroll_keep_alive = v;
        }
        if let Some(v) = get("ELASTIC_TYPE_PATTERNS") {
            self.type_patterns = v.split(',').map(str::to_string).collect();
        }
        if let Some(v) = get("ELASTIC_FIXTURE_PATH") {
            self.fixture_path = Some(PathBuf::from(v));
        }
        if let Some(v) = get("ALERTS_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("ATTACKER_IPS_PATH") {
            self.text_export_path = PathBuf::from(v);
        }
        if let Some(v) = get("TIBANA_BIND") {
            self.bind = v;
        }
        if let Some(v) = get("MISP_URL") {
            self.misp.url = Some(v);
        }
        if let Some(v) = get("MISP_API_KEY") {
            self.misp.api_key = Some(v);
        }
        if let Some(v) = get("MISP_VERIFY_SSL") {
            self.misp.verify_ssl = parse_flag(&v);
        }
        Ok(())
    }

    fn normalize(&mut self) {
        self.elastic_host = self.elastic_host.trim().trim_end_matches('/').to_string();
        let mut patterns: Vec<String> = self
            .type_patterns
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect();
        patterns.dedup();
        self.type_patterns = patterns;
    }

    fn validate(&self) -> Result<()> {
        if self.elastic_host.is_empty() && self.fixture_path.is_none() {
            bail!("ELASTIC_HOST is not set");
        }
        if self.retention_days == 0 {
            bail!("RETENTION_DAYS must be set to a positive number of days");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }
        if self.type_patterns.is_empty() {
            bail!("at least one event type pattern is required");
        }
        self.keep_alive()?;
        Ok(())
    }

    pub fn keep_alive(&self) -> Result<KeepAlive> {
        self.scroll_keep_alive
            .parse()
            .map_err(|e| anyhow!("scroll_keep_alive: {e}"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Initial scroll request derived from these settings.
    pub fn scroll_query(&self) -> Result<ScrollQuery> {
        Ok(ScrollQuery {
            index: self.index_pattern.clone(),
            lookback_days: self.retention_days,
            filter: TypeFilter::new(self.type_field.clone(), self.type_patterns.clone())?,
            page_size: self.batch_size,
            keep_alive: self.keep_alive()?,
        })
    }
}

fn parse_flag(v: &str) -> bool {
    matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}
