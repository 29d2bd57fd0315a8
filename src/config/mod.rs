//! Configuration: TOML file with `${ENV}` expansion, struct defaults, and
//! the documented environment-variable overrides applied last.

pub mod http_client;
pub mod probe;
pub mod server;
pub mod traffic;

pub use http_client::HttpClientConfig;
pub use probe::ProbeConfig;
pub use server::ServerConfig;
pub use traffic::TrafficConfig;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use tracing::info;

/// Top-level configuration for the proxy process.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub http_client: HttpClientConfig,
    #[serde(default)]
    pub traffic: TrafficConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scraper: ScraperConfig,
    /// Mirrors inserted on first boot when the store is empty.
    #[serde(default)]
    pub seed_mirrors: Vec<SeedMirror>,
}

/// Where the embedded store lives.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data".to_string(),
        }
    }
}

/// Third-party mirror-list feed. Scraping stays off until a URL is set.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ScraperConfig {
    pub source_url: Option<String>,
}

/// A mirror definition for first-boot seeding.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SeedMirror {
    pub prefix: String,
    pub upstream_url: String,
    pub upstream_host: Option<String>,
    #[serde(default)]
    pub auth: crate::mirror::MirrorAuth,
}

impl Config {
    /// Load configuration from a TOML file with environment variable
    /// expansion, then apply the environment overrides.
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        let expanded = expand_env_vars(&content);
        let mut config: Config = toml::from_str(&expanded)?;
        config.apply_env_overrides();
        config.validate()?;
        info!("Configuration loaded from {:?}", path.as_ref());
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Documented overrides: `LISTEN_ADDR`, `DATA_DIR`, `PROBE_INTERVAL`,
    /// `PROBE_TIMEOUT`. Durations accept a trailing `s` (`3600s`).
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = env::var("LISTEN_ADDR") {
            self.server.listen_addr = normalize_listen_addr(&addr);
        }
        if let Ok(dir) = env::var("DATA_DIR") {
            self.storage.data_dir = dir;
        }
        if let Some(secs) = env::var("PROBE_INTERVAL").ok().and_then(|v| parse_secs(&v)) {
            self.probe.interval_secs = secs;
        }
        if let Some(secs) = env::var("PROBE_TIMEOUT").ok().and_then(|v| parse_secs(&v)) {
            self.probe.timeout_secs = secs;
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.probe.validate()?;
        self.traffic.validate()?;
        if self.storage.data_dir.is_empty() {
            anyhow::bail!("storage.data_dir cannot be empty");
        }
        for seed in &self.seed_mirrors {
            if seed.prefix.is_empty() || seed.prefix.contains('/') {
                anyhow::bail!(
                    "seed mirror prefix '{}' is not a single path segment",
                    seed.prefix
                );
            }
            if !seed.upstream_url.starts_with("http") {
                anyhow::bail!("seed mirror URL '{}' must be absolute", seed.upstream_url);
            }
        }
        Ok(())
    }
}

/// Replace `${VAR}` references with environment values; unset variables
/// are left verbatim so validation can complain about them.
fn expand_env_vars(content: &str) -> String {
    let mut result = String::with_capacity(content.len());
    let mut rest = content;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        match rest[start..].find('}') {
            Some(end) => {
                let var = &rest[start + 2..start + end];
                match env::var(var) {
                    Ok(value) => result.push_str(&value),
                    Err(_) => result.push_str(&rest[start..start + end + 1]),
                }
                rest = &rest[start + end + 1..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

/// `":8000"` means "all interfaces, port 8000".
fn normalize_listen_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else {
        addr.to_string()
    }
}

/// Parse `"3600"` or `"3600s"` into seconds.
fn parse_secs(value: &str) -> Option<u64> {
    value.trim().trim_end_matches('s').parse().ok()
}
