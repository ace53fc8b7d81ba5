//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tandem_link::{LinkConfig, ServerConfig};
use tandem_store::StoreConfig;

/// CLI configuration. File: ~/.config/tandem/tandem.toml or ./tandem.toml.
/// Env overrides: TANDEM_SERVER_URL, TANDEM_BIND_ADDR, TANDEM_DATA_DIR,
/// TANDEM_STORE_NAME, TANDEM_RETRY_DELAY_MS.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Rendezvous server a participant connects to.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Address `serve` listens on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Directory holding local stores.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_store_name")]
    pub store_name: String,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_server_url() -> String {
    "ws://127.0.0.1:9000".to_string()
}
fn default_bind_addr() -> String {
    "127.0.0.1:9000".to_string()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from(".tandem")
}
fn default_store_name() -> String {
    "snippets".to_string()
}
fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            bind_addr: default_bind_addr(),
            data_dir: default_data_dir(),
            store_name: default_store_name(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Config {
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::named(self.data_dir.clone(), self.store_name.clone())
    }

    pub fn link_config(&self) -> LinkConfig {
        LinkConfig {
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            ..LinkConfig::default()
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.bind_addr.clone(),
        }
    }
}

/// Load config: default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file(&config_paths()).unwrap_or_default();
    apply_env(&mut c, |name| std::env::var(name).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("TANDEM_SERVER_URL") {
        c.server_url = s;
    }
    if let Some(s) = var("TANDEM_BIND_ADDR") {
        c.bind_addr = s;
    }
    if let Some(s) = var("TANDEM_DATA_DIR") {
        c.data_dir = PathBuf::from(s);
    }
    if let Some(s) = var("TANDEM_STORE_NAME") {
        c.store_name = s;
    }
    if let Some(s) = var("TANDEM_RETRY_DELAY_MS") {
        match s.parse::<u64>() {
            Ok(ms) => c.retry_delay_ms = ms,
            Err(_) => log::warn!("Ignoring TANDEM_RETRY_DELAY_MS={s}: not a number"),
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
        out.push(home.join(".config/tandem/tandem.toml"));
    }
    out.push(PathBuf::from("tandem.toml"));
    out
}

/// First existing file wins; an unreadable or invalid one falls back to defaults.
fn load_file(paths: &[PathBuf]) -> Option<Config> {
    let path = paths.iter().find(|p| p.exists())?;
    read(path)
}

fn read(path: &Path) -> Option<Config> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            log::warn!("Cannot read {}: {e}", path.display());
            return None;
        }
    };
    match toml::from_str::<Config>(&raw) {
        Ok(c) => {
            log::debug!("Loaded config from {}", path.display());
            Some(c)
        }
        Err(e) => {
            log::warn!("Invalid config {}: {e}", path.display());
            None
        }
    }
}
