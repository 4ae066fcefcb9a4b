//! Gateway configuration.
//!
//! Settings are layered: built-in defaults, then an optional TOML file, then
//! `TETHER_`-prefixed environment variables (double underscore separates
//! nesting, e.g. `TETHER_SERVER__LISTEN_ADDR`).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    pub store: StoreConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP/WebSocket server binds.
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:4700".to_string(),
        }
    }
}

/// Agent-runtime subprocess settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Path to the runtime binary.
    pub binary: PathBuf,
    /// Arguments passed to the runtime.
    pub args: Vec<String>,
    /// Working directory for the runtime. Created if missing.
    pub workdir: PathBuf,
    /// Extra environment variables for the runtime.
    pub env: HashMap<String, String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp"));
        Self {
            binary: PathBuf::from("codex"),
            args: vec!["app-server".to_string()],
            workdir: home.join("projects"),
            env: HashMap::new(),
        }
    }
}

/// Event store settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite event log.
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            db_path: data_dir.join("tether").join("events.db"),
        }
    }
}

impl Settings {
    /// Load settings from defaults, an optional TOML file, and environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("TETHER")
                .separator("__")
                .try_parsing(true),
        );
        let cfg = builder.build().context("loading configuration")?;
        cfg.try_deserialize().context("parsing configuration")
    }
}
