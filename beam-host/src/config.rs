//! Load host config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Host configuration. File: ~/.config/beam/config.toml or /etc/beam/config.toml.
/// Env overrides: BEAM_DOWNLOAD_DIR, BEAM_LOG, BEAM_E2EE, BEAM_CHUNK_SIZE.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    /// Where received files are written (default ./downloads).
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,
    /// tracing filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Protocol tuning, the `[transfer]` table.
    #[serde(default)]
    pub transfer: beam_core::Config,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            log_filter: default_log_filter(),
            transfer: beam_core::Config::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value {value:?} for {var}")]
    Env { var: &'static str, value: String },
    #[error(transparent)]
    Invalid(#[from] beam_core::ConfigError),
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Result<HostConfig, ConfigError> {
    load_from(&config_paths(), |var| std::env::var(var).ok())
}

/// Same as [`load`] with explicit search paths and environment lookup.
pub fn load_from(
    paths: &[PathBuf],
    env: impl Fn(&str) -> Option<String>,
) -> Result<HostConfig, ConfigError> {
    let mut c = match paths.iter().find(|p| p.exists()) {
        Some(p) => load_file(p)?,
        None => HostConfig::default(),
    };
    if let Some(s) = env("BEAM_DOWNLOAD_DIR") {
        c.download_dir = PathBuf::from(s);
    }
    if let Some(s) = env("BEAM_LOG") {
        c.log_filter = s;
    }
    if let Some(s) = env("BEAM_E2EE") {
        c.transfer.e2ee_enabled = match s.trim().to_ascii_lowercase().as_str() {
            "on" | "true" | "1" => true,
            "off" | "false" | "0" => false,
            _ => {
                return Err(ConfigError::Env {
                    var: "BEAM_E2EE",
                    value: s,
                })
            }
        };
    }
    if let Some(s) = env("BEAM_CHUNK_SIZE") {
        c.transfer.chunk_size = s.trim().parse().map_err(|_| ConfigError::Env {
            var: "BEAM_CHUNK_SIZE",
            value: s.clone(),
        })?;
    }
    c.transfer.validate()?;
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/beam/config.toml"));
    }
    out.push(PathBuf::from("/etc/beam/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<HostConfig, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
