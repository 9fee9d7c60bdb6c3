//! Configuration loading from disk.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::config::schema::{ProxyConfig, VhostConfig};
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// A vhost-only file found in `vhost_dir`.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct VhostFile {
    #[serde(rename = "vhost")]
    vhosts: Vec<VhostConfig>,
}

/// Load and validate configuration from a TOML file.
///
/// A relative `vhost_dir` is resolved against the directory of `path`.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let mut config: ProxyConfig = read_toml(path)?;

    if let Some(dir) = config.vhost_dir.clone() {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        let dir = base.join(dir);
        config.vhosts.extend(load_vhost_dir(&dir)?);
    }

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Read every `*.toml` file in `dir` (sorted by name) as a vhost file.
pub fn load_vhost_dir(dir: &Path) -> Result<Vec<VhostConfig>, ConfigError> {
    let entries = fs::read_dir(dir).map_err(|source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "toml").unwrap_or(false))
        .collect();
    files.sort();

    let mut vhosts = Vec::new();
    for file in files {
        let parsed: VhostFile = read_toml(&file)?;
        tracing::debug!(file = %file.display(), count = parsed.vhosts.len(), "Loaded vhost file");
        vhosts.extend(parsed.vhosts);
    }
    Ok(vhosts)
}

fn read_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
