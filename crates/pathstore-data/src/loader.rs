//! Configuration file loading.
//!
//! Provides format detection (RON/JSON/TOML), config discovery in a
//! directory, and the deserialization helper behind [`load_config`].

use crate::config::StoreConfig;
use pathstore_core::bulk::BulkError;
use pathstore_core::storable::RegistryError;
use pathstore_core::store::StoreError;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Base name searched for by [`find_config`].
pub const CONFIG_BASE_NAME: &str = "pathstore";

// ===========================================================================
// Errors
// ===========================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file has an extension we don't support.
    #[error("unsupported format for file: {file}")]
    UnsupportedFormat { file: PathBuf },

    /// Two config files with different formats exist side by side.
    #[error("conflicting formats: {a} and {b}")]
    ConflictingFormats { a: PathBuf, b: PathBuf },

    #[error("parse error in {file}: {detail}")]
    Parse { file: PathBuf, detail: String },

    /// The values parsed but cannot be used together.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record store error: {0}")]
    Store(#[from] StoreError),

    #[error("bulk store error: {0}")]
    Bulk(#[from] BulkError),

    #[error("type registry error: {0}")]
    Registry(#[from] RegistryError),
}

// ===========================================================================
// Format detection
// ===========================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Ron,
    Toml,
    Json,
}

/// Detect the format of a file based on its extension.
pub fn detect_format(path: &Path) -> Result<Format, ConfigError> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("ron") => Ok(Format::Ron),
        Some("toml") => Ok(Format::Toml),
        Some("json") => Ok(Format::Json),
        _ => Err(ConfigError::UnsupportedFormat {
            file: path.to_path_buf(),
        }),
    }
}

// ===========================================================================
// Discovery
// ===========================================================================

/// Look for `pathstore.{ron,toml,json}` in `dir`. More than one match is an
/// error.
pub fn find_config(dir: &Path) -> Result<Option<PathBuf>, ConfigError> {
    let mut found: Option<PathBuf> = None;
    for ext in ["ron", "toml", "json"] {
        let candidate = dir.join(format!("{CONFIG_BASE_NAME}.{ext}"));
        if candidate.exists() {
            if let Some(existing) = found {
                return Err(ConfigError::ConflictingFormats {
                    a: existing,
                    b: candidate,
                });
            }
            found = Some(candidate);
        }
    }
    Ok(found)
}

// ===========================================================================
// Deserialization
// ===========================================================================

/// Parse `content` as `format`. `file` only labels errors.
pub fn parse_str<T: DeserializeOwned>(
    content: &str,
    format: Format,
    file: &Path,
) -> Result<T, ConfigError> {
    let parse_err = |detail: String| ConfigError::Parse {
        file: file.to_path_buf(),
        detail,
    };
    match format {
        Format::Ron => ron::from_str(content).map_err(|e| parse_err(e.to_string())),
        Format::Json => serde_json::from_str(content).map_err(|e| parse_err(e.to_string())),
        Format::Toml => toml::from_str(content).map_err(|e| parse_err(e.to_string())),
    }
}

/// Read a file and deserialize it according to its extension.
pub fn deserialize_file<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_str(&content, format, path)
}

/// Load a [`StoreConfig`] and resolve its relative paths against the
/// file's directory.
pub fn load_config(path: &Path) -> Result<StoreConfig, ConfigError> {
    let mut config: StoreConfig = deserialize_file(path)?;
    if let Some(base) = path.parent() {
        config.resolve_paths(base);
    }
    debug!(path = %path.display(), ?config, "loaded store config");
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
