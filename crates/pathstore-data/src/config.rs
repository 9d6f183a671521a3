//! Store configuration schema.
//!
//! Every section is optional in the source file; missing values fall back to
//! the core defaults. Relative paths are resolved against the directory of
//! the configuration file by [`StoreConfig::resolve_paths`].

use pathstore_core::checkpoint::{Checkpointing, DEFAULT_CHECKPOINT_DIR};
use pathstore_core::context::{DEFAULT_BATCH_SIZE, DEFAULT_CACHE_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub records: RecordStoreConfig,
    #[serde(default)]
    pub bulk: Option<BulkConfig>,
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub checkpoints: CheckpointConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            records: RecordStoreConfig::default(),
            bulk: None,
            cache_size: DEFAULT_CACHE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            checkpoints: CheckpointConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStoreConfig {
    /// Records live only for the lifetime of the process.
    #[default]
    Memory,
    /// Append-only record log at `path`, created if missing.
    File { path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkConfig {
    pub path: PathBuf,
    /// Entities per frame. Required when the file is created; checked
    /// against the header when it already exists.
    pub entity_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_checkpoint_root")]
    pub root: PathBuf,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            root: default_checkpoint_root(),
        }
    }
}

fn default_cache_size() -> usize {
    DEFAULT_CACHE_SIZE
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_true() -> bool {
    true
}

fn default_checkpoint_root() -> PathBuf {
    PathBuf::from(DEFAULT_CHECKPOINT_DIR)
}

impl StoreConfig {
    /// Rewrite every relative path as `base.join(path)`.
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        if let RecordStoreConfig::File { path } = &mut self.records {
            resolve(path);
        }
        if let Some(bulk) = &mut self.bulk {
            resolve(&mut bulk.path);
        }
        resolve(&mut self.checkpoints.root);
    }

    pub fn checkpointing(&self) -> Checkpointing {
        if self.checkpoints.enabled {
            Checkpointing::new(self.checkpoints.root.clone())
        } else {
            Checkpointing::disabled()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_uses_defaults() {
        let config: StoreConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, StoreConfig::default());
        assert!(config.checkpointing().is_enabled());
    }

    #[test]
    fn file_store_in_each_format() {
        let ron_src = r#"(records: file(path: "records.log"), cache_size: 8)"#;
        let toml_src = "cache_size = 8\n[records.file]\npath = \"records.log\"\n";
        let json_src = r#"{"records": {"file": {"path": "records.log"}}, "cache_size": 8}"#;

        let expected = StoreConfig {
            records: RecordStoreConfig::File {
                path: PathBuf::from("records.log"),
            },
            cache_size: 8,
            ..StoreConfig::default()
        };
        assert_eq!(ron::from_str::<StoreConfig>(ron_src).unwrap(), expected);
        assert_eq!(toml::from_str::<StoreConfig>(toml_src).unwrap(), expected);
        assert_eq!(serde_json::from_str::<StoreConfig>(json_src).unwrap(), expected);
    }

    #[test]
    fn resolve_paths_leaves_absolute_paths() {
        let base = Path::new("/data/run");
        let absolute = std::env::temp_dir().join("bulk.bin");
        let mut config = StoreConfig {
            records: RecordStoreConfig::File {
                path: PathBuf::from("records.log"),
            },
            bulk: Some(BulkConfig {
                path: absolute.clone(),
                entity_count: 4,
            }),
            ..StoreConfig::default()
        };
        config.resolve_paths(base);
        assert_eq!(
            config.records,
            RecordStoreConfig::File {
                path: base.join("records.log")
            }
        );
        assert_eq!(config.bulk.unwrap().path, absolute);
        assert_eq!(config.checkpoints.root, base.join(DEFAULT_CHECKPOINT_DIR));
    }

    #[test]
    fn disabled_checkpoints() {
        let config: StoreConfig =
            serde_json::from_str(r#"{"checkpoints": {"enabled": false}}"#).unwrap();
        assert!(!config.checkpointing().is_enabled());
    }
}
