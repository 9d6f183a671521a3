//! Turn a [`StoreConfig`] into a ready [`StorageContext`].

use crate::config::{BulkConfig, RecordStoreConfig, StoreConfig};
use crate::loader::ConfigError;
use pathstore_core::bulk::BulkArrayStore;
use pathstore_core::context::StorageContext;
use pathstore_core::storable::TypeRegistry;
use pathstore_core::store::{FileRecordStore, MemoryRecordStore, RecordStore};
use std::sync::Arc;
use tracing::info;

/// Open a context that knows every sampling kind.
pub fn open_context(config: &StoreConfig) -> Result<StorageContext, ConfigError> {
    open_context_with_types(config, pathstore_sampling::type_registry()?)
}

pub fn open_context_with_types(
    config: &StoreConfig,
    types: TypeRegistry,
) -> Result<StorageContext, ConfigError> {
    if config.cache_size == 0 {
        return Err(ConfigError::Invalid("cache_size must be at least 1".to_string()));
    }

    let store: Arc<dyn RecordStore> = match &config.records {
        RecordStoreConfig::Memory => Arc::new(MemoryRecordStore::new()),
        RecordStoreConfig::File { path } => Arc::new(FileRecordStore::open(path)?),
    };
    let mut builder = StorageContext::builder(store, types)
        .with_cache_size(config.cache_size)
        .with_batch_size(config.batch_size);
    if let Some(bulk) = &config.bulk {
        builder = builder.with_bulk(Arc::new(open_bulk(bulk)?));
    }

    info!(
        records = ?config.records,
        bulk = config.bulk.is_some(),
        cache_size = config.cache_size,
        batch_size = config.batch_size,
        "opened storage context"
    );
    Ok(builder.build())
}

fn open_bulk(config: &BulkConfig) -> Result<BulkArrayStore, ConfigError> {
    if !config.path.exists() {
        return Ok(BulkArrayStore::create(&config.path, config.entity_count)?);
    }
    let store = BulkArrayStore::open(&config.path)?;
    if store.entity_count() != config.entity_count {
        return Err(ConfigError::Invalid(format!(
            "{} holds {} entities per frame, configured {}",
            config.path.display(),
            store.entity_count(),
            config.entity_count
        )));
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pathstore_core::snapshot::Snapshot;
    use pathstore_core::storable::{ObjectHandle, Storable};
    use pathstore_sampling::Trajectory;
    use std::path::PathBuf;

    fn frame() -> pathstore_core::bulk::Frame {
        pathstore_core::bulk::Frame::new(vec![[0.0, 1.0, 2.0]; 2], vec![[0.5; 3]; 2], -1.0, 0.5)
            .unwrap()
    }

    #[test]
    fn memory_context_defaults() {
        let ctx = open_context(&StoreConfig::default()).unwrap();
        assert!(ctx.bulk().is_none());
        assert!(ctx.types().contains(pathstore_sampling::trajectory::TRAJECTORY_KIND));
    }

    #[test]
    fn zero_cache_rejected() {
        let config = StoreConfig {
            cache_size: 0,
            ..StoreConfig::default()
        };
        assert!(matches!(open_context(&config), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn file_context_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            records: RecordStoreConfig::File {
                path: dir.path().join("records.log"),
            },
            bulk: Some(BulkConfig {
                path: dir.path().join("frames.bin"),
                entity_count: 2,
            }),
            ..StoreConfig::default()
        };

        let traj_id = {
            let ctx = open_context(&config).unwrap();
            let snap = Arc::new(Snapshot::new(ctx.registry(), frame()));
            let traj: ObjectHandle = Arc::new(Trajectory::new(ctx.registry(), vec![snap]));
            ctx.save(&traj).unwrap();
            traj.identity()
        };

        let ctx = open_context(&config).unwrap();
        let loaded = ctx.load_one(traj_id).unwrap();
        let traj = pathstore_core::storable::downcast::<Trajectory>(&loaded).unwrap();
        assert_eq!(traj.len(), 1);
        assert_eq!(traj.snapshots()[0].frame().unwrap().total_energy(), -0.5);
    }

    #[test]
    fn bulk_entity_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("frames.bin");
        BulkArrayStore::create(&path, 3).unwrap();
        let config = StoreConfig {
            bulk: Some(BulkConfig {
                path,
                entity_count: 5,
            }),
            ..StoreConfig::default()
        };
        assert!(matches!(open_context(&config), Err(ConfigError::Invalid(_))));
    }
}
