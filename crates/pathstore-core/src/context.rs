//! The storage context: one explicit bundle of registry, cache, record store
//! and bulk store passed to every core operation.

use crate::bulk::{BulkArrayStore, BulkError};
use crate::cache::{CacheStats, TieredCache};
use crate::id::ObjectId;
use crate::identity::IdentityRegistry;
use crate::reconstruct::{self, LoadError};
use crate::serialize::flatten;
use crate::storable::{ObjectHandle, Storable, TypeRegistry};
use crate::store::{RecordStore, StoreError};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Default number of objects kept in the cache's fast tier.
pub const DEFAULT_CACHE_SIZE: usize = 100;

/// Default number of identities requested per record-store round trip.
pub const DEFAULT_BATCH_SIZE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    #[error("cannot save a {kind} without an identity")]
    Unassigned { kind: &'static str },
    #[error("bulk payload of {id} could not be written: {source}")]
    Bulk {
        id: ObjectId,
        #[source]
        source: BulkError,
    },
    #[error("record store error: {0}")]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

pub struct StorageContextBuilder {
    store: Arc<dyn RecordStore>,
    types: TypeRegistry,
    bulk: Option<Arc<BulkArrayStore>>,
    registry: Option<IdentityRegistry>,
    cache_size: usize,
    batch_size: usize,
}

impl StorageContextBuilder {
    pub fn with_bulk(mut self, bulk: Arc<BulkArrayStore>) -> Self {
        self.bulk = Some(bulk);
        self
    }

    pub fn with_registry(mut self, registry: IdentityRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_cache_size(mut self, cache_size: usize) -> Self {
        self.cache_size = cache_size;
        self
    }

    /// Zero is treated as one.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn build(self) -> StorageContext {
        StorageContext {
            registry: self.registry.unwrap_or_default(),
            types: self.types,
            cache: TieredCache::new(self.cache_size),
            store: self.store,
            bulk: self.bulk,
            batch_size: self.batch_size,
            load_lock: Mutex::new(()),
        }
    }
}

// ---------------------------------------------------------------------------
// StorageContext
// ---------------------------------------------------------------------------

/// Constructed once per simulation, shared by reference (or `Arc`) between
/// concurrent steps, and torn down with [`StorageContext::shutdown`].
pub struct StorageContext {
    registry: IdentityRegistry,
    types: TypeRegistry,
    cache: TieredCache<ObjectId, dyn Storable>,
    store: Arc<dyn RecordStore>,
    bulk: Option<Arc<BulkArrayStore>>,
    batch_size: usize,
    /// Serializes the construct-and-commit phase of loads.
    load_lock: Mutex<()>,
}

impl fmt::Debug for StorageContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageContext")
            .field("types", &self.types.len())
            .field("cache", &self.cache)
            .field("bulk", &self.bulk)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl StorageContext {
    pub fn builder(store: Arc<dyn RecordStore>, types: TypeRegistry) -> StorageContextBuilder {
        StorageContextBuilder {
            store,
            types,
            bulk: None,
            registry: None,
            cache_size: DEFAULT_CACHE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn cache(&self) -> &TieredCache<ObjectId, dyn Storable> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn bulk(&self) -> Option<&Arc<BulkArrayStore>> {
        self.bulk.as_ref()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub(crate) fn load_lock(&self) -> &Mutex<()> {
        &self.load_lock
    }

    /// Whether `id` already has a record in the store.
    pub fn is_persisted(&self, id: ObjectId) -> Result<bool, StoreError> {
        self.store.contains(id)
    }

    /// A fresh identity for a new object.
    pub fn allocate(&self) -> ObjectId {
        self.registry.allocate()
    }

    /// Publish a newly created object in the cache. If another instance
    /// already holds the identity, that instance wins and is returned.
    pub fn register(&self, object: ObjectHandle) -> Result<ObjectHandle, SaveError> {
        let id = object.identity();
        if !id.is_assigned() {
            return Err(SaveError::Unassigned {
                kind: object.kind(),
            });
        }
        Ok(self.cache.insert_if_absent(id, object))
    }

    pub fn get_cached(&self, id: ObjectId) -> Option<ObjectHandle> {
        self.cache.get(&id)
    }

    /// Load `roots` and their reference closure. See [`reconstruct::load`].
    pub fn load(
        &self,
        roots: impl IntoIterator<Item = ObjectId>,
    ) -> Result<BTreeMap<ObjectId, ObjectHandle>, LoadError> {
        reconstruct::load(self, roots)
    }

    pub fn load_one(&self, id: ObjectId) -> Result<ObjectHandle, LoadError> {
        self.load([id])?
            .remove(&id)
            .ok_or(LoadError::MissingRecord {
                id,
                referenced_by: None,
            })
    }

    /// Persist `root` and every object it references that has not been
    /// persisted yet. Bulk payloads are written before any record, and all
    /// records go to the store in one batch. Returns the number of records
    /// written.
    pub fn save(&self, root: &ObjectHandle) -> Result<usize, SaveError> {
        let pending = self.unsaved_closure(root)?;
        if pending.is_empty() {
            return Ok(0);
        }

        if let Some(bulk) = &self.bulk {
            for object in &pending {
                object
                    .persist_payload(bulk)
                    .map_err(|source| SaveError::Bulk {
                        id: object.identity(),
                        source,
                    })?;
            }
        }

        let records: HashMap<_, _> = pending
            .iter()
            .map(|object| (object.identity(), flatten(object.as_ref())))
            .collect();
        let written = records.len();
        self.store.put_records(records)?;

        for object in pending {
            self.cache.insert_if_absent(object.identity(), object);
        }
        info!(root = %root.identity(), records = written, "saved object graph");
        Ok(written)
    }

    /// Breadth-first walk of the objects reachable from `root`, stopping at
    /// anything already persisted.
    fn unsaved_closure(&self, root: &ObjectHandle) -> Result<Vec<ObjectHandle>, SaveError> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([Arc::clone(root)]);
        let mut pending = Vec::new();
        while let Some(object) = queue.pop_front() {
            let id = object.identity();
            if !id.is_assigned() {
                return Err(SaveError::Unassigned {
                    kind: object.kind(),
                });
            }
            if !seen.insert(id) || self.is_persisted(id)? {
                continue;
            }
            for field in object.to_fields().values() {
                field.for_each_object(&mut |child| queue.push_back(Arc::clone(child)));
            }
            pending.push(object);
        }
        debug!(root = %root.identity(), unsaved = pending.len(), "collected save closure");
        Ok(pending)
    }

    /// Tear down the context: log cache statistics and drop every cached
    /// object.
    pub fn shutdown(self) -> CacheStats {
        let stats = self.cache.stats();
        info!(
            hits = stats.hits,
            overflow_hits = stats.overflow_hits,
            misses = stats.misses,
            evictions = stats.evictions,
            "storage context shut down"
        );
        self.cache.clear();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::BulkArrayStore;
    use crate::snapshot::Snapshot;
    use crate::store::MemoryRecordStore;
    use crate::test_utils::*;
    use crate::value::{Field, Value};

    fn context(store: &Arc<MemoryRecordStore>) -> StorageContext {
        StorageContext::builder(Arc::clone(store) as Arc<dyn RecordStore>, test_types())
            .with_registry(IdentityRegistry::with_prefix(1))
            .build()
    }

    #[test]
    fn save_writes_closure_once() {
        let store = Arc::new(MemoryRecordStore::new());
        let ctx = context(&store);
        let c = dynamic(ctx.allocate(), [("n", Field::Int(3))]);
        let b = dynamic(ctx.allocate(), [("next", Field::Object(Arc::clone(&c)))]);
        let a = dynamic(ctx.allocate(), [("next", Field::Object(Arc::clone(&b)))]);

        assert_eq!(ctx.save(&a).unwrap(), 3);
        assert_eq!(store.len(), 3);
        assert!(ctx.is_persisted(c.identity()).unwrap());
        assert_eq!(ctx.save(&a).unwrap(), 0);

        let d = dynamic(ctx.allocate(), [("next", Field::Object(Arc::clone(&a)))]);
        assert_eq!(ctx.save(&d).unwrap(), 1);
    }

    #[test]
    fn records_from_an_earlier_context_count_as_persisted() {
        let store = Arc::new(MemoryRecordStore::new());
        let (a, b) = {
            let first = context(&store);
            let b = dynamic(first.allocate(), [("n", Field::Int(2))]);
            let a = dynamic(first.allocate(), [("next", Field::Object(Arc::clone(&b)))]);
            assert_eq!(first.save(&a).unwrap(), 2);
            (a, b)
        };

        let second = StorageContext::builder(Arc::clone(&store) as Arc<dyn RecordStore>, test_types())
            .with_registry(IdentityRegistry::with_prefix(2))
            .build();
        assert!(second.is_persisted(b.identity()).unwrap());
        assert!(!second.is_persisted(second.allocate()).unwrap());
        assert_eq!(second.save(&a).unwrap(), 0);

        let c = dynamic(second.allocate(), [("prev", Field::Object(Arc::clone(&a)))]);
        assert_eq!(second.save(&c).unwrap(), 1);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn saved_objects_load_as_same_instance() {
        let store = Arc::new(MemoryRecordStore::new());
        let ctx = context(&store);
        let a = dynamic(ctx.allocate(), [("n", Field::Int(1))]);
        ctx.save(&a).unwrap();
        let loaded = ctx.load_one(a.identity()).unwrap();
        assert!(Arc::ptr_eq(&loaded, &a));
        assert_eq!(store.read_count(a.identity()), 0);
    }

    #[test]
    fn saving_unassigned_object_fails() {
        let store = Arc::new(MemoryRecordStore::new());
        let ctx = context(&store);
        let orphan = dynamic(ObjectId::UNASSIGNED, []);
        let a = dynamic(ctx.allocate(), [("child", Field::Object(orphan))]);
        assert!(matches!(
            ctx.save(&a).unwrap_err(),
            SaveError::Unassigned { kind: DYNAMIC_KIND }
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn register_keeps_first_instance() {
        let store = Arc::new(MemoryRecordStore::new());
        let ctx = context(&store);
        let id = ctx.allocate();
        let first = dynamic(id, [("n", Field::Int(1))]);
        let second = dynamic(id, [("n", Field::Int(2))]);
        let a = ctx.register(Arc::clone(&first)).unwrap();
        let b = ctx.register(second).unwrap();
        assert!(Arc::ptr_eq(&a, &first));
        assert!(Arc::ptr_eq(&b, &first));
    }

    #[test]
    fn save_writes_bulk_payload_before_record() {
        let dir = tempfile::tempdir().unwrap();
        let bulk = Arc::new(BulkArrayStore::create(&dir.path().join("f.bulk"), 2).unwrap());
        let store = Arc::new(MemoryRecordStore::new());
        let ctx = StorageContext::builder(Arc::clone(&store) as Arc<dyn RecordStore>, test_types())
            .with_bulk(Arc::clone(&bulk))
            .build();

        let snap: ObjectHandle = Arc::new(Snapshot::new(ctx.registry(), sample_frame(2, 5)));
        ctx.save(&snap).unwrap();
        assert_eq!(bulk.len(), 1);
        let record = store
            .get_records(&[snap.identity()].into())
            .unwrap()
            .remove(&snap.identity())
            .unwrap();
        assert_eq!(record.get("frame"), Some(&Value::Slot(crate::id::SlotIndex(1))));
    }

    #[test]
    fn shutdown_reports_stats() {
        let store = Arc::new(MemoryRecordStore::new());
        let ctx = context(&store);
        let a = dynamic(ctx.allocate(), []);
        ctx.register(Arc::clone(&a)).unwrap();
        assert!(ctx.get_cached(a.identity()).is_some());
        assert!(ctx.get_cached(ObjectId::from_u128(999)).is_none());
        let stats = ctx.shutdown();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }
}
