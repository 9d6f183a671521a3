//! Reconstruction through a fresh context: dependency order, shared
//! references, and idempotent reloads.

mod common;

use pathstore_core::context::StorageContext;
use pathstore_core::id::ObjectId;
use pathstore_core::identity::IdentityRegistry;
use pathstore_core::reconstruct::LoadError;
use pathstore_core::serialize::SerializeError;
use pathstore_core::storable::{BuildContext, ObjectHandle, Storable, TypeRegistryBuilder};
use pathstore_core::store::{MemoryRecordStore, RecordStore};
use pathstore_core::test_utils::*;
use pathstore_core::value::{Field, Fields};
use std::sync::{Arc, Mutex};

// ===========================================================================
// Construction order
// ===========================================================================

const ORDERED_KIND: &str = "ordered";

static CONSTRUCTED: Mutex<Vec<String>> = Mutex::new(Vec::new());

fn ordered_constructor(
    id: ObjectId,
    fields: Fields,
    ctx: &BuildContext<'_>,
) -> Result<ObjectHandle, SerializeError> {
    if let Some(Field::Str(name)) = fields.get("name") {
        CONSTRUCTED.lock().unwrap().push(name.clone());
    }
    dynamic_constructor(id, fields, ctx)
}

#[test]
fn dependencies_are_built_first_and_identity_preserved() {
    common::init_tracing();
    let store = Arc::new(MemoryRecordStore::new());

    let writer_registry = IdentityRegistry::with_prefix(7);
    let c = dynamic(writer_registry.allocate(), [("name", Field::from("C"))]);
    let b = dynamic(
        writer_registry.allocate(),
        [("name", Field::from("B")), ("c", Field::Object(Arc::clone(&c)))],
    );
    let a = dynamic(
        writer_registry.allocate(),
        [("name", Field::from("A")), ("b", Field::Object(Arc::clone(&b)))],
    );
    let writer = StorageContext::builder(Arc::clone(&store) as Arc<dyn RecordStore>, test_types())
        .with_registry(writer_registry)
        .build();
    assert_eq!(writer.save(&a).unwrap(), 3);

    // The reader constructs every dynamic object through the recording
    // constructor.
    let mut builder = TypeRegistryBuilder::new();
    builder.register(DYNAMIC_KIND, ordered_constructor).unwrap();
    let reader = StorageContext::builder(Arc::clone(&store) as Arc<dyn RecordStore>, builder.build())
        .build();

    let loaded = reader.load_one(a.identity()).unwrap();
    assert_eq!(*CONSTRUCTED.lock().unwrap(), ["C", "B", "A"]);

    assert_eq!(loaded.identity(), a.identity());
    let loaded_b = dynamic_ref(&loaded, "b");
    let loaded_c = dynamic_ref(&loaded_b, "c");
    assert_eq!(loaded_b.identity(), b.identity());
    assert_eq!(loaded_c.identity(), c.identity());
    assert!(reader.registry().is_known(c.identity()));
    assert_eq!(reader.registry().restored_count(), 3);
}

// ===========================================================================
// Shared references and reloads
// ===========================================================================

fn saved_fan_in(width: usize) -> (Arc<MemoryRecordStore>, ObjectId) {
    let store = Arc::new(MemoryRecordStore::new());
    let ctx = StorageContext::builder(Arc::clone(&store) as Arc<dyn RecordStore>, test_types())
        .with_registry(IdentityRegistry::with_prefix(3))
        .build();
    let root = fan_in(ctx.registry(), width);
    assert_eq!(ctx.save(&root).unwrap(), width + 2);
    (store, root.identity())
}

fn reader(store: &Arc<MemoryRecordStore>, batch_size: usize) -> StorageContext {
    StorageContext::builder(Arc::clone(store) as Arc<dyn RecordStore>, test_types())
        .with_batch_size(batch_size)
        .with_cache_size(1_000)
        .build()
}

fn leaves(root: &ObjectHandle) -> Vec<ObjectHandle> {
    let object = pathstore_core::storable::downcast_ref::<DynamicObject>(root.as_ref()).unwrap();
    match object.field("leaves") {
        Some(Field::List(items)) => items
            .iter()
            .map(|item| match item {
                Field::Object(handle) => Arc::clone(handle),
                other => panic!("leaf is not an object: {other:?}"),
            })
            .collect(),
        other => panic!("missing leaves: {other:?}"),
    }
}

#[test]
fn shared_base_is_one_instance() {
    let (store, root_id) = saved_fan_in(12);
    let ctx = reader(&store, 5);
    let root = ctx.load_one(root_id).unwrap();

    let bases: Vec<ObjectHandle> = leaves(&root).iter().map(|l| dynamic_ref(l, "base")).collect();
    assert_eq!(bases.len(), 12);
    assert!(bases.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(store.read_count(bases[0].identity()), 1);
}

#[test]
fn second_load_reads_nothing() {
    let (store, root_id) = saved_fan_in(6);
    let ctx = reader(&store, 64);

    let first = ctx.load_one(root_id).unwrap();
    let batches = store.batch_count();
    let second = ctx.load_one(root_id).unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(store.batch_count(), batches);
    assert_eq!(store.read_count(root_id), 1);
}

#[test]
fn batch_size_bounds_round_trips() {
    let (store, root_id) = saved_fan_in(10);
    let ctx = reader(&store, 3);
    ctx.load_one(root_id).unwrap();
    // root, then 10 leaves in batches of 3, then the base.
    assert_eq!(store.batch_count(), 1 + 4 + 1);
}

#[test]
fn missing_record_names_referrer() {
    let (store, root_id) = saved_fan_in(2);
    let ctx = reader(&store, 64);
    let absent = ObjectId::from_u128(0xdead);
    match ctx.load([root_id, absent]) {
        Err(LoadError::MissingRecord { id, referenced_by }) => {
            assert_eq!(id, absent);
            assert_eq!(referenced_by, None);
        }
        other => panic!("expected missing record, got {other:?}"),
    }
    // Nothing from the failed call was committed.
    assert!(ctx.get_cached(root_id).is_none());
}
