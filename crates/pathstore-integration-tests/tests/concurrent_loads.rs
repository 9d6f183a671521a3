//! Concurrent steps sharing one context must observe one instance per
//! identity.

mod common;

use pathstore_core::context::StorageContext;
use pathstore_core::identity::IdentityRegistry;
use pathstore_core::storable::{ObjectHandle, Storable, downcast};
use pathstore_core::store::{MemoryRecordStore, RecordStore};
use pathstore_core::test_utils::*;
use pathstore_core::value::Field;
use pathstore_sampling::SampleSet;
use std::sync::{Arc, Barrier};
use std::thread;

const THREADS: usize = 8;

#[test]
fn racing_loads_agree_on_instances() {
    common::init_tracing();
    let store = Arc::new(MemoryRecordStore::new());
    let root_id = {
        let ctx = StorageContext::builder(Arc::clone(&store) as Arc<dyn RecordStore>, test_types())
            .with_registry(IdentityRegistry::with_prefix(11))
            .build();
        let root = fan_in(ctx.registry(), 32);
        ctx.save(&root).unwrap();
        root.identity()
    };

    let ctx = StorageContext::builder(Arc::clone(&store) as Arc<dyn RecordStore>, test_types())
        .with_batch_size(4)
        .build();
    let barrier = Barrier::new(THREADS);
    let roots: Vec<ObjectHandle> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    ctx.load_one(root_id).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(roots.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));

    let root = downcast::<DynamicObject>(&roots[0]).unwrap();
    let Some(Field::List(leaves)) = root.field("leaves") else {
        panic!("fan-in root without leaves");
    };
    let bases: Vec<ObjectHandle> = leaves
        .iter()
        .map(|leaf| match leaf {
            Field::Object(handle) => dynamic_ref(handle, "base"),
            other => panic!("leaf is not an object: {other:?}"),
        })
        .collect();
    assert_eq!(bases.len(), 32);
    assert!(bases.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(ctx.registry().restored_count(), 34);
}

#[test]
fn racing_sampling_loads_share_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::file_config(dir.path());
    let set_id = {
        let ctx = pathstore_data::open_context(&config).unwrap();
        let run = common::run(&ctx, 4);
        let active: ObjectHandle = Arc::clone(run.steps[3].active()) as _;
        ctx.save(&active).unwrap();
        active.identity()
    };

    let ctx = pathstore_data::open_context(&config).unwrap();
    let sets: Vec<Arc<SampleSet>> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| s.spawn(|| downcast::<SampleSet>(&ctx.load_one(set_id).unwrap()).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(sets.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));

    // Frames are read concurrently too; the shared first snapshot is read
    // from disk once.
    let shared = Arc::clone(&sets[0].by_replica(0).unwrap().trajectory().snapshots()[0]);
    let frames: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..THREADS)
            .map(|_| s.spawn(|| shared.frame().unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(frames.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    assert_eq!(ctx.bulk().unwrap().disk_reads(), 1);
}
