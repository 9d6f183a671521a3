//! Helpers shared by the integration test binaries.

#![allow(dead_code)]

use pathstore_core::bulk::Frame;
use pathstore_core::context::StorageContext;
use pathstore_core::snapshot::Snapshot;
use pathstore_core::test_utils::sample_frame;
use pathstore_data::{BulkConfig, RecordStoreConfig, StoreConfig};
use pathstore_sampling::{Ensemble, MonteCarloStep, MoveChange, Sample, SampleSet, Trajectory};
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

pub const ENTITIES: usize = 4;

/// Route `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// File-backed records and bulk frames under `dir`, checkpoints in
/// `dir/checkpoints`.
pub fn file_config(dir: &Path) -> StoreConfig {
    let mut config = StoreConfig {
        records: RecordStoreConfig::File {
            path: "records.log".into(),
        },
        bulk: Some(BulkConfig {
            path: "frames.bin".into(),
            entity_count: ENTITIES,
        }),
        ..StoreConfig::default()
    };
    config.checkpoints.root = "checkpoints".into();
    config.resolve_paths(dir);
    config
}

pub fn frame(seed: u64) -> Frame {
    sample_frame(ENTITIES, seed)
}

pub fn trajectory(ctx: &StorageContext, seeds: &[u64]) -> Arc<Trajectory> {
    let snapshots = seeds
        .iter()
        .map(|&s| Arc::new(Snapshot::new(ctx.registry(), frame(s))))
        .collect();
    Arc::new(Trajectory::new(ctx.registry(), snapshots))
}

/// A run of `steps` accepted one-replica moves. Every trial trajectory
/// reuses the first snapshot of the previous one, the way a shooting move
/// shares frames with its parent path.
pub struct Run {
    pub ensemble: Arc<Ensemble>,
    pub initial: Arc<SampleSet>,
    pub steps: Vec<Arc<MonteCarloStep>>,
}

pub fn run(ctx: &StorageContext, steps: u64) -> Run {
    let registry = ctx.registry();
    let ensemble = Arc::new(Ensemble::new(registry, "len2to3", 2, Some(3)));
    let first = trajectory(ctx, &[0, 1]);
    let sample = Arc::new(Sample::new(registry, 0, first, Arc::clone(&ensemble)));
    let initial = Arc::new(SampleSet::new(registry, vec![sample]).unwrap());

    let simulation = registry.allocate();
    let mut active = Arc::clone(&initial);
    let mut out = Vec::new();
    for step in 1..=steps {
        let previous = active.by_replica(0).unwrap();
        let shared = Arc::clone(&previous.trajectory().snapshots()[0]);
        let fresh = Arc::new(Snapshot::new(registry, frame(step + 10)));
        let traj = Arc::new(Trajectory::new(registry, vec![shared, fresh]));
        let trial = Arc::new(
            Sample::new(registry, 0, traj, Arc::clone(&ensemble)).with_parent(Arc::clone(previous)),
        );
        let change = Arc::new(MoveChange::new(registry, "shooting", true, vec![trial]));
        let committed =
            Arc::new(MonteCarloStep::commit(registry, simulation, step, active, change).unwrap());
        active = Arc::clone(committed.active());
        out.push(committed);
    }
    Run {
        ensemble,
        initial,
        steps: out,
    }
}
