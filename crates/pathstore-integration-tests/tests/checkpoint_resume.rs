//! Interrupted steps resume their non-deterministic results from
//! checkpoints instead of recomputing them.

mod common;

use pathstore_core::checkpoint::CheckpointError;
use pathstore_core::storable::{ObjectHandle, Storable, downcast};
use pathstore_core::value::{Field, Fields};
use pathstore_data::open_context;
use pathstore_sampling::{Sample, SampleSet};
use std::sync::Arc;

fn choice(index: i64, trial: &Arc<Sample>) -> Fields {
    Fields::from([
        ("shooting_index".to_string(), Field::Int(index)),
        ("trial".to_string(), Field::Object(Arc::clone(trial) as ObjectHandle)),
    ])
}

#[test]
fn crashed_step_resumes_recorded_choices() {
    common::init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let config = common::file_config(dir.path());

    let (simulation, set_id, trial_id) = {
        let ctx = open_context(&config).unwrap();
        let run = common::run(&ctx, 1);
        let set: ObjectHandle = Arc::clone(&run.initial) as _;
        ctx.save(&set).unwrap();

        let simulation = ctx.allocate();
        let mut step = config.checkpointing().create_step(simulation, 2).unwrap();
        let trial = Arc::clone(&run.steps[0].change().trials()[0]);
        let data = step
            .checkpointed(&ctx, set.identity(), "select", || choice(1, &trial))
            .unwrap();
        assert_eq!(data.get("shooting_index"), Some(&Field::Int(1)));
        // The process dies here: the step is never committed or discarded.
        (simulation, set.identity(), trial.identity())
    };

    let ctx = open_context(&config).unwrap();
    let mut step = config
        .checkpointing()
        .resume_step(simulation, 2)
        .unwrap()
        .expect("step directory survives the crash");

    let data = step
        .checkpointed(&ctx, set_id, "select", || panic!("recorded choice must be reused"))
        .unwrap();
    assert_eq!(data.get("shooting_index"), Some(&Field::Int(1)));
    let Some(Field::Object(trial)) = data.get("trial") else {
        panic!("trial reference lost");
    };
    let trial = downcast::<Sample>(trial).unwrap();
    assert_eq!(trial.identity(), trial_id);
    assert!(Arc::ptr_eq(&trial, &downcast::<Sample>(&ctx.load_one(trial_id).unwrap()).unwrap()));

    // A second call for the same owner has no checkpoint yet and computes.
    let fresh = step
        .checkpointed(&ctx, set_id, "select", || Fields::from([("shooting_index".to_string(), Field::Int(7))]))
        .unwrap();
    assert_eq!(fresh.get("shooting_index"), Some(&Field::Int(7)));

    let dir_path = step.dir().unwrap().to_path_buf();
    step.discard().unwrap();
    assert!(!dir_path.exists());
    assert!(config.checkpointing().resume_step(simulation, 2).unwrap().is_none());

    let set = downcast::<SampleSet>(&ctx.load_one(set_id).unwrap()).unwrap();
    assert_eq!(set.len(), 1);
}

#[test]
fn creating_an_existing_step_conflicts() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::file_config(dir.path());
    let checkpointing = config.checkpointing();
    let simulation = open_context(&config).unwrap().allocate();

    let _first = checkpointing.create_step(simulation, 0).unwrap();
    assert!(matches!(
        checkpointing.create_step(simulation, 0),
        Err(CheckpointError::Conflict(_))
    ));
}

#[test]
fn next_descriptor_round_trips() {
    let dir = tempfile::tempdir().unwrap();
    let config = common::file_config(dir.path());
    let ctx = open_context(&config).unwrap();
    let run = common::run(&ctx, 1);
    let trial = Arc::clone(&run.steps[0].change().trials()[0]);
    let owner = ctx.allocate();

    let mut step = config.checkpointing().create_step(owner, 1).unwrap();
    let next = Fields::from([("mover".to_string(), Field::from("shooting"))]);
    let seq = step
        .record(&ctx, owner, "propagate", &choice(3, &trial), Some(&next))
        .unwrap();
    assert_eq!(seq, 0);

    let entry = step.resume(&ctx, owner, "propagate", seq).unwrap().unwrap();
    assert_eq!(entry.data, choice(3, &trial));
    assert_eq!(entry.next, Some(next));
    assert!(step.resume(&ctx, owner, "propagate", 1).unwrap().is_none());
}

#[test]
fn disabled_checkpointing_always_computes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = common::file_config(dir.path());
    config.checkpoints.enabled = false;
    let ctx = open_context(&config).unwrap();
    let owner = ctx.allocate();

    let checkpointing = config.checkpointing();
    let mut step = checkpointing.create_step(owner, 0).unwrap();
    assert!(!step.is_enabled());
    let mut calls = 0;
    for _ in 0..2 {
        step.checkpointed(&ctx, owner, "draw", || {
            calls += 1;
            Fields::new()
        })
        .unwrap();
    }
    assert_eq!(calls, 2);
    assert!(checkpointing.resume_step(owner, 0).unwrap().is_none());
    assert!(!dir.path().join("checkpoints").exists());
}
