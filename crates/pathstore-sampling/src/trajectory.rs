//! Ordered sequence of snapshots.

use crate::{fields_of, object_list, take_typed_list};
use pathstore_core::bulk::BulkError;
use pathstore_core::id::ObjectId;
use pathstore_core::identity::IdentityRegistry;
use pathstore_core::serialize::SerializeError;
use pathstore_core::snapshot::Snapshot;
use pathstore_core::storable::{BuildContext, ObjectHandle, Storable};
use pathstore_core::value::Fields;
use std::collections::HashSet;
use std::sync::Arc;

pub const TRAJECTORY_KIND: &str = "trajectory";

#[derive(Debug)]
pub struct Trajectory {
    id: ObjectId,
    snapshots: Vec<Arc<Snapshot>>,
}

impl Trajectory {
    pub fn new(registry: &IdentityRegistry, snapshots: Vec<Arc<Snapshot>>) -> Self {
        Self {
            id: registry.allocate(),
            snapshots,
        }
    }

    pub fn snapshots(&self) -> &[Arc<Snapshot>] {
        &self.snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Snapshot>> {
        self.snapshots.get(index)
    }

    pub fn first(&self) -> Option<&Arc<Snapshot>> {
        self.snapshots.first()
    }

    pub fn last(&self) -> Option<&Arc<Snapshot>> {
        self.snapshots.last()
    }

    pub fn contains(&self, snapshot: ObjectId) -> bool {
        self.snapshots.iter().any(|s| s.identity() == snapshot)
    }

    /// Number of snapshots this trajectory shares with `other`.
    pub fn shared_snapshots(&self, other: &Trajectory) -> usize {
        let mine: HashSet<ObjectId> = self.snapshots.iter().map(|s| s.identity()).collect();
        other
            .snapshots
            .iter()
            .filter(|s| mine.contains(&s.identity()))
            .count()
    }

    /// The time-reversed trajectory: snapshots in reverse order, each with
    /// negated velocities. Every reversed snapshot is a new object.
    pub fn reversed(&self, registry: &IdentityRegistry) -> Result<Self, BulkError> {
        let snapshots = self
            .snapshots
            .iter()
            .rev()
            .map(|s| s.reversed(registry).map(Arc::new))
            .collect::<Result<_, _>>()?;
        Ok(Self::new(registry, snapshots))
    }
}

impl Storable for Trajectory {
    fn identity(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> &'static str {
        TRAJECTORY_KIND
    }

    fn to_fields(&self) -> Fields {
        fields_of([("snapshots", object_list(&self.snapshots))])
    }
}

pub fn trajectory_constructor(
    id: ObjectId,
    mut fields: Fields,
    _ctx: &BuildContext<'_>,
) -> Result<ObjectHandle, SerializeError> {
    let snapshots = take_typed_list::<Snapshot>(&mut fields, "snapshots", "snapshot")?;
    Ok(Arc::new(Trajectory { id, snapshots }))
}
