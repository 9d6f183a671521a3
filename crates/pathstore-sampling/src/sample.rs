//! A trajectory assigned to an ensemble for one replica.

use crate::ensemble::Ensemble;
use crate::trajectory::Trajectory;
use crate::{fields_of, optional_object, take_optional_typed, take_typed};
use pathstore_core::id::ObjectId;
use pathstore_core::identity::IdentityRegistry;
use pathstore_core::serialize::SerializeError;
use pathstore_core::storable::{BuildContext, ObjectHandle, Storable};
use pathstore_core::value::{Field, Fields, FieldsExt};
use std::sync::Arc;

pub const SAMPLE_KIND: &str = "sample";

#[derive(Debug)]
pub struct Sample {
    id: ObjectId,
    replica: i64,
    trajectory: Arc<Trajectory>,
    ensemble: Arc<Ensemble>,
    /// The sample this one was generated from, if any.
    parent: Option<Arc<Sample>>,
}

impl Sample {
    pub fn new(
        registry: &IdentityRegistry,
        replica: i64,
        trajectory: Arc<Trajectory>,
        ensemble: Arc<Ensemble>,
    ) -> Self {
        Self {
            id: registry.allocate(),
            replica,
            trajectory,
            ensemble,
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: Arc<Sample>) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn replica(&self) -> i64 {
        self.replica
    }

    pub fn trajectory(&self) -> &Arc<Trajectory> {
        &self.trajectory
    }

    pub fn ensemble(&self) -> &Arc<Ensemble> {
        &self.ensemble
    }

    pub fn parent(&self) -> Option<&Arc<Sample>> {
        self.parent.as_ref()
    }

    /// Whether the trajectory satisfies the ensemble.
    pub fn is_valid(&self) -> bool {
        self.ensemble.accepts(&self.trajectory)
    }

    /// Number of ancestors reachable through `parent`.
    pub fn generation(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self.parent.as_ref();
        while let Some(parent) = cursor {
            depth += 1;
            cursor = parent.parent.as_ref();
        }
        depth
    }
}

impl Drop for Sample {
    fn drop(&mut self) {
        // Long ancestries would otherwise recurse once per generation.
        let mut next = self.parent.take();
        while let Some(parent) = next {
            next = Arc::into_inner(parent).and_then(|mut sample| sample.parent.take());
        }
    }
}

impl Storable for Sample {
    fn identity(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> &'static str {
        SAMPLE_KIND
    }

    fn to_fields(&self) -> Fields {
        fields_of([
            ("replica", Field::Int(self.replica)),
            ("trajectory", Field::Object(Arc::clone(&self.trajectory) as ObjectHandle)),
            ("ensemble", Field::Object(Arc::clone(&self.ensemble) as ObjectHandle)),
            ("parent", optional_object(&self.parent)),
        ])
    }
}

pub fn sample_constructor(
    id: ObjectId,
    mut fields: Fields,
    _ctx: &BuildContext<'_>,
) -> Result<ObjectHandle, SerializeError> {
    Ok(Arc::new(Sample {
        id,
        replica: fields.take_int("replica")?,
        trajectory: take_typed(&mut fields, "trajectory", "trajectory")?,
        ensemble: take_typed(&mut fields, "ensemble", "ensemble")?,
        parent: take_optional_typed(&mut fields, "parent", "sample")?,
    }))
}
