//! The set of active samples, one per replica.

use crate::ensemble::Ensemble;
use crate::sample::Sample;
use crate::{fields_of, object_list, optional_object, same_identity, take_optional_typed, take_typed_list};
use pathstore_core::id::ObjectId;
use pathstore_core::identity::IdentityRegistry;
use pathstore_core::serialize::SerializeError;
use pathstore_core::storable::{BuildContext, ObjectHandle, Storable};
use pathstore_core::value::Fields;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

pub const SAMPLE_SET_KIND: &str = "sample_set";

#[derive(Debug, thiserror::Error)]
pub enum SampleSetError {
    #[error("replica {replica} appears more than once")]
    DuplicateReplica { replica: i64 },
    #[error("sample {sample} (replica {replica}) is not valid for its ensemble")]
    InvalidSample { sample: ObjectId, replica: i64 },
}

/// Immutable collection of samples keyed by replica. Applying changes
/// yields a new set that references the set it was derived from.
#[derive(Debug)]
pub struct SampleSet {
    id: ObjectId,
    samples: Vec<Arc<Sample>>,
    predecessor: Option<Arc<SampleSet>>,
}

impl SampleSet {
    pub fn new(registry: &IdentityRegistry, samples: Vec<Arc<Sample>>) -> Result<Self, SampleSetError> {
        let set = Self {
            id: registry.allocate(),
            samples,
            predecessor: None,
        };
        set.consistency_check()?;
        Ok(set)
    }

    pub fn samples(&self) -> &[Arc<Sample>] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn predecessor(&self) -> Option<&Arc<SampleSet>> {
        self.predecessor.as_ref()
    }

    /// Number of sets this one was derived through.
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self.predecessor.as_ref();
        while let Some(prev) = cursor {
            depth += 1;
            cursor = prev.predecessor.as_ref();
        }
        depth
    }

    pub fn replicas(&self) -> BTreeSet<i64> {
        self.samples.iter().map(|s| s.replica()).collect()
    }

    pub fn by_replica(&self, replica: i64) -> Option<&Arc<Sample>> {
        self.samples.iter().find(|s| s.replica() == replica)
    }

    pub fn by_ensemble(&self, ensemble: &Arc<Ensemble>) -> Vec<&Arc<Sample>> {
        self.samples
            .iter()
            .filter(|s| same_identity(s.ensemble(), ensemble))
            .collect()
    }

    pub fn contains(&self, sample: &Arc<Sample>) -> bool {
        self.samples.iter().any(|s| same_identity(s, sample))
    }

    /// Every replica appears at most once.
    pub fn consistency_check(&self) -> Result<(), SampleSetError> {
        let mut seen = BTreeSet::new();
        for sample in &self.samples {
            if !seen.insert(sample.replica()) {
                return Err(SampleSetError::DuplicateReplica {
                    replica: sample.replica(),
                });
            }
        }
        Ok(())
    }

    /// Every sample's trajectory satisfies its ensemble.
    pub fn validity_check(&self) -> Result<(), SampleSetError> {
        match self.samples.iter().find(|s| !s.is_valid()) {
            Some(bad) => Err(SampleSetError::InvalidSample {
                sample: bad.identity(),
                replica: bad.replica(),
            }),
            None => Ok(()),
        }
    }

    /// A new set where each sample in `changes` replaces the sample with the
    /// same replica, or is added if the replica is new.
    pub fn apply(
        self: Arc<Self>,
        registry: &IdentityRegistry,
        changes: impl IntoIterator<Item = Arc<Sample>>,
    ) -> Result<SampleSet, SampleSetError> {
        let mut by_replica: BTreeMap<i64, Arc<Sample>> = self
            .samples
            .iter()
            .map(|s| (s.replica(), Arc::clone(s)))
            .collect();
        let mut changed = BTreeSet::new();
        for sample in changes {
            if !changed.insert(sample.replica()) {
                return Err(SampleSetError::DuplicateReplica {
                    replica: sample.replica(),
                });
            }
            by_replica.insert(sample.replica(), sample);
        }
        debug!(from = %self.id, replaced = changed.len(), "applied sample changes");
        Ok(SampleSet {
            id: registry.allocate(),
            samples: by_replica.into_values().collect(),
            predecessor: Some(self),
        })
    }
}

impl Drop for SampleSet {
    fn drop(&mut self) {
        // Unlink the history iteratively; runs keep one set per step.
        let mut next = self.predecessor.take();
        while let Some(set) = next {
            next = Arc::into_inner(set).and_then(|mut set| set.predecessor.take());
        }
    }
}

impl Storable for SampleSet {
    fn identity(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> &'static str {
        SAMPLE_SET_KIND
    }

    fn to_fields(&self) -> Fields {
        fields_of([
            ("samples", object_list(&self.samples)),
            ("predecessor", optional_object(&self.predecessor)),
        ])
    }
}

pub fn sample_set_constructor(
    id: ObjectId,
    mut fields: Fields,
    _ctx: &BuildContext<'_>,
) -> Result<ObjectHandle, SerializeError> {
    Ok(Arc::new(SampleSet {
        id,
        samples: take_typed_list(&mut fields, "samples", "sample")?,
        predecessor: take_optional_typed(&mut fields, "predecessor", "sample_set")?,
    }))
}
