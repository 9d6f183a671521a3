//! Path-sampling domain objects for pathstore.
//!
//! These types carry plain data plus references to one another and to core
//! [`Snapshot`](pathstore_core::snapshot::Snapshot)s. Dynamics, ensemble
//! volumes and acceptance rules live elsewhere; this crate only defines what
//! gets persisted and how it is rebuilt.
//!
//! # Reference Structure
//!
//! ```text
//! MonteCarloStep -> SampleSet -> Sample -> Trajectory -> Snapshot
//!               \-> MoveChange -/     \-> Ensemble
//! ```
//!
//! A sample set may reference the set it was derived from, so a long run
//! forms a deep chain that reconstruction walks in batches.

use pathstore_core::id::ObjectId;
use pathstore_core::serialize::SerializeError;
use pathstore_core::storable::{
    ObjectHandle, RegistryError, Storable, TypeRegistry, TypeRegistryBuilder, downcast,
};
use pathstore_core::value::{Field, Fields, FieldsExt};
use std::sync::Arc;

pub mod ensemble;
pub mod move_change;
pub mod sample;
pub mod sample_set;
pub mod step;
pub mod trajectory;

pub use ensemble::Ensemble;
pub use move_change::MoveChange;
pub use sample::Sample;
pub use sample_set::{SampleSet, SampleSetError};
pub use step::MonteCarloStep;
pub use trajectory::Trajectory;

/// Register every sampling kind, plus the core snapshot kind they depend on.
pub fn register_types(builder: &mut TypeRegistryBuilder) -> Result<(), RegistryError> {
    pathstore_core::snapshot::register_types(builder)?;
    builder.register(trajectory::TRAJECTORY_KIND, trajectory::trajectory_constructor)?;
    builder.register(ensemble::ENSEMBLE_KIND, ensemble::ensemble_constructor)?;
    builder.register(sample::SAMPLE_KIND, sample::sample_constructor)?;
    builder.register(sample_set::SAMPLE_SET_KIND, sample_set::sample_set_constructor)?;
    builder.register(move_change::MOVE_CHANGE_KIND, move_change::move_change_constructor)?;
    builder.register(step::STEP_KIND, step::step_constructor)?;
    Ok(())
}

/// A frozen registry holding every kind this crate knows.
pub fn type_registry() -> Result<TypeRegistry, RegistryError> {
    let mut builder = TypeRegistryBuilder::new();
    register_types(&mut builder)?;
    Ok(builder.build())
}

// ---------------------------------------------------------------------------
// Typed field helpers shared by the constructors
// ---------------------------------------------------------------------------

pub(crate) fn typed<T: Storable>(
    handle: ObjectHandle,
    field: &str,
    expected: &'static str,
) -> Result<Arc<T>, SerializeError> {
    downcast::<T>(&handle).ok_or_else(|| SerializeError::WrongType {
        field: field.to_string(),
        expected,
        found: handle.kind(),
    })
}

pub(crate) fn take_typed<T: Storable>(
    fields: &mut Fields,
    name: &str,
    expected: &'static str,
) -> Result<Arc<T>, SerializeError> {
    typed(fields.take_object(name)?, name, expected)
}

pub(crate) fn take_optional_typed<T: Storable>(
    fields: &mut Fields,
    name: &str,
    expected: &'static str,
) -> Result<Option<Arc<T>>, SerializeError> {
    fields
        .take_optional_object(name)?
        .map(|h| typed(h, name, expected))
        .transpose()
}

pub(crate) fn take_typed_list<T: Storable>(
    fields: &mut Fields,
    name: &str,
    expected: &'static str,
) -> Result<Vec<Arc<T>>, SerializeError> {
    fields
        .take_objects(name)?
        .into_iter()
        .map(|h| typed(h, name, expected))
        .collect()
}

pub(crate) fn object_list<T: Storable>(items: &[Arc<T>]) -> Field {
    Field::List(
        items
            .iter()
            .map(|item| Field::Object(Arc::clone(item) as ObjectHandle))
            .collect(),
    )
}

pub(crate) fn optional_object<T: Storable>(item: &Option<Arc<T>>) -> Field {
    item.as_ref()
        .map_or(Field::Null, |i| Field::Object(Arc::clone(i) as ObjectHandle))
}

pub(crate) fn fields_of<const N: usize>(entries: [(&str, Field); N]) -> Fields {
    entries
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

/// Identity equality for typed handles.
pub(crate) fn same_identity<T: Storable>(a: &Arc<T>, b: &Arc<T>) -> bool {
    a.identity() == b.identity() && a.identity() != ObjectId::UNASSIGNED
}
