//! Path ensembles, reduced to the length criterion the storage layer needs
//! to validate samples.

use crate::fields_of;
use crate::trajectory::Trajectory;
use pathstore_core::id::ObjectId;
use pathstore_core::identity::IdentityRegistry;
use pathstore_core::serialize::SerializeError;
use pathstore_core::storable::{BuildContext, ObjectHandle, Storable};
use pathstore_core::value::{Field, Fields, FieldsExt};
use std::sync::Arc;

pub const ENSEMBLE_KIND: &str = "ensemble";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ensemble {
    id: ObjectId,
    name: String,
    min_length: usize,
    /// `None` means unbounded.
    max_length: Option<usize>,
}

impl Ensemble {
    pub fn new(
        registry: &IdentityRegistry,
        name: impl Into<String>,
        min_length: usize,
        max_length: Option<usize>,
    ) -> Self {
        Self {
            id: registry.allocate(),
            name: name.into(),
            min_length,
            max_length,
        }
    }

    /// Ensemble of trajectories with exactly `length` snapshots.
    pub fn exact_length(registry: &IdentityRegistry, name: impl Into<String>, length: usize) -> Self {
        Self::new(registry, name, length, Some(length))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min_length(&self) -> usize {
        self.min_length
    }

    pub fn max_length(&self) -> Option<usize> {
        self.max_length
    }

    pub fn accepts(&self, trajectory: &Trajectory) -> bool {
        let len = trajectory.len();
        len >= self.min_length && self.max_length.is_none_or(|max| len <= max)
    }
}

impl Storable for Ensemble {
    fn identity(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> &'static str {
        ENSEMBLE_KIND
    }

    fn to_fields(&self) -> Fields {
        fields_of([
            ("name", Field::from(self.name.as_str())),
            ("min_length", Field::Int(self.min_length as i64)),
            ("max_length", Field::from(self.max_length.map(|m| m as i64))),
        ])
    }
}

fn length(fields: &mut Fields, name: &str) -> Result<Option<usize>, SerializeError> {
    let raw = match fields.take(name)? {
        Field::Null => return Ok(None),
        Field::Int(v) => v,
        other => {
            return Err(SerializeError::WrongType {
                field: name.to_string(),
                expected: "int",
                found: other.type_name(),
            });
        }
    };
    usize::try_from(raw)
        .map(Some)
        .map_err(|_| SerializeError::WrongType {
            field: name.to_string(),
            expected: "non-negative int",
            found: "int",
        })
}

pub fn ensemble_constructor(
    id: ObjectId,
    mut fields: Fields,
    _ctx: &BuildContext<'_>,
) -> Result<ObjectHandle, SerializeError> {
    let name = fields.take_str("name")?;
    let min_length = length(&mut fields, "min_length")?.ok_or(SerializeError::WrongType {
        field: "min_length".to_string(),
        expected: "int",
        found: "null",
    })?;
    let max_length = length(&mut fields, "max_length")?;
    Ok(Arc::new(Ensemble {
        id,
        name,
        min_length,
        max_length,
    }))
}
