//! One committed Monte Carlo step: the move that ran and the active sample
//! set it produced.

use crate::move_change::MoveChange;
use crate::sample_set::{SampleSet, SampleSetError};
use crate::{fields_of, take_typed};
use pathstore_core::id::ObjectId;
use pathstore_core::identity::IdentityRegistry;
use pathstore_core::serialize::SerializeError;
use pathstore_core::storable::{BuildContext, ObjectHandle, Storable};
use pathstore_core::value::{Field, Fields, FieldsExt};
use std::sync::Arc;

pub const STEP_KIND: &str = "mc_step";

#[derive(Debug)]
pub struct MonteCarloStep {
    id: ObjectId,
    /// Identity of the simulation that ran this step.
    simulation: ObjectId,
    step: u64,
    active: Arc<SampleSet>,
    change: Arc<MoveChange>,
}

impl MonteCarloStep {
    /// Build the step record for `change` applied on top of `previous`.
    pub fn commit(
        registry: &IdentityRegistry,
        simulation: ObjectId,
        step: u64,
        previous: Arc<SampleSet>,
        change: Arc<MoveChange>,
    ) -> Result<Self, SampleSetError> {
        let active = Arc::new(previous.apply(registry, change.accepted_samples())?);
        Ok(Self {
            id: registry.allocate(),
            simulation,
            step,
            active,
            change,
        })
    }

    pub fn simulation(&self) -> ObjectId {
        self.simulation
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn active(&self) -> &Arc<SampleSet> {
        &self.active
    }

    pub fn change(&self) -> &Arc<MoveChange> {
        &self.change
    }
}

impl Storable for MonteCarloStep {
    fn identity(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> &'static str {
        STEP_KIND
    }

    fn to_fields(&self) -> Fields {
        fields_of([
            // Plain data, not a reference: the simulation object is not
            // stored alongside its steps.
            ("simulation", Field::Str(self.simulation.encode())),
            ("step", Field::Int(self.step as i64)),
            ("active", Field::Object(Arc::clone(&self.active) as ObjectHandle)),
            ("change", Field::Object(Arc::clone(&self.change) as ObjectHandle)),
        ])
    }
}

pub fn step_constructor(
    id: ObjectId,
    mut fields: Fields,
    _ctx: &BuildContext<'_>,
) -> Result<ObjectHandle, SerializeError> {
    let encoded = fields.take_str("simulation")?;
    let simulation = ObjectId::decode(&encoded).ok_or(SerializeError::WrongType {
        field: "simulation".to_string(),
        expected: "encoded identity",
        found: "string",
    })?;
    let step = u64::try_from(fields.take_int("step")?).map_err(|_| SerializeError::WrongType {
        field: "step".to_string(),
        expected: "non-negative int",
        found: "int",
    })?;
    Ok(Arc::new(MonteCarloStep {
        id,
        simulation,
        step,
        active: take_typed(&mut fields, "active", "sample_set")?,
        change: take_typed(&mut fields, "change", "move_change")?,
    }))
}
