//! Record of what one Monte Carlo move did: its trial samples, whether it
//! was accepted, and the nested changes of composite movers.

use crate::sample::Sample;
use crate::{fields_of, object_list, take_typed_list};
use pathstore_core::id::ObjectId;
use pathstore_core::identity::IdentityRegistry;
use pathstore_core::serialize::SerializeError;
use pathstore_core::storable::{BuildContext, ObjectHandle, Storable};
use pathstore_core::value::{Field, Fields, FieldsExt};
use std::sync::Arc;

pub const MOVE_CHANGE_KIND: &str = "move_change";

#[derive(Debug)]
pub struct MoveChange {
    id: ObjectId,
    mover: String,
    accepted: bool,
    trials: Vec<Arc<Sample>>,
    subchanges: Vec<Arc<MoveChange>>,
    /// Free-form mover details, e.g. shooting point index or random draws.
    details: Fields,
}

impl MoveChange {
    pub fn new(
        registry: &IdentityRegistry,
        mover: impl Into<String>,
        accepted: bool,
        trials: Vec<Arc<Sample>>,
    ) -> Self {
        Self {
            id: registry.allocate(),
            mover: mover.into(),
            accepted,
            trials,
            subchanges: Vec::new(),
            details: Fields::new(),
        }
    }

    /// A composite change wrapping `subchanges`. Accepted when every
    /// subchange is.
    pub fn sequential(
        registry: &IdentityRegistry,
        mover: impl Into<String>,
        subchanges: Vec<Arc<MoveChange>>,
    ) -> Self {
        Self {
            id: registry.allocate(),
            mover: mover.into(),
            accepted: subchanges.iter().all(|c| c.accepted),
            trials: Vec::new(),
            subchanges,
            details: Fields::new(),
        }
    }

    pub fn with_detail(mut self, name: &str, value: Field) -> Self {
        self.details.insert(name.to_string(), value);
        self
    }

    pub fn mover(&self) -> &str {
        &self.mover
    }

    pub fn accepted(&self) -> bool {
        self.accepted
    }

    pub fn trials(&self) -> &[Arc<Sample>] {
        &self.trials
    }

    pub fn subchanges(&self) -> &[Arc<MoveChange>] {
        &self.subchanges
    }

    pub fn details(&self) -> &Fields {
        &self.details
    }

    /// Trial samples that become active: this change's own trials when
    /// accepted, plus those of accepted subchanges, later ones winning per
    /// replica.
    pub fn accepted_samples(&self) -> Vec<Arc<Sample>> {
        let mut out: Vec<Arc<Sample>> = Vec::new();
        self.collect_accepted(&mut out);
        out
    }

    fn collect_accepted(&self, out: &mut Vec<Arc<Sample>>) {
        if !self.accepted {
            return;
        }
        for sub in &self.subchanges {
            sub.collect_accepted(out);
        }
        for trial in &self.trials {
            out.retain(|s| s.replica() != trial.replica());
            out.push(Arc::clone(trial));
        }
    }
}

impl Storable for MoveChange {
    fn identity(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> &'static str {
        MOVE_CHANGE_KIND
    }

    fn to_fields(&self) -> Fields {
        fields_of([
            ("mover", Field::from(self.mover.as_str())),
            ("accepted", Field::Bool(self.accepted)),
            ("trials", object_list(&self.trials)),
            ("subchanges", object_list(&self.subchanges)),
            ("details", Field::Map(self.details.clone())),
        ])
    }
}

pub fn move_change_constructor(
    id: ObjectId,
    mut fields: Fields,
    _ctx: &BuildContext<'_>,
) -> Result<ObjectHandle, SerializeError> {
    Ok(Arc::new(MoveChange {
        id,
        mover: fields.take_str("mover")?,
        accepted: fields.take_bool("accepted")?,
        trials: take_typed_list(&mut fields, "trials", "sample")?,
        subchanges: take_typed_list(&mut fields, "subchanges", "move_change")?,
        details: fields.take_map("details")?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensemble::Ensemble;
    use crate::trajectory::Trajectory;

    fn sample(registry: &IdentityRegistry, replica: i64) -> Arc<Sample> {
        Arc::new(Sample::new(
            registry,
            replica,
            Arc::new(Trajectory::new(registry, Vec::new())),
            Arc::new(Ensemble::new(registry, "any", 0, None)),
        ))
    }

    #[test]
    fn rejected_change_contributes_nothing() {
        let registry = IdentityRegistry::with_prefix(1);
        let change = MoveChange::new(&registry, "shooting", false, vec![sample(&registry, 0)]);
        assert!(change.accepted_samples().is_empty());
    }

    #[test]
    fn sequential_later_trials_win() {
        let registry = IdentityRegistry::with_prefix(1);
        let first = sample(&registry, 0);
        let second = sample(&registry, 0);
        let other = sample(&registry, 1);
        let a = Arc::new(MoveChange::new(&registry, "shoot", true, vec![first, other.clone()]));
        let b = Arc::new(MoveChange::new(&registry, "shoot", true, vec![second.clone()]));
        let seq = MoveChange::sequential(&registry, "sequence", vec![a, b]);
        assert!(seq.accepted());

        let accepted = seq.accepted_samples();
        assert_eq!(accepted.len(), 2);
        assert!(accepted.iter().any(|s| s.identity() == second.identity()));
        assert!(accepted.iter().any(|s| s.identity() == other.identity()));
    }

    #[test]
    fn sequential_rejected_if_any_rejected() {
        let registry = IdentityRegistry::with_prefix(1);
        let a = Arc::new(MoveChange::new(&registry, "a", true, Vec::new()));
        let b = Arc::new(MoveChange::new(&registry, "b", false, Vec::new()));
        assert!(!MoveChange::sequential(&registry, "seq", vec![a, b]).accepted());
    }

    #[test]
    fn details_are_flattened_as_map() {
        let registry = IdentityRegistry::with_prefix(1);
        let change = MoveChange::new(&registry, "shoot", true, Vec::new())
            .with_detail("shooting_index", Field::Int(4));
        let Some(Field::Map(details)) = change.to_fields().remove("details") else {
            panic!("details missing");
        };
        assert_eq!(details.get("shooting_index"), Some(&Field::Int(4)));
    }
}
