//! Simulation snapshot whose numeric payload lives in the bulk store and is
//! only read on first access.

use crate::bulk::{BulkArrayStore, BulkError, Frame};
use crate::id::{ObjectId, SlotIndex};
use crate::identity::IdentityRegistry;
use crate::serialize::SerializeError;
use crate::storable::{BuildContext, ObjectHandle, RegistryError, Storable, TypeRegistryBuilder};
use crate::value::{Field, Fields, FieldsExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub const SNAPSHOT_KIND: &str = "snapshot";

/// A configuration of the simulated system at one instant.
///
/// A reconstructed snapshot holds only its slot index and a handle to the
/// bulk store; [`Snapshot::frame`] performs the read the first time it is
/// called and memoizes the result.
pub struct Snapshot {
    id: ObjectId,
    slot: AtomicU64,
    frame: Mutex<Option<Arc<Frame>>>,
    source: Option<Arc<BulkArrayStore>>,
    n_entities: usize,
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("id", &self.id)
            .field("slot", &self.slot())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl Snapshot {
    /// A new in-memory snapshot with a freshly allocated identity.
    pub fn new(registry: &IdentityRegistry, frame: Frame) -> Self {
        Self::with_frame(registry.allocate(), frame)
    }

    pub fn with_frame(id: ObjectId, frame: Frame) -> Self {
        Self {
            id,
            slot: AtomicU64::new(SlotIndex::UNWRITTEN.0),
            n_entities: frame.n_entities(),
            frame: Mutex::new(Some(Arc::new(frame))),
            source: None,
        }
    }

    /// A snapshot whose payload is still in `store` at `slot`.
    pub fn deferred(id: ObjectId, slot: SlotIndex, store: Arc<BulkArrayStore>) -> Self {
        Self {
            id,
            slot: AtomicU64::new(slot.0),
            frame: Mutex::new(None),
            n_entities: store.entity_count(),
            source: Some(store),
        }
    }

    pub fn slot(&self) -> SlotIndex {
        SlotIndex(self.slot.load(Ordering::Acquire))
    }

    pub fn n_entities(&self) -> usize {
        self.n_entities
    }

    pub fn is_loaded(&self) -> bool {
        self.frame.lock().is_some()
    }

    /// The numeric payload, read from the bulk store at most once.
    pub fn frame(&self) -> Result<Arc<Frame>, BulkError> {
        let mut memo = self.frame.lock();
        self.load_into(&mut memo)
    }

    fn load_into(&self, memo: &mut Option<Arc<Frame>>) -> Result<Arc<Frame>, BulkError> {
        if let Some(frame) = memo.as_ref() {
            return Ok(Arc::clone(frame));
        }
        let source = self.source.as_ref().ok_or_else(|| BulkError::CorruptState {
            owner: Some(self.id),
            reason: "snapshot has neither a payload nor a bulk store".to_string(),
        })?;
        let frame = source
            .read(self.slot())
            .map_err(|e| e.with_owner(self.id))?;
        *memo = Some(Arc::clone(&frame));
        Ok(frame)
    }

    pub fn total_energy(&self) -> Result<f32, BulkError> {
        Ok(self.frame()?.total_energy())
    }

    /// A new snapshot with negated velocities.
    pub fn reversed(&self, registry: &IdentityRegistry) -> Result<Self, BulkError> {
        Ok(Self::new(registry, self.frame()?.reversed()))
    }

    /// Write the payload to `bulk` unless it already has a slot. The memo lock
    /// is held across the check and the append so a snapshot is never written
    /// twice.
    pub fn save_payload(&self, bulk: &BulkArrayStore) -> Result<SlotIndex, BulkError> {
        let mut memo = self.frame.lock();
        let current = self.slot();
        if current.is_written() {
            return Ok(current);
        }
        let frame = self.load_into(&mut memo)?;
        let slot = bulk.append(&frame).map_err(|e| e.with_owner(self.id))?;
        self.slot.store(slot.0, Ordering::Release);
        Ok(slot)
    }
}

impl Storable for Snapshot {
    fn identity(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> &'static str {
        SNAPSHOT_KIND
    }

    fn to_fields(&self) -> Fields {
        let slot = self.slot();
        let payload = if slot.is_written() {
            Field::Slot(slot)
        } else {
            match self.frame.lock().as_ref() {
                Some(frame) => Field::Map(BTreeMap::from([
                    ("coordinates".to_string(), Field::Floats(frame.flat_coordinates())),
                    ("velocities".to_string(), Field::Floats(frame.flat_velocities())),
                    ("potential".to_string(), Field::Float(frame.potential() as f64)),
                    ("kinetic".to_string(), Field::Float(frame.kinetic() as f64)),
                ])),
                None => Field::Null,
            }
        };
        Fields::from([("frame".to_string(), payload)])
    }

    fn persist_payload(&self, bulk: &BulkArrayStore) -> Result<(), BulkError> {
        self.save_payload(bulk).map(|_| ())
    }
}

fn take_floats(fields: &mut Fields, name: &str) -> Result<Vec<f32>, SerializeError> {
    match fields.take(name)? {
        Field::Floats(v) => Ok(v),
        other => Err(SerializeError::WrongType {
            field: name.to_string(),
            expected: "floats",
            found: other.type_name(),
        }),
    }
}

/// Constructor registered under [`SNAPSHOT_KIND`].
pub fn snapshot_constructor(
    id: ObjectId,
    mut fields: Fields,
    ctx: &BuildContext<'_>,
) -> Result<ObjectHandle, SerializeError> {
    match fields.take("frame")? {
        Field::Slot(slot) => {
            let bulk = ctx.bulk.ok_or(SerializeError::NoBulkStore { id })?;
            if !slot.is_written() || slot.0 > bulk.len() {
                return Err(SerializeError::InvalidPayload {
                    id,
                    source: BulkError::SlotRange {
                        slot,
                        count: bulk.len(),
                    },
                });
            }
            Ok(Arc::new(Snapshot::deferred(id, slot, Arc::clone(bulk))))
        }
        Field::Map(mut inline) => {
            let coordinates = take_floats(&mut inline, "coordinates")?;
            let velocities = take_floats(&mut inline, "velocities")?;
            let potential = inline.take_float("potential")? as f32;
            let kinetic = inline.take_float("kinetic")? as f32;
            let frame = Frame::from_flat(&coordinates, &velocities, potential, kinetic)
                .map_err(|source| SerializeError::InvalidPayload {
                    id,
                    source: source.with_owner(id),
                })?;
            Ok(Arc::new(Snapshot::with_frame(id, frame)))
        }
        other => Err(SerializeError::WrongType {
            field: "frame".to_string(),
            expected: "slot or map",
            found: other.type_name(),
        }),
    }
}

/// Register the core's own storable kinds.
pub fn register_types(builder: &mut TypeRegistryBuilder) -> Result<(), RegistryError> {
    builder.register(SNAPSHOT_KIND, snapshot_constructor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::{flatten, unflatten};
    use crate::storable::downcast;
    use crate::test_utils::sample_frame;
    use crate::value::Value;
    use std::collections::HashMap;

    fn bulk(entities: usize) -> (tempfile::TempDir, Arc<BulkArrayStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = BulkArrayStore::create(&dir.path().join("frames.bulk"), entities).unwrap();
        (dir, Arc::new(store))
    }

    fn types() -> crate::storable::TypeRegistry {
        let mut builder = TypeRegistryBuilder::new();
        register_types(&mut builder).unwrap();
        builder.build()
    }

    #[test]
    fn new_snapshot_is_unwritten_and_loaded() {
        let registry = IdentityRegistry::with_prefix(1);
        let snap = Snapshot::new(&registry, sample_frame(3, 1));
        assert!(snap.identity().is_assigned());
        assert_eq!(snap.slot(), SlotIndex::UNWRITTEN);
        assert!(snap.is_loaded());
        assert_eq!(snap.n_entities(), 3);
    }

    #[test]
    fn save_payload_writes_once() {
        let (_dir, store) = bulk(2);
        let registry = IdentityRegistry::with_prefix(1);
        let snap = Snapshot::new(&registry, sample_frame(2, 4));
        let first = snap.save_payload(&store).unwrap();
        let second = snap.save_payload(&store).unwrap();
        assert_eq!(first, SlotIndex(1));
        assert_eq!(second, first);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn deferred_frame_reads_once() {
        let (dir, store) = bulk(2);
        let frame = sample_frame(2, 9);
        store.append(&frame).unwrap();
        let path = store.path().to_path_buf();
        drop(store);
        let store = Arc::new(BulkArrayStore::open(&path).unwrap());

        let snap = Snapshot::deferred(ObjectId::from_u128(5), SlotIndex(1), Arc::clone(&store));
        assert!(!snap.is_loaded());
        assert_eq!(store.disk_reads(), 0);

        let a = snap.frame().unwrap();
        let b = snap.frame().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*a, frame);
        assert_eq!(store.disk_reads(), 1);
        assert!(snap.is_loaded());
        drop(dir);
    }

    #[test]
    fn flattened_form_depends_on_slot() {
        let (_dir, store) = bulk(1);
        let snap = Snapshot::with_frame(ObjectId::from_u128(3), sample_frame(1, 2));
        let inline = flatten(&snap);
        assert!(matches!(inline.get("frame"), Some(Value::Map(_))));

        snap.save_payload(&store).unwrap();
        assert_eq!(flatten(&snap).get("frame"), Some(&Value::Slot(SlotIndex(1))));
    }

    #[test]
    fn inline_round_trip() {
        let id = ObjectId::from_u128(8);
        let snap = Snapshot::with_frame(id, sample_frame(2, 6));
        let record = flatten(&snap);
        let rebuilt = unflatten(
            id,
            &record,
            &HashMap::<ObjectId, ObjectHandle>::new(),
            &types(),
            &BuildContext::default(),
        )
        .unwrap();
        let rebuilt = downcast::<Snapshot>(&rebuilt).unwrap();
        assert_eq!(*rebuilt.frame().unwrap(), sample_frame(2, 6));
    }

    #[test]
    fn slot_record_without_bulk_store_fails() {
        let id = ObjectId::from_u128(8);
        let fields = Fields::from([("frame".to_string(), Field::Slot(SlotIndex(1)))]);
        let err = snapshot_constructor(id, fields, &BuildContext::default()).unwrap_err();
        assert!(matches!(err, SerializeError::NoBulkStore { id: e } if e == id));
    }

    #[test]
    fn slot_past_end_is_invalid_payload() {
        let (_dir, store) = bulk(1);
        let id = ObjectId::from_u128(8);
        let fields = Fields::from([("frame".to_string(), Field::Slot(SlotIndex(4)))]);
        let ctx = BuildContext { bulk: Some(&store) };
        let err = snapshot_constructor(id, fields, &ctx).unwrap_err();
        assert!(matches!(
            err,
            SerializeError::InvalidPayload {
                source: BulkError::SlotRange { .. },
                ..
            }
        ));
    }

    #[test]
    fn nan_inline_payload_is_corrupt() {
        let id = ObjectId::from_u128(8);
        let inline = Fields::from([
            ("coordinates".to_string(), Field::Floats(vec![f32::NAN, 0.0, 0.0])),
            ("velocities".to_string(), Field::Floats(vec![0.0; 3])),
            ("potential".to_string(), Field::Float(0.0)),
            ("kinetic".to_string(), Field::Float(0.0)),
        ]);
        let fields = Fields::from([("frame".to_string(), Field::Map(inline))]);
        let err = snapshot_constructor(id, fields, &BuildContext::default()).unwrap_err();
        assert!(matches!(
            err,
            SerializeError::InvalidPayload {
                source: BulkError::CorruptState { owner: Some(_), .. },
                ..
            }
        ));
    }

    #[test]
    fn reversed_snapshot_gets_new_identity() {
        let registry = IdentityRegistry::with_prefix(1);
        let snap = Snapshot::new(&registry, sample_frame(2, 1));
        let rev = snap.reversed(&registry).unwrap();
        assert_ne!(rev.identity(), snap.identity());
        assert_eq!(
            rev.frame().unwrap().velocities()[0][0],
            -snap.frame().unwrap().velocities()[0][0]
        );
    }
}
