//! Shared test helpers for unit tests, integration tests, and benchmarks.
//!
//! Gated behind `#[cfg(any(test, feature = "test-utils"))]` so these helpers
//! are available to other crates' tests and to benchmarks via the
//! `test-utils` feature.

use crate::bulk::{Frame, SPATIAL_DIMS};
use crate::id::ObjectId;
use crate::identity::IdentityRegistry;
use crate::serialize::SerializeError;
use crate::snapshot;
use crate::storable::{
    AsAny, BuildContext, ObjectHandle, Storable, TypeRegistry, TypeRegistryBuilder, downcast_ref,
};
use crate::value::{Field, Fields};
use std::sync::Arc;

// ===========================================================================
// Dynamic objects
// ===========================================================================

pub const DYNAMIC_KIND: &str = "dynamic";

/// A storable that is nothing but a bag of fields. Stands in for domain
/// objects in tests that only care about graph shape.
#[derive(Debug)]
pub struct DynamicObject {
    id: ObjectId,
    fields: Fields,
}

impl DynamicObject {
    pub fn new(id: ObjectId, fields: Fields) -> Self {
        Self { id, fields }
    }

    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }
}

impl Storable for DynamicObject {
    fn identity(&self) -> ObjectId {
        self.id
    }

    fn kind(&self) -> &'static str {
        DYNAMIC_KIND
    }

    fn to_fields(&self) -> Fields {
        self.fields.clone()
    }
}

impl Drop for DynamicObject {
    fn drop(&mut self) {
        // Unlink `next` chains one object at a time instead of recursing.
        let mut next = self.fields.remove("next");
        while let Some(Field::Object(handle)) = next {
            next = <dyn Storable as AsAny>::into_any(handle)
                .downcast::<DynamicObject>()
                .ok()
                .and_then(Arc::into_inner)
                .and_then(|mut object| object.fields.remove("next"));
        }
    }
}

pub fn dynamic_constructor(
    id: ObjectId,
    fields: Fields,
    _ctx: &BuildContext<'_>,
) -> Result<ObjectHandle, SerializeError> {
    Ok(Arc::new(DynamicObject::new(id, fields)))
}

/// A dynamic object handle built from literal fields.
pub fn dynamic<const N: usize>(id: ObjectId, fields: [(&str, Field); N]) -> ObjectHandle {
    Arc::new(DynamicObject::new(
        id,
        fields
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect(),
    ))
}

/// The object held in `name` of a dynamic object. Panics if absent.
pub fn dynamic_ref(handle: &ObjectHandle, name: &str) -> ObjectHandle {
    let object = downcast_ref::<DynamicObject>(handle.as_ref())
        .unwrap_or_else(|| panic!("{} is not a dynamic object", handle.identity()));
    match object.field(name) {
        Some(Field::Object(child)) => Arc::clone(child),
        other => panic!("field '{name}' is not an object: {other:?}"),
    }
}

/// Registry with the dynamic test kind and the core snapshot kind.
pub fn test_types() -> TypeRegistry {
    let mut builder = TypeRegistryBuilder::new();
    builder
        .register(DYNAMIC_KIND, dynamic_constructor)
        .unwrap_or_else(|e| panic!("{e}"));
    snapshot::register_types(&mut builder).unwrap_or_else(|e| panic!("{e}"));
    builder.build()
}

// ===========================================================================
// Graph builders
// ===========================================================================

/// `len` dynamic objects where each references the next through `next`.
/// Returned root first.
pub fn linear_chain(registry: &IdentityRegistry, len: usize) -> Vec<ObjectHandle> {
    let mut chain: Vec<ObjectHandle> = Vec::with_capacity(len);
    for depth in (0..len).rev() {
        let mut fields = Fields::new();
        fields.insert("depth".to_string(), Field::Int(depth as i64));
        if let Some(next) = chain.last() {
            fields.insert("next".to_string(), Field::Object(Arc::clone(next)));
        }
        chain.push(Arc::new(DynamicObject::new(registry.allocate(), fields)));
    }
    chain.reverse();
    chain
}

/// A root referencing `width` leaves that all reference one shared base.
pub fn fan_in(registry: &IdentityRegistry, width: usize) -> ObjectHandle {
    let base = dynamic(registry.allocate(), [("base", Field::Bool(true))]);
    let leaves = (0..width)
        .map(|i| {
            Field::Object(dynamic(
                registry.allocate(),
                [("i", Field::Int(i as i64)), ("base", Field::Object(Arc::clone(&base)))],
            ))
        })
        .collect();
    dynamic(registry.allocate(), [("leaves", Field::List(leaves))])
}

// ===========================================================================
// Frames
// ===========================================================================

/// Deterministic NaN-free frame with `n` entities.
pub fn sample_frame(n: usize, seed: u64) -> Frame {
    let base = seed as f32;
    let coordinates = (0..n)
        .map(|i| {
            let mut row = [0.0f32; SPATIAL_DIMS];
            for (k, c) in row.iter_mut().enumerate() {
                *c = base + 0.1 * (i * SPATIAL_DIMS + k) as f32;
            }
            row
        })
        .collect();
    let velocities = (0..n)
        .map(|i| {
            let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
            [sign * 0.5, -0.25 * base, sign * (i as f32 + 1.0)]
        })
        .collect();
    Frame::new(coordinates, velocities, -1.5 * base, 0.5 * n as f32)
        .unwrap_or_else(|e| panic!("sample frame is invalid: {e}"))
}
