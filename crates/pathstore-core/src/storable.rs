//! The storable-object contract and the registry of constructors used to
//! rebuild objects from records.

use crate::bulk::{BulkArrayStore, BulkError};
use crate::id::ObjectId;
use crate::serialize::SerializeError;
use crate::value::Fields;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Storable
// ---------------------------------------------------------------------------

/// Upcasting helpers so handles can be downcast to concrete types.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A domain object with a permanent identity that can be flattened into a
/// [`crate::value::Record`].
pub trait Storable: AsAny + fmt::Debug {
    /// The object's identity, or [`ObjectId::UNASSIGNED`].
    fn identity(&self) -> ObjectId;

    /// Type tag matching the constructor registered in [`TypeRegistry`].
    fn kind(&self) -> &'static str;

    /// Logical fields. Nested storable objects appear as
    /// [`crate::value::Field::Object`] and are never expanded here.
    fn to_fields(&self) -> Fields;

    /// Write large numeric payloads to the bulk store before the record is
    /// flattened. Types without bulk payloads keep the default.
    fn persist_payload(&self, _bulk: &BulkArrayStore) -> Result<(), BulkError> {
        Ok(())
    }
}

/// Shared handle to a live storable object. Reference equality of handles
/// (`Arc::ptr_eq`) is the identity-equality the cache guarantees.
pub type ObjectHandle = Arc<dyn Storable>;

/// Borrow a handle's object as a concrete type.
pub fn downcast_ref<T: Storable>(object: &dyn Storable) -> Option<&T> {
    <dyn Storable as AsAny>::as_any(object).downcast_ref::<T>()
}

/// Clone a handle as a concrete `Arc<T>`, sharing the same allocation.
pub fn downcast<T: Storable>(handle: &ObjectHandle) -> Option<Arc<T>> {
    <dyn Storable as AsAny>::into_any(Arc::clone(handle))
        .downcast::<T>()
        .ok()
}

// ---------------------------------------------------------------------------
// Type registry
// ---------------------------------------------------------------------------

/// Extra context handed to constructors during reconstruction.
#[derive(Clone, Copy, Default)]
pub struct BuildContext<'a> {
    /// Bulk store used to create deferred payload handles.
    pub bulk: Option<&'a Arc<BulkArrayStore>>,
}

impl fmt::Debug for BuildContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildContext")
            .field("bulk", &self.bulk.map(|b| b.path().to_path_buf()))
            .finish()
    }
}

/// Rebuilds an object from its identity and resolved fields.
pub type Constructor =
    fn(ObjectId, Fields, &BuildContext<'_>) -> Result<ObjectHandle, SerializeError>;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate kind: {0}")]
    DuplicateKind(String),
}

/// Collects constructors by kind, then freezes into a [`TypeRegistry`].
#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    constructors: BTreeMap<String, Constructor>,
}

impl TypeRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: &str, constructor: Constructor) -> Result<(), RegistryError> {
        if self.constructors.contains_key(kind) {
            return Err(RegistryError::DuplicateKind(kind.to_string()));
        }
        self.constructors.insert(kind.to_string(), constructor);
        Ok(())
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    pub fn build(self) -> TypeRegistry {
        TypeRegistry {
            constructors: self.constructors,
        }
    }
}

/// Immutable kind → constructor table. Frozen after build, safe to share.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    constructors: BTreeMap<String, Constructor>,
}

impl TypeRegistry {
    pub fn get(&self, kind: &str) -> Option<Constructor> {
        self.constructors.get(kind).copied()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.constructors.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{DYNAMIC_KIND, DynamicObject, dynamic_constructor};

    #[test]
    fn register_and_build() {
        let mut builder = TypeRegistryBuilder::new();
        builder.register(DYNAMIC_KIND, dynamic_constructor).unwrap();
        assert!(builder.contains(DYNAMIC_KIND));
        let registry = builder.build();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(DYNAMIC_KIND).is_some());
        assert!(registry.get("nonexistent").is_none());
        assert_eq!(registry.kinds().collect::<Vec<_>>(), vec![DYNAMIC_KIND]);
    }

    #[test]
    fn duplicate_kind_fails() {
        let mut builder = TypeRegistryBuilder::new();
        builder.register(DYNAMIC_KIND, dynamic_constructor).unwrap();
        let err = builder.register(DYNAMIC_KIND, dynamic_constructor).unwrap_err();
        assert_eq!(err.to_string(), format!("duplicate kind: {DYNAMIC_KIND}"));
    }

    #[test]
    fn downcast_shares_allocation() {
        let handle: ObjectHandle =
            Arc::new(DynamicObject::new(ObjectId::from_u128(5), Fields::new()));
        let concrete = downcast::<DynamicObject>(&handle).unwrap();
        assert_eq!(concrete.identity(), ObjectId::from_u128(5));
        assert!(std::ptr::eq(
            Arc::as_ptr(&concrete) as *const u8,
            Arc::as_ptr(&handle) as *const u8
        ));
        assert!(downcast_ref::<DynamicObject>(handle.as_ref()).is_some());
    }
}
