//! Flat records and live field values.
//!
//! A [`Record`] is what lands in a store: primitives plus encoded identity
//! references. A [`Field`] is the live counterpart handed to and produced by
//! storable types, where references are actual object handles. The two
//! shapes mirror each other one-to-one; [`crate::serialize`] converts
//! between them.

use crate::id::{ObjectId, SlotIndex};
use crate::serialize::SerializeError;
use crate::storable::ObjectHandle;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

// ---------------------------------------------------------------------------
// Flat values
// ---------------------------------------------------------------------------

/// A flattened field value. Never contains a nested object definition, only
/// [`Value::Ref`] to one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Inline numeric array.
    Floats(Vec<f32>),
    /// Numeric payload kept in the bulk array store.
    Slot(SlotIndex),
    /// Reference to another storable object.
    Ref(ObjectId),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Collect every identity referenced anywhere under this value.
    pub fn collect_references(&self, out: &mut BTreeSet<ObjectId>) {
        match self {
            Value::Ref(id) => {
                out.insert(*id);
            }
            Value::List(items) => items.iter().for_each(|v| v.collect_references(out)),
            Value::Map(entries) => entries.values().for_each(|v| v.collect_references(out)),
            _ => {}
        }
    }

    pub fn as_ref_id(&self) -> Option<ObjectId> {
        match self {
            Value::Ref(id) => Some(*id),
            _ => None,
        }
    }
}

/// Flattened representation of one storable object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Type tag used to pick a constructor on reload.
    pub kind: String,
    pub fields: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field insertion.
    pub fn with(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Every identity this record references.
    pub fn references(&self) -> BTreeSet<ObjectId> {
        let mut out = BTreeSet::new();
        for value in self.fields.values() {
            value.collect_references(&mut out);
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Live fields
// ---------------------------------------------------------------------------

/// A live field value as produced by [`crate::storable::Storable::to_fields`].
#[derive(Debug, Clone)]
pub enum Field {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Floats(Vec<f32>),
    Slot(SlotIndex),
    Object(ObjectHandle),
    List(Vec<Field>),
    Map(BTreeMap<String, Field>),
}

/// Named fields of one object.
pub type Fields = BTreeMap<String, Field>;

impl PartialEq for Field {
    /// Objects compare by identity; everything else structurally.
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Field::Null, Field::Null) => true,
            (Field::Bool(a), Field::Bool(b)) => a == b,
            (Field::Int(a), Field::Int(b)) => a == b,
            (Field::Float(a), Field::Float(b)) => a == b,
            (Field::Str(a), Field::Str(b)) => a == b,
            (Field::Floats(a), Field::Floats(b)) => a == b,
            (Field::Slot(a), Field::Slot(b)) => a == b,
            (Field::Object(a), Field::Object(b)) => a.identity() == b.identity(),
            (Field::List(a), Field::List(b)) => a == b,
            (Field::Map(a), Field::Map(b)) => a == b,
            _ => false,
        }
    }
}

impl Field {
    pub fn type_name(&self) -> &'static str {
        match self {
            Field::Null => "null",
            Field::Bool(_) => "bool",
            Field::Int(_) => "int",
            Field::Float(_) => "float",
            Field::Str(_) => "string",
            Field::Floats(_) => "floats",
            Field::Slot(_) => "slot",
            Field::Object(_) => "object",
            Field::List(_) => "list",
            Field::Map(_) => "map",
        }
    }

    /// Visit every object handle directly reachable from this field. Does
    /// not descend into the objects themselves.
    pub fn for_each_object(&self, f: &mut dyn FnMut(&ObjectHandle)) {
        match self {
            Field::Object(handle) => f(handle),
            Field::List(items) => items.iter().for_each(|i| i.for_each_object(f)),
            Field::Map(entries) => entries.values().for_each(|v| v.for_each_object(f)),
            _ => {}
        }
    }
}

impl From<bool> for Field {
    fn from(v: bool) -> Self {
        Field::Bool(v)
    }
}

impl From<i64> for Field {
    fn from(v: i64) -> Self {
        Field::Int(v)
    }
}

impl From<f64> for Field {
    fn from(v: f64) -> Self {
        Field::Float(v)
    }
}

impl From<&str> for Field {
    fn from(v: &str) -> Self {
        Field::Str(v.to_string())
    }
}

impl From<String> for Field {
    fn from(v: String) -> Self {
        Field::Str(v)
    }
}

impl From<ObjectHandle> for Field {
    fn from(v: ObjectHandle) -> Self {
        Field::Object(v)
    }
}

impl<T: Into<Field>> From<Option<T>> for Field {
    fn from(v: Option<T>) -> Self {
        v.map_or(Field::Null, Into::into)
    }
}

// ---------------------------------------------------------------------------
// Typed accessors used by constructors
// ---------------------------------------------------------------------------

/// Typed extraction from [`Fields`], consuming the entry.
pub trait FieldsExt {
    fn take(&mut self, name: &str) -> Result<Field, SerializeError>;
    fn take_bool(&mut self, name: &str) -> Result<bool, SerializeError>;
    fn take_int(&mut self, name: &str) -> Result<i64, SerializeError>;
    fn take_float(&mut self, name: &str) -> Result<f64, SerializeError>;
    fn take_str(&mut self, name: &str) -> Result<String, SerializeError>;
    fn take_object(&mut self, name: &str) -> Result<ObjectHandle, SerializeError>;
    /// `Null` or a missing entry map to `None`.
    fn take_optional_object(&mut self, name: &str) -> Result<Option<ObjectHandle>, SerializeError>;
    fn take_objects(&mut self, name: &str) -> Result<Vec<ObjectHandle>, SerializeError>;
    fn take_map(&mut self, name: &str) -> Result<Fields, SerializeError>;
}

fn wrong_type(name: &str, expected: &'static str, found: &Field) -> SerializeError {
    SerializeError::WrongType {
        field: name.to_string(),
        expected,
        found: found.type_name(),
    }
}

impl FieldsExt for Fields {
    fn take(&mut self, name: &str) -> Result<Field, SerializeError> {
        self.remove(name).ok_or_else(|| SerializeError::MissingField {
            field: name.to_string(),
        })
    }

    fn take_bool(&mut self, name: &str) -> Result<bool, SerializeError> {
        match self.take(name)? {
            Field::Bool(v) => Ok(v),
            other => Err(wrong_type(name, "bool", &other)),
        }
    }

    fn take_int(&mut self, name: &str) -> Result<i64, SerializeError> {
        match self.take(name)? {
            Field::Int(v) => Ok(v),
            other => Err(wrong_type(name, "int", &other)),
        }
    }

    fn take_float(&mut self, name: &str) -> Result<f64, SerializeError> {
        match self.take(name)? {
            Field::Float(v) => Ok(v),
            Field::Int(v) => Ok(v as f64),
            other => Err(wrong_type(name, "float", &other)),
        }
    }

    fn take_str(&mut self, name: &str) -> Result<String, SerializeError> {
        match self.take(name)? {
            Field::Str(v) => Ok(v),
            other => Err(wrong_type(name, "string", &other)),
        }
    }

    fn take_object(&mut self, name: &str) -> Result<ObjectHandle, SerializeError> {
        match self.take(name)? {
            Field::Object(v) => Ok(v),
            other => Err(wrong_type(name, "object", &other)),
        }
    }

    fn take_optional_object(&mut self, name: &str) -> Result<Option<ObjectHandle>, SerializeError> {
        match self.remove(name) {
            None | Some(Field::Null) => Ok(None),
            Some(Field::Object(v)) => Ok(Some(v)),
            Some(other) => Err(wrong_type(name, "object", &other)),
        }
    }

    fn take_objects(&mut self, name: &str) -> Result<Vec<ObjectHandle>, SerializeError> {
        match self.take(name)? {
            Field::List(items) => items
                .into_iter()
                .map(|item| match item {
                    Field::Object(v) => Ok(v),
                    other => Err(wrong_type(name, "object", &other)),
                })
                .collect(),
            other => Err(wrong_type(name, "list", &other)),
        }
    }

    fn take_map(&mut self, name: &str) -> Result<Fields, SerializeError> {
        match self.take(name)? {
            Field::Map(v) => Ok(v),
            other => Err(wrong_type(name, "map", &other)),
        }
    }
}
