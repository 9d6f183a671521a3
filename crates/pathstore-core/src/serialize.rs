//! Flattening objects into records, rebuilding them, and the binary record
//! codec.
//!
//! Flattening replaces every nested storable object with a reference to its
//! identity and stops there, so a record never holds a second object's
//! definition. Unflattening is the inverse and only ever asks a
//! [`Resolver`] for references; it never re-enters the flattener.
//!
//! Records are encoded with `bitcode` behind a versioned header so stores
//! can reject foreign or future data before decoding the payload.

use crate::id::ObjectId;
use crate::storable::{BuildContext, ObjectHandle, Storable, TypeRegistry};
use crate::value::{Field, Fields, Record, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying an encoded record.
pub const RECORD_MAGIC: u32 = 0x0B5E_0001;

/// Current record format version. Increment when breaking the wire format.
pub const FORMAT_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors raised while flattening or rebuilding objects.
#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    /// The resolver could not supply a dependency. Always an ordering bug
    /// upstream, never substituted with a placeholder.
    #[error("unresolved reference {reference} while rebuilding {owner}")]
    UnresolvedReference { owner: ObjectId, reference: ObjectId },
    #[error("no constructor registered for kind '{kind}' (object {id})")]
    UnknownKind { id: ObjectId, kind: String },
    #[error("constructor for {expected} returned an object with identity {found}")]
    IdentityMismatch { expected: ObjectId, found: ObjectId },
    #[error("missing field '{field}'")]
    MissingField { field: String },
    #[error("field '{field}' has type {found}, expected {expected}")]
    WrongType {
        field: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("object {id} has a bulk payload but no bulk store is configured")]
    NoBulkStore { id: ObjectId },
    #[error("invalid payload for {id}: {source}")]
    InvalidPayload {
        id: ObjectId,
        #[source]
        source: crate::bulk::BulkError,
    },
}

/// Errors raised by the binary record codec.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("bitcode encoding failed: {0}")]
    Encode(String),
    #[error("bitcode decoding failed: {0}")]
    Decode(String),
    #[error("invalid magic number: expected 0x{:08X}, got 0x{:08X}", RECORD_MAGIC, .0)]
    InvalidMagic(u32),
    #[error("unsupported format version: expected {}, got {}", FORMAT_VERSION, .0)]
    UnsupportedVersion(u32),
    #[error("record from future version {0} (this build supports up to {FORMAT_VERSION})")]
    FutureVersion(u32),
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Supplies already-reconstructed objects by identity.
pub trait Resolver {
    fn resolve(&self, id: ObjectId) -> Option<ObjectHandle>;
}

impl<F> Resolver for F
where
    F: Fn(ObjectId) -> Option<ObjectHandle>,
{
    fn resolve(&self, id: ObjectId) -> Option<ObjectHandle> {
        self(id)
    }
}

impl Resolver for HashMap<ObjectId, ObjectHandle> {
    fn resolve(&self, id: ObjectId) -> Option<ObjectHandle> {
        self.get(&id).cloned()
    }
}

impl Resolver for BTreeMap<ObjectId, ObjectHandle> {
    fn resolve(&self, id: ObjectId) -> Option<ObjectHandle> {
        self.get(&id).cloned()
    }
}

// ---------------------------------------------------------------------------
// Flatten
// ---------------------------------------------------------------------------

/// Flatten one live field. Objects become references; sequences and maps
/// recurse structurally.
pub fn flatten_field(field: &Field) -> Value {
    match field {
        Field::Null => Value::Null,
        Field::Bool(v) => Value::Bool(*v),
        Field::Int(v) => Value::Int(*v),
        Field::Float(v) => Value::Float(*v),
        Field::Str(v) => Value::Str(v.clone()),
        Field::Floats(v) => Value::Floats(v.clone()),
        Field::Slot(v) => Value::Slot(*v),
        Field::Object(handle) => Value::Ref(handle.identity()),
        Field::List(items) => Value::List(items.iter().map(flatten_field).collect()),
        Field::Map(entries) => Value::Map(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), flatten_field(v)))
                .collect(),
        ),
    }
}

pub fn flatten_fields(fields: &Fields) -> BTreeMap<String, Value> {
    fields
        .iter()
        .map(|(k, v)| (k.clone(), flatten_field(v)))
        .collect()
}

/// Flatten an object into its record.
pub fn flatten(object: &dyn Storable) -> Record {
    Record {
        kind: object.kind().to_string(),
        fields: flatten_fields(&object.to_fields()),
    }
}

// ---------------------------------------------------------------------------
// Unflatten
// ---------------------------------------------------------------------------

/// Rebuild one live field, resolving references through `resolver`.
/// `owner` is only used to label errors.
pub fn unflatten_value(
    owner: ObjectId,
    value: &Value,
    resolver: &dyn Resolver,
) -> Result<Field, SerializeError> {
    Ok(match value {
        Value::Null => Field::Null,
        Value::Bool(v) => Field::Bool(*v),
        Value::Int(v) => Field::Int(*v),
        Value::Float(v) => Field::Float(*v),
        Value::Str(v) => Field::Str(v.clone()),
        Value::Floats(v) => Field::Floats(v.clone()),
        Value::Slot(v) => Field::Slot(*v),
        Value::Ref(id) => Field::Object(resolver.resolve(*id).ok_or(
            SerializeError::UnresolvedReference {
                owner,
                reference: *id,
            },
        )?),
        Value::List(items) => Field::List(
            items
                .iter()
                .map(|v| unflatten_value(owner, v, resolver))
                .collect::<Result<_, _>>()?,
        ),
        Value::Map(entries) => Field::Map(
            entries
                .iter()
                .map(|(k, v)| Ok((k.clone(), unflatten_value(owner, v, resolver)?)))
                .collect::<Result<_, SerializeError>>()?,
        ),
    })
}

pub fn unflatten_fields(
    owner: ObjectId,
    values: &BTreeMap<String, Value>,
    resolver: &dyn Resolver,
) -> Result<Fields, SerializeError> {
    values
        .iter()
        .map(|(k, v)| Ok((k.clone(), unflatten_value(owner, v, resolver)?)))
        .collect()
}

/// Rebuild the object stored under `id`. The constructor must hand back an
/// object carrying exactly `id`; a fresh identity would break every other
/// record that references this one.
pub fn unflatten(
    id: ObjectId,
    record: &Record,
    resolver: &dyn Resolver,
    types: &TypeRegistry,
    ctx: &BuildContext<'_>,
) -> Result<ObjectHandle, SerializeError> {
    let constructor = types
        .get(&record.kind)
        .ok_or_else(|| SerializeError::UnknownKind {
            id,
            kind: record.kind.clone(),
        })?;
    let fields = unflatten_fields(id, &record.fields, resolver)?;
    let object = constructor(id, fields, ctx)?;
    if object.identity() != id {
        return Err(SerializeError::IdentityMismatch {
            expected: id,
            found: object.identity(),
        });
    }
    Ok(object)
}

// ---------------------------------------------------------------------------
// Record codec
// ---------------------------------------------------------------------------

/// Header prepended to every encoded record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordHeader {
    pub magic: u32,
    pub version: u32,
}

impl Default for RecordHeader {
    fn default() -> Self {
        Self {
            magic: RECORD_MAGIC,
            version: FORMAT_VERSION,
        }
    }
}

impl RecordHeader {
    pub fn validate(&self) -> Result<(), CodecError> {
        if self.magic != RECORD_MAGIC {
            return Err(CodecError::InvalidMagic(self.magic));
        }
        if self.version > FORMAT_VERSION {
            return Err(CodecError::FutureVersion(self.version));
        }
        if self.version < FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion(self.version));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct RecordEnvelope {
    header: RecordHeader,
    id: ObjectId,
    record: Record,
}

/// Encode a record together with its owning identity.
pub fn encode_record(id: ObjectId, record: &Record) -> Result<Vec<u8>, CodecError> {
    let envelope = RecordEnvelope {
        header: RecordHeader::default(),
        id,
        record: record.clone(),
    };
    bitcode::serialize(&envelope).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode bytes produced by [`encode_record`]. Returns an error (not a
/// panic) on garbage input or a version mismatch.
pub fn decode_record(data: &[u8]) -> Result<(ObjectId, Record), CodecError> {
    let envelope: RecordEnvelope =
        bitcode::deserialize(data).map_err(|e| CodecError::Decode(e.to_string()))?;
    envelope.header.validate()?;
    Ok((envelope.id, envelope.record))
}
