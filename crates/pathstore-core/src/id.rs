use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Prefix of the encoded form of an identity reference.
pub const ENCODED_PREFIX: &str = "UUID(";
/// Suffix of the encoded form of an identity reference.
pub const ENCODED_SUFFIX: &str = ")";

/// Permanent identity of one storable object. Cheap to copy and compare.
///
/// Assigned once when the object is created in memory and restored verbatim
/// when the object is rebuilt from storage. The value `0` is reserved as the
/// "unassigned" sentinel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId(u128);

impl ObjectId {
    /// Sentinel for objects that never received an identity.
    pub const UNASSIGNED: ObjectId = ObjectId(0);

    pub const fn from_u128(value: u128) -> Self {
        Self(value)
    }

    pub const fn as_u128(self) -> u128 {
        self.0
    }

    pub const fn is_assigned(self) -> bool {
        self.0 != 0
    }

    /// Encoded reference form, e.g. `UUID(0000000000000001000000000000002a)`.
    pub fn encode(self) -> String {
        format!("{ENCODED_PREFIX}{:032x}{ENCODED_SUFFIX}", self.0)
    }

    /// Decode the output of [`ObjectId::encode`]. Returns `None` for any
    /// string that is not an encoded reference.
    pub fn decode(encoded: &str) -> Option<Self> {
        let hex = encoded
            .strip_prefix(ENCODED_PREFIX)?
            .strip_suffix(ENCODED_SUFFIX)?;
        if hex.is_empty() || hex.len() > 32 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u128::from_str_radix(hex, 16).ok().map(Self)
    }

    /// Whether `s` is an encoded identity reference.
    pub fn is_encoded(s: &str) -> bool {
        Self::decode(s).is_some()
    }

    /// Short hex form used in file names.
    pub fn to_hex(self) -> String {
        format!("{:032x}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", uuid::Uuid::from_u128(self.0).hyphenated())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

struct ObjectIdVisitor;

impl Visitor<'_> for ObjectIdVisitor {
    type Value = ObjectId;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("an encoded identity such as UUID(<hex>)")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<ObjectId, E> {
        ObjectId::decode(v).ok_or_else(|| E::invalid_value(de::Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(ObjectIdVisitor)
    }
}

/// Index into the bulk array store. Slot `0` means "never written".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SlotIndex(pub u64);

impl SlotIndex {
    pub const UNWRITTEN: SlotIndex = SlotIndex(0);

    pub const fn is_written(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}
