//! Identity registry: issues fresh identities and remembers which ones were
//! restored from storage. Pure bookkeeping, no I/O.

use crate::id::ObjectId;
use crate::storable::Storable;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

/// Issues identities of the form `prefix << 64 | counter`.
///
/// The prefix is random per process so identities minted by different
/// processes (or distributed workers) do not collide; the counter guarantees
/// uniqueness within this process.
#[derive(Debug)]
pub struct IdentityRegistry {
    prefix: u64,
    issued: AtomicU64,
    restored: Mutex<HashSet<ObjectId>>,
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityRegistry {
    pub fn new() -> Self {
        let random = uuid::Uuid::new_v4().as_u128();
        Self::with_prefix((random >> 64) as u64)
    }

    /// Registry with a fixed prefix. A zero prefix is bumped to one so no
    /// identity can equal [`ObjectId::UNASSIGNED`].
    pub fn with_prefix(prefix: u64) -> Self {
        Self {
            prefix: prefix.max(1),
            issued: AtomicU64::new(0),
            restored: Mutex::new(HashSet::new()),
        }
    }

    pub fn prefix(&self) -> u64 {
        self.prefix
    }

    /// A fresh identity never issued before by this registry.
    pub fn allocate(&self) -> ObjectId {
        let n = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        ObjectId::from_u128(((self.prefix as u128) << 64) | n as u128)
    }

    /// The identity carried by `object`, or [`ObjectId::UNASSIGNED`].
    pub fn of(&self, object: &dyn Storable) -> ObjectId {
        object.identity()
    }

    /// Record that `id` was rebuilt from storage. Restoring never mints a
    /// new identity.
    pub fn restore(&self, id: ObjectId) {
        if id.is_assigned() {
            self.restored.lock().insert(id);
        }
    }

    /// Whether `id` was issued by this registry or restored into it.
    pub fn is_known(&self, id: ObjectId) -> bool {
        if !id.is_assigned() {
            return false;
        }
        let raw = id.as_u128();
        let issued_here = (raw >> 64) as u64 == self.prefix && {
            let n = raw as u64;
            n >= 1 && n <= self.issued.load(Ordering::Relaxed)
        };
        issued_here || self.restored.lock().contains(&id)
    }

    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }

    pub fn restored_count(&self) -> usize {
        self.restored.lock().len()
    }
}
