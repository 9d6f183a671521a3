//! Reconstruction engine: turns stored records back into live objects in
//! dependency order.
//!
//! A load runs in three phases:
//!
//! 1. **Discover** -- walk the transitive closure of the requested roots,
//!    fetching records in batches. Objects already in the cache are leaves
//!    and are not expanded. No lock is held; this is the only phase that
//!    touches the record store.
//! 2. **Order** -- build the dependency graph over the fetched records and
//!    compute a dependencies-first order. Cycles fail the load here.
//! 3. **Construct and commit** -- under the context's load lock, rebuild
//!    each object, then restore every identity in the registry and publish
//!    every object to the cache. Nothing is published until all objects in
//!    the call were built, so a failure leaves the context untouched.

use crate::context::StorageContext;
use crate::graph::{DependencyGraph, GraphError};
use crate::id::ObjectId;
use crate::serialize::{SerializeError, unflatten};
use crate::storable::{BuildContext, ObjectHandle};
use crate::store::StoreError;
use crate::value::Record;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("no record for {id}{}", referrer_suffix(.referenced_by))]
    MissingRecord {
        id: ObjectId,
        /// The object whose record referenced `id`, `None` for a root.
        referenced_by: Option<ObjectId>,
    },
    #[error("dependency graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("reconstruction error: {0}")]
    Serialize(#[from] SerializeError),
    #[error("record store error: {0}")]
    Store(#[from] StoreError),
}

fn referrer_suffix(referenced_by: &Option<ObjectId>) -> String {
    referenced_by
        .map(|owner| format!(" (referenced by {owner})"))
        .unwrap_or_default()
}

impl LoadError {
    /// True when the error means the engine itself broke an ordering
    /// invariant, as opposed to bad or missing stored data.
    pub fn is_internal_bug(&self) -> bool {
        matches!(
            self,
            LoadError::Serialize(SerializeError::UnresolvedReference { .. })
        )
    }
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Result of walking the closure of a set of roots.
#[derive(Debug, Default)]
struct Discovery {
    /// Objects that were already live in the cache.
    resident: BTreeMap<ObjectId, ObjectHandle>,
    /// Records still to be turned into objects.
    records: BTreeMap<ObjectId, Record>,
    /// Number of record-store round trips issued.
    batches: usize,
}

fn fetch(
    ctx: &StorageContext,
    wanted: &BTreeSet<ObjectId>,
) -> Result<(HashMap<ObjectId, Record>, usize), StoreError> {
    let ids: Vec<ObjectId> = wanted.iter().copied().collect();
    let chunks: Vec<BTreeSet<ObjectId>> = ids
        .chunks(ctx.batch_size().max(1))
        .map(|c| c.iter().copied().collect())
        .collect();

    #[cfg(feature = "parallel")]
    let results: Vec<Result<HashMap<ObjectId, Record>, StoreError>> = chunks
        .par_iter()
        .map(|chunk| ctx.store().get_records(chunk))
        .collect();

    #[cfg(not(feature = "parallel"))]
    let results: Vec<Result<HashMap<ObjectId, Record>, StoreError>> = chunks
        .iter()
        .map(|chunk| ctx.store().get_records(chunk))
        .collect();

    let mut fetched = HashMap::with_capacity(wanted.len());
    for result in results {
        fetched.extend(result?);
    }
    Ok((fetched, chunks.len()))
}

fn discover(ctx: &StorageContext, roots: &BTreeSet<ObjectId>) -> Result<Discovery, LoadError> {
    let mut found = Discovery::default();
    let mut referenced_by: BTreeMap<ObjectId, ObjectId> = BTreeMap::new();
    let mut frontier = roots.clone();

    while !frontier.is_empty() {
        let mut wanted = BTreeSet::new();
        for id in frontier {
            if found.resident.contains_key(&id) || found.records.contains_key(&id) {
                continue;
            }
            match ctx.cache().get(&id) {
                Some(object) => {
                    found.resident.insert(id, object);
                }
                None => {
                    wanted.insert(id);
                }
            }
        }
        if wanted.is_empty() {
            break;
        }

        let (mut fetched, batches) = fetch(ctx, &wanted)?;
        found.batches += batches;
        debug!(requested = wanted.len(), batches, "fetched record batch");

        let mut next = BTreeSet::new();
        for id in wanted {
            let record = fetched.remove(&id).ok_or_else(|| LoadError::MissingRecord {
                id,
                referenced_by: referenced_by.get(&id).copied(),
            })?;
            for reference in record.references() {
                referenced_by.entry(reference).or_insert(id);
                next.insert(reference);
            }
            found.records.insert(id, record);
        }
        frontier = next;
    }
    Ok(found)
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Load `roots` and everything they transitively reference.
///
/// The returned map holds every object of the closure that was either
/// already resident or rebuilt by this call. Loading an identity that is
/// already cached returns the cached instance and never reads the store.
pub fn load(
    ctx: &StorageContext,
    roots: impl IntoIterator<Item = ObjectId>,
) -> Result<BTreeMap<ObjectId, ObjectHandle>, LoadError> {
    let roots: BTreeSet<ObjectId> = roots.into_iter().collect();
    let Discovery {
        resident,
        records,
        batches,
    } = discover(ctx, &roots)?;

    let mut loaded = resident;
    if records.is_empty() {
        return Ok(loaded);
    }

    let order = DependencyGraph::from_records(&records)?.topological_order()?;

    let _guard = ctx.load_lock().lock();
    let build_ctx = BuildContext { bulk: ctx.bulk() };
    let mut built: BTreeMap<ObjectId, ObjectHandle> = BTreeMap::new();
    let mut reused = 0usize;
    for id in order {
        let Some(record) = records.get(&id) else {
            continue;
        };
        // Another load may have published this object since discovery.
        if let Some(existing) = ctx.cache().get(&id) {
            built.insert(id, existing);
            reused += 1;
            continue;
        }
        let object = {
            let resolver = |reference: ObjectId| -> Option<ObjectHandle> {
                loaded
                    .get(&reference)
                    .or_else(|| built.get(&reference))
                    .cloned()
            };
            unflatten(id, record, &resolver, ctx.types(), &build_ctx)?
        };
        debug!(%id, kind = %record.kind, "constructed object");
        built.insert(id, object);
    }

    let constructed = built.len() - reused;
    for (id, object) in built {
        ctx.registry().restore(id);
        let winner = ctx.cache().insert_if_absent(id, object);
        loaded.insert(id, winner);
    }

    info!(
        roots = roots.len(),
        constructed,
        reused,
        batches,
        "load complete"
    );
    Ok(loaded)
}
