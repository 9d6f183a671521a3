//! Pathstore Core -- identity-preserving persistence for simulation object
//! graphs.
//!
//! Domain objects hold references to other domain objects. This crate
//! persists such graphs as flat records, one per object, and rebuilds them
//! so that every identity maps to exactly one live instance per process.
//!
//! # Save Path
//!
//! 1. **Closure** -- walk the references of the object being saved, stopping
//!    at anything already persisted.
//! 2. **Payloads** -- large numeric arrays go to the append-only bulk store
//!    and are replaced by slot indices.
//! 3. **Records** -- each object is flattened, nested objects becoming
//!    encoded identity references, and written to the record store in one
//!    batch.
//!
//! # Load Path
//!
//! 1. **Discover** -- fetch the record closure of the requested roots in
//!    batches, treating cached objects as leaves.
//! 2. **Order** -- build the dependency graph and sort it dependencies-first;
//!    cycles are rejected.
//! 3. **Construct** -- rebuild objects in order, then restore their
//!    identities and publish them to the cache in one step.
//!
//! Bulk payloads are not read during a load. Reconstructed snapshots hold a
//! slot index and read their frame on first access.
//!
//! # Key Types
//!
//! - [`context::StorageContext`] -- The bundle of registry, cache and stores
//!   every operation runs against.
//! - [`storable::Storable`] -- The contract every persisted object implements.
//! - [`cache::TieredCache`] -- Bounded LRU tier plus a weak overflow tier.
//! - [`graph::DependencyGraph`] -- Reference graph with topological ordering.
//! - [`bulk::BulkArrayStore`] -- Fixed-schema append-only array container.
//! - [`checkpoint::Checkpointing`] -- Per-step checkpoint files for resuming
//!   interrupted steps.

pub mod bulk;
pub mod cache;
pub mod checkpoint;
pub mod context;
pub mod graph;
pub mod id;
pub mod identity;
pub mod reconstruct;
pub mod serialize;
pub mod snapshot;
pub mod storable;
pub mod store;
pub mod value;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
