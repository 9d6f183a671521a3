//! Per-step checkpoints of intermediate results.
//!
//! Each simulation step gets its own directory,
//! `root/<simulation>/<step>/`, holding one JSON file per recorded result:
//!
//! ```text
//! <owner hex>-<operation>-<sequence>.json    {"data": {...}, "next": {...} | null}
//! ```
//!
//! Storable objects inside a result are saved through the storage context
//! and written as encoded identity references, so resuming only needs the
//! record store to bring them back. Once a step has been committed
//! elsewhere its directory is discarded.

use crate::context::{SaveError, StorageContext};
use crate::id::{ObjectId, SlotIndex};
use crate::reconstruct::LoadError;
use crate::serialize::{SerializeError, flatten_fields, unflatten_fields};
use crate::value::{Fields, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Root directory used when none is configured.
pub const DEFAULT_CHECKPOINT_DIR: &str = ".pathstore_checkpoints";

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("checkpoint directory already exists: {}", .0.display())]
    Conflict(PathBuf),
    #[error("invalid operation name '{0}'")]
    InvalidOperation(String),
    #[error("checkpoint I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed checkpoint {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("checkpoint serialization error: {0}")]
    Serialize(#[from] SerializeError),
    #[error("checkpoint load error: {0}")]
    Load(#[from] LoadError),
    #[error("checkpoint save error: {0}")]
    Save(#[from] SaveError),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

/// [`Value`] as written to a checkpoint file. JSON has no NaN or infinity,
/// so non-finite floats are kept as bit patterns. Finite floats use the same
/// representation as [`Value`].
#[derive(Debug, Serialize, Deserialize)]
enum JsonValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    FloatBits(u64),
    Str(String),
    Floats(Vec<f32>),
    FloatsBits(Vec<u32>),
    Slot(SlotIndex),
    Ref(ObjectId),
    List(Vec<JsonValue>),
    Map(BTreeMap<String, JsonValue>),
}

impl From<Value> for JsonValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(b),
            Value::Int(i) => JsonValue::Int(i),
            Value::Float(f) if f.is_finite() => JsonValue::Float(f),
            Value::Float(f) => JsonValue::FloatBits(f.to_bits()),
            Value::Str(s) => JsonValue::Str(s),
            Value::Floats(v) if v.iter().all(|f| f.is_finite()) => JsonValue::Floats(v),
            Value::Floats(v) => JsonValue::FloatsBits(v.into_iter().map(f32::to_bits).collect()),
            Value::Slot(slot) => JsonValue::Slot(slot),
            Value::Ref(id) => JsonValue::Ref(id),
            Value::List(items) => JsonValue::List(items.into_iter().map(Into::into).collect()),
            Value::Map(entries) => JsonValue::Map(to_json(entries)),
        }
    }
}

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Int(i) => Value::Int(i),
            JsonValue::Float(f) => Value::Float(f),
            JsonValue::FloatBits(bits) => Value::Float(f64::from_bits(bits)),
            JsonValue::Str(s) => Value::Str(s),
            JsonValue::Floats(v) => Value::Floats(v),
            JsonValue::FloatsBits(v) => Value::Floats(v.into_iter().map(f32::from_bits).collect()),
            JsonValue::Slot(slot) => Value::Slot(slot),
            JsonValue::Ref(id) => Value::Ref(id),
            JsonValue::List(items) => Value::List(items.into_iter().map(Into::into).collect()),
            JsonValue::Map(entries) => Value::Map(from_json(entries)),
        }
    }
}

fn to_json(values: BTreeMap<String, Value>) -> BTreeMap<String, JsonValue> {
    values.into_iter().map(|(k, v)| (k, v.into())).collect()
}

fn from_json(values: BTreeMap<String, JsonValue>) -> BTreeMap<String, Value> {
    values.into_iter().map(|(k, v)| (k, v.into())).collect()
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    data: BTreeMap<String, JsonValue>,
    next: Option<BTreeMap<String, JsonValue>>,
}

/// A checkpoint read back with every reference resolved to a live object.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointEntry {
    pub data: Fields,
    /// Description of the next pending sub-operation, if any.
    pub next: Option<Fields>,
}

// ---------------------------------------------------------------------------
// Checkpointing
// ---------------------------------------------------------------------------

/// Factory for per-step checkpoint writers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpointing {
    root_dir: Option<PathBuf>,
}

impl Default for Checkpointing {
    fn default() -> Self {
        Self::new(DEFAULT_CHECKPOINT_DIR)
    }
}

impl Checkpointing {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: Some(root_dir.into()),
        }
    }

    /// Checkpointing turned off: nothing is written and nothing resumes.
    pub fn disabled() -> Self {
        Self { root_dir: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.root_dir.is_some()
    }

    pub fn root_dir(&self) -> Option<&Path> {
        self.root_dir.as_deref()
    }

    pub fn step_dir(&self, simulation: ObjectId, step: u64) -> Option<PathBuf> {
        self.root_dir
            .as_ref()
            .map(|root| root.join(simulation.to_hex()).join(step.to_string()))
    }

    /// Start checkpointing a new step. The step directory must not exist.
    pub fn create_step(
        &self,
        simulation: ObjectId,
        step: u64,
    ) -> Result<StepCheckpoints, CheckpointError> {
        let Some(dir) = self.step_dir(simulation, step) else {
            return Ok(StepCheckpoints::disabled());
        };
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent).map_err(io_error(parent))?;
        }
        match fs::create_dir(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(CheckpointError::Conflict(dir));
            }
            Err(e) => return Err(io_error(&dir)(e)),
        }
        info!(%simulation, step, dir = %dir.display(), "created checkpoint step");
        Ok(StepCheckpoints::at(dir))
    }

    /// Reopen the directory of an interrupted step, or `None` if the step
    /// never checkpointed anything.
    pub fn resume_step(
        &self,
        simulation: ObjectId,
        step: u64,
    ) -> Result<Option<StepCheckpoints>, CheckpointError> {
        let Some(dir) = self.step_dir(simulation, step) else {
            return Ok(None);
        };
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => {
                info!(%simulation, step, dir = %dir.display(), "resuming checkpoint step");
                Ok(Some(StepCheckpoints::at(dir)))
            }
            Ok(_) => Err(CheckpointError::Conflict(dir)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&dir)(e)),
        }
    }
}

// ---------------------------------------------------------------------------
// StepCheckpoints
// ---------------------------------------------------------------------------

/// Checkpoint writer and reader for one simulation step.
///
/// Sequence numbers count calls per `(owner, operation)` pair, so a resumed
/// step that replays the same calls in the same order lands on the same
/// files.
#[derive(Debug)]
pub struct StepCheckpoints {
    dir: Option<PathBuf>,
    sequences: HashMap<(ObjectId, String), u64>,
}

impl StepCheckpoints {
    fn at(dir: PathBuf) -> Self {
        Self {
            dir: Some(dir),
            sequences: HashMap::new(),
        }
    }

    fn disabled() -> Self {
        Self {
            dir: None,
            sequences: HashMap::new(),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    /// Claim the next sequence number for `(owner, operation)`.
    pub fn next_sequence(&mut self, owner: ObjectId, operation: &str) -> u64 {
        let counter = self
            .sequences
            .entry((owner, operation.to_string()))
            .or_insert(0);
        let seq = *counter;
        *counter += 1;
        seq
    }

    fn file_path(
        &self,
        owner: ObjectId,
        operation: &str,
        seq: u64,
    ) -> Result<Option<PathBuf>, CheckpointError> {
        if operation.is_empty()
            || !operation
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        {
            return Err(CheckpointError::InvalidOperation(operation.to_string()));
        }
        Ok(self
            .dir
            .as_ref()
            .map(|dir| dir.join(format!("{}-{operation}-{seq}.json", owner.to_hex()))))
    }

    /// Record a result for `(owner, operation)` under the next sequence
    /// number and return that number.
    pub fn record(
        &mut self,
        ctx: &StorageContext,
        owner: ObjectId,
        operation: &str,
        data: &Fields,
        next: Option<&Fields>,
    ) -> Result<u64, CheckpointError> {
        let seq = self.next_sequence(owner, operation);
        self.write_entry(ctx, owner, operation, seq, data, next)?;
        Ok(seq)
    }

    fn write_entry(
        &self,
        ctx: &StorageContext,
        owner: ObjectId,
        operation: &str,
        seq: u64,
        data: &Fields,
        next: Option<&Fields>,
    ) -> Result<(), CheckpointError> {
        let Some(path) = self.file_path(owner, operation, seq)? else {
            return Ok(());
        };

        // Referenced objects must be resolvable from the store on resume.
        for field in data.values().chain(next.into_iter().flat_map(|n| n.values())) {
            let mut result = Ok(());
            field.for_each_object(&mut |object| {
                if result.is_ok() {
                    result = ctx.save(object).map(|_| ());
                }
            });
            result?;
        }

        let file = CheckpointFile {
            data: to_json(flatten_fields(data)),
            next: next.map(|n| to_json(flatten_fields(n))),
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(|source| CheckpointError::Json {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &bytes).map_err(io_error(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_error(&path))?;
        debug!(%owner, operation, seq, path = %path.display(), "wrote checkpoint");
        Ok(())
    }

    /// Read back entry `seq` for `(owner, operation)`. `None` means no
    /// checkpoint exists and the caller should compute fresh.
    pub fn resume(
        &self,
        ctx: &StorageContext,
        owner: ObjectId,
        operation: &str,
        seq: u64,
    ) -> Result<Option<CheckpointEntry>, CheckpointError> {
        let Some(path) = self.file_path(owner, operation, seq)? else {
            return Ok(None);
        };
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path)(e)),
        };
        let file: CheckpointFile =
            serde_json::from_slice(&bytes).map_err(|source| CheckpointError::Json {
                path: path.clone(),
                source,
            })?;

        let flat_data = from_json(file.data);
        let flat_next = file.next.map(from_json);
        let mut references = BTreeSet::new();
        for value in flat_data.values().chain(flat_next.iter().flat_map(|n| n.values())) {
            value.collect_references(&mut references);
        }

        let objects = ctx.load(references)?;
        let data = unflatten_fields(owner, &flat_data, &objects)?;
        let next = flat_next
            .as_ref()
            .map(|n| unflatten_fields(owner, n, &objects))
            .transpose()?;
        debug!(%owner, operation, seq, "resumed checkpoint");
        Ok(Some(CheckpointEntry { data, next }))
    }

    /// Resume the next entry for `(owner, operation)` if one exists,
    /// otherwise run `compute` and checkpoint its result. Used for results
    /// that are not reproducible, such as random choices.
    pub fn checkpointed<F>(
        &mut self,
        ctx: &StorageContext,
        owner: ObjectId,
        operation: &str,
        compute: F,
    ) -> Result<Fields, CheckpointError>
    where
        F: FnOnce() -> Fields,
    {
        let seq = self.next_sequence(owner, operation);
        if let Some(entry) = self.resume(ctx, owner, operation, seq)? {
            return Ok(entry.data);
        }
        let data = compute();
        self.write_entry(ctx, owner, operation, seq, &data, None)?;
        Ok(data)
    }

    /// Delete the step directory. Only call once the step has been
    /// committed elsewhere.
    pub fn discard(self) -> Result<(), CheckpointError> {
        let Some(dir) = self.dir else {
            return Ok(());
        };
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&dir)(e)),
        }
        info!(dir = %dir.display(), "discarded checkpoint step");
        Ok(())
    }
}
