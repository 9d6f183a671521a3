//! Append-only bulk array store for per-snapshot numeric payloads.
//!
//! # File layout
//!
//! ```text
//! [magic: u32 LE][header_len: u32 LE][bitcode BulkHeader][row 1][row 2]...
//! ```
//!
//! Every row has the same size: `entity_count * 3` coordinates, the same
//! number of velocities, then potential and kinetic energy, all little-endian
//! `f32`. Slot `n` lives in row `n`; slot 0 is the "unwritten" sentinel and
//! never has a row.

use crate::cache::TieredCache;
use crate::id::{ObjectId, SlotIndex};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Magic number identifying a bulk array file.
pub const BULK_MAGIC: u32 = 0x0B5E_B01C;

/// Current bulk header version.
pub const BULK_VERSION: u32 = 1;

/// Size of the fixed spatial axis.
pub const SPATIAL_DIMS: usize = 3;

/// Default number of decoded frames kept resident.
pub const DEFAULT_FRAME_CACHE: usize = 64;

const F32_BYTES: usize = 4;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BulkError {
    #[error("{slot} out of range (store holds {count} slots)")]
    SlotRange { slot: SlotIndex, count: u64 },
    #[error("corrupt state{}: {reason}", owner_suffix(.owner))]
    CorruptState {
        owner: Option<ObjectId>,
        reason: String,
    },
    #[error("frame has {found} entities, store expects {expected}")]
    ShapeMismatch { expected: usize, found: usize },
    #[error("invalid bulk header in {path}: {reason}")]
    InvalidHeader { path: PathBuf, reason: String },
    #[error("bulk store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn owner_suffix(owner: &Option<ObjectId>) -> String {
    owner.map(|id| format!(" in {id}")).unwrap_or_default()
}

impl BulkError {
    /// Attach the owning object to a `CorruptState` error.
    pub fn with_owner(self, id: ObjectId) -> Self {
        match self {
            BulkError::CorruptState { owner: None, reason } => BulkError::CorruptState {
                owner: Some(id),
                reason,
            },
            other => other,
        }
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One snapshot's numeric payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    coordinates: Vec<[f32; SPATIAL_DIMS]>,
    velocities: Vec<[f32; SPATIAL_DIMS]>,
    potential: f32,
    kinetic: f32,
}

impl Frame {
    /// Validates the payload: coordinates must be NaN-free and both arrays
    /// must have the same number of rows.
    pub fn new(
        coordinates: Vec<[f32; SPATIAL_DIMS]>,
        velocities: Vec<[f32; SPATIAL_DIMS]>,
        potential: f32,
        kinetic: f32,
    ) -> Result<Self, BulkError> {
        if coordinates.len() != velocities.len() {
            return Err(BulkError::ShapeMismatch {
                expected: coordinates.len(),
                found: velocities.len(),
            });
        }
        if let Some(entity) = coordinates
            .iter()
            .position(|row| row.iter().any(|c| c.is_nan()))
        {
            return Err(BulkError::CorruptState {
                owner: None,
                reason: format!("NaN in coordinates of entity {entity}"),
            });
        }
        Ok(Self {
            coordinates,
            velocities,
            potential,
            kinetic,
        })
    }

    /// Build from flat `[x0, y0, z0, x1, ...]` arrays.
    pub fn from_flat(
        coordinates: &[f32],
        velocities: &[f32],
        potential: f32,
        kinetic: f32,
    ) -> Result<Self, BulkError> {
        Self::new(rows(coordinates)?, rows(velocities)?, potential, kinetic)
    }

    pub fn coordinates(&self) -> &[[f32; SPATIAL_DIMS]] {
        &self.coordinates
    }

    pub fn velocities(&self) -> &[[f32; SPATIAL_DIMS]] {
        &self.velocities
    }

    pub fn flat_coordinates(&self) -> Vec<f32> {
        self.coordinates.iter().flatten().copied().collect()
    }

    pub fn flat_velocities(&self) -> Vec<f32> {
        self.velocities.iter().flatten().copied().collect()
    }

    pub fn potential(&self) -> f32 {
        self.potential
    }

    pub fn kinetic(&self) -> f32 {
        self.kinetic
    }

    pub fn total_energy(&self) -> f32 {
        self.potential + self.kinetic
    }

    pub fn n_entities(&self) -> usize {
        self.coordinates.len()
    }

    /// The time-reversed frame: same positions, negated velocities.
    pub fn reversed(&self) -> Self {
        Self {
            coordinates: self.coordinates.clone(),
            velocities: self
                .velocities
                .iter()
                .map(|v| [-v[0], -v[1], -v[2]])
                .collect(),
            potential: self.potential,
            kinetic: self.kinetic,
        }
    }
}

fn rows(flat: &[f32]) -> Result<Vec<[f32; SPATIAL_DIMS]>, BulkError> {
    if flat.len() % SPATIAL_DIMS != 0 {
        return Err(BulkError::CorruptState {
            owner: None,
            reason: format!(
                "flat array of length {} is not a multiple of {SPATIAL_DIMS}",
                flat.len()
            ),
        });
    }
    Ok(flat
        .chunks_exact(SPATIAL_DIMS)
        .map(|c| [c[0], c[1], c[2]])
        .collect())
}

// ---------------------------------------------------------------------------
// Header
// ---------------------------------------------------------------------------

/// Unit attributes recorded in the header. Conversion is left to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkUnits {
    pub length: String,
    pub velocity: String,
    pub energy: String,
}

impl Default for BulkUnits {
    fn default() -> Self {
        Self {
            length: "nm".to_string(),
            velocity: "nm/ps".to_string(),
            energy: "kJ/mol".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BulkHeader {
    version: u32,
    entity_count: u32,
    spatial: u32,
    units: BulkUnits,
    /// Variable name -> human readable description.
    long_names: BTreeMap<String, String>,
}

impl BulkHeader {
    fn new(entity_count: u32, units: BulkUnits) -> Self {
        let long_names = [
            ("coordinates", "coordinate array of every entity, per slot"),
            ("velocities", "velocity array of every entity, per slot"),
            ("potential", "potential energy, per slot"),
            ("kinetic", "kinetic energy, per slot"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            version: BULK_VERSION,
            entity_count,
            spatial: SPATIAL_DIMS as u32,
            units,
            long_names,
        }
    }

    fn row_size(&self) -> u64 {
        let values = 2 * self.entity_count as usize * SPATIAL_DIMS + 2;
        (values * F32_BYTES) as u64
    }
}

// ---------------------------------------------------------------------------
// BulkArrayStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct BulkFile {
    file: File,
    /// Number of written slots.
    count: u64,
}

/// Append-only container of [`Frame`]s addressed by [`SlotIndex`].
pub struct BulkArrayStore {
    path: PathBuf,
    header: BulkHeader,
    data_start: u64,
    state: Mutex<BulkFile>,
    frames: TieredCache<SlotIndex, Frame>,
    disk_reads: AtomicU64,
}

impl std::fmt::Debug for BulkArrayStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BulkArrayStore")
            .field("path", &self.path)
            .field("entity_count", &self.header.entity_count)
            .field("len", &self.len())
            .finish()
    }
}

impl BulkArrayStore {
    /// Create a new store. Fails if `path` already exists.
    pub fn create(path: &Path, entity_count: usize) -> Result<Self, BulkError> {
        Self::create_with_units(path, entity_count, BulkUnits::default())
    }

    pub fn create_with_units(
        path: &Path,
        entity_count: usize,
        units: BulkUnits,
    ) -> Result<Self, BulkError> {
        let io_err = |source| BulkError::Io {
            path: path.to_path_buf(),
            source,
        };
        let entity_count = u32::try_from(entity_count).map_err(|_| BulkError::InvalidHeader {
            path: path.to_path_buf(),
            reason: format!("entity count {entity_count} does not fit in u32"),
        })?;
        let header = BulkHeader::new(entity_count, units);
        let header_bytes = bitcode::serialize(&header).map_err(|e| BulkError::InvalidHeader {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let header_len = u32::try_from(header_bytes.len()).map_err(|_| BulkError::InvalidHeader {
            path: path.to_path_buf(),
            reason: "header too large".to_string(),
        })?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(io_err)?;
        file.write_all(&BULK_MAGIC.to_le_bytes()).map_err(io_err)?;
        file.write_all(&header_len.to_le_bytes()).map_err(io_err)?;
        file.write_all(&header_bytes).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;

        debug!(path = %path.display(), entity_count, "created bulk store");
        Ok(Self::assemble(
            path,
            header,
            8 + header_len as u64,
            BulkFile { file, count: 0 },
        ))
    }

    /// Open an existing store, validating its header. A partially written
    /// trailing row is cut off.
    pub fn open(path: &Path) -> Result<Self, BulkError> {
        let io_err = |source| BulkError::Io {
            path: path.to_path_buf(),
            source,
        };
        let invalid = |reason: String| BulkError::InvalidHeader {
            path: path.to_path_buf(),
            reason,
        };

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_err)?;
        let file_len = file.metadata().map_err(io_err)?.len();
        if file_len < 8 {
            return Err(invalid(format!("file is only {file_len} bytes")));
        }

        let mut word = [0u8; 4];
        file.read_exact(&mut word).map_err(io_err)?;
        let magic = u32::from_le_bytes(word);
        if magic != BULK_MAGIC {
            return Err(invalid(format!(
                "expected magic 0x{BULK_MAGIC:08X}, got 0x{magic:08X}"
            )));
        }
        file.read_exact(&mut word).map_err(io_err)?;
        let header_len = u32::from_le_bytes(word) as u64;
        if 8 + header_len > file_len {
            return Err(invalid(format!(
                "header length {header_len} exceeds file size {file_len}"
            )));
        }
        let mut header_bytes = vec![0u8; header_len as usize];
        file.read_exact(&mut header_bytes).map_err(io_err)?;
        let header: BulkHeader =
            bitcode::deserialize(&header_bytes).map_err(|e| invalid(e.to_string()))?;
        if header.version == 0 || header.version > BULK_VERSION {
            return Err(invalid(format!("unsupported version {}", header.version)));
        }
        if header.spatial as usize != SPATIAL_DIMS {
            return Err(invalid(format!(
                "spatial axis is {}, expected {SPATIAL_DIMS}",
                header.spatial
            )));
        }

        let data_start = 8 + header_len;
        let row_size = header.row_size();
        let data_len = file_len - data_start;
        let count = data_len / row_size;
        let valid_end = data_start + count * row_size;
        if valid_end < file_len {
            warn!(
                path = %path.display(),
                slots = count,
                dropped_bytes = file_len - valid_end,
                "discarding partial trailing row in bulk store"
            );
            file.set_len(valid_end).map_err(io_err)?;
        }

        debug!(path = %path.display(), slots = count, "opened bulk store");
        Ok(Self::assemble(path, header, data_start, BulkFile { file, count }))
    }

    fn assemble(path: &Path, header: BulkHeader, data_start: u64, state: BulkFile) -> Self {
        Self {
            path: path.to_path_buf(),
            header,
            data_start,
            state: Mutex::new(state),
            frames: TieredCache::new(DEFAULT_FRAME_CACHE),
            disk_reads: AtomicU64::new(0),
        }
    }

    fn io_err(&self, source: io::Error) -> BulkError {
        BulkError::Io {
            path: self.path.clone(),
            source,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entity_count(&self) -> usize {
        self.header.entity_count as usize
    }

    pub fn units(&self) -> &BulkUnits {
        &self.header.units
    }

    pub fn long_name(&self, variable: &str) -> Option<&str> {
        self.header.long_names.get(variable).map(String::as_str)
    }

    /// Number of written slots.
    pub fn len(&self) -> u64 {
        self.state.lock().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The slot the next append will receive.
    pub fn next_free_slot(&self) -> SlotIndex {
        SlotIndex(self.state.lock().count + 1)
    }

    /// Number of rows read from disk (cache misses).
    pub fn disk_reads(&self) -> u64 {
        self.disk_reads.load(Ordering::Relaxed)
    }

    fn row_offset(&self, slot: SlotIndex) -> u64 {
        self.data_start + (slot.0 - 1) * self.header.row_size()
    }

    fn check_shape(&self, frame: &Frame) -> Result<(), BulkError> {
        if frame.n_entities() != self.entity_count() {
            return Err(BulkError::ShapeMismatch {
                expected: self.entity_count(),
                found: frame.n_entities(),
            });
        }
        Ok(())
    }

    /// Append one row and flush it. Caller holds the state lock and has
    /// already checked the frame's shape.
    fn write_row(&self, state: &mut BulkFile, frame: &Frame) -> Result<SlotIndex, BulkError> {
        let slot = SlotIndex(state.count + 1);
        let mut row = Vec::with_capacity(self.header.row_size() as usize);
        for value in frame
            .coordinates
            .iter()
            .chain(&frame.velocities)
            .flatten()
            .chain([&frame.potential, &frame.kinetic])
        {
            row.extend_from_slice(&value.to_le_bytes());
        }
        state
            .file
            .seek(SeekFrom::Start(self.row_offset(slot)))
            .map_err(|e| self.io_err(e))?;
        state.file.write_all(&row).map_err(|e| self.io_err(e))?;
        state.file.sync_data().map_err(|e| self.io_err(e))?;
        state.count += 1;
        Ok(slot)
    }

    /// Write `frame` into `slot`.
    ///
    /// Returns `Ok(false)` without touching the file when `slot` is already
    /// written. Slot 0 and slots past the next free one are `SlotRange`.
    pub fn write(&self, slot: SlotIndex, frame: &Frame) -> Result<bool, BulkError> {
        self.check_shape(frame)?;
        let mut state = self.state.lock();
        if !slot.is_written() || slot.0 > state.count + 1 {
            return Err(BulkError::SlotRange {
                slot,
                count: state.count,
            });
        }
        if slot.0 <= state.count {
            return Ok(false);
        }
        self.write_row(&mut state, frame)?;
        drop(state);
        self.frames.put(slot, Arc::new(frame.clone()));
        Ok(true)
    }

    /// Validate raw arrays into a [`Frame`] and write them into `slot`.
    pub fn write_arrays(
        &self,
        slot: SlotIndex,
        coordinates: &[f32],
        velocities: &[f32],
        potential: f32,
        kinetic: f32,
    ) -> Result<bool, BulkError> {
        let frame = Frame::from_flat(coordinates, velocities, potential, kinetic)?;
        self.write(slot, &frame)
    }

    /// Write `frame` into the next free slot and return that slot.
    pub fn append(&self, frame: &Frame) -> Result<SlotIndex, BulkError> {
        self.check_shape(frame)?;
        let slot = {
            let mut state = self.state.lock();
            self.write_row(&mut state, frame)?
        };
        self.frames.put(slot, Arc::new(frame.clone()));
        debug!(%slot, "appended frame");
        Ok(slot)
    }

    /// Read the frame stored in `slot`.
    pub fn read(&self, slot: SlotIndex) -> Result<Arc<Frame>, BulkError> {
        if let Some(frame) = self.frames.get(&slot) {
            return Ok(frame);
        }
        let frame = {
            let mut state = self.state.lock();
            if !slot.is_written() || slot.0 > state.count {
                return Err(BulkError::SlotRange {
                    slot,
                    count: state.count,
                });
            }
            let mut row = vec![0u8; self.header.row_size() as usize];
            state
                .file
                .seek(SeekFrom::Start(self.row_offset(slot)))
                .map_err(|e| self.io_err(e))?;
            state.file.read_exact(&mut row).map_err(|e| self.io_err(e))?;
            self.disk_reads.fetch_add(1, Ordering::Relaxed);
            self.decode_row(&row)?
        };
        Ok(self.frames.insert_if_absent(slot, Arc::new(frame)))
    }

    fn decode_row(&self, row: &[u8]) -> Result<Frame, BulkError> {
        let values: Vec<f32> = row
            .chunks_exact(F32_BYTES)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        let n = self.entity_count() * SPATIAL_DIMS;
        Frame::from_flat(&values[..n], &values[n..2 * n], values[2 * n], values[2 * n + 1])
    }
}
