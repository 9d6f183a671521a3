//! Record stores: the key-value interface the reconstruction engine reads
//! from, with an in-memory and an append-only file implementation.

use crate::id::ObjectId;
use crate::serialize::{CodecError, decode_record, encode_record};
use crate::value::Record;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Length prefix size of every log entry.
const LEN_PREFIX: u64 = 4;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Generic read/write failure, including timeouts reported by the I/O
    /// layer.
    #[error("record store unavailable: {0}")]
    Unavailable(String),
    #[error("record store I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("corrupt record at offset {offset} in {path}: {source}")]
    Codec {
        path: PathBuf,
        offset: u64,
        #[source]
        source: CodecError,
    },
}

/// Key-value access to flattened records.
///
/// Records are write-once: an identity's record never changes after it is
/// first stored, so putting an identity that already exists is skipped.
pub trait RecordStore: Send + Sync {
    /// Fetch the records for `ids`. Identities without a record are simply
    /// absent from the result.
    fn get_records(&self, ids: &BTreeSet<ObjectId>) -> Result<HashMap<ObjectId, Record>, StoreError>;

    fn put_records(&self, records: HashMap<ObjectId, Record>) -> Result<(), StoreError>;

    fn contains(&self, id: ObjectId) -> Result<bool, StoreError> {
        let ids = BTreeSet::from([id]);
        Ok(self.get_records(&ids)?.contains_key(&id))
    }
}

// ---------------------------------------------------------------------------
// MemoryRecordStore
// ---------------------------------------------------------------------------

/// In-memory store. Counts reads per identity so callers can verify that
/// cached objects never trigger a second fetch.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: RwLock<HashMap<ObjectId, Record>>,
    reads: Mutex<HashMap<ObjectId, u64>>,
    batches: AtomicU64,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// How many times `id` was requested through `get_records`.
    pub fn read_count(&self, id: ObjectId) -> u64 {
        self.reads.lock().get(&id).copied().unwrap_or(0)
    }

    /// Number of `get_records` calls served.
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

impl RecordStore for MemoryRecordStore {
    fn get_records(&self, ids: &BTreeSet<ObjectId>) -> Result<HashMap<ObjectId, Record>, StoreError> {
        self.batches.fetch_add(1, Ordering::Relaxed);
        {
            let mut reads = self.reads.lock();
            for id in ids {
                *reads.entry(*id).or_default() += 1;
            }
        }
        let records = self.records.read();
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id).map(|r| (*id, r.clone())))
            .collect())
    }

    fn put_records(&self, records: HashMap<ObjectId, Record>) -> Result<(), StoreError> {
        let mut stored = self.records.write();
        for (id, record) in records {
            stored.entry(id).or_insert(record);
        }
        Ok(())
    }

    fn contains(&self, id: ObjectId) -> Result<bool, StoreError> {
        Ok(self.records.read().contains_key(&id))
    }
}

// ---------------------------------------------------------------------------
// FileRecordStore
// ---------------------------------------------------------------------------

/// Append-only log of encoded records: `[len: u32 LE][encoded record]`.
#[derive(Debug)]
struct Segment {
    path: PathBuf,
    file: File,
    end: u64,
    /// Largest entry accepted by `append`, bounded by the length prefix.
    max_entry: u64,
}

impl Segment {
    fn io_err(&self, source: io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn append(&mut self, bytes: &[u8]) -> Result<u64, StoreError> {
        let start = self.end;
        let len = u32::try_from(bytes.len())
            .ok()
            .filter(|len| u64::from(*len) <= self.max_entry)
            .ok_or_else(|| {
                StoreError::Unavailable(format!("record of {} bytes is too large", bytes.len()))
            })?;
        self.file
            .seek(SeekFrom::Start(start))
            .map_err(|e| self.io_err(e))?;
        self.file
            .write_all(&len.to_le_bytes())
            .map_err(|e| self.io_err(e))?;
        self.file.write_all(bytes).map_err(|e| self.io_err(e))?;
        self.end += LEN_PREFIX + bytes.len() as u64;
        Ok(start)
    }

    /// Read the entry at `offset`. Moves the shared cursor; `append` always
    /// seeks before writing.
    fn read_at(&mut self, offset: u64) -> Result<(ObjectId, Record), StoreError> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(|e| self.io_err(e))?;
        let mut len_buf = [0u8; LEN_PREFIX as usize];
        self.file
            .read_exact(&mut len_buf)
            .map_err(|e| self.io_err(e))?;
        let mut bytes = vec![0u8; u32::from_le_bytes(len_buf) as usize];
        self.file
            .read_exact(&mut bytes)
            .map_err(|e| self.io_err(e))?;
        decode_record(&bytes).map_err(|source| StoreError::Codec {
            path: self.path.clone(),
            offset,
            source,
        })
    }

    fn sync(&self) -> Result<(), StoreError> {
        self.file.sync_data().map_err(|e| self.io_err(e))
    }

    /// Cut the log back to `end`, discarding a partially appended batch.
    fn rollback(&mut self, end: u64) {
        if let Err(e) = self.file.set_len(end) {
            warn!(path = %self.path.display(), error = %e, "failed to roll back partial batch");
        }
        self.end = end;
    }
}

/// File-backed record store. The offset index is rebuilt by scanning the
/// log on open; a truncated trailing entry left by a crash is cut off.
#[derive(Debug)]
pub struct FileRecordStore {
    segment: Mutex<Segment>,
    index: RwLock<HashMap<ObjectId, u64>>,
}

impl FileRecordStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let io_err = |source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(io_err)?;
        let len = file.metadata().map_err(io_err)?.len();

        let mut segment = Segment {
            path: path.to_path_buf(),
            file,
            end: 0,
            max_entry: u64::from(u32::MAX),
        };
        let mut index = HashMap::new();
        let mut offset = 0u64;
        while offset + LEN_PREFIX <= len {
            let mut len_buf = [0u8; LEN_PREFIX as usize];
            segment
                .file
                .seek(SeekFrom::Start(offset))
                .map_err(io_err)?;
            segment.file.read_exact(&mut len_buf).map_err(io_err)?;
            let entry_len = u32::from_le_bytes(len_buf) as u64;
            if offset + LEN_PREFIX + entry_len > len {
                break;
            }
            let (id, _) = segment.read_at(offset)?;
            index.entry(id).or_insert(offset);
            offset += LEN_PREFIX + entry_len;
        }
        if offset < len {
            warn!(
                path = %path.display(),
                valid_bytes = offset,
                file_bytes = len,
                "discarding truncated tail of record log"
            );
            segment.file.set_len(offset).map_err(io_err)?;
        }
        segment.end = offset;
        debug!(path = %path.display(), records = index.len(), "opened record log");

        Ok(Self {
            segment: Mutex::new(segment),
            index: RwLock::new(index),
        })
    }

    pub fn path(&self) -> PathBuf {
        self.segment.lock().path.clone()
    }

    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }
}

impl FileRecordStore {
    /// Append and sync every record not yet indexed. Nothing is indexed
    /// here, so a failure leaves the index untouched.
    fn append_batch(
        &self,
        segment: &mut Segment,
        records: &HashMap<ObjectId, Record>,
    ) -> Result<Vec<(ObjectId, u64)>, StoreError> {
        let index = self.index.read();
        let mut written = Vec::new();
        for (id, record) in records {
            if index.contains_key(id) {
                continue;
            }
            let bytes = encode_record(*id, record).map_err(|source| StoreError::Codec {
                path: segment.path.clone(),
                offset: segment.end,
                source,
            })?;
            written.push((*id, segment.append(&bytes)?));
        }
        if !written.is_empty() {
            segment.sync()?;
        }
        Ok(written)
    }
}

impl RecordStore for FileRecordStore {
    fn get_records(&self, ids: &BTreeSet<ObjectId>) -> Result<HashMap<ObjectId, Record>, StoreError> {
        let offsets: Vec<(ObjectId, u64)> = {
            let index = self.index.read();
            ids.iter()
                .filter_map(|id| index.get(id).map(|off| (*id, *off)))
                .collect()
        };
        let mut segment = self.segment.lock();
        let mut out = HashMap::with_capacity(offsets.len());
        for (id, offset) in offsets {
            let (stored_id, record) = segment.read_at(offset)?;
            if stored_id != id {
                return Err(StoreError::Unavailable(format!(
                    "index points {id} at a record for {stored_id}"
                )));
            }
            out.insert(id, record);
        }
        Ok(out)
    }

    fn put_records(&self, records: HashMap<ObjectId, Record>) -> Result<(), StoreError> {
        let mut segment = self.segment.lock();
        let start = segment.end;
        let written = match self.append_batch(&mut segment, &records) {
            Ok(written) => written,
            Err(e) => {
                segment.rollback(start);
                return Err(e);
            }
        };
        if written.is_empty() {
            return Ok(());
        }
        let mut index = self.index.write();
        for (id, offset) in written.iter().copied() {
            index.insert(id, offset);
        }
        debug!(records = written.len(), "appended records");
        Ok(())
    }

    fn contains(&self, id: ObjectId) -> Result<bool, StoreError> {
        Ok(self.index.read().contains_key(&id))
    }
}
