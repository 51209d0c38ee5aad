//! Disk persistence of in-flight chunks across process restarts.
//!
//! Whenever a chunk cannot be confirmed delivered (send retries exhausted,
//! permanent transport failure, or pending data at close), its packed
//! events are written to one self-describing file in the backup directory.
//! On the next start the buffer scans the directory once, before accepting
//! production traffic, and replays each valid file as if the events were
//! newly appended.
//!
//! File layout: a MessagePack array `[tag, packed_events]`, so a saved
//! chunk is reconstructable with no runtime state and corruption is
//! detectable on load. Files that fail to parse are left in place for
//! operator inspection.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use rmpv::Value;
use tracing::debug;

use crate::error::BufferError;
use crate::wire;

const BACKUP_EXTENSION: &str = "buf";

/// One chunk reloaded from disk.
#[derive(Debug)]
pub struct SavedChunk {
    pub path: PathBuf,
    pub tag: String,
    pub packed_events: Vec<u8>,
    /// Event count recovered by decoding `packed_events` (the decode also
    /// doubles as the corruption check).
    pub event_count: usize,
}

/// Writes and reloads per-chunk backup files in one directory.
#[derive(Debug)]
pub struct FileBackup {
    dir: PathBuf,
}

impl FileBackup {
    /// Opens (and creates if needed) the backup directory.
    pub fn new(dir: &Path) -> Result<Self, BufferError> {
        fs::create_dir_all(dir).map_err(|source| BufferError::Backup {
            path: dir.to_path_buf(),
            source,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persists one chunk. The file is written to a temporary name and
    /// renamed into place so the startup scan never sees a half-written
    /// envelope.
    pub fn save(&self, tag: &str, packed_events: &[u8]) -> Result<PathBuf, BufferError> {
        let mut envelope = Vec::with_capacity(packed_events.len() + tag.len() + 16);
        let io_err = |e: std::io::Error, path: &Path| BufferError::Backup {
            path: path.to_path_buf(),
            source: e,
        };

        rmp::encode::write_array_len(&mut envelope, 2)
            .map_err(|e| BufferError::Encoding(e.to_string()))?;
        rmp::encode::write_str(&mut envelope, tag)
            .map_err(|e| BufferError::Encoding(e.to_string()))?;
        rmp::encode::write_bin(&mut envelope, packed_events)
            .map_err(|e| BufferError::Encoding(e.to_string()))?;

        let path = self.next_path();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &envelope).map_err(|e| io_err(e, &tmp))?;
        fs::rename(&tmp, &path).map_err(|e| io_err(e, &path))?;
        debug!(path = %path.display(), tag, bytes = packed_events.len(), "saved chunk to backup file");
        Ok(path)
    }

    /// Lists saved buffer files in deterministic (name) order.
    pub fn saved_files(&self) -> Result<Vec<PathBuf>, BufferError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| BufferError::Backup {
            path: self.dir.clone(),
            source,
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == BACKUP_EXTENSION))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Loads and validates one saved buffer file.
    pub fn load(&self, path: &Path) -> Result<SavedChunk, BufferError> {
        let bytes = fs::read(path).map_err(|source| BufferError::Backup {
            path: path.to_path_buf(),
            source,
        })?;
        let corrupt = |reason: String| BufferError::BackupCorruption {
            path: path.to_path_buf(),
            reason,
        };

        let mut cursor = &bytes[..];
        let value = rmpv::decode::read_value(&mut cursor).map_err(|e| corrupt(e.to_string()))?;
        let Value::Array(parts) = value else {
            return Err(corrupt("envelope is not an array".to_string()));
        };
        let [tag, packed] = parts.as_slice() else {
            return Err(corrupt("envelope is not a 2-element array".to_string()));
        };
        let tag = tag
            .as_str()
            .ok_or_else(|| corrupt("tag is not a string".to_string()))?
            .to_string();
        let Value::Binary(packed_events) = packed else {
            return Err(corrupt("packed events are not a binary value".to_string()));
        };

        let events = wire::decode_packed_events(packed_events)
            .map_err(|e| corrupt(format!("packed events do not decode: {e}")))?;

        Ok(SavedChunk {
            path: path.to_path_buf(),
            tag,
            packed_events: packed_events.clone(),
            event_count: events.len(),
        })
    }

    /// Deletes a successfully replayed (or redelivered) backup file.
    pub fn remove(&self, path: &Path) -> Result<(), BufferError> {
        fs::remove_file(path).map_err(|source| BufferError::Backup {
            path: path.to_path_buf(),
            source,
        })
    }

    fn next_path(&self) -> PathBuf {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let suffix: u32 = rand::thread_rng().gen();
        self.dir
            .join(format!("{millis:013}-{suffix:08x}.{BACKUP_EXTENSION}"))
    }
}
