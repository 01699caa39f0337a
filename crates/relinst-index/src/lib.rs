//! Persistent key/value index.
//!
//! Maps an arbitrary serializable key to an arbitrary serializable value and
//! keeps the mapping in a single JSON-lines file:
//!
//! ```text
//! {"key":{...},"value":{...},"saved_at":"2026-01-01T00:00:00Z"}
//! ```
//!
//! Keys are compared by their JCS (RFC 8785) serialization, so two keys that
//! are logically equal always hit the same entry regardless of field order.
//!
//! Every entry is one self-delimited line, appended with a single write and
//! synced before `save` returns. A torn final line left behind by a crash is
//! skipped on the next open; it never hides the entries written before it.
//!
//! A path may be owned by at most one [`FileIndex`] per process. Concurrent
//! writers from different processes are not supported; callers serialize
//! them (the installer holds a directory lock for this).

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to read index {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write index {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to serialize index entry: {0}")]
    Serialize(String),

    #[error("conflicting value for existing key {key}")]
    Conflict { key: String },

    #[error("index {0} is already open in this process")]
    AlreadyOpen(PathBuf),
}

/// Result type for index operations.
pub type IndexResult<T> = Result<T, IndexError>;

/// A key/value mapping with add and lookup.
///
/// Saving the same value twice under one key is a no-op. Saving a different
/// value under an existing key fails with [`IndexError::Conflict`]; entries
/// are never overwritten.
pub trait Index {
    fn save<K: Serialize, V: Serialize>(&mut self, key: &K, value: &V) -> IndexResult<()>;

    fn find<K: Serialize, V: DeserializeOwned>(&self, key: &K) -> IndexResult<Option<V>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One line of the index file.
#[derive(Debug, Serialize, Deserialize)]
struct Record {
    key: Value,
    value: Value,
    saved_at: DateTime<Utc>,
}

/// Serialize a key to its canonical (JCS) string form.
pub fn canonical_key<K: Serialize>(key: &K) -> IndexResult<String> {
    let bytes = serde_json_canonicalizer::to_vec(key)
        .map_err(|e| IndexError::Serialize(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| IndexError::Serialize(e.to_string()))
}

fn to_value<T: Serialize>(value: &T) -> IndexResult<Value> {
    serde_json::to_value(value).map_err(|e| IndexError::Serialize(e.to_string()))
}

/// Insert unless the key already holds a different value.
///
/// Returns `true` when the entry is new.
fn insert_checked(
    entries: &mut HashMap<String, Value>,
    canonical: String,
    value: Value,
) -> IndexResult<bool> {
    match entries.get(&canonical) {
        Some(existing) if *existing == value => Ok(false),
        Some(_) => Err(IndexError::Conflict { key: canonical }),
        None => {
            entries.insert(canonical, value);
            Ok(true)
        }
    }
}

fn lookup<V: DeserializeOwned>(
    entries: &HashMap<String, Value>,
    canonical: &str,
) -> IndexResult<Option<V>> {
    match entries.get(canonical) {
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| IndexError::Serialize(e.to_string())),
        None => Ok(None),
    }
}

/// Paths currently owned by a live `FileIndex` in this process.
fn open_paths() -> &'static Mutex<HashSet<PathBuf>> {
    static OPEN: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    OPEN.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Process-wide claim on an index path, released on drop.
#[derive(Debug)]
struct PathClaim {
    path: PathBuf,
}

impl PathClaim {
    fn acquire(path: &Path) -> IndexResult<Self> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|source| IndexError::Read {
                    path: path.to_path_buf(),
                    source,
                })?
                .join(path)
        };

        let mut open = open_paths().lock().unwrap_or_else(|e| e.into_inner());
        if !open.insert(absolute.clone()) {
            return Err(IndexError::AlreadyOpen(absolute));
        }
        Ok(Self { path: absolute })
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        let mut open = open_paths().lock().unwrap_or_else(|e| e.into_inner());
        open.remove(&self.path);
    }
}

/// File-backed index.
#[derive(Debug)]
pub struct FileIndex {
    path: PathBuf,
    entries: HashMap<String, Value>,
    _claim: PathClaim,
}

impl FileIndex {
    /// Open the index at `path`, loading every readable entry.
    ///
    /// A missing file is an empty index; it is created on the first save.
    pub fn open(path: impl AsRef<Path>) -> IndexResult<Self> {
        let path = path.as_ref().to_path_buf();
        let claim = PathClaim::acquire(&path)?;
        let entries = Self::load(&path)?;

        debug!(path = %path.display(), entries = entries.len(), "opened index");

        Ok(Self {
            path,
            entries,
            _claim: claim,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> IndexResult<HashMap<String, Value>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(source) => {
                return Err(IndexError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let mut entries = HashMap::new();
        for (number, line) in bytes.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let record: Record = match serde_json::from_slice(line) {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        line = number + 1,
                        error = %e,
                        "skipping unreadable index entry"
                    );
                    continue;
                }
            };

            let canonical = canonical_key(&record.key)?;
            entries.insert(canonical, record.value);
        }

        Ok(entries)
    }

    fn append(&self, record: &Record) -> IndexResult<()> {
        let write_err = |source| IndexError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(write_err)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(write_err)?;

        let mut line = Vec::new();

        // Terminate a torn trailing line so the new entry stays readable.
        if file.metadata().map_err(write_err)?.len() > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1)).map_err(write_err)?;
            file.read_exact(&mut last).map_err(write_err)?;
            if last[0] != b'\n' {
                line.push(b'\n');
            }
        }

        serde_json::to_writer(&mut line, record)
            .map_err(|e| IndexError::Serialize(e.to_string()))?;
        line.push(b'\n');

        file.write_all(&line).map_err(write_err)?;
        file.sync_all().map_err(write_err)?;
        Ok(())
    }
}

impl Index for FileIndex {
    fn save<K: Serialize, V: Serialize>(&mut self, key: &K, value: &V) -> IndexResult<()> {
        let key = to_value(key)?;
        let value = to_value(value)?;
        let canonical = canonical_key(&key)?;

        if let Some(existing) = self.entries.get(&canonical) {
            if *existing == value {
                return Ok(());
            }
            return Err(IndexError::Conflict { key: canonical });
        }

        let record = Record {
            key,
            value,
            saved_at: Utc::now(),
        };
        self.append(&record)?;
        insert_checked(&mut self.entries, canonical, record.value)?;
        Ok(())
    }

    fn find<K: Serialize, V: DeserializeOwned>(&self, key: &K) -> IndexResult<Option<V>> {
        lookup(&self.entries, &canonical_key(key)?)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Index kept only in memory.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    entries: HashMap<String, Value>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Index for MemoryIndex {
    fn save<K: Serialize, V: Serialize>(&mut self, key: &K, value: &V) -> IndexResult<()> {
        let canonical = canonical_key(key)?;
        insert_checked(&mut self.entries, canonical, to_value(value)?)?;
        Ok(())
    }

    fn find<K: Serialize, V: DeserializeOwned>(&self, key: &K) -> IndexResult<Option<V>> {
        lookup(&self.entries, &canonical_key(key)?)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
