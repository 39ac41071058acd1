//! Persistent record stores.
//!
//! Layout of [`ParquetStore`]: `{root}/{cache_key}/`
//! - `meta.json`: progress marker, row count, digest and name of the data file
//! - `data-{digest}.parquet`: the table
//!
//! Writes never touch the committed record: the new data file is written under
//! its own name, then `meta.json` is replaced by an atomic rename (the commit
//! point), then stale data files are removed. A crash at any step leaves either
//! the previous record or the new one readable.

use crate::config::CacheKey;
use crate::error::{CacheError, CacheResult};
use crate::key::ChunkKey;
use crate::record::{self, CacheRecord, RecordMeta};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Storage for cache records, addressed by [`CacheKey`].
///
/// `load` returns `Ok(None)` for a record that was never saved and
/// `CacheError::Corrupt` for one that exists but cannot be read back; what to
/// do about the latter is the caller's decision.
pub trait CacheStore: Send + Sync {
    /// Human-readable location of a record. Also identifies the record for
    /// the in-process update guard, so it must be unique per store instance.
    fn location(&self, key: &CacheKey) -> String;

    fn load<K: ChunkKey>(&self, key: &CacheKey) -> CacheResult<Option<CacheRecord<K>>>;

    fn save<K: ChunkKey>(&self, key: &CacheKey, record: &CacheRecord<K>) -> CacheResult<()>;

    /// Move an unreadable record out of the way. Returns where it went.
    fn quarantine(&self, key: &CacheKey) -> CacheResult<String>;

    /// Delete a record. Returns whether there was one.
    fn remove(&self, key: &CacheKey) -> CacheResult<bool>;

    /// Every record in the store, sorted by key.
    fn list(&self) -> CacheResult<Vec<StoredRecordInfo>>;
}

/// One entry of [`CacheStore::list`].
#[derive(Debug, Clone)]
pub struct StoredRecordInfo {
    pub key: CacheKey,
    pub location: String,
    /// Metadata summary, or why it could not be read.
    pub summary: Result<RecordSummary, String>,
}

/// Key-type-independent view of a record's metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSummary {
    pub kind: &'static str,
    /// Last merged chunk key, for sequential records.
    pub boundary: Option<String>,
    /// Number of fetched ids, for id records.
    pub fetched: usize,
    pub row_count: usize,
    pub generation: u64,
    pub saved_at: DateTime<Utc>,
}

impl RecordSummary {
    fn from_meta(meta: &RecordMeta<serde_json::Value>) -> Self {
        let (boundary, fetched) = match &meta.state {
            record::RecordState::Sequential { boundary } => (boundary.as_ref().map(display_value), 0),
            record::RecordState::Ids { fetched } => (None, fetched.len()),
        };
        Self {
            kind: meta.state.kind(),
            boundary,
            fetched,
            row_count: meta.row_count,
            generation: meta.generation,
            saved_at: meta.saved_at,
        }
    }
}

fn display_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn summarize(meta_json: &[u8]) -> Result<RecordSummary, String> {
    record::decode_meta::<serde_json::Value>(meta_json).map(|meta| RecordSummary::from_meta(&meta))
}

// ── Filesystem store ────────────────────────────────────────────────

const META_FILE: &str = "meta.json";

/// Records as Parquet plus a JSON sidecar under a root directory.
#[derive(Debug, Clone)]
pub struct ParquetStore {
    root: PathBuf,
}

impl ParquetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for one record: `{root}/{cache_key}/`
    fn record_dir(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.as_str())
    }

    fn corrupt(&self, key: &CacheKey, reason: String) -> CacheError {
        CacheError::Corrupt {
            location: self.location(key),
            reason,
        }
    }

    /// Delete data files other than `keep`, plus leftover temp files.
    fn remove_stale_files(&self, dir: &Path, keep: Option<&str>) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let stale_data =
                name.starts_with("data-") && name.ends_with(".parquet") && Some(name) != keep;
            if stale_data || name.ends_with(".tmp") {
                let _ = fs::remove_file(entry.path());
            }
        }
    }
}

impl CacheStore for ParquetStore {
    fn location(&self, key: &CacheKey) -> String {
        self.record_dir(key).display().to_string()
    }

    fn load<K: ChunkKey>(&self, key: &CacheKey) -> CacheResult<Option<CacheRecord<K>>> {
        let dir = self.record_dir(key);
        let meta_path = dir.join(META_FILE);
        let meta_json = match fs::read(&meta_path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CacheError::store(
                    &format!("read {}", meta_path.display()),
                    e,
                ))
            }
        };

        let meta = record::decode_meta::<K>(&meta_json).map_err(|r| self.corrupt(key, r))?;
        let data = match &meta.data_file {
            Some(name) => {
                if !is_plain_file_name(name) {
                    return Err(self.corrupt(key, format!("invalid data file name '{name}'")));
                }
                match fs::read(dir.join(name)) {
                    Ok(bytes) => Some(bytes),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        return Err(self.corrupt(key, format!("data file {name} is missing")));
                    }
                    Err(e) => return Err(CacheError::store(&format!("read {name}"), e)),
                }
            }
            None => None,
        };

        let loaded = record::decode(meta, data).map_err(|r| self.corrupt(key, r))?;
        debug!(
            location = %self.location(key),
            rows = loaded.data.height(),
            generation = loaded.generation,
            "loaded record"
        );
        Ok(Some(loaded))
    }

    fn save<K: ChunkKey>(&self, key: &CacheKey, record: &CacheRecord<K>) -> CacheResult<()> {
        let dir = self.record_dir(key);
        fs::create_dir_all(&dir)
            .map_err(|e| CacheError::store(&format!("create {}", dir.display()), e))?;

        let encoded = record::encode(record)?;
        if let Some(data) = &encoded.data {
            write_atomic(&dir.join(&data.file_name), &data.bytes)?;
        }
        write_atomic(&dir.join(META_FILE), &encoded.meta_json)?;

        self.remove_stale_files(&dir, encoded.data.as_ref().map(|d| d.file_name.as_str()));
        debug!(
            location = %dir.display(),
            rows = record.data.height(),
            generation = record.generation,
            "saved record"
        );
        Ok(())
    }

    fn quarantine(&self, key: &CacheKey) -> CacheResult<String> {
        let dir = self.record_dir(key);
        let target = self.root.join(format!(
            "{key}.quarantined-{}",
            Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
        ));
        fs::rename(&dir, &target).map_err(|e| {
            CacheError::store(&format!("quarantine {}", dir.display()), e)
        })?;
        Ok(target.display().to_string())
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<bool> {
        let dir = self.record_dir(key);
        if !dir.exists() {
            return Ok(false);
        }
        fs::remove_dir_all(&dir)
            .map_err(|e| CacheError::store(&format!("remove {}", dir.display()), e))?;
        Ok(true)
    }

    fn list(&self) -> CacheResult<Vec<StoredRecordInfo>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.root)
            .map_err(|e| CacheError::store(&format!("read {}", self.root.display()), e))?;

        let mut infos = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CacheError::store("dir entry", e))?;
            if !entry.path().is_dir() {
                continue;
            }
            // Quarantined directories carry a '.' and never parse as keys.
            let Some(key) = entry.file_name().to_str().and_then(|n| CacheKey::parse(n).ok())
            else {
                continue;
            };
            let summary = match fs::read(entry.path().join(META_FILE)) {
                Ok(bytes) => summarize(&bytes),
                Err(e) => Err(format!("no readable {META_FILE}: {e}")),
            };
            infos.push(StoredRecordInfo {
                location: self.location(&key),
                key,
                summary,
            });
        }
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(infos)
    }
}

fn is_plain_file_name(name: &str) -> bool {
    Path::new(name).file_name().and_then(|n| n.to_str()) == Some(name)
}

/// Write to `{path}.tmp`, then rename into place.
fn write_atomic(path: &Path, bytes: &[u8]) -> CacheResult<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, bytes)
        .map_err(|e| CacheError::store(&format!("write {}", tmp.display()), e))?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        CacheError::store(&format!("atomic rename to {}", path.display()), e)
    })
}

// ── In-memory store ─────────────────────────────────────────────────

static NEXT_MEMORY_STORE: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
struct Blob {
    meta_json: Vec<u8>,
    data: Option<Vec<u8>>,
}

/// Process-local store using the same codec as [`ParquetStore`], for tests
/// and short-lived caches.
#[derive(Debug)]
pub struct MemoryStore {
    id: u64,
    records: Mutex<BTreeMap<CacheKey, Blob>>,
    quarantined: Mutex<Vec<CacheKey>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            id: NEXT_MEMORY_STORE.fetch_add(1, Ordering::Relaxed),
            records: Mutex::new(BTreeMap::new()),
            quarantined: Mutex::new(Vec::new()),
        }
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<CacheKey, Blob>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Keys moved aside by [`CacheStore::quarantine`].
    pub fn quarantined(&self) -> Vec<CacheKey> {
        self.quarantined
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace a record's metadata bytes as-is.
    pub fn put_raw_meta(&self, key: &CacheKey, meta_json: Vec<u8>) {
        let mut records = self.records();
        let data = records.get(key).and_then(|b| b.data.clone());
        records.insert(key.clone(), Blob { meta_json, data });
    }
}

impl CacheStore for MemoryStore {
    fn location(&self, key: &CacheKey) -> String {
        format!("memory://{}/{key}", self.id)
    }

    fn load<K: ChunkKey>(&self, key: &CacheKey) -> CacheResult<Option<CacheRecord<K>>> {
        let Some(blob) = self.records().get(key).cloned() else {
            return Ok(None);
        };
        let corrupt = |reason| CacheError::Corrupt {
            location: self.location(key),
            reason,
        };
        let meta = record::decode_meta::<K>(&blob.meta_json).map_err(corrupt)?;
        record::decode(meta, blob.data).map(Some).map_err(corrupt)
    }

    fn save<K: ChunkKey>(&self, key: &CacheKey, record: &CacheRecord<K>) -> CacheResult<()> {
        let encoded = record::encode(record)?;
        self.records().insert(
            key.clone(),
            Blob {
                meta_json: encoded.meta_json,
                data: encoded.data.map(|d| d.bytes),
            },
        );
        Ok(())
    }

    fn quarantine(&self, key: &CacheKey) -> CacheResult<String> {
        self.records().remove(key);
        self.quarantined
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(key.clone());
        Ok(format!("{}.quarantined", self.location(key)))
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<bool> {
        Ok(self.records().remove(key).is_some())
    }

    fn list(&self) -> CacheResult<Vec<StoredRecordInfo>> {
        Ok(self
            .records()
            .iter()
            .map(|(key, blob)| StoredRecordInfo {
                key: key.clone(),
                location: self.location(key),
                summary: summarize(&blob.meta_json),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordState;
    use polars::prelude::*;
    use tempfile::TempDir;

    fn key(raw: &str) -> CacheKey {
        CacheKey::parse(raw).unwrap()
    }

    fn record(rows: &[i64], previous: Option<&CacheRecord<i64>>) -> CacheRecord<i64> {
        let values: Vec<f64> = rows.iter().map(|r| *r as f64).collect();
        let data = df!("index" => rows, "close" => values).unwrap();
        CacheRecord::successor(
            previous,
            data,
            RecordState::Sequential {
                boundary: rows.last().copied(),
            },
        )
    }

    fn data_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with("data-"))
            .collect();
        names.sort();
        names
    }

    #[test]
    fn missing_record_loads_as_none() {
        let tmp = TempDir::new().unwrap();
        let store = ParquetStore::new(tmp.path());
        assert!(store.load::<i64>(&key("bars")).unwrap().is_none());
    }

    #[test]
    fn save_then_load() {
        let tmp = TempDir::new().unwrap();
        let store = ParquetStore::new(tmp.path());
        let rec = record(&[1, 2, 3], None);
        store.save(&key("bars"), &rec).unwrap();

        let loaded = store.load::<i64>(&key("bars")).unwrap().unwrap();
        assert!(loaded.data.equals(&rec.data));
        assert_eq!(loaded.boundary(), Some(&3));
        assert!(tmp.path().join("bars").join(META_FILE).exists());
    }

    #[test]
    fn replacing_a_record_leaves_one_data_file() {
        let tmp = TempDir::new().unwrap();
        let store = ParquetStore::new(tmp.path());
        let first = record(&[1], None);
        store.save(&key("bars"), &first).unwrap();
        let second = record(&[1, 2], Some(&first));
        store.save(&key("bars"), &second).unwrap();

        let dir = tmp.path().join("bars");
        assert_eq!(data_files(&dir).len(), 1);
        let loaded = store.load::<i64>(&key("bars")).unwrap().unwrap();
        assert_eq!(loaded.generation, 2);
        assert_eq!(loaded.data.height(), 2);
    }

    #[test]
    fn interrupted_save_keeps_previous_record() {
        let tmp = TempDir::new().unwrap();
        let store = ParquetStore::new(tmp.path());
        store.save(&key("bars"), &record(&[1, 2], None)).unwrap();

        // A crash after the data file but before the metadata rename leaves
        // an orphan data file and a temp file behind.
        let dir = tmp.path().join("bars");
        fs::write(dir.join("data-0000000000000000.parquet"), b"partial").unwrap();
        fs::write(dir.join("meta.json.tmp"), b"{").unwrap();

        let loaded = store.load::<i64>(&key("bars")).unwrap().unwrap();
        assert_eq!(loaded.data.height(), 2);
    }

    #[test]
    fn tampered_data_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = ParquetStore::new(tmp.path());
        store.save(&key("bars"), &record(&[1, 2], None)).unwrap();

        let dir = tmp.path().join("bars");
        let name = data_files(&dir).remove(0);
        fs::write(dir.join(name), b"not parquet").unwrap();

        let err = store.load::<i64>(&key("bars")).unwrap_err();
        match err {
            CacheError::Corrupt { location, reason } => {
                assert!(location.ends_with("bars"));
                assert!(reason.contains("digest"));
            }
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn garbage_metadata_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = ParquetStore::new(tmp.path());
        fs::create_dir_all(tmp.path().join("bars")).unwrap();
        fs::write(tmp.path().join("bars").join(META_FILE), b"{ nope").unwrap();
        assert!(matches!(
            store.load::<i64>(&key("bars")),
            Err(CacheError::Corrupt { .. })
        ));
    }

    #[test]
    fn wrong_key_type_is_corrupt() {
        let tmp = TempDir::new().unwrap();
        let store = ParquetStore::new(tmp.path());
        store.save(&key("bars"), &record(&[1], None)).unwrap();
        assert!(matches!(
            store.load::<chrono::NaiveDate>(&key("bars")),
            Err(CacheError::Corrupt { .. })
        ));
    }

    #[test]
    fn quarantine_moves_the_directory_aside() {
        let tmp = TempDir::new().unwrap();
        let store = ParquetStore::new(tmp.path());
        store.save(&key("bars"), &record(&[1], None)).unwrap();

        let moved = store.quarantine(&key("bars")).unwrap();
        assert!(moved.contains("bars.quarantined-"));
        assert!(!tmp.path().join("bars").exists());
        assert!(store.load::<i64>(&key("bars")).unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn list_and_remove() {
        let tmp = TempDir::new().unwrap();
        let store = ParquetStore::new(tmp.path());
        store.save(&key("b-bars"), &record(&[1, 2], None)).unwrap();
        let ids: CacheRecord<String> = CacheRecord::successor(
            None,
            df!("index" => &["x"]).unwrap(),
            RecordState::Ids {
                fetched: vec!["x".to_string()],
            },
        );
        store.save(&key("a-ids"), &ids).unwrap();

        let listed = store.list().unwrap();
        let keys: Vec<&str> = listed.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, ["a-ids", "b-bars"]);

        let summary = listed[0].summary.as_ref().unwrap();
        assert_eq!(summary.kind, "ids");
        assert_eq!(summary.fetched, 1);
        let summary = listed[1].summary.as_ref().unwrap();
        assert_eq!(summary.boundary.as_deref(), Some("2"));
        assert_eq!(summary.row_count, 2);

        assert!(store.remove(&key("b-bars")).unwrap());
        assert!(!store.remove(&key("b-bars")).unwrap());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn list_of_missing_root_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = ParquetStore::new(tmp.path().join("nowhere"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn memory_store_matches_parquet_semantics() {
        let store = MemoryStore::new();
        assert!(store.load::<i64>(&key("bars")).unwrap().is_none());
        let rec = record(&[5, 6], None);
        store.save(&key("bars"), &rec).unwrap();
        let loaded = store.load::<i64>(&key("bars")).unwrap().unwrap();
        assert!(loaded.data.equals(&rec.data));

        store.put_raw_meta(&key("bars"), b"garbage".to_vec());
        assert!(matches!(
            store.load::<i64>(&key("bars")),
            Err(CacheError::Corrupt { .. })
        ));
        store.quarantine(&key("bars")).unwrap();
        assert_eq!(store.quarantined(), vec![key("bars")]);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn memory_store_locations_are_per_instance() {
        let a = MemoryStore::new();
        let b = MemoryStore::new();
        assert_ne!(a.location(&key("bars")), b.location(&key("bars")));
    }
}
