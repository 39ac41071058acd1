//! Cache records and their persisted form.
//!
//! A record is the cached table plus the progress marker that tells the
//! enumerator where to resume: the last merged chunk key for sequential caches
//! or the list of fetched ids for id caches. Records are values; an update
//! builds a successor and persists it, it never edits a stored one.
//!
//! Persisted form: the table as Parquet bytes, and a JSON metadata document
//! carrying the progress marker, row count and a blake3 digest of the Parquet
//! bytes. The digest also names the data file, so a new table never
//! overwrites the bytes the current metadata points at.

use crate::error::{CacheError, CacheResult};
use crate::key::ChunkKey;
use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::Cursor;

/// Version of the metadata document layout.
pub const FORMAT_VERSION: u32 = 1;

/// Progress marker of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
#[serde(bound(serialize = "K: Serialize", deserialize = "K: DeserializeOwned"))]
pub enum RecordState<K> {
    /// `boundary` is the greatest chunk key merged so far.
    Sequential { boundary: Option<K> },
    /// Ids merged so far, in row-group order.
    Ids { fetched: Vec<K> },
}

impl<K> RecordState<K> {
    pub fn kind(&self) -> &'static str {
        match self {
            RecordState::Sequential { .. } => "sequential",
            RecordState::Ids { .. } => "ids",
        }
    }
}

/// One persisted unit: the table and where fetching should resume.
#[derive(Debug, Clone)]
pub struct CacheRecord<K> {
    pub data: DataFrame,
    pub state: RecordState<K>,
    /// Number of successful updates since the record was last built from empty.
    pub generation: u64,
    pub saved_at: DateTime<Utc>,
}

impl<K: ChunkKey> CacheRecord<K> {
    /// Build the record that replaces `previous` (or starts a fresh one).
    pub fn successor(previous: Option<&Self>, data: DataFrame, state: RecordState<K>) -> Self {
        Self {
            data,
            state,
            generation: previous.map_or(1, |p| p.generation + 1),
            saved_at: Utc::now(),
        }
    }

    pub fn boundary(&self) -> Option<&K> {
        match &self.state {
            RecordState::Sequential { boundary } => boundary.as_ref(),
            RecordState::Ids { .. } => None,
        }
    }

    pub fn fetched(&self) -> &[K] {
        match &self.state {
            RecordState::Ids { fetched } => fetched,
            RecordState::Sequential { .. } => &[],
        }
    }
}

/// The metadata document stored next to the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "K: Serialize", deserialize = "K: DeserializeOwned"))]
pub struct RecordMeta<K> {
    pub format_version: u32,
    pub state: RecordState<K>,
    pub generation: u64,
    pub saved_at: DateTime<Utc>,
    pub row_count: usize,
    /// Name of the Parquet file; `None` when the table has no columns.
    pub data_file: Option<String>,
    pub data_hash: Option<String>,
}

/// A record ready to be written: metadata JSON plus optional Parquet bytes.
#[derive(Debug, Clone)]
pub struct EncodedRecord {
    pub meta_json: Vec<u8>,
    pub data: Option<EncodedData>,
}

#[derive(Debug, Clone)]
pub struct EncodedData {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Data file name for a digest.
fn data_file_name(hash: &str) -> String {
    format!("data-{}.parquet", &hash[..16])
}

/// Serialize a record for storage.
pub fn encode<K: ChunkKey>(record: &CacheRecord<K>) -> CacheResult<EncodedRecord> {
    let data = if record.data.width() > 0 {
        let mut bytes = Vec::new();
        ParquetWriter::new(&mut bytes)
            .finish(&mut record.data.clone())
            .map_err(|e| CacheError::store("write parquet", e))?;
        let hash = blake3::hash(&bytes).to_hex().to_string();
        Some((hash, bytes))
    } else {
        None
    };

    let meta = RecordMeta {
        format_version: FORMAT_VERSION,
        state: record.state.clone(),
        generation: record.generation,
        saved_at: record.saved_at,
        row_count: record.data.height(),
        data_file: data.as_ref().map(|(hash, _)| data_file_name(hash)),
        data_hash: data.as_ref().map(|(hash, _)| hash.clone()),
    };
    let meta_json = serde_json::to_vec_pretty(&meta)
        .map_err(|e| CacheError::store("meta serialization", e))?;

    Ok(EncodedRecord {
        meta_json,
        data: data.map(|(hash, bytes)| EncodedData {
            file_name: data_file_name(&hash),
            bytes,
        }),
    })
}

/// Parse a metadata document. Errors are reasons for treating the record as corrupt.
pub fn decode_meta<K: DeserializeOwned>(meta_json: &[u8]) -> Result<RecordMeta<K>, String> {
    let meta: RecordMeta<K> =
        serde_json::from_slice(meta_json).map_err(|e| format!("unreadable metadata: {e}"))?;
    if meta.format_version != FORMAT_VERSION {
        return Err(format!(
            "unsupported format version {} (expected {FORMAT_VERSION})",
            meta.format_version
        ));
    }
    if meta.data_file.is_some() != meta.data_hash.is_some() {
        return Err("metadata names a data file without a digest, or the reverse".into());
    }
    Ok(meta)
}

/// Rebuild a record from its metadata and (if any) Parquet bytes, verifying
/// digest and row count. Errors are reasons for treating the record as corrupt.
pub fn decode<K: ChunkKey>(meta: RecordMeta<K>, data: Option<Vec<u8>>) -> Result<CacheRecord<K>, String> {
    let frame = match (&meta.data_hash, data) {
        (None, None) => DataFrame::empty(),
        (Some(expected), Some(bytes)) => {
            let actual = blake3::hash(&bytes).to_hex().to_string();
            if actual != *expected {
                return Err(format!("data digest {actual} does not match metadata {expected}"));
            }
            ParquetReader::new(Cursor::new(bytes))
                .finish()
                .map_err(|e| format!("unreadable parquet: {e}"))?
        }
        (Some(_), None) => return Err("data file is missing".into()),
        (None, Some(_)) => return Err("unexpected data file for an empty table".into()),
    };

    if frame.height() != meta.row_count {
        return Err(format!(
            "table has {} rows, metadata says {}",
            frame.height(),
            meta.row_count
        ));
    }

    Ok(CacheRecord {
        data: frame,
        state: meta.state,
        generation: meta.generation,
        saved_at: meta.saved_at,
    })
}
