//! histcache core: incremental, chunked fetch-and-cache for historical tables.
//!
//! A cache owns one persisted record (a polars `DataFrame` plus a progress
//! marker) and extends it on every `update` by fetching only the chunks that
//! are missing:
//! - Sequential caches walk a fixed or variable interval schedule up to the
//!   last window that has fully elapsed
//! - Id caches fetch every target id not yet cached
//! - Chunk fetches run concurrently with staggered start times
//! - Merges are checked (ordered index, one row group per id) before the
//!   new record is atomically persisted

pub mod cache;
pub mod clock;
pub mod config;
pub mod enumerate;
pub mod error;
pub mod fetch;
pub mod key;
pub mod merge;
pub mod record;
pub mod store;

pub use cache::{HistoricalDataCache, IdCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{default_root, CacheIdentity, CacheKey, CacheSettings, CorruptPolicy};
pub use enumerate::{IdSet, NextKeyFn, Schedule};
pub use error::{CacheError, CacheResult, ChunkFailure};
pub use fetch::{fetch_all, fetcher_fn, ChunkFetcher, FetchProgress, FnFetcher, LogProgress, NoProgress};
pub use key::{ChunkKey, SequentialKey};
pub use record::{CacheRecord, RecordState};
pub use store::{CacheStore, MemoryStore, ParquetStore, RecordSummary, StoredRecordInfo};
