//! Cache coordinators: load, enumerate, fetch, merge, persist.
//!
//! [`HistoricalDataCache`] keeps a table of consecutive chunks up to the last
//! complete window. [`IdCache`] keeps one row group per id for a growing set
//! of target ids. Both run the same pipeline per `update`:
//!
//! 1. claim the record location (one update at a time per location)
//! 2. load the persisted record, unless reloading
//! 3. enumerate the missing chunk keys
//! 4. nothing missing: return the cached table (a reload drops the old record)
//! 5. fetch every missing chunk
//! 6. merge and check the table
//! 7. persist the new record, then return its table
//!
//! A failure in steps 5 to 7 leaves the persisted record as it was.

use crate::clock::{Clock, SystemClock};
use crate::config::{CacheIdentity, CacheKey, CacheSettings, CorruptPolicy};
use crate::enumerate::{IdSet, Schedule};
use crate::error::{CacheError, CacheResult};
use crate::fetch::{fetch_all, ChunkFetcher, FetchProgress, LogProgress};
use crate::key::{ChunkKey, SequentialKey};
use crate::merge::{merge_ids, merge_sequential};
use crate::record::{CacheRecord, RecordState};
use crate::store::{CacheStore, ParquetStore};
use polars::prelude::DataFrame;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, info, warn};

// ── In-process update guard ─────────────────────────────────────────

fn active_updates() -> &'static Mutex<HashSet<String>> {
    static ACTIVE: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Marks a record location as being updated until dropped.
struct UpdateGuard {
    location: String,
}

impl UpdateGuard {
    fn acquire(location: String) -> CacheResult<Self> {
        let mut active = active_updates().lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(location.clone()) {
            return Err(CacheError::UpdateInProgress { location });
        }
        Ok(Self { location })
    }
}

impl Drop for UpdateGuard {
    fn drop(&mut self) {
        active_updates()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.location);
    }
}

/// Load a record, applying the corrupt-record policy. A record holding the
/// other cache flavour's state counts as corrupt.
fn load_record<K: ChunkKey, S: CacheStore>(
    store: &S,
    key: &CacheKey,
    expected_kind: &str,
    policy: CorruptPolicy,
) -> CacheResult<Option<CacheRecord<K>>> {
    let loaded = store.load::<K>(key).and_then(|record| match record {
        Some(r) if r.state.kind() != expected_kind => Err(CacheError::Corrupt {
            location: store.location(key),
            reason: format!(
                "record holds {} state, expected {expected_kind}",
                r.state.kind()
            ),
        }),
        other => Ok(other),
    });

    match loaded {
        Err(CacheError::Corrupt { location, reason }) if policy == CorruptPolicy::Quarantine => {
            let moved = store.quarantine(key)?;
            warn!(
                %location,
                %reason,
                quarantined = %moved,
                "unreadable cache record moved aside, rebuilding from empty"
            );
            Ok(None)
        }
        other => other,
    }
}

/// A reload that finds nothing to fetch rebuilds to an empty table, so the
/// old record must not survive it.
fn discard_persisted<S: CacheStore>(store: &S, key: &CacheKey) -> CacheResult<()> {
    if store.remove(key)? {
        info!(cache = %key, "reload found nothing to fetch, persisted record removed");
    }
    Ok(())
}

fn describe_range<K: ChunkKey>(keys: &[K]) -> String {
    match (keys.first(), keys.last()) {
        (Some(first), Some(last)) if keys.len() > 1 => format!("[{first}~{last}]"),
        (Some(only), _) => format!("[{only}]"),
        _ => "[]".to_string(),
    }
}

// ── Sequential cache ────────────────────────────────────────────────

/// Incrementally maintained table of consecutive chunks.
///
/// ```no_run
/// use chrono::{NaiveDate, TimeDelta};
/// use histcache_core::{fetcher_fn, CacheIdentity, CacheSettings, HistoricalDataCache, Schedule};
/// use polars::prelude::*;
/// use std::sync::Arc;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
/// let fetcher = fetcher_fn(|_day: NaiveDate| async move {
///     // one request per day goes here
///     Ok::<_, anyhow::Error>(DataFrame::empty())
/// });
/// let mut cache = HistoricalDataCache::new(
///     &CacheIdentity::new("daily-bars").param("symbol", "SPY"),
///     Schedule::fixed(start, TimeDelta::days(1))?,
///     Arc::new(fetcher),
///     CacheSettings::default(),
/// )?;
/// let _table = cache.update(false).await?;
/// # Ok(())
/// # }
/// ```
pub struct HistoricalDataCache<K: SequentialKey, S: CacheStore = ParquetStore> {
    key: CacheKey,
    schedule: Schedule<K>,
    fetcher: Arc<dyn ChunkFetcher<K>>,
    store: Arc<S>,
    clock: Arc<dyn Clock<K>>,
    progress: Arc<dyn FetchProgress>,
    settings: CacheSettings,
}

impl<K: SequentialKey> HistoricalDataCache<K, ParquetStore>
where
    SystemClock: Clock<K>,
{
    /// Cache persisted under `settings.root`, driven by the wall clock.
    pub fn new(
        identity: &CacheIdentity,
        schedule: Schedule<K>,
        fetcher: Arc<dyn ChunkFetcher<K>>,
        settings: CacheSettings,
    ) -> CacheResult<Self> {
        let store = Arc::new(ParquetStore::new(settings.root.clone()));
        Self::with_store(identity, schedule, fetcher, store, settings)
    }
}

impl<K: SequentialKey, S: CacheStore> HistoricalDataCache<K, S> {
    /// Cache over an explicit store, driven by the wall clock.
    pub fn with_store(
        identity: &CacheIdentity,
        schedule: Schedule<K>,
        fetcher: Arc<dyn ChunkFetcher<K>>,
        store: Arc<S>,
        settings: CacheSettings,
    ) -> CacheResult<Self>
    where
        SystemClock: Clock<K>,
    {
        Self::with_store_and_clock(identity, schedule, fetcher, store, SystemClock, settings)
    }

    /// Cache over an explicit store and clock. Key types without a wall-clock
    /// reading (custom counters, version numbers) are built this way.
    pub fn with_store_and_clock(
        identity: &CacheIdentity,
        schedule: Schedule<K>,
        fetcher: Arc<dyn ChunkFetcher<K>>,
        store: Arc<S>,
        clock: impl Clock<K> + 'static,
        settings: CacheSettings,
    ) -> CacheResult<Self> {
        settings.validate()?;
        let key = identity.cache_key()?;
        Ok(Self {
            progress: Arc::new(LogProgress::new(key.as_str())),
            key,
            schedule,
            fetcher,
            store,
            clock: Arc::new(clock),
            settings,
        })
    }

    /// Replace the source of "now".
    pub fn with_clock(mut self, clock: impl Clock<K> + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Replace the fetch progress reporter (tracing events by default).
    pub fn with_progress(mut self, progress: impl FetchProgress + 'static) -> Self {
        self.progress = Arc::new(progress);
        self
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.key
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn schedule(&self) -> &Schedule<K> {
        &self.schedule
    }

    pub fn location(&self) -> String {
        self.store.location(&self.key)
    }

    /// Bring the table up to the clock's "now" and return it.
    ///
    /// With `reload` the persisted record is ignored and rebuilt from the
    /// schedule's start; it is replaced only if the rebuild succeeds.
    pub async fn update(&mut self, reload: bool) -> CacheResult<DataFrame> {
        let now = self.clock.now();
        self.update_at(reload, now).await
    }

    /// [`update`](Self::update) against an explicit "now".
    pub async fn update_at(&mut self, reload: bool, now: K) -> CacheResult<DataFrame> {
        let _guard = UpdateGuard::acquire(self.location())?;

        let previous = if reload {
            debug!(cache = %self.key, "reload requested, ignoring persisted record");
            None
        } else {
            load_record::<K, S>(&self.store, &self.key, "sequential", self.settings.on_corrupt)?
        };
        let boundary = previous.as_ref().and_then(|r| r.boundary().cloned());

        let keys = self.schedule.missing(boundary.as_ref(), &now)?;
        if keys.is_empty() && reload {
            discard_persisted(self.store.as_ref(), &self.key)?;
        }
        if keys.is_empty() {
            let data = previous.map(|r| r.data).unwrap_or_else(DataFrame::empty);
            debug!(
                cache = %self.key,
                rows = data.height(),
                boundary = ?boundary,
                "no complete chunks missing"
            );
            return Ok(data);
        }

        debug!(
            cache = %self.key,
            chunks = keys.len(),
            range = %describe_range(&keys),
            "fetching missing chunks"
        );
        let fragments = fetch_all(
            &keys,
            Arc::clone(&self.fetcher),
            self.settings.stagger_delay(),
            self.progress.as_ref(),
        )
        .await?;

        let merged = merge_sequential(
            previous.as_ref().map(|r| &r.data),
            &keys,
            &fragments,
            &self.settings.index_column,
        )?;
        let record = CacheRecord::successor(
            previous.as_ref(),
            merged,
            RecordState::Sequential {
                boundary: keys.last().cloned(),
            },
        );
        self.store.save(&self.key, &record)?;

        info!(
            cache = %self.key,
            rows_before = previous.as_ref().map_or(0, |r| r.data.height()),
            rows_after = record.data.height(),
            generation = record.generation,
            range = %describe_range(&keys),
            "cache updated"
        );
        Ok(record.data)
    }
}

// ── Id cache ────────────────────────────────────────────────────────

/// Table with one row group per id, for a growing set of target ids.
pub struct IdCache<K: ChunkKey, S: CacheStore = ParquetStore> {
    key: CacheKey,
    ids: IdSet<K>,
    fetcher: Arc<dyn ChunkFetcher<K>>,
    store: Arc<S>,
    progress: Arc<dyn FetchProgress>,
    settings: CacheSettings,
}

impl<K: ChunkKey> IdCache<K, ParquetStore> {
    /// Cache persisted under `settings.root`.
    pub fn new(
        identity: &CacheIdentity,
        fetcher: Arc<dyn ChunkFetcher<K>>,
        settings: CacheSettings,
    ) -> CacheResult<Self> {
        let store = Arc::new(ParquetStore::new(settings.root.clone()));
        Self::with_store(identity, fetcher, store, settings)
    }
}

impl<K: ChunkKey, S: CacheStore> IdCache<K, S> {
    pub fn with_store(
        identity: &CacheIdentity,
        fetcher: Arc<dyn ChunkFetcher<K>>,
        store: Arc<S>,
        settings: CacheSettings,
    ) -> CacheResult<Self> {
        settings.validate()?;
        let key = identity.cache_key()?;
        Ok(Self {
            progress: Arc::new(LogProgress::new(key.as_str())),
            key,
            ids: IdSet::new(),
            fetcher,
            store,
            settings,
        })
    }

    pub fn with_progress(mut self, progress: impl FetchProgress + 'static) -> Self {
        self.progress = Arc::new(progress);
        self
    }

    /// Add target ids, keeping first-seen order and ignoring ones already
    /// present. Nothing is fetched until [`update`](Self::update).
    /// Returns how many ids were new.
    pub fn set_ids<I>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = K>,
    {
        self.ids.extend(ids)
    }

    /// Current target ids in order.
    pub fn ids(&self) -> &[K] {
        self.ids.as_slice()
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.key
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    pub fn location(&self) -> String {
        self.store.location(&self.key)
    }

    /// Fetch every target id not yet cached and return the full table.
    ///
    /// Ids found in the persisted record but never passed to `set_ids` are
    /// adopted into the target list ahead of the unfetched ones.
    pub async fn update(&mut self, reload: bool) -> CacheResult<DataFrame> {
        let _guard = UpdateGuard::acquire(self.location())?;

        let previous = if reload {
            debug!(cache = %self.key, "reload requested, ignoring persisted record");
            None
        } else {
            load_record::<K, S>(&self.store, &self.key, "ids", self.settings.on_corrupt)?
        };
        let fetched: Vec<K> = previous
            .as_ref()
            .map(|r| r.fetched().to_vec())
            .unwrap_or_default();

        let adopted = self.ids.align_with(&fetched);
        if adopted > 0 {
            debug!(cache = %self.key, adopted, "adopted ids fetched by an earlier run");
        }

        let keys = self.ids.missing(&fetched);
        if keys.is_empty() && reload {
            discard_persisted(self.store.as_ref(), &self.key)?;
        }
        if keys.is_empty() {
            let data = previous.map(|r| r.data).unwrap_or_else(DataFrame::empty);
            debug!(
                cache = %self.key,
                rows = data.height(),
                ids = fetched.len(),
                "no ids missing"
            );
            return Ok(data);
        }

        debug!(cache = %self.key, ids = keys.len(), "fetching missing ids");
        let fragments = fetch_all(
            &keys,
            Arc::clone(&self.fetcher),
            self.settings.stagger_delay(),
            self.progress.as_ref(),
        )
        .await?;

        let merged = merge_ids(
            previous.as_ref().map(|r| &r.data),
            &fetched,
            &keys,
            &fragments,
            &self.settings.index_column,
        )?;
        let mut now_fetched = fetched;
        now_fetched.extend(keys.iter().cloned());
        let record = CacheRecord::successor(
            previous.as_ref(),
            merged,
            RecordState::Ids {
                fetched: now_fetched,
            },
        );
        self.store.save(&self.key, &record)?;

        info!(
            cache = %self.key,
            new_ids = keys.len(),
            total_ids = record.fetched().len(),
            rows = record.data.height(),
            generation = record.generation,
            "cache updated"
        );
        Ok(record.data)
    }
}
