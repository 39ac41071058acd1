//! Chunk enumeration: which chunk keys are still missing from a record.
//!
//! Sequential schedules walk forward from the record's boundary (or the
//! configured start) and only emit chunks whose window has fully elapsed,
//! i.e. chunk `k` is emitted only when the key after it is `<= now`. A chunk
//! that is still filling up is never fetched, so the cache never stores
//! partial windows.

use crate::error::{CacheError, CacheResult};
use crate::key::{ChunkKey, SequentialKey};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Caller-supplied successor function for variable-width chunks.
/// Returns `None` when no further chunk exists.
pub type NextKeyFn<K> = Arc<dyn Fn(&K) -> Option<K> + Send + Sync>;

/// How a sequential cache steps from one chunk to the next.
#[derive(Clone)]
pub enum Schedule<K: SequentialKey> {
    FixedInterval { start: K, interval: K::Interval },
    VariableInterval { start: K, next: NextKeyFn<K> },
}

impl<K: SequentialKey> Schedule<K> {
    /// Fixed-width chunks. The interval must move `start` strictly forward.
    pub fn fixed(start: K, interval: K::Interval) -> CacheResult<Self> {
        match start.advance(interval) {
            Some(next) if next > start => Ok(Self::FixedInterval { start, interval }),
            _ => Err(CacheError::Config(format!(
                "interval {interval:?} does not advance start key {start}"
            ))),
        }
    }

    /// Variable-width chunks; `next(k)` is both the end of chunk `k` and the
    /// key of the following chunk.
    pub fn variable<F>(start: K, next: F) -> Self
    where
        F: Fn(&K) -> Option<K> + Send + Sync + 'static,
    {
        Self::VariableInterval {
            start,
            next: Arc::new(next),
        }
    }

    /// First chunk key of an empty cache.
    pub fn start(&self) -> &K {
        match self {
            Self::FixedInterval { start, .. } | Self::VariableInterval { start, .. } => start,
        }
    }

    fn next_after(&self, key: &K) -> CacheResult<Option<K>> {
        let next = match self {
            Self::FixedInterval { interval, .. } => key.advance(*interval),
            Self::VariableInterval { next, .. } => next(key),
        };
        match next {
            Some(n) if n <= *key => Err(CacheError::Config(format!(
                "next-key function returned {n}, which does not advance past {key}"
            ))),
            other => Ok(other),
        }
    }

    /// Ordered chunk keys whose windows lie between the boundary and `now`.
    ///
    /// With no boundary the walk begins at `start` itself; with a boundary it
    /// begins at the chunk after it.
    pub fn missing(&self, boundary: Option<&K>, now: &K) -> CacheResult<Vec<K>> {
        let mut candidate = match boundary {
            Some(last) => match self.next_after(last)? {
                Some(k) => k,
                None => return Ok(Vec::new()),
            },
            None => self.start().clone(),
        };

        let mut keys = Vec::new();
        while let Some(end) = self.next_after(&candidate)? {
            if end > *now {
                break;
            }
            keys.push(candidate);
            candidate = end;
        }
        Ok(keys)
    }
}

impl<K: SequentialKey> fmt::Debug for Schedule<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FixedInterval { start, interval } => f
                .debug_struct("FixedInterval")
                .field("start", start)
                .field("interval", interval)
                .finish(),
            Self::VariableInterval { start, .. } => f
                .debug_struct("VariableInterval")
                .field("start", start)
                .finish_non_exhaustive(),
        }
    }
}

/// Deduplicated target ids in first-seen order.
#[derive(Debug, Clone)]
pub struct IdSet<K: ChunkKey> {
    order: Vec<K>,
    seen: HashSet<K>,
}

impl<K: ChunkKey> Default for IdSet<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ChunkKey> IdSet<K> {
    pub fn new() -> Self {
        Self {
            order: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Append every id not already present. Returns how many were added.
    pub fn extend<I>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = K>,
    {
        let before = self.order.len();
        for id in ids {
            if self.seen.insert(id.clone()) {
                self.order.push(id);
            }
        }
        self.order.len() - before
    }

    pub fn as_slice(&self) -> &[K] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &K) -> bool {
        self.seen.contains(id)
    }

    /// Target ids not yet fetched, in target order.
    pub fn missing(&self, fetched: &[K]) -> Vec<K> {
        let fetched: HashSet<&K> = fetched.iter().collect();
        self.order
            .iter()
            .filter(|id| !fetched.contains(id))
            .cloned()
            .collect()
    }

    /// Reorder so the already-fetched ids come first, in their persisted order,
    /// followed by the remaining targets. Fetched ids that were never targeted
    /// are adopted. Returns how many ids were adopted.
    pub fn align_with(&mut self, fetched: &[K]) -> usize {
        let fetched_set: HashSet<&K> = fetched.iter().collect();
        let is_prefix = self.order.len() >= fetched.len() && self.order[..fetched.len()] == *fetched;
        if is_prefix {
            return 0;
        }

        let adopted = fetched.iter().filter(|id| !self.seen.contains(*id)).count();
        let rest: Vec<K> = self
            .order
            .drain(..)
            .filter(|id| !fetched_set.contains(id))
            .collect();
        self.order = fetched.to_vec();
        self.order.extend(rest);
        self.seen = self.order.iter().cloned().collect();
        adopted
    }
}
