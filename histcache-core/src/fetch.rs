//! Fetch orchestrator: concurrent per-chunk fetches with staggered dispatch.
//!
//! One tokio task is spawned per missing chunk, in key order, with a pause of
//! `stagger` between successive spawns. The pause spaces out request start
//! times for rate-limited sources; it does not cap how many fetches are in
//! flight. Results are joined in key order regardless of completion order,
//! and any failure fails the whole batch.

use crate::error::{CacheError, CacheResult, ChunkFailure};
use crate::key::ChunkKey;
use async_trait::async_trait;
use polars::prelude::DataFrame;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fetches the table fragment for exactly one chunk.
///
/// Called concurrently with itself, so implementations must not rely on
/// shared mutable state between calls. Any extra request parameters (symbol,
/// API token, HTTP client) live in the implementing value.
#[async_trait]
pub trait ChunkFetcher<K: ChunkKey>: Send + Sync {
    async fn fetch_one(&self, key: &K) -> anyhow::Result<DataFrame>;
}

/// Adapter turning an async closure into a [`ChunkFetcher`].
pub struct FnFetcher<F> {
    f: F,
}

/// Wrap `|key: K| async move { ... }` as a fetcher.
pub fn fetcher_fn<K, F, Fut>(f: F) -> FnFetcher<F>
where
    F: Fn(K) -> Fut,
    Fut: Future<Output = anyhow::Result<DataFrame>>,
{
    FnFetcher { f }
}

#[async_trait]
impl<K, F, Fut> ChunkFetcher<K> for FnFetcher<F>
where
    K: ChunkKey,
    F: Fn(K) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<DataFrame>> + Send + 'static,
{
    async fn fetch_one(&self, key: &K) -> anyhow::Result<DataFrame> {
        (self.f)(key.clone()).await
    }
}

/// Progress callbacks for a batch of chunk fetches.
///
/// `on_start` fires as each fetch is dispatched; `on_complete` fires in key
/// order while results are joined. All methods default to no-ops.
pub trait FetchProgress: Send + Sync {
    fn on_start(&self, _key: &str, _index: usize, _total: usize) {}

    /// `outcome` is the fragment's row count, or the failure message.
    fn on_complete(&self, _key: &str, _index: usize, _total: usize, _outcome: Result<usize, &str>) {
    }

    fn on_batch_complete(&self, _succeeded: usize, _failed: usize, _total: usize) {}
}

/// Reports nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl FetchProgress for NoProgress {}

/// Reports through `tracing`, tagged with the cache key.
#[derive(Debug, Clone)]
pub struct LogProgress {
    pub cache: String,
}

impl LogProgress {
    pub fn new(cache: impl Into<String>) -> Self {
        Self {
            cache: cache.into(),
        }
    }
}

impl FetchProgress for LogProgress {
    fn on_start(&self, key: &str, index: usize, total: usize) {
        debug!(cache = %self.cache, "[{}/{}] fetching chunk {key}", index + 1, total);
    }

    fn on_complete(&self, key: &str, _index: usize, _total: usize, outcome: Result<usize, &str>) {
        match outcome {
            Ok(rows) => debug!(cache = %self.cache, "chunk {key}: {rows} rows"),
            Err(e) => warn!(cache = %self.cache, "chunk {key} failed: {e}"),
        }
    }

    fn on_batch_complete(&self, succeeded: usize, failed: usize, total: usize) {
        info!(
            cache = %self.cache,
            "fetched {succeeded}/{total} chunks, {failed} failed"
        );
    }
}

/// Fetch every key concurrently and return one fragment per key, in key order.
///
/// Must run inside a tokio runtime. All spawned fetches are awaited before
/// returning, even when some fail; the error then lists every failed key.
pub async fn fetch_all<K: ChunkKey>(
    keys: &[K],
    fetcher: Arc<dyn ChunkFetcher<K>>,
    stagger: Duration,
    progress: &dyn FetchProgress,
) -> CacheResult<Vec<DataFrame>> {
    let total = keys.len();
    let mut handles = Vec::with_capacity(total);

    for (i, key) in keys.iter().enumerate() {
        if i > 0 && !stagger.is_zero() {
            tokio::time::sleep(stagger).await;
        }
        progress.on_start(&key.to_string(), i, total);

        let fetcher = Arc::clone(&fetcher);
        let key = key.clone();
        handles.push(tokio::spawn(async move { fetcher.fetch_one(&key).await }));
    }

    let mut fragments = Vec::with_capacity(total);
    let mut failures = Vec::new();

    for (i, (key, handle)) in keys.iter().zip(handles).enumerate() {
        let label = key.to_string();
        let outcome = match handle.await {
            Ok(Ok(df)) => Ok(df),
            Ok(Err(e)) => Err(format!("{e:#}")),
            Err(join_err) => Err(format!("fetch task aborted: {join_err}")),
        };

        match outcome {
            Ok(df) => {
                progress.on_complete(&label, i, total, Ok(df.height()));
                fragments.push(df);
            }
            Err(message) => {
                progress.on_complete(&label, i, total, Err(message.as_str()));
                failures.push(ChunkFailure {
                    key: label,
                    message,
                });
            }
        }
    }

    progress.on_batch_complete(total - failures.len(), failures.len(), total);

    if failures.is_empty() {
        Ok(fragments)
    } else {
        Err(CacheError::ChunkFetch { failures })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polars::prelude::*;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn one_row(key: i64) -> DataFrame {
        df!("index" => &[key], "value" => &[key * 10]).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl FetchProgress for Recorder {
        fn on_start(&self, key: &str, _index: usize, _total: usize) {
            self.events.lock().unwrap().push(format!("start {key}"));
        }

        fn on_complete(&self, key: &str, _i: usize, _t: usize, outcome: Result<usize, &str>) {
            let tag = if outcome.is_ok() { "ok" } else { "err" };
            self.events.lock().unwrap().push(format!("{tag} {key}"));
        }

        fn on_batch_complete(&self, succeeded: usize, failed: usize, total: usize) {
            self.events
                .lock()
                .unwrap()
                .push(format!("done {succeeded}/{failed}/{total}"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn results_follow_key_order_not_completion_order() {
        // Earlier keys take longer, so completion order is reversed.
        let fetcher = Arc::new(fetcher_fn(|k: i64| async move {
            tokio::time::sleep(Duration::from_millis(100 * (5 - k as u64))).await;
            Ok(one_row(k))
        }));
        let keys = vec![1i64, 2, 3, 4];
        let frames = fetch_all(&keys, fetcher, Duration::ZERO, &NoProgress)
            .await
            .unwrap();

        let got: Vec<i64> = frames
            .iter()
            .map(|df| df.column("index").unwrap().i64().unwrap().get(0).unwrap())
            .collect();
        assert_eq!(got, keys);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_is_staggered_but_fetches_overlap() {
        let starts = Arc::new(Mutex::new(Vec::new()));
        let origin = Instant::now();
        let recorded = Arc::clone(&starts);
        let fetcher = Arc::new(fetcher_fn(move |k: i64| {
            recorded.lock().unwrap().push(origin.elapsed());
            async move {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(one_row(k))
            }
        }));

        let keys = vec![1i64, 2, 3];
        fetch_all(&keys, fetcher, Duration::from_secs(1), &NoProgress)
            .await
            .unwrap();

        let starts = starts.lock().unwrap().clone();
        assert_eq!(
            starts,
            vec![Duration::ZERO, Duration::from_secs(1), Duration::from_secs(2)]
        );
        // Three 10s fetches overlapped: total is 2s of stagger plus one fetch.
        assert_eq!(origin.elapsed(), Duration::from_secs(12));
    }

    #[tokio::test]
    async fn any_failure_fails_the_batch_and_names_keys() {
        let fetcher = Arc::new(fetcher_fn(|k: i64| async move {
            if k % 2 == 0 {
                anyhow::bail!("upstream 503 for {k}");
            }
            Ok(one_row(k))
        }));
        let recorder = Recorder::default();
        let err = fetch_all(&[1i64, 2, 3, 4], fetcher, Duration::ZERO, &recorder)
            .await
            .unwrap_err();

        assert_eq!(err.failed_keys(), vec!["2", "4"]);
        assert!(err.to_string().contains("upstream 503 for 2"));

        let events = recorder.events.lock().unwrap().clone();
        assert_eq!(events.last().unwrap(), "done 2/2/4");
        assert!(events.contains(&"err 4".to_string()));
    }

    #[tokio::test]
    async fn panicking_fetch_is_reported_as_failure() {
        let fetcher = Arc::new(fetcher_fn(|k: i64| async move {
            if k == 7 {
                panic!("fetcher bug");
            }
            Ok(one_row(k))
        }));
        let err = fetch_all(&[6i64, 7], fetcher, Duration::ZERO, &NoProgress)
            .await
            .unwrap_err();
        assert_eq!(err.failed_keys(), vec!["7"]);
    }

    #[tokio::test]
    async fn empty_key_list_spawns_nothing() {
        let fetcher = Arc::new(fetcher_fn(|_k: i64| async move {
            Err::<DataFrame, _>(anyhow::anyhow!("should not be called"))
        }));
        let frames = fetch_all::<i64>(&[], fetcher, Duration::from_secs(5), &NoProgress)
            .await
            .unwrap();
        assert!(frames.is_empty());
    }
}
