//! Source of "now" for sequential caches.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::sync::{Arc, Mutex};

/// Supplies the current position on the key axis.
pub trait Clock<K>: Send + Sync {
    fn now(&self) -> K;
}

/// Wall clock in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock<DateTime<Utc>> for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl Clock<NaiveDateTime> for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Utc::now().naive_utc()
    }
}

/// Today's date. A daily chunk for today is only complete tomorrow.
impl Clock<NaiveDate> for SystemClock {
    fn now(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

/// Unix seconds.
impl Clock<i64> for SystemClock {
    fn now(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock<K> {
    now: Arc<Mutex<K>>,
}

impl<K: Clone + Send> ManualClock<K> {
    pub fn new(now: K) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: K) {
        *self.lock() = now;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, K> {
        // The guarded value is a plain key; a poisoned lock still holds a valid one.
        self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<K: Clone + Send> Clock<K> for ManualClock<K> {
    fn now(&self) -> K {
        self.lock().clone()
    }
}
