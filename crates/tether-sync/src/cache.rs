//! Query cache facade: the only component that touches entry storage.
//!
//! Entries are keyed by `(kind, params)` and hold opaque JSON values, so a
//! single dumb store serves every entity kind. Consistency between the
//! list-shaped view and the by-id view of an entity is deliberately NOT this
//! module's job; see [`crate::optimistic`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;

use tether_core::{QueryKey, QueryKind, SyncResult};

use crate::config::CacheTtlConfig;

/// One cached query result. `version` is the store's logical write counter
/// at the time of the write: last-writer-wins by operation order, not by
/// wall-clock arrival.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Option<Value>,
    pub last_fetched_at: DateTime<Utc>,
    pub stale_after: Duration,
    pub retain_until: DateTime<Utc>,
    pub stale: bool,
    pub version: u64,
}

impl CacheEntry {
    /// Fresh entries are served directly; stale ones are served while a
    /// revalidating refetch runs in the background.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        !self.stale && now - self.last_fetched_at < self.stale_after
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.retain_until
    }
}

struct Store {
    entries: HashMap<QueryKey, CacheEntry>,
    next_version: u64,
}

/// Keyed, TTL-governed store of query results.
pub struct QueryCache {
    store: Mutex<Store>,
    stale_after: Duration,
    retain_for: Duration,
}

impl QueryCache {
    pub fn new(ttl: &CacheTtlConfig) -> Self {
        Self::with_ttl(
            Duration::seconds(ttl.stale_after_secs as i64),
            Duration::seconds(ttl.retain_secs as i64),
        )
    }

    pub fn with_ttl(stale_after: Duration, retain_for: Duration) -> Self {
        Self {
            store: Mutex::new(Store {
                entries: HashMap::new(),
                next_version: 0,
            }),
            stale_after,
            retain_for,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of one entry, if present.
    pub fn read(&self, key: &QueryKey) -> Option<CacheEntry> {
        self.lock().entries.get(key).cloned()
    }

    /// Typed view of an entry's value. Absent entries and absent values are
    /// `None`; a value that no longer deserializes is an error.
    pub fn read_as<T: DeserializeOwned>(&self, key: &QueryKey) -> SyncResult<Option<T>> {
        match self.read(key).and_then(|entry| entry.value) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Functional update. The updater sees the prior value (or `None` for an
    /// absent entry) and returns the next one; returning `Some` stores a
    /// fresh entry, returning `None` leaves the store unchanged, so a write
    /// against a missing entry degrades to a no-op instead of erroring.
    /// Returns the value now stored under the key.
    pub fn write<F>(&self, key: &QueryKey, updater: F) -> Option<Value>
    where
        F: FnOnce(Option<Value>) -> Option<Value>,
    {
        self.write_at(key, updater, Utc::now())
    }

    fn write_at<F>(&self, key: &QueryKey, updater: F, now: DateTime<Utc>) -> Option<Value>
    where
        F: FnOnce(Option<Value>) -> Option<Value>,
    {
        let mut store = self.lock();
        let prior = store.entries.get(key).and_then(|entry| entry.value.clone());
        match updater(prior.clone()) {
            Some(next) => {
                store.next_version += 1;
                let version = store.next_version;
                store.entries.insert(
                    key.clone(),
                    CacheEntry {
                        value: Some(next.clone()),
                        last_fetched_at: now,
                        stale_after: self.stale_after,
                        retain_until: now + self.retain_for,
                        stale: false,
                        version,
                    },
                );
                Some(next)
            }
            None => prior,
        }
    }

    /// Mark one entry stale. Returns whether the entry existed.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        let mut store = self.lock();
        match store.entries.get_mut(key) {
            Some(entry) => {
                entry.stale = true;
                true
            }
            None => false,
        }
    }

    /// Mark every entry of a kind stale. Returns how many were marked.
    pub fn invalidate_kind(&self, kind: QueryKind) -> usize {
        let mut store = self.lock();
        let mut marked = 0;
        for (key, entry) in store.entries.iter_mut() {
            if key.kind() == kind {
                entry.stale = true;
                marked += 1;
            }
        }
        marked
    }

    /// Drop entries past their retention horizon. Returns how many were
    /// evicted.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let mut store = self.lock();
        let before = store.entries.len();
        store.entries.retain(|_, entry| !entry.is_expired(now));
        before - store.entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }
}
