//! In-process TTL key-value store.
//!
//! A plain `RwLock<HashMap>` guarded map, the way a small cache is built when
//! it doesn't need to leave the process: no network hop, no serialization
//! format beyond what the caller already has as bytes. Expiry is checked
//! lazily on every `get`/`has`, and an optional background sweeper reclaims
//! entries nobody reads again so memory doesn't grow on write-only keys.
//!
//! [`RateLimiter`](crate::ratelimit::RateLimiter) and
//! [`SessionManager`](crate::session::SessionManager) are both built on top
//! of a [`TtlStore`] rather than rolling their own expiry bookkeeping.

use crate::limits::StoreLimits;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};
use tokio::task::JoinHandle;
use tracing::trace;

struct Entry {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    #[inline]
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now <= at)
    }
}

/// Absence reported by [`TtlStore::get`]: the key was never set, already
/// expired, or was deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotFound;

struct Inner {
    entries: RwLock<HashMap<String, Entry>>,
    limits: StoreLimits,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

/// A concurrent, process-local map from string key to `(bytes, optional TTL)`.
///
/// Cloning a `TtlStore` is cheap and shares the same underlying map and
/// sweeper task, the same way [`Pool`](crate::pool::Pool) shares a queue.
#[derive(Clone)]
pub struct TtlStore {
    inner: Arc<Inner>,
}

impl TtlStore {
    /// Builds a store and, if `limits.sweep_interval` is non-zero, spawns the
    /// background sweeper task on the current tokio runtime.
    pub fn new(limits: StoreLimits) -> Self {
        let inner = Arc::new(Inner {
            entries: RwLock::new(HashMap::new()),
            limits,
            sweeper: Mutex::new(None),
        });

        if inner.limits.sweep_interval > Duration::ZERO {
            let sweep_inner = Arc::clone(&inner);
            let handle = tokio::spawn(async move {
                let mut tick = tokio::time::interval(sweep_inner.limits.sweep_interval);
                loop {
                    tick.tick().await;
                    sweep_inner.sweep();
                }
            });
            *inner.sweeper.lock().unwrap() = Some(handle);
        }

        TtlStore { inner }
    }

    /// Returns a copy of the stored bytes, or [`NotFound`] if the key is
    /// absent or its TTL has passed (in which case the entry is also removed).
    pub fn get(&self, key: &str) -> Result<Vec<u8>, NotFound> {
        let now = Instant::now();
        {
            let entries = self.inner.entries.read().unwrap();
            if let Some(entry) = entries.get(key) {
                if entry.is_live(now) {
                    return Ok(entry.bytes.clone());
                }
            } else {
                return Err(NotFound);
            }
        }

        // Entry existed but expired: drop it under a write lock, then report absent.
        self.inner.entries.write().unwrap().remove(key);
        Err(NotFound)
    }

    /// Copies `value` into the store under `key`. `ttl == Duration::ZERO`
    /// means no expiry. Always overwrites any existing entry.
    pub fn set(&self, key: impl Into<String>, value: &[u8], ttl: Duration) {
        let key = key.into();
        let entry = Entry {
            bytes: value.to_vec(),
            expires_at: (ttl > Duration::ZERO).then(|| Instant::now() + ttl),
        };

        let mut entries = self.inner.entries.write().unwrap();
        if entries.len() >= self.inner.limits.max_entries && !entries.contains_key(&key) {
            // At capacity: evict whichever TTL'd entry expires soonest. If every
            // entry is permanent, there's nothing safe to evict, so the new
            // key is simply not admitted.
            if !Self::evict_one(&mut entries) {
                return;
            }
        }
        entries.insert(key, entry);
    }

    /// Same expiry check as [`get`](TtlStore::get), without copying the value.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.inner.entries.read().unwrap().get(key) {
            Some(entry) => entry.is_live(now),
            None => false,
        }
    }

    /// Idempotent removal; returns `true` if a live entry was present.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.entries.write().unwrap().remove(key).is_some()
    }

    /// Removes every entry.
    pub fn clear(&self) {
        self.inner.entries.write().unwrap().clear();
    }

    /// Stops the background sweeper task, if one is running. Safe to call
    /// more than once; later calls are no-ops.
    pub fn close(&self) {
        if let Some(handle) = self.inner.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Evicts the entry with the soonest expiry among TTL'd entries.
    /// Returns `false` (evicting nothing) if every entry is permanent.
    fn evict_one(entries: &mut HashMap<String, Entry>) -> bool {
        let soonest = entries
            .iter()
            .filter_map(|(k, e)| e.expires_at.map(|at| (k.clone(), at)))
            .min_by_key(|(_, at)| *at)
            .map(|(k, _)| k);

        match soonest {
            Some(key) => {
                entries.remove(&key);
                true
            }
            None => false,
        }
    }
}

impl Inner {
    fn sweep(&self) {
        let now = Instant::now();
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        let evicted = before - entries.len();
        if evicted > 0 {
            trace!(target: "store", "sweep evicted {evicted} expired entries");
        }
    }
}
