//! Thread-scope counter stores.
//!
//! The limiter persists thread counters through a [`ThreadCounterStore`] so
//! that limits hold across runs and across concurrent runs of one thread.
//! `increment` must be atomic: it returns the post-increment value, and the
//! limiter compares that value against the cap. Two concurrent requests
//! therefore always observe distinct counts.

use crate::error::CounterError;
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Boxed future returned by counter store methods.
pub type CounterFuture<'a, T> = BoxFuture<'a, Result<T, CounterError>>;

/// Persistent per-thread counters keyed by tool name (or the aggregate key).
pub trait ThreadCounterStore: Send + Sync {
    /// Current value, `0` when the counter does not exist.
    fn get<'a>(&'a self, thread_id: &'a str, key: &'a str) -> CounterFuture<'a, u64>;

    /// Atomically add one and return the new value.
    fn increment<'a>(&'a self, thread_id: &'a str, key: &'a str) -> CounterFuture<'a, u64>;
}

// ── In-memory store ────────────────────────────────────────────────

/// Process-local store. Counters live as long as the store.
#[derive(Default)]
pub struct InMemoryCounterStore {
    counters: Mutex<HashMap<(String, String), Arc<AtomicU64>>>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn counter(&self, thread_id: &str, key: &str) -> Arc<AtomicU64> {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters
            .entry((thread_id.to_string(), key.to_string()))
            .or_default()
            .clone()
    }

    fn peek(&self, thread_id: &str, key: &str) -> u64 {
        let counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        counters
            .get(&(thread_id.to_string(), key.to_string()))
            .map_or(0, |c| c.load(Ordering::SeqCst))
    }
}

impl ThreadCounterStore for InMemoryCounterStore {
    fn get<'a>(&'a self, thread_id: &'a str, key: &'a str) -> CounterFuture<'a, u64> {
        Box::pin(async move { Ok(self.peek(thread_id, key)) })
    }

    fn increment<'a>(&'a self, thread_id: &'a str, key: &'a str) -> CounterFuture<'a, u64> {
        Box::pin(async move {
            let counter = self.counter(thread_id, key);
            Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
        })
    }
}

// ── File-backed store ──────────────────────────────────────────────

type ThreadCounts = BTreeMap<String, BTreeMap<String, u64>>;

/// JSON file store: `{ "<thread_id>": { "<key>": count } }`.
///
/// Counters are cached in memory and written back after every increment
/// with an atomic temp-file + rename. Increments are serialized through an
/// async mutex, so one store instance is safe to share between runs.
/// Separate processes must not share a file.
pub struct FileCounterStore {
    path: PathBuf,
    counts: tokio::sync::Mutex<ThreadCounts>,
}

impl FileCounterStore {
    /// Open (or lazily create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CounterError> {
        let path = path.as_ref().to_path_buf();
        let counts = if path.exists() {
            let json = std::fs::read_to_string(&path)?;
            if json.trim().is_empty() {
                ThreadCounts::new()
            } else {
                serde_json::from_str(&json)?
            }
        } else {
            ThreadCounts::new()
        };
        debug!("Opened counter store at {} ({} thread(s))", path.display(), counts.len());
        Ok(Self {
            path,
            counts: tokio::sync::Mutex::new(counts),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `counts` with a temp file + rename. Synchronous, so a caller
    /// that is dropped mid-increment cannot split memory from disk.
    fn persist(&self, counts: &ThreadCounts) -> Result<(), CounterError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(counts)?;
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}

impl ThreadCounterStore for FileCounterStore {
    fn get<'a>(&'a self, thread_id: &'a str, key: &'a str) -> CounterFuture<'a, u64> {
        Box::pin(async move {
            let counts = self.counts.lock().await;
            Ok(counts
                .get(thread_id)
                .and_then(|keys| keys.get(key))
                .copied()
                .unwrap_or(0))
        })
    }

    fn increment<'a>(&'a self, thread_id: &'a str, key: &'a str) -> CounterFuture<'a, u64> {
        Box::pin(async move {
            let mut counts = self.counts.lock().await;
            // The cache only changes once the new value is on disk.
            let mut next = counts.clone();
            let slot = next
                .entry(thread_id.to_string())
                .or_default()
                .entry(key.to_string())
                .or_insert(0);
            *slot += 1;
            let value = *slot;
            self.persist(&next)?;
            *counts = next;
            Ok(value)
        })
    }
}
