//! Shared key/value backend for cached decisions, quota counters and bucket
//! state.
//!
//! Every entry carries an absolute expiry and expired entries read as absent.
//! [`StrategyStore::update`] is the single read-modify-write primitive: the
//! closure runs while the backend holds the key exclusively, so token refills,
//! quota increments and compare-and-set writes are atomic at the store level
//! even with many router instances sharing one backend.

mod redb_store;

pub use redb_store::RedbStore;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

/// Errors surfaced by store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("corrupt entry for key `{0}`")]
    Corrupt(String),
}

/// Outcome of an atomic update.
///
/// `value: None` leaves the stored entry untouched; `accepted` is an opaque
/// verdict the closure hands back to the caller (token granted, quota slot
/// taken, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub value: Option<Vec<u8>>,
    pub accepted: bool,
}

impl Mutation {
    pub fn write(value: Vec<u8>, accepted: bool) -> Self {
        Self {
            value: Some(value),
            accepted,
        }
    }

    pub fn keep(accepted: bool) -> Self {
        Self {
            value: None,
            accepted,
        }
    }
}

/// Closure applied by [`StrategyStore::update`] to the live value of a key.
pub type UpdateFn = Box<dyn FnOnce(Option<&[u8]>) -> Mutation + Send>;

/// Backend shared by every router instance.
#[async_trait]
pub trait StrategyStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the value of `key` in one all-or-nothing write.
    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Atomically read, transform and (optionally) rewrite `key`.
    ///
    /// A written value gets a fresh expiry of `ttl`.
    async fn update(&self, key: &str, ttl: Duration, apply: UpdateFn) -> Result<Mutation, StoreError>;
}

/// Writes between full sweeps of expired entries.
pub const SWEEP_INTERVAL: u64 = 256;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    entries: HashMap<String, MemoryEntry>,
    writes: u64,
}

impl MemoryState {
    /// Live value of `key`, evicting the entry if it has expired.
    fn live(&mut self, key: &str, now: Instant) -> Option<&MemoryEntry> {
        if self.entries.get(key).is_some_and(|entry| !entry.is_live(now)) {
            self.entries.remove(key);
        }
        self.entries.get(key)
    }

    fn insert(&mut self, key: &str, value: Vec<u8>, expires_at: Instant, now: Instant) {
        self.entries.insert(key.to_string(), MemoryEntry { value, expires_at });
        self.writes += 1;
        if self.writes % SWEEP_INTERVAL == 0 {
            self.sweep(now);
        }
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before - self.entries.len()
    }
}

/// Process-local store. Clones share the same map.
///
/// Expired entries are evicted when read and swept every
/// [`SWEEP_INTERVAL`] writes.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .map(|state| state.entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        match self.lock() {
            Ok(mut state) => state.sweep(Instant::now()),
            Err(_) => 0,
        }
    }
}

#[async_trait]
impl StrategyStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();
        let mut state = self.lock()?;
        Ok(state.live(key, now).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut state = self.lock()?;
        state.insert(key, value.to_vec(), now + ttl, now);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut state = self.lock()?;
        Ok(state.entries.remove(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn update(&self, key: &str, ttl: Duration, apply: UpdateFn) -> Result<Mutation, StoreError> {
        let now = Instant::now();
        let mut state = self.lock()?;
        let current = state.live(key, now).map(|entry| entry.value.as_slice());

        let mutation = apply(current);
        if let Some(ref value) = mutation.value {
            state.insert(key, value.clone(), now + ttl, now);
        }
        Ok(mutation)
    }
}

/// Decode a decimal counter written by [`encode_counter`].
pub fn decode_counter(raw: Option<&[u8]>) -> u64 {
    raw.and_then(|bytes| std::str::from_utf8(bytes).ok())
        .and_then(|text| text.trim().parse().ok())
        .unwrap_or(0)
}

pub fn encode_counter(value: u64) -> Vec<u8> {
    value.to_string().into_bytes()
}
