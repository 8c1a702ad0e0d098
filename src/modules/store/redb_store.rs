//! `redb`-backed store.
//!
//! Each value is framed as an 8-byte big-endian expiry (unix millis) followed
//! by the payload. redb serialises write transactions, which makes
//! [`StrategyStore::update`] atomic for every handle sharing the database.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redb::backends::InMemoryBackend;
use redb::{Database, ReadableTable, TableDefinition};

use super::{Mutation, SWEEP_INTERVAL, StoreError, StrategyStore, UpdateFn};

const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

const EXPIRY_PREFIX: usize = 8;

impl From<redb::Error> for StoreError {
    fn from(err: redb::Error) -> Self {
        match err {
            redb::Error::DatabaseAlreadyOpen => StoreError::Unavailable(err.to_string()),
            other => StoreError::Backend(other.to_string()),
        }
    }
}

/// Durable store shared by every clone of the handle.
///
/// Expired entries are removed when read and swept every
/// [`SWEEP_INTERVAL`] writes made through this handle.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    writes: Arc<AtomicU64>,
}

impl RedbStore {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(redb::Error::from)?;
        Self::initialise(db)
    }

    /// Volatile database, mainly for tests and single-process deployments.
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(redb::Error::from)?;
        Self::initialise(db)
    }

    fn initialise(db: Database) -> Result<Self, StoreError> {
        let txn = db.begin_write().map_err(redb::Error::from)?;
        txn.open_table(ENTRIES).map_err(redb::Error::from)?;
        txn.commit().map_err(redb::Error::from)?;
        Ok(Self {
            db: Arc::new(db),
            writes: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Remove every expired or unreadable entry.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        self.run_blocking(sweep).await
    }

    async fn note_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_INTERVAL != 0 {
            return;
        }
        match self.purge_expired().await {
            Ok(0) => {}
            Ok(removed) => log::debug!("redb sweep removed {removed} expired entries"),
            Err(err) => log::warn!("redb sweep failed: {err}"),
        }
    }

    async fn run_blocking<T, F>(&self, job: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || job(&db))
            .await
            .map_err(|err| StoreError::Unavailable(format!("redb worker failed: {err}")))?
    }
}

impl std::fmt::Debug for RedbStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStore").finish_non_exhaustive()
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn frame(value: &[u8], ttl: Duration) -> Vec<u8> {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    let expires_at = now_millis().saturating_add(ttl_ms);
    let mut framed = Vec::with_capacity(EXPIRY_PREFIX + value.len());
    framed.extend_from_slice(&expires_at.to_be_bytes());
    framed.extend_from_slice(value);
    framed
}

fn expiry_of(raw: &[u8]) -> Option<i64> {
    let prefix = raw.get(..EXPIRY_PREFIX)?;
    let mut expiry = [0u8; EXPIRY_PREFIX];
    expiry.copy_from_slice(prefix);
    Some(i64::from_be_bytes(expiry))
}

/// Live payload of a framed value, `None` once expired.
fn unframe(key: &str, raw: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
    let expiry = expiry_of(raw).ok_or_else(|| StoreError::Corrupt(key.to_string()))?;
    if expiry <= now_millis() {
        return Ok(None);
    }
    Ok(Some(raw[EXPIRY_PREFIX..].to_vec()))
}

fn is_stale(raw: &[u8], now: i64) -> bool {
    expiry_of(raw).is_none_or(|expiry| expiry <= now)
}

fn sweep(db: &Database) -> Result<usize, StoreError> {
    let txn = db.begin_write().map_err(redb::Error::from)?;
    let removed = {
        let mut table = txn.open_table(ENTRIES).map_err(redb::Error::from)?;
        let now = now_millis();
        let mut stale = Vec::new();
        for item in table.iter().map_err(redb::Error::from)? {
            let (key, value) = item.map_err(redb::Error::from)?;
            if is_stale(value.value(), now) {
                stale.push(key.value().to_string());
            }
        }
        for key in &stale {
            table.remove(key.as_str()).map_err(redb::Error::from)?;
        }
        stale.len()
    };
    txn.commit().map_err(redb::Error::from)?;
    Ok(removed)
}

/// Delete `key` if it is still expired inside a write transaction.
fn evict_if_stale(db: &Database, key: &str) -> Result<(), StoreError> {
    let txn = db.begin_write().map_err(redb::Error::from)?;
    {
        let mut table = txn.open_table(ENTRIES).map_err(redb::Error::from)?;
        let stale = table
            .get(key)
            .map_err(redb::Error::from)?
            .is_some_and(|guard| is_stale(guard.value(), now_millis()));
        if stale {
            table.remove(key).map_err(redb::Error::from)?;
        }
    }
    txn.commit().map_err(redb::Error::from)?;
    Ok(())
}

#[async_trait]
impl StrategyStore for RedbStore {
    fn name(&self) -> &'static str {
        "redb"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = key.to_string();
        self.run_blocking(move |db| {
            let (live, stale) = {
                let txn = db.begin_read().map_err(redb::Error::from)?;
                let table = txn.open_table(ENTRIES).map_err(redb::Error::from)?;
                match table.get(key.as_str()).map_err(redb::Error::from)? {
                    Some(guard) => {
                        let live = unframe(&key, guard.value())?;
                        let stale = live.is_none();
                        (live, stale)
                    }
                    None => (None, false),
                }
            };
            if stale {
                if let Err(err) = evict_if_stale(db, &key) {
                    log::warn!("could not evict expired redb entry: {err}");
                }
            }
            Ok(live)
        })
        .await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Duration) -> Result<(), StoreError> {
        let key = key.to_string();
        let framed = frame(value, ttl);
        self.run_blocking(move |db| {
            let txn = db.begin_write().map_err(redb::Error::from)?;
            {
                let mut table = txn.open_table(ENTRIES).map_err(redb::Error::from)?;
                table
                    .insert(key.as_str(), framed.as_slice())
                    .map_err(redb::Error::from)?;
            }
            txn.commit().map_err(redb::Error::from)?;
            Ok(())
        })
        .await?;
        self.note_write().await;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        self.run_blocking(move |db| {
            let txn = db.begin_write().map_err(redb::Error::from)?;
            let removed = {
                let mut table = txn.open_table(ENTRIES).map_err(redb::Error::from)?;
                let previous = table.remove(key.as_str()).map_err(redb::Error::from)?;
                match previous {
                    Some(guard) => unframe(&key, guard.value()).unwrap_or(None).is_some(),
                    None => false,
                }
            };
            txn.commit().map_err(redb::Error::from)?;
            Ok(removed)
        })
        .await
    }

    async fn update(&self, key: &str, ttl: Duration, apply: UpdateFn) -> Result<Mutation, StoreError> {
        let key = key.to_string();
        let mutation = self.run_blocking(move |db| {
            let txn = db.begin_write().map_err(redb::Error::from)?;
            let mutation = {
                let mut table = txn.open_table(ENTRIES).map_err(redb::Error::from)?;
                let (current, present) = match table.get(key.as_str()).map_err(redb::Error::from)? {
                    Some(guard) => match unframe(&key, guard.value()) {
                        Ok(live) => (live, true),
                        Err(err) => {
                            log::warn!("overwriting unreadable redb entry: {err}");
                            (None, true)
                        }
                    },
                    None => (None, false),
                };

                let mutation = apply(current.as_deref());
                if let Some(ref value) = mutation.value {
                    let framed = frame(value, ttl);
                    table
                        .insert(key.as_str(), framed.as_slice())
                        .map_err(redb::Error::from)?;
                } else if present && current.is_none() {
                    table.remove(key.as_str()).map_err(redb::Error::from)?;
                }
                mutation
            };
            txn.commit().map_err(redb::Error::from)?;
            Ok(mutation)
        })
        .await?;
        if mutation.value.is_some() {
            self.note_write().await;
        }
        Ok(mutation)
    }
}
