//! Daily advisory quota.
//!
//! One decimal counter per UTC day under `advisory:requests:{YYYY-MM-DD}`.
//!
//! A call first takes a [`QuotaReservation`]: one atomic increment granted
//! only while the counter (confirmed successes plus calls in flight) is below
//! the soft threshold. Committing keeps the slot; releasing or dropping the
//! reservation gives it back, so once calls settle the counter holds
//! confirmed successes only.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};

use crate::modules::store::{Mutation, StoreError, StrategyStore, decode_counter, encode_counter};

pub const QUOTA_KEY_PREFIX: &str = "advisory:requests:";

pub const QUOTA_TTL: Duration = Duration::from_secs(86_400);

pub const DEFAULT_DAILY_LIMIT: u64 = 1_500;

pub const DEFAULT_SOFT_RATIO: f64 = 0.8;

pub fn key_for(date: NaiveDate) -> String {
    format!("{QUOTA_KEY_PREFIX}{}", date.format("%Y-%m-%d"))
}

/// Shared per-day counter of successful advisory calls.
#[derive(Clone)]
pub struct QuotaTracker {
    store: Arc<dyn StrategyStore>,
    daily_limit: u64,
    soft_ratio: f64,
}

impl QuotaTracker {
    pub fn new(store: Arc<dyn StrategyStore>) -> Self {
        Self {
            store,
            daily_limit: DEFAULT_DAILY_LIMIT,
            soft_ratio: DEFAULT_SOFT_RATIO,
        }
    }

    pub fn with_daily_limit(mut self, limit: u64) -> Self {
        self.daily_limit = limit;
        self
    }

    pub fn with_soft_ratio(mut self, ratio: f64) -> Self {
        self.soft_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn daily_limit(&self) -> u64 {
        self.daily_limit
    }

    /// Count at which new advisory calls stop being issued.
    pub fn soft_threshold(&self) -> f64 {
        self.daily_limit as f64 * self.soft_ratio
    }

    pub async fn usage(&self) -> Result<u64, StoreError> {
        self.usage_on(Utc::now().date_naive()).await
    }

    pub async fn usage_on(&self, date: NaiveDate) -> Result<u64, StoreError> {
        let raw = self.store.get(&key_for(date)).await?;
        Ok(decode_counter(raw.as_deref()))
    }

    /// Whether today's usage is still below the soft threshold.
    ///
    /// An unreadable counter grants the call.
    pub async fn has_headroom(&self) -> bool {
        self.has_headroom_on(Utc::now().date_naive()).await
    }

    pub async fn has_headroom_on(&self, date: NaiveDate) -> bool {
        match self.usage_on(date).await {
            Ok(count) => {
                let open = (count as f64) < self.soft_threshold();
                if !open {
                    log::warn!(
                        "advisory quota at {count}/{} (soft threshold {:.0}), skipping",
                        self.daily_limit,
                        self.soft_threshold()
                    );
                }
                open
            }
            Err(err) => {
                log::warn!("advisory quota unreadable, failing open: {err}");
                true
            }
        }
    }

    /// Take one slot below the soft threshold for an advisory call.
    ///
    /// `None` means the gate is closed. An unreachable store grants an
    /// unmetered reservation.
    pub async fn reserve(&self) -> Option<QuotaReservation> {
        self.reserve_on(Utc::now().date_naive()).await
    }

    pub async fn reserve_on(&self, date: NaiveDate) -> Option<QuotaReservation> {
        let key = key_for(date);
        let threshold = self.soft_threshold();
        let result = self
            .store
            .update(
                &key,
                QUOTA_TTL,
                Box::new(move |current| {
                    let count = decode_counter(current);
                    if (count as f64) < threshold {
                        Mutation::write(encode_counter(count + 1), true)
                    } else {
                        Mutation::keep(false)
                    }
                }),
            )
            .await;

        let metered = match result {
            Ok(mutation) if mutation.accepted => true,
            Ok(_) => {
                log::warn!(
                    "advisory quota at soft threshold {threshold:.0} of {}, skipping",
                    self.daily_limit
                );
                return None;
            }
            Err(err) => {
                log::warn!("advisory quota unreachable, failing open: {err}");
                false
            }
        };

        Some(QuotaReservation {
            quota: self.clone(),
            date,
            metered,
            settled: false,
        })
    }

    /// Count one successful advisory call against today.
    ///
    /// Returns `false` when the ceiling was already reached.
    pub async fn record_success(&self) -> Result<bool, StoreError> {
        self.record_success_on(Utc::now().date_naive()).await
    }

    pub async fn record_success_on(&self, date: NaiveDate) -> Result<bool, StoreError> {
        let ceiling = self.daily_limit;
        let mutation = self
            .store
            .update(
                &key_for(date),
                QUOTA_TTL,
                Box::new(move |current| {
                    let count = decode_counter(current);
                    if count >= ceiling {
                        Mutation::keep(false)
                    } else {
                        Mutation::write(encode_counter(count + 1), true)
                    }
                }),
            )
            .await?;
        Ok(mutation.accepted)
    }
}

async fn give_back(store: &dyn StrategyStore, key: &str) -> Result<(), StoreError> {
    store
        .update(
            key,
            QUOTA_TTL,
            Box::new(|current| match decode_counter(current) {
                0 => Mutation::keep(false),
                count => Mutation::write(encode_counter(count - 1), true),
            }),
        )
        .await?;
    Ok(())
}

/// Slot held against the daily quota while an advisory call is in flight.
///
/// Dropping an unsettled reservation (a cancelled request) releases the slot
/// on the current runtime.
pub struct QuotaReservation {
    quota: QuotaTracker,
    date: NaiveDate,
    metered: bool,
    settled: bool,
}

impl QuotaReservation {
    /// Whether the slot was actually taken in the store.
    pub fn is_metered(&self) -> bool {
        self.metered
    }

    /// Keep the slot as a confirmed success.
    ///
    /// Returns `false` when an unmetered call found the ceiling already
    /// reached.
    pub async fn commit(mut self) -> Result<bool, StoreError> {
        self.settled = true;
        if self.metered {
            return Ok(true);
        }
        self.quota.record_success_on(self.date).await
    }

    /// Give the slot back after a failed call.
    pub async fn release(mut self) -> Result<(), StoreError> {
        self.settled = true;
        if !self.metered {
            return Ok(());
        }
        give_back(self.quota.store.as_ref(), &key_for(self.date)).await
    }
}

impl Drop for QuotaReservation {
    fn drop(&mut self) {
        if self.settled || !self.metered {
            return;
        }
        let key = key_for(self.date);
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            log::warn!("advisory quota slot on {key} not released: no runtime");
            return;
        };
        let store = self.quota.store.clone();
        handle.spawn(async move {
            if let Err(err) = give_back(store.as_ref(), &key).await {
                log::warn!("advisory quota slot on {key} not released: {err}");
            }
        });
    }
}

impl std::fmt::Debug for QuotaReservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaReservation")
            .field("date", &self.date)
            .field("metered", &self.metered)
            .field("settled", &self.settled)
            .finish()
    }
}

impl std::fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaTracker")
            .field("store", &self.store.name())
            .field("daily_limit", &self.daily_limit)
            .field("soft_ratio", &self.soft_ratio)
            .finish()
    }
}
