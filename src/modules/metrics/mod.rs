//! Cascade usage statistics.
//!
//! Each counter is a decimal value under `stats:{YYYY-MM-DD}:{counter}` in the
//! shared store, bumped with one atomic update, so every router instance on
//! the same backend reports the same figures for the current UTC day. Local
//! atomics mirror the counts of this instance and stand in for the shared
//! view whenever the store cannot be read.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::decision::DecisionSource;
use crate::modules::store::{Mutation, StrategyStore, decode_counter, encode_counter};

pub const STATS_KEY_PREFIX: &str = "stats:";

pub const STATS_TTL: Duration = Duration::from_secs(86_400);

/// Counters kept for every day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Cached,
    RuleBased,
    Classifier,
    Advisory,
    Fallback,
    AdvisorySkipped,
    AdvisoryFailed,
}

impl Counter {
    pub const ALL: [Counter; 7] = [
        Counter::Cached,
        Counter::RuleBased,
        Counter::Classifier,
        Counter::Advisory,
        Counter::Fallback,
        Counter::AdvisorySkipped,
        Counter::AdvisoryFailed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Counter::Cached => "cached",
            Counter::RuleBased => "rule_based",
            Counter::Classifier => "classifier",
            Counter::Advisory => "advisory",
            Counter::Fallback => "fallback",
            Counter::AdvisorySkipped => "advisory_skipped",
            Counter::AdvisoryFailed => "advisory_failed",
        }
    }

    fn for_source(source: DecisionSource) -> Self {
        match source {
            DecisionSource::Cache => Counter::Cached,
            DecisionSource::Rule => Counter::RuleBased,
            DecisionSource::Classifier => Counter::Classifier,
            DecisionSource::Advisory => Counter::Advisory,
            DecisionSource::Fallback => Counter::Fallback,
        }
    }
}

pub fn stats_key(date: NaiveDate, counter: Counter) -> String {
    format!("{STATS_KEY_PREFIX}{}:{}", date.format("%Y-%m-%d"), counter.as_str())
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CascadeStatistics {
    pub started_at: DateTime<Utc>,
    /// `true` when read from the shared store, `false` for this instance only.
    pub shared: bool,
    pub total_requests: u64,
    pub cached: u64,
    pub rule_based: u64,
    pub classifier: u64,
    pub advisory: u64,
    pub fallback: u64,
    pub advisory_skipped: u64,
    pub advisory_failed: u64,
    pub cached_pct: f64,
    pub rule_based_pct: f64,
    pub classifier_pct: f64,
    pub advisory_pct: f64,
    pub fallback_pct: f64,
    /// Requests answered without an advisory call.
    pub calls_saved: u64,
    /// `total / max(advisory, 1)`.
    pub reduction_factor: f64,
}

impl CascadeStatistics {
    fn from_counts(started_at: DateTime<Utc>, shared: bool, counts: [u64; 7]) -> Self {
        let [cached, rule_based, classifier, advisory, fallback, advisory_skipped, advisory_failed] = counts;
        let total = cached + rule_based + classifier + advisory + fallback;

        let pct = |count: u64| {
            if total == 0 {
                0.0
            } else {
                count as f64 / total as f64 * 100.0
            }
        };

        Self {
            started_at,
            shared,
            total_requests: total,
            cached,
            rule_based,
            classifier,
            advisory,
            fallback,
            advisory_skipped,
            advisory_failed,
            cached_pct: pct(cached),
            rule_based_pct: pct(rule_based),
            classifier_pct: pct(classifier),
            advisory_pct: pct(advisory),
            fallback_pct: pct(fallback),
            calls_saved: total.saturating_sub(advisory),
            reduction_factor: total as f64 / advisory.max(1) as f64,
        }
    }
}

/// Request counters for one router, optionally shared through a store.
pub struct UsageStatistics {
    started_at: DateTime<Utc>,
    store: Option<Arc<dyn StrategyStore>>,
    local: [AtomicU64; 7],
}

impl Default for UsageStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageStatistics {
    /// Counters held by this instance only.
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            store: None,
            local: Default::default(),
        }
    }

    /// Counters shared with every instance using `store`.
    pub fn shared(store: Arc<dyn StrategyStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new()
        }
    }

    /// Count one answered request against the tier that served it.
    pub async fn record(&self, source: DecisionSource) {
        self.bump(Counter::for_source(source)).await;
    }

    pub async fn record_advisory_skipped(&self) {
        self.bump(Counter::AdvisorySkipped).await;
    }

    pub async fn record_advisory_failed(&self) {
        self.bump(Counter::AdvisoryFailed).await;
    }

    async fn bump(&self, counter: Counter) {
        self.local[counter as usize].fetch_add(1, Ordering::Relaxed);
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let key = stats_key(Utc::now().date_naive(), counter);
        let result = store
            .update(
                &key,
                STATS_TTL,
                Box::new(|current| Mutation::write(encode_counter(decode_counter(current) + 1), true)),
            )
            .await;
        if let Err(err) = result {
            log::warn!("statistics counter {key} not updated: {err}");
        }
    }

    /// Counts recorded by this instance since it started.
    pub fn local_snapshot(&self) -> CascadeStatistics {
        let counts = std::array::from_fn(|i| self.local[i].load(Ordering::Relaxed));
        CascadeStatistics::from_counts(self.started_at, false, counts)
    }

    /// Today's shared counts, or the local ones if the store is unreadable.
    pub async fn snapshot(&self) -> CascadeStatistics {
        let Some(store) = self.store.as_ref() else {
            return self.local_snapshot();
        };
        let today = Utc::now().date_naive();
        let mut counts = [0u64; 7];
        for counter in Counter::ALL {
            match store.get(&stats_key(today, counter)).await {
                Ok(raw) => counts[counter as usize] = decode_counter(raw.as_deref()),
                Err(err) => {
                    log::warn!("shared statistics unreadable, reporting local counts: {err}");
                    return self.local_snapshot();
                }
            }
        }
        CascadeStatistics::from_counts(self.started_at, true, counts)
    }
}

impl std::fmt::Debug for UsageStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageStatistics")
            .field("started_at", &self.started_at)
            .field("store", &self.store.as_ref().map(|s| s.name()))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::store::MemoryStore;

    #[tokio::test]
    async fn derives_percentages_and_savings() {
        let stats = UsageStatistics::new();
        for _ in 0..6 {
            stats.record(DecisionSource::Cache).await;
        }
        stats.record(DecisionSource::Rule).await;
        stats.record(DecisionSource::Rule).await;
        stats.record(DecisionSource::Classifier).await;
        stats.record(DecisionSource::Advisory).await;
        stats.record_advisory_skipped().await;

        let snapshot = stats.snapshot().await;
        assert!(!snapshot.shared);
        assert_eq!(snapshot.total_requests, 10);
        assert_eq!(snapshot.cached_pct, 60.0);
        assert_eq!(snapshot.rule_based_pct, 20.0);
        assert_eq!(snapshot.advisory_pct, 10.0);
        assert_eq!(snapshot.calls_saved, 9);
        assert_eq!(snapshot.reduction_factor, 10.0);
        assert_eq!(snapshot.advisory_skipped, 1);
    }

    #[test]
    fn empty_snapshot_has_no_division_by_zero() {
        let snapshot = UsageStatistics::new().local_snapshot();
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.cached_pct, 0.0);
        assert_eq!(snapshot.reduction_factor, 0.0);
    }

    #[test]
    fn key_names_day_and_counter() {
        let day = NaiveDate::from_ymd_opt(2026, 5, 1).unwrap();
        assert_eq!(stats_key(day, Counter::RuleBased), "stats:2026-05-01:rule_based");
    }

    #[tokio::test]
    async fn instances_on_one_store_share_counts() {
        let store: Arc<dyn StrategyStore> = Arc::new(MemoryStore::new());
        let east = UsageStatistics::shared(store.clone());
        let west = UsageStatistics::shared(store);

        east.record(DecisionSource::Advisory).await;
        west.record(DecisionSource::Cache).await;
        west.record(DecisionSource::Fallback).await;

        let seen_by_east = east.snapshot().await;
        assert!(seen_by_east.shared);
        assert_eq!(seen_by_east.total_requests, 3);
        assert_eq!(seen_by_east.fallback, 1);
        let seen_by_west = west.snapshot().await;
        assert_eq!(seen_by_west.total_requests, 3);
        assert_eq!(seen_by_west.advisory, 1);
        assert_eq!(east.local_snapshot().total_requests, 1);
    }
}
