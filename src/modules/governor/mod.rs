//! Adaptive token-bucket rate governor.
//!
//! Each domain owns a capacity (tokens per second, also the bucket size)
//! under `rate_limiter:{domain}` and a bucket under
//! `rate_limiter:{domain}:bucket`. Response feedback moves the capacity
//! inside `[0.05 × base, 2 × base]`. All bucket arithmetic happens inside a
//! single store update, so concurrent callers share one consistent bucket.
//! Store failures grant the request.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use http::StatusCode;
use serde::{Deserialize, Serialize};

use crate::modules::store::{Mutation, StoreError, StrategyStore};

pub const DEFAULT_BASE_RATE: f64 = 5.0;

pub const RATE_TTL: Duration = Duration::from_secs(300);

pub const BUCKET_TTL: Duration = Duration::from_secs(60);

const MIN_RATE_FACTOR: f64 = 0.05;
const MAX_RATE_FACTOR: f64 = 2.0;

const SLOW_RESPONSE: Duration = Duration::from_secs(5);
const FAST_RESPONSE: Duration = Duration::from_millis(500);

pub fn rate_key(domain: &str) -> String {
    format!("rate_limiter:{domain}")
}

pub fn bucket_key(domain: &str) -> String {
    format!("rate_limiter:{domain}:bucket")
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct BucketState {
    tokens: f64,
    last_update: f64,
}

fn now_secs() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Capacity after one response, before clamping.
fn next_rate(current: f64, base: f64, latency: Duration, status: StatusCode) -> f64 {
    if status == StatusCode::TOO_MANY_REQUESTS {
        current * 0.5
    } else if latency > SLOW_RESPONSE {
        current * 0.8
    } else if latency < FAST_RESPONSE && status.is_success() {
        (current * 1.1).min(base * MAX_RATE_FACTOR)
    } else {
        current
    }
}

/// Per-domain adaptive limiter shared through the strategy store.
#[derive(Clone)]
pub struct RateGovernor {
    store: Arc<dyn StrategyStore>,
    base_rate: f64,
}

impl RateGovernor {
    pub fn new(store: Arc<dyn StrategyStore>) -> Self {
        Self {
            store,
            base_rate: DEFAULT_BASE_RATE,
        }
    }

    pub fn with_base_rate(mut self, base_rate: f64) -> Self {
        if base_rate.is_finite() && base_rate > 0.0 {
            self.base_rate = base_rate;
        }
        self
    }

    pub fn base_rate(&self) -> f64 {
        self.base_rate
    }

    fn clamp(&self, rate: f64) -> f64 {
        rate.clamp(self.base_rate * MIN_RATE_FACTOR, self.base_rate * MAX_RATE_FACTOR)
    }

    fn parse_rate(&self, raw: Option<&[u8]>) -> f64 {
        raw.and_then(|bytes| std::str::from_utf8(bytes).ok())
            .and_then(|text| text.trim().parse::<f64>().ok())
            .filter(|rate| rate.is_finite() && *rate > 0.0)
            .map(|rate| self.clamp(rate))
            .unwrap_or(self.base_rate)
    }

    /// Current capacity for the domain (base rate when unknown).
    pub async fn capacity(&self, domain: &str) -> f64 {
        match self.store.get(&rate_key(domain)).await {
            Ok(raw) => self.parse_rate(raw.as_deref()),
            Err(err) => {
                log::warn!("rate governor could not read capacity for {domain}: {err}");
                self.base_rate
            }
        }
    }

    /// Try to take `tokens` from the domain bucket without waiting.
    pub async fn acquire(&self, domain: &str, tokens: f64) -> bool {
        let capacity = self.capacity(domain).await;
        match self.take(domain, tokens, capacity).await {
            Ok(granted) => {
                if !granted {
                    log::debug!("rate limit reached for {domain}");
                }
                granted
            }
            Err(err) => {
                log::warn!("rate governor failing open for {domain}: {err}");
                true
            }
        }
    }

    async fn take(&self, domain: &str, tokens: f64, capacity: f64) -> Result<bool, StoreError> {
        let mutation = self
            .store
            .update(
                &bucket_key(domain),
                BUCKET_TTL,
                Box::new(move |current| {
                    let now = now_secs();
                    let state = current
                        .and_then(|raw| serde_json::from_slice::<BucketState>(raw).ok())
                        .unwrap_or(BucketState {
                            tokens: capacity,
                            last_update: now,
                        });

                    let elapsed = (now - state.last_update).max(0.0);
                    let available = (state.tokens + elapsed * capacity).min(capacity);
                    if available < tokens {
                        return Mutation::keep(false);
                    }

                    let next = BucketState {
                        tokens: available - tokens,
                        last_update: now,
                    };
                    match serde_json::to_vec(&next) {
                        Ok(encoded) => Mutation::write(encoded, true),
                        Err(_) => Mutation::keep(true),
                    }
                }),
            )
            .await?;
        Ok(mutation.accepted)
    }

    /// Feed one response back into the domain's capacity.
    ///
    /// Returns the capacity now in effect.
    pub async fn adjust(&self, domain: &str, latency: Duration, status: StatusCode) -> f64 {
        let base = self.base_rate;
        let min = base * MIN_RATE_FACTOR;
        let max = base * MAX_RATE_FACTOR;
        let fallback = self.clamp(next_rate(base, base, latency, status));

        let result = self
            .store
            .update(
                &rate_key(domain),
                RATE_TTL,
                Box::new(move |current| {
                    let previous = current
                        .and_then(|bytes| std::str::from_utf8(bytes).ok())
                        .and_then(|text| text.trim().parse::<f64>().ok())
                        .filter(|rate| rate.is_finite() && *rate > 0.0)
                        .unwrap_or(base);
                    let next = next_rate(previous, base, latency, status).clamp(min, max);
                    Mutation::write(next.to_string().into_bytes(), true)
                }),
            )
            .await;

        match result {
            Ok(mutation) => {
                let rate = self.parse_rate(mutation.value.as_deref());
                if status == StatusCode::TOO_MANY_REQUESTS {
                    log::warn!("rate for {domain} reduced to {rate:.2} req/s after 429");
                } else if latency > SLOW_RESPONSE {
                    log::info!("rate for {domain} reduced to {rate:.2} req/s after slow response");
                } else {
                    log::debug!("rate for {domain} now {rate:.2} req/s");
                }
                rate
            }
            Err(err) => {
                log::warn!("rate governor could not persist capacity for {domain}: {err}");
                fallback
            }
        }
    }

    /// Poll the bucket until `tokens` are granted or `max_wait` elapses.
    pub async fn wait_for_token(&self, domain: &str, tokens: f64, max_wait: Duration) -> bool {
        let started = Instant::now();
        loop {
            if self.acquire(domain, tokens).await {
                return true;
            }

            let remaining = max_wait.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                log::warn!("timed out after {max_wait:?} waiting for a {domain} token");
                return false;
            }

            let capacity = self.capacity(domain).await;
            let pause = Duration::from_secs_f64((tokens / capacity).max(0.001)).min(remaining);
            tokio::time::sleep(pause).await;
        }
    }

    /// Drop learned capacity and bucket state for the domain.
    pub async fn reset(&self, domain: &str) -> Result<(), StoreError> {
        self.store.delete(&rate_key(domain)).await?;
        self.store.delete(&bucket_key(domain)).await?;
        log::info!("rate for {domain} reset to base {:.2} req/s", self.base_rate);
        Ok(())
    }
}

impl std::fmt::Debug for RateGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateGovernor")
            .field("store", &self.store.name())
            .field("base_rate", &self.base_rate)
            .finish()
    }
}
