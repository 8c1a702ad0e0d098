//! Event system for the decision cascade.
//!
//! Hooks for logging and custom reactions around tier activity.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::decision::{DecisionSource, Method};

#[derive(Debug, Clone)]
pub struct CacheHitEvent {
    pub target_key: String,
    pub method: Method,
    pub timestamp: DateTime<Utc>,
}

/// Emitted once per request that was not served from cache.
#[derive(Debug, Clone)]
pub struct DecidedEvent {
    pub target_key: String,
    pub source: DecisionSource,
    pub method: Method,
    pub confidence: f64,
    pub elapsed: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AdvisorySkippedEvent {
    pub target_key: String,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AdvisoryFailedEvent {
    pub target_key: String,
    pub attempts: u32,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub target_key: String,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StoreDegradedEvent {
    pub operation: &'static str,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum CascadeEvent {
    CacheHit(CacheHitEvent),
    Decided(DecidedEvent),
    AdvisorySkipped(AdvisorySkippedEvent),
    AdvisoryFailed(AdvisoryFailedEvent),
    Retry(RetryEvent),
    StoreDegraded(StoreDegradedEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &CascadeEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default, Clone)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    pub fn dispatch(&self, event: CascadeEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &CascadeEvent) {
        match event {
            CascadeEvent::CacheHit(hit) => {
                log::debug!("cache hit {} -> {}", hit.target_key, hit.method);
            }
            CascadeEvent::Decided(decided) => {
                log::debug!(
                    "{} decided {} for {} ({:.2}) in {:.1}ms",
                    decided.source,
                    decided.method,
                    decided.target_key,
                    decided.confidence,
                    decided.elapsed.as_secs_f64() * 1000.0
                );
            }
            CascadeEvent::AdvisorySkipped(skipped) => {
                log::info!("advisory skipped for {}: {}", skipped.target_key, skipped.reason);
            }
            CascadeEvent::AdvisoryFailed(failed) => {
                log::warn!(
                    "advisory failed for {} after {} attempt(s): {}",
                    failed.target_key,
                    failed.attempts,
                    failed.error
                );
            }
            CascadeEvent::Retry(retry) => {
                log::info!(
                    "advisory retry {} attempt {} after {:.2}s ({})",
                    retry.target_key,
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
            CascadeEvent::StoreDegraded(degraded) => {
                log::warn!("store {} degraded: {}", degraded.operation, degraded.error);
            }
        }
    }
}
