//! Cross-cutting services module
//!
//! Shared storage, caching, quota, rate governing, statistics and events used
//! by the decision tiers.

pub mod cache;
pub mod events;
pub mod governor;
pub mod metrics;
pub mod quota;
pub mod store;

// Re-export commonly used types
pub use cache::{DecisionError, StrategyCache};
pub use events::{
    AdvisoryFailedEvent, AdvisorySkippedEvent, CacheHitEvent, CascadeEvent, DecidedEvent,
    EventDispatcher, EventHandler, LoggingHandler, RetryEvent, StoreDegradedEvent,
};
pub use governor::RateGovernor;
pub use metrics::{CascadeStatistics, Counter, UsageStatistics};
pub use quota::{QuotaReservation, QuotaTracker};
pub use store::{MemoryStore, Mutation, RedbStore, StoreError, StrategyStore, UpdateFn};
