#![allow(dead_code)]

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use scrape_router_rs::modules::store::UpdateFn;
use scrape_router_rs::{
    AdvisoryError, AdvisoryProvider, AdvisoryRequest, AdvisoryVerdict, CascadeEvent, EventHandler,
    FeatureVector, Method, Mutation, Prediction, StoreError, StrategyModel, StrategyStore,
    ValidationError,
};

/// Model that always answers the same way.
pub struct FixedModel {
    pub method: Method,
    pub confidence: f64,
    pub calls: AtomicU32,
}

impl FixedModel {
    pub fn new(method: Method, confidence: f64) -> Arc<Self> {
        Arc::new(Self {
            method,
            confidence,
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl StrategyModel for FixedModel {
    fn name(&self) -> &str {
        "fixed"
    }

    fn predict(&self, _features: &FeatureVector) -> Result<Prediction, ValidationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Prediction {
            method: self.method,
            confidence: self.confidence,
            probabilities: vec![(self.method, self.confidence)],
        })
    }
}

pub enum Behaviour {
    Answer(AdvisoryVerdict),
    AnswerAfter(Duration, AdvisoryVerdict),
    Hang(Duration),
    Fail(u16),
}

/// Scripted advisory provider.
pub struct ScriptedProvider {
    behaviour: Behaviour,
    pub calls: AtomicU32,
    pub in_flight: Arc<AtomicU32>,
    pub requests: Mutex<Vec<AdvisoryRequest>>,
}

/// Decrements the in-flight count when the provider future finishes or is dropped.
struct InFlight(Arc<AtomicU32>);

impl InFlight {
    fn enter(counter: &Arc<AtomicU32>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedProvider {
    pub fn new(behaviour: Behaviour) -> Arc<Self> {
        Arc::new(Self {
            behaviour,
            calls: AtomicU32::new(0),
            in_flight: Arc::new(AtomicU32::new(0)),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn answering(method: Method, confidence: f64) -> Arc<Self> {
        Self::new(Behaviour::Answer(verdict(method, confidence)))
    }

    /// Answers only after sleeping for `delay`.
    pub fn answering_after(delay: Duration, method: Method, confidence: f64) -> Arc<Self> {
        Self::new(Behaviour::AnswerAfter(delay, verdict(method, confidence)))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdvisoryProvider for ScriptedProvider {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn advise(&self, request: &AdvisoryRequest) -> Result<AdvisoryVerdict, AdvisoryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let _in_flight = InFlight::enter(&self.in_flight);
        self.requests.lock().unwrap().push(request.clone());
        match &self.behaviour {
            Behaviour::Answer(verdict) => Ok(verdict.clone()),
            Behaviour::AnswerAfter(delay, verdict) => {
                tokio::time::sleep(*delay).await;
                Ok(verdict.clone())
            }
            Behaviour::Hang(duration) => {
                tokio::time::sleep(*duration).await;
                Err(AdvisoryError::Transport("woke up too late".into()))
            }
            Behaviour::Fail(status) => Err(AdvisoryError::Status {
                status: *status,
                body: String::new(),
            }),
        }
    }
}

fn verdict(method: Method, confidence: f64) -> AdvisoryVerdict {
    AdvisoryVerdict {
        recommended_method: method,
        confidence,
        reasoning: "scripted".into(),
        anti_bot_detected: vec!["cloudflare".into()],
        bypass_strategies: vec!["stealth_mode".into()],
    }
}

/// Store whose every operation fails.
pub struct UnavailableStore;

#[async_trait]
impl StrategyStore for UnavailableStore {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn delete(&self, _key: &str) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn update(&self, _key: &str, _ttl: Duration, _apply: UpdateFn) -> Result<Mutation, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

/// Records the kind of every dispatched event.
#[derive(Default)]
pub struct RecordingHandler {
    pub kinds: Mutex<Vec<&'static str>>,
}

impl RecordingHandler {
    pub fn count(&self, kind: &str) -> usize {
        self.kinds.lock().unwrap().iter().filter(|k| **k == kind).count()
    }
}

impl EventHandler for RecordingHandler {
    fn handle(&self, event: &CascadeEvent) {
        let kind = match event {
            CascadeEvent::CacheHit(_) => "cache_hit",
            CascadeEvent::Decided(_) => "decided",
            CascadeEvent::AdvisorySkipped(_) => "advisory_skipped",
            CascadeEvent::AdvisoryFailed(_) => "advisory_failed",
            CascadeEvent::Retry(_) => "retry",
            CascadeEvent::StoreDegraded(_) => "store_degraded",
        };
        self.kinds.lock().unwrap().push(kind);
    }
}

pub fn page_with_scripts(count: usize) -> String {
    let mut html = String::from("<html><head><title>shop</title></head><body>");
    for i in 0..count {
        html.push_str(&format!("<script src=\"/static/bundle-{i}.js\"></script>"));
    }
    html.push_str("<p>catalog</p></body></html>");
    html
}
