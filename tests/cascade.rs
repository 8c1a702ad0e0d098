mod support;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scrape_router_rs::modules::cache::cache_key;
use scrape_router_rs::modules::quota::{QUOTA_TTL, key_for};
use scrape_router_rs::{
    AdvisoryConfig, DecisionSource, MemoryStore, Method, RedbStore, RetryPolicy, RouterError,
    RouterSettings, StrategyRouter, StrategyRouterBuilder, StrategyStore,
};
use support::{Behaviour, FixedModel, RecordingHandler, ScriptedProvider, UnavailableStore, page_with_scripts};

fn quiet_builder() -> StrategyRouterBuilder {
    StrategyRouter::builder().disable_event_logging()
}

fn fast_advisory() -> AdvisoryConfig {
    AdvisoryConfig {
        attempt_timeout: Duration::from_millis(50),
        retry: RetryPolicy {
            base_delay: Duration::from_millis(5),
            ..RetryPolicy::default()
        },
        ..AdvisoryConfig::default()
    }
}

#[tokio::test]
async fn allow_listed_domain_is_served_by_rules_then_cache() {
    let model = FixedModel::new(Method::Stealth, 0.99);
    let router = quiet_builder().with_model(model.clone()).build().unwrap();

    let first = router.resolve("https://en.wikipedia.org/wiki/Rust", None).await.unwrap();
    assert_eq!(first.served_by, DecisionSource::Rule);
    assert_eq!(first.decision.method(), Method::Http);
    assert_eq!(first.decision.confidence(), 0.90);
    assert_eq!(model.calls(), 0);

    let second = router
        .resolve("https://en.wikipedia.org/wiki/Ownership", None)
        .await
        .unwrap();
    assert_eq!(second.served_by, DecisionSource::Cache);
    assert_eq!(second.decision, first.decision);
    assert_eq!(
        serde_json::to_vec(&second.decision).unwrap(),
        serde_json::to_vec(&first.decision).unwrap()
    );

    let stats = router.get_statistics().await;
    assert_eq!(stats.total_requests, 2);
    assert_eq!(stats.cached, 1);
    assert_eq!(stats.rule_based, 1);
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn script_heavy_page_is_rendered() {
    let router = quiet_builder().build().unwrap();
    let html = page_with_scripts(15);
    let decision = router
        .predict_method("https://app.example.com/dashboard", Some(&html))
        .await
        .unwrap();
    assert_eq!(decision.method(), Method::Rendered);
    assert_eq!(decision.confidence(), 0.80);
    assert_eq!(decision.source(), DecisionSource::Rule);
    assert_eq!(decision.bypass_strategies(), ["enable_javascript"]);
}

#[tokio::test]
async fn confident_classifier_is_final() {
    let provider = ScriptedProvider::answering(Method::Proxied, 0.9);
    let model = FixedModel::new(Method::Stealth, 0.93);
    let router = quiet_builder()
        .with_model(model.clone())
        .with_advisory_provider(provider.clone())
        .build()
        .unwrap();

    let html = "<html><body>cf-ray: 7a1b <script></script></body></html>";
    let decision = router
        .predict_method("https://shop.example.com/", Some(html))
        .await
        .unwrap();
    assert_eq!(decision.source(), DecisionSource::Classifier);
    assert_eq!(decision.method(), Method::Stealth);
    assert_eq!(decision.detected_protections(), ["cloudflare"]);
    assert_eq!(
        decision.bypass_strategies(),
        ["stealth_mode", "rotate_user_agent", "residential_proxy"]
    );
    assert_eq!(model.calls(), 1);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn quota_pressure_skips_advisory() {
    let store = Arc::new(MemoryStore::new());
    store
        .set(&key_for(Utc::now().date_naive()), b"1215", QUOTA_TTL)
        .await
        .unwrap();

    let provider = ScriptedProvider::answering(Method::Stealth, 0.95);
    let handler = Arc::new(RecordingHandler::default());
    let router = quiet_builder()
        .with_store(store)
        .with_model(FixedModel::new(Method::Http, 0.55))
        .with_advisory_provider(provider.clone())
        .with_event_handler(handler.clone())
        .build()
        .unwrap();

    let decision = router.predict_method("https://unknown.example.net/", None).await.unwrap();
    assert_eq!(decision.source(), DecisionSource::Classifier);
    assert_eq!(decision.method(), Method::Http);
    assert_eq!(provider.calls(), 0);
    assert_eq!(router.quota().usage().await.unwrap(), 1215);

    let stats = router.get_statistics().await;
    assert_eq!(stats.advisory_skipped, 1);
    assert_eq!(stats.advisory, 0);
    assert_eq!(handler.count("advisory_skipped"), 1);
}

#[tokio::test]
async fn advisory_timeout_falls_back_to_classifier() {
    let provider = ScriptedProvider::new(Behaviour::Hang(Duration::from_millis(500)));
    let handler = Arc::new(RecordingHandler::default());
    let router = quiet_builder()
        .with_model(FixedModel::new(Method::Rendered, 0.6))
        .with_advisory_provider(provider.clone())
        .with_advisory_config(fast_advisory())
        .with_event_handler(handler.clone())
        .build()
        .unwrap();

    let decision = router.predict_method("https://slow.example.org/", None).await.unwrap();
    assert_eq!(decision.source(), DecisionSource::Classifier);
    assert_eq!(decision.method(), Method::Rendered);
    assert_eq!(decision.confidence(), 0.6);

    // Timeouts are retried once.
    assert_eq!(provider.calls(), 2);
    assert_eq!(handler.count("retry"), 1);
    assert_eq!(handler.count("advisory_failed"), 1);
    assert_eq!(router.get_statistics().await.advisory_failed, 1);
    assert_eq!(router.quota().usage().await.unwrap(), 0);
}

#[tokio::test]
async fn non_retryable_status_is_not_retried() {
    let provider = ScriptedProvider::new(Behaviour::Fail(403));
    let router = quiet_builder()
        .with_model(FixedModel::new(Method::Http, 0.4))
        .with_advisory_provider(provider.clone())
        .with_advisory_config(fast_advisory())
        .build()
        .unwrap();

    let decision = router.predict_method("https://denied.example.org/", None).await.unwrap();
    assert_eq!(decision.source(), DecisionSource::Classifier);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn uncertain_classifier_escalates_to_advisory() {
    let provider = ScriptedProvider::answering(Method::Stealth, 0.88);
    let router = quiet_builder()
        .with_model(FixedModel::new(Method::Http, 0.70))
        .with_advisory_provider(provider.clone())
        .build()
        .unwrap();

    // Mid-sized page: no rule fires.
    let html = format!("{}{}", page_with_scripts(5), "é".repeat(1500));
    let first = router
        .resolve("https://hard.example.com/item/1", Some(&html))
        .await
        .unwrap();
    assert_eq!(first.served_by, DecisionSource::Advisory);
    assert_eq!(first.decision.method(), Method::Stealth);
    assert_eq!(first.decision.bypass_strategies(), ["stealth_mode"]);
    assert_eq!(router.quota().usage().await.unwrap(), 1);

    let sent = provider.requests.lock().unwrap()[0].clone();
    assert_eq!(sent.url, "https://hard.example.com/item/1");
    assert_eq!(sent.excerpt.as_deref().map(|e| e.chars().count()), Some(1000));

    let second = router
        .resolve("https://hard.example.com/item/2", None)
        .await
        .unwrap();
    assert_eq!(second.served_by, DecisionSource::Cache);
    assert_eq!(second.decision.source(), DecisionSource::Advisory);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn every_request_has_exactly_one_source() {
    let router = quiet_builder()
        .with_model(FixedModel::new(Method::Stealth, 0.5))
        .build()
        .unwrap();

    let quiet = page_with_scripts(1);
    let heavy = page_with_scripts(12);
    let protected = "<div class=\"h-captcha\"></div>";
    let requests: Vec<(&str, Option<&str>)> = vec![
        ("https://github.com/rust-lang/rust", None),
        ("https://github.com/tokio-rs/tokio", None),
        ("https://blog.example.com/", Some(quiet.as_str())),
        ("https://spa.example.com/", Some(heavy.as_str())),
        ("https://guarded.example.com/", Some(protected)),
        ("https://guarded.example.com/again", Some(protected)),
        ("https://plain.example.com/", None),
    ];
    for (url, html) in &requests {
        router.predict_method(url, *html).await.unwrap();
    }

    let stats = router.get_statistics().await;
    assert_eq!(stats.total_requests, requests.len() as u64);
    assert_eq!(
        stats.cached + stats.rule_based + stats.classifier + stats.advisory + stats.fallback,
        stats.total_requests
    );
    assert_eq!(stats.cached, 2);
    assert_eq!(stats.rule_based, 3);
    assert_eq!(stats.classifier, 2);
    assert_eq!(stats.fallback, 0);
    assert_eq!(stats.calls_saved, 7);
    assert_eq!(stats.reduction_factor, 7.0);
}

#[tokio::test]
async fn quota_never_exceeds_ceiling_under_concurrency() {
    let store = Arc::new(MemoryStore::new());
    let mut settings = RouterSettings::default();
    settings.advisory.daily_limit = 4;
    settings.advisory.soft_ratio = 1.0;
    settings.governor.base_rate = 100.0;

    // Every call suspends, so all requests reach the quota gate together.
    let provider = ScriptedProvider::answering_after(Duration::from_millis(20), Method::Stealth, 0.9);
    let router = Arc::new(
        quiet_builder()
            .with_settings(settings)
            .with_store(store)
            .with_model(FixedModel::new(Method::Http, 0.3))
            .with_advisory_provider(provider.clone())
            .build()
            .unwrap(),
    );

    let mut handles = Vec::new();
    for i in 0..24 {
        let router = router.clone();
        handles.push(tokio::spawn(async move {
            router
                .predict_method(&format!("https://site{i}.example.com/"), None)
                .await
                .unwrap()
        }));
    }
    let mut advised = 0;
    for handle in handles {
        if handle.await.unwrap().source() == DecisionSource::Advisory {
            advised += 1;
        }
    }

    assert!(provider.calls() <= 4, "provider called {} times", provider.calls());
    assert_eq!(advised, 4);
    assert_eq!(router.quota().usage().await.unwrap(), 4);

    let stats = router.get_statistics().await;
    assert_eq!(stats.total_requests, 24);
    assert_eq!(stats.advisory, 4);
    assert_eq!(stats.advisory_skipped, 20);
}

#[tokio::test]
async fn cancellation_aborts_in_flight_advisory_call() {
    let store = Arc::new(MemoryStore::new());
    let provider = ScriptedProvider::new(Behaviour::Hang(Duration::from_secs(10)));
    let router = quiet_builder()
        .with_store(store.clone())
        .with_model(FixedModel::new(Method::Http, 0.4))
        .with_advisory_provider(provider.clone())
        .build()
        .unwrap();

    let result = router
        .predict_method_until(
            "https://abandoned.example.com/",
            None,
            tokio::time::sleep(Duration::from_millis(50)),
        )
        .await;
    assert!(matches!(result, Err(RouterError::Cancelled)));
    assert_eq!(provider.calls(), 1);
    assert_eq!(provider.in_flight(), 0);

    // The dropped quota slot is released on the runtime.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(router.quota().usage().await.unwrap(), 0);
    assert_eq!(store.get(&cache_key("abandoned.example.com")).await.unwrap(), None);
    assert_eq!(router.get_statistics().await.total_requests, 0);
}

#[tokio::test]
async fn unavailable_store_degrades_without_failing() {
    let handler = Arc::new(RecordingHandler::default());
    let provider = ScriptedProvider::answering(Method::Stealth, 0.9);
    let router = quiet_builder()
        .with_store(Arc::new(UnavailableStore))
        .with_model(FixedModel::new(Method::Http, 0.2))
        .with_advisory_provider(provider.clone())
        .with_event_handler(handler.clone())
        .build()
        .unwrap();

    let ruled = router.predict_method("https://archive.org/details/x", None).await.unwrap();
    assert_eq!(ruled.source(), DecisionSource::Rule);

    // Quota and governor fail open, so the advisory call still happens.
    let advised = router.predict_method("https://unknown.example.com/", None).await.unwrap();
    assert_eq!(advised.source(), DecisionSource::Advisory);
    assert_eq!(provider.calls(), 1);

    assert!(handler.count("store_degraded") >= 4);
    assert!(router.invalidate("https://archive.org/").await.is_err());
}

#[tokio::test]
async fn invalidate_forces_re_evaluation() {
    let router = quiet_builder().build().unwrap();
    router.predict_method("https://stackoverflow.com/q/1", None).await.unwrap();
    assert!(router.invalidate("https://stackoverflow.com/").await.unwrap());

    let again = router.resolve("https://stackoverflow.com/q/2", None).await.unwrap();
    assert_eq!(again.served_by, DecisionSource::Rule);
}

#[tokio::test]
async fn disabled_tiers_are_bypassed() {
    let provider = ScriptedProvider::answering(Method::Proxied, 0.9);
    let router = quiet_builder()
        .disable_rules()
        .disable_cache()
        .with_model(FixedModel::new(Method::Stealth, 0.95))
        .with_advisory_provider(provider.clone())
        .build()
        .unwrap();

    let first = router.resolve("https://github.com/", None).await.unwrap();
    assert_eq!(first.served_by, DecisionSource::Classifier);
    let second = router.resolve("https://github.com/", None).await.unwrap();
    assert_eq!(second.served_by, DecisionSource::Classifier);
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn redb_store_shares_decisions_between_routers() {
    let store: Arc<dyn StrategyStore> = Arc::new(RedbStore::in_memory().unwrap());
    let writer = quiet_builder().with_store(store.clone()).build().unwrap();
    let reader = quiet_builder().with_store(store).build().unwrap();

    let written = writer.predict_method("https://docs.github.com/en", None).await.unwrap();
    let read = reader.resolve("https://docs.github.com/en/rest", None).await.unwrap();
    assert_eq!(read.served_by, DecisionSource::Cache);
    assert_eq!(read.decision, written);
}

#[tokio::test]
async fn oversized_html_is_truncated_not_rejected() {
    let mut settings = RouterSettings::default();
    settings.max_html_bytes = 64;
    let router = quiet_builder().with_settings(settings).build().unwrap();

    // Scripts beyond the byte limit are never seen.
    let html = format!("<html><body><p>{}</p>{}</body></html>", "x".repeat(40), page_with_scripts(20));
    let decision = router
        .predict_method("https://long.example.com/", Some(&html))
        .await
        .unwrap();
    assert_eq!(decision.method(), Method::Http);
    assert_eq!(decision.confidence(), 0.85);
}
