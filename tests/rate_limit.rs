//! Rate limiter integration tests.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::test_helpers::{engine_with, ClockDrivenSleeper, EventLog};
use refetch::clock::ManualClock;
use refetch::events::FetchEvent;
use refetch::key::KeySerializer;
use refetch::transport::ScriptedResponse;
use refetch::{FetchOptions, Method, RateLimitConfig, RequestOptions};
use serde_json::json;

fn limited_options(config: RateLimitConfig, clock: &ManualClock) -> FetchOptions {
    FetchOptions::new("https://api.test")
        .retry(false)
        .dedupe_policy(false)
        .cache_policy(false)
        .rate_limit_policy(config)
        .clock(Arc::new(clock.clone()))
}

#[tokio::test]
async fn shared_key_bucket_rejects_the_overflow_request() {
    let clock = ManualClock::new();
    let (engine, transport) = engine_with(limited_options(
        RateLimitConfig {
            max_calls: 2,
            window: Duration::from_millis(60_000),
            wait_for_token: false,
            serializer: KeySerializer::custom(|_ctx: &refetch::KeyContext| Ok("g".to_string())),
            ..RateLimitConfig::default()
        },
        &clock,
    ));
    let log = EventLog::attach(&engine);
    transport.respond_with(Method::Get, "/a", ScriptedResponse::json(200, json!(1)));
    transport.respond_with(Method::Get, "/b", ScriptedResponse::json(200, json!(2)));
    transport.respond_with(Method::Get, "/c", ScriptedResponse::json(200, json!(3)));

    let tokens_seen = Arc::new(Mutex::new(Vec::new()));
    let sink = tokens_seen.clone();
    let _sub = engine.on("fetch-ratelimit-acquire", move |event| {
        if let FetchEvent::RateLimitAcquire(e) = event {
            sink.lock().unwrap().push((e.key.clone(), e.current_tokens, e.capacity));
        }
    });

    assert!(engine.get("/a", RequestOptions::new()).await.is_ok());
    assert!(engine.get("/b", RequestOptions::new()).await.is_ok());

    let error = engine.get("/c", RequestOptions::new()).await.unwrap_err();
    assert_eq!(error.status, 429);
    assert!(error.message().contains("rate limit"));

    assert_eq!(
        *tokens_seen.lock().unwrap(),
        vec![("g".to_string(), 1.0, 2.0), ("g".to_string(), 0.0, 2.0)]
    );
    assert_eq!(log.count_of("fetch-ratelimit-reject"), 1);
    assert_eq!(transport.call_count(), 2);
}

#[tokio::test]
async fn reject_happens_before_the_transport() {
    let clock = ManualClock::new();
    let (engine, transport) = engine_with(limited_options(
        RateLimitConfig {
            max_calls: 1,
            window: Duration::from_millis(60_000),
            wait_for_token: false,
            ..RateLimitConfig::default()
        },
        &clock,
    ));
    transport.respond_with(Method::Get, "/x", ScriptedResponse::json(200, json!(1)));

    engine.get("/x", RequestOptions::new()).await.unwrap();
    engine.get("/x", RequestOptions::new()).await.unwrap_err();
    assert_eq!(transport.calls_for(Method::Get, "/x"), 1);
}

#[tokio::test]
async fn wait_mode_waits_out_the_refill_then_proceeds() {
    let clock = ManualClock::new();
    let sleeper = ClockDrivenSleeper::new(clock.clone());
    let (engine, transport) = engine_with(
        limited_options(
            RateLimitConfig {
                max_calls: 1,
                window: Duration::from_millis(200),
                wait_for_token: true,
                ..RateLimitConfig::default()
            },
            &clock,
        )
        .sleeper(Arc::new(sleeper.clone())),
    );
    let log = EventLog::attach(&engine);
    transport.respond_with(Method::Get, "/x", ScriptedResponse::json(200, json!(1)));

    engine.get("/x", RequestOptions::new()).await.unwrap();
    engine.get("/x", RequestOptions::new()).await.unwrap();

    assert_eq!(log.count_of("fetch-ratelimit-wait"), 1);
    assert_eq!(log.count_of("fetch-ratelimit-acquire"), 2);
    assert_eq!(sleeper.recorded(), vec![Duration::from_millis(200)]);
    assert_eq!(transport.calls_for(Method::Get, "/x"), 2);
}

#[tokio::test]
async fn buckets_are_keyed_by_endpoint_by_default() {
    let clock = ManualClock::new();
    let (engine, transport) = engine_with(limited_options(
        RateLimitConfig {
            max_calls: 1,
            window: Duration::from_millis(60_000),
            wait_for_token: false,
            ..RateLimitConfig::default()
        },
        &clock,
    ));
    transport.respond_with(Method::Get, "/a", ScriptedResponse::json(200, json!(1)));
    transport.respond_with(Method::Get, "/b", ScriptedResponse::json(200, json!(2)));

    // Distinct endpoints draw from distinct buckets.
    assert!(engine.get("/a", RequestOptions::new()).await.is_ok());
    assert!(engine.get("/b", RequestOptions::new()).await.is_ok());
    // Same endpoint again: bucket exhausted.
    assert!(engine.get("/a", RequestOptions::new()).await.is_err());
}

#[tokio::test]
async fn refill_restores_admission_over_time() {
    let clock = ManualClock::new();
    let (engine, transport) = engine_with(limited_options(
        RateLimitConfig {
            max_calls: 2,
            window: Duration::from_millis(1_000),
            wait_for_token: false,
            ..RateLimitConfig::default()
        },
        &clock,
    ));
    transport.respond_with(Method::Get, "/x", ScriptedResponse::json(200, json!(1)));

    assert!(engine.get("/x", RequestOptions::new()).await.is_ok());
    assert!(engine.get("/x", RequestOptions::new()).await.is_ok());
    assert!(engine.get("/x", RequestOptions::new()).await.is_err());

    clock.advance(500); // one token refilled (2 per second)
    assert!(engine.get("/x", RequestOptions::new()).await.is_ok());
    assert!(engine.get("/x", RequestOptions::new()).await.is_err());
}

#[tokio::test]
async fn rate_limit_rules_override_capacity_per_route() {
    let clock = ManualClock::new();
    let rule = refetch::PolicyRule::new(refetch::RuleMatch::starts_with("/bulk"))
        .overrides(refetch::RateLimitOverrides {
            max_calls: Some(1),
            window: None,
            wait_for_token: Some(false),
        });
    let (engine, transport) = engine_with(limited_options(
        RateLimitConfig {
            max_calls: 100,
            window: Duration::from_millis(60_000),
            wait_for_token: false,
            rules: vec![rule],
            ..RateLimitConfig::default()
        },
        &clock,
    ));
    transport.respond_with(Method::Get, "/bulk/export", ScriptedResponse::json(200, json!(1)));
    transport.respond_with(Method::Get, "/small", ScriptedResponse::json(200, json!(2)));

    assert!(engine.get("/bulk/export", RequestOptions::new()).await.is_ok());
    assert!(engine.get("/bulk/export", RequestOptions::new()).await.is_err());

    for _ in 0..5 {
        assert!(engine.get("/small", RequestOptions::new()).await.is_ok());
    }
}

#[tokio::test]
async fn on_rate_limit_callback_fires_before_the_wait() {
    let clock = ManualClock::new();
    let sleeper = ClockDrivenSleeper::new(clock.clone());
    let waits = Arc::new(Mutex::new(Vec::new()));
    let sink = waits.clone();
    let (engine, transport) = engine_with(
        limited_options(
            RateLimitConfig {
                max_calls: 1,
                window: Duration::from_millis(300),
                wait_for_token: true,
                on_rate_limit: Some(Arc::new(move |_ctx: &refetch::KeyContext, wait| {
                    sink.lock().unwrap().push(wait);
                })),
                ..RateLimitConfig::default()
            },
            &clock,
        )
        .sleeper(Arc::new(sleeper)),
    );
    transport.respond_with(Method::Get, "/x", ScriptedResponse::json(200, json!(1)));

    engine.get("/x", RequestOptions::new()).await.unwrap();
    engine.get("/x", RequestOptions::new()).await.unwrap();
    assert_eq!(*waits.lock().unwrap(), vec![Duration::from_millis(300)]);
}
