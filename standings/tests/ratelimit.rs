//! Behavior of the per-caller window rate limiter.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{DownStore, EventCapture, MemStore};
use pretty_assertions::assert_eq;
use standings::config::RateLimitConfig;
use standings::{RateDecision, WindowRateLimiter};
use standings_core::ManualClock;

const WINDOW_START: i64 = 1_699_999_980;

fn config(limit: u32) -> RateLimitConfig {
    RateLimitConfig::builder().limit(limit).build().unwrap()
}

fn memory_limiter(limit: u32) -> (WindowRateLimiter, ManualClock) {
    let clock = ManualClock::at_timestamp(WINDOW_START);
    let limiter = WindowRateLimiter::builder()
        .config(config(limit))
        .clock(clock.clone())
        .build();
    (limiter, clock)
}

#[tokio::test]
async fn test_window_lifecycle() {
    let (limiter, clock) = memory_limiter(100);

    for expected_remaining in (0..100).rev() {
        let decision = limiter.check_and_increment("1.2.3.4").await;
        assert_eq!(
            decision,
            RateDecision {
                allowed: true,
                remaining: expected_remaining,
                reset_at: 1_700_000_040,
                retry_after: None,
            }
        );
    }

    clock.advance(Duration::from_secs(15));
    assert_eq!(
        limiter.check_and_increment("1.2.3.4").await,
        RateDecision {
            allowed: false,
            remaining: 0,
            reset_at: 1_700_000_040,
            retry_after: Some(45),
        }
    );

    clock.advance(Duration::from_secs(46));
    let next = limiter.check_and_increment("1.2.3.4").await;
    assert!(next.allowed);
    assert_eq!(next.remaining, 99);
    assert_eq!(next.reset_at, 1_700_000_100);
}

#[tokio::test]
async fn test_callers_are_counted_separately() {
    let (limiter, _clock) = memory_limiter(1);
    assert!(limiter.check_and_increment("a").await.allowed);
    assert!(!limiter.check_and_increment("a").await.allowed);
    assert!(limiter.check_and_increment("b").await.allowed);
}

#[tokio::test]
async fn test_counters_persist_to_durable_store() {
    let clock = ManualClock::at_timestamp(WINDOW_START + 5);
    let store = Arc::new(MemStore::default());
    let limiter = WindowRateLimiter::builder()
        .config(config(2))
        .clock(clock.clone())
        .shared_store(store.clone())
        .build();

    assert_eq!(limiter.check_and_increment("1.2.3.4").await.remaining, 1);
    common::settle().await;
    assert_eq!(limiter.check_and_increment("1.2.3.4").await.remaining, 0);
    common::settle().await;

    let key = "ratelimit:1.2.3.4:1699999980";
    assert_eq!(store.value(key).as_deref(), Some("2"));
    assert_eq!(store.ttl(key), Some(Duration::from_secs(55)));

    let denied = limiter.check_and_increment("1.2.3.4").await;
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Some(55));
    common::settle().await;
    assert_eq!(store.puts(), 2);
    assert_eq!(limiter.fallback_len(), 0);
}

#[tokio::test]
async fn test_back_to_back_durable_calls_respect_limit() {
    let clock = ManualClock::at_timestamp(WINDOW_START);
    let store = Arc::new(MemStore::default());
    let limiter = WindowRateLimiter::builder()
        .config(config(2))
        .clock(clock.clone())
        .shared_store(store.clone())
        .build();

    let mut allowed = 0;
    for _ in 0..10 {
        if limiter.check_and_increment("1.2.3.4").await.allowed {
            allowed += 1;
        }
    }
    assert_eq!(allowed, 2);
    assert_eq!(limiter.peek("1.2.3.4").await.remaining, 0);

    common::settle().await;
    assert_eq!(store.value("ratelimit:1.2.3.4:1699999980").as_deref(), Some("2"));
    assert_eq!(store.puts(), 2);
    assert_eq!(limiter.fallback_len(), 0);
}

#[tokio::test]
async fn test_concurrent_durable_calls_respect_limit() {
    let clock = ManualClock::at_timestamp(WINDOW_START);
    let limiter = WindowRateLimiter::builder()
        .config(config(3))
        .clock(clock.clone())
        .shared_store(Arc::new(MemStore::default()))
        .build();

    let limiter_ref = &limiter;
    let calls = (0..20).map(move |_| limiter_ref.check_and_increment("1.2.3.4"));
    let decisions = futures::future::join_all(calls).await;
    assert_eq!(decisions.iter().filter(|d| d.allowed).count(), 3);
}

#[tokio::test]
async fn test_unreachable_store_falls_back_to_memory() {
    let (capture, _guard) = EventCapture::install();
    let clock = ManualClock::at_timestamp(WINDOW_START);
    let store = Arc::new(DownStore::default());
    let limiter = WindowRateLimiter::builder()
        .config(config(2))
        .clock(clock.clone())
        .shared_store(store.clone())
        .build();

    assert!(limiter.check_and_increment("1.2.3.4").await.allowed);
    assert!(limiter.check_and_increment("1.2.3.4").await.allowed);
    let denied = limiter.check_and_increment("1.2.3.4").await;
    assert!(!denied.allowed);
    assert_eq!(denied.retry_after, Some(60));

    assert_eq!(store.calls(), 3);
    assert_eq!(limiter.fallback_len(), 1);
    let warnings = capture.warnings();
    assert_eq!(warnings.len(), 3);
    assert!(
        warnings
            .iter()
            .all(|message| message.contains("Durable rate store failed"))
    );
}

#[tokio::test]
async fn test_undecodable_counter_falls_back_to_memory() {
    let clock = ManualClock::at_timestamp(WINDOW_START);
    let store = Arc::new(MemStore::default());
    store.insert("ratelimit:1.2.3.4:1699999980", "not-a-number");
    let limiter = WindowRateLimiter::builder()
        .config(config(5))
        .clock(clock.clone())
        .shared_store(store.clone())
        .build();

    let decision = limiter.check_and_increment("1.2.3.4").await;
    assert!(decision.allowed);
    assert_eq!(decision.remaining, 4);
    assert_eq!(limiter.fallback_len(), 1);
    common::settle().await;
    assert_eq!(store.puts(), 0);
}

#[tokio::test]
async fn test_fallback_store_stays_bounded() {
    let clock = ManualClock::at_timestamp(WINDOW_START);
    let limiter = WindowRateLimiter::builder()
        .config(
            RateLimitConfig::builder()
                .limit(3)
                .fallback_capacity(16)
                .build()
                .unwrap(),
        )
        .clock(clock.clone())
        .shared_store(Arc::new(DownStore::default()))
        .build();

    for caller in 0..1000 {
        let ip = format!("10.0.{}.{}", caller / 256, caller % 256);
        let decision = limiter.check_and_increment(&ip).await;
        assert!(decision.allowed);
        assert!(limiter.fallback_len() <= 16);
    }
    assert_eq!(limiter.fallback_len(), 16);
}

#[tokio::test]
async fn test_peek_does_not_count() {
    let (limiter, _clock) = memory_limiter(3);
    assert_eq!(limiter.peek("a").await.remaining, 3);

    limiter.check_and_increment("a").await;
    for _ in 0..5 {
        let peeked = limiter.peek("a").await;
        assert!(peeked.allowed);
        assert_eq!(peeked.remaining, 2);
    }
    assert_eq!(limiter.check_and_increment("a").await.remaining, 1);
}

#[tokio::test]
async fn test_reset_forgets_current_window() {
    let clock = ManualClock::at_timestamp(WINDOW_START);
    let store = Arc::new(MemStore::default());
    let limiter = WindowRateLimiter::builder()
        .config(config(1))
        .clock(clock.clone())
        .shared_store(store.clone())
        .build();

    assert!(limiter.check_and_increment("a").await.allowed);
    common::settle().await;
    assert!(!limiter.check_and_increment("a").await.allowed);

    limiter.reset("a").await;
    assert_eq!(store.value("ratelimit:a:1699999980").as_deref(), Some("0"));
    assert!(limiter.check_and_increment("a").await.allowed);
}
