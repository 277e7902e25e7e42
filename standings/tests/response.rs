//! Behavior of the server-facing response cache.

mod common;

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use standings::config::{ResponseConfig, StalePolicy};
use standings::{CacheStats, ResponseCache};
use standings_core::ManualClock;
use tokio::sync::Semaphore;

const T0: i64 = 1_700_000_000;

fn cache_with(config: ResponseConfig) -> (ResponseCache<Value>, ManualClock) {
    let clock = ManualClock::at_timestamp(T0);
    (ResponseCache::with_clock(config, clock.clone()), clock)
}

fn small_cache(max_entries: usize) -> (ResponseCache<Value>, ManualClock) {
    cache_with(
        ResponseConfig::builder()
            .max_entries(max_entries)
            .build()
            .unwrap(),
    )
}

#[tokio::test]
async fn test_size_never_exceeds_max_entries() {
    let (cache, _clock) = small_cache(10);
    for i in 0..13 {
        cache.set(&format!("k{i}"), json!(i), None);
        assert!(cache.stats().size <= 10);
    }

    assert_eq!(
        cache.stats(),
        CacheStats {
            size: 10,
            max_entries: 10
        }
    );
    for i in 0..3 {
        assert!(cache.get(&format!("k{i}")).is_none(), "k{i} should be evicted");
    }
    for i in 3..13 {
        assert!(cache.get(&format!("k{i}")).is_some(), "k{i} should survive");
    }
}

#[tokio::test]
async fn test_reads_refresh_recency() {
    let (cache, _clock) = small_cache(3);
    cache.set("a", json!("a"), None);
    cache.set("b", json!("b"), None);
    cache.set("c", json!("c"), None);

    assert!(cache.get("a").is_some());
    cache.set("d", json!("d"), None);
    assert!(cache.get("b").is_none());

    cache.set("c", json!("c2"), None);
    cache.set("e", json!("e"), None);
    assert!(cache.get("a").is_none());
    assert_eq!(cache.get("c").map(|hit| hit.value), Some(json!("c2")));
    assert!(cache.get("d").is_some());
    assert!(cache.get("e").is_some());
}

#[tokio::test]
async fn test_stale_window_after_ttl() {
    let (cache, clock) = cache_with(
        ResponseConfig::builder()
            .stale_window(Duration::from_secs(30))
            .build()
            .unwrap(),
    );
    cache.set("k", json!({"rank": 1}), Some(Duration::from_secs(60)));

    clock.advance(Duration::from_secs(59));
    assert!(!cache.get("k").unwrap().is_stale);

    clock.advance(Duration::from_secs(2));
    let hit = cache.get("k").unwrap();
    assert!(hit.is_stale);
    assert_eq!(hit.value, json!({"rank": 1}));

    clock.advance(Duration::from_secs(30));
    assert!(cache.get("k").is_none());
    assert_eq!(cache.stats().size, 0);
}

#[tokio::test]
async fn test_delete_and_clear() {
    let (cache, _clock) = small_cache(8);
    cache.set("a", json!(1), None);
    cache.set("b", json!(2), None);

    assert!(cache.delete("a"));
    assert!(!cache.delete("a"));
    assert_eq!(cache.stats().size, 1);

    cache.clear();
    assert_eq!(cache.stats().size, 0);
    assert!(cache.get("b").is_none());
}

#[tokio::test]
async fn test_concurrent_misses_share_one_upstream_call() {
    let (cache, _clock) = small_cache(8);
    let calls = AtomicUsize::new(0);
    let gate = Arc::new(Semaphore::new(0));

    let (cache_ref, calls_ref, gate_ref) = (&cache, &calls, &gate);
    let callers = (0..10).map(move |_| {
        cache_ref.get_or_fetch("rounds:all", None, move || {
            calls_ref.fetch_add(1, Ordering::SeqCst);
            let gate = Arc::clone(gate_ref);
            async move {
                let _permit = gate.acquire().await;
                Ok::<_, io::Error>(json!(["r1", "r2"]))
            }
        })
    });
    let release = async {
        common::settle().await;
        gate.add_permits(1);
    };
    let (results, ()) = tokio::join!(join_all(callers), release);

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
        let hit = result.unwrap();
        assert_eq!(hit.value, json!(["r1", "r2"]));
        assert!(!hit.is_stale);
    }
    assert_eq!(cache.get("rounds:all").unwrap().value, json!(["r1", "r2"]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_producer_may_call_back_into_the_cache() {
    let (cache, _clock) = small_cache(8);
    let inside = cache.clone();

    let hit = cache
        .get_or_fetch("rounds:all", None, move || {
            assert!(!inside.is_fetching("rounds:all"));
            assert!(inside.get("rounds:all").is_none());
            async { Ok::<_, io::Error>(json!("r1")) }
        })
        .await
        .unwrap();
    assert_eq!(hit.value, json!("r1"));
}

#[tokio::test]
async fn test_failed_fetch_is_not_cached() {
    let (cache, _clock) = small_cache(8);
    let err = cache
        .get_or_fetch("k", None, || async {
            Err::<Value, _>(io::Error::other("bad gateway"))
        })
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "upstream fetch failed: bad gateway");
    assert!(cache.get("k").is_none());
    assert!(!cache.is_fetching("k"));
}

async fn stale_entry(policy: StalePolicy) -> (ResponseCache<Value>, ManualClock) {
    let (cache, clock) = cache_with(
        ResponseConfig::builder()
            .stale_policy(policy)
            .stale_window(Duration::from_secs(30))
            .build()
            .unwrap(),
    );
    cache.set("k", json!("old"), Some(Duration::from_secs(60)));
    clock.advance(Duration::from_secs(70));
    (cache, clock)
}

#[tokio::test]
async fn test_stale_policy_return_serves_stale() {
    let (cache, _clock) = stale_entry(StalePolicy::Return).await;
    let hit = cache
        .get_or_fetch("k", None, || -> std::future::Ready<Result<Value, io::Error>> {
            panic!("Return policy must not fetch")
        })
        .await
        .unwrap();
    assert!(hit.is_stale);
    assert_eq!(hit.value, json!("old"));
}

#[tokio::test]
async fn test_stale_policy_offload_refreshes_in_background() {
    let (cache, _clock) = stale_entry(StalePolicy::OffloadRevalidate).await;
    let hit = cache
        .get_or_fetch("k", None, || async { Ok::<_, io::Error>(json!("new")) })
        .await
        .unwrap();
    assert!(hit.is_stale);
    assert_eq!(hit.value, json!("old"));

    common::settle().await;
    let refreshed = cache.get("k").unwrap();
    assert!(!refreshed.is_stale);
    assert_eq!(refreshed.value, json!("new"));
}

#[tokio::test]
async fn test_stale_policy_revalidate_waits_and_keeps_stale_on_error() {
    let (cache, _clock) = stale_entry(StalePolicy::Revalidate).await;
    let result = cache
        .get_or_fetch("k", None, || async {
            Err::<Value, _>(io::Error::other("upstream down"))
        })
        .await;
    assert!(result.is_err());
    assert_eq!(cache.get("k").unwrap().value, json!("old"));
    assert_eq!(
        cache.last_error("k").map(|e| e.to_string()),
        Some("upstream down".to_owned())
    );

    let hit = cache
        .get_or_fetch("k", None, || async { Ok::<_, io::Error>(json!("new")) })
        .await
        .unwrap();
    assert!(!hit.is_stale);
    assert_eq!(hit.value, json!("new"));
    assert!(cache.last_error("k").is_none());
}

#[tokio::test]
async fn test_request_payloads_collide_and_use_category_ttl() {
    let (cache, clock) = small_cache(8);
    let compact = json!({
        "query": "query { v2Leaderboard { username rank } }",
        "variables": {"round": 3, "tournament": 8},
    });
    let pretty = json!({
        "variables": {"tournament": 8, "round": 3},
        "query": "query {\n  v2Leaderboard {\n    username\n    rank\n  }\n}",
    });

    let key = cache.key_for(&compact);
    assert_eq!(key, cache.key_for(&pretty));
    assert_eq!(key.category(), Some("leaderboard"));
    assert!(key.as_str().starts_with("leaderboard:"));
    assert_eq!(cache.ttl_for(&key), Duration::from_secs(5 * 60));

    let calls = AtomicUsize::new(0);
    for payload in [&compact, &pretty] {
        let hit = cache
            .get_or_fetch_request(payload, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, io::Error>(json!({"rows": 100})) }
            })
            .await
            .unwrap();
        assert_eq!(hit.value, json!({"rows": 100}));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.advance(Duration::from_secs(4 * 60));
    assert!(!cache.get(key.as_str()).unwrap().is_stale);
}

#[tokio::test]
async fn test_unrecognized_request_uses_default_ttl() {
    let (cache, clock) = small_cache(8);
    let payload = json!({"query": "{ somethingElse { id } }"});
    let key = cache.key_for(&payload);
    assert_eq!(key.category(), None);
    assert!(key.as_str().starts_with("default:"));

    cache
        .get_or_fetch_request(&payload, || async { Ok::<_, io::Error>(json!(1)) })
        .await
        .unwrap();
    clock.advance(Duration::from_secs(61));
    assert!(cache.get(key.as_str()).unwrap().is_stale);
}
