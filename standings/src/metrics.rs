//! Metrics declaration and initialization.

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
lazy_static! {
    // Cache status metrics

    /// Track number of reads served from cache while fresh.
    pub static ref CACHE_HIT_COUNTER: &'static str = {
        metrics::describe_counter!(
            "standings_cache_hit_total",
            "Total number of fresh cache hits."
        );
        "standings_cache_hit_total"
    };
    /// Track number of reads that found nothing usable.
    pub static ref CACHE_MISS_COUNTER: &'static str = {
        metrics::describe_counter!(
            "standings_cache_miss_total",
            "Total number of cache misses."
        );
        "standings_cache_miss_total"
    };
    /// Track number of reads served stale.
    pub static ref CACHE_STALE_COUNTER: &'static str = {
        metrics::describe_counter!(
            "standings_cache_stale_total",
            "Total number of stale cache hits."
        );
        "standings_cache_stale_total"
    };
    /// Track number of entries removed to make room.
    pub static ref CACHE_EVICTIONS: &'static str = {
        metrics::describe_counter!(
            "standings_cache_evictions_total",
            "Total number of entries evicted at capacity."
        );
        "standings_cache_evictions_total"
    };
    /// Track number of expired entries removed by sweeps.
    pub static ref CACHE_SWEPT: &'static str = {
        metrics::describe_counter!(
            "standings_cache_swept_total",
            "Total number of expired entries removed by periodic sweeps."
        );
        "standings_cache_swept_total"
    };

    // Upstream fetch metrics

    /// Track number of upstream fetches started.
    pub static ref FETCHES_STARTED: &'static str = {
        metrics::describe_counter!(
            "standings_fetches_started_total",
            "Total number of upstream fetches started."
        );
        "standings_fetches_started_total"
    };
    /// Track number of callers that joined an in-flight fetch.
    pub static ref FETCHES_DEDUPLICATED: &'static str = {
        metrics::describe_counter!(
            "standings_fetches_deduplicated_total",
            "Total number of callers that joined an in-flight fetch."
        );
        "standings_fetches_deduplicated_total"
    };
    /// Track number of failed upstream fetches.
    pub static ref FETCHES_FAILED: &'static str = {
        metrics::describe_counter!(
            "standings_fetches_failed_total",
            "Total number of failed upstream fetches."
        );
        "standings_fetches_failed_total"
    };

    // Rate limiter metrics

    /// Track rate limit decisions.
    pub static ref RATE_LIMIT_DECISIONS: &'static str = {
        metrics::describe_counter!(
            "standings_rate_limit_decisions_total",
            "Total number of rate limit decisions by outcome."
        );
        "standings_rate_limit_decisions_total"
    };
    /// Track number of decisions taken by the in-memory fallback.
    pub static ref RATE_LIMIT_FALLBACKS: &'static str = {
        metrics::describe_counter!(
            "standings_rate_limit_fallback_total",
            "Total number of decisions taken by the in-memory fallback store."
        );
        "standings_rate_limit_fallback_total"
    };
    /// Resident keys in the in-memory fallback store.
    pub static ref RATE_LIMIT_FALLBACK_KEYS: &'static str = {
        metrics::describe_gauge!(
            "standings_rate_limit_fallback_keys",
            "Number of counters resident in the in-memory fallback store."
        );
        "standings_rate_limit_fallback_keys"
    };
}
