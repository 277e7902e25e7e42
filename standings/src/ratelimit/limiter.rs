use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use standings_backend::{BackendError, BackendResult, DurableStore, Raw};
use standings_core::{Clock, SharedClock, system_clock};
use tracing::{Instrument, debug, info_span, warn};

use super::memory::{MemoryCounterStore, RateWindowCounter};
use super::{RateDecision, Window};
use crate::config::RateLimitConfig;

#[cfg(feature = "metrics")]
use crate::metrics::{RATE_LIMIT_DECISIONS, RATE_LIMIT_FALLBACK_KEYS, RATE_LIMIT_FALLBACKS};

type SharedStore = Arc<dyn DurableStore + Send + 'static>;

/// Per-caller fixed-window rate limiter.
///
/// Counters are read from and written to the durable store when one is
/// configured. A durable failure, or a stored value that does not decode,
/// sends that call to the in-memory fallback; the durable store is not
/// retried within the call. Durable writes happen in the background after
/// the decision is returned, so a lost write can only under-count.
///
/// Each durable decision is also counted locally and the higher of the
/// durable and local counts wins, so calls made before an earlier write has
/// landed are still held to the limit.
///
/// ```
/// use standings::{WindowRateLimiter, config::RateLimitConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let config = RateLimitConfig::builder().limit(2).build().unwrap();
/// let limiter = WindowRateLimiter::new(config);
///
/// assert!(limiter.check_and_increment("1.2.3.4").await.allowed);
/// assert!(limiter.check_and_increment("1.2.3.4").await.allowed);
/// let denied = limiter.check_and_increment("1.2.3.4").await;
/// assert!(!denied.allowed);
/// assert!(denied.retry_after.unwrap() >= 1);
/// # }
/// ```
pub struct WindowRateLimiter {
    config: RateLimitConfig,
    clock: SharedClock,
    durable: Option<SharedStore>,
    recent: MemoryCounterStore,
    fallback: MemoryCounterStore,
}

impl fmt::Debug for WindowRateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowRateLimiter")
            .field("config", &self.config)
            .field("durable", &self.durable.as_ref().map(|store| store.name()))
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl WindowRateLimiter {
    /// Creates a limiter that only counts in memory.
    pub fn new(config: RateLimitConfig) -> Self {
        Self::builder().config(config).build()
    }

    /// Creates a builder with default configuration.
    pub fn builder() -> WindowRateLimiterBuilder {
        WindowRateLimiterBuilder::default()
    }

    /// The active configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Counts one operation by `caller` and decides whether it may proceed.
    ///
    /// Never fails: durable store errors are logged and absorbed.
    pub async fn check_and_increment(&self, caller: &str) -> RateDecision {
        let now = self.clock.now();
        let window = Window::containing(now, self.config.window_secs());

        if let Some(store) = &self.durable {
            match self.check_durable(store, caller, &window, now).await {
                Ok(decision) => {
                    record(&decision, "durable");
                    return decision;
                }
                Err(error) => {
                    warn!(
                        store = store.name(),
                        caller,
                        %error,
                        "Durable rate store failed, counting in memory"
                    );
                }
            }
        }

        let decision = self
            .fallback
            .check_and_increment(caller, &window, self.config.limit, now);
        record(&decision, "memory");
        #[cfg(feature = "metrics")]
        {
            metrics::counter!(*RATE_LIMIT_FALLBACKS).increment(1);
            metrics::gauge!(*RATE_LIMIT_FALLBACK_KEYS).set(self.fallback.len() as f64);
        }
        decision
    }

    async fn check_durable(
        &self,
        store: &SharedStore,
        caller: &str,
        window: &Window,
        now: DateTime<Utc>,
    ) -> BackendResult<RateDecision> {
        let key = self.counter_key(caller, window);
        let stored = match store.get(&key).await? {
            Some(raw) => decode_count(&key, &raw)?,
            None => 0,
        };

        let (decision, next) = self
            .recent
            .count(caller, window, self.config.limit, stored, now);
        if !decision.allowed {
            return Ok(decision);
        }

        let ttl = Duration::from_secs(window.seconds_left(now));
        let store = Arc::clone(store);
        let span = info_span!("rate_counter_write", key = %key, count = next);
        tokio::spawn(
            async move {
                if let Err(error) = store.put(&key, encode_count(next), ttl).await {
                    warn!(%error, "Failed to persist rate counter");
                }
            }
            .instrument(span),
        );

        Ok(decision)
    }

    /// Reports the current standing of `caller` without counting anything.
    pub async fn peek(&self, caller: &str) -> RateDecision {
        let now = self.clock.now();
        let window = Window::containing(now, self.config.window_secs());

        let durable = match &self.durable {
            Some(store) => {
                let key = self.counter_key(caller, &window);
                match store.get(&key).await {
                    Ok(raw) => raw.map(|raw| decode_count(&key, &raw)).transpose().ok(),
                    Err(error) => {
                        debug!(%error, "Durable rate store failed on peek");
                        None
                    }
                }
            }
            None => None,
        };
        let count = match durable {
            Some(stored) => {
                let recent = self.recent.peek(caller, &window).map_or(0, |c| c.count);
                stored.unwrap_or(0).max(recent)
            }
            None => self
                .fallback
                .peek(caller, &window)
                .map_or(0, |counter: RateWindowCounter| counter.count),
        };

        if count >= self.config.limit {
            window.deny(now)
        } else {
            window.allow(self.config.limit, count)
        }
    }

    /// Forgets the current window's count for `caller`.
    ///
    /// The durable counter, if any, is overwritten with zero.
    pub async fn reset(&self, caller: &str) {
        let now = self.clock.now();
        let window = Window::containing(now, self.config.window_secs());
        self.fallback.reset(caller, &window);
        self.recent.reset(caller, &window);

        if let Some(store) = &self.durable {
            let key = self.counter_key(caller, &window);
            let ttl = Duration::from_secs(window.seconds_left(now));
            if let Err(error) = store.put(&key, encode_count(0), ttl).await {
                warn!(store = store.name(), %error, "Failed to reset rate counter");
            }
        }
    }

    /// Number of counters resident in the in-memory fallback.
    pub fn fallback_len(&self) -> usize {
        self.fallback.len()
    }

    fn counter_key(&self, caller: &str, window: &Window) -> String {
        format!("{}:{}:{}", self.config.key_prefix, caller, window.start)
    }
}

fn encode_count(count: u32) -> Raw {
    Bytes::from(count.to_string())
}

fn decode_count(key: &str, raw: &Raw) -> BackendResult<u32> {
    std::str::from_utf8(raw)
        .ok()
        .and_then(|text| text.trim().parse::<u32>().ok())
        .ok_or_else(|| BackendError::format(key, "expected a decimal counter"))
}

fn record(decision: &RateDecision, source: &'static str) {
    debug!(
        source,
        allowed = decision.allowed,
        remaining = decision.remaining,
        "Rate limit decision"
    );
    #[cfg(feature = "metrics")]
    {
        let outcome = if decision.allowed { "allowed" } else { "denied" };
        metrics::counter!(*RATE_LIMIT_DECISIONS, "outcome" => outcome, "source" => source)
            .increment(1);
    }
}

/// Builder for [`WindowRateLimiter`].
#[derive(Default)]
pub struct WindowRateLimiterBuilder {
    config: RateLimitConfig,
    clock: Option<SharedClock>,
    durable: Option<SharedStore>,
}

impl fmt::Debug for WindowRateLimiterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowRateLimiterBuilder")
            .field("config", &self.config)
            .field("durable", &self.durable.as_ref().map(|store| store.name()))
            .finish()
    }
}

impl WindowRateLimiterBuilder {
    /// Set the configuration.
    pub fn config(mut self, config: RateLimitConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the time source.
    pub fn clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Keep counters in `store`.
    pub fn durable_store<S>(self, store: S) -> Self
    where
        S: DurableStore + 'static,
    {
        self.shared_store(Arc::new(store))
    }

    /// Keep counters in an already shared store.
    pub fn shared_store(mut self, store: Arc<dyn DurableStore + Send + 'static>) -> Self {
        self.durable = Some(store);
        self
    }

    /// Build the limiter.
    pub fn build(self) -> WindowRateLimiter {
        let clock = self.clock.unwrap_or_else(system_clock);
        let counters = || {
            MemoryCounterStore::new(
                self.config.fallback_capacity,
                self.config.cleanup_interval,
                clock.now(),
            )
        };
        let (recent, fallback) = (counters(), counters());
        if let Some(store) = &self.durable {
            debug!(store = store.name(), "Rate limiter using durable store");
        }
        WindowRateLimiter {
            config: self.config,
            clock,
            durable: self.durable,
            recent,
            fallback,
        }
    }
}
