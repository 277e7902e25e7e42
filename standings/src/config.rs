//! Configuration for the three stores.
//!
//! Every config derives `Serialize`/`Deserialize` with durations written as
//! humantime strings (`"5m"`, `"500ms"`), and has a builder for code-side
//! construction. [`StandingsConfig`] groups all three and loads from YAML:
//!
//! ```
//! use standings::config::StandingsConfig;
//! use std::time::Duration;
//!
//! let config = StandingsConfig::from_yaml(r#"
//! revalidating:
//!   stale_after: 5m
//!   cache_time: 30m
//! rate_limit:
//!   limit: 100
//!   window: 60s
//! "#).unwrap();
//!
//! assert_eq!(config.revalidating.stale_after, Duration::from_secs(300));
//! assert_eq!(config.rate_limit.limit, 100);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::error::ConfigError;

/// Policy for handling stale response cache entries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Default)]
pub enum StalePolicy {
    /// Return stale data without any revalidation.
    #[default]
    Return,
    /// Treat stale as expired and wait for fresh data. A failed fetch is
    /// returned as an error; the stale value stays readable through `get`.
    Revalidate,
    /// Return stale data immediately and revalidate in background (Stale-While-Revalidate).
    OffloadRevalidate,
}

/// Settings of the client-facing [`RevalidatingCache`](crate::RevalidatingCache).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct RevalidatingConfig {
    /// Age after which a value is stale but still served (e.g., "5m").
    #[serde(with = "humantime_serde")]
    pub stale_after: Duration,
    /// Age after which a value is purged entirely. Must be `>= stale_after`.
    #[serde(with = "humantime_serde")]
    pub cache_time: Duration,
    /// Minimum spacing between refresh attempts for the same key.
    #[serde(with = "humantime_serde")]
    pub dedupe_window: Duration,
    /// Mark everything stale when the focus signal fires.
    pub revalidate_on_focus: bool,
    /// Mark everything stale when the reconnect signal fires.
    pub revalidate_on_reconnect: bool,
    /// Minimum spacing between sweeps of expired entries.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
}

impl Default for RevalidatingConfig {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(5 * 60),
            cache_time: Duration::from_secs(30 * 60),
            dedupe_window: Duration::from_secs(2),
            revalidate_on_focus: true,
            revalidate_on_reconnect: true,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl RevalidatingConfig {
    /// Create a new builder for RevalidatingConfig.
    pub fn builder() -> RevalidatingConfigBuilder {
        RevalidatingConfigBuilder::default()
    }

    /// Checks the settings for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_time < self.stale_after {
            return Err(ConfigError::invalid(
                "cache_time",
                format!(
                    "{:?} is shorter than stale_after {:?}",
                    self.cache_time, self.stale_after
                ),
            ));
        }
        if self.cache_time.is_zero() {
            return Err(ConfigError::invalid("cache_time", "must be positive"));
        }
        Ok(())
    }
}

/// Builder for RevalidatingConfig.
#[derive(Debug, Clone, Default)]
pub struct RevalidatingConfigBuilder {
    config: RevalidatingConfig,
}

impl RevalidatingConfigBuilder {
    /// Set the stale threshold.
    pub fn stale_after(mut self, stale_after: Duration) -> Self {
        self.config.stale_after = stale_after;
        self
    }

    /// Set the purge threshold.
    pub fn cache_time(mut self, cache_time: Duration) -> Self {
        self.config.cache_time = cache_time;
        self
    }

    /// Set the minimum spacing between refreshes of one key.
    pub fn dedupe_window(mut self, window: Duration) -> Self {
        self.config.dedupe_window = window;
        self
    }

    /// Enable or disable revalidation on focus.
    pub fn revalidate_on_focus(mut self, enabled: bool) -> Self {
        self.config.revalidate_on_focus = enabled;
        self
    }

    /// Enable or disable revalidation on reconnect.
    pub fn revalidate_on_reconnect(mut self, enabled: bool) -> Self {
        self.config.revalidate_on_reconnect = enabled;
        self
    }

    /// Set the sweep interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Build and validate the config.
    pub fn build(self) -> Result<RevalidatingConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// A named request shape with its own TTL.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CategoryRule {
    /// Category name, used as the key prefix.
    pub name: SmolStr,
    /// Top-level query fields that select this category.
    pub fields: Vec<SmolStr>,
    /// TTL for responses in this category.
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
}

impl CategoryRule {
    /// Creates a rule.
    pub fn new<I, S>(name: impl Into<SmolStr>, fields: I, ttl: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SmolStr>,
    {
        Self {
            name: name.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            ttl,
        }
    }

    /// Whether any of `fields` selects this rule.
    pub fn matches(&self, fields: &[SmolStr]) -> bool {
        fields.iter().any(|field| self.fields.contains(field))
    }
}

/// The category table used for the tournament leaderboard upstream.
pub fn default_categories() -> Vec<CategoryRule> {
    vec![
        CategoryRule::new(
            "leaderboard",
            ["v2Leaderboard", "leaderboard"],
            Duration::from_secs(5 * 60),
        ),
        CategoryRule::new(
            "rounds",
            ["rounds", "v2Rounds", "roundDetails"],
            Duration::from_secs(10 * 60),
        ),
        CategoryRule::new(
            "model",
            ["v3UserProfile", "v2UserProfile", "model", "modelPerformance"],
            Duration::from_secs(2 * 60),
        ),
        CategoryRule::new(
            "account",
            ["account", "userActivities"],
            Duration::from_secs(60),
        ),
    ]
}

/// Settings of the server-facing [`ResponseCache`](crate::ResponseCache).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct ResponseConfig {
    /// TTL for requests matching no category and for `set` without a TTL.
    #[serde(with = "humantime_serde")]
    pub default_ttl: Duration,
    /// Grace period after the TTL during which values are served as stale.
    #[serde(with = "humantime_serde")]
    pub stale_window: Duration,
    /// Maximum number of resident keys.
    pub max_entries: usize,
    /// Minimum spacing between sweeps of expired entries.
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,
    /// What `get_or_fetch` does with a stale hit.
    pub stale_policy: StalePolicy,
    /// Request categories, first match wins.
    pub categories: Vec<CategoryRule>,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            stale_window: Duration::from_secs(30),
            max_entries: 1000,
            sweep_interval: Duration::from_secs(60),
            stale_policy: StalePolicy::default(),
            categories: default_categories(),
        }
    }
}

impl ResponseConfig {
    /// Create a new builder for ResponseConfig.
    pub fn builder() -> ResponseConfigBuilder {
        ResponseConfigBuilder::default()
    }

    /// Returns the first category rule selected by `fields`.
    pub fn classify(&self, fields: &[SmolStr]) -> Option<&CategoryRule> {
        self.categories.iter().find(|rule| rule.matches(fields))
    }

    /// TTL for a category name, the default TTL when unknown.
    pub fn ttl_for(&self, category: Option<&str>) -> Duration {
        category
            .and_then(|name| self.categories.iter().find(|rule| rule.name == name))
            .map_or(self.default_ttl, |rule| rule.ttl)
    }

    /// Checks the settings for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::invalid("max_entries", "must be at least 1"));
        }
        if let Some(rule) = self.categories.iter().find(|rule| rule.fields.is_empty()) {
            return Err(ConfigError::invalid(
                "categories",
                format!("category `{}` lists no fields", rule.name),
            ));
        }
        Ok(())
    }
}

/// Builder for ResponseConfig.
#[derive(Debug, Clone, Default)]
pub struct ResponseConfigBuilder {
    config: ResponseConfig,
}

impl ResponseConfigBuilder {
    /// Set the default TTL.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.config.default_ttl = ttl;
        self
    }

    /// Set the stale grace window.
    pub fn stale_window(mut self, window: Duration) -> Self {
        self.config.stale_window = window;
        self
    }

    /// Set the capacity.
    pub fn max_entries(mut self, max: usize) -> Self {
        self.config.max_entries = max;
        self
    }

    /// Set the sweep interval.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.config.sweep_interval = interval;
        self
    }

    /// Set the stale policy.
    pub fn stale_policy(mut self, policy: StalePolicy) -> Self {
        self.config.stale_policy = policy;
        self
    }

    /// Replace the category table.
    pub fn categories(mut self, categories: Vec<CategoryRule>) -> Self {
        self.config.categories = categories;
        self
    }

    /// Build and validate the config.
    pub fn build(self) -> Result<ResponseConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Settings of the [`WindowRateLimiter`](crate::WindowRateLimiter).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum operations per caller per window.
    pub limit: u32,
    /// Window length. Must be a whole number of seconds.
    #[serde(with = "humantime_serde")]
    pub window: Duration,
    /// Ceiling on resident keys in the in-memory fallback store.
    pub fallback_capacity: usize,
    /// Minimum spacing between purges of elapsed windows.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    /// Prefix of counter keys in the durable store.
    pub key_prefix: SmolStr,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            window: Duration::from_secs(60),
            fallback_capacity: 10_000,
            cleanup_interval: Duration::from_secs(60),
            key_prefix: SmolStr::new_static("ratelimit"),
        }
    }
}

impl RateLimitConfig {
    /// Create a new builder for RateLimitConfig.
    pub fn builder() -> RateLimitConfigBuilder {
        RateLimitConfigBuilder::default()
    }

    /// Window length in whole seconds.
    pub fn window_secs(&self) -> i64 {
        i64::try_from(self.window.as_secs()).unwrap_or(i64::MAX).max(1)
    }

    /// Checks the settings for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limit == 0 {
            return Err(ConfigError::invalid("limit", "must be at least 1"));
        }
        if self.window < Duration::from_secs(1) {
            return Err(ConfigError::invalid("window", "must be at least 1s"));
        }
        if self.window.subsec_nanos() != 0 {
            return Err(ConfigError::invalid(
                "window",
                format!("{:?} is not a whole number of seconds", self.window),
            ));
        }
        if self.fallback_capacity == 0 {
            return Err(ConfigError::invalid(
                "fallback_capacity",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Builder for RateLimitConfig.
#[derive(Debug, Clone, Default)]
pub struct RateLimitConfigBuilder {
    config: RateLimitConfig,
}

impl RateLimitConfigBuilder {
    /// Set the per-window limit.
    pub fn limit(mut self, limit: u32) -> Self {
        self.config.limit = limit;
        self
    }

    /// Set the window length.
    pub fn window(mut self, window: Duration) -> Self {
        self.config.window = window;
        self
    }

    /// Set the fallback store ceiling.
    pub fn fallback_capacity(mut self, capacity: usize) -> Self {
        self.config.fallback_capacity = capacity;
        self
    }

    /// Set the cleanup interval.
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.config.cleanup_interval = interval;
        self
    }

    /// Set the durable key prefix.
    pub fn key_prefix(mut self, prefix: impl Into<SmolStr>) -> Self {
        self.config.key_prefix = prefix.into();
        self
    }

    /// Build and validate the config.
    pub fn build(self) -> Result<RateLimitConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration of all three stores.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct StandingsConfig {
    /// Client-facing revalidating cache.
    pub revalidating: RevalidatingConfig,
    /// Server-facing response cache.
    pub response: ResponseConfig,
    /// Per-caller rate limiter.
    pub rate_limit: RateLimitConfig,
}

impl StandingsConfig {
    /// Parses and validates a YAML document. Missing sections use defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_saphyr::from_str(yaml).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.revalidating.validate()?;
        self.response.validate()?;
        self.rate_limit.validate()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn yaml_overrides_and_defaults() {
        let yaml = r#"
response:
  default_ttl: 90s
  stale_window: 10s
  max_entries: 500
  stale_policy: OffloadRevalidate
  categories:
    - name: leaderboard
      fields: [v2Leaderboard]
      ttl: 5m
"#;
        let config = StandingsConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.revalidating, RevalidatingConfig::default());
        assert_eq!(config.rate_limit, RateLimitConfig::default());
        assert_eq!(
            config.response,
            ResponseConfig {
                default_ttl: Duration::from_secs(90),
                stale_window: Duration::from_secs(10),
                max_entries: 500,
                sweep_interval: Duration::from_secs(60),
                stale_policy: StalePolicy::OffloadRevalidate,
                categories: vec![CategoryRule::new(
                    "leaderboard",
                    ["v2Leaderboard"],
                    Duration::from_secs(300)
                )],
            }
        );
    }

    #[test]
    fn cache_time_shorter_than_stale_after_is_rejected() {
        let err = RevalidatingConfig::builder()
            .stale_after(Duration::from_secs(600))
            .cache_time(Duration::from_secs(60))
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "cache_time", .. }));
    }

    #[test]
    fn invalid_yaml_is_a_parse_error() {
        let err = StandingsConfig::from_yaml("rate_limit: [1, 2").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn zero_limit_and_capacity_are_rejected() {
        assert!(RateLimitConfig::builder().limit(0).build().is_err());
        assert!(RateLimitConfig::builder().fallback_capacity(0).build().is_err());
        assert!(
            RateLimitConfig::builder()
                .window(Duration::from_millis(500))
                .build()
                .is_err()
        );
        assert!(ResponseConfig::builder().max_entries(0).build().is_err());
    }

    #[test]
    fn classification_falls_back_to_default_ttl() {
        let config = ResponseConfig::default();
        let fields = [SmolStr::new_static("rounds")];
        assert_eq!(config.classify(&fields).map(|r| r.name.as_str()), Some("rounds"));
        assert_eq!(config.ttl_for(Some("rounds")), Duration::from_secs(600));
        assert_eq!(config.ttl_for(Some("unknown")), config.default_ttl);
        assert_eq!(config.ttl_for(None), config.default_ttl);
        assert!(config.classify(&[SmolStr::new_static("somethingElse")]).is_none());
    }
}
