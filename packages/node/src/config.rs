//! Cache configuration.

use std::time::Duration;

/// How the cache is populated from the backing store at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialLoadMode {
    /// Load every row before the cache reports ready. Reads never fault to
    /// the backing store afterwards.
    #[default]
    Eager,
    /// Start empty and load individual keys on first miss.
    Lazy,
}

/// Backoff applied to keys whose flush failed.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Upper bound for the doubling backoff.
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Backoff before retry number `attempts` (1-based), doubling each time
    /// and capped at `max_backoff`.
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1_u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Per-cache configuration.
///
/// Controls the write-behind delay, initial load behavior, and the timeouts
/// applied at the backing store boundary.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Name of the cached map, used in log fields and metric labels.
    pub map_name: String,
    /// Time a mutation waits before it is flushed. Repeated writes to a key
    /// within this window are coalesced into one durable write.
    pub write_delay: Duration,
    /// Eager or lazy population at startup.
    pub initial_load: InitialLoadMode,
    /// Granularity of the flush sweep.
    pub flush_tick: Duration,
    /// Maximum number of keys flushed concurrently.
    pub max_concurrent_flushes: usize,
    /// Bound on every backing store call.
    pub store_timeout: Duration,
    /// Bound on a single predicate scan.
    pub scan_timeout: Duration,
    /// Backoff for failed flushes.
    pub retry: RetryPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            map_name: "default".to_string(),
            write_delay: Duration::from_secs(1),
            initial_load: InitialLoadMode::Eager,
            flush_tick: Duration::from_millis(100),
            max_concurrent_flushes: 16,
            store_timeout: Duration::from_secs(30),
            scan_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

impl CacheConfig {
    /// Creates a default config for the named map.
    #[must_use]
    pub fn new(map_name: impl Into<String>) -> Self {
        Self {
            map_name: map_name.into(),
            ..Self::default()
        }
    }

    /// Set the write-behind delay.
    #[must_use]
    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Set the initial load mode.
    #[must_use]
    pub fn with_initial_load(mut self, mode: InitialLoadMode) -> Self {
        self.initial_load = mode;
        self
    }

    /// Set the flush sweep granularity.
    #[must_use]
    pub fn with_flush_tick(mut self, tick: Duration) -> Self {
        self.flush_tick = tick;
        self
    }

    /// Set the flush concurrency limit (at least 1).
    #[must_use]
    pub fn with_max_concurrent_flushes(mut self, max: usize) -> Self {
        self.max_concurrent_flushes = max.max(1);
        self
    }

    /// Set the backing store call timeout.
    #[must_use]
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    /// Set the predicate scan timeout.
    #[must_use]
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the flush retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}
