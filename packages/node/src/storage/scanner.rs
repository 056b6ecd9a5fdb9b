//! Predicate scans over resident entries.
//!
//! A scan evaluates the predicate against a snapshot of memory only; it never
//! reaches the backing store. Any failure during the scan (a panicking
//! predicate, the scan deadline) degrades to an empty result with a warning
//! instead of surfacing an error.

use std::collections::HashSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mapstore_core::{CacheKey, CacheValue, ValuePredicate};
use tracing::warn;

use crate::storage::engine::StorageEngine;

#[derive(Debug)]
enum ScanFailure {
    Panicked,
    TimedOut { scanned: usize },
}

impl ScanFailure {
    fn reason(&self) -> &'static str {
        match self {
            Self::Panicked => "predicate_panicked",
            Self::TimedOut { .. } => "timed_out",
        }
    }
}

/// Evaluates value predicates over a [`StorageEngine`] snapshot.
pub struct PredicateScanner<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    map_name: String,
    engine: Arc<dyn StorageEngine<K, V>>,
    scan_timeout: Duration,
}

impl<K: CacheKey, V: CacheValue> PredicateScanner<K, V> {
    pub fn new(
        map_name: impl Into<String>,
        engine: Arc<dyn StorageEngine<K, V>>,
        scan_timeout: Duration,
    ) -> Self {
        Self {
            map_name: map_name.into(),
            engine,
            scan_timeout,
        }
    }

    /// Keys whose value matches `predicate`. Empty on failure.
    pub fn scan_keys(&self, predicate: &dyn ValuePredicate<V>) -> HashSet<K> {
        self.scan(predicate).into_iter().map(|(key, _)| key).collect()
    }

    /// Matching entries. Empty on failure.
    pub fn scan(&self, predicate: &dyn ValuePredicate<V>) -> Vec<(K, Arc<V>)> {
        match self.try_scan(predicate) {
            Ok(matches) => matches,
            Err(failure) => {
                warn!(
                    map = %self.map_name,
                    reason = failure.reason(),
                    detail = ?failure,
                    "predicate scan failed, returning empty result"
                );
                metrics::counter!(
                    "mapstore_degraded_scans_total",
                    "map" => self.map_name.clone(),
                    "reason" => failure.reason()
                )
                .increment(1);
                Vec::new()
            }
        }
    }

    fn try_scan(&self, predicate: &dyn ValuePredicate<V>) -> Result<Vec<(K, Arc<V>)>, ScanFailure> {
        let started = Instant::now();
        let snapshot = self.engine.snapshot();
        let mut matches = Vec::new();

        for (scanned, (key, record)) in snapshot.into_iter().enumerate() {
            if started.elapsed() > self.scan_timeout {
                return Err(ScanFailure::TimedOut { scanned });
            }
            let hit = catch_unwind(AssertUnwindSafe(|| predicate.matches(&record.value)))
                .map_err(|_| ScanFailure::Panicked)?;
            if hit {
                matches.push((key, record.value));
            }
        }
        Ok(matches)
    }
}
