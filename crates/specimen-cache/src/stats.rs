//! Run statistics.

use crate::dispatch::SpecimenOutcome;
use crate::types::LineageStatus;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Counters describing cache effectiveness for a batch or a dispatcher's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    /// Result cache lookups (one per specimen that could be hashed).
    pub total_lookups: u64,
    /// Lookups answered from the result cache, including skipped error rows.
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Successful extractions performed by the engine.
    pub fresh_extractions: u64,
    pub failures: u64,
    /// Local copies evicted by the caching locator.
    pub eviction_count: u64,
}

impl RunStats {
    pub fn record(&mut self, outcome: &SpecimenOutcome) {
        if outcome.specimen_hash.is_some() {
            self.total_lookups += 1;
            if outcome.cache_hit {
                self.cache_hits += 1;
            } else {
                self.cache_misses += 1;
            }
        }
        match outcome.status {
            LineageStatus::Completed => self.fresh_extractions += 1,
            LineageStatus::Failed => self.failures += 1,
            LineageStatus::Cached | LineageStatus::Skipped => {}
        }
    }

    pub fn merge(&mut self, other: &RunStats) {
        self.total_lookups += other.total_lookups;
        self.cache_hits += other.cache_hits;
        self.cache_misses += other.cache_misses;
        self.fresh_extractions += other.fresh_extractions;
        self.failures += other.failures;
        self.eviction_count += other.eviction_count;
    }

    /// Share of lookups served from the cache, `0.0` when nothing was looked up.
    pub fn hit_rate(&self) -> f64 {
        if self.total_lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.total_lookups as f64
        }
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lookups: {} (hits {}, misses {}, hit rate {:.1}%), fresh extractions: {}, failures: {}, evictions: {}",
            self.total_lookups,
            self.cache_hits,
            self.cache_misses,
            self.hit_rate() * 100.0,
            self.fresh_extractions,
            self.failures,
            self.eviction_count
        )
    }
}
