//! Process-wide counters and their exposition text.
//!
//! [`Metrics`] is a handful of relaxed atomic counters shared across the
//! request pipeline. A [`Snapshot`] is a plain-value copy for reading, and
//! [`Metrics::render`] produces the text served by the metrics endpoint.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters recorded while serving requests.
///
/// Increments use relaxed ordering; the counters are independent and only
/// ever read as a point-in-time snapshot.
#[derive(Debug, Default)]
pub struct Metrics {
    hits: AtomicU64,
    misses: AtomicU64,
    skipped: AtomicU64,
    upstream_errors: AtomicU64,
    store_failures: AtomicU64,
}

/// Plain-value copy of the counters at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub hits: u64,
    pub misses: u64,
    pub skipped: u64,
    pub upstream_errors: u64,
    pub store_failures: u64,
}

impl Snapshot {
    /// Hits as a fraction of cache-eligible requests. Zero when nothing
    /// eligible has been seen yet.
    pub fn hit_ratio(&self) -> f64 {
        let eligible = self.hits + self.misses;
        if eligible == 0 {
            0.0
        } else {
            self.hits as f64 / eligible as f64
        }
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upstream_error(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }

    /// Renders the counters in Prometheus exposition format.
    pub fn render(&self) -> String {
        let s = self.snapshot();
        let mut out = String::with_capacity(512);
        let _ = writeln!(out, "# TYPE larder_requests_total counter");
        let _ = writeln!(out, "larder_requests_total{{outcome=\"hit\"}} {}", s.hits);
        let _ = writeln!(out, "larder_requests_total{{outcome=\"miss\"}} {}", s.misses);
        let _ = writeln!(
            out,
            "larder_requests_total{{outcome=\"skipped\"}} {}",
            s.skipped
        );
        let _ = writeln!(out, "# TYPE larder_upstream_errors_total counter");
        let _ = writeln!(out, "larder_upstream_errors_total {}", s.upstream_errors);
        let _ = writeln!(out, "# TYPE larder_cache_store_failures_total counter");
        let _ = writeln!(
            out,
            "larder_cache_store_failures_total {}",
            s.store_failures
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let m = Metrics::new();
        m.record_hit();
        m.record_hit();
        m.record_miss();
        m.record_skipped();
        m.record_upstream_error();
        m.record_store_failure();

        let s = m.snapshot();
        assert_eq!(s.hits, 2);
        assert_eq!(s.misses, 1);
        assert_eq!(s.skipped, 1);
        assert_eq!(s.upstream_errors, 1);
        assert_eq!(s.store_failures, 1);
    }

    #[test]
    fn hit_ratio_ignores_skipped() {
        let m = Metrics::new();
        m.record_hit();
        m.record_hit();
        m.record_hit();
        m.record_miss();
        m.record_skipped();
        m.record_skipped();
        assert_eq!(m.snapshot().hit_ratio(), 0.75);
    }

    #[test]
    fn empty_hit_ratio_is_zero() {
        assert_eq!(Metrics::new().snapshot().hit_ratio(), 0.0);
    }

    #[test]
    fn render_lists_every_counter() {
        let m = Metrics::new();
        m.record_miss();
        m.record_miss();
        let text = m.render();
        assert!(text.contains("larder_requests_total{outcome=\"hit\"} 0\n"));
        assert!(text.contains("larder_requests_total{outcome=\"miss\"} 2\n"));
        assert!(text.contains("larder_requests_total{outcome=\"skipped\"} 0\n"));
        assert!(text.contains("larder_upstream_errors_total 0\n"));
        assert!(text.contains("larder_cache_store_failures_total 0\n"));
    }
}
