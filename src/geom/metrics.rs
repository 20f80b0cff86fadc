//! Opt-in stage timing for the mold pipeline.
//!
//! Timing is only collected with the `mesh_engine_metrics` feature on a non-wasm target
//! (`std::time::Instant` is unavailable on `wasm32`). Otherwise every call is a
//! pass-through and [`GeomMetrics::end`] returns `None`.
//!
//! ```ignore
//! use mold_engine::geom::{GeomMetrics, TimingBucket};
//!
//! let mut metrics = GeomMetrics::default();
//! metrics.begin();
//! let laplacian = metrics.time(TimingBucket::Laplacian, || build_laplacian(&tess));
//! if let Some(report) = metrics.end() {
//!     println!("laplacian: {} ns", report.get(TimingBucket::Laplacian));
//! }
//! ```

use serde::Serialize;

/// Pipeline stages that accumulate time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TimingBucket {
    Tessellation,
    Laplacian,
    Curvature,
    Segmentation,
    Fitting,
    Draft,
    Solid,
    Keys,
    Validation,
}

impl TimingBucket {
    pub const ALL: [Self; 9] = [
        Self::Tessellation,
        Self::Laplacian,
        Self::Curvature,
        Self::Segmentation,
        Self::Fitting,
        Self::Draft,
        Self::Solid,
        Self::Keys,
        Self::Validation,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Tessellation => "tessellation",
            Self::Laplacian => "laplacian",
            Self::Curvature => "curvature",
            Self::Segmentation => "segmentation",
            Self::Fitting => "fitting",
            Self::Draft => "draft",
            Self::Solid => "solid",
            Self::Keys => "keys",
            Self::Validation => "validation",
        }
    }
}

/// Cumulative nanoseconds per bucket.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct GeomTimingReport {
    buckets: [u64; TimingBucket::ALL.len()],
}

impl GeomTimingReport {
    #[must_use]
    pub fn get(&self, bucket: TimingBucket) -> u64 {
        self.buckets[bucket.index()]
    }

    pub fn add(&mut self, bucket: TimingBucket, nanos: u64) {
        let slot = &mut self.buckets[bucket.index()];
        *slot = slot.saturating_add(nanos);
    }

    pub fn merge(&mut self, other: &GeomTimingReport) {
        for bucket in TimingBucket::ALL {
            self.add(bucket, other.get(bucket));
        }
    }

    #[must_use]
    pub fn total_ns(&self) -> u64 {
        self.buckets.iter().fold(0u64, |acc, &ns| acc.saturating_add(ns))
    }

    #[must_use]
    pub fn total_ms(&self) -> f64 {
        self.total_ns() as f64 / 1_000_000.0
    }

    /// Non-empty buckets as `(label, ns)`.
    pub fn entries(&self) -> impl Iterator<Item = (&'static str, u64)> + '_ {
        TimingBucket::ALL
            .iter()
            .map(|&b| (b.label(), self.get(b)))
            .filter(|&(_, ns)| ns > 0)
    }
}

/// Accumulator for stage timings: [`begin`](Self::begin) resets,
/// [`time`](Self::time) wraps a stage, [`end`](Self::end) returns the report.
#[derive(Debug, Default)]
pub struct GeomMetrics {
    #[cfg(all(feature = "mesh_engine_metrics", not(target_arch = "wasm32")))]
    report: GeomTimingReport,
}

impl GeomMetrics {
    pub fn begin(&mut self) {
        #[cfg(all(feature = "mesh_engine_metrics", not(target_arch = "wasm32")))]
        {
            self.report = GeomTimingReport::default();
        }
    }

    /// The accumulated report, or `None` when metrics are compiled out.
    #[must_use]
    pub fn end(&self) -> Option<GeomTimingReport> {
        #[cfg(all(feature = "mesh_engine_metrics", not(target_arch = "wasm32")))]
        {
            Some(self.report.clone())
        }
        #[cfg(not(all(feature = "mesh_engine_metrics", not(target_arch = "wasm32"))))]
        {
            None
        }
    }

    /// Folds a report collected elsewhere, e.g. on a worker thread, into this one.
    pub fn absorb(&mut self, report: Option<&GeomTimingReport>) {
        #[cfg(all(feature = "mesh_engine_metrics", not(target_arch = "wasm32")))]
        {
            if let Some(report) = report {
                self.report.merge(report);
            }
        }
        #[cfg(not(all(feature = "mesh_engine_metrics", not(target_arch = "wasm32"))))]
        {
            let _ = report;
        }
    }

    pub fn time<R>(&mut self, bucket: TimingBucket, f: impl FnOnce() -> R) -> R {
        #[cfg(all(feature = "mesh_engine_metrics", not(target_arch = "wasm32")))]
        {
            let start = std::time::Instant::now();
            let result = f();
            let nanos = start.elapsed().as_nanos().min(u128::from(u64::MAX)) as u64;
            self.report.add(bucket, nanos);
            result
        }

        #[cfg(not(all(feature = "mesh_engine_metrics", not(target_arch = "wasm32"))))]
        {
            let _ = bucket;
            f()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_report_total() {
        let mut report = GeomTimingReport::default();
        report.add(TimingBucket::Laplacian, 1000);
        report.add(TimingBucket::Fitting, 2000);
        report.add(TimingBucket::Fitting, 3000);
        assert_eq!(report.get(TimingBucket::Fitting), 5000);
        assert_eq!(report.total_ns(), 6000);
        assert!((report.total_ms() - 0.006).abs() < 1e-9);
        assert_eq!(report.entries().count(), 2);
    }

    #[test]
    fn test_time_returns_closure_result() {
        let mut metrics = GeomMetrics::default();
        metrics.begin();
        let result = metrics.time(TimingBucket::Solid, || 42);
        assert_eq!(result, 42);
        let _ = metrics.end();
    }

    #[test]
    fn test_bucket_indices_are_dense() {
        for (i, bucket) in TimingBucket::ALL.iter().enumerate() {
            assert_eq!(bucket.index(), i);
        }
    }
}
