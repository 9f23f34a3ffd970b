//! # Latency Aggregation
//!
//! Online latency statistics for one trial: exact min/max, Welford mean,
//! an online mean-absolute-deviation jitter estimate, and percentiles.
//!
//! Percentiles come from one of two sources:
//!
//! - an exact sorted-sample computation while the trial stays at or below
//!   `EXACT_SAMPLE_CAP` samples, and
//! - an HDR histogram (3 significant figures) beyond that, where the exact
//!   buffer is abandoned and only the histogram keeps growing.
//!
//! Min and max are tracked exactly alongside the histogram; HDR quantizes
//! values internally and would otherwise report a min/max slightly off the
//! raw observations. The snapshot clamps percentiles into `[min, max]` and
//! enforces `p50 <= p95 <= p99` so histogram quantization can never leak a
//! non-monotone statistics row.

use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};

/// Above this sample count percentiles switch from exact to HDR estimates.
pub const EXACT_SAMPLE_CAP: usize = 100_000;

/// One received probe frame, as handed from the receiver to the
/// aggregation side over the sample ring.
#[derive(Debug, Clone, Copy)]
pub struct LatencySample {
    pub seq: u32,
    pub rx_ns: u64,
    pub tx_ns: u64,
    pub stream: u32,
}

impl LatencySample {
    /// Latency with the skew floor applied. The receiver drops samples
    /// where `rx_ns < tx_ns` before they reach the ring; the saturating
    /// subtraction here never has to correct anything.
    #[inline]
    pub fn latency_ns(&self) -> u64 {
        self.rx_ns.saturating_sub(self.tx_ns)
    }
}

/// Point-in-time latency statistics. All durations in nanoseconds.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct LatencyStats {
    pub count: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: f64,
    /// Mean absolute deviation from the mean.
    pub jitter_ns: f64,
    pub p50_ns: u64,
    pub p95_ns: u64,
    pub p99_ns: u64,
}

impl LatencyStats {
    pub fn mean_ms(&self) -> f64 {
        self.mean_ns / 1_000_000.0
    }

    pub fn jitter_ms(&self) -> f64 {
        self.jitter_ns / 1_000_000.0
    }
}

/// Online latency recorder. Single writer; snapshots are cheap reads.
pub struct LatencyRecorder {
    histogram: Histogram<u64>,
    /// Exact samples kept until the cap is crossed, then discarded.
    exact: Option<Vec<u64>>,
    count: u64,
    min_ns: u64,
    max_ns: u64,
    mean_ns: f64,
    abs_dev_sum: f64,
}

impl Default for LatencyRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyRecorder {
    pub fn new() -> Self {
        // 3 significant figures covers sub-microsecond to minute-scale
        // latencies at 0.1 % precision; auto-resize avoids committing to a
        // maximum up front.
        let mut histogram = Histogram::<u64>::new(3).expect("histogram construction");
        histogram.auto(true);
        LatencyRecorder {
            histogram,
            exact: Some(Vec::with_capacity(4096)),
            count: 0,
            min_ns: 0,
            max_ns: 0,
            mean_ns: 0.0,
            abs_dev_sum: 0.0,
        }
    }

    /// Record one latency observation.
    pub fn add(&mut self, latency_ns: u64) {
        // Saturating record: auto-resize makes failure practically
        // impossible, and a dropped outlier must not poison the trial.
        let _ = self.histogram.record(latency_ns);

        if self.count == 0 {
            self.min_ns = latency_ns;
            self.max_ns = latency_ns;
        } else {
            self.min_ns = self.min_ns.min(latency_ns);
            self.max_ns = self.max_ns.max(latency_ns);
        }
        self.count += 1;

        // Welford update; the deviation sum uses the post-update mean.
        let delta = latency_ns as f64 - self.mean_ns;
        self.mean_ns += delta / self.count as f64;
        self.abs_dev_sum += (latency_ns as f64 - self.mean_ns).abs();

        if let Some(exact) = &mut self.exact {
            if exact.len() < EXACT_SAMPLE_CAP {
                exact.push(latency_ns);
            } else {
                self.exact = None;
            }
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Fold another recorder in (multi-stream trials aggregate per-stream
    /// recorders into a trial-wide one).
    pub fn merge(&mut self, other: &LatencyRecorder) {
        if other.count == 0 {
            return;
        }
        let _ = self.histogram.add(&other.histogram);
        if self.count == 0 {
            self.min_ns = other.min_ns;
            self.max_ns = other.max_ns;
        } else {
            self.min_ns = self.min_ns.min(other.min_ns);
            self.max_ns = self.max_ns.max(other.max_ns);
        }
        let total = self.count + other.count;
        self.mean_ns = (self.mean_ns * self.count as f64 + other.mean_ns * other.count as f64)
            / total as f64;
        self.abs_dev_sum += other.abs_dev_sum;
        self.count = total;

        match (&mut self.exact, &other.exact) {
            (Some(mine), Some(theirs)) if mine.len() + theirs.len() <= EXACT_SAMPLE_CAP => {
                mine.extend_from_slice(theirs);
            }
            _ => self.exact = None,
        }
    }

    /// Consistent point-in-time statistics. Empty recorders return all
    /// zeros; a single sample pins min, max and every percentile to it.
    pub fn snapshot(&self) -> LatencyStats {
        if self.count == 0 {
            return LatencyStats::default();
        }

        let (p50, p95, p99) = match &self.exact {
            Some(samples) => {
                let mut sorted = samples.clone();
                sorted.sort_unstable();
                (
                    exact_percentile(&sorted, 50.0),
                    exact_percentile(&sorted, 95.0),
                    exact_percentile(&sorted, 99.0),
                )
            }
            None => (
                self.histogram.value_at_quantile(0.50),
                self.histogram.value_at_quantile(0.95),
                self.histogram.value_at_quantile(0.99),
            ),
        };

        // Clamp away histogram quantization so min <= p50 <= p95 <= p99 <= max.
        let p50 = p50.clamp(self.min_ns, self.max_ns);
        let p95 = p95.clamp(p50, self.max_ns);
        let p99 = p99.clamp(p95, self.max_ns);

        LatencyStats {
            count: self.count,
            min_ns: self.min_ns,
            max_ns: self.max_ns,
            mean_ns: self.mean_ns,
            jitter_ns: self.abs_dev_sum / self.count as f64,
            p50_ns: p50,
            p95_ns: p95,
            p99_ns: p99,
        }
    }
}

/// Nearest-rank percentile over a sorted slice.
fn exact_percentile(sorted: &[u64], pct: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((pct / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_recorder_returns_zeros() {
        let stats = LatencyRecorder::new().snapshot();
        assert_eq!(stats, LatencyStats::default());
    }

    #[test]
    fn single_sample_pins_everything() {
        let mut r = LatencyRecorder::new();
        r.add(12_345);
        let s = r.snapshot();
        assert_eq!(s.count, 1);
        assert_eq!(s.min_ns, 12_345);
        assert_eq!(s.max_ns, 12_345);
        assert_eq!(s.p50_ns, 12_345);
        assert_eq!(s.p95_ns, 12_345);
        assert_eq!(s.p99_ns, 12_345);
        assert!((s.mean_ns - 12_345.0).abs() < 1e-9);
        assert_eq!(s.jitter_ns, 0.0);
    }

    #[test]
    fn percentiles_are_monotone() {
        let mut r = LatencyRecorder::new();
        for i in 1..=10_000u64 {
            r.add(i * 100);
        }
        let s = r.snapshot();
        assert_eq!(s.count, 10_000);
        assert!(s.min_ns <= s.p50_ns);
        assert!(s.p50_ns <= s.p95_ns);
        assert!(s.p95_ns <= s.p99_ns);
        assert!(s.p99_ns <= s.max_ns);
        // Exact mode: p50 of 100..=1_000_000 step 100 is 500_000.
        assert_eq!(s.p50_ns, 500_000);
        assert_eq!(s.p99_ns, 990_000);
    }

    #[test]
    fn jitter_tracks_absolute_deviation() {
        let mut r = LatencyRecorder::new();
        // Alternating 1000/3000: mean 2000, every deviation 1000.
        for i in 0..1000 {
            r.add(if i % 2 == 0 { 1000 } else { 3000 });
        }
        let s = r.snapshot();
        assert!((s.mean_ns - 2000.0).abs() < 10.0);
        assert!((s.jitter_ns - 1000.0).abs() < 20.0);
    }

    #[test]
    fn merge_combines_streams() {
        let mut a = LatencyRecorder::new();
        let mut b = LatencyRecorder::new();
        for i in 0..500u64 {
            a.add(1_000 + i);
            b.add(10_000 + i);
        }
        let mut total = LatencyRecorder::new();
        total.merge(&a);
        total.merge(&b);
        let s = total.snapshot();
        assert_eq!(s.count, 1000);
        assert_eq!(s.min_ns, 1_000);
        assert_eq!(s.max_ns, 10_499);
        assert!(s.p50_ns <= s.p95_ns && s.p95_ns <= s.p99_ns);
    }

    #[test]
    fn overflow_past_cap_switches_to_histogram() {
        let mut r = LatencyRecorder::new();
        for i in 0..(EXACT_SAMPLE_CAP as u64 + 10) {
            r.add(1_000 + i % 97);
        }
        let s = r.snapshot();
        assert_eq!(s.count, EXACT_SAMPLE_CAP as u64 + 10);
        assert!(s.min_ns <= s.p50_ns && s.p99_ns <= s.max_ns);
    }
}
