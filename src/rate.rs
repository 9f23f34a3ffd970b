//! # Offered Rate and Pacing
//!
//! Two things live here: the exact rational representation of an offered
//! rate, and the token-bucket controller that turns it into wire timing.
//!
//! ## Rate representation
//!
//! Offered rates are percentages of line rate stored as integers in units
//! of 10⁻⁴ percent (100 % = 1_000_000). Binary-search bisection on integers
//! stays exact: `midpoint(low, high)` never accumulates floating-point
//! drift, and the termination test `high - low <= resolution` is a plain
//! integer comparison.
//!
//! ## Line-rate accounting
//!
//! A frame of `frame_size` bytes costs `frame_size + 20` byte times on the
//! wire (8 bytes preamble + 12 bytes minimum inter-frame gap), so
//!
//! ```text
//! pps = line_rate_bps * offered_pct / (100 * (frame_size + 20) * 8)
//! ```
//!
//! ## Pacing discipline
//!
//! The controller keeps one deadline, `next_tx_ns`, advanced by a fixed
//! inter-batch interval. Wake-ups later than the deadline debit future
//! sleep rather than shrinking the current burst: the next deadline is
//! computed from the *previous deadline*, not from the late wake-up time,
//! so the long-term mean rate equals the target even under scheduler
//! jitter. The contract is measured-sent rate within ±0.5 % of target over
//! any one-second window at targets of at least 1 % of line rate.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::monotonic_ns;

/// Wire overhead charged per frame: 8-byte preamble + 12-byte IFG.
pub const WIRE_OVERHEAD_BYTES: u64 = 20;

/// Offered rate as a percentage of line rate, in units of 10⁻⁴ percent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct OfferedRate(u32);

impl OfferedRate {
    pub const ZERO: OfferedRate = OfferedRate(0);
    /// 100 % of line rate.
    pub const FULL: OfferedRate = OfferedRate(1_000_000);

    /// Units per whole percent.
    const UNITS_PER_PCT: f64 = 10_000.0;

    /// Build from a percentage. Values are clamped to [0, 100].
    pub fn from_pct(pct: f64) -> Self {
        let clamped = pct.clamp(0.0, 100.0);
        OfferedRate((clamped * Self::UNITS_PER_PCT).round() as u32)
    }

    /// Build from an absolute bit rate relative to a line rate.
    pub fn from_bps(rate_bps: u64, line_rate_bps: u64) -> Self {
        if line_rate_bps == 0 {
            return OfferedRate::ZERO;
        }
        Self::from_pct(rate_bps as f64 * 100.0 / line_rate_bps as f64)
    }

    pub fn as_pct(&self) -> f64 {
        self.0 as f64 / Self::UNITS_PER_PCT
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Exact integer midpoint used by the throughput binary search.
    pub fn midpoint(low: OfferedRate, high: OfferedRate) -> OfferedRate {
        OfferedRate(low.0 + (high.0.saturating_sub(low.0)) / 2)
    }

    /// Gap between two rates, in percent. Used for the termination test.
    pub fn gap_pct(high: OfferedRate, low: OfferedRate) -> f64 {
        high.0.saturating_sub(low.0) as f64 / Self::UNITS_PER_PCT
    }

    /// Scale by a factor (recovery test offers 110 % / 50 % of throughput).
    pub fn scaled(&self, factor: f64) -> OfferedRate {
        Self::from_pct(self.as_pct() * factor)
    }

    /// Target frames per second at this rate for the given frame size.
    pub fn pps(&self, line_rate_bps: u64, frame_size: usize) -> f64 {
        let frame_bits = (frame_size as u64 + WIRE_OVERHEAD_BYTES) as f64 * 8.0;
        line_rate_bps as f64 * (self.0 as f64 / 1_000_000.0) / frame_bits
    }

    /// Offered bit rate (payload bits excluding preamble/IFG overhead).
    pub fn bps(&self, line_rate_bps: u64) -> u64 {
        (line_rate_bps as u128 * self.0 as u128 / 1_000_000) as u64
    }
}

impl std::fmt::Display for OfferedRate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.2}%", self.as_pct())
    }
}

/// Token-bucket pacer releasing one batch of frames per interval.
///
/// Single-threaded: lives on the sender thread and is consulted between
/// `send_batch` calls. With pacing disabled (burst mode) every wait is a
/// no-op and frames go out as fast as the port accepts them.
pub struct RateController {
    /// Nanoseconds between batch releases. Zero disables pacing.
    interval_ns: u64,
    /// Next permitted transmit instant.
    next_tx_ns: u64,
    /// Below this remainder we spin instead of sleeping; OS sleep
    /// granularity would otherwise blow the ±0.5 % budget.
    spin_ns: u64,
}

impl RateController {
    const DEFAULT_SPIN_NS: u64 = 250_000;

    /// Build a controller releasing `batch` frames every `batch / pps`
    /// seconds. `pps <= 0` or `use_pacing == false` yields a free-running
    /// controller.
    pub fn new(pps: f64, batch: usize, use_pacing: bool) -> Self {
        let interval_ns = if use_pacing && pps > 0.0 {
            (batch as f64 * 1_000_000_000.0 / pps).round() as u64
        } else {
            0
        };
        RateController {
            interval_ns,
            next_tx_ns: monotonic_ns(),
            spin_ns: Self::DEFAULT_SPIN_NS,
        }
    }

    /// Re-anchor the deadline to now. Called at measurement-phase start so
    /// warmup overruns do not debit the measurement window.
    pub fn align(&mut self) {
        self.next_tx_ns = monotonic_ns();
    }

    /// Replace the target rate mid-trial (recovery test rate schedule).
    /// The deadline is re-anchored so the old rate's debt is not carried
    /// across the step.
    pub fn retarget(&mut self, pps: f64, batch: usize) {
        self.interval_ns = if pps > 0.0 {
            (batch as f64 * 1_000_000_000.0 / pps).round() as u64
        } else {
            0
        };
        self.align();
    }

    /// Inter-batch interval, if pacing is active.
    pub fn interval(&self) -> Option<Duration> {
        (self.interval_ns > 0).then(|| Duration::from_nanos(self.interval_ns))
    }

    /// Block until the next transmit instant, then advance the deadline.
    ///
    /// Sleeps coarsely until close to the deadline, then spins. Overruns
    /// leave the deadline schedule untouched, so a late batch is followed
    /// by shorter waits until the debt is repaid.
    pub fn wait(&mut self) {
        if self.interval_ns == 0 {
            return;
        }
        let target = self.next_tx_ns;
        loop {
            let now = monotonic_ns();
            if now >= target {
                break;
            }
            let remaining = target - now;
            if remaining > self.spin_ns {
                std::thread::sleep(Duration::from_nanos(remaining - self.spin_ns));
            } else {
                std::hint::spin_loop();
            }
        }
        // Advance from the schedule, not from the wake-up time.
        self.next_tx_ns = target + self.interval_ns;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_units_round_trip() {
        let r = OfferedRate::from_pct(49.95);
        assert!((r.as_pct() - 49.95).abs() < 1e-9);
        assert_eq!(OfferedRate::from_pct(100.0), OfferedRate::FULL);
        assert_eq!(OfferedRate::from_pct(250.0), OfferedRate::FULL);
        assert!(OfferedRate::from_pct(0.0).is_zero());
    }

    #[test]
    fn midpoint_is_exact_and_terminates() {
        let mut low = OfferedRate::ZERO;
        let mut high = OfferedRate::FULL;
        // Bisection on integers halves the gap every step; 20 steps take
        // 100 % down to below 10^-4 percent.
        for _ in 0..20 {
            let mid = OfferedRate::midpoint(low, high);
            assert!(mid >= low && mid <= high);
            high = mid;
        }
        assert!(OfferedRate::gap_pct(high, low) < 0.001);
    }

    #[test]
    fn pps_matches_the_line_rate_formula() {
        // 1 Gb/s, 64-byte frames: 1e9 / ((64 + 20) * 8) = 1_488_095.24 pps.
        let pps = OfferedRate::FULL.pps(1_000_000_000, 64);
        assert!((pps - 1_488_095.238).abs() < 0.01);

        // Half rate halves pps.
        let half = OfferedRate::from_pct(50.0).pps(1_000_000_000, 64);
        assert!((half - pps / 2.0).abs() < 0.01);
    }

    #[test]
    fn pacer_holds_mean_rate_under_jitter() {
        // 10k batches/s, batch of 1: 100 us interval. Run 200 intervals
        // and check the elapsed wall time is within 5 % of the ideal
        // 20 ms. The per-window contract is tighter (±0.5 %) but CI boxes
        // are noisy, so the unit test only guards the debt-carry logic.
        let mut rc = RateController::new(10_000.0, 1, true);
        rc.align();
        let t0 = monotonic_ns();
        for _ in 0..200 {
            rc.wait();
        }
        let elapsed = monotonic_ns() - t0;
        let ideal = 200 * 100_000u64;
        assert!(
            elapsed >= ideal - ideal / 20,
            "paced loop ran fast: {elapsed}ns vs {ideal}ns"
        );
        assert!(
            elapsed <= ideal + ideal / 2,
            "paced loop ran slow: {elapsed}ns vs {ideal}ns"
        );
    }

    #[test]
    fn disabled_pacer_never_blocks() {
        let mut rc = RateController::new(1.0, 1, false);
        let t0 = monotonic_ns();
        for _ in 0..1000 {
            rc.wait();
        }
        assert!(monotonic_ns() - t0 < 100_000_000);
    }
}
