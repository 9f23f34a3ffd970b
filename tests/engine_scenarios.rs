//! Orchestrator scenarios against a deterministic device-under-test
//! model. No real time passes and no port is opened: the model turns a
//! trial spec into the result a DUT with known forwarding behavior would
//! produce, so the RFC 2544 / Y.1564 iteration logic can be checked
//! end-to-end and exactly.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use etherbench::error::Result;
use etherbench::latency::LatencyRecorder;
use etherbench::orchestrator::{
    BackToBackParams, FrameLossParams, LatencyParams, Progress, RunContext, SearchSeed,
    ServiceSla, TestKind, ThroughputParams, Y1564Params,
};
use etherbench::trial::{
    CancelToken, StreamSpec, TrialExecutor, TrialMode, TrialResult, TrialSpec,
};
use etherbench::TestOutcome;

/// Deterministic DUT model behind a mock trial executor.
struct DutModel {
    line_rate_bps: u64,
    /// The DUT forwards at most this percent of line rate; offered load
    /// beyond it is dropped proportionally.
    forward_pct: f64,
    /// Burst-mode buffer depth in frames.
    buffer_frames: u64,
    /// Base one-way delay.
    base_latency_ns: u64,
    /// Extra delay applied when offered load reaches this percent of
    /// line rate: (threshold_pct, extra_ns).
    delay_above: Option<(f64, u64)>,
    trials_run: u32,
}

impl DutModel {
    fn lossless(line_rate_bps: u64) -> Self {
        DutModel {
            line_rate_bps,
            forward_pct: 100.0,
            buffer_frames: u64::MAX,
            base_latency_ns: 50_000,
            delay_above: None,
            trials_run: 0,
        }
    }

    fn synth_latency(&self, spec: &TrialSpec, samples: u64) -> etherbench::LatencyStats {
        let mut recorder = LatencyRecorder::new();
        let offered = spec.offered.as_pct();
        let mut extra = (offered * 1_000.0) as u64; // queueing grows with load
        if let Some((threshold, bump)) = self.delay_above {
            if offered >= threshold {
                extra += bump;
            }
        }
        for i in 0..samples {
            // A spread around the base keeps percentiles distinct.
            recorder.add(self.base_latency_ns + extra + (i % 100) * 200);
        }
        recorder.snapshot()
    }
}

impl TrialExecutor for DutModel {
    fn run_trial(&mut self, spec: &TrialSpec) -> Result<TrialResult> {
        self.trials_run += 1;

        let (frames_tx, frames_rx) = match spec.mode {
            TrialMode::Burst { frames } => (frames, frames.min(self.buffer_frames)),
            TrialMode::Paced => {
                let pps = spec.offered.pps(self.line_rate_bps, spec.frame_size);
                let tx = (pps * spec.duration.as_secs_f64()).round() as u64;
                let offered_pct = spec.offered.as_pct();
                let rx = if offered_pct <= self.forward_pct {
                    tx
                } else {
                    (tx as f64 * self.forward_pct / offered_pct).round() as u64
                };
                (tx, rx)
            }
        };

        let samples = if spec.measure_latency && frames_rx > 0 {
            spec.latency_sample_cap.unwrap_or(1000).min(frames_rx)
        } else {
            0
        };
        let latency = self.synth_latency(spec, samples);

        let loss_pct = if frames_tx == 0 {
            0.0
        } else {
            100.0 * (frames_tx - frames_rx) as f64 / frames_tx as f64
        };

        // Per-stream split mirrors the aggregate proportionally.
        let per_stream = spec
            .streams
            .iter()
            .map(|s: &StreamSpec| {
                let share = s.weight / spec.streams.iter().map(|x| x.weight).sum::<f64>();
                let tx = (frames_tx as f64 * share).round() as u64;
                let rx = (frames_rx as f64 * share).round() as u64;
                etherbench::trial::StreamTrialResult {
                    stream_id: s.stream_id,
                    frames_tx: tx,
                    frames_rx: rx,
                    loss_pct: if tx == 0 {
                        0.0
                    } else {
                        100.0 * (tx.saturating_sub(rx)) as f64 / tx as f64
                    },
                    latency,
                }
            })
            .collect();

        Ok(TrialResult {
            frame_size: spec.frame_size,
            offered: spec.offered,
            achieved_rate_bps: spec.offered.bps(self.line_rate_bps),
            frames_tx,
            frames_rx,
            loss_pct,
            latency,
            per_stream,
            duration: spec.duration,
            cancelled: false,
            timeline: Vec::new(),
        })
    }

    fn line_rate_bps(&self) -> u64 {
        self.line_rate_bps
    }
}

fn ctx(frame_sizes: Vec<usize>) -> RunContext {
    let mut ctx = RunContext::new(CancelToken::new(), frame_sizes);
    ctx.trial_duration = Duration::from_secs(1);
    ctx.warmup = Duration::ZERO;
    ctx.drain = Duration::ZERO;
    ctx
}

/// E1: lossless DUT at 1 Gb/s, 64-byte frames, resolution 1 %: the
/// search converges at (about) full rate in few trials with latency
/// stats populated.
#[test]
fn throughput_lossless_converges_at_full_rate() {
    let mut dut = DutModel::lossless(1_000_000_000);
    let mut ctx = ctx(vec![64]);
    let progress: Arc<Mutex<Vec<Progress>>> = Arc::default();
    {
        let progress = Arc::clone(&progress);
        ctx.set_progress_sink(Box::new(move |p| progress.lock().unwrap().push(p)));
    }

    let kind = TestKind::Throughput(ThroughputParams {
        initial_rate_pct: 100.0,
        resolution_pct: 1.0,
        acceptable_loss_pct: 0.0,
        max_iterations: 20,
        seed: SearchSeed::Maximum,
    });
    let outcome = kind.run(&mut dut, &mut ctx).unwrap();

    let TestOutcome::Throughput(o) = outcome else {
        panic!("wrong outcome kind")
    };
    assert!(!o.cancelled);
    assert_eq!(o.points.len(), 1);
    let p = &o.points[0];
    assert!((p.throughput_pct - 100.0).abs() <= 1.0);
    assert!(p.iterations <= 8, "took {} iterations", p.iterations);
    assert!(p.latency.count > 0, "latency stats not populated");
    assert!(!progress.lock().unwrap().is_empty());
}

/// E2: DUT forwarding 50 % of line rate, resolution 0.1 %: throughput
/// lands in [49.9, 50.1] within 20 trials, with loss at the reported
/// rate inside the acceptable bound.
#[test]
fn throughput_finds_a_50_percent_dut() {
    let mut dut = DutModel {
        forward_pct: 50.0,
        ..DutModel::lossless(1_000_000_000)
    };
    let mut ctx = ctx(vec![1518]);
    let kind = TestKind::Throughput(ThroughputParams {
        initial_rate_pct: 100.0,
        resolution_pct: 0.1,
        acceptable_loss_pct: 0.0,
        max_iterations: 20,
        seed: SearchSeed::Maximum,
    });
    let outcome = kind.run(&mut dut, &mut ctx).unwrap();

    let TestOutcome::Throughput(o) = outcome else {
        panic!("wrong outcome kind")
    };
    let p = &o.points[0];
    assert!(
        (49.9..=50.1).contains(&p.throughput_pct),
        "throughput {} outside [49.9, 50.1]",
        p.throughput_pct
    );
    assert!(p.loss_pct <= 0.0 + 1e-9);
    assert!(p.iterations <= 20);
}

/// A DUT that drops everything: the search reports 0 without ever
/// probing a zero rate.
#[test]
fn throughput_with_total_loss_reports_zero() {
    let mut dut = DutModel {
        forward_pct: 0.0,
        ..DutModel::lossless(1_000_000_000)
    };
    let mut ctx = ctx(vec![512]);
    let kind = TestKind::Throughput(ThroughputParams::default());
    let outcome = kind.run(&mut dut, &mut ctx).unwrap();

    let TestOutcome::Throughput(o) = outcome else {
        panic!("wrong outcome kind")
    };
    assert_eq!(o.points[0].throughput_pct, 0.0);
}

/// E3: loss sweep 100 down to 50 by 10 against a 70 %-capable DUT:
/// six points, zero loss at and below 70 %, strictly positive above,
/// monotonically non-decreasing in offered rate.
#[test]
fn frame_loss_sweep_matches_the_dut_knee() {
    let mut dut = DutModel {
        forward_pct: 70.0,
        ..DutModel::lossless(1_000_000_000)
    };
    let mut ctx = ctx(vec![512]);
    let kind = TestKind::FrameLoss(FrameLossParams {
        start_pct: 100.0,
        end_pct: 50.0,
        step_pct: 10.0,
    });
    let outcome = kind.run(&mut dut, &mut ctx).unwrap();

    let TestOutcome::FrameLoss(o) = outcome else {
        panic!("wrong outcome kind")
    };
    let points = &o.sweeps[0].points;
    assert_eq!(points.len(), 6);
    for p in points {
        if p.offered_pct <= 70.0 {
            assert_eq!(p.loss_pct, 0.0, "loss at {}%", p.offered_pct);
        } else {
            assert!(p.loss_pct > 0.0, "no loss at {}%", p.offered_pct);
        }
    }
    // Descending sweep: loss must be non-increasing down the list, i.e.
    // non-decreasing in offered rate.
    for pair in points.windows(2) {
        assert!(pair[0].loss_pct >= pair[1].loss_pct);
    }
}

/// E4: latency at loads {10, 50, 90} on a lossless DUT with 1000
/// samples each: three points, exact counts, p99 monotone in load.
#[test]
fn latency_sweep_counts_and_orders_loads() {
    let mut dut = DutModel::lossless(1_000_000_000);
    let mut ctx = ctx(vec![512]);
    let kind = TestKind::Latency(LatencyParams {
        load_levels: vec![10.0, 50.0, 90.0],
        samples: 1000,
    });
    let outcome = kind.run(&mut dut, &mut ctx).unwrap();

    let TestOutcome::Latency(o) = outcome else {
        panic!("wrong outcome kind")
    };
    assert_eq!(o.points.len(), 3);
    for p in &o.points {
        assert_eq!(p.stats.count, 1000, "count at load {}", p.load_pct);
        assert!(p.stats.min_ns <= p.stats.p50_ns);
        assert!(p.stats.p50_ns <= p.stats.p95_ns);
        assert!(p.stats.p95_ns <= p.stats.p99_ns);
        assert!(p.stats.p99_ns <= p.stats.max_ns);
    }
    let p99_low = o.points[0].stats.p99_ns;
    let p99_high = o.points[2].stats.p99_ns;
    assert!(p99_high >= p99_low);
}

/// E5: back-to-back against a 4095-frame buffer: doubling from 1000
/// then bisection lands exactly on the buffer depth, and the reported
/// burst loses nothing.
#[test]
fn back_to_back_finds_the_buffer_depth() {
    let mut dut = DutModel {
        buffer_frames: 4095,
        ..DutModel::lossless(1_000_000_000)
    };
    let mut ctx = ctx(vec![64]);
    let kind = TestKind::BackToBack(BackToBackParams {
        initial_burst: 1000,
        trials: 10,
        ..BackToBackParams::default()
    });
    let outcome = kind.run(&mut dut, &mut ctx).unwrap();

    let TestOutcome::BackToBack(o) = outcome else {
        panic!("wrong outcome kind")
    };
    let p = &o.points[0];
    assert!(
        (4093..=4095).contains(&p.max_burst_frames),
        "max burst {}",
        p.max_burst_frames
    );
    assert_eq!(p.repetitions, 10);
}

/// E6: a Y.1564 service with CIR 100 Mb/s and FD 10 ms against a DUT
/// that adds 12 ms at the full-CIR step: steps 1-3 pass, step 4 fails
/// on frame delay, the service fails overall.
#[test]
fn y1564_flags_the_delay_breach_at_full_cir() {
    let mut dut = DutModel {
        base_latency_ns: 1_000_000, // 1 ms
        // 100 Mb/s CIR on a 1 Gb/s line: the 100 % step offers 10 % of
        // line rate, where the DUT adds 12 ms.
        delay_above: Some((9.9, 12_000_000)),
        ..DutModel::lossless(1_000_000_000)
    };
    let mut ctx = ctx(vec![512]);
    let kind = TestKind::Y1564(Y1564Params {
        services: vec![ServiceSla {
            name: "data".into(),
            enabled: true,
            cir_mbps: 100.0,
            eir_mbps: 0.0,
            cbs_bytes: 0,
            ebs_bytes: 0,
            fd_ms: 10.0,
            fdv_ms: 5.0,
            flr_pct: 0.01,
            dscp: 0,
            frame_size: None,
        }],
        config_steps: vec![25.0, 50.0, 75.0, 100.0],
        step_duration: Duration::from_secs(1),
        performance_test: false,
        performance_duration: Duration::from_secs(1),
    });
    let outcome = kind.run(&mut dut, &mut ctx).unwrap();

    let TestOutcome::Y1564(o) = outcome else {
        panic!("wrong outcome kind")
    };
    assert_eq!(o.services.len(), 1);
    let svc = &o.services[0];
    assert_eq!(svc.steps.len(), 4);
    for step in &svc.steps[..3] {
        assert!(step.step_pass, "step {}% failed", step.step_pct_of_cir);
    }
    let last = &svc.steps[3];
    assert!(!last.fd_pass, "fd {} ms passed the 10 ms SLA", last.fd_ms);
    assert!(last.flr_pass);
    assert!(!last.step_pass);
    assert!(!svc.service_pass);
    assert!(!o.all_pass);
}

/// Cancellation between trials yields a partial outcome flagged as
/// cancelled, not an error.
#[test]
fn cancellation_reports_partial_results() {
    struct CancellingDut {
        inner: DutModel,
        cancel: CancelToken,
        after: u32,
    }
    impl TrialExecutor for CancellingDut {
        fn run_trial(&mut self, spec: &TrialSpec) -> Result<TrialResult> {
            let result = self.inner.run_trial(spec)?;
            if self.inner.trials_run >= self.after {
                self.cancel.cancel();
            }
            Ok(result)
        }
        fn line_rate_bps(&self) -> u64 {
            self.inner.line_rate_bps()
        }
    }

    let cancel = CancelToken::new();
    let mut dut = CancellingDut {
        inner: DutModel::lossless(1_000_000_000),
        cancel: cancel.clone(),
        after: 2,
    };
    let mut ctx = RunContext::new(cancel, vec![512]);
    ctx.trial_duration = Duration::from_secs(1);
    ctx.warmup = Duration::ZERO;
    ctx.drain = Duration::ZERO;

    let kind = TestKind::FrameLoss(FrameLossParams {
        start_pct: 100.0,
        end_pct: 10.0,
        step_pct: 10.0,
    });
    let outcome = kind.run(&mut dut, &mut ctx).unwrap();

    let TestOutcome::FrameLoss(o) = outcome else {
        panic!("wrong outcome kind")
    };
    assert!(o.cancelled);
    let measured: usize = o.sweeps.iter().map(|s| s.points.len()).sum();
    assert_eq!(measured, 2, "expected exactly the pre-cancel trials");
}

/// The midpoint seed starts bisection below the maximum instead of
/// probing it.
#[test]
fn midpoint_seed_probes_half_rate_first() {
    struct Recording {
        inner: DutModel,
        offered: Arc<Mutex<Vec<f64>>>,
    }
    impl TrialExecutor for Recording {
        fn run_trial(&mut self, spec: &TrialSpec) -> Result<TrialResult> {
            self.offered.lock().unwrap().push(spec.offered.as_pct());
            self.inner.run_trial(spec)
        }
        fn line_rate_bps(&self) -> u64 {
            self.inner.line_rate_bps()
        }
    }

    let offered: Arc<Mutex<Vec<f64>>> = Arc::default();
    let mut dut = Recording {
        inner: DutModel::lossless(1_000_000_000),
        offered: Arc::clone(&offered),
    };
    let mut ctx = ctx(vec![512]);
    let kind = TestKind::Throughput(ThroughputParams {
        seed: SearchSeed::Midpoint,
        ..ThroughputParams::default()
    });
    kind.run(&mut dut, &mut ctx).unwrap();

    let probes = offered.lock().unwrap();
    assert!(!probes.is_empty());
    assert!((probes[0] - 50.0).abs() < 0.01, "first probe {}", probes[0]);
}
