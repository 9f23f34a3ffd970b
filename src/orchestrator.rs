//! # Test Orchestrators
//!
//! One orchestrator per test kind, represented as a tagged variant with a
//! shared `run(executor, ctx)` contract. Orchestrators decide trial
//! parameters, iterate trials through a `TrialExecutor`, and assemble the
//! final `TestOutcome`:
//!
//! - Throughput (RFC 2544 §26.1): binary search on the offered rate.
//! - Latency (§26.2): one trial per configured load level.
//! - Frame loss (§26.3): descending offered-rate sweep.
//! - Back-to-back (§26.4): burst doubling then bisection.
//! - System recovery (§26.5): overload then step-down, watch the receive
//!   rate settle.
//! - Reset (§26.6): constant offered rate, watch for the interruption gap.
//! - Y.1564: per-service configuration steps plus the concurrent
//!   multi-service performance phase.
//!
//! Error policy follows the engine contract: trial-fatal errors
//! (`RateUnderrun`, `Timeout`) are recorded on the affected point and the
//! orchestrator advances; NIC-level errors abort the run; cancellation
//! returns the partial outcome with `cancelled = true`. A progress event
//! is emitted after every trial.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::frame::effective_frame_size;
use crate::rate::OfferedRate;
use crate::results::{
    BackToBackOutcome, BackToBackPoint, FrameLossOutcome, FrameLossPoint, FrameLossSweep,
    LatencyOutcome, LatencyPoint, RecoveryOutcome, RecoveryPoint, ResetOutcome, ResetPoint,
    TestOutcome, ThroughputOutcome, ThroughputPoint, Y1564Outcome, Y1564PerfOutcome,
    Y1564ServiceOutcome, Y1564StepOutcome,
};
use crate::trial::{
    CancelToken, RateStep, StreamSpec, TrialExecutor, TrialMode, TrialResult, TrialSpec,
};

/// Where the throughput binary search probes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchSeed {
    /// Probe `initial_rate_pct` itself; an immediate pass ends the search.
    #[default]
    Maximum,
    /// Start at the midpoint, keeping `initial_rate_pct` as the untested
    /// failing bound.
    Midpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputParams {
    pub initial_rate_pct: f64,
    pub resolution_pct: f64,
    pub acceptable_loss_pct: f64,
    pub max_iterations: u32,
    pub seed: SearchSeed,
}

impl Default for ThroughputParams {
    fn default() -> Self {
        ThroughputParams {
            initial_rate_pct: 100.0,
            resolution_pct: 0.5,
            acceptable_loss_pct: 0.0,
            max_iterations: 20,
            seed: SearchSeed::Maximum,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyParams {
    /// Loads to measure at, percent of line rate.
    pub load_levels: Vec<f64>,
    /// Latency samples to collect per load.
    pub samples: u64,
}

impl Default for LatencyParams {
    fn default() -> Self {
        LatencyParams {
            load_levels: vec![10.0, 50.0, 90.0],
            samples: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameLossParams {
    pub start_pct: f64,
    pub end_pct: f64,
    pub step_pct: f64,
}

impl Default for FrameLossParams {
    fn default() -> Self {
        FrameLossParams {
            start_pct: 100.0,
            end_pct: 10.0,
            step_pct: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackToBackParams {
    pub initial_burst: u64,
    /// Repetitions per burst size; a size passes only if every repetition
    /// is lossless.
    pub trials: u32,
    /// Upper bound on the doubling phase.
    pub max_burst: u64,
}

impl Default for BackToBackParams {
    fn default() -> Self {
        BackToBackParams {
            initial_burst: 1000,
            trials: 10,
            max_burst: 1 << 22,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryParams {
    /// Measured throughput to derive the overload from; `None` runs a
    /// throughput search first.
    pub throughput_pct: Option<f64>,
    #[serde(with = "humantime_secs")]
    pub overload: Duration,
    /// Window after the step-down in which recovery must be observed.
    #[serde(with = "humantime_secs")]
    pub settle: Duration,
}

impl Default for RecoveryParams {
    fn default() -> Self {
        RecoveryParams {
            throughput_pct: None,
            overload: Duration::from_secs(10),
            settle: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetParams {
    /// Offered rate during the reset watch; `None` runs a throughput
    /// search first.
    pub rate_pct: Option<f64>,
    /// How long to keep offering while the DUT is reset externally.
    #[serde(with = "humantime_secs")]
    pub watch: Duration,
    /// Receive gaps shorter than this are not treated as an interruption.
    pub gap_threshold_ms: u64,
}

impl Default for ResetParams {
    fn default() -> Self {
        ResetParams {
            rate_pct: None,
            watch: Duration::from_secs(30),
            gap_threshold_ms: 100,
        }
    }
}

/// SLA for one Y.1564 service, as loaded from the services file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSla {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Committed Information Rate, Mb/s.
    pub cir_mbps: f64,
    /// Excess Information Rate, Mb/s.
    #[serde(default)]
    pub eir_mbps: f64,
    /// Committed Burst Size, bytes.
    #[serde(default)]
    pub cbs_bytes: u64,
    /// Excess Burst Size, bytes.
    #[serde(default)]
    pub ebs_bytes: u64,
    /// Frame Delay ceiling, ms.
    pub fd_ms: f64,
    /// Frame Delay Variation ceiling, ms.
    pub fdv_ms: f64,
    /// Frame Loss Ratio ceiling, percent.
    pub flr_pct: f64,
    #[serde(default)]
    pub dscp: u8,
    /// Per-service frame size; the run's first configured size otherwise.
    #[serde(default)]
    pub frame_size: Option<usize>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Y1564Params {
    pub services: Vec<ServiceSla>,
    /// Configuration-test steps, percent of CIR.
    pub config_steps: Vec<f64>,
    #[serde(with = "humantime_secs")]
    pub step_duration: Duration,
    /// Run the concurrent multi-service performance phase.
    pub performance_test: bool,
    #[serde(with = "humantime_secs")]
    pub performance_duration: Duration,
}

impl Default for Y1564Params {
    fn default() -> Self {
        Y1564Params {
            services: Vec::new(),
            config_steps: vec![25.0, 50.0, 75.0, 100.0],
            step_duration: Duration::from_secs(10),
            performance_test: true,
            performance_duration: Duration::from_secs(30),
        }
    }
}

mod humantime_secs {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Duration, D::Error> {
        let secs: f64 = serde::Deserialize::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

/// The per-kind orchestrators as a tagged variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "test", rename_all = "snake_case")]
pub enum TestKind {
    Throughput(ThroughputParams),
    Latency(LatencyParams),
    FrameLoss(FrameLossParams),
    BackToBack(BackToBackParams),
    Recovery(RecoveryParams),
    Reset(ResetParams),
    Y1564(Y1564Params),
}

impl TestKind {
    pub fn name(&self) -> &'static str {
        match self {
            TestKind::Throughput(_) => "throughput",
            TestKind::Latency(_) => "latency",
            TestKind::FrameLoss(_) => "frame_loss",
            TestKind::BackToBack(_) => "back_to_back",
            TestKind::Recovery(_) => "recovery",
            TestKind::Reset(_) => "reset",
            TestKind::Y1564(_) => "y1564",
        }
    }

    /// Run the test to completion (or cancellation) against the executor.
    pub fn run(&self, executor: &mut dyn TrialExecutor, ctx: &mut RunContext) -> Result<TestOutcome> {
        info!("starting {} test", self.name());
        match self {
            TestKind::Throughput(p) => run_throughput(p, executor, ctx),
            TestKind::Latency(p) => run_latency(p, executor, ctx),
            TestKind::FrameLoss(p) => run_frame_loss(p, executor, ctx),
            TestKind::BackToBack(p) => run_back_to_back(p, executor, ctx),
            TestKind::Recovery(p) => run_recovery(p, executor, ctx),
            TestKind::Reset(p) => run_reset(p, executor, ctx),
            TestKind::Y1564(p) => run_y1564(p, executor, ctx),
        }
    }
}

/// Run state carried in progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Completed,
    Cancelled,
    Failed,
}

/// Condensed view of the trial a progress event describes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialSummary {
    pub frame_size: usize,
    pub offered_pct: f64,
    pub frames_tx: u64,
    pub frames_rx: u64,
    pub loss_pct: f64,
}

impl TrialSummary {
    fn of(trial: &TrialResult) -> Self {
        TrialSummary {
            frame_size: trial.frame_size,
            offered_pct: trial.offered.as_pct(),
            frames_tx: trial.frames_tx,
            frames_rx: trial.frames_rx,
            loss_pct: trial.loss_pct,
        }
    }
}

/// One progress event, emitted after every trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub state: RunState,
    pub progress_pct: f64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub current_trial: Option<TrialSummary>,
}

/// Everything an orchestrator needs besides its own parameters: shared
/// trial settings, the cancel token, and the progress/trial sinks.
pub struct RunContext {
    pub cancel: CancelToken,
    pub frame_sizes: Vec<usize>,
    pub trial_duration: Duration,
    pub warmup: Duration,
    pub drain: Duration,
    pub batch_size: usize,
    pub use_pacing: bool,
    pub measure_latency: bool,
    next_stream_id: u32,
    progress: Option<Box<dyn FnMut(Progress) + Send>>,
    trial_sink: Option<Box<dyn FnMut(&TrialResult) + Send>>,
}

impl RunContext {
    pub fn new(cancel: CancelToken, frame_sizes: Vec<usize>) -> Self {
        RunContext {
            cancel,
            frame_sizes,
            trial_duration: crate::defaults::TRIAL_DURATION,
            warmup: crate::defaults::WARMUP,
            drain: crate::defaults::DRAIN,
            batch_size: crate::defaults::BATCH_SIZE,
            use_pacing: true,
            measure_latency: true,
            next_stream_id: 1,
            progress: None,
            trial_sink: None,
        }
    }

    pub fn set_progress_sink(&mut self, sink: Box<dyn FnMut(Progress) + Send>) {
        self.progress = Some(sink);
    }

    pub fn set_trial_sink(&mut self, sink: Box<dyn FnMut(&TrialResult) + Send>) {
        self.trial_sink = Some(sink);
    }

    /// Stream ids are unique per trial so a previous trial's stragglers
    /// can never land in the current trial's counters.
    fn fresh_stream_id(&mut self) -> u32 {
        let id = self.next_stream_id;
        // Stay clear of the warmup bit.
        self.next_stream_id = (self.next_stream_id + 1) & 0x7fff_ffff;
        id
    }

    fn base_spec(&mut self, frame_size: usize, offered: OfferedRate) -> TrialSpec {
        TrialSpec {
            frame_size,
            offered,
            duration: self.trial_duration,
            warmup: self.warmup,
            drain: self.drain,
            measure_latency: self.measure_latency,
            latency_sample_cap: None,
            batch_size: self.batch_size,
            use_pacing: self.use_pacing,
            streams: vec![StreamSpec::single(self.fresh_stream_id())],
            mode: TrialMode::Paced,
            rate_steps: Vec::new(),
            sample_timeline: false,
        }
    }

    fn emit(&mut self, pct: f64, message: String, trial: Option<&TrialResult>) {
        if let Some(sink) = &mut self.progress {
            sink(Progress {
                state: RunState::Running,
                progress_pct: pct.clamp(0.0, 100.0),
                message,
                current_trial: trial.map(TrialSummary::of),
            });
        }
    }

    fn observe(&mut self, trial: &TrialResult) {
        if let Some(sink) = &mut self.trial_sink {
            sink(trial);
        }
    }
}

/// What became of one attempted trial.
enum Attempt {
    Done(TrialResult),
    /// Trial-fatal failure, test continues.
    Failed(String),
    Cancelled,
}

fn attempt(
    executor: &mut dyn TrialExecutor,
    ctx: &mut RunContext,
    spec: &TrialSpec,
) -> Result<Attempt> {
    if ctx.cancel.is_cancelled() {
        return Ok(Attempt::Cancelled);
    }
    match executor.run_trial(spec) {
        Ok(result) if result.cancelled => Ok(Attempt::Cancelled),
        Ok(result) => {
            ctx.observe(&result);
            Ok(Attempt::Done(result))
        }
        Err(e) if e.is_trial_fatal() => {
            warn!("trial at {} failed: {e}", spec.offered);
            Ok(Attempt::Failed(e.to_string()))
        }
        Err(e) => Err(e),
    }
}

/// Pass criterion for the binary search: loss within the acceptable bound
/// AND the achieved rate within 1 % of the offered rate (a sender that
/// quietly lagged must not report an inflated throughput).
fn search_pass(trial: &TrialResult, acceptable_loss_pct: f64, line_rate_bps: u64) -> bool {
    let offered_bps = trial.offered.bps(line_rate_bps);
    trial.loss_pct <= acceptable_loss_pct
        && (trial.achieved_rate_bps as f64) >= offered_bps as f64 * 0.99
}

/// RFC 2544 §26.1 binary search for one frame size.
///
/// Invariants: `low` is a known-passing rate (0 % passes vacuously and is
/// never probed), `high` is a known- or assumed-failing rate. Terminates
/// when `high - low <= resolution_pct` or the iteration cap is reached,
/// reporting `low`.
struct SearchResult {
    throughput: OfferedRate,
    iterations: u32,
    best_trial: Option<TrialResult>,
    cancelled: bool,
    error: Option<String>,
}

fn binary_search(
    params: &ThroughputParams,
    frame_size: usize,
    executor: &mut dyn TrialExecutor,
    ctx: &mut RunContext,
    progress_base: f64,
    progress_span: f64,
) -> Result<SearchResult> {
    let line_rate = executor.line_rate_bps();
    let mut low = OfferedRate::ZERO;
    let mut high = OfferedRate::from_pct(params.initial_rate_pct);
    let mut best_trial: Option<TrialResult> = None;
    let mut iterations = 0u32;
    let mut last_error = None;

    let mut next = match params.seed {
        SearchSeed::Maximum => high,
        SearchSeed::Midpoint => OfferedRate::midpoint(low, high),
    };

    loop {
        if iterations >= params.max_iterations {
            debug!("search hit the iteration cap at {}", iterations);
            break;
        }
        if next.is_zero() {
            // 0 % transmits nothing and passes vacuously; probing it
            // would loop forever.
            break;
        }

        let spec = ctx.base_spec(frame_size, next);
        iterations += 1;
        let pct = progress_base + progress_span * iterations as f64 / params.max_iterations as f64;
        match attempt(executor, ctx, &spec)? {
            Attempt::Cancelled => {
                return Ok(SearchResult {
                    throughput: low,
                    iterations,
                    best_trial,
                    cancelled: true,
                    error: last_error,
                })
            }
            Attempt::Failed(e) => {
                // Cannot prove the rate sustainable; treat as failing.
                last_error = Some(e);
                high = next;
            }
            Attempt::Done(trial) => {
                let passed = search_pass(&trial, params.acceptable_loss_pct, line_rate);
                ctx.emit(
                    pct,
                    format!(
                        "frame {}: {} at {} ({})",
                        frame_size,
                        if passed { "pass" } else { "fail" },
                        trial.offered,
                        format_loss(trial.loss_pct)
                    ),
                    Some(&trial),
                );
                if passed {
                    low = next;
                    best_trial = Some(trial);
                } else {
                    high = next;
                }
            }
        }

        if OfferedRate::gap_pct(high, low) <= params.resolution_pct {
            break;
        }
        next = OfferedRate::midpoint(low, high);
        if next == low {
            break;
        }
    }

    Ok(SearchResult {
        throughput: low,
        iterations,
        best_trial,
        cancelled: false,
        error: last_error,
    })
}

fn format_loss(loss_pct: f64) -> String {
    format!("{loss_pct:.3}% loss")
}

fn run_throughput(
    params: &ThroughputParams,
    executor: &mut dyn TrialExecutor,
    ctx: &mut RunContext,
) -> Result<TestOutcome> {
    let line_rate = executor.line_rate_bps();
    let sizes = effective_sizes(ctx);
    let mut points = Vec::new();
    let mut cancelled = false;

    for (i, &frame_size) in sizes.iter().enumerate() {
        let base = 100.0 * i as f64 / sizes.len() as f64;
        let span = 100.0 / sizes.len() as f64;
        let search = binary_search(params, frame_size, executor, ctx, base, span)?;

        let throughput_bps = search.throughput.bps(line_rate);
        points.push(ThroughputPoint {
            frame_size,
            throughput_pct: search.throughput.as_pct(),
            throughput_bps,
            iterations: search.iterations,
            latency: search
                .best_trial
                .as_ref()
                .map(|t| t.latency)
                .unwrap_or_default(),
            loss_pct: search.best_trial.as_ref().map(|t| t.loss_pct).unwrap_or(0.0),
            error: search.error.filter(|_| search.best_trial.is_none()),
        });
        info!(
            "frame {}: throughput {} after {} trials",
            frame_size, search.throughput, search.iterations
        );
        if search.cancelled {
            cancelled = true;
            break;
        }
    }

    Ok(TestOutcome::Throughput(ThroughputOutcome {
        points,
        cancelled,
    }))
}

fn run_latency(
    params: &LatencyParams,
    executor: &mut dyn TrialExecutor,
    ctx: &mut RunContext,
) -> Result<TestOutcome> {
    let sizes = effective_sizes(ctx);
    let total = (sizes.len() * params.load_levels.len()).max(1);
    let mut points = Vec::new();
    let mut cancelled = false;
    let mut done = 0usize;

    'outer: for &frame_size in &sizes {
        for &load in &params.load_levels {
            let mut spec = ctx.base_spec(frame_size, OfferedRate::from_pct(load));
            spec.measure_latency = true;
            spec.latency_sample_cap = Some(params.samples);

            done += 1;
            match attempt(executor, ctx, &spec)? {
                Attempt::Cancelled => {
                    cancelled = true;
                    break 'outer;
                }
                Attempt::Failed(e) => points.push(LatencyPoint {
                    frame_size,
                    load_pct: load,
                    stats: Default::default(),
                    error: Some(e),
                }),
                Attempt::Done(trial) => {
                    ctx.emit(
                        100.0 * done as f64 / total as f64,
                        format!(
                            "frame {}: latency at {:.0}% load, {} samples",
                            frame_size, load, trial.latency.count
                        ),
                        Some(&trial),
                    );
                    points.push(LatencyPoint {
                        frame_size,
                        load_pct: load,
                        stats: trial.latency,
                        error: None,
                    });
                }
            }
        }
    }

    Ok(TestOutcome::Latency(LatencyOutcome { points, cancelled }))
}

fn run_frame_loss(
    params: &FrameLossParams,
    executor: &mut dyn TrialExecutor,
    ctx: &mut RunContext,
) -> Result<TestOutcome> {
    let sizes = effective_sizes(ctx);
    // Descending sweep: start_pct, start_pct - step, ... down to end_pct.
    let mut loads = Vec::new();
    let mut pct = params.start_pct;
    while pct >= params.end_pct - 1e-9 {
        loads.push(pct);
        pct -= params.step_pct;
    }

    let total = (sizes.len() * loads.len()).max(1);
    let mut sweeps = Vec::new();
    let mut cancelled = false;
    let mut done = 0usize;

    'outer: for &frame_size in &sizes {
        let mut points = Vec::new();
        for &load in &loads {
            let spec = ctx.base_spec(frame_size, OfferedRate::from_pct(load));
            done += 1;
            match attempt(executor, ctx, &spec)? {
                Attempt::Cancelled => {
                    sweeps.push(FrameLossSweep { frame_size, points });
                    cancelled = true;
                    break 'outer;
                }
                Attempt::Failed(e) => points.push(FrameLossPoint {
                    offered_pct: load,
                    frames_tx: 0,
                    frames_rx: 0,
                    loss_pct: 0.0,
                    error: Some(e),
                }),
                Attempt::Done(trial) => {
                    ctx.emit(
                        100.0 * done as f64 / total as f64,
                        format!(
                            "frame {}: {} offered, {}",
                            frame_size,
                            trial.offered,
                            format_loss(trial.loss_pct)
                        ),
                        Some(&trial),
                    );
                    points.push(FrameLossPoint {
                        offered_pct: load,
                        frames_tx: trial.frames_tx,
                        frames_rx: trial.frames_rx,
                        loss_pct: trial.loss_pct,
                        error: None,
                    });
                }
            }
        }
        sweeps.push(FrameLossSweep { frame_size, points });
    }

    Ok(TestOutcome::FrameLoss(FrameLossOutcome { sweeps, cancelled }))
}

/// Outcome of repeating one burst size `trials` times.
enum BurstVerdict {
    Lossless,
    Lossy,
    Cancelled,
    Failed(String),
}

fn burst_verdict(
    burst: u64,
    repetitions: u32,
    frame_size: usize,
    executor: &mut dyn TrialExecutor,
    ctx: &mut RunContext,
) -> Result<BurstVerdict> {
    for rep in 0..repetitions {
        let mut spec = ctx.base_spec(frame_size, OfferedRate::FULL);
        spec.mode = TrialMode::Burst { frames: burst };
        spec.measure_latency = false;
        spec.warmup = Duration::ZERO;
        match attempt(executor, ctx, &spec)? {
            Attempt::Cancelled => return Ok(BurstVerdict::Cancelled),
            Attempt::Failed(e) => return Ok(BurstVerdict::Failed(e)),
            Attempt::Done(trial) => {
                ctx.emit(
                    -1.0, // burst progress is reported by the caller
                    format!(
                        "frame {}: burst {} rep {}/{}: {}",
                        frame_size,
                        burst,
                        rep + 1,
                        repetitions,
                        format_loss(trial.loss_pct)
                    ),
                    Some(&trial),
                );
                if trial.frames_rx < trial.frames_tx {
                    return Ok(BurstVerdict::Lossy);
                }
            }
        }
    }
    Ok(BurstVerdict::Lossless)
}

fn run_back_to_back(
    params: &BackToBackParams,
    executor: &mut dyn TrialExecutor,
    ctx: &mut RunContext,
) -> Result<TestOutcome> {
    let sizes = effective_sizes(ctx);
    let mut points = Vec::new();
    let mut cancelled = false;

    'outer: for &frame_size in &sizes {
        // Phase 1: double from the initial burst until loss appears.
        let mut low = 0u64; // largest burst known lossless
        let mut high = 0u64; // smallest burst known lossy (0 = unknown)
        let mut probe = params.initial_burst.max(1);
        let mut error = None;

        loop {
            match burst_verdict(probe, params.trials, frame_size, executor, ctx)? {
                BurstVerdict::Cancelled => {
                    cancelled = true;
                    break 'outer;
                }
                BurstVerdict::Failed(e) => {
                    error = Some(e);
                    break;
                }
                BurstVerdict::Lossless => {
                    low = probe;
                    if probe >= params.max_burst {
                        break;
                    }
                    probe = (probe * 2).min(params.max_burst);
                }
                BurstVerdict::Lossy => {
                    high = probe;
                    break;
                }
            }
        }

        // Phase 2: bisect between the bounds.
        if error.is_none() && high > 0 {
            while high - low > 1 {
                let mid = low + (high - low) / 2;
                match burst_verdict(mid, params.trials, frame_size, executor, ctx)? {
                    BurstVerdict::Cancelled => {
                        cancelled = true;
                        break 'outer;
                    }
                    BurstVerdict::Failed(e) => {
                        error = Some(e);
                        break;
                    }
                    BurstVerdict::Lossless => low = mid,
                    BurstVerdict::Lossy => high = mid,
                }
            }
        }

        info!("frame {}: back-to-back burst {}", frame_size, low);
        points.push(BackToBackPoint {
            frame_size,
            max_burst_frames: low,
            repetitions: params.trials,
            error,
        });
    }

    Ok(TestOutcome::BackToBack(BackToBackOutcome {
        points,
        cancelled,
    }))
}

/// Resolve the throughput a recovery/reset test is parameterized on.
fn resolve_throughput_pct(
    given: Option<f64>,
    frame_size: usize,
    executor: &mut dyn TrialExecutor,
    ctx: &mut RunContext,
) -> Result<(f64, bool)> {
    if let Some(pct) = given {
        return Ok((pct, false));
    }
    info!("no throughput given; searching first at frame size {frame_size}");
    let search = binary_search(
        &ThroughputParams::default(),
        frame_size,
        executor,
        ctx,
        0.0,
        30.0,
    )?;
    Ok((search.throughput.as_pct(), search.cancelled))
}

fn run_recovery(
    params: &RecoveryParams,
    executor: &mut dyn TrialExecutor,
    ctx: &mut RunContext,
) -> Result<TestOutcome> {
    let line_rate = executor.line_rate_bps();
    let sizes = effective_sizes(ctx);
    let mut points = Vec::new();
    let mut cancelled = false;

    'outer: for &frame_size in &sizes {
        let (tp_pct, search_cancelled) =
            resolve_throughput_pct(params.throughput_pct, frame_size, executor, ctx)?;
        if search_cancelled {
            cancelled = true;
            break;
        }
        if tp_pct <= 0.0 {
            points.push(RecoveryPoint {
                frame_size,
                throughput_pct: 0.0,
                recovery_time_ms: None,
                error: Some("no passing throughput to overload".into()),
            });
            continue;
        }

        let throughput = OfferedRate::from_pct(tp_pct);
        // Offer 110 % of throughput (line rate caps the overload), then
        // step down to the 50 % reference.
        let overload_rate = throughput.scaled(1.10);
        let reference_rate = throughput.scaled(0.50);

        let mut spec = ctx.base_spec(frame_size, overload_rate);
        spec.duration = params.overload + params.settle;
        spec.measure_latency = false;
        spec.sample_timeline = true;
        spec.rate_steps = vec![RateStep {
            at: params.overload,
            offered: reference_rate,
        }];

        match attempt(executor, ctx, &spec)? {
            Attempt::Cancelled => {
                cancelled = true;
                break 'outer;
            }
            Attempt::Failed(e) => points.push(RecoveryPoint {
                frame_size,
                throughput_pct: tp_pct,
                recovery_time_ms: None,
                error: Some(e),
            }),
            Attempt::Done(trial) => {
                let reference_pps = reference_rate.pps(line_rate, frame_size);
                let step_ms = params.overload.as_millis() as u64;
                let recovery_time_ms =
                    recovery_settle_ms(&trial.timeline, step_ms, reference_pps);
                ctx.emit(
                    100.0 * points.len() as f64 / sizes.len() as f64,
                    format!(
                        "frame {}: recovery {}",
                        frame_size,
                        recovery_time_ms
                            .map(|ms| format!("{ms:.0} ms"))
                            .unwrap_or_else(|| "did not settle".into())
                    ),
                    Some(&trial),
                );
                points.push(RecoveryPoint {
                    frame_size,
                    throughput_pct: tp_pct,
                    recovery_time_ms,
                    error: None,
                });
            }
        }
    }

    Ok(TestOutcome::Recovery(RecoveryOutcome { points, cancelled }))
}

/// Find when the receive rate settles within ±0.5 % of the reference,
/// scanning 100 ms timeline windows after the step.
fn recovery_settle_ms(
    timeline: &[crate::trial::TimelinePoint],
    step_ms: u64,
    reference_pps: f64,
) -> Option<f64> {
    for pair in timeline.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        if prev.at_ms < step_ms || cur.at_ms <= prev.at_ms {
            continue;
        }
        let dt = (cur.at_ms - prev.at_ms) as f64 / 1000.0;
        let rate = (cur.frames_rx.saturating_sub(prev.frames_rx)) as f64 / dt;
        if (rate - reference_pps).abs() <= reference_pps * 0.005 {
            return Some((cur.at_ms - step_ms) as f64);
        }
    }
    None
}

fn run_reset(
    params: &ResetParams,
    executor: &mut dyn TrialExecutor,
    ctx: &mut RunContext,
) -> Result<TestOutcome> {
    let sizes = effective_sizes(ctx);
    let mut points = Vec::new();
    let mut cancelled = false;

    'outer: for &frame_size in &sizes {
        let (rate_pct, search_cancelled) =
            resolve_throughput_pct(params.rate_pct, frame_size, executor, ctx)?;
        if search_cancelled {
            cancelled = true;
            break;
        }

        let mut spec = ctx.base_spec(frame_size, OfferedRate::from_pct(rate_pct.max(1.0)));
        spec.duration = params.watch;
        spec.measure_latency = false;
        spec.sample_timeline = true;

        info!(
            "reset watch running for {:?}; trigger the DUT reset now",
            params.watch
        );
        match attempt(executor, ctx, &spec)? {
            Attempt::Cancelled => {
                cancelled = true;
                break 'outer;
            }
            Attempt::Failed(e) => points.push(ResetPoint {
                frame_size,
                frames_lost: 0,
                interruption_ms: None,
                error: Some(e),
            }),
            Attempt::Done(trial) => {
                let interruption_ms =
                    interruption_gap_ms(&trial.timeline, params.gap_threshold_ms);
                let frames_lost = trial.frames_tx.saturating_sub(trial.frames_rx);
                ctx.emit(
                    100.0 * points.len() as f64 / sizes.len() as f64,
                    format!(
                        "frame {}: {} frames lost, interruption {}",
                        frame_size,
                        frames_lost,
                        interruption_ms
                            .map(|ms| format!("{ms:.0} ms"))
                            .unwrap_or_else(|| "none".into())
                    ),
                    Some(&trial),
                );
                points.push(ResetPoint {
                    frame_size,
                    frames_lost,
                    interruption_ms,
                    error: None,
                });
            }
        }
    }

    Ok(TestOutcome::Reset(ResetOutcome { points, cancelled }))
}

/// Longest receive interruption while transmit kept flowing: time from
/// the last frame received before the gap to the first one after it.
fn interruption_gap_ms(timeline: &[crate::trial::TimelinePoint], threshold_ms: u64) -> Option<f64> {
    let mut gap_start: Option<u64> = None;
    let mut longest: Option<u64> = None;
    for pair in timeline.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        let rx_stalled = cur.frames_rx == prev.frames_rx;
        let tx_flowing = cur.frames_tx > prev.frames_tx;
        if rx_stalled && tx_flowing {
            gap_start.get_or_insert(prev.at_ms);
        } else if let Some(start) = gap_start.take() {
            let gap = cur.at_ms.saturating_sub(start);
            if gap >= threshold_ms && longest.map_or(true, |l| gap > l) {
                longest = Some(gap);
            }
        }
    }
    longest.map(|ms| ms as f64)
}

fn run_y1564(
    params: &Y1564Params,
    executor: &mut dyn TrialExecutor,
    ctx: &mut RunContext,
) -> Result<TestOutcome> {
    let line_rate = executor.line_rate_bps();
    let default_frame_size = effective_sizes(ctx).first().copied().unwrap_or(512);
    let enabled: Vec<(usize, &ServiceSla)> = params
        .services
        .iter()
        .enumerate()
        .filter(|(_, s)| s.enabled)
        .collect();

    let total_steps = (enabled.len() * params.config_steps.len()).max(1);
    let mut done = 0usize;
    let mut services = Vec::new();
    let mut cancelled = false;

    // Configuration test: each service alone, stepping up to its CIR.
    'outer: for (index, sla) in &enabled {
        let stream_id = (*index as u32) + 1;
        let frame_size = effective_frame_size(sla.frame_size.unwrap_or(default_frame_size));
        let cir_bps = (sla.cir_mbps * 1e6) as u64;
        let mut steps = Vec::new();

        for &step_pct in &params.config_steps {
            let offered = OfferedRate::from_bps((cir_bps as f64 * step_pct / 100.0) as u64, line_rate);
            let mut spec = ctx.base_spec(frame_size, offered);
            spec.duration = params.step_duration;
            spec.measure_latency = true;
            spec.streams = vec![StreamSpec {
                stream_id,
                dscp: sla.dscp,
                weight: 1.0,
            }];

            done += 1;
            match attempt(executor, ctx, &spec)? {
                Attempt::Cancelled => {
                    services.push(service_outcome(sla, stream_id, steps, None));
                    cancelled = true;
                    break 'outer;
                }
                Attempt::Failed(e) => steps.push(Y1564StepOutcome {
                    step_pct_of_cir: step_pct,
                    offered_pct_of_line: offered.as_pct(),
                    flr_pct: 0.0,
                    fd_ms: 0.0,
                    fdv_ms: 0.0,
                    flr_pass: false,
                    fd_pass: false,
                    fdv_pass: false,
                    step_pass: false,
                    error: Some(e),
                }),
                Attempt::Done(trial) => {
                    let step = sla_check(sla, step_pct, offered, &trial);
                    ctx.emit(
                        90.0 * done as f64 / total_steps as f64,
                        format!(
                            "service {:?}: step {:.0}% CIR {}",
                            sla.name,
                            step_pct,
                            if step.step_pass { "pass" } else { "FAIL" }
                        ),
                        Some(&trial),
                    );
                    steps.push(step);
                }
            }
        }
        services.push(service_outcome(sla, stream_id, steps, None));
    }

    // Performance test: all services together at 100 % CIR.
    if params.performance_test && !cancelled && !enabled.is_empty() {
        let aggregate_bps: f64 = enabled.iter().map(|(_, s)| s.cir_mbps * 1e6).sum();
        let offered = OfferedRate::from_bps(aggregate_bps as u64, line_rate);
        let frame_size = effective_frame_size(
            enabled[0].1.frame_size.unwrap_or(default_frame_size),
        );

        let mut spec = ctx.base_spec(frame_size, offered);
        spec.duration = params.performance_duration;
        spec.measure_latency = true;
        spec.streams = enabled
            .iter()
            .map(|(index, sla)| StreamSpec {
                stream_id: (*index as u32) + 1,
                dscp: sla.dscp,
                weight: sla.cir_mbps,
            })
            .collect();

        match attempt(executor, ctx, &spec)? {
            Attempt::Cancelled => cancelled = true,
            Attempt::Failed(e) => {
                warn!("performance phase failed: {e}");
                for svc in &mut services {
                    svc.service_pass = false;
                }
            }
            Attempt::Done(trial) => {
                ctx.emit(100.0, "performance phase complete".into(), Some(&trial));
                for (slot, (index, sla)) in enabled.iter().enumerate() {
                    let stream_id = (*index as u32) + 1;
                    let per = trial.per_stream.get(slot);
                    let (flr, fd, fdv) = per
                        .map(|p| (p.loss_pct, p.latency.mean_ms(), p.latency.jitter_ms()))
                        .unwrap_or((100.0, f64::MAX, f64::MAX));
                    let pass = flr <= sla.flr_pct && fd <= sla.fd_ms && fdv <= sla.fdv_ms;
                    if let Some(svc) = services.iter_mut().find(|s| s.stream_id == stream_id) {
                        svc.performance = Some(Y1564PerfOutcome {
                            flr_pct: flr,
                            fd_ms: fd,
                            fdv_ms: fdv,
                            pass,
                        });
                        svc.service_pass = svc.config_pass && pass;
                    }
                }
            }
        }
    }

    let all_pass = !services.is_empty() && services.iter().all(|s| s.service_pass);
    Ok(TestOutcome::Y1564(Y1564Outcome {
        services,
        all_pass,
        cancelled,
    }))
}

fn sla_check(
    sla: &ServiceSla,
    step_pct: f64,
    offered: OfferedRate,
    trial: &TrialResult,
) -> Y1564StepOutcome {
    let flr_pct = trial.loss_pct;
    let fd_ms = trial.latency.mean_ms();
    let fdv_ms = trial.latency.jitter_ms();
    let flr_pass = flr_pct <= sla.flr_pct;
    let fd_pass = fd_ms <= sla.fd_ms;
    let fdv_pass = fdv_ms <= sla.fdv_ms;
    Y1564StepOutcome {
        step_pct_of_cir: step_pct,
        offered_pct_of_line: offered.as_pct(),
        flr_pct,
        fd_ms,
        fdv_ms,
        flr_pass,
        fd_pass,
        fdv_pass,
        step_pass: flr_pass && fd_pass && fdv_pass,
        error: None,
    }
}

fn service_outcome(
    sla: &ServiceSla,
    stream_id: u32,
    steps: Vec<Y1564StepOutcome>,
    performance: Option<Y1564PerfOutcome>,
) -> Y1564ServiceOutcome {
    let config_pass = !steps.is_empty() && steps.iter().all(|s| s.step_pass);
    let service_pass = config_pass && performance.as_ref().map_or(true, |p| p.pass);
    Y1564ServiceOutcome {
        name: sla.name.clone(),
        stream_id,
        steps,
        config_pass,
        performance,
        service_pass,
    }
}

/// The frame sizes this run iterates, with sub-minimum entries raised.
fn effective_sizes(ctx: &RunContext) -> Vec<usize> {
    ctx.frame_sizes
        .iter()
        .map(|&size| {
            let effective = effective_frame_size(size);
            if effective != size {
                warn!(
                    "frame size {} cannot carry the probe payload; using {}",
                    size, effective
                );
            }
            effective
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_loads_are_inclusive_and_descending() {
        let params = FrameLossParams {
            start_pct: 100.0,
            end_pct: 50.0,
            step_pct: 10.0,
        };
        let mut loads = Vec::new();
        let mut pct = params.start_pct;
        while pct >= params.end_pct - 1e-9 {
            loads.push(pct);
            pct -= params.step_pct;
        }
        assert_eq!(loads, vec![100.0, 90.0, 80.0, 70.0, 60.0, 50.0]);
    }

    #[test]
    fn recovery_settle_finds_the_first_good_window() {
        let reference = 100.0; // pps
        let timeline = vec![
            crate::trial::TimelinePoint { at_ms: 0, frames_tx: 0, frames_rx: 0 },
            // Overload until 1000 ms: rx pinned at ~50 pps.
            crate::trial::TimelinePoint { at_ms: 500, frames_tx: 100, frames_rx: 25 },
            crate::trial::TimelinePoint { at_ms: 1000, frames_tx: 200, frames_rx: 50 },
            // After the step: still recovering.
            crate::trial::TimelinePoint { at_ms: 1100, frames_tx: 210, frames_rx: 55 },
            // Settled at 100 pps.
            crate::trial::TimelinePoint { at_ms: 1200, frames_tx: 220, frames_rx: 65 },
            crate::trial::TimelinePoint { at_ms: 1300, frames_tx: 230, frames_rx: 75 },
        ];
        let settle = recovery_settle_ms(&timeline, 1000, reference).unwrap();
        assert_eq!(settle, 200.0);
    }

    #[test]
    fn interruption_gap_requires_tx_flowing() {
        let mk = |at_ms, tx, rx| crate::trial::TimelinePoint {
            at_ms,
            frames_tx: tx,
            frames_rx: rx,
        };
        // rx stalls from 200..700 while tx keeps going.
        let timeline = vec![
            mk(0, 0, 0),
            mk(100, 10, 9),
            mk(200, 20, 19),
            mk(300, 30, 19),
            mk(400, 40, 19),
            mk(500, 50, 19),
            mk(600, 60, 19),
            mk(700, 70, 25),
            mk(800, 80, 35),
        ];
        let gap = interruption_gap_ms(&timeline, 100).unwrap();
        assert_eq!(gap, 500.0);

        // No interruption when rx keeps pace.
        let smooth: Vec<_> = (0..8).map(|i| mk(i * 100, i * 10, i * 10)).collect();
        assert!(interruption_gap_ms(&smooth, 100).is_none());
    }
}
