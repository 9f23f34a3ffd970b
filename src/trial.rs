//! # Trial Runner
//!
//! One trial is a fixed-duration experiment at a single (frame size,
//! offered rate) point. The runner owns the whole lifecycle: open the
//! port, build templates, spawn the sender and receiver threads, observe
//! warmup, run the measurement window, wait out the drain window for
//! in-flight frames, and compose a `TrialResult`.
//!
//! ## Execution contexts
//!
//! Three contexts per trial: the sender and receiver run on dedicated OS
//! threads (pinned to separate cores when the machine has them to spare),
//! the control loop runs on the caller's thread. Communication is limited
//! to atomic counters, a phase word and a lock-free ring of latency
//! samples; no lock is held across a syscall or batch boundary.
//!
//! ## Phases
//!
//! `Warmup -> Measure -> Drain -> Done`. Warmup traffic runs in a disjoint
//! stream-id space (`WARMUP_STREAM_BIT`) so nothing it leaves in flight
//! can pollute measurement counters. The sender drives the first two
//! transitions on its own clock; the control loop ends the drain window
//! and handles cancellation and the hard ceiling
//! (`duration + warmup + drain + 5 s`).
//!
//! ## Admissibility
//!
//! A paced trial must emit at least 99 % of `pps * duration` frames,
//! otherwise the sender (not the DUT) was the bottleneck and the trial
//! fails with `RateUnderrun` so orchestrators never mistake underrun for
//! loss.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::clock::monotonic_ns;
use crate::error::{EngineError, Result};
use crate::frame::{self, FrameTemplate, TemplateSpec, WARMUP_STREAM_BIT};
use crate::latency::{LatencyRecorder, LatencySample, LatencyStats};
use crate::port::{self, PortConfig, PortPair, RecvBatch, RxQueue, TxQueue};
use crate::rate::{OfferedRate, RateController, WIRE_OVERHEAD_BYTES};

/// Cooperative cancellation token shared by every blocking loop in a run.
///
/// Setting it unwinds each context within one pacing batch: the sender
/// checks between batches, the receiver after each 1 ms receive deadline,
/// the orchestrator between trials.
#[derive(Clone, Default, Debug)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One probe stream inside a trial. Single-stream tests use exactly one;
/// Y.1564 multi-service trials carry one per service.
#[derive(Debug, Clone)]
pub struct StreamSpec {
    pub stream_id: u32,
    /// DSCP marking for the stream's frames.
    pub dscp: u8,
    /// Relative share of the aggregate offered rate.
    pub weight: f64,
}

impl StreamSpec {
    pub fn single(stream_id: u32) -> Self {
        StreamSpec {
            stream_id,
            dscp: 0,
            weight: 1.0,
        }
    }
}

/// How the sender offers load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialMode {
    /// Rate-controlled stream for the configured duration.
    Paced,
    /// Back-to-back burst of exactly this many frames at full speed.
    Burst { frames: u64 },
}

/// A scheduled mid-trial rate change (system-recovery overload step).
#[derive(Debug, Clone)]
pub struct RateStep {
    /// Offset from measurement start.
    pub at: Duration,
    pub offered: OfferedRate,
}

/// Full description of one trial.
#[derive(Debug, Clone)]
pub struct TrialSpec {
    pub frame_size: usize,
    pub offered: OfferedRate,
    pub duration: Duration,
    pub warmup: Duration,
    pub drain: Duration,
    pub measure_latency: bool,
    /// Stop recording latency samples past this many (spec'd sample
    /// counts for latency tests); counters keep running.
    pub latency_sample_cap: Option<u64>,
    pub batch_size: usize,
    pub use_pacing: bool,
    pub streams: Vec<StreamSpec>,
    pub mode: TrialMode,
    /// Mid-trial rate changes; empty means constant rate.
    pub rate_steps: Vec<RateStep>,
    /// Record a 100 ms frames_tx/frames_rx timeline (recovery and reset
    /// tests read it).
    pub sample_timeline: bool,
}

impl TrialSpec {
    /// A plain single-stream paced trial.
    pub fn paced(frame_size: usize, offered: OfferedRate, duration: Duration) -> Self {
        TrialSpec {
            frame_size,
            offered,
            duration,
            warmup: Duration::ZERO,
            drain: Duration::from_secs(2),
            measure_latency: true,
            latency_sample_cap: None,
            batch_size: crate::defaults::BATCH_SIZE,
            use_pacing: true,
            streams: vec![StreamSpec::single(0)],
            mode: TrialMode::Paced,
            rate_steps: Vec::new(),
            sample_timeline: false,
        }
    }
}

/// One 100 ms timeline sample (cumulative counters, offset from
/// measurement start).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TimelinePoint {
    pub at_ms: u64,
    pub frames_tx: u64,
    pub frames_rx: u64,
}

/// Per-stream slice of a trial result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamTrialResult {
    pub stream_id: u32,
    pub frames_tx: u64,
    pub frames_rx: u64,
    pub loss_pct: f64,
    pub latency: LatencyStats,
}

/// Outcome of one trial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialResult {
    pub frame_size: usize,
    pub offered: OfferedRate,
    pub achieved_rate_bps: u64,
    pub frames_tx: u64,
    pub frames_rx: u64,
    pub loss_pct: f64,
    pub latency: LatencyStats,
    pub per_stream: Vec<StreamTrialResult>,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub timeline: Vec<TimelinePoint>,
}

impl TrialResult {
    /// Loss with the division guarded; `offered_pct = 0` trials transmit
    /// nothing and pass loss checks vacuously.
    fn loss_pct(tx: u64, rx: u64) -> f64 {
        if tx == 0 {
            0.0
        } else {
            100.0 * (tx.saturating_sub(rx)) as f64 / tx as f64
        }
    }
}

mod duration_secs {
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

/// Anything that can execute trials. Orchestrators only see this trait;
/// the integration suite substitutes a deterministic DUT model.
pub trait TrialExecutor: Send {
    fn run_trial(&mut self, spec: &TrialSpec) -> Result<TrialResult>;
    fn line_rate_bps(&self) -> u64;
}

const PHASE_WARMUP: u8 = 0;
const PHASE_MEASURE: u8 = 1;
const PHASE_DRAIN: u8 = 2;
const PHASE_DONE: u8 = 3;

/// State shared between the three per-trial contexts. Counters only; the
/// latency recorders live on the control side and are fed from the ring.
struct TrialShared {
    phase: AtomicU8,
    cancel: CancelToken,
    frames_tx: AtomicU64,
    bytes_tx: AtomicU64,
    frames_rx: AtomicU64,
    per_stream_tx: Vec<AtomicU64>,
    per_stream_rx: Vec<AtomicU64>,
    /// Monotonic instant the measurement window opened.
    measure_start_ns: AtomicU64,
    /// Monotonic instant a scheduled rate step was applied (recovery).
    step_applied_ns: AtomicU64,
    /// Samples with rx before tx, dropped per the skew rule.
    skew_dropped: AtomicU64,
    /// Frames failing the signature check.
    invalid_frames: AtomicU64,
    /// Samples lost to a full ring.
    sample_overflow: AtomicU64,
    samples: ArrayQueue<LatencySample>,
    /// Hardware TX timestamps flowing sender -> receiver.
    tx_timestamps: ArrayQueue<(u32, u64)>,
}

impl TrialShared {
    fn new(cancel: CancelToken, streams: usize) -> Self {
        TrialShared {
            phase: AtomicU8::new(PHASE_WARMUP),
            cancel,
            frames_tx: AtomicU64::new(0),
            bytes_tx: AtomicU64::new(0),
            frames_rx: AtomicU64::new(0),
            per_stream_tx: (0..streams).map(|_| AtomicU64::new(0)).collect(),
            per_stream_rx: (0..streams).map(|_| AtomicU64::new(0)).collect(),
            measure_start_ns: AtomicU64::new(0),
            step_applied_ns: AtomicU64::new(0),
            skew_dropped: AtomicU64::new(0),
            invalid_frames: AtomicU64::new(0),
            sample_overflow: AtomicU64::new(0),
            samples: ArrayQueue::new(65_536),
            tx_timestamps: ArrayQueue::new(65_536),
        }
    }

    fn phase(&self) -> u8 {
        self.phase.load(Ordering::Acquire)
    }

    fn set_phase(&self, phase: u8) {
        self.phase.store(phase, Ordering::Release);
    }
}

/// Executes trials against a real (or loopback) port.
pub struct TrialRunner {
    port_config: PortConfig,
    cancel: CancelToken,
    link: port::LinkInfo,
}

impl TrialRunner {
    /// Open the port once to discover link facts, then release it; each
    /// trial re-opens its own exclusive pair.
    pub fn new(port_config: PortConfig, cancel: CancelToken) -> Result<Self> {
        let probe = port::open(&port_config)?;
        let link = probe.link;
        drop(probe);
        debug!(
            "trial runner ready on {}: line rate {} bps, {} timestamps",
            port_config.interface, link.line_rate_bps, link.mode
        );
        Ok(TrialRunner {
            port_config,
            cancel,
            link,
        })
    }

    pub fn link(&self) -> &port::LinkInfo {
        &self.link
    }

    fn execute(&mut self, spec: &TrialSpec) -> Result<TrialResult> {
        if spec.streams.is_empty() {
            return Err(EngineError::Internal("trial with no streams".into()));
        }
        if self.cancel.is_cancelled() {
            return Ok(cancelled_result(spec));
        }

        let pair = port::open(&self.port_config)?;
        let line_rate_bps = pair.link.line_rate_bps;
        let pps = spec.offered.pps(line_rate_bps, spec.frame_size);

        let shared = Arc::new(TrialShared::new(self.cancel.clone(), spec.streams.len()));
        let hardware = pair.link.mode == crate::clock::TimestampMode::Hardware;

        let PortPair { tx, rx, .. } = pair;
        let sender = spawn_pinned("eb-sender", sender_core(), {
            let shared = Arc::clone(&shared);
            let spec = spec.clone();
            move || sender_loop(tx, &shared, &spec, line_rate_bps, hardware)
        });
        let receiver = spawn_pinned("eb-receiver", receiver_core(), {
            let shared = Arc::clone(&shared);
            let spec = spec.clone();
            move || receiver_loop(rx, &shared, &spec, hardware)
        });

        let mut aggregation = TrialAggregation::new(spec);
        let controlled = self.control_loop(&shared, spec, &mut aggregation);

        let sender_res = sender.join();
        let receiver_res = receiver.join();
        let cancelled = match controlled {
            Ok(cancelled) => cancelled,
            Err(e) => {
                // Threads were told to stop before the error surfaced.
                propagate_join(sender_res)?;
                propagate_join(receiver_res)?;
                return Err(e);
            }
        };
        propagate_join(sender_res)?;
        propagate_join(receiver_res)?;

        compose_result(&shared, spec, pps, line_rate_bps, cancelled, aggregation)
    }

    /// Control loop: drains the sample ring into the recorders, samples
    /// the timeline, ends the drain window, enforces cancellation and the
    /// hard ceiling. Returns whether the trial was cancelled.
    fn control_loop(
        &self,
        shared: &TrialShared,
        spec: &TrialSpec,
        aggregation: &mut TrialAggregation,
    ) -> Result<bool> {
        let started_ns = monotonic_ns();
        let ceiling = spec.duration + spec.warmup + spec.drain + Duration::from_secs(5);
        let ceiling_ns = started_ns + ceiling.as_nanos() as u64;

        let mut drain_started_ns = None;
        let mut last_timeline_ns = 0u64;

        loop {
            thread::sleep(Duration::from_millis(5));
            let now = monotonic_ns();

            aggregation.drain(shared, spec);

            if shared.cancel.is_cancelled() {
                shared.set_phase(PHASE_DONE);
                return Ok(true);
            }
            if now > ceiling_ns {
                shared.set_phase(PHASE_DONE);
                return Err(EngineError::Timeout(ceiling));
            }

            if spec.sample_timeline {
                let measure_start = shared.measure_start_ns.load(Ordering::Acquire);
                if measure_start != 0 && now.saturating_sub(last_timeline_ns) >= 100_000_000 {
                    last_timeline_ns = now;
                    aggregation.timeline.push(TimelinePoint {
                        at_ms: now.saturating_sub(measure_start) / 1_000_000,
                        frames_tx: shared.frames_tx.load(Ordering::Relaxed),
                        frames_rx: shared.frames_rx.load(Ordering::Relaxed),
                    });
                }
            }

            match shared.phase() {
                PHASE_DRAIN => {
                    let begun = *drain_started_ns.get_or_insert(now);
                    if now.saturating_sub(begun) >= spec.drain.as_nanos() as u64 {
                        shared.set_phase(PHASE_DONE);
                        return Ok(false);
                    }
                }
                PHASE_DONE => return Ok(false),
                _ => {}
            }
        }
    }
}

/// Latency recorders and timeline accumulated by the control loop while
/// the trial runs; the sample ring is bounded, so draining cannot wait
/// for trial end.
struct TrialAggregation {
    recorders: Vec<LatencyRecorder>,
    timeline: Vec<TimelinePoint>,
    recorded: u64,
}

impl TrialAggregation {
    fn new(spec: &TrialSpec) -> Self {
        TrialAggregation {
            recorders: (0..spec.streams.len())
                .map(|_| LatencyRecorder::new())
                .collect(),
            timeline: Vec::new(),
            recorded: 0,
        }
    }

    fn drain(&mut self, shared: &TrialShared, spec: &TrialSpec) {
        let cap = spec.latency_sample_cap.unwrap_or(u64::MAX);
        while let Some(sample) = shared.samples.pop() {
            if self.recorded >= cap {
                continue;
            }
            if let Some(idx) = spec
                .streams
                .iter()
                .position(|s| s.stream_id == sample.stream)
            {
                self.recorders[idx].add(sample.latency_ns());
                self.recorded += 1;
            }
        }
    }
}

impl TrialExecutor for TrialRunner {
    fn run_trial(&mut self, spec: &TrialSpec) -> Result<TrialResult> {
        self.execute(spec)
    }

    fn line_rate_bps(&self) -> u64 {
        self.link.line_rate_bps
    }
}

fn cancelled_result(spec: &TrialSpec) -> TrialResult {
    TrialResult {
        frame_size: spec.frame_size,
        offered: spec.offered,
        achieved_rate_bps: 0,
        frames_tx: 0,
        frames_rx: 0,
        loss_pct: 0.0,
        latency: LatencyStats::default(),
        per_stream: Vec::new(),
        duration: Duration::ZERO,
        cancelled: true,
        timeline: Vec::new(),
    }
}

fn propagate_join(res: thread::Result<Result<()>>) -> Result<()> {
    match res {
        Ok(inner) => inner,
        Err(_) => Err(EngineError::Internal("trial thread panicked".into())),
    }
}

/// Pick a core near the top of the list for the sender; the receiver gets
/// the one below it. On small machines both fall back to unpinned.
fn sender_core() -> Option<core_affinity::CoreId> {
    let ids = core_affinity::get_core_ids()?;
    (ids.len() >= 4).then(|| ids[ids.len() - 2])
}

fn receiver_core() -> Option<core_affinity::CoreId> {
    let ids = core_affinity::get_core_ids()?;
    (ids.len() >= 4).then(|| ids[ids.len() - 1])
}

fn spawn_pinned<F>(
    name: &str,
    core: Option<core_affinity::CoreId>,
    f: F,
) -> thread::JoinHandle<Result<()>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Some(core) = core {
                if !core_affinity::set_for_current(core) {
                    trace!("could not pin thread to core {:?}", core);
                }
            }
            f()
        })
        .expect("spawn trial thread")
}

/// Largest-remainder interleave of stream indices, cycled by the sender.
/// A weight vector of [3, 1] yields a 4-slot pattern with three slots of
/// stream 0 spread around one slot of stream 1.
fn interleave_pattern(streams: &[StreamSpec]) -> Vec<usize> {
    if streams.len() == 1 {
        return vec![0];
    }
    const SLOTS: usize = 1000;
    let total: f64 = streams.iter().map(|s| s.weight.max(0.0)).sum();
    if total <= 0.0 {
        return vec![0];
    }
    let mut counts: Vec<usize> = streams
        .iter()
        .map(|s| ((s.weight.max(0.0) / total) * SLOTS as f64).round() as usize)
        .collect();
    // Spread each stream's slots evenly instead of in runs.
    let mut pattern = Vec::with_capacity(SLOTS);
    let mut credit: Vec<f64> = vec![0.0; streams.len()];
    while pattern.len() < counts.iter().sum::<usize>() {
        for (i, c) in counts.iter().enumerate() {
            credit[i] += *c as f64;
        }
        let Some((best, _)) = credit
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        else {
            break;
        };
        credit[best] -= counts.iter().sum::<usize>() as f64;
        pattern.push(best);
        if pattern.len() >= SLOTS {
            break;
        }
    }
    if pattern.is_empty() {
        counts = vec![1; streams.len()];
        pattern = (0..counts.len()).collect();
    }
    pattern
}

/// Sender loop: warmup, then paced (or burst) transmission of stamped
/// frames. Suspends only in the rate controller and `send_batch`.
fn sender_loop(
    mut tx: Box<dyn TxQueue>,
    shared: &TrialShared,
    spec: &TrialSpec,
    line_rate_bps: u64,
    hardware: bool,
) -> Result<()> {
    let frame_size = spec.frame_size;
    let batch = spec.batch_size.max(1);

    // Templates per stream, plus one warmup template in the disjoint
    // warmup id space.
    let mut templates = Vec::with_capacity(spec.streams.len());
    for stream in &spec.streams {
        let template_spec = TemplateSpec {
            stream_id: stream.stream_id,
            dscp: stream.dscp,
            ..TemplateSpec::default()
        };
        templates.push(FrameTemplate::build(frame_size, &template_spec)?);
    }
    let mut warmup_template = templates[0].clone();
    warmup_template.set_stream_id(spec.streams[0].stream_id | WARMUP_STREAM_BIT);
    warmup_template.set_flags(frame::FLAG_WARMUP);

    // Batch slots are allocated once; single-stream trials fill them from
    // the template up front and only re-stamp afterwards.
    let pattern = interleave_pattern(&spec.streams);
    let single_stream = spec.streams.len() == 1;
    let mut slots: Vec<Vec<u8>> = (0..batch).map(|_| templates[0].bytes().to_vec()).collect();
    let mut slot_streams: Vec<usize> = vec![0; batch];

    let pps = spec.offered.pps(line_rate_bps, frame_size);
    let mut controller = RateController::new(pps, batch, spec.use_pacing);
    let mut seqs: Vec<u32> = vec![0; spec.streams.len()];
    let mut hw_harvest: Vec<(u32, u64)> = Vec::new();

    // Warmup: same rate, warmup stream ids, nothing counted. A zero
    // offered rate has nothing to warm up.
    if spec.warmup > Duration::ZERO
        && matches!(spec.mode, TrialMode::Paced)
        && !spec.offered.is_zero()
    {
        let warmup_end = monotonic_ns() + spec.warmup.as_nanos() as u64;
        let mut warmup_seq = 0u32;
        controller.align();
        while monotonic_ns() < warmup_end {
            if shared.cancel.is_cancelled() || shared.phase() == PHASE_DONE {
                return Ok(());
            }
            controller.wait();
            for slot in slots.iter_mut() {
                slot.copy_from_slice(warmup_template.bytes());
                frame::stamp_buf(slot, warmup_seq, monotonic_ns());
                warmup_seq = warmup_seq.wrapping_add(1);
            }
            send_all(&mut tx, &slots, shared)?;
        }
        // Slots go back to measurement content.
        for slot in slots.iter_mut() {
            slot.copy_from_slice(templates[0].bytes());
        }
    }

    controller.align();
    shared.measure_start_ns.store(monotonic_ns(), Ordering::Release);
    shared.set_phase(PHASE_MEASURE);

    match spec.mode {
        TrialMode::Burst { frames } => {
            let mut sent = 0u64;
            while sent < frames {
                if shared.cancel.is_cancelled() || shared.phase() == PHASE_DONE {
                    break;
                }
                let n = (frames - sent).min(batch as u64) as usize;
                for slot in slots.iter_mut().take(n) {
                    frame::stamp_buf(slot, seqs[0], monotonic_ns());
                    seqs[0] = seqs[0].wrapping_add(1);
                }
                send_all(&mut tx, &slots[..n], shared)?;
                shared.frames_tx.fetch_add(n as u64, Ordering::Relaxed);
                shared
                    .bytes_tx
                    .fetch_add((n * frame_size) as u64, Ordering::Relaxed);
                shared.per_stream_tx[0].fetch_add(n as u64, Ordering::Relaxed);
                sent += n as u64;
            }
        }
        TrialMode::Paced => {
            let measure_start = monotonic_ns();
            let measure_end = measure_start + spec.duration.as_nanos() as u64;
            let mut pattern_pos = 0usize;
            let mut steps = spec.rate_steps.iter().peekable();

            if spec.offered.is_zero() && spec.rate_steps.is_empty() {
                // Zero offered rate transmits nothing; the trial still
                // honors its window so loss checks pass vacuously.
                while monotonic_ns() < measure_end
                    && !shared.cancel.is_cancelled()
                    && shared.phase() != PHASE_DONE
                {
                    thread::sleep(Duration::from_millis(5));
                }
            } else {
                while monotonic_ns() < measure_end {
                    if shared.cancel.is_cancelled() || shared.phase() == PHASE_DONE {
                        break;
                    }

                    if let Some(step) = steps.peek() {
                        let due = measure_start + step.at.as_nanos() as u64;
                        if monotonic_ns() >= due {
                            let new_pps = step.offered.pps(line_rate_bps, frame_size);
                            controller.retarget(new_pps, batch);
                            shared
                                .step_applied_ns
                                .store(monotonic_ns(), Ordering::Release);
                            debug!("rate step applied: {}", step.offered);
                            steps.next();
                        }
                    }

                    controller.wait();
                    for (i, slot) in slots.iter_mut().enumerate() {
                        let stream_idx = if single_stream {
                            0
                        } else {
                            let s = pattern[pattern_pos % pattern.len()];
                            pattern_pos += 1;
                            slot.copy_from_slice(templates[s].bytes());
                            s
                        };
                        slot_streams[i] = stream_idx;
                        frame::stamp_buf(slot, seqs[stream_idx], monotonic_ns());
                        seqs[stream_idx] = seqs[stream_idx].wrapping_add(1);
                    }
                    send_all(&mut tx, &slots, shared)?;
                    shared
                        .frames_tx
                        .fetch_add(slots.len() as u64, Ordering::Relaxed);
                    shared
                        .bytes_tx
                        .fetch_add((slots.len() * frame_size) as u64, Ordering::Relaxed);
                    for &s in &slot_streams {
                        shared.per_stream_tx[s].fetch_add(1, Ordering::Relaxed);
                    }

                    if hardware {
                        hw_harvest.clear();
                        tx.poll_tx_timestamps(&mut hw_harvest)?;
                        for pair in &hw_harvest {
                            let _ = shared.tx_timestamps.push(*pair);
                        }
                    }
                }
            }
        }
    }

    // One final harvest so the last batch's completions are not lost.
    if hardware {
        hw_harvest.clear();
        tx.poll_tx_timestamps(&mut hw_harvest)?;
        for pair in &hw_harvest {
            let _ = shared.tx_timestamps.push(*pair);
        }
    }

    if shared.phase() == PHASE_MEASURE {
        shared.set_phase(PHASE_DRAIN);
    }
    Ok(())
}

/// Submit a full batch, retrying the tail on backpressure within the
/// pacing slot.
fn send_all(tx: &mut Box<dyn TxQueue>, slots: &[Vec<u8>], shared: &TrialShared) -> Result<()> {
    let refs: Vec<&[u8]> = slots.iter().map(|s| s.as_slice()).collect();
    let mut done = 0;
    while done < refs.len() {
        let sent = tx.send_batch(&refs[done..])?;
        done += sent;
        if done < refs.len() {
            if shared.cancel.is_cancelled() || shared.phase() == PHASE_DONE {
                break;
            }
            std::hint::spin_loop();
            thread::yield_now();
        }
    }
    Ok(())
}

/// Receiver loop: validate, demux by stream, count, and feed the latency
/// ring. Suspends only inside `recv_batch` with a 1 ms deadline.
fn receiver_loop(
    mut rx: Box<dyn RxQueue>,
    shared: &TrialShared,
    spec: &TrialSpec,
    hardware: bool,
) -> Result<()> {
    let mut batch = RecvBatch::new(spec.batch_size.max(64));
    let capacity = batch.capacity();

    // Hardware mode: TX timestamps trail the frames they describe, so RX
    // events wait in a bounded pending list until their stamp arrives.
    let mut hw_tx: HashMap<u32, u64> = HashMap::new();
    let mut pending: Vec<(u32, u64, u32)> = Vec::new(); // (seq, rx_ns, stream)

    loop {
        if shared.phase() == PHASE_DONE {
            return Ok(());
        }

        let deadline = monotonic_ns() + 1_000_000;
        let n = rx.recv_batch(&mut batch, capacity, deadline)?;

        if hardware {
            while let Some((seq, tx_ns)) = shared.tx_timestamps.pop() {
                hw_tx.insert(seq, tx_ns);
            }
        }

        for slot in batch.slots.iter().take(n) {
            let data = &slot.buf[..slot.len];
            if !frame::is_valid_response(data) {
                shared.invalid_frames.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            let stream = frame::stream_of(data);
            if stream & WARMUP_STREAM_BIT != 0 {
                continue;
            }
            let Some(idx) = spec.streams.iter().position(|s| s.stream_id == stream) else {
                continue;
            };
            if shared.phase() == PHASE_WARMUP {
                continue;
            }

            shared.frames_rx.fetch_add(1, Ordering::Relaxed);
            shared.per_stream_rx[idx].fetch_add(1, Ordering::Relaxed);

            if !spec.measure_latency || slot.rx_ns == 0 {
                continue;
            }
            let seq = frame::seq_of(data);
            let tx_ns = if hardware {
                match hw_tx.remove(&seq) {
                    Some(ts) => ts,
                    None => {
                        if pending.len() < 16_384 {
                            pending.push((seq, slot.rx_ns, stream));
                        }
                        continue;
                    }
                }
            } else {
                frame::tx_ns_of(data)
            };
            push_sample(shared, seq, slot.rx_ns, tx_ns, stream);
        }

        // Retry pending hardware matches now that more stamps arrived.
        if hardware && !pending.is_empty() {
            pending.retain(|&(seq, rx_ns, stream)| match hw_tx.remove(&seq) {
                Some(tx_ns) => {
                    push_sample(shared, seq, rx_ns, tx_ns, stream);
                    false
                }
                None => true,
            });
            if hw_tx.len() > 65_536 {
                hw_tx.clear();
            }
        }
    }
}

fn push_sample(shared: &TrialShared, seq: u32, rx_ns: u64, tx_ns: u64, stream: u32) {
    if rx_ns < tx_ns {
        // Clock skew: drop, never negate.
        shared.skew_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }
    let sample = LatencySample {
        seq,
        rx_ns,
        tx_ns,
        stream,
    };
    if shared.samples.push(sample).is_err() {
        shared.sample_overflow.fetch_add(1, Ordering::Relaxed);
    }
}

/// Finish draining the ring and compose the final result.
fn compose_result(
    shared: &TrialShared,
    spec: &TrialSpec,
    pps: f64,
    line_rate_bps: u64,
    cancelled: bool,
    mut aggregation: TrialAggregation,
) -> Result<TrialResult> {
    aggregation.drain(shared, spec);
    let recorders = &aggregation.recorders;

    let frames_tx = shared.frames_tx.load(Ordering::Acquire);
    // Stray frames from a previous trial's drain cannot push rx past tx.
    let frames_rx = shared.frames_rx.load(Ordering::Acquire).min(frames_tx);

    let overflow = shared.sample_overflow.load(Ordering::Relaxed);
    if overflow > 0 {
        warn!("latency sample ring overflowed, {overflow} samples dropped");
    }
    let skew = shared.skew_dropped.load(Ordering::Relaxed);
    if skew > 0 {
        warn!("{skew} samples dropped for rx earlier than tx (clock skew)");
    }

    let mut overall = LatencyRecorder::new();
    let mut per_stream = Vec::with_capacity(spec.streams.len());
    for (idx, stream) in spec.streams.iter().enumerate() {
        overall.merge(&recorders[idx]);
        let tx = shared.per_stream_tx[idx].load(Ordering::Acquire);
        let rx = shared.per_stream_rx[idx].load(Ordering::Acquire).min(tx);
        per_stream.push(StreamTrialResult {
            stream_id: stream.stream_id,
            frames_tx: tx,
            frames_rx: rx,
            loss_pct: TrialResult::loss_pct(tx, rx),
            latency: recorders[idx].snapshot(),
        });
    }

    let duration_secs = spec.duration.as_secs_f64();
    let achieved_rate_bps = if duration_secs > 0.0 {
        let bits = frames_tx as f64 * (spec.frame_size as u64 + WIRE_OVERHEAD_BYTES) as f64 * 8.0;
        ((bits / duration_secs) as u64).min(line_rate_bps)
    } else {
        0
    };

    // Admissibility: a paced trial that could not source the offered rate
    // is the sender's failure, not the DUT's.
    if !cancelled && spec.mode == TrialMode::Paced && spec.use_pacing && !spec.offered.is_zero() {
        let required = (pps * duration_secs * 0.99) as u64;
        if frames_tx < required {
            return Err(EngineError::RateUnderrun {
                sent: frames_tx,
                required,
            });
        }
    }

    Ok(TrialResult {
        frame_size: spec.frame_size,
        offered: spec.offered,
        achieved_rate_bps,
        frames_tx,
        frames_rx,
        loss_pct: TrialResult::loss_pct(frames_tx, frames_rx),
        latency: overall.snapshot(),
        per_stream,
        duration: spec.duration,
        cancelled,
        timeline: aggregation.timeline,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interleave_respects_weights() {
        let streams = vec![
            StreamSpec {
                stream_id: 1,
                dscp: 0,
                weight: 3.0,
            },
            StreamSpec {
                stream_id: 2,
                dscp: 0,
                weight: 1.0,
            },
        ];
        let pattern = interleave_pattern(&streams);
        let zeros = pattern.iter().filter(|&&s| s == 0).count();
        let ones = pattern.iter().filter(|&&s| s == 1).count();
        let ratio = zeros as f64 / ones.max(1) as f64;
        assert!((ratio - 3.0).abs() < 0.1, "ratio was {ratio}");
        // Evenly spread: no run of stream 0 longer than 4.
        let mut run = 0;
        for &s in &pattern {
            if s == 0 {
                run += 1;
                assert!(run <= 4);
            } else {
                run = 0;
            }
        }
    }

    #[test]
    fn loss_pct_guards_zero_tx() {
        assert_eq!(TrialResult::loss_pct(0, 0), 0.0);
        assert_eq!(TrialResult::loss_pct(100, 100), 0.0);
        assert_eq!(TrialResult::loss_pct(100, 50), 50.0);
        assert_eq!(TrialResult::loss_pct(100, 0), 100.0);
    }

    #[test]
    fn cancel_token_is_shared() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(!b.is_cancelled());
        a.cancel();
        assert!(b.is_cancelled());
    }
}
