//! # Engine Control Surface
//!
//! The ports external consumers (CLI, TUI, web API) drive the engine
//! through:
//!
//! - `start(config)` validates, claims the NIC, and launches the run on a
//!   dedicated blocking thread. Fails with `BadConfig`, `Busy`,
//!   `NicUnavailable` or `PermissionDenied`.
//! - `cancel` is idempotent; every blocking loop in the run unwinds
//!   within one pacing batch.
//! - `progress` is a finite stream of events, one per completed trial,
//!   ending when the run reaches a terminal state. Events are advisory:
//!   a slow consumer drops events rather than stalling the engine.
//! - `result` blocks until terminal and yields either the `TestOutcome`
//!   (partial and flagged when cancelled) or an `ErrorSummary`.
//!
//! Consumers communicate with the run thread only through these ports;
//! there are no shared references into the engine's internals.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::frame::ALLOWED_FRAME_SIZES;
use crate::orchestrator::{Progress, RunContext, RunState, TestKind};
use crate::port::{self, LinkInfo, PortConfig};
use crate::results::{ErrorSummary, TestOutcome};
use crate::trial::{CancelToken, TrialResult, TrialRunner};

/// Full configuration for one run, as validated at `start`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub interface: String,
    /// 0 = discover from the driver.
    pub line_rate_bps: u64,
    pub test: TestKind,
    pub frame_sizes: Vec<usize>,
    pub trial_duration: Duration,
    pub warmup: Duration,
    pub drain: Duration,
    pub hw_timestamp: bool,
    pub measure_latency: bool,
    pub batch_size: usize,
    pub use_pacing: bool,
    /// JSON run document destination (CLI concern, carried for the run
    /// thread's results manager).
    pub output_file: Option<PathBuf>,
    /// CSV per-trial stream destination.
    pub csv_file: Option<PathBuf>,
}

impl EngineConfig {
    fn port_config(&self) -> PortConfig {
        PortConfig {
            interface: self.interface.clone(),
            line_rate_bps: self.line_rate_bps,
            hw_timestamp: self.hw_timestamp,
        }
    }
}

/// Terminal result of a run.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub outcome: Option<TestOutcome>,
    pub error: Option<ErrorSummary>,
}

impl RunResult {
    pub fn exit_code(&self) -> i32 {
        if let Some(error) = &self.error {
            return error.exit_code;
        }
        match &self.outcome {
            Some(outcome) if outcome.cancelled() => 4,
            Some(_) => 0,
            None => 5,
        }
    }
}

/// Handle to one running test.
#[derive(Debug)]
pub struct RunHandle {
    pub id: Uuid,
    cancel: CancelToken,
    progress: Option<mpsc::Receiver<Progress>>,
    join: tokio::task::JoinHandle<RunResult>,
}

impl RunHandle {
    /// Request cancellation; safe to call any number of times.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Take the progress stream. Lazy and finite: it yields one event per
    /// completed trial and closes when the run terminates.
    pub fn take_progress(&mut self) -> Option<mpsc::Receiver<Progress>> {
        self.progress.take()
    }

    /// Await the terminal result.
    pub async fn result(self) -> RunResult {
        match self.join.await {
            Ok(result) => result,
            Err(e) => RunResult {
                outcome: None,
                error: Some(ErrorSummary {
                    error: format!("run thread panicked: {e}"),
                    exit_code: 5,
                    partial: None,
                }),
            },
        }
    }
}

/// The engine value. Owns nothing but the busy flag: each run carries its
/// own port, trial state, and channels.
#[derive(Default)]
pub struct Engine {
    active: Arc<AtomicBool>,
}

impl Engine {
    pub fn new() -> Self {
        Engine::default()
    }

    /// Probe the interface without starting a run (link facts for result
    /// metadata and UIs).
    pub fn probe_link(config: &EngineConfig) -> Result<LinkInfo> {
        port::open(&config.port_config()).map(|pair| pair.link)
    }

    /// Validate and launch. The NIC port is exclusive: a second `start`
    /// while a run is active fails with `Busy`.
    pub fn start(
        &self,
        config: EngineConfig,
        trial_sink: Option<Box<dyn FnMut(&TrialResult) + Send>>,
    ) -> Result<RunHandle> {
        validate(&config)?;
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(EngineError::Busy);
        }

        let id = Uuid::new_v4();
        let cancel = CancelToken::new();
        let (progress_tx, progress_rx) = mpsc::channel::<Progress>(256);

        let active = Arc::clone(&self.active);
        let run_cancel = cancel.clone();
        let join = tokio::task::spawn_blocking(move || {
            let result = run_blocking(config, run_cancel, progress_tx, trial_sink);
            active.store(false, Ordering::SeqCst);
            result
        });

        info!("run {id} started");
        Ok(RunHandle {
            id,
            cancel,
            progress: Some(progress_rx),
            join,
        })
    }
}

/// The run itself, on its blocking thread.
fn run_blocking(
    config: EngineConfig,
    cancel: CancelToken,
    progress_tx: mpsc::Sender<Progress>,
    trial_sink: Option<Box<dyn FnMut(&TrialResult) + Send>>,
) -> RunResult {
    let mut runner = match TrialRunner::new(config.port_config(), cancel.clone()) {
        Ok(runner) => runner,
        Err(e) => {
            warn!("could not open {}: {e}", config.interface);
            return failure(e);
        }
    };

    let mut ctx = RunContext::new(cancel, config.frame_sizes.clone());
    ctx.trial_duration = config.trial_duration;
    ctx.warmup = config.warmup;
    ctx.drain = config.drain;
    ctx.batch_size = config.batch_size;
    ctx.use_pacing = config.use_pacing;
    ctx.measure_latency = config.measure_latency;

    {
        let tx = progress_tx.clone();
        // Progress is advisory; a full channel drops the event instead of
        // stalling the trial pipeline.
        ctx.set_progress_sink(Box::new(move |event| {
            let _ = tx.try_send(event);
        }));
    }
    if let Some(sink) = trial_sink {
        ctx.set_trial_sink(sink);
    }

    match config.test.run(&mut runner, &mut ctx) {
        Ok(outcome) => {
            let state = if outcome.cancelled() {
                RunState::Cancelled
            } else {
                RunState::Completed
            };
            let _ = progress_tx.try_send(Progress {
                state,
                progress_pct: 100.0,
                message: format!("{} test finished", outcome.kind_name()),
                current_trial: None,
            });
            RunResult {
                outcome: Some(outcome),
                error: None,
            }
        }
        Err(e) => {
            let _ = progress_tx.try_send(Progress {
                state: RunState::Failed,
                progress_pct: 100.0,
                message: e.to_string(),
                current_trial: None,
            });
            failure(e)
        }
    }
}

fn failure(e: EngineError) -> RunResult {
    RunResult {
        outcome: None,
        error: Some(ErrorSummary {
            exit_code: e.exit_code(),
            error: e.to_string(),
            partial: None,
        }),
    }
}

/// The validation rules enforced at `start`.
fn validate(config: &EngineConfig) -> Result<()> {
    if config.interface.is_empty() {
        return Err(EngineError::BadConfig("interface must not be empty".into()));
    }
    if config.frame_sizes.is_empty() {
        return Err(EngineError::BadConfig(
            "at least one frame size is required".into(),
        ));
    }
    for &size in &config.frame_sizes {
        if !ALLOWED_FRAME_SIZES.contains(&size) {
            return Err(EngineError::BadConfig(format!(
                "frame size {size} not in the allowed set {ALLOWED_FRAME_SIZES:?}"
            )));
        }
    }
    if config.trial_duration.is_zero() {
        return Err(EngineError::BadConfig(
            "trial duration must be positive".into(),
        ));
    }
    if config.batch_size == 0 {
        return Err(EngineError::BadConfig("batch size must be positive".into()));
    }

    match &config.test {
        TestKind::Throughput(p) => {
            if !(p.resolution_pct > 0.0 && p.resolution_pct <= 10.0) {
                return Err(EngineError::BadConfig(format!(
                    "resolution must be in (0, 10] percent, got {}",
                    p.resolution_pct
                )));
            }
            if !(p.initial_rate_pct > 0.0 && p.initial_rate_pct <= 100.0) {
                return Err(EngineError::BadConfig(format!(
                    "initial rate must be in (0, 100] percent, got {}",
                    p.initial_rate_pct
                )));
            }
            if p.max_iterations == 0 {
                return Err(EngineError::BadConfig(
                    "max iterations must be positive".into(),
                ));
            }
        }
        TestKind::Latency(p) => {
            if p.load_levels.is_empty() {
                return Err(EngineError::BadConfig(
                    "latency test needs at least one load level".into(),
                ));
            }
            if let Some(&bad) = p
                .load_levels
                .iter()
                .find(|&&l| !(l > 0.0 && l <= 100.0))
            {
                return Err(EngineError::BadConfig(format!(
                    "load levels must be in (0, 100] percent, got {bad}"
                )));
            }
            if p.samples == 0 {
                return Err(EngineError::BadConfig(
                    "latency sample count must be positive".into(),
                ));
            }
        }
        TestKind::FrameLoss(p) => {
            if p.start_pct < p.end_pct {
                return Err(EngineError::BadConfig(format!(
                    "frame-loss start ({}) must be >= end ({})",
                    p.start_pct, p.end_pct
                )));
            }
            if p.step_pct <= 0.0 {
                return Err(EngineError::BadConfig(
                    "frame-loss step must be positive".into(),
                ));
            }
        }
        TestKind::BackToBack(p) => {
            if p.initial_burst == 0 {
                return Err(EngineError::BadConfig(
                    "initial burst must be positive".into(),
                ));
            }
            if p.trials == 0 {
                return Err(EngineError::BadConfig(
                    "burst repetitions must be positive".into(),
                ));
            }
        }
        TestKind::Recovery(p) => {
            if p.overload.is_zero() {
                return Err(EngineError::BadConfig(
                    "overload duration must be positive".into(),
                ));
            }
        }
        TestKind::Reset(p) => {
            if p.watch.is_zero() {
                return Err(EngineError::BadConfig(
                    "reset watch duration must be positive".into(),
                ));
            }
        }
        TestKind::Y1564(p) => {
            let enabled: Vec<_> = p.services.iter().filter(|s| s.enabled).collect();
            if enabled.is_empty() {
                return Err(EngineError::BadConfig(
                    "Y.1564 needs at least one enabled service".into(),
                ));
            }
            if let Some(bad) = enabled.iter().find(|s| s.cir_mbps <= 0.0) {
                return Err(EngineError::BadConfig(format!(
                    "service {:?} has CIR {} Mb/s; every enabled service needs CIR > 0",
                    bad.name, bad.cir_mbps
                )));
            }
            if p.config_steps.is_empty() {
                return Err(EngineError::BadConfig(
                    "Y.1564 needs at least one configuration step".into(),
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{FrameLossParams, ThroughputParams, Y1564Params};

    fn base_config(test: TestKind) -> EngineConfig {
        EngineConfig {
            interface: "loopback".into(),
            line_rate_bps: 0,
            test,
            frame_sizes: vec![512],
            trial_duration: Duration::from_millis(100),
            warmup: Duration::ZERO,
            drain: Duration::from_millis(100),
            hw_timestamp: false,
            measure_latency: true,
            batch_size: 8,
            use_pacing: true,
            output_file: None,
            csv_file: None,
        }
    }

    #[test]
    fn empty_interface_is_rejected() {
        let mut config = base_config(TestKind::Throughput(ThroughputParams::default()));
        config.interface.clear();
        assert!(matches!(
            validate(&config),
            Err(EngineError::BadConfig(_))
        ));
    }

    #[test]
    fn resolution_bounds_are_enforced() {
        for bad in [0.0, -1.0, 10.5] {
            let config = base_config(TestKind::Throughput(ThroughputParams {
                resolution_pct: bad,
                ..ThroughputParams::default()
            }));
            assert!(validate(&config).is_err(), "resolution {bad} accepted");
        }
        let good = base_config(TestKind::Throughput(ThroughputParams {
            resolution_pct: 10.0,
            ..ThroughputParams::default()
        }));
        assert!(validate(&good).is_ok());
    }

    #[test]
    fn frame_loss_ordering_is_enforced() {
        let config = base_config(TestKind::FrameLoss(FrameLossParams {
            start_pct: 50.0,
            end_pct: 100.0,
            step_pct: 10.0,
        }));
        assert!(validate(&config).is_err());
    }

    #[test]
    fn y1564_needs_an_enabled_service_with_cir() {
        let config = base_config(TestKind::Y1564(Y1564Params::default()));
        assert!(validate(&config).is_err());

        let mut params = Y1564Params::default();
        params.services.push(crate::orchestrator::ServiceSla {
            name: "voice".into(),
            enabled: true,
            cir_mbps: 0.0,
            eir_mbps: 0.0,
            cbs_bytes: 0,
            ebs_bytes: 0,
            fd_ms: 10.0,
            fdv_ms: 5.0,
            flr_pct: 0.01,
            dscp: 46,
            frame_size: None,
        });
        let config = base_config(TestKind::Y1564(params));
        assert!(validate(&config).is_err(), "CIR 0 accepted");
    }

    #[test]
    fn disallowed_frame_size_is_rejected() {
        let mut config = base_config(TestKind::Throughput(ThroughputParams::default()));
        config.frame_sizes = vec![100];
        assert!(validate(&config).is_err());
    }
}
