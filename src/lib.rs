//! # EtherBench
//!
//! An RFC 2544 / ITU-T Y.1564 Ethernet benchmark engine implemented in Rust.
//! The library contains the test-execution engine: signed-probe frame
//! generation and capture, token-bucket rate control, nanosecond
//! timestamping, latency aggregation, and the per-test orchestration
//! (throughput binary search, latency/loss sweeps, back-to-back bursts,
//! recovery, reset, and Y.1564 service activation). The CLI in `main.rs`
//! is one thin consumer of the engine's control, progress, and result
//! ports; TUI or web front ends attach through the same surface.

pub mod cli;
pub mod clock;
pub mod engine;
pub mod error;
pub mod frame;
pub mod latency;
pub mod orchestrator;
pub mod port;
pub mod rate;
pub mod results;
pub mod trial;

pub use engine::{Engine, EngineConfig, RunHandle, RunResult};
pub use error::{EngineError, Result};
pub use latency::{LatencySample, LatencyStats};
pub use orchestrator::{Progress, RunContext, RunState, TestKind};
pub use rate::OfferedRate;
pub use results::{ResultsManager, TestOutcome};
pub use trial::{CancelToken, TrialResult, TrialRunner, TrialSpec};

/// The current version of the benchmark engine.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default measurement window per trial.
    pub const TRIAL_DURATION: Duration = Duration::from_secs(10);

    /// Default warmup window excluded from statistics.
    pub const WARMUP: Duration = Duration::from_secs(2);

    /// Default drain window catching in-flight frames after send stop.
    pub const DRAIN: Duration = Duration::from_secs(2);

    /// Default frames submitted per `send_batch`.
    pub const BATCH_SIZE: usize = 32;

    /// Default latency samples collected per latency-test load level.
    pub const LATENCY_SAMPLES: u64 = 1000;

    /// Default output file name.
    pub const OUTPUT_FILE: &str = "etherbench_results.json";
}
