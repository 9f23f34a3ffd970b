//! # Results and Output Management
//!
//! Result structures for every test kind plus the manager that turns them
//! into artifacts: a JSON run document, an optional CSV stream of trial
//! rows written as trials complete, and a human-readable stdout summary.
//!
//! Partial results are first-class: a cancelled or failed run still
//! carries every point measured before the terminal event, and the CSV
//! stream has already recorded each trial by the time anything goes wrong.
//! The engine never silently discards measurements.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::latency::LatencyStats;
use crate::trial::TrialResult;

/// Throughput (RFC 2544 §26.1) result for one frame size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputPoint {
    pub frame_size: usize,
    /// Highest no-loss rate found (the binary search's `low` bound).
    pub throughput_pct: f64,
    pub throughput_bps: u64,
    pub iterations: u32,
    /// Latency observed in the last passing trial.
    pub latency: LatencyStats,
    /// Loss at the reported rate (bounded by the acceptable loss).
    pub loss_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputOutcome {
    pub points: Vec<ThroughputPoint>,
    pub cancelled: bool,
}

/// Latency (§26.2) result for one (frame size, load) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyPoint {
    pub frame_size: usize,
    pub load_pct: f64,
    pub stats: LatencyStats,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyOutcome {
    pub points: Vec<LatencyPoint>,
    pub cancelled: bool,
}

/// One step of a frame-loss (§26.3) sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameLossPoint {
    pub offered_pct: f64,
    pub frames_tx: u64,
    pub frames_rx: u64,
    pub loss_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameLossSweep {
    pub frame_size: usize,
    pub points: Vec<FrameLossPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameLossOutcome {
    pub sweeps: Vec<FrameLossSweep>,
    pub cancelled: bool,
}

/// Back-to-back (§26.4) result for one frame size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackToBackPoint {
    pub frame_size: usize,
    /// Largest burst every repetition carried without loss.
    pub max_burst_frames: u64,
    pub repetitions: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackToBackOutcome {
    pub points: Vec<BackToBackPoint>,
    pub cancelled: bool,
}

/// System-recovery (§26.5) result for one frame size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPoint {
    pub frame_size: usize,
    /// Throughput the overload was derived from, percent of line rate.
    pub throughput_pct: f64,
    /// Time from the rate step until the receive rate settled at the
    /// reference; `None` when it never settled inside the window.
    pub recovery_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryOutcome {
    pub points: Vec<RecoveryPoint>,
    pub cancelled: bool,
}

/// Reset (§26.6) result for one frame size.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetPoint {
    pub frame_size: usize,
    pub frames_lost: u64,
    /// Time from the last frame received before the reset to the first
    /// frame after it; `None` when no interruption was observed.
    pub interruption_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetOutcome {
    pub points: Vec<ResetPoint>,
    pub cancelled: bool,
}

/// One Y.1564 configuration-test step for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Y1564StepOutcome {
    /// Step load as percent of the service CIR.
    pub step_pct_of_cir: f64,
    pub offered_pct_of_line: f64,
    pub flr_pct: f64,
    pub fd_ms: f64,
    pub fdv_ms: f64,
    pub flr_pass: bool,
    pub fd_pass: bool,
    pub fdv_pass: bool,
    pub step_pass: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// The concurrent service-performance phase for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Y1564PerfOutcome {
    pub flr_pct: f64,
    pub fd_ms: f64,
    pub fdv_ms: f64,
    pub pass: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Y1564ServiceOutcome {
    pub name: String,
    pub stream_id: u32,
    pub steps: Vec<Y1564StepOutcome>,
    pub config_pass: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub performance: Option<Y1564PerfOutcome>,
    pub service_pass: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Y1564Outcome {
    pub services: Vec<Y1564ServiceOutcome>,
    pub all_pass: bool,
    pub cancelled: bool,
}

/// Terminal result of one test run, discriminated by test kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TestOutcome {
    Throughput(ThroughputOutcome),
    Latency(LatencyOutcome),
    FrameLoss(FrameLossOutcome),
    BackToBack(BackToBackOutcome),
    Recovery(RecoveryOutcome),
    Reset(ResetOutcome),
    Y1564(Y1564Outcome),
}

impl TestOutcome {
    pub fn kind_name(&self) -> &'static str {
        match self {
            TestOutcome::Throughput(_) => "throughput",
            TestOutcome::Latency(_) => "latency",
            TestOutcome::FrameLoss(_) => "frame_loss",
            TestOutcome::BackToBack(_) => "back_to_back",
            TestOutcome::Recovery(_) => "recovery",
            TestOutcome::Reset(_) => "reset",
            TestOutcome::Y1564(_) => "y1564",
        }
    }

    pub fn cancelled(&self) -> bool {
        match self {
            TestOutcome::Throughput(o) => o.cancelled,
            TestOutcome::Latency(o) => o.cancelled,
            TestOutcome::FrameLoss(o) => o.cancelled,
            TestOutcome::BackToBack(o) => o.cancelled,
            TestOutcome::Recovery(o) => o.cancelled,
            TestOutcome::Reset(o) => o.cancelled,
            TestOutcome::Y1564(o) => o.cancelled,
        }
    }
}

/// Error report for runs that died before producing a full outcome.
/// Trials completed before the failure ride along.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub error: String,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub partial: Option<TestOutcome>,
}

/// Metadata describing one run, stamped into the JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub engine_version: String,
    pub run_id: uuid::Uuid,
    pub interface: String,
    pub line_rate_bps: u64,
    pub timestamp_mode: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Complete run document as written to the output file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunDocument {
    pub metadata: RunMetadata,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub outcome: Option<TestOutcome>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ErrorSummary>,
}

/// Collects trial rows and the terminal outcome, and writes the output
/// artifacts.
pub struct ResultsManager {
    output_path: Option<PathBuf>,
    csv: Option<File>,
    metadata: RunMetadata,
}

impl ResultsManager {
    pub fn new(
        output_path: Option<&Path>,
        csv_path: Option<&Path>,
        metadata: RunMetadata,
    ) -> Result<Self> {
        let csv = match csv_path {
            Some(path) => {
                let mut file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(path)
                    .with_context(|| format!("opening CSV stream {path:?}"))?;
                writeln!(
                    file,
                    "frame_size,offered_pct,frames_tx,frames_rx,loss_pct,achieved_bps,\
                     latency_min_ns,latency_mean_ns,latency_p50_ns,latency_p95_ns,\
                     latency_p99_ns,latency_max_ns,jitter_ns"
                )?;
                Some(file)
            }
            None => None,
        };
        Ok(ResultsManager {
            output_path: output_path.map(Path::to_path_buf),
            csv,
            metadata,
        })
    }

    /// Append one completed trial to the CSV stream, if enabled. Called
    /// from the run thread as each trial finishes.
    pub fn record_trial(&mut self, trial: &TrialResult) {
        if let Some(csv) = &mut self.csv {
            let l = &trial.latency;
            let _ = writeln!(
                csv,
                "{},{:.4},{},{},{:.4},{},{},{:.0},{},{},{},{},{:.0}",
                trial.frame_size,
                trial.offered.as_pct(),
                trial.frames_tx,
                trial.frames_rx,
                trial.loss_pct,
                trial.achieved_rate_bps,
                l.min_ns,
                l.mean_ns,
                l.p50_ns,
                l.p95_ns,
                l.p99_ns,
                l.max_ns,
                l.jitter_ns,
            );
        }
    }

    /// Write the final JSON document.
    pub fn finalize(
        &mut self,
        outcome: Option<TestOutcome>,
        error: Option<ErrorSummary>,
    ) -> Result<RunDocument> {
        self.metadata.finished_at = Some(chrono::Utc::now());
        let document = RunDocument {
            metadata: self.metadata.clone(),
            outcome,
            error,
        };
        if let Some(path) = &self.output_path {
            let json = serde_json::to_string_pretty(&document)?;
            std::fs::write(path, json).with_context(|| format!("writing results to {path:?}"))?;
            info!("results written to {}", path.display());
        }
        if let Some(csv) = &mut self.csv {
            let _ = csv.flush();
        }
        Ok(document)
    }

    /// Print the human-readable summary to stdout.
    pub fn print_summary(&self, document: &RunDocument) {
        println!();
        println!("=== EtherBench run {} ===", document.metadata.run_id);
        println!(
            "interface: {}  line rate: {}  timestamps: {}",
            document.metadata.interface,
            format_rate(document.metadata.line_rate_bps as f64),
            document.metadata.timestamp_mode,
        );

        if let Some(outcome) = &document.outcome {
            print_outcome(outcome);
            if outcome.cancelled() {
                println!("(run cancelled; results above are partial)");
            }
        }
        if let Some(error) = &document.error {
            println!("run failed: {}", error.error);
            if let Some(partial) = &error.partial {
                println!("partial results before failure:");
                print_outcome(partial);
            }
        }
        println!();
    }
}

fn print_outcome(outcome: &TestOutcome) {
    match outcome {
        TestOutcome::Throughput(o) => {
            println!(
                "{:>10}  {:>12}  {:>14}  {:>6}  {:>12}",
                "frame", "throughput", "rate", "iters", "p99 latency"
            );
            for p in &o.points {
                match &p.error {
                    Some(e) => println!("{:>10}  failed: {e}", p.frame_size),
                    None => println!(
                        "{:>10}  {:>11.2}%  {:>14}  {:>6}  {:>12}",
                        p.frame_size,
                        p.throughput_pct,
                        format_rate(p.throughput_bps as f64),
                        p.iterations,
                        format_latency(p.latency.p99_ns),
                    ),
                }
            }
        }
        TestOutcome::Latency(o) => {
            println!(
                "{:>10}  {:>8}  {:>10}  {:>10}  {:>10}  {:>10}  {:>10}",
                "frame", "load", "min", "mean", "p50", "p99", "max"
            );
            for p in &o.points {
                match &p.error {
                    Some(e) => println!("{:>10}  {:>7.1}%  failed: {e}", p.frame_size, p.load_pct),
                    None => println!(
                        "{:>10}  {:>7.1}%  {:>10}  {:>10}  {:>10}  {:>10}  {:>10}",
                        p.frame_size,
                        p.load_pct,
                        format_latency(p.stats.min_ns),
                        format_latency(p.stats.mean_ns as u64),
                        format_latency(p.stats.p50_ns),
                        format_latency(p.stats.p99_ns),
                        format_latency(p.stats.max_ns),
                    ),
                }
            }
        }
        TestOutcome::FrameLoss(o) => {
            for sweep in &o.sweeps {
                println!("frame size {}:", sweep.frame_size);
                println!("{:>10}  {:>12}  {:>12}  {:>8}", "offered", "tx", "rx", "loss");
                for p in &sweep.points {
                    match &p.error {
                        Some(e) => println!("{:>9.1}%  failed: {e}", p.offered_pct),
                        None => println!(
                            "{:>9.1}%  {:>12}  {:>12}  {:>7.3}%",
                            p.offered_pct, p.frames_tx, p.frames_rx, p.loss_pct
                        ),
                    }
                }
            }
        }
        TestOutcome::BackToBack(o) => {
            println!("{:>10}  {:>14}  {:>6}", "frame", "max burst", "reps");
            for p in &o.points {
                match &p.error {
                    Some(e) => println!("{:>10}  failed: {e}", p.frame_size),
                    None => println!(
                        "{:>10}  {:>14}  {:>6}",
                        p.frame_size, p.max_burst_frames, p.repetitions
                    ),
                }
            }
        }
        TestOutcome::Recovery(o) => {
            println!("{:>10}  {:>12}  {:>14}", "frame", "throughput", "recovery");
            for p in &o.points {
                match (&p.error, p.recovery_time_ms) {
                    (Some(e), _) => println!("{:>10}  failed: {e}", p.frame_size),
                    (None, Some(ms)) => println!(
                        "{:>10}  {:>11.2}%  {:>12.1}ms",
                        p.frame_size, p.throughput_pct, ms
                    ),
                    (None, None) => println!(
                        "{:>10}  {:>11.2}%  did not settle",
                        p.frame_size, p.throughput_pct
                    ),
                }
            }
        }
        TestOutcome::Reset(o) => {
            println!(
                "{:>10}  {:>14}  {:>14}",
                "frame", "frames lost", "interruption"
            );
            for p in &o.points {
                match (&p.error, p.interruption_ms) {
                    (Some(e), _) => println!("{:>10}  failed: {e}", p.frame_size),
                    (None, Some(ms)) => {
                        println!("{:>10}  {:>14}  {:>12.1}ms", p.frame_size, p.frames_lost, ms)
                    }
                    (None, None) => {
                        println!("{:>10}  {:>14}  none observed", p.frame_size, p.frames_lost)
                    }
                }
            }
        }
        TestOutcome::Y1564(o) => {
            for svc in &o.services {
                println!(
                    "service {:?} (stream {}): {}",
                    svc.name,
                    svc.stream_id,
                    if svc.service_pass { "PASS" } else { "FAIL" }
                );
                for step in &svc.steps {
                    println!(
                        "  {:>5.1}% CIR  flr {:>7.4}% [{}]  fd {:>8.3}ms [{}]  fdv {:>8.3}ms [{}]",
                        step.step_pct_of_cir,
                        step.flr_pct,
                        pass_str(step.flr_pass),
                        step.fd_ms,
                        pass_str(step.fd_pass),
                        step.fdv_ms,
                        pass_str(step.fdv_pass),
                    );
                }
                if let Some(perf) = &svc.performance {
                    println!(
                        "  performance  flr {:>7.4}%  fd {:>8.3}ms  fdv {:>8.3}ms  [{}]",
                        perf.flr_pct,
                        perf.fd_ms,
                        perf.fdv_ms,
                        pass_str(perf.pass)
                    );
                }
            }
            println!("overall: {}", if o.all_pass { "PASS" } else { "FAIL" });
        }
    }
}

fn pass_str(pass: bool) -> &'static str {
    if pass {
        "pass"
    } else {
        "FAIL"
    }
}

/// Human-readable bit rate.
pub fn format_rate(bps: f64) -> String {
    if bps < 1_000.0 {
        format!("{bps:.0} b/s")
    } else if bps < 1_000_000.0 {
        format!("{:.2} Kb/s", bps / 1_000.0)
    } else if bps < 1_000_000_000.0 {
        format!("{:.2} Mb/s", bps / 1_000_000.0)
    } else {
        format!("{:.2} Gb/s", bps / 1_000_000_000.0)
    }
}

/// Human-readable latency.
pub fn format_latency(ns: u64) -> String {
    if ns < 1_000 {
        format!("{ns}ns")
    } else if ns < 1_000_000 {
        format!("{:.2}us", ns as f64 / 1_000.0)
    } else if ns < 1_000_000_000 {
        format!("{:.2}ms", ns as f64 / 1_000_000.0)
    } else {
        format!("{:.2}s", ns as f64 / 1_000_000_000.0)
    }
}

/// Build metadata for a fresh run.
pub fn new_metadata(interface: &str, line_rate_bps: u64, timestamp_mode: &str) -> RunMetadata {
    RunMetadata {
        engine_version: crate::VERSION.to_string(),
        run_id: uuid::Uuid::new_v4(),
        interface: interface.to_string(),
        line_rate_bps,
        timestamp_mode: timestamp_mode.to_string(),
        started_at: chrono::Utc::now(),
        finished_at: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latency::LatencyStats;
    use crate::rate::OfferedRate;
    use std::time::Duration;

    fn sample_trial() -> TrialResult {
        TrialResult {
            frame_size: 512,
            offered: OfferedRate::from_pct(50.0),
            achieved_rate_bps: 500_000_000,
            frames_tx: 1000,
            frames_rx: 990,
            loss_pct: 1.0,
            latency: LatencyStats::default(),
            per_stream: Vec::new(),
            duration: Duration::from_secs(1),
            cancelled: false,
            timeline: Vec::new(),
        }
    }

    #[test]
    fn csv_stream_gets_one_row_per_trial() {
        let dir = tempfile::tempdir().unwrap();
        let csv_path = dir.path().join("trials.csv");
        let metadata = new_metadata("loopback", 1_000_000_000, "software");
        let mut manager = ResultsManager::new(None, Some(&csv_path), metadata).unwrap();
        manager.record_trial(&sample_trial());
        manager.record_trial(&sample_trial());
        manager.finalize(None, None).unwrap();

        let contents = std::fs::read_to_string(&csv_path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3); // header + 2 rows
        assert!(lines[0].starts_with("frame_size,"));
        assert!(lines[1].starts_with("512,50.0000,1000,990,"));
    }

    #[test]
    fn run_document_round_trips_through_json() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("run.json");
        let metadata = new_metadata("loopback", 1_000_000_000, "software");
        let mut manager = ResultsManager::new(Some(&out), None, metadata).unwrap();
        let outcome = TestOutcome::Throughput(ThroughputOutcome {
            points: vec![ThroughputPoint {
                frame_size: 64,
                throughput_pct: 99.5,
                throughput_bps: 995_000_000,
                iterations: 7,
                latency: LatencyStats::default(),
                loss_pct: 0.0,
                error: None,
            }],
            cancelled: false,
        });
        manager.finalize(Some(outcome), None).unwrap();

        let parsed: RunDocument =
            serde_json::from_str(&std::fs::read_to_string(&out).unwrap()).unwrap();
        assert!(parsed.metadata.finished_at.is_some());
        match parsed.outcome.unwrap() {
            TestOutcome::Throughput(o) => {
                assert_eq!(o.points.len(), 1);
                assert_eq!(o.points[0].frame_size, 64);
            }
            other => panic!("wrong outcome kind: {}", other.kind_name()),
        }
    }
}
