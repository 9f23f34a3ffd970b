//! # Command-Line Interface
//!
//! Argument parsing and the translation from CLI flags to an
//! `EngineConfig`. The CLI is the external configuration loader the
//! engine contract assumes: everything is validated into typed form here
//! (durations, rates, the Y.1564 services file) before `Engine::start`
//! applies the engine-side validation rules.
//!
//! ```bash
//! # Throughput search on a real NIC at its discovered line rate
//! etherbench -i eth2 -t throughput --resolution 0.1
//!
//! # Latency sweep at three loads, jumbo frames, hardware timestamps
//! etherbench -i eth2 -t latency -f 9000 --load-levels 10 50 90 --hw-timestamp
//!
//! # Y.1564 service activation from a services file
//! etherbench -i eth2 -t y1564 --services-file services.json
//!
//! # Self-test against the loopback DUT simulator (no privileges needed)
//! etherbench -i loopback:rate=100m,forward=50m -t frame-loss
//! ```

use clap::{
    builder::styling::{AnsiColor, Styles},
    Parser, ValueEnum,
};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::engine::EngineConfig;
use crate::frame::DEFAULT_FRAME_SIZES;
use crate::orchestrator::{
    BackToBackParams, FrameLossParams, LatencyParams, RecoveryParams, ResetParams, SearchSeed,
    ServiceSla, TestKind, ThroughputParams, Y1564Params,
};

/// Defines the styles for the help message.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Network interface to test through
    ///
    /// A NIC name (raw packet sockets, needs CAP_NET_RAW) or "loopback"
    /// for the built-in DUT simulator. The simulator accepts an inline
    /// profile, e.g. "loopback:rate=100m,forward=50m,delay=500us".
    #[arg(short = 'i', long, help_heading = "Core Options")]
    pub interface: String,

    /// Line rate override (e.g. "1g", "10g", "100m"; 0 = discover)
    ///
    /// Required when the driver does not report a link speed (virtual
    /// devices); ignored speeds fail the run with an unknown-line-rate
    /// error otherwise.
    #[arg(long, default_value = "0", value_parser = parse_rate, help_heading = "Core Options")]
    pub line_rate: u64,

    /// Test to run
    #[arg(short = 't', long, value_enum, default_value_t = TestType::Throughput, help_heading = "Core Options")]
    pub test: TestType,

    /// Frame sizes in bytes (0 = the RFC 2544 sweep {64,128,...,1518})
    ///
    /// Sizes must come from {64,128,256,512,1024,1280,1518,9000}. 64 is
    /// raised to the 66-byte minimum that fits the signed probe payload.
    #[arg(short = 'f', long, num_args = 1.., default_values_t = vec![0usize], help_heading = "Core Options")]
    pub frame_size: Vec<usize>,

    /// Measurement window per trial (e.g. "10s", "500ms")
    #[arg(short = 'd', long, default_value = "10s", value_parser = parse_duration, help_heading = "Timing")]
    pub trial_duration: Duration,

    /// Warmup window before each measurement, excluded from statistics
    #[arg(short = 'w', long, default_value = "2s", value_parser = parse_duration, help_heading = "Timing")]
    pub warmup: Duration,

    /// Drain window after each measurement catching in-flight frames
    #[arg(long, default_value = "2s", value_parser = parse_duration, help_heading = "Timing")]
    pub drain: Duration,

    /// Starting rate for the throughput binary search, percent of line rate
    #[arg(long, default_value_t = 100.0, help_heading = "Throughput")]
    pub initial_rate: f64,

    /// Search resolution: stop when high - low is within this, percent
    #[arg(long, default_value_t = 0.5, help_heading = "Throughput")]
    pub resolution: f64,

    /// Loss tolerated while still counting a trial as passing, percent
    #[arg(long, default_value_t = 0.0, help_heading = "Throughput")]
    pub acceptable_loss: f64,

    /// Hard cap on binary-search trials per frame size
    #[arg(long, default_value_t = 20, help_heading = "Throughput")]
    pub max_iterations: u32,

    /// First probe of the search: the maximum rate itself, or the midpoint
    #[arg(long, value_enum, default_value_t = SeedArg::Max, help_heading = "Throughput")]
    pub search_seed: SeedArg,

    /// Loads to measure latency at, percent of line rate
    #[arg(long, num_args = 1.., default_values_t = vec![10.0, 50.0, 90.0], help_heading = "Latency")]
    pub load_levels: Vec<f64>,

    /// Latency samples to collect per load level
    #[arg(long, default_value_t = crate::defaults::LATENCY_SAMPLES, help_heading = "Latency")]
    pub latency_samples: u64,

    /// Frame-loss sweep start, percent of line rate
    #[arg(long, default_value_t = 100.0, help_heading = "Frame Loss")]
    pub loss_start: f64,

    /// Frame-loss sweep end, percent of line rate
    #[arg(long, default_value_t = 10.0, help_heading = "Frame Loss")]
    pub loss_end: f64,

    /// Frame-loss sweep step, percent
    #[arg(long, default_value_t = 10.0, help_heading = "Frame Loss")]
    pub loss_step: f64,

    /// Starting burst length for the back-to-back search, frames
    #[arg(long, default_value_t = 1000, help_heading = "Back-to-Back")]
    pub initial_burst: u64,

    /// Repetitions per burst size; all must be lossless to pass
    #[arg(long, default_value_t = 10, help_heading = "Back-to-Back")]
    pub burst_trials: u32,

    /// Throughput to derive recovery/reset load from, percent of line
    /// rate (omit to run a throughput search first)
    #[arg(long, help_heading = "Recovery & Reset")]
    pub throughput_pct: Option<f64>,

    /// Overload duration before the recovery step-down
    #[arg(long, default_value = "10s", value_parser = parse_duration, help_heading = "Recovery & Reset")]
    pub overload: Duration,

    /// Window after the step-down in which recovery must be observed
    #[arg(long, default_value = "10s", value_parser = parse_duration, help_heading = "Recovery & Reset")]
    pub settle: Duration,

    /// How long to keep offering while the DUT is reset externally
    #[arg(long, default_value = "30s", value_parser = parse_duration, help_heading = "Recovery & Reset")]
    pub reset_watch: Duration,

    /// Receive gaps shorter than this do not count as an interruption
    #[arg(long, default_value_t = 100, help_heading = "Recovery & Reset")]
    pub gap_threshold_ms: u64,

    /// JSON file describing Y.1564 services and their SLAs
    ///
    /// An array of objects: {"name", "cir_mbps", "fd_ms", "fdv_ms",
    /// "flr_pct", optional "eir_mbps", "cbs_bytes", "ebs_bytes", "dscp",
    /// "frame_size", "enabled"}.
    #[arg(long, help_heading = "Y.1564")]
    pub services_file: Option<PathBuf>,

    /// Configuration-test steps, percent of each service's CIR
    #[arg(long, num_args = 1.., default_values_t = vec![25.0, 50.0, 75.0, 100.0], help_heading = "Y.1564")]
    pub config_steps: Vec<f64>,

    /// Duration of each configuration step
    #[arg(long, default_value = "10s", value_parser = parse_duration, help_heading = "Y.1564")]
    pub step_duration: Duration,

    /// Skip the concurrent multi-service performance phase
    #[arg(long, help_heading = "Y.1564")]
    pub no_performance_test: bool,

    /// Duration of the performance phase
    #[arg(long, default_value = "30s", value_parser = parse_duration, help_heading = "Y.1564")]
    pub performance_duration: Duration,

    /// Use NIC hardware timestamps when both TX and RX support them
    #[arg(long, help_heading = "Engine")]
    pub hw_timestamp: bool,

    /// Disable per-frame latency measurement (lower receive-path cost)
    #[arg(long, help_heading = "Engine")]
    pub no_latency: bool,

    /// Frames submitted per send batch
    #[arg(long, default_value_t = crate::defaults::BATCH_SIZE, help_heading = "Engine")]
    pub batch_size: usize,

    /// Disable pacing and transmit as fast as the port accepts
    #[arg(long, help_heading = "Engine")]
    pub no_pacing: bool,

    /// Output file for the JSON run document
    #[arg(short = 'o', long, default_value = crate::defaults::OUTPUT_FILE, help_heading = "Output and Logging")]
    pub output_file: PathBuf,

    /// Stream one CSV row per completed trial to this file
    #[arg(long, help_heading = "Output and Logging")]
    pub csv_output: Option<PathBuf>,

    /// Detailed log destination: a path, or "stderr" (default: daily
    /// rolling file next to the binary)
    #[arg(long, help_heading = "Output and Logging")]
    pub log_file: Option<String>,

    /// Silence user-facing output on stdout
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,
}

/// Test kinds selectable from the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum TestType {
    /// RFC 2544 §26.1 throughput binary search
    Throughput,
    /// RFC 2544 §26.2 latency under load
    Latency,
    /// RFC 2544 §26.3 frame-loss rate sweep
    #[value(name = "frame-loss")]
    FrameLoss,
    /// RFC 2544 §26.4 back-to-back burst capacity
    #[value(name = "back-to-back")]
    BackToBack,
    /// RFC 2544 §26.5 system recovery after overload
    Recovery,
    /// RFC 2544 §26.6 loss across a DUT reset
    Reset,
    /// ITU-T Y.1564 service activation
    Y1564,
}

impl std::fmt::Display for TestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestType::Throughput => write!(f, "throughput"),
            TestType::Latency => write!(f, "latency"),
            TestType::FrameLoss => write!(f, "frame loss"),
            TestType::BackToBack => write!(f, "back-to-back"),
            TestType::Recovery => write!(f, "recovery"),
            TestType::Reset => write!(f, "reset"),
            TestType::Y1564 => write!(f, "Y.1564"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum SeedArg {
    /// Probe the initial rate first; a pass ends the search immediately
    Max,
    /// Start bisection at the midpoint
    Midpoint,
}

impl Args {
    /// Translate parsed flags into the engine configuration.
    pub fn engine_config(&self) -> Result<EngineConfig> {
        let frame_sizes = if self.frame_size == [0] {
            DEFAULT_FRAME_SIZES.to_vec()
        } else if self.frame_size.contains(&0) {
            bail!("frame size 0 (the default sweep) cannot be mixed with explicit sizes");
        } else {
            self.frame_size.clone()
        };

        let test = match self.test {
            TestType::Throughput => TestKind::Throughput(self.throughput_params()),
            TestType::Latency => TestKind::Latency(LatencyParams {
                load_levels: self.load_levels.clone(),
                samples: self.latency_samples,
            }),
            TestType::FrameLoss => TestKind::FrameLoss(FrameLossParams {
                start_pct: self.loss_start,
                end_pct: self.loss_end,
                step_pct: self.loss_step,
            }),
            TestType::BackToBack => TestKind::BackToBack(BackToBackParams {
                initial_burst: self.initial_burst,
                trials: self.burst_trials,
                ..BackToBackParams::default()
            }),
            TestType::Recovery => TestKind::Recovery(RecoveryParams {
                throughput_pct: self.throughput_pct,
                overload: self.overload,
                settle: self.settle,
            }),
            TestType::Reset => TestKind::Reset(ResetParams {
                rate_pct: self.throughput_pct,
                watch: self.reset_watch,
                gap_threshold_ms: self.gap_threshold_ms,
            }),
            TestType::Y1564 => TestKind::Y1564(Y1564Params {
                services: self.load_services()?,
                config_steps: self.config_steps.clone(),
                step_duration: self.step_duration,
                performance_test: !self.no_performance_test,
                performance_duration: self.performance_duration,
            }),
        };

        Ok(EngineConfig {
            interface: self.interface.clone(),
            line_rate_bps: self.line_rate,
            test,
            frame_sizes,
            trial_duration: self.trial_duration,
            warmup: self.warmup,
            drain: self.drain,
            hw_timestamp: self.hw_timestamp,
            measure_latency: !self.no_latency,
            batch_size: self.batch_size,
            use_pacing: !self.no_pacing,
            output_file: Some(self.output_file.clone()),
            csv_file: self.csv_output.clone(),
        })
    }

    fn throughput_params(&self) -> ThroughputParams {
        ThroughputParams {
            initial_rate_pct: self.initial_rate,
            resolution_pct: self.resolution,
            acceptable_loss_pct: self.acceptable_loss,
            max_iterations: self.max_iterations,
            seed: match self.search_seed {
                SeedArg::Max => SearchSeed::Maximum,
                SeedArg::Midpoint => SearchSeed::Midpoint,
            },
        }
    }

    fn load_services(&self) -> Result<Vec<ServiceSla>> {
        let path = self
            .services_file
            .as_ref()
            .context("the y1564 test needs --services-file")?;
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading services file {path:?}"))?;
        let services: Vec<ServiceSla> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing services file {path:?}"))?;
        Ok(services)
    }
}

/// Parse a bit rate like "10g", "100m", "2.5g" or a plain bps number.
fn parse_rate(value: &str) -> std::result::Result<u64, String> {
    let lower = value.trim().to_ascii_lowercase();
    let (digits, mult) = match lower.as_bytes().last() {
        Some(b'k') => (&lower[..lower.len() - 1], 1_000f64),
        Some(b'm') => (&lower[..lower.len() - 1], 1_000_000f64),
        Some(b'g') => (&lower[..lower.len() - 1], 1_000_000_000f64),
        _ => (lower.as_str(), 1f64),
    };
    digits
        .parse::<f64>()
        .map(|v| (v * mult) as u64)
        .map_err(|_| format!("invalid rate: {value:?} (try \"10g\", \"100m\", or plain bps)"))
}

/// Parse a human-readable duration: "90s", "500ms", "5m", "1h", or plain
/// seconds.
fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    let lower = value.trim().to_ascii_lowercase();
    let (digits, unit_secs) = if let Some(d) = lower.strip_suffix("ms") {
        (d, 0.001)
    } else if let Some(d) = lower.strip_suffix('h') {
        (d, 3600.0)
    } else if let Some(d) = lower.strip_suffix('m') {
        (d, 60.0)
    } else if let Some(d) = lower.strip_suffix('s') {
        (d, 1.0)
    } else {
        (lower.as_str(), 1.0)
    };
    let number: f64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {value:?} (try \"10s\", \"500ms\", \"5m\")"))?;
    if number < 0.0 {
        return Err(format!("duration cannot be negative: {value:?}"));
    }
    Ok(Duration::from_secs_f64(number * unit_secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parsing_accepts_human_formats() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn rate_parsing_accepts_suffixes() {
        assert_eq!(parse_rate("1g").unwrap(), 1_000_000_000);
        assert_eq!(parse_rate("2.5G").unwrap(), 2_500_000_000);
        assert_eq!(parse_rate("100m").unwrap(), 100_000_000);
        assert_eq!(parse_rate("0").unwrap(), 0);
        assert!(parse_rate("fast").is_err());
    }

    #[test]
    fn default_frame_size_expands_to_the_sweep() {
        let args = Args::parse_from(["etherbench", "-i", "loopback"]);
        let config = args.engine_config().unwrap();
        assert_eq!(config.frame_sizes, DEFAULT_FRAME_SIZES);
    }

    #[test]
    fn explicit_sizes_are_kept() {
        let args = Args::parse_from(["etherbench", "-i", "loopback", "-f", "64", "1518"]);
        let config = args.engine_config().unwrap();
        assert_eq!(config.frame_sizes, vec![64, 1518]);
    }

    #[test]
    fn y1564_without_services_file_is_an_error() {
        let args = Args::parse_from(["etherbench", "-i", "loopback", "-t", "y1564"]);
        assert!(args.engine_config().is_err());
    }

    #[test]
    fn services_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.json");
        std::fs::write(
            &path,
            r#"[{"name": "voice", "cir_mbps": 100.0, "fd_ms": 10.0, "fdv_ms": 5.0, "flr_pct": 0.01, "dscp": 46}]"#,
        )
        .unwrap();
        let args = Args::parse_from([
            "etherbench",
            "-i",
            "loopback",
            "-t",
            "y1564",
            "--services-file",
            path.to_str().unwrap(),
        ]);
        let config = args.engine_config().unwrap();
        match config.test {
            TestKind::Y1564(p) => {
                assert_eq!(p.services.len(), 1);
                assert!(p.services[0].enabled);
                assert_eq!(p.services[0].dscp, 46);
            }
            _ => panic!("wrong test kind"),
        }
    }
}
