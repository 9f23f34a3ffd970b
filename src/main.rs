//! # EtherBench - Main Entry Point
//!
//! The one-shot command-line consumer of the engine's control, progress,
//! and result ports. The flow:
//!
//! 1. **Initialize logging**: a detailed rolling-file (or stderr) layer
//!    plus a colorized user-facing stdout layer.
//! 2. **Parse arguments** into an `EngineConfig`.
//! 3. **Probe the link** for result metadata (line rate, timestamp mode).
//! 4. **Start the run** and wire Ctrl-C to the cancel port.
//! 5. **Consume progress** events onto stdout while trials run.
//! 6. **Finalize results**: JSON document, CSV stream, stdout summary.
//!
//! Exit codes follow the engine contract: 0 success, 2 invalid
//! configuration, 3 NIC error, 4 cancelled, 5 internal failure.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use clap::Parser;
use colored::Colorize;
use tracing::{error, info, Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use etherbench::cli::Args;
use etherbench::results::{new_metadata, ResultsManager};
use etherbench::{Engine, RunState};

/// Stdout formatter for the user-facing layer.
///
/// Progress and summary lines print bare so a run reads like program
/// output, with the whole line tinted by severity. Diagnostic levels
/// (enabled with -v/-vv) get a `[+secs]` elapsed-run prefix instead of
/// wall-clock timestamps: what matters while a sweep runs is how far
/// into the run an event happened, not the time of day. The detailed
/// rolling-file layer keeps the standard timestamped format.
struct StdoutFormatter {
    run_started: Instant,
}

impl<S, N> FormatEvent<S, N> for StdoutFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let level = *event.metadata().level();

        // Assemble the line in a buffer so the color spans all of it.
        let mut line = String::new();
        if level >= Level::DEBUG {
            use std::fmt::Write as _;
            write!(line, "[+{:.3}s] ", self.run_started.elapsed().as_secs_f64())?;
        }
        ctx.format_fields(Writer::new(&mut line).by_ref(), event)?;

        let painted = match level {
            Level::ERROR => line.red().bold(),
            Level::WARN => line.yellow(),
            Level::INFO => line.normal(),
            Level::DEBUG => line.dimmed(),
            Level::TRACE => line.dimmed().italic(),
        };
        writeln!(writer, "{painted}")
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let code = run(args).await;
    std::process::exit(code);
}

async fn run(args: Args) -> i32 {
    // Verbosity applies to both the detailed layer and stdout.
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Detailed log layer: stderr on request, daily rolling file otherwise.
    // The guard must stay alive for the program lifetime.
    let guard;
    let detailed_log_layer;
    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir = log_path
                    .parent()
                    .unwrap_or_else(|| std::path::Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("etherbench.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "etherbench.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // Clean user-facing stdout layer, suppressed by --quiet.
    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(StdoutFormatter {
                    run_started: Instant::now(),
                })
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();
    let _log_guard = guard;

    info!("EtherBench {} starting", etherbench::VERSION);

    let config = match args.engine_config() {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e:#}");
            return 2;
        }
    };

    // Link facts feed the run metadata; opening also fails fast on NIC
    // problems before any trial state is built.
    let link = match Engine::probe_link(&config) {
        Ok(link) => link,
        Err(e) => {
            error!("{e}");
            return e.exit_code();
        }
    };
    info!(
        "{}: line rate {}, mtu {}, {} timestamps",
        config.interface,
        etherbench::results::format_rate(link.line_rate_bps as f64),
        link.mtu,
        link.mode
    );

    let metadata = new_metadata(&config.interface, link.line_rate_bps, &link.mode.to_string());
    let manager = match ResultsManager::new(
        config.output_file.as_deref(),
        config.csv_file.as_deref(),
        metadata,
    ) {
        Ok(manager) => Arc::new(Mutex::new(manager)),
        Err(e) => {
            error!("cannot open output files: {e:#}");
            return 2;
        }
    };

    // CSV trial streaming happens from the run thread as trials finish.
    let trial_sink = {
        let manager = Arc::clone(&manager);
        Box::new(move |trial: &etherbench::TrialResult| {
            if let Ok(mut manager) = manager.lock() {
                manager.record_trial(trial);
            }
        }) as Box<dyn FnMut(&etherbench::TrialResult) + Send>
    };

    let engine = Engine::new();
    let mut handle = match engine.start(config, Some(trial_sink)) {
        Ok(handle) => handle,
        Err(e) => {
            error!("{e}");
            return e.exit_code();
        }
    };

    // Ctrl-C maps to the cancel port; a second Ctrl-C kills the process.
    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling (partial results will be reported)");
            cancel.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            std::process::exit(4);
        }
    });

    // Relay progress events while the run executes.
    if let Some(mut progress) = handle.take_progress() {
        tokio::spawn(async move {
            while let Some(event) = progress.recv().await {
                match event.state {
                    RunState::Running => {
                        info!("[{:5.1}%] {}", event.progress_pct, event.message)
                    }
                    RunState::Completed => info!("{}", event.message),
                    RunState::Cancelled => info!("cancelled: {}", event.message),
                    RunState::Failed => error!("{}", event.message),
                }
            }
        });
    }

    let result = handle.result().await;
    let code = result.exit_code();

    let document = {
        let mut manager = manager.lock().expect("results manager poisoned");
        match manager.finalize(result.outcome, result.error) {
            Ok(document) => document,
            Err(e) => {
                error!("failed to write results: {e:#}");
                return 5;
            }
        }
    };
    if !args.quiet {
        manager
            .lock()
            .expect("results manager poisoned")
            .print_summary(&document);
    }

    code
}
