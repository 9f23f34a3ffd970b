//! End-to-end trials over the loopback DUT simulator: real sender and
//! receiver threads, real pacing, real frame stamping and validation.
//! Rates are kept low (tens of Mb/s) so the in-process port keeps up on
//! any CI box, and assertions carry generous margins where wall-clock
//! scheduling is involved.

use std::time::Duration;

use etherbench::engine::EngineConfig;
use etherbench::orchestrator::{SearchSeed, TestKind, ThroughputParams};
use etherbench::port::PortConfig;
use etherbench::trial::{
    CancelToken, StreamSpec, TrialExecutor, TrialMode, TrialRunner, TrialSpec,
};
use etherbench::{Engine, OfferedRate, TestOutcome};

fn runner(interface: &str) -> TrialRunner {
    TrialRunner::new(
        PortConfig {
            interface: interface.to_string(),
            line_rate_bps: 0,
            hw_timestamp: false,
        },
        CancelToken::new(),
    )
    .expect("loopback open")
}

fn quick_spec(frame_size: usize, offered_pct: f64) -> TrialSpec {
    let mut spec = TrialSpec::paced(
        frame_size,
        OfferedRate::from_pct(offered_pct),
        Duration::from_millis(400),
    );
    spec.warmup = Duration::from_millis(100);
    spec.drain = Duration::from_millis(300);
    spec.batch_size = 8;
    spec
}

#[test]
fn paced_trial_is_lossless_on_an_ideal_loopback() {
    let mut runner = runner("loopback:rate=10m,delay=200us");
    let mut spec = quick_spec(512, 50.0);
    spec.streams = vec![StreamSpec::single(42)];

    let result = runner.run_trial(&spec).unwrap();

    assert!(!result.cancelled);
    assert!(result.frames_tx > 100, "only {} frames sent", result.frames_tx);
    assert_eq!(result.frames_rx, result.frames_tx);
    assert_eq!(result.loss_pct, 0.0);
    assert_eq!(result.per_stream.len(), 1);
    assert_eq!(result.per_stream[0].stream_id, 42);

    // Latency reflects the simulator's 200 us one-way delay.
    assert!(result.latency.count > 0);
    assert!(
        result.latency.min_ns >= 150_000,
        "min latency {} below the simulated delay",
        result.latency.min_ns
    );
    assert!(result.latency.p50_ns <= result.latency.p99_ns);
}

#[test]
fn measured_tx_rate_tracks_the_offered_rate() {
    let mut runner = runner("loopback:rate=10m,delay=100us");
    let spec = quick_spec(512, 50.0);

    let result = runner.run_trial(&spec).unwrap();

    // 50 % of 10 Mb/s at 512-byte frames: 10e6 * 0.5 / (532 * 8) pps.
    let expected = 10_000_000.0 * 0.5 / ((512.0 + 20.0) * 8.0) * 0.4;
    let actual = result.frames_tx as f64;
    assert!(
        (actual - expected).abs() / expected < 0.15,
        "sent {actual} frames, expected about {expected}"
    );
}

#[test]
fn zero_offered_rate_transmits_nothing_and_passes() {
    let mut runner = runner("loopback:rate=10m");
    let mut spec = quick_spec(512, 0.0);
    spec.warmup = Duration::ZERO;
    spec.duration = Duration::from_millis(150);

    let result = runner.run_trial(&spec).unwrap();
    assert_eq!(result.frames_tx, 0);
    assert_eq!(result.frames_rx, 0);
    assert_eq!(result.loss_pct, 0.0);
}

#[test]
fn burst_trial_measures_the_simulated_buffer() {
    let mut runner = runner("loopback:rate=10m,buffer=100,delay=5ms");

    let mut spec = quick_spec(512, 100.0);
    spec.mode = TrialMode::Burst { frames: 100 };
    spec.warmup = Duration::ZERO;
    spec.measure_latency = false;
    let fits = runner.run_trial(&spec).unwrap();
    assert_eq!(fits.frames_tx, 100);
    assert_eq!(fits.frames_rx, 100, "burst at the buffer depth lost frames");

    let mut spec = quick_spec(512, 100.0);
    spec.mode = TrialMode::Burst { frames: 150 };
    spec.warmup = Duration::ZERO;
    spec.measure_latency = false;
    let overflows = runner.run_trial(&spec).unwrap();
    assert_eq!(overflows.frames_tx, 150);
    assert_eq!(
        overflows.frames_rx, 100,
        "overflow burst should be clipped at the buffer depth"
    );
}

#[test]
fn cancellation_unwinds_a_running_trial() {
    let cancel = CancelToken::new();
    let mut runner = TrialRunner::new(
        PortConfig {
            interface: "loopback:rate=10m".to_string(),
            line_rate_bps: 0,
            hw_timestamp: false,
        },
        cancel.clone(),
    )
    .unwrap();

    let mut spec = quick_spec(512, 10.0);
    spec.duration = Duration::from_secs(30);
    spec.warmup = Duration::ZERO;

    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        cancel.cancel();
    });
    let started = std::time::Instant::now();
    let result = runner.run_trial(&spec).unwrap();
    canceller.join().unwrap();

    assert!(result.cancelled);
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "cancel took {:?}",
        started.elapsed()
    );
}

#[test]
fn multi_stream_trial_keeps_streams_disjoint() {
    let mut runner = runner("loopback:rate=10m,delay=100us");
    let mut spec = quick_spec(512, 60.0);
    spec.streams = vec![
        StreamSpec {
            stream_id: 1,
            dscp: 46,
            weight: 3.0,
        },
        StreamSpec {
            stream_id: 2,
            dscp: 0,
            weight: 1.0,
        },
    ];

    let result = runner.run_trial(&spec).unwrap();

    assert_eq!(result.per_stream.len(), 2);
    let a = &result.per_stream[0];
    let b = &result.per_stream[1];
    assert_eq!(a.frames_tx + b.frames_tx, result.frames_tx);
    assert_eq!(a.frames_rx + b.frames_rx, result.frames_rx);
    assert!(a.frames_tx > 0 && b.frames_tx > 0);
    // The 3:1 weighting holds loosely over a short trial.
    let ratio = a.frames_tx as f64 / b.frames_tx as f64;
    assert!((2.0..=4.0).contains(&ratio), "stream ratio {ratio}");
}

/// Full engine path: start -> progress -> result against a lossless
/// loopback; the throughput search should terminate at the initial rate
/// on the first trial.
#[tokio::test(flavor = "multi_thread")]
async fn engine_runs_a_throughput_search_over_loopback() {
    let config = EngineConfig {
        interface: "loopback:rate=10m,delay=100us".into(),
        line_rate_bps: 0,
        test: TestKind::Throughput(ThroughputParams {
            initial_rate_pct: 50.0,
            resolution_pct: 5.0,
            acceptable_loss_pct: 0.0,
            max_iterations: 8,
            seed: SearchSeed::Maximum,
        }),
        frame_sizes: vec![512],
        trial_duration: Duration::from_millis(500),
        warmup: Duration::from_millis(100),
        drain: Duration::from_millis(300),
        hw_timestamp: false,
        measure_latency: true,
        batch_size: 8,
        use_pacing: true,
        output_file: None,
        csv_file: None,
    };

    let engine = Engine::new();
    let mut handle = engine.start(config, None).unwrap();
    let mut progress = handle.take_progress().unwrap();

    let collector = tokio::spawn(async move {
        let mut events = 0;
        while progress.recv().await.is_some() {
            events += 1;
        }
        events
    });

    let result = handle.result().await;
    assert_eq!(result.exit_code(), 0, "error: {:?}", result.error);

    match result.outcome.unwrap() {
        TestOutcome::Throughput(o) => {
            assert_eq!(o.points.len(), 1);
            let p = &o.points[0];
            assert!(
                (45.0..=50.0).contains(&p.throughput_pct),
                "throughput {}",
                p.throughput_pct
            );
            assert_eq!(p.iterations, 1, "lossless DUT should pass the seed probe");
        }
        other => panic!("wrong outcome kind: {}", other.kind_name()),
    }
    assert!(collector.await.unwrap() > 0, "no progress events seen");
}

/// Engine validation rejects a bad configuration before touching a port.
#[tokio::test]
async fn engine_rejects_bad_config_at_start() {
    let config = EngineConfig {
        interface: String::new(),
        line_rate_bps: 0,
        test: TestKind::Throughput(ThroughputParams::default()),
        frame_sizes: vec![512],
        trial_duration: Duration::from_millis(100),
        warmup: Duration::ZERO,
        drain: Duration::ZERO,
        hw_timestamp: false,
        measure_latency: true,
        batch_size: 8,
        use_pacing: true,
        output_file: None,
        csv_file: None,
    };
    let engine = Engine::new();
    let err = engine.start(config, None).unwrap_err();
    assert_eq!(err.exit_code(), 2);
}
