// Demo binary: drives synthetic producers through the scheduler.
//
// Registers a counting consumer for every category, runs producer threads at the requested rate
// until `--duration` elapses or Ctrl+C is received, then drains, stops and prints the final
// metrics snapshot as JSON. `--metrics-bind` additionally streams snapshots over TCP.

use frame_scheduler::export::serve_metrics;
use frame_scheduler::{Category, Delivery, Priority, RejectReason, Scheduler, SchedulerConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const PRODUCERS: usize = 4;

/// Command-line options parsed from program arguments.
struct CliOptions {
    /// How long producers run (default: 5 s)
    duration: Duration,
    /// Total target events per second across all producers (default: 20 000)
    rate: u64,
    /// Optional JSON configuration file
    config: Option<PathBuf>,
    /// Optional bind address for the JSON-lines metrics export
    metrics_bind: Option<String>,
}

/// Normalize a metrics bind address to include a port if missing.
fn normalize_metrics_bind(value: &str) -> String {
    if value.contains(':') {
        value.to_string()
    } else {
        format!("{value}:9999")
    }
}

fn apply_option(options: &mut CliOptions, key: &str, value: &str) {
    match key {
        "--duration" => match value.parse::<f64>() {
            Ok(secs) if secs > 0.0 => options.duration = Duration::from_secs_f64(secs),
            _ => eprintln!("ignoring invalid --duration {value:?}"),
        },
        "--rate" => match value.parse::<u64>() {
            Ok(rate) => options.rate = rate,
            Err(_) => eprintln!("ignoring invalid --rate {value:?}"),
        },
        "--config" => options.config = Some(PathBuf::from(value)),
        "--metrics-bind" => options.metrics_bind = Some(normalize_metrics_bind(value)),
        _ => eprintln!("unknown option {key}"),
    }
}

/// Parse command-line arguments into `CliOptions`.
///
/// Each option accepts both `--key=value` and `--key value`:
/// - `--duration <secs>`: producer run time
/// - `--rate <events/sec>`: total offered load
/// - `--config <path>`: JSON scheduler configuration
/// - `--metrics-bind <addr>`: enable the metrics export (port defaults to 9999)
fn parse_cli_options() -> CliOptions {
    let mut options = CliOptions {
        duration: Duration::from_secs(5),
        rate: 20_000,
        config: None,
        metrics_bind: None,
    };
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if let Some((key, value)) = arg.split_once('=') {
            apply_option(&mut options, key, value);
        } else if let Some(value) = args.next() {
            apply_option(&mut options, &arg, &value);
        } else {
            eprintln!("missing value for {arg}");
        }
    }
    options
}

/// Deterministic priority mix: 1% Critical, 9% High, 60% Normal, 30% Low.
fn priority_for(sequence: u64) -> Priority {
    match sequence % 100 {
        0 => Priority::Critical,
        1..=9 => Priority::High,
        10..=69 => Priority::Normal,
        _ => Priority::Low,
    }
}

fn run_producer(
    scheduler: Arc<Scheduler>,
    producer_id: usize,
    per_ms: u64,
    stop: Arc<AtomicBool>,
    rejected: Arc<AtomicU64>,
) {
    let mut sequence = producer_id as u64;
    let mut slot = Instant::now();
    while !stop.load(Ordering::Relaxed) {
        for _ in 0..per_ms {
            let category = Category::ALL[(sequence as usize) % Category::ALL.len()];
            let priority = priority_for(sequence / Category::ALL.len() as u64);
            let payload = sequence.to_le_bytes();
            let size = payload.len().min(category.max_payload());
            match scheduler.enqueue(category, priority, &payload[..size], None) {
                Ok(_) => {}
                Err(RejectReason::Closed) => return,
                Err(_) => {
                    rejected.fetch_add(1, Ordering::Relaxed);
                }
            }
            sequence += PRODUCERS as u64;
        }
        slot += Duration::from_millis(1);
        let now = Instant::now();
        if slot > now {
            thread::sleep(slot - now);
        }
    }
}

/// Main entry point for the demo binary.
///
/// 1. Parses options and installs the tracing subscriber (`RUST_LOG`, default `info`)
/// 2. Loads the configuration and builds the scheduler
/// 3. Registers a counting consumer per category and optionally starts the metrics export
/// 4. Runs producers until the duration elapses or Ctrl+C is pressed
/// 5. Stops with a drain timeout and prints the final snapshot
fn main() -> Result<(), Box<dyn std::error::Error>> {
    let options = parse_cli_options();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match &options.config {
        Some(path) => SchedulerConfig::from_path(path)?,
        None => SchedulerConfig::default(),
    };
    let scheduler = Arc::new(Scheduler::new(config)?);

    let delivered = Arc::new(AtomicU64::new(0));
    let late = Arc::new(AtomicU64::new(0));
    for category in Category::ALL {
        let delivered = delivered.clone();
        let late = late.clone();
        scheduler.register_consumer(category, move |delivery: Delivery| {
            if let Delivery::Event(event) = &delivery {
                if event.is_late() {
                    late.fetch_add(1, Ordering::Relaxed);
                }
            }
            delivered.fetch_add(delivery.events().len() as u64, Ordering::Relaxed);
        })?;
    }

    // Runtime only backs the metrics export; it lives until the end of main.
    let rt = tokio::runtime::Runtime::new()?;
    let server = match &options.metrics_bind {
        Some(bind) => match rt.block_on(serve_metrics(
            scheduler.clone(),
            bind,
            Duration::from_millis(500),
        )) {
            Ok(server) => Some(server),
            Err(err) => {
                eprintln!("Failed to start metrics server: {err}");
                None
            }
        },
        None => None,
    };

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let shutdown_flag_clone = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        shutdown_flag_clone.store(true, Ordering::Relaxed);
    })?;

    scheduler.start()?;
    info!(
        rate = options.rate,
        duration_s = options.duration.as_secs_f64(),
        "producers starting"
    );

    let rejected = Arc::new(AtomicU64::new(0));
    let per_ms = (options.rate / 1000 / PRODUCERS as u64).max(1);
    let producers: Vec<_> = (0..PRODUCERS)
        .map(|producer_id| {
            let scheduler = scheduler.clone();
            let stop = shutdown_flag.clone();
            let rejected = rejected.clone();
            thread::Builder::new()
                .name(format!("producer-{producer_id}"))
                .spawn(move || run_producer(scheduler, producer_id, per_ms, stop, rejected))
        })
        .collect::<Result<_, _>>()?;

    let started = Instant::now();
    while !shutdown_flag.load(Ordering::Relaxed) && started.elapsed() < options.duration {
        thread::sleep(Duration::from_millis(100));
    }
    shutdown_flag.store(true, Ordering::Relaxed);
    for producer in producers {
        if producer.join().is_err() {
            warn!("producer thread panicked");
        }
    }

    let report = scheduler.stop(Duration::from_millis(500));
    let snapshot = scheduler.snapshot();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    println!(
        "delivered={} late={} rejected={} drained={} dropped_on_shutdown={} timed_out={}",
        delivered.load(Ordering::Relaxed),
        late.load(Ordering::Relaxed),
        rejected.load(Ordering::Relaxed),
        report.drained,
        report.dropped_on_shutdown,
        report.timed_out,
    );

    if let Some(server) = server {
        rt.block_on(server.shutdown());
    }
    Ok(())
}
