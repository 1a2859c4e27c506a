//! Load generator: many producer threads decrementing one shared counter
//! through the mediator. Exits non-zero if any decrement was lost.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use brrtmediator::{
    logging, BackpressureMode, DispatchError, Mediator, MediatorConfig, RegistryBuilder, Request,
    WaitStrategy,
};
use clap::{Parser, ValueEnum};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WaitArg {
    BusySpin,
    Yielding,
    TimedPark,
}

impl From<WaitArg> for WaitStrategy {
    fn from(arg: WaitArg) -> Self {
        match arg {
            WaitArg::BusySpin => WaitStrategy::BusySpin,
            WaitArg::Yielding => WaitStrategy::Yielding,
            WaitArg::TimedPark => WaitStrategy::TimedPark,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackpressureArg {
    Block,
    Shed,
}

impl From<BackpressureArg> for BackpressureMode {
    fn from(arg: BackpressureArg) -> Self {
        match arg {
            BackpressureArg::Block => BackpressureMode::Block,
            BackpressureArg::Shed => BackpressureMode::Shed,
        }
    }
}

/// Decrement-counter throughput run
#[derive(Parser, Debug)]
#[command(name = "brrtm-bench")]
#[command(about = "brrtmediator throughput benchmark", long_about = None)]
struct Args {
    /// Producer threads
    #[arg(short, long, default_value_t = 10, env = "BRRTM_BENCH_PRODUCERS")]
    producers: usize,

    /// Requests per producer
    #[arg(short, long, default_value_t = 100_000)]
    requests: usize,

    /// Ring slots per lane
    #[arg(short, long, default_value_t = 1024)]
    capacity: usize,

    /// Consumer threads (lanes)
    #[arg(long, default_value_t = 1)]
    consumers: usize,

    #[arg(long, value_enum, default_value_t = WaitArg::Yielding)]
    wait_strategy: WaitArg,

    #[arg(long, value_enum, default_value_t = BackpressureArg::Block)]
    backpressure: BackpressureArg,

    /// Fire-and-forget instead of blocking dispatch
    #[arg(long = "async", default_value_t = false)]
    fire_and_forget: bool,

    /// Log level
    #[arg(long, default_value = "info", env = "BRRTM_LOG_LEVEL")]
    log_level: String,
}

struct Decrement;

impl Request for Decrement {
    type Response = i64;
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _logging = logging::init_logging(&args.log_level)?;

    let total = i64::try_from(args.producers * args.requests).context("request count overflow")?;
    let counter = Arc::new(AtomicI64::new(total));
    let registry = RegistryBuilder::new()
        .register_fn({
            let counter = Arc::clone(&counter);
            move |_: Decrement| Ok(counter.fetch_sub(1, Ordering::Relaxed) - 1)
        })
        .try_build()?;

    let config = MediatorConfig::from_env()
        .with_capacity(args.capacity)
        .with_consumer_threads(args.consumers)
        .with_wait_strategy(args.wait_strategy.into())
        .with_backpressure(args.backpressure.into())
        // A full ring is expected here; keep producers waiting rather than failing.
        .with_claim_timeout(None);
    let mediator = Mediator::new(registry, config)?;

    info!(
        producers = args.producers,
        requests = args.requests,
        capacity = args.capacity,
        consumers = args.consumers,
        fire_and_forget = args.fire_and_forget,
        "Starting benchmark"
    );

    let started = Instant::now();
    let producers: Vec<_> = (0..args.producers)
        .map(|producer| {
            let mediator = mediator.clone();
            let requests = args.requests;
            let fire_and_forget = args.fire_and_forget;
            thread::Builder::new()
                .name(format!("producer-{producer}"))
                .spawn(move || -> Result<u64, DispatchError> {
                    let mut rejected = 0;
                    for _ in 0..requests {
                        let outcome = if fire_and_forget {
                            mediator.dispatch_async(Decrement)
                        } else {
                            mediator.dispatch_blocking(Decrement).map(|_| ())
                        };
                        match outcome {
                            Ok(()) => {}
                            // Shed submissions never reach the handler.
                            Err(DispatchError::Capacity { .. }) => rejected += 1,
                            Err(err) => return Err(err),
                        }
                    }
                    Ok(rejected)
                })
                .context("failed to spawn producer thread")
        })
        .collect::<Result<_>>()?;

    let mut rejected = 0u64;
    for producer in producers {
        match producer.join() {
            Ok(result) => rejected += result?,
            Err(_) => bail!("producer thread panicked"),
        }
    }
    let submitted = started.elapsed();

    // Drains every accepted request before returning.
    mediator.shutdown();
    let elapsed = started.elapsed();

    let metrics = mediator.metrics().totals();
    let remaining = counter.load(Ordering::SeqCst);
    let per_sec = metrics.completed as f64 / elapsed.as_secs_f64().max(f64::EPSILON);

    println!("requests:     {total}");
    println!("completed:    {}", metrics.completed);
    println!("failed:       {}", metrics.failed);
    println!("rejected:     {rejected}");
    println!("submit time:  {:?}", submitted);
    println!("total time:   {:?}", elapsed);
    println!("throughput:   {per_sec:.0} req/s");
    if let Some(mean) = metrics.mean_handler_time_us() {
        println!("handler mean: {:?}", Duration::from_micros(mean));
    }
    println!("counter:      {remaining}");

    if remaining != i64::try_from(rejected).unwrap_or(i64::MAX) {
        warn!(remaining, rejected, "Counter does not match rejected submissions");
        bail!("expected counter {rejected}, found {remaining}");
    }
    Ok(())
}
