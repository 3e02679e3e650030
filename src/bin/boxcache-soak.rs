//! boxcache soak tester
//!
//! Drives an eviction buffer the way a binning job does: worker threads pick
//! random event boxes, pin the ones no other worker holds, append events and let go, while the budget
//! forces boxes in and out of the backing file. At the end every box is
//! reloaded and its event count checked against what the workers appended.
//!
//! # CLI Commands
//!
//! - `run` - Run the workload (default if no command specified)
//! - `check-config` - Validate the configuration and print it
//!
//! # Configuration
//!
//! Read from `--config` (TOML) when given, otherwise from the defaults, then
//! overridden by `BOXCACHE_*` environment variables and finally by flags.

use boxcache::units::{DetectorEvent, EventBox};
use boxcache::{CacheConfig, CacheSession, EvictionMode, UnitRef};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "boxcache-soak")]
#[command(version)]
#[command(about = "Concurrent soak test for the boxcache eviction buffer", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override memory budget in bytes
    #[arg(short, long, global = true)]
    budget: Option<u64>,

    /// Override eviction mode (on_touch or background)
    #[arg(short, long, global = true)]
    mode: Option<EvictionMode>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workload (default)
    Run {
        /// Directory for the backing file
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Worker threads
        #[arg(short, long, default_value_t = 4)]
        workers: usize,

        /// Number of event boxes
        #[arg(long, default_value_t = 256)]
        boxes: usize,

        /// Pin/append operations per worker
        #[arg(long, default_value_t = 10_000)]
        ops: u64,

        /// Events appended per operation
        #[arg(long, default_value_t = 16)]
        events_per_op: usize,

        /// RNG seed
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },

    /// Validate configuration and print it
    CheckConfig,
}

struct Workload {
    workers: usize,
    boxes: usize,
    ops: u64,
    events_per_op: usize,
    seed: u64,
}

fn load_config(cli: &Cli) -> boxcache::Result<CacheConfig> {
    let mut config = match &cli.config {
        Some(path) => CacheConfig::from_file_with_env(path)?,
        None => CacheConfig::from_env()?,
    };
    if let Some(budget) = cli.budget {
        config.memory_budget_bytes = budget;
    }
    if let Some(mode) = cli.mode {
        config.eviction_mode = mode;
    }
    config.validate()?;
    Ok(config)
}

fn run_workers(session: &CacheSession, units: &[Arc<EventBox>], load: &Workload) -> (u64, u64) {
    let failures = AtomicU64::new(0);
    let contended = AtomicU64::new(0);
    let buffer = session.buffer();

    std::thread::scope(|scope| {
        for worker in 0..load.workers {
            let failures = &failures;
            let contended = &contended;
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(load.seed.wrapping_add(worker as u64));
                for _ in 0..load.ops {
                    let events = &units[rng.random_range(0..units.len())];
                    let unit: UnitRef = events.clone();

                    // Busy is advisory and not counted; skip boxes another worker holds
                    let guard = match buffer.try_pin(&unit) {
                        Ok(Some(guard)) => guard,
                        Ok(None) => {
                            contended.fetch_add(1, Ordering::Relaxed);
                            continue;
                        },
                        Err(e) => {
                            warn!(worker, error = %e, "Pin failed");
                            failures.fetch_add(1, Ordering::Relaxed);
                            continue;
                        },
                    };

                    let batch: Vec<DetectorEvent> = (0..load.events_per_op)
                        .map(|_| {
                            DetectorEvent::new(rng.random_range(0.0..20_000.0), rng.random())
                        })
                        .collect();
                    match events.extend(&batch) {
                        Ok(delta) => {
                            buffer.note_size_changed(guard.unit(), delta);
                        },
                        Err(e) => {
                            warn!(worker, error = %e, "Append failed");
                            failures.fetch_add(1, Ordering::Relaxed);
                        },
                    }
                }
            });
        }
    });

    (failures.load(Ordering::Relaxed), contended.load(Ordering::Relaxed))
}

fn verify(session: &CacheSession, units: &[Arc<EventBox>]) -> boxcache::Result<u64> {
    let mut total = 0u64;
    for events in units {
        let unit: UnitRef = events.clone();
        let guard = session.buffer().pin(&unit)?;
        let resident = events.with_events_ref(|e| e.len() as u64)?;
        if resident != events.len() {
            error!(resident, expected = events.len(), "Event count mismatch after reload");
        }
        total += resident;
        drop(guard);
    }
    session.buffer().check_invariants()?;
    Ok(total)
}

async fn run(cli: &Cli, dir: Option<PathBuf>, load: Workload) -> boxcache::Result<()> {
    let config = load_config(cli)?;
    let dir = dir.unwrap_or_else(|| std::env::temp_dir().join("boxcache-soak"));
    let path = dir.join("soak.bin");

    info!(
        path = %path.display(),
        budget = config.memory_budget_bytes,
        mode = ?config.eviction_mode,
        workers = load.workers,
        boxes = load.boxes,
        "Starting soak"
    );

    let session = Arc::new(CacheSession::create(&path, config)?);
    if session.config().eviction_mode == EvictionMode::Background {
        session.buffer().start_background_eviction()?;
    }

    let units: Arc<Vec<Arc<EventBox>>> =
        Arc::new((0..load.boxes).map(|_| Arc::new(EventBox::new())).collect());

    let started = Instant::now();
    let worker_session = Arc::clone(&session);
    let worker_units = Arc::clone(&units);
    let (failures, contended) = tokio::task::spawn_blocking(move || {
        run_workers(&worker_session, &worker_units, &load)
    })
    .await
    .map_err(|e| boxcache::Error::Configuration(format!("worker pool panicked: {}", e)))?;
    let elapsed = started.elapsed();

    session.buffer().stop_background_eviction().await;
    let events = verify(&session, &units)?;

    let stats = session.buffer().stats().snapshot();
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        events,
        failures,
        contended,
        touches = stats.touches,
        hit_rate = session.buffer().stats().hit_rate(),
        evictions = stats.evictions,
        loads = stats.loads,
        saves = stats.saves,
        budget_misses = stats.budget_misses,
        peak_resident = stats.peak_resident_bytes,
        end_of_file = session.allocator().end_of_file(),
        free_bytes = session.allocator().free_bytes(),
        "Soak finished"
    );

    drop(units);
    let session = Arc::try_unwrap(session).map_err(|_| {
        boxcache::Error::Configuration("session still shared at shutdown".to_string())
    })?;
    session.close()?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    boxcache::metrics::init();

    match cli.command {
        Some(Commands::CheckConfig) => {
            let config = load_config(&cli)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        },
        Some(Commands::Run {
            ref dir,
            workers,
            boxes,
            ops,
            events_per_op,
            seed,
        }) => {
            let load = Workload {
                workers,
                boxes: boxes.max(1),
                ops,
                events_per_op,
                seed,
            };
            run(&cli, dir.clone(), load).await?;
            Ok(())
        },
        None => {
            let load = Workload {
                workers: 4,
                boxes: 256,
                ops: 10_000,
                events_per_op: 16,
                seed: 42,
            };
            run(&cli, None, load).await?;
            Ok(())
        },
    }
}
