use anyhow::{Context, Result};
use capture_sync::config::AppConfig;
use capture_sync::delivery::{DeliveryChannel, WriterObserver};
use capture_sync::hardware::{SimulatedHardware, SimulationConfig};
use capture_sync::model::{PointKind, Vehicle};
use capture_sync::orchestrator::{CaptureService, NoKeepAlive};
use capture_sync::preferences::{
    restore_or_create_device_id, JsonPreferences, Preferences, SYNC_ENDPOINT_URL_SETTINGS_KEY,
};
use capture_sync::status::CaptureStatus;
use capture_sync::storage::MeasurementStore;
use capture_sync::sync::{
    HttpUploader, ProgressListener, StaticCredentials, SyncEngine, SyncProgress, SyncScheduler,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::time::{interval, Duration, Instant};

/// Lines buffered for `--stream` before a slow reader gets dropped
const STREAM_QUEUE_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "capture_sync")]
#[command(about = "Capture vehicle sensor measurements and upload them to a collector", long_about = None)]
struct Args {
    /// JSON configuration file; missing means defaults
    #[arg(long, default_value = "capture_sync.json")]
    config: PathBuf,

    /// Preferences file holding the endpoint and device identifier
    #[arg(long, default_value = "capture_sync_prefs.json")]
    prefs: PathBuf,

    /// Overrides the database path from the configuration
    #[arg(long)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a measurement from simulated sensors
    Capture {
        #[arg(long, value_enum, default_value = "bicycle")]
        vehicle: Vehicle,

        /// Duration in seconds (0 = until Ctrl-C)
        #[arg(long, default_value = "0")]
        seconds: u64,

        /// Write every capture message as a JSON line to stdout
        #[arg(long)]
        stream: bool,

        /// Where the live status snapshot is written once per second
        #[arg(long, default_value = "capture_status.json")]
        status: PathBuf,
    },
    /// Upload finished measurements
    Sync {
        #[arg(long, default_value = "default")]
        account: String,

        /// Bearer token for the collector
        #[arg(long)]
        token: Option<String>,

        /// Collector base URL; stored in the preferences for later runs
        #[arg(long)]
        endpoint: Option<String>,

        /// Keep running cycles at the configured interval until Ctrl-C
        #[arg(long)]
        watch: bool,
    },
    /// List stored measurements
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)
        .with_context(|| format!("Failed to load config {:?}", args.config))?;
    if let Some(database) = args.database {
        config.storage.database_path = database;
    }
    let prefs = Arc::new(
        JsonPreferences::open(args.prefs.clone())
            .with_context(|| format!("Failed to open preferences {:?}", args.prefs))?,
    );
    let device_id = restore_or_create_device_id(&*prefs)?;
    let store = Arc::new(
        MeasurementStore::open(&config.storage.database_path, &config.storage)
            .with_context(|| format!("Failed to open {:?}", config.storage.database_path))?
            .with_device_id(device_id),
    );

    match args.command {
        Command::Capture {
            vehicle,
            seconds,
            stream,
            status,
        } => capture(config, store, vehicle, seconds, stream, status).await,
        Command::Sync {
            account,
            token,
            endpoint,
            watch,
        } => {
            if let Some(endpoint) = endpoint {
                prefs.set_string(SYNC_ENDPOINT_URL_SETTINGS_KEY, &endpoint)?;
            }
            sync(config, store, prefs, account, token, watch).await
        }
        Command::List => list(&store),
    }
}

async fn capture(
    config: AppConfig,
    store: Arc<MeasurementStore>,
    vehicle: Vehicle,
    seconds: u64,
    stream: bool,
    status_path: PathBuf,
) -> Result<()> {
    if let Some(open) = store.open_measurement()? {
        anyhow::bail!("Measurement {} is still open; only one capture may run at a time", open);
    }
    let id = store.create_measurement(vehicle)?;
    println!("[{}] Capturing measurement {} ({})", ts_now(), id, vehicle.as_str());

    let delivery = Arc::new(DeliveryChannel::new());
    let hardware = SimulatedHardware::new(SimulationConfig::default(), &config.capture);
    let (service, task) = CaptureService::spawn(
        store.clone(),
        delivery,
        Box::new(hardware),
        Box::new(NoKeepAlive),
        config.capture.clone(),
    );
    if stream {
        let stdout = WriterObserver::new(
            "stdout",
            std::io::stdout(),
            STREAM_QUEUE_CAPACITY,
            config.capture.observer_send_timeout(),
        )?;
        service.register_observer(Arc::new(stdout)).await?;
    }
    service.start(id).await?;

    let started = Instant::now();
    let mut ticker = interval(Duration::from_secs(1));
    let mut degraded = false;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let elapsed = started.elapsed().as_secs();
                let snapshot = service.ping(config.capture.pause_resume_timeout()).await?;
                let status = CaptureStatus::from_service(&snapshot, elapsed);
                if !status.is_healthy() && !degraded {
                    log::warn!(
                        "Capture degraded: {} persistence failures, {} capture failures",
                        status.persistence_failures,
                        status.capture_failures
                    );
                    degraded = true;
                }
                if let Err(e) = status.save(&status_path) {
                    log::warn!("Failed to write status {:?}: {}", status_path, e);
                }
                if seconds > 0 && elapsed >= seconds {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("[{}] Interrupted", ts_now());
                break;
            }
        }
    }

    let report = service
        .stop()
        .await?
        .wait_timeout(config.capture.pause_resume_timeout())
        .await?;
    println!(
        "[{}] Measurement {} stopped (finished: {}, persistence failures: {})",
        ts_now(),
        report.measurement_id,
        report.success,
        report.persistence_failures
    );
    let mut samples = 0;
    for kind in PointKind::ALL {
        samples += store.count_samples(id, kind)?;
    }
    println!("  Locations: {}, samples: {}", store.count_locations(id)?, samples);

    service.shutdown().await?;
    task.await?;
    Ok(())
}

async fn sync(
    config: AppConfig,
    store: Arc<MeasurementStore>,
    prefs: Arc<JsonPreferences>,
    account: String,
    token: Option<String>,
    watch: bool,
) -> Result<()> {
    let progress: ProgressListener = Arc::new(|p: SyncProgress| {
        log::info!("Measurement {}: {:.0}%", p.measurement_id, p.fraction * 100.0);
    });
    let engine = Arc::new(SyncEngine::new(
        store,
        prefs,
        Arc::new(StaticCredentials(token)),
        Arc::new(HttpUploader::new(&config.sync)?),
        config.sync.clone(),
    ));

    if watch {
        let scheduler = SyncScheduler::spawn(engine, account, config.sync.cycle_interval(), progress);
        tokio::signal::ctrl_c().await?;
        let cycles = scheduler.shutdown().await;
        println!("[{}] Ran {} sync cycles", ts_now(), cycles);
        return Ok(());
    }

    let report = engine.run_cycle(&account, progress).await?;
    println!(
        "[{}] Synced {} measurements ({} already on the collector)",
        ts_now(),
        report.synced.len(),
        report.already_present.len()
    );
    if let Some(failure) = report.aborted {
        if failure.error.requires_reauthentication() {
            anyhow::bail!(
                "Sync stopped at measurement {}: {} (pass a valid --token)",
                failure.measurement_id,
                failure.error
            );
        }
        anyhow::bail!(
            "Sync stopped at measurement {}: {}",
            failure.measurement_id,
            failure.error
        );
    }
    Ok(())
}

fn list(store: &MeasurementStore) -> Result<()> {
    let measurements = store.load_measurements()?;
    if measurements.is_empty() {
        println!("No measurements");
        return Ok(());
    }
    for m in measurements {
        println!(
            "  {:>5}  {:<10} {:<9} {:>7} locations",
            m.id.0,
            m.vehicle.as_str(),
            m.status.as_str(),
            store.count_locations(m.id)?
        );
    }
    Ok(())
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}
