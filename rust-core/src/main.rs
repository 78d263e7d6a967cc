//! Trip detection replay tool.
//!
//! Runs the engine on the async runtime against simulated platform services
//! and replays a scripted commute: a stationary start at home, a geofence
//! wake-up, a bike ride north and a stop at the destination. Every
//! notification the engine emits is printed as one JSON line.

use std::time::Duration as StdDuration;

use chrono::Duration;
use clap::Parser;
use log::{info, warn};
use tokio::sync::broadcast::{self, error::TryRecvError};

use trip_detection::gate::AuthorizationStatus;
use trip_detection::geofence::RegionEventKind;
use trip_detection::simulation::{northbound_track, stationary_fixes, SimulatedPlatform};
use trip_detection::{
    Clock, Collaborators, Coordinate, EngineConfig, EngineEvent, EngineHandle, EngineNotification, EngineRuntime,
    LocationSample, Result, SpawningClassificationService, TripEngine,
};
use trip_detection::runtime::SpeedHeuristicClassifier;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML format)
    #[arg(short = 'C', long)]
    config: Option<String>,

    /// Print the effective configuration as YAML and exit
    #[arg(long)]
    dump_config: bool,

    /// Length of the simulated ride in seconds
    #[arg(long, default_value = "600")]
    ride_secs: usize,

    /// Ride speed in m/s
    #[arg(long, default_value = "5.0")]
    speed: f64,

    /// Classifier timeout in milliseconds
    #[arg(long, default_value = "2000")]
    classifier_timeout_ms: u64,

    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.verbose {
        env_logger::init_from_env(env_logger::Env::new().default_filter_or("debug"));
    } else {
        env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));
    }

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path);
            EngineConfig::from_file(path)?
        }
        None => EngineConfig::default(),
    };

    if args.dump_config {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    let platform = SimulatedPlatform::new();
    let runtime = EngineRuntime::new();
    let handle = runtime.handle();
    let mut notifications = handle.subscribe();

    let classifier = SpawningClassificationService::new(
        SpeedHeuristicClassifier {
            moving_speed_floor: config.location.moving_speed_floor,
        },
        handle.clone(),
        StdDuration::from_millis(args.classifier_timeout_ms),
    )?;
    let collab = Collaborators::new(
        Box::new(platform.store.clone()),
        Box::new(platform.location.clone()),
        Box::new(classifier),
        Box::new(platform.clock.clone()),
    );
    let backup_identifier = config.geofence.backup_identifier.clone();
    let engine = TripEngine::new(config, collab)?;
    let task = runtime.spawn(engine);

    let home = Coordinate::new(51.5072, -0.1276);
    let start = platform.clock.now();

    handle.send(EngineEvent::BatteryLevel(0.85))?;
    handle.send(EngineEvent::Authorization(AuthorizationStatus::Authorized))?;
    settle(&handle, &mut notifications).await?;

    info!("Sitting at home");
    let sitting = stationary_fixes(home, start + Duration::seconds(1), 30, 2, 0.0);
    replay(&platform, &handle, &mut notifications, &sitting, 5).await?;

    info!("Leaving home");
    platform.clock.advance(Duration::minutes(20));
    handle.send(EngineEvent::Geofence {
        identifier: backup_identifier,
        kind: RegionEventKind::Exit,
    })?;
    settle(&handle, &mut notifications).await?;

    let ride = northbound_track(
        home,
        platform.clock.now() + Duration::seconds(1),
        args.ride_secs,
        1,
        args.speed,
        args.speed,
    );
    replay(&platform, &handle, &mut notifications, &ride, 10).await?;

    let Some(arrival) = ride.last() else {
        warn!("Empty ride, nothing to replay");
        return Ok(());
    };
    info!("Arrived");
    let parked = stationary_fixes(arrival.coordinate, arrival.timestamp + Duration::seconds(1), 240, 1, 0.0);
    replay(&platform, &handle, &mut notifications, &parked, 10).await?;

    let snapshot = handle.snapshot().await?;
    println!("{}", serde_json::to_string(&snapshot).unwrap_or_default());
    handle.shutdown()?;
    if let Err(e) = task.await {
        warn!("Engine task ended abnormally: {}", e);
    }

    for trip in platform.store.closed_trips() {
        println!("{}", serde_json::to_string(&trip.summary()).unwrap_or_default());
    }
    Ok(())
}

/// Deliver `fixes` in batches, advancing the simulated clock with each one.
async fn replay(
    platform: &SimulatedPlatform,
    handle: &EngineHandle,
    notifications: &mut broadcast::Receiver<EngineNotification>,
    fixes: &[LocationSample],
    batch: usize,
) -> Result<()> {
    for chunk in fixes.chunks(batch.max(1)) {
        if let Some(latest) = chunk.iter().map(|s| s.timestamp).max() {
            platform.clock.set(latest);
        }
        handle.send(EngineEvent::Locations(chunk.to_vec()))?;
        settle(handle, notifications).await?;
    }
    Ok(())
}

/// Let queued events and any classifier completions they triggered drain,
/// then print what the engine reported.
async fn settle(handle: &EngineHandle, notifications: &mut broadcast::Receiver<EngineNotification>) -> Result<()> {
    handle.snapshot().await?;
    tokio::task::yield_now().await;
    handle.snapshot().await?;

    loop {
        match notifications.try_recv() {
            Ok(notification) => match serde_json::to_string(&notification) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Could not encode notification: {}", e),
            },
            Err(TryRecvError::Lagged(skipped)) => warn!("Skipped {} notifications", skipped),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
        }
    }
    Ok(())
}
