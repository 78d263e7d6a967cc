/// Basic usage example: drive the engine by hand through one short bike ride
use chrono::Duration;
use trip_detection::gate::AuthorizationStatus;
use trip_detection::simulation::{northbound_track, stationary_fixes, NotificationLog, SimulatedPlatform};
use trip_detection::{
    ActivityType, ClassificationResult, Clock, Coordinate, EngineConfig, EngineEvent, LocationSample, TripEngine,
};

fn deliver(platform: &SimulatedPlatform, engine: &mut TripEngine, fixes: Vec<LocationSample>) {
    if let Some(latest) = fixes.iter().map(|s| s.timestamp).max() {
        platform.clock.set(latest);
    }
    engine.handle_event(EngineEvent::Locations(fixes));
}

fn main() -> trip_detection::Result<()> {
    println!("=== Trip Detection Engine: Basic Usage Example ===\n");

    let platform = SimulatedPlatform::new();
    let log = NotificationLog::new();
    let mut engine = TripEngine::new(EngineConfig::default(), platform.collaborators())?;
    engine.subscribe(Box::new(log.clone()));

    engine.start();
    engine.handle_event(EngineEvent::BatteryLevel(0.8));
    engine.handle_event(EngineEvent::Authorization(AuthorizationStatus::Authorized));
    println!("After authorization: {:?}", engine.state_kind());

    // Phase 1: start riding, the classifier confirms cycling
    let start = Coordinate::new(48.8566, 2.3522);
    let ride = northbound_track(start, platform.clock.now() + Duration::seconds(1), 120, 1, 5.0, 5.0);
    deliver(&platform, &mut engine, ride[..10].to_vec());
    if let Some(event) = platform
        .classifier
        .complete_last(ClassificationResult::new(ActivityType::Cycling, 0.9, 5.0, 5.0))
    {
        engine.handle_event(event);
    }
    println!("After first classification: {:?}", engine.state_kind());

    // Phase 2: keep riding
    for chunk in ride[10..].chunks(10) {
        deliver(&platform, &mut engine, chunk.to_vec());
    }
    if let Some(trip) = engine.current_trip() {
        println!("Trip {}: {} fixes so far", trip.handle, trip.sample_count());
    }

    // Phase 3: stop at a red light that never turns green
    if let Some(end) = ride.last() {
        let parked = stationary_fixes(end.coordinate, end.timestamp + Duration::seconds(1), 90, 1, 0.0);
        for chunk in parked.chunks(10) {
            deliver(&platform, &mut engine, chunk.to_vec());
        }
    }
    println!("After stopping: {:?}", engine.state_kind());
    println!("Geofences armed: {}", engine.geofences().installed_count());

    println!("\n=== Notifications ===");
    for notification in log.all() {
        println!("  {:?}", notification);
    }

    println!("\n=== Stored Trips ===");
    for trip in platform.store.closed_trips() {
        let summary = trip.summary();
        println!(
            "  {} {}: {:.0}m, {} fixes",
            summary.handle,
            summary.activity_type.description(),
            summary.length_m,
            summary.sample_count
        );
    }

    Ok(())
}
