/// Battery monitoring example: low battery ends a trip and keeps tracking off until it recovers
use chrono::Duration;
use trip_detection::gate::AuthorizationStatus;
use trip_detection::simulation::{northbound_track, NotificationLog, SimulatedPlatform};
use trip_detection::{
    ActivityType, ClassificationResult, Clock, Coordinate, EngineConfig, EngineEvent, EngineNotification, TripEngine,
};

fn main() -> trip_detection::Result<()> {
    println!("=== Trip Detection Engine: Battery Monitoring Example ===\n");

    let config = EngineConfig::default();
    println!("Low battery threshold: {:.0}%\n", config.gate.low_battery_threshold * 100.0);

    let platform = SimulatedPlatform::new();
    let log = NotificationLog::new();
    let mut engine = TripEngine::new(config, platform.collaborators())?;
    engine.subscribe(Box::new(log.clone()));
    engine.start();
    engine.handle_event(EngineEvent::BatteryLevel(0.35));
    engine.handle_event(EngineEvent::Authorization(AuthorizationStatus::Authorized));

    let origin = Coordinate::new(40.7128, -74.0060);
    let drive = northbound_track(origin, platform.clock.now() + Duration::seconds(1), 300, 1, 12.0, 12.0);

    let mut battery = 0.35;
    for (i, chunk) in drive.chunks(20).enumerate() {
        if let Some(last) = chunk.last() {
            platform.clock.set(last.timestamp);
        }
        engine.handle_event(EngineEvent::Locations(chunk.to_vec()));
        if i == 0 {
            if let Some(event) = platform
                .classifier
                .complete_last(ClassificationResult::new(ActivityType::Automotive, 0.92, 12.0, 12.0))
            {
                engine.handle_event(event);
            }
        }

        battery -= 0.02;
        engine.handle_event(EngineEvent::BatteryLevel(battery));
        println!(
            "Battery {:>3.0}%  state {:?}  tracking allowed: {}",
            battery * 100.0,
            engine.state_kind(),
            engine.gate().is_tracking_allowed()
        );
    }

    println!("\nCharging...");
    engine.handle_event(EngineEvent::BatteryLevel(0.6));
    println!("Battery 60%  state {:?}", engine.state_kind());

    println!("\n=== Summary ===");
    println!(
        "Low battery pauses: {}",
        log.count(|n| *n == EngineNotification::LowBatteryPause)
    );
    for trip in platform.store.closed_trips() {
        println!(
            "Trip {} ({}): {} fixes, battery used {:?}",
            trip.handle,
            trip.activity_type.description(),
            trip.sample_count(),
            trip.battery_used()
        );
    }
    println!("Geofences armed: {}", platform.location.geofence_count());

    Ok(())
}
