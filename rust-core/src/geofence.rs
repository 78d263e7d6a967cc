//! Geofence ring manager.
//!
//! While idle the engine relies on the platform to wake it. Around the last
//! known stationary point it installs one large exit-triggered backup region
//! plus a ring of small enter-triggered regions. Leaving the point in any
//! direction either exits the backup or enters a ring region.
//!
//! At most one set is installed at a time, and installing always tears the
//! previous set down first.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::GeofenceConfig;
use crate::platform::LocationServices;
use crate::types::Coordinate;

/// Which boundary crossing a region reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionTrigger {
    Enter,
    Exit,
}

/// A circular monitored region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceRegion {
    pub center: Coordinate,
    pub radius_m: f64,
    pub identifier: String,
    pub trigger: RegionTrigger,
}

/// Boundary crossing reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionEventKind {
    Enter,
    Exit,
}

/// Build the backup region followed by the ring regions around `center`.
///
/// Ring region `i` sits at angle `i * 2π / N` measured from due north, on a
/// circle of `ring_offset_degrees`.
pub fn ring_around(center: Coordinate, config: &GeofenceConfig) -> Vec<GeofenceRegion> {
    let count = config.ring_region_count;
    let offset = config.ring_offset_degrees;
    let theta = 2.0 * std::f64::consts::PI / count as f64;

    let mut regions = Vec::with_capacity(count + 1);
    regions.push(GeofenceRegion {
        center,
        radius_m: config.backup_radius_m,
        identifier: config.backup_identifier.clone(),
        trigger: RegionTrigger::Exit,
    });

    for i in 0..count {
        let angle = theta * i as f64;
        regions.push(GeofenceRegion {
            center: Coordinate::new(
                center.latitude + offset * angle.cos(),
                center.longitude - offset * angle.sin(),
            ),
            radius_m: config.ring_region_radius_m,
            identifier: format!("{}{}", config.ring_identifier_prefix, i),
            trigger: RegionTrigger::Enter,
        });
    }

    regions
}

/// Tracks the installed set on behalf of the engine.
#[derive(Debug, Clone)]
pub struct GeofenceManager {
    config: GeofenceConfig,
    installed: Vec<GeofenceRegion>,
    center: Option<Coordinate>,
}

impl GeofenceManager {
    pub fn new(config: GeofenceConfig) -> Self {
        Self {
            config,
            installed: Vec::new(),
            center: None,
        }
    }

    pub fn installed(&self) -> &[GeofenceRegion] {
        &self.installed
    }

    pub fn installed_count(&self) -> usize {
        self.installed.len()
    }

    pub fn center(&self) -> Option<Coordinate> {
        self.center
    }

    /// Tear down any existing set, then install a fresh ring around `center`.
    ///
    /// Returns false when registration failed; the engine then falls back to
    /// coarse location wake-ups.
    pub fn install(&mut self, center: Coordinate, location: &mut dyn LocationServices) -> bool {
        self.teardown(location);

        let regions = ring_around(center, &self.config);
        match location.install_geofences(&regions) {
            Ok(()) => {
                info!(
                    "Installed {} geofences around ({:.5}, {:.5})",
                    regions.len(),
                    center.latitude,
                    center.longitude
                );
                self.installed = regions;
                self.center = Some(center);
                true
            }
            Err(e) => {
                warn!("Geofence registration failed, relying on coarse wake-ups: {}", e);
                location.teardown_geofences();
                false
            }
        }
    }

    pub fn teardown(&mut self, location: &mut dyn LocationServices) {
        if !self.installed.is_empty() {
            debug!("Tearing down {} geofences", self.installed.len());
        }
        location.teardown_geofences();
        self.installed.clear();
        self.center = None;
    }

    /// Ring enters and backup exits wake the engine; anything else is noise
    /// (including exits from ring regions and regions we do not own).
    pub fn is_wake_event(&self, identifier: &str, kind: RegionEventKind) -> bool {
        match kind {
            RegionEventKind::Enter => identifier.starts_with(&self.config.ring_identifier_prefix),
            RegionEventKind::Exit => identifier == self.config.backup_identifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::haversine_m;
    use crate::simulation::RecordingLocationServices;

    fn center() -> Coordinate {
        Coordinate::new(45.5231, -122.6765)
    }

    #[test]
    fn test_ring_cardinality() {
        let config = GeofenceConfig::default();
        let regions = ring_around(center(), &config);
        assert_eq!(regions.len(), config.ring_region_count + 1);
        assert_eq!(regions[0].identifier, config.backup_identifier);
        assert_eq!(regions[0].trigger, RegionTrigger::Exit);
        assert!(regions[1..].iter().all(|r| r.trigger == RegionTrigger::Enter));
    }

    #[test]
    fn test_first_ring_region_is_due_north() {
        let config = GeofenceConfig::default();
        let regions = ring_around(center(), &config);
        let first = regions[1].center;
        assert!((first.latitude - (center().latitude + config.ring_offset_degrees)).abs() < 1e-12);
        assert!((first.longitude - center().longitude).abs() < 1e-12);
    }

    #[test]
    fn test_ring_regions_equidistant_in_degrees() {
        let config = GeofenceConfig::default();
        for region in &ring_around(center(), &config)[1..] {
            let dlat = region.center.latitude - center().latitude;
            let dlon = region.center.longitude - center().longitude;
            let r = (dlat * dlat + dlon * dlon).sqrt();
            assert!((r - config.ring_offset_degrees).abs() < 1e-12);
        }
    }

    #[test]
    fn test_ring_regions_outside_backup() {
        let config = GeofenceConfig::default();
        let regions = ring_around(center(), &config);
        for region in &regions[1..] {
            assert!(haversine_m(center(), region.center) > config.backup_radius_m);
        }
    }

    #[test]
    fn test_install_replaces_previous_set() {
        let services = RecordingLocationServices::new();
        let mut boxed: Box<dyn LocationServices> = Box::new(services.clone());
        let mut manager = GeofenceManager::new(GeofenceConfig::default());

        assert!(manager.install(center(), boxed.as_mut()));
        assert_eq!(manager.installed_count(), 10);
        assert!(manager.install(Coordinate::new(45.6, -122.7), boxed.as_mut()));
        assert_eq!(manager.installed_count(), 10);
        assert_eq!(services.geofence_count(), 10);
        assert!(services.teardown_always_preceded_install());

        manager.teardown(boxed.as_mut());
        assert_eq!(manager.installed_count(), 0);
        assert_eq!(services.geofence_count(), 0);
    }

    #[test]
    fn test_registration_failure_leaves_nothing_installed() {
        let services = RecordingLocationServices::new();
        services.fail_geofence_registration(true);
        let mut boxed: Box<dyn LocationServices> = Box::new(services.clone());
        let mut manager = GeofenceManager::new(GeofenceConfig::default());

        assert!(!manager.install(center(), boxed.as_mut()));
        assert_eq!(manager.installed_count(), 0);
        assert_eq!(services.geofence_count(), 0);
    }

    #[test]
    fn test_wake_event_filtering() {
        let config = GeofenceConfig::default();
        let manager = GeofenceManager::new(config.clone());
        let ring_id = format!("{}3", config.ring_identifier_prefix);

        assert!(manager.is_wake_event(&ring_id, RegionEventKind::Enter));
        assert!(!manager.is_wake_event(&ring_id, RegionEventKind::Exit));
        assert!(manager.is_wake_event(&config.backup_identifier, RegionEventKind::Exit));
        assert!(!manager.is_wake_event(&config.backup_identifier, RegionEventKind::Enter));
        assert!(!manager.is_wake_event("someone-else", RegionEventKind::Exit));
    }
}
