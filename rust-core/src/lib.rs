//! Trip Detection Engine Library
//!
//! Decides, continuously and without user interaction, whether a person is on
//! a trip, from a trickle of imprecise location fixes and periodic motion
//! snapshots, while keeping power draw low.
//!
//! # Design Philosophy
//!
//! - **One state at a time**: Idle, Monitoring or Active, held in a single
//!   tagged union. Entering a state releases the resources of the others.
//! - **Stale results cannot mutate state**: classification completions carry
//!   a generation token and are only readable through "apply if current".
//! - **Power first**: geofences while idle, moderate updates while deciding,
//!   full GPS with deferred delivery only once a trip is confirmed.
//! - **Collaborators at the edges**: storage, location services, the
//!   classifier and the clock are traits handed in at construction.
//!
//! # Example
//!
//! ```ignore
//! use trip_detection::{EngineConfig, EngineEvent, TripEngine};
//! use trip_detection::gate::AuthorizationStatus;
//! use trip_detection::simulation::SimulatedPlatform;
//!
//! let platform = SimulatedPlatform::new();
//! let mut engine = TripEngine::new(EngineConfig::default(), platform.collaborators())?;
//! engine.start();
//! engine.handle_event(EngineEvent::Authorization(AuthorizationStatus::Authorized));
//! ```

pub mod active;
pub mod classification;
pub mod config;
pub mod deferral;
pub mod engine;
pub mod error;
pub mod events;
pub mod gate;
pub mod geofence;
pub mod geometry;
pub mod lifecycle;
pub mod monitoring;
pub mod platform;
pub mod runtime;
pub mod simulation;
pub mod transitions;
pub mod trip;
pub mod types;
pub mod vote;


// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::{EngineSnapshot, TrackingState, TripEngine};
pub use error::{Error, Result};
pub use events::{EngineEvent, EngineNotification, TripObserver};
pub use platform::{ClassificationService, Clock, Collaborators, LocationServices, TrackingMode, TripStore};
pub use runtime::{AsyncClassifier, EngineHandle, EngineRuntime, SpawningClassificationService};
pub use trip::{Trip, TripSummary};
pub use types::{
    ActivityType, ClassificationResult, Coordinate, LocationSample, MotionReading, TrackingStateKind, TripHandle,
};
