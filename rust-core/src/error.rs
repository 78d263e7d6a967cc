//! Error types for the trip detection engine.
//!
//! The engine's event entry point never fails: collaborator errors are logged
//! and recovered from. These variants surface from configuration loading,
//! collaborator calls, and the async runtime handle.

use thiserror::Error;

/// Main error type for the crate.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration value out of range or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be parsed or serialized.
    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// File I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Trip store rejected an operation.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Region registration failed on the platform.
    #[error("Geofence error: {0}")]
    Geofence(String),

    /// Classification query could not be issued or failed.
    #[error("Classification error: {0}")]
    Classification(String),

    /// Deferred delivery could not be requested.
    #[error("Deferral error: {0}")]
    Deferral(String),

    /// The engine actor has shut down and no longer accepts events.
    #[error("Engine stopped")]
    EngineStopped,
}

/// Result type alias for trip detection operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Geofence("region limit reached".to_string());
        assert_eq!(err.to_string(), "Geofence error: region limit reached");
        assert_eq!(Error::EngineStopped.to_string(), "Engine stopped");
    }

    #[test]
    fn test_io_error_converts() {
        fn open_missing() -> Result<String> {
            Ok(std::fs::read_to_string("/definitely/not/here.yaml")?)
        }
        assert!(matches!(open_missing(), Err(Error::Io(_))));
    }
}
