//! Error types for the autonomia_core library.

use std::io;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for autonomia_core operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// CSV error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Configuration validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rowing machine replied with something we can't use
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// Wireless stack failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Heart-rate packet could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// Recorded log has a shape we don't know how to read
    #[error("Schema error: {0}")]
    Schema(String),

    /// Explicit phase change that the state machine does not allow
    #[error("Phase error: {0}")]
    Phase(String),

    /// Bridge worker could not be spawned or joined
    #[error("Worker error: {0}")]
    Worker(String),
}
