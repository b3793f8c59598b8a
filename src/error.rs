//! Errors surfaced at the configuration and socket-setup boundaries.
//!
//! Sensor failures never appear here; they degrade individual fields.
//! Delivery failures are `DeliveryOutcome` values, not errors.

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid destination address {0:?}: expected an IPv4 dotted quad")]
    InvalidAddress(String),
    #[error("invalid setting: {0}")]
    InvalidSetting(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("settings file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open telemetry socket: {0}")]
    Io(#[from] io::Error),
}
