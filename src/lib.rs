//! Host telemetry sampler.
//!
//! Each cycle the [`metrics::SensorAggregator`] builds a [`metrics::SensorSnapshot`]
//! from an ordered list of platform sources, and the [`transport::TelemetryTransport`]
//! sends it as one JSON datagram and waits for the receiver's acknowledgement.
//! [`collector::Collector`] runs that cycle on a background thread.

pub mod collector;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod transport;

pub use collector::{Collector, CollectorHandle, CollectorOptions};
pub use config::{Destination, SavedTarget, Settings};
pub use error::{ConfigError, TransportError};
pub use logging::{StatusEvent, StatusLine, StatusLog};
pub use transport::{DeliveryOutcome, TelemetryTransport, TransportConfig};
