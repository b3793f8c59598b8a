//! Destination validation, runtime settings and the saved-target file.

use crate::error::ConfigError;
use crate::transport::TransportConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// A receiver address that passed dotted-quad validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination(Ipv4Addr);

impl Destination {
    /// Four decimal octets `0`-`255` separated by dots. Octets have no sign,
    /// no whitespace and no leading zero (`01` is rejected, `0` is not).
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let invalid = || ConfigError::InvalidAddress(input.to_string());

        let mut octets = [0u8; 4];
        let mut parts = input.split('.');
        for octet in octets.iter_mut() {
            *octet = parts.next().and_then(parse_octet).ok_or_else(invalid)?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(Ipv4Addr::from(octets)))
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0.is_broadcast()
    }
}

fn parse_octet(part: &str) -> Option<u8> {
    let digits_only = !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    if !digits_only || part.len() > 3 || (part.len() > 1 && part.starts_with('0')) {
        return None;
    }
    part.parse().ok()
}

impl FromStr for Destination {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated runtime settings for one collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub destination: Destination,
    pub port: u16,
    pub interval: Duration,
    pub transport: TransportConfig,
}

impl Settings {
    pub fn new(
        destination: Destination,
        port: u16,
        interval_secs: u64,
        max_retries: u32,
        receive_timeout_secs: u64,
    ) -> Result<Self, ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidSetting("port must be non-zero".into()));
        }
        if interval_secs == 0 {
            return Err(ConfigError::InvalidSetting("interval must be at least 1 second".into()));
        }
        if max_retries == 0 {
            return Err(ConfigError::InvalidSetting("max retries must be at least 1".into()));
        }
        if receive_timeout_secs == 0 {
            return Err(ConfigError::InvalidSetting(
                "receive timeout must be at least 1 second".into(),
            ));
        }
        Ok(Self {
            destination,
            port,
            interval: Duration::from_secs(interval_secs),
            transport: TransportConfig {
                max_retries,
                receive_timeout: Duration::from_secs(receive_timeout_secs),
            },
        })
    }

    /// Worst-case time one cycle spends waiting for replies.
    pub fn max_reply_wait(&self) -> Duration {
        self.transport.receive_timeout * self.transport.max_retries
    }
}

/// The last destination the operator started with, kept between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedTarget {
    pub target: String,
}

impl SavedTarget {
    /// The saved destination, if the file exists and holds a valid address.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Destination>, ConfigError> {
        let path = path.as_ref();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let saved: SavedTarget = serde_json::from_str(&text)?;
        match Destination::parse(&saved.target) {
            Ok(destination) => Ok(Some(destination)),
            Err(e) => {
                log::warn!("Ignoring saved target in {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    pub fn save<P: AsRef<Path>>(path: P, destination: &Destination) -> Result<(), ConfigError> {
        let saved = SavedTarget {
            target: destination.to_string(),
        };
        fs::write(path, serde_json::to_string_pretty(&saved)?)?;
        Ok(())
    }
}
