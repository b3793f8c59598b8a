//! Sensor aggregation: platform sources, fallback chains and the per-cycle snapshot.

pub mod aggregator;
pub mod generic;
pub mod gpu;
pub mod monitor;
pub mod network;
pub mod source;
pub mod units;

pub use aggregator::SensorAggregator;
pub use gpu::{GpuSelection, GpuVendor};
pub use network::{InterfaceCounterSample, NetworkRateTracker};
pub use source::MetricSource;

use serde::ser::{SerializeTuple, Serializer};
use serde::Serialize;
use units::{DEGREE, GIGABYTES, KILOBYTES_PER_SEC, MEGABYTES, PERCENT};

/// Placeholder emitted for a value no source could produce.
pub const UNAVAILABLE: &str = "-";

/// A measurement, or the explicit absence of one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// Rounded to the nearest integer
    Whole(i64),
    /// Rounded to one decimal place
    Tenths(f64),
    Unavailable,
}

impl Reading {
    pub fn is_available(&self) -> bool {
        !matches!(self, Reading::Unavailable)
    }
}

/// A reading paired with its unit label. Serializes as `[value, unit]`,
/// with `"-"` standing in for an unavailable value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitValue {
    pub reading: Reading,
    /// Display label (e.g. "%", "MB")
    pub unit: &'static str,
}

impl UnitValue {
    pub fn unavailable(unit: &'static str) -> Self {
        Self {
            reading: Reading::Unavailable,
            unit,
        }
    }

    /// Rounded to the nearest integer.
    pub fn whole(value: Option<f64>, unit: &'static str) -> Self {
        let reading = match value {
            Some(v) if v.is_finite() => Reading::Whole(v.round() as i64),
            _ => Reading::Unavailable,
        };
        Self { reading, unit }
    }

    /// Rounded to one decimal place.
    pub fn tenths(value: Option<f64>, unit: &'static str) -> Self {
        let reading = match value {
            Some(v) if v.is_finite() => Reading::Tenths(units::round_tenths(v)),
            _ => Reading::Unavailable,
        };
        Self { reading, unit }
    }
}

impl Serialize for UnitValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(2)?;
        match self.reading {
            Reading::Whole(v) => tuple.serialize_element(&v)?,
            Reading::Tenths(v) => tuple.serialize_element(&v)?,
            Reading::Unavailable => tuple.serialize_element(UNAVAILABLE)?,
        }
        tuple.serialize_element(self.unit)?;
        tuple.end()
    }
}

/// CPU group of the payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CpuStats {
    /// Overall utilization in percent
    pub usage: UnitValue,
    /// Package temperature in degrees
    pub temperature: UnitValue,
}

impl Default for CpuStats {
    fn default() -> Self {
        Self {
            usage: UnitValue::unavailable(PERCENT),
            temperature: UnitValue::unavailable(DEGREE),
        }
    }
}

/// GPU group of the payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuStats {
    /// Video memory in use across all devices, percent
    pub usage: UnitValue,
    /// Mean core temperature in degrees
    pub temperature: UnitValue,
}

impl Default for GpuStats {
    fn default() -> Self {
        Self {
            usage: UnitValue::unavailable(PERCENT),
            temperature: UnitValue::unavailable(DEGREE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    /// Swap usage in percent
    #[serde(rename = "swap")]
    pub swap_pct: UnitValue,
    /// Physical memory usage in percent
    #[serde(rename = "usage")]
    pub usage_pct: UnitValue,
    /// Available memory in MB
    pub free: UnitValue,
    /// Used memory in MB
    pub used: UnitValue,
}

impl Default for MemoryStats {
    fn default() -> Self {
        Self {
            swap_pct: UnitValue::unavailable(PERCENT),
            usage_pct: UnitValue::unavailable(PERCENT),
            free: UnitValue::unavailable(MEGABYTES),
            used: UnitValue::unavailable(MEGABYTES),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskStats {
    /// Used share of the user-available space, percent
    #[serde(rename = "usage")]
    pub usage_pct: UnitValue,
    /// Filesystem size in GB
    pub total: UnitValue,
    /// Used space in GB
    pub used: UnitValue,
    /// Available space in GB
    pub free: UnitValue,
}

impl Default for DiskStats {
    fn default() -> Self {
        Self {
            usage_pct: UnitValue::unavailable(PERCENT),
            total: UnitValue::unavailable(GIGABYTES),
            used: UnitValue::unavailable(GIGABYTES),
            free: UnitValue::unavailable(GIGABYTES),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkStats {
    /// Transmit throughput in KB/s
    #[serde(rename = "up_rate")]
    pub upload_rate: UnitValue,
    /// Receive throughput in KB/s
    #[serde(rename = "dl_rate")]
    pub download_rate: UnitValue,
    /// Bytes transmitted since boot, in MB
    #[serde(rename = "uploaded")]
    pub uploaded_total: UnitValue,
    /// Bytes received since boot, in MB
    #[serde(rename = "downloaded")]
    pub downloaded_total: UnitValue,
}

impl Default for NetworkStats {
    fn default() -> Self {
        Self {
            upload_rate: UnitValue::unavailable(KILOBYTES_PER_SEC),
            download_rate: UnitValue::unavailable(KILOBYTES_PER_SEC),
            uploaded_total: UnitValue::unavailable(MEGABYTES),
            downloaded_total: UnitValue::unavailable(MEGABYTES),
        }
    }
}

/// One sampling cycle's worth of telemetry, in wire shape.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorSnapshot {
    #[serde(rename = "CPU")]
    pub cpu: CpuStats,
    #[serde(rename = "GPU")]
    pub gpu: GpuStats,
    #[serde(rename = "Memory")]
    pub memory: MemoryStats,
    #[serde(rename = "Disk")]
    pub disk: DiskStats,
    #[serde(rename = "Network")]
    pub network: NetworkStats,
    #[serde(rename = "Target")]
    pub target_address: String,
    #[serde(rename = "IP")]
    pub local_address: String,
}

impl SensorSnapshot {
    /// UTF-8 JSON document sent as a single datagram.
    pub fn to_payload(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}
