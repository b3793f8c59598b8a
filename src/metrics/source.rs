//! The capability surface every platform backend exposes to the aggregator.
//!
//! Readings are returned in raw units (bytes, bytes per second, percent,
//! degrees). Conversion to display units happens once, in the aggregator.

use anyhow::{anyhow, Result};

/// Memory in bytes plus the OS-reported usage percentage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryReading {
    /// Physical memory in use, bytes
    pub used_bytes: f64,
    /// Physical memory available to new allocations, bytes
    pub free_bytes: f64,
    /// Usage as reported by the OS, 0-100
    pub usage_percent: f64,
}

/// Physical and virtual (commit) memory, used to derive swap usage when
/// the OS does not report it directly.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VirtualMemory {
    /// RAM in use
    pub physical_used: f64,
    /// Installed RAM
    pub physical_total: f64,
    /// Committed memory, RAM plus page file
    pub virtual_used: f64,
    /// Commit limit, RAM plus page file
    pub virtual_total: f64,
}

impl VirtualMemory {
    /// `(virtual_used - physical_used) / (virtual_total - physical_total) * 100`,
    /// or `None` when no swap is configured.
    pub fn swap_percent(&self) -> Option<f64> {
        let swap_total = self.virtual_total - self.physical_total;
        if swap_total <= 0.0 || !swap_total.is_finite() {
            return None;
        }
        let swap_used = self.virtual_used - self.physical_used;
        Some(swap_used / swap_total * 100.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SwapReading {
    /// Swap usage percentage straight from the OS.
    Reported(f64),
    /// Counters to derive swap usage from.
    Derived(VirtualMemory),
}

/// Filesystem capacity in bytes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DiskReading {
    /// Bytes in use
    pub used_bytes: f64,
    /// Bytes available to unprivileged users
    pub free_bytes: f64,
    /// Filesystem size, including reserved blocks
    pub total_bytes: f64,
}

impl DiskReading {
    /// Share of the space available to users that is in use.
    pub fn usage_percent(&self) -> Option<f64> {
        super::units::percent_of(self.used_bytes, self.used_bytes + self.free_bytes)
    }
}

/// One GPU's memory counters (any consistent unit) and temperature.
#[derive(Debug, Clone, PartialEq)]
pub struct GpuDevice {
    /// Device or card name
    pub name: String,
    /// Video memory in use
    pub memory_used: f64,
    /// Video memory installed
    pub memory_total: f64,
    /// Core temperature in degrees, if the device reports one
    pub temperature: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GpuReading {
    /// Per-device counters, combined by the aggregator.
    Devices(Vec<GpuDevice>),
    /// Usage and temperature already computed by the provider.
    Direct {
        usage_percent: Option<f64>,
        temperature: Option<f64>,
    },
}

/// Absolute byte counters for one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceCounters {
    /// Interface name (e.g. eth0)
    pub name: String,
    /// Total bytes transmitted since boot
    pub bytes_sent: u64,
    /// Total bytes received since boot
    pub bytes_received: u64,
}

/// Throughput (bytes/sec) and lifetime totals (bytes) for one interface.
/// A provider that lacks a value leaves it `None`; it is never zero-filled.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InterfaceRates {
    /// Transmit rate, bytes per second
    pub upload_rate: Option<f64>,
    /// Receive rate, bytes per second
    pub download_rate: Option<f64>,
    /// Total bytes transmitted
    pub uploaded_total: Option<f64>,
    /// Total bytes received
    pub downloaded_total: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NetworkReading {
    /// Absolute counters; rates come from the tracker.
    Counters(Vec<InterfaceCounters>),
    /// Rates measured by the provider itself.
    Rates(Vec<(String, InterfaceRates)>),
}

/// A platform data source. Every capability defaults to "not provided" so a
/// backend only implements what it can actually read.
pub trait MetricSource: Send {
    fn name(&self) -> &'static str;

    fn cpu_usage(&mut self) -> Result<f64> {
        Err(unsupported(self.name(), "cpu usage"))
    }

    fn cpu_temperature(&mut self) -> Result<f64> {
        Err(unsupported(self.name(), "cpu temperature"))
    }

    fn gpu(&mut self) -> Result<GpuReading> {
        Err(unsupported(self.name(), "gpu"))
    }

    fn memory(&mut self) -> Result<MemoryReading> {
        Err(unsupported(self.name(), "memory"))
    }

    fn swap(&mut self) -> Result<SwapReading> {
        Err(unsupported(self.name(), "swap"))
    }

    fn disk(&mut self) -> Result<DiskReading> {
        Err(unsupported(self.name(), "disk"))
    }

    fn network(&mut self) -> Result<NetworkReading> {
        Err(unsupported(self.name(), "network"))
    }
}

fn unsupported(source: &str, what: &str) -> anyhow::Error {
    anyhow!("{} does not provide {}", source, what)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn swap_derivation_uses_differences() {
        let mem = VirtualMemory {
            physical_used: 6000.0,
            physical_total: 16000.0,
            virtual_used: 7000.0,
            virtual_total: 20000.0,
        };
        assert_eq!(mem.swap_percent(), Some(25.0));
    }

    #[test]
    fn swap_derivation_without_swap_is_none() {
        let mem = VirtualMemory {
            physical_used: 6000.0,
            physical_total: 16000.0,
            virtual_used: 6000.0,
            virtual_total: 16000.0,
        };
        assert_eq!(mem.swap_percent(), None);
    }

    #[test]
    fn disk_usage_ignores_reserved_blocks() {
        let disk = DiskReading {
            used_bytes: 30.0,
            free_bytes: 60.0,
            total_bytes: 100.0,
        };
        let pct = disk.usage_percent().unwrap();
        assert!((pct - 33.333).abs() < 0.01);
    }

    struct Bare;

    impl MetricSource for Bare {
        fn name(&self) -> &'static str {
            "bare"
        }
    }

    #[test]
    fn default_capabilities_fail() {
        let mut source = Bare;
        let err = source.disk().unwrap_err();
        assert_eq!(err.to_string(), "bare does not provide disk");
        assert!(source.network().is_err());
    }
}
