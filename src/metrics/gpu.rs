//! GPU vendor detection and per-vendor device sources.
//!
//! The vendor is probed once when the aggregator is built. If no vendor
//! reports a device, GPU fields stay unavailable for the life of the process.

use super::source::{GpuDevice, GpuReading, MetricSource};
use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// PCI vendor id of AMD/ATI.
const AMD_PCI_VENDOR: &str = "0x1002";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuVendor {
    Amd,
    Nvidia,
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Amd => write!(f, "amd"),
            Self::Nvidia => write!(f, "nvidia"),
        }
    }
}

/// Outcome of the one-time vendor probe. Immutable once built.
pub struct GpuSelection {
    vendor: Option<GpuVendor>,
    source: Option<Box<dyn MetricSource>>,
}

impl GpuSelection {
    /// No GPU source; GPU metrics are permanently unavailable.
    pub fn none() -> Self {
        Self {
            vendor: None,
            source: None,
        }
    }

    /// Probe the local AMD and NVIDIA providers, in that order.
    pub fn detect() -> Self {
        Self::probe(vec![
            (GpuVendor::Amd, Box::new(AmdSysfs::new()) as Box<dyn MetricSource>),
            (GpuVendor::Nvidia, Box::new(NvidiaSmi::new())),
        ])
    }

    /// Keep the first candidate that reports at least one device.
    pub fn probe(candidates: Vec<(GpuVendor, Box<dyn MetricSource>)>) -> Self {
        for (vendor, mut source) in candidates {
            match source.gpu() {
                Ok(GpuReading::Devices(devices)) if !devices.is_empty() => {
                    log::info!("Using {} GPU source ({} device(s))", vendor, devices.len());
                    return Self {
                        vendor: Some(vendor),
                        source: Some(source),
                    };
                }
                Ok(_) => log::debug!("{} GPU probe found no devices", vendor),
                Err(e) => log::debug!("{} GPU probe failed: {:#}", vendor, e),
            }
        }
        log::info!("No supported GPU found; GPU metrics disabled");
        Self::none()
    }

    pub fn vendor(&self) -> Option<GpuVendor> {
        self.vendor
    }

    pub(crate) fn source_mut(&mut self) -> Option<&mut (dyn MetricSource + 'static)> {
        self.source.as_deref_mut()
    }
}

/// Combined memory usage and mean temperature across devices.
///
/// Memory is summed over all devices before dividing, so a large card
/// weighs more than a small one.
pub fn aggregate_devices(devices: &[GpuDevice]) -> (Option<f64>, Option<f64>) {
    let used: f64 = devices.iter().map(|d| d.memory_used).sum();
    let total: f64 = devices.iter().map(|d| d.memory_total).sum();
    let usage = super::units::percent_of(used, total);

    let temps: Vec<f64> = devices
        .iter()
        .filter_map(|d| d.temperature)
        .filter(|t| t.is_finite())
        .collect();
    let temperature = if temps.is_empty() {
        None
    } else {
        Some(temps.iter().sum::<f64>() / temps.len() as f64)
    };

    (usage, temperature)
}

/// NVIDIA devices through `nvidia-smi`.
pub struct NvidiaSmi {
    program: String,
}

impl NvidiaSmi {
    pub fn new() -> Self {
        Self {
            program: "nvidia-smi".to_string(),
        }
    }
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for NvidiaSmi {
    fn name(&self) -> &'static str {
        "nvidia-smi"
    }

    fn gpu(&mut self) -> Result<GpuReading> {
        let output = Command::new(&self.program)
            .args([
                "--query-gpu=name,memory.used,memory.total,temperature.gpu",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .context("nvidia-smi query")?;
        if !output.status.success() {
            bail!("nvidia-smi query failed");
        }
        let text = String::from_utf8(output.stdout).context("nvidia-smi output not UTF-8")?;
        Ok(GpuReading::Devices(parse_nvidia_smi(&text)))
    }
}

fn parse_nvidia_smi(text: &str) -> Vec<GpuDevice> {
    text.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(|part| part.trim()).collect();
            if parts.len() < 4 {
                return None;
            }
            Some(GpuDevice {
                name: parts[0].to_string(),
                memory_used: parts[1].parse().ok()?,
                memory_total: parts[2].parse().ok()?,
                temperature: parts[3].parse().ok(),
            })
        })
        .collect()
}

/// AMD devices through the amdgpu sysfs attributes.
pub struct AmdSysfs {
    drm_root: PathBuf,
}

impl AmdSysfs {
    pub fn new() -> Self {
        Self::with_root("/sys/class/drm")
    }

    pub fn with_root<P: Into<PathBuf>>(drm_root: P) -> Self {
        Self {
            drm_root: drm_root.into(),
        }
    }
}

impl Default for AmdSysfs {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for AmdSysfs {
    fn name(&self) -> &'static str {
        "amdgpu-sysfs"
    }

    fn gpu(&mut self) -> Result<GpuReading> {
        let entries = fs::read_dir(&self.drm_root)
            .with_context(|| format!("Failed to list {}", self.drm_root.display()))?;

        let mut cards: Vec<(String, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name().to_string_lossy().to_string();
                // card0 is a device; card0-DP-1 is a connector
                let index = name.strip_prefix("card")?;
                if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
                    return None;
                }
                Some((name, entry.path().join("device")))
            })
            .collect();
        cards.sort();

        let mut devices = Vec::new();
        for (name, device) in cards {
            let vendor = fs::read_to_string(device.join("vendor")).unwrap_or_default();
            if vendor.trim() != AMD_PCI_VENDOR {
                continue;
            }
            let (Some(used), Some(total)) = (
                read_number(&device.join("mem_info_vram_used")),
                read_number(&device.join("mem_info_vram_total")),
            ) else {
                continue;
            };
            devices.push(GpuDevice {
                name,
                memory_used: used,
                memory_total: total,
                temperature: hwmon_temperature(&device.join("hwmon")),
            });
        }
        Ok(GpuReading::Devices(devices))
    }
}

fn read_number(path: &Path) -> Option<f64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Edge temperature (`temp1_input`, millidegrees) of the first hwmon child.
fn hwmon_temperature(hwmon: &Path) -> Option<f64> {
    let mut dirs: Vec<PathBuf> = fs::read_dir(hwmon)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect();
    dirs.sort();
    dirs.iter()
        .find_map(|dir| read_number(&dir.join("temp1_input")))
        .map(|millidegrees| millidegrees / 1000.0)
}
