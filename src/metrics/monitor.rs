//! Hardware-monitor backend.
//!
//! Two providers, tried in order for every metric:
//! 1. a diagnostics feed, a flat document of
//!    `<group><id>..</id><label>..</label><value>..</value></group>` items
//!    as exported by system diagnostics tools;
//! 2. direct hardware sensor enumeration (`HardwareMonitor`).
//!
//! How either provider acquires its data is outside this crate; they are
//! consumed through the `FeedProvider` and `HardwareMonitor` traits.

use super::source::{
    DiskReading, GpuDevice, GpuReading, InterfaceRates, MemoryReading, MetricSource,
    NetworkReading, SwapReading, VirtualMemory,
};
use super::units::{KIB, MIB};
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::PathBuf;

/// Hardware sensors report data sizes in decimal gigabytes.
const GB_DECIMAL: f64 = 1_000_000_000.0;

/// Placeholder an unlicensed diagnostics tool writes instead of a value.
const TRIAL_VALUE: &str = "TRIAL";

/// Parsed diagnostics feed: group -> label -> raw value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiagnosticsFeed {
    groups: HashMap<String, HashMap<String, String>>,
}

impl DiagnosticsFeed {
    pub fn parse(text: &str) -> Result<Self> {
        let mut feed = Self::default();
        let mut rest = text.trim_matches(char::from(0)).trim();

        while !rest.is_empty() {
            let (group, inner, tail) =
                next_element(rest).ok_or_else(|| anyhow!("Malformed feed near {:.32}", rest))?;
            let label = child_text(inner, "label");
            let value = child_text(inner, "value");
            if let (Some(label), Some(value)) = (label, value) {
                feed.groups
                    .entry(group.to_string())
                    .or_default()
                    .insert(unescape(label), unescape(value));
            }
            rest = tail.trim_start();
        }
        Ok(feed)
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Numeric value of one sensor; `TRIAL` and non-numeric values are absent.
    pub fn value(&self, group: &str, label: &str) -> Option<f64> {
        self.groups.get(group)?.get(label).and_then(|v| parse_value(v))
    }

    /// Every label of a group, numeric or not, sorted.
    pub fn labels(&self, group: &str) -> Vec<&str> {
        let mut labels: Vec<&str> = self
            .groups
            .get(group)
            .map(|labels| labels.keys().map(String::as_str).collect())
            .unwrap_or_default();
        labels.sort_unstable();
        labels
    }

    /// All numeric sensors of a group, sorted by label.
    pub fn entries(&self, group: &str) -> Vec<(&str, f64)> {
        let mut entries: Vec<(&str, f64)> = self
            .groups
            .get(group)
            .map(|labels| {
                labels
                    .iter()
                    .filter_map(|(label, value)| Some((label.as_str(), parse_value(value)?)))
                    .collect()
            })
            .unwrap_or_default();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

fn parse_value(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw == TRIAL_VALUE {
        return None;
    }
    raw.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Split `<tag>inner</tag>rest` into its parts.
fn next_element(s: &str) -> Option<(&str, &str, &str)> {
    let s = s.strip_prefix('<')?;
    let end = s.find('>')?;
    let tag = &s[..end];
    if tag.is_empty() || tag.starts_with('/') {
        return None;
    }
    let body = &s[end + 1..];
    let close = format!("</{}>", tag);
    let close_at = body.find(&close)?;
    Some((tag, &body[..close_at], &body[close_at + close.len()..]))
}

fn child_text<'a>(inner: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = inner.find(&open)? + open.len();
    let len = inner[start..].find(&close)?;
    Some(inner[start..start + len].trim())
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Something that can hand over a fresh diagnostics feed.
pub trait FeedProvider: Send {
    fn read_feed(&mut self) -> Result<DiagnosticsFeed>;
}

impl FeedProvider for DiagnosticsFeed {
    fn read_feed(&mut self) -> Result<DiagnosticsFeed> {
        Ok(self.clone())
    }
}

/// Feed dumped to a file by an external exporter; re-read on every access.
pub struct FileFeed {
    path: PathBuf,
}

impl FileFeed {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl FeedProvider for FileFeed {
    fn read_feed(&mut self) -> Result<DiagnosticsFeed> {
        let bytes = fs::read(&self.path)
            .with_context(|| format!("Failed to read feed {}", self.path.display()))?;
        DiagnosticsFeed::parse(&String::from_utf8_lossy(&bytes))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum HardwareKind {
    Cpu,
    Memory,
    GpuAmd,
    GpuNvidia,
    GpuIntel,
    Network,
    Storage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum SensorKind {
    Load,
    Temperature,
    Data,
    SmallData,
    Throughput,
}

/// One named sensor reading from the hardware monitor.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HardwareSensor {
    pub hardware: HardwareKind,
    pub hardware_name: String,
    pub kind: SensorKind,
    pub name: String,
    pub value: f64,
}

/// Enumerates the current value of every sensor on the machine.
pub trait HardwareMonitor: Send {
    fn sensors(&mut self) -> Result<Vec<HardwareSensor>>;
}

/// Sensor list exported as a JSON array by an external monitor process.
pub struct JsonSensorDump {
    path: PathBuf,
}

impl JsonSensorDump {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }
}

impl HardwareMonitor for JsonSensorDump {
    fn sensors(&mut self) -> Result<Vec<HardwareSensor>> {
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read sensors {}", self.path.display()))?;
        serde_json::from_str(&text).context("Invalid sensor dump")
    }
}

/// Lookup helpers over one enumeration pass.
struct SensorSet(Vec<HardwareSensor>);

impl SensorSet {
    fn find(&self, hardware: HardwareKind, kind: SensorKind, prefix: &str) -> Option<f64> {
        self.0
            .iter()
            .find(|s| s.hardware == hardware && s.kind == kind && s.name.starts_with(prefix))
            .map(|s| s.value)
            .filter(|v| v.is_finite())
    }

    /// Sensors of one kind of hardware, grouped per device name.
    fn by_device(&self, hardware: HardwareKind) -> BTreeMap<&str, Vec<&HardwareSensor>> {
        let mut devices: BTreeMap<&str, Vec<&HardwareSensor>> = BTreeMap::new();
        for sensor in self.0.iter().filter(|s| s.hardware == hardware) {
            devices.entry(sensor.hardware_name.as_str()).or_default().push(sensor);
        }
        devices
    }
}

fn find_in(sensors: &[&HardwareSensor], kind: SensorKind, prefix: &str) -> Option<f64> {
    sensors
        .iter()
        .find(|s| s.kind == kind && s.name.starts_with(prefix))
        .map(|s| s.value)
        .filter(|v| v.is_finite())
}

/// Diagnostics feed first, hardware sensor enumeration second.
pub struct MonitorSource {
    feed: Option<Box<dyn FeedProvider>>,
    hardware: Option<Box<dyn HardwareMonitor>>,
}

impl MonitorSource {
    pub fn new(
        feed: Option<Box<dyn FeedProvider>>,
        hardware: Option<Box<dyn HardwareMonitor>>,
    ) -> Self {
        Self { feed, hardware }
    }

    fn feed(&mut self) -> Result<DiagnosticsFeed> {
        match self.feed.as_mut() {
            Some(provider) => provider.read_feed(),
            None => bail!("No diagnostics feed configured"),
        }
    }

    fn sensors(&mut self) -> Result<SensorSet> {
        match self.hardware.as_mut() {
            Some(monitor) => Ok(SensorSet(monitor.sensors()?)),
            None => bail!("No hardware monitor configured"),
        }
    }

    /// Run `primary` against the feed, then `secondary` against the sensors.
    fn chain<T>(
        &mut self,
        what: &str,
        primary: impl FnOnce(&DiagnosticsFeed) -> Option<T>,
        secondary: impl FnOnce(&SensorSet) -> Option<T>,
    ) -> Result<T> {
        match self.feed() {
            Ok(feed) => {
                if let Some(value) = primary(&feed) {
                    return Ok(value);
                }
                log::debug!("diagnostics feed has no {}", what);
            }
            Err(e) => log::debug!("diagnostics feed unavailable for {}: {:#}", what, e),
        }
        let sensors = self.sensors()?;
        secondary(&sensors).ok_or_else(|| anyhow!("No hardware sensor for {}", what))
    }
}

impl MetricSource for MonitorSource {
    fn name(&self) -> &'static str {
        "hardware-monitor"
    }

    fn cpu_usage(&mut self) -> Result<f64> {
        self.chain(
            "cpu usage",
            |feed| feed.value("sys", "CPU Utilization"),
            |sensors| sensors.find(HardwareKind::Cpu, SensorKind::Load, "CPU Total"),
        )
    }

    fn cpu_temperature(&mut self) -> Result<f64> {
        self.chain(
            "cpu temperature",
            |feed| feed.value("temp", "CPU Package"),
            |sensors| {
                ["Core Average", "Core Max", "CPU Package", "Core"]
                    .iter()
                    .find_map(|prefix| {
                        sensors.find(HardwareKind::Cpu, SensorKind::Temperature, prefix)
                    })
            },
        )
    }

    fn gpu(&mut self) -> Result<GpuReading> {
        self.chain("gpu", feed_gpu, sensor_gpu)
    }

    fn memory(&mut self) -> Result<MemoryReading> {
        self.chain(
            "memory",
            |feed| {
                let used = feed.value("sys", "Used Memory")? * MIB;
                let free = feed.value("sys", "Free Memory")? * MIB;
                let usage_percent = feed.value("sys", "Memory Utilization")?;
                Some(MemoryReading {
                    used_bytes: used,
                    free_bytes: free,
                    usage_percent,
                })
            },
            |sensors| {
                let used =
                    sensors.find(HardwareKind::Memory, SensorKind::Data, "Memory Used")? * GB_DECIMAL;
                let free = sensors.find(HardwareKind::Memory, SensorKind::Data, "Memory Available")?
                    * GB_DECIMAL;
                let usage_percent = sensors
                    .find(HardwareKind::Memory, SensorKind::Load, "Memory")
                    .or_else(|| super::units::percent_of(used, used + free))?;
                Some(MemoryReading {
                    used_bytes: used,
                    free_bytes: free,
                    usage_percent,
                })
            },
        )
    }

    fn swap(&mut self) -> Result<SwapReading> {
        self.chain(
            "swap",
            |feed| {
                let used = feed.value("sys", "Used Memory")?;
                let free = feed.value("sys", "Free Memory")?;
                let virtual_used = feed.value("sys", "Used Virtual Memory")?;
                let virtual_free = feed.value("sys", "Free Virtual Memory")?;
                Some(SwapReading::Derived(VirtualMemory {
                    physical_used: used,
                    physical_total: used + free,
                    virtual_used,
                    virtual_total: virtual_used + virtual_free,
                }))
            },
            |sensors| {
                let data = |prefix| sensors.find(HardwareKind::Memory, SensorKind::Data, prefix);
                let used = data("Memory Used")?;
                let free = data("Memory Available")?;
                let virtual_used = data("Virtual Memory Used")?;
                let virtual_free = data("Virtual Memory Available")?;
                Some(SwapReading::Derived(VirtualMemory {
                    physical_used: used,
                    physical_total: used + free,
                    virtual_used,
                    virtual_total: virtual_used + virtual_free,
                }))
            },
        )
    }

    fn disk(&mut self) -> Result<DiskReading> {
        let feed = self.feed()?;
        let mut used = 0.0;
        let mut free = 0.0;
        for (label, value) in feed.entries("sys") {
            if label.ends_with(" Used Space") {
                used += value;
            } else if label.ends_with(" Free Space") {
                free += value;
            }
        }
        if used == 0.0 || free == 0.0 {
            bail!("Diagnostics feed has no drive space sensors");
        }
        Ok(DiskReading {
            used_bytes: used * MIB,
            free_bytes: free * MIB,
            total_bytes: (used + free) * MIB,
        })
    }

    fn network(&mut self) -> Result<NetworkReading> {
        self.chain(
            "network",
            |feed| non_empty(feed_network(feed)),
            |sensors| non_empty(sensor_network(sensors)),
        )
        .map(NetworkReading::Rates)
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

/// GPUs named `GPU1 Diode`/`GPU1 Hotspot` in the temperature group, with
/// utilization under `GPU1 Utilization`. The first GPU with both a diode
/// temperature and utilization wins, otherwise the last one listed. Diode is
/// preferred over hotspot. `None` when the chosen GPU has no values at all.
fn feed_gpu(feed: &DiagnosticsFeed) -> Option<GpuReading> {
    let mut titles: Vec<&str> = feed
        .labels("temp")
        .into_iter()
        .filter(|label| label.starts_with("GPU"))
        .filter_map(|label| {
            let title = label.split(' ').next()?;
            let sensor = &label[title.len()..];
            (sensor == " Diode" || sensor == " Hotspot").then_some(title)
        })
        .collect();
    titles.dedup();

    let read = |title: &str| {
        let diode = feed.value("temp", &format!("{} Diode", title));
        let hotspot = feed.value("temp", &format!("{} Hotspot", title));
        let usage = feed.value("sys", &format!("{} Utilization", title));
        (diode, hotspot, usage)
    };

    let readings: Vec<_> = titles.iter().map(|title| read(*title)).collect();
    let (diode, hotspot, usage) = readings
        .iter()
        .find(|(diode, _, usage)| diode.is_some() && usage.is_some())
        .or_else(|| readings.last())
        .copied()?;

    let temperature = diode.or(hotspot);
    if usage.is_none() && temperature.is_none() {
        return None;
    }
    Some(GpuReading::Direct {
        usage_percent: usage,
        temperature,
    })
}

/// GPU devices of the first vendor with sensors, AMD before NVIDIA before Intel.
fn sensor_gpu(sensors: &SensorSet) -> Option<GpuReading> {
    for kind in [HardwareKind::GpuAmd, HardwareKind::GpuNvidia, HardwareKind::GpuIntel] {
        let devices: Vec<GpuDevice> = sensors
            .by_device(kind)
            .into_iter()
            .filter_map(|(name, readings)| {
                let used = find_in(&readings, SensorKind::SmallData, "GPU Memory Used").or_else(
                    || find_in(&readings, SensorKind::SmallData, "D3D Dedicated Memory Used"),
                )?;
                let total = find_in(&readings, SensorKind::SmallData, "GPU Memory Total")?;
                Some(GpuDevice {
                    name: name.to_string(),
                    memory_used: used,
                    memory_total: total,
                    temperature: find_in(&readings, SensorKind::Temperature, "GPU Core"),
                })
            })
            .collect();
        if !devices.is_empty() {
            return Some(GpuReading::Devices(devices));
        }
    }
    None
}

/// Per-NIC rates (KB/s) and totals (MB) keyed by the label's first word.
/// Labels a NIC does not report stay unavailable.
fn feed_network(feed: &DiagnosticsFeed) -> Vec<(String, InterfaceRates)> {
    let mut nics: BTreeMap<String, InterfaceRates> = BTreeMap::new();
    for (label, value) in feed.entries("sys") {
        let Some(nic) = label.split(' ').next() else {
            continue;
        };
        let update: fn(&mut InterfaceRates, f64) = if label.ends_with(" Download Rate") {
            |r, v| r.download_rate = Some(v * KIB)
        } else if label.ends_with(" Upload Rate") {
            |r, v| r.upload_rate = Some(v * KIB)
        } else if label.ends_with(" Total Download") {
            |r, v| r.downloaded_total = Some(v * MIB)
        } else if label.ends_with(" Total Upload") {
            |r, v| r.uploaded_total = Some(v * MIB)
        } else {
            continue;
        };
        update(nics.entry(nic.to_string()).or_default(), value);
    }
    nics.into_iter().collect()
}

/// Network adapters that expose a download speed sensor.
fn sensor_network(sensors: &SensorSet) -> Vec<(String, InterfaceRates)> {
    sensors
        .by_device(HardwareKind::Network)
        .into_iter()
        .filter_map(|(name, readings)| {
            let download_rate = find_in(&readings, SensorKind::Throughput, "Download Speed")?;
            let data = |prefix| find_in(&readings, SensorKind::Data, prefix).map(|gb| gb * GB_DECIMAL);
            Some((
                name.to_string(),
                InterfaceRates {
                    upload_rate: find_in(&readings, SensorKind::Throughput, "Upload Speed"),
                    download_rate: Some(download_rate),
                    uploaded_total: data("Data Uploaded"),
                    downloaded_total: data("Data Downloaded"),
                },
            ))
        })
        .collect()
}
