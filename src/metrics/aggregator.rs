use super::gpu::{aggregate_devices, GpuSelection};
use super::network::{busiest_interface, NetworkRateTracker};
use super::source::{GpuReading, MetricSource, NetworkReading, SwapReading};
use super::units::{
    bytes_to_gb, bytes_to_kb, bytes_to_mb, DEGREE, GIGABYTES, KILOBYTES_PER_SEC, MEGABYTES,
    PERCENT,
};
use super::{CpuStats, DiskStats, GpuStats, MemoryStats, NetworkStats, SensorSnapshot, UnitValue};
use anyhow::{anyhow, Result};
use std::net::Ipv4Addr;
use std::panic::{self, AssertUnwindSafe};

type AddressResolver = Box<dyn FnMut() -> String + Send>;

/// Builds one `SensorSnapshot` per cycle from an ordered list of sources.
///
/// Every metric is read from the first source that produces it. A source
/// that errors or panics only costs that one metric; the field degrades to
/// the unavailable marker and the snapshot is still returned.
pub struct SensorAggregator {
    sources: Vec<Box<dyn MetricSource>>,
    gpu: GpuSelection,
    rates: NetworkRateTracker,
    target_address: String,
    local_address: AddressResolver,
}

impl SensorAggregator {
    pub fn new(sources: Vec<Box<dyn MetricSource>>, gpu: GpuSelection, target: Ipv4Addr) -> Self {
        Self {
            sources,
            gpu,
            rates: NetworkRateTracker::new(),
            target_address: target.to_string(),
            local_address: Box::new(move || crate::transport::local_address(target)),
        }
    }

    /// Replace how the host's own address is looked up each cycle.
    pub fn with_local_address<F>(mut self, resolve: F) -> Self
    where
        F: FnMut() -> String + Send + 'static,
    {
        self.local_address = Box::new(resolve);
        self
    }

    pub fn snapshot(&mut self) -> SensorSnapshot {
        SensorSnapshot {
            cpu: self.cpu(),
            gpu: self.gpu(),
            memory: self.memory(),
            disk: self.disk(),
            network: self.network(),
            target_address: self.target_address.clone(),
            local_address: (self.local_address)(),
        }
    }

    fn cpu(&mut self) -> CpuStats {
        let usage = first_success(&mut self.sources, "cpu usage", |s| finite(s.cpu_usage()?));
        let temperature = first_success(&mut self.sources, "cpu temperature", |s| {
            finite(s.cpu_temperature()?)
        });
        CpuStats {
            usage: UnitValue::whole(usage, PERCENT),
            temperature: UnitValue::whole(temperature, DEGREE),
        }
    }

    /// Backend-provided GPU readings first, then the probed vendor source.
    fn gpu(&mut self) -> GpuStats {
        let read = |s: &mut dyn MetricSource| gpu_values(s.gpu()?);
        let values = first_success(&mut self.sources, "gpu", read).or_else(|| {
            let source = self.gpu.source_mut()?;
            attempt(source, "gpu", &mut |s: &mut dyn MetricSource| gpu_values(s.gpu()?))
        });
        let (usage, temperature) = values.unwrap_or((None, None));
        GpuStats {
            usage: UnitValue::whole(usage, PERCENT),
            temperature: UnitValue::whole(temperature, DEGREE),
        }
    }

    fn memory(&mut self) -> MemoryStats {
        let memory = first_success(&mut self.sources, "memory", |s| s.memory());
        let swap = first_success(&mut self.sources, "swap", |s| match s.swap()? {
            SwapReading::Reported(percent) => finite(percent),
            SwapReading::Derived(mem) => mem
                .swap_percent()
                .ok_or_else(|| anyhow!("no swap configured")),
        });
        MemoryStats {
            swap_pct: UnitValue::whole(swap, PERCENT),
            usage_pct: UnitValue::whole(memory.map(|m| m.usage_percent), PERCENT),
            free: UnitValue::whole(memory.map(|m| bytes_to_mb(m.free_bytes)), MEGABYTES),
            used: UnitValue::whole(memory.map(|m| bytes_to_mb(m.used_bytes)), MEGABYTES),
        }
    }

    fn disk(&mut self) -> DiskStats {
        let disk = first_success(&mut self.sources, "disk", |s| s.disk());
        DiskStats {
            usage_pct: UnitValue::whole(disk.and_then(|d| d.usage_percent()), PERCENT),
            total: UnitValue::whole(disk.map(|d| bytes_to_gb(d.total_bytes)), GIGABYTES),
            used: UnitValue::whole(disk.map(|d| bytes_to_gb(d.used_bytes)), GIGABYTES),
            free: UnitValue::whole(disk.map(|d| bytes_to_gb(d.free_bytes)), GIGABYTES),
        }
    }

    /// The interface with the highest download rate this cycle. Counter
    /// sources go through the tracker, so their first cycle is unavailable.
    fn network(&mut self) -> NetworkStats {
        let tracker = &mut self.rates;
        let selected = first_success(&mut self.sources, "network", |s| {
            Ok(match s.network()? {
                NetworkReading::Counters(counters) => {
                    let rates = tracker.observe_now(&counters);
                    busiest_interface(&rates).map(|(name, rate)| {
                        log::trace!("network: {} selected", name);
                        rate.clone()
                    })
                }
                NetworkReading::Rates(list) => {
                    busiest_interface(list.iter().map(|(name, rate)| (name, rate)))
                        .map(|(_, rate)| rate.clone())
                }
            })
        })
        .flatten();

        let rates = selected.unwrap_or_default();
        NetworkStats {
            upload_rate: UnitValue::tenths(rates.upload_rate.map(bytes_to_kb), KILOBYTES_PER_SEC),
            download_rate: UnitValue::tenths(rates.download_rate.map(bytes_to_kb), KILOBYTES_PER_SEC),
            uploaded_total: UnitValue::tenths(rates.uploaded_total.map(bytes_to_mb), MEGABYTES),
            downloaded_total: UnitValue::tenths(rates.downloaded_total.map(bytes_to_mb), MEGABYTES),
        }
    }
}

/// Value from the first source whose read succeeds.
fn first_success<T, F>(sources: &mut [Box<dyn MetricSource>], what: &str, mut read: F) -> Option<T>
where
    F: FnMut(&mut dyn MetricSource) -> Result<T>,
{
    sources
        .iter_mut()
        .find_map(|source| attempt(source.as_mut(), what, &mut read))
}

/// One isolated read. Errors and panics both become `None`.
fn attempt<T, F>(source: &mut dyn MetricSource, what: &str, read: &mut F) -> Option<T>
where
    F: FnMut(&mut dyn MetricSource) -> Result<T>,
{
    let name = source.name();
    match panic::catch_unwind(AssertUnwindSafe(|| read(source))) {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            log::debug!("{}: {} unavailable: {:#}", name, what, e);
            None
        }
        Err(_) => {
            log::warn!("{}: {} read panicked", name, what);
            None
        }
    }
}

fn finite(value: f64) -> Result<f64> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(anyhow!("non-finite reading {}", value))
    }
}

/// Usage and temperature, failing when the reading carries neither.
fn gpu_values(reading: GpuReading) -> Result<(Option<f64>, Option<f64>)> {
    let (usage, temperature) = match reading {
        GpuReading::Devices(devices) => aggregate_devices(&devices),
        GpuReading::Direct {
            usage_percent,
            temperature,
        } => (usage_percent, temperature),
    };
    if usage.is_none() && temperature.is_none() {
        return Err(anyhow!("no gpu values"));
    }
    Ok((usage, temperature))
}

#[cfg(test)]
mod tests {
    use super::super::gpu::GpuVendor;
    use super::super::monitor::{HardwareKind, HardwareMonitor, HardwareSensor, MonitorSource, SensorKind};
    use super::super::source::{
        DiskReading, GpuDevice, InterfaceCounters, InterfaceRates, MemoryReading, VirtualMemory,
    };
    use super::super::units::{GIB, KIB, MIB};
    use super::super::Reading;
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Fake {
        cpu_usage: Option<f64>,
        cpu_temperature: Option<f64>,
        gpu: Option<GpuReading>,
        memory: Option<MemoryReading>,
        swap: Option<SwapReading>,
        disk: Option<DiskReading>,
        network: Vec<NetworkReading>,
        panic_on_cpu: bool,
    }

    impl MetricSource for Fake {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn cpu_usage(&mut self) -> Result<f64> {
            if self.panic_on_cpu {
                panic!("sensor driver crashed");
            }
            self.cpu_usage.ok_or_else(|| anyhow!("no cpu usage"))
        }

        fn cpu_temperature(&mut self) -> Result<f64> {
            self.cpu_temperature.ok_or_else(|| anyhow!("no cpu temperature"))
        }

        fn gpu(&mut self) -> Result<GpuReading> {
            self.gpu.clone().ok_or_else(|| anyhow!("no gpu"))
        }

        fn memory(&mut self) -> Result<MemoryReading> {
            self.memory.ok_or_else(|| anyhow!("no memory"))
        }

        fn swap(&mut self) -> Result<SwapReading> {
            self.swap.ok_or_else(|| anyhow!("no swap"))
        }

        fn disk(&mut self) -> Result<DiskReading> {
            self.disk.ok_or_else(|| anyhow!("no disk"))
        }

        fn network(&mut self) -> Result<NetworkReading> {
            if self.network.is_empty() {
                return Err(anyhow!("no network"));
            }
            Ok(self.network.remove(0))
        }
    }

    fn aggregator(sources: Vec<Fake>, gpu: GpuSelection) -> SensorAggregator {
        let sources = sources
            .into_iter()
            .map(|s| Box::new(s) as Box<dyn MetricSource>)
            .collect();
        SensorAggregator::new(sources, gpu, Ipv4Addr::new(192, 168, 1, 20))
            .with_local_address(|| "192.168.1.5".to_string())
    }

    fn counters(name: &str, sent: u64, received: u64) -> InterfaceCounters {
        InterfaceCounters {
            name: name.to_string(),
            bytes_sent: sent,
            bytes_received: received,
        }
    }

    #[test]
    fn every_failed_field_is_unavailable_with_its_unit() {
        let mut agg = aggregator(vec![Fake::default()], GpuSelection::none());
        let snap = agg.snapshot();

        let fields = [
            (snap.cpu.usage, PERCENT),
            (snap.cpu.temperature, DEGREE),
            (snap.gpu.usage, PERCENT),
            (snap.gpu.temperature, DEGREE),
            (snap.memory.swap_pct, PERCENT),
            (snap.memory.usage_pct, PERCENT),
            (snap.memory.free, MEGABYTES),
            (snap.memory.used, MEGABYTES),
            (snap.disk.usage_pct, PERCENT),
            (snap.disk.total, GIGABYTES),
            (snap.disk.used, GIGABYTES),
            (snap.disk.free, GIGABYTES),
            (snap.network.upload_rate, KILOBYTES_PER_SEC),
            (snap.network.download_rate, KILOBYTES_PER_SEC),
            (snap.network.uploaded_total, MEGABYTES),
            (snap.network.downloaded_total, MEGABYTES),
        ];
        for (value, unit) in fields {
            assert_eq!(value.reading, Reading::Unavailable);
            assert_eq!(value.unit, unit);
        }
        assert_eq!(snap.target_address, "192.168.1.20");
        assert_eq!(snap.local_address, "192.168.1.5");
    }

    #[test]
    fn sources_are_tried_in_priority_order() {
        let primary = Fake {
            cpu_temperature: Some(50.6),
            ..Fake::default()
        };
        let secondary = Fake {
            cpu_usage: Some(12.4),
            cpu_temperature: Some(70.0),
            ..Fake::default()
        };
        let snap = aggregator(vec![primary, secondary], GpuSelection::none()).snapshot();
        assert_eq!(snap.cpu.usage.reading, Reading::Whole(12));
        assert_eq!(snap.cpu.temperature.reading, Reading::Whole(51));
    }

    #[test]
    fn panicking_source_only_costs_one_read() {
        let primary = Fake {
            panic_on_cpu: true,
            cpu_temperature: Some(40.0),
            ..Fake::default()
        };
        let secondary = Fake {
            cpu_usage: Some(30.0),
            ..Fake::default()
        };
        let snap = aggregator(vec![primary, secondary], GpuSelection::none()).snapshot();
        assert_eq!(snap.cpu.usage.reading, Reading::Whole(30));
        assert_eq!(snap.cpu.temperature.reading, Reading::Whole(40));
    }

    #[test]
    fn derived_swap_without_swap_falls_through() {
        let no_swap = VirtualMemory {
            physical_used: 4000.0,
            physical_total: 8000.0,
            virtual_used: 4000.0,
            virtual_total: 8000.0,
        };
        let primary = Fake {
            swap: Some(SwapReading::Derived(no_swap)),
            ..Fake::default()
        };
        let secondary = Fake {
            swap: Some(SwapReading::Reported(12.2)),
            ..Fake::default()
        };
        let snap = aggregator(vec![primary, secondary], GpuSelection::none()).snapshot();
        assert_eq!(snap.memory.swap_pct.reading, Reading::Whole(12));

        let only = Fake {
            swap: Some(SwapReading::Derived(no_swap)),
            ..Fake::default()
        };
        let snap = aggregator(vec![only], GpuSelection::none()).snapshot();
        assert_eq!(snap.memory.swap_pct.reading, Reading::Unavailable);
    }

    #[test]
    fn memory_and_disk_are_normalized() {
        let source = Fake {
            memory: Some(MemoryReading {
                used_bytes: 2048.0 * MIB,
                free_bytes: 6143.6 * MIB,
                usage_percent: 25.0,
            }),
            disk: Some(DiskReading {
                used_bytes: 10.0 * GIB,
                free_bytes: 30.0 * GIB,
                total_bytes: 42.0 * GIB,
            }),
            ..Fake::default()
        };
        let snap = aggregator(vec![source], GpuSelection::none()).snapshot();
        assert_eq!(snap.memory.used.reading, Reading::Whole(2048));
        assert_eq!(snap.memory.free.reading, Reading::Whole(6144));
        assert_eq!(snap.memory.usage_pct.reading, Reading::Whole(25));
        assert_eq!(snap.disk.usage_pct.reading, Reading::Whole(25));
        assert_eq!(snap.disk.total.reading, Reading::Whole(42));
        assert_eq!(snap.disk.free.reading, Reading::Whole(30));
    }

    #[test]
    fn counters_need_a_second_cycle() {
        let source = Fake {
            network: vec![
                NetworkReading::Counters(vec![counters("eth0", 0, 0), counters("wlan0", 0, 0)]),
                NetworkReading::Counters(vec![
                    counters("eth0", 5_000, 10),
                    counters("wlan0", MIB as u64, 3 * MIB as u64),
                ]),
            ],
            ..Fake::default()
        };
        let mut agg = aggregator(vec![source], GpuSelection::none());

        let first = agg.snapshot();
        assert_eq!(first.network.download_rate.reading, Reading::Unavailable);
        assert_eq!(first.network.downloaded_total.reading, Reading::Unavailable);

        thread::sleep(Duration::from_millis(20));
        let second = agg.snapshot();
        assert!(second.network.download_rate.reading.is_available());
        assert_eq!(second.network.uploaded_total.reading, Reading::Tenths(1.0));
        assert_eq!(second.network.downloaded_total.reading, Reading::Tenths(3.0));
    }

    #[test]
    fn provider_rates_pick_busiest_download() {
        let rates = |down: f64, up: f64, total: f64| InterfaceRates {
            upload_rate: Some(up),
            download_rate: Some(down),
            uploaded_total: Some(total),
            downloaded_total: Some(total),
        };
        let source = Fake {
            network: vec![NetworkReading::Rates(vec![
                ("Ethernet".into(), rates(512.0 * KIB, 64.0 * KIB, 2.5 * MIB)),
                ("WiFi".into(), rates(8.0 * KIB, 900.0 * KIB, 0.0)),
            ])],
            ..Fake::default()
        };
        let snap = aggregator(vec![source], GpuSelection::none()).snapshot();
        assert_eq!(snap.network.download_rate.reading, Reading::Tenths(512.0));
        assert_eq!(snap.network.upload_rate.reading, Reading::Tenths(64.0));
        assert_eq!(snap.network.uploaded_total.reading, Reading::Tenths(2.5));
    }

    #[test]
    fn missing_provider_values_stay_unavailable() {
        let source = Fake {
            network: vec![NetworkReading::Rates(vec![(
                "Ethernet".into(),
                InterfaceRates {
                    download_rate: Some(256.0 * KIB),
                    ..InterfaceRates::default()
                },
            )])],
            ..Fake::default()
        };
        let snap = aggregator(vec![source], GpuSelection::none()).snapshot();
        assert_eq!(snap.network.download_rate.reading, Reading::Tenths(256.0));
        assert_eq!(snap.network.upload_rate.reading, Reading::Unavailable);
        assert_eq!(snap.network.uploaded_total.reading, Reading::Unavailable);
        assert_eq!(snap.network.downloaded_total.reading, Reading::Unavailable);
    }

    struct DownloadOnly;

    impl HardwareMonitor for DownloadOnly {
        fn sensors(&mut self) -> Result<Vec<HardwareSensor>> {
            Ok(vec![HardwareSensor {
                hardware: HardwareKind::Network,
                hardware_name: "Ethernet".into(),
                kind: SensorKind::Throughput,
                name: "Download Speed".into(),
                value: 2048.0,
            }])
        }
    }

    #[test]
    fn monitor_without_upload_sensors_reports_no_zeros() {
        let monitor = MonitorSource::new(None, Some(Box::new(DownloadOnly)));
        let mut agg = SensorAggregator::new(
            vec![Box::new(monitor) as Box<dyn MetricSource>],
            GpuSelection::none(),
            Ipv4Addr::new(192, 168, 1, 20),
        )
        .with_local_address(|| "192.168.1.5".to_string());

        let snap = agg.snapshot();
        assert_eq!(snap.network.download_rate.reading, Reading::Tenths(2.0));
        assert_eq!(snap.network.upload_rate.reading, Reading::Unavailable);
        assert_eq!(snap.network.uploaded_total.reading, Reading::Unavailable);
        assert_eq!(snap.network.downloaded_total.reading, Reading::Unavailable);
    }

    fn device(used: f64, total: f64, temperature: f64) -> GpuDevice {
        GpuDevice {
            name: "gpu".into(),
            memory_used: used,
            memory_total: total,
            temperature: Some(temperature),
        }
    }

    #[test]
    fn probed_gpu_sums_memory_across_devices() {
        let vendor = Fake {
            gpu: Some(GpuReading::Devices(vec![
                device(1000.0, 4000.0, 60.0),
                device(4000.0, 8000.0, 71.0),
            ])),
            ..Fake::default()
        };
        let selection = GpuSelection::probe(vec![(
            GpuVendor::Nvidia,
            Box::new(vendor) as Box<dyn MetricSource>,
        )]);
        let snap = aggregator(vec![Fake::default()], selection).snapshot();
        // 5000 / 12000
        assert_eq!(snap.gpu.usage.reading, Reading::Whole(42));
        assert_eq!(snap.gpu.temperature.reading, Reading::Whole(66));
    }

    #[test]
    fn backend_gpu_reading_wins_over_probe() {
        let backend = Fake {
            gpu: Some(GpuReading::Direct {
                usage_percent: Some(33.0),
                temperature: None,
            }),
            ..Fake::default()
        };
        let vendor = Fake {
            gpu: Some(GpuReading::Devices(vec![device(1.0, 2.0, 50.0)])),
            ..Fake::default()
        };
        let selection = GpuSelection::probe(vec![(
            GpuVendor::Amd,
            Box::new(vendor) as Box<dyn MetricSource>,
        )]);
        let snap = aggregator(vec![backend], selection).snapshot();
        assert_eq!(snap.gpu.usage.reading, Reading::Whole(33));
        assert_eq!(snap.gpu.temperature.reading, Reading::Unavailable);
    }
}
