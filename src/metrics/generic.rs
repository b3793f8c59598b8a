//! Generic backend reading procfs, sysfs hwmon and `statvfs`.

use super::source::{
    DiskReading, InterfaceCounters, MemoryReading, MetricSource, NetworkReading, SwapReading,
};
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Interval used to prime CPU usage when no earlier sample exists.
const CPU_PRIME_INTERVAL: Duration = Duration::from_secs(1);

/// hwmon chip names that carry the CPU package temperature, in priority order.
const CPU_TEMP_CHIPS: [&str; 4] = ["coretemp", "k10temp", "cpu_thermal", "zenpower"];

/// Filesystem that holds user data when `/` is a read-only system shim.
#[cfg(target_os = "macos")]
const DATA_VOLUME: Option<&str> = Some("/System/Volumes/Data");
#[cfg(not(target_os = "macos"))]
const DATA_VOLUME: Option<&str> = None;

/// Raw CPU time values from /proc/stat
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    pub fn idle_all(&self) -> u64 {
        self.idle + self.iowait
    }
}

/// Reads the local machine through the kernel's pseudo filesystems.
pub struct GenericSource {
    proc_root: PathBuf,
    sys_root: PathBuf,
    disk_paths: Vec<PathBuf>,
    prev_cpu_times: Option<CpuTimes>,
}

impl GenericSource {
    pub fn new() -> Self {
        let mut disk_paths: Vec<PathBuf> = DATA_VOLUME.iter().map(|p| PathBuf::from(*p)).collect();
        disk_paths.push(PathBuf::from("/"));
        Self::with_roots("/proc", "/sys", disk_paths)
    }

    pub fn with_roots<P: Into<PathBuf>, S: Into<PathBuf>>(
        proc_root: P,
        sys_root: S,
        disk_paths: Vec<PathBuf>,
    ) -> Self {
        Self {
            proc_root: proc_root.into(),
            sys_root: sys_root.into(),
            disk_paths,
            prev_cpu_times: None,
        }
    }

    fn read_proc(&self, name: &str) -> Result<String> {
        let path = self.proc_root.join(name);
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))
    }

    fn read_cpu_times(&self) -> Result<CpuTimes> {
        let stat = self.read_proc("stat")?;
        stat.lines()
            .find(|line| line.starts_with("cpu "))
            .map(parse_cpu_line)
            .context("No aggregate cpu line in stat")
    }

    fn read_meminfo(&self) -> Result<MemInfo> {
        Ok(parse_meminfo(&self.read_proc("meminfo")?))
    }
}

impl Default for GenericSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricSource for GenericSource {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn cpu_usage(&mut self) -> Result<f64> {
        let prev = match self.prev_cpu_times.take() {
            Some(prev) => prev,
            None => {
                let primed = self.read_cpu_times()?;
                std::thread::sleep(CPU_PRIME_INTERVAL);
                primed
            }
        };
        let current = self.read_cpu_times()?;
        let utilization = calculate_utilization(&prev, &current);
        self.prev_cpu_times = Some(current);
        utilization.context("No CPU time elapsed between samples")
    }

    fn cpu_temperature(&mut self) -> Result<f64> {
        let hwmon = self.sys_root.join("class/hwmon");
        let entries = fs::read_dir(&hwmon)
            .with_context(|| format!("Failed to list {}", hwmon.display()))?;

        let mut chips: Vec<(usize, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = fs::read_to_string(entry.path().join("name")).ok()?;
                let rank = CPU_TEMP_CHIPS.iter().position(|chip| *chip == name.trim())?;
                Some((rank, entry.path()))
            })
            .collect();
        chips.sort();

        for (_, chip) in chips {
            if let Some(millidegrees) = first_temp_input(&chip) {
                return Ok(millidegrees / 1000.0);
            }
        }
        bail!("No CPU temperature sensor under {}", hwmon.display())
    }

    fn memory(&mut self) -> Result<MemoryReading> {
        let info = self.read_meminfo()?;
        if info.total == 0 {
            bail!("MemTotal missing from meminfo");
        }
        let used = info.total.saturating_sub(info.free + info.buffers + info.cached);
        Ok(MemoryReading {
            used_bytes: used as f64,
            free_bytes: info.free as f64,
            usage_percent: 100.0 * used as f64 / info.total as f64,
        })
    }

    fn swap(&mut self) -> Result<SwapReading> {
        let info = self.read_meminfo()?;
        if info.swap_total == 0 {
            bail!("No swap configured");
        }
        let swap_used = info.swap_total.saturating_sub(info.swap_free);
        Ok(SwapReading::Reported(
            100.0 * swap_used as f64 / info.swap_total as f64,
        ))
    }

    fn disk(&mut self) -> Result<DiskReading> {
        let mut last_err = None;
        for path in &self.disk_paths {
            match filesystem_usage(path) {
                Ok(reading) => return Ok(reading),
                Err(e) => {
                    log::debug!("disk usage for {} failed: {:#}", path.display(), e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("No filesystem paths configured")))
    }

    fn network(&mut self) -> Result<NetworkReading> {
        let netdev = self.read_proc("net/dev")?;
        Ok(NetworkReading::Counters(parse_net_dev(&netdev)))
    }
}

fn parse_cpu_line(line: &str) -> CpuTimes {
    let parts: Vec<u64> = line
        .split_whitespace()
        .skip(1) // Skip "cpu"
        .filter_map(|s| s.parse().ok())
        .collect();

    CpuTimes {
        user: *parts.first().unwrap_or(&0),
        nice: *parts.get(1).unwrap_or(&0),
        system: *parts.get(2).unwrap_or(&0),
        idle: *parts.get(3).unwrap_or(&0),
        iowait: *parts.get(4).unwrap_or(&0),
        irq: *parts.get(5).unwrap_or(&0),
        softirq: *parts.get(6).unwrap_or(&0),
        steal: *parts.get(7).unwrap_or(&0),
    }
}

/// Busy share of the jiffies between two samples.
fn calculate_utilization(prev: &CpuTimes, curr: &CpuTimes) -> Option<f64> {
    let total_delta = curr.total().saturating_sub(prev.total());
    if total_delta == 0 {
        return None;
    }
    let idle_delta = curr.idle_all().saturating_sub(prev.idle_all());
    Some(100.0 * (1.0 - (idle_delta as f64 / total_delta as f64)))
}

/// Lowest-numbered `temp*_input` of a hwmon chip, in millidegrees.
fn first_temp_input(chip: &Path) -> Option<f64> {
    let mut inputs: Vec<PathBuf> = fs::read_dir(chip)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("temp") && n.ends_with("_input"))
                .unwrap_or(false)
        })
        .collect();
    inputs.sort();
    inputs
        .iter()
        .find_map(|path| fs::read_to_string(path).ok()?.trim().parse::<f64>().ok())
}

#[derive(Debug, Default, Clone, PartialEq)]
struct MemInfo {
    total: u64,
    free: u64,
    buffers: u64,
    cached: u64,
    swap_total: u64,
    swap_free: u64,
}

fn parse_meminfo(meminfo: &str) -> MemInfo {
    let mut info = MemInfo::default();

    for line in meminfo.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 2 {
            continue;
        }

        let value: u64 = parts[1].parse().unwrap_or(0) * 1024; // Convert from KB to bytes

        match parts[0] {
            "MemTotal:" => info.total = value,
            "MemFree:" => info.free = value,
            "Buffers:" => info.buffers = value,
            "Cached:" => info.cached = value,
            "SwapTotal:" => info.swap_total = value,
            "SwapFree:" => info.swap_free = value,
            _ => {}
        }
    }

    info
}

fn parse_net_dev(netdev: &str) -> Vec<InterfaceCounters> {
    let mut interfaces = Vec::new();

    for line in netdev.lines().skip(2) {
        // Skip header lines; "eth0: 123 ..." may lack the space after the colon
        let Some((name, counters)) = line.split_once(':') else {
            continue;
        };
        let interface = name.trim();
        if interface.is_empty() || interface == "lo" {
            continue;
        }

        let parts: Vec<&str> = counters.split_whitespace().collect();
        if parts.len() < 16 {
            continue;
        }

        let (Ok(bytes_received), Ok(bytes_sent)) = (parts[0].parse(), parts[8].parse()) else {
            continue;
        };

        interfaces.push(InterfaceCounters {
            name: interface.to_string(),
            bytes_sent,
            bytes_received,
        });
    }

    interfaces
}

#[cfg(unix)]
fn filesystem_usage(path: &Path) -> Result<DiskReading> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .with_context(|| format!("Invalid path {}", path.display()))?;
    let mut statvfs = MaybeUninit::<libc::statvfs>::uninit();

    let result = unsafe { libc::statvfs(c_path.as_ptr(), statvfs.as_mut_ptr()) };
    if result != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("statvfs({}) failed", path.display()));
    }

    let statvfs = unsafe { statvfs.assume_init() };
    let block_size = statvfs.f_frsize as u64;
    let total_bytes = statvfs.f_blocks as u64 * block_size;
    let available_bytes = statvfs.f_bavail as u64 * block_size;
    let free_blocks_bytes = statvfs.f_bfree as u64 * block_size;

    Ok(DiskReading {
        used_bytes: total_bytes.saturating_sub(free_blocks_bytes) as f64,
        free_bytes: available_bytes as f64,
        total_bytes: total_bytes as f64,
    })
}

#[cfg(not(unix))]
fn filesystem_usage(path: &Path) -> Result<DiskReading> {
    bail!("statvfs unavailable for {}", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const NET_DEV: &str = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 9000      10    0    0    0     0          0         0     9000      10    0    0    0     0       0          0
  eth0: 123456    100    0    0    0     0          0         0    654321     90    0    0    0     0       0          0
wlan0:777 5 0 0 0 0 0 0 888 6 0 0 0 0 0 0
";

    const MEMINFO: &str = "\
MemTotal:       16000000 kB
MemFree:         4000000 kB
MemAvailable:    9000000 kB
Buffers:         1000000 kB
Cached:          3000000 kB
SwapTotal:       2000000 kB
SwapFree:        1500000 kB
";

    #[test]
    fn net_dev_skips_loopback_and_headers() {
        let interfaces = parse_net_dev(NET_DEV);
        assert_eq!(interfaces.len(), 2);
        assert_eq!(interfaces[0].name, "eth0");
        assert_eq!(interfaces[0].bytes_received, 123456);
        assert_eq!(interfaces[0].bytes_sent, 654321);
        assert_eq!(interfaces[1].name, "wlan0");
        assert_eq!(interfaces[1].bytes_sent, 888);
    }

    #[test]
    fn utilization_from_deltas() {
        let prev = parse_cpu_line("cpu  100 0 100 800 0 0 0 0 0 0");
        let curr = parse_cpu_line("cpu  150 0 150 900 0 0 0 0 0 0");
        assert_eq!(calculate_utilization(&prev, &curr), Some(50.0));
        assert_eq!(calculate_utilization(&curr, &curr), None);
    }

    fn fake_proc() -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("net")).unwrap();
        fs::write(dir.path().join("meminfo"), MEMINFO).unwrap();
        fs::write(dir.path().join("net/dev"), NET_DEV).unwrap();
        dir
    }

    #[test]
    fn memory_and_swap_from_meminfo() {
        let proc_dir = fake_proc();
        let mut source = GenericSource::with_roots(proc_dir.path(), "/nonexistent", vec![]);

        let mem = source.memory().unwrap();
        assert_eq!(mem.used_bytes, 8_000_000.0 * 1024.0);
        assert_eq!(mem.free_bytes, 4_000_000.0 * 1024.0);
        assert_eq!(mem.usage_percent, 50.0);

        assert_eq!(source.swap().unwrap(), SwapReading::Reported(25.0));
    }

    #[test]
    fn swap_without_swap_space_fails() {
        let proc_dir = tempdir().unwrap();
        fs::write(
            proc_dir.path().join("meminfo"),
            "MemTotal: 100 kB\nMemFree: 50 kB\nSwapTotal: 0 kB\nSwapFree: 0 kB\n",
        )
        .unwrap();
        let mut source = GenericSource::with_roots(proc_dir.path(), "/nonexistent", vec![]);
        assert!(source.swap().is_err());
    }

    #[test]
    fn network_counters_from_proc() {
        let proc_dir = fake_proc();
        let mut source = GenericSource::with_roots(proc_dir.path(), "/nonexistent", vec![]);
        match source.network().unwrap() {
            NetworkReading::Counters(counters) => assert_eq!(counters.len(), 2),
            other => panic!("unexpected reading {:?}", other),
        }
    }

    #[test]
    fn cpu_temperature_prefers_known_chips() {
        let sys_dir = tempdir().unwrap();
        let hwmon = sys_dir.path().join("class/hwmon");
        for (dir, name, temp) in [
            ("hwmon0", "acpitz", "30000"),
            ("hwmon1", "k10temp", "55250"),
            ("hwmon2", "coretemp", "61000"),
        ] {
            fs::create_dir_all(hwmon.join(dir)).unwrap();
            fs::write(hwmon.join(dir).join("name"), format!("{}\n", name)).unwrap();
            fs::write(hwmon.join(dir).join("temp1_input"), temp).unwrap();
        }

        let mut source = GenericSource::with_roots("/nonexistent", sys_dir.path(), vec![]);
        assert_eq!(source.cpu_temperature().unwrap(), 61.0);
    }

    #[test]
    fn missing_sources_are_errors() {
        let mut source = GenericSource::with_roots("/nonexistent", "/nonexistent", vec![]);
        assert!(source.cpu_usage().is_err());
        assert!(source.cpu_temperature().is_err());
        assert!(source.memory().is_err());
        assert!(source.disk().is_err());
        assert!(source.network().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn disk_falls_back_to_next_path() {
        let mut source = GenericSource::with_roots(
            "/nonexistent",
            "/nonexistent",
            vec![PathBuf::from("/definitely/not/a/volume"), PathBuf::from("/")],
        );
        let disk = source.disk().unwrap();
        assert!(disk.total_bytes > 0.0);
    }
}
