// Resource Monitor for CoreLink
//
// Delta-based sampling of this process's resource footprint from
// /proc and /sys: CPU share, cgroup RAM against host memory, network
// throughput derived from non-disk IO, data-directory disk usage, and
// the negotiated link speed of the first physical interface. Sampling
// never fails; every reader degrades to zero on IO or parse errors.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

pub mod drift;

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Directories whose file bytes count toward the disk metric.
    pub data_dirs: Vec<PathBuf>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            data_dirs: vec![PathBuf::from("/app"), PathBuf::from("/data")],
        }
    }
}

/// Latest sampled metrics. `cpu`, `ram`, and `disk` are percentages;
/// `net_mbps` is megabits per second; `link_speed` is Mbps.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metrics {
    pub cpu: f64,
    pub ram: f64,
    pub net_mbps: f64,
    pub link_speed: u64,
    pub disk: f64,
}

/// Tracks this process's resource usage via delta-based sampling.
/// Call [`collect`](Self::collect) every few seconds from the push
/// loop, then read [`metrics`](Self::metrics).
pub struct AppMonitor {
    config: MonitorConfig,
    prev_cpu_app: u64,
    prev_cpu_total: u64,
    prev_io_net: u64,
    prev_time: Option<Instant>,
    metrics: Metrics,
}

impl AppMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let mut monitor = Self {
            config,
            prev_cpu_app: 0,
            prev_cpu_total: 0,
            prev_io_net: 0,
            prev_time: None,
            metrics: Metrics {
                link_speed: detect_link_speed(),
                ..Metrics::default()
            },
        };

        // Prime the deltas so the first collect() reports a real
        // interval instead of totals since process start.
        let (app, total) = read_cpu_ticks();
        monitor.prev_cpu_app = app;
        monitor.prev_cpu_total = total;
        monitor.prev_io_net = read_net_io_bytes();
        monitor.prev_time = Some(Instant::now());
        monitor
    }

    /// Sample all metrics over the interval since the previous call.
    pub fn collect(&mut self) {
        let now = Instant::now();
        let dt = self
            .prev_time
            .map(|t| now.duration_since(t).as_secs_f64())
            .unwrap_or(0.0);
        self.prev_time = Some(now);

        self.metrics.cpu = self.sample_cpu();
        self.metrics.ram = sample_ram();
        self.metrics.net_mbps = self.sample_net(dt);
        self.metrics.disk = self.sample_disk();
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics
    }

    pub fn link_speed(&self) -> u64 {
        self.metrics.link_speed
    }

    fn sample_cpu(&mut self) -> f64 {
        let (app, total) = read_cpu_ticks();
        let d_app = app.saturating_sub(self.prev_cpu_app);
        let d_total = total.saturating_sub(self.prev_cpu_total);
        self.prev_cpu_app = app;
        self.prev_cpu_total = total;
        cpu_percent(d_app, d_total)
    }

    fn sample_net(&mut self, dt: f64) -> f64 {
        let current = read_net_io_bytes();
        let delta = current.saturating_sub(self.prev_io_net);
        self.prev_io_net = current;
        net_mbps(delta, dt)
    }

    fn sample_disk(&self) -> f64 {
        let used: u64 = self.config.data_dirs.iter().map(|d| dir_bytes(d)).sum();
        let total = sys_info::disk_info()
            .map(|d| d.total.saturating_mul(1024))
            .unwrap_or(0);
        if total == 0 {
            return 0.0;
        }
        round_to(100.0 * used as f64 / total as f64, 100.0)
    }
}

/// App CPU share of total system ticks over one sample interval.
fn cpu_percent(d_app: u64, d_total: u64) -> f64 {
    if d_total == 0 {
        return 0.0;
    }
    round_to(100.0 * d_app as f64 / d_total as f64, 10.0)
}

/// Megabits per second from a byte delta over `dt` seconds.
fn net_mbps(delta_bytes: u64, dt: f64) -> f64 {
    if dt <= 0.0 || delta_bytes == 0 {
        return 0.0;
    }
    let bytes_per_sec = delta_bytes as f64 / dt;
    round_to(bytes_per_sec * 8.0 / 1_000_000.0, 10.0)
}

fn round_to(value: f64, scale: f64) -> f64 {
    (value * scale).round() / scale
}

/// (app_ticks, total_ticks): utime+stime summed over this process's
/// threads, against the all-CPU tick total from /proc/stat.
fn read_cpu_ticks() -> (u64, u64) {
    let mut app_ticks = 0u64;
    if let Ok(tasks) = fs::read_dir("/proc/self/task") {
        for task in tasks.flatten() {
            if let Ok(stat) = fs::read_to_string(task.path().join("stat")) {
                app_ticks += parse_stat_ticks(&stat).unwrap_or(0);
            }
        }
    }

    let total_ticks = fs::read_to_string("/proc/stat")
        .ok()
        .and_then(|s| parse_total_ticks(&s))
        .unwrap_or(0);

    (app_ticks, total_ticks)
}

/// utime + stime from one /proc/<pid>/stat line. The comm field may
/// contain spaces and parentheses, so fields are counted from the
/// last ')'.
fn parse_stat_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // After comm: state is field 0, utime field 11, stime field 12.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// Sum of all tick counters on the aggregate "cpu " line.
fn parse_total_ticks(stat: &str) -> Option<u64> {
    let line = stat.lines().next()?;
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    Some(fields.filter_map(|f| f.parse::<u64>().ok()).sum())
}

/// Container memory as a percentage of host MemTotal, read from
/// cgroup v2 with a v1 fallback.
fn sample_ram() -> f64 {
    let mem_bytes = fs::read_to_string("/sys/fs/cgroup/memory.current")
        .or_else(|_| fs::read_to_string("/sys/fs/cgroup/memory/memory.usage_in_bytes"))
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok());

    let mem_bytes = match mem_bytes {
        Some(bytes) => bytes,
        None => return 0.0,
    };

    let mem_total = sys_info::mem_info()
        .map(|m| m.total.saturating_mul(1024))
        .unwrap_or(0);
    if mem_total == 0 {
        return 0.0;
    }
    round_to(100.0 * mem_bytes as f64 / mem_total as f64, 10.0)
}

/// Approximate network bytes from /proc/self/io: non-disk IO,
/// predominantly socket traffic for this process.
fn read_net_io_bytes() -> u64 {
    fs::read_to_string("/proc/self/io")
        .ok()
        .map(|s| parse_io_bytes(&s))
        .unwrap_or(0)
}

fn parse_io_bytes(io: &str) -> u64 {
    let mut values = std::collections::HashMap::new();
    for line in io.lines() {
        if let Some((key, value)) = line.split_once(':') {
            if let Ok(value) = value.trim().parse::<u64>() {
                values.insert(key.trim().to_string(), value);
            }
        }
    }

    let get = |key: &str| values.get(key).copied().unwrap_or(0);
    let read_net = get("rchar").saturating_sub(get("read_bytes"));
    let write_net = get("wchar").saturating_sub(get("write_bytes"));
    read_net + write_net
}

/// Total file bytes under a directory tree.
fn dir_bytes(root: &Path) -> u64 {
    let mut bytes = 0u64;
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                if let Ok(metadata) = entry.metadata() {
                    bytes += metadata.len();
                }
            }
        }
    }

    bytes
}

/// Negotiated link speed (Mbps) of the first physical interface that
/// is up. Loopback and virtual interfaces are skipped.
pub fn detect_link_speed() -> u64 {
    detect_link_speed_in(Path::new("/sys/class/net"))
}

fn detect_link_speed_in(net_dir: &Path) -> u64 {
    let mut interfaces: Vec<PathBuf> = match fs::read_dir(net_dir) {
        Ok(entries) => entries.flatten().map(|e| e.path()).collect(),
        Err(_) => return 0,
    };
    interfaces.sort();

    for iface in interfaces {
        let name = match iface.file_name().and_then(|n| n.to_str()) {
            Some(name) => name,
            None => continue,
        };
        if name == "lo"
            || name.starts_with("veth")
            || name.starts_with("docker")
            || name.starts_with("br-")
        {
            continue;
        }

        let up = fs::read_to_string(iface.join("operstate"))
            .map(|s| s.trim() == "up")
            .unwrap_or(false);
        if !up {
            continue;
        }

        if let Ok(speed) = fs::read_to_string(iface.join("speed")) {
            if let Ok(speed) = speed.trim().parse::<i64>() {
                if speed > 0 {
                    return speed as u64;
                }
            }
        }
    }

    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_parse_stat_ticks() {
        // comm containing spaces and a ')' must not shift the fields.
        let stat = "1234 (tokio-runtime w)x) S 1 1 1 0 -1 4194560 100 0 0 0 250 125 0 0 20 0 4 0 100 1000000 500 18446744073709551615";
        assert_eq!(parse_stat_ticks(stat), Some(375));
    }

    #[test]
    fn test_parse_stat_ticks_malformed() {
        assert_eq!(parse_stat_ticks("no parens here"), None);
        assert_eq!(parse_stat_ticks("1 (x) S 1 2"), None);
    }

    #[test]
    fn test_parse_total_ticks() {
        let stat = "cpu  100 0 50 800 10 0 5 0 0 0\ncpu0 50 0 25 400 5 0 2 0 0 0\n";
        assert_eq!(parse_total_ticks(stat), Some(965));
        assert_eq!(parse_total_ticks("intr 12345"), None);
    }

    #[test]
    fn test_parse_io_bytes() {
        let io = "rchar: 10000\nwchar: 6000\nsyscr: 50\nsyscw: 20\nread_bytes: 4096\nwrite_bytes: 1000\ncancelled_write_bytes: 0\n";
        // (10000 - 4096) + (6000 - 1000)
        assert_eq!(parse_io_bytes(io), 10904);
        assert_eq!(parse_io_bytes(""), 0);
    }

    #[test]
    fn test_cpu_percent() {
        assert_eq!(cpu_percent(25, 100), 25.0);
        assert_eq!(cpu_percent(1, 3), 33.3);
        assert_eq!(cpu_percent(10, 0), 0.0);
    }

    #[test]
    fn test_net_mbps() {
        // 1_250_000 bytes over 1s = 10 Mbps.
        assert_eq!(net_mbps(1_250_000, 1.0), 10.0);
        assert_eq!(net_mbps(1_250_000, 2.0), 5.0);
        assert_eq!(net_mbps(0, 1.0), 0.0);
        assert_eq!(net_mbps(1000, 0.0), 0.0);
    }

    #[test]
    fn test_detect_link_speed_skips_virtual_interfaces() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();

        for (name, operstate, speed) in [
            ("br-0a1b", "up", "10000"),
            ("docker0", "up", "10000"),
            ("eth0", "up", "2500"),
            ("lo", "unknown", ""),
            ("veth77", "up", "10000"),
            ("wlan0", "down", "100"),
        ] {
            let iface = base.join(name);
            fs::create_dir(&iface).unwrap();
            fs::write(iface.join("operstate"), format!("{}\n", operstate)).unwrap();
            if !speed.is_empty() {
                fs::write(iface.join("speed"), format!("{}\n", speed)).unwrap();
            }
        }

        assert_eq!(detect_link_speed_in(base), 2500);
    }

    #[test]
    fn test_detect_link_speed_missing_dir() {
        assert_eq!(detect_link_speed_in(Path::new("/nonexistent/sysfs")), 0);
    }

    #[test]
    fn test_dir_bytes() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), vec![0u8; 1000]).unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/b.bin"), vec![0u8; 500]).unwrap();

        assert_eq!(dir_bytes(dir.path()), 1500);
        assert_eq!(dir_bytes(Path::new("/nonexistent/dir")), 0);
    }

    #[test]
    fn test_collect_never_panics() {
        let mut monitor = AppMonitor::new(MonitorConfig {
            data_dirs: vec![PathBuf::from("/nonexistent/dir")],
        });
        monitor.collect();
        monitor.collect();

        let metrics = monitor.metrics();
        assert!(metrics.cpu >= 0.0 && metrics.cpu <= 100.0);
        assert!(metrics.ram >= 0.0);
        assert!(metrics.net_mbps >= 0.0);
        assert_eq!(metrics.disk, 0.0);
    }
}
