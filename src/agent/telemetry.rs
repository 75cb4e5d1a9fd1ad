use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RpcConfig;
use crate::export::HealthMetrics;
use crate::proto::{CpuInfo, DiskInfo, HostInfo, LoadInfo, MemoryInfo, NetworkInfo, NodeSnapshot};
use crate::rpc::RpcClient;

const MB: u64 = 1024 * 1024;

/// Cumulative CPU jiffies from the aggregate `cpu` line of /proc/stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Reads node resources from procfs and statvfs.
///
/// Missing or unreadable sources leave their section at its defaults rather
/// than failing the snapshot.
pub struct TelemetryCollector {
    ip: String,
    disk_path: String,
    last_cpu: Mutex<Option<CpuTimes>>,
}

impl TelemetryCollector {
    pub fn new(ip: impl Into<String>, disk_path: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            disk_path: disk_path.into(),
            last_cpu: Mutex::new(None),
        }
    }

    /// Takes one snapshot. CPU usage covers the time since the previous call,
    /// or since boot on the first.
    pub fn collect(&self) -> NodeSnapshot {
        let cpuinfo = read_text_file("/proc/cpuinfo").unwrap_or_default();
        let mut cpu_info = parse_cpuinfo(&cpuinfo);
        cpu_info.usage = self.cpu_usage();

        let meminfo = read_text_file("/proc/meminfo").unwrap_or_default();
        let net_dev = read_text_file("/proc/net/dev").unwrap_or_default();
        let os_release = read_text_file("/etc/os-release").unwrap_or_default();
        let (platform, platform_version) = parse_os_release(&os_release);

        NodeSnapshot {
            ip: self.ip.clone(),
            cpu_info,
            memory_info: parse_meminfo(&meminfo).unwrap_or_default(),
            disk_info: read_disk(&self.disk_path).unwrap_or_default(),
            network_info: parse_net_dev(&net_dev).unwrap_or_default(),
            host_info: HostInfo {
                hostname: read_text_file("/proc/sys/kernel/hostname").unwrap_or_default(),
                os: std::env::consts::OS.to_string(),
                platform,
                platform_version,
                uptime: read_text_file("/proc/uptime")
                    .as_deref()
                    .and_then(parse_uptime)
                    .unwrap_or(0),
            },
            load_info: read_text_file("/proc/loadavg")
                .as_deref()
                .and_then(parse_loadavg)
                .unwrap_or_default(),
        }
    }

    fn cpu_usage(&self) -> f64 {
        let Some(now) = read_text_file("/proc/stat").as_deref().and_then(parse_cpu_times) else {
            return 0.0;
        };

        let previous = self.last_cpu.lock().replace(now);
        cpu_usage_between(previous, now)
    }
}

/// Periodically uploads snapshots to the control plane's metrics service.
pub struct TelemetryReporter {
    collector: TelemetryCollector,
    metrics_addr: String,
    rpc: RpcConfig,
    interval: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl TelemetryReporter {
    pub fn new(
        collector: TelemetryCollector,
        metrics_addr: String,
        rpc: RpcConfig,
        interval: Duration,
        health: Option<Arc<HealthMetrics>>,
    ) -> Self {
        Self {
            collector,
            metrics_addr,
            rpc,
            interval,
            health,
        }
    }

    /// Collects and uploads one snapshot.
    pub async fn report_once(&self) -> Result<()> {
        let snapshot = self.collector.collect();

        let client = RpcClient::connect(&self.metrics_addr, &self.rpc)
            .await
            .context("connecting to metrics service")?;

        client
            .send_metrics(&snapshot)
            .await
            .context("uploading node snapshot")?;

        debug!(
            cpu_usage = snapshot.cpu_info.usage,
            mem_used_percent = snapshot.memory_info.used_percent,
            "node snapshot uploaded"
        );

        Ok(())
    }

    /// Uploads immediately, then once per interval until `cancel` fires.
    ///
    /// The first upload registers this agent as a mesh participant.
    pub async fn run(self, cancel: CancellationToken) {
        info!(addr = %self.metrics_addr, interval = ?self.interval, "telemetry reporter started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let status = match self.report_once().await {
                        Ok(()) => "ok",
                        Err(e) => {
                            warn!(error = %format!("{e:#}"), "telemetry upload failed");
                            "error"
                        }
                    };

                    if let Some(health) = &self.health {
                        health.telemetry_uploads.with_label_values(&[status]).inc();
                    }
                }
            }
        }
    }
}

fn read_text_file(path: &str) -> Option<String> {
    let text = fs::read_to_string(path).ok()?;
    Some(text.trim().to_string())
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    round2(part as f64 / whole as f64 * 100.0)
}

fn field_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let (k, v) = line.split_once(':')?;
    (k.trim() == key).then(|| v.trim())
}

/// Cores, model, clock and cache size of the first processor entry.
fn parse_cpuinfo(cpuinfo: &str) -> CpuInfo {
    let mut info = CpuInfo::default();
    let mut processors = 0u32;

    for line in cpuinfo.lines() {
        if field_value(line, "processor").is_some() {
            processors = processors.saturating_add(1);
            continue;
        }
        if info.model_name.is_empty() {
            if let Some(v) = field_value(line, "model name") {
                info.model_name = v.to_string();
                continue;
            }
        }
        if info.cores == 0 {
            if let Some(v) = field_value(line, "cpu cores").and_then(|v| v.parse().ok()) {
                info.cores = v;
                continue;
            }
        }
        if info.mhz == 0.0 {
            if let Some(v) = field_value(line, "cpu MHz").and_then(|v| v.parse().ok()) {
                info.mhz = v;
                continue;
            }
        }
        if info.cache_size == 0 {
            if let Some(v) = field_value(line, "cache size")
                .and_then(|v| v.split_whitespace().next())
                .and_then(|v| v.parse().ok())
            {
                info.cache_size = v;
            }
        }
    }

    if info.cores == 0 {
        info.cores = processors.max(1);
    }

    info
}

fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();

    if values.len() < 4 {
        return None;
    }

    // idle + iowait
    let idle = values[3] + values.get(4).copied().unwrap_or(0);
    // guest time is already included in user/nice.
    let total = values.iter().take(8).sum();

    Some(CpuTimes { idle, total })
}

fn cpu_usage_between(previous: Option<CpuTimes>, now: CpuTimes) -> f64 {
    let (idle, total) = match previous {
        Some(prev) if now.total > prev.total => (
            now.idle.saturating_sub(prev.idle),
            now.total - prev.total,
        ),
        Some(_) => return 0.0,
        None => (now.idle, now.total),
    };

    percent(total.saturating_sub(idle), total)
}

fn parse_meminfo(meminfo: &str) -> Option<MemoryInfo> {
    let mut total = None;
    let mut available = None;
    let mut free_buffers_cached = 0u64;

    for line in meminfo.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let Some(kb) = rest.split_whitespace().next().and_then(|v| v.parse::<u64>().ok()) else {
            continue;
        };

        match key {
            "MemTotal" => total = Some(kb * 1024),
            "MemAvailable" => available = Some(kb * 1024),
            "MemFree" | "Buffers" | "Cached" => free_buffers_cached += kb * 1024,
            _ => {}
        }
    }

    let total = total?;
    let available = available.unwrap_or(free_buffers_cached).min(total);
    let used = total - available;

    Some(MemoryInfo {
        total: total / MB,
        available: available / MB,
        used: used / MB,
        used_percent: percent(used, total),
    })
}

/// Counters of the first non-loopback interface.
fn parse_net_dev(net_dev: &str) -> Option<NetworkInfo> {
    for line in net_dev.lines().skip(2) {
        let Some((name, counters)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name == "lo" {
            continue;
        }

        let fields: Vec<u64> = counters
            .split_whitespace()
            .filter_map(|v| v.parse().ok())
            .collect();
        if fields.len() < 10 {
            continue;
        }

        return Some(NetworkInfo {
            interface_name: name.to_string(),
            bytes_recv: fields[0],
            packets_recv: fields[1],
            bytes_sent: fields[8],
            packets_sent: fields[9],
        });
    }

    None
}

fn strip_quotes(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(s)
}

/// (ID, VERSION_ID) from os-release.
fn parse_os_release(content: &str) -> (String, String) {
    let mut id = String::new();
    let mut version = String::new();

    for line in content.lines() {
        if let Some(v) = line.strip_prefix("ID=") {
            id = strip_quotes(v).to_string();
        } else if let Some(v) = line.strip_prefix("VERSION_ID=") {
            version = strip_quotes(v).to_string();
        }
    }

    (id, version)
}

fn parse_uptime(text: &str) -> Option<u64> {
    let secs: f64 = text.split_whitespace().next()?.parse().ok()?;
    Some(secs as u64)
}

fn parse_loadavg(text: &str) -> Option<LoadInfo> {
    let mut fields = text.split_whitespace().map(|v| v.parse::<f64>().ok());

    Some(LoadInfo {
        load1: round2(fields.next()??),
        load5: round2(fields.next()??),
        load15: round2(fields.next()??),
    })
}

/// Mount source backing `path`, from /proc/mounts.
fn mount_device(mounts: &str, path: &str) -> Option<String> {
    mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let device = fields.next()?;
            let mount_point = fields.next()?;
            Some((device, mount_point))
        })
        .filter(|(_, mount_point)| *mount_point == path)
        .last()
        .map(|(device, _)| device.to_string())
}

fn read_disk(path: &str) -> Option<DiskInfo> {
    let c_path = std::ffi::CString::new(path).ok()?;

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
        return None;
    }

    let block_size = stat.f_frsize as u64;
    let total = stat.f_blocks as u64 * block_size;
    let free = stat.f_bavail as u64 * block_size;
    let used = total.saturating_sub(stat.f_bfree as u64 * block_size);

    let mounts = read_text_file("/proc/mounts").unwrap_or_default();

    Some(DiskInfo {
        device: mount_device(&mounts, path).unwrap_or_else(|| path.to_string()),
        total: total / MB,
        free: free / MB,
        used: used / MB,
        used_percent: percent(used, used + free),
    })
}
