//! Wire schemas shared by the control plane and the agents.
//!
//! Every RPC is a JSON POST to `/{Service}/{Method}` answered with a
//! [`StatusResponse`]. Transport failures surface as HTTP/connection errors,
//! never as embedded fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Conventional port an agent receives probe tasks on.
pub const DEFAULT_TASK_PORT: u16 = 50051;

/// Conventional port an agent accepts probe dials on.
pub const DEFAULT_PROBE_PORT: u16 = 50052;

/// Control-plane port for node telemetry uploads.
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Control-plane port for probe result uploads.
pub const DEFAULT_RESULTS_PORT: u16 = 8081;

pub const SEND_PROBE_TASKS_PATH: &str = "/ProbeTaskService/SendProbeTasks";
pub const SEND_PROBE_RESULTS_PATH: &str = "/ProbeResultService/SendProbeResults";
pub const SEND_METRICS_PATH: &str = "/MetricsService/SendMetrics";

/// Ordered (source, destination) probe assignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProbeTask {
    pub ip1: String,
    pub ip2: String,
}

impl ProbeTask {
    pub fn new(source: impl Into<String>, dest: impl Into<String>) -> Self {
        Self {
            ip1: source.into(),
            ip2: dest.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeTaskRequest {
    pub tasks: Vec<ProbeTask>,
}

/// One successful TCP handshake measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSample {
    pub ip1: String,
    pub ip2: String,
    /// Connect latency in milliseconds.
    pub tcp_delay: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeResultRequest {
    pub results: Vec<ProbeSample>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuInfo {
    pub cores: u32,
    pub model_name: String,
    pub mhz: f64,
    pub cache_size: u32,
    pub usage: f64,
}

/// Memory figures in MB.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryInfo {
    pub total: u64,
    pub available: u64,
    pub used: u64,
    pub used_percent: f64,
}

/// Disk figures in MB.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub device: String,
    pub total: u64,
    pub free: u64,
    pub used: u64,
    pub used_percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub interface_name: String,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub os: String,
    pub platform: String,
    pub platform_version: String,
    /// Seconds since boot.
    pub uptime: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadInfo {
    pub load1: f64,
    pub load5: f64,
    pub load15: f64,
}

/// Periodic resource snapshot uploaded by an agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub ip: String,
    pub cpu_info: CpuInfo,
    pub memory_info: MemoryInfo,
    pub disk_info: DiskInfo,
    pub network_info: NetworkInfo,
    pub host_info: HostInfo,
    pub load_info: LoadInfo,
}

/// Acknowledgment outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ack {
    Ok,
    Error,
}

/// Response body of every RPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: Ack,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            status: Ack::Ok,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Ack::Error,
            message: Some(message.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Ack::Ok
    }
}
