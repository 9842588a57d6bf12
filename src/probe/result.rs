//! Values produced by probes and consumed by the sinks.

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::config::{InterfaceType, NetworkProfile, ServiceDefinition};

/// Elementary test kinds the engine can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TestKind {
    ApAssoc,
    Dhcp,
    Dns,
    HttpGet,
    TcpConnect,
    Icmp,
    VoipMos,
    Throughput,
    WifiScan,
}

/// Structured-record code of the link snapshot paired with every test row.
pub const WIFI_DATA_CODE: &str = "wifi_data";

impl TestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestKind::ApAssoc => "ap_assoc",
            TestKind::Dhcp => "dhcp",
            TestKind::Dns => "dns",
            TestKind::HttpGet => "http_get",
            TestKind::TcpConnect => "tcp_connect",
            TestKind::Icmp => "icmp",
            TestKind::VoipMos => "voip_mos",
            TestKind::Throughput => "throughput",
            TestKind::WifiScan => "wifi_scan",
        }
    }

    /// Test-type code written to the structured record file.
    ///
    /// TCP connect, ICMP and VoIP rows all share the `ping` code.
    pub fn record_code(&self) -> &'static str {
        match self {
            TestKind::ApAssoc => "ap_assoc",
            TestKind::Dhcp => "dhcp",
            TestKind::Dns => "dns",
            TestKind::HttpGet => "http_get",
            TestKind::TcpConnect | TestKind::Icmp | TestKind::VoipMos => "ping",
            TestKind::Throughput => "throughput",
            TestKind::WifiScan => "wifi_scan",
        }
    }
}

/// Numeric outcome of one probe execution.
///
/// `elapsed_s` is in seconds; latency and jitter in milliseconds; packet loss
/// as a percentage; speeds in megabits per second.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Measurement {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_s: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packet_loss_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mos: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_mbps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_mbps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Measurement {
    pub fn ok(elapsed_s: f64) -> Self {
        Self {
            success: true,
            elapsed_s: Some(elapsed_s),
            ..Default::default()
        }
    }

    pub fn failed(error: impl ToString, elapsed_s: Option<f64>) -> Self {
        Self {
            success: false,
            elapsed_s,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }

    /// Loss to assume for liveness and quality. A failed probe with no
    /// measured loss counts as fully lost.
    pub fn effective_loss_pct(&self) -> f64 {
        match self.packet_loss_pct {
            Some(loss) => loss,
            None if self.success => 0.0,
            None => 100.0,
        }
    }
}

/// Network identity carried by every record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkRef {
    pub name: String,
    pub alias: String,
    pub uid: String,
    pub interface_type: &'static str,
    pub iface: String,
    #[serde(skip)]
    pub kind: InterfaceType,
}

impl From<&NetworkProfile> for NetworkRef {
    fn from(network: &NetworkProfile) -> Self {
        let kind = network.interface_type();
        Self {
            name: network.name.clone(),
            alias: network.alias().to_string(),
            uid: network.uid(),
            interface_type: kind.as_str(),
            iface: network.iface.clone(),
            kind,
        }
    }
}

/// Service identity for per-service tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceRef {
    pub scope: &'static str,
    pub name: String,
    pub uid: String,
    /// Host used for probing, without scheme or port.
    pub host: String,
}

impl ServiceRef {
    pub fn new(service: &ServiceDefinition) -> Self {
        Self {
            scope: service.scope.as_str(),
            name: service.name.clone(),
            uid: service.uid(),
            host: service.host().unwrap_or_default(),
        }
    }
}

/// One elementary test outcome, fanned out to every sink.
#[derive(Debug, Clone)]
pub struct TestResult {
    pub timestamp: DateTime<Local>,
    pub cycle: u64,
    pub kind: TestKind,
    pub network: NetworkRef,
    pub service: Option<ServiceRef>,
    /// Target as written to records; empty for association and DHCP.
    pub target: String,
    pub measurement: Measurement,
}

/// Link metrics of the current association. Empty for wired networks.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WifiSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bssid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi_dbm: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub freq_mhz: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub band: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_bitrate_mbps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rx_bitrate_mbps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_busy_pct: Option<f64>,
}

impl WifiSnapshot {
    pub fn is_empty(&self) -> bool {
        *self == WifiSnapshot::default()
    }
}

/// A nearby access point seen by an environment scan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccessPoint {
    pub bssid: String,
    pub ssid: String,
    pub rssi_dbm: f64,
    pub freq_mhz: Option<u32>,
    pub band: Option<&'static str>,
    pub channel: Option<u32>,
    pub width_mhz: u32,
}

/// Outcome of an environment scan.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub timestamp: DateTime<Local>,
    pub cycle: u64,
    pub network: NetworkRef,
    pub iface: String,
    pub access_points: Vec<AccessPoint>,
    /// Entries that aged out of the freshness window this scan.
    pub expired: Vec<AccessPoint>,
    pub error: Option<String>,
}
