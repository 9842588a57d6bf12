//! Configuration module for netsensor.
//!
//! The sensor reads one YAML document at startup. Values may be overridden by
//! environment variables prefixed with `NETSENSOR_`; nested keys are separated
//! with a double underscore (`NETSENSOR_WIFI_ENVIRONMENT__MAX_APS=20`).
//!
//! Parsing happens in two stages: figment deserialises the document into the
//! loosely typed `Raw*` structs, then [`RawConfig::validate`] turns it into the
//! immutable [`Config`] or fails with a [`ConfigError`]. Nothing is probed
//! before validation succeeds.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Networks beyond this count are ignored.
pub const MAX_NETWORKS: usize = 4;

/// Configuration error types. All of them are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    Missing(PathBuf),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] figment::Error),
    #[error("service '{service}': unknown frequency label '{label}'")]
    UnknownFrequency { service: String, label: String },
    #[error("service '{service}': unknown test kind '{test}'")]
    UnknownTest { service: String, test: String },
    #[error("threshold '{name}' must be {rule}, got {value}")]
    Threshold {
        name: &'static str,
        rule: &'static str,
        value: f64,
    },
    #[error("no enabled wifi or wired network configured")]
    NoNetworks,
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ============================================================================
// Frequency labels
// ============================================================================

/// Polling interval of a service, from a fixed set of labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Frequency {
    Fastest,
    TenMinutes,
    TwentyMinutes,
    ThirtyMinutes,
    OneHour,
    TwoHours,
    FourHours,
    SixHours,
    TwelveHours,
}

impl Frequency {
    pub const ALL: [Frequency; 9] = [
        Frequency::Fastest,
        Frequency::TenMinutes,
        Frequency::TwentyMinutes,
        Frequency::ThirtyMinutes,
        Frequency::OneHour,
        Frequency::TwoHours,
        Frequency::FourHours,
        Frequency::SixHours,
        Frequency::TwelveHours,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Frequency::Fastest => "fastest",
            Frequency::TenMinutes => "10min",
            Frequency::TwentyMinutes => "20min",
            Frequency::ThirtyMinutes => "30min",
            Frequency::OneHour => "1hr",
            Frequency::TwoHours => "2hr",
            Frequency::FourHours => "4hr",
            Frequency::SixHours => "6hr",
            Frequency::TwelveHours => "12hr",
        }
    }

    /// Minimum seconds between two runs. Zero means every cycle.
    pub fn interval_seconds(&self) -> i64 {
        match self {
            Frequency::Fastest => 0,
            Frequency::TenMinutes => 600,
            Frequency::TwentyMinutes => 1200,
            Frequency::ThirtyMinutes => 1800,
            Frequency::OneHour => 3600,
            Frequency::TwoHours => 7200,
            Frequency::FourHours => 14400,
            Frequency::SixHours => 21600,
            Frequency::TwelveHours => 43200,
        }
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Frequency::ALL
            .into_iter()
            .find(|f| f.label() == wanted)
            .ok_or_else(|| s.to_string())
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Service tests
// ============================================================================

/// A test kind a service can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceTest {
    /// HTTP GET on port 80 and on port 443.
    Http,
    Tcp80,
    Tcp443,
    Icmp,
    VoipMos,
    Throughput,
}

impl ServiceTest {
    /// Parse a test name, accepting the aliases older configs use.
    pub fn parse(value: &str) -> Option<Self> {
        let key = value.trim().to_ascii_lowercase().replace('-', "_");
        let test = match key.as_str() {
            "icmp" | "ping" | "icmp_ping" => ServiceTest::Icmp,
            "http" | "http_2xx" | "https" => ServiceTest::Http,
            "tcp_80" | "tcp80" | "tcp:80" => ServiceTest::Tcp80,
            "tcp_443" | "tcp443" | "tcp:443" => ServiceTest::Tcp443,
            "voip_mos" | "voip" | "mos" => ServiceTest::VoipMos,
            "throughput" | "speedtest" => ServiceTest::Throughput,
            _ => return None,
        };
        Some(test)
    }
}

/// Which service list a definition came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Internal,
    External,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Internal => "internal",
            Scope::External => "external",
        }
    }
}

/// A validated service entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceDefinition {
    pub scope: Scope,
    pub name: String,
    /// Hostname, IP or URL. `None` only for throughput-only services.
    pub target: Option<String>,
    /// De-duplicated, in configured order.
    pub tests: Vec<ServiceTest>,
    pub frequency: Frequency,
}

impl ServiceDefinition {
    /// Host part of the target, with any URL scheme, port or path removed.
    pub fn host(&self) -> Option<String> {
        let target = self.target.as_deref()?;
        Some(extract_host(target))
    }

    pub fn target_label(&self) -> &str {
        self.target.as_deref().unwrap_or("")
    }

    pub fn requests(&self, test: ServiceTest) -> bool {
        self.tests.contains(&test)
    }

    /// Key under which the schedule tracker remembers this service on a network.
    pub fn schedule_key(&self, network: &NetworkProfile) -> String {
        format!(
            "{}:{}:{}:{}",
            network.name,
            self.scope.as_str(),
            self.name,
            self.target_label()
        )
    }

    /// Identifier that stays the same across restarts.
    pub fn uid(&self) -> String {
        let key = format!("{}::{}::{}", self.scope.as_str(), self.name, self.target_label());
        format!("svc-{}", stable_hex(&key, 12))
    }
}

/// Extract hostname or IP from a target that may be a URL.
pub fn extract_host(target: &str) -> String {
    if target.contains("://") {
        if let Ok(url) = reqwest::Url::parse(target) {
            if let Some(host) = url.host_str() {
                return host.trim_matches(|c| c == '[' || c == ']').to_string();
            }
        }
    }
    target.to_string()
}

/// Short stable hex digest used for identifiers.
pub fn stable_hex(value: &str, length: usize) -> String {
    let digest = hex::encode(Sha256::digest(value.as_bytes()));
    digest[..length.min(digest.len())].to_string()
}

// ============================================================================
// Networks
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceType {
    Wifi,
    Wired,
}

impl InterfaceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InterfaceType::Wifi => "wifi",
            InterfaceType::Wired => "wired",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WifiAuth {
    Psk,
    /// WPA-Enterprise (802.1X).
    Enterprise {
        eap_method: String,
        identity: String,
        phase2_auth: Option<String>,
        anonymous_identity: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct WifiProfile {
    pub ssid: String,
    pub password: Option<String>,
    pub auth: WifiAuth,
    /// Pins association to one access point.
    pub bssid_lock: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkProfile {
    pub name: String,
    pub iface: String,
    pub wifi: Option<WifiProfile>,
}

impl NetworkProfile {
    pub fn interface_type(&self) -> InterfaceType {
        if self.wifi.is_some() {
            InterfaceType::Wifi
        } else {
            InterfaceType::Wired
        }
    }

    /// SSID for WiFi networks, configured name otherwise.
    pub fn alias(&self) -> &str {
        match &self.wifi {
            Some(wifi) => &wifi.ssid,
            None => &self.name,
        }
    }

    pub fn uid(&self) -> String {
        match &self.wifi {
            Some(wifi) => format!("ssid-{}", stable_hex(&wifi.ssid, 12)),
            None => {
                let key = format!("wired::{}::{}", self.name, self.iface);
                format!("net-{}", stable_hex(&key, 12))
            }
        }
    }
}

// ============================================================================
// Feature settings
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThroughputMethod {
    /// Direct URL download/upload timing.
    Http,
    /// Parallel CDN downloads plus a single upload.
    Fastcom,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ThroughputSettings {
    pub enabled: bool,
    pub method: ThroughputMethod,
    pub url: String,
    pub upload_url: Option<String>,
    pub connections: usize,
    pub upload_bytes: usize,
    pub fastcom_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationSettings {
    pub enabled: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address_notes: String,
    pub lookup: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WifiScanLimits {
    pub enabled: bool,
    pub max_aps: usize,
    pub min_rssi_dbm: f64,
    pub ttl: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncidentThresholds {
    pub dns_ms: f64,
    pub dhcp_ms: f64,
    pub packet_loss_pct: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub association_ms: f64,
    pub http_ms: f64,
    /// The only threshold expressed as a non-positive value.
    pub rssi_dbm: f64,
}

/// Calibration of the connection quality score.
#[derive(Debug, Clone, PartialEq)]
pub struct QualityWeights {
    pub loss_weight: f64,
    pub latency_weight: f64,
    pub jitter_weight: f64,
    pub rssi_weight: f64,
    pub loss_span_pct: f64,
    pub latency_span_ms: f64,
    pub jitter_span_ms: f64,
    pub rssi_span_db: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Timeouts {
    pub association: Duration,
    pub dhcp: Duration,
    pub dns: Duration,
    pub icmp: Duration,
    pub http: Duration,
    pub tcp: Duration,
    pub throughput: Duration,
    pub scan: Duration,
}

/// Fully validated sensor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub sensor_name: String,
    pub sensor_id: String,
    pub metrics_port: u16,
    pub log_path: PathBuf,
    pub schedule_state_path: PathBuf,
    pub structured_export_enabled: bool,
    pub structured_export_path: PathBuf,
    pub dns_domain: String,
    pub dns_servers: Vec<String>,
    pub inter_test_delay: Duration,
    pub inter_cycle_delay: Duration,
    pub ping_count: u32,
    pub tcp_attempts: u32,
    pub timeouts: Timeouts,
    pub networks: Vec<NetworkProfile>,
    /// Internal services first, then external, each in configured order.
    pub services: Vec<ServiceDefinition>,
    pub throughput: ThroughputSettings,
    pub location: LocationSettings,
    pub wifi_scan: WifiScanLimits,
    pub thresholds: IncidentThresholds,
    pub quality: QualityWeights,
}

impl Config {
    /// Load and validate the configuration at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::Missing(path.to_path_buf()));
        }

        let raw: RawConfig = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("NETSENSOR_").split("__"))
            .extract()?;

        raw.validate()
    }

    /// Parse a YAML document without environment overrides.
    #[cfg(test)]
    pub fn from_yaml(document: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = Figment::new().merge(Yaml::string(document)).extract()?;
        raw.validate()
    }
}

// ============================================================================
// Raw document
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub sensor_name: Option<String>,
    pub sensor_id: Option<String>,
    pub metrics_port: Option<u16>,
    pub log_path: Option<PathBuf>,
    pub schedule_state_path: Option<PathBuf>,
    pub structured_export: RawStructuredExport,
    pub dns_domain: Option<String>,
    pub dns_servers: Vec<String>,
    pub inter_test_delay_seconds: Option<f64>,
    pub inter_cycle_delay_seconds: Option<f64>,
    pub ping_count: Option<u32>,
    pub tcp_attempts: Option<u32>,
    pub timeouts: RawTimeouts,
    pub wifi: Vec<RawWifi>,
    pub wired: Vec<RawWired>,
    pub services: RawServices,
    pub throughput_test: RawThroughput,
    pub location: RawLocation,
    pub wifi_environment: RawWifiEnvironment,
    pub incident_thresholds: RawThresholds,
    pub quality_score: RawQuality,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawStructuredExport {
    pub enabled: bool,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawTimeouts {
    pub association_seconds: Option<f64>,
    pub dhcp_seconds: Option<f64>,
    pub dns_seconds: Option<f64>,
    pub icmp_seconds: Option<f64>,
    pub http_seconds: Option<f64>,
    pub tcp_seconds: Option<f64>,
    pub throughput_seconds: Option<f64>,
    pub scan_seconds: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawWifi {
    pub name: Option<String>,
    pub iface: Option<String>,
    pub ssid: Option<String>,
    pub password: Option<String>,
    pub eap_method: Option<String>,
    pub phase2_auth: Option<String>,
    pub identity: Option<String>,
    pub anonymous_identity: Option<String>,
    pub bssid_lock: Option<String>,
    pub enabled: bool,
}

impl Default for RawWifi {
    fn default() -> Self {
        Self {
            name: None,
            iface: None,
            ssid: None,
            password: None,
            eap_method: None,
            phase2_auth: None,
            identity: None,
            anonymous_identity: None,
            bssid_lock: None,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawWired {
    pub name: Option<String>,
    pub iface: Option<String>,
    pub enabled: bool,
}

impl Default for RawWired {
    fn default() -> Self {
        Self {
            name: None,
            iface: None,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawServices {
    pub internal: Vec<RawService>,
    pub external: Vec<RawService>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawService {
    pub name: Option<String>,
    #[serde(alias = "host", alias = "address")]
    pub target: Option<String>,
    pub tests: Vec<String>,
    pub frequency: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawThroughput {
    pub enabled: bool,
    pub method: Option<String>,
    pub url: Option<String>,
    pub upload_url: Option<String>,
    pub connections: Option<usize>,
    pub upload_bytes: Option<usize>,
    pub fastcom_urls: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawLocation {
    pub enabled: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub address_notes: Option<String>,
    pub lookup: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawWifiEnvironment {
    pub enabled: bool,
    pub max_aps: usize,
    pub min_rssi_dbm: f64,
    pub ttl_seconds: u64,
}

impl Default for RawWifiEnvironment {
    fn default() -> Self {
        Self {
            enabled: true,
            max_aps: 40,
            min_rssi_dbm: -90.0,
            ttl_seconds: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawThresholds {
    pub dns_ms: f64,
    pub dhcp_ms: f64,
    pub packet_loss_pct: f64,
    pub latency_ms: f64,
    pub jitter_ms: f64,
    pub association_ms: f64,
    pub http_ms: f64,
    pub rssi_dbm: f64,
}

impl Default for RawThresholds {
    fn default() -> Self {
        Self {
            dns_ms: 200.0,
            dhcp_ms: 1500.0,
            packet_loss_pct: 5.0,
            latency_ms: 100.0,
            jitter_ms: 50.0,
            association_ms: 10000.0,
            http_ms: 3000.0,
            rssi_dbm: -75.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawQuality {
    pub loss_weight: f64,
    pub latency_weight: f64,
    pub jitter_weight: f64,
    pub rssi_weight: f64,
    pub loss_span_pct: f64,
    pub latency_span_ms: f64,
    pub jitter_span_ms: f64,
    pub rssi_span_db: f64,
}

impl Default for RawQuality {
    fn default() -> Self {
        Self {
            loss_weight: 40.0,
            latency_weight: 25.0,
            jitter_weight: 15.0,
            rssi_weight: 20.0,
            loss_span_pct: 20.0,
            latency_span_ms: 200.0,
            jitter_span_ms: 50.0,
            rssi_span_db: 15.0,
        }
    }
}

const DEFAULT_FASTCOM_URLS: [&str; 3] = [
    "https://speed.cloudflare.com/__down?bytes=10000000",
    "https://proof.ovh.net/files/10Mb.dat",
    "http://speedtest.tele2.net/10MB.zip",
];

impl RawConfig {
    /// Validate the raw document into an immutable [`Config`].
    pub fn validate(self) -> Result<Config, ConfigError> {
        let sensor_name = non_empty(self.sensor_name).unwrap_or_else(local_hostname);
        let sensor_id = non_empty(self.sensor_id)
            .unwrap_or_else(|| format!("sensor-{}", stable_hex(&sensor_name, 16)));

        let metrics_port = self.metrics_port.unwrap_or(9105);
        if metrics_port == 0 {
            return Err(ConfigError::Invalid("metrics_port must be non-zero".into()));
        }

        let networks = build_networks(self.wifi, self.wired)?;
        let services = build_services(self.services)?;

        let thresholds = validate_thresholds(self.incident_thresholds)?;
        let quality = validate_quality(self.quality_score)?;

        let wifi_env = self.wifi_environment;
        if wifi_env.enabled && wifi_env.max_aps == 0 {
            return Err(ConfigError::Invalid(
                "wifi_environment.max_aps must be at least 1".into(),
            ));
        }
        require_finite("wifi_environment.min_rssi_dbm", wifi_env.min_rssi_dbm)?;

        let throughput = build_throughput(self.throughput_test)?;

        Ok(Config {
            sensor_name,
            sensor_id,
            metrics_port,
            log_path: self
                .log_path
                .unwrap_or_else(|| PathBuf::from("logs/results.jsonl")),
            schedule_state_path: self
                .schedule_state_path
                .unwrap_or_else(|| PathBuf::from("state/schedule.json")),
            structured_export_enabled: self.structured_export.enabled,
            structured_export_path: self
                .structured_export
                .path
                .unwrap_or_else(|| PathBuf::from("logs/raw-data-report.csv")),
            dns_domain: non_empty(self.dns_domain).unwrap_or_else(|| "example.com".into()),
            dns_servers: self
                .dns_servers
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .take(2)
                .collect(),
            inter_test_delay: seconds("inter_test_delay_seconds", self.inter_test_delay_seconds, 0.0)?,
            inter_cycle_delay: seconds(
                "inter_cycle_delay_seconds",
                self.inter_cycle_delay_seconds,
                0.0,
            )?,
            ping_count: self.ping_count.unwrap_or(10).max(1),
            tcp_attempts: self.tcp_attempts.unwrap_or(10).max(1),
            timeouts: build_timeouts(self.timeouts)?,
            networks,
            services,
            throughput,
            location: LocationSettings {
                enabled: self.location.enabled,
                latitude: self.location.latitude,
                longitude: self.location.longitude,
                address_notes: self.location.address_notes.unwrap_or_default(),
                lookup: self.location.lookup,
            },
            wifi_scan: WifiScanLimits {
                enabled: wifi_env.enabled,
                max_aps: wifi_env.max_aps,
                min_rssi_dbm: wifi_env.min_rssi_dbm,
                ttl: Duration::from_secs(wifi_env.ttl_seconds),
            },
            thresholds,
            quality,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn local_hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "netsensor".to_string())
}

fn require_finite(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ConfigError::Threshold {
            name,
            rule: "a finite number",
            value,
        })
    }
}

fn require_non_negative(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::Threshold {
            name,
            rule: "finite and non-negative",
            value,
        })
    }
}

fn seconds(name: &'static str, value: Option<f64>, default: f64) -> Result<Duration, ConfigError> {
    let secs = require_non_negative(name, value.unwrap_or(default))?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| ConfigError::Invalid(format!("{name} is out of range: {secs}")))
}

fn build_timeouts(raw: RawTimeouts) -> Result<Timeouts, ConfigError> {
    let budget = |name: &'static str, value: Option<f64>, default: f64| {
        let d = seconds(name, value, default)?;
        if d.is_zero() {
            return Err(ConfigError::Invalid(format!("timeouts.{name} must be positive")));
        }
        Ok(d)
    };

    Ok(Timeouts {
        association: budget("association_seconds", raw.association_seconds, 30.0)?,
        dhcp: budget("dhcp_seconds", raw.dhcp_seconds, 60.0)?,
        dns: budget("dns_seconds", raw.dns_seconds, 2.0)?,
        icmp: budget("icmp_seconds", raw.icmp_seconds, 12.0)?,
        http: budget("http_seconds", raw.http_seconds, 5.0)?,
        tcp: budget("tcp_seconds", raw.tcp_seconds, 2.0)?,
        throughput: budget("throughput_seconds", raw.throughput_seconds, 20.0)?,
        scan: budget("scan_seconds", raw.scan_seconds, 15.0)?,
    })
}

fn build_networks(wifi: Vec<RawWifi>, wired: Vec<RawWired>) -> Result<Vec<NetworkProfile>, ConfigError> {
    let mut networks = Vec::new();

    for entry in wifi.into_iter().filter(|w| w.enabled) {
        let ssid = non_empty(entry.ssid).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "wifi entry '{}' is enabled but has an empty ssid",
                entry.name.as_deref().unwrap_or("unnamed")
            ))
        })?;
        let iface = non_empty(entry.iface).ok_or_else(|| {
            ConfigError::Invalid(format!("wifi entry '{ssid}' has no iface"))
        })?;

        let auth = match (non_empty(entry.eap_method), non_empty(entry.identity)) {
            (Some(eap_method), Some(identity)) => WifiAuth::Enterprise {
                eap_method,
                identity,
                phase2_auth: non_empty(entry.phase2_auth),
                anonymous_identity: non_empty(entry.anonymous_identity),
            },
            (Some(_), None) => {
                return Err(ConfigError::Invalid(format!(
                    "wifi entry '{ssid}' sets eap_method without identity"
                )))
            }
            _ => WifiAuth::Psk,
        };

        networks.push(NetworkProfile {
            name: non_empty(entry.name).unwrap_or_else(|| format!("wifi-{ssid}")),
            iface,
            wifi: Some(WifiProfile {
                ssid,
                password: entry.password.filter(|p| !p.is_empty()),
                auth,
                bssid_lock: non_empty(entry.bssid_lock),
            }),
        });
    }

    for entry in wired.into_iter().filter(|w| w.enabled) {
        let iface = non_empty(entry.iface)
            .ok_or_else(|| ConfigError::Invalid("wired entry has no iface".into()))?;
        networks.push(NetworkProfile {
            name: non_empty(entry.name).unwrap_or_else(|| format!("wired-{iface}")),
            iface,
            wifi: None,
        });
    }

    if networks.is_empty() {
        return Err(ConfigError::NoNetworks);
    }
    if networks.len() > MAX_NETWORKS {
        tracing::warn!(
            "{} networks configured, using the first {}",
            networks.len(),
            MAX_NETWORKS
        );
        networks.truncate(MAX_NETWORKS);
    }

    Ok(networks)
}

fn build_services(raw: RawServices) -> Result<Vec<ServiceDefinition>, ConfigError> {
    let mut services = Vec::new();
    let scoped = raw
        .internal
        .into_iter()
        .map(|s| (Scope::Internal, s))
        .chain(raw.external.into_iter().map(|s| (Scope::External, s)));

    for (scope, entry) in scoped {
        let target = non_empty(entry.target);
        let name = non_empty(entry.name)
            .or_else(|| target.clone())
            .unwrap_or_else(|| "unnamed".to_string());

        let mut tests = Vec::new();
        for value in &entry.tests {
            let test = ServiceTest::parse(value).ok_or_else(|| ConfigError::UnknownTest {
                service: name.clone(),
                test: value.clone(),
            })?;
            if !tests.contains(&test) {
                tests.push(test);
            }
        }
        if tests.is_empty() {
            tracing::warn!("Service {} has no tests, defaulting to icmp", name);
            tests.push(ServiceTest::Icmp);
        }

        let label = entry.frequency.unwrap_or_else(|| "fastest".to_string());
        let frequency = label
            .parse::<Frequency>()
            .map_err(|label| ConfigError::UnknownFrequency {
                service: name.clone(),
                label,
            })?;

        let throughput_only = tests == [ServiceTest::Throughput];
        match (&target, throughput_only) {
            (Some(target), true) => {
                return Err(ConfigError::Invalid(format!(
                    "service '{name}' only runs throughput but names target '{target}'; \
                     throughput uses throughput_test urls"
                )))
            }
            (None, false) => {
                return Err(ConfigError::Invalid(format!(
                    "service '{name}' needs a target"
                )))
            }
            _ => {}
        }

        services.push(ServiceDefinition {
            scope,
            name,
            target,
            tests,
            frequency,
        });
    }

    Ok(services)
}

fn build_throughput(raw: RawThroughput) -> Result<ThroughputSettings, ConfigError> {
    let method = match raw.method.as_deref().map(|m| m.trim().to_ascii_lowercase()) {
        None => ThroughputMethod::Http,
        Some(m) if m == "http" => ThroughputMethod::Http,
        Some(m) if m == "fastcom" || m == "fast.com" => ThroughputMethod::Fastcom,
        Some(other) => {
            return Err(ConfigError::Invalid(format!(
                "throughput_test.method '{other}' is not http or fastcom"
            )))
        }
    };

    let url = non_empty(raw.url)
        .unwrap_or_else(|| "https://speed.cloudflare.com/__down?bytes=10000000".to_string());
    let fastcom_urls = if raw.fastcom_urls.is_empty() {
        DEFAULT_FASTCOM_URLS.iter().map(|s| s.to_string()).collect()
    } else {
        raw.fastcom_urls
    };

    let connections = raw.connections.unwrap_or(1);
    if raw.enabled && connections == 0 {
        return Err(ConfigError::Invalid(
            "throughput_test.connections must be at least 1".into(),
        ));
    }

    Ok(ThroughputSettings {
        enabled: raw.enabled,
        method,
        url,
        upload_url: non_empty(raw.upload_url),
        connections: connections.max(1),
        upload_bytes: raw.upload_bytes.unwrap_or(2_000_000),
        fastcom_urls,
    })
}

fn validate_thresholds(raw: RawThresholds) -> Result<IncidentThresholds, ConfigError> {
    if !raw.rssi_dbm.is_finite() || raw.rssi_dbm > 0.0 {
        return Err(ConfigError::Threshold {
            name: "rssi_dbm",
            rule: "a finite dBm value <= 0",
            value: raw.rssi_dbm,
        });
    }

    Ok(IncidentThresholds {
        dns_ms: require_non_negative("dns_ms", raw.dns_ms)?,
        dhcp_ms: require_non_negative("dhcp_ms", raw.dhcp_ms)?,
        packet_loss_pct: require_non_negative("packet_loss_pct", raw.packet_loss_pct)?,
        latency_ms: require_non_negative("latency_ms", raw.latency_ms)?,
        jitter_ms: require_non_negative("jitter_ms", raw.jitter_ms)?,
        association_ms: require_non_negative("association_ms", raw.association_ms)?,
        http_ms: require_non_negative("http_ms", raw.http_ms)?,
        rssi_dbm: raw.rssi_dbm,
    })
}

fn validate_quality(raw: RawQuality) -> Result<QualityWeights, ConfigError> {
    let span = |name: &'static str, value: f64| {
        let v = require_non_negative(name, value)?;
        if v == 0.0 {
            return Err(ConfigError::Threshold {
                name,
                rule: "positive",
                value,
            });
        }
        Ok(v)
    };

    Ok(QualityWeights {
        loss_weight: require_non_negative("loss_weight", raw.loss_weight)?,
        latency_weight: require_non_negative("latency_weight", raw.latency_weight)?,
        jitter_weight: require_non_negative("jitter_weight", raw.jitter_weight)?,
        rssi_weight: require_non_negative("rssi_weight", raw.rssi_weight)?,
        loss_span_pct: span("loss_span_pct", raw.loss_span_pct)?,
        latency_span_ms: span("latency_span_ms", raw.latency_span_ms)?,
        jitter_span_ms: span("jitter_span_ms", raw.jitter_span_ms)?,
        rssi_span_db: span("rssi_span_db", raw.rssi_span_db)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
sensor_name: lab-sensor
metrics_port: 9200
structured_export:
  enabled: true
  path: /tmp/report.csv
wifi:
  - name: Office
    iface: wlan0
    ssid: CorpNet
    password: hunter22
wired:
  - iface: eth0
services:
  internal:
    - name: Gateway
      target: 10.0.0.1
      tests: [ping]
  external:
    - name: Google
      target: https://www.google.com/search
      tests: [icmp, http, tcp-80, tcp_443, icmp]
      frequency: 1hr
    - name: Speed
      tests: [throughput]
      frequency: 6HR
"#;

    #[test]
    fn test_frequency_mapping() {
        let expected = [
            ("fastest", 0),
            ("10min", 600),
            ("20min", 1200),
            ("30min", 1800),
            ("1hr", 3600),
            ("2hr", 7200),
            ("4hr", 14400),
            ("6hr", 21600),
            ("12hr", 43200),
        ];
        for (label, secs) in expected {
            let freq: Frequency = label.parse().unwrap();
            assert_eq!(freq.interval_seconds(), secs);
            assert_eq!(freq.label(), label);
        }
        assert!("90min".parse::<Frequency>().is_err());
    }

    #[test]
    fn test_sample_config() {
        let cfg = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.sensor_name, "lab-sensor");
        assert_eq!(cfg.metrics_port, 9200);
        assert!(cfg.structured_export_enabled);
        assert_eq!(cfg.networks.len(), 2);
        assert_eq!(cfg.networks[0].alias(), "CorpNet");
        assert_eq!(cfg.networks[0].interface_type(), InterfaceType::Wifi);
        assert_eq!(cfg.networks[1].name, "wired-eth0");
        assert_eq!(cfg.networks[1].interface_type(), InterfaceType::Wired);

        assert_eq!(cfg.services.len(), 3);
        assert_eq!(cfg.services[0].scope, Scope::Internal);
        assert_eq!(cfg.services[0].tests, vec![ServiceTest::Icmp]);

        let google = &cfg.services[1];
        assert_eq!(
            google.tests,
            vec![
                ServiceTest::Icmp,
                ServiceTest::Http,
                ServiceTest::Tcp80,
                ServiceTest::Tcp443
            ]
        );
        assert_eq!(google.frequency, Frequency::OneHour);
        assert_eq!(google.host().as_deref(), Some("www.google.com"));

        assert_eq!(cfg.services[2].target, None);
        assert_eq!(cfg.services[2].frequency, Frequency::SixHours);
    }

    #[test]
    fn test_unknown_frequency_rejected() {
        let doc = r#"
wired: [{ iface: eth0 }]
services:
  external:
    - { name: Google, target: google.com, tests: [icmp], frequency: hourly }
"#;
        match Config::from_yaml(doc) {
            Err(ConfigError::UnknownFrequency { service, label }) => {
                assert_eq!(service, "Google");
                assert_eq!(label, "hourly");
            }
            other => panic!("expected UnknownFrequency, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_test_rejected() {
        let doc = r#"
wired: [{ iface: eth0 }]
services:
  external:
    - { name: Google, target: google.com, tests: [smtp] }
"#;
        assert!(matches!(
            Config::from_yaml(doc),
            Err(ConfigError::UnknownTest { .. })
        ));
    }

    #[test]
    fn test_throughput_only_with_target_rejected() {
        let doc = r#"
wired: [{ iface: eth0 }]
services:
  external:
    - { name: Speed, target: speed.example.com, tests: [throughput] }
"#;
        assert!(matches!(Config::from_yaml(doc), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_empty_ssid_rejected_when_enabled() {
        let doc = r#"
wifi:
  - { name: Broken, iface: wlan0, ssid: "  " }
"#;
        assert!(matches!(Config::from_yaml(doc), Err(ConfigError::Invalid(_))));

        let disabled = r#"
wifi:
  - { name: Broken, iface: wlan0, ssid: "", enabled: false }
wired: [{ iface: eth0 }]
"#;
        let cfg = Config::from_yaml(disabled).unwrap();
        assert_eq!(cfg.networks.len(), 1);
    }

    #[test]
    fn test_negative_threshold_rejected() {
        let doc = r#"
wired: [{ iface: eth0 }]
incident_thresholds:
  latency_ms: -5
"#;
        match Config::from_yaml(doc) {
            Err(ConfigError::Threshold { name, .. }) => assert_eq!(name, "latency_ms"),
            other => panic!("expected Threshold, got {other:?}"),
        }
    }

    #[test]
    fn test_no_networks_is_fatal() {
        assert!(matches!(
            Config::from_yaml("sensor_name: x\n"),
            Err(ConfigError::NoNetworks)
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/nonexistent/netsensor.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));
    }

    #[test]
    fn test_enterprise_wifi() {
        let doc = r#"
wifi:
  - iface: wlan0
    ssid: eduroam
    password: secret
    eap_method: PEAP
    identity: alice
    phase2_auth: MSCHAPv2
"#;
        let cfg = Config::from_yaml(doc).unwrap();
        let wifi = cfg.networks[0].wifi.as_ref().unwrap();
        assert!(matches!(wifi.auth, WifiAuth::Enterprise { .. }));
        assert_eq!(cfg.networks[0].name, "wifi-eduroam");
        assert!(cfg.networks[0].uid().starts_with("ssid-"));
    }

    #[test]
    fn test_out_of_range_delay_rejected() {
        let doc = "wired: [{ iface: eth0 }]\ninter_cycle_delay_seconds: 1e30\n";
        match Config::from_yaml(doc) {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("inter_cycle_delay_seconds")),
            other => panic!("expected Invalid, got {other:?}"),
        }

        let doc = "wired: [{ iface: eth0 }]\ntimeouts: { tcp_seconds: 1e25 }\n";
        assert!(matches!(Config::from_yaml(doc), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_shipped_sample_is_valid() {
        let cfg = Config::from_yaml(include_str!("../config.yaml")).unwrap();
        assert_eq!(cfg.networks.len(), 2);
        assert_eq!(cfg.services.len(), 5);
        assert_eq!(cfg.services[4].target, None);
    }

    #[test]
    fn test_service_uid_is_stable() {
        let cfg = Config::from_yaml(SAMPLE).unwrap();
        let again = Config::from_yaml(SAMPLE).unwrap();
        assert_eq!(cfg.services[1].uid(), again.services[1].uid());
        assert_ne!(cfg.services[0].uid(), cfg.services[1].uid());
    }
}
