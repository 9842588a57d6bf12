//! Probe module for the sensor.
//!
//! One probe per elementary test kind. The engine talks to them through the
//! [`Prober`] trait; [`NetworkProbes`] is the implementation that touches the
//! real network and host tools.

mod command;
mod dhcp;
mod dns;
mod http;
mod ping;
pub mod result;
mod scan;
mod tcp;
mod throughput;
mod voip;
mod wifi;

pub use dns::parse_resolv_conf;
pub use http::http_target;
pub use result::{
    AccessPoint, Measurement, NetworkRef, ScanResult, ServiceRef, TestKind, TestResult,
    WifiSnapshot, WIFI_DATA_CODE,
};
pub use scan::AccessPointTable;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::config::{Config, NetworkProfile, ThroughputSettings, WifiProfile, WifiScanLimits};

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("command failed: {0}")]
    Command(String),
}

/// One elementary test, fully parameterised.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeStep {
    Associate { iface: String, wifi: WifiProfile },
    Dhcp { iface: String },
    Dns { server: String, domain: String },
    HttpGet { host: String, tls: bool },
    TcpConnect { host: String, port: u16 },
    Icmp { host: String },
    VoipMos { host: String },
    Throughput,
}

impl ProbeStep {
    pub fn kind(&self) -> TestKind {
        match self {
            ProbeStep::Associate { .. } => TestKind::ApAssoc,
            ProbeStep::Dhcp { .. } => TestKind::Dhcp,
            ProbeStep::Dns { .. } => TestKind::Dns,
            ProbeStep::HttpGet { .. } => TestKind::HttpGet,
            ProbeStep::TcpConnect { .. } => TestKind::TcpConnect,
            ProbeStep::Icmp { .. } => TestKind::Icmp,
            ProbeStep::VoipMos { .. } => TestKind::VoipMos,
            ProbeStep::Throughput => TestKind::Throughput,
        }
    }

    /// Target column of the structured record.
    pub fn record_target(&self) -> String {
        match self {
            ProbeStep::Associate { .. } | ProbeStep::Dhcp { .. } | ProbeStep::Dns { .. } => {
                String::new()
            }
            ProbeStep::HttpGet { host, tls } => http_target(host, *tls),
            ProbeStep::TcpConnect { host, port } => format!("{}:{}", host, port),
            ProbeStep::Icmp { host } | ProbeStep::VoipMos { host } => host.clone(),
            ProbeStep::Throughput => String::new(),
        }
    }

    /// Human-readable label for the live "current test" state.
    pub fn label(&self) -> String {
        match self {
            ProbeStep::Associate { wifi, .. } => wifi.ssid.clone(),
            ProbeStep::Dhcp { iface } => iface.clone(),
            ProbeStep::Dns { server, .. } => server.clone(),
            ProbeStep::Throughput => "speed.test".to_string(),
            other => other.record_target(),
        }
    }
}

/// Time budget of each step kind.
pub fn step_budget(step: &ProbeStep, config: &Config) -> Duration {
    let t = &config.timeouts;
    match step {
        ProbeStep::Associate { .. } => t.association,
        ProbeStep::Dhcp { .. } => t.dhcp,
        ProbeStep::Dns { .. } => t.dns,
        ProbeStep::HttpGet { .. } => t.http,
        ProbeStep::TcpConnect { .. } => t
            .tcp
            .saturating_mul(config.tcp_attempts)
            .saturating_add(Duration::from_secs(1)),
        ProbeStep::Icmp { .. } | ProbeStep::VoipMos { .. } => t.icmp,
        ProbeStep::Throughput => t.throughput.saturating_mul(2),
    }
}

/// Capability the cycle engine needs from the probe suite.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Run one elementary test within `budget`.
    async fn execute(&self, step: &ProbeStep, budget: Duration) -> Result<Measurement, ProbeError>;

    /// Link metrics for the paired `wifi_data` record. `None` when unavailable.
    async fn link_snapshot(&self, network: &NetworkProfile) -> Option<WifiSnapshot>;

    /// Resolvers to test on `network` after DHCP, at most two.
    async fn dns_servers(&self, network: &NetworkProfile) -> Vec<String>;

    async fn scan(
        &self,
        iface: &str,
        limits: &WifiScanLimits,
        budget: Duration,
    ) -> Result<Vec<AccessPoint>, ProbeError>;

    /// Hand back the address once `network` has been tested.
    async fn release(&self, network: &NetworkProfile);
}

/// Probe suite backed by sockets, reqwest and host tools.
pub struct NetworkProbes {
    client: reqwest::Client,
    ping_count: u32,
    tcp_attempts: u32,
    tcp_timeout: Duration,
    throughput: ThroughputSettings,
    dns_servers: Vec<String>,
}

impl NetworkProbes {
    pub fn new(config: &Config) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("netsensor/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Network(e.to_string()))?;

        Ok(Self {
            client,
            ping_count: config.ping_count,
            tcp_attempts: config.tcp_attempts,
            tcp_timeout: config.timeouts.tcp,
            throughput: config.throughput.clone(),
            dns_servers: config.dns_servers.clone(),
        })
    }
}

#[async_trait]
impl Prober for NetworkProbes {
    async fn execute(&self, step: &ProbeStep, budget: Duration) -> Result<Measurement, ProbeError> {
        match step {
            ProbeStep::Associate { iface, wifi } => wifi::associate(iface, wifi, budget).await,
            ProbeStep::Dhcp { iface } => dhcp::request_lease(iface, budget).await,
            ProbeStep::Dns { server, domain } => dns::run_dns_probe(server, domain, budget).await,
            ProbeStep::HttpGet { host, tls } => {
                http::run_http_probe(&self.client, &http_target(host, *tls), budget).await
            }
            ProbeStep::TcpConnect { host, port } => {
                tcp::run_tcp_probe(host, *port, self.tcp_attempts, self.tcp_timeout).await
            }
            ProbeStep::Icmp { host } => ping::run_icmp_probe(host, self.ping_count).await,
            ProbeStep::VoipMos { host } => {
                let icmp = ping::run_icmp_probe(host, self.ping_count).await?;
                Ok(voip::with_mos(icmp))
            }
            ProbeStep::Throughput => {
                throughput::run_throughput_probe(&self.client, &self.throughput, budget / 2).await
            }
        }
    }

    async fn link_snapshot(&self, network: &NetworkProfile) -> Option<WifiSnapshot> {
        if network.wifi.is_none() {
            return None;
        }
        wifi::link_snapshot(&network.iface).await
    }

    async fn dns_servers(&self, _network: &NetworkProfile) -> Vec<String> {
        if !self.dns_servers.is_empty() {
            return self.dns_servers.clone();
        }
        match tokio::fs::read_to_string("/etc/resolv.conf").await {
            Ok(contents) => parse_resolv_conf(&contents),
            Err(e) => {
                tracing::warn!("Failed to read /etc/resolv.conf: {}", e);
                Vec::new()
            }
        }
    }

    async fn scan(
        &self,
        iface: &str,
        limits: &WifiScanLimits,
        budget: Duration,
    ) -> Result<Vec<AccessPoint>, ProbeError> {
        scan::scan_access_points(iface, limits, budget).await
    }

    async fn release(&self, network: &NetworkProfile) {
        if network.wifi.is_some() {
            dhcp::release_lease(&network.iface).await;
        }
    }
}
