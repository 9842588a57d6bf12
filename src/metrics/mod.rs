//! Live metrics for the sensor.
//!
//! The cycle task owns the prometheus [`Registry`] and is its only writer.
//! After every change it renders the text exposition and publishes it,
//! together with the cycle state, through [`LiveSnapshot`]. Readers (the
//! HTTP endpoint) only ever load a complete, already rendered snapshot.

mod incidents;
mod quality;
mod recorder;

pub use incidents::evaluate_incidents;
pub use recorder::SensorMetrics;

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

use crate::scheduler::CycleState;

pub const METRIC_PREFIX: &str = "netsensor";

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("unknown metric: {0}")]
    UnknownMetric(String),
    #[error("exposition is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

/// Metric name (without prefix), help text and label names.
type GaugeDef = (&'static str, &'static str, &'static [&'static str]);

const NET: &[&str] = &["sensor", "network"];
const SERVICE: &[&str] = &["sensor", "network", "target", "scope"];
const NAMED_TARGET: &[&str] = &["sensor", "network", "target", "name"];
const CHANNEL: &[&str] = &["sensor", "network", "band", "channel"];

pub const CATALOG: &[GaugeDef] = &[
    ("step_ok", "Whether the last run of a step succeeded (1/0)", &["sensor", "network", "step"]),
    ("step_time_ms", "Duration of the last run of a step", &["sensor", "network", "step"]),
    ("ap_association_time_ms", "Time to associate with the access point", NET),
    ("dhcp_time_ms", "Time to obtain a DHCP lease", NET),
    ("dns_time_ms", "DNS lookup time per resolver", &["sensor", "network", "server"]),
    ("network_ip_present", "Whether the interface holds an IPv4 address (1/0)", NET),
    ("wifi_rssi_dbm", "Signal strength of the current association", NET),
    ("wifi_freq_mhz", "Frequency of the current association", NET),
    ("wifi_channel", "Channel of the current association", NET),
    ("wifi_tx_bitrate_mbps", "Transmit bitrate of the current association", NET),
    ("wifi_rx_bitrate_mbps", "Receive bitrate of the current association", NET),
    ("wifi_channel_busy_pct", "Busy time of the in-use channel", NET),
    ("wifi_band", "Band of the current association (always 1)", &["sensor", "network", "band"]),
    ("wifi_bssid_info", "BSSID of the current association (always 1)", &["sensor", "network", "bssid", "ssid"]),
    (
        "wifi_env_ap_rssi_dbm",
        "Signal strength of a nearby access point",
        &["sensor", "network", "bssid", "ssid", "band", "channel", "width_mhz"],
    ),
    ("wifi_env_ap_last_seen_seconds", "Unix time a nearby access point was last seen", &["sensor", "network", "bssid"]),
    ("wifi_env_channel_ap_count", "Nearby access points per channel", CHANNEL),
    ("wifi_env_channel_max_rssi_dbm", "Strongest nearby access point per channel", CHANNEL),
    ("wifi_env_channel_avg_rssi_dbm", "Mean signal of nearby access points per channel", CHANNEL),
    ("service_rtt_avg_ms", "Average ICMP round trip to a service", SERVICE),
    ("service_packet_loss_pct", "ICMP packet loss to a service", SERVICE),
    ("service_jitter_ms", "ICMP jitter to a service", SERVICE),
    ("service_up", "Whether a service answered (1/0)", &["sensor", "network", "target", "scope", "name"]),
    ("service_last_test_timestamp", "Unix time of the last ICMP test of a service", SERVICE),
    ("service_http_time_ms", "HTTP GET time", NAMED_TARGET),
    ("service_http_status", "HTTP GET status code", NAMED_TARGET),
    ("service_tcp_connect_ms", "Mean TCP connect time", NAMED_TARGET),
    ("voip_mos", "Estimated VoIP mean opinion score", SERVICE),
    ("throughput_download_mbps", "Download throughput", &["sensor", "network", "name"]),
    ("throughput_upload_mbps", "Upload throughput", &["sensor", "network", "name"]),
    ("connection_quality_score", "Connection quality score (0-100)", SERVICE),
    ("incident_active", "Whether an incident condition holds (1/0)", &["sensor", "network", "type"]),
    ("cycle_number", "Current test cycle", &["sensor"]),
    ("cycle_phase", "Current cycle phase ordinal", &["sensor", "phase"]),
    ("cycle_progress_pct", "Progress of the current cycle", &["sensor"]),
    ("cycle_tests_total", "Steps planned for the current cycle", &["sensor"]),
    ("cycle_tests_completed", "Steps completed in the current cycle", &["sensor"]),
    (
        "current_test",
        "Test currently running (always 1)",
        &["sensor", "network", "test_type", "target", "name"],
    ),
    ("last_data_timestamp", "Unix time of the last recorded result", NET),
    ("sensor_info", "Sensor identity (always 1)", &["sensor", "sensor_id", "version"]),
    ("network_info", "Network identity (always 1)", &["sensor", "network", "interface_type", "iface", "ip"]),
    (
        "sensor_location",
        "Sensor location (always 1)",
        &["sensor", "latitude", "longitude", "address_notes"],
    ),
];

/// Fixed catalog of gauges registered under [`METRIC_PREFIX`].
pub struct MetricsRegistry {
    registry: Registry,
    gauges: HashMap<&'static str, GaugeVec>,
}

impl MetricsRegistry {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        let mut gauges = HashMap::with_capacity(CATALOG.len());

        for (name, help, labels) in CATALOG {
            let gauge = GaugeVec::new(Opts::new(*name, *help).namespace(METRIC_PREFIX), labels)?;
            registry.register(Box::new(gauge.clone()))?;
            gauges.insert(*name, gauge);
        }

        Ok(Self { registry, gauges })
    }

    fn gauge(&self, key: &str) -> Result<&GaugeVec, MetricsError> {
        self.gauges
            .get(key)
            .ok_or_else(|| MetricsError::UnknownMetric(key.to_string()))
    }

    /// Set the series of `key` identified by `labels` (catalog order).
    pub fn update(&self, key: &str, value: f64, labels: &[&str]) -> Result<(), MetricsError> {
        self.gauge(key)?
            .get_metric_with_label_values(labels)?
            .set(value);
        Ok(())
    }

    /// Drop one series. Missing series are not an error.
    pub fn remove(&self, key: &str, labels: &[&str]) -> Result<(), MetricsError> {
        let _ = self.gauge(key)?.remove_label_values(labels);
        Ok(())
    }

    /// Render the text exposition of every series.
    pub fn render(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Latest published metrics text and cycle state.
pub struct LiveSnapshot {
    exposition: ArcSwap<String>,
    state: ArcSwap<CycleState>,
}

impl LiveSnapshot {
    pub fn new() -> Self {
        Self {
            exposition: ArcSwap::from_pointee(String::new()),
            state: ArcSwap::from_pointee(CycleState::default()),
        }
    }

    pub fn publish_metrics(&self, text: String) {
        self.exposition.store(Arc::new(text));
    }

    pub fn publish_state(&self, state: CycleState) {
        self.state.store(Arc::new(state));
    }

    pub fn metrics(&self) -> Arc<String> {
        self.exposition.load_full()
    }

    pub fn state(&self) -> Arc<CycleState> {
        self.state.load_full()
    }
}

impl Default for LiveSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Phase;

    #[test]
    fn test_update_and_render() {
        let registry = MetricsRegistry::new().unwrap();
        registry
            .update("service_rtt_avg_ms", 12.5, &["lab", "CorpNet", "google.com", "external"])
            .unwrap();
        let text = registry.render().unwrap();
        assert!(text.contains("netsensor_service_rtt_avg_ms{"));
        assert!(text.contains("target=\"google.com\""));
        assert!(text.contains("12.5"));
    }

    #[test]
    fn test_wrong_label_count_is_error() {
        let registry = MetricsRegistry::new().unwrap();
        assert!(registry.update("cycle_number", 1.0, &["a", "b"]).is_err());
        assert!(matches!(
            registry.update("no_such_metric", 1.0, &[]),
            Err(MetricsError::UnknownMetric(_))
        ));
    }

    #[test]
    fn test_remove_series() {
        let registry = MetricsRegistry::new().unwrap();
        let labels = ["lab", "CorpNet", "aa:bb:cc:dd:ee:ff"];
        registry.update("wifi_env_ap_last_seen_seconds", 10.0, &labels).unwrap();
        registry.remove("wifi_env_ap_last_seen_seconds", &labels).unwrap();
        assert!(!registry.render().unwrap().contains("aa:bb:cc:dd:ee:ff"));
    }

    #[test]
    fn test_live_snapshot_swaps_whole_values() {
        let live = LiveSnapshot::new();
        let before = live.state();
        let mut next = CycleState::default();
        next.cycle = 3;
        next.phase = Phase::Dns;
        live.publish_state(next);

        assert_eq!(before.cycle, 0);
        assert_eq!(live.state().cycle, 3);
        assert_eq!(live.state().phase, Phase::Dns);

        live.publish_metrics("netsensor_cycle_number 3\n".into());
        assert!(live.metrics().contains("cycle_number 3"));
    }
}
