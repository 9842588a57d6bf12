//! Translates engine events into gauge updates.

use std::collections::HashMap;
use std::sync::Arc;

use super::incidents::IncidentKind;
use super::quality::{quality_score, QualityInputs};
use super::{LiveSnapshot, MetricsError, MetricsRegistry};
use crate::config::{Config, IncidentThresholds, InterfaceType, QualityWeights};
use crate::probe::{AccessPoint, AccessPointTable, TestKind, TestResult, WifiSnapshot};
use crate::scheduler::CycleState;
use crate::sink::SensorEvent;

fn owned(labels: &[&str]) -> Vec<String> {
    labels.iter().map(|l| l.to_string()).collect()
}

fn refs(labels: &[String]) -> Vec<&str> {
    labels.iter().map(String::as_str).collect()
}

fn flag(value: bool) -> f64 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// Gauge writer owned by the cycle task.
pub struct SensorMetrics {
    registry: MetricsRegistry,
    live: Arc<LiveSnapshot>,
    sensor: String,
    thresholds: IncidentThresholds,
    weights: QualityWeights,
    /// Info-style series that hold one label set per (metric, network).
    single: HashMap<(&'static str, String), Vec<String>>,
    /// Environment series written by the last scan of each network.
    environment: HashMap<String, Vec<(&'static str, Vec<String>)>>,
}

impl SensorMetrics {
    pub fn new(config: &Config, live: Arc<LiveSnapshot>) -> Result<Self, MetricsError> {
        let registry = MetricsRegistry::new()?;
        registry.update(
            "sensor_info",
            1.0,
            &[
                &config.sensor_name,
                &config.sensor_id,
                env!("CARGO_PKG_VERSION"),
            ],
        )?;

        Ok(Self {
            registry,
            live,
            sensor: config.sensor_name.clone(),
            thresholds: config.thresholds.clone(),
            weights: config.quality.clone(),
            single: HashMap::new(),
            environment: HashMap::new(),
        })
    }

    /// Replace the series of `key` for `scope` with `labels`.
    fn replace(
        &mut self,
        key: &'static str,
        scope: &str,
        labels: Option<Vec<String>>,
        value: f64,
    ) -> Result<(), MetricsError> {
        let slot = (key, scope.to_string());
        if let Some(previous) = self.single.get(&slot) {
            if labels.as_ref() != Some(previous) {
                self.registry.remove(key, &refs(previous))?;
            }
        }
        match labels {
            Some(labels) => {
                self.registry.update(key, value, &refs(&labels))?;
                self.single.insert(slot, labels);
            }
            None => {
                self.single.remove(&slot);
            }
        }
        Ok(())
    }

    pub fn observe(&mut self, event: &SensorEvent) {
        let outcome = match event {
            SensorEvent::Test { result, link } => self.observe_test(result, link),
            SensorEvent::Scan(scan) => self.registry.update(
                "last_data_timestamp",
                scan.timestamp.timestamp() as f64,
                &[&self.sensor, &scan.network.name],
            ),
        };
        if let Err(e) = outcome {
            tracing::warn!("Failed to update metrics: {}", e);
        }
    }

    fn observe_test(&mut self, result: &TestResult, link: &WifiSnapshot) -> Result<(), MetricsError> {
        let sensor = self.sensor.clone();
        let net = result.network.name.as_str();
        let m = &result.measurement;
        let elapsed_ms = m.elapsed_s.map(|s| s * 1000.0);
        let step = if result.target.is_empty() {
            result.kind.as_str().to_string()
        } else {
            format!("{}:{}", result.kind.as_str(), result.target)
        };
        let (scope, name) = match &result.service {
            Some(service) => (service.scope, service.name.as_str()),
            None => ("", ""),
        };
        let target = result.target.as_str();
        let r = &self.registry;

        r.update("step_ok", flag(m.success), &[&sensor, net, &step])?;
        if let Some(ms) = elapsed_ms {
            r.update("step_time_ms", ms, &[&sensor, net, &step])?;
        }

        match result.kind {
            TestKind::ApAssoc => {
                if let (true, Some(ms)) = (m.success, elapsed_ms) {
                    r.update("ap_association_time_ms", ms, &[&sensor, net])?;
                }
            }
            TestKind::Dhcp => {
                let ip = m.ip_address.as_deref().filter(|_| m.success);
                if let (true, Some(ms)) = (m.success, elapsed_ms) {
                    r.update("dhcp_time_ms", ms, &[&sensor, net])?;
                }
                r.update("network_ip_present", flag(ip.is_some()), &[&sensor, net])?;
                let info = owned(&[
                    &sensor,
                    net,
                    result.network.interface_type,
                    &result.network.iface,
                    ip.unwrap_or(""),
                ]);
                self.replace("network_info", net, Some(info), 1.0)?;
            }
            TestKind::Dns => {
                let server = m.ip_address.as_deref().unwrap_or("");
                let value = if m.success { elapsed_ms } else { None };
                // a failed lookup drops the series rather than reporting a time
                match value {
                    Some(ms) => r.update("dns_time_ms", ms, &[&sensor, net, server])?,
                    None => r.remove("dns_time_ms", &[&sensor, net, server])?,
                }
            }
            TestKind::Icmp => {
                let labels = [sensor.as_str(), net, target, scope];
                let loss = m.effective_loss_pct();
                let up = m.success && loss < 100.0;
                if let Some(rtt) = m.latency_ms {
                    r.update("service_rtt_avg_ms", rtt, &labels)?;
                }
                if let Some(jitter) = m.jitter_ms {
                    r.update("service_jitter_ms", jitter, &labels)?;
                }
                r.update("service_packet_loss_pct", loss, &labels)?;
                r.update("service_up", flag(up), &[&sensor, net, target, scope, name])?;
                r.update(
                    "service_last_test_timestamp",
                    result.timestamp.timestamp() as f64,
                    &labels,
                )?;

                let inputs = QualityInputs {
                    up,
                    loss_pct: Some(loss),
                    latency_ms: m.latency_ms,
                    jitter_ms: m.jitter_ms,
                    rssi_dbm: link.rssi_dbm.map(f64::from),
                    wired: result.network.kind == InterfaceType::Wired,
                };
                let score = quality_score(&inputs, &self.thresholds, &self.weights);
                r.update("connection_quality_score", score, &labels)?;
            }
            TestKind::VoipMos => {
                if let Some(mos) = m.mos {
                    r.update("voip_mos", mos, &[&sensor, net, target, scope])?;
                }
            }
            TestKind::HttpGet => {
                let labels = [sensor.as_str(), net, target, name];
                if let Some(ms) = elapsed_ms {
                    r.update("service_http_time_ms", ms, &labels)?;
                }
                let status = m.http_status.map(f64::from).unwrap_or(0.0);
                r.update("service_http_status", status, &labels)?;
            }
            TestKind::TcpConnect => {
                if let Some(ms) = m.latency_ms {
                    r.update("service_tcp_connect_ms", ms, &[&sensor, net, target, name])?;
                }
            }
            TestKind::Throughput => {
                let labels = [sensor.as_str(), net, name];
                r.update("throughput_download_mbps", m.download_mbps.unwrap_or(0.0), &labels)?;
                r.update("throughput_upload_mbps", m.upload_mbps.unwrap_or(0.0), &labels)?;
            }
            TestKind::WifiScan => {}
        }

        let r = &self.registry;
        r.update(
            "last_data_timestamp",
            result.timestamp.timestamp() as f64,
            &[&sensor, net],
        )?;

        if !link.is_empty() {
            self.observe_link(&sensor, net, link)?;
        }
        Ok(())
    }

    fn observe_link(&mut self, sensor: &str, net: &str, link: &WifiSnapshot) -> Result<(), MetricsError> {
        let labels = [sensor, net];
        let r = &self.registry;
        if let Some(rssi) = link.rssi_dbm {
            r.update("wifi_rssi_dbm", f64::from(rssi), &labels)?;
        }
        if let Some(freq) = link.freq_mhz {
            r.update("wifi_freq_mhz", f64::from(freq), &labels)?;
        }
        if let Some(channel) = link.channel {
            r.update("wifi_channel", f64::from(channel), &labels)?;
        }
        if let Some(tx) = link.tx_bitrate_mbps {
            r.update("wifi_tx_bitrate_mbps", tx, &labels)?;
        }
        if let Some(rx) = link.rx_bitrate_mbps {
            r.update("wifi_rx_bitrate_mbps", rx, &labels)?;
        }
        if let Some(busy) = link.channel_busy_pct {
            r.update("wifi_channel_busy_pct", busy, &labels)?;
        }
        if let Some(band) = link.band {
            self.replace("wifi_band", net, Some(owned(&[sensor, net, band])), 1.0)?;
        }
        if let Some(bssid) = &link.bssid {
            let ssid = link.ssid.as_deref().unwrap_or("");
            self.replace("wifi_bssid_info", net, Some(owned(&[sensor, net, bssid, ssid])), 1.0)?;
        }
        Ok(())
    }

    /// Replace the environment series of `network`: per-AP series from the
    /// live `table`, per-channel aggregates from the `current` scan only.
    pub fn observe_environment(&mut self, network: &str, table: &AccessPointTable, current: &[AccessPoint]) {
        if let Err(e) = self.write_environment(network, table, current) {
            tracing::warn!("Failed to update environment metrics: {}", e);
        }
    }

    fn write_environment(
        &mut self,
        network: &str,
        table: &AccessPointTable,
        current: &[AccessPoint],
    ) -> Result<(), MetricsError> {
        for (key, labels) in self.environment.remove(network).unwrap_or_default() {
            self.registry.remove(key, &refs(&labels))?;
        }

        let sensor = self.sensor.as_str();
        let mut written = Vec::new();

        for (ap, seen) in table.entries() {
            let band = ap.band.unwrap_or("");
            let channel = ap.channel.map(|c| c.to_string()).unwrap_or_default();
            let width = ap.width_mhz.to_string();

            let rssi_labels = owned(&[sensor, network, &ap.bssid, &ap.ssid, band, &channel, &width]);
            self.registry.update("wifi_env_ap_rssi_dbm", ap.rssi_dbm, &refs(&rssi_labels))?;
            written.push(("wifi_env_ap_rssi_dbm", rssi_labels));

            let seen_labels = owned(&[sensor, network, &ap.bssid]);
            self.registry
                .update("wifi_env_ap_last_seen_seconds", seen as f64, &refs(&seen_labels))?;
            written.push(("wifi_env_ap_last_seen_seconds", seen_labels));
        }

        // (band, channel) -> rssi values
        let mut channels: HashMap<(&str, u32), Vec<f64>> = HashMap::new();
        for ap in current {
            if let Some(channel) = ap.channel {
                channels
                    .entry((ap.band.unwrap_or(""), channel))
                    .or_default()
                    .push(ap.rssi_dbm);
            }
        }

        for ((band, channel), rssi) in channels {
            let labels = owned(&[sensor, network, band, &channel.to_string()]);
            let max = rssi.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let avg = rssi.iter().sum::<f64>() / rssi.len() as f64;
            let label_refs = refs(&labels);
            self.registry
                .update("wifi_env_channel_ap_count", rssi.len() as f64, &label_refs)?;
            self.registry
                .update("wifi_env_channel_max_rssi_dbm", max, &label_refs)?;
            self.registry
                .update("wifi_env_channel_avg_rssi_dbm", avg, &label_refs)?;
            for key in [
                "wifi_env_channel_ap_count",
                "wifi_env_channel_max_rssi_dbm",
                "wifi_env_channel_avg_rssi_dbm",
            ] {
                written.push((key, labels.clone()));
            }
        }

        self.environment.insert(network.to_string(), written);
        Ok(())
    }

    pub fn observe_incidents(&mut self, network: &str, flags: &[(IncidentKind, bool)]) {
        for (kind, active) in flags {
            if let Err(e) = self.registry.update(
                "incident_active",
                flag(*active),
                &[&self.sensor, network, kind.as_str()],
            ) {
                tracing::warn!("Failed to update incident {}: {}", kind.as_str(), e);
            }
        }
    }

    pub fn set_location(&mut self, latitude: f64, longitude: f64, notes: &str) {
        let labels = owned(&[
            &self.sensor,
            &latitude.to_string(),
            &longitude.to_string(),
            notes,
        ]);
        if let Err(e) = self.replace("sensor_location", "", Some(labels), 1.0) {
            tracing::warn!("Failed to update location metric: {}", e);
        }
    }

    fn observe_state(&mut self, state: &CycleState) -> Result<(), MetricsError> {
        let sensor = self.sensor.clone();
        let labels = [sensor.as_str()];
        self.registry.update("cycle_number", state.cycle as f64, &labels)?;
        self.registry
            .update("cycle_progress_pct", state.progress_pct(), &labels)?;
        self.registry
            .update("cycle_tests_total", f64::from(state.total), &labels)?;
        self.registry
            .update("cycle_tests_completed", f64::from(state.completed), &labels)?;
        self.replace(
            "cycle_phase",
            "",
            Some(owned(&[&sensor, state.phase.as_str()])),
            state.phase.ordinal(),
        )?;

        let current = state.current.as_ref().map(|t| {
            owned(&[&sensor, &t.network, t.test_type, &t.target, &t.name])
        });
        self.replace("current_test", "", current, 1.0)
    }

    /// Push `state` and a fresh exposition to readers.
    pub fn publish(&mut self, state: &CycleState) {
        if let Err(e) = self.observe_state(state) {
            tracing::warn!("Failed to update cycle metrics: {}", e);
        }
        match self.registry.render() {
            Ok(text) => self.live.publish_metrics(text),
            Err(e) => tracing::warn!("Failed to render metrics: {}", e),
        }
        self.live.publish_state(state.clone());
    }

    #[cfg(test)]
    pub fn live(&self) -> Arc<LiveSnapshot> {
        Arc::clone(&self.live)
    }
}
