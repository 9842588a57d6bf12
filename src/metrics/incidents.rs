//! Incident flags evaluated once per network pass.

use crate::config::IncidentThresholds;
use crate::probe::{TestKind, TestResult, WifiSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncidentKind {
    HighDnsLookupTime,
    DhcpSlow,
    AssociationSlow,
    HttpSlow,
    WeakSignal,
    PacketLoss,
    HighLatency,
    HighJitter,
}

impl IncidentKind {
    pub const ALL: [IncidentKind; 8] = [
        IncidentKind::HighDnsLookupTime,
        IncidentKind::DhcpSlow,
        IncidentKind::AssociationSlow,
        IncidentKind::HttpSlow,
        IncidentKind::WeakSignal,
        IncidentKind::PacketLoss,
        IncidentKind::HighLatency,
        IncidentKind::HighJitter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentKind::HighDnsLookupTime => "high_dns_lookup_time",
            IncidentKind::DhcpSlow => "dhcp_slow",
            IncidentKind::AssociationSlow => "association_slow",
            IncidentKind::HttpSlow => "http_slow",
            IncidentKind::WeakSignal => "weak_signal",
            IncidentKind::PacketLoss => "packet_loss",
            IncidentKind::HighLatency => "high_latency",
            IncidentKind::HighJitter => "high_jitter",
        }
    }
}

fn worst(values: impl Iterator<Item = f64>) -> Option<f64> {
    values.fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
}

/// Slowest successful run of `kind`, in milliseconds.
fn slowest_ok(results: &[TestResult], kind: TestKind) -> Option<f64> {
    worst(
        results
            .iter()
            .filter(|r| r.kind == kind && r.measurement.success)
            .filter_map(|r| r.measurement.elapsed_s)
            .map(|s| s * 1000.0),
    )
}

fn exceeds(value: Option<f64>, threshold: f64) -> bool {
    value.is_some_and(|v| v > threshold)
}

/// Evaluate every incident over one network pass.
///
/// Timing incidents only look at successful steps; loss, latency and jitter
/// take the worst value across ICMP and VoIP results.
pub fn evaluate_incidents(
    results: &[TestResult],
    link: Option<&WifiSnapshot>,
    thresholds: &IncidentThresholds,
) -> Vec<(IncidentKind, bool)> {
    let path_results: Vec<&TestResult> = results
        .iter()
        .filter(|r| matches!(r.kind, TestKind::Icmp | TestKind::VoipMos))
        .collect();

    let max_loss = worst(path_results.iter().map(|r| r.measurement.effective_loss_pct()));
    let max_latency = worst(path_results.iter().filter_map(|r| r.measurement.latency_ms));
    let max_jitter = worst(path_results.iter().filter_map(|r| r.measurement.jitter_ms));
    let rssi = link.and_then(|l| l.rssi_dbm).map(f64::from);

    IncidentKind::ALL
        .into_iter()
        .map(|kind| {
            let active = match kind {
                IncidentKind::HighDnsLookupTime => {
                    exceeds(slowest_ok(results, TestKind::Dns), thresholds.dns_ms)
                }
                IncidentKind::DhcpSlow => {
                    exceeds(slowest_ok(results, TestKind::Dhcp), thresholds.dhcp_ms)
                }
                IncidentKind::AssociationSlow => exceeds(
                    slowest_ok(results, TestKind::ApAssoc),
                    thresholds.association_ms,
                ),
                IncidentKind::HttpSlow => {
                    exceeds(slowest_ok(results, TestKind::HttpGet), thresholds.http_ms)
                }
                IncidentKind::WeakSignal => rssi.is_some_and(|r| r < thresholds.rssi_dbm),
                IncidentKind::PacketLoss => exceeds(max_loss, thresholds.packet_loss_pct),
                IncidentKind::HighLatency => exceeds(max_latency, thresholds.latency_ms),
                IncidentKind::HighJitter => exceeds(max_jitter, thresholds.jitter_ms),
            };
            (kind, active)
        })
        .collect()
}
