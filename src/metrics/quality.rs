//! Connection quality score.

use crate::config::{IncidentThresholds, QualityWeights};

/// Measurements feeding one target's score.
///
/// `None` means the metric could not be measured. `rssi_dbm` is `None` on
/// wired networks, which carry no signal penalty at all (see `wired`).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QualityInputs {
    pub up: bool,
    pub loss_pct: Option<f64>,
    pub latency_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub rssi_dbm: Option<f64>,
    pub wired: bool,
}

fn penalty(weight: f64, excess: Option<f64>, span: f64) -> f64 {
    match excess {
        Some(excess) => weight * (excess / span).clamp(0.0, 1.0),
        None => weight,
    }
}

/// Score in `[0, 100]`. A target that is down scores 0.
pub fn quality_score(
    inputs: &QualityInputs,
    thresholds: &IncidentThresholds,
    weights: &QualityWeights,
) -> f64 {
    let loss = inputs.loss_pct.unwrap_or(100.0);
    if !inputs.up || loss >= 100.0 {
        return 0.0;
    }

    let mut total = 0.0;
    total += penalty(
        weights.loss_weight,
        inputs.loss_pct.map(|v| v - thresholds.packet_loss_pct),
        weights.loss_span_pct,
    );
    total += penalty(
        weights.latency_weight,
        inputs.latency_ms.map(|v| v - thresholds.latency_ms),
        weights.latency_span_ms,
    );
    total += penalty(
        weights.jitter_weight,
        inputs.jitter_ms.map(|v| v - thresholds.jitter_ms),
        weights.jitter_span_ms,
    );
    if !inputs.wired {
        // weaker than the threshold counts as excess
        total += penalty(
            weights.rssi_weight,
            inputs.rssi_dbm.map(|v| thresholds.rssi_dbm - v),
            weights.rssi_span_db,
        );
    }

    (100.0 - total).clamp(0.0, 100.0)
}
