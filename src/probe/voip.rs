//! VoIP quality estimate derived from an ICMP run.

use super::result::Measurement;

pub const MOS_MIN: f64 = 1.0;
pub const MOS_MAX: f64 = 4.5;

/// Mean Opinion Score from latency, jitter (ms) and loss (%), E-model style.
pub fn compute_mos(rtt_ms: f64, jitter_ms: f64, loss_pct: f64) -> f64 {
    let effective = rtt_ms.max(0.0) + 2.0 * jitter_ms.max(0.0) + 10.0;
    let delay_impairment = if effective < 160.0 {
        effective / 40.0
    } else {
        (effective - 120.0) / 10.0
    };
    let loss_impairment = 2.5 * loss_pct.clamp(0.0, 100.0);

    let r = 93.2 - delay_impairment - loss_impairment;
    if r <= 0.0 {
        return MOS_MIN;
    }

    let mos = 1.0 + 0.035 * r + 7.0e-6 * r * (r - 60.0) * (100.0 - r);
    mos.clamp(MOS_MIN, MOS_MAX)
}

/// Attach a MOS to an ICMP measurement. Unmeasured inputs count as zero.
pub fn with_mos(mut icmp: Measurement) -> Measurement {
    let mos = if icmp.success {
        compute_mos(
            icmp.latency_ms.unwrap_or(0.0),
            icmp.jitter_ms.unwrap_or(0.0),
            icmp.packet_loss_pct.unwrap_or(0.0),
        )
    } else {
        MOS_MIN
    };
    icmp.mos = Some(mos);
    icmp
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_link_near_upper_bound() {
        let mos = compute_mos(0.0, 0.0, 0.0);
        assert!(mos > 4.3 && mos <= MOS_MAX, "mos = {mos}");
    }

    #[test]
    fn test_total_loss_is_floor() {
        assert_eq!(compute_mos(20.0, 5.0, 100.0), MOS_MIN);
    }

    #[test]
    fn test_always_in_range() {
        for rtt in [0.0, 10.0, 50.0, 150.0, 400.0, 2000.0] {
            for jitter in [0.0, 5.0, 30.0, 200.0] {
                for loss in [0.0, 1.0, 5.0, 20.0, 50.0, 100.0] {
                    let mos = compute_mos(rtt, jitter, loss);
                    assert!((MOS_MIN..=MOS_MAX).contains(&mos));
                }
            }
        }
    }

    #[test]
    fn test_degrades_with_latency() {
        assert!(compute_mos(20.0, 2.0, 0.0) > compute_mos(300.0, 2.0, 0.0));
    }

    #[test]
    fn test_failed_icmp_gets_floor() {
        let m = with_mos(Measurement::failed("no echo replies", None));
        assert_eq!(m.mos, Some(MOS_MIN));
    }
}
