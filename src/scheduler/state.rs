//! Cycle phases and the live progress value published to readers.

use chrono::{DateTime, Local};
use serde::Serialize;

/// Engine phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Init,
    WifiAssoc,
    Dhcp,
    Dns,
    InternalServices,
    ExternalServices,
    WifiScan,
    CycleDelay,
}

impl Phase {
    /// Phases every network passes through each cycle, in order.
    pub const NETWORK_PASS: [Phase; 6] = [
        Phase::WifiAssoc,
        Phase::Dhcp,
        Phase::Dns,
        Phase::InternalServices,
        Phase::ExternalServices,
        Phase::WifiScan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "INIT",
            Phase::WifiAssoc => "WIFI_ASSOC",
            Phase::Dhcp => "DHCP",
            Phase::Dns => "DNS",
            Phase::InternalServices => "INTERNAL_SERVICES",
            Phase::ExternalServices => "EXTERNAL_SERVICES",
            Phase::WifiScan => "WIFI_SCAN",
            Phase::CycleDelay => "CYCLE_DELAY",
        }
    }

    /// Ordinal exported as the `cycle_phase` gauge.
    pub fn ordinal(&self) -> f64 {
        match self {
            Phase::Init => 0.0,
            Phase::WifiAssoc => 1.0,
            Phase::Dhcp => 2.0,
            Phase::Dns => 3.0,
            Phase::InternalServices => 4.0,
            Phase::ExternalServices => 5.0,
            Phase::WifiScan => 6.0,
            Phase::CycleDelay => 7.0,
        }
    }
}

/// The test currently executing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentTest {
    pub network: String,
    pub test_type: &'static str,
    pub target: String,
    pub name: String,
}

/// Progress of the running cycle. Owned by the engine; readers only ever see
/// a published copy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleState {
    /// Starts at 1 with the first cycle.
    pub cycle: u64,
    pub phase: Phase,
    pub network: Option<String>,
    pub current: Option<CurrentTest>,
    pub completed: u32,
    pub total: u32,
    pub cycle_started: Option<DateTime<Local>>,
    pub last_result: Option<DateTime<Local>>,
}

impl Default for CycleState {
    fn default() -> Self {
        Self {
            cycle: 0,
            phase: Phase::Init,
            network: None,
            current: None,
            completed: 0,
            total: 0,
            cycle_started: None,
            last_result: None,
        }
    }
}

impl CycleState {
    pub fn progress_pct(&self) -> f64 {
        if self.total == 0 {
            return if self.phase == Phase::CycleDelay { 100.0 } else { 0.0 };
        }
        (self.completed as f64 / self.total as f64 * 100.0).min(100.0)
    }

    /// Reset counters for cycle `cycle` with `total` planned steps.
    pub fn begin_cycle(&mut self, cycle: u64, total: u32, now: DateTime<Local>) {
        self.cycle = cycle;
        self.total = total;
        self.completed = 0;
        self.current = None;
        self.cycle_started = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_pass_order() {
        let names: Vec<_> = Phase::NETWORK_PASS.iter().map(|p| p.as_str()).collect();
        assert_eq!(
            names,
            vec!["WIFI_ASSOC", "DHCP", "DNS", "INTERNAL_SERVICES", "EXTERNAL_SERVICES", "WIFI_SCAN"]
        );
        let ordinals: Vec<_> = Phase::NETWORK_PASS.iter().map(|p| p.ordinal()).collect();
        assert!(ordinals.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_progress() {
        let mut state = CycleState::default();
        assert_eq!(state.progress_pct(), 0.0);
        state.begin_cycle(1, 8, Local::now());
        state.completed = 2;
        assert_eq!(state.progress_pct(), 25.0);
        state.completed = 9;
        assert_eq!(state.progress_pct(), 100.0);
    }
}
