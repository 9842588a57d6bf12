//! Scheduler module: the sequential test-cycle engine.
//!
//! One [`CycleEngine`] task runs every elementary test, one at a time, in the
//! order fixed by the cycle plan. After each step it fans the result out to
//! the metrics recorder and every sink, then publishes the cycle state.

mod plan;
mod state;
mod tracker;

pub use plan::*;
pub use state::{CurrentTest, CycleState, Phase};
pub use tracker::ScheduleTracker;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use tokio_util::sync::CancellationToken;

use crate::config::{Config, InterfaceType, NetworkProfile};
use crate::metrics::{evaluate_incidents, SensorMetrics};
use crate::probe::{
    step_budget, AccessPointTable, Measurement, NetworkRef, ProbeError, ProbeStep, Prober,
    ScanResult, ServiceRef, TestKind, TestResult, WifiSnapshot,
};
use crate::sink::{ResultSink, SensorEvent};

/// Pause after a cycle that ran nothing, so an idle sensor does not spin.
const IDLE_CYCLE_DELAY: Duration = Duration::from_secs(1);

/// Upper bound on reading the link state after a step.
const LINK_SNAPSHOT_BUDGET: Duration = Duration::from_secs(5);

/// Wall-clock source for record timestamps and due-ness decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Local>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// The cycle engine. Owns the schedule tracker, the sinks and the metrics
/// writer; nothing else mutates them.
pub struct CycleEngine {
    config: Arc<Config>,
    prober: Arc<dyn Prober>,
    clock: Arc<dyn Clock>,
    tracker: ScheduleTracker,
    metrics: SensorMetrics,
    sinks: Vec<Box<dyn ResultSink>>,
    state: CycleState,
    environment: HashMap<String, AccessPointTable>,
    last_link: HashMap<String, WifiSnapshot>,
    cancel: CancellationToken,
}

impl CycleEngine {
    pub fn new(
        config: Arc<Config>,
        prober: Arc<dyn Prober>,
        clock: Arc<dyn Clock>,
        metrics: SensorMetrics,
        sinks: Vec<Box<dyn ResultSink>>,
        cancel: CancellationToken,
    ) -> Self {
        let tracker = ScheduleTracker::load(config.schedule_state_path.clone());
        Self {
            config,
            prober,
            clock,
            tracker,
            metrics,
            sinks,
            state: CycleState::default(),
            environment: HashMap::new(),
            last_link: HashMap::new(),
            cancel,
        }
    }

    /// Run cycles until cancelled, then flush sinks and schedule state.
    pub async fn run(mut self) {
        self.enter_phase(Phase::Init);
        tracing::info!(
            "Cycle engine started: {} networks, {} services",
            self.config.networks.len(),
            self.config.services.len()
        );

        let mut cycle = self.state.cycle;
        while !self.cancel.is_cancelled() {
            cycle += 1;
            let executed = self.run_cycle(cycle).await;
            if self.cancel.is_cancelled() {
                break;
            }

            self.enter_phase(Phase::CycleDelay);
            let delay = if executed == 0 {
                self.config.inter_cycle_delay.max(IDLE_CYCLE_DELAY)
            } else {
                self.config.inter_cycle_delay
            };
            pause(&self.cancel, delay).await;
        }

        self.shutdown();
    }

    /// Run one full cycle. Returns the number of steps executed.
    pub(crate) async fn run_cycle(&mut self, cycle: u64) -> u32 {
        let started = Instant::now();
        let now = self.clock.now();
        let config = Arc::clone(&self.config);

        let mut plans = Vec::with_capacity(config.networks.len());
        for network in &config.networks {
            let servers = self.prober.dns_servers(network).await;
            plans.push(plan_network(
                &config,
                network,
                &self.tracker,
                &servers,
                now.timestamp(),
            ));
        }

        let total = plans.iter().map(NetworkPlan::step_count).sum();
        self.state.begin_cycle(cycle, total, now);
        tracing::info!("Cycle {} starting: {} tests planned", cycle, total);

        for plan in plans {
            if self.cancel.is_cancelled() {
                break;
            }
            self.run_network(plan).await;
        }
        self.state.network = None;

        tracing::info!(
            "Cycle {} complete: {}/{} tests in {:.1}s",
            cycle,
            self.state.completed,
            self.state.total,
            started.elapsed().as_secs_f64()
        );
        self.state.completed
    }

    async fn run_network(&mut self, plan: NetworkPlan) {
        let network = plan.network.clone();
        let net_ref = NetworkRef::from(&network);
        self.state.network = Some(network.name.clone());
        tracing::debug!("Testing network {} ({})", network.name, net_ref.interface_type);

        let results = self.run_phases(&plan, &net_ref).await;

        if !self.cancel.is_cancelled() {
            let flags = evaluate_incidents(
                &results,
                self.last_link.get(&network.name),
                &self.config.thresholds,
            );
            self.metrics.observe_incidents(&network.name, &flags);
        }

        self.prober.release(&network).await;
        self.publish();
    }

    async fn run_phases(&mut self, plan: &NetworkPlan, net_ref: &NetworkRef) -> Vec<TestResult> {
        let network = &plan.network;
        let mut results = Vec::new();
        let mut associated = true;

        for phase_plan in &plan.phases {
            if self.cancel.is_cancelled() {
                break;
            }
            self.enter_phase(phase_plan.phase);

            let units = match phase_plan.phase {
                Phase::Dhcp | Phase::Dns if !associated => {
                    tracing::info!(
                        "Skipping {} on {}: association failed",
                        phase_plan.phase.as_str(),
                        network.name
                    );
                    self.state.total = self.state.total.saturating_sub(phase_plan.step_count());
                    continue;
                }
                Phase::Dns => {
                    // the lease may have handed out different resolvers
                    let servers = self.prober.dns_servers(network).await;
                    let steps = dns_steps(&servers, &self.config.dns_domain);
                    self.state.total = self
                        .state
                        .total
                        .saturating_sub(phase_plan.step_count())
                        + steps.len() as u32;
                    if steps.is_empty() {
                        tracing::warn!("No DNS servers known on {}", network.name);
                        Vec::new()
                    } else {
                        vec![PlanUnit {
                            service: None,
                            steps,
                        }]
                    }
                }
                Phase::WifiScan => {
                    if plan.scan {
                        self.run_scan(network, net_ref).await;
                    }
                    continue;
                }
                _ => phase_plan.units.clone(),
            };

            for unit in &units {
                if let Some(service) = &unit.service {
                    self.tracker
                        .mark_run(&service.schedule_key, self.clock.now().timestamp());
                }

                for step in &unit.steps {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    let reference = unit.service.as_ref().map(|s| &s.reference);
                    let result = self.run_step(step, network, net_ref, reference).await;
                    if result.kind == TestKind::ApAssoc && !result.measurement.success {
                        associated = false;
                    }
                    results.push(result);
                }

                if unit.service.is_some() {
                    if let Err(e) = self.tracker.persist() {
                        tracing::warn!("Failed to persist schedule state: {}", e);
                    }
                }
            }
        }

        results
    }

    async fn run_step(
        &mut self,
        step: &ProbeStep,
        network: &NetworkProfile,
        net_ref: &NetworkRef,
        service: Option<&ServiceRef>,
    ) -> TestResult {
        let kind = step.kind();
        let target = step.record_target();
        self.state.current = Some(CurrentTest {
            network: net_ref.name.clone(),
            test_type: kind.as_str(),
            target: target.clone(),
            name: service
                .map(|s| s.name.clone())
                .unwrap_or_else(|| step.label()),
        });
        self.publish();

        let timestamp = self.clock.now();
        let budget = step_budget(step, &self.config);
        let measurement = match tokio::time::timeout(budget, self.prober.execute(step, budget)).await {
            Ok(Ok(measurement)) => measurement,
            Ok(Err(e)) => {
                tracing::warn!("{} {} on {} failed: {}", kind.as_str(), step.label(), net_ref.name, e);
                Measurement::failed(e, None)
            }
            Err(_) => {
                tracing::warn!(
                    "{} {} on {} timed out after {:?}",
                    kind.as_str(),
                    step.label(),
                    net_ref.name,
                    budget
                );
                Measurement::failed(ProbeError::Timeout(budget), Some(budget.as_secs_f64()))
            }
        };

        let link = self.link_snapshot(network, net_ref).await;
        let result = TestResult {
            timestamp,
            cycle: self.state.cycle,
            kind,
            network: net_ref.clone(),
            service: service.cloned(),
            target,
            measurement,
        };

        self.emit(&SensorEvent::Test {
            result: result.clone(),
            link,
        });

        self.state.completed += 1;
        self.state.last_result = Some(timestamp);
        self.publish();

        pause(&self.cancel, self.config.inter_test_delay).await;
        result
    }

    /// Current link state, falling back to the last one read on this network.
    async fn link_snapshot(&mut self, network: &NetworkProfile, net_ref: &NetworkRef) -> WifiSnapshot {
        if net_ref.kind == InterfaceType::Wired {
            return WifiSnapshot::default();
        }
        let fresh = tokio::time::timeout(LINK_SNAPSHOT_BUDGET, self.prober.link_snapshot(network))
            .await
            .ok()
            .flatten();
        match fresh {
            Some(snapshot) => {
                self.last_link.insert(network.name.clone(), snapshot.clone());
                snapshot
            }
            None => self.last_link.get(&network.name).cloned().unwrap_or_default(),
        }
    }

    async fn run_scan(&mut self, network: &NetworkProfile, net_ref: &NetworkRef) {
        let limits = self.config.wifi_scan.clone();
        let budget = self.config.timeouts.scan;
        let timestamp = self.clock.now();

        let outcome = tokio::time::timeout(budget, self.prober.scan(&network.iface, &limits, budget)).await;
        let (access_points, error) = match outcome {
            Ok(Ok(aps)) => (aps, None),
            Ok(Err(e)) => (Vec::new(), Some(e.to_string())),
            Err(_) => (Vec::new(), Some(ProbeError::Timeout(budget).to_string())),
        };
        if let Some(error) = &error {
            tracing::warn!("WiFi scan on {} failed: {}", network.iface, error);
        }

        let table = self.environment.entry(network.name.clone()).or_default();
        let expired = table.refresh(&access_points, timestamp.timestamp(), &limits);
        tracing::debug!(
            "Scan on {}: {} seen, {} tracked, {} expired",
            network.iface,
            access_points.len(),
            table.len(),
            expired.len()
        );
        self.metrics.observe_environment(&network.name, table, &access_points);

        self.emit(&SensorEvent::Scan(ScanResult {
            timestamp,
            cycle: self.state.cycle,
            network: net_ref.clone(),
            iface: network.iface.clone(),
            access_points,
            expired,
            error,
        }));
        self.publish();
    }

    fn emit(&mut self, event: &SensorEvent) {
        self.metrics.observe(event);
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.record(event) {
                tracing::warn!("{} sink write failed: {}", sink.name(), e);
            }
        }
    }

    fn enter_phase(&mut self, phase: Phase) {
        self.state.phase = phase;
        self.state.current = None;
        tracing::debug!("Phase {}", phase.as_str());
        self.publish();
    }

    fn publish(&mut self) {
        self.metrics.publish(&self.state);
    }


    fn shutdown(&mut self) {
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.flush() {
                tracing::warn!("Failed to flush {} sink: {}", sink.name(), e);
            }
        }
        if let Err(e) = self.tracker.persist() {
            tracing::warn!("Failed to persist schedule state: {}", e);
        }
        self.state.current = None;
        self.publish();
        tracing::info!("Cycle engine stopped after cycle {}", self.state.cycle);
    }
}

/// Sleep for `delay` unless cancelled first.
async fn pause(cancel: &CancellationToken, delay: Duration) {
    if delay.is_zero() {
        return;
    }
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WifiScanLimits;
    use crate::metrics::LiveSnapshot;
    use crate::probe::AccessPoint;
    use crate::sink::build_sinks;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::path::Path;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    struct FakeClock {
        base: DateTime<Local>,
        offset_ms: AtomicI64,
    }

    impl FakeClock {
        fn new() -> Self {
            Self {
                base: Local.with_ymd_and_hms(2026, 5, 1, 9, 0, 0).unwrap(),
                offset_ms: AtomicI64::new(0),
            }
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Local> {
            // every reading is 250ms after the previous one
            let offset = self.offset_ms.fetch_add(250, Ordering::SeqCst);
            self.base + chrono::Duration::milliseconds(offset)
        }
    }

    #[derive(Default)]
    struct ScriptedProber {
        executed: Mutex<Vec<ProbeStep>>,
        fail_association: bool,
        hang_on: Option<TestKind>,
    }

    impl ScriptedProber {
        fn executed(&self) -> Vec<ProbeStep> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn execute(&self, step: &ProbeStep, _budget: Duration) -> Result<Measurement, ProbeError> {
            self.executed.lock().unwrap().push(step.clone());
            if self.hang_on == Some(step.kind()) {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            match step {
                ProbeStep::Associate { .. } if self.fail_association => {
                    Ok(Measurement::failed("association rejected", Some(0.0)))
                }
                ProbeStep::Dhcp { .. } => Ok(Measurement {
                    ip_address: Some("10.0.0.23".into()),
                    ..Measurement::ok(0.8)
                }),
                ProbeStep::Icmp { .. } => Ok(Measurement {
                    latency_ms: Some(14.0),
                    jitter_ms: Some(1.0),
                    packet_loss_pct: Some(0.0),
                    ..Measurement::ok(2.0)
                }),
                _ => Ok(Measurement::ok(0.05)),
            }
        }

        async fn link_snapshot(&self, _network: &NetworkProfile) -> Option<WifiSnapshot> {
            Some(WifiSnapshot {
                bssid: Some("aa:bb:cc:dd:ee:ff".into()),
                rssi_dbm: Some(-60),
                freq_mhz: Some(5180),
                channel: Some(36),
                ..Default::default()
            })
        }

        async fn dns_servers(&self, _network: &NetworkProfile) -> Vec<String> {
            vec!["1.1.1.1".into()]
        }

        async fn scan(
            &self,
            _iface: &str,
            _limits: &WifiScanLimits,
            _budget: Duration,
        ) -> Result<Vec<AccessPoint>, ProbeError> {
            Ok(Vec::new())
        }

        async fn release(&self, _network: &NetworkProfile) {}
    }

    fn config(dir: &Path, networks: &str, extra: &str) -> Config {
        let doc = format!(
            r#"
sensor_name: lab
log_path: {dir}/results.jsonl
schedule_state_path: {dir}/schedule.json
structured_export: {{ enabled: true, path: {dir}/report.csv }}
{networks}
services:
  external:
    - {{ name: Google, target: google.com, tests: [icmp, http, tcp_80, tcp_443], frequency: 1hr }}
{extra}
"#,
            dir = dir.display()
        );
        Config::from_yaml(&doc).unwrap()
    }

    const WIRED: &str = "wired: [{ name: Lab, iface: eth0 }]";
    const WIFI: &str = "wifi: [{ name: Office, iface: wlan0, ssid: CorpNet, password: pw }]";

    fn build_engine(
        cfg: Config,
        prober: Arc<ScriptedProber>,
        cancel: CancellationToken,
    ) -> (CycleEngine, Arc<LiveSnapshot>) {
        let live = Arc::new(LiveSnapshot::new());
        let metrics = SensorMetrics::new(&cfg, Arc::clone(&live)).unwrap();
        let sinks = build_sinks(&cfg);
        let engine = CycleEngine::new(
            Arc::new(cfg),
            prober,
            Arc::new(FakeClock::new()),
            metrics,
            sinks,
            cancel,
        );
        (engine, live)
    }

    fn csv_rows(path: &Path) -> Vec<Vec<String>> {
        let mut reader = csv::Reader::from_path(path).unwrap();
        reader
            .records()
            .map(|r| r.unwrap().iter().map(str::to_string).collect())
            .collect()
    }

    #[tokio::test]
    async fn test_service_rows_follow_canonical_order() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path(), WIRED, "");
        let prober = Arc::new(ScriptedProber::default());
        let (mut engine, live) = build_engine(cfg, Arc::clone(&prober), CancellationToken::new());

        let executed = engine.run_cycle(1).await;
        engine.shutdown();

        // dhcp + one resolver + five Google tests
        assert_eq!(executed, 7);
        assert_eq!(live.state().total, 7);

        let rows = csv_rows(&dir.path().join("report.csv"));
        assert_eq!(rows.len(), 14);

        let google: Vec<(String, String)> = rows
            .iter()
            .filter(|r| r[8] == "Google")
            .map(|r| (r[6].clone(), r[7].clone()))
            .collect();
        let expected = [
            ("http_get", "http://google.com:80"),
            ("wifi_data", ""),
            ("ping", "google.com:80"),
            ("wifi_data", ""),
            ("http_get", "https://google.com:443"),
            ("wifi_data", ""),
            ("ping", "google.com:443"),
            ("wifi_data", ""),
            ("ping", "google.com"),
            ("wifi_data", ""),
        ];
        assert_eq!(google.len(), 10);
        for (row, (code, target)) in google.iter().zip(expected) {
            assert_eq!(row.0, code);
            assert_eq!(row.1, target);
        }

        // each test row shares its timestamp with the following wifi_data row
        for pair in rows.chunks(2) {
            assert_eq!(pair[0][0], pair[1][0]);
            assert_eq!(pair[1][6], "wifi_data");
        }

        let raw = std::fs::read_to_string(dir.path().join("results.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 14);
    }

    #[tokio::test]
    async fn test_timed_out_probe_is_recorded_and_cycle_continues() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path(), WIRED, "timeouts: { icmp_seconds: 0.05 }");
        let prober = Arc::new(ScriptedProber {
            hang_on: Some(TestKind::Icmp),
            ..Default::default()
        });
        let (mut engine, live) = build_engine(cfg, Arc::clone(&prober), CancellationToken::new());

        let executed = engine.run_cycle(1).await;
        engine.shutdown();

        assert_eq!(executed, 7);
        assert_eq!(live.state().completed, live.state().total);

        let raw = std::fs::read_to_string(dir.path().join("results.jsonl")).unwrap();
        let icmp: serde_json::Value = raw
            .lines()
            .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap())
            .find(|v| v["kind"] == "icmp")
            .unwrap();
        assert_eq!(icmp["success"], false);
        assert!(icmp["error"].as_str().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_failed_association_skips_dhcp_and_dns() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path(), WIFI, "");
        let prober = Arc::new(ScriptedProber {
            fail_association: true,
            ..Default::default()
        });
        let (mut engine, live) = build_engine(cfg, Arc::clone(&prober), CancellationToken::new());

        engine.run_cycle(1).await;

        let kinds: Vec<TestKind> = prober.executed().iter().map(ProbeStep::kind).collect();
        assert_eq!(kinds[0], TestKind::ApAssoc);
        assert!(!kinds.contains(&TestKind::Dhcp));
        assert!(!kinds.contains(&TestKind::Dns));
        assert_eq!(kinds.len(), 1 + 5);

        let state = live.state();
        assert_eq!(state.total, 6);
        assert_eq!(state.completed, 6);
        assert_eq!(state.progress_pct(), 100.0);
    }

    #[tokio::test]
    async fn test_service_waits_for_its_interval() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path(), WIRED, "");
        let prober = Arc::new(ScriptedProber::default());
        let (mut engine, _live) = build_engine(cfg, Arc::clone(&prober), CancellationToken::new());

        assert_eq!(engine.run_cycle(1).await, 7);
        // an hourly service is not due again a few seconds later
        assert_eq!(engine.run_cycle(2).await, 2);
        assert!(dir.path().join("schedule.json").exists());
    }

    #[tokio::test]
    async fn test_spawned_engine_runs_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path(), WIRED, "inter_cycle_delay_seconds: 0.2");
        let prober = Arc::new(ScriptedProber::default());
        let cancel = CancellationToken::new();
        let (engine, live) = build_engine(cfg, Arc::clone(&prober), cancel.clone());

        let handle = tokio::spawn(engine.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let state = live.state();
        assert_eq!(state.cycle, 1);
        assert_eq!(state.completed, 7);
        assert_eq!(csv_rows(&dir.path().join("report.csv")).len(), 14);
    }

    #[tokio::test]
    async fn test_cancelled_engine_stops_before_testing() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path(), WIRED, "");
        let prober = Arc::new(ScriptedProber::default());
        let cancel = CancellationToken::new();
        let (engine, live) = build_engine(cfg, Arc::clone(&prober), cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), engine.run())
            .await
            .unwrap();

        assert!(prober.executed().is_empty());
        assert_eq!(live.state().phase, Phase::Init);
    }
}
