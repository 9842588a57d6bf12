//! Per-cycle execution plan: which steps run, in which order.

use crate::config::{Config, NetworkProfile, Scope, ServiceDefinition, ServiceTest};
use crate::probe::{ProbeStep, ServiceRef};

use super::state::Phase;
use super::tracker::ScheduleTracker;

/// A due service selected for this cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedService {
    pub reference: ServiceRef,
    pub schedule_key: String,
}

/// Steps that run together; per-service units share one schedule entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanUnit {
    pub service: Option<PlannedService>,
    pub steps: Vec<ProbeStep>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhasePlan {
    pub phase: Phase,
    pub units: Vec<PlanUnit>,
}

impl PhasePlan {
    pub fn step_count(&self) -> u32 {
        self.units.iter().map(|u| u.steps.len() as u32).sum()
    }
}

/// Everything one network runs in one cycle.
#[derive(Debug, Clone)]
pub struct NetworkPlan {
    pub network: NetworkProfile,
    /// One entry per [`Phase::NETWORK_PASS`] phase, in order.
    pub phases: Vec<PhasePlan>,
    pub scan: bool,
}

impl NetworkPlan {
    pub fn step_count(&self) -> u32 {
        self.phases.iter().map(PhasePlan::step_count).sum()
    }

    #[cfg(test)]
    pub fn phase(&self, phase: Phase) -> Option<&PhasePlan> {
        self.phases.iter().find(|p| p.phase == phase)
    }
}

/// Elementary steps of `service`, in canonical order:
/// GET :80, TCP :80, GET :443, TCP :443, ICMP, VoIP MOS, throughput.
pub fn service_steps(service: &ServiceDefinition, throughput_enabled: bool) -> Vec<ProbeStep> {
    let mut steps = Vec::new();

    if let Some(host) = service.host() {
        if service.requests(ServiceTest::Http) {
            steps.push(ProbeStep::HttpGet {
                host: host.clone(),
                tls: false,
            });
        }
        if service.requests(ServiceTest::Tcp80) {
            steps.push(ProbeStep::TcpConnect {
                host: host.clone(),
                port: 80,
            });
        }
        if service.requests(ServiceTest::Http) {
            steps.push(ProbeStep::HttpGet {
                host: host.clone(),
                tls: true,
            });
        }
        if service.requests(ServiceTest::Tcp443) {
            steps.push(ProbeStep::TcpConnect {
                host: host.clone(),
                port: 443,
            });
        }
        if service.requests(ServiceTest::Icmp) {
            steps.push(ProbeStep::Icmp { host: host.clone() });
        }
        if service.requests(ServiceTest::VoipMos) {
            steps.push(ProbeStep::VoipMos { host });
        }
    }

    if throughput_enabled && service.requests(ServiceTest::Throughput) {
        steps.push(ProbeStep::Throughput);
    }

    steps
}

pub fn dns_steps(servers: &[String], domain: &str) -> Vec<ProbeStep> {
    servers
        .iter()
        .take(2)
        .map(|server| ProbeStep::Dns {
            server: server.clone(),
            domain: domain.to_string(),
        })
        .collect()
}

/// Build the plan of `network` for a cycle starting at `now` (unix seconds).
///
/// Due-ness is decided here; services that are not due do not appear.
pub fn plan_network(
    config: &Config,
    network: &NetworkProfile,
    tracker: &ScheduleTracker,
    dns_servers: &[String],
    now: i64,
) -> NetworkPlan {
    let mut phases = Vec::with_capacity(Phase::NETWORK_PASS.len());

    for phase in Phase::NETWORK_PASS {
        let units = match phase {
            Phase::WifiAssoc => match &network.wifi {
                Some(wifi) => vec![PlanUnit {
                    service: None,
                    steps: vec![ProbeStep::Associate {
                        iface: network.iface.clone(),
                        wifi: wifi.clone(),
                    }],
                }],
                None => Vec::new(),
            },
            Phase::Dhcp => vec![PlanUnit {
                service: None,
                steps: vec![ProbeStep::Dhcp {
                    iface: network.iface.clone(),
                }],
            }],
            Phase::Dns => {
                let steps = dns_steps(dns_servers, &config.dns_domain);
                if steps.is_empty() {
                    Vec::new()
                } else {
                    vec![PlanUnit {
                        service: None,
                        steps,
                    }]
                }
            }
            Phase::InternalServices => service_units(config, network, tracker, Scope::Internal, now),
            Phase::ExternalServices => service_units(config, network, tracker, Scope::External, now),
            _ => Vec::new(),
        };
        phases.push(PhasePlan { phase, units });
    }

    NetworkPlan {
        network: network.clone(),
        phases,
        scan: network.wifi.is_some() && config.wifi_scan.enabled,
    }
}

fn service_units(
    config: &Config,
    network: &NetworkProfile,
    tracker: &ScheduleTracker,
    scope: Scope,
    now: i64,
) -> Vec<PlanUnit> {
    config
        .services
        .iter()
        .filter(|s| s.scope == scope)
        .filter_map(|service| {
            let schedule_key = service.schedule_key(network);
            if !tracker.is_due(&schedule_key, service.frequency, now) {
                tracing::debug!("Service {} not due on {}", service.name, network.name);
                return None;
            }
            let steps = service_steps(service, config.throughput.enabled);
            if steps.is_empty() {
                return None;
            }
            Some(PlanUnit {
                service: Some(PlannedService {
                    reference: ServiceRef::new(service),
                    schedule_key,
                }),
                steps,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::TestKind;
    use tempfile::TempDir;

    const DOC: &str = r#"
wifi:
  - { name: Office, iface: wlan0, ssid: CorpNet, password: pw }
wired:
  - { iface: eth0 }
throughput_test: { enabled: true }
services:
  internal:
    - { name: Gateway, target: 10.0.0.1, tests: [icmp], frequency: 1hr }
  external:
    - { name: Google, target: google.com, tests: [icmp, http, tcp_80, tcp_443], frequency: fastest }
    - { name: Voice, target: 8.8.8.8, tests: [throughput, voip, tcp_443], frequency: fastest }
"#;

    fn setup() -> (Config, ScheduleTracker, TempDir) {
        let dir = TempDir::new().unwrap();
        let tracker = ScheduleTracker::load(dir.path().join("schedule.json"));
        (Config::from_yaml(DOC).unwrap(), tracker, dir)
    }

    fn kinds(steps: &[ProbeStep]) -> Vec<TestKind> {
        steps.iter().map(ProbeStep::kind).collect()
    }

    #[test]
    fn test_canonical_sub_order() {
        let (cfg, _, _dir) = setup();
        let google = service_steps(&cfg.services[1], true);
        assert_eq!(
            google.iter().map(ProbeStep::record_target).collect::<Vec<_>>(),
            vec![
                "http://google.com:80",
                "google.com:80",
                "https://google.com:443",
                "google.com:443",
                "google.com",
            ]
        );

        let voice = service_steps(&cfg.services[2], true);
        assert_eq!(
            kinds(&voice),
            vec![TestKind::TcpConnect, TestKind::VoipMos, TestKind::Throughput]
        );
        let voice = service_steps(&cfg.services[2], false);
        assert_eq!(kinds(&voice), vec![TestKind::TcpConnect, TestKind::VoipMos]);
    }

    #[test]
    fn test_phase_order_and_counts() {
        let (cfg, tracker, _dir) = setup();
        let servers = vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()];

        let wifi = plan_network(&cfg, &cfg.networks[0], &tracker, &servers, 1_000);
        let phases: Vec<_> = wifi.phases.iter().map(|p| p.phase).collect();
        assert_eq!(phases, Phase::NETWORK_PASS.to_vec());
        // assoc + dhcp + 2 dns + gateway icmp + 5 google + 3 voice
        assert_eq!(wifi.step_count(), 1 + 1 + 2 + 1 + 5 + 3);
        assert!(wifi.scan);

        let wired = plan_network(&cfg, &cfg.networks[1], &tracker, &servers, 1_000);
        assert_eq!(wired.phase(Phase::WifiAssoc).unwrap().step_count(), 0);
        assert!(!wired.scan);
    }

    #[test]
    fn test_not_due_services_are_left_out() {
        let (cfg, mut tracker, _dir) = setup();
        let network = &cfg.networks[0];
        let key = cfg.services[0].schedule_key(network);
        tracker.mark_run(&key, 1_000);

        let plan = plan_network(&cfg, network, &tracker, &[], 1_500);
        assert!(plan.phase(Phase::InternalServices).unwrap().units.is_empty());
        assert!(plan.phase(Phase::Dns).unwrap().units.is_empty());

        let later = plan_network(&cfg, network, &tracker, &[], 1_000 + 3_600);
        assert_eq!(later.phase(Phase::InternalServices).unwrap().units.len(), 1);
    }

    #[test]
    fn test_schedule_is_per_network() {
        let (cfg, mut tracker, _dir) = setup();
        let key = cfg.services[0].schedule_key(&cfg.networks[0]);
        tracker.mark_run(&key, 1_000);

        let wired = plan_network(&cfg, &cfg.networks[1], &tracker, &[], 1_500);
        assert_eq!(wired.phase(Phase::InternalServices).unwrap().units.len(), 1);
    }
}
