//! DHCP lease acquisition and release.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;

use super::command::run_command;
use super::result::Measurement;
use super::ProbeError;

const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Run a full DORA exchange on `iface` and wait for an IPv4 address.
///
/// Tries `dhclient -1` first, then asks NetworkManager to reapply or
/// connect and polls the interface with exponential backoff.
pub async fn request_lease(iface: &str, budget: Duration) -> Result<Measurement, ProbeError> {
    let start = Instant::now();

    match run_command("dhclient", &["-1", "-v", iface], budget).await {
        Ok(out) if out.success => {
            if let Some(ip) = interface_ipv4(iface).await {
                return Ok(leased(ip, start.elapsed()));
            }
        }
        Ok(out) => tracing::debug!("dhclient on {} failed: {}", iface, out.stderr.trim()),
        Err(e) => tracing::debug!("dhclient on {} unavailable: {}", iface, e),
    }

    let reapply = run_command("nmcli", &["device", "reapply", iface], MAX_BACKOFF).await;
    if !matches!(reapply, Ok(ref out) if out.success) {
        let _ = run_command("nmcli", &["device", "connect", iface], MAX_BACKOFF).await;
    }

    let mut backoff = Duration::from_secs(1);
    while start.elapsed() < budget {
        if let Some(ip) = interface_ipv4(iface).await {
            return Ok(leased(ip, start.elapsed()));
        }
        let remaining = budget.saturating_sub(start.elapsed());
        tokio::time::sleep(backoff.min(remaining)).await;
        backoff = next_backoff(backoff);
    }

    Ok(Measurement::failed(
        "no response from DHCP server",
        Some(start.elapsed().as_secs_f64()),
    ))
}

fn leased(ip: String, elapsed: Duration) -> Measurement {
    let mut m = Measurement::ok(elapsed.as_secs_f64());
    m.ip_address = Some(ip);
    m
}

pub fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

/// Give the lease back once a network has been tested.
pub async fn release_lease(iface: &str) -> bool {
    let attempts: [(&str, Vec<&str>, u64); 3] = [
        ("dhclient", vec!["-r", iface], 5),
        ("nmcli", vec!["device", "disconnect", iface], 5),
        ("ip", vec!["addr", "flush", "dev", iface], 3),
    ];

    for (program, args, secs) in attempts {
        match run_command(program, &args, Duration::from_secs(secs)).await {
            Ok(out) if out.success => {
                tracing::debug!("Released address on {} via {}", iface, program);
                return true;
            }
            _ => continue,
        }
    }

    tracing::warn!("Failed to release DHCP lease for {}", iface);
    false
}

pub async fn interface_ipv4(iface: &str) -> Option<String> {
    let out = run_command("ip", &["-4", "addr", "show", "dev", iface], Duration::from_secs(3))
        .await
        .ok()?;
    if !out.success {
        return None;
    }
    parse_ipv4(&out.stdout)
}

/// First `inet a.b.c.d/n` address in `ip addr` output.
pub fn parse_ipv4(output: &str) -> Option<String> {
    static INET_RE: OnceLock<Regex> = OnceLock::new();
    let re = INET_RE.get_or_init(|| Regex::new(r"inet\s+(\d+\.\d+\.\d+\.\d+)/\d+").unwrap());
    re.captures(output).map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let out = "3: wlan0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc noqueue state UP
    inet 192.168.1.42/24 brd 192.168.1.255 scope global dynamic wlan0
       valid_lft 86000sec preferred_lft 86000sec";
        assert_eq!(parse_ipv4(out).as_deref(), Some("192.168.1.42"));
        assert_eq!(parse_ipv4("3: wlan0: <NO-CARRIER> mtu 1500"), None);
    }

    #[test]
    fn test_backoff_caps() {
        let mut b = Duration::from_secs(1);
        let mut seen = vec![];
        for _ in 0..6 {
            seen.push(b.as_secs());
            b = next_backoff(b);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 10, 10]);
    }
}
