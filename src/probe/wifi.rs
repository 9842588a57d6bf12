//! WiFi association and link state via `nmcli` and `iw`.

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use super::command::run_command;
use super::result::{Measurement, WifiSnapshot};
use super::ProbeError;
use crate::config::{WifiAuth, WifiProfile};

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Band label and channel number for a centre frequency in MHz.
pub fn band_channel(freq_mhz: u32) -> (Option<&'static str>, Option<u32>) {
    let f = freq_mhz as i64;
    let (band, channel) = match f {
        2400..=2499 => ("2.4", (f - 2407) / 5),
        5000..=5899 => ("5", (f - 5000) / 5),
        5950..=7124 => ("6", (f - 5950) / 5),
        _ => return (None, None),
    };
    let channel = (channel > 0).then_some(channel as u32);
    (Some(band), channel)
}

/// Join `profile.ssid` on `iface`, forcing a fresh association.
///
/// Elapsed time is the sum of the nmcli command durations.
pub async fn associate(
    iface: &str,
    profile: &WifiProfile,
    budget: Duration,
) -> Result<Measurement, ProbeError> {
    let mut total = Duration::ZERO;

    if active_ssid(iface).await.is_some() {
        let disc = run_command("nmcli", &["dev", "disconnect", iface], Duration::from_secs(10)).await?;
        total += disc.elapsed;
    }

    let radio = run_command("nmcli", &["radio", "wifi", "on"], QUERY_TIMEOUT).await?;
    total += radio.elapsed;
    if !radio.success {
        return Ok(Measurement::failed("nmcli radio on failed", Some(total.as_secs_f64())));
    }

    let connect = match &profile.auth {
        WifiAuth::Psk => {
            let mut args = vec!["dev", "wifi", "connect", profile.ssid.as_str()];
            if let Some(password) = profile.password.as_deref() {
                args.extend(["password", password]);
            }
            args.extend(["ifname", iface]);
            if let Some(bssid) = profile.bssid_lock.as_deref() {
                tracing::info!("BSSID lock enabled: {}", bssid);
                args.extend(["bssid", bssid]);
            }
            run_command("nmcli", &args, budget).await?
        }
        WifiAuth::Enterprise {
            eap_method,
            identity,
            phase2_auth,
            anonymous_identity,
        } => {
            let con_name = format!("netsensor-{}", profile.ssid);
            let _ = run_command("nmcli", &["con", "delete", con_name.as_str()], QUERY_TIMEOUT).await;

            let eap = eap_method.to_lowercase();
            let phase2 = phase2_auth.as_ref().map(|p| p.to_lowercase());
            let mut args = vec![
                "con", "add", "type", "wifi", "ifname", iface, "con-name", con_name.as_str(),
                "ssid", profile.ssid.as_str(), "wifi-sec.key-mgmt", "wpa-eap",
                "802-1x.eap", eap.as_str(), "802-1x.identity", identity.as_str(),
                "802-1x.password", profile.password.as_deref().unwrap_or(""),
            ];
            if let Some(bssid) = profile.bssid_lock.as_deref() {
                tracing::info!("BSSID lock enabled: {}", bssid);
                args.extend(["wifi.bssid", bssid]);
            }
            if let Some(phase2) = phase2.as_deref() {
                args.extend(["802-1x.phase2-auth", phase2]);
            }
            if let Some(anon) = anonymous_identity.as_deref() {
                args.extend(["802-1x.anonymous-identity", anon]);
            }
            args.extend(["802-1x.system-ca-certs", "no"]);

            let add = run_command("nmcli", &args, Duration::from_secs(10)).await?;
            total += add.elapsed;
            if !add.success {
                tracing::warn!("Failed to create 802.1X profile: {}", add.stderr.trim());
                return Ok(Measurement::failed(
                    "nmcli 802.1x profile creation failed",
                    Some(total.as_secs_f64()),
                ));
            }

            run_command("nmcli", &["con", "up", con_name.as_str()], budget).await?
        }
    };

    total += connect.elapsed;
    if !connect.success {
        tracing::warn!("Association to {} failed: {}", profile.ssid, connect.stderr.trim());
        return Ok(Measurement::failed("nmcli connect failed", Some(total.as_secs_f64())));
    }

    Ok(Measurement::ok(total.as_secs_f64()))
}

async fn active_ssid(iface: &str) -> Option<String> {
    let output = run_command(
        "nmcli",
        &["-t", "-f", "ACTIVE,SSID", "dev", "wifi", "list", "ifname", iface],
        QUERY_TIMEOUT,
    )
    .await
    .ok()?;
    if !output.success {
        return None;
    }
    output
        .stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("yes:").map(str::to_string))
}

/// Current link metrics of `iface`, or `None` when not associated.
pub async fn link_snapshot(iface: &str) -> Option<WifiSnapshot> {
    let link = run_command("iw", &["dev", iface, "link"], QUERY_TIMEOUT).await.ok()?;
    if !link.success {
        return None;
    }
    let mut snapshot = parse_link(&link.combined())?;

    match run_command("iw", &["dev", iface, "survey", "dump"], QUERY_TIMEOUT).await {
        Ok(survey) if survey.success => {
            snapshot.channel_busy_pct = parse_survey_busy_pct(&survey.stdout);
        }
        Ok(_) | Err(_) => tracing::debug!("iw survey dump failed for {}", iface),
    }

    Some(snapshot)
}

/// Parse `iw dev X link` output.
pub fn parse_link(output: &str) -> Option<WifiSnapshot> {
    if output.contains("Not connected.") {
        return None;
    }

    static BSSID_RE: OnceLock<Regex> = OnceLock::new();
    static SSID_RE: OnceLock<Regex> = OnceLock::new();
    static SIGNAL_RE: OnceLock<Regex> = OnceLock::new();
    static FREQ_RE: OnceLock<Regex> = OnceLock::new();
    static TX_RE: OnceLock<Regex> = OnceLock::new();
    static RX_RE: OnceLock<Regex> = OnceLock::new();

    let bssid_re = BSSID_RE.get_or_init(|| Regex::new(r"Connected to\s+([0-9a-fA-F:]{17})").unwrap());
    let ssid_re = SSID_RE.get_or_init(|| Regex::new(r"(?m)^\s*SSID:\s*(.+)$").unwrap());
    let signal_re = SIGNAL_RE.get_or_init(|| Regex::new(r"signal:\s*(-?\d+)\s*dBm").unwrap());
    let freq_re = FREQ_RE.get_or_init(|| Regex::new(r"freq:\s*(\d+)").unwrap());
    let tx_re = TX_RE.get_or_init(|| Regex::new(r"tx bitrate:\s*([0-9.]+)\s*MBit/s").unwrap());
    let rx_re = RX_RE.get_or_init(|| Regex::new(r"rx bitrate:\s*([0-9.]+)\s*MBit/s").unwrap());

    let capture = |re: &Regex| re.captures(output).map(|c| c[1].trim().to_string());

    let freq_mhz = capture(freq_re).and_then(|f| f.parse::<u32>().ok());
    let (band, channel) = freq_mhz.map(band_channel).unwrap_or((None, None));

    let snapshot = WifiSnapshot {
        bssid: capture(bssid_re).map(|b| b.to_lowercase()),
        ssid: capture(ssid_re),
        rssi_dbm: capture(signal_re).and_then(|s| s.parse().ok()),
        freq_mhz,
        band,
        channel,
        tx_bitrate_mbps: capture(tx_re).and_then(|s| s.parse().ok()),
        rx_bitrate_mbps: capture(rx_re).and_then(|s| s.parse().ok()),
        channel_busy_pct: None,
    };

    (!snapshot.is_empty()).then_some(snapshot)
}

/// Busy share of the in-use channel from `iw survey dump`, in percent.
pub fn parse_survey_busy_pct(output: &str) -> Option<f64> {
    static ACTIVE_RE: OnceLock<Regex> = OnceLock::new();
    static BUSY_RE: OnceLock<Regex> = OnceLock::new();
    let active_re = ACTIVE_RE.get_or_init(|| Regex::new(r"channel active time:\s*(\d+)\s*ms").unwrap());
    let busy_re = BUSY_RE.get_or_init(|| Regex::new(r"channel busy time:\s*(\d+)\s*ms").unwrap());

    let mut in_use = false;
    let mut active: Option<u64> = None;
    let mut busy: Option<u64> = None;

    for line in output.lines().map(str::trim) {
        if line.starts_with("Survey data from") {
            in_use = line.contains("in use");
            active = None;
            busy = None;
            continue;
        }
        if line.contains("in use") {
            in_use = true;
        }
        if let Some(c) = active_re.captures(line) {
            active = c[1].parse().ok();
        }
        if let Some(c) = busy_re.captures(line) {
            busy = c[1].parse().ok();
        }
        if let (true, Some(a), Some(b)) = (in_use, active, busy) {
            if a == 0 {
                return None;
            }
            return Some(b as f64 / a as f64 * 100.0);
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const LINK: &str = "Connected to aa:bb:cc:dd:ee:ff (on wlan0)
\tSSID: CorpNet
\tfreq: 5180
\tRX: 123456 bytes (789 packets)
\tTX: 65432 bytes (321 packets)
\tsignal: -58 dBm
\trx bitrate: 433.3 MBit/s VHT-MCS 9 80MHz short GI VHT-NSS 1
\ttx bitrate: 390.0 MBit/s VHT-MCS 8 80MHz short GI VHT-NSS 1
";

    const SURVEY: &str = "Survey data from wlan0
\tfrequency:\t\t\t5170 MHz
\tnoise:\t\t\t\t-95 dBm
\tchannel active time:\t\t100 ms
\tchannel busy time:\t\t90 ms
Survey data from wlan0
\tfrequency:\t\t\t5180 MHz [in use]
\tnoise:\t\t\t\t-92 dBm
\tchannel active time:\t\t1000 ms
\tchannel busy time:\t\t250 ms
";

    #[test]
    fn test_band_channel() {
        assert_eq!(band_channel(2412), (Some("2.4"), Some(1)));
        assert_eq!(band_channel(2437), (Some("2.4"), Some(6)));
        assert_eq!(band_channel(5180), (Some("5"), Some(36)));
        assert_eq!(band_channel(5955), (Some("6"), Some(1)));
        assert_eq!(band_channel(5950), (Some("6"), None));
        assert_eq!(band_channel(900), (None, None));
    }

    #[test]
    fn test_parse_link() {
        let snap = parse_link(LINK).unwrap();
        assert_eq!(snap.bssid.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(snap.ssid.as_deref(), Some("CorpNet"));
        assert_eq!(snap.rssi_dbm, Some(-58));
        assert_eq!(snap.freq_mhz, Some(5180));
        assert_eq!(snap.band, Some("5"));
        assert_eq!(snap.channel, Some(36));
        assert_eq!(snap.tx_bitrate_mbps, Some(390.0));
        assert_eq!(snap.rx_bitrate_mbps, Some(433.3));
    }

    #[test]
    fn test_parse_link_not_connected() {
        assert_eq!(parse_link("Not connected.\n"), None);
        assert_eq!(parse_link(""), None);
    }

    #[test]
    fn test_survey_in_use_channel() {
        assert_eq!(parse_survey_busy_pct(SURVEY), Some(25.0));
        assert_eq!(parse_survey_busy_pct("Survey data from wlan0\n"), None);
    }
}
