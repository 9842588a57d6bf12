//! WiFi environment scan: parsing, filtering and the freshness table.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;

use super::command::run_command;
use super::result::AccessPoint;
use super::wifi::band_channel;
use super::ProbeError;
use crate::config::WifiScanLimits;

const HIDDEN_SSID: &str = "<hidden>";

/// Scan around `iface`: `iw scan`, cached `iw scan -u`, then `nmcli`.
pub async fn scan_access_points(
    iface: &str,
    limits: &WifiScanLimits,
    budget: Duration,
) -> Result<Vec<AccessPoint>, ProbeError> {
    if let Ok(out) = run_command("iw", &["dev", iface, "scan"], budget).await {
        if out.success {
            return Ok(select(parse_iw_scan(&out.combined()), limits));
        }
    }

    if let Ok(out) = run_command("iw", &["dev", iface, "scan", "-u"], Duration::from_secs(5)).await {
        if out.success {
            return Ok(select(parse_iw_scan(&out.combined()), limits));
        }
    }

    let out = run_command(
        "nmcli",
        &["-t", "-f", "BSSID,SSID,CHAN,FREQ,SIGNAL,SECURITY", "device", "wifi", "list", "ifname", iface],
        Duration::from_secs(10),
    )
    .await?;
    if !out.success || out.stdout.trim().is_empty() {
        return Err(ProbeError::Command(format!(
            "WiFi environment scan failed on {} (all methods)",
            iface
        )));
    }
    Ok(select(parse_nmcli_list(&out.stdout), limits))
}

/// Keep APs at or above the signal floor, strongest first, capped.
pub fn select(mut aps: Vec<AccessPoint>, limits: &WifiScanLimits) -> Vec<AccessPoint> {
    aps.retain(|ap| ap.rssi_dbm >= limits.min_rssi_dbm);
    aps.sort_by(|a, b| b.rssi_dbm.total_cmp(&a.rssi_dbm));
    aps.truncate(limits.max_aps);
    aps
}

pub fn sanitize_ssid(ssid: &str) -> String {
    let value = ssid.trim();
    if value.is_empty() {
        return HIDDEN_SSID.to_string();
    }
    value.chars().take(32).collect()
}

/// Parse `iw dev X scan` output. Entries without a signal are dropped.
pub fn parse_iw_scan(output: &str) -> Vec<AccessPoint> {
    static BSS_RE: OnceLock<Regex> = OnceLock::new();
    static FREQ_RE: OnceLock<Regex> = OnceLock::new();
    static SIGNAL_RE: OnceLock<Regex> = OnceLock::new();
    static WIDTH_RE: OnceLock<Regex> = OnceLock::new();
    let bss_re = BSS_RE.get_or_init(|| Regex::new(r"^BSS\s+([0-9a-fA-F:]{17})").unwrap());
    let freq_re = FREQ_RE.get_or_init(|| Regex::new(r"freq:\s*(\d+)").unwrap());
    let signal_re = SIGNAL_RE.get_or_init(|| Regex::new(r"signal:\s*(-?\d+(?:\.\d+)?)\s*dBm").unwrap());
    let width_re = WIDTH_RE.get_or_init(|| Regex::new(r"\((\d+)\s*MHz\)").unwrap());

    struct Partial {
        bssid: String,
        ssid: String,
        rssi_dbm: Option<f64>,
        freq_mhz: Option<u32>,
        width_mhz: u32,
    }

    fn finish(p: Partial) -> Option<AccessPoint> {
        let (band, channel) = p.freq_mhz.map(band_channel).unwrap_or((None, None));
        Some(AccessPoint {
            bssid: p.bssid,
            ssid: p.ssid,
            rssi_dbm: p.rssi_dbm?,
            freq_mhz: p.freq_mhz,
            band,
            channel,
            width_mhz: p.width_mhz,
        })
    }

    let mut aps = Vec::new();
    let mut current: Option<Partial> = None;
    let mut in_ht = false;

    for line in output.lines() {
        let line = line.trim().trim_start_matches('*').trim_start();
        if let Some(caps) = bss_re.captures(line) {
            if let Some(done) = current.take().and_then(finish) {
                aps.push(done);
            }
            current = Some(Partial {
                bssid: caps[1].to_lowercase(),
                ssid: HIDDEN_SSID.to_string(),
                rssi_dbm: None,
                freq_mhz: None,
                width_mhz: 20,
            });
            in_ht = false;
            continue;
        }

        let Some(ap) = current.as_mut() else {
            continue;
        };

        if let Some(value) = line.strip_prefix("SSID:") {
            ap.ssid = sanitize_ssid(value);
        } else if line.starts_with("freq:") {
            ap.freq_mhz = freq_re.captures(line).and_then(|c| c[1].parse().ok());
        } else if line.starts_with("signal:") {
            ap.rssi_dbm = signal_re.captures(line).and_then(|c| c[1].parse().ok());
        } else if line.starts_with("HT operation:") {
            in_ht = true;
        } else if line.starts_with("VHT operation:") || line.starts_with("HE operation:") {
            in_ht = false;
        } else if in_ht && line.starts_with("secondary channel offset:") {
            if !line.contains("no secondary") {
                ap.width_mhz = 40;
            }
        } else if line.contains("channel width:") {
            if let Some(width) = width_re.captures(line).and_then(|c| c[1].parse().ok()) {
                ap.width_mhz = width;
            }
        }
    }

    if let Some(done) = current.and_then(finish) {
        aps.push(done);
    }
    aps
}

/// Parse `nmcli -t -f BSSID,SSID,CHAN,FREQ,SIGNAL,SECURITY device wifi list`.
///
/// nmcli escapes colons inside fields as `\:`. Signal is a percentage and is
/// mapped to dBm as `signal / 2 - 100`.
pub fn parse_nmcli_list(output: &str) -> Vec<AccessPoint> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields = split_terse(line);
            if fields.len() < 5 {
                return None;
            }
            let bssid = fields[0].to_lowercase();
            if bssid.len() != 17 {
                return None;
            }
            let signal_pct: f64 = fields[4].trim().parse().ok()?;
            let freq_mhz = fields[3]
                .trim()
                .trim_end_matches("MHz")
                .trim()
                .parse::<u32>()
                .ok();
            let (band, computed_channel) = freq_mhz.map(band_channel).unwrap_or((None, None));
            let channel = fields[2].trim().parse::<u32>().ok().or(computed_channel);

            Some(AccessPoint {
                bssid,
                ssid: sanitize_ssid(&fields[1]),
                rssi_dbm: (signal_pct / 2.0 - 100.0).trunc(),
                freq_mhz,
                band,
                channel,
                width_mhz: 20,
            })
        })
        .collect()
}

fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

/// Last-seen table of scanned access points.
///
/// Entries not refreshed within the TTL are dropped and handed back so their
/// metric series can be removed.
#[derive(Debug, Default)]
pub struct AccessPointTable {
    entries: HashMap<String, (AccessPoint, i64)>,
}

impl AccessPointTable {
    /// Record `aps` as seen at `now` (unix seconds), then evict entries older
    /// than the TTL and the weakest entries beyond `max_aps`.
    pub fn refresh(&mut self, aps: &[AccessPoint], now: i64, limits: &WifiScanLimits) -> Vec<AccessPoint> {
        for ap in aps {
            self.entries.insert(ap.bssid.clone(), (ap.clone(), now));
        }

        let ttl = limits.ttl.as_secs() as i64;
        let mut evicted: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, (_, seen))| now - seen > ttl)
            .map(|(bssid, _)| bssid.clone())
            .collect();

        let live = self.entries.len() - evicted.len();
        if live > limits.max_aps {
            // strongest first, fresher sightings win ties
            let mut ranked: Vec<(&String, &(AccessPoint, i64))> = self
                .entries
                .iter()
                .filter(|(bssid, _)| !evicted.contains(bssid))
                .collect();
            ranked.sort_by(|(_, (a, a_seen)), (_, (b, b_seen))| {
                b.rssi_dbm
                    .total_cmp(&a.rssi_dbm)
                    .then(b_seen.cmp(a_seen))
            });
            let weakest: Vec<String> = ranked
                .into_iter()
                .skip(limits.max_aps)
                .map(|(bssid, _)| bssid.clone())
                .collect();
            evicted.extend(weakest);
        }

        evicted
            .into_iter()
            .filter_map(|bssid| self.entries.remove(&bssid).map(|(ap, _)| ap))
            .collect()
    }

    /// Live entries with their last-seen timestamp.
    pub fn entries(&self) -> impl Iterator<Item = (&AccessPoint, i64)> {
        self.entries.values().map(|(ap, seen)| (ap, *seen))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const IW_SCAN: &str = "BSS aa:bb:cc:00:00:01(on wlan0) -- associated
\tfreq: 2437
\tsignal: -45.00 dBm
\tSSID: CorpNet
\tHT operation:
\t\t * primary channel: 6
\t\t * secondary channel offset: above
BSS aa:bb:cc:00:00:02(on wlan0)
\tfreq: 5180
\tsignal: -71.00 dBm
\tSSID:
\tVHT operation:
\t\t * channel width: 1 (80 MHz)
BSS aa:bb:cc:00:00:03(on wlan0)
\tfreq: 5955
\tsignal: -93.00 dBm
\tSSID: FarAway
BSS aa:bb:cc:00:00:04(on wlan0)
\tfreq: 2412
\tSSID: NoSignal
";

    fn limits(max_aps: usize, min_rssi_dbm: f64) -> WifiScanLimits {
        WifiScanLimits {
            enabled: true,
            max_aps,
            min_rssi_dbm,
            ttl: Duration::from_secs(300),
        }
    }

    #[test]
    fn test_parse_iw_scan() {
        let aps = parse_iw_scan(IW_SCAN);
        assert_eq!(aps.len(), 3);

        assert_eq!(aps[0].bssid, "aa:bb:cc:00:00:01");
        assert_eq!(aps[0].ssid, "CorpNet");
        assert_eq!(aps[0].rssi_dbm, -45.0);
        assert_eq!(aps[0].channel, Some(6));
        assert_eq!(aps[0].band, Some("2.4"));
        assert_eq!(aps[0].width_mhz, 40);

        assert_eq!(aps[1].ssid, "<hidden>");
        assert_eq!(aps[1].width_mhz, 80);
        assert_eq!(aps[1].channel, Some(36));

        assert_eq!(aps[2].band, Some("6"));
    }

    #[test]
    fn test_select_filters_sorts_and_caps() {
        let aps = select(parse_iw_scan(IW_SCAN), &limits(1, -90.0));
        assert_eq!(aps.len(), 1);
        assert_eq!(aps[0].ssid, "CorpNet");

        let aps = select(parse_iw_scan(IW_SCAN), &limits(10, -90.0));
        assert_eq!(aps.len(), 2);
        assert!(aps[0].rssi_dbm > aps[1].rssi_dbm);
    }

    #[test]
    fn test_parse_nmcli_list() {
        let out = "AA\\:BB\\:CC\\:DD\\:EE\\:01:Guest:11:2462 MHz:80:WPA2\n\
                   AA\\:BB\\:CC\\:DD\\:EE\\:02::36:5180 MHz:40:WPA2 802.1X\n";
        let aps = parse_nmcli_list(out);
        assert_eq!(aps.len(), 2);
        assert_eq!(aps[0].bssid, "aa:bb:cc:dd:ee:01");
        assert_eq!(aps[0].ssid, "Guest");
        assert_eq!(aps[0].rssi_dbm, -60.0);
        assert_eq!(aps[0].channel, Some(11));
        assert_eq!(aps[1].ssid, "<hidden>");
        assert_eq!(aps[1].rssi_dbm, -80.0);
        assert_eq!(aps[1].band, Some("5"));
    }

    #[test]
    fn test_sanitize_ssid() {
        assert_eq!(sanitize_ssid("  "), "<hidden>");
        assert_eq!(sanitize_ssid(&"x".repeat(40)).len(), 32);
    }

    #[test]
    fn test_table_expires_stale_entries() {
        let aps = parse_iw_scan(IW_SCAN);
        let limits = limits(10, -100.0);
        let mut table = AccessPointTable::default();

        assert!(table.refresh(&aps, 1_000, &limits).is_empty());
        assert_eq!(table.len(), 3);

        // Only the first AP is seen again
        let expired = table.refresh(&aps[..1], 1_200, &limits);
        assert!(expired.is_empty());

        let mut expired = table.refresh(&aps[..1], 1_301, &limits);
        expired.sort_by(|a, b| a.bssid.cmp(&b.bssid));
        assert_eq!(expired.len(), 2);
        assert_eq!(expired[0].bssid, "aa:bb:cc:00:00:02");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_table_never_tracks_more_than_max_aps() {
        let ap = |bssid: &str, rssi: f64| AccessPoint {
            bssid: bssid.into(),
            ssid: "Guest".into(),
            rssi_dbm: rssi,
            freq_mhz: Some(2437),
            band: Some("2.4"),
            channel: Some(6),
            width_mhz: 20,
        };
        let limits = limits(2, -100.0);
        let mut table = AccessPointTable::default();

        table.refresh(&[ap("aa:00", -50.0), ap("aa:01", -80.0)], 1_000, &limits);
        let mut dropped = table.refresh(&[ap("aa:02", -60.0), ap("aa:03", -90.0)], 1_060, &limits);
        dropped.sort_by(|a, b| a.bssid.cmp(&b.bssid));

        assert_eq!(table.len(), 2);
        let mut kept: Vec<&str> = table.entries().map(|(ap, _)| ap.bssid.as_str()).collect();
        kept.sort();
        assert_eq!(kept, vec!["aa:00", "aa:02"]);
        assert_eq!(dropped.len(), 2);
        assert_eq!(dropped[0].bssid, "aa:01");
        assert_eq!(dropped[1].bssid, "aa:03");
    }
}
