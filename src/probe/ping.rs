//! ICMP echo probe with native sockets and a `ping` command fallback.
//!
//! Each echo runs on a blocking socket inside spawn_blocking so the timing
//! is not skewed by the async scheduler.

use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use regex::Regex;
use socket2::{Domain, Protocol, Socket, Type};

use super::command::run_command;
use super::result::Measurement;
use super::ProbeError;

/// Per-echo reply deadline.
pub const ECHO_TIMEOUT: Duration = Duration::from_secs(1);
/// Gap between consecutive echoes.
pub const ECHO_SPACING: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq)]
enum IcmpCapability {
    Native,
    CommandOnly,
}

static ICMP_CAPABILITY: OnceLock<IcmpCapability> = OnceLock::new();

static PING_SEQUENCE: AtomicU16 = AtomicU16::new(0);

fn generate_ping_id() -> (u16, u16) {
    let identifier: u16 = rand::random();
    let sequence = PING_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    (identifier, sequence)
}

fn detect_icmp_capability() -> IcmpCapability {
    if Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("ICMP probe: using native RAW socket");
        return IcmpCapability::Native;
    }

    if Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)).is_ok() {
        tracing::info!("ICMP probe: using native DGRAM socket (unprivileged)");
        return IcmpCapability::Native;
    }

    tracing::info!("ICMP probe: native sockets unavailable, using ping command");
    IcmpCapability::CommandOnly
}

/// Round-trip samples of one ping run.
#[derive(Debug, Clone, PartialEq)]
pub struct PingStats {
    pub sent: u32,
    /// Milliseconds, one per received reply, in send order.
    pub rtts_ms: Vec<f64>,
}

impl PingStats {
    pub fn received(&self) -> u32 {
        self.rtts_ms.len() as u32
    }

    pub fn loss_pct(&self) -> f64 {
        if self.sent == 0 {
            return 100.0;
        }
        let lost = self.sent.saturating_sub(self.received());
        lost as f64 / self.sent as f64 * 100.0
    }

    pub fn avg_ms(&self) -> Option<f64> {
        if self.rtts_ms.is_empty() {
            return None;
        }
        Some(self.rtts_ms.iter().sum::<f64>() / self.rtts_ms.len() as f64)
    }

    /// Mean absolute difference between consecutive round trips.
    pub fn jitter_ms(&self) -> Option<f64> {
        match self.rtts_ms.len() {
            0 => None,
            1 => Some(0.0),
            n => {
                let total: f64 = self
                    .rtts_ms
                    .windows(2)
                    .map(|pair| (pair[1] - pair[0]).abs())
                    .sum();
                Some(total / (n - 1) as f64)
            }
        }
    }

    pub fn into_measurement(self, elapsed: Duration) -> Measurement {
        let received = self.received();
        Measurement {
            success: received > 0,
            elapsed_s: Some(elapsed.as_secs_f64()),
            latency_ms: self.avg_ms(),
            jitter_ms: self.jitter_ms(),
            packet_loss_pct: Some(self.loss_pct()),
            error: (received == 0).then(|| "no echo replies".to_string()),
            ..Default::default()
        }
    }
}

/// Send `count` echoes to `host` and report RTT, jitter and loss.
pub async fn run_icmp_probe(host: &str, count: u32) -> Result<Measurement, ProbeError> {
    let start = Instant::now();
    let stats = collect_ping_stats(host, count).await?;
    Ok(stats.into_measurement(start.elapsed()))
}

pub async fn collect_ping_stats(host: &str, count: u32) -> Result<PingStats, ProbeError> {
    let capability = *ICMP_CAPABILITY.get_or_init(detect_icmp_capability);
    if capability == IcmpCapability::CommandOnly {
        return run_ping_command(host, count).await;
    }

    let ip = resolve_address(host).await?;
    let mut stats = PingStats {
        sent: 0,
        rtts_ms: Vec::with_capacity(count as usize),
    };

    for i in 0..count {
        if i > 0 {
            tokio::time::sleep(ECHO_SPACING).await;
        }
        stats.sent += 1;

        let echo = tokio::task::spawn_blocking(move || run_blocking_ping(ip, ECHO_TIMEOUT))
            .await
            .map_err(|e| ProbeError::Network(format!("spawn_blocking failed: {}", e)))?;

        match echo {
            Ok(rtt) => stats.rtts_ms.push(rtt.as_secs_f64() * 1000.0),
            Err(ProbeError::Timeout(_)) => {}
            Err(ProbeError::Network(msg)) if is_permission_error(&msg) && stats.rtts_ms.is_empty() => {
                tracing::warn!(
                    "Native ping to {} not permitted, falling back to command: {}",
                    host,
                    msg
                );
                return run_ping_command(host, count).await;
            }
            Err(e) => {
                tracing::debug!("Echo {} to {} failed: {}", i, host, e);
            }
        }
    }

    Ok(stats)
}

fn is_permission_error(message: &str) -> bool {
    message.contains("Permission")
        || message.contains("Operation not permitted")
        || message.contains("denied")
}

pub(crate) async fn resolve_address(address: &str) -> Result<IpAddr, ProbeError> {
    if let Ok(ip) = address.parse::<IpAddr>() {
        return Ok(ip);
    }

    let mut addrs = tokio::net::lookup_host(format!("{}:0", address))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed for {}: {}", address, e)))?;

    addrs
        .next()
        .map(|sa| sa.ip())
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", address)))
}

fn run_blocking_ping(ip: IpAddr, timeout: Duration) -> Result<Duration, ProbeError> {
    let (socket, packet, identifier, sequence, reply_type) = match ip {
        IpAddr::V4(v4) => {
            let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
                .or_else(|_| Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4)))
                .map_err(|e| ProbeError::Network(format!("failed to create ICMP socket: {}", e)))?;
            let (id, seq) = generate_ping_id();
            connect_socket(&socket, SocketAddr::new(IpAddr::V4(v4), 0), timeout)?;
            (socket, build_icmp_echo_request(id, seq), id, seq, 0u8)
        }
        IpAddr::V6(v6) => {
            let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))
                .or_else(|_| Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::ICMPV6)))
                .map_err(|e| ProbeError::Network(format!("failed to create ICMPv6 socket: {}", e)))?;
            let (id, seq) = generate_ping_id();
            connect_socket(&socket, SocketAddr::new(IpAddr::V6(v6), 0), timeout)?;
            (socket, build_icmpv6_echo_request(id, seq), id, seq, 129u8)
        }
    };

    let start = Instant::now();

    socket.send(&packet).map_err(|e| {
        if e.kind() == std::io::ErrorKind::PermissionDenied {
            ProbeError::Network(format!("Permission denied: {}", e))
        } else {
            ProbeError::Network(format!("failed to send: {}", e))
        }
    })?;

    loop {
        let mut buf = [MaybeUninit::<u8>::uninit(); 1500];
        let len = socket.recv(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(format!("failed to receive: {}", e))
            }
        })?;
        // SAFETY: recv initialized `len` bytes
        let buf: &[u8] = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(ProbeError::Timeout(timeout));
        }

        if is_echo_reply(buf, reply_type, identifier, sequence) {
            return Ok(elapsed);
        }
    }
}

fn connect_socket(socket: &Socket, dest: SocketAddr, timeout: Duration) -> Result<(), ProbeError> {
    socket
        .set_read_timeout(Some(timeout))
        .and_then(|_| socket.set_write_timeout(Some(timeout)))
        .map_err(|e| ProbeError::Network(format!("failed to set timeout: {}", e)))?;
    socket
        .connect(&dest.into())
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))
}

/// RAW IPv4 sockets deliver the IP header; DGRAM and ICMPv6 sockets do not.
/// DGRAM sockets rewrite the identifier, so it is only compared on RAW replies.
fn is_echo_reply(buf: &[u8], reply_type: u8, identifier: u16, sequence: u16) -> bool {
    if buf.len() < 8 {
        return false;
    }
    let offset = if reply_type == 0 && buf[0] >> 4 == 4 {
        ((buf[0] & 0x0F) as usize) * 4
    } else {
        0
    };
    if buf.len() < offset + 8 {
        return false;
    }
    let reply_id = u16::from_be_bytes([buf[offset + 4], buf[offset + 5]]);
    let reply_seq = u16::from_be_bytes([buf[offset + 6], buf[offset + 7]]);
    let id_matches = offset == 0 || reply_id == identifier;
    buf[offset] == reply_type && id_matches && reply_seq == sequence
}

fn build_icmp_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = build_echo_payload(8, identifier, sequence);
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// The kernel fills in the ICMPv6 checksum.
fn build_icmpv6_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    build_echo_payload(128, identifier, sequence)
}

fn build_echo_payload(icmp_type: u8, identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; 64];
    packet[0] = icmp_type;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let stamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64;
    packet[8..16].copy_from_slice(&stamp.to_be_bytes());
    packet
}

/// RFC 1071 checksum.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = data
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        })
        .sum();

    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}

async fn run_ping_command(host: &str, count: u32) -> Result<PingStats, ProbeError> {
    let count_arg = count.to_string();
    // Echo spacing plus one reply deadline per echo, with slack for process start.
    let budget = (ECHO_SPACING + ECHO_TIMEOUT) * count + Duration::from_secs(2);
    let output = run_command("ping", &["-c", &count_arg, "-W", "1", "-n", host], budget).await?;

    let stdout = output.stdout;
    if stdout.trim().is_empty() {
        return Err(ProbeError::Command(format!(
            "ping produced no output: {}",
            output.stderr.trim()
        )));
    }
    Ok(parse_ping_output(&stdout, count))
}

/// Parse per-reply `time=` values and the summary loss line.
fn parse_ping_output(output: &str, count: u32) -> PingStats {
    static TIME_RE: OnceLock<Regex> = OnceLock::new();
    let time_re = TIME_RE.get_or_init(|| Regex::new(r"time[=<](?P<val>[0-9.]+)\s*ms").unwrap());

    static SENT_RE: OnceLock<Regex> = OnceLock::new();
    let sent_re =
        SENT_RE.get_or_init(|| Regex::new(r"(?P<sent>\d+)\s+packets transmitted").unwrap());

    let rtts_ms: Vec<f64> = time_re
        .captures_iter(output)
        .filter_map(|caps| caps.name("val")?.as_str().parse::<f64>().ok())
        .collect();

    let sent = sent_re
        .captures(output)
        .and_then(|caps| caps.name("sent")?.as_str().parse::<u32>().ok())
        .unwrap_or(count)
        .max(rtts_ms.len() as u32);

    PingStats { sent, rtts_ms }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_icmp_checksum_verifies() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        // A packet including its own checksum sums to zero.
        assert_eq!(icmp_checksum(&packet), 0);
    }

    #[test]
    fn test_build_icmp_packet() {
        let packet = build_icmp_echo_request(0x1234, 0x0001);
        assert_eq!(packet.len(), 64);
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);
        assert_eq!(packet[4..6], [0x12, 0x34]);
        assert_eq!(packet[6..8], [0x00, 0x01]);
    }

    #[test]
    fn test_echo_reply_matching() {
        let mut reply = vec![0u8; 8];
        reply[4..6].copy_from_slice(&7u16.to_be_bytes());
        reply[6..8].copy_from_slice(&3u16.to_be_bytes());
        assert!(is_echo_reply(&reply, 0, 7, 3));
        assert!(!is_echo_reply(&reply, 0, 7, 4));

        let mut with_ip_header = vec![0u8; 20];
        with_ip_header[0] = 0x45;
        with_ip_header.extend_from_slice(&reply);
        assert!(is_echo_reply(&with_ip_header, 0, 7, 3));
        assert!(!is_echo_reply(&with_ip_header, 0, 8, 3));
    }

    #[test]
    fn test_stats() {
        let stats = PingStats {
            sent: 5,
            rtts_ms: vec![10.0, 12.0, 11.0, 15.0],
        };
        assert_eq!(stats.loss_pct(), 20.0);
        assert_eq!(stats.avg_ms(), Some(12.0));
        // |2| + |1| + |4| over three deltas
        let jitter = stats.jitter_ms().unwrap();
        assert!((jitter - 7.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_all_lost_is_failure() {
        let stats = PingStats {
            sent: 10,
            rtts_ms: vec![],
        };
        let m = stats.into_measurement(Duration::from_secs(10));
        assert!(!m.success);
        assert_eq!(m.packet_loss_pct, Some(100.0));
        assert_eq!(m.latency_ms, None);
    }

    #[test]
    fn test_parse_ping_output_linux() {
        let output = r#"PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=12.3 ms
64 bytes from 8.8.8.8: icmp_seq=2 ttl=117 time=14.3 ms
64 bytes from 8.8.8.8: icmp_seq=4 ttl=117 time=13.3 ms

--- 8.8.8.8 ping statistics ---
4 packets transmitted, 3 received, 25% packet loss, time 3004ms
rtt min/avg/max/mdev = 12.300/13.300/14.300/0.816 ms"#;
        let stats = parse_ping_output(output, 10);
        assert_eq!(stats.sent, 4);
        assert_eq!(stats.rtts_ms, vec![12.3, 14.3, 13.3]);
        assert_eq!(stats.loss_pct(), 25.0);
    }

    #[test]
    fn test_parse_ping_output_macos() {
        let output = r#"PING google.com (142.250.69.174): 56 data bytes
64 bytes from 142.250.69.174: icmp_seq=0 ttl=116 time=17.906 ms

--- google.com ping statistics ---
2 packets transmitted, 1 packets received, 50.0% packet loss
round-trip min/avg/max/stddev = 17.906/17.906/17.906/0.000 ms"#;
        let stats = parse_ping_output(output, 2);
        assert_eq!(stats.sent, 2);
        assert_eq!(stats.rtts_ms, vec![17.906]);
    }
}
