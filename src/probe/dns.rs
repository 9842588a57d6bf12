//! DNS probe using a raw UDP A query.

use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use super::result::Measurement;
use super::ProbeError;

/// Resolve `domain` against `server` and report the query latency.
///
/// The recorded `ip_address` is the server that was asked.
pub async fn run_dns_probe(
    server: &str,
    domain: &str,
    timeout: Duration,
) -> Result<Measurement, ProbeError> {
    let target_addr = server_socket_addr(server);

    let packet = build_dns_query(domain)?;
    let tx_id = u16::from_be_bytes([packet[0], packet[1]]);

    let bind_addr = if target_addr.starts_with('[') {
        "[::]:0"
    } else {
        "0.0.0.0:0"
    };
    let socket = UdpSocket::bind(bind_addr)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to bind socket: {}", e)))?;
    socket
        .connect(&target_addr)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to connect: {}", e)))?;

    let start = Instant::now();

    socket
        .send(&packet)
        .await
        .map_err(|e| ProbeError::Network(format!("failed to send: {}", e)))?;

    let mut response = [0u8; 512];
    let n = tokio::time::timeout(timeout, socket.recv(&mut response))
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
        .map_err(|e| ProbeError::Network(format!("failed to recv: {}", e)))?;

    let elapsed = start.elapsed();

    validate_response(&response[..n], tx_id)?;

    let mut measurement = Measurement::ok(elapsed.as_secs_f64());
    measurement.ip_address = Some(server.to_string());
    Ok(measurement)
}

fn server_socket_addr(server: &str) -> String {
    if server.starts_with('[') {
        return server.to_string();
    }
    match server.matches(':').count() {
        0 => format!("{}:53", server),
        1 => server.to_string(),
        _ => format!("[{}]:53", server),
    }
}

fn validate_response(response: &[u8], tx_id: u16) -> Result<(), ProbeError> {
    if response.len() < 12 {
        return Err(ProbeError::Network(format!(
            "response too short: {} bytes",
            response.len()
        )));
    }

    let resp_tx_id = u16::from_be_bytes([response[0], response[1]]);
    if resp_tx_id != tx_id {
        return Err(ProbeError::Network(format!(
            "transaction ID mismatch: got {}, expected {}",
            resp_tx_id, tx_id
        )));
    }

    // RCODE is the low nibble of byte 3
    let rcode = response[3] & 0x0F;
    if rcode != 0 {
        return Err(ProbeError::Network(format!("DNS error RCODE: {}", rcode)));
    }

    Ok(())
}

/// Build a recursive A/IN query for `domain`.
fn build_dns_query(domain: &str) -> Result<Vec<u8>, ProbeError> {
    let tx_id: u16 = rand::random();
    let flags: u16 = 0x0100;

    let mut packet = Vec::with_capacity(32 + domain.len());
    packet.extend_from_slice(&tx_id.to_be_bytes());
    packet.extend_from_slice(&flags.to_be_bytes());
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0u8; 6]); // ANCOUNT, NSCOUNT, ARCOUNT

    for label in domain.trim_end_matches('.').split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(ProbeError::Config(format!("invalid DNS name: {}", domain)));
        }
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);

    packet.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN

    Ok(packet)
}

/// Nameservers listed in a resolv.conf document, at most two.
pub fn parse_resolv_conf(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            match (parts.next(), parts.next()) {
                (Some("nameserver"), Some(addr)) => Some(addr.to_string()),
                _ => None,
            }
        })
        .take(2)
        .collect()
}
