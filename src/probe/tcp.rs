//! TCP connect probe.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;

use super::result::Measurement;
use super::ProbeError;

/// Connect to `host:port` `attempts` times.
///
/// Latency is the mean connect time of the successful attempts, jitter their
/// sample standard deviation, loss the share of failed attempts.
pub async fn run_tcp_probe(
    host: &str,
    port: u16,
    attempts: u32,
    per_attempt: Duration,
) -> Result<Measurement, ProbeError> {
    let start = Instant::now();
    let addr = resolve(host, port).await?;

    let mut samples_ms = Vec::with_capacity(attempts as usize);
    for _ in 0..attempts {
        let attempt = Instant::now();
        match tokio::time::timeout(per_attempt, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                samples_ms.push(attempt.elapsed().as_secs_f64() * 1000.0);
                drop(stream);
            }
            Ok(Err(e)) => tracing::debug!("TCP connect to {} failed: {}", addr, e),
            Err(_) => tracing::debug!("TCP connect to {} timed out", addr),
        }
    }

    Ok(summarize(&samples_ms, attempts, start.elapsed()))
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, ProbeError> {
    tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ProbeError::Network(format!("DNS resolution failed for {}: {}", host, e)))?
        .next()
        .ok_or_else(|| ProbeError::Network(format!("no addresses found for {}", host)))
}

fn summarize(samples_ms: &[f64], attempts: u32, elapsed: Duration) -> Measurement {
    let attempts = attempts.max(1);
    let ok = samples_ms.len();
    let loss = (attempts as usize - ok.min(attempts as usize)) as f64 / attempts as f64 * 100.0;

    let (avg, stddev) = match ok {
        0 => (None, None),
        1 => (Some(samples_ms[0]), Some(0.0)),
        n => {
            let avg = samples_ms.iter().sum::<f64>() / n as f64;
            let var = samples_ms.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / (n - 1) as f64;
            (Some(avg), Some(var.sqrt()))
        }
    };

    Measurement {
        success: ok > 0,
        elapsed_s: Some(elapsed.as_secs_f64()),
        latency_ms: avg,
        jitter_ms: stddev,
        packet_loss_pct: Some(loss),
        error: (ok == 0).then(|| "all connection attempts failed".to_string()),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn test_summarize() {
        let m = summarize(&[10.0, 20.0], 4, Duration::from_secs(1));
        assert!(m.success);
        assert_eq!(m.latency_ms, Some(15.0));
        assert_eq!(m.packet_loss_pct, Some(50.0));
        let jitter = m.jitter_ms.unwrap();
        assert!((jitter - 50f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_summarize_all_failed() {
        let m = summarize(&[], 10, Duration::from_secs(1));
        assert!(!m.success);
        assert_eq!(m.packet_loss_pct, Some(100.0));
        assert_eq!(m.latency_ms, None);
    }

    #[tokio::test]
    async fn test_connect_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let m = run_tcp_probe("127.0.0.1", port, 3, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(m.success);
        assert_eq!(m.packet_loss_pct, Some(0.0));
    }
}
