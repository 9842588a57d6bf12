//! HTTP GET probe.

use std::time::{Duration, Instant};

use super::result::Measurement;
use super::ProbeError;

/// URL probed for `host` on port 80 (`tls == false`) or 443.
pub fn http_target(host: &str, tls: bool) -> String {
    if tls {
        format!("https://{}:443", host)
    } else {
        format!("http://{}:80", host)
    }
}

/// GET `url` and read the full body. Status 200-399 counts as up.
///
/// The client must not follow redirects so a 3xx is recorded as returned.
pub async fn run_http_probe(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<Measurement, ProbeError> {
    let start = Instant::now();

    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(timeout)
            } else {
                ProbeError::Network(e.to_string())
            }
        })?;

    let status = response.status();
    let _body = response
        .bytes()
        .await
        .map_err(|e| ProbeError::Network(e.to_string()))?;

    let elapsed = start.elapsed().as_secs_f64();
    let up = (200..400).contains(&status.as_u16());

    Ok(Measurement {
        success: up,
        elapsed_s: Some(elapsed),
        http_status: Some(status.as_u16()),
        error: (!up).then(|| format!("HTTP status {}", status)),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_target() {
        assert_eq!(http_target("google.com", false), "http://google.com:80");
        assert_eq!(http_target("google.com", true), "https://google.com:443");
    }

    #[tokio::test]
    async fn test_http_probe_invalid_url() {
        let client = reqwest::Client::new();
        let result = run_http_probe(&client, "http://256.256.256.256", Duration::from_millis(100)).await;
        assert!(result.is_err());
    }
}
