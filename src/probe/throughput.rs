//! Download/upload throughput probe.

use std::time::{Duration, Instant};

use tokio::task::JoinSet;

use super::result::Measurement;
use super::ProbeError;
use crate::config::{ThroughputMethod, ThroughputSettings};

/// Megabits per second for `bytes` moved in `elapsed`.
pub fn mbps(bytes: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return None;
    }
    Some(bytes as f64 * 8.0 / secs / 1_000_000.0)
}

/// Bytes and wall time of one transfer direction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Transfer {
    pub bytes: u64,
    pub elapsed: Duration,
}

impl Transfer {
    pub fn mbps(&self) -> Option<f64> {
        if self.bytes == 0 {
            return None;
        }
        mbps(self.bytes, self.elapsed)
    }
}

/// Sum the bytes of parallel streams; their wall time is the slowest stream's.
pub fn aggregate(streams: &[Transfer]) -> Transfer {
    Transfer {
        bytes: streams.iter().map(|t| t.bytes).sum(),
        elapsed: streams
            .iter()
            .map(|t| t.elapsed)
            .max()
            .unwrap_or_default(),
    }
}

pub async fn run_throughput_probe(
    client: &reqwest::Client,
    settings: &ThroughputSettings,
    timeout: Duration,
) -> Result<Measurement, ProbeError> {
    let start = Instant::now();

    let urls: Vec<String> = match settings.method {
        ThroughputMethod::Http => vec![settings.url.clone(); settings.connections.max(1)],
        ThroughputMethod::Fastcom => settings.fastcom_urls.clone(),
    };
    if urls.is_empty() {
        return Err(ProbeError::Config("no throughput download urls".into()));
    }

    let download = parallel_download(client, urls, timeout).await;
    let download_mbps = download.mbps();

    let upload_url = match settings.method {
        ThroughputMethod::Http => settings.upload_url.clone(),
        ThroughputMethod::Fastcom => settings
            .upload_url
            .clone()
            .or_else(|| Some("https://speed.cloudflare.com/__up".to_string())),
    };

    let upload_mbps = match upload_url {
        Some(url) if settings.upload_bytes > 0 => {
            match upload(client, &url, settings.upload_bytes, timeout).await {
                Ok(transfer) => transfer.mbps(),
                Err(e) => {
                    tracing::warn!("Throughput upload to {} failed: {}", url, e);
                    None
                }
            }
        }
        _ => None,
    };

    let success = download_mbps.is_some();
    Ok(Measurement {
        success,
        elapsed_s: Some(start.elapsed().as_secs_f64()),
        download_mbps,
        upload_mbps,
        error: (!success).then(|| "no bytes downloaded".to_string()),
        ..Default::default()
    })
}

async fn parallel_download(client: &reqwest::Client, urls: Vec<String>, timeout: Duration) -> Transfer {
    let mut set = JoinSet::new();
    for url in urls {
        let client = client.clone();
        set.spawn(async move {
            let result = download(&client, &url, timeout).await;
            (url, result)
        });
    }

    let mut streams = Vec::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(transfer))) => streams.push(transfer),
            Ok((url, Err(e))) => tracing::warn!("Throughput download from {} failed: {}", url, e),
            Err(e) => tracing::warn!("Throughput download task failed: {}", e),
        }
    }

    aggregate(&streams)
}

async fn download(client: &reqwest::Client, url: &str, timeout: Duration) -> Result<Transfer, ProbeError> {
    let start = Instant::now();
    let mut response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(map_reqwest(timeout))?;

    let mut bytes = 0u64;
    loop {
        match response.chunk().await {
            Ok(Some(chunk)) => bytes += chunk.len() as u64,
            Ok(None) => break,
            // Keep what arrived before the deadline
            Err(e) if e.is_timeout() && bytes > 0 => break,
            Err(e) => return Err(map_reqwest(timeout)(e)),
        }
    }

    Ok(Transfer {
        bytes,
        elapsed: start.elapsed(),
    })
}

async fn upload(
    client: &reqwest::Client,
    url: &str,
    size: usize,
    timeout: Duration,
) -> Result<Transfer, ProbeError> {
    let payload = vec![0u8; size];
    let start = Instant::now();
    client
        .post(url)
        .timeout(timeout)
        .body(payload)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(map_reqwest(timeout))?;

    Ok(Transfer {
        bytes: size as u64,
        elapsed: start.elapsed(),
    })
}

fn map_reqwest(timeout: Duration) -> impl Fn(reqwest::Error) -> ProbeError {
    move |e| {
        if e.is_timeout() {
            ProbeError::Timeout(timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    }
}
