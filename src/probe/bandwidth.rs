//! Bandwidth measurement.
//!
//! Streams a download from an HTTP speed-test endpoint and optionally posts an
//! upload payload. Falls back to `speedtest-cli --simple` when the HTTP test fails.

use std::process::Stdio;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tokio::process::Command;

use super::http::classify_reqwest_error;
use super::ProbeError;

/// Where a bandwidth figure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BandwidthSource {
    Http,
    SpeedtestCli,
}

/// One bandwidth measurement.
#[derive(Debug, Clone, Serialize)]
pub struct BandwidthResult {
    pub measured_at: DateTime<Utc>,
    pub download_mbps: f64,
    pub upload_mbps: Option<f64>,
    pub latency_ms: Option<f64>,
    pub source: BandwidthSource,
}

/// Bandwidth test settings.
#[derive(Debug, Clone)]
pub struct BandwidthSettings {
    pub download_url: String,
    pub upload_url: Option<String>,
    pub upload_bytes: usize,
    pub timeout: Duration,
    pub speedtest_cli_fallback: bool,
}

/// Run a bandwidth test, trying the HTTP endpoints first.
pub async fn run_bandwidth_test(
    client: &reqwest::Client,
    settings: &BandwidthSettings,
) -> Result<BandwidthResult, ProbeError> {
    match run_http_bandwidth(client, settings).await {
        Ok(result) => Ok(result),
        Err(e) if settings.speedtest_cli_fallback => {
            tracing::warn!("HTTP bandwidth test failed ({}), trying speedtest-cli", e);
            run_speedtest_cli(settings.timeout).await
        }
        Err(e) => Err(e),
    }
}

async fn run_http_bandwidth(
    client: &reqwest::Client,
    settings: &BandwidthSettings,
) -> Result<BandwidthResult, ProbeError> {
    let timeout = settings.timeout;
    let start = Instant::now();

    let mut response = client
        .get(&settings.download_url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| classify_reqwest_error(e, timeout))?;
    let first_response = start.elapsed();

    if !response.status().is_success() {
        return Err(ProbeError::Transport(format!(
            "download returned {}",
            response.status()
        )));
    }

    let body_start = Instant::now();
    let mut bytes: u64 = 0;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| classify_reqwest_error(e, timeout))?
    {
        bytes += chunk.len() as u64;
    }
    let download_mbps = throughput_mbps(bytes, body_start.elapsed());

    let upload_mbps = match &settings.upload_url {
        Some(url) => match run_http_upload(client, url, settings.upload_bytes, timeout).await {
            Ok(mbps) => Some(mbps),
            Err(e) => {
                tracing::warn!("Upload test failed: {}", e);
                None
            }
        },
        None => None,
    };

    Ok(BandwidthResult {
        measured_at: Utc::now(),
        download_mbps,
        upload_mbps,
        latency_ms: Some(round2(first_response.as_secs_f64() * 1000.0)),
        source: BandwidthSource::Http,
    })
}

async fn run_http_upload(
    client: &reqwest::Client,
    url: &str,
    size: usize,
    timeout: Duration,
) -> Result<f64, ProbeError> {
    let payload = vec![0u8; size];
    let start = Instant::now();

    let response = client
        .post(url)
        .timeout(timeout)
        .body(payload)
        .send()
        .await
        .map_err(|e| classify_reqwest_error(e, timeout))?;

    if !response.status().is_success() {
        return Err(ProbeError::Transport(format!(
            "upload returned {}",
            response.status()
        )));
    }

    Ok(throughput_mbps(size as u64, start.elapsed()))
}

async fn run_speedtest_cli(timeout: Duration) -> Result<BandwidthResult, ProbeError> {
    let output = tokio::time::timeout(
        timeout,
        Command::new("speedtest-cli")
            .arg("--simple")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| ProbeError::Timeout(timeout))?
    .map_err(|e| ProbeError::Transport(format!("failed to execute speedtest-cli: {}", e)))?;

    if !output.status.success() {
        return Err(ProbeError::Transport(format!(
            "speedtest-cli failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    parse_speedtest_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `speedtest-cli --simple` output:
///
/// ```text
/// Ping: 12.345 ms
/// Download: 93.12 Mbit/s
/// Upload: 11.80 Mbit/s
/// ```
fn parse_speedtest_output(output: &str) -> Result<BandwidthResult, ProbeError> {
    static LINE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = LINE
        .get_or_init(|| Regex::new(r"(?m)^(Ping|Download|Upload):\s*([0-9.]+)").ok())
        .as_ref()
        .ok_or_else(|| ProbeError::Transport("invalid speedtest pattern".to_string()))?;

    let mut ping = None;
    let mut download = None;
    let mut upload = None;
    for caps in re.captures_iter(output) {
        let value = caps[2].parse::<f64>().ok();
        match &caps[1] {
            "Ping" => ping = value,
            "Download" => download = value,
            "Upload" => upload = value,
            _ => {}
        }
    }

    let download_mbps = download.ok_or_else(|| {
        ProbeError::Transport(format!("failed to parse speedtest output: {}", output))
    })?;

    Ok(BandwidthResult {
        measured_at: Utc::now(),
        download_mbps,
        upload_mbps: upload,
        latency_ms: ping,
        source: BandwidthSource::SpeedtestCli,
    })
}

fn throughput_mbps(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return 0.0;
    }
    round2(bytes as f64 * 8.0 / secs / 1_000_000.0)
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_speedtest_output() {
        let output = "Ping: 12.345 ms\nDownload: 93.12 Mbit/s\nUpload: 11.80 Mbit/s\n";
        let result = parse_speedtest_output(output).unwrap();
        assert_eq!(result.download_mbps, 93.12);
        assert_eq!(result.upload_mbps, Some(11.80));
        assert_eq!(result.latency_ms, Some(12.345));
        assert_eq!(result.source, BandwidthSource::SpeedtestCli);
    }

    #[test]
    fn test_parse_speedtest_output_without_download() {
        assert!(parse_speedtest_output("Cannot retrieve speedtest configuration").is_err());
    }

    #[test]
    fn test_throughput_mbps() {
        // 12.5 MB in one second is 100 Mbit/s
        assert_eq!(throughput_mbps(12_500_000, Duration::from_secs(1)), 100.0);
        assert_eq!(throughput_mbps(1_000, Duration::ZERO), 0.0);
    }
}
