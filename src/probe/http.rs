//! HTTP probe implementation.

use std::time::{Duration, Instant};

use super::ProbeError;

/// Prefix bare host names with `http://`.
pub fn normalize_url(address: &str) -> String {
    if address.starts_with("http://") || address.starts_with("https://") {
        address.to_string()
    } else {
        format!("http://{}", address)
    }
}

/// Run an HTTP GET against `address` and return the time to read the full body.
///
/// Only 2xx responses count as success.
pub async fn run_http_probe(
    client: &reqwest::Client,
    address: &str,
    timeout: Duration,
) -> Result<Duration, ProbeError> {
    let url = normalize_url(address);
    let start = Instant::now();

    let response = client
        .get(&url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| classify_reqwest_error(e, timeout))?;

    let status = response.status();

    // Read the full body to measure complete transfer time
    response
        .bytes()
        .await
        .map_err(|e| classify_reqwest_error(e, timeout))?;

    if !status.is_success() {
        return Err(ProbeError::Transport(format!("{} returned {}", url, status)));
    }

    Ok(start.elapsed())
}

pub(crate) fn classify_reqwest_error(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(timeout)
    } else if e.is_connect() {
        ProbeError::Unreachable(e.to_string())
    } else if e.is_builder() {
        ProbeError::Resolution(e.to_string())
    } else {
        ProbeError::Transport(e.to_string())
    }
}
