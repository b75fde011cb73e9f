//! Probe module for network health checks.
//!
//! Supports ICMP ping, DNS and HTTP probes, plus the slower bandwidth and
//! traceroute measurements used outside the regular health cycle.

mod bandwidth;
mod batch;
mod dns;
mod http;
mod ping;
mod traceroute;

pub use bandwidth::*;
pub use batch::*;
pub use dns::*;
pub use http::*;
pub use ping::*;
pub use traceroute::*;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Extra time granted on top of a probe's own timeout before the outer guard fires.
pub const TIMEOUT_GRACE: Duration = Duration::from_millis(500);

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("target unreachable: {0}")]
    Unreachable(String),
    #[error("resolution failed: {0}")]
    Resolution(String),
    #[error("transport error: {0}")]
    Transport(String),
}

impl ProbeError {
    /// Collapse the error into the reason recorded on a failed result.
    pub fn reason(&self) -> FailureReason {
        match self {
            ProbeError::Timeout(_) => FailureReason::Timeout,
            ProbeError::Unreachable(_) => FailureReason::Unreachable,
            ProbeError::Resolution(_) => FailureReason::ResolutionError,
            ProbeError::Transport(_) => FailureReason::TransportError,
        }
    }
}

/// Why a probe did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    Unreachable,
    ResolutionError,
    TransportError,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::Unreachable => "unreachable",
            FailureReason::ResolutionError => "resolution-error",
            FailureReason::TransportError => "transport-error",
        }
    }
}

/// What kind of thing a target is, which also selects the probe used on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Router,
    IspGateway,
    DnsResolver,
    HttpEndpoint,
}

/// A configured thing to check. Built once from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub kind: TargetKind,
    pub address: String,
    pub label: Option<String>,
}

impl ProbeTarget {
    pub fn new(kind: TargetKind, address: impl Into<String>) -> Self {
        Self {
            kind,
            address: address.into(),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Label if one was given, otherwise the address.
    pub fn name(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.address)
    }
}

/// Outcome of a single probe execution.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub target: Arc<ProbeTarget>,
    /// Domain looked up, for DNS probes.
    pub query: Option<String>,
    /// Present only on success.
    pub latency: Option<Duration>,
    /// Present only on failure.
    pub failure: Option<FailureReason>,
    pub timestamp: DateTime<Utc>,
}

impl ProbeResult {
    pub fn success(target: Arc<ProbeTarget>, latency: Duration) -> Self {
        Self {
            target,
            query: None,
            latency: Some(latency),
            failure: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(target: Arc<ProbeTarget>, reason: FailureReason) -> Self {
        Self {
            target,
            query: None,
            latency: None,
            failure: Some(reason),
            timestamp: Utc::now(),
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.latency.is_some()
    }

    pub fn latency_ms(&self) -> Option<f64> {
        self.latency.map(|d| d.as_secs_f64() * 1000.0)
    }
}

/// Per-kind probe timeouts.
#[derive(Debug, Clone, Copy)]
pub struct ProbeTimeouts {
    pub ping: Duration,
    pub dns: Duration,
    pub http: Duration,
}

impl ProbeTimeouts {
    pub fn for_kind(&self, kind: TargetKind) -> Duration {
        match kind {
            TargetKind::Router | TargetKind::IspGateway => self.ping,
            TargetKind::DnsResolver => self.dns,
            TargetKind::HttpEndpoint => self.http,
        }
    }
}

/// Run one probe against `target` and fold any error into a failed result.
///
/// DNS targets need the domain to look up in `query`.
pub async fn run_probe(
    target: Arc<ProbeTarget>,
    query: Option<String>,
    timeouts: ProbeTimeouts,
    client: &reqwest::Client,
) -> ProbeResult {
    let timeout = timeouts.for_kind(target.kind);

    let result = match (target.kind, query.as_deref()) {
        (TargetKind::Router | TargetKind::IspGateway, _) => {
            execute(timeout, run_ping_probe(&target.address, timeout)).await
        }
        (TargetKind::DnsResolver, Some(domain)) => {
            execute(timeout, run_dns_probe(&target.address, domain, timeout)).await
        }
        (TargetKind::DnsResolver, None) => Err(ProbeError::Resolution(
            "no domain given for DNS probe".to_string(),
        )),
        (TargetKind::HttpEndpoint, _) => {
            execute(timeout, run_http_probe(client, &target.address, timeout)).await
        }
    };

    let probe_result = match result {
        Ok(latency) => ProbeResult::success(target, latency),
        Err(e) => {
            tracing::debug!("Probe failed for {}: {}", target.name(), e);
            ProbeResult::failure(target, e.reason())
        }
    };

    match query {
        Some(q) => probe_result.with_query(q),
        None => probe_result,
    }
}

/// Bound a probe future by its timeout, whatever the probe itself does.
async fn execute<F>(timeout: Duration, probe: F) -> Result<Duration, ProbeError>
where
    F: Future<Output = Result<Duration, ProbeError>>,
{
    let latency = tokio::time::timeout(timeout + TIMEOUT_GRACE, probe)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))??;

    if latency >= timeout {
        return Err(ProbeError::Timeout(timeout));
    }

    Ok(latency)
}
