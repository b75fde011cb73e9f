//! Cycle-scoped diagnostic inputs.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::probe::ProbeResult;

/// Successes out of attempts for one layer of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LayerCount {
    pub ok: usize,
    pub total: usize,
}

impl LayerCount {
    pub fn from_results(results: &[ProbeResult]) -> Self {
        Self {
            ok: results.iter().filter(|r| r.is_success()).count(),
            total: results.len(),
        }
    }

    /// Configured and every attempt failed.
    pub fn all_failed(&self) -> bool {
        self.total > 0 && self.ok == 0
    }

    /// Some, but not all, attempts succeeded.
    pub fn partial(&self) -> bool {
        self.ok > 0 && self.ok < self.total
    }

    /// Rendered as "ok/total".
    pub fn ratio(&self) -> String {
        format!("{}/{}", self.ok, self.total)
    }
}

/// Every probe result collected in one health-check cycle.
///
/// Failed probes are present as failed results, never omitted.
#[derive(Debug, Clone)]
pub struct HealthCheckBatch {
    pub started_at: DateTime<Utc>,
    /// N router pings, in the order they were sent.
    pub router: Vec<ProbeResult>,
    /// None when no ISP gateway is configured.
    pub isp_gateway: Option<ProbeResult>,
    /// One per resolver x domain pair.
    pub dns: Vec<ProbeResult>,
    /// One per endpoint.
    pub http: Vec<ProbeResult>,
    /// Connection jitter at the time of the batch, filled in by the orchestrator.
    pub jitter_ms: f64,
}

impl HealthCheckBatch {
    pub fn new(
        started_at: DateTime<Utc>,
        router: Vec<ProbeResult>,
        isp_gateway: Option<ProbeResult>,
        dns: Vec<ProbeResult>,
        http: Vec<ProbeResult>,
    ) -> Self {
        Self {
            started_at,
            router,
            isp_gateway,
            dns,
            http,
            jitter_ms: 0.0,
        }
    }

    /// At least one router ping came back.
    pub fn router_reachable(&self) -> bool {
        self.router.iter().any(|r| r.is_success())
    }

    pub fn dns_counts(&self) -> LayerCount {
        LayerCount::from_results(&self.dns)
    }

    pub fn http_counts(&self) -> LayerCount {
        LayerCount::from_results(&self.http)
    }

    pub fn router_latency_ms(&self) -> Option<f64> {
        mean_latency_ms(&self.router)
    }

    pub fn dns_latency_ms(&self) -> Option<f64> {
        mean_latency_ms(&self.dns)
    }

    /// Mean HTTP latency; the general connection latency sample for the cycle.
    pub fn http_latency_ms(&self) -> Option<f64> {
        mean_latency_ms(&self.http)
    }

    /// Names of the targets that failed in a layer, with the failure reason.
    pub fn failures(results: &[ProbeResult]) -> Vec<String> {
        results
            .iter()
            .filter_map(|r| {
                let reason = r.failure?;
                let name = match &r.query {
                    Some(q) => format!("{}@{}", q, r.target.name()),
                    None => r.target.name().to_string(),
                };
                Some(format!("{} ({})", name, reason.as_str()))
            })
            .collect()
    }
}

/// Mean latency over the successful results, if any.
pub fn mean_latency_ms(results: &[ProbeResult]) -> Option<f64> {
    let latencies: Vec<f64> = results.iter().filter_map(|r| r.latency_ms()).collect();
    if latencies.is_empty() {
        return None;
    }
    Some(latencies.iter().sum::<f64>() / latencies.len() as f64)
}
