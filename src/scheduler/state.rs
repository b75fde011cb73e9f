//! Externally visible system summary.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::diagnosis::{FaultCode, LayerCount, RouterHealthScore, Severity};
use crate::probe::BandwidthResult;

/// Published status label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Healthy,
    Diagnosing,
    Degraded,
    Outage,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Healthy => "HEALTHY",
            Status::Diagnosing => "DIAGNOSING",
            Status::Degraded => "DEGRADED",
            Status::Outage => "OUTAGE",
        }
    }

    /// Status to settle on once a fault with `code` is active.
    pub fn for_fault(code: FaultCode) -> Self {
        match code.severity() {
            Severity::Outage => Status::Outage,
            Severity::Degraded => Status::Degraded,
            Severity::None => Status::Healthy,
        }
    }
}

/// Latest measurements of one cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleMetrics {
    pub router_latency_ms: Option<f64>,
    pub router_jitter_ms: f64,
    pub router_score: Option<RouterHealthScore>,
    pub dns_latency_ms: Option<f64>,
    pub dns: LayerCount,
    pub http_latency_ms: Option<f64>,
    pub http: LayerCount,
    pub jitter_ms: f64,
}

/// Summary rebuilt in full after every cycle.
#[derive(Debug, Clone, Serialize)]
pub struct SystemState {
    pub status: Status,
    pub fault_code: FaultCode,
    pub fault_detail: String,
    pub consecutive_failures: u32,
    pub last_check: Option<DateTime<Utc>>,
    pub metrics: CycleMetrics,
    pub bandwidth: Option<BandwidthResult>,
}

impl Default for SystemState {
    fn default() -> Self {
        Self {
            status: Status::Healthy,
            fault_code: FaultCode::None,
            fault_detail: String::new(),
            consecutive_failures: 0,
            last_check: None,
            metrics: CycleMetrics::default(),
            bandwidth: None,
        }
    }
}

const UNAVAILABLE: &str = "unavailable";

fn fmt_ms(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.2}", v))
        .unwrap_or_else(|| UNAVAILABLE.to_string())
}

impl SystemState {
    /// Health-cycle keys, in publish order.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let m = &self.metrics;
        vec![
            ("status", self.status.as_str().to_string()),
            ("fault_code", self.fault_code.as_str().to_string()),
            ("fault_detail", self.fault_detail.clone()),
            ("router_latency", fmt_ms(m.router_latency_ms)),
            ("router_jitter", format!("{:.2}", m.router_jitter_ms)),
            (
                "router_health_score",
                fmt_ms(m.router_score.map(|s| s.total)),
            ),
            (
                "router_packet_loss",
                fmt_ms(m.router_score.map(|s| s.packet_loss_pct())),
            ),
            ("dns_latency", fmt_ms(m.dns_latency_ms)),
            ("dns_success_rate", format!("{}/{}", m.dns.ok, m.dns.total)),
            ("http_latency", fmt_ms(m.http_latency_ms)),
            ("http_success_rate", format!("{}/{}", m.http.ok, m.http.total)),
            ("jitter", format!("{:.2}", m.jitter_ms)),
            ("consecutive_failures", self.consecutive_failures.to_string()),
            (
                "last_check",
                self.last_check
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| UNAVAILABLE.to_string()),
            ),
        ]
    }

    /// Bandwidth keys; empty until the first measurement.
    pub fn bandwidth_entries(&self) -> Vec<(&'static str, String)> {
        match &self.bandwidth {
            Some(bw) => vec![
                ("download_speed", format!("{:.2}", bw.download_mbps)),
                ("upload_speed", fmt_ms(bw.upload_mbps)),
                ("speedtest_latency", fmt_ms(bw.latency_ms)),
                ("last_speedtest", bw.measured_at.to_rfc3339()),
            ],
            None => Vec::new(),
        }
    }
}
