//! Layered fault attribution.
//!
//! Layers are tried in a fixed order (router, ISP gateway, DNS, HTTP, quality)
//! and the first one whose failure condition matches the batch decides the
//! fault code. All layer counts are computed up front, before dispatch, so the
//! DNS layer can see whether HTTP also failed completely.

use std::fmt;

use serde::Serialize;

use super::models::{HealthCheckBatch, LayerCount};
use super::score::RouterHealthScore;

/// How bad a fault is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Degraded,
    Outage,
}

/// Closed vocabulary of fault attributions, published verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultCode {
    None,
    RouterDown,
    RouterCritical,
    RouterDegraded,
    IspEquipment,
    IspDns,
    IspRouting,
    DegradedDns,
    DegradedInternet,
    DegradedQuality,
    Transient,
}

impl FaultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultCode::None => "NONE",
            FaultCode::RouterDown => "ROUTER_DOWN",
            FaultCode::RouterCritical => "ROUTER_CRITICAL",
            FaultCode::RouterDegraded => "ROUTER_DEGRADED",
            FaultCode::IspEquipment => "ISP_EQUIPMENT",
            FaultCode::IspDns => "ISP_DNS",
            FaultCode::IspRouting => "ISP_ROUTING",
            FaultCode::DegradedDns => "DEGRADED_DNS",
            FaultCode::DegradedInternet => "DEGRADED_INTERNET",
            FaultCode::DegradedQuality => "DEGRADED_QUALITY",
            FaultCode::Transient => "TRANSIENT",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            FaultCode::None | FaultCode::Transient => Severity::None,
            FaultCode::RouterDown
            | FaultCode::RouterCritical
            | FaultCode::IspEquipment
            | FaultCode::IspDns
            | FaultCode::IspRouting => Severity::Outage,
            FaultCode::RouterDegraded
            | FaultCode::DegradedDns
            | FaultCode::DegradedInternet
            | FaultCode::DegradedQuality => Severity::Degraded,
        }
    }

    /// A fault that still needs clearing. TRANSIENT is the clearing itself, so it is not active.
    pub fn is_active(&self) -> bool {
        !matches!(self, FaultCode::None | FaultCode::Transient)
    }

    /// Who or what the fault is attributed to.
    pub fn responsible_party(&self) -> &'static str {
        match self {
            FaultCode::RouterDown | FaultCode::RouterCritical | FaultCode::RouterDegraded => {
                "YourRouter"
            }
            FaultCode::IspEquipment | FaultCode::IspRouting => "ISP",
            FaultCode::IspDns => "ISP_DNS",
            FaultCode::DegradedDns => "DNS",
            FaultCode::DegradedInternet => "Internet",
            FaultCode::DegradedQuality => "Quality",
            FaultCode::None | FaultCode::Transient => "Network",
        }
    }
}

impl fmt::Display for FaultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The engine's verdict for one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnosis {
    pub code: FaultCode,
    pub detail: String,
    /// Name of the layer that matched, if any.
    pub layer: Option<&'static str>,
}

impl Diagnosis {
    fn new(code: FaultCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
            layer: None,
        }
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }
}

/// Decision thresholds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineThresholds {
    /// Router score below this is ROUTER_CRITICAL.
    pub router_critical_score: f64,
    /// Router score below this is ROUTER_DEGRADED.
    pub router_degraded_score: f64,
    /// Jitter strictly above this is DEGRADED_QUALITY.
    pub jitter_degraded_ms: f64,
}

impl Default for EngineThresholds {
    fn default() -> Self {
        Self {
            router_critical_score: 30.0,
            router_degraded_score: 60.0,
            jitter_degraded_ms: 50.0,
        }
    }
}

/// Everything the layers look at, computed before any layer runs.
struct LayerInputs<'a> {
    thresholds: &'a EngineThresholds,
    router_reachable: bool,
    score: RouterHealthScore,
    /// None when no gateway is configured.
    gateway_ok: Option<bool>,
    dns: LayerCount,
    http: LayerCount,
    jitter_ms: f64,
}

type Layer = fn(&LayerInputs<'_>) -> Option<Diagnosis>;

/// Evaluation order. The first match wins.
const LAYERS: [(&str, Layer); 5] = [
    ("router", router_layer),
    ("isp_gateway", gateway_layer),
    ("dns", dns_layer),
    ("http", http_layer),
    ("quality", quality_layer),
];

fn router_layer(input: &LayerInputs<'_>) -> Option<Diagnosis> {
    if !input.router_reachable {
        return Some(Diagnosis::new(
            FaultCode::RouterDown,
            "router unreachable — check power and cabling",
        ));
    }
    let score = input.score.total;
    if score < input.thresholds.router_critical_score {
        return Some(Diagnosis::new(
            FaultCode::RouterCritical,
            format!("router health critical (score {:.1}/100)", score),
        ));
    }
    if score < input.thresholds.router_degraded_score {
        return Some(Diagnosis::new(
            FaultCode::RouterDegraded,
            format!("router health degraded (score {:.1}/100)", score),
        ));
    }
    None
}

fn gateway_layer(input: &LayerInputs<'_>) -> Option<Diagnosis> {
    match input.gateway_ok {
        Some(false) => Some(Diagnosis::new(
            FaultCode::IspEquipment,
            "ISP gateway unreachable — contact ISP",
        )),
        _ => None,
    }
}

fn dns_layer(input: &LayerInputs<'_>) -> Option<Diagnosis> {
    if input.dns.all_failed() {
        if input.http.ok == 0 {
            return Some(Diagnosis::new(
                FaultCode::IspRouting,
                "all DNS and HTTP failed — ISP routing problem",
            ));
        }
        return Some(Diagnosis::new(
            FaultCode::IspDns,
            "all DNS resolution failed — ISP DNS issue",
        ));
    }
    if input.dns.partial() {
        return Some(Diagnosis::new(
            FaultCode::DegradedDns,
            format!("partial DNS failure: {} lookups succeeded", input.dns.ratio()),
        ));
    }
    None
}

fn http_layer(input: &LayerInputs<'_>) -> Option<Diagnosis> {
    if input.http.all_failed() {
        return Some(Diagnosis::new(
            FaultCode::IspRouting,
            "all HTTP endpoints unreachable — ISP routing problem",
        ));
    }
    if input.http.partial() {
        return Some(Diagnosis::new(
            FaultCode::DegradedInternet,
            format!(
                "partial internet failure: {} endpoints reachable",
                input.http.ratio()
            ),
        ));
    }
    None
}

fn quality_layer(input: &LayerInputs<'_>) -> Option<Diagnosis> {
    if input.jitter_ms > input.thresholds.jitter_degraded_ms {
        return Some(Diagnosis::new(
            FaultCode::DegradedQuality,
            format!("high jitter ({:.2} ms) — unstable connection", input.jitter_ms),
        ));
    }
    None
}

/// Pure, total fault attribution over a batch.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticEngine {
    thresholds: EngineThresholds,
}

impl DiagnosticEngine {
    pub fn new(thresholds: EngineThresholds) -> Self {
        Self { thresholds }
    }

    /// Run the layers over `batch`. `None` means no layer matched: the batch is fully healthy.
    pub fn classify(&self, batch: &HealthCheckBatch) -> Option<Diagnosis> {
        let inputs = LayerInputs {
            thresholds: &self.thresholds,
            router_reachable: batch.router_reachable(),
            score: RouterHealthScore::from_samples(&batch.router),
            gateway_ok: batch.isp_gateway.as_ref().map(|gw| gw.is_success()),
            dns: batch.dns_counts(),
            http: batch.http_counts(),
            jitter_ms: batch.jitter_ms,
        };

        LAYERS.iter().find_map(|(name, layer)| {
            layer(&inputs).map(|mut diagnosis| {
                diagnosis.layer = Some(*name);
                diagnosis
            })
        })
    }

    /// Produce exactly one fault code for `batch`.
    ///
    /// When no layer matches, the result is TRANSIENT if `previous` was an
    /// active fault and NONE otherwise.
    pub fn diagnose(&self, batch: &HealthCheckBatch, previous: FaultCode) -> Diagnosis {
        if let Some(diagnosis) = self.classify(batch) {
            return diagnosis;
        }
        if previous.is_active() {
            Diagnosis::new(FaultCode::Transient, "previous issue resolved itself")
        } else {
            Diagnosis::new(FaultCode::None, "all checks passing")
        }
    }
}
