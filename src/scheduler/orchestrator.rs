//! Cycle-processing state machine.
//!
//! The orchestrator owns every piece of cross-cycle state: the two latency
//! histories, the consecutive-failure streak and the [`SystemState`]. One
//! batch is folded in at a time; nothing is published until the new state
//! has been built in full.

use chrono::Utc;
use std::sync::Arc;

use super::state::{CycleMetrics, Status, SystemState};
use crate::diagnosis::{
    DiagnosticEngine, Diagnosis, FaultCode, HealthCheckBatch, LatencyHistory, RouterHealthScore,
};
use crate::probe::BandwidthResult;
use crate::publish::{EventSeverity, FaultEvent, Publisher};

/// Outcome of one processed batch.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// No diagnostic layer matched.
    pub healthy: bool,
    pub streak: u32,
    /// Set when the engine ran this cycle.
    pub diagnosis: Option<Diagnosis>,
    /// Events logged this cycle; at most one.
    pub events: Vec<FaultEvent>,
}

impl CycleReport {
    /// Code of a fault raised this cycle, if any.
    pub fn raised(&self) -> Option<FaultCode> {
        self.diagnosis
            .as_ref()
            .map(|d| d.code)
            .filter(|code| code.is_active())
    }
}

pub struct Orchestrator {
    engine: DiagnosticEngine,
    confirmation_threshold: u32,
    connection: LatencyHistory,
    router: LatencyHistory,
    streak: u32,
    state: SystemState,
    publisher: Arc<dyn Publisher>,
}

impl Orchestrator {
    pub fn new(
        engine: DiagnosticEngine,
        confirmation_threshold: u32,
        history_capacity: usize,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        Self {
            engine,
            confirmation_threshold: confirmation_threshold.max(1),
            connection: LatencyHistory::new(history_capacity),
            router: LatencyHistory::new(history_capacity),
            streak: 0,
            state: SystemState::default(),
            publisher,
        }
    }

    pub fn state(&self) -> &SystemState {
        &self.state
    }

    /// Fold one batch into the orchestrator's state and publish the result.
    pub fn process_batch(&mut self, mut batch: HealthCheckBatch) -> CycleReport {
        if let Some(ms) = batch.http_latency_ms() {
            self.connection.push(ms);
        }
        if let Some(ms) = batch.router_latency_ms() {
            self.router.push(ms);
        }
        batch.jitter_ms = self.connection.jitter();

        let score = RouterHealthScore::from_samples(&batch.router);
        let previous = self.state.fault_code;
        let finding = self.engine.classify(&batch);
        let healthy = finding.is_none();

        let mut diagnosis = None;
        if healthy {
            self.streak = 0;
            if previous.is_active() || previous == FaultCode::Transient {
                // TRANSIENT after an active fault, NONE after TRANSIENT.
                diagnosis = Some(self.engine.diagnose(&batch, previous));
            }
            tracing::info!(
                "Orchestrator: Health check passed. Router score {:.1}, jitter {:.2} ms",
                score.total,
                batch.jitter_ms
            );
        } else {
            self.streak = self.streak.saturating_add(1);
            tracing::warn!(
                "Orchestrator: Health check failed. Consecutive: {}",
                self.streak
            );
            if !previous.is_active() && self.streak >= self.confirmation_threshold {
                self.publish_state("status", Status::Diagnosing.as_str());
                let mut confirmed = self.engine.diagnose(&batch, previous);
                let failed = failed_targets(confirmed.code, &batch);
                if !failed.is_empty() {
                    tracing::warn!("Orchestrator: Failed targets: {}", failed.join(", "));
                    confirmed.detail = format!("{}; failed: {}", confirmed.detail, failed.join(", "));
                }
                diagnosis = Some(confirmed);
            }
        }

        let (fault_code, fault_detail) = match &diagnosis {
            Some(d) => (d.code, d.detail.clone()),
            None => (previous, self.state.fault_detail.clone()),
        };

        self.state = SystemState {
            status: Status::for_fault(fault_code),
            fault_code,
            fault_detail,
            consecutive_failures: self.streak,
            last_check: Some(batch.started_at),
            metrics: CycleMetrics {
                router_latency_ms: batch.router_latency_ms(),
                router_jitter_ms: self.router.jitter(),
                router_score: Some(score),
                dns_latency_ms: batch.dns_latency_ms(),
                dns: batch.dns_counts(),
                http_latency_ms: batch.http_latency_ms(),
                http: batch.http_counts(),
                jitter_ms: batch.jitter_ms,
            },
            bandwidth: self.state.bandwidth.take(),
        };

        for (key, value) in self.state.entries() {
            self.publish_state(key, &value);
        }

        let mut events = Vec::new();
        if let Some(d) = diagnosis.as_ref().filter(|d| d.code != previous) {
            if d.code != FaultCode::None {
                events.push(self.raise(d));
            }
        }

        CycleReport {
            healthy,
            streak: self.streak,
            diagnosis,
            events,
        }
    }

    /// Record a bandwidth measurement. Never touches fault attribution.
    pub fn apply_bandwidth(&mut self, result: BandwidthResult) {
        tracing::info!(
            "Orchestrator: Bandwidth {:.2} Mbps down, {} up",
            result.download_mbps,
            result
                .upload_mbps
                .map(|u| format!("{:.2} Mbps", u))
                .unwrap_or_else(|| "n/a".to_string())
        );
        self.state.bandwidth = Some(result);
        for (key, value) in self.state.bandwidth_entries() {
            self.publish_state(key, &value);
        }
    }

    /// Publish an arbitrary key, e.g. a traceroute tail.
    pub fn publish_state(&self, key: &str, value: &str) {
        if let Err(e) = self.publisher.update_state(key, value) {
            tracing::warn!("Orchestrator: Failed to publish {}: {}", key, e);
        }
    }

    /// Log the event for a code change. Severity-level logging happens in the publishers.
    fn raise(&self, diagnosis: &Diagnosis) -> FaultEvent {
        let event = FaultEvent::from_diagnosis(diagnosis, Utc::now());
        if let Err(e) = self.publisher.log_event(&event) {
            tracing::warn!("Orchestrator: Failed to log event {}: {}", event.code, e);
        }
        if event.severity == EventSeverity::Critical {
            let summary = format!("{}: {}", event.event_type.as_str(), event.details);
            self.publish_state("last_outage", &summary);
        }
        event
    }
}

/// Names of the failed DNS lookups and HTTP endpoints behind a fault, if it concerns them.
fn failed_targets(code: FaultCode, batch: &HealthCheckBatch) -> Vec<String> {
    match code {
        FaultCode::IspDns | FaultCode::DegradedDns => HealthCheckBatch::failures(&batch.dns),
        FaultCode::DegradedInternet => HealthCheckBatch::failures(&batch.http),
        FaultCode::IspRouting => {
            let mut failed = HealthCheckBatch::failures(&batch.dns);
            failed.extend(HealthCheckBatch::failures(&batch.http));
            failed
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnosis::fixtures::*;
    use crate::probe::{BandwidthSource, TargetKind};
    use crate::publish::recording::RecordingPublisher;

    fn orchestrator(publisher: Arc<RecordingPublisher>) -> Orchestrator {
        Orchestrator::new(DiagnosticEngine::default(), 3, 10, publisher)
    }

    fn router_down() -> HealthCheckBatch {
        let mut batch = healthy_batch();
        batch.router = router_samples(&[None; 5]);
        batch
    }

    #[test]
    fn test_debounce_requires_threshold() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut orch = orchestrator(publisher.clone());

        let report = orch.process_batch(router_down());
        assert!(!report.healthy);
        assert!(report.diagnosis.is_none());
        assert_eq!(orch.state().fault_code, FaultCode::None);

        orch.process_batch(router_down());
        assert_eq!(orch.state().fault_code, FaultCode::None);
        assert_eq!(orch.state().consecutive_failures, 2);
        assert!(publisher.event_codes().is_empty());

        let report = orch.process_batch(router_down());
        assert_eq!(report.raised(), Some(FaultCode::RouterDown));
        assert_eq!(orch.state().fault_code, FaultCode::RouterDown);
        assert_eq!(orch.state().status, Status::Outage);
        assert_eq!(publisher.event_codes(), vec![FaultCode::RouterDown]);
        assert_eq!(publisher.values("status"), vec![
            "HEALTHY", "HEALTHY", "DIAGNOSING", "OUTAGE"
        ]);
        assert!(publisher
            .value("last_outage")
            .unwrap()
            .starts_with("OUTAGE: router unreachable"));
    }

    #[test]
    fn test_streak_resets_on_healthy_cycle() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut orch = orchestrator(publisher.clone());

        orch.process_batch(router_down());
        orch.process_batch(router_down());
        let report = orch.process_batch(healthy_batch());
        assert!(report.healthy);
        assert_eq!(orch.state().consecutive_failures, 0);

        orch.process_batch(router_down());
        orch.process_batch(router_down());
        assert_eq!(orch.state().fault_code, FaultCode::None);
        assert!(publisher.event_codes().is_empty());
        assert_eq!(publisher.value("consecutive_failures").as_deref(), Some("2"));
    }

    #[test]
    fn test_active_fault_is_not_rediagnosed() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut orch = orchestrator(publisher.clone());

        for _ in 0..3 {
            orch.process_batch(router_down());
        }
        // A different failure while the fault is active only updates metrics.
        let report = orch.process_batch(batch_with(2, 4, 4, 4));
        assert!(report.diagnosis.is_none());
        assert_eq!(orch.state().fault_code, FaultCode::RouterDown);
        assert_eq!(orch.state().consecutive_failures, 4);
        assert_eq!(publisher.event_codes(), vec![FaultCode::RouterDown]);
    }

    #[test]
    fn test_transient_exactly_once_then_none() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut orch = orchestrator(publisher.clone());

        for _ in 0..3 {
            orch.process_batch(batch_with(2, 4, 4, 4));
        }
        assert_eq!(orch.state().fault_code, FaultCode::DegradedDns);
        assert_eq!(orch.state().status, Status::Degraded);

        let report = orch.process_batch(healthy_batch());
        assert_eq!(orch.state().fault_code, FaultCode::Transient);
        assert_eq!(orch.state().status, Status::Healthy);
        assert_eq!(report.events.len(), 1);
        assert_eq!(report.raised(), None);

        let report = orch.process_batch(healthy_batch());
        assert_eq!(orch.state().fault_code, FaultCode::None);
        assert!(report.events.is_empty());

        orch.process_batch(healthy_batch());
        assert_eq!(
            publisher.event_codes(),
            vec![FaultCode::DegradedDns, FaultCode::Transient]
        );
        assert_eq!(publisher.value("last_outage"), None);
    }

    #[test]
    fn test_fault_detail_names_failed_lookups() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut orch = orchestrator(publisher.clone());

        let mut batch = batch_with(2, 4, 4, 4);
        batch.dns[3] = failed(TargetKind::DnsResolver).with_query("example.com");
        for _ in 0..3 {
            orch.process_batch(batch.clone());
        }

        let detail = orch.state().fault_detail.clone();
        assert_eq!(orch.state().fault_code, FaultCode::DegradedDns);
        assert!(detail.starts_with("partial DNS failure: 2/4"));
        assert!(detail.ends_with("; failed: test (timeout), example.com@test (timeout)"));
        assert_eq!(publisher.value("fault_detail"), Some(detail.clone()));
        assert_eq!(publisher.events.lock().unwrap()[0].details, detail);
    }

    #[test]
    fn test_router_fault_detail_lists_no_targets() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut orch = orchestrator(publisher.clone());

        let mut batch = router_down();
        batch.dns = layer(TargetKind::DnsResolver, 0, 4);
        for _ in 0..3 {
            orch.process_batch(batch.clone());
        }
        assert_eq!(orch.state().fault_code, FaultCode::RouterDown);
        assert!(!orch.state().fault_detail.contains("failed:"));
    }

    #[test]
    fn test_publisher_failures_do_not_alter_state() {
        let publisher = Arc::new(RecordingPublisher::failing());
        let mut orch = orchestrator(publisher.clone());

        for _ in 0..3 {
            orch.process_batch(router_down());
        }
        assert_eq!(orch.state().fault_code, FaultCode::RouterDown);
        // Attempted exactly once despite the failure.
        assert_eq!(publisher.event_codes(), vec![FaultCode::RouterDown]);

        orch.process_batch(healthy_batch());
        assert_eq!(orch.state().fault_code, FaultCode::Transient);
        assert_eq!(orch.state().consecutive_failures, 0);
    }

    #[test]
    fn test_jitter_feeds_quality_layer() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut orch = orchestrator(publisher.clone());

        // HTTP means alternate between 20 ms and 220 ms.
        let mut report = None;
        for i in 0..6 {
            let mut batch = healthy_batch();
            let ms = if i % 2 == 0 { 20.0 } else { 220.0 };
            batch.http = vec![ok(TargetKind::HttpEndpoint, ms); 4];
            report = Some(orch.process_batch(batch));
        }
        let report = report.unwrap();
        assert!(!report.healthy);
        assert_eq!(orch.state().fault_code, FaultCode::DegradedQuality);
        assert!(orch.state().metrics.jitter_ms > 50.0);
    }

    #[test]
    fn test_bandwidth_never_affects_faults() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut orch = orchestrator(publisher.clone());

        orch.apply_bandwidth(BandwidthResult {
            measured_at: Utc::now(),
            download_mbps: 0.5,
            upload_mbps: None,
            latency_ms: Some(900.0),
            source: BandwidthSource::Http,
        });
        assert_eq!(publisher.value("download_speed").as_deref(), Some("0.50"));
        assert_eq!(publisher.value("upload_speed").as_deref(), Some("unavailable"));
        assert_eq!(orch.state().fault_code, FaultCode::None);
        assert_eq!(orch.state().consecutive_failures, 0);

        // Carried forward into later rebuilds.
        orch.process_batch(healthy_batch());
        assert!(orch.state().bandwidth.is_some());
        assert!(publisher.event_codes().is_empty());
    }

    #[test]
    fn test_metrics_published_every_cycle() {
        let publisher = Arc::new(RecordingPublisher::default());
        let mut orch = orchestrator(publisher.clone());

        orch.process_batch(batch_with(3, 4, 4, 4));
        assert_eq!(publisher.value("dns_success_rate").as_deref(), Some("3/4"));
        assert_eq!(publisher.value("http_success_rate").as_deref(), Some("4/4"));
        assert_eq!(publisher.value("router_latency").as_deref(), Some("2.00"));
        assert_eq!(publisher.value("fault_code").as_deref(), Some("NONE"));
        assert!(publisher.value("last_check").is_some());
    }
}
