//! Scheduler module: drives health-check cycles and bandwidth tests.

mod orchestrator;
mod state;

pub use orchestrator::Orchestrator;

use crate::config::SentinelConfig;
use crate::diagnosis::{DiagnosticEngine, FaultCode};
use crate::probe::{
    run_traceroute, targets, BandwidthResult, NetworkProber, ProbeError, ProbeTarget, TargetKind,
};
use crate::publish::Publisher;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Instant, MissedTickBehavior};

/// Trace destination for routing faults beyond the ISP gateway.
const ROUTING_TRACE_TARGET: &str = "8.8.8.8";
const TRACEROUTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs the health-check timer and the slower bandwidth timer.
pub struct Scheduler {
    prober: Arc<NetworkProber>,
    orchestrator: Orchestrator,
    publisher: Arc<dyn Publisher>,
    interval: Duration,
    bandwidth_interval: Duration,
    traceroute_on_fault: bool,
}

impl Scheduler {
    pub fn new(
        prober: NetworkProber,
        orchestrator: Orchestrator,
        publisher: Arc<dyn Publisher>,
        interval: Duration,
        bandwidth_interval: Duration,
    ) -> Self {
        Self {
            prober: Arc::new(prober),
            orchestrator,
            publisher,
            interval,
            bandwidth_interval,
            traceroute_on_fault: false,
        }
    }

    pub fn with_traceroute(mut self, enabled: bool) -> Self {
        self.traceroute_on_fault = enabled;
        self
    }

    /// Build the prober and orchestrator from configuration.
    pub fn from_config(
        cfg: &SentinelConfig,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("netsentinel/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let t = &cfg.targets;
        let mut prober = NetworkProber::new(
            ProbeTarget::new(TargetKind::Router, t.router.clone()).with_label("router"),
            cfg.isp_gateway()
                .map(|gw| ProbeTarget::new(TargetKind::IspGateway, gw).with_label("isp_gateway")),
            targets(TargetKind::DnsResolver, &t.dns_resolvers),
            t.dns_domains.clone(),
            targets(TargetKind::HttpEndpoint, &t.http_endpoints),
            cfg.monitoring.router_sample_count,
            cfg.timeouts(),
            client,
        );
        if let Some(settings) = cfg.bandwidth_settings() {
            prober = prober.with_bandwidth(settings);
        }

        let orchestrator = Orchestrator::new(
            DiagnosticEngine::new(cfg.thresholds()),
            cfg.monitoring.confirmation_threshold,
            cfg.monitoring.history_capacity,
            publisher.clone(),
        );

        Ok(Self::new(
            prober,
            orchestrator,
            publisher,
            cfg.interval(),
            cfg.bandwidth_interval(),
        )
        .with_traceroute(cfg.monitoring.traceroute_on_fault))
    }

    /// Run until `shutdown` fires. A cycle in flight at shutdown is abandoned unpublished.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(
            "Scheduler: Starting with {:?} health interval, bandwidth {}",
            self.interval,
            if self.prober.bandwidth_enabled() {
                format!("every {:?}", self.bandwidth_interval)
            } else {
                "disabled".to_string()
            }
        );

        let mut health = tokio::time::interval(self.interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Skip);

        // First bandwidth test one full period after startup.
        let bandwidth_period = self.bandwidth_interval.max(Duration::from_secs(1));
        let mut bandwidth =
            tokio::time::interval_at(Instant::now() + bandwidth_period, bandwidth_period);
        bandwidth.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let (bw_tx, mut bw_rx) = mpsc::channel::<Result<BandwidthResult, ProbeError>>(1);
        let mut bandwidth_running = false;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    break;
                }
                _ = health.tick() => {
                    let batch = tokio::select! {
                        batch = self.prober.collect_batch() => Some(batch),
                        _ = shutdown.recv() => None,
                    };
                    let Some(batch) = batch else {
                        break;
                    };

                    let report = self.orchestrator.process_batch(batch);
                    if let Some(code) = report.raised() {
                        self.spawn_traceroute(code);
                    }
                }
                Some(result) = bw_rx.recv() => {
                    bandwidth_running = false;
                    match result {
                        Ok(result) => self.orchestrator.apply_bandwidth(result),
                        Err(e) => tracing::warn!("Scheduler: Bandwidth test failed: {}", e),
                    }
                }
                _ = bandwidth.tick(), if self.prober.bandwidth_enabled() => {
                    if bandwidth_running {
                        tracing::warn!("Scheduler: Skipping bandwidth test, previous one still running");
                    } else {
                        bandwidth_running = true;
                        let prober = self.prober.clone();
                        let tx = bw_tx.clone();
                        tokio::spawn(async move {
                            if let Some(result) = prober.bandwidth().await {
                                let _ = tx.send(result).await;
                            }
                        });
                    }
                }
            }
        }

        tracing::info!(
            "Scheduler: Shutting down with fault code {}",
            self.orchestrator.state().fault_code
        );
    }

    /// Trace the path for faults where it helps locate the break.
    fn spawn_traceroute(&self, code: FaultCode) {
        if !self.traceroute_on_fault {
            return;
        }
        let Some(target) = traceroute_target(code, self.prober.isp_gateway()) else {
            return;
        };

        let publisher = self.publisher.clone();
        tokio::spawn(async move {
            tracing::info!("Scheduler: Running traceroute to {} for {}", target, code);
            match run_traceroute(&target, TRACEROUTE_TIMEOUT).await {
                Ok(tail) => {
                    if let Err(e) = publisher.update_state("last_traceroute", &tail) {
                        tracing::warn!("Scheduler: Failed to publish traceroute: {}", e);
                    }
                }
                Err(e) => tracing::warn!("Scheduler: Traceroute to {} failed: {}", target, e),
            }
        });
    }
}

fn traceroute_target(code: FaultCode, gateway: Option<&ProbeTarget>) -> Option<String> {
    match code {
        FaultCode::IspEquipment => gateway.map(|gw| gw.address.clone()),
        FaultCode::IspRouting => Some(ROUTING_TRACE_TARGET.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::recording::RecordingPublisher;

    #[test]
    fn test_traceroute_target() {
        let gateway = ProbeTarget::new(TargetKind::IspGateway, "100.64.0.1");
        assert_eq!(
            traceroute_target(FaultCode::IspEquipment, Some(&gateway)).as_deref(),
            Some("100.64.0.1")
        );
        assert_eq!(
            traceroute_target(FaultCode::IspRouting, None).as_deref(),
            Some("8.8.8.8")
        );
        assert_eq!(traceroute_target(FaultCode::IspEquipment, None), None);
        assert_eq!(traceroute_target(FaultCode::RouterDown, Some(&gateway)), None);
    }

    #[tokio::test]
    async fn test_from_config_and_shutdown() {
        let mut cfg = SentinelConfig::default();
        cfg.targets.isp_gateway = "100.64.0.1".to_string();
        cfg.bandwidth.enabled = false;

        let publisher = Arc::new(RecordingPublisher::default());
        let scheduler = Scheduler::from_config(&cfg, publisher).unwrap();
        assert!(scheduler.traceroute_on_fault);
        assert!(!scheduler.prober.bandwidth_enabled());
        assert_eq!(
            scheduler.prober.isp_gateway().map(|gw| gw.address.as_str()),
            Some("100.64.0.1")
        );

        let (tx, rx) = broadcast::channel(1);
        tx.send(()).unwrap();
        // Shutdown is polled first, so no cycle runs.
        tokio::time::timeout(Duration::from_secs(5), scheduler.run(rx))
            .await
            .unwrap();
    }
}
