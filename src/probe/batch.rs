//! Collection of one health-check cycle's probe results.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio::task::JoinHandle;

use super::{
    run_bandwidth_test, run_probe, BandwidthResult, BandwidthSettings, FailureReason, ProbeError,
    ProbeResult, ProbeTarget, ProbeTimeouts, TargetKind,
};
use crate::diagnosis::HealthCheckBatch;

/// Upper bound of the random delay before each DNS/HTTP probe starts.
const MAX_START_OFFSET_MS: u64 = 100;

/// Runs every configured probe for one cycle.
#[derive(Debug, Clone)]
pub struct NetworkProber {
    router: Arc<ProbeTarget>,
    isp_gateway: Option<Arc<ProbeTarget>>,
    dns_resolvers: Vec<Arc<ProbeTarget>>,
    dns_domains: Vec<String>,
    http_endpoints: Vec<Arc<ProbeTarget>>,
    router_sample_count: usize,
    timeouts: ProbeTimeouts,
    client: reqwest::Client,
    bandwidth: Option<BandwidthSettings>,
}

impl NetworkProber {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        router: ProbeTarget,
        isp_gateway: Option<ProbeTarget>,
        dns_resolvers: Vec<ProbeTarget>,
        dns_domains: Vec<String>,
        http_endpoints: Vec<ProbeTarget>,
        router_sample_count: usize,
        timeouts: ProbeTimeouts,
        client: reqwest::Client,
    ) -> Self {
        Self {
            router: Arc::new(router),
            isp_gateway: isp_gateway.map(Arc::new),
            dns_resolvers: dns_resolvers.into_iter().map(Arc::new).collect(),
            dns_domains,
            http_endpoints: http_endpoints.into_iter().map(Arc::new).collect(),
            router_sample_count,
            timeouts,
            client,
            bandwidth: None,
        }
    }

    pub fn with_bandwidth(mut self, settings: BandwidthSettings) -> Self {
        self.bandwidth = Some(settings);
        self
    }

    pub fn isp_gateway(&self) -> Option<&ProbeTarget> {
        self.isp_gateway.as_deref()
    }

    pub fn bandwidth_enabled(&self) -> bool {
        self.bandwidth.is_some()
    }

    /// Probe every layer and return a fully populated batch.
    ///
    /// Router pings run back to back; the other layers run concurrently with them.
    pub async fn collect_batch(&self) -> HealthCheckBatch {
        let started_at = Utc::now();

        let (router, isp_gateway, dns, http) = tokio::join!(
            self.ping_router(),
            self.ping_gateway(),
            self.probe_dns(),
            self.probe_http()
        );

        HealthCheckBatch::new(started_at, router, isp_gateway, dns, http)
    }

    /// Run a bandwidth test, if enabled.
    pub async fn bandwidth(&self) -> Option<Result<BandwidthResult, ProbeError>> {
        let settings = self.bandwidth.as_ref()?;
        Some(run_bandwidth_test(&self.client, settings).await)
    }

    async fn ping_router(&self) -> Vec<ProbeResult> {
        let mut samples = Vec::with_capacity(self.router_sample_count);
        for _ in 0..self.router_sample_count {
            let result = run_probe(self.router.clone(), None, self.timeouts, &self.client).await;
            samples.push(result);
        }
        samples
    }

    async fn ping_gateway(&self) -> Option<ProbeResult> {
        let gateway = self.isp_gateway.clone()?;
        Some(run_probe(gateway, None, self.timeouts, &self.client).await)
    }

    async fn probe_dns(&self) -> Vec<ProbeResult> {
        let mut handles = Vec::new();
        for resolver in &self.dns_resolvers {
            for domain in &self.dns_domains {
                let handle = self.spawn_probe(resolver.clone(), Some(domain.clone()));
                handles.push((resolver.clone(), Some(domain.clone()), handle));
            }
        }
        gather(handles).await
    }

    async fn probe_http(&self) -> Vec<ProbeResult> {
        let handles = self
            .http_endpoints
            .iter()
            .map(|endpoint| (endpoint.clone(), None, self.spawn_probe(endpoint.clone(), None)))
            .collect();
        gather(handles).await
    }

    fn spawn_probe(
        &self,
        target: Arc<ProbeTarget>,
        query: Option<String>,
    ) -> JoinHandle<ProbeResult> {
        let timeouts = self.timeouts;
        let client = self.client.clone();
        let offset = rand::thread_rng().gen_range(0..=MAX_START_OFFSET_MS);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(offset)).await;
            run_probe(target, query, timeouts, &client).await
        })
    }
}

type PendingProbe = (Arc<ProbeTarget>, Option<String>, JoinHandle<ProbeResult>);

/// Await spawned probes in configuration order.
async fn gather(handles: Vec<PendingProbe>) -> Vec<ProbeResult> {
    let mut results = Vec::with_capacity(handles.len());
    for (target, query, handle) in handles {
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Probe task for {} failed: {}", target.name(), e);
                let failed = ProbeResult::failure(target, FailureReason::TransportError);
                match query {
                    Some(q) => failed.with_query(q),
                    None => failed,
                }
            }
        };
        if let Some(reason) = result.failure {
            tracing::debug!("Probe {} failed: {}", result.target.name(), reason.as_str());
        }
        results.push(result);
    }
    results
}

/// Build targets of one kind from configured addresses.
pub fn targets(kind: TargetKind, addresses: &[String]) -> Vec<ProbeTarget> {
    addresses
        .iter()
        .map(|address| ProbeTarget::new(kind, address.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeouts() -> ProbeTimeouts {
        ProbeTimeouts {
            ping: Duration::from_millis(200),
            dns: Duration::from_millis(200),
            http: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_batch_is_fully_populated() {
        // Nothing listens on these ports, so every DNS/HTTP probe fails fast or times out.
        let prober = NetworkProber::new(
            ProbeTarget::new(TargetKind::Router, "invalid host name"),
            None,
            targets(TargetKind::DnsResolver, &["127.0.0.1:9".to_string()]),
            vec!["example.com".to_string(), "example.org".to_string()],
            targets(TargetKind::HttpEndpoint, &["http://127.0.0.1:9".to_string()]),
            2,
            timeouts(),
            reqwest::Client::new(),
        );

        let batch = prober.collect_batch().await;
        assert_eq!(batch.router.len(), 2);
        assert!(batch.isp_gateway.is_none());
        assert_eq!(batch.dns.len(), 2);
        assert_eq!(batch.dns[0].query.as_deref(), Some("example.com"));
        assert_eq!(batch.dns[1].query.as_deref(), Some("example.org"));
        assert_eq!(batch.http.len(), 1);
        assert!(!batch.router_reachable());
        assert_eq!(batch.dns_counts().ok, 0);
        assert_eq!(batch.http_counts().ok, 0);
    }

    #[tokio::test]
    async fn test_bandwidth_disabled() {
        let prober = NetworkProber::new(
            ProbeTarget::new(TargetKind::Router, "127.0.0.1"),
            None,
            Vec::new(),
            Vec::new(),
            Vec::new(),
            1,
            timeouts(),
            reqwest::Client::new(),
        );
        assert!(!prober.bandwidth_enabled());
        assert!(prober.bandwidth().await.is_none());
    }
}
