//! Router health scoring.
//!
//! A 0-100 score built from packet loss, mean latency above a 5 ms baseline
//! and latency spread across one cycle's router pings. Loss alone can take at
//! most 50 points; a fully unreachable router is reported as ROUTER_DOWN by the
//! engine rather than through the score.

use serde::Serialize;

use super::history::sample_stddev;
use crate::probe::ProbeResult;

/// Points deducted for 100% packet loss.
const MAX_LOSS_PENALTY: f64 = 50.0;
/// Latency below this costs nothing.
const LATENCY_BASELINE_MS: f64 = 5.0;
const LATENCY_POINTS_PER_MS: f64 = 1.0;
const JITTER_POINTS_PER_MS: f64 = 2.0;

/// Router health for one batch, never carried across cycles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RouterHealthScore {
    pub total: f64,
    pub loss_penalty: f64,
    pub latency_penalty: f64,
    pub jitter_penalty: f64,
}

impl RouterHealthScore {
    /// Score a cycle's router pings.
    ///
    /// An empty sample set is scored as total loss.
    pub fn from_samples(samples: &[ProbeResult]) -> Self {
        let latencies: Vec<f64> = samples.iter().filter_map(|s| s.latency_ms()).collect();
        let attempts = samples.len();

        let loss_fraction = if attempts == 0 {
            1.0
        } else {
            (attempts - latencies.len()) as f64 / attempts as f64
        };
        let loss_penalty = MAX_LOSS_PENALTY * loss_fraction;

        let (latency_penalty, jitter_penalty) = if latencies.is_empty() {
            (0.0, 0.0)
        } else {
            let mean = latencies.iter().sum::<f64>() / latencies.len() as f64;
            (
                (mean - LATENCY_BASELINE_MS).max(0.0) * LATENCY_POINTS_PER_MS,
                sample_stddev(&latencies) * JITTER_POINTS_PER_MS,
            )
        };

        let total = (100.0 - loss_penalty - latency_penalty - jitter_penalty).clamp(0.0, 100.0);

        Self {
            total,
            loss_penalty,
            latency_penalty,
            jitter_penalty,
        }
    }

    /// Share of pings lost, as a percentage.
    pub fn packet_loss_pct(&self) -> f64 {
        self.loss_penalty / MAX_LOSS_PENALTY * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnosis::models::fixtures::router_samples;

    fn score(latencies: &[Option<f64>]) -> RouterHealthScore {
        RouterHealthScore::from_samples(&router_samples(latencies))
    }

    #[test]
    fn test_perfect_router() {
        let s = score(&[Some(1.0), Some(1.0), Some(1.0), Some(1.0), Some(1.0)]);
        assert_eq!(s.total, 100.0);
        assert_eq!(s.loss_penalty, 0.0);
        assert_eq!(s.latency_penalty, 0.0);
        assert_eq!(s.jitter_penalty, 0.0);
    }

    #[test]
    fn test_total_loss_scores_fifty_for_any_n() {
        for n in 1..=12 {
            let s = score(&vec![None; n]);
            assert_eq!(s.total, 50.0, "n = {}", n);
            assert_eq!(s.latency_penalty, 0.0);
            assert_eq!(s.jitter_penalty, 0.0);
            assert_eq!(s.packet_loss_pct(), 100.0);
        }
        assert_eq!(score(&[]).total, 50.0);
    }

    #[test]
    fn test_penalty_components() {
        // 1 of 5 lost: 10 points. Mean 15 ms: 10 points. Stddev of [10, 20, 10, 20] = 5.7735: 11.547 points.
        let s = score(&[Some(10.0), Some(20.0), None, Some(10.0), Some(20.0)]);
        assert!((s.loss_penalty - 10.0).abs() < 1e-9);
        assert!((s.latency_penalty - 10.0).abs() < 1e-9);
        let expected_jitter = (100.0f64 / 3.0).sqrt() * 2.0;
        assert!((s.jitter_penalty - expected_jitter).abs() < 1e-9);
        assert!((s.total - (80.0 - expected_jitter)).abs() < 1e-9);
    }

    #[test]
    fn test_single_sample_has_no_jitter_penalty() {
        let s = score(&[Some(25.0)]);
        assert_eq!(s.jitter_penalty, 0.0);
        assert!((s.latency_penalty - 20.0).abs() < 1e-9);
        assert!((s.total - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_total_is_clamped() {
        let s = score(&[Some(500.0), Some(500.0), None]);
        assert_eq!(s.total, 0.0);
        assert!(s.latency_penalty > 100.0);
    }

    #[test]
    fn test_latency_is_monotonic() {
        let mut previous = f64::MAX;
        for mean in [1.0, 5.0, 6.0, 12.0, 30.0, 60.0, 120.0] {
            let s = score(&[Some(mean), Some(mean), None, Some(mean)]);
            assert!(s.total <= previous, "score rose at {} ms", mean);
            previous = s.total;
        }
    }

    #[test]
    fn test_scoring_is_deterministic() {
        let samples = router_samples(&[Some(3.2), None, Some(9.7), Some(4.4)]);
        assert_eq!(
            RouterHealthScore::from_samples(&samples),
            RouterHealthScore::from_samples(&samples)
        );
    }
}
