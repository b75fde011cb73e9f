//! Rolling latency windows used to derive jitter.

use std::collections::VecDeque;

/// Default number of samples kept per stream.
pub const DEFAULT_HISTORY_CAPACITY: usize = 10;

/// Fixed-capacity ring of latency samples in milliseconds.
#[derive(Debug, Clone)]
pub struct LatencyHistory {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl Default for LatencyHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl LatencyHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest once full.
    pub fn push(&mut self, sample_ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample_ms);
    }

    /// Sample standard deviation of the window, 0 with fewer than two samples.
    pub fn jitter(&self) -> f64 {
        let values: Vec<f64> = self.samples.iter().copied().collect();
        sample_stddev(&values)
    }
}

/// Sample standard deviation (N-1 divisor); 0 for fewer than two values.
pub fn sample_stddev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    variance.sqrt()
}
