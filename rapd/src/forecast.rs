//! Download latency forecasting.
//!
//! Remote cache hits still cost a download. The racing coordinator holds off
//! local starts by a percentile of the historical download latency for
//! actions with the same labels, so cheap downloads win without burning
//! local cores. Samples are windowed: stale history should not keep
//! inflating (or deflating) the holdoff.

use rap_common::ActionLabels;
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Percentile at which an action's download is considered an outlier worth
/// racing against local execution.
pub const DOWNLOAD_PERCENTILE_CUTOFF: u8 = 90;

const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 60);
const DEFAULT_MIN_SAMPLES: usize = 5;

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("not enough download samples for these labels: have {have}, need {need}")]
    NotEnoughData { have: usize, need: usize },
    #[error("percentile must be in 1..=100, got {0}")]
    InvalidPercentile(u8),
}

#[derive(Debug, Clone, Copy)]
struct LatencySample {
    at: Instant,
    latency: Duration,
}

/// Windowed per-label-fingerprint store of remote download latencies.
#[derive(Debug)]
pub struct Forecast {
    retention: Duration,
    min_samples: usize,
    samples: RwLock<HashMap<String, VecDeque<LatencySample>>>,
}

impl Default for Forecast {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION, DEFAULT_MIN_SAMPLES)
    }
}

impl Forecast {
    pub fn new(retention: Duration, min_samples: usize) -> Self {
        Self {
            retention,
            min_samples: min_samples.max(1),
            samples: RwLock::new(HashMap::new()),
        }
    }

    /// Record the observed download latency of a remote cache hit.
    pub fn record_download_latency(&self, labels: &ActionLabels, latency: Duration) {
        let mut samples = self.samples.write().unwrap();
        let entries = samples.entry(labels.fingerprint()).or_default();
        entries.push_back(LatencySample {
            at: Instant::now(),
            latency,
        });
        Self::evict_old(entries, self.retention);
    }

    /// The `p`-th percentile (nearest rank) of recorded download latencies
    /// for actions matching `labels`.
    pub fn percentile_download_latency(
        &self,
        labels: &ActionLabels,
        p: u8,
    ) -> Result<Duration, ForecastError> {
        if p == 0 || p > 100 {
            return Err(ForecastError::InvalidPercentile(p));
        }
        let mut samples = self.samples.write().unwrap();
        let entries = samples.entry(labels.fingerprint()).or_default();
        Self::evict_old(entries, self.retention);
        if entries.len() < self.min_samples {
            return Err(ForecastError::NotEnoughData {
                have: entries.len(),
                need: self.min_samples,
            });
        }
        let mut latencies: Vec<Duration> = entries.iter().map(|s| s.latency).collect();
        latencies.sort_unstable();
        let rank = (p as usize * latencies.len()).div_ceil(100);
        Ok(latencies[rank - 1])
    }

    fn evict_old(entries: &mut VecDeque<LatencySample>, retention: Duration) {
        let now = Instant::now();
        while entries
            .front()
            .map(|s| now.duration_since(s.at) > retention)
            .unwrap_or(false)
        {
            entries.pop_front();
        }
    }
}
