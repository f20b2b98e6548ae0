//! Aggregation of per-machine agent summaries

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::Result;

/// Failure rate at which further iterations are pointless
pub const STOP_FAILURE_RATE: f64 = 0.9;

/// Median latency (ms) at which further iterations are pointless
pub const STOP_T_MEDIAN_MS: f64 = 300_000.0;

/// Failure rate below which an iteration counts as successful
pub const ALLOWABLE_FAILURE_RATE: f64 = 0.2;

/// Median latency (ms) below which an iteration counts as successful
pub const ALLOWABLE_LATENCY_MS: f64 = 5_000.0;

/// Summary written by the load agent on one driver machine
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineSummary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub latency_median_ms: f64,
    pub latency_mean_ms: f64,
    pub latency_max_ms: f64,
    pub latency_min_ms: f64,
}

/// Combined result of one `run_workload` call
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregatedReport {
    pub machines: usize,
    /// Machines whose summary could not be read
    pub missing_machines: usize,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failure_rate: f64,
    pub latency_median_ms: f64,
    pub latency_mean_ms: f64,
    pub latency_max_ms: f64,
    pub latency_min_ms: f64,
}

/// Decision derived from a report
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub succeeded: bool,
    pub should_stop: bool,
}

impl AggregatedReport {
    /// Combine per-machine summaries; `None` marks a machine without a summary
    pub fn from_summaries(summaries: &[Option<MachineSummary>]) -> Self {
        let present: Vec<&MachineSummary> = summaries.iter().flatten().collect();
        let total_requests: u64 = present.iter().map(|s| s.total_requests).sum();
        let successful_requests: u64 = present.iter().map(|s| s.successful_requests).sum();

        let failure_rate = if total_requests == 0 {
            1.0
        } else {
            1.0 - successful_requests as f64 / total_requests as f64
        };

        let mut medians: Vec<f64> = present.iter().map(|s| s.latency_median_ms).collect();
        medians.sort_by(|a, b| a.total_cmp(b));

        let latency_mean_ms = if successful_requests == 0 {
            0.0
        } else {
            present
                .iter()
                .map(|s| s.latency_mean_ms * s.successful_requests as f64)
                .sum::<f64>()
                / successful_requests as f64
        };

        Self {
            machines: summaries.len(),
            missing_machines: summaries.len() - present.len(),
            total_requests,
            successful_requests,
            failure_rate,
            latency_median_ms: median(&medians),
            latency_mean_ms,
            latency_max_ms: present.iter().map(|s| s.latency_max_ms).fold(0.0, f64::max),
            latency_min_ms: present
                .iter()
                .map(|s| s.latency_min_ms)
                .reduce(f64::min)
                .unwrap_or(0.0),
        }
    }

    pub fn verdict(&self) -> Verdict {
        Verdict {
            succeeded: self.failure_rate < ALLOWABLE_FAILURE_RATE
                && self.latency_median_ms < ALLOWABLE_LATENCY_MS,
            should_stop: self.failure_rate >= STOP_FAILURE_RATE
                || self.latency_median_ms >= STOP_T_MEDIAN_MS,
        }
    }
}

fn median(sorted: &[f64]) -> f64 {
    match sorted.len() {
        0 => 0.0,
        n if n % 2 == 1 => sorted[n / 2],
        n => (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0,
    }
}

/// Evaluates the summary files fetched from the drivers
pub trait SummaryAggregator: Send + Sync {
    fn evaluate(&self, summaries: &[PathBuf]) -> Result<AggregatedReport>;
}

/// Aggregator reading [`MachineSummary`] JSON files
#[derive(Clone, Debug, Default)]
pub struct JsonSummaryAggregator;

impl JsonSummaryAggregator {
    fn read(path: &Path) -> Option<MachineSummary> {
        let content = match std::fs::read(path) {
            Ok(content) => content,
            Err(e) => {
                warn!("Missing summary {}: {}", path.display(), e);
                return None;
            }
        };
        match serde_json::from_slice(&content) {
            Ok(summary) => Some(summary),
            Err(e) => {
                warn!("Unreadable summary {}: {}", path.display(), e);
                None
            }
        }
    }
}

impl SummaryAggregator for JsonSummaryAggregator {
    fn evaluate(&self, summaries: &[PathBuf]) -> Result<AggregatedReport> {
        let parsed: Vec<Option<MachineSummary>> =
            summaries.iter().map(|path| Self::read(path)).collect();
        Ok(AggregatedReport::from_summaries(&parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(total: u64, ok: u64, median: f64) -> MachineSummary {
        MachineSummary {
            total_requests: total,
            successful_requests: ok,
            latency_median_ms: median,
            latency_mean_ms: median,
            latency_max_ms: median * 2.0,
            latency_min_ms: median / 2.0,
        }
    }

    #[test]
    fn test_aggregate() {
        let report = AggregatedReport::from_summaries(&[
            Some(summary(100, 90, 100.0)),
            Some(summary(100, 70, 300.0)),
            None,
        ]);

        assert_eq!(report.machines, 3);
        assert_eq!(report.missing_machines, 1);
        assert_eq!(report.total_requests, 200);
        assert!((report.failure_rate - 0.2).abs() < 1e-9);
        assert_eq!(report.latency_median_ms, 200.0);
        assert_eq!(report.latency_max_ms, 600.0);
        assert_eq!(report.latency_min_ms, 50.0);
        assert!((report.latency_mean_ms - (90.0 * 100.0 + 70.0 * 300.0) / 160.0).abs() < 1e-9);
    }

    #[test]
    fn test_verdicts() {
        let good = AggregatedReport::from_summaries(&[Some(summary(100, 99, 100.0))]);
        assert_eq!(
            good.verdict(),
            Verdict {
                succeeded: true,
                should_stop: false
            }
        );

        let overloaded = AggregatedReport::from_summaries(&[Some(summary(100, 5, 100.0))]);
        assert!(overloaded.verdict().should_stop);
        assert!(!overloaded.verdict().succeeded);

        let empty = AggregatedReport::from_summaries(&[None]);
        assert_eq!(empty.failure_rate, 1.0);
        assert!(empty.verdict().should_stop);
    }

    #[test]
    fn test_json_aggregator_tolerates_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("summary_machine_a");
        let bad = dir.path().join("summary_machine_b");
        std::fs::write(&good, serde_json::to_vec(&summary(10, 10, 5.0)).unwrap()).unwrap();
        std::fs::write(&bad, b"{").unwrap();

        let report = JsonSummaryAggregator
            .evaluate(&[good, bad, dir.path().join("summary_machine_c")])
            .unwrap();

        assert_eq!(report.machines, 3);
        assert_eq!(report.missing_machines, 2);
        assert_eq!(report.total_requests, 10);
        assert_eq!(report.failure_rate, 0.0);
    }
}
