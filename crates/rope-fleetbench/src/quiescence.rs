//! Waiting for the target cluster to settle between iterations

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

use crate::config::{ExperimentConfig, QuiescenceConfig};
use crate::error::{ExperimentError, Result};
use crate::telemetry::{Series, TelemetrySource};

/// Result of one wait, for logging and metrics
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QuiescenceOutcome {
    /// Telemetry polls issued
    pub polls: u32,
    /// Whether the rate dropped to the threshold before the cap
    pub reached_quiet: bool,
    /// Last successfully computed mean rate
    pub last_rate: Option<f64>,
}

/// Arithmetic mean over every sample of every series
pub fn mean_rate(series: &[Series]) -> Result<f64> {
    let values: Vec<f64> = series
        .iter()
        .flat_map(|s| s.samples.iter().map(|(_, value)| *value))
        .collect();

    if values.is_empty() {
        return Err(ExperimentError::Telemetry(
            "no request rate samples".to_string(),
        ));
    }
    Ok(values.iter().sum::<f64>() / values.len() as f64)
}

/// Polls telemetry until the cluster's request rate is low enough
pub struct QuiescenceWaiter {
    source: Arc<dyn TelemetrySource>,
    testnet: String,
    query: String,
    instrumentation_disabled: bool,
    uninstrumented_sleep: Duration,
}

impl QuiescenceWaiter {
    pub fn new(config: &ExperimentConfig, source: Arc<dyn TelemetrySource>) -> Self {
        Self {
            source,
            testnet: config.testnet.clone(),
            query: config.telemetry.request_rate_query_for(&config.testnet),
            instrumentation_disabled: config.instrumentation_disabled,
            uninstrumented_sleep: config.quiescence.uninstrumented_sleep(),
        }
    }

    /// Wait using the configured limits
    pub async fn wait(&self, limits: &QuiescenceConfig) -> QuiescenceOutcome {
        self.wait_for_quiet(
            limits.max_iterations,
            limits.quiet_rate_rps,
            limits.sleep_per_iteration(),
        )
        .await
    }

    /// Poll at most `max_iterations` times, sleeping `sleep_per_iteration` after every
    /// poll, and stop once the mean request rate is at most `quiet_rate_rps`.
    ///
    /// Reaching the cap is not an error. Telemetry failures are logged and the
    /// poll counts toward the cap.
    pub async fn wait_for_quiet(
        &self,
        max_iterations: u32,
        quiet_rate_rps: f64,
        sleep_per_iteration: Duration,
    ) -> QuiescenceOutcome {
        let mut outcome = QuiescenceOutcome::default();

        if self.instrumentation_disabled {
            info!(
                "Instrumentation disabled, sleeping {:?} instead of waiting for quiescence",
                self.uninstrumented_sleep
            );
            sleep(self.uninstrumented_sleep).await;
            return outcome;
        }

        while !outcome.reached_quiet && outcome.polls < max_iterations {
            outcome.polls += 1;

            match self.poll_rate().await {
                Ok(rate) => {
                    info!(
                        "{}/{} Current mean request rate of {} is {:.2} (want <= {})",
                        outcome.polls, max_iterations, self.testnet, rate, quiet_rate_rps
                    );
                    outcome.last_rate = Some(rate);
                    if rate <= quiet_rate_rps {
                        outcome.reached_quiet = true;
                    }
                }
                Err(e) => {
                    error!("Failed to query request rate of {}: {}", self.testnet, e);
                }
            }

            sleep(sleep_per_iteration).await;
        }

        if !outcome.reached_quiet {
            info!(
                "{} did not settle after {} polls, continuing anyway",
                self.testnet, outcome.polls
            );
        }
        outcome
    }

    async fn poll_rate(&self) -> Result<f64> {
        let series = self.source.query_instant(&self.query, Utc::now()).await?;
        mean_rate(&series)
    }
}
