//! Lifecycle hooks plugged into the experiment runner

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

use crate::error::Result;
use crate::runner::IterationState;
use crate::types::{Machine, SubnetId};

/// File written by [`ExperimentSummaryHook`] in the experiment output directory
pub const EXPERIMENT_SUMMARY_FILE: &str = "experiment.json";

/// What an experiment runs against, handed to every hook
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSummary {
    pub testnet: String,
    pub driver_testnet: String,
    pub load_generator_machines: Vec<Machine>,
    pub target_machines: Vec<String>,
    pub subnet_id: SubnetId,
    pub resource_ids: Vec<String>,
    pub output_dir: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// Strategy invoked at the lifecycle transitions of an experiment
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    fn name(&self) -> &str;

    async fn on_init(&self, _experiment: &ExperimentSummary) -> Result<()> {
        Ok(())
    }

    async fn on_iteration_start(
        &self,
        _experiment: &ExperimentSummary,
        _iteration: &IterationState,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_iteration_end(
        &self,
        _experiment: &ExperimentSummary,
        _iteration: &IterationState,
    ) -> Result<()> {
        Ok(())
    }

    async fn on_finalize(&self, _experiment: &ExperimentSummary) -> Result<()> {
        Ok(())
    }
}

/// Writes the experiment summary consumed by report rendering
#[derive(Clone, Debug, Default)]
pub struct ExperimentSummaryHook;

#[async_trait]
impl LifecycleHook for ExperimentSummaryHook {
    fn name(&self) -> &str {
        "experiment_summary"
    }

    async fn on_init(&self, experiment: &ExperimentSummary) -> Result<()> {
        tokio::fs::create_dir_all(&experiment.output_dir).await?;
        let path = experiment.output_dir.join(EXPERIMENT_SUMMARY_FILE);
        tokio::fs::write(&path, serde_json::to_vec_pretty(experiment)?).await?;
        info!("Experiment summary written to {}", path.display());
        Ok(())
    }
}
