//! Error types for fleet experiment orchestration

use thiserror::Error;

use crate::types::Machine;

/// Result type alias for experiment operations
pub type Result<T> = std::result::Result<T, ExperimentError>;

/// Errors that can occur while orchestrating an experiment
#[derive(Error, Debug)]
pub enum ExperimentError {
    // === Resolution ===
    /// No matching target, subnet or driver machine could be found
    #[error("Resolution failed: {0}")]
    Resolution(String),

    /// Not enough driver machines for the requested generator count
    #[error("Not enough driver machines: requested {requested}, available {available}")]
    Capacity { requested: usize, available: usize },

    // === Provisioning ===
    /// One or more machines failed to receive the agent
    #[error("Failed to install load agents, failing machines: {}", format_failures(.failures))]
    Install { failures: Vec<(Machine, i32)> },

    // === Lifecycle ===
    /// `init_experiment` was called more than once
    #[error("Experiment is already initialized")]
    AlreadyInitialized,

    /// Operation invoked in the wrong lifecycle state
    #[error("Invalid lifecycle state: expected {expected}, found {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    // === Collaborators ===
    /// Telemetry query or parse failure
    #[error("Telemetry error: {0}")]
    Telemetry(String),

    /// Registry lookup failure
    #[error("Registry error: {0}")]
    Registry(String),

    /// Remote execution failure
    #[error("Remote execution error: {0}")]
    Executor(String),

    /// Persistent cache failure
    #[error("Cache error: {0}")]
    Cache(String),

    /// Report aggregation failure
    #[error("Report error: {0}")]
    Report(String),

    /// Metrics registry failure
    #[error("Metrics error: {0}")]
    Metrics(String),

    // === General ===
    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn format_failures(failures: &[(Machine, i32)]) -> String {
    failures
        .iter()
        .map(|(machine, code)| format!("{} (exit code {})", machine, code))
        .collect::<Vec<_>>()
        .join(", ")
}

impl From<config::ConfigError> for ExperimentError {
    fn from(e: config::ConfigError) -> Self {
        Self::Config(e.to_string())
    }
}
