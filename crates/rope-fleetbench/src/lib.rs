//! # Datachain Rope Fleet Benchmarks
//!
//! Orchestrates load experiments against a Rope testnet from a fleet of driver
//! machines.
//!
//! ## Features
//!
//! - **Target resolution**: picks target nodes and their subnet from the registry,
//!   caching subnet lookups on disk
//! - **Fleet provisioning**: installs, stops and restarts the load agent over ssh
//! - **Quiescence**: waits for the testnet's request rate to settle between iterations
//! - **Iterations**: dispatches load agents, kills stragglers, collects summaries and node logs
//! - **Metrics Collection**: Prometheus-compatible orchestration counters
//!
//! ## Usage
//!
//! ```bash
//! # Ramp query load from 100 to 1000 RPS
//! cargo run --package rope-fleetbench -- run --config fleetbench.toml --initial-rps 100 --rps-step 100 --iterations 10
//!
//! # Show what an experiment would run against
//! cargo run --package rope-fleetbench -- resolve --config fleetbench.toml
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod executor;
pub mod hooks;
pub mod metrics;
pub mod provisioner;
pub mod quiescence;
pub mod registry;
pub mod report;
pub mod resolver;
pub mod runner;
pub mod telemetry;
pub mod types;
pub mod workload;

pub use config::ExperimentConfig;
pub use error::{ExperimentError, Result};
pub use hooks::{ExperimentSummary, ExperimentSummaryHook, LifecycleHook};
pub use report::{AggregatedReport, Verdict};
pub use runner::{Collaborators, ExperimentRunner, IterationState, LifecycleState};
pub use types::{Machine, MachineSet, NodeId, RequestKind, SubnetId, TargetSet};
pub use workload::{WorkloadDescription, WorkloadRequest};

/// Prelude for common imports
pub mod prelude {
    pub use crate::cache::{JsonFileCache, MemoryCache, ResolutionCache};
    pub use crate::config::ExperimentConfig;
    pub use crate::error::{ExperimentError, Result};
    pub use crate::executor::{RemoteCommand, RemoteExecutor, RemoteHandle, SshExecutor};
    pub use crate::hooks::{ExperimentSummary, ExperimentSummaryHook, LifecycleHook};
    pub use crate::registry::{AdminCliRegistry, ClusterRegistry};
    pub use crate::report::{AggregatedReport, JsonSummaryAggregator, SummaryAggregator};
    pub use crate::runner::{Collaborators, ExperimentRunner, LifecycleState};
    pub use crate::telemetry::{PrometheusSource, Series, TelemetrySource};
    pub use crate::types::*;
    pub use crate::workload::WorkloadRequest;
}
