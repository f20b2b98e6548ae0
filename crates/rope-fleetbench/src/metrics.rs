//! Prometheus metrics for experiment orchestration

use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};

use crate::error::{ExperimentError, Result};

/// Counters updated by the experiment runner
#[derive(Clone)]
pub struct RunnerMetrics {
    registry: Registry,
    pub iterations_started: IntCounter,
    pub workloads_run: IntCounter,
    pub generator_timeouts: IntCounter,
    pub quiescence_polls: IntCounter,
    pub agent_installs: IntCounter,
    pub driver_machines: IntGauge,
    pub target_nodes: IntGauge,
    pub last_failure_rate: Gauge,
}

impl RunnerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let iterations_started = IntCounter::new(
            "fleetbench_iterations_started_total",
            "Experiment iterations started",
        )?;
        let workloads_run = IntCounter::new("fleetbench_workloads_total", "Workloads dispatched")?;
        let generator_timeouts = IntCounter::new(
            "fleetbench_generator_timeouts_total",
            "Load agents killed at their deadline",
        )?;
        let quiescence_polls = IntCounter::new(
            "fleetbench_quiescence_polls_total",
            "Telemetry polls while waiting for quiescence",
        )?;
        let agent_installs =
            IntCounter::new("fleetbench_agent_installs_total", "Load agent installations")?;
        let driver_machines = IntGauge::new("fleetbench_driver_machines", "Driver machines in use")?;
        let target_nodes = IntGauge::new("fleetbench_target_nodes", "Nodes receiving load")?;
        let last_failure_rate = Gauge::new(
            "fleetbench_last_failure_rate",
            "Failure rate of the most recent workload",
        )?;

        registry.register(Box::new(iterations_started.clone()))?;
        registry.register(Box::new(workloads_run.clone()))?;
        registry.register(Box::new(generator_timeouts.clone()))?;
        registry.register(Box::new(quiescence_polls.clone()))?;
        registry.register(Box::new(agent_installs.clone()))?;
        registry.register(Box::new(driver_machines.clone()))?;
        registry.register(Box::new(target_nodes.clone()))?;
        registry.register(Box::new(last_failure_rate.clone()))?;

        Ok(Self {
            registry,
            iterations_started,
            workloads_run,
            generator_timeouts,
            quiescence_polls,
            agent_installs,
            driver_machines,
            target_nodes,
            last_failure_rate,
        })
    }

    /// Text exposition format
    pub fn encode(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| ExperimentError::Metrics(e.to_string()))
    }
}

impl From<prometheus::Error> for ExperimentError {
    fn from(e: prometheus::Error) -> Self {
        Self::Metrics(e.to_string())
    }
}
