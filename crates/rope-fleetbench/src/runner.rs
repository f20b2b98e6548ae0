//! Experiment orchestration
//!
//! The runner owns the experiment lifecycle:
//!
//! ```text
//!  Uninitialized ──init_experiment()──► Initializing ──► Initialized
//!                                                            │
//!                                                   start_iteration()
//!                                                            ▼
//!          ┌─────────start_iteration()────────────► IterationRunning
//!          │                                                 │
//!          │                                          end_iteration()
//!          │                                                 ▼
//!          └─────────────────────────────────────── IterationIdle
//!
//!  Initializing / Initialized / IterationRunning / IterationIdle ──end_experiment()──► Finalized
//! ```
//!
//! A runner whose `init_experiment` failed stays `Initializing`: it cannot be
//! initialized again, but `end_experiment` still restarts the driver services.
//!
//! Remote work fans out across the fleet and is joined before the calling step
//! returns, except for stopping agents, whose handles are joined at the next
//! iteration boundary.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::{JsonFileCache, ResolutionCache};
use crate::config::ExperimentConfig;
use crate::error::{ExperimentError, Result};
use crate::executor::{
    join_all_codes, remote_path, JoinOutcome, RemoteCommand, RemoteExecutor, RemoteHandle,
    SshExecutor,
};
use crate::hooks::{ExperimentSummary, LifecycleHook};
use crate::metrics::RunnerMetrics;
use crate::provisioner::{failed_machines, FleetProvisioner};
use crate::quiescence::{QuiescenceOutcome, QuiescenceWaiter};
use crate::registry::{AdminCliRegistry, ClusterRegistry};
use crate::report::{AggregatedReport, JsonSummaryAggregator, SummaryAggregator};
use crate::resolver::TargetResolver;
use crate::telemetry::{PrometheusSource, TelemetrySource};
use crate::types::{Machine, MachineSet, TargetSet};
use crate::workload::{
    generator_timeout, plan_generators, summary_path, write_command_file, WorkloadDescription,
    WorkloadRequest,
};

/// File describing a finished iteration, inside its output directory
pub const ITERATION_RECORD_FILE: &str = "iteration.json";

/// Lifecycle of an experiment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    /// `init_experiment` started; set once, never reset
    Initializing,
    Initialized,
    IterationRunning,
    IterationIdle,
    Finalized,
}

impl LifecycleState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::Initialized => "initialized",
            Self::IterationRunning => "iteration running",
            Self::IterationIdle => "iteration idle",
            Self::Finalized => "finalized",
        }
    }
}

/// Timing and output location of one iteration
#[derive(Clone, Debug)]
pub struct IterationState {
    pub index: u32,
    pub outdir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    started: Instant,
    elapsed: Option<Duration>,
}

impl IterationState {
    fn new(index: u32, outdir: PathBuf) -> Self {
        Self {
            index,
            outdir,
            started_at: Utc::now(),
            ended_at: None,
            started: Instant::now(),
            elapsed: None,
        }
    }

    fn seal(&mut self) -> Duration {
        let elapsed = self.started.elapsed();
        self.ended_at = Some(Utc::now());
        self.elapsed = Some(elapsed);
        elapsed
    }

    /// Wall time from start to end, or to now while still running
    pub fn elapsed(&self) -> Duration {
        self.elapsed.unwrap_or_else(|| self.started.elapsed())
    }

    pub fn is_sealed(&self) -> bool {
        self.elapsed.is_some()
    }
}

/// Persisted description of a finished iteration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IterationRecord {
    pub index: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub elapsed_secs: u64,
    pub configuration: BTreeMap<String, serde_json::Value>,
}

/// External systems the runner drives
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn RemoteExecutor>,
    /// Registry of the target testnet
    pub registry: Arc<dyn ClusterRegistry>,
    /// Registry of the driver testnet
    pub driver_registry: Arc<dyn ClusterRegistry>,
    pub telemetry: Arc<dyn TelemetrySource>,
    pub cache: Arc<dyn ResolutionCache>,
    pub aggregator: Arc<dyn SummaryAggregator>,
}

impl Collaborators {
    /// ssh/scp, admin CLI registries, Prometheus, on-disk cache and JSON summaries
    pub fn production(config: &ExperimentConfig) -> Result<Self> {
        let registry = Arc::new(AdminCliRegistry::new(
            config.registry.admin_binary.clone(),
            config.registry.url.clone(),
        ));
        let driver_registry: Arc<dyn ClusterRegistry> =
            if config.registry.driver_url() == config.registry.url {
                registry.clone()
            } else {
                Arc::new(AdminCliRegistry::new(
                    config.registry.admin_binary.clone(),
                    config.registry.driver_url().to_string(),
                ))
            };

        Ok(Self {
            executor: Arc::new(
                SshExecutor::new(config.agent.remote_user.clone())
                    .with_connect_timeout(config.agent.connect_timeout_secs),
            ),
            registry,
            driver_registry,
            telemetry: Arc::new(PrometheusSource::new(
                config.telemetry.prometheus_url.clone(),
                Duration::from_secs(config.telemetry.timeout_secs),
            )?),
            cache: Arc::new(JsonFileCache::open(config.cache_path())?),
            aggregator: Arc::new(JsonSummaryAggregator),
        })
    }
}

/// Drives an experiment across the driver fleet
pub struct ExperimentRunner {
    config: Arc<ExperimentConfig>,
    resolver: TargetResolver,
    provisioner: FleetProvisioner,
    waiter: QuiescenceWaiter,
    executor: Arc<dyn RemoteExecutor>,
    driver_registry: Arc<dyn ClusterRegistry>,
    aggregator: Arc<dyn SummaryAggregator>,
    hooks: Vec<Box<dyn LifecycleHook>>,
    metrics: RunnerMetrics,

    state: LifecycleState,
    machines: MachineSet,
    targets: Option<TargetSet>,
    pending_stops: Vec<RemoteHandle>,
    iteration: Option<IterationState>,
    iterations_started: u32,
    started_at: DateTime<Utc>,
}

impl ExperimentRunner {
    pub fn new(config: ExperimentConfig, collaborators: Collaborators) -> Result<Self> {
        let config = Arc::new(config);
        Ok(Self {
            resolver: TargetResolver::new(
                config.clone(),
                collaborators.registry,
                collaborators.cache,
            ),
            provisioner: FleetProvisioner::new(
                collaborators.executor.clone(),
                config.agent.clone(),
            ),
            waiter: QuiescenceWaiter::new(&config, collaborators.telemetry),
            executor: collaborators.executor,
            driver_registry: collaborators.driver_registry,
            aggregator: collaborators.aggregator,
            hooks: Vec::new(),
            metrics: RunnerMetrics::new()?,
            state: LifecycleState::Uninitialized,
            machines: MachineSet::new(),
            targets: None,
            pending_stops: Vec::new(),
            iteration: None,
            iterations_started: 0,
            started_at: Utc::now(),
            config,
        })
    }

    /// Register a lifecycle hook; hooks run in registration order
    pub fn with_hook(mut self, hook: impl LifecycleHook + 'static) -> Self {
        self.hooks.push(Box::new(hook));
        self
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn machines(&self) -> &MachineSet {
        &self.machines
    }

    pub fn targets(&self) -> Option<&TargetSet> {
        self.targets.as_ref()
    }

    pub fn current_iteration(&self) -> Option<&IterationState> {
        self.iteration.as_ref()
    }

    pub fn metrics(&self) -> &RunnerMetrics {
        &self.metrics
    }

    /// Number of stop handles awaiting the next iteration boundary
    pub fn pending_stop_count(&self) -> usize {
        self.pending_stops.len()
    }

    /// Summary of what this experiment runs against, once resolved
    pub fn summary(&self) -> Option<ExperimentSummary> {
        let targets = self.targets.as_ref()?;
        Some(ExperimentSummary {
            testnet: self.config.testnet.clone(),
            driver_testnet: self.config.driver_testnet.clone(),
            load_generator_machines: self.machines.as_slice().to_vec(),
            target_machines: targets.nodes.clone(),
            subnet_id: targets.subnet_id.clone(),
            resource_ids: self.config.resource_ids.clone(),
            output_dir: self.config.output.dir.clone(),
            started_at: self.started_at,
        })
    }

    /// Request prefilled with the resolved machines and targets
    pub fn workload_request(&self, requests_per_second: u64) -> Result<WorkloadRequest> {
        let targets = self.resolved_targets()?;
        Ok(WorkloadRequest::new(
            self.machines.as_slice().to_vec(),
            targets.nodes.clone(),
            requests_per_second,
        ))
    }

    fn resolved_targets(&self) -> Result<&TargetSet> {
        self.targets.as_ref().ok_or(ExperimentError::InvalidState {
            expected: "resolved",
            actual: self.state.name(),
        })
    }

    fn expect_state(&self, allowed: &[LifecycleState], expected: &'static str) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(ExperimentError::InvalidState {
                expected,
                actual: self.state.name(),
            })
        }
    }

    /// Resolve targets and driver machines, then prepare the fleet
    pub async fn init(&mut self) -> Result<()> {
        self.resolve().await?;
        self.init_experiment().await
    }

    /// Resolve targets, subnet and driver machines without touching the fleet
    pub async fn resolve(&mut self) -> Result<()> {
        if self.state != LifecycleState::Uninitialized {
            return Err(ExperimentError::AlreadyInitialized);
        }

        info!(
            "Executing experiment against {} with load generators on {}",
            self.config.testnet, self.config.driver_testnet
        );

        let nodes = self.resolver.resolve_targets().await?;

        let mut machines = self
            .resolver
            .resolve_driver_machines(self.driver_registry.as_ref())
            .await?;
        if let Some(requested) = self.config.max_driver_count {
            if requested > machines.len() {
                return Err(ExperimentError::Capacity {
                    requested,
                    available: machines.len(),
                });
            }
            machines.truncate(requested);
        }
        if machines.is_empty() {
            return Err(ExperimentError::Resolution(
                "no driver machines".to_string(),
            ));
        }

        let subnet_id = match &self.config.mainnet_target_partition_id {
            Some(id) => id.clone(),
            None => {
                let primary = nodes.first().ok_or_else(|| {
                    ExperimentError::Resolution("no targets resolved".to_string())
                })?;
                self.resolver.resolve_subnet_id(primary).await?
            }
        };

        info!(
            "Running against {:?} (subnet {}) from {:?}",
            nodes,
            subnet_id,
            machines.as_slice()
        );

        self.metrics.driver_machines.set(machines.len() as i64);
        self.metrics.target_nodes.set(nodes.len() as i64);
        self.machines = machines;
        self.targets = Some(TargetSet { nodes, subnet_id });
        Ok(())
    }

    /// Install agents where needed and stop leftover agents.
    ///
    /// Can only be attempted once per runner, even when the attempt fails.
    pub async fn init_experiment(&mut self) -> Result<()> {
        if self.state != LifecycleState::Uninitialized {
            return Err(ExperimentError::AlreadyInitialized);
        }
        self.resolved_targets()?;
        self.state = LifecycleState::Initializing;

        let machines = self.machines.as_slice().to_vec();
        if !self.provisioner.is_installed(&machines).await? {
            let codes = self.provisioner.install(&machines).await?;
            self.metrics.agent_installs.inc();
            let failures = failed_machines(&machines, &codes);
            if !failures.is_empty() || codes.len() != machines.len() {
                return Err(ExperimentError::Install { failures });
            }
        } else {
            info!("Load agent already installed on {} machines", machines.len());
        }

        if let Some(summary) = self.summary() {
            for hook in &self.hooks {
                debug!("Running on_init hook {}", hook.name());
                hook.on_init(&summary).await?;
            }
        }

        self.pending_stops = self.provisioner.stop_agents(&machines)?;

        self.state = LifecycleState::Initialized;
        Ok(())
    }

    async fn join_pending_stops(&mut self) {
        let handles = std::mem::take(&mut self.pending_stops);
        if handles.is_empty() {
            return;
        }
        for (machine, code) in join_all_codes(handles).await {
            if code != 0 {
                warn!("Stopping agents on {} exited with {}", machine, code);
            }
        }
    }

    /// Begin an iteration once leftover agents are gone and the cluster is quiet
    pub async fn start_iteration(&mut self) -> Result<QuiescenceOutcome> {
        self.expect_state(
            &[LifecycleState::Initialized, LifecycleState::IterationIdle],
            "initialized or iteration idle",
        )?;

        self.join_pending_stops().await;

        self.iterations_started += 1;
        let outdir = self
            .config
            .output
            .dir
            .join(format!("iteration_{}", self.iterations_started));
        tokio::fs::create_dir_all(&outdir).await?;
        let iteration = IterationState::new(self.iterations_started, outdir);
        info!(
            "Starting iteration {} with output in {}",
            iteration.index,
            iteration.outdir.display()
        );

        if let Some(summary) = self.summary() {
            for hook in &self.hooks {
                hook.on_iteration_start(&summary, &iteration).await?;
            }
        }
        self.iteration = Some(iteration);
        self.metrics.iterations_started.inc();
        self.state = LifecycleState::IterationRunning;

        let outcome = self.waiter.wait(&self.config.quiescence).await;
        self.metrics.quiescence_polls.inc_by(u64::from(outcome.polls));
        Ok(outcome)
    }

    fn iteration_outdir(&self) -> Result<PathBuf> {
        self.iteration
            .as_ref()
            .map(|i| i.outdir.clone())
            .ok_or(ExperimentError::InvalidState {
                expected: "iteration running",
                actual: self.state.name(),
            })
    }

    /// Run the load agents and aggregate their summaries
    pub async fn run_workload(&mut self, request: WorkloadRequest) -> Result<AggregatedReport> {
        self.expect_state(&[LifecycleState::IterationRunning], "iteration running")?;
        let outdir = self.iteration_outdir()?;

        if request.machines.is_empty() || request.targets.is_empty() {
            return Err(ExperimentError::Config(
                "a workload needs at least one machine and one target".to_string(),
            ));
        }
        if request.requests_per_second == 0 {
            return Err(ExperimentError::Config(
                "a workload needs a positive request rate".to_string(),
            ));
        }

        let description = WorkloadDescription {
            resource_ids: request
                .resource_ids
                .unwrap_or_else(|| self.config.resource_ids.clone()),
            method: request
                .method
                .unwrap_or_else(|| self.config.request_kind.agent_method().to_string()),
            call_method: request.call_method,
            requests_per_second: request.requests_per_second,
            duration: request.duration,
            payload: request.payload,
            arguments: request.arguments,
        };

        let timeout = generator_timeout(description.duration);
        info!(
            "Running {} RPS for {:?} against {:?}, generator timeout {:?}",
            description.requests_per_second, description.duration, request.targets, timeout
        );

        let plans = plan_generators(
            &self.config.agent,
            &description,
            &request.machines,
            &request.targets,
            &outdir,
        );
        if plans.len() < request.machines.len() {
            info!(
                "Only {} of {} machines get a non-zero share of {} RPS",
                plans.len(),
                request.machines.len(),
                description.requests_per_second
            );
        }
        let active: Vec<Machine> = plans.iter().map(|p| p.machine.clone()).collect();
        let commands: Vec<String> = plans.iter().map(|p| p.command.clone()).collect();
        let command_file = write_command_file(&outdir, &commands)?;
        debug!("Load agent commands written to {}", command_file.display());

        let handles = self.executor.spawn_each(
            plans
                .into_iter()
                .map(|p| {
                    RemoteCommand::new(p.machine, p.command).with_output(p.stdout, p.stderr)
                })
                .collect(),
        )?;
        self.metrics.workloads_run.inc();

        let joins = handles.into_iter().map(|handle| async move {
            let machine = handle.machine().clone();
            (machine, handle.join_with_deadline(timeout).await)
        });
        for (machine, outcome) in join_all(joins).await {
            match outcome {
                Ok(JoinOutcome::Completed(0)) => {}
                Ok(JoinOutcome::Completed(code)) => {
                    warn!("Load agent on {} exited with {}", machine, code);
                }
                Ok(JoinOutcome::TimedOut) => {
                    warn!("Load agent on {} killed after {:?}", machine, timeout);
                    self.metrics.generator_timeouts.inc();
                }
                Err(e) => error!("Load agent on {} failed: {}", machine, e),
            }
        }

        let destinations = self.fetch_summaries(&active, &outdir).await?;

        info!("Evaluating results from {} machines", destinations.len());
        let report = self.aggregator.evaluate(&destinations)?;
        self.metrics.last_failure_rate.set(report.failure_rate);
        Ok(report)
    }

    async fn fetch_summaries(&self, machines: &[Machine], outdir: &Path) -> Result<Vec<PathBuf>> {
        let user = &self.config.agent.remote_user;
        let sources: Vec<String> = machines
            .iter()
            .map(|m| remote_path(user, m, &self.config.agent.summary_file))
            .collect();
        let destinations: Vec<PathBuf> = machines.iter().map(|m| summary_path(outdir, m)).collect();
        let local: Vec<String> = destinations
            .iter()
            .map(|d| d.display().to_string())
            .collect();

        let codes = self.executor.copy_parallel(&sources, &local).await?;
        for (machine, code) in failed_machines(machines, &codes) {
            warn!("Fetching summary from {} failed with {}", machine, code);
        }
        Ok(destinations)
    }

    /// Seal the iteration and collect node logs covering it
    pub async fn end_iteration(
        &mut self,
        configuration: BTreeMap<String, serde_json::Value>,
    ) -> Result<Duration> {
        self.expect_state(&[LifecycleState::IterationRunning], "iteration running")?;
        let targets: Vec<Machine> = self
            .resolved_targets()?
            .nodes
            .iter()
            .map(|n| Machine::new(n.as_str()))
            .collect();

        let iteration = self.iteration.as_mut().ok_or(ExperimentError::InvalidState {
            expected: "iteration running",
            actual: "no iteration",
        })?;
        let elapsed = iteration.seal();
        let iteration = iteration.clone();

        self.fetch_node_logs(&targets, &iteration.outdir, elapsed).await;

        let record = IterationRecord {
            index: iteration.index,
            started_at: iteration.started_at,
            ended_at: iteration.ended_at,
            elapsed_secs: elapsed.as_secs(),
            configuration,
        };
        tokio::fs::write(
            iteration.outdir.join(ITERATION_RECORD_FILE),
            serde_json::to_vec_pretty(&record)?,
        )
        .await?;

        if let Some(summary) = self.summary() {
            for hook in &self.hooks {
                hook.on_iteration_end(&summary, &iteration).await?;
            }
        }

        info!("Iteration {} finished after {:?}", iteration.index, elapsed);
        self.state = LifecycleState::IterationIdle;
        Ok(elapsed)
    }

    async fn fetch_node_logs(&self, targets: &[Machine], outdir: &Path, window: Duration) {
        // Round up so the window covers the whole iteration
        let since = window.as_secs() + u64::from(window.subsec_nanos() > 0);
        let command = format!(
            "journalctl -u {} --no-pager --since=-{}s",
            self.config.agent.node_service, since
        );
        let pattern = outdir.join("node-log-{}.txt").display().to_string();

        match self
            .executor
            .spawn_parallel(targets, &command, Some(&pattern), None)
        {
            Ok(handles) => {
                for (machine, code) in join_all_codes(handles).await {
                    if code != 0 {
                        warn!("Fetching logs from {} exited with {}", machine, code);
                    }
                }
            }
            Err(e) => warn!("Failed to fetch node logs: {}", e),
        }
    }

    /// Restart node services on the drivers and finish the experiment.
    ///
    /// Restart failures are logged but never prevent teardown.
    pub async fn end_experiment(&mut self) -> Result<()> {
        self.expect_state(
            &[
                LifecycleState::Initializing,
                LifecycleState::Initialized,
                LifecycleState::IterationRunning,
                LifecycleState::IterationIdle,
            ],
            "initialization attempted",
        )?;

        self.join_pending_stops().await;
        let machines = self.machines.as_slice().to_vec();
        self.provisioner.restart_services(&machines).await;

        if let Some(summary) = self.summary() {
            for hook in &self.hooks {
                if let Err(e) = hook.on_finalize(&summary).await {
                    warn!("Hook {} failed during finalization: {}", hook.name(), e);
                }
            }
        }

        self.state = LifecycleState::Finalized;
        info!("Experiment finished after {} iterations", self.iterations_started);
        Ok(())
    }
}
