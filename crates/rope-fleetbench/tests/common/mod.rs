//! In-memory collaborators shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rope_fleetbench::cache::MemoryCache;
use rope_fleetbench::error::{ExperimentError, Result};
use rope_fleetbench::executor::{RemoteCommand, RemoteExecutor, RemoteHandle};
use rope_fleetbench::registry::ClusterRegistry;
use rope_fleetbench::report::{JsonSummaryAggregator, MachineSummary};
use rope_fleetbench::runner::Collaborators;
use rope_fleetbench::telemetry::{Series, TelemetrySource};
use rope_fleetbench::types::{Machine, NodeId, SubnetId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// REGISTRY
// ============================================================================

/// Registry backed by a fixed subnet layout, counting every lookup
#[derive(Default)]
pub struct FakeRegistry {
    subnets: Vec<(SubnetId, Vec<(NodeId, String)>)>,
    list_calls: AtomicUsize,
    membership_calls: AtomicUsize,
    address_calls: AtomicUsize,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subnet(mut self, id: &str, addresses: &[&str]) -> Self {
        let members = addresses
            .iter()
            .enumerate()
            .map(|(i, address)| (NodeId::new(format!("{}-node-{}", id, i)), address.to_string()))
            .collect();
        self.subnets.push((SubnetId::new(id), members));
        self
    }

    /// Total registry lookups issued
    pub fn calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
            + self.membership_calls.load(Ordering::SeqCst)
            + self.address_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterRegistry for FakeRegistry {
    async fn list_subnets(&self) -> Result<Vec<SubnetId>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.subnets.iter().map(|(id, _)| id.clone()).collect())
    }

    async fn subnet_membership(&self, subnet: &SubnetId) -> Result<Vec<NodeId>> {
        self.membership_calls.fetch_add(1, Ordering::SeqCst);
        self.subnets
            .iter()
            .find(|(id, _)| id == subnet)
            .map(|(_, members)| members.iter().map(|(node, _)| node.clone()).collect())
            .ok_or_else(|| ExperimentError::Resolution(format!("unknown subnet {}", subnet)))
    }

    async fn node_address(&self, node: &NodeId) -> Result<String> {
        self.address_calls.fetch_add(1, Ordering::SeqCst);
        self.subnets
            .iter()
            .flat_map(|(_, members)| members.iter())
            .find(|(id, _)| id == node)
            .map(|(_, address)| address.clone())
            .ok_or_else(|| ExperimentError::Registry(format!("unknown node {}", node)))
    }
}

// ============================================================================
// EXECUTOR
// ============================================================================

type ExitCodes = Box<dyn Fn(&Machine, &str) -> i32 + Send + Sync>;

/// Executor recording every command, with scripted exit codes.
///
/// Local copy destinations receive `summary` when one is configured.
pub struct FakeExecutor {
    commands: Mutex<Vec<RemoteCommand>>,
    copies: Mutex<Vec<(String, String)>>,
    exit_code: ExitCodes,
    copy_codes: Mutex<Vec<i32>>,
    hanging: Vec<Machine>,
    delays: Vec<(String, Duration)>,
    summary: Option<MachineSummary>,
}

impl Default for FakeExecutor {
    fn default() -> Self {
        Self {
            commands: Mutex::new(Vec::new()),
            copies: Mutex::new(Vec::new()),
            exit_code: Box::new(|_, _| 0),
            copy_codes: Mutex::new(Vec::new()),
            hanging: Vec::new(),
            delays: Vec::new(),
            summary: None,
        }
    }
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exit_codes(
        mut self,
        exit_code: impl Fn(&Machine, &str) -> i32 + Send + Sync + 'static,
    ) -> Self {
        self.exit_code = Box::new(exit_code);
        self
    }

    /// Exit codes of the next copy batch, in order; later copies succeed
    pub fn with_copy_codes(self, codes: Vec<i32>) -> Self {
        *self.copy_codes.lock() = codes;
        self
    }

    /// Agents on `machine` never exit on their own
    pub fn with_hanging_agent(mut self, machine: &str) -> Self {
        self.hanging.push(Machine::new(machine));
        self
    }

    /// Commands starting with `prefix` take `delay` to exit
    pub fn with_command_delay(mut self, prefix: &str, delay: Duration) -> Self {
        self.delays.push((prefix.to_string(), delay));
        self
    }

    pub fn with_summary(mut self, summary: MachineSummary) -> Self {
        self.summary = Some(summary);
        self
    }

    pub fn commands(&self) -> Vec<RemoteCommand> {
        self.commands.lock().clone()
    }

    /// Commands whose text starts with `prefix`
    pub fn commands_starting_with(&self, prefix: &str) -> Vec<RemoteCommand> {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.command.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn copies(&self) -> Vec<(String, String)> {
        self.copies.lock().clone()
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    fn spawn_each(&self, commands: Vec<RemoteCommand>) -> Result<Vec<RemoteHandle>> {
        let mut handles = Vec::with_capacity(commands.len());
        for command in commands {
            let code = (self.exit_code)(&command.machine, &command.command);
            let hangs = command.command.starts_with("./") && self.hanging.contains(&command.machine);
            let delay = self
                .delays
                .iter()
                .find(|(prefix, _)| command.command.starts_with(prefix.as_str()))
                .map(|(_, delay)| *delay);
            self.commands.lock().push(command.clone());

            let task = tokio::spawn(async move {
                if hangs {
                    tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
                }
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                Ok(code)
            });
            handles.push(RemoteHandle::new(command.machine, task));
        }
        Ok(handles)
    }

    async fn copy_parallel(&self, sources: &[String], destinations: &[String]) -> Result<Vec<i32>> {
        let scripted = std::mem::take(&mut *self.copy_codes.lock());
        let mut codes = Vec::with_capacity(sources.len());
        for (i, (source, destination)) in sources.iter().zip(destinations).enumerate() {
            self.copies.lock().push((source.clone(), destination.clone()));
            let code = scripted.get(i).copied().unwrap_or(0);
            if code == 0 && !destination.contains('@') {
                if let Some(summary) = &self.summary {
                    std::fs::write(destination, serde_json::to_vec(summary)?)?;
                }
            }
            codes.push(code);
        }
        Ok(codes)
    }
}

// ============================================================================
// TELEMETRY
// ============================================================================

/// Telemetry reporting a constant request rate
pub struct ConstantTelemetry {
    rate: f64,
    calls: AtomicUsize,
    first_call: Mutex<Option<Instant>>,
}

impl ConstantTelemetry {
    pub fn new(rate: f64) -> Self {
        Self {
            rate,
            calls: AtomicUsize::new(0),
            first_call: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Runtime clock reading of the first query, if any
    pub fn first_call(&self) -> Option<Instant> {
        *self.first_call.lock()
    }
}

#[async_trait]
impl TelemetrySource for ConstantTelemetry {
    async fn query_instant(&self, _query: &str, _at: DateTime<Utc>) -> Result<Vec<Series>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.first_call.lock().get_or_insert_with(Instant::now);
        Ok(vec![Series {
            labels: Default::default(),
            samples: vec![(0.0, self.rate)],
        }])
    }
}

// ============================================================================
// WIRING
// ============================================================================

/// Target testnet: root subnet plus one application subnet with three nodes
pub fn target_registry() -> FakeRegistry {
    FakeRegistry::new()
        .with_subnet("subnet-root", &["10.0.0.10", "10.0.0.11"])
        .with_subnet("subnet-app", &["10.0.0.1", "10.0.0.2", "10.0.0.3"])
}

/// Driver testnet: root subnet plus two application subnets
pub fn driver_registry() -> FakeRegistry {
    FakeRegistry::new()
        .with_subnet("drivers-root", &["10.1.0.100"])
        .with_subnet("drivers-a", &["10.1.0.1", "10.1.0.2"])
        .with_subnet("drivers-b", &["10.1.0.3"])
}

pub fn summary(total: u64, successful: u64, median_ms: f64) -> MachineSummary {
    MachineSummary {
        total_requests: total,
        successful_requests: successful,
        latency_median_ms: median_ms,
        latency_mean_ms: median_ms,
        latency_max_ms: median_ms * 2.0,
        latency_min_ms: median_ms / 2.0,
    }
}

pub fn collaborators(
    executor: Arc<FakeExecutor>,
    registry: Arc<FakeRegistry>,
    driver_registry: Arc<FakeRegistry>,
) -> Collaborators {
    Collaborators {
        executor,
        registry,
        driver_registry,
        telemetry: Arc::new(ConstantTelemetry::new(0.0)),
        cache: Arc::new(MemoryCache::new()),
        aggregator: Arc::new(JsonSummaryAggregator),
    }
}
