//! Installing and controlling the load agent on driver machines

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::error::Result;
use crate::executor::{join_all_codes, remote_path, RemoteExecutor, RemoteHandle};
use crate::types::Machine;

/// Machines whose exit code is non-zero, paired with that code
pub fn failed_machines(machines: &[Machine], codes: &[i32]) -> Vec<(Machine, i32)> {
    machines
        .iter()
        .zip(codes)
        .filter(|(_, code)| **code != 0)
        .map(|(machine, code)| (machine.clone(), *code))
        .collect()
}

/// Prepares the driver fleet
pub struct FleetProvisioner {
    executor: Arc<dyn RemoteExecutor>,
    agent: AgentConfig,
}

impl FleetProvisioner {
    pub fn new(executor: Arc<dyn RemoteExecutor>, agent: AgentConfig) -> Self {
        Self { executor, agent }
    }

    /// Whether the agent binary is present on every machine.
    ///
    /// Always false when a locally built agent is configured, so it gets reinstalled.
    pub async fn is_installed(&self, machines: &[Machine]) -> Result<bool> {
        if self.agent.local_path.is_some() {
            info!("Reinstalling load agents since a locally built agent is configured");
            return Ok(false);
        }

        let codes = self
            .executor
            .run_parallel(machines, &format!("stat ./{}", self.agent.binary))
            .await?;
        Ok(codes.len() == machines.len() && codes.iter().all(|code| *code == 0))
    }

    /// Copy the agent to every machine and make it executable, returning the copy exit codes
    pub async fn install(&self, machines: &[Machine]) -> Result<Vec<i32>> {
        info!("Installing load agents on {} machines", machines.len());

        let source = self.agent.install_source().display().to_string();
        let sources = vec![source; machines.len()];
        let destinations: Vec<String> = machines
            .iter()
            .map(|m| remote_path(&self.agent.remote_user, m, ""))
            .collect();

        let codes = self.executor.copy_parallel(&sources, &destinations).await?;

        let chmod = self
            .executor
            .run_parallel(machines, &format!("chmod a+x {}", self.agent.binary))
            .await?;
        for (machine, code) in failed_machines(machines, &chmod) {
            warn!("chmod of load agent failed on {} with exit code {}", machine, code);
        }

        Ok(codes)
    }

    /// Stop the node service and any running agent, without waiting
    pub fn stop_agents(&self, machines: &[Machine]) -> Result<Vec<RemoteHandle>> {
        let command = format!(
            "sudo systemctl stop {}; kill $(pidof {}) || true",
            self.agent.node_service, self.agent.binary
        );
        self.executor.spawn_parallel(machines, &command, None, None)
    }

    /// Start the node service again on every machine and wait for all of them.
    ///
    /// Failures are logged only; teardown must proceed regardless.
    pub async fn restart_services(&self, machines: &[Machine]) -> Vec<(Machine, i32)> {
        info!("Restarting {} on {} machines", self.agent.node_service, machines.len());

        let command = format!("sudo systemctl start {}", self.agent.node_service);
        let handles = match self.executor.spawn_parallel(machines, &command, None, None) {
            Ok(handles) => handles,
            Err(e) => {
                warn!("Failed to restart services: {}", e);
                return Vec::new();
            }
        };

        let codes = join_all_codes(handles).await;
        for (machine, code) in codes.iter().filter(|(_, code)| *code != 0) {
            warn!(
                "Restarting {} on {} failed with exit code {}",
                self.agent.node_service, machine, code
            );
        }
        codes
    }
}
