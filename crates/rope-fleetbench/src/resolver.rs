//! Target, subnet and driver machine resolution

use std::sync::Arc;
use tracing::{debug, info};

use crate::cache::ResolutionCache;
use crate::config::ExperimentConfig;
use crate::error::{ExperimentError, Result};
use crate::registry::ClusterRegistry;
use crate::types::{MachineSet, SubnetId};

/// Cache key under which the subnet of `target` is stored
pub fn subnet_cache_key(target: &str) -> String {
    format!("subnet_for_target_{}", target)
}

/// Resolves which nodes receive load and which subnet they form
pub struct TargetResolver {
    config: Arc<ExperimentConfig>,
    registry: Arc<dyn ClusterRegistry>,
    cache: Arc<dyn ResolutionCache>,
}

impl TargetResolver {
    pub fn new(
        config: Arc<ExperimentConfig>,
        registry: Arc<dyn ClusterRegistry>,
        cache: Arc<dyn ResolutionCache>,
    ) -> Self {
        Self {
            config,
            registry,
            cache,
        }
    }

    /// Nodes to send load to.
    ///
    /// Calls and "target all" runs get every node; queries get only the node at
    /// `query_node_index`.
    pub async fn resolve_targets(&self) -> Result<Vec<String>> {
        let candidates = if !self.config.explicit_targets.is_empty() {
            self.config.explicit_targets.clone()
        } else {
            let subnet = self.target_partition().await?;
            let addresses = self.registry.subnet_addresses(&subnet).await?;
            if addresses.is_empty() {
                return Err(ExperimentError::Resolution(format!(
                    "subnet {} has no members",
                    subnet
                )));
            }
            addresses
        };

        self.select_targets(candidates)
    }

    fn select_targets(&self, mut candidates: Vec<String>) -> Result<Vec<String>> {
        if self.config.targets_all() {
            return Ok(candidates);
        }

        let index = self.config.query_node_index;
        if index >= candidates.len() {
            return Err(ExperimentError::Resolution(format!(
                "query node index {} out of range for {} candidate targets",
                index,
                candidates.len()
            )));
        }
        Ok(vec![candidates.swap_remove(index)])
    }

    async fn target_partition(&self) -> Result<SubnetId> {
        if self.config.mainnet_mode {
            return self.config.mainnet_target_partition_id.clone().ok_or_else(|| {
                ExperimentError::Config("mainnet mode without target partition".to_string())
            });
        }
        self.subnet_at(self.registry.as_ref(), self.config.target_subnet_index)
            .await
    }

    async fn subnet_at(&self, registry: &dyn ClusterRegistry, index: usize) -> Result<SubnetId> {
        let subnets = registry.list_subnets().await?;
        subnets.into_iter().nth(index).ok_or_else(|| {
            ExperimentError::Resolution(format!("no subnet at index {}", index))
        })
    }

    /// Subnet containing `target`, consulting the persistent cache first
    pub async fn resolve_subnet_id(&self, target: &str) -> Result<SubnetId> {
        let key = subnet_cache_key(target);
        if let Some(cached) = self.cache.get(&key) {
            debug!("Cache hit for {}: {}", key, cached);
            return Ok(SubnetId::new(cached));
        }

        for subnet in self.registry.list_subnets().await? {
            info!("Checking if target node {} is in subnet {}", target, subnet);
            let members = self.registry.subnet_membership(&subnet).await?;
            for node in &members {
                if self.registry.node_address(node).await? == target {
                    self.cache.put(&key, subnet.as_str())?;
                    return Ok(subnet);
                }
            }
        }

        Err(ExperimentError::Resolution(format!(
            "could not find subnet for target {}",
            target
        )))
    }

    /// Driver machines, looked up in `driver_registry` unless listed explicitly
    pub async fn resolve_driver_machines(
        &self,
        driver_registry: &dyn ClusterRegistry,
    ) -> Result<MachineSet> {
        let machines: MachineSet = if !self.config.explicit_driver_machines.is_empty() {
            self.config.explicit_driver_machines.iter().cloned().collect()
        } else if let Some(partition) = &self.config.driver_partition_override {
            driver_registry
                .subnet_addresses(partition)
                .await?
                .into_iter()
                .collect()
        } else if self.config.drivers_on_separate_testnet() {
            // Every application subnet of a dedicated driver testnet is usable
            let mut machines = MachineSet::new();
            for subnet in driver_registry.list_subnets().await?.iter().skip(1) {
                for address in driver_registry.subnet_addresses(subnet).await? {
                    machines.insert(address.into());
                }
            }
            machines
        } else {
            let subnet = self
                .subnet_at(driver_registry, self.config.driver_subnet_index)
                .await?;
            driver_registry
                .subnet_addresses(&subnet)
                .await?
                .into_iter()
                .collect()
        };

        if machines.is_empty() {
            return Err(ExperimentError::Resolution(format!(
                "no driver machines found on {}",
                self.config.driver_testnet
            )));
        }
        Ok(machines)
    }
}
