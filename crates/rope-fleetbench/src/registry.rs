//! Cluster registry lookups
//!
//! The registry is the authority on subnet membership and node addresses.
//! [`AdminCliRegistry`] talks to it through the registry admin tool, which
//! prints JSON records.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::debug;

use crate::error::{ExperimentError, Result};
use crate::types::{NodeId, SubnetId};

/// Registry of subnets and their member nodes
#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    /// All known subnets, in registry order
    async fn list_subnets(&self) -> Result<Vec<SubnetId>>;

    /// Member nodes of a subnet, in membership order
    async fn subnet_membership(&self, subnet: &SubnetId) -> Result<Vec<NodeId>>;

    /// Network address of a node
    async fn node_address(&self, node: &NodeId) -> Result<String>;

    /// Addresses of every member of a subnet, in membership order
    async fn subnet_addresses(&self, subnet: &SubnetId) -> Result<Vec<String>> {
        let members = self.subnet_membership(subnet).await?;
        let mut addresses = Vec::with_capacity(members.len());
        for node in &members {
            addresses.push(self.node_address(node).await?);
        }
        Ok(addresses)
    }
}

#[derive(Deserialize)]
struct RegistryResponse<T> {
    records: Vec<RegistryRecord<T>>,
}

#[derive(Deserialize)]
struct RegistryRecord<T> {
    value: T,
}

#[derive(Deserialize)]
struct SubnetRecord {
    membership: Vec<NodeId>,
}

#[derive(Deserialize)]
struct NodeRecord {
    http: ConnectionEndpoint,
}

#[derive(Deserialize)]
struct ConnectionEndpoint {
    ip_addr: String,
}

fn first_record<T>(response: RegistryResponse<T>, what: &str) -> Result<T> {
    response
        .records
        .into_iter()
        .next()
        .map(|record| record.value)
        .ok_or_else(|| ExperimentError::Resolution(format!("no registry records for {}", what)))
}

/// Parse `get-subnet-list` output
pub fn parse_subnet_list(output: &[u8]) -> Result<Vec<SubnetId>> {
    Ok(serde_json::from_slice(output)?)
}

/// Parse `get-subnet` output into the first record's membership
pub fn parse_membership(output: &[u8], subnet: &SubnetId) -> Result<Vec<NodeId>> {
    let response: RegistryResponse<SubnetRecord> = serde_json::from_slice(output)?;
    Ok(first_record(response, &format!("subnet {}", subnet))?.membership)
}

/// Parse `get-node` output into the node's address
pub fn parse_node_address(output: &[u8], node: &NodeId) -> Result<String> {
    let response: RegistryResponse<NodeRecord> = serde_json::from_slice(output)?;
    Ok(first_record(response, &format!("node {}", node))?.http.ip_addr)
}

/// Registry client driving the admin CLI
pub struct AdminCliRegistry {
    admin_binary: PathBuf,
    registry_url: String,
    addresses: RwLock<HashMap<NodeId, String>>,
}

impl AdminCliRegistry {
    pub fn new(admin_binary: impl Into<PathBuf>, registry_url: impl Into<String>) -> Self {
        Self {
            admin_binary: admin_binary.into(),
            registry_url: registry_url.into(),
            addresses: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry_url(&self) -> &str {
        &self.registry_url
    }

    async fn admin(&self, args: &[&str]) -> Result<Vec<u8>> {
        debug!("{} {}", self.admin_binary.display(), args.join(" "));
        let output = Command::new(&self.admin_binary)
            .arg("--registry-url")
            .arg(&self.registry_url)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ExperimentError::Registry(format!(
                    "failed to run {}: {}",
                    self.admin_binary.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(ExperimentError::Registry(format!(
                "{} {} exited with {}: {}",
                self.admin_binary.display(),
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ClusterRegistry for AdminCliRegistry {
    async fn list_subnets(&self) -> Result<Vec<SubnetId>> {
        let output = self.admin(&["get-subnet-list"]).await?;
        parse_subnet_list(&output)
    }

    async fn subnet_membership(&self, subnet: &SubnetId) -> Result<Vec<NodeId>> {
        let output = self.admin(&["get-subnet", subnet.as_str()]).await?;
        parse_membership(&output, subnet)
    }

    async fn node_address(&self, node: &NodeId) -> Result<String> {
        let cached = self.addresses.read().get(node).cloned();
        if let Some(address) = cached {
            return Ok(address);
        }

        let output = self.admin(&["get-node", node.as_str()]).await?;
        let address = parse_node_address(&output, node)?;
        self.addresses.write().insert(node.clone(), address.clone());
        Ok(address)
    }
}
