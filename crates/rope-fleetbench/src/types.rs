//! Core identifiers shared across the orchestrator

use serde::{Deserialize, Serialize};
use std::fmt;

/// Network address of a driver host
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Machine(String);

impl Machine {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn address(&self) -> &str {
        &self.0
    }

    /// Address usable inside file names (IPv6 colons replaced)
    pub fn file_safe(&self) -> String {
        self.0.replace(':', "_")
    }
}

impl fmt::Display for Machine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Machine {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Machine {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Ordered set of driver machines, duplicates disallowed
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSet {
    machines: Vec<Machine>,
}

impl MachineSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a machine, returning false if it was already present
    pub fn insert(&mut self, machine: Machine) -> bool {
        if self.machines.contains(&machine) {
            return false;
        }
        self.machines.push(machine);
        true
    }

    pub fn len(&self) -> usize {
        self.machines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.machines.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Machine> {
        self.machines.iter()
    }

    pub fn as_slice(&self) -> &[Machine] {
        &self.machines
    }

    /// Keep only the first `n` machines
    pub fn truncate(&mut self, n: usize) {
        self.machines.truncate(n);
    }
}

impl<M: Into<Machine>> FromIterator<M> for MachineSet {
    fn from_iter<I: IntoIterator<Item = M>>(iter: I) -> Self {
        let mut set = MachineSet::new();
        for machine in iter {
            set.insert(machine.into());
        }
        set
    }
}

impl<'a> IntoIterator for &'a MachineSet {
    type Item = &'a Machine;
    type IntoIter = std::slice::Iter<'a, Machine>;

    fn into_iter(self) -> Self::IntoIter {
        self.machines.iter()
    }
}

/// Opaque subnet (partition) identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubnetId(String);

impl SubnetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubnetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Registry identifier of a cluster node
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of request issued by the load agent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    /// Read-only requests, answered by a single node
    #[default]
    Query,
    /// State-changing requests, go through consensus
    Call,
}

impl RequestKind {
    /// Agent `-m` flag value
    pub fn agent_method(&self) -> &'static str {
        match self {
            Self::Query => "Query",
            Self::Call => "Update",
        }
    }
}

/// Resolved load targets and the subnet they belong to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetSet {
    pub nodes: Vec<String>,
    pub subnet_id: SubnetId,
}
