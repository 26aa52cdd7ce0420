//! Role-partitioned description of the machines under test.
//!
//! The topology is read-only after construction: it is loaded once from the
//! fleet configuration file and consumed by everything else. Machines appear
//! in seven role groups. `mirror_*` and `sync_*` are the node/peer groups for
//! the two auxiliary subsystems the harness exercises; fleets that don't use
//! them simply leave those groups empty.

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

/// The seven named role groups, in the order they are dispatched.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct FleetTopology {
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default)]
    pub peers: Vec<String>,
    #[serde(default)]
    pub clients: Vec<String>,
    #[serde(default)]
    pub mirror_nodes: Vec<String>,
    #[serde(default)]
    pub mirror_peers: Vec<String>,
    #[serde(default)]
    pub sync_nodes: Vec<String>,
    #[serde(default)]
    pub sync_peers: Vec<String>,
}

impl FleetTopology {
    /// Load a topology from a YAML fleet file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("could not read fleet file {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("could not parse fleet file {}", path.display()))
    }

    /// Every machine that hosts a service: the union of all role groups
    /// except pure clients, deduplicated, in role order.
    pub fn servers(&self) -> Vec<String> {
        union(&[
            &self.nodes,
            &self.peers,
            &self.mirror_nodes,
            &self.mirror_peers,
            &self.sync_nodes,
            &self.sync_peers,
        ])
    }

    /// Every machine in the fleet, deduplicated, in role order.
    pub fn all_machines(&self) -> Vec<String> {
        union(&[
            &self.nodes,
            &self.peers,
            &self.clients,
            &self.mirror_nodes,
            &self.mirror_peers,
            &self.sync_nodes,
            &self.sync_peers,
        ])
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}

/// Order-preserving, deduplicating union of role groups.
fn union(groups: &[&Vec<String>]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut machines = Vec::new();
    for group in groups {
        for machine in group.iter() {
            if seen.insert(machine.clone()) {
                machines.push(machine.clone());
            }
        }
    }
    machines
}
