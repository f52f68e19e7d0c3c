//! Network topologies.
//!
//! A topology is the set of nodes built for a run together with the isolated
//! networks created for it. Two variants exist: a flat mesh, where every node
//! shares the same networks, and spoke-and-hub, where every spoke sits alone
//! on its own isolated network and a single hub holds the gateway address of
//! each of them.

pub mod builder;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::network::{NetworkClass, SubnetPlan};
use crate::node::Node;

pub use builder::{BuildContext, BuildError, BuildSettings, TopologyBuilder, FORWARDING_COMMAND};

/// Shape of a topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologyVariant {
    /// Any-to-any connectivity on shared networks
    FlatMesh,
    /// Per-spoke isolated networks joined only through the hub
    SpokeAndHub,
}

impl fmt::Display for TopologyVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopologyVariant::FlatMesh => write!(f, "flat_mesh"),
            TopologyVariant::SpokeAndHub => write!(f, "spoke_and_hub"),
        }
    }
}

/// An isolated network created for a topology
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IsolatedNetwork {
    pub network_id: String,
    pub subnet_id: String,
    pub plan: SubnetPlan,
}

/// Nodes and isolated networks of one build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub variant: TopologyVariant,
    /// Mesh members, or the spokes of a spoke-and-hub topology
    pub nodes: Vec<Node>,
    pub isolated_networks: Vec<IsolatedNetwork>,
    /// Present only for spoke-and-hub
    pub hub: Option<Node>,
    /// Classes the nodes were attached to
    pub network_classes: Vec<NetworkClass>,
}

impl Topology {
    /// Mesh members or spokes, followed by the hub if any
    pub fn all_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().chain(self.hub.iter())
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.all_nodes().find(|node| node.id == id)
    }

    pub fn is_hub(&self, id: &str) -> bool {
        self.hub.as_ref().map_or(false, |hub| hub.id == id)
    }

    /// Number of nodes requested for the build (spokes for spoke-and-hub)
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
