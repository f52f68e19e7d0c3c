//! Network classes and subnet planning.
//!
//! Nodes bind addresses on three logically distinct scopes: the shared
//! public network, the shared private/service network, and isolated networks
//! created per topology. This module names those scopes and computes the
//! non-overlapping IPv4 blocks used for isolated subnets.

pub mod allocator;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use allocator::{PlanError, SubnetAllocator, SubnetPlan};

/// Address-binding scope of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkClass {
    /// Shared, pre-existing externally reachable network
    Public,
    /// Shared, pre-existing service network
    Private,
    /// Topology-scoped network created for a single run
    Isolated,
}

impl NetworkClass {
    pub const ALL: [NetworkClass; 3] = [NetworkClass::Public, NetworkClass::Private, NetworkClass::Isolated];

    /// Returns true for the networks that exist before any topology is built
    pub fn is_shared(&self) -> bool {
        !matches!(self, NetworkClass::Isolated)
    }
}

impl fmt::Display for NetworkClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkClass::Public => write!(f, "public"),
            NetworkClass::Private => write!(f, "private"),
            NetworkClass::Isolated => write!(f, "isolated"),
        }
    }
}
