//! Provisioned compute nodes.
//!
//! A node pairs the provider's server handle with its persona: the addresses
//! it holds on each network class, derived once after boot so probes never
//! re-query the provider.

pub mod registry;
pub mod resolver;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

use crate::network::NetworkClass;

pub use registry::NodeRegistry;
pub use resolver::{AddressNotBound, AddressResolver, NetworkMap};

/// A provisioned compute instance and its per-class addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub server_id: String,
    pub addresses: BTreeMap<NetworkClass, Vec<IpAddr>>,
    /// Name of the keypair used to log in
    pub credential: String,
}

impl Node {
    pub fn new(id: &str, server_id: &str, credential: &str) -> Self {
        Node {
            id: id.to_string(),
            server_id: server_id.to_string(),
            addresses: BTreeMap::new(),
            credential: credential.to_string(),
        }
    }

    /// Add an address on a class, keeping attachment order
    pub fn bind(&mut self, class: NetworkClass, address: IpAddr) {
        self.addresses.entry(class).or_default().push(address);
    }

    /// Network classes the node holds at least one address on
    pub fn classes(&self) -> impl Iterator<Item = NetworkClass> + '_ {
        self.addresses
            .iter()
            .filter(|(_, addresses)| !addresses.is_empty())
            .map(|(class, _)| *class)
    }

    pub fn is_attached(&self, class: NetworkClass) -> bool {
        self.addresses.get(&class).map_or(false, |a| !a.is_empty())
    }
}
