//! Address resolution per network class.
//!
//! Probes always use the first address a node holds on a class; nodes with
//! several addresses on one class are not fanned out. Asking for a class the
//! node was never attached to is a caller bug and is reported immediately.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;

use super::Node;
use crate::network::NetworkClass;

/// Provider network id to network class
pub type NetworkMap = HashMap<String, NetworkClass>;

/// Order in which classes are tried when picking a node's access address
const ACCESS_PREFERENCE: [NetworkClass; 3] = [NetworkClass::Public, NetworkClass::Private, NetworkClass::Isolated];

/// The node has no port on the requested network class
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Node {node_id} has no address on the {class} network")]
pub struct AddressNotBound {
    pub node_id: String,
    pub class: NetworkClass,
}

/// Resolves node addresses without mutating the node
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressResolver;

impl AddressResolver {
    /// All addresses bound on `class`, in attachment order
    pub fn resolve(node: &Node, class: NetworkClass) -> Result<&[IpAddr], AddressNotBound> {
        match node.addresses.get(&class) {
            Some(addresses) if !addresses.is_empty() => Ok(addresses),
            _ => Err(AddressNotBound {
                node_id: node.id.clone(),
                class,
            }),
        }
    }

    /// The address used for probing: the first one bound on `class`
    pub fn first(node: &Node, class: NetworkClass) -> Result<IpAddr, AddressNotBound> {
        Self::resolve(node, class).map(|addresses| addresses[0])
    }

    /// Address used to log into the node, preferring the public network
    pub fn access_address(node: &Node) -> Option<IpAddr> {
        ACCESS_PREFERENCE
            .iter()
            .find_map(|class| Self::first(node, *class).ok())
    }

    /// Group a server's (network id, address) attachments by network class.
    /// Attachments on networks outside `networks` are skipped.
    pub fn classify(attachments: &[(String, IpAddr)], networks: &NetworkMap) -> BTreeMap<NetworkClass, Vec<IpAddr>> {
        let mut by_class: BTreeMap<NetworkClass, Vec<IpAddr>> = BTreeMap::new();
        for (network_id, address) in attachments {
            match networks.get(network_id) {
                Some(class) => by_class.entry(*class).or_default().push(*address),
                None => log::debug!("Ignoring address {} on unmanaged network {}", address, network_id),
            }
        }
        by_class
    }
}
