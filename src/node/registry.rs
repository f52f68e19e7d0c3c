//! Node registry.
//!
//! Holds every node provisioned for a build context, keyed by node id.
//! `ensure` only provisions the ids that are missing, so asking twice for the
//! same set of nodes never creates duplicates.

use std::collections::BTreeMap;

use super::Node;

/// Table of provisioned nodes
#[derive(Debug, Default, Clone)]
pub struct NodeRegistry {
    nodes: BTreeMap<String, Node>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure a node exists for every id, provisioning only missing ones.
    ///
    /// Returns the number of nodes that were provisioned by this call. The
    /// first provisioning error stops the loop; nodes created before it stay
    /// registered.
    pub fn ensure<I, F, E>(&mut self, ids: I, mut provision: F) -> Result<usize, E>
    where
        I: IntoIterator<Item = String>,
        F: FnMut(&str) -> Result<Node, E>,
    {
        let mut created = 0;
        for id in ids {
            if self.nodes.contains_key(&id) {
                log::debug!("Node {} already registered", id);
                continue;
            }
            let node = provision(&id)?;
            self.nodes.insert(id, node);
            created += 1;
        }
        Ok(created)
    }

    /// Register or replace a node
    pub fn insert(&mut self, node: Node) -> Option<Node> {
        self.nodes.insert(node.id.clone(), node)
    }

    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Drop every node `keep` rejects, returning how many were dropped
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&Node) -> bool,
    {
        let before = self.nodes.len();
        self.nodes.retain(|_, node| keep(node));
        before - self.nodes.len()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Nodes ordered by id
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }
}
