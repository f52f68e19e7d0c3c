//! Reachability expectations.
//!
//! A matrix only says what happened. An expectation says what should have
//! happened, so a run where isolation is the goal (every probe expected to
//! fail) can pass just as a run where full reachability is the goal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{fold_overall, ConnectivityMatrix};
use crate::network::NetworkClass;

/// Expected reachability, with optional per-class overrides
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Expectation {
    /// Whether probed pairs should be able to reach each other
    pub permitted: bool,
    /// Class-specific values that take precedence over `permitted`
    pub classes: BTreeMap<NetworkClass, bool>,
}

impl Default for Expectation {
    fn default() -> Self {
        Expectation {
            permitted: true,
            classes: BTreeMap::new(),
        }
    }
}

/// A cell whose outcome disagrees with the expectation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub source_node_id: String,
    pub target_node_id: String,
    pub expected: bool,
    pub observed: bool,
    pub diagnostic: String,
}

impl Expectation {
    pub fn permitting(permitted: bool) -> Self {
        Expectation {
            permitted,
            ..Self::default()
        }
    }

    pub fn permitted_on(&self, class: NetworkClass) -> bool {
        self.classes.get(&class).copied().unwrap_or(self.permitted)
    }

    pub fn mismatches(&self, matrix: &ConnectivityMatrix) -> Vec<Mismatch> {
        let expected = self.permitted_on(matrix.network_class);
        matrix
            .results
            .iter()
            .filter(|r| r.success != expected)
            .map(|r| Mismatch {
                source_node_id: r.source_node_id.clone(),
                target_node_id: r.target_node_id.clone(),
                expected,
                observed: r.success,
                diagnostic: r.diagnostic.clone(),
            })
            .collect()
    }

    /// Some(true) when every cell matches; None when the matrix has no
    /// meaningful pairs to judge
    pub fn verdict(&self, matrix: &ConnectivityMatrix) -> Option<bool> {
        fold_overall(matrix)?;
        Some(self.mismatches(matrix).is_empty())
    }
}
