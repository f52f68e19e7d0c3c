//! Connectivity matrices.
//!
//! A matrix is the full set of probe results for one topology, network class
//! and probe kind. The engine produces it, the reporter renders and folds it,
//! and an expectation compares it against the reachability policy.

pub mod engine;
pub mod expect;
pub mod report;

use serde::{Deserialize, Serialize};

use crate::network::NetworkClass;
use crate::probe::{ProbeKind, ProbeResult};
use crate::topology::TopologyVariant;

pub use engine::{plan_pairs, MatrixEngine, SourceTask, SweepSettings};
pub use expect::{Expectation, Mismatch};
pub use report::{fold_overall, print_summary, render, summary, summary_line, write_json_report, MatrixReport, MatrixSummary};

/// Probe results of one sweep, ordered by (source, target)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityMatrix {
    pub variant: TopologyVariant,
    pub network_class: NetworkClass,
    pub probe_kind: ProbeKind,
    /// Nodes holding an address on the class, sorted by id
    pub participants: Vec<String>,
    pub results: Vec<ProbeResult>,
}

impl ConnectivityMatrix {
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Result for an ordered pair, if that pair was evaluated
    pub fn get(&self, source: &str, target: &str) -> Option<&ProbeResult> {
        self.results
            .iter()
            .find(|r| r.source_node_id == source && r.target_node_id == target)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ProbeResult> {
        self.results.iter().filter(|r| !r.success)
    }

    /// AND over every cell; None when no meaningful pair exists
    pub fn overall(&self) -> Option<bool> {
        fold_overall(self)
    }
}
