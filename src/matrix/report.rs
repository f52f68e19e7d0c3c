//! Matrix reporting.
//!
//! Renders matrices as text tables, folds them into a single overall
//! outcome and writes the run report as JSON.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use color_eyre::eyre::{Context, Result};
use serde::{Deserialize, Serialize};

use super::{ConnectivityMatrix, Expectation, Mismatch};
use crate::network::NetworkClass;
use crate::probe::{ProbeKind, ProbeResult};
use crate::topology::{Topology, TopologyVariant};

const CELL_OK: &str = "ok";
const CELL_FAIL: &str = "FAIL";
const CELL_SELF: &str = "---";
const CELL_NOT_EVALUATED: &str = ".";

/// AND of every cell.
///
/// None when fewer than two nodes take part or no pair was evaluated, so an
/// empty matrix is never mistaken for a passing one.
pub fn fold_overall(matrix: &ConnectivityMatrix) -> Option<bool> {
    if matrix.participants.len() < 2 || matrix.results.is_empty() {
        return None;
    }
    Some(matrix.results.iter().all(|r| r.success))
}

fn outcome(value: Option<bool>) -> &'static str {
    match value {
        Some(true) => "PASS",
        Some(false) => "FAIL",
        None => "n/a",
    }
}

/// Text table with sources as rows and targets as columns
pub fn render(matrix: &ConnectivityMatrix) -> String {
    let ids = &matrix.participants;
    let width = ids.iter().map(|id| id.len()).max().unwrap_or(0).max(CELL_FAIL.len()) + 2;

    let mut lines = Vec::with_capacity(ids.len() + 3);
    lines.push(format!(
        "{} / {} / {}",
        matrix.variant, matrix.network_class, matrix.probe_kind
    ));

    let mut header = format!("{:width$}", "", width = width);
    for id in ids {
        header.push_str(&format!("{:width$}", id, width = width));
    }
    lines.push(header.trim_end().to_string());

    for source in ids {
        let mut row = format!("{:width$}", source, width = width);
        for target in ids {
            let cell = if source == target {
                CELL_SELF
            } else {
                match matrix.get(source, target) {
                    Some(r) if r.success => CELL_OK,
                    Some(_) => CELL_FAIL,
                    None => CELL_NOT_EVALUATED,
                }
            };
            row.push_str(&format!("{:width$}", cell, width = width));
        }
        lines.push(row.trim_end().to_string());
    }

    lines.push(format!("overall: {}", outcome(fold_overall(matrix))));
    lines.join("\n")
}

/// One matrix as recorded in the run report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixSummary {
    pub network_class: NetworkClass,
    pub probe_kind: ProbeKind,
    pub participants: Vec<String>,
    pub probes: usize,
    pub failed: usize,
    pub overall: Option<bool>,
    pub expected_reachable: bool,
    pub verdict: Option<bool>,
    pub mismatches: Vec<Mismatch>,
    pub results: Vec<ProbeResult>,
}

impl MatrixSummary {
    pub fn new(matrix: &ConnectivityMatrix, expectation: &Expectation) -> Self {
        MatrixSummary {
            network_class: matrix.network_class,
            probe_kind: matrix.probe_kind,
            participants: matrix.participants.clone(),
            probes: matrix.len(),
            failed: matrix.failures().count(),
            overall: fold_overall(matrix),
            expected_reachable: expectation.permitted_on(matrix.network_class),
            verdict: expectation.verdict(matrix),
            mismatches: expectation.mismatches(matrix),
            results: matrix.results.clone(),
        }
    }
}

/// Everything a run produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixReport {
    pub generated_at: DateTime<Utc>,
    pub variant: TopologyVariant,
    pub node_count: usize,
    pub hub: Option<String>,
    pub isolated_cidrs: Vec<String>,
    pub matrices: Vec<MatrixSummary>,
}

impl MatrixReport {
    pub fn new(topology: &Topology, matrices: Vec<MatrixSummary>) -> Self {
        MatrixReport {
            generated_at: Utc::now(),
            variant: topology.variant,
            node_count: topology.node_count(),
            hub: topology.hub.as_ref().map(|hub| hub.id.clone()),
            isolated_cidrs: topology
                .isolated_networks
                .iter()
                .map(|net| net.plan.cidr.to_string())
                .collect(),
            matrices,
        }
    }

    /// False if any matrix disagrees with its expectation. Matrices without a
    /// verdict do not fail the run.
    pub fn passed(&self) -> bool {
        self.matrices.iter().all(|m| m.verdict != Some(false))
    }
}

/// One line per matrix, for logs and the terminal
pub fn summary_line(summary: &MatrixSummary) -> String {
    format!(
        "{}/{}: {} probes, {} failed, overall {}, verdict {}",
        summary.network_class,
        summary.probe_kind,
        summary.probes,
        summary.failed,
        outcome(summary.overall),
        outcome(summary.verdict)
    )
}

/// Summary lines for a set of matrices judged against one expectation
pub fn summary(matrices: &[ConnectivityMatrix], expectation: &Expectation) -> String {
    matrices
        .iter()
        .map(|m| summary_line(&MatrixSummary::new(m, expectation)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Write the run report as pretty JSON
pub fn write_json_report(report: &MatrixReport, output_path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize report to JSON")?;

    fs::write(output_path, json)
        .with_context(|| format!("Failed to write JSON report to {}", output_path.display()))?;

    log::info!("JSON report written to {}", output_path.display());
    Ok(())
}

/// Print the run summary to stdout
pub fn print_summary(report: &MatrixReport) {
    println!("{}", "=".repeat(60));
    println!(
        "Connectivity report: {} with {} nodes{}",
        report.variant,
        report.node_count,
        report.hub.as_ref().map(|hub| format!(" (hub: {})", hub)).unwrap_or_default()
    );
    println!("{}", "=".repeat(60));
    for summary in &report.matrices {
        println!("{}", summary_line(summary));
        for mismatch in &summary.mismatches {
            println!(
                "  {} -> {}: expected {}, got {} ({})",
                mismatch.source_node_id,
                mismatch.target_node_id,
                if mismatch.expected { "reachable" } else { "unreachable" },
                if mismatch.observed { "reachable" } else { "unreachable" },
                mismatch.diagnostic
            );
        }
    }
    println!("Result: {}", if report.passed() { "PASS" } else { "FAIL" });
}
