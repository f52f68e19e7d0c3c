//! Run orchestrator.
//!
//! Coordinates a complete run: build the topology, sweep every network class
//! with every probe kind, write the report and tear down.

use color_eyre::eyre::{Result, WrapErr};
use std::path::Path;

use crate::config::Config;
use crate::ledger::{LedgerEntry, ReleaseError};
use crate::matrix::{render, write_json_report, ConnectivityMatrix, MatrixEngine, MatrixReport, MatrixSummary};
use crate::provider::{CloudProvider, RemoteExec, SimulatedCloud};
use crate::topology::{BuildContext, TopologyBuilder};

/// File name of the JSON report inside the output directory
pub const REPORT_FILE: &str = "connectivity_report.json";

/// What a run left behind
#[derive(Debug)]
pub struct RunOutcome {
    pub report: MatrixReport,
    pub matrices: Vec<ConnectivityMatrix>,
    /// Resources still on the provider after the run
    pub left_in_place: Vec<LedgerEntry>,
    pub release_errors: Vec<ReleaseError>,
}

/// Simulated cloud holding the shared networks the configuration names
pub fn simulated_cloud(config: &Config) -> Result<SimulatedCloud> {
    let mut cloud = SimulatedCloud::new();
    for shared in [&config.networks.public, &config.networks.private].into_iter().flatten() {
        cloud = cloud
            .with_shared_network(&shared.id, shared.cidr)
            .wrap_err_with(|| format!("Failed to register shared network {}", shared.id))?;
    }
    Ok(cloud)
}

/// Build, sweep, report and tear down.
///
/// `keep` leaves every resource in place after a successful run. A failed
/// build is torn down except for the entries the builder marked retained, and
/// its error is returned.
pub fn run(
    config: &Config,
    cloud: &dyn CloudProvider,
    remote: &dyn RemoteExec,
    output_dir: &Path,
    keep: bool,
) -> Result<RunOutcome> {
    let builder = TopologyBuilder::new(cloud, remote, config.build_settings());
    let mut ctx = BuildContext::new();

    let built = builder
        .build(
            &mut ctx,
            config.topology.variant,
            config.topology.node_count,
            &config.topology.network_classes,
        )
        .map(|topology| topology.clone());
    let topology = match built {
        Ok(topology) => topology,
        Err(e) => {
            let retained: Vec<LedgerEntry> = ctx.ledger.retained().into_iter().cloned().collect();
            for entry in &retained {
                log::warn!("Left in place for inspection: {} {}", entry.kind, entry.id);
            }
            for error in ctx.ledger.release_all(cloud) {
                log::error!("{}", error);
            }
            return Err(e).wrap_err("Topology build failed");
        }
    };

    let engine = MatrixEngine::new(remote, config.probe.settings.clone(), config.sweep_settings())
        .wrap_err("Failed to start the sweep thread pool")?;

    let mut matrices = Vec::new();
    let mut summaries = Vec::new();
    for &class in &topology.network_classes {
        for &kind in &config.probe.kinds {
            let matrix = engine.sweep(&topology, class, kind);
            println!("{}\n", render(&matrix));
            summaries.push(MatrixSummary::new(&matrix, &config.expect));
            matrices.push(matrix);
        }
    }

    let report = MatrixReport::new(&topology, summaries);
    write_json_report(&report, &output_dir.join(REPORT_FILE))?;

    let release_errors = if config.teardown.release_after_run && !keep {
        log::info!("Releasing {} resources", ctx.ledger.len());
        ctx.ledger.release_all(cloud)
    } else {
        log::info!("Keeping {} resources", ctx.ledger.len());
        Vec::new()
    };
    for error in &release_errors {
        log::warn!("{}", error);
    }

    Ok(RunOutcome {
        report,
        matrices,
        left_in_place: ctx.ledger.entries().to_vec(),
        release_errors,
    })
}
