//! All-pairs probe sweep.
//!
//! Each source node gets one task that probes its targets one after another;
//! tasks for different sources run in parallel on a rayon pool. Nothing is
//! written to shared state during a sweep: the topology is only read, and each
//! task returns its own results. A global deadline bounds the sweep; pairs a
//! task did not reach in time are recorded as failed with a timeout
//! diagnostic.

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuildError, ThreadPoolBuilder};
use std::time::{Duration, Instant};

use super::ConnectivityMatrix;
use crate::network::NetworkClass;
use crate::node::{AddressResolver, Node};
use crate::probe::{build_probe, Probe, ProbeKind, ProbeResult, ProbeSettings, ProbeTarget, RetryPoller, RetryPolicy};
use crate::provider::{ProbeOrigin, RemoteExec};
use crate::topology::{Topology, TopologyVariant};

/// Sweep-wide limits
#[derive(Debug, Clone)]
pub struct SweepSettings {
    /// Budget for the whole sweep
    pub timeout: Duration,
    /// Per-pair retry, for policies that take a while to propagate
    pub retry: RetryPolicy,
    /// Worker threads; 0 uses the global rayon pool
    pub workers: usize,
}

impl Default for SweepSettings {
    fn default() -> Self {
        SweepSettings {
            timeout: Duration::from_secs(600),
            retry: RetryPolicy::once(),
            workers: 0,
        }
    }
}

/// One source node and the targets it probes
#[derive(Debug, Clone)]
pub struct SourceTask<'t> {
    pub source: &'t Node,
    pub targets: Vec<&'t Node>,
}

/// Participants and per-source tasks of a sweep.
///
/// Flat mesh: every ordered pair of distinct nodes attached to `class`.
/// Spoke-and-hub: spoke to hub and hub to spoke only; spokes have no direct
/// link to each other, so spoke to spoke pairs are never generated.
pub fn plan_pairs(topology: &Topology, class: NetworkClass) -> (Vec<String>, Vec<SourceTask<'_>>) {
    let mut tasks = Vec::new();
    let participants: Vec<&Node>;

    match topology.variant {
        TopologyVariant::FlatMesh => {
            participants = topology.all_nodes().filter(|n| n.is_attached(class)).collect();
            for &source in &participants {
                let targets = participants
                    .iter()
                    .filter(|target| target.id != source.id)
                    .copied()
                    .collect();
                tasks.push(SourceTask { source, targets });
            }
        }
        TopologyVariant::SpokeAndHub => {
            let spokes: Vec<&Node> = topology.nodes.iter().filter(|n| n.is_attached(class)).collect();
            match topology.hub.as_ref().filter(|hub| hub.is_attached(class)) {
                Some(hub) => {
                    for &spoke in &spokes {
                        tasks.push(SourceTask {
                            source: spoke,
                            targets: vec![hub],
                        });
                    }
                    if !spokes.is_empty() {
                        tasks.push(SourceTask {
                            source: hub,
                            targets: spokes.clone(),
                        });
                    }
                    participants = spokes.into_iter().chain(std::iter::once(hub)).collect();
                }
                None => participants = spokes,
            }
        }
    }

    let mut ids: Vec<String> = participants.iter().map(|n| n.id.clone()).collect();
    ids.sort();
    (ids, tasks)
}

/// Runs sweeps through the remote execution provider
pub struct MatrixEngine<'a> {
    remote: &'a dyn RemoteExec,
    probe_settings: ProbeSettings,
    settings: SweepSettings,
    pool: Option<ThreadPool>,
}

impl<'a> MatrixEngine<'a> {
    pub fn new(
        remote: &'a dyn RemoteExec,
        probe_settings: ProbeSettings,
        settings: SweepSettings,
    ) -> Result<Self, ThreadPoolBuildError> {
        let pool = if settings.workers > 0 {
            Some(ThreadPoolBuilder::new().num_threads(settings.workers).build()?)
        } else {
            None
        };
        Ok(MatrixEngine {
            remote,
            probe_settings,
            settings,
            pool,
        })
    }

    /// Probe every candidate pair of `topology` on `class` with `kind`
    pub fn sweep(&self, topology: &Topology, class: NetworkClass, kind: ProbeKind) -> ConnectivityMatrix {
        let (participants, tasks) = plan_pairs(topology, class);
        let pair_count: usize = tasks.iter().map(|t| t.targets.len()).sum();
        log::info!(
            "Sweeping {} {} pairs on the {} network ({} sources)",
            pair_count,
            kind,
            class,
            tasks.len()
        );

        let probe = build_probe(kind, self.remote, &self.probe_settings);
        let deadline = Instant::now() + self.settings.timeout;
        let poller = RetryPoller::new(self.settings.retry.clone()).with_deadline(deadline);

        let run = || -> Vec<ProbeResult> {
            tasks
                .par_iter()
                .flat_map_iter(|task| run_source(task, class, probe.as_ref(), &poller, deadline))
                .collect()
        };
        let mut results = match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        };
        results.sort_by(|a, b| {
            a.source_node_id
                .cmp(&b.source_node_id)
                .then_with(|| a.target_node_id.cmp(&b.target_node_id))
        });

        let failed = results.iter().filter(|r| !r.success).count();
        log::info!("Sweep of {} on {} finished: {} probes, {} failed", kind, class, results.len(), failed);

        ConnectivityMatrix {
            variant: topology.variant,
            network_class: class,
            probe_kind: kind,
            participants,
            results,
        }
    }
}

/// Probe every target of one source, in order
fn run_source(
    task: &SourceTask<'_>,
    class: NetworkClass,
    probe: &dyn Probe,
    poller: &RetryPoller,
    deadline: Instant,
) -> Vec<ProbeResult> {
    let source = task.source;
    let origin_address = AddressResolver::access_address(source);

    let mut results = Vec::with_capacity(task.targets.len());
    for target in &task.targets {
        if Instant::now() >= deadline {
            log::warn!("Sweep deadline reached before {} -> {}", source.id, target.id);
            results.push(ProbeResult::timeout(&source.id, &target.id, class, probe.kind()));
            continue;
        }

        let (origin_address, address) = match (origin_address, AddressResolver::first(target, class)) {
            (Some(origin), Ok(address)) => (origin, address),
            (None, _) => {
                results.push(unprobed(source, target, class, probe.kind(), "source has no access address".to_string()));
                continue;
            }
            (_, Err(e)) => {
                results.push(unprobed(source, target, class, probe.kind(), e.to_string()));
                continue;
            }
        };

        let origin = ProbeOrigin::Node {
            node_id: source.id.clone(),
            address: origin_address,
            credential: source.credential.clone(),
        };
        let target = ProbeTarget {
            node_id: target.id.clone(),
            address,
            credential: target.credential.clone(),
        };
        results.push(poller.with_retry(|_| probe.execute(&origin, &target, class)));
    }
    results
}

fn unprobed(source: &Node, target: &Node, class: NetworkClass, kind: ProbeKind, diagnostic: String) -> ProbeResult {
    ProbeResult {
        source_node_id: source.id.clone(),
        target_node_id: target.id.clone(),
        network_class: class,
        probe_kind: kind,
        success: false,
        diagnostic,
    }
}
