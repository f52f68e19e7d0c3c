//! Topology construction.
//!
//! The builder creates networks, subnets, ports and servers through the
//! cloud provider, registers every server as a node, records every resource
//! in the ledger, and waits for the nodes to answer pings before handing the
//! topology out. All state lives in a `BuildContext` owned by the caller, so
//! a context that already holds a matching topology is reused as is.

use ipnetwork::{IpNetwork, Ipv4Network};
use rayon::prelude::*;
use std::net::IpAddr;

use super::{IsolatedNetwork, Topology, TopologyVariant};
use crate::ledger::ResourceLedger;
use crate::network::{NetworkClass, PlanError, SubnetAllocator, SubnetPlan};
use crate::node::{AddressNotBound, AddressResolver, NetworkMap, Node, NodeRegistry};
use crate::probe::{PingProbe, Probe, ProbeTarget, RetryPoller, RetryPolicy};
use crate::provider::{
    AllocationPool, CloudProvider, FixedIp, ProbeOrigin, ProviderError, RemoteExec, ResourceKind,
};

/// Command run on the hub so it routes between spoke networks
pub const FORWARDING_COMMAND: &str = "sudo sysctl -w net.ipv4.ip_forward=1";

/// Id of the routing node of a spoke-and-hub topology
const HUB_ID: &str = "hub";

/// Errors that abort a build
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Failed to create {kind}: {source}")]
    Provider {
        kind: ResourceKind,
        #[source]
        source: ProviderError,
    },

    #[error("Infrastructure not converged: {node_id} did not answer on the {class} network after {attempts} attempts ({diagnostic})")]
    ConvergenceTimeout {
        node_id: String,
        class: NetworkClass,
        attempts: u32,
        diagnostic: String,
    },

    #[error("Failed to enable forwarding on hub {node_id}: {message}")]
    HubSetup { node_id: String, message: String },

    #[error("Existing {existing} topology with {existing_nodes} nodes on {existing_classes:?} cannot be reused for a {requested} topology with {requested_nodes} nodes on {requested_classes:?}")]
    FixtureMismatch {
        existing: TopologyVariant,
        existing_nodes: usize,
        existing_classes: Vec<NetworkClass>,
        requested: TopologyVariant,
        requested_nodes: usize,
        requested_classes: Vec<NetworkClass>,
    },

    #[error("No {class} network is configured")]
    MissingNetwork { class: NetworkClass },

    #[error("Subnet planning failed: {0}")]
    Plan(#[from] PlanError),

    #[error(transparent)]
    AddressNotBound(#[from] AddressNotBound),
}

impl BuildError {
    fn provider(kind: ResourceKind) -> impl FnOnce(ProviderError) -> BuildError {
        move |source| BuildError::Provider {
            kind: source.kind().unwrap_or(kind),
            source,
        }
    }

    /// Whether the error means the provider or the network never settled,
    /// as opposed to a request the builder cannot serve
    pub fn leaves_infrastructure(&self) -> bool {
        matches!(
            self,
            BuildError::Provider { .. } | BuildError::ConvergenceTimeout { .. } | BuildError::HubSetup { .. }
        )
    }
}

/// Inputs the builder needs beyond the variant and node count
#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// Prefix of every created resource name
    pub name_prefix: String,
    pub keypair: String,
    pub public_network: Option<String>,
    pub private_network: Option<String>,
    /// Subnet of the flat-mesh isolated network
    pub isolated_cidr: Ipv4Network,
    /// First spoke block; later spokes follow it
    pub spoke_cidr: Ipv4Network,
    pub convergence: RetryPolicy,
    pub ping_count: u32,
    /// Mark every ledger entry retained when the build fails
    pub retain_on_failure: bool,
    pub enable_hub_forwarding: bool,
}

/// State shared by every build against one set of providers
#[derive(Debug, Default)]
pub struct BuildContext {
    pub registry: NodeRegistry,
    pub ledger: ResourceLedger,
    pub topology: Option<Topology>,
    /// Class of every network nodes may be attached to
    pub networks: NetworkMap,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Builds topologies through the cloud provider
pub struct TopologyBuilder<'a> {
    cloud: &'a dyn CloudProvider,
    remote: &'a dyn RemoteExec,
    settings: BuildSettings,
}

impl<'a> TopologyBuilder<'a> {
    pub fn new(cloud: &'a dyn CloudProvider, remote: &'a dyn RemoteExec, settings: BuildSettings) -> Self {
        TopologyBuilder { cloud, remote, settings }
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// Build a topology, or return the context's topology unchanged when it
    /// already has this variant and node count and is attached to at least
    /// the requested network classes.
    ///
    /// A flat mesh with fewer nodes is grown in place on its existing
    /// classes. Nodes provisioned by a failed build are dropped from the
    /// registry, so the next build provisions them afresh. Any failure that
    /// leaves infrastructure behind marks the whole ledger retained.
    pub fn build<'c>(
        &self,
        ctx: &'c mut BuildContext,
        variant: TopologyVariant,
        node_count: usize,
        network_classes: &[NetworkClass],
    ) -> Result<&'c Topology, BuildError> {
        let classes = normalize(network_classes);
        let reusable = match &ctx.topology {
            Some(existing) => check_fixture(existing, variant, node_count, &classes)?,
            None => false,
        };

        let topology = match ctx.topology.take() {
            Some(existing) if reusable => {
                log::info!("Reusing {} topology with {} nodes", existing.variant, existing.node_count());
                existing
            }
            previous => {
                // Growth keeps the classes the existing nodes are attached to
                let classes = previous.as_ref().map_or(classes, |t| t.network_classes.clone());
                let built = match variant {
                    TopologyVariant::FlatMesh => self.build_flat_mesh(ctx, node_count, &classes, previous.as_ref()),
                    TopologyVariant::SpokeAndHub => self.build_spoke_and_hub(ctx, node_count, &classes),
                };
                match built {
                    Ok(topology) => topology,
                    Err(e) => {
                        let dropped = ctx
                            .registry
                            .retain(|node| previous.as_ref().is_some_and(|t| t.node(&node.id).is_some()));
                        if dropped > 0 {
                            log::warn!("Dropped {} nodes of the failed build from the registry", dropped);
                        }
                        ctx.topology = previous;
                        if self.settings.retain_on_failure && e.leaves_infrastructure() {
                            log::error!("Build failed, retaining {} resources for inspection", ctx.ledger.len());
                            ctx.ledger.mark_all_retain();
                        }
                        return Err(e);
                    }
                }
            }
        };
        Ok(ctx.topology.insert(topology))
    }

    fn build_flat_mesh(
        &self,
        ctx: &mut BuildContext,
        node_count: usize,
        classes: &[NetworkClass],
        previous: Option<&Topology>,
    ) -> Result<Topology, BuildError> {
        log::info!("Building flat mesh of {} nodes on {:?}", node_count, classes);
        let mut network_ids = self.shared_networks(ctx, classes)?;

        let mut isolated_networks = previous.map(|t| t.isolated_networks.clone()).unwrap_or_default();
        if classes.contains(&NetworkClass::Isolated) {
            if isolated_networks.is_empty() {
                let plan = SubnetPlan::from_cidr(self.settings.isolated_cidr)?;
                let name = format!("{}-isolated", self.settings.name_prefix);
                isolated_networks.push(self.create_isolated_network(ctx, &name, plan)?);
            }
            network_ids.extend(isolated_networks.iter().map(|n| n.network_id.clone()));
        }

        let ids: Vec<String> = (0..node_count).map(|i| format!("node-{}", i)).collect();
        let BuildContext {
            registry,
            ledger,
            networks,
            ..
        } = &mut *ctx;
        let created = registry.ensure(ids.iter().cloned(), |id| {
            self.provision_node(ledger, networks, id, &network_ids, &[])
        })?;
        log::info!("Provisioned {} new nodes ({} requested)", created, node_count);

        let nodes: Vec<Node> = ids.iter().filter_map(|id| ctx.registry.get(id)).cloned().collect();
        self.converge(&nodes)?;

        Ok(Topology {
            variant: TopologyVariant::FlatMesh,
            nodes,
            isolated_networks,
            hub: None,
            network_classes: classes.to_vec(),
        })
    }

    fn build_spoke_and_hub(
        &self,
        ctx: &mut BuildContext,
        spoke_count: usize,
        classes: &[NetworkClass],
    ) -> Result<Topology, BuildError> {
        log::info!("Building spoke-and-hub topology with {} spokes on {:?}", spoke_count, classes);
        let shared_ids = self.shared_networks(ctx, classes)?;

        let mut allocator = SubnetAllocator::new(self.settings.spoke_cidr)?;
        let mut isolated_networks = Vec::with_capacity(spoke_count);
        for (i, plan) in allocator.take(spoke_count)?.into_iter().enumerate() {
            let name = format!("{}-spoke-{}", self.settings.name_prefix, i);
            isolated_networks.push(self.create_isolated_network(ctx, &name, plan)?);
        }

        let mut spokes = Vec::with_capacity(spoke_count);
        for (i, isolated) in isolated_networks.iter().enumerate() {
            let id = format!("spoke-{}", i);
            let mut network_ids = shared_ids.clone();
            network_ids.push(isolated.network_id.clone());

            let BuildContext {
                registry,
                ledger,
                networks,
                ..
            } = &mut *ctx;
            registry.ensure(std::iter::once(id.clone()), |id| {
                self.provision_node(ledger, networks, id, &network_ids, &[])
            })?;
            if let Some(node) = ctx.registry.get(&id) {
                spokes.push(node.clone());
            }
        }

        // One port per spoke network, holding that network's gateway address
        let mut port_ids = Vec::with_capacity(isolated_networks.len());
        for isolated in &isolated_networks {
            let fixed = FixedIp {
                subnet_id: Some(isolated.subnet_id.clone()),
                ip_address: IpAddr::V4(isolated.plan.gateway),
            };
            let port_id = self
                .cloud
                .create_port(&isolated.network_id, &[fixed])
                .map_err(BuildError::provider(ResourceKind::Port))?;
            ctx.ledger.track(ResourceKind::Port, &port_id);
            port_ids.push(port_id);
        }

        let BuildContext {
            registry,
            ledger,
            networks,
            ..
        } = &mut *ctx;
        registry.ensure(std::iter::once(HUB_ID.to_string()), |id| {
            self.provision_node(ledger, networks, id, &shared_ids, &port_ids)
        })?;
        let hub = match ctx.registry.get(HUB_ID) {
            Some(hub) => hub.clone(),
            None => {
                return Err(BuildError::HubSetup {
                    node_id: HUB_ID.to_string(),
                    message: "hub is missing from the registry".to_string(),
                })
            }
        };

        let mut all_nodes = spokes.clone();
        all_nodes.push(hub.clone());
        self.converge(&all_nodes)?;

        if self.settings.enable_hub_forwarding {
            self.enable_forwarding(&hub)?;
        }

        Ok(Topology {
            variant: TopologyVariant::SpokeAndHub,
            nodes: spokes,
            isolated_networks,
            hub: Some(hub),
            network_classes: classes.to_vec(),
        })
    }

    /// Ids of the shared networks for the requested classes
    fn shared_networks(&self, ctx: &mut BuildContext, classes: &[NetworkClass]) -> Result<Vec<String>, BuildError> {
        let mut ids = Vec::new();
        for class in classes.iter().filter(|c| c.is_shared()) {
            let configured = match class {
                NetworkClass::Public => &self.settings.public_network,
                _ => &self.settings.private_network,
            };
            let id = configured
                .clone()
                .ok_or(BuildError::MissingNetwork { class: *class })?;
            ctx.networks.insert(id.clone(), *class);
            ids.push(id);
        }
        Ok(ids)
    }

    fn create_isolated_network(
        &self,
        ctx: &mut BuildContext,
        name: &str,
        plan: SubnetPlan,
    ) -> Result<IsolatedNetwork, BuildError> {
        let network_id = self
            .cloud
            .create_network(name)
            .map_err(BuildError::provider(ResourceKind::Network))?;
        ctx.ledger.track(ResourceKind::Network, &network_id);
        ctx.networks.insert(network_id.clone(), NetworkClass::Isolated);

        let pool = AllocationPool {
            start: IpAddr::V4(plan.pool_start),
            end: IpAddr::V4(plan.pool_end),
        };
        let subnet_id = self
            .cloud
            .create_subnet(
                &network_id,
                4,
                IpNetwork::V4(plan.cidr),
                Some(IpAddr::V4(plan.gateway)),
                &[pool],
            )
            .map_err(BuildError::provider(ResourceKind::Subnet))?;
        ctx.ledger.track(ResourceKind::Subnet, &subnet_id);

        log::info!("Created isolated network {} ({}) with subnet {}", name, network_id, plan.cidr);
        Ok(IsolatedNetwork {
            network_id,
            subnet_id,
            plan,
        })
    }

    fn provision_node(
        &self,
        ledger: &mut ResourceLedger,
        networks: &NetworkMap,
        id: &str,
        network_ids: &[String],
        port_ids: &[String],
    ) -> Result<Node, BuildError> {
        let name = format!("{}-{}", self.settings.name_prefix, id);
        let server_id = self
            .cloud
            .create_server(&name, &self.settings.keypair, network_ids, port_ids)
            .map_err(BuildError::provider(ResourceKind::Server))?;
        ledger.track(ResourceKind::Server, &server_id);

        let attachments = self
            .cloud
            .server_addresses(&server_id)
            .map_err(BuildError::provider(ResourceKind::Server))?;
        let mut node = Node::new(id, &server_id, &self.settings.keypair);
        node.addresses = AddressResolver::classify(&attachments, networks);

        log::info!("Server {} ({}) is active as node {}", name, server_id, id);
        Ok(node)
    }

    /// Wait until every node answers a ping on each class it is attached to.
    /// Nodes settle independently, so they are polled in parallel.
    fn converge(&self, nodes: &[Node]) -> Result<(), BuildError> {
        let poller = RetryPoller::new(self.settings.convergence.clone());
        let probe = PingProbe::new(self.remote, self.settings.ping_count);
        log::info!(
            "Waiting for {} nodes to converge (up to {} attempts each)",
            nodes.len(),
            poller.policy().max_attempts
        );

        nodes.par_iter().try_for_each(|node| -> Result<(), BuildError> {
            for class in node.classes() {
                let target = ProbeTarget {
                    node_id: node.id.clone(),
                    address: AddressResolver::first(node, class)?,
                    credential: node.credential.clone(),
                };
                let polled = poller.poll(
                    |_| probe.execute(&ProbeOrigin::Harness, &target, class),
                    |result| result.success,
                );
                if !polled.done {
                    return Err(BuildError::ConvergenceTimeout {
                        node_id: node.id.clone(),
                        class,
                        attempts: polled.attempts,
                        diagnostic: polled.value.diagnostic,
                    });
                }
                log::debug!("Node {} answers on {} after {} attempts", node.id, class, polled.attempts);
            }
            Ok(())
        })
    }

    fn enable_forwarding(&self, hub: &Node) -> Result<(), BuildError> {
        let address = AddressResolver::access_address(hub).ok_or_else(|| BuildError::HubSetup {
            node_id: hub.id.clone(),
            message: "hub has no bound address".to_string(),
        })?;
        let poller = RetryPoller::new(self.settings.convergence.clone());
        let polled = poller.poll(
            |_| {
                self.remote
                    .ssh_exec(&ProbeOrigin::Harness, address, &hub.credential, FORWARDING_COMMAND)
            },
            |outcome| outcome.is_ok(),
        );
        match polled.value {
            Ok(output) => {
                log::info!("Enabled forwarding on hub {}: {}", hub.id, output.stdout.trim());
                Ok(())
            }
            Err(e) => Err(BuildError::HubSetup {
                node_id: hub.id.clone(),
                message: e.to_string(),
            }),
        }
    }
}

/// Sorted, de-duplicated class list
fn normalize(classes: &[NetworkClass]) -> Vec<NetworkClass> {
    let mut classes = classes.to_vec();
    classes.sort();
    classes.dedup();
    classes
}

/// Ok(true) when `existing` can be returned unchanged, Ok(false) when it can
/// be grown into the requested topology. The existing topology must cover
/// every requested class; extra classes it carries are fine.
fn check_fixture(
    existing: &Topology,
    variant: TopologyVariant,
    node_count: usize,
    classes: &[NetworkClass],
) -> Result<bool, BuildError> {
    let covers = classes.iter().all(|class| existing.network_classes.contains(class));
    let same_shape = existing.variant == variant && covers;
    if same_shape && existing.node_count() == node_count {
        return Ok(true);
    }
    if same_shape && variant == TopologyVariant::FlatMesh && existing.node_count() < node_count {
        return Ok(false);
    }
    Err(BuildError::FixtureMismatch {
        existing: existing.variant,
        existing_nodes: existing.node_count(),
        existing_classes: existing.network_classes.clone(),
        requested: variant,
        requested_nodes: node_count,
        requested_classes: classes.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{SimulatedCloud, SimulatedRemote};
    use std::time::Duration;

    fn cloud() -> SimulatedCloud {
        SimulatedCloud::new()
            .with_shared_network("public-net", "172.24.4.0/24".parse().unwrap())
            .unwrap()
            .with_shared_network("private-net", "10.0.0.0/24".parse().unwrap())
            .unwrap()
    }

    fn settings() -> BuildSettings {
        BuildSettings {
            name_prefix: "tp".to_string(),
            keypair: "tp-key".to_string(),
            public_network: Some("public-net".to_string()),
            private_network: Some("private-net".to_string()),
            isolated_cidr: "10.100.0.0/24".parse().unwrap(),
            spoke_cidr: "10.200.0.0/28".parse().unwrap(),
            convergence: RetryPolicy::fixed(3, Duration::ZERO),
            ping_count: 1,
            retain_on_failure: true,
            enable_hub_forwarding: true,
        }
    }

    const ALL: [NetworkClass; 3] = [NetworkClass::Public, NetworkClass::Private, NetworkClass::Isolated];

    #[test]
    fn test_flat_mesh_attaches_every_class() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        let builder = TopologyBuilder::new(&cloud, &remote, settings());
        let mut ctx = BuildContext::new();

        let topology = builder.build(&mut ctx, TopologyVariant::FlatMesh, 3, &ALL).unwrap();
        assert_eq!(topology.nodes.len(), 3);
        assert!(topology.hub.is_none());
        assert_eq!(topology.isolated_networks.len(), 1);
        for node in &topology.nodes {
            for class in ALL {
                assert!(node.is_attached(class), "{} lacks {}", node.id, class);
            }
        }
        let isolated = AddressResolver::first(&topology.nodes[0], NetworkClass::Isolated).unwrap();
        assert_eq!(isolated, "10.100.0.2".parse::<IpAddr>().unwrap());
        // network + subnet + 3 servers
        assert_eq!(ctx.ledger.len(), 5);
    }

    #[test]
    fn test_build_twice_reuses_fixture() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        let builder = TopologyBuilder::new(&cloud, &remote, settings());
        let mut ctx = BuildContext::new();

        let first = builder.build(&mut ctx, TopologyVariant::FlatMesh, 2, &ALL).unwrap() as *const Topology;
        let ledger_len = ctx.ledger.len();
        let created = cloud.created().len();

        let second = builder.build(&mut ctx, TopologyVariant::FlatMesh, 2, &ALL).unwrap();
        assert!(std::ptr::eq(first, second));
        assert_eq!(ctx.ledger.len(), ledger_len);
        assert_eq!(cloud.created().len(), created);
    }

    #[test]
    fn test_flat_mesh_grows_in_place() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        let builder = TopologyBuilder::new(&cloud, &remote, settings());
        let mut ctx = BuildContext::new();

        let first_server = builder.build(&mut ctx, TopologyVariant::FlatMesh, 2, &ALL).unwrap().nodes[0]
            .server_id
            .clone();
        let topology = builder.build(&mut ctx, TopologyVariant::FlatMesh, 4, &ALL).unwrap();
        assert_eq!(topology.nodes.len(), 4);
        assert_eq!(topology.nodes[0].server_id, first_server);
        assert_eq!(topology.isolated_networks.len(), 1);
        // still one isolated network + subnet, now 4 servers
        assert_eq!(ctx.ledger.len(), 6);
    }

    #[test]
    fn test_mismatched_fixture_is_rejected() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        let builder = TopologyBuilder::new(&cloud, &remote, settings());
        let mut ctx = BuildContext::new();
        builder.build(&mut ctx, TopologyVariant::FlatMesh, 2, &ALL).unwrap();

        let err = builder
            .build(&mut ctx, TopologyVariant::SpokeAndHub, 2, &ALL)
            .unwrap_err();
        assert!(matches!(err, BuildError::FixtureMismatch { .. }));
        assert!(ctx.topology.is_some());
        assert!(ctx.ledger.retained().is_empty());
    }

    #[test]
    fn test_fixture_covering_requested_classes_is_reused() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        let builder = TopologyBuilder::new(&cloud, &remote, settings());
        let mut ctx = BuildContext::new();
        let classes = [NetworkClass::Public, NetworkClass::Isolated];

        let first = builder.build(&mut ctx, TopologyVariant::FlatMesh, 3, &classes).unwrap() as *const Topology;
        let created = cloud.created().len();

        let narrower = builder
            .build(&mut ctx, TopologyVariant::FlatMesh, 3, &[NetworkClass::Public])
            .unwrap();
        assert!(std::ptr::eq(first, narrower));
        assert_eq!(narrower.network_classes, classes);
        assert_eq!(cloud.created().len(), created);

        // Growing on a narrower request keeps every existing class
        let grown = builder
            .build(&mut ctx, TopologyVariant::FlatMesh, 4, &[NetworkClass::Isolated])
            .unwrap();
        assert_eq!(grown.network_classes, classes);
        assert_eq!(grown.nodes[3].classes().collect::<Vec<_>>(), classes);

        let err = builder
            .build(&mut ctx, TopologyVariant::FlatMesh, 4, &[NetworkClass::Private])
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("on [Public, Isolated]"), "{}", message);
        assert!(message.contains("on [Private]"), "{}", message);
    }

    #[test]
    fn test_flat_mesh_rebuild_after_failure_uses_new_isolated_network() {
        let cloud = cloud();
        let classes = [NetworkClass::Public, NetworkClass::Isolated];
        let mut ctx = BuildContext::new();

        let failing = SimulatedRemote::new();
        failing.take_down("10.100.0.3".parse().unwrap());
        let err = TopologyBuilder::new(&cloud, &failing, settings())
            .build(&mut ctx, TopologyVariant::FlatMesh, 2, &classes)
            .unwrap_err();
        assert!(matches!(err, BuildError::ConvergenceTimeout { .. }));
        assert!(ctx.registry.is_empty());

        let healthy = SimulatedRemote::new();
        let topology = TopologyBuilder::new(&cloud, &healthy, settings())
            .build(&mut ctx, TopologyVariant::FlatMesh, 2, &classes)
            .unwrap();
        assert_eq!(topology.isolated_networks.len(), 1);
        let isolated = &topology.isolated_networks[0];

        for node in &topology.nodes {
            let attached: Vec<String> = cloud
                .server_addresses(&node.server_id)
                .unwrap()
                .into_iter()
                .map(|(network_id, _)| network_id)
                .collect();
            assert!(attached.contains(&isolated.network_id), "{} not on {}", node.id, isolated.network_id);
        }
        // both builds stay in the ledger: 2 networks, 2 subnets, 4 servers
        assert_eq!(ctx.ledger.len(), 8);
    }

    #[test]
    fn test_spoke_and_hub_rebuild_after_failure_binds_new_ports() {
        let cloud = cloud();
        let classes = [NetworkClass::Isolated];
        let mut ctx = BuildContext::new();

        let failing = SimulatedRemote::new();
        failing.refuse_ssh("10.200.0.1".parse().unwrap());
        TopologyBuilder::new(&cloud, &failing, settings())
            .build(&mut ctx, TopologyVariant::SpokeAndHub, 2, &classes)
            .unwrap_err();
        let stale_ports = cloud.live_count(ResourceKind::Port);
        assert_eq!(stale_ports, 2);

        let healthy = SimulatedRemote::new();
        let topology = TopologyBuilder::new(&cloud, &healthy, settings())
            .build(&mut ctx, TopologyVariant::SpokeAndHub, 2, &classes)
            .unwrap();
        let networks_of = |server_id: &str| -> Vec<String> {
            cloud
                .server_addresses(server_id)
                .unwrap()
                .into_iter()
                .map(|(network_id, _)| network_id)
                .collect()
        };

        let hub_networks = networks_of(&topology.hub.as_ref().unwrap().server_id);
        for (spoke, isolated) in topology.nodes.iter().zip(&topology.isolated_networks) {
            assert!(hub_networks.contains(&isolated.network_id));
            assert_eq!(networks_of(&spoke.server_id), vec![isolated.network_id.clone()]);
        }
        assert_eq!(cloud.live_count(ResourceKind::Port), stale_ports + 2);
        assert_eq!(healthy.commands().len(), 1);
    }

    #[test]
    fn test_spoke_and_hub_layout() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        let builder = TopologyBuilder::new(&cloud, &remote, settings());
        let mut ctx = BuildContext::new();

        let topology = builder.build(&mut ctx, TopologyVariant::SpokeAndHub, 3, &ALL).unwrap();
        assert_eq!(topology.nodes.len(), 3);
        assert_eq!(topology.isolated_networks.len(), 3);

        let hub = topology.hub.as_ref().unwrap();
        let gateways: Vec<IpAddr> = topology
            .isolated_networks
            .iter()
            .map(|n| IpAddr::V4(n.plan.gateway))
            .collect();
        assert_eq!(AddressResolver::resolve(hub, NetworkClass::Isolated).unwrap(), gateways.as_slice());
        assert_eq!(gateways[1], "10.200.0.17".parse::<IpAddr>().unwrap());

        for (spoke, isolated) in topology.nodes.iter().zip(&topology.isolated_networks) {
            let addresses = AddressResolver::resolve(spoke, NetworkClass::Isolated).unwrap();
            assert_eq!(addresses.len(), 1);
            match addresses[0] {
                IpAddr::V4(v4) => assert!(isolated.plan.in_pool(v4)),
                IpAddr::V6(_) => panic!("unexpected IPv6 address"),
            }
        }

        let commands = remote.commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].1, FORWARDING_COMMAND);
    }

    #[test]
    fn test_provider_failure_names_kind_and_retains() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        cloud.fail_creates_of(ResourceKind::Server);
        let builder = TopologyBuilder::new(&cloud, &remote, settings());
        let mut ctx = BuildContext::new();

        let err = builder.build(&mut ctx, TopologyVariant::FlatMesh, 2, &ALL).unwrap_err();
        match err {
            BuildError::Provider { kind, .. } => assert_eq!(kind, ResourceKind::Server),
            other => panic!("unexpected error: {}", other),
        }
        assert!(ctx.topology.is_none());
        assert_eq!(ctx.ledger.len(), 2);
        assert_eq!(ctx.ledger.retained().len(), 2);
    }

    #[test]
    fn test_convergence_waits_for_slow_nodes() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        // First server on the public network gets the first pool address
        remote.converge_after("172.24.4.2".parse().unwrap(), 2);
        let builder = TopologyBuilder::new(&cloud, &remote, settings());
        let mut ctx = BuildContext::new();

        assert!(builder.build(&mut ctx, TopologyVariant::FlatMesh, 2, &ALL).is_ok());
    }

    #[test]
    fn test_convergence_timeout_is_distinct() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        remote.take_down("10.100.0.3".parse().unwrap());
        let builder = TopologyBuilder::new(&cloud, &remote, settings());
        let mut ctx = BuildContext::new();

        let err = builder.build(&mut ctx, TopologyVariant::FlatMesh, 2, &ALL).unwrap_err();
        match err {
            BuildError::ConvergenceTimeout { node_id, class, attempts, .. } => {
                assert_eq!(node_id, "node-1");
                assert_eq!(class, NetworkClass::Isolated);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(ctx.ledger.retained().len(), ctx.ledger.len());
    }

    #[test]
    fn test_hub_forwarding_exhaustion_retains_everything() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        // Hub access address is the gateway of the first spoke network
        remote.refuse_ssh("10.200.0.1".parse().unwrap());
        let builder = TopologyBuilder::new(&cloud, &remote, settings());
        let mut ctx = BuildContext::new();

        let err = builder
            .build(&mut ctx, TopologyVariant::SpokeAndHub, 2, &[NetworkClass::Isolated])
            .unwrap_err();
        match err {
            BuildError::HubSetup { node_id, message } => {
                assert_eq!(node_id, HUB_ID);
                assert!(message.contains("connection refused"), "{}", message);
            }
            other => panic!("unexpected error: {}", other),
        }
        // 3 convergence pings, then 3 forwarding attempts
        assert_eq!(remote.probe_count(), 6);
        assert!(remote.commands().is_empty());
        assert!(ctx.topology.is_none());
        assert!(!ctx.ledger.is_empty());
        assert_eq!(ctx.ledger.retained().len(), ctx.ledger.len());
    }

    #[test]
    fn test_missing_shared_network() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        let mut settings = settings();
        settings.public_network = None;
        let builder = TopologyBuilder::new(&cloud, &remote, settings);
        let mut ctx = BuildContext::new();

        let err = builder.build(&mut ctx, TopologyVariant::FlatMesh, 2, &ALL).unwrap_err();
        assert!(matches!(err, BuildError::MissingNetwork { class: NetworkClass::Public }));
        assert!(ctx.ledger.is_empty());
    }
}
