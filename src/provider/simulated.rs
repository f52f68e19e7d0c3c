//! In-memory providers.
//!
//! `SimulatedCloud` keeps networks, subnets, ports and servers in a table
//! and hands out addresses from subnet allocation pools. It refuses to delete
//! a parent while children still reference it, which makes teardown order
//! observable. `SimulatedRemote` answers probes from a reachability model
//! that can be shaped per test: addresses that only converge after a number
//! of probes, hosts that are down, blocked (source, target) pairs, closed TCP
//! ports and seeded random loss.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ipnetwork::IpNetwork;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{
    AllocationPool, CloudProvider, FixedIp, ProbeOrigin, ProviderError, RemoteExec, ResourceKind, SshOutput,
};
use crate::network::SubnetPlan;

#[derive(Debug)]
struct SimSubnet {
    network_id: String,
    pool_start: u32,
    pool_end: u32,
    used: HashSet<IpAddr>,
}

#[derive(Debug)]
struct SimPort {
    network_id: String,
    addresses: Vec<IpAddr>,
    server_id: Option<String>,
}

#[derive(Debug)]
struct SimServer {
    attachments: Vec<(String, IpAddr)>,
    /// Addresses allocated for plain network attachments (not ports)
    owned: Vec<(String, IpAddr)>,
    ports: Vec<String>,
}

#[derive(Debug, Default)]
struct CloudState {
    counter: u64,
    networks: BTreeMap<String, String>,
    subnets: BTreeMap<String, SimSubnet>,
    ports: BTreeMap<String, SimPort>,
    servers: BTreeMap<String, SimServer>,
    fail_create: HashSet<ResourceKind>,
    fail_delete: HashSet<ResourceKind>,
    created: Vec<(ResourceKind, String)>,
    deleted: Vec<(ResourceKind, String)>,
}

impl CloudState {
    fn next_id(&mut self, kind: ResourceKind) -> String {
        self.counter += 1;
        format!("{}-{:04}", kind, self.counter)
    }

    fn check_create(&self, kind: ResourceKind) -> Result<(), ProviderError> {
        if self.fail_create.contains(&kind) {
            return Err(ProviderError::Create {
                kind,
                message: "injected provider failure".to_string(),
            });
        }
        Ok(())
    }

    fn first_subnet_of(&self, network_id: &str) -> Option<String> {
        self.subnets
            .iter()
            .find(|(_, subnet)| subnet.network_id == network_id)
            .map(|(id, _)| id.clone())
    }

    fn subnet_containing(&self, network_id: &str, address: IpAddr) -> Option<String> {
        let IpAddr::V4(v4) = address else {
            return None;
        };
        let value = u32::from(v4);
        // Gateways sit just below the pool
        self.subnets
            .iter()
            .find(|(_, s)| {
                s.network_id == network_id
                    && s.pool_start.saturating_sub(1) <= value
                    && value <= s.pool_end.saturating_add(1)
            })
            .map(|(id, _)| id.clone())
    }

    fn allocate(&mut self, subnet_id: &str) -> Result<IpAddr, ProviderError> {
        let subnet = self.subnets.get_mut(subnet_id).ok_or_else(|| ProviderError::NotFound {
            kind: ResourceKind::Subnet,
            id: subnet_id.to_string(),
        })?;
        for value in subnet.pool_start..=subnet.pool_end {
            let candidate = IpAddr::V4(Ipv4Addr::from(value));
            if subnet.used.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(ProviderError::Create {
            kind: ResourceKind::Port,
            message: format!("allocation pool of subnet {} exhausted", subnet_id),
        })
    }

    fn release_address(&mut self, network_id: &str, address: IpAddr) {
        for subnet in self.subnets.values_mut().filter(|s| s.network_id == network_id) {
            subnet.used.remove(&address);
        }
    }

    fn record(&mut self, kind: ResourceKind, id: &str) {
        self.created.push((kind, id.to_string()));
    }
}

/// In-memory cloud resource provider
#[derive(Debug, Default)]
pub struct SimulatedCloud {
    state: Mutex<CloudState>,
}

impl SimulatedCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a pre-existing shared network with a single subnet
    pub fn with_shared_network(self, id: &str, cidr: IpNetwork) -> Result<Self, ProviderError> {
        {
            let mut state = self.lock();
            state.networks.insert(id.to_string(), format!("shared-{}", id));
            let subnet_id = state.next_id(ResourceKind::Subnet);
            let subnet = sim_subnet(id, cidr, &[])?;
            state.subnets.insert(subnet_id, subnet);
        }
        Ok(self)
    }

    /// Make every following create call of `kind` fail
    pub fn fail_creates_of(&self, kind: ResourceKind) {
        self.lock().fail_create.insert(kind);
    }

    /// Make every following delete call of `kind` fail
    pub fn fail_deletes_of(&self, kind: ResourceKind) {
        self.lock().fail_delete.insert(kind);
    }

    /// Resources created so far, in creation order
    pub fn created(&self) -> Vec<(ResourceKind, String)> {
        self.lock().created.clone()
    }

    /// Resources deleted so far, in deletion order
    pub fn deleted(&self) -> Vec<(ResourceKind, String)> {
        self.lock().deleted.clone()
    }

    /// Number of live resources of a kind, shared networks included
    pub fn live_count(&self, kind: ResourceKind) -> usize {
        let state = self.lock();
        match kind {
            ResourceKind::Network => state.networks.len(),
            ResourceKind::Subnet => state.subnets.len(),
            ResourceKind::Port => state.ports.len(),
            ResourceKind::Server => state.servers.len(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn sim_subnet(network_id: &str, cidr: IpNetwork, pools: &[AllocationPool]) -> Result<SimSubnet, ProviderError> {
    let IpNetwork::V4(v4) = cidr else {
        return Err(ProviderError::Create {
            kind: ResourceKind::Subnet,
            message: format!("IPv6 subnet {} is not supported by the simulator", cidr),
        });
    };
    let plan = SubnetPlan::from_cidr(v4).map_err(|e| ProviderError::Create {
        kind: ResourceKind::Subnet,
        message: e.to_string(),
    })?;
    let (start, end) = match pools.first() {
        Some(AllocationPool { start: IpAddr::V4(start), end: IpAddr::V4(end) }) => (*start, *end),
        Some(pool) => {
            return Err(ProviderError::Create {
                kind: ResourceKind::Subnet,
                message: format!("invalid allocation pool {}-{}", pool.start, pool.end),
            })
        }
        None => (plan.pool_start, plan.pool_end),
    };
    if !v4.contains(start) || !v4.contains(end) || start > end {
        return Err(ProviderError::Create {
            kind: ResourceKind::Subnet,
            message: format!("allocation pool {}-{} outside {}", start, end, v4),
        });
    }
    Ok(SimSubnet {
        network_id: network_id.to_string(),
        pool_start: u32::from(start),
        pool_end: u32::from(end),
        used: HashSet::new(),
    })
}

impl CloudProvider for SimulatedCloud {
    fn create_network(&self, name: &str) -> Result<String, ProviderError> {
        let mut state = self.lock();
        state.check_create(ResourceKind::Network)?;
        let id = state.next_id(ResourceKind::Network);
        state.networks.insert(id.clone(), name.to_string());
        state.record(ResourceKind::Network, &id);
        log::debug!("Simulated network {} ({})", id, name);
        Ok(id)
    }

    fn create_subnet(
        &self,
        network_id: &str,
        _ip_version: u8,
        cidr: IpNetwork,
        _gateway_ip: Option<IpAddr>,
        allocation_pools: &[AllocationPool],
    ) -> Result<String, ProviderError> {
        let mut state = self.lock();
        state.check_create(ResourceKind::Subnet)?;
        if !state.networks.contains_key(network_id) {
            return Err(ProviderError::NotFound {
                kind: ResourceKind::Network,
                id: network_id.to_string(),
            });
        }
        let subnet = sim_subnet(network_id, cidr, allocation_pools)?;
        let id = state.next_id(ResourceKind::Subnet);
        state.subnets.insert(id.clone(), subnet);
        state.record(ResourceKind::Subnet, &id);
        Ok(id)
    }

    fn create_port(&self, network_id: &str, fixed_ips: &[FixedIp]) -> Result<String, ProviderError> {
        let mut state = self.lock();
        state.check_create(ResourceKind::Port)?;
        if !state.networks.contains_key(network_id) {
            return Err(ProviderError::NotFound {
                kind: ResourceKind::Network,
                id: network_id.to_string(),
            });
        }

        let mut addresses = Vec::new();
        if fixed_ips.is_empty() {
            let subnet_id = state.first_subnet_of(network_id).ok_or_else(|| ProviderError::Create {
                kind: ResourceKind::Port,
                message: format!("network {} has no subnet", network_id),
            })?;
            addresses.push(state.allocate(&subnet_id)?);
        }
        for fixed in fixed_ips {
            let subnet_id = match &fixed.subnet_id {
                Some(id) => id.clone(),
                None => state.subnet_containing(network_id, fixed.ip_address).ok_or_else(|| ProviderError::Create {
                    kind: ResourceKind::Port,
                    message: format!("{} is not within a subnet of network {}", fixed.ip_address, network_id),
                })?,
            };
            let subnet = state.subnets.get_mut(&subnet_id).ok_or_else(|| ProviderError::NotFound {
                kind: ResourceKind::Subnet,
                id: subnet_id.clone(),
            })?;
            if !subnet.used.insert(fixed.ip_address) {
                return Err(ProviderError::Create {
                    kind: ResourceKind::Port,
                    message: format!("IP address {} already allocated", fixed.ip_address),
                });
            }
            addresses.push(fixed.ip_address);
        }

        let id = state.next_id(ResourceKind::Port);
        state.ports.insert(
            id.clone(),
            SimPort {
                network_id: network_id.to_string(),
                addresses,
                server_id: None,
            },
        );
        state.record(ResourceKind::Port, &id);
        Ok(id)
    }

    fn create_server(
        &self,
        name: &str,
        _keypair: &str,
        network_ids: &[String],
        port_ids: &[String],
    ) -> Result<String, ProviderError> {
        let mut state = self.lock();
        state.check_create(ResourceKind::Server)?;
        let id = state.next_id(ResourceKind::Server);

        let mut attachments = Vec::new();
        let mut owned = Vec::new();
        for network_id in network_ids {
            let subnet_id = state.first_subnet_of(network_id).ok_or_else(|| ProviderError::Create {
                kind: ResourceKind::Server,
                message: format!("network {} has no subnet", network_id),
            })?;
            let address = state.allocate(&subnet_id)?;
            attachments.push((network_id.clone(), address));
            owned.push((network_id.clone(), address));
        }
        for port_id in port_ids {
            let port = state.ports.get_mut(port_id).ok_or_else(|| ProviderError::NotFound {
                kind: ResourceKind::Port,
                id: port_id.clone(),
            })?;
            if let Some(other) = &port.server_id {
                return Err(ProviderError::Create {
                    kind: ResourceKind::Server,
                    message: format!("port {} already bound to {}", port_id, other),
                });
            }
            port.server_id = Some(id.clone());
            for address in &port.addresses {
                attachments.push((port.network_id.clone(), *address));
            }
        }

        state.servers.insert(
            id.clone(),
            SimServer {
                attachments,
                owned,
                ports: port_ids.to_vec(),
            },
        );
        state.record(ResourceKind::Server, &id);
        log::debug!("Simulated server {} ({}) is active", id, name);
        Ok(id)
    }

    fn server_addresses(&self, server_id: &str) -> Result<Vec<(String, IpAddr)>, ProviderError> {
        let state = self.lock();
        state
            .servers
            .get(server_id)
            .map(|server| server.attachments.clone())
            .ok_or_else(|| ProviderError::NotFound {
                kind: ResourceKind::Server,
                id: server_id.to_string(),
            })
    }

    fn delete_network(&self, id: &str) -> Result<(), ProviderError> {
        let mut state = self.lock();
        check_delete(&state, ResourceKind::Network, id)?;
        if state.subnets.values().any(|s| s.network_id == id) || state.ports.values().any(|p| p.network_id == id) {
            return Err(ProviderError::Delete {
                kind: ResourceKind::Network,
                id: id.to_string(),
                message: "network still has subnets or ports".to_string(),
            });
        }
        state
            .networks
            .remove(id)
            .ok_or_else(|| not_found(ResourceKind::Network, id))?;
        state.deleted.push((ResourceKind::Network, id.to_string()));
        Ok(())
    }

    fn delete_subnet(&self, id: &str) -> Result<(), ProviderError> {
        let mut state = self.lock();
        check_delete(&state, ResourceKind::Subnet, id)?;
        let subnet = state.subnets.get(id).ok_or_else(|| not_found(ResourceKind::Subnet, id))?;
        if !subnet.used.is_empty() {
            return Err(ProviderError::Delete {
                kind: ResourceKind::Subnet,
                id: id.to_string(),
                message: format!("{} addresses still in use", subnet.used.len()),
            });
        }
        state.subnets.remove(id);
        state.deleted.push((ResourceKind::Subnet, id.to_string()));
        Ok(())
    }

    fn delete_port(&self, id: &str) -> Result<(), ProviderError> {
        let mut state = self.lock();
        check_delete(&state, ResourceKind::Port, id)?;
        let port = state.ports.get(id).ok_or_else(|| not_found(ResourceKind::Port, id))?;
        if let Some(server_id) = &port.server_id {
            return Err(ProviderError::Delete {
                kind: ResourceKind::Port,
                id: id.to_string(),
                message: format!("port is bound to server {}", server_id),
            });
        }
        if let Some(port) = state.ports.remove(id) {
            for address in port.addresses {
                state.release_address(&port.network_id, address);
            }
        }
        state.deleted.push((ResourceKind::Port, id.to_string()));
        Ok(())
    }

    fn delete_server(&self, id: &str) -> Result<(), ProviderError> {
        let mut state = self.lock();
        check_delete(&state, ResourceKind::Server, id)?;
        let server = state.servers.remove(id).ok_or_else(|| not_found(ResourceKind::Server, id))?;
        for (network_id, address) in server.owned {
            state.release_address(&network_id, address);
        }
        for port_id in &server.ports {
            if let Some(port) = state.ports.get_mut(port_id) {
                port.server_id = None;
            }
        }
        state.deleted.push((ResourceKind::Server, id.to_string()));
        Ok(())
    }
}

fn check_delete(state: &CloudState, kind: ResourceKind, id: &str) -> Result<(), ProviderError> {
    if state.fail_delete.contains(&kind) {
        return Err(ProviderError::Delete {
            kind,
            id: id.to_string(),
            message: "injected provider failure".to_string(),
        });
    }
    Ok(())
}

fn not_found(kind: ResourceKind, id: &str) -> ProviderError {
    ProviderError::NotFound { kind, id: id.to_string() }
}

#[derive(Debug, Default)]
struct RemoteState {
    /// Failed probes left before an address starts answering
    pending: HashMap<IpAddr, u32>,
    down: HashSet<IpAddr>,
    blocked: HashSet<(String, IpAddr)>,
    closed_ports: HashSet<u16>,
    /// Addresses that answer pings but refuse SSH
    ssh_refused: HashSet<IpAddr>,
    loss: Option<(StdRng, f64)>,
    commands: Vec<(IpAddr, String)>,
    probes: usize,
}

impl RemoteState {
    fn reach(&mut self, origin: &ProbeOrigin, address: IpAddr) -> Result<(), String> {
        self.probes += 1;
        if self.down.contains(&address) {
            return Err("host unreachable".to_string());
        }
        if let Some(remaining) = self.pending.get_mut(&address) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err("no reply".to_string());
            }
        }
        if let Some(node_id) = origin.node_id() {
            if self.blocked.contains(&(node_id.to_string(), address)) {
                return Err("filtered".to_string());
            }
        }
        if let Some((rng, rate)) = self.loss.as_mut() {
            if rng.gen_bool(*rate) {
                return Err("packet lost".to_string());
            }
        }
        Ok(())
    }
}

/// In-memory remote execution provider
#[derive(Debug, Default)]
pub struct SimulatedRemote {
    state: Mutex<RemoteState>,
}

impl SimulatedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a random share of probes, reproducibly for a given seed
    pub fn with_loss(self, seed: u64, rate: f64) -> Self {
        let rate = rate.clamp(0.0, 1.0);
        if rate > 0.0 {
            self.lock().loss = Some((StdRng::seed_from_u64(seed), rate));
        }
        self
    }

    /// `address` fails the next `probes` probes, then answers
    pub fn converge_after(&self, address: IpAddr, probes: u32) {
        self.lock().pending.insert(address, probes);
    }

    /// `address` never answers
    pub fn take_down(&self, address: IpAddr) {
        self.lock().down.insert(address);
    }

    /// Traffic from `source` node to `address` is dropped
    pub fn block(&self, source: &str, address: IpAddr) {
        self.lock().blocked.insert((source.to_string(), address));
    }

    pub fn close_port(&self, port: u16) {
        self.lock().closed_ports.insert(port);
    }

    /// `address` stays pingable but every SSH session to it fails
    pub fn refuse_ssh(&self, address: IpAddr) {
        self.lock().ssh_refused.insert(address);
    }

    /// Commands run through `ssh_exec`, with their target address
    pub fn commands(&self) -> Vec<(IpAddr, String)> {
        self.lock().commands.clone()
    }

    /// Total number of probe calls answered so far
    pub fn probe_count(&self) -> usize {
        self.lock().probes
    }

    fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl RemoteExec for SimulatedRemote {
    fn ping(&self, origin: &ProbeOrigin, address: IpAddr, _count: u32, _ip_version: u8) -> Result<bool, ProviderError> {
        Ok(self.lock().reach(origin, address).is_ok())
    }

    fn ssh_exec(
        &self,
        origin: &ProbeOrigin,
        address: IpAddr,
        _credential: &str,
        command: &str,
    ) -> Result<SshOutput, ProviderError> {
        let mut state = self.lock();
        state
            .reach(origin, address)
            .map_err(|message| ProviderError::Remote { address, message })?;
        if state.ssh_refused.contains(&address) {
            return Err(ProviderError::Remote {
                address,
                message: "connection refused".to_string(),
            });
        }
        state.commands.push((address, command.to_string()));

        let stdout = match command.strip_prefix("sudo ").unwrap_or(command).strip_prefix("sysctl -w ") {
            Some(assignment) => assignment.replacen('=', " = ", 1),
            None => format!("host-{}", address),
        };
        Ok(SshOutput {
            stdout,
            stderr: String::new(),
        })
    }

    fn tcp_probe(&self, origin: &ProbeOrigin, address: IpAddr, port: u16, _timeout: Duration) -> Result<bool, ProviderError> {
        let mut state = self.lock();
        state
            .reach(origin, address)
            .map_err(|message| ProviderError::Remote { address, message })?;
        Ok(!state.closed_ports.contains(&port))
    }
}
