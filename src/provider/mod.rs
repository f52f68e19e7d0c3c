//! External collaborators.
//!
//! The cloud resource provider creates and deletes networks, subnets, ports
//! and servers. The remote execution provider runs ping, SSH and TCP probes
//! from a given origin. Both are consumed through traits so the topology
//! builder and matrix engine never depend on a concrete API client; the
//! `simulated` module provides in-memory implementations of both.

pub mod simulated;

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

pub use simulated::{SimulatedCloud, SimulatedRemote};

/// Kind of a provider-owned resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Server,
    Port,
    Subnet,
    Network,
}

impl ResourceKind {
    /// Teardown rank: children (servers, ports) before subnets before networks
    pub fn release_rank(&self) -> u8 {
        match self {
            ResourceKind::Server => 0,
            ResourceKind::Port => 1,
            ResourceKind::Subnet => 2,
            ResourceKind::Network => 3,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Server => write!(f, "server"),
            ResourceKind::Port => write!(f, "port"),
            ResourceKind::Subnet => write!(f, "subnet"),
            ResourceKind::Network => write!(f, "network"),
        }
    }
}

/// Errors returned by either provider
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("Failed to create {kind}: {message}")]
    Create { kind: ResourceKind, message: String },

    #[error("Failed to delete {kind} {id}: {message}")]
    Delete { kind: ResourceKind, id: String, message: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: ResourceKind, id: String },

    #[error("Remote execution against {address} failed: {message}")]
    Remote { address: IpAddr, message: String },
}

impl ProviderError {
    /// Resource kind the error refers to, if any
    pub fn kind(&self) -> Option<ResourceKind> {
        match self {
            ProviderError::Create { kind, .. }
            | ProviderError::Delete { kind, .. }
            | ProviderError::NotFound { kind, .. } => Some(*kind),
            ProviderError::Remote { .. } => None,
        }
    }
}

/// Explicit allocation pool of a subnet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationPool {
    pub start: IpAddr,
    pub end: IpAddr,
}

/// Fixed IP requested for a port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedIp {
    pub subnet_id: Option<String>,
    pub ip_address: IpAddr,
}

/// Cloud resource provider.
///
/// Every create call returns the new resource identifier. `create_server`
/// blocks until the server is active or the provider gives up.
pub trait CloudProvider: Send + Sync {
    fn create_network(&self, name: &str) -> Result<String, ProviderError>;

    fn create_subnet(
        &self,
        network_id: &str,
        ip_version: u8,
        cidr: IpNetwork,
        gateway_ip: Option<IpAddr>,
        allocation_pools: &[AllocationPool],
    ) -> Result<String, ProviderError>;

    fn create_port(&self, network_id: &str, fixed_ips: &[FixedIp]) -> Result<String, ProviderError>;

    fn create_server(
        &self,
        name: &str,
        keypair: &str,
        network_ids: &[String],
        port_ids: &[String],
    ) -> Result<String, ProviderError>;

    /// Addresses bound to a server, as (network id, address) in attachment order
    fn server_addresses(&self, server_id: &str) -> Result<Vec<(String, IpAddr)>, ProviderError>;

    fn delete_network(&self, id: &str) -> Result<(), ProviderError>;
    fn delete_subnet(&self, id: &str) -> Result<(), ProviderError>;
    fn delete_port(&self, id: &str) -> Result<(), ProviderError>;
    fn delete_server(&self, id: &str) -> Result<(), ProviderError>;

    /// Delete a resource by kind
    fn delete(&self, kind: ResourceKind, id: &str) -> Result<(), ProviderError> {
        match kind {
            ResourceKind::Server => self.delete_server(id),
            ResourceKind::Port => self.delete_port(id),
            ResourceKind::Subnet => self.delete_subnet(id),
            ResourceKind::Network => self.delete_network(id),
        }
    }
}

/// Where a remote probe is launched from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOrigin {
    /// The host running the verification itself
    Harness,
    /// A provisioned node, reached through its access address
    Node {
        node_id: String,
        address: IpAddr,
        credential: String,
    },
}

impl ProbeOrigin {
    pub fn node_id(&self) -> Option<&str> {
        match self {
            ProbeOrigin::Harness => None,
            ProbeOrigin::Node { node_id, .. } => Some(node_id),
        }
    }
}

impl fmt::Display for ProbeOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeOrigin::Harness => write!(f, "harness"),
            ProbeOrigin::Node { node_id, address, .. } => write!(f, "{} ({})", node_id, address),
        }
    }
}

/// Captured output of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Remote execution provider
pub trait RemoteExec: Send + Sync {
    fn ping(&self, origin: &ProbeOrigin, address: IpAddr, count: u32, ip_version: u8) -> Result<bool, ProviderError>;

    fn ssh_exec(
        &self,
        origin: &ProbeOrigin,
        address: IpAddr,
        credential: &str,
        command: &str,
    ) -> Result<SshOutput, ProviderError>;

    fn tcp_probe(&self, origin: &ProbeOrigin, address: IpAddr, port: u16, timeout: Duration) -> Result<bool, ProviderError>;
}

/// IP version number of an address (4 or 6)
pub fn ip_version(address: &IpAddr) -> u8 {
    match address {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 6,
    }
}
