//! Run configuration.
//!
//! Mirrors the YAML file the binary is started with. Every section except
//! `general`, `networks` and `topology` may be omitted.

use ipnetwork::{IpNetwork, Ipv4Network};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::matrix::{Expectation, SweepSettings};
use crate::network::{NetworkClass, SubnetPlan};
use crate::probe::{ProbeKind, ProbeSettings, RetryPolicy};
use crate::topology::{BuildSettings, TopologyVariant};

/// Resource names are built from this prefix, so it must be a valid name start
pub const NAME_PREFIX_PATTERN: &str = "^[a-z][a-z0-9-]*$";

/// Top-level configuration structure that mirrors the YAML configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub networks: NetworksConfig,
    pub topology: TopologyConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    /// Budget for nodes to answer on every attached network after a build
    #[serde(default = "default_convergence")]
    pub convergence: RetryPolicy,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub teardown: TeardownConfig,
    #[serde(default)]
    pub expect: Expectation,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Default log filter, overridden by RUST_LOG
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Prefix of every created resource name
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,
    /// Keypair injected into servers and used to log into them
    pub keypair: String,
}

/// A pre-existing network shared by all nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedNetwork {
    pub id: String,
    pub cidr: IpNetwork,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworksConfig {
    #[serde(default)]
    pub public: Option<SharedNetwork>,
    #[serde(default)]
    pub private: Option<SharedNetwork>,
    /// Subnet of the isolated network of a flat mesh
    #[serde(default = "default_isolated_cidr")]
    pub isolated_cidr: Ipv4Network,
    /// First spoke block; the following spokes take the next blocks of the same size
    #[serde(default = "default_spoke_cidr")]
    pub spoke_cidr: Ipv4Network,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub variant: TopologyVariant,
    /// Mesh members, or spokes for spoke-and-hub
    pub node_count: usize,
    #[serde(default = "default_network_classes")]
    pub network_classes: Vec<NetworkClass>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Probe kinds swept over every network class
    #[serde(default = "default_probe_kinds")]
    pub kinds: Vec<ProbeKind>,
    #[serde(flatten)]
    pub settings: ProbeSettings,
    /// Per-pair retry during a sweep
    #[serde(default)]
    pub retry: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Worker threads, 0 for the rayon default
    #[serde(default)]
    pub workers: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownConfig {
    /// Leave the resources of a failed build in place for inspection
    #[serde(default = "default_true")]
    pub keep_on_failure: bool,
    /// Delete everything once the sweeps are done
    #[serde(default = "default_true")]
    pub release_after_run: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_name_prefix() -> String {
    "topoprobe".to_string()
}

fn block(base: Ipv4Addr, prefix: u8) -> Ipv4Network {
    // A host route never plans, so a bad default would fail validation
    Ipv4Network::new(base, prefix).unwrap_or_else(|_| Ipv4Network::from(base))
}

fn default_isolated_cidr() -> Ipv4Network {
    block(Ipv4Addr::new(10, 100, 0, 0), 24)
}

fn default_spoke_cidr() -> Ipv4Network {
    block(Ipv4Addr::new(10, 200, 0, 0), 28)
}

fn default_network_classes() -> Vec<NetworkClass> {
    vec![NetworkClass::Public]
}

fn default_probe_kinds() -> Vec<ProbeKind> {
    vec![ProbeKind::Ping]
}

fn default_convergence() -> RetryPolicy {
    RetryPolicy::fixed(30, Duration::from_secs(10))
}

fn default_sweep_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_true() -> bool {
    true
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            kinds: default_probe_kinds(),
            settings: ProbeSettings::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl Default for SweepConfig {
    fn default() -> Self {
        SweepConfig {
            timeout: default_sweep_timeout(),
            workers: 0,
        }
    }
}

impl Default for TeardownConfig {
    fn default() -> Self {
        TeardownConfig {
            keep_on_failure: true,
            release_after_run: true,
        }
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid general configuration: {0}")]
    InvalidGeneral(String),
    #[error("Invalid network configuration: {0}")]
    InvalidNetwork(String),
    #[error("Invalid topology configuration: {0}")]
    InvalidTopology(String),
    #[error("Invalid probe configuration: {0}")]
    InvalidProbe(String),
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        let name_pattern = Regex::new(NAME_PREFIX_PATTERN)
            .map_err(|e| ValidationError::InvalidGeneral(format!("bad name pattern: {}", e)))?;
        if !name_pattern.is_match(&self.general.name_prefix) {
            return Err(ValidationError::InvalidGeneral(format!(
                "name_prefix '{}' must match {}",
                self.general.name_prefix, NAME_PREFIX_PATTERN
            )));
        }
        if self.general.keypair.is_empty() {
            return Err(ValidationError::InvalidGeneral("keypair cannot be empty".to_string()));
        }

        self.validate_topology()?;
        self.validate_networks()?;
        self.validate_probe()?;

        if self.convergence.max_attempts == 0 {
            return Err(ValidationError::InvalidTopology(
                "convergence.max_attempts must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    fn validate_topology(&self) -> Result<(), ValidationError> {
        let topology = &self.topology;
        if topology.node_count == 0 {
            return Err(ValidationError::InvalidTopology(
                "node_count must be at least 1".to_string(),
            ));
        }
        if topology.network_classes.is_empty() {
            return Err(ValidationError::InvalidTopology(
                "network_classes cannot be empty".to_string(),
            ));
        }
        if topology.variant == TopologyVariant::SpokeAndHub
            && !topology.network_classes.contains(&NetworkClass::Isolated)
        {
            return Err(ValidationError::InvalidTopology(
                "spoke_and_hub requires the isolated network class".to_string(),
            ));
        }
        Ok(())
    }

    fn validate_networks(&self) -> Result<(), ValidationError> {
        let classes = &self.topology.network_classes;
        if classes.contains(&NetworkClass::Public) && self.networks.public.is_none() {
            return Err(ValidationError::InvalidNetwork(
                "public network class requested but networks.public is not set".to_string(),
            ));
        }
        if classes.contains(&NetworkClass::Private) && self.networks.private.is_none() {
            return Err(ValidationError::InvalidNetwork(
                "private network class requested but networks.private is not set".to_string(),
            ));
        }
        for (name, cidr) in [
            ("isolated_cidr", self.networks.isolated_cidr),
            ("spoke_cidr", self.networks.spoke_cidr),
        ] {
            SubnetPlan::from_cidr(cidr)
                .map_err(|e| ValidationError::InvalidNetwork(format!("{} {}: {}", name, cidr, e)))?;
        }
        Ok(())
    }

    fn validate_probe(&self) -> Result<(), ValidationError> {
        let probe = &self.probe;
        if probe.kinds.is_empty() {
            return Err(ValidationError::InvalidProbe("kinds cannot be empty".to_string()));
        }
        if probe.retry.max_attempts == 0 {
            return Err(ValidationError::InvalidProbe(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if probe.kinds.contains(&ProbeKind::TcpScan) && probe.settings.tcp_ports.is_empty() {
            return Err(ValidationError::InvalidProbe(
                "tcp_scan needs at least one port in tcp_ports".to_string(),
            ));
        }
        if probe.kinds.contains(&ProbeKind::Ping) && probe.settings.ping_count == 0 {
            return Err(ValidationError::InvalidProbe("ping_count must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Settings for the topology builder
    pub fn build_settings(&self) -> BuildSettings {
        BuildSettings {
            name_prefix: self.general.name_prefix.clone(),
            keypair: self.general.keypair.clone(),
            public_network: self.networks.public.as_ref().map(|n| n.id.clone()),
            private_network: self.networks.private.as_ref().map(|n| n.id.clone()),
            isolated_cidr: self.networks.isolated_cidr,
            spoke_cidr: self.networks.spoke_cidr,
            convergence: self.convergence.clone(),
            ping_count: self.probe.settings.ping_count,
            retain_on_failure: self.teardown.keep_on_failure,
            enable_hub_forwarding: true,
        }
    }

    /// Settings for the matrix engine
    pub fn sweep_settings(&self) -> SweepSettings {
        SweepSettings {
            timeout: self.sweep.timeout,
            retry: self.probe.retry.clone(),
            workers: self.sweep.workers,
        }
    }
}
