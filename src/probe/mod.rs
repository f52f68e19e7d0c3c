//! Reachability probes.
//!
//! A probe runs one check from an origin against a target address and folds
//! whatever the remote execution provider returns into a `ProbeResult`.
//! Provider errors never escape a probe: they become `success = false` with
//! the error text as diagnostic.

pub mod kinds;
pub mod retry;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

use crate::network::NetworkClass;
use crate::provider::{ProbeOrigin, RemoteExec};

pub use kinds::{PingProbe, SshLoginProbe, TcpScanProbe};
pub use retry::{Backoff, Polled, RetryPoller, RetryPolicy};

/// Source id recorded for probes launched from the harness host
pub const HARNESS_ID: &str = "harness";

/// Diagnostic of pairs the sweep never got to
pub const TIMEOUT_DIAGNOSTIC: &str = "timeout";

/// Probe capability
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Ping,
    TcpScan,
    SshLogin,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::Ping => write!(f, "ping"),
            ProbeKind::TcpScan => write!(f, "tcp_scan"),
            ProbeKind::SshLogin => write!(f, "ssh_login"),
        }
    }
}

/// Outcome of one probe between an ordered pair of nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub source_node_id: String,
    pub target_node_id: String,
    pub network_class: NetworkClass,
    pub probe_kind: ProbeKind,
    pub success: bool,
    pub diagnostic: String,
}

impl ProbeResult {
    /// Result for a pair that was never probed before the sweep deadline
    pub fn timeout(source: &str, target: &str, class: NetworkClass, kind: ProbeKind) -> Self {
        ProbeResult {
            source_node_id: source.to_string(),
            target_node_id: target.to_string(),
            network_class: class,
            probe_kind: kind,
            success: false,
            diagnostic: TIMEOUT_DIAGNOSTIC.to_string(),
        }
    }
}

/// What a probe is aimed at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub node_id: String,
    pub address: IpAddr,
    /// Keypair for probes that log into the target
    pub credential: String,
}

/// A reachability check
pub trait Probe: Send + Sync {
    fn kind(&self) -> ProbeKind;

    fn execute(&self, origin: &ProbeOrigin, target: &ProbeTarget, class: NetworkClass) -> ProbeResult;

    /// Shape a result for this probe
    fn result(&self, origin: &ProbeOrigin, target: &ProbeTarget, class: NetworkClass, success: bool, diagnostic: String) -> ProbeResult {
        ProbeResult {
            source_node_id: origin.node_id().unwrap_or(HARNESS_ID).to_string(),
            target_node_id: target.node_id.clone(),
            network_class: class,
            probe_kind: self.kind(),
            success,
            diagnostic,
        }
    }
}

/// Parameters shared by all probe kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeSettings {
    #[serde(default = "default_ping_count")]
    pub ping_count: u32,
    #[serde(default = "default_tcp_ports")]
    pub tcp_ports: Vec<u16>,
    #[serde(default = "default_tcp_timeout", with = "humantime_serde")]
    pub tcp_timeout: Duration,
    #[serde(default = "default_ssh_command")]
    pub ssh_command: String,
}

fn default_ping_count() -> u32 {
    3
}

fn default_tcp_ports() -> Vec<u16> {
    vec![22]
}

fn default_tcp_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_ssh_command() -> String {
    "hostname".to_string()
}

impl Default for ProbeSettings {
    fn default() -> Self {
        ProbeSettings {
            ping_count: default_ping_count(),
            tcp_ports: default_tcp_ports(),
            tcp_timeout: default_tcp_timeout(),
            ssh_command: default_ssh_command(),
        }
    }
}

/// Build the probe implementing `kind`
pub fn build_probe<'a>(kind: ProbeKind, remote: &'a dyn RemoteExec, settings: &ProbeSettings) -> Box<dyn Probe + 'a> {
    match kind {
        ProbeKind::Ping => Box::new(PingProbe::new(remote, settings.ping_count)),
        ProbeKind::TcpScan => Box::new(TcpScanProbe::new(remote, settings.tcp_ports.clone(), settings.tcp_timeout)),
        ProbeKind::SshLogin => Box::new(SshLoginProbe::new(remote, &settings.ssh_command)),
    }
}
