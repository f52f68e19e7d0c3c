//! Ping, TCP scan and SSH login probes.

use std::net::IpAddr;
use std::time::Duration;

use super::{Probe, ProbeKind, ProbeResult, ProbeTarget};
use crate::network::NetworkClass;
use crate::provider::{ip_version, ProbeOrigin, RemoteExec};

/// ICMP echo from the origin to the target
pub struct PingProbe<'a> {
    remote: &'a dyn RemoteExec,
    count: u32,
}

impl<'a> PingProbe<'a> {
    pub fn new(remote: &'a dyn RemoteExec, count: u32) -> Self {
        PingProbe { remote, count }
    }
}

impl Probe for PingProbe<'_> {
    fn kind(&self) -> ProbeKind {
        ProbeKind::Ping
    }

    fn execute(&self, origin: &ProbeOrigin, target: &ProbeTarget, class: NetworkClass) -> ProbeResult {
        let address = target.address;
        let (success, diagnostic) = match self.remote.ping(origin, address, self.count, ip_version(&address)) {
            Ok(true) => (true, format!("{} replied", address)),
            Ok(false) => (false, format!("no reply from {} after {} packets", address, self.count)),
            Err(e) => (false, e.to_string()),
        };
        log::debug!("ping {} -> {} [{}]: {}", origin, address, class, diagnostic);
        self.result(origin, target, class, success, diagnostic)
    }
}

/// TCP connect to each configured port; passes only when all are open
pub struct TcpScanProbe<'a> {
    remote: &'a dyn RemoteExec,
    ports: Vec<u16>,
    timeout: Duration,
}

impl<'a> TcpScanProbe<'a> {
    pub fn new(remote: &'a dyn RemoteExec, ports: Vec<u16>, timeout: Duration) -> Self {
        TcpScanProbe { remote, ports, timeout }
    }

    fn scan(&self, origin: &ProbeOrigin, address: IpAddr) -> (bool, String) {
        let mut all_open = !self.ports.is_empty();
        let mut states = Vec::with_capacity(self.ports.len());
        for port in &self.ports {
            match self.remote.tcp_probe(origin, address, *port, self.timeout) {
                Ok(true) => states.push(format!("{}/open", port)),
                Ok(false) => {
                    all_open = false;
                    states.push(format!("{}/closed", port));
                }
                Err(e) => {
                    all_open = false;
                    states.push(format!("{}/error ({})", port, e));
                }
            }
        }
        if states.is_empty() {
            return (false, "no ports to scan".to_string());
        }
        (all_open, states.join(" "))
    }
}

impl Probe for TcpScanProbe<'_> {
    fn kind(&self) -> ProbeKind {
        ProbeKind::TcpScan
    }

    fn execute(&self, origin: &ProbeOrigin, target: &ProbeTarget, class: NetworkClass) -> ProbeResult {
        let (success, diagnostic) = self.scan(origin, target.address);
        log::debug!("tcp scan {} -> {} [{}]: {}", origin, target.address, class, diagnostic);
        self.result(origin, target, class, success, diagnostic)
    }
}

/// SSH into the target with its keypair and run a command
pub struct SshLoginProbe<'a> {
    remote: &'a dyn RemoteExec,
    command: String,
}

impl<'a> SshLoginProbe<'a> {
    pub fn new(remote: &'a dyn RemoteExec, command: &str) -> Self {
        SshLoginProbe {
            remote,
            command: command.to_string(),
        }
    }
}

impl Probe for SshLoginProbe<'_> {
    fn kind(&self) -> ProbeKind {
        ProbeKind::SshLogin
    }

    fn execute(&self, origin: &ProbeOrigin, target: &ProbeTarget, class: NetworkClass) -> ProbeResult {
        let outcome = self
            .remote
            .ssh_exec(origin, target.address, &target.credential, &self.command);
        let (success, diagnostic) = match outcome {
            Ok(output) if output.stdout.trim().is_empty() => (true, output.stderr.trim().to_string()),
            Ok(output) => (true, output.stdout.trim().to_string()),
            Err(e) => (false, e.to_string()),
        };
        log::debug!("ssh {} -> {} [{}]: {}", origin, target.address, class, diagnostic);
        self.result(origin, target, class, success, diagnostic)
    }
}
