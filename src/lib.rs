//! # TopoProbe - Virtual network topology builder and connectivity verifier
//!
//! This library provisions small virtual network topologies through a cloud
//! provider, waits for every node to come up on every attached network, and
//! then measures pairwise reachability between the nodes as connectivity
//! matrices.
//!
//! ## Overview
//!
//! Two topology shapes are supported:
//!
//! - **Flat mesh**: N nodes sharing the same networks, where every ordered
//!   pair of distinct nodes is probed.
//! - **Spoke and hub**: N spokes, each alone on its own isolated network, and
//!   one hub holding the gateway address of every spoke network. Only spoke to
//!   hub and hub to spoke pairs are probed.
//!
//! Probes run from the source node itself (ping, TCP port scan, SSH login),
//! retried under a bounded policy. Every created resource is recorded in a
//! ledger and torn down in dependency order at the end of a run, unless a
//! failed build is kept for inspection.
//!
//! ## Architecture
//!
//! - `config`: Typed YAML configuration and validation
//! - `config_loader`: Configuration file loading
//! - `network`: Network classes and IPv4 subnet planning
//! - `provider`: Cloud and remote execution provider traits, plus in-memory
//!   simulated implementations
//! - `node`: Nodes, the node registry and address resolution
//! - `probe`: Probe kinds, results and the retry poller
//! - `topology`: Topology types and the topology builder
//! - `ledger`: Created-resource tracking and teardown
//! - `matrix`: Connectivity sweeps, reports and expectations
//! - `orchestrator`: A complete run from configuration to report
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::path::Path;
//! use topoprobe::{config_loader, orchestrator};
//! use topoprobe::provider::SimulatedRemote;
//!
//! let config = config_loader::load_config(Path::new("topoprobe.yaml"))?;
//! let cloud = orchestrator::simulated_cloud(&config)?;
//! let remote = SimulatedRemote::new();
//!
//! let outcome = orchestrator::run(&config, &cloud, &remote, Path::new("out"), false)?;
//! println!("passed: {}", outcome.report.passed());
//! # Ok::<(), color_eyre::eyre::Error>(())
//! ```
//!
//! ## Configuration Format
//!
//! ```yaml
//! general:
//!   name_prefix: lab
//!   keypair: lab-key
//!
//! networks:
//!   public: { id: public-net, cidr: 172.24.4.0/24 }
//!   spoke_cidr: 10.200.0.0/28
//!
//! topology:
//!   variant: spoke_and_hub
//!   node_count: 4
//!   network_classes: [public, isolated]
//!
//! probe:
//!   kinds: [ping, ssh_login]
//!
//! expect:
//!   permitted: true
//! ```
//!
//! ## Error Handling
//!
//! Library modules return their own `thiserror` error enums. The loader, the
//! orchestrator and the binary wrap them with `color_eyre` context.

pub mod config;
pub mod config_loader;
pub mod ledger;
pub mod matrix;
pub mod network;
pub mod node;
pub mod orchestrator;
pub mod probe;
pub mod provider;
pub mod topology;
