#[cfg(test)]
mod connectivity_scenarios {
    use std::collections::HashSet;
    use std::fs;
    use std::net::IpAddr;
    use std::time::Duration;
    use tempfile::TempDir;

    use topoprobe::config::Config;
    use topoprobe::matrix::{fold_overall, render, Expectation, MatrixEngine, SweepSettings};
    use topoprobe::network::NetworkClass;
    use topoprobe::node::AddressResolver;
    use topoprobe::orchestrator::{self, REPORT_FILE};
    use topoprobe::probe::{ProbeKind, ProbeSettings, RetryPolicy, TIMEOUT_DIAGNOSTIC};
    use topoprobe::provider::{ResourceKind, SimulatedCloud, SimulatedRemote};
    use topoprobe::topology::{BuildContext, BuildSettings, TopologyBuilder, TopologyVariant};

    fn cloud() -> SimulatedCloud {
        SimulatedCloud::new()
            .with_shared_network("public-net", "172.24.4.0/24".parse().unwrap())
            .unwrap()
    }

    fn settings() -> BuildSettings {
        BuildSettings {
            name_prefix: "scenario".to_string(),
            keypair: "scenario-key".to_string(),
            public_network: Some("public-net".to_string()),
            private_network: None,
            isolated_cidr: "10.100.0.0/24".parse().unwrap(),
            spoke_cidr: "10.200.0.0/28".parse().unwrap(),
            convergence: RetryPolicy::fixed(5, Duration::ZERO),
            ping_count: 1,
            retain_on_failure: true,
            enable_hub_forwarding: true,
        }
    }

    fn engine(remote: &SimulatedRemote) -> MatrixEngine<'_> {
        MatrixEngine::new(remote, ProbeSettings::default(), SweepSettings::default()).unwrap()
    }

    fn config(yaml: &str) -> Config {
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();
        config
    }

    const MESH_CONFIG: &str = r#"
general:
  name_prefix: scenario
  keypair: scenario-key
networks:
  public: { id: public-net, cidr: 172.24.4.0/24 }
topology:
  variant: flat_mesh
  node_count: 3
  network_classes: [public, isolated]
probe:
  kinds: [ping, ssh_login]
convergence: { max_attempts: 3, interval: 0s }
"#;

    /// Three mesh nodes on the public network give every ordered pair once
    #[test]
    fn test_flat_mesh_public_ping() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        let builder = TopologyBuilder::new(&cloud, &remote, settings());
        let mut ctx = BuildContext::new();
        let topology = builder
            .build(&mut ctx, TopologyVariant::FlatMesh, 3, &[NetworkClass::Public])
            .unwrap();

        let matrix = engine(&remote).sweep(topology, NetworkClass::Public, ProbeKind::Ping);
        assert_eq!(matrix.len(), 6);
        assert_eq!(fold_overall(&matrix), Some(true));

        let pairs: HashSet<(String, String)> = matrix
            .results
            .iter()
            .map(|r| (r.source_node_id.clone(), r.target_node_id.clone()))
            .collect();
        assert_eq!(pairs.len(), 6);
        assert!(matrix.results.iter().all(|r| r.source_node_id != r.target_node_id));
    }

    /// Spokes only ever pair with the hub
    #[test]
    fn test_spoke_and_hub_isolated_ping() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        let builder = TopologyBuilder::new(&cloud, &remote, settings());
        let mut ctx = BuildContext::new();
        let topology = builder
            .build(&mut ctx, TopologyVariant::SpokeAndHub, 4, &[NetworkClass::Isolated])
            .unwrap();

        let hub = topology.hub.as_ref().unwrap();
        let gateways: Vec<IpAddr> = topology
            .isolated_networks
            .iter()
            .map(|n| IpAddr::V4(n.plan.gateway))
            .collect();
        assert_eq!(AddressResolver::resolve(hub, NetworkClass::Isolated).unwrap(), gateways.as_slice());

        let matrix = engine(&remote).sweep(topology, NetworkClass::Isolated, ProbeKind::Ping);
        assert_eq!(matrix.len(), 8);
        assert_eq!(matrix.overall(), Some(true));
        for result in &matrix.results {
            let spoke_to_spoke = result.source_node_id.starts_with("spoke-") && result.target_node_id.starts_with("spoke-");
            assert!(!spoke_to_spoke, "{} -> {}", result.source_node_id, result.target_node_id);
        }

        let table = render(&matrix);
        let spoke_row = table.lines().find(|l| l.starts_with("spoke-0")).unwrap();
        let cells: Vec<&str> = spoke_row.split_whitespace().collect();
        assert_eq!(cells, vec!["spoke-0", "ok", "---", ".", ".", "."]);
    }

    /// A closed port fails every spoke/hub cell and names the port
    #[test]
    fn test_spoke_and_hub_tcp_scan_with_closed_port() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        let builder = TopologyBuilder::new(&cloud, &remote, settings());
        let mut ctx = BuildContext::new();
        let topology = builder
            .build(&mut ctx, TopologyVariant::SpokeAndHub, 2, &[NetworkClass::Public, NetworkClass::Isolated])
            .unwrap();

        remote.close_port(80);
        let probe_settings = ProbeSettings {
            tcp_ports: vec![22, 80],
            ..ProbeSettings::default()
        };
        let engine = MatrixEngine::new(&remote, probe_settings, SweepSettings::default()).unwrap();
        let matrix = engine.sweep(topology, NetworkClass::Isolated, ProbeKind::TcpScan);

        assert_eq!(matrix.len(), 4);
        assert_eq!(matrix.overall(), Some(false));
        assert!(matrix
            .results
            .iter()
            .all(|r| r.probe_kind == ProbeKind::TcpScan && r.diagnostic == "22/open 80/closed"));
        assert_eq!(Expectation::default().mismatches(&matrix).len(), 4);

        let open_only = MatrixEngine::new(&remote, ProbeSettings::default(), SweepSettings::default()).unwrap();
        let matrix = open_only.sweep(topology, NetworkClass::Isolated, ProbeKind::TcpScan);
        assert_eq!(fold_overall(&matrix), Some(true));
    }

    #[test]
    fn test_single_node_has_no_overall_result() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        let builder = TopologyBuilder::new(&cloud, &remote, settings());
        let mut ctx = BuildContext::new();
        let topology = builder
            .build(&mut ctx, TopologyVariant::FlatMesh, 1, &[NetworkClass::Public])
            .unwrap();

        let matrix = engine(&remote).sweep(topology, NetworkClass::Public, ProbeKind::Ping);
        assert!(matrix.is_empty());
        assert_eq!(fold_overall(&matrix), None);
        assert_eq!(Expectation::default().verdict(&matrix), None);
    }

    #[test]
    fn test_rebuild_creates_nothing() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        let builder = TopologyBuilder::new(&cloud, &remote, settings());
        let mut ctx = BuildContext::new();
        let classes = [NetworkClass::Public, NetworkClass::Isolated];

        let first = builder.build(&mut ctx, TopologyVariant::SpokeAndHub, 2, &classes).unwrap().clone();
        let created = cloud.created().len();
        let second = builder.build(&mut ctx, TopologyVariant::SpokeAndHub, 2, &classes).unwrap();

        assert_eq!(&first, second);
        assert_eq!(cloud.created().len(), created);
    }

    #[test]
    fn test_teardown_releases_children_first() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        let builder = TopologyBuilder::new(&cloud, &remote, settings());
        let mut ctx = BuildContext::new();
        builder
            .build(&mut ctx, TopologyVariant::SpokeAndHub, 3, &[NetworkClass::Public, NetworkClass::Isolated])
            .unwrap();

        let errors = ctx.ledger.release_all(&cloud);
        assert!(errors.is_empty(), "{:?}", errors);

        let ranks: Vec<u8> = cloud.deleted().iter().map(|(kind, _)| kind.release_rank()).collect();
        assert!(ranks.windows(2).all(|w| w[0] <= w[1]), "{:?}", cloud.deleted());
        assert_eq!(cloud.live_count(ResourceKind::Server), 0);
        assert_eq!(cloud.live_count(ResourceKind::Port), 0);
        // Only the shared public network and its subnet survive
        assert_eq!(cloud.live_count(ResourceKind::Network), 1);
        assert_eq!(cloud.live_count(ResourceKind::Subnet), 1);
    }

    #[test]
    fn test_sweep_deadline_records_timeouts() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        let builder = TopologyBuilder::new(&cloud, &remote, settings());
        let mut ctx = BuildContext::new();
        let topology = builder
            .build(&mut ctx, TopologyVariant::FlatMesh, 3, &[NetworkClass::Public])
            .unwrap();

        let expired = SweepSettings {
            timeout: Duration::ZERO,
            ..SweepSettings::default()
        };
        let engine = MatrixEngine::new(&remote, ProbeSettings::default(), expired).unwrap();
        let matrix = engine.sweep(topology, NetworkClass::Public, ProbeKind::Ping);

        assert_eq!(matrix.len(), 6);
        assert!(matrix.results.iter().all(|r| !r.success && r.diagnostic == TIMEOUT_DIAGNOSTIC));
        assert_eq!(matrix.overall(), Some(false));
    }

    #[test]
    fn test_blocked_pair_is_a_mismatch() {
        let (cloud, remote) = (cloud(), SimulatedRemote::new());
        let builder = TopologyBuilder::new(&cloud, &remote, settings());
        let mut ctx = BuildContext::new();
        let topology = builder
            .build(&mut ctx, TopologyVariant::FlatMesh, 3, &[NetworkClass::Public])
            .unwrap();

        let target = topology.node("node-2").unwrap();
        remote.block("node-0", AddressResolver::first(target, NetworkClass::Public).unwrap());

        let matrix = engine(&remote).sweep(topology, NetworkClass::Public, ProbeKind::Ping);
        let mismatches = Expectation::default().mismatches(&matrix);
        assert_eq!(mismatches.len(), 1);
        assert_eq!(mismatches[0].source_node_id, "node-0");
        assert_eq!(mismatches[0].target_node_id, "node-2");
        assert_eq!(Expectation::permitting(false).mismatches(&matrix).len(), 5);
    }

    #[test]
    fn test_full_run_writes_report_and_releases() {
        let config = config(MESH_CONFIG);
        let cloud = orchestrator::simulated_cloud(&config).unwrap();
        let remote = SimulatedRemote::new();
        let output = TempDir::new().unwrap();

        let outcome = orchestrator::run(&config, &cloud, &remote, output.path(), false).unwrap();
        // public and isolated, each with ping and ssh_login
        assert_eq!(outcome.matrices.len(), 4);
        assert!(outcome.matrices.iter().all(|m| m.len() == 6));
        assert!(outcome.report.passed());
        assert!(outcome.left_in_place.is_empty());
        assert!(outcome.release_errors.is_empty());
        assert_eq!(cloud.live_count(ResourceKind::Server), 0);

        let report: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(output.path().join(REPORT_FILE)).unwrap()).unwrap();
        assert_eq!(report["variant"], "flat_mesh");
        assert_eq!(report["matrices"].as_array().unwrap().len(), 4);
        assert!(report["generated_at"].is_string());
    }

    #[test]
    fn test_keep_leaves_resources() {
        let config = config(MESH_CONFIG);
        let cloud = orchestrator::simulated_cloud(&config).unwrap();
        let remote = SimulatedRemote::new();
        let output = TempDir::new().unwrap();

        let outcome = orchestrator::run(&config, &cloud, &remote, output.path(), true).unwrap();
        // isolated network + subnet + 3 servers
        assert_eq!(outcome.left_in_place.len(), 5);
        assert_eq!(cloud.live_count(ResourceKind::Server), 3);
    }

    #[test]
    fn test_isolation_expectation_fails_on_reachable_mesh() {
        let mut config = config(MESH_CONFIG);
        config.expect = Expectation::permitting(false);
        let cloud = orchestrator::simulated_cloud(&config).unwrap();
        let remote = SimulatedRemote::new();
        let output = TempDir::new().unwrap();

        let outcome = orchestrator::run(&config, &cloud, &remote, output.path(), false).unwrap();
        assert!(!outcome.report.passed());
        assert!(outcome.report.matrices.iter().all(|m| m.mismatches.len() == 6));
    }

    #[test]
    fn test_failed_build_keeps_resources_for_inspection() {
        let config = config(MESH_CONFIG);
        let cloud = orchestrator::simulated_cloud(&config).unwrap();
        cloud.fail_creates_of(ResourceKind::Server);
        let remote = SimulatedRemote::new();
        let output = TempDir::new().unwrap();

        let err = orchestrator::run(&config, &cloud, &remote, output.path(), false).unwrap_err();
        assert!(format!("{:?}", err).contains("Topology build failed"));
        // The isolated network and its subnet stay next to the shared ones
        assert_eq!(cloud.live_count(ResourceKind::Network), 2);
        assert_eq!(cloud.live_count(ResourceKind::Subnet), 2);
        assert!(!output.path().join(REPORT_FILE).exists());
    }

    #[test]
    fn test_failed_build_is_released_when_not_kept() {
        let mut config = config(MESH_CONFIG);
        config.teardown.keep_on_failure = false;
        let cloud = orchestrator::simulated_cloud(&config).unwrap();
        cloud.fail_creates_of(ResourceKind::Server);
        let remote = SimulatedRemote::new();
        let output = TempDir::new().unwrap();

        assert!(orchestrator::run(&config, &cloud, &remote, output.path(), false).is_err());
        assert_eq!(cloud.live_count(ResourceKind::Network), 1);
        assert_eq!(cloud.live_count(ResourceKind::Subnet), 1);
    }
}
