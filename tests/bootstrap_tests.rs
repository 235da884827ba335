
use std::sync::Arc;

use fleetrun::bootstrap::PODMAN_URL;
use fleetrun::router::MemoryConsole;
use fleetrun::{Cluster, FleetError};
use test_harness::{cluster_config, MockFleet, NodeBehavior};

fn commands_on(fleet: &MockFleet, node: &str) -> Vec<String> {
    fleet
        .job_commands()
        .into_iter()
        .filter(|e| e.node == node)
        .map(|e| e.command)
        .collect()
}

#[tokio::test]
async fn test_setup_runs_steps_in_order() {
    let fleet = MockFleet::new();
    let cluster = Cluster::new(&cluster_config(1), Arc::new(fleet.clone()));
    let console = MemoryConsole::new();

    cluster.setup(console.as_ref()).await.unwrap();

    let commands = commands_on(&fleet, "node-1");
    assert_eq!(commands.len(), 11, "{commands:#?}");
    assert_eq!(commands[0], "hostname");
    assert_eq!(commands[1], "which curl");
    assert_eq!(commands[2], "sudo -n true");
    assert_eq!(commands[3], format!("curl -fsSL -o podman.tar.gz {}", PODMAN_URL));
    assert_eq!(commands[4], "mkdir -p ~/podman-bin && tar -xzf podman.tar.gz -C ~/podman-bin");
    assert_eq!(commands[5], "find ~/podman-bin -name conmon");
    assert_eq!(commands[6], "find ~/podman-bin -name crun");
    assert!(commands[7].contains("cat <<'EOT' > /home/node-1/.config/containers/containers.conf"));
    assert!(commands[7].contains("runtime = \"/home/node-1/podman-bin/bin/crun\""));
    assert!(commands[7].contains("conmon_path = [\"/home/node-1/podman-bin/bin/conmon\"]"));
    assert!(commands[8].contains("/home/node-1/.config/containers/policy.json"));
    assert!(commands[9].ends_with("podman --version"));
    assert!(commands[10].ends_with("podman run --rm docker.io/library/hello-world"));

    let app = console.app_output_text();
    assert!(app.contains("Setting up server: node-1\n"));
    assert!(app.contains("Sudo permission granted on node-1"));
    assert!(app.contains("Setup complete for node-1\n"));
}

#[tokio::test]
async fn test_setup_visits_nodes_sequentially() {
    let fleet = MockFleet::new();
    let cluster = Cluster::new(&cluster_config(3), Arc::new(fleet.clone()));

    cluster.setup(MemoryConsole::new().as_ref()).await.unwrap();

    let order: Vec<String> = fleet.executed().into_iter().map(|e| e.node).collect();
    let first_node_2 = order.iter().position(|n| n == "node-2").unwrap();
    let last_node_1 = order.iter().rposition(|n| n == "node-1").unwrap();
    assert!(last_node_1 < first_node_2);
    assert_eq!(fleet.connects(), vec!["node-1", "node-2", "node-3"]);
}

#[tokio::test]
async fn test_missing_sudo_stops_setup() {
    let fleet = MockFleet::new().with_node(
        "node-2",
        NodeBehavior {
            fail_on: Some("sudo -n true".to_string()),
            ..Default::default()
        },
    );
    let cluster = Cluster::new(&cluster_config(3), Arc::new(fleet.clone()));

    let err = cluster.setup(MemoryConsole::new().as_ref()).await.unwrap_err();

    match &err {
        FleetError::Bootstrap { node, source } => {
            assert_eq!(node, "node-2");
            assert!(matches!(**source, FleetError::RemoteCommand { .. }));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(commands_on(&fleet, "node-2")
        .iter()
        .all(|c| !c.starts_with("curl")));
    assert!(commands_on(&fleet, "node-3").is_empty());
}

#[tokio::test]
async fn test_unreachable_node_stops_setup() {
    let fleet = MockFleet::new().with_node(
        "node-1",
        NodeBehavior {
            refuse_connect: true,
            ..Default::default()
        },
    );
    let cluster = Cluster::new(&cluster_config(2), Arc::new(fleet.clone()));

    let err = cluster.setup(MemoryConsole::new().as_ref()).await.unwrap_err();
    assert!(err.to_string().contains("node-1"));
    assert!(fleet.executed().is_empty());
}
