use crate::actor::{ActorClient, EngineActor};
use crate::config::{ClusterOptions, ClusterOptionsValidated};
use crate::consensus::engine_api::{JoinClusterInput, JoinClusterOutput, ProposeError, ProposeInput};
use crate::consensus::in_memory_transport::InMemoryNetwork;
use crate::consensus::wiring::{create_engine, EngineConfig};
use crate::consensus::{ClusterStateListener, ClusterStateView, NodeId, Role, Term};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::convert::TryFrom;
use tokio::time::{self, Duration, Instant};

const CLUSTER: &str = "scenario";

struct TestNode {
    id: String,
    address: String,
    client: ActorClient,
    listener: ClusterStateListener,
}

impl TestNode {
    fn view(&self) -> ClusterStateView {
        self.listener.current()
    }

    async fn propose(&self, data: &'static [u8]) -> Result<u64, ProposeError> {
        let output = self
            .client
            .weak()
            .propose(ProposeInput {
                data: Bytes::from_static(data),
            })
            .await?;
        Ok(output.index.as_u64())
    }

    async fn wait_for<F>(&self, what: &str, predicate: F) -> ClusterStateView
    where
        F: FnMut(&ClusterStateView) -> bool,
    {
        let mut listener = self.listener.clone();
        match time::timeout(Duration::from_secs(10), listener.wait_for(predicate)).await {
            Ok(Some(view)) => view,
            _ => panic!("{} never saw: {} (last state {:?})", self.id, what, self.view()),
        }
    }
}

fn fast_options(snapshot_threshold: u64) -> ClusterOptionsValidated {
    ClusterOptionsValidated::try_from(ClusterOptions {
        leader_heartbeat_duration: Some(Duration::from_millis(20)),
        election_min_timeout: Some(Duration::from_millis(150)),
        election_max_timeout: Some(Duration::from_millis(300)),
        rpc_timeout: Some(Duration::from_millis(50)),
        snapshot_threshold: Some(snapshot_threshold),
        max_entries_per_append: Some(4),
        ..ClusterOptions::default()
    })
    .unwrap()
}

fn address_of(id: &str) -> String {
    format!("{}.test:7000", id)
}

fn spawn_node(network: &InMemoryNetwork, id: &str, seeds: &[&str], options: ClusterOptionsValidated) -> TestNode {
    let address = address_of(id);
    let (client, receiver) = ActorClient::new(64);
    let (engine, outputs) = create_engine(EngineConfig {
        logger: slog::Logger::root(slog::Discard, slog::o!()),
        my_id: NodeId::new(id),
        my_address: address.clone(),
        cluster_name: CLUSTER.to_string(),
        seeds: seeds
            .iter()
            .map(|seed| (NodeId::new(*seed), address_of(seed)))
            .collect(),
        restored: None,
        term_state_path: None,
        options,
        transport: network.transport_for(&address),
        actor_client: client.weak(),
    })
    .unwrap();
    network.register(&address, client.weak());
    tokio::spawn(EngineActor::new(receiver, engine).run_event_loop());

    TestNode {
        id: id.to_string(),
        address,
        client,
        listener: outputs.state_listener,
    }
}

fn spawn_cluster(network: &InMemoryNetwork, ids: &[&str], snapshot_threshold: u64) -> Vec<TestNode> {
    ids.iter()
        .map(|id| spawn_node(network, id, ids, fast_options(snapshot_threshold)))
        .collect()
}

/// Waits until exactly one node among `nodes` leads and every other one follows it in the same
/// term. Fails if two nodes ever claim leadership of the same term.
async fn await_stable_leader(nodes: &[&TestNode]) -> (usize, u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut leaders_by_term: HashMap<u64, HashSet<String>> = HashMap::new();

    loop {
        let views: Vec<ClusterStateView> = nodes.iter().map(|n| n.view()).collect();
        for view in views.iter().filter(|v| v.role == Role::Leader) {
            let leaders = leaders_by_term.entry(view.current_term).or_default();
            leaders.insert(view.node_id.clone());
            assert!(leaders.len() <= 1, "Two leaders in term {}: {:?}", view.current_term, leaders);
        }

        let leaders: Vec<usize> = (0..views.len()).filter(|&i| views[i].is_leader()).collect();
        if let &[leader] = leaders.as_slice() {
            let term = views[leader].current_term;
            let converged = views.iter().all(|v| {
                v.current_term == term && v.leader_id.as_deref() == Some(views[leader].node_id.as_str())
            });
            if converged {
                return (leader, term);
            }
        }

        assert!(Instant::now() < deadline, "No stable leader: {:?}", views);
        time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn three_seeded_nodes_elect_exactly_one_leader() {
    let network = InMemoryNetwork::default();
    let nodes = spawn_cluster(&network, &["n1", "n2", "n3"], 1000);

    let (leader, term) = await_stable_leader(&nodes.iter().collect::<Vec<_>>()).await;

    for (i, node) in nodes.iter().enumerate() {
        let view = node.view();
        assert_eq!(view.current_term, term);
        if i == leader {
            assert_eq!(view.role, Role::Leader);
        } else {
            assert_eq!(view.role, Role::Follower);
        }
    }

    // The new leader's Noop commits everywhere.
    for node in nodes.iter() {
        node.wait_for("first commit", |v| v.commit_index >= 1).await;
    }
}

#[tokio::test]
async fn follower_missing_heartbeats_becomes_candidate_for_next_term() {
    let network = InMemoryNetwork::default();
    let nodes = spawn_cluster(&network, &["n1", "n2", "n3"], 1000);
    let (leader, term) = await_stable_leader(&nodes.iter().collect::<Vec<_>>()).await;

    let follower = (0..nodes.len()).find(|&i| i != leader).unwrap();
    let others: Vec<&str> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != follower)
        .map(|(_, n)| n.address.as_str())
        .collect();
    let isolated = [nodes[follower].address.as_str()];
    network.partition(&[&isolated[..], &others[..]]);

    let view = nodes[follower]
        .wait_for("candidate role", |v| v.role == Role::Candidate)
        .await;
    assert_eq!(view.current_term, term + 1);
}

#[tokio::test]
async fn follower_redirects_proposals_to_leader() {
    let network = InMemoryNetwork::default();
    let nodes = spawn_cluster(&network, &["n1", "n2", "n3"], 1000);
    let (leader, _) = await_stable_leader(&nodes.iter().collect::<Vec<_>>()).await;
    let follower = (0..nodes.len()).find(|&i| i != leader).unwrap();

    match nodes[follower].propose(b"config").await {
        Err(ProposeError::LeaderRedirect(info)) => {
            assert_eq!(info.node_id.as_str(), nodes[leader].id);
            assert_eq!(info.address, nodes[leader].address);
        }
        other => panic!("Expected redirect, got {:?}", other),
    }

    let index = nodes[leader].propose(b"config").await.unwrap();
    for node in nodes.iter() {
        let view = node
            .wait_for("config applied", |v| v.commit_index >= index)
            .await;
        assert_eq!(view.config, Some(Bytes::from_static(b"config")));
        assert_eq!(view.config_version, 1);
    }
}

#[tokio::test]
async fn minority_log_is_overwritten_after_heal() {
    let network = InMemoryNetwork::default();
    let nodes = spawn_cluster(&network, &["n1", "n2", "n3"], 1000);
    let (old_leader, old_term) = await_stable_leader(&nodes.iter().collect::<Vec<_>>()).await;
    let stable_commit = nodes[old_leader]
        .wait_for("noop committed", |v| v.commit_index >= 1)
        .await
        .commit_index;

    let majority: Vec<&TestNode> = nodes
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != old_leader)
        .map(|(_, n)| n)
        .collect();
    let majority_addresses: Vec<&str> = majority.iter().map(|n| n.address.as_str()).collect();
    let isolated = [nodes[old_leader].address.as_str()];
    network.partition(&[&isolated[..], &majority_addresses[..]]);

    // The isolated leader still accepts writes but can never commit them.
    let minority_index = nodes[old_leader].propose(b"minority-1").await.unwrap();
    nodes[old_leader].propose(b"minority-2").await.unwrap();

    let (new_leader, new_term) = await_stable_leader(&majority).await;
    assert!(new_term > old_term);
    let committed_index = majority[new_leader].propose(b"majority").await.unwrap();
    majority[new_leader]
        .wait_for("majority commit", |v| v.commit_index >= committed_index)
        .await;
    assert_eq!(nodes[old_leader].view().commit_index, stable_commit);

    network.heal();

    let healed = nodes[old_leader]
        .wait_for("catch up with new leader", |v| {
            v.role == Role::Follower && v.current_term >= new_term && v.commit_index >= committed_index
        })
        .await;
    assert_eq!(healed.config, Some(Bytes::from_static(b"majority")));

    let leader_client = majority[new_leader].client.weak();
    let healed_client = nodes[old_leader].client.weak();
    for index in minority_index..=committed_index {
        let expected = leader_client.read_log_entry(index).await.unwrap().unwrap();
        let actual = healed_client.read_log_entry(index).await.unwrap().unwrap();
        assert_eq!((actual.term, &actual.payload), (expected.term, &expected.payload));
        assert!(actual.committed);
    }
}

#[tokio::test]
async fn joining_node_is_added_everywhere_and_caught_up_by_snapshot() {
    let network = InMemoryNetwork::default();
    let nodes = spawn_cluster(&network, &["n1", "n2", "n3"], 5);
    let (leader, _) = await_stable_leader(&nodes.iter().collect::<Vec<_>>()).await;

    let mut last_index = 0;
    for _ in 0..12 {
        last_index = nodes[leader].propose(b"config").await.unwrap();
    }
    nodes[leader]
        .wait_for("proposals committed", |v| v.commit_index >= last_index)
        .await;

    // Leader's log has been compacted well past the start, so the newcomer needs a snapshot.
    let newcomer = spawn_node(&network, "n4", &[], fast_options(5));
    let output = nodes[leader]
        .client
        .weak()
        .join_cluster(JoinClusterInput {
            node_id: NodeId::new("n4"),
            address: newcomer.address.clone(),
            cluster_name: CLUSTER.to_string(),
        })
        .await
        .unwrap();
    assert_eq!(
        output,
        JoinClusterOutput::Accepted {
            leader_id: NodeId::new(nodes[leader].id.as_str()),
            term: Term::new(nodes[leader].view().current_term),
        }
    );

    let caught_up = newcomer
        .wait_for("snapshot installed", |v| v.commit_index >= last_index)
        .await;
    assert_eq!(caught_up.config, Some(Bytes::from_static(b"config")));
    assert!(caught_up.members.contains_key("n1"));

    for node in nodes.iter() {
        node.wait_for("newcomer known", |v| v.members.contains_key("n4") && v.members.len() == 4)
            .await;
    }
}

#[tokio::test]
async fn wrong_cluster_join_is_rejected() {
    let network = InMemoryNetwork::default();
    let node = spawn_node(&network, "solo", &[], fast_options(1000));

    let result = node
        .client
        .weak()
        .join_cluster(JoinClusterInput {
            node_id: NodeId::new("stranger"),
            address: address_of("stranger"),
            cluster_name: "other".to_string(),
        })
        .await;
    assert!(result.is_err());
    assert!(!node.view().members.contains_key("stranger"));
}
