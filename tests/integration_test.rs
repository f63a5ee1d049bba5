use bytes::Bytes;
use cluster::{ClusterConfig, ClusterHandle, ClusterModule, ClusterOptions, NetworkConfig, ProposeError, RpcConfig, SeedPeer};
use std::error::Error;
use std::path::Path;
use tokio::time::{self, Duration};

#[tokio::test]
async fn three_seeded_nodes_agree_on_one_leader() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let rpc_ports = [free_tcp_port(), free_tcp_port(), free_tcp_port()];
    let mut modules = Vec::with_capacity(3);
    for i in 0..3 {
        let config = config(i, &rpc_ports, false, dir.path());
        modules.push(ClusterModule::setup(logger(), config)?);
    }

    let (m1, rest) = modules.split_at_mut(1);
    let (m2, m3) = rest.split_at_mut(1);
    let (r1, r2, r3) = tokio::join!(m1[0].start(), m2[0].start(), m3[0].start());
    r1?;
    r2?;
    r3?;

    let handles: Vec<ClusterHandle> = modules.iter().map(|m| m.handle().unwrap()).collect();
    let leader_id = wait_for_agreed_leader(&handles).await;
    let leaders: Vec<_> = handles.iter().filter(|h| h.is_leader()).collect();
    assert_eq!(leaders.len(), 1);
    assert_eq!(leaders[0].cluster_state().node_id, leader_id);

    // Followers point at the leader instead of accepting.
    let follower = handles.iter().find(|h| !h.is_leader()).unwrap();
    match follower.propose(Bytes::from_static(b"ignored")).await {
        Err(ProposeError::LeaderRedirect(leader)) => assert_eq!(leader.node_id.as_str(), leader_id),
        other => panic!("Expected a redirect, got {:?}", other),
    }

    let config_blob = Bytes::from_static(b"{\"shards\":8}");
    leaders[0].propose(config_blob.clone()).await?;
    for handle in handles.iter() {
        let view = wait_for(handle, |v| v.config.as_ref() == Some(&config_blob)).await;
        assert_eq!(view.members.len(), 3);
    }

    for module in modules.iter_mut() {
        module.stop().await?;
    }
    for i in 0..3 {
        assert!(dir.path().join(format!("node-{}.json", i + 1)).exists());
    }

    Ok(())
}

#[tokio::test]
async fn restart_resumes_from_snapshot() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;

    let before = {
        let mut module = ClusterModule::setup(logger(), config(0, &[free_tcp_port()], true, dir.path()))?;
        module.start().await?;
        let handle = module.handle().unwrap();
        let proposed = handle.propose(Bytes::from_static(b"v1")).await?;
        let view = wait_for(&handle, |v| v.commit_index >= proposed.index).await;
        assert_eq!(proposed.index, 2);
        module.stop().await?;
        view
    };

    // Same identity and snapshot path, fresh ports.
    let rpc_port = free_tcp_port();
    let mut module = ClusterModule::setup(logger(), config(0, &[rpc_port], true, dir.path()))?;
    module.start().await?;
    let after = wait_for(&module.handle().unwrap(), |v| {
        v.is_leader() && v.commit_index > before.commit_index
    })
    .await;

    assert_eq!(before.commit_index, 2);
    assert_eq!(after.leader_id.as_deref(), Some("node-1"));
    assert_eq!(after.members.keys().collect::<Vec<_>>(), vec!["node-1"]);
    assert_eq!(after.members["node-1"].address, format!("127.0.0.1:{}", rpc_port));
    assert_eq!(after.config, Some(Bytes::from_static(b"v1")));
    assert_eq!(after.config_version, before.config_version);
    // One election after restart, and its Noop on top of the restored entries.
    assert_eq!(after.current_term, before.current_term + 1);
    assert_eq!(after.commit_index, before.commit_index + 1);
    assert_eq!(after.last_log_index, after.commit_index);
    assert!(dir.path().join("node-1.term.json").exists());

    module.stop().await?;
    Ok(())
}

async fn wait_for_agreed_leader(handles: &[ClusterHandle]) -> String {
    let deadline = time::Instant::now() + Duration::from_secs(15);
    loop {
        let views: Vec<_> = handles.iter().map(|h| h.cluster_state()).collect();
        if let Some(leader) = views[0].leader_id.clone() {
            let agreed = views
                .iter()
                .all(|v| v.leader_id.as_deref() == Some(leader.as_str()) && v.current_term == views[0].current_term);
            if agreed {
                return leader;
            }
        }
        assert!(time::Instant::now() < deadline, "No agreed leader: {:?}", views);
        time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_for<F>(handle: &ClusterHandle, predicate: F) -> cluster::ClusterStateView
where
    F: FnMut(&cluster::ClusterStateView) -> bool,
{
    time::timeout(Duration::from_secs(15), handle.listener().wait_for(predicate))
        .await
        .expect("Timed out waiting for cluster state")
        .expect("Engine exited")
}

fn config(index: usize, rpc_ports: &[u16], allow_bootstrap: bool, snapshot_dir: &Path) -> ClusterConfig {
    let seeds = rpc_ports
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != index)
        .map(|(i, port)| SeedPeer {
            node_id: node_id(i),
            address: format!("127.0.0.1:{}", port),
        })
        .collect();

    ClusterConfig {
        enabled: true,
        cluster_name: "integration".into(),
        node_id: node_id(index),
        rpc: RpcConfig {
            bind_host: "127.0.0.1".into(),
            port: rpc_ports[index],
            advertise_host: None,
        },
        // Unicast to ourselves; membership comes from seeds.
        network: NetworkConfig {
            bind_host: "127.0.0.1".into(),
            group: "127.0.0.1".into(),
            port: free_udp_port(),
            interface: None,
        },
        seeds,
        allow_bootstrap,
        snapshot_path: snapshot_dir.join(format!("{}.json", node_id(index))),
        options: ClusterOptions {
            leader_heartbeat_duration: Some(Duration::from_millis(50)),
            election_min_timeout: Some(Duration::from_millis(300)),
            election_max_timeout: Some(Duration::from_millis(600)),
            rpc_timeout: Some(Duration::from_millis(150)),
            announce_interval: Some(Duration::from_millis(200)),
            join_attempt_timeout: Some(Duration::from_millis(300)),
            join_deadline: Some(Duration::from_secs(10)),
            ..ClusterOptions::default()
        },
    }
}

fn node_id(index: usize) -> String {
    format!("node-{}", index + 1)
}

fn free_tcp_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

fn logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}
