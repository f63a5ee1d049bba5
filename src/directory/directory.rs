use crate::actor::{ActorClient, EngineActor, Event, WeakActorClient};
use crate::config::{ClusterConfig, ClusterOptionsValidated, OptionsError, SeedPeer};
use crate::consensus::{
    create_engine, ClusterStateListener, CommitStream, DiscoveryAnnouncement, EngineConfig, JoinClusterInput, NodeId,
    PeerTransport, Snapshot, Term,
};
use crate::directory::join::{join_via_seeds, JoinOutcome, JoinPolicy};
use crate::directory::snapshot_store::{SharedDiagnostics, SnapshotStore};
use crate::directory::{ClusterHandle, SnapshotDiagnostics, SnapshotError};
use crate::discovery::{DiscoveryMessage, ReceivedAnnouncement};
use crate::peer::GrpcPeerTransport;
use std::convert::TryFrom;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER_SIZE: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error("Cluster directory was already opened")]
    AlreadyOpen,

    #[error("Failed to restore snapshot")]
    Snapshot(#[source] SnapshotError),

    #[error("Failed to restore term and vote")]
    TermState(#[source] io::Error),

    #[error("Seeds belong to cluster '{theirs}', not '{ours}'")]
    WrongCluster { ours: String, theirs: String },

    #[error("No seed let us join within {deadline:?} ({rounds} rounds)")]
    JoinTimedOut { deadline: Duration, rounds: u32 },

    #[error("No seeds to join and bootstrapping is not allowed")]
    NothingToJoin,

    #[error("No leader emerged within {0:?} of bootstrapping")]
    BootstrapTimedOut(Duration),

    #[error("Consensus engine exited while opening")]
    EngineExited,
}

/// Holds this node's view of the cluster. All state lives in the consensus engine; the directory
/// starts it, feeds it discovery traffic, and persists what it snapshots.
pub struct ClusterDirectory {
    logger: slog::Logger,
    my_id: NodeId,
    my_address: String,
    cluster_name: String,
    seeds: Vec<SeedPeer>,
    allow_bootstrap: bool,
    options: ClusterOptionsValidated,
    transport: Arc<dyn PeerTransport>,
    store: SnapshotStore,
    term_state_path: PathBuf,
    diagnostics: SharedDiagnostics,

    // None once closed.
    actor: Option<ActorClient>,
    weak_client: WeakActorClient,
    // Taken by open().
    pending_events: Option<mpsc::Receiver<Event>>,
    listener: Option<ClusterStateListener>,
    commit_stream: Option<CommitStream>,

    background: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ClusterDirectory {
    /// Builds a directory seeded with the configured peers. Nothing touches the network until
    /// [`ClusterDirectory::open`].
    pub fn new(logger: slog::Logger, config: &ClusterConfig) -> Result<Self, OptionsError> {
        let transport = Arc::new(GrpcPeerTransport::new(logger.new(slog::o!("Component" => "PeerTransport"))));
        Self::with_transport(logger, config, transport)
    }

    pub(crate) fn with_transport(
        logger: slog::Logger,
        config: &ClusterConfig,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<Self, OptionsError> {
        let options = ClusterOptionsValidated::try_from(config.options.clone())?;
        let (actor, pending_events) = ActorClient::new(EVENT_BUFFER_SIZE);
        let weak_client = actor.weak();
        let seeds = config
            .seeds
            .iter()
            .filter(|seed| seed.node_id != config.node_id)
            .cloned()
            .collect();

        Ok(ClusterDirectory {
            logger,
            my_id: NodeId::new(config.node_id.clone()),
            my_address: config.rpc.advertised_address(),
            cluster_name: config.cluster_name.clone(),
            seeds,
            allow_bootstrap: config.allow_bootstrap,
            options,
            transport,
            store: SnapshotStore::new(config.snapshot_path.clone()),
            term_state_path: config.term_state_path(),
            diagnostics: SharedDiagnostics::default(),
            actor: Some(actor),
            weak_client,
            pending_events: Some(pending_events),
            listener: None,
            commit_stream: None,
            background: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Handle the RPC server dispatches into. Calls queue up until the directory is opened.
    pub(crate) fn engine_client(&self) -> WeakActorClient {
        self.weak_client.clone()
    }

    pub(crate) fn options(&self) -> &ClusterOptionsValidated {
        &self.options
    }

    /// Starts the consensus engine from the last snapshot, then joins through the seeds or, when
    /// allowed, bootstraps a cluster of its own. Returns once a leader is known.
    pub async fn open(&mut self) -> Result<(), OpenError> {
        if self.pending_events.is_none() {
            return Err(OpenError::AlreadyOpen);
        }
        let restored = self.store.load().await.map_err(OpenError::Snapshot)?;
        let (engine, outputs) = create_engine(EngineConfig {
            logger: self.logger.new(slog::o!("Component" => "Engine")),
            my_id: self.my_id.clone(),
            my_address: self.my_address.clone(),
            cluster_name: self.cluster_name.clone(),
            seeds: self
                .seeds
                .iter()
                .map(|seed| (NodeId::new(seed.node_id.clone()), seed.address.clone()))
                .collect(),
            restored,
            term_state_path: Some(self.term_state_path.clone()),
            options: self.options.clone(),
            transport: self.transport.clone(),
            actor_client: self.weak_client.clone(),
        })
        .map_err(OpenError::TermState)?;
        let receiver = self.pending_events.take().ok_or(OpenError::AlreadyOpen)?;
        tokio::spawn(EngineActor::new(receiver, engine).run_event_loop());

        self.tasks.push(tokio::spawn(write_snapshots(
            self.logger.clone(),
            self.store.clone(),
            self.diagnostics.clone(),
            outputs.snapshots,
            self.background.clone(),
        )));
        self.tasks.push(tokio::spawn(sweep_liveness(
            self.logger.clone(),
            self.weak_client.clone(),
            self.options.liveness_timeout / 4,
            self.background.clone(),
        )));
        self.listener = Some(outputs.state_listener.clone());
        self.commit_stream = Some(outputs.commit_stream);

        self.join_or_bootstrap(outputs.state_listener).await
    }

    async fn join_or_bootstrap(&self, mut listener: ClusterStateListener) -> Result<(), OpenError> {
        if !self.seeds.is_empty() {
            let request = JoinClusterInput {
                node_id: self.my_id.clone(),
                address: self.my_address.clone(),
                cluster_name: self.cluster_name.clone(),
            };
            let policy = JoinPolicy {
                attempt_timeout: self.options.join_attempt_timeout,
                deadline: self.options.join_deadline,
                initial_backoff: self.options.join_initial_backoff,
                max_backoff: self.options.join_max_backoff,
            };
            let watched = listener.clone();
            let leader_known = || {
                let view = watched.current();
                let term = Term::new(view.current_term);
                view.leader_id.map(|id| (NodeId::new(id), term))
            };

            match join_via_seeds(&self.logger, self.transport.as_ref(), &self.seeds, &request, &policy, leader_known).await {
                JoinOutcome::Joined { leader_id, term } => {
                    slog::info!(self.logger, "Joined cluster '{}' led by {:?} in term {:?}", self.cluster_name, leader_id, term);
                    return Ok(());
                }
                JoinOutcome::WrongCluster { theirs } => {
                    return Err(OpenError::WrongCluster {
                        ours: self.cluster_name.clone(),
                        theirs,
                    });
                }
                JoinOutcome::TimedOut { rounds } if !self.allow_bootstrap => {
                    return Err(OpenError::JoinTimedOut {
                        deadline: self.options.join_deadline,
                        rounds,
                    });
                }
                JoinOutcome::TimedOut { rounds } => {
                    slog::warn!(self.logger, "No seed answered after {} rounds; bootstrapping", rounds);
                }
            }
        } else if !self.allow_bootstrap {
            return Err(OpenError::NothingToJoin);
        }

        self.weak_client
            .start_election()
            .await
            .map_err(|_| OpenError::EngineExited)?;

        let deadline = self.options.bootstrap_deadline;
        match time::timeout(deadline, listener.wait_for(|view| view.leader_id.is_some())).await {
            Ok(Some(view)) => {
                slog::info!(
                    self.logger,
                    "Cluster '{}' has leader {:?} in term {}",
                    self.cluster_name,
                    view.leader_id,
                    view.current_term
                );
                Ok(())
            }
            Ok(None) => Err(OpenError::EngineExited),
            Err(_) => Err(OpenError::BootstrapTimedOut(deadline)),
        }
    }

    /// Refreshes the sender's liveness. Duplicates are harmless; leadership is never changed here.
    pub async fn on_discovery_message(&self, source: SocketAddr, message: DiscoveryMessage) {
        forward_announcement(&self.logger, &self.weak_client, source, message).await;
    }

    /// Feeds announcements from the discovery listener into the engine until closed.
    pub(crate) fn pump_discovery(&mut self, announcements: mpsc::Receiver<ReceivedAnnouncement>) {
        self.tasks.push(tokio::spawn(pump_announcements(
            self.logger.clone(),
            self.weak_client.clone(),
            announcements,
            self.background.clone(),
        )));
    }

    /// Takes a consistent copy of the applied cluster state and writes it durably.
    pub async fn snapshot_cluster_state(&self) -> Result<Snapshot, SnapshotError> {
        if self.listener.is_none() || self.actor.is_none() {
            return Err(SnapshotError::EngineNotRunning);
        }
        let snapshot = self
            .weak_client
            .take_snapshot()
            .await
            .map_err(|_| SnapshotError::EngineNotRunning)?
            .map_err(SnapshotError::Capture)?;

        persist(&self.logger, &self.store, &self.diagnostics, &snapshot).await?;
        Ok(snapshot)
    }

    /// Stops the engine's timers and writes a final snapshot. A failed write is logged and recorded
    /// in diagnostics, then returned; the engine is stopped either way.
    pub async fn close(&mut self) -> Result<(), SnapshotError> {
        let actor = match self.actor.take() {
            Some(actor) => actor,
            None => return Ok(()),
        };

        let opened = self.listener.is_some();
        let final_snapshot = if opened {
            Some(actor.weak().shutdown().await)
        } else {
            None
        };

        self.background.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                slog::error!(self.logger, "Directory task failed: {:?}", e);
            }
        }
        drop(actor);

        match final_snapshot {
            None => Ok(()),
            Some(Ok(Ok(snapshot))) => persist(&self.logger, &self.store, &self.diagnostics, &snapshot).await,
            Some(Ok(Err(source))) => {
                let result = Err(SnapshotError::Capture(source));
                slog::error!(self.logger, "Failed to capture final snapshot: {:?}", result);
                self.diagnostics.record(0, &result);
                result
            }
            Some(Err(_)) => Err(SnapshotError::EngineNotRunning),
        }
    }

    pub fn diagnostics(&self) -> SnapshotDiagnostics {
        self.diagnostics.get()
    }

    /// Committed entries as they apply. Only one consumer; None after the first call.
    pub fn take_commit_stream(&mut self) -> Option<CommitStream> {
        self.commit_stream.take()
    }

    /// None until opened.
    pub fn handle(&self) -> Option<ClusterHandle> {
        self.listener
            .as_ref()
            .map(|listener| ClusterHandle::new(self.weak_client.clone(), listener.clone()))
    }
}

async fn persist(
    logger: &slog::Logger,
    store: &SnapshotStore,
    diagnostics: &SharedDiagnostics,
    snapshot: &Snapshot,
) -> Result<(), SnapshotError> {
    let result = store.save(snapshot).await;
    diagnostics.record(snapshot.index, &result);
    match &result {
        Ok(()) => slog::info!(logger, "Snapshot through index {} (term {}) written", snapshot.index, snapshot.term),
        Err(e) => slog::error!(logger, "Failed to write snapshot through index {}: {:?}", snapshot.index, e),
    }

    result
}

// Persists snapshots the engine hands over. A failed write waits for the next one.
async fn write_snapshots(
    logger: slog::Logger,
    store: SnapshotStore,
    diagnostics: SharedDiagnostics,
    mut snapshots: mpsc::UnboundedReceiver<Snapshot>,
    shutdown: CancellationToken,
) {
    loop {
        let snapshot = tokio::select! {
            _ = shutdown.cancelled() => return,
            snapshot = snapshots.recv() => match snapshot {
                Some(snapshot) => snapshot,
                None => return,
            },
        };
        let _ = persist(&logger, &store, &diagnostics, &snapshot).await;
    }
}

async fn sweep_liveness(logger: slog::Logger, client: WeakActorClient, period: Duration, shutdown: CancellationToken) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }
        if client.liveness_sweep().await.is_err() {
            slog::debug!(logger, "Liveness sweeps stopped; engine has exited");
            return;
        }
    }
}

async fn pump_announcements(
    logger: slog::Logger,
    client: WeakActorClient,
    mut announcements: mpsc::Receiver<ReceivedAnnouncement>,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => return,
            received = announcements.recv() => match received {
                Some(received) => received,
                None => return,
            },
        };

        if !forward_announcement(&logger, &client, received.source, received.message).await {
            return;
        }
    }
}

// False once the engine has exited.
async fn forward_announcement(
    logger: &slog::Logger,
    client: &WeakActorClient,
    source: SocketAddr,
    message: DiscoveryMessage,
) -> bool {
    slog::trace!(logger, "Discovery message from {}: {:?}", source, message);
    let announcement = DiscoveryAnnouncement {
        sender_id: NodeId::new(message.sender_id),
        sender_address: message.sender_address,
        cluster_name: message.cluster_name,
    };
    if client.discovery_announcement(announcement).await.is_err() {
        slog::debug!(logger, "Dropping discovery message from {}; engine has exited", source);
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterOptions, NetworkConfig, RpcConfig};
    use crate::consensus::{ClusterStateView, InMemoryNetwork, Role};
    use bytes::Bytes;
    use std::fs;
    use std::path::Path;

    fn config(id: &str, seeds: &[&str], allow_bootstrap: bool, snapshot_dir: &Path) -> ClusterConfig {
        ClusterConfig {
            enabled: true,
            cluster_name: "directory-test".into(),
            node_id: id.into(),
            rpc: RpcConfig {
                bind_host: format!("{}.test", id),
                port: 7000,
                advertise_host: None,
            },
            network: NetworkConfig {
                bind_host: "127.0.0.1".into(),
                group: "127.0.0.1".into(),
                port: 0,
                interface: None,
            },
            seeds: seeds
                .iter()
                .map(|seed| SeedPeer {
                    node_id: seed.to_string(),
                    address: format!("{}.test:7000", seed),
                })
                .collect(),
            allow_bootstrap,
            snapshot_path: snapshot_dir.join(format!("{}.json", id)),
            options: ClusterOptions {
                leader_heartbeat_duration: Some(Duration::from_millis(20)),
                election_min_timeout: Some(Duration::from_millis(150)),
                election_max_timeout: Some(Duration::from_millis(300)),
                rpc_timeout: Some(Duration::from_millis(50)),
                join_attempt_timeout: Some(Duration::from_millis(50)),
                join_deadline: Some(Duration::from_millis(400)),
                join_initial_backoff: Some(Duration::from_millis(10)),
                join_max_backoff: Some(Duration::from_millis(50)),
                bootstrap_deadline: Some(Duration::from_secs(5)),
                ..ClusterOptions::default()
            },
        }
    }

    fn directory(network: &InMemoryNetwork, config: &ClusterConfig) -> ClusterDirectory {
        let address = config.rpc.advertised_address();
        let directory = ClusterDirectory::with_transport(
            slog::Logger::root(slog::Discard, slog::o!()),
            config,
            network.transport_for(&address),
        )
        .unwrap();
        network.register(&address, directory.engine_client());
        directory
    }

    async fn wait_until<F>(handle: &ClusterHandle, predicate: F) -> ClusterStateView
    where
        F: FnMut(&ClusterStateView) -> bool,
    {
        time::timeout(Duration::from_secs(10), handle.listener().wait_for(predicate))
            .await
            .expect("condition never met")
            .expect("engine exited")
    }

    #[tokio::test]
    async fn lone_node_bootstraps_and_restarts_from_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let network = InMemoryNetwork::default();
        let config = config("n1", &[], true, dir.path());

        let mut first = directory(&network, &config);
        first.open().await.unwrap();
        let handle = first.handle().unwrap();
        wait_until(&handle, |view| view.is_leader()).await;

        let proposed = handle.propose(Bytes::from_static(b"shards=4")).await.unwrap();
        let before = wait_until(&handle, |view| view.commit_index >= proposed.index).await;
        first.close().await.unwrap();
        assert_eq!(first.diagnostics().snapshots_written, 1);

        let mut second = directory(&InMemoryNetwork::default(), &config);
        second.open().await.unwrap();
        let after = wait_until(&second.handle().unwrap(), |view| view.is_leader()).await;

        assert_eq!(after.members.keys().collect::<Vec<_>>(), before.members.keys().collect::<Vec<_>>());
        assert_eq!(after.config, before.config);
        assert_eq!(after.config_version, before.config_version);
        assert!(after.commit_index >= before.commit_index);
        assert!(after.current_term > before.current_term);
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn second_node_joins_through_seed() {
        let dir = tempfile::tempdir().unwrap();
        let network = InMemoryNetwork::default();

        let mut n1 = directory(&network, &config("n1", &[], true, dir.path()));
        n1.open().await.unwrap();
        let mut n2 = directory(&network, &config("n2", &["n1"], false, dir.path()));
        n2.open().await.unwrap();

        let expected = vec!["n1".to_string(), "n2".to_string()];
        for handle in [n1.handle().unwrap(), n2.handle().unwrap()].iter() {
            let view = wait_until(handle, |view| view.members.len() == 2 && view.leader_id.is_some()).await;
            assert_eq!(view.members.keys().cloned().collect::<Vec<_>>(), expected);
            assert_eq!(view.leader_id.as_deref(), Some("n1"));
        }
        assert_eq!(n2.handle().unwrap().cluster_state().role, Role::Follower);

        n2.close().await.unwrap();
        n1.close().await.unwrap();
    }

    #[tokio::test]
    async fn open_without_seeds_or_bootstrap_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut directory = directory(&InMemoryNetwork::default(), &config("n1", &[], false, dir.path()));

        assert!(matches!(directory.open().await, Err(OpenError::NothingToJoin)));
        assert!(matches!(directory.open().await, Err(OpenError::AlreadyOpen)));
        directory.close().await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_seeds_time_out() {
        let dir = tempfile::tempdir().unwrap();
        let mut directory = directory(&InMemoryNetwork::default(), &config("n1", &["gone"], false, dir.path()));

        match directory.open().await {
            Err(OpenError::JoinTimedOut { rounds, .. }) => assert!(rounds >= 1),
            other => panic!("Unexpected {:?}", other),
        }
        directory.close().await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_snapshot_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = config("n1", &[], true, dir.path());
        fs::write(&config.snapshot_path, b"garbage").unwrap();

        let mut directory = directory(&InMemoryNetwork::default(), &config);
        assert!(matches!(
            directory.open().await,
            Err(OpenError::Snapshot(SnapshotError::Decode { .. }))
        ));
    }

    #[tokio::test]
    async fn snapshot_before_open_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let directory = directory(&InMemoryNetwork::default(), &config("n1", &[], true, dir.path()));

        assert!(matches!(
            directory.snapshot_cluster_state().await,
            Err(SnapshotError::EngineNotRunning)
        ));
    }
}
