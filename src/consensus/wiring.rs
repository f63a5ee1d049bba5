use crate::actor::WeakActorClient;
use crate::commitlog::{Index, InMemoryLog};
use crate::config::ClusterOptionsValidated;
use crate::consensus::election::{ElectionConfig, ElectionState};
use crate::consensus::engine::{ConsensusEngine, EngineParts};
use crate::consensus::local_state::{DurableLocalState, PersistentLocalState, VolatileLocalState};
use crate::consensus::log_entry::LogEntry;
use crate::consensus::members::Members;
use crate::consensus::raft_log::RaftLog;
use crate::consensus::snapshot::Snapshot;
use crate::consensus::state_machine::ClusterStateMachine;
use crate::consensus::transport::PeerTransport;
use crate::consensus::views::{ClusterStateListener, ClusterStateView};
use crate::consensus::{commit_stream, views, CommitStream, NodeId, Role, Term};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

pub(crate) struct EngineConfig {
    pub(crate) logger: slog::Logger,
    pub(crate) my_id: NodeId,
    pub(crate) my_address: String,
    pub(crate) cluster_name: String,
    pub(crate) seeds: Vec<(NodeId, String)>,
    pub(crate) restored: Option<Snapshot>,
    /// Where term and vote are kept across restarts. None keeps them in memory only.
    pub(crate) term_state_path: Option<PathBuf>,
    pub(crate) options: ClusterOptionsValidated,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) actor_client: WeakActorClient,
}

/// Everything a collaborator can observe from a running engine.
pub(crate) struct EngineOutputs {
    pub(crate) commit_stream: CommitStream,
    pub(crate) state_listener: ClusterStateListener,
    /// Snapshots taken by compaction or installed from a leader, to be persisted.
    pub(crate) snapshots: mpsc::UnboundedReceiver<Snapshot>,
}

/// Builds an engine, resuming from `restored` and the term state file when given. Must be called
/// inside a tokio runtime, since the initial follower timer starts right away.
pub(crate) fn create_engine(config: EngineConfig) -> io::Result<(ConsensusEngine<InMemoryLog<LogEntry>>, EngineOutputs)> {
    let mut members = Members::new(config.my_id.clone(), config.my_address.clone());
    let mut restored_term = Term::default();
    let mut state_machine = ClusterStateMachine::default();
    let mut snapshot_boundary = None;

    if let Some(snapshot) = &config.restored {
        let state = &snapshot.state;
        for (id, member) in state.members.iter() {
            members.restore(
                NodeId::new(id.clone()),
                member.address.clone(),
                Term::new(member.term),
                member.last_seen,
            );
        }
        restored_term = Term::new(state.current_term);
        state_machine = ClusterStateMachine::restore(state.config_version, state.config.clone());
        snapshot_boundary = Index::from_u64_opt(snapshot.index).map(|index| (Term::new(snapshot.term), index));
        slog::info!(
            config.logger,
            "Restored {} members, term {}, through index {}",
            state.members.len(),
            state.current_term,
            snapshot.index
        );
    }
    let local_state: Box<dyn PersistentLocalState + Send> = match config.term_state_path {
        Some(path) => Box::new(DurableLocalState::load(path, config.my_id.clone(), restored_term)?),
        None => Box::new(VolatileLocalState::new(config.my_id.clone(), restored_term)),
    };
    for (id, address) in config.seeds {
        if id != config.my_id {
            members.insert_if_absent(id, address);
        }
    }

    let log = InMemoryLog::starting_after(snapshot_boundary.map(|(_, index)| index));
    let raft_log = RaftLog::new(log, snapshot_boundary);
    let latest_snapshot = snapshot_boundary.and(config.restored);

    let election_state = ElectionState::new_follower(
        ElectionConfig {
            my_node_id: config.my_id.clone(),
            leader_heartbeat_duration: config.options.leader_heartbeat_duration,
            election_min_timeout: config.options.election_min_timeout,
            election_max_timeout: config.options.election_max_timeout,
        },
        config.actor_client.clone(),
    );

    let (commit_stream_publisher, commit_stream) = commit_stream::new();
    let (state_publisher, state_listener) =
        views::new(ClusterStateView::initial(config.my_id.as_str(), Role::Follower));
    let (snapshot_sink, snapshots) = mpsc::unbounded_channel();

    let engine = ConsensusEngine::new(EngineParts {
        logger: config.logger,
        my_address: config.my_address,
        cluster_name: config.cluster_name,
        members,
        local_state,
        election_state,
        raft_log,
        state_machine,
        latest_snapshot,
        options: config.options,
        transport: config.transport,
        actor_client: config.actor_client,
        commit_stream: commit_stream_publisher,
        state_publisher,
        snapshot_sink,
    });

    let outputs = EngineOutputs {
        commit_stream,
        state_listener,
        snapshots,
    };

    Ok((engine, outputs))
}
