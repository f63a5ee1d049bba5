use crate::commitlog::Log;
use crate::consensus::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer, ConsensusEngine,
    DiscoveryAnnouncement, ElectionTimeoutTick, HeartbeatTick, InstallSnapshotError, InstallSnapshotInput,
    InstallSnapshotOutput, InstallSnapshotReplyFromPeer, JoinClusterError, JoinClusterInput, JoinClusterOutput,
    LogEntry, LogEntryView, ProposeError, ProposeInput, ProposeOutput, RequestVoteError, RequestVoteInput,
    RequestVoteOutput, RequestVoteReplyFromPeer, Snapshot,
};
use std::io;
use tokio::sync::{mpsc, oneshot};

// Design choice: The engine inside this actor owns every piece of cluster state. RPC handlers,
//                timers, discovery and the directory reach it only through these events.
#[derive(Debug)]
pub(crate) enum Event {
    // Leader: Append to log and replicate.
    // Candidate/Follower: Redirect or reject.
    Propose(ProposeInput, Callback<Result<ProposeOutput, ProposeError>>),

    // All states: Grant vote if applicable. Step down on a newer term.
    RequestVote(
        RequestVoteInput,
        Callback<Result<RequestVoteOutput, RequestVoteError>>,
    ),
    RequestVoteReply(RequestVoteReplyFromPeer),

    // Candidate/Follower: Follow the sender, reset election timeout, reconcile log.
    AppendEntries(
        AppendEntriesInput,
        Callback<Result<AppendEntriesOutput, AppendEntriesError>>,
    ),
    AppendEntriesReply(AppendEntriesReplyFromPeer),

    InstallSnapshot(
        InstallSnapshotInput,
        Callback<Result<InstallSnapshotOutput, InstallSnapshotError>>,
    ),
    InstallSnapshotReply(InstallSnapshotReplyFromPeer),

    JoinCluster(
        JoinClusterInput,
        Callback<Result<JoinClusterOutput, JoinClusterError>>,
    ),
    DiscoveryAnnouncement(DiscoveryAnnouncement),

    // Leader: Replicate to one peer.
    HeartbeatTimer(HeartbeatTick),
    // Candidate/Follower: Start a new election if the tick is current.
    ElectionTimeout(ElectionTimeoutTick),
    StartElection,
    LivenessSweep,

    TakeSnapshot(Callback<Result<Snapshot, io::Error>>),
    ReadLogEntry(u64, Callback<Option<LogEntryView>>),
    Shutdown(Callback<Result<Snapshot, io::Error>>),
}

#[derive(Debug)]
pub(crate) struct Callback<T>(oneshot::Sender<T>);

impl<T> Callback<T> {
    pub(crate) fn send(self, message: T) {
        let _ = self.0.send(message);
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Consensus engine event loop has exited")]
pub(crate) struct ActorExited;

/// Owning handle: the event loop runs until every ActorClient is dropped.
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);

        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }
}

/// Non-owning handle given to timers, RPC servers and spawned peer calls, so none of them keep
/// the event loop alive on their own.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl WeakActorClient {
    pub(crate) async fn propose(&self, input: ProposeInput) -> Result<ProposeOutput, ProposeError> {
        self.call(|cb| Event::Propose(input, cb))
            .await
            .unwrap_or(Err(ProposeError::EngineExited))
    }

    pub(crate) async fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RequestVoteError> {
        self.call(|cb| Event::RequestVote(input, cb))
            .await
            .unwrap_or(Err(RequestVoteError::ActorExited))
    }

    pub(crate) async fn append_entries(
        &self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        self.call(|cb| Event::AppendEntries(input, cb))
            .await
            .unwrap_or(Err(AppendEntriesError::ActorExited))
    }

    pub(crate) async fn install_snapshot(
        &self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        self.call(|cb| Event::InstallSnapshot(input, cb))
            .await
            .unwrap_or(Err(InstallSnapshotError::ActorExited))
    }

    pub(crate) async fn join_cluster(&self, input: JoinClusterInput) -> Result<JoinClusterOutput, JoinClusterError> {
        self.call(|cb| Event::JoinCluster(input, cb))
            .await
            .unwrap_or(Err(JoinClusterError::ActorExited))
    }

    pub(crate) async fn take_snapshot(&self) -> Result<Result<Snapshot, io::Error>, ActorExited> {
        self.call(Event::TakeSnapshot).await
    }

    pub(crate) async fn read_log_entry(&self, index: u64) -> Result<Option<LogEntryView>, ActorExited> {
        self.call(|cb| Event::ReadLogEntry(index, cb)).await
    }

    pub(crate) async fn shutdown(&self) -> Result<Result<Snapshot, io::Error>, ActorExited> {
        self.call(Event::Shutdown).await
    }

    pub(crate) async fn request_vote_reply(&self, reply: RequestVoteReplyFromPeer) -> Result<(), ActorExited> {
        self.send(Event::RequestVoteReply(reply)).await
    }

    pub(crate) async fn append_entries_reply(&self, reply: AppendEntriesReplyFromPeer) -> Result<(), ActorExited> {
        self.send(Event::AppendEntriesReply(reply)).await
    }

    pub(crate) async fn install_snapshot_reply(&self, reply: InstallSnapshotReplyFromPeer) -> Result<(), ActorExited> {
        self.send(Event::InstallSnapshotReply(reply)).await
    }

    pub(crate) async fn discovery_announcement(&self, announcement: DiscoveryAnnouncement) -> Result<(), ActorExited> {
        self.send(Event::DiscoveryAnnouncement(announcement)).await
    }

    pub(crate) async fn heartbeat_timer(&self, tick: HeartbeatTick) -> Result<(), ActorExited> {
        self.send(Event::HeartbeatTimer(tick)).await
    }

    pub(crate) async fn election_timeout(&self, tick: ElectionTimeoutTick) -> Result<(), ActorExited> {
        self.send(Event::ElectionTimeout(tick)).await
    }

    pub(crate) async fn start_election(&self) -> Result<(), ActorExited> {
        self.send(Event::StartElection).await
    }

    pub(crate) async fn liveness_sweep(&self) -> Result<(), ActorExited> {
        self.send(Event::LivenessSweep).await
    }

    async fn call<T, F>(&self, event_fn: F) -> Result<T, ActorExited>
    where
        F: FnOnce(Callback<T>) -> Event,
    {
        let (tx, rx) = oneshot::channel();
        self.send(event_fn(Callback(tx))).await?;

        rx.await.map_err(|_| ActorExited)
    }

    async fn send(&self, event: Event) -> Result<(), ActorExited> {
        let sender = self.sender.upgrade().ok_or(ActorExited)?;
        sender.send(event).await.map_err(|_| ActorExited)
    }
}

/// EngineActor is the consensus engine in actor model.
pub(crate) struct EngineActor<L: Log<LogEntry>> {
    receiver: mpsc::Receiver<Event>,
    engine: ConsensusEngine<L>,
}

impl<L: Log<LogEntry> + 'static> EngineActor<L> {
    pub(crate) fn new(receiver: mpsc::Receiver<Event>, engine: ConsensusEngine<L>) -> Self {
        EngineActor { receiver, engine }
    }

    pub(crate) async fn run_event_loop(mut self) {
        self.engine.publish_state();
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
            self.engine.publish_state();
        }
    }

    // This must NOT be async. Any long running work must be spawned on another task
    // and come back to this actor as an event.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Propose(input, callback) => callback.send(self.engine.handle_propose(input)),
            Event::RequestVote(input, callback) => callback.send(self.engine.handle_request_vote(input)),
            Event::RequestVoteReply(reply) => self.engine.handle_request_vote_reply(reply),
            Event::AppendEntries(input, callback) => callback.send(self.engine.handle_append_entries(input)),
            Event::AppendEntriesReply(reply) => self.engine.handle_append_entries_reply(reply),
            Event::InstallSnapshot(input, callback) => callback.send(self.engine.handle_install_snapshot(input)),
            Event::InstallSnapshotReply(reply) => self.engine.handle_install_snapshot_reply(reply),
            Event::JoinCluster(input, callback) => callback.send(self.engine.handle_join(input)),
            Event::DiscoveryAnnouncement(announcement) => self.engine.handle_discovery_announcement(announcement),
            Event::HeartbeatTimer(tick) => self.engine.handle_heartbeat_timer(tick),
            Event::ElectionTimeout(tick) => self.engine.handle_election_timeout(tick),
            Event::StartElection => self.engine.handle_start_election(),
            Event::LivenessSweep => self.engine.handle_liveness_sweep(),
            Event::TakeSnapshot(callback) => callback.send(self.engine.handle_take_snapshot()),
            Event::ReadLogEntry(index, callback) => callback.send(self.engine.handle_read_log_entry(index)),
            Event::Shutdown(callback) => callback.send(self.engine.handle_shutdown()),
        }
    }
}
