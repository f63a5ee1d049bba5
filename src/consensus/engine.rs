use crate::actor::WeakActorClient;
use crate::commitlog::{index_to_u64, Index, Log};
use crate::config::ClusterOptionsValidated;
use crate::consensus::command::ClusterCommand;
use crate::consensus::commit_stream::CommitStreamPublisher;
use crate::consensus::election::{quorum_match_index, CurrentLeader, ElectionState, PeerStateUpdate};
use crate::consensus::engine_api::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer, DiscoveryAnnouncement,
    ElectionTimeoutTick, HeartbeatTick, InstallSnapshotError, InstallSnapshotInput, InstallSnapshotOutput,
    InstallSnapshotReplyFromPeer, JoinClusterError, JoinClusterInput, JoinClusterOutput, PeerReplyError,
    ProposeError, ProposeInput, ProposeOutput, ReplicationDescriptor, RequestVoteError, RequestVoteInput,
    RequestVoteOutput, RequestVoteReplyFromPeer, TermOutOfDateInfo,
};
use crate::consensus::local_state::PersistentLocalState;
use crate::consensus::log_entry::LogEntry;
use crate::consensus::members::{Members, Observation};
use crate::consensus::raft_log::{EntryTerm, RaftLog};
use crate::consensus::snapshot::{PersistedClusterState, PersistedMember, Snapshot};
use crate::consensus::state_machine::{Applied, ClusterStateMachine};
use crate::consensus::transport::{PeerTarget, PeerTransport};
use crate::consensus::views::{ClusterStatePublisher, ClusterStateView, LogEntryView, NodeView};
use crate::consensus::{LeaderInfo, NodeId, Role, Term};
use bytes::Bytes;
use std::cmp;
use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

/// ConsensusEngine owns all cluster state on this node: term and vote, election stage, log,
/// membership and the replicated configuration. It is driven exclusively by the actor event loop,
/// so every method takes `&mut self` and none of them block. Outbound RPCs are spawned as tasks
/// which report back through the actor.
pub(crate) struct ConsensusEngine<L: Log<LogEntry>> {
    logger: slog::Logger,
    my_id: NodeId,
    my_address: String,
    cluster_name: String,
    members: Members,
    local_state: Box<dyn PersistentLocalState + Send>,
    election_state: ElectionState,
    raft_log: RaftLog<L>,
    state_machine: ClusterStateMachine,
    // Snapshot matching the log's compaction boundary; what we ship to peers that fell behind it.
    latest_snapshot: Option<Snapshot>,
    // Members the leader already proposed to remove, to avoid re-proposing on every sweep.
    pending_removals: HashSet<NodeId>,
    options: ClusterOptionsValidated,
    transport: Arc<dyn PeerTransport>,
    actor_client: WeakActorClient,
    commit_stream: CommitStreamPublisher,
    state_publisher: ClusterStatePublisher,
    snapshot_sink: mpsc::UnboundedSender<Snapshot>,
}

pub(crate) struct EngineParts<L: Log<LogEntry>> {
    pub(crate) logger: slog::Logger,
    pub(crate) my_address: String,
    pub(crate) cluster_name: String,
    pub(crate) members: Members,
    pub(crate) local_state: Box<dyn PersistentLocalState + Send>,
    pub(crate) election_state: ElectionState,
    pub(crate) raft_log: RaftLog<L>,
    pub(crate) state_machine: ClusterStateMachine,
    pub(crate) latest_snapshot: Option<Snapshot>,
    pub(crate) options: ClusterOptionsValidated,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) commit_stream: CommitStreamPublisher,
    pub(crate) state_publisher: ClusterStatePublisher,
    pub(crate) snapshot_sink: mpsc::UnboundedSender<Snapshot>,
}

impl<L: Log<LogEntry> + 'static> ConsensusEngine<L> {
    pub(crate) fn new(parts: EngineParts<L>) -> Self {
        ConsensusEngine {
            logger: parts.logger,
            my_id: parts.members.my_id().clone(),
            my_address: parts.my_address,
            cluster_name: parts.cluster_name,
            members: parts.members,
            local_state: parts.local_state,
            election_state: parts.election_state,
            raft_log: parts.raft_log,
            state_machine: parts.state_machine,
            latest_snapshot: parts.latest_snapshot,
            pending_removals: HashSet::new(),
            options: parts.options,
            transport: parts.transport,
            actor_client: parts.actor_client,
            commit_stream: parts.commit_stream,
            state_publisher: parts.state_publisher,
            snapshot_sink: parts.snapshot_sink,
        }
    }

    // ------- Proposals --------

    pub(crate) fn handle_propose(&mut self, input: ProposeInput) -> Result<ProposeOutput, ProposeError> {
        self.propose_command(ClusterCommand::UpdateConfig {
            data: input.data.to_vec(),
        })
    }

    fn propose_command(&mut self, command: ClusterCommand) -> Result<ProposeOutput, ProposeError> {
        // Leader check
        match self.election_state.current_leader() {
            CurrentLeader::Me => { /* carry on */ }
            CurrentLeader::Other(leader) => return Err(ProposeError::LeaderRedirect(leader)),
            CurrentLeader::Unknown => return Err(ProposeError::NoLeader),
        }

        let data = command.encode().map_err(ProposeError::Encoding)?;
        let term = self.local_state.current_term();
        let index = self
            .raft_log
            .append(LogEntry { term, data })
            .map_err(ProposeError::LocalIoError)?;
        slog::debug!(self.logger, "Appended {:?} at {:?}", command, index);

        for peer_id in self.members.peer_ids() {
            self.replicate_to_peer(&peer_id);
        }
        // A single node cluster is its own majority.
        self.advance_leader_commit();

        Ok(ProposeOutput { term, index })
    }

    // ------- RequestVote --------

    pub(crate) fn handle_request_vote(&mut self, input: RequestVoteInput) -> Result<RequestVoteOutput, RequestVoteError> {
        // Ensure candidate is known member.
        if !self.members.contains(&input.candidate_id) {
            return Err(RequestVoteError::CandidateNotInCluster);
        }
        self.members.observe(
            &input.candidate_id,
            &input.candidate_address,
            Some(input.candidate_term),
            Instant::now(),
        );

        // Read our local term/vote state as 1 atomic action.
        let (current_term, mut opt_voted_for) = self.local_state.voted_for_current_term();

        // 1. Reply false if term < currentTerm (§5.1)
        if input.candidate_term < current_term {
            slog::info!(self.logger, "Not granting vote. Client term is out of date.");
            return Err(RequestVoteError::RequestTermOutOfDate(TermOutOfDateInfo {
                current_term,
            }));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        if self.observe_term(input.candidate_term, None) {
            // A new term means we haven't voted in it yet.
            opt_voted_for = None;
        }
        let current_term = self.local_state.current_term();

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).
        if let Some(voted_for) = opt_voted_for {
            if *voted_for != input.candidate_id {
                slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
                return Ok(RequestVoteOutput {
                    vote_granted: false,
                    current_term,
                });
            }
        }

        if !self.is_candidate_log_gte_mine(input.candidate_last_log_entry) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return Ok(RequestVoteOutput {
                vote_granted: false,
                current_term,
            });
        }

        let cas_success = match self
            .local_state
            .store_vote_for_term_if_unvoted(input.candidate_term, input.candidate_id.clone())
        {
            Ok(stored) => stored,
            Err(e) => {
                slog::error!(self.logger, "Not granting vote. Failed to persist it: {:?}", e);
                return Ok(RequestVoteOutput {
                    vote_granted: false,
                    current_term,
                });
            }
        };
        if cas_success {
            slog::info!(self.logger, "Voting for {:?} in term {:?}.", input.candidate_id, input.candidate_term);
            // Granting a vote counts as hearing from a legitimate candidate.
            self.election_state.reset_timeout_if_follower();
            return Ok(RequestVoteOutput {
                vote_granted: true,
                current_term,
            });
        }

        // Lost the CAS: only grant if the winner was this same candidate (a retried request).
        if let (reread_current_term, Some(reread_voted_for)) = self.local_state.voted_for_current_term() {
            if reread_current_term == input.candidate_term && reread_voted_for.as_ref() == &input.candidate_id {
                return Ok(RequestVoteOutput {
                    vote_granted: true,
                    current_term,
                });
            }
        }

        Ok(RequestVoteOutput {
            vote_granted: false,
            current_term,
        })
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: Option<(Term, Index)>) -> bool {
        // > If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        match (self.raft_log.latest_entry(), candidate_last_entry) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some((my_term, my_index)), Some((candidate_term, candidate_index))) => {
                (candidate_term, candidate_index) >= (my_term, my_index)
            }
        }
    }

    pub(crate) fn handle_request_vote_reply(&mut self, reply: RequestVoteReplyFromPeer) {
        let current_term = self.local_state.current_term();
        if current_term != reply.term {
            slog::debug!(
                self.logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }

        match reply.result {
            Ok(output) => {
                self.members
                    .touch_if_known(&reply.peer_id, Some(output.current_term), Instant::now());
                if self.observe_term(output.current_term, None) {
                    return;
                }
                if !output.vote_granted {
                    slog::info!(self.logger, "Vote not granted from {:?} for term {:?}", reply.peer_id, reply.term);
                    return;
                }

                let num_votes_received = match self.election_state.add_vote_if_candidate(reply.peer_id) {
                    Some(v) => v,
                    None => {
                        slog::debug!(self.logger, "Received vote after election ended: {:?}", self.election_state);
                        return;
                    }
                };

                let num_members = self.members.len();
                slog::info!(
                    self.logger,
                    "Received {}/{} votes for term {:?}",
                    num_votes_received,
                    num_members,
                    reply.term,
                );
                if num_votes_received >= majority(num_members) {
                    self.become_leader(reply.term);
                }
            }
            Err(PeerReplyError::StaleTerm { new_term }) => {
                slog::info!(self.logger, "Peer {:?} is on newer term {:?}", reply.peer_id, new_term);
                self.members.touch_if_known(&reply.peer_id, Some(new_term), Instant::now());
                self.observe_term(new_term, None);
            }
            Err(PeerReplyError::NotInCluster) => {
                slog::warn!(self.logger, "Peer {:?} doesn't know us; not counting its vote", reply.peer_id);
            }
            Err(PeerReplyError::PeerMissingPreviousLogEntry { .. }) => {
                slog::warn!(self.logger, "Malformed RequestVote reply from {:?}", reply.peer_id);
            }
            Err(PeerReplyError::RetryableFailure(message)) => {
                if self.election_state.role() != Role::Candidate {
                    return;
                }
                slog::warn!(self.logger, "RequestVote to {:?} failed: {}", reply.peer_id, message);
                if let Some(target) = self.peer_target(&reply.peer_id) {
                    let input = self.new_request_vote_input(current_term);
                    tokio::task::spawn(Self::call_peer_request_vote(
                        self.logger.clone(),
                        self.transport.clone(),
                        target,
                        input,
                        self.options.rpc_timeout,
                        Some(self.options.rpc_timeout),
                        self.actor_client.clone(),
                        current_term,
                    ));
                }
            }
        }
    }

    // ------- Elections --------

    pub(crate) fn handle_election_timeout(&mut self, tick: ElectionTimeoutTick) {
        if !self.election_state.is_current_timeout(&tick) {
            slog::debug!(self.logger, "Ignoring stale election timeout {:?}", tick);
            return;
        }

        slog::info!(self.logger, "Election timeout fired. Election state: {:?}", self.election_state);
        self.start_election();
    }

    /// Bootstrap path: elect ourselves unless we're already leader or following a live leader.
    pub(crate) fn handle_start_election(&mut self) {
        if self.election_state.is_stopped() {
            return;
        }
        match self.election_state.current_leader() {
            CurrentLeader::Unknown => self.start_election(),
            CurrentLeader::Me | CurrentLeader::Other(_) => {
                slog::debug!(self.logger, "Not bootstrapping, leader is known: {:?}", self.election_state);
            }
        }
    }

    fn start_election(&mut self) {
        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let new_term = match self.local_state.increment_term_and_vote_for_self() {
            Ok(term) => term,
            Err(e) => {
                slog::error!(self.logger, "Not starting election. Failed to persist new term: {:?}", e);
                return;
            }
        };
        self.election_state.transition_to_candidate_and_vote_for_self();
        slog::info!(self.logger, "Started election for term {:?}", new_term);

        if majority(self.members.len()) <= 1 {
            self.become_leader(new_term);
            return;
        }

        for peer in self.members.peers() {
            let target = PeerTarget {
                id: peer.id.clone(),
                address: peer.address.clone(),
            };
            tokio::task::spawn(Self::call_peer_request_vote(
                self.logger.clone(),
                self.transport.clone(),
                target,
                self.new_request_vote_input(new_term),
                self.options.rpc_timeout,
                None,
                self.actor_client.clone(),
                new_term,
            ));
        }
    }

    fn become_leader(&mut self, term: Term) {
        self.election_state
            .transition_to_leader(term, self.members.peer_ids(), self.raft_log.latest_index());
        self.pending_removals.clear();
        slog::info!(self.logger, "Became leader for term {:?}", term);

        // Entries from earlier terms only commit once something from our own term does.
        if let Err(e) = self.propose_command(ClusterCommand::Noop) {
            slog::error!(self.logger, "Failed to append Noop as new leader: {:?}", e);
        }
    }

    fn new_request_vote_input(&self, term: Term) -> RequestVoteInput {
        RequestVoteInput {
            candidate_term: term,
            candidate_id: self.my_id.clone(),
            candidate_address: self.my_address.clone(),
            candidate_last_log_entry: self.raft_log.latest_entry(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn call_peer_request_vote(
        logger: slog::Logger,
        transport: Arc<dyn PeerTransport>,
        target: PeerTarget,
        input: RequestVoteInput,
        rpc_timeout: Duration,
        delay: Option<Duration>,
        callback: WeakActorClient,
        term: Term,
    ) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        slog::debug!(logger, "ClientWire - {:?}", input);
        let result = match tokio::time::timeout(rpc_timeout, transport.request_vote(&target, input)).await {
            Ok(result) => result,
            Err(_) => Err(PeerReplyError::RetryableFailure("Timed out calling RequestVote".into())),
        };
        slog::debug!(logger, "ClientWire - {:?}", result);

        let reply = RequestVoteReplyFromPeer {
            peer_id: target.id,
            term,
            result,
        };
        if callback.request_vote_reply(reply).await.is_err() {
            slog::debug!(logger, "Engine exited before RequestVote reply");
        }
    }

    // ------- AppendEntries --------

    pub(crate) fn handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        // 1. Reply false if term < currentTerm (§5.1)
        self.accept_leader_contact(input.leader_term, &input.leader_id, &input.leader_address)
            .map_err(AppendEntriesError::ClientTermOutOfDate)?;

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        if let Some((leader_prev_term, leader_prev_index)) = input.leader_previous_log_entry {
            match self
                .raft_log
                .entry_term(leader_prev_index)
                .map_err(AppendEntriesError::ServerIoError)?
            {
                EntryTerm::Present(term) if term == leader_prev_term => {}
                // Compacted entries are committed, so they match whatever the leader has.
                EntryTerm::Compacted => {}
                EntryTerm::Present(_) | EntryTerm::Missing => {
                    return Err(AppendEntriesError::ServerMissingPreviousLogEntry {
                        last_log_index: self.raft_log.latest_index(),
                    });
                }
            }
        }

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        let num_new_entries = input.new_entries.len();
        let mut next_entry_index = match input.leader_previous_log_entry {
            None => Index::start_index(),
            Some((_, leader_prev_index)) => leader_prev_index.plus(1),
        };
        for new_entry in input.new_entries {
            match self
                .raft_log
                .entry_term(next_entry_index)
                .map_err(AppendEntriesError::ServerIoError)?
            {
                EntryTerm::Compacted => {}
                EntryTerm::Present(term) if term == new_entry.term => {}
                existing => {
                    if let EntryTerm::Present(_) = existing {
                        if matches!(self.raft_log.commit_index(), Some(ci) if next_entry_index <= ci) {
                            return Err(AppendEntriesError::ConflictsWithCommitted(next_entry_index));
                        }
                        slog::info!(self.logger, "Truncating conflicting log suffix at {:?}", next_entry_index);
                        self.raft_log
                            .truncate(next_entry_index)
                            .map_err(AppendEntriesError::ServerIoError)?;
                    }

                    let appended_index = self
                        .raft_log
                        .append(new_entry)
                        .map_err(AppendEntriesError::ServerIoError)?;
                    assert_eq!(appended_index, next_entry_index, "Appended log entry to unexpected index.");
                }
            }

            next_entry_index = next_entry_index.plus(1);
        }

        // 5. If leaderCommit > commitIndex, set commitIndex = min(leaderCommit, index of last new entry)
        let matched_index = next_entry_index.checked_minus(1);
        if let (Some(leader_commit), Some(matched)) = (input.leader_commit_index, matched_index) {
            let new_commit_index = cmp::min(leader_commit, matched);
            if self.raft_log.ratchet_fwd_commit_index_if_changed(new_commit_index) {
                self.apply_committed();
            }
        }

        if num_new_entries > 0 {
            slog::debug!(self.logger, "Replicated {} entries, matched {:?}", num_new_entries, matched_index);
        }
        Ok(AppendEntriesOutput { matched_index })
    }

    pub(crate) fn handle_append_entries_reply(&mut self, reply: AppendEntriesReplyFromPeer) {
        let descriptor = reply.descriptor;
        let logger = self.logger.new(slog::o!(
            "Peer" => descriptor.peer_id.to_string(),
            "SeqNo" => descriptor.seq_no
        ));
        slog::debug!(logger, "AE reply from peer result: {:?}", reply.result);

        let update = match reply.result {
            Ok(_) => PeerStateUpdate::Replicated {
                previous_log_entry: descriptor.previous_log_entry_index,
                num_entries_replicated: descriptor.num_log_entries,
            },
            Err(e) => match self.peer_reply_error_update(&logger, &descriptor, e) {
                Some(update) => update,
                None => return,
            },
        };
        self.apply_peer_update(&logger, descriptor, update);
    }

    /// Translates a failed replication reply. None if we stepped down.
    fn peer_reply_error_update(
        &mut self,
        logger: &slog::Logger,
        descriptor: &ReplicationDescriptor,
        error: PeerReplyError,
    ) -> Option<PeerStateUpdate> {
        match error {
            PeerReplyError::StaleTerm { new_term } => {
                slog::warn!(logger, "Rejected by peer because my term is stale.");
                self.members
                    .touch_if_known(&descriptor.peer_id, Some(new_term), Instant::now());
                if self.observe_term(new_term, None) {
                    return None;
                }
                slog::warn!(logger, "Peer reported a stale term that isn't newer than ours.");
                Some(PeerStateUpdate::OtherError)
            }
            PeerReplyError::PeerMissingPreviousLogEntry { last_log_index } => {
                slog::info!(logger, "Peer is missing previous log entry; its log ends at {:?}", last_log_index);
                self.members.touch_if_known(&descriptor.peer_id, None, Instant::now());
                Some(PeerStateUpdate::PeerLogBehind { last_log_index })
            }
            PeerReplyError::NotInCluster => {
                slog::warn!(logger, "Peer doesn't think we're in the cluster");
                Some(PeerStateUpdate::OtherError)
            }
            PeerReplyError::RetryableFailure(message) => {
                slog::warn!(logger, "Replication failure: {}", message);
                Some(PeerStateUpdate::OtherError)
            }
        }
    }

    fn apply_peer_update(&mut self, logger: &slog::Logger, descriptor: ReplicationDescriptor, update: PeerStateUpdate) {
        if self.local_state.current_term() != descriptor.term {
            slog::debug!(logger, "Dropping reply for outdated term {:?}", descriptor.term);
            return;
        }
        if !matches!(update, PeerStateUpdate::OtherError) {
            self.members
                .touch_if_known(&descriptor.peer_id, Some(descriptor.term), Instant::now());
        }

        let latest_index = self.raft_log.latest_index();
        let leader_state = match self.election_state.leader_state_mut() {
            Some(leader_state) => leader_state,
            None => {
                slog::debug!(logger, "No longer leader");
                return;
            }
        };
        let peer_state = match leader_state.peer_state_mut(&descriptor.peer_id) {
            Some(peer_state) => peer_state,
            None => {
                slog::debug!(logger, "Peer is no longer tracked");
                return;
            }
        };

        let retry_now = !matches!(update, PeerStateUpdate::OtherError);
        peer_state.handle_replication_result(logger, descriptor.seq_no, update);
        let (next_index, _) = peer_state.next_and_previous_log_index();

        self.advance_leader_commit();

        // > If last log index ≥ nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        if retry_now && matches!(latest_index, Some(latest) if latest >= next_index) {
            self.replicate_to_peer(&descriptor.peer_id);
        }
    }

    fn advance_leader_commit(&mut self) {
        let leader_state = match self.election_state.leader_state() {
            Some(leader_state) => leader_state,
            None => return,
        };

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        let now = Instant::now();
        let mut acked = vec![self.raft_log.latest_index()];
        for peer in self.members.peers() {
            // Unreachable members stay in the denominator but can't count toward quorum.
            if self.members.is_reachable(&peer.id, now, self.options.liveness_timeout) {
                acked.push(leader_state.peer_matched(&peer.id));
            }
        }

        let tentative_commit_index = match quorum_match_index(acked, self.members.len()) {
            Some(index) => index,
            None => return,
        };
        match self
            .raft_log
            .ratchet_fwd_commit_index_if_valid(tentative_commit_index, self.local_state.current_term())
        {
            Ok(true) => self.apply_committed(),
            Ok(false) => {}
            Err(e) => slog::warn!(
                self.logger,
                "IO failure while confirming new commit index {:?}: {:?}",
                tentative_commit_index,
                e
            ),
        }
    }

    pub(crate) fn handle_heartbeat_timer(&mut self, tick: HeartbeatTick) {
        let current_term = self.local_state.current_term();
        if current_term != tick.term {
            slog::debug!(
                self.logger,
                "Received heartbeat tick for outdated term {:?}, current term: {:?}",
                tick.term,
                current_term
            );
            return;
        }

        if !self.members.contains(&tick.peer_id) {
            if let Some(leader_state) = self.election_state.leader_state_mut() {
                leader_state.remove_peer(&tick.peer_id);
            }
            return;
        }
        self.replicate_to_peer(&tick.peer_id);
    }

    /// Sends the peer whatever it's missing: log entries from its next index, or our snapshot if
    /// that index has been compacted away. At most one request per peer is in flight.
    fn replicate_to_peer(&mut self, peer_id: &NodeId) {
        let target = match self.peer_target(peer_id) {
            Some(target) => target,
            None => return,
        };
        let current_term = self.local_state.current_term();
        let commit_index = self.raft_log.commit_index();
        let snapshot_boundary = self.raft_log.snapshot_boundary();
        let max_entries = self.options.max_entries_per_append;

        let peer_state = match self
            .election_state
            .leader_state_mut()
            .and_then(|ls| ls.peer_state_mut(peer_id))
        {
            Some(peer_state) => peer_state,
            None => return,
        };
        if peer_state.has_outstanding_request() {
            slog::debug!(self.logger, "Request to {:?} still outstanding", peer_id);
            return;
        }
        let (next_index, previous_index) = peer_state.next_and_previous_log_index();

        if let Some((_, boundary_index)) = snapshot_boundary {
            if next_index <= boundary_index {
                let snapshot = match &self.latest_snapshot {
                    Some(snapshot) => snapshot.clone(),
                    None => {
                        slog::error!(self.logger, "Log is compacted through {:?} but no snapshot is held", boundary_index);
                        return;
                    }
                };
                let descriptor = ReplicationDescriptor {
                    peer_id: peer_id.clone(),
                    term: current_term,
                    seq_no: peer_state.next_seq_no(),
                    previous_log_entry_index: None,
                    num_log_entries: 0,
                };
                peer_state.reset_heartbeat_timer();
                slog::info!(self.logger, "Sending snapshot through {:?} to {:?}", snapshot.index, peer_id);

                let input = InstallSnapshotInput {
                    leader_term: current_term,
                    leader_id: self.my_id.clone(),
                    leader_address: self.my_address.clone(),
                    snapshot,
                };
                tokio::task::spawn(Self::call_peer_install_snapshot(
                    self.logger.clone(),
                    self.transport.clone(),
                    target,
                    input,
                    self.options.rpc_timeout,
                    self.actor_client.clone(),
                    descriptor,
                ));
                return;
            }
        }

        let previous_log_entry = match previous_index {
            None => None,
            Some(previous_index) => match self.raft_log.entry_term(previous_index) {
                Ok(EntryTerm::Present(term)) => Some((term, previous_index)),
                Ok(other) => {
                    slog::error!(self.logger, "Previous entry {:?} for peer is {:?}", previous_index, other);
                    return;
                }
                Err(e) => {
                    slog::error!(self.logger, "Failed to read log entry at index {:?}: {:?}", previous_index, e);
                    return;
                }
            },
        };

        let mut new_entries = Vec::new();
        let mut index = next_index;
        while new_entries.len() < max_entries {
            match self.raft_log.read(index) {
                Ok(Some(entry)) => new_entries.push(entry),
                Ok(None) => break,
                Err(e) => {
                    slog::error!(self.logger, "Failed to read log entry at index {:?}: {:?}", index, e);
                    return;
                }
            }
            index = index.plus(1);
        }

        let descriptor = ReplicationDescriptor {
            peer_id: peer_id.clone(),
            term: current_term,
            seq_no: peer_state.next_seq_no(),
            previous_log_entry_index: previous_index,
            num_log_entries: new_entries.len(),
        };
        peer_state.reset_heartbeat_timer();

        let input = AppendEntriesInput {
            leader_term: current_term,
            leader_id: self.my_id.clone(),
            leader_address: self.my_address.clone(),
            leader_previous_log_entry: previous_log_entry,
            leader_commit_index: commit_index,
            new_entries,
        };
        tokio::task::spawn(Self::call_peer_append_entries(
            self.logger.clone(),
            self.transport.clone(),
            target,
            input,
            self.options.rpc_timeout,
            self.actor_client.clone(),
            descriptor,
        ));
    }

    async fn call_peer_append_entries(
        logger: slog::Logger,
        transport: Arc<dyn PeerTransport>,
        target: PeerTarget,
        input: AppendEntriesInput,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        descriptor: ReplicationDescriptor,
    ) {
        slog::debug!(logger, "ClientWire - {:?}", input);
        let result = match tokio::time::timeout(rpc_timeout, transport.append_entries(&target, input)).await {
            Ok(result) => result,
            Err(_) => Err(PeerReplyError::RetryableFailure("Timed out calling AppendEntries".into())),
        };
        slog::debug!(logger, "ClientWire - {:?}", result);

        let reply = AppendEntriesReplyFromPeer { descriptor, result };
        if callback.append_entries_reply(reply).await.is_err() {
            slog::debug!(logger, "Engine exited before AppendEntries reply");
        }
    }

    // ------- InstallSnapshot --------

    pub(crate) fn handle_install_snapshot(
        &mut self,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, InstallSnapshotError> {
        self.accept_leader_contact(input.leader_term, &input.leader_id, &input.leader_address)
            .map_err(InstallSnapshotError::ClientTermOutOfDate)?;

        let snapshot = input.snapshot;
        let last_included = match Index::from_u64_opt(snapshot.index) {
            Some(index) => index,
            None => return Ok(InstallSnapshotOutput { matched_index: None }),
        };
        if matches!(self.raft_log.commit_index(), Some(ci) if ci >= last_included) {
            slog::debug!(self.logger, "Already hold everything through {:?}", last_included);
            return Ok(InstallSnapshotOutput {
                matched_index: Some(last_included),
            });
        }

        self.raft_log
            .install_snapshot(Term::new(snapshot.term), last_included)
            .map_err(InstallSnapshotError::ServerIoError)?;
        self.restore_from_snapshot(&snapshot, &input.leader_id);
        slog::info!(self.logger, "Installed snapshot through {:?} (term {})", last_included, snapshot.term);

        self.latest_snapshot = Some(snapshot.clone());
        if self.snapshot_sink.send(snapshot).is_err() {
            slog::warn!(self.logger, "Snapshot persistence has stopped");
        }

        // Entries kept past the snapshot may already be committed.
        self.apply_committed();

        Ok(InstallSnapshotOutput {
            matched_index: Some(last_included),
        })
    }

    fn restore_from_snapshot(&mut self, snapshot: &Snapshot, leader_id: &NodeId) {
        let state = &snapshot.state;
        self.state_machine = ClusterStateMachine::restore(state.config_version, state.config.clone());

        let snapshot_ids: HashSet<NodeId> = state.members.keys().map(NodeId::new).collect();
        let stale: Vec<NodeId> = self
            .members
            .peers()
            .map(|m| m.id.clone())
            .filter(|id| !snapshot_ids.contains(id) && id != leader_id)
            .collect();
        for id in stale {
            if let Some(removed) = self.members.remove(&id) {
                self.transport.forget_address(&removed.address);
            }
        }
        for (id, member) in state.members.iter() {
            let id = NodeId::new(id.clone());
            if !self.members.contains(&id) {
                self.members
                    .restore(id, member.address.clone(), Term::new(member.term), member.last_seen);
            }
        }
    }

    pub(crate) fn handle_install_snapshot_reply(&mut self, reply: InstallSnapshotReplyFromPeer) {
        let descriptor = reply.descriptor;
        let logger = self.logger.new(slog::o!(
            "Peer" => descriptor.peer_id.to_string(),
            "SeqNo" => descriptor.seq_no
        ));
        slog::debug!(logger, "InstallSnapshot reply from peer result: {:?}", reply.result);

        let update = match reply.result {
            Ok(_) => PeerStateUpdate::SnapshotInstalled {
                last_included: reply.last_included_index,
            },
            Err(e) => match self.peer_reply_error_update(&logger, &descriptor, e) {
                Some(update) => update,
                None => return,
            },
        };
        self.apply_peer_update(&logger, descriptor, update);
    }

    async fn call_peer_install_snapshot(
        logger: slog::Logger,
        transport: Arc<dyn PeerTransport>,
        target: PeerTarget,
        input: InstallSnapshotInput,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        descriptor: ReplicationDescriptor,
    ) {
        let last_included_index = Index::from_u64_opt(input.snapshot.index);
        slog::debug!(logger, "ClientWire - InstallSnapshot through {:?}", last_included_index);
        let result = match tokio::time::timeout(rpc_timeout, transport.install_snapshot(&target, input)).await {
            Ok(result) => result,
            Err(_) => Err(PeerReplyError::RetryableFailure("Timed out calling InstallSnapshot".into())),
        };
        slog::debug!(logger, "ClientWire - {:?}", result);

        let reply = InstallSnapshotReplyFromPeer {
            descriptor,
            last_included_index,
            result,
        };
        if callback.install_snapshot_reply(reply).await.is_err() {
            slog::debug!(logger, "Engine exited before InstallSnapshot reply");
        }
    }

    // ------- Membership --------

    pub(crate) fn handle_join(&mut self, input: JoinClusterInput) -> Result<JoinClusterOutput, JoinClusterError> {
        if input.cluster_name != self.cluster_name {
            slog::warn!(
                self.logger,
                "Rejecting join from {:?} for cluster '{}'",
                input.node_id,
                input.cluster_name
            );
            return Err(JoinClusterError::WrongCluster {
                expected: self.cluster_name.clone(),
            });
        }

        self.upsert_member(&input.node_id, &input.address);

        let term = self.local_state.current_term();
        Ok(match self.election_state.current_leader() {
            CurrentLeader::Me => JoinClusterOutput::Accepted {
                leader_id: self.my_id.clone(),
                term,
            },
            CurrentLeader::Other(leader) => JoinClusterOutput::Redirect { leader, term },
            CurrentLeader::Unknown => JoinClusterOutput::NoLeader { term },
        })
    }

    pub(crate) fn handle_discovery_announcement(&mut self, announcement: DiscoveryAnnouncement) {
        if announcement.cluster_name != self.cluster_name {
            slog::debug!(
                self.logger,
                "Dropping announcement for cluster '{}' from {:?}",
                announcement.cluster_name,
                announcement.sender_id
            );
            return;
        }
        if announcement.sender_id == self.my_id {
            return;
        }

        self.upsert_member(&announcement.sender_id, &announcement.sender_address);
    }

    /// Idempotent upsert keyed by node id. A leader also proposes newly seen nodes so the whole
    /// cluster learns about them.
    fn upsert_member(&mut self, id: &NodeId, address: &str) {
        match self.members.observe(id, address, None, Instant::now()) {
            Observation::Refreshed => {}
            Observation::Moved { previous_address } => {
                slog::info!(self.logger, "Member {:?} moved from {} to {}", id, previous_address, address);
                self.transport.forget_address(&previous_address);
            }
            Observation::New => {
                slog::info!(self.logger, "Discovered member {:?} at {}", id, address);
                let latest_index = self.raft_log.latest_index();
                if let Some(leader_state) = self.election_state.leader_state_mut() {
                    leader_state.add_peer(id.clone(), latest_index);
                    let command = ClusterCommand::AddMember {
                        id: id.clone(),
                        address: address.to_string(),
                    };
                    if let Err(e) = self.propose_command(command) {
                        slog::error!(self.logger, "Failed to propose new member {:?}: {:?}", id, e);
                    }
                }
            }
        }
        self.pending_removals.remove(id);
    }

    pub(crate) fn handle_liveness_sweep(&mut self) {
        let now = Instant::now();
        for (id, reachable) in self.members.sweep_reachability(now, self.options.liveness_timeout) {
            if reachable {
                slog::info!(self.logger, "Member {:?} is reachable again", id);
            } else {
                slog::warn!(self.logger, "Member {:?} is unreachable", id);
            }
        }

        if self.election_state.role() != Role::Leader {
            return;
        }
        for id in self.members.expired_peers(now, self.options.member_expiry) {
            if self.pending_removals.contains(&id) {
                continue;
            }
            slog::info!(self.logger, "Proposing removal of expired member {:?}", id);
            match self.propose_command(ClusterCommand::RemoveMember { id: id.clone() }) {
                Ok(_) => {
                    self.pending_removals.insert(id);
                }
                Err(e) => slog::error!(self.logger, "Failed to propose removal of {:?}: {:?}", id, e),
            }
        }
    }

    // ------- Apply & compaction --------

    fn apply_committed(&mut self) {
        loop {
            let (index, entry) = match self.raft_log.next_to_apply() {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(e) => {
                    slog::error!(self.logger, "Failed to read committed entry: {:?}", e);
                    break;
                }
            };

            match ClusterCommand::decode(&entry.data) {
                Ok(command) => {
                    let applied = self.state_machine.apply(command, &mut self.members);
                    self.on_applied(applied);
                }
                Err(e) => slog::error!(self.logger, "Skipping undecodable entry {:?}: {:?}", index, e),
            }

            self.commit_stream
                .notify_commit(&self.logger, entry.term, index.as_u64(), Bytes::from(entry.data));
            self.raft_log.mark_applied(index);
        }

        self.maybe_compact();
    }

    fn on_applied(&mut self, applied: Applied) {
        match applied {
            Applied::Nothing => {}
            Applied::MemberAdded(id) => {
                slog::info!(self.logger, "Member {:?} joined the cluster", id);
                let latest_index = self.raft_log.latest_index();
                if let Some(leader_state) = self.election_state.leader_state_mut() {
                    leader_state.add_peer(id, latest_index);
                }
            }
            Applied::MemberRemoved { id, address } => {
                slog::info!(self.logger, "Member {:?} left the cluster", id);
                self.transport.forget_address(&address);
                if let Some(leader_state) = self.election_state.leader_state_mut() {
                    leader_state.remove_peer(&id);
                }
                self.pending_removals.remove(&id);
            }
            Applied::ConfigUpdated => {
                slog::info!(self.logger, "Configuration is now at version {}", self.state_machine.config_version);
            }
        }
    }

    fn maybe_compact(&mut self) {
        if self.raft_log.retained_len() <= self.options.snapshot_threshold {
            return;
        }
        let applied = match self.raft_log.last_applied_index() {
            Some(applied) => applied,
            None => return,
        };
        // Unapplied entries past the boundary keep the log long; nothing new to compact yet.
        if matches!(self.raft_log.snapshot_boundary(), Some((_, boundary)) if applied <= boundary) {
            return;
        }

        let snapshot = match self.applied_snapshot() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                slog::error!(self.logger, "Failed to build snapshot for compaction: {:?}", e);
                return;
            }
        };
        if let Err(e) = self.raft_log.compact_through(applied) {
            slog::error!(self.logger, "Failed to compact log through {:?}: {:?}", applied, e);
            return;
        }
        slog::info!(self.logger, "Compacted log through {:?}", applied);

        self.latest_snapshot = Some(snapshot.clone());
        if self.snapshot_sink.send(snapshot).is_err() {
            slog::warn!(self.logger, "Snapshot persistence has stopped");
        }
    }

    /// Point-in-time snapshot of the applied state.
    fn applied_snapshot(&self) -> Result<Snapshot, io::Error> {
        let (term, index) = match self.raft_log.last_applied_index() {
            None => (0, 0),
            Some(applied) => match self.raft_log.entry_term(applied)? {
                EntryTerm::Present(term) => (term.as_u64(), applied.as_u64()),
                EntryTerm::Compacted | EntryTerm::Missing => {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("Applied entry {:?} is not readable", applied),
                    ))
                }
            },
        };

        let current_term = self.local_state.current_term();
        let members = self
            .members
            .iter()
            .map(|m| {
                let term = if m.id == self.my_id { current_term } else { m.term_seen };
                let member = PersistedMember {
                    address: m.address.clone(),
                    term: term.as_u64(),
                    last_seen: m.last_seen,
                };
                (m.id.to_string(), member)
            })
            .collect();

        Ok(Snapshot {
            term,
            index,
            state: PersistedClusterState {
                members,
                leader_id: self.current_leader_id().map(|id| id.to_string()),
                current_term: current_term.as_u64(),
                commit_index: index_to_u64(self.raft_log.commit_index()),
                config_version: self.state_machine.config_version,
                config: self.state_machine.config.clone(),
            },
        })
    }

    pub(crate) fn handle_take_snapshot(&mut self) -> Result<Snapshot, io::Error> {
        self.applied_snapshot()
    }

    /// Stops all timers for good and returns a final snapshot. In-flight RPCs still report back
    /// but no new rounds are started.
    pub(crate) fn handle_shutdown(&mut self) -> Result<Snapshot, io::Error> {
        let snapshot = self.applied_snapshot();
        self.election_state.stop();
        slog::info!(self.logger, "Consensus engine stopped");
        snapshot
    }

    pub(crate) fn handle_read_log_entry(&self, index: u64) -> Option<LogEntryView> {
        let index = Index::from_u64_opt(index)?;
        match self.raft_log.read(index) {
            Ok(Some(entry)) => Some(LogEntryView {
                index: index.as_u64(),
                term: entry.term.as_u64(),
                payload: Bytes::from(entry.data),
                committed: matches!(self.raft_log.commit_index(), Some(ci) if index <= ci),
            }),
            Ok(None) => None,
            Err(e) => {
                slog::warn!(self.logger, "Failed to read log entry {:?}: {:?}", index, e);
                None
            }
        }
    }

    // ------- Shared helpers --------

    /// Term bookkeeping shared by AppendEntries and InstallSnapshot: rejects stale leaders,
    /// follows current ones and refreshes the leader's liveness.
    fn accept_leader_contact(
        &mut self,
        leader_term: Term,
        leader_id: &NodeId,
        leader_address: &str,
    ) -> Result<(), TermOutOfDateInfo> {
        let current_term = self.local_state.current_term();
        if leader_term < current_term {
            return Err(TermOutOfDateInfo { current_term });
        }

        let leader = LeaderInfo {
            node_id: leader_id.clone(),
            address: leader_address.to_string(),
        };
        if !self.observe_term(leader_term, Some(leader.clone())) {
            match self.election_state.role() {
                Role::Candidate => {
                    slog::info!(self.logger, "Lost election for term {:?} to {:?}", leader_term, leader_id);
                    self.election_state.transition_to_follower(Some(leader.clone()));
                }
                Role::Leader => {
                    slog::crit!(self.logger, "Another leader {:?} claims our term {:?}", leader_id, leader_term);
                    return Err(TermOutOfDateInfo { current_term });
                }
                Role::Follower => self.election_state.set_leader_if_unknown(&leader),
            }
        }

        self.election_state.reset_timeout_if_follower();
        self.members
            .observe(leader_id, leader_address, Some(leader_term), Instant::now());
        Ok(())
    }

    /// > If RPC request or response contains term T > currentTerm:
    /// > set currentTerm = T, convert to follower (§5.1)
    ///
    /// Returns true if the term increased.
    fn observe_term(&mut self, term: Term, leader: Option<LeaderInfo>) -> bool {
        if self.election_state.is_stopped() {
            return false;
        }
        match self.local_state.store_term_if_increased(term) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                slog::error!(self.logger, "Failed to persist term {:?}: {:?}", term, e);
                return false;
            }
        }

        self.election_state.transition_to_follower(leader);
        slog::info!(
            self.logger,
            "Observed term {:?}. Transitioned to follower. Election state: {:?}",
            term,
            self.election_state
        );
        true
    }

    fn peer_target(&self, peer_id: &NodeId) -> Option<PeerTarget> {
        self.members.get(peer_id).map(|member| PeerTarget {
            id: member.id.clone(),
            address: member.address.clone(),
        })
    }

    fn current_leader_id(&self) -> Option<NodeId> {
        match self.election_state.current_leader() {
            CurrentLeader::Me => Some(self.my_id.clone()),
            CurrentLeader::Other(leader) => Some(leader.node_id),
            CurrentLeader::Unknown => None,
        }
    }

    pub(crate) fn cluster_state_view(&self) -> ClusterStateView {
        let my_role = self.election_state.role();
        let current_term = self.local_state.current_term();
        let leader_id = self.current_leader_id();
        let (last_log_term, last_log_index) = match self.raft_log.latest_entry() {
            Some((term, index)) => (term.as_u64(), index.as_u64()),
            None => (0, 0),
        };

        let members = self
            .members
            .iter()
            .map(|m| {
                let is_me = m.id == self.my_id;
                let role = if is_me {
                    my_role
                } else if leader_id.as_ref() == Some(&m.id) {
                    Role::Leader
                } else {
                    Role::Follower
                };
                let view = NodeView {
                    id: m.id.to_string(),
                    address: m.address.clone(),
                    role,
                    term: if is_me { current_term.as_u64() } else { m.term_seen.as_u64() },
                    last_seen: m.last_seen,
                    reachable: m.reachable(),
                };
                (view.id.clone(), view)
            })
            .collect();

        ClusterStateView {
            node_id: self.my_id.to_string(),
            role: my_role,
            leader_id: leader_id.map(|id| id.to_string()),
            current_term: current_term.as_u64(),
            commit_index: index_to_u64(self.raft_log.commit_index()),
            last_log_index,
            last_log_term,
            config_version: self.state_machine.config_version,
            config: self.state_machine.config.clone().map(Bytes::from),
            members,
        }
    }

    pub(crate) fn publish_state(&self) {
        self.state_publisher.publish_if_changed(self.cluster_state_view());
    }
}

fn majority(num_members: usize) -> usize {
    (num_members / 2) + 1
}
