use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::consensus::election::timers::HeartbeatTimerHandle;
use crate::consensus::{NodeId, Term};
use std::cmp;
use std::collections::{HashMap, HashSet};
use tokio::time::Duration;

/// Replication progress of every peer, held while we are leader.
pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<NodeId, PeerState>,
    heartbeat_duration: Duration,
    actor_client: WeakActorClient,
    term: Term,
}

impl LeaderStateTracker {
    pub(super) fn new(
        peer_ids: HashSet<NodeId>,
        latest_log_index: Option<Index>,
        heartbeat_duration: Duration,
        actor_client: WeakActorClient,
        term: Term,
    ) -> Self {
        let mut tracker = LeaderStateTracker {
            peer_state: HashMap::with_capacity(peer_ids.len()),
            heartbeat_duration,
            actor_client,
            term,
        };
        for peer_id in peer_ids {
            tracker.add_peer(peer_id, latest_log_index);
        }

        tracker
    }

    /// Starts tracking (and heartbeating) a peer. No-op for a tracked peer.
    pub(crate) fn add_peer(&mut self, peer_id: NodeId, latest_log_index: Option<Index>) {
        if self.peer_state.contains_key(&peer_id) {
            return;
        }
        let heartbeat_timer = HeartbeatTimerHandle::spawn_timer_task(
            self.heartbeat_duration,
            self.actor_client.clone(),
            peer_id.clone(),
            self.term,
        );
        self.peer_state
            .insert(peer_id, PeerState::new(heartbeat_timer, latest_log_index));
    }

    /// Stops tracking a peer; its heartbeat timer stops with it.
    pub(crate) fn remove_peer(&mut self, peer_id: &NodeId) -> bool {
        self.peer_state.remove(peer_id).is_some()
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &NodeId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn peer_matched(&self, peer_id: &NodeId) -> Option<Index> {
        self.peer_state.get(peer_id).and_then(|p| p.matched)
    }

    pub(crate) fn peer_ids(&self) -> HashSet<NodeId> {
        self.peer_state.keys().cloned().collect()
    }
}

pub(crate) struct PeerState {
    heartbeat_timer: HeartbeatTimerHandle,

    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    matched: Option<Index>,

    // Logical clock of this leader's requests to the peer. Replies carrying a seq-no older than
    // the newest reply already handled are discarded.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,
}

#[derive(Debug)]
pub(crate) enum PeerStateUpdate {
    Replicated {
        previous_log_entry: Option<Index>,
        num_entries_replicated: usize,
    },
    SnapshotInstalled {
        last_included: Option<Index>,
    },
    PeerLogBehind {
        last_log_index: Option<Index>,
    },
    OtherError,
}

impl PeerState {
    fn new(heartbeat_timer: HeartbeatTimerHandle, latest_log_index: Option<Index>) -> Self {
        PeerState {
            heartbeat_timer,
            next: latest_log_index
                .map(|i| i.plus(1))
                .unwrap_or_else(Index::start_index),
            matched: None,
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
        }
    }

    pub(crate) fn next_and_previous_log_index(&self) -> (Index, Option<Index>) {
        (self.next, self.next.checked_minus(1))
    }

    pub(crate) fn matched(&self) -> Option<Index> {
        self.matched
    }

    pub(crate) fn handle_replication_result(&mut self, logger: &slog::Logger, received_seq_no: u64, update: PeerStateUpdate) {
        if !self.ratchet_fwd_received_seq_no(received_seq_no) {
            slog::warn!(logger, "Dropping out of date seq-no({:?}): {:?}", received_seq_no, update);
            return;
        }

        match update {
            PeerStateUpdate::OtherError => { /* No action */ }
            PeerStateUpdate::Replicated {
                previous_log_entry,
                num_entries_replicated,
            } => {
                let confirmed = match previous_log_entry {
                    None => Index::from_u64_opt(num_entries_replicated as u64),
                    Some(prev) => Some(prev.plus(num_entries_replicated as u64)),
                };
                if let Some(confirmed) = confirmed {
                    self.advance_to(confirmed);
                }
            }
            PeerStateUpdate::SnapshotInstalled { last_included } => {
                if let Some(last_included) = last_included {
                    self.advance_to(last_included);
                }
            }
            PeerStateUpdate::PeerLogBehind { last_log_index } => {
                self.rewind_log(logger, last_log_index);
            }
        }
    }

    fn advance_to(&mut self, confirmed: Index) {
        if self.matched.map_or(true, |m| confirmed > m) {
            self.matched = Some(confirmed);
        }
        self.next = cmp::max(self.next, confirmed.plus(1));
    }

    fn rewind_log(&mut self, logger: &slog::Logger, peer_last_log_index: Option<Index>) {
        let hinted_next = peer_last_log_index
            .map(|i| i.plus(1))
            .unwrap_or_else(Index::start_index);
        let new_next = match self.next.checked_minus(1) {
            Some(one_back) => cmp::min(one_back, hinted_next),
            None => {
                slog::warn!(logger, "Can't rewind peer log, already at beginning of log.");
                return;
            }
        };

        // The peer lost entries we believed matched (e.g. it restarted).
        if matches!(self.matched, Some(m) if m >= new_next) {
            slog::warn!(logger, "Peer no longer holds matched index {:?}", self.matched);
            self.matched = new_next.checked_minus(1);
        }
        self.next = new_next;
    }

    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.last_received_seq_no < self.last_sent_seq_no
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// returns true if the state was mutated.
    fn ratchet_fwd_received_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_received_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.heartbeat_timer.reset_heartbeat_timer();
    }
}

/// Highest index held by a strict majority of `num_members`, given one entry per member that
/// counts toward quorum (the leader's own latest index included). Members that can't count
/// (unreachable, unknown progress) are `None` or simply absent.
pub(crate) fn quorum_match_index(mut acked: Vec<Option<Index>>, num_members: usize) -> Option<Index> {
    let majority = (num_members / 2) + 1;
    if acked.len() < majority {
        return None;
    }

    // Descending; None sorts last.
    acked.sort_by(|a, b| b.cmp(a));
    acked[majority - 1]
}
