use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::consensus::election::timers::ElectionTimerHandle;
use crate::consensus::election::LeaderStateTracker;
use crate::consensus::engine_api::ElectionTimeoutTick;
use crate::consensus::{LeaderInfo, NodeId, Role, Term};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_node_id: NodeId,
    pub leader_heartbeat_duration: Duration,
    pub election_min_timeout: Duration,
    pub election_max_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CurrentLeader {
    Me,
    Other(LeaderInfo),
    Unknown,
}

/// ElectionState is responsible for holding state specific to the stage in an election. Its
/// methods are responsible for "what" to do. It is NOT responsible for validating anything
/// specific to logs, terms, peers, etc. or knowing "when" to do something.
pub(crate) struct ElectionState {
    state: State,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    next_timer_generation: u64,
}

impl ElectionState {
    /// `new_follower()` creates a new ElectionState instance that starts out as a follower.
    pub(crate) fn new_follower(config: ElectionConfig, actor_client: WeakActorClient) -> Self {
        let mut election_state = Self {
            state: State::Stopped,
            config,
            actor_client,
            next_timer_generation: 0,
        };
        election_state.transition_to_follower(None);

        election_state
    }

    pub(crate) fn transition_to_follower(&mut self, new_leader: Option<LeaderInfo>) {
        let timer = self.spawn_election_timer();
        self.state = State::Follower(FollowerState {
            leader: new_leader,
            election_timer: timer,
        });
    }

    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self) {
        let timer = self.spawn_election_timer();
        let mut cs = CandidateState {
            received_votes_from: HashSet::with_capacity(3),
            _election_timer: timer,
        };
        cs.add_received_vote(self.config.my_node_id.clone());

        self.state = State::Candidate(cs);
    }

    pub(crate) fn transition_to_leader(&mut self, term: Term, peer_ids: HashSet<NodeId>, latest_log_index: Option<Index>) {
        self.state = State::Leader(LeaderStateTracker::new(
            peer_ids,
            latest_log_index,
            self.config.leader_heartbeat_duration,
            self.actor_client.clone(),
            term,
        ));
    }

    /// Drops every timer. Nothing transitions out of this state.
    pub(crate) fn stop(&mut self) {
        self.state = State::Stopped;
    }

    pub(crate) fn is_stopped(&self) -> bool {
        matches!(self.state, State::Stopped)
    }

    pub(crate) fn role(&self) -> Role {
        match self.state {
            State::Leader(_) => Role::Leader,
            State::Candidate(_) => Role::Candidate,
            State::Follower(_) | State::Stopped => Role::Follower,
        }
    }

    pub(crate) fn current_leader(&self) -> CurrentLeader {
        match &self.state {
            State::Leader(_) => CurrentLeader::Me,
            State::Follower(FollowerState {
                leader: Some(leader), ..
            }) => CurrentLeader::Other(leader.clone()),
            _ => CurrentLeader::Unknown,
        }
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let State::Follower(fs) = &self.state {
            fs.election_timer.reset_timeout();
        }
    }

    pub(crate) fn set_leader_if_unknown(&mut self, leader: &LeaderInfo) {
        if let State::Follower(fs) = &mut self.state {
            if fs.leader.is_none() {
                fs.leader.replace(leader.clone());
            }
        }
    }

    /// Return number of votes received if candidate, or None if no longer Candidate.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: NodeId) -> Option<usize> {
        if let State::Candidate(cs) = &mut self.state {
            Some(cs.add_received_vote(vote_from))
        } else {
            None
        }
    }

    /// True if `tick` came from the timer currently guarding this follower or candidate.
    pub(crate) fn is_current_timeout(&self, tick: &ElectionTimeoutTick) -> bool {
        match &self.state {
            State::Follower(fs) => fs.election_timer.is_current(tick),
            State::Candidate(cs) => cs._election_timer.is_current(tick),
            State::Leader(_) | State::Stopped => false,
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        if let State::Leader(ls) = &mut self.state {
            Some(ls)
        } else {
            None
        }
    }

    pub(crate) fn leader_state(&self) -> Option<&LeaderStateTracker> {
        if let State::Leader(ls) = &self.state {
            Some(ls)
        } else {
            None
        }
    }

    fn spawn_election_timer(&mut self) -> ElectionTimerHandle {
        self.next_timer_generation += 1;
        ElectionTimerHandle::spawn_timer_task(
            self.next_timer_generation,
            self.config.election_min_timeout,
            self.config.election_max_timeout,
            self.actor_client.clone(),
        )
    }
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            State::Leader(_) => write!(f, "Leader"),
            State::Candidate(_) => write!(f, "Candidate"),
            State::Follower(FollowerState {
                leader: Some(leader), ..
            }) => write!(f, "Follower(Leader={:?})", leader.node_id),
            State::Follower(FollowerState { leader: None, .. }) => write!(f, "Follower(Leader=None)"),
            State::Stopped => write!(f, "Stopped"),
        }
    }
}

enum State {
    Leader(LeaderStateTracker),
    Candidate(CandidateState),
    Follower(FollowerState),
    Stopped,
}

struct CandidateState {
    received_votes_from: HashSet<NodeId>,
    _election_timer: ElectionTimerHandle,
}

struct FollowerState {
    leader: Option<LeaderInfo>,
    election_timer: ElectionTimerHandle,
}

impl CandidateState {
    /// `add_received_vote()` returns the number of unique votes we've received after adding the
    /// provided `vote_from`
    fn add_received_vote(&mut self, vote_from: NodeId) -> usize {
        self.received_votes_from.insert(vote_from);
        self.received_votes_from.len()
    }
}
