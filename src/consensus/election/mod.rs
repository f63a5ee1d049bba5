mod election_state;
mod leader_state;
mod timers;

pub(crate) use election_state::CurrentLeader;
pub(crate) use election_state::ElectionConfig;
pub(crate) use election_state::ElectionState;
pub(crate) use leader_state::quorum_match_index;
pub(crate) use leader_state::LeaderStateTracker;
pub(crate) use leader_state::PeerStateUpdate;
