mod command;
mod commit_stream;
mod election;
mod engine;
mod engine_api;
mod local_state;
mod log_entry;
mod members;
mod raft_log;
mod snapshot;
mod state_machine;
mod transport;
mod types;
mod views;
mod wiring;

#[cfg(test)]
mod in_memory_transport;
#[cfg(test)]
mod scenarios;

pub use commit_stream::CommitStream;
pub use commit_stream::CommittedEntry;
pub(crate) use engine::ConsensusEngine;
pub(crate) use engine_api::AppendEntriesError;
pub(crate) use engine_api::AppendEntriesInput;
pub(crate) use engine_api::AppendEntriesOutput;
pub(crate) use engine_api::AppendEntriesReplyFromPeer;
pub(crate) use engine_api::DiscoveryAnnouncement;
pub(crate) use engine_api::ElectionTimeoutTick;
pub(crate) use engine_api::HeartbeatTick;
pub(crate) use engine_api::InstallSnapshotError;
pub(crate) use engine_api::InstallSnapshotInput;
pub(crate) use engine_api::InstallSnapshotOutput;
pub(crate) use engine_api::InstallSnapshotReplyFromPeer;
pub(crate) use engine_api::JoinClusterError;
pub(crate) use engine_api::JoinClusterInput;
pub(crate) use engine_api::JoinClusterOutput;
pub(crate) use engine_api::JoinReplyError;
pub(crate) use engine_api::PeerReplyError;
pub(crate) use engine_api::ProposeInput;
pub(crate) use engine_api::ProposeOutput;
pub(crate) use engine_api::RequestVoteError;
pub(crate) use engine_api::RequestVoteInput;
pub(crate) use engine_api::RequestVoteOutput;
pub(crate) use engine_api::RequestVoteReplyFromPeer;
pub(crate) use engine_api::TermOutOfDateInfo;
#[cfg(test)]
pub(crate) use in_memory_transport::InMemoryNetwork;
pub use engine_api::ProposeError;
pub(crate) use log_entry::LogEntry;
pub use snapshot::PersistedClusterState;
pub use snapshot::PersistedMember;
pub use snapshot::Snapshot;
pub(crate) use transport::PeerTarget;
pub(crate) use transport::PeerTransport;
pub use types::LeaderInfo;
pub use types::NodeId;
pub use types::Role;
pub use types::Term;
pub use views::ClusterStateListener;
pub use views::ClusterStateView;
pub use views::LogEntryView;
pub use views::NodeView;
pub(crate) use wiring::create_engine;
pub(crate) use wiring::EngineConfig;
