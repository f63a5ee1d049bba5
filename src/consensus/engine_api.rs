use crate::commitlog::Index;
use crate::consensus::log_entry::LogEntry;
use crate::consensus::snapshot::Snapshot;
use crate::consensus::{LeaderInfo, NodeId, Term};
use bytes::Bytes;
use std::io;

// ------- Propose --------

#[derive(Debug)]
pub(crate) struct ProposeInput {
    pub(crate) data: Bytes,
}

#[derive(Debug)]
pub(crate) struct ProposeOutput {
    pub(crate) term: Term,
    pub(crate) index: Index,
}

#[derive(Debug, thiserror::Error)]
pub enum ProposeError {
    #[error("Not leader; leader is {0:?}")]
    LeaderRedirect(LeaderInfo),

    // Can be retried with exponential backoff. Likely an election is in progress.
    #[error("Cluster has no leader right now")]
    NoLeader,

    #[error("Failed to append to local log")]
    LocalIoError(#[source] io::Error),

    #[error("Failed to encode cluster command")]
    Encoding(#[source] serde_json::Error),

    #[error("Consensus engine has exited")]
    EngineExited,
}

// ------- RequestVote --------

#[derive(Debug)]
pub(crate) struct RequestVoteInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: NodeId,
    pub(crate) candidate_address: String,
    pub(crate) candidate_last_log_entry: Option<(Term, Index)>,
}

#[derive(Debug)]
pub(crate) struct RequestVoteOutput {
    pub(crate) vote_granted: bool,
    pub(crate) current_term: Term,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum RequestVoteError {
    #[error("Requesting candidate is not in the cluster")]
    CandidateNotInCluster,
    #[error("Requesting candidate's term is out of date")]
    RequestTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) are unavailable because the engine has exited")]
    ActorExited,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct TermOutOfDateInfo {
    pub(crate) current_term: Term,
}

// ------- AppendEntries --------

#[derive(Debug)]
pub(crate) struct AppendEntriesInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: NodeId,
    pub(crate) leader_address: String,
    // The log entry immediately preceding `new_entries`.
    pub(crate) leader_previous_log_entry: Option<(Term, Index)>,
    pub(crate) leader_commit_index: Option<Index>,
    pub(crate) new_entries: Vec<LogEntry>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesOutput {
    // Highest index known to match the leader's log.
    pub(crate) matched_index: Option<Index>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum AppendEntriesError {
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("Missing the entry preceding the new entries")]
    ServerMissingPreviousLogEntry { last_log_index: Option<Index> },
    #[error("Leader sent entries conflicting with committed ones")]
    ConflictsWithCommitted(Index),
    #[error("Local log failure")]
    ServerIoError(#[source] io::Error),
    #[error("We (server) are unavailable because the engine has exited")]
    ActorExited,
}

// ------- InstallSnapshot --------

#[derive(Debug)]
pub(crate) struct InstallSnapshotInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: NodeId,
    pub(crate) leader_address: String,
    pub(crate) snapshot: Snapshot,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotOutput {
    pub(crate) matched_index: Option<Index>,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum InstallSnapshotError {
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("Local log failure")]
    ServerIoError(#[source] io::Error),
    #[error("We (server) are unavailable because the engine has exited")]
    ActorExited,
}

// ------- JoinCluster --------

#[derive(Debug, Clone)]
pub(crate) struct JoinClusterInput {
    pub(crate) node_id: NodeId,
    pub(crate) address: String,
    pub(crate) cluster_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum JoinClusterOutput {
    Accepted { leader_id: NodeId, term: Term },
    Redirect { leader: LeaderInfo, term: Term },
    NoLeader { term: Term },
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum JoinClusterError {
    #[error("Wrong cluster; this node belongs to '{expected}'")]
    WrongCluster { expected: String },
    #[error("We (server) are unavailable because the engine has exited")]
    ActorExited,
}

// ------- Discovery --------

/// A decoded discovery datagram, handed over by the listener.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct DiscoveryAnnouncement {
    pub(crate) sender_id: NodeId,
    pub(crate) sender_address: String,
    pub(crate) cluster_name: String,
}

// ------- Replies from peers (caller side) --------

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: NodeId,
    pub(crate) term: Term,
    pub(crate) result: Result<RequestVoteOutput, PeerReplyError>,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: ReplicationDescriptor,
    pub(crate) result: Result<AppendEntriesOutput, PeerReplyError>,
}

#[derive(Debug)]
pub(crate) struct InstallSnapshotReplyFromPeer {
    pub(crate) descriptor: ReplicationDescriptor,
    pub(crate) last_included_index: Option<Index>,
    pub(crate) result: Result<InstallSnapshotOutput, PeerReplyError>,
}

/// Identifies which replication request a reply belongs to.
#[derive(Debug, Clone)]
pub(crate) struct ReplicationDescriptor {
    pub(crate) peer_id: NodeId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) previous_log_entry_index: Option<Index>,
    pub(crate) num_log_entries: usize,
}

/// How a peer call failed, from the caller's perspective.
#[derive(Debug)]
pub(crate) enum PeerReplyError {
    StaleTerm { new_term: Term },
    PeerMissingPreviousLogEntry { last_log_index: Option<Index> },
    NotInCluster,
    RetryableFailure(String),
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum JoinReplyError {
    #[error("Peer belongs to cluster '{0}'")]
    WrongCluster(String),
    #[error("{0}")]
    RetryableFailure(String),
}

// ------- Timer events --------

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HeartbeatTick {
    pub(crate) peer_id: NodeId,
    pub(crate) term: Term,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct ElectionTimeoutTick {
    pub(crate) generation: u64,
    pub(crate) resets_seen: u64,
}

// Server-side errors as seen by the calling peer, used by transports that skip the wire.

impl From<RequestVoteError> for PeerReplyError {
    fn from(e: RequestVoteError) -> Self {
        match e {
            RequestVoteError::CandidateNotInCluster => PeerReplyError::NotInCluster,
            RequestVoteError::RequestTermOutOfDate(info) => PeerReplyError::StaleTerm {
                new_term: info.current_term,
            },
            RequestVoteError::ActorExited => PeerReplyError::RetryableFailure(e.to_string()),
        }
    }
}

impl From<AppendEntriesError> for PeerReplyError {
    fn from(e: AppendEntriesError) -> Self {
        match e {
            AppendEntriesError::ClientTermOutOfDate(info) => PeerReplyError::StaleTerm {
                new_term: info.current_term,
            },
            AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index } => {
                PeerReplyError::PeerMissingPreviousLogEntry { last_log_index }
            }
            AppendEntriesError::ConflictsWithCommitted(_)
            | AppendEntriesError::ServerIoError(_)
            | AppendEntriesError::ActorExited => PeerReplyError::RetryableFailure(e.to_string()),
        }
    }
}

impl From<InstallSnapshotError> for PeerReplyError {
    fn from(e: InstallSnapshotError) -> Self {
        match e {
            InstallSnapshotError::ClientTermOutOfDate(info) => PeerReplyError::StaleTerm {
                new_term: info.current_term,
            },
            InstallSnapshotError::ServerIoError(_) | InstallSnapshotError::ActorExited => {
                PeerReplyError::RetryableFailure(e.to_string())
            }
        }
    }
}

impl From<JoinClusterError> for JoinReplyError {
    fn from(e: JoinClusterError) -> Self {
        match e {
            JoinClusterError::WrongCluster { expected } => JoinReplyError::WrongCluster(expected),
            JoinClusterError::ActorExited => JoinReplyError::RetryableFailure(e.to_string()),
        }
    }
}
