use crate::consensus::engine_api::{
    AppendEntriesInput, AppendEntriesOutput, InstallSnapshotInput, InstallSnapshotOutput, JoinClusterInput,
    JoinClusterOutput, JoinReplyError, PeerReplyError, RequestVoteInput, RequestVoteOutput,
};
use crate::consensus::NodeId;

/// A peer the engine talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PeerTarget {
    pub(crate) id: NodeId,
    pub(crate) address: String,
}

/// Outbound consensus traffic. Callers apply their own timeouts.
#[async_trait::async_trait]
pub(crate) trait PeerTransport: Send + Sync + 'static {
    async fn request_vote(
        &self,
        peer: &PeerTarget,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, PeerReplyError>;

    async fn append_entries(
        &self,
        peer: &PeerTarget,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, PeerReplyError>;

    async fn install_snapshot(
        &self,
        peer: &PeerTarget,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, PeerReplyError>;

    /// `address` is the RPC address of a seed; its node id may not be known yet.
    async fn join_cluster(&self, address: &str, input: JoinClusterInput) -> Result<JoinClusterOutput, JoinReplyError>;

    /// No member lives at `address` anymore. Anything held open for it can be released.
    fn forget_address(&self, _address: &str) {}
}
