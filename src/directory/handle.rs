use crate::actor::WeakActorClient;
use crate::consensus::{ClusterStateListener, ClusterStateView, LogEntryView, ProposeError, ProposeInput};
use bytes::Bytes;

/// Where a proposal landed in the leader's log. Landing there is not the same as committing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProposedEntry {
    pub term: u64,
    pub index: u64,
}

/// What collaborators hold on to: read-only views of the cluster and a way to propose
/// configuration through the leader.
#[derive(Clone)]
pub struct ClusterHandle {
    client: WeakActorClient,
    listener: ClusterStateListener,
}

impl ClusterHandle {
    pub(crate) fn new(client: WeakActorClient, listener: ClusterStateListener) -> Self {
        ClusterHandle { client, listener }
    }

    pub fn cluster_state(&self) -> ClusterStateView {
        self.listener.current()
    }

    pub fn listener(&self) -> ClusterStateListener {
        self.listener.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.listener.current().is_leader()
    }

    /// None when the entry was compacted away, was never written, or the engine has exited.
    pub async fn log_entry(&self, index: u64) -> Option<LogEntryView> {
        self.client.read_log_entry(index).await.ok().flatten()
    }

    /// Replicates an opaque configuration blob. Only the leader accepts; others answer with
    /// [`ProposeError::LeaderRedirect`].
    pub async fn propose(&self, data: Bytes) -> Result<ProposedEntry, ProposeError> {
        let output = self.client.propose(ProposeInput { data }).await?;

        Ok(ProposedEntry {
            term: output.term.as_u64(),
            index: output.index.as_u64(),
        })
    }
}
