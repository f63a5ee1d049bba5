use crate::actor::WeakActorClient;
use crate::consensus::engine_api::{
    AppendEntriesInput, AppendEntriesOutput, InstallSnapshotInput, InstallSnapshotOutput, JoinClusterInput,
    JoinClusterOutput, JoinReplyError, PeerReplyError, RequestVoteInput, RequestVoteOutput,
};
use crate::consensus::transport::{PeerTarget, PeerTransport};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Connects engines in the same process by address. Nodes can be split into partitions; calls
/// only go through between nodes in the same partition.
#[derive(Clone, Default)]
pub(crate) struct InMemoryNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    routes: HashMap<String, WeakActorClient>,
    // Nodes absent from the map are in partition 0.
    partition_of: HashMap<String, usize>,
}

impl InMemoryNetwork {
    pub(crate) fn register(&self, address: &str, client: WeakActorClient) {
        self.lock().routes.insert(address.to_string(), client);
    }

    /// Puts each group of addresses in its own partition.
    pub(crate) fn partition(&self, groups: &[&[&str]]) {
        let mut state = self.lock();
        state.partition_of.clear();
        for (i, group) in groups.iter().enumerate() {
            for address in group.iter() {
                state.partition_of.insert(address.to_string(), i + 1);
            }
        }
    }

    pub(crate) fn heal(&self) {
        self.lock().partition_of.clear();
    }

    pub(crate) fn transport_for(&self, own_address: &str) -> Arc<dyn PeerTransport> {
        Arc::new(InMemoryTransport {
            network: self.clone(),
            own_address: own_address.to_string(),
        })
    }

    fn route(&self, from: &str, to: &str) -> Result<WeakActorClient, PeerReplyError> {
        let state = self.lock();
        let partition = |address: &str| state.partition_of.get(address).copied().unwrap_or(0);
        if partition(from) != partition(to) {
            return Err(PeerReplyError::RetryableFailure(format!("{} can't reach {}", from, to)));
        }

        state
            .routes
            .get(to)
            .cloned()
            .ok_or_else(|| PeerReplyError::RetryableFailure(format!("No route to {}", to)))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.inner.lock().expect("InMemoryNetwork mutex guard poisoned")
    }
}

struct InMemoryTransport {
    network: InMemoryNetwork,
    own_address: String,
}

#[async_trait::async_trait]
impl PeerTransport for InMemoryTransport {
    async fn request_vote(
        &self,
        peer: &PeerTarget,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, PeerReplyError> {
        let client = self.network.route(&self.own_address, &peer.address)?;
        client.request_vote(input).await.map_err(PeerReplyError::from)
    }

    async fn append_entries(
        &self,
        peer: &PeerTarget,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, PeerReplyError> {
        let client = self.network.route(&self.own_address, &peer.address)?;
        client.append_entries(input).await.map_err(PeerReplyError::from)
    }

    async fn install_snapshot(
        &self,
        peer: &PeerTarget,
        input: InstallSnapshotInput,
    ) -> Result<InstallSnapshotOutput, PeerReplyError> {
        let client = self.network.route(&self.own_address, &peer.address)?;
        client.install_snapshot(input).await.map_err(PeerReplyError::from)
    }

    async fn join_cluster(&self, address: &str, input: JoinClusterInput) -> Result<JoinClusterOutput, JoinReplyError> {
        let client = self
            .network
            .route(&self.own_address, address)
            .map_err(|e| JoinReplyError::RetryableFailure(format!("{:?}", e)))?;
        client.join_cluster(input).await.map_err(JoinReplyError::from)
    }
}
