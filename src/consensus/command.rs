use crate::consensus::NodeId;
use serde::{Deserialize, Serialize};

/// Payload of every replicated log entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum ClusterCommand {
    /// Appended by a new leader so entries from earlier terms can commit.
    Noop,
    AddMember { id: NodeId, address: String },
    RemoveMember { id: NodeId },
    /// Opaque configuration blob proposed by a collaborator.
    UpdateConfig { data: Vec<u8> },
}

impl ClusterCommand {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
