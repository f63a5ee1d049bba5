use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Point-in-time copy of the cluster state. `index`/`term` identify the last log entry whose
/// effect is included; 0/0 means nothing had been committed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub term: u64,
    pub index: u64,
    pub state: PersistedClusterState,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedClusterState {
    pub members: BTreeMap<String, PersistedMember>,
    pub leader_id: Option<String>,
    pub current_term: u64,
    pub commit_index: u64,
    pub config_version: u64,
    #[serde(default)]
    pub config: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedMember {
    pub address: String,
    pub term: u64,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Snapshot {
    pub(crate) fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&self.state)
    }

    pub(crate) fn decode(term: u64, index: u64, state: &[u8]) -> Result<Self, serde_json::Error> {
        Ok(Snapshot {
            term,
            index,
            state: serde_json::from_slice(state)?,
        })
    }
}
