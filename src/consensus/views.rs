use crate::consensus::Role;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Consistent, read-only copy of the cluster state as seen by this node.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterStateView {
    pub node_id: String,
    pub role: Role,
    pub leader_id: Option<String>,
    pub current_term: u64,
    /// 0 when nothing is committed.
    pub commit_index: u64,
    pub last_log_index: u64,
    pub last_log_term: u64,
    pub config_version: u64,
    pub config: Option<Bytes>,
    pub members: BTreeMap<String, NodeView>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeView {
    pub id: String,
    pub address: String,
    pub role: Role,
    pub term: u64,
    pub last_seen: Option<DateTime<Utc>>,
    pub reachable: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LogEntryView {
    pub index: u64,
    pub term: u64,
    pub payload: Bytes,
    pub committed: bool,
}

impl ClusterStateView {
    pub(crate) fn initial(node_id: &str, role: Role) -> Self {
        ClusterStateView {
            node_id: node_id.to_string(),
            role,
            leader_id: None,
            current_term: 0,
            commit_index: 0,
            last_log_index: 0,
            last_log_term: 0,
            config_version: 0,
            config: None,
            members: BTreeMap::new(),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    pub fn leader(&self) -> Option<&NodeView> {
        self.leader_id.as_ref().and_then(|id| self.members.get(id))
    }

    pub fn peers(&self) -> impl Iterator<Item = &NodeView> {
        let me = self.node_id.clone();
        self.members.values().filter(move |n| n.id != me)
    }
}

pub(crate) fn new(initial: ClusterStateView) -> (ClusterStatePublisher, ClusterStateListener) {
    let (snd, rcv) = watch::channel(initial);

    (ClusterStatePublisher { snd }, ClusterStateListener { rcv })
}

pub(crate) struct ClusterStatePublisher {
    snd: watch::Sender<ClusterStateView>,
}

impl ClusterStatePublisher {
    /// Publishes `view` if it differs from the last published one.
    pub(crate) fn publish_if_changed(&self, view: ClusterStateView) {
        if *self.snd.borrow() != view {
            self.snd.send_replace(view);
        }
    }
}

/// Follows cluster state changes. Intermediate states may be skipped; the latest one is always
/// observable.
#[derive(Clone)]
pub struct ClusterStateListener {
    rcv: watch::Receiver<ClusterStateView>,
}

impl ClusterStateListener {
    pub fn current(&self) -> ClusterStateView {
        self.rcv.borrow().clone()
    }

    /// Waits for the next change. None once the engine has exited.
    pub async fn next(&mut self) -> Option<ClusterStateView> {
        match self.rcv.changed().await {
            Ok(_) => Some(self.rcv.borrow().clone()),
            Err(_) => None,
        }
    }

    /// Waits until the state satisfies `predicate`, checking the current state first.
    pub async fn wait_for<F>(&mut self, mut predicate: F) -> Option<ClusterStateView>
    where
        F: FnMut(&ClusterStateView) -> bool,
    {
        let current = self.current();
        if predicate(&current) {
            return Some(current);
        }
        loop {
            let next = self.next().await?;
            if predicate(&next) {
                return Some(next);
            }
        }
    }
}
