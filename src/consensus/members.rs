use crate::consensus::{NodeId, Term};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tokio::time::{Duration, Instant};

/// A known cluster member, including this node.
#[derive(Clone, Debug)]
pub(crate) struct Member {
    pub(crate) id: NodeId,
    pub(crate) address: String,
    /// Highest term observed from this member.
    pub(crate) term_seen: Term,
    pub(crate) last_seen: Option<DateTime<Utc>>,
    // Monotonic twins of the wall clock fields, used for liveness math.
    last_contact: Option<Instant>,
    known_since: Instant,
    reachable: bool,
}

#[derive(Debug, PartialEq)]
pub(crate) enum Observation {
    New,
    Refreshed,
    Moved { previous_address: String },
}

/// Member set keyed by node id. Upserts are idempotent: observing the same node twice only
/// refreshes its liveness.
pub(crate) struct Members {
    me: NodeId,
    nodes: HashMap<NodeId, Member>,
}

impl Member {
    fn new(id: NodeId, address: String, now: Instant) -> Self {
        Member {
            id,
            address,
            term_seen: Term::default(),
            last_seen: None,
            last_contact: None,
            known_since: now,
            reachable: false,
        }
    }

    fn touch(&mut self, now: Instant) {
        self.last_contact = Some(now);
        self.last_seen = Some(Utc::now());
    }

    /// Reachability as of the last liveness sweep.
    pub(crate) fn reachable(&self) -> bool {
        self.reachable
    }

    fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_contact.unwrap_or(self.known_since))
    }
}

impl Members {
    pub(crate) fn new(me: NodeId, my_address: String) -> Self {
        let now = Instant::now();
        let mut myself = Member::new(me.clone(), my_address, now);
        myself.touch(now);
        myself.reachable = true;

        let mut nodes = HashMap::new();
        nodes.insert(me.clone(), myself);

        Members { me, nodes }
    }

    pub(crate) fn my_id(&self) -> &NodeId {
        &self.me
    }

    /// Records contact with `id`, inserting it if unknown.
    pub(crate) fn observe(&mut self, id: &NodeId, address: &str, term: Option<Term>, now: Instant) -> Observation {
        let observation = match self.nodes.get_mut(id) {
            Some(member) => {
                let observation = if member.address != address {
                    let previous_address = std::mem::replace(&mut member.address, address.to_string());
                    Observation::Moved { previous_address }
                } else {
                    Observation::Refreshed
                };
                member.touch(now);
                observation
            }
            None => {
                let mut member = Member::new(id.clone(), address.to_string(), now);
                member.touch(now);
                self.nodes.insert(id.clone(), member);
                Observation::New
            }
        };

        if let (Some(term), Some(member)) = (term, self.nodes.get_mut(id)) {
            if term > member.term_seen {
                member.term_seen = term;
            }
        }

        observation
    }

    /// Records contact with a node we already know. Unknown ids are ignored.
    pub(crate) fn touch_if_known(&mut self, id: &NodeId, term: Option<Term>, now: Instant) {
        if let Some(member) = self.nodes.get_mut(id) {
            member.touch(now);
            if let Some(term) = term {
                if term > member.term_seen {
                    member.term_seen = term;
                }
            }
        }
    }

    /// Inserts without counting it as contact. Returns false if the id was already known.
    pub(crate) fn insert_if_absent(&mut self, id: NodeId, address: String) -> bool {
        if self.nodes.contains_key(&id) {
            return false;
        }
        let member = Member::new(id.clone(), address, Instant::now());
        self.nodes.insert(id, member);
        true
    }

    /// Inserts a member restored from a snapshot, keeping its recorded term and wall clock.
    pub(crate) fn restore(&mut self, id: NodeId, address: String, term: Term, last_seen: Option<DateTime<Utc>>) {
        if id == self.me {
            return;
        }
        let mut member = Member::new(id.clone(), address, Instant::now());
        member.term_seen = term;
        member.last_seen = last_seen;
        self.nodes.insert(id, member);
    }

    /// Removes a member and hands it back. This node can never be removed from its own view.
    pub(crate) fn remove(&mut self, id: &NodeId) -> Option<Member> {
        if *id == self.me {
            return None;
        }
        self.nodes.remove(id)
    }

    /// Drops every member except this node.
    pub(crate) fn clear_peers(&mut self) {
        let me = self.me.clone();
        self.nodes.retain(|id, _| *id == me);
    }

    pub(crate) fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub(crate) fn get(&self, id: &NodeId) -> Option<&Member> {
        self.nodes.get(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Member> {
        self.nodes.values()
    }

    pub(crate) fn peers(&self) -> impl Iterator<Item = &Member> {
        let me = &self.me;
        self.nodes.values().filter(move |m| m.id != *me)
    }

    pub(crate) fn peer_ids(&self) -> HashSet<NodeId> {
        self.peers().map(|m| m.id.clone()).collect()
    }

    pub(crate) fn is_reachable(&self, id: &NodeId, now: Instant, liveness_timeout: Duration) -> bool {
        if *id == self.me {
            return true;
        }
        match self.nodes.get(id).and_then(|m| m.last_contact) {
            Some(last_contact) => now.saturating_duration_since(last_contact) <= liveness_timeout,
            None => false,
        }
    }

    /// Re-evaluates reachability of every peer. Returns the ids whose reachability flipped, with
    /// their new state.
    pub(crate) fn sweep_reachability(&mut self, now: Instant, liveness_timeout: Duration) -> Vec<(NodeId, bool)> {
        let mut flipped = Vec::new();
        for member in self.nodes.values_mut() {
            if member.id == self.me {
                continue;
            }
            let reachable = matches!(member.last_contact, Some(t) if now.saturating_duration_since(t) <= liveness_timeout);
            if reachable != member.reachable {
                member.reachable = reachable;
                flipped.push((member.id.clone(), reachable));
            }
        }
        flipped
    }

    /// Peers that have been silent for longer than `expiry`.
    pub(crate) fn expired_peers(&self, now: Instant, expiry: Duration) -> Vec<NodeId> {
        self.peers()
            .filter(|m| m.silent_for(now) > expiry)
            .map(|m| m.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> NodeId {
        NodeId::new(s)
    }

    #[test]
    fn duplicate_observation_only_refreshes() {
        let mut members = Members::new(id("me"), "127.0.0.1:1".into());
        let t0 = Instant::now();

        assert_eq!(members.observe(&id("a"), "127.0.0.1:2", None, t0), Observation::New);
        let first_seen = members.get(&id("a")).unwrap().last_seen;

        let t1 = t0 + Duration::from_millis(10);
        assert_eq!(
            members.observe(&id("a"), "127.0.0.1:2", None, t1),
            Observation::Refreshed
        );

        assert_eq!(members.len(), 2);
        let member = members.get(&id("a")).unwrap();
        assert_eq!(member.address, "127.0.0.1:2");
        assert!(member.last_seen >= first_seen);
    }

    #[test]
    fn address_change_is_reported() {
        let mut members = Members::new(id("me"), "127.0.0.1:1".into());
        let now = Instant::now();
        members.observe(&id("a"), "127.0.0.1:2", None, now);

        assert_eq!(
            members.observe(&id("a"), "127.0.0.1:3", None, now),
            Observation::Moved {
                previous_address: "127.0.0.1:2".into()
            }
        );
        assert_eq!(members.get(&id("a")).unwrap().address, "127.0.0.1:3");
    }

    #[test]
    fn terms_seen_only_increase() {
        let mut members = Members::new(id("me"), "x".into());
        let now = Instant::now();
        members.observe(&id("a"), "y", Some(Term::new(4)), now);
        members.touch_if_known(&id("a"), Some(Term::new(2)), now);

        assert_eq!(members.get(&id("a")).unwrap().term_seen, Term::new(4));
    }

    #[test]
    fn reachability_and_expiry() {
        let liveness = Duration::from_secs(5);
        let mut members = Members::new(id("me"), "x".into());
        let t0 = Instant::now();
        members.observe(&id("a"), "y", None, t0);
        assert!(members.insert_if_absent(id("seed"), "z".into()));
        assert!(!members.insert_if_absent(id("seed"), "z".into()));

        assert!(members.is_reachable(&id("me"), t0, liveness));
        assert!(members.is_reachable(&id("a"), t0, liveness));
        // Never heard from.
        assert!(!members.is_reachable(&id("seed"), t0, liveness));

        let later = t0 + Duration::from_secs(6);
        assert!(!members.is_reachable(&id("a"), later, liveness));

        let flipped = members.sweep_reachability(t0, liveness);
        assert_eq!(flipped, vec![(id("a"), true)]);
        let flipped = members.sweep_reachability(later, liveness);
        assert_eq!(flipped, vec![(id("a"), false)]);

        let mut expired = members.expired_peers(t0 + Duration::from_secs(70), Duration::from_secs(60));
        expired.sort();
        assert_eq!(expired, vec![id("a"), id("seed")]);
    }

    #[test]
    fn never_removes_self() {
        let mut members = Members::new(id("me"), "x".into());
        members.observe(&id("a"), "y", None, Instant::now());

        assert!(members.remove(&id("me")).is_none());
        assert_eq!(members.remove(&id("a")).map(|m| m.address), Some("y".to_string()));
        assert!(members.remove(&id("a")).is_none());
        assert_eq!(members.len(), 1);
        assert!(members.peer_ids().is_empty());
    }
}
