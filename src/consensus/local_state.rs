use crate::consensus::{NodeId, Term};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// PersistentLocalState is used whenever the raft algorithm requires that something is persisted
/// to guarantee safety. Not everything that outlives a restart has to go through this, only
/// algorithm-correctness-critical ones.
///
/// Store methods should be implemented atomically via a CAS like operation. Similar to most CAS
/// method signatures, the CAS store methods will return true if we have mutated state. A store
/// that fails to persist leaves the state untouched.
pub(crate) trait PersistentLocalState {
    /// Set current term to `new_term` atomically, iff it is larger than current term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool>;

    /// Store our vote for the latest term iff the latest term (internal state) is the same term as
    /// the one provided, and we have not stored a vote for the latest term.
    ///
    /// CAS: Return true if we successfully mutated state.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: NodeId) -> io::Result<bool>;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> io::Result<Term>;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<Arc<NodeId>>);
}

/// Term and vote kept in RAM. A restart resumes from the term recorded in the last snapshot,
/// with no vote cast for it.
#[derive(Clone)]
pub(crate) struct VolatileLocalState {
    current_term: Term,
    voted_for_this_term: Option<Arc<NodeId>>,
    my_node_id: Arc<NodeId>,
}

impl VolatileLocalState {
    pub(crate) fn new(my_node_id: NodeId, restored_term: Term) -> Self {
        VolatileLocalState {
            current_term: restored_term,
            voted_for_this_term: None,
            my_node_id: Arc::new(my_node_id),
        }
    }

    fn try_store_term(&mut self, new_term: Term) -> bool {
        if new_term <= self.current_term {
            return false;
        }
        self.current_term = new_term;
        self.voted_for_this_term = None;
        true
    }

    fn try_store_vote(&mut self, expected_term: Term, vote: NodeId) -> bool {
        if expected_term != self.current_term || self.voted_for_this_term.is_some() {
            return false;
        }
        self.voted_for_this_term.replace(Arc::new(vote));
        true
    }

    fn start_new_term(&mut self) -> Term {
        self.current_term.incr();
        self.voted_for_this_term.replace(self.my_node_id.clone());
        self.current_term
    }

    fn record(&self) -> TermRecord {
        TermRecord {
            term: self.current_term,
            voted_for: self.voted_for_this_term.as_deref().cloned(),
        }
    }
}

impl PersistentLocalState for VolatileLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool> {
        Ok(self.try_store_term(new_term))
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: NodeId) -> io::Result<bool> {
        Ok(self.try_store_vote(expected_term, vote))
    }

    fn increment_term_and_vote_for_self(&mut self) -> io::Result<Term> {
        Ok(self.start_new_term())
    }

    fn current_term(&self) -> Term {
        self.current_term
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<NodeId>>) {
        (self.current_term, self.voted_for_this_term.clone())
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct TermRecord {
    term: Term,
    voted_for: Option<NodeId>,
}

/// Term and vote backed by a small JSON file. Every change is on disk before the call returns,
/// so a node that restarts mid-term remembers who it voted for.
pub(crate) struct DurableLocalState {
    memory: VolatileLocalState,
    path: PathBuf,
}

impl DurableLocalState {
    /// Resumes from `path` if it exists. A snapshot taken in a later term than the file wins,
    /// with no vote.
    pub(crate) fn load(path: PathBuf, my_node_id: NodeId, snapshot_term: Term) -> io::Result<Self> {
        let mut memory = VolatileLocalState::new(my_node_id, snapshot_term);
        match fs::read(&path) {
            Ok(bytes) => {
                let record: TermRecord =
                    serde_json::from_slice(&bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                if record.term >= snapshot_term {
                    memory.current_term = record.term;
                    memory.voted_for_this_term = record.voted_for.map(Arc::new);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        Ok(DurableLocalState { memory, path })
    }

    // Mutate a copy, write it, then adopt it.
    fn persist_if<F>(&mut self, mutate: F) -> io::Result<bool>
    where
        F: FnOnce(&mut VolatileLocalState) -> bool,
    {
        let mut next = self.memory.clone();
        if !mutate(&mut next) {
            return Ok(false);
        }
        write_record(&self.path, &next.record())?;
        self.memory = next;
        Ok(true)
    }
}

impl PersistentLocalState for DurableLocalState {
    fn store_term_if_increased(&mut self, new_term: Term) -> io::Result<bool> {
        self.persist_if(|state| state.try_store_term(new_term))
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: NodeId) -> io::Result<bool> {
        self.persist_if(|state| state.try_store_vote(expected_term, vote))
    }

    fn increment_term_and_vote_for_self(&mut self) -> io::Result<Term> {
        self.persist_if(|state| {
            state.start_new_term();
            true
        })?;
        Ok(self.memory.current_term)
    }

    fn current_term(&self) -> Term {
        self.memory.current_term()
    }

    fn voted_for_current_term(&self) -> (Term, Option<Arc<NodeId>>) {
        self.memory.voted_for_current_term()
    }
}

fn write_record(path: &Path, record: &TermRecord) -> io::Result<()> {
    let bytes = serde_json::to_vec(record).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_only_moves_forward_and_clears_vote() {
        let mut state = VolatileLocalState::new(NodeId::new("me"), Term::new(3));

        assert!(!state.store_term_if_increased(Term::new(2)).unwrap());
        assert!(!state.store_term_if_increased(Term::new(3)).unwrap());
        assert!(state.store_vote_for_term_if_unvoted(Term::new(3), NodeId::new("a")).unwrap());
        assert!(!state.store_vote_for_term_if_unvoted(Term::new(3), NodeId::new("b")).unwrap());

        assert!(state.store_term_if_increased(Term::new(5)).unwrap());
        assert_eq!(state.voted_for_current_term(), (Term::new(5), None));
    }

    #[test]
    fn candidate_votes_for_itself() {
        let mut state = VolatileLocalState::new(NodeId::new("me"), Term::new(0));

        assert_eq!(state.increment_term_and_vote_for_self().unwrap(), Term::new(1));
        let (term, voted_for) = state.voted_for_current_term();
        assert_eq!(term, Term::new(1));
        assert_eq!(voted_for.as_deref(), Some(&NodeId::new("me")));
        assert!(!state.store_vote_for_term_if_unvoted(Term::new(1), NodeId::new("other")).unwrap());
    }

    #[test]
    fn vote_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("term.json");

        let mut state = DurableLocalState::load(path.clone(), NodeId::new("me"), Term::new(0)).unwrap();
        assert!(state.store_term_if_increased(Term::new(4)).unwrap());
        assert!(state.store_vote_for_term_if_unvoted(Term::new(4), NodeId::new("a")).unwrap());
        drop(state);

        let mut restarted = DurableLocalState::load(path, NodeId::new("me"), Term::new(2)).unwrap();
        let (term, voted_for) = restarted.voted_for_current_term();
        assert_eq!(term, Term::new(4));
        assert_eq!(voted_for.as_deref(), Some(&NodeId::new("a")));
        assert!(!restarted.store_vote_for_term_if_unvoted(Term::new(4), NodeId::new("b")).unwrap());
    }

    #[test]
    fn newer_snapshot_term_wins_over_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("term.json");

        let mut state = DurableLocalState::load(path.clone(), NodeId::new("me"), Term::new(0)).unwrap();
        assert_eq!(state.increment_term_and_vote_for_self().unwrap(), Term::new(1));
        drop(state);

        let restarted = DurableLocalState::load(path, NodeId::new("me"), Term::new(7)).unwrap();
        assert_eq!(restarted.voted_for_current_term(), (Term::new(7), None));
    }

    #[test]
    fn failed_write_leaves_state_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("term.json");
        let mut state = DurableLocalState::load(path.clone(), NodeId::new("me"), Term::new(3)).unwrap();
        // Nothing can be renamed over a directory.
        fs::create_dir(&path).unwrap();

        assert!(state.store_term_if_increased(Term::new(4)).is_err());
        assert_eq!(state.voted_for_current_term(), (Term::new(3), None));
        assert!(state.increment_term_and_vote_for_self().is_err());
        assert_eq!(state.current_term(), Term::new(3));
    }

    #[test]
    fn corrupt_file_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("term.json");
        fs::write(&path, b"not json").unwrap();

        let err = DurableLocalState::load(path, NodeId::new("me"), Term::new(0)).err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
