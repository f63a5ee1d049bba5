use crate::commitlog::{Index, Log};
use crate::consensus::log_entry::LogEntry;
use crate::consensus::Term;
use std::io;

/// RaftLog is the raft-specific log facade. It tracks the snapshot boundary (the last entry
/// folded into a snapshot) on top of the generic log, plus the commit and applied indexes.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - appended locally, not yet replicated to majority
/// 2. Committed - replicated to majority
/// 3. Applied - a committed entry that has also been applied to the state machine
pub(crate) struct RaftLog<L: Log<LogEntry>> {
    log: L,
    // Last entry captured by the latest snapshot. Entries up to here are no longer in `log`.
    snapshot_boundary: Option<(Term, Index)>,
    // Metadata about the highest log entry that we've locally written.
    latest_entry_metadata: Option<(Term, Index)>,
    // Index of highest log entry known to be committed. None if nothing is committed.
    commit_index: Option<Index>,
    // Index of highest log entry applied to state machine. None if nothing is applied.
    last_applied_index: Option<Index>,
}

/// What we know about the term of the entry at some index.
#[derive(Debug, PartialEq)]
pub(crate) enum EntryTerm {
    Present(Term),
    /// Folded into a snapshot; committed, so it matches any leader's entry at that index.
    Compacted,
    Missing,
}

impl<L: Log<LogEntry>> RaftLog<L> {
    /// `log` must start right after `snapshot_boundary` (or be empty when there's no snapshot).
    pub(crate) fn new(log: L, snapshot_boundary: Option<(Term, Index)>) -> Self {
        let boundary_index = snapshot_boundary.map(|(_, i)| i);
        assert_eq!(
            log.next_index(),
            boundary_index.map(|i| i.plus(1)).unwrap_or_else(Index::start_index),
            "We only know how to initialize from an empty log."
        );

        RaftLog {
            log,
            snapshot_boundary,
            latest_entry_metadata: snapshot_boundary,
            commit_index: boundary_index,
            last_applied_index: boundary_index,
        }
    }

    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.latest_entry_metadata
    }

    pub(crate) fn latest_index(&self) -> Option<Index> {
        self.latest_entry_metadata.map(|(_, i)| i)
    }

    pub(crate) fn snapshot_boundary(&self) -> Option<(Term, Index)> {
        self.snapshot_boundary
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    pub(crate) fn last_applied_index(&self) -> Option<Index> {
        self.last_applied_index
    }

    pub(crate) fn retained_len(&self) -> usize {
        self.log.retained_len()
    }

    pub(crate) fn read(&self, index: Index) -> Result<Option<LogEntry>, io::Error> {
        self.log.read(index)
    }

    pub(crate) fn is_compacted(&self, index: Index) -> bool {
        matches!(self.snapshot_boundary, Some((_, boundary)) if index <= boundary)
    }

    pub(crate) fn entry_term(&self, index: Index) -> Result<EntryTerm, io::Error> {
        if let Some((boundary_term, boundary_index)) = self.snapshot_boundary {
            if index == boundary_index {
                return Ok(EntryTerm::Present(boundary_term));
            }
            if index < boundary_index {
                return Ok(EntryTerm::Compacted);
            }
        }

        Ok(match self.log.read(index)? {
            Some(entry) => EntryTerm::Present(entry.term),
            None => EntryTerm::Missing,
        })
    }

    /// Remove anything starting at `index` and later.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        assert!(
            !matches!(self.commit_index, Some(ci) if index <= ci),
            "Can't truncate committed entries. Truncate at {:?}, commit index {:?}",
            index,
            self.commit_index,
        );

        let new_latest_entry_metadata = match index.checked_minus(1) {
            None => None,
            Some(new_latest_index) => match self.entry_term(new_latest_index)? {
                EntryTerm::Present(term) => Some((term, new_latest_index)),
                EntryTerm::Compacted | EntryTerm::Missing => None,
            },
        };

        // Only update log after we've successfully read what new state will be.
        self.log.truncate(index);

        self.latest_entry_metadata = new_latest_entry_metadata;
        Ok(())
    }

    pub(crate) fn append(&mut self, entry: LogEntry) -> Result<Index, io::Error> {
        let appended_term = entry.term;
        let appended_index = self.log.append(entry)?;
        // Only update state after log action completes.
        self.latest_entry_metadata = Some((appended_term, appended_index));

        Ok(appended_index)
    }

    /// Leader path.
    ///
    /// > If there exists an N such that N > commitIndex, a majority
    /// > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
    /// > set commitIndex = N (§5.3, §5.4).
    ///
    /// Returns true if the commit index moved.
    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<bool, io::Error> {
        if matches!(self.commit_index, Some(ci) if tentative_new_commit_index <= ci) {
            return Ok(false);
        }

        match self.entry_term(tentative_new_commit_index)? {
            EntryTerm::Present(term) if term == current_term => {
                self.ratchet_fwd_commit_index_panicking(tentative_new_commit_index);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Follower path: the leader vouches for `new_commit_index`. Returns true if it moved.
    pub(crate) fn ratchet_fwd_commit_index_if_changed(&mut self, new_commit_index: Index) -> bool {
        if matches!(self.commit_index, Some(ci) if new_commit_index <= ci) {
            return false;
        }

        self.ratchet_fwd_commit_index_panicking(new_commit_index);
        true
    }

    fn ratchet_fwd_commit_index_panicking(&mut self, new_commit_index: Index) {
        // Assert we only mark as committed if we have the entry locally.
        let latest_locally_written_index = self
            .latest_index()
            .expect("Can't ratchet commit index forward if we don't have any local logs");
        assert!(
            latest_locally_written_index >= new_commit_index,
            "Can't ratchet commit index forwards past our local log. Expected [latest log] {:?} >= {:?} [input]",
            latest_locally_written_index,
            new_commit_index,
        );

        self.commit_index.replace(new_commit_index);
    }

    /// The next committed entry that hasn't been applied yet.
    pub(crate) fn next_to_apply(&self) -> Result<Option<(Index, LogEntry)>, io::Error> {
        let commit_index = match self.commit_index {
            Some(ci) => ci,
            None => return Ok(None),
        };
        let next_index = self
            .last_applied_index
            .map(|i| i.plus(1))
            .unwrap_or_else(Index::start_index);
        if next_index > commit_index {
            return Ok(None);
        }

        match self.log.read(next_index)? {
            Some(entry) => Ok(Some((next_index, entry))),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Committed log entry {:?} is missing", next_index),
            )),
        }
    }

    pub(crate) fn mark_applied(&mut self, index: Index) {
        self.last_applied_index.replace(index);
    }

    /// Drops the log prefix up to and including `index`, which must already be applied.
    pub(crate) fn compact_through(&mut self, index: Index) -> Result<(), io::Error> {
        assert!(
            matches!(self.last_applied_index, Some(applied) if index <= applied),
            "Can only compact applied entries"
        );
        let term = match self.entry_term(index)? {
            EntryTerm::Present(term) => term,
            EntryTerm::Compacted => return Ok(()),
            EntryTerm::Missing => {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("Can't compact through missing entry {:?}", index),
                ))
            }
        };

        self.log.compact(index);
        self.snapshot_boundary = Some((term, index));
        Ok(())
    }

    /// Replaces local history with a snapshot ending at `(term, index)`. A matching suffix beyond
    /// the snapshot is kept; anything else is discarded.
    pub(crate) fn install_snapshot(&mut self, term: Term, index: Index) -> Result<(), io::Error> {
        let keep_suffix = self.entry_term(index)? == EntryTerm::Present(term);
        if keep_suffix {
            self.log.compact(index);
        } else {
            self.log.reset(Some(index));
            self.latest_entry_metadata = Some((term, index));
        }

        self.snapshot_boundary = Some((term, index));
        if !matches!(self.commit_index, Some(ci) if ci >= index) {
            self.commit_index = Some(index);
        }
        if !matches!(self.last_applied_index, Some(applied) if applied >= index) {
            self.last_applied_index = Some(index);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::InMemoryLog;

    fn log_with_terms(terms: &[u64]) -> RaftLog<InMemoryLog<LogEntry>> {
        let mut log = RaftLog::new(InMemoryLog::create(), None);
        for t in terms {
            log.append(LogEntry {
                term: Term::new(*t),
                data: vec![],
            })
            .unwrap();
        }
        log
    }

    #[test]
    fn commit_only_for_current_term_entries() {
        let mut log = log_with_terms(&[1, 1, 2, 2, 2, 2, 2]);

        // Majority at 2, but index 2 is from an older term.
        assert!(!log.ratchet_fwd_commit_index_if_valid(Index::new(2), Term::new(2)).unwrap());
        assert_eq!(log.commit_index(), None);

        // Majority acknowledges up to 6: commit 6, not 7.
        assert!(log.ratchet_fwd_commit_index_if_valid(Index::new(6), Term::new(2)).unwrap());
        assert_eq!(log.commit_index(), Some(Index::new(6)));

        // Never backwards.
        assert!(!log.ratchet_fwd_commit_index_if_valid(Index::new(5), Term::new(2)).unwrap());
        assert_eq!(log.commit_index(), Some(Index::new(6)));

        assert!(log.ratchet_fwd_commit_index_if_valid(Index::new(7), Term::new(2)).unwrap());
        assert_eq!(log.commit_index(), Some(Index::new(7)));
    }

    #[test]
    fn apply_in_order() {
        let mut log = log_with_terms(&[1, 1, 1]);
        assert!(log.next_to_apply().unwrap().is_none());

        log.ratchet_fwd_commit_index_if_changed(Index::new(2));
        let (index, _) = log.next_to_apply().unwrap().unwrap();
        assert_eq!(index, Index::new(1));
        log.mark_applied(index);
        let (index, _) = log.next_to_apply().unwrap().unwrap();
        assert_eq!(index, Index::new(2));
        log.mark_applied(index);
        assert!(log.next_to_apply().unwrap().is_none());
    }

    #[test]
    fn truncate_conflicting_suffix() {
        let mut log = log_with_terms(&[1, 1, 2, 2]);
        log.truncate(Index::new(3)).unwrap();

        assert_eq!(log.latest_entry(), Some((Term::new(1), Index::new(2))));
        assert_eq!(log.entry_term(Index::new(3)).unwrap(), EntryTerm::Missing);
    }

    #[test]
    fn compaction_preserves_terms_at_boundary() {
        let mut log = log_with_terms(&[1, 2, 2, 3]);
        log.ratchet_fwd_commit_index_if_changed(Index::new(3));
        for i in 1..=3 {
            log.mark_applied(Index::new(i));
        }

        log.compact_through(Index::new(3)).unwrap();

        assert_eq!(log.retained_len(), 1);
        assert_eq!(log.snapshot_boundary(), Some((Term::new(2), Index::new(3))));
        assert_eq!(log.entry_term(Index::new(3)).unwrap(), EntryTerm::Present(Term::new(2)));
        assert_eq!(log.entry_term(Index::new(1)).unwrap(), EntryTerm::Compacted);
        assert_eq!(log.entry_term(Index::new(4)).unwrap(), EntryTerm::Present(Term::new(3)));
        assert!(log.is_compacted(Index::new(2)));
        assert!(!log.is_compacted(Index::new(4)));
    }

    #[test]
    fn install_snapshot_over_divergent_log() {
        let mut log = log_with_terms(&[1, 1, 1]);
        log.install_snapshot(Term::new(4), Index::new(10)).unwrap();

        assert_eq!(log.latest_entry(), Some((Term::new(4), Index::new(10))));
        assert_eq!(log.commit_index(), Some(Index::new(10)));
        assert_eq!(log.last_applied_index(), Some(Index::new(10)));
        assert_eq!(
            log.append(LogEntry {
                term: Term::new(4),
                data: vec![]
            })
            .unwrap(),
            Index::new(11)
        );
    }

    #[test]
    fn install_snapshot_keeps_matching_suffix() {
        let mut log = log_with_terms(&[1, 2, 2, 2]);
        log.install_snapshot(Term::new(2), Index::new(2)).unwrap();

        assert_eq!(log.latest_entry(), Some((Term::new(2), Index::new(4))));
        assert_eq!(log.retained_len(), 2);
        assert_eq!(log.commit_index(), Some(Index::new(2)));
    }

    #[test]
    fn restart_from_snapshot_boundary() {
        let boundary = Some((Term::new(3), Index::new(20)));
        let log = RaftLog::new(InMemoryLog::starting_after(Some(Index::new(20))), boundary);

        assert_eq!(log.latest_entry(), boundary);
        assert_eq!(log.commit_index(), Some(Index::new(20)));
        assert!(log.next_to_apply().unwrap().is_none());
    }
}
