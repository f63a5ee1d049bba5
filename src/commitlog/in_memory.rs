use crate::commitlog::{Entry, Index, Log};
use std::io;
use std::marker::PhantomData;

/// Holds the log in RAM. Durability of the cluster state comes from snapshots instead.
pub(crate) struct InMemoryLog<E: Entry> {
    // We don't *need* to convert these to bytes. We could just hold the original entry in memory,
    // but we want to exercise the conversion logic.
    log: Vec<Vec<u8>>,
    // Number of entries dropped from the front of the log.
    offset: u64,
    _pd: PhantomData<E>,
}

impl<E: Entry> InMemoryLog<E> {
    #[cfg(test)]
    pub(crate) fn create() -> Self {
        Self::starting_after(None)
    }

    pub(crate) fn starting_after(last_included: Option<Index>) -> Self {
        InMemoryLog {
            log: vec![],
            offset: last_included.map(|i| i.as_u64()).unwrap_or(0),
            _pd: PhantomData::default(),
        }
    }

    fn vec_index(&self, index: Index) -> Option<usize> {
        // Log API states that Index starts from 1.
        if index.as_u64() <= self.offset {
            None
        } else {
            Some((index.as_u64() - self.offset - 1) as usize)
        }
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        self.log.push(entry.into());

        Ok(Index::new(self.offset + self.log.len() as u64))
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        let opt_entry = self
            .vec_index(index)
            .and_then(|i| self.log.get(i))
            .cloned()
            .map(E::from);

        Ok(opt_entry)
    }

    fn truncate(&mut self, index: Index) {
        match self.vec_index(index) {
            Some(vec_index) => self.log.truncate(vec_index),
            None => self.log.clear(),
        }
    }

    fn compact(&mut self, index: Index) {
        match self.vec_index(index) {
            None => {}
            Some(vec_index) if vec_index >= self.log.len() => {
                self.log.clear();
                self.offset = index.as_u64();
            }
            Some(vec_index) => {
                self.log.drain(..=vec_index);
                self.offset = index.as_u64();
            }
        }
    }

    fn reset(&mut self, last_included: Option<Index>) {
        self.log.clear();
        self.offset = last_included.map(|i| i.as_u64()).unwrap_or(0);
    }

    fn first_index(&self) -> Index {
        Index::new(self.offset + 1)
    }

    fn next_index(&self) -> Index {
        Index::new(self.offset + self.log.len() as u64 + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Raw(Vec<u8>);

    impl Entry for Raw {}

    impl From<Vec<u8>> for Raw {
        fn from(bytes: Vec<u8>) -> Self {
            Raw(bytes)
        }
    }

    impl From<Raw> for Vec<u8> {
        fn from(raw: Raw) -> Self {
            raw.0
        }
    }

    fn filled(n: u8) -> InMemoryLog<Raw> {
        let mut log = InMemoryLog::create();
        for i in 1..=n {
            log.append(Raw(vec![i])).unwrap();
        }
        log
    }

    #[test]
    fn append_read_truncate() {
        let mut log = filled(3);
        assert_eq!(log.next_index(), Index::new(4));
        assert_eq!(log.read(Index::new(2)).unwrap(), Some(Raw(vec![2])));
        assert_eq!(log.read(Index::new(4)).unwrap(), None);

        log.truncate(Index::new(2));
        assert_eq!(log.next_index(), Index::new(2));
        assert_eq!(log.read(Index::new(2)).unwrap(), None);
        assert_eq!(log.append(Raw(vec![9])).unwrap(), Index::new(2));
    }

    #[test]
    fn compaction_keeps_indexes_stable() {
        let mut log = filled(5);
        log.compact(Index::new(3));

        assert_eq!(log.first_index(), Index::new(4));
        assert_eq!(log.retained_len(), 2);
        assert_eq!(log.read(Index::new(3)).unwrap(), None);
        assert_eq!(log.read(Index::new(4)).unwrap(), Some(Raw(vec![4])));
        assert_eq!(log.append(Raw(vec![6])).unwrap(), Index::new(6));

        // Compacting past the end empties the log but keeps numbering.
        log.compact(Index::new(10));
        assert_eq!(log.retained_len(), 0);
        assert_eq!(log.next_index(), Index::new(11));
    }

    #[test]
    fn reset_after_snapshot() {
        let mut log = filled(2);
        log.reset(Some(Index::new(40)));

        assert_eq!(log.first_index(), Index::new(41));
        assert_eq!(log.append(Raw(vec![1])).unwrap(), Index::new(41));

        log.reset(None);
        assert_eq!(log.next_index(), Index::start_index());
    }
}
