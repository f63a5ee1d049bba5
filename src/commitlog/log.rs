use std::{fmt, io};

/// Index is an index of an entry in the log; i.e. a log entry's index. It is never 0; "no entry"
/// is modeled as `Option<Index>` and travels as 0 on the wire.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(u64);

impl Index {
    pub fn new(index: u64) -> Self {
        assert_ne!(index, 0, "Log index 0 is reserved for 'no entry'");
        Index(index)
    }

    /// Maps the wire representation (0 means none) into an optional index.
    pub fn from_u64_opt(index: u64) -> Option<Self> {
        match index {
            0 => None,
            i => Some(Index(i)),
        }
    }

    pub fn start_index() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index(self.0 + delta)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        Self::from_u64_opt(self.0.saturating_sub(delta))
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Converts an optional index to its wire form.
pub fn index_to_u64(index: Option<Index>) -> u64 {
    index.map(|i| i.as_u64()).unwrap_or(0)
}

/// Log is an append only log of replicated entries. It supports dropping a prefix of entries
/// (compaction) once their effect has been captured elsewhere.
///
/// Log indexes entries starting from 1. There will be no entry existing at index 0. The first
/// entry is written at index 1.
pub(crate) trait Log<E: Entry> {
    /// append() appends a log entry to the log at the next log entry index, then returns
    /// the log entry index that was just used to append the entry.
    fn append(&mut self, entry: E) -> Result<Index, io::Error>;

    /// Read log entry at specified index. Returns None for compacted or not yet written indexes.
    fn read(&self, index: Index) -> Result<Option<E>, io::Error>;

    /// Removes anything starting at `index` and later.
    fn truncate(&mut self, index: Index);

    /// Drops every entry up to and including `index`.
    fn compact(&mut self, index: Index);

    /// Drops everything and restarts the log so that the next appended entry lands right after
    /// `last_included`.
    fn reset(&mut self, last_included: Option<Index>);

    /// Index of the first entry still held, or `next_index()` if nothing is held.
    fn first_index(&self) -> Index;

    /// next_index returns the next index that will be used to append an entry.
    fn next_index(&self) -> Index;

    /// Number of entries currently held (i.e. not compacted).
    fn retained_len(&self) -> usize {
        (self.next_index().as_u64() - self.first_index().as_u64()) as usize
    }
}

// Choice of Vec<u8> vs Bytes will depend on whats easier for disk to use.
pub(crate) trait Entry: Clone + From<Vec<u8>> + Into<Vec<u8>> {}
