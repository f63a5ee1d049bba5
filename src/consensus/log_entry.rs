use crate::commitlog;
use crate::consensus::Term;
use bytes::{Buf, BufMut};

/// Byte representation:
///
/// ```text
/// |                                         1                           |
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 0 | 1 | 2 | 3 | 4 | 5 | ... |
/// +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+-...-+
/// |Vrs|     Term (8 bytes, BE)         |   Data (variable size)      ... |
/// +---+-------------------------------+-----------------------------...-+
/// ```
///
/// * `Vrs` - version of the serialized payload
/// * `Term` - leadership term when this entry was created
/// * `Data` - encoded `ClusterCommand`
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct LogEntry {
    pub(crate) term: Term,
    pub(crate) data: Vec<u8>,
}

const LOG_ENTRY_FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 8;

impl commitlog::Entry for LogEntry {}

impl From<Vec<u8>> for LogEntry {
    fn from(bytes: Vec<u8>) -> Self {
        // Bytes only ever come from `Into<Vec<u8>>` below, so a bad header is a bug.
        assert!(bytes.len() >= HEADER_LEN, "Log entry shorter than its header");
        let mut buf = &bytes[..];
        let version = buf.get_u8();
        assert_eq!(version, LOG_ENTRY_FORMAT_VERSION, "Unknown log entry format");
        let term = buf.get_u64();

        LogEntry {
            term: Term::new(term),
            data: buf.to_vec(),
        }
    }
}

impl From<LogEntry> for Vec<u8> {
    fn from(entry: LogEntry) -> Self {
        let mut bytes = Vec::with_capacity(HEADER_LEN + entry.data.len());
        bytes.put_u8(LOG_ENTRY_FORMAT_VERSION);
        bytes.put_u64(entry.term.as_u64());
        bytes.put_slice(&entry.data);

        bytes
    }
}
