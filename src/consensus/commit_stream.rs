use crate::consensus::Term;
use bytes::Bytes;
use tokio::sync::mpsc;

pub(crate) struct CommitStreamPublisher {
    sender: mpsc::UnboundedSender<CommittedEntry>,
}

/// Committed log entries, in index order, as they are applied locally.
pub struct CommitStream {
    receiver: mpsc::UnboundedReceiver<CommittedEntry>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommittedEntry {
    pub term: u64,
    pub index: u64,
    /// Encoded cluster command.
    pub data: Bytes,
}

pub(crate) fn new() -> (CommitStreamPublisher, CommitStream) {
    let (tx, rx) = mpsc::unbounded_channel();

    (CommitStreamPublisher { sender: tx }, CommitStream { receiver: rx })
}

impl CommitStreamPublisher {
    pub(crate) fn notify_commit(&self, logger: &slog::Logger, term: Term, index: u64, data: Bytes) {
        let committed_entry = CommittedEntry {
            term: term.as_u64(),
            index,
            data,
        };

        if self.sender.send(committed_entry).is_err() {
            slog::debug!(logger, "CommitStream has disconnected.");
        }
    }
}

impl CommitStream {
    pub async fn recv(&mut self) -> Option<CommittedEntry> {
        self.receiver.recv().await
    }
}
