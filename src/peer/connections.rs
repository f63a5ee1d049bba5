use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// Connection handles to peers, keyed by address and created on first use. Concurrent first
/// callers for the same address share a single initialization; a failed initialization is not
/// cached, so the next caller tries again.
pub(crate) struct PeerConnections<C> {
    connections: Mutex<HashMap<String, Arc<OnceCell<C>>>>,
}

impl<C: Clone> PeerConnections<C> {
    pub(crate) fn new() -> Self {
        PeerConnections {
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) async fn get_or_connect<F, Fut, E>(&self, address: &str, connect: F) -> Result<C, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        // The map lock is only held to find the slot, never across the connect.
        let slot = {
            let mut connections = self.connections.lock().expect("PeerConnections mutex guard poisoned");
            connections
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        slot.get_or_try_init(connect).await.map(C::clone)
    }

    /// Drops the handle for `address`; the next call reconnects. True if one was held.
    pub(crate) fn forget(&self, address: &str) -> bool {
        self.connections
            .lock()
            .expect("PeerConnections mutex guard poisoned")
            .remove(address)
            .is_some()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.connections.lock().expect("PeerConnections mutex guard poisoned").len()
    }
}
