use std::sync::{Arc, Mutex};
use tokio::time::Instant;

/// A deadline shared between a timer handle (which arms it) and its task (which consumes it).
#[derive(Clone, Default)]
pub(super) struct SharedDeadline {
    data: Arc<Mutex<Option<Instant>>>,
}

impl SharedDeadline {
    pub(super) fn new() -> Self {
        SharedDeadline {
            data: Arc::new(Mutex::new(None)),
        }
    }

    pub(super) fn arm(&self, deadline: Instant) {
        self.data
            .lock()
            .expect("SharedDeadline.arm() mutex guard poison")
            .replace(deadline);
    }

    pub(super) fn take(&self) -> Option<Instant> {
        self.data
            .lock()
            .expect("SharedDeadline.take() mutex guard poison")
            .take()
    }
}
