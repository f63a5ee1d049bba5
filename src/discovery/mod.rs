mod announcer;
mod message;
mod transport;

pub(crate) use announcer::run_announcer;
pub(crate) use announcer::AnnouncedIdentity;
pub use message::DiscoveryCodecError;
pub use message::DiscoveryMessage;
pub use message::MAX_DATAGRAM_SIZE;
pub use transport::broadcast;
pub use transport::DiscoveryError;
pub(crate) use transport::serve_discovery;
pub(crate) use transport::ReceivedAnnouncement;
