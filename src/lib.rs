mod actor;
mod commitlog;
mod config;
mod consensus;
mod directory;
mod discovery;
mod lifecycle;
mod peer;
mod server;
mod grpc {
    include!("../generated/cluster.rs");
}

pub use config::resolve;
pub use config::AddressResolveError;
pub use config::ClusterConfig;
pub use config::ClusterOptions;
pub use config::ClusterOptionsValidated;
pub use config::NetworkConfig;
pub use config::OptionsError;
pub use config::RpcConfig;
pub use config::SeedPeer;
pub use consensus::ClusterStateListener;
pub use consensus::ClusterStateView;
pub use consensus::CommitStream;
pub use consensus::CommittedEntry;
pub use consensus::LeaderInfo;
pub use consensus::LogEntryView;
pub use consensus::NodeId;
pub use consensus::NodeView;
pub use consensus::PersistedClusterState;
pub use consensus::PersistedMember;
pub use consensus::ProposeError;
pub use consensus::Role;
pub use consensus::Snapshot;
pub use consensus::Term;
pub use directory::ClusterDirectory;
pub use directory::ClusterHandle;
pub use directory::OpenError;
pub use directory::ProposedEntry;
pub use directory::SnapshotDiagnostics;
pub use directory::SnapshotError;
pub use discovery::broadcast;
pub use discovery::DiscoveryCodecError;
pub use discovery::DiscoveryError;
pub use discovery::DiscoveryMessage;
pub use discovery::MAX_DATAGRAM_SIZE;
pub use lifecycle::ClusterModule;
pub use lifecycle::ClusterSetupError;
pub use lifecycle::ClusterStartError;
pub use lifecycle::ClusterStopError;
pub use server::RpcServerError;
