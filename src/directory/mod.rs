mod directory;
mod handle;
mod join;
mod snapshot_store;

pub use directory::ClusterDirectory;
pub use directory::OpenError;
pub use handle::ClusterHandle;
pub use handle::ProposedEntry;
pub use snapshot_store::SnapshotDiagnostics;
pub use snapshot_store::SnapshotError;
