mod module;

pub use module::ClusterModule;
pub use module::ClusterSetupError;
pub use module::ClusterStartError;
pub use module::ClusterStopError;
