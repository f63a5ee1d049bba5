mod addressing;
mod cluster_config;
mod options;

pub use addressing::resolve;
pub use addressing::AddressResolveError;
pub use cluster_config::ClusterConfig;
pub use cluster_config::NetworkConfig;
pub use cluster_config::RpcConfig;
pub use cluster_config::SeedPeer;
pub use options::ClusterOptions;
pub use options::ClusterOptionsValidated;
pub use options::OptionsError;
