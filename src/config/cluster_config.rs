use crate::config::addressing::{self, AddressResolveError};
use crate::config::ClusterOptions;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Everything a node needs to join (or form) a cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// When false, the cluster module does nothing on Setup/Start/Stop.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub cluster_name: String,
    pub node_id: String,
    pub rpc: RpcConfig,
    pub network: NetworkConfig,
    #[serde(default)]
    pub seeds: Vec<SeedPeer>,
    #[serde(default)]
    pub allow_bootstrap: bool,
    pub snapshot_path: PathBuf,
    #[serde(default)]
    pub options: ClusterOptions,
}

/// Where the RPC server listens, and the address peers should use to reach it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcConfig {
    pub bind_host: String,
    pub port: u16,
    /// Host announced to peers. Falls back to `bind_host`.
    #[serde(default)]
    pub advertise_host: Option<String>,
}

/// Discovery datagram addressing. When `group` is a multicast address the listener joins it on
/// `interface`; any other address is bound directly and sent to as unicast.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    pub group: String,
    pub port: u16,
    /// Local interface address used for multicast membership. Unspecified when absent.
    #[serde(default)]
    pub interface: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedPeer {
    pub node_id: String,
    /// RPC address (`host:port`) of the seed.
    pub address: String,
}

fn default_enabled() -> bool {
    true
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

impl ClusterConfig {
    /// Term and vote live next to the snapshot: `cluster.json` pairs with `cluster.term.json`.
    pub fn term_state_path(&self) -> PathBuf {
        self.snapshot_path.with_extension("term.json")
    }
}

impl RpcConfig {
    pub async fn bind_addr(&self) -> Result<SocketAddr, AddressResolveError> {
        addressing::resolve(&addressing::host_port(&self.bind_host, self.port)).await
    }

    /// `host:port` other members dial to reach this node.
    pub fn advertised_address(&self) -> String {
        let host = self.advertise_host.as_deref().unwrap_or(&self.bind_host);
        addressing::host_port(host, self.port)
    }
}

impl NetworkConfig {
    /// Destination of discovery announcements.
    pub async fn group_addr(&self) -> Result<SocketAddr, AddressResolveError> {
        addressing::resolve(&addressing::host_port(&self.group, self.port)).await
    }

    /// Local address the discovery listener binds to.
    pub async fn listen_addr(&self) -> Result<SocketAddr, AddressResolveError> {
        let group = self.group_addr().await?;
        if group.ip().is_multicast() {
            addressing::resolve(&addressing::host_port(&self.bind_host, self.port)).await
        } else {
            // Unicast: listen exactly where announcements are sent.
            Ok(group)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "cluster_name": "prod",
        "node_id": "node-1",
        "rpc": { "bind_host": "127.0.0.1", "port": 7001 },
        "network": { "group": "239.0.0.1", "port": 9999 },
        "seeds": [ { "node_id": "node-2", "address": "127.0.0.1:7002" } ],
        "snapshot_path": "/tmp/cluster.json"
    }"#;

    #[test]
    fn parse_with_defaults() {
        let config: ClusterConfig = serde_json::from_str(CONFIG).unwrap();

        assert!(config.enabled);
        assert!(!config.allow_bootstrap);
        assert_eq!(config.network.bind_host, "0.0.0.0");
        assert_eq!(config.rpc.advertised_address(), "127.0.0.1:7001");
        assert_eq!(
            config.seeds,
            vec![SeedPeer {
                node_id: "node-2".into(),
                address: "127.0.0.1:7002".into()
            }]
        );
        assert_eq!(config.term_state_path(), PathBuf::from("/tmp/cluster.term.json"));
    }

    #[tokio::test]
    async fn multicast_and_unicast_listen_addresses() {
        let mut config: ClusterConfig = serde_json::from_str(CONFIG).unwrap();
        assert_eq!(
            config.network.listen_addr().await.unwrap(),
            "0.0.0.0:9999".parse().unwrap()
        );

        config.network.group = "127.0.0.1".into();
        assert_eq!(
            config.network.listen_addr().await.unwrap(),
            "127.0.0.1:9999".parse().unwrap()
        );
    }
}
