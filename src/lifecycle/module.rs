use crate::config::{AddressResolveError, ClusterConfig, OptionsError};
use crate::directory::{ClusterDirectory, ClusterHandle, OpenError};
use crate::discovery::{run_announcer, serve_discovery, AnnouncedIdentity, DiscoveryError};
use crate::server::{self, RpcServer, RpcServerError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// Announcements waiting for the engine. Beyond this they're dropped; they repeat anyway.
const DISCOVERY_QUEUE_SIZE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ClusterSetupError {
    #[error("Node id must not be empty")]
    MissingNodeId,

    #[error("Cluster name must not be empty")]
    MissingClusterName,

    #[error(transparent)]
    InvalidOptions(#[from] OptionsError),
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterStartError {
    #[error("Cluster module was already started")]
    AlreadyStarted,

    #[error("Failed to resolve RPC bind address")]
    Resolve(#[from] AddressResolveError),

    #[error(transparent)]
    Rpc(#[from] RpcServerError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("Discovery listener exited before it was ready")]
    DiscoveryNotReady,

    #[error("Failed to open cluster directory")]
    Open(#[from] OpenError),
}

#[derive(Debug, thiserror::Error)]
pub enum ClusterStopError {
    #[error(transparent)]
    Rpc(#[from] RpcServerError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

struct BackgroundTasks {
    shutdown: CancellationToken,
    rpc_server: JoinHandle<Result<(), RpcServerError>>,
    // None once someone waited for it.
    discovery: Option<JoinHandle<Result<(), DiscoveryError>>>,
    announcer: JoinHandle<()>,
}

/// Wires discovery, the RPC server and the cluster directory together for one process.
/// A disabled module accepts every call and does nothing.
pub struct ClusterModule {
    logger: slog::Logger,
    config: ClusterConfig,
    // None when clustering is disabled.
    directory: Option<ClusterDirectory>,
    tasks: Option<BackgroundTasks>,
    started: bool,
}

impl ClusterModule {
    pub fn setup(logger: slog::Logger, config: ClusterConfig) -> Result<Self, ClusterSetupError> {
        if !config.enabled {
            slog::info!(logger, "Clustering is disabled");
            return Ok(ClusterModule {
                logger,
                config,
                directory: None,
                tasks: None,
                started: false,
            });
        }

        if config.node_id.is_empty() {
            return Err(ClusterSetupError::MissingNodeId);
        }
        if config.cluster_name.is_empty() {
            return Err(ClusterSetupError::MissingClusterName);
        }

        let logger = logger.new(slog::o!("NodeId" => config.node_id.clone()));
        let directory = ClusterDirectory::new(logger.new(slog::o!("Component" => "Directory")), &config)?;

        Ok(ClusterModule {
            logger,
            config,
            directory: Some(directory),
            tasks: None,
            started: false,
        })
    }

    /// Binds the RPC port, starts discovery and the announcer, then opens the directory.
    ///
    /// Bind and resolve failures are fatal. When opening the directory fails everything else keeps
    /// running; the caller chooses between retrying and [`ClusterModule::stop`].
    pub async fn start(&mut self) -> Result<(), ClusterStartError> {
        let directory = match self.directory.as_mut() {
            Some(directory) => directory,
            None => return Ok(()),
        };
        if self.started {
            return Err(ClusterStartError::AlreadyStarted);
        }
        self.started = true;

        let rpc_addr = self.config.rpc.bind_addr().await?;
        let listener = server::bind(rpc_addr).await?;
        let shutdown = CancellationToken::new();

        let rpc_server = RpcServer::new(
            self.logger.new(slog::o!("Component" => "RpcServer")),
            directory.engine_client(),
        );
        let rpc_server = tokio::spawn(rpc_server.serve(listener, shutdown.child_token()));

        let (announcements_tx, announcements_rx) = mpsc::channel(DISCOVERY_QUEUE_SIZE);
        let (ready_tx, ready_rx) = oneshot::channel();
        let discovery = tokio::spawn(serve_discovery(
            self.logger.new(slog::o!("Component" => "Discovery")),
            self.config.network.clone(),
            announcements_tx,
            ready_tx,
            shutdown.child_token(),
        ));
        if ready_rx.await.is_err() {
            // The listener gave up before it was ready; its result says why.
            shutdown.cancel();
            let _ = join_task(rpc_server).await;
            join_task(discovery).await?;
            return Err(ClusterStartError::DiscoveryNotReady);
        }
        directory.pump_discovery(announcements_rx);

        let announcer = tokio::spawn(run_announcer(
            self.logger.new(slog::o!("Component" => "Announcer")),
            self.config.network.clone(),
            AnnouncedIdentity {
                node_id: self.config.node_id.clone(),
                rpc_address: self.config.rpc.advertised_address(),
                cluster_name: self.config.cluster_name.clone(),
            },
            directory.options().announce_interval,
            shutdown.child_token(),
        ));

        self.tasks = Some(BackgroundTasks {
            shutdown,
            rpc_server,
            discovery: Some(discovery),
            announcer,
        });

        directory.open().await?;
        slog::info!(self.logger, "Cluster module started");
        Ok(())
    }

    /// Stops accepting traffic, then closes the directory, which writes a final snapshot. A failed
    /// snapshot write is logged and shows up in the directory's diagnostics; it does not fail stop.
    pub async fn stop(&mut self) -> Result<(), ClusterStopError> {
        let mut first_error = None;

        if let Some(tasks) = self.tasks.take() {
            tasks.shutdown.cancel();
            if let Err(e) = join_task(tasks.rpc_server).await {
                slog::error!(self.logger, "RPC server failed: {:?}", e);
                first_error = first_error.or(Some(ClusterStopError::Rpc(e)));
            }
            if let Some(discovery) = tasks.discovery {
                if let Err(e) = join_task(discovery).await {
                    slog::error!(self.logger, "Discovery listener failed: {:?}", e);
                    first_error = first_error.or(Some(ClusterStopError::Discovery(e)));
                }
            }
            join_any(tasks.announcer).await;
        }

        if let Some(directory) = self.directory.as_mut() {
            if let Err(e) = directory.close().await {
                slog::error!(self.logger, "Final snapshot was not written: {:?}", e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                slog::info!(self.logger, "Cluster module stopped");
                Ok(())
            }
        }
    }

    /// Resolves when the discovery listener ends on its own, which only happens on a receive
    /// error. Never resolves while the module is disabled, not started, or already waited on.
    pub async fn wait_for_discovery_exit(&mut self) -> Result<(), DiscoveryError> {
        match self.tasks.as_mut().and_then(|tasks| tasks.discovery.take()) {
            Some(discovery) => join_task(discovery).await,
            None => std::future::pending().await,
        }
    }

    /// None while disabled or before the directory is opened.
    pub fn handle(&self) -> Option<ClusterHandle> {
        self.directory.as_ref().and_then(ClusterDirectory::handle)
    }

    pub fn directory(&self) -> Option<&ClusterDirectory> {
        self.directory.as_ref()
    }

    pub fn directory_mut(&mut self) -> Option<&mut ClusterDirectory> {
        self.directory.as_mut()
    }
}

async fn join_task<E>(task: JoinHandle<Result<(), E>>) -> Result<(), E> {
    join_any(task).await.unwrap_or(Ok(()))
}

// Panics in background tasks are re-raised here; tasks are never aborted.
async fn join_any<T>(task: JoinHandle<T>) -> Option<T> {
    match task.await {
        Ok(output) => Some(output),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterOptions, NetworkConfig, RpcConfig};
    use std::path::Path;

    fn free_tcp_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    fn free_udp_port() -> u16 {
        std::net::UdpSocket::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
    }

    fn config(rpc_port: u16, discovery_port: u16, snapshot_dir: &Path) -> ClusterConfig {
        ClusterConfig {
            enabled: true,
            cluster_name: "lifecycle-test".into(),
            node_id: "n1".into(),
            rpc: RpcConfig {
                bind_host: "127.0.0.1".into(),
                port: rpc_port,
                advertise_host: None,
            },
            network: NetworkConfig {
                bind_host: "127.0.0.1".into(),
                group: "127.0.0.1".into(),
                port: discovery_port,
                interface: None,
            },
            seeds: Vec::new(),
            allow_bootstrap: true,
            snapshot_path: snapshot_dir.join("cluster.json"),
            options: ClusterOptions::default(),
        }
    }

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[tokio::test]
    async fn disabled_module_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(0, 0, dir.path());
        config.enabled = false;
        config.node_id = String::new();

        let mut module = ClusterModule::setup(logger(), config).unwrap();
        module.start().await.unwrap();
        assert!(module.handle().is_none());
        module.stop().await.unwrap();
        assert!(!dir.path().join("cluster.json").exists());
    }

    #[test]
    fn setup_rejects_bad_config() {
        let dir = tempfile::tempdir().unwrap();

        let mut missing_id = config(0, 0, dir.path());
        missing_id.node_id = String::new();
        assert!(matches!(
            ClusterModule::setup(logger(), missing_id),
            Err(ClusterSetupError::MissingNodeId)
        ));

        let mut silent = config(0, 0, dir.path());
        silent.options.announce_interval = Some(std::time::Duration::from_millis(0));
        silent.options.liveness_timeout = Some(std::time::Duration::from_millis(0));
        assert!(matches!(
            ClusterModule::setup(logger(), silent),
            Err(ClusterSetupError::InvalidOptions(_))
        ));

        let mut bad_timing = config(0, 0, dir.path());
        bad_timing.options.rpc_timeout = Some(std::time::Duration::from_secs(10));
        assert!(matches!(
            ClusterModule::setup(logger(), bad_timing),
            Err(ClusterSetupError::InvalidOptions(_))
        ));
    }

    #[tokio::test]
    async fn occupied_rpc_port_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut module = ClusterModule::setup(logger(), config(port, free_udp_port(), dir.path())).unwrap();
        assert!(matches!(
            module.start().await,
            Err(ClusterStartError::Rpc(RpcServerError::Bind { .. }))
        ));
        module.stop().await.unwrap();
    }

    #[tokio::test]
    async fn occupied_discovery_port_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let mut module = ClusterModule::setup(logger(), config(free_tcp_port(), port, dir.path())).unwrap();
        assert!(matches!(
            module.start().await,
            Err(ClusterStartError::Discovery(DiscoveryError::Bind { .. }))
        ));
        module.stop().await.unwrap();
    }

    #[tokio::test]
    async fn lone_node_starts_leads_and_snapshots_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mut module =
            ClusterModule::setup(logger(), config(free_tcp_port(), free_udp_port(), dir.path())).unwrap();

        module.start().await.unwrap();
        assert!(module.handle().unwrap().is_leader());
        assert!(matches!(module.start().await, Err(ClusterStartError::AlreadyStarted)));

        module.stop().await.unwrap();
        assert!(dir.path().join("cluster.json").exists());
        assert_eq!(module.directory().unwrap().diagnostics().snapshots_written, 1);
    }
}
