use clap::Parser;
use cluster::{ClusterConfig, ClusterModule, DiscoveryError};
use slog::Drain;
use std::error::Error;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "clusterd")]
#[command(about = "Cluster membership daemon: discovery, leader election and replicated cluster state")]
struct Cli {
    /// Path to the JSON cluster configuration.
    #[arg(long, short)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config: ClusterConfig = serde_json::from_slice(&fs::read(&cli.config)?)?;
    let logger = create_root_logger_for_stdout();

    let mut module = ClusterModule::setup(logger.clone(), config)?;
    if let Err(e) = module.start().await {
        slog::crit!(logger, "Failed to start: {}", e);
        module.stop().await?;
        return Err(e.into());
    }

    let outcome: Result<(), Box<dyn Error>> = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            slog::info!(logger, "Interrupted; shutting down");
            signal.map_err(Into::into)
        }
        exit = module.wait_for_discovery_exit() => {
            slog::crit!(logger, "Discovery listener exited: {:?}", exit);
            discovery_exit_as_failure(exit)
        }
    };

    module.stop().await?;
    outcome
}

// Discovery only ends on its own when something broke; the process must not exit cleanly.
fn discovery_exit_as_failure(exit: Result<(), DiscoveryError>) -> Result<(), Box<dyn Error>> {
    match exit {
        Err(e) => Err(e.into()),
        Ok(()) => Err("Discovery listener exited".into()),
    }
}

fn create_root_logger_for_stdout() -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!())
}
