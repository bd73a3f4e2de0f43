#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Meshfs node entrypoint (systemd-friendly).
//! Loads config, starts the daemon, and runs until signalled.

use meshfs::core::error::DaemonError;
use meshfs::core::types::NodeConfig;
use meshfs::daemon::Daemon;
use tracing::error;

fn config_path() -> String {
    std::env::var("MESHFS_CONFIG").unwrap_or_else(|_| "./config.toml".to_string())
}

fn load_config(path: &str) -> Result<NodeConfig, DaemonError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| DaemonError::Config(format!("reading {path}: {e}")))?;
    toml::from_str(&raw).map_err(|e| DaemonError::Config(format!("parsing {path}: {e}")))
}

#[tokio::main]
async fn main() {
    let path = config_path();
    let config = match load_config(&path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: {e}");
            std::process::exit(1);
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_new(&config.logging.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init();

    let daemon = match Daemon::start(config).await {
        Ok(d) => d,
        Err(e) => {
            error!(error = %e, "daemon failed to start");
            std::process::exit(1);
        }
    };

    daemon.run_until_signal().await;
}
