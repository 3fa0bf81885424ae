//! orcd - workload orchestrator daemon entry point (Section 2.1).

use std::path::PathBuf;

use clap::Parser;
use orcd::{Daemon, DaemonConfig};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Workload orchestrator daemon: loads YAML recipes, runs them as AI
/// prompts or DAGs of typed worker steps, and serves the REST façade
/// consumed by the GUI and `orcctl`.
#[derive(Debug, Parser)]
#[command(name = "orcd", version)]
struct Cli {
    /// Directory holding `config.toml` / `config.<env>.toml` (Section 6.3).
    #[arg(long, env = "ORCD_CONFIG_DIR", default_value = ".")]
    config_dir: PathBuf,

    /// Override `paths.data` from the layered config.
    #[arg(long, env = "ORCD_DATA_DIR_OVERRIDE")]
    data_dir: Option<PathBuf>,

    /// Override `paths.workloads` from the layered config.
    #[arg(long, env = "ORCD_WORKLOADS_DIR_OVERRIDE")]
    workloads_dir: Option<PathBuf>,

    /// Bundled examples root, shadowed by `workloads_dir` on id collision.
    #[arg(long, env = "ORCD_EXAMPLES_DIR", default_value = "examples-workloads")]
    examples_dir: PathBuf,

    /// Override `server.port` from the layered config.
    #[arg(long, env = "ORCD_PORT_OVERRIDE")]
    port: Option<u16>,

    /// Override `logging.level` from the layered config.
    #[arg(long, env = "ORCD_LOG_LEVEL_OVERRIDE")]
    log_level: Option<String>,
}

fn main() {
    let cli = Cli::parse();

    let mut config = match orc_core::Config::load(&cli.config_dir) {
        Ok(config) => config,
        Err(e) => {
            // Tracing isn't initialized yet; a bad config is a startup
            // failure the operator needs to see regardless of filter.
            eprintln!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if let Some(data_dir) = &cli.data_dir {
        config.paths.data = data_dir.clone();
    }
    if let Some(workloads_dir) = &cli.workloads_dir {
        config.paths.workloads = workloads_dir.clone();
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    let daemon_config = DaemonConfig {
        data_dir: config.paths.data.clone(),
        workloads_dir: config.paths.workloads.clone(),
        examples_dir: cli.examples_dir,
        config,
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        let daemon = match Daemon::new(daemon_config) {
            Ok(daemon) => daemon,
            Err(e) => {
                error!("failed to initialize daemon: {e}");
                std::process::exit(1);
            }
        };

        tokio::select! {
            result = daemon.run() => {
                if let Err(e) = result {
                    error!("daemon error: {e}");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT, shutting down");
                daemon.shutdown().await;
            }
        }
    });
}
