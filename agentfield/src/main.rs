//! AgentField CLI - control plane server and node tooling.
//!
//! # Usage
//!
//! ```bash
//! # Run the control plane
//! agentfield server --port 8080
//!
//! # Inspect or scaffold configuration
//! agentfield config show
//! agentfield config init --path agentfield.toml
//!
//! # Stop a node process running on this host
//! agentfield stop-node http://localhost:8001 --pid 4242
//! ```

use agentfield::nodes::shutdown::platform_process_controller;
use agentfield::nodes::{HttpShutdownNotifier, ShutdownOutcome, ShutdownProtocol, ShutdownTimeouts};
use agentfield::{ControlPlane, ControlPlaneConfig};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "agentfield")]
#[command(about = "AgentField - control plane for distributed AI agent nodes", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane server
    Server {
        /// Bind address (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Configuration file
        #[arg(short, long, env = "AGENTFIELD_CONFIG_PATH")]
        config: Option<PathBuf>,
    },

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Stop a node: HTTP shutdown, then SIGTERM, then SIGKILL
    StopNode {
        /// Node base URL
        base_url: String,

        /// Local process id, enables the signal stages
        #[arg(long, value_parser = clap::value_parser!(u32).range(1..=i32::MAX as i64))]
        pid: Option<u32>,

        /// Reason passed to the node
        #[arg(long)]
        reason: Option<String>,

        /// Configuration file (for shutdown timeouts)
        #[arg(short, long, env = "AGENTFIELD_CONFIG_PATH")]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show {
        #[arg(short, long, env = "AGENTFIELD_CONFIG_PATH")]
        config: Option<PathBuf>,
    },

    /// Load and validate a configuration file
    Validate {
        #[arg(short, long, env = "AGENTFIELD_CONFIG_PATH")]
        config: Option<PathBuf>,
    },

    /// Write a default configuration file
    Init {
        #[arg(short, long, default_value = "agentfield.toml")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    match cli.command {
        Commands::Server { host, port, config } => run_server(config, host, port).await,
        Commands::Config(cmd) => run_config(cmd),
        Commands::StopNode {
            base_url,
            pid,
            reason,
            config,
        } => stop_node(base_url, pid, reason, config).await,
    }
}

async fn run_server(config_path: Option<PathBuf>, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config =
        ControlPlaneConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let plane = Arc::new(ControlPlane::in_memory(config).context("Failed to build control plane")?);
    agentfield::api::start_server(plane, shutdown_signal()).await
}

fn run_config(cmd: ConfigCommands) -> Result<()> {
    match cmd {
        ConfigCommands::Show { config } => {
            let config = ControlPlaneConfig::load(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
        }
        ConfigCommands::Validate { config } => {
            ControlPlaneConfig::load(config.as_deref())?;
            println!("Configuration is valid");
        }
        ConfigCommands::Init { path, force } => {
            if path.exists() && !force {
                anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
            }
            ControlPlaneConfig::default()
                .save_to_path(&path)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Wrote default configuration to {}", path.display());
        }
    }
    Ok(())
}

async fn stop_node(
    base_url: String,
    pid: Option<u32>,
    reason: Option<String>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let config = ControlPlaneConfig::load(config_path.as_deref())?;
    let process = platform_process_controller();
    if pid.is_some() && process.is_none() {
        warn!("Process signals are not supported on this platform; only the HTTP stage will run");
    }

    let protocol = ShutdownProtocol::new(
        Arc::new(HttpShutdownNotifier::new(reqwest::Client::new())),
        process,
        ShutdownTimeouts::from_lease_config(&config.lease),
    );
    let shutdown_url = format!("{}/shutdown", base_url.trim_end_matches('/'));
    let outcome = protocol.run(&shutdown_url, pid, reason).await;
    info!(?outcome, "Stop-node finished");

    match outcome {
        ShutdownOutcome::Unreachable => anyhow::bail!("node at {} could not be stopped", base_url),
        outcome => {
            println!("{}", serde_json::to_string(&outcome)?);
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

fn init_logging(verbose: bool, format: LogFormat) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = if verbose {
        EnvFilter::new("agentfield=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("agentfield=info,warn"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
    }
}
