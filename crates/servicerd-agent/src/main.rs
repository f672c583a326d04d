//! servicerd-agent entry point

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use servicerd_agent::startup::{self, LoggingConfig};
use servicerd_agent::{AgentConfig, Backend, Overrides, build_registry, commands};
use servicerd_common::{CancellationToken, ServiceInstance};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "servicerd-agent", version, about)]
struct Cli {
    /// Configuration file (yaml, toml or json)
    #[arg(short = 'c', long = "config", env = "SERVICERD_CONFIG")]
    config: Option<PathBuf>,
    #[arg(short = 'b', long = "backend", value_enum)]
    backend: Option<Backend>,
    /// Comma-separated etcd gateway URLs
    #[arg(long = "etcd-endpoints", value_delimiter = ',')]
    etcd_endpoints: Option<Vec<String>>,
    #[arg(long = "consul-address")]
    consul_address: Option<String>,
    #[arg(long = "log-level")]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register an instance and keep it alive until interrupted
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        id: String,
        /// `scheme://host:port`; repeat for several endpoints
        #[arg(short = 'e', long = "endpoint")]
        endpoints: Vec<String>,
    },
    /// Print the current instances of a service
    List { name: String },
    /// Print the instances of a service on every change
    Watch { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let overrides = Overrides {
        backend: cli.backend,
        etcd_endpoints: cli.etcd_endpoints,
        consul_address: cli.consul_address,
        log_level: cli.log_level,
    };
    let config = AgentConfig::load(cli.config.as_deref(), &overrides)
        .context("Failed to load configuration")?;

    let _logging_guard = startup::init_logging(&LoggingConfig::from(&config.log))
        .map_err(|e| anyhow::anyhow!("{}", e))?;
    info!("Starting servicerd-agent with {} backend", config.backend);

    let shutdown = CancellationToken::new();
    startup::shutdown_on_signal(shutdown.clone());

    let handle = build_registry(&config, &shutdown)?;
    let registry = handle.registry();

    let result = match cli.command {
        Command::Register {
            name,
            id,
            endpoints,
        } => {
            let instance = ServiceInstance::new(id, name, endpoints);
            commands::register(registry.as_ref(), &instance, &shutdown).await
        }
        Command::List { name } => {
            commands::list(registry.as_ref(), &name, &mut std::io::stdout()).await
        }
        Command::Watch { name } => {
            commands::watch(
                registry.as_ref(),
                &name,
                shutdown.clone(),
                &mut std::io::stdout(),
            )
            .await
        }
    };

    handle.close().await;
    result
}
