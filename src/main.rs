use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use sandbox_supervisor::config::SupervisorConfig;
use sandbox_supervisor::container::ActorRegistry;
use sandbox_supervisor::container::control::ProcessControl;
use sandbox_supervisor::container::local::LocalProcess;
use sandbox_supervisor::logging::{self, LogFormat};
use sandbox_supervisor::server::{self, ServerConfig};

#[derive(Parser)]
#[command(name = "sandbox-supervisor")]
#[command(version, about = "Per-identity supervisor for sandboxed worker processes")]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, env = "SANDBOX_SUPERVISOR_CONFIG", default_value = "supervisor.toml")]
    pub config: PathBuf,

    /// Listener port. Overrides `server.port`.
    #[arg(long, global = true, env = "SANDBOX_SUPERVISOR_PORT")]
    pub port: Option<u16>,

    /// Directory for per-identity state. Overrides `storage.data_dir`.
    #[arg(long, global = true, env = "SANDBOX_SUPERVISOR_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP front door
    Serve,
    /// Print the merged configuration as TOML
    CheckConfig,
}

fn load_config(cli: &Cli) -> Result<SupervisorConfig> {
    let mut config = SupervisorConfig::load(&cli.config)?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = dir.clone();
    }
    Ok(config)
}

async fn serve(config: SupervisorConfig) -> Result<()> {
    if config.container.entrypoint.is_empty() {
        tracing::warn!("container.entrypoint is empty; requests will fail until it is configured");
    }

    let ping_timeout = config.ping_timeout();
    let registry = ActorRegistry::new(
        config.to_settings(),
        Some(config.storage.data_dir.clone()),
        Arc::new(move |identity: &str| -> Result<Arc<dyn ProcessControl>> {
            Ok(Arc::new(LocalProcess::new(identity, ping_timeout)?))
        }),
    )
    .with_handlers(server::builtin_handlers());

    let server_config = ServerConfig {
        host: config.server.host.clone(),
        port: config.server.port,
    };
    server::start_server(server_config, Arc::new(registry)).await
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.log_format, if cli.verbose { "debug" } else { "info" });

    let config = load_config(&cli)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    match cli.command {
        Commands::Serve => serve(config).await?,
        Commands::CheckConfig => print!("{}", config.to_toml()?),
    }

    Ok(())
}
