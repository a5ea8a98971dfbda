//! covstream agent entry point.
//!
//! ```text
//! covstream-agent serve   -- listen for a collector and serve execution data
//! covstream-agent dump    -- connect to a running agent and request a dump
//! covstream-agent init-config -- write a default configuration file
//! ```
//!
//! `serve` wires the pieces together:
//!
//! ```text
//! main()
//!  └─ load config (file, then CLI/env overrides)
//!  └─ ExecutionStore            -- in-process execution data
//!  └─ TcpServerOutput::startup  -- bind + accept loop task
//!  └─ wait for Ctrl-C
//!  └─ final snapshot (dump_on_exit), shutdown
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use covstream_agent::application::output::{AgentOutput, TracingExceptionLogger};
use covstream_agent::infrastructure::network::collector::Collector;
use covstream_agent::infrastructure::network::server::TcpServerOutput;
use covstream_agent::infrastructure::registry::HttpNotifier;
use covstream_agent::infrastructure::storage::config::{
    default_config_path, load_config, save_config, AgentConfig,
};
use covstream_core::ExecutionStore;

#[derive(Debug, Parser)]
#[command(name = "covstream-agent", version, about)]
struct Cli {
    /// Configuration file (defaults to the platform config directory).
    #[arg(long, global = true, env = "COVSTREAM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve execution data to a collector until interrupted.
    Serve(ServeArgs),
    /// Request a dump from a running agent.
    Dump(DumpArgs),
    /// Write a configuration file with default values.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Bind address: `*`, an IP literal, or a host name.
    #[arg(long, env = "COVSTREAM_ADDRESS")]
    address: Option<String>,
    #[arg(long, env = "COVSTREAM_PORT")]
    port: Option<u16>,
    /// Registry notified when the port falls back.
    #[arg(long, env = "COVSTREAM_REGISTRY_URL")]
    registry_url: Option<String>,
    /// Session id written into snapshots.
    #[arg(long, env = "COVSTREAM_SESSION_ID")]
    session_id: Option<String>,
}

#[derive(Debug, Args)]
struct DumpArgs {
    /// Host the agent listens on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,
    #[arg(long, default_value_t = 6300)]
    port: u16,
    /// Clear the agent's execution data after the dump.
    #[arg(long)]
    reset: bool,
    /// Write the dump as a binary stream instead of printing a JSON summary.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Seconds to wait for the agent to answer.
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.or_else(|| default_config_path().ok());

    if let Command::InitConfig { force } = cli.command {
        let path = config_path
            .context("no --config given and no platform config directory available")?;
        return init_config(&path, force);
    }

    let mut config = match &config_path {
        Some(path) => {
            load_config(path).with_context(|| format!("loading {}", path.display()))?
        }
        None => AgentConfig::default(),
    };

    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.agent.log_level)),
        )
        .init();

    match cli.command {
        Command::Serve(args) => {
            args.apply(&mut config);
            serve(config).await
        }
        Command::Dump(args) => dump(args).await,
        Command::InitConfig { .. } => Ok(()),
    }
}

impl ServeArgs {
    fn apply(self, config: &mut AgentConfig) {
        if let Some(address) = self.address {
            config.server.address = address;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(url) = self.registry_url {
            config.registry.url = Some(url);
        }
        if let Some(id) = self.session_id {
            config.agent.session_id = Some(id);
        }
    }
}

async fn serve(config: AgentConfig) -> anyhow::Result<()> {
    let store = Arc::new(match &config.agent.session_id {
        Some(id) => ExecutionStore::new(id.clone()),
        None => ExecutionStore::with_generated_id("covstream"),
    });
    info!(session = store.session_id(), "covstream agent starting");

    let notifier = HttpNotifier::new(config.registry_connect_timeout())
        .context("building registry HTTP client")?;
    let output = TcpServerOutput::new(
        config.server_settings(),
        store,
        Arc::new(TracingExceptionLogger),
    )
    .with_notifier(Arc::new(notifier));

    output.startup().await?;
    info!("covstream agent ready.  Press Ctrl-C to exit.");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutdown signal received");

    if config.agent.dump_on_exit {
        if let Err(e) = output.write_execution_data(false).await {
            warn!("final snapshot not delivered: {e}");
        }
    }
    output.shutdown().await?;
    info!("covstream agent stopped");
    Ok(())
}

async fn dump(args: DumpArgs) -> anyhow::Result<()> {
    let agent: SocketAddr = tokio::net::lookup_host((args.host.as_str(), args.port))
        .await
        .with_context(|| format!("resolving {}", args.host))?
        .next()
        .with_context(|| format!("{} did not resolve to any address", args.host))?;

    let wait = Duration::from_secs(args.timeout);
    let result = tokio::time::timeout(wait, async {
        let mut collector = Collector::connect(agent).await?;
        collector.request_dump(args.reset).await
    })
    .await
    .with_context(|| format!("agent at {agent} did not answer within {wait:?}"))?;
    let dump = result?;

    match args.output {
        Some(path) => {
            std::fs::write(&path, dump.to_bytes())
                .with_context(|| format!("writing {}", path.display()))?;
            info!(
                sessions = dump.sessions.len(),
                classes = dump.records.len(),
                "dump written to {}",
                path.display()
            );
        }
        None => println!("{}", serde_json::to_string_pretty(&dump)?),
    }
    Ok(())
}

fn init_config(path: &std::path::Path, force: bool) -> anyhow::Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }
    save_config(path, &AgentConfig::default())?;
    println!("wrote {}", path.display());
    Ok(())
}
