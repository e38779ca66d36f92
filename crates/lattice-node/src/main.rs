mod config;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use lattice_core::cluster::ClusterNode;
use lattice_core::registry::FunctionRegistry;
use lattice_core::transport::Transport;
use lattice_core::transport::in_process::{InProcessHub, InProcessTransport};

#[derive(Parser)]
#[command(name = "lattice", about = "Distributed task execution node")]
struct Cli {
    /// Config file path (overrides LATTICE_CONFIG env var)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a config file with a freshly generated cluster cookie
    Init {
        /// This node's identity, e.g. worker1@rack-3
        #[arg(long, default_value = "lattice@localhost")]
        node_id: String,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Run a node until interrupted
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { node_id, force } => init(cli.config.as_deref(), &node_id, force),
        Commands::Serve => serve(cli.config.as_deref()).await,
    }
}

fn init(cli_path: Option<&str>, node_id: &str, force: bool) -> Result<()> {
    let path = config::resolve_path(cli_path);
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let mut core = lattice_core::config::CoreConfig::default();
    core.cluster.node_id = node_id.parse().context("invalid node id")?;
    core.cluster.cookie = config::generate_cookie();

    config::save(&path, &core)?;
    println!("Wrote {}", path.display());
    println!("Share [cluster].cookie with every member of the cluster.");
    Ok(())
}

async fn serve(cli_path: Option<&str>) -> Result<()> {
    let core = config::load(cli_path)?;
    let node_id = core.cluster.node_id.clone();

    // Functions come from the embedding application; the bare node
    // ships echo so a cluster can be smoke-tested end to end.
    let mut registry = FunctionRegistry::new();
    registry.register_fn("echo", |input, _ctx| async move { Ok(input) });

    let hub = InProcessHub::new();
    let transport: Arc<dyn Transport> = Arc::new(InProcessTransport::new(
        Arc::clone(&hub),
        node_id.clone(),
        &core.cluster.cookie,
    ));

    let node = ClusterNode::start(core, registry, transport)
        .await
        .context("failed to start cluster node")?;
    hub.attach(node.node_id().clone(), node.endpoints());
    node.recover_from_store().await;

    tracing::info!(node = %node_id, "serving until ctrl-c");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    node.shutdown().await;
    Ok(())
}
