//! WolfGraph - Highly Available Graph Store Replication
//!
//! Runs an HA node and the configuration helpers.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfgraph::cluster::{ClusterReader, Connector, ZkConnector};
use wolfgraph::config::{LoggingConfig, WolfGraphConfig};
use wolfgraph::error::Result;
use wolfgraph::ha::{HaNode, HaNodeConfig};
use wolfgraph::replication::TcpNetwork;

/// WolfGraph - Highly Available Graph Store Replication
#[derive(Parser)]
#[command(name = "wolfgraph")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfgraph.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error), overrides the config
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HA node
    Start,

    /// Show cluster members and the selected master
    Status,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfgraph.toml")]
        output: PathBuf,

        /// Machine id
        #[arg(long, default_value_t = 1)]
        server_id: i32,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config file when there is one
    let mut logging = WolfGraphConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    if let Some(level) = cli.log_level {
        logging.level = level;
    }
    init_logging(&logging);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Status => run_status(cli.config).await,
        Commands::Init { output, server_id } => run_init(output, server_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if logging.format == "compact" {
        registry.with(tracing_subscriber::fmt::layer().compact()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Start the HA node
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WolfGraph node...");

    let config = match WolfGraphConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    tracing::info!(
        "Loaded configuration for machine {} in cluster {}",
        config.node.server_id,
        config.ha.cluster_name
    );

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
        return Err(e.into());
    }

    let connector = Arc::new(ZkConnector::new(
        config.ha.coordinators.clone(),
        config.coordinator_timeout(),
    ));
    let network = Arc::new(TcpNetwork::new(config.read_timeout()));

    let node = HaNode::start(HaNodeConfig::from(&config), connector, network).await?;
    tracing::info!("Node {} running as {}", node.machine_id(), node.role().await);

    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received shutdown signal"),
        Err(e) => tracing::error!("Unable to listen for shutdown signal: {}", e),
    }

    node.shutdown().await;
    if let Some(cause) = node.cause_of_shutdown().await {
        tracing::info!("Last role stop cause: {}", cause);
    }
    tracing::info!("WolfGraph node stopped");
    Ok(())
}

/// Print the cluster view without registering as a member
async fn run_status(config_path: PathBuf) -> Result<()> {
    let config = WolfGraphConfig::from_file(&config_path)?;
    let connector = ZkConnector::new(config.ha.coordinators.clone(), config.coordinator_timeout());
    let (session, _events) = connector.connect(config.coordinator_timeout()).await?;

    let reader = ClusterReader::new(&config.ha.cluster_name);
    let master = reader.master(session.as_ref()).await?;
    let view = reader.view(session.as_ref()).await?;
    if let Err(e) = session.close().await {
        tracing::debug!("Error closing coordination session: {}", e);
    }

    println!("Cluster {}", config.ha.cluster_name);
    println!("==========================");
    if master.is_none() {
        println!("Master:           (none)");
    } else {
        println!("Master:           {}", master);
    }
    println!();
    println!("{:<6} {:<8} {:<12} {:<10} {:<24} {}", "ID", "SEQ", "LAST TX", "ROLE", "ADDRESS", "STORE");
    for member in view {
        let machine = &member.machine;
        let role = member.info.as_ref().map(|i| i.role.as_str()).unwrap_or("-");
        let store = member
            .info
            .as_ref()
            .and_then(|i| i.store_id.as_deref())
            .unwrap_or("-");
        println!(
            "{:<6} {:<8} {:<12} {:<10} {:<24} {}",
            machine.id,
            machine.sequence_id,
            machine.last_committed_tx,
            role,
            machine.address.as_deref().unwrap_or("-"),
            store
        );
    }
    Ok(())
}

fn run_init(output: PathBuf, server_id: i32) -> Result<()> {
    let config_content = format!(r#"# WolfGraph Configuration
# Generated configuration file

[node]
server_id = {server_id}
data_dir = "/var/lib/wolfgraph/graph.db"

[ha]
coordinators = ["127.0.0.1:2181"]
server = "0.0.0.0:6361"
# advertise_address = "my-public-ip:6361"
cluster_name = "wolfgraph.ha"
pull_interval_ms = 0
allow_init_cluster = true
max_concurrent_channels_per_slave = 20
branched_data_policy = "keep_all"
read_timeout_secs = 20
lock_read_timeout_secs = 40
coordinator_timeout_ms = 5000
slave_coordinator_update_mode = "async"
backup_port = 6362
join_timeout_secs = 60
copy_store_attempts = 60
copy_store_retry_interval_ms = 1000

[store]
compression = true
fsync = true
lock_timeout_secs = 30

[logging]
level = "info"
format = "pretty"
"#);

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure the coordinators and addresses.");
    println!("Then start with: wolfgraph start --config {}", output.display());

    Ok(())
}

fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfGraphConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Machine ID: {}", config.node.server_id);
            println!("  Master Endpoint: {}", config.ha.server);
            println!("  Cluster: {}", config.ha.cluster_name);
            println!("  Coordinators: {}", config.ha.coordinators.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfGraphConfig::from_file(&config_path)?;

    println!("WolfGraph Node Information");
    println!("==========================");
    println!();
    println!("Machine ID:       {}", config.node.server_id);
    println!("Master Endpoint:  {}", config.ha.server);
    println!("Advertise:        {}", config.advertise_address());
    println!("Backup Endpoint:  {}", config.backup_address().as_deref().unwrap_or("(disabled)"));
    println!("Data Directory:   {}", config.data_dir().display());
    println!();
    println!("Cluster Configuration:");
    println!("  Name:           {}", config.ha.cluster_name);
    println!("  Coordinators:   {:?}", config.ha.coordinators);
    println!("  Init Allowed:   {}", config.ha.allow_init_cluster);
    println!("  Branch Policy:  {:?}", config.ha.branched_data_policy);
    println!("  Update Mode:    {:?}", config.ha.slave_coordinator_update_mode);
    match config.pull_interval() {
        Some(interval) => println!("  Pull Interval:  {:?}", interval),
        None => println!("  Pull Interval:  (disabled)"),
    }
    println!();
    println!("Store Configuration:");
    println!("  Compression:    {}", config.store.compression);
    println!("  Fsync:          {}", config.store.fsync);
    println!("  Lock Timeout:   {:?}", config.lock_timeout());

    Ok(())
}
