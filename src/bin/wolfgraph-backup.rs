//! WolfGraph Backup - Online backup from a running node
//!
//! Usage:
//!   wolfgraph-backup --from single://host:6362 --to /backups/graph.db --full
//!   wolfgraph-backup --from ha://coord:2181 --to /backups/graph.db --incremental

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{ArgGroup, Parser};

use wolfgraph::cluster::{ClusterReader, Connector, ZkConnector};
use wolfgraph::config::DEFAULT_CLUSTER_NAME;
use wolfgraph::ha::{bootstrap, BootstrapReport};
use wolfgraph::replication::{MasterClient, MasterNetwork, TcpNetwork};
use wolfgraph::store::local::StoreOptions;
use wolfgraph::store::{LocalStore, StoreId};

/// Online backup of a WolfGraph store
#[derive(Parser, Debug)]
#[command(name = "wolfgraph-backup")]
#[command(about = "Copy or catch up a WolfGraph store from a running node", long_about = None)]
#[command(group(ArgGroup::new("mode").required(true).args(["full", "incremental"])))]
struct Cli {
    /// Source: single://host:port (backup endpoint) or ha://coordinator:port
    #[arg(long)]
    from: String,

    /// Target store directory
    #[arg(long)]
    to: PathBuf,

    /// Copy the whole store into an empty directory
    #[arg(long)]
    full: bool,

    /// Apply new transactions to an existing backup
    #[arg(long)]
    incremental: bool,

    /// Cluster name for ha:// sources
    #[arg(long, default_value = DEFAULT_CLUSTER_NAME)]
    cluster_name: String,

    /// Network timeout in seconds
    #[arg(long, default_value_t = 20)]
    timeout_secs: u64,
}

/// Where the backup is read from
#[derive(Debug, PartialEq, Eq)]
enum Source {
    /// A node's backup endpoint
    Single(String),
    /// Coordinators of a cluster; the master's backup endpoint is used
    Ha(Vec<String>),
}

fn parse_source(uri: &str) -> Result<Source> {
    let (scheme, rest) = uri.split_once("://").unwrap_or(("single", uri));
    let addresses: Vec<String> = rest
        .split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(String::from)
        .collect();

    if addresses.is_empty() {
        bail!("no address in '{}'", uri);
    }
    if let Some(bad) = addresses.iter().find(|a| !a.contains(':')) {
        bail!("address '{}' must be host:port", bad);
    }

    match scheme {
        "single" if addresses.len() == 1 => Ok(Source::Single(addresses[0].clone())),
        "single" => bail!("single:// takes exactly one address"),
        "ha" => Ok(Source::Ha(addresses)),
        other => bail!("unsupported scheme '{}'", other),
    }
}

/// Backup endpoint of the source
async fn resolve(source: Source, cluster_name: &str, timeout: Duration) -> Result<String> {
    match source {
        Source::Single(address) => Ok(address),
        Source::Ha(coordinators) => {
            let connector = ZkConnector::new(coordinators.clone(), timeout);
            let (session, _events) = connector
                .connect(timeout)
                .await
                .with_context(|| format!("unable to reach coordinators {:?}", coordinators))?;

            let master = ClusterReader::new(cluster_name).master(session.as_ref()).await;
            if let Err(e) = session.close().await {
                tracing::debug!("Error closing coordination session: {}", e);
            }
            let master = master.context("unable to read cluster members")?;

            if master.is_none() {
                bail!("cluster {} has no master", cluster_name);
            }
            match master.backup_address() {
                Some(address) => {
                    tracing::info!("Using backup endpoint {} of master {}", address, master.id);
                    Ok(address)
                }
                None => bail!("master {} has no backup endpoint", master.id),
            }
        }
    }
}

fn client(address: &str, store_id: Option<StoreId>, timeout: Duration) -> MasterClient {
    let transport = TcpNetwork::new(timeout).connect(address);
    MasterClient::new(transport, store_id, timeout, timeout)
}

async fn run_full(address: &str, target: &Path, timeout: Duration) -> Result<BootstrapReport> {
    let master = client(address, None, timeout);
    let report = bootstrap::full(&master, target, StoreOptions::default())
        .await
        .with_context(|| format!("full backup from {} failed", address))?;
    Ok(report)
}

async fn run_incremental(address: &str, target: &Path, timeout: Duration) -> Result<BootstrapReport> {
    if !LocalStore::exists(target) {
        bail!("no store in {} to update, run a full backup first", target.display());
    }
    let store = LocalStore::open(target, StoreOptions::default())
        .await
        .with_context(|| format!("unable to open {}", target.display()))?;

    let master = client(address, Some(store.store_id()), timeout);
    let result = bootstrap::incremental(&master, &store).await;
    store.close().await.context("unable to close backup store")?;
    result.with_context(|| format!("incremental backup from {} failed", address))
}

async fn run(cli: Cli) -> Result<()> {
    let timeout = Duration::from_secs(cli.timeout_secs);
    let source = parse_source(&cli.from)?;
    let address = resolve(source, &cli.cluster_name, timeout).await?;

    let report = if cli.full {
        run_full(&address, &cli.to, timeout).await?
    } else {
        run_incremental(&address, &cli.to, timeout).await?
    };

    println!("Backup of {} complete", cli.to.display());
    if report.files > 0 {
        println!("  Files:  {} ({} bytes)", report.files, report.bytes);
    }
    for (resource, tx) in &report.last_txs {
        println!("  {:<8} last committed tx {}", resource, tx);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "warn".into());
    tracing_subscriber::fmt().with_env_filter(env_filter).compact().init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Backup failed: {:#}", e);
            ExitCode::from(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_source() {
        assert_eq!(
            parse_source("db1:6362").unwrap(),
            Source::Single("db1:6362".into())
        );
        assert_eq!(
            parse_source("single://db1:6362").unwrap(),
            Source::Single("db1:6362".into())
        );
        assert_eq!(
            parse_source("ha://c1:2181,c2:2181").unwrap(),
            Source::Ha(vec!["c1:2181".into(), "c2:2181".into()])
        );
        assert!(parse_source("ftp://db1:6362").is_err());
        assert!(parse_source("single://db1").is_err());
        assert!(parse_source("single://a:1,b:2").is_err());
    }

    #[test]
    fn test_mode_is_required_and_exclusive() {
        let base = ["wolfgraph-backup", "--from", "db1:6362", "--to", "/tmp/b"];
        assert!(Cli::try_parse_from(base).is_err());

        let mut both = base.to_vec();
        both.extend(["--full", "--incremental"]);
        assert!(Cli::try_parse_from(both).is_err());

        let mut full = base.to_vec();
        full.push("--full");
        let cli = Cli::try_parse_from(full).unwrap();
        assert!(cli.full && !cli.incremental);
        assert_eq!(cli.cluster_name, DEFAULT_CLUSTER_NAME);
    }
}
