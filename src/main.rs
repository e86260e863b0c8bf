// src/main.rs

//! The main entry point for the PgSteward supervisor.

use anyhow::Result;
use clap::Parser;
use pgsteward::Supervisor;
use pgsteward::config::Config;
use pgsteward::core::StewardError;
use pgsteward::core::supervisor::{await_shutdown_signal, spawn_child_reaper};
use std::path::PathBuf;
use tracing::{error, info};

/// PostgreSQL node with self-registration on etcd.
#[derive(Parser, Debug)]
#[command(name = "pgsteward", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    config: PathBuf,

    /// Forcibly become the leader when bootstrapping an empty data directory.
    #[arg(long)]
    force_leader: bool,

    /// URL to advertise to the rest of the cluster.
    #[arg(long)]
    advertise_url: Option<String>,

    /// Base URL of the etcd store (scheme://host:port).
    #[arg(long)]
    etcd_url: Option<String>,

    /// Whitespace-separated subnets allowed to connect as clients.
    #[arg(long)]
    client_subnets: Option<String>,

    /// Whitespace-separated subnets allowed to replicate.
    #[arg(long)]
    replication_subnets: Option<String>,

    /// CA bundle for TLS to the store.
    #[arg(long)]
    ca_file: Option<PathBuf>,

    /// Client certificate for TLS to the store.
    #[arg(long)]
    cert_file: Option<PathBuf>,

    /// Client key for TLS to the store.
    #[arg(long)]
    key_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging with compact format and ANSI colors. The supervisor
    // modules default to debug so every cycle decision is visible.
    let log_level =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info,pgsteward::core=debug".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .compact()
        .with_ansi(true)
        .init();

    info!("Starting PgSteward {}", env!("CARGO_PKG_VERSION"));

    // Load the configuration; the supervisor cannot run without one.
    let mut config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            std::process::exit(1);
        }
    };

    // Apply command-line overrides on top of the file, then re-validate.
    if let Some(advertise_url) = cli.advertise_url {
        config.postgresql.connect_address = Some(advertise_url);
    }
    if let Some(etcd_url) = cli.etcd_url {
        config.etcd.host = etcd_url;
    }
    if let Some(subnets) = cli.client_subnets {
        config.postgresql.auth.network = subnets;
    }
    if let Some(subnets) = cli.replication_subnets {
        config.postgresql.replication.network = subnets;
    }
    if cli.ca_file.is_some() {
        config.etcd.ca_file = cli.ca_file;
    }
    if cli.cert_file.is_some() {
        config.etcd.cert_file = cli.cert_file;
    }
    if cli.key_file.is_some() {
        config.etcd.key_file = cli.key_file;
    }
    if let Err(e) = config.validate() {
        eprintln!("{e:#}");
        std::process::exit(1);
    }

    spawn_child_reaper();

    let mut supervisor = Supervisor::new(&config)?;

    let result = {
        let run = async {
            supervisor.initialize(cli.force_leader).await?;
            supervisor.run().await;
            Ok::<(), StewardError>(())
        };
        tokio::pin!(run);
        tokio::select! {
            result = &mut run => result,
            _ = await_shutdown_signal() => Ok(()),
        }
    };

    supervisor.cleanup().await;

    if let Err(e) = &result {
        error!("Supervisor error: {e}");
    }
    result.map_err(Into::into)
}
