// src/config.rs

//! Manages supervisor configuration: loading, resolving dynamic values, and validation.

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// A raw representation of the config file before validation and resolution.
#[derive(Deserialize)]
struct RawConfig {
    #[serde(default = "default_loop_wait")]
    loop_wait: u64,
    #[serde(default)]
    etcd: RawEtcdConfig,
    #[serde(default)]
    postgresql: RawPostgresqlConfig,
}

#[derive(Deserialize)]
struct RawEtcdConfig {
    #[serde(default = "default_etcd_host")]
    host: String,
    #[serde(default)]
    scope: String,
    #[serde(default = "default_leader_ttl")]
    ttl: u64,
    member_ttl: Option<u64>,
    ca_file: Option<PathBuf>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
}

impl Default for RawEtcdConfig {
    fn default() -> Self {
        Self {
            host: default_etcd_host(),
            scope: String::new(),
            ttl: default_leader_ttl(),
            member_ttl: None,
            ca_file: None,
            cert_file: None,
            key_file: None,
        }
    }
}

#[derive(Deserialize)]
struct RawPostgresqlConfig {
    name: Option<String>,
    #[serde(default = "default_listen")]
    listen: String,
    connect_address: Option<String>,
    data_dir: Option<PathBuf>,
    #[serde(default = "default_socket_dir")]
    socket_dir: String,
    #[serde(default = "default_maximum_lag")]
    maximum_lag_on_failover: i64,
    #[serde(default)]
    auth: AuthConfig,
    #[serde(default)]
    replication: ReplicationConfig,
    #[serde(default)]
    parameters: BTreeMap<String, String>,
    #[serde(default)]
    recovery_conf: BTreeMap<String, String>,
}

impl Default for RawPostgresqlConfig {
    fn default() -> Self {
        Self {
            name: None,
            listen: default_listen(),
            connect_address: None,
            data_dir: None,
            socket_dir: default_socket_dir(),
            maximum_lag_on_failover: default_maximum_lag(),
            auth: AuthConfig::default(),
            replication: ReplicationConfig::default(),
            parameters: BTreeMap::new(),
            recovery_conf: BTreeMap::new(),
        }
    }
}

/// Client-role settings, used for the local SQL channel, role creation, and
/// the `pg_hba.conf` client entries.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_auth_username")]
    pub username: String,
    pub password: Option<String>,
    #[serde(default = "default_auth_dbname")]
    pub dbname: String,
    #[serde(default = "default_network")]
    pub network: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            username: default_auth_username(),
            password: None,
            dbname: default_auth_dbname(),
            network: default_network(),
        }
    }
}

/// Replication-role settings, used for the advertised connection string, role
/// creation, and the `pg_hba.conf` replication entries.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    #[serde(default = "default_replication_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_network")]
    pub network: String,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            username: default_replication_username(),
            password: String::new(),
            network: default_network(),
        }
    }
}

fn default_loop_wait() -> u64 {
    10
}
fn default_etcd_host() -> String {
    env::var("ETCD_HOST").unwrap_or_else(|_| "http://127.0.0.1:4001".to_string())
}
fn default_leader_ttl() -> u64 {
    30
}
fn default_listen() -> String {
    "0.0.0.0:5432".to_string()
}
fn default_socket_dir() -> String {
    "/tmp".to_string()
}
fn default_maximum_lag() -> i64 {
    1024 * 1024 // 1 MiB behind the last known leader position
}
fn default_auth_username() -> String {
    "postgres".to_string()
}
fn default_auth_dbname() -> String {
    "postgres".to_string()
}
fn default_network() -> String {
    "127.0.0.1/32".to_string()
}
fn default_replication_username() -> String {
    "replicator".to_string()
}

/// Resolved settings for the consensus store.
#[derive(Debug, Clone)]
pub struct EtcdConfig {
    /// Store base URL (scheme://host:port).
    pub host: String,
    /// Key prefix under `/v2/keys`.
    pub scope: String,
    /// Leader lease TTL in seconds.
    pub ttl: u64,
    /// Member key TTL in seconds. Defaults to `2 * loop_wait` so one missed
    /// tick does not evict a live member but two consecutive ones do.
    pub member_ttl: u64,
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

/// Resolved settings for the local PostgreSQL instance.
#[derive(Debug, Clone)]
pub struct PostgresqlConfig {
    /// Cluster-unique node name.
    pub name: String,
    /// Comma-separated listen addresses, without the port.
    pub listen_addresses: String,
    pub port: u16,
    /// Advertised `host:port`. Falls back to the first listen address.
    pub connect_address: Option<String>,
    pub data_dir: PathBuf,
    /// Unix socket directory the local query channel connects through.
    pub socket_dir: String,
    /// Max bytes behind the leader optime before this node stops being a
    /// failover candidate.
    pub maximum_lag_on_failover: i64,
    pub auth: AuthConfig,
    pub replication: ReplicationConfig,
    /// Extra server settings passed as `--setting=value` options.
    pub parameters: BTreeMap<String, String>,
    /// Extra lines appended to `recovery.conf` when following a leader.
    pub recovery_conf: BTreeMap<String, String>,
}

/// Represents the final, validated, and resolved supervisor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Seconds between HA ticks.
    pub loop_wait: u64,
    pub etcd: EtcdConfig,
    pub postgresql: PostgresqlConfig,
}

impl Config {
    /// Creates a new `Config` instance by reading and parsing a YAML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{}'", path.display()))?;
        Self::from_yaml(&contents)
            .with_context(|| format!("Failed to load configuration from '{}'", path.display()))
    }

    /// Parses and resolves a YAML document into a validated configuration.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(contents).context("Failed to parse YAML")?;

        let name = match raw.postgresql.name {
            Some(name) => name,
            None => sysinfo::System::host_name()
                .ok_or_else(|| anyhow!("Could not determine a host name; set postgresql.name"))?,
        };

        let data_dir = match raw.postgresql.data_dir {
            Some(dir) => dir,
            None => env::var_os("PGDATA")
                .map(PathBuf::from)
                .ok_or_else(|| anyhow!("postgresql.data_dir is not set and PGDATA is unset"))?,
        };

        let (listen_addresses, port) = parse_listen(&raw.postgresql.listen)?;

        let config = Config {
            loop_wait: raw.loop_wait,
            etcd: EtcdConfig {
                host: raw.etcd.host,
                scope: raw.etcd.scope,
                ttl: raw.etcd.ttl,
                member_ttl: raw.etcd.member_ttl.unwrap_or(2 * raw.loop_wait),
                ca_file: raw.etcd.ca_file,
                cert_file: raw.etcd.cert_file,
                key_file: raw.etcd.key_file,
            },
            postgresql: PostgresqlConfig {
                name,
                listen_addresses,
                port,
                connect_address: raw.postgresql.connect_address,
                data_dir,
                socket_dir: raw.postgresql.socket_dir,
                maximum_lag_on_failover: raw.postgresql.maximum_lag_on_failover,
                auth: raw.postgresql.auth,
                replication: raw.postgresql.replication,
                parameters: raw.postgresql.parameters,
                recovery_conf: raw.postgresql.recovery_conf,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    /// Called again after command-line overrides have been applied.
    pub fn validate(&self) -> Result<()> {
        if self.loop_wait == 0 {
            return Err(anyhow!("loop_wait cannot be 0"));
        }
        if self.etcd.ttl == 0 {
            return Err(anyhow!("etcd.ttl cannot be 0"));
        }
        if !self.etcd.host.starts_with("http://") && !self.etcd.host.starts_with("https://") {
            return Err(anyhow!(
                "etcd.host must be an http(s) URL, got '{}'",
                self.etcd.host
            ));
        }
        if self.etcd.host.starts_with("https://") {
            // TLS to the store needs the full triple
            if self.etcd.ca_file.is_none() {
                return Err(anyhow!("Expected a CA file"));
            }
            if self.etcd.cert_file.is_none() {
                return Err(anyhow!("Expected a cert file"));
            }
            if self.etcd.key_file.is_none() {
                return Err(anyhow!("Expected a key file"));
            }
        }
        if self.postgresql.name.trim().is_empty() {
            return Err(anyhow!("postgresql.name cannot be empty"));
        }
        if self.postgresql.port == 0 {
            return Err(anyhow!("postgresql.listen port cannot be 0"));
        }
        if self.postgresql.listen_addresses.trim().is_empty() {
            return Err(anyhow!("postgresql.listen addresses cannot be empty"));
        }
        if self.postgresql.replication.password.is_empty() {
            warn!("No replication password specified; peers will connect unauthenticated");
        }
        Ok(())
    }
}

/// Splits a `host[,host...]:port` listen specification.
fn parse_listen(listen: &str) -> Result<(String, u16)> {
    let (addresses, port) = listen
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("postgresql.listen must be host[,host...]:port"))?;
    let port: u16 = port
        .trim()
        .parse()
        .with_context(|| format!("Invalid listen port '{port}'"))?;
    Ok((addresses.trim().to_string(), port))
}
