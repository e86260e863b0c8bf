// src/core/supervisor.rs

//! Owns startup, the periodic tick loop, and shutdown cleanup. One supervisor
//! runs per node and exclusively owns the local data directory and server
//! process for its lifetime.

use crate::config::Config;
use crate::core::errors::StewardError;
use crate::core::ha::Ha;
use crate::core::postgres::Postgresql;
use crate::core::store::{CasOutcome, ClusterStore, EtcdStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::sleep;
use tracing::{debug, info, warn};

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Container-style hook: shell scripts placed here run once at startup.
const INIT_SCRIPT_DIR: &str = "/docker-entrypoint-initdb.d";

pub struct Supervisor {
    name: String,
    loop_wait: u64,
    store: Arc<EtcdStore>,
    db: Arc<Postgresql>,
    ha: Ha<EtcdStore, Postgresql>,
}

impl Supervisor {
    pub fn new(config: &Config) -> Result<Self, StewardError> {
        let store = Arc::new(EtcdStore::new(&config.etcd)?);
        let db = Arc::new(Postgresql::new(&config.postgresql));
        let ha = Ha::new(store.clone(), db.clone());
        Ok(Self {
            name: config.postgresql.name.clone(),
            loop_wait: config.loop_wait,
            store,
            db,
            ha,
        })
    }

    /// Blocks until the store accepts the first member registration.
    async fn wait_for_store(&self) {
        loop {
            info!("waiting on etcd");
            if self
                .store
                .touch_member(&self.name, self.db.connection_string())
                .await
            {
                return;
            }
            sleep(RETRY_DELAY).await;
        }
    }

    /// Brings the node to a runnable state: adopt an existing data directory,
    /// win the bootstrap race and become the first leader, or clone from the
    /// current leader.
    pub async fn initialize(&mut self, force_leader: bool) -> Result<(), StewardError> {
        run_init_scripts().await;
        self.wait_for_store().await;

        if !self.db.data_directory_empty() {
            // an existing data directory is adopted as-is; the first HA cycle
            // starts the server if it is down
            if self.db.is_running().await
                && let Err(e) = self.db.load_replication_slots().await
            {
                debug!("Could not load replication slots: {e}");
            }
        } else if !self.init_cluster(force_leader).await? {
            self.sync_from_leader().await?;
        }
        Ok(())
    }

    /// The cold-start branch. At most one node wins the `initialize` race and
    /// runs `initdb`; with `force_leader` the race is skipped outright.
    async fn init_cluster(&self, force_leader: bool) -> Result<bool, StewardError> {
        if !force_leader && !self.store.race_init(&self.name).await.is_applied() {
            return Ok(false);
        }

        if !self.db.initialize().await {
            return Err(StewardError::Subprocess("initdb failed".to_string()));
        }
        self.store.attempt_acquire_leader(&self.name).await;
        self.db.start().await;
        self.db.create_users().await?;
        Ok(true)
    }

    /// The lost-the-race branch: wait for a leader to appear, then clone it
    /// by base backup and start as a standby. Retries every 5 seconds.
    async fn sync_from_leader(&self) -> Result<(), StewardError> {
        loop {
            info!("resolving leader");
            match self.store.refresh().await {
                Ok(view) => {
                    if let Some(leader) = view.leader_member() {
                        info!("syncing with leader '{}'", leader.name);
                        if self.db.sync_from_leader(leader).await {
                            self.db.write_recovery_conf(Some(leader))?;
                            self.db.start().await;
                            return Ok(());
                        }
                    }
                }
                Err(e) => warn!("Error communicating with etcd: {e}"),
            }
            sleep(RETRY_DELAY).await;
        }
    }

    /// The main loop. Each tick refreshes this node's member lease, runs one
    /// HA cycle, and reconciles replication slots. Runs until cancelled.
    pub async fn run(&mut self) {
        loop {
            self.store
                .touch_member(&self.name, self.db.connection_string())
                .await;
            let message = self.ha.run_cycle().await;
            info!("{message}");
            self.ha.sync_replication_slots().await;
            sleep(Duration::from_secs(self.loop_wait)).await;
        }
    }

    /// Releases everything scoped to this supervisor: the server process, the
    /// member key, and the leader lease (only if we still hold it).
    pub async fn cleanup(&self) {
        info!("Shutting down");
        self.db.stop().await;
        self.store.delete_member(&self.name).await;
        if let CasOutcome::Transport(e) = self.store.release_leader(&self.name).await {
            warn!("Could not release the leader lease: {e}");
        }
    }
}

/// Runs every `*.sh` under the init-script directory, in name order.
/// Failures are logged and skipped.
async fn run_init_scripts() {
    let Ok(entries) = std::fs::read_dir(INIT_SCRIPT_DIR) else {
        return;
    };

    let mut scripts: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "sh"))
        .collect();
    scripts.sort();

    for script in scripts {
        info!("Running init script {}", script.display());
        let status = tokio::process::Command::new("sh")
            .arg(&script)
            .status()
            .await;
        if !matches!(status, Ok(status) if status.success()) {
            warn!("Failed to run init script: {}", script.display());
        }
    }
}

/// Waits for SIGINT or SIGTERM.
pub async fn await_shutdown_signal() {
    let mut sigint = signal(SignalKind::interrupt()).expect("Failed to create SIGINT stream");
    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");

    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown."),
        _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown."),
    }
}

/// Reaps orphaned children on SIGCHLD when running as PID 1 (the init-process
/// role in a container): exited descendants reparent to us and nobody else
/// will collect them. Outside PID 1 the runtime reaps its own children and a
/// global waitpid would steal their exit statuses.
pub fn spawn_child_reaper() {
    if std::process::id() != 1 {
        return;
    }
    tokio::spawn(async {
        let mut sigchld = signal(SignalKind::child()).expect("Failed to create SIGCHLD stream");
        while sigchld.recv().await.is_some() {
            reap_children();
        }
    });
}

fn reap_children() {
    let mut status: libc::c_int = 0;
    // WNOHANG only collects already-exited children, so this never blocks
    while unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) } > 0 {}
}
