// src/core/ha.rs

//! The failover state machine. One `run_cycle` consumes a fresh cluster view
//! plus local database probes, and converges the node towards the consensus
//! state: acquire or renew the leader lease, promote, demote, or follow.

use crate::core::cluster::{ClusterView, Member};
use crate::core::errors::StewardError;
use crate::core::postgres::Postgresql;
use crate::core::store::ClusterStore;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, warn};

/// The local-database capability the controller drives. `Postgresql` is the
/// real implementation; tests script the decision table with fakes.
#[async_trait]
pub trait DatabaseOps: Send + Sync {
    fn name(&self) -> &str;
    async fn is_healthy(&self) -> bool;
    async fn is_leader(&self) -> Result<bool, StewardError>;
    async fn promote(&self) -> bool;
    async fn start(&self) -> bool;
    async fn write_recovery_conf(&self, leader: Option<&Member>) -> Result<(), StewardError>;
    async fn follow_the_leader(&self, leader: Option<&Member>) -> Result<(), StewardError>;
    async fn last_operation(&self) -> Result<i64, StewardError>;
    async fn is_healthiest_node(&self, view: &ClusterView) -> Result<bool, StewardError>;
    async fn sync_replication_slots(&self, members: &HashSet<String>)
    -> Result<(), StewardError>;
    async fn drop_replication_slots(&self) -> Result<(), StewardError>;
}

#[async_trait]
impl DatabaseOps for Postgresql {
    fn name(&self) -> &str {
        Postgresql::name(self)
    }
    async fn is_healthy(&self) -> bool {
        Postgresql::is_healthy(self).await
    }
    async fn is_leader(&self) -> Result<bool, StewardError> {
        Postgresql::is_leader(self).await
    }
    async fn promote(&self) -> bool {
        Postgresql::promote(self).await
    }
    async fn start(&self) -> bool {
        Postgresql::start(self).await
    }
    async fn write_recovery_conf(&self, leader: Option<&Member>) -> Result<(), StewardError> {
        Postgresql::write_recovery_conf(self, leader)
    }
    async fn follow_the_leader(&self, leader: Option<&Member>) -> Result<(), StewardError> {
        Postgresql::follow_the_leader(self, leader).await
    }
    async fn last_operation(&self) -> Result<i64, StewardError> {
        Postgresql::last_operation(self).await
    }
    async fn is_healthiest_node(&self, view: &ClusterView) -> Result<bool, StewardError> {
        Postgresql::is_healthiest_node(self, view).await
    }
    async fn sync_replication_slots(
        &self,
        members: &HashSet<String>,
    ) -> Result<(), StewardError> {
        Postgresql::sync_replication_slots(self, members).await
    }
    async fn drop_replication_slots(&self) -> Result<(), StewardError> {
        Postgresql::drop_replication_slots(self).await
    }
}

/// Drives one node through the election and follow/promote rules.
pub struct Ha<S, D> {
    store: Arc<S>,
    db: Arc<D>,
    cluster: ClusterView,
}

impl<S: ClusterStore, D: DatabaseOps> Ha<S, D> {
    pub fn new(store: Arc<S>, db: Arc<D>) -> Self {
        Self {
            store,
            db,
            cluster: ClusterView::empty(),
        }
    }

    async fn refresh_cluster(&mut self) -> Result<(), StewardError> {
        self.cluster = self.store.refresh().await?;
        Ok(())
    }

    fn has_lock(&self) -> bool {
        let lock_owner = self.cluster.leader_member().map(|m| m.name.as_str());
        info!(
            "Lock owner: {}; I am {}",
            lock_owner.unwrap_or("none"),
            self.db.name()
        );
        lock_owner == Some(self.db.name())
    }

    /// Renews the lease and records the leader WAL position. The position is
    /// read first so a database failure surfaces before any store write.
    async fn update_leadership(&self) -> Result<bool, StewardError> {
        let optime = self.db.last_operation().await?;
        if !self.store.renew_leader(self.db.name()).await.is_applied() {
            return Ok(false);
        }
        let _ = self.store.write_optime(optime).await;
        Ok(true)
    }

    /// Starts a stopped database: read-only when this node still owns the
    /// lease, as a follower of the current leader otherwise.
    async fn recover(&mut self) -> Result<bool, StewardError> {
        if self.db.is_healthy().await {
            return Ok(false);
        }

        let locked = self.has_lock();
        let leader = if locked {
            None
        } else {
            self.cluster.leader_member().cloned()
        };
        self.db.write_recovery_conf(leader.as_ref()).await?;
        self.db.start().await;
        if locked {
            info!("Started as readonly because I had the session lock");
            self.refresh_cluster().await?;
        }
        Ok(true)
    }

    /// Points the local server at the current leader, restarting only when
    /// the recovery configuration actually changes. With no resolvable leader
    /// this converges a primary into a read-only standby.
    async fn follow_the_leader(&self) -> Result<(), StewardError> {
        self.db
            .follow_the_leader(self.cluster.leader_member())
            .await
    }

    /// One tick of the state machine. Always returns the single advisory
    /// message describing what the cycle decided; failures are absorbed here
    /// so the loop never dies.
    pub async fn run_cycle(&mut self) -> String {
        match self.try_run_cycle().await {
            Ok(message) => message,
            Err(e) if e.is_store_error() => {
                error!("Error communicating with etcd: {e}");
                if let Ok(true) = self.db.is_leader().await {
                    // Isolate to read-only and let the lease expire on its
                    // own. Releasing it here would hand over leadership
                    // before the fence is in place.
                    if let Err(e) = self.db.follow_the_leader(None).await {
                        warn!("Failed to demote into read-only: {e}");
                    }
                    "demoted self because etcd is not accessible and i was a leader".to_string()
                } else {
                    "etcd is not accessible. no action".to_string()
                }
            }
            Err(e) if e.is_database_error() => {
                error!("Error communicating with PostgreSQL: {e}");
                "error communicating with postgresql. will try again".to_string()
            }
            Err(e) => {
                error!("HA cycle failed: {e}");
                "cycle failed. will try again".to_string()
            }
        }
    }

    async fn try_run_cycle(&mut self) -> Result<String, StewardError> {
        self.refresh_cluster().await?;

        if self.recover().await? && !self.has_lock() {
            return Ok("started as secondary".to_string());
        }

        let name = self.db.name().to_string();

        if self.cluster.is_unlocked() {
            if self.db.is_healthiest_node(&self.cluster).await? {
                if self.store.attempt_acquire_leader(&name).await.is_applied() {
                    if self.db.is_leader().await? {
                        return Ok("acquired session lock as a leader".to_string());
                    }
                    if !self.db.promote().await {
                        warn!("pg_ctl promote failed");
                    }
                    return Ok("promoted self to leader by acquiring session lock".to_string());
                }

                self.refresh_cluster().await?;
                if self.db.is_leader().await? {
                    self.follow_the_leader().await?;
                    return Ok(
                        "demoted self after trying and failing to obtain lock".to_string()
                    );
                }
                self.follow_the_leader().await?;
                return Ok("following new leader after trying and failing to obtain lock".to_string());
            }

            self.refresh_cluster().await?;
            if self.db.is_leader().await? {
                self.follow_the_leader().await?;
                return Ok("demoting self because i am not the healthiest node".to_string());
            }
            self.follow_the_leader().await?;
            return Ok("following a different leader because i am not the healthiest node".to_string());
        }

        if !self.has_lock() || !self.update_leadership().await? {
            info!("Does not have lock");
            if self.db.is_leader().await? {
                self.follow_the_leader().await?;
                return Ok(
                    "demoting self because i do not have the lock and i was a leader".to_string(),
                );
            }
            self.follow_the_leader().await?;
            return Ok("no action. i am a secondary and i am following a leader".to_string());
        }

        let message = if self.db.is_leader().await? {
            "no action. i am the leader with the lock"
        } else {
            if !self.db.promote().await {
                warn!("pg_ctl promote failed");
            }
            "promoted self to leader because i had the session lock"
        };

        // holding a renewed lease: one slot per live member besides self
        if let Err(e) = self
            .db
            .sync_replication_slots(&self.cluster.member_names())
            .await
        {
            warn!("Failed to sync replication slots: {e}");
        }

        Ok(message.to_string())
    }

    /// Per-tick slot reconcile, outside the cycle proper: a leader converges
    /// its slots to the live membership, everyone else sheds theirs.
    pub async fn sync_replication_slots(&self) {
        let result = match self.db.is_leader().await {
            Ok(true) => {
                self.db
                    .sync_replication_slots(&self.cluster.member_names())
                    .await
            }
            Ok(false) => self.db.drop_replication_slots().await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("Exception when changing replication slots: {e}");
        }
    }
}
