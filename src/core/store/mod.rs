// src/core/store/mod.rs

//! The consensus-store seam: a narrow compare-and-swap/TTL contract over a
//! remote linearizable key-value store, plus the etcd implementation.

pub mod etcd;

pub use etcd::EtcdStore;

use crate::core::cluster::ClusterView;
use crate::core::errors::StewardError;
use async_trait::async_trait;

/// Outcome of a compare-and-swap write against the store. CAS misses are a
/// normal negative result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write committed.
    Applied,
    /// The existence or prior-value precondition did not hold.
    CompareFailed,
    /// The store could not be reached; nothing is known about the key.
    Transport(String),
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied)
    }
}

/// The key-value contract the HA controller runs against.
///
/// Key layout under the configured scope:
/// - `initialize` — one-shot bootstrap race key; value = winner's name.
/// - `leader` — leader lease; value = member name; bound to the leader TTL.
/// - `optime/leader` — last leader WAL position; no TTL.
/// - `members/<name>` — member connection string; bound to the member TTL.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// One recursive read of the cluster subtree, decoded into a view. An
    /// absent subtree is an empty cluster, not an error.
    async fn refresh(&self) -> Result<ClusterView, StewardError>;

    /// Upserts this node's member key, refreshing its TTL.
    async fn touch_member(&self, name: &str, connection_string: &str) -> bool;

    /// One-shot bootstrap race on the `initialize` key (create-if-absent).
    async fn race_init(&self, name: &str) -> CasOutcome;

    /// Takes the leader lease iff no lease exists. Takeover of a live lease
    /// is never attempted; expiry is the only handover path.
    async fn attempt_acquire_leader(&self, name: &str) -> CasOutcome;

    /// Extends the leader lease iff its current value is `name`.
    async fn renew_leader(&self, name: &str) -> CasOutcome;

    /// Unconditionally records the leader's WAL position.
    async fn write_optime(&self, position: i64) -> bool;

    /// Deletes the leader lease iff its current value is `name`.
    async fn release_leader(&self, name: &str) -> CasOutcome;

    /// Deletes this node's member key.
    async fn delete_member(&self, name: &str) -> bool;
}
