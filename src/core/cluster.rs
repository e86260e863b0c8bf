// src/core/cluster.rs

//! Typed view of the cluster subtree kept in the consensus store.

use std::collections::{HashMap, HashSet};

/// A node participating in the cluster, as registered under `members/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    /// URL at which peers can reach this node's PostgreSQL with the
    /// replication credentials embedded.
    pub connection_string: String,
    /// Remaining lease seconds as reported by the store. Read-only.
    pub ttl: Option<i64>,
}

impl Member {
    pub fn new(name: impl Into<String>, connection_string: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            connection_string: connection_string.into(),
            ttl: None,
        }
    }
}

/// A snapshot of cluster state composed from one recursive read of the store
/// subtree. The leader is kept as a name and resolved against `members` on
/// demand.
#[derive(Debug, Clone, Default)]
pub struct ClusterView {
    pub members: HashMap<String, Member>,
    pub leader_name: Option<String>,
    /// Last WAL position written by the leader, 0 when absent.
    pub last_leader_optime: i64,
}

impl ClusterView {
    pub fn empty() -> Self {
        Self::default()
    }

    /// The member entry the leader lease points at, if it resolves.
    pub fn leader_member(&self) -> Option<&Member> {
        self.leader_name
            .as_deref()
            .and_then(|name| self.members.get(name))
    }

    /// A cluster is unlocked when no lease exists or the lease value does not
    /// name a live member.
    pub fn is_unlocked(&self) -> bool {
        self.leader_member().is_none()
    }

    /// All registered member names. The database adapter subtracts the local
    /// node when deriving the expected replication-slot set.
    pub fn member_names(&self) -> HashSet<String> {
        self.members.keys().cloned().collect()
    }
}
