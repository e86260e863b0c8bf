//! Drives the HA controller's decision table with scripted store and
//! database fakes: election, fencing, demotion, recovery, and the
//! replication-slot side effects.

use async_trait::async_trait;
use parking_lot::Mutex;
use pgsteward::core::cluster::{ClusterView, Member};
use pgsteward::core::errors::StewardError;
use pgsteward::core::ha::{DatabaseOps, Ha};
use pgsteward::core::store::{CasOutcome, ClusterStore};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn member(name: &str, host: &str) -> Member {
    Member::new(
        name,
        format!("postgres://replicator:rep-pass@{host}:5432/postgres"),
    )
}

fn view_of(members: &[Member], leader: Option<&str>, optime: i64) -> ClusterView {
    ClusterView {
        members: members
            .iter()
            .map(|m| (m.name.clone(), m.clone()))
            .collect(),
        leader_name: leader.map(str::to_string),
        last_leader_optime: optime,
    }
}

struct FakeStore {
    view: Mutex<ClusterView>,
    /// Views served by the next refreshes, ahead of the steady-state `view`.
    queued: Mutex<VecDeque<ClusterView>>,
    unreachable: AtomicBool,
    acquire: Mutex<CasOutcome>,
    renew: Mutex<CasOutcome>,
    log: Mutex<Vec<String>>,
}

impl FakeStore {
    fn with_view(view: ClusterView) -> Self {
        Self {
            view: Mutex::new(view),
            queued: Mutex::new(VecDeque::new()),
            unreachable: AtomicBool::new(false),
            acquire: Mutex::new(CasOutcome::CompareFailed),
            renew: Mutex::new(CasOutcome::CompareFailed),
            log: Mutex::new(Vec::new()),
        }
    }

    fn log_contains(&self, entry: &str) -> bool {
        self.log.lock().iter().any(|line| line == entry)
    }
}

#[async_trait]
impl ClusterStore for FakeStore {
    async fn refresh(&self) -> Result<ClusterView, StewardError> {
        self.log.lock().push("refresh".to_string());
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StewardError::StoreUnavailable("connection refused".into()));
        }
        if let Some(next) = self.queued.lock().pop_front() {
            return Ok(next);
        }
        Ok(self.view.lock().clone())
    }

    async fn touch_member(&self, name: &str, _connection_string: &str) -> bool {
        self.log.lock().push(format!("touch_member:{name}"));
        true
    }

    async fn race_init(&self, name: &str) -> CasOutcome {
        self.log.lock().push(format!("race_init:{name}"));
        CasOutcome::Applied
    }

    async fn attempt_acquire_leader(&self, name: &str) -> CasOutcome {
        self.log.lock().push(format!("acquire:{name}"));
        self.acquire.lock().clone()
    }

    async fn renew_leader(&self, name: &str) -> CasOutcome {
        self.log.lock().push(format!("renew:{name}"));
        self.renew.lock().clone()
    }

    async fn write_optime(&self, position: i64) -> bool {
        self.log.lock().push(format!("write_optime:{position}"));
        true
    }

    async fn release_leader(&self, name: &str) -> CasOutcome {
        self.log.lock().push(format!("release:{name}"));
        CasOutcome::Applied
    }

    async fn delete_member(&self, name: &str) -> bool {
        self.log.lock().push(format!("delete_member:{name}"));
        true
    }
}

struct FakeDb {
    name: String,
    healthy: AtomicBool,
    leader: AtomicBool,
    healthiest: AtomicBool,
    last_operation: i64,
    log: Mutex<Vec<String>>,
}

impl FakeDb {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            healthy: AtomicBool::new(true),
            leader: AtomicBool::new(false),
            healthiest: AtomicBool::new(true),
            last_operation: 42,
            log: Mutex::new(Vec::new()),
        }
    }

    fn log_contains(&self, entry: &str) -> bool {
        self.log.lock().iter().any(|line| line == entry)
    }
}

#[async_trait]
impl DatabaseOps for FakeDb {
    fn name(&self) -> &str {
        &self.name
    }

    async fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    async fn is_leader(&self) -> Result<bool, StewardError> {
        Ok(self.leader.load(Ordering::SeqCst))
    }

    async fn promote(&self) -> bool {
        self.log.lock().push("promote".to_string());
        self.leader.store(true, Ordering::SeqCst);
        true
    }

    async fn start(&self) -> bool {
        self.log.lock().push("start".to_string());
        self.healthy.store(true, Ordering::SeqCst);
        true
    }

    async fn write_recovery_conf(&self, leader: Option<&Member>) -> Result<(), StewardError> {
        let target = leader.map(|m| m.name.as_str()).unwrap_or("none");
        self.log.lock().push(format!("write_recovery_conf:{target}"));
        Ok(())
    }

    async fn follow_the_leader(&self, leader: Option<&Member>) -> Result<(), StewardError> {
        let target = leader.map(|m| m.name.as_str()).unwrap_or("none");
        self.log.lock().push(format!("follow:{target}"));
        self.leader.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn last_operation(&self) -> Result<i64, StewardError> {
        Ok(self.last_operation)
    }

    async fn is_healthiest_node(&self, _view: &ClusterView) -> Result<bool, StewardError> {
        Ok(self.healthiest.load(Ordering::SeqCst))
    }

    async fn sync_replication_slots(
        &self,
        members: &HashSet<String>,
    ) -> Result<(), StewardError> {
        let mut names: Vec<&str> = members
            .iter()
            .filter(|name| name.as_str() != self.name)
            .map(String::as_str)
            .collect();
        names.sort_unstable();
        self.log.lock().push(format!("sync_slots:{}", names.join(",")));
        Ok(())
    }

    async fn drop_replication_slots(&self) -> Result<(), StewardError> {
        self.log.lock().push("drop_slots".to_string());
        Ok(())
    }
}

fn harness(view: ClusterView, db: FakeDb) -> (Arc<FakeStore>, Arc<FakeDb>, Ha<FakeStore, FakeDb>) {
    let store = Arc::new(FakeStore::with_view(view));
    let db = Arc::new(db);
    let ha = Ha::new(store.clone(), db.clone());
    (store, db, ha)
}

fn two_node_view(leader: Option<&str>) -> ClusterView {
    view_of(
        &[member("alpha", "10.0.0.1"), member("bravo", "10.0.0.2")],
        leader,
        1000,
    )
}

#[tokio::test]
async fn test_standby_wins_the_election_and_promotes() {
    let (store, db, mut ha) = harness(two_node_view(None), FakeDb::new("alpha"));
    *store.acquire.lock() = CasOutcome::Applied;

    let message = ha.run_cycle().await;
    assert_eq!(message, "promoted self to leader by acquiring session lock");
    assert!(db.log_contains("promote"));
    assert!(store.log_contains("acquire:alpha"));
}

#[tokio::test]
async fn test_running_primary_just_takes_the_lock() {
    let (store, db, mut ha) = harness(two_node_view(None), FakeDb::new("alpha"));
    *store.acquire.lock() = CasOutcome::Applied;
    db.leader.store(true, Ordering::SeqCst);

    let message = ha.run_cycle().await;
    assert_eq!(message, "acquired session lock as a leader");
    assert!(!db.log_contains("promote"));
}

#[tokio::test]
async fn test_losing_the_acquire_race_demotes_a_primary() {
    let (store, db, mut ha) = harness(two_node_view(Some("bravo")), FakeDb::new("alpha"));
    *store.acquire.lock() = CasOutcome::CompareFailed;
    db.leader.store(true, Ordering::SeqCst);
    // the first refresh sees an unlocked cluster; the re-refresh after the
    // failed CAS sees the winner
    store.queued.lock().push_back(two_node_view(None));

    let message = ha.run_cycle().await;
    assert_eq!(message, "demoted self after trying and failing to obtain lock");
    assert!(store.log_contains("acquire:alpha"));
    assert!(db.log_contains("follow:bravo"));
}

#[tokio::test]
async fn test_losing_the_acquire_race_follows_as_standby() {
    let (store, db, mut ha) = harness(two_node_view(Some("bravo")), FakeDb::new("alpha"));
    *store.acquire.lock() = CasOutcome::CompareFailed;
    store.queued.lock().push_back(two_node_view(None));

    let message = ha.run_cycle().await;
    assert_eq!(
        message,
        "following new leader after trying and failing to obtain lock"
    );
    assert!(store.log_contains("acquire:alpha"));
    assert!(db.log_contains("follow:bravo"));
}

#[tokio::test]
async fn test_unhealthiest_primary_demotes_without_an_election() {
    let (store, db, mut ha) = harness(two_node_view(None), FakeDb::new("alpha"));
    db.healthiest.store(false, Ordering::SeqCst);
    db.leader.store(true, Ordering::SeqCst);

    let message = ha.run_cycle().await;
    assert_eq!(message, "demoting self because i am not the healthiest node");
    assert!(!store.log_contains("acquire:alpha"));
    assert!(db.log_contains("follow:none"));
}

#[tokio::test]
async fn test_unhealthiest_standby_keeps_following() {
    let (store, db, mut ha) = harness(two_node_view(None), FakeDb::new("alpha"));
    db.healthiest.store(false, Ordering::SeqCst);

    let message = ha.run_cycle().await;
    assert_eq!(
        message,
        "following a different leader because i am not the healthiest node"
    );
    assert!(!store.log_contains("acquire:alpha"));
}

#[tokio::test]
async fn test_leader_with_the_lock_renews_and_writes_optime() {
    let (store, db, mut ha) = harness(two_node_view(Some("alpha")), FakeDb::new("alpha"));
    *store.renew.lock() = CasOutcome::Applied;
    db.leader.store(true, Ordering::SeqCst);

    let message = ha.run_cycle().await;
    assert_eq!(message, "no action. i am the leader with the lock");
    assert!(store.log_contains("renew:alpha"));
    assert!(store.log_contains("write_optime:42"));
    // slots for every member except self
    assert!(db.log_contains("sync_slots:bravo"));
}

#[tokio::test]
async fn test_lock_holder_still_in_recovery_promotes() {
    let (store, db, mut ha) = harness(two_node_view(Some("alpha")), FakeDb::new("alpha"));
    *store.renew.lock() = CasOutcome::Applied;

    let message = ha.run_cycle().await;
    assert_eq!(
        message,
        "promoted self to leader because i had the session lock"
    );
    assert!(db.log_contains("promote"));
}

#[tokio::test]
async fn test_primary_without_the_lock_demotes() {
    let (_store, db, mut ha) = harness(two_node_view(Some("bravo")), FakeDb::new("alpha"));
    db.leader.store(true, Ordering::SeqCst);

    let message = ha.run_cycle().await;
    assert_eq!(
        message,
        "demoting self because i do not have the lock and i was a leader"
    );
    assert!(db.log_contains("follow:bravo"));
}

#[tokio::test]
async fn test_standby_following_a_locked_leader_is_a_no_op() {
    let (store, db, mut ha) = harness(two_node_view(Some("bravo")), FakeDb::new("alpha"));

    let message = ha.run_cycle().await;
    assert_eq!(message, "no action. i am a secondary and i am following a leader");
    assert!(db.log_contains("follow:bravo"));
    assert!(!store.log_contains("renew:alpha"));
}

#[tokio::test]
async fn test_failed_renewal_demotes_the_lock_holder() {
    let (store, db, mut ha) = harness(two_node_view(Some("alpha")), FakeDb::new("alpha"));
    *store.renew.lock() = CasOutcome::CompareFailed;
    db.leader.store(true, Ordering::SeqCst);

    let message = ha.run_cycle().await;
    assert_eq!(
        message,
        "demoting self because i do not have the lock and i was a leader"
    );
    assert!(store.log_contains("renew:alpha"));
    assert!(db.log_contains("follow:alpha"));
}

#[tokio::test]
async fn test_unreachable_store_isolates_a_primary_without_releasing_the_lease() {
    let (store, db, mut ha) = harness(two_node_view(Some("alpha")), FakeDb::new("alpha"));
    store.unreachable.store(true, Ordering::SeqCst);
    db.leader.store(true, Ordering::SeqCst);

    let message = ha.run_cycle().await;
    assert_eq!(
        message,
        "demoted self because etcd is not accessible and i was a leader"
    );
    assert!(db.log_contains("follow:none"));
    assert!(!store.log_contains("release:alpha"));
}

#[tokio::test]
async fn test_unreachable_store_leaves_a_standby_alone() {
    let (store, db, mut ha) = harness(two_node_view(Some("bravo")), FakeDb::new("alpha"));
    store.unreachable.store(true, Ordering::SeqCst);

    let message = ha.run_cycle().await;
    assert_eq!(message, "etcd is not accessible. no action");
    assert!(db.log.lock().is_empty());
}

#[tokio::test]
async fn test_stopped_standby_recovers_as_secondary() {
    let (_store, db, mut ha) = harness(two_node_view(Some("bravo")), FakeDb::new("alpha"));
    db.healthy.store(false, Ordering::SeqCst);

    let message = ha.run_cycle().await;
    assert_eq!(message, "started as secondary");
    assert!(db.log_contains("write_recovery_conf:bravo"));
    assert!(db.log_contains("start"));
}

#[tokio::test]
async fn test_stopped_lock_holder_recovers_readonly_then_promotes() {
    let (store, db, mut ha) = harness(two_node_view(Some("alpha")), FakeDb::new("alpha"));
    *store.renew.lock() = CasOutcome::Applied;
    db.healthy.store(false, Ordering::SeqCst);

    let message = ha.run_cycle().await;
    assert_eq!(
        message,
        "promoted self to leader because i had the session lock"
    );
    // recovery wrote a leaderless conf before starting
    assert!(db.log_contains("write_recovery_conf:none"));
    assert!(db.log_contains("start"));
    assert!(db.log_contains("promote"));
}

#[tokio::test]
async fn test_slot_reconcile_drops_slots_on_a_standby() {
    let (_store, db, mut ha) = harness(two_node_view(Some("bravo")), FakeDb::new("alpha"));

    ha.run_cycle().await;
    ha.sync_replication_slots().await;
    assert!(db.log_contains("drop_slots"));
}

#[tokio::test]
async fn test_slot_reconcile_converges_the_leader_to_the_membership() {
    let (store, db, mut ha) = harness(
        view_of(
            &[
                member("alpha", "10.0.0.1"),
                member("bravo", "10.0.0.2"),
                member("charlie", "10.0.0.3"),
            ],
            Some("alpha"),
            1000,
        ),
        FakeDb::new("alpha"),
    );
    *store.renew.lock() = CasOutcome::Applied;
    db.leader.store(true, Ordering::SeqCst);

    ha.run_cycle().await;
    assert!(db.log_contains("sync_slots:bravo,charlie"));

    // charlie is evicted; the next cycle shrinks the expected slot set
    *store.view.lock() = two_node_view(Some("alpha"));
    db.log.lock().clear();
    ha.run_cycle().await;
    assert!(db.log_contains("sync_slots:bravo"));
}
