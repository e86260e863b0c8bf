use pgsteward::core::cluster::{ClusterView, Member};

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

#[test]
fn test_empty_view_is_unlocked() {
    let view = ClusterView::empty();
    assert!(view.is_unlocked());
    assert!(view.leader_member().is_none());
    assert_eq!(view.last_leader_optime, 0);
    assert!(view.member_names().is_empty());
}

#[test]
fn test_leader_resolves_against_members() {
    let view = view_of(
        &[member("alpha", "10.0.0.1"), member("bravo", "10.0.0.2")],
        Some("alpha"),
        42,
    );
    assert!(!view.is_unlocked());
    assert_eq!(view.leader_member().unwrap().name, "alpha");
    assert_eq!(view.last_leader_optime, 42);
}

#[test]
fn test_lease_naming_a_missing_member_leaves_the_view_unlocked() {
    let view = view_of(&[member("bravo", "10.0.0.2")], Some("vanished"), 0);
    assert!(view.leader_member().is_none());
    assert!(view.is_unlocked());
}

#[test]
fn test_member_names_cover_all_members() {
    let view = view_of(
        &[member("alpha", "10.0.0.1"), member("bravo", "10.0.0.2")],
        None,
        0,
    );
    let names = view.member_names();
    assert_eq!(names.len(), 2);
    assert!(names.contains("alpha"));
    assert!(names.contains("bravo"));
}
