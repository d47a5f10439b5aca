#![forbid(unsafe_code)]

use reap_core::{Action, ChangeSet, Entry, InventoryError, ObjectId};
use reap_store::{diff, DiffInput, Inventory};

fn cm(name: &str) -> Entry {
    Entry::new(ObjectId::new("default", name, "", "ConfigMap"), "v1", Action::Created)
}

fn deploy(name: &str, version: &str) -> Entry {
    Entry::new(ObjectId::new("default", name, "apps", "Deployment"), version, Action::Configured)
}

fn inv(entries: Vec<Entry>) -> Inventory {
    let mut inv = Inventory::new();
    inv.add_change_set(entries.into_iter().collect()).unwrap();
    inv
}

fn names(objs: &[reap_core::ObjRef]) -> Vec<&str> {
    objs.iter().map(|o| o.name.as_str()).collect()
}

#[test]
fn list_and_metadata_match_cardinality() {
    let i = inv(vec![cm("a"), cm("b"), deploy("c", "v1")]);
    assert_eq!(i.len(), 3);
    assert_eq!(i.list().unwrap().len(), 3);
    assert_eq!(i.list_metadata().unwrap().len(), 3);

    let refs = i.list().unwrap();
    assert_eq!(refs[2].api_version(), "apps/v1");
    assert_eq!(refs[2].kind, "Deployment");
    assert_eq!(refs[0].namespace.as_deref(), Some("default"));
}

#[test]
fn merging_same_change_set_twice_is_idempotent() {
    let cs: ChangeSet = vec![cm("a"), cm("b"), cm("a")].into_iter().collect();
    let mut i = Inventory::new();
    i.add_change_set(cs.clone()).unwrap();
    i.add_change_set(cs).unwrap();
    assert_eq!(i.len(), 2);
    assert_eq!(i.list_metadata().unwrap().len(), 2);
}

#[test]
fn duplicate_ids_overwrite_without_error() {
    let mut i = Inventory::new();
    let res = i.add_change_set(vec![deploy("web", "v1beta1"), deploy("web", "v1")].into_iter().collect());
    assert!(res.is_ok(), "overwriting a duplicate id is the merge policy, not an error");
    assert_eq!(i.len(), 1);
    assert_eq!(i.list().unwrap()[0].version, "v1");
}

#[test]
fn diff_of_inventory_with_itself_is_empty() {
    let i = inv(vec![cm("a"), deploy("b", "v1")]);
    assert!(diff(DiffInput { current: &i, previous: &i }).unwrap().is_empty());
    let empty = Inventory::new();
    assert!(diff(DiffInput { current: &empty, previous: &empty }).unwrap().is_empty());
}

#[test]
fn diff_returns_objects_only_in_previous() {
    let a = inv(vec![cm("test1"), cm("test2")]);
    let b = inv(vec![cm("test1")]);

    let stale = diff(DiffInput { current: &b, previous: &a }).unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].name, "test2");

    let reverse = diff(DiffInput { current: &a, previous: &b }).unwrap();
    assert!(reverse.is_empty());
}

#[test]
fn diff_preserves_previous_order() {
    let previous = inv(vec![cm("z"), deploy("keep", "v1"), cm("m"), cm("a"), deploy("y", "v1")]);
    let current = inv(vec![deploy("keep", "v1")]);
    let stale = diff(DiffInput { current: &current, previous: &previous }).unwrap();
    assert_eq!(names(&stale), vec!["z", "m", "a", "y"]);
    assert_eq!(stale[3].kind, "Deployment");
}

#[test]
fn version_change_is_not_stale() {
    let previous = inv(vec![deploy("web", "v1beta1"), cm("cfg")]);
    let current = inv(vec![deploy("web", "v1"), cm("cfg")]);
    assert!(diff(DiffInput { current: &current, previous: &previous }).unwrap().is_empty());
}

#[test]
fn same_name_different_kind_is_stale() {
    let previous = inv(vec![cm("web"), deploy("web", "v1")]);
    let current = inv(vec![deploy("web", "v1")]);
    let stale = diff(DiffInput { current: &current, previous: &previous }).unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].kind, "ConfigMap");
}

#[test]
fn invalid_entry_rejects_whole_change_set() {
    let mut i = inv(vec![cm("a")]);
    let bad: ChangeSet = vec![
        cm("b"),
        Entry::new(ObjectId::new("default", "", "", "ConfigMap"), "v1", Action::Created),
    ]
    .into_iter()
    .collect();
    let err = i.add_change_set(bad).unwrap_err();
    assert!(matches!(&err, InventoryError::InvalidEntry { field, .. } if field == "name"), "err={:?}", err);
    assert_eq!(i.len(), 1);
    assert!(!i.contains(&ObjectId::new("default", "b", "", "ConfigMap")));

    let no_kind: ChangeSet = vec![Entry::new(ObjectId::new("default", "c", "", ""), "v1", Action::Created)]
        .into_iter()
        .collect();
    let err = i.add_change_set(no_kind).unwrap_err();
    assert!(matches!(&err, InventoryError::InvalidEntry { field, .. } if field == "kind"), "err={:?}", err);
    assert_eq!(i.len(), 1);
}

#[test]
fn entry_without_version_is_rejected() {
    let mut i = inv(vec![cm("a"), cm("b")]);
    let unversioned: ChangeSet = vec![cm("c"), deploy("web", "")].into_iter().collect();
    let err = i.add_change_set(unversioned).unwrap_err();
    assert!(matches!(&err, InventoryError::InvalidEntry { field, .. } if field == "version"), "err={:?}", err);
    assert_eq!(i.len(), 2);
    assert!(!i.contains(&ObjectId::new("default", "c", "", "ConfigMap")));
}

#[test]
fn corrupted_persisted_inventory_fails_on_read() {
    let raw = r#"{"entries":[{"id":"default_a__ConfigMap","v":"v1"},{"id":"garbage","v":"v1"}]}"#;
    let corrupt: Inventory = serde_json::from_str(raw).unwrap();
    assert_eq!(corrupt.len(), 2);
    assert!(matches!(corrupt.list(), Err(InventoryError::Parse { .. })));
    assert!(matches!(corrupt.list_metadata(), Err(InventoryError::Parse { .. })));

    let good = inv(vec![cm("a")]);
    assert!(matches!(diff(DiffInput { current: &good, previous: &corrupt }), Err(InventoryError::Parse { .. })));
    assert!(matches!(diff(DiffInput { current: &corrupt, previous: &good }), Err(InventoryError::Parse { .. })));
}

#[test]
fn persisted_baseline_diffs_like_in_memory() {
    let previous = inv(vec![cm("a"), cm("b")]);
    let json = serde_json::to_string(&previous).unwrap();
    let reloaded: Inventory = serde_json::from_str(&json).unwrap();
    let current = inv(vec![cm("b")]);
    let stale = diff(DiffInput { current: &current, previous: &reloaded }).unwrap();
    assert_eq!(names(&stale), vec!["a"]);
}
