use std::collections::BTreeSet;

use rpb_contracts::{Chassis, ErrorKind};
use rpb_store::{ChassisStore, StoreError};

fn rack(name: &str) -> Chassis {
    Chassis {
        id: String::new(),
        name: name.to_string(),
        dimensions: "20in x 30in x 17in".to_string(),
        server_type: "Server_Type 1".to_string(),
        is_active: true,
        related_host_ids: BTreeSet::new(),
    }
}

fn ids(values: &[&str]) -> BTreeSet<String> {
    values.iter().map(|v| v.to_string()).collect()
}

#[test]
fn create_then_delete_leaves_record_not_found() {
    let store = ChassisStore::new();
    let created = store.create(rack("Rack-A")).expect("create should succeed");
    assert!(store.get(&created.id).is_some());

    let deleted = store.delete(&created.id).expect("delete should succeed");
    assert_eq!(deleted.name, "Rack-A");
    assert!(store.get(&created.id).is_none());

    let err = store.delete(&created.id).unwrap_err();
    assert_eq!(err, StoreError::NotFound(created.id.clone()));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn second_create_with_same_name_is_duplicate() {
    let store = ChassisStore::new();
    store.create(rack("Rack-1")).expect("first create should succeed");

    let err = store.create(rack("Rack-1")).unwrap_err();
    assert_eq!(err, StoreError::DuplicateName("Rack-1".to_string()));
    assert_eq!(err.kind(), ErrorKind::DuplicateName);
    assert_eq!(store.list().len(), 1);
}

#[test]
fn related_chassis_cannot_be_deleted_until_reconciled_away() {
    let store = ChassisStore::new();
    let c1 = store.create(rack("Rack-1")).unwrap();

    let outcome = store.reconcile("h1", &ids(&[c1.id.as_str()]));
    assert_eq!(outcome.added, vec![c1.id.clone()]);

    let err = store.delete(&c1.id).unwrap_err();
    assert_eq!(err, StoreError::HasActiveRelations(c1.id.clone()));
    assert_eq!(err.kind(), ErrorKind::HasActiveRelations);
    assert!(store.get(&c1.id).is_some());

    let outcome = store.reconcile("h1", &BTreeSet::new());
    assert_eq!(outcome.removed, vec![c1.id.clone()]);
    store.delete(&c1.id).expect("delete after unlinking should succeed");
}

#[test]
fn both_relation_sides_stay_consistent() {
    let store = ChassisStore::with_seed_data(4);
    store.reconcile("h1", &ids(&["chassis:0", "chassis:2"]));
    store.reconcile("h2", &ids(&["chassis:2", "chassis:3"]));
    store
        .set_related_hosts("chassis:3", &ids(&["h1"]))
        .expect("chassis exists");
    store.reconcile("h1", &ids(&["chassis:2", "chassis:3"]));

    for chassis in store.list() {
        for host_id in &chassis.related_host_ids {
            let host = store.get_host(host_id).expect("host record should exist");
            assert!(host.related_chassis_ids.contains(&chassis.id));
        }
    }
    for host_id in ["h1", "h2"] {
        let host = store.get_host(host_id).expect("host record should exist");
        for chassis_id in &host.related_chassis_ids {
            let chassis = store.get(chassis_id).expect("chassis should exist");
            assert!(chassis.related_host_ids.contains(host_id));
        }
    }

    assert_eq!(store.get_host("h1").unwrap().related_chassis_ids, ids(&["chassis:2", "chassis:3"]));
    assert_eq!(store.get_host("h2").unwrap().related_chassis_ids, ids(&["chassis:2"]));
}

#[test]
fn snapshots_do_not_observe_later_mutations() {
    let store = ChassisStore::with_seed_data(1);
    let before = store.get("chassis:0").unwrap();
    store.reconcile("h1", &ids(&["chassis:0"]));

    assert!(before.related_host_ids.is_empty());
    assert_eq!(store.get("chassis:0").unwrap().related_host_ids, ids(&["h1"]));
}

#[test]
fn chassis_round_trips_through_json() {
    let store = ChassisStore::with_seed_data(1);
    store.reconcile("h1", &ids(&["chassis:0"]));

    let value = serde_json::to_value(store.get("chassis:0").unwrap()).unwrap();
    assert_eq!(value["id"], "chassis:0");
    assert_eq!(value["serverType"], "Server_Type 0");
    assert_eq!(value["isActive"], false);
    assert_eq!(value["relatedHostsIds"], serde_json::json!(["h1"]));
}
