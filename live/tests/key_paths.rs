//! Key-path filtered observation.

mod common;

use parking_lot::Mutex;
use ripple_live::{Collection, CollectionChange, LiveError, ObjectChange, Queue};
use serde_json::json;
use std::sync::Arc;

#[test]
fn object_observer_ignores_untracked_properties() {
    let db = common::open();
    let realm = db.realm().unwrap();
    let rex = realm
        .write(|r| r.create("dogs", json!({"name": "rex", "age": 1, "color": "black"})))
        .unwrap();

    let changed = Arc::new(Mutex::new(Vec::new()));
    let _token = rex
        .observe(&["color"], {
            let changed = Arc::clone(&changed);
            move |change| {
                if let ObjectChange::Change(_, properties) = change {
                    let names: Vec<String> = properties.into_iter().map(|p| p.name).collect();
                    changed.lock().push(names);
                }
            }
        })
        .unwrap();
    realm.refresh().unwrap();

    realm.write(|_| rex.set("age", 2)).unwrap();
    assert!(changed.lock().is_empty());

    realm
        .write(|_| {
            rex.set("age", 3)?;
            rex.set("color", "white")
        })
        .unwrap();
    assert_eq!(*changed.lock(), vec![vec!["color".to_string()]]);
}

#[test]
fn filtered_queue_observer_reports_old_values_for_tracked_property() {
    let db = common::open();
    let main = db.realm().unwrap();
    let rex = main
        .write(|r| r.create("dogs", json!({"name": "rex", "age": 1, "color": "black"})))
        .unwrap();

    let queue = Queue::new("key-paths").unwrap();
    let changes = Arc::new(Mutex::new(Vec::new()));
    let _token = queue
        .sync({
            let db = db.clone();
            let changes = Arc::clone(&changes);
            move || {
                let realm = db.realm().unwrap();
                let rex = realm.object("dogs", "rex").unwrap().unwrap();
                rex.observe(&["age"], move |change| {
                    if let ObjectChange::Change(_, properties) = change {
                        changes.lock().push(properties);
                    }
                })
                .unwrap()
            }
        })
        .unwrap();
    queue.sync(|| ()).unwrap();

    main.write(|_| rex.set("color", "white")).unwrap();
    main.write(|_| rex.set("age", 5)).unwrap();

    assert!(common::wait_until(|| !changes.lock().is_empty()));
    let changes = changes.lock();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].len(), 1);
    assert_eq!(changes[0][0].name, "age");
    assert_eq!(changes[0][0].old_value, Some(json!(1)));
    assert_eq!(changes[0][0].new_value, Some(json!(5)));
}

#[test]
fn collection_filter_keeps_insertions_and_matching_modifications() {
    let db = common::open();
    let realm = db.realm().unwrap();
    let (rex, _fido) = realm
        .write(|r| {
            Ok((
                r.create("dogs", json!({"name": "rex", "age": 1, "color": "black"}))?,
                r.create("dogs", json!({"name": "fido", "age": 2, "color": "brown"}))?,
            ))
        })
        .unwrap();

    let updates = Arc::new(Mutex::new(Vec::new()));
    let _token = realm
        .objects("dogs")
        .unwrap()
        .observe(&["age"], {
            let updates = Arc::clone(&updates);
            move |change| {
                if let CollectionChange::Update(_, changes) = change {
                    updates.lock().push(changes);
                }
            }
        })
        .unwrap();
    realm.refresh().unwrap();

    realm.write(|_| rex.set("color", "grey")).unwrap();
    assert!(updates.lock().is_empty());

    realm.write(|_| rex.set("age", 4)).unwrap();
    realm
        .write(|r| r.create("dogs", json!({"name": "pup", "color": "white"})))
        .unwrap();

    let updates = updates.lock();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].modifications().collect::<Vec<_>>(), vec![(0, 0)]);
    assert!(updates[0].insertions.is_empty());
    assert_eq!(updates[1].insertions, vec![2]);
}

#[test]
fn list_observer_filters_on_element_properties() {
    let db = common::open();
    let realm = db.realm().unwrap();
    let tim = realm
        .write(|r| {
            r.create("dogs", json!({"name": "rex", "age": 1}))?;
            r.create("owners", json!({"name": "tim", "dogs": ["rex"]}))
        })
        .unwrap();
    let dogs = tim.list("dogs").unwrap();
    assert_eq!(dogs.len().unwrap(), 1);

    let updates = Arc::new(Mutex::new(0usize));
    let _token = dogs
        .observe(&["color"], {
            let updates = Arc::clone(&updates);
            move |change| {
                if let CollectionChange::Update(..) = change {
                    *updates.lock() += 1;
                }
            }
        })
        .unwrap();
    realm.refresh().unwrap();

    let rex = dogs.get(0).unwrap().unwrap();
    realm.write(|_| rex.set("age", 2)).unwrap();
    assert_eq!(*updates.lock(), 0);

    realm.write(|_| rex.set("color", "red")).unwrap();
    assert_eq!(*updates.lock(), 1);
}

#[test]
fn nested_path_reports_linked_changes_on_its_first_property() {
    let db = common::open();
    let realm = db.realm().unwrap();
    let (rex, tim) = realm
        .write(|r| {
            Ok((
                r.create("dogs", json!({"name": "rex", "age": 1, "color": "black"}))?,
                r.create("owners", json!({"name": "tim", "dogs": ["rex"]}))?,
            ))
        })
        .unwrap();

    let changed = Arc::new(Mutex::new(Vec::new()));
    let _token = tim
        .observe(&["dogs.age"], {
            let changed = Arc::clone(&changed);
            move |change| {
                if let ObjectChange::Change(_, properties) = change {
                    let names: Vec<String> = properties.into_iter().map(|p| p.name).collect();
                    changed.lock().push(names);
                }
            }
        })
        .unwrap();
    realm.refresh().unwrap();

    realm.write(|_| rex.set("color", "white")).unwrap();
    assert!(changed.lock().is_empty());

    realm.write(|_| rex.set("age", 2)).unwrap();
    assert_eq!(*changed.lock(), vec![vec!["dogs".to_string()]]);

    realm
        .write(|r| r.create("dogs", json!({"name": "fido", "age": 4})))
        .unwrap();
    assert_eq!(changed.lock().len(), 1);
}

#[test]
fn queue_observer_follows_link_property() {
    let db = common::open();
    let main = db.realm().unwrap();
    let rex = main
        .write(|r| {
            let rex = r.create("dogs", json!({"name": "rex", "age": 1}))?;
            r.create("owners", json!({"name": "tim", "favorite": "rex"}))?;
            Ok(rex)
        })
        .unwrap();

    let queue = Queue::new("nested-key-paths").unwrap();
    let changes = Arc::new(Mutex::new(Vec::new()));
    let _token = queue
        .sync({
            let db = db.clone();
            let changes = Arc::clone(&changes);
            move || {
                let realm = db.realm().unwrap();
                let tim = realm.object("owners", "tim").unwrap().unwrap();
                tim.observe(&["favorite.age"], move |change| {
                    if let ObjectChange::Change(_, properties) = change {
                        changes.lock().push(properties);
                    }
                })
                .unwrap()
            }
        })
        .unwrap();
    queue.sync(|| ()).unwrap();

    main.write(|_| rex.set("color", "red")).unwrap();
    main.write(|_| rex.set("age", 7)).unwrap();

    assert!(common::wait_until(|| !changes.lock().is_empty()));
    let changes = changes.lock();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].len(), 1);
    assert_eq!(changes[0][0].name, "favorite");
    assert_eq!(changes[0][0].old_value, Some(json!("rex")));
    assert_eq!(changes[0][0].new_value, Some(json!("rex")));
}

#[test]
fn collection_nested_path_marks_linking_elements_modified() {
    let db = common::open();
    let realm = db.realm().unwrap();
    let rex = realm
        .write(|r| {
            let rex = r.create("dogs", json!({"name": "rex", "age": 1}))?;
            r.create("dogs", json!({"name": "fido", "age": 2}))?;
            r.create("owners", json!({"name": "tim", "favorite": "fido"}))?;
            r.create("owners", json!({"name": "ann", "favorite": "rex"}))?;
            Ok(rex)
        })
        .unwrap();

    let updates = Arc::new(Mutex::new(Vec::new()));
    let _token = realm
        .objects("owners")
        .unwrap()
        .observe(&["favorite.age"], {
            let updates = Arc::clone(&updates);
            move |change| {
                if let CollectionChange::Update(_, changes) = change {
                    updates.lock().push(changes.modifications().collect::<Vec<_>>());
                }
            }
        })
        .unwrap();
    realm.refresh().unwrap();

    realm.write(|_| rex.set("color", "grey")).unwrap();
    assert!(updates.lock().is_empty());

    realm.write(|_| rex.set("age", 3)).unwrap();
    assert_eq!(*updates.lock(), vec![vec![(1, 1)]]);
}

#[test]
fn unknown_paths_are_rejected() {
    let db = common::open();
    let realm = db.realm().unwrap();
    let tim = realm
        .write(|r| r.create("owners", json!({"name": "tim"})))
        .unwrap();

    let err = tim.observe(&["cats"], |_| {}).unwrap_err();
    assert_eq!(
        err,
        LiveError::UnknownKeyPath {
            table: "owners".into(),
            property: "cats".into(),
        }
    );

    let err = tim
        .list("dogs")
        .unwrap()
        .observe(&["owner.name"], |_| {})
        .unwrap_err();
    assert!(matches!(err, LiveError::UnknownKeyPath { table, .. } if table == "dogs"));

    let err = tim.observe(&["favorite.legs"], |_| {}).unwrap_err();
    assert_eq!(
        err,
        LiveError::UnknownKeyPath {
            table: "dogs".into(),
            property: "favorite.legs".into(),
        }
    );
    assert!(tim.observe(&["dogs.age", "favorite.color"], |_| {}).is_ok());
}
