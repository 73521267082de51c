//! Delivery of change notifications across threads and queues.

mod common;

use parking_lot::Mutex;
use ripple_live::{
    Collection, CollectionChange, LiveError, LiveObject, ObjectChange, PropertyChange, Queue,
};
use serde_json::json;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Initial,
    Change(Vec<PropertyChange>),
    Deleted,
    Error(LiveError),
}

fn describe(change: &ObjectChange<LiveObject>) -> Event {
    match change {
        ObjectChange::Initial(_) => Event::Initial,
        ObjectChange::Change(_, properties) => Event::Change(properties.clone()),
        ObjectChange::Deleted => Event::Deleted,
        ObjectChange::Error(e) => Event::Error(e.clone()),
    }
}

#[test]
fn queue_observer_sees_old_and_new_values() {
    let db = common::open();
    let main = db.realm().unwrap();
    let rex = main
        .write(|r| r.create("dogs", json!({"name": "rex", "age": 1})))
        .unwrap();

    let queue = Queue::new("observer").unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let _token = queue
        .sync({
            let db = db.clone();
            let events = Arc::clone(&events);
            move || {
                let realm = db.realm().unwrap();
                let rex = realm.object("dogs", "rex").unwrap().unwrap();
                rex.observe(&[], move |change| events.lock().push(describe(&change)))
                    .unwrap()
            }
        })
        .unwrap();

    assert!(common::wait_until(|| events.lock().len() == 1));
    assert_eq!(events.lock()[0], Event::Initial);

    main.write(|_| rex.set("age", 2)).unwrap();
    assert!(common::wait_until(|| events.lock().len() == 2));
    assert_eq!(
        events.lock()[1],
        Event::Change(vec![PropertyChange {
            name: "age".into(),
            old_value: Some(json!(1)),
            new_value: Some(json!(2)),
        }])
    );
}

#[test]
fn same_thread_writes_each_report_only_the_new_value() {
    let db = common::open();
    let realm = db.realm().unwrap();
    let counter = realm
        .write(|r| r.create("dogs", json!({"name": "counter", "age": 0})))
        .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let _token = counter
        .observe(&[], {
            let events = Arc::clone(&events);
            move |change| events.lock().push(describe(&change))
        })
        .unwrap();
    realm.refresh().unwrap();

    for age in 1..=10 {
        realm.write(|_| counter.set("age", age)).unwrap();
    }

    let events = events.lock();
    assert_eq!(events.len(), 11);
    assert_eq!(events[0], Event::Initial);
    for (i, event) in events[1..].iter().enumerate() {
        assert_eq!(
            *event,
            Event::Change(vec![PropertyChange {
                name: "age".into(),
                old_value: None,
                new_value: Some(json!(i + 1)),
            }])
        );
    }
}

#[test]
fn linking_objects_report_new_and_removed_links() {
    let db = common::open();
    let realm = db.realm().unwrap();
    let rex = realm
        .write(|r| r.create("dogs", json!({"name": "rex"})))
        .unwrap();

    let updates = Arc::new(Mutex::new(Vec::new()));
    let _token = rex
        .linking_objects("owners", "dogs")
        .unwrap()
        .observe(&[], {
            let updates = Arc::clone(&updates);
            move |change| {
                if let CollectionChange::Update(_, changes) = change {
                    updates.lock().push((
                        changes.insertions.clone(),
                        changes.deletions.clone(),
                        changes.modifications_new.clone(),
                    ));
                }
            }
        })
        .unwrap();
    realm.refresh().unwrap();

    let tim = realm
        .write(|r| r.create("owners", json!({"name": "tim", "dogs": ["rex"]})))
        .unwrap();
    let ann = realm
        .write(|r| r.create("owners", json!({"name": "ann", "dogs": ["rex"]})))
        .unwrap();
    realm.write(|_| ann.set("favorite", "rex")).unwrap();
    realm.write(|r| r.delete(&tim)).unwrap();

    assert_eq!(
        *updates.lock(),
        vec![
            (vec![0], vec![], vec![]),
            (vec![1], vec![], vec![]),
            (vec![], vec![], vec![1]),
            (vec![], vec![0], vec![]),
        ]
    );
}

#[test]
fn deletion_ends_the_stream() {
    let db = common::open();
    let main = db.realm().unwrap();
    let rex = main
        .write(|r| r.create("dogs", json!({"name": "rex"})))
        .unwrap();

    let queue = Queue::new("deletion").unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let token = queue
        .sync({
            let db = db.clone();
            let events = Arc::clone(&events);
            move || {
                let realm = db.realm().unwrap();
                let rex = realm.object("dogs", "rex").unwrap().unwrap();
                rex.observe(&[], move |change| events.lock().push(describe(&change)))
                    .unwrap()
            }
        })
        .unwrap();
    assert!(common::wait_until(|| events.lock().len() == 1));

    main.write(|r| r.delete(&rex)).unwrap();
    assert!(common::wait_until(|| events.lock().len() == 2));
    assert_eq!(events.lock()[1], Event::Deleted);

    // Recreating an object with the same key is a different object
    main.write(|r| r.create("dogs", json!({"name": "rex", "age": 9})))
        .unwrap();
    queue.sync(|| ()).unwrap();
    assert_eq!(events.lock().len(), 2);
    drop(token);
}

#[test]
fn coalesced_collection_updates_add_up() {
    let db = common::open();
    let main = db.realm().unwrap();

    let queue = Queue::new("coalesce").unwrap();
    let updates = Arc::new(Mutex::new(Vec::new()));
    let _token = queue
        .sync({
            let db = db.clone();
            let updates = Arc::clone(&updates);
            move || {
                let realm = db.realm().unwrap();
                let dogs = realm.objects("dogs").unwrap();
                dogs.observe(&[], move |change| {
                    if let CollectionChange::Update(dogs, changes) = change {
                        updates
                            .lock()
                            .push((dogs.len().unwrap(), changes.insertions.len()));
                    }
                })
                .unwrap()
            }
        })
        .unwrap();
    queue.sync(|| ()).unwrap();

    for name in ["a", "b", "c", "d", "e"] {
        main.write(|r| r.create("dogs", json!({ "name": name })))
            .unwrap();
    }

    assert!(common::wait_until(|| {
        updates.lock().last().map(|(len, _)| *len) == Some(5)
    }));
    let updates = updates.lock();
    let inserted: usize = updates.iter().map(|(_, n)| n).sum();
    assert_eq!(inserted, 5);
    assert!(updates.windows(2).all(|w| w[0].0 < w[1].0));
}

#[test]
fn observers_of_one_realm_run_in_registration_order() {
    let db = common::open();
    let main = db.realm().unwrap();

    let queue = Queue::new("ordering").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _tokens = queue
        .sync({
            let db = db.clone();
            let seen = Arc::clone(&seen);
            move || {
                let realm = db.realm().unwrap();
                let dogs = realm.objects("dogs").unwrap();
                ["first", "second"]
                    .into_iter()
                    .map(|label| {
                        let seen = Arc::clone(&seen);
                        dogs.observe(&[], move |change| {
                            let len = change.collection().map(|c| c.len().unwrap());
                            seen.lock().push((label, len));
                        })
                        .unwrap()
                    })
                    .collect::<Vec<_>>()
            }
        })
        .unwrap();

    main.write(|r| r.create("dogs", json!({"name": "rex"})))
        .unwrap();
    main.write(|r| r.create("dogs", json!({"name": "fido"})))
        .unwrap();

    assert!(common::wait_until(|| {
        seen.lock().last() == Some(&("second", Some(2)))
    }));
    let seen = seen.lock();
    assert_eq!(seen.len() % 2, 0);
    for pair in seen.chunks(2) {
        assert_eq!(pair[0].0, "first");
        assert_eq!(pair[1].0, "second");
        assert_eq!(pair[0].1, pair[1].1);
    }
}

#[test]
fn callback_may_write_to_its_own_realm() {
    let db = common::open();
    let main = db.realm().unwrap();
    main.write(|r| r.create("dogs", json!({"name": "rex"})))
        .unwrap();

    let queue = Queue::new("reentrant").unwrap();
    let updates = Arc::new(Mutex::new(Vec::new()));
    let _token = queue
        .sync({
            let db = db.clone();
            let updates = Arc::clone(&updates);
            move || {
                let realm = db.realm().unwrap();
                let dogs = realm.objects("dogs").unwrap();
                dogs.observe(&[], move |change| match change {
                    CollectionChange::Initial(dogs) => {
                        dogs.realm()
                            .write(|r| r.create("dogs", json!({"name": "pup"})))
                            .unwrap();
                    }
                    CollectionChange::Update(dogs, changes) => {
                        updates
                            .lock()
                            .push((dogs.len().unwrap(), changes.insertions.clone()));
                    }
                    _ => {}
                })
                .unwrap()
            }
        })
        .unwrap();

    assert!(common::wait_until(|| !updates.lock().is_empty()));
    assert_eq!(updates.lock()[0], (2, vec![1]));
}

#[test]
fn realm_observer_fires_on_every_new_version() {
    let db = common::open();
    let main = db.realm().unwrap();

    let queue = Queue::new("realm-observer").unwrap();
    let count = Arc::new(Mutex::new(0usize));
    let _token = queue
        .sync({
            let db = db.clone();
            let count = Arc::clone(&count);
            move || {
                db.realm()
                    .unwrap()
                    .observe(move |_, _| *count.lock() += 1)
                    .unwrap()
            }
        })
        .unwrap();

    main.write(|r| r.create("dogs", json!({"name": "rex"})))
        .unwrap();
    assert!(common::wait_until(|| *count.lock() >= 1));
}

#[test]
fn write_without_notifying_skips_only_named_tokens() {
    let db = common::open();
    let realm = db.realm().unwrap();
    let rex = realm
        .write(|r| r.create("dogs", json!({"name": "rex", "age": 1})))
        .unwrap();

    let quiet = Arc::new(Mutex::new(Vec::new()));
    let loud = Arc::new(Mutex::new(Vec::new()));
    let quiet_token = rex
        .observe(&[], {
            let quiet = Arc::clone(&quiet);
            move |change| quiet.lock().push(describe(&change))
        })
        .unwrap();
    let _loud_token = rex
        .observe(&[], {
            let loud = Arc::clone(&loud);
            move |change| loud.lock().push(describe(&change))
        })
        .unwrap();
    realm.refresh().unwrap();

    realm
        .write_without_notifying(&[&quiet_token], |_| rex.set("age", 2))
        .unwrap();
    assert_eq!(*quiet.lock(), vec![Event::Initial]);
    assert_eq!(loud.lock().len(), 2);

    // The skipped version is not delivered later either
    realm.write(|_| rex.set("color", "brown")).unwrap();
    let quiet = quiet.lock();
    assert_eq!(quiet.len(), 2);
    match &quiet[1] {
        Event::Change(properties) => {
            assert_eq!(properties.len(), 1);
            assert_eq!(properties[0].name, "color");
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[test]
fn invalidated_token_stops_delivery() {
    let db = common::open();
    let realm = db.realm().unwrap();
    let rex = realm
        .write(|r| r.create("dogs", json!({"name": "rex", "age": 1})))
        .unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let token = rex
        .observe(&[], {
            let events = Arc::clone(&events);
            move |change| events.lock().push(describe(&change))
        })
        .unwrap();
    realm.refresh().unwrap();

    token.invalidate();
    token.invalidate();
    assert!(token.is_invalidated());

    realm.write(|_| rex.set("age", 2)).unwrap();
    assert_eq!(*events.lock(), vec![Event::Initial]);
}

#[test]
fn store_failure_terminates_observers() {
    let db = common::open();
    let main = db.realm().unwrap();
    main.write(|r| r.create("dogs", json!({"name": "rex"})))
        .unwrap();

    let queue = Queue::new("failure").unwrap();
    let events = Arc::new(Mutex::new(Vec::new()));
    let _token = queue
        .sync({
            let db = db.clone();
            let events = Arc::clone(&events);
            move || {
                let realm = db.realm().unwrap();
                let rex = realm.object("dogs", "rex").unwrap().unwrap();
                rex.observe(&[], move |change| events.lock().push(describe(&change)))
                    .unwrap()
            }
        })
        .unwrap();
    assert!(common::wait_until(|| events.lock().len() == 1));

    db.store().fail("disk detached");
    assert!(common::wait_until(|| events.lock().len() == 2));
    assert_eq!(
        events.lock()[1],
        Event::Error(LiveError::StreamTerminal("disk detached".into()))
    );

    assert!(main.refresh().is_err());
}
