//! Handing objects and collections between threads and queues.

mod common;

use ripple_live::{
    Collection, Config, Freeze, LiveCollection, LiveError, LiveObject, Queue, ThreadSafe,
    ThreadSafeReference,
};
use serde_json::json;
use std::sync::{mpsc, Arc};
use std::thread;

#[test]
fn resolve_refreshes_a_stale_realm() {
    let db = common::open();
    let (ready_tx, ready_rx) = mpsc::channel();
    let (ref_tx, ref_rx) = mpsc::channel::<ThreadSafeReference<LiveObject>>();

    let worker = thread::spawn({
        let db = db.clone();
        move || {
            let realm = db.realm().unwrap();
            let pinned = realm.version();
            ready_tx.send(()).unwrap();

            let reference = ref_rx.recv().unwrap();
            assert!(pinned < reference.version());
            let rex = reference.resolve(&realm).unwrap().unwrap();
            assert!(realm.version() >= reference.version());
            rex.get("age").unwrap()
        }
    });

    ready_rx.recv().unwrap();
    let realm = db.realm().unwrap();
    let rex = realm
        .write(|r| r.create("dogs", json!({"name": "rex", "age": 4})))
        .unwrap();
    ref_tx.send(ThreadSafeReference::new(&rex).unwrap()).unwrap();

    assert_eq!(worker.join().unwrap(), json!(4));
}

#[test]
fn collection_reference_resolves_on_queue() {
    let db = common::open();
    let realm = db.realm().unwrap();
    let tim = realm
        .write(|r| {
            r.create("dogs", json!({"name": "rex"}))?;
            r.create("dogs", json!({"name": "fido"}))?;
            r.create("owners", json!({"name": "tim", "dogs": ["fido", "rex"]}))
        })
        .unwrap();
    let reference = ThreadSafeReference::new(&tim.list("dogs").unwrap()).unwrap();

    let queue = Queue::new("handover").unwrap();
    let keys = queue
        .sync({
            let db = db.clone();
            move || {
                let realm = db.realm().unwrap();
                let dogs: LiveCollection = reference.resolve(&realm).unwrap().unwrap();
                dogs.ids()
                    .unwrap()
                    .into_iter()
                    .map(|id| id.key)
                    .collect::<Vec<_>>()
            }
        })
        .unwrap();
    assert_eq!(keys, vec!["fido", "rex"]);
}

#[test]
fn linking_objects_reference_sees_later_links() {
    let db = common::open();
    let realm = db.realm().unwrap();
    let rex = realm
        .write(|r| {
            let rex = r.create("dogs", json!({"name": "rex"}))?;
            r.create("owners", json!({"name": "tim", "favorite": "rex"}))?;
            Ok(rex)
        })
        .unwrap();
    let owners = rex.linking_objects("owners", "favorite").unwrap();
    let reference = ThreadSafeReference::new(&owners).unwrap();

    realm
        .write(|r| r.create("owners", json!({"name": "ann", "dogs": ["rex"], "favorite": "rex"})))
        .unwrap();

    let queue = Queue::new("backlinks").unwrap();
    let keys = queue
        .sync({
            let db = db.clone();
            move || {
                let realm = db.realm().unwrap();
                let owners: LiveCollection = reference.resolve(&realm).unwrap().unwrap();
                owners
                    .ids()
                    .unwrap()
                    .into_iter()
                    .map(|id| id.key)
                    .collect::<Vec<_>>()
            }
        })
        .unwrap();
    assert_eq!(keys, vec!["tim", "ann"]);

    let reference = ThreadSafeReference::new(&owners).unwrap();
    realm.write(|r| r.delete(&rex)).unwrap();
    let resolved = queue
        .sync(move || {
            let realm = db.realm().unwrap();
            reference.resolve(&realm).map(|c| c.is_none())
        })
        .unwrap();
    assert_eq!(resolved, Ok(true));
}

#[test]
fn list_reference_with_deleted_owner_resolves_to_none() {
    let db = common::open();
    let realm = db.realm().unwrap();
    let tim = realm
        .write(|r| r.create("owners", json!({"name": "tim"})))
        .unwrap();
    let reference = ThreadSafeReference::new(&tim.list("dogs").unwrap()).unwrap();
    realm.write(|r| r.delete(&tim)).unwrap();

    let queue = Queue::new("deleted-owner").unwrap();
    let resolved = queue
        .sync(move || {
            let realm = db.realm().unwrap();
            reference.resolve(&realm).map(|c| c.is_none())
        })
        .unwrap();
    assert_eq!(resolved, Ok(true));
}

#[test]
fn deleted_object_cannot_be_captured() {
    let db = common::open();
    let realm = db.realm().unwrap();
    let rex = realm
        .write(|r| r.create("dogs", json!({"name": "rex"})))
        .unwrap();
    realm.write(|r| r.delete(&rex)).unwrap();

    assert!(matches!(
        ThreadSafeReference::new(&rex),
        Err(LiveError::InvalidatedReference(_))
    ));
}

#[test]
fn thread_safe_slot_follows_updates_across_queues() {
    let db = common::open();
    let realm = db.realm().unwrap();
    let rex = realm
        .write(|r| r.create("dogs", json!({"name": "rex", "age": 1})))
        .unwrap();
    let slot = Arc::new(ThreadSafe::new(&rex).unwrap());

    let queue = Queue::new("slot").unwrap();
    let read_age = {
        let slot = Arc::clone(&slot);
        move || slot.get().unwrap().map(|dog| dog.get("age").unwrap())
    };
    assert_eq!(queue.sync(read_age.clone()).unwrap(), Some(json!(1)));

    realm.write(|_| rex.set("age", 2)).unwrap();
    // The queue realm may already have advanced through a notifier pass
    queue
        .sync({
            let db = db.clone();
            move || db.realm().unwrap().refresh().unwrap()
        })
        .unwrap();
    assert_eq!(queue.sync(read_age.clone()).unwrap(), Some(json!(2)));

    realm.write(|r| r.delete(&rex)).unwrap();
    queue
        .sync({
            let db = db.clone();
            move || db.realm().unwrap().refresh().unwrap()
        })
        .unwrap();
    assert_eq!(queue.sync(read_age).unwrap(), None);
}

#[test]
fn independent_references_resolve_independently() {
    let db = common::open();
    let realm = db.realm().unwrap();
    let rex = realm
        .write(|r| r.create("dogs", json!({"name": "rex"})))
        .unwrap();
    let first = ThreadSafeReference::new(&rex).unwrap();
    let second = ThreadSafeReference::new(&rex).unwrap();

    let outcome = thread::spawn(move || {
        let realm = db.realm().unwrap();
        let a = first.resolve(&realm).unwrap().is_some();
        let b = second.resolve(&realm).unwrap().is_some();
        let again = first.resolve(&realm);
        (a, b, again.is_err())
    })
    .join()
    .unwrap();
    assert_eq!(outcome, (true, true, true));
}

#[test]
fn handles_only_resolve_in_their_own_database() {
    let db_a = common::open();
    let db_b = common::open();
    let realm_a = db_a.realm().unwrap();
    let realm_b = db_b.realm().unwrap();
    let rex = realm_a
        .write(|r| r.create("dogs", json!({"name": "rex", "age": 1})))
        .unwrap();
    let other_rex = realm_b
        .write(|r| r.create("dogs", json!({"name": "rex", "age": 99})))
        .unwrap();

    let reference = ThreadSafeReference::new(&rex).unwrap();
    assert!(matches!(
        reference.resolve(&realm_b),
        Err(LiveError::DatabaseMismatch { source_db, target_db })
            if source_db == db_a.id() && target_db == db_b.id()
    ));
    // The mismatch does not consume the reference
    let resolved = reference.resolve(&realm_a).unwrap().unwrap();
    assert_eq!(resolved.get("age").unwrap(), json!(1));

    let frozen = rex.freeze().unwrap();
    assert!(matches!(
        frozen.thaw(&realm_b),
        Err(LiveError::DatabaseMismatch { .. })
    ));
    let dogs = realm_a.objects("dogs").unwrap().freeze().unwrap();
    assert!(matches!(
        dogs.thaw(&realm_b),
        Err(LiveError::DatabaseMismatch { .. })
    ));
    assert_eq!(dogs.thaw(&realm_a).unwrap().unwrap().len().unwrap(), 1);

    let slot = ThreadSafe::new(&rex).unwrap();
    assert!(matches!(
        slot.set(Some(&other_rex)),
        Err(LiveError::DatabaseMismatch { .. })
    ));
    assert_eq!(slot.get().unwrap(), Some(rex));
}

#[test]
fn slot_read_on_finished_thread_releases_its_version() {
    let db = common::open_with(Config {
        max_active_versions: Some(2),
        ..Config::default()
    });
    let realm = db.realm().unwrap();
    let rex = realm
        .write(|r| r.create("dogs", json!({"name": "rex", "age": 0})))
        .unwrap();
    let slot = Arc::new(ThreadSafe::new(&rex).unwrap());

    let age = thread::spawn({
        let slot = Arc::clone(&slot);
        move || slot.get().unwrap().map(|dog| dog.get("age").unwrap())
    })
    .join()
    .unwrap();
    assert_eq!(age, Some(json!(0)));

    for age in 1..=5 {
        realm.write(|_| rex.set("age", age)).unwrap();
    }
    assert_eq!(slot.get().unwrap().unwrap().get("age").unwrap(), json!(5));
}
