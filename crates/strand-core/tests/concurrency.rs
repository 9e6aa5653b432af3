//! Concurrent transactions sharing one store

use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

use strand_core::ChainCursor;
use strand_core::testing::setup_test_store;

const THREADS: usize = 8;

#[test]
fn test_concurrent_type_creation_converges() {
    let (store, _ctx) = setup_test_store().unwrap();
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut tx = store.begin();
                barrier.wait();
                let id = tx.create_relationship_type("KNOWS").unwrap();
                tx.prepare().unwrap();
                tx.commit().unwrap();
                id
            })
        })
        .collect();

    let ids: BTreeSet<u32> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(ids.len(), 1);
    let types = store.begin().load_relationship_types();
    assert_eq!(types.len(), 1);
    assert_eq!(types[0].name, "KNOWS");
}

#[test]
fn test_concurrent_relationships_to_one_hub() {
    let (store, _ctx) = setup_test_store().unwrap();

    let mut setup = store.begin();
    let knows = setup.create_relationship_type("KNOWS").unwrap();
    let hub = setup.allocate_node_id().unwrap();
    setup.create_node(hub).unwrap();
    setup.prepare().unwrap();
    setup.commit().unwrap();

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let store = store.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let mut tx = store.begin();
                let node = tx.allocate_node_id().unwrap();
                tx.create_node(node).unwrap();
                let rel = tx.allocate_relationship_id().unwrap();
                tx.create_relationship(rel, knows, node, hub).unwrap();
                barrier.wait();
                tx.prepare().unwrap();
                tx.commit().unwrap();
                rel
            })
        })
        .collect();
    let created: BTreeSet<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let tx = store.begin();
    let mut seen = BTreeSet::new();
    let mut cursor = ChainCursor::Start;
    loop {
        let page = tx.more_relationships(hub, cursor).unwrap();
        assert!(page.buckets.outgoing.is_empty());
        seen.extend(page.buckets.ids());
        if page.next.is_exhausted() {
            break;
        }
        cursor = page.next;
    }
    assert_eq!(seen, created);
    assert_eq!(store.stats().held_locks, 0);
}
