//! Relationship chain paging through a transaction

use std::collections::BTreeSet;

use strand_core::testing::{TestContext, setup_test_store_with};
use strand_core::{ChainCursor, GraphStore};

fn open(batch: usize) -> (GraphStore, TestContext) {
    setup_test_store_with(|config| config.chain_batch_size = batch).unwrap()
}

#[test]
fn test_250_relationships_in_three_pages() {
    let (store, _ctx) = open(100);

    let mut tx = store.begin();
    let knows = tx.create_relationship_type("KNOWS").unwrap();
    let a = tx.allocate_node_id().unwrap();
    let b = tx.allocate_node_id().unwrap();
    tx.create_node(a).unwrap();
    tx.create_node(b).unwrap();
    let mut expected = BTreeSet::new();
    for _ in 0..250 {
        let rel = tx.allocate_relationship_id().unwrap();
        tx.create_relationship(rel, knows, a, b).unwrap();
        expected.insert(rel);
    }
    tx.prepare().unwrap();
    tx.commit().unwrap();

    let tx = store.begin();
    let mut cursor = tx.relationship_chain_position(a).unwrap();
    let mut seen = BTreeSet::new();
    let mut calls = 0;
    while !cursor.is_exhausted() {
        let page = tx.more_relationships(a, cursor).unwrap();
        calls += 1;
        assert!(page.buckets.len() <= 100);
        assert!(page.buckets.incoming.is_empty());
        for id in page.buckets.ids() {
            assert!(seen.insert(id), "relationship {} returned twice", id);
        }
        cursor = page.next;
    }
    assert_eq!(calls, 3);
    assert_eq!(seen, expected);
}

#[test]
fn test_cursor_survives_concurrent_delete() {
    let (store, _ctx) = open(2);

    let mut tx = store.begin();
    let knows = tx.create_relationship_type("KNOWS").unwrap();
    let a = tx.allocate_node_id().unwrap();
    let b = tx.allocate_node_id().unwrap();
    tx.create_node(a).unwrap();
    tx.create_node(b).unwrap();
    let rels: Vec<u64> = (0..6)
        .map(|_| {
            let rel = tx.allocate_relationship_id().unwrap();
            tx.create_relationship(rel, knows, a, b).unwrap();
            rel
        })
        .collect();
    tx.prepare().unwrap();
    tx.commit().unwrap();

    let reader = store.begin();
    let first = reader
        .more_relationships(a, reader.relationship_chain_position(a).unwrap())
        .unwrap();
    let ChainCursor::At(parked) = first.next else {
        panic!("expected more pages");
    };

    let mut writer = store.begin();
    writer.delete_relationship(parked).unwrap();
    writer.prepare().unwrap();
    writer.commit().unwrap();

    let mut seen: BTreeSet<u64> = first.buckets.ids().collect();
    let mut cursor = first.next;
    while !cursor.is_exhausted() {
        let page = reader.more_relationships(a, cursor).unwrap();
        seen.extend(page.buckets.ids());
        cursor = page.next;
    }
    let expected: BTreeSet<u64> = rels.into_iter().filter(|r| *r != parked).collect();
    assert_eq!(seen, expected);
}

#[test]
fn test_exhausted_cursor_returns_empty_page() {
    let (store, _ctx) = open(10);
    let mut tx = store.begin();
    let a = tx.allocate_node_id().unwrap();
    tx.create_node(a).unwrap();
    let page = tx.more_relationships(a, ChainCursor::Exhausted).unwrap();
    assert!(page.buckets.is_empty());
    assert!(page.next.is_exhausted());
}

#[test]
fn test_created_relationships_page_under_batch_size() {
    let (store, _ctx) = open(2);

    let mut tx = store.begin();
    let knows = tx.create_relationship_type("KNOWS").unwrap();
    let a = tx.allocate_node_id().unwrap();
    let b = tx.allocate_node_id().unwrap();
    tx.create_node(a).unwrap();
    tx.create_node(b).unwrap();
    let stored = tx.allocate_relationship_id().unwrap();
    tx.create_relationship(stored, knows, a, b).unwrap();
    tx.prepare().unwrap();
    tx.commit().unwrap();

    let mut tx = store.begin();
    let mut expected = BTreeSet::from([stored]);
    for _ in 0..5 {
        let rel = tx.allocate_relationship_id().unwrap();
        tx.create_relationship(rel, knows, b, a).unwrap();
        expected.insert(rel);
    }

    let mut seen = BTreeSet::new();
    let mut sizes = Vec::new();
    let mut cursor = tx.relationship_chain_position(a).unwrap();
    loop {
        let page = tx.more_relationships(a, cursor).unwrap();
        sizes.push(page.buckets.len());
        for id in page.buckets.ids() {
            assert!(seen.insert(id), "relationship {} paged twice", id);
        }
        if page.next.is_exhausted() {
            break;
        }
        assert!(matches!(page.next, ChainCursor::Created(_)));
        cursor = page.next;
    }

    assert_eq!(seen, expected);
    assert_eq!(sizes, vec![2, 2, 2]);
}

#[test]
fn test_created_node_relationships_page_under_batch_size() {
    let (store, _ctx) = open(3);
    let mut tx = store.begin();
    let knows = tx.create_relationship_type("KNOWS").unwrap();
    let hub = tx.allocate_node_id().unwrap();
    tx.create_node(hub).unwrap();
    for _ in 0..7 {
        let rel = tx.allocate_relationship_id().unwrap();
        tx.create_relationship(rel, knows, hub, hub).unwrap();
    }

    let first = tx.more_relationships(hub, ChainCursor::Start).unwrap();
    assert_eq!(first.buckets.loops.len(), 3);
    let second = tx.more_relationships(hub, first.next).unwrap();
    assert_eq!(second.buckets.loops.len(), 3);
    let third = tx.more_relationships(hub, second.next).unwrap();
    assert_eq!(third.buckets.loops.len(), 1);
    assert!(third.next.is_exhausted());
}
