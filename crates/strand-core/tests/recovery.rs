//! WAL recovery and replay

use std::path::PathBuf;

use strand_core::storage::{NodeRecord, RelationshipRecord};
use strand_core::testing::{TestContext, commit};
use strand_core::wal::{DictionaryEntry, RecordImage, Wal, WalEntry};
use strand_core::{GraphStore, Vote};

fn wal_path(ctx: &TestContext) -> PathBuf {
    ctx.config().data_dir.join("wal.log")
}

fn log(wal: &mut Wal, tx_id: u64, images: &[RecordImage], decision: Option<WalEntry>) {
    wal.append(&WalEntry::Begin { tx_id }).unwrap();
    for image in images {
        wal.append(&WalEntry::Record { tx_id, image: *image }).unwrap();
    }
    wal.append(&WalEntry::Prepare { tx_id }).unwrap();
    if let Some(decision) = decision {
        wal.append(&decision).unwrap();
    }
}

fn node_image(id: u64) -> RecordImage {
    RecordImage::Node {
        id,
        record: NodeRecord::new_in_use(),
    }
}

#[test]
fn test_recovery_applies_only_committed_transactions() {
    let ctx = TestContext::new();
    std::fs::create_dir_all(ctx.config().data_dir).unwrap();
    {
        let mut wal = Wal::open(wal_path(&ctx)).unwrap();
        wal.append(&WalEntry::Begin { tx_id: 1 }).unwrap();
        wal.append(&WalEntry::Dictionary {
            tx_id: 1,
            entry: DictionaryEntry::RelationshipType {
                id: 0,
                name: "KNOWS".into(),
            },
        })
        .unwrap();
        wal.append(&WalEntry::Record {
            tx_id: 1,
            image: node_image(0),
        })
        .unwrap();
        wal.append(&WalEntry::Prepare { tx_id: 1 }).unwrap();
        wal.append(&WalEntry::Commit { tx_id: 1 }).unwrap();

        // Prepared, never decided
        log(&mut wal, 2, &[node_image(1)], None);
        // Committed, then the apply failed and it was aborted
        log(&mut wal, 3, &[node_image(2)], Some(WalEntry::Commit { tx_id: 3 }));
        wal.append(&WalEntry::Abort { tx_id: 3 }).unwrap();
        // Explicitly aborted
        log(&mut wal, 4, &[node_image(3)], Some(WalEntry::Abort { tx_id: 4 }));
        wal.sync().unwrap();
    }

    let store = GraphStore::open(ctx.config()).unwrap();
    let tx = store.begin();
    assert!(tx.id() > 4);
    assert!(tx.node_load_light(0));
    for absent in 1..4 {
        assert!(!tx.node_load_light(absent), "node {}", absent);
    }
    assert_eq!(tx.relationship_type_name(0).as_deref(), Some("KNOWS"));

    // Recovery ends with a checkpoint
    assert!(store.recovery_plan().unwrap().committed.is_empty());
}

#[test]
fn test_replay_twice_equals_once() {
    let ctx = TestContext::new();
    let store = GraphStore::open(ctx.config()).unwrap();

    let mut tx = store.begin();
    let knows = tx.create_relationship_type("KNOWS").unwrap();
    let key = tx.create_property_key("name").unwrap();
    let nodes: Vec<u64> = (0..3).map(|_| tx.allocate_node_id().unwrap()).collect();
    for &node in &nodes {
        tx.create_node(node).unwrap();
        tx.node_add_property(node, key, "a fairly long name value for overflow").unwrap();
    }
    let mut rels = Vec::new();
    for pair in nodes.windows(2) {
        let rel = tx.allocate_relationship_id().unwrap();
        tx.create_relationship(rel, knows, pair[0], pair[1]).unwrap();
        rels.push(rel);
    }
    assert_eq!(commit(&mut tx).unwrap(), Vote::Commit);

    let mut tx = store.begin();
    tx.delete_relationship(rels[0]).unwrap();
    assert_eq!(commit(&mut tx).unwrap(), Vote::Commit);

    let plan = store.recovery_plan().unwrap();
    assert_eq!(plan.committed.len(), 2);

    let snapshot = |store: &GraphStore| {
        let records = store.store();
        let nodes: Vec<NodeRecord> = (0..4).map(|id| records.try_read(id)).collect();
        let rels: Vec<RelationshipRecord> = (0..3).map(|id| records.try_read(id)).collect();
        (nodes, rels)
    };

    let before = snapshot(&store);
    assert_eq!(store.replay(&plan).unwrap(), 2);
    let once = snapshot(&store);
    store.replay(&plan).unwrap();
    let twice = snapshot(&store);
    assert_eq!(before, once);
    assert_eq!(once, twice);
}

#[test]
fn test_committed_state_survives_restart() {
    let ctx = TestContext::new();
    let (node, prop) = {
        let store = GraphStore::open(ctx.config()).unwrap();
        let mut tx = store.begin();
        let key = tx.create_property_key("score").unwrap();
        let node = tx.allocate_node_id().unwrap();
        tx.create_node(node).unwrap();
        let prop = tx.node_add_property(node, key, 7i64).unwrap();
        assert_eq!(commit(&mut tx).unwrap(), Vote::Commit);
        (node, prop.id)
    };

    let store = GraphStore::open(ctx.config()).unwrap();
    let mut tx = store.begin();
    assert_eq!(
        tx.load_property_value(prop).unwrap(),
        strand_core::PropertyValue::Long(7)
    );
    // Ids handed out after restart do not collide with committed records
    let next = tx.allocate_node_id().unwrap();
    assert!(next > node);
    tx.create_node(next).unwrap();
    assert_eq!(commit(&mut tx).unwrap(), Vote::Commit);
}

#[test]
fn test_torn_tail_is_discarded() {
    let ctx = TestContext::new();
    std::fs::create_dir_all(ctx.config().data_dir).unwrap();
    {
        let mut wal = Wal::open(wal_path(&ctx)).unwrap();
        log(&mut wal, 1, &[node_image(0)], Some(WalEntry::Commit { tx_id: 1 }));
        wal.sync().unwrap();
    }
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(wal_path(&ctx))
            .unwrap();
        file.write_all(&[0x40, 0, 0, 0, 1, 2, 3]).unwrap();
    }

    let store = GraphStore::open(ctx.config()).unwrap();
    assert!(store.begin().node_load_light(0));
}
