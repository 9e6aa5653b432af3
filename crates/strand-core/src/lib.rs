//! Strand Core - transactional record store for an embedded property graph
//!
//! This crate provides the per-transaction storage layer of a graph database:
//! - Fixed-size record stores for nodes, relationships, properties and
//!   overflow blocks, memory-mapped and addressed by id
//! - Doubly linked relationship chains per node, walked in bounded pages
//! - Property key and relationship type dictionaries in LMDB
//! - A transaction overlay giving read-your-writes isolation
//! - Two-phase commit with chain locks and a write-ahead log
//! - Delta events for downstream indexes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │      TwoPhaseCoordinator / caller            │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │          StoreTransaction                    │
//! │   (Overlay, Chain Locks, Prepare/Commit)    │
//! └──────┬───────────────┬──────────────┬───────┘
//!        │               │              │
//! ┌──────┴──────┐ ┌──────┴──────┐ ┌─────┴───────┐
//! │ RecordStore │ │  Registry   │ │     WAL     │
//! │ ChainPager  │ │   (LMDB)    │ │ (recovery)  │
//! └─────────────┘ └─────────────┘ └─────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use strand_core::{GraphStore, StoreConfig};
//!
//! let store = GraphStore::open(StoreConfig::with_data_dir("./data"))?;
//! let mut tx = store.begin();
//! let knows = tx.create_relationship_type("KNOWS")?;
//! let name = tx.create_property_key("name")?;
//!
//! let (a, b) = (tx.allocate_node_id()?, tx.allocate_node_id()?);
//! tx.create_node(a)?;
//! tx.create_node(b)?;
//! tx.node_add_property(b, name, "bob")?;
//! let rel = tx.allocate_relationship_id()?;
//! tx.create_relationship(rel, knows, a, b)?;
//!
//! tx.prepare()?;
//! tx.commit()?;
//! # Ok::<(), strand_core::Error>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod config;
pub mod database;
pub mod error;
pub mod events;
pub mod ids;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transaction;
pub mod wal;

pub use catalog::{KeyId, PropertyKeyData, Registry, RelationshipTypeData, TypeId};
pub use config::StoreConfig;
pub use database::{GraphStore, StoreStats};
pub use error::{Error, Result};
pub use events::{DeltaEvent, DeltaListener, EntityRef, RecordingListener};
pub use storage::{
    ChainCursor, ChainPage, DirectionBuckets, PropertyArray, PropertyValue, RelationshipData,
};
pub use transaction::{
    Outcome, PooledConnection, PropertyData, PropertyMap, ResourceManager, StoreTransaction,
    TwoPhaseCoordinator, TxState, Vote,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_types() {
        let err = Error::not_found("node 7");
        assert!(err.to_string().contains("node 7"));
        assert!(Error::duplicate_id("node 1").is_validation());
        assert!(Error::id_out_of_range("node 18446744073709551615").is_validation());
    }
}
