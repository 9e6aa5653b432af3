//! Store-wide id generators
//!
//! One generator per record kind. Ids are handed out monotonically and are
//! never returned to a free list, so an id stays unique for as long as any
//! transaction overlay could still resolve it.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Highest id of any record kind
///
/// Ids are 35 bits wide. Anything above is rejected at create time, and
/// generators stop here instead of reaching the chain sentinel `u64::MAX`.
pub const MAX_RECORD_ID: u64 = (1 << 35) - 1;

/// Reject ids past [`MAX_RECORD_ID`]
pub fn check_id(kind: RecordKind, id: u64) -> Result<()> {
    if id > MAX_RECORD_ID {
        Err(Error::id_out_of_range(format!(
            "{} id {} exceeds {}",
            kind, id, MAX_RECORD_ID
        )))
    } else {
        Ok(())
    }
}

/// Record kinds addressed by a u64 id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RecordKind {
    /// Node records (`nodes.store`)
    Node,
    /// Relationship records (`rels.store`)
    Relationship,
    /// Property records (`props.store`)
    Property,
    /// Overflow blocks for long property values (`dynamic.store`)
    Dynamic,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Node => "node",
            Self::Relationship => "relationship",
            Self::Property => "property",
            Self::Dynamic => "dynamic record",
        };
        f.write_str(name)
    }
}

/// Monotonic id source for one record kind
#[derive(Debug, Default)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Start handing out ids at `next`
    pub fn new(next: u64) -> Self {
        Self {
            next: AtomicU64::new(next),
        }
    }

    /// Allocate the next id; fails once [`MAX_RECORD_ID`] has been handed out
    pub fn next_id(&self) -> Result<u64> {
        self.next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |next| {
                (next <= MAX_RECORD_ID).then_some(next + 1)
            })
            .map_err(|next| Error::id_out_of_range(format!("id space exhausted at {}", next)))
    }

    /// Ensure `id` is never handed out by this generator
    ///
    /// Used when a caller supplies its own id (e.g. `create_node(id)`).
    /// Ids past [`MAX_RECORD_ID`] only exhaust the generator.
    pub fn mark_used(&self, id: u64) {
        let next = id.min(MAX_RECORD_ID).saturating_add(1);
        self.next.fetch_max(next, Ordering::SeqCst);
    }

    /// One past the highest id handed out or marked used
    pub fn high_id(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

/// Generators for every record kind
#[derive(Debug, Default)]
pub struct IdGenerators {
    nodes: IdGenerator,
    relationships: IdGenerator,
    properties: IdGenerator,
    dynamic: IdGenerator,
}

impl IdGenerators {
    /// Generators resuming after the given high ids
    pub fn resume(nodes: u64, relationships: u64, properties: u64, dynamic: u64) -> Self {
        Self {
            nodes: IdGenerator::new(nodes),
            relationships: IdGenerator::new(relationships),
            properties: IdGenerator::new(properties),
            dynamic: IdGenerator::new(dynamic),
        }
    }

    /// Generator for `kind`
    pub fn get(&self, kind: RecordKind) -> &IdGenerator {
        match kind {
            RecordKind::Node => &self.nodes,
            RecordKind::Relationship => &self.relationships,
            RecordKind::Property => &self.properties,
            RecordKind::Dynamic => &self.dynamic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_monotonic() {
        let generator = IdGenerator::new(5);
        assert_eq!(generator.next_id().unwrap(), 5);
        assert_eq!(generator.next_id().unwrap(), 6);
        assert_eq!(generator.high_id(), 7);
    }

    #[test]
    fn test_mark_used_skips_ahead() {
        let generator = IdGenerator::default();
        generator.mark_used(41);
        assert_eq!(generator.next_id().unwrap(), 42);

        // Marking a lower id never moves the generator backwards
        generator.mark_used(3);
        assert_eq!(generator.next_id().unwrap(), 43);
    }

    #[test]
    fn test_generator_stops_at_max_id() {
        let generator = IdGenerator::new(MAX_RECORD_ID);
        assert_eq!(generator.next_id().unwrap(), MAX_RECORD_ID);
        assert!(matches!(generator.next_id(), Err(Error::IdOutOfRange(_))));
        assert!(generator.next_id().is_err());
        assert_eq!(generator.high_id(), MAX_RECORD_ID + 1);
    }

    #[test]
    fn test_mark_used_never_reaches_sentinel() {
        let generator = IdGenerator::default();
        generator.mark_used(u64::MAX);
        assert_eq!(generator.high_id(), MAX_RECORD_ID + 1);
        assert!(generator.next_id().is_err());
    }

    #[test]
    fn test_check_id() {
        assert!(check_id(RecordKind::Node, 0).is_ok());
        assert!(check_id(RecordKind::Node, MAX_RECORD_ID).is_ok());
        assert!(check_id(RecordKind::Relationship, MAX_RECORD_ID + 1).is_err());
        assert!(check_id(RecordKind::Node, u64::MAX).unwrap_err().is_validation());
    }

    #[test]
    fn test_concurrent_allocation_is_unique() {
        let generators = Arc::new(IdGenerators::default());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let g = generators.clone();
                thread::spawn(move || {
                    (0..500)
                        .map(|_| g.get(RecordKind::Relationship).next_id().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "id {} handed out twice", id);
            }
        }
        assert_eq!(seen.len(), 4000);
        assert_eq!(generators.get(RecordKind::Node).high_id(), 0);
    }
}
