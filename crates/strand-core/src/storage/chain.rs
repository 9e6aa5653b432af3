//! Relationship chain pager
//!
//! Walks a node's relationship chain in bounded batches. Each page carries
//! the relationships read, split by direction relative to the node, plus a
//! cursor the caller hands back to continue.
//!
//! Deleted relationships keep their chain pointers, so a cursor parked on a
//! record that was deleted after the page was produced still leads to the
//! rest of the chain; dead records are skipped without being emitted.
//! New relationships are linked at the head of a chain, so a traversal that
//! has already passed the head never sees them.

use super::RecordStore;
use super::record::{NIL, NodeRecord, RelationshipData, RelationshipRecord};
use crate::Result;

/// Position within a node's relationship chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainCursor {
    /// Before the head of the chain
    Start,
    /// Next record to read
    At(u64),
    /// Stored chain done; continue with the transaction's own relationships
    /// from this id
    Created(u64),
    /// Nothing left
    Exhausted,
}

impl ChainCursor {
    /// No more pages follow
    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted)
    }

    fn from_pointer(pointer: u64) -> Self {
        if pointer == NIL {
            Self::Exhausted
        } else {
            Self::At(pointer)
        }
    }
}

/// Relationships partitioned by direction relative to one node
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectionBuckets {
    /// Relationships starting at the node
    pub outgoing: Vec<RelationshipData>,
    /// Relationships ending at the node
    pub incoming: Vec<RelationshipData>,
    /// Relationships starting and ending at the node
    pub loops: Vec<RelationshipData>,
}

impl DirectionBuckets {
    /// Place `rel` in the bucket matching its direction relative to `node`
    pub fn push(&mut self, node: u64, rel: RelationshipData) {
        if rel.start_node == rel.end_node {
            self.loops.push(rel);
        } else if rel.start_node == node {
            self.outgoing.push(rel);
        } else {
            self.incoming.push(rel);
        }
    }

    /// Drop relationships rejected by `keep`
    pub fn retain<F: FnMut(&RelationshipData) -> bool>(&mut self, mut keep: F) {
        self.outgoing.retain(&mut keep);
        self.incoming.retain(&mut keep);
        self.loops.retain(&mut keep);
    }

    /// Total relationships in all buckets
    pub fn len(&self) -> usize {
        self.outgoing.len() + self.incoming.len() + self.loops.len()
    }

    /// All buckets are empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every relationship id in the page, in bucket order
    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.outgoing
            .iter()
            .chain(&self.incoming)
            .chain(&self.loops)
            .map(|r| r.id)
    }
}

/// One batch of a chain walk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainPage {
    /// Relationships read in this batch
    pub buckets: DirectionBuckets,
    /// Where the next call continues
    pub next: ChainCursor,
}

impl ChainPage {
    /// Empty final page
    pub fn exhausted() -> Self {
        Self {
            buckets: DirectionBuckets::default(),
            next: ChainCursor::Exhausted,
        }
    }
}

/// Bounded-batch chain walker
#[derive(Debug, Clone, Copy)]
pub struct ChainPager {
    batch_size: usize,
}

impl ChainPager {
    /// Pager reading at most `batch_size` records per page
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Records read per page
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Read the next page of `node`'s chain
    ///
    /// `Start` requires the node to be live; a cursor already inside the chain
    /// keeps working even if the node or the record it points at was deleted.
    pub fn page(&self, store: &RecordStore, node: u64, cursor: ChainCursor) -> Result<ChainPage> {
        let mut pointer = match cursor {
            ChainCursor::Exhausted | ChainCursor::Created(_) => {
                return Ok(ChainPage::exhausted());
            }
            ChainCursor::Start => store.read::<NodeRecord>(node)?.first_rel,
            ChainCursor::At(id) => id,
        };

        let mut buckets = DirectionBuckets::default();
        let mut read = 0;
        while pointer != NIL && read < self.batch_size {
            let record = store.try_read::<RelationshipRecord>(pointer);
            if record.in_use() {
                buckets.push(node, RelationshipData::from_record(pointer, &record));
            }
            pointer = record.next_for(node);
            read += 1;
        }

        tracing::debug!(
            "chain page for node {}: {} relationships from {} records",
            node,
            buckets.len(),
            read
        );

        Ok(ChainPage {
            buckets,
            next: ChainCursor::from_pointer(pointer),
        })
    }
}
