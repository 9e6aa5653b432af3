//! Fixed-size record layouts
//!
//! Every record is `Pod`, so a store file is a flat array addressed by
//! `id * RECORD_SIZE`. A zeroed slot decodes as a record that is not in use.
//! Chain pointers are plain ids; `NIL` terminates a chain.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};

/// Null chain pointer
pub const NIL: u64 = u64::MAX;

const IN_USE: u32 = 0x01;
const FIRST_IN_START_CHAIN: u32 = 0x02;
const FIRST_IN_END_CHAIN: u32 = 0x04;

/// Node record in nodes.store (24 bytes, fixed-size)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Head of the relationship chain
    pub first_rel: u64,
    /// Head of the property chain
    pub first_prop: u64,
    /// Flags (bit 0: in use)
    pub flags: u32,
    _padding: u32,
}

/// Size of a [`NodeRecord`] on disk
pub const NODE_RECORD_SIZE: usize = 24;

impl NodeRecord {
    /// A fresh, in-use node with empty chains
    pub fn new_in_use() -> Self {
        Self {
            first_rel: NIL,
            first_prop: NIL,
            flags: IN_USE,
            _padding: 0,
        }
    }

    /// Check if the slot holds a live node
    pub fn in_use(&self) -> bool {
        self.flags & IN_USE != 0
    }

    /// Clear the in-use bit, keeping the chain pointers
    pub fn set_deleted(&mut self) {
        self.flags &= !IN_USE;
    }
}

impl Default for NodeRecord {
    fn default() -> Self {
        Self {
            first_rel: NIL,
            first_prop: NIL,
            flags: 0,
            _padding: 0,
        }
    }
}

/// Which of a relationship's two chains a pointer belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainSide {
    /// The start node's chain (`first_*` pointers)
    Start,
    /// The end node's chain (`second_*` pointers)
    End,
}

/// Relationship record in rels.store (64 bytes, fixed-size)
///
/// A relationship sits in two doubly-linked chains at once: the start node's
/// (`first_prev`/`first_next`) and the end node's (`second_prev`/`second_next`).
/// For a loop both pairs are kept equal.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct RelationshipRecord {
    /// Start node id
    pub first_node: u64,
    /// End node id
    pub second_node: u64,
    /// Previous relationship in the start node's chain
    pub first_prev: u64,
    /// Next relationship in the start node's chain
    pub first_next: u64,
    /// Previous relationship in the end node's chain
    pub second_prev: u64,
    /// Next relationship in the end node's chain
    pub second_next: u64,
    /// Head of the property chain
    pub first_prop: u64,
    /// Relationship type id
    pub type_id: u32,
    /// Flags (bit 0: in use, bit 1: first in start chain, bit 2: first in end chain)
    pub flags: u32,
}

/// Size of a [`RelationshipRecord`] on disk
pub const REL_RECORD_SIZE: usize = 64;

impl Default for RelationshipRecord {
    fn default() -> Self {
        Self {
            first_node: NIL,
            second_node: NIL,
            first_prev: NIL,
            first_next: NIL,
            second_prev: NIL,
            second_next: NIL,
            first_prop: NIL,
            type_id: 0,
            flags: 0,
        }
    }
}

impl RelationshipRecord {
    /// A fresh, in-use relationship that is not yet linked anywhere
    pub fn new_in_use(type_id: u32, start: u64, end: u64) -> Self {
        Self {
            first_node: start,
            second_node: end,
            type_id,
            flags: IN_USE,
            ..Self::default()
        }
    }

    /// Check if the slot holds a live relationship
    pub fn in_use(&self) -> bool {
        self.flags & IN_USE != 0
    }

    /// Clear the in-use bit, keeping the chain pointers so parked cursors can move on
    pub fn set_deleted(&mut self) {
        self.flags &= !IN_USE;
    }

    /// Start and end are the same node
    pub fn is_loop(&self) -> bool {
        self.first_node == self.second_node
    }

    /// Sides of this record that belong to `node`'s chain
    pub fn sides_for(&self, node: u64) -> impl Iterator<Item = ChainSide> + use<> {
        let start = self.first_node == node;
        let end = self.second_node == node;
        [
            start.then_some(ChainSide::Start),
            end.then_some(ChainSide::End),
        ]
        .into_iter()
        .flatten()
    }

    /// Previous pointer for `side`
    pub fn prev(&self, side: ChainSide) -> u64 {
        match side {
            ChainSide::Start => self.first_prev,
            ChainSide::End => self.second_prev,
        }
    }

    /// Next pointer for `side`
    pub fn next(&self, side: ChainSide) -> u64 {
        match side {
            ChainSide::Start => self.first_next,
            ChainSide::End => self.second_next,
        }
    }

    /// Next pointer in `node`'s chain, or `NIL` if `node` is not an endpoint
    pub fn next_for(&self, node: u64) -> u64 {
        if self.first_node == node {
            self.first_next
        } else if self.second_node == node {
            self.second_next
        } else {
            NIL
        }
    }

    /// Set the previous pointer for `side`, maintaining the first-in-chain flag
    pub fn set_prev(&mut self, side: ChainSide, prev: u64) {
        let flag = match side {
            ChainSide::Start => {
                self.first_prev = prev;
                FIRST_IN_START_CHAIN
            }
            ChainSide::End => {
                self.second_prev = prev;
                FIRST_IN_END_CHAIN
            }
        };
        if prev == NIL {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    /// Set the next pointer for `side`
    pub fn set_next(&mut self, side: ChainSide, next: u64) {
        match side {
            ChainSide::Start => self.first_next = next,
            ChainSide::End => self.second_next = next,
        }
    }

    /// Record is the head of the start node's chain
    pub fn first_in_start_chain(&self) -> bool {
        self.flags & FIRST_IN_START_CHAIN != 0
    }

    /// Record is the head of the end node's chain
    pub fn first_in_end_chain(&self) -> bool {
        self.flags & FIRST_IN_END_CHAIN != 0
    }
}

/// Id-carrying view of a relationship, as handed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelationshipData {
    /// Relationship id
    pub id: u64,
    /// Relationship type id
    pub type_id: u32,
    /// Start node id
    pub start_node: u64,
    /// End node id
    pub end_node: u64,
}

impl RelationshipData {
    /// View of a stored record
    pub fn from_record(id: u64, record: &RelationshipRecord) -> Self {
        Self {
            id,
            type_id: record.type_id,
            start_node: record.first_node,
            end_node: record.second_node,
        }
    }
}

/// Property record in props.store (32 bytes, fixed-size)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct PropertyRecord {
    /// Previous property in the owner's chain
    pub prev: u64,
    /// Next property in the owner's chain
    pub next: u64,
    /// Inline value bits, or the first dynamic record id for overflow kinds
    pub payload: u64,
    /// Property key id
    pub key_id: u32,
    /// Encoded [`PropertyKind`](crate::storage::PropertyKind)
    pub kind: u8,
    /// Flags (bit 0: in use)
    pub flags: u8,
    /// Byte length of an inline short string
    pub inline_len: u8,
    _padding: u8,
}

/// Size of a [`PropertyRecord`] on disk
pub const PROP_RECORD_SIZE: usize = 32;

impl Default for PropertyRecord {
    fn default() -> Self {
        Self {
            prev: NIL,
            next: NIL,
            payload: 0,
            key_id: 0,
            kind: 0,
            flags: 0,
            inline_len: 0,
            _padding: 0,
        }
    }
}

impl PropertyRecord {
    /// A fresh, in-use, unlinked property record
    pub fn new_in_use(key_id: u32) -> Self {
        Self {
            key_id,
            flags: IN_USE as u8,
            ..Self::default()
        }
    }

    /// Check if the slot holds a live property
    pub fn in_use(&self) -> bool {
        self.flags & IN_USE as u8 != 0
    }

    /// Clear the in-use bit
    pub fn set_deleted(&mut self) {
        self.flags &= !(IN_USE as u8);
    }
}

/// Bytes of value data carried by one dynamic record
pub const DYNAMIC_PAYLOAD: usize = 32;

/// Overflow block in dynamic.store (48 bytes, fixed-size)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable, Serialize, Deserialize)]
pub struct DynamicRecord {
    /// Next block of the same value
    pub next: u64,
    /// Bytes of `data` in use
    pub len: u32,
    /// Flags (bit 0: in use)
    pub flags: u32,
    /// Value bytes
    pub data: [u8; DYNAMIC_PAYLOAD],
}

/// Size of a [`DynamicRecord`] on disk
pub const DYNAMIC_RECORD_SIZE: usize = 48;

impl Default for DynamicRecord {
    fn default() -> Self {
        Self {
            next: NIL,
            len: 0,
            flags: 0,
            data: [0; DYNAMIC_PAYLOAD],
        }
    }
}

impl DynamicRecord {
    /// An in-use block holding `chunk` (at most [`DYNAMIC_PAYLOAD`] bytes)
    pub fn with_chunk(chunk: &[u8], next: u64) -> Self {
        let mut record = Self {
            next,
            len: chunk.len() as u32,
            flags: IN_USE,
            ..Self::default()
        };
        record.data[..chunk.len()].copy_from_slice(chunk);
        record
    }

    /// Check if the slot holds a live block
    pub fn in_use(&self) -> bool {
        self.flags & IN_USE != 0
    }

    /// Clear the in-use bit
    pub fn set_deleted(&mut self) {
        self.flags &= !IN_USE;
    }

    /// Bytes carried by this block
    pub fn chunk(&self) -> &[u8] {
        &self.data[..(self.len as usize).min(DYNAMIC_PAYLOAD)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes() {
        assert_eq!(std::mem::size_of::<NodeRecord>(), NODE_RECORD_SIZE);
        assert_eq!(std::mem::size_of::<RelationshipRecord>(), REL_RECORD_SIZE);
        assert_eq!(std::mem::size_of::<PropertyRecord>(), PROP_RECORD_SIZE);
        assert_eq!(std::mem::size_of::<DynamicRecord>(), DYNAMIC_RECORD_SIZE);
    }

    #[test]
    fn test_zeroed_slot_is_not_in_use() {
        assert!(!NodeRecord::zeroed().in_use());
        assert!(!RelationshipRecord::zeroed().in_use());
        assert!(!PropertyRecord::zeroed().in_use());
        assert!(!DynamicRecord::zeroed().in_use());
    }

    #[test]
    fn test_delete_keeps_pointers() {
        let mut rel = RelationshipRecord::new_in_use(3, 1, 2);
        rel.set_next(ChainSide::Start, 10);
        rel.set_next(ChainSide::End, 11);
        rel.set_deleted();

        assert!(!rel.in_use());
        assert_eq!(rel.next_for(1), 10);
        assert_eq!(rel.next_for(2), 11);
        assert_eq!(rel.next_for(99), NIL);
    }

    #[test]
    fn test_first_in_chain_flags_follow_prev() {
        let mut rel = RelationshipRecord::new_in_use(0, 1, 2);
        rel.set_prev(ChainSide::Start, NIL);
        rel.set_prev(ChainSide::End, 7);
        assert!(rel.first_in_start_chain());
        assert!(!rel.first_in_end_chain());

        rel.set_prev(ChainSide::Start, 4);
        assert!(!rel.first_in_start_chain());
        assert_eq!(rel.prev(ChainSide::Start), 4);
    }

    #[test]
    fn test_loop_sides() {
        let rel = RelationshipRecord::new_in_use(0, 5, 5);
        assert!(rel.is_loop());
        assert_eq!(rel.sides_for(5).count(), 2);

        let rel = RelationshipRecord::new_in_use(0, 5, 6);
        assert_eq!(rel.sides_for(6).collect::<Vec<_>>(), vec![ChainSide::End]);
        assert_eq!(rel.sides_for(7).count(), 0);
    }

    #[test]
    fn test_dynamic_chunk() {
        let block = DynamicRecord::with_chunk(b"hello", NIL);
        assert!(block.in_use());
        assert_eq!(block.chunk(), b"hello");
    }
}
