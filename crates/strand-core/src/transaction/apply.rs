//! Record image building
//!
//! Turns an overlay into the full after-image of every record it rewrites.
//! Records are loaded from the store on first touch, which also captures the
//! before-image used to undo a commit whose apply step failed. All chain
//! surgery (relationship chains and property chains) happens here, on the
//! working copies, so nothing reaches the store until commit.

use crate::events::EntityRef;
use crate::ids::RecordKind;
use crate::storage::{
    self, DynamicRecord, NIL, NodeRecord, PropertyRecord, PropertyValue, RecordStore,
    RelationshipRecord, property,
};
use crate::wal::RecordImage;
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Working copies of every record touched by one transaction
pub struct RecordChanges<'a> {
    store: &'a RecordStore,
    nodes: BTreeMap<u64, NodeRecord>,
    rels: BTreeMap<u64, RelationshipRecord>,
    props: BTreeMap<u64, PropertyRecord>,
    dynamic: BTreeMap<u64, DynamicRecord>,
    before: Vec<RecordImage>,
}

impl<'a> RecordChanges<'a> {
    /// Start with no touched records
    pub fn new(store: &'a RecordStore) -> Self {
        Self {
            store,
            nodes: BTreeMap::new(),
            rels: BTreeMap::new(),
            props: BTreeMap::new(),
            dynamic: BTreeMap::new(),
            before: Vec::new(),
        }
    }

    /// Working copy of a node record
    pub fn node(&mut self, id: u64) -> &mut NodeRecord {
        let store = self.store;
        let before = &mut self.before;
        self.nodes.entry(id).or_insert_with(|| {
            let record = store.try_read::<NodeRecord>(id);
            before.push(RecordImage::Node { id, record });
            record
        })
    }

    /// Working copy of a relationship record
    pub fn rel(&mut self, id: u64) -> &mut RelationshipRecord {
        let store = self.store;
        let before = &mut self.before;
        self.rels.entry(id).or_insert_with(|| {
            let record = store.try_read::<RelationshipRecord>(id);
            before.push(RecordImage::Relationship { id, record });
            record
        })
    }

    /// Working copy of a property record
    pub fn prop(&mut self, id: u64) -> &mut PropertyRecord {
        let store = self.store;
        let before = &mut self.before;
        self.props.entry(id).or_insert_with(|| {
            let record = store.try_read::<PropertyRecord>(id);
            before.push(RecordImage::Property { id, record });
            record
        })
    }

    /// Working copy of a dynamic block
    pub fn dynamic(&mut self, id: u64) -> &mut DynamicRecord {
        let store = self.store;
        let before = &mut self.before;
        self.dynamic.entry(id).or_insert_with(|| {
            let record = store.try_read::<DynamicRecord>(id);
            before.push(RecordImage::Dynamic { id, record });
            record
        })
    }

    /// Write a fresh in-use node
    pub fn create_node(&mut self, id: u64) {
        *self.node(id) = NodeRecord::new_in_use();
    }

    /// Write a fresh relationship and link it at the head of both endpoint chains
    pub fn create_rel(&mut self, id: u64, type_id: u32, start: u64, end: u64) {
        *self.rel(id) = RelationshipRecord::new_in_use(type_id, start, end);
        self.link_rel(id, start);
        if end != start {
            self.link_rel(id, end);
        }
    }

    fn link_rel(&mut self, id: u64, node_id: u64) {
        let head = self.node(node_id).first_rel;
        if head != NIL {
            let old_head = self.rel(head);
            for side in old_head.sides_for(node_id) {
                old_head.set_prev(side, id);
            }
        }
        let rel = self.rel(id);
        for side in rel.sides_for(node_id) {
            rel.set_prev(side, NIL);
            rel.set_next(side, head);
        }
        self.node(node_id).first_rel = id;
    }

    /// Unlink a relationship from both endpoint chains and clear its in-use bit
    ///
    /// The deleted record keeps its own next pointers so a parked chain cursor
    /// can still move past it.
    pub fn delete_rel(&mut self, id: u64) -> Result<()> {
        let rel = *self.rel(id);
        if !rel.in_use() {
            return Err(Error::inconsistent(format!("relationship {} is not in use", id)));
        }

        let mut endpoints = vec![rel.first_node];
        if !rel.is_loop() {
            endpoints.push(rel.second_node);
        }
        for node_id in endpoints {
            // Both sides of a loop carry the same pointers
            let Some(side) = rel.sides_for(node_id).next() else {
                continue;
            };
            let prev = rel.prev(side);
            let next = rel.next(side);

            if prev == NIL {
                self.node(node_id).first_rel = next;
            } else {
                let prev_rel = self.rel(prev);
                for s in prev_rel.sides_for(node_id) {
                    prev_rel.set_next(s, next);
                }
            }
            if next != NIL {
                let next_rel = self.rel(next);
                for s in next_rel.sides_for(node_id) {
                    next_rel.set_prev(s, prev);
                }
            }
        }

        let first_prop = rel.first_prop;
        self.rel(id).set_deleted();
        self.delete_prop_chain(first_prop)
    }

    /// Delete a node whose relationship chain must already be empty
    pub fn delete_node(&mut self, id: u64) -> Result<()> {
        let node = *self.node(id);
        if !node.in_use() {
            return Err(Error::inconsistent(format!("node {} is not in use", id)));
        }
        if node.first_rel != NIL {
            return Err(Error::inconsistent(format!(
                "node {} still has relationship {}",
                id, node.first_rel
            )));
        }
        self.node(id).set_deleted();
        self.delete_prop_chain(node.first_prop)
    }

    fn delete_prop_chain(&mut self, head: u64) -> Result<()> {
        let mut current = head;
        let mut seen = 0u64;
        let limit = self.store.ids().get(RecordKind::Property).high_id();
        while current != NIL {
            seen += 1;
            if seen > limit {
                return Err(Error::storage(format!("property chain from {} loops", head)));
            }
            let record = *self.prop(current);
            self.free_value(&record)?;
            self.prop(current).set_deleted();
            current = record.next;
        }
        Ok(())
    }

    /// Property chain head of an entity
    fn first_prop(&mut self, owner: EntityRef) -> u64 {
        match owner {
            EntityRef::Node(id) => self.node(id).first_prop,
            EntityRef::Relationship(id) => self.rel(id).first_prop,
        }
    }

    fn set_first_prop(&mut self, owner: EntityRef, prop_id: u64) {
        match owner {
            EntityRef::Node(id) => self.node(id).first_prop = prop_id,
            EntityRef::Relationship(id) => self.rel(id).first_prop = prop_id,
        }
    }

    /// Write a new property at the head of the owner's chain
    pub fn add_prop(
        &mut self,
        owner: EntityRef,
        prop_id: u64,
        key_id: u32,
        value: &PropertyValue,
    ) -> Result<()> {
        let head = self.first_prop(owner);
        let mut record = PropertyRecord::new_in_use(key_id);
        self.encode_into(&mut record, value)?;
        record.prev = NIL;
        record.next = head;
        *self.prop(prop_id) = record;

        if head != NIL {
            self.prop(head).prev = prop_id;
        }
        self.set_first_prop(owner, prop_id);
        Ok(())
    }

    /// Replace the value of a stored property, freeing any old overflow blocks
    pub fn change_prop(&mut self, prop_id: u64, value: &PropertyValue) -> Result<()> {
        let record = *self.prop(prop_id);
        if !record.in_use() {
            return Err(Error::inconsistent(format!("property {} is not in use", prop_id)));
        }
        self.free_value(&record)?;

        let mut updated = record;
        self.encode_into(&mut updated, value)?;
        *self.prop(prop_id) = updated;
        Ok(())
    }

    /// Unlink a stored property from the owner's chain and clear its in-use bit
    pub fn remove_prop(&mut self, owner: EntityRef, prop_id: u64) -> Result<()> {
        let record = *self.prop(prop_id);
        if !record.in_use() {
            return Err(Error::inconsistent(format!("property {} is not in use", prop_id)));
        }

        if record.prev == NIL {
            self.set_first_prop(owner, record.next);
        } else {
            self.prop(record.prev).next = record.next;
        }
        if record.next != NIL {
            self.prop(record.next).prev = record.prev;
        }

        self.free_value(&record)?;
        self.prop(prop_id).set_deleted();
        Ok(())
    }

    /// Encode `value` into `record`, allocating overflow blocks as needed
    fn encode_into(&mut self, record: &mut PropertyRecord, value: &PropertyValue) -> Result<()> {
        let encoded = property::encode(value);
        record.kind = encoded.kind as u8;
        record.inline_len = encoded.inline_len;
        record.payload = match encoded.overflow {
            Some(bytes) => {
                let ids: Vec<u64> = (0..storage::dynamic_block_count(bytes.len()))
                    .map(|_| self.store.allocate(RecordKind::Dynamic))
                    .collect::<Result<_>>()?;
                for (id, block) in storage::dynamic_blocks(&bytes, &ids) {
                    *self.dynamic(id) = block;
                }
                ids[0]
            }
            None => encoded.payload,
        };
        Ok(())
    }

    /// Clear the overflow blocks of a property value
    fn free_value(&mut self, record: &PropertyRecord) -> Result<()> {
        if !storage::PropertyKind::from_u8(record.kind)?.is_dynamic() {
            return Ok(());
        }
        for id in self.store.dynamic_chain_ids(record.payload)? {
            self.dynamic(id).set_deleted();
        }
        Ok(())
    }

    /// Number of touched records
    pub fn len(&self) -> usize {
        self.nodes.len() + self.rels.len() + self.props.len() + self.dynamic.len()
    }

    /// No record touched
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// After-images and before-images of every touched record
    ///
    /// Dynamic blocks come first and nodes last, so a partially applied
    /// image set never leaves a live record pointing at an unwritten one.
    pub fn into_images(self) -> (Vec<RecordImage>, Vec<RecordImage>) {
        let mut after = Vec::with_capacity(self.len());
        after.extend(
            self.dynamic
                .into_iter()
                .map(|(id, record)| RecordImage::Dynamic { id, record }),
        );
        after.extend(
            self.props
                .into_iter()
                .map(|(id, record)| RecordImage::Property { id, record }),
        );
        after.extend(
            self.rels
                .into_iter()
                .map(|(id, record)| RecordImage::Relationship { id, record }),
        );
        after.extend(
            self.nodes
                .into_iter()
                .map(|(id, record)| RecordImage::Node { id, record }),
        );
        (after, self.before)
    }
}

/// Write one image into the store
pub fn write_image(store: &RecordStore, image: &RecordImage) -> Result<()> {
    match image {
        RecordImage::Node { id, record } => store.write(*id, record),
        RecordImage::Relationship { id, record } => store.write(*id, record),
        RecordImage::Property { id, record } => store.write(*id, record),
        RecordImage::Dynamic { id, record } => store.write(*id, record),
    }
}
