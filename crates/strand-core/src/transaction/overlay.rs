//! Transaction-local overlay
//!
//! Pure bookkeeping of what one transaction has done so far: created and
//! deleted entities, per-entity property deltas, staged dictionary entries,
//! and the ordered event list. Nothing here touches the record store; the
//! owning [`StoreTransaction`](super::StoreTransaction) validates against the
//! store before recording anything.

use crate::catalog::{KeyId, TypeId};
use crate::events::{DeltaEvent, EntityRef};
use crate::storage::{PropertyValue, RelationshipData};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Property as seen by callers
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyData {
    /// Property id
    pub id: u64,
    /// Key id
    pub key_id: KeyId,
    /// Value, `None` for lightweight loads
    pub value: Option<PropertyValue>,
}

/// Property id → property
pub type PropertyMap = HashMap<u64, PropertyData>;

/// Pending property changes of one entity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyDelta {
    /// Properties created in this transaction
    pub added: BTreeMap<u64, (KeyId, PropertyValue)>,
    /// Durable properties with a new value
    pub changed: BTreeMap<u64, (KeyId, PropertyValue)>,
    /// Durable properties removed
    pub removed: BTreeMap<u64, KeyId>,
}

impl PropertyDelta {
    /// No pending change
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.removed.is_empty()
    }
}

/// In-memory view of one transaction's uncommitted changes
#[derive(Debug, Default)]
pub struct TxOverlay {
    created_nodes: BTreeSet<u64>,
    created_rels: BTreeMap<u64, RelationshipData>,
    deleted_nodes: BTreeSet<u64>,
    deleted_rels: BTreeMap<u64, RelationshipData>,
    properties: HashMap<EntityRef, PropertyDelta>,
    /// Owner of every property id this transaction touched
    property_owners: HashMap<u64, EntityRef>,
    /// Durable properties of entities deleted in this transaction
    dead_properties: HashSet<u64>,
    staged_keys: BTreeMap<KeyId, String>,
    staged_types: BTreeMap<TypeId, String>,
    events: Vec<DeltaEvent>,
}

impl TxOverlay {
    /// Empty overlay
    pub fn new() -> Self {
        Self::default()
    }

    /// Nothing would be written by committing this overlay
    pub fn is_empty(&self) -> bool {
        self.created_nodes.is_empty()
            && self.created_rels.is_empty()
            && self.deleted_nodes.is_empty()
            && self.deleted_rels.is_empty()
            && self.properties.values().all(PropertyDelta::is_empty)
            && self.staged_keys.is_empty()
            && self.staged_types.is_empty()
    }

    // ---- nodes and relationships -------------------------------------------

    /// Node was created by this transaction
    pub fn is_node_created(&self, id: u64) -> bool {
        self.created_nodes.contains(&id)
    }

    /// Durable node was deleted by this transaction
    pub fn is_node_deleted(&self, id: u64) -> bool {
        self.deleted_nodes.contains(&id)
    }

    /// Relationship was created by this transaction
    pub fn is_rel_created(&self, id: u64) -> bool {
        self.created_rels.contains_key(&id)
    }

    /// Durable relationship was deleted by this transaction
    pub fn is_rel_deleted(&self, id: u64) -> bool {
        self.deleted_rels.contains_key(&id)
    }

    /// Relationship created by this transaction
    pub fn created_rel(&self, id: u64) -> Option<&RelationshipData> {
        self.created_rels.get(&id)
    }

    /// Created nodes, ascending
    pub fn created_nodes(&self) -> impl Iterator<Item = u64> + '_ {
        self.created_nodes.iter().copied()
    }

    /// Created relationships, ascending by id
    pub fn created_rels(&self) -> impl Iterator<Item = &RelationshipData> + '_ {
        self.created_rels.values()
    }

    /// Deleted durable nodes, ascending
    pub fn deleted_nodes(&self) -> impl Iterator<Item = u64> + '_ {
        self.deleted_nodes.iter().copied()
    }

    /// Deleted durable relationships, ascending by id
    pub fn deleted_rels(&self) -> impl Iterator<Item = &RelationshipData> + '_ {
        self.deleted_rels.values()
    }

    /// Relationships created on `node` with id `from` or above, by id
    pub fn created_rels_from(
        &self,
        node: u64,
        from: u64,
    ) -> impl Iterator<Item = &RelationshipData> + '_ {
        self.created_rels
            .range(from..)
            .map(|(_, rel)| rel)
            .filter(move |r| r.start_node == node || r.end_node == node)
    }

    /// Record a node creation
    pub fn create_node(&mut self, id: u64) {
        self.created_nodes.insert(id);
        self.events.push(DeltaEvent::NodeCreated { node_id: id });
    }

    /// Record a relationship creation
    pub fn create_rel(&mut self, rel: RelationshipData) {
        self.created_rels.insert(rel.id, rel);
        self.events.push(DeltaEvent::RelationshipCreated {
            rel_id: rel.id,
            type_id: rel.type_id,
            start_node: rel.start_node,
            end_node: rel.end_node,
        });
    }

    /// Record a node deletion; `durable_props` are the ids of its stored properties
    pub fn delete_node(&mut self, id: u64, durable_props: impl IntoIterator<Item = u64>) {
        self.forget_entity(EntityRef::Node(id), durable_props);
        if !self.created_nodes.remove(&id) {
            self.deleted_nodes.insert(id);
        }
        self.events.push(DeltaEvent::NodeDeleted { node_id: id });
    }

    /// Record a relationship deletion
    pub fn delete_rel(
        &mut self,
        rel: RelationshipData,
        durable_props: impl IntoIterator<Item = u64>,
    ) {
        self.forget_entity(EntityRef::Relationship(rel.id), durable_props);
        if self.created_rels.remove(&rel.id).is_none() {
            self.deleted_rels.insert(rel.id, rel);
        }
        self.events.push(DeltaEvent::RelationshipDeleted { rel_id: rel.id });
    }

    fn forget_entity(&mut self, entity: EntityRef, durable_props: impl IntoIterator<Item = u64>) {
        self.properties.remove(&entity);
        self.property_owners.retain(|_, owner| *owner != entity);
        self.dead_properties.extend(durable_props);
    }

    // ---- properties --------------------------------------------------------

    /// Pending changes of `entity`
    pub fn delta(&self, entity: EntityRef) -> Option<&PropertyDelta> {
        self.properties.get(&entity)
    }

    /// Every entity with pending property changes
    pub fn property_deltas(&self) -> impl Iterator<Item = (&EntityRef, &PropertyDelta)> + '_ {
        self.properties.iter().filter(|(_, d)| !d.is_empty())
    }

    /// Entity owning a property this transaction touched
    pub fn property_owner(&self, prop_id: u64) -> Option<EntityRef> {
        self.property_owners.get(&prop_id).copied()
    }

    /// Property belonged to an entity deleted in this transaction
    pub fn is_property_dead(&self, prop_id: u64) -> bool {
        self.dead_properties.contains(&prop_id)
    }

    /// Record a new property
    pub fn add_property(
        &mut self,
        entity: EntityRef,
        prop_id: u64,
        key_id: KeyId,
        value: PropertyValue,
    ) {
        self.properties
            .entry(entity)
            .or_default()
            .added
            .insert(prop_id, (key_id, value.clone()));
        self.property_owners.insert(prop_id, entity);
        self.events.push(DeltaEvent::PropertyAdded {
            entity,
            prop_id,
            key_id,
            value,
        });
    }

    /// Record a new value for a property; `old` is the value visible before
    pub fn change_property(
        &mut self,
        entity: EntityRef,
        prop_id: u64,
        key_id: KeyId,
        old: PropertyValue,
        new: PropertyValue,
    ) {
        let delta = self.properties.entry(entity).or_default();
        if let Some(added) = delta.added.get_mut(&prop_id) {
            added.1 = new.clone();
        } else {
            delta.changed.insert(prop_id, (key_id, new.clone()));
        }
        self.property_owners.insert(prop_id, entity);
        self.events.push(DeltaEvent::PropertyChanged {
            entity,
            prop_id,
            key_id,
            old,
            new,
        });
    }

    /// Record a property removal; `old` is the value visible before
    pub fn remove_property(
        &mut self,
        entity: EntityRef,
        prop_id: u64,
        key_id: KeyId,
        old: PropertyValue,
    ) {
        let delta = self.properties.entry(entity).or_default();
        if delta.added.remove(&prop_id).is_none() {
            delta.changed.remove(&prop_id);
            delta.removed.insert(prop_id, key_id);
        }
        self.property_owners.insert(prop_id, entity);
        self.events.push(DeltaEvent::PropertyRemoved {
            entity,
            prop_id,
            key_id,
            old,
        });
    }

    // ---- dictionaries ------------------------------------------------------

    /// Stage a property key for persistence at commit
    pub fn stage_key(&mut self, id: KeyId, name: &str) {
        self.staged_keys.insert(id, name.to_string());
    }

    /// Stage a relationship type for persistence at commit
    pub fn stage_type(&mut self, id: TypeId, name: &str) {
        self.staged_types.insert(id, name.to_string());
    }

    /// Name of a key staged by this transaction
    pub fn staged_key(&self, id: KeyId) -> Option<&str> {
        self.staged_keys.get(&id).map(String::as_str)
    }

    /// Name of a type staged by this transaction
    pub fn staged_type(&self, id: TypeId) -> Option<&str> {
        self.staged_types.get(&id).map(String::as_str)
    }

    /// Keys staged by this transaction, ascending
    pub fn staged_keys(&self) -> impl Iterator<Item = (KeyId, &str)> + '_ {
        self.staged_keys.iter().map(|(id, name)| (*id, name.as_str()))
    }

    /// Types staged by this transaction, ascending
    pub fn staged_types(&self) -> impl Iterator<Item = (TypeId, &str)> + '_ {
        self.staged_types.iter().map(|(id, name)| (*id, name.as_str()))
    }

    // ---- events ------------------------------------------------------------

    /// Events in call order
    pub fn events(&self) -> &[DeltaEvent] {
        &self.events
    }

    /// Take the event list, leaving it empty
    pub fn take_events(&mut self) -> Vec<DeltaEvent> {
        std::mem::take(&mut self.events)
    }
}
