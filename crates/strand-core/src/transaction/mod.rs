//! Transaction layer - overlay, chain locks, two-phase commit
//!
//! A [`StoreTransaction`] owns its [`TxOverlay`] and passes every read
//! through it before falling back to the record store, so a transaction sees
//! its own writes and only the committed writes of others.
//!
//! Commit protocol:
//! - `prepare` locks every node and then every relationship whose record will
//!   change (sorted, so preparers never deadlock), validates the overlay
//!   against the store, builds after-images and logs them to the WAL
//! - `commit` logs the decision, persists staged dictionary entries, writes
//!   the images and releases the locks
//! - `rollback` discards the overlay and logs an abort if a prepare was logged

pub mod apply;
pub mod coordinator;
pub mod overlay;

pub use coordinator::{Outcome, TwoPhaseCoordinator};
pub use overlay::{PropertyData, PropertyDelta, PropertyMap, TxOverlay};

use crate::catalog::{KeyId, PropertyKeyData, RelationshipTypeData, TypeId};
use crate::database::StoreShared;
use crate::events::{DeltaEvent, EntityRef};
use crate::ids::{self, RecordKind};
use crate::storage::{
    ChainCursor, ChainLockGuard, ChainPage, NIL, NodeRecord, PropertyRecord, PropertyValue,
    RelationshipData, RelationshipRecord, ResourceId,
};
use crate::wal::{DictionaryEntry, RecordImage, WalEntry};
use crate::{Error, Result};
use apply::RecordChanges;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;

/// Transaction state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting operations
    Active,
    /// Locking, validating and logging
    Preparing,
    /// Logged and voted; waiting for the decision
    Prepared,
    /// Applying logged changes
    Committing,
    /// Changes are durable and visible
    Committed,
    /// Discarding changes
    RollingBack,
    /// Changes discarded
    RolledBack,
}

impl TxState {
    /// No further transition is possible
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

/// Outcome of a successful prepare
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// Ready to commit
    Commit,
    /// Nothing to write; the transaction is already finished
    ReadOnly,
}

/// A participant in a two-phase commit
pub trait ResourceManager {
    /// Phase one: make the outcome durable-ready and vote
    fn prepare(&mut self) -> Result<Vote>;
    /// Phase two, after every participant voted to commit
    fn commit(&mut self) -> Result<()>;
    /// Abandon the work, before or after prepare
    fn rollback(&mut self) -> Result<()>;
}

/// Pooled resource handle bound to a transaction
pub trait PooledConnection: Send {
    /// Give the handle back to its pool
    fn release(self: Box<Self>);
}

/// Changes logged by prepare and waiting for the decision
#[derive(Debug, Default)]
struct PreparedChanges {
    after: Vec<RecordImage>,
    before: Vec<RecordImage>,
    dictionary: Vec<DictionaryEntry>,
}

/// One logical transaction against a [`GraphStore`](crate::GraphStore)
pub struct StoreTransaction {
    id: u64,
    shared: Arc<StoreShared>,
    state: TxState,
    overlay: TxOverlay,
    prepared: Option<PreparedChanges>,
    locks: Vec<ChainLockGuard>,
    /// A `Begin` entry for this transaction is in the WAL
    logged: bool,
    read_only: bool,
    connection: Option<Box<dyn PooledConnection>>,
    destroyed: bool,
}

impl fmt::Debug for StoreTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreTransaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("locks", &self.locks.len())
            .finish()
    }
}

impl StoreTransaction {
    pub(crate) fn new(id: u64, shared: Arc<StoreShared>) -> Self {
        Self {
            id,
            shared,
            state: TxState::Active,
            overlay: TxOverlay::new(),
            prepared: None,
            locks: Vec::new(),
            logged: false,
            read_only: false,
            connection: None,
            destroyed: false,
        }
    }

    /// Transaction id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state
    pub fn state(&self) -> TxState {
        self.state
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state == TxState::Active {
            Ok(())
        } else {
            Err(Error::transaction(format!(
                "transaction {} is {:?}, not active",
                self.id, self.state
            )))
        }
    }

    // ---- visibility --------------------------------------------------------

    fn node_visible(&self, id: u64) -> bool {
        self.overlay.is_node_created(id)
            || (!self.overlay.is_node_deleted(id) && self.shared.store.node_exists(id))
    }

    fn rel_view(&self, id: u64) -> Option<RelationshipData> {
        if let Some(rel) = self.overlay.created_rel(id) {
            return Some(*rel);
        }
        if self.overlay.is_rel_deleted(id) {
            return None;
        }
        let record = self.shared.store.try_read::<RelationshipRecord>(id);
        record
            .in_use()
            .then(|| RelationshipData::from_record(id, &record))
    }

    fn entity_visible(&self, entity: EntityRef) -> bool {
        match entity {
            EntityRef::Node(id) => self.node_visible(id),
            EntityRef::Relationship(id) => self.rel_view(id).is_some(),
        }
    }

    fn entity_created(&self, entity: EntityRef) -> bool {
        match entity {
            EntityRef::Node(id) => self.overlay.is_node_created(id),
            EntityRef::Relationship(id) => self.overlay.is_rel_created(id),
        }
    }

    fn ensure_visible(&self, entity: EntityRef) -> Result<()> {
        if self.entity_visible(entity) {
            Ok(())
        } else {
            Err(Error::not_found(describe(entity)))
        }
    }

    /// Stored property chain of an entity, empty for entities created here
    fn durable_properties(&self, entity: EntityRef) -> Result<Vec<(u64, PropertyRecord)>> {
        if self.entity_created(entity) {
            return Ok(Vec::new());
        }
        let store = &self.shared.store;
        let head = match entity {
            EntityRef::Node(id) => store.try_read::<NodeRecord>(id).first_prop,
            EntityRef::Relationship(id) => store.try_read::<RelationshipRecord>(id).first_prop,
        };
        store.property_chain(head)
    }

    /// Properties of a visible entity with the overlay applied
    fn merged_properties(&self, entity: EntityRef, light: bool) -> Result<PropertyMap> {
        let delta = self.overlay.delta(entity);
        let mut map = PropertyMap::new();

        for (id, record) in self.durable_properties(entity)? {
            if delta.is_some_and(|d| d.removed.contains_key(&id)) {
                continue;
            }
            let value = if light {
                None
            } else if let Some((_, value)) = delta.and_then(|d| d.changed.get(&id)) {
                Some(value.clone())
            } else {
                Some(self.shared.store.load_value(&record)?)
            };
            map.insert(
                id,
                PropertyData {
                    id,
                    key_id: record.key_id,
                    value,
                },
            );
        }

        if let Some(delta) = delta {
            for (&id, (key_id, value)) in &delta.added {
                map.insert(
                    id,
                    PropertyData {
                        id,
                        key_id: *key_id,
                        value: (!light).then(|| value.clone()),
                    },
                );
            }
        }
        Ok(map)
    }

    /// Current key and value of a property owned by `entity`
    fn find_property(&self, entity: EntityRef, prop_id: u64) -> Result<(KeyId, PropertyValue)> {
        let delta = self.overlay.delta(entity);
        if let Some((key_id, value)) = delta.and_then(|d| d.added.get(&prop_id)) {
            return Ok((*key_id, value.clone()));
        }
        if delta.is_some_and(|d| d.removed.contains_key(&prop_id)) {
            return Err(property_not_found(entity, prop_id));
        }

        let (_, record) = self
            .durable_properties(entity)?
            .into_iter()
            .find(|(id, _)| *id == prop_id)
            .ok_or_else(|| property_not_found(entity, prop_id))?;

        let value = match delta.and_then(|d| d.changed.get(&prop_id)) {
            Some((_, value)) => value.clone(),
            None => self.shared.store.load_value(&record)?,
        };
        Ok((record.key_id, value))
    }

    fn key_known(&self, key_id: KeyId) -> bool {
        self.shared.registry.is_key_committed(key_id) || self.overlay.staged_key(key_id).is_some()
    }

    fn type_known(&self, type_id: TypeId) -> bool {
        self.shared.registry.is_type_committed(type_id)
            || self.overlay.staged_type(type_id).is_some()
    }

    // ---- nodes and relationships -------------------------------------------

    /// Hand out a fresh node id
    pub fn allocate_node_id(&self) -> Result<u64> {
        self.shared.store.allocate(RecordKind::Node)
    }

    /// Hand out a fresh relationship id
    pub fn allocate_relationship_id(&self) -> Result<u64> {
        self.shared.store.allocate(RecordKind::Relationship)
    }

    /// Create a node with a caller-chosen id
    ///
    /// Fails with `IdOutOfRange` for ids above [`MAX_RECORD_ID`](ids::MAX_RECORD_ID), the chain
    /// sentinel included, before anything is recorded.
    pub fn create_node(&mut self, id: u64) -> Result<()> {
        self.ensure_active()?;
        ids::check_id(RecordKind::Node, id)?;
        if self.overlay.is_node_created(id) || self.shared.store.node_exists(id) {
            return Err(Error::duplicate_id(format!("node {}", id)));
        }

        self.shared.store.ids().get(RecordKind::Node).mark_used(id);
        self.overlay.create_node(id);
        tracing::debug!("tx {} created node {}", self.id, id);
        Ok(())
    }

    /// Create a relationship between two visible nodes
    ///
    /// Ids are range-checked like [`create_node`](Self::create_node).
    pub fn create_relationship(
        &mut self,
        id: u64,
        type_id: TypeId,
        start: u64,
        end: u64,
    ) -> Result<()> {
        self.ensure_active()?;
        ids::check_id(RecordKind::Relationship, id)?;
        if self.overlay.is_rel_created(id) || self.shared.store.rel_exists(id) {
            return Err(Error::duplicate_id(format!("relationship {}", id)));
        }
        if !self.type_known(type_id) {
            return Err(Error::not_found(format!("relationship type {}", type_id)));
        }
        for node in [start, end] {
            if !self.node_visible(node) {
                return Err(Error::invalid_endpoint(format!(
                    "node {} of relationship {}",
                    node, id
                )));
            }
        }

        self.shared
            .store
            .ids()
            .get(RecordKind::Relationship)
            .mark_used(id);
        self.overlay.create_rel(RelationshipData {
            id,
            type_id,
            start_node: start,
            end_node: end,
        });
        tracing::debug!(
            "tx {} created relationship {} ({} -> {})",
            self.id,
            id,
            start,
            end
        );
        Ok(())
    }

    /// Delete a node, returning the properties it had
    ///
    /// A node that still has relationships when the transaction is prepared
    /// makes the prepare fail; deletion never cascades.
    pub fn delete_node(&mut self, id: u64) -> Result<PropertyMap> {
        self.ensure_active()?;
        let entity = EntityRef::Node(id);
        self.ensure_visible(entity)?;

        let properties = self.merged_properties(entity, false)?;
        let durable: Vec<u64> = self
            .durable_properties(entity)?
            .into_iter()
            .map(|(prop_id, _)| prop_id)
            .collect();

        self.emit_removals(entity, &properties);
        self.overlay.delete_node(id, durable);
        tracing::debug!("tx {} deleted node {}", self.id, id);
        Ok(properties)
    }

    /// Delete a relationship, returning the properties it had
    pub fn delete_relationship(&mut self, id: u64) -> Result<PropertyMap> {
        self.ensure_active()?;
        let entity = EntityRef::Relationship(id);
        let rel = self
            .rel_view(id)
            .ok_or_else(|| Error::not_found(describe(entity)))?;

        let properties = self.merged_properties(entity, false)?;
        let durable: Vec<u64> = self
            .durable_properties(entity)?
            .into_iter()
            .map(|(prop_id, _)| prop_id)
            .collect();

        self.emit_removals(entity, &properties);
        self.overlay.delete_rel(rel, durable);
        tracing::debug!("tx {} deleted relationship {}", self.id, id);
        Ok(properties)
    }

    fn emit_removals(&mut self, entity: EntityRef, properties: &PropertyMap) {
        let ordered: BTreeSet<u64> = properties.keys().copied().collect();
        for prop_id in ordered {
            if let Some(PropertyData {
                key_id,
                value: Some(value),
                ..
            }) = properties.get(&prop_id)
            {
                self.overlay
                    .remove_property(entity, prop_id, *key_id, value.clone());
            }
        }
    }

    // ---- properties --------------------------------------------------------

    fn add_property(
        &mut self,
        entity: EntityRef,
        key_id: KeyId,
        value: PropertyValue,
    ) -> Result<PropertyData> {
        self.ensure_active()?;
        self.ensure_visible(entity)?;
        if !self.key_known(key_id) {
            return Err(Error::not_found(format!("property key {}", key_id)));
        }

        let prop_id = self.shared.store.allocate(RecordKind::Property)?;
        self.overlay
            .add_property(entity, prop_id, key_id, value.clone());
        Ok(PropertyData {
            id: prop_id,
            key_id,
            value: Some(value),
        })
    }

    fn change_property(
        &mut self,
        entity: EntityRef,
        prop_id: u64,
        value: PropertyValue,
    ) -> Result<PropertyData> {
        self.ensure_active()?;
        self.ensure_visible(entity)?;
        let (key_id, old) = self.find_property(entity, prop_id)?;

        self.overlay
            .change_property(entity, prop_id, key_id, old, value.clone());
        Ok(PropertyData {
            id: prop_id,
            key_id,
            value: Some(value),
        })
    }

    fn remove_property(&mut self, entity: EntityRef, prop_id: u64) -> Result<()> {
        self.ensure_active()?;
        self.ensure_visible(entity)?;
        let (key_id, old) = self.find_property(entity, prop_id)?;

        self.overlay.remove_property(entity, prop_id, key_id, old);
        Ok(())
    }

    fn load_properties(&self, entity: EntityRef, light: bool) -> Result<PropertyMap> {
        self.ensure_visible(entity)?;
        self.merged_properties(entity, light)
    }

    /// Add a property to a node
    pub fn node_add_property(
        &mut self,
        node: u64,
        key_id: KeyId,
        value: impl Into<PropertyValue>,
    ) -> Result<PropertyData> {
        self.add_property(EntityRef::Node(node), key_id, value.into())
    }

    /// Replace the value of one of a node's properties
    pub fn node_change_property(
        &mut self,
        node: u64,
        prop_id: u64,
        value: impl Into<PropertyValue>,
    ) -> Result<PropertyData> {
        self.change_property(EntityRef::Node(node), prop_id, value.into())
    }

    /// Remove one of a node's properties
    pub fn node_remove_property(&mut self, node: u64, prop_id: u64) -> Result<()> {
        self.remove_property(EntityRef::Node(node), prop_id)
    }

    /// Properties of a node; `light` skips loading values
    pub fn node_load_properties(&self, node: u64, light: bool) -> Result<PropertyMap> {
        self.load_properties(EntityRef::Node(node), light)
    }

    /// Add a property to a relationship
    pub fn rel_add_property(
        &mut self,
        rel: u64,
        key_id: KeyId,
        value: impl Into<PropertyValue>,
    ) -> Result<PropertyData> {
        self.add_property(EntityRef::Relationship(rel), key_id, value.into())
    }

    /// Replace the value of one of a relationship's properties
    pub fn rel_change_property(
        &mut self,
        rel: u64,
        prop_id: u64,
        value: impl Into<PropertyValue>,
    ) -> Result<PropertyData> {
        self.change_property(EntityRef::Relationship(rel), prop_id, value.into())
    }

    /// Remove one of a relationship's properties
    pub fn rel_remove_property(&mut self, rel: u64, prop_id: u64) -> Result<()> {
        self.remove_property(EntityRef::Relationship(rel), prop_id)
    }

    /// Properties of a relationship; `light` skips loading values
    pub fn rel_load_properties(&self, rel: u64, light: bool) -> Result<PropertyMap> {
        self.load_properties(EntityRef::Relationship(rel), light)
    }

    /// Value of a single property, loading overflow blocks on demand
    pub fn load_property_value(&self, prop_id: u64) -> Result<PropertyValue> {
        self.resolve_property(prop_id).map(|(_, value)| value)
    }

    /// Key id of a property
    pub fn key_id_for_property(&self, prop_id: u64) -> Result<KeyId> {
        self.resolve_property(prop_id).map(|(key_id, _)| key_id)
    }

    fn resolve_property(&self, prop_id: u64) -> Result<(KeyId, PropertyValue)> {
        let missing = || Error::not_found(format!("property {}", prop_id));
        if self.overlay.is_property_dead(prop_id) {
            return Err(missing());
        }
        if let Some(delta) = self
            .overlay
            .property_owner(prop_id)
            .and_then(|owner| self.overlay.delta(owner))
        {
            let staged = delta.added.get(&prop_id).or(delta.changed.get(&prop_id));
            if let Some((key_id, value)) = staged {
                return Ok((*key_id, value.clone()));
            }
            if delta.removed.contains_key(&prop_id) {
                return Err(missing());
            }
        }

        let record = self.shared.store.read_prop(prop_id).map_err(|_| missing())?;
        Ok((record.key_id, self.shared.store.load_value(&record)?))
    }

    // ---- reads -------------------------------------------------------------

    /// Node is visible to this transaction
    pub fn node_load_light(&self, id: u64) -> bool {
        self.node_visible(id)
    }

    /// Relationship as visible to this transaction
    pub fn rel_load_light(&self, id: u64) -> Option<RelationshipData> {
        self.rel_view(id)
    }

    /// Node was created by this transaction
    pub fn is_node_created(&self, id: u64) -> bool {
        self.overlay.is_node_created(id)
    }

    /// Relationship was created by this transaction
    pub fn is_relationship_created(&self, id: u64) -> bool {
        self.overlay.is_rel_created(id)
    }

    /// Nodes created by this transaction, ascending
    pub fn created_nodes(&self) -> Vec<u64> {
        self.overlay.created_nodes().collect()
    }

    /// Events recorded so far, in call order
    pub fn pending_events(&self) -> &[DeltaEvent] {
        self.overlay.events()
    }

    // ---- dictionaries ------------------------------------------------------

    /// Id for a property key name, creating it on miss
    pub fn create_property_key(&mut self, name: &str) -> Result<KeyId> {
        self.ensure_active()?;
        let id = self.shared.registry.reserve_key(name)?;
        if !self.shared.registry.is_key_committed(id) {
            self.overlay.stage_key(id, name);
        }
        Ok(id)
    }

    /// Id for a relationship type name, creating it on miss
    pub fn create_relationship_type(&mut self, name: &str) -> Result<TypeId> {
        self.ensure_active()?;
        let id = self.shared.registry.reserve_type(name)?;
        if !self.shared.registry.is_type_committed(id) {
            self.overlay.stage_type(id, name);
        }
        Ok(id)
    }

    /// Name of a property key
    pub fn load_index(&self, key_id: KeyId) -> Option<String> {
        self.overlay
            .staged_key(key_id)
            .map(str::to_string)
            .or_else(|| self.shared.registry.key_name(key_id))
    }

    /// Name of a relationship type
    pub fn relationship_type_name(&self, type_id: TypeId) -> Option<String> {
        self.overlay
            .staged_type(type_id)
            .map(str::to_string)
            .or_else(|| self.shared.registry.type_name(type_id))
    }

    /// Up to `max_count` property keys, in id order
    pub fn load_property_indexes(&self, max_count: usize) -> Vec<PropertyKeyData> {
        let mut keys = self.shared.registry.load_property_indexes(usize::MAX);
        keys.extend(
            self.overlay
                .staged_keys()
                .filter(|(id, _)| !self.shared.registry.is_key_committed(*id))
                .map(|(id, key)| PropertyKeyData {
                    id,
                    key: key.to_string(),
                }),
        );
        keys.sort_unstable_by_key(|k| k.id);
        keys.truncate(max_count);
        keys
    }

    /// All relationship types, in id order
    pub fn load_relationship_types(&self) -> Vec<RelationshipTypeData> {
        let mut types = self.shared.registry.load_relationship_types();
        types.extend(
            self.overlay
                .staged_types()
                .filter(|(id, _)| !self.shared.registry.is_type_committed(*id))
                .map(|(id, name)| RelationshipTypeData {
                    id,
                    name: name.to_string(),
                }),
        );
        types.sort_unstable_by_key(|t| t.id);
        types
    }

    // ---- chain paging ------------------------------------------------------

    /// Fresh cursor for walking a node's relationships
    pub fn relationship_chain_position(&self, node: u64) -> Result<ChainCursor> {
        if !self.node_visible(node) {
            return Err(Error::not_found(format!("node {}", node)));
        }
        if self.overlay.is_node_created(node) {
            return Ok(ChainCursor::Start);
        }
        let head = self.shared.store.try_read::<NodeRecord>(node).first_rel;
        Ok(if head == NIL {
            ChainCursor::Start
        } else {
            ChainCursor::At(head)
        })
    }

    /// Next page of a node's relationships as seen by this transaction
    ///
    /// Relationships deleted here are left out. Relationships created here
    /// follow the stored chain in id order, filling the rest of its final
    /// page and then pages of their own. No page holds more than the
    /// configured batch size.
    pub fn more_relationships(&self, node: u64, cursor: ChainCursor) -> Result<ChainPage> {
        if self.overlay.is_node_deleted(node) {
            return Err(Error::not_found(format!("node {}", node)));
        }

        let (mut page, from) = match cursor {
            ChainCursor::Exhausted => return Ok(ChainPage::exhausted()),
            ChainCursor::Created(from) => (ChainPage::exhausted(), from),
            _ if self.overlay.is_node_created(node) => (ChainPage::exhausted(), 0),
            _ => (self.shared.pager.page(&self.shared.store, node, cursor)?, 0),
        };

        page.buckets.retain(|rel| !self.overlay.is_rel_deleted(rel.id));
        if page.next.is_exhausted() {
            let room = self
                .shared
                .pager
                .batch_size()
                .saturating_sub(page.buckets.len());
            let mut created = self.overlay.created_rels_from(node, from);
            for rel in created.by_ref().take(room) {
                page.buckets.push(node, *rel);
            }
            if let Some(rest) = created.next() {
                page.next = ChainCursor::Created(rest.id);
            }
        }
        Ok(page)
    }

    // ---- two-phase commit --------------------------------------------------

    /// Bind a pooled connection, released by [`destroy`](Self::destroy)
    pub fn set_connection(&mut self, connection: Box<dyn PooledConnection>) {
        self.connection = Some(connection);
    }

    /// Lock, validate and log the overlay
    ///
    /// Any failure rolls the transaction back; validation failures surface
    /// as [`Error::InconsistentTransactionState`].
    pub fn prepare(&mut self) -> Result<Vote> {
        if self.state != TxState::Active {
            return Err(Error::transaction(format!(
                "transaction {} cannot prepare from {:?}",
                self.id, self.state
            )));
        }
        self.state = TxState::Preparing;

        if self.overlay.is_empty() {
            self.read_only = true;
            self.release();
            self.state = TxState::Committed;
            tracing::debug!("tx {} prepared read-only", self.id);
            return Ok(Vote::ReadOnly);
        }

        match self.prepare_changes() {
            Ok(prepared) => {
                tracing::debug!(
                    "tx {} prepared {} record images",
                    self.id,
                    prepared.after.len()
                );
                self.prepared = Some(prepared);
                self.state = TxState::Prepared;
                Ok(Vote::Commit)
            }
            Err(e) => {
                tracing::warn!("tx {} failed to prepare: {}", self.id, e);
                self.abort();
                Err(e)
            }
        }
    }

    fn prepare_changes(&mut self) -> Result<PreparedChanges> {
        let shared = Arc::clone(&self.shared);
        let store = &shared.store;

        // Phase one locks: every node whose record or chain changes
        let node_locks = shared
            .locks
            .acquire_all(self.id, &self.node_resources())?;
        self.locks.extend(node_locks);

        self.validate()?;

        // Phase two locks: our relationships plus chain neighbours we relink
        let rel_locks = shared
            .locks
            .acquire_all(self.id, &self.relationship_resources())?;
        self.locks.extend(rel_locks);

        let mut changes = RecordChanges::new(store);
        for id in self.overlay.created_nodes() {
            changes.create_node(id);
        }
        for rel in self.overlay.created_rels() {
            changes.create_rel(rel.id, rel.type_id, rel.start_node, rel.end_node);
        }

        let mut deltas: Vec<_> = self.overlay.property_deltas().collect();
        deltas.sort_unstable_by_key(|(entity, _)| **entity);
        for (&owner, delta) in deltas {
            for &prop_id in delta.removed.keys() {
                changes.remove_prop(owner, prop_id)?;
            }
            for (&prop_id, (_, value)) in &delta.changed {
                changes.change_prop(prop_id, value)?;
            }
            for (&prop_id, (key_id, value)) in &delta.added {
                changes.add_prop(owner, prop_id, *key_id, value)?;
            }
        }

        for rel in self.overlay.deleted_rels() {
            changes.delete_rel(rel.id)?;
        }
        for id in self.overlay.deleted_nodes() {
            changes.delete_node(id)?;
        }

        let dictionary: Vec<DictionaryEntry> = self
            .overlay
            .staged_keys()
            .map(|(id, name)| DictionaryEntry::PropertyKey {
                id,
                name: name.to_string(),
            })
            .chain(
                self.overlay
                    .staged_types()
                    .map(|(id, name)| DictionaryEntry::RelationshipType {
                        id,
                        name: name.to_string(),
                    }),
            )
            .collect();

        let (after, before) = changes.into_images();

        {
            let mut wal = shared.wal.lock();
            self.logged = true;
            shared.undecided.fetch_add(1, Ordering::SeqCst);
            wal.append(&WalEntry::Begin { tx_id: self.id })?;
            for entry in &dictionary {
                wal.append(&WalEntry::Dictionary {
                    tx_id: self.id,
                    entry: entry.clone(),
                })?;
            }
            for image in &after {
                wal.append(&WalEntry::Record {
                    tx_id: self.id,
                    image: *image,
                })?;
            }
            wal.append(&WalEntry::Prepare { tx_id: self.id })?;
            if shared.config.sync_on_prepare {
                wal.sync()?;
            } else {
                wal.flush()?;
            }
        }

        Ok(PreparedChanges {
            after,
            before,
            dictionary,
        })
    }

    fn node_resources(&self) -> Vec<ResourceId> {
        let mut nodes = BTreeSet::new();
        nodes.extend(self.overlay.created_nodes());
        nodes.extend(self.overlay.deleted_nodes());
        for rel in self.overlay.created_rels().chain(self.overlay.deleted_rels()) {
            nodes.insert(rel.start_node);
            nodes.insert(rel.end_node);
        }
        for (entity, _) in self.overlay.property_deltas() {
            if let EntityRef::Node(id) = entity {
                nodes.insert(*id);
            }
        }
        nodes.into_iter().map(ResourceId::node).collect()
    }

    fn relationship_resources(&self) -> Vec<ResourceId> {
        let store = &self.shared.store;
        let mut rels = BTreeSet::new();

        for rel in self.overlay.created_rels() {
            rels.insert(rel.id);
            for node in [rel.start_node, rel.end_node] {
                if !self.overlay.is_node_created(node) {
                    let head = store.try_read::<NodeRecord>(node).first_rel;
                    if head != NIL {
                        rels.insert(head);
                    }
                }
            }
        }
        for rel in self.overlay.deleted_rels() {
            rels.insert(rel.id);
            let record = store.try_read::<RelationshipRecord>(rel.id);
            for pointer in [
                record.first_prev,
                record.first_next,
                record.second_prev,
                record.second_next,
            ] {
                if pointer != NIL {
                    rels.insert(pointer);
                }
            }
        }
        for (entity, _) in self.overlay.property_deltas() {
            if let EntityRef::Relationship(id) = entity {
                rels.insert(*id);
            }
        }
        rels.into_iter().map(ResourceId::relationship).collect()
    }

    /// Re-check the overlay against the store under the node locks
    fn validate(&self) -> Result<()> {
        let store = &self.shared.store;
        let live_node = |id: u64| {
            self.overlay.is_node_created(id)
                || (!self.overlay.is_node_deleted(id) && store.node_exists(id))
        };

        for id in self.overlay.created_nodes() {
            if store.node_exists(id) {
                return Err(Error::inconsistent(format!("node {} was created concurrently", id)));
            }
        }
        for rel in self.overlay.created_rels() {
            if store.rel_exists(rel.id) {
                return Err(Error::inconsistent(format!(
                    "relationship {} was created concurrently",
                    rel.id
                )));
            }
            for node in [rel.start_node, rel.end_node] {
                if !live_node(node) {
                    return Err(Error::inconsistent(format!(
                        "relationship {} points at deleted node {}",
                        rel.id, node
                    )));
                }
            }
        }
        for rel in self.overlay.deleted_rels() {
            if !store.rel_exists(rel.id) {
                return Err(Error::inconsistent(format!(
                    "relationship {} is already deleted",
                    rel.id
                )));
            }
        }
        for id in self.overlay.deleted_nodes() {
            if !store.node_exists(id) {
                return Err(Error::inconsistent(format!("node {} is already deleted", id)));
            }
        }
        for (entity, _) in self.overlay.property_deltas() {
            let live = match *entity {
                EntityRef::Node(id) => live_node(id),
                EntityRef::Relationship(id) => {
                    self.overlay.is_rel_created(id)
                        || (!self.overlay.is_rel_deleted(id) && store.rel_exists(id))
                }
            };
            if !live {
                return Err(Error::inconsistent(format!(
                    "property change on deleted {}",
                    describe(*entity)
                )));
            }
        }
        Ok(())
    }

    /// Apply the logged changes; only legal once prepared
    pub fn commit(&mut self) -> Result<()> {
        if self.state == TxState::Committed && self.read_only {
            return Ok(());
        }
        if self.state != TxState::Prepared {
            return Err(Error::transaction(format!(
                "transaction {} cannot commit from {:?}",
                self.id, self.state
            )));
        }
        self.state = TxState::Committing;

        let prepared = self.prepared.take().unwrap_or_default();
        let decision = {
            let mut wal = self.shared.wal.lock();
            wal.append(&WalEntry::Commit { tx_id: self.id })
                .and_then(|_| {
                    if self.shared.config.sync_on_prepare {
                        wal.sync()
                    } else {
                        wal.flush()
                    }
                })
        };
        if let Err(e) = decision {
            tracing::warn!("tx {} could not log its commit: {}", self.id, e);
            self.abort();
            return Err(e);
        }

        if let Err(e) = self.apply(&prepared) {
            tracing::warn!("tx {} failed to apply, restoring: {}", self.id, e);
            for image in &prepared.before {
                if let Err(restore) = apply::write_image(&self.shared.store, image) {
                    tracing::warn!("tx {} could not restore {:?}: {}", self.id, image, restore);
                }
            }
            self.abort();
            return Err(e);
        }

        let events = self.overlay.take_events();
        self.settle();
        self.release();
        self.state = TxState::Committed;
        tracing::debug!("tx {} committed", self.id);

        for listener in self.shared.listeners.read().iter() {
            listener.on_commit(self.id, &events);
        }
        Ok(())
    }

    fn apply(&self, prepared: &PreparedChanges) -> Result<()> {
        for entry in &prepared.dictionary {
            self.shared.persist_dictionary(entry)?;
        }
        for image in &prepared.after {
            apply::write_image(&self.shared.store, image)?;
        }
        Ok(())
    }

    /// Discard the overlay; legal before commit
    pub fn rollback(&mut self) -> Result<()> {
        match self.state {
            TxState::Active | TxState::Prepared => {}
            state => {
                return Err(Error::transaction(format!(
                    "transaction {} cannot roll back from {:?}",
                    self.id, state
                )));
            }
        }
        self.abort();
        tracing::debug!("tx {} rolled back", self.id);
        Ok(())
    }

    /// Log an abort if needed, drop locks and overlay
    fn abort(&mut self) {
        self.state = TxState::RollingBack;
        if self.logged {
            let mut wal = self.shared.wal.lock();
            if let Err(e) = wal
                .append(&WalEntry::Abort { tx_id: self.id })
                .and_then(|_| wal.flush())
            {
                // Recovery presumes undecided transactions aborted
                tracing::warn!("tx {} could not log its abort: {}", self.id, e);
            }
        }
        self.settle();
        self.release();
        self.state = TxState::RolledBack;
    }

    /// The WAL no longer needs this transaction's entries
    fn settle(&mut self) {
        if std::mem::take(&mut self.logged) {
            self.shared.undecided.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn release(&mut self) {
        self.locks.clear();
        self.prepared = None;
        self.overlay = TxOverlay::new();
    }

    /// Release the pooled connection; exactly once, after commit or rollback
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Err(Error::transaction(format!(
                "transaction {} already destroyed",
                self.id
            )));
        }
        if !self.state.is_terminal() {
            return Err(Error::transaction(format!(
                "transaction {} cannot be destroyed while {:?}",
                self.id, self.state
            )));
        }
        if let Some(connection) = self.connection.take() {
            connection.release();
        }
        self.destroyed = true;
        Ok(())
    }
}

impl Drop for StoreTransaction {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            tracing::debug!("tx {} dropped while {:?}, rolling back", self.id, self.state);
            self.abort();
        }
    }
}

impl ResourceManager for StoreTransaction {
    fn prepare(&mut self) -> Result<Vote> {
        StoreTransaction::prepare(self)
    }

    fn commit(&mut self) -> Result<()> {
        StoreTransaction::commit(self)
    }

    fn rollback(&mut self) -> Result<()> {
        StoreTransaction::rollback(self)
    }
}

fn describe(entity: EntityRef) -> String {
    match entity {
        EntityRef::Node(id) => format!("node {}", id),
        EntityRef::Relationship(id) => format!("relationship {}", id),
    }
}

fn property_not_found(entity: EntityRef, prop_id: u64) -> Error {
    Error::property_not_found(format!("property {} of {}", prop_id, describe(entity)))
}
