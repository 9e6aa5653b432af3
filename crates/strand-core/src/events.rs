//! Delta events for downstream indexes
//!
//! Every successful mutation of a transaction appends one event, in call
//! order. After a commit the whole list is handed to each registered
//! [`DeltaListener`]; a rolled-back transaction dispatches nothing.

use crate::catalog::{KeyId, TypeId};
use crate::storage::PropertyValue;

/// Entity a property event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityRef {
    /// Node id
    Node(u64),
    /// Relationship id
    Relationship(u64),
}

/// A single observable change
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaEvent {
    /// Node created
    NodeCreated {
        /// Node id
        node_id: u64,
    },
    /// Node deleted
    NodeDeleted {
        /// Node id
        node_id: u64,
    },
    /// Relationship created
    RelationshipCreated {
        /// Relationship id
        rel_id: u64,
        /// Type id
        type_id: TypeId,
        /// Start node
        start_node: u64,
        /// End node
        end_node: u64,
    },
    /// Relationship deleted
    RelationshipDeleted {
        /// Relationship id
        rel_id: u64,
    },
    /// Property added
    PropertyAdded {
        /// Owner
        entity: EntityRef,
        /// Property id
        prop_id: u64,
        /// Key id
        key_id: KeyId,
        /// New value
        value: PropertyValue,
    },
    /// Property value replaced
    PropertyChanged {
        /// Owner
        entity: EntityRef,
        /// Property id
        prop_id: u64,
        /// Key id
        key_id: KeyId,
        /// Previous value
        old: PropertyValue,
        /// New value
        new: PropertyValue,
    },
    /// Property removed
    PropertyRemoved {
        /// Owner
        entity: EntityRef,
        /// Property id
        prop_id: u64,
        /// Key id
        key_id: KeyId,
        /// Value before removal
        old: PropertyValue,
    },
}

impl DeltaEvent {
    /// Entity the event is about
    pub fn entity(&self) -> EntityRef {
        match self {
            Self::NodeCreated { node_id } | Self::NodeDeleted { node_id } => {
                EntityRef::Node(*node_id)
            }
            Self::RelationshipCreated { rel_id, .. } | Self::RelationshipDeleted { rel_id } => {
                EntityRef::Relationship(*rel_id)
            }
            Self::PropertyAdded { entity, .. }
            | Self::PropertyChanged { entity, .. }
            | Self::PropertyRemoved { entity, .. } => *entity,
        }
    }
}

/// Receiver of committed deltas
pub trait DeltaListener: Send + Sync {
    /// Called once per committed transaction with its events in call order
    fn on_commit(&self, tx_id: u64, events: &[DeltaEvent]);
}

/// Listener that keeps every delivered batch, for tests and diagnostics
#[derive(Debug, Default)]
pub struct RecordingListener {
    batches: parking_lot::Mutex<Vec<(u64, Vec<DeltaEvent>)>>,
}

impl RecordingListener {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Batches received so far
    pub fn batches(&self) -> Vec<(u64, Vec<DeltaEvent>)> {
        self.batches.lock().clone()
    }
}

impl DeltaListener for RecordingListener {
    fn on_commit(&self, tx_id: u64, events: &[DeltaEvent]) {
        self.batches.lock().push((tx_id, events.to_vec()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_of_event() {
        let event = DeltaEvent::PropertyRemoved {
            entity: EntityRef::Relationship(4),
            prop_id: 1,
            key_id: 0,
            old: PropertyValue::Int(1),
        };
        assert_eq!(event.entity(), EntityRef::Relationship(4));
        assert_eq!(
            DeltaEvent::NodeCreated { node_id: 2 }.entity(),
            EntityRef::Node(2)
        );
    }

    #[test]
    fn test_recording_listener() {
        let listener = RecordingListener::new();
        listener.on_commit(3, &[DeltaEvent::NodeDeleted { node_id: 1 }]);
        let batches = listener.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, 3);
    }
}
