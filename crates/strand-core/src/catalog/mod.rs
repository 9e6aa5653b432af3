//! Catalog module - property key and relationship type dictionaries
//!
//! The registry maintains two append-only dictionaries:
//! - Property keys (name) ↔ KeyId
//! - Relationship types (name) ↔ TypeId
//!
//! # Architecture
//!
//! Committed entries live in LMDB (`key_id_to_name`, `type_id_to_name`) and
//! are loaded fully into lock-free caches at open. Creating an entry from a
//! transaction only *reserves* it in memory: the id is fixed at once, so
//! racing creators of the same name converge, but nothing is persisted or
//! listed until a transaction that staged the entry commits. A reservation
//! whose transaction rolls back stays in memory and is simply reused by the
//! next creator of that name.

use crate::{Error, Result};
use dashmap::DashMap;
use heed::types::*;
use heed::{Database, Env, EnvOpenOptions, byteorder};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Relationship type ID
pub type TypeId = u32;

/// Property key ID
pub type KeyId = u32;

/// A committed property key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyKeyData {
    /// Key id
    pub id: KeyId,
    /// Key name
    pub key: String,
}

/// A committed relationship type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipTypeData {
    /// Type id
    pub id: TypeId,
    /// Type name
    pub name: String,
}

/// Names reserved so far (committed or not) and the next free id
#[derive(Debug, Default)]
struct Reservations {
    by_name: HashMap<String, u32>,
    next_id: u32,
}

/// One append-only name dictionary
struct Dictionary {
    label: &'static str,
    db: Database<U32<byteorder::NativeEndian>, Str>,
    /// Committed id → name (lock-free)
    committed: DashMap<u32, String>,
    reservations: Mutex<Reservations>,
}

impl Dictionary {
    fn load(
        env: &Env,
        label: &'static str,
        db: Database<U32<byteorder::NativeEndian>, Str>,
    ) -> Result<Self> {
        let committed = DashMap::new();
        let mut reservations = Reservations::default();
        {
            let rtxn = env.read_txn()?;
            for result in db.iter(&rtxn)? {
                let (id, name) = result?;
                committed.insert(id, name.to_string());
                reservations.by_name.insert(name.to_string(), id);
                reservations.next_id = reservations.next_id.max(id + 1);
            }
        }

        Ok(Self {
            label,
            db,
            committed,
            reservations: Mutex::new(reservations),
        })
    }

    /// Insert-or-return-existing; the dictionary-wide lock makes racers converge
    fn reserve(&self, name: &str) -> Result<u32> {
        let mut reservations = self.reservations.lock();
        if let Some(&id) = reservations.by_name.get(name) {
            return Ok(id);
        }

        let id = reservations.next_id;
        reservations.next_id = id
            .checked_add(1)
            .ok_or_else(|| Error::catalog(format!("{} ids exhausted", self.label)))?;
        reservations.by_name.insert(name.to_string(), id);

        tracing::debug!("Reserved {} {:?} as {}", self.label, name, id);
        Ok(id)
    }

    /// Write a reserved entry to LMDB; a no-op if it is already committed
    fn persist(&self, env: &Env, id: u32, name: &str) -> Result<()> {
        if let Some(existing) = self.committed.get(&id) {
            if existing.as_str() == name {
                return Ok(());
            }
            return Err(Error::catalog(format!(
                "{} {} is {:?}, not {:?}",
                self.label,
                id,
                existing.as_str(),
                name
            )));
        }

        let mut wtxn = env.write_txn()?;
        self.db.put(&mut wtxn, &id, name)?;
        wtxn.commit()?;

        self.committed.insert(id, name.to_string());

        // Replayed entries may come from a log written before this process
        let mut reservations = self.reservations.lock();
        reservations.by_name.entry(name.to_string()).or_insert(id);
        reservations.next_id = reservations.next_id.max(id.saturating_add(1));
        Ok(())
    }

    fn name(&self, id: u32) -> Option<String> {
        self.committed.get(&id).map(|name| name.clone())
    }

    fn is_committed(&self, id: u32) -> bool {
        self.committed.contains_key(&id)
    }

    fn committed_sorted(&self) -> Vec<(u32, String)> {
        let mut entries: Vec<_> = self
            .committed
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        entries.sort_unstable_by_key(|(id, _)| *id);
        entries
    }

    fn len(&self) -> usize {
        self.committed.len()
    }
}

/// Registry of property keys and relationship types
///
/// Thread-safe; shared by every transaction of one store.
#[derive(Clone)]
pub struct Registry {
    /// LMDB environment
    env: Arc<Env>,
    keys: Arc<Dictionary>,
    types: Arc<Dictionary>,
}

impl Registry {
    /// Open or create the registry at `path`
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use strand_core::catalog::Registry;
    ///
    /// let registry = Registry::open("./data/catalog", 10 * 1024 * 1024).unwrap();
    /// ```
    pub fn open<P: AsRef<Path>>(path: P, map_size: usize) -> Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(4)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let key_id_to_name = env.create_database(&mut wtxn, Some("key_id_to_name"))?;
        let type_id_to_name = env.create_database(&mut wtxn, Some("type_id_to_name"))?;
        wtxn.commit()?;

        let keys = Dictionary::load(&env, "property key", key_id_to_name)?;
        let types = Dictionary::load(&env, "relationship type", type_id_to_name)?;

        tracing::info!(
            "Opened registry at {:?} ({} keys, {} types)",
            path,
            keys.len(),
            types.len()
        );

        Ok(Self {
            env: Arc::new(env),
            keys: Arc::new(keys),
            types: Arc::new(types),
        })
    }

    /// Reserve (or look up) the id for a property key name
    pub fn reserve_key(&self, name: &str) -> Result<KeyId> {
        self.keys.reserve(name)
    }

    /// Reserve (or look up) the id for a relationship type name
    pub fn reserve_type(&self, name: &str) -> Result<TypeId> {
        self.types.reserve(name)
    }

    /// Durably record a property key; idempotent
    pub fn persist_key(&self, id: KeyId, name: &str) -> Result<()> {
        self.keys.persist(&self.env, id, name)
    }

    /// Durably record a relationship type; idempotent
    pub fn persist_type(&self, id: TypeId, name: &str) -> Result<()> {
        self.types.persist(&self.env, id, name)
    }

    /// Committed name of a property key
    pub fn key_name(&self, id: KeyId) -> Option<String> {
        self.keys.name(id)
    }

    /// Committed name of a relationship type
    pub fn type_name(&self, id: TypeId) -> Option<String> {
        self.types.name(id)
    }

    /// Property key has been committed
    pub fn is_key_committed(&self, id: KeyId) -> bool {
        self.keys.is_committed(id)
    }

    /// Relationship type has been committed
    pub fn is_type_committed(&self, id: TypeId) -> bool {
        self.types.is_committed(id)
    }

    /// Up to `max_count` committed property keys, in id order
    pub fn load_property_indexes(&self, max_count: usize) -> Vec<PropertyKeyData> {
        self.keys
            .committed_sorted()
            .into_iter()
            .take(max_count)
            .map(|(id, key)| PropertyKeyData { id, key })
            .collect()
    }

    /// All committed relationship types, in id order
    pub fn load_relationship_types(&self) -> Vec<RelationshipTypeData> {
        self.types
            .committed_sorted()
            .into_iter()
            .map(|(id, name)| RelationshipTypeData { id, name })
            .collect()
    }

    /// Force LMDB to disk
    pub fn sync(&self) -> Result<()> {
        self.env.force_sync()?;
        Ok(())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("keys", &self.keys.len())
            .field("types", &self.types.len())
            .finish()
    }
}
