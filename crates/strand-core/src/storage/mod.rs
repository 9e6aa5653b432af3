//! Storage layer - record stores for nodes, relationships, and properties
//!
//! Fixed-size record stores, one memory-mapped file per kind:
//! - `nodes.store`: [`NodeRecord`] (first_rel, first_prop, flags)
//! - `rels.store`: [`RelationshipRecord`] (endpoints, two prev/next pairs, type, first_prop)
//! - `props.store`: [`PropertyRecord`] (prev/next within the owner's chain, key, inline value)
//! - `dynamic.store`: [`DynamicRecord`] overflow blocks for long strings and byte arrays
//!
//! A record lives at `id * RECORD_SIZE`. The store only knows durable state;
//! visibility of uncommitted work is the transaction overlay's business.

pub mod chain;
pub mod property;
pub mod record;
pub mod row_lock;

pub use chain::{ChainCursor, ChainPage, ChainPager, DirectionBuckets};
pub use property::{PropertyArray, PropertyKind, PropertyValue};
pub use record::{
    ChainSide, DynamicRecord, NIL, NodeRecord, PropertyRecord, RelationshipData,
    RelationshipRecord,
};
pub use row_lock::{ChainLockGuard, ChainLockManager, ResourceId};

use crate::ids::{self, IdGenerators, RecordKind};
use crate::{Error, Result};
use bytemuck::Pod;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;
use record::{
    DYNAMIC_PAYLOAD, DYNAMIC_RECORD_SIZE, NODE_RECORD_SIZE, PROP_RECORD_SIZE, REL_RECORD_SIZE,
};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// A record type that can live in a fixed-size store
pub trait StoreRecord: Pod + Default {
    /// Bytes per slot
    const SIZE: usize;
    /// Which store and id generator the record belongs to
    const KIND: RecordKind;
    /// Slot holds a live record
    fn is_live(&self) -> bool;
}

impl StoreRecord for NodeRecord {
    const SIZE: usize = NODE_RECORD_SIZE;
    const KIND: RecordKind = RecordKind::Node;
    fn is_live(&self) -> bool {
        self.in_use()
    }
}

impl StoreRecord for RelationshipRecord {
    const SIZE: usize = REL_RECORD_SIZE;
    const KIND: RecordKind = RecordKind::Relationship;
    fn is_live(&self) -> bool {
        self.in_use()
    }
}

impl StoreRecord for PropertyRecord {
    const SIZE: usize = PROP_RECORD_SIZE;
    const KIND: RecordKind = RecordKind::Property;
    fn is_live(&self) -> bool {
        self.in_use()
    }
}

impl StoreRecord for DynamicRecord {
    const SIZE: usize = DYNAMIC_RECORD_SIZE;
    const KIND: RecordKind = RecordKind::Dynamic;
    fn is_live(&self) -> bool {
        self.in_use()
    }
}

/// Memory-mapped file wrapper
struct MappedFile {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
    current_size: usize,
}

impl MappedFile {
    /// Create or open a memory-mapped file
    fn new<P: AsRef<Path>>(path: P, initial_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let current_size = file.metadata()?.len() as usize;
        let current_size = if current_size == 0 {
            file.set_len(initial_size as u64)?;
            initial_size
        } else {
            current_size
        };

        let mmap = unsafe { MmapOptions::new().len(current_size).map_mut(&file)? };

        Ok(Self {
            file,
            mmap,
            path,
            current_size,
        })
    }

    /// Grow the file to `new_size` bytes and remap it
    fn resize(&mut self, new_size: usize) -> Result<()> {
        self.mmap.flush()?;

        // The old map must be gone before the file length changes
        drop(std::mem::replace(&mut self.mmap, MmapMut::map_anon(1)?));

        self.file.set_len(new_size as u64)?;
        self.current_size = new_size;
        self.mmap = unsafe { MmapOptions::new().len(new_size).map_mut(&self.file)? };

        tracing::debug!("Grew {:?} to {} bytes", self.path, new_size);
        Ok(())
    }

    fn slots<R: StoreRecord>(&self) -> u64 {
        (self.current_size / R::SIZE) as u64
    }

    /// Raw record at `id`, a default (not in use) record past the end of the file
    fn read<R: StoreRecord>(&self, id: u64) -> R {
        if id >= self.slots::<R>() {
            return R::default();
        }
        let offset = id as usize * R::SIZE;
        bytemuck::pod_read_unaligned::<R>(&self.mmap[offset..offset + R::SIZE])
    }

    /// Write `record` at `id`, doubling the file as needed
    fn write<R: StoreRecord>(&mut self, id: u64, record: &R) -> Result<()> {
        let out_of_range = || Error::storage(format!("{} id {} out of range", R::KIND, id));
        let offset = usize::try_from(id)
            .ok()
            .and_then(|id| id.checked_mul(R::SIZE))
            .ok_or_else(out_of_range)?;
        let required_size = offset.checked_add(R::SIZE).ok_or_else(out_of_range)?;

        if required_size > self.current_size {
            let new_size = (self.current_size * 2).max(required_size);
            self.resize(new_size)?;
        }

        self.mmap[offset..offset + R::SIZE].copy_from_slice(bytemuck::bytes_of(record));
        Ok(())
    }

    /// One past the highest slot holding a live record
    fn high_id<R: StoreRecord>(&self) -> u64 {
        (0..self.slots::<R>())
            .rev()
            .find(|&id| self.read::<R>(id).is_live())
            .map_or(0, |id| id + 1)
    }

    fn flush(&mut self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

/// Record store manager
pub struct RecordStore {
    data_dir: PathBuf,
    nodes: RwLock<MappedFile>,
    rels: RwLock<MappedFile>,
    props: RwLock<MappedFile>,
    dynamic: RwLock<MappedFile>,
    ids: IdGenerators,
}

impl RecordStore {
    /// Open (or create) the record stores under `data_dir`
    ///
    /// Each id generator resumes one past the highest live record.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use strand_core::storage::RecordStore;
    ///
    /// let store = RecordStore::open("./data", 1024 * 1024).unwrap();
    /// ```
    pub fn open<P: AsRef<Path>>(data_dir: P, initial_size: usize) -> Result<Self> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&data_dir)?;

        let nodes = MappedFile::new(data_dir.join("nodes.store"), initial_size)?;
        let rels = MappedFile::new(data_dir.join("rels.store"), initial_size)?;
        let props = MappedFile::new(data_dir.join("props.store"), initial_size)?;
        let dynamic = MappedFile::new(data_dir.join("dynamic.store"), initial_size)?;

        let ids = IdGenerators::resume(
            nodes.high_id::<NodeRecord>(),
            rels.high_id::<RelationshipRecord>(),
            props.high_id::<PropertyRecord>(),
            dynamic.high_id::<DynamicRecord>(),
        );

        tracing::info!(
            "Opened record store at {:?} (nodes={}, rels={}, props={})",
            data_dir,
            ids.get(RecordKind::Node).high_id(),
            ids.get(RecordKind::Relationship).high_id(),
            ids.get(RecordKind::Property).high_id(),
        );

        Ok(Self {
            data_dir,
            nodes: RwLock::new(nodes),
            rels: RwLock::new(rels),
            props: RwLock::new(props),
            dynamic: RwLock::new(dynamic),
            ids,
        })
    }

    /// Directory holding the store files
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Allocate a fresh id of `kind`
    pub fn allocate(&self, kind: RecordKind) -> Result<u64> {
        self.ids.get(kind).next_id()
    }

    /// Store-wide id generators
    pub fn ids(&self) -> &IdGenerators {
        &self.ids
    }

    fn file(&self, kind: RecordKind) -> &RwLock<MappedFile> {
        match kind {
            RecordKind::Node => &self.nodes,
            RecordKind::Relationship => &self.rels,
            RecordKind::Property => &self.props,
            RecordKind::Dynamic => &self.dynamic,
        }
    }

    /// Raw record, live or not
    pub fn try_read<R: StoreRecord>(&self, id: u64) -> R {
        self.file(R::KIND).read().read::<R>(id)
    }

    /// Live record, or `NotFound`
    pub fn read<R: StoreRecord>(&self, id: u64) -> Result<R> {
        let record = self.try_read::<R>(id);
        if record.is_live() {
            Ok(record)
        } else {
            Err(Error::not_found(format!("{} {}", R::KIND, id)))
        }
    }

    /// Write a record; the id is never handed out again by the generator
    pub fn write<R: StoreRecord>(&self, id: u64, record: &R) -> Result<()> {
        ids::check_id(R::KIND, id)?;
        self.file(R::KIND).write().write(id, record)?;
        self.ids.get(R::KIND).mark_used(id);
        Ok(())
    }

    /// Read a live node record
    pub fn read_node(&self, id: u64) -> Result<NodeRecord> {
        self.read(id)
    }

    /// Read a live relationship record
    pub fn read_rel(&self, id: u64) -> Result<RelationshipRecord> {
        self.read(id)
    }

    /// Read a live property record
    pub fn read_prop(&self, id: u64) -> Result<PropertyRecord> {
        self.read(id)
    }

    /// Node slot holds a live node
    pub fn node_exists(&self, id: u64) -> bool {
        self.try_read::<NodeRecord>(id).in_use()
    }

    /// Relationship slot holds a live relationship
    pub fn rel_exists(&self, id: u64) -> bool {
        self.try_read::<RelationshipRecord>(id).in_use()
    }

    /// Clear the in-use bit of a record, leaving its pointers in place
    pub fn mark_deleted(&self, kind: RecordKind, id: u64) -> Result<()> {
        match kind {
            RecordKind::Node => {
                let mut record = self.read::<NodeRecord>(id)?;
                record.set_deleted();
                self.write(id, &record)
            }
            RecordKind::Relationship => {
                let mut record = self.read::<RelationshipRecord>(id)?;
                record.set_deleted();
                self.write(id, &record)
            }
            RecordKind::Property => {
                let mut record = self.read::<PropertyRecord>(id)?;
                record.set_deleted();
                self.write(id, &record)
            }
            RecordKind::Dynamic => {
                let mut record = self.read::<DynamicRecord>(id)?;
                record.set_deleted();
                self.write(id, &record)
            }
        }
    }

    /// Ids of the dynamic blocks of a value, head first
    pub fn dynamic_chain_ids(&self, head: u64) -> Result<Vec<u64>> {
        let limit = self.ids.get(RecordKind::Dynamic).high_id();
        let mut ids = Vec::new();
        let mut current = head;
        while current != NIL {
            if ids.len() as u64 > limit {
                return Err(Error::storage(format!("dynamic chain from {} loops", head)));
            }
            let block = self.read::<DynamicRecord>(current)?;
            ids.push(current);
            current = block.next;
        }
        Ok(ids)
    }

    /// Concatenated bytes of the dynamic chain starting at `head`
    pub fn read_dynamic_chain(&self, head: u64) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        for id in self.dynamic_chain_ids(head)? {
            let block = self.read::<DynamicRecord>(id)?;
            bytes.extend_from_slice(block.chunk());
        }
        Ok(bytes)
    }

    /// Decode the value of a live property record
    pub fn load_value(&self, record: &PropertyRecord) -> Result<PropertyValue> {
        property::decode(record, |head| self.read_dynamic_chain(head))
    }

    /// Ids of the live property records reachable from `head`
    pub fn property_chain(&self, head: u64) -> Result<Vec<(u64, PropertyRecord)>> {
        let limit = self.ids.get(RecordKind::Property).high_id();
        let mut chain = Vec::new();
        let mut current = head;
        while current != NIL {
            if chain.len() as u64 > limit {
                return Err(Error::storage(format!("property chain from {} loops", head)));
            }
            let record = self.read::<PropertyRecord>(current)?;
            chain.push((current, record));
            current = record.next;
        }
        Ok(chain)
    }

    /// Flush all stores to disk
    pub fn flush(&self) -> Result<()> {
        self.nodes.write().flush()?;
        self.rels.write().flush()?;
        self.props.write().flush()?;
        self.dynamic.write().flush()?;
        Ok(())
    }

    /// Get statistics
    pub fn stats(&self) -> RecordStoreStats {
        RecordStoreStats {
            node_high_id: self.ids.get(RecordKind::Node).high_id(),
            rel_high_id: self.ids.get(RecordKind::Relationship).high_id(),
            prop_high_id: self.ids.get(RecordKind::Property).high_id(),
            dynamic_high_id: self.ids.get(RecordKind::Dynamic).high_id(),
            nodes_file_size: self.nodes.read().current_size,
            rels_file_size: self.rels.read().current_size,
        }
    }
}

/// Split overflow bytes into dynamic blocks linked head first
pub fn dynamic_blocks(bytes: &[u8], ids: &[u64]) -> Vec<(u64, DynamicRecord)> {
    let chunks: Vec<&[u8]> = if bytes.is_empty() {
        vec![&[][..]]
    } else {
        bytes.chunks(DYNAMIC_PAYLOAD).collect()
    };
    debug_assert_eq!(chunks.len(), ids.len());
    chunks
        .iter()
        .zip(ids)
        .enumerate()
        .map(|(i, (chunk, &id))| {
            let next = ids.get(i + 1).copied().unwrap_or(NIL);
            (id, DynamicRecord::with_chunk(chunk, next))
        })
        .collect()
}

/// Number of dynamic blocks needed for `len` overflow bytes
pub fn dynamic_block_count(len: usize) -> usize {
    len.div_ceil(DYNAMIC_PAYLOAD).max(1)
}

/// Record store statistics
#[derive(Debug, Clone)]
pub struct RecordStoreStats {
    /// One past the highest node id handed out
    pub node_high_id: u64,
    /// One past the highest relationship id handed out
    pub rel_high_id: u64,
    /// One past the highest property id handed out
    pub prop_high_id: u64,
    /// One past the highest dynamic record id handed out
    pub dynamic_high_id: u64,
    /// Size of nodes.store in bytes
    pub nodes_file_size: usize,
    /// Size of rels.store in bytes
    pub rels_file_size: usize,
}
