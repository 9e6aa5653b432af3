//! Store root - opens the record stores, registry and WAL, runs recovery
//!
//! ```text
//! data_dir/
//!   nodes.store  rels.store  props.store  dynamic.store
//!   wal.log
//!   catalog/     (LMDB)
//! ```

use crate::catalog::Registry;
use crate::config::StoreConfig;
use crate::events::DeltaListener;
use crate::storage::{ChainLockManager, ChainPager, RecordStore, RecordStoreStats};
use crate::transaction::{StoreTransaction, apply};
use crate::wal::{DictionaryEntry, RecoveryPlan, Wal};
use crate::{Error, Result};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// State shared by a store and all of its transactions
pub(crate) struct StoreShared {
    pub(crate) config: StoreConfig,
    pub(crate) store: RecordStore,
    pub(crate) registry: Registry,
    pub(crate) wal: Mutex<Wal>,
    pub(crate) locks: ChainLockManager,
    pub(crate) pager: ChainPager,
    pub(crate) listeners: RwLock<Vec<Arc<dyn DeltaListener>>>,
    /// Transactions with a `Begin` in the WAL and no applied outcome yet
    pub(crate) undecided: AtomicUsize,
    next_tx_id: AtomicU64,
}

impl StoreShared {
    pub(crate) fn persist_dictionary(&self, entry: &DictionaryEntry) -> Result<()> {
        match entry {
            DictionaryEntry::PropertyKey { id, name } => self.registry.persist_key(*id, name),
            DictionaryEntry::RelationshipType { id, name } => {
                self.registry.persist_type(*id, name)
            }
        }
    }
}

/// Counters describing an open store
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// Record store high-water marks and file sizes
    pub records: RecordStoreStats,
    /// Bytes in the WAL since the last checkpoint
    pub wal_bytes: u64,
    /// Chain locks currently held
    pub held_locks: usize,
    /// Transactions logged but not yet settled
    pub undecided_transactions: usize,
}

/// An open graph store
///
/// Cheap to clone; clones share the same files and locks.
#[derive(Clone)]
pub struct GraphStore {
    shared: Arc<StoreShared>,
}

impl GraphStore {
    /// Open (or create) a store and replay committed transactions from the WAL
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use strand_core::{GraphStore, StoreConfig};
    ///
    /// let store = GraphStore::open(StoreConfig::with_data_dir("./data")).unwrap();
    /// let mut tx = store.begin();
    /// let node = tx.allocate_node_id().unwrap();
    /// tx.create_node(node).unwrap();
    /// tx.prepare().unwrap();
    /// tx.commit().unwrap();
    /// ```
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let data_dir = config.data_dir.clone();
        std::fs::create_dir_all(&data_dir)?;

        let store = RecordStore::open(&data_dir, config.initial_store_size)?;
        let registry = Registry::open(data_dir.join("catalog"), config.catalog_map_size)?;
        let mut wal = Wal::open(data_dir.join("wal.log"))?;
        let plan = wal.recover()?;

        let shared = Arc::new(StoreShared {
            locks: ChainLockManager::new(config.lock_timeout()),
            pager: ChainPager::new(config.chain_batch_size),
            store,
            registry,
            wal: Mutex::new(wal),
            listeners: RwLock::new(Vec::new()),
            undecided: AtomicUsize::new(0),
            next_tx_id: AtomicU64::new(plan.max_tx_id + 1),
            config,
        });
        let graph = Self { shared };

        if !plan.undecided.is_empty() {
            tracing::warn!(
                "Discarding {} prepared transactions without a decision: {:?}",
                plan.undecided.len(),
                plan.undecided
            );
        }
        let replayed = graph.replay(&plan)?;
        graph.checkpoint()?;

        tracing::info!(
            "Opened graph store at {:?} (replayed {} transactions)",
            data_dir,
            replayed
        );
        Ok(graph)
    }

    /// Write the committed changes of `plan` to the record stores
    ///
    /// Images are complete records, so replaying the same plan again leaves
    /// the store unchanged. Returns the number of transactions replayed.
    pub fn replay(&self, plan: &RecoveryPlan) -> Result<usize> {
        for tx in &plan.committed {
            for entry in &tx.dictionary {
                self.shared.persist_dictionary(entry)?;
            }
            for image in &tx.images {
                apply::write_image(&self.shared.store, image)?;
            }
            tracing::debug!("Replayed tx {} ({} images)", tx.tx_id, tx.images.len());
        }
        Ok(plan.committed.len())
    }

    /// Start a transaction
    pub fn begin(&self) -> StoreTransaction {
        let id = self.shared.next_tx_id.fetch_add(1, Ordering::SeqCst);
        StoreTransaction::new(id, Arc::clone(&self.shared))
    }

    /// Flush the record stores and registry, then truncate the WAL
    ///
    /// Fails while any transaction is prepared but not yet settled, since its
    /// log entries are still the only durable copy of its decision.
    pub fn checkpoint(&self) -> Result<()> {
        let mut wal = self.shared.wal.lock();
        let undecided = self.shared.undecided.load(Ordering::SeqCst);
        if undecided > 0 {
            return Err(Error::storage(format!(
                "cannot checkpoint with {} transactions in flight",
                undecided
            )));
        }

        self.shared.store.flush()?;
        self.shared.registry.sync()?;
        let bytes = wal.len();
        wal.truncate()?;
        tracing::debug!("Checkpoint complete, {} WAL bytes released", bytes);
        Ok(())
    }

    /// Receive the events of every future commit
    pub fn register_listener(&self, listener: Arc<dyn DeltaListener>) {
        self.shared.listeners.write().push(listener);
    }

    /// Property key and relationship type dictionaries
    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Underlying record store
    pub fn store(&self) -> &RecordStore {
        &self.shared.store
    }

    /// Configuration the store was opened with
    pub fn config(&self) -> &StoreConfig {
        &self.shared.config
    }

    /// Scan the current WAL without changing it
    pub fn recovery_plan(&self) -> Result<RecoveryPlan> {
        self.shared.wal.lock().recover()
    }

    /// Current counters
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            records: self.shared.store.stats(),
            wal_bytes: self.shared.wal.lock().len(),
            held_locks: self.shared.locks.stats().total_resources,
            undecided_transactions: self.shared.undecided.load(Ordering::SeqCst),
        }
    }
}

impl std::fmt::Debug for GraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphStore")
            .field("data_dir", &self.shared.config.data_dir)
            .finish()
    }
}
