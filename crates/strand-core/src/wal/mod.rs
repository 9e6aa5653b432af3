//! Write-Ahead Log (WAL) - Transaction durability
//!
//! A prepared transaction logs full after-images of every record it will
//! rewrite, the dictionary entries it created, and a `Prepare` marker. The
//! decision follows as `Commit` or `Abort`. Recovery replays the images of
//! transactions that have a `Commit` and no later `Abort`; a transaction that
//! was prepared but never decided is presumed aborted. Because entries are
//! after-images, replaying a log more than once leaves the same store.
//!
//! File layout: 16-byte header (magic, version, reserved) followed by frames
//! of `[len: u32][bincode entry][crc32: u32]`, little-endian.

use crate::storage::{DynamicRecord, NodeRecord, PropertyRecord, RelationshipRecord};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const WAL_MAGIC: [u8; 8] = *b"STRNDWAL";

const WAL_VERSION: u32 = 1;

/// 8 bytes magic + 4 bytes version + 4 bytes reserved
const HEADER_SIZE: u64 = 16;

/// Largest frame accepted on read
const MAX_FRAME: usize = 64 * 1024 * 1024;

/// Full contents of one record after a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordImage {
    /// Node record
    Node {
        /// Node id
        id: u64,
        /// Record contents
        record: NodeRecord,
    },
    /// Relationship record
    Relationship {
        /// Relationship id
        id: u64,
        /// Record contents
        record: RelationshipRecord,
    },
    /// Property record
    Property {
        /// Property id
        id: u64,
        /// Record contents
        record: PropertyRecord,
    },
    /// Dynamic overflow block
    Dynamic {
        /// Block id
        id: u64,
        /// Record contents
        record: DynamicRecord,
    },
}

/// A dictionary entry created by a transaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DictionaryEntry {
    /// Property key name
    PropertyKey {
        /// Key id
        id: u32,
        /// Key name
        name: String,
    },
    /// Relationship type name
    RelationshipType {
        /// Type id
        id: u32,
        /// Type name
        name: String,
    },
}

/// WAL entry types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalEntry {
    /// Transaction starts logging its changes
    Begin {
        /// Transaction ID
        tx_id: u64,
    },
    /// Record after-image
    Record {
        /// Transaction ID
        tx_id: u64,
        /// Image to write
        image: RecordImage,
    },
    /// Dictionary entry to persist
    Dictionary {
        /// Transaction ID
        tx_id: u64,
        /// Entry
        entry: DictionaryEntry,
    },
    /// All changes of the transaction are logged
    Prepare {
        /// Transaction ID
        tx_id: u64,
    },
    /// Commit decision
    Commit {
        /// Transaction ID
        tx_id: u64,
    },
    /// Abort decision (also written after a failed apply)
    Abort {
        /// Transaction ID
        tx_id: u64,
    },
}

impl WalEntry {
    /// Transaction the entry belongs to
    pub fn tx_id(&self) -> u64 {
        match self {
            Self::Begin { tx_id }
            | Self::Record { tx_id, .. }
            | Self::Dictionary { tx_id, .. }
            | Self::Prepare { tx_id }
            | Self::Commit { tx_id }
            | Self::Abort { tx_id } => *tx_id,
        }
    }
}

/// Changes of one committed transaction, ready to replay
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommittedTransaction {
    /// Transaction ID
    pub tx_id: u64,
    /// Record after-images in log order
    pub images: Vec<RecordImage>,
    /// Dictionary entries in log order
    pub dictionary: Vec<DictionaryEntry>,
}

/// Result of scanning a log
#[derive(Debug, Clone, Default)]
pub struct RecoveryPlan {
    /// Committed transactions in commit order
    pub committed: Vec<CommittedTransaction>,
    /// Prepared transactions with no decision (presumed aborted)
    pub undecided: Vec<u64>,
    /// Highest transaction id seen
    pub max_tx_id: u64,
}

/// Write-Ahead Log manager
pub struct Wal {
    path: PathBuf,
    writer: BufWriter<File>,
    position: u64,
}

impl Wal {
    /// Open or create the log at `path`, dropping any torn tail
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let exists = path.exists() && std::fs::metadata(&path)?.len() > 0;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let position = if exists {
            let (_, valid_end) = Self::scan(&path)?;
            let len = file.metadata()?.len();
            if valid_end < len {
                tracing::warn!(
                    "Discarding {} bytes of torn WAL tail in {:?}",
                    len - valid_end,
                    path
                );
                file.set_len(valid_end)?;
            }
            valid_end
        } else {
            Self::write_header(&file)?;
            HEADER_SIZE
        };

        let mut writer = BufWriter::new(file);
        writer.seek(SeekFrom::Start(position))?;

        Ok(Self {
            path,
            writer,
            position,
        })
    }

    fn write_header(mut file: &File) -> Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&WAL_MAGIC)?;
        file.write_all(&WAL_VERSION.to_le_bytes())?;
        file.write_all(&[0u8; 4])?;
        file.sync_all()?;
        Ok(())
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of valid log, header included
    pub fn len(&self) -> u64 {
        self.position
    }

    /// Log holds no entries
    pub fn is_empty(&self) -> bool {
        self.position <= HEADER_SIZE
    }

    /// Append an entry; returns its offset
    pub fn append(&mut self, entry: &WalEntry) -> Result<u64> {
        let data = bincode::serialize(entry)?;
        let len = u32::try_from(data.len())
            .map_err(|_| Error::wal(format!("entry of {} bytes too large", data.len())))?;
        let crc = crc32fast::hash(&data);

        self.writer.write_all(&len.to_le_bytes())?;
        self.writer.write_all(&data)?;
        self.writer.write_all(&crc.to_le_bytes())?;

        let offset = self.position;
        self.position += 4 + data.len() as u64 + 4;
        Ok(offset)
    }

    /// Flush WAL to disk (fsync)
    pub fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Flush buffered frames to the OS without fsync
    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    /// Drop every entry; callers flush the record store first
    pub fn truncate(&mut self) -> Result<()> {
        self.writer.flush()?;
        let file = self.writer.get_mut();
        file.set_len(HEADER_SIZE)?;
        file.sync_all()?;
        self.writer.seek(SeekFrom::Start(HEADER_SIZE))?;
        self.position = HEADER_SIZE;
        tracing::info!("Truncated WAL {:?}", self.path);
        Ok(())
    }

    /// Every intact entry in the log
    pub fn entries(&mut self) -> Result<Vec<WalEntry>> {
        self.writer.flush()?;
        Ok(Self::scan(&self.path)?.0)
    }

    /// Scan the log and decide what to replay
    pub fn recover(&mut self) -> Result<RecoveryPlan> {
        let entries = self.entries()?;
        Ok(plan(&entries))
    }

    /// Read intact entries and the offset just past the last one
    fn scan(path: &Path) -> Result<(Vec<WalEntry>, u64)> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;

        if bytes.len() < HEADER_SIZE as usize {
            return Err(Error::wal(format!("{:?} too small for header", path)));
        }
        if bytes[..8] != WAL_MAGIC {
            return Err(Error::wal(format!("{:?} is not a WAL file", path)));
        }
        let version = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        if version != WAL_VERSION {
            return Err(Error::wal(format!(
                "unsupported WAL version {}, expected {}",
                version, WAL_VERSION
            )));
        }

        let mut entries = Vec::new();
        let mut offset = HEADER_SIZE as usize;
        while let Some((entry, next)) = read_frame(&bytes, offset) {
            entries.push(entry);
            offset = next;
        }

        if offset < bytes.len() {
            tracing::warn!("WAL {:?} ends with an unreadable frame at {}", path, offset);
        }
        Ok((entries, offset as u64))
    }
}

/// Decode the frame at `offset`; `None` at the end or at a torn/corrupt frame
fn read_frame(bytes: &[u8], offset: usize) -> Option<(WalEntry, usize)> {
    let len_end = offset.checked_add(4)?;
    let len = u32::from_le_bytes(bytes.get(offset..len_end)?.try_into().ok()?) as usize;
    if len == 0 || len > MAX_FRAME {
        return None;
    }
    let data_end = len_end.checked_add(len)?;
    let data = bytes.get(len_end..data_end)?;
    let crc_end = data_end.checked_add(4)?;
    let stored_crc = u32::from_le_bytes(bytes.get(data_end..crc_end)?.try_into().ok()?);
    if stored_crc != crc32fast::hash(data) {
        return None;
    }
    let entry = bincode::deserialize(data).ok()?;
    Some((entry, crc_end))
}

/// Group entries by transaction and keep the committed ones
pub fn plan(entries: &[WalEntry]) -> RecoveryPlan {
    let mut pending: HashMap<u64, CommittedTransaction> = HashMap::new();
    let mut prepared: Vec<u64> = Vec::new();
    let mut committed: Vec<CommittedTransaction> = Vec::new();
    let mut max_tx_id = 0;

    for entry in entries {
        let tx_id = entry.tx_id();
        max_tx_id = max_tx_id.max(tx_id);
        match entry {
            WalEntry::Begin { .. } => {
                pending.insert(
                    tx_id,
                    CommittedTransaction {
                        tx_id,
                        ..Default::default()
                    },
                );
            }
            WalEntry::Record { image, .. } => {
                pending.entry(tx_id).or_default().images.push(*image);
            }
            WalEntry::Dictionary { entry, .. } => {
                pending.entry(tx_id).or_default().dictionary.push(entry.clone());
            }
            WalEntry::Prepare { .. } => prepared.push(tx_id),
            WalEntry::Commit { .. } => {
                prepared.retain(|&id| id != tx_id);
                if let Some(mut tx) = pending.remove(&tx_id) {
                    tx.tx_id = tx_id;
                    committed.push(tx);
                }
            }
            WalEntry::Abort { .. } => {
                prepared.retain(|&id| id != tx_id);
                pending.remove(&tx_id);
                committed.retain(|tx| tx.tx_id != tx_id);
            }
        }
    }

    RecoveryPlan {
        committed,
        undecided: prepared,
        max_tx_id,
    }
}
