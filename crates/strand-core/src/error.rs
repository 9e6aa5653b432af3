//! Error types for Strand Core

use thiserror::Error;

/// Result type alias using Strand Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for the Strand record store
#[derive(Error, Debug)]
pub enum Error {
    /// Durable read/write failure on a store or log file
    #[error("Store I/O error: {0}")]
    StoreIo(#[from] std::io::Error),

    /// LMDB/heed errors raised by the catalog
    #[error("Database error: {0}")]
    Database(#[from] heed::Error),

    /// Record or log payload could not be (de)serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Entity id unknown to both the overlay and the store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Create with an id that is already live
    #[error("Duplicate id: {0}")]
    DuplicateId(String),

    /// Change/remove on a property id the entity does not own
    #[error("Property not found: {0}")]
    PropertyNotFound(String),

    /// Caller-chosen id outside the addressable range, or id space exhausted
    #[error("Id out of range: {0}")]
    IdOutOfRange(String),

    /// Relationship endpoint is missing or deleted
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Prepare-time validation failure; the transaction has been rolled back
    #[error("Inconsistent transaction state: {0}")]
    InconsistentTransactionState(String),

    /// Illegal lifecycle transition (e.g. commit before prepare)
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Store contents are unreadable (bad tag, out-of-range slot, ...)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Write-ahead log framing or recovery errors
    #[error("WAL error: {0}")]
    Wal(String),

    /// Catalog errors (property key / relationship type dictionaries)
    #[error("Catalog error: {0}")]
    Catalog(String),

    /// Chain lock could not be acquired in time
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// Configuration could not be loaded
    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Create a not-found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a duplicate-id error
    pub fn duplicate_id(msg: impl Into<String>) -> Self {
        Self::DuplicateId(msg.into())
    }

    /// Create a property-not-found error
    pub fn property_not_found(msg: impl Into<String>) -> Self {
        Self::PropertyNotFound(msg.into())
    }

    /// Create an id-out-of-range error
    pub fn id_out_of_range(msg: impl Into<String>) -> Self {
        Self::IdOutOfRange(msg.into())
    }

    /// Create an invalid-endpoint error
    pub fn invalid_endpoint(msg: impl Into<String>) -> Self {
        Self::InvalidEndpoint(msg.into())
    }

    /// Create an inconsistent-state error
    pub fn inconsistent(msg: impl Into<String>) -> Self {
        Self::InconsistentTransactionState(msg.into())
    }

    /// Create a transaction error
    pub fn transaction(msg: impl Into<String>) -> Self {
        Self::Transaction(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a WAL error
    pub fn wal(msg: impl Into<String>) -> Self {
        Self::Wal(msg.into())
    }

    /// Create a catalog error
    pub fn catalog(msg: impl Into<String>) -> Self {
        Self::Catalog(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the caller should abort the whole transaction
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::DuplicateId(_)
                | Self::PropertyNotFound(_)
                | Self::IdOutOfRange(_)
                | Self::InvalidEndpoint(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_converts_to_store_io() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::StoreIo(_)));
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn test_validation_classification() {
        assert!(Error::duplicate_id("node 1").is_validation());
        assert!(Error::invalid_endpoint("node 2").is_validation());
        assert!(!Error::inconsistent("dangling").is_validation());
        assert!(!Error::wal("torn").is_validation());
    }
}
