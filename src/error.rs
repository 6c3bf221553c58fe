//! Error types for the cache engine
//!
//! Provides unified error handling using thiserror, plus the flat result code
//! handed to the transport layer.

use serde::Serialize;
use thiserror::Error;

// == Cache Error Enum ==
/// Unified error type for the cache engine.
///
/// Every expected failure is a plain variant; only `Persistence` and
/// `Serialization` represent unexpected faults.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Key is empty
    #[error("Key is missing")]
    MissingKey,

    /// Value is empty
    #[error("Value is missing")]
    MissingValue,

    /// Partition key is empty
    #[error("Partition key is missing")]
    MissingPartitionKey,

    /// Partition key contains characters unsafe for on-disk storage
    #[error("Invalid partition key: {0}")]
    InvalidPartitionKey(String),

    /// Key exceeds the configured maximum key size
    #[error("Key of {size} bytes exceeds maximum of {max} bytes")]
    KeyTooLarge { size: usize, max: usize },

    /// Value exceeds the configured maximum value size
    #[error("Value of {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    /// Put-if-not-exists found a live entry
    #[error("Key already exists")]
    KeyAlreadyExists,

    /// Put-if-exists, touch or delete found no live entry
    #[error("Key does not exist")]
    KeyDoesNotExist,

    /// Partition has not been created
    #[error("Partition does not exist")]
    PartitionDoesNotExist,

    /// Partition still has watch predicates attached
    #[error("Partition is in use by {0} watch predicate(s)")]
    PartitionInUse(usize),

    /// Budget exceeded or host memory pressure
    #[error("Insufficient capacity: {0}")]
    InsufficientCapacity(String),

    /// Arithmetic on a payload that is not an 8-byte integer
    #[error("Value of {0} bytes is not an integer")]
    InvalidTypeOperation(usize),

    /// Metadata persistence I/O failed
    #[error("Persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    /// Metadata could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// == Result Code ==
/// Flat outcome code returned across the operation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ResultCode {
    Success,
    MissingKey,
    MissingValue,
    MissingPartitionKey,
    InvalidPartitionKey,
    KeyTooLarge,
    ValueTooLarge,
    KeyAlreadyExists,
    KeyDoesNotExist,
    PartitionDoesNotExist,
    PartitionInUse,
    InsufficientCapacity,
    InvalidTypeOperation,
    InternalError,
}

impl ResultCode {
    /// Maps any engine result to its boundary code.
    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => ResultCode::Success,
            Err(err) => err.code(),
        }
    }
}

impl CacheError {
    /// Returns the boundary code for this error.
    pub fn code(&self) -> ResultCode {
        match self {
            CacheError::MissingKey => ResultCode::MissingKey,
            CacheError::MissingValue => ResultCode::MissingValue,
            CacheError::MissingPartitionKey => ResultCode::MissingPartitionKey,
            CacheError::InvalidPartitionKey(_) => ResultCode::InvalidPartitionKey,
            CacheError::KeyTooLarge { .. } => ResultCode::KeyTooLarge,
            CacheError::ValueTooLarge { .. } => ResultCode::ValueTooLarge,
            CacheError::KeyAlreadyExists => ResultCode::KeyAlreadyExists,
            CacheError::KeyDoesNotExist => ResultCode::KeyDoesNotExist,
            CacheError::PartitionDoesNotExist => ResultCode::PartitionDoesNotExist,
            CacheError::PartitionInUse(_) => ResultCode::PartitionInUse,
            CacheError::InsufficientCapacity(_) => ResultCode::InsufficientCapacity,
            CacheError::InvalidTypeOperation(_) => ResultCode::InvalidTypeOperation,
            CacheError::Persistence(_) | CacheError::Serialization(_) => ResultCode::InternalError,
        }
    }

    /// True for failures the caller caused, as opposed to engine faults.
    pub fn is_expected(&self) -> bool {
        self.code() != ResultCode::InternalError
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache engine.
pub type Result<T> = std::result::Result<T, CacheError>;
