use std::fmt;

use thiserror::Error;

/// Why an audit entry failed verification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityFailure {
    /// Stored hash differs from the hash recomputed over the entry
    HashMismatch,

    /// Entry's prev_hash does not point at the preceding entry's hash
    BrokenLink,
}

impl fmt::Display for IntegrityFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityFailure::HashMismatch => write!(f, "hash mismatch"),
            IntegrityFailure::BrokenLink => write!(f, "broken link"),
        }
    }
}

/// First point at which an audit chain stops verifying.
/// `index` is the position within the verified sequence, not the row id.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("audit chain integrity violated at index {index}: {reason} (stored {stored}, expected {expected})")]
pub struct IntegrityError {
    pub index: usize,
    pub reason: IntegrityFailure,
    pub stored: String,
    pub expected: String,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    #[error("Invalid match threshold {0}: must be within [0, 1]")]
    InvalidThreshold(f64),

    #[error("Database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;
