//! Error types for lattice-core.

use thiserror::Error;

/// Result type for lattice-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while evaluating formulas or operating on the
/// persisted sheet/dependency-graph store.
#[derive(Debug, Error)]
pub enum Error {
    /// The sheet's table does not exist in the store.
    #[error("sheet not found: {0}")]
    SheetNotFound(String),

    /// The cell's canonical key is absent from an existing sheet.
    #[error("cell not found: {0}")]
    CellNotFound(String),

    /// Cell id contains a character reserved for formula operators.
    #[error("cell id `{0}` contains invalid characters ({CELL_ID_BLACKLIST_DESC})")]
    CellIdBlacklisted(String),

    /// A numeric cell id holds a value that isn't itself numeric (I5).
    #[error("cell with numeric key should have a numeric value")]
    CellIdNumericViolation,

    /// Formula failed to compile.
    #[error("{expression}: {message}")]
    Compile { expression: String, message: String },

    /// Formula compiled but failed during evaluation.
    #[error("{expression}: {message}")]
    Eval { expression: String, message: String },

    /// A formula observed the "in progress" sentinel for the identifier it
    /// was about to resolve.
    #[error("{0}: circular reference detected")]
    CircularReference(String),

    /// A `multi-evaluate` batch (the write path's recompute-together pass)
    /// failed on `cell_id`; wraps whatever error that cell's evaluation
    /// raised so the caller sees which cell in the batch was at fault.
    #[error("cell {cell_id}: {source}")]
    Batch {
        cell_id: String,
        #[source]
        source: Box<Error>,
    },

    /// A stored `(original-key, value)` record could not be decoded.
    #[error("invalid serialized cell record: {0}")]
    Serializer(String),

    /// Underlying embedded-store failure.
    #[error("storage error: {0}")]
    Storage(String),
}

/// Human-readable description of the cell-id blacklist, shared by the error
/// message and anything that wants to echo the rule back to a caller.
pub const CELL_ID_BLACKLIST_DESC: &str = "+, -, *, /, %, ^, (, ), <, >, !, =, &, |, or whitespace";

impl From<redb::Error> for Error {
    fn from(e: redb::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Storage(e.to_string())
    }
}
