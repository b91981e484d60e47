//! Error types for the store client and its engines.

use thiserror::Error;

/// Result type for store client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A failure reported by the storage engine itself.
///
/// Mirrors the shape of a `DOMException`: a machine-readable `name`
/// (`"DataError"`, `"ConstraintError"`, ...) and a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name}: {message}")]
pub struct EngineError {
    pub name: String,
    pub message: String,
}

impl EngineError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new("DataError", message)
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new("ConstraintError", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NotFoundError", message)
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::new("InvalidStateError", message)
    }

    pub fn inactive(message: impl Into<String>) -> Self {
        Self::new("TransactionInactiveError", message)
    }

    pub fn abort(message: impl Into<String>) -> Self {
        Self::new("AbortError", message)
    }

    /// The transaction this error came from can no longer accept requests.
    pub fn is_transaction_gone(&self) -> bool {
        self.name == "TransactionInactiveError" || self.name == "InvalidStateError"
    }
}

/// Errors that can occur during store client operations
#[derive(Debug, Error)]
pub enum Error {
    /// No storage engine is available in the host environment
    #[error("storage engine not available: {0}")]
    UnsupportedEngine(String),

    /// Another connection holds the database open and prevents the upgrade.
    ///
    /// Delivered through the warning channel; the open may still succeed once
    /// the other connection closes.
    #[error("opening database \"{name}\" is blocked by another connection")]
    OpenBlocked { name: String },

    /// Another connection holds the database open and prevents the delete.
    #[error("deleting database \"{name}\" is blocked by another connection")]
    DeleteBlocked { name: String },

    #[error("failed to open database \"{name}\": {source}")]
    OpenFailed {
        name: String,
        #[source]
        source: EngineError,
    },

    #[error("failed to delete database \"{name}\": {source}")]
    DeleteFailed {
        name: String,
        #[source]
        source: EngineError,
    },

    #[error("database is not open")]
    DatabaseNotOpen,

    #[error("object store \"{0}\" not found")]
    StoreNotFound(String),

    /// Malformed range descriptor, bare key where a range is required, or a
    /// malformed entry.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A bulk write entry lacks its `key` or `value` field
    #[error("entry is missing its \"{0}\" field")]
    MissingKeyOrValue(&'static str),

    /// The transaction aborted before this request reported success or error
    #[error("transaction on \"{store}\" aborted before the request completed")]
    TransactionAborted { store: String },

    /// Request error from an engine operation
    #[error("engine operation failed: {0}")]
    EngineOperationFailed(#[from] EngineError),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidArgument(message.into())
    }
}
