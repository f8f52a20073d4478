use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite error.
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic I/O error (e.g. creating the database directory).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Migration failure.
    #[error("migration error: {0}")]
    Migration(String),

    /// Exactly one direction of a friend-edge pair exists. The pair is
    /// created in a single transaction, so this indicates external
    /// corruption and must surface loudly.
    #[error("corrupt friend-edge pair between {0} and {1}")]
    CorruptEdgePair(String, String),

    /// A blocking store task failed to complete.
    #[error("store task failed: {0}")]
    Task(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;
