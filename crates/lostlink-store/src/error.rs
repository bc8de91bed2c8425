use thiserror::Error;

/// Errors produced by the store layer.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// No platform data directory to place the default database in.
    #[error("Could not determine a data directory for the database")]
    NoDataDir,

    #[error("I/O error preparing the database location: {0}")]
    Io(#[from] std::io::Error),

    /// A lookup by id matched no row.
    #[error("Record not found")]
    NotFound,

    #[error("Migration to schema v{version} failed: {reason}")]
    Migration { version: u32, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
