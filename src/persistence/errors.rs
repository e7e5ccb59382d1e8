use thiserror::Error;

/// Errors surfaced by the persistence adapter and its storage backends
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PersistenceError {
    #[error("Storage engine unavailable: {0}")]
    Unavailable(String),

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Corrupted store: {0}")]
    Corrupted(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid store name: {0}")]
    InvalidStoreName(String),
}

// SQLite primary result codes
const SQLITE_CORRUPT: i32 = 11;
const SQLITE_FULL: i32 = 13;
const SQLITE_CANTOPEN: i32 = 14;
const SQLITE_NOTADB: i32 = 26;

/// Maps a SQLite result code onto a persistence error
///
/// sqlx reports extended result codes (e.g. 526 for `SQLITE_CANTOPEN_ISDIR`);
/// the primary code lives in the low byte.
fn from_sqlite_code(code: Option<&str>, message: String) -> PersistenceError {
    let primary = code
        .and_then(|code| code.parse::<i32>().ok())
        .map(|code| code & 0xff);
    match primary {
        Some(SQLITE_FULL) => PersistenceError::QuotaExceeded(message),
        Some(SQLITE_CORRUPT) | Some(SQLITE_NOTADB) => PersistenceError::Corrupted(message),
        Some(SQLITE_CANTOPEN) => PersistenceError::Unavailable(message),
        _ => PersistenceError::Storage(message),
    }
}

impl From<sqlx::Error> for PersistenceError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::Database(db_error) => {
                from_sqlite_code(db_error.code().as_deref(), db_error.message().to_string())
            }
            sqlx::Error::Io(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Configuration(_)
            | sqlx::Error::WorkerCrashed => PersistenceError::Unavailable(error.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                PersistenceError::Corrupted(error.to_string())
            }
            _ => PersistenceError::Storage(error.to_string()),
        }
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(error: serde_json::Error) -> Self {
        PersistenceError::Serialization(error.to_string())
    }
}
