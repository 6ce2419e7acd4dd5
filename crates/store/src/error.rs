//! Store error types.

/// Error from a storage operation.
#[derive(Debug)]
pub enum StoreError {
    /// Underlying SQLite failure.
    Sqlite(rusqlite::Error),
    /// Stored JSON failed to (de)serialize.
    Json(serde_json::Error),
    /// The audit append failed inside a commit transaction. The transaction
    /// is rolled back — row and audit entry stay consistent — but this is
    /// surfaced separately so callers can alert on it: a store that cannot
    /// write audit entries cannot accept mutations.
    AuditWrite(rusqlite::Error),
    /// An update or delete matched no stored row.
    RowMissing,
    /// A stored value did not parse (bad UUID, timestamp, or enum text).
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Sqlite(e) => write!(f, "database error: {}", e),
            StoreError::Json(e) => write!(f, "stored JSON error: {}", e),
            StoreError::AuditWrite(e) => {
                write!(f, "audit write failed, mutation rolled back: {}", e)
            }
            StoreError::RowMissing => write!(f, "row does not exist"),
            StoreError::Corrupt(what) => write!(f, "corrupt stored value: {}", what),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Sqlite(e) | StoreError::AuditWrite(e) => Some(e),
            StoreError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Sqlite(e)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Json(e)
    }
}
