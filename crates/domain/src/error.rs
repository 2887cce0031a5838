/// Shared error type used across all Agora crates.
///
/// The variants mirror how failures surface at the API boundary:
/// `Validation`/`NotFound`/`PermissionDenied`/`Conflict` map to HTTP
/// statuses, `TransientTransport` is retryable inside the client pool,
/// `StorageBusy`/busy `Sqlite` failures are retryable inside the write
/// queue, and `Cancelled` is not an error at all — it marks a
/// cooperatively interrupted turn.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("validation: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("conflict: {0}")]
    Conflict(String),

    /// The runtime transport is not ready yet; safe to retry.
    #[error("transport is not ready: {0}")]
    TransientTransport(String),

    /// The backing store rejected a write because another writer holds
    /// the file lock; the write queue retries these with backoff.
    #[error("storage busy: {0}")]
    StorageBusy(String),

    /// Storage-layer failure outside SQLite's own error space (bad
    /// stored timestamps, vanished rows).
    #[error("storage: {0}")]
    Storage(String),

    #[error("SQLite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Client lifecycle failure (connect retries exhausted, dead client).
    #[error("lifecycle: {0}")]
    Lifecycle(String),

    /// Cooperative cancellation — never surfaced as a user-visible error.
    #[error("cancelled")]
    Cancelled,

    #[error("auth: {0}")]
    Auth(String),

    #[error("config: {0}")]
    Config(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True when the connect failure is the runtime's "transport is not
    /// ready" condition, the only class the client pool retries.
    pub fn is_transient_transport(&self) -> bool {
        matches!(self, Error::TransientTransport(_))
    }

    /// True when the store reported a held write lock. SQLite failures
    /// are classified by result code, not message text.
    pub fn is_storage_busy(&self) -> bool {
        match self {
            Error::StorageBusy(_) => true,
            Error::Sqlite(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn sqlite_failure(code: i32) -> Error {
        Error::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(code),
            None,
        ))
    }

    #[test]
    fn transient_transport_classification() {
        assert!(Error::TransientTransport("not ready".into()).is_transient_transport());
        assert!(!Error::Lifecycle("dead".into()).is_transient_transport());
        assert!(!Error::Other("transport is not ready".into()).is_transient_transport());
    }

    #[test]
    fn storage_busy_classification() {
        assert!(Error::StorageBusy("database is locked".into()).is_storage_busy());
        assert!(!Error::Storage("corrupt".into()).is_storage_busy());
    }

    #[test]
    fn sqlite_busy_codes_are_storage_busy() {
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_BUSY).is_storage_busy());
        assert!(sqlite_failure(rusqlite::ffi::SQLITE_LOCKED).is_storage_busy());
    }

    #[test]
    fn other_sqlite_codes_are_not_busy() {
        assert!(!sqlite_failure(rusqlite::ffi::SQLITE_CONSTRAINT).is_storage_busy());
        assert!(!Error::Sqlite(rusqlite::Error::QueryReturnedNoRows).is_storage_busy());
    }
}
