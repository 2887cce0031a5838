use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use ag_domain::{Error, Result};

use crate::schema;

/// Handle to the SQLite database.
///
/// One connection behind a mutex: reads take the lock for the duration
/// of the statement; writes are additionally serialized through the
/// write queue so concurrent callers never interleave transactions.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.with_conn(schema::init_schema)?;
        tracing::info!(path = %path.display(), "store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.with_conn(schema::init_schema)?;
        Ok(store)
    }

    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&conn)
    }
}

/// Map a rusqlite error into the shared taxonomy, classifying by
/// SQLite result code.
///
/// Unique-constraint violations become [`Error::Conflict`] for the API
/// layer; everything else is carried as [`Error::Sqlite`], where busy/
/// locked codes satisfy `is_storage_busy()` so the write queue retries
/// them.
pub(crate) fn db_err(e: rusqlite::Error) -> Error {
    if let rusqlite::Error::SqliteFailure(failure, _) = &e {
        if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
            || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
        {
            return Error::Conflict(e.to_string());
        }
    }
    Error::Sqlite(e)
}
