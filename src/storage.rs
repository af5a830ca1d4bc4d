//! SQLite plumbing shared by the post, relationship, queue and log stores.
//! Each store owns its own connection (WAL mode), so readers never wait on
//! the log batch writer.

use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Where a store keeps its rows.
#[derive(Debug, Clone)]
pub enum Database {
    File(std::path::PathBuf),
    /// Named shared-cache in-memory database; lives while a connection is open.
    Memory(String),
}

impl Database {
    pub fn file(path: impl AsRef<Path>) -> Self {
        Database::File(path.as_ref().to_path_buf())
    }

    /// A fresh, uniquely named in-memory database.
    pub fn memory() -> Self {
        Database::Memory(format!("polyglot-{}", uuid::Uuid::new_v4()))
    }

    /// Open a fresh connection with the pragmas every store relies on.
    pub fn connect(&self) -> StoreResult<Connection> {
        let conn = match self {
            Database::File(path) => {
                let conn = Connection::open(path)?;
                conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
                conn
            }
            Database::Memory(name) => Connection::open_with_flags(
                format!("file:{name}?mode=memory&cache=shared"),
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_URI
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?,
        };
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Ok(conn)
    }
}

/// Current time as Unix timestamp (seconds).
pub fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
