//! Thin contract over a single-file embedded relational store.
//!
//! `Backend` does not interpret errors from the underlying store: whatever
//! `rusqlite` returns is wrapped in [`crate::error::StoreError::Backend`]
//! and handed back verbatim. Policy (dedup, catalog shape, identity) lives
//! in the crates built on top of this one.

use std::path::{Path, PathBuf};

use rusqlite::Connection;

use crate::error::StoreError;

/// An open connection to the repository's embedded relational store.
pub struct Backend {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Backend {
    /// Opens (creating if necessary) the single-file store at `path`.
    pub fn open_file(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        log::trace!("backend: opened {}", path.display());
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Opens a transient, in-memory store. Used by tests and by callers that
    /// want a scratch repository with no on-disk footprint.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Self { conn, path: None })
    }

    /// The path this backend was opened against, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Direct access to the underlying connection for statement preparation,
    /// parameterized DML, and cursor allocation.
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Issues DDL or any other batch of semicolon-separated statements.
    pub fn execute_batch(&self, sql: &str) -> Result<(), StoreError> {
        self.conn.execute_batch(sql).map_err(Into::into)
    }

    /// Starts a single-level transaction. Fails if one is already open at the SQL level.
    pub fn begin(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("BEGIN").map_err(Into::into)
    }

    pub fn commit(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("COMMIT").map_err(Into::into)
    }

    pub fn rollback(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("ROLLBACK").map_err(Into::into)
    }

    /// The table names currently defined in the store, in the order SQLite's
    /// own catalog reports them (used for the reopen-identity property).
    pub fn table_names(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for row in rows {
            names.push(row?);
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_backend_tracks_created_tables() {
        let backend = Backend::open_in_memory().unwrap();
        backend.execute_batch("CREATE TABLE foo (id INTEGER PRIMARY KEY)").unwrap();
        assert_eq!(backend.table_names().unwrap(), vec!["foo".to_string()]);
    }
}
