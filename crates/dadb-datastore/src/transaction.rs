//! The nestable-looking transaction facade built over the backend's single-level transaction.

use std::cell::Cell;

use crate::backend::Backend;
use crate::error::StoreError;

/// Tracks whether *this* handle currently owns the backend's one transaction.
///
/// Nesting is cooperative rather than real: a second `begin` while one is
/// already active returns `false` and does nothing, so only the caller that
/// actually started the transaction may commit it. This mirrors a single
/// SQL-level transaction shared by however many logical callers think they
/// are nesting.
#[derive(Default)]
pub struct TransactionFacade {
    active: Cell<bool>,
}

impl TransactionFacade {
    pub fn new() -> Self {
        Self { active: Cell::new(false) }
    }

    /// Returns `true` if this call started the transaction, `false` if one was already active.
    pub fn begin(&self, backend: &Backend) -> Result<bool, StoreError> {
        if self.active.get() {
            return Ok(false);
        }
        backend.begin()?;
        self.active.set(true);
        Ok(true)
    }

    /// Commits iff `started` is true (i.e. the caller is the one that began the transaction).
    pub fn end(&self, backend: &Backend, started: bool) -> Result<(), StoreError> {
        if started {
            backend.commit()?;
            self.active.set(false);
        }
        Ok(())
    }

    /// Unconditionally rolls back the outermost transaction. Returns whether one was active.
    pub fn rollback(&self, backend: &Backend) -> Result<bool, StoreError> {
        if !self.active.get() {
            return Ok(false);
        }
        backend.rollback()?;
        self.active.set(false);
        Ok(true)
    }

    pub fn is_active(&self) -> bool {
        self.active.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_begin_only_commits_once() {
        let backend = Backend::open_in_memory().unwrap();
        backend.execute_batch("CREATE TABLE t (v INTEGER)").unwrap();
        let tx = TransactionFacade::new();

        let outer_started = tx.begin(&backend).unwrap();
        assert!(outer_started);
        let inner_started = tx.begin(&backend).unwrap();
        assert!(!inner_started);

        backend.conn().execute("INSERT INTO t VALUES (1)", []).unwrap();

        // the inner caller must not commit
        tx.end(&backend, inner_started).unwrap();
        assert!(tx.is_active());

        // only the outer caller's end() commits
        tx.end(&backend, outer_started).unwrap();
        assert!(!tx.is_active());

        let count: i64 = backend.conn().query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn rollback_without_active_transaction_returns_false() {
        let backend = Backend::open_in_memory().unwrap();
        let tx = TransactionFacade::new();
        assert!(!tx.rollback(&backend).unwrap());
    }
}
