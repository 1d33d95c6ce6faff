use std::path::PathBuf;

use thiserror::Error;

/// Failures from the relational backend, the content store, or the repository lock.
///
/// The backend adds no policy of its own: [`StoreError::Backend`] wraps
/// `rusqlite` failures verbatim rather than interpreting them.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("repository `{0}` is locked by another open handle")]
    RepositoryBusy(PathBuf),
    #[error("data object `{0}` not found")]
    NoSuchDataObject(i64),
    #[error("data object `{0}` has no stored blocks")]
    DataNotStored(i64),
}
