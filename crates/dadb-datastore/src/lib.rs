//! Relational backend, repository lock, and content-addressed data store.
//!
//! This crate has no notion of models, fields, or the meta-schema catalog,
//! that policy lives in `dadb-schema` and `dadb-core`. It only knows how to
//! open a store, hold its lock, run a transaction, and store/retrieve bytes.

pub mod backend;
pub mod content_store;
pub mod error;
pub mod lock_file;
pub mod transaction;

pub use backend::Backend;
pub use content_store::{ContentStore, DataHandle, BLOCKSIZE};
pub use error::StoreError;
pub use lock_file::RepoLock;
pub use transaction::TransactionFacade;
