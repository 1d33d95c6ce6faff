//! The composed error type for the metadata engine.
//!
//! Every lower-crate error kind is folded in losslessly via `#[from]`; the
//! engine never stringifies a cause before propagating it.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DadbError {
    #[error("store error: {0}")]
    Store(#[from] dadb_datastore::StoreError),
    #[error("schema error: {0}")]
    Schema(#[from] dadb_schema::SchemaError),
    #[error("value error: {0}")]
    Value(#[from] dadb_sats::ValueError),
    #[error("backend error: {0}")]
    Backend(#[from] rusqlite::Error),

    #[error("unknown model `{0}`")]
    NoSuchModel(String),
    #[error("model `{model}` has no item with id {id}")]
    NoSuchModelItem { model: String, id: i64 },
    #[error("unknown field `{field}` on model `{model}`")]
    NoSuchField { model: String, field: String },
    #[error("duplicate checking for model `{0}` cannot be {1}: no matching call is currently open")]
    DuplicateCheckingMismatch(String, &'static str),
    #[error("item conflicts with an existing row on model `{0}` (fail_on_dup is set)")]
    DuplicateItem(String),

    #[error("repository `{0}` has no `reserved` row or was never created")]
    RepositoryMismatch(String),
}

impl DadbError {
    pub fn no_such_model(name: impl Into<String>) -> Self {
        DadbError::NoSuchModel(name.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_error_composes_through_from_without_losing_display_text() {
        let schema_err = dadb_schema::SchemaError::ModelConflict {
            name: "Person".to_string(),
            reason: "version differs".to_string(),
        };
        let text = schema_err.to_string();
        let wrapped: DadbError = schema_err.into();
        assert!(wrapped.to_string().contains(&text));
    }
}
