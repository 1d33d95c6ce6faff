use thiserror::Error;

/// Failures from the meta-schema catalog: registration, lookup, and reopen validation.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("backend error: {0}")]
    Backend(#[from] rusqlite::Error),
    #[error("store error: {0}")]
    Store(#[from] dadb_datastore::StoreError),
    #[error("value error: {0}")]
    Value(#[from] dadb_sats::ValueError),
    #[error("unknown model `{0}`")]
    NoSuchModel(String),
    #[error("unknown enum `{0}`")]
    NoSuchEnum(String),
    #[error("unknown field `{field}` on model `{model}`")]
    NoSuchField { model: String, field: String },
    #[error("model `{name}` is already registered with an incompatible definition: {reason}")]
    ModelConflict { name: String, reason: String },
    #[error("enum `{name}` is already registered with an incompatible definition: {reason}")]
    EnumConflict { name: String, reason: String },
    #[error(
        "repository schema mismatch: expected (schemaversion={expected_schema}, apiversion={expected_api}), \
         found (schemaversion={found_schema}, apiversion={found_api})"
    )]
    SchemaVersionMismatch {
        expected_schema: u32,
        found_schema: u32,
        expected_api: u32,
        found_api: u32,
    },
    #[error("a submodel or enum reference must name exactly one target, field `{0}` named both or neither")]
    AmbiguousReference(String),
    #[error("repository has no `reserved` row; not a DADB repository")]
    NoReservedRow,
}
