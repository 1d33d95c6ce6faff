//! The meta-schema catalog: enum/model registration, the `_fieldinfo_` view,
//! and the reserved-row bookkeeping that lets a repository be reopened.

pub mod catalog;
pub mod definitions;
pub mod error;

pub use catalog::{Catalog, EnumMeta, FieldInfoRow, ModelMeta, RawFieldRow, ReservedRow, APIVERSION, SCHEMAVERSION};
pub use definitions::{EnumDefinition, FieldDefinition, FieldKind, ModelDefinition};
pub use error::SchemaError;
