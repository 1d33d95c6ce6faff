//! `dadb-sats` is the closed datatype registry for DADB: the scalar types a
//! model field may declare, and the conversions between native [`Value`]s
//! and the storage primitives the relational backend understands.

pub mod datatype;
pub mod error;
pub mod iso8601;
pub mod value;

pub use datatype::Datatype;
pub use error::ValueError;
pub use iso8601::{from_iso8601, isoformat};
pub use value::{TimeDelta, Value};

/// Validates a model, field, or enum name.
///
/// Only ASCII letters, digits, and underscore are accepted, and the name
/// must start with a letter or underscore.
pub fn validate_identifier(name: &str) -> Result<(), ValueError> {
    let mut chars = name.chars();
    let ok = match chars.next() {
        Some(c) => (c.is_ascii_alphabetic() || c == '_') && chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        None => false,
    };
    if ok {
        Ok(())
    } else {
        Err(ValueError::InvalidIdentifier(name.to_string()))
    }
}
