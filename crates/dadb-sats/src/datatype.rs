//! The closed set of scalar datatypes a DADB field may declare.
//!
//! Datatypes never change shape at runtime: they are a fixed, ordered list
//! baked into the binary. Adding a new datatype is a schema-version bump,
//! not something a model author can do.

use crate::error::ValueError;

/// A member of DADB's closed datatype set.
///
/// The declared order is significant: it is the order `Database::datatypes`
/// enumerates them in, and the order is part of the reopen-identity contract
/// (see `Database::reload`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Datatype {
    Datetime,
    Date,
    Integer,
    String,
    Bytes,
    Bool,
    TimeDelta,
    Float,
    Null,
    Data,
}

/// All datatypes, in declaration order.
pub const ALL: [Datatype; 10] = [
    Datatype::Datetime,
    Datatype::Date,
    Datatype::Integer,
    Datatype::String,
    Datatype::Bytes,
    Datatype::Bool,
    Datatype::TimeDelta,
    Datatype::Float,
    Datatype::Null,
    Datatype::Data,
];

impl Datatype {
    /// The literal string persisted in the `field`/`proptable` catalog rows.
    pub fn declaration(self) -> &'static str {
        match self {
            Datatype::Datetime => "Datetime",
            Datatype::Date => "Date",
            Datatype::Integer => "Integer",
            Datatype::String => "String",
            Datatype::Bytes => "Bytes",
            Datatype::Bool => "Bool",
            Datatype::TimeDelta => "TimeDelta",
            Datatype::Float => "Float",
            Datatype::Null => "NULL",
            Datatype::Data => "Data",
        }
    }

    /// Parses a declaration string written by a previous `register_model`/`register_enum` call.
    pub fn from_declaration(s: &str) -> Result<Self, ValueError> {
        ALL.into_iter()
            .find(|d| d.declaration() == s)
            .ok_or_else(|| ValueError::UnknownDatatype(s.to_string()))
    }

    /// The SQL column type used when generating `CREATE TABLE` DDL for a column of this datatype.
    ///
    /// `Null` never backs a column on its own: a field with this datatype is
    /// only ever the single `NULL` value, so model validation refuses to let
    /// it reach DDL generation.
    pub fn column_type(self) -> &'static str {
        match self {
            Datatype::Datetime => "TEXT",
            Datatype::Date => "TEXT",
            Datatype::Integer => "INTEGER",
            Datatype::String => "TEXT",
            Datatype::Bytes => "BLOB",
            Datatype::Bool => "INTEGER",
            Datatype::TimeDelta => "INTEGER",
            Datatype::Float => "REAL",
            Datatype::Null => "NULL",
            Datatype::Data => "INTEGER",
        }
    }

    /// Whether this datatype is allowed to back a regular, stored field.
    ///
    /// `Null` may only appear on a field that is itself explicitly nullable
    /// and carries no other datatype (see [`crate::error::ValueError::NullNotNullable`]).
    pub fn is_storable(self) -> bool {
        !matches!(self, Datatype::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declaration_round_trips_through_all_members() {
        for d in ALL {
            assert_eq!(Datatype::from_declaration(d.declaration()).unwrap(), d);
        }
    }

    #[test]
    fn unknown_declaration_is_rejected() {
        assert!(Datatype::from_declaration("NotARealType").is_err());
    }

    #[test]
    fn declared_order_is_stable() {
        let names: Vec<&str> = ALL.iter().map(|d| d.declaration()).collect();
        assert_eq!(
            names,
            ["Datetime", "Date", "Integer", "String", "Bytes", "Bool", "TimeDelta", "Float", "NULL", "Data"]
        );
    }
}
