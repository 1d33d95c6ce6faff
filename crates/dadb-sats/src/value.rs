//! Native value representation and its bidirectional mapping to storage primitives.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{Value as SqlValue, ValueRef};

use crate::datatype::Datatype;
use crate::error::ValueError;

/// A signed duration with microsecond resolution.
///
/// Stored as a single `INTEGER` column holding the total number of
/// microseconds (negative for durations pointing into the past).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeDelta(i64);

impl TimeDelta {
    pub fn from_microseconds(micros: i64) -> Self {
        TimeDelta(micros)
    }

    pub fn as_microseconds(self) -> i64 {
        self.0
    }
}

impl From<chrono::Duration> for TimeDelta {
    fn from(d: chrono::Duration) -> Self {
        TimeDelta(d.num_microseconds().unwrap_or(i64::MAX))
    }
}

impl From<TimeDelta> for chrono::Duration {
    fn from(td: TimeDelta) -> Self {
        chrono::Duration::microseconds(td.0)
    }
}

/// A value tagged with the [`Datatype`] it was coerced through.
///
/// This is the runtime counterpart of [`Datatype`]: every field on a
/// modelitem holds one of these (or, for multi-valued fields, an ordered
/// list of them).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Datetime(DateTime<Utc>),
    Date(NaiveDate),
    Integer(i64),
    String(String),
    Bytes(Vec<u8>),
    Bool(bool),
    TimeDelta(TimeDelta),
    Float(f64),
    Null,
    /// A reference to a row in the `data` table (see `dadb-datastore`).
    Data(i64),
}

impl Value {
    /// The datatype this value was constructed as.
    pub fn datatype(&self) -> Datatype {
        match self {
            Value::Datetime(_) => Datatype::Datetime,
            Value::Date(_) => Datatype::Date,
            Value::Integer(_) => Datatype::Integer,
            Value::String(_) => Datatype::String,
            Value::Bytes(_) => Datatype::Bytes,
            Value::Bool(_) => Datatype::Bool,
            Value::TimeDelta(_) => Datatype::TimeDelta,
            Value::Float(_) => Datatype::Float,
            Value::Null => Datatype::Null,
            Value::Data(_) => Datatype::Data,
        }
    }

    /// Encodes this value to the storage primitive written into a column of its datatype.
    pub fn encode(&self) -> SqlValue {
        match self {
            Value::Datetime(dt) => SqlValue::Text(dt.to_rfc3339()),
            Value::Date(d) => SqlValue::Text(d.format("%Y-%m-%d").to_string()),
            Value::Integer(i) => SqlValue::Integer(*i),
            Value::String(s) => SqlValue::Text(s.clone()),
            Value::Bytes(b) => SqlValue::Blob(b.clone()),
            Value::Bool(b) => SqlValue::Integer(if *b { 1 } else { 0 }),
            Value::TimeDelta(td) => SqlValue::Integer(td.as_microseconds()),
            Value::Float(f) => SqlValue::Real(*f),
            Value::Null => SqlValue::Null,
            Value::Data(id) => SqlValue::Integer(*id),
        }
    }

    /// Decodes a storage primitive read back from a column declared with `datatype`.
    pub fn decode(datatype: Datatype, raw: ValueRef<'_>) -> Result<Value, ValueError> {
        if matches!(raw, ValueRef::Null) {
            return Ok(Value::Null);
        }
        match datatype {
            Datatype::Datetime => {
                let s = text(raw, datatype)?;
                let dt = DateTime::parse_from_rfc3339(s)
                    .map_err(|e| ValueError::InvalidIso8601(s.to_string(), e.to_string()))?;
                Ok(Value::Datetime(dt.with_timezone(&Utc)))
            }
            Datatype::Date => {
                let s = text(raw, datatype)?;
                let d = NaiveDate::parse_from_str(s, "%Y-%m-%d")
                    .map_err(|e| ValueError::InvalidIso8601(s.to_string(), e.to_string()))?;
                Ok(Value::Date(d))
            }
            Datatype::Integer => Ok(Value::Integer(integer(raw, datatype)?)),
            Datatype::String => Ok(Value::String(text(raw, datatype)?.to_string())),
            Datatype::Bytes => Ok(Value::Bytes(blob(raw, datatype)?.to_vec())),
            Datatype::Bool => Ok(Value::Bool(integer(raw, datatype)? != 0)),
            Datatype::TimeDelta => Ok(Value::TimeDelta(TimeDelta::from_microseconds(integer(raw, datatype)?))),
            Datatype::Float => Ok(Value::Float(match raw {
                ValueRef::Real(f) => f,
                ValueRef::Integer(i) => i as f64,
                _ => return Err(mismatch(datatype, raw)),
            })),
            Datatype::Null => Err(ValueError::NullNotNullable),
            Datatype::Data => Ok(Value::Data(integer(raw, datatype)?)),
        }
    }
}

fn mismatch(expected: Datatype, found: ValueRef<'_>) -> ValueError {
    ValueError::TypeMismatch {
        field: String::new(),
        expected: expected.declaration().to_string(),
        found: format!("{:?}", found.data_type()),
    }
}

fn text<'a>(raw: ValueRef<'a>, expected: Datatype) -> Result<&'a str, ValueError> {
    match raw {
        ValueRef::Text(t) => std::str::from_utf8(t).map_err(|_| mismatch(expected, raw)),
        _ => Err(mismatch(expected, raw)),
    }
}

fn blob<'a>(raw: ValueRef<'a>, expected: Datatype) -> Result<&'a [u8], ValueError> {
    match raw {
        ValueRef::Blob(b) => Ok(b),
        _ => Err(mismatch(expected, raw)),
    }
}

fn integer(raw: ValueRef<'_>, expected: Datatype) -> Result<i64, ValueError> {
    match raw {
        ValueRef::Integer(i) => Ok(i),
        _ => Err(mismatch(expected, raw)),
    }
}
