use thiserror::Error;

/// Failures raised while coercing a native value to or from a [`crate::datatype::Datatype`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValueError {
    #[error("unknown datatype declaration `{0}`")]
    UnknownDatatype(String),
    #[error("field `{field}` expected datatype `{expected}` but got `{found}`")]
    TypeMismatch {
        field: String,
        expected: String,
        found: String,
    },
    #[error("field `{0}` is not nullable but no value was supplied")]
    MissingRequiredField(String),
    #[error("datatype `NULL` may only be used on an explicitly nullable field")]
    NullNotNullable,
    #[error("could not parse `{0}` as ISO-8601: {1}")]
    InvalidIso8601(String, String),
    #[error("invalid identifier `{0}`: only ASCII letters, digits, and underscore are allowed")]
    InvalidIdentifier(String),
    #[error("timeline exclusion list contains invalid modelname `{0}`")]
    UnknownTimelineModel(String),
}
