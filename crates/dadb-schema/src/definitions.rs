use dadb_sats::Datatype;

/// What a field's values actually are: a plain storable scalar, or a
/// reference to another registered model or enum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Scalar(Datatype),
    Submodel(String),
    Enum(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDefinition {
    pub name: String,
    pub kind: FieldKind,
    pub nullable: bool,
    /// Whether the field holds an ordered collection of values rather than one.
    pub multiple: bool,
    /// Whether this field contributes to a timeline row's `preview_` text.
    pub preview: bool,
}

impl FieldDefinition {
    pub fn scalar(name: impl Into<String>, datatype: Datatype) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Scalar(datatype),
            nullable: false,
            multiple: false,
            preview: true,
        }
    }

    pub fn submodel(name: impl Into<String>, modelname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Submodel(modelname.into()),
            nullable: false,
            multiple: false,
            preview: false,
        }
    }

    pub fn enum_field(name: impl Into<String>, enumname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: FieldKind::Enum(enumname.into()),
            nullable: false,
            multiple: false,
            preview: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn hidden_from_preview(mut self) -> Self {
        self.preview = false;
        self
    }
}

/// An immutable description of a model, as handed to `register_model`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelDefinition {
    pub name: String,
    pub description: String,
    pub version: u32,
    pub source: String,
    pub fields: Vec<FieldDefinition>,
    pub explicit_dedup: bool,
    pub implicit_dedup: bool,
    pub fail_on_dup: bool,
}

impl ModelDefinition {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDefinition>, description: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            version,
            source: "user".to_string(),
            fields,
            explicit_dedup: true,
            implicit_dedup: true,
            fail_on_dup: false,
        }
    }

    pub fn fail_on_dup(mut self, fail: bool) -> Self {
        self.fail_on_dup = fail;
        self
    }
}

/// An immutable description of an enum, as handed to `register_enum`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDefinition {
    pub name: String,
    pub version: u32,
    pub source: String,
    pub values: Vec<(i64, String)>,
}

impl EnumDefinition {
    pub fn new(name: impl Into<String>, values: Vec<(i64, String)>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
            source: "user".to_string(),
            values,
        }
    }
}
