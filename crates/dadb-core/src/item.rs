//! A modelitem: a typed record bound to a registered model.
//!
//! [`Item`] is the resolved, validated shape produced by
//! [`crate::engine::ModelitemEngine::make_modelitem`] and returned by
//! `modelitem`/`modelitems`. [`FieldInput`] is what a caller hands in before
//! validation; it is looser, accepting either a resolved foreign id or a
//! nested item/enum name so callers don't have to pre-resolve references.

use std::collections::BTreeMap;

use dadb_sats::Value;

/// What a caller supplies for one field when building an item.
#[derive(Debug, Clone)]
pub enum FieldInput {
    Value(Value),
    Values(Vec<Value>),
    Submodel(SubmodelInput),
    SubmodelMulti(Vec<SubmodelInput>),
    Enum(EnumInput),
    EnumMulti(Vec<EnumInput>),
}

/// A submodel reference: either an id already known to the caller, or a
/// whole nested item to be inserted (cascaded) before the parent row.
#[derive(Debug, Clone)]
pub enum SubmodelInput {
    Id(i64),
    Item(Box<Item>),
}

/// An enum reference: either the integer value or the member's declared name.
#[derive(Debug, Clone)]
pub enum EnumInput {
    Id(i64),
    Name(String),
}

/// One field's resolved value on a built or fetched [`Item`].
///
/// By the time an `Item` exists, every enum reference has been resolved to
/// its integer id (the registry already has the name -> id mapping from
/// registration), so only submodel fields may still carry a pending nested
/// item awaiting cascaded insertion.
#[derive(Debug, Clone)]
pub enum FieldSlot {
    Scalar(Value),
    Multi(Vec<Value>),
    Submodel(SubmodelInput),
    SubmodelMulti(Vec<SubmodelInput>),
    Enum(i64),
    EnumMulti(Vec<i64>),
}

/// A typed record bound to a registered model.
///
/// Field order is not significant; fields absent from the map are NULL
/// (only legal for nullable fields, enforced at construction time).
#[derive(Debug, Clone)]
pub struct Item {
    pub model: String,
    /// The row's primary key, once inserted or fetched. `None` on an item
    /// still being built for insertion.
    pub pkey: Option<i64>,
    pub fields: BTreeMap<String, FieldSlot>,
}

impl Item {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            pkey: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn scalar(&self, field: &str) -> Option<&Value> {
        match self.fields.get(field) {
            Some(FieldSlot::Scalar(v)) => Some(v),
            _ => None,
        }
    }

    pub fn multi(&self, field: &str) -> Option<&[Value]> {
        match self.fields.get(field) {
            Some(FieldSlot::Multi(v)) => Some(v),
            _ => None,
        }
    }

    /// The submodel id on a single-valued submodel field, if resolved (an
    /// item still holding a pending nested [`Item`] returns `None` here
    /// until cascaded insertion assigns it an id).
    pub fn submodel_id(&self, field: &str) -> Option<i64> {
        match self.fields.get(field) {
            Some(FieldSlot::Submodel(SubmodelInput::Id(id))) => Some(*id),
            _ => None,
        }
    }

    pub fn enum_id(&self, field: &str) -> Option<i64> {
        match self.fields.get(field) {
            Some(FieldSlot::Enum(id)) => Some(*id),
            _ => None,
        }
    }
}
