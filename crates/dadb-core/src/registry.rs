//! In-memory model/enum registry.
//!
//! Holds the per-handle caches for the Model Registry: `name ->
//! ModelDefinition`, `name -> EnumDefinition`, and the reverse mapping from
//! physical table name to logical model name. These are rebuilt from the
//! catalog on every `load`/`reload`; nothing here is process-global.

use std::cell::RefCell;
use std::collections::HashMap;

use dadb_schema::{Catalog, EnumDefinition, FieldDefinition, FieldKind, ModelDefinition};
use dadb_sats::Datatype;

use crate::error::DadbError;

#[derive(Default)]
pub struct ModelRegistry {
    models: RefCell<HashMap<String, ModelDefinition>>,
    enums: RefCell<HashMap<String, EnumDefinition>>,
    table_to_model: RefCell<HashMap<String, String>>,
    /// Per-model scoped-disable depth; `> 0` means duplicate checking is
    /// currently suppressed for that model. A counter rather than a bool so
    /// paired disable/enable calls can nest without one caller's `enable`
    /// re-arming checking out from under another's still-open `disable`.
    dedup_disabled: RefCell<HashMap<String, u32>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds all caches from the catalog's persisted state. Called once
    /// on `Database::load` and again on every `Database::reload`.
    pub fn reload(&self, catalog: &Catalog) -> Result<(), DadbError> {
        self.models.borrow_mut().clear();
        self.enums.borrow_mut().clear();
        self.table_to_model.borrow_mut().clear();
        self.dedup_disabled.borrow_mut().clear();

        for name in catalog.list_enum_names()? {
            let meta = catalog.enum_meta(&name)?;
            let values = catalog.enum_values(&name)?;
            self.enums.borrow_mut().insert(
                name.clone(),
                EnumDefinition {
                    name,
                    version: meta.version,
                    source: meta.source,
                    values,
                },
            );
        }

        for name in catalog.list_model_names()? {
            let meta = catalog.model_meta(&name)?;
            let raw_fields = catalog.fields_raw(&name)?;
            let fields = raw_fields
                .into_iter()
                .map(|raw| reconstruct_field(raw))
                .collect::<Result<Vec<_>, DadbError>>()?;

            let tblname = catalog.get_tblname(&name)?;
            self.table_to_model.borrow_mut().insert(tblname, name.clone());
            self.models.borrow_mut().insert(
                name.clone(),
                ModelDefinition {
                    name,
                    description: String::new(),
                    version: meta.version,
                    source: meta.source,
                    fields,
                    explicit_dedup: meta.explicit_dedup,
                    implicit_dedup: meta.implicit_dedup,
                    fail_on_dup: meta.fail_on_dup,
                },
            );
        }

        log::debug!(
            "registry: rebuilt caches ({} model(s), {} enum(s))",
            self.models.borrow().len(),
            self.enums.borrow().len()
        );
        Ok(())
    }

    /// Records a model just registered through the catalog, without a full reload.
    pub fn remember_model(&self, def: ModelDefinition, tblname: String) {
        self.table_to_model.borrow_mut().insert(tblname, def.name.clone());
        self.models.borrow_mut().insert(def.name.clone(), def);
    }

    /// Records an enum just registered through the catalog, without a full reload.
    pub fn remember_enum(&self, def: EnumDefinition) {
        self.enums.borrow_mut().insert(def.name.clone(), def);
    }

    pub fn model(&self, name: &str) -> Result<ModelDefinition, DadbError> {
        self.models
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| DadbError::no_such_model(name))
    }

    pub fn model_exists(&self, name: &str) -> bool {
        self.models.borrow().contains_key(name)
    }

    pub fn enum_exists(&self, name: &str) -> bool {
        self.enums.borrow().contains_key(name)
    }

    pub fn enum_def(&self, name: &str) -> Result<EnumDefinition, DadbError> {
        self.enums
            .borrow()
            .get(name)
            .cloned()
            .ok_or_else(|| DadbError::Schema(dadb_schema::SchemaError::NoSuchEnum(name.to_string())))
    }

    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn enum_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.enums.borrow().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn model_by_table(&self, tblname: &str) -> Option<String> {
        self.table_to_model.borrow().get(tblname).cloned()
    }

    /// The closed set of datatypes known to the registry, in declaration order.
    pub fn datatypes(&self) -> &'static [Datatype] {
        &dadb_sats::datatype::ALL
    }

    /// Suppresses duplicate checking for `modelname` until a matching
    /// `enable_duplicate_checking` call. Nests: checking stays suppressed
    /// until every `disable` has a paired `enable`.
    pub fn disable_duplicate_checking(&self, modelname: &str) {
        *self.dedup_disabled.borrow_mut().entry(modelname.to_string()).or_insert(0) += 1;
    }

    /// Reverses one `disable_duplicate_checking` call. Calls must be paired:
    /// an `enable` with no matching open `disable` is a caller error.
    pub fn enable_duplicate_checking(&self, modelname: &str) -> Result<(), DadbError> {
        match self.dedup_disabled.borrow_mut().get_mut(modelname) {
            Some(depth) if *depth > 0 => {
                *depth -= 1;
                Ok(())
            }
            _ => Err(DadbError::DuplicateCheckingMismatch(modelname.to_string(), "enabled")),
        }
    }

    pub fn duplicate_checking_disabled(&self, modelname: &str) -> bool {
        self.dedup_disabled.borrow().get(modelname).copied().unwrap_or(0) > 0
    }
}

fn reconstruct_field(raw: dadb_schema::RawFieldRow) -> Result<FieldDefinition, DadbError> {
    let kind = match (raw.datatype.as_deref(), raw.submodel.as_deref(), raw.enum_name.as_deref()) {
        (Some(dt), None, None) => FieldKind::Scalar(Datatype::from_declaration(dt)?),
        (None, Some(target), None) => FieldKind::Submodel(target.to_string()),
        (None, None, Some(target)) => FieldKind::Enum(target.to_string()),
        _ => {
            return Err(DadbError::Schema(dadb_schema::SchemaError::AmbiguousReference(raw.name)));
        }
    };
    Ok(FieldDefinition {
        name: raw.name,
        kind,
        nullable: raw.nullable,
        multiple: raw.multiple,
        preview: raw.preview,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dadb_datastore::{Backend, TransactionFacade};
    use dadb_sats::Datatype;
    use std::rc::Rc;

    fn fresh_catalog() -> Catalog {
        let backend = Rc::new(Backend::open_in_memory().unwrap());
        let catalog = Catalog::new(backend, Rc::new(TransactionFacade::new()), "x", "id");
        catalog.create_schema(&[]).unwrap();
        catalog
    }

    #[test]
    fn reload_rebuilds_model_and_enum_caches() {
        let catalog = fresh_catalog();
        let color = EnumDefinition::new("Color", vec![(1, "RED".to_string())], 1);
        catalog.register_enum(&color).unwrap();
        let def = ModelDefinition::new(
            "Item",
            vec![
                FieldDefinition::scalar("name", Datatype::String),
                FieldDefinition::enum_field("color", "Color"),
            ],
            "an item",
            1,
        );
        catalog.register_model(&def).unwrap();

        let registry = ModelRegistry::new();
        registry.reload(&catalog).unwrap();

        assert_eq!(registry.model_names(), vec!["Item".to_string()]);
        assert_eq!(registry.enum_names(), vec!["Color".to_string()]);
        let reloaded = registry.model("Item").unwrap();
        assert_eq!(reloaded.fields.len(), 2);
        assert_eq!(reloaded.fields[1].kind, FieldKind::Enum("Color".to_string()));
        assert_eq!(registry.model_by_table("xItem"), Some("Item".to_string()));
    }

    #[test]
    fn disable_and_enable_duplicate_checking_nests() {
        let registry = ModelRegistry::new();
        assert!(!registry.duplicate_checking_disabled("Item"));
        registry.disable_duplicate_checking("Item");
        registry.disable_duplicate_checking("Item");
        assert!(registry.duplicate_checking_disabled("Item"));
        registry.enable_duplicate_checking("Item").unwrap();
        assert!(registry.duplicate_checking_disabled("Item"));
        registry.enable_duplicate_checking("Item").unwrap();
        assert!(!registry.duplicate_checking_disabled("Item"));
    }

    #[test]
    fn enable_without_a_matching_disable_is_a_mismatch_error() {
        let registry = ModelRegistry::new();
        let err = registry.enable_duplicate_checking("Item").unwrap_err();
        assert!(matches!(err, DadbError::DuplicateCheckingMismatch(_, _)));
    }

    #[test]
    fn unknown_model_lookup_is_reported() {
        let registry = ModelRegistry::new();
        assert!(matches!(registry.model("Ghost"), Err(DadbError::NoSuchModel(_))));
    }
}
