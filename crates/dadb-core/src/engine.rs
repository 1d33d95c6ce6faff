//! Builds, inserts, deduplicates, and retrieves typed [`Item`]s.

use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use dadb_datastore::Backend;
use dadb_datastore::TransactionFacade;
use dadb_sats::{Datatype, Value};
use dadb_schema::{Catalog, FieldDefinition, FieldInfoRow, FieldKind, ModelDefinition};
use itertools::Itertools;

use crate::error::DadbError;
use crate::item::{EnumInput, FieldInput, FieldSlot, Item, SubmodelInput};
use crate::registry::ModelRegistry;

/// A field's value after every submodel/enum reference has been resolved to
/// a concrete id (nested items still pending insertion are cascaded first).
enum ResolvedSlot {
    Scalar(Value),
    Multi(Vec<Value>),
    SubmodelId(i64),
    SubmodelMultiIds(Vec<i64>),
    EnumId(i64),
    EnumMultiIds(Vec<i64>),
}

pub struct ModelitemEngine {
    backend: Rc<Backend>,
    catalog: Rc<Catalog>,
    registry: Rc<ModelRegistry>,
    tx: Rc<TransactionFacade>,
}

impl ModelitemEngine {
    pub fn new(backend: Rc<Backend>, catalog: Rc<Catalog>, registry: Rc<ModelRegistry>, tx: Rc<TransactionFacade>) -> Self {
        Self { backend, catalog, registry, tx }
    }

    /// Validates and coerces `inputs` into a typed [`Item`] bound to `modelname`.
    pub fn make_modelitem(&self, modelname: &str, mut inputs: BTreeMap<String, FieldInput>) -> Result<Item, DadbError> {
        let model = self.registry.model(modelname)?;
        let mut item = Item::new(modelname);
        for field in &model.fields {
            match inputs.remove(&field.name) {
                None if field.nullable => continue,
                None => return Err(DadbError::Value(dadb_sats::ValueError::MissingRequiredField(field.name.clone()))),
                Some(input) => {
                    item.fields.insert(field.name.clone(), self.coerce_field(field, input)?);
                }
            }
        }
        if let Some((leftover, _)) = inputs.into_iter().next() {
            return Err(DadbError::NoSuchField {
                model: modelname.to_string(),
                field: leftover,
            });
        }
        Ok(item)
    }

    fn coerce_field(&self, field: &FieldDefinition, input: FieldInput) -> Result<FieldSlot, DadbError> {
        match (&field.kind, field.multiple, input) {
            (FieldKind::Scalar(dt), false, FieldInput::Value(v)) => {
                self.check_scalar(field, *dt, &v)?;
                Ok(FieldSlot::Scalar(v))
            }
            (FieldKind::Scalar(dt), true, FieldInput::Values(vs)) => {
                for v in &vs {
                    self.check_scalar(field, *dt, v)?;
                }
                Ok(FieldSlot::Multi(vs))
            }
            (FieldKind::Submodel(target), false, FieldInput::Submodel(s)) => {
                self.check_submodel_target(field, target, &s)?;
                Ok(FieldSlot::Submodel(s))
            }
            (FieldKind::Submodel(target), true, FieldInput::SubmodelMulti(list)) => {
                for s in &list {
                    self.check_submodel_target(field, target, s)?;
                }
                Ok(FieldSlot::SubmodelMulti(list))
            }
            (FieldKind::Enum(target), false, FieldInput::Enum(e)) => Ok(FieldSlot::Enum(self.resolve_enum(field, target, e)?)),
            (FieldKind::Enum(target), true, FieldInput::EnumMulti(list)) => {
                let ids = list
                    .into_iter()
                    .map(|e| self.resolve_enum(field, target, e))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(FieldSlot::EnumMulti(ids))
            }
            _ => Err(DadbError::Value(dadb_sats::ValueError::TypeMismatch {
                field: field.name.clone(),
                expected: field_shape_description(field),
                found: "a differently-shaped input".to_string(),
            })),
        }
    }

    fn check_scalar(&self, field: &FieldDefinition, expected: Datatype, v: &Value) -> Result<(), DadbError> {
        if matches!(v, Value::Null) {
            return if field.nullable {
                Ok(())
            } else {
                Err(DadbError::Value(dadb_sats::ValueError::MissingRequiredField(field.name.clone())))
            };
        }
        if v.datatype() != expected {
            return Err(DadbError::Value(dadb_sats::ValueError::TypeMismatch {
                field: field.name.clone(),
                expected: expected.declaration().to_string(),
                found: v.datatype().declaration().to_string(),
            }));
        }
        Ok(())
    }

    fn check_submodel_target(&self, field: &FieldDefinition, target: &str, input: &SubmodelInput) -> Result<(), DadbError> {
        if let SubmodelInput::Item(nested) = input {
            if nested.model != target {
                return Err(DadbError::Value(dadb_sats::ValueError::TypeMismatch {
                    field: field.name.clone(),
                    expected: target.to_string(),
                    found: nested.model.clone(),
                }));
            }
        }
        Ok(())
    }

    fn resolve_enum(&self, field: &FieldDefinition, target: &str, input: EnumInput) -> Result<i64, DadbError> {
        match input {
            EnumInput::Id(id) => Ok(id),
            EnumInput::Name(name) => {
                let def = self.registry.enum_def(target)?;
                def.values.iter().find(|(_, n)| *n == name).map(|(v, _)| *v).ok_or_else(|| {
                    DadbError::Value(dadb_sats::ValueError::TypeMismatch {
                        field: field.name.clone(),
                        expected: format!("a member of enum `{target}`"),
                        found: name,
                    })
                })
            }
        }
    }

    /// Inserts `item`, deduplicating per `explicit_dedup` and the registry's
    /// scoped disable toggle. Returns the new (or matching existing) primary key.
    pub fn insert_modelitem(&self, item: &Item) -> Result<i64, DadbError> {
        self.insert_modelitem_inner(item, false)
    }

    fn insert_modelitem_inner(&self, item: &Item, cascade: bool) -> Result<i64, DadbError> {
        let model = self.registry.model(&item.model)?;
        let started = self.tx.begin(&self.backend)?;
        match self.insert_modelitem_tx(item, &model, cascade) {
            Ok(id) => {
                self.tx.end(&self.backend, started)?;
                log::trace!("engine: inserted `{}` #{id}", item.model);
                Ok(id)
            }
            Err(e) => {
                if started {
                    self.tx.rollback(&self.backend)?;
                }
                Err(e)
            }
        }
    }

    fn insert_modelitem_tx(&self, item: &Item, model: &ModelDefinition, cascade: bool) -> Result<i64, DadbError> {
        let resolved = self.resolve_fields(item)?;
        let plain_cols = self.plain_columns(model, &resolved)?;
        let field_info = self.field_info_map(&model.name)?;

        let dedup_active = !self.registry.duplicate_checking_disabled(&model.name)
            && if cascade { model.implicit_dedup } else { model.explicit_dedup };

        if dedup_active {
            if let Some(existing) = self.find_duplicate(model, &plain_cols, &resolved, &field_info)? {
                if model.fail_on_dup {
                    return Err(DadbError::DuplicateItem(model.name.clone()));
                }
                log::debug!("engine: `{}` insert deduplicated onto existing row {existing}", model.name);
                return Ok(existing);
            }
        }

        self.insert_row_and_children(model, &plain_cols, &resolved, &field_info)
    }

    /// Cascades insertion of any pending nested submodel items, producing a
    /// fully id-resolved view of `item`'s fields.
    fn resolve_fields(&self, item: &Item) -> Result<HashMap<String, ResolvedSlot>, DadbError> {
        let mut resolved = HashMap::new();
        for (name, slot) in &item.fields {
            let r = match slot {
                FieldSlot::Scalar(v) => ResolvedSlot::Scalar(v.clone()),
                FieldSlot::Multi(vs) => ResolvedSlot::Multi(vs.clone()),
                FieldSlot::Enum(id) => ResolvedSlot::EnumId(*id),
                FieldSlot::EnumMulti(ids) => ResolvedSlot::EnumMultiIds(ids.clone()),
                FieldSlot::Submodel(SubmodelInput::Id(id)) => ResolvedSlot::SubmodelId(*id),
                FieldSlot::Submodel(SubmodelInput::Item(nested)) => {
                    ResolvedSlot::SubmodelId(self.insert_modelitem_inner(nested, true)?)
                }
                FieldSlot::SubmodelMulti(list) => {
                    let mut ids = Vec::with_capacity(list.len());
                    for entry in list {
                        ids.push(match entry {
                            SubmodelInput::Id(id) => *id,
                            SubmodelInput::Item(nested) => self.insert_modelitem_inner(nested, true)?,
                        });
                    }
                    ResolvedSlot::SubmodelMultiIds(ids)
                }
            };
            resolved.insert(name.clone(), r);
        }
        Ok(resolved)
    }

    fn plain_columns(
        &self,
        model: &ModelDefinition,
        resolved: &HashMap<String, ResolvedSlot>,
    ) -> Result<Vec<(String, rusqlite::types::Value)>, DadbError> {
        let mut cols = Vec::new();
        for field in &model.fields {
            if field.multiple {
                continue;
            }
            let colname = self.catalog.get_colname(&model.name, &field.name)?;
            let value = match resolved.get(&field.name) {
                Some(ResolvedSlot::Scalar(v)) => v.encode(),
                Some(ResolvedSlot::SubmodelId(id)) | Some(ResolvedSlot::EnumId(id)) => rusqlite::types::Value::Integer(*id),
                None => rusqlite::types::Value::Null,
                Some(_) => unreachable!("multi-valued resolved slot on a single-valued field `{}`", field.name),
            };
            cols.push((colname, value));
        }
        Ok(cols)
    }

    fn field_info_map(&self, modelname: &str) -> Result<HashMap<String, FieldInfoRow>, DadbError> {
        Ok(self
            .catalog
            .field_info(Some(modelname))?
            .into_iter()
            .map(|fi| (fi.fieldname.clone(), fi))
            .collect())
    }

    /// Identity for deduplication: all plain columns equal, plus the sorted
    /// multiset of every multi-valued submodel/enum (maptable) field equal.
    /// Proptable (multi-valued scalar) fields are not part of identity.
    fn find_duplicate(
        &self,
        model: &ModelDefinition,
        plain_cols: &[(String, rusqlite::types::Value)],
        resolved: &HashMap<String, ResolvedSlot>,
        field_info: &HashMap<String, FieldInfoRow>,
    ) -> Result<Option<i64>, DadbError> {
        let tblname = self.catalog.get_tblname(&model.name)?;
        let mut clauses = Vec::new();
        let mut params: Vec<rusqlite::types::Value> = Vec::new();
        for (col, val) in plain_cols {
            if matches!(val, rusqlite::types::Value::Null) {
                clauses.push(format!("{col} IS NULL"));
            } else {
                clauses.push(format!("{col} = ?"));
                params.push(val.clone());
            }
        }
        let where_sql = if clauses.is_empty() { "1=1".to_string() } else { clauses.iter().join(" AND ") };
        let sql = format!("SELECT {pkey} FROM {tblname} WHERE {where_sql} ORDER BY {pkey}", pkey = self.catalog.pkey());

        let candidate_ids: Vec<i64> = {
            let conn = self.backend.conn();
            let mut stmt = conn.prepare(&sql)?;
            stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| row.get(0))?
                .collect::<Result<_, _>>()?
        };

        for candidate in candidate_ids {
            if self.multivalued_fields_match(model, candidate, resolved, field_info)? {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    fn multivalued_fields_match(
        &self,
        model: &ModelDefinition,
        candidate: i64,
        resolved: &HashMap<String, ResolvedSlot>,
        field_info: &HashMap<String, FieldInfoRow>,
    ) -> Result<bool, DadbError> {
        for field in &model.fields {
            if !field.multiple {
                continue;
            }
            if matches!(field.kind, FieldKind::Scalar(_)) {
                continue;
            }
            let fi = &field_info[&field.name];
            let maptbl = fi.mapping_table.as_deref().expect("multi-valued ref field missing maptable");
            let mut existing: Vec<i64> = {
                let conn = self.backend.conn();
                let mut stmt = conn.prepare(&format!("SELECT targetid FROM {maptbl} WHERE parentid = ?1"))?;
                stmt.query_map([candidate], |r| r.get(0))?.collect::<Result<_, _>>()?
            };
            existing.sort_unstable();

            let mut wanted: Vec<i64> = match resolved.get(&field.name) {
                Some(ResolvedSlot::SubmodelMultiIds(ids)) | Some(ResolvedSlot::EnumMultiIds(ids)) => ids.clone(),
                _ => Vec::new(),
            };
            wanted.sort_unstable();

            if existing != wanted {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn insert_row_and_children(
        &self,
        model: &ModelDefinition,
        plain_cols: &[(String, rusqlite::types::Value)],
        resolved: &HashMap<String, ResolvedSlot>,
        field_info: &HashMap<String, FieldInfoRow>,
    ) -> Result<i64, DadbError> {
        let tblname = self.catalog.get_tblname(&model.name)?;
        let conn = self.backend.conn();

        if plain_cols.is_empty() {
            conn.execute(&format!("INSERT INTO {tblname} DEFAULT VALUES"), [])?;
        } else {
            let cols_sql = plain_cols.iter().map(|(c, _)| c.as_str()).join(", ");
            let placeholders = (1..=plain_cols.len()).map(|i| format!("?{i}")).join(", ");
            let params: Vec<&rusqlite::types::Value> = plain_cols.iter().map(|(_, v)| v).collect();
            conn.execute(
                &format!("INSERT INTO {tblname} ({cols_sql}) VALUES ({placeholders})"),
                rusqlite::params_from_iter(params),
            )?;
        }
        let id = conn.last_insert_rowid();

        for field in &model.fields {
            if !field.multiple {
                continue;
            }
            let fi = &field_info[&field.name];
            match &field.kind {
                FieldKind::Scalar(_) => {
                    let proptbl = fi.property_table.as_deref().expect("proptable name");
                    if let Some(ResolvedSlot::Multi(values)) = resolved.get(&field.name) {
                        for v in values {
                            conn.execute(
                                &format!("INSERT INTO {proptbl} (parentid, value) VALUES (?1, ?2)"),
                                rusqlite::params![id, v.encode()],
                            )?;
                        }
                    }
                }
                FieldKind::Submodel(_) | FieldKind::Enum(_) => {
                    let maptbl = fi.mapping_table.as_deref().expect("maptable name");
                    let ids: Vec<i64> = match resolved.get(&field.name) {
                        Some(ResolvedSlot::SubmodelMultiIds(ids)) | Some(ResolvedSlot::EnumMultiIds(ids)) => ids.clone(),
                        _ => Vec::new(),
                    };
                    for target in ids {
                        conn.execute(
                            &format!("INSERT INTO {maptbl} (parentid, targetid) VALUES (?1, ?2)"),
                            rusqlite::params![id, target],
                        )?;
                    }
                }
            }
        }
        Ok(id)
    }

    /// Fetches `modelname`'s row `id`, resolving submodel/enum references to
    /// ids (not nested items, see [`ModelitemEngine::resolve_submodel`]).
    pub fn modelitem(&self, modelname: &str, id: i64) -> Result<Item, DadbError> {
        let model = self.registry.model(modelname)?;
        let tblname = self.catalog.get_tblname(modelname)?;
        let field_info = self.field_info_map(modelname)?;
        let pkey = self.catalog.pkey();

        let single_fields: Vec<&FieldDefinition> = model.fields.iter().filter(|f| !f.multiple).collect();
        let cols: Vec<String> = single_fields
            .iter()
            .map(|f| self.catalog.get_colname(modelname, &f.name))
            .collect::<Result<_, _>>()?;

        let conn = self.backend.conn();
        let row_values: Vec<rusqlite::types::Value> = if cols.is_empty() {
            conn.query_row(&format!("SELECT {pkey} FROM {tblname} WHERE {pkey} = ?1"), [id], |_| Ok(Vec::new()))
        } else {
            let sql = format!("SELECT {} FROM {tblname} WHERE {pkey} = ?1", cols.join(", "));
            conn.query_row(&sql, [id], |row| (0..cols.len()).map(|i| row.get(i)).collect())
        }
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => DadbError::NoSuchModelItem {
                model: modelname.to_string(),
                id,
            },
            other => other.into(),
        })?;

        let mut item = Item::new(modelname);
        item.pkey = Some(id);
        for (field, raw) in single_fields.iter().zip(row_values.into_iter()) {
            if matches!(raw, rusqlite::types::Value::Null) {
                continue;
            }
            let slot = match &field.kind {
                FieldKind::Scalar(dt) => FieldSlot::Scalar(Value::decode(*dt, (&raw).into())?),
                FieldKind::Submodel(_) => FieldSlot::Submodel(SubmodelInput::Id(as_i64(&field.name, &raw)?)),
                FieldKind::Enum(_) => FieldSlot::Enum(as_i64(&field.name, &raw)?),
            };
            item.fields.insert(field.name.clone(), slot);
        }

        for field in model.fields.iter().filter(|f| f.multiple) {
            let fi = &field_info[&field.name];
            let slot = match &field.kind {
                FieldKind::Scalar(dt) => {
                    let proptbl = fi.property_table.as_deref().expect("proptable name");
                    let mut stmt = conn.prepare(&format!("SELECT value FROM {proptbl} WHERE parentid = ?1 ORDER BY rowid"))?;
                    let raws: Vec<rusqlite::types::Value> =
                        stmt.query_map([id], |row| row.get(0))?.collect::<Result<_, _>>()?;
                    let values = raws
                        .iter()
                        .map(|r| Value::decode(*dt, r.into()).map_err(DadbError::from))
                        .collect::<Result<Vec<_>, _>>()?;
                    FieldSlot::Multi(values)
                }
                FieldKind::Submodel(_) | FieldKind::Enum(_) => {
                    let maptbl = fi.mapping_table.as_deref().expect("maptable name");
                    let mut stmt = conn.prepare(&format!("SELECT targetid FROM {maptbl} WHERE parentid = ?1 ORDER BY rowid"))?;
                    let ids: Vec<i64> = stmt.query_map([id], |row| row.get(0))?.collect::<Result<_, _>>()?;
                    if matches!(field.kind, FieldKind::Enum(_)) {
                        FieldSlot::EnumMulti(ids)
                    } else {
                        FieldSlot::SubmodelMulti(ids.into_iter().map(SubmodelInput::Id).collect())
                    }
                }
            };
            item.fields.insert(field.name.clone(), slot);
        }

        Ok(item)
    }

    /// Materializes the nested item behind a single-valued submodel field.
    /// Driven by the registry's cache, not by ownership: the returned item
    /// has no lifetime tie to `item`.
    pub fn resolve_submodel(&self, item: &Item, field: &str) -> Result<Item, DadbError> {
        let model = self.registry.model(&item.model)?;
        let def = model
            .fields
            .iter()
            .find(|f| f.name == field)
            .ok_or_else(|| DadbError::NoSuchField {
                model: item.model.clone(),
                field: field.to_string(),
            })?;
        let target = match &def.kind {
            FieldKind::Submodel(target) => target,
            _ => {
                return Err(DadbError::NoSuchField {
                    model: item.model.clone(),
                    field: field.to_string(),
                })
            }
        };
        let id = item.submodel_id(field).ok_or_else(|| DadbError::NoSuchField {
            model: item.model.clone(),
            field: field.to_string(),
        })?;
        self.modelitem(target, id)
    }

    /// Streams every row of `modelname` in ascending primary-key order. The
    /// id list is captured at call time (so the iteration reflects the state
    /// at cursor open); each item is then fetched lazily as the caller
    /// advances, so full rows are never buffered.
    pub fn modelitems(&self, modelname: &str) -> Result<ModelitemIter<'_>, DadbError> {
        if !self.registry.model_exists(modelname) {
            return Err(DadbError::no_such_model(modelname));
        }
        let tblname = self.catalog.get_tblname(modelname)?;
        let pkey = self.catalog.pkey();
        let ids: Vec<i64> = {
            let conn = self.backend.conn();
            let mut stmt = conn.prepare(&format!("SELECT {pkey} FROM {tblname} ORDER BY {pkey}"))?;
            stmt.query_map([], |row| row.get(0))?.collect::<Result<_, _>>()?
        };
        Ok(ModelitemIter {
            engine: self,
            modelname: modelname.to_string(),
            ids: ids.into_iter(),
        })
    }
}

pub struct ModelitemIter<'e> {
    engine: &'e ModelitemEngine,
    modelname: String,
    ids: std::vec::IntoIter<i64>,
}

impl Iterator for ModelitemIter<'_> {
    type Item = Result<Item, DadbError>;

    fn next(&mut self) -> Option<Self::Item> {
        let id = self.ids.next()?;
        Some(self.engine.modelitem(&self.modelname, id))
    }
}

fn as_i64(field: &str, v: &rusqlite::types::Value) -> Result<i64, DadbError> {
    match v {
        rusqlite::types::Value::Integer(i) => Ok(*i),
        other => Err(DadbError::Value(dadb_sats::ValueError::TypeMismatch {
            field: field.to_string(),
            expected: "Integer".to_string(),
            found: format!("{other:?}"),
        })),
    }
}

fn field_shape_description(field: &FieldDefinition) -> String {
    let base = match &field.kind {
        FieldKind::Scalar(dt) => dt.declaration().to_string(),
        FieldKind::Submodel(m) => format!("submodel `{m}`"),
        FieldKind::Enum(e) => format!("enum `{e}`"),
    };
    if field.multiple {
        format!("a list of {base}")
    } else {
        base
    }
}
