//! The meta-schema catalog: the six operational tables, the `_fieldinfo_`
//! view, and registration/lookup primitives built on top of them.

use std::rc::Rc;

use dadb_datastore::{Backend, TransactionFacade};
use dadb_sats::{validate_identifier, Datatype};
use itertools::Itertools;

use crate::definitions::{EnumDefinition, FieldDefinition, FieldKind, ModelDefinition};
use crate::error::SchemaError;

pub const SCHEMAVERSION: u32 = 3;
pub const APIVERSION: u32 = 1;

const RESERVEDTBL: &str = "_reserved_";
const ENUMTBL: &str = "_enum_";
const MODELTBL: &str = "_model_";
const FIELDTBL: &str = "_field_";
const MAPTBL: &str = "_maptable_";
const PROPTBL: &str = "_proptable_";
const FIELDINFOVIEW: &str = "_fieldinfo_";

/// The `reserved` row, read back verbatim on every `load`.
#[derive(Debug, Clone)]
pub struct ReservedRow {
    pub pkey: String,
    pub prefix: String,
    pub schemaversion: u32,
    pub apiversion: u32,
    pub timeline_blacklist: Vec<String>,
}

/// One row of the `_fieldinfo_` view.
#[derive(Debug, Clone)]
pub struct FieldInfoRow {
    pub modelname: String,
    pub modeltable: String,
    pub fieldname: String,
    pub columnname: Option<String>,
    pub datatype: Option<String>,
    pub preview: bool,
    pub points_to: Option<String>,
    pub maps_to: Option<String>,
    pub mapping_table: Option<String>,
    pub property_table: Option<String>,
    pub property_datatype: Option<String>,
}

/// Registration metadata for a model, as stored in the `model` meta row.
#[derive(Debug, Clone)]
pub struct ModelMeta {
    pub source: String,
    pub version: u32,
    pub explicit_dedup: bool,
    pub implicit_dedup: bool,
    pub fail_on_dup: bool,
}

/// Registration metadata for an enum, as stored in the `enum` meta row.
#[derive(Debug, Clone)]
pub struct EnumMeta {
    pub source: String,
    pub version: u32,
}

/// A raw `field` row with submodel/enum targets resolved to names, used to
/// reconstruct a [`FieldDefinition`] on reload.
#[derive(Debug, Clone)]
pub struct RawFieldRow {
    pub name: String,
    pub datatype: Option<String>,
    pub nullable: bool,
    pub multiple: bool,
    pub preview: bool,
    pub submodel: Option<String>,
    pub enum_name: Option<String>,
}

pub struct Catalog {
    backend: Rc<Backend>,
    tx: Rc<TransactionFacade>,
    prefix: String,
    pkey: String,
}

impl Catalog {
    /// `tx` is shared with whatever else sits on top of this catalog (the
    /// modelitem engine, the public transaction facade) so that a
    /// registration call made inside a caller's own transaction composes
    /// instead of attempting a second `BEGIN` against the same connection.
    pub fn new(backend: Rc<Backend>, tx: Rc<TransactionFacade>, prefix: impl Into<String>, pkey: impl Into<String>) -> Self {
        Self {
            backend,
            tx,
            prefix: prefix.into(),
            pkey: pkey.into(),
        }
    }

    /// Reads just the `prefix`/`pkey` columns of the `reserved` row, before a
    /// `Catalog` carrying the right names can even be constructed. `load()`
    /// uses this to bootstrap onto whatever prefix/pkey the repository was
    /// created with, rather than assuming the caller already knows them.
    pub fn peek_prefix_pkey(backend: &Backend) -> Result<(String, String), SchemaError> {
        backend
            .conn()
            .query_row(&format!("SELECT prefix_, pkey_ FROM {RESERVEDTBL}"), [], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(missing_reserved_row)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn pkey(&self) -> &str {
        &self.pkey
    }

    fn in_transaction<T>(&self, f: impl FnOnce() -> Result<T, SchemaError>) -> Result<T, SchemaError> {
        let started = self.tx.begin(&self.backend)?;
        match f() {
            Ok(value) => {
                self.tx.end(&self.backend, started)?;
                Ok(value)
            }
            Err(e) => {
                self.tx.rollback(&self.backend)?;
                Err(e)
            }
        }
    }

    fn physical_name(&self, logical: &str) -> Result<String, SchemaError> {
        validate_identifier(logical)?;
        Ok(format!("{}{}", self.prefix, logical))
    }

    /// Issues the DDL for the six meta tables and seeds `reserved`.
    pub fn create_schema(&self, blacklist: &[String]) -> Result<(), SchemaError> {
        let sql = format!(
            "CREATE TABLE {reserved} (
                pkey_ TEXT,
                schemaversion INTEGER NOT NULL,
                apiversion INTEGER NOT NULL,
                prefix_ TEXT,
                timeline_blacklist TEXT
            );
            CREATE TABLE {enumtbl} (
                id_ INTEGER PRIMARY KEY AUTOINCREMENT,
                name_ TEXT NOT NULL UNIQUE,
                table_ TEXT NOT NULL,
                source_ TEXT NOT NULL,
                version_ INTEGER NOT NULL,
                table_prefix_ TEXT NOT NULL
            );
            CREATE TABLE {modeltbl} (
                id_ INTEGER PRIMARY KEY AUTOINCREMENT,
                name_ TEXT NOT NULL UNIQUE,
                table_ TEXT NOT NULL,
                source_ TEXT NOT NULL,
                version_ INTEGER NOT NULL,
                table_prefix_ TEXT NOT NULL,
                field_prefix_ TEXT NOT NULL,
                explicit_dedup_ INTEGER,
                implicit_dedup_ INTEGER,
                fail_on_dup_ INTEGER
            );
            CREATE TABLE {fieldtbl} (
                id_ INTEGER PRIMARY KEY AUTOINCREMENT,
                modelid_ INTEGER NOT NULL,
                name_ TEXT NOT NULL,
                colname_ TEXT,
                datatype_ TEXT,
                nullable_ INTEGER,
                multiple_ INTEGER,
                submodel_ INTEGER,
                enum_ INTEGER,
                preview_ INTEGER,
                UNIQUE (modelid_, name_)
            );
            CREATE TABLE {maptbl} (
                field_ INTEGER,
                maptable_ TEXT UNIQUE,
                enum_ INTEGER,
                model_ INTEGER,
                PRIMARY KEY (field_, maptable_)
            );
            CREATE TABLE {proptbl} (
                field_ INTEGER,
                datatype_ TEXT,
                proptable_ TEXT,
                PRIMARY KEY (field_, proptable_)
            );",
            reserved = RESERVEDTBL,
            enumtbl = ENUMTBL,
            modeltbl = MODELTBL,
            fieldtbl = FIELDTBL,
            maptbl = MAPTBL,
            proptbl = PROPTBL,
        );
        self.backend.execute_batch(&sql)?;
        self.create_fieldinfo_view()?;

        self.backend.conn().execute(
            &format!(
                "INSERT INTO {reserved} (pkey_, schemaversion, apiversion, prefix_, timeline_blacklist)
                 VALUES (?1, ?2, ?3, ?4, ?5)"
            ),
            rusqlite::params![self.pkey, SCHEMAVERSION, APIVERSION, self.prefix, blacklist.join(",")],
        )?;
        log::info!("catalog: created meta-schema (prefix={}, pkey={})", self.prefix, self.pkey);
        Ok(())
    }

    /// Reads and validates the `reserved` row on `load()`.
    pub fn load(&self) -> Result<ReservedRow, SchemaError> {
        let (pkey, schemaversion, apiversion, prefix, blacklist): (String, u32, u32, String, String) = self
            .backend
            .conn()
            .query_row(
                &format!("SELECT pkey_, schemaversion, apiversion, prefix_, timeline_blacklist FROM {RESERVEDTBL}"),
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .map_err(missing_reserved_row)?;

        if schemaversion != SCHEMAVERSION || apiversion != APIVERSION {
            return Err(SchemaError::SchemaVersionMismatch {
                expected_schema: SCHEMAVERSION,
                found_schema: schemaversion,
                expected_api: APIVERSION,
                found_api: apiversion,
            });
        }

        let timeline_blacklist = if blacklist.is_empty() {
            Vec::new()
        } else {
            blacklist.split(',').map(str::to_string).collect()
        };

        log::info!("catalog: loaded meta-schema (prefix={prefix}, pkey={pkey})");
        Ok(ReservedRow {
            pkey,
            prefix,
            schemaversion,
            apiversion,
            timeline_blacklist,
        })
    }

    pub fn set_timeline_blacklist(&self, blacklist: &[String]) -> Result<(), SchemaError> {
        self.backend.conn().execute(
            &format!("UPDATE {RESERVEDTBL} SET timeline_blacklist = ?1"),
            [blacklist.join(",")],
        )?;
        Ok(())
    }

    fn create_fieldinfo_view(&self) -> Result<(), SchemaError> {
        let sql = format!(
            "DROP VIEW IF EXISTS {view};
            CREATE VIEW {view} AS
            SELECT {model}.name_ AS modelname_,
                   {model}.table_ AS modeltable_,
                   {field}.name_ AS fieldname_,
                   {field}.colname_ AS columnname_,
                   {field}.datatype_ AS datatype_,
                   {field}.preview_ AS preview_,
                   (SELECT CASE
                      WHEN {field}.submodel_ IS NOT NULL THEN (SELECT table_ FROM {model} WHERE id_ = {field}.submodel_)
                      WHEN {field}.enum_ IS NOT NULL THEN (SELECT table_ FROM {enumtbl} WHERE id_ = {field}.enum_)
                    END) AS points_to_,
                   (SELECT CASE
                      WHEN {maptbl}.enum_ IS NOT NULL THEN (SELECT table_ FROM {enumtbl} WHERE id_ = {maptbl}.enum_)
                      WHEN {maptbl}.model_ IS NOT NULL THEN (SELECT table_ FROM {model} WHERE id_ = {maptbl}.model_)
                    END) AS maps_to_,
                   {maptbl}.maptable_ AS mapping_table_,
                   {proptbl}.proptable_ AS property_table_,
                   {proptbl}.datatype_ AS property_datatype_
            FROM {field}
            LEFT JOIN {model} ON {field}.modelid_ = {model}.id_
            LEFT JOIN {maptbl} ON {field}.id_ = {maptbl}.field_
            LEFT JOIN {proptbl} ON {field}.id_ = {proptbl}.field_;",
            view = FIELDINFOVIEW,
            model = MODELTBL,
            field = FIELDTBL,
            enumtbl = ENUMTBL,
            maptbl = MAPTBL,
            proptbl = PROPTBL,
        );
        self.backend.execute_batch(&sql)?;
        Ok(())
    }

    pub fn get_tblname(&self, modelname: &str) -> Result<String, SchemaError> {
        self.backend
            .conn()
            .query_row(&format!("SELECT table_ FROM {MODELTBL} WHERE name_ = ?1"), [modelname], |row| row.get(0))
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => SchemaError::NoSuchModel(modelname.to_string()),
                other => other.into(),
            })
    }

    pub fn get_enum_tblname(&self, enumname: &str) -> Result<String, SchemaError> {
        self.backend
            .conn()
            .query_row(&format!("SELECT table_ FROM {ENUMTBL} WHERE name_ = ?1"), [enumname], |row| row.get(0))
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => SchemaError::NoSuchEnum(enumname.to_string()),
                other => other.into(),
            })
    }

    pub fn get_colname(&self, modelname: &str, fieldname: &str) -> Result<String, SchemaError> {
        self.backend
            .conn()
            .query_row(
                &format!(
                    "SELECT {field}.colname_ FROM {field}
                     JOIN {model} ON {field}.modelid_ = {model}.id_
                     WHERE {model}.name_ = ?1 AND {field}.name_ = ?2",
                    field = FIELDTBL,
                    model = MODELTBL,
                ),
                rusqlite::params![modelname, fieldname],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => SchemaError::NoSuchField {
                    model: modelname.to_string(),
                    field: fieldname.to_string(),
                },
                other => other.into(),
            })
    }

    pub fn model_id(&self, modelname: &str) -> Result<i64, SchemaError> {
        self.backend
            .conn()
            .query_row(&format!("SELECT id_ FROM {MODELTBL} WHERE name_ = ?1"), [modelname], |row| row.get(0))
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => SchemaError::NoSuchModel(modelname.to_string()),
                other => other.into(),
            })
    }

    pub fn model_exists(&self, modelname: &str) -> Result<bool, SchemaError> {
        let count: i64 = self
            .backend
            .conn()
            .query_row(&format!("SELECT COUNT(*) FROM {MODELTBL} WHERE name_ = ?1"), [modelname], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// All rows of `_fieldinfo_`, optionally restricted to one model.
    pub fn field_info(&self, modelname: Option<&str>) -> Result<Vec<FieldInfoRow>, SchemaError> {
        let sql = match modelname {
            Some(_) => format!("SELECT * FROM {FIELDINFOVIEW} WHERE modelname_ = ?1"),
            None => format!("SELECT * FROM {FIELDINFOVIEW}"),
        };
        let conn = self.backend.conn();
        let mut stmt = conn.prepare(&sql)?;
        let map_row = |row: &rusqlite::Row| -> rusqlite::Result<FieldInfoRow> {
            Ok(FieldInfoRow {
                modelname: row.get("modelname_")?,
                modeltable: row.get("modeltable_")?,
                fieldname: row.get("fieldname_")?,
                columnname: row.get("columnname_")?,
                datatype: row.get("datatype_")?,
                preview: row.get::<_, Option<i64>>("preview_")?.unwrap_or(0) != 0,
                points_to: row.get("points_to_")?,
                maps_to: row.get("maps_to_")?,
                mapping_table: row.get("mapping_table_")?,
                property_table: row.get("property_table_")?,
                property_datatype: row.get("property_datatype_")?,
            })
        };
        let rows: Vec<FieldInfoRow> = match modelname {
            Some(name) => stmt.query_map([name], map_row)?.collect::<Result<_, _>>()?,
            None => stmt.query_map([], map_row)?.collect::<Result<_, _>>()?,
        };
        Ok(rows)
    }

    /// Registered model names, in registration order. Used to rebuild the
    /// in-memory model registry on `load`/`reload`.
    pub fn list_model_names(&self) -> Result<Vec<String>, SchemaError> {
        let conn = self.backend.conn();
        let mut stmt = conn.prepare(&format!("SELECT name_ FROM {MODELTBL} ORDER BY id_"))?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?.collect::<Result<_, _>>()?;
        Ok(names)
    }

    /// Registered enum names, in registration order.
    pub fn list_enum_names(&self) -> Result<Vec<String>, SchemaError> {
        let conn = self.backend.conn();
        let mut stmt = conn.prepare(&format!("SELECT name_ FROM {ENUMTBL} ORDER BY id_"))?;
        let names = stmt.query_map([], |row| row.get::<_, String>(0))?.collect::<Result<_, _>>()?;
        Ok(names)
    }

    /// The registration metadata (version, source, dedup flags) for a model,
    /// read straight off the `model` meta row.
    pub fn model_meta(&self, modelname: &str) -> Result<ModelMeta, SchemaError> {
        self.backend
            .conn()
            .query_row(
                &format!(
                    "SELECT source_, version_, explicit_dedup_, implicit_dedup_, fail_on_dup_ FROM {MODELTBL} WHERE name_ = ?1"
                ),
                [modelname],
                |row| {
                    Ok(ModelMeta {
                        source: row.get(0)?,
                        version: row.get(1)?,
                        explicit_dedup: row.get(2)?,
                        implicit_dedup: row.get(3)?,
                        fail_on_dup: row.get(4)?,
                    })
                },
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => SchemaError::NoSuchModel(modelname.to_string()),
                other => other.into(),
            })
    }

    /// The registration metadata (version, source) for an enum.
    pub fn enum_meta(&self, enumname: &str) -> Result<EnumMeta, SchemaError> {
        self.backend
            .conn()
            .query_row(
                &format!("SELECT source_, version_ FROM {ENUMTBL} WHERE name_ = ?1"),
                [enumname],
                |row| Ok(EnumMeta { source: row.get(0)?, version: row.get(1)? }),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => SchemaError::NoSuchEnum(enumname.to_string()),
                other => other.into(),
            })
    }

    /// The `(value, name)` pairs of a registered enum's backing table, in insertion order.
    pub fn enum_values(&self, enumname: &str) -> Result<Vec<(i64, String)>, SchemaError> {
        let tblname = self.get_enum_tblname(enumname)?;
        let valcol = format!("{}val", self.prefix);
        let namecol = format!("{}name", self.prefix);
        let conn = self.backend.conn();
        let mut stmt = conn.prepare(&format!("SELECT {valcol}, {namecol} FROM {tblname} ORDER BY {valcol}"))?;
        let values = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<_, _>>()?;
        Ok(values)
    }

    /// Raw field rows for a model, with submodel/enum targets resolved to
    /// names rather than ids, sufficient to reconstruct a [`FieldDefinition`].
    pub fn fields_raw(&self, modelname: &str) -> Result<Vec<RawFieldRow>, SchemaError> {
        let conn = self.backend.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT f.name_, f.datatype_, f.nullable_, f.multiple_, f.preview_,
                    (SELECT name_ FROM {model} WHERE id_ = f.submodel_) AS submodel_name,
                    (SELECT name_ FROM {enumtbl} WHERE id_ = f.enum_) AS enum_name
             FROM {field} f
             JOIN {model} m ON f.modelid_ = m.id_
             WHERE m.name_ = ?1
             ORDER BY f.id_",
            field = FIELDTBL,
            model = MODELTBL,
            enumtbl = ENUMTBL,
        ))?;
        let rows = stmt
            .query_map([modelname], |row| {
                Ok(RawFieldRow {
                    name: row.get(0)?,
                    datatype: row.get(1)?,
                    nullable: row.get::<_, Option<i64>>(2)?.unwrap_or(0) != 0,
                    multiple: row.get::<_, Option<i64>>(3)?.unwrap_or(0) != 0,
                    preview: row.get::<_, Option<i64>>(4)?.unwrap_or(0) != 0,
                    submodel: row.get(5)?,
                    enum_name: row.get(6)?,
                })
            })?
            .collect::<Result<_, _>>()?;
        Ok(rows)
    }

    pub fn register_enum(&self, def: &EnumDefinition) -> Result<i64, SchemaError> {
        if let Some(existing) = self.existing_enum(&def.name)? {
            if existing.version != def.version || existing.source != def.source {
                return Err(SchemaError::EnumConflict {
                    name: def.name.clone(),
                    reason: "version or source differs from the registered enum".to_string(),
                });
            }
            return Ok(existing.id);
        }

        self.in_transaction(|| {
            validate_identifier(&def.name)?;
            let tblname = self.physical_name(&def.name)?;
            self.backend.conn().execute(
                &format!(
                    "INSERT INTO {ENUMTBL} (name_, table_, source_, version_, table_prefix_) VALUES (?1, ?2, ?3, ?4, ?5)"
                ),
                rusqlite::params![def.name, tblname, def.source, def.version, self.prefix],
            )?;
            let id = self.backend.conn().last_insert_rowid();

            let valcol = format!("{}val", self.prefix);
            let namecol = format!("{}name", self.prefix);
            self.backend.execute_batch(&format!(
                "CREATE TABLE {tblname} (
                    {valcol} INTEGER PRIMARY KEY NOT NULL,
                    {namecol} TEXT NOT NULL,
                    UNIQUE ({valcol}, {namecol})
                );"
            ))?;

            for (value, name) in &def.values {
                self.backend.conn().execute(
                    &format!("INSERT INTO {tblname} ({valcol}, {namecol}) VALUES (?1, ?2)"),
                    rusqlite::params![value, name],
                )?;
            }
            log::info!("catalog: registered enum `{}` ({} values)", def.name, def.values.len());
            Ok(id)
        })
    }

    fn existing_enum(&self, name: &str) -> Result<Option<ExistingEnum>, SchemaError> {
        self.backend
            .conn()
            .query_row(
                &format!("SELECT id_, version_, source_ FROM {ENUMTBL} WHERE name_ = ?1"),
                [name],
                |row| {
                    Ok(ExistingEnum {
                        id: row.get(0)?,
                        version: row.get(1)?,
                        source: row.get(2)?,
                    })
                },
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other.into()),
            })
    }

    pub fn register_model(&self, def: &ModelDefinition) -> Result<i64, SchemaError> {
        if self.model_exists(&def.name)? {
            return self.check_model_compatible(def);
        }

        self.in_transaction(|| {
            validate_identifier(&def.name)?;
            let tblname = self.physical_name(&def.name)?;
            let field_prefix = self.prefix.clone();

            self.backend.conn().execute(
                &format!(
                    "INSERT INTO {MODELTBL}
                     (name_, table_, source_, version_, table_prefix_, field_prefix_, explicit_dedup_, implicit_dedup_, fail_on_dup_)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                ),
                rusqlite::params![
                    def.name,
                    tblname,
                    def.source,
                    def.version,
                    self.prefix,
                    field_prefix,
                    def.explicit_dedup,
                    def.implicit_dedup,
                    def.fail_on_dup,
                ],
            )?;
            let modelid = self.backend.conn().last_insert_rowid();

            let mut plain_columns: Vec<(String, &'static str)> = Vec::new();
            let mut maptables: Vec<(String, String)> = Vec::new(); // (tablename, role: "enum"/"model" with id appended by caller)
            let mut proptables: Vec<(String, Datatype)> = Vec::new();

            for field in &def.fields {
                validate_identifier(&field.name)?;
                let colname = format!("{field_prefix}{}", field.name);

                match (&field.kind, field.multiple) {
                    (FieldKind::Scalar(dt), false) => {
                        self.insert_field_row(modelid, field, Some(&colname), Some(dt.declaration()), None, None)?;
                        plain_columns.push((colname, dt.column_type()));
                    }
                    (FieldKind::Scalar(dt), true) => {
                        self.insert_field_row(modelid, field, None, Some(dt.declaration()), None, None)?;
                        let proptblname = format!("{tblname}_{}", field.name);
                        self.backend.conn().execute(
                            &format!("INSERT INTO {PROPTBL} (field_, datatype_, proptable_) VALUES (last_insert_rowid(), ?1, ?2)"),
                            rusqlite::params![dt.declaration(), proptblname],
                        )?;
                        proptables.push((proptblname, *dt));
                    }
                    (FieldKind::Submodel(target), false) => {
                        let targetid = self.model_id(target)?;
                        self.insert_field_row(modelid, field, Some(&colname), None, Some(targetid), None)?;
                        plain_columns.push((colname, "INTEGER"));
                    }
                    (FieldKind::Enum(target), false) => {
                        let targetid = self.enum_id(target)?;
                        self.insert_field_row(modelid, field, Some(&colname), None, None, Some(targetid))?;
                        plain_columns.push((colname, "INTEGER"));
                    }
                    (FieldKind::Submodel(target), true) => {
                        let targetid = self.model_id(target)?;
                        self.insert_field_row(modelid, field, None, None, Some(targetid), None)?;
                        let maptblname = format!("{tblname}_{}", field.name);
                        self.backend.conn().execute(
                            &format!("INSERT INTO {MAPTBL} (field_, maptable_, model_) VALUES (last_insert_rowid(), ?1, ?2)"),
                            rusqlite::params![maptblname, targetid],
                        )?;
                        maptables.push((maptblname, "model".to_string()));
                    }
                    (FieldKind::Enum(target), true) => {
                        let targetid = self.enum_id(target)?;
                        self.insert_field_row(modelid, field, None, None, None, Some(targetid))?;
                        let maptblname = format!("{tblname}_{}", field.name);
                        self.backend.conn().execute(
                            &format!("INSERT INTO {MAPTBL} (field_, maptable_, enum_) VALUES (last_insert_rowid(), ?1, ?2)"),
                            rusqlite::params![maptblname, targetid],
                        )?;
                        maptables.push((maptblname, "enum".to_string()));
                    }
                }
            }

            let mut ddl = format!("CREATE TABLE {tblname} (\n    {} INTEGER PRIMARY KEY AUTOINCREMENT", self.pkey);
            for (col, coltype) in &plain_columns {
                ddl.push_str(&format!(",\n    {col} {coltype}"));
            }
            ddl.push_str("\n);");
            self.backend.execute_batch(&ddl)?;

            for (maptblname, _) in &maptables {
                self.backend.execute_batch(&format!(
                    "CREATE TABLE {maptblname} (parentid INTEGER NOT NULL, targetid INTEGER NOT NULL);"
                ))?;
            }
            for (proptblname, dt) in &proptables {
                self.backend.execute_batch(&format!(
                    "CREATE TABLE {proptblname} (parentid INTEGER NOT NULL, value {});",
                    dt.column_type()
                ))?;
            }

            log::info!("catalog: registered model `{}` ({} fields)", def.name, def.fields.len());
            Ok(modelid)
        })
    }

    fn insert_field_row(
        &self,
        modelid: i64,
        field: &FieldDefinition,
        colname: Option<&str>,
        datatype: Option<&str>,
        submodel: Option<i64>,
        enum_: Option<i64>,
    ) -> Result<(), SchemaError> {
        self.backend.conn().execute(
            &format!(
                "INSERT INTO {FIELDTBL} (modelid_, name_, colname_, datatype_, nullable_, multiple_, submodel_, enum_, preview_)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            rusqlite::params![modelid, field.name, colname, datatype, field.nullable, field.multiple, submodel, enum_, field.preview],
        )?;
        Ok(())
    }

    fn enum_id(&self, name: &str) -> Result<i64, SchemaError> {
        self.backend
            .conn()
            .query_row(&format!("SELECT id_ FROM {ENUMTBL} WHERE name_ = ?1"), [name], |row| row.get(0))
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => SchemaError::NoSuchEnum(name.to_string()),
                other => other.into(),
            })
    }

    pub fn timeline_view_name(&self) -> String {
        format!("{}Timeline_", self.prefix)
    }

    /// Drops and recreates `xTimeline_` over every `Datetime`/`Date` field of
    /// every registered model whose name is not in `excluded`. Returns
    /// whether a view now exists (it is omitted entirely when there is
    /// nothing to union).
    pub fn regenerate_timeline(&self, excluded: &[String]) -> Result<bool, SchemaError> {
        for name in excluded {
            if !self.model_exists(name)? {
                return Err(SchemaError::Value(dadb_sats::ValueError::UnknownTimelineModel(name.clone())));
            }
        }

        self.in_transaction(|| {
            let view = self.timeline_view_name();
            self.backend.execute_batch(&format!("DROP VIEW IF EXISTS {view}"))?;

            let temporal: Vec<FieldInfoRow> = self
                .field_info(None)?
                .into_iter()
                .filter(|f| matches!(f.datatype.as_deref(), Some("Datetime") | Some("Date")))
                .filter(|f| !excluded.contains(&f.modelname))
                .collect();

            if temporal.is_empty() {
                log::info!("catalog: no temporal fields registered, skipping timeline view");
                return Ok(false);
            }

            let subqueries: Result<Vec<String>, SchemaError> =
                temporal.iter().map(|fd| self.modeltimeline_subquery(fd)).collect();
            let subqueries = subqueries?;

            self.backend.execute_batch(&format!(
                "CREATE VIEW {view} AS {} ORDER BY timestamp_;",
                subqueries.iter().join("\n\nUNION\n\n")
            ))?;
            log::info!("catalog: regenerated {view} over {} field(s)", temporal.len());
            Ok(true)
        })
    }

    fn modeltimeline_subquery(&self, fd: &FieldInfoRow) -> Result<String, SchemaError> {
        let colname = fd
            .columnname
            .as_deref()
            .ok_or_else(|| SchemaError::NoSuchField {
                model: fd.modelname.clone(),
                field: fd.fieldname.clone(),
            })?;

        let preview_columns: Vec<(String, String)> = self
            .field_info(Some(&fd.modelname))?
            .into_iter()
            .filter(|c| !matches!(c.datatype.as_deref(), None | Some("Bytes")))
            .filter(|c| c.preview)
            .filter_map(|c| c.columnname.map(|col| (c.fieldname, col)))
            .collect();

        let preview = if preview_columns.is_empty() {
            "''".to_string()
        } else {
            preview_columns
                .iter()
                .map(|(fieldname, col)| format!("'{fieldname}:' || COALESCE(CAST({col} AS TEXT),'')"))
                .join(" || '|' || ")
        };

        Ok(format!(
            "SELECT {colname} AS timestamp_,\n'{fieldname}' AS timestampfield_,\n'{modeltable}' AS table_,\n\
             {pkey} AS {prefix}{pkey},\n{preview} AS preview_\nFROM {modeltable}\nWHERE {colname} IS NOT NULL",
            fieldname = fd.fieldname,
            modeltable = fd.modeltable,
            pkey = self.pkey,
            prefix = self.prefix,
        ))
    }

    fn check_model_compatible(&self, def: &ModelDefinition) -> Result<i64, SchemaError> {
        let (id, version, source): (i64, u32, String) = self.backend.conn().query_row(
            &format!("SELECT id_, version_, source_ FROM {MODELTBL} WHERE name_ = ?1"),
            [&def.name],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        if version != def.version || source != def.source {
            return Err(SchemaError::ModelConflict {
                name: def.name.clone(),
                reason: "version or source differs from the registered model".to_string(),
            });
        }

        let existing_fields = self.field_info(Some(&def.name))?;
        if existing_fields.len() != def.fields.len() {
            return Err(SchemaError::ModelConflict {
                name: def.name.clone(),
                reason: "field count differs from the registered model".to_string(),
            });
        }
        for (existing, new) in existing_fields.iter().zip(def.fields.iter()) {
            if existing.fieldname != new.name {
                return Err(SchemaError::ModelConflict {
                    name: def.name.clone(),
                    reason: format!("field order or name differs: expected `{}`, found `{}`", new.name, existing.fieldname),
                });
            }
        }

        Ok(id)
    }
}

struct ExistingEnum {
    id: i64,
    version: u32,
    source: String,
}

/// Maps the two ways a file that never had a `reserved` row surfaces through
/// `rusqlite`: an empty result set (the table exists but was never seeded)
/// and a missing table entirely (the file is not a DADB repository at all).
fn missing_reserved_row(e: rusqlite::Error) -> SchemaError {
    match &e {
        rusqlite::Error::QueryReturnedNoRows => SchemaError::NoReservedRow,
        rusqlite::Error::SqliteFailure(_, Some(msg)) if msg.contains("no such table") => SchemaError::NoReservedRow,
        _ => SchemaError::Backend(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definitions::FieldDefinition;
    use dadb_datastore::Backend;

    fn catalog() -> Catalog {
        let backend = Rc::new(Backend::open_in_memory().unwrap());
        let catalog = Catalog::new(backend, Rc::new(TransactionFacade::new()), "x", "id");
        catalog.create_schema(&[]).unwrap();
        catalog
    }

    #[test]
    fn create_then_load_round_trips_reserved_row() {
        let catalog = catalog();
        let reserved = catalog.load().unwrap();
        assert_eq!(reserved.prefix, "x");
        assert_eq!(reserved.pkey, "id");
        assert_eq!(reserved.schemaversion, SCHEMAVERSION);
        assert_eq!(reserved.apiversion, APIVERSION);
        assert!(reserved.timeline_blacklist.is_empty());
    }

    #[test]
    fn register_model_creates_backing_table_and_field_rows() {
        let catalog = catalog();
        let def = ModelDefinition::new(
            "Person",
            vec![
                FieldDefinition::scalar("name", Datatype::String),
                FieldDefinition::scalar("age", Datatype::Integer).nullable(),
            ],
            "a person",
            1,
        );
        let id = catalog.register_model(&def).unwrap();
        assert!(id > 0);
        assert_eq!(catalog.get_tblname("Person").unwrap(), "xPerson");
        assert_eq!(catalog.get_colname("Person", "name").unwrap(), "xname");

        let fields = catalog.field_info(Some("Person")).unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields[0].fieldname, "name");
        assert_eq!(fields[0].datatype.as_deref(), Some("String"));

        // the physical table actually exists and accepts rows
        catalog
            .backend
            .conn()
            .execute("INSERT INTO xPerson (xname, xage) VALUES ('Ada', 30)", [])
            .unwrap();
    }

    #[test]
    fn reregistering_identical_model_is_idempotent() {
        let catalog = catalog();
        let def = ModelDefinition::new("Person", vec![FieldDefinition::scalar("name", Datatype::String)], "a person", 1);
        let id1 = catalog.register_model(&def).unwrap();
        let id2 = catalog.register_model(&def).unwrap();
        assert_eq!(id1, id2);
    }

    #[test]
    fn reregistering_with_different_version_conflicts() {
        let catalog = catalog();
        let def1 = ModelDefinition::new("Person", vec![FieldDefinition::scalar("name", Datatype::String)], "a person", 1);
        let mut def2 = def1.clone();
        def2.version = 2;
        catalog.register_model(&def1).unwrap();
        let err = catalog.register_model(&def2).unwrap_err();
        assert!(matches!(err, SchemaError::ModelConflict { .. }));
    }

    #[test]
    fn submodel_field_resolves_to_registered_model_id() {
        let catalog = catalog();
        let address = ModelDefinition::new("Address", vec![FieldDefinition::scalar("city", Datatype::String)], "addr", 1);
        catalog.register_model(&address).unwrap();

        let person = ModelDefinition::new(
            "Resident",
            vec![FieldDefinition::submodel("home", "Address")],
            "resident",
            1,
        );
        catalog.register_model(&person).unwrap();

        let fields = catalog.field_info(Some("Resident")).unwrap();
        assert_eq!(fields[0].points_to.as_deref(), Some("xAddress"));
    }

    #[test]
    fn unknown_submodel_target_is_an_error() {
        let catalog = catalog();
        let def = ModelDefinition::new("Resident", vec![FieldDefinition::submodel("home", "NoSuchModel")], "resident", 1);
        let err = catalog.register_model(&def).unwrap_err();
        assert!(matches!(err, SchemaError::NoSuchModel(_)));
    }

    #[test]
    fn multivalued_scalar_field_creates_proptable() {
        let catalog = catalog();
        let def = ModelDefinition::new(
            "Tagged",
            vec![FieldDefinition::scalar("tag", Datatype::String).multiple()],
            "tagged item",
            1,
        );
        catalog.register_model(&def).unwrap();

        catalog
            .backend
            .conn()
            .execute("INSERT INTO xTagged_tag (parentid, value) VALUES (1, 'forensic')", [])
            .unwrap();
    }

    #[test]
    fn multivalued_submodel_field_creates_maptable() {
        let catalog = catalog();
        let address = ModelDefinition::new("Address", vec![FieldDefinition::scalar("city", Datatype::String)], "addr", 1);
        catalog.register_model(&address).unwrap();

        let person = ModelDefinition::new(
            "Resident",
            vec![FieldDefinition::submodel("homes", "Address").multiple()],
            "resident",
            1,
        );
        catalog.register_model(&person).unwrap();

        let fields = catalog.field_info(Some("Resident")).unwrap();
        assert_eq!(fields[0].mapping_table.as_deref(), Some("xResident_homes"));
    }

    #[test]
    fn timeline_view_is_absent_until_a_temporal_field_is_registered() {
        let catalog = catalog();
        let def = ModelDefinition::new("Note", vec![FieldDefinition::scalar("text", Datatype::String)], "note", 1);
        catalog.register_model(&def).unwrap();
        assert!(!catalog.regenerate_timeline(&[]).unwrap());
    }

    #[test]
    fn timeline_view_unions_temporal_fields_across_models() {
        let catalog = catalog();
        let event = ModelDefinition::new(
            "Event",
            vec![
                FieldDefinition::scalar("occurred_at", Datatype::Datetime).hidden_from_preview(),
                FieldDefinition::scalar("title", Datatype::String),
            ],
            "event",
            1,
        );
        catalog.register_model(&event).unwrap();
        assert!(catalog.regenerate_timeline(&[]).unwrap());

        catalog
            .backend
            .conn()
            .execute(
                "INSERT INTO xEvent (xoccurred_at, xtitle) VALUES ('2024-01-01T00:00:00', 'kickoff')",
                [],
            )
            .unwrap();

        let preview: String = catalog
            .backend
            .conn()
            .query_row("SELECT preview_ FROM xTimeline_", [], |r| r.get(0))
            .unwrap();
        assert_eq!(preview, "title:kickoff");

        let timestampfield: String = catalog
            .backend
            .conn()
            .query_row("SELECT timestampfield_ FROM xTimeline_", [], |r| r.get(0))
            .unwrap();
        assert_eq!(timestampfield, "occurred_at");
    }

    #[test]
    fn timeline_excluded_model_is_left_out() {
        let catalog = catalog();
        let event = ModelDefinition::new("Event", vec![FieldDefinition::scalar("occurred_at", Datatype::Datetime)], "event", 1);
        catalog.register_model(&event).unwrap();
        assert!(!catalog.regenerate_timeline(&["Event".to_string()]).unwrap());
    }

    #[test]
    fn timeline_exclusion_of_unknown_model_is_an_error() {
        let catalog = catalog();
        let err = catalog.regenerate_timeline(&["Ghost".to_string()]).unwrap_err();
        assert!(matches!(err, SchemaError::Value(dadb_sats::ValueError::UnknownTimelineModel(_))));
    }

    #[test]
    fn fields_raw_reconstructs_submodel_and_enum_targets_by_name() {
        let catalog = catalog();
        let color = EnumDefinition::new("Color", vec![(0, "RED".to_string())], 1);
        catalog.register_enum(&color).unwrap();
        let address = ModelDefinition::new("Address", vec![FieldDefinition::scalar("city", Datatype::String)], "addr", 1);
        catalog.register_model(&address).unwrap();

        let person = ModelDefinition::new(
            "Resident",
            vec![
                FieldDefinition::submodel("home", "Address"),
                FieldDefinition::enum_field("favorite_color", "Color"),
            ],
            "resident",
            1,
        );
        catalog.register_model(&person).unwrap();

        let raw = catalog.fields_raw("Resident").unwrap();
        assert_eq!(raw[0].submodel.as_deref(), Some("Address"));
        assert_eq!(raw[1].enum_name.as_deref(), Some("Color"));

        assert_eq!(catalog.list_model_names().unwrap(), vec!["Address", "Resident"]);
        assert_eq!(catalog.list_enum_names().unwrap(), vec!["Color"]);
        assert_eq!(catalog.enum_values("Color").unwrap(), vec![(0, "RED".to_string())]);

        let meta = catalog.model_meta("Resident").unwrap();
        assert_eq!(meta.version, 1);
        assert!(meta.implicit_dedup);
    }

    #[test]
    fn register_enum_creates_enum_table_and_rows() {
        let catalog = catalog();
        let def = EnumDefinition::new("Color", vec![(0, "RED".to_string()), (1, "GREEN".to_string())], 1);
        catalog.register_enum(&def).unwrap();
        assert_eq!(catalog.get_enum_tblname("Color").unwrap(), "xColor");

        let count: i64 = catalog
            .backend
            .conn()
            .query_row("SELECT COUNT(*) FROM xColor", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 2);
    }
}
