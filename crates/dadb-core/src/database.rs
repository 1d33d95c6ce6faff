//! The public repository handle: opens/creates a repository and wires the
//! backend, catalog, content store, registry, and modelitem engine together
//! behind one shared transaction facade.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::rc::Rc;

use dadb_datastore::{Backend, ContentStore, DataHandle, RepoLock, TransactionFacade};
use dadb_sats::Datatype;
use dadb_schema::{Catalog, EnumDefinition, ModelDefinition};

use crate::engine::{ModelitemEngine, ModelitemIter};
use crate::error::DadbError;
use crate::item::{FieldInput, Item};
use crate::registry::ModelRegistry;

/// Options persisted into `reserved` at creation time and re-read verbatim
/// on every later `load`. There is no other runtime configuration surface.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub prefix: String,
    pub pkey: String,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            prefix: "x".to_string(),
            pkey: "id".to_string(),
        }
    }
}

/// A repository: a single embedded store holding the meta-schema, content
/// tables, and every registered model's backing tables.
pub struct Database {
    backend: Rc<Backend>,
    // Held for the repository's lifetime; released on drop. `None` for
    // in-memory repositories, which have no sibling lock file to hold.
    _lock: Option<RepoLock>,
    tx: Rc<TransactionFacade>,
    catalog: Rc<Catalog>,
    content: ContentStore,
    registry: Rc<ModelRegistry>,
    engine: ModelitemEngine,
    timeline_blacklist: RefCell<Vec<String>>,
}

impl Database {
    /// Creates a new repository at `path`, failing if one already exists there.
    pub fn create(path: impl AsRef<Path>, options: CreateOptions) -> Result<Self, DadbError> {
        let path = path.as_ref();
        let lock = RepoLock::acquire(path)?;
        let backend = Rc::new(Backend::open_file(path)?);
        let db = Self::bootstrap(backend, Some(lock), &options.prefix, &options.pkey, true)?;
        log::info!("database: created repository at {}", path.display());
        Ok(db)
    }

    /// Creates a transient, in-memory repository with no on-disk footprint
    /// and therefore no advisory lock to acquire.
    pub fn create_in_memory(options: CreateOptions) -> Result<Self, DadbError> {
        let backend = Rc::new(Backend::open_in_memory()?);
        Self::bootstrap(backend, None, &options.prefix, &options.pkey, true)
    }

    /// Reopens an existing repository at `path`, validating schema/api version.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, DadbError> {
        let path = path.as_ref();
        let lock = RepoLock::acquire(path)?;
        let backend = Rc::new(Backend::open_file(path)?);
        let (prefix, pkey) = Catalog::peek_prefix_pkey(&backend).map_err(|e| Self::as_repository_mismatch(path, e))?;
        let db = Self::bootstrap(backend, Some(lock), &prefix, &pkey, false)
            .map_err(|e| Self::as_repository_mismatch(path, e))?;
        log::info!("database: loaded repository at {}", path.display());
        Ok(db)
    }

    /// Narrows a missing-`reserved`-row failure down to `RepositoryMismatch`,
    /// the caller-facing signal that `path` is not a (usable) DADB repository.
    fn as_repository_mismatch(path: &Path, e: impl Into<DadbError>) -> DadbError {
        match e.into() {
            DadbError::Schema(dadb_schema::SchemaError::NoReservedRow) => DadbError::RepositoryMismatch(path.display().to_string()),
            other => other,
        }
    }

    fn bootstrap(backend: Rc<Backend>, lock: Option<RepoLock>, prefix: &str, pkey: &str, creating: bool) -> Result<Self, DadbError> {
        let tx = Rc::new(TransactionFacade::new());
        let catalog = Rc::new(Catalog::new(backend.clone(), tx.clone(), prefix, pkey));
        let content = ContentStore::new(backend.clone(), prefix);

        let reserved = if creating {
            catalog.create_schema(&[])?;
            content.create_schema()?;
            catalog.load()?
        } else {
            catalog.load()?
        };

        let registry = Rc::new(ModelRegistry::new());
        registry.reload(&catalog)?;
        let engine = ModelitemEngine::new(backend.clone(), catalog.clone(), registry.clone(), tx.clone());

        Ok(Self {
            backend,
            _lock: lock,
            tx,
            catalog,
            content,
            registry,
            engine,
            timeline_blacklist: RefCell::new(reserved.timeline_blacklist),
        })
    }

    /// Releases the repository's lock and connection. Equivalent to letting
    /// the handle drop, spelled out for callers that want an explicit point
    /// of closure.
    pub fn close(self) {
        log::info!("database: closing repository");
    }

    /// Re-reads `reserved` and rebuilds the in-memory model/enum caches from
    /// the catalog's current persisted state.
    pub fn reload(&self) -> Result<(), DadbError> {
        let reserved = self.catalog.load()?;
        self.registry.reload(&self.catalog)?;
        *self.timeline_blacklist.borrow_mut() = reserved.timeline_blacklist;
        Ok(())
    }

    pub fn register_enum(&self, def: &EnumDefinition) -> Result<i64, DadbError> {
        let id = self.catalog.register_enum(def)?;
        self.registry.remember_enum(def.clone());
        Ok(id)
    }

    pub fn register_model(&self, def: &ModelDefinition) -> Result<i64, DadbError> {
        let id = self.catalog.register_model(def)?;
        let tblname = self.catalog.get_tblname(&def.name)?;
        self.registry.remember_model(def.clone(), tblname);
        self.regenerate_timeline()?;
        Ok(id)
    }

    /// Whether `name` is a registered model or enum.
    pub fn check_registered(&self, name: &str) -> bool {
        self.registry.model_exists(name) || self.registry.enum_exists(name)
    }

    /// Changes which models are excluded from `xTimeline_` and rebuilds it.
    pub fn set_timeline_blacklist(&self, blacklist: Vec<String>) -> Result<(), DadbError> {
        self.catalog.set_timeline_blacklist(&blacklist)?;
        *self.timeline_blacklist.borrow_mut() = blacklist;
        self.regenerate_timeline()?;
        Ok(())
    }

    fn regenerate_timeline(&self) -> Result<(), DadbError> {
        let blacklist = self.timeline_blacklist.borrow().clone();
        self.catalog.regenerate_timeline(&blacklist)?;
        Ok(())
    }

    pub fn insert_data(&self, reader: &mut dyn Read) -> Result<i64, DadbError> {
        Ok(self.content.insert_data(reader)?)
    }

    pub fn get_data(&self, id: i64) -> Result<DataHandle, DadbError> {
        Ok(self.content.get_data(id)?)
    }

    /// Registers a data object's checksums and size without storing any
    /// bytes for it. `get_data` on the returned id succeeds but reading from
    /// the handle fails until the bytes are attached separately.
    pub fn insert_data_metadata_only(&self, md5: &str, sha1: &str, sha256: &str, size: u64) -> Result<i64, DadbError> {
        Ok(self.content.insert_metadata_only(md5, sha1, sha256, size)?)
    }

    pub fn make_modelitem(&self, modelname: &str, inputs: BTreeMap<String, FieldInput>) -> Result<Item, DadbError> {
        self.engine.make_modelitem(modelname, inputs)
    }

    pub fn insert_modelitem(&self, item: &Item) -> Result<i64, DadbError> {
        self.engine.insert_modelitem(item)
    }

    pub fn modelitem(&self, modelname: &str, id: i64) -> Result<Item, DadbError> {
        self.engine.modelitem(modelname, id)
    }

    pub fn modelitems(&self, modelname: &str) -> Result<ModelitemIter<'_>, DadbError> {
        self.engine.modelitems(modelname)
    }

    /// Materializes the nested item behind a single-valued submodel field of
    /// a previously fetched or built item.
    pub fn resolve_submodel(&self, item: &Item, field: &str) -> Result<Item, DadbError> {
        self.engine.resolve_submodel(item, field)
    }

    pub fn begin_transaction(&self) -> Result<bool, DadbError> {
        Ok(self.tx.begin(&self.backend)?)
    }

    pub fn end_transaction(&self, started: bool) -> Result<(), DadbError> {
        Ok(self.tx.end(&self.backend, started)?)
    }

    pub fn rollback_transaction(&self) -> Result<bool, DadbError> {
        Ok(self.tx.rollback(&self.backend)?)
    }

    pub fn disable_duplicate_checking(&self, modelname: &str) {
        self.registry.disable_duplicate_checking(modelname);
    }

    pub fn enable_duplicate_checking(&self, modelname: &str) -> Result<(), DadbError> {
        self.registry.enable_duplicate_checking(modelname)
    }

    /// A read-only `SELECT * FROM <table> [WHERE <where_clause>]` helper used
    /// by model authors to drive candidate queries without hand-rolling
    /// column enumeration. `where_clause` is a raw SQL fragment (e.g.
    /// `"xage > ?1"`); `params` binds its placeholders positionally.
    pub fn select(
        &self,
        table: &str,
        where_clause: Option<&str>,
        params: &[rusqlite::types::Value],
    ) -> Result<Vec<BTreeMap<String, rusqlite::types::Value>>, DadbError> {
        let sql = match where_clause {
            Some(clause) => format!("SELECT * FROM {table} WHERE {clause}"),
            None => format!("SELECT * FROM {table}"),
        };
        let conn = self.backend.conn();
        let mut stmt = conn.prepare(&sql)?;
        let colnames: Vec<String> = stmt.column_names().into_iter().map(str::to_string).collect();
        let rows = stmt
            .query_map(rusqlite::params_from_iter(params.iter()), |row| {
                colnames
                    .iter()
                    .enumerate()
                    .map(|(i, name)| row.get::<_, rusqlite::types::Value>(i).map(|v| (name.clone(), v)))
                    .collect::<rusqlite::Result<BTreeMap<_, _>>>()
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_tblname(&self, modelname: &str) -> Result<String, DadbError> {
        Ok(self.catalog.get_tblname(modelname)?)
    }

    pub fn get_colname(&self, modelname: &str, fieldname: &str) -> Result<String, DadbError> {
        Ok(self.catalog.get_colname(modelname, fieldname)?)
    }

    pub fn prefix(&self) -> &str {
        self.catalog.prefix()
    }

    pub fn pkey(&self) -> &str {
        self.catalog.pkey()
    }

    pub fn models(&self) -> Vec<String> {
        self.registry.model_names()
    }

    pub fn enums(&self) -> Vec<String> {
        self.registry.enum_names()
    }

    pub fn datatypes(&self) -> &'static [Datatype] {
        self.registry.datatypes()
    }

    pub fn tables(&self) -> Result<Vec<String>, DadbError> {
        Ok(self.backend.table_names()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dadb_sats::Value;
    use dadb_schema::FieldDefinition;
    use std::io::Cursor;

    fn db() -> Database {
        Database::create_in_memory(CreateOptions::default()).unwrap()
    }

    #[test]
    fn reopen_preserves_prefix_pkey_and_meta_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.db");
        {
            let db = Database::create(&path, CreateOptions::default()).unwrap();
            assert_eq!(db.prefix(), "x");
            assert_eq!(db.pkey(), "id");
            db.close();
        }
        let reopened = Database::load(&path).unwrap();
        assert_eq!(reopened.prefix(), "x");
        assert_eq!(reopened.pkey(), "id");
        let mut tables = reopened.tables().unwrap();
        tables.sort();
        assert_eq!(
            tables,
            vec!["_enum_", "_field_", "_maptable_", "_model_", "_proptable_", "_reserved_", "xblock", "xblockmap", "xdata",]
        );
    }

    #[test]
    fn a_second_open_of_a_locked_repository_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repo.db");
        let _first = Database::create(&path, CreateOptions::default()).unwrap();
        let second = Database::load(&path);
        assert!(matches!(second, Err(DadbError::Store(dadb_datastore::StoreError::RepositoryBusy(_)))));
    }

    #[test]
    fn loading_a_file_with_no_reserved_row_is_a_repository_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-a-repo.db");
        // an empty SQLite file has none of DADB's meta tables, let alone `_reserved_`
        rusqlite::Connection::open(&path).unwrap();

        let err = Database::load(&path).unwrap_err();
        assert!(matches!(err, DadbError::RepositoryMismatch(_)));
    }

    #[test]
    fn metadata_only_data_object_registers_without_stored_bytes() {
        let db = db();
        let id = db
            .insert_data_metadata_only(
                "d41d8cd98f00b204e9800998ecf8427e",
                "da39a3ee5e6b4b0d3255bfef95601890afd80709",
                "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
                0,
            )
            .unwrap();
        let mut handle = db.get_data(id).unwrap();
        assert!(!handle.stored());
        let mut buf = [0u8; 1];
        assert!(handle.read(&mut buf).is_err());
    }

    #[test]
    fn transaction_rollback_hides_data_inserted_inside_it() {
        let db = db();
        let started = db.begin_transaction().unwrap();
        assert!(started);
        let id = db.insert_data(&mut Cursor::new(b"forensic payload".to_vec())).unwrap();
        db.rollback_transaction().unwrap();
        assert!(db.get_data(id).is_err());
        assert!(!db.rollback_transaction().unwrap());
    }

    #[test]
    fn nested_begin_transaction_only_the_outer_call_commits() {
        let db = db();
        let outer = db.begin_transaction().unwrap();
        let inner = db.begin_transaction().unwrap();
        assert!(outer);
        assert!(!inner);
        db.end_transaction(inner).unwrap();
        db.end_transaction(outer).unwrap();
    }

    #[test]
    fn model_round_trip_with_submodel_and_multivalued_fields() {
        let db = db();
        let address = ModelDefinition::new("Address", vec![FieldDefinition::scalar("city", Datatype::String)], "addr", 1);
        db.register_model(&address).unwrap();

        let person = ModelDefinition::new(
            "Resident",
            vec![
                FieldDefinition::submodel("home", "Address"),
                FieldDefinition::scalar("nickname", Datatype::String).multiple(),
            ],
            "resident",
            1,
        );
        db.register_model(&person).unwrap();

        let mut home_fields = BTreeMap::new();
        home_fields.insert("city".to_string(), FieldInput::Value(Value::String("Boston".to_string())));
        let home = db.make_modelitem("Address", home_fields).unwrap();

        let mut fields = BTreeMap::new();
        fields.insert(
            "home".to_string(),
            FieldInput::Submodel(crate::item::SubmodelInput::Item(Box::new(home))),
        );
        fields.insert(
            "nickname".to_string(),
            FieldInput::Values(vec![Value::String("Ace".to_string()), Value::String("Al".to_string())]),
        );
        let item = db.make_modelitem("Resident", fields).unwrap();
        let id = db.insert_modelitem(&item).unwrap();

        let fetched = db.modelitem("Resident", id).unwrap();
        assert_eq!(fetched.multi("nickname").unwrap().len(), 2);
        let home_id = fetched.submodel_id("home").unwrap();
        let resolved_home = db.resolve_submodel(&fetched, "home").unwrap();
        assert_eq!(resolved_home.scalar("city"), Some(&Value::String("Boston".to_string())));
        assert_eq!(db.modelitem("Address", home_id).unwrap().scalar("city"), Some(&Value::String("Boston".to_string())));
    }

    #[test]
    fn model_field_of_datatype_data_round_trips_through_the_content_store() {
        let db = db();
        let def = ModelDefinition::new(
            "Exhibit",
            vec![
                FieldDefinition::scalar("label", Datatype::String),
                FieldDefinition::scalar("payload", Datatype::Data),
            ],
            "exhibit",
            1,
        );
        db.register_model(&def).unwrap();

        let bytes = b"forensic exhibit payload".to_vec();
        let dataid = db.insert_data(&mut Cursor::new(bytes.clone())).unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("label".to_string(), FieldInput::Value(Value::String("exhibit-1".to_string())));
        fields.insert("payload".to_string(), FieldInput::Value(Value::Data(dataid)));
        let item = db.make_modelitem("Exhibit", fields).unwrap();
        let id = db.insert_modelitem(&item).unwrap();

        let fetched = db.modelitem("Exhibit", id).unwrap();
        let Value::Data(fetched_dataid) = fetched.scalar("payload").unwrap() else {
            panic!("expected a Data value");
        };
        assert_eq!(*fetched_dataid, dataid);

        let mut handle = db.get_data(*fetched_dataid).unwrap();
        let mut out = Vec::new();
        handle.read_to_end(&mut out).unwrap();
        assert_eq!(out, bytes);
    }

    #[test]
    fn explicit_dedup_returns_the_existing_row_instead_of_inserting() {
        let db = db();
        let def = ModelDefinition::new("Tag", vec![FieldDefinition::scalar("name", Datatype::String)], "tag", 1);
        db.register_model(&def).unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), FieldInput::Value(Value::String("forensic".to_string())));
        let item = db.make_modelitem("Tag", fields).unwrap();
        let id1 = db.insert_modelitem(&item).unwrap();
        let id2 = db.insert_modelitem(&item).unwrap();
        assert_eq!(id1, id2);

        let mut items = db.modelitems("Tag").unwrap();
        assert!(items.next().is_some());
        assert!(items.next().is_none());
    }

    #[test]
    fn fail_on_dup_model_reports_a_duplicate_as_an_error() {
        let db = db();
        let def = ModelDefinition::new("StrictTag", vec![FieldDefinition::scalar("name", Datatype::String)], "tag", 1).fail_on_dup(true);
        db.register_model(&def).unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), FieldInput::Value(Value::String("forensic".to_string())));
        let item = db.make_modelitem("StrictTag", fields).unwrap();
        db.insert_modelitem(&item).unwrap();
        let err = db.insert_modelitem(&item).unwrap_err();
        assert!(matches!(err, DadbError::DuplicateItem(_)));
    }

    #[test]
    fn disabled_duplicate_checking_allows_repeats_within_scope() {
        let db = db();
        let def = ModelDefinition::new("Note", vec![FieldDefinition::scalar("text", Datatype::String)], "note", 1);
        db.register_model(&def).unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("text".to_string(), FieldInput::Value(Value::String("same".to_string())));
        let item = db.make_modelitem("Note", fields).unwrap();

        db.disable_duplicate_checking("Note");
        let id1 = db.insert_modelitem(&item).unwrap();
        let id2 = db.insert_modelitem(&item).unwrap();
        assert_ne!(id1, id2);
        db.enable_duplicate_checking("Note").unwrap();

        let id3 = db.insert_modelitem(&item).unwrap();
        assert_eq!(id3, id1);
    }

    #[test]
    fn enable_duplicate_checking_without_a_disable_is_rejected() {
        let db = db();
        let def = ModelDefinition::new("Note", vec![FieldDefinition::scalar("text", Datatype::String)], "note", 1);
        db.register_model(&def).unwrap();
        let err = db.enable_duplicate_checking("Note").unwrap_err();
        assert!(matches!(err, DadbError::DuplicateCheckingMismatch(_, _)));
    }

    #[test]
    fn timeline_view_reports_items_across_models_in_time_order() {
        let db = db();
        let login = ModelDefinition::new(
            "Login",
            vec![
                FieldDefinition::scalar("at", Datatype::Datetime),
                FieldDefinition::scalar("user", Datatype::String),
            ],
            "login event",
            1,
        );
        db.register_model(&login).unwrap();
        let download = ModelDefinition::new(
            "Download",
            vec![
                FieldDefinition::scalar("at", Datatype::Datetime),
                FieldDefinition::scalar("url", Datatype::String),
            ],
            "download event",
            1,
        );
        db.register_model(&download).unwrap();

        for (model, at, preview_field, preview_value) in [
            ("Login", "2024-01-01T00:00:00Z", "user", "alice"),
            ("Download", "2024-01-02T00:00:00Z", "url", "http://example.com"),
            ("Login", "2024-01-03T00:00:00Z", "user", "bob"),
        ] {
            let mut fields = BTreeMap::new();
            fields.insert("at".to_string(), FieldInput::Value(Value::Datetime(at.parse().unwrap())));
            fields.insert(preview_field.to_string(), FieldInput::Value(Value::String(preview_value.to_string())));
            let item = db.make_modelitem(model, fields).unwrap();
            db.insert_modelitem(&item).unwrap();
        }

        let rows = db.select("xTimeline_", None, &[]).unwrap();
        assert_eq!(rows.len(), 3);
    }
}
