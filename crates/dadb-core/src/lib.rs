//! DADB metadata engine: runtime model/enum registry, the modelitem engine
//! (validate, cascade-insert, deduplicate, fetch), and the repository facade
//! tying the backend, schema catalog, content store, and transaction facade
//! together.

pub mod database;
pub mod engine;
pub mod error;
pub mod item;
pub mod registry;

pub use database::{CreateOptions, Database};
pub use engine::{ModelitemEngine, ModelitemIter};
pub use error::DadbError;
pub use item::{EnumInput, FieldInput, FieldSlot, Item, SubmodelInput};
pub use registry::ModelRegistry;
