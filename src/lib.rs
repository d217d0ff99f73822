//! Typed SensorThings entity persistence on SQLite: a schema registry for the six core entity
//! types, OData-style path and query parsing with lazy evaluation, referential-integrity checks for
//! deep inserts, and transactional persistence managers that publish change events on commit.
//! Run Criterion benchmarks with `cargo bench` to inspect reports under `target/criterion`.

pub mod backend;
pub mod bench_utils;
pub mod bus;
pub mod config;
pub mod context;
pub mod errors;
mod integrity;
pub mod manager;
pub mod model;
pub mod path;
pub mod query;
pub mod registry;
pub mod schema;
mod staging;

pub use crate::backend::{RowScope, RowStore, RowWrite, SqliteRowStore, StoredRow};
pub use crate::bus::{ChangeAction, EntityChangedEvent, MessageBus, NoopBus, RecordingBus};
pub use crate::config::{
    CoreSettings, DeletePolicy, IdGenerationMode, QuerySettings, SqliteConfig, StoreDescriptor,
};
pub use crate::context::EngineContext;
pub use crate::errors::SensorGraphError;
pub use crate::manager::{PersistenceManager, TransactionState};
pub use crate::model::{Entity, EntityKey, EntitySet, Identifier, Related, RelationValue};
pub use crate::path::{ResourcePath, parse_path};
pub use crate::query::{Query, parse_filter, parse_query};
pub use crate::registry::{EntityType, lookup};
