//! Settings for opening a persistence manager.
//!
//! Loading these values from a file or the environment is the embedding application's job;
//! [`CoreSettings`] derives `Deserialize` with defaults for every field so any serde format can
//! populate it.

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Where the row store lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreDescriptor {
    /// Named in-memory database shared by every connection in the process that uses the same
    /// name. The data disappears when the last connection closes. It is opened through the
    /// `memdb` VFS, whose whole-database locks honour the busy timeout.
    InMemory { name: String },
    /// SQLite database file, created when missing.
    File { path: PathBuf },
}

impl StoreDescriptor {
    /// SQLite URI passed to `Connection::open_with_flags`.
    pub fn connection_uri(&self) -> String {
        match self {
            StoreDescriptor::InMemory { name } => format!("file:/{name}?vfs=memdb"),
            StoreDescriptor::File { path } => path.display().to_string(),
        }
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self, StoreDescriptor::InMemory { .. })
    }
}

/// Who may choose identifiers for new entities.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdGenerationMode {
    /// Identifiers are always generated; a client-supplied identifier is rejected.
    ServerGeneratedOnly,
    /// A client-supplied identifier is used, otherwise one is generated.
    #[default]
    ServerAndClientGenerated,
    /// Every inserted entity must carry its identifier.
    ClientGeneratedOnly,
}

/// What `delete` does with entities that hold a mandatory link to the deleted one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletePolicy {
    /// Dependents are deleted too, recursively (a Thing takes its Datastreams and their
    /// Observations with it).
    #[default]
    Cascade,
    /// The delete fails with `ConstraintViolation` while dependents exist.
    Reject,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    /// Page size applied when a query has no `$top`; `None` leaves such queries unbounded.
    pub default_top: Option<usize>,
    /// Upper bound for `$top`; larger requests are clamped.
    pub max_top: usize,
    /// Evaluation budget for collection queries.
    pub timeout_ms: Option<u64>,
}

impl QuerySettings {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            default_top: Some(100),
            max_top: 1000,
            timeout_ms: None,
        }
    }
}

/// SQLite connection tuning.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// How long a connection waits on a locked database before failing.
    pub busy_timeout_ms: u64,
    /// Extra PRAGMA statements applied after opening, e.g. `synchronous = NORMAL`.
    pub pragma_settings: BTreeMap<String, String>,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            busy_timeout_ms: 5_000,
            pragma_settings: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreSettings {
    pub store: StoreDescriptor,
    /// Scratch directory for the embedding application; defaults to the OS temp dir.
    pub temp_path: PathBuf,
    pub id_generation: IdGenerationMode,
    pub delete_policy: DeletePolicy,
    pub query: QuerySettings,
    pub sqlite: SqliteConfig,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            store: StoreDescriptor::InMemory {
                name: "sensorgraph".to_string(),
            },
            temp_path: std::env::temp_dir(),
            id_generation: IdGenerationMode::default(),
            delete_policy: DeletePolicy::default(),
            query: QuerySettings::default(),
            sqlite: SqliteConfig::default(),
        }
    }
}

impl CoreSettings {
    pub fn in_memory<T: Into<String>>(name: T) -> Self {
        Self {
            store: StoreDescriptor::InMemory { name: name.into() },
            ..Self::default()
        }
    }

    /// In-memory store under a random name, private to whoever holds these settings.
    pub fn ephemeral() -> Self {
        let suffix: u64 = rand::thread_rng().r#gen();
        Self::in_memory(format!("sensorgraph-{suffix:016x}"))
    }

    pub fn file<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            store: StoreDescriptor::File { path: path.into() },
            ..Self::default()
        }
    }

    pub fn with_delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    pub fn with_id_generation(mut self, mode: IdGenerationMode) -> Self {
        self.id_generation = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let settings: CoreSettings =
            serde_json::from_str(r#"{"delete_policy":"reject"}"#).expect("settings");
        assert_eq!(settings.delete_policy, DeletePolicy::Reject);
        assert_eq!(settings.query.max_top, 1000);
        assert_eq!(settings.temp_path, std::env::temp_dir());
        assert!(settings.store.is_in_memory());
    }

    #[test]
    fn file_store_descriptor_deserializes() {
        let settings: CoreSettings = serde_json::from_str(
            r#"{"store":{"kind":"file","path":"/tmp/graph.db"},"query":{"timeout_ms":250}}"#,
        )
        .expect("settings");
        assert_eq!(settings.store.connection_uri(), "/tmp/graph.db");
        assert_eq!(settings.query.timeout(), Some(Duration::from_millis(250)));
        assert_eq!(settings.query.default_top, Some(100));
    }

    #[test]
    fn in_memory_store_uses_memdb_vfs() {
        let store = CoreSettings::in_memory("lab").store;
        assert_eq!(store.connection_uri(), "file:/lab?vfs=memdb");
    }

    #[test]
    fn ephemeral_names_differ() {
        assert_ne!(CoreSettings::ephemeral().store, CoreSettings::ephemeral().store);
    }
}
