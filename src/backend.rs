//! Row storage behind the persistence manager. [`RowStore`] is the seam between the
//! transaction/integrity logic and the physical store; [`SqliteRowStore`] implements it over one
//! table per entity type (see [`crate::schema`]).
//!
//! Writes reach the store only through [`RowStore::apply`], which runs a whole commit batch in one
//! SQLite `IMMEDIATE` transaction and rejects it when another manager committed conflicting
//! changes since the batch was staged.

use std::{collections::BTreeMap, collections::VecDeque, time::Duration};

use rusqlite::{
    Connection, ErrorCode, OpenFlags, OptionalExtension, Row, Transaction, TransactionBehavior,
    params, params_from_iter, types::Value as SqlValue,
};
use serde_json::{Map, Value};
use tracing::{debug, trace, warn};

use crate::{
    config::CoreSettings,
    errors::SensorGraphError,
    model::{Entity, Identifier, Related, RelationValue},
    registry::{EntityType, Relation, dependents_of},
    schema::{ensure_schema, select_columns},
};

/// Rows fetched per round trip by [`ScanCursor`].
pub const SCAN_PAGE_SIZE: usize = 256;

/// One persisted entity: properties plus the identifiers its to-one relations point at.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredRow {
    pub id: Identifier,
    /// Incremented by every committed update; used to detect concurrent modification.
    pub version: i64,
    pub properties: Map<String, Value>,
    /// To-one relation name → target identifier.
    pub links: BTreeMap<&'static str, Identifier>,
}

impl StoredRow {
    pub fn new(id: Identifier, properties: Map<String, Value>) -> Self {
        Self {
            id,
            version: 1,
            properties,
            links: BTreeMap::new(),
        }
    }

    pub fn into_entity(self, entity_type: EntityType) -> Entity {
        let mut entity = Entity::new(entity_type);
        entity.id = Some(self.id);
        entity.properties = self.properties;
        for (relation, target) in self.links {
            entity
                .relations
                .insert(relation.to_string(), RelationValue::One(Related::Id(target)));
        }
        entity
    }
}

/// Restriction applied to a scan: an exact identifier, a link to a parent, or both.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RowScope {
    pub id: Option<Identifier>,
    /// To-one relation of the scanned type and the identifier it must point at.
    pub link: Option<(&'static Relation, Identifier)>,
}

impl RowScope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn id(id: Identifier) -> Self {
        Self {
            id: Some(id),
            link: None,
        }
    }

    pub fn linked(relation: &'static Relation, target: Identifier) -> Self {
        Self {
            id: None,
            link: Some((relation, target)),
        }
    }

    pub fn with_id(mut self, id: Option<Identifier>) -> Self {
        self.id = id;
        self
    }

    pub fn admits(&self, row: &StoredRow) -> bool {
        if self.id.as_ref().is_some_and(|id| *id != row.id) {
            return false;
        }
        match &self.link {
            Some((relation, target)) => row.links.get(relation.name) == Some(target),
            None => true,
        }
    }
}

/// One change in a commit batch.
#[derive(Clone, Debug, PartialEq)]
pub enum RowWrite {
    Insert {
        entity_type: EntityType,
        row: StoredRow,
    },
    /// Replaces the row if its stored version still equals `row.version`.
    Update {
        entity_type: EntityType,
        row: StoredRow,
    },
    /// Removes the row and retires its identifier. `base_version` is `None` when the row was
    /// created and deleted within the same batch.
    Delete {
        entity_type: EntityType,
        id: Identifier,
        base_version: Option<i64>,
    },
}

impl RowWrite {
    pub fn entity_type(&self) -> EntityType {
        match self {
            RowWrite::Insert { entity_type, .. }
            | RowWrite::Update { entity_type, .. }
            | RowWrite::Delete { entity_type, .. } => *entity_type,
        }
    }
}

pub trait RowStore {
    fn fetch(
        &self,
        entity_type: EntityType,
        id: &Identifier,
    ) -> Result<Option<StoredRow>, SensorGraphError>;

    /// Up to `limit` rows admitted by `scope` with identifiers greater than `after`, in ascending
    /// identifier order.
    fn scan_page(
        &self,
        entity_type: EntityType,
        scope: &RowScope,
        after: Option<&Identifier>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, SensorGraphError>;

    /// True when the identifier belonged to an entity that has since been deleted.
    fn is_retired(&self, entity_type: EntityType, id: &Identifier)
    -> Result<bool, SensorGraphError>;

    /// Applies the batch atomically: either every write lands or none does.
    fn apply(&mut self, writes: &[RowWrite]) -> Result<(), SensorGraphError>;
}

/// Lazily pages through a [`RowStore`] scan.
pub struct ScanCursor<'a, S: RowStore + ?Sized> {
    store: &'a S,
    entity_type: EntityType,
    scope: RowScope,
    page_size: usize,
    buffered: VecDeque<StoredRow>,
    last: Option<Identifier>,
    exhausted: bool,
}

impl<'a, S: RowStore + ?Sized> ScanCursor<'a, S> {
    pub fn new(store: &'a S, entity_type: EntityType, scope: RowScope, page_size: usize) -> Self {
        Self {
            store,
            entity_type,
            scope,
            page_size: page_size.max(1),
            buffered: VecDeque::new(),
            last: None,
            exhausted: false,
        }
    }
}

impl<S: RowStore + ?Sized> Iterator for ScanCursor<'_, S> {
    type Item = Result<StoredRow, SensorGraphError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffered.is_empty() && !self.exhausted {
            match self.store.scan_page(
                self.entity_type,
                &self.scope,
                self.last.as_ref(),
                self.page_size,
            ) {
                Ok(page) => {
                    trace!(entity_type = %self.entity_type, rows = page.len(), "scan page");
                    self.exhausted = page.len() < self.page_size;
                    self.last = page.last().map(|row| row.id.clone());
                    self.buffered.extend(page);
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
        self.buffered.pop_front().map(Ok)
    }
}

pub struct SqliteRowStore {
    conn: Connection,
}

impl SqliteRowStore {
    /// Opens (creating when missing) the store named by `settings.store` and ensures its schema.
    pub fn open(settings: &CoreSettings) -> Result<Self, SensorGraphError> {
        let uri = settings.store.connection_uri();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&uri, flags)
            .map_err(|e| SensorGraphError::connection(format!("{uri}: {e}")))?;
        conn.busy_timeout(Duration::from_millis(settings.sqlite.busy_timeout_ms))
            .map_err(|e| SensorGraphError::connection(e.to_string()))?;
        if !settings.store.is_in_memory() {
            let mode = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                row.get::<_, String>(0)
            });
            if let Err(err) = mode {
                warn!(error = %err, "WAL journaling unavailable, keeping rollback journal");
            }
        }
        for (name, value) in &settings.sqlite.pragma_settings {
            conn.pragma_update(None, name, value).map_err(|e| {
                SensorGraphError::connection(format!("pragma {name}={value}: {e}"))
            })?;
        }
        ensure_schema(&conn)?;
        debug!(store = %uri, "opened row store");
        Ok(Self { conn })
    }

    /// Private in-memory store not shared with any other connection.
    pub fn open_in_memory() -> Result<Self, SensorGraphError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| SensorGraphError::connection(e.to_string()))?;
        ensure_schema(&conn)?;
        Ok(Self { conn })
    }
}

impl RowStore for SqliteRowStore {
    fn fetch(
        &self,
        entity_type: EntityType,
        id: &Identifier,
    ) -> Result<Option<StoredRow>, SensorGraphError> {
        let sql = format!(
            "SELECT {} FROM {} WHERE id=?1",
            select_columns(entity_type),
            entity_type.table()
        );
        self.conn
            .query_row(&sql, params![id.as_str()], |row| {
                row_to_stored(entity_type, row)
            })
            .optional()
            .map_err(|e| SensorGraphError::storage(e.to_string()))
    }

    fn scan_page(
        &self,
        entity_type: EntityType,
        scope: &RowScope,
        after: Option<&Identifier>,
        limit: usize,
    ) -> Result<Vec<StoredRow>, SensorGraphError> {
        let mut sql = format!(
            "SELECT {} FROM {} WHERE 1=1",
            select_columns(entity_type),
            entity_type.table()
        );
        let mut values: Vec<SqlValue> = Vec::new();
        if let Some(id) = &scope.id {
            values.push(SqlValue::Text(id.as_str().to_string()));
            sql.push_str(&format!(" AND id=?{}", values.len()));
        }
        if let Some((relation, target)) = &scope.link {
            let column = link_column(relation)?;
            values.push(SqlValue::Text(target.as_str().to_string()));
            sql.push_str(&format!(" AND {column}=?{}", values.len()));
        }
        if let Some(after) = after {
            values.push(SqlValue::Text(after.as_str().to_string()));
            sql.push_str(&format!(" AND id>?{}", values.len()));
        }
        values.push(SqlValue::Integer(limit.min(i64::MAX as usize) as i64));
        sql.push_str(&format!(" ORDER BY id LIMIT ?{}", values.len()));

        let mut stmt = self
            .conn
            .prepare_cached(&sql)
            .map_err(|e| SensorGraphError::storage(e.to_string()))?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| {
                row_to_stored(entity_type, row)
            })
            .map_err(|e| SensorGraphError::storage(e.to_string()))?;
        let mut page = Vec::new();
        for row in rows {
            page.push(row.map_err(|e| SensorGraphError::storage(e.to_string()))?);
        }
        Ok(page)
    }

    fn is_retired(
        &self,
        entity_type: EntityType,
        id: &Identifier,
    ) -> Result<bool, SensorGraphError> {
        is_retired(&self.conn, entity_type, id)
    }

    fn apply(&mut self, writes: &[RowWrite]) -> Result<(), SensorGraphError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| SensorGraphError::transaction(e.to_string()))?;
        for write in writes {
            apply_write(&tx, write)?;
        }
        verify_links(&tx, writes)?;
        verify_deletes(&tx, writes)?;
        tx.commit()
            .map_err(|e| SensorGraphError::transaction(e.to_string()))?;
        debug!(writes = writes.len(), "applied batch");
        Ok(())
    }
}

fn row_to_stored(entity_type: EntityType, row: &Row<'_>) -> rusqlite::Result<StoredRow> {
    let id: String = row.get(0)?;
    let version: i64 = row.get(1)?;
    let raw: String = row.get(2)?;
    let properties: Map<String, Value> = serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let mut links = BTreeMap::new();
    for (offset, relation) in entity_type.schema().to_one().enumerate() {
        let target: Option<String> = row.get(3 + offset)?;
        if let Some(target) = target {
            links.insert(relation.name, Identifier::new(target));
        }
    }
    Ok(StoredRow {
        id: Identifier::new(id),
        version,
        properties,
        links,
    })
}

fn link_column(relation: &Relation) -> Result<&'static str, SensorGraphError> {
    relation.column.ok_or_else(|| {
        SensorGraphError::storage(format!(
            "relation {}.{} has no link column",
            relation.source, relation.name
        ))
    })
}

fn is_retired(
    conn: &Connection,
    entity_type: EntityType,
    id: &Identifier,
) -> Result<bool, SensorGraphError> {
    conn.query_row(
        "SELECT 1 FROM retired_ids WHERE entity_type=?1 AND id=?2",
        params![entity_type.plural(), id.as_str()],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
    .map_err(|e| SensorGraphError::storage(e.to_string()))
}

fn exists(
    conn: &Connection,
    entity_type: EntityType,
    id: &Identifier,
) -> Result<bool, SensorGraphError> {
    let sql = format!("SELECT 1 FROM {} WHERE id=?1", entity_type.table());
    conn.query_row(&sql, params![id.as_str()], |_| Ok(()))
        .optional()
        .map(|found| found.is_some())
        .map_err(|e| SensorGraphError::storage(e.to_string()))
}

/// Column values in `select_columns` order after `id` and `version`.
fn row_values(entity_type: EntityType, row: &StoredRow) -> Result<Vec<SqlValue>, SensorGraphError> {
    let properties = serde_json::to_string(&row.properties)
        .map_err(|e| SensorGraphError::storage(e.to_string()))?;
    let mut values = vec![SqlValue::Text(properties)];
    for relation in entity_type.schema().to_one() {
        values.push(match row.links.get(relation.name) {
            Some(target) => SqlValue::Text(target.as_str().to_string()),
            None => SqlValue::Null,
        });
    }
    Ok(values)
}

/// Lock contention that outlasted the busy timeout fails the commit like any other conflict.
fn write_error(err: rusqlite::Error) -> SensorGraphError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            SensorGraphError::transaction(err.to_string())
        }
        _ => SensorGraphError::storage(err.to_string()),
    }
}

fn apply_write(tx: &Transaction<'_>, write: &RowWrite) -> Result<(), SensorGraphError> {
    match write {
        RowWrite::Insert { entity_type, row } => {
            if is_retired(tx, *entity_type, &row.id)? {
                return Err(SensorGraphError::transaction(format!(
                    "{entity_type}({}) was deleted and its identifier cannot be reused",
                    row.id
                )));
            }
            let columns = select_columns(*entity_type);
            let mut values = vec![
                SqlValue::Text(row.id.as_str().to_string()),
                SqlValue::Integer(row.version),
            ];
            values.extend(row_values(*entity_type, row)?);
            let placeholders = (1..=values.len())
                .map(|n| format!("?{n}"))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "INSERT INTO {}({columns}) VALUES({placeholders})",
                entity_type.table()
            );
            tx.execute(&sql, params_from_iter(values))
                .map_err(|err| match err {
                    rusqlite::Error::SqliteFailure(code, _)
                        if code.code == ErrorCode::ConstraintViolation =>
                    {
                        SensorGraphError::transaction(format!(
                            "{entity_type}({}) was created concurrently",
                            row.id
                        ))
                    }
                    other => write_error(other),
                })?;
        }
        RowWrite::Update { entity_type, row } => {
            let mut assignments = vec!["properties=?1".to_string()];
            for (offset, relation) in entity_type.schema().to_one().enumerate() {
                assignments.push(format!("{}=?{}", link_column(relation)?, offset + 2));
            }
            let mut values = row_values(*entity_type, row)?;
            let id_slot = values.len() + 1;
            values.push(SqlValue::Text(row.id.as_str().to_string()));
            values.push(SqlValue::Integer(row.version));
            let sql = format!(
                "UPDATE {} SET version=version+1, {} WHERE id=?{} AND version=?{}",
                entity_type.table(),
                assignments.join(", "),
                id_slot,
                id_slot + 1
            );
            let changed = tx
                .execute(&sql, params_from_iter(values))
                .map_err(write_error)?;
            if changed == 0 {
                return Err(SensorGraphError::transaction(format!(
                    "{entity_type}({}) was modified or deleted concurrently",
                    row.id
                )));
            }
        }
        RowWrite::Delete {
            entity_type,
            id,
            base_version,
        } => {
            if let Some(version) = base_version {
                let sql = format!("DELETE FROM {} WHERE id=?1 AND version=?2", entity_type.table());
                let changed = tx
                    .execute(&sql, params![id.as_str(), version])
                    .map_err(write_error)?;
                if changed == 0 {
                    return Err(SensorGraphError::transaction(format!(
                        "{entity_type}({id}) was modified or deleted concurrently"
                    )));
                }
            } else if exists(tx, *entity_type, id)? {
                return Err(SensorGraphError::transaction(format!(
                    "{entity_type}({id}) was created concurrently"
                )));
            }
            tx.execute(
                "INSERT OR IGNORE INTO retired_ids(entity_type, id) VALUES(?1, ?2)",
                params![entity_type.plural(), id.as_str()],
            )
            .map_err(write_error)?;
        }
    }
    Ok(())
}

/// Every link written by the batch must point at a row that exists once the batch is applied.
fn verify_links(tx: &Transaction<'_>, writes: &[RowWrite]) -> Result<(), SensorGraphError> {
    for write in writes {
        let (entity_type, row) = match write {
            RowWrite::Insert { entity_type, row } | RowWrite::Update { entity_type, row } => {
                (*entity_type, row)
            }
            RowWrite::Delete { .. } => continue,
        };
        for relation in entity_type.schema().to_one() {
            let Some(target) = row.links.get(relation.name) else {
                continue;
            };
            if !exists(tx, relation.target, target)? {
                return Err(SensorGraphError::transaction(format!(
                    "{entity_type}({}).{} points at {}({target}), which no longer exists",
                    row.id, relation.name, relation.target
                )));
            }
        }
    }
    Ok(())
}

/// No row may keep linking to a row the batch deleted.
fn verify_deletes(tx: &Transaction<'_>, writes: &[RowWrite]) -> Result<(), SensorGraphError> {
    for write in writes {
        let RowWrite::Delete {
            entity_type, id, ..
        } = write
        else {
            continue;
        };
        for relation in dependents_of(*entity_type) {
            let sql = format!(
                "SELECT id FROM {} WHERE {}=?1 LIMIT 1",
                relation.source.table(),
                link_column(relation)?
            );
            let dependent: Option<String> = tx
                .query_row(&sql, params![id.as_str()], |row| row.get(0))
                .optional()
                .map_err(write_error)?;
            if let Some(dependent) = dependent {
                return Err(SensorGraphError::transaction(format!(
                    "{}({dependent}) still links to deleted {entity_type}({id})",
                    relation.source
                )));
            }
        }
    }
    Ok(())
}
