//! Uncommitted writes of one persistence manager and the read overlay that lets the manager see
//! them before commit.

use std::{collections::BTreeMap, iter::Peekable};

use ahash::AHashSet;

use crate::{
    backend::{RowScope, RowStore, RowWrite, SCAN_PAGE_SIZE, ScanCursor, StoredRow},
    bus::{ChangeAction, EntityChangedEvent},
    errors::SensorGraphError,
    model::{EntityKey, Identifier},
    registry::EntityType,
};

/// Net effect of a transaction on one row.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum StagedRow {
    Inserted(StoredRow),
    /// `row.version` is the committed version the update was staged against.
    Updated(StoredRow),
    Deleted { base_version: Option<i64> },
}

impl StagedRow {
    fn row(&self) -> Option<&StoredRow> {
        match self {
            StagedRow::Inserted(row) | StagedRow::Updated(row) => Some(row),
            StagedRow::Deleted { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Staging {
    rows: BTreeMap<EntityKey, StagedRow>,
    events: Vec<EntityChangedEvent>,
}

impl Staging {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of rows the commit would touch.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, key: &EntityKey) -> Option<&StagedRow> {
        self.rows.get(key)
    }

    pub fn clear(&mut self) {
        self.rows.clear();
        self.events.clear();
    }

    /// Drains the events recorded since the last clear, in staging order.
    pub fn take_events(&mut self) -> Vec<EntityChangedEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn stage_insert(&mut self, entity_type: EntityType, row: StoredRow) {
        let key = EntityKey::new(entity_type, row.id.clone());
        self.record(&key, ChangeAction::Created);
        self.rows.insert(key, StagedRow::Inserted(row));
    }

    /// Stages `row` as the new content of an existing entity. `row.version` must be the version
    /// the caller read.
    pub fn stage_update(&mut self, entity_type: EntityType, row: StoredRow) {
        let key = EntityKey::new(entity_type, row.id.clone());
        self.record(&key, ChangeAction::Updated);
        let staged = match self.rows.get(&key) {
            Some(StagedRow::Inserted(_)) => StagedRow::Inserted(row),
            _ => StagedRow::Updated(row),
        };
        self.rows.insert(key, staged);
    }

    /// Stages removal of an entity whose current version is `version`.
    pub fn stage_delete(&mut self, key: EntityKey, version: i64) {
        self.record(&key, ChangeAction::Deleted);
        let base_version = match self.rows.get(&key) {
            Some(StagedRow::Inserted(_)) => None,
            _ => Some(version),
        };
        self.rows.insert(key, StagedRow::Deleted { base_version });
    }

    fn record(&mut self, key: &EntityKey, action: ChangeAction) {
        self.events.push(EntityChangedEvent {
            entity_type: key.entity_type,
            id: key.id.clone(),
            action,
        });
    }

    /// The commit batch: staged rows in key order.
    pub fn writes(&self) -> Vec<RowWrite> {
        self.rows
            .iter()
            .map(|(key, staged)| match staged {
                StagedRow::Inserted(row) => RowWrite::Insert {
                    entity_type: key.entity_type,
                    row: row.clone(),
                },
                StagedRow::Updated(row) => RowWrite::Update {
                    entity_type: key.entity_type,
                    row: row.clone(),
                },
                StagedRow::Deleted { base_version } => RowWrite::Delete {
                    entity_type: key.entity_type,
                    id: key.id.clone(),
                    base_version: *base_version,
                },
            })
            .collect()
    }

    fn of_type(&self, entity_type: EntityType) -> impl Iterator<Item = (&EntityKey, &StagedRow)> {
        self.rows
            .iter()
            .filter(move |(key, _)| key.entity_type == entity_type)
    }
}

/// Committed rows with the manager's staged writes laid over them.
pub(crate) struct Overlay<'a, S: RowStore + ?Sized> {
    store: &'a S,
    staging: &'a Staging,
}

impl<'a, S: RowStore + ?Sized> Overlay<'a, S> {
    pub fn new(store: &'a S, staging: &'a Staging) -> Self {
        Self { store, staging }
    }

    pub fn fetch(&self, key: &EntityKey) -> Result<Option<StoredRow>, SensorGraphError> {
        match self.staging.get(key) {
            Some(staged) => Ok(staged.row().cloned()),
            None => self.store.fetch(key.entity_type, &key.id),
        }
    }

    /// True for identifiers deleted in the store or in this transaction.
    pub fn is_retired(&self, key: &EntityKey) -> Result<bool, SensorGraphError> {
        match self.staging.get(key) {
            Some(StagedRow::Deleted { .. }) => Ok(true),
            Some(_) => Ok(false),
            None => self.store.is_retired(key.entity_type, &key.id),
        }
    }

    /// Rows admitted by `scope` in ascending identifier order, paging the store lazily.
    pub fn scan(
        &self,
        entity_type: EntityType,
        scope: RowScope,
    ) -> OverlayScan<ScanCursor<'a, S>> {
        let mut shadowed = AHashSet::new();
        let mut staged = Vec::new();
        for (key, entry) in self.staging.of_type(entity_type) {
            shadowed.insert(key.id.clone());
            if let Some(row) = entry.row().filter(|row| scope.admits(row)) {
                staged.push(row.clone());
            }
        }
        let base = ScanCursor::new(self.store, entity_type, scope, SCAN_PAGE_SIZE);
        OverlayScan {
            base: base.peekable(),
            staged: staged.into_iter().peekable(),
            shadowed,
        }
    }
}

/// Merges a committed-row stream with staged rows, both in identifier order. Committed rows
/// whose identifier is staged are replaced by the staged version (or dropped when deleted).
pub(crate) struct OverlayScan<I: Iterator<Item = Result<StoredRow, SensorGraphError>>> {
    base: Peekable<I>,
    staged: Peekable<std::vec::IntoIter<StoredRow>>,
    shadowed: AHashSet<Identifier>,
}

impl<I> Iterator for OverlayScan<I>
where
    I: Iterator<Item = Result<StoredRow, SensorGraphError>>,
{
    type Item = Result<StoredRow, SensorGraphError>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(Ok(row)) = self.base.peek() {
            if !self.shadowed.contains(&row.id) {
                break;
            }
            self.base.next();
        }
        match (self.base.peek(), self.staged.peek()) {
            (Some(Ok(committed)), Some(staged)) if staged.id < committed.id => {
                self.staged.next().map(Ok)
            }
            (Some(_), _) => self.base.next(),
            (None, Some(_)) => self.staged.next().map(Ok),
            (None, None) => None,
        }
    }
}
