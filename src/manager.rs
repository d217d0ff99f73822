//! The persistence manager: transactional reads and writes over one row store connection.
//!
//! Writes are staged in the manager and become visible to other managers only on
//! [`PersistenceManager::commit`]. Reads made through the manager see its own staged writes.

use std::{sync::Arc, time::Duration};

use ahash::AHashSet;
use tracing::{debug, info, warn};

use crate::{
    backend::{RowScope, RowStore, SqliteRowStore, StoredRow},
    config::DeletePolicy,
    context::EngineContext,
    errors::SensorGraphError,
    integrity::{IntegrityResolver, PlannedWrite},
    model::{Entity, EntityKey, EntitySet, Identifier, Related, RelationValue},
    path::{ResourcePath, parse_path},
    query::{Deadline, Query, evaluate, parse_query},
    registry::{EntityType, Relation, dependents_of},
    staging::{Overlay, Staging},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionState {
    /// No staged writes.
    Idle,
    /// At least one write is staged and awaits commit or rollback.
    Active,
    Closed,
}

pub struct PersistenceManager<S: RowStore = SqliteRowStore> {
    context: Arc<EngineContext>,
    store: Option<S>,
    staging: Staging,
}

impl PersistenceManager<SqliteRowStore> {
    /// Opens a connection to the store described by the context's settings.
    pub fn open(context: Arc<EngineContext>) -> Result<Self, SensorGraphError> {
        let store = SqliteRowStore::open(context.settings())?;
        info!(store = %context.settings().store.connection_uri(), "persistence manager opened");
        Ok(Self::with_store(context, store))
    }
}

impl<S: RowStore> PersistenceManager<S> {
    pub fn with_store(context: Arc<EngineContext>, store: S) -> Self {
        Self {
            context,
            store: Some(store),
            staging: Staging::default(),
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn state(&self) -> TransactionState {
        if self.store.is_none() {
            TransactionState::Closed
        } else if self.staging.is_empty() {
            TransactionState::Idle
        } else {
            TransactionState::Active
        }
    }

    /// Number of rows the next commit would write.
    pub fn staged_len(&self) -> usize {
        self.staging.len()
    }

    fn store(&self) -> Result<&S, SensorGraphError> {
        self.store
            .as_ref()
            .ok_or_else(|| SensorGraphError::transaction("persistence manager is closed"))
    }

    fn overlay(&self) -> Result<Overlay<'_, S>, SensorGraphError> {
        Ok(Overlay::new(self.store()?, &self.staging))
    }

    pub fn get(&self, entity_type: EntityType, id: &Identifier) -> Result<Entity, SensorGraphError> {
        let key = EntityKey::new(entity_type, id.clone());
        self.overlay()?
            .fetch(&key)?
            .map(|row| row.into_entity(entity_type))
            .ok_or_else(|| SensorGraphError::not_found(key.to_string()))
    }

    /// Parses `path` and `query` and evaluates the query at the path's scope.
    pub fn get_path(&self, path: &str, query: &str) -> Result<EntitySet, SensorGraphError> {
        self.store()?;
        let path = parse_path(path)?;
        let query = parse_query(query, path.target_type(), &self.context.settings().query)?;
        self.query(&path, &query)
    }

    /// Like [`get_path`](Self::get_path) with an explicit evaluation budget.
    pub fn get_within(
        &self,
        path: &str,
        query: &str,
        timeout: Duration,
    ) -> Result<EntitySet, SensorGraphError> {
        self.store()?;
        let path = parse_path(path)?;
        let query = parse_query(query, path.target_type(), &self.context.settings().query)?;
        self.query_with_deadline(&path, &query, &Deadline::new(Some(timeout)))
    }

    pub fn query(&self, path: &ResourcePath, query: &Query) -> Result<EntitySet, SensorGraphError> {
        let deadline = Deadline::new(self.context.settings().query.timeout());
        self.query_with_deadline(path, query, &deadline)
    }

    pub fn query_with_deadline(
        &self,
        path: &ResourcePath,
        query: &Query,
        deadline: &Deadline,
    ) -> Result<EntitySet, SensorGraphError> {
        let target = path.target_type();
        if query.entity_type != target {
            return Err(SensorGraphError::syntax(format!(
                "query over {} cannot run on path {path}",
                query.entity_type
            )));
        }
        let overlay = self.overlay()?;
        let Some(scope) = self.resolve_scope(&overlay, path)? else {
            debug!(path = %path, "path scope is empty");
            return Ok(EntitySet::default());
        };
        let candidates = overlay
            .scan(target, scope)
            .map(|row| row.map(|row| row.into_entity(target)));
        let page = evaluate(query, candidates, deadline)?;

        let mut items = page.items;
        for entity in &mut items {
            for expand in &query.expand {
                self.expand_into(&overlay, entity, &expand.relations, deadline)?;
            }
            query.project(entity);
        }
        debug!(path = %path, items = items.len(), "query evaluated");
        Ok(EntitySet {
            items,
            total_count: page.total_count,
            next_skip: page.next_skip,
        })
    }

    /// Walks the path's instance segments and returns the scan scope of the terminal segment,
    /// or `None` when nothing can be reached.
    fn resolve_scope(
        &self,
        overlay: &Overlay<'_, S>,
        path: &ResourcePath,
    ) -> Result<Option<RowScope>, SensorGraphError> {
        let segments = path.segments();
        let last = segments.len() - 1;
        let first = &segments[0];
        if last == 0 {
            return Ok(Some(RowScope::all().with_id(first.id.clone())));
        }
        let mut current = self.existing_instance(overlay, first.entity_type, first.id.as_ref(), 0)?;
        for (index, segment) in segments.iter().enumerate().skip(1) {
            let relation = segment.via.ok_or_else(|| {
                SensorGraphError::invalid_traversal(index, segment.entity_type.plural(), "no relation")
            })?;
            let terminal = index == last;
            let next_id = if relation.is_to_one() {
                let Some(linked) = current.links.get(relation.name).cloned() else {
                    return Ok(None);
                };
                if segment.id.as_ref().is_some_and(|id| *id != linked) {
                    if terminal {
                        return Ok(None);
                    }
                    return Err(SensorGraphError::not_found(format!(
                        "{}({}) is not linked from segment {}",
                        segment.entity_type,
                        segment.id.as_ref().map_or("", Identifier::as_str),
                        index - 1
                    )));
                }
                if terminal {
                    return Ok(Some(RowScope::id(linked)));
                }
                linked
            } else {
                let inverse = relation.inverse_relation();
                if terminal {
                    return Ok(Some(
                        RowScope::linked(inverse, current.id.clone()).with_id(segment.id.clone()),
                    ));
                }
                let id = segment.id.clone().ok_or_else(|| {
                    SensorGraphError::invalid_traversal(
                        index,
                        segment.entity_type.plural(),
                        "only an instance may be navigated from",
                    )
                })?;
                let key = EntityKey::new(segment.entity_type, id.clone());
                let child = overlay
                    .fetch(&key)?
                    .ok_or_else(|| SensorGraphError::not_found(key.to_string()))?;
                if child.links.get(inverse.name) != Some(&current.id) {
                    return Err(SensorGraphError::not_found(format!(
                        "{key} is not related to segment {}",
                        index - 1
                    )));
                }
                current = child;
                continue;
            };
            current = self.existing_instance(overlay, segment.entity_type, Some(&next_id), index)?;
        }
        Ok(None)
    }

    fn existing_instance(
        &self,
        overlay: &Overlay<'_, S>,
        entity_type: EntityType,
        id: Option<&Identifier>,
        index: usize,
    ) -> Result<StoredRow, SensorGraphError> {
        let id = id.ok_or_else(|| {
            SensorGraphError::invalid_traversal(
                index,
                entity_type.plural(),
                "only an instance may be navigated from",
            )
        })?;
        let key = EntityKey::new(entity_type, id.clone());
        overlay
            .fetch(&key)?
            .ok_or_else(|| SensorGraphError::not_found(key.to_string()))
    }

    /// Embeds the entities reached through `relations` into `entity`, reusing members an earlier
    /// `$expand` path already embedded.
    fn expand_into(
        &self,
        overlay: &Overlay<'_, S>,
        entity: &mut Entity,
        relations: &[&'static Relation],
        deadline: &Deadline,
    ) -> Result<(), SensorGraphError> {
        let Some((relation, rest)) = relations.split_first() else {
            return Ok(());
        };
        deadline.check()?;
        let mut related: Vec<Entity> = match entity.relations.get(relation.name) {
            Some(RelationValue::One(Related::Entity(embedded))) => vec![(**embedded).clone()],
            Some(RelationValue::Many(members))
                if !members.is_empty()
                    && members.iter().all(|m| matches!(m, Related::Entity(_))) =>
            {
                entity.expanded(relation.name).into_iter().cloned().collect()
            }
            _ => self.load_related(overlay, entity, relation)?,
        };
        for child in &mut related {
            self.expand_into(overlay, child, rest, deadline)?;
        }
        let value = if relation.is_to_one() {
            match related.pop() {
                Some(child) => RelationValue::One(Related::entity(child)),
                None => return Ok(()),
            }
        } else {
            RelationValue::Many(related.into_iter().map(Related::entity).collect())
        };
        entity.relations.insert(relation.name.to_string(), value);
        Ok(())
    }

    fn load_related(
        &self,
        overlay: &Overlay<'_, S>,
        entity: &Entity,
        relation: &'static Relation,
    ) -> Result<Vec<Entity>, SensorGraphError> {
        if relation.is_to_one() {
            let Some(target) = entity.link(relation.name) else {
                return Ok(Vec::new());
            };
            let key = EntityKey::new(relation.target, target.clone());
            return Ok(overlay
                .fetch(&key)?
                .map(|row| row.into_entity(relation.target))
                .into_iter()
                .collect());
        }
        let Some(id) = entity.id.clone() else {
            return Ok(Vec::new());
        };
        overlay
            .scan(relation.target, RowScope::linked(relation.inverse_relation(), id))
            .map(|row| row.map(|row| row.into_entity(relation.target)))
            .collect()
    }

    /// Validates `entity` and its embedded entities and stages their inserts. Returns the
    /// identifier of `entity`.
    pub fn insert(&mut self, entity: &Entity) -> Result<Identifier, SensorGraphError> {
        let id_mode = self.context.settings().id_generation;
        let plan = {
            let overlay = self.overlay()?;
            IntegrityResolver::new(&overlay, id_mode).plan_insert(entity)?
        };
        self.stage_plan(plan.writes);
        debug!(entity_type = %entity.entity_type, id = %plan.root, "staged insert");
        Ok(plan.root)
    }

    /// Merges `patch` into the stored entity: listed properties are replaced (JSON `null`
    /// removes them), listed relations are re-pointed, everything else is kept.
    pub fn update(
        &mut self,
        entity_type: EntityType,
        id: &Identifier,
        patch: &Entity,
    ) -> Result<(), SensorGraphError> {
        let id_mode = self.context.settings().id_generation;
        let plan = {
            let overlay = self.overlay()?;
            let key = EntityKey::new(entity_type, id.clone());
            let existing = overlay
                .fetch(&key)?
                .ok_or_else(|| SensorGraphError::no_such_entity(key.to_string()))?;
            IntegrityResolver::new(&overlay, id_mode).plan_update(entity_type, existing, patch)?
        };
        self.stage_plan(plan.writes);
        debug!(entity_type = %entity_type, id = %id, "staged update");
        Ok(())
    }

    /// Stages removal of the entity and, under [`DeletePolicy::Cascade`], of everything that
    /// holds a mandatory link to it. Optional links to removed entities are cleared.
    pub fn delete(&mut self, entity_type: EntityType, id: &Identifier) -> Result<(), SensorGraphError> {
        let policy = self.context.settings().delete_policy;
        let mut deletions = Vec::new();
        let mut unlinks = Vec::new();
        {
            let overlay = self.overlay()?;
            let key = EntityKey::new(entity_type, id.clone());
            let row = overlay
                .fetch(&key)?
                .ok_or_else(|| SensorGraphError::no_such_entity(key.to_string()))?;
            let mut seen = AHashSet::new();
            collect_deletions(
                &overlay,
                policy,
                key,
                row.version,
                &mut seen,
                &mut deletions,
                &mut unlinks,
            )?;
            let deleted: AHashSet<&EntityKey> = deletions.iter().map(|(key, _)| key).collect();
            unlinks.retain(|(key, _, _)| !deleted.contains(key));
        }
        for (key, mut row, relation) in unlinks {
            row.links.remove(relation);
            self.staging.stage_update(key.entity_type, row);
        }
        let removed = deletions.len();
        for (key, version) in deletions {
            self.staging.stage_delete(key, version);
        }
        debug!(entity_type = %entity_type, id = %id, removed, "staged delete");
        Ok(())
    }

    fn stage_plan(&mut self, writes: Vec<PlannedWrite>) {
        for write in writes {
            match write {
                PlannedWrite::Insert { entity_type, row } => {
                    self.staging.stage_insert(entity_type, row)
                }
                PlannedWrite::Update { entity_type, row } => {
                    self.staging.stage_update(entity_type, row)
                }
            }
        }
    }

    /// Applies every staged write atomically, then publishes one event per staged write.
    ///
    /// On failure nothing is applied and the staged writes are kept, so the caller decides
    /// between retrying after changes and [`rollback`](Self::rollback).
    pub fn commit(&mut self) -> Result<(), SensorGraphError> {
        let store = self
            .store
            .as_mut()
            .ok_or_else(|| SensorGraphError::transaction("persistence manager is closed"))?;
        if self.staging.is_empty() {
            return Ok(());
        }
        let writes = self.staging.writes();
        if let Err(err) = store.apply(&writes) {
            warn!(error = %err, writes = writes.len(), "commit rejected");
            return Err(err);
        }
        let events = self.staging.take_events();
        self.staging.clear();
        let bus = self.context.bus();
        for event in &events {
            bus.publish(event);
        }
        info!(writes = writes.len(), events = events.len(), "committed");
        Ok(())
    }

    pub fn rollback(&mut self) -> Result<(), SensorGraphError> {
        self.store()?;
        let discarded = self.staging.len();
        self.staging.clear();
        debug!(discarded, "rolled back");
        Ok(())
    }

    /// Releases the connection. Staged writes are discarded; every later call fails with
    /// `TransactionError`.
    pub fn close(&mut self) -> Result<(), SensorGraphError> {
        if self.store.take().is_none() {
            return Err(SensorGraphError::transaction(
                "persistence manager is already closed",
            ));
        }
        if !self.staging.is_empty() {
            warn!(discarded = self.staging.len(), "closing with staged writes");
            self.staging.clear();
        }
        info!("persistence manager closed");
        Ok(())
    }
}

type Unlink = (EntityKey, StoredRow, &'static str);

/// Post-order walk over mandatory dependents: dependents are listed before what they depend on.
fn collect_deletions<S: RowStore + ?Sized>(
    overlay: &Overlay<'_, S>,
    policy: DeletePolicy,
    key: EntityKey,
    version: i64,
    seen: &mut AHashSet<EntityKey>,
    deletions: &mut Vec<(EntityKey, i64)>,
    unlinks: &mut Vec<Unlink>,
) -> Result<(), SensorGraphError> {
    if !seen.insert(key.clone()) {
        return Ok(());
    }
    for relation in dependents_of(key.entity_type) {
        let dependents = overlay
            .scan(relation.source, RowScope::linked(relation, key.id.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        if dependents.is_empty() {
            continue;
        }
        if !relation.mandatory {
            for row in dependents {
                let child = EntityKey::new(relation.source, row.id.clone());
                unlinks.push((child, row, relation.name));
            }
            continue;
        }
        if policy == DeletePolicy::Reject {
            return Err(SensorGraphError::constraint(format!(
                "{key} is still linked from {} {}",
                dependents.len(),
                relation.source.plural()
            )));
        }
        for row in dependents {
            let child = EntityKey::new(relation.source, row.id);
            collect_deletions(overlay, policy, child, row.version, seen, deletions, unlinks)?;
        }
    }
    deletions.push((key, version));
    Ok(())
}
