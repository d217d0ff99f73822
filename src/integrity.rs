//! Referential integrity: turns an entity graph supplied by a caller into an ordered plan of row
//! writes, resolving references, inserting embedded entities before the rows that link to them
//! and re-linking to-many children. Nothing is staged until the whole plan has been built.

use ahash::{AHashMap, AHashSet};
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    backend::{RowStore, StoredRow},
    config::IdGenerationMode,
    errors::SensorGraphError,
    model::{Entity, EntityKey, Identifier, Related, RelationValue},
    registry::{EntityType, Relation},
    staging::Overlay,
};

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum PlannedWrite {
    Insert {
        entity_type: EntityType,
        row: StoredRow,
    },
    /// New content for an existing row; `row.version` is the version that was read.
    Update {
        entity_type: EntityType,
        row: StoredRow,
    },
}

impl PlannedWrite {
    fn row_mut(&mut self) -> &mut StoredRow {
        match self {
            PlannedWrite::Insert { row, .. } | PlannedWrite::Update { row, .. } => row,
        }
    }
}

#[derive(Debug)]
pub(crate) struct Plan {
    /// Identifier of the entity the caller wrote.
    pub root: Identifier,
    /// Writes in dependency order: link targets precede the rows linking to them.
    pub writes: Vec<PlannedWrite>,
}

pub(crate) struct IntegrityResolver<'o, 'a, S: RowStore + ?Sized> {
    overlay: &'o Overlay<'a, S>,
    id_mode: IdGenerationMode,
    /// Entities whose resolution has started and not yet finished.
    visiting: AHashSet<EntityKey>,
    /// Index into `writes` of every row the plan creates or changes.
    planned: AHashMap<EntityKey, usize>,
    writes: Vec<PlannedWrite>,
}

impl<'o, 'a, S: RowStore + ?Sized> IntegrityResolver<'o, 'a, S> {
    pub fn new(overlay: &'o Overlay<'a, S>, id_mode: IdGenerationMode) -> Self {
        Self {
            overlay,
            id_mode,
            visiting: AHashSet::new(),
            planned: AHashMap::new(),
            writes: Vec::new(),
        }
    }

    pub fn plan_insert(mut self, entity: &Entity) -> Result<Plan, SensorGraphError> {
        if let Some(key) = entity.key() {
            if self.exists(&key)? {
                return Err(SensorGraphError::constraint(format!("{key} already exists")));
            }
        }
        let root = self.insert_new(entity, None)?;
        debug!(root = %root, writes = self.writes.len(), "planned insert");
        Ok(Plan {
            root,
            writes: self.writes,
        })
    }

    /// Plans a partial update of `existing` (as read through the overlay) with `patch`.
    pub fn plan_update(
        mut self,
        entity_type: EntityType,
        existing: StoredRow,
        patch: &Entity,
    ) -> Result<Plan, SensorGraphError> {
        if patch.entity_type != entity_type {
            return Err(SensorGraphError::constraint(format!(
                "cannot update {entity_type}({}) with a {} value",
                existing.id, patch.entity_type
            )));
        }
        if patch.id.as_ref().is_some_and(|id| *id != existing.id) {
            return Err(SensorGraphError::constraint(format!(
                "identifier of {entity_type}({}) cannot be changed",
                existing.id
            )));
        }
        validate_names(patch)?;

        let key = EntityKey::new(entity_type, existing.id.clone());
        self.visiting.insert(key.clone());
        let mut row = existing;
        for (name, value) in &patch.properties {
            if value.is_null() {
                row.properties.remove(name);
            } else {
                row.properties.insert(name.clone(), value.clone());
            }
        }
        check_required(entity_type, &row.id, &row.properties)?;
        for relation in entity_type.schema().to_one() {
            if let Some(value) = patch.relations.get(relation.name) {
                let target = self.resolve_one(relation, value)?;
                row.links.insert(relation.name, target);
            }
        }
        let root = row.id.clone();
        self.push(key.clone(), PlannedWrite::Update { entity_type, row });
        for relation in entity_type.schema().to_many() {
            if let Some(value) = patch.relations.get(relation.name) {
                self.resolve_many(relation, value, &root)?;
            }
        }
        self.visiting.remove(&key);
        debug!(root = %root, writes = self.writes.len(), "planned update");
        Ok(Plan {
            root,
            writes: self.writes,
        })
    }

    fn exists(&self, key: &EntityKey) -> Result<bool, SensorGraphError> {
        Ok(self.planned.contains_key(key) || self.overlay.fetch(key)?.is_some())
    }

    fn push(&mut self, key: EntityKey, write: PlannedWrite) {
        match self.planned.get(&key) {
            Some(&index) => self.writes[index] = write,
            None => {
                self.planned.insert(key, self.writes.len());
                self.writes.push(write);
            }
        }
    }

    fn assign_id(&self, entity: &Entity) -> Result<Identifier, SensorGraphError> {
        match (&entity.id, self.id_mode) {
            (Some(id), IdGenerationMode::ServerGeneratedOnly) => {
                Err(SensorGraphError::constraint(format!(
                    "client-supplied identifier {}({id}) is not allowed",
                    entity.entity_type
                )))
            }
            (Some(id), _) => {
                let key = EntityKey::new(entity.entity_type, id.clone());
                if self.overlay.is_retired(&key)? {
                    return Err(SensorGraphError::constraint(format!(
                        "{key} was deleted and its identifier cannot be reused"
                    )));
                }
                Ok(id.clone())
            }
            (None, IdGenerationMode::ClientGeneratedOnly) => Err(SensorGraphError::incomplete(
                format!("{} requires a client-supplied identifier", entity.entity_type),
            )),
            (None, _) => loop {
                let key = EntityKey::new(entity.entity_type, Identifier::generate());
                if !self.exists(&key)? && !self.overlay.is_retired(&key)? {
                    return Ok(key.id);
                }
            },
        }
    }

    /// Plans the insert of `entity`, first resolving its to-one targets, then its to-many
    /// members. `parent` is the to-one relation (and target) implied by an enclosing to-many.
    fn insert_new(
        &mut self,
        entity: &Entity,
        parent: Option<(&'static Relation, &Identifier)>,
    ) -> Result<Identifier, SensorGraphError> {
        let entity_type = entity.entity_type;
        validate_names(entity)?;
        let mut properties = entity.properties.clone();
        properties.retain(|_, value| !value.is_null());
        apply_defaults(entity_type, &mut properties);
        let id = self.assign_id(entity)?;
        check_required(entity_type, &id, &properties)?;

        let key = EntityKey::new(entity_type, id.clone());
        if !self.visiting.insert(key.clone()) {
            return Err(SensorGraphError::cyclic(format!(
                "{key} is referenced while it is being resolved"
            )));
        }

        let mut row = StoredRow::new(id.clone(), properties);
        for relation in entity_type.schema().to_one() {
            let implied = parent
                .filter(|(via, _)| via.name == relation.name)
                .map(|(_, target)| target.clone());
            let given = match entity.relations.get(relation.name) {
                Some(value) => Some(self.resolve_one(relation, value)?),
                None => None,
            };
            let target = match (given, implied) {
                (Some(given), Some(implied)) if given != implied => {
                    return Err(SensorGraphError::constraint(format!(
                        "{key}.{} links {} but is listed under {}({implied})",
                        relation.name,
                        given,
                        relation.target
                    )));
                }
                (Some(target), _) | (None, Some(target)) => target,
                (None, None) if relation.mandatory => {
                    return Err(SensorGraphError::incomplete(format!(
                        "{key} is missing mandatory relation {}",
                        relation.name
                    )));
                }
                (None, None) => continue,
            };
            row.links.insert(relation.name, target);
        }
        self.push(key.clone(), PlannedWrite::Insert { entity_type, row });

        for relation in entity_type.schema().to_many() {
            let members = match entity.relations.get(relation.name) {
                Some(value) => self.resolve_many(relation, value, &id)?,
                None => 0,
            };
            if relation.mandatory && members == 0 {
                return Err(SensorGraphError::incomplete(format!(
                    "{key} needs at least one member in {}",
                    relation.name
                )));
            }
        }
        self.visiting.remove(&key);
        Ok(id)
    }

    fn resolve_one(
        &mut self,
        relation: &'static Relation,
        value: &RelationValue,
    ) -> Result<Identifier, SensorGraphError> {
        match value {
            RelationValue::One(related) => self.resolve_target(relation.target, related),
            RelationValue::Many(_) => Err(SensorGraphError::constraint(format!(
                "{}.{} takes a single {}",
                relation.source, relation.name, relation.target
            ))),
        }
    }

    fn resolve_target(
        &mut self,
        target: EntityType,
        related: &Related,
    ) -> Result<Identifier, SensorGraphError> {
        match related {
            Related::Id(id) => {
                let key = EntityKey::new(target, id.clone());
                self.require_existing(&key)?;
                Ok(key.id)
            }
            Related::Entity(entity) => {
                check_type(target, entity)?;
                if let Some(key) = entity.key() {
                    if self.exists(&key)? {
                        return Ok(key.id);
                    }
                }
                self.insert_new(entity, None)
            }
        }
    }

    fn require_existing(&self, key: &EntityKey) -> Result<(), SensorGraphError> {
        if self.exists(key)? {
            Ok(())
        } else if self.visiting.contains(key) {
            Err(SensorGraphError::cyclic(format!(
                "{key} is referenced while it is being resolved"
            )))
        } else {
            Err(SensorGraphError::no_such_entity(key.to_string()))
        }
    }

    /// Inserts or re-links every member of a to-many relation of `parent_id`; returns the
    /// number of members.
    fn resolve_many(
        &mut self,
        relation: &'static Relation,
        value: &RelationValue,
        parent_id: &Identifier,
    ) -> Result<usize, SensorGraphError> {
        let RelationValue::Many(members) = value else {
            return Err(SensorGraphError::constraint(format!(
                "{}.{} takes a collection of {}",
                relation.source, relation.name, relation.target
            )));
        };
        let inverse = relation.inverse_relation();
        for member in members {
            match member {
                Related::Id(id) => {
                    let key = EntityKey::new(relation.target, id.clone());
                    self.require_existing(&key)?;
                    self.relink(key, inverse, parent_id)?;
                }
                Related::Entity(entity) => {
                    check_type(relation.target, entity)?;
                    match entity.key() {
                        Some(key) if self.exists(&key)? => self.relink(key, inverse, parent_id)?,
                        _ => {
                            self.insert_new(entity, Some((inverse, parent_id)))?;
                        }
                    }
                }
            }
        }
        Ok(members.len())
    }

    /// Points `child`'s to-one `relation` at `parent_id`, patching a planned write in place.
    fn relink(
        &mut self,
        child: EntityKey,
        relation: &'static Relation,
        parent_id: &Identifier,
    ) -> Result<(), SensorGraphError> {
        if let Some(&index) = self.planned.get(&child) {
            self.writes[index]
                .row_mut()
                .links
                .insert(relation.name, parent_id.clone());
            return Ok(());
        }
        let mut row = self
            .overlay
            .fetch(&child)?
            .ok_or_else(|| SensorGraphError::no_such_entity(child.to_string()))?;
        if row.links.get(relation.name) == Some(parent_id) {
            return Ok(());
        }
        row.links.insert(relation.name, parent_id.clone());
        let entity_type = child.entity_type;
        self.push(child, PlannedWrite::Update { entity_type, row });
        Ok(())
    }
}

fn check_type(expected: EntityType, entity: &Entity) -> Result<(), SensorGraphError> {
    if entity.entity_type == expected {
        Ok(())
    } else {
        Err(SensorGraphError::constraint(format!(
            "expected {expected}, found {}",
            entity.entity_type
        )))
    }
}

/// Rejects property and relation names the entity's schema does not declare.
fn validate_names(entity: &Entity) -> Result<(), SensorGraphError> {
    let schema = entity.entity_type.schema();
    for name in entity.properties.keys() {
        if schema.property(name).is_none() {
            return Err(SensorGraphError::unknown_property(entity.entity_type, name));
        }
    }
    for name in entity.relations.keys() {
        if schema.relation(name).is_none() {
            return Err(SensorGraphError::unknown_property(entity.entity_type, name));
        }
    }
    Ok(())
}

fn check_required(
    entity_type: EntityType,
    id: &Identifier,
    properties: &Map<String, Value>,
) -> Result<(), SensorGraphError> {
    for def in entity_type.schema().required {
        if properties.get(def.name).is_none_or(Value::is_null) {
            return Err(SensorGraphError::incomplete(format!(
                "{entity_type}({id}) is missing required property {}",
                def.name
            )));
        }
    }
    Ok(())
}

fn apply_defaults(entity_type: EntityType, properties: &mut Map<String, Value>) {
    if entity_type == EntityType::Observation && !properties.contains_key("phenomenonTime") {
        properties.insert(
            "phenomenonTime".to_string(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
    }
}
