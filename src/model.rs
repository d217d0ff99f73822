use std::{collections::BTreeMap, fmt};

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::registry::EntityType;

/// Opaque entity identifier, unique within one entity type's extent.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(String);

impl Identifier {
    pub fn new<T: Into<String>>(value: T) -> Self {
        Identifier(value.into())
    }

    /// Fresh 32-hex-digit identifier: a millisecond timestamp followed by 80 random bits, so
    /// generated identifiers sort roughly by creation time.
    pub fn generate() -> Self {
        let millis = Utc::now().timestamp_millis().max(0) as u64 & 0xffff_ffff_ffff;
        let mut rng = rand::thread_rng();
        let high: u16 = rng.r#gen();
        let low: u64 = rng.r#gen();
        Identifier(format!("{millis:012x}{high:04x}{low:016x}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Identifier::new(value)
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Identifier(value)
    }
}

/// Type-tagged identity of a stored entity; the key rows are stored under.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub id: Identifier,
}

impl EntityKey {
    pub fn new(entity_type: EntityType, id: Identifier) -> Self {
        Self { entity_type, id }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.entity_type, self.id)
    }
}

/// Target of a relation: a reference to an existing entity or an entity value to create.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Related {
    Id(Identifier),
    Entity(Box<Entity>),
}

impl Related {
    pub fn entity(entity: Entity) -> Self {
        Related::Entity(Box::new(entity))
    }

    pub fn id(&self) -> Option<&Identifier> {
        match self {
            Related::Id(id) => Some(id),
            Related::Entity(entity) => entity.id.as_ref(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RelationValue {
    One(Related),
    Many(Vec<Related>),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: EntityType,
    pub id: Option<Identifier>,
    pub properties: Map<String, Value>,
    pub relations: BTreeMap<String, RelationValue>,
}

impl Entity {
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            id: None,
            properties: Map::new(),
            relations: BTreeMap::new(),
        }
    }

    pub fn with_id<T: Into<Identifier>>(mut self, id: T) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_property<V: Into<Value>>(mut self, name: &str, value: V) -> Self {
        self.set_property(name, value);
        self
    }

    /// Links a to-one relation to an existing entity.
    pub fn with_link<T: Into<Identifier>>(mut self, relation: &str, id: T) -> Self {
        self.relations.insert(
            relation.to_string(),
            RelationValue::One(Related::Id(id.into())),
        );
        self
    }

    /// Sets a to-one relation to an entity that is created along with this one.
    pub fn with_related(mut self, relation: &str, entity: Entity) -> Self {
        self.relations.insert(
            relation.to_string(),
            RelationValue::One(Related::entity(entity)),
        );
        self
    }

    /// Appends a target to a to-many relation.
    pub fn with_member(mut self, relation: &str, member: Related) -> Self {
        match self.relations.get_mut(relation) {
            Some(RelationValue::Many(members)) => members.push(member),
            _ => {
                self.relations
                    .insert(relation.to_string(), RelationValue::Many(vec![member]));
            }
        }
        self
    }

    pub fn set_property<V: Into<Value>>(&mut self, name: &str, value: V) {
        self.properties.insert(name.to_string(), value.into());
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    pub fn property_str(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(Value::as_str)
    }

    pub fn key(&self) -> Option<EntityKey> {
        self.id
            .as_ref()
            .map(|id| EntityKey::new(self.entity_type, id.clone()))
    }

    /// Identifier a to-one relation points at, when given by reference.
    pub fn link(&self, relation: &str) -> Option<&Identifier> {
        match self.relations.get(relation) {
            Some(RelationValue::One(related)) => related.id(),
            _ => None,
        }
    }

    /// Entities embedded under a relation, as filled in by `$expand`.
    pub fn expanded(&self, relation: &str) -> Vec<&Entity> {
        match self.relations.get(relation) {
            Some(RelationValue::One(Related::Entity(entity))) => vec![entity.as_ref()],
            Some(RelationValue::Many(members)) => members
                .iter()
                .filter_map(|member| match member {
                    Related::Entity(entity) => Some(entity.as_ref()),
                    Related::Id(_) => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

/// Ordered result of a collection query.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EntitySet {
    pub items: Vec<Entity>,
    /// Matching entities before pagination; present when `$count=true`.
    pub total_count: Option<usize>,
    /// `$skip` for the following page when more matches exist.
    pub next_skip: Option<usize>,
}

impl EntitySet {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Entity> {
        self.items.iter()
    }

    pub fn first(&self) -> Option<&Entity> {
        self.items.first()
    }
}

impl IntoIterator for EntitySet {
    type Item = Entity;
    type IntoIter = std::vec::IntoIter<Entity>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}
