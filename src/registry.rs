//! Static entity schema for the SensorThings sensing model.
//!
//! Every entity type is a variant of the closed [`EntityType`] enum and carries its schema as
//! `'static` data: property definitions, relation definitions and the table/column names the
//! SQLite store uses. Relations are only ever stored on the to-one side; each to-many relation
//! names the to-one relation on its target type that points back (its inverse).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::SensorGraphError;

/// Names accepted for the identifier pseudo-property in queries.
pub const ID_ALIASES: [&str; 3] = ["id", "@id", "@iot.id"];

pub fn is_id_alias(name: &str) -> bool {
    ID_ALIASES.contains(&name)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityType {
    Thing,
    Sensor,
    ObservedProperty,
    Datastream,
    Observation,
    FeatureOfInterest,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropertyKind {
    /// JSON string.
    Text,
    /// Arbitrary JSON, usually an object.
    Json,
    /// Scalar or JSON; no declared type.
    Any,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PropertyDef {
    pub name: &'static str,
    pub kind: PropertyKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cardinality {
    ToOne,
    ToMany,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Relation {
    pub name: &'static str,
    pub source: EntityType,
    pub target: EntityType,
    pub cardinality: Cardinality,
    pub mandatory: bool,
    /// Name of the relation on `target` that points back at `source`.
    pub inverse: &'static str,
    /// Link column on the source table; set for to-one relations only.
    pub column: Option<&'static str>,
}

impl Relation {
    pub fn is_to_one(&self) -> bool {
        self.cardinality == Cardinality::ToOne
    }

    pub fn inverse_relation(&self) -> &'static Relation {
        self.target
            .schema()
            .relation(self.inverse)
            .expect("registry declares every inverse relation")
    }
}

#[derive(Debug)]
pub struct EntitySchema {
    pub entity_type: EntityType,
    pub required: &'static [PropertyDef],
    pub optional: &'static [PropertyDef],
    pub relations: &'static [Relation],
}

impl EntitySchema {
    pub fn property(&'static self, name: &str) -> Option<&'static PropertyDef> {
        self.properties().find(|def| def.name == name)
    }

    pub fn properties(&'static self) -> impl Iterator<Item = &'static PropertyDef> {
        self.required.iter().chain(self.optional.iter())
    }

    pub fn relation(&'static self, name: &str) -> Option<&'static Relation> {
        self.relations.iter().find(|rel| rel.name == name)
    }

    pub fn to_one(&'static self) -> impl Iterator<Item = &'static Relation> {
        self.relations.iter().filter(|rel| rel.is_to_one())
    }

    pub fn to_many(&'static self) -> impl Iterator<Item = &'static Relation> {
        self.relations.iter().filter(|rel| !rel.is_to_one())
    }
}

const fn text(name: &'static str) -> PropertyDef {
    PropertyDef {
        name,
        kind: PropertyKind::Text,
    }
}

const fn json(name: &'static str) -> PropertyDef {
    PropertyDef {
        name,
        kind: PropertyKind::Json,
    }
}

const fn any(name: &'static str) -> PropertyDef {
    PropertyDef {
        name,
        kind: PropertyKind::Any,
    }
}

const fn to_one(
    name: &'static str,
    source: EntityType,
    target: EntityType,
    inverse: &'static str,
    column: &'static str,
) -> Relation {
    Relation {
        name,
        source,
        target,
        cardinality: Cardinality::ToOne,
        mandatory: true,
        inverse,
        column: Some(column),
    }
}

const fn to_many(
    name: &'static str,
    source: EntityType,
    target: EntityType,
    inverse: &'static str,
) -> Relation {
    Relation {
        name,
        source,
        target,
        cardinality: Cardinality::ToMany,
        mandatory: false,
        inverse,
        column: None,
    }
}

static THING: EntitySchema = EntitySchema {
    entity_type: EntityType::Thing,
    required: &[text("name"), text("description")],
    optional: &[json("properties")],
    relations: &[to_many(
        "Datastreams",
        EntityType::Thing,
        EntityType::Datastream,
        "Thing",
    )],
};

static SENSOR: EntitySchema = EntitySchema {
    entity_type: EntityType::Sensor,
    required: &[
        text("name"),
        text("description"),
        text("encodingType"),
        any("metadata"),
    ],
    optional: &[json("properties")],
    relations: &[to_many(
        "Datastreams",
        EntityType::Sensor,
        EntityType::Datastream,
        "Sensor",
    )],
};

static OBSERVED_PROPERTY: EntitySchema = EntitySchema {
    entity_type: EntityType::ObservedProperty,
    required: &[text("name"), text("definition"), text("description")],
    optional: &[json("properties")],
    relations: &[to_many(
        "Datastreams",
        EntityType::ObservedProperty,
        EntityType::Datastream,
        "ObservedProperty",
    )],
};

static DATASTREAM: EntitySchema = EntitySchema {
    entity_type: EntityType::Datastream,
    required: &[
        text("name"),
        text("description"),
        text("observationType"),
        json("unitOfMeasurement"),
    ],
    optional: &[
        json("observedArea"),
        text("phenomenonTime"),
        text("resultTime"),
        json("properties"),
    ],
    relations: &[
        to_one(
            "Thing",
            EntityType::Datastream,
            EntityType::Thing,
            "Datastreams",
            "thing_id",
        ),
        to_one(
            "Sensor",
            EntityType::Datastream,
            EntityType::Sensor,
            "Datastreams",
            "sensor_id",
        ),
        to_one(
            "ObservedProperty",
            EntityType::Datastream,
            EntityType::ObservedProperty,
            "Datastreams",
            "observed_property_id",
        ),
        to_many(
            "Observations",
            EntityType::Datastream,
            EntityType::Observation,
            "Datastream",
        ),
    ],
};

static OBSERVATION: EntitySchema = EntitySchema {
    entity_type: EntityType::Observation,
    required: &[any("result")],
    optional: &[
        text("phenomenonTime"),
        text("resultTime"),
        any("resultQuality"),
        text("validTime"),
        json("parameters"),
    ],
    relations: &[
        to_one(
            "Datastream",
            EntityType::Observation,
            EntityType::Datastream,
            "Observations",
            "datastream_id",
        ),
        to_one(
            "FeatureOfInterest",
            EntityType::Observation,
            EntityType::FeatureOfInterest,
            "Observations",
            "feature_of_interest_id",
        ),
    ],
};

static FEATURE_OF_INTEREST: EntitySchema = EntitySchema {
    entity_type: EntityType::FeatureOfInterest,
    required: &[
        text("name"),
        text("description"),
        text("encodingType"),
        json("feature"),
    ],
    optional: &[json("properties")],
    relations: &[to_many(
        "Observations",
        EntityType::FeatureOfInterest,
        EntityType::Observation,
        "FeatureOfInterest",
    )],
};

impl EntityType {
    pub const ALL: [EntityType; 6] = [
        EntityType::Thing,
        EntityType::Sensor,
        EntityType::ObservedProperty,
        EntityType::Datastream,
        EntityType::Observation,
        EntityType::FeatureOfInterest,
    ];

    pub fn plural(self) -> &'static str {
        match self {
            EntityType::Thing => "Things",
            EntityType::Sensor => "Sensors",
            EntityType::ObservedProperty => "ObservedProperties",
            EntityType::Datastream => "Datastreams",
            EntityType::Observation => "Observations",
            EntityType::FeatureOfInterest => "FeaturesOfInterest",
        }
    }

    pub fn singular(self) -> &'static str {
        match self {
            EntityType::Thing => "Thing",
            EntityType::Sensor => "Sensor",
            EntityType::ObservedProperty => "ObservedProperty",
            EntityType::Datastream => "Datastream",
            EntityType::Observation => "Observation",
            EntityType::FeatureOfInterest => "FeatureOfInterest",
        }
    }

    pub fn table(self) -> &'static str {
        match self {
            EntityType::Thing => "things",
            EntityType::Sensor => "sensors",
            EntityType::ObservedProperty => "observed_properties",
            EntityType::Datastream => "datastreams",
            EntityType::Observation => "observations",
            EntityType::FeatureOfInterest => "features_of_interest",
        }
    }

    pub fn schema(self) -> &'static EntitySchema {
        match self {
            EntityType::Thing => &THING,
            EntityType::Sensor => &SENSOR,
            EntityType::ObservedProperty => &OBSERVED_PROPERTY,
            EntityType::Datastream => &DATASTREAM,
            EntityType::Observation => &OBSERVATION,
            EntityType::FeatureOfInterest => &FEATURE_OF_INTEREST,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.singular())
    }
}

/// Resolves a plural collection name such as `Things`.
pub fn lookup(plural: &str) -> Result<EntityType, SensorGraphError> {
    EntityType::ALL
        .into_iter()
        .find(|ty| ty.plural() == plural)
        .ok_or_else(|| SensorGraphError::unknown_entity_type(plural))
}

pub fn lookup_singular(name: &str) -> Option<EntityType> {
    EntityType::ALL.into_iter().find(|ty| ty.singular() == name)
}

/// First relation declared on `from` whose target is `to`.
pub fn relation_between(from: EntityType, to: EntityType) -> Option<&'static Relation> {
    from.schema().relations.iter().find(|rel| rel.target == to)
}

/// To-one relations on any type that point at `target`.
pub fn dependents_of(target: EntityType) -> impl Iterator<Item = &'static Relation> {
    EntityType::ALL
        .into_iter()
        .flat_map(|ty| ty.schema().to_one())
        .filter(move |rel| rel.target == target)
}
