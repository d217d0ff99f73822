use rand::{Rng, SeedableRng, rngs::StdRng};
use serde_json::json;

use crate::{
    backend::RowStore,
    errors::SensorGraphError,
    manager::PersistenceManager,
    model::Entity,
    registry::EntityType,
};

/// Sizes of a generated sensor network.
#[derive(Clone, Copy, Debug)]
pub struct DatasetShape {
    pub things: usize,
    pub datastreams_per_thing: usize,
    pub observations_per_datastream: usize,
}

impl DatasetShape {
    pub fn observations(&self) -> usize {
        self.things * self.datastreams_per_thing * self.observations_per_datastream
    }
}

/// Entities with client-chosen identifiers, listed so every link target precedes the entities
/// linking to it.
#[derive(Clone, Debug)]
pub struct SensorDataset {
    pub entities: Vec<Entity>,
}

impl SensorDataset {
    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn count(&self, entity_type: EntityType) -> usize {
        self.entities
            .iter()
            .filter(|entity| entity.entity_type == entity_type)
            .count()
    }
}

pub fn generate_dataset(shape: DatasetShape, seed: u64) -> SensorDataset {
    assert!(shape.things > 0, "things must be positive");
    let mut rng = StdRng::seed_from_u64(seed);
    let mut entities = Vec::new();
    entities.push(
        Entity::new(EntityType::Sensor)
            .with_id("sensor-0")
            .with_property("name", "Thermometer")
            .with_property("description", "Generic temperature sensor")
            .with_property("encodingType", "application/pdf")
            .with_property("metadata", "https://example.org/thermometer.pdf"),
    );
    entities.push(
        Entity::new(EntityType::ObservedProperty)
            .with_id("op-0")
            .with_property("name", "Temperature")
            .with_property("definition", "http://dbpedia.org/page/Temperature")
            .with_property("description", "Air temperature"),
    );
    entities.push(
        Entity::new(EntityType::FeatureOfInterest)
            .with_id("foi-0")
            .with_property("name", "Site")
            .with_property("description", "Measurement site")
            .with_property("encodingType", "application/vnd.geo+json")
            .with_property(
                "feature",
                json!({ "type": "Point", "coordinates": [10.9, 48.4] }),
            ),
    );
    for thing in 0..shape.things {
        let thing_id = format!("thing-{thing:05}");
        entities.push(
            Entity::new(EntityType::Thing)
                .with_id(thing_id.as_str())
                .with_property("name", format!("Thing {thing}"))
                .with_property("description", format!("Generated thing {thing}"))
                .with_property("properties", json!({ "group": thing % 7 })),
        );
        for stream in 0..shape.datastreams_per_thing {
            let stream_id = format!("{thing_id}-ds-{stream:03}");
            entities.push(
                Entity::new(EntityType::Datastream)
                    .with_id(stream_id.as_str())
                    .with_property("name", format!("Datastream {stream} of {thing_id}"))
                    .with_property("description", "Generated datastream")
                    .with_property(
                        "observationType",
                        "http://www.opengis.net/def/observationType/OGC-OM/2.0/OM_Measurement",
                    )
                    .with_property(
                        "unitOfMeasurement",
                        json!({ "name": "degree Celsius", "symbol": "degC" }),
                    )
                    .with_link("Thing", thing_id.as_str())
                    .with_link("Sensor", "sensor-0")
                    .with_link("ObservedProperty", "op-0"),
            );
            for obs in 0..shape.observations_per_datastream {
                let result: f64 = rng.gen_range(-20.0..40.0);
                entities.push(
                    Entity::new(EntityType::Observation)
                        .with_id(format!("{stream_id}-obs-{obs:05}"))
                        .with_property("result", (result * 10.0).round() / 10.0)
                        .with_property("phenomenonTime", format!("2024-01-01T00:{:02}:00Z", obs % 60))
                        .with_link("Datastream", stream_id.as_str())
                        .with_link("FeatureOfInterest", "foi-0"),
                );
            }
        }
    }
    SensorDataset { entities }
}

/// Inserts the whole dataset in one transaction.
pub fn load_dataset<S: RowStore>(
    manager: &mut PersistenceManager<S>,
    dataset: &SensorDataset,
) -> Result<(), SensorGraphError> {
    for entity in &dataset.entities {
        manager.insert(entity)?;
    }
    manager.commit()
}
