use serde_json::json;
use sensorgraph::{
    CoreSettings, DeletePolicy, EngineContext, Entity, EntityType, Identifier,
    PersistenceManager, SensorGraphError,
};

fn open(policy: DeletePolicy) -> PersistenceManager {
    let settings = CoreSettings::ephemeral().with_delete_policy(policy);
    PersistenceManager::open(EngineContext::without_bus(settings)).expect("manager")
}

/// Thing t1 with Datastream d1 carrying Observations o1 and o2.
fn populate(manager: &mut PersistenceManager) {
    let datastream = Entity::new(EntityType::Datastream)
        .with_id("d1")
        .with_property("name", "d1")
        .with_property("description", "d1")
        .with_property("observationType", "OM_Measurement")
        .with_property("unitOfMeasurement", json!({ "symbol": "dB" }))
        .with_related(
            "Thing",
            Entity::new(EntityType::Thing)
                .with_id("t1")
                .with_property("name", "t1")
                .with_property("description", "t1"),
        )
        .with_related(
            "Sensor",
            Entity::new(EntityType::Sensor)
                .with_id("s1")
                .with_property("name", "mic")
                .with_property("description", "mic")
                .with_property("encodingType", "text/plain")
                .with_property("metadata", "none"),
        )
        .with_related(
            "ObservedProperty",
            Entity::new(EntityType::ObservedProperty)
                .with_id("p1")
                .with_property("name", "noise")
                .with_property("definition", "urn:noise")
                .with_property("description", "noise"),
        );
    manager.insert(&datastream).expect("datastream");
    for id in ["o1", "o2"] {
        manager
            .insert(
                &Entity::new(EntityType::Observation)
                    .with_id(id)
                    .with_property("result", 55)
                    .with_link("Datastream", "d1")
                    .with_related(
                        "FeatureOfInterest",
                        Entity::new(EntityType::FeatureOfInterest)
                            .with_id(format!("f-{id}"))
                            .with_property("name", "street")
                            .with_property("description", "street")
                            .with_property("encodingType", "application/vnd.geo+json")
                            .with_property("feature", json!({ "type": "Point" })),
                    ),
            )
            .expect("observation");
    }
    manager.commit().expect("commit");
}

fn count(manager: &PersistenceManager, path: &str) -> usize {
    manager
        .get_path(path, "$count=true&$top=0")
        .expect("count")
        .total_count
        .expect("total")
}

#[test]
fn test_delete_then_get_is_not_found() {
    let mut manager = open(DeletePolicy::Cascade);
    populate(&mut manager);
    let id = Identifier::new("o1");
    manager.delete(EntityType::Observation, &id).expect("delete");
    manager.commit().expect("commit");
    assert!(matches!(
        manager.get(EntityType::Observation, &id),
        Err(SensorGraphError::NotFound(_))
    ));
    assert!(matches!(
        manager.delete(EntityType::Observation, &id),
        Err(SensorGraphError::NoSuchEntity(_))
    ));
}

#[test]
fn test_cascade_removes_dependents() {
    let mut manager = open(DeletePolicy::Cascade);
    populate(&mut manager);
    manager
        .delete(EntityType::Thing, &Identifier::new("t1"))
        .expect("delete");
    assert_eq!(manager.staged_len(), 4);
    manager.commit().expect("commit");

    assert_eq!(count(&manager, "/Things"), 0);
    assert_eq!(count(&manager, "/Datastreams"), 0);
    assert_eq!(count(&manager, "/Observations"), 0);
    assert_eq!(count(&manager, "/Sensors"), 1);
    assert_eq!(count(&manager, "/FeaturesOfInterest"), 2);
}

#[test]
fn test_reject_policy_refuses_referenced_entities() {
    let mut manager = open(DeletePolicy::Reject);
    populate(&mut manager);
    let err = manager
        .delete(EntityType::Sensor, &Identifier::new("s1"))
        .expect_err("referenced");
    assert!(matches!(err, SensorGraphError::ConstraintViolation(_)));
    assert_eq!(manager.staged_len(), 0);

    manager
        .delete(EntityType::Observation, &Identifier::new("o1"))
        .expect("leaf delete");
    manager
        .delete(EntityType::Observation, &Identifier::new("o2"))
        .expect("leaf delete");
    manager
        .delete(EntityType::Datastream, &Identifier::new("d1"))
        .expect("no dependents left");
    manager
        .delete(EntityType::Sensor, &Identifier::new("s1"))
        .expect("no dependents left");
    manager.commit().expect("commit");
    assert_eq!(count(&manager, "/Sensors"), 0);
}

#[test]
fn test_deleted_identifier_is_never_reused() {
    let mut manager = open(DeletePolicy::Cascade);
    populate(&mut manager);
    manager
        .delete(EntityType::Sensor, &Identifier::new("s1"))
        .expect("delete");
    let reuse = Entity::new(EntityType::Sensor)
        .with_id("s1")
        .with_property("name", "again")
        .with_property("description", "again")
        .with_property("encodingType", "text/plain")
        .with_property("metadata", "none");
    assert!(matches!(
        manager.insert(&reuse),
        Err(SensorGraphError::ConstraintViolation(_))
    ));
    manager.commit().expect("commit");
    assert!(matches!(
        manager.insert(&reuse),
        Err(SensorGraphError::ConstraintViolation(_))
    ));
}

#[test]
fn test_delete_of_staged_insert_never_reaches_store() {
    let mut manager = open(DeletePolicy::Cascade);
    let id = manager
        .insert(
            &Entity::new(EntityType::Thing)
                .with_property("name", "short-lived")
                .with_property("description", "x"),
        )
        .expect("insert");
    manager.delete(EntityType::Thing, &id).expect("delete");
    manager.commit().expect("commit");
    assert_eq!(count(&manager, "/Things"), 0);
}
