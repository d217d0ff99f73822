use serde_json::json;
use sensorgraph::{
    CoreSettings, EngineContext, Entity, EntityType, Identifier, PersistenceManager, Related,
    RelationValue, SensorGraphError,
};

fn open() -> PersistenceManager {
    PersistenceManager::open(EngineContext::without_bus(CoreSettings::ephemeral()))
        .expect("manager")
}

fn thing(name: &str) -> Entity {
    Entity::new(EntityType::Thing)
        .with_property("name", name)
        .with_property("description", "integrity")
}

fn sensor() -> Entity {
    Entity::new(EntityType::Sensor)
        .with_property("name", "PM sensor")
        .with_property("description", "optical particle counter")
        .with_property("encodingType", "application/pdf")
        .with_property("metadata", "http://example.org/opc.pdf")
}

fn observed_property() -> Entity {
    Entity::new(EntityType::ObservedProperty)
        .with_property("name", "PM10")
        .with_property("definition", "urn:pm10")
        .with_property("description", "particulate matter")
}

fn bare_datastream(name: &str) -> Entity {
    Entity::new(EntityType::Datastream)
        .with_property("name", name)
        .with_property("description", "integrity")
        .with_property("observationType", "OM_Measurement")
        .with_property("unitOfMeasurement", json!({ "symbol": "ug/m3" }))
}

fn deep_datastream(name: &str) -> Entity {
    bare_datastream(name)
        .with_related("Thing", thing("station"))
        .with_related("Sensor", sensor())
        .with_related("ObservedProperty", observed_property())
}

fn count(manager: &PersistenceManager, path: &str) -> usize {
    manager
        .get_path(path, "$count=true&$top=0")
        .expect("count")
        .total_count
        .expect("total")
}

#[test]
fn test_deep_insert_creates_and_links_embedded_entities() {
    let mut manager = open();
    let id = manager.insert(&deep_datastream("pm10")).expect("insert");
    assert_eq!(manager.staged_len(), 4);
    manager.commit().expect("commit");

    let stored = manager.get(EntityType::Datastream, &id).expect("datastream");
    for relation in ["Thing", "Sensor", "ObservedProperty"] {
        assert!(stored.link(relation).is_some(), "{relation} link");
    }
    let thing_id = stored.link("Thing").expect("thing").clone();
    let thing = manager.get(EntityType::Thing, &thing_id).expect("thing");
    assert_eq!(thing.property_str("name"), Some("station"));
}

#[test]
fn test_missing_reference_is_no_such_entity() {
    let mut manager = open();
    let datastream = deep_datastream("pm10").with_link("Sensor", "missing-sensor");
    let err = manager.insert(&datastream).expect_err("missing");
    match err {
        SensorGraphError::NoSuchEntity(msg) => assert!(msg.contains("missing-sensor"), "{msg}"),
        other => panic!("expected NoSuchEntity, got {other:?}"),
    }
    assert_eq!(manager.staged_len(), 0);
    assert_eq!(count(&manager, "/Things"), 0);
}

#[test]
fn test_missing_mandatory_relation_is_incomplete() {
    let mut manager = open();
    let datastream = bare_datastream("orphan")
        .with_related("Thing", thing("t"))
        .with_related("Sensor", sensor());
    let err = manager.insert(&datastream).expect_err("incomplete");
    assert!(matches!(err, SensorGraphError::IncompleteEntity(_)));
    assert_eq!(manager.staged_len(), 0);
}

#[test]
fn test_reference_back_to_entity_under_construction_is_cyclic() {
    let mut manager = open();
    let looping_thing = thing("loop").with_member("Datastreams", Related::Id("d1".into()));
    let datastream = bare_datastream("d1")
        .with_id("d1")
        .with_related("Thing", looping_thing)
        .with_related("Sensor", sensor())
        .with_related("ObservedProperty", observed_property());
    let err = manager.insert(&datastream).expect_err("cycle");
    assert!(matches!(err, SensorGraphError::CyclicReference(_)), "{err:?}");
    assert_eq!(manager.staged_len(), 0);
}

#[test]
fn test_to_many_members_are_linked_to_new_parent() {
    let mut manager = open();
    let parent = thing("parent")
        .with_member(
            "Datastreams",
            Related::entity(
                bare_datastream("child-a")
                    .with_related("Sensor", sensor())
                    .with_related("ObservedProperty", observed_property()),
            ),
        )
        .with_member(
            "Datastreams",
            Related::entity(
                bare_datastream("child-b")
                    .with_related("Sensor", sensor())
                    .with_related("ObservedProperty", observed_property()),
            ),
        );
    let id = manager.insert(&parent).expect("insert");
    manager.commit().expect("commit");

    let path = format!("/Things('{id}')/Datastreams");
    let children = manager.get_path(&path, "$orderby=name").expect("children");
    let names: Vec<&str> = children
        .iter()
        .map(|ds| ds.property_str("name").expect("name"))
        .collect();
    assert_eq!(names, vec!["child-a", "child-b"]);
}

#[test]
fn test_existing_member_is_relinked() {
    let mut manager = open();
    let first_ds = manager.insert(&deep_datastream("moving")).expect("insert");
    manager.commit().expect("commit");
    let old_thing = manager
        .get(EntityType::Datastream, &first_ds)
        .expect("get")
        .link("Thing")
        .cloned()
        .expect("thing");

    let new_thing = thing("new home").with_member("Datastreams", Related::Id(first_ds.clone()));
    let new_id = manager.insert(&new_thing).expect("insert");
    manager.commit().expect("commit");

    let moved = manager.get(EntityType::Datastream, &first_ds).expect("get");
    assert_eq!(moved.link("Thing"), Some(&new_id));
    assert_eq!(count(&manager, &format!("/Things('{old_thing}')/Datastreams")), 0);
}

#[test]
fn test_embedded_entity_with_existing_id_is_a_reference() {
    let mut manager = open();
    manager
        .insert(&sensor().with_id("s1"))
        .expect("sensor");
    manager.commit().expect("commit");

    let renamed = sensor().with_id("s1").with_property("name", "ignored");
    let datastream = bare_datastream("ref")
        .with_related("Thing", thing("t"))
        .with_related("Sensor", renamed)
        .with_related("ObservedProperty", observed_property());
    let id = manager.insert(&datastream).expect("insert");
    manager.commit().expect("commit");

    assert_eq!(count(&manager, "/Sensors"), 1);
    let stored = manager.get(EntityType::Datastream, &id).expect("get");
    assert_eq!(stored.link("Sensor"), Some(&Identifier::new("s1")));
    let sensor = manager
        .get(EntityType::Sensor, &Identifier::new("s1"))
        .expect("sensor");
    assert_eq!(sensor.property_str("name"), Some("PM sensor"));
}

#[test]
fn test_embedded_entity_with_new_id_is_inserted_with_it() {
    let mut manager = open();
    let datastream = bare_datastream("named")
        .with_related("Thing", thing("t").with_id("saqn:t:1"))
        .with_related("Sensor", sensor())
        .with_related("ObservedProperty", observed_property());
    manager.insert(&datastream).expect("insert");
    manager.commit().expect("commit");
    let stored = manager
        .get(EntityType::Thing, &Identifier::new("saqn:t:1"))
        .expect("thing");
    assert_eq!(stored.property_str("name"), Some("t"));
}

#[test]
fn test_shape_mismatches_are_constraint_violations() {
    let mut manager = open();
    let wrong_type = bare_datastream("wrong")
        .with_related("Thing", sensor())
        .with_related("Sensor", sensor())
        .with_related("ObservedProperty", observed_property());
    assert!(matches!(
        manager.insert(&wrong_type),
        Err(SensorGraphError::ConstraintViolation(_))
    ));

    let mut many_for_one = deep_datastream("many");
    many_for_one.relations.insert(
        "Thing".to_string(),
        RelationValue::Many(vec![Related::entity(thing("a"))]),
    );
    assert!(matches!(
        manager.insert(&many_for_one),
        Err(SensorGraphError::ConstraintViolation(_))
    ));
    assert_eq!(manager.staged_len(), 0);
}

#[test]
fn test_member_linking_a_different_parent_is_rejected() {
    let mut manager = open();
    manager.insert(&thing("other").with_id("t-other")).expect("thing");
    let child = bare_datastream("confused")
        .with_link("Thing", "t-other")
        .with_related("Sensor", sensor())
        .with_related("ObservedProperty", observed_property());
    let parent = thing("parent").with_member("Datastreams", Related::entity(child));
    let err = manager.insert(&parent).expect_err("conflict");
    assert!(matches!(err, SensorGraphError::ConstraintViolation(_)), "{err:?}");
    assert_eq!(manager.staged_len(), 1);
}

#[test]
fn test_update_can_repoint_relations() {
    let mut manager = open();
    let ds = manager.insert(&deep_datastream("repoint")).expect("insert");
    let replacement = manager.insert(&thing("replacement")).expect("thing");
    manager.commit().expect("commit");

    let patch = Entity::new(EntityType::Datastream).with_link("Thing", replacement.clone());
    manager.update(EntityType::Datastream, &ds, &patch).expect("update");
    manager.commit().expect("commit");
    let stored = manager.get(EntityType::Datastream, &ds).expect("get");
    assert_eq!(stored.link("Thing"), Some(&replacement));
    assert_eq!(stored.property_str("name"), Some("repoint"));

    let dangling = Entity::new(EntityType::Datastream).with_link("Thing", "ghost");
    assert!(matches!(
        manager.update(EntityType::Datastream, &ds, &dangling),
        Err(SensorGraphError::NoSuchEntity(_))
    ));
}
