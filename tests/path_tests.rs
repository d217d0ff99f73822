use serde_json::json;
use sensorgraph::{
    CoreSettings, EngineContext, Entity, EntitySet, EntityType, PersistenceManager,
    SensorGraphError, parse_path,
};

fn open() -> PersistenceManager {
    PersistenceManager::open(EngineContext::without_bus(CoreSettings::ephemeral()))
        .expect("manager")
}

fn datastream(id: &str, thing: &str) -> Entity {
    Entity::new(EntityType::Datastream)
        .with_id(id)
        .with_property("name", id)
        .with_property("description", "stream")
        .with_property("observationType", "OM_Measurement")
        .with_property("unitOfMeasurement", json!({ "symbol": "ppm" }))
        .with_link("Thing", thing)
        .with_link("Sensor", "s1")
        .with_link("ObservedProperty", "p1")
}

fn observation(id: &str, datastream: &str, result: i64) -> Entity {
    Entity::new(EntityType::Observation)
        .with_id(id)
        .with_property("result", result)
        .with_link("Datastream", datastream)
        .with_link("FeatureOfInterest", "f1")
}

/// t1 → {d1 → {o1, o2}, d2}, t2 → {d3 → {o3}}.
fn network() -> PersistenceManager {
    let mut manager = open();
    for id in ["t1", "t2"] {
        manager
            .insert(
                &Entity::new(EntityType::Thing)
                    .with_id(id)
                    .with_property("name", id)
                    .with_property("description", "thing"),
            )
            .expect("thing");
    }
    manager
        .insert(
            &Entity::new(EntityType::Sensor)
                .with_id("s1")
                .with_property("name", "CO2 probe")
                .with_property("description", "NDIR")
                .with_property("encodingType", "text/plain")
                .with_property("metadata", "none"),
        )
        .expect("sensor");
    manager
        .insert(
            &Entity::new(EntityType::ObservedProperty)
                .with_id("p1")
                .with_property("name", "CO2")
                .with_property("definition", "urn:co2")
                .with_property("description", "carbon dioxide"),
        )
        .expect("observed property");
    manager
        .insert(
            &Entity::new(EntityType::FeatureOfInterest)
                .with_id("f1")
                .with_property("name", "Office")
                .with_property("description", "office")
                .with_property("encodingType", "application/vnd.geo+json")
                .with_property("feature", json!({ "type": "Point", "coordinates": [3, 4] })),
        )
        .expect("feature");
    for (id, thing) in [("d1", "t1"), ("d2", "t1"), ("d3", "t2")] {
        manager.insert(&datastream(id, thing)).expect("datastream");
    }
    for (id, ds, result) in [("o1", "d1", 400), ("o2", "d1", 420), ("o3", "d3", 390)] {
        manager
            .insert(&observation(id, ds, result))
            .expect("observation");
    }
    manager.commit().expect("commit");
    manager
}

fn ids(set: &EntitySet) -> Vec<&str> {
    set.iter()
        .map(|entity| entity.id.as_ref().expect("id").as_str())
        .collect()
}

#[test]
fn test_parse_rejects_unknown_entity_set() {
    match parse_path("/Thingz") {
        Err(SensorGraphError::InvalidPathSegment { index, segment, .. }) => {
            assert_eq!(index, 0);
            assert_eq!(segment, "Thingz");
        }
        other => panic!("expected InvalidPathSegment, got {other:?}"),
    }
}

#[test]
fn test_parse_rejects_unrelated_navigation() {
    match parse_path("/Things(t1)/Sensors") {
        Err(SensorGraphError::InvalidTraversal { index, .. }) => assert_eq!(index, 1),
        other => panic!("expected InvalidTraversal, got {other:?}"),
    }
}

#[test]
fn test_parse_requires_identifier_before_navigation() {
    assert!(matches!(
        parse_path("/Things/Datastreams"),
        Err(SensorGraphError::InvalidTraversal { index: 1, .. })
    ));
}

#[test]
fn test_parse_reports_first_bad_segment() {
    assert!(matches!(
        parse_path("/Things(t1)/Datastreams(d1)/Bogus/Things"),
        Err(SensorGraphError::InvalidPathSegment { index: 2, .. })
    ));
}

#[test]
fn test_parse_accepts_singular_navigation() {
    let path = parse_path("Datastreams('d1')/Thing").expect("path");
    assert_eq!(path.target_type(), EntityType::Thing);
    assert!(path.is_instance());
    assert_eq!(path.to_string(), "/Datastreams('d1')/Thing");
}

#[test]
fn test_top_level_collection_and_instance() {
    let manager = network();
    let all = manager.get_path("/Datastreams", "").expect("query");
    assert_eq!(ids(&all), vec!["d1", "d2", "d3"]);
    let one = manager.get_path("/Datastreams('d2')", "").expect("query");
    assert_eq!(ids(&one), vec!["d2"]);
    let none = manager.get_path("/Datastreams(d9)", "").expect("query");
    assert!(none.is_empty());
}

#[test]
fn test_to_many_navigation_is_scoped_to_parent() {
    let manager = network();
    let streams = manager
        .get_path("/Things(t1)/Datastreams", "$count=true")
        .expect("query");
    assert_eq!(ids(&streams), vec!["d1", "d2"]);
    assert_eq!(streams.total_count, Some(2));

    let observations = manager
        .get_path("/Things(t1)/Datastreams(d1)/Observations", "$orderby=result desc")
        .expect("query");
    assert_eq!(ids(&observations), vec!["o2", "o1"]);
}

#[test]
fn test_to_one_navigation_returns_linked_entity() {
    let manager = network();
    let thing = manager
        .get_path("/Observations(o3)/Datastream/Thing", "")
        .expect("query");
    assert_eq!(ids(&thing), vec!["t2"]);
}

#[test]
fn test_missing_or_unrelated_instances_are_not_found() {
    let manager = network();
    for path in [
        "/Things(t9)/Datastreams",
        "/Things(t2)/Datastreams(d1)/Observations",
    ] {
        match manager.get_path(path, "") {
            Err(SensorGraphError::NotFound(_)) => {}
            other => panic!("{path}: expected NotFound, got {other:?}"),
        }
    }
    let unrelated_terminal = manager
        .get_path("/Things(t2)/Datastreams(d1)", "")
        .expect("query");
    assert!(unrelated_terminal.is_empty());
}

#[test]
fn test_nested_expand_embeds_children() {
    let manager = network();
    let set = manager
        .get_path("/Things(t1)", "$expand=Datastreams/Observations,Datastreams")
        .expect("query");
    let thing = set.first().expect("thing");
    let streams = thing.expanded("Datastreams");
    assert_eq!(streams.len(), 2);
    let observations: Vec<&str> = streams[0]
        .expanded("Observations")
        .iter()
        .map(|o| o.id.as_ref().expect("id").as_str())
        .collect();
    assert_eq!(observations, vec!["o1", "o2"]);
    assert!(streams[1].expanded("Observations").is_empty());
}

#[test]
fn test_expand_to_one_embeds_target() {
    let manager = network();
    let set = manager
        .get_path("/Observations(o1)", "$expand=Datastream/Thing")
        .expect("query");
    let observation = set.first().expect("observation");
    let datastream = observation.expanded("Datastream");
    assert_eq!(datastream.len(), 1);
    let thing = datastream[0].expanded("Thing");
    assert_eq!(thing[0].property_str("name"), Some("t1"));
}

#[test]
fn test_paths_see_staged_writes() {
    let mut manager = network();
    manager
        .insert(&datastream("d4", "t2"))
        .expect("staged datastream");
    let streams = manager
        .get_path("/Things(t2)/Datastreams", "")
        .expect("query");
    assert_eq!(ids(&streams), vec!["d3", "d4"]);
}
