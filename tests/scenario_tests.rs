use sensorgraph::{
    CoreSettings, EngineContext, Entity, EntityType, Identifier, PersistenceManager,
};

fn open() -> PersistenceManager {
    PersistenceManager::open(EngineContext::without_bus(CoreSettings::ephemeral())).expect("manager")
}

fn thing(name: &str) -> Entity {
    Entity::new(EntityType::Thing)
        .with_property("name", name)
        .with_property("description", format!("Description for {name}"))
}

fn insert_things(manager: &mut PersistenceManager) -> Vec<Identifier> {
    let ids = ["myThing_1", "myThing_2", "myThing_3"]
        .iter()
        .map(|name| manager.insert(&thing(name)).expect("insert"))
        .collect();
    manager.commit().expect("commit");
    ids
}

fn total(manager: &PersistenceManager) -> usize {
    manager
        .get_path("/Things", "$count=true")
        .expect("count")
        .total_count
        .expect("total")
}

fn only_id(manager: &PersistenceManager, name: &str) -> Identifier {
    let set = manager
        .get_path("/Things", &format!("$filter=name eq '{name}'"))
        .expect("filter");
    assert_eq!(set.len(), 1);
    set.first().and_then(|entity| entity.id.clone()).expect("id")
}

#[test]
fn test_insert_then_get_by_identifier() {
    let mut manager = open();
    let id = manager.insert(&thing("myThing_1")).expect("insert");
    manager.commit().expect("commit");
    let stored = manager.get(EntityType::Thing, &id).expect("get");
    assert_eq!(stored.property_str("name"), Some("myThing_1"));
    assert_eq!(
        stored.property_str("description"),
        Some("Description for myThing_1")
    );
}

#[test]
fn test_count_with_identifier_order() {
    let mut manager = open();
    let mut ids = insert_things(&mut manager);
    ids.sort();

    let set = manager
        .get_path("/Things", "$count=true&$orderby=@id asc")
        .expect("query");
    assert_eq!(set.total_count, Some(3));
    let listed: Vec<Identifier> = set.iter().filter_map(|entity| entity.id.clone()).collect();
    assert_eq!(listed, ids);

    let again = manager
        .get_path("/Things", "$count=true&$orderby=@iot.id asc")
        .expect("query");
    let relisted: Vec<Identifier> = again.iter().filter_map(|entity| entity.id.clone()).collect();
    assert_eq!(relisted, listed);
}

#[test]
fn test_update_keeps_count_and_changes_name() {
    let mut manager = open();
    insert_things(&mut manager);
    let before = total(&manager);

    let id = only_id(&manager, "myThing_2");
    manager
        .update(
            EntityType::Thing,
            &id,
            &Entity::new(EntityType::Thing).with_property("name", "mything2_Updated"),
        )
        .expect("update");
    manager.commit().expect("commit");

    assert_eq!(total(&manager), before);
    assert_eq!(only_id(&manager, "mything2_Updated"), id);
    let stale = manager
        .get_path("/Things", "$filter=name eq 'myThing_2'")
        .expect("filter");
    assert!(stale.is_empty());
}

#[test]
fn test_delete_decreases_count_by_one() {
    let mut manager = open();
    insert_things(&mut manager);
    let before = total(&manager);

    let id = only_id(&manager, "myThing_3");
    manager.delete(EntityType::Thing, &id).expect("delete");
    manager.commit().expect("commit");
    assert_eq!(total(&manager), before - 1);
}
