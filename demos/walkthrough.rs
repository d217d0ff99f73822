use std::sync::Arc;

use sensorgraph::{
    CoreSettings, EngineContext, Entity, EntityType, PersistenceManager, RecordingBus,
};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    if let Err(err) = run() {
        eprintln!("walkthrough error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let bus = Arc::new(RecordingBus::new());
    let context = EngineContext::new(CoreSettings::ephemeral(), bus.clone());
    let mut manager = PersistenceManager::open(context)?;

    for n in 1..=3 {
        let thing = Entity::new(EntityType::Thing)
            .with_property("name", format!("myThing_{n}"))
            .with_property("description", format!("Description for myThing_{n}"));
        let id = manager.insert(&thing)?;
        println!("inserting Thing with id \"{id}\"");
    }
    manager.commit()?;

    let things = manager.get_path("/Things", "$count=true&$orderby=@iot.id asc")?;
    println!("count: {:?}", things.total_count);
    for thing in &things.items {
        print_thing(thing);
    }

    let matches = manager.get_path(
        "/Things",
        "$filter=name eq 'myThing_2' and description eq 'Description for myThing_2'",
    )?;
    if let Some(target) = matches.first().and_then(|thing| thing.id.clone()) {
        let patch = Entity::new(EntityType::Thing)
            .with_property("name", "mything2_Updated")
            .with_property("description", "Updated description for myThing_2");
        manager.update(EntityType::Thing, &target, &patch)?;
        manager.commit()?;
        println!("updated {target}");
    }

    let matches = manager.get_path("/Things", "$filter=name eq 'myThing_3'")?;
    if let Some(target) = matches.first().and_then(|thing| thing.id.clone()) {
        manager.delete(EntityType::Thing, &target)?;
        manager.commit()?;
        println!("deleted {target}");
    }

    let things = manager.get_path("/Things", "$count=true")?;
    println!("count: {:?}", things.total_count);
    for thing in &things.items {
        print_thing(thing);
    }

    println!("events published: {}", bus.events().len());
    manager.close()?;
    Ok(())
}

fn print_thing(thing: &Entity) {
    println!(
        "{} , {} , {}",
        thing.id.as_ref().map_or("-", |id| id.as_str()),
        thing.property_str("name").unwrap_or_default(),
        thing.property_str("description").unwrap_or_default()
    );
}
