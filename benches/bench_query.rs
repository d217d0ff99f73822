use std::time::Duration;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use sensorgraph::{
    CoreSettings, EngineContext, EntityType, Identifier, PersistenceManager,
    bench_utils::{DatasetShape, generate_dataset, load_dataset},
};

const DATASET_SEED: u64 = 0x9B1E;
const SAMPLE_SIZE: usize = 20;
const WARM_UP: Duration = Duration::from_millis(300);
const MEASURE: Duration = Duration::from_millis(500);

fn bench_shape() -> DatasetShape {
    #[cfg(feature = "bench-ci")]
    {
        DatasetShape {
            things: 20,
            datastreams_per_thing: 2,
            observations_per_datastream: 25,
        }
    }
    #[cfg(not(feature = "bench-ci"))]
    {
        DatasetShape {
            things: 100,
            datastreams_per_thing: 3,
            observations_per_datastream: 50,
        }
    }
}

fn loaded_manager() -> PersistenceManager {
    let context = EngineContext::without_bus(CoreSettings::ephemeral());
    let mut manager = PersistenceManager::open(context).expect("manager");
    let dataset = generate_dataset(bench_shape(), DATASET_SEED);
    load_dataset(&mut manager, &dataset).expect("load");
    manager
}

const QUERIES: &[(&str, &str, &str)] = &[
    ("first_page", "/Observations", "$top=10"),
    ("filtered_stream", "/Observations", "$filter=result gt 30&$top=10"),
    ("count_ordered", "/Observations", "$count=true&$orderby=result desc&$top=10"),
    ("nested_path", "/Things('thing-00003')/Datastreams", "$expand=Observations"),
    (
        "json_filter",
        "/Datastreams",
        "$filter=unitOfMeasurement/symbol eq 'degC' and name ne 'x'",
    ),
];

fn bench_queries(c: &mut Criterion) {
    let manager = loaded_manager();
    let mut group = c.benchmark_group("query");
    group.sample_size(SAMPLE_SIZE);
    group.warm_up_time(WARM_UP);
    group.measurement_time(MEASURE);
    for &(name, path, query) in QUERIES {
        group.bench_function(BenchmarkId::from_parameter(name), |b| {
            b.iter(|| manager.get_path(path, query).expect("query"));
        });
    }
    group.finish();
}

fn bench_get_by_id(c: &mut Criterion) {
    let manager = loaded_manager();
    let id: Identifier = "thing-00003-ds-001".into();
    c.bench_function("get_datastream", |b| {
        b.iter(|| {
            manager
                .get(EntityType::Datastream, &id)
                .expect("get")
        });
    });
}

criterion_group!(
    name = query_benches;
    config = Criterion::default();
    targets = bench_queries, bench_get_by_id
);
criterion_main!(query_benches);
