use calcql_runtime::{Engine, FetcherMap, TaskGraph};
use calcql_semantic::hir::{DirectiveBinding, Field, Operation, TypeRef};
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::{json, Map};

fn operation(width: usize) -> Operation {
    let mut operation = Operation::new().field(
        Field::new("ids", "Query")
            .returns(TypeRef::list("Int"))
            .directive(DirectiveBinding::new("publishSource").arg("name", "ids")),
    );
    for i in 0..width {
        operation = operation.field(
            Field::new("items", "Query")
                .alias(format!("items{i}"))
                .returns(TypeRef::list("Item"))
                .list_argument("ids", json!(null))
                .directive(
                    DirectiveBinding::new("consumeSource")
                        .arg("argument", "ids")
                        .arg("name", "ids")
                        .arg("operation", "LIST_MAP")
                        .arg("expression", "ele * 2"),
                )
                .directive(DirectiveBinding::new("sortBy").arg("key", "id").arg("reversed", true))
                .field(Field::new("id", "Item")),
        );
    }
    operation
}

fn fetchers() -> FetcherMap {
    let mut fetchers = FetcherMap::new();
    fetchers.register_fn("Query", "ids", |_| Ok(json!((0..50).collect::<Vec<_>>())));
    fetchers.register_fn("Query", "items", |request| {
        let ids: Vec<i64> = request.arguments.require("ids")?;
        Ok(ids.iter().map(|id| json!({"id": id})).collect())
    });
    fetchers
}

fn bench_build(c: &mut Criterion) {
    let operation = operation(32);
    c.bench_function("build_graph_32", |b| b.iter(|| TaskGraph::build(&operation)));
}

fn bench_execute(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let engine = Engine::new(fetchers());
    let operation = operation(8);
    let variables = Map::new();

    c.bench_function("execute_8_consumers", |b| {
        b.iter(|| runtime.block_on(engine.execute(&operation, &variables)).unwrap());
    });
}

criterion_group!(benches, bench_build, bench_execute);
criterion_main!(benches);
