use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use efaps::construct::{Database, PersistenceMode};
use efaps::context::ExecutionContext;
use efaps::eql;
use efaps::model::ModelDefinition;
use efaps::select::{SelectChain, SelectPath};
use efaps::sql::SqlSelect;
use efaps::statement::Engine;

const MODEL: &str = r#"{
    "sql_tables": [
        { "name": "T_CONTACT", "sql_name": "T_CONTACT" },
        { "name": "T_ORDER", "sql_name": "T_ORDER" }
    ],
    "types": [
        { "name": "Contact", "table": "T_CONTACT",
          "attributes": [ { "name": "Name", "type": "String", "columns": ["NAME"] } ] },
        { "name": "Order", "table": "T_ORDER",
          "attributes": [
            { "name": "Name", "type": "String", "columns": ["NAME"] },
            { "name": "Items", "type": "Long", "columns": ["ITEMS"] },
            { "name": "Contact", "type": "Link", "link": "Contact", "columns": ["CONTACT"] }
          ] }
    ]
}"#;

fn seeded(orders: usize) -> Database {
    let db = Database::new(PersistenceMode::InMemory).unwrap();
    db.install(&ModelDefinition::from_json(MODEL).unwrap()).unwrap();
    let ctx = ExecutionContext::new(1);
    let engine = Engine::new(&db);
    let contact = match engine.execute(r#"insert type Contact set Name = "Acme""#, &ctx).unwrap() {
        efaps::statement::StatementResult::Inserted(instance) => instance,
        other => panic!("unexpected result {:?}", other),
    };
    for n in 0..orders {
        engine
            .execute(
                &format!(r#"insert type Order set Name = "O-{}", Items = {}, Contact = "{}""#, n, n % 17, contact),
                &ctx,
            )
            .unwrap();
    }
    db
}

fn parse_benchmark(c: &mut Criterion) {
    c.bench_function("parse print statement", |b| {
        b.iter(|| {
            eql::parse(black_box(
                r#"print query type Order where attribute[Items] > 5 and linkto[Contact].attribute[Name] like "A%" select attribute[Name] as name, linkto[Contact].attribute[Name] as contact order by name"#,
            ))
            .unwrap()
        })
    });
}

fn projection_benchmark(c: &mut Criterion) {
    let db = seeded(0);
    let cache = db.cache().unwrap();
    let order = db.type_by_name("Order").unwrap();
    let path = SelectPath::parse("linkto[Contact].attribute[Name]").unwrap();
    c.bench_function("project linked attribute", |b| {
        b.iter(|| {
            let mut select = SqlSelect::new("T", "T_ORDER");
            select.column(0, "ID");
            let mut chain = SelectChain::new(path.nodes());
            chain.append_projection(&mut select, 0, &order, cache).unwrap();
            black_box(select.to_sql())
        })
    });
}

fn print_benchmark(c: &mut Criterion) {
    let db = seeded(1000);
    let ctx = ExecutionContext::new(1);
    let engine = Engine::new(&db);
    c.bench_function("print 1000 orders with a link", |b| {
        b.iter(|| {
            engine
                .print(
                    black_box("print query type Order select attribute[Name] as name, linkto[Contact].attribute[Name] as contact"),
                    &ctx,
                )
                .unwrap()
        })
    });
    c.bench_function("print filtered orders", |b| {
        b.iter(|| {
            engine
                .print(
                    black_box("print query type Order where attribute[Items] == 3 select attribute[Name] as name order by name desc"),
                    &ctx,
                )
                .unwrap()
        })
    });
}

criterion_group!(benches, parse_benchmark, projection_benchmark, print_benchmark);
criterion_main!(benches);
