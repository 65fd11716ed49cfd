mod common;

use std::sync::Arc;

use common::*;
use efaps::context::ExecutionContext;
use efaps::error::{EfapsError, Result};
use efaps::select::SelectPath;
use efaps::statement::{Engine, PrintStatement, QueryStatement, StatementState};
use efaps::value::{Instance, Value};

#[test]
fn explicit_targets_keep_the_requested_order() {
    let s = seeded();
    let rows = print(
        s.db,
        &format!(
            "print list ({}, {}, {}) select attribute[Name] as name",
            s.orders[2], s.orders[0], s.orders[2]
        ),
    );
    assert_eq!(column(&rows, "name"), vec![text("A-3"), text("A-1")]);
    assert_eq!(rows[0].instance(), s.orders[2]);
}

#[test]
fn missing_instances_print_no_row() {
    let s = seeded();
    let order = s.db.type_by_name("Order").unwrap();
    let missing = Instance::new(order.id(), 999);
    let rows = print(s.db, &format!("print list ({}, {}) select attribute[Name] as name", missing, s.orders[1]));
    assert_eq!(column(&rows, "name"), vec![text("B-2")]);
}

#[test]
fn order_by_sorts_on_aliases() {
    let s = seeded();
    let rows = print(s.db, "print query type Order select attribute[Name] as name order by name desc");
    assert_eq!(column(&rows, "name"), vec![text("A-3"), text("B-2"), text("A-1")]);

    let rows = print(
        s.db,
        "print query type Order select attribute[Name] as name, status.key as st order by st asc, name desc",
    );
    assert_eq!(column(&rows, "name"), vec![text("B-2"), text("A-3"), text("A-1")]);

    let rows = print(s.db, "print query type Order select attribute[Items] as items order by items");
    assert_eq!(column(&rows, "items"), vec![Value::Integer(3), Value::Integer(7), Value::Integer(12)]);
}

#[test]
fn bad_aliases_are_rejected_before_running() {
    let s = seeded();
    let engine = Engine::new(s.db);
    let unknown = engine.print("print query type Order select attribute[Name] as name order by other", &ctx());
    assert!(matches!(unknown, Err(EfapsError::Execution(_))));
    let twice = engine.print("print query type Order select attribute[Name] as n, attribute[Items] as n", &ctx());
    assert!(matches!(twice, Err(EfapsError::Execution(_))));
    let attribute = engine.print("print query type Order select attribute[Nope]", &ctx());
    assert!(matches!(attribute, Err(EfapsError::AttributeNotFound { .. })));
}

#[test]
fn types_sharing_a_table_print_together() {
    let s = seeded();
    let rows = print(
        s.db,
        "print query type AbstractContact select attribute[Name] as name, type.name as kind, attribute[Email] as email",
    );
    assert_eq!(column(&rows, "name"), vec![text("Alice"), text("Bob"), text("Carol")]);
    assert_eq!(column(&rows, "kind"), vec![text("Customer"), text("Customer"), text("Supplier")]);
    assert_eq!(column(&rows, "email"), vec![text("alice@example.com"), Value::Null, Value::Null]);
    assert_eq!(rows[2].instance(), s.carol);
}

#[test]
fn mixed_tables_print_in_one_statement() {
    let s = seeded();
    let rows = print(
        s.db,
        &format!("print list ({}, {}, {}) select type.name as kind, oid as oid", s.orders[0], s.bob, s.acme),
    );
    assert_eq!(column(&rows, "kind"), vec![text("Order"), text("Customer"), text("Company")]);
    assert_eq!(column(&rows, "oid"), vec![text(&s.orders[0].oid()), text(&s.bob.oid()), text(&s.acme.oid())]);
}

#[test]
fn link_from_collects_the_pointing_instances() {
    let s = seeded();
    let rows = print(
        s.db,
        &format!(
            "print list ({}, {}, {}) select attribute[Name] as name, linkfrom[Order#Contact].attribute[Name] as orders",
            s.alice, s.bob, s.carol
        ),
    );
    assert_eq!(
        column(&rows, "orders"),
        vec![Value::List(vec![text("A-1"), text("A-3")]), text("B-2"), Value::Null]
    );

    let rows = print(s.db, &format!("print obj {} select linkfrom[AbstractContact#Company].name as kinds", s.acme));
    assert_eq!(rows[0].get("kinds"), Some(&Value::List(vec![text("Customer"), text("Supplier")])));
}

#[test]
fn exec_runs_a_registered_program_per_instance() {
    let s = seeded();
    let tenfold = |instance: &Instance, _ctx: &ExecutionContext| -> Result<Value> { Ok(Value::Integer(instance.id() * 10)) };
    s.db.register_program("demo.tenfold", Arc::new(tenfold)).unwrap();
    let rows = print(s.db, "print query type Order select exec demo.tenfold as ten");
    assert_eq!(
        column(&rows, "ten"),
        s.orders.iter().map(|o| Value::Integer(o.id() * 10)).collect::<Vec<_>>()
    );

    let unknown = Engine::new(s.db).print("print query type Order select exec demo.missing", &ctx());
    assert!(unknown.is_err());
}

#[test]
fn a_materialized_print_does_not_run_again() {
    let s = seeded();
    let mut statement = PrintStatement::query(QueryStatement::new(["Order"]))
        .select(SelectPath::parse("attribute[Name]").unwrap(), "name")
        .order_by("name", false);
    assert_eq!(statement.state(), StatementState::Built);
    let first = statement.execute(s.db, &ctx()).unwrap().to_vec();
    assert_eq!(statement.state(), StatementState::Materialized);

    Engine::new(s.db)
        .execute(&format!("delete obj {}", s.orders[0]), &ctx())
        .unwrap();
    let second = statement.execute(s.db, &ctx()).unwrap().to_vec();
    assert_eq!(first, second);
    assert_eq!(first.len(), 3);

    let fresh = print(s.db, "print query type Order select attribute[Name] as name");
    assert_eq!(fresh.len(), 2);
}

#[test]
fn a_print_needs_a_selection() {
    let s = seeded();
    let mut statement = PrintStatement::objects(vec![s.alice]);
    assert!(statement.execute(s.db, &ctx()).is_err());
}

#[test]
fn rows_serialize_with_oid_and_aliases() {
    let s = seeded();
    let rows = print(
        s.db,
        &format!("print obj {} select attribute[Name] as name, attribute[Items] as items", s.orders[0]),
    );
    let json = serde_json::to_value(&rows[0]).unwrap();
    assert_eq!(json["oid"], serde_json::json!(s.orders[0].oid()));
    assert_eq!(json["values"]["name"], serde_json::json!("A-1"));
    assert_eq!(json["values"]["items"], serde_json::json!(3));
}
