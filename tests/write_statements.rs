mod common;

use common::*;
use efaps::error::EfapsError;
use efaps::statement::{
    DeleteStatement, Engine, InsertStatement, InstanceSet, StatementResult, StatementState, UpdateStatement,
};
use efaps::value::{Instance, Value};

use chrono::NaiveDate;
use rusqlite::types::Value as SqlValue;

fn count(s: &Seeded, sql: &str) -> i64 {
    let persistor = s.db.persistor().unwrap();
    match persistor.query_sql(sql, Vec::new()).unwrap().rows()[0][0] {
        SqlValue::Integer(n) => n,
        ref other => panic!("expected a count, got {:?}", other),
    }
}

fn later() -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 7, 1).unwrap().and_hms_opt(9, 0, 0).unwrap()
}

#[test]
fn inserts_write_main_and_child_tables() {
    let s = seeded();
    assert_eq!(count(&s, "select count(*) from T_CONTACT"), 3);
    assert_eq!(count(&s, "select count(*) from T_CONTACTEXT"), 1);
    let customer = s.db.type_by_name("Customer").unwrap();
    assert_eq!(s.alice.type_id(), customer.id());
    assert_eq!(
        count(&s, &format!("select TYPEID from T_CONTACT where ID = {}", s.alice.id())),
        customer.id()
    );
}

#[test]
fn an_insert_runs_once() {
    let db = database();
    let mut insert = InsertStatement::new("Company").set("Name", text("Initech"));
    let first = insert.execute(db, &ctx()).unwrap();
    let second = insert.execute(db, &ctx()).unwrap();
    assert_eq!(first, second);
    assert_eq!(insert.state(), StatementState::Materialized);
    assert_eq!(print(db, "print query type Company select attribute[Name] as name").len(), 1);
}

#[test]
fn inserts_reject_abstract_types_and_unknown_attributes() {
    let db = database();
    let engine = Engine::new(db);
    let abstract_type = engine.execute(r#"insert type AbstractContact set Name = "X""#, &ctx());
    assert!(matches!(abstract_type, Err(EfapsError::Execution(_))));
    let attribute = engine.execute(r#"insert type Company set Nope = "X""#, &ctx());
    assert!(matches!(attribute, Err(EfapsError::AttributeNotFound { .. })));
    let unknown = engine.execute(r#"insert type Nothing set Name = "X""#, &ctx());
    assert!(matches!(unknown, Err(EfapsError::TypeNotFound(_))));
}

#[test]
fn updates_refresh_modification_audits_only() {
    let s = seeded();
    let engine = Engine::new(s.db);
    let result = engine
        .execute(
            &format!(r#"update obj {} set Name = "A-1b", Created = "2000-01-01 00:00:00""#, s.orders[0]),
            &ctx().at(later()),
        )
        .unwrap();
    let StatementResult::Batch(outcome) = result else {
        panic!("expected a batch outcome");
    };
    assert!(outcome.is_complete());
    assert_eq!(outcome.succeeded, vec![s.orders[0]]);

    let rows = print(
        s.db,
        &format!(
            "print obj {} select attribute[Name] as name, attribute[Created] as created, attribute[Modified] as modified",
            s.orders[0]
        ),
    );
    assert_eq!(rows[0].get("name"), Some(&text("A-1b")));
    assert_eq!(rows[0].get("created"), Some(&Value::DateTime(clock())));
    assert_eq!(rows[0].get("modified"), Some(&Value::DateTime(later())));
}

#[test]
fn updating_a_missing_child_row_creates_it() {
    let s = seeded();
    Engine::new(s.db)
        .execute(&format!(r#"update obj {} set Email = "bob@example.com""#, s.bob), &ctx())
        .unwrap();
    assert_eq!(count(&s, "select count(*) from T_CONTACTEXT"), 2);
    let rows = print(s.db, &format!("print obj {} select attribute[Email] as email", s.bob));
    assert_eq!(rows[0].get("email"), Some(&text("bob@example.com")));
}

#[test]
fn batches_continue_past_failing_instances() {
    let s = seeded();
    let order = s.db.type_by_name("Order").unwrap();
    let missing = Instance::new(order.id(), 999);
    let mut update = UpdateStatement::new(InstanceSet::Objects(vec![s.orders[0], missing, s.orders[1]]))
        .set("Items", Value::Integer(1));
    let outcome = update.execute(s.db, &ctx()).unwrap();
    assert!(!outcome.is_complete());
    assert_eq!(outcome.succeeded, vec![s.orders[0], s.orders[1]]);
    assert_eq!(outcome.failed.len(), 1);
    assert_eq!(outcome.failed[0].0, missing);
    assert_eq!(update.state(), StatementState::Materialized);
    assert_eq!(names_with_items(&s, 1), 2);
}

fn names_with_items(s: &Seeded, items: i64) -> usize {
    print(
        s.db,
        &format!("print query type Order where attribute[Items] == {} select attribute[Name] as name", items),
    )
    .len()
}

#[test]
fn computed_attributes_fail_per_instance() {
    let s = seeded();
    let result = Engine::new(s.db)
        .execute(&format!("update list ({}, {}) set ItemCount = 5", s.orders[0], s.orders[1]), &ctx())
        .unwrap();
    let StatementResult::Batch(outcome) = result else {
        panic!("expected a batch outcome");
    };
    assert!(outcome.succeeded.is_empty());
    assert_eq!(outcome.failed.len(), 2);
    assert!(outcome
        .failed
        .iter()
        .all(|(_, e)| matches!(e, EfapsError::UnsupportedAttributeOperation(_))));
}

#[test]
fn an_update_needs_assignments() {
    let s = seeded();
    let mut update = UpdateStatement::new(InstanceSet::Objects(vec![s.orders[0]]));
    assert!(update.execute(s.db, &ctx()).is_err());
}

#[test]
fn updates_over_queries() {
    let s = seeded();
    Engine::new(s.db)
        .execute(r#"update query type Order where status == "Open" set Status = "Closed""#, &ctx())
        .unwrap();
    let rows = print(s.db, r#"print query type Order where status == "Closed" select attribute[Name] as name"#);
    assert_eq!(rows.len(), 3);
}

#[test]
fn deletes_remove_child_rows_and_classifications() {
    let s = seeded();
    classify(s.db, s.alice, &["Sector", "Online"]);
    classify(s.db, s.bob, &["Wholesale"]);
    let mut delete = DeleteStatement::new(InstanceSet::Objects(vec![s.alice]));
    let outcome = delete.execute(s.db).unwrap();
    assert_eq!(outcome.succeeded, vec![s.alice]);
    assert_eq!(count(&s, "select count(*) from T_CONTACTEXT"), 0);
    assert_eq!(
        count(&s, &format!("select count(*) from T_CLASSREL where INSTID = {}", s.alice.id())),
        0
    );
    assert_eq!(count(&s, "select count(*) from T_CLASSREL"), 1);
    assert!(print(s.db, &format!("print obj {} select attribute[Name] as name", s.alice)).is_empty());
}

#[test]
fn deletes_over_queries_and_missing_instances() {
    let s = seeded();
    let result = Engine::new(s.db)
        .execute(r#"delete query type Order where status == "Closed""#, &ctx())
        .unwrap();
    let StatementResult::Batch(outcome) = result else {
        panic!("expected a batch outcome");
    };
    assert_eq!(outcome.succeeded, vec![s.orders[1]]);
    assert_eq!(count(&s, "select count(*) from T_ORDER"), 2);

    let again = Engine::new(s.db)
        .execute(&format!("delete obj {}", s.orders[1]), &ctx())
        .unwrap();
    let StatementResult::Batch(outcome) = again else {
        panic!("expected a batch outcome");
    };
    assert_eq!(outcome.failed.len(), 1);
    assert!(matches!(outcome.failed[0].1, EfapsError::Execution(_)));
}
