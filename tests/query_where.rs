mod common;

use common::*;
use efaps::eql::{CompareOp, Filter, Operand};
use efaps::error::EfapsError;
use efaps::select::SelectPath;
use efaps::statement::{Engine, QueryStatement, StatementState};
use efaps::value::Value;

fn names(s: &Seeded, where_clause: &str) -> Vec<Value> {
    let rows = print(
        s.db,
        &format!("print query type Order where {} select attribute[Name] as name", where_clause),
    );
    column(&rows, "name")
}

#[test]
fn comparisons_on_plain_attributes() {
    let s = seeded();
    assert_eq!(names(&s, r#"attribute[Name] == "B-2""#), vec![text("B-2")]);
    assert_eq!(names(&s, r#"attribute[Name] != "B-2""#), vec![text("A-1"), text("A-3")]);
    assert_eq!(names(&s, r#"attribute[Name] like "A%""#), vec![text("A-1"), text("A-3")]);
    assert_eq!(names(&s, "attribute[Items] > 5"), vec![text("B-2"), text("A-3")]);
    assert_eq!(names(&s, "attribute[Items] < 5"), vec![text("A-1")]);
    assert_eq!(names(&s, "attribute[Paid] == true"), vec![text("A-1")]);
}

#[test]
fn null_compares_with_is_null() {
    let s = seeded();
    assert_eq!(names(&s, "attribute[Paid] == null"), vec![text("A-3")]);
    assert_eq!(names(&s, "attribute[Paid] != null"), vec![text("A-1"), text("B-2")]);
    let ordered = Engine::new(s.db).print(
        "print query type Order where attribute[Paid] > null select attribute[Name]",
        &ctx(),
    );
    assert!(ordered.is_err());
}

#[test]
fn and_binds_tighter_than_or() {
    let s = seeded();
    assert_eq!(
        names(&s, r#"attribute[Name] == "B-2" or attribute[Items] > 5 and attribute[Name] like "A%""#),
        vec![text("B-2"), text("A-3")]
    );
    assert_eq!(
        names(&s, r#"(attribute[Name] == "B-2" or attribute[Items] > 5) and attribute[Name] like "A%""#),
        vec![text("A-3")]
    );
}

#[test]
fn value_lists() {
    let s = seeded();
    assert_eq!(names(&s, r#"attribute[Name] in ("A-1", "B-2")"#), vec![text("A-1"), text("B-2")]);
    assert_eq!(names(&s, r#"attribute[Name] not in ("A-1", "B-2")"#), vec![text("A-3")]);
    assert_eq!(names(&s, "attribute[Items] in (7)"), vec![text("A-3")]);
}

#[test]
fn status_links_and_ids() {
    let s = seeded();
    assert_eq!(names(&s, r#"status == "Open""#), vec![text("A-1"), text("A-3")]);
    assert_eq!(names(&s, r#"attribute[Status] != "Open""#), vec![text("B-2")]);
    assert_eq!(names(&s, &format!("id == {}", s.orders[1].id())), vec![text("B-2")]);
    assert_eq!(names(&s, &format!(r#"oid == "{}""#, s.orders[2])), vec![text("A-3")]);
    assert_eq!(names(&s, &format!(r#"attribute[Contact] == "{}""#, s.bob)), vec![text("B-2")]);
}

#[test]
fn criteria_follow_links() {
    let s = seeded();
    assert_eq!(names(&s, r#"linkto[Contact].attribute[Name] == "Alice""#), vec![text("A-1"), text("A-3")]);
    assert_eq!(
        names(&s, r#"linkto[Contact].linkto[Company].attribute[Name] == "Acme""#),
        vec![text("A-1"), text("A-3")]
    );
    assert_eq!(names(&s, r#"linkto[Contact].attribute[Email] like "%@example.com""#), vec![text("A-1"), text("A-3")]);
}

#[test]
fn nested_queries() {
    let s = seeded();
    assert_eq!(
        names(&s, "attribute[Contact] in (query type Customer where attribute[Rating] > 4)"),
        vec![text("A-1"), text("A-3")]
    );
    assert_eq!(
        names(&s, r#"attribute[Contact] not in (query type AbstractContact where attribute[Name] == "Alice" select id)"#),
        vec![text("B-2")]
    );
    // two levels deep
    assert_eq!(
        names(
            &s,
            r#"attribute[Contact] in (query type AbstractContact where attribute[Company] in (query type Company where attribute[Name] == "Acme"))"#
        ),
        vec![text("A-1"), text("A-3")]
    );
}

#[test]
fn the_type_column_filters_shared_tables() {
    let s = seeded();
    let rows = print(
        s.db,
        r#"print query type AbstractContact where type == "Supplier" select attribute[Name] as name"#,
    );
    assert_eq!(column(&rows, "name"), vec![text("Carol")]);
    let rows = print(s.db, "print query type Customer select attribute[Name] as name");
    assert_eq!(column(&rows, "name"), vec![text("Alice"), text("Bob")]);
    let rows = print(s.db, "print query type Supplier, Company select attribute[Name] as name");
    assert_eq!(column(&rows, "name").len(), 2);
}

#[test]
fn unsupported_criteria_are_errors() {
    let s = seeded();
    let engine = Engine::new(s.db);
    let multi = engine.print("print query type Order where attribute[Quantity] == 1 select attribute[Name]", &ctx());
    assert!(matches!(multi, Err(EfapsError::UnsupportedAttributeOperation(_))));
    let computed = engine.print(
        "print query type AbstractContact where attribute[OID] == 1 select attribute[Name]",
        &ctx(),
    );
    assert!(matches!(computed, Err(EfapsError::UnsupportedAttributeOperation(_))));
    let link_from = engine.print(
        r#"print query type AbstractContact where linkfrom[Order#Contact].attribute[Name] == "A-1" select attribute[Name]"#,
        &ctx(),
    );
    assert!(link_from.is_err());
    let unknown = engine.print("print query type Nothing select attribute[Name]", &ctx());
    assert!(matches!(unknown, Err(EfapsError::TypeNotFound(_))));
}

#[test]
fn queries_built_in_code_materialize_once() {
    let s = seeded();
    let mut query = QueryStatement::new(["Order"]).and_where(Filter::Compare {
        path: SelectPath::parse("attribute[Items]").unwrap(),
        op: CompareOp::Greater,
        operand: Operand::Value(Value::Integer(5)),
    });
    let cache = s.db.cache().unwrap();
    let found = {
        let persistor = s.db.persistor().unwrap();
        query.execute(&persistor, cache).unwrap().to_vec()
    };
    assert_eq!(found, vec![s.orders[1], s.orders[2]]);
    assert_eq!(query.state(), StatementState::Materialized);

    let mut narrowed = QueryStatement::new(["Order"])
        .and_where(Filter::Compare {
            path: SelectPath::parse("attribute[Items]").unwrap(),
            op: CompareOp::Greater,
            operand: Operand::Value(Value::Integer(5)),
        })
        .and_where(Filter::Compare {
            path: SelectPath::parse("status").unwrap(),
            op: CompareOp::Equal,
            operand: Operand::Value(text("Open")),
        });
    let persistor = s.db.persistor().unwrap();
    assert_eq!(narrowed.execute(&persistor, cache).unwrap(), &[s.orders[2]]);
}
