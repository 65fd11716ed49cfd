mod common;

use common::*;
use efaps::select::{DecodeContext, SelectChain, SelectNode, SelectPath};
use efaps::sql::SqlSelect;
use efaps::value::{Locale, Value};

use rusqlite::types::Value as SqlValue;

fn projected(path: &str) -> (SelectChain, SqlSelect, usize) {
    let db = database();
    let cache = db.cache().unwrap();
    let order = db.type_by_name("Order").unwrap();
    let path = SelectPath::parse(path).unwrap();
    let mut select = SqlSelect::new("T", "T_ORDER");
    select.column(0, "ID");
    let mut chain = SelectChain::new(path.nodes());
    let added = chain.append_projection(&mut select, 0, &order, cache).unwrap();
    (chain, select, added)
}

#[test]
fn projection_reports_every_column_it_adds() {
    for path in [
        "attribute[Name]",
        "attribute[Quantity].base",
        "attribute[Contact].type.name",
        "status.key",
        "oid",
        "type.label",
    ] {
        let (chain, select, added) = projected(path);
        let recorded: usize = chain.nodes().iter().map(|n| n.col_indexes().len()).sum();
        assert_eq!(added, recorded, "{}", path);
        assert_eq!(select.column_count(), added + 1, "{}", path);
    }
}

#[test]
fn column_indexes_follow_the_projection_order() {
    let (chain, _, added) = projected("attribute[Quantity].value");
    assert_eq!(added, 2);
    assert_eq!(chain.nodes()[0].col_indexes(), &[2, 3]);
    assert!(chain.nodes()[1].col_indexes().is_empty());
}

#[test]
fn link_type_joins_the_target_table() {
    let (chain, select, _) = projected("attribute[Contact].type");
    assert_eq!(chain.nodes()[1].col_indexes(), &[3]);
    let (sql, _) = select.to_sql();
    assert!(sql.contains("LEFT JOIN T_CONTACT"), "{}", sql);
}

#[test]
fn chains_decode_a_row_head_first() {
    let db = database();
    let cache = db.cache().unwrap();
    let g = cache.uoms().get_by_name("g").unwrap();
    let (chain, _, _) = projected("attribute[Quantity].base");
    let locale = Locale::default();
    let dc = DecodeContext {
        cache,
        locale: &locale,
        concrete_type: None,
    };
    let row = vec![SqlValue::Integer(1), SqlValue::Text("250".into()), SqlValue::Integer(g.id())];
    assert_eq!(chain.decode(&row, &dc).unwrap(), Value::decimal("0.25").unwrap());

    // a missing magnitude and unit is no value at all
    let empty = vec![SqlValue::Integer(1), SqlValue::Null, SqlValue::Null];
    assert_eq!(chain.decode(&empty, &dc).unwrap(), Value::Null);
}

#[test]
fn nodes_after_the_head_cannot_read_columns() {
    assert!(SelectPath::parse("attribute[Name].status").is_err());
    assert!(SelectPath::parse("format[%Y]").is_err());
    assert!(SelectPath::parse("attribute[Name].linkfrom[Order#Contact].name").is_err());
    let path = SelectPath::parse("linkto[Contact].attribute[Name].length").unwrap();
    assert_eq!(path.nodes(), &[SelectNode::Attribute("Name".into()), SelectNode::Length]);
}

#[test]
fn linked_values_print_through_joins() {
    let s = seeded();
    let rows = print(
        s.db,
        "print query type Order select linkto[Contact].attribute[Name] as contact, \
         linkto[Contact].linkto[Company].attribute[Name] as company, \
         linkto[Contact].attribute[Email] as email, \
         linkto[Contact].type.name as kind",
    );
    assert_eq!(column(&rows, "contact"), vec![text("Alice"), text("Bob"), text("Alice")]);
    assert_eq!(column(&rows, "company"), vec![text("Acme"), Value::Null, text("Acme")]);
    assert_eq!(
        column(&rows, "email"),
        vec![text("alice@example.com"), Value::Null, text("alice@example.com")]
    );
    assert_eq!(column(&rows, "kind"), vec![text("Customer"), text("Customer"), text("Customer")]);
}

#[test]
fn metadata_nodes_describe_their_predecessor() {
    let s = seeded();
    let rows = print(
        s.db,
        &format!(
            "print obj {} select status.key as key, status.label as label, attribute[Status].type.name as grp, \
             type.label as type_label, attribute[Contact].type.name as contact_type, id as id, oid as oid",
            s.orders[1]
        ),
    );
    let row = &rows[0];
    assert_eq!(row.get("key"), Some(&text("Closed")));
    assert_eq!(row.get("label"), Some(&text("Closed order")));
    assert_eq!(row.get("grp"), Some(&text("OrderStatus")));
    assert_eq!(row.get("type_label"), Some(&text("Order")));
    assert_eq!(row.get("contact_type"), Some(&text("Customer")));
    assert_eq!(row.get("id"), Some(&Value::Integer(s.orders[1].id())));
    assert_eq!(row.get("oid"), Some(&text(&s.orders[1].oid())));
}

#[test]
fn format_applies_date_and_number_patterns() {
    let s = seeded();
    let rows = print(
        s.db,
        &format!(
            "print obj {} select attribute[Due].format[%d.%m.%Y] as due, attribute[Amount].format[#,##0.00] as amount, \
             attribute[Name].length as len, attribute[Tags].length as tag_len",
            s.orders[0]
        ),
    );
    let row = &rows[0];
    assert_eq!(row.get("due"), Some(&text("01.06.2024")));
    assert_eq!(row.get("amount"), Some(&text("100.50")));
    assert_eq!(row.get("len"), Some(&Value::Integer(3)));
    assert_eq!(row.get("tag_len"), Some(&Value::List(vec![Value::Integer(6)])));
}

#[test]
fn nodes_that_do_not_apply_fail() {
    let s = seeded();
    let result = efaps::statement::Engine::new(s.db).print(
        &format!("print obj {} select attribute[Paid].uom as unit", s.orders[0]),
        &ctx(),
    );
    assert!(result.is_err());
}
