use efaps::eql::{self, CompareOp, EqlStatement, Filter, Operand, QueryDef, Target};
use efaps::error::EfapsError;
use efaps::select::{SelectNode, SelectPart};
use efaps::value::{Instance, Value};

fn query(text: &str) -> QueryDef {
    match eql::parse(text).unwrap() {
        EqlStatement::Print(print) => match print.target {
            Target::Query(query) => query,
            other => panic!("expected a query target, got {:?}", other),
        },
        other => panic!("expected print, got {:?}", other),
    }
}

#[test]
fn prints_keep_selections_and_order_keys() {
    let EqlStatement::Print(print) = eql::parse(
        "print list (1.2, 1.3) select attribute[Name] as name, status.key, attribute[Items] as items order by name desc, items",
    )
    .unwrap() else {
        panic!("expected print")
    };
    assert_eq!(print.target, Target::Objects(vec![Instance::new(1, 2), Instance::new(1, 3)]));
    assert_eq!(print.selections.len(), 3);
    assert_eq!(print.selections[1].alias, "status.key");
    assert_eq!(print.selections[1].path.nodes(), &[SelectNode::Status, SelectNode::Key]);
    assert_eq!(print.order.len(), 2);
    assert!(print.order[0].descending);
    assert!(!print.order[1].descending);
}

#[test]
fn queries_name_several_types() {
    let q = query("print query type Customer, Supplier select attribute[Name]");
    assert_eq!(q.types, vec!["Customer", "Supplier"]);
    assert!(q.filter.is_none());
}

#[test]
fn and_groups_inside_or() {
    let q = query(r#"print query type Order where attribute[A] == 1 or attribute[B] == 2 and attribute[C] == 3 select id"#);
    let Some(Filter::Or(alternatives)) = q.filter else {
        panic!("expected an or")
    };
    assert_eq!(alternatives.len(), 2);
    assert!(matches!(alternatives[0], Filter::Compare { .. }));
    let Filter::And(terms) = &alternatives[1] else {
        panic!("expected an and")
    };
    assert_eq!(terms.len(), 2);
}

#[test]
fn comparison_operands() {
    let q = query(r#"print query type Order where attribute[Amount] > 12.3 and attribute[Name] like "A%" select id"#);
    let Some(Filter::And(terms)) = q.filter else {
        panic!("expected an and")
    };
    let Filter::Compare { op, operand, .. } = &terms[0] else {
        panic!("expected a comparison")
    };
    assert_eq!(*op, CompareOp::Greater);
    assert_eq!(*operand, Operand::Value(Value::decimal("12.3").unwrap()));
    let Filter::Compare { op, operand, .. } = &terms[1] else {
        panic!("expected a comparison")
    };
    assert_eq!(*op, CompareOp::Like);
    assert_eq!(*operand, Operand::Value(Value::Text("A%".to_string())));

    let q = query("print query type Order where attribute[Items] not in (1, 2, null) select id");
    let Some(Filter::Compare { op, operand, .. }) = q.filter else {
        panic!("expected a comparison")
    };
    assert_eq!(op, CompareOp::NotIn);
    assert_eq!(
        operand,
        Operand::Values(vec![Value::Integer(1), Value::Integer(2), Value::Null])
    );
}

#[test]
fn subqueries_carry_their_own_selection() {
    let q = query(
        r#"print query type Order where attribute[Contact] in (query type Customer where attribute[Rating] > 4 select id) select id"#,
    );
    let Some(Filter::Compare { op, operand, path }) = q.filter else {
        panic!("expected a comparison")
    };
    assert_eq!(op, CompareOp::In);
    assert_eq!(path.nodes(), &[SelectNode::Attribute("Contact".to_string())]);
    let Operand::Query { query, select } = operand else {
        panic!("expected a subquery")
    };
    assert_eq!(query.types, vec!["Customer"]);
    assert!(query.filter.is_some());
    assert_eq!(select.map(|p| p.nodes().to_vec()), Some(vec![SelectNode::Id]));
}

#[test]
fn writes_and_their_targets() {
    let EqlStatement::Insert(insert) = eql::parse(r#"insert type Order set Name = "X", Items = 4, Paid = false"#).unwrap()
    else {
        panic!("expected insert")
    };
    assert_eq!(insert.type_name, "Order");
    assert_eq!(
        insert.assignments,
        vec![
            ("Name".to_string(), Value::Text("X".to_string())),
            ("Items".to_string(), Value::Integer(4)),
            ("Paid".to_string(), Value::Boolean(false)),
        ]
    );

    let EqlStatement::Update(update) = eql::parse(r#"update query type Order where status == "Open" set Paid = true"#).unwrap()
    else {
        panic!("expected update")
    };
    assert!(matches!(update.target, Target::Query(_)));
    assert_eq!(update.assignments.len(), 1);

    let EqlStatement::Delete(delete) = eql::parse("delete obj 4.5;").unwrap() else {
        panic!("expected delete")
    };
    assert_eq!(delete.target, Target::Objects(vec![Instance::new(4, 5)]));

    assert!(eql::parse("update obj 4.5").is_err());
}

#[test]
fn paths_print_as_they_were_written() {
    for text in [
        "linkto[Contact].linkto[Company].attribute[Name]",
        "linkfrom[Order#Contact].attribute[Name].length",
        "attribute[Due].format[%d.%m.%Y]",
        "attribute[Quantity].uom",
        "linkto[Contact].type.label",
        "exec demo.tenfold",
    ] {
        let path = eql::parse_path(text).unwrap();
        assert_eq!(path.to_string(), text);
    }
    let path = eql::parse_path("linkfrom[Order#Contact].attribute[Name]").unwrap();
    assert_eq!(
        path.parts(),
        &[SelectPart::LinkFrom {
            type_name: "Order".to_string(),
            attribute: "Contact".to_string()
        }]
    );
    assert_eq!(path.link_from(), Some(("Order", "Contact")));
}

#[test]
fn malformed_input_is_a_parse_error() {
    for text in ["", "print", "print obj 1 select id", "select id", "print obj 1.1 select attribute[]"] {
        assert!(
            matches!(eql::parse(text), Err(EfapsError::Parse { .. })),
            "{:?}",
            text
        );
    }
    assert!(eql::parse_path("linkto[Contact]").is_err());
    assert!(eql::parse_path("name.attribute[Name]").is_err());
}
