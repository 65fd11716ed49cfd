#![allow(dead_code)]
use efaps::construct::{Database, PersistenceMode};
use efaps::context::ExecutionContext;
use efaps::model::ModelDefinition;
use efaps::statement::{DataRow, Engine, StatementResult};
use efaps::value::{Instance, Value};

use chrono::NaiveDate;

pub const MODEL: &str = r#"{
    "sql_tables": [
        { "name": "T_PERSON", "sql_name": "T_PERSON" },
        { "name": "T_COMPANY", "sql_name": "T_COMPANY" },
        { "name": "T_CONTACT", "sql_name": "T_CONTACT", "type_column": "TYPEID" },
        { "name": "T_CONTACTEXT", "sql_name": "T_CONTACTEXT", "parent": "T_CONTACT" },
        { "name": "T_ORDER", "sql_name": "T_ORDER" }
    ],
    "types": [
        { "name": "Person", "table": "T_PERSON",
          "attributes": [
            { "name": "Name", "type": "String", "columns": ["NAME"] },
            { "name": "Secret", "type": "Password", "columns": ["SECRET"] }
          ] },
        { "name": "Company", "label": "Company", "table": "T_COMPANY",
          "attributes": [
            { "name": "Name", "type": "String", "columns": ["NAME"] },
            { "name": "Founded", "type": "Date", "columns": ["FOUNDED"] }
          ] },
        { "name": "AbstractContact", "abstract": true, "table": "T_CONTACT",
          "attributes": [
            { "name": "Name", "type": "String", "columns": ["NAME"] },
            { "name": "Email", "type": "String", "table": "T_CONTACTEXT", "columns": ["EMAIL"] },
            { "name": "Company", "type": "Link", "link": "Company", "columns": ["COMPANY"] },
            { "name": "OID", "type": "Oid", "columns": ["TYPEID", "ID"] }
          ] },
        { "name": "Customer", "label": "Customer", "parent": "AbstractContact",
          "attributes": [ { "name": "Rating", "type": "Integer", "columns": ["RATING"] } ],
          "classified_by": ["Sector"] },
        { "name": "Supplier", "label": "Supplier", "parent": "AbstractContact" },
        { "name": "OrderStatus" },
        { "name": "Order", "table": "T_ORDER",
          "attributes": [
            { "name": "Name", "type": "String", "columns": ["NAME"] },
            { "name": "Contact", "type": "Link", "link": "AbstractContact", "columns": ["CONTACT"] },
            { "name": "Quantity", "type": "Uom", "dimension": "Weight", "columns": ["QTY", "QTYUOM"] },
            { "name": "Discount", "type": "Rate", "columns": ["DISCNUM", "DISCDEN"] },
            { "name": "Amount", "type": "Decimal", "columns": ["AMOUNT"] },
            { "name": "Paid", "type": "Boolean", "columns": ["PAID"] },
            { "name": "Due", "type": "Date", "columns": ["DUE"] },
            { "name": "Items", "type": "Long", "columns": ["ITEMS"] },
            { "name": "ItemCount", "type": "FileLength", "columns": ["ITEMS"] },
            { "name": "Tags", "type": "MultiValue", "columns": ["TAGS"] },
            { "name": "Status", "type": "StatusLink", "status_group": "OrderStatus", "columns": ["STATUS"] },
            { "name": "Creator", "type": "CreatorLink", "link": "Person", "columns": ["CREATOR"] },
            { "name": "Created", "type": "Created", "columns": ["CREATED"] },
            { "name": "Modifier", "type": "ModifierLink", "link": "Person", "columns": ["MODIFIER"] },
            { "name": "Modified", "type": "Modified", "columns": ["MODIFIED"] }
          ] }
    ],
    "statuses": [
        { "group": "OrderStatus", "key": "Open", "label": "Open order" },
        { "group": "OrderStatus", "key": "Closed", "label": "Closed order" }
    ],
    "classifications": [
        { "name": "Sector", "relation": { "sql_name": "T_CLASSREL", "instance_column": "INSTID", "classification_column": "CLASSID" } },
        { "name": "Retail", "label": "Retail trade", "parent": "Sector" },
        { "name": "Online", "label": "Online shop", "parent": "Retail" },
        { "name": "Wholesale", "parent": "Sector" }
    ],
    "dimensions": [
        { "name": "Weight", "base_uom": "kg",
          "uoms": [
            { "name": "kg" },
            { "name": "g", "denominator": "1000" }
          ] },
        { "name": "Length", "base_uom": "m", "uoms": [ { "name": "m" } ] }
    ]
}"#;

/// A database with the demo model installed, leaked for the test's lifetime.
pub fn database() -> &'static Database {
    let db = Database::new(PersistenceMode::InMemory).unwrap();
    db.install(&ModelDefinition::from_json(MODEL).unwrap()).unwrap();
    Box::leak(Box::new(db))
}

pub fn clock() -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 5, 1).unwrap().and_hms_opt(10, 30, 0).unwrap()
}

pub fn ctx() -> ExecutionContext {
    ExecutionContext::new(1).at(clock())
}

pub fn insert(db: &Database, statement: &str) -> Instance {
    match Engine::new(db).execute(statement, &ctx()).unwrap() {
        StatementResult::Inserted(instance) => instance,
        other => panic!("expected an insert, got {:?}", other),
    }
}

pub fn print(db: &Database, statement: &str) -> Vec<DataRow> {
    Engine::new(db).print(statement, &ctx()).unwrap()
}

pub fn text(s: &str) -> Value {
    Value::Text(s.to_string())
}

/// Alias values of every row, in row order.
pub fn column(rows: &[DataRow], alias: &str) -> Vec<Value> {
    rows.iter().map(|r| r.get(alias).cloned().unwrap_or(Value::Null)).collect()
}

/// Assigns classifications to an instance through the relation table.
pub fn classify(db: &Database, instance: Instance, classifications: &[&str]) {
    let cache = db.cache().unwrap();
    let persistor = db.persistor().unwrap();
    for name in classifications {
        let class = cache.classifications().get_by_name(name).unwrap();
        persistor
            .execute(
                "insert into T_CLASSREL (INSTID, CLASSID) values (?, ?)",
                vec![
                    rusqlite::types::Value::Integer(instance.id()),
                    rusqlite::types::Value::Integer(class.id()),
                ],
            )
            .unwrap();
    }
}

/// Three contacts, one company and three orders.
pub struct Seeded {
    pub db: &'static Database,
    pub acme: Instance,
    pub alice: Instance,
    pub bob: Instance,
    pub carol: Instance,
    pub orders: Vec<Instance>,
}

pub fn seeded() -> Seeded {
    let db = database();
    insert(db, r#"insert type Person set Name = "Admin", Secret = "s3cret""#);
    let acme = insert(db, r#"insert type Company set Name = "Acme", Founded = "1999-04-01""#);
    let alice = insert(
        db,
        &format!(r#"insert type Customer set Name = "Alice", Email = "alice@example.com", Rating = 5, Company = "{}""#, acme),
    );
    let bob = insert(db, r#"insert type Customer set Name = "Bob", Rating = 3"#);
    let carol = insert(db, &format!(r#"insert type Supplier set Name = "Carol", Company = "{}""#, acme));
    let orders = vec![
        insert(
            db,
            &format!(
                r#"insert type Order set Name = "A-1", Contact = "{}", Quantity = "12.5 kg", Discount = 0.25, Amount = 100.50, Paid = true, Due = "2024-06-01", Items = 3, Tags = "urgent", Status = "Open""#,
                alice
            ),
        ),
        insert(
            db,
            &format!(
                r#"insert type Order set Name = "B-2", Contact = "{}", Quantity = "500 g", Amount = 20, Paid = false, Items = 12, Status = "Closed""#,
                bob
            ),
        ),
        insert(
            db,
            &format!(r#"insert type Order set Name = "A-3", Contact = "{}", Items = 7, Status = "Open""#, alice),
        ),
    ];
    Seeded {
        db,
        acme,
        alice,
        bob,
        carol,
        orders,
    }
}
