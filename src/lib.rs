//! eFaps core – typed attributes, value selects and EQL statements over SQLite.
//!
//! The crate centers on *instances* of metadata-defined *types*:
//! * A [`construct::Type`] names a business object kept in a main [`construct::SqlTable`],
//!   optionally spread over child tables, and inherits the attributes of its parent type.
//! * An [`construct::Attribute`] binds one [`datatype::AttributeType`] to one or two columns.
//! * An [`value::Instance`] is a `(type id, id)` pair written as the OID `"type.id"`.
//! * [`construct::Status`], [`construct::Classification`] and [`construct::Uom`] are metadata
//!   values an attribute or select can resolve to.
//!
//! Metadata objects are loaded into a [`cache::MetadataCache`] owned by the
//! [`construct::Database`]. Each cache swaps complete generations so readers
//! never observe a partially loaded state.
//!
//! ## Modules
//! * [`construct`] – Metadata constructs and the `Database` wiring them together.
//! * [`datatype`] – The attribute type registry: decode, encode, format and compare per variant.
//! * [`value`] – Business values, instances and locales.
//! * [`cache`] – Snapshot-swap caches keyed by id, name and uuid.
//! * [`select`] – Select paths and the value-select chain that projects and decodes them.
//! * [`sql`] – A small SQL builder for selects, unions, inserts, updates and deletes.
//! * [`statement`] – Print, query, insert, update and delete statements and the [`statement::Engine`].
//! * [`eql`] – The parser for the EQL statement subset (grammar in `eql.pest`).
//! * [`persist`] – SQLite persistence: the metadata schema and result cursors.
//! * [`model`] – JSON model definitions installed into the metadata tables.
//! * [`context`] – The execution context (actor, locale, clock) and exec programs.
//! * [`interface`], [`server`], [`settings`] – The HTTP surface and its configuration.
//!
//! ## Persistence
//! The [`persist::Persistor`] creates the `META_*` tables holding the model and runs
//! the generated SQL. [`construct::Database::install`] writes a
//! [`model::ModelDefinition`], creates its business tables and reloads the cache.
//!
//! ## EQL
//! ```text
//! print query type Order where attribute[Name] like "A%"
//!     select attribute[Name] as name, linkto[Contact].attribute[Name] as contact
//!     order by name desc
//! ```
//! Targets are `obj <oid>`, `list (<oid>, ...)` or `query type A, B [where ...]`.
//! `insert type T set A = v`, `update <target> set A = v` and `delete <target>` write.
//!
//! ## Quick Start
//! ```
//! use efaps::construct::{Database, PersistenceMode};
//! use efaps::context::ExecutionContext;
//! use efaps::model::ModelDefinition;
//! use efaps::statement::Engine;
//! use efaps::value::Value;
//!
//! let db = Database::new(PersistenceMode::InMemory).unwrap();
//! let model = ModelDefinition::from_json(r#"{
//!     "sql_tables": [ { "name": "T_PERSON", "sql_name": "T_PERSON" } ],
//!     "types": [ { "name": "Person", "table": "T_PERSON",
//!                  "attributes": [ { "name": "Name", "type": "String", "columns": ["NAME"] } ] } ]
//! }"#).unwrap();
//! db.install(&model).unwrap();
//! let engine = Engine::new(&db);
//! let ctx = ExecutionContext::new(1);
//! engine.execute(r#"insert type Person set Name = "Alice""#, &ctx).unwrap();
//! let rows = engine.print("print query type Person select attribute[Name] as name", &ctx).unwrap();
//! assert_eq!(rows[0].get("name"), Some(&Value::Text("Alice".into())));
//! ```

pub mod cache;
pub mod construct;
pub mod context;
pub mod datatype;
pub mod eql;
pub mod error;
pub mod interface;
pub mod model;
pub mod persist;
pub mod select;
pub mod server;
pub mod settings;
pub mod sql;
pub mod statement;
pub mod value;
