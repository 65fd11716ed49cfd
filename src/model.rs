//! Installing a model: metadata rows plus the business tables they describe.
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use crate::datatype::AttributeType;
use crate::error::{EfapsError, Result};
use crate::persist::{execute, meta_id, query_rows, Persistor};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelDefinition {
    #[serde(default)]
    pub sql_tables: Vec<SqlTableDef>,
    #[serde(default)]
    pub types: Vec<TypeDef>,
    #[serde(default)]
    pub statuses: Vec<StatusDef>,
    #[serde(default)]
    pub classifications: Vec<ClassificationDef>,
    #[serde(default)]
    pub dimensions: Vec<DimensionDef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqlTableDef {
    pub name: String,
    pub sql_name: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default)]
    pub type_column: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub uuid: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypeDef {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default, rename = "abstract")]
    pub is_abstract: bool,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub attributes: Vec<AttributeDef>,
    #[serde(default)]
    pub classified_by: Vec<String>,
    #[serde(default)]
    pub uuid: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttributeDef {
    pub name: String,
    #[serde(rename = "type")]
    pub attribute_type: String,
    #[serde(default)]
    pub table: Option<String>,
    pub columns: Vec<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub dimension: Option<String>,
    #[serde(default)]
    pub status_group: Option<String>,
    #[serde(default)]
    pub uuid: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusDef {
    pub group: String,
    pub key: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub uuid: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelationDef {
    pub sql_name: String,
    pub instance_column: String,
    pub classification_column: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassificationDef {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub relation: Option<RelationDef>,
    #[serde(default)]
    pub uuid: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DimensionDef {
    pub name: String,
    #[serde(default)]
    pub base_uom: Option<String>,
    #[serde(default)]
    pub uoms: Vec<UomDef>,
    #[serde(default)]
    pub uuid: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UomDef {
    pub name: String,
    #[serde(default = "default_factor")]
    pub numerator: String,
    #[serde(default = "default_factor")]
    pub denominator: String,
    #[serde(default)]
    pub uuid: Option<Uuid>,
}

fn default_id_column() -> String {
    "ID".to_string()
}

fn default_factor() -> String {
    "1".to_string()
}

/// Stable uuid for a named metadata object that was defined without one.
pub fn default_uuid(kind: &str, name: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("efaps:{}:{}", kind, name).as_bytes())
}

fn uuid_text(uuid: Option<Uuid>, kind: &str, name: &str) -> SqlValue {
    SqlValue::Text(uuid.unwrap_or_else(|| default_uuid(kind, name)).to_string())
}

fn text(s: &str) -> SqlValue {
    SqlValue::Text(s.to_string())
}

fn opt_id(id: Option<i64>) -> SqlValue {
    id.map(SqlValue::Integer).unwrap_or(SqlValue::Null)
}

fn require(connection: &Connection, table: &str, kind: &str, name: &str) -> Result<i64> {
    meta_id(connection, table, name)?
        .ok_or_else(|| EfapsError::Execution(format!("model references unknown {} '{}'", kind, name)))
}

fn insert(connection: &Connection, sql: &str, params: Vec<SqlValue>) -> Result<i64> {
    execute(connection, sql, params)?;
    Ok(connection.last_insert_rowid())
}

impl ModelDefinition {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
    pub fn from_file(path: &str) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .map_err(|e| EfapsError::Config(format!("cannot read model file {}: {}", path, e)))?;
        Self::from_json(&json)
    }

    /// Writes every definition in one transaction. References by name may point
    /// at definitions appearing earlier in this model or already installed.
    pub fn install(&self, persistor: &mut Persistor) -> Result<()> {
        persistor.atomically(|db| {
            self.install_tables(db)?;
            self.install_types(db)?;
            self.install_classifications(db)?;
            self.install_dimensions(db)?;
            self.install_attributes(db)?;
            self.install_statuses(db)?;
            self.create_business_tables(db)?;
            Ok(())
        })?;
        info!(
            tables = self.sql_tables.len(),
            types = self.types.len(),
            classifications = self.classifications.len(),
            "model written"
        );
        Ok(())
    }

    fn install_tables(&self, db: &Connection) -> Result<()> {
        for table in &self.sql_tables {
            let parent = match &table.parent {
                Some(p) => Some(require(db, "META_SQLTABLE", "sql table", p)?),
                None => None,
            };
            insert(
                db,
                "insert into META_SQLTABLE (UUID, NAME, SQLNAME, IDCOLUMN, TYPECOLUMN, PARENT) values (?, ?, ?, ?, ?, ?)",
                vec![
                    uuid_text(table.uuid, "sqltable", &table.name),
                    text(&table.name),
                    text(&table.sql_name),
                    text(&table.id_column),
                    table.type_column.as_deref().map(text).unwrap_or(SqlValue::Null),
                    opt_id(parent),
                ],
            )?;
        }
        Ok(())
    }

    fn install_types(&self, db: &Connection) -> Result<()> {
        for t in &self.types {
            let parent = match &t.parent {
                Some(p) => Some(require(db, "META_TYPE", "type", p)?),
                None => None,
            };
            // a child type without its own table lives in the table of its parent
            let table = match &t.table {
                Some(name) => Some(require(db, "META_SQLTABLE", "sql table", name)?),
                None => match parent {
                    Some(p) => db.query_row("select MAINTABLE from META_TYPE where ID = ?", [p], |r| {
                        r.get::<_, Option<i64>>(0)
                    })?,
                    None => None,
                },
            };
            insert(
                db,
                "insert into META_TYPE (UUID, NAME, LABEL, PARENT, ABSTRACT, MAINTABLE) values (?, ?, ?, ?, ?, ?)",
                vec![
                    uuid_text(t.uuid, "type", &t.name),
                    text(&t.name),
                    t.label.as_deref().map(text).unwrap_or(SqlValue::Null),
                    opt_id(parent),
                    SqlValue::Integer(i64::from(t.is_abstract)),
                    opt_id(table),
                ],
            )?;
        }
        Ok(())
    }

    fn install_classifications(&self, db: &Connection) -> Result<()> {
        for c in &self.classifications {
            let parent = match &c.parent {
                Some(p) => Some(require(db, "META_CLASSIFICATION", "classification", p)?),
                None => None,
            };
            if parent.is_none() && c.relation.is_none() {
                return Err(EfapsError::Execution(format!(
                    "root classification '{}' needs a relation table",
                    c.name
                )));
            }
            let (rel_table, rel_instance, rel_class) = match &c.relation {
                Some(r) => (text(&r.sql_name), text(&r.instance_column), text(&r.classification_column)),
                None => (SqlValue::Null, SqlValue::Null, SqlValue::Null),
            };
            insert(
                db,
                "insert into META_CLASSIFICATION (UUID, NAME, LABEL, PARENT, RELTABLE, RELINSTCOL, RELCLASSCOL) values (?, ?, ?, ?, ?, ?, ?)",
                vec![
                    uuid_text(c.uuid, "classification", &c.name),
                    text(&c.name),
                    c.label.as_deref().map(text).unwrap_or(SqlValue::Null),
                    opt_id(parent),
                    rel_table,
                    rel_instance,
                    rel_class,
                ],
            )?;
        }
        for t in &self.types {
            let type_id = require(db, "META_TYPE", "type", &t.name)?;
            for c in &t.classified_by {
                let class_id = require(db, "META_CLASSIFICATION", "classification", c)?;
                execute(
                    db,
                    "insert or ignore into META_TYPECLASSIFIEDBY (TYPEID, CLASSID) values (?, ?)",
                    vec![SqlValue::Integer(type_id), SqlValue::Integer(class_id)],
                )?;
            }
        }
        Ok(())
    }

    fn install_dimensions(&self, db: &Connection) -> Result<()> {
        for d in &self.dimensions {
            let dimension = insert(
                db,
                "insert into META_DIMENSION (UUID, NAME) values (?, ?)",
                vec![uuid_text(d.uuid, "dimension", &d.name), text(&d.name)],
            )?;
            for u in &d.uoms {
                insert(
                    db,
                    "insert into META_UOM (UUID, NAME, DIMENSION, NUMERATOR, DENOMINATOR) values (?, ?, ?, ?, ?)",
                    vec![
                        uuid_text(u.uuid, "uom", &u.name),
                        text(&u.name),
                        SqlValue::Integer(dimension),
                        text(&u.numerator),
                        text(&u.denominator),
                    ],
                )?;
            }
            if let Some(base) = &d.base_uom {
                let uom = require(db, "META_UOM", "uom", base)?;
                execute(
                    db,
                    "update META_DIMENSION set BASEUOM = ? where ID = ?",
                    vec![SqlValue::Integer(uom), SqlValue::Integer(dimension)],
                )?;
            }
        }
        Ok(())
    }

    fn install_attributes(&self, db: &Connection) -> Result<()> {
        for t in &self.types {
            let type_id = require(db, "META_TYPE", "type", &t.name)?;
            let main_table: Option<i64> =
                db.query_row("select MAINTABLE from META_TYPE where ID = ?", [type_id], |r| r.get(0))?;
            for a in &t.attributes {
                let attribute_type = AttributeType::from_str(&a.attribute_type)?;
                let table = match &a.table {
                    Some(name) => require(db, "META_SQLTABLE", "sql table", name)?,
                    None => main_table.ok_or_else(|| {
                        EfapsError::Execution(format!("attribute {}/{} has no table", t.name, a.name))
                    })?,
                };
                if a.columns.len() != attribute_type.arity() {
                    return Err(EfapsError::Execution(format!(
                        "attribute {}/{} needs {} column(s)",
                        t.name,
                        a.name,
                        attribute_type.arity()
                    )));
                }
                let link = match &a.link {
                    Some(l) => Some(require(db, "META_TYPE", "type", l)?),
                    None => None,
                };
                let dimension = match &a.dimension {
                    Some(d) => Some(require(db, "META_DIMENSION", "dimension", d)?),
                    None => None,
                };
                let status_group = match &a.status_group {
                    Some(g) => Some(require(db, "META_TYPE", "type", g)?),
                    None => None,
                };
                insert(
                    db,
                    "insert into META_ATTRIBUTE (UUID, NAME, TYPEID, ATTRTYPE, TABLEID, COLUMNS, LINKTYPE, DIMENSION, STATUSGROUP) values (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    vec![
                        uuid_text(a.uuid, "attribute", &format!("{}/{}", t.name, a.name)),
                        text(&a.name),
                        SqlValue::Integer(type_id),
                        text(attribute_type.data_type()),
                        SqlValue::Integer(table),
                        text(&a.columns.join(",")),
                        opt_id(link),
                        opt_id(dimension),
                        opt_id(status_group),
                    ],
                )?;
            }
        }
        Ok(())
    }

    fn install_statuses(&self, db: &Connection) -> Result<()> {
        for s in &self.statuses {
            let group = require(db, "META_TYPE", "type", &s.group)?;
            insert(
                db,
                "insert into META_STATUS (UUID, GROUPID, KEY, LABEL) values (?, ?, ?, ?)",
                vec![
                    uuid_text(s.uuid, "status", &format!("{}.{}", s.group, s.key)),
                    SqlValue::Integer(group),
                    text(&s.key),
                    s.label.as_deref().map(text).unwrap_or(SqlValue::Null),
                ],
            )?;
        }
        Ok(())
    }

    /// Creates every table known to the metadata and adds columns later attributes introduced.
    fn create_business_tables(&self, db: &Connection) -> Result<()> {
        let mut tables: BTreeMap<String, (String, BTreeSet<String>)> = BTreeMap::new();
        let known = query_rows(db, "select ID, SQLNAME, IDCOLUMN, TYPECOLUMN from META_SQLTABLE", Vec::new())?;
        let mut by_id = BTreeMap::new();
        for row in known.rows() {
            if let (SqlValue::Integer(id), SqlValue::Text(sql_name), SqlValue::Text(id_column)) = (&row[0], &row[1], &row[2]) {
                let mut columns = BTreeSet::new();
                if let SqlValue::Text(type_column) = &row[3] {
                    columns.insert(type_column.clone());
                }
                tables.insert(sql_name.clone(), (id_column.clone(), columns));
                by_id.insert(*id, sql_name.clone());
            }
        }
        let attributes = query_rows(db, "select TABLEID, ATTRTYPE, COLUMNS from META_ATTRIBUTE", Vec::new())?;
        for row in attributes.rows() {
            if let (SqlValue::Integer(table), SqlValue::Text(attribute_type), SqlValue::Text(columns)) = (&row[0], &row[1], &row[2]) {
                // computed attributes read columns that are already there
                if AttributeType::from_str(attribute_type)?.is_computed() {
                    continue;
                }
                if let Some(entry) = by_id.get(table).and_then(|name| tables.get_mut(name)) {
                    entry.1.extend(columns.split(',').map(|c| c.trim().to_string()).filter(|c| !c.is_empty()));
                }
            }
        }
        let relations = query_rows(
            db,
            "select RELTABLE, RELINSTCOL, RELCLASSCOL from META_CLASSIFICATION where RELTABLE is not null",
            Vec::new(),
        )?;
        for row in relations.rows() {
            if let (SqlValue::Text(sql_name), SqlValue::Text(instance), SqlValue::Text(class)) = (&row[0], &row[1], &row[2]) {
                let entry = tables
                    .entry(sql_name.clone())
                    .or_insert_with(|| ("ID".to_string(), BTreeSet::new()));
                entry.1.insert(instance.clone());
                entry.1.insert(class.clone());
            }
        }
        for (sql_name, (id_column, columns)) in tables {
            db.execute_batch(&format!(
                "create table if not exists {} ({} integer primary key)",
                sql_name, id_column
            ))?;
            let existing = query_rows(db, &format!("select name from pragma_table_info('{}')", sql_name), Vec::new())?;
            let existing: BTreeSet<String> = existing
                .rows()
                .iter()
                .filter_map(|r| match &r[0] {
                    SqlValue::Text(n) => Some(n.to_uppercase()),
                    _ => None,
                })
                .collect();
            for column in columns {
                if column.eq_ignore_ascii_case(&id_column) || existing.contains(&column.to_uppercase()) {
                    continue;
                }
                db.execute_batch(&format!("alter table {} add column {}", sql_name, column))?;
                debug!(table = %sql_name, %column, "column added");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uuids_are_stable_per_kind_and_name() {
        assert_eq!(default_uuid("type", "Order"), default_uuid("type", "Order"));
        assert_ne!(default_uuid("type", "Order"), default_uuid("sqltable", "Order"));
    }

    #[test]
    fn models_deserialize_with_defaults() {
        let model = ModelDefinition::from_json(
            r#"{ "sql_tables": [ { "name": "T_A", "sql_name": "T_A" } ],
                 "types": [ { "name": "A", "table": "T_A",
                              "attributes": [ { "name": "Name", "type": "String", "columns": ["NAME"] } ] } ] }"#,
        )
        .unwrap();
        assert_eq!(model.sql_tables[0].id_column, "ID");
        assert!(!model.types[0].is_abstract);
        assert!(model.statuses.is_empty());
    }
}
