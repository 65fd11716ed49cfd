// used for persistence
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use bigdecimal::BigDecimal;
use tracing::debug;

use std::str::FromStr;

use crate::cache::{
    AttributeRecord, ClassificationRecord, MetadataBatch, MetadataSource, StatusRecord, TypeRecord, UomRecord,
};
use crate::construct::{ClassificationRelation, Dimension, PersistenceMode, SqlTable};
use crate::error::{EfapsError, Result};
use crate::sql::{SqlSelect, SqlUnion};

// ------------- CachedResult -------------
/// A fully read result set with a cursor and 1-based typed getters.
#[derive(Debug, Clone, Default)]
pub struct CachedResult {
    rows: Vec<Vec<SqlValue>>,
    cursor: Option<usize>,
}

impl CachedResult {
    pub fn new(rows: Vec<Vec<SqlValue>>) -> Self {
        Self { rows, cursor: None }
    }
    pub fn len(&self) -> usize {
        self.rows.len()
    }
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
    pub fn rows(&self) -> &[Vec<SqlValue>] {
        &self.rows
    }
    /// Moves to the next row, false once the rows are exhausted.
    pub fn next(&mut self) -> bool {
        let next = self.cursor.map_or(0, |c| c + 1);
        self.cursor = Some(next.min(self.rows.len()));
        next < self.rows.len()
    }
    pub fn get_object(&self, column: usize) -> Result<&SqlValue> {
        let row = self
            .cursor
            .and_then(|c| self.rows.get(c))
            .ok_or_else(|| EfapsError::Execution("result cursor is not on a row".to_string()))?;
        column
            .checked_sub(1)
            .and_then(|c| row.get(c))
            .ok_or_else(|| EfapsError::Execution(format!("result has no column {}", column)))
    }
    pub fn get_long(&self, column: usize) -> Result<Option<i64>> {
        match self.get_object(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Integer(i) => Ok(Some(*i)),
            SqlValue::Real(r) if r.fract() == 0.0 => Ok(Some(*r as i64)),
            SqlValue::Text(s) => s
                .parse()
                .map(Some)
                .map_err(|_| EfapsError::Execution(format!("column {} is not a long: {}", column, s))),
            other => Err(EfapsError::Execution(format!("column {} is not a long: {:?}", column, other))),
        }
    }
    pub fn get_string(&self, column: usize) -> Result<Option<String>> {
        match self.get_object(column)? {
            SqlValue::Null => Ok(None),
            SqlValue::Text(s) => Ok(Some(s.clone())),
            SqlValue::Integer(i) => Ok(Some(i.to_string())),
            SqlValue::Real(r) => Ok(Some(r.to_string())),
            SqlValue::Blob(b) => Ok(Some(String::from_utf8_lossy(b).into_owned())),
        }
    }
    pub fn get_decimal(&self, column: usize) -> Result<Option<BigDecimal>> {
        match self.get_string(column)? {
            None => Ok(None),
            Some(s) => BigDecimal::from_str(&s)
                .map(Some)
                .map_err(|_| EfapsError::Execution(format!("column {} is not a decimal: {}", column, s))),
        }
    }
}

// ------------- Persistence -------------
pub struct Persistor {
    db: Connection,
}

impl Persistor {
    pub fn open(mode: &PersistenceMode) -> Result<Persistor> {
        let connection = match mode {
            PersistenceMode::InMemory => Connection::open_in_memory()?,
            PersistenceMode::File(path) => Connection::open(path)?,
        };
        Persistor::new(connection)
    }
    pub fn new(connection: Connection) -> Result<Persistor> {
        connection.execute_batch(
            "
            create table if not exists META_SQLTABLE (
                ID integer primary key,
                UUID text not null,
                NAME text not null unique,
                SQLNAME text not null,
                IDCOLUMN text not null,
                TYPECOLUMN text null,
                PARENT integer null references META_SQLTABLE(ID)
            );
            create table if not exists META_TYPE (
                ID integer primary key,
                UUID text not null,
                NAME text not null unique,
                LABEL text null,
                PARENT integer null references META_TYPE(ID),
                ABSTRACT integer not null default 0,
                MAINTABLE integer null references META_SQLTABLE(ID)
            );
            create table if not exists META_TYPECLASSIFIEDBY (
                TYPEID integer not null references META_TYPE(ID),
                CLASSID integer not null references META_CLASSIFICATION(ID),
                constraint unique_classified_by primary key (TYPEID, CLASSID)
            );
            create table if not exists META_ATTRIBUTE (
                ID integer primary key,
                UUID text not null,
                NAME text not null,
                TYPEID integer not null references META_TYPE(ID),
                ATTRTYPE text not null,
                TABLEID integer not null references META_SQLTABLE(ID),
                COLUMNS text not null,
                LINKTYPE integer null references META_TYPE(ID),
                DIMENSION integer null references META_DIMENSION(ID),
                STATUSGROUP integer null references META_TYPE(ID),
                constraint unique_attribute unique (TYPEID, NAME)
            );
            create table if not exists META_STATUS (
                ID integer primary key,
                UUID text not null,
                GROUPID integer not null references META_TYPE(ID),
                KEY text not null,
                LABEL text null,
                constraint unique_status unique (GROUPID, KEY)
            );
            create table if not exists META_CLASSIFICATION (
                ID integer primary key,
                UUID text not null,
                NAME text not null unique,
                LABEL text null,
                PARENT integer null references META_CLASSIFICATION(ID),
                RELTABLE text null,
                RELINSTCOL text null,
                RELCLASSCOL text null
            );
            create table if not exists META_DIMENSION (
                ID integer primary key,
                UUID text not null,
                NAME text not null unique,
                BASEUOM integer null
            );
            create table if not exists META_UOM (
                ID integer primary key,
                UUID text not null,
                NAME text not null unique,
                DIMENSION integer not null references META_DIMENSION(ID),
                NUMERATOR text not null default '1',
                DENOMINATOR text not null default '1'
            );
            ",
        )?;
        Ok(Persistor { db: connection })
    }
    pub fn connection(&self) -> &Connection {
        &self.db
    }
    /// Runs `work` inside one transaction that is rolled back when `work` fails.
    pub fn atomically<T, F>(&mut self, work: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let transaction = self.db.transaction()?;
        let outcome = work(&transaction)?;
        transaction.commit()?;
        Ok(outcome)
    }
    pub fn query(&self, select: &SqlSelect) -> Result<CachedResult> {
        let (sql, params) = select.to_sql();
        self.query_sql(&sql, params)
    }
    pub fn query_union(&self, union: &SqlUnion) -> Result<CachedResult> {
        if union.is_empty() {
            return Ok(CachedResult::default());
        }
        let (sql, params) = union.to_sql();
        self.query_sql(&sql, params)
    }
    pub fn query_sql(&self, sql: &str, params: Vec<SqlValue>) -> Result<CachedResult> {
        debug!(%sql, params = params.len(), "executing query");
        query_rows(&self.db, sql, params)
    }
    pub fn execute(&self, sql: &str, params: Vec<SqlValue>) -> Result<usize> {
        execute(&self.db, sql, params)
    }
    /// Looks up a metadata id by name, `table` being one of the `META_*` tables.
    pub fn meta_id(&self, table: &str, name: &str) -> Result<Option<i64>> {
        meta_id(&self.db, table, name)
    }
}

pub fn query_rows(connection: &Connection, sql: &str, params: Vec<SqlValue>) -> Result<CachedResult> {
    let mut statement = connection.prepare_cached(sql)?;
    let width = statement.column_count();
    let mut rows = statement.query(params_from_iter(params))?;
    let mut collected = Vec::new();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(row.get::<_, SqlValue>(i)?);
        }
        collected.push(values);
    }
    Ok(CachedResult::new(collected))
}

fn required<T>(value: Option<T>, column: &str) -> Result<T> {
    value.ok_or_else(|| EfapsError::Invariant(format!("{} is null", column)))
}

pub fn execute(connection: &Connection, sql: &str, params: Vec<SqlValue>) -> Result<usize> {
    debug!(%sql, params = params.len(), "executing statement");
    let mut statement = connection.prepare_cached(sql)?;
    Ok(statement.execute(params_from_iter(params))?)
}

pub fn meta_id(connection: &Connection, table: &str, name: &str) -> Result<Option<i64>> {
    let sql = format!("select ID from {} where NAME = ?", table);
    Ok(connection
        .query_row(&sql, [name], |r| r.get::<_, i64>(0))
        .optional()?)
}

impl MetadataSource for Persistor {
    fn load_metadata(&self) -> Result<MetadataBatch> {
        let db = &self.db;
        let mut batch = MetadataBatch::default();

        let mut statement = db.prepare("select ID, UUID, NAME, SQLNAME, IDCOLUMN, TYPECOLUMN, PARENT from META_SQLTABLE")?;
        let rows = statement.query_map([], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, Option<String>>(5)?,
                r.get::<_, Option<i64>>(6)?,
            ))
        })?;
        for row in rows {
            let (id, uuid, name, sql_name, id_column, type_column, parent) = row?;
            let uuid = uuid::Uuid::parse_str(&uuid)
                .map_err(|e| EfapsError::Invariant(format!("sql table {} has an invalid uuid: {}", name, e)))?;
            batch
                .sql_tables
                .push(SqlTable::new(id, uuid, name, sql_name, id_column, type_column, parent));
        }

        let mut statement = db.prepare("select ID, UUID, NAME, LABEL, PARENT, ABSTRACT, MAINTABLE from META_TYPE")?;
        let rows = statement.query_map([], |r| {
            Ok(TypeRecord {
                id: r.get(0)?,
                uuid: r.get(1)?,
                name: r.get(2)?,
                label: r.get(3)?,
                parent: r.get(4)?,
                is_abstract: r.get::<_, i64>(5)? != 0,
                main_table: r.get(6)?,
            })
        })?;
        for row in rows {
            batch.types.push(row?);
        }

        let mut statement = db.prepare("select TYPEID, CLASSID from META_TYPECLASSIFIEDBY")?;
        let rows = statement.query_map([], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?;
        for row in rows {
            batch.type_classifications.push(row?);
        }

        let mut statement = db.prepare(
            "select ID, UUID, NAME, TYPEID, ATTRTYPE, TABLEID, COLUMNS, LINKTYPE, DIMENSION, STATUSGROUP from META_ATTRIBUTE",
        )?;
        let rows = statement.query_map([], |r| {
            Ok(AttributeRecord {
                id: r.get(0)?,
                uuid: r.get(1)?,
                name: r.get(2)?,
                type_id: r.get(3)?,
                attribute_type: r.get(4)?,
                table: r.get(5)?,
                columns: r.get(6)?,
                link: r.get(7)?,
                dimension: r.get(8)?,
                status_group: r.get(9)?,
            })
        })?;
        for row in rows {
            batch.attributes.push(row?);
        }

        let mut statement = db.prepare("select ID, UUID, GROUPID, KEY, LABEL from META_STATUS")?;
        let rows = statement.query_map([], |r| {
            Ok(StatusRecord {
                id: r.get(0)?,
                uuid: r.get(1)?,
                group: r.get(2)?,
                key: r.get(3)?,
                label: r.get(4)?,
            })
        })?;
        for row in rows {
            batch.statuses.push(row?);
        }

        let mut statement = db.prepare(
            "select ID, UUID, NAME, LABEL, PARENT, RELTABLE, RELINSTCOL, RELCLASSCOL from META_CLASSIFICATION",
        )?;
        let rows = statement.query_map([], |r| {
            let relation = match (
                r.get::<_, Option<String>>(5)?,
                r.get::<_, Option<String>>(6)?,
                r.get::<_, Option<String>>(7)?,
            ) {
                (Some(sql_name), Some(instance_column), Some(classification_column)) => Some(ClassificationRelation {
                    sql_name,
                    instance_column,
                    classification_column,
                }),
                _ => None,
            };
            Ok(ClassificationRecord {
                id: r.get(0)?,
                uuid: r.get(1)?,
                name: r.get(2)?,
                label: r.get(3)?,
                parent: r.get(4)?,
                relation,
            })
        })?;
        for row in rows {
            batch.classifications.push(row?);
        }

        let mut result = query_rows(db, "select ID, UUID, NAME, BASEUOM from META_DIMENSION", Vec::new())?;
        while result.next() {
            let name = required(result.get_string(3)?, "META_DIMENSION.NAME")?;
            let uuid = uuid::Uuid::parse_str(&required(result.get_string(2)?, "META_DIMENSION.UUID")?)
                .map_err(|e| EfapsError::Invariant(format!("dimension {} has an invalid uuid: {}", name, e)))?;
            let id = required(result.get_long(1)?, "META_DIMENSION.ID")?;
            batch.dimensions.push(Dimension::new(id, uuid, name, result.get_long(4)?));
        }

        let mut result = query_rows(
            db,
            "select ID, UUID, NAME, DIMENSION, NUMERATOR, DENOMINATOR from META_UOM",
            Vec::new(),
        )?;
        while result.next() {
            batch.uoms.push(UomRecord {
                id: required(result.get_long(1)?, "META_UOM.ID")?,
                uuid: required(result.get_string(2)?, "META_UOM.UUID")?,
                name: required(result.get_string(3)?, "META_UOM.NAME")?,
                dimension: required(result.get_long(4)?, "META_UOM.DIMENSION")?,
                numerator: required(result.get_decimal(5)?, "META_UOM.NUMERATOR")?.to_string(),
                denominator: required(result.get_decimal(6)?, "META_UOM.DENOMINATOR")?.to_string(),
            });
        }

        debug!(
            tables = batch.sql_tables.len(),
            types = batch.types.len(),
            attributes = batch.attributes.len(),
            "metadata loaded"
        );
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cached_result_getters_are_one_based() {
        let mut result = CachedResult::new(vec![vec![
            SqlValue::Integer(7),
            SqlValue::Text("12.50".into()),
            SqlValue::Text("2024-03-01 10:00:00".into()),
            SqlValue::Null,
        ]]);
        assert!(result.get_object(1).is_err());
        assert!(result.next());
        assert_eq!(result.get_long(1).unwrap(), Some(7));
        assert_eq!(result.get_decimal(2).unwrap().unwrap().to_string(), "12.50");
        assert_eq!(result.get_string(3).unwrap().as_deref(), Some("2024-03-01 10:00:00"));
        assert_eq!(result.get_string(4).unwrap(), None);
        assert!(result.get_object(0).is_err());
        assert!(result.get_object(5).is_err());
        assert!(!result.next());
    }

    #[test]
    fn metadata_schema_is_created_on_open() {
        let persistor = Persistor::open(&PersistenceMode::InMemory).unwrap();
        let batch = persistor.load_metadata().unwrap();
        assert!(batch.types.is_empty());
        assert_eq!(persistor.meta_id("META_TYPE", "Nothing").unwrap(), None);
    }
}
