//! Small SQL builders. Every builder renders to SQL text with `?` placeholders
//! plus the bind parameters in placeholder order.
use rusqlite::types::Value as SqlValue;

use std::fmt::Write;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TableRef {
    sql_name: String,
    join: Option<JoinOn>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct JoinOn {
    parent: usize,
    parent_column: String,
    column: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub table: usize,
    pub column: String,
}
impl ColumnRef {
    pub fn new(table: usize, column: &str) -> Self {
        Self {
            table,
            column: column.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlOp {
    Equal,
    NotEqual,
    Greater,
    Less,
    Like,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

#[derive(Debug, Clone)]
pub enum SqlOperand {
    None,
    Value(SqlValue),
    Values(Vec<SqlValue>),
    Subquery(Box<SqlSelect>),
}

#[derive(Debug, Clone)]
pub enum SqlWhere {
    Criterion {
        column: ColumnRef,
        op: SqlOp,
        operand: SqlOperand,
    },
    And(Vec<SqlWhere>),
    Or(Vec<SqlWhere>),
}

impl SqlWhere {
    pub fn criterion(column: ColumnRef, op: SqlOp, operand: SqlOperand) -> Self {
        SqlWhere::Criterion { column, op, operand }
    }
    pub fn in_values(column: ColumnRef, values: Vec<SqlValue>) -> Self {
        SqlWhere::Criterion {
            column,
            op: SqlOp::In,
            operand: SqlOperand::Values(values),
        }
    }
    fn render(&self, select: &SqlSelect, sql: &mut String, params: &mut Vec<SqlValue>) {
        match self {
            SqlWhere::And(parts) | SqlWhere::Or(parts) if parts.is_empty() => sql.push_str("1 = 1"),
            SqlWhere::And(parts) => render_group(parts, " AND ", select, sql, params),
            SqlWhere::Or(parts) => render_group(parts, " OR ", select, sql, params),
            SqlWhere::Criterion { column, op, operand } => {
                let column = select.qualified(column);
                match (op, operand) {
                    (SqlOp::IsNull, _) => {
                        let _ = write!(sql, "{} IS NULL", column);
                    }
                    (SqlOp::IsNotNull, _) => {
                        let _ = write!(sql, "{} IS NOT NULL", column);
                    }
                    (SqlOp::In | SqlOp::NotIn, SqlOperand::Values(values)) => {
                        if values.is_empty() {
                            // nothing is in an empty list
                            sql.push_str(if *op == SqlOp::In { "1 = 0" } else { "1 = 1" });
                        } else {
                            let marks = vec!["?"; values.len()].join(", ");
                            let keyword = if *op == SqlOp::In { "IN" } else { "NOT IN" };
                            let _ = write!(sql, "{} {} ({})", column, keyword, marks);
                            params.extend(values.iter().cloned());
                        }
                    }
                    (SqlOp::In | SqlOp::NotIn, SqlOperand::Subquery(subquery)) => {
                        let keyword = if *op == SqlOp::In { "IN" } else { "NOT IN" };
                        let _ = write!(sql, "{} {} (", column, keyword);
                        subquery.render(sql, params);
                        sql.push(')');
                    }
                    (_, SqlOperand::Value(value)) => {
                        let symbol = match op {
                            SqlOp::Equal => "=",
                            SqlOp::NotEqual => "<>",
                            SqlOp::Greater => ">",
                            SqlOp::Less => "<",
                            SqlOp::Like => "LIKE",
                            SqlOp::In => "IN",
                            _ => "NOT IN",
                        };
                        if matches!(op, SqlOp::In | SqlOp::NotIn) {
                            let _ = write!(sql, "{} {} (?)", column, symbol);
                        } else {
                            let _ = write!(sql, "{} {} ?", column, symbol);
                        }
                        params.push(value.clone());
                    }
                    (_, _) => sql.push_str("1 = 0"),
                }
            }
        }
    }
}

fn render_group(parts: &[SqlWhere], glue: &str, select: &SqlSelect, sql: &mut String, params: &mut Vec<SqlValue>) {
    sql.push('(');
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            sql.push_str(glue);
        }
        part.render(select, sql, params);
    }
    sql.push(')');
}

// ------------- Select -------------
#[derive(Debug, Clone)]
pub struct SqlSelect {
    alias_prefix: String,
    tables: Vec<TableRef>,
    columns: Vec<ColumnRef>,
    conditions: Vec<SqlWhere>,
    order: Vec<ColumnRef>,
}

impl SqlSelect {
    /// A select over `sql_name`, which becomes table index 0.
    pub fn new(alias_prefix: &str, sql_name: &str) -> Self {
        Self {
            alias_prefix: alias_prefix.to_string(),
            tables: vec![TableRef {
                sql_name: sql_name.to_string(),
                join: None,
            }],
            columns: Vec::new(),
            conditions: Vec::new(),
            order: Vec::new(),
        }
    }
    pub fn alias(&self, table: usize) -> String {
        format!("{}{}", self.alias_prefix, table)
    }
    fn qualified(&self, column: &ColumnRef) -> String {
        format!("{}.{}", self.alias(column.table), column.column)
    }
    /// Left joins `sql_name` on `<new>.column = <parent>.parent_column` and returns
    /// its table index. An identical join is only added once.
    pub fn left_join(&mut self, sql_name: &str, parent: usize, parent_column: &str, column: &str) -> usize {
        let table = TableRef {
            sql_name: sql_name.to_string(),
            join: Some(JoinOn {
                parent,
                parent_column: parent_column.to_string(),
                column: column.to_string(),
            }),
        };
        if let Some(index) = self.tables.iter().position(|t| *t == table) {
            return index;
        }
        self.tables.push(table);
        self.tables.len() - 1
    }
    /// Adds a projected column and returns its 1-based position in the result row.
    pub fn column(&mut self, table: usize, column: &str) -> usize {
        self.columns.push(ColumnRef::new(table, column));
        self.columns.len()
    }
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }
    pub fn and_where(&mut self, condition: SqlWhere) {
        self.conditions.push(condition);
    }
    pub fn order_by(&mut self, table: usize, column: &str) {
        self.order.push(ColumnRef::new(table, column));
    }
    fn render(&self, sql: &mut String, params: &mut Vec<SqlValue>) {
        sql.push_str("SELECT ");
        if self.columns.is_empty() {
            sql.push('1');
        } else {
            let columns: Vec<String> = self.columns.iter().map(|c| self.qualified(c)).collect();
            sql.push_str(&columns.join(", "));
        }
        for (index, table) in self.tables.iter().enumerate() {
            match &table.join {
                None => {
                    let _ = write!(sql, " FROM {} {}", table.sql_name, self.alias(index));
                }
                Some(join) => {
                    let _ = write!(
                        sql,
                        " LEFT JOIN {} {} ON {}.{} = {}.{}",
                        table.sql_name,
                        self.alias(index),
                        self.alias(index),
                        join.column,
                        self.alias(join.parent),
                        join.parent_column
                    );
                }
            }
        }
        if !self.conditions.is_empty() {
            sql.push_str(" WHERE ");
            for (i, condition) in self.conditions.iter().enumerate() {
                if i > 0 {
                    sql.push_str(" AND ");
                }
                condition.render(self, sql, params);
            }
        }
        if !self.order.is_empty() {
            let order: Vec<String> = self.order.iter().map(|c| self.qualified(c)).collect();
            let _ = write!(sql, " ORDER BY {}", order.join(", "));
        }
    }
    pub fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut sql = String::new();
        let mut params = Vec::new();
        self.render(&mut sql, &mut params);
        (sql, params)
    }
}

// ------------- Union -------------
#[derive(Debug, Clone, Default)]
pub struct SqlUnion {
    selects: Vec<SqlSelect>,
}

impl SqlUnion {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn push(&mut self, select: SqlSelect) {
        self.selects.push(select);
    }
    pub fn is_empty(&self) -> bool {
        self.selects.is_empty()
    }
    pub fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut sql = String::new();
        let mut params = Vec::new();
        for (i, select) in self.selects.iter().enumerate() {
            if i > 0 {
                sql.push_str(" UNION ");
            }
            select.render(&mut sql, &mut params);
        }
        (sql, params)
    }
}

// ------------- Writes -------------
#[derive(Debug, Clone)]
pub struct SqlInsert {
    table: String,
    values: Vec<(String, SqlValue)>,
}

impl SqlInsert {
    pub fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            values: Vec::new(),
        }
    }
    pub fn set(&mut self, column: &str, value: SqlValue) {
        self.values.push((column.to_string(), value));
    }
    pub fn to_sql(&self) -> (String, Vec<SqlValue>) {
        if self.values.is_empty() {
            return (format!("INSERT INTO {} DEFAULT VALUES", self.table), Vec::new());
        }
        let columns: Vec<&str> = self.values.iter().map(|(c, _)| c.as_str()).collect();
        let marks = vec!["?"; self.values.len()].join(", ");
        (
            format!("INSERT INTO {} ({}) VALUES ({})", self.table, columns.join(", "), marks),
            self.values.iter().map(|(_, v)| v.clone()).collect(),
        )
    }
}

#[derive(Debug, Clone)]
pub struct SqlUpdate {
    table: String,
    id_column: String,
    id: i64,
    values: Vec<(String, SqlValue)>,
}

impl SqlUpdate {
    pub fn new(table: &str, id_column: &str, id: i64) -> Self {
        Self {
            table: table.to_string(),
            id_column: id_column.to_string(),
            id,
            values: Vec::new(),
        }
    }
    pub fn set(&mut self, column: &str, value: SqlValue) {
        self.values.push((column.to_string(), value));
    }
    pub fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let assignments: Vec<String> = self.values.iter().map(|(c, _)| format!("{} = ?", c)).collect();
        let mut params: Vec<SqlValue> = self.values.iter().map(|(_, v)| v.clone()).collect();
        params.push(SqlValue::Integer(self.id));
        (
            format!("UPDATE {} SET {} WHERE {} = ?", self.table, assignments.join(", "), self.id_column),
            params,
        )
    }
}

#[derive(Debug, Clone)]
pub struct SqlDelete {
    table: String,
    column: String,
    id: i64,
}

impl SqlDelete {
    pub fn new(table: &str, column: &str, id: i64) -> Self {
        Self {
            table: table.to_string(),
            column: column.to_string(),
            id,
        }
    }
    pub fn to_sql(&self) -> (String, Vec<SqlValue>) {
        (
            format!("DELETE FROM {} WHERE {} = ?", self.table, self.column),
            vec![SqlValue::Integer(self.id)],
        )
    }
}
