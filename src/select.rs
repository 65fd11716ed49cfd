//! Value selects: the part of a print that turns one select path into SQL
//! columns and turns the fetched columns back into a business value.
//!
//! A path such as `linkto[Contact].attribute[Name]` is split into joins
//! (`SelectPart`) and an ordered list of nodes (`SelectNode`). The first node
//! reads columns, every following node transforms the value of its predecessor.
use bigdecimal::{BigDecimal, RoundingMode};
use chrono::format::{Item, StrftimeItems};
use roaring::RoaringTreemap;
use rusqlite::types::Value as SqlValue;
use tracing::debug;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::cache::MetadataCache;
use crate::construct::{Attribute, Classification, SqlTable, Type};
use crate::error::{EfapsError, Result};
use crate::persist::Persistor;
use crate::sql::{ColumnRef, SqlSelect, SqlUnion, SqlWhere};
use crate::value::{Instance, Locale, Value};

// ------------- Paths -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectNode {
    Attribute(String),
    Oid,
    Id,
    Instance,
    Type,
    Status,
    Classification,
    Label,
    Name,
    Key,
    Uuid,
    UomName,
    Base,
    Magnitude,
    Format(String),
    Length,
    Exec(String),
}

impl SelectNode {
    /// Nodes that can start a chain by reading columns.
    pub fn can_head(&self) -> bool {
        !matches!(
            self,
            SelectNode::Key
                | SelectNode::UomName
                | SelectNode::Base
                | SelectNode::Magnitude
                | SelectNode::Format(_)
                | SelectNode::Length
        )
    }
    /// Nodes that only make sense at the start of a chain.
    pub fn head_only(&self) -> bool {
        matches!(
            self,
            SelectNode::Attribute(_) | SelectNode::Status | SelectNode::Classification | SelectNode::Exec(_)
        )
    }
    /// Nodes whose value already is a resolved type.
    pub fn is_type_like(&self) -> bool {
        matches!(self, SelectNode::Type | SelectNode::Classification)
    }
    /// Nodes resolved after the SQL batch, per instance.
    pub fn is_deferred(&self) -> bool {
        matches!(self, SelectNode::Classification | SelectNode::Exec(_))
    }
}

impl fmt::Display for SelectNode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SelectNode::Attribute(a) => write!(f, "attribute[{}]", a),
            SelectNode::Oid => write!(f, "oid"),
            SelectNode::Id => write!(f, "id"),
            SelectNode::Instance => write!(f, "instance"),
            SelectNode::Type => write!(f, "type"),
            SelectNode::Status => write!(f, "status"),
            SelectNode::Classification => write!(f, "classification"),
            SelectNode::Label => write!(f, "label"),
            SelectNode::Name => write!(f, "name"),
            SelectNode::Key => write!(f, "key"),
            SelectNode::Uuid => write!(f, "uuid"),
            SelectNode::UomName => write!(f, "uom"),
            SelectNode::Base => write!(f, "base"),
            SelectNode::Magnitude => write!(f, "value"),
            SelectNode::Format(p) => write!(f, "format[{}]", p),
            SelectNode::Length => write!(f, "length"),
            SelectNode::Exec(p) => write!(f, "exec {}", p),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectPart {
    LinkTo(String),
    LinkFrom { type_name: String, attribute: String },
}

impl fmt::Display for SelectPart {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SelectPart::LinkTo(a) => write!(f, "linkto[{}]", a),
            SelectPart::LinkFrom { type_name, attribute } => write!(f, "linkfrom[{}#{}]", type_name, attribute),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectPath {
    parts: Vec<SelectPart>,
    nodes: Vec<SelectNode>,
}

impl SelectPath {
    pub fn new(parts: Vec<SelectPart>, nodes: Vec<SelectNode>) -> Result<Self> {
        let invalid = |message: String| EfapsError::Parse {
            message,
            line: None,
            col: None,
        };
        let head = nodes
            .first()
            .ok_or_else(|| invalid("a select path needs at least one value select".to_string()))?;
        if !head.can_head() {
            return Err(invalid(format!("'{}' cannot start a select", head)));
        }
        if let Some(node) = nodes.iter().skip(1).find(|n| n.head_only()) {
            return Err(invalid(format!("'{}' must start a select", node)));
        }
        if parts
            .iter()
            .skip(1)
            .any(|p| matches!(p, SelectPart::LinkFrom { .. }))
        {
            return Err(invalid("linkfrom must be the first part of a select".to_string()));
        }
        if matches!(parts.first(), Some(SelectPart::LinkFrom { .. })) && head.is_deferred() {
            return Err(invalid(format!("'{}' cannot follow linkfrom", head)));
        }
        Ok(Self { parts, nodes })
    }
    pub fn parse(text: &str) -> Result<Self> {
        crate::eql::parse_path(text)
    }
    pub fn parts(&self) -> &[SelectPart] {
        &self.parts
    }
    pub fn nodes(&self) -> &[SelectNode] {
        &self.nodes
    }
    pub fn link_from(&self) -> Option<(&str, &str)> {
        match self.parts.first() {
            Some(SelectPart::LinkFrom { type_name, attribute }) => Some((type_name, attribute)),
            _ => None,
        }
    }
}

impl fmt::Display for SelectPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut pieces: Vec<String> = self.parts.iter().map(|p| p.to_string()).collect();
        pieces.extend(self.nodes.iter().map(|n| n.to_string()));
        write!(f, "{}", pieces.join("."))
    }
}

// ------------- Joins -------------
/// Index of the table holding `attribute`, joining a child table when needed.
pub(crate) fn attribute_table(
    select: &mut SqlSelect,
    table_index: usize,
    current: &Type,
    attribute: &Attribute,
    cache: &MetadataCache,
) -> Result<usize> {
    let main = cache.main_table_of(current)?;
    if attribute.table() == main.id() {
        return Ok(table_index);
    }
    let child = cache.sql_tables().get_by_id(attribute.table())?;
    Ok(select.left_join(child.sql_name(), table_index, main.id_column(), child.id_column()))
}

/// Applies the `linkto` joins of a path. Returns the table index and type the nodes work on.
pub(crate) fn join_parts(
    parts: &[SelectPart],
    base: &Arc<Type>,
    select: &mut SqlSelect,
    table_index: usize,
    cache: &MetadataCache,
) -> Result<(usize, Arc<Type>)> {
    let mut index = table_index;
    let mut current = Arc::clone(base);
    for part in parts {
        match part {
            SelectPart::LinkTo(name) => {
                let attribute = Arc::clone(current.require_attribute(name)?);
                let target_id = match (attribute.attribute_type().is_link(), attribute.link()) {
                    (true, Some(target)) => target,
                    _ => {
                        return Err(EfapsError::Execution(format!(
                            "{} is not a link and cannot be followed",
                            attribute.qualified_name()
                        )));
                    }
                };
                let holder = attribute_table(select, index, &current, &attribute, cache)?;
                let target = cache.types().get_by_id(target_id)?;
                let target_table = cache.main_table_of(&target)?;
                index = select.left_join(
                    target_table.sql_name(),
                    holder,
                    &attribute.columns()[0],
                    target_table.id_column(),
                );
                current = target;
            }
            SelectPart::LinkFrom { .. } => {
                return Err(EfapsError::Execution("linkfrom must be the first part of a select".to_string()));
            }
        }
    }
    Ok((index, current))
}

// ------------- Decoding -------------
pub struct DecodeContext<'a> {
    pub cache: &'a MetadataCache,
    pub locale: &'a Locale,
    /// Concrete type of the row's base instance, when known.
    pub concrete_type: Option<&'a Arc<Type>>,
}

#[derive(Debug, Clone)]
pub struct ValueSelect {
    node: SelectNode,
    col_indexes: Vec<usize>,
    attribute: Option<Arc<Attribute>>,
    fixed_type: Option<Arc<Type>>,
}

impl ValueSelect {
    fn new(node: SelectNode) -> Self {
        Self {
            node,
            col_indexes: Vec::new(),
            attribute: None,
            fixed_type: None,
        }
    }
    pub fn node(&self) -> &SelectNode {
        &self.node
    }
    /// Absolute 1-based positions of the columns this node reads.
    pub fn col_indexes(&self) -> &[usize] {
        &self.col_indexes
    }
    fn raw<'r>(&self, row: &'r [SqlValue]) -> Result<Vec<&'r SqlValue>> {
        self.col_indexes
            .iter()
            .map(|i| {
                i.checked_sub(1)
                    .and_then(|c| row.get(c))
                    .ok_or_else(|| EfapsError::Invariant(format!("row has no column {} for {}", i, self.node)))
            })
            .collect()
    }
    /// Projects the id column and, when the table has one, the type column.
    fn project_instance(&mut self, select: &mut SqlSelect, table_index: usize, current: &Arc<Type>, table: &SqlTable) {
        self.col_indexes.push(select.column(table_index, table.id_column()));
        match table.type_column() {
            Some(type_column) => self.col_indexes.push(select.column(table_index, type_column)),
            None => self.fixed_type = Some(Arc::clone(current)),
        }
    }
    fn project_type(&mut self, select: &mut SqlSelect, table_index: usize, current: &Arc<Type>, table: &SqlTable) {
        match table.type_column() {
            Some(type_column) => self.col_indexes.push(select.column(table_index, type_column)),
            None => self.fixed_type = Some(Arc::clone(current)),
        }
    }
    fn project_attribute(
        &mut self,
        select: &mut SqlSelect,
        table_index: usize,
        current: &Arc<Type>,
        attribute: Arc<Attribute>,
        cache: &MetadataCache,
    ) -> Result<()> {
        let holder = attribute_table(select, table_index, current, &attribute, cache)?;
        for column in attribute.columns() {
            self.col_indexes.push(select.column(holder, column));
        }
        self.attribute = Some(attribute);
        Ok(())
    }
    fn instance_from(&self, row: &[SqlValue]) -> Result<Value> {
        let raw = self.raw(row)?;
        let id = match raw.first() {
            Some(SqlValue::Integer(id)) => *id,
            // an unmatched left join
            _ => return Ok(Value::Null),
        };
        let type_id = match (raw.get(1), &self.fixed_type) {
            (Some(SqlValue::Integer(t)), _) => *t,
            (_, Some(fixed)) => fixed.id(),
            _ => return Err(EfapsError::Invariant(format!("no type for instance id {}", id))),
        };
        Ok(Value::Instance(Instance::new(type_id, id)))
    }
    fn type_from(&self, row: &[SqlValue], cache: &MetadataCache) -> Result<Value> {
        match self.raw(row)?.first() {
            Some(SqlValue::Integer(t)) => Ok(Value::Type(cache.types().get_by_id(*t)?)),
            Some(_) => Ok(Value::Null),
            None => Ok(self.fixed_type.clone().map(Value::Type).unwrap_or(Value::Null)),
        }
    }
    fn decode_attribute(&self, row: &[SqlValue], dc: &DecodeContext, retarget: bool) -> Result<Value> {
        let bound = self
            .attribute
            .as_ref()
            .ok_or_else(|| EfapsError::Invariant(format!("{} has not been bound", self.node)))?;
        // the concrete type may declare its own version of the attribute
        let attribute = match (retarget, dc.concrete_type) {
            (true, Some(concrete)) if concrete.id() != bound.parent_type() => match concrete.attribute(bound.name()) {
                Some(own) if own.attribute_type().arity() == bound.attribute_type().arity() => own,
                _ => bound,
            },
            _ => bound,
        };
        let raw: Vec<SqlValue> = self.raw(row)?.into_iter().cloned().collect();
        let value = attribute.attribute_type().decode(attribute, &raw, dc.cache)?;
        Ok(match value {
            Value::Rate(rate) => rate.quotient().map(Value::Decimal).unwrap_or(Value::Null),
            other => other,
        })
    }
    fn read(&self, row: &[SqlValue], dc: &DecodeContext, retarget: bool) -> Result<Value> {
        match &self.node {
            SelectNode::Attribute(_) | SelectNode::Status => self.decode_attribute(row, dc, retarget),
            SelectNode::Oid => Ok(match self.instance_from(row)? {
                Value::Instance(i) => Value::Text(i.oid()),
                other => other,
            }),
            SelectNode::Instance | SelectNode::Classification | SelectNode::Exec(_) => self.instance_from(row),
            SelectNode::Id => Ok(match self.raw(row)?.first() {
                Some(SqlValue::Integer(id)) => Value::Integer(*id),
                _ => Value::Null,
            }),
            SelectNode::Type => self.type_from(row, dc.cache),
            SelectNode::Label | SelectNode::Name | SelectNode::Uuid => {
                let t = self.type_from(row, dc.cache)?;
                self.transform(t, None, dc)
            }
            other => Err(EfapsError::Invariant(format!("'{}' cannot read columns", other))),
        }
    }
    /// Turns the predecessor's value into this node's value.
    fn transform(&self, value: Value, row: Option<&[SqlValue]>, dc: &DecodeContext) -> Result<Value> {
        if let Value::List(items) = value {
            let mut mapped = Vec::with_capacity(items.len());
            for item in items {
                mapped.push(self.transform(item, row, dc)?);
            }
            return Ok(Value::List(mapped));
        }
        if value.is_null() {
            return Ok(Value::Null);
        }
        let cache = dc.cache;
        let not_applicable = |value: &Value| {
            EfapsError::Execution(format!("'{}' cannot be applied to {:?}", self.node, value))
        };
        let result = match (&self.node, value) {
            (SelectNode::Label, Value::Type(t)) => Value::Text(t.label().to_string()),
            (SelectNode::Label, Value::Status(s)) => Value::Text(s.label().to_string()),
            (SelectNode::Label, Value::Classification(c)) => Value::Text(c.label().to_string()),
            (SelectNode::Label, Value::Instance(i)) => Value::Text(cache.types().get_by_id(i.type_id())?.label().to_string()),
            (SelectNode::Name, Value::Type(t)) => Value::Text(t.name().to_string()),
            (SelectNode::Name, Value::Classification(c)) => Value::Text(c.name().to_string()),
            (SelectNode::Name, Value::Status(s)) => Value::Text(s.key().to_string()),
            (SelectNode::Name, Value::Uom(u)) => Value::Text(u.uom().name().to_string()),
            (SelectNode::Name, Value::Instance(i)) => Value::Text(cache.types().get_by_id(i.type_id())?.name().to_string()),
            (SelectNode::Key, Value::Status(s)) => Value::Text(s.key().to_string()),
            (SelectNode::Uuid, Value::Type(t)) => Value::Uuid(t.uuid()),
            (SelectNode::Uuid, Value::Classification(c)) => Value::Uuid(c.uuid()),
            (SelectNode::Uuid, Value::Status(s)) => Value::Uuid(s.uuid()),
            (SelectNode::Uuid, Value::Uom(u)) => Value::Uuid(u.uom().uuid()),
            (SelectNode::Uuid, Value::Instance(i)) => Value::Uuid(cache.types().get_by_id(i.type_id())?.uuid()),
            (SelectNode::Type, v @ (Value::Type(_) | Value::Classification(_))) => v,
            (SelectNode::Type, Value::Status(s)) => Value::Type(cache.types().get_by_id(s.group())?),
            (SelectNode::Type, Value::Instance(i)) => match row {
                Some(row) if !self.col_indexes.is_empty() => self.type_from(row, cache)?,
                _ => Value::Type(cache.types().get_by_id(i.type_id())?),
            },
            (SelectNode::Id, Value::Instance(i)) => Value::Integer(i.id()),
            (SelectNode::Id, Value::Type(t)) => Value::Integer(t.id()),
            (SelectNode::Id, Value::Status(s)) => Value::Integer(s.id()),
            (SelectNode::Id, Value::Classification(c)) => Value::Integer(c.id()),
            (SelectNode::Id, Value::Uom(u)) => Value::Integer(u.uom_id()),
            (SelectNode::Oid, Value::Instance(i)) => Value::Text(i.oid()),
            (SelectNode::Instance, v @ Value::Instance(_)) => v,
            (SelectNode::UomName, Value::Uom(u)) => Value::Text(u.uom().name().to_string()),
            (SelectNode::Base, Value::Uom(u)) => Value::Decimal(u.base()),
            (SelectNode::Magnitude, Value::Uom(u)) => Value::Decimal(u.magnitude().clone()),
            (SelectNode::Magnitude, v @ (Value::Decimal(_) | Value::Integer(_))) => v,
            (SelectNode::Format(pattern), v) => Value::Text(format_with(pattern, &v, dc.locale)?),
            (SelectNode::Length, Value::Text(s)) => Value::Integer(s.chars().count() as i64),
            (SelectNode::Length, Value::Blob(b)) => Value::Integer(b.len() as i64),
            (SelectNode::Length, Value::Digest(d)) => Value::Integer(d.len() as i64),
            (_, v) => return Err(not_applicable(&v)),
        };
        Ok(result)
    }
}

/// Applies a date pattern (strftime) or a number pattern such as `#,##0.00`.
pub fn format_with(pattern: &str, value: &Value, locale: &Locale) -> Result<String> {
    Ok(match value {
        Value::Date(d) => d.format_with_items(date_items(pattern)?.into_iter()).to_string(),
        Value::DateTime(d) => d.format_with_items(date_items(pattern)?.into_iter()).to_string(),
        Value::Integer(i) => format_number(pattern, &BigDecimal::from(*i), locale),
        Value::Decimal(d) => format_number(pattern, d, locale),
        Value::Uom(u) => format!("{} {}", format_number(pattern, u.magnitude(), locale), u.uom().name()),
        other => other.format(locale),
    })
}

fn date_items(pattern: &str) -> Result<Vec<Item<'_>>> {
    let items: Vec<Item> = StrftimeItems::new(pattern).collect();
    if items.iter().any(|i| matches!(i, Item::Error)) {
        return Err(EfapsError::Execution(format!("invalid date pattern '{}'", pattern)));
    }
    Ok(items)
}

fn format_number(pattern: &str, decimal: &BigDecimal, locale: &Locale) -> String {
    let scale = pattern
        .split_once('.')
        .map(|(_, fraction)| fraction.chars().filter(|c| *c == '0' || *c == '#').count())
        .unwrap_or(0);
    let rounded = decimal.with_scale_round(scale as i64, RoundingMode::HalfUp);
    locale.format_number(&rounded, pattern.contains(','))
}

// ------------- Chains -------------
/// The bound nodes of one select path, in path order.
#[derive(Debug, Clone)]
pub struct SelectChain {
    nodes: Vec<ValueSelect>,
    retarget: bool,
}

impl SelectChain {
    pub fn new(path_nodes: &[SelectNode]) -> Self {
        Self {
            nodes: path_nodes.iter().cloned().map(ValueSelect::new).collect(),
            retarget: false,
        }
    }
    /// Decode attribute selects with the attribute of each row's concrete type.
    pub fn with_retarget(mut self, retarget: bool) -> Self {
        self.retarget = retarget;
        self
    }
    pub fn nodes(&self) -> &[ValueSelect] {
        &self.nodes
    }
    pub fn head(&self) -> Option<&SelectNode> {
        self.nodes.first().map(|n| &n.node)
    }
    /// The head node when it is resolved after the SQL batch.
    pub fn deferred(&self) -> Option<&SelectNode> {
        self.head().filter(|n| n.is_deferred())
    }
    /// Appends the columns of every node, head first. Returns how many were added.
    pub fn append_projection(
        &mut self,
        select: &mut SqlSelect,
        table_index: usize,
        current: &Arc<Type>,
        cache: &MetadataCache,
    ) -> Result<usize> {
        let before = select.column_count();
        let table = cache.main_table_of(current)?;
        // columns of a non-head node depend on what its predecessor yields
        let mut previous: Option<(SelectNode, Option<Arc<Attribute>>, usize)> = None;
        for node in self.nodes.iter_mut() {
            let start = select.column_count();
            match &previous {
                None => match node.node.clone() {
                    SelectNode::Attribute(name) => {
                        let attribute = Arc::clone(current.require_attribute(&name)?);
                        node.project_attribute(select, table_index, current, attribute, cache)?;
                    }
                    SelectNode::Status => {
                        let attribute = current.status_attribute().cloned().ok_or_else(|| {
                            EfapsError::AttributeNotFound {
                                type_name: current.name().to_string(),
                                attribute: "status".to_string(),
                            }
                        })?;
                        node.project_attribute(select, table_index, current, attribute, cache)?;
                    }
                    SelectNode::Oid
                    | SelectNode::Instance
                    | SelectNode::Classification
                    | SelectNode::Exec(_) => node.project_instance(select, table_index, current, &table),
                    SelectNode::Id => node.col_indexes.push(select.column(table_index, table.id_column())),
                    SelectNode::Type | SelectNode::Label | SelectNode::Name | SelectNode::Uuid => {
                        node.project_type(select, table_index, current, &table)
                    }
                    other => {
                        return Err(EfapsError::Execution(format!("'{}' cannot start a select", other)));
                    }
                },
                Some((parent, _, _)) if parent.is_type_like() => {}
                Some((SelectNode::Attribute(_), Some(link), holder))
                    if node.node == SelectNode::Type && link.attribute_type().is_link() =>
                {
                    // the concrete type of a linked instance lives in the target table
                    let target = cache.types().get_by_id(link.link().unwrap_or_default())?;
                    let target_table = cache.main_table_of(&target)?;
                    if let Some(type_column) = target_table.type_column() {
                        let joined = select.left_join(
                            target_table.sql_name(),
                            *holder,
                            &link.columns()[0],
                            target_table.id_column(),
                        );
                        node.col_indexes.push(select.column(joined, type_column));
                    }
                }
                Some(_) => {}
            }
            let added = select.column_count() - start;
            if added != node.col_indexes.len() {
                return Err(EfapsError::Invariant(format!(
                    "'{}' added {} columns but records {}",
                    node.node,
                    added,
                    node.col_indexes.len()
                )));
            }
            let holder = match &node.attribute {
                Some(a) => attribute_table(select, table_index, current, a, cache)?,
                None => table_index,
            };
            previous = Some((node.node.clone(), node.attribute.clone(), holder));
        }
        Ok(select.column_count() - before)
    }
    /// Decodes one row through all nodes.
    pub fn decode(&self, row: &[SqlValue], dc: &DecodeContext) -> Result<Value> {
        let head = self
            .nodes
            .first()
            .ok_or_else(|| EfapsError::Invariant("empty select chain".to_string()))?;
        let value = head.read(row, dc, self.retarget)?;
        self.apply(1, value, Some(row), dc)
    }
    /// Decodes every row; one row gives a scalar, several a list.
    pub fn decode_rows(&self, rows: &[&[SqlValue]], dc: &DecodeContext) -> Result<Value> {
        let mut values = Vec::with_capacity(rows.len());
        for row in rows {
            values.push(self.decode(row, dc)?);
        }
        Ok(Value::collapse(values))
    }
    /// Runs the nodes from `start` on, feeding each the previous result.
    pub fn apply(&self, start: usize, mut value: Value, row: Option<&[SqlValue]>, dc: &DecodeContext) -> Result<Value> {
        for node in self.nodes.iter().skip(start) {
            value = node.transform(value, row, dc)?;
        }
        Ok(value)
    }
}

// ------------- Link from -------------
/// Selects over the instances that point at the base instance, fetched in one
/// follow-up query for all base instances of a print.
#[derive(Debug, Clone)]
pub struct LinkFromSelect {
    from_type: Arc<Type>,
    attribute: Arc<Attribute>,
    select: SqlSelect,
    link_column: ColumnRef,
    link_index: usize,
    type_index: Option<usize>,
    chain: SelectChain,
}

impl LinkFromSelect {
    pub fn bind(path: &SelectPath, cache: &MetadataCache) -> Result<Self> {
        let (type_name, attribute_name) = path
            .link_from()
            .ok_or_else(|| EfapsError::Invariant("path has no linkfrom".to_string()))?;
        let from_type = cache
            .types()
            .find_by_name(type_name)
            .ok_or_else(|| EfapsError::TypeNotFound(type_name.to_string()))?;
        let attribute = Arc::clone(from_type.require_attribute(attribute_name)?);
        if !attribute.attribute_type().is_link() {
            return Err(EfapsError::Execution(format!(
                "{} is not a link",
                attribute.qualified_name()
            )));
        }
        let table = cache.main_table_of(&from_type)?;
        let mut select = SqlSelect::new("L", table.sql_name());
        let holder = attribute_table(&mut select, 0, &from_type, &attribute, cache)?;
        let link_index = select.column(holder, &attribute.columns()[0]);
        let link_column = ColumnRef::new(holder, &attribute.columns()[0]);
        let type_index = table.type_column().map(|c| select.column(0, c));
        if let Some(type_column) = table.type_column() {
            let family: Vec<SqlValue> = cache
                .type_family(from_type.id())?
                .iter()
                .map(|t| SqlValue::Integer(t.id()))
                .collect();
            select.and_where(SqlWhere::in_values(ColumnRef::new(0, type_column), family));
        }
        let (index, current) = join_parts(&path.parts()[1..], &from_type, &mut select, 0, cache)?;
        let mut chain = SelectChain::new(path.nodes()).with_retarget(path.parts().len() == 1);
        chain.append_projection(&mut select, index, &current, cache)?;
        select.order_by(0, table.id_column());
        Ok(Self {
            from_type,
            attribute,
            select,
            link_column,
            link_index,
            type_index,
            chain,
        })
    }
    pub fn from_type(&self) -> &Arc<Type> {
        &self.from_type
    }
    pub fn attribute(&self) -> &Arc<Attribute> {
        &self.attribute
    }
    /// Collapsed values per linked-to id.
    pub fn fetch(
        &self,
        persistor: &Persistor,
        ids: &RoaringTreemap,
        cache: &MetadataCache,
        locale: &Locale,
    ) -> Result<HashMap<i64, Value>> {
        let mut select = self.select.clone();
        let mut params = Vec::with_capacity(ids.len() as usize);
        for id in ids.iter() {
            params.push(SqlValue::Integer(to_id(id)?));
        }
        select.and_where(SqlWhere::in_values(self.link_column.clone(), params));
        let result = persistor.query(&select)?;
        let mut grouped: BTreeMap<i64, Vec<&[SqlValue]>> = BTreeMap::new();
        for row in result.rows() {
            if let Some(SqlValue::Integer(link)) = row.get(self.link_index - 1) {
                grouped.entry(*link).or_default().push(row.as_slice());
            }
        }
        let mut values = HashMap::new();
        for (link, rows) in grouped {
            let mut decoded = Vec::with_capacity(rows.len());
            for row in rows {
                let concrete = match self.type_index.and_then(|i| row.get(i - 1)) {
                    Some(SqlValue::Integer(t)) => Some(cache.types().get_by_id(*t)?),
                    _ => Some(Arc::clone(&self.from_type)),
                };
                let dc = DecodeContext {
                    cache,
                    locale,
                    concrete_type: concrete.as_ref(),
                };
                decoded.push(self.chain.decode(row, &dc)?);
            }
            values.insert(link, Value::collapse(decoded));
        }
        Ok(values)
    }
}

// ------------- Classifications -------------
pub(crate) fn to_id(id: u64) -> Result<i64> {
    i64::try_from(id).map_err(|_| EfapsError::Invariant(format!("id {} out of range", id)))
}

pub(crate) fn to_bitmap_id(id: i64) -> Result<u64> {
    u64::try_from(id).map_err(|_| EfapsError::Invariant(format!("negative id {}", id)))
}

/// Drops every classification that is an ancestor of another assigned one.
pub fn leaf_classifications(cache: &MetadataCache, assigned: &[i64]) -> Result<Vec<Arc<Classification>>> {
    let mut excluded = HashSet::new();
    for id in assigned {
        excluded.extend(cache.classification_ancestors(*id)?);
    }
    let leaves: BTreeSet<i64> = assigned.iter().copied().filter(|id| !excluded.contains(id)).collect();
    leaves
        .into_iter()
        .map(|id| cache.classifications().get_by_id(id))
        .collect()
}

pub struct ClassificationResolver<'a> {
    cache: &'a MetadataCache,
}

impl<'a> ClassificationResolver<'a> {
    pub fn new(cache: &'a MetadataCache) -> Self {
        Self { cache }
    }
    /// Leaf classifications per instance, one query per concrete type.
    pub fn resolve(
        &self,
        persistor: &Persistor,
        instances: &[Instance],
    ) -> Result<HashMap<Instance, Vec<Arc<Classification>>>> {
        let mut by_type: BTreeMap<i64, RoaringTreemap> = BTreeMap::new();
        for instance in instances {
            by_type
                .entry(instance.type_id())
                .or_default()
                .insert(to_bitmap_id(instance.id())?);
        }
        let mut resolved = HashMap::new();
        for (type_id, ids) in by_type {
            let t = self.cache.types().get_by_id(type_id)?;
            if t.classified_by().is_empty() {
                continue;
            }
            let union = self.union_for(&t, &ids)?;
            let mut result = persistor.query_union(&union)?;
            let mut assigned: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
            while result.next() {
                if let (Some(instance), Some(class)) = (result.get_long(1)?, result.get_long(2)?) {
                    assigned.entry(instance).or_default().push(class);
                }
            }
            debug!(type_name = t.name(), instances = ids.len(), pairs = result.len(), "classifications fetched");
            for (id, classes) in assigned {
                resolved.insert(Instance::new(type_id, id), leaf_classifications(self.cache, &classes)?);
            }
        }
        Ok(resolved)
    }
    /// One select per relation table the type's classifications use.
    fn union_for(&self, t: &Type, ids: &RoaringTreemap) -> Result<SqlUnion> {
        let mut by_relation = BTreeMap::new();
        for root in t.classified_by() {
            for c in self.cache.classification_tree(*root)? {
                by_relation
                    .entry(c.relation().clone())
                    .or_insert_with(Vec::new)
                    .push(SqlValue::Integer(c.id()));
            }
        }
        let mut instance_ids = Vec::with_capacity(ids.len() as usize);
        for id in ids.iter() {
            instance_ids.push(SqlValue::Integer(to_id(id)?));
        }
        let mut union = SqlUnion::new();
        for (n, (relation, class_ids)) in by_relation.into_iter().enumerate() {
            let mut select = SqlSelect::new(&format!("R{}T", n), &relation.sql_name);
            select.column(0, &relation.instance_column);
            select.column(0, &relation.classification_column);
            select.and_where(SqlWhere::in_values(
                ColumnRef::new(0, &relation.instance_column),
                instance_ids.clone(),
            ));
            select.and_where(SqlWhere::in_values(
                ColumnRef::new(0, &relation.classification_column),
                class_ids,
            ));
            union.push(select);
        }
        Ok(union)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::construct::{Database, PersistenceMode};
    use crate::model::ModelDefinition;

    const MODEL: &str = r#"{
        "sql_tables": [ { "name": "T_ITEM", "sql_name": "T_ITEM" } ],
        "types": [
            { "name": "Item", "table": "T_ITEM",
              "attributes": [ { "name": "Name", "type": "String", "columns": ["NAME"] } ] }
        ]
    }"#;

    fn text(s: &str) -> SqlValue {
        SqlValue::Text(s.to_string())
    }

    #[test]
    fn decode_rows_collapses_by_row_count() {
        let db = Database::new(PersistenceMode::InMemory).unwrap();
        db.install(&ModelDefinition::from_json(MODEL).unwrap()).unwrap();
        let cache = db.cache().unwrap();
        let item = db.type_by_name("Item").unwrap();
        let path = SelectPath::parse("attribute[Name]").unwrap();
        let mut select = SqlSelect::new("T", "T_ITEM");
        select.column(0, "ID");
        let mut chain = SelectChain::new(path.nodes());
        chain.append_projection(&mut select, 0, &item, cache).unwrap();
        let locale = Locale::default();
        let dc = DecodeContext {
            cache,
            locale: &locale,
            concrete_type: None,
        };

        assert_eq!(chain.decode_rows(&[], &dc).unwrap(), Value::Null);

        let a = [SqlValue::Integer(1), text("a")];
        assert_eq!(chain.decode_rows(&[a.as_slice()], &dc).unwrap(), Value::Text("a".to_string()));

        let c = [SqlValue::Integer(3), text("c")];
        let b = [SqlValue::Integer(2), text("b")];
        // row order is kept, not id order
        assert_eq!(
            chain.decode_rows(&[c.as_slice(), a.as_slice(), b.as_slice()], &dc).unwrap(),
            Value::List(vec![
                Value::Text("c".to_string()),
                Value::Text("a".to_string()),
                Value::Text("b".to_string()),
            ])
        );
    }
}
