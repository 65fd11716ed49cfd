//! Print, query, insert, update and delete statements plus the `Engine`
//! that runs them from EQL text.
//!
//! Every statement moves through `Built → Bound → Executed → Materialized`.
//! A materialized statement keeps its result and hands it out again instead of
//! touching the database a second time.
use roaring::RoaringTreemap;
use rusqlite::types::Value as SqlValue;
use serde::Serialize;
use serde::ser::{SerializeMap, SerializeStruct, Serializer};
use tracing::{debug, info, warn};

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use crate::cache::MetadataCache;
use crate::construct::{Attribute, ClassificationRelation, Database, SqlTable, Type};
use crate::context::{ExecutionContext, ProgramRegistry};
use crate::eql::{self, CompareOp, DeleteDef, EqlStatement, Filter, InsertDef, Operand, PrintDef, QueryDef, SelectionDef, SortKey, Target, UpdateDef};
use crate::error::{EfapsError, Result};
use crate::persist::{self, Persistor};
use crate::select::{
    ClassificationResolver, DecodeContext, LinkFromSelect, SelectChain, SelectNode, SelectPath, attribute_table,
    join_parts, to_bitmap_id,
};
use crate::sql::{ColumnRef, SqlDelete, SqlInsert, SqlOp, SqlOperand, SqlSelect, SqlUpdate, SqlWhere};
use crate::value::{Instance, Locale, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StatementState {
    Built,
    Bound,
    Executed,
    Materialized,
}

// ------------- Results -------------
/// One printed instance: its values in selection order, keyed by alias.
#[derive(Debug, Clone, PartialEq)]
pub struct DataRow {
    instance: Instance,
    values: Vec<(String, Value)>,
}

impl DataRow {
    pub fn instance(&self) -> Instance {
        self.instance
    }
    pub fn get(&self, alias: &str) -> Option<&Value> {
        self.values.iter().find(|(a, _)| a == alias).map(|(_, v)| v)
    }
    pub fn values(&self) -> &[(String, Value)] {
        &self.values
    }
}

struct AliasMap<'a>(&'a [(String, Value)]);

impl Serialize for AliasMap<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (alias, value) in self.0 {
            map.serialize_entry(alias, value)?;
        }
        map.end()
    }
}

impl Serialize for DataRow {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut row = serializer.serialize_struct("DataRow", 2)?;
        row.serialize_field("oid", &self.instance.oid())?;
        row.serialize_field("values", &AliasMap(&self.values))?;
        row.end()
    }
}

/// What a best-effort update or delete did, instance by instance.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub succeeded: Vec<Instance>,
    pub failed: Vec<(Instance, EfapsError)>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
    fn record(&mut self, instance: Instance, result: Result<()>, action: &str) {
        match result {
            Ok(()) => self.succeeded.push(instance),
            Err(e) => {
                warn!(oid = %instance, error = %e, "{} failed, continuing with the next instance", action);
                self.failed.push((instance, e));
            }
        }
    }
}

// ------------- Query -------------
/// The instances of one main table that a query covers.
#[derive(Debug, Clone)]
struct TableGroup {
    /// queried type the where clause is resolved against
    base: Arc<Type>,
    table: Arc<SqlTable>,
    type_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct QueryStatement {
    types: Vec<String>,
    filter: Option<Filter>,
    groups: Vec<TableGroup>,
    state: StatementState,
    instances: Vec<Instance>,
}

impl QueryStatement {
    pub fn new<S: Into<String>>(types: impl IntoIterator<Item = S>) -> Self {
        Self {
            types: types.into_iter().map(Into::into).collect(),
            filter: None,
            groups: Vec::new(),
            state: StatementState::Built,
            instances: Vec::new(),
        }
    }
    pub fn from_def(def: QueryDef) -> Self {
        let mut query = Self::new(def.types);
        query.filter = def.filter;
        query
    }
    /// Adds a condition, and-ed with any existing one.
    pub fn and_where(mut self, filter: Filter) -> Self {
        self.filter = Some(match self.filter.take() {
            None => filter,
            Some(Filter::And(mut parts)) => {
                parts.push(filter);
                Filter::And(parts)
            }
            Some(existing) => Filter::And(vec![existing, filter]),
        });
        self
    }
    pub fn state(&self) -> StatementState {
        self.state
    }
    /// Resolves the types and groups their non-abstract family by main table.
    pub fn bind(&mut self, cache: &MetadataCache) -> Result<()> {
        if self.state >= StatementState::Bound {
            return Ok(());
        }
        if self.types.is_empty() {
            return Err(EfapsError::Execution("a query needs at least one type".to_string()));
        }
        let mut groups: BTreeMap<i64, TableGroup> = BTreeMap::new();
        for name in &self.types {
            let base = cache
                .types()
                .find_by_name(name)
                .ok_or_else(|| EfapsError::TypeNotFound(name.clone()))?;
            for member in cache.type_family(base.id())? {
                if member.is_abstract() {
                    continue;
                }
                let table = cache.main_table_of(&member)?;
                let group = groups.entry(table.id()).or_insert_with(|| TableGroup {
                    base: Arc::clone(&base),
                    table: Arc::clone(&table),
                    type_ids: Vec::new(),
                });
                if !group.type_ids.contains(&member.id()) {
                    group.type_ids.push(member.id());
                }
            }
        }
        self.groups = groups.into_values().collect();
        self.state = StatementState::Bound;
        Ok(())
    }
    /// Matching instances, one SQL per main table, each ordered by id.
    pub fn execute(&mut self, persistor: &Persistor, cache: &MetadataCache) -> Result<&[Instance]> {
        if self.state == StatementState::Materialized {
            return Ok(&self.instances);
        }
        self.bind(cache)?;
        let mut instances = Vec::new();
        let mut seen = HashSet::new();
        for group in &self.groups {
            let mut select = self.group_select(group, "T", cache, 0)?;
            select.column(0, group.table.id_column());
            let has_type_column = group.table.type_column().is_some();
            if let Some(type_column) = group.table.type_column() {
                select.column(0, type_column);
            }
            select.order_by(0, group.table.id_column());
            let result = persistor.query(&select)?;
            for row in result.rows() {
                let id = match row.first() {
                    Some(SqlValue::Integer(id)) => *id,
                    _ => continue,
                };
                let type_id = match (has_type_column, row.get(1)) {
                    (true, Some(SqlValue::Integer(t))) => *t,
                    (true, _) => continue,
                    (false, _) => group.type_ids[0],
                };
                let instance = Instance::new(type_id, id);
                if seen.insert(instance) {
                    instances.push(instance);
                }
            }
        }
        self.state = StatementState::Executed;
        debug!(types = ?self.types, instances = instances.len(), "query executed");
        self.instances = instances;
        self.state = StatementState::Materialized;
        Ok(&self.instances)
    }
    /// Select on the group's table restricted to its types and the where clause, without columns.
    fn group_select(&self, group: &TableGroup, prefix: &str, cache: &MetadataCache, depth: usize) -> Result<SqlSelect> {
        let mut select = SqlSelect::new(prefix, group.table.sql_name());
        match group.table.type_column() {
            Some(type_column) => select.and_where(SqlWhere::in_values(
                ColumnRef::new(0, type_column),
                group.type_ids.iter().map(|id| SqlValue::Integer(*id)).collect(),
            )),
            None if group.type_ids.len() > 1 => {
                return Err(EfapsError::Execution(format!(
                    "table {} holds several types but has no type column",
                    group.table.sql_name()
                )));
            }
            None => {}
        }
        if let Some(filter) = &self.filter {
            let condition = compile_filter(filter, &mut select, &group.base, cache, depth)?;
            select.and_where(condition);
        }
        Ok(select)
    }
}

/// The column a comparison works on.
enum Criterion {
    Attribute(ColumnRef, Arc<Attribute>),
    Id(ColumnRef),
    Type(ColumnRef),
}

impl Criterion {
    fn column(&self) -> &ColumnRef {
        match self {
            Criterion::Attribute(c, _) | Criterion::Id(c) | Criterion::Type(c) => c,
        }
    }
    fn encode(&self, value: &Value, cache: &MetadataCache) -> Result<SqlValue> {
        match self {
            Criterion::Attribute(_, attribute) => attribute
                .attribute_type()
                .encode_criterion(attribute, value, cache)?
                .into_iter()
                .next()
                .ok_or_else(|| EfapsError::Invariant(format!("{} encoded no value", attribute.qualified_name()))),
            Criterion::Id(_) => match value {
                Value::Integer(id) => Ok(SqlValue::Integer(*id)),
                Value::Instance(i) => Ok(SqlValue::Integer(i.id())),
                Value::Text(s) => Instance::parse(s)
                    .map(|i| i.id())
                    .or_else(|| s.trim().parse().ok())
                    .map(SqlValue::Integer)
                    .ok_or_else(|| EfapsError::Execution(format!("'{}' is neither an id nor an OID", s))),
                other => Err(EfapsError::Execution(format!("{:?} cannot be compared with an id", other))),
            },
            Criterion::Type(_) => match value {
                Value::Integer(id) => Ok(SqlValue::Integer(*id)),
                Value::Type(t) => Ok(SqlValue::Integer(t.id())),
                Value::Text(name) => cache
                    .types()
                    .find_by_name(name)
                    .map(|t| SqlValue::Integer(t.id()))
                    .ok_or_else(|| EfapsError::TypeNotFound(name.clone())),
                other => Err(EfapsError::Execution(format!("{:?} cannot be compared with a type", other))),
            },
        }
    }
}

fn criterion(
    path: &SelectPath,
    select: &mut SqlSelect,
    base: &Arc<Type>,
    cache: &MetadataCache,
) -> Result<Criterion> {
    if path.link_from().is_some() {
        return Err(EfapsError::Execution(format!("'{}' cannot be compared in a where clause", path)));
    }
    let (index, current) = join_parts(path.parts(), base, select, 0, cache)?;
    let node = match path.nodes() {
        [node] => node,
        _ => {
            return Err(EfapsError::Execution(format!("'{}' cannot be compared in a where clause", path)));
        }
    };
    let table = cache.main_table_of(&current)?;
    let attribute = match node {
        SelectNode::Attribute(name) => Arc::clone(current.require_attribute(name)?),
        SelectNode::Status => current.status_attribute().cloned().ok_or_else(|| EfapsError::AttributeNotFound {
            type_name: current.name().to_string(),
            attribute: "status".to_string(),
        })?,
        SelectNode::Id | SelectNode::Oid | SelectNode::Instance => {
            return Ok(Criterion::Id(ColumnRef::new(index, table.id_column())));
        }
        SelectNode::Type => {
            let type_column = table.type_column().ok_or_else(|| {
                EfapsError::Execution(format!("table {} has no type column", table.sql_name()))
            })?;
            return Ok(Criterion::Type(ColumnRef::new(index, type_column)));
        }
        other => {
            return Err(EfapsError::Execution(format!("'{}' cannot be compared in a where clause", other)));
        }
    };
    if attribute.attribute_type().arity() != 1 {
        return Err(EfapsError::UnsupportedAttributeOperation(format!(
            "{} spans several columns and cannot be compared",
            attribute.qualified_name()
        )));
    }
    let holder = attribute_table(select, index, &current, &attribute, cache)?;
    Ok(Criterion::Attribute(ColumnRef::new(holder, &attribute.columns()[0]), attribute))
}

fn compile_filter(
    filter: &Filter,
    select: &mut SqlSelect,
    base: &Arc<Type>,
    cache: &MetadataCache,
    depth: usize,
) -> Result<SqlWhere> {
    match filter {
        Filter::And(parts) | Filter::Or(parts) => {
            let mut compiled = Vec::with_capacity(parts.len());
            for part in parts {
                compiled.push(compile_filter(part, select, base, cache, depth)?);
            }
            Ok(match filter {
                Filter::And(_) => SqlWhere::And(compiled),
                _ => SqlWhere::Or(compiled),
            })
        }
        Filter::Compare { path, op, operand } => {
            let target = criterion(path, select, base, cache)?;
            let column = target.column().clone();
            let sql_op = match op {
                CompareOp::Equal => SqlOp::Equal,
                CompareOp::NotEqual => SqlOp::NotEqual,
                CompareOp::Greater => SqlOp::Greater,
                CompareOp::Less => SqlOp::Less,
                CompareOp::Like => SqlOp::Like,
                CompareOp::In => SqlOp::In,
                CompareOp::NotIn => SqlOp::NotIn,
            };
            let listed = matches!(op, CompareOp::In | CompareOp::NotIn);
            Ok(match operand {
                Operand::Value(Value::Null) => match op {
                    CompareOp::Equal => SqlWhere::criterion(column, SqlOp::IsNull, SqlOperand::None),
                    CompareOp::NotEqual => SqlWhere::criterion(column, SqlOp::IsNotNull, SqlOperand::None),
                    _ => return Err(EfapsError::Execution("null can only be compared with == or !=".to_string())),
                },
                Operand::Value(value) if listed => {
                    SqlWhere::criterion(column, sql_op, SqlOperand::Values(vec![target.encode(value, cache)?]))
                }
                Operand::Value(value) => {
                    SqlWhere::criterion(column, sql_op, SqlOperand::Value(target.encode(value, cache)?))
                }
                Operand::Values(values) if listed => {
                    let mut encoded = Vec::with_capacity(values.len());
                    for value in values {
                        encoded.push(target.encode(value, cache)?);
                    }
                    SqlWhere::criterion(column, sql_op, SqlOperand::Values(encoded))
                }
                Operand::Query { query, select: projected } if listed => {
                    let subqueries = subquery_selects(query, projected.as_ref(), cache, depth + 1)?;
                    let mut criteria: Vec<SqlWhere> = subqueries
                        .into_iter()
                        .map(|s| SqlWhere::criterion(column.clone(), sql_op, SqlOperand::Subquery(Box::new(s))))
                        .collect();
                    match (criteria.len(), op) {
                        (1, _) => criteria.remove(0),
                        (_, CompareOp::In) => SqlWhere::Or(criteria),
                        _ => SqlWhere::And(criteria),
                    }
                }
                _ => return Err(EfapsError::Execution(format!("'{:?}' needs a single value", op))),
            })
        }
    }
}

/// One single-column select per main table of a nested query.
fn subquery_selects(
    def: &QueryDef,
    projected: Option<&SelectPath>,
    cache: &MetadataCache,
    depth: usize,
) -> Result<Vec<SqlSelect>> {
    let mut nested = QueryStatement::from_def(def.clone());
    nested.bind(cache)?;
    let prefix = format!("S{}T", depth);
    let mut selects = Vec::with_capacity(nested.groups.len());
    for group in &nested.groups {
        let mut select = nested.group_select(group, &prefix, cache, depth)?;
        match projected {
            None => {
                select.column(0, group.table.id_column());
            }
            Some(path) => {
                let column = criterion(path, &mut select, &group.base, cache)?.column().clone();
                select.column(column.table, &column.column);
            }
        }
        selects.push(select);
    }
    Ok(selects)
}

// ------------- Targets -------------
/// Explicit instances or the result of a query.
#[derive(Debug, Clone)]
pub enum InstanceSet {
    Objects(Vec<Instance>),
    Query(QueryStatement),
}

impl InstanceSet {
    pub fn from_def(target: Target) -> Self {
        match target {
            Target::Objects(instances) => InstanceSet::Objects(instances),
            Target::Query(def) => InstanceSet::Query(QueryStatement::from_def(def)),
        }
    }
    fn bind(&mut self, cache: &MetadataCache) -> Result<()> {
        match self {
            InstanceSet::Objects(_) => Ok(()),
            InstanceSet::Query(query) => query.bind(cache),
        }
    }
    /// The instances in request order, each once.
    fn resolve(&mut self, persistor: &Persistor, cache: &MetadataCache) -> Result<Vec<Instance>> {
        let instances = match self {
            InstanceSet::Objects(instances) => instances.clone(),
            InstanceSet::Query(query) => query.execute(persistor, cache)?.to_vec(),
        };
        let mut seen = HashSet::new();
        Ok(instances.into_iter().filter(|i| seen.insert(*i)).collect())
    }
}

// ------------- Print -------------
enum PlannedSelect {
    Chain(SelectChain),
    LinkFrom(LinkFromSelect),
}

/// The combined projection of all selections over one main table.
struct PrintPlan {
    select: SqlSelect,
    type_index: Option<usize>,
    columns: Vec<PlannedSelect>,
}

impl PrintPlan {
    fn build(base: &Arc<Type>, table: &SqlTable, selections: &[SelectionDef], cache: &MetadataCache) -> Result<Self> {
        let mut select = SqlSelect::new("T", table.sql_name());
        select.column(0, table.id_column());
        let type_index = table.type_column().map(|c| select.column(0, c));
        let mut columns = Vec::with_capacity(selections.len());
        for selection in selections {
            let path = &selection.path;
            if path.link_from().is_some() {
                columns.push(PlannedSelect::LinkFrom(LinkFromSelect::bind(path, cache)?));
                continue;
            }
            let (index, current) = join_parts(path.parts(), base, &mut select, 0, cache)?;
            let mut chain = SelectChain::new(path.nodes()).with_retarget(path.parts().is_empty());
            let added = chain.append_projection(&mut select, index, &current, cache)?;
            debug!(alias = %selection.alias, columns = added, "selection projected");
            columns.push(PlannedSelect::Chain(chain));
        }
        select.order_by(0, table.id_column());
        Ok(Self {
            select,
            type_index,
            columns,
        })
    }
}

/// Instances printed together with one SQL.
struct InstanceGroup {
    base: Arc<Type>,
    table: Arc<SqlTable>,
    instances: Vec<Instance>,
}

fn ancestors(type_id: i64, cache: &MetadataCache) -> Result<Vec<Arc<Type>>> {
    let mut chain = Vec::new();
    let mut next = Some(type_id);
    while let Some(id) = next {
        let t = cache.types().get_by_id(id)?;
        next = t.parent();
        chain.push(t);
    }
    Ok(chain)
}

/// Groups instances by main table. Types sharing a table print together
/// through their deepest common ancestor on that table.
fn group_instances(instances: &[Instance], cache: &MetadataCache) -> Result<Vec<InstanceGroup>> {
    let mut by_table: BTreeMap<i64, (Arc<SqlTable>, Vec<Instance>, BTreeSet<i64>)> = BTreeMap::new();
    for instance in instances {
        let t = cache.types().get_by_id(instance.type_id())?;
        let table = cache.main_table_of(&t)?;
        let entry = by_table
            .entry(table.id())
            .or_insert_with(|| (table, Vec::new(), BTreeSet::new()));
        entry.1.push(*instance);
        entry.2.insert(t.id());
    }
    let mut groups = Vec::new();
    for (table_id, (table, members, type_ids)) in by_table {
        let mut chains = Vec::with_capacity(type_ids.len());
        for type_id in &type_ids {
            chains.push(ancestors(*type_id, cache)?);
        }
        let common = chains[0]
            .iter()
            .find(|candidate| {
                chains[1..]
                    .iter()
                    .all(|chain| chain.iter().any(|t| t.id() == candidate.id()))
            })
            .cloned();
        let shared = match common {
            Some(base) => {
                if cache.main_table_of(&base)?.id() == table_id {
                    Some(base)
                } else {
                    None
                }
            }
            None => None,
        };
        match shared {
            Some(base) => groups.push(InstanceGroup {
                base,
                table,
                instances: members,
            }),
            None => {
                for type_id in type_ids {
                    groups.push(InstanceGroup {
                        base: cache.types().get_by_id(type_id)?,
                        table: Arc::clone(&table),
                        instances: members.iter().copied().filter(|i| i.type_id() == type_id).collect(),
                    });
                }
            }
        }
    }
    Ok(groups)
}

fn sort_rows(rows: &mut [DataRow], order: &[SortKey], locale: &Locale) {
    if order.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        order.iter().fold(Ordering::Equal, |ordering, key| {
            ordering.then_with(|| {
                let by_key = match (a.get(&key.alias), b.get(&key.alias)) {
                    (Some(left), Some(right)) => left.compare(right, locale),
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                if key.descending { by_key.reverse() } else { by_key }
            })
        })
    });
}

#[derive(Debug, Clone)]
pub struct PrintStatement {
    target: InstanceSet,
    selections: Vec<SelectionDef>,
    order: Vec<SortKey>,
    state: StatementState,
    rows: Vec<DataRow>,
}

impl PrintStatement {
    pub fn objects(instances: Vec<Instance>) -> Self {
        Self::with_target(InstanceSet::Objects(instances))
    }
    pub fn query(query: QueryStatement) -> Self {
        Self::with_target(InstanceSet::Query(query))
    }
    fn with_target(target: InstanceSet) -> Self {
        Self {
            target,
            selections: Vec::new(),
            order: Vec::new(),
            state: StatementState::Built,
            rows: Vec::new(),
        }
    }
    pub fn from_def(def: PrintDef) -> Self {
        let mut print = Self::with_target(InstanceSet::from_def(def.target));
        print.selections = def.selections;
        print.order = def.order;
        print
    }
    pub fn select(mut self, path: SelectPath, alias: &str) -> Self {
        self.selections.push(SelectionDef {
            path,
            alias: alias.to_string(),
        });
        self
    }
    pub fn order_by(mut self, alias: &str, descending: bool) -> Self {
        self.order.push(SortKey {
            alias: alias.to_string(),
            descending,
        });
        self
    }
    pub fn state(&self) -> StatementState {
        self.state
    }
    /// Checks aliases and resolves every selection against the types it will run on.
    pub fn bind(&mut self, cache: &MetadataCache) -> Result<()> {
        if self.state >= StatementState::Bound {
            return Ok(());
        }
        if self.selections.is_empty() {
            return Err(EfapsError::Execution("a print needs at least one selection".to_string()));
        }
        let mut aliases = HashSet::new();
        for selection in &self.selections {
            if !aliases.insert(selection.alias.as_str()) {
                return Err(EfapsError::Execution(format!("alias '{}' is used twice", selection.alias)));
            }
        }
        if let Some(key) = self.order.iter().find(|k| !aliases.contains(k.alias.as_str())) {
            return Err(EfapsError::Execution(format!("cannot order by unknown alias '{}'", key.alias)));
        }
        self.target.bind(cache)?;
        let bases: Vec<(Arc<Type>, Arc<SqlTable>)> = match &self.target {
            InstanceSet::Query(query) => query
                .groups
                .iter()
                .map(|g| (Arc::clone(&g.base), Arc::clone(&g.table)))
                .collect(),
            InstanceSet::Objects(instances) => group_instances(instances, cache)?
                .into_iter()
                .map(|g| (g.base, g.table))
                .collect(),
        };
        for (base, table) in &bases {
            PrintPlan::build(base, table, &self.selections, cache)?;
        }
        self.state = StatementState::Bound;
        Ok(())
    }
    /// Runs the print once; later calls return the same rows.
    pub fn execute(&mut self, database: &Database, ctx: &ExecutionContext) -> Result<&[DataRow]> {
        if self.state == StatementState::Materialized {
            return Ok(&self.rows);
        }
        let cache = database.cache()?;
        self.bind(cache)?;
        let persistor = database.persistor()?;
        let instances = self.target.resolve(&persistor, cache)?;
        let mut printed = HashMap::with_capacity(instances.len());
        for group in group_instances(&instances, cache)? {
            self.print_group(&group, &persistor, cache, database.programs(), ctx, &mut printed)?;
        }
        self.state = StatementState::Executed;
        let mut rows: Vec<DataRow> = instances.iter().filter_map(|i| printed.remove(i)).collect();
        sort_rows(&mut rows, &self.order, ctx.locale());
        info!(instances = instances.len(), rows = rows.len(), "print executed");
        self.rows = rows;
        self.state = StatementState::Materialized;
        Ok(&self.rows)
    }
    pub fn rows(&self) -> &[DataRow] {
        &self.rows
    }
    pub fn into_rows(self) -> Vec<DataRow> {
        self.rows
    }
    fn print_group(
        &self,
        group: &InstanceGroup,
        persistor: &Persistor,
        cache: &MetadataCache,
        programs: &ProgramRegistry,
        ctx: &ExecutionContext,
        printed: &mut HashMap<Instance, DataRow>,
    ) -> Result<()> {
        let mut plan = PrintPlan::build(&group.base, &group.table, &self.selections, cache)?;
        let mut ids = RoaringTreemap::new();
        let mut requested = HashMap::with_capacity(group.instances.len());
        let mut params = Vec::with_capacity(group.instances.len());
        for instance in &group.instances {
            ids.insert(to_bitmap_id(instance.id())?);
            requested.insert(instance.id(), *instance);
            params.push(SqlValue::Integer(instance.id()));
        }
        plan.select
            .and_where(SqlWhere::in_values(ColumnRef::new(0, group.table.id_column()), params));
        let result = persistor.query(&plan.select)?;

        // follow-up queries, all batched over the group
        let locale = ctx.locale();
        let mut linked = Vec::with_capacity(plan.columns.len());
        let mut classified = HashMap::new();
        for column in &plan.columns {
            match column {
                PlannedSelect::LinkFrom(link_from) => linked.push(Some(link_from.fetch(persistor, &ids, cache, locale)?)),
                PlannedSelect::Chain(chain) => {
                    if chain.deferred() == Some(&SelectNode::Classification) && classified.is_empty() {
                        classified = ClassificationResolver::new(cache).resolve(persistor, &group.instances)?;
                    }
                    linked.push(None);
                }
            }
        }

        for row in result.rows() {
            let instance = match row.first().and_then(|id| match id {
                SqlValue::Integer(id) => requested.get(id),
                _ => None,
            }) {
                Some(instance) => *instance,
                None => continue,
            };
            if let Some(SqlValue::Integer(t)) = plan.type_index.and_then(|i| row.get(i - 1)) {
                if *t != instance.type_id() {
                    debug!(oid = %instance, stored_type = t, "instance stored with another type, skipped");
                    continue;
                }
            }
            let concrete = cache.types().get_by_id(instance.type_id())?;
            let dc = DecodeContext {
                cache,
                locale,
                concrete_type: Some(&concrete),
            };
            let mut values = Vec::with_capacity(self.selections.len());
            for ((selection, column), fetched) in self.selections.iter().zip(&plan.columns).zip(&linked) {
                let value = match (column, fetched) {
                    (PlannedSelect::LinkFrom(_), Some(fetched)) => {
                        fetched.get(&instance.id()).cloned().unwrap_or(Value::Null)
                    }
                    (PlannedSelect::Chain(chain), _) => match chain.deferred() {
                        None => chain.decode(row, &dc)?,
                        Some(SelectNode::Classification) => {
                            let classes: Vec<Value> = classified
                                .get(&instance)
                                .map(|cs| cs.iter().cloned().map(Value::Classification).collect())
                                .unwrap_or_default();
                            chain.apply(1, Value::collapse(classes), None, &dc)?
                        }
                        Some(SelectNode::Exec(program)) => {
                            let computed = programs.get(program)?.evaluate(&instance, ctx)?;
                            chain.apply(1, computed, None, &dc)?
                        }
                        Some(other) => {
                            return Err(EfapsError::Invariant(format!("'{}' is not resolved after the batch", other)));
                        }
                    },
                    (PlannedSelect::LinkFrom(_), None) => {
                        return Err(EfapsError::Invariant("link-from select was not fetched".to_string()));
                    }
                };
                values.push((selection.alias.clone(), value));
            }
            printed.insert(instance, DataRow { instance, values });
        }
        Ok(())
    }
}

// ------------- Writes -------------
/// Encoded column values per table id.
#[derive(Default)]
struct TableColumns(BTreeMap<i64, Vec<(String, SqlValue)>>);

impl TableColumns {
    fn add(&mut self, attribute: &Attribute, params: Vec<SqlValue>) -> Result<()> {
        if params.len() != attribute.columns().len() {
            return Err(EfapsError::Invariant(format!(
                "{} encoded {} values for {} columns",
                attribute.qualified_name(),
                params.len(),
                attribute.columns().len()
            )));
        }
        let entry = self.0.entry(attribute.table()).or_default();
        for (column, value) in attribute.columns().iter().zip(params) {
            entry.push((column.clone(), value));
        }
        Ok(())
    }
    /// The given main table first, then the child tables.
    fn into_tables(mut self, main: &Arc<SqlTable>, cache: &MetadataCache) -> Result<Vec<(Arc<SqlTable>, Vec<(String, SqlValue)>)>> {
        let mut tables = vec![(Arc::clone(main), self.0.remove(&main.id()).unwrap_or_default())];
        for (table_id, values) in self.0 {
            tables.push((cache.sql_tables().get_by_id(table_id)?, values));
        }
        Ok(tables)
    }
}

fn insert_row(
    connection: &rusqlite::Connection,
    table: &SqlTable,
    leading: Option<(&str, SqlValue)>,
    values: &[(String, SqlValue)],
) -> Result<()> {
    let mut insert = SqlInsert::new(table.sql_name());
    if let Some((column, value)) = leading {
        insert.set(column, value);
    }
    for (column, value) in values {
        insert.set(column, value.clone());
    }
    let (sql, params) = insert.to_sql();
    persist::execute(connection, &sql, params)?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct InsertStatement {
    type_name: String,
    assignments: Vec<(String, Value)>,
    state: StatementState,
    instance: Option<Instance>,
}

impl InsertStatement {
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            assignments: Vec::new(),
            state: StatementState::Built,
            instance: None,
        }
    }
    pub fn from_def(def: InsertDef) -> Self {
        let mut insert = Self::new(&def.type_name);
        insert.assignments = def.assignments;
        insert
    }
    pub fn set(mut self, attribute: &str, value: Value) -> Self {
        self.assignments.push((attribute.to_string(), value));
        self
    }
    pub fn state(&self) -> StatementState {
        self.state
    }
    /// Writes the main table row, then one row per child table, in one transaction.
    pub fn execute(&mut self, database: &Database, ctx: &ExecutionContext) -> Result<Instance> {
        if let Some(instance) = self.instance {
            return Ok(instance);
        }
        let cache = database.cache()?;
        let t = database.type_by_name(&self.type_name)?;
        if t.is_abstract() {
            return Err(EfapsError::Execution(format!("abstract type {} cannot be instantiated", t.name())));
        }
        let main = cache.main_table_of(&t)?;
        let mut columns = TableColumns::default();
        let mut assigned = HashSet::new();
        for (name, value) in &self.assignments {
            let attribute = t.require_attribute(name)?;
            columns.add(attribute, attribute.attribute_type().encode(attribute, value, ctx, cache)?)?;
            assigned.insert(attribute.name().to_string());
        }
        for attribute in t.attributes().filter(|a| a.attribute_type().is_audit() && !assigned.contains(a.name())) {
            columns.add(attribute, attribute.attribute_type().encode(attribute, &Value::Null, ctx, cache)?)?;
        }
        self.state = StatementState::Bound;
        let tables = columns.into_tables(&main, cache)?;
        let type_column = main.type_column().map(|c| (c, SqlValue::Integer(t.id())));
        let mut persistor = database.persistor()?;
        let id = persistor.atomically(|connection| {
            let (main_table, main_values) = &tables[0];
            insert_row(connection, main_table, type_column, main_values)?;
            let id = connection.last_insert_rowid();
            for (table, values) in &tables[1..] {
                insert_row(connection, table, Some((table.id_column(), SqlValue::Integer(id))), values)?;
            }
            Ok(id)
        })?;
        self.state = StatementState::Executed;
        let instance = Instance::new(t.id(), id);
        info!(oid = %instance, type_name = t.name(), "instance inserted");
        self.instance = Some(instance);
        self.state = StatementState::Materialized;
        Ok(instance)
    }
}

fn exists(connection: &rusqlite::Connection, table: &SqlTable, id: i64) -> Result<bool> {
    let sql = format!(
        "SELECT {} FROM {} WHERE {} = ?",
        table.id_column(),
        table.sql_name(),
        table.id_column()
    );
    Ok(!persist::query_rows(connection, &sql, vec![SqlValue::Integer(id)])?.is_empty())
}

fn update_instance(
    persistor: &mut Persistor,
    cache: &MetadataCache,
    ctx: &ExecutionContext,
    instance: Instance,
    assignments: &[(String, Value)],
) -> Result<()> {
    let t = cache.types().get_by_id(instance.type_id())?;
    let main = cache.main_table_of(&t)?;
    let mut columns = TableColumns::default();
    let mut assigned = HashSet::new();
    for (name, value) in assignments {
        let attribute = t.require_attribute(name)?;
        let attribute_type = attribute.attribute_type();
        if attribute_type.is_audit() && !attribute_type.is_modification_audit() && !ctx.audit_override() {
            debug!(attribute = attribute.qualified_name(), "creation audit left unchanged");
            continue;
        }
        columns.add(attribute, attribute_type.encode(attribute, value, ctx, cache)?)?;
        assigned.insert(attribute.name().to_string());
    }
    for attribute in t
        .attributes()
        .filter(|a| a.attribute_type().is_modification_audit() && !assigned.contains(a.name()))
    {
        columns.add(attribute, attribute.attribute_type().encode(attribute, &Value::Null, ctx, cache)?)?;
    }
    let tables = columns.into_tables(&main, cache)?;
    persistor.atomically(|connection| {
        if !exists(connection, &main, instance.id())? {
            return Err(EfapsError::Execution(format!("instance {} does not exist", instance)));
        }
        for (table, values) in &tables {
            if values.is_empty() {
                continue;
            }
            let mut update = SqlUpdate::new(table.sql_name(), table.id_column(), instance.id());
            for (column, value) in values {
                update.set(column, value.clone());
            }
            let (sql, params) = update.to_sql();
            if persist::execute(connection, &sql, params)? == 0 {
                // child rows are created on first write
                insert_row(connection, table, Some((table.id_column(), SqlValue::Integer(instance.id()))), values)?;
            }
        }
        Ok(())
    })
}

fn delete_instance(persistor: &mut Persistor, cache: &MetadataCache, instance: Instance) -> Result<()> {
    let t = cache.types().get_by_id(instance.type_id())?;
    let main = cache.main_table_of(&t)?;
    let mut children = Vec::new();
    let child_ids: BTreeSet<i64> = t
        .attributes()
        .filter(|a| !a.attribute_type().is_computed() && a.table() != main.id())
        .map(|a| a.table())
        .collect();
    for table_id in child_ids {
        children.push(cache.sql_tables().get_by_id(table_id)?);
    }
    let mut relations = BTreeSet::new();
    for root in t.classified_by() {
        relations.insert(cache.classifications().get_by_id(*root)?.relation().clone());
    }
    persistor.atomically(|connection| {
        let id = instance.id();
        for table in &children {
            let (sql, params) = SqlDelete::new(table.sql_name(), table.id_column(), id).to_sql();
            persist::execute(connection, &sql, params)?;
        }
        for ClassificationRelation { sql_name, instance_column, .. } in &relations {
            let (sql, params) = SqlDelete::new(sql_name, instance_column, id).to_sql();
            persist::execute(connection, &sql, params)?;
        }
        let (sql, params) = SqlDelete::new(main.sql_name(), main.id_column(), id).to_sql();
        if persist::execute(connection, &sql, params)? == 0 {
            return Err(EfapsError::Execution(format!("instance {} does not exist", instance)));
        }
        Ok(())
    })
}

#[derive(Debug)]
pub struct UpdateStatement {
    target: InstanceSet,
    assignments: Vec<(String, Value)>,
    state: StatementState,
    outcome: Option<BatchOutcome>,
}

impl UpdateStatement {
    pub fn new(target: InstanceSet) -> Self {
        Self {
            target,
            assignments: Vec::new(),
            state: StatementState::Built,
            outcome: None,
        }
    }
    pub fn from_def(def: UpdateDef) -> Self {
        let mut update = Self::new(InstanceSet::from_def(def.target));
        update.assignments = def.assignments;
        update
    }
    pub fn set(mut self, attribute: &str, value: Value) -> Self {
        self.assignments.push((attribute.to_string(), value));
        self
    }
    pub fn state(&self) -> StatementState {
        self.state
    }
    /// Updates the instances one after the other; a failing instance does not stop the rest.
    pub fn execute(&mut self, database: &Database, ctx: &ExecutionContext) -> Result<&BatchOutcome> {
        if self.outcome.is_none() {
            if self.assignments.is_empty() {
                return Err(EfapsError::Execution("an update needs at least one assignment".to_string()));
            }
            let cache = database.cache()?;
            self.target.bind(cache)?;
            self.state = StatementState::Bound;
            let mut persistor = database.persistor()?;
            let instances = self.target.resolve(&persistor, cache)?;
            let mut outcome = BatchOutcome::default();
            for instance in instances {
                let result = update_instance(&mut persistor, cache, ctx, instance, &self.assignments);
                outcome.record(instance, result, "update");
            }
            self.state = StatementState::Executed;
            info!(succeeded = outcome.succeeded.len(), failed = outcome.failed.len(), "update executed");
            self.outcome = Some(outcome);
            self.state = StatementState::Materialized;
        }
        self.outcome
            .as_ref()
            .ok_or_else(|| EfapsError::Invariant("update has no outcome".to_string()))
    }
    pub fn into_outcome(self) -> Option<BatchOutcome> {
        self.outcome
    }
}

#[derive(Debug)]
pub struct DeleteStatement {
    target: InstanceSet,
    state: StatementState,
    outcome: Option<BatchOutcome>,
}

impl DeleteStatement {
    pub fn new(target: InstanceSet) -> Self {
        Self {
            target,
            state: StatementState::Built,
            outcome: None,
        }
    }
    pub fn from_def(def: DeleteDef) -> Self {
        Self::new(InstanceSet::from_def(def.target))
    }
    pub fn state(&self) -> StatementState {
        self.state
    }
    pub fn execute(&mut self, database: &Database) -> Result<&BatchOutcome> {
        if self.outcome.is_none() {
            let cache = database.cache()?;
            self.target.bind(cache)?;
            self.state = StatementState::Bound;
            let mut persistor = database.persistor()?;
            let instances = self.target.resolve(&persistor, cache)?;
            let mut outcome = BatchOutcome::default();
            for instance in instances {
                let result = delete_instance(&mut persistor, cache, instance);
                outcome.record(instance, result, "delete");
            }
            self.state = StatementState::Executed;
            info!(succeeded = outcome.succeeded.len(), failed = outcome.failed.len(), "delete executed");
            self.outcome = Some(outcome);
            self.state = StatementState::Materialized;
        }
        self.outcome
            .as_ref()
            .ok_or_else(|| EfapsError::Invariant("delete has no outcome".to_string()))
    }
    pub fn into_outcome(self) -> Option<BatchOutcome> {
        self.outcome
    }
}

// ------------- Engine -------------
#[derive(Debug)]
pub enum StatementResult {
    Rows(Vec<DataRow>),
    Inserted(Instance),
    Batch(BatchOutcome),
}

/// Parses EQL text and runs it against a database.
pub struct Engine<'db> {
    database: &'db Database,
}

impl<'db> Engine<'db> {
    pub fn new(database: &'db Database) -> Self {
        Self { database }
    }
    pub fn execute(&self, text: &str, ctx: &ExecutionContext) -> Result<StatementResult> {
        let statement = eql::parse(text)?;
        debug!(statement = text, "statement parsed");
        Ok(match statement {
            EqlStatement::Print(def) => {
                let mut print = PrintStatement::from_def(def);
                print.execute(self.database, ctx)?;
                StatementResult::Rows(print.into_rows())
            }
            EqlStatement::Insert(def) => StatementResult::Inserted(InsertStatement::from_def(def).execute(self.database, ctx)?),
            EqlStatement::Update(def) => {
                let mut update = UpdateStatement::from_def(def);
                update.execute(self.database, ctx)?;
                StatementResult::Batch(update.into_outcome().unwrap_or_default())
            }
            EqlStatement::Delete(def) => {
                let mut delete = DeleteStatement::from_def(def);
                delete.execute(self.database)?;
                StatementResult::Batch(delete.into_outcome().unwrap_or_default())
            }
        })
    }
    /// Runs a print statement and returns its rows.
    pub fn print(&self, text: &str, ctx: &ExecutionContext) -> Result<Vec<DataRow>> {
        match self.execute(text, ctx)? {
            StatementResult::Rows(rows) => Ok(rows),
            _ => Err(EfapsError::Execution(format!("'{}' is not a print statement", text))),
        }
    }
}
