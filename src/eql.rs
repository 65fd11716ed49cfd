//! The EQL statement parser.
//!
//! Statements look like
//!
//! ```text
//! print query type Order where attribute[Name] like "A%"
//!     select attribute[Name] as name, linkto[Contact].attribute[Name] as contact
//!     order by name desc
//! insert type Order set Name = "A-1", Quantity = "12 kg"
//! update obj 42.7 set Name = "A-2"
//! delete list (42.7, 42.8)
//! ```
//!
//! Parsing only produces the syntax tree below; names are resolved against the
//! metadata cache when a statement is built.
use bigdecimal::BigDecimal;
use pest::Parser;
use pest::error::LineColLocation;
use pest::iterators::Pair;
use pest_derive::Parser;

use std::str::FromStr;

use crate::error::{EfapsError, Result};
use crate::select::{SelectNode, SelectPart, SelectPath};
use crate::value::{Instance, Value};

#[derive(Parser)]
#[grammar = "eql.pest"]
struct EqlParser;

#[derive(Debug, Clone, PartialEq)]
pub enum EqlStatement {
    Print(PrintDef),
    Insert(InsertDef),
    Update(UpdateDef),
    Delete(DeleteDef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrintDef {
    pub target: Target,
    pub selections: Vec<SelectionDef>,
    pub order: Vec<SortKey>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertDef {
    pub type_name: String,
    pub assignments: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateDef {
    pub target: Target,
    pub assignments: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteDef {
    pub target: Target,
}

/// The instances a statement works on.
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Objects(Vec<Instance>),
    Query(QueryDef),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryDef {
    pub types: Vec<String>,
    pub filter: Option<Filter>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Compare {
        path: SelectPath,
        op: CompareOp,
        operand: Operand,
    },
    And(Vec<Filter>),
    Or(Vec<Filter>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    NotEqual,
    Greater,
    Less,
    Like,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Value(Value),
    Values(Vec<Value>),
    Query {
        query: Box<QueryDef>,
        select: Option<SelectPath>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionDef {
    pub path: SelectPath,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub alias: String,
    pub descending: bool,
}

pub fn parse(text: &str) -> Result<EqlStatement> {
    let statement = EqlParser::parse(Rule::statement, text)
        .map_err(parse_error)?
        .next()
        .ok_or_else(|| syntax("empty statement"))?;
    let pair = significant(statement)
        .next()
        .ok_or_else(|| syntax("empty statement"))?;
    match pair.as_rule() {
        Rule::print_stmt => parse_print(pair).map(EqlStatement::Print),
        Rule::insert_stmt => parse_insert(pair).map(EqlStatement::Insert),
        Rule::update_stmt => parse_update(pair).map(EqlStatement::Update),
        Rule::delete_stmt => parse_delete(pair).map(EqlStatement::Delete),
        _ => Err(unexpected(&pair)),
    }
}

/// Parses a bare select path such as `linkto[Contact].attribute[Name]`.
pub fn parse_path(text: &str) -> Result<SelectPath> {
    let path = EqlParser::parse(Rule::path_only, text)
        .map_err(parse_error)?
        .next()
        .and_then(|p| significant(p).next())
        .ok_or_else(|| syntax("empty select path"))?;
    build_path(path)
}

fn parse_error(e: pest::error::Error<Rule>) -> EfapsError {
    let (line, col) = match e.line_col {
        LineColLocation::Pos((l, c)) => (l, c),
        LineColLocation::Span((l, c), _) => (l, c),
    };
    EfapsError::Parse {
        message: e.variant.message().to_string(),
        line: Some(line),
        col: Some(col),
    }
}

fn syntax(message: &str) -> EfapsError {
    EfapsError::Parse {
        message: message.to_string(),
        line: None,
        col: None,
    }
}

fn located(pair: &Pair<Rule>, message: String) -> EfapsError {
    let (line, col) = pair.line_col();
    EfapsError::Parse {
        message,
        line: Some(line),
        col: Some(col),
    }
}

fn unexpected(pair: &Pair<Rule>) -> EfapsError {
    located(pair, format!("unexpected {:?} '{}'", pair.as_rule(), pair.as_str()))
}

fn is_keyword(rule: Rule) -> bool {
    matches!(
        rule,
        Rule::EOI
            | Rule::kw_print
            | Rule::kw_insert
            | Rule::kw_update
            | Rule::kw_delete
            | Rule::kw_select
            | Rule::kw_type
            | Rule::kw_obj
            | Rule::kw_list
            | Rule::kw_query
            | Rule::kw_where
            | Rule::kw_and
            | Rule::kw_or
            | Rule::kw_not
            | Rule::kw_in
            | Rule::kw_like
            | Rule::kw_as
            | Rule::kw_order
            | Rule::kw_by
            | Rule::kw_asc
            | Rule::kw_desc
            | Rule::kw_set
    )
}

/// Inner pairs without keywords.
fn significant(pair: Pair<Rule>) -> impl Iterator<Item = Pair<Rule>> {
    pair.into_inner().filter(|p| !is_keyword(p.as_rule()))
}

fn parse_print(pair: Pair<Rule>) -> Result<PrintDef> {
    let mut target = None;
    let mut selections = Vec::new();
    let mut order = Vec::new();
    for part in significant(pair) {
        match part.as_rule() {
            Rule::target => target = Some(parse_target(part)?),
            Rule::selection => selections.push(parse_selection(part)?),
            Rule::order_clause => {
                for key in significant(part) {
                    order.push(parse_sort_key(key)?);
                }
            }
            _ => return Err(unexpected(&part)),
        }
    }
    Ok(PrintDef {
        target: target.ok_or_else(|| syntax("print without target"))?,
        selections,
        order,
    })
}

fn parse_insert(pair: Pair<Rule>) -> Result<InsertDef> {
    let mut type_name = None;
    let mut assignments = Vec::new();
    for part in significant(pair) {
        match part.as_rule() {
            Rule::type_name => type_name = Some(part.as_str().to_string()),
            Rule::set_clause => assignments = parse_assignments(part)?,
            _ => return Err(unexpected(&part)),
        }
    }
    Ok(InsertDef {
        type_name: type_name.ok_or_else(|| syntax("insert without type"))?,
        assignments,
    })
}

fn parse_update(pair: Pair<Rule>) -> Result<UpdateDef> {
    let mut target = None;
    let mut assignments = Vec::new();
    for part in significant(pair) {
        match part.as_rule() {
            Rule::target => target = Some(parse_target(part)?),
            Rule::set_clause => assignments = parse_assignments(part)?,
            _ => return Err(unexpected(&part)),
        }
    }
    Ok(UpdateDef {
        target: target.ok_or_else(|| syntax("update without target"))?,
        assignments,
    })
}

fn parse_delete(pair: Pair<Rule>) -> Result<DeleteDef> {
    let target = significant(pair)
        .next()
        .ok_or_else(|| syntax("delete without target"))?;
    Ok(DeleteDef {
        target: parse_target(target)?,
    })
}

fn parse_target(pair: Pair<Rule>) -> Result<Target> {
    let inner = significant(pair)
        .next()
        .ok_or_else(|| syntax("missing target"))?;
    match inner.as_rule() {
        Rule::obj_target | Rule::list_target => {
            let mut instances = Vec::new();
            for oid in significant(inner) {
                instances.push(
                    Instance::parse(oid.as_str())
                        .ok_or_else(|| located(&oid, format!("'{}' is not an OID", oid.as_str())))?,
                );
            }
            Ok(Target::Objects(instances))
        }
        Rule::query => parse_query(inner).map(Target::Query),
        _ => Err(unexpected(&inner)),
    }
}

fn parse_query(pair: Pair<Rule>) -> Result<QueryDef> {
    let mut types = Vec::new();
    let mut filter = None;
    for part in significant(pair) {
        match part.as_rule() {
            Rule::type_name => types.push(part.as_str().to_string()),
            Rule::where_clause => {
                let expr = significant(part)
                    .next()
                    .ok_or_else(|| syntax("empty where clause"))?;
                filter = Some(parse_or(expr)?);
            }
            _ => return Err(unexpected(&part)),
        }
    }
    Ok(QueryDef { types, filter })
}

fn parse_or(pair: Pair<Rule>) -> Result<Filter> {
    let mut alternatives = Vec::new();
    for and in significant(pair) {
        alternatives.push(parse_and(and)?);
    }
    Ok(match alternatives.len() {
        1 => alternatives.remove(0),
        _ => Filter::Or(alternatives),
    })
}

fn parse_and(pair: Pair<Rule>) -> Result<Filter> {
    let mut terms = Vec::new();
    for term in significant(pair) {
        let inner = significant(term)
            .next()
            .ok_or_else(|| syntax("empty condition"))?;
        terms.push(match inner.as_rule() {
            Rule::or_expr => parse_or(inner)?,
            Rule::comparison => parse_comparison(inner)?,
            _ => return Err(unexpected(&inner)),
        });
    }
    Ok(match terms.len() {
        1 => terms.remove(0),
        _ => Filter::And(terms),
    })
}

fn parse_comparison(pair: Pair<Rule>) -> Result<Filter> {
    let mut parts = significant(pair);
    let path = build_path(parts.next().ok_or_else(|| syntax("condition without path"))?)?;
    let op_pair = parts.next().ok_or_else(|| syntax("condition without operator"))?;
    let operand_pair = parts.next().ok_or_else(|| syntax("condition without operand"))?;
    let op = match op_pair.as_rule() {
        Rule::list_op if op_pair.as_str().to_lowercase().starts_with("not") => CompareOp::NotIn,
        Rule::list_op => CompareOp::In,
        Rule::compare_op => match op_pair.as_str().to_lowercase().as_str() {
            "==" => CompareOp::Equal,
            "!=" => CompareOp::NotEqual,
            ">" => CompareOp::Greater,
            "<" => CompareOp::Less,
            "like" => CompareOp::Like,
            _ => return Err(unexpected(&op_pair)),
        },
        _ => return Err(unexpected(&op_pair)),
    };
    let operand = match operand_pair.as_rule() {
        Rule::value => Operand::Value(parse_value(operand_pair)?),
        Rule::value_list => {
            let mut values = Vec::new();
            for v in significant(operand_pair) {
                values.push(parse_value(v)?);
            }
            Operand::Values(values)
        }
        Rule::subquery => {
            let mut query = None;
            let mut select = None;
            for part in significant(operand_pair) {
                match part.as_rule() {
                    Rule::query => query = Some(parse_query(part)?),
                    Rule::path => select = Some(build_path(part)?),
                    _ => return Err(unexpected(&part)),
                }
            }
            Operand::Query {
                query: Box::new(query.ok_or_else(|| syntax("nested query without types"))?),
                select,
            }
        }
        _ => return Err(unexpected(&operand_pair)),
    };
    Ok(Filter::Compare { path, op, operand })
}

fn parse_selection(pair: Pair<Rule>) -> Result<SelectionDef> {
    let mut parts = significant(pair);
    let path = build_path(parts.next().ok_or_else(|| syntax("empty selection"))?)?;
    let alias = match parts.next() {
        Some(alias) => alias.as_str().to_string(),
        None => path.to_string(),
    };
    Ok(SelectionDef { path, alias })
}

fn parse_sort_key(pair: Pair<Rule>) -> Result<SortKey> {
    let mut alias = None;
    let mut descending = false;
    for part in significant(pair) {
        match part.as_rule() {
            Rule::alias => alias = Some(part.as_str().to_string()),
            Rule::direction => descending = part.as_str().eq_ignore_ascii_case("desc"),
            _ => return Err(unexpected(&part)),
        }
    }
    Ok(SortKey {
        alias: alias.ok_or_else(|| syntax("order by without alias"))?,
        descending,
    })
}

fn parse_assignments(pair: Pair<Rule>) -> Result<Vec<(String, Value)>> {
    let mut assignments = Vec::new();
    for assignment in significant(pair) {
        let mut parts = significant(assignment);
        let name = parts.next().ok_or_else(|| syntax("assignment without attribute"))?;
        let value = parts.next().ok_or_else(|| syntax("assignment without value"))?;
        assignments.push((name.as_str().to_string(), parse_value(value)?));
    }
    Ok(assignments)
}

fn parse_value(pair: Pair<Rule>) -> Result<Value> {
    let literal = significant(pair).next().ok_or_else(|| syntax("missing value"))?;
    Ok(match literal.as_rule() {
        Rule::string => {
            let raw = literal
                .clone()
                .into_inner()
                .next()
                .map(|p| p.as_str())
                .unwrap_or_default();
            Value::Text(raw.replace("\"\"", "\""))
        }
        Rule::number if literal.as_str().contains('.') => Value::Decimal(
            BigDecimal::from_str(literal.as_str()).map_err(|e| located(&literal, e.to_string()))?,
        ),
        Rule::number => Value::Integer(
            literal
                .as_str()
                .parse()
                .map_err(|e: std::num::ParseIntError| located(&literal, e.to_string()))?,
        ),
        Rule::null_lit => Value::Null,
        Rule::true_lit => Value::Boolean(true),
        Rule::false_lit => Value::Boolean(false),
        _ => return Err(unexpected(&literal)),
    })
}

fn build_path(pair: Pair<Rule>) -> Result<SelectPath> {
    let mut parts = Vec::new();
    let mut nodes = Vec::new();
    for part in pair.into_inner() {
        let join = match part.as_rule() {
            Rule::linkto_part => Some(SelectPart::LinkTo(first_text(&part)?)),
            Rule::linkfrom_part => {
                let mut names = part.clone().into_inner().map(|p| p.as_str().to_string());
                match (names.next(), names.next()) {
                    (Some(type_name), Some(attribute)) => Some(SelectPart::LinkFrom { type_name, attribute }),
                    _ => return Err(unexpected(&part)),
                }
            }
            _ => None,
        };
        if let Some(join) = join {
            if !nodes.is_empty() {
                return Err(located(&part, format!("'{}' must come before the value selects", join)));
            }
            parts.push(join);
            continue;
        }
        nodes.push(match part.as_rule() {
            Rule::attribute_part => SelectNode::Attribute(first_text(&part)?),
            Rule::format_part => SelectNode::Format(first_text(&part)?),
            Rule::exec_part => SelectNode::Exec(first_text(&part)?),
            Rule::keyword_part => match part.as_str().to_lowercase().as_str() {
                "oid" => SelectNode::Oid,
                "id" => SelectNode::Id,
                "instance" => SelectNode::Instance,
                "type" => SelectNode::Type,
                "status" => SelectNode::Status,
                "classification" => SelectNode::Classification,
                "label" => SelectNode::Label,
                "name" => SelectNode::Name,
                "key" => SelectNode::Key,
                "uuid" => SelectNode::Uuid,
                "uom" => SelectNode::UomName,
                "base" => SelectNode::Base,
                "value" => SelectNode::Magnitude,
                "length" => SelectNode::Length,
                _ => return Err(unexpected(&part)),
            },
            _ => return Err(unexpected(&part)),
        });
    }
    SelectPath::new(parts, nodes)
}

fn first_text(pair: &Pair<Rule>) -> Result<String> {
    pair.clone()
        .into_inner()
        .next()
        .map(|p| p.as_str().trim().to_string())
        .ok_or_else(|| unexpected(pair))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_are_case_insensitive() {
        let statement = parse("PRINT obj 12.3 SELECT Attribute[Name] AS n").unwrap();
        match statement {
            EqlStatement::Print(print) => {
                assert_eq!(print.target, Target::Objects(vec![Instance::new(12, 3)]));
                assert_eq!(print.selections[0].alias, "n");
            }
            other => panic!("expected print, got {:?}", other),
        }
    }

    #[test]
    fn alias_defaults_to_path() {
        let statement = parse("print obj 1.1 select linkto[Contact].attribute[Name]").unwrap();
        let EqlStatement::Print(print) = statement else {
            panic!("expected print")
        };
        assert_eq!(print.selections[0].alias, "linkto[Contact].attribute[Name]");
    }

    #[test]
    fn quoted_strings_unescape() {
        let statement = parse(r#"insert type Order set Name = "say ""hi""""#).unwrap();
        let EqlStatement::Insert(insert) = statement else {
            panic!("expected insert")
        };
        assert_eq!(insert.assignments[0].1, Value::Text("say \"hi\"".to_string()));
    }

    #[test]
    fn errors_carry_position() {
        match parse("print obj 1.1\nselect ") {
            Err(EfapsError::Parse { line, .. }) => assert_eq!(line, Some(2)),
            other => panic!("expected parse error, got {:?}", other),
        }
    }

    #[test]
    fn join_after_node_is_rejected() {
        assert!(parse_path("attribute[Contact].linkto[Contact].attribute[Name]").is_err());
    }
}
