// used for timestamps in the database
use chrono::{NaiveDate, NaiveDateTime};
// used for decimal numbers
use bigdecimal::{BigDecimal, ToPrimitive};
use rusqlite::types::Value as SqlValue;
use uuid::Uuid;

// used when parsing a string to a decimal
use std::str::FromStr;
// used to print out readable forms of a data type
use std::fmt;
use std::cmp::Ordering;

use crate::cache::MetadataCache;
use crate::construct::Attribute;
use crate::context::ExecutionContext;
use crate::error::{EfapsError, Result};
use crate::value::{Instance, Locale, MASKED, RateValue, UomValue, Value};

pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const DATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";
const PASSWORD_SCHEME: &str = "$blake3$";

/// Every kind of attribute a type can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    String,
    Integer,
    Long,
    Decimal,
    Rate,
    Boolean,
    Date,
    DateTime,
    Blob,
    Link,
    PersonLink,
    CreatorLink,
    ModifierLink,
    Created,
    Modified,
    StatusLink,
    TypeLink,
    Uom,
    Password,
    MultiValue,
    Oid,
    FileLength,
}

const ALL: [AttributeType; 22] = [
    AttributeType::String,
    AttributeType::Integer,
    AttributeType::Long,
    AttributeType::Decimal,
    AttributeType::Rate,
    AttributeType::Boolean,
    AttributeType::Date,
    AttributeType::DateTime,
    AttributeType::Blob,
    AttributeType::Link,
    AttributeType::PersonLink,
    AttributeType::CreatorLink,
    AttributeType::ModifierLink,
    AttributeType::Created,
    AttributeType::Modified,
    AttributeType::StatusLink,
    AttributeType::TypeLink,
    AttributeType::Uom,
    AttributeType::Password,
    AttributeType::MultiValue,
    AttributeType::Oid,
    AttributeType::FileLength,
];

impl AttributeType {
    pub const fn uid(&self) -> u8 {
        match self {
            AttributeType::String => 1,
            AttributeType::Integer => 2,
            AttributeType::Long => 3,
            AttributeType::Decimal => 4,
            AttributeType::Rate => 5,
            AttributeType::Boolean => 6,
            AttributeType::Date => 7,
            AttributeType::DateTime => 8,
            AttributeType::Blob => 9,
            AttributeType::Link => 10,
            AttributeType::PersonLink => 11,
            AttributeType::CreatorLink => 12,
            AttributeType::ModifierLink => 13,
            AttributeType::Created => 14,
            AttributeType::Modified => 15,
            AttributeType::StatusLink => 16,
            AttributeType::TypeLink => 17,
            AttributeType::Uom => 18,
            AttributeType::Password => 19,
            AttributeType::MultiValue => 20,
            AttributeType::Oid => 21,
            AttributeType::FileLength => 22,
        }
    }
    pub const fn data_type(&self) -> &'static str {
        match self {
            AttributeType::String => "String",
            AttributeType::Integer => "Integer",
            AttributeType::Long => "Long",
            AttributeType::Decimal => "Decimal",
            AttributeType::Rate => "Rate",
            AttributeType::Boolean => "Boolean",
            AttributeType::Date => "Date",
            AttributeType::DateTime => "DateTime",
            AttributeType::Blob => "Blob",
            AttributeType::Link => "Link",
            AttributeType::PersonLink => "PersonLink",
            AttributeType::CreatorLink => "CreatorLink",
            AttributeType::ModifierLink => "ModifierLink",
            AttributeType::Created => "Created",
            AttributeType::Modified => "Modified",
            AttributeType::StatusLink => "StatusLink",
            AttributeType::TypeLink => "TypeLink",
            AttributeType::Uom => "Uom",
            AttributeType::Password => "Password",
            AttributeType::MultiValue => "MultiValue",
            AttributeType::Oid => "Oid",
            AttributeType::FileLength => "FileLength",
        }
    }
    pub fn all() -> &'static [AttributeType] {
        &ALL
    }
    /// Number of SQL columns the variant reads and writes.
    pub const fn arity(&self) -> usize {
        match self {
            AttributeType::Uom | AttributeType::Rate | AttributeType::Oid => 2,
            _ => 1,
        }
    }
    pub const fn is_computed(&self) -> bool {
        matches!(self, AttributeType::Oid | AttributeType::FileLength)
    }
    /// Variants whose value comes from the execution context on write.
    pub const fn is_audit(&self) -> bool {
        matches!(
            self,
            AttributeType::CreatorLink
                | AttributeType::ModifierLink
                | AttributeType::Created
                | AttributeType::Modified
        )
    }
    /// Audit variants that are refreshed on every update, not only on insert.
    pub const fn is_modification_audit(&self) -> bool {
        matches!(self, AttributeType::ModifierLink | AttributeType::Modified)
    }
    /// Variants that point at an instance of another type.
    pub const fn is_link(&self) -> bool {
        matches!(
            self,
            AttributeType::Link
                | AttributeType::PersonLink
                | AttributeType::CreatorLink
                | AttributeType::ModifierLink
        )
    }
    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            AttributeType::Integer
                | AttributeType::Long
                | AttributeType::Decimal
                | AttributeType::Rate
                | AttributeType::Uom
                | AttributeType::FileLength
        )
    }

    pub fn decode(&self, attribute: &Attribute, raw: &[SqlValue], cache: &MetadataCache) -> Result<Value> {
        if raw.len() != self.arity() {
            return Err(EfapsError::AttributeDecode(format!(
                "{} expects {} column(s), got {}",
                attribute.qualified_name(),
                self.arity(),
                raw.len()
            )));
        }
        let name = attribute.qualified_name();
        let value = match self {
            AttributeType::String => opt(raw_text(&raw[0], name)?, Value::Text),
            AttributeType::Integer => match raw_i64(&raw[0], name)? {
                None => Value::Null,
                Some(i) => Value::Integer(i64::from(narrow_i32(i, name)?)),
            },
            AttributeType::Long | AttributeType::FileLength => opt(raw_i64(&raw[0], name)?, Value::Integer),
            AttributeType::Decimal => opt(raw_decimal(&raw[0], name)?, Value::Decimal),
            AttributeType::Rate => match (raw_decimal(&raw[0], name)?, raw_decimal(&raw[1], name)?) {
                (None, None) => Value::Null,
                (Some(n), Some(d)) => Value::Rate(RateValue::new(n, d)),
                _ => return Err(decode_error(name, "rate needs both numerator and denominator")),
            },
            AttributeType::Boolean => match &raw[0] {
                SqlValue::Null => Value::Null,
                SqlValue::Integer(i) => Value::Boolean(*i != 0),
                SqlValue::Text(s) => Value::Boolean(parse_bool(s).ok_or_else(|| decode_error(name, s))?),
                other => return Err(decode_error(name, &format!("{:?}", other))),
            },
            AttributeType::Date => match raw_text(&raw[0], name)? {
                None => Value::Null,
                Some(s) => Value::Date(parse_date(&s).ok_or_else(|| decode_error(name, &s))?),
            },
            AttributeType::DateTime | AttributeType::Created | AttributeType::Modified => {
                match raw_text(&raw[0], name)? {
                    None => Value::Null,
                    Some(s) => Value::DateTime(parse_date_time(&s).ok_or_else(|| decode_error(name, &s))?),
                }
            }
            AttributeType::Blob => match &raw[0] {
                SqlValue::Null => Value::Null,
                SqlValue::Blob(b) => Value::Blob(b.clone()),
                SqlValue::Text(s) => Value::Blob(s.as_bytes().to_vec()),
                other => return Err(decode_error(name, &format!("{:?}", other))),
            },
            AttributeType::Link
            | AttributeType::PersonLink
            | AttributeType::CreatorLink
            | AttributeType::ModifierLink => match raw_i64(&raw[0], name)? {
                // a missing foreign key just means there is no link
                None => Value::Null,
                Some(id) => Value::Instance(Instance::new(link_target(attribute)?, id)),
            },
            AttributeType::StatusLink => match raw_i64(&raw[0], name)? {
                None => Value::Null,
                Some(id) => Value::Status(cache.statuses().get_by_id(id)?),
            },
            AttributeType::TypeLink => match raw_i64(&raw[0], name)? {
                None => Value::Null,
                Some(id) => Value::Type(cache.types().get_by_id(id)?),
            },
            AttributeType::Uom => match (raw_decimal(&raw[0], name)?, raw_i64(&raw[1], name)?) {
                (None, None) => Value::Null,
                (Some(magnitude), Some(uom_id)) => {
                    Value::Uom(UomValue::new(magnitude, cache.uoms().get_by_id(uom_id)?))
                }
                (Some(_), None) => return Err(decode_error(name, "magnitude without unit")),
                (None, Some(_)) => return Err(decode_error(name, "unit without magnitude")),
            },
            AttributeType::Password => opt(raw_text(&raw[0], name)?, Value::Digest),
            AttributeType::MultiValue => match raw_text(&raw[0], name)? {
                None => Value::Null,
                Some(s) => {
                    let items: Vec<String> = serde_json::from_str(&s)
                        .map_err(|e| decode_error(name, &e.to_string()))?;
                    Value::List(items.into_iter().map(Value::Text).collect())
                }
            },
            AttributeType::Oid => match (raw_i64(&raw[0], name)?, raw_i64(&raw[1], name)?) {
                (Some(type_id), Some(id)) => Value::Text(Instance::new(type_id, id).oid()),
                (None, Some(id)) => Value::Text(Instance::new(attribute.parent_type(), id).oid()),
                _ => Value::Null,
            },
        };
        Ok(value)
    }

    /// Bind parameters for writing `value`. Audit variants take actor and clock
    /// from `ctx` unless `ctx` carries an audit override and a value was supplied.
    pub fn encode(
        &self,
        attribute: &Attribute,
        value: &Value,
        ctx: &ExecutionContext,
        cache: &MetadataCache,
    ) -> Result<Vec<SqlValue>> {
        if self.is_audit() && !(ctx.audit_override() && !value.is_null()) {
            let substitute = match self {
                AttributeType::CreatorLink | AttributeType::ModifierLink => Value::Integer(ctx.actor()),
                _ => Value::DateTime(ctx.now()),
            };
            return self.encode_plain(attribute, &substitute, cache);
        }
        if *self == AttributeType::Password {
            return Ok(vec![match value {
                Value::Null => SqlValue::Null,
                Value::Digest(d) => SqlValue::Text(d.clone()),
                Value::Text(plain) => SqlValue::Text(digest_password(plain)),
                other => return Err(unsupported(attribute, other)),
            }]);
        }
        self.encode_plain(attribute, value, cache)
    }

    /// Bind parameter for comparing against this attribute in a WHERE clause.
    pub fn encode_criterion(&self, attribute: &Attribute, value: &Value, cache: &MetadataCache) -> Result<Vec<SqlValue>> {
        match self {
            AttributeType::Oid => Err(EfapsError::UnsupportedAttributeOperation(format!(
                "{} cannot be used as a criterion",
                attribute.qualified_name()
            ))),
            AttributeType::FileLength => Ok(vec![to_sql_i64(attribute, value)?]),
            AttributeType::Password => Ok(vec![match value {
                Value::Digest(d) => SqlValue::Text(d.clone()),
                other => return Err(unsupported(attribute, other)),
            }]),
            _ => self.encode_plain(attribute, value, cache),
        }
    }

    fn encode_plain(&self, attribute: &Attribute, value: &Value, cache: &MetadataCache) -> Result<Vec<SqlValue>> {
        let params = match self {
            AttributeType::Oid | AttributeType::FileLength => {
                return Err(EfapsError::UnsupportedAttributeOperation(format!(
                    "{} is computed and cannot be written",
                    attribute.qualified_name()
                )));
            }
            AttributeType::String => vec![match value {
                Value::Null => SqlValue::Null,
                Value::Text(s) => SqlValue::Text(s.trim().to_string()),
                Value::Integer(i) => SqlValue::Text(i.to_string()),
                Value::Decimal(d) => SqlValue::Text(d.to_string()),
                other => return Err(unsupported(attribute, other)),
            }],
            AttributeType::Integer => match to_sql_i64(attribute, value)? {
                SqlValue::Integer(i) => vec![SqlValue::Integer(i64::from(narrow_i32(i, attribute.qualified_name())?))],
                other => vec![other],
            },
            AttributeType::Long => vec![to_sql_i64(attribute, value)?],
            AttributeType::Decimal => vec![to_sql_decimal(attribute, value)?],
            AttributeType::Rate => match value {
                Value::Null => vec![SqlValue::Null, SqlValue::Null],
                Value::Rate(r) => vec![
                    SqlValue::Text(r.numerator().to_string()),
                    SqlValue::Text(r.denominator().to_string()),
                ],
                other => vec![to_sql_decimal(attribute, other)?, SqlValue::Text("1".to_string())],
            },
            AttributeType::Boolean => vec![match value {
                Value::Null => SqlValue::Null,
                Value::Boolean(b) => SqlValue::Integer(i64::from(*b)),
                Value::Integer(i) => SqlValue::Integer(i64::from(*i != 0)),
                Value::Text(s) => match parse_bool(s) {
                    Some(b) => SqlValue::Integer(i64::from(b)),
                    None => return Err(unsupported(attribute, value)),
                },
                other => return Err(unsupported(attribute, other)),
            }],
            AttributeType::Date => vec![match value {
                Value::Null => SqlValue::Null,
                Value::Date(d) => SqlValue::Text(d.format(DATE_FORMAT).to_string()),
                Value::DateTime(d) => SqlValue::Text(d.date().format(DATE_FORMAT).to_string()),
                Value::Text(s) => match parse_date(s) {
                    Some(d) => SqlValue::Text(d.format(DATE_FORMAT).to_string()),
                    None => return Err(unsupported(attribute, value)),
                },
                other => return Err(unsupported(attribute, other)),
            }],
            AttributeType::DateTime | AttributeType::Created | AttributeType::Modified => vec![match value {
                Value::Null => SqlValue::Null,
                Value::DateTime(d) => SqlValue::Text(d.format(DATE_TIME_FORMAT).to_string()),
                Value::Date(d) => match d.and_hms_opt(0, 0, 0) {
                    Some(dt) => SqlValue::Text(dt.format(DATE_TIME_FORMAT).to_string()),
                    None => return Err(unsupported(attribute, value)),
                },
                Value::Text(s) => match parse_date_time(s) {
                    Some(d) => SqlValue::Text(d.format(DATE_TIME_FORMAT).to_string()),
                    None => return Err(unsupported(attribute, value)),
                },
                other => return Err(unsupported(attribute, other)),
            }],
            AttributeType::Blob => vec![match value {
                Value::Null => SqlValue::Null,
                Value::Blob(b) => SqlValue::Blob(b.clone()),
                Value::Text(s) => SqlValue::Blob(s.as_bytes().to_vec()),
                other => return Err(unsupported(attribute, other)),
            }],
            AttributeType::Link
            | AttributeType::PersonLink
            | AttributeType::CreatorLink
            | AttributeType::ModifierLink => vec![match value {
                Value::Null => SqlValue::Null,
                Value::Instance(i) => SqlValue::Integer(i.id()),
                Value::Integer(id) => SqlValue::Integer(*id),
                Value::Text(s) => match Instance::parse(s) {
                    Some(i) => SqlValue::Integer(i.id()),
                    None => return Err(unsupported(attribute, value)),
                },
                other => return Err(unsupported(attribute, other)),
            }],
            AttributeType::StatusLink => vec![match value {
                Value::Null => SqlValue::Null,
                Value::Status(s) => SqlValue::Integer(s.id()),
                Value::Integer(id) => SqlValue::Integer(*id),
                Value::Text(key) => SqlValue::Integer(status_by_key(attribute, key, cache)?),
                other => return Err(unsupported(attribute, other)),
            }],
            AttributeType::TypeLink => vec![match value {
                Value::Null => SqlValue::Null,
                Value::Type(t) => SqlValue::Integer(t.id()),
                Value::Integer(id) => SqlValue::Integer(*id),
                Value::Text(name) => SqlValue::Integer(cache.types().get_by_name(name)?.id()),
                other => return Err(unsupported(attribute, other)),
            }],
            AttributeType::Uom => match value {
                Value::Null => vec![SqlValue::Null, SqlValue::Null],
                Value::Uom(u) => {
                    let (magnitude, uom_id) = u.pair();
                    vec![SqlValue::Text(magnitude.to_string()), SqlValue::Integer(uom_id)]
                }
                Value::Text(s) => {
                    let (magnitude, uom_id) = uom_from_text(attribute, s, cache)?;
                    vec![SqlValue::Text(magnitude.to_string()), SqlValue::Integer(uom_id)]
                }
                other => return Err(unsupported(attribute, other)),
            },
            AttributeType::Password => vec![match value {
                Value::Null => SqlValue::Null,
                Value::Digest(d) => SqlValue::Text(d.clone()),
                other => return Err(unsupported(attribute, other)),
            }],
            AttributeType::MultiValue => vec![match value {
                Value::Null => SqlValue::Null,
                Value::List(items) => {
                    let texts: Vec<String> = items.iter().map(|v| v.to_string()).collect();
                    SqlValue::Text(serde_json::to_string(&texts)?)
                }
                Value::Text(s) => SqlValue::Text(serde_json::to_string(&[s])?),
                other => return Err(unsupported(attribute, other)),
            }],
        };
        Ok(params)
    }

    pub fn format(&self, value: &Value, locale: &Locale) -> String {
        match (self, value) {
            (_, Value::Null) => String::new(),
            (AttributeType::Password, _) => MASKED.to_string(),
            (AttributeType::Date, Value::DateTime(d)) => d.date().format(locale.date_pattern()).to_string(),
            _ => value.format(locale),
        }
    }

    pub fn compare(&self, a: &Value, b: &Value, locale: &Locale) -> Ordering {
        match self {
            AttributeType::Integer
            | AttributeType::Long
            | AttributeType::Decimal
            | AttributeType::Rate
            | AttributeType::Uom
            | AttributeType::FileLength => match (a.numeric(), b.numeric()) {
                (Some(x), Some(y)) => x.cmp(&y),
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
            },
            AttributeType::Date
            | AttributeType::DateTime
            | AttributeType::Created
            | AttributeType::Modified => a.compare(b, locale),
            _ => self.format(a, locale).cmp(&self.format(b, locale)),
        }
    }
}

impl fmt::Display for AttributeType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.data_type())
    }
}

impl FromStr for AttributeType {
    type Err = EfapsError;
    fn from_str(s: &str) -> Result<Self> {
        ALL.iter()
            .find(|t| t.data_type().eq_ignore_ascii_case(s))
            .copied()
            .ok_or_else(|| EfapsError::Invariant(format!("unknown attribute type '{}'", s)))
    }
}

// ------------- Passwords -------------
/// One-way salted digest in the form `$blake3$<salt>$<hex>`.
pub fn digest_password(plain: &str) -> String {
    let salt = Uuid::new_v4().simple().to_string();
    digest_with_salt(plain, &salt[..16])
}

fn digest_with_salt(plain: &str, salt: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(salt.as_bytes());
    hasher.update(plain.as_bytes());
    format!("{}{}${}", PASSWORD_SCHEME, salt, hasher.finalize().to_hex())
}

pub fn verify_password(plain: &str, digest: &str) -> bool {
    match digest.strip_prefix(PASSWORD_SCHEME).and_then(|rest| rest.split_once('$')) {
        Some((salt, _)) => digest_with_salt(plain, salt) == digest,
        None => false,
    }
}

// ------------- Helpers -------------
fn opt<T>(value: Option<T>, wrap: impl FnOnce(T) -> Value) -> Value {
    value.map(wrap).unwrap_or(Value::Null)
}

fn decode_error(name: &str, detail: &str) -> EfapsError {
    EfapsError::AttributeDecode(format!("{}: cannot decode {}", name, detail))
}

fn unsupported(attribute: &Attribute, value: &Value) -> EfapsError {
    EfapsError::UnsupportedAttributeOperation(format!(
        "{} ({}) does not accept {:?}",
        attribute.qualified_name(),
        attribute.attribute_type(),
        value
    ))
}

fn link_target(attribute: &Attribute) -> Result<i64> {
    attribute
        .link()
        .ok_or_else(|| EfapsError::Invariant(format!("{} has no link target", attribute.qualified_name())))
}

fn status_by_key(attribute: &Attribute, key: &str, cache: &MetadataCache) -> Result<i64> {
    let group = attribute
        .status_group()
        .ok_or_else(|| EfapsError::Invariant(format!("{} has no status group", attribute.qualified_name())))?;
    let group_type = cache.types().get_by_id(group)?;
    Ok(cache
        .statuses()
        .get_by_name(&format!("{}.{}", group_type.name(), key))?
        .id())
}

/// Reads `"12.5 kg"`; the unit must belong to the attribute's dimension.
fn uom_from_text(attribute: &Attribute, text: &str, cache: &MetadataCache) -> Result<(BigDecimal, i64)> {
    let mut pieces = text.split_whitespace();
    let (magnitude, name) = match (pieces.next(), pieces.next(), pieces.next()) {
        (Some(m), Some(n), None) => (m, n),
        _ => return Err(unsupported(attribute, &Value::Text(text.to_string()))),
    };
    let magnitude = BigDecimal::from_str(magnitude).map_err(|_| unsupported(attribute, &Value::Text(text.to_string())))?;
    let uom = cache.uoms().get_by_name(name)?;
    if attribute.dimension().is_some_and(|d| d != uom.dimension()) {
        return Err(EfapsError::UnsupportedAttributeOperation(format!(
            "{} does not measure in {}",
            attribute.qualified_name(),
            uom.name()
        )));
    }
    Ok((magnitude, uom.id()))
}

fn narrow_i32(i: i64, name: &str) -> Result<i32> {
    i32::try_from(i).map_err(|_| decode_error(name, &format!("{} is out of the integer range", i)))
}

fn raw_i64(raw: &SqlValue, name: &str) -> Result<Option<i64>> {
    match raw {
        SqlValue::Null => Ok(None),
        SqlValue::Integer(i) => Ok(Some(*i)),
        SqlValue::Real(r) => {
            if r.fract() == 0.0 && *r >= i64::MIN as f64 && *r < i64::MAX as f64 {
                Ok(Some(*r as i64))
            } else {
                Err(decode_error(name, &format!("{} as a whole number", r)))
            }
        }
        SqlValue::Text(s) => {
            let d = BigDecimal::from_str(s.trim()).map_err(|_| decode_error(name, s))?;
            if !d.is_integer() {
                return Err(decode_error(name, &format!("{} as a whole number", s)));
            }
            d.to_i64().map(Some).ok_or_else(|| decode_error(name, s))
        }
        SqlValue::Blob(_) => Err(decode_error(name, "a blob as a number")),
    }
}

fn raw_decimal(raw: &SqlValue, name: &str) -> Result<Option<BigDecimal>> {
    match raw {
        SqlValue::Null => Ok(None),
        SqlValue::Integer(i) => Ok(Some(BigDecimal::from(*i))),
        SqlValue::Real(r) => BigDecimal::from_str(&r.to_string())
            .map(Some)
            .map_err(|_| decode_error(name, &r.to_string())),
        SqlValue::Text(s) => BigDecimal::from_str(s.trim())
            .map(Some)
            .map_err(|_| decode_error(name, s)),
        SqlValue::Blob(_) => Err(decode_error(name, "a blob as a decimal")),
    }
}

fn raw_text(raw: &SqlValue, name: &str) -> Result<Option<String>> {
    match raw {
        SqlValue::Null => Ok(None),
        SqlValue::Text(s) => Ok(Some(s.clone())),
        SqlValue::Integer(i) => Ok(Some(i.to_string())),
        SqlValue::Real(r) => Ok(Some(r.to_string())),
        SqlValue::Blob(_) => Err(decode_error(name, "a blob as text")),
    }
}

fn to_sql_i64(attribute: &Attribute, value: &Value) -> Result<SqlValue> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Integer(i) => Ok(SqlValue::Integer(*i)),
        Value::Decimal(d) if d.is_integer() => d
            .to_i64()
            .map(SqlValue::Integer)
            .ok_or_else(|| unsupported(attribute, value)),
        Value::Text(s) => s
            .trim()
            .parse::<i64>()
            .map(SqlValue::Integer)
            .map_err(|_| unsupported(attribute, value)),
        other => Err(unsupported(attribute, other)),
    }
}

fn to_sql_decimal(attribute: &Attribute, value: &Value) -> Result<SqlValue> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Decimal(d) => Ok(SqlValue::Text(d.to_string())),
        Value::Integer(i) => Ok(SqlValue::Text(i.to_string())),
        Value::Text(s) => BigDecimal::from_str(s.trim())
            .map(|d| SqlValue::Text(d.to_string()))
            .map_err(|_| unsupported(attribute, value)),
        other => Err(unsupported(attribute, other)),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
        .ok()
        .or_else(|| parse_date_time(s).map(|d| d.date()))
}

pub fn parse_date_time(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, DATE_TIME_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_digest_verifies_only_the_original() {
        let digest = digest_password("secret");
        assert!(digest.starts_with(PASSWORD_SCHEME));
        assert!(verify_password("secret", &digest));
        assert!(!verify_password("Secret", &digest));
        // salted, so the same password digests differently
        assert_ne!(digest, digest_password("secret"));
    }

    #[test]
    fn integer_narrowing_rejects_fractions_and_overflow() {
        assert_eq!(raw_i64(&SqlValue::Real(42.0), "t").unwrap(), Some(42));
        assert_eq!(raw_i64(&SqlValue::Text("17.000".into()), "t").unwrap(), Some(17));
        assert!(raw_i64(&SqlValue::Real(1.5), "t").is_err());
        // 2^63 does not fit and must not clamp to i64::MAX
        assert!(raw_i64(&SqlValue::Real(9_223_372_036_854_775_808.0), "t").is_err());
        assert_eq!(raw_i64(&SqlValue::Real(-9_223_372_036_854_775_808.0), "t").unwrap(), Some(i64::MIN));
        assert!(narrow_i32(i64::from(i32::MAX) + 1, "t").is_err());
    }

    #[test]
    fn tags_round_trip_through_their_names() {
        for t in AttributeType::all() {
            assert_eq!(t.data_type().parse::<AttributeType>().unwrap(), *t);
        }
    }
}
