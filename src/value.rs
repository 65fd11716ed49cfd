// used for decimal numbers
use bigdecimal::{BigDecimal, RoundingMode};
// used for dates in the database
use chrono::{NaiveDate, NaiveDateTime};
use lazy_static::lazy_static;
use regex::Regex;
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use uuid::Uuid;

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::construct::{Classification, Status, Type, Uom};

lazy_static! {
    static ref OID: Regex = Regex::new(r"^(\d+)\.(\d+)$").unwrap();
}

/// Smallest number of fractional digits a divided rate is normalized to.
pub const RATE_MIN_SCALE: i64 = 2;

/// Shown and serialized in place of a password digest.
pub const MASKED: &str = "********";

// ------------- Instance -------------
/// One persisted business object, identified by its type and its id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Instance {
    type_id: i64,
    id: i64,
}
impl Instance {
    pub fn new(type_id: i64, id: i64) -> Self {
        Self { type_id, id }
    }
    pub fn type_id(&self) -> i64 {
        self.type_id
    }
    pub fn id(&self) -> i64 {
        self.id
    }
    pub fn oid(&self) -> String {
        format!("{}.{}", self.type_id, self.id)
    }
    /// Parses the `type.id` form. Anything else yields `None`.
    pub fn parse(oid: &str) -> Option<Instance> {
        let captures = OID.captures(oid.trim())?;
        let type_id = captures.get(1)?.as_str().parse().ok()?;
        let id = captures.get(2)?.as_str().parse().ok()?;
        Some(Instance::new(type_id, id))
    }
}
impl fmt::Display for Instance {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.type_id, self.id)
    }
}

// ------------- Compound values -------------
#[derive(Debug, Clone)]
pub struct UomValue {
    magnitude: BigDecimal,
    uom: Arc<Uom>,
}
impl UomValue {
    pub fn new(magnitude: BigDecimal, uom: Arc<Uom>) -> Self {
        Self { magnitude, uom }
    }
    pub fn magnitude(&self) -> &BigDecimal {
        &self.magnitude
    }
    pub fn uom(&self) -> &Arc<Uom> {
        &self.uom
    }
    pub fn uom_id(&self) -> i64 {
        self.uom.id()
    }
    /// The magnitude expressed in the base unit of the dimension.
    pub fn base(&self) -> BigDecimal {
        self.uom.to_base(&self.magnitude)
    }
    /// Always exactly (magnitude, unit id).
    pub fn pair(&self) -> (BigDecimal, i64) {
        (self.magnitude.clone(), self.uom.id())
    }
}
impl PartialEq for UomValue {
    fn eq(&self, other: &Self) -> bool {
        self.magnitude == other.magnitude && self.uom.id() == other.uom.id()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RateValue {
    numerator: BigDecimal,
    denominator: BigDecimal,
}
impl RateValue {
    pub fn new(numerator: BigDecimal, denominator: BigDecimal) -> Self {
        Self { numerator, denominator }
    }
    pub fn numerator(&self) -> &BigDecimal {
        &self.numerator
    }
    pub fn denominator(&self) -> &BigDecimal {
        &self.denominator
    }
    /// Numerator divided by denominator. The result carries the larger of the two
    /// operand scales (at least `RATE_MIN_SCALE`) and is rounded up to it.
    pub fn quotient(&self) -> Option<BigDecimal> {
        if self.denominator == BigDecimal::from(0) {
            return None;
        }
        let (_, numerator_scale) = self.numerator.as_bigint_and_exponent();
        let (_, denominator_scale) = self.denominator.as_bigint_and_exponent();
        let scale = numerator_scale.max(denominator_scale).max(RATE_MIN_SCALE);
        Some((&self.numerator / &self.denominator).with_scale_round(scale, RoundingMode::Up))
    }
}

// ------------- Locale -------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locale {
    tag: String,
    decimal_separator: char,
    grouping_separator: Option<char>,
    date_pattern: String,
    date_time_pattern: String,
    true_label: String,
    false_label: String,
}
impl Locale {
    pub fn from_tag(tag: &str) -> Locale {
        let language = tag.split(['-', '_']).next().unwrap_or("en").to_lowercase();
        let (decimal_separator, grouping_separator, date_pattern, date_time_pattern, yes, no) =
            match language.as_str() {
                "de" => (',', Some('.'), "%d.%m.%Y", "%d.%m.%Y %H:%M", "ja", "nein"),
                "es" => (',', Some('.'), "%d/%m/%Y", "%d/%m/%Y %H:%M", "sí", "no"),
                _ => ('.', Some(','), "%Y-%m-%d", "%Y-%m-%d %H:%M", "true", "false"),
            };
        Locale {
            tag: tag.to_string(),
            decimal_separator,
            grouping_separator,
            date_pattern: date_pattern.to_string(),
            date_time_pattern: date_time_pattern.to_string(),
            true_label: yes.to_string(),
            false_label: no.to_string(),
        }
    }
    pub fn tag(&self) -> &str {
        &self.tag
    }
    pub fn date_pattern(&self) -> &str {
        &self.date_pattern
    }
    pub fn date_time_pattern(&self) -> &str {
        &self.date_time_pattern
    }
    pub fn boolean_label(&self, b: bool) -> &str {
        if b { &self.true_label } else { &self.false_label }
    }
    pub fn format_decimal(&self, decimal: &BigDecimal) -> String {
        self.format_number(decimal, true)
    }
    pub fn format_number(&self, decimal: &BigDecimal, grouping: bool) -> String {
        let plain = decimal.to_string();
        let (sign, digits) = match plain.strip_prefix('-') {
            Some(rest) => ("-", rest),
            None => ("", plain.as_str()),
        };
        let (integral, fraction) = match digits.split_once('.') {
            Some((i, f)) => (i, Some(f)),
            None => (digits, None),
        };
        let mut grouped = String::new();
        let len = integral.len();
        for (i, c) in integral.chars().enumerate() {
            if i > 0 && (len - i) % 3 == 0 {
                if let (true, Some(g)) = (grouping, self.grouping_separator) {
                    grouped.push(g);
                }
            }
            grouped.push(c);
        }
        match fraction {
            Some(f) => format!("{sign}{grouped}{}{f}", self.decimal_separator),
            None => format!("{sign}{grouped}"),
        }
    }
}
impl Default for Locale {
    fn default() -> Self {
        Locale::from_tag("en")
    }
}

// ------------- Value -------------
/// A typed business value as produced by decoding SQL columns.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Text(String),
    Integer(i64),
    Decimal(BigDecimal),
    Boolean(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Blob(Vec<u8>),
    Instance(Instance),
    Type(Arc<Type>),
    Status(Arc<Status>),
    Classification(Arc<Classification>),
    Uom(UomValue),
    Rate(RateValue),
    Digest(String),
    Uuid(Uuid),
    List(Vec<Value>),
}

impl Value {
    /// Zero values give `Null`, a single value stays scalar, anything more becomes a `List`.
    pub fn collapse(mut values: Vec<Value>) -> Value {
        match values.len() {
            0 => Value::Null,
            1 => values.remove(0),
            _ => Value::List(values),
        }
    }
    pub fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }
    pub fn decimal(s: &str) -> Option<Value> {
        BigDecimal::from_str(s).ok().map(Value::Decimal)
    }
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }
    pub fn as_decimal(&self) -> Option<&BigDecimal> {
        match self {
            Value::Decimal(d) => Some(d),
            _ => None,
        }
    }
    pub fn as_instance(&self) -> Option<Instance> {
        match self {
            Value::Instance(i) => Some(*i),
            _ => None,
        }
    }
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }
    /// Numeric view used for ordering.
    pub fn numeric(&self) -> Option<BigDecimal> {
        match self {
            Value::Integer(i) => Some(BigDecimal::from(*i)),
            Value::Decimal(d) => Some(d.clone()),
            Value::Rate(r) => r.quotient(),
            Value::Uom(u) => Some(u.base()),
            _ => None,
        }
    }
    pub fn format(&self, locale: &Locale) -> String {
        match self {
            Value::Null => String::new(),
            Value::Text(s) => s.clone(),
            Value::Integer(i) => locale.format_decimal(&BigDecimal::from(*i)),
            Value::Decimal(d) => locale.format_decimal(d),
            Value::Boolean(b) => locale.boolean_label(*b).to_string(),
            Value::Date(d) => d.format(locale.date_pattern()).to_string(),
            Value::DateTime(d) => d.format(locale.date_time_pattern()).to_string(),
            Value::Blob(b) => format!("<{} bytes>", b.len()),
            Value::Instance(i) => i.oid(),
            Value::Type(t) => t.label().to_string(),
            Value::Status(s) => s.label().to_string(),
            Value::Classification(c) => c.label().to_string(),
            Value::Uom(u) => format!("{} {}", locale.format_decimal(u.magnitude()), u.uom().name()),
            Value::Rate(r) => r.quotient().map(|q| locale.format_decimal(&q)).unwrap_or_default(),
            Value::Digest(_) => MASKED.to_string(),
            Value::Uuid(u) => u.to_string(),
            Value::List(l) => l.iter().map(|v| v.format(locale)).collect::<Vec<_>>().join(", "),
        }
    }
    /// Numbers compare numerically, dates chronologically, everything else by formatted text.
    pub fn compare(&self, other: &Value, locale: &Locale) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            _ => match (self.numeric(), other.numeric()) {
                (Some(a), Some(b)) => a.cmp(&b),
                _ => self.format(locale).cmp(&other.format(locale)),
            },
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Decimal(a), Value::Decimal(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            (Value::Instance(a), Value::Instance(b)) => a == b,
            (Value::Type(a), Value::Type(b)) => a.id() == b.id(),
            (Value::Status(a), Value::Status(b)) => a.id() == b.id(),
            (Value::Classification(a), Value::Classification(b)) => a.id() == b.id(),
            (Value::Uom(a), Value::Uom(b)) => a == b,
            (Value::Rate(a), Value::Rate(b)) => a == b,
            (Value::Digest(a), Value::Digest(b)) => a == b,
            (Value::Uuid(a), Value::Uuid(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Date(d) => write!(f, "{}", d),
            Value::DateTime(d) => write!(f, "{}", d),
            Value::Type(t) => write!(f, "{}", t.name()),
            Value::Status(s) => write!(f, "{}", s.key()),
            Value::Classification(c) => write!(f, "{}", c.name()),
            Value::Digest(d) => write!(f, "{}", d),
            Value::List(l) => {
                let parts: Vec<String> = l.iter().map(|v| v.to_string()).collect();
                write!(f, "[{}]", parts.join(", "))
            }
            other => write!(f, "{}", other.format(&Locale::default())),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Decimal(d) => serializer.serialize_str(&d.to_string()),
            Value::Boolean(b) => serializer.serialize_bool(*b),
            Value::Date(d) => serializer.serialize_str(&d.format("%Y-%m-%d").to_string()),
            Value::DateTime(d) => serializer.serialize_str(&d.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            Value::Blob(b) => {
                let mut seq = serializer.serialize_seq(Some(b.len()))?;
                for byte in b {
                    seq.serialize_element(byte)?;
                }
                seq.end()
            }
            Value::Instance(i) => serializer.serialize_str(&i.oid()),
            Value::Type(t) => serializer.serialize_str(t.name()),
            Value::Status(s) => serializer.serialize_str(s.key()),
            Value::Classification(c) => serializer.serialize_str(c.name()),
            Value::Uom(u) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("magnitude", &u.magnitude().to_string())?;
                map.serialize_entry("uom", u.uom().name())?;
                map.end()
            }
            Value::Rate(r) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("numerator", &r.numerator().to_string())?;
                map.serialize_entry("denominator", &r.denominator().to_string())?;
                map.end()
            }
            Value::Digest(_) => serializer.serialize_str(MASKED),
            Value::Uuid(u) => serializer.serialize_str(&u.to_string()),
            Value::List(l) => {
                let mut seq = serializer.serialize_seq(Some(l.len()))?;
                for v in l {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
        }
    }
}
