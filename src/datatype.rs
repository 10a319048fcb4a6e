// used for persistence
use rusqlite::types::{ToSql, ToSqlOutput, ValueRef};

// used for instants in the database
use chrono::{NaiveDate, NaiveDateTime, Utc};
// used for decimal numbers
use bigdecimal::BigDecimal;
use regex::Regex;
// so regular expressions don't have to be recompiled
use lazy_static::lazy_static;

// used when parsing a string to a BigDecimal
use std::str::FromStr;
// used to print out readable forms of a data type
use std::fmt;
use std::cmp::Ordering;
use std::ops;

use crate::construct::Thing;
use crate::error::{FactbaseError, Result};

lazy_static! {
    static ref KEYWORD: Regex =
        Regex::new(r"^:[A-Za-z*+!?<>=_-][\w.*+!?<>=-]*(/[A-Za-z*+!?<>=_-][\w.*+!?<>=-]*)?$").unwrap();
}

/// True when `s` is a keyword such as `:user/email` or `:active`.
pub fn is_keyword(s: &str) -> bool {
    KEYWORD.is_match(s)
}

const INSTANT_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Parses the instant forms accepted in scripts and in the store:
/// a date, or a date and time with optional fraction and trailing `Z`.
pub fn parse_instant(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim().trim_end_matches('Z');
    for format in INSTANT_FORMATS {
        if let Ok(moment) = NaiveDateTime::parse_from_str(s, format) {
            return Some(moment);
        }
    }
    NaiveDate::from_str(s)
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
}

pub fn format_instant(moment: &NaiveDateTime) -> String {
    moment.format("%Y-%m-%dT%H:%M:%S%.f").to_string()
}

pub fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

// ------------- Value types --------------
#[derive(Eq, PartialEq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub enum ValueType {
    String,
    Long,
    BigDec,
    Boolean,
    Instant,
    Keyword,
    Ref,
}

impl ValueType {
    pub const ALL: [ValueType; 7] = [
        ValueType::String,
        ValueType::Long,
        ValueType::BigDec,
        ValueType::Boolean,
        ValueType::Instant,
        ValueType::Keyword,
        ValueType::Ref,
    ];
    /// Stable identifier used when persisting values.
    pub fn uid(&self) -> u8 {
        match self {
            ValueType::String => 1,
            ValueType::Long => 2,
            ValueType::BigDec => 3,
            ValueType::Boolean => 4,
            ValueType::Instant => 5,
            ValueType::Keyword => 6,
            ValueType::Ref => 7,
        }
    }
    pub fn ident(&self) -> &'static str {
        match self {
            ValueType::String => ":db.type/string",
            ValueType::Long => ":db.type/long",
            ValueType::BigDec => ":db.type/bigdec",
            ValueType::Boolean => ":db.type/boolean",
            ValueType::Instant => ":db.type/instant",
            ValueType::Keyword => ":db.type/keyword",
            ValueType::Ref => ":db.type/ref",
        }
    }
    pub fn from_ident(ident: &str) -> Option<ValueType> {
        Self::ALL.into_iter().find(|t| t.ident() == ident)
    }
}
impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.ident())
    }
}

#[derive(Eq, PartialEq, PartialOrd, Ord, Hash, Clone, Copy, Debug)]
pub enum Cardinality {
    One,
    Many,
}

impl Cardinality {
    pub fn ident(&self) -> &'static str {
        match self {
            Cardinality::One => ":db.cardinality/one",
            Cardinality::Many => ":db.cardinality/many",
        }
    }
    pub fn from_ident(ident: &str) -> Option<Cardinality> {
        match ident {
            ":db.cardinality/one" => Some(Cardinality::One),
            ":db.cardinality/many" => Some(Cardinality::Many),
            _ => None,
        }
    }
}
impl fmt::Display for Cardinality {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.ident())
    }
}

// ------------- Decimal --------------
#[derive(Eq, PartialEq, Hash, PartialOrd, Ord, Clone, Debug)]
pub struct Decimal(BigDecimal);

impl Decimal {
    pub fn new(decimal: BigDecimal) -> Self {
        Decimal(decimal)
    }
    pub fn parse(s: &str) -> Option<Decimal> {
        BigDecimal::from_str(s.trim_end_matches('M')).ok().map(Decimal)
    }
}
impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
impl ops::Deref for Decimal {
    type Target = BigDecimal;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
impl From<i64> for Decimal {
    fn from(n: i64) -> Self {
        Decimal(BigDecimal::from(n))
    }
}

// ------------- Values --------------
/// A typed value as stored in a fact.
#[derive(Eq, PartialEq, PartialOrd, Ord, Hash, Clone, Debug)]
pub enum Value {
    String(String),
    Long(i64),
    BigDec(Decimal),
    Boolean(bool),
    Instant(NaiveDateTime),
    Keyword(String),
    Ref(Thing),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::String(_) => ValueType::String,
            Value::Long(_) => ValueType::Long,
            Value::BigDec(_) => ValueType::BigDec,
            Value::Boolean(_) => ValueType::Boolean,
            Value::Instant(_) => ValueType::Instant,
            Value::Keyword(_) => ValueType::Keyword,
            Value::Ref(_) => ValueType::Ref,
        }
    }
    pub fn as_ref(&self) -> Option<Thing> {
        match self {
            Value::Ref(thing) => Some(*thing),
            _ => None,
        }
    }
    fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Long(n) => Some(Decimal::from(*n)),
            Value::BigDec(d) => Some(d.clone()),
            _ => None,
        }
    }
    /// Equality as seen by query predicates: longs and decimals compare numerically,
    /// refs and longs denote the same entity id.
    pub fn matches(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Long(_) | Value::BigDec(_), Value::Long(_) | Value::BigDec(_)) => {
                self.as_decimal() == other.as_decimal()
            }
            (Value::Ref(r), Value::Long(n)) | (Value::Long(n), Value::Ref(r)) => {
                u64::try_from(*n).is_ok_and(|n| n == *r)
            }
            _ => self == other,
        }
    }
    /// Ordering as seen by query predicates. Only values of one comparable family
    /// can be ordered.
    pub fn compare(&self, other: &Value) -> Result<Ordering> {
        match (self, other) {
            (Value::Long(a), Value::Long(b)) => Ok(a.cmp(b)),
            (Value::Long(_) | Value::BigDec(_), Value::Long(_) | Value::BigDec(_)) => {
                Ok(self.as_decimal().cmp(&other.as_decimal()))
            }
            (Value::String(a), Value::String(b)) => Ok(a.cmp(b)),
            (Value::Instant(a), Value::Instant(b)) => Ok(a.cmp(b)),
            (Value::Keyword(a), Value::Keyword(b)) => Ok(a.cmp(b)),
            (Value::Ref(a), Value::Ref(b)) => Ok(a.cmp(b)),
            _ => Err(FactbaseError::TypeMismatch(format!(
                "Ordering comparison not allowed between {} and {}",
                self.value_type(),
                other.value_type()
            ))),
        }
    }
    /// Reads a persisted value back given the declared type of its attribute.
    pub fn from_sql(value_type: ValueType, value: ValueRef<'_>) -> Result<Value> {
        let corrupt = |e: rusqlite::types::FromSqlError| FactbaseError::DataCorruption {
            message: format!("cannot read {} value: {}", value_type, e),
        };
        let text = |value: ValueRef<'_>| -> Result<String> {
            value.as_str().map(String::from).map_err(corrupt)
        };
        Ok(match value_type {
            ValueType::String => Value::String(text(value)?),
            ValueType::Long => Value::Long(value.as_i64().map_err(corrupt)?),
            ValueType::BigDec => {
                let s = text(value)?;
                Value::BigDec(Decimal::parse(&s).ok_or_else(|| FactbaseError::DataCorruption {
                    message: format!("invalid decimal '{}'", s),
                })?)
            }
            ValueType::Boolean => Value::Boolean(value.as_i64().map_err(corrupt)? != 0),
            ValueType::Instant => {
                let s = text(value)?;
                Value::Instant(parse_instant(&s).ok_or_else(|| FactbaseError::DataCorruption {
                    message: format!("invalid instant '{}'", s),
                })?)
            }
            ValueType::Keyword => Value::Keyword(text(value)?),
            ValueType::Ref => Value::Ref(value.as_i64().map_err(corrupt)? as Thing),
        })
    }
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::String(s) | Value::Keyword(s) => serde_json::Value::from(s.as_str()),
            Value::Long(n) => serde_json::Value::from(*n),
            Value::BigDec(d) => serde_json::Value::from(d.to_string()),
            Value::Boolean(b) => serde_json::Value::from(*b),
            Value::Instant(i) => serde_json::Value::from(format_instant(i)),
            Value::Ref(t) => serde_json::Value::from(*t),
        }
    }
}
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{:?}", s),
            Value::Long(n) => write!(f, "{}", n),
            Value::BigDec(d) => write!(f, "{}M", d),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Instant(i) => write!(f, "#inst \"{}\"", format_instant(i)),
            Value::Keyword(k) => write!(f, "{}", k),
            Value::Ref(t) => write!(f, "{}", t),
        }
    }
}
impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::String(s) | Value::Keyword(s) => ToSqlOutput::from(s.as_str()),
            Value::Long(n) => ToSqlOutput::from(*n),
            Value::BigDec(d) => ToSqlOutput::from(d.to_string()),
            Value::Boolean(b) => ToSqlOutput::from(*b),
            Value::Instant(i) => ToSqlOutput::from(format_instant(i)),
            Value::Ref(t) => ToSqlOutput::from(*t as i64),
        })
    }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}
impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Long(n)
    }
}
impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Long(i64::from(n))
    }
}
impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

// ------------- Data --------------
/// An untyped value as written by a user, before it meets the declared
/// type of an attribute.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Datum {
    String(String),
    Long(i64),
    Decimal(Decimal),
    Boolean(bool),
    Instant(NaiveDateTime),
    Keyword(String),
    TempId(i64),
}

impl Datum {
    /// Converts the datum into a value of the given scalar type. References
    /// are resolved by the transaction and never pass through here.
    pub fn coerce(&self, value_type: ValueType) -> Result<Value> {
        let value = match (value_type, self) {
            (ValueType::String, Datum::String(s)) => Some(Value::String(s.clone())),
            (ValueType::Long, Datum::Long(n)) => Some(Value::Long(*n)),
            (ValueType::BigDec, Datum::Long(n)) => Some(Value::BigDec(Decimal::from(*n))),
            (ValueType::BigDec, Datum::Decimal(d)) => Some(Value::BigDec(d.clone())),
            (ValueType::Boolean, Datum::Boolean(b)) => Some(Value::Boolean(*b)),
            (ValueType::Instant, Datum::Instant(i)) => Some(Value::Instant(*i)),
            (ValueType::Instant, Datum::String(s)) => parse_instant(s).map(Value::Instant),
            (ValueType::Keyword, Datum::Keyword(k)) => Some(Value::Keyword(k.clone())),
            (ValueType::Ref, Datum::Long(n)) if *n > 0 => Some(Value::Ref(*n as Thing)),
            _ => None,
        };
        value.ok_or_else(|| {
            FactbaseError::TypeMismatch(format!("{} is not a valid {}", self, value_type))
        })
    }
    /// Best effort conversion when no declared type is known, as for constants
    /// in a query pattern whose attribute is a variable.
    pub fn to_value(&self) -> Option<Value> {
        match self {
            Datum::String(s) => Some(Value::String(s.clone())),
            Datum::Long(n) => Some(Value::Long(*n)),
            Datum::Decimal(d) => Some(Value::BigDec(d.clone())),
            Datum::Boolean(b) => Some(Value::Boolean(*b)),
            Datum::Instant(i) => Some(Value::Instant(*i)),
            Datum::Keyword(k) => Some(Value::Keyword(k.clone())),
            Datum::TempId(_) => None,
        }
    }
}
impl fmt::Display for Datum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Datum::String(s) => write!(f, "{:?}", s),
            Datum::Long(n) => write!(f, "{}", n),
            Datum::Decimal(d) => write!(f, "{}M", d),
            Datum::Boolean(b) => write!(f, "{}", b),
            Datum::Instant(i) => write!(f, "#inst \"{}\"", format_instant(i)),
            Datum::Keyword(k) => write!(f, "{}", k),
            Datum::TempId(t) => write!(f, "#db/id[:db.part/user {}]", t),
        }
    }
}
impl From<&str> for Datum {
    fn from(s: &str) -> Self {
        Datum::String(s.to_string())
    }
}
impl From<String> for Datum {
    fn from(s: String) -> Self {
        Datum::String(s)
    }
}
impl From<i64> for Datum {
    fn from(n: i64) -> Self {
        Datum::Long(n)
    }
}
impl From<i32> for Datum {
    fn from(n: i32) -> Self {
        Datum::Long(i64::from(n))
    }
}
impl From<bool> for Datum {
    fn from(b: bool) -> Self {
        Datum::Boolean(b)
    }
}
impl From<NaiveDateTime> for Datum {
    fn from(i: NaiveDateTime) -> Self {
        Datum::Instant(i)
    }
}
impl From<Decimal> for Datum {
    fn from(d: Decimal) -> Self {
        Datum::Decimal(d)
    }
}
