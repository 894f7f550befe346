//! Item data model types.
//!
//! These types describe a single named value in the gateway:
//! - The declared data type and the typed value itself
//! - The five quality flags carried alongside every value
//! - The static definition an item is created from
//! - The reading handed to readers and subscribers

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// The declared type of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float,
    Int,
    Bool,
    #[serde(alias = "string")]
    Str,
}

impl DataType {
    /// Name used on the wire and in configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Float => "float",
            DataType::Int => "int",
            DataType::Bool => "bool",
            DataType::Str => "str",
        }
    }

    /// Whether values of this type are clamped to the item's bounds.
    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Float | DataType::Int)
    }

    /// The value an item starts with when no initial value is configured.
    pub fn zero(&self) -> Value {
        match self {
            DataType::Float => Value::Float(0.0),
            DataType::Int => Value::Int(0),
            DataType::Bool => Value::Bool(false),
            DataType::Str => Value::Str(String::new()),
        }
    }

    /// Convert a value to this type.
    ///
    /// Returns `None` when the value has no sensible representation in this
    /// type (e.g. the string "abc" or "nan" as a float). Booleans accept the usual
    /// truthy strings and any non-zero number; every other string is false.
    pub fn convert(&self, value: &Value) -> Option<Value> {
        match self {
            DataType::Float => match value {
                Value::Float(f) => Some(*f),
                Value::Int(i) => Some(*i as f64),
                Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
                Value::Str(s) => s.trim().parse::<f64>().ok(),
            }
            // NaN and infinities cannot be clamped or compared.
            .filter(|f| f.is_finite())
            .map(Value::Float),
            DataType::Int => match value {
                Value::Int(i) => Some(Value::Int(*i)),
                Value::Float(f) if f.is_finite() => Some(Value::Int(f.trunc() as i64)),
                Value::Float(_) => None,
                Value::Bool(b) => Some(Value::Int(i64::from(*b))),
                Value::Str(s) => {
                    let s = s.trim();
                    s.parse::<i64>().ok().map(Value::Int).or_else(|| {
                        s.parse::<f64>()
                            .ok()
                            .filter(|f| f.is_finite())
                            .map(|f| Value::Int(f.trunc() as i64))
                    })
                }
            },
            DataType::Bool => Some(Value::Bool(match value {
                Value::Bool(b) => *b,
                Value::Int(i) => *i != 0,
                Value::Float(f) => *f != 0.0,
                Value::Str(s) => matches!(
                    s.trim().to_ascii_lowercase().as_str(),
                    "1" | "true" | "yes" | "on"
                ),
            })),
            DataType::Str => Some(Value::Str(value.to_string())),
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "float" => Ok(DataType::Float),
            "int" => Ok(DataType::Int),
            "bool" => Ok(DataType::Bool),
            "str" | "string" => Ok(DataType::Str),
            other => Err(format!("unknown data type '{other}'")),
        }
    }
}

/// A typed item value.
///
/// Deserialization is untagged so configuration files can write plain
/// JSON scalars as initial values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Text form used on the wire: floats always carry a fractional part
/// (`2500.0`), bools are `True`/`False`.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{v:?}"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Bool(true) => f.write_str("True"),
            Value::Bool(false) => f.write_str("False"),
            Value::Str(s) => f.write_str(s),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// One of the five quality flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagKind {
    Annunciate,
    Old,
    Bad,
    Fail,
    SecFail,
}

impl FlagKind {
    /// All flags in wire order: `a o b f s`.
    pub const ALL: [FlagKind; 5] = [
        FlagKind::Annunciate,
        FlagKind::Old,
        FlagKind::Bad,
        FlagKind::Fail,
        FlagKind::SecFail,
    ];

    pub fn letter(&self) -> char {
        match self {
            FlagKind::Annunciate => 'a',
            FlagKind::Old => 'o',
            FlagKind::Bad => 'b',
            FlagKind::Fail => 'f',
            FlagKind::SecFail => 's',
        }
    }
}

impl FromStr for FlagKind {
    type Err = StoreError;

    /// Accepts the single wire letter or the full flag name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "a" | "annunciate" => Ok(FlagKind::Annunciate),
            "o" | "old" => Ok(FlagKind::Old),
            "b" | "bad" => Ok(FlagKind::Bad),
            "f" | "fail" => Ok(FlagKind::Fail),
            "s" | "secfail" => Ok(FlagKind::SecFail),
            _ => Err(StoreError::UnknownFlag(s.to_string())),
        }
    }
}

/// Quality flags attached to an item value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Flags {
    pub annunciate: bool,
    pub old: bool,
    pub bad: bool,
    pub fail: bool,
    pub sec_fail: bool,
}

impl Flags {
    pub fn get(&self, kind: FlagKind) -> bool {
        match kind {
            FlagKind::Annunciate => self.annunciate,
            FlagKind::Old => self.old,
            FlagKind::Bad => self.bad,
            FlagKind::Fail => self.fail,
            FlagKind::SecFail => self.sec_fail,
        }
    }

    /// Set a flag, returning whether it changed.
    pub fn set(&mut self, kind: FlagKind, on: bool) -> bool {
        let slot = match kind {
            FlagKind::Annunciate => &mut self.annunciate,
            FlagKind::Old => &mut self.old,
            FlagKind::Bad => &mut self.bad,
            FlagKind::Fail => &mut self.fail,
            FlagKind::SecFail => &mut self.sec_fail,
        };
        let changed = *slot != on;
        *slot = on;
        changed
    }

    /// True when no quality flag is raised.
    pub fn is_clear(&self) -> bool {
        *self == Flags::default()
    }
}

/// The current value and flags of an item.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemReport {
    pub value: Value,
    pub flags: Flags,
}

/// The result of reading an address.
///
/// Plain keys yield the item's report; `key.aux` addresses yield the raw
/// auxiliary value, which is `None` until something writes it.
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Item(ItemReport),
    Aux(Option<Value>),
}

impl Reading {
    pub fn as_item(&self) -> Option<&ItemReport> {
        match self {
            Reading::Item(report) => Some(report),
            Reading::Aux(_) => None,
        }
    }
}

/// Split an address into its item key and optional aux name.
pub fn split_address(address: &str) -> (&str, Option<&str>) {
    match address.split_once('.') {
        Some((key, aux)) => (key, Some(aux)),
        None => (address, None),
    }
}

/// Static definition of an item, as found in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemDefinition {
    /// Unique item key (e.g. "ALT", "IAS").
    pub key: String,

    /// Declared value type.
    #[serde(rename = "type")]
    pub data_type: DataType,

    #[serde(default)]
    pub description: String,

    /// Lower bound for numeric items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,

    /// Upper bound for numeric items.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,

    #[serde(default)]
    pub units: String,

    /// Time-to-live in milliseconds; 0 disables staleness.
    #[serde(default)]
    pub tol: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<Value>,

    /// Names of auxiliary sub-values.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aux: Vec<String>,
}

impl ItemDefinition {
    pub fn new(key: impl Into<String>, data_type: DataType) -> Self {
        Self {
            key: key.into(),
            data_type,
            description: String::new(),
            min: None,
            max: None,
            units: String::new(),
            tol: 0,
            initial: None,
            aux: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = units.into();
        self
    }

    pub fn with_tol(mut self, tol_ms: u64) -> Self {
        self.tol = tol_ms;
        self
    }

    pub fn with_initial(mut self, value: impl Into<Value>) -> Self {
        self.initial = Some(value.into());
        self
    }

    pub fn with_aux<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aux = names.into_iter().map(Into::into).collect();
        self
    }
}
