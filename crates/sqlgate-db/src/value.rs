//! Caller-supplied parameter values.
//!
//! Values arrive as query-string text or as JSON body members, so each one
//! is carried as a tagged variant and coerced explicitly where a control
//! key needs a number or a flag.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{GateError, GateResult};

/// Prefix marking reserved control keys (`.page_size`, `.offset`, ...).
pub const CONTROL_PREFIX: char = '.';

pub const PAGE_SIZE_KEY: &str = ".page_size";
pub const OFFSET_KEY: &str = ".offset";
pub const ORDER_BY_KEY: &str = ".order_by";
pub const SHOW_TOTAL_KEY: &str = ".show_total";

#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Request parameters keyed by name. Ordered so generated SQL is stable.
pub type ParamMap = BTreeMap<String, ParamValue>;

impl ParamValue {
    /// Query-string text. The literal `NULL` stands for SQL NULL.
    pub fn from_query(raw: &str) -> Self {
        if raw == "NULL" {
            ParamValue::Null
        } else {
            ParamValue::Text(raw.to_string())
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ParamValue::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Non-negative integer for paging keys. `Ok(None)` means "not set".
    pub fn to_count(&self, key: &str) -> GateResult<Option<u64>> {
        let invalid = || GateError::bad_request(format!("invalid value for {key}"));
        match self {
            ParamValue::Null => Ok(None),
            ParamValue::Int(n) => u64::try_from(*n).map(Some).map_err(|_| invalid()),
            ParamValue::Float(f) if f.fract() == 0.0 && *f >= 0.0 => Ok(Some(*f as u64)),
            ParamValue::Text(text) if text.trim().is_empty() => Ok(None),
            ParamValue::Text(text) => text.trim().parse().map(Some).map_err(|_| invalid()),
            ParamValue::Float(_) | ParamValue::Bool(_) => Err(invalid()),
        }
    }

    /// Boolean-like flag. `None` means "not set, use the default".
    pub fn to_flag(&self) -> Option<bool> {
        match self {
            ParamValue::Null => None,
            ParamValue::Bool(b) => Some(*b),
            ParamValue::Int(n) => Some(*n == 1),
            ParamValue::Float(f) => Some(*f == 1.0),
            ParamValue::Text(text) => Some(matches!(text.as_str(), "true" | "1" | "yes")),
        }
    }
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => ParamValue::Null,
            Value::Bool(b) => ParamValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ParamValue::Int(i),
                None => ParamValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => ParamValue::Text(s),
            other @ (Value::Array(_) | Value::Object(_)) => ParamValue::Text(other.to_string()),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Int(value)
    }
}

pub fn is_control_key(key: &str) -> bool {
    key.starts_with(CONTROL_PREFIX)
}

/// Data columns of a parameter map, i.e. everything except control keys.
pub fn data_entries(params: &ParamMap) -> impl Iterator<Item = (&String, &ParamValue)> {
    params.iter().filter(|(key, _)| !is_control_key(key))
}

/// Merges query-string pairs with a JSON object body. Body members win on
/// key collision; repeated query keys keep the last value.
pub fn merge_params<I, K, V>(query: I, body: Option<serde_json::Map<String, Value>>) -> ParamMap
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: AsRef<str>,
{
    let mut params: ParamMap = query
        .into_iter()
        .map(|(key, value)| (key.into(), ParamValue::from_query(value.as_ref())))
        .collect();
    if let Some(body) = body {
        params.extend(body.into_iter().map(|(key, value)| (key, ParamValue::from(value))));
    }
    params
}
