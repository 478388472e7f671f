use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CoreError, CoreResult};

/// A single scalar parameter value.
///
/// Equality is defined on the rendered form, so `Text("3")` and `Int(3)`
/// compare equal. Directory names only carry the rendered form, and two
/// parameter sets that render identically name the same job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(ParamValue::Bool(*b)),
            Value::Number(n) => n
                .as_i64()
                .map(ParamValue::Int)
                .or_else(|| n.as_f64().map(ParamValue::Float)),
            Value::String(s) => Some(ParamValue::Text(s.clone())),
            _ => None,
        }
    }

    /// Infers the most specific scalar for a decoded directory fragment.
    pub fn from_fragment(fragment: &str) -> Self {
        match fragment {
            "true" => return ParamValue::Bool(true),
            "false" => return ParamValue::Bool(false),
            _ => {}
        }
        if let Ok(n) = fragment.parse::<i64>() {
            return ParamValue::Int(n);
        }
        let numeric = !fragment.is_empty()
            && fragment
                .chars()
                .all(|c| c.is_ascii_digit() || matches!(c, '.' | 'e' | 'E' | '+' | '-'));
        if numeric {
            if let Ok(f) = fragment.parse::<f64>() {
                return ParamValue::Float(f);
            }
        }
        ParamValue::Text(fragment.to_string())
    }

    pub fn to_json(&self) -> Value {
        match self {
            ParamValue::Bool(b) => Value::Bool(*b),
            ParamValue::Int(n) => Value::from(*n),
            ParamValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(f.to_string())),
            ParamValue::Text(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Bool(b) => write!(f, "{}", b),
            ParamValue::Int(n) => write!(f, "{}", n),
            ParamValue::Float(x) => write!(f, "{}", x),
            ParamValue::Text(s) => f.write_str(s),
        }
    }
}

impl PartialEq for ParamValue {
    fn eq(&self, other: &Self) -> bool {
        self.to_string() == other.to_string()
    }
}

impl Eq for ParamValue {}

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

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Bool(value)
    }
}

/// Named parameters of one job. Keys are kept sorted, which makes
/// [`ParameterSet::encode`] canonical regardless of how the set was built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSet(BTreeMap<String, ParamValue>);

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ParamValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    /// `key-value` segments in ascending key order, joined by `_`.
    ///
    /// Keys and values must not contain `_` or `-`; that is a caller
    /// precondition and is not re-checked here.
    pub fn encode(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}-{}", k, v))
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Inverse of [`ParameterSet::encode`]. Each `_` piece is split on its
    /// last `-`; pieces without a `-` are dropped without error.
    pub fn decode(segment: &str) -> Self {
        let mut out = ParameterSet::new();
        for piece in segment.split('_') {
            if let Some((key, value)) = piece.rsplit_once('-') {
                out.insert(key, ParamValue::from_fragment(value));
            }
        }
        out
    }

    pub fn from_json_object(object: &Map<String, Value>) -> CoreResult<Self> {
        let mut out = ParameterSet::new();
        for (key, value) in object {
            let v = ParamValue::from_json(value).ok_or_else(|| {
                CoreError::InvalidGrid(format!("parameter '{}' is not a scalar", key))
            })?;
            out.insert(key.clone(), v);
        }
        Ok(out)
    }
}

/// Cartesian product over the list-valued entries of `grid`; scalar
/// entries are copied into every combination. The key inserted last varies
/// slowest. An empty list yields no combinations.
pub fn expand_grid(grid: &Map<String, Value>) -> CoreResult<Vec<ParameterSet>> {
    let mut combos = vec![ParameterSet::new()];
    for (key, entry) in grid {
        let values: Vec<ParamValue> = match entry {
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    ParamValue::from_json(item).ok_or_else(|| {
                        CoreError::InvalidGrid(format!(
                            "values of '{}' must be scalars, found {}",
                            key, item
                        ))
                    })
                })
                .collect::<CoreResult<_>>()?,
            other => vec![ParamValue::from_json(other).ok_or_else(|| {
                CoreError::InvalidGrid(format!("value of '{}' must be a scalar or a list", key))
            })?],
        };
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for value in &values {
            for combo in &combos {
                let mut extended = combo.clone();
                extended.insert(key.clone(), value.clone());
                next.push(extended);
            }
        }
        combos = next;
    }
    Ok(combos)
}

/// Accepts either one grid object or a list of them; results are
/// concatenated in list order.
pub fn expand_grid_list(grids: &Value) -> CoreResult<Vec<ParameterSet>> {
    match grids {
        Value::Object(grid) => expand_grid(grid),
        Value::Array(list) => {
            let mut out = Vec::new();
            for grid in list {
                let grid = grid.as_object().ok_or_else(|| {
                    CoreError::InvalidGrid("grid list entries must be objects".to_string())
                })?;
                out.extend(expand_grid(grid)?);
            }
            Ok(out)
        }
        _ => Err(CoreError::InvalidGrid(
            "parameter grid must be an object or a list of objects".to_string(),
        )),
    }
}
