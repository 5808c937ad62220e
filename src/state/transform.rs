use crate::error::{CoordinationError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Typed update applied to the current value of a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Transform {
    /// Add a number; a missing value counts as 0.
    Increment(Number),
    /// Push onto a list; a missing value starts an empty list.
    Append(Value),
    /// Shallow-merge object fields; a missing value starts an empty object.
    Merge(Map<String, Value>),
    Replace(Value),
}

impl Transform {
    pub fn apply(&self, current: Option<&Value>) -> Result<Value> {
        let current = current.filter(|v| !v.is_null());
        match self {
            Transform::Increment(delta) => {
                let base = match current {
                    None => Number::from(0),
                    Some(Value::Number(n)) => n.clone(),
                    Some(other) => {
                        return Err(CoordinationError::validation(format!(
                            "cannot increment non-numeric value {other}"
                        )))
                    }
                };
                Ok(Value::Number(add_numbers(&base, delta)?))
            }
            Transform::Append(item) => match current {
                None => Ok(Value::Array(vec![item.clone()])),
                Some(Value::Array(items)) => {
                    let mut items = items.clone();
                    items.push(item.clone());
                    Ok(Value::Array(items))
                }
                Some(other) => Err(CoordinationError::validation(format!(
                    "cannot append to non-list value {other}"
                ))),
            },
            Transform::Merge(fields) => match current {
                None => Ok(Value::Object(fields.clone())),
                Some(Value::Object(object)) => {
                    let mut object = object.clone();
                    object.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                    Ok(Value::Object(object))
                }
                Some(other) => Err(CoordinationError::validation(format!(
                    "cannot merge fields into non-object value {other}"
                ))),
            },
            Transform::Replace(value) => Ok(value.clone()),
        }
    }
}

/// Integer sum when both sides are integers, float sum otherwise.
pub(crate) fn add_numbers(a: &Number, b: &Number) -> Result<Number> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(sum) = x.checked_add(y) {
            return Ok(Number::from(sum));
        }
    }
    let sum = a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0);
    Number::from_f64(sum)
        .ok_or_else(|| CoordinationError::validation(format!("sum {sum} is not a finite number")))
}
