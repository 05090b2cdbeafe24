/// Edge condition evaluation.
///
/// Pure mapping from an edge's declared predicate and the upstream node's
/// structured output to allow/skip. The same predicates double as event
/// waiter filters over dispatched payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Declarative predicate over a JSON document.
///
/// Field paths are JSONPath (`$.order.status`) or the dotted shorthand
/// (`order.status`); an empty path or `$` addresses the whole document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Eq { field: String, value: Value },
    Ne { field: String, value: Value },
    In { field: String, values: Vec<Value> },
    NotIn { field: String, values: Vec<Value> },
    Exists { field: String },
    Truthy { field: String },
    Gt { field: String, value: f64 },
    Lt { field: String, value: f64 },
    And { conditions: Vec<Condition> },
    Or { conditions: Vec<Condition> },
    Not { condition: Box<Condition> },
}

/// Evaluate an optional edge condition; a missing condition always passes.
pub fn evaluate(condition: Option<&Condition>, output: &Value) -> bool {
    condition.is_none_or(|c| c.matches(output))
}

impl Condition {
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::Eq {
            field: field.into(),
            value,
        }
    }

    pub fn is_in(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::In {
            field: field.into(),
            values,
        }
    }

    pub fn and(conditions: Vec<Condition>) -> Self {
        Self::And { conditions }
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Self::Or { conditions }
    }

    /// Whether `document` satisfies this predicate.
    pub fn matches(&self, document: &Value) -> bool {
        match self {
            Self::Eq { field, value } => {
                resolve(document, field).is_some_and(|actual| loose_eq(actual, value))
            }
            Self::Ne { field, value } => {
                !resolve(document, field).is_some_and(|actual| loose_eq(actual, value))
            }
            Self::In { field, values } => resolve(document, field)
                .is_some_and(|actual| values.iter().any(|v| loose_eq(actual, v))),
            Self::NotIn { field, values } => !resolve(document, field)
                .is_some_and(|actual| values.iter().any(|v| loose_eq(actual, v))),
            Self::Exists { field } => resolve(document, field).is_some_and(|v| !v.is_null()),
            Self::Truthy { field } => resolve(document, field).is_some_and(truthy),
            Self::Gt { field, value } => resolve(document, field)
                .and_then(as_number)
                .is_some_and(|actual| actual > *value),
            Self::Lt { field, value } => resolve(document, field)
                .and_then(as_number)
                .is_some_and(|actual| actual < *value),
            Self::And { conditions } => conditions.iter().all(|c| c.matches(document)),
            Self::Or { conditions } => conditions.iter().any(|c| c.matches(document)),
            Self::Not { condition } => !condition.matches(document),
        }
    }
}

fn resolve<'a>(document: &'a Value, field: &str) -> Option<&'a Value> {
    let field = field.trim();
    if field.is_empty() || field == "$" {
        return Some(document);
    }

    let path = if field.starts_with('$') {
        field.to_string()
    } else {
        format!("$.{}", field)
    };

    match jsonpath_lib::select(document, &path) {
        Ok(found) => found.into_iter().next(),
        Err(e) => {
            tracing::debug!(path = %path, error = ?e, "condition path did not parse");
            None
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Numbers compare by value (1 == 1.0); everything else structurally.
fn loose_eq(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => actual == expected,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}
