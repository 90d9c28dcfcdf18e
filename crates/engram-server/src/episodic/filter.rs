// crates/engram-server/src/episodic/filter.rs
// Attribute filter evaluation
//
// Conditions: a bare scalar is equality; an object may carry `in` (set
// membership), and `gt` / `gte` / `lt` / `lte` (numeric or lexicographic
// ranges, which covers RFC 3339 timestamps). All conditions AND.

use serde_json::{Map, Value};
use std::cmp::Ordering;

/// Whether `attributes` satisfies every condition in `filter`.
pub fn matches(attributes: &Map<String, Value>, filter: &Map<String, Value>) -> bool {
    filter.iter().all(|(field, condition)| {
        let actual = attributes.get(field);
        match condition {
            Value::Object(ops) if is_operator_object(ops) => {
                ops.iter().all(|(op, operand)| apply_op(actual, op, operand))
            }
            scalar => actual == Some(scalar),
        }
    })
}

fn is_operator_object(ops: &Map<String, Value>) -> bool {
    !ops.is_empty()
        && ops
            .keys()
            .all(|k| matches!(k.as_str(), "in" | "gt" | "gte" | "lt" | "lte"))
}

fn apply_op(actual: Option<&Value>, op: &str, operand: &Value) -> bool {
    match op {
        "in" => match (actual, operand) {
            (Some(value), Value::Array(candidates)) => candidates.contains(value),
            _ => false,
        },
        "gt" | "gte" | "lt" | "lte" => {
            let Some(value) = actual else { return false };
            let Some(ordering) = compare(value, operand) else {
                return false;
            };
            match op {
                "gt" => ordering == Ordering::Greater,
                "gte" => ordering != Ordering::Less,
                "lt" => ordering == Ordering::Less,
                _ => ordering != Ordering::Greater,
            }
        }
        _ => false,
    }
}

/// Order two scalars of matching shape; mixed shapes are incomparable.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.as_f64()?.partial_cmp(&y.as_f64()?)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
