//! Fail-closed conditional gate evaluation.
//!
//! Rules are structured trees, not expression strings: comparison operators
//! resolve a dot-path against the run context and compare against a literal
//! operand, while `and`/`or` recurse over nested rules. Any malformed rule or
//! type mismatch evaluates to `false` so a bad gate skips its step instead of
//! letting it run.

use relay_types::workflow::{ConditionOp, ConditionalRule};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
enum ConditionError {
    #[error("operator '{0}' requires a path")]
    MissingPath(&'static str),
    #[error("operator '{0}' requires a value operand")]
    MissingValue(&'static str),
    #[error("operator '{0}' requires nested rules")]
    MissingRules(&'static str),
    #[error("cannot order {left} against {right}")]
    NotOrderable { left: &'static str, right: &'static str },
    #[error("'{op}' requires an array operand")]
    NotAnArray { op: &'static str },
}

/// Evaluate `rule` against `context`. Fail-closed: malformed rules, missing
/// operands, and non-comparable types all yield `false`.
pub fn evaluate(rule: &ConditionalRule, context: &Value) -> bool {
    match try_evaluate(rule, context) {
        Ok(result) => result,
        Err(err) => {
            tracing::debug!(error = %err, "condition evaluated fail-closed");
            false
        }
    }
}

fn try_evaluate(rule: &ConditionalRule, context: &Value) -> Result<bool, ConditionError> {
    match rule.op {
        ConditionOp::And => {
            if rule.rules.is_empty() {
                return Err(ConditionError::MissingRules("and"));
            }
            for nested in &rule.rules {
                if !try_evaluate(nested, context)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        ConditionOp::Or => {
            if rule.rules.is_empty() {
                return Err(ConditionError::MissingRules("or"));
            }
            for nested in &rule.rules {
                if try_evaluate(nested, context)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        op => {
            let name = op_name(op);
            let path = rule
                .path
                .as_deref()
                .ok_or(ConditionError::MissingPath(name))?;
            let operand = rule
                .value
                .as_ref()
                .ok_or(ConditionError::MissingValue(name))?;
            let actual = resolve_path(context, path);
            compare(op, &actual, operand)
        }
    }
}

fn op_name(op: ConditionOp) -> &'static str {
    match op {
        ConditionOp::Equals => "equals",
        ConditionOp::NotEquals => "not_equals",
        ConditionOp::GreaterThan => "greater_than",
        ConditionOp::LessThan => "less_than",
        ConditionOp::GreaterEqual => "greater_equal",
        ConditionOp::LessEqual => "less_equal",
        ConditionOp::Contains => "contains",
        ConditionOp::NotContains => "not_contains",
        ConditionOp::In => "in",
        ConditionOp::NotIn => "not_in",
        ConditionOp::And => "and",
        ConditionOp::Or => "or",
    }
}

/// Walk a dot-path through nested objects. A missing segment resolves to
/// `Null` rather than erroring, so equality checks against null still work.
fn resolve_path(context: &Value, path: &str) -> Value {
    let mut current = context;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn compare(op: ConditionOp, actual: &Value, operand: &Value) -> Result<bool, ConditionError> {
    match op {
        ConditionOp::Equals => Ok(loose_eq(actual, operand)),
        ConditionOp::NotEquals => Ok(!loose_eq(actual, operand)),
        ConditionOp::GreaterThan => ordering(actual, operand).map(|o| o == std::cmp::Ordering::Greater),
        ConditionOp::LessThan => ordering(actual, operand).map(|o| o == std::cmp::Ordering::Less),
        ConditionOp::GreaterEqual => {
            ordering(actual, operand).map(|o| o != std::cmp::Ordering::Less)
        }
        ConditionOp::LessEqual => {
            ordering(actual, operand).map(|o| o != std::cmp::Ordering::Greater)
        }
        ConditionOp::Contains => contains(actual, operand),
        ConditionOp::NotContains => contains(actual, operand).map(|c| !c),
        ConditionOp::In => member_of(actual, operand, "in"),
        ConditionOp::NotIn => member_of(actual, operand, "not_in").map(|m| !m),
        ConditionOp::And | ConditionOp::Or => unreachable!("handled in try_evaluate"),
    }
}

/// Equality with number normalization: `1` and `1.0` are equal. Strings are
/// never coerced here; numeric-string coercion belongs to the ordering
/// operators only.
fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

/// Coerce to f64 for ordering; numeric strings count.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Ordering is numeric only; operands that do not coerce to a number
/// (including non-numeric strings) are an evaluation error.
fn ordering(actual: &Value, operand: &Value) -> Result<std::cmp::Ordering, ConditionError> {
    match (as_number(actual), as_number(operand)) {
        (Some(a), Some(b)) => a
            .partial_cmp(&b)
            .ok_or(ConditionError::NotOrderable {
                left: "number",
                right: "number",
            }),
        _ => Err(ConditionError::NotOrderable {
            left: type_name(actual),
            right: type_name(operand),
        }),
    }
}

/// `contains`: arrays by element equality, strings by substring (operand
/// coerced to its string form).
fn contains(actual: &Value, operand: &Value) -> Result<bool, ConditionError> {
    match actual {
        Value::Array(items) => Ok(items.iter().any(|item| loose_eq(item, operand))),
        Value::String(haystack) => {
            let needle = match operand {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            Ok(haystack.contains(&needle))
        }
        other => Err(ConditionError::NotOrderable {
            left: type_name(other),
            right: "contains operand",
        }),
    }
}

/// `in` / `not_in`: membership of the resolved value in an array operand.
fn member_of(actual: &Value, operand: &Value, op: &'static str) -> Result<bool, ConditionError> {
    match operand {
        Value::Array(items) => Ok(items.iter().any(|item| loose_eq(item, actual))),
        _ => Err(ConditionError::NotAnArray { op }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
