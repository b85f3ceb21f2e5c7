//! Predicate evaluation for stored documents.
//!
//! A predicate is itself a document-shaped map: field names (dotted paths
//! allowed) to either a literal scalar or an operator map. The reserved
//! top-level `$limit` bounds how many documents a query emits. Multiple
//! field conditions are conjunctive.

use serde_json::Value;

use crate::codec::{Document, TAGS_FIELD};
use crate::errors::{Result, TetherError};

/// A parsed, validated query predicate
pub struct Predicate {
    conditions: Vec<(String, Condition)>,
    limit: Option<usize>,
}

enum Condition {
    /// Literal operand: equality, or tag membership for the tags field
    Equals(Value),
    Operators(Vec<(Operator, Value)>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Contains,
    Exists,
}

impl Predicate {
    /// Parse and validate a predicate document.
    ///
    /// The operator vocabulary is closed: unknown `$` keys are rejected
    /// rather than silently matching nothing.
    pub fn parse(predicate: &Value) -> Result<Self> {
        let Value::Object(fields) = predicate else {
            return Err(TetherError::Encoding("query predicate must be an object".into()));
        };

        let mut conditions = Vec::with_capacity(fields.len());
        let mut limit = None;

        for (field, condition) in fields {
            if field == "$limit" {
                let bound = condition
                    .as_u64()
                    .filter(|&n| n > 0)
                    .ok_or_else(|| {
                        TetherError::Encoding("$limit must be a positive integer".into())
                    })?;
                limit = Some(bound as usize);
                continue;
            }

            if field.starts_with('$') {
                return Err(TetherError::Encoding(
                    format!("unknown top-level operator {field}").into(),
                ));
            }

            let condition = match condition {
                Value::Object(ops) => {
                    let mut parsed = Vec::with_capacity(ops.len());
                    for (op, operand) in ops {
                        let op = parse_operator(op)?;
                        validate_operand(op, operand)?;
                        parsed.push((op, operand.clone()));
                    }
                    Condition::Operators(parsed)
                }
                literal => Condition::Equals(literal.clone()),
            };
            conditions.push((field.clone(), condition));
        }

        Ok(Self { conditions, limit })
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Does the document satisfy every condition?
    pub fn matches(&self, doc: &Document) -> bool {
        self.conditions.iter().all(|(field, condition)| {
            let field_value = lookup_field(doc, field);
            match condition {
                Condition::Equals(expected) => {
                    if is_tags_field(field) && !expected.is_array() {
                        // Scalar tag predicates are membership checks
                        return field_value
                            .and_then(Value::as_array)
                            .is_some_and(|tags| tags.contains(expected));
                    }
                    field_value == Some(expected)
                }
                Condition::Operators(ops) => {
                    ops.iter().all(|(op, operand)| apply_operator(*op, field_value, operand))
                }
            }
        })
    }
}

fn parse_operator(name: &str) -> Result<Operator> {
    match name {
        "$eq" => Ok(Operator::Eq),
        "$ne" => Ok(Operator::Ne),
        "$gt" => Ok(Operator::Gt),
        "$gte" => Ok(Operator::Gte),
        "$lt" => Ok(Operator::Lt),
        "$lte" => Ok(Operator::Lte),
        "$in" => Ok(Operator::In),
        "$contains" => Ok(Operator::Contains),
        "$exists" => Ok(Operator::Exists),
        other => Err(TetherError::Encoding(format!("unknown query operator {other}").into())),
    }
}

fn validate_operand(op: Operator, operand: &Value) -> Result<()> {
    match op {
        Operator::In if !operand.is_array() => {
            Err(TetherError::Encoding("$in requires an array operand".into()))
        }
        Operator::Exists if !operand.is_boolean() => {
            Err(TetherError::Encoding("$exists requires a boolean operand".into()))
        }
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte if !operand.is_number() => {
            Err(TetherError::Encoding("comparison operators require a numeric operand".into()))
        }
        _ => Ok(()),
    }
}

fn apply_operator(op: Operator, field_value: Option<&Value>, operand: &Value) -> bool {
    match op {
        Operator::Eq => field_value == Some(operand),
        // A missing field reads as null: `$ne` matches absence unless the
        // operand is null itself
        Operator::Ne => field_value.unwrap_or(&Value::Null) != operand,
        Operator::Gt => compare_numeric(field_value, operand).is_some_and(|ord| ord.is_gt()),
        Operator::Gte => compare_numeric(field_value, operand).is_some_and(|ord| ord.is_ge()),
        Operator::Lt => compare_numeric(field_value, operand).is_some_and(|ord| ord.is_lt()),
        Operator::Lte => compare_numeric(field_value, operand).is_some_and(|ord| ord.is_le()),
        Operator::In => {
            let Some(candidates) = operand.as_array() else { return false };
            field_value.is_some_and(|value| candidates.contains(value))
        }
        Operator::Contains => match field_value {
            Some(Value::Array(items)) => items.contains(operand),
            Some(Value::String(haystack)) => {
                operand.as_str().is_some_and(|needle| haystack.contains(needle))
            }
            _ => false,
        },
        Operator::Exists => {
            operand.as_bool().is_some_and(|expected| field_value.is_some() == expected)
        }
    }
}

/// Numeric comparison; non-numeric field values fail the predicate silently
fn compare_numeric(field_value: Option<&Value>, operand: &Value) -> Option<std::cmp::Ordering> {
    let lhs = field_value?.as_f64()?;
    let rhs = operand.as_f64()?;
    lhs.partial_cmp(&rhs)
}

/// Resolve a dotted field path against a document
fn lookup_field<'doc>(doc: &'doc Document, field: &str) -> Option<&'doc Value> {
    let field = if field == "tags" { TAGS_FIELD } else { field };

    let mut parts = field.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn is_tags_field(field: &str) -> bool {
    field == "tags" || field == TAGS_FIELD
}
