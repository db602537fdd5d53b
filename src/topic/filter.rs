//! Filter-policy evaluation.
//!
//! A policy is a JSON object mapping keys to lists of conditions. Top-level
//! keys are AND'd, the list under each key is OR'd, and the reserved `$or`
//! key holds a list of alternative sub-policies. Under the MessageBody
//! scope, keys may nest to mirror the body's object structure.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::queue::MessageAttributeValue;

/// Which part of the message the policy is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterScope {
    #[default]
    MessageAttributes,
    MessageBody,
}

impl FilterScope {
    pub fn parse(raw: &str) -> Self {
        if raw == "MessageBody" {
            Self::MessageBody
        } else {
            Self::MessageAttributes
        }
    }
}

/// Evaluate a raw policy string against a message. Malformed policy JSON
/// fails open: the message is delivered.
pub fn evaluate(
    policy_raw: &str,
    scope: FilterScope,
    attributes: &HashMap<String, MessageAttributeValue>,
    body: &str,
) -> bool {
    let policy: Value = match serde_json::from_str(policy_raw) {
        Ok(value) => value,
        Err(_) => return true,
    };
    let Some(policy) = policy.as_object() else {
        return true;
    };
    if policy.is_empty() {
        return true;
    }
    match scope {
        FilterScope::MessageAttributes => eval_policy(policy, &attributes_value(attributes)),
        FilterScope::MessageBody => match serde_json::from_str::<Value>(body) {
            Ok(parsed) if parsed.is_object() => eval_policy(policy, &parsed),
            _ => false,
        },
    }
}

/// Message attributes as a flat JSON object: `Number`-typed values parse as
/// numbers, everything else uses the string value. Binary attributes are
/// not filterable.
fn attributes_value(attributes: &HashMap<String, MessageAttributeValue>) -> Value {
    let mut map = Map::new();
    for (name, attr) in attributes {
        let is_number = attr.data_type == "Number" || attr.data_type.starts_with("Number.");
        let Some(raw) = attr.string_value.as_deref() else {
            continue;
        };
        let value = if is_number {
            raw.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .unwrap_or_else(|| Value::String(raw.to_string()))
        } else {
            Value::String(raw.to_string())
        };
        map.insert(name.clone(), value);
    }
    Value::Object(map)
}

fn eval_policy(policy: &Map<String, Value>, input: &Value) -> bool {
    policy.iter().all(|(key, spec)| {
        if key == "$or" {
            return match spec {
                Value::Array(alternatives) => alternatives.iter().any(|alt| {
                    alt.as_object().is_some_and(|p| eval_policy(p, input))
                }),
                _ => false,
            };
        }
        let field = input.get(key);
        match spec {
            // OR over the condition list.
            Value::Array(conditions) => {
                conditions.iter().any(|c| condition_matches(c, field))
            }
            // Nested policy (MessageBody scope).
            Value::Object(nested) => match field {
                Some(inner) => eval_policy(nested, inner),
                None => false,
            },
            _ => false,
        }
    })
}

fn field_str(field: Option<&Value>) -> Option<&str> {
    field.and_then(Value::as_str)
}

fn field_number(field: Option<&Value>) -> Option<f64> {
    match field? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn condition_matches(condition: &Value, field: Option<&Value>) -> bool {
    match condition {
        Value::Null => field.is_none(),
        Value::String(expected) => field_str(field) == Some(expected.as_str()),
        Value::Number(expected) => {
            matches!((expected.as_f64(), field_number(field)), (Some(e), Some(f)) if e == f)
        }
        Value::Bool(expected) => match field {
            Some(Value::Bool(actual)) => actual == expected,
            Some(Value::String(actual)) => actual == if *expected { "true" } else { "false" },
            _ => false,
        },
        Value::Object(keyword) => keyword_matches(keyword, field),
        _ => false,
    }
}

fn keyword_matches(keyword: &Map<String, Value>, field: Option<&Value>) -> bool {
    // Keyword conditions carry exactly one operator.
    let Some((op, arg)) = keyword.iter().next() else {
        return false;
    };
    match op.as_str() {
        "exists" => match arg.as_bool() {
            Some(true) => field.is_some(),
            Some(false) => field.is_none(),
            None => false,
        },
        "prefix" => matches!((arg.as_str(), field_str(field)), (Some(p), Some(s)) if s.starts_with(p)),
        "suffix" => matches!((arg.as_str(), field_str(field)), (Some(p), Some(s)) if s.ends_with(p)),
        "equals-ignore-case" => matches!(
            (arg.as_str(), field_str(field)),
            (Some(p), Some(s)) if s.to_lowercase() == p.to_lowercase()
        ),
        "wildcard" => matches!(
            (arg.as_str(), field_str(field)),
            (Some(p), Some(s)) if wildcard_matches(p, s)
        ),
        "numeric" => match (arg.as_array(), field_number(field)) {
            (Some(ops), Some(value)) => numeric_matches(ops, value),
            _ => false,
        },
        "anything-but" => anything_but_matches(arg, field),
        _ => false,
    }
}

/// Glob-style match where `*` spans any run of characters.
fn wildcard_matches(pattern: &str, text: &str) -> bool {
    let mut segments = pattern.split('*');
    let Some(first) = segments.next() else {
        return text.is_empty();
    };
    if !text.starts_with(first) {
        return false;
    }
    let mut rest = &text[first.len()..];
    let mut last_segment: Option<&str> = None;
    for segment in segments {
        last_segment = Some(segment);
        if segment.is_empty() {
            continue;
        }
        match rest.find(segment) {
            Some(pos) => rest = &rest[pos + segment.len()..],
            None => return false,
        }
    }
    match last_segment {
        // No '*' at all: the whole text must have been consumed.
        None => rest.is_empty(),
        Some("") => true,
        Some(segment) => {
            // The final literal segment must sit at the end of the text;
            // `rest` already points past its first occurrence.
            text.ends_with(segment) || rest.is_empty()
        }
    }
}

/// `[op, n, op, n, …]` pairs AND'd together.
fn numeric_matches(ops: &[Value], value: f64) -> bool {
    let mut pairs = ops.chunks(2);
    if ops.is_empty() || ops.len() % 2 != 0 {
        return false;
    }
    pairs.all(|pair| {
        let (Some(op), Some(bound)) = (pair[0].as_str(), pair[1].as_f64()) else {
            return false;
        };
        match op {
            "=" => value == bound,
            ">" => value > bound,
            ">=" => value >= bound,
            "<" => value < bound,
            "<=" => value <= bound,
            _ => false,
        }
    })
}

/// Negation: the field must exist and not match any listed value or the
/// described prefix/suffix/wildcard condition.
fn anything_but_matches(arg: &Value, field: Option<&Value>) -> bool {
    if field.is_none() {
        return false;
    }
    let excluded = |candidate: &Value| condition_matches(candidate, field);
    match arg {
        Value::Array(values) => !values.iter().any(excluded),
        Value::Object(_) => !condition_matches(arg, field),
        single => !excluded(single),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(pairs: &[(&str, MessageAttributeValue)]) -> HashMap<String, MessageAttributeValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn eval_attrs(policy: Value, attributes: &HashMap<String, MessageAttributeValue>) -> bool {
        evaluate(
            &policy.to_string(),
            FilterScope::MessageAttributes,
            attributes,
            "",
        )
    }

    fn eval_body(policy: Value, body: &str) -> bool {
        evaluate(
            &policy.to_string(),
            FilterScope::MessageBody,
            &HashMap::new(),
            body,
        )
    }

    #[test]
    fn test_literal_string_or_list() {
        let attributes = attrs(&[("color", MessageAttributeValue::string("red"))]);
        assert!(eval_attrs(json!({"color": ["red", "blue"]}), &attributes));
        assert!(!eval_attrs(json!({"color": ["green"]}), &attributes));
    }

    #[test]
    fn test_top_level_keys_are_anded() {
        let attributes = attrs(&[
            ("color", MessageAttributeValue::string("red")),
            ("size", MessageAttributeValue::string("xl")),
        ]);
        assert!(eval_attrs(
            json!({"color": ["red"], "size": ["xl"]}),
            &attributes
        ));
        assert!(!eval_attrs(
            json!({"color": ["red"], "size": ["s"]}),
            &attributes
        ));
    }

    #[test]
    fn test_numeric_attribute_equality() {
        let attributes = attrs(&[("retries", MessageAttributeValue::number("3"))]);
        assert!(eval_attrs(json!({"retries": [3]}), &attributes));
        assert!(!eval_attrs(json!({"retries": [4]}), &attributes));
    }

    #[test]
    fn test_exists_condition() {
        let attributes = attrs(&[("color", MessageAttributeValue::string("red"))]);
        assert!(eval_attrs(json!({"color": [{"exists": true}]}), &attributes));
        assert!(eval_attrs(json!({"size": [{"exists": false}]}), &attributes));
        assert!(!eval_attrs(json!({"size": [{"exists": true}]}), &attributes));
    }

    #[test]
    fn test_prefix_suffix_and_case_insensitive() {
        let attributes = attrs(&[("file", MessageAttributeValue::string("Report.PDF"))]);
        assert!(eval_attrs(json!({"file": [{"prefix": "Rep"}]}), &attributes));
        assert!(eval_attrs(json!({"file": [{"suffix": ".PDF"}]}), &attributes));
        assert!(eval_attrs(
            json!({"file": [{"equals-ignore-case": "report.pdf"}]}),
            &attributes
        ));
        assert!(!eval_attrs(json!({"file": [{"prefix": "port"}]}), &attributes));
    }

    #[test]
    fn test_wildcard_condition() {
        let attributes = attrs(&[("path", MessageAttributeValue::string("orders/2024/x.json"))]);
        assert!(eval_attrs(
            json!({"path": [{"wildcard": "orders/*/x.json"}]}),
            &attributes
        ));
        assert!(eval_attrs(json!({"path": [{"wildcard": "orders/*"}]}), &attributes));
        assert!(!eval_attrs(
            json!({"path": [{"wildcard": "invoices/*"}]}),
            &attributes
        ));
    }

    #[test]
    fn test_numeric_range() {
        let attributes = attrs(&[("price", MessageAttributeValue::number("74.5"))]);
        assert!(eval_attrs(
            json!({"price": [{"numeric": [">", 50, "<=", 74.5]}]}),
            &attributes
        ));
        assert!(!eval_attrs(
            json!({"price": [{"numeric": [">", 80]}]}),
            &attributes
        ));
        // Non-numeric attribute never matches numeric.
        let text = attrs(&[("price", MessageAttributeValue::string("cheap"))]);
        assert!(!eval_attrs(json!({"price": [{"numeric": [">", 0]}]}), &text));
    }

    #[test]
    fn test_anything_but() {
        let attributes = attrs(&[("status", MessageAttributeValue::string("open"))]);
        assert!(eval_attrs(
            json!({"status": [{"anything-but": ["closed"]}]}),
            &attributes
        ));
        assert!(!eval_attrs(
            json!({"status": [{"anything-but": ["open", "closed"]}]}),
            &attributes
        ));
        assert!(!eval_attrs(
            json!({"status": [{"anything-but": {"prefix": "op"}}]}),
            &attributes
        ));
        // Absent attribute fails anything-but.
        assert!(!eval_attrs(
            json!({"missing": [{"anything-but": ["x"]}]}),
            &attributes
        ));
    }

    #[test]
    fn test_null_matches_absent_only() {
        let attributes = attrs(&[("present", MessageAttributeValue::string("x"))]);
        assert!(eval_attrs(json!({"absent": [null]}), &attributes));
        assert!(!eval_attrs(json!({"present": [null]}), &attributes));
    }

    #[test]
    fn test_or_of_policies() {
        let attributes = attrs(&[("color", MessageAttributeValue::string("red"))]);
        let policy = json!({"$or": [
            {"color": ["blue"]},
            {"color": ["red"]}
        ]});
        assert!(eval_attrs(policy, &attributes));
        let policy = json!({"$or": [
            {"color": ["blue"]},
            {"size": ["xl"]}
        ]});
        assert!(!eval_attrs(policy, &attributes));
    }

    #[test]
    fn test_body_scope_nested_keys() {
        let body = r#"{"detail": {"state": "running", "count": 2}}"#;
        assert!(eval_body(json!({"detail": {"state": ["running"]}}), body));
        assert!(eval_body(
            json!({"detail": {"count": [{"numeric": [">", 1]}]}}),
            body
        ));
        assert!(!eval_body(json!({"detail": {"state": ["stopped"]}}), body));
    }

    #[test]
    fn test_body_scope_requires_json_object() {
        assert!(!eval_body(json!({"k": ["v"]}), "not json"));
        assert!(!eval_body(json!({"k": ["v"]}), "[1,2,3]"));
    }

    #[test]
    fn test_malformed_policy_fails_open() {
        let attributes = HashMap::new();
        assert!(evaluate(
            "{not json",
            FilterScope::MessageAttributes,
            &attributes,
            ""
        ));
        assert!(evaluate(
            "\"just a string\"",
            FilterScope::MessageAttributes,
            &attributes,
            ""
        ));
    }

    #[test]
    fn test_body_scope_boolean_literal() {
        let body = r#"{"active": true}"#;
        assert!(eval_body(json!({"active": [true]}), body));
        assert!(!eval_body(json!({"active": [false]}), body));
    }
}
