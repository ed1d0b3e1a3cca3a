use crate::{SchemaViolation, ViolationReason};
use serde_json::{json, Value};

/// Validate `value` against `schema`, returning the first violation found.
pub fn validate(schema: &Value, value: &Value) -> Result<(), SchemaViolation> {
    validate_at(schema, value, "")
}

fn validate_at(schema: &Value, value: &Value, path: &str) -> Result<(), SchemaViolation> {
    // anyOf runs before the plain keywords; a schema with anyOf delegates
    // entirely to its branches.
    if let Some(branches) = schema.get("anyOf").and_then(Value::as_array) {
        return validate_any_of(branches, value, path);
    }

    if let Some(expected) = schema.get("type").and_then(Value::as_str) {
        if !type_matches(expected, value) {
            return Err(SchemaViolation::new(
                path,
                ViolationReason::Type,
                format!("{} must be {}", display_path(path), expected),
                Some(json!({ "expected": expected, "actual": type_name(value) })),
            ));
        }
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.contains(value) {
            return Err(SchemaViolation::new(
                path,
                ViolationReason::Enum,
                format!("{} must be one of {}", display_path(path), render_enum(allowed)),
                Some(json!({ "expected": allowed, "actual": value })),
            ));
        }
    }

    match value {
        Value::Object(map) => {
            // required -> per-property recurse -> additionalProperties
            if let Some(required) = schema.get("required").and_then(Value::as_array) {
                for key in required.iter().filter_map(Value::as_str) {
                    if !map.contains_key(key) {
                        let child = child_path(path, key);
                        return Err(SchemaViolation::new(
                            &child,
                            ViolationReason::Required,
                            format!("{} is required", display_path(&child)),
                            Some(json!({ "expected": key })),
                        ));
                    }
                }
            }

            let properties = schema.get("properties").and_then(Value::as_object);
            if let Some(properties) = properties {
                for (key, prop_schema) in properties {
                    if let Some(prop_value) = map.get(key) {
                        validate_at(prop_schema, prop_value, &child_path(path, key))?;
                    }
                }
            }

            if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                for key in map.keys() {
                    let known = properties.map(|p| p.contains_key(key)).unwrap_or(false);
                    if !known {
                        let child = child_path(path, key);
                        return Err(SchemaViolation::new(
                            &child,
                            ViolationReason::AdditionalProperties,
                            format!("{} is not a recognized property", display_path(&child)),
                            Some(json!({ "actual": key })),
                        ));
                    }
                }
            }
        }
        Value::Array(items) => {
            // minItems -> maxItems -> per-element recurse
            if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
                if (items.len() as u64) < min {
                    return Err(SchemaViolation::new(
                        path,
                        ViolationReason::MinItems,
                        format!("{} must have at least {} items", display_path(path), min),
                        Some(json!({ "expected": min, "actual": items.len() })),
                    ));
                }
            }
            if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
                if (items.len() as u64) > max {
                    return Err(SchemaViolation::new(
                        path,
                        ViolationReason::MaxItems,
                        format!("{} must have at most {} items", display_path(path), max),
                        Some(json!({ "expected": max, "actual": items.len() })),
                    ));
                }
            }
            if let Some(item_schema) = schema.get("items") {
                for (idx, item) in items.iter().enumerate() {
                    validate_at(item_schema, item, &format!("{}[{}]", path, idx))?;
                }
            }
        }
        _ => {}
    }

    Ok(())
}

fn validate_any_of(branches: &[Value], value: &Value, path: &str) -> Result<(), SchemaViolation> {
    for branch in branches {
        if validate_at(branch, value, path).is_ok() {
            return Ok(());
        }
    }

    // No branch matched; surface the distinguishing required keys of each
    // candidate so the caller can tell the branches apart.
    let candidates: Vec<Value> = branches
        .iter()
        .map(|branch| {
            let required: Vec<&str> = branch
                .get("required")
                .and_then(Value::as_array)
                .map(|keys| keys.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            json!({ "required": required })
        })
        .collect();

    Err(SchemaViolation::new(
        path,
        ViolationReason::AnyOf,
        format!("{} matches none of the expected shapes", display_path(path)),
        Some(json!({ "candidates": candidates, "actual": type_name(value) })),
    ))
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        _ => false,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "value"
    } else {
        path
    }
}

fn render_enum(allowed: &[Value]) -> String {
    let parts: Vec<String> = allowed.iter().map(|v| v.to_string()).collect();
    parts.join(", ")
}
