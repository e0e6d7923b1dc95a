//! Lightweight JSON-schema validation for tool parameters.
//!
//! Covers the subset tool servers actually declare: top-level object shape,
//! `required` keys, and primitive `type` checks on declared properties.
//! Anything the schema doesn't constrain passes.

use serde_json::Value;

/// Validate `params` against a declared input schema.
/// Returns a human-readable reason on the first violation.
pub fn validate_params(schema: &Value, params: &Value) -> Result<(), String> {
    let Some(schema_obj) = schema.as_object() else {
        return Ok(());
    };

    if let Some(ty) = schema_obj.get("type").and_then(Value::as_str) {
        if ty == "object" && !params.is_object() {
            return Err(format!(
                "parameters must be an object, got {}",
                type_name(params)
            ));
        }
    }

    let Some(params_obj) = params.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema_obj.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !params_obj.contains_key(key) {
                return Err(format!("missing required parameter '{key}'"));
            }
        }
    }

    if let Some(properties) = schema_obj.get("properties").and_then(Value::as_object) {
        for (key, prop_schema) in properties {
            let Some(value) = params_obj.get(key) else {
                continue;
            };
            let Some(expected) = prop_schema.get("type").and_then(Value::as_str) else {
                continue;
            };
            if !matches_type(value, expected) {
                return Err(format!(
                    "parameter '{key}' should be {expected}, got {}",
                    type_name(value)
                ));
            }
        }
    }

    Ok(())
}

fn matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown schema type: don't reject what we don't understand.
        _ => true,
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
