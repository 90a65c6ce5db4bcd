//! Structural JSON-schema conformance checking for function-call arguments.
//!
//! Supports the schema subset that function declarations actually use:
//! `type` (including type arrays), `enum`, `properties` / `required` /
//! `additionalProperties: false`, and `items`. Keywords outside this subset
//! are not enforced. Errors carry a `$.path.to.field` prefix so validation
//! failures name the offending argument.

use serde_json::Value;

/// Validates `data` against `schema`. Returns a human-readable description
/// of the first violation found.
pub fn validate(schema: &Value, data: &Value) -> Result<(), String> {
    validate_at(schema, data, "$")
}

fn validate_at(schema: &Value, data: &Value, path: &str) -> Result<(), String> {
    if let Some(expected) = schema.get("type") {
        check_type(expected, data, path)?;
    }

    if let Some(allowed) = schema.get("enum").and_then(Value::as_array) {
        if !allowed.iter().any(|v| v == data) {
            return Err(format!("{path}: value not in enum {allowed:?}"));
        }
    }

    if let Some(object) = data.as_object() {
        let properties = schema.get("properties").and_then(Value::as_object);

        if let Some(properties) = properties {
            for (key, prop_schema) in properties {
                if let Some(value) = object.get(key) {
                    validate_at(prop_schema, value, &format!("{path}.{key}"))?;
                }
            }

            if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
                for key in object.keys() {
                    if !properties.contains_key(key) {
                        return Err(format!("{path}: unexpected property '{key}'"));
                    }
                }
            }
        }

        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(name) {
                    return Err(format!("{path}: missing required property '{name}'"));
                }
            }
        }
    }

    if let (Some(items), Some(array)) = (schema.get("items"), data.as_array()) {
        for (index, element) in array.iter().enumerate() {
            validate_at(items, element, &format!("{path}[{index}]"))?;
        }
    }

    Ok(())
}

fn check_type(expected: &Value, data: &Value, path: &str) -> Result<(), String> {
    match expected {
        Value::String(name) => {
            if type_matches(name, data) {
                Ok(())
            } else {
                Err(format!(
                    "{path}: expected {name}, got {}",
                    type_name(data)
                ))
            }
        }
        // Type unions: any member may match.
        Value::Array(names) => {
            let hit = names
                .iter()
                .filter_map(Value::as_str)
                .any(|name| type_matches(name, data));
            if hit {
                Ok(())
            } else {
                Err(format!(
                    "{path}: expected one of {names:?}, got {}",
                    type_name(data)
                ))
            }
        }
        other => Err(format!("{path}: malformed type keyword {other}")),
    }
}

fn type_matches(name: &str, data: &Value) -> bool {
    match name {
        "null" => data.is_null(),
        "boolean" => data.is_boolean(),
        "number" => data.is_number(),
        "integer" => {
            data.as_i64().is_some()
                || data.as_u64().is_some()
                || data.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        "string" => data.is_string(),
        "array" => data.is_array(),
        "object" => data.is_object(),
        _ => false,
    }
}

fn type_name(data: &Value) -> &'static str {
    match data {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

const KNOWN_TYPES: [&str; 7] = [
    "null", "boolean", "number", "integer", "string", "array", "object",
];

/// Checks that a declaration's parameter schema is well-formed enough to
/// validate against. Run once at engine construction so malformed
/// declarations fail fast instead of rejecting every response.
pub fn check_schema(schema: &Value) -> Result<(), String> {
    check_schema_at(schema, "$")
}

fn check_schema_at(schema: &Value, path: &str) -> Result<(), String> {
    let object = schema
        .as_object()
        .ok_or_else(|| format!("{path}: schema must be an object"))?;

    match object.get("type") {
        None => {}
        Some(Value::String(name)) => {
            if !KNOWN_TYPES.contains(&name.as_str()) {
                return Err(format!("{path}: unknown type '{name}'"));
            }
        }
        Some(Value::Array(names)) => {
            for name in names {
                match name.as_str() {
                    Some(name) if KNOWN_TYPES.contains(&name) => {}
                    _ => return Err(format!("{path}: unknown type {name}")),
                }
            }
        }
        Some(other) => return Err(format!("{path}: malformed type keyword {other}")),
    }

    if let Some(properties) = object.get("properties") {
        let properties = properties
            .as_object()
            .ok_or_else(|| format!("{path}: properties must be an object"))?;
        for (key, prop_schema) in properties {
            check_schema_at(prop_schema, &format!("{path}.{key}"))?;
        }
    }

    if let Some(required) = object.get("required") {
        let names = required
            .as_array()
            .ok_or_else(|| format!("{path}: required must be an array"))?;
        if names.iter().any(|n| !n.is_string()) {
            return Err(format!("{path}: required entries must be strings"));
        }
    }

    if let Some(items) = object.get("items") {
        check_schema_at(items, &format!("{path}.items"))?;
    }

    if let Some(allowed) = object.get("enum") {
        if !allowed.is_array() {
            return Err(format!("{path}: enum must be an array"));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validates_primitive_types() {
        assert!(validate(&json!({"type": "string"}), &json!("hello")).is_ok());
        assert!(validate(&json!({"type": "string"}), &json!(42)).is_err());
        assert!(validate(&json!({"type": "number"}), &json!(1.5)).is_ok());
        assert!(validate(&json!({"type": "boolean"}), &json!(true)).is_ok());
        assert!(validate(&json!({"type": "null"}), &json!(null)).is_ok());
    }

    #[test]
    fn integer_rejects_fractional_numbers() {
        let schema = json!({"type": "integer"});
        assert!(validate(&schema, &json!(3)).is_ok());
        assert!(validate(&schema, &json!(3.0)).is_ok());
        assert!(validate(&schema, &json!(3.5)).is_err());
    }

    #[test]
    fn type_unions_accept_any_member() {
        let schema = json!({"type": ["string", "null"]});
        assert!(validate(&schema, &json!("x")).is_ok());
        assert!(validate(&schema, &json!(null)).is_ok());
        assert!(validate(&schema, &json!(1)).is_err());
    }

    #[test]
    fn enum_membership() {
        let schema = json!({"type": "string", "enum": ["celsius", "fahrenheit"]});
        assert!(validate(&schema, &json!("celsius")).is_ok());
        assert!(validate(&schema, &json!("kelvin")).is_err());
    }

    #[test]
    fn object_properties_and_required() {
        let schema = json!({
            "type": "object",
            "properties": {
                "location": {"type": "string"},
                "days": {"type": "integer"}
            },
            "required": ["location"]
        });
        assert!(validate(&schema, &json!({"location": "Berlin"})).is_ok());
        assert!(validate(&schema, &json!({"location": "Berlin", "days": 3})).is_ok());

        let missing = validate(&schema, &json!({"days": 3})).unwrap_err();
        assert!(missing.contains("location"), "{missing}");

        let wrong = validate(&schema, &json!({"location": 7})).unwrap_err();
        assert!(wrong.contains("$.location"), "{wrong}");
    }

    #[test]
    fn additional_properties_false_rejects_extras() {
        let schema = json!({
            "type": "object",
            "properties": {"a": {"type": "string"}},
            "additionalProperties": false
        });
        assert!(validate(&schema, &json!({"a": "x"})).is_ok());
        let err = validate(&schema, &json!({"a": "x", "b": 1})).unwrap_err();
        assert!(err.contains("unexpected property 'b'"), "{err}");
    }

    #[test]
    fn array_items_validated_with_index_in_path() {
        let schema = json!({"type": "array", "items": {"type": "integer"}});
        assert!(validate(&schema, &json!([1, 2, 3])).is_ok());
        let err = validate(&schema, &json!([1, "two"])).unwrap_err();
        assert!(err.contains("$[1]"), "{err}");
    }

    #[test]
    fn nested_paths_reported() {
        let schema = json!({
            "type": "object",
            "properties": {
                "config": {
                    "type": "object",
                    "properties": {"retries": {"type": "integer"}}
                }
            }
        });
        let err = validate(&schema, &json!({"config": {"retries": "many"}})).unwrap_err();
        assert!(err.contains("$.config.retries"), "{err}");
    }

    #[test]
    fn check_schema_accepts_typical_declarations() {
        let schema = json!({
            "type": "object",
            "properties": {
                "query": {"type": "string", "description": "Search text"},
                "limit": {"type": "integer"}
            },
            "required": ["query"],
            "additionalProperties": false
        });
        assert!(check_schema(&schema).is_ok());
    }

    #[test]
    fn check_schema_rejects_malformed_declarations() {
        assert!(check_schema(&json!("not a schema")).is_err());
        assert!(check_schema(&json!({"type": "integerish"})).is_err());
        assert!(check_schema(&json!({"properties": []})).is_err());
        assert!(check_schema(&json!({
            "type": "object",
            "properties": {"a": {"type": "nope"}}
        }))
        .is_err());
    }
}
