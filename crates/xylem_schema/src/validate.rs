//! Reported-value validation against schema field descriptors.

use serde_json::Value as JsonValue;

use crate::SchemaError;

/// Check a reported value against the declared type in `descriptor`.
///
/// With `try_convert`, lenient coercions run first: strings parse into
/// numbers, integers and booleans, scalars stringify for string fields, and
/// strings holding embedded JSON parse for object and array fields. The
/// possibly coerced value is returned; a value that cannot be made to fit
/// is an error, never a silent drop.
pub fn validate_value(
    result: &str,
    descriptor: &JsonValue,
    value: JsonValue,
    try_convert: bool,
) -> Result<JsonValue, SchemaError> {
    let declared = descriptor
        .get("type")
        .and_then(JsonValue::as_str)
        .unwrap_or_default();
    let value = if try_convert {
        coerce(declared, value)
    } else {
        value
    };
    if type_matches(declared, &value) {
        Ok(value)
    } else {
        Err(SchemaError::InvalidValue {
            result: result.to_string(),
            expected: declared.to_string(),
            value: preview(&value),
        })
    }
}

fn type_matches(declared: &str, value: &JsonValue) -> bool {
    match declared {
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        // types without a storage mapping pass through unvalidated
        _ => true,
    }
}

fn coerce(declared: &str, value: JsonValue) -> JsonValue {
    if let JsonValue::String(text) = &value {
        let trimmed = text.trim();
        match declared {
            "integer" => {
                if let Ok(parsed) = trimmed.parse::<i64>() {
                    return JsonValue::from(parsed);
                }
            }
            "number" => {
                if let Ok(parsed) = trimmed.parse::<f64>() {
                    return JsonValue::from(parsed);
                }
            }
            "boolean" => match trimmed {
                "true" | "True" | "1" => return JsonValue::Bool(true),
                "false" | "False" | "0" => return JsonValue::Bool(false),
                _ => {}
            },
            "object" | "array" => {
                if let Ok(parsed) = serde_json::from_str::<JsonValue>(trimmed) {
                    return parsed;
                }
            }
            _ => {}
        }
        return value;
    }

    match (declared, &value) {
        ("string", JsonValue::Number(n)) => JsonValue::String(n.to_string()),
        ("string", JsonValue::Bool(b)) => JsonValue::String(b.to_string()),
        ("integer", JsonValue::Number(n)) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 => JsonValue::from(f as i64),
            _ => value,
        },
        _ => value,
    }
}

fn preview(value: &JsonValue) -> String {
    let rendered = value.to_string();
    if rendered.chars().count() > 120 {
        let mut short: String = rendered.chars().take(120).collect();
        short.push_str("...");
        short
    } else {
        rendered
    }
}
