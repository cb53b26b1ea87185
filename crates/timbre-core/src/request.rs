//! `/generate` body validation.
//!
//! The wire format uses human-readable keys with spaces, so the body is checked
//! field by field against a fixed schema instead of derived `Deserialize`.
//! Validation runs before the pipeline touches any file.

use serde_json::{Map, Value};

use crate::types::{ConversionRequest, GpuId};

/// A body that does not match the `/generate` schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SchemaError(pub String);

const TOP_LEVEL_REQUIRED: &[&str] = &["Inputs", "Options", "Output File", "GPU ID", "Session ID"];

/// Parse and validate a raw request body.
pub fn parse_body(body: &[u8]) -> Result<ConversionRequest, SchemaError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| SchemaError(format!("request body is not valid JSON: {e}")))?;
    validate(&value)
}

/// Validate an already-decoded JSON value.
pub fn validate(value: &Value) -> Result<ConversionRequest, SchemaError> {
    let root = as_object(value, "request body")?;
    for key in TOP_LEVEL_REQUIRED {
        require(root, key, "request body")?;
    }

    let inputs = as_object(&root["Inputs"], "Inputs")?;
    let input_audio_id = string_field(inputs, "User Audio", "Inputs")?;

    let options = as_object(&root["Options"], "Options")?;
    let character = string_field(options, "Character", "Options")?;
    let pitch_shift = integer_field(options, "Pitch Shift", "Options")?;
    let architecture = match options.get("Architecture") {
        None => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => return Err(type_error("Options.Architecture", other, "'string'")),
    };

    let output_audio_id = string_field(root, "Output File", "")?;

    let gpu_id = match &root["GPU ID"] {
        Value::String(s) => GpuId::Name(s.clone()),
        other => match integer(other) {
            JsonInteger::Fits(i) => GpuId::Index(i),
            JsonInteger::OutOfRange => return Err(range_error("GPU ID", other)),
            JsonInteger::NotInteger => {
                return Err(type_error("GPU ID", other, "'string', 'integer'"));
            }
        },
    };

    let session_id = match &root["Session ID"] {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => return Err(type_error("Session ID", other, "'string', 'null'")),
    };

    path_component("Inputs.User Audio", &input_audio_id)?;
    path_component("Options.Character", &character)?;
    path_component("Output File", &output_audio_id)?;
    if let Some(session) = session_id.as_deref().filter(|s| !s.is_empty()) {
        path_component("Session ID", session)?;
    }

    Ok(ConversionRequest {
        input_audio_id,
        architecture,
        character,
        pitch_shift,
        output_audio_id,
        gpu_id,
        session_id,
    })
}

fn as_object<'a>(value: &'a Value, path: &str) -> Result<&'a Map<String, Value>, SchemaError> {
    value
        .as_object()
        .ok_or_else(|| type_error(path, value, "'object'"))
}

fn require<'a>(
    object: &'a Map<String, Value>,
    key: &str,
    path: &str,
) -> Result<&'a Value, SchemaError> {
    object
        .get(key)
        .ok_or_else(|| SchemaError(format!("{path}: '{key}' is a required property")))
}

fn string_field(
    object: &Map<String, Value>,
    key: &str,
    parent: &str,
) -> Result<String, SchemaError> {
    let path = join(parent, key);
    match require(object, key, if parent.is_empty() { "request body" } else { parent })? {
        Value::String(s) => Ok(s.clone()),
        other => Err(type_error(&path, other, "'string'")),
    }
}

fn integer_field(
    object: &Map<String, Value>,
    key: &str,
    parent: &str,
) -> Result<i64, SchemaError> {
    let value = require(object, key, parent)?;
    let path = join(parent, key);
    match integer(value) {
        JsonInteger::Fits(i) => Ok(i),
        JsonInteger::OutOfRange => Err(range_error(&path, value)),
        JsonInteger::NotInteger => Err(type_error(&path, value, "'integer'")),
    }
}

enum JsonInteger {
    Fits(i64),
    OutOfRange,
    NotInteger,
}

/// JSON-schema integer semantics: `-3` and `-3.0` are integers, `"-3"` is not.
fn integer(value: &Value) -> JsonInteger {
    // 2^63; `i64::MAX as f64` rounds up to this, so the upper bound is exclusive.
    const LIMIT: f64 = 9_223_372_036_854_775_808.0;

    let Value::Number(n) = value else {
        return JsonInteger::NotInteger;
    };
    if let Some(i) = n.as_i64() {
        return JsonInteger::Fits(i);
    }
    if n.is_u64() {
        return JsonInteger::OutOfRange;
    }
    match n.as_f64() {
        Some(f) if f.fract() != 0.0 || !f.is_finite() => JsonInteger::NotInteger,
        Some(f) if f >= -LIMIT && f < LIMIT => JsonInteger::Fits(f as i64),
        Some(_) => JsonInteger::OutOfRange,
        None => JsonInteger::NotInteger,
    }
}

/// Ids become file and directory names, so each must be one path component.
fn path_component(path: &str, value: &str) -> Result<(), SchemaError> {
    if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\', '\0']) {
        return Err(SchemaError(format!(
            "{path}: {value:?} must be a non-empty name without path separators"
        )));
    }
    Ok(())
}

fn join(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

fn range_error(path: &str, value: &Value) -> SchemaError {
    SchemaError(format!("{path}: {value} is out of range for a 64-bit integer"))
}

fn type_error(path: &str, value: &Value, expected: &str) -> SchemaError {
    SchemaError(format!("{path}: {value} is not of type {expected}"))
}
