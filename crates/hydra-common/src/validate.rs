//! Structural and semantic validation of decoded envelopes.
//!
//! Violations are returned as [`ValidationFailure`] values, never raised
//! through the broker loop. Each failure names the violated rule and
//! carries enough of the offending message to debug a misbehaving peer
//! from the logs alone.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::error::HydraError;
use crate::types::PeerType;

/// Characters of the offending message kept in diagnostics.
const TRUNCATE_AT: usize = 500;

/// One-line summary of the expected envelope schema, included in every
/// failure diagnostic.
pub const EXPECTED_SCHEMA: &str = "{sender: string (HydraClient|HydraServer|SimpleClient|SimpleServer) [REQUIRED], \
     elem: string [REQUIRED], timestamp: finite number [OPTIONAL], \
     client_id: string [OPTIONAL], request_id: string [OPTIONAL], \
     data: object|null [OPTIONAL]}";

/// Size ceilings applied by rule 7.
#[derive(Debug, Clone, Copy)]
pub struct ValidatorLimits {
    /// Maximum serialized envelope size in bytes.
    pub max_message_bytes: usize,
    /// Maximum serialized size of the `data` field alone.
    pub max_data_bytes: usize,
}

impl Default for ValidatorLimits {
    fn default() -> Self {
        Self {
            max_message_bytes: crate::types::MAX_MESSAGE_SIZE,
            max_data_bytes: crate::types::MAX_DATA_SIZE,
        }
    }
}

/// Diagnostic for a rejected envelope.
#[derive(Debug, Clone)]
pub struct ValidationFailure {
    /// Short name of the violated rule.
    pub rule: &'static str,
    /// What exactly went wrong.
    pub message: String,
    /// Field names present on the observed message.
    pub observed_fields: Vec<String>,
    /// JSON type of each observed field.
    pub field_types: BTreeMap<String, &'static str>,
    /// The offending message, truncated to 500 characters.
    pub offending: String,
}

impl ValidationFailure {
    fn new(rule: &'static str, message: String, raw: &Value) -> Self {
        let (observed_fields, field_types) = match raw.as_object() {
            Some(map) => (
                map.keys().cloned().collect(),
                map.iter()
                    .map(|(k, v)| (k.clone(), json_type_name(v)))
                    .collect(),
            ),
            None => (Vec::new(), BTreeMap::new()),
        };
        Self {
            rule,
            message,
            observed_fields,
            field_types,
            offending: truncate(&raw.to_string()),
        }
    }

    /// Convert into the shared taxonomy for callers that propagate rather
    /// than log.
    #[must_use]
    pub fn into_error(self, component: &'static str) -> HydraError {
        HydraError::validation(component, self.message.clone())
            .with_context("rule", self.rule)
            .with_context("expected", EXPECTED_SCHEMA)
            .with_context("observed_fields", self.observed_fields.join(","))
            .with_context("offending", self.offending)
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rule {}: {} (expected {EXPECTED_SCHEMA}; observed fields [{}]; message: {})",
            self.rule,
            self.message,
            self.observed_fields.join(", "),
            self.offending
        )
    }
}

/// Validate a decoded envelope against the wire schema.
///
/// `serialized_len` is the byte length of the original wire form, used for
/// the size rule without re-serializing the whole message.
///
/// # Errors
/// Returns the first violated rule, in the documented order.
pub fn validate_envelope(
    raw: &Value,
    serialized_len: usize,
    limits: &ValidatorLimits,
) -> Result<(), ValidationFailure> {
    // Rule 1: the value is a mapping.
    let Some(map) = raw.as_object() else {
        return Err(ValidationFailure::new(
            "shape",
            format!("message must be an object, got {}", json_type_name(raw)),
            raw,
        ));
    };

    // Rule 2: required fields are present.
    let missing: Vec<&str> = ["sender", "elem"]
        .into_iter()
        .filter(|f| !map.contains_key(*f))
        .collect();
    if !missing.is_empty() {
        return Err(ValidationFailure::new(
            "required-fields",
            format!("missing required fields: {}", missing.join(", ")),
            raw,
        ));
    }

    // Rule 3: sender is a non-empty string in the valid set.
    let sender = &map["sender"];
    match sender.as_str() {
        None => {
            return Err(ValidationFailure::new(
                "sender-type",
                format!(
                    "field 'sender' must be a string, got {}",
                    json_type_name(sender)
                ),
                raw,
            ));
        }
        Some(s) if s.trim().is_empty() => {
            return Err(ValidationFailure::new(
                "sender-type",
                "field 'sender' must be a non-empty string".to_string(),
                raw,
            ));
        }
        Some(s) if PeerType::from_label(s).is_none() => {
            return Err(ValidationFailure::new(
                "sender-type",
                format!(
                    "invalid sender type '{s}', expected one of: {}",
                    PeerType::VALID_SENDERS.join(", ")
                ),
                raw,
            ));
        }
        Some(_) => {}
    }

    // Rule 4: elem is a non-empty string.
    let elem = &map["elem"];
    match elem.as_str() {
        None => {
            return Err(ValidationFailure::new(
                "elem",
                format!(
                    "field 'elem' must be a string, got {}",
                    json_type_name(elem)
                ),
                raw,
            ));
        }
        Some(s) if s.trim().is_empty() => {
            return Err(ValidationFailure::new(
                "elem",
                "field 'elem' must be a non-empty string".to_string(),
                raw,
            ));
        }
        Some(_) => {}
    }

    // Rule 5: data, when present, is an object or null.
    if let Some(data) = map.get("data") {
        if !data.is_object() && !data.is_null() {
            return Err(ValidationFailure::new(
                "data-shape",
                format!(
                    "field 'data' must be an object or null, got {}",
                    json_type_name(data)
                ),
                raw,
            ));
        }
    }

    // Rule 6: optional scalar fields have the right types.
    if let Some(ts) = map.get("timestamp") {
        match ts.as_f64() {
            None => {
                return Err(ValidationFailure::new(
                    "timestamp",
                    format!(
                        "field 'timestamp' must be a number, got {}",
                        json_type_name(ts)
                    ),
                    raw,
                ));
            }
            Some(v) if !v.is_finite() => {
                return Err(ValidationFailure::new(
                    "timestamp",
                    format!("field 'timestamp' must be a finite number, got {v}"),
                    raw,
                ));
            }
            Some(_) => {}
        }
    }
    for field in ["client_id", "request_id"] {
        if let Some(value) = map.get(field) {
            match value.as_str() {
                None => {
                    return Err(ValidationFailure::new(
                        "id-fields",
                        format!(
                            "field '{field}' must be a string, got {}",
                            json_type_name(value)
                        ),
                        raw,
                    ));
                }
                Some(s) if s.trim().is_empty() => {
                    return Err(ValidationFailure::new(
                        "id-fields",
                        format!("field '{field}' must be a non-empty string"),
                        raw,
                    ));
                }
                Some(_) => {}
            }
        }
    }

    // Rule 7: size ceilings.
    if serialized_len > limits.max_message_bytes {
        return Err(ValidationFailure::new(
            "size",
            format!(
                "message size {serialized_len} bytes exceeds maximum {} bytes",
                limits.max_message_bytes
            ),
            raw,
        ));
    }
    if let Some(data) = map.get("data") {
        if !data.is_null() {
            let data_len = data.to_string().len();
            if data_len > limits.max_data_bytes {
                return Err(ValidationFailure::new(
                    "size",
                    format!(
                        "data field size {data_len} bytes exceeds maximum {} bytes",
                        limits.max_data_bytes
                    ),
                    raw,
                ));
            }
        }
    }

    Ok(())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn truncate(s: &str) -> String {
    if s.len() <= TRUNCATE_AT {
        return s.to_string();
    }
    let mut cut = TRUNCATE_AT;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}... (truncated)", &s[..cut])
}
