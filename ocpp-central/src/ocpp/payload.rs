//! Payload serialization contract
//!
//! Typed bodies are plain serde structs. Required fields are non-`Option`
//! members, so a body cannot be constructed without them; optional fields are
//! `Option` members tagged `skip_serializing_if`, so an absent value never
//! reaches the wire as `null`.
//!
//! [`to_payload`] and [`from_payload`] are the only conversions between typed
//! bodies and the JSON tree carried in an envelope.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::actions::Action;

/// Errors converting between typed bodies and wire payloads
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("cannot serialize {type_name}: {reason}")]
    Serialization {
        type_name: &'static str,
        reason: String,
    },

    #[error("payload does not match {type_name}: {reason}")]
    SchemaViolation {
        type_name: &'static str,
        reason: String,
    },
}

impl PayloadError {
    pub fn schema(type_name: &'static str, reason: impl Into<String>) -> Self {
        PayloadError::SchemaViolation {
            type_name,
            reason: reason.into(),
        }
    }
}

/// A request body bound to its action and confirmation type
pub trait Request: Serialize + DeserializeOwned + Send + 'static {
    const ACTION: Action;
    type Response: Serialize + DeserializeOwned + Send + 'static;
}

/// Serialize a typed body into a wire payload.
///
/// The result is always a JSON object. A value that serde renders as `null`
/// (a non-finite float, a `None` inside a list) has no wire form and fails.
pub fn to_payload<T: Serialize>(body: &T) -> Result<Value, PayloadError> {
    let type_name = std::any::type_name::<T>();
    let value = serde_json::to_value(body).map_err(|e| PayloadError::Serialization {
        type_name,
        reason: e.to_string(),
    })?;

    if !value.is_object() {
        return Err(PayloadError::Serialization {
            type_name,
            reason: "payload must serialize to an object".to_string(),
        });
    }

    if let Some(path) = find_null(&value, String::new()) {
        return Err(PayloadError::Serialization {
            type_name,
            reason: format!("no wire representation for value at {}", path),
        });
    }

    Ok(value)
}

/// Deserialize a wire payload into a typed body.
///
/// Unknown fields are ignored; missing required fields and mistyped values
/// are schema violations.
pub fn from_payload<T: DeserializeOwned>(raw: &Value) -> Result<T, PayloadError> {
    let type_name = std::any::type_name::<T>();
    if !raw.is_object() {
        return Err(PayloadError::schema(type_name, "payload is not an object"));
    }
    T::deserialize(raw).map_err(|e| PayloadError::schema(type_name, e.to_string()))
}

/// Validate a raw payload against a body type without keeping the result
pub fn check_shape<T: DeserializeOwned>(raw: &Value) -> Result<(), PayloadError> {
    from_payload::<T>(raw).map(|_| ())
}

fn find_null(value: &Value, path: String) -> Option<String> {
    match value {
        Value::Null => Some(if path.is_empty() { "$".to_string() } else { path }),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .find_map(|(i, v)| find_null(v, format!("{}[{}]", path, i))),
        Value::Object(fields) => fields.iter().find_map(|(k, v)| {
            let sub = if path.is_empty() {
                k.clone()
            } else {
                format!("{}.{}", path, k)
            };
            find_null(v, sub)
        }),
        _ => None,
    }
}
