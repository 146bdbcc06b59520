//! OCPP-J message framing
//!
//! Frames are positional JSON arrays:
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]
//!
//! `decode` and `encode` are exact inverses for every well-formed envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::actions::{Action, ActionDescriptor, ActionRegistry, UnknownAction};
use super::payload::{from_payload, to_payload, PayloadError, Request};

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

impl MessageType {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            2 => Some(MessageType::Call),
            3 => Some(MessageType::CallResult),
            4 => Some(MessageType::CallError),
            _ => None,
        }
    }

    /// Number of array elements a frame of this type carries
    pub fn arity(self) -> usize {
        match self {
            MessageType::Call => 4,
            MessageType::CallResult => 3,
            MessageType::CallError => 5,
        }
    }
}

/// OCPP 1.6 CALLERROR codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotImplemented => "NotImplemented",
            ErrorCode::NotSupported => "NotSupported",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::SecurityError => "SecurityError",
            ErrorCode::FormationViolation => "FormationViolation",
            ErrorCode::PropertyConstraintViolation => "PropertyConstraintViolation",
            ErrorCode::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            ErrorCode::TypeConstraintViolation => "TypeConstraintViolation",
            ErrorCode::GenericError => "GenericError",
        }
    }

    /// Parse a wire code; codes outside the 1.6 set read as `GenericError`
    pub fn from_wire(code: &str) -> Self {
        serde_json::from_value(Value::String(code.to_string())).unwrap_or(ErrorCode::GenericError)
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frame decoding failures. Nothing is sent back for these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("frame is not valid JSON: {0}")]
    NotJson(String),

    #[error("frame is not an array")]
    NotArray,

    #[error("frame is empty")]
    Empty,

    #[error("message type is not an integer")]
    BadDiscriminator,

    #[error("unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("{kind:?} frame needs {expected} elements, got {found}")]
    Arity {
        kind: MessageType,
        expected: usize,
        found: usize,
    },

    #[error("field {0} has the wrong type")]
    FieldType(&'static str),

    #[error("message id is empty")]
    EmptyMessageId,

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },
}

/// OCPP CALL message (request)
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub message_id: String,
    /// Kept as received so unknown actions can still be answered
    pub action: String,
    pub payload: Value,
}

impl Call {
    pub fn new(message_id: impl Into<String>, action: Action, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            action: action.as_str().to_string(),
            payload,
        }
    }

    /// Build a CALL from a typed request body
    pub fn from_request<R: Request>(
        message_id: impl Into<String>,
        request: &R,
    ) -> Result<Self, PayloadError> {
        Ok(Self::new(message_id, R::ACTION, to_payload(request)?))
    }

    /// Resolve the action name against the registry
    pub fn descriptor(&self) -> Result<&'static ActionDescriptor, UnknownAction> {
        ActionRegistry::resolve(&self.action)
    }

    /// Parse the payload as a typed request
    pub fn parse_payload<R: Request>(&self) -> Result<R, PayloadError> {
        from_payload(&self.payload)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: impl Into<String>, payload: Value) -> Self {
        Self {
            message_id: message_id.into(),
            payload,
        }
    }

    /// Build a CALLRESULT from a typed confirmation body
    pub fn from_response<T: Serialize>(
        message_id: impl Into<String>,
        response: &T,
    ) -> Result<Self, PayloadError> {
        Ok(Self::new(message_id, to_payload(response)?))
    }

    /// Parse the payload as a specific confirmation type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, PayloadError> {
        from_payload(&self.payload)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone, PartialEq)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    /// Create a CALLERROR with empty details
    pub fn new(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.error_details = details;
        self
    }
}

/// Any decoded OCPP frame
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

impl Envelope {
    pub fn message_type(&self) -> MessageType {
        match self {
            Envelope::Call(_) => MessageType::Call,
            Envelope::CallResult(_) => MessageType::CallResult,
            Envelope::CallError(_) => MessageType::CallError,
        }
    }

    /// Get the message ID
    pub fn message_id(&self) -> &str {
        match self {
            Envelope::Call(c) => &c.message_id,
            Envelope::CallResult(r) => &r.message_id,
            Envelope::CallError(e) => &e.message_id,
        }
    }

    pub fn encode(&self) -> String {
        encode(self)
    }
}

impl From<Call> for Envelope {
    fn from(call: Call) -> Self {
        Envelope::Call(call)
    }
}

impl From<CallResult> for Envelope {
    fn from(result: CallResult) -> Self {
        Envelope::CallResult(result)
    }
}

impl From<CallError> for Envelope {
    fn from(error: CallError) -> Self {
        Envelope::CallError(error)
    }
}

/// Serialize an envelope to its wire form
pub fn encode(envelope: &Envelope) -> String {
    let array = match envelope {
        Envelope::Call(c) => serde_json::json!([
            MessageType::Call as i32,
            &c.message_id,
            &c.action,
            &c.payload
        ]),
        Envelope::CallResult(r) => serde_json::json!([
            MessageType::CallResult as i32,
            &r.message_id,
            &r.payload
        ]),
        Envelope::CallError(e) => serde_json::json!([
            MessageType::CallError as i32,
            &e.message_id,
            e.error_code.as_str(),
            &e.error_description,
            &e.error_details
        ]),
    };
    array.to_string()
}

/// Parse a frame, rejecting it before JSON parsing if it exceeds `limit` bytes
pub fn decode_bounded(raw: &str, limit: usize) -> Result<Envelope, ParseError> {
    if raw.len() > limit {
        return Err(ParseError::FrameTooLarge {
            size: raw.len(),
            limit,
        });
    }
    decode(raw)
}

/// Parse an OCPP frame
pub fn decode(raw: &str) -> Result<Envelope, ParseError> {
    let value: Value = serde_json::from_str(raw).map_err(|e| ParseError::NotJson(e.to_string()))?;
    let mut array = match value {
        Value::Array(items) => items,
        _ => return Err(ParseError::NotArray),
    };

    let first = array.first().ok_or(ParseError::Empty)?;
    let discriminator = first.as_i64().ok_or(ParseError::BadDiscriminator)?;
    let kind =
        MessageType::from_i64(discriminator).ok_or(ParseError::UnknownMessageType(discriminator))?;

    if array.len() != kind.arity() {
        return Err(ParseError::Arity {
            kind,
            expected: kind.arity(),
            found: array.len(),
        });
    }

    let message_id = take_string(&mut array[1], "messageId")?;
    if message_id.is_empty() {
        return Err(ParseError::EmptyMessageId);
    }

    match kind {
        MessageType::Call => {
            let action = take_string(&mut array[2], "action")?;
            Ok(Envelope::Call(Call {
                message_id,
                action,
                payload: array[3].take(),
            }))
        }
        MessageType::CallResult => Ok(Envelope::CallResult(CallResult {
            message_id,
            payload: array[2].take(),
        })),
        MessageType::CallError => {
            let code = take_string(&mut array[2], "errorCode")?;
            let error_description = take_string(&mut array[3], "errorDescription")?;
            Ok(Envelope::CallError(CallError {
                message_id,
                error_code: ErrorCode::from_wire(&code),
                error_description,
                error_details: array[4].take(),
            }))
        }
    }
}

fn take_string(value: &mut Value, field: &'static str) -> Result<String, ParseError> {
    match value.take() {
        Value::String(s) => Ok(s),
        _ => Err(ParseError::FieldType(field)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocpp::requests::*;
    use crate::ocpp::types::*;
    use serde_json::json;

    #[test]
    fn test_call_serialization() {
        let call = Call::from_request("msg-1", &HeartbeatRequest {}).unwrap();
        let text = encode(&call.into());
        assert_eq!(text, r#"[2,"msg-1","Heartbeat",{}]"#);
    }

    #[test]
    fn test_call_parsing() {
        let json = r#"[2, "msg-123", "Heartbeat", {}]"#;
        match decode(json).unwrap() {
            Envelope::Call(call) => {
                assert_eq!(call.message_id, "msg-123");
                assert_eq!(call.action, "Heartbeat");
                assert_eq!(call.descriptor().unwrap().action, Action::Heartbeat);
            }
            other => panic!("Expected Call, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_action_still_decodes() {
        let env = decode(r#"[2, "m", "Teleport", {}]"#).unwrap();
        match env {
            Envelope::Call(call) => assert!(call.descriptor().is_err()),
            other => panic!("Expected Call, got {:?}", other),
        }
    }

    #[test]
    fn test_call_result_parsing() {
        let json = r#"[3, "msg-123", {"currentTime": "2021-06-12T10:30:00Z"}]"#;
        match decode(json).unwrap() {
            Envelope::CallResult(result) => {
                assert_eq!(result.message_id, "msg-123");
                let conf: HeartbeatConf = result.parse_payload().unwrap();
                assert_eq!(conf.current_time.to_rfc3339(), "2021-06-12T10:30:00+00:00");
            }
            other => panic!("Expected CallResult, got {:?}", other),
        }
    }

    #[test]
    fn test_call_error_parsing() {
        let json = r#"[4, "msg-123", "NotImplemented", "Action not supported", {}]"#;
        match decode(json).unwrap() {
            Envelope::CallError(error) => {
                assert_eq!(error.message_id, "msg-123");
                assert_eq!(error.error_code, ErrorCode::NotImplemented);
                assert_eq!(error.error_description, "Action not supported");
            }
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_error_code_reads_as_generic() {
        match decode(r#"[4, "m", "RpcFrameworkError", "", {}]"#).unwrap() {
            Envelope::CallError(error) => assert_eq!(error.error_code, ErrorCode::GenericError),
            other => panic!("Expected CallError, got {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(decode("not json"), Err(ParseError::NotJson(_))));
        assert_eq!(decode(r#"{"a": 1}"#), Err(ParseError::NotArray));
        assert_eq!(decode("[]"), Err(ParseError::Empty));
        assert_eq!(decode(r#"["2", "m", {}]"#), Err(ParseError::BadDiscriminator));
        assert_eq!(decode(r#"[7, "m", {}]"#), Err(ParseError::UnknownMessageType(7)));
        assert_eq!(
            decode(r#"[2, "m", "Heartbeat"]"#),
            Err(ParseError::Arity {
                kind: MessageType::Call,
                expected: 4,
                found: 3
            })
        );
        assert_eq!(
            decode(r#"[3, "m", {}, {}]"#),
            Err(ParseError::Arity {
                kind: MessageType::CallResult,
                expected: 3,
                found: 4
            })
        );
        assert_eq!(decode(r#"[3, 12, {}]"#), Err(ParseError::FieldType("messageId")));
        assert_eq!(decode(r#"[2, "m", 5, {}]"#), Err(ParseError::FieldType("action")));
        assert_eq!(decode(r#"[3, "", {}]"#), Err(ParseError::EmptyMessageId));
    }

    #[test]
    fn test_frame_size_limit() {
        let frame = r#"[3, "msg-123", {}]"#;
        assert!(decode_bounded(frame, 64).is_ok());
        assert_eq!(
            decode_bounded(frame, 4),
            Err(ParseError::FrameTooLarge {
                size: frame.len(),
                limit: 4
            })
        );
    }

    #[test]
    fn test_envelopes_round_trip() {
        let envelopes: Vec<Envelope> = vec![
            Call::new(
                "a1",
                Action::RemoteStartTransaction,
                json!({"idTag": {"IdToken": "abc"}, "connectorId": 1}),
            )
            .into(),
            CallResult::new("a1", json!({"status": "Accepted"})).into(),
            CallError::new("a2", ErrorCode::FormationViolation, "missing idTag")
                .with_details(json!({"field": "idTag"}))
                .into(),
        ];
        for env in envelopes {
            assert_eq!(decode(&encode(&env)).unwrap(), env);
        }
    }

    #[test]
    fn test_float_payloads_round_trip_exactly() {
        for limit in [-7.398995119834865e127, 16.000000000000004, 0.1 + 0.2, f64::MIN_POSITIVE] {
            let env: Envelope = CallResult::new("m1", json!({"limit": limit})).into();
            let decoded = decode(&encode(&env)).unwrap();
            assert_eq!(decoded, env);
            match decoded {
                Envelope::CallResult(r) => assert_eq!(r.payload["limit"].as_f64(), Some(limit)),
                other => panic!("Expected CallResult, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_call_result_from_typed_response() {
        let result = CallResult::from_response(
            "msg-9",
            &RemoteStartTransactionConf {
                status: RemoteStartStopStatus::Rejected,
            },
        )
        .unwrap();
        assert_eq!(encode(&result.into()), r#"[3,"msg-9",{"status":"Rejected"}]"#);
    }
}
