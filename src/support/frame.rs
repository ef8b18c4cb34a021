//! OCPP-J message framing
//!
//! The OCPP-J (JSON over WebSocket) transport envelope, identical across
//! OCPP 1.6 and 2.0.1:
//!
//! - **Call**       `[2, "<messageId>", "<action>", {<payload>}]`
//! - **CallResult** `[3, "<messageId>", {<payload>}]`
//! - **CallError**  `[4, "<messageId>", "<errorCode>", "<errorDescription>", {<errorDetails>}]`

use std::fmt;

use serde_json::Value;

const MSG_TYPE_CALL: u64 = 2;
const MSG_TYPE_CALL_RESULT: u64 = 3;
const MSG_TYPE_CALL_ERROR: u64 = 4;

// ── Error code taxonomy ────────────────────────────────────────

/// OCPP-J CALLERROR error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    // Spelled per the OCPP-J specification.
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotImplemented => "NotImplemented",
            Self::NotSupported => "NotSupported",
            Self::InternalError => "InternalError",
            Self::ProtocolError => "ProtocolError",
            Self::SecurityError => "SecurityError",
            Self::FormationViolation => "FormationViolation",
            Self::PropertyConstraintViolation => "PropertyConstraintViolation",
            Self::OccurenceConstraintViolation => "OccurenceConstraintViolation",
            Self::TypeConstraintViolation => "TypeConstraintViolation",
            Self::GenericError => "GenericError",
        }
    }

    /// Parse an error code received from the peer. Unknown codes map to
    /// `GenericError` rather than failing the whole frame.
    pub fn from_str(s: &str) -> Self {
        match s {
            "NotImplemented" => Self::NotImplemented,
            "NotSupported" => Self::NotSupported,
            "InternalError" => Self::InternalError,
            "ProtocolError" => Self::ProtocolError,
            "SecurityError" => Self::SecurityError,
            "FormationViolation" => Self::FormationViolation,
            "PropertyConstraintViolation" => Self::PropertyConstraintViolation,
            "OccurenceConstraintViolation" => Self::OccurenceConstraintViolation,
            "TypeConstraintViolation" => Self::TypeConstraintViolation,
            _ => Self::GenericError,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Frame ──────────────────────────────────────────────────────

/// A parsed OCPP-J frame.
#[derive(Debug, Clone)]
pub enum Frame {
    Call {
        message_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        message_id: String,
        payload: Value,
    },
    CallError {
        message_id: String,
        error_code: ErrorCode,
        error_description: String,
        error_details: Value,
    },
}

impl Frame {
    pub fn call(message_id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self::Call {
            message_id: message_id.into(),
            action: action.into(),
            payload,
        }
    }

    pub fn call_result(message_id: impl Into<String>, payload: Value) -> Self {
        Self::CallResult {
            message_id: message_id.into(),
            payload,
        }
    }

    pub fn call_error(
        message_id: impl Into<String>,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self::CallError {
            message_id: message_id.into(),
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(Default::default()),
        }
    }

    /// Parse a raw text frame.
    ///
    /// Non-array payloads and malformed tuples are protocol violations; the
    /// caller answers them with a CALLERROR where a message id is available.
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let arr: Vec<Value> = match serde_json::from_str(text) {
            Ok(Value::Array(arr)) => arr,
            Ok(_) => return Err(FrameError::NotAnArray),
            Err(e) => return Err(FrameError::InvalidJson(e.to_string())),
        };

        let msg_type = arr
            .first()
            .and_then(Value::as_u64)
            .ok_or(FrameError::InvalidMessageType)?;
        let message_id = arr
            .get(1)
            .and_then(Value::as_str)
            .ok_or(FrameError::FieldTypeMismatch("messageId must be a string"))?
            .to_string();

        match msg_type {
            MSG_TYPE_CALL => {
                if arr.len() < 4 {
                    return Err(FrameError::MissingFields {
                        expected: 4,
                        got: arr.len(),
                    });
                }
                let action = arr[2]
                    .as_str()
                    .ok_or(FrameError::FieldTypeMismatch("action must be a string"))?
                    .to_string();
                Ok(Self::Call {
                    message_id,
                    action,
                    payload: arr[3].clone(),
                })
            }
            MSG_TYPE_CALL_RESULT => {
                if arr.len() < 3 {
                    return Err(FrameError::MissingFields {
                        expected: 3,
                        got: arr.len(),
                    });
                }
                Ok(Self::CallResult {
                    message_id,
                    payload: arr[2].clone(),
                })
            }
            MSG_TYPE_CALL_ERROR => {
                if arr.len() < 4 {
                    return Err(FrameError::MissingFields {
                        expected: 4,
                        got: arr.len(),
                    });
                }
                let error_code = arr[2]
                    .as_str()
                    .map(ErrorCode::from_str)
                    .unwrap_or(ErrorCode::GenericError);
                let error_description = arr
                    .get(3)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let error_details = arr
                    .get(4)
                    .cloned()
                    .unwrap_or(Value::Object(Default::default()));
                Ok(Self::CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details,
                })
            }
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }

    /// Serialize to the wire representation.
    pub fn serialize(&self) -> String {
        let arr = match self {
            Self::Call {
                message_id,
                action,
                payload,
            } => serde_json::json!([MSG_TYPE_CALL, message_id, action, payload]),
            Self::CallResult {
                message_id,
                payload,
            } => serde_json::json!([MSG_TYPE_CALL_RESULT, message_id, payload]),
            Self::CallError {
                message_id,
                error_code,
                error_description,
                error_details,
            } => serde_json::json!([
                MSG_TYPE_CALL_ERROR,
                message_id,
                error_code.as_str(),
                error_description,
                error_details
            ]),
        };
        // serializing a Value never fails
        serde_json::to_string(&arr).unwrap_or_default()
    }

    pub fn message_id(&self) -> &str {
        match self {
            Self::Call { message_id, .. }
            | Self::CallResult { message_id, .. }
            | Self::CallError { message_id, .. } => message_id,
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Self::Call { .. })
    }
}

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid JSON: {0}")]
    InvalidJson(String),
    #[error("OCPP-J frame is not a JSON array")]
    NotAnArray,
    #[error("message type is not a number")]
    InvalidMessageType,
    #[error("unknown message type: {0}")]
    UnknownMessageType(u64),
    #[error("expected at least {expected} fields, got {got}")]
    MissingFields { expected: usize, got: usize },
    #[error("field type mismatch: {0}")]
    FieldTypeMismatch(&'static str),
}

impl FrameError {
    /// The CALLERROR code reported back for this parse failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::InvalidJson(_) | Self::NotAnArray => ErrorCode::ProtocolError,
            Self::MissingFields { .. } | Self::FieldTypeMismatch(_) => {
                ErrorCode::FormationViolation
            }
            Self::InvalidMessageType | Self::UnknownMessageType(_) => ErrorCode::ProtocolError,
        }
    }
}
