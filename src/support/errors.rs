use thiserror::Error;

use super::frame::ErrorCode;

/// Fatal errors raised while creating a station. These abort the station
/// being initialized but never crash sibling stations.
#[derive(Debug, Error)]
pub enum StationInitError {
    #[error("Template file not found: {0}")]
    TemplateNotFound(String),

    #[error("Template file {0} is empty or unreadable: {1}")]
    TemplateInvalid(String, String),

    #[error("Template {0} defines both Connectors and Evses")]
    ConnectorsAndEvses(String),

    #[error("Template {0} defines neither Connectors nor Evses")]
    NoConnectors(String),

    #[error("No supervision URL configured for station {0}")]
    MissingSupervisionUrl(String),

    #[error("Unsupported OCPP version: {0}")]
    UnsupportedOcppVersion(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration file error: {0}")]
    Configuration(#[from] serde_json::Error),
}

/// Errors surfaced by the message engine when a CALL cannot complete.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("Channel is not open")]
    ChannelClosed,

    #[error("Failed to send frame: {0}")]
    SendFailed(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Request was buffered for a later flush")]
    Buffered,

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("CallError {code}: {description}")]
    CallError { code: ErrorCode, description: String },
}

/// An error answered to the peer as a CALLERROR frame.
#[derive(Debug, Clone, Error)]
#[error("{code}: {description}")]
pub struct OcppCallError {
    pub code: ErrorCode,
    pub description: String,
    pub details: serde_json::Value,
}

impl OcppCallError {
    pub fn new(code: ErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
            details: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn not_implemented(action: &str) -> Self {
        Self::new(
            ErrorCode::NotImplemented,
            format!("Requested action {action} is unknown"),
        )
    }

    pub fn not_supported(action: &str) -> Self {
        Self::new(
            ErrorCode::NotSupported,
            format!("Requested action {action} is recognized but not supported"),
        )
    }

    pub fn formation_violation(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::FormationViolation, description)
    }

    pub fn internal(description: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, description)
    }
}

impl From<serde_json::Error> for OcppCallError {
    fn from(e: serde_json::Error) -> Self {
        Self::formation_violation(format!("Payload does not match the action schema: {e}"))
    }
}
