//! OCPP protocol version

use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol versions the simulator can speak.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OcppVersion {
    /// OCPP 1.6 (JSON / OCPP-J)
    #[serde(rename = "1.6")]
    #[default]
    V16,
    /// OCPP 2.0.1
    #[serde(rename = "2.0.1")]
    V201,
}

impl OcppVersion {
    /// WebSocket subprotocol requested in `Sec-WebSocket-Protocol`.
    pub fn subprotocol(&self) -> &'static str {
        match self {
            Self::V16 => "ocpp1.6",
            Self::V201 => "ocpp2.0.1",
        }
    }

    pub fn from_subprotocol(s: &str) -> Option<Self> {
        match s.trim() {
            "ocpp1.6" => Some(Self::V16),
            "ocpp2.0.1" => Some(Self::V201),
            _ => None,
        }
    }

    pub fn version_string(&self) -> &'static str {
        match self {
            Self::V16 => "1.6",
            Self::V201 => "2.0.1",
        }
    }
}

impl fmt::Display for OcppVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OCPP {}", self.version_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subprotocol_roundtrip() {
        for version in [OcppVersion::V16, OcppVersion::V201] {
            assert_eq!(
                OcppVersion::from_subprotocol(version.subprotocol()),
                Some(version)
            );
        }
        assert_eq!(OcppVersion::from_subprotocol("ocpp2.1"), None);
    }

    #[test]
    fn template_serde_uses_bare_version_numbers() {
        let v: OcppVersion = serde_json::from_str("\"1.6\"").unwrap();
        assert_eq!(v, OcppVersion::V16);
        assert_eq!(serde_json::to_string(&OcppVersion::V201).unwrap(), "\"2.0.1\"");
    }
}
