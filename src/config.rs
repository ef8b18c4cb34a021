//! Simulator configuration
//!
//! Process-level settings shared by every station the simulator runs:
//! where configuration snapshots live, connection behaviour, and the
//! fallback supervision URL used when a template declares none.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_SUPERVISION_URL: &str = "ws://localhost:8180/steve/websocket/CentralSystemService";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulatorConfig {
    /// Fallback supervision URLs when the template declares none.
    pub supervision_urls: Vec<String>,
    /// Directory holding per-station configuration snapshots.
    pub configuration_directory: PathBuf,
    /// WebSocket connect attempt timeout, also the flat reconnect delay.
    pub connection_timeout_secs: u64,
    /// CALL response timeout.
    pub response_timeout_secs: u64,
    /// Outgoing-buffer flush period.
    pub flush_interval_secs: u64,
    /// Optional `user:password` HTTP Basic credentials for the CS.
    pub basic_auth: Option<BasicAuth>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicAuth {
    pub user: String,
    pub password: String,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            supervision_urls: vec![DEFAULT_SUPERVISION_URL.to_string()],
            configuration_directory: PathBuf::from("configurations"),
            connection_timeout_secs: 30,
            response_timeout_secs: 30,
            flush_interval_secs: 60,
            basic_auth: None,
        }
    }
}

impl SimulatorConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs.max(1))
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs.max(1))
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SimulatorConfig::default();
        assert_eq!(config.connection_timeout(), Duration::from_secs(30));
        assert_eq!(config.flush_interval(), Duration::from_secs(60));
        assert!(!config.supervision_urls.is_empty());
    }

    #[test]
    fn json_roundtrip() {
        let config = SimulatorConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: SimulatorConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.supervision_urls, config.supervision_urls);
    }
}
