//! Charging-station template document
//!
//! The JSON template a station is instantiated from. Section keys
//! (`Connectors`, `Evses`, `Configuration`,
//! `AutomaticTransactionGenerator`) are PascalCase on the wire; scalar
//! fields are camelCase.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::support::electric::CurrentType;

use super::configuration::ConfigurationKey;
use super::connector::{AvailabilityKind, ConnectorStatusKind};
use super::version::OcppVersion;

/// `supervisionUrls` accepts a single URL or a list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(url) => vec![url],
            Self::Many(urls) => urls,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PowerUnit {
    #[default]
    W,
    #[serde(rename = "kW")]
    KW,
}

/// OCPP 1.6 firmware status values the simulator reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FirmwareStatus {
    Downloaded,
    DownloadFailed,
    Downloading,
    #[default]
    Idle,
    InstallationFailed,
    Installing,
    Installed,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareVersionUpgrade {
    /// Increment applied to the matched pattern group.
    #[serde(default = "default_step")]
    pub step: i64,
    /// Which capture group of `firmwareVersionPattern` is bumped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern_group: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareUpgrade {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version_upgrade: Option<FirmwareVersionUpgrade>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorTemplate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_status: Option<ConnectorStatusKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<AvailabilityKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EvseTemplate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability: Option<AvailabilityKind>,
    #[serde(rename = "Connectors", default)]
    pub connectors: BTreeMap<String, ConnectorTemplate>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationSection {
    #[serde(default)]
    pub configuration_key: Vec<ConfigurationKey>,
}

/// Randomness bounds for the automatic transaction generator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomaticTransactionGeneratorConfiguration {
    #[serde(default)]
    pub enable: bool,
    /// Charge duration bounds, seconds.
    #[serde(default = "default_min_duration")]
    pub min_duration: u64,
    #[serde(default = "default_max_duration")]
    pub max_duration: u64,
    /// Idle time between two transactions, seconds.
    #[serde(default = "default_min_delay")]
    pub min_delay_between_two_transactions: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_between_two_transactions: u64,
    /// Chance in [0, 100] that a cycle actually starts a transaction.
    #[serde(default = "default_probability")]
    pub probability_of_start: u8,
    /// Stop generating after this many hours of wall-clock run time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_after_hours: Option<f64>,
    #[serde(default)]
    pub require_authorize: bool,
    #[serde(default = "default_id_tag")]
    pub id_tag: String,
}

fn default_step() -> i64 {
    1
}

fn default_min_duration() -> u64 {
    60
}
fn default_max_duration() -> u64 {
    120
}
fn default_min_delay() -> u64 {
    15
}
fn default_max_delay() -> u64 {
    30
}
fn default_probability() -> u8 {
    100
}
fn default_id_tag() -> String {
    "ATG".to_string()
}

impl Default for AutomaticTransactionGeneratorConfiguration {
    fn default() -> Self {
        Self {
            enable: false,
            min_duration: default_min_duration(),
            max_duration: default_max_duration(),
            min_delay_between_two_transactions: default_min_delay(),
            max_delay_between_two_transactions: default_max_delay(),
            probability_of_start: default_probability(),
            stop_after_hours: None,
            require_authorize: false,
            id_tag: default_id_tag(),
        }
    }
}

/// The full template document.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChargingStationTemplate {
    #[serde(default)]
    pub base_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_suffix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fixed_name: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_box_serial_number_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_serial_number_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random_serial_number: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_upgrade: Option<FirmwareUpgrade>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocpp_version: Option<OcppVersion>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_out_type: Option<CurrentType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voltage_out: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_phases: Option<u32>,
    /// Maximum station power, in `power_unit`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_unit: Option<PowerUnit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub maximum_amperage: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_connectors: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub random_connectors: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_connector_id0: Option<bool>,
    #[serde(rename = "Connectors", skip_serializing_if = "Option::is_none")]
    pub connectors: Option<BTreeMap<String, ConnectorTemplate>>,
    #[serde(rename = "Evses", skip_serializing_if = "Option::is_none")]
    pub evses: Option<BTreeMap<String, EvseTemplate>>,

    #[serde(rename = "Configuration", skip_serializing_if = "Option::is_none")]
    pub configuration: Option<ConfigurationSection>,
    #[serde(
        rename = "AutomaticTransactionGenerator",
        skip_serializing_if = "Option::is_none"
    )]
    pub automatic_transaction_generator: Option<AutomaticTransactionGeneratorConfiguration>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervision_urls: Option<OneOrMany>,
    /// Deprecated in favour of `supervisionUrls`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervision_url: Option<OneOrMany>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervision_url_ocpp_configuration: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervision_url_ocpp_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amperage_limitation_ocpp_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_register: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration_max_retries: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_reconnect_max_retries: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_exponential_delay: Option<bool>,
    /// Delay between stop and restart on reset, seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reset_time: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub begin_end_meter_values: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocpp_strict_compliance: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub out_of_order_end_meter_values: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metering_per_transaction: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub station_info_persistent_configuration: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocpp_persistent_configuration: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automatic_transaction_generator_persistent_configuration: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_statistics: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_transactions_on_stopped: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_shared_by_connectors: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tags_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_authorization: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_socket_ping_interval: Option<u64>,

    // Deprecated keys, accepted and rewritten by the reconciler.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorization_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_schema_validation: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub must_authorize_at_remote_start: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervision_urls_accept_string_or_list() {
        let one: OneOrMany = serde_json::from_str("\"ws://cs.example\"").unwrap();
        assert_eq!(one.into_vec(), vec!["ws://cs.example"]);
        let many: OneOrMany = serde_json::from_str(r#"["ws://a","ws://b"]"#).unwrap();
        assert_eq!(many.into_vec().len(), 2);
    }

    #[test]
    fn section_keys_are_pascal_case() {
        let json = serde_json::json!({
            "baseName": "CS-TEST",
            "numberOfConnectors": 2,
            "Connectors": {
                "0": {},
                "1": {"bootStatus": "Available"}
            },
            "Configuration": {
                "configurationKey": [
                    {"key": "HeartbeatInterval", "value": "300"}
                ]
            }
        });
        let template: ChargingStationTemplate = serde_json::from_value(json).unwrap();
        assert_eq!(template.base_name, "CS-TEST");
        let connectors = template.connectors.unwrap();
        assert_eq!(
            connectors["1"].boot_status,
            Some(ConnectorStatusKind::Available)
        );
        assert_eq!(
            template.configuration.unwrap().configuration_key[0].key,
            "HeartbeatInterval"
        );
    }

    #[test]
    fn atg_configuration_defaults() {
        let config = AutomaticTransactionGeneratorConfiguration::default();
        assert!(!config.enable);
        assert!(config.min_duration <= config.max_duration);
        assert_eq!(config.probability_of_start, 100);
    }
}
