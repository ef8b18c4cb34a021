//! Resolved station identity and settings
//!
//! `StationInfo` is what the reconciler produces from a template and an
//! optional persisted configuration: every template default resolved,
//! serial numbers generated, power figures derived.

use serde::{Deserialize, Serialize};

use crate::support::electric::CurrentType;

use super::template::{FirmwareStatus, FirmwareUpgrade};
use super::version::OcppVersion;

pub const DEFAULT_VOLTAGE_OUT: f64 = 230.0;
pub const DEFAULT_NUMBER_OF_PHASES: u32 = 3;
pub const DEFAULT_RESET_TIME_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationInfo {
    /// Identity on the wire: last path segment of the connection URL.
    pub station_id: String,
    /// Stable identity across restarts, derived from template lineage and
    /// station id. Names the configuration file.
    pub hash_id: String,
    /// SHA-256 of the template this info was derived from.
    pub template_hash: String,

    pub charge_point_vendor: String,
    pub charge_point_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_box_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charge_point_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_type: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_upgrade: Option<FirmwareUpgrade>,
    #[serde(default)]
    pub firmware_status: FirmwareStatus,

    pub ocpp_version: OcppVersion,

    pub current_out_type: CurrentType,
    pub voltage_out: f64,
    pub number_of_phases: u32,
    /// Station maximum, Watts.
    pub maximum_power: f64,
    /// Per-phase maximum, Amps.
    pub maximum_amperage: u32,

    pub number_of_connectors: u32,
    #[serde(default)]
    pub use_connector_id0: bool,
    #[serde(default)]
    pub random_connectors: bool,

    pub supervision_urls: Vec<String>,
    #[serde(default)]
    pub supervision_url_ocpp_configuration: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supervision_url_ocpp_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amperage_limitation_ocpp_key: Option<String>,

    #[serde(default)]
    pub auto_register: bool,
    /// −1 means retry forever.
    pub registration_max_retries: i32,
    /// −1 means retry forever.
    pub auto_reconnect_max_retries: i32,
    #[serde(default)]
    pub reconnect_exponential_delay: bool,
    pub reset_time_secs: u64,

    #[serde(default)]
    pub begin_end_meter_values: bool,
    #[serde(default)]
    pub ocpp_strict_compliance: bool,
    #[serde(default)]
    pub out_of_order_end_meter_values: bool,
    #[serde(default)]
    pub metering_per_transaction: bool,

    #[serde(default)]
    pub station_info_persistent_configuration: bool,
    #[serde(default)]
    pub ocpp_persistent_configuration: bool,
    #[serde(default)]
    pub automatic_transaction_generator_persistent_configuration: bool,

    #[serde(default)]
    pub enable_statistics: bool,
    #[serde(default)]
    pub stop_transactions_on_stopped: bool,
    #[serde(default)]
    pub power_shared_by_connectors: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_tags_file: Option<String>,
    #[serde(default)]
    pub remote_authorization: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub web_socket_ping_interval_secs: Option<u64>,
}

impl StationInfo {
    /// Power budget divider for one connector: EVSE count in EVSE mode,
    /// connector count otherwise; overridden by the running-transaction
    /// count when power is shared by connectors.
    pub fn power_divider(&self, evse_count: usize, running_transactions: usize) -> f64 {
        let divider = if self.power_shared_by_connectors {
            running_transactions
        } else if evse_count > 0 {
            evse_count
        } else {
            self.number_of_connectors as usize
        };
        divider.max(1) as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> StationInfo {
        StationInfo {
            station_id: "CS-TEST-0".into(),
            hash_id: "abc".into(),
            template_hash: "def".into(),
            charge_point_vendor: "Vendor".into(),
            charge_point_model: "Model".into(),
            charge_box_serial_number: None,
            charge_point_serial_number: None,
            meter_serial_number: None,
            meter_type: None,
            firmware_version: None,
            firmware_version_pattern: None,
            firmware_upgrade: None,
            firmware_status: FirmwareStatus::Idle,
            ocpp_version: OcppVersion::V16,
            current_out_type: CurrentType::AC,
            voltage_out: DEFAULT_VOLTAGE_OUT,
            number_of_phases: DEFAULT_NUMBER_OF_PHASES,
            maximum_power: 22_000.0,
            maximum_amperage: 31,
            number_of_connectors: 2,
            use_connector_id0: true,
            random_connectors: false,
            supervision_urls: vec!["ws://localhost:8180".into()],
            supervision_url_ocpp_configuration: false,
            supervision_url_ocpp_key: None,
            amperage_limitation_ocpp_key: None,
            auto_register: false,
            registration_max_retries: -1,
            auto_reconnect_max_retries: -1,
            reconnect_exponential_delay: false,
            reset_time_secs: DEFAULT_RESET_TIME_SECS,
            begin_end_meter_values: false,
            ocpp_strict_compliance: true,
            out_of_order_end_meter_values: false,
            metering_per_transaction: true,
            station_info_persistent_configuration: true,
            ocpp_persistent_configuration: true,
            automatic_transaction_generator_persistent_configuration: false,
            enable_statistics: false,
            stop_transactions_on_stopped: true,
            power_shared_by_connectors: false,
            id_tags_file: None,
            remote_authorization: true,
            web_socket_ping_interval_secs: None,
        }
    }

    #[test]
    fn power_divider_prefers_evses_then_connectors() {
        let info = info();
        assert_eq!(info.power_divider(0, 0), 2.0);
        assert_eq!(info.power_divider(3, 0), 3.0);
    }

    #[test]
    fn shared_power_divides_by_running_transactions() {
        let mut info = info();
        info.power_shared_by_connectors = true;
        assert_eq!(info.power_divider(0, 2), 2.0);
        // never divides by zero
        assert_eq!(info.power_divider(0, 0), 1.0);
    }

    #[test]
    fn persisted_roundtrip_is_identity() {
        let info = info();
        let json = serde_json::to_value(&info).unwrap();
        let back: StationInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back.station_id, info.station_id);
        assert_eq!(back.maximum_power, info.maximum_power);
        assert_eq!(back.registration_max_retries, -1);
    }
}
