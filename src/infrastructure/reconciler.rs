//! Template & configuration reconciliation
//!
//! Turns a template document plus an optional persisted configuration into
//! a fully-populated [`StationInfo`], the initial connector/EVSE model and
//! the seeded configuration store. Lineage between the two documents is
//! established by the template content hash.

use std::collections::BTreeMap;
use std::path::Path;

use rand::seq::SliceRandom;
use rand::Rng;
use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::domain::configuration::{
    ConfigurationKey, ConfigurationStore, AUTHORIZE_REMOTE_TX_REQUESTS_KEY,
    CONNECTION_TIMEOUT_KEY, HEARTBEAT_INTERVAL_KEY, LOCAL_AUTH_LIST_ENABLED_KEY,
    METER_VALUES_SAMPLED_DATA_KEY, METER_VALUE_SAMPLE_INTERVAL_KEY, NUMBER_OF_CONNECTORS_KEY,
    SUPPORTED_FEATURE_PROFILES_KEY,
};
use crate::domain::connector::{Connector, ConnectorModel, Evse};
use crate::domain::station::{
    StationInfo, DEFAULT_NUMBER_OF_PHASES, DEFAULT_RESET_TIME_SECS, DEFAULT_VOLTAGE_OUT,
};
use crate::domain::template::{
    ChargingStationTemplate, ConnectorTemplate, FirmwareStatus, PowerUnit,
};
use crate::support::cache::FileCache;
use crate::support::electric::{power_to_amperage, CurrentType};
use crate::support::errors::StationInitError;

use super::persistence::PersistedConfiguration;

const DEFAULT_FIRMWARE_VERSION_PATTERN: &str = r"^(\d+)\.(\d+)\.(\d+)$";
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 60;
const DEFAULT_METER_VALUE_SAMPLE_INTERVAL_SECS: u64 = 60;
const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 30;

/// Everything a station needs to come up.
#[derive(Debug)]
pub struct ReconciledStation {
    pub info: StationInfo,
    pub connectors: ConnectorModel,
    pub configuration: ConfigurationStore,
    pub automatic_transaction_generator:
        Option<crate::domain::AutomaticTransactionGeneratorConfiguration>,
}

/// Load the template for station `index` and merge it with the persisted
/// configuration, if any.
pub fn reconcile(
    template_path: &Path,
    index: u32,
    cache: &FileCache,
    persisted: Option<&PersistedConfiguration>,
) -> Result<ReconciledStation, StationInitError> {
    let display_path = template_path.display().to_string();
    let cached = cache.load(template_path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            StationInitError::TemplateNotFound(display_path.clone())
        } else {
            StationInitError::TemplateInvalid(display_path.clone(), e.to_string())
        }
    })?;
    if cached
        .document
        .as_object()
        .map(|o| o.is_empty())
        .unwrap_or(true)
    {
        return Err(StationInitError::TemplateInvalid(
            display_path,
            "empty template".to_string(),
        ));
    }

    let mut template: ChargingStationTemplate =
        serde_json::from_value((*cached.document).clone())
            .map_err(|e| StationInitError::TemplateInvalid(display_path.clone(), e.to_string()))?;
    rewrite_deprecated_keys(&mut template, &display_path);

    if template.connectors.is_some() && template.evses.is_some() {
        return Err(StationInitError::ConnectorsAndEvses(display_path));
    }
    if template.connectors.is_none() && template.evses.is_none() {
        return Err(StationInitError::NoConnectors(display_path));
    }

    let station_id = station_id(&template, index);
    let hash_id = hash_id(&cached.hash, &station_id);

    // Lineage: a persisted document derived from the same template content
    // may contribute its station info and configuration keys.
    let lineage_matches = persisted
        .map(|p| {
            p.station_info
                .as_ref()
                .map(|info| info.template_hash == cached.hash)
                .unwrap_or(false)
        })
        .unwrap_or(false);

    let template_info = info_from_template(
        &template,
        &cached.hash,
        station_id.clone(),
        hash_id.clone(),
        &display_path,
    )?;

    let info = match (lineage_matches, persisted.and_then(|p| p.station_info.clone())) {
        (true, Some(saved)) if template_info.station_info_persistent_configuration => {
            info!(
                station_id = station_id.as_str(),
                "Reusing persisted station info (template lineage unchanged)"
            );
            StationInfo {
                hash_id,
                station_id,
                ..saved
            }
        }
        (_, saved) => {
            let mut fresh = template_info;
            if let Some(saved) = saved {
                carry_serial_numbers(&mut fresh, &saved, &template);
            }
            fresh
        }
    };

    let connectors = if template.evses.is_some() {
        init_evses(&template)
    } else {
        init_connectors(&template, info.number_of_connectors, info.use_connector_id0)
    };

    let configuration = initial_configuration(&template, persisted, &info, &connectors);

    Ok(ReconciledStation {
        automatic_transaction_generator: template.automatic_transaction_generator.clone(),
        info,
        connectors,
        configuration,
    })
}

fn station_id(template: &ChargingStationTemplate, index: u32) -> String {
    let suffix = template.name_suffix.as_deref().unwrap_or_default();
    let mut id = if template.fixed_name.unwrap_or(false) {
        format!("{}{}", template.base_name, suffix)
    } else {
        format!("{}{}-{:05}", template.base_name, suffix, index)
    };
    // Multi-instance deployments disambiguate via the platform instance index.
    if let Ok(instance_index) = std::env::var("CF_INSTANCE_INDEX") {
        if !instance_index.is_empty() {
            id = format!("{id}-{instance_index}");
        }
    }
    id
}

fn hash_id(template_hash: &str, station_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(template_hash.as_bytes());
    hasher.update(station_id.as_bytes());
    hex::encode(hasher.finalize())
}

fn info_from_template(
    template: &ChargingStationTemplate,
    template_hash: &str,
    station_id: String,
    hash_id: String,
    display_path: &str,
) -> Result<StationInfo, StationInitError> {
    let current_out_type = template.current_out_type.unwrap_or_default();
    let voltage_out = template.voltage_out.unwrap_or(DEFAULT_VOLTAGE_OUT);
    let number_of_phases = match current_out_type {
        CurrentType::AC => template.number_of_phases.unwrap_or(DEFAULT_NUMBER_OF_PHASES),
        CurrentType::DC => 0,
    };

    let maximum_power = match (template.power, template.power_unit.unwrap_or_default()) {
        (Some(power), PowerUnit::KW) => power * 1000.0,
        (Some(power), PowerUnit::W) => power,
        (None, _) => {
            warn!(
                template = display_path,
                "Template declares no maximum power, defaulting to 22 kW"
            );
            22_000.0
        }
    };
    let maximum_amperage = template.maximum_amperage.unwrap_or_else(|| {
        power_to_amperage(
            current_out_type,
            voltage_out,
            number_of_phases,
            maximum_power,
        )
    });

    let number_of_connectors = template.number_of_connectors.unwrap_or_else(|| {
        template
            .connectors
            .as_ref()
            .map(|c| c.keys().filter(|k| k.as_str() != "0").count() as u32)
            .unwrap_or(0)
    });

    let random_serial = template.random_serial_number.unwrap_or(true);
    let firmware_version = validated_firmware_version(template, display_path);

    Ok(StationInfo {
        station_id,
        hash_id,
        template_hash: template_hash.to_string(),
        charge_point_vendor: template
            .charge_point_vendor
            .clone()
            .unwrap_or_else(|| "Unknown vendor".to_string()),
        charge_point_model: template
            .charge_point_model
            .clone()
            .unwrap_or_else(|| "Unknown model".to_string()),
        charge_box_serial_number: template
            .charge_box_serial_number_prefix
            .as_deref()
            .map(|prefix| serial_number(prefix, random_serial)),
        charge_point_serial_number: template
            .charge_point_serial_number_prefix
            .as_deref()
            .map(|prefix| serial_number(prefix, random_serial)),
        meter_serial_number: template
            .meter_serial_number_prefix
            .as_deref()
            .map(|prefix| serial_number(prefix, random_serial)),
        meter_type: template.meter_type.clone(),
        firmware_version,
        firmware_version_pattern: Some(
            template
                .firmware_version_pattern
                .clone()
                .unwrap_or_else(|| DEFAULT_FIRMWARE_VERSION_PATTERN.to_string()),
        ),
        firmware_upgrade: template.firmware_upgrade.clone(),
        firmware_status: FirmwareStatus::Idle,
        ocpp_version: template.ocpp_version.unwrap_or_default(),
        current_out_type,
        voltage_out,
        number_of_phases,
        maximum_power,
        maximum_amperage,
        number_of_connectors,
        use_connector_id0: template.use_connector_id0.unwrap_or(true),
        random_connectors: template.random_connectors.unwrap_or(false),
        supervision_urls: template
            .supervision_urls
            .clone()
            .map(|urls| urls.into_vec())
            .unwrap_or_default(),
        supervision_url_ocpp_configuration: template
            .supervision_url_ocpp_configuration
            .unwrap_or(false),
        supervision_url_ocpp_key: template.supervision_url_ocpp_key.clone(),
        amperage_limitation_ocpp_key: template.amperage_limitation_ocpp_key.clone(),
        auto_register: template.auto_register.unwrap_or(false),
        registration_max_retries: template.registration_max_retries.unwrap_or(-1),
        auto_reconnect_max_retries: template.auto_reconnect_max_retries.unwrap_or(-1),
        reconnect_exponential_delay: template.reconnect_exponential_delay.unwrap_or(false),
        reset_time_secs: template.reset_time.unwrap_or(DEFAULT_RESET_TIME_SECS),
        begin_end_meter_values: template.begin_end_meter_values.unwrap_or(false),
        ocpp_strict_compliance: template.ocpp_strict_compliance.unwrap_or(true),
        out_of_order_end_meter_values: template.out_of_order_end_meter_values.unwrap_or(false),
        metering_per_transaction: template.metering_per_transaction.unwrap_or(true),
        station_info_persistent_configuration: template
            .station_info_persistent_configuration
            .unwrap_or(true),
        ocpp_persistent_configuration: template.ocpp_persistent_configuration.unwrap_or(true),
        automatic_transaction_generator_persistent_configuration: template
            .automatic_transaction_generator_persistent_configuration
            .unwrap_or(true),
        enable_statistics: template.enable_statistics.unwrap_or(false),
        stop_transactions_on_stopped: template.stop_transactions_on_stopped.unwrap_or(true),
        power_shared_by_connectors: template.power_shared_by_connectors.unwrap_or(false),
        id_tags_file: template.id_tags_file.clone(),
        remote_authorization: template.remote_authorization.unwrap_or(true),
        web_socket_ping_interval_secs: template.web_socket_ping_interval,
    })
}

/// Random-hex suffix appended to a template serial-number prefix.
fn serial_number(prefix: &str, randomize: bool) -> String {
    if randomize {
        let suffix: u64 = rand::thread_rng().gen();
        format!("{prefix}{suffix:016x}")
    } else {
        prefix.to_string()
    }
}

/// Persisted serial numbers survive a template change only while the
/// template still declares the same prefix.
fn carry_serial_numbers(
    fresh: &mut StationInfo,
    saved: &StationInfo,
    template: &ChargingStationTemplate,
) {
    let carry = |saved: &Option<String>, prefix: &Option<String>| -> Option<String> {
        match (saved, prefix) {
            (Some(serial), Some(prefix)) if serial.starts_with(prefix.as_str()) => {
                Some(serial.clone())
            }
            _ => None,
        }
    };
    if let Some(serial) = carry(
        &saved.charge_box_serial_number,
        &template.charge_box_serial_number_prefix,
    ) {
        fresh.charge_box_serial_number = Some(serial);
    }
    if let Some(serial) = carry(
        &saved.charge_point_serial_number,
        &template.charge_point_serial_number_prefix,
    ) {
        fresh.charge_point_serial_number = Some(serial);
    }
    if let Some(serial) = carry(
        &saved.meter_serial_number,
        &template.meter_serial_number_prefix,
    ) {
        fresh.meter_serial_number = Some(serial);
    }
}

/// Validate the template firmware version against the version pattern,
/// warning on mismatch.
fn validated_firmware_version(
    template: &ChargingStationTemplate,
    display_path: &str,
) -> Option<String> {
    let version = template.firmware_version.clone()?;
    let pattern = template
        .firmware_version_pattern
        .as_deref()
        .unwrap_or(DEFAULT_FIRMWARE_VERSION_PATTERN);

    match Regex::new(pattern) {
        Ok(regex) if !regex.is_match(&version) => {
            warn!(
                template = display_path,
                version = version.as_str(),
                pattern,
                "Firmware version does not match the version pattern"
            );
        }
        Ok(_) => {}
        Err(e) => {
            warn!(
                template = display_path,
                pattern,
                error = %e,
                "Invalid firmware version pattern"
            );
        }
    }
    Some(version)
}

/// Apply the configured version upgrade to a resolved info, used when a
/// station transitions out of `Installing` on reset.
pub fn upgraded_firmware_version(info: &StationInfo) -> Option<String> {
    let version = info.firmware_version.clone()?;
    let pattern = info.firmware_version_pattern.as_deref()?;
    let upgrade = info.firmware_upgrade.as_ref()?.version_upgrade.as_ref()?;
    let regex = Regex::new(pattern).ok()?;
    let captures = regex.captures(&version)?;
    let group = upgrade.pattern_group.unwrap_or(captures.len() - 1);
    let matched = captures.get(group)?;
    let bumped: i64 = matched.as_str().parse::<i64>().ok()? + upgrade.step;
    let mut upgraded = version.clone();
    upgraded.replace_range(matched.range(), &bumped.to_string());
    Some(upgraded)
}

fn rewrite_deprecated_keys(template: &mut ChargingStationTemplate, display_path: &str) {
    if let Some(url) = template.supervision_url.take() {
        warn!(
            template = display_path,
            "Deprecated key supervisionUrl, use supervisionUrls"
        );
        template.supervision_urls.get_or_insert(url);
    }
    if let Some(file) = template.authorization_file.take() {
        warn!(
            template = display_path,
            "Deprecated key authorizationFile, use idTagsFile"
        );
        template.id_tags_file.get_or_insert(file);
    }
    if template.payload_schema_validation.take().is_some() {
        warn!(
            template = display_path,
            "Deprecated key payloadSchemaValidation is ignored"
        );
    }
    if let Some(value) = template.must_authorize_at_remote_start.take() {
        warn!(
            template = display_path,
            "Deprecated key mustAuthorizeAtRemoteStart, use remoteAuthorization"
        );
        template.remote_authorization.get_or_insert(value);
    }
}

fn connector_from_template(template: Option<&ConnectorTemplate>) -> Connector {
    let mut connector = Connector::default();
    if let Some(template) = template {
        connector.boot_status = template.boot_status;
        if let Some(availability) = template.availability {
            connector.availability = availability;
        }
    }
    connector
}

fn init_connectors(
    template: &ChargingStationTemplate,
    number_of_connectors: u32,
    use_connector_id0: bool,
) -> ConnectorModel {
    let declared = template.connectors.clone().unwrap_or_default();
    let mut connectors = BTreeMap::new();

    if use_connector_id0 {
        connectors.insert(0, connector_from_template(declared.get("0")));
    }

    // Chargeable connectors draw their template entry by id; with
    // randomConnectors the declared entries are dealt out shuffled.
    let mut entry_keys: Vec<&String> = declared.keys().filter(|k| k.as_str() != "0").collect();
    if template.random_connectors.unwrap_or(false) {
        entry_keys.shuffle(&mut rand::thread_rng());
    }
    for id in 1..=number_of_connectors {
        let key = if template.random_connectors.unwrap_or(false) {
            entry_keys
                .get((id as usize - 1) % entry_keys.len().max(1))
                .map(|k| k.as_str())
                .unwrap_or("1")
                .to_string()
        } else {
            id.to_string()
        };
        let entry = declared.get(&key).or_else(|| declared.get("1"));
        connectors.insert(id, connector_from_template(entry));
    }
    ConnectorModel::with_connectors(connectors)
}

fn init_evses(template: &ChargingStationTemplate) -> ConnectorModel {
    let declared = template.evses.clone().unwrap_or_default();
    let mut evses = BTreeMap::new();
    for (key, evse_template) in &declared {
        let Ok(evse_id) = key.parse::<u32>() else {
            warn!(evse = key.as_str(), "Ignoring EVSE with non-numeric id");
            continue;
        };
        let mut evse = Evse {
            availability: evse_template.availability.unwrap_or_default(),
            connectors: BTreeMap::new(),
        };
        for (connector_key, connector_template) in &evse_template.connectors {
            let Ok(connector_id) = connector_key.parse::<u32>() else {
                warn!(
                    connector = connector_key.as_str(),
                    "Ignoring connector with non-numeric id"
                );
                continue;
            };
            evse.connectors.insert(
                connector_id,
                connector_from_template(Some(connector_template)),
            );
        }
        evses.insert(evse_id, evse);
    }
    ConnectorModel::with_evses(evses)
}

fn initial_configuration(
    template: &ChargingStationTemplate,
    persisted: Option<&PersistedConfiguration>,
    info: &StationInfo,
    connectors: &ConnectorModel,
) -> ConfigurationStore {
    let persisted_keys = persisted
        .filter(|_| info.ocpp_persistent_configuration)
        .and_then(|p| p.configuration_key.clone());

    let mut store = match persisted_keys {
        Some(keys) => ConfigurationStore::from_keys(keys),
        None => ConfigurationStore::from_keys(
            template
                .configuration
                .clone()
                .map(|c| c.configuration_key)
                .unwrap_or_default(),
        ),
    };

    // Standard keys every central system expects to find.
    store.add_value(
        HEARTBEAT_INTERVAL_KEY,
        DEFAULT_HEARTBEAT_INTERVAL_SECS.to_string(),
    );
    store.add_value(
        METER_VALUE_SAMPLE_INTERVAL_KEY,
        DEFAULT_METER_VALUE_SAMPLE_INTERVAL_SECS.to_string(),
    );
    store.add_value(
        METER_VALUES_SAMPLED_DATA_KEY,
        "Energy.Active.Import.Register",
    );
    store.add_value(
        CONNECTION_TIMEOUT_KEY,
        DEFAULT_CONNECTION_TIMEOUT_SECS.to_string(),
    );
    store.add_value(AUTHORIZE_REMOTE_TX_REQUESTS_KEY, "false");
    store.add_value(LOCAL_AUTH_LIST_ENABLED_KEY, "false");
    store.add(
        ConfigurationKey {
            key: NUMBER_OF_CONNECTORS_KEY.to_string(),
            value: connectors.number_of_connectors().to_string(),
            readonly: true,
            visible: true,
            reboot: false,
        },
        true,
    );
    store.add(
        ConfigurationKey {
            key: SUPPORTED_FEATURE_PROFILES_KEY.to_string(),
            value: "Core,FirmwareManagement,LocalAuthListManagement,SmartCharging,RemoteTrigger,Reservation".to_string(),
            readonly: true,
            visible: true,
            reboot: false,
        },
        true,
    );
    if let Some(key) = &info.supervision_url_ocpp_key {
        if info.supervision_url_ocpp_configuration {
            store.add_value(key.clone(), info.supervision_urls.join(","));
        }
    }
    store
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::connector::ConnectorStatusKind;

    fn write_template(value: serde_json::Value) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), serde_json::to_vec_pretty(&value).unwrap()).unwrap();
        file
    }

    fn minimal_template() -> serde_json::Value {
        serde_json::json!({
            "baseName": "CS-TEST",
            "chargePointVendor": "Vendor",
            "chargePointModel": "Model",
            "power": 22,
            "powerUnit": "kW",
            "numberOfConnectors": 2,
            "supervisionUrls": "ws://localhost:8180/steve/websocket/CentralSystemService",
            "Connectors": {
                "0": {},
                "1": {"bootStatus": "Available"},
                "2": {}
            }
        })
    }

    #[test]
    fn minimal_template_reconciles() {
        let file = write_template(minimal_template());
        let cache = FileCache::new();
        let station = reconcile(file.path(), 1, &cache, None).unwrap();

        assert!(station.info.station_id.starts_with("CS-TEST-"));
        assert_eq!(station.info.maximum_power, 22_000.0);
        // 22 kW / (230 V * 3) = 31 A
        assert_eq!(station.info.maximum_amperage, 31);
        assert_eq!(station.connectors.number_of_connectors(), 2);
        assert_eq!(
            station.connectors.connector(1).unwrap().boot_status,
            Some(ConnectorStatusKind::Available)
        );
        assert!(station.configuration.get("HeartbeatInterval").is_some());
        assert_eq!(
            station.configuration.get("NumberOfConnectors").unwrap().value,
            "2"
        );
    }

    #[test]
    fn both_connectors_and_evses_is_fatal() {
        let mut template = minimal_template();
        template["Evses"] = serde_json::json!({"1": {"Connectors": {"1": {}}}});
        let file = write_template(template);
        let cache = FileCache::new();
        assert!(matches!(
            reconcile(file.path(), 1, &cache, None),
            Err(StationInitError::ConnectorsAndEvses(_))
        ));
    }

    #[test]
    fn neither_connectors_nor_evses_is_fatal() {
        let mut template = minimal_template();
        template.as_object_mut().unwrap().remove("Connectors");
        let file = write_template(template);
        let cache = FileCache::new();
        assert!(matches!(
            reconcile(file.path(), 1, &cache, None),
            Err(StationInitError::NoConnectors(_))
        ));
    }

    #[test]
    fn missing_template_is_fatal() {
        let cache = FileCache::new();
        assert!(matches!(
            reconcile(Path::new("/nonexistent/template.json"), 1, &cache, None),
            Err(StationInitError::TemplateNotFound(_))
        ));
    }

    #[test]
    fn serial_numbers_use_template_prefixes() {
        let mut template = minimal_template();
        template["chargePointSerialNumberPrefix"] = serde_json::json!("CP-");
        let file = write_template(template);
        let cache = FileCache::new();
        let station = reconcile(file.path(), 1, &cache, None).unwrap();
        let serial = station.info.charge_point_serial_number.unwrap();
        assert!(serial.starts_with("CP-"));
        assert!(serial.len() > "CP-".len());
    }

    #[test]
    fn random_serial_number_false_keeps_bare_prefix() {
        let mut template = minimal_template();
        template["chargePointSerialNumberPrefix"] = serde_json::json!("CP-");
        template["randomSerialNumber"] = serde_json::json!(false);
        let file = write_template(template);
        let cache = FileCache::new();
        let station = reconcile(file.path(), 1, &cache, None).unwrap();
        assert_eq!(
            station.info.charge_point_serial_number.as_deref(),
            Some("CP-")
        );
    }

    #[test]
    fn persisted_serials_survive_when_prefix_unchanged() {
        let mut template = minimal_template();
        template["chargePointSerialNumberPrefix"] = serde_json::json!("CP-");
        let file = write_template(template);
        let cache = FileCache::new();

        let first = reconcile(file.path(), 1, &cache, None).unwrap();
        let mut saved = first.info.clone();
        // break lineage so station info is rebuilt from the template
        saved.template_hash = "other".to_string();

        let persisted = PersistedConfiguration {
            station_info: Some(saved.clone()),
            ..Default::default()
        };
        let second = reconcile(file.path(), 1, &cache, Some(&persisted)).unwrap();
        assert_eq!(
            second.info.charge_point_serial_number,
            saved.charge_point_serial_number
        );
    }

    #[test]
    fn deprecated_keys_are_rewritten() {
        let mut template = minimal_template();
        let obj = template.as_object_mut().unwrap();
        obj.remove("supervisionUrls");
        obj.insert("supervisionUrl".into(), serde_json::json!("ws://old.example"));
        obj.insert("authorizationFile".into(), serde_json::json!("tags.json"));
        obj.insert("mustAuthorizeAtRemoteStart".into(), serde_json::json!(false));
        let file = write_template(template);
        let cache = FileCache::new();
        let station = reconcile(file.path(), 1, &cache, None).unwrap();
        assert_eq!(station.info.supervision_urls, vec!["ws://old.example"]);
        assert_eq!(station.info.id_tags_file.as_deref(), Some("tags.json"));
        assert!(!station.info.remote_authorization);
    }

    #[test]
    fn firmware_upgrade_bumps_patch_group() {
        let info = StationInfo {
            firmware_version: Some("1.2.3".to_string()),
            firmware_version_pattern: Some(DEFAULT_FIRMWARE_VERSION_PATTERN.to_string()),
            firmware_upgrade: Some(crate::domain::FirmwareUpgrade {
                version_upgrade: Some(crate::domain::template::FirmwareVersionUpgrade {
                    step: 1,
                    pattern_group: None,
                }),
                reset: Some(true),
            }),
            ..sample_info()
        };
        assert_eq!(upgraded_firmware_version(&info).as_deref(), Some("1.2.4"));
    }

    #[test]
    fn evse_mode_populates_evses_only() {
        let mut template = minimal_template();
        let obj = template.as_object_mut().unwrap();
        obj.remove("Connectors");
        obj.insert(
            "Evses".into(),
            serde_json::json!({
                "0": {"Connectors": {"0": {}}},
                "1": {"Connectors": {"1": {"bootStatus": "Available"}}},
                "2": {"Connectors": {"2": {}}}
            }),
        );
        let file = write_template(template);
        let cache = FileCache::new();
        let station = reconcile(file.path(), 1, &cache, None).unwrap();
        assert!(station.connectors.uses_evses());
        assert!(station.connectors.connectors.is_empty());
        assert_eq!(station.connectors.number_of_evses(), 2);
        assert_eq!(
            station.connectors.connector(1).unwrap().boot_status,
            Some(ConnectorStatusKind::Available)
        );
    }

    fn sample_info() -> StationInfo {
        let file = write_template(minimal_template());
        let cache = FileCache::new();
        reconcile(file.path(), 1, &cache, None).unwrap().info
    }
}
