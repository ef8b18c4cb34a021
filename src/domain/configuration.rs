//! Station configuration key store
//!
//! A keyed mapping of OCPP configuration names to values, with the
//! visibility/readonly/reboot flags GetConfiguration and
//! ChangeConfiguration operate on.

use serde::{Deserialize, Serialize};

// Standard OCPP 1.6 configuration key names used across the simulator.
pub const HEARTBEAT_INTERVAL_KEY: &str = "HeartbeatInterval";
// Deprecated spelling kept for charge points provisioned with old templates.
pub const HEARTBEAT_INTERVAL_LEGACY_KEY: &str = "HeartBeatInterval";
pub const METER_VALUE_SAMPLE_INTERVAL_KEY: &str = "MeterValueSampleInterval";
pub const METER_VALUES_SAMPLED_DATA_KEY: &str = "MeterValuesSampledData";
pub const NUMBER_OF_CONNECTORS_KEY: &str = "NumberOfConnectors";
pub const CONNECTION_TIMEOUT_KEY: &str = "ConnectionTimeOut";
pub const SUPPORTED_FEATURE_PROFILES_KEY: &str = "SupportedFeatureProfiles";
pub const LOCAL_AUTH_LIST_ENABLED_KEY: &str = "LocalAuthListEnabled";
pub const AUTHORIZE_REMOTE_TX_REQUESTS_KEY: &str = "AuthorizeRemoteTxRequests";
pub const RESERVE_CONNECTOR_ZERO_KEY: &str = "ReserveConnectorZeroSupported";
pub const WEB_SOCKET_PING_INTERVAL_KEY: &str = "WebSocketPingInterval";

/// One configuration entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ConfigurationKey {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub readonly: bool,
    /// Hidden keys are kept out of GetConfiguration responses.
    #[serde(default = "default_visible")]
    pub visible: bool,
    /// Changing a reboot key requires a station reset to take effect.
    #[serde(default)]
    pub reboot: bool,
}

fn default_visible() -> bool {
    true
}

/// Outcome of a `set_value` call, so the caller knows whether the station
/// must be reset for the change to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetValueOutcome {
    Changed,
    RebootRequired,
    Readonly,
    NotFound,
}

/// Keyed station parameters, ordered by insertion.
#[derive(Debug, Default, Clone)]
pub struct ConfigurationStore {
    keys: Vec<ConfigurationKey>,
}

impl ConfigurationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_keys(keys: Vec<ConfigurationKey>) -> Self {
        let mut store = Self::new();
        for key in keys {
            store.add(key, true);
        }
        store
    }

    pub fn get(&self, name: &str) -> Option<&ConfigurationKey> {
        self.keys.iter().find(|k| k.key == name)
    }

    /// Add a key. An existing key is only replaced when `overwrite` is set.
    pub fn add(&mut self, key: ConfigurationKey, overwrite: bool) {
        match self.keys.iter_mut().find(|k| k.key == key.key) {
            Some(existing) if overwrite => *existing = key,
            Some(_) => {}
            None => self.keys.push(key),
        }
    }

    /// Convenience add with default flags.
    pub fn add_value(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.add(
            ConfigurationKey {
                key: name.into(),
                value: value.into(),
                readonly: false,
                visible: true,
                reboot: false,
            },
            false,
        );
    }

    pub fn set_value(&mut self, name: &str, value: impl Into<String>) -> SetValueOutcome {
        match self.keys.iter_mut().find(|k| k.key == name) {
            None => SetValueOutcome::NotFound,
            Some(key) if key.readonly => SetValueOutcome::Readonly,
            Some(key) => {
                key.value = value.into();
                if key.reboot {
                    SetValueOutcome::RebootRequired
                } else {
                    SetValueOutcome::Changed
                }
            }
        }
    }

    pub fn delete(&mut self, name: &str) -> Option<ConfigurationKey> {
        let idx = self.keys.iter().position(|k| k.key == name)?;
        Some(self.keys.remove(idx))
    }

    /// Keys reported to the central system. Invisible keys are excluded;
    /// an explicit `names` filter also reports the unknown names.
    pub fn visible_keys(&self, names: Option<&[String]>) -> (Vec<&ConfigurationKey>, Vec<String>) {
        match names {
            None => (self.keys.iter().filter(|k| k.visible).collect(), vec![]),
            Some(names) => {
                let mut known = Vec::new();
                let mut unknown = Vec::new();
                for name in names {
                    match self.keys.iter().find(|k| k.key == *name && k.visible) {
                        Some(key) => known.push(key),
                        None => unknown.push(name.clone()),
                    }
                }
                (known, unknown)
            }
        }
    }

    /// All keys, for persistence.
    pub fn keys(&self) -> &[ConfigurationKey] {
        &self.keys
    }

    /// Integer value helper for interval-style keys.
    pub fn get_integer(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(|k| k.value.parse().ok())
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(|k| k.value.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str, value: &str) -> ConfigurationKey {
        ConfigurationKey {
            key: name.into(),
            value: value.into(),
            readonly: false,
            visible: true,
            reboot: false,
        }
    }

    #[test]
    fn add_without_overwrite_keeps_existing() {
        let mut store = ConfigurationStore::new();
        store.add(key("HeartbeatInterval", "300"), false);
        store.add(key("HeartbeatInterval", "60"), false);
        assert_eq!(store.get("HeartbeatInterval").unwrap().value, "300");

        store.add(key("HeartbeatInterval", "60"), true);
        assert_eq!(store.get("HeartbeatInterval").unwrap().value, "60");
    }

    #[test]
    fn readonly_keys_reject_mutation() {
        let mut store = ConfigurationStore::new();
        store.add(
            ConfigurationKey {
                readonly: true,
                ..key("NumberOfConnectors", "2")
            },
            false,
        );
        assert_eq!(
            store.set_value("NumberOfConnectors", "4"),
            SetValueOutcome::Readonly
        );
        assert_eq!(store.get("NumberOfConnectors").unwrap().value, "2");
    }

    #[test]
    fn reboot_keys_report_reboot_required() {
        let mut store = ConfigurationStore::new();
        store.add(
            ConfigurationKey {
                reboot: true,
                ..key("AuthorizeRemoteTxRequests", "true")
            },
            false,
        );
        assert_eq!(
            store.set_value("AuthorizeRemoteTxRequests", "false"),
            SetValueOutcome::RebootRequired
        );
        assert_eq!(store.get("AuthorizeRemoteTxRequests").unwrap().value, "false");
    }

    #[test]
    fn invisible_keys_are_not_reported() {
        let mut store = ConfigurationStore::new();
        store.add(key("HeartbeatInterval", "300"), false);
        store.add(
            ConfigurationKey {
                visible: false,
                ..key("AuthorizationKey", "secret")
            },
            false,
        );

        let (keys, unknown) = store.visible_keys(None);
        assert_eq!(keys.len(), 1);
        assert!(unknown.is_empty());

        let names = vec!["AuthorizationKey".to_string(), "Missing".to_string()];
        let (keys, unknown) = store.visible_keys(Some(&names));
        assert!(keys.is_empty());
        assert_eq!(unknown, names);
    }

    #[test]
    fn delete_removes_the_key() {
        let mut store = ConfigurationStore::new();
        store.add(key("ConnectionTimeOut", "30"), false);
        assert!(store.delete("ConnectionTimeOut").is_some());
        assert!(store.get("ConnectionTimeOut").is_none());
        assert!(store.delete("ConnectionTimeOut").is_none());
    }
}
