//! Connector and EVSE state model
//!
//! In-memory view of the simulated hardware: per-connector availability,
//! OCPP status, running transaction, charging profiles and reservation.
//! Connector 0 represents the station as a whole and never carries a
//! transaction. A station is populated with plain connectors XOR EVSEs,
//! never both.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::charging_profile::ChargingProfile;
use super::reservation::Reservation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AvailabilityKind {
    #[default]
    Operative,
    Inoperative,
}

/// OCPP connector status values (identical set in 1.6; mapped for 2.0.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectorStatusKind {
    Available,
    Preparing,
    Charging,
    SuspendedEV,
    SuspendedEVSE,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

/// One physical connector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connector {
    pub availability: AvailabilityKind,
    /// Current reported status; unset until the first StatusNotification.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ConnectorStatusKind>,
    /// Status forced by the template at bring-up.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_status: Option<ConnectorStatusKind>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i32>,
    pub transaction_started: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_start: Option<DateTime<Utc>>,
    /// Meter register at transaction begin, in Wh.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_begin_meter_value: Option<i64>,
    /// Running energy register, in Wh.
    pub energy_active_import_register: i64,

    pub id_tag_local_authorized: bool,
    pub id_tag_authorized: bool,
    pub transaction_remote_started: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub charging_profiles: Vec<ChargingProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation: Option<Reservation>,
}

impl Connector {
    /// Begin a transaction. Keeps `transaction_id` and
    /// `transaction_started` in lockstep.
    pub fn start_transaction(
        &mut self,
        transaction_id: i32,
        id_tag: impl Into<String>,
        meter_start: i64,
        started_at: DateTime<Utc>,
    ) {
        self.transaction_id = Some(transaction_id);
        self.transaction_started = true;
        self.transaction_id_tag = Some(id_tag.into());
        self.transaction_start = Some(started_at);
        self.transaction_begin_meter_value = Some(meter_start);
        self.energy_active_import_register = meter_start;
    }

    /// End the transaction and reset the per-transaction state. Returns the
    /// final meter register.
    pub fn stop_transaction(&mut self) -> i64 {
        let meter_stop = self.energy_active_import_register;
        self.transaction_id = None;
        self.transaction_started = false;
        self.transaction_id_tag = None;
        self.transaction_start = None;
        self.transaction_begin_meter_value = None;
        self.id_tag_local_authorized = false;
        self.id_tag_authorized = false;
        self.transaction_remote_started = false;
        meter_stop
    }

    pub fn has_transaction(&self) -> bool {
        debug_assert_eq!(self.transaction_started, self.transaction_id.is_some());
        self.transaction_started
    }

    /// Install a profile, replacing any existing one with the same id, or
    /// with the same stack level and purpose.
    pub fn set_charging_profile(&mut self, profile: ChargingProfile) {
        self.charging_profiles.retain(|p| {
            p.charging_profile_id != profile.charging_profile_id
                && (p.stack_level != profile.stack_level
                    || p.charging_profile_purpose != profile.charging_profile_purpose)
        });
        self.charging_profiles.push(profile);
    }
}

/// One EVSE holding its own connectors. Connector ids stay globally unique
/// across the station.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Evse {
    pub availability: AvailabilityKind,
    pub connectors: BTreeMap<u32, Connector>,
}

/// The station's connector topology: plain connectors XOR EVSEs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorModel {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub connectors: BTreeMap<u32, Connector>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub evses: BTreeMap<u32, Evse>,
}

impl ConnectorModel {
    pub fn with_connectors(connectors: BTreeMap<u32, Connector>) -> Self {
        Self {
            connectors,
            evses: BTreeMap::new(),
        }
    }

    pub fn with_evses(evses: BTreeMap<u32, Evse>) -> Self {
        Self {
            connectors: BTreeMap::new(),
            evses,
        }
    }

    pub fn uses_evses(&self) -> bool {
        !self.evses.is_empty()
    }

    pub fn connector(&self, id: u32) -> Option<&Connector> {
        if self.uses_evses() {
            self.evses.values().find_map(|e| e.connectors.get(&id))
        } else {
            self.connectors.get(&id)
        }
    }

    pub fn connector_mut(&mut self, id: u32) -> Option<&mut Connector> {
        if self.evses.is_empty() {
            self.connectors.get_mut(&id)
        } else {
            self.evses
                .values_mut()
                .find_map(|e| e.connectors.get_mut(&id))
        }
    }

    /// Connector ids in ascending order, connector 0 included when present.
    pub fn connector_ids(&self) -> Vec<u32> {
        if self.uses_evses() {
            let mut ids: Vec<u32> = self
                .evses
                .values()
                .flat_map(|e| e.connectors.keys().copied())
                .collect();
            ids.sort_unstable();
            ids
        } else {
            self.connectors.keys().copied().collect()
        }
    }

    /// Chargeable connector ids (excludes connector 0).
    pub fn chargeable_connector_ids(&self) -> Vec<u32> {
        self.connector_ids().into_iter().filter(|id| *id > 0).collect()
    }

    pub fn number_of_connectors(&self) -> usize {
        self.chargeable_connector_ids().len()
    }

    /// EVSE count, exclusive of the station-wide EVSE 0.
    pub fn number_of_evses(&self) -> usize {
        self.evses.keys().filter(|id| **id > 0).count()
    }

    pub fn number_of_running_transactions(&self) -> usize {
        self.connector_ids()
            .iter()
            .filter(|id| {
                **id > 0
                    && self
                        .connector(**id)
                        .map(Connector::has_transaction)
                        .unwrap_or(false)
            })
            .count()
    }

    /// Profiles that apply to a connector: its own plus the station-wide
    /// (connector 0) ones.
    pub fn applicable_profiles(&self, connector_id: u32) -> Vec<(bool, ChargingProfile)> {
        let mut profiles = Vec::new();
        if let Some(connector) = self.connector(connector_id) {
            profiles.extend(
                connector
                    .charging_profiles
                    .iter()
                    .cloned()
                    .map(|p| (true, p)),
            );
        }
        if connector_id != 0 {
            if let Some(station_wide) = self.connector(0) {
                profiles.extend(
                    station_wide
                        .charging_profiles
                        .iter()
                        .cloned()
                        .map(|p| (false, p)),
                );
            }
        }
        profiles
    }

    /// Find the connector currently running `transaction_id`.
    pub fn connector_id_for_transaction(&self, transaction_id: i32) -> Option<u32> {
        self.connector_ids().into_iter().find(|id| {
            self.connector(*id)
                .and_then(|c| c.transaction_id)
                .map(|tx| tx == transaction_id)
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_with(n: u32) -> ConnectorModel {
        let mut connectors = BTreeMap::new();
        for id in 0..=n {
            connectors.insert(id, Connector::default());
        }
        ConnectorModel::with_connectors(connectors)
    }

    #[test]
    fn transaction_flag_follows_transaction_id() {
        let mut connector = Connector::default();
        assert!(!connector.has_transaction());

        connector.start_transaction(42, "TAG-1", 100, Utc::now());
        assert!(connector.has_transaction());
        assert_eq!(connector.transaction_id, Some(42));
        assert_eq!(connector.transaction_begin_meter_value, Some(100));

        let meter_stop = connector.stop_transaction();
        assert_eq!(meter_stop, 100);
        assert!(!connector.has_transaction());
        assert!(connector.transaction_id.is_none());
    }

    #[test]
    fn running_transactions_exclude_connector_zero() {
        let mut model = model_with(2);
        model
            .connector_mut(1)
            .unwrap()
            .start_transaction(1, "TAG", 0, Utc::now());
        assert_eq!(model.number_of_running_transactions(), 1);
        assert_eq!(model.connector_id_for_transaction(1), Some(1));
        assert_eq!(model.connector_id_for_transaction(9), None);
    }

    #[test]
    fn evse_connectors_are_reachable_by_global_id() {
        let mut evses = BTreeMap::new();
        let mut evse1 = Evse::default();
        evse1.connectors.insert(1, Connector::default());
        let mut evse2 = Evse::default();
        evse2.connectors.insert(2, Connector::default());
        evses.insert(1, evse1);
        evses.insert(2, evse2);

        let model = ConnectorModel::with_evses(evses);
        assert!(model.uses_evses());
        assert!(model.connector(2).is_some());
        assert_eq!(model.chargeable_connector_ids(), vec![1, 2]);
        assert_eq!(model.number_of_evses(), 2);
    }

    #[test]
    fn station_wide_profiles_stack_behind_connector_profiles() {
        use crate::domain::charging_profile::*;

        let profile = |id: i32, stack_level: u32| ChargingProfile {
            charging_profile_id: id,
            transaction_id: None,
            stack_level,
            charging_profile_purpose: ChargingProfilePurpose::TxDefaultProfile,
            charging_profile_kind: ChargingProfileKind::Absolute,
            recurrency_kind: None,
            valid_from: None,
            valid_to: None,
            charging_schedule: ChargingSchedule {
                duration: None,
                start_schedule: None,
                charging_rate_unit: ChargingRateUnit::W,
                charging_schedule_period: vec![],
                min_charging_rate: None,
            },
        };

        let mut model = model_with(1);
        model.connector_mut(0).unwrap().set_charging_profile(profile(1, 0));
        model.connector_mut(1).unwrap().set_charging_profile(profile(2, 1));

        let applicable = model.applicable_profiles(1);
        assert_eq!(applicable.len(), 2);
        // connector-specific first
        assert!(applicable[0].0);
        assert_eq!(applicable[0].1.charging_profile_id, 2);
        assert!(!applicable[1].0);
    }
}
