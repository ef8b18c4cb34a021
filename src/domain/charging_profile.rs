//! Charging profile domain entities
//!
//! Wire-compatible with the OCPP 1.6 `ChargingProfile` object (camelCase
//! serde), which SetChargingProfile payloads deserialize into directly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingProfilePurpose {
    ChargePointMaxProfile,
    TxDefaultProfile,
    TxProfile,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingProfileKind {
    Absolute,
    Recurring,
    Relative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecurrencyKind {
    Daily,
    Weekly,
}

impl RecurrencyKind {
    /// Length of one recurrency interval in seconds.
    pub fn period_seconds(&self) -> i64 {
        match self {
            Self::Daily => 86_400,
            Self::Weekly => 7 * 86_400,
        }
    }
}

/// Unit the schedule limits are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChargingRateUnit {
    W,
    A,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedulePeriod {
    /// Offset in seconds from the schedule start.
    pub start_period: i64,
    pub limit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_phases: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingSchedule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_schedule: Option<DateTime<Utc>>,
    pub charging_rate_unit: ChargingRateUnit,
    pub charging_schedule_period: Vec<ChargingSchedulePeriod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_charging_rate: Option<f64>,
}

impl ChargingSchedule {
    /// Sort periods ascending by start offset. Returns `false` when the
    /// schedule is unusable (no periods, or the first one does not start
    /// at offset 0).
    pub fn normalize(&mut self) -> bool {
        self.charging_schedule_period
            .sort_by_key(|p| p.start_period);
        matches!(
            self.charging_schedule_period.first(),
            Some(first) if first.start_period == 0
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingProfile {
    pub charging_profile_id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<i32>,
    pub stack_level: u32,
    pub charging_profile_purpose: ChargingProfilePurpose,
    pub charging_profile_kind: ChargingProfileKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recurrency_kind: Option<RecurrencyKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
    pub charging_schedule: ChargingSchedule,
}

impl ChargingProfile {
    /// `now` falls inside the validity window (open-ended when unset).
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_from.map_or(true, |from| now >= from)
            && self.valid_to.map_or(true, |to| now <= to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(periods: Vec<(i64, f64)>) -> ChargingSchedule {
        ChargingSchedule {
            duration: Some(3600),
            start_schedule: None,
            charging_rate_unit: ChargingRateUnit::W,
            charging_schedule_period: periods
                .into_iter()
                .map(|(start_period, limit)| ChargingSchedulePeriod {
                    start_period,
                    limit,
                    number_phases: None,
                })
                .collect(),
            min_charging_rate: None,
        }
    }

    #[test]
    fn normalize_sorts_periods() {
        let mut s = schedule(vec![(1800, 8000.0), (0, 16000.0), (900, 11000.0)]);
        assert!(s.normalize());
        let offsets: Vec<i64> = s
            .charging_schedule_period
            .iter()
            .map(|p| p.start_period)
            .collect();
        assert_eq!(offsets, vec![0, 900, 1800]);
    }

    #[test]
    fn normalize_rejects_missing_zero_offset() {
        let mut s = schedule(vec![(900, 8000.0)]);
        assert!(!s.normalize());
        let mut empty = schedule(vec![]);
        assert!(!empty.normalize());
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let json = serde_json::json!({
            "chargingProfileId": 7,
            "stackLevel": 2,
            "chargingProfilePurpose": "TxProfile",
            "chargingProfileKind": "Recurring",
            "recurrencyKind": "Weekly",
            "chargingSchedule": {
                "startSchedule": "2024-01-01T00:00:00Z",
                "duration": 86400,
                "chargingRateUnit": "A",
                "chargingSchedulePeriod": [{"startPeriod": 0, "limit": 16.0}]
            }
        });
        let profile: ChargingProfile = serde_json::from_value(json).unwrap();
        assert_eq!(profile.charging_profile_id, 7);
        assert_eq!(profile.recurrency_kind, Some(RecurrencyKind::Weekly));
        assert_eq!(
            profile.charging_schedule.charging_rate_unit,
            ChargingRateUnit::A
        );
    }

    #[test]
    fn validity_window() {
        let mut profile = ChargingProfile {
            charging_profile_id: 1,
            transaction_id: None,
            stack_level: 0,
            charging_profile_purpose: ChargingProfilePurpose::TxDefaultProfile,
            charging_profile_kind: ChargingProfileKind::Absolute,
            recurrency_kind: None,
            valid_from: None,
            valid_to: None,
            charging_schedule: schedule(vec![(0, 16000.0)]),
        };
        let now = Utc::now();
        assert!(profile.is_valid_at(now));

        profile.valid_from = Some(now + chrono::Duration::hours(1));
        assert!(!profile.is_valid_at(now));

        profile.valid_from = Some(now - chrono::Duration::hours(2));
        profile.valid_to = Some(now - chrono::Duration::hours(1));
        assert!(!profile.is_valid_at(now));
    }
}
