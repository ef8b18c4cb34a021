//! Smart-charging limit resolution
//!
//! Computes the effective power limit for a connector from its stacked
//! charging profiles: connector-specific profiles before station-wide
//! ones, higher stack levels first. Recurring schedules are translated
//! forward into the current interval; relative schedules anchor at the
//! running transaction start. Limits expressed in amps are converted to
//! watts with the station voltage and phase count, and the result is
//! capped by the per-connector share of the station maximum.

use chrono::{DateTime, Duration, Utc};
use tracing::{error, warn};

use crate::domain::charging_profile::{
    ChargingProfile, ChargingProfileKind, ChargingRateUnit, ChargingSchedulePeriod,
};
use crate::station::context::StationContext;
use crate::support::electric::amperage_to_power;

/// A resolved limit and the profile that produced it.
#[derive(Debug, Clone)]
pub struct ResolvedLimit {
    /// Effective limit in Watts, after unit conversion and capping.
    pub limit_watts: f64,
    pub charging_profile: ChargingProfile,
}

/// Effective power limit for `connector_id` at `now`. `None` means
/// unlimited (no applicable profile).
pub fn connector_power_limit(
    ctx: &StationContext,
    connector_id: u32,
    now: DateTime<Utc>,
) -> Option<ResolvedLimit> {
    let station_id = ctx.station_id();
    let (mut profiles, transaction_start, evse_count, running_transactions) = {
        let connectors = ctx.connectors.lock().unwrap();
        (
            connectors.applicable_profiles(connector_id),
            connectors
                .connector(connector_id)
                .and_then(|c| c.transaction_start),
            connectors.number_of_evses(),
            connectors.number_of_running_transactions(),
        )
    };

    // Connector-specific profiles outrank station-wide ones; within each
    // group the higher stack level wins.
    profiles.sort_by(|(a_specific, a), (b_specific, b)| {
        b_specific
            .cmp(a_specific)
            .then(b.stack_level.cmp(&a.stack_level))
    });

    for (_, mut profile) in profiles {
        let Some(limit) = profile_limit_at(&mut profile, transaction_start, now, &station_id)
        else {
            continue;
        };

        let info = ctx.info.read().unwrap();
        let phases = profile
            .charging_schedule
            .charging_schedule_period
            .first()
            .and_then(|p| p.number_phases)
            .unwrap_or(info.number_of_phases);
        let mut limit_watts = match profile.charging_schedule.charging_rate_unit {
            ChargingRateUnit::W => limit,
            ChargingRateUnit::A => {
                amperage_to_power(info.current_out_type, info.voltage_out, phases, limit)
            }
        };

        // Station ceiling: the amperage-limitation key tightens the
        // template maximum when present.
        let mut station_maximum = info.maximum_power;
        if let Some(key) = &info.amperage_limitation_ocpp_key {
            if let Some(amps) = ctx.configuration.lock().unwrap().get_integer(key) {
                station_maximum = station_maximum.min(amperage_to_power(
                    info.current_out_type,
                    info.voltage_out,
                    info.number_of_phases,
                    amps as f64,
                ));
            }
        }
        let connector_maximum =
            station_maximum / info.power_divider(evse_count, running_transactions);
        if limit_watts > connector_maximum {
            error!(
                station_id = station_id.as_str(),
                connector_id,
                charging_profile_id = profile.charging_profile_id,
                limit_watts,
                connector_maximum,
                "Charging profile limit above the connector maximum, clamping"
            );
            limit_watts = connector_maximum;
        }

        return Some(ResolvedLimit {
            limit_watts,
            charging_profile: profile,
        });
    }
    None
}

/// The raw schedule limit this profile yields at `now`, in the profile's
/// own rate unit. `None` when the profile does not apply.
fn profile_limit_at(
    profile: &mut ChargingProfile,
    transaction_start: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    station_id: &str,
) -> Option<f64> {
    match profile.charging_profile_kind {
        ChargingProfileKind::Relative => {
            let Some(transaction_start) = transaction_start else {
                return None;
            };
            if profile.charging_schedule.start_schedule.is_some() {
                warn!(
                    station_id,
                    charging_profile_id = profile.charging_profile_id,
                    "Relative profile carries a startSchedule, ignoring it"
                );
            }
            profile.charging_schedule.start_schedule = Some(transaction_start);
        }
        ChargingProfileKind::Recurring => {
            let Some(recurrency) = profile.recurrency_kind else {
                warn!(
                    station_id,
                    charging_profile_id = profile.charging_profile_id,
                    "Recurring profile without recurrencyKind, skipping"
                );
                return None;
            };
            let Some(start_schedule) = profile.charging_schedule.start_schedule else {
                warn!(
                    station_id,
                    charging_profile_id = profile.charging_profile_id,
                    "Recurring profile without startSchedule, skipping"
                );
                return None;
            };
            let period_secs = recurrency.period_seconds();
            let elapsed = (now - start_schedule).num_seconds();
            if elapsed >= 0 {
                let intervals = elapsed / period_secs;
                profile.charging_schedule.start_schedule =
                    Some(start_schedule + Duration::seconds(intervals * period_secs));
            }
            // clamp the duration to one recurrency interval
            match profile.charging_schedule.duration {
                Some(duration) if duration <= period_secs => {}
                _ => profile.charging_schedule.duration = Some(period_secs),
            }
        }
        ChargingProfileKind::Absolute => {}
    }

    if !profile.is_valid_at(now) {
        return None;
    }
    let Some(start_schedule) = profile.charging_schedule.start_schedule else {
        warn!(
            station_id,
            charging_profile_id = profile.charging_profile_id,
            "Profile without startSchedule, skipping"
        );
        return None;
    };
    let Some(duration) = profile.charging_schedule.duration.filter(|d| *d > 0) else {
        warn!(
            station_id,
            charging_profile_id = profile.charging_profile_id,
            "Profile without a usable duration, skipping"
        );
        return None;
    };

    let elapsed = (now - start_schedule).num_seconds();
    if elapsed < 0 || elapsed >= duration {
        return None;
    }

    if !profile.charging_schedule.normalize() {
        warn!(
            station_id,
            charging_profile_id = profile.charging_profile_id,
            "Schedule periods do not start at offset 0, skipping"
        );
        return None;
    }
    // last period already begun: its limit applies until the next one starts
    active_period(&profile.charging_schedule.charging_schedule_period, elapsed)
        .map(|period| period.limit)
}

fn active_period(periods: &[ChargingSchedulePeriod], elapsed: i64) -> Option<&ChargingSchedulePeriod> {
    periods.iter().rev().find(|p| p.start_period <= elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::charging_profile::*;
    use crate::station::testing;
    use chrono::TimeZone;

    fn profile(
        id: i32,
        stack_level: u32,
        kind: ChargingProfileKind,
        unit: ChargingRateUnit,
        periods: Vec<(i64, f64)>,
    ) -> ChargingProfile {
        ChargingProfile {
            charging_profile_id: id,
            transaction_id: None,
            stack_level,
            charging_profile_purpose: ChargingProfilePurpose::TxDefaultProfile,
            charging_profile_kind: kind,
            recurrency_kind: None,
            valid_from: None,
            valid_to: None,
            charging_schedule: ChargingSchedule {
                duration: Some(86_400),
                start_schedule: Some(Utc::now() - Duration::hours(1)),
                charging_rate_unit: unit,
                charging_schedule_period: periods
                    .into_iter()
                    .map(|(start_period, limit)| ChargingSchedulePeriod {
                        start_period,
                        limit,
                        number_phases: None,
                    })
                    .collect(),
                min_charging_rate: None,
            },
        }
    }

    #[tokio::test]
    async fn higher_stack_level_wins() {
        let ctx = testing::context();
        {
            let mut connectors = ctx.connectors.lock().unwrap();
            let connector = connectors.connector_mut(1).unwrap();
            connector.set_charging_profile(profile(
                1,
                1,
                ChargingProfileKind::Absolute,
                ChargingRateUnit::A,
                vec![(0, 16.0)],
            ));
            connector.set_charging_profile(profile(
                2,
                2,
                ChargingProfileKind::Absolute,
                ChargingRateUnit::A,
                vec![(0, 10.0)],
            ));
        }
        let resolved = connector_power_limit(&ctx, 1, Utc::now()).unwrap();
        // 10 A * 230 V * 3 phases
        assert_eq!(resolved.limit_watts, 6900.0);
        assert_eq!(resolved.charging_profile.charging_profile_id, 2);
    }

    #[tokio::test]
    async fn weekly_recurring_schedule_translates_forward() {
        let ctx = testing::context();
        let mut weekly = profile(
            3,
            0,
            ChargingProfileKind::Recurring,
            ChargingRateUnit::W,
            vec![(0, 5000.0)],
        );
        weekly.recurrency_kind = Some(RecurrencyKind::Weekly);
        weekly.charging_schedule.start_schedule =
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        weekly.charging_schedule.duration = Some(86_400);
        {
            let mut connectors = ctx.connectors.lock().unwrap();
            connectors.connector_mut(1).unwrap().set_charging_profile(weekly);
        }

        let now = Utc.with_ymd_and_hms(2024, 1, 22, 12, 0, 0).unwrap();
        let resolved = connector_power_limit(&ctx, 1, now).unwrap();
        assert_eq!(resolved.limit_watts, 5000.0);
        assert_eq!(
            resolved.charging_profile.charging_schedule.start_schedule,
            Some(Utc.with_ymd_and_hms(2024, 1, 22, 0, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn recurring_outside_duration_yields_no_limit() {
        let ctx = testing::context();
        let mut daily = profile(
            4,
            0,
            ChargingProfileKind::Recurring,
            ChargingRateUnit::W,
            vec![(0, 5000.0)],
        );
        daily.recurrency_kind = Some(RecurrencyKind::Daily);
        daily.charging_schedule.start_schedule =
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        daily.charging_schedule.duration = Some(3600);
        {
            let mut connectors = ctx.connectors.lock().unwrap();
            connectors.connector_mut(1).unwrap().set_charging_profile(daily);
        }

        // 02:00 is outside the one-hour daily window
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 2, 0, 0).unwrap();
        assert!(connector_power_limit(&ctx, 1, now).is_none());
        // 00:30 is inside
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 0, 30, 0).unwrap();
        assert!(connector_power_limit(&ctx, 1, now).is_some());
    }

    #[tokio::test]
    async fn relative_profile_needs_a_transaction() {
        let ctx = testing::context();
        let mut relative = profile(
            5,
            0,
            ChargingProfileKind::Relative,
            ChargingRateUnit::W,
            vec![(0, 7000.0)],
        );
        relative.charging_schedule.start_schedule = None;
        {
            let mut connectors = ctx.connectors.lock().unwrap();
            connectors
                .connector_mut(1)
                .unwrap()
                .set_charging_profile(relative);
        }
        assert!(connector_power_limit(&ctx, 1, Utc::now()).is_none());

        {
            let mut connectors = ctx.connectors.lock().unwrap();
            connectors
                .connector_mut(1)
                .unwrap()
                .start_transaction(1, "TAG-1", 0, Utc::now() - Duration::minutes(5));
        }
        let resolved = connector_power_limit(&ctx, 1, Utc::now()).unwrap();
        assert_eq!(resolved.limit_watts, 7000.0);
    }

    #[tokio::test]
    async fn the_later_period_applies() {
        let ctx = testing::context();
        let mut stepped = profile(
            6,
            0,
            ChargingProfileKind::Absolute,
            ChargingRateUnit::W,
            vec![(0, 11000.0), (1800, 6000.0)],
        );
        stepped.charging_schedule.start_schedule = Some(Utc::now() - Duration::hours(1));
        {
            let mut connectors = ctx.connectors.lock().unwrap();
            connectors
                .connector_mut(1)
                .unwrap()
                .set_charging_profile(stepped);
        }
        let resolved = connector_power_limit(&ctx, 1, Utc::now()).unwrap();
        assert_eq!(resolved.limit_watts, 6000.0);
    }

    #[tokio::test]
    async fn limits_are_capped_by_the_connector_share() {
        let ctx = testing::context();
        // station maximum 22 kW over 2 connectors -> 11 kW per connector
        {
            let mut connectors = ctx.connectors.lock().unwrap();
            connectors.connector_mut(1).unwrap().set_charging_profile(profile(
                7,
                0,
                ChargingProfileKind::Absolute,
                ChargingRateUnit::W,
                vec![(0, 50_000.0)],
            ));
        }
        let resolved = connector_power_limit(&ctx, 1, Utc::now()).unwrap();
        assert_eq!(resolved.limit_watts, 11_000.0);
    }

    #[tokio::test]
    async fn malformed_periods_skip_the_profile() {
        let ctx = testing::context();
        {
            let mut connectors = ctx.connectors.lock().unwrap();
            connectors.connector_mut(1).unwrap().set_charging_profile(profile(
                8,
                0,
                ChargingProfileKind::Absolute,
                ChargingRateUnit::W,
                vec![(600, 9000.0)],
            ));
        }
        assert!(connector_power_limit(&ctx, 1, Utc::now()).is_none());
    }
}
