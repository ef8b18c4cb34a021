//! Power/amperage arithmetic for AC and DC stations.

use serde::{Deserialize, Serialize};

/// Current delivery type of the station output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CurrentType {
    #[default]
    AC,
    DC,
}

/// Watts drawn at `amperage` on every phase.
///
/// Three-phase AC sums the per-phase contributions; DC ignores the phase
/// count entirely.
pub fn amperage_to_power(current: CurrentType, voltage: f64, phases: u32, amperage: f64) -> f64 {
    match current {
        CurrentType::AC => voltage * amperage * f64::from(phases.max(1)),
        CurrentType::DC => voltage * amperage,
    }
}

/// Per-phase amperage needed to draw `power` watts, rounded down to whole
/// amps as charge points advertise it.
pub fn power_to_amperage(current: CurrentType, voltage: f64, phases: u32, power: f64) -> u32 {
    if voltage <= 0.0 {
        return 0;
    }
    let amps = match current {
        CurrentType::AC => power / (voltage * f64::from(phases.max(1))),
        CurrentType::DC => power / voltage,
    };
    amps.max(0.0).floor() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_phase_ac_sums_phases() {
        // 16 A at 230 V on 3 phases
        assert_eq!(
            amperage_to_power(CurrentType::AC, 230.0, 3, 16.0),
            11040.0
        );
    }

    #[test]
    fn dc_ignores_phases() {
        assert_eq!(amperage_to_power(CurrentType::DC, 400.0, 3, 10.0), 4000.0);
    }

    #[test]
    fn amperage_derivation_rounds_down() {
        // 22 kW AC / (230 V * 3) = 31.88 A -> 31 A
        assert_eq!(power_to_amperage(CurrentType::AC, 230.0, 3, 22000.0), 31);
        assert_eq!(power_to_amperage(CurrentType::DC, 400.0, 1, 50000.0), 125);
    }

    #[test]
    fn zero_voltage_yields_zero_amperage() {
        assert_eq!(power_to_amperage(CurrentType::AC, 0.0, 3, 22000.0), 0);
    }
}
