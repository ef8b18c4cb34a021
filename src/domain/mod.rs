//! Domain entities and value objects: station identity, connectors,
//! charging profiles, reservations, configuration keys.

pub mod charging_profile;
pub mod configuration;
pub mod connector;
pub mod reservation;
pub mod station;
pub mod template;
pub mod version;

pub use charging_profile::{
    ChargingProfile, ChargingProfileKind, ChargingProfilePurpose, ChargingRateUnit,
    ChargingSchedule, ChargingSchedulePeriod, RecurrencyKind,
};
pub use configuration::{ConfigurationKey, ConfigurationStore, SetValueOutcome};
pub use connector::{AvailabilityKind, Connector, ConnectorModel, ConnectorStatusKind, Evse};
pub use reservation::{Reservation, ReservationTerminationReason};
pub use station::StationInfo;
pub use template::{
    AutomaticTransactionGeneratorConfiguration, ChargingStationTemplate, FirmwareStatus,
    FirmwareUpgrade,
};
pub use version::OcppVersion;
