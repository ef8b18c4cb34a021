//! Use-case layer: the message engine, version services, station
//! operations, smart charging, reservations, meter values and the
//! transaction generator.

pub mod atg;
pub mod engine;
pub mod events;
pub mod meter_values;
pub mod operations;
pub mod reservations;
pub mod services;
pub mod smart_charging;

pub use atg::{AutomaticTransactionGenerator, TransactionGenerator};
pub use engine::{CallOptions, OcppEngine};
pub use events::{EventBus, StationEvent};
pub use services::{services_for, IncomingRequestService, RequestService};
pub use smart_charging::{connector_power_limit, ResolvedLimit};
