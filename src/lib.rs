//! # OCPP charging-station simulator
//!
//! Each [`Station`] impersonates a physical EV charging station speaking
//! OCPP-J 1.6 or 2.0.1 to a central system over WebSocket: it registers
//! with BootNotification, keeps its connector/EVSE model current, answers
//! central-system commands, schedules heartbeats and meter values, honors
//! smart-charging limits and manages reservations.
//!
//! ## Architecture
//!
//! - **support**: cross-cutting utilities (OCPP-J framing, errors,
//!   electric math, statistics, LRU file cache, shutdown)
//! - **domain**: entities and value objects (station info, connectors,
//!   charging profiles, reservations, configuration keys)
//! - **application**: use-case orchestration (message engine, version
//!   services, smart charging, reservations, meter values, ATG, events)
//! - **infrastructure**: external concerns (WebSocket channel, template
//!   reconciliation, configuration persistence)
//! - **station**: the per-station runtime actor
//! - **config**: simulator-level configuration

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod station;
pub mod support;

// Re-export commonly used types at crate root
pub use application::{EventBus, StationEvent};
pub use config::SimulatorConfig;
pub use domain::OcppVersion;
pub use station::{Station, StationContext};
pub use support::cache::FileCache;
pub use support::errors::StationInitError;
