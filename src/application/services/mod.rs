//! Version-specific request/response services
//!
//! Two interfaces decouple the engine and runtime from OCPP versions:
//! [`RequestService`] builds outbound request payloads and interprets their
//! responses; [`IncomingRequestService`] handles CALLs arriving from the
//! central system. One implementation pair exists per supported version,
//! selected by `ocppVersion` at station initialize.

pub mod v16;
pub mod v201;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::connector::ConnectorStatusKind;
use crate::domain::template::FirmwareStatus;
use crate::domain::{OcppVersion, StationInfo};
use crate::station::context::{BootResponse, StationContext};
use crate::support::errors::{EngineError, OcppCallError};

/// An outbound request ready for the engine: action name plus payload.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub action: &'static str,
    pub payload: Value,
}

/// One sampled measurand inside a meter-values message.
#[derive(Debug, Clone, Copy)]
pub enum SampledMeasurand {
    EnergyActiveImportRegister { wh: i64 },
    PowerActiveImport { w: f64 },
    StateOfCharge { percent: f64 },
}

/// A point-in-time meter sample for one connector.
#[derive(Debug, Clone)]
pub struct MeterSample {
    pub timestamp: DateTime<Utc>,
    pub values: Vec<SampledMeasurand>,
}

/// Parsed StartTransaction outcome.
#[derive(Debug, Clone, Copy)]
pub struct StartTransactionOutcome {
    pub accepted: bool,
    pub transaction_id: i32,
}

/// Stop reason carried into StopTransaction where the version supports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Local,
    Remote,
    Reboot,
    PowerLoss,
    DeAuthorized,
    Other,
}

/// Builds outbound requests and interprets their responses.
pub trait RequestService: Send + Sync {
    fn version(&self) -> OcppVersion;

    fn boot_notification(&self, info: &StationInfo) -> OutboundRequest;
    fn parse_boot_response(&self, payload: &Value) -> Result<BootResponse, EngineError>;

    fn heartbeat(&self) -> OutboundRequest;

    fn status_notification(
        &self,
        connector_id: u32,
        status: ConnectorStatusKind,
    ) -> OutboundRequest;

    fn meter_values(
        &self,
        connector_id: u32,
        transaction_id: Option<i32>,
        sample: &MeterSample,
    ) -> OutboundRequest;

    fn authorize(&self, id_tag: &str) -> OutboundRequest;
    fn parse_authorize_response(&self, payload: &Value) -> Result<bool, EngineError>;

    /// Build the transaction-start request. The second element is the
    /// station-allocated transaction id, set by versions where the station
    /// owns the id; the caller hands it back to the response parser so a
    /// concurrent start on another connector cannot swap ids.
    fn start_transaction(
        &self,
        connector_id: u32,
        id_tag: &str,
        meter_start: i64,
        timestamp: DateTime<Utc>,
        reservation_id: Option<i32>,
    ) -> (OutboundRequest, Option<i32>);
    fn parse_start_transaction_response(
        &self,
        payload: &Value,
        allocated_transaction_id: Option<i32>,
    ) -> Result<StartTransactionOutcome, EngineError>;

    fn stop_transaction(
        &self,
        transaction_id: i32,
        meter_stop: i64,
        timestamp: DateTime<Utc>,
        id_tag: Option<&str>,
        reason: Option<StopReason>,
    ) -> OutboundRequest;

    fn firmware_status_notification(&self, status: FirmwareStatus) -> OutboundRequest;
}

/// Handles CALLs from the central system. Implementations return the
/// CALLRESULT payload or the CALLERROR to answer with.
#[async_trait]
pub trait IncomingRequestService: Send + Sync {
    async fn handle(
        &self,
        ctx: &Arc<StationContext>,
        action: &str,
        payload: Value,
    ) -> Result<Value, OcppCallError>;
}

/// Service pair for a protocol version.
pub fn services_for(
    version: OcppVersion,
) -> (Arc<dyn RequestService>, Arc<dyn IncomingRequestService>) {
    match version {
        OcppVersion::V16 => (
            Arc::new(v16::V16RequestService),
            Arc::new(v16::V16IncomingRequestService),
        ),
        OcppVersion::V201 => (
            Arc::new(v201::V201RequestService::default()),
            Arc::new(v201::V201IncomingRequestService),
        ),
    }
}
