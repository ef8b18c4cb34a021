//! OCPP 1.6 request/response services
//!
//! Outbound payloads are built with the `rust_ocpp` v1.6 message structs;
//! inbound CS commands are parsed the same way and answered with the
//! matching response structs.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_ocpp::v1_6::messages::authorize::{AuthorizeRequest, AuthorizeResponse};
use rust_ocpp::v1_6::messages::boot_notification::BootNotificationRequest;
use rust_ocpp::v1_6::messages::cancel_reservation::{
    CancelReservationRequest, CancelReservationResponse,
};
use rust_ocpp::v1_6::messages::change_availability::{
    ChangeAvailabilityRequest, ChangeAvailabilityResponse,
};
use rust_ocpp::v1_6::messages::change_configuration::{
    ChangeConfigurationRequest, ChangeConfigurationResponse,
};
use rust_ocpp::v1_6::messages::clear_cache::ClearCacheResponse;
use rust_ocpp::v1_6::messages::clear_charging_profile::ClearChargingProfileResponse;
use rust_ocpp::v1_6::messages::data_transfer::{DataTransferRequest, DataTransferResponse};
use rust_ocpp::v1_6::messages::firmware_status_notification::FirmwareStatusNotificationRequest;
use rust_ocpp::v1_6::messages::get_configuration::{
    GetConfigurationRequest, GetConfigurationResponse,
};
use rust_ocpp::v1_6::messages::heart_beat::HeartbeatRequest;
use rust_ocpp::v1_6::messages::meter_values::MeterValuesRequest;
use rust_ocpp::v1_6::messages::remote_start_transaction::RemoteStartTransactionResponse;
use rust_ocpp::v1_6::messages::remote_stop_transaction::{
    RemoteStopTransactionRequest, RemoteStopTransactionResponse,
};
use rust_ocpp::v1_6::messages::reserve_now::{ReserveNowRequest, ReserveNowResponse};
use rust_ocpp::v1_6::messages::reset::{ResetRequest, ResetResponse};
use rust_ocpp::v1_6::messages::set_charging_profile::SetChargingProfileResponse;
use rust_ocpp::v1_6::messages::start_transaction::{
    StartTransactionRequest, StartTransactionResponse,
};
use rust_ocpp::v1_6::messages::status_notification::StatusNotificationRequest;
use rust_ocpp::v1_6::messages::stop_transaction::StopTransactionRequest;
use rust_ocpp::v1_6::messages::trigger_message::{TriggerMessageRequest, TriggerMessageResponse};
use rust_ocpp::v1_6::messages::unlock_connector::{
    UnlockConnectorRequest, UnlockConnectorResponse,
};
use rust_ocpp::v1_6::types::{
    AuthorizationStatus, AvailabilityStatus, AvailabilityType, CancelReservationStatus,
    ChargePointErrorCode, ChargePointStatus, ChargingProfileStatus, ClearCacheStatus,
    ClearChargingProfileStatus, ConfigurationStatus, DataTransferStatus, FirmwareStatus,
    KeyValue, Measurand, MessageTrigger, MeterValue, Reason, RemoteStartStopStatus,
    ReservationStatus, ResetRequestStatus, ResetResponseStatus, SampledValue,
    TriggerMessageStatus, UnitOfMeasure, UnlockStatus,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::application::engine::CallOptions;
use crate::application::events::StationEvent;
use crate::application::{operations, reservations};
use crate::domain::charging_profile::{ChargingProfile, ChargingProfilePurpose};
use crate::domain::configuration::SetValueOutcome;
use crate::domain::connector::{AvailabilityKind, ConnectorStatusKind};
use crate::domain::reservation::{Reservation, ReservationTerminationReason};
use crate::domain::template::FirmwareStatus as DomainFirmwareStatus;
use crate::domain::{OcppVersion, StationInfo};
use crate::station::context::{
    BootResponse, RegistrationStatus, ResetKind, RuntimeCommand, StationContext,
};
use crate::support::errors::{EngineError, OcppCallError};

use super::{
    IncomingRequestService, MeterSample, OutboundRequest, RequestService, SampledMeasurand,
    StartTransactionOutcome, StopReason,
};

fn to_payload<T: serde::Serialize>(action: &'static str, request: &T) -> OutboundRequest {
    OutboundRequest {
        action,
        // rust_ocpp messages serialize infallibly
        payload: serde_json::to_value(request).unwrap_or_default(),
    }
}

fn wire_status(status: ConnectorStatusKind) -> ChargePointStatus {
    match status {
        ConnectorStatusKind::Available => ChargePointStatus::Available,
        ConnectorStatusKind::Preparing => ChargePointStatus::Preparing,
        ConnectorStatusKind::Charging => ChargePointStatus::Charging,
        ConnectorStatusKind::SuspendedEV => ChargePointStatus::SuspendedEV,
        ConnectorStatusKind::SuspendedEVSE => ChargePointStatus::SuspendedEVSE,
        ConnectorStatusKind::Finishing => ChargePointStatus::Finishing,
        ConnectorStatusKind::Reserved => ChargePointStatus::Reserved,
        ConnectorStatusKind::Unavailable => ChargePointStatus::Unavailable,
        ConnectorStatusKind::Faulted => ChargePointStatus::Faulted,
    }
}

fn wire_firmware_status(status: DomainFirmwareStatus) -> FirmwareStatus {
    match status {
        DomainFirmwareStatus::Downloaded => FirmwareStatus::Downloaded,
        DomainFirmwareStatus::DownloadFailed => FirmwareStatus::DownloadFailed,
        DomainFirmwareStatus::Downloading => FirmwareStatus::Downloading,
        DomainFirmwareStatus::Idle => FirmwareStatus::Idle,
        DomainFirmwareStatus::InstallationFailed => FirmwareStatus::InstallationFailed,
        DomainFirmwareStatus::Installing => FirmwareStatus::Installing,
        DomainFirmwareStatus::Installed => FirmwareStatus::Installed,
    }
}

fn wire_stop_reason(reason: StopReason) -> Reason {
    match reason {
        StopReason::Local => Reason::Local,
        StopReason::Remote => Reason::Remote,
        StopReason::Reboot => Reason::Reboot,
        StopReason::PowerLoss => Reason::PowerLoss,
        StopReason::DeAuthorized => Reason::DeAuthorized,
        StopReason::Other => Reason::Other,
    }
}

fn sampled_value(measurand: SampledMeasurand) -> SampledValue {
    let (value, kind, unit) = match measurand {
        SampledMeasurand::EnergyActiveImportRegister { wh } => (
            wh.to_string(),
            Measurand::EnergyActiveImportRegister,
            UnitOfMeasure::Wh,
        ),
        SampledMeasurand::PowerActiveImport { w } => (
            format!("{w:.1}"),
            Measurand::PowerActiveImport,
            UnitOfMeasure::W,
        ),
        SampledMeasurand::StateOfCharge { percent } => (
            format!("{percent:.0}"),
            Measurand::SoC,
            UnitOfMeasure::Percent,
        ),
    };
    SampledValue {
        value,
        context: None,
        format: None,
        location: None,
        measurand: Some(kind),
        phase: None,
        unit: Some(unit),
    }
}

// ── Outbound requests ──────────────────────────────────────────

pub struct V16RequestService;

impl RequestService for V16RequestService {
    fn version(&self) -> OcppVersion {
        OcppVersion::V16
    }

    fn boot_notification(&self, info: &StationInfo) -> OutboundRequest {
        let request = BootNotificationRequest {
            charge_box_serial_number: info.charge_box_serial_number.clone(),
            charge_point_model: info.charge_point_model.clone(),
            charge_point_serial_number: info.charge_point_serial_number.clone(),
            charge_point_vendor: info.charge_point_vendor.clone(),
            firmware_version: info.firmware_version.clone(),
            iccid: None,
            imsi: None,
            meter_serial_number: info.meter_serial_number.clone(),
            meter_type: info.meter_type.clone(),
        };
        to_payload("BootNotification", &request)
    }

    fn parse_boot_response(&self, payload: &Value) -> Result<BootResponse, EngineError> {
        let status = match payload["status"].as_str() {
            Some("Accepted") => RegistrationStatus::Accepted,
            Some("Pending") => RegistrationStatus::Pending,
            Some("Rejected") => RegistrationStatus::Rejected,
            other => {
                return Err(EngineError::InvalidResponse(format!(
                    "unknown BootNotification status {other:?}"
                )))
            }
        };
        Ok(BootResponse {
            status,
            interval_secs: payload["interval"].as_u64().unwrap_or(0),
            current_time: payload["currentTime"]
                .as_str()
                .and_then(|t| t.parse::<DateTime<Utc>>().ok()),
        })
    }

    fn heartbeat(&self) -> OutboundRequest {
        to_payload("Heartbeat", &HeartbeatRequest {})
    }

    fn status_notification(
        &self,
        connector_id: u32,
        status: ConnectorStatusKind,
    ) -> OutboundRequest {
        let request = StatusNotificationRequest {
            connector_id,
            error_code: ChargePointErrorCode::NoError,
            info: None,
            status: wire_status(status),
            timestamp: Some(Utc::now()),
            vendor_id: None,
            vendor_error_code: None,
        };
        to_payload("StatusNotification", &request)
    }

    fn meter_values(
        &self,
        connector_id: u32,
        transaction_id: Option<i32>,
        sample: &MeterSample,
    ) -> OutboundRequest {
        let request = MeterValuesRequest {
            connector_id,
            transaction_id,
            meter_value: vec![MeterValue {
                timestamp: sample.timestamp,
                sampled_value: sample.values.iter().copied().map(sampled_value).collect(),
            }],
        };
        to_payload("MeterValues", &request)
    }

    fn authorize(&self, id_tag: &str) -> OutboundRequest {
        to_payload(
            "Authorize",
            &AuthorizeRequest {
                id_tag: id_tag.to_string(),
            },
        )
    }

    fn parse_authorize_response(&self, payload: &Value) -> Result<bool, EngineError> {
        let response: AuthorizeResponse = serde_json::from_value(payload.clone())
            .map_err(|e| EngineError::InvalidResponse(e.to_string()))?;
        Ok(response.id_tag_info.status == AuthorizationStatus::Accepted)
    }

    fn start_transaction(
        &self,
        connector_id: u32,
        id_tag: &str,
        meter_start: i64,
        timestamp: DateTime<Utc>,
        reservation_id: Option<i32>,
    ) -> (OutboundRequest, Option<i32>) {
        let request = StartTransactionRequest {
            connector_id,
            id_tag: id_tag.to_string(),
            meter_start: meter_start as i32,
            reservation_id,
            timestamp,
        };
        // in 1.6 the central system assigns the transaction id
        (to_payload("StartTransaction", &request), None)
    }

    fn parse_start_transaction_response(
        &self,
        payload: &Value,
        _allocated_transaction_id: Option<i32>,
    ) -> Result<StartTransactionOutcome, EngineError> {
        let response: StartTransactionResponse = serde_json::from_value(payload.clone())
            .map_err(|e| EngineError::InvalidResponse(e.to_string()))?;
        Ok(StartTransactionOutcome {
            accepted: response.id_tag_info.status == AuthorizationStatus::Accepted,
            transaction_id: response.transaction_id,
        })
    }

    fn stop_transaction(
        &self,
        transaction_id: i32,
        meter_stop: i64,
        timestamp: DateTime<Utc>,
        id_tag: Option<&str>,
        reason: Option<StopReason>,
    ) -> OutboundRequest {
        let request = StopTransactionRequest {
            id_tag: id_tag.map(str::to_string),
            meter_stop: meter_stop as i32,
            timestamp,
            transaction_id,
            reason: reason.map(wire_stop_reason),
            transaction_data: None,
        };
        to_payload("StopTransaction", &request)
    }

    fn firmware_status_notification(&self, status: DomainFirmwareStatus) -> OutboundRequest {
        let request = FirmwareStatusNotificationRequest {
            status: wire_firmware_status(status),
        };
        to_payload("FirmwareStatusNotification", &request)
    }
}

// ── Incoming requests ──────────────────────────────────────────

pub struct V16IncomingRequestService;

#[async_trait]
impl IncomingRequestService for V16IncomingRequestService {
    async fn handle(
        &self,
        ctx: &Arc<StationContext>,
        action: &str,
        payload: Value,
    ) -> Result<Value, OcppCallError> {
        match action {
            "Reset" => handle_reset(ctx, payload),
            "GetConfiguration" => handle_get_configuration(ctx, payload),
            "ChangeConfiguration" => handle_change_configuration(ctx, payload).await,
            "ChangeAvailability" => handle_change_availability(ctx, payload).await,
            "RemoteStartTransaction" => handle_remote_start(ctx, payload),
            "RemoteStopTransaction" => handle_remote_stop(ctx, payload),
            "ReserveNow" => handle_reserve_now(ctx, payload).await,
            "CancelReservation" => handle_cancel_reservation(ctx, payload).await,
            "SetChargingProfile" => handle_set_charging_profile(ctx, payload),
            "ClearChargingProfile" => handle_clear_charging_profile(ctx, payload),
            "TriggerMessage" => handle_trigger_message(ctx, payload),
            "UnlockConnector" => handle_unlock_connector(ctx, payload),
            "ClearCache" => Ok(respond(&ClearCacheResponse {
                status: ClearCacheStatus::Accepted,
            })),
            "DataTransfer" => handle_data_transfer(ctx, payload),
            "GetDiagnostics" | "UpdateFirmware" | "SendLocalList" | "GetLocalListVersion"
            | "GetCompositeSchedule" => Err(OcppCallError::not_supported(action)),
            _ => Err(OcppCallError::not_implemented(action)),
        }
    }
}

fn respond<T: serde::Serialize>(response: &T) -> Value {
    serde_json::to_value(response).unwrap_or_default()
}

fn handle_reset(ctx: &Arc<StationContext>, payload: Value) -> Result<Value, OcppCallError> {
    let request: ResetRequest = serde_json::from_value(payload)?;
    let kind = match request.kind {
        ResetRequestStatus::Hard => ResetKind::Hard,
        ResetRequestStatus::Soft => ResetKind::Soft,
    };
    info!(
        station_id = ctx.station_id().as_str(),
        kind = ?kind,
        "Reset requested by the central system"
    );
    ctx.send_runtime_command(RuntimeCommand::Reset(kind));
    Ok(respond(&ResetResponse {
        status: ResetResponseStatus::Accepted,
    }))
}

fn handle_get_configuration(
    ctx: &Arc<StationContext>,
    payload: Value,
) -> Result<Value, OcppCallError> {
    let request: GetConfigurationRequest = serde_json::from_value(payload)?;
    let configuration = ctx.configuration.lock().unwrap();
    let (keys, unknown) = configuration.visible_keys(request.key.as_deref());
    let configuration_key = keys
        .into_iter()
        .map(|key| KeyValue {
            key: key.key.clone(),
            readonly: key.readonly,
            value: Some(key.value.clone()),
        })
        .collect();
    Ok(respond(&GetConfigurationResponse {
        configuration_key: Some(configuration_key),
        unknown_key: if unknown.is_empty() {
            None
        } else {
            Some(unknown)
        },
    }))
}

async fn handle_change_configuration(
    ctx: &Arc<StationContext>,
    payload: Value,
) -> Result<Value, OcppCallError> {
    let request: ChangeConfigurationRequest = serde_json::from_value(payload)?;
    let outcome = ctx
        .configuration
        .lock()
        .unwrap()
        .set_value(&request.key, request.value.clone());
    let status = match outcome {
        SetValueOutcome::Changed => ConfigurationStatus::Accepted,
        SetValueOutcome::RebootRequired => ConfigurationStatus::RebootRequired,
        SetValueOutcome::Readonly => ConfigurationStatus::Rejected,
        SetValueOutcome::NotFound => ConfigurationStatus::NotSupported,
    };

    if status == ConfigurationStatus::Accepted || status == ConfigurationStatus::RebootRequired {
        match request.key.as_str() {
            "HeartbeatInterval" | "HeartBeatInterval" => {
                ctx.send_runtime_command(RuntimeCommand::RestartHeartbeat)
            }
            "WebSocketPingInterval" => {
                ctx.send_runtime_command(RuntimeCommand::RestartWebSocketPing)
            }
            _ => {}
        }
        ctx.events.publish(StationEvent::Updated {
            station_id: ctx.station_id(),
        });
        ctx.save_configuration().await;
    }
    Ok(respond(&ChangeConfigurationResponse { status }))
}

async fn handle_change_availability(
    ctx: &Arc<StationContext>,
    payload: Value,
) -> Result<Value, OcppCallError> {
    let request: ChangeAvailabilityRequest = serde_json::from_value(payload)?;
    let availability = match request.kind {
        AvailabilityType::Operative => AvailabilityKind::Operative,
        AvailabilityType::Inoperative => AvailabilityKind::Inoperative,
    };

    let connector_ids: Vec<u32> = {
        let connectors = ctx.connectors.lock().unwrap();
        if request.connector_id == 0 {
            connectors.connector_ids()
        } else if connectors.connector(request.connector_id).is_some() {
            vec![request.connector_id]
        } else {
            return Ok(respond(&ChangeAvailabilityResponse {
                status: AvailabilityStatus::Rejected,
            }));
        }
    };

    let mut scheduled = false;
    for connector_id in connector_ids {
        let has_transaction = {
            let mut connectors = ctx.connectors.lock().unwrap();
            let Some(connector) = connectors.connector_mut(connector_id) else {
                continue;
            };
            connector.availability = availability;
            connector.has_transaction()
        };
        if has_transaction && availability == AvailabilityKind::Inoperative {
            // state change applies once the transaction finishes
            scheduled = true;
            continue;
        }
        if connector_id > 0 {
            let status = match availability {
                AvailabilityKind::Operative => ConnectorStatusKind::Available,
                AvailabilityKind::Inoperative => ConnectorStatusKind::Unavailable,
            };
            operations::send_status_notification(ctx, connector_id, status).await;
        }
    }
    Ok(respond(&ChangeAvailabilityResponse {
        status: if scheduled {
            AvailabilityStatus::Scheduled
        } else {
            AvailabilityStatus::Accepted
        },
    }))
}

fn handle_remote_start(ctx: &Arc<StationContext>, payload: Value) -> Result<Value, OcppCallError> {
    let id_tag = payload["idTag"]
        .as_str()
        .ok_or_else(|| OcppCallError::formation_violation("idTag is required"))?
        .to_string();
    let connector_id = match payload["connectorId"].as_u64() {
        Some(id) => id as u32,
        None => {
            // pick the first free connector
            let connectors = ctx.connectors.lock().unwrap();
            match connectors.connector_ids().into_iter().find(|id| {
                *id > 0
                    && connectors
                        .connector(*id)
                        .map(|c| {
                            !c.has_transaction()
                                && c.availability == AvailabilityKind::Operative
                        })
                        .unwrap_or(false)
            }) {
                Some(id) => id,
                None => {
                    return Ok(respond(&RemoteStartTransactionResponse {
                        status: RemoteStartStopStatus::Rejected,
                    }))
                }
            }
        }
    };

    let startable = {
        let connectors = ctx.connectors.lock().unwrap();
        connectors
            .connector(connector_id)
            .map(|c| !c.has_transaction() && c.availability == AvailabilityKind::Operative)
            .unwrap_or(false)
    };
    if !startable {
        return Ok(respond(&RemoteStartTransactionResponse {
            status: RemoteStartStopStatus::Rejected,
        }));
    }

    // Install the optional TxProfile before the transaction begins.
    if let Some(profile_value) = payload.get("chargingProfile") {
        match serde_json::from_value::<ChargingProfile>(profile_value.clone()) {
            Ok(mut profile) if profile.charging_profile_purpose == ChargingProfilePurpose::TxProfile => {
                if profile.charging_schedule.normalize() {
                    let mut connectors = ctx.connectors.lock().unwrap();
                    if let Some(connector) = connectors.connector_mut(connector_id) {
                        connector.set_charging_profile(profile);
                    }
                } else {
                    warn!(
                        station_id = ctx.station_id().as_str(),
                        connector_id, "Ignoring malformed remote-start charging profile"
                    );
                }
            }
            Ok(_) => {
                return Ok(respond(&RemoteStartTransactionResponse {
                    status: RemoteStartStopStatus::Rejected,
                }))
            }
            Err(e) => return Err(e.into()),
        }
    }

    let task_ctx = ctx.clone();
    tokio::spawn(async move {
        if let Err(e) = operations::start_transaction(&task_ctx, connector_id, &id_tag, true).await
        {
            warn!(
                station_id = task_ctx.station_id().as_str(),
                connector_id,
                error = %e,
                "Remote-started transaction failed"
            );
        }
    });
    Ok(respond(&RemoteStartTransactionResponse {
        status: RemoteStartStopStatus::Accepted,
    }))
}

fn handle_remote_stop(ctx: &Arc<StationContext>, payload: Value) -> Result<Value, OcppCallError> {
    let request: RemoteStopTransactionRequest = serde_json::from_value(payload)?;
    let connector_id = {
        let connectors = ctx.connectors.lock().unwrap();
        connectors.connector_id_for_transaction(request.transaction_id)
    };
    match connector_id {
        Some(connector_id) => {
            let task_ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = operations::stop_transaction(
                    &task_ctx,
                    connector_id,
                    Some(StopReason::Remote),
                )
                .await
                {
                    warn!(
                        station_id = task_ctx.station_id().as_str(),
                        connector_id,
                        error = %e,
                        "Remote-stopped transaction failed"
                    );
                }
            });
            Ok(respond(&RemoteStopTransactionResponse {
                status: RemoteStartStopStatus::Accepted,
            }))
        }
        None => Ok(respond(&RemoteStopTransactionResponse {
            status: RemoteStartStopStatus::Rejected,
        })),
    }
}

async fn handle_reserve_now(
    ctx: &Arc<StationContext>,
    payload: Value,
) -> Result<Value, OcppCallError> {
    let request: ReserveNowRequest = serde_json::from_value(payload)?;

    let status = {
        let connectors = ctx.connectors.lock().unwrap();
        match connectors.connector(request.connector_id) {
            None => Some(ReservationStatus::Unavailable),
            Some(connector) if connector.availability == AvailabilityKind::Inoperative => {
                Some(ReservationStatus::Unavailable)
            }
            Some(connector) if connector.status == Some(ConnectorStatusKind::Faulted) => {
                Some(ReservationStatus::Faulted)
            }
            Some(connector) if connector.has_transaction() => Some(ReservationStatus::Occupied),
            Some(_) => None,
        }
    };
    if let Some(status) = status {
        return Ok(respond(&ReserveNowResponse { status }));
    }

    let replacing_own = reservations::find_reservation(ctx, request.reservation_id)
        .map(|(connector_id, _)| connector_id == request.connector_id)
        .unwrap_or(false);
    if !replacing_own
        && !reservations::is_connector_reservable(
            ctx,
            request.reservation_id,
            Some(&request.id_tag),
            Some(request.connector_id),
        )
    {
        return Ok(respond(&ReserveNowResponse {
            status: ReservationStatus::Occupied,
        }));
    }

    reservations::add_reservation(
        ctx,
        Reservation {
            reservation_id: request.reservation_id,
            connector_id: request.connector_id,
            id_tag: request.id_tag,
            expiry_date: request.expiry_date,
            parent_id_tag: request.parent_id_tag,
        },
    )
    .await;
    Ok(respond(&ReserveNowResponse {
        status: ReservationStatus::Accepted,
    }))
}

async fn handle_cancel_reservation(
    ctx: &Arc<StationContext>,
    payload: Value,
) -> Result<Value, OcppCallError> {
    let request: CancelReservationRequest = serde_json::from_value(payload)?;
    let cancelled = reservations::cancel_reservation(
        ctx,
        request.reservation_id,
        ReservationTerminationReason::ReservationCanceled,
    )
    .await;
    Ok(respond(&CancelReservationResponse {
        status: if cancelled {
            CancelReservationStatus::Accepted
        } else {
            CancelReservationStatus::Rejected
        },
    }))
}

fn handle_set_charging_profile(
    ctx: &Arc<StationContext>,
    payload: Value,
) -> Result<Value, OcppCallError> {
    let connector_id = payload["connectorId"]
        .as_u64()
        .ok_or_else(|| OcppCallError::formation_violation("connectorId is required"))?
        as u32;
    let mut profile: ChargingProfile =
        serde_json::from_value(payload["csChargingProfiles"].clone())?;

    if !profile.charging_schedule.normalize() {
        warn!(
            station_id = ctx.station_id().as_str(),
            connector_id,
            charging_profile_id = profile.charging_profile_id,
            "Rejecting charging profile with unusable schedule periods"
        );
        return Ok(respond(&SetChargingProfileResponse {
            status: ChargingProfileStatus::Rejected,
        }));
    }

    let mut connectors = ctx.connectors.lock().unwrap();
    let Some(connector) = connectors.connector_mut(connector_id) else {
        return Ok(respond(&SetChargingProfileResponse {
            status: ChargingProfileStatus::Rejected,
        }));
    };
    // TxProfile only applies to a running transaction on a real connector
    if profile.charging_profile_purpose == ChargingProfilePurpose::TxProfile
        && (connector_id == 0 || !connector.has_transaction())
    {
        return Ok(respond(&SetChargingProfileResponse {
            status: ChargingProfileStatus::Rejected,
        }));
    }
    connector.set_charging_profile(profile);
    Ok(respond(&SetChargingProfileResponse {
        status: ChargingProfileStatus::Accepted,
    }))
}

fn handle_clear_charging_profile(
    ctx: &Arc<StationContext>,
    payload: Value,
) -> Result<Value, OcppCallError> {
    let profile_id = payload["id"].as_i64().map(|id| id as i32);
    let connector_filter = payload["connectorId"].as_u64().map(|id| id as u32);
    let stack_level = payload["stackLevel"].as_u64().map(|level| level as u32);
    let purpose = payload["chargingProfilePurpose"].as_str().map(str::to_string);

    let mut cleared = false;
    let mut connectors = ctx.connectors.lock().unwrap();
    for connector_id in connectors.connector_ids() {
        if connector_filter.is_some_and(|filter| filter != connector_id) {
            continue;
        }
        let Some(connector) = connectors.connector_mut(connector_id) else {
            continue;
        };
        let before = connector.charging_profiles.len();
        connector.charging_profiles.retain(|profile| {
            let matches = profile_id
                .map_or(true, |id| profile.charging_profile_id == id)
                && stack_level.map_or(true, |level| profile.stack_level == level)
                && purpose.as_deref().map_or(true, |p| {
                    serde_json::to_value(profile.charging_profile_purpose)
                        .ok()
                        .and_then(|v| v.as_str().map(|s| s == p))
                        .unwrap_or(false)
                });
            !matches
        });
        cleared |= connector.charging_profiles.len() != before;
    }
    Ok(respond(&ClearChargingProfileResponse {
        status: if cleared {
            ClearChargingProfileStatus::Accepted
        } else {
            ClearChargingProfileStatus::Unknown
        },
    }))
}

fn handle_trigger_message(
    ctx: &Arc<StationContext>,
    payload: Value,
) -> Result<Value, OcppCallError> {
    let request: TriggerMessageRequest = serde_json::from_value(payload)?;
    let trigger = request.requested_message;

    if trigger == MessageTrigger::DiagnosticsStatusNotification {
        return Ok(respond(&TriggerMessageResponse {
            status: TriggerMessageStatus::NotImplemented,
        }));
    }

    let task_ctx = ctx.clone();
    let connector_id = request.connector_id;
    tokio::spawn(async move {
        match trigger {
            MessageTrigger::BootNotification => {
                let request = {
                    let info = task_ctx.info.read().unwrap();
                    task_ctx.request.boot_notification(&info)
                };
                let _ = task_ctx
                    .engine
                    .call(request.action, request.payload, CallOptions::default())
                    .await;
            }
            MessageTrigger::Heartbeat => {
                let request = task_ctx.request.heartbeat();
                let _ = task_ctx
                    .engine
                    .call(request.action, request.payload, CallOptions::default())
                    .await;
            }
            MessageTrigger::StatusNotification => {
                let connector_ids: Vec<u32> = match connector_id {
                    Some(id) => vec![id],
                    None => task_ctx.connectors.lock().unwrap().connector_ids(),
                };
                for connector_id in connector_ids {
                    let status = {
                        let connectors = task_ctx.connectors.lock().unwrap();
                        connectors.connector(connector_id).and_then(|c| c.status)
                    };
                    if let Some(status) = status {
                        operations::send_status_notification(&task_ctx, connector_id, status)
                            .await;
                    }
                }
            }
            MessageTrigger::MeterValues => {
                // only meaningful for connectors with a transaction; the
                // sampling task reports on its own period, so just log
                info!(
                    station_id = task_ctx.station_id().as_str(),
                    connector_id = ?connector_id,
                    "MeterValues trigger acknowledged"
                );
            }
            MessageTrigger::FirmwareStatusNotification => {
                let status = task_ctx.info.read().unwrap().firmware_status;
                let request = task_ctx.request.firmware_status_notification(status);
                let _ = task_ctx
                    .engine
                    .call(request.action, request.payload, CallOptions::default())
                    .await;
            }
            MessageTrigger::DiagnosticsStatusNotification => {}
        }
    });
    Ok(respond(&TriggerMessageResponse {
        status: TriggerMessageStatus::Accepted,
    }))
}

fn handle_unlock_connector(
    ctx: &Arc<StationContext>,
    payload: Value,
) -> Result<Value, OcppCallError> {
    let request: UnlockConnectorRequest = serde_json::from_value(payload)?;
    let exists = {
        let connectors = ctx.connectors.lock().unwrap();
        request.connector_id > 0 && connectors.connector(request.connector_id).is_some()
    };
    if !exists {
        return Ok(respond(&UnlockConnectorResponse {
            status: UnlockStatus::NotSupported,
        }));
    }
    let task_ctx = ctx.clone();
    let connector_id = request.connector_id;
    tokio::spawn(async move {
        let _ = operations::stop_transaction(
            &task_ctx,
            connector_id,
            Some(StopReason::Other),
        )
        .await;
    });
    Ok(respond(&UnlockConnectorResponse {
        status: UnlockStatus::Unlocked,
    }))
}

fn handle_data_transfer(
    ctx: &Arc<StationContext>,
    payload: Value,
) -> Result<Value, OcppCallError> {
    let request: DataTransferRequest = serde_json::from_value(payload)?;
    info!(
        station_id = ctx.station_id().as_str(),
        vendor_id = request.vendor_string.as_str(),
        message_id = ?request.message_id,
        "DataTransfer received"
    );
    Ok(respond(&DataTransferResponse {
        status: DataTransferStatus::UnknownVendorId,
        data: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::testing;

    fn service() -> V16IncomingRequestService {
        V16IncomingRequestService
    }

    #[tokio::test]
    async fn unknown_action_is_not_implemented() {
        let (ctx, _observed) = testing::context_with_responder();
        let err = service()
            .handle(&ctx, "FluxCapacitor", serde_json::json!({}))
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::support::frame::ErrorCode::NotImplemented);
    }

    #[tokio::test]
    async fn get_configuration_excludes_hidden_keys() {
        let (ctx, _observed) = testing::context_with_responder();
        {
            let mut configuration = ctx.configuration.lock().unwrap();
            configuration.add(
                crate::domain::ConfigurationKey {
                    key: "AuthorizationKey".into(),
                    value: "secret".into(),
                    readonly: false,
                    visible: false,
                    reboot: false,
                },
                true,
            );
        }
        let response = service()
            .handle(&ctx, "GetConfiguration", serde_json::json!({}))
            .await
            .unwrap();
        let keys = response["configurationKey"].as_array().unwrap();
        assert!(keys.iter().all(|k| k["key"] != "AuthorizationKey"));

        let response = service()
            .handle(
                &ctx,
                "GetConfiguration",
                serde_json::json!({"key": ["AuthorizationKey", "Missing"]}),
            )
            .await
            .unwrap();
        let unknown = response["unknownKey"].as_array().unwrap();
        assert_eq!(unknown.len(), 2);
    }

    #[tokio::test]
    async fn change_configuration_respects_flags() {
        let (ctx, _observed) = testing::context_with_responder();
        {
            let mut configuration = ctx.configuration.lock().unwrap();
            configuration.add(
                crate::domain::ConfigurationKey {
                    key: "ReadonlyKey".into(),
                    value: "1".into(),
                    readonly: true,
                    visible: true,
                    reboot: false,
                },
                true,
            );
            configuration.add(
                crate::domain::ConfigurationKey {
                    key: "RebootKey".into(),
                    value: "1".into(),
                    readonly: false,
                    visible: true,
                    reboot: true,
                },
                true,
            );
        }

        let response = service()
            .handle(
                &ctx,
                "ChangeConfiguration",
                serde_json::json!({"key": "ReadonlyKey", "value": "2"}),
            )
            .await
            .unwrap();
        assert_eq!(response["status"], "Rejected");

        let response = service()
            .handle(
                &ctx,
                "ChangeConfiguration",
                serde_json::json!({"key": "RebootKey", "value": "2"}),
            )
            .await
            .unwrap();
        assert_eq!(response["status"], "RebootRequired");

        let response = service()
            .handle(
                &ctx,
                "ChangeConfiguration",
                serde_json::json!({"key": "NoSuchKey", "value": "2"}),
            )
            .await
            .unwrap();
        assert_eq!(response["status"], "NotSupported");
    }

    #[tokio::test]
    async fn reserve_now_accepts_a_free_connector() {
        let (ctx, _observed) = testing::context_with_responder();
        let response = service()
            .handle(
                &ctx,
                "ReserveNow",
                serde_json::json!({
                    "connectorId": 1,
                    "expiryDate": (Utc::now() + chrono::Duration::minutes(30)).to_rfc3339(),
                    "idTag": "TAG-1",
                    "reservationId": 42
                }),
            )
            .await
            .unwrap();
        assert_eq!(response["status"], "Accepted");
        assert!(reservations::find_reservation(&ctx, 42).is_some());
    }

    #[tokio::test]
    async fn reserve_now_on_occupied_connector_is_occupied() {
        let (ctx, _observed) = testing::context_with_responder();
        {
            let mut connectors = ctx.connectors.lock().unwrap();
            connectors
                .connector_mut(1)
                .unwrap()
                .start_transaction(5, "TAG-0", 0, Utc::now());
        }
        let response = service()
            .handle(
                &ctx,
                "ReserveNow",
                serde_json::json!({
                    "connectorId": 1,
                    "expiryDate": (Utc::now() + chrono::Duration::minutes(30)).to_rfc3339(),
                    "idTag": "TAG-1",
                    "reservationId": 43
                }),
            )
            .await
            .unwrap();
        assert_eq!(response["status"], "Occupied");
    }

    #[tokio::test]
    async fn set_charging_profile_normalizes_and_stores() {
        let (ctx, _observed) = testing::context_with_responder();
        let response = service()
            .handle(
                &ctx,
                "SetChargingProfile",
                serde_json::json!({
                    "connectorId": 1,
                    "csChargingProfiles": {
                        "chargingProfileId": 9,
                        "stackLevel": 1,
                        "chargingProfilePurpose": "TxDefaultProfile",
                        "chargingProfileKind": "Absolute",
                        "chargingSchedule": {
                            "chargingRateUnit": "A",
                            "chargingSchedulePeriod": [
                                {"startPeriod": 600, "limit": 8.0},
                                {"startPeriod": 0, "limit": 16.0}
                            ]
                        }
                    }
                }),
            )
            .await
            .unwrap();
        assert_eq!(response["status"], "Accepted");

        let connectors = ctx.connectors.lock().unwrap();
        let profiles = &connectors.connector(1).unwrap().charging_profiles;
        assert_eq!(profiles.len(), 1);
        let offsets: Vec<i64> = profiles[0]
            .charging_schedule
            .charging_schedule_period
            .iter()
            .map(|p| p.start_period)
            .collect();
        assert_eq!(offsets, vec![0, 600]);
    }

    #[tokio::test]
    async fn tx_profile_without_transaction_is_rejected() {
        let (ctx, _observed) = testing::context_with_responder();
        let response = service()
            .handle(
                &ctx,
                "SetChargingProfile",
                serde_json::json!({
                    "connectorId": 1,
                    "csChargingProfiles": {
                        "chargingProfileId": 9,
                        "stackLevel": 1,
                        "chargingProfilePurpose": "TxProfile",
                        "chargingProfileKind": "Absolute",
                        "chargingSchedule": {
                            "chargingRateUnit": "W",
                            "chargingSchedulePeriod": [{"startPeriod": 0, "limit": 11000.0}]
                        }
                    }
                }),
            )
            .await
            .unwrap();
        assert_eq!(response["status"], "Rejected");
    }

    #[tokio::test]
    async fn clear_charging_profile_by_id() {
        let (ctx, _observed) = testing::context_with_responder();
        service()
            .handle(
                &ctx,
                "SetChargingProfile",
                serde_json::json!({
                    "connectorId": 1,
                    "csChargingProfiles": {
                        "chargingProfileId": 9,
                        "stackLevel": 1,
                        "chargingProfilePurpose": "TxDefaultProfile",
                        "chargingProfileKind": "Absolute",
                        "chargingSchedule": {
                            "chargingRateUnit": "W",
                            "chargingSchedulePeriod": [{"startPeriod": 0, "limit": 11000.0}]
                        }
                    }
                }),
            )
            .await
            .unwrap();

        let response = service()
            .handle(&ctx, "ClearChargingProfile", serde_json::json!({"id": 9}))
            .await
            .unwrap();
        assert_eq!(response["status"], "Accepted");

        let response = service()
            .handle(&ctx, "ClearChargingProfile", serde_json::json!({"id": 9}))
            .await
            .unwrap();
        assert_eq!(response["status"], "Unknown");
    }

    #[tokio::test]
    async fn remote_stop_for_unknown_transaction_is_rejected() {
        let (ctx, _observed) = testing::context_with_responder();
        let response = service()
            .handle(
                &ctx,
                "RemoteStopTransaction",
                serde_json::json!({"transactionId": 99}),
            )
            .await
            .unwrap();
        assert_eq!(response["status"], "Rejected");
    }

    #[tokio::test]
    async fn data_transfer_reports_unknown_vendor() {
        let (ctx, _observed) = testing::context_with_responder();
        let response = service()
            .handle(
                &ctx,
                "DataTransfer",
                serde_json::json!({"vendorId": "com.example"}),
            )
            .await
            .unwrap();
        assert_eq!(response["status"], "UnknownVendorId");
    }

    #[test]
    fn boot_response_parsing() {
        let service = V16RequestService;
        let response = service
            .parse_boot_response(&serde_json::json!({
                "status": "Accepted",
                "currentTime": "2024-01-01T00:00:00Z",
                "interval": 60
            }))
            .unwrap();
        assert_eq!(response.status, RegistrationStatus::Accepted);
        assert_eq!(response.interval_secs, 60);
        assert!(response.current_time.is_some());

        assert!(service
            .parse_boot_response(&serde_json::json!({"status": "Bogus"}))
            .is_err());
    }

    #[test]
    fn meter_values_carry_the_configured_sample() {
        let service = V16RequestService;
        let request = service.meter_values(
            1,
            Some(7),
            &MeterSample {
                timestamp: Utc::now(),
                values: vec![
                    SampledMeasurand::EnergyActiveImportRegister { wh: 1234 },
                    SampledMeasurand::PowerActiveImport { w: 7360.0 },
                ],
            },
        );
        assert_eq!(request.action, "MeterValues");
        assert_eq!(request.payload["connectorId"], 1);
        assert_eq!(request.payload["transactionId"], 7);
        let sampled = &request.payload["meterValue"][0]["sampledValue"];
        assert_eq!(sampled[0]["value"], "1234");
        assert_eq!(sampled[0]["measurand"], "Energy.Active.Import.Register");
        assert_eq!(sampled[1]["unit"], "W");
    }
}
