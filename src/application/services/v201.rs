//! OCPP 2.0.1 request/response services
//!
//! Covers the simulator's 2.0.1 surface: BootNotification, Heartbeat,
//! StatusNotification, TransactionEvent and MeterValues outbound, plus
//! Reset, ChangeAvailability, variable access and remote start/stop
//! inbound. TransactionEvent and the variable-access responses are built
//! as raw JSON; the 2.0.1 transaction id is the station's own sequence
//! rendered as a string.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_ocpp::v2_0_1::datatypes::charging_station_type::ChargingStationType;
use rust_ocpp::v2_0_1::enumerations::boot_reason_enum_type::BootReasonEnumType;
use rust_ocpp::v2_0_1::enumerations::connector_status_enum_type::ConnectorStatusEnumType;
use rust_ocpp::v2_0_1::enumerations::operational_status_enum_type::OperationalStatusEnumType;
use rust_ocpp::v2_0_1::enumerations::reset_enum_type::ResetEnumType;
use rust_ocpp::v2_0_1::messages::boot_notification::BootNotificationRequest;
use rust_ocpp::v2_0_1::messages::change_availability::ChangeAvailabilityRequest;
use rust_ocpp::v2_0_1::messages::heartbeat::HeartbeatRequest;
use rust_ocpp::v2_0_1::messages::reset::ResetRequest;
use rust_ocpp::v2_0_1::messages::status_notification::StatusNotificationRequest;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::application::operations;
use crate::domain::connector::{AvailabilityKind, ConnectorStatusKind};
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

fn wire_connector_status(status: ConnectorStatusKind) -> ConnectorStatusEnumType {
    match status {
        ConnectorStatusKind::Available => ConnectorStatusEnumType::Available,
        ConnectorStatusKind::Preparing
        | ConnectorStatusKind::Charging
        | ConnectorStatusKind::SuspendedEV
        | ConnectorStatusKind::SuspendedEVSE
        | ConnectorStatusKind::Finishing => ConnectorStatusEnumType::Occupied,
        ConnectorStatusKind::Reserved => ConnectorStatusEnumType::Reserved,
        ConnectorStatusKind::Unavailable => ConnectorStatusEnumType::Unavailable,
        ConnectorStatusKind::Faulted => ConnectorStatusEnumType::Faulted,
    }
}

fn sampled_value_json(measurand: SampledMeasurand) -> Value {
    match measurand {
        SampledMeasurand::EnergyActiveImportRegister { wh } => json!({
            "value": wh as f64,
            "measurand": "Energy.Active.Import.Register",
            "unitOfMeasure": {"unit": "Wh"}
        }),
        SampledMeasurand::PowerActiveImport { w } => json!({
            "value": w,
            "measurand": "Power.Active.Import",
            "unitOfMeasure": {"unit": "W"}
        }),
        SampledMeasurand::StateOfCharge { percent } => json!({
            "value": percent,
            "measurand": "SoC",
            "unitOfMeasure": {"unit": "Percent"}
        }),
    }
}

// ── Outbound requests ──────────────────────────────────────────

pub struct V201RequestService {
    transaction_seq: AtomicI32,
    event_seq: AtomicI32,
}

impl Default for V201RequestService {
    fn default() -> Self {
        Self {
            transaction_seq: AtomicI32::new(1),
            event_seq: AtomicI32::new(0),
        }
    }
}

impl V201RequestService {
    fn transaction_event(
        &self,
        event_type: &str,
        trigger_reason: &str,
        transaction_id: i32,
        connector_id: u32,
        id_tag: Option<&str>,
        meter_value: Option<Value>,
        timestamp: DateTime<Utc>,
    ) -> OutboundRequest {
        let mut payload = json!({
            "eventType": event_type,
            "timestamp": timestamp.to_rfc3339(),
            "triggerReason": trigger_reason,
            "seqNo": self.event_seq.fetch_add(1, Ordering::SeqCst),
            "transactionInfo": {"transactionId": transaction_id.to_string()},
            "evse": {"id": connector_id as i64, "connectorId": 1}
        });
        if let Some(id_tag) = id_tag {
            payload["idToken"] = json!({"idToken": id_tag, "type": "ISO14443"});
        }
        if let Some(meter_value) = meter_value {
            payload["meterValue"] = meter_value;
        }
        OutboundRequest {
            action: "TransactionEvent",
            payload,
        }
    }
}

impl RequestService for V201RequestService {
    fn version(&self) -> OcppVersion {
        OcppVersion::V201
    }

    fn boot_notification(&self, info: &StationInfo) -> OutboundRequest {
        let request = BootNotificationRequest {
            charging_station: ChargingStationType {
                serial_number: info.charge_point_serial_number.clone(),
                model: info.charge_point_model.clone(),
                vendor_name: info.charge_point_vendor.clone(),
                firmware_version: info.firmware_version.clone(),
                modem: None,
            },
            reason: BootReasonEnumType::PowerUp,
        };
        OutboundRequest {
            action: "BootNotification",
            payload: serde_json::to_value(&request).unwrap_or_default(),
        }
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
        OutboundRequest {
            action: "Heartbeat",
            payload: serde_json::to_value(HeartbeatRequest {}).unwrap_or_default(),
        }
    }

    fn status_notification(
        &self,
        connector_id: u32,
        status: ConnectorStatusKind,
    ) -> OutboundRequest {
        // the station's flat connector ids map onto one-connector EVSEs
        let request = StatusNotificationRequest {
            timestamp: Utc::now(),
            connector_status: wire_connector_status(status),
            evse_id: connector_id as i32,
            connector_id: 1,
        };
        OutboundRequest {
            action: "StatusNotification",
            payload: serde_json::to_value(&request).unwrap_or_default(),
        }
    }

    fn meter_values(
        &self,
        connector_id: u32,
        transaction_id: Option<i32>,
        sample: &MeterSample,
    ) -> OutboundRequest {
        match transaction_id {
            Some(transaction_id) => self.transaction_event(
                "Updated",
                "MeterValuePeriodic",
                transaction_id,
                connector_id,
                None,
                Some(json!([{
                    "timestamp": sample.timestamp.to_rfc3339(),
                    "sampledValue": sample
                        .values
                        .iter()
                        .copied()
                        .map(sampled_value_json)
                        .collect::<Vec<_>>()
                }])),
                sample.timestamp,
            ),
            None => OutboundRequest {
                action: "MeterValues",
                payload: json!({
                    "evseId": connector_id as i64,
                    "meterValue": [{
                        "timestamp": sample.timestamp.to_rfc3339(),
                        "sampledValue": sample
                            .values
                            .iter()
                            .copied()
                            .map(sampled_value_json)
                            .collect::<Vec<_>>()
                    }]
                }),
            },
        }
    }

    fn authorize(&self, id_tag: &str) -> OutboundRequest {
        OutboundRequest {
            action: "Authorize",
            payload: json!({"idToken": {"idToken": id_tag, "type": "ISO14443"}}),
        }
    }

    fn parse_authorize_response(&self, payload: &Value) -> Result<bool, EngineError> {
        match payload["idTokenInfo"]["status"].as_str() {
            Some(status) => Ok(status == "Accepted"),
            None => Err(EngineError::InvalidResponse(
                "missing idTokenInfo.status".to_string(),
            )),
        }
    }

    fn start_transaction(
        &self,
        connector_id: u32,
        id_tag: &str,
        _meter_start: i64,
        timestamp: DateTime<Utc>,
        _reservation_id: Option<i32>,
    ) -> (OutboundRequest, Option<i32>) {
        // 2.0.1 stations own the transaction id; it travels with the call
        // so concurrent starts on other connectors cannot reuse it
        let transaction_id = self.transaction_seq.fetch_add(1, Ordering::SeqCst);
        let request = self.transaction_event(
            "Started",
            "Authorized",
            transaction_id,
            connector_id,
            Some(id_tag),
            None,
            timestamp,
        );
        (request, Some(transaction_id))
    }

    fn parse_start_transaction_response(
        &self,
        payload: &Value,
        allocated_transaction_id: Option<i32>,
    ) -> Result<StartTransactionOutcome, EngineError> {
        let Some(transaction_id) = allocated_transaction_id else {
            return Err(EngineError::InvalidResponse(
                "missing station-allocated transaction id".to_string(),
            ));
        };
        let accepted = payload["idTokenInfo"]["status"]
            .as_str()
            .map(|status| status == "Accepted")
            // TransactionEvent responses without idTokenInfo imply acceptance
            .unwrap_or(true);
        Ok(StartTransactionOutcome {
            accepted,
            transaction_id,
        })
    }

    fn stop_transaction(
        &self,
        transaction_id: i32,
        meter_stop: i64,
        timestamp: DateTime<Utc>,
        id_tag: Option<&str>,
        _reason: Option<StopReason>,
    ) -> OutboundRequest {
        self.transaction_event(
            "Ended",
            "StopAuthorized",
            transaction_id,
            0,
            id_tag,
            Some(json!([{
                "timestamp": timestamp.to_rfc3339(),
                "sampledValue": [sampled_value_json(
                    SampledMeasurand::EnergyActiveImportRegister { wh: meter_stop }
                )]
            }])),
            timestamp,
        )
    }

    fn firmware_status_notification(&self, status: DomainFirmwareStatus) -> OutboundRequest {
        let status = match status {
            DomainFirmwareStatus::Downloaded => "Downloaded",
            DomainFirmwareStatus::DownloadFailed => "DownloadFailed",
            DomainFirmwareStatus::Downloading => "Downloading",
            DomainFirmwareStatus::Idle => "Idle",
            DomainFirmwareStatus::InstallationFailed => "InstallationFailed",
            DomainFirmwareStatus::Installing => "Installing",
            DomainFirmwareStatus::Installed => "Installed",
        };
        OutboundRequest {
            action: "FirmwareStatusNotification",
            payload: json!({"status": status}),
        }
    }
}

// ── Incoming requests ──────────────────────────────────────────

pub struct V201IncomingRequestService;

#[async_trait]
impl IncomingRequestService for V201IncomingRequestService {
    async fn handle(
        &self,
        ctx: &Arc<StationContext>,
        action: &str,
        payload: Value,
    ) -> Result<Value, OcppCallError> {
        match action {
            "Reset" => handle_reset(ctx, payload),
            "ChangeAvailability" => handle_change_availability(ctx, payload).await,
            "GetVariables" => handle_get_variables(ctx, payload),
            "SetVariables" => handle_set_variables(ctx, payload).await,
            "RequestStartTransaction" => handle_request_start(ctx, payload),
            "RequestStopTransaction" => handle_request_stop(ctx, payload),
            "TriggerMessage" => handle_trigger_message(ctx, payload),
            "GetBaseReport" | "GetReport" | "SetChargingProfile" | "ClearChargingProfile"
            | "GetLog" | "UpdateFirmware" | "SendLocalList" => {
                Err(OcppCallError::not_supported(action))
            }
            _ => Err(OcppCallError::not_implemented(action)),
        }
    }
}

fn handle_reset(ctx: &Arc<StationContext>, payload: Value) -> Result<Value, OcppCallError> {
    let request: ResetRequest = serde_json::from_value(payload)?;
    let kind = match request.request_type {
        ResetEnumType::Immediate => ResetKind::Hard,
        ResetEnumType::OnIdle => ResetKind::Soft,
    };
    info!(
        station_id = ctx.station_id().as_str(),
        kind = ?kind,
        "Reset requested by the central system"
    );
    ctx.send_runtime_command(RuntimeCommand::Reset(kind));
    Ok(json!({"status": "Accepted"}))
}

async fn handle_change_availability(
    ctx: &Arc<StationContext>,
    payload: Value,
) -> Result<Value, OcppCallError> {
    let request: ChangeAvailabilityRequest = serde_json::from_value(payload)?;
    let availability = match request.operational_status {
        OperationalStatusEnumType::Operative => AvailabilityKind::Operative,
        OperationalStatusEnumType::Inoperative => AvailabilityKind::Inoperative,
    };
    let connector_ids: Vec<u32> = {
        let connectors = ctx.connectors.lock().unwrap();
        match request.evse.as_ref() {
            Some(evse) if evse.id > 0 => vec![evse.id as u32],
            _ => connectors.connector_ids(),
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
    Ok(json!({"status": if scheduled { "Scheduled" } else { "Accepted" }}))
}

fn handle_get_variables(
    ctx: &Arc<StationContext>,
    payload: Value,
) -> Result<Value, OcppCallError> {
    let requested = payload["getVariableData"]
        .as_array()
        .ok_or_else(|| OcppCallError::formation_violation("getVariableData is required"))?;
    let configuration = ctx.configuration.lock().unwrap();
    let results: Vec<Value> = requested
        .iter()
        .map(|entry| {
            let variable_name = entry["variable"]["name"].as_str().unwrap_or_default();
            match configuration.get(variable_name).filter(|k| k.visible) {
                Some(key) => json!({
                    "attributeStatus": "Accepted",
                    "attributeValue": key.value,
                    "component": entry["component"],
                    "variable": entry["variable"]
                }),
                None => json!({
                    "attributeStatus": "UnknownVariable",
                    "component": entry["component"],
                    "variable": entry["variable"]
                }),
            }
        })
        .collect();
    Ok(json!({"getVariableResult": results}))
}

async fn handle_set_variables(
    ctx: &Arc<StationContext>,
    payload: Value,
) -> Result<Value, OcppCallError> {
    let requested = payload["setVariableData"]
        .as_array()
        .cloned()
        .ok_or_else(|| OcppCallError::formation_violation("setVariableData is required"))?;
    let mut results = Vec::new();
    let mut changed = false;
    {
        let mut configuration = ctx.configuration.lock().unwrap();
        for entry in &requested {
            let variable_name = entry["variable"]["name"].as_str().unwrap_or_default();
            let value = entry["attributeValue"].as_str().unwrap_or_default();
            let status = match configuration.set_value(variable_name, value) {
                crate::domain::SetValueOutcome::Changed => {
                    changed = true;
                    "Accepted"
                }
                crate::domain::SetValueOutcome::RebootRequired => {
                    changed = true;
                    "RebootRequired"
                }
                crate::domain::SetValueOutcome::Readonly => "Rejected",
                crate::domain::SetValueOutcome::NotFound => "UnknownVariable",
            };
            results.push(json!({
                "attributeStatus": status,
                "component": entry["component"],
                "variable": entry["variable"]
            }));
        }
    }
    if changed {
        ctx.save_configuration().await;
    }
    Ok(json!({"setVariableResult": results}))
}

fn handle_request_start(
    ctx: &Arc<StationContext>,
    payload: Value,
) -> Result<Value, OcppCallError> {
    let id_tag = payload["idToken"]["idToken"]
        .as_str()
        .ok_or_else(|| OcppCallError::formation_violation("idToken is required"))?
        .to_string();
    let connector_id = payload["evseId"].as_u64().map(|id| id as u32);
    let connector_id = match connector_id {
        Some(id) => id,
        None => {
            let connectors = ctx.connectors.lock().unwrap();
            match connectors
                .chargeable_connector_ids()
                .into_iter()
                .find(|id| {
                    connectors
                        .connector(*id)
                        .map(|c| !c.has_transaction())
                        .unwrap_or(false)
                }) {
                Some(id) => id,
                None => return Ok(json!({"status": "Rejected"})),
            }
        }
    };
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
    Ok(json!({"status": "Accepted"}))
}

fn handle_request_stop(
    ctx: &Arc<StationContext>,
    payload: Value,
) -> Result<Value, OcppCallError> {
    let transaction_id: i32 = payload["transactionId"]
        .as_str()
        .and_then(|id| id.parse().ok())
        .ok_or_else(|| OcppCallError::formation_violation("transactionId is required"))?;
    let connector_id = {
        let connectors = ctx.connectors.lock().unwrap();
        connectors.connector_id_for_transaction(transaction_id)
    };
    match connector_id {
        Some(connector_id) => {
            let task_ctx = ctx.clone();
            tokio::spawn(async move {
                let _ = operations::stop_transaction(
                    &task_ctx,
                    connector_id,
                    Some(StopReason::Remote),
                )
                .await;
            });
            Ok(json!({"status": "Accepted"}))
        }
        None => Ok(json!({"status": "Rejected"})),
    }
}

fn handle_trigger_message(
    ctx: &Arc<StationContext>,
    payload: Value,
) -> Result<Value, OcppCallError> {
    let requested = payload["requestedMessage"]
        .as_str()
        .ok_or_else(|| OcppCallError::formation_violation("requestedMessage is required"))?
        .to_string();
    match requested.as_str() {
        "BootNotification" | "Heartbeat" | "StatusNotification"
        | "FirmwareStatusNotification" => {
            let task_ctx = ctx.clone();
            tokio::spawn(async move {
                use crate::application::engine::CallOptions;
                let request = match requested.as_str() {
                    "BootNotification" => {
                        let info = task_ctx.info.read().unwrap();
                        task_ctx.request.boot_notification(&info)
                    }
                    "Heartbeat" => task_ctx.request.heartbeat(),
                    "FirmwareStatusNotification" => {
                        let status = task_ctx.info.read().unwrap().firmware_status;
                        task_ctx.request.firmware_status_notification(status)
                    }
                    _ => {
                        let connector_ids = task_ctx.connectors.lock().unwrap().connector_ids();
                        for connector_id in connector_ids {
                            let status = {
                                let connectors = task_ctx.connectors.lock().unwrap();
                                connectors.connector(connector_id).and_then(|c| c.status)
                            };
                            if let Some(status) = status {
                                operations::send_status_notification(
                                    &task_ctx,
                                    connector_id,
                                    status,
                                )
                                .await;
                            }
                        }
                        return;
                    }
                };
                let _ = task_ctx
                    .engine
                    .call(request.action, request.payload, CallOptions::default())
                    .await;
            });
            Ok(json!({"status": "Accepted"}))
        }
        _ => Ok(json!({"status": "NotImplemented"})),
    }
}
