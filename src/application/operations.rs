//! Station-originated OCPP operations
//!
//! The transaction, authorization and status-notification flows shared by
//! the runtime, the incoming-request handlers and the transaction
//! generator. Every flow goes through the engine and the station's
//! version-specific request service.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::application::engine::CallOptions;
use crate::application::events::StationEvent;
use crate::application::services::{MeterSample, SampledMeasurand, StopReason};
use crate::application::{meter_values, reservations};
use crate::domain::configuration::{
    AUTHORIZE_REMOTE_TX_REQUESTS_KEY, LOCAL_AUTH_LIST_ENABLED_KEY,
};
use crate::domain::connector::{AvailabilityKind, ConnectorStatusKind};
use crate::domain::reservation::ReservationTerminationReason;
use crate::station::context::StationContext;
use crate::support::errors::EngineError;

/// Update the connector status and notify the central system.
pub async fn send_status_notification(
    ctx: &Arc<StationContext>,
    connector_id: u32,
    status: ConnectorStatusKind,
) {
    {
        let mut connectors = ctx.connectors.lock().unwrap();
        if let Some(connector) = connectors.connector_mut(connector_id) {
            connector.status = Some(status);
        }
    }
    let request = ctx.request.status_notification(connector_id, status);
    if let Err(e) = ctx
        .engine
        .call(request.action, request.payload, CallOptions::default())
        .await
    {
        warn!(
            station_id = ctx.station_id().as_str(),
            connector_id,
            error = %e,
            "StatusNotification failed"
        );
    }
    ctx.events.publish(StationEvent::ConnectorStatusChanged {
        station_id: ctx.station_id(),
        connector_id,
        status,
    });
}

/// Status reported for a connector during the boot sequence: persisted
/// status first, then the template boot status, then availability.
pub fn boot_connector_status(ctx: &StationContext, connector_id: u32) -> ConnectorStatusKind {
    let station_unavailable = {
        let connectors = ctx.connectors.lock().unwrap();
        connectors
            .connector(0)
            .map(|c| c.availability == AvailabilityKind::Inoperative)
            .unwrap_or(false)
    };
    let connectors = ctx.connectors.lock().unwrap();
    match connectors.connector(connector_id) {
        Some(connector) => {
            if let Some(status) = connector.status {
                status
            } else if let Some(boot_status) = connector.boot_status {
                boot_status
            } else if station_unavailable
                || connector.availability == AvailabilityKind::Inoperative
            {
                ConnectorStatusKind::Unavailable
            } else {
                ConnectorStatusKind::Available
            }
        }
        None => ConnectorStatusKind::Available,
    }
}

/// Authorize an id tag for a connector: local list first, then a remote
/// Authorize round-trip when the station requires it.
pub async fn authorize_id_tag(
    ctx: &Arc<StationContext>,
    connector_id: u32,
    id_tag: &str,
) -> bool {
    let local_auth_enabled = ctx
        .configuration
        .lock()
        .unwrap()
        .get_bool(LOCAL_AUTH_LIST_ENABLED_KEY)
        .unwrap_or(false);
    if local_auth_enabled && ctx.is_id_tag_locally_authorized(id_tag) {
        let mut connectors = ctx.connectors.lock().unwrap();
        if let Some(connector) = connectors.connector_mut(connector_id) {
            connector.id_tag_local_authorized = true;
        }
        debug!(
            station_id = ctx.station_id().as_str(),
            connector_id, id_tag, "Id tag locally authorized"
        );
        return true;
    }

    if !ctx.info.read().unwrap().remote_authorization {
        return true;
    }

    let request = ctx.request.authorize(id_tag);
    let authorized = match ctx
        .engine
        .call(request.action, request.payload, CallOptions::default())
        .await
    {
        Ok(payload) => ctx
            .request
            .parse_authorize_response(&payload)
            .unwrap_or(false),
        Err(e) => {
            warn!(
                station_id = ctx.station_id().as_str(),
                connector_id,
                id_tag,
                error = %e,
                "Authorize failed"
            );
            false
        }
    };
    if authorized {
        let mut connectors = ctx.connectors.lock().unwrap();
        if let Some(connector) = connectors.connector_mut(connector_id) {
            connector.id_tag_authorized = true;
        }
    }
    authorized
}

/// Full StartTransaction flow. Returns whether the central system accepted
/// the transaction.
pub async fn start_transaction(
    ctx: &Arc<StationContext>,
    connector_id: u32,
    id_tag: &str,
    remote_started: bool,
) -> Result<bool, EngineError> {
    if connector_id == 0 {
        warn!(
            station_id = ctx.station_id().as_str(),
            "Refusing to start a transaction on connector 0"
        );
        return Ok(false);
    }
    {
        let connectors = ctx.connectors.lock().unwrap();
        match connectors.connector(connector_id) {
            None => {
                warn!(
                    station_id = ctx.station_id().as_str(),
                    connector_id, "Unknown connector"
                );
                return Ok(false);
            }
            Some(connector) if connector.has_transaction() => {
                warn!(
                    station_id = ctx.station_id().as_str(),
                    connector_id, "Connector already has a running transaction"
                );
                return Ok(false);
            }
            Some(connector) if connector.availability == AvailabilityKind::Inoperative => {
                warn!(
                    station_id = ctx.station_id().as_str(),
                    connector_id, "Connector is inoperative"
                );
                return Ok(false);
            }
            Some(_) => {}
        }
    }

    // Remote starts are only authorized when AuthorizeRemoteTxRequests says so.
    let authorization_required = if remote_started {
        ctx.configuration
            .lock()
            .unwrap()
            .get_bool(AUTHORIZE_REMOTE_TX_REQUESTS_KEY)
            .unwrap_or(false)
    } else {
        true
    };
    if authorization_required && !authorize_id_tag(ctx, connector_id, id_tag).await {
        info!(
            station_id = ctx.station_id().as_str(),
            connector_id, id_tag, "Id tag not authorized, transaction not started"
        );
        return Ok(false);
    }

    send_status_notification(ctx, connector_id, ConnectorStatusKind::Preparing).await;

    let now = Utc::now();
    let metering_per_transaction = ctx.info.read().unwrap().metering_per_transaction;
    let (meter_start, reservation_id) = {
        let connectors = ctx.connectors.lock().unwrap();
        let connector = connectors.connector(connector_id);
        let register = if metering_per_transaction {
            // the meter restarts from zero for every transaction
            0
        } else {
            connector
                .map(|c| c.energy_active_import_register)
                .unwrap_or_default()
        };
        (
            register,
            connector
                .and_then(|c| c.reservation.as_ref())
                .filter(|r| r.id_tag == id_tag)
                .map(|r| r.reservation_id),
        )
    };

    if transaction_boundary_meter_values(ctx) {
        let sample = MeterSample {
            timestamp: now,
            values: vec![SampledMeasurand::EnergyActiveImportRegister { wh: meter_start }],
        };
        let request = ctx.request.meter_values(connector_id, None, &sample);
        let _ = ctx
            .engine
            .call(request.action, request.payload, CallOptions::default())
            .await;
    }

    let (request, allocated_transaction_id) = ctx
        .request
        .start_transaction(connector_id, id_tag, meter_start, now, reservation_id);
    let payload = ctx
        .engine
        .call(request.action, request.payload, CallOptions::default())
        .await?;
    let outcome = ctx
        .request
        .parse_start_transaction_response(&payload, allocated_transaction_id)?;

    if !outcome.accepted {
        warn!(
            station_id = ctx.station_id().as_str(),
            connector_id, id_tag, "StartTransaction rejected by the central system"
        );
        send_status_notification(ctx, connector_id, ConnectorStatusKind::Available).await;
        return Ok(false);
    }

    {
        let mut connectors = ctx.connectors.lock().unwrap();
        if let Some(connector) = connectors.connector_mut(connector_id) {
            connector.start_transaction(outcome.transaction_id, id_tag, meter_start, now);
            connector.transaction_remote_started = remote_started;
        }
    }
    reservations::remove_connector_reservation(
        ctx,
        connector_id,
        ReservationTerminationReason::TransactionStarted,
    )
    .await;

    info!(
        station_id = ctx.station_id().as_str(),
        connector_id,
        transaction_id = outcome.transaction_id,
        id_tag,
        "Transaction started"
    );
    ctx.events.publish(StationEvent::TransactionStarted {
        station_id: ctx.station_id(),
        connector_id,
        transaction_id: outcome.transaction_id,
        id_tag: id_tag.to_string(),
        timestamp: now,
    });

    meter_values::start_sampling(ctx, connector_id);
    send_status_notification(ctx, connector_id, ConnectorStatusKind::Charging).await;
    Ok(true)
}

/// Full StopTransaction flow. Returns whether a transaction was actually
/// stopped.
pub async fn stop_transaction(
    ctx: &Arc<StationContext>,
    connector_id: u32,
    reason: Option<StopReason>,
) -> Result<bool, EngineError> {
    let Some((transaction_id, id_tag, meter_stop)) = ({
        let connectors = ctx.connectors.lock().unwrap();
        connectors.connector(connector_id).and_then(|connector| {
            connector.transaction_id.map(|transaction_id| {
                (
                    transaction_id,
                    connector.transaction_id_tag.clone(),
                    connector.energy_active_import_register,
                )
            })
        })
    }) else {
        return Ok(false);
    };

    meter_values::stop_sampling(ctx, connector_id);
    send_status_notification(ctx, connector_id, ConnectorStatusKind::Finishing).await;

    let now = Utc::now();
    if transaction_boundary_meter_values(ctx) {
        let sample = MeterSample {
            timestamp: now,
            values: vec![SampledMeasurand::EnergyActiveImportRegister { wh: meter_stop }],
        };
        let request = ctx
            .request
            .meter_values(connector_id, Some(transaction_id), &sample);
        let _ = ctx
            .engine
            .call(request.action, request.payload, CallOptions::default())
            .await;
    }

    let request = ctx.request.stop_transaction(
        transaction_id,
        meter_stop,
        now,
        id_tag.as_deref(),
        reason,
    );
    let result = ctx
        .engine
        .call(request.action, request.payload, CallOptions::default())
        .await;
    if let Err(e) = &result {
        warn!(
            station_id = ctx.station_id().as_str(),
            connector_id,
            transaction_id,
            error = %e,
            "StopTransaction failed, stopping locally anyway"
        );
    }

    {
        let mut connectors = ctx.connectors.lock().unwrap();
        if let Some(connector) = connectors.connector_mut(connector_id) {
            connector.stop_transaction();
        }
    }

    info!(
        station_id = ctx.station_id().as_str(),
        connector_id, transaction_id, meter_stop, "Transaction stopped"
    );
    ctx.events.publish(StationEvent::TransactionStopped {
        station_id: ctx.station_id(),
        connector_id,
        transaction_id,
        meter_stop,
        timestamp: now,
    });

    send_status_notification(ctx, connector_id, ConnectorStatusKind::Available).await;
    Ok(true)
}

/// Transaction begin/end meter values are only sent in strictly compliant,
/// in-order configurations.
fn transaction_boundary_meter_values(ctx: &StationContext) -> bool {
    let info = ctx.info.read().unwrap();
    info.begin_end_meter_values
        && info.ocpp_strict_compliance
        && !info.out_of_order_end_meter_values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::testing;

    #[tokio::test]
    async fn boot_status_resolution_order() {
        let ctx = testing::context();

        // default: Available
        assert_eq!(
            boot_connector_status(&ctx, 1),
            ConnectorStatusKind::Available
        );

        // template boot status wins over availability
        {
            let mut connectors = ctx.connectors.lock().unwrap();
            let connector = connectors.connector_mut(1).unwrap();
            connector.boot_status = Some(ConnectorStatusKind::Preparing);
        }
        assert_eq!(
            boot_connector_status(&ctx, 1),
            ConnectorStatusKind::Preparing
        );

        // a previously reported status wins over everything
        {
            let mut connectors = ctx.connectors.lock().unwrap();
            let connector = connectors.connector_mut(1).unwrap();
            connector.status = Some(ConnectorStatusKind::Faulted);
        }
        assert_eq!(boot_connector_status(&ctx, 1), ConnectorStatusKind::Faulted);
    }

    #[tokio::test]
    async fn inoperative_connector_boots_unavailable() {
        let ctx = testing::context();
        {
            let mut connectors = ctx.connectors.lock().unwrap();
            connectors.connector_mut(2).unwrap().availability = AvailabilityKind::Inoperative;
        }
        assert_eq!(
            boot_connector_status(&ctx, 2),
            ConnectorStatusKind::Unavailable
        );
    }

    #[tokio::test]
    async fn start_transaction_refuses_connector_zero_and_duplicates() {
        let (ctx, _peer, _events) = testing::context_with_peer();
        assert!(!start_transaction(&ctx, 0, "TAG-1", false).await.unwrap());

        {
            let mut connectors = ctx.connectors.lock().unwrap();
            connectors
                .connector_mut(1)
                .unwrap()
                .start_transaction(7, "TAG-0", 0, Utc::now());
        }
        assert!(!start_transaction(&ctx, 1, "TAG-1", false).await.unwrap());
    }
}
