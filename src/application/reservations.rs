//! Reservation management
//!
//! ReserveNow/CancelReservation bookkeeping on the connector model, plus
//! the periodic sweep that expires overdue reservations. Removal reasons
//! decide whether the connector is reported Available again.

use std::sync::Arc;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, info};

use crate::application::operations;
use crate::domain::configuration::RESERVE_CONNECTOR_ZERO_KEY;
use crate::domain::connector::ConnectorStatusKind;
use crate::domain::reservation::{Reservation, ReservationTerminationReason};
use crate::station::context::StationContext;
use crate::support::shutdown::ShutdownSignal;

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Install a reservation. An existing reservation with the same id is
/// replaced first.
pub async fn add_reservation(ctx: &Arc<StationContext>, reservation: Reservation) {
    if let Some((connector_id, existing)) = find_reservation(ctx, reservation.reservation_id) {
        remove_reservation(
            ctx,
            connector_id,
            &existing,
            ReservationTerminationReason::ReplaceExisting,
        )
        .await;
    }

    let connector_id = reservation.connector_id;
    {
        let mut connectors = ctx.connectors.lock().unwrap();
        if let Some(connector) = connectors.connector_mut(connector_id) {
            connector.reservation = Some(reservation.clone());
        }
    }
    info!(
        station_id = ctx.station_id().as_str(),
        connector_id,
        reservation_id = reservation.reservation_id,
        "Reservation added"
    );
    if connector_id > 0 {
        operations::send_status_notification(ctx, connector_id, ConnectorStatusKind::Reserved)
            .await;
    }
}

/// Remove a reservation with the given reason.
pub async fn remove_reservation(
    ctx: &Arc<StationContext>,
    connector_id: u32,
    reservation: &Reservation,
    reason: ReservationTerminationReason,
) {
    {
        let mut connectors = ctx.connectors.lock().unwrap();
        if let Some(connector) = connectors.connector_mut(connector_id) {
            connector.reservation = None;
        }
    }
    info!(
        station_id = ctx.station_id().as_str(),
        connector_id,
        reservation_id = reservation.reservation_id,
        reason = ?reason,
        "Reservation removed"
    );
    if reason.frees_connector() && connector_id > 0 {
        operations::send_status_notification(ctx, connector_id, ConnectorStatusKind::Available)
            .await;
    }
}

/// Remove whatever reservation sits on `connector_id`, if any.
pub async fn remove_connector_reservation(
    ctx: &Arc<StationContext>,
    connector_id: u32,
    reason: ReservationTerminationReason,
) {
    let reservation = {
        let connectors = ctx.connectors.lock().unwrap();
        connectors
            .connector(connector_id)
            .and_then(|c| c.reservation.clone())
    };
    if let Some(reservation) = reservation {
        remove_reservation(ctx, connector_id, &reservation, reason).await;
    }
}

/// Remove the reservation with `reservation_id`. Returns whether one
/// existed.
pub async fn cancel_reservation(
    ctx: &Arc<StationContext>,
    reservation_id: i32,
    reason: ReservationTerminationReason,
) -> bool {
    match find_reservation(ctx, reservation_id) {
        Some((connector_id, reservation)) => {
            remove_reservation(ctx, connector_id, &reservation, reason).await;
            true
        }
        None => false,
    }
}

pub fn find_reservation(
    ctx: &StationContext,
    reservation_id: i32,
) -> Option<(u32, Reservation)> {
    let connectors = ctx.connectors.lock().unwrap();
    connectors.connector_ids().into_iter().find_map(|id| {
        connectors
            .connector(id)
            .and_then(|c| c.reservation.clone())
            .filter(|r| r.reservation_id == reservation_id)
            .map(|r| (id, r))
    })
}

/// Whether a ReserveNow for this id/tag/connector can be honored.
pub fn is_connector_reservable(
    ctx: &StationContext,
    reservation_id: i32,
    id_tag: Option<&str>,
    connector_id: Option<u32>,
) -> bool {
    if find_reservation(ctx, reservation_id).is_some() {
        return false;
    }
    let connectors = ctx.connectors.lock().unwrap();
    if let Some(id_tag) = id_tag {
        let tag_already_reserving = connectors.connector_ids().into_iter().any(|id| {
            connectors
                .connector(id)
                .and_then(|c| c.reservation.as_ref())
                .map(|r| r.id_tag == id_tag)
                .unwrap_or(false)
        });
        if tag_already_reserving {
            return false;
        }
    }
    match connector_id {
        Some(0) => {
            drop(connectors);
            ctx.configuration
                .lock()
                .unwrap()
                .get_bool(RESERVE_CONNECTOR_ZERO_KEY)
                .unwrap_or(false)
        }
        Some(id) => connectors
            .connector(id)
            .map(|c| c.reservation.is_none() && !c.has_transaction())
            .unwrap_or(false),
        None => {
            // any free reservable connector will do
            connectors.connector_ids().into_iter().any(|id| {
                id > 0
                    && connectors
                        .connector(id)
                        .map(|c| c.reservation.is_none() && !c.has_transaction())
                        .unwrap_or(false)
            })
        }
    }
}

/// Periodic sweep removing reservations past their expiry date.
pub fn start_expiry_sweep(ctx: Arc<StationContext>, shutdown: ShutdownSignal) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(
            station_id = ctx.station_id().as_str(),
            "Reservation expiry sweep started"
        );
        let mut ticker = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => expire_reservations(&ctx).await,
                _ = shutdown.notified().wait() => break,
            }
        }
        debug!(
            station_id = ctx.station_id().as_str(),
            "Reservation expiry sweep stopped"
        );
    })
}

pub async fn expire_reservations(ctx: &Arc<StationContext>) {
    let now = Utc::now();
    let expired: Vec<(u32, Reservation)> = {
        let connectors = ctx.connectors.lock().unwrap();
        connectors
            .connector_ids()
            .into_iter()
            .filter_map(|id| {
                connectors
                    .connector(id)
                    .and_then(|c| c.reservation.clone())
                    .filter(|r| r.is_expired(now))
                    .map(|r| (id, r))
            })
            .collect()
    };
    for (connector_id, reservation) in expired {
        remove_reservation(
            ctx,
            connector_id,
            &reservation,
            ReservationTerminationReason::Expired,
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::testing;
    use crate::support::frame::Frame;
    use chrono::Duration as ChronoDuration;

    fn reservation(id: i32, connector_id: u32, id_tag: &str, minutes: i64) -> Reservation {
        Reservation {
            reservation_id: id,
            connector_id,
            id_tag: id_tag.to_string(),
            expiry_date: Utc::now() + ChronoDuration::minutes(minutes),
            parent_id_tag: None,
        }
    }

    #[tokio::test]
    async fn add_sends_reserved_status_notification() {
        let (ctx, mut observed) = testing::context_with_responder();

        add_reservation(&ctx, reservation(1, 1, "TAG-1", 30)).await;

        let sent = observed.recv().await.unwrap();
        match Frame::parse(&sent).unwrap() {
            Frame::Call {
                action, payload, ..
            } => {
                assert_eq!(action, "StatusNotification");
                assert_eq!(payload["status"], "Reserved");
            }
            other => panic!("expected Call, got {other:?}"),
        }
        assert!(find_reservation(&ctx, 1).is_some());
    }

    #[tokio::test]
    async fn same_id_replaces_the_existing_reservation() {
        let (ctx, _observed) = testing::context_with_responder();

        add_reservation(&ctx, reservation(1, 1, "TAG-1", 30)).await;
        add_reservation(&ctx, reservation(1, 2, "TAG-2", 30)).await;

        let (connector_id, found) = find_reservation(&ctx, 1).unwrap();
        assert_eq!(connector_id, 2);
        assert_eq!(found.id_tag, "TAG-2");
        let connectors = ctx.connectors.lock().unwrap();
        assert!(connectors.connector(1).unwrap().reservation.is_none());
    }

    #[tokio::test]
    async fn expiry_sweep_removes_overdue_reservations() {
        let (ctx, mut observed) = testing::context_with_responder();

        add_reservation(&ctx, reservation(7, 1, "TAG-1", -1)).await;
        // drain the Reserved notification
        let _ = observed.recv().await.unwrap();

        expire_reservations(&ctx).await;
        assert!(find_reservation(&ctx, 7).is_none());

        let sent = observed.recv().await.unwrap();
        match Frame::parse(&sent).unwrap() {
            Frame::Call { payload, .. } => assert_eq!(payload["status"], "Available"),
            other => panic!("expected Call, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transaction_started_removal_keeps_connector_status() {
        let (ctx, mut observed) = testing::context_with_responder();

        add_reservation(&ctx, reservation(3, 1, "TAG-1", 30)).await;
        let _ = observed.recv().await.unwrap();

        remove_connector_reservation(
            &ctx,
            1,
            ReservationTerminationReason::TransactionStarted,
        )
        .await;
        assert!(find_reservation(&ctx, 3).is_none());
        // no further StatusNotification was sent
        assert!(observed.try_recv().is_err());
        let connectors = ctx.connectors.lock().unwrap();
        assert_eq!(
            connectors.connector(1).unwrap().status,
            Some(ConnectorStatusKind::Reserved)
        );
    }

    #[tokio::test]
    async fn reservable_checks() {
        let (ctx, _observed) = testing::context_with_responder();

        assert!(is_connector_reservable(&ctx, 1, Some("TAG-1"), Some(1)));
        // connector 0 needs the configuration key
        assert!(!is_connector_reservable(&ctx, 1, Some("TAG-1"), Some(0)));

        add_reservation(&ctx, reservation(1, 1, "TAG-1", 30)).await;
        // same reservation id
        assert!(!is_connector_reservable(&ctx, 1, Some("TAG-9"), Some(2)));
        // tag already holds a reservation
        assert!(!is_connector_reservable(&ctx, 2, Some("TAG-1"), Some(2)));
        // other connector still reservable for another tag
        assert!(is_connector_reservable(&ctx, 2, Some("TAG-2"), Some(2)));
        // occupied connector is not
        assert!(!is_connector_reservable(&ctx, 2, Some("TAG-2"), Some(1)));
    }
}
