//! Connector reservation entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Why a reservation is being removed. Drives whether a
/// StatusNotification(Available) is owed to the central system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationTerminationReason {
    Expired,
    ReservationCanceled,
    ReplaceExisting,
    TransactionStarted,
    ConnectorStateChanged,
}

impl ReservationTerminationReason {
    /// Terminations caused by the connector itself (a transaction starting
    /// or a state change) keep the connector status as-is; the rest free
    /// the connector back to Available.
    pub fn frees_connector(&self) -> bool {
        matches!(
            self,
            Self::Expired | Self::ReservationCanceled | Self::ReplaceExisting
        )
    }
}

/// A reservation as received via ReserveNow. `connector_id` 0 reserves the
/// station as a whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reservation {
    pub reservation_id: i32,
    pub connector_id: u32,
    pub id_tag: String,
    pub expiry_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id_tag: Option<String>,
}

impl Reservation {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_date < now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn expiry_check() {
        let r = Reservation {
            reservation_id: 1,
            connector_id: 1,
            id_tag: "TAG-1".into(),
            expiry_date: Utc::now() + Duration::minutes(5),
            parent_id_tag: None,
        };
        assert!(!r.is_expired(Utc::now()));
        assert!(r.is_expired(Utc::now() + Duration::minutes(6)));
    }

    #[test]
    fn connector_state_terminations_keep_status() {
        assert!(!ReservationTerminationReason::TransactionStarted.frees_connector());
        assert!(!ReservationTerminationReason::ConnectorStateChanged.frees_connector());
        assert!(ReservationTerminationReason::Expired.frees_connector());
        assert!(ReservationTerminationReason::ReservationCanceled.frees_connector());
        assert!(ReservationTerminationReason::ReplaceExisting.frees_connector());
    }
}
