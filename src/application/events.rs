//! Station lifecycle event bus
//!
//! Broadcast channel fan-out of tagged lifecycle events to external
//! observers (dashboards, test harnesses). Publishing never blocks; with no
//! subscribers events are simply dropped.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use crate::domain::connector::ConnectorStatusKind;

const DEFAULT_CAPACITY: usize = 1024;

/// Lifecycle events emitted by a station runtime.
#[derive(Debug, Clone)]
pub enum StationEvent {
    Started {
        station_id: String,
    },
    Stopped {
        station_id: String,
        reason: Option<String>,
    },
    Connected {
        station_id: String,
    },
    Disconnected {
        station_id: String,
        reason: Option<String>,
    },
    /// BootNotification answered Accepted.
    Accepted {
        station_id: String,
        heartbeat_interval_secs: u64,
    },
    /// A BootNotification round-trip finished, whatever the outcome.
    Registered {
        station_id: String,
        status: String,
    },
    /// Station info or configuration changed.
    Updated {
        station_id: String,
    },
    ConnectorStatusChanged {
        station_id: String,
        connector_id: u32,
        status: ConnectorStatusKind,
    },
    TransactionStarted {
        station_id: String,
        connector_id: u32,
        transaction_id: i32,
        id_tag: String,
        timestamp: DateTime<Utc>,
    },
    TransactionStopped {
        station_id: String,
        connector_id: u32,
        transaction_id: i32,
        meter_stop: i64,
        timestamp: DateTime<Utc>,
    },
}

impl StationEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Stopped { .. } => "stopped",
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Accepted { .. } => "accepted",
            Self::Registered { .. } => "registered",
            Self::Updated { .. } => "updated",
            Self::ConnectorStatusChanged { .. } => "connectorStatusChanged",
            Self::TransactionStarted { .. } => "transactionStarted",
            Self::TransactionStopped { .. } => "transactionStopped",
        }
    }
}

/// Broadcast event bus. Cloning shares the underlying channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StationEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: StationEvent) {
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(subscribers) => debug!(kind, subscribers, "Event published"),
            // no subscribers connected
            Err(_) => debug!(kind, "Event published (no subscribers)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StationEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(StationEvent::Started {
            station_id: "CS-1".into(),
        });
        match rx.recv().await.unwrap() {
            StationEvent::Started { station_id } => assert_eq!(station_id, "CS-1"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(StationEvent::Updated {
            station_id: "CS-1".into(),
        });
    }
}
