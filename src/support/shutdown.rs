//! Shutdown coordination
//!
//! Each station runtime owns one [`ShutdownSignal`], labelled with its
//! station id, that its background tasks (reservation sweep, buffer flush,
//! connection loop, registration waits) select on. Triggering is sticky:
//! tasks that subscribe after the fact resolve immediately, so a station
//! stopping mid-reconnect never strands a sleeper.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, info};

struct Shared {
    owner: String,
    notify: Notify,
    triggered: AtomicBool,
}

/// Sticky shutdown signal shared by one station's tasks.
#[derive(Clone)]
pub struct ShutdownSignal {
    shared: Arc<Shared>,
}

impl ShutdownSignal {
    /// `owner` names the station (or the simulator process) in trace
    /// output when the signal fires.
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(Shared {
                owner: owner.into(),
                notify: Notify::new(),
                triggered: AtomicBool::new(false),
            }),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.shared.triggered.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        if !self.shared.triggered.swap(true, Ordering::SeqCst) {
            debug!(
                owner = self.shared.owner.as_str(),
                "Shutdown signal triggered"
            );
            self.shared.notify.notify_waiters();
        }
    }

    pub fn notified(&self) -> ShutdownNotified {
        ShutdownNotified {
            shared: self.shared.clone(),
        }
    }
}

/// A future that resolves when the owning station shuts down.
pub struct ShutdownNotified {
    shared: Arc<Shared>,
}

impl ShutdownNotified {
    pub async fn wait(self) {
        let notified = self.shared.notify.notified();
        tokio::pin!(notified);
        // register before the triggered check so a concurrent trigger
        // cannot slip between the two
        notified.as_mut().enable();
        if self.shared.triggered.load(Ordering::SeqCst) {
            return;
        }
        notified.await;
    }
}

/// Listen for OS shutdown signals (SIGTERM, SIGINT) and trigger the
/// simulator-wide signal so every station winds down.
pub async fn listen_for_shutdown_signals(shutdown: ShutdownSignal) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
        let mut sigint =
            signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, stopping stations"),
            _ = sigint.recv() => info!("Received SIGINT, stopping stations"),
        }
        shutdown.trigger();
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received Ctrl+C, stopping stations");
        shutdown.trigger();
    }
}
