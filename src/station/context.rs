//! Shared station state
//!
//! [`StationContext`] is the state every collaborator works against: the
//! runtime, the message engine's incoming dispatch, the version services,
//! the reservation manager and the transaction generator. Collaborators
//! hold an `Arc` of it; the runtime owns the lifecycle.
//!
//! Guards are never held across await points; mutations are short critical
//! sections so inbound-frame handling, timer callbacks and outbound sends
//! observe a consistent per-station state.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::application::engine::OcppEngine;
use crate::application::events::EventBus;
use crate::application::services::RequestService;
use crate::domain::configuration::{
    ConfigurationStore, HEARTBEAT_INTERVAL_KEY, HEARTBEAT_INTERVAL_LEGACY_KEY,
    METER_VALUE_SAMPLE_INTERVAL_KEY, WEB_SOCKET_PING_INTERVAL_KEY,
};
use crate::domain::connector::ConnectorModel;
use crate::domain::template::AutomaticTransactionGeneratorConfiguration;
use crate::domain::StationInfo;
use crate::infrastructure::persistence::{ConfigurationFile, PersistedConfiguration};

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_METER_VALUE_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

/// Registration outcome of the most recent BootNotification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationStatus {
    #[default]
    Unregistered,
    Accepted,
    Pending,
    Rejected,
}

/// Parsed BootNotification response.
#[derive(Debug, Clone)]
pub struct BootResponse {
    pub status: RegistrationStatus,
    pub interval_secs: u64,
    pub current_time: Option<DateTime<Utc>>,
}

/// Reset flavour requested by the central system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetKind {
    Hard,
    Soft,
}

/// Commands incoming-request handlers post back to the runtime, for actions
/// only the lifecycle owner can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeCommand {
    Reset(ResetKind),
    RestartHeartbeat,
    RestartWebSocketPing,
}

/// Mutable station state shared between the runtime and its collaborators.
pub struct StationContext {
    pub info: RwLock<StationInfo>,
    pub connectors: Mutex<ConnectorModel>,
    pub configuration: Mutex<ConfigurationStore>,
    pub atg_configuration: Mutex<Option<AutomaticTransactionGeneratorConfiguration>>,
    /// Local authorization list, from `idTagsFile`.
    pub id_tags: RwLock<Vec<String>>,
    pub events: EventBus,
    pub engine: Arc<OcppEngine>,
    pub request: Arc<dyn RequestService>,

    started: AtomicBool,
    starting: AtomicBool,
    stopping: AtomicBool,
    boot_response: Mutex<Option<BootResponse>>,
    runtime_commands: Mutex<Option<mpsc::UnboundedSender<RuntimeCommand>>>,

    /// Per-connector meter-values sampling tasks; at most one per connector.
    pub meter_values_tasks: Mutex<HashMap<u32, JoinHandle<()>>>,

    configuration_directory: PathBuf,
}

impl StationContext {
    pub fn new(
        info: StationInfo,
        connectors: ConnectorModel,
        configuration: ConfigurationStore,
        atg_configuration: Option<AutomaticTransactionGeneratorConfiguration>,
        engine: Arc<OcppEngine>,
        request: Arc<dyn RequestService>,
        events: EventBus,
        configuration_directory: PathBuf,
    ) -> Self {
        Self {
            info: RwLock::new(info),
            connectors: Mutex::new(connectors),
            configuration: Mutex::new(configuration),
            atg_configuration: Mutex::new(atg_configuration),
            id_tags: RwLock::new(Vec::new()),
            events,
            engine,
            request,
            started: AtomicBool::new(false),
            starting: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            boot_response: Mutex::new(None),
            runtime_commands: Mutex::new(None),
            meter_values_tasks: Mutex::new(HashMap::new()),
            configuration_directory,
        }
    }

    /// Wire the runtime command channel. Called by the runtime at start.
    pub fn set_runtime_command_sender(&self, sender: mpsc::UnboundedSender<RuntimeCommand>) {
        *self.runtime_commands.lock().unwrap() = Some(sender);
    }

    /// Post a command to the runtime. Dropped when no runtime is listening.
    pub fn send_runtime_command(&self, command: RuntimeCommand) {
        if let Some(sender) = self.runtime_commands.lock().unwrap().as_ref() {
            let _ = sender.send(command);
        }
    }

    pub fn station_id(&self) -> String {
        self.info.read().unwrap().station_id.clone()
    }

    // ── Lifecycle flags ────────────────────────────────────────
    // Invariant: `started` and `starting` are never both true, and
    // `stopping` implies `started`.

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_starting(&self) -> bool {
        self.starting.load(Ordering::SeqCst)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Move to `starting`. Returns false when already started or starting.
    pub fn begin_start(&self) -> bool {
        if self.started.load(Ordering::SeqCst) || self.starting.swap(true, Ordering::SeqCst) {
            return false;
        }
        true
    }

    pub fn mark_started(&self) {
        self.started.store(true, Ordering::SeqCst);
        self.starting.store(false, Ordering::SeqCst);
    }

    /// Move to `stopping`. Returns false when not started.
    pub fn begin_stop(&self) -> bool {
        if !self.started.load(Ordering::SeqCst) || self.stopping.swap(true, Ordering::SeqCst) {
            return false;
        }
        true
    }

    pub fn mark_stopped(&self) {
        self.stopping.store(false, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
        self.starting.store(false, Ordering::SeqCst);
        *self.boot_response.lock().unwrap() = None;
    }

    // ── Registration ───────────────────────────────────────────

    pub fn set_boot_response(&self, response: BootResponse) {
        *self.boot_response.lock().unwrap() = Some(response);
    }

    pub fn boot_response(&self) -> Option<BootResponse> {
        self.boot_response.lock().unwrap().clone()
    }

    pub fn is_registered(&self) -> bool {
        self.boot_response
            .lock()
            .unwrap()
            .as_ref()
            .map(|r| r.status == RegistrationStatus::Accepted)
            .unwrap_or(false)
    }

    // ── Configuration-derived intervals ────────────────────────

    pub fn heartbeat_interval(&self) -> Duration {
        let configuration = self.configuration.lock().unwrap();
        configuration
            .get_integer(HEARTBEAT_INTERVAL_KEY)
            .or_else(|| configuration.get_integer(HEARTBEAT_INTERVAL_LEGACY_KEY))
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(DEFAULT_HEARTBEAT_INTERVAL)
    }

    pub fn meter_value_sample_interval(&self) -> Duration {
        self.configuration
            .lock()
            .unwrap()
            .get_integer(METER_VALUE_SAMPLE_INTERVAL_KEY)
            .filter(|secs| *secs > 0)
            .map(|secs| Duration::from_secs(secs as u64))
            .unwrap_or(DEFAULT_METER_VALUE_SAMPLE_INTERVAL)
    }

    pub fn web_socket_ping_interval(&self) -> Option<Duration> {
        let from_configuration = self
            .configuration
            .lock()
            .unwrap()
            .get_integer(WEB_SOCKET_PING_INTERVAL_KEY);
        from_configuration
            .map(|secs| secs.max(0) as u64)
            .or_else(|| self.info.read().unwrap().web_socket_ping_interval_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// An id tag is locally authorized when the local list contains it.
    pub fn is_id_tag_locally_authorized(&self, id_tag: &str) -> bool {
        self.id_tags.read().unwrap().iter().any(|t| t == id_tag)
    }

    // ── Persistence ────────────────────────────────────────────

    pub fn configuration_file(&self) -> ConfigurationFile {
        let hash_id = self.info.read().unwrap().hash_id.clone();
        ConfigurationFile::new(&self.configuration_directory, &hash_id)
    }

    /// Snapshot the persistable parts of the station state.
    pub fn persisted_configuration(&self) -> PersistedConfiguration {
        let info = self.info.read().unwrap().clone();
        let connectors = self.connectors.lock().unwrap().clone();
        let configuration_key = self
            .configuration
            .lock()
            .unwrap()
            .keys()
            .to_vec();

        let mut document = PersistedConfiguration::default();
        if info.station_info_persistent_configuration {
            document.station_info = Some(info.clone());
        }
        if info.ocpp_persistent_configuration {
            document.configuration_key = Some(configuration_key);
        }
        if info.automatic_transaction_generator_persistent_configuration {
            document.automatic_transaction_generator =
                self.atg_configuration.lock().unwrap().clone();
        }
        if connectors.uses_evses() {
            document.evses_status = Some(connectors.evses.clone());
        } else {
            document.connectors_status = Some(connectors.connectors.clone());
        }
        document
    }

    /// Best-effort save of the configuration file.
    pub async fn save_configuration(&self) {
        let info_flags = {
            let info = self.info.read().unwrap();
            info.station_info_persistent_configuration
                || info.ocpp_persistent_configuration
                || info.automatic_transaction_generator_persistent_configuration
        };
        if !info_flags {
            return;
        }
        let document = self.persisted_configuration();
        let file = self.configuration_file();
        if let Err(e) = file.save(document).await {
            warn!(
                station_id = self.station_id().as_str(),
                error = %e,
                "Configuration save failed, will retry on next cycle"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle_flags_hold_their_invariants() {
        let ctx = crate::station::testing::context();

        assert!(ctx.begin_start());
        assert!(ctx.is_starting() && !ctx.is_started());
        // a second start attempt is refused
        assert!(!ctx.begin_start());

        ctx.mark_started();
        assert!(ctx.is_started() && !ctx.is_starting());

        assert!(ctx.begin_stop());
        assert!(ctx.is_stopping() && ctx.is_started());

        ctx.mark_stopped();
        assert!(!ctx.is_started() && !ctx.is_stopping());
        // stop without start is refused
        assert!(!ctx.begin_stop());
    }

    #[tokio::test]
    async fn registration_follows_the_boot_response() {
        let ctx = crate::station::testing::context();
        assert!(!ctx.is_registered());

        ctx.set_boot_response(BootResponse {
            status: RegistrationStatus::Pending,
            interval_secs: 2,
            current_time: None,
        });
        assert!(!ctx.is_registered());

        ctx.set_boot_response(BootResponse {
            status: RegistrationStatus::Accepted,
            interval_secs: 60,
            current_time: Some(Utc::now()),
        });
        assert!(ctx.is_registered());
    }

    #[tokio::test]
    async fn heartbeat_interval_reads_the_configuration_key() {
        let ctx = crate::station::testing::context();
        ctx.configuration
            .lock()
            .unwrap()
            .set_value(HEARTBEAT_INTERVAL_KEY, "15");
        assert_eq!(ctx.heartbeat_interval(), Duration::from_secs(15));

        // an unusable value falls back to the default
        ctx.configuration
            .lock()
            .unwrap()
            .set_value(HEARTBEAT_INTERVAL_KEY, "not-a-number");
        assert_eq!(ctx.heartbeat_interval(), DEFAULT_HEARTBEAT_INTERVAL);
    }
}
