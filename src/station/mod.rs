//! Station runtime
//!
//! The top-level actor impersonating one charging station: initialize from
//! a template, open the channel, register with BootNotification, run the
//! heartbeat/ping/meter timers, honor central-system commands, reconnect
//! on abnormal close, and tear everything down on stop or reset.

pub mod context;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::application::atg::{AutomaticTransactionGenerator, TransactionGenerator};
use crate::application::engine::{CallOptions, OcppEngine};
use crate::application::events::{EventBus, StationEvent};
use crate::application::services::{services_for, IncomingRequestService, StopReason};
use crate::application::{meter_values, operations, reservations};
use crate::config::SimulatorConfig;
use crate::domain::configuration::HEARTBEAT_INTERVAL_KEY;
use crate::domain::connector::ConnectorStatusKind;
use crate::domain::template::FirmwareStatus;
use crate::infrastructure::channel::{ChannelEvent, ChannelSink, WebSocketChannel};
use crate::infrastructure::reconciler::{reconcile, upgraded_firmware_version};
use crate::support::cache::FileCache;
use crate::support::errors::StationInitError;
use crate::support::shutdown::ShutdownSignal;
use crate::support::statistics::StatisticsRegistry;

pub use context::{BootResponse, RegistrationStatus, ResetKind, RuntimeCommand, StationContext};

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(180);

#[derive(Default)]
struct Timers {
    run: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    ws_ping: Option<JoinHandle<()>>,
    reservation_sweep: Option<JoinHandle<()>>,
}

/// One simulated charging station.
pub struct Station {
    index: u32,
    template_path: PathBuf,
    simulator: SimulatorConfig,
    cache: Arc<FileCache>,
    pub ctx: Arc<StationContext>,
    incoming: Arc<dyn IncomingRequestService>,
    generator: Arc<dyn TransactionGenerator>,
    sink: Arc<StdMutex<Option<ChannelSink>>>,
    timers: StdMutex<Timers>,
    shutdown: StdMutex<Option<ShutdownSignal>>,
    auto_reconnect_retry_count: AtomicU32,
}

impl Station {
    /// Initialize a station from its template. Fatal template problems
    /// abort this station only.
    pub fn new(
        index: u32,
        template_path: impl Into<PathBuf>,
        simulator: SimulatorConfig,
        cache: Arc<FileCache>,
        events: EventBus,
    ) -> Result<Arc<Self>, StationInitError> {
        let template_path = template_path.into();

        // First pass derives the station identity so the persisted
        // configuration can be located; the second pass merges it in.
        let preliminary = reconcile(&template_path, index, &cache, None)?;
        let configuration_file = crate::infrastructure::persistence::ConfigurationFile::new(
            &simulator.configuration_directory,
            &preliminary.info.hash_id,
        );
        let persisted = match configuration_file.load() {
            Ok(persisted) => persisted,
            Err(e) => {
                warn!(
                    station_id = preliminary.info.station_id.as_str(),
                    error = %e,
                    "Ignoring unreadable configuration file"
                );
                None
            }
        };
        let mut reconciled = reconcile(&template_path, index, &cache, persisted.as_ref())?;

        if reconciled.info.supervision_urls.is_empty() {
            reconciled.info.supervision_urls = simulator.supervision_urls.clone();
        }
        if reconciled.info.supervision_urls.is_empty() {
            return Err(StationInitError::MissingSupervisionUrl(
                reconciled.info.station_id,
            ));
        }

        let statistics = Arc::new(StatisticsRegistry::new(reconciled.info.enable_statistics));
        let engine = Arc::new(OcppEngine::new(
            reconciled.info.station_id.clone(),
            statistics,
            simulator.response_timeout(),
            simulator.flush_interval(),
        ));
        let (request, incoming) = services_for(reconciled.info.ocpp_version);

        let atg_configuration = persisted
            .as_ref()
            .filter(|_| {
                reconciled
                    .info
                    .automatic_transaction_generator_persistent_configuration
            })
            .and_then(|p| p.automatic_transaction_generator.clone())
            .or(reconciled.automatic_transaction_generator);

        let id_tags = load_id_tags(&template_path, reconciled.info.id_tags_file.as_deref());

        let ctx = Arc::new(StationContext::new(
            reconciled.info,
            reconciled.connectors,
            reconciled.configuration,
            atg_configuration.clone(),
            engine,
            request,
            events,
            simulator.configuration_directory.clone(),
        ));
        *ctx.id_tags.write().unwrap() = id_tags;

        let generator: Arc<dyn TransactionGenerator> =
            AutomaticTransactionGenerator::new(ctx.clone(), atg_configuration.unwrap_or_default());

        Ok(Arc::new(Self {
            index,
            template_path,
            simulator,
            cache,
            ctx,
            incoming,
            generator,
            sink: Arc::new(StdMutex::new(None)),
            timers: StdMutex::new(Timers::default()),
            shutdown: StdMutex::new(None),
            auto_reconnect_retry_count: AtomicU32::new(0),
        }))
    }

    pub fn station_id(&self) -> String {
        self.ctx.station_id()
    }

    // ── Lifecycle ──────────────────────────────────────────────

    /// Start the station: spawn the connection loop and the background
    /// sweeps. Returns immediately; progress is reported through events.
    pub fn start(self: &Arc<Self>) {
        if !self.ctx.begin_start() {
            warn!(
                station_id = self.station_id().as_str(),
                "Start ignored, station is already started or starting"
            );
            return;
        }
        info!(station_id = self.station_id().as_str(), "Starting station");

        let shutdown = ShutdownSignal::new(self.station_id());
        *self.shutdown.lock().unwrap() = Some(shutdown.clone());

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        self.ctx.set_runtime_command_sender(commands_tx);

        let mut timers = self.timers.lock().unwrap();
        timers.reservation_sweep = Some(reservations::start_expiry_sweep(
            self.ctx.clone(),
            shutdown.clone(),
        ));
        let station = self.clone();
        timers.run = Some(tokio::spawn(async move {
            station.run(commands_rx, shutdown).await;
        }));
        drop(timers);

        self.ctx.mark_started();
        self.ctx.events.publish(StationEvent::Started {
            station_id: self.station_id(),
        });
    }

    /// Stop the station: optionally stop running transactions, report the
    /// connectors unavailable, close the channel, persist configuration.
    pub async fn stop(self: &Arc<Self>, reason: Option<StopReason>, stop_transactions: Option<bool>) {
        if !self.ctx.begin_stop() {
            debug!(
                station_id = self.station_id().as_str(),
                "Stop ignored, station is not started"
            );
            return;
        }
        info!(station_id = self.station_id().as_str(), "Stopping station");

        self.generator.stop(None);

        let stop_transactions = stop_transactions
            .unwrap_or_else(|| self.ctx.info.read().unwrap().stop_transactions_on_stopped);
        let connector_ids = {
            let connectors = self.ctx.connectors.lock().unwrap();
            connectors.chargeable_connector_ids()
        };
        if self.ctx.engine.channel_open() {
            if stop_transactions {
                for connector_id in &connector_ids {
                    let _ = operations::stop_transaction(&self.ctx, *connector_id, reason).await;
                }
            }
            for connector_id in &connector_ids {
                operations::send_status_notification(
                    &self.ctx,
                    *connector_id,
                    ConnectorStatusKind::Unavailable,
                )
                .await;
            }
        } else {
            // channel already gone: release the transactions locally
            let mut connectors = self.ctx.connectors.lock().unwrap();
            for connector_id in &connector_ids {
                if let Some(connector) = connectors.connector_mut(*connector_id) {
                    if connector.has_transaction() {
                        connector.stop_transaction();
                    }
                }
            }
        }

        if let Some(shutdown) = self.shutdown.lock().unwrap().take() {
            shutdown.trigger();
        }
        meter_values::stop_all_sampling(&self.ctx);
        self.stop_connection_timers();
        {
            let mut timers = self.timers.lock().unwrap();
            if let Some(task) = timers.reservation_sweep.take() {
                task.abort();
            }
            if let Some(task) = timers.run.take() {
                task.abort();
            }
        }
        if let Some(sink) = self.sink.lock().unwrap().take() {
            sink.close();
        }
        self.ctx.engine.shutdown();

        self.ctx.save_configuration().await;
        self.ctx.mark_stopped();
        self.ctx.events.publish(StationEvent::Stopped {
            station_id: self.station_id(),
            reason: reason.map(|r| format!("{r:?}")),
        });
    }

    /// Stop, wait `resetTime`, reinitialize from the template, start again.
    pub async fn reset(self: &Arc<Self>, kind: ResetKind) {
        info!(
            station_id = self.station_id().as_str(),
            kind = ?kind,
            "Resetting station"
        );
        let reset_time = Duration::from_secs(self.ctx.info.read().unwrap().reset_time_secs);
        self.stop(Some(StopReason::Reboot), Some(true)).await;
        tokio::time::sleep(reset_time).await;
        if let Err(e) = self.reinitialize() {
            error!(
                station_id = self.station_id().as_str(),
                error = %e,
                "Reinitialization after reset failed"
            );
            return;
        }
        self.start();
    }

    fn reinitialize(&self) -> Result<(), StationInitError> {
        let persisted = self.ctx.configuration_file().load().unwrap_or_default();
        let reconciled = reconcile(
            &self.template_path,
            self.index,
            &self.cache,
            persisted.as_ref(),
        )?;
        let mut info = reconciled.info;
        if info.supervision_urls.is_empty() {
            info.supervision_urls = self.simulator.supervision_urls.clone();
        }
        *self.ctx.info.write().unwrap() = info;
        *self.ctx.connectors.lock().unwrap() = reconciled.connectors;
        *self.ctx.configuration.lock().unwrap() = reconciled.configuration;
        if let Some(atg) = reconciled.automatic_transaction_generator {
            *self.ctx.atg_configuration.lock().unwrap() = Some(atg);
        }
        Ok(())
    }

    // ── Connection loop ────────────────────────────────────────

    async fn run(
        self: Arc<Self>,
        mut commands: mpsc::UnboundedReceiver<RuntimeCommand>,
        shutdown: ShutdownSignal,
    ) {
        'connection: loop {
            if shutdown.is_triggered() {
                break;
            }

            let (url, version, station_id) = {
                let info = self.ctx.info.read().unwrap();
                let urls = &info.supervision_urls;
                (
                    urls[self.index as usize % urls.len()].clone(),
                    info.ocpp_version,
                    info.station_id.clone(),
                )
            };
            let mut channel = WebSocketChannel::new(&url, &station_id, version);
            if let Some(auth) = &self.simulator.basic_auth {
                channel = channel.with_basic_auth(auth.user.clone(), auth.password.clone());
            }

            let connected = tokio::time::timeout(
                self.simulator.connection_timeout(),
                channel.connect(),
            )
            .await;
            let (sink, events_rx) = match connected {
                Ok(Ok(channel)) => channel,
                Ok(Err(e)) => {
                    warn!(
                        station_id = station_id.as_str(),
                        url = url.as_str(),
                        error = %e,
                        "Connection failed"
                    );
                    if !self.wait_before_reconnect(&shutdown).await {
                        break 'connection;
                    }
                    continue;
                }
                Err(_) => {
                    warn!(
                        station_id = station_id.as_str(),
                        url = url.as_str(),
                        "Connection attempt timed out"
                    );
                    if !self.wait_before_reconnect(&shutdown).await {
                        break 'connection;
                    }
                    continue;
                }
            };

            *self.sink.lock().unwrap() = Some(sink.clone());
            self.ctx.engine.attach_channel(sink);
            self.ctx.events.publish(StationEvent::Connected {
                station_id: station_id.clone(),
            });

            let mut receive = tokio::spawn(receive_loop(
                self.ctx.clone(),
                self.incoming.clone(),
                events_rx,
            ));

            if register(&self.ctx, &shutdown).await {
                self.auto_reconnect_retry_count.store(0, Ordering::SeqCst);
                self.ctx.engine.set_registered(true);
                self.on_accepted().await;
            } else if !shutdown.is_triggered() {
                warn!(
                    station_id = station_id.as_str(),
                    "Registration did not reach Accepted, closing the channel"
                );
                if let Some(sink) = self.sink.lock().unwrap().take() {
                    sink.close();
                }
            }

            // operate until the channel drops, a command arrives, or stop
            loop {
                tokio::select! {
                    _ = &mut receive => break,
                    command = commands.recv() => match command {
                        Some(RuntimeCommand::Reset(kind)) => {
                            let station = self.clone();
                            tokio::spawn(async move { station.reset(kind).await });
                        }
                        Some(RuntimeCommand::RestartHeartbeat) => self.restart_heartbeat(),
                        Some(RuntimeCommand::RestartWebSocketPing) => self.restart_ws_ping(),
                        None => break,
                    },
                    _ = shutdown.notified().wait() => {
                        receive.abort();
                        break 'connection;
                    }
                }
            }

            // channel went away
            self.stop_connection_timers();
            self.generator.stop(None);
            meter_values::stop_all_sampling(&self.ctx);
            self.ctx.engine.handle_channel_closed();
            self.ctx.events.publish(StationEvent::Disconnected {
                station_id: station_id.clone(),
                reason: None,
            });
            if shutdown.is_triggered() {
                break;
            }
            if !self.wait_before_reconnect(&shutdown).await {
                break;
            }
        }
        debug!(
            station_id = self.station_id().as_str(),
            "Connection loop ended"
        );
    }

    /// Sleep the reconnect backoff. Returns `false` when the retry budget
    /// is exhausted or shutdown intervened.
    async fn wait_before_reconnect(&self, shutdown: &ShutdownSignal) -> bool {
        let (max_retries, exponential) = {
            let info = self.ctx.info.read().unwrap();
            (
                info.auto_reconnect_max_retries,
                info.reconnect_exponential_delay,
            )
        };
        let retry = self.auto_reconnect_retry_count.fetch_add(1, Ordering::SeqCst) + 1;
        if max_retries >= 0 && retry > max_retries as u32 {
            error!(
                station_id = self.station_id().as_str(),
                retry, "Reconnect retries exhausted"
            );
            return false;
        }
        let delay = if exponential {
            exponential_delay(retry)
        } else {
            self.simulator.connection_timeout()
        };
        info!(
            station_id = self.station_id().as_str(),
            retry,
            delay_ms = delay.as_millis() as u64,
            "Waiting before reconnect"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = shutdown.notified().wait() => false,
        }
    }

    // ── Registered-accepted sequence ───────────────────────────

    async fn on_accepted(self: &Arc<Self>) {
        let heartbeat_interval_secs = self.ctx.heartbeat_interval().as_secs();
        self.ctx.events.publish(StationEvent::Accepted {
            station_id: self.station_id(),
            heartbeat_interval_secs,
        });
        self.restart_heartbeat();
        self.restart_ws_ping();
        boot_sequence(&self.ctx).await;
        self.generator.start(None);
        self.ctx.engine.flush_buffer().await;
        self.ctx.engine.ensure_flush_task();
    }

    fn restart_heartbeat(&self) {
        let mut timers = self.timers.lock().unwrap();
        if let Some(task) = timers.heartbeat.take() {
            task.abort();
        }
        let ctx = self.ctx.clone();
        let interval = ctx.heartbeat_interval();
        info!(
            station_id = self.station_id().as_str(),
            interval_secs = interval.as_secs(),
            "Heartbeat timer started"
        );
        timers.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                // a buffered heartbeat must not stall the timer
                let beat_ctx = ctx.clone();
                tokio::spawn(async move {
                    let request = beat_ctx.request.heartbeat();
                    if let Err(e) = beat_ctx
                        .engine
                        .call(request.action, request.payload, CallOptions::default())
                        .await
                    {
                        warn!(
                            station_id = beat_ctx.station_id().as_str(),
                            error = %e,
                            "Heartbeat failed"
                        );
                    }
                });
            }
        }));
    }

    fn restart_ws_ping(&self) {
        let mut timers = self.timers.lock().unwrap();
        if let Some(task) = timers.ws_ping.take() {
            task.abort();
        }
        let Some(interval) = self.ctx.web_socket_ping_interval() else {
            return;
        };
        let sink = self.sink.clone();
        let station_id = self.station_id();
        timers.ws_ping = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let sink = sink.lock().unwrap().clone();
                match sink {
                    Some(sink) => {
                        if let Err(e) = sink.ping() {
                            warn!(
                                station_id = station_id.as_str(),
                                error = %e,
                                "WebSocket ping failed"
                            );
                        }
                    }
                    None => break,
                }
            }
        }));
    }

    fn stop_connection_timers(&self) {
        let mut timers = self.timers.lock().unwrap();
        if let Some(task) = timers.heartbeat.take() {
            task.abort();
        }
        if let Some(task) = timers.ws_ping.take() {
            task.abort();
        }
    }
}

/// Pump inbound channel events into the engine until the channel closes.
async fn receive_loop(
    ctx: Arc<StationContext>,
    incoming: Arc<dyn IncomingRequestService>,
    mut events: mpsc::UnboundedReceiver<ChannelEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ChannelEvent::Frame(text) => {
                ctx.engine.handle_frame(&text, incoming.as_ref(), &ctx).await;
            }
            ChannelEvent::Pong => {
                debug!(station_id = ctx.station_id().as_str(), "Pong received");
            }
            ChannelEvent::Closed { reason } => {
                warn!(
                    station_id = ctx.station_id().as_str(),
                    reason = ?reason,
                    "Channel closed"
                );
                return;
            }
        }
    }
}

/// BootNotification registration loop. Returns `true` once the central
/// system answers Accepted; bounded by `registrationMaxRetries`.
pub(crate) async fn register(ctx: &Arc<StationContext>, shutdown: &ShutdownSignal) -> bool {
    let (auto_register, max_retries) = {
        let info = ctx.info.read().unwrap();
        (info.auto_register, info.registration_max_retries)
    };
    let mut retry_count: i32 = 0;

    loop {
        if shutdown.is_triggered() {
            return false;
        }
        let request = {
            let info = ctx.info.read().unwrap();
            ctx.request.boot_notification(&info)
        };
        let outcome = ctx
            .engine
            .call(
                request.action,
                request.payload,
                CallOptions {
                    skip_buffering_on_error: true,
                    ..Default::default()
                },
            )
            .await;

        let boot = match outcome {
            Ok(payload) => match ctx.request.parse_boot_response(&payload) {
                Ok(boot) => boot,
                Err(e) => {
                    warn!(
                        station_id = ctx.station_id().as_str(),
                        error = %e,
                        "Unparseable BootNotification response"
                    );
                    BootResponse {
                        status: RegistrationStatus::Rejected,
                        interval_secs: 0,
                        current_time: None,
                    }
                }
            },
            Err(e) => {
                warn!(
                    station_id = ctx.station_id().as_str(),
                    error = %e,
                    "BootNotification failed"
                );
                if auto_register {
                    // the station considers itself registered anyway
                    ctx.set_boot_response(BootResponse {
                        status: RegistrationStatus::Accepted,
                        interval_secs: 0,
                        current_time: None,
                    });
                    return true;
                }
                BootResponse {
                    status: RegistrationStatus::Rejected,
                    interval_secs: 0,
                    current_time: None,
                }
            }
        };

        ctx.set_boot_response(boot.clone());
        ctx.events.publish(StationEvent::Registered {
            station_id: ctx.station_id(),
            status: format!("{:?}", boot.status),
        });

        match boot.status {
            RegistrationStatus::Accepted => {
                if boot.interval_secs > 0 {
                    // the accepted interval becomes the heartbeat period
                    let mut configuration = ctx.configuration.lock().unwrap();
                    configuration.add(
                        crate::domain::ConfigurationKey {
                            key: HEARTBEAT_INTERVAL_KEY.to_string(),
                            value: boot.interval_secs.to_string(),
                            readonly: false,
                            visible: true,
                            reboot: false,
                        },
                        true,
                    );
                }
                info!(
                    station_id = ctx.station_id().as_str(),
                    interval_secs = boot.interval_secs,
                    "Registration accepted"
                );
                return true;
            }
            status @ (RegistrationStatus::Pending
            | RegistrationStatus::Rejected
            | RegistrationStatus::Unregistered) => {
                if auto_register && status != RegistrationStatus::Pending {
                    ctx.set_boot_response(BootResponse {
                        status: RegistrationStatus::Accepted,
                        ..boot
                    });
                    return true;
                }
                retry_count += 1;
                if max_retries >= 0 && retry_count > max_retries {
                    error!(
                        station_id = ctx.station_id().as_str(),
                        retry_count, "Registration retries exhausted"
                    );
                    return false;
                }
                let wait = Duration::from_secs(boot.interval_secs.max(1));
                info!(
                    station_id = ctx.station_id().as_str(),
                    status = ?status,
                    retry_count,
                    wait_secs = wait.as_secs(),
                    "Registration not accepted yet, retrying"
                );
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.notified().wait() => return false,
                }
            }
        }
    }
}

/// Post-acceptance boot message sequence: per-connector status
/// notifications and the firmware Installing→Installed transition.
pub(crate) async fn boot_sequence(ctx: &Arc<StationContext>) {
    let connector_ids = {
        let connectors = ctx.connectors.lock().unwrap();
        connectors.chargeable_connector_ids()
    };
    for connector_id in connector_ids {
        let status = operations::boot_connector_status(ctx, connector_id);
        operations::send_status_notification(ctx, connector_id, status).await;
    }

    let installing = ctx.info.read().unwrap().firmware_status == FirmwareStatus::Installing;
    if installing {
        let upgraded = {
            let info = ctx.info.read().unwrap();
            upgraded_firmware_version(&info)
        };
        {
            let mut info = ctx.info.write().unwrap();
            info.firmware_status = FirmwareStatus::Installed;
            if let Some(version) = upgraded {
                info!(
                    station_id = info.station_id.as_str(),
                    version = version.as_str(),
                    "Firmware upgrade finished"
                );
                info.firmware_version = Some(version);
            }
        }
        let request = ctx
            .request
            .firmware_status_notification(FirmwareStatus::Installed);
        let _ = ctx
            .engine
            .call(request.action, request.payload, CallOptions::default())
            .await;
    }
}

/// Exponential backoff for reconnect attempts, capped.
fn exponential_delay(retry: u32) -> Duration {
    let millis = 1000u64.saturating_mul(1u64 << retry.min(16));
    Duration::from_millis(millis).min(MAX_RECONNECT_DELAY)
}

fn load_id_tags(template_path: &std::path::Path, id_tags_file: Option<&str>) -> Vec<String> {
    let Some(file) = id_tags_file else {
        return Vec::new();
    };
    let path = template_path
        .parent()
        .map(|dir| dir.join(file))
        .unwrap_or_else(|| PathBuf::from(file));
    match std::fs::read(&path) {
        Ok(bytes) => match serde_json::from_slice::<Vec<String>>(&bytes) {
            Ok(tags) => tags,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Malformed id tags file");
                Vec::new()
            }
        },
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Cannot read id tags file");
            Vec::new()
        }
    }
}

// ── Test harness ───────────────────────────────────────────────
