//! OCPP message engine
//!
//! Owns the request/response plumbing of one station: message-id
//! allocation, the pending-request cache, the outgoing buffer with its
//! periodic flush, inbound-frame dispatch and the CALLERROR envelope.
//!
//! Outbound CALLs are serialized by a per-station send permit held until
//! the response (or timeout) lands, per the OCPP-J one-in-flight rule.
//! CALLRESULT/CALLERROR responses bypass the permit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::application::services::IncomingRequestService;
use crate::infrastructure::channel::ChannelSink;
use crate::station::context::StationContext;
use crate::support::errors::EngineError;
use crate::support::frame::{ErrorCode, Frame};
use crate::support::statistics::StatisticsRegistry;

/// Per-call knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallOptions {
    /// Fail fast instead of parking the frame in the outgoing buffer when
    /// the channel is closed or the write fails.
    pub skip_buffering_on_error: bool,
    /// Override of the engine-wide response timeout.
    pub response_timeout: Option<Duration>,
}

struct PendingRequest {
    action: String,
    request_payload: Value,
    responder: oneshot::Sender<Result<Value, EngineError>>,
    sent_at: Instant,
}

#[derive(Debug, Clone)]
struct BufferedFrame {
    message_id: String,
    frame: String,
}

/// Message engine for a single station.
pub struct OcppEngine {
    station_id: String,
    sink: StdRwLock<Option<ChannelSink>>,
    pending: DashMap<String, PendingRequest>,
    buffer: StdMutex<Vec<BufferedFrame>>,
    send_permit: Mutex<()>,
    registered: AtomicBool,
    statistics: Arc<StatisticsRegistry>,
    response_timeout: Duration,
    flush_interval: Duration,
    flush_task: StdMutex<Option<JoinHandle<()>>>,
}

impl OcppEngine {
    pub fn new(
        station_id: impl Into<String>,
        statistics: Arc<StatisticsRegistry>,
        response_timeout: Duration,
        flush_interval: Duration,
    ) -> Self {
        Self {
            station_id: station_id.into(),
            sink: StdRwLock::new(None),
            pending: DashMap::new(),
            buffer: StdMutex::new(Vec::new()),
            send_permit: Mutex::new(()),
            registered: AtomicBool::new(false),
            statistics,
            response_timeout,
            flush_interval,
            flush_task: StdMutex::new(None),
        }
    }

    pub fn statistics(&self) -> &Arc<StatisticsRegistry> {
        &self.statistics
    }

    // ── Channel wiring ─────────────────────────────────────────

    pub fn attach_channel(&self, sink: ChannelSink) {
        *self.sink.write().unwrap() = Some(sink);
    }

    pub fn channel_open(&self) -> bool {
        self.sink
            .read()
            .unwrap()
            .as_ref()
            .map(ChannelSink::is_open)
            .unwrap_or(false)
    }

    pub fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::SeqCst);
    }

    fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    /// Reject in-flight requests after an abnormal channel close. Requests
    /// parked in the outgoing buffer stay pending for the next flush.
    pub fn handle_channel_closed(&self) {
        self.set_registered(false);
        let buffered: Vec<String> = self
            .buffer
            .lock()
            .unwrap()
            .iter()
            .map(|b| b.message_id.clone())
            .collect();
        let in_flight: Vec<String> = self
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| !buffered.contains(id))
            .collect();
        for message_id in in_flight {
            if let Some((_, pending)) = self.pending.remove(&message_id) {
                self.statistics.record_error(&pending.action);
                let _ = pending.responder.send(Err(EngineError::ChannelClosed));
            }
        }
    }

    /// Drop everything: buffered frames, pending requests, the flush task.
    /// Used by `stop()`.
    pub fn shutdown(&self) {
        self.set_registered(false);
        if let Some(task) = self.flush_task.lock().unwrap().take() {
            task.abort();
        }
        self.buffer.lock().unwrap().clear();
        let pending_ids: Vec<String> =
            self.pending.iter().map(|entry| entry.key().clone()).collect();
        for message_id in pending_ids {
            if let Some((_, pending)) = self.pending.remove(&message_id) {
                let _ = pending.responder.send(Err(EngineError::ChannelClosed));
            }
        }
        *self.sink.write().unwrap() = None;
    }

    // ── Send path ──────────────────────────────────────────────

    /// Issue a CALL and wait for its CALLRESULT/CALLERROR.
    ///
    /// With buffering allowed and the channel closed (or the write
    /// failing), the frame lands in the outgoing buffer and the returned
    /// future stays pending until a later flush delivers a response.
    pub async fn call(
        self: &Arc<Self>,
        action: &str,
        payload: Value,
        options: CallOptions,
    ) -> Result<Value, EngineError> {
        let message_id = Uuid::new_v4().to_string();
        let frame = Frame::call(message_id.clone(), action, payload.clone()).serialize();

        let (responder, response) = oneshot::channel();
        self.pending.insert(
            message_id.clone(),
            PendingRequest {
                action: action.to_string(),
                request_payload: payload,
                responder,
                sent_at: Instant::now(),
            },
        );
        self.statistics.record_request(action, frame.len());

        // One outbound CALL in flight at a time.
        let permit = self.send_permit.lock().await;

        if !self.channel_open() {
            drop(permit);
            return if options.skip_buffering_on_error {
                self.pending.remove(&message_id);
                Err(EngineError::ChannelClosed)
            } else {
                self.push_to_buffer(&message_id, &frame);
                self.await_deferred(response).await
            };
        }

        let send_result = {
            let sink = self.sink.read().unwrap().clone();
            match sink {
                Some(sink) => sink.send(frame.clone()).map_err(|e| e.to_string()),
                None => Err("channel detached".to_string()),
            }
        };
        if let Err(reason) = send_result {
            drop(permit);
            return if options.skip_buffering_on_error {
                self.pending.remove(&message_id);
                self.statistics.record_error(action);
                Err(EngineError::SendFailed(reason))
            } else {
                self.push_to_buffer(&message_id, &frame);
                self.await_deferred(response).await
            };
        }

        debug!(
            station_id = self.station_id.as_str(),
            action,
            message_id = message_id.as_str(),
            "CALL sent"
        );

        let timeout = options.response_timeout.unwrap_or(self.response_timeout);
        let outcome = match tokio::time::timeout(timeout, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EngineError::ChannelClosed),
            Err(_) => {
                self.pending.remove(&message_id);
                self.statistics.record_error(action);
                warn!(
                    station_id = self.station_id.as_str(),
                    action,
                    message_id = message_id.as_str(),
                    "CALL timed out"
                );
                Err(EngineError::Timeout)
            }
        };
        drop(permit);
        outcome
    }

    async fn await_deferred(
        self: &Arc<Self>,
        response: oneshot::Receiver<Result<Value, EngineError>>,
    ) -> Result<Value, EngineError> {
        self.ensure_flush_task();
        match response.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::ChannelClosed),
        }
    }

    fn push_to_buffer(&self, message_id: &str, frame: &str) {
        let mut buffer = self.buffer.lock().unwrap();
        if buffer.iter().all(|b| b.message_id != message_id) {
            buffer.push(BufferedFrame {
                message_id: message_id.to_string(),
                frame: frame.to_string(),
            });
            info!(
                station_id = self.station_id.as_str(),
                message_id,
                buffered = buffer.len(),
                "Frame buffered while channel unavailable"
            );
        }
    }

    pub fn buffered_frame_count(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    // ── Outgoing buffer flush ──────────────────────────────────

    /// Spawn the periodic flush task unless one is already running. The
    /// task exits once the buffer drains empty.
    pub fn ensure_flush_task(self: &Arc<Self>) {
        let mut slot = self.flush_task.lock().unwrap();
        if slot.as_ref().map(|t| !t.is_finished()).unwrap_or(false) {
            return;
        }
        let engine = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(engine.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first tick fires immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                engine.flush_buffer().await;
                if engine.buffered_frame_count() == 0 {
                    break;
                }
            }
        }));
    }

    /// Drain the outgoing buffer. Gated on the channel being open and the
    /// station being registered-accepted.
    pub async fn flush_buffer(&self) {
        if !self.channel_open() || !self.is_registered() {
            return;
        }
        let frames: Vec<BufferedFrame> = self.buffer.lock().unwrap().clone();
        if frames.is_empty() {
            return;
        }
        info!(
            station_id = self.station_id.as_str(),
            frames = frames.len(),
            "Flushing outgoing buffer"
        );
        for buffered in frames {
            let _permit = self.send_permit.lock().await;
            let sink = self.sink.read().unwrap().clone();
            let Some(sink) = sink.filter(ChannelSink::is_open) else {
                return;
            };
            match sink.send(buffered.frame.clone()) {
                Ok(()) => {
                    let mut buffer = self.buffer.lock().unwrap();
                    buffer.retain(|b| b.message_id != buffered.message_id);
                    // re-arm the round-trip measurement from the actual send
                    if let Some(mut pending) = self.pending.get_mut(&buffered.message_id) {
                        pending.sent_at = Instant::now();
                    }
                }
                Err(e) => {
                    warn!(
                        station_id = self.station_id.as_str(),
                        error = %e,
                        "Buffer flush interrupted"
                    );
                    return;
                }
            }
        }
    }

    // ── Receive path ───────────────────────────────────────────

    /// Dispatch one inbound text frame.
    pub async fn handle_frame(
        &self,
        text: &str,
        service: &dyn IncomingRequestService,
        ctx: &Arc<StationContext>,
    ) {
        let frame = match Frame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(
                    station_id = self.station_id.as_str(),
                    error = %e,
                    frame = text,
                    "Rejecting malformed inbound frame"
                );
                self.respond(Frame::call_error("", e.error_code(), e.to_string()));
                return;
            }
        };

        match frame {
            Frame::Call {
                message_id,
                action,
                payload,
            } => {
                if !self.is_registered() {
                    self.respond(Frame::call_error(
                        message_id,
                        ErrorCode::SecurityError,
                        "Charging station is not registered with the central system",
                    ));
                    return;
                }
                let reply = match service.handle(ctx, &action, payload).await {
                    Ok(payload) => Frame::call_result(message_id, payload),
                    Err(e) => {
                        error!(
                            station_id = self.station_id.as_str(),
                            action = action.as_str(),
                            code = e.code.as_str(),
                            description = e.description.as_str(),
                            "Incoming request failed"
                        );
                        Frame::CallError {
                            message_id,
                            error_code: e.code,
                            error_description: e.description,
                            error_details: e.details,
                        }
                    }
                };
                self.respond(reply);
            }
            Frame::CallResult {
                message_id,
                payload,
            } => match self.pending.remove(&message_id) {
                Some((_, pending)) => {
                    self.statistics
                        .record_response(&pending.action, pending.sent_at.elapsed());
                    debug!(
                        station_id = self.station_id.as_str(),
                        action = pending.action.as_str(),
                        message_id = message_id.as_str(),
                        "CALLRESULT received"
                    );
                    let _ = pending.responder.send(Ok(payload));
                }
                None => warn!(
                    station_id = self.station_id.as_str(),
                    message_id = message_id.as_str(),
                    "CALLRESULT for unknown request"
                ),
            },
            Frame::CallError {
                message_id,
                error_code,
                error_description,
                ..
            } => match self.pending.remove(&message_id) {
                Some((_, pending)) => {
                    self.statistics.record_error(&pending.action);
                    warn!(
                        station_id = self.station_id.as_str(),
                        action = pending.action.as_str(),
                        message_id = message_id.as_str(),
                        code = error_code.as_str(),
                        description = error_description.as_str(),
                        request = %pending.request_payload,
                        "CALLERROR received"
                    );
                    let _ = pending.responder.send(Err(EngineError::CallError {
                        code: error_code,
                        description: error_description,
                    }));
                }
                None => warn!(
                    station_id = self.station_id.as_str(),
                    message_id = message_id.as_str(),
                    "CALLERROR for unknown request"
                ),
            },
        }
    }

    /// Write a response frame. Responses are never buffered.
    pub fn respond(&self, frame: Frame) {
        let sink = self.sink.read().unwrap().clone();
        match sink {
            Some(sink) => {
                if let Err(e) = sink.send(frame.serialize()) {
                    error!(
                        station_id = self.station_id.as_str(),
                        error = %e,
                        "Failed to send response frame"
                    );
                }
            }
            None => error!(
                station_id = self.station_id.as_str(),
                "Dropping response frame, channel detached"
            ),
        }
    }

    pub fn pending_request_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::channel::memory_channel;
    use crate::station::testing;

    #[tokio::test]
    async fn call_resolves_on_call_result() {
        let (ctx, mut peer, _events) = testing::context_with_peer();
        let engine = ctx.engine.clone();

        let pending_call = tokio::spawn({
            let engine = engine.clone();
            async move {
                engine
                    .call("Heartbeat", serde_json::json!({}), CallOptions::default())
                    .await
            }
        });

        let sent = peer.sent.recv().await.unwrap();
        let frame = Frame::parse(&sent).unwrap();
        assert!(frame.is_call());
        let service = testing::incoming_service(&ctx);
        engine
            .handle_frame(
                &Frame::call_result(
                    frame.message_id(),
                    serde_json::json!({"currentTime": "2024-01-01T00:00:00Z"}),
                )
                .serialize(),
                service.as_ref(),
                &ctx,
            )
            .await;

        let result = pending_call.await.unwrap().unwrap();
        assert_eq!(result["currentTime"], "2024-01-01T00:00:00Z");
        assert_eq!(engine.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn call_error_rejects_the_pending_request() {
        let (ctx, mut peer, _events) = testing::context_with_peer();
        let engine = ctx.engine.clone();

        let pending_call = tokio::spawn({
            let engine = engine.clone();
            async move {
                engine
                    .call("Heartbeat", serde_json::json!({}), CallOptions::default())
                    .await
            }
        });

        let sent = peer.sent.recv().await.unwrap();
        let frame = Frame::parse(&sent).unwrap();
        let service = testing::incoming_service(&ctx);
        engine
            .handle_frame(
                &Frame::call_error(frame.message_id(), ErrorCode::InternalError, "boom")
                    .serialize(),
                service.as_ref(),
                &ctx,
            )
            .await;

        match pending_call.await.unwrap() {
            Err(EngineError::CallError { code, .. }) => {
                assert_eq!(code, ErrorCode::InternalError)
            }
            other => panic!("expected CallError, got {other:?}"),
        }
        assert_eq!(engine.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn timeout_removes_the_cache_entry() {
        let (ctx, _peer, _events) = testing::context_with_peer();
        let engine = ctx.engine.clone();

        let result = engine
            .call(
                "Heartbeat",
                serde_json::json!({}),
                CallOptions {
                    response_timeout: Some(Duration::from_millis(20)),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(EngineError::Timeout)));
        assert_eq!(engine.pending_request_count(), 0);
    }

    #[tokio::test]
    async fn closed_channel_buffers_unless_told_otherwise() {
        let statistics = Arc::new(StatisticsRegistry::new(false));
        let engine = Arc::new(OcppEngine::new(
            "CS-TEST",
            statistics,
            Duration::from_secs(1),
            Duration::from_millis(50),
        ));
        // no channel attached at all

        let skipping = engine
            .call(
                "Heartbeat",
                serde_json::json!({}),
                CallOptions {
                    skip_buffering_on_error: true,
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(skipping, Err(EngineError::ChannelClosed)));
        assert_eq!(engine.buffered_frame_count(), 0);

        let deferred = tokio::spawn({
            let engine = engine.clone();
            async move {
                engine
                    .call("Heartbeat", serde_json::json!({}), CallOptions::default())
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.buffered_frame_count(), 1);
        assert_eq!(engine.pending_request_count(), 1);

        // station shutdown settles the deferred call
        engine.shutdown();
        assert!(matches!(
            deferred.await.unwrap(),
            Err(EngineError::ChannelClosed)
        ));
        assert_eq!(engine.buffered_frame_count(), 0);
    }

    #[tokio::test]
    async fn buffer_drains_after_reconnect_and_registration() {
        let statistics = Arc::new(StatisticsRegistry::new(false));
        let engine = Arc::new(OcppEngine::new(
            "CS-TEST",
            statistics,
            Duration::from_secs(5),
            Duration::from_millis(30),
        ));

        let deferred = tokio::spawn({
            let engine = engine.clone();
            async move {
                engine
                    .call("Heartbeat", serde_json::json!({}), CallOptions::default())
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.buffered_frame_count(), 1);

        // channel reopens and the station registers
        let (sink, _events, mut peer) = memory_channel();
        engine.attach_channel(sink);
        engine.set_registered(true);

        // within two flush intervals the frame goes out
        let sent =
            tokio::time::timeout(Duration::from_millis(120), peer.sent.recv())
                .await
                .expect("buffer flushed")
                .unwrap();
        assert_eq!(engine.buffered_frame_count(), 0);

        // and the deferred call settles once the response arrives
        let frame = Frame::parse(&sent).unwrap();
        let (ctx, _peer2, _events2) = testing::context_with_peer();
        let service = testing::incoming_service(&ctx);
        engine
            .handle_frame(
                &Frame::call_result(frame.message_id(), serde_json::json!({})).serialize(),
                service.as_ref(),
                &ctx,
            )
            .await;
        assert!(deferred.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn inbound_call_before_registration_is_a_security_error() {
        let (ctx, mut peer, _events) = testing::context_with_peer();
        let engine = ctx.engine.clone();
        engine.set_registered(false);

        let service = testing::incoming_service(&ctx);
        engine
            .handle_frame(
                &Frame::call("req-1", "Reset", serde_json::json!({"type": "Soft"})).serialize(),
                service.as_ref(),
                &ctx,
            )
            .await;

        let reply = peer.sent.recv().await.unwrap();
        match Frame::parse(&reply).unwrap() {
            Frame::CallError {
                message_id,
                error_code,
                ..
            } => {
                assert_eq!(message_id, "req-1");
                assert_eq!(error_code, ErrorCode::SecurityError);
            }
            other => panic!("expected CallError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn malformed_frame_is_answered_with_protocol_error() {
        let (ctx, mut peer, _events) = testing::context_with_peer();
        let engine = ctx.engine.clone();
        let service = testing::incoming_service(&ctx);

        engine
            .handle_frame(r#"{"not":"an array"}"#, service.as_ref(), &ctx)
            .await;

        let reply = peer.sent.recv().await.unwrap();
        match Frame::parse(&reply).unwrap() {
            Frame::CallError { error_code, .. } => {
                assert_eq!(error_code, ErrorCode::ProtocolError)
            }
            other => panic!("expected CallError, got {other:?}"),
        }
    }
}
