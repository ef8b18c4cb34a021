//! Bidirectional message channel to the central system
//!
//! The station runtime talks to its peer through a [`ChannelSink`] (outbound
//! text frames, pings, close) and a stream of [`ChannelEvent`]s (inbound
//! frames, close notifications). The production implementation is a
//! WebSocket client; [`memory_channel`] provides an in-process loopback used
//! by tests and embedded drivers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::domain::OcppVersion;

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("channel is not open")]
    NotOpen,
    #[error("invalid supervision URL: {0}")]
    InvalidUrl(String),
    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),
    #[error("send failed: {0}")]
    Send(String),
}

/// Inbound events surfaced to the station's receive loop.
#[derive(Debug)]
pub enum ChannelEvent {
    Frame(String),
    Pong,
    Closed { reason: Option<String> },
}

enum SinkCommand {
    Text(String),
    Ping,
    Close,
}

/// Cloneable handle for writing to the channel.
#[derive(Clone)]
pub struct ChannelSink {
    commands: mpsc::UnboundedSender<SinkCommand>,
    open: Arc<AtomicBool>,
}

impl ChannelSink {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub fn send(&self, text: String) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        self.commands
            .send(SinkCommand::Text(text))
            .map_err(|e| ChannelError::Send(e.to_string()))
    }

    pub fn ping(&self) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        self.commands
            .send(SinkCommand::Ping)
            .map_err(|e| ChannelError::Send(e.to_string()))
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.commands.send(SinkCommand::Close);
    }
}

/// WebSocket client channel settings.
#[derive(Debug, Clone)]
pub struct WebSocketChannel {
    /// Full connection URL: `<supervisionUrl>/<stationId>`.
    pub url: String,
    pub version: OcppVersion,
    /// Optional `user:password` HTTP Basic credentials.
    pub basic_auth: Option<(String, String)>,
}

impl WebSocketChannel {
    pub fn new(supervision_url: &str, station_id: &str, version: OcppVersion) -> Self {
        Self {
            url: format!("{}/{}", supervision_url.trim_end_matches('/'), station_id),
            version,
            basic_auth: None,
        }
    }

    pub fn with_basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), password.into()));
        self
    }

    /// Open the connection. Returns the write handle and the inbound event
    /// stream; reader/writer tasks live until the socket closes.
    pub async fn connect(
        &self,
    ) -> Result<(ChannelSink, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::InvalidUrl(e.to_string()))?;
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            self.version
                .subprotocol()
                .parse()
                .expect("static subprotocol header value"),
        );
        if let Some((user, password)) = &self.basic_auth {
            let credentials =
                base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
            request.headers_mut().insert(
                header::AUTHORIZATION,
                format!("Basic {credentials}")
                    .parse()
                    .map_err(|_| ChannelError::InvalidUrl("invalid credentials".into()))?,
            );
        }

        let ws_config = WebSocketConfig {
            max_message_size: Some(64 * 1024),
            ..Default::default()
        };
        let (ws_stream, response) =
            tokio_tungstenite::connect_async_with_config(request, Some(ws_config), false)
                .await
                .map_err(|e| ChannelError::Handshake(e.to_string()))?;

        let accepted = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted != Some(self.version.subprotocol()) {
            warn!(
                url = self.url.as_str(),
                requested = self.version.subprotocol(),
                accepted = ?accepted,
                "Central system did not confirm the requested OCPP subprotocol"
            );
        }
        info!(url = self.url.as_str(), "WebSocket channel open");

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (commands_tx, mut commands_rx) = mpsc::unbounded_channel::<SinkCommand>();
        let (events_tx, events_rx) = mpsc::unbounded_channel::<ChannelEvent>();
        let open = Arc::new(AtomicBool::new(true));

        // Writer task
        let writer_open = open.clone();
        tokio::spawn(async move {
            while let Some(command) = commands_rx.recv().await {
                let result = match command {
                    SinkCommand::Text(text) => {
                        debug!(frame = text.as_str(), "-> CS");
                        ws_tx.send(Message::Text(text)).await
                    }
                    SinkCommand::Ping => ws_tx.send(Message::Ping(Vec::new())).await,
                    SinkCommand::Close => {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = result {
                    error!(error = %e, "WebSocket write error");
                    break;
                }
            }
            writer_open.store(false, Ordering::SeqCst);
        });

        // Reader task
        let reader_open = open.clone();
        tokio::spawn(async move {
            while let Some(message) = ws_rx.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        debug!(frame = text.as_str(), "<- CS");
                        if events_tx.send(ChannelEvent::Frame(text)).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        let _ = events_tx.send(ChannelEvent::Pong);
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Frame(_)) => {}
                    Ok(Message::Binary(data)) => {
                        warn!(bytes = data.len(), "Ignoring binary WebSocket message");
                    }
                    Ok(Message::Close(frame)) => {
                        reader_open.store(false, Ordering::SeqCst);
                        let _ = events_tx.send(ChannelEvent::Closed {
                            reason: frame.map(|f| f.reason.to_string()),
                        });
                        return;
                    }
                    Err(e) => {
                        reader_open.store(false, Ordering::SeqCst);
                        let _ = events_tx.send(ChannelEvent::Closed {
                            reason: Some(e.to_string()),
                        });
                        return;
                    }
                }
            }
            reader_open.store(false, Ordering::SeqCst);
            let _ = events_tx.send(ChannelEvent::Closed { reason: None });
        });

        Ok((
            ChannelSink {
                commands: commands_tx,
                open,
            },
            events_rx,
        ))
    }
}

/// In-process peer of a [`memory_channel`], standing in for the central
/// system.
pub struct MemoryPeer {
    /// Frames the station wrote to the channel.
    pub sent: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    open: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Deliver a frame to the station as if the central system sent it.
    pub fn push_frame(&self, text: impl Into<String>) {
        let _ = self.events.send(ChannelEvent::Frame(text.into()));
    }

    /// Drop the connection from the peer side.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.events.send(ChannelEvent::Closed { reason: None });
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }
}

/// Loopback channel pair: the station side and the peer side.
pub fn memory_channel() -> (
    ChannelSink,
    mpsc::UnboundedReceiver<ChannelEvent>,
    MemoryPeer,
) {
    let (commands_tx, mut commands_rx) = mpsc::unbounded_channel::<SinkCommand>();
    let (events_tx, events_rx) = mpsc::unbounded_channel::<ChannelEvent>();
    let (sent_tx, sent_rx) = mpsc::unbounded_channel::<String>();
    let open = Arc::new(AtomicBool::new(true));

    let relay_open = open.clone();
    tokio::spawn(async move {
        while let Some(command) = commands_rx.recv().await {
            match command {
                SinkCommand::Text(text) => {
                    if sent_tx.send(text).is_err() {
                        break;
                    }
                }
                SinkCommand::Ping => {}
                SinkCommand::Close => {
                    relay_open.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }
    });

    (
        ChannelSink {
            commands: commands_tx,
            open: open.clone(),
        },
        events_rx,
        MemoryPeer {
            sent: sent_rx,
            events: events_tx,
            open,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_channel_relays_frames_both_ways() {
        let (sink, mut events, mut peer) = memory_channel();

        sink.send("[2,\"1\",\"Heartbeat\",{}]".to_string()).unwrap();
        let sent = peer.sent.recv().await.unwrap();
        assert!(sent.contains("Heartbeat"));

        peer.push_frame("[3,\"1\",{}]");
        match events.recv().await.unwrap() {
            ChannelEvent::Frame(text) => assert!(text.starts_with("[3")),
            other => panic!("expected frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_sink_rejects_sends() {
        let (sink, mut events, peer) = memory_channel();
        peer.close();
        match events.recv().await.unwrap() {
            ChannelEvent::Closed { .. } => {}
            other => panic!("expected close, got {other:?}"),
        }
        assert!(!sink.is_open());
        assert!(matches!(
            sink.send("frame".into()),
            Err(ChannelError::NotOpen)
        ));
    }
}
