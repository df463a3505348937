//! WebSocket connection lifecycle: one client from upgrade through teardown.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use parlor_core::{ErrorCode, ServerMessage};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::registry::PresenceRegistry;
use crate::session::Session;

/// How long teardown waits for the writer to flush its close frame.
const WRITER_GRACE: Duration = Duration::from_secs(1);

/// Per-connection transport limits.
#[derive(Clone, Copy, Debug)]
pub struct ConnectionSettings {
    pub max_send_queue: usize,
    pub send_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub client_timeout: Duration,
}

impl ConnectionSettings {
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            max_send_queue: config.max_send_queue,
            send_timeout: config.send_timeout(),
            heartbeat_interval: config.heartbeat_interval(),
            client_timeout: config.client_timeout(),
        }
    }
}

/// Why the connection ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CloseReason {
    ClientClosed,
    TransportError,
    WriterStopped,
    Shutdown,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::WriterStopped => "writer_stopped",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Run a client connection until it closes, times out, or the server shuts down.
///
/// 1. Registers an unauthenticated session
/// 2. Spawns the writer: drains the outbound queue and sends pings
/// 3. Reads frames and runs each command to completion before reading the next
/// 4. Tears the session down exactly once
#[instrument(skip_all, fields(session_id))]
pub async fn run_connection(
    socket: WebSocket,
    dispatcher: Arc<Dispatcher>,
    settings: ConnectionSettings,
    shutdown: CancellationToken,
) {
    let registry: Arc<dyn PresenceRegistry> = Arc::clone(dispatcher.registry());
    let (session, outbox) = Session::channel(settings.max_send_queue, settings.send_timeout);
    let _ = tracing::Span::current().record("session_id", session.id().as_str());
    registry.register_unauthenticated(&session);
    info!("client connected");

    let (sink, mut stream) = socket.split();
    let cancel = shutdown.child_token();
    let mut writer = spawn_writer(sink, outbox, Arc::clone(&session), settings, cancel.clone());

    let reason = loop {
        let frame = tokio::select! {
            frame = stream.next() => frame,
            () = cancel.cancelled() => {
                break if shutdown.is_cancelled() {
                    CloseReason::Shutdown
                } else {
                    CloseReason::WriterStopped
                };
            }
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
            Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!(len = data.len(), "non-UTF-8 binary frame");
                    session.mark_alive();
                    session
                        .send(&ServerMessage::error(Value::Null, ErrorCode::Parse))
                        .await;
                    continue;
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                session.mark_alive();
                continue;
            }
            Some(Ok(Message::Close(_))) | None => break CloseReason::ClientClosed,
            Some(Err(e)) => {
                debug!(error = %e, "transport error");
                break CloseReason::TransportError;
            }
        };

        session.mark_alive();
        let reply = dispatcher.handle_frame(&session, &text).await;
        session.send(&reply).await;
    };

    cancel.cancel();
    if session.begin_teardown() {
        registry.offline(&session).await;
    }
    if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(
        reason = reason.as_str(),
        duration_ms = session.age().as_millis() as u64,
        dropped_frames = session.dropped_frames(),
        "client disconnected"
    );
}

fn spawn_writer(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbox: mpsc::Receiver<Arc<str>>,
    session: Arc<Session>,
    settings: ConnectionSettings,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(settings.heartbeat_interval);
        // Skip the immediate first tick
        let _ = heartbeat.tick().await;

        loop {
            tokio::select! {
                frame = outbox.recv() => {
                    let Some(frame) = frame else { break };
                    if sink.send(Message::Text(String::from(&*frame).into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if session.idle_for() > settings.client_timeout {
                        warn!(idle_ms = session.idle_for().as_millis() as u64, "client unresponsive, disconnecting");
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                () = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        cancel.cancel();
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_config() {
        let config = ServerConfig {
            max_send_queue: 8,
            send_timeout_ms: 250,
            heartbeat_interval_secs: 5,
            client_timeout_secs: 15,
            ..ServerConfig::default()
        };
        let settings = ConnectionSettings::from_config(&config);
        assert_eq!(settings.max_send_queue, 8);
        assert_eq!(settings.send_timeout, Duration::from_millis(250));
        assert_eq!(settings.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(settings.client_timeout, Duration::from_secs(15));
    }

    #[test]
    fn close_reasons_are_distinct() {
        let reasons = [
            CloseReason::ClientClosed,
            CloseReason::TransportError,
            CloseReason::WriterStopped,
            CloseReason::Shutdown,
        ];
        let names: std::collections::HashSet<_> = reasons.iter().map(|r| r.as_str()).collect();
        assert_eq!(names.len(), reasons.len());
    }
}
