//! # Socket.IO WebSocket Client
//!
//! Connects to the call platform's Socket.IO endpoint over a plain websocket
//! and adapts it to the [`Transport`] capability.
//!
//! ## Connection Protocol:
//! 1. **Connect**: open `{endpoint}/socket.io/?EIO=4&transport=websocket`
//! 2. **Handshake**: the server sends an Engine.IO `open`; we answer with a
//!    Socket.IO `connect` carrying `{"token": auth_token}`
//! 3. **Heartbeat**: every server `ping` is answered with a `pong`
//! 4. **Events**: inbound events are decoded and pushed onto a channel,
//!    outbound events are queued to a single writer task
//! 5. **Acknowledgments**: each `emit_with_ack` gets a fresh ack id; the
//!    matching `ack` packet resolves its oneshot. Ids whose receiver was
//!    dropped unanswered are discarded on the next emit
//!
//! ## Task layout:
//! - **Writer task**: owns the websocket sink; receives whole frame groups so a
//!   binary event header and its attachments are never interleaved with
//!   another emission
//! - **Reader task**: owns the websocket stream; on exit it fails every pending
//!   ack and reports `Disconnected`

use crate::config::TransportConfig;
use crate::error::{AppError, AppResult};
use crate::transport::packet::{self, EnginePacket, SocketPacket};
use crate::transport::{Ack, InboundEvent, OutboundEvent, Transport};
use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, error, info, trace, warn};

/// Inbound events buffered before the reader waits on the dispatcher.
const INBOUND_CAPACITY: usize = 256;

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// Frames that must reach the socket back to back.
type FrameGroup = Vec<Message>;

/// Build the websocket URL for a Socket.IO endpoint.
///
/// `http`/`https` map to `ws`/`wss`; `ws`/`wss` are used as given.
pub fn socket_url(endpoint: &str) -> AppResult<String> {
    let endpoint = endpoint.trim().trim_end_matches('/');
    let (scheme, rest) = endpoint.split_once("://").ok_or_else(|| {
        AppError::Config(format!("endpoint must include a scheme: '{}'", endpoint))
    })?;

    let ws_scheme = match scheme {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(AppError::Config(format!(
                "unsupported endpoint scheme '{}'",
                other
            )))
        }
    };

    Ok(format!("{}://{}/socket.io/?EIO=4&transport=websocket", ws_scheme, rest))
}

/// Outbound half of a Socket.IO connection.
pub struct SocketIoTransport {
    frames: mpsc::UnboundedSender<FrameGroup>,
    pending_acks: PendingAcks,
    next_ack_id: AtomicU64,
}

impl SocketIoTransport {
    /// Connect and start the reader and writer tasks.
    ///
    /// ## Returns:
    /// The transport plus the channel inbound events arrive on. The channel
    /// closes after a final `Disconnected` event once the connection ends.
    pub async fn connect(
        config: &TransportConfig,
    ) -> AppResult<(Self, mpsc::Receiver<InboundEvent>)> {
        let url = socket_url(&config.endpoint)?;
        info!(url = %url, "Connecting to call platform");

        let (socket, _response) = connect_async(url.as_str()).await?;
        let (mut sink, stream) = socket.split();

        let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<FrameGroup>();
        let (events_tx, events_rx) = mpsc::channel(INBOUND_CAPACITY);
        let pending_acks = PendingAcks::default();

        tokio::spawn(async move {
            while let Some(group) = frames_rx.recv().await {
                for frame in group {
                    if let Err(err) = sink.feed(frame).await {
                        error!(error = %err, "WebSocket write failed");
                        return;
                    }
                }
                if let Err(err) = sink.flush().await {
                    error!(error = %err, "WebSocket flush failed");
                    return;
                }
            }
            let _ = sink.close().await;
        });

        let reader = SocketReader::new(
            frames_tx.clone(),
            events_tx,
            pending_acks.clone(),
            json!({ "token": config.auth_token }),
        );
        tokio::spawn(reader.run(stream));

        Ok((Self::from_parts(frames_tx, pending_acks), events_rx))
    }

    fn from_parts(frames: mpsc::UnboundedSender<FrameGroup>, pending_acks: PendingAcks) -> Self {
        Self {
            frames,
            pending_acks,
            next_ack_id: AtomicU64::new(0),
        }
    }

    fn encode(event: OutboundEvent, ack_id: Option<u64>) -> FrameGroup {
        let name = event.name();
        let (payload, attachments) = event.into_payload();

        if attachments.is_empty() {
            return vec![Message::Text(packet::encode_event(name, &payload, ack_id))];
        }

        let mut group = Vec::with_capacity(attachments.len() + 1);
        group.push(Message::Text(packet::encode_binary_event(
            name,
            &payload,
            attachments.len(),
            ack_id,
        )));
        group.extend(attachments.into_iter().map(Message::Binary));
        group
    }

    fn send(&self, group: FrameGroup) -> AppResult<()> {
        self.frames
            .send(group)
            .map_err(|_| AppError::Transport("connection closed".to_string()))
    }

    fn pending_acks(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Value>>> {
        self.pending_acks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for SocketIoTransport {
    async fn emit(&self, event: OutboundEvent) -> AppResult<()> {
        trace!(event = event.name(), session_id = event.session_id(), "Emitting");
        self.send(Self::encode(event, None))
    }

    async fn emit_with_ack(&self, event: OutboundEvent) -> AppResult<Ack> {
        let ack_id = self.next_ack_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending_acks();
            // Callers that stopped waiting leave closed senders behind.
            pending.retain(|_, waiting| !waiting.is_closed());
            pending.insert(ack_id, tx);
        }

        trace!(
            event = event.name(),
            session_id = event.session_id(),
            ack_id,
            "Emitting with ack"
        );
        if let Err(err) = self.send(Self::encode(event, Some(ack_id))) {
            self.pending_acks().remove(&ack_id);
            return Err(err);
        }
        Ok(rx)
    }
}

/// Whether the reader keeps going after a frame.
enum Flow {
    Continue,
    Stop(String),
}

/// A binary event or ack whose attachments have not all arrived yet.
struct PendingBinary {
    remaining: usize,
    /// `None` for binary acks, which are resolved as soon as they are decoded
    event: Option<(String, Value, Option<u64>)>,
}

/// Decodes inbound frames and turns them into [`InboundEvent`]s.
struct SocketReader {
    frames: mpsc::UnboundedSender<FrameGroup>,
    events: mpsc::Sender<InboundEvent>,
    pending_acks: PendingAcks,
    auth: Value,
    pending_binary: Option<PendingBinary>,
}

impl SocketReader {
    fn new(
        frames: mpsc::UnboundedSender<FrameGroup>,
        events: mpsc::Sender<InboundEvent>,
        pending_acks: PendingAcks,
        auth: Value,
    ) -> Self {
        Self {
            frames,
            events,
            pending_acks,
            auth,
            pending_binary: None,
        }
    }

    async fn run<S>(mut self, mut stream: S)
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let reason = loop {
            let flow = match stream.next().await {
                None => Flow::Stop("connection closed".to_string()),
                Some(Ok(Message::Text(text))) => self.on_text(&text).await,
                Some(Ok(Message::Binary(data))) => self.on_binary(data).await,
                Some(Ok(Message::Close(frame))) => Flow::Stop(format!("closed by peer: {:?}", frame)),
                // Websocket-level ping/pong is answered by tungstenite itself.
                Some(Ok(_)) => Flow::Continue,
                Some(Err(err)) => {
                    error!(error = %err, "WebSocket read failed");
                    Flow::Stop(err.to_string())
                }
            };
            if let Flow::Stop(reason) = flow {
                break reason;
            }
        };

        let dropped = {
            let mut acks = self.pending_acks.lock().unwrap_or_else(PoisonError::into_inner);
            let count = acks.len();
            acks.clear();
            count
        };
        info!(reason = %reason, unanswered_acks = dropped, "Disconnected from call platform");
        let _ = self.events.send(InboundEvent::Disconnected(reason)).await;
    }

    fn send(&self, text: String) -> Flow {
        match self.frames.send(vec![Message::Text(text)]) {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Stop("writer task stopped".to_string()),
        }
    }

    async fn deliver(&self, event: InboundEvent) -> Flow {
        match self.events.send(event).await {
            Ok(()) => Flow::Continue,
            Err(_) => Flow::Stop("event receiver dropped".to_string()),
        }
    }

    async fn on_text(&mut self, text: &str) -> Flow {
        let packet = match packet::decode_engine(text) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(error = %err, "Skipping malformed engine.io packet");
                return Flow::Continue;
            }
        };

        match packet {
            EnginePacket::Open(info) => {
                debug!(sid = ?info.get("sid"), "Engine.IO handshake received");
                self.send(packet::encode_connect(&self.auth))
            }
            EnginePacket::Ping(data) => self.send(packet::encode_pong(&data)),
            EnginePacket::Close => Flow::Stop("engine.io close".to_string()),
            EnginePacket::Message(body) => self.on_socket_packet(&body).await,
            EnginePacket::Pong(_) | EnginePacket::Upgrade | EnginePacket::Noop => Flow::Continue,
        }
    }

    async fn on_socket_packet(&mut self, body: &str) -> Flow {
        let packet = match packet::decode_socket(body) {
            Ok(packet) => packet,
            Err(err) => {
                warn!(error = %err, "Skipping malformed socket.io packet");
                return Flow::Continue;
            }
        };

        match packet {
            SocketPacket::Connect(data) => {
                let sid = data.get("sid").and_then(Value::as_str).map(str::to_string);
                self.deliver(InboundEvent::Connected { sid }).await
            }
            SocketPacket::Disconnect => Flow::Stop("server disconnected the namespace".to_string()),
            SocketPacket::Event {
                ack_id,
                name,
                payload,
            } => self.on_event(name, payload, ack_id).await,
            SocketPacket::Ack { ack_id, payload } => {
                self.resolve_ack(ack_id, payload);
                Flow::Continue
            }
            SocketPacket::ConnectError(data) => {
                let message = data
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| data.to_string());
                self.deliver(InboundEvent::ConnectError(message)).await
            }
            SocketPacket::BinaryEvent {
                attachments,
                ack_id,
                name,
                payload,
            } => {
                if attachments == 0 {
                    return self.on_event(name, payload, ack_id).await;
                }
                self.pending_binary = Some(PendingBinary {
                    remaining: attachments,
                    event: Some((name, payload, ack_id)),
                });
                Flow::Continue
            }
            SocketPacket::BinaryAck {
                attachments,
                ack_id,
                payload,
            } => {
                self.resolve_ack(ack_id, payload);
                if attachments > 0 {
                    self.pending_binary = Some(PendingBinary {
                        remaining: attachments,
                        event: None,
                    });
                }
                Flow::Continue
            }
        }
    }

    /// Consume one attachment of the pending binary packet.
    ///
    /// Attachment bytes are not spliced back into the payload; the only
    /// inbound binary event is the audio echo, which the client ignores.
    async fn on_binary(&mut self, data: Vec<u8>) -> Flow {
        let Some(pending) = self.pending_binary.as_mut() else {
            warn!(bytes = data.len(), "Binary frame without a pending binary packet");
            return Flow::Continue;
        };

        trace!(bytes = data.len(), "Binary attachment received");
        pending.remaining -= 1;
        if pending.remaining > 0 {
            return Flow::Continue;
        }

        match self.pending_binary.take().and_then(|pending| pending.event) {
            Some((name, payload, ack_id)) => self.on_event(name, payload, ack_id).await,
            None => Flow::Continue,
        }
    }

    async fn on_event(&mut self, name: String, payload: Value, ack_id: Option<u64>) -> Flow {
        if let Some(ack_id) = ack_id {
            if let Flow::Stop(reason) = self.send(packet::encode_ack(ack_id, &[])) {
                return Flow::Stop(reason);
            }
        }

        match InboundEvent::from_event(&name, payload) {
            Ok(event) => self.deliver(event).await,
            Err(err) => {
                warn!(event = %name, error = %err, "Dropping malformed event");
                Flow::Continue
            }
        }
    }

    fn resolve_ack(&self, ack_id: u64, payload: Value) {
        let sender = self
            .pending_acks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ack_id);
        match sender {
            Some(sender) => {
                let _ = sender.send(payload);
            }
            None => debug!(ack_id, "Acknowledgment for an unknown id"),
        }
    }
}
