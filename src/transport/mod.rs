//! # Transport Adapter
//!
//! The connection to the call platform, seen from the core as a capability:
//! emit an outbound event (optionally waiting for the peer's acknowledgment),
//! join a session's room, and receive inbound events on a channel.
//!
//! ## Message Flow:
//! - **Client → Platform**: `joinRoom`, `checkPoint`, `dtmf`, `audio`
//! - **Platform → Client**: `newSession`, `roomJoined`, `dialStatus`, `dtmf`,
//!   `hangup`, `checkPoint`, `audio`, `error`
//!
//! [`socketio`] implements this over a Socket.IO websocket; tests use
//! [`testing::RecordingTransport`].

pub mod packet;
pub mod socketio;

use crate::audio::stream::AudioFormat;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;

/// Resolves with the peer's acknowledgment payload.
///
/// A closed receiver means the connection went away before the peer answered.
pub type Ack = oneshot::Receiver<Value>;

/// Events this client sends to the platform.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    /// Subscribe to a session's room
    JoinRoom { session_id: String },

    /// Named marker for the platform's call timeline
    CheckPoint { session_id: String, name: String },

    /// Simulated keypad tone
    Dtmf {
        session_id: String,
        digit: String,
        /// Tone duration in milliseconds
        duration: u64,
    },

    /// One chunk of call audio
    Audio {
        session_id: String,
        audio_data: Vec<u8>,
        audio_format: AudioFormat,
    },
}

impl OutboundEvent {
    /// Event name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::JoinRoom { .. } => "joinRoom",
            OutboundEvent::CheckPoint { .. } => "checkPoint",
            OutboundEvent::Dtmf { .. } => "dtmf",
            OutboundEvent::Audio { .. } => "audio",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            OutboundEvent::JoinRoom { session_id }
            | OutboundEvent::CheckPoint { session_id, .. }
            | OutboundEvent::Dtmf { session_id, .. }
            | OutboundEvent::Audio { session_id, .. } => session_id,
        }
    }

    /// JSON payload plus binary attachments.
    ///
    /// Binary data never goes inline: each attachment is replaced by a
    /// `{"_placeholder": true, "num": n}` marker and shipped as its own frame.
    pub fn into_payload(self) -> (Value, Vec<Vec<u8>>) {
        match self {
            OutboundEvent::JoinRoom { session_id } => (json!({ "sessionId": session_id }), Vec::new()),
            OutboundEvent::CheckPoint { session_id, name } => (
                json!({ "sessionId": session_id, "name": name }),
                Vec::new(),
            ),
            OutboundEvent::Dtmf {
                session_id,
                digit,
                duration,
            } => (
                json!({ "sessionId": session_id, "digit": digit, "duration": duration }),
                Vec::new(),
            ),
            OutboundEvent::Audio {
                session_id,
                audio_data,
                audio_format,
            } => (
                json!({
                    "sessionId": session_id,
                    "audioData": { "_placeholder": true, "num": 0 },
                    "audioFormat": audio_format,
                }),
                vec![audio_data],
            ),
        }
    }
}

/// Call progress reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialStatus {
    /// The callee picked up; audio may flow
    Connected,
    /// Any other status, kept verbatim for logging
    Other(String),
}

impl From<String> for DialStatus {
    fn from(status: String) -> Self {
        if status == "Connected" {
            DialStatus::Connected
        } else {
            DialStatus::Other(status)
        }
    }
}

/// Events the platform sends to this client.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Socket.IO handshake completed
    Connected { sid: Option<String> },
    NewSession { session_id: String },
    RoomJoined(Value),
    DialStatus { session_id: String, status: DialStatus },
    Dtmf(Value),
    Hangup(Value),
    CheckPoint(Value),
    /// Echoed call audio; binary attachments are not retained
    Audio(Value),
    Error(Value),
    /// The platform refused the handshake
    ConnectError(String),
    /// The connection or namespace closed
    Disconnected(String),
    /// An event name this client has no handler for
    Unknown { name: String, payload: Value },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionPayload {
    session_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DialStatusPayload {
    session_id: String,
    status: String,
}

impl InboundEvent {
    /// Build a typed event from a Socket.IO event name and its first argument.
    ///
    /// ## Errors:
    /// `Protocol` when an event that must name a session does not.
    pub fn from_event(name: &str, payload: Value) -> AppResult<Self> {
        let event = match name {
            "newSession" => {
                let SessionPayload { session_id } = serde_json::from_value(payload)?;
                InboundEvent::NewSession { session_id }
            }
            "dialStatus" => {
                let DialStatusPayload { session_id, status } = serde_json::from_value(payload)?;
                InboundEvent::DialStatus {
                    session_id,
                    status: status.into(),
                }
            }
            "roomJoined" => InboundEvent::RoomJoined(payload),
            "dtmf" => InboundEvent::Dtmf(payload),
            "hangup" => InboundEvent::Hangup(payload),
            "checkPoint" => InboundEvent::CheckPoint(payload),
            "audio" => InboundEvent::Audio(payload),
            "error" => InboundEvent::Error(payload),
            "" => return Err(AppError::Protocol("event without a name".to_string())),
            other => InboundEvent::Unknown {
                name: other.to_string(),
                payload,
            },
        };
        Ok(event)
    }
}

/// Outbound side of the connection to the call platform.
///
/// ## Contract:
/// - `emit` and `emit_with_ack` return once the event is queued for sending;
///   they never wait for the peer
/// - An `Err` means the connection is gone; callers do not retry
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an event without asking for an acknowledgment.
    async fn emit(&self, event: OutboundEvent) -> AppResult<()>;

    /// Send an event and get a handle on the peer's acknowledgment.
    async fn emit_with_ack(&self, event: OutboundEvent) -> AppResult<Ack>;

    /// Subscribe to a session's room.
    async fn join(&self, session_id: &str) -> AppResult<()> {
        self.emit(OutboundEvent::JoinRoom {
            session_id: session_id.to_string(),
        })
        .await
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_payload_uses_placeholder() {
        let event = OutboundEvent::Audio {
            session_id: "call-1".to_string(),
            audio_data: vec![9, 8, 7],
            audio_format: AudioFormat::from("pcm16"),
        };

        let (payload, attachments) = event.into_payload();
        assert_eq!(payload["sessionId"], "call-1");
        assert_eq!(payload["audioFormat"], "pcm16");
        assert_eq!(payload["audioData"]["_placeholder"], true);
        assert_eq!(attachments, vec![vec![9, 8, 7]]);
    }

    #[test]
    fn test_dtmf_payload_shape() {
        let event = OutboundEvent::Dtmf {
            session_id: "call-1".to_string(),
            digit: "5".to_string(),
            duration: 200,
        };
        let (payload, attachments) = event.into_payload();
        assert_eq!(payload, json!({ "sessionId": "call-1", "digit": "5", "duration": 200 }));
        assert!(attachments.is_empty());
    }

    #[test]
    fn test_dial_status_event_parsing() {
        let event = InboundEvent::from_event(
            "dialStatus",
            json!({ "sessionId": "call-1", "status": "Connected" }),
        )
        .unwrap();
        assert_eq!(
            event,
            InboundEvent::DialStatus {
                session_id: "call-1".to_string(),
                status: DialStatus::Connected,
            }
        );

        let ringing = InboundEvent::from_event(
            "dialStatus",
            json!({ "sessionId": "call-1", "status": "Ringing" }),
        )
        .unwrap();
        assert!(matches!(
            ringing,
            InboundEvent::DialStatus { status: DialStatus::Other(s), .. } if s == "Ringing"
        ));
    }

    #[test]
    fn test_new_session_without_id_is_a_protocol_error() {
        let err = InboundEvent::from_event("newSession", json!({})).unwrap_err();
        assert_eq!(err.kind(), "protocol");
    }

    #[test]
    fn test_unknown_events_are_kept() {
        let event = InboundEvent::from_event("recording", json!({ "url": "x" })).unwrap();
        assert!(matches!(event, InboundEvent::Unknown { name, .. } if name == "recording"));
    }
}
