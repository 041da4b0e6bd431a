//! # Event Dispatcher
//!
//! Routes each inbound platform event to its handler. Handlers never block the
//! receive loop: anything that loads audio, waits or emits runs in its own task.
//!
//! Events for one session take effect in the order they arrive. A new session
//! is registered before its audio loads, so a hangup during the load removes it
//! and a connect during the load waits for it.
//!
//! ## Event Handling:
//! - **newSession**: register the session, load its audio, then join its room
//! - **dialStatus Connected**: checkpoint, delayed DTMF tone, start audio
//! - **hangup**: drop the session so its scheduler task stops
//! - **everything else**: logged; errors are also counted

use crate::audio::scheduler::ChunkScheduler;
use crate::audio::session::SessionRegistry;
use crate::error::AppError;
use crate::state::AppState;
use crate::transport::{DialStatus, InboundEvent, OutboundEvent, Transport};
use chrono::{SecondsFormat, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Checkpoint name marking the start of the call's audio.
fn started_checkpoint_name() -> String {
    format!(
        "started initial {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

pub struct EventDispatcher {
    registry: Arc<SessionRegistry>,
    scheduler: ChunkScheduler,
    transport: Arc<dyn Transport>,
    state: AppState,
}

impl EventDispatcher {
    pub fn new(registry: Arc<SessionRegistry>, transport: Arc<dyn Transport>, state: AppState) -> Self {
        let scheduler = ChunkScheduler::new(registry.clone(), transport.clone(), state.clone());
        Self {
            registry,
            scheduler,
            transport,
            state,
        }
    }

    /// Handle events until the transport closes its channel.
    pub async fn run(&self, mut events: mpsc::Receiver<InboundEvent>) {
        while let Some(event) = events.recv().await {
            self.dispatch(event).await;
        }

        if self.registry.is_empty() {
            info!("Inbound event channel closed");
        } else {
            warn!(
                active_sessions = ?self.registry.active_session_ids(),
                "Inbound event channel closed with sessions still active"
            );
        }
    }

    /// Handle one event.
    ///
    /// Returns the spawned task for events whose handling continues in the
    /// background, so callers can wait for it.
    pub async fn dispatch(&self, event: InboundEvent) -> Option<JoinHandle<()>> {
        match event {
            InboundEvent::NewSession { session_id } => self.on_new_session(session_id).await,
            InboundEvent::DialStatus {
                session_id,
                status: DialStatus::Connected,
            } => Some(self.on_call_connected(session_id)),
            InboundEvent::DialStatus {
                session_id,
                status: DialStatus::Other(status),
            } => {
                info!(session_id = %session_id, status = %status, "Dial status");
                None
            }
            InboundEvent::Hangup(payload) => {
                self.on_hangup(&payload);
                None
            }
            InboundEvent::Connected { sid } => {
                info!(sid = ?sid, "Connected to call platform");
                None
            }
            InboundEvent::RoomJoined(payload) => {
                info!(payload = %payload, "Joined session room");
                None
            }
            InboundEvent::Dtmf(payload) => {
                info!(payload = %payload, "DTMF received");
                None
            }
            InboundEvent::CheckPoint(payload) => {
                info!(payload = %payload, "Checkpoint received");
                None
            }
            InboundEvent::Audio(payload) => {
                trace!(session_id = ?payload.get("sessionId"), "Audio echo received");
                None
            }
            InboundEvent::Error(payload) => {
                error!(payload = %payload, "Platform reported an error");
                self.state.record_error("platform");
                None
            }
            InboundEvent::ConnectError(message) => {
                error!(message = %message, "Platform refused the connection");
                self.state.record_error("connect");
                None
            }
            InboundEvent::Disconnected(reason) => {
                warn!(reason = %reason, "Disconnected from call platform");
                None
            }
            InboundEvent::Unknown { name, payload } => {
                debug!(event = %name, payload = %payload, "Unhandled event");
                None
            }
        }
    }

    async fn on_new_session(&self, session_id: String) -> Option<JoinHandle<()>> {
        info!(session_id = %session_id, "New session announced");

        let mut pending = match self.registry.reserve(&session_id).await {
            Ok(pending) => pending,
            Err(err) => {
                match &err {
                    AppError::DuplicateSession(_) => {
                        warn!(session_id = %session_id, "Session already exists, ignoring announcement")
                    }
                    _ => error!(session_id = %session_id, error = %err, "Failed to register session"),
                }
                self.state.record_error(err.kind());
                return None;
            }
        };
        self.state.record_session_created();

        let registry = self.registry.clone();
        let transport = self.transport.clone();
        let state = self.state.clone();

        // `pending` keeps the session locked until this task ends.
        Some(tokio::spawn(async move {
            if let Err(err) = registry.load(&mut pending).await {
                error!(session_id = %session_id, error = %err, "Failed to set up session");
                state.record_error(err.kind());
                if registry.retire(&session_id, pending.handle()) {
                    state.record_session_retired();
                }
                return;
            }

            if !registry.is_live(&session_id, pending.handle()) {
                info!(session_id = %session_id, "Call ended while its audio was loading");
                return;
            }

            if let Err(err) = transport.join(&session_id).await {
                error!(session_id = %session_id, error = %err, "Failed to join session room");
                state.record_error(err.kind());
                if registry.retire(&session_id, pending.handle()) {
                    state.record_session_retired();
                }
                return;
            }
            debug!(session_id = %session_id, active_sessions = registry.len(), "Session ready");
        }))
    }

    fn on_call_connected(&self, session_id: String) -> JoinHandle<()> {
        info!(session_id = %session_id, "Call connected");
        // The tone is timed from the connect, not from when audio starts.
        Self::schedule_dtmf(self.transport.clone(), self.state.clone(), session_id.clone());

        let registry = self.registry.clone();
        let transport = self.transport.clone();
        let scheduler = self.scheduler.clone();
        let state = self.state.clone();

        tokio::spawn(async move {
            if !registry.ready(&session_id).await {
                debug!(session_id = %session_id, "Connected call has no session audio");
            }

            // The checkpoint has to reach the platform before any audio.
            let checkpoint = OutboundEvent::CheckPoint {
                session_id: session_id.clone(),
                name: started_checkpoint_name(),
            };
            if let Err(err) = transport.emit(checkpoint).await {
                error!(session_id = %session_id, error = %err, "Failed to emit checkpoint");
                state.record_error(err.kind());
            }

            if let Some(playback) = scheduler.start(&session_id).await {
                if let Err(err) = playback.await {
                    error!(session_id = %session_id, error = %err, "Playback task failed");
                }
            }
        })
    }

    /// Send the configured keypad tone once the DTMF delay has passed.
    ///
    /// The tone is sent even if the session has ended by then.
    fn schedule_dtmf(transport: Arc<dyn Transport>, state: AppState, session_id: String) {
        let playback = &state.config.playback;
        let delay = playback.dtmf_delay();
        let event = OutboundEvent::Dtmf {
            session_id: session_id.clone(),
            digit: playback.dtmf_digit.clone(),
            duration: playback.dtmf_duration_ms,
        };

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            debug!(session_id = %session_id, "Sending DTMF tone");
            if let Err(err) = transport.emit(event).await {
                error!(session_id = %session_id, error = %err, "Failed to emit DTMF");
                state.record_error(err.kind());
            }
        });
    }

    fn on_hangup(&self, payload: &Value) {
        let Some(session_id) = payload.get("sessionId").and_then(Value::as_str) else {
            info!(payload = %payload, "Hangup without a session id");
            return;
        };

        if self.registry.remove(session_id) {
            self.state.record_session_retired();
            info!(session_id, active_sessions = self.registry.len(), "Call hung up, session removed");
        } else {
            info!(session_id, "Call hung up, no active session");
        }
    }
}
