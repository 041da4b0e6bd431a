//! # Audio Session Management
//!
//! Owns the per-call playback state: one ordered set of audio streams per
//! session id. A session is created when the platform announces a new call and
//! is discarded when its audio runs out or the call hangs up.
//!
//! ## Session Lifecycle:
//! 0. **Reserved**: Registered and locked while its audio loads; anything that
//!    needs the state (starting playback) waits for the load to finish
//! 1. **Idle**: Registered, nothing to play yet or nothing left to play
//! 2. **StreamActive**: The front stream still has chunks
//! 3. **StreamExhausted**: The front stream is empty, more streams follow
//! 4. **Retired**: Removed from the registry; any pending continuation is a no-op
//!
//! ## Thread Safety:
//! The registry map sits behind a `std::sync::RwLock` that is never held
//! across an `.await`. Each session's state sits behind its own
//! `tokio::sync::Mutex`, which only that session's scheduler task locks while
//! it plays, so sessions never contend with each other.

use crate::audio::loader::AssetLoader;
use crate::audio::stream::AudioStream;
use crate::config::StreamSpec;
use crate::error::{AppError, AppResult};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Where a session's playback currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackPhase {
    /// No streams left to play
    Idle,
    /// The front stream has chunks waiting
    StreamActive,
    /// The front stream is spent and will be dropped on the next advance
    StreamExhausted,
}

impl PlaybackPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybackPhase::Idle => "idle",
            PlaybackPhase::StreamActive => "stream_active",
            PlaybackPhase::StreamExhausted => "stream_exhausted",
        }
    }
}

/// Playback queues for one call.
///
/// ## Invariants:
/// - `streams` is built once, in configured order, and never reordered
/// - Only the session's scheduler task pops from it
/// - `streaming` flips to true once, so at most one emission chain ever runs
#[derive(Debug)]
pub struct SessionPlaybackState {
    session_id: String,
    streams: VecDeque<AudioStream>,
    streaming: bool,
}

impl SessionPlaybackState {
    pub fn new(session_id: impl Into<String>, streams: Vec<AudioStream>) -> Self {
        Self {
            session_id: session_id.into(),
            streams: streams.into(),
            streaming: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn phase(&self) -> PlaybackPhase {
        match self.streams.front() {
            None => PlaybackPhase::Idle,
            Some(stream) if stream.is_exhausted() => PlaybackPhase::StreamExhausted,
            Some(_) => PlaybackPhase::StreamActive,
        }
    }

    /// Chunks still queued across all streams.
    pub fn remaining_chunks(&self) -> usize {
        self.streams.iter().map(AudioStream::remaining).sum()
    }

    pub(crate) fn streams_mut(&mut self) -> &mut VecDeque<AudioStream> {
        &mut self.streams
    }

    /// Claim the right to run this session's emission chain.
    ///
    /// Returns false if a chain was already started.
    pub(crate) fn begin_streaming(&mut self) -> bool {
        !std::mem::replace(&mut self.streaming, true)
    }
}

/// Shared handle to one session's playback state.
pub type SessionHandle = Arc<Mutex<SessionPlaybackState>>;

/// A registered session whose audio is still being set up.
///
/// Holds the session's lock; dropping it lets playback start.
pub struct PendingSession {
    handle: SessionHandle,
    guard: OwnedMutexGuard<SessionPlaybackState>,
}

impl PendingSession {
    pub fn session_id(&self) -> &str {
        self.guard.session_id()
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }
}

/// Maps session ids to their playback state.
///
/// ## Resource Management:
/// - Registers an id as soon as the session is announced, then builds its
///   streams through the [`AssetLoader`]
/// - Rejects a second session with the same id
/// - Hands out handles that stay valid after removal, so a scheduler task can
///   detect that it was cancelled via [`SessionRegistry::is_live`]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    loader: Arc<dyn AssetLoader>,
    stream_specs: Vec<StreamSpec>,
}

impl SessionRegistry {
    pub fn new(loader: Arc<dyn AssetLoader>, stream_specs: Vec<StreamSpec>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            loader,
            stream_specs,
        }
    }

    /// Register `session_id` before its audio is loaded.
    ///
    /// The entry exists from this point on, so a hangup can remove it and a
    /// connect can find it. Its state stays locked until the returned
    /// [`PendingSession`] is dropped.
    ///
    /// ## Returns:
    /// - **Ok(pending)**: The id is now registered with no audio yet
    /// - **Err(DuplicateSession)**: The id is already registered; the existing
    ///   session is left untouched
    pub async fn reserve(&self, session_id: &str) -> AppResult<PendingSession> {
        let handle = Arc::new(Mutex::new(SessionPlaybackState::new(session_id, Vec::new())));
        // Nobody else can see this mutex yet, so the lock is immediate.
        let guard = handle.clone().lock_owned().await;

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.entry(session_id.to_string()) {
            Entry::Occupied(_) => Err(AppError::DuplicateSession(session_id.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(handle.clone());
                Ok(PendingSession { handle, guard })
            }
        }
    }

    /// Load the audio for a reserved session.
    ///
    /// ## Returns:
    /// - **Ok(())**: Streams are in place; they become visible once `pending`
    ///   is dropped
    /// - **Err(AssetLoad)**: A segment could not be read; the session stays
    ///   registered with no audio until the caller retires it
    pub async fn load(&self, pending: &mut PendingSession) -> AppResult<()> {
        let streams = self.loader.load_streams(&self.stream_specs).await?;
        let session_id = pending.session_id().to_string();
        debug!(session_id = %session_id, streams = streams.len(), "Session audio loaded");
        *pending.guard = SessionPlaybackState::new(session_id, streams);
        Ok(())
    }

    /// Reserve and load a session in one step.
    ///
    /// On `AssetLoad` nothing stays registered for the id.
    #[cfg(test)]
    pub async fn create_session(&self, session_id: &str) -> AppResult<SessionHandle> {
        let mut pending = self.reserve(session_id).await?;
        if let Err(err) = self.load(&mut pending).await {
            self.retire(session_id, pending.handle());
            return Err(err);
        }
        Ok(pending.handle().clone())
    }

    /// Wait until any setup in progress for `session_id` has finished.
    ///
    /// Returns whether the session is registered once setup is done.
    pub async fn ready(&self, session_id: &str) -> bool {
        let Some(handle) = self.get(session_id) else {
            return false;
        };
        let _state = handle.lock().await;
        self.is_live(session_id, &handle)
    }

    pub fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    #[cfg(test)]
    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(session_id)
    }

    /// Remove a session. Removing an absent session is a no-op.
    ///
    /// Returns whether a session was actually removed.
    pub fn remove(&self, session_id: &str) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
            .is_some()
    }

    /// Whether `handle` is still the registered state for `session_id`.
    ///
    /// False after removal, and also after the id was removed and created
    /// again, so a stale task never plays into a newer session.
    pub fn is_live(&self, session_id: &str, handle: &SessionHandle) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .is_some_and(|current| Arc::ptr_eq(current, handle))
    }

    /// Remove `session_id` only if it is still registered as `handle`.
    pub fn retire(&self, session_id: &str, handle: &SessionHandle) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(session_id) {
            Some(current) if Arc::ptr_eq(current, handle) => {
                sessions.remove(session_id);
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_session_ids(&self) -> Vec<String> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}
