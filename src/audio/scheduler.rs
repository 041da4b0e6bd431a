//! # Chunk Scheduler
//!
//! Plays a session's streams to the platform one chunk at a time.
//!
//! ## Processing Pipeline:
//! 1. **Liveness**: Stop if the session was removed (hangup) or replaced
//! 2. **Advance**: Take the next chunk, dropping spent streams on the way
//! 3. **Emit**: Send the chunk as an `audio` event that asks for an ack
//! 4. **Pace**: Sleep until one pacing delay after the emit was issued
//!
//! Each session gets its own task running this loop, so a long call is a
//! loop iteration per chunk rather than a chain of nested continuations.
//!
//! ## Pacing:
//! - **Timer** (default): acks are counted as they arrive but never waited on;
//!   an ack that has not arrived within the ack timeout is given up on
//! - **Ack**: the next chunk also waits for the previous chunk's ack; an ack
//!   that is lost or times out ends the session as a transport error

use crate::audio::session::{SessionHandle, SessionPlaybackState, SessionRegistry};
use crate::audio::stream::Chunk;
use crate::config::PacingMode;
use crate::state::AppState;
use crate::transport::{OutboundEvent, Transport};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, trace, warn};

/// Take the next chunk for a session.
///
/// Spent streams at the front are dropped without emitting anything, so a
/// stream with no segments costs neither an emission nor a pacing delay.
/// Returns `None` once every stream is spent.
pub fn advance(state: &mut SessionPlaybackState) -> Option<Chunk> {
    loop {
        if let Some(chunk) = state.streams_mut().front_mut()?.pop_chunk() {
            return Some(chunk);
        }
        if let Some(spent) = state.streams_mut().pop_front() {
            debug!(
                session_id = state.session_id(),
                format = spent.format().as_str(),
                chunks = spent.total_chunks(),
                "Audio stream finished"
            );
        }
    }
}

/// Starts and runs per-session emission tasks.
#[derive(Clone)]
pub struct ChunkScheduler {
    registry: Arc<SessionRegistry>,
    transport: Arc<dyn Transport>,
    state: AppState,
}

impl ChunkScheduler {
    pub fn new(registry: Arc<SessionRegistry>, transport: Arc<dyn Transport>, state: AppState) -> Self {
        Self {
            registry,
            transport,
            state,
        }
    }

    /// Start playing a registered session.
    ///
    /// ## Returns:
    /// - **Some(handle)**: The session's emission task
    /// - **None**: The session is unknown, ended while its audio was loading,
    ///   or its audio was already started
    ///
    /// Waits for a session that is still loading its audio.
    pub async fn start(&self, session_id: &str) -> Option<JoinHandle<()>> {
        let Some(handle) = self.registry.get(session_id) else {
            warn!(session_id, "Cannot start audio for an unknown session");
            return None;
        };

        {
            let mut state = handle.lock().await;
            if !self.registry.is_live(session_id, &handle) {
                warn!(session_id, "Session ended before its audio could start");
                return None;
            }
            if !state.begin_streaming() {
                warn!(session_id, "Audio already started for session");
                return None;
            }
            info!(
                session_id,
                phase = state.phase().as_str(),
                queued_chunks = state.remaining_chunks(),
                "Starting audio playback"
            );
        }

        let scheduler = self.clone();
        let session_id = session_id.to_string();
        Some(tokio::spawn(async move {
            scheduler.run(session_id, handle).await;
        }))
    }

    async fn run(self, session_id: String, handle: SessionHandle) {
        let pacing = self.state.config.playback.pacing_delay();
        let mode = self.state.config.playback.pacing_mode;
        let ack_timeout = self.state.config.playback.ack_timeout();
        let mut emitted = 0u64;

        loop {
            if !self.registry.is_live(&session_id, &handle) {
                debug!(session_id = %session_id, emitted, "Session gone, stopping playback");
                return;
            }

            let next = advance(&mut *handle.lock().await);
            let Some(chunk) = next else {
                info!(session_id = %session_id, emitted, "All audio streams played");
                self.retire(&session_id, &handle);
                return;
            };

            debug!(
                session_id = %session_id,
                label = %chunk.label,
                format = chunk.format.as_str(),
                bytes = chunk.data.len(),
                "Emitting audio chunk"
            );

            // Pacing is measured from when the emit is issued.
            let deadline = Instant::now() + pacing;
            let label = chunk.label;
            let sent = self
                .transport
                .emit_with_ack(OutboundEvent::Audio {
                    session_id: session_id.clone(),
                    audio_data: chunk.data,
                    audio_format: chunk.format,
                })
                .await;

            let ack = match sent {
                Ok(ack) => ack,
                Err(err) => {
                    error!(session_id = %session_id, label = %label, error = %err, "Failed to emit audio chunk");
                    self.state.record_error(err.kind());
                    self.retire(&session_id, &handle);
                    return;
                }
            };
            emitted += 1;
            self.state.record_chunk_emitted();

            match mode {
                PacingMode::Timer => {
                    let state = self.state.clone();
                    let session_id = session_id.clone();
                    tokio::spawn(async move {
                        match timeout(ack_timeout, ack).await {
                            Ok(Ok(response)) => {
                                trace!(session_id = %session_id, label = %label, response = %response, "Chunk acknowledged");
                                state.record_ack();
                            }
                            Ok(Err(_)) => {}
                            Err(_) => trace!(session_id = %session_id, label = %label, "Chunk not acknowledged in time"),
                        }
                    });
                }
                PacingMode::Ack => match timeout(ack_timeout, ack).await {
                    Ok(Ok(response)) => {
                        trace!(session_id = %session_id, label = %label, response = %response, "Chunk acknowledged");
                        self.state.record_ack();
                    }
                    Ok(Err(_)) => {
                        error!(session_id = %session_id, label = %label, "Connection lost before chunk was acknowledged");
                        self.state.record_error("transport");
                        self.retire(&session_id, &handle);
                        return;
                    }
                    Err(_) => {
                        error!(
                            session_id = %session_id,
                            label = %label,
                            timeout_ms = ack_timeout.as_millis() as u64,
                            "Chunk not acknowledged in time"
                        );
                        self.state.record_error("transport");
                        self.retire(&session_id, &handle);
                        return;
                    }
                },
            }

            sleep_until(deadline).await;
        }
    }

    fn retire(&self, session_id: &str, handle: &SessionHandle) {
        if self.registry.retire(session_id, handle) {
            self.state.record_session_retired();
            debug!(session_id, remaining_sessions = self.registry.len(), "Session retired");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::loader::testing::{MemoryAssetLoader, SequencedAssetLoader, SlowAssetLoader};
    use crate::audio::stream::{AudioFormat, AudioStream};
    use crate::config::AppConfig;
    use crate::transport::testing::RecordingTransport;
    use std::time::Duration;
    use tokio::time::sleep;

    fn scheduler_with(
        streams: Vec<(&str, Vec<Vec<u8>>)>,
        transport: Arc<RecordingTransport>,
        config: AppConfig,
    ) -> (ChunkScheduler, Arc<SessionRegistry>, AppState) {
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(MemoryAssetLoader::new(streams)),
            Vec::new(),
        ));
        let state = AppState::new(config);
        let scheduler = ChunkScheduler::new(registry.clone(), transport, state.clone());
        (scheduler, registry, state)
    }

    #[test]
    fn test_advance_two_pcm16_chunks_then_inert() {
        let mut state = SessionPlaybackState::new(
            "call-1",
            vec![AudioStream::new(AudioFormat::from("pcm16"), vec![vec![10], vec![11]])],
        );

        let first = advance(&mut state).unwrap();
        assert_eq!((first.format.as_str(), first.label.as_str(), first.data), ("pcm16", "pcm16 1", vec![10]));
        let second = advance(&mut state).unwrap();
        assert_eq!((second.format.as_str(), second.label.as_str(), second.data), ("pcm16", "pcm16 2", vec![11]));

        assert!(advance(&mut state).is_none());
        assert!(advance(&mut state).is_none());
    }

    #[test]
    fn test_advance_skips_empty_streams() {
        let mut state = SessionPlaybackState::new(
            "call-1",
            vec![
                AudioStream::new(AudioFormat::from("mp3"), Vec::new()),
                AudioStream::new(AudioFormat::from("mulaw"), Vec::new()),
                AudioStream::new(AudioFormat::from("alaw"), vec![vec![1]]),
            ],
        );
        assert_eq!(advance(&mut state).unwrap().label, "alaw 1");
        assert!(advance(&mut state).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_emits_every_chunk_in_order_at_pacing_interval() {
        let transport = Arc::new(RecordingTransport::new());
        let (scheduler, registry, state) = scheduler_with(
            vec![
                ("mp3", Vec::new()),
                ("pcm16", vec![vec![0], vec![1]]),
                ("alaw", vec![vec![2]]),
            ],
            transport.clone(),
            AppConfig::default(),
        );
        registry.create_session("call-1").await.unwrap();

        let start = Instant::now();
        scheduler.start("call-1").await.unwrap().await.unwrap();

        let events = transport.events();
        let offsets: Vec<Duration> = events.iter().map(|(at, _)| *at - start).collect();
        assert_eq!(
            offsets,
            vec![
                Duration::ZERO,
                Duration::from_millis(100),
                Duration::from_millis(200),
            ]
        );
        assert_eq!(
            transport.audio_for("call-1"),
            vec![
                ("pcm16".to_string(), vec![0]),
                ("pcm16".to_string(), vec![1]),
                ("alaw".to_string(), vec![2]),
            ]
        );

        assert!(registry.is_empty());
        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.chunks_emitted, 3);
        assert_eq!(metrics.sessions_retired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hangup_stops_pending_continuation() {
        let transport = Arc::new(RecordingTransport::new());
        let (scheduler, registry, _) = scheduler_with(
            vec![("pcm16", vec![vec![0]; 5])],
            transport.clone(),
            AppConfig::default(),
        );
        registry.create_session("call-1").await.unwrap();

        let task = scheduler.start("call-1").await.unwrap();
        sleep(Duration::from_millis(150)).await;
        assert!(registry.remove("call-1"));
        task.await.unwrap();

        assert_eq!(transport.audio_for("call-1").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_task_does_not_play_into_recreated_session() {
        let transport = Arc::new(RecordingTransport::new());
        let (scheduler, registry, _) = scheduler_with(
            vec![("pcm16", vec![vec![0]; 3])],
            transport.clone(),
            AppConfig::default(),
        );
        registry.create_session("call-1").await.unwrap();
        let old_task = scheduler.start("call-1").await.unwrap();
        sleep(Duration::from_millis(50)).await;

        registry.remove("call-1");
        registry.create_session("call-1").await.unwrap();
        old_task.await.unwrap();

        assert_eq!(transport.audio_for("call-1").len(), 1);
        let fresh = registry.get("call-1").unwrap();
        assert_eq!(fresh.lock().await.remaining_chunks(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_sessions_get_only_their_own_chunks() {
        let transport = Arc::new(RecordingTransport::new());
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(SequencedAssetLoader::new("pcm16", 3)),
            Vec::new(),
        ));
        let scheduler = ChunkScheduler::new(
            registry.clone(),
            transport.clone(),
            AppState::new(AppConfig::default()),
        );
        // First load gets content [0, i], second load [1, i].
        registry.create_session("call-a").await.unwrap();
        registry.create_session("call-b").await.unwrap();

        let a = scheduler.start("call-a").await.unwrap();
        let b = scheduler.start("call-b").await.unwrap();
        a.await.unwrap();
        b.await.unwrap();

        let own = |load: u8| -> Vec<(String, Vec<u8>)> {
            (0..3).map(|i| ("pcm16".to_string(), vec![load, i])).collect()
        };
        assert_eq!(transport.audio_for("call-a"), own(0));
        assert_eq!(transport.audio_for("call-b"), own(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_waits_for_audio_still_loading() {
        let transport = Arc::new(RecordingTransport::new());
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(SlowAssetLoader::new(
                MemoryAssetLoader::new(vec![("pcm16", vec![vec![0], vec![1]])]),
                Duration::from_millis(20),
            )),
            Vec::new(),
        ));
        let scheduler = ChunkScheduler::new(
            registry.clone(),
            transport.clone(),
            AppState::new(AppConfig::default()),
        );

        let mut pending = registry.reserve("call-1").await.unwrap();
        let setup = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.load(&mut pending).await.unwrap();
            })
        };

        let started_at = Instant::now();
        let playback = scheduler.start("call-1").await.expect("start after load");
        assert_eq!(Instant::now() - started_at, Duration::from_millis(20));
        setup.await.unwrap();
        playback.await.unwrap();

        assert_eq!(transport.audio_for("call-1").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_removed_while_loading_never_plays() {
        let transport = Arc::new(RecordingTransport::new());
        let registry = Arc::new(SessionRegistry::new(
            Arc::new(SlowAssetLoader::new(
                MemoryAssetLoader::new(vec![("pcm16", vec![vec![0]])]),
                Duration::from_millis(20),
            )),
            Vec::new(),
        ));
        let scheduler = ChunkScheduler::new(
            registry.clone(),
            transport.clone(),
            AppState::new(AppConfig::default()),
        );

        let mut pending = registry.reserve("call-1").await.unwrap();
        let setup = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry.load(&mut pending).await.unwrap();
            })
        };
        let start = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.start("call-1").await.is_some() })
        };
        sleep(Duration::from_millis(5)).await;
        registry.remove("call-1");
        setup.await.unwrap();

        assert!(!start.await.unwrap());
        assert!(transport.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_rejected() {
        let transport = Arc::new(RecordingTransport::new());
        let (scheduler, registry, _) = scheduler_with(
            vec![("pcm16", vec![vec![0], vec![1]])],
            transport.clone(),
            AppConfig::default(),
        );
        registry.create_session("call-1").await.unwrap();

        let first = scheduler.start("call-1").await.unwrap();
        assert!(scheduler.start("call-1").await.is_none());
        assert!(scheduler.start("unknown").await.is_none());
        first.await.unwrap();

        assert_eq!(transport.audio_for("call-1").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failure_ends_session_without_retry() {
        let transport = Arc::new(RecordingTransport::failing_audio_after(2));
        let (scheduler, registry, state) = scheduler_with(
            vec![("pcm16", vec![vec![0]; 5])],
            transport.clone(),
            AppConfig::default(),
        );
        registry.create_session("call-1").await.unwrap();

        scheduler.start("call-1").await.unwrap().await.unwrap();

        assert_eq!(transport.audio_for("call-1").len(), 2);
        assert!(registry.is_empty());
        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.errors.get("transport"), Some(&1));
        assert_eq!(metrics.chunks_emitted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_pacing_waits_for_acknowledgment() {
        let transport = Arc::new(RecordingTransport::holding_acks());
        let mut config = AppConfig::default();
        config.playback.pacing_mode = PacingMode::Ack;
        let (scheduler, registry, state) = scheduler_with(
            vec![("pcm16", vec![vec![0]; 3])],
            transport.clone(),
            config,
        );
        registry.create_session("call-1").await.unwrap();

        let task = scheduler.start("call-1").await.unwrap();
        sleep(Duration::from_millis(500)).await;
        assert_eq!(transport.audio_for("call-1").len(), 1);

        transport.release_acks();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(transport.audio_for("call-1").len(), 2);

        transport.drop_acks();
        task.await.unwrap();

        assert_eq!(transport.audio_for("call-1").len(), 2);
        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.acks_received, 1);
        assert_eq!(metrics.errors.get("transport"), Some(&1));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_pacing_does_not_wait_for_acks() {
        let transport = Arc::new(RecordingTransport::holding_acks());
        let (scheduler, registry, state) = scheduler_with(
            vec![("pcm16", vec![vec![0]; 3])],
            transport.clone(),
            AppConfig::default(),
        );
        registry.create_session("call-1").await.unwrap();

        scheduler.start("call-1").await.unwrap().await.unwrap();

        assert_eq!(transport.audio_for("call-1").len(), 3);
        assert_eq!(state.get_metrics_snapshot().acks_received, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_pacing_gives_up_after_ack_timeout() {
        let transport = Arc::new(RecordingTransport::holding_acks());
        let mut config = AppConfig::default();
        config.playback.pacing_mode = PacingMode::Ack;
        let (scheduler, registry, state) = scheduler_with(
            vec![("pcm16", vec![vec![0]; 3])],
            transport.clone(),
            config,
        );
        registry.create_session("call-1").await.unwrap();

        let started_at = Instant::now();
        scheduler.start("call-1").await.unwrap().await.unwrap();

        assert_eq!(Instant::now() - started_at, Duration::from_millis(5000));
        assert_eq!(transport.audio_for("call-1").len(), 1);
        assert_eq!(state.get_metrics_snapshot().errors.get("transport"), Some(&1));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_pacing_stops_waiting_for_unanswered_acks() {
        let transport = Arc::new(RecordingTransport::holding_acks());
        let (scheduler, registry, _) = scheduler_with(
            vec![("pcm16", vec![vec![0]; 3])],
            transport.clone(),
            AppConfig::default(),
        );
        registry.create_session("call-1").await.unwrap();

        scheduler.start("call-1").await.unwrap().await.unwrap();
        assert_eq!(transport.open_acks(), 3);

        sleep(Duration::from_millis(5000)).await;
        assert_eq!(transport.open_acks(), 0);
    }
}
