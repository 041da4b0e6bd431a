//! # Application State Management
//!
//! Shared state handed to the dispatcher and every session's scheduler task:
//! the loaded configuration plus the playback counters that serve as the
//! client's observability sink.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: The dispatcher and every scheduler task hold a reference
//! - **RwLock**: Many tasks bump counters, a shutdown summary reads them
//! - **Poisoning**: Counters are plain integers, so a panic mid-update cannot
//!   leave them in a broken state; a poisoned lock is recovered, not propagated

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use std::time::Instant;

/// The main application state shared across the dispatcher and scheduler tasks.
///
/// ## Rust Concepts:
/// - **#[derive(Debug, Clone)]**: Cloning only bumps the Arc reference counts
/// - **Arc<AppConfig>**: Configuration is read-only after start-up
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration, validated before the state is built
    pub config: Arc<AppConfig>,

    /// Playback counters, updated by every session
    pub metrics: Arc<RwLock<PlaybackMetrics>>,

    /// When the client started
    pub start_time: Instant,
}

/// Counters collected across all sessions since start-up.
///
/// ## Why these metrics matter:
/// - **sessions_created / sessions_retired**: Sessions that were set up and
///   sessions that finished or were hung up
/// - **chunks_emitted / acks_received**: A growing gap means the peer is slow
///   to acknowledge and timer pacing is buffering on its side
/// - **errors**: Failures by kind (`asset_load`, `transport`, ...)
#[derive(Debug, Default, Clone)]
pub struct PlaybackMetrics {
    pub sessions_created: u64,
    pub sessions_retired: u64,
    pub chunks_emitted: u64,
    pub acks_received: u64,
    pub errors: HashMap<String, u64>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
            metrics: Arc::new(RwLock::new(PlaybackMetrics::default())),
            start_time: Instant::now(),
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, PlaybackMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_session_created(&self) {
        self.metrics_mut().sessions_created += 1;
    }

    pub fn record_session_retired(&self) {
        self.metrics_mut().sessions_retired += 1;
    }

    pub fn record_chunk_emitted(&self) {
        self.metrics_mut().chunks_emitted += 1;
    }

    pub fn record_ack(&self) {
        self.metrics_mut().acks_received += 1;
    }

    /// Count one error under its kind.
    ///
    /// ## HashMap operations:
    /// The first error of a kind creates the entry, later ones increment it.
    pub fn record_error(&self, kind: &str) {
        *self.metrics_mut().errors.entry(kind.to_string()).or_default() += 1;
    }

    /// Get a snapshot of current metrics.
    ///
    /// Clones under a read lock so the caller can log without holding it.
    pub fn get_metrics_snapshot(&self) -> PlaybackMetrics {
        self.metrics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl PlaybackMetrics {
    /// Total number of errors across all kinds.
    pub fn error_count(&self) -> u64 {
        self.errors.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let state = AppState::new(AppConfig::default());
        state.record_session_created();
        state.record_chunk_emitted();
        state.record_chunk_emitted();
        state.record_ack();
        state.record_error("transport");
        state.record_error("transport");
        state.record_error("asset_load");

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.sessions_created, 1);
        assert_eq!(snapshot.chunks_emitted, 2);
        assert_eq!(snapshot.acks_received, 1);
        assert_eq!(snapshot.errors.get("transport"), Some(&2));
        assert_eq!(snapshot.error_count(), 3);
    }

    #[test]
    fn test_clones_share_metrics() {
        let state = AppState::new(AppConfig::default());
        let other = state.clone();
        other.record_session_retired();
        assert_eq!(state.get_metrics_snapshot().sessions_retired, 1);
    }
}
