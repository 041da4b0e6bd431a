//! # Audio Playback Module
//!
//! Everything between the audio files on disk and the `audio` events sent to
//! the call platform.
//!
//! ## Key Components:
//! - **Streams**: Format-tagged chunk queues with progress labels
//! - **Loader**: Reads pre-segmented audio (`{root}/{format}/output_NNN.{ext}`)
//! - **Session Registry**: Per-call playback state, keyed by session id
//! - **Scheduler**: One task per call, emitting a chunk per pacing interval
//!
//! ## Playback Order:
//! Streams play in configured order; within a stream, segments play in index
//! order. A stream with no segments is skipped without a pause.

pub mod loader;     // Segment loading from disk
pub mod scheduler;  // Paced chunk emission
pub mod session;    // Session state management
pub mod stream;     // Chunk queues and labels
