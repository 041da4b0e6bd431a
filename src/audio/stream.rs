//! # Audio Streams
//!
//! An [`AudioStream`] is one format-tagged, ordered queue of pre-segmented
//! audio chunks. Chunks leave the queue strictly front to back; each popped
//! chunk carries a progress label so log lines show how far playback got.

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

/// Format tag forwarded verbatim to the peer as `audioFormat`.
///
/// ## Why a newtype:
/// The peer decides which formats it accepts (`pcm16`, `alaw`, `mulaw`, `mp3`...).
/// Wrapping the string keeps it from being mixed up with session ids while
/// still letting config add formats without a code change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct AudioFormat(String);

impl AudioFormat {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AudioFormat {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// One unit of audio payload, ready to hand to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub format: AudioFormat,
    /// `"<format> <n>"` where `n` is the 1-based position within its stream
    pub label: String,
    pub data: Vec<u8>,
}

/// An ordered, format-tagged queue of chunks.
///
/// ## Ownership:
/// Owned by exactly one session's playback state. Chunks are moved out as
/// they are emitted, so an exhausted stream holds no audio.
#[derive(Debug, Clone)]
pub struct AudioStream {
    format: AudioFormat,
    total_chunks: usize,
    chunks: VecDeque<Vec<u8>>,
}

impl AudioStream {
    /// Build a stream from segments already in playback order.
    pub fn new(format: AudioFormat, chunks: Vec<Vec<u8>>) -> Self {
        Self {
            format,
            total_chunks: chunks.len(),
            chunks: chunks.into(),
        }
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    pub fn remaining(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_exhausted(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Take the head chunk, labelled with its 1-based progress counter.
    ///
    /// The counter is `total_chunks - remaining` after the pop, so a
    /// three-chunk stream yields labels ending in 1, 2, 3.
    pub fn pop_chunk(&mut self) -> Option<Chunk> {
        let data = self.chunks.pop_front()?;
        let progress = self.total_chunks - self.chunks.len();
        Some(Chunk {
            format: self.format.clone(),
            label: format!("{} {}", self.format, progress),
            data,
        })
    }
}
