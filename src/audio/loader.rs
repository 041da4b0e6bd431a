//! # Audio Asset Loading
//!
//! Reads the pre-segmented audio for every configured stream into memory.
//! Segments are addressed by a deterministic naming scheme:
//!
//! ```text
//! {root}/{format}/output_{index:03}.{extension}
//! ```
//!
//! with `index` counting from zero. A session cannot start with a hole in its
//! audio, so a single missing or unreadable segment fails the whole load.
//! An empty segment is kept; it plays as a zero-length chunk.

use crate::audio::stream::{AudioFormat, AudioStream};
use crate::config::StreamSpec;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Source of audio streams for new sessions.
///
/// ## Why a trait:
/// The registry only needs "give me these streams"; the file system is one
/// answer, an in-memory set of chunks in tests is another.
#[async_trait]
pub trait AssetLoader: Send + Sync {
    /// Load one stream per spec, in spec order, each with its segments in index order.
    async fn load_streams(&self, specs: &[StreamSpec]) -> AppResult<Vec<AudioStream>>;
}

/// Path of segment `index` for `spec` under `root`.
pub fn segment_path(root: &Path, spec: &StreamSpec, index: usize) -> PathBuf {
    root.join(&spec.format)
        .join(format!("output_{:03}.{}", index, spec.extension))
}

/// Loads segments from a directory tree on the local file system.
#[derive(Debug, Clone)]
pub struct FsAssetLoader {
    root: PathBuf,
}

impl FsAssetLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn read_segment(&self, spec: &StreamSpec, index: usize) -> AppResult<Vec<u8>> {
        let path = segment_path(&self.root, spec, index);
        let bytes = tokio::fs::read(&path).await.map_err(|err| AppError::AssetLoad {
            path: path.clone(),
            reason: err.to_string(),
        })?;

        if bytes.is_empty() {
            warn!(path = %path.display(), "Audio segment is empty");
        }

        Ok(bytes)
    }
}

#[async_trait]
impl AssetLoader for FsAssetLoader {
    async fn load_streams(&self, specs: &[StreamSpec]) -> AppResult<Vec<AudioStream>> {
        let mut streams = Vec::with_capacity(specs.len());

        for spec in specs {
            let mut chunks = Vec::with_capacity(spec.total_count);
            for index in 0..spec.total_count {
                chunks.push(self.read_segment(spec, index).await?);
            }

            let bytes: usize = chunks.iter().map(Vec::len).sum();
            debug!(
                format = %spec.format,
                segments = chunks.len(),
                bytes,
                "Loaded audio stream"
            );

            streams.push(AudioStream::new(AudioFormat::new(spec.format.clone()), chunks));
        }

        Ok(streams)
    }
}
