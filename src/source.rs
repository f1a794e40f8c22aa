use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::config::DetectionConfig;
use crate::storage::{StoreError, StreamStore};

const NETWORK_SCHEMES: [&str; 3] = ["http://", "https://", "rtsp://"];

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("empty stream id in reference {0}")]
    EmptyStreamId(String),
    #[error("stream not found: {0}")]
    StreamNotFound(String),
    #[error("stream is inactive: {0}")]
    StreamInactive(String),
    #[error("video file not found, tried {tried:?}")]
    FileNotFound { tried: Vec<PathBuf> },
    #[error("stream lookup failed: {0}")]
    Store(#[from] StoreError),
}

/// A concrete, openable media source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedSource {
    Network(String),
    File(PathBuf),
}

impl ResolvedSource {
    /// Live sources are retried with backoff; files are looped.
    pub fn is_live(&self) -> bool {
        matches!(self, ResolvedSource::Network(_))
    }

    pub fn uri(&self) -> String {
        match self {
            ResolvedSource::Network(url) => url.clone(),
            ResolvedSource::File(path) => path.to_string_lossy().into_owned(),
        }
    }
}

impl fmt::Display for ResolvedSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolvedSource::Network(url) => write!(f, "{url}"),
            ResolvedSource::File(path) => write!(f, "{}", path.display()),
        }
    }
}

pub fn is_network_reference(reference: &str) -> bool {
    let lower = reference.trim().to_ascii_lowercase();
    NETWORK_SCHEMES.iter().any(|s| lower.starts_with(s))
}

/// Pulls the stream id out of `.../streams/feed/<id>?query#fragment`.
fn extract_stream_id<'a>(reference: &'a str, marker: &str) -> Option<&'a str> {
    let (_, tail) = reference.rsplit_once(marker)?;
    let id = tail.split(['?', '#']).next().unwrap_or_default();
    Some(id.trim_end_matches('/'))
}

pub struct SourceResolver {
    streams: Arc<dyn StreamStore>,
    search_dirs: Vec<PathBuf>,
    marker: String,
}

impl SourceResolver {
    pub fn new(streams: Arc<dyn StreamStore>, config: &DetectionConfig) -> Self {
        Self {
            streams,
            search_dirs: config.search_dirs.clone(),
            marker: config.stream_path_marker.clone(),
        }
    }

    pub async fn resolve(&self, reference: &str) -> Result<ResolvedSource, ResolveError> {
        let reference = reference.trim();

        let target = match extract_stream_id(reference, &self.marker) {
            Some(stream_id) => {
                if stream_id.is_empty() {
                    return Err(ResolveError::EmptyStreamId(reference.to_string()));
                }
                let stream = self
                    .streams
                    .get(stream_id)
                    .await?
                    .ok_or_else(|| ResolveError::StreamNotFound(stream_id.to_string()))?;
                if !stream.active {
                    return Err(ResolveError::StreamInactive(stream_id.to_string()));
                }
                tracing::debug!(stream = %stream_id, path = %stream.video_path, "resolved stream indirection");
                stream.video_path
            }
            None => reference.to_string(),
        };

        if is_network_reference(&target) {
            return Ok(ResolvedSource::Network(target));
        }

        self.resolve_file(Path::new(&target)).await
    }

    async fn resolve_file(&self, path: &Path) -> Result<ResolvedSource, ResolveError> {
        let candidates = self.candidates(path);

        for candidate in &candidates {
            tracing::trace!(path = %candidate.display(), "checking candidate path");
            if is_file(candidate).await {
                let resolved = tokio::fs::canonicalize(candidate)
                    .await
                    .unwrap_or_else(|_| candidate.clone());
                return Ok(ResolvedSource::File(resolved));
            }
        }

        Err(ResolveError::FileNotFound { tried: candidates })
    }

    fn candidates(&self, path: &Path) -> Vec<PathBuf> {
        if path.is_absolute() {
            return vec![path.to_path_buf()];
        }

        let mut candidates = vec![path.to_path_buf()];
        for dir in &self.search_dirs {
            candidates.push(dir.join(path));
        }
        if let Some(name) = path.file_name() {
            for dir in &self.search_dirs {
                candidates.push(dir.join(name));
            }
        }
        candidates.dedup();
        candidates
    }
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}
