use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::DetectionConfig;
use crate::source::ResolvedSource;

use super::{CaptureError, CaptureOpener, FrameReader, RawFrame};

#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureStats {
    pub frames_read: u64,
    pub rewinds: u64,
    pub reopens: u64,
}

enum ReadFailure {
    EndOfStream,
    Error(CaptureError),
}

/// Owns the capture handle of one running pipeline.
///
/// File sources are looped: a clean end of stream reopens the file from the
/// start without counting as a failure. Live sources, decode errors and failed
/// reopens count toward `max_failures`, with `backoff` between attempts.
pub struct CaptureSession {
    camera_id: String,
    source: ResolvedSource,
    opener: Arc<dyn CaptureOpener>,
    reader: Option<Box<dyn FrameReader>>,
    consecutive_failures: u32,
    frames_since_open: u64,
    max_failures: u32,
    backoff: Duration,
    stats: CaptureStats,
}

impl CaptureSession {
    /// Opens the source once. Failure here is terminal for the pipeline.
    pub async fn open(
        camera_id: String,
        source: ResolvedSource,
        opener: Arc<dyn CaptureOpener>,
        config: &DetectionConfig,
    ) -> Result<Self, CaptureError> {
        tracing::info!(camera = %camera_id, source = %source, "opening capture");
        let reader = open_reader(&opener, &source).await?;

        Ok(Self {
            camera_id,
            source,
            opener,
            reader: Some(reader),
            consecutive_failures: 0,
            frames_since_open: 0,
            max_failures: config.max_consecutive_failures,
            backoff: config.retry_backoff(),
            stats: CaptureStats::default(),
        })
    }

    pub fn source(&self) -> &ResolvedSource {
        &self.source
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn stats(&self) -> CaptureStats {
        self.stats
    }

    /// Drops the capture handle, releasing the underlying device or file.
    pub fn release(&mut self) {
        if self.reader.take().is_some() {
            tracing::debug!(camera = %self.camera_id, "capture handle released");
        }
    }

    /// Returns the next frame, `Ok(None)` once `cancel` fires, or
    /// `CaptureError::Exhausted` when the failure ceiling is reached.
    pub async fn next_frame(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<RawFrame>, CaptureError> {
        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                read = self.read_once() => read,
            };

            let failure = match read {
                Ok(Some(frame)) => {
                    self.consecutive_failures = 0;
                    self.frames_since_open += 1;
                    self.stats.frames_read += 1;
                    return Ok(Some(frame));
                }
                Ok(None) => ReadFailure::EndOfStream,
                Err(e) => ReadFailure::Error(e),
            };

            if !self.source.is_live() {
                if let ReadFailure::EndOfStream = failure {
                    if self.rewind().await {
                        continue;
                    }
                }
            }

            self.consecutive_failures += 1;
            match &failure {
                ReadFailure::EndOfStream => tracing::warn!(
                    camera = %self.camera_id,
                    failures = self.consecutive_failures,
                    max = self.max_failures,
                    "failed to read frame"
                ),
                ReadFailure::Error(e) => tracing::warn!(
                    camera = %self.camera_id,
                    failures = self.consecutive_failures,
                    max = self.max_failures,
                    error = %e,
                    "failed to read frame"
                ),
            }

            if self.consecutive_failures >= self.max_failures {
                tracing::error!(
                    camera = %self.camera_id,
                    failures = self.consecutive_failures,
                    "max consecutive failures reached"
                );
                self.release();
                return Err(CaptureError::Exhausted(self.consecutive_failures));
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.backoff) => {}
            }

            self.release();
            if let Err(e) = self.reopen().await {
                tracing::warn!(camera = %self.camera_id, error = %e, "reopen failed");
            }
        }
    }

    /// Restarts a file source from its first frame. A file that ends without
    /// yielding any frame since it was opened is not rewound again.
    async fn rewind(&mut self) -> bool {
        if self.frames_since_open == 0 {
            tracing::warn!(camera = %self.camera_id, "file ended without producing frames");
            return false;
        }

        tracing::info!(camera = %self.camera_id, "video file ended, restarting from beginning");
        self.release();
        match self.reopen().await {
            Ok(()) => {
                self.consecutive_failures = 0;
                self.stats.rewinds += 1;
                true
            }
            Err(e) => {
                tracing::warn!(camera = %self.camera_id, error = %e, "failed to reopen video file");
                false
            }
        }
    }

    async fn reopen(&mut self) -> Result<(), CaptureError> {
        let reader = open_reader(&self.opener, &self.source).await?;
        self.reader = Some(reader);
        self.frames_since_open = 0;
        self.stats.reopens += 1;
        Ok(())
    }

    /// Runs the blocking read on the blocking pool so a stalled device cannot
    /// hold up the scheduler.
    async fn read_once(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        let mut reader = self.reader.take().ok_or(CaptureError::NotOpen)?;
        let (reader, result) = tokio::task::spawn_blocking(move || {
            let result = reader.read();
            (reader, result)
        })
        .await?;
        self.reader = Some(reader);
        result
    }
}

async fn open_reader(
    opener: &Arc<dyn CaptureOpener>,
    source: &ResolvedSource,
) -> Result<Box<dyn FrameReader>, CaptureError> {
    let opener = Arc::clone(opener);
    let source = source.clone();
    tokio::task::spawn_blocking(move || opener.open(&source)).await?
}
