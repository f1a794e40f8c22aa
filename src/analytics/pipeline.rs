use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::alert::AlertEmitter;
use crate::camera::{CaptureError, CaptureSession, RawFrame};
use crate::config::DetectionConfig;
use crate::storage::CameraRecord;

use super::classifier::{Classifier, InferenceInvoker};
use super::confirm::{ConfirmationPolicy, ConfirmationState, Observation};
use super::preprocess::FramePreprocessor;
use super::window::SlidingWindow;

/// Why a pipeline stopped running.
#[derive(Debug)]
pub enum PipelineExit {
    Cancelled,
    Failed(CaptureError),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineStats {
    pub frames: u64,
    pub skipped: u64,
    pub windows_scored: u64,
    pub alerts: u64,
}

pub struct DetectionPipeline {
    camera: CameraRecord,
    capture: CaptureSession,
    preprocessor: FramePreprocessor,
    window: SlidingWindow,
    invoker: InferenceInvoker,
    emitter: Arc<AlertEmitter>,
    policy: ConfirmationPolicy,
    state: ConfirmationState,
    frame_interval: Duration,
    stats: PipelineStats,
}

impl DetectionPipeline {
    pub fn new(
        camera: CameraRecord,
        capture: CaptureSession,
        classifier: Arc<dyn Classifier>,
        emitter: Arc<AlertEmitter>,
        config: &DetectionConfig,
    ) -> Self {
        Self {
            camera,
            capture,
            preprocessor: FramePreprocessor::new(config.image_width, config.image_height),
            window: SlidingWindow::new(config.sequence_length),
            invoker: InferenceInvoker::new(classifier, config.accident_threshold),
            emitter,
            policy: ConfirmationPolicy {
                threshold: config.confirmation_threshold,
                cooldown_cycles: config.cooldown_frames,
            },
            state: ConfirmationState::default(),
            frame_interval: config.frame_interval(),
            stats: PipelineStats::default(),
        }
    }

    /// Runs until `cancel` fires or the capture gives up. The capture handle
    /// is released before this returns on every path.
    pub async fn run(mut self, cancel: CancellationToken) -> PipelineExit {
        tracing::info!(camera = %self.camera.id, source = %self.capture.source(), "detection pipeline started");

        let exit = loop {
            if cancel.is_cancelled() {
                break PipelineExit::Cancelled;
            }

            let frame = match self.capture.next_frame(&cancel).await {
                Ok(Some(frame)) => frame,
                Ok(None) => break PipelineExit::Cancelled,
                Err(e) => break PipelineExit::Failed(e),
            };

            self.process_frame(frame).await;

            tokio::select! {
                _ = cancel.cancelled() => break PipelineExit::Cancelled,
                _ = tokio::time::sleep(self.frame_interval) => {}
            }
        };

        self.capture.release();
        let capture = self.capture.stats();

        match &exit {
            PipelineExit::Cancelled => tracing::info!(
                camera = %self.camera.id,
                frames_read = capture.frames_read,
                frames = self.stats.frames,
                skipped = self.stats.skipped,
                windows = self.stats.windows_scored,
                rewinds = capture.rewinds,
                reopens = capture.reopens,
                alerts = self.stats.alerts,
                "detection pipeline stopped"
            ),
            PipelineExit::Failed(e) => tracing::error!(
                camera = %self.camera.id,
                frames_read = capture.frames_read,
                frames = self.stats.frames,
                skipped = self.stats.skipped,
                windows = self.stats.windows_scored,
                rewinds = capture.rewinds,
                reopens = capture.reopens,
                alerts = self.stats.alerts,
                error = %e,
                "detection pipeline failed"
            ),
        }

        exit
    }

    async fn process_frame(&mut self, frame: RawFrame) {
        self.stats.frames += 1;

        let tensor = match self.preprocessor.process(&frame) {
            Ok(tensor) => tensor,
            Err(e) => {
                self.stats.skipped += 1;
                tracing::warn!(camera = %self.camera.id, error = %e, "skipping frame");
                return;
            }
        };
        self.window.push(tensor);

        let (observation, confidence) = match self.window.snapshot() {
            Ok(Some(window)) => {
                let result = self.invoker.classify(&self.camera.id, window).await;
                self.stats.windows_scored += 1;
                (
                    Observation::Scored {
                        is_accident: result.is_accident,
                    },
                    result.confidence,
                )
            }
            Ok(None) => {
                tracing::trace!(
                    camera = %self.camera.id,
                    buffered = self.window.len(),
                    needed = self.window.capacity(),
                    "filling window"
                );
                (Observation::Buffering, 0.0)
            }
            Err(e) => {
                self.stats.skipped += 1;
                tracing::warn!(camera = %self.camera.id, error = %e, "failed to assemble window");
                return;
            }
        };

        let transition = self.state.step(observation, &self.policy);

        if transition.state.consecutive_positives() > 0 {
            tracing::debug!(
                camera = %self.camera.id,
                count = transition.state.consecutive_positives(),
                threshold = self.policy.threshold,
                "accident candidate"
            );
        }

        if transition.fire {
            self.stats.alerts += 1;
            self.emitter.emit(&self.camera, confidence).await;
        }

        if transition.state.in_cooldown() != self.state.in_cooldown() {
            tracing::debug!(
                camera = %self.camera.id,
                cooldown = transition.state.in_cooldown(),
                "cooldown changed"
            );
        }

        self.state = transition.state;
    }
}
