use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, FixedOffset};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::alert::AlertEmitter;
use crate::analytics::{DetectionPipeline, InferenceError, PipelineExit, SharedModel};
use crate::camera::{CaptureError, CaptureOpener, CaptureSession};
use crate::config::DetectionConfig;
use crate::source::{ResolveError, ResolvedSource, SourceResolver};
use crate::storage::{local_now, CameraStore, StoreError};

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("camera not found: {0}")]
    CameraNotFound(String),
    #[error("failed to resolve video source: {0}")]
    Resolve(#[from] ResolveError),
    #[error("failed to open video source: {0}")]
    Capture(#[from] CaptureError),
    #[error("failed to load detection model: {0}")]
    Model(#[from] InferenceError),
    #[error("camera store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyActive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Stopped,
    NotActive,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub source: String,
    pub started_at: DateTime<FixedOffset>,
}

struct ActiveSession {
    generation: u64,
    cancel: CancellationToken,
    pipeline: AbortHandle,
    handle: JoinHandle<()>,
    source: ResolvedSource,
    started_at: DateTime<FixedOffset>,
}

struct Inner {
    cameras: Arc<dyn CameraStore>,
    resolver: SourceResolver,
    opener: Arc<dyn CaptureOpener>,
    model: SharedModel,
    emitter: Arc<AlertEmitter>,
    config: DetectionConfig,
    tz: Tz,
    locks: tokio::sync::RwLock<HashMap<String, Arc<Mutex<()>>>>,
    sessions: RwLock<HashMap<String, ActiveSession>>,
    next_generation: AtomicU64,
}

/// Registry of running detection pipelines, at most one per camera.
///
/// Start, stop and pipeline self-termination for a camera are serialized by
/// a per-camera lock, so a burst of requests for the same camera settles on
/// a single session while different cameras never wait on each other.
#[derive(Clone)]
pub struct DetectionManager {
    inner: Arc<Inner>,
}

impl DetectionManager {
    pub fn new(
        cameras: Arc<dyn CameraStore>,
        resolver: SourceResolver,
        opener: Arc<dyn CaptureOpener>,
        model: SharedModel,
        emitter: Arc<AlertEmitter>,
        config: DetectionConfig,
        tz: Tz,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cameras,
                resolver,
                opener,
                model,
                emitter,
                config,
                tz,
                locks: tokio::sync::RwLock::new(HashMap::new()),
                sessions: RwLock::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub async fn start(&self, camera_id: &str) -> Result<StartOutcome, DetectionError> {
        let lock = self.camera_lock(camera_id).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.start_locked(camera_id).await
        };
        self.release_lock(camera_id, lock).await;
        outcome
    }

    async fn start_locked(&self, camera_id: &str) -> Result<StartOutcome, DetectionError> {
        if self.status(camera_id) {
            tracing::info!(camera = %camera_id, "detection already active");
            return Ok(StartOutcome::AlreadyActive);
        }

        let camera = self
            .inner
            .cameras
            .get(camera_id)
            .await?
            .ok_or_else(|| DetectionError::CameraNotFound(camera_id.to_string()))?;

        if !self.inner.model.is_loaded() {
            tracing::info!(camera = %camera_id, "loading detection model");
        }
        let classifier = self.inner.model.get().await?;

        let source = match self.inner.resolver.resolve(&camera.url).await {
            Ok(source) => source,
            Err(e) => {
                tracing::error!(camera = %camera_id, url = %camera.url, error = %e, "failed to resolve video source");
                self.mark_inactive(camera_id).await;
                return Err(e.into());
            }
        };

        let capture = match CaptureSession::open(
            camera_id.to_string(),
            source.clone(),
            Arc::clone(&self.inner.opener),
            &self.inner.config,
        )
        .await
        {
            Ok(capture) => capture,
            Err(e) => {
                tracing::error!(camera = %camera_id, source = %source, error = %e, "failed to open video source");
                self.mark_inactive(camera_id).await;
                return Err(e.into());
            }
        };

        let started_at = local_now(self.inner.tz);
        self.inner
            .cameras
            .set_detection_active(camera_id, true, started_at)
            .await?;

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let pipeline = DetectionPipeline::new(
            camera,
            capture,
            classifier,
            Arc::clone(&self.inner.emitter),
            &self.inner.config,
        );

        let manager = self.clone();
        let id = camera_id.to_string();
        let token = cancel.clone();
        let pipeline_task = tokio::spawn(pipeline.run(token));
        let pipeline_abort = pipeline_task.abort_handle();
        let handle = tokio::spawn(async move {
            let ended_on_its_own = match pipeline_task.await {
                Ok(PipelineExit::Cancelled) => false,
                Ok(PipelineExit::Failed(_)) => true,
                Err(e) if e.is_cancelled() => false,
                Err(e) => {
                    tracing::error!(camera = %id, error = %e, "detection pipeline panicked");
                    true
                }
            };

            if ended_on_its_own {
                // Detached: a concurrent stop may be holding the camera lock
                // while it waits for this task to finish.
                tokio::spawn(async move {
                    manager.deregister_failed(&id, generation).await;
                });
            }
        });

        self.inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                camera_id.to_string(),
                ActiveSession {
                    generation,
                    cancel,
                    pipeline: pipeline_abort,
                    handle,
                    source: source.clone(),
                    started_at,
                },
            );

        tracing::info!(camera = %camera_id, source = %source, "detection started");
        Ok(StartOutcome::Started)
    }

    pub async fn stop(&self, camera_id: &str) -> StopOutcome {
        let lock = self.camera_lock(camera_id).await;
        let outcome = {
            let _guard = lock.lock().await;
            self.stop_locked(camera_id).await
        };
        self.release_lock(camera_id, lock).await;
        outcome
    }

    async fn stop_locked(&self, camera_id: &str) -> StopOutcome {
        let session = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(camera_id);

        let Some(session) = session else {
            tracing::info!(camera = %camera_id, "detection not active");
            return StopOutcome::NotActive;
        };

        session.cancel.cancel();
        let mut handle = session.handle;
        match tokio::time::timeout(self.inner.config.stop_grace(), &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(camera = %camera_id, error = %e, "detection task failed"),
            Err(_) => {
                tracing::warn!(camera = %camera_id, "detection task did not stop in time, aborting");
                session.pipeline.abort();
                handle.abort();
            }
        }

        self.mark_inactive(camera_id).await;
        tracing::info!(camera = %camera_id, "detection stopped");
        StopOutcome::Stopped
    }

    pub fn status(&self, camera_id: &str) -> bool {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(camera_id)
    }

    pub fn session(&self, camera_id: &str) -> Option<SessionInfo> {
        self.inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(camera_id)
            .map(|s| SessionInfo {
                source: s.source.to_string(),
                started_at: s.started_at,
            })
    }

    pub fn active_cameras(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Stops every running pipeline.
    pub async fn shutdown(&self) {
        let active = self.active_cameras();
        if active.is_empty() {
            return;
        }

        tracing::info!(count = active.len(), "stopping all detection sessions");
        for camera_id in active {
            self.stop(&camera_id).await;
        }
    }

    /// Removes a pipeline that ended on its own. A session registered by a
    /// later start carries a newer generation and is left alone.
    async fn deregister_failed(&self, camera_id: &str, generation: u64) {
        let lock = self.camera_lock(camera_id).await;
        {
            let _guard = lock.lock().await;
            self.deregister_locked(camera_id, generation).await;
        }
        self.release_lock(camera_id, lock).await;
    }

    async fn deregister_locked(&self, camera_id: &str, generation: u64) {
        let removed = {
            let mut sessions = self
                .inner
                .sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            match sessions.get(camera_id) {
                Some(session) if session.generation == generation => sessions.remove(camera_id),
                _ => None,
            }
        };

        if removed.is_some() {
            tracing::warn!(camera = %camera_id, "detection pipeline terminated, deregistering");
            self.mark_inactive(camera_id).await;
        }
    }

    async fn mark_inactive(&self, camera_id: &str) {
        let now = local_now(self.inner.tz);
        if let Err(e) = self
            .inner
            .cameras
            .set_detection_active(camera_id, false, now)
            .await
        {
            tracing::warn!(camera = %camera_id, error = %e, "failed to record detection stop");
        }
    }

    async fn camera_lock(&self, camera_id: &str) -> Arc<Mutex<()>> {
        {
            let locks = self.inner.locks.read().await;
            if let Some(lock) = locks.get(camera_id) {
                return Arc::clone(lock);
            }
        }

        let mut locks = self.inner.locks.write().await;
        Arc::clone(
            locks
                .entry(camera_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Drops the camera's lock entry when no other caller holds it. Clones
    /// are only handed out under the map lock, so the count cannot grow here.
    async fn release_lock(&self, camera_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.inner.locks.write().await;
        let unshared = match locks.get(camera_id) {
            Some(entry) => Arc::ptr_eq(entry, &lock) && Arc::strong_count(&lock) == 2,
            None => false,
        };
        if unshared {
            locks.remove(camera_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;

    use super::*;
    use crate::alert::{AlertRecord, StoredAlert};
    use crate::analytics::{Classifier, ScriptedClassifier};
    use crate::camera::mock::MockOpener;
    use crate::config::CameraConfig;
    use crate::storage::{AlertStore, MemoryAlertStore, MemoryCameraStore, MemoryStreamStore};

    struct Harness {
        manager: DetectionManager,
        cameras: Arc<MemoryCameraStore>,
        opener: Arc<MockOpener>,
        _dir: tempfile::TempDir,
    }

    fn camera(id: &str, url: &str) -> CameraConfig {
        CameraConfig {
            id: id.into(),
            name: format!("{id} junction"),
            location: "Ring Road".into(),
            url: url.into(),
        }
    }

    fn test_config(dir: &Path) -> DetectionConfig {
        DetectionConfig {
            sequence_length: 2,
            image_width: 4,
            image_height: 4,
            frame_interval_ms: 5,
            retry_backoff_ms: 1,
            stop_grace_ms: 2000,
            search_dirs: vec![dir.to_path_buf()],
            ..DetectionConfig::default()
        }
    }

    /// Alert store whose every call panics inside the pipeline task.
    struct PanickingAlertStore;

    #[async_trait]
    impl AlertStore for PanickingAlertStore {
        async fn insert(&self, _alert: AlertRecord) -> Result<u64, StoreError> {
            panic!("alert store unavailable")
        }

        async fn list(&self) -> Result<Vec<StoredAlert>, StoreError> {
            panic!("alert store unavailable")
        }

        async fn recipients(&self) -> Result<Vec<String>, StoreError> {
            panic!("alert store unavailable")
        }
    }

    fn harness_with(opener: MockOpener, model: SharedModel) -> Harness {
        harness_full(opener, model, Arc::new(MemoryAlertStore::new(Vec::new())), |_| {})
    }

    fn harness_full(
        opener: MockOpener,
        model: SharedModel,
        alerts: Arc<dyn AlertStore>,
        tweak: impl FnOnce(&mut DetectionConfig),
    ) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), b"data").unwrap();

        let cameras = Arc::new(MemoryCameraStore::new(&[
            camera("cam-1", "clip.mp4"),
            camera("cam-2", "uploads/clip.mp4"),
            camera("cam-live", "rtsp://10.0.0.9/live"),
            camera("cam-missing", "missing.mp4"),
        ]));
        let mut config = test_config(dir.path());
        tweak(&mut config);
        let resolver = SourceResolver::new(Arc::new(MemoryStreamStore::new(&[])), &config);
        let emitter = Arc::new(AlertEmitter::new(alerts, Vec::new(), chrono_tz::UTC));
        let opener = Arc::new(opener);

        let manager = DetectionManager::new(
            cameras.clone(),
            resolver,
            opener.clone(),
            model,
            emitter,
            config,
            chrono_tz::UTC,
        );

        Harness {
            manager,
            cameras,
            opener,
            _dir: dir,
        }
    }

    fn scripted_model() -> SharedModel {
        SharedModel::new(|| Ok(Arc::new(ScriptedClassifier::new(&[], 0.1)) as Arc<dyn Classifier>))
    }

    fn harness(opener: MockOpener) -> Harness {
        harness_with(opener, scripted_model())
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let h = harness(MockOpener::clip(10_000));

        assert_eq!(h.manager.start("cam-1").await.unwrap(), StartOutcome::Started);
        assert!(h.manager.status("cam-1"));
        assert!(h.manager.session("cam-1").unwrap().source.ends_with("clip.mp4"));

        let record = h.cameras.get("cam-1").await.unwrap().unwrap();
        assert!(record.detection_active);
        assert!(record.detection_started_at.is_some());

        assert_eq!(h.manager.stop("cam-1").await, StopOutcome::Stopped);
        assert!(!h.manager.status("cam-1"));
        assert!(wait_until(|| h.opener.live_readers() == 0).await);

        let record = h.cameras.get("cam-1").await.unwrap().unwrap();
        assert!(!record.detection_active);
        assert!(record.detection_stopped_at.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_start_is_noop() {
        let h = harness(MockOpener::clip(10_000));

        assert_eq!(h.manager.start("cam-1").await.unwrap(), StartOutcome::Started);
        assert_eq!(h.manager.start("cam-1").await.unwrap(), StartOutcome::AlreadyActive);
        assert_eq!(h.manager.active_cameras(), vec!["cam-1"]);
        assert_eq!(h.opener.live_readers(), 1);

        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_inactive_camera() {
        let h = harness(MockOpener::clip(10));
        assert_eq!(h.manager.stop("cam-1").await, StopOutcome::NotActive);
        assert_eq!(h.manager.stop("no-such-camera").await, StopOutcome::NotActive);
    }

    #[tokio::test]
    async fn test_unknown_camera_rejected() {
        let h = harness(MockOpener::clip(10));
        assert!(matches!(
            h.manager.start("no-such-camera").await,
            Err(DetectionError::CameraNotFound(_))
        ));
        assert_eq!(h.opener.opens(), 0);
    }

    #[tokio::test]
    async fn test_missing_file_fails_start() {
        let h = harness(MockOpener::clip(10));

        let result = h.manager.start("cam-missing").await;
        assert!(matches!(
            result,
            Err(DetectionError::Resolve(ResolveError::FileNotFound { .. }))
        ));
        assert!(!h.manager.status("cam-missing"));
        assert_eq!(h.opener.opens(), 0);

        let record = h.cameras.get("cam-missing").await.unwrap().unwrap();
        assert!(!record.detection_active);
        assert!(record.detection_stopped_at.is_some());
    }

    #[tokio::test]
    async fn test_open_failure_fails_start() {
        let h = harness(MockOpener::clip(10).fail_open_after(0));

        assert!(matches!(
            h.manager.start("cam-1").await,
            Err(DetectionError::Capture(CaptureError::Open(_)))
        ));
        assert!(!h.manager.status("cam-1"));
        assert!(!h.cameras.get("cam-1").await.unwrap().unwrap().detection_active);
    }

    #[tokio::test]
    async fn test_upload_file_name_fallback() {
        let h = harness(MockOpener::clip(10_000));

        assert_eq!(h.manager.start("cam-2").await.unwrap(), StartOutcome::Started);
        h.manager.shutdown().await;
        assert!(wait_until(|| h.opener.live_readers() == 0).await);
    }

    #[tokio::test]
    async fn test_failure_ceiling_deregisters_camera() {
        let h = harness(MockOpener::clip(0));

        assert_eq!(h.manager.start("cam-live").await.unwrap(), StartOutcome::Started);

        let manager = h.manager.clone();
        assert!(wait_until(|| !manager.status("cam-live")).await);
        assert!(wait_until(|| h.opener.live_readers() == 0).await);

        let cameras = h.cameras.clone();
        let mut inactive = false;
        for _ in 0..200 {
            if !cameras.get("cam-live").await.unwrap().unwrap().detection_active {
                inactive = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(inactive);

        // The camera can be started again once it has been deregistered.
        h.opener.set_frames_per_open(10_000);
        assert_eq!(h.manager.start("cam-live").await.unwrap(), StartOutcome::Started);
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_concurrent_starts_create_one_session() {
        let h = harness(MockOpener::clip(10_000));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = h.manager.clone();
            tasks.push(tokio::spawn(async move { manager.start("cam-1").await }));
        }

        let mut started = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() == StartOutcome::Started {
                started += 1;
            }
        }

        assert_eq!(started, 1);
        assert_eq!(h.opener.live_readers(), 1);
        h.manager.shutdown().await;
        assert!(wait_until(|| h.opener.live_readers() == 0).await);
        assert!(h.manager.inner.locks.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_camera_locks_are_released() {
        let h = harness(MockOpener::clip(10_000));

        for i in 0..50 {
            let id = format!("unknown-{i}");
            assert!(h.manager.start(&id).await.is_err());
            assert_eq!(h.manager.stop(&id).await, StopOutcome::NotActive);
        }
        assert!(h.manager.inner.locks.read().await.is_empty());

        assert_eq!(h.manager.start("cam-1").await.unwrap(), StartOutcome::Started);
        assert_eq!(h.manager.stop("cam-1").await, StopOutcome::Stopped);
        assert!(h.manager.inner.locks.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_pipeline_is_deregistered() {
        let model = SharedModel::new(|| {
            Ok(Arc::new(ScriptedClassifier::new(&[], 0.95)) as Arc<dyn Classifier>)
        });
        let h = harness_full(
            MockOpener::clip(10_000),
            model,
            Arc::new(PanickingAlertStore),
            |config| config.confirmation_threshold = 1,
        );

        assert_eq!(h.manager.start("cam-1").await.unwrap(), StartOutcome::Started);

        let manager = h.manager.clone();
        assert!(wait_until(|| !manager.status("cam-1")).await);
        assert!(wait_until(|| h.opener.live_readers() == 0).await);

        let mut inactive = false;
        for _ in 0..200 {
            if !h.cameras.get("cam-1").await.unwrap().unwrap().detection_active {
                inactive = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(inactive);
        assert_eq!(h.manager.stop("cam-1").await, StopOutcome::NotActive);
    }

    #[tokio::test]
    async fn test_stop_aborts_pipeline_after_grace() {
        let classifier =
            Arc::new(ScriptedClassifier::new(&[], 0.1).with_delay(Duration::from_secs(1)));
        let shared = Arc::clone(&classifier);
        let model = SharedModel::new(move || Ok(Arc::clone(&shared) as Arc<dyn Classifier>));
        let h = harness_full(
            MockOpener::clip(10_000),
            model,
            Arc::new(MemoryAlertStore::new(Vec::new())),
            |config| config.stop_grace_ms = 50,
        );

        assert_eq!(h.manager.start("cam-1").await.unwrap(), StartOutcome::Started);
        assert!(wait_until(|| classifier.calls() >= 1).await);

        let begun = Instant::now();
        assert_eq!(h.manager.stop("cam-1").await, StopOutcome::Stopped);
        assert!(begun.elapsed() < Duration::from_millis(800));

        assert!(!h.manager.status("cam-1"));
        assert!(!h.cameras.get("cam-1").await.unwrap().unwrap().detection_active);
        assert!(wait_until(|| h.opener.live_readers() == 0).await);
    }

    #[tokio::test]
    async fn test_model_load_failure_is_retried() {
        let attempts = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&attempts);
        let model = SharedModel::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(InferenceError::UnexpectedOutput("missing weights".into()));
            }
            Ok(Arc::new(ScriptedClassifier::new(&[], 0.1)) as Arc<dyn Classifier>)
        });
        let h = harness_with(MockOpener::clip(10_000), model);

        assert!(matches!(
            h.manager.start("cam-1").await,
            Err(DetectionError::Model(_))
        ));
        assert!(!h.manager.status("cam-1"));

        assert_eq!(h.manager.start("cam-1").await.unwrap(), StartOutcome::Started);
        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_every_session() {
        let h = harness(MockOpener::clip(10_000));

        h.manager.start("cam-1").await.unwrap();
        h.manager.start("cam-2").await.unwrap();
        assert_eq!(h.manager.active_cameras(), vec!["cam-1", "cam-2"]);

        h.manager.shutdown().await;
        assert!(h.manager.active_cameras().is_empty());
        assert!(wait_until(|| h.opener.live_readers() == 0).await);
        for id in ["cam-1", "cam-2"] {
            assert!(!h.cameras.get(id).await.unwrap().unwrap().detection_active);
        }
    }
}
