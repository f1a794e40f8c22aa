mod alert_store;
mod camera_store;
mod stream_store;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use crate::alert::{AlertRecord, StoredAlert};

pub use alert_store::MemoryAlertStore;
pub use camera_store::{CameraRecord, MemoryCameraStore};
pub use stream_store::{MemoryStreamStore, StreamRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("camera not found: {0}")]
    CameraNotFound(String),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Current wall-clock time expressed in the deployment's local timezone.
pub fn local_now(tz: Tz) -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&tz).fixed_offset()
}

#[async_trait]
pub trait CameraStore: Send + Sync {
    async fn get(&self, camera_id: &str) -> Result<Option<CameraRecord>, StoreError>;

    async fn list(&self) -> Result<Vec<CameraRecord>, StoreError>;

    /// Records the detection-active flag together with the matching
    /// started/stopped timestamp.
    async fn set_detection_active(
        &self,
        camera_id: &str,
        active: bool,
        at: DateTime<FixedOffset>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait StreamStore: Send + Sync {
    async fn get(&self, stream_id: &str) -> Result<Option<StreamRecord>, StoreError>;
}

#[async_trait]
pub trait AlertStore: Send + Sync {
    async fn insert(&self, alert: AlertRecord) -> Result<u64, StoreError>;

    /// Stored alerts, newest first.
    async fn list(&self) -> Result<Vec<StoredAlert>, StoreError>;

    /// Addresses of every hospital-role recipient.
    async fn recipients(&self) -> Result<Vec<String>, StoreError>;
}
