use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::Serialize;

use crate::config::CameraConfig;

use super::{CameraStore, StoreError};

#[derive(Debug, Clone, Serialize)]
pub struct CameraRecord {
    pub id: String,
    pub name: String,
    pub location: String,
    pub url: String,
    pub detection_active: bool,
    pub detection_started_at: Option<DateTime<FixedOffset>>,
    pub detection_stopped_at: Option<DateTime<FixedOffset>>,
}

impl From<&CameraConfig> for CameraRecord {
    fn from(config: &CameraConfig) -> Self {
        Self {
            id: config.id.clone(),
            name: config.name.clone(),
            location: config.location.clone(),
            url: config.url.clone(),
            detection_active: false,
            detection_started_at: None,
            detection_stopped_at: None,
        }
    }
}

#[derive(Clone)]
pub struct MemoryCameraStore {
    cameras: Arc<RwLock<HashMap<String, CameraRecord>>>,
}

impl MemoryCameraStore {
    pub fn new(cameras: &[CameraConfig]) -> Self {
        let cameras = cameras
            .iter()
            .map(|c| (c.id.clone(), CameraRecord::from(c)))
            .collect();
        Self {
            cameras: Arc::new(RwLock::new(cameras)),
        }
    }
}

#[async_trait]
impl CameraStore for MemoryCameraStore {
    async fn get(&self, camera_id: &str) -> Result<Option<CameraRecord>, StoreError> {
        let cameras = self.cameras.read().map_err(|_| StoreError::Poisoned)?;
        Ok(cameras.get(camera_id).cloned())
    }

    async fn list(&self) -> Result<Vec<CameraRecord>, StoreError> {
        let cameras = self.cameras.read().map_err(|_| StoreError::Poisoned)?;
        let mut records: Vec<CameraRecord> = cameras.values().cloned().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    async fn set_detection_active(
        &self,
        camera_id: &str,
        active: bool,
        at: DateTime<FixedOffset>,
    ) -> Result<(), StoreError> {
        let mut cameras = self.cameras.write().map_err(|_| StoreError::Poisoned)?;
        let record = cameras
            .get_mut(camera_id)
            .ok_or_else(|| StoreError::CameraNotFound(camera_id.to_string()))?;

        record.detection_active = active;
        if active {
            record.detection_started_at = Some(at);
        } else {
            record.detection_stopped_at = Some(at);
        }
        Ok(())
    }
}
