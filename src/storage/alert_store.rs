use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::alert::{AlertRecord, StoredAlert};

use super::{AlertStore, StoreError};

pub struct MemoryAlertStore {
    alerts: Arc<RwLock<Vec<StoredAlert>>>,
    recipients: Arc<Vec<String>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryAlertStore {
    pub fn new(recipients: Vec<String>) -> Self {
        Self {
            alerts: Arc::new(RwLock::new(Vec::new())),
            recipients: Arc::new(recipients),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }
}

impl Clone for MemoryAlertStore {
    fn clone(&self) -> Self {
        Self {
            alerts: Arc::clone(&self.alerts),
            recipients: Arc::clone(&self.recipients),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

#[async_trait]
impl AlertStore for MemoryAlertStore {
    async fn insert(&self, alert: AlertRecord) -> Result<u64, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.alerts
            .write()
            .map_err(|_| StoreError::Poisoned)?
            .push(StoredAlert { id, alert });
        Ok(id)
    }

    async fn list(&self) -> Result<Vec<StoredAlert>, StoreError> {
        let alerts = self.alerts.read().map_err(|_| StoreError::Poisoned)?;
        let mut listed: Vec<StoredAlert> = alerts.iter().cloned().collect();
        listed.sort_by(|a, b| b.alert.time.cmp(&a.alert.time).then(b.id.cmp(&a.id)));
        Ok(listed)
    }

    async fn recipients(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.recipients.as_ref().clone())
    }
}
