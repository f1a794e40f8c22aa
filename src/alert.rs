use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use chrono_tz::Tz;
use serde::Serialize;
use thiserror::Error;

use crate::storage::{local_now, AlertStore, CameraRecord};

const NOTIFY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("notification rejected: {0}")]
    Rejected(String),
}

/// A confirmed accident as persisted in the alert store.
#[derive(Debug, Clone, Serialize)]
pub struct AlertRecord {
    pub camera_id: String,
    pub camera_name: String,
    pub location: String,
    pub time: DateTime<FixedOffset>,
    pub details: String,
    pub confidence: f32,
    pub notified_recipients: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredAlert {
    pub id: u64,
    #[serde(flatten)]
    pub alert: AlertRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub recipient: String,
    pub location: String,
    pub details: String,
    pub time: String,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Writes every notification to the log at warn level.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::warn!(
            recipient = %notification.recipient,
            location = %notification.location,
            time = %notification.time,
            "{}",
            notification.details
        );
        Ok(())
    }
}

/// Posts each notification as JSON to a fixed endpoint.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
        let response = self.client.post(&self.url).json(notification).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::Rejected(format!("{} returned {}", self.url, status)));
        }
        Ok(())
    }
}

pub fn alert_details(camera_name: &str, confidence: f32) -> String {
    format!(
        "ACCIDENT DETECTED at {} with {:.1}% confidence. Automatic detection triggered by AI model.",
        camera_name,
        confidence * 100.0
    )
}

/// Persists confirmed accidents and fans notifications out to every
/// recipient. Delivery runs detached; a failed recipient never affects the
/// stored alert or the other recipients.
pub struct AlertEmitter {
    alerts: Arc<dyn AlertStore>,
    notifiers: Vec<Arc<dyn Notifier>>,
    tz: Tz,
}

impl AlertEmitter {
    pub fn new(alerts: Arc<dyn AlertStore>, notifiers: Vec<Arc<dyn Notifier>>, tz: Tz) -> Self {
        Self {
            alerts,
            notifiers,
            tz,
        }
    }

    /// Returns the stored alert id, or `None` when persistence failed.
    /// Recipients are notified in both cases.
    pub async fn emit(&self, camera: &CameraRecord, confidence: f32) -> Option<u64> {
        let recipients = match self.alerts.recipients().await {
            Ok(recipients) => recipients,
            Err(e) => {
                tracing::warn!(camera = %camera.id, error = %e, "failed to load alert recipients");
                Vec::new()
            }
        };

        let camera_name = if camera.name.is_empty() {
            camera.id.clone()
        } else {
            camera.name.clone()
        };

        let record = AlertRecord {
            camera_id: camera.id.clone(),
            camera_name: camera_name.clone(),
            location: camera.location.clone(),
            time: local_now(self.tz),
            details: alert_details(&camera_name, confidence),
            confidence,
            notified_recipients: recipients.clone(),
        };

        tracing::warn!(
            camera = %camera.id,
            location = %camera.location,
            confidence = format!("{:.3}", confidence),
            "accident confirmed"
        );

        let id = match self.alerts.insert(record.clone()).await {
            Ok(id) => {
                tracing::info!(camera = %camera.id, alert = id, recipients = recipients.len(), "alert stored");
                Some(id)
            }
            Err(e) => {
                tracing::error!(camera = %camera.id, error = %e, "failed to store alert");
                None
            }
        };

        self.dispatch(&record);
        id
    }

    fn dispatch(&self, record: &AlertRecord) {
        let time = record.time.format(NOTIFY_TIME_FORMAT).to_string();

        for recipient in &record.notified_recipients {
            let notification = Notification {
                recipient: recipient.clone(),
                location: record.location.clone(),
                details: record.details.clone(),
                time: time.clone(),
            };

            for notifier in &self.notifiers {
                let notifier = Arc::clone(notifier);
                let notification = notification.clone();
                tokio::spawn(async move {
                    if let Err(e) = notifier.notify(&notification).await {
                        tracing::error!(
                            notifier = notifier.name(),
                            recipient = %notification.recipient,
                            error = %e,
                            "failed to send alert notification"
                        );
                    }
                });
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    pub struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
        fail_for: Option<String>,
    }

    impl RecordingNotifier {
        pub fn failing_for(recipient: &str) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_for: Some(recipient.to_string()),
            }
        }

        pub fn sent(&self) -> Vec<Notification> {
            self.sent.lock().unwrap().clone()
        }

        /// Polls until `count` notifications arrived or a second passed.
        pub async fn wait_for(&self, count: usize) -> Vec<Notification> {
            for _ in 0..100 {
                if self.sent.lock().unwrap().len() >= count {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            self.sent()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn notify(&self, notification: &Notification) -> Result<(), NotifyError> {
            if self.fail_for.as_deref() == Some(notification.recipient.as_str()) {
                return Err(NotifyError::Rejected(notification.recipient.clone()));
            }
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }
}
