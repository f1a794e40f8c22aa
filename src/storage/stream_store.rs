use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::StreamConfig;

use super::{StoreError, StreamStore};

#[derive(Debug, Clone)]
pub struct StreamRecord {
    pub id: String,
    pub video_path: String,
    pub active: bool,
}

/// Uploaded streams are immutable once configured, so no lock is needed.
#[derive(Clone)]
pub struct MemoryStreamStore {
    streams: Arc<HashMap<String, StreamRecord>>,
}

impl MemoryStreamStore {
    pub fn new(streams: &[StreamConfig]) -> Self {
        let streams = streams
            .iter()
            .map(|s| {
                (
                    s.id.clone(),
                    StreamRecord {
                        id: s.id.clone(),
                        video_path: s.video_path.clone(),
                        active: s.active,
                    },
                )
            })
            .collect();
        Self {
            streams: Arc::new(streams),
        }
    }
}

#[async_trait]
impl StreamStore for MemoryStreamStore {
    async fn get(&self, stream_id: &str) -> Result<Option<StreamRecord>, StoreError> {
        Ok(self.streams.get(stream_id).cloned())
    }
}
