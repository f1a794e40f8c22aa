use std::sync::Arc;

use tracing_subscriber::EnvFilter;

mod alert;
mod analytics;
mod api;
mod camera;
mod config;
mod detection;
mod source;
mod storage;

use alert::{AlertEmitter, LogNotifier, Notifier, WebhookNotifier};
use analytics::SharedModel;
use camera::OpencvOpener;
use config::Config;
use detection::DetectionManager;
use source::SourceResolver;
use storage::{MemoryAlertStore, MemoryCameraStore, MemoryStreamStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("crashwatch=debug".parse()?))
        .init();

    let config = Config::load()?;
    let tz = config.alerts.tz()?;
    tracing::info!(
        "loaded {} camera(s), {} stream(s)",
        config.cameras.len(),
        config.streams.len()
    );

    let cameras = Arc::new(MemoryCameraStore::new(&config.cameras));
    let streams = Arc::new(MemoryStreamStore::new(&config.streams));
    let alerts = Arc::new(MemoryAlertStore::new(config.alerts.recipients.clone()));

    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
    if let Some(url) = &config.alerts.webhook_url {
        tracing::info!(url = %url, "webhook notifications enabled");
        notifiers.push(Arc::new(WebhookNotifier::new(url.clone())));
    }
    if config.alerts.recipients.is_empty() {
        tracing::warn!("no alert recipients configured");
    }

    let emitter = Arc::new(AlertEmitter::new(alerts.clone(), notifiers, tz));
    let resolver = SourceResolver::new(streams, &config.detection);
    let model = SharedModel::onnx(config.model.clone());

    let manager = DetectionManager::new(
        cameras.clone(),
        resolver,
        Arc::new(OpencvOpener),
        model,
        emitter,
        config.detection.clone(),
        tz,
    );

    let state = api::AppState::new(manager.clone(), cameras, alerts);
    let port = config.http.port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = api::start_server(state, port).await {
            tracing::error!(error = %e, "HTTP server failed");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        result = server_handle => {
            if let Err(e) = result {
                tracing::error!("server task failed: {}", e);
            }
        }
    }

    manager.shutdown().await;
    tracing::info!("shutdown complete");

    Ok(())
}
