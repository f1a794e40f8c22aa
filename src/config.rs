use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_PATH: &str = "config.toml";
const CONFIG_PATH_ENV: &str = "CRASHWATCH_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no cameras configured")]
    NoCameras,
    #[error("invalid detection setting: {0}")]
    Invalid(String),
    #[error("unknown timezone: {0}")]
    UnknownTimezone(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub location: String,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    pub id: String,
    pub video_path: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

fn default_http_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
        }
    }
}

fn default_sequence_length() -> usize {
    16
}

fn default_image_size() -> i32 {
    224
}

fn default_accident_threshold() -> f32 {
    0.5
}

fn default_confirmation_threshold() -> u32 {
    3
}

fn default_cooldown_frames() -> u32 {
    150
}

fn default_max_failures() -> u32 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_frame_interval_ms() -> u64 {
    50
}

fn default_stop_grace_ms() -> u64 {
    5000
}

fn default_search_dirs() -> Vec<PathBuf> {
    vec![
        PathBuf::from("."),
        PathBuf::from(".."),
        PathBuf::from("uploads"),
    ]
}

fn default_stream_marker() -> String {
    "/streams/feed/".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectionConfig {
    #[serde(default = "default_sequence_length")]
    pub sequence_length: usize,
    #[serde(default = "default_image_size")]
    pub image_width: i32,
    #[serde(default = "default_image_size")]
    pub image_height: i32,
    #[serde(default = "default_accident_threshold")]
    pub accident_threshold: f32,
    #[serde(default = "default_confirmation_threshold")]
    pub confirmation_threshold: u32,
    #[serde(default = "default_cooldown_frames")]
    pub cooldown_frames: u32,
    #[serde(default = "default_max_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_frame_interval_ms")]
    pub frame_interval_ms: u64,
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
    /// Base directories searched, in order, for relative file sources.
    #[serde(default = "default_search_dirs")]
    pub search_dirs: Vec<PathBuf>,
    #[serde(default = "default_stream_marker")]
    pub stream_path_marker: String,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            sequence_length: default_sequence_length(),
            image_width: default_image_size(),
            image_height: default_image_size(),
            accident_threshold: default_accident_threshold(),
            confirmation_threshold: default_confirmation_threshold(),
            cooldown_frames: default_cooldown_frames(),
            max_consecutive_failures: default_max_failures(),
            retry_backoff_ms: default_retry_backoff_ms(),
            frame_interval_ms: default_frame_interval_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            search_dirs: default_search_dirs(),
            stream_path_marker: default_stream_marker(),
        }
    }
}

impl DetectionConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(self.frame_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sequence_length == 0 {
            return Err(ConfigError::Invalid("sequence_length must be at least 1".into()));
        }
        if self.image_width <= 0 || self.image_height <= 0 {
            return Err(ConfigError::Invalid("image size must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.accident_threshold) {
            return Err(ConfigError::Invalid(
                "accident_threshold must be within [0, 1]".into(),
            ));
        }
        if self.confirmation_threshold == 0 {
            return Err(ConfigError::Invalid(
                "confirmation_threshold must be at least 1".into(),
            ));
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::Invalid(
                "max_consecutive_failures must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_model_path() -> String {
    "models/accident_detector.onnx".to_string()
}

fn default_intra_threads() -> usize {
    4
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_model_path")]
    pub path: String,
    #[serde(default = "default_intra_threads")]
    pub intra_threads: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: default_model_path(),
            intra_threads: default_intra_threads(),
        }
    }
}

fn default_timezone() -> String {
    "Asia/Karachi".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Hospital-role addresses notified on every confirmed accident.
    #[serde(default)]
    pub recipients: Vec<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            timezone: default_timezone(),
            webhook_url: None,
            recipients: Vec::new(),
        }
    }
}

impl AlertConfig {
    pub fn tz(&self) -> Result<chrono_tz::Tz, ConfigError> {
        self.timezone
            .parse()
            .map_err(|_| ConfigError::UnknownTimezone(self.timezone.clone()))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub cameras: Vec<CameraConfig>,
    #[serde(default)]
    pub streams: Vec<StreamConfig>,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path)
    }

    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;

        if config.cameras.is_empty() {
            return Err(ConfigError::NoCameras);
        }

        config.detection.validate()?;
        config.alerts.tz()?;

        Ok(config)
    }
}
