use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::bridge::{BridgeSettings, DEFAULT_EVENT_QUEUE_SIZE, DEFAULT_MAX_IMAGE_BYTES, DEFAULT_NODE_ADDR};
use crate::coordinator::{CoordinatorSettings, DEFAULT_FRAME_QUEUE_SIZE, DEFAULT_RESULT_QUEUE_SIZE};
use crate::detect::{
    ChannelOrder, DetectorSettings, DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_MAX_DETECTIONS,
    DEFAULT_NMS_THRESHOLD,
};
use crate::frame::CameraConfig;
use crate::ingest::{StreamSettings, DEFAULT_MAX_RECONNECT_ATTEMPTS};
use crate::sync::{CloudSettings, SyncSettings};

const DEFAULT_DB_PATH: &str = "gateway.db";
const DEFAULT_CLOUD_URL: &str = "http://127.0.0.1:8000/api/v1";
const DEFAULT_MODEL_INPUT: u32 = 640;
const DEFAULT_RECONNECT_DELAY_SECS: u64 = 5;
const DEFAULT_TELEMETRY_INTERVAL_SECS: u64 = 60;
const DEFAULT_NODE_STALE_SECS: u64 = 300;
const DEFAULT_JPEG_QUALITY: u8 = 85;
const DEFAULT_LABELS: &[&str] = &[
    "deer", "boar", "fox", "badger", "bear", "wolf", "lynx", "bird", "person", "vehicle",
];

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct GatewayConfigFile {
    gateway_id: Option<String>,
    db_path: Option<String>,
    sync_empty_results: Option<bool>,
    telemetry_interval_secs: Option<u64>,
    jpeg_quality: Option<u8>,
    #[serde(default)]
    cameras: Vec<CameraConfig>,
    stream: Option<StreamConfigFile>,
    detector: Option<DetectorConfigFile>,
    bridge: Option<BridgeConfigFile>,
    cloud: Option<CloudConfigFile>,
    sync: Option<SyncConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    max_reconnect_attempts: Option<u32>,
    reconnect_delay_secs: Option<u64>,
    frame_queue_size: Option<usize>,
    result_queue_size: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectorConfigFile {
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    labels: Option<Vec<String>>,
    confidence_threshold: Option<f32>,
    nms_threshold: Option<f32>,
    max_detections: Option<usize>,
    channel_order: Option<ChannelOrder>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct BridgeConfigFile {
    addr: Option<String>,
    radio_device: Option<PathBuf>,
    event_queue_size: Option<usize>,
    max_image_bytes: Option<usize>,
    node_stale_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CloudConfigFile {
    url: Option<String>,
    api_token: Option<String>,
    timeout_secs: Option<u64>,
    health_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct SyncConfigFile {
    interval_secs: Option<u64>,
    batch_size: Option<usize>,
    max_retries: Option<u32>,
    queue_capacity: Option<usize>,
    retry_base_delay_secs: Option<u64>,
    retry_max_delay_secs: Option<u64>,
    retry_interval_secs: Option<u64>,
    completed_retention_secs: Option<u64>,
}

/// Fully resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Stable gateway identity. Generated at startup when not configured.
    pub gateway_id: Option<String>,
    pub db_path: String,
    pub cameras: Vec<CameraConfig>,
    pub detector: DetectorConfig,
    pub coordinator: CoordinatorSettings,
    pub bridge: BridgeSettings,
    /// Silence threshold for `Gateway::mark_stale_nodes`.
    pub node_stale_after: Duration,
    pub cloud: CloudSettings,
    pub sync: SyncSettings,
    /// Upload results that contain no detections.
    pub sync_empty_results: bool,
    pub telemetry_interval: Duration,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// ONNX model. Without one the gateway runs the stub engine.
    pub model_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    pub settings: DetectorSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        // An empty file resolves to defaults only.
        Self::from_file(GatewayConfigFile::default())
    }
}

impl GatewayConfig {
    /// Load from the file named by `GATEWAY_CONFIG` (if any), then apply env overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("GATEWAY_CONFIG")
            .ok()
            .filter(|p| !p.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => GatewayConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a TOML document without consulting the environment.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let file: GatewayConfigFile = toml::from_str(raw).context("invalid gateway config")?;
        let mut cfg = Self::from_file(file);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: GatewayConfigFile) -> Self {
        let stream_file = file.stream.unwrap_or_default();
        let detector_file = file.detector.unwrap_or_default();
        let bridge_file = file.bridge.unwrap_or_default();
        let cloud_file = file.cloud.unwrap_or_default();
        let sync_file = file.sync.unwrap_or_default();

        let stream = StreamSettings {
            max_reconnect_attempts: stream_file
                .max_reconnect_attempts
                .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            reconnect_delay: Duration::from_secs(
                stream_file
                    .reconnect_delay_secs
                    .unwrap_or(DEFAULT_RECONNECT_DELAY_SECS),
            ),
            ..StreamSettings::default()
        };
        let coordinator = CoordinatorSettings {
            frame_queue_size: stream_file
                .frame_queue_size
                .unwrap_or(DEFAULT_FRAME_QUEUE_SIZE),
            result_queue_size: stream_file
                .result_queue_size
                .unwrap_or(DEFAULT_RESULT_QUEUE_SIZE),
            stream,
            ..CoordinatorSettings::default()
        };

        let labels = detector_file
            .labels
            .unwrap_or_else(|| DEFAULT_LABELS.iter().map(|l| l.to_string()).collect());
        let detector = DetectorConfig {
            model_path: detector_file.model_path,
            input_width: detector_file.input_width.unwrap_or(DEFAULT_MODEL_INPUT),
            input_height: detector_file.input_height.unwrap_or(DEFAULT_MODEL_INPUT),
            settings: DetectorSettings {
                confidence_threshold: detector_file
                    .confidence_threshold
                    .unwrap_or(DEFAULT_CONFIDENCE_THRESHOLD),
                nms_threshold: detector_file
                    .nms_threshold
                    .unwrap_or(DEFAULT_NMS_THRESHOLD),
                max_detections: detector_file
                    .max_detections
                    .unwrap_or(DEFAULT_MAX_DETECTIONS),
                channel_order: detector_file.channel_order.unwrap_or_default(),
                ..DetectorSettings::new(labels)
            },
        };

        let bridge = BridgeSettings {
            http_addr: Some(
                bridge_file
                    .addr
                    .unwrap_or_else(|| DEFAULT_NODE_ADDR.to_string()),
            ),
            radio_device: bridge_file.radio_device,
            event_queue_size: bridge_file
                .event_queue_size
                .unwrap_or(DEFAULT_EVENT_QUEUE_SIZE),
            max_image_bytes: bridge_file
                .max_image_bytes
                .unwrap_or(DEFAULT_MAX_IMAGE_BYTES),
            ..BridgeSettings::default()
        };

        let mut cloud =
            CloudSettings::new(cloud_file.url.unwrap_or_else(|| DEFAULT_CLOUD_URL.to_string()));
        cloud.api_token = cloud_file.api_token;
        if let Some(secs) = cloud_file.timeout_secs {
            cloud.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = cloud_file.health_timeout_secs {
            cloud.health_timeout = Duration::from_secs(secs);
        }

        let defaults = SyncSettings::default();
        let secs_or = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_secs).unwrap_or(default)
        };
        let sync = SyncSettings {
            sync_interval: secs_or(sync_file.interval_secs, defaults.sync_interval),
            batch_size: sync_file.batch_size.unwrap_or(defaults.batch_size),
            max_retries: sync_file.max_retries.unwrap_or(defaults.max_retries),
            queue_capacity: sync_file.queue_capacity.unwrap_or(defaults.queue_capacity),
            retry_base_delay: secs_or(sync_file.retry_base_delay_secs, defaults.retry_base_delay),
            retry_max_delay: secs_or(sync_file.retry_max_delay_secs, defaults.retry_max_delay),
            retry_interval: secs_or(sync_file.retry_interval_secs, defaults.retry_interval),
            completed_retention: secs_or(
                sync_file.completed_retention_secs,
                defaults.completed_retention,
            ),
            ..defaults
        };

        Self {
            gateway_id: file.gateway_id,
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            cameras: file.cameras,
            detector,
            coordinator,
            bridge,
            node_stale_after: Duration::from_secs(
                bridge_file.node_stale_secs.unwrap_or(DEFAULT_NODE_STALE_SECS),
            ),
            cloud,
            sync,
            sync_empty_results: file.sync_empty_results.unwrap_or(false),
            telemetry_interval: Duration::from_secs(
                file.telemetry_interval_secs
                    .unwrap_or(DEFAULT_TELEMETRY_INTERVAL_SECS),
            ),
            jpeg_quality: file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_value("GATEWAY_DB_PATH") {
            self.db_path = path;
        }
        if let Some(url) = env_value("GATEWAY_CLOUD_URL") {
            self.cloud.base_url = url;
        }
        if let Some(token) = env_value("GATEWAY_CLOUD_TOKEN") {
            self.cloud.api_token = Some(token);
        }
        if let Some(addr) = env_value("GATEWAY_NODE_ADDR") {
            self.bridge.http_addr = match addr.as_str() {
                "off" | "none" => None,
                _ => Some(addr),
            };
        }
        if let Some(device) = env_value("GATEWAY_RADIO_DEVICE") {
            self.bridge.radio_device = Some(PathBuf::from(device));
        }
        if let Some(model) = env_value("GATEWAY_MODEL_PATH") {
            self.detector.model_path = Some(PathBuf::from(model));
        }
        if let Some(interval) = env_value("GATEWAY_SYNC_INTERVAL_SECS") {
            let seconds: u64 = interval.parse().map_err(|_| {
                anyhow!("GATEWAY_SYNC_INTERVAL_SECS must be an integer number of seconds")
            })?;
            self.sync.sync_interval = Duration::from_secs(seconds);
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        let mut names = HashSet::new();
        for camera in &self.cameras {
            camera.validate()?;
            if !names.insert(camera.name.as_str()) {
                return Err(anyhow!("duplicate camera name '{}'", camera.name));
            }
        }

        if self.detector.input_width == 0 || self.detector.input_height == 0 {
            return Err(anyhow!("detector input size must be non-zero"));
        }
        if self.detector.settings.labels.is_empty() {
            return Err(anyhow!("detector needs at least one label"));
        }
        for (name, value) in [
            ("confidence_threshold", self.detector.settings.confidence_threshold),
            ("nms_threshold", self.detector.settings.nms_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(anyhow!("detector {} must be within 0..=1, got {}", name, value));
            }
        }

        let url = url::Url::parse(&self.cloud.base_url)
            .with_context(|| format!("invalid cloud url '{}'", self.cloud.base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!("cloud url must use http or https"));
        }
        if self.cloud.api_token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            self.cloud.api_token = None;
        }

        if self.sync.sync_interval.is_zero() || self.sync.retry_interval.is_zero() {
            return Err(anyhow!("sync intervals must be greater than zero"));
        }
        if self.sync.batch_size == 0 || self.sync.queue_capacity == 0 {
            return Err(anyhow!("sync batch_size and queue_capacity must be greater than zero"));
        }
        if self.sync.max_retries == 0 {
            return Err(anyhow!("sync max_retries must be greater than zero"));
        }
        if self.sync.retry_max_delay < self.sync.retry_base_delay {
            return Err(anyhow!("sync retry_max_delay must not be below retry_base_delay"));
        }
        if self.telemetry_interval.is_zero() {
            return Err(anyhow!("telemetry interval must be greater than zero"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("jpeg_quality must be within 1..=100"));
        }
        if self.coordinator.frame_queue_size == 0 || self.coordinator.result_queue_size == 0 {
            return Err(anyhow!("queue sizes must be greater than zero"));
        }
        if self.db_path.trim().is_empty() {
            return Err(anyhow!("db_path must not be empty"));
        }
        Ok(())
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn read_config_file(path: &Path) -> Result<GatewayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = toml::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}
