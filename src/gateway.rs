//! Orchestrator: owns every component and routes data between them.
//!
//! ```text
//! cameras -> StreamCoordinator --(detection router)--> SyncService -> cloud
//! nodes   -> ProtocolBridge    --(node router)------->     ^
//!            gateway stats     --(telemetry thread)--------'
//! ```

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::bridge::{
    BridgeStats, Esp32Node, MemoryConfigStore, NodeConfigStore, NodeEvent, ProtocolBridge,
};
use crate::config::{DetectorConfig, GatewayConfig};
use crate::coordinator::{CoordinatorStats, StreamCoordinator};
use crate::detect::{DetectionResult, Detector, InferenceEngine, StubEngine};
use crate::error::BridgeError;
use crate::frame::CameraConfig;
use crate::ingest::{CameraState, SourceFactory};
use crate::sync::{
    Attachment, CloudTransport, HttpCloudClient, SyncItemType, SyncService, SyncStats, SyncStore,
};
use crate::{join_with_timeout, now_ms_lossy, sleep_interruptible};

const ROUTER_POLL: Duration = Duration::from_millis(200);
const ROUTER_STOP_TIMEOUT: Duration = Duration::from_secs(3);
/// Alerts jump ahead of ordinary detections.
const ALERT_PRIORITY: i32 = 3;

/// Collaborators that can be swapped out, mainly for tests and embedding.
pub struct GatewayParts {
    pub detector: Arc<Detector>,
    pub cloud: Arc<dyn CloudTransport>,
    pub store: SyncStore,
    pub node_config: Arc<dyn NodeConfigStore>,
    pub source_factory: Option<SourceFactory>,
    pub radio_link: Option<Box<dyn Read + Send>>,
}

impl GatewayParts {
    /// Build the production collaborators described by `config`.
    pub fn from_config(config: &GatewayConfig) -> Result<Self> {
        let engine = build_engine(&config.detector)?;
        let detector = Detector::new(engine, config.detector.settings.clone())?;
        let cloud = HttpCloudClient::new(&config.cloud)?;
        let store = SyncStore::open(&config.db_path)?;
        Ok(Self {
            detector: Arc::new(detector),
            cloud: Arc::new(cloud),
            store,
            node_config: Arc::new(MemoryConfigStore::default()),
            source_factory: None,
            radio_link: None,
        })
    }
}

fn build_engine(config: &DetectorConfig) -> Result<Box<dyn InferenceEngine>> {
    match &config.model_path {
        None => {
            log::warn!("no detection model configured; running the stub engine");
            Ok(Box::new(StubEngine::new(config.input_width, config.input_height)))
        }
        #[cfg(feature = "backend-tract")]
        Some(path) => Ok(Box::new(crate::detect::backends::TractEngine::new(
            path,
            config.input_width,
            config.input_height,
        )?)),
        #[cfg(not(feature = "backend-tract"))]
        Some(path) => Err(anyhow!(
            "model {} configured but this build lacks the backend-tract feature",
            path.display()
        )),
    }
}

/// Compact health summary.
#[derive(Clone, Debug, Serialize)]
pub struct GatewayStatus {
    pub gateway_id: String,
    pub running: bool,
    pub uptime_secs: u64,
    pub cameras_total: usize,
    pub cameras_streaming: usize,
    pub cameras_failed: usize,
    pub nodes_total: usize,
    pub nodes_online: usize,
    pub cloud_online: bool,
    pub sync_queued: usize,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RoutingStats {
    pub detections_forwarded: u64,
    pub empty_results_skipped: u64,
    pub node_events_forwarded: u64,
    pub telemetry_sent: u64,
    pub forward_errors: u64,
}

/// Full stats snapshot across all components.
#[derive(Clone, Debug, Serialize)]
pub struct GatewayStats {
    pub status: GatewayStatus,
    pub coordinator: CoordinatorStats,
    pub bridge: BridgeStats,
    pub sync: SyncStats,
    pub routing: RoutingStats,
}

#[derive(Default)]
struct RoutingCounters {
    detections: AtomicU64,
    skipped: AtomicU64,
    node_events: AtomicU64,
    telemetry: AtomicU64,
    errors: AtomicU64,
}

impl RoutingCounters {
    fn snapshot(&self) -> RoutingStats {
        RoutingStats {
            detections_forwarded: self.detections.load(Ordering::Relaxed),
            empty_results_skipped: self.skipped.load(Ordering::Relaxed),
            node_events_forwarded: self.node_events.load(Ordering::Relaxed),
            telemetry_sent: self.telemetry.load(Ordering::Relaxed),
            forward_errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

struct Inner {
    id: String,
    config: GatewayConfig,
    coordinator: StreamCoordinator,
    bridge: ProtocolBridge,
    sync: SyncService,
    node_events: Mutex<Receiver<NodeEvent>>,
    counters: RoutingCounters,
    running: AtomicBool,
    started_at_ms: AtomicU64,
}

struct Router {
    name: &'static str,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

struct Routers {
    stop: Arc<AtomicBool>,
    workers: Vec<Router>,
}

pub struct Gateway {
    inner: Arc<Inner>,
    routers: Mutex<Option<Routers>>,
}

impl Gateway {
    /// Build a gateway with production collaborators.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let parts = GatewayParts::from_config(&config)?;
        Self::with_parts(config, parts)
    }

    pub fn with_parts(config: GatewayConfig, parts: GatewayParts) -> Result<Self> {
        let id = config
            .gateway_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| format!("gw-{}", uuid::Uuid::new_v4()));

        let mut coordinator = StreamCoordinator::new(parts.detector, config.coordinator.clone());
        if let Some(factory) = parts.source_factory {
            coordinator = coordinator.with_source_factory(factory);
        }
        for camera in &config.cameras {
            coordinator
                .add_camera(camera.clone())
                .with_context(|| format!("camera '{}'", camera.name))?;
        }

        let (mut bridge, node_events) =
            ProtocolBridge::new(config.bridge.clone(), parts.node_config);
        if let Some(link) = parts.radio_link {
            bridge = bridge.with_radio_link(link);
        }

        let sync = SyncService::new(parts.store, parts.cloud, config.sync.clone());

        log::info!(
            "gateway {} configured with {} camera(s)",
            id,
            config.cameras.len()
        );
        Ok(Self {
            inner: Arc::new(Inner {
                id,
                config,
                coordinator,
                bridge,
                sync,
                node_events: Mutex::new(node_events),
                counters: RoutingCounters::default(),
                running: AtomicBool::new(false),
                started_at_ms: AtomicU64::new(0),
            }),
            routers: Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start sync first so nothing produced afterwards can be lost, then the producers.
    pub fn start(&self) -> Result<()> {
        let mut routers = self.lock_routers();
        if routers.is_some() {
            return Ok(());
        }
        let inner = &self.inner;
        inner.sync.start().context("sync service failed to start")?;
        if let Err(err) = inner.bridge.start() {
            inner.sync.stop();
            return Err(err.context("protocol bridge failed to start"));
        }
        if let Err(err) = inner.coordinator.start() {
            inner.bridge.stop();
            inner.sync.stop();
            return Err(err.context("stream coordinator failed to start"));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();
        let bodies: [(&'static str, fn(&Inner, &AtomicBool)); 3] = [
            ("detection-router", Inner::route_detections),
            ("node-router", Inner::route_node_events),
            ("telemetry", Inner::run_telemetry),
        ];
        for (name, body) in bodies {
            let inner = self.inner.clone();
            let thread_stop = stop.clone();
            let (done_tx, done) = mpsc::channel();
            let spawned = std::thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    body(&inner, &thread_stop);
                    let _ = done_tx.send(());
                });
            match spawned {
                Ok(handle) => workers.push(Router { name, handle, done }),
                Err(err) => {
                    stop.store(true, Ordering::SeqCst);
                    self.inner.stop_components();
                    return Err(anyhow!("failed to spawn {}: {}", name, err));
                }
            }
        }

        inner.started_at_ms.store(now_ms_lossy(), Ordering::SeqCst);
        inner.running.store(true, Ordering::SeqCst);
        *routers = Some(Routers { stop, workers });
        log::info!("gateway {} started", inner.id);
        Ok(())
    }

    /// Stop producers, drain routers, then flush sync. Idempotent.
    pub fn shutdown(&self) {
        let Some(routers) = self.lock_routers().take() else {
            return;
        };
        log::info!("gateway {} shutting down", self.inner.id);
        self.inner.coordinator.stop();
        self.inner.bridge.stop();

        routers.stop.store(true, Ordering::SeqCst);
        for router in routers.workers {
            join_with_timeout(router.name, router.handle, &router.done, ROUTER_STOP_TIMEOUT);
        }
        self.inner.sync.stop();
        self.inner.running.store(false, Ordering::SeqCst);
        log::info!("gateway {} stopped", self.inner.id);
    }

    pub fn restart(&self) -> Result<()> {
        self.shutdown();
        self.start()
    }

    pub fn get_status(&self) -> GatewayStatus {
        self.inner.status()
    }

    pub fn get_stats(&self) -> GatewayStats {
        self.inner.stats()
    }

    pub fn add_camera(&self, config: CameraConfig) -> Result<()> {
        self.inner.coordinator.add_camera(config)
    }

    pub fn remove_camera(&self, name: &str) -> Result<bool> {
        self.inner.coordinator.remove_camera(name)
    }

    pub fn enable_camera(&self, name: &str) -> Result<()> {
        self.inner.coordinator.set_camera_enabled(name, true)
    }

    pub fn disable_camera(&self, name: &str) -> Result<()> {
        self.inner.coordinator.set_camera_enabled(name, false)
    }

    pub fn restart_camera(&self, name: &str) -> Result<()> {
        self.inner.coordinator.restart_camera(name)
    }

    pub fn cameras(&self) -> Vec<CameraConfig> {
        self.inner.coordinator.camera_configs()
    }

    pub fn send_node_command(
        &self,
        node_id: &str,
        command: &str,
        params: Value,
    ) -> Result<(), BridgeError> {
        self.inner.bridge.send_command(node_id, command, params)
    }

    pub fn nodes(&self) -> Vec<Esp32Node> {
        self.inner.bridge.registry().list()
    }

    /// Mark nodes silent for longer than `node_stale_after` offline and return their
    /// ids. Nothing in the gateway calls this on its own; node liveness policy belongs
    /// to whoever manages the fleet.
    pub fn mark_stale_nodes(&self) -> Vec<String> {
        self.inner
            .bridge
            .registry()
            .mark_stale(self.inner.config.node_stale_after)
    }

    /// The node-facing HTTP address, once started.
    pub fn node_api_addr(&self) -> Option<std::net::SocketAddr> {
        self.inner.bridge.http_addr()
    }

    pub fn sync(&self) -> &SyncService {
        &self.inner.sync
    }

    fn lock_routers(&self) -> MutexGuard<'_, Option<Routers>> {
        self.routers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn stop_components(&self) {
        self.coordinator.stop();
        self.bridge.stop();
        self.sync.stop();
    }

    fn status(&self) -> GatewayStatus {
        let running = self.running.load(Ordering::SeqCst);
        let cameras = self.coordinator.camera_stats();
        let sync = self.sync.stats();
        let started = self.started_at_ms.load(Ordering::SeqCst);
        GatewayStatus {
            gateway_id: self.id.clone(),
            running,
            uptime_secs: if running {
                now_ms_lossy().saturating_sub(started) / 1000
            } else {
                0
            },
            cameras_total: cameras.len(),
            cameras_streaming: cameras
                .iter()
                .filter(|c| c.state == CameraState::Streaming)
                .count(),
            cameras_failed: cameras
                .iter()
                .filter(|c| c.state == CameraState::Failed)
                .count(),
            nodes_total: self.bridge.registry().len(),
            nodes_online: self.bridge.registry().online_count(),
            cloud_online: sync.cloud_online,
            sync_queued: sync.queued,
        }
    }

    fn stats(&self) -> GatewayStats {
        GatewayStats {
            status: self.status(),
            coordinator: self.coordinator.stats(),
            bridge: self.bridge.stats(),
            sync: self.sync.stats(),
            routing: self.counters.snapshot(),
        }
    }

    fn route_detections(&self, stop: &AtomicBool) {
        while !stop.load(Ordering::SeqCst) {
            if let Some(result) = self.coordinator.get_detection(ROUTER_POLL) {
                self.forward_detection(result);
            }
        }
        // Producers are already stopped; hand over whatever is left.
        while let Some(result) = self.coordinator.get_detection(Duration::ZERO) {
            self.forward_detection(result);
        }
    }

    fn forward_detection(&self, result: DetectionResult) {
        if result.is_empty() && !self.config.sync_empty_results {
            self.counters.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let image = result.frame.as_ref().and_then(|frame| {
            match frame.encode_jpeg(self.config.jpeg_quality) {
                Ok(data) => Some(Attachment {
                    content_type: "image/jpeg".to_string(),
                    data,
                }),
                Err(err) => {
                    log::warn!(
                        "camera '{}' frame {} not encoded: {:#}",
                        result.camera,
                        result.sequence,
                        err
                    );
                    None
                }
            }
        });
        let payload = json!({
            "gateway_id": self.id,
            "camera": result.camera,
            "sequence": result.sequence,
            "captured_at": result.captured_at_ms,
            "detections": result.detections,
        });
        match self.sync.add_detection(&result.camera, payload, image) {
            Ok(_) => {
                self.counters.detections.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                log::error!(
                    "detection from camera '{}' not stored: {:#}",
                    result.camera,
                    err
                );
            }
        }
    }

    fn route_node_events(&self, stop: &AtomicBool) {
        let events = match self.node_events.lock() {
            Ok(events) => events,
            Err(_) => {
                log::error!("node event receiver lock poisoned");
                return;
            }
        };
        while !stop.load(Ordering::SeqCst) {
            match events.recv_timeout(ROUTER_POLL) {
                Ok(event) => self.forward_node_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return,
            }
        }
        while let Ok(event) = events.try_recv() {
            self.forward_node_event(event);
        }
    }

    fn forward_node_event(&self, event: NodeEvent) {
        let received_at = now_ms_lossy();
        let stored = match event {
            NodeEvent::Registered(node) => {
                log::info!(
                    "node '{}' registered via {:?} (firmware {:?})",
                    node.node_id,
                    node.transport,
                    node.firmware_version
                );
                return;
            }
            NodeEvent::Data {
                node_id,
                transport,
                payload,
            } => {
                let envelope = json!({
                    "gateway_id": self.id,
                    "node_id": node_id,
                    "transport": transport,
                    "received_at": received_at,
                    "data": payload,
                });
                self.sync.add_esp32_data(&node_id, envelope, None)
            }
            NodeEvent::Image {
                node_id,
                image,
                content_type,
                metadata,
            } => {
                let envelope = json!({
                    "gateway_id": self.id,
                    "node_id": node_id,
                    "kind": "image",
                    "received_at": received_at,
                    "metadata": metadata,
                });
                let attachment = Attachment {
                    content_type: content_type.unwrap_or_else(|| "image/jpeg".to_string()),
                    data: image,
                };
                self.sync
                    .add_esp32_data(&node_id, envelope, Some(attachment))
            }
            NodeEvent::Alert { node_id, payload } => {
                let envelope = json!({
                    "gateway_id": self.id,
                    "node_id": node_id,
                    "kind": "alert",
                    "received_at": received_at,
                    "data": payload,
                });
                self.sync
                    .new_item(SyncItemType::NodeData, &node_id, envelope)
                    .map(|item| item.with_priority(ALERT_PRIORITY))
                    .and_then(|item| self.sync.enqueue(item))
            }
        };
        match stored {
            Ok(_) => {
                self.counters.node_events.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                log::error!("node event not stored: {:#}", err);
            }
        }
    }

    fn run_telemetry(&self, stop: &AtomicBool) {
        while !sleep_interruptible(self.config.telemetry_interval, || {
            stop.load(Ordering::SeqCst)
        }) {
            let snapshot = match serde_json::to_value(self.stats()) {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    log::warn!("telemetry snapshot not serializable: {}", err);
                    continue;
                }
            };
            match self.sync.add_telemetry(&self.id, snapshot) {
                Ok(_) => {
                    self.counters.telemetry.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => log::warn!("telemetry not stored: {:#}", err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::DetectorSettings;
    use crate::error::CloudError;
    use crate::frame::TransportKind;
    use crate::sync::SyncStatus;

    struct NullCloud;

    impl CloudTransport for NullCloud {
        fn health(&self) -> Result<(), CloudError> {
            Err(CloudError::Unreachable("test".into()))
        }
        fn post_json(&self, _: &str, _: &Value) -> Result<(), CloudError> {
            Err(CloudError::Unreachable("test".into()))
        }
        fn upload_image(&self, _: &str, _: &Attachment) -> Result<String, CloudError> {
            Err(CloudError::Unreachable("test".into()))
        }
    }

    fn gateway(output: Vec<f32>, sync_empty_results: bool) -> Gateway {
        gateway_with(output, |config| config.sync_empty_results = sync_empty_results)
    }

    fn gateway_with(output: Vec<f32>, tweak: impl FnOnce(&mut GatewayConfig)) -> Gateway {
        let mut config = GatewayConfig::default();
        config.gateway_id = Some("gw-test".into());
        config.bridge.http_addr = None;
        config.coordinator.poll_timeout = Duration::from_millis(20);
        tweak(&mut config);
        let engine = StubEngine::new(32, 32).with_output(output);
        let parts = GatewayParts {
            detector: Arc::new(
                Detector::new(Box::new(engine), DetectorSettings::new(vec!["deer".into()]))
                    .unwrap(),
            ),
            cloud: Arc::new(NullCloud),
            store: SyncStore::open_in_memory().unwrap(),
            node_config: Arc::new(MemoryConfigStore::default()),
            source_factory: None,
            radio_link: None,
        };
        Gateway::with_parts(config, parts).unwrap()
    }

    fn camera(name: &str) -> CameraConfig {
        CameraConfig::new(name, format!("stub://{}", name), TransportKind::File)
            .with_fps(50)
            .with_resolution(32, 32)
    }

    fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn empty_results_are_not_synced_by_default() {
        let gw = gateway(Vec::new(), false);
        gw.add_camera(camera("a")).unwrap();
        gw.start().unwrap();
        assert!(wait_for(|| gw.get_stats().routing.empty_results_skipped > 0));
        gw.shutdown();
        assert_eq!(gw.get_stats().routing.detections_forwarded, 0);
        assert_eq!(gw.sync().store().counts().unwrap().pending, 0);
    }

    #[test]
    fn detections_are_stored_with_their_frame() {
        let gw = gateway(vec![16.0, 16.0, 8.0, 8.0, 0.9], false);
        gw.add_camera(camera("a")).unwrap();
        gw.start().unwrap();
        assert!(wait_for(|| gw.get_stats().routing.detections_forwarded > 0));
        gw.shutdown();

        let items = gw.sync().store().load_active(10).unwrap();
        let item = items
            .iter()
            .find(|i| i.item_type == SyncItemType::Detection)
            .unwrap();
        assert_eq!(item.source, "a");
        assert_eq!(item.payload["gateway_id"], "gw-test");
        assert_eq!(item.payload["detections"][0]["label"], "deer");
        assert_eq!(item.attachment.as_ref().unwrap().content_type, "image/jpeg");
        assert_eq!(item.status, SyncStatus::Pending);
    }

    #[test]
    fn camera_controls_and_status() {
        let gw = gateway(Vec::new(), false);
        gw.add_camera(camera("a")).unwrap();
        gw.add_camera(camera("b")).unwrap();
        gw.start().unwrap();
        gw.disable_camera("b").unwrap();
        assert!(wait_for(|| gw.get_status().cameras_streaming == 1));
        assert!(gw.enable_camera("ghost").is_err());
        assert!(gw.remove_camera("a").unwrap());

        let status = gw.get_status();
        assert!(status.running);
        assert_eq!(status.gateway_id, "gw-test");
        assert_eq!(status.cameras_total, 1);
        assert!(!status.cloud_online);
        gw.shutdown();
        assert!(!gw.get_status().running);
    }

    #[test]
    fn restart_is_repeatable() {
        let gw = gateway(Vec::new(), false);
        gw.start().unwrap();
        gw.start().unwrap();
        gw.restart().unwrap();
        assert!(gw.is_running());
        gw.shutdown();
        gw.shutdown();
        assert!(!gw.is_running());
    }

    #[test]
    fn commands_to_unconnected_nodes_fail() {
        let gw = gateway(Vec::new(), false);
        assert!(matches!(
            gw.send_node_command("ghost", "reboot", Value::Null),
            Err(BridgeError::NodeOffline(_))
        ));
        assert!(gw.nodes().is_empty());
    }

    #[test]
    fn node_events_become_node_data_items() {
        let gw = gateway(Vec::new(), false);
        gw.inner.forward_node_event(NodeEvent::Data {
            node_id: "trail-1".into(),
            transport: crate::bridge::NodeTransport::Http,
            payload: json!({"temp": 3.5}),
        });
        gw.inner.forward_node_event(NodeEvent::Alert {
            node_id: "trail-1".into(),
            payload: json!({"pir": true}),
        });
        let items = gw.sync().store().load_active(10).unwrap();
        assert_eq!(items.len(), 2);
        // Alert first: it outranks ordinary node data.
        assert_eq!(items[0].priority, ALERT_PRIORITY);
        assert_eq!(items[0].payload["kind"], "alert");
        assert_eq!(items[1].endpoint(), "/field_nodes/trail-1/data");
        assert_eq!(items[1].payload["data"]["temp"], 3.5);
        assert_eq!(items[1].payload["transport"], "http");
    }

    #[test]
    fn telemetry_leaves_node_liveness_to_the_caller() {
        let gw = gateway_with(Vec::new(), |config| {
            config.telemetry_interval = Duration::from_millis(20);
            config.node_stale_after = Duration::ZERO;
        });
        gw.inner.bridge.registry().register(
            "trail-9",
            crate::bridge::NodeInfo::default(),
            crate::bridge::NodeTransport::Http,
        );
        std::thread::sleep(Duration::from_millis(5));

        gw.start().unwrap();
        assert!(wait_for(|| gw.get_stats().routing.telemetry_sent >= 2));
        assert_eq!(gw.nodes()[0].status, crate::bridge::NodeStatus::Online);
        gw.shutdown();

        assert_eq!(gw.mark_stale_nodes(), vec!["trail-9".to_string()]);
        assert_eq!(gw.nodes()[0].status, crate::bridge::NodeStatus::Offline);
    }
}
