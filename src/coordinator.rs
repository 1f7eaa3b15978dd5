//! Fan-in of many camera streams into one shared detector.
//!
//! Every camera gets its own consumer thread, so a slow detector call on one camera
//! never starves another. Results from all cameras land in one bounded queue and are
//! pulled with [`StreamCoordinator::get_detection`] in completion order.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::detect::{DetectionResult, Detector, DetectorStats};
use crate::frame::{CameraConfig, CapturedFrame};
use crate::ingest::{default_factory, CameraStats, CameraStream, SourceFactory, StreamSettings};
use crate::join_with_timeout;

pub const DEFAULT_FRAME_QUEUE_SIZE: usize = 10;
pub const DEFAULT_RESULT_QUEUE_SIZE: usize = 100;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct CoordinatorSettings {
    /// Capacity of each camera's frame queue.
    pub frame_queue_size: usize,
    /// Capacity of the shared result queue.
    pub result_queue_size: usize,
    /// How long a consumer blocks on its frame queue before re-checking its stop flag.
    pub poll_timeout: Duration,
    /// Attach the originating frame to results that contain detections.
    pub keep_frames: bool,
    pub stream: StreamSettings,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            frame_queue_size: DEFAULT_FRAME_QUEUE_SIZE,
            result_queue_size: DEFAULT_RESULT_QUEUE_SIZE,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            keep_frames: true,
            stream: StreamSettings::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CoordinatorStats {
    pub running: bool,
    pub cameras: Vec<CameraStats>,
    pub results_published: u64,
    pub results_dropped: u64,
    pub detection_errors: u64,
    pub detector: DetectorStats,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

struct Consumer {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

struct CameraEntry {
    stream: CameraStream,
    frames: Arc<Mutex<Receiver<CapturedFrame>>>,
    enabled: bool,
    consumer: Option<Consumer>,
}

/// Owns every camera stream and the consumer threads that feed the detector.
pub struct StreamCoordinator {
    detector: Arc<Detector>,
    settings: CoordinatorSettings,
    factory: SourceFactory,
    cameras: Mutex<BTreeMap<String, CameraEntry>>,
    results_tx: SyncSender<DetectionResult>,
    results_rx: Mutex<Receiver<DetectionResult>>,
    running: AtomicBool,
    counters: Arc<Counters>,
}

impl StreamCoordinator {
    pub fn new(detector: Arc<Detector>, settings: CoordinatorSettings) -> Self {
        let (results_tx, results_rx) = mpsc::sync_channel(settings.result_queue_size.max(1));
        Self {
            detector,
            settings,
            factory: default_factory(),
            cameras: Mutex::new(BTreeMap::new()),
            results_tx,
            results_rx: Mutex::new(results_rx),
            running: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Replace how capture sources are opened. Affects cameras added afterwards.
    pub fn with_source_factory(mut self, factory: SourceFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Add a camera, replacing any existing camera of the same name.
    ///
    /// The stream starts immediately when the coordinator is running and the config is
    /// enabled. Disabled configs are kept but not started.
    pub fn add_camera(&self, config: CameraConfig) -> Result<()> {
        config.validate()?;
        let name = config.name.clone();
        if let Some(old) = self.take_camera(&name)? {
            log::info!("replacing camera '{}'", name);
            self.shutdown_entry(old);
        }

        let enabled = config.enabled;
        let (stream, frames) = CameraStream::new(
            config,
            self.settings.stream.clone(),
            self.factory.clone(),
            self.settings.frame_queue_size,
        );
        let mut entry = CameraEntry {
            stream,
            frames: Arc::new(Mutex::new(frames)),
            enabled,
            consumer: None,
        };
        if self.is_running() && enabled {
            self.activate(&mut entry)?;
        }
        self.lock_cameras()?.insert(name.clone(), entry);
        log::info!("camera '{}' added (enabled: {})", name, enabled);
        Ok(())
    }

    /// Stop and discard a camera. Unknown names are a no-op.
    pub fn remove_camera(&self, name: &str) -> Result<bool> {
        match self.take_camera(name)? {
            Some(entry) => {
                self.shutdown_entry(entry);
                log::info!("camera '{}' removed", name);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Start every enabled camera and its consumer.
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut cameras = self.lock_cameras()?;
        for (name, entry) in cameras.iter_mut() {
            if !entry.enabled {
                continue;
            }
            if let Err(err) = self.activate(entry) {
                log::error!("camera '{}' failed to start: {:#}", name, err);
            }
        }
        log::info!("stream coordinator started with {} camera(s)", cameras.len());
        Ok(())
    }

    /// Stop every camera and consumer. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let entries: Vec<(String, Option<Consumer>)> = match self.cameras.lock() {
            Ok(mut cameras) => cameras
                .iter_mut()
                .map(|(name, entry)| {
                    entry.stream.stop();
                    (name.clone(), entry.consumer.take())
                })
                .collect(),
            Err(_) => Vec::new(),
        };
        for (name, consumer) in entries {
            if let Some(consumer) = consumer {
                self.stop_consumer(&name, consumer);
            }
        }
        log::info!("stream coordinator stopped");
    }

    /// Pull the next detection result from any camera.
    pub fn get_detection(&self, timeout: Duration) -> Option<DetectionResult> {
        let rx = self.results_rx.lock().ok()?;
        rx.recv_timeout(timeout).ok()
    }

    /// Clear a failed camera and start it again.
    pub fn restart_camera(&self, name: &str) -> Result<()> {
        let mut cameras = self.lock_cameras()?;
        let entry = cameras
            .get_mut(name)
            .ok_or_else(|| anyhow!("unknown camera '{}'", name))?;
        entry.stream.restart()?;
        if entry.consumer.is_none() && self.is_running() {
            entry.consumer = Some(self.spawn_consumer(entry)?);
        }
        entry.enabled = true;
        Ok(())
    }

    /// Enable or disable a camera without discarding it.
    pub fn set_camera_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let consumer = {
            let mut cameras = self.lock_cameras()?;
            let entry = cameras
                .get_mut(name)
                .ok_or_else(|| anyhow!("unknown camera '{}'", name))?;
            if entry.enabled == enabled {
                return Ok(());
            }
            entry.enabled = enabled;
            if enabled {
                if self.is_running() {
                    self.activate(entry)?;
                }
                None
            } else {
                entry.stream.stop();
                entry.consumer.take()
            }
        };
        if let Some(consumer) = consumer {
            self.stop_consumer(name, consumer);
        }
        log::info!("camera '{}' {}", name, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn camera_stats(&self) -> Vec<CameraStats> {
        match self.cameras.lock() {
            Ok(cameras) => cameras
                .values()
                .map(|entry| {
                    let mut stats = entry.stream.stats();
                    stats.enabled = entry.enabled;
                    stats
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn camera_configs(&self) -> Vec<CameraConfig> {
        match self.cameras.lock() {
            Ok(cameras) => cameras
                .values()
                .map(|entry| entry.stream.config().clone().with_enabled(entry.enabled))
                .collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            running: self.is_running(),
            cameras: self.camera_stats(),
            results_published: self.counters.published.load(Ordering::Relaxed),
            results_dropped: self.counters.dropped.load(Ordering::Relaxed),
            detection_errors: self.counters.errors.load(Ordering::Relaxed),
            detector: self.detector.stats(),
        }
    }

    fn lock_cameras(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, CameraEntry>>> {
        self.cameras
            .lock()
            .map_err(|_| anyhow!("camera table lock poisoned"))
    }

    fn take_camera(&self, name: &str) -> Result<Option<CameraEntry>> {
        Ok(self.lock_cameras()?.remove(name))
    }

    fn activate(&self, entry: &mut CameraEntry) -> Result<()> {
        entry.stream.start()?;
        if entry.consumer.is_none() {
            entry.consumer = Some(self.spawn_consumer(entry)?);
        }
        Ok(())
    }

    fn shutdown_entry(&self, mut entry: CameraEntry) {
        entry.stream.stop();
        if let Some(consumer) = entry.consumer.take() {
            self.stop_consumer(entry.stream.name(), consumer);
        }
    }

    fn stop_consumer(&self, camera: &str, consumer: Consumer) {
        consumer.stop.store(true, Ordering::SeqCst);
        let label = format!("consumer-{}", camera);
        join_with_timeout(
            &label,
            consumer.handle,
            &consumer.done,
            self.settings.stream.stop_timeout + self.settings.poll_timeout,
        );
    }

    fn spawn_consumer(&self, entry: &CameraEntry) -> Result<Consumer> {
        let camera = entry.stream.name().to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();
        let ctx = ConsumerContext {
            camera: camera.clone(),
            frames: entry.frames.clone(),
            detector: self.detector.clone(),
            results: self.results_tx.clone(),
            stop: stop.clone(),
            counters: self.counters.clone(),
            poll_timeout: self.settings.poll_timeout,
            keep_frames: self.settings.keep_frames,
        };
        let handle = std::thread::Builder::new()
            .name(format!("consumer-{}", camera))
            .spawn(move || {
                ctx.run();
                let _ = done_tx.send(());
            })?;
        Ok(Consumer {
            stop,
            handle,
            done: done_rx,
        })
    }
}

impl Drop for StreamCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ConsumerContext {
    camera: String,
    frames: Arc<Mutex<Receiver<CapturedFrame>>>,
    detector: Arc<Detector>,
    results: SyncSender<DetectionResult>,
    stop: Arc<AtomicBool>,
    counters: Arc<Counters>,
    poll_timeout: Duration,
    keep_frames: bool,
}

impl ConsumerContext {
    fn run(self) {
        let Ok(frames) = self.frames.lock() else {
            log::error!("camera '{}' frame queue lock poisoned", self.camera);
            return;
        };
        while !self.stop.load(Ordering::SeqCst) {
            let frame = match frames.recv_timeout(self.poll_timeout) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            if !self.process(frame) {
                break;
            }
        }
    }

    /// Returns false when the result queue has been closed.
    fn process(&self, frame: CapturedFrame) -> bool {
        let detections = match self.detector.detect(&frame.image) {
            Ok(detections) => detections,
            Err(err) => {
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "camera '{}' detection failed on frame {}: {:#}",
                    self.camera,
                    frame.sequence,
                    err
                );
                return true;
            }
        };

        let sequence = frame.sequence;
        let captured_at_ms = frame.captured_at_ms;
        let keep = self.keep_frames && !detections.is_empty();
        let result = DetectionResult {
            camera: self.camera.clone(),
            sequence,
            captured_at_ms,
            detections,
            frame: keep.then_some(frame),
        };
        match self.results.try_send(result) {
            Ok(()) => {
                self.counters.published.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "result queue full; dropped result for camera '{}' frame {}",
                    self.camera,
                    sequence
                );
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}
