//! Per-camera capture loop with reconnect supervision.
//!
//! State machine:
//!
//! ```text
//! disconnected -> connecting -> streaming -> disconnected (read error) -> connecting ...
//!                     \-> failed (after max_reconnect_attempts consecutive failures)
//! ```
//!
//! `failed` is terminal until `restart()`. Frames are pushed with `try_send`; a full
//! queue drops the frame and counts it. The capture loop never blocks on consumers.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::source::{FrameSource, SourceFactory};
use crate::frame::{CameraConfig, CapturedFrame};
use crate::{join_with_timeout, now_ms_lossy, sleep_interruptible};

pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Debug)]
pub struct StreamSettings {
    /// Consecutive failed connection attempts before the stream enters `Failed`.
    pub max_reconnect_attempts: u32,
    /// Fixed delay between failed connection attempts.
    pub reconnect_delay: Duration,
    /// How long `stop()` waits for the capture thread.
    pub stop_timeout: Duration,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraState {
    Disconnected,
    Connecting,
    Streaming,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
pub struct CameraStats {
    pub name: String,
    pub state: CameraState,
    pub enabled: bool,
    pub frames_captured: u64,
    pub frames_dropped: u64,
    pub read_errors: u64,
    pub connect_attempts: u64,
    /// Delivered frames per second, measured over the last full one-second window.
    pub fps: f64,
    pub last_error: Option<String>,
}

struct Shared {
    state: Mutex<CameraState>,
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    read_errors: AtomicU64,
    connect_attempts: AtomicU64,
    fps_bits: AtomicU64,
    next_sequence: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: Mutex::new(CameraState::Disconnected),
            frames_captured: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            read_errors: AtomicU64::new(0),
            connect_attempts: AtomicU64::new(0),
            fps_bits: AtomicU64::new(0f64.to_bits()),
            next_sequence: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    fn state(&self) -> CameraState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(CameraState::Failed)
    }

    fn set_state(&self, state: CameraState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    fn set_error(&self, err: &anyhow::Error) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(format!("{:#}", err));
        }
    }

    fn set_fps(&self, fps: f64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }
}

/// One capture thread. Each start gets its own stop flag, so a thread abandoned by a
/// timed-out `stop()` stays stopped across a later `start()`.
struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

/// Owns the lifecycle of one capture source.
pub struct CameraStream {
    config: CameraConfig,
    settings: StreamSettings,
    factory: SourceFactory,
    frames: SyncSender<CapturedFrame>,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl CameraStream {
    /// Create a stream and the receiving end of its bounded frame queue.
    pub fn new(
        config: CameraConfig,
        settings: StreamSettings,
        factory: SourceFactory,
        queue_capacity: usize,
    ) -> (Self, Receiver<CapturedFrame>) {
        let (tx, rx) = mpsc::sync_channel(queue_capacity.max(1));
        let stream = Self {
            config,
            settings,
            factory,
            frames: tx,
            shared: Arc::new(Shared::new()),
            worker: Mutex::new(None),
        };
        (stream, rx)
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn state(&self) -> CameraState {
        self.shared.state()
    }

    /// Start the capture thread. No-op if it is already running or the stream has failed.
    pub fn start(&self) -> Result<()> {
        let mut worker = self
            .worker
            .lock()
            .map_err(|_| anyhow!("camera '{}' worker lock poisoned", self.config.name))?;
        if self.shared.state() == CameraState::Failed {
            log::warn!(
                "camera '{}' is failed; call restart() to try again",
                self.config.name
            );
            return Ok(());
        }
        if let Some(existing) = worker.as_ref() {
            if !existing.handle.is_finished() {
                return Ok(());
            }
        }
        if let Some(finished) = worker.take() {
            let _ = finished.handle.join();
        }

        let stop = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = mpsc::channel();
        let config = self.config.clone();
        let settings = self.settings.clone();
        let factory = self.factory.clone();
        let frames = self.frames.clone();
        let shared = self.shared.clone();
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name(format!("capture-{}", self.config.name))
            .spawn(move || {
                capture_loop(&config, &settings, &factory, &frames, &shared, &thread_stop);
                let _ = done_tx.send(());
            })?;
        *worker = Some(Worker {
            stop,
            handle,
            done: done_rx,
        });
        log::info!("camera '{}' started", self.config.name);
        Ok(())
    }

    /// Stop the capture thread, waiting at most `stop_timeout`. Idempotent.
    pub fn stop(&self) {
        let worker = match self.worker.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(worker) = worker {
            worker.stop.store(true, Ordering::SeqCst);
            let label = format!("capture-{}", self.config.name);
            join_with_timeout(&label, worker.handle, &worker.done, self.settings.stop_timeout);
            log::info!("camera '{}' stopped", self.config.name);
        }
        if self.shared.state() != CameraState::Failed {
            self.shared.set_state(CameraState::Disconnected);
        }
        self.shared.set_fps(0.0);
    }

    /// Clear a `Failed` state and start again.
    pub fn restart(&self) -> Result<()> {
        self.stop();
        self.shared.set_state(CameraState::Disconnected);
        self.start()
    }

    pub fn stats(&self) -> CameraStats {
        CameraStats {
            name: self.config.name.clone(),
            state: self.shared.state(),
            enabled: self.config.enabled,
            frames_captured: self.shared.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.shared.frames_dropped.load(Ordering::Relaxed),
            read_errors: self.shared.read_errors.load(Ordering::Relaxed),
            connect_attempts: self.shared.connect_attempts.load(Ordering::Relaxed),
            fps: f64::from_bits(self.shared.fps_bits.load(Ordering::Relaxed)),
            last_error: self.shared.last_error.lock().ok().and_then(|e| e.clone()),
        }
    }
}

impl Drop for CameraStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Counts delivered frames over one-second windows.
struct FpsWindow {
    started: Instant,
    count: u64,
}

impl FpsWindow {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            count: 0,
        }
    }

    /// Record a delivered frame; returns the measured rate when a window closes.
    fn record(&mut self) -> Option<f64> {
        self.count += 1;
        let elapsed = self.started.elapsed();
        if elapsed < Duration::from_secs(1) {
            return None;
        }
        let fps = self.count as f64 / elapsed.as_secs_f64();
        self.started = Instant::now();
        self.count = 0;
        Some(fps)
    }
}

fn capture_loop(
    config: &CameraConfig,
    settings: &StreamSettings,
    factory: &SourceFactory,
    frames: &SyncSender<CapturedFrame>,
    shared: &Shared,
    stop: &AtomicBool,
) {
    let stopped = || stop.load(Ordering::SeqCst);
    let mut source: Option<Box<dyn FrameSource>> = None;
    let mut consecutive_failures = 0u32;
    let mut fps = FpsWindow::new();
    let interval = config.frame_interval();

    while !stopped() {
        let Some(active) = source.as_mut() else {
            shared.set_state(CameraState::Connecting);
            shared.connect_attempts.fetch_add(1, Ordering::Relaxed);
            let attempt = connect(config, factory);
            if stopped() {
                if let Ok(mut opened) = attempt {
                    opened.release();
                }
                return;
            }
            match attempt {
                Ok(opened) => {
                    consecutive_failures = 0;
                    log::info!("camera '{}' streaming from {}", config.name, opened.describe());
                    source = Some(opened);
                    fps = FpsWindow::new();
                    shared.set_state(CameraState::Streaming);
                }
                Err(err) => {
                    consecutive_failures += 1;
                    shared.set_error(&err);
                    if consecutive_failures >= settings.max_reconnect_attempts {
                        log::error!(
                            "camera '{}' failed after {} connection attempts: {:#}",
                            config.name,
                            consecutive_failures,
                            err
                        );
                        shared.set_state(CameraState::Failed);
                        break;
                    }
                    log::warn!(
                        "camera '{}' connection attempt {}/{} failed: {:#}",
                        config.name,
                        consecutive_failures,
                        settings.max_reconnect_attempts,
                        err
                    );
                    shared.set_state(CameraState::Disconnected);
                    if sleep_interruptible(settings.reconnect_delay, stopped) {
                        break;
                    }
                }
            }
            continue;
        };

        let read_started = Instant::now();
        let read = active.read_frame();
        if stopped() {
            break;
        }
        match read {
            Ok(image) => {
                shared.frames_captured.fetch_add(1, Ordering::Relaxed);
                let sequence = shared.next_sequence.fetch_add(1, Ordering::SeqCst);
                let frame = CapturedFrame::new(image, sequence, now_ms_lossy());
                match frames.try_send(frame) {
                    Ok(()) => {
                        if let Some(rate) = fps.record() {
                            shared.set_fps(rate);
                        }
                    }
                    Err(TrySendError::Full(_)) => {
                        shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        log::debug!("camera '{}' queue full; dropped frame {}", config.name, sequence);
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        log::warn!("camera '{}' frame queue closed; stopping capture", config.name);
                        break;
                    }
                }
            }
            Err(err) => {
                shared.read_errors.fetch_add(1, Ordering::Relaxed);
                shared.set_error(&err);
                log::warn!("camera '{}' read failed: {:#}; reconnecting", config.name, err);
                active.release();
                source = None;
                shared.set_fps(0.0);
                shared.set_state(CameraState::Disconnected);
                continue;
            }
        }

        let elapsed = read_started.elapsed();
        if elapsed < interval && sleep_interruptible(interval - elapsed, stopped) {
            break;
        }
    }

    if let Some(mut active) = source {
        active.release();
    }
    if stopped() {
        // stop() owns the final state.
        return;
    }
    shared.set_fps(0.0);
    if shared.state() != CameraState::Failed {
        shared.set_state(CameraState::Disconnected);
    }
}

fn connect(config: &CameraConfig, factory: &SourceFactory) -> Result<Box<dyn FrameSource>> {
    let mut source = factory(config)?;
    source.connect()?;
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::TransportKind;
    use crate::ingest::source::default_factory;
    use image::RgbImage;
    use std::sync::atomic::AtomicU32;

    struct NeverConnects;

    impl FrameSource for NeverConnects {
        fn connect(&mut self) -> Result<()> {
            Err(anyhow!("device unplugged"))
        }

        fn read_frame(&mut self) -> Result<RgbImage> {
            Err(anyhow!("not connected"))
        }

        fn describe(&self) -> String {
            "never".to_string()
        }
    }

    /// Connects instantly, then takes 400 ms per read. Each frame's single red pixel
    /// carries the instance number the factory gave it.
    struct SlowSource {
        instance: u8,
    }

    impl FrameSource for SlowSource {
        fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        fn read_frame(&mut self) -> Result<RgbImage> {
            std::thread::sleep(Duration::from_millis(400));
            Ok(RgbImage::from_pixel(1, 1, image::Rgb([self.instance, 0, 0])))
        }

        fn describe(&self) -> String {
            format!("slow #{}", self.instance)
        }
    }

    fn fast_settings() -> StreamSettings {
        StreamSettings {
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(5),
            stop_timeout: Duration::from_secs(2),
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn fails_after_exactly_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let factory: SourceFactory = Arc::new(move |_cfg: &CameraConfig| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NeverConnects) as Box<dyn FrameSource>)
        });
        let cfg = CameraConfig::new("b", "rtsp://dead", TransportKind::NetworkStream);
        let (stream, _rx) = CameraStream::new(cfg, fast_settings(), factory, 4);
        stream.start().unwrap();

        assert!(wait_for(|| stream.state() == CameraState::Failed));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(attempts.load(Ordering::SeqCst), 5);

        // start() on a failed stream does not retry.
        stream.start().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
        assert_eq!(stream.stats().connect_attempts, 5);

        stream.restart().unwrap();
        assert!(wait_for(|| attempts.load(Ordering::SeqCst) == 10));
        stream.stop();
    }

    #[test]
    fn full_queue_drops_instead_of_blocking() {
        let cfg = CameraConfig::new("a", "stub://a", TransportKind::NetworkStream)
            .with_fps(0)
            .with_resolution(8, 8);
        let (stream, rx) = CameraStream::new(cfg, fast_settings(), default_factory(), 2);
        stream.start().unwrap();

        assert!(wait_for(|| stream.stats().frames_dropped > 10));
        stream.stop();

        let stats = stream.stats();
        assert!(stats.frames_captured >= stats.frames_dropped + 2);
        let queued: Vec<_> = rx.try_iter().collect();
        assert_eq!(queued.len(), 2);
        assert!(queued[0].sequence < queued[1].sequence);
    }

    #[test]
    fn sequence_numbers_survive_restart() {
        let cfg = CameraConfig::new("a", "stub://a", TransportKind::File)
            .with_fps(200)
            .with_resolution(8, 8);
        let (stream, rx) = CameraStream::new(cfg, fast_settings(), default_factory(), 64);

        stream.start().unwrap();
        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        stream.stop();
        let drained: Vec<_> = rx.try_iter().collect();
        let last_before = drained.last().map(|f| f.sequence).unwrap_or(first.sequence);

        stream.start().unwrap();
        let after = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        stream.stop();
        assert!(after.sequence > last_before);
    }

    #[test]
    fn stop_is_idempotent() {
        let cfg = CameraConfig::new("a", "stub://a", TransportKind::File).with_resolution(8, 8);
        let (stream, _rx) = CameraStream::new(cfg, fast_settings(), default_factory(), 4);
        stream.stop();
        stream.start().unwrap();
        stream.start().unwrap();
        stream.stop();
        stream.stop();
        assert_eq!(stream.state(), CameraState::Disconnected);
    }

    #[test]
    fn abandoned_capture_thread_stays_stopped_after_restart() {
        let opened = Arc::new(AtomicU32::new(0));
        let counter = opened.clone();
        let factory: SourceFactory = Arc::new(move |_cfg: &CameraConfig| {
            let instance = counter.fetch_add(1, Ordering::SeqCst) as u8 + 1;
            Ok(Box::new(SlowSource { instance }) as Box<dyn FrameSource>)
        });
        let settings = StreamSettings {
            stop_timeout: Duration::from_millis(50),
            ..fast_settings()
        };
        let cfg = CameraConfig::new("slow", "rtsp://slow", TransportKind::NetworkStream).with_fps(0);
        let (stream, rx) = CameraStream::new(cfg, settings, factory, 64);

        stream.start().unwrap();
        let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(first.image.get_pixel(0, 0)[0], 1);

        // The first thread is mid-read and gets abandoned by the short stop timeout.
        stream.restart().unwrap();
        let _ = rx.try_iter().count();

        let deadline = Instant::now() + Duration::from_millis(1500);
        let mut instances = Vec::new();
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match rx.recv_timeout(left) {
                Ok(frame) => instances.push(frame.image.get_pixel(0, 0)[0]),
                Err(_) => break,
            }
        }
        stream.stop();

        assert!(!instances.is_empty());
        assert!(instances.iter().all(|i| *i == 2), "frames from {:?}", instances);
        assert_eq!(opened.load(Ordering::SeqCst), 2);
    }
}
