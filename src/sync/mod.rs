//! Durable, retrying delivery of gateway data to the cloud.
//!
//! Every item is written to the [`SyncStore`] before anything else happens to it, so
//! a crash or an unreachable cloud never loses data. A bounded in-memory queue holds
//! the items currently eligible for delivery; whatever does not fit stays store-only
//! and is backfilled by the retry thread.
//!
//! Threads:
//! - `sync-loop`: checks cloud health every `sync_interval` and delivers one batch.
//! - `sync-retry`: backfills the queue from the store and purges old completed rows.

mod cloud;
mod item;
mod queue;
mod store;

pub use cloud::{CloudSettings, CloudTransport, HttpCloudClient};
pub use item::{Attachment, SyncItem, SyncItemType, SyncStatus};
pub use store::{StatusCounts, StoreHandle, SyncStore};

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::CloudError;
use crate::{join_with_timeout, now_ms, now_ms_lossy, sleep_interruptible};
use queue::{Push, SyncQueue};
use store::ItemState;

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(10);
pub const DEFAULT_RETRY_MAX_DELAY: Duration = Duration::from_secs(600);
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_COMPLETED_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub sync_interval: Duration,
    pub batch_size: usize,
    /// Attempts after which an item is marked failed.
    pub max_retries: u32,
    pub queue_capacity: usize,
    /// Delay before the first retry. Doubles per attempt. Zero retries on the next tick.
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// How often the retry thread backfills from the store.
    pub retry_interval: Duration,
    pub completed_retention: Duration,
    pub stop_timeout: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            sync_interval: DEFAULT_SYNC_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
            retry_max_delay: DEFAULT_RETRY_MAX_DELAY,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            completed_retention: DEFAULT_COMPLETED_RETENTION,
            stop_timeout: Duration::from_secs(5),
        }
    }
}

impl SyncSettings {
    /// Backoff before the attempt following attempt number `attempts`.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        if self.retry_base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempts.saturating_sub(1).min(20);
        self.retry_base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.retry_max_delay)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct SyncStats {
    pub running: bool,
    pub queued: usize,
    pub in_flight: usize,
    /// Items delivered since the service was created.
    pub completed: u64,
    /// Items that exhausted their retries since the service was created.
    pub failed: u64,
    pub retries: u64,
    /// Items left store-only because the queue was full, on insert or on requeue.
    /// The retry thread backfills them.
    pub overflowed: u64,
    pub cloud_online: bool,
    pub last_sync_ms: Option<u64>,
    /// Row counts in the durable store, if it answered.
    pub store: Option<StatusCounts>,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
    overflowed: AtomicU64,
}

struct QueueState {
    queue: SyncQueue,
    in_flight: HashSet<String>,
}

struct Shared {
    store: StoreHandle,
    cloud: Arc<dyn CloudTransport>,
    settings: SyncSettings,
    state: Mutex<QueueState>,
    counters: Counters,
    cloud_online: AtomicBool,
    last_sync_ms: AtomicU64,
    nonce: AtomicU64,
}

struct Worker {
    name: &'static str,
    /// Shared by the workers of one `start()`; a later start never clears it.
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    done: Receiver<()>,
}

/// The gateway's single path to the cloud.
pub struct SyncService {
    shared: Arc<Shared>,
    workers: Mutex<Vec<Worker>>,
    running: AtomicBool,
    // Dropped after `Drop::drop` has stopped the workers.
    _store: SyncStore,
}

impl SyncService {
    pub fn new(store: SyncStore, cloud: Arc<dyn CloudTransport>, settings: SyncSettings) -> Self {
        let shared = Shared {
            store: store.handle(),
            cloud,
            state: Mutex::new(QueueState {
                queue: SyncQueue::new(settings.queue_capacity),
                in_flight: HashSet::new(),
            }),
            settings,
            counters: Counters::default(),
            cloud_online: AtomicBool::new(false),
            last_sync_ms: AtomicU64::new(0),
            nonce: AtomicU64::new(rand::random::<u32>() as u64),
        };
        Self {
            shared: Arc::new(shared),
            workers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            _store: store,
        }
    }

    /// Open (or create) the store at `path` and wrap it.
    pub fn open<P: AsRef<Path>>(
        path: P,
        cloud: Arc<dyn CloudTransport>,
        settings: SyncSettings,
    ) -> Result<Self> {
        Ok(Self::new(SyncStore::open(path)?, cloud, settings))
    }

    pub fn store(&self) -> StoreHandle {
        self.shared.store.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Build a pending item stamped with the current time.
    pub fn new_item(
        &self,
        item_type: SyncItemType,
        source: &str,
        payload: Value,
    ) -> Result<SyncItem> {
        let nonce = self.shared.nonce.fetch_add(1, Ordering::Relaxed);
        Ok(SyncItem::new(item_type, source, payload, now_ms()?, nonce))
    }

    /// Persist an item and queue it if there is room. Returns its id.
    pub fn enqueue(&self, item: SyncItem) -> Result<String> {
        self.shared.enqueue(item)
    }

    pub fn add_detection(
        &self,
        camera: &str,
        payload: Value,
        image: Option<Attachment>,
    ) -> Result<String> {
        let mut item = self.new_item(SyncItemType::Detection, camera, payload)?;
        item.attachment = image;
        self.enqueue(item)
    }

    pub fn add_telemetry(&self, source: &str, payload: Value) -> Result<String> {
        let item = self.new_item(SyncItemType::Telemetry, source, payload)?;
        self.enqueue(item)
    }

    pub fn add_esp32_data(
        &self,
        node_id: &str,
        payload: Value,
        image: Option<Attachment>,
    ) -> Result<String> {
        let mut item = self.new_item(SyncItemType::NodeData, node_id, payload)?;
        item.attachment = image;
        self.enqueue(item)
    }

    /// Requeue every undelivered item from the store. Interrupted attempts become
    /// retries. Safe to call repeatedly.
    pub fn reload(&self) -> Result<usize> {
        let reset = self.shared.store.reset_in_progress()?;
        if reset > 0 {
            log::info!("{} interrupted sync item(s) reset to retry", reset);
        }
        let loaded = self.shared.backfill()?;
        log::info!("sync reload queued {} item(s)", loaded);
        Ok(loaded)
    }

    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(err) = self.reload() {
            log::warn!("sync reload failed: {:#}", err);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let mut workers = self.lock_workers();
        let shared = self.shared.clone();
        workers.push(spawn_worker("sync-loop", &stop, move |stop| {
            shared.run_sync_loop(stop)
        })?);
        let shared = self.shared.clone();
        workers.push(spawn_worker("sync-retry", &stop, move |stop| {
            shared.run_retry_loop(stop)
        })?);
        log::info!("sync service started");
        Ok(())
    }

    /// Stop both threads and flush the queue to the store. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let workers: Vec<Worker> = self.lock_workers().drain(..).collect();
        for worker in &workers {
            worker.stop.store(true, Ordering::SeqCst);
        }
        for worker in workers {
            join_with_timeout(
                worker.name,
                worker.handle,
                &worker.done,
                self.settings().stop_timeout,
            );
        }
        match self.shared.flush() {
            Ok(flushed) => log::info!("sync service stopped; {} queued item(s) flushed", flushed),
            Err(err) => log::error!("sync flush failed: {:#}", err),
        }
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.shared.settings
    }

    pub fn stats(&self) -> SyncStats {
        let (queued, in_flight) = {
            let state = self.shared.lock_state();
            (state.queue.len(), state.in_flight.len())
        };
        let counters = &self.shared.counters;
        let last_sync = self.shared.last_sync_ms.load(Ordering::Relaxed);
        SyncStats {
            running: self.is_running(),
            queued,
            in_flight,
            completed: counters.completed.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            retries: counters.retries.load(Ordering::Relaxed),
            overflowed: counters.overflowed.load(Ordering::Relaxed),
            cloud_online: self.shared.cloud_online.load(Ordering::Relaxed),
            last_sync_ms: (last_sync > 0).then_some(last_sync),
            store: self.shared.store.counts().ok(),
        }
    }

    fn lock_workers(&self) -> MutexGuard<'_, Vec<Worker>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for SyncService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_worker(
    name: &'static str,
    stop: &Arc<AtomicBool>,
    body: impl FnOnce(&AtomicBool) + Send + 'static,
) -> Result<Worker> {
    let (done_tx, done) = mpsc::channel();
    let thread_stop = stop.clone();
    let handle = std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            body(&thread_stop);
            let _ = done_tx.send(());
        })?;
    Ok(Worker {
        name,
        stop: stop.clone(),
        handle,
        done,
    })
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enqueue(&self, item: SyncItem) -> Result<String> {
        let id = item.id.clone();
        if !self.store.insert(item.clone())? {
            return Err(anyhow!("sync item {} already exists", id));
        }
        if self.lock_state().queue.push(item) == Push::Full {
            self.counters.overflowed.fetch_add(1, Ordering::Relaxed);
            log::debug!("sync queue full; item {} kept in store only", id);
        }
        Ok(id)
    }

    /// Queue active store items that are neither queued nor in flight.
    fn backfill(&self) -> Result<usize> {
        let mut state = self.lock_state();
        let room = self
            .settings
            .queue_capacity
            .saturating_sub(state.queue.len());
        if room == 0 {
            return Ok(0);
        }
        drop(state);

        // Over-fetch: some rows will already be queued or in flight.
        let candidates = self.store.load_active(room + self.settings.batch_size)?;
        state = self.lock_state();
        let mut queued = 0;
        for item in candidates {
            if state.in_flight.contains(&item.id) {
                continue;
            }
            match state.queue.push(item) {
                Push::Queued => queued += 1,
                Push::Duplicate => {}
                Push::Full => break,
            }
        }
        Ok(queued)
    }

    /// Persist everything still queued. Returns how many items were drained.
    ///
    /// State changes are written as they happen, so rows that already exist are left
    /// alone: a queued copy may be older than its row.
    fn flush(&self) -> Result<usize> {
        let drained = self.lock_state().queue.drain();
        let count = drained.len();
        for item in drained {
            self.store.insert(item)?;
        }
        Ok(count)
    }

    fn run_sync_loop(&self, stop: &AtomicBool) {
        log::debug!("sync loop running every {:?}", self.settings.sync_interval);
        while !stop.load(Ordering::SeqCst) {
            self.tick(stop);
            if sleep_interruptible(self.settings.sync_interval, || stop.load(Ordering::SeqCst)) {
                break;
            }
        }
    }

    fn run_retry_loop(&self, stop: &AtomicBool) {
        while !sleep_interruptible(self.settings.retry_interval, || stop.load(Ordering::SeqCst)) {
            match self.backfill() {
                Ok(0) => {}
                Ok(n) => log::debug!("retry thread requeued {} sync item(s)", n),
                Err(err) => log::warn!("sync backfill failed: {:#}", err),
            }
            let retention = self.settings.completed_retention.as_millis() as u64;
            let cutoff = now_ms_lossy().saturating_sub(retention);
            match self.store.purge_completed(cutoff) {
                Ok(0) => {}
                Ok(n) => log::info!("purged {} completed sync item(s)", n),
                Err(err) => log::warn!("sync purge failed: {:#}", err),
            }
        }
    }

    /// One health check plus at most one batch. Returns how many items were attempted.
    fn tick(&self, stop: &AtomicBool) -> usize {
        if let Err(err) = self.cloud.health() {
            if self.cloud_online.swap(false, Ordering::Relaxed) {
                log::warn!("cloud unreachable: {}", err);
            }
            return 0;
        }
        if !self.cloud_online.swap(true, Ordering::Relaxed) {
            log::info!("cloud reachable");
        }
        if stop.load(Ordering::SeqCst) {
            return 0;
        }

        let batch = {
            let mut state = self.lock_state();
            let batch = state
                .queue
                .pop_due(self.settings.batch_size, now_ms_lossy());
            for item in &batch {
                state.in_flight.insert(item.id.clone());
            }
            batch
        };

        let mut attempted = 0;
        let mut remaining = batch.into_iter();
        for item in remaining.by_ref() {
            if stop.load(Ordering::SeqCst) {
                self.release(item);
                break;
            }
            let id = item.id.clone();
            if self.deliver(&id) {
                attempted += 1;
            }
            self.lock_state().in_flight.remove(&id);
        }
        for item in remaining {
            self.release(item);
        }
        if attempted > 0 {
            self.last_sync_ms.store(now_ms_lossy(), Ordering::Relaxed);
        }
        attempted
    }

    fn release(&self, item: SyncItem) {
        self.lock_state().in_flight.remove(&item.id);
        self.requeue(item);
    }

    /// Put an item back on the queue. A full queue leaves it to the retry thread's
    /// backfill, which is counted as overflow.
    fn requeue(&self, item: SyncItem) {
        let id = item.id.clone();
        if self.lock_state().queue.push(item) == Push::Full {
            self.counters.overflowed.fetch_add(1, Ordering::Relaxed);
            log::debug!("sync queue full; item {} left for backfill", id);
        }
    }

    /// Attempt one item. The store copy is authoritative: a queued copy of an item
    /// that has meanwhile completed or failed is skipped. Returns true if a send was
    /// attempted.
    fn deliver(&self, id: &str) -> bool {
        let mut item = match self.store.get(id) {
            Ok(Some(item)) if !item.status.is_terminal() => item,
            Ok(_) => return false,
            Err(err) => {
                log::warn!("sync item {} unreadable: {:#}", id, err);
                return false;
            }
        };

        item.attempts += 1;
        item.status = SyncStatus::InProgress;
        match self.store.update_state(id, ItemState::of(&item)) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(err) => {
                log::warn!("sync item {} could not be marked in progress: {:#}", id, err);
                return false;
            }
        }

        match self.send(&item) {
            Ok(()) => {
                item.status = SyncStatus::Completed;
                item.last_error = None;
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
                log::debug!("sync item {} delivered to {}", id, item.endpoint());
            }
            Err(err) => {
                item.last_error = Some(err.to_string());
                if item.attempts >= self.settings.max_retries {
                    item.status = SyncStatus::Failed;
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "sync item {} failed after {} attempt(s): {}",
                        id,
                        item.attempts,
                        err
                    );
                } else {
                    item.status = SyncStatus::Retry;
                    let delay = self.settings.retry_delay(item.attempts);
                    item.next_attempt_at_ms = now_ms_lossy() + delay.as_millis() as u64;
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "sync item {} attempt {} failed ({}); retrying in {:?}",
                        id,
                        item.attempts,
                        err,
                        delay
                    );
                }
            }
        }

        if let Err(err) = self.store.update_state(id, ItemState::of(&item)) {
            log::error!("sync item {} state not persisted: {:#}", id, err);
            return true;
        }
        if item.status == SyncStatus::Retry {
            self.requeue(item);
        }
        true
    }

    fn send(&self, item: &SyncItem) -> Result<(), CloudError> {
        let mut payload = item.payload.clone();
        if let Some(attachment) = &item.attachment {
            let filename = format!("{}.{}", item.id, extension(&attachment.content_type));
            match self.cloud.upload_image(&filename, attachment) {
                Ok(url) => {
                    if let Value::Object(map) = &mut payload {
                        map.insert("image_url".to_string(), Value::String(url));
                    }
                }
                Err(err) => log::warn!("image upload for sync item {} failed: {}", item.id, err),
            }
        }
        self.cloud.post_json(&item.endpoint(), &payload)
    }
}

fn extension(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/jpeg" | "image/jpg" => "jpg",
        _ => "bin",
    }
}
