use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::{json, Value};
use tempfile::TempDir;

use wildlife_gateway::sync::{Attachment, CloudTransport, SyncService, SyncSettings, SyncStatus};
use wildlife_gateway::CloudError;

/// Cloud that fails its first `down_for` health checks.
struct FlakyCloud {
    down_for: u32,
    health_checks: AtomicU32,
    posts: Mutex<Vec<(String, Value)>>,
}

impl FlakyCloud {
    fn new(down_for: u32) -> Arc<Self> {
        Arc::new(Self {
            down_for,
            health_checks: AtomicU32::new(0),
            posts: Mutex::new(Vec::new()),
        })
    }

    fn posted(&self) -> Vec<(String, Value)> {
        self.posts.lock().unwrap().clone()
    }

    fn count_by_seq(&self) -> HashMap<i64, usize> {
        let mut counts = HashMap::new();
        for (_, body) in self.posted() {
            *counts.entry(body["seq"].as_i64().unwrap()).or_default() += 1;
        }
        counts
    }
}

impl CloudTransport for FlakyCloud {
    fn health(&self) -> Result<(), CloudError> {
        let check = self.health_checks.fetch_add(1, Ordering::SeqCst);
        if check < self.down_for {
            return Err(CloudError::Unreachable("link down".into()));
        }
        Ok(())
    }

    fn post_json(&self, path: &str, body: &Value) -> Result<(), CloudError> {
        self.posts
            .lock()
            .unwrap()
            .push((path.to_string(), body.clone()));
        Ok(())
    }

    fn upload_image(&self, filename: &str, _: &Attachment) -> Result<String, CloudError> {
        Ok(format!("https://cdn.example/{}", filename))
    }
}

fn fast_settings() -> SyncSettings {
    SyncSettings {
        sync_interval: Duration::from_millis(30),
        retry_interval: Duration::from_millis(50),
        retry_base_delay: Duration::ZERO,
        batch_size: 4,
        ..SyncSettings::default()
    }
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    done()
}

#[test]
fn outage_then_recovery_delivers_everything_once() -> Result<()> {
    let dir = TempDir::new()?;
    let cloud = FlakyCloud::new(3);
    let service = SyncService::open(dir.path().join("sync.db"), cloud.clone(), fast_settings())?;
    service.start()?;

    for seq in 0..10 {
        service.add_detection("cam-a", json!({"seq": seq}), None)?;
    }
    for seq in 10..15 {
        service.add_esp32_data("node-1", json!({"seq": seq}), None)?;
    }

    assert!(wait_until(Duration::from_secs(10), || cloud.posted().len() >= 15));
    // Give a stray duplicate time to show up.
    std::thread::sleep(Duration::from_millis(200));
    service.stop();

    assert!(cloud.health_checks.load(Ordering::SeqCst) > 3);
    let counts = cloud.count_by_seq();
    assert_eq!(counts.len(), 15);
    assert!(counts.values().all(|&n| n == 1), "duplicates: {:?}", counts);

    let store = service.store().counts()?;
    assert_eq!(store.completed, 15);
    assert_eq!(store.pending + store.retry + store.in_progress + store.failed, 0);
    Ok(())
}

#[test]
fn undelivered_items_survive_a_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let db = dir.path().join("sync.db");

    let ids = {
        let offline = FlakyCloud::new(u32::MAX);
        let service = SyncService::open(&db, offline.clone(), fast_settings())?;
        service.start()?;
        let mut ids = Vec::new();
        for seq in 0..5 {
            ids.push(service.add_telemetry("gw", json!({"seq": seq}))?);
        }
        std::thread::sleep(Duration::from_millis(100));
        service.stop();
        assert!(offline.posted().is_empty());
        ids
    };

    let cloud = FlakyCloud::new(0);
    let service = SyncService::open(&db, cloud.clone(), fast_settings())?;
    assert_eq!(service.reload()?, 5);
    assert_eq!(service.reload()?, 0);
    service.start()?;

    assert!(wait_until(Duration::from_secs(10), || cloud.posted().len() >= 5));
    std::thread::sleep(Duration::from_millis(200));
    service.stop();

    assert_eq!(cloud.posted().len(), 5);
    for id in ids {
        let item = service.store().get(&id)?.unwrap();
        assert_eq!(item.status, SyncStatus::Completed);
        assert_eq!(item.attempts, 1);
    }
    Ok(())
}

#[test]
fn overflow_beyond_queue_capacity_is_not_lost() -> Result<()> {
    let cloud = FlakyCloud::new(2);
    let settings = SyncSettings {
        queue_capacity: 3,
        ..fast_settings()
    };
    let dir = TempDir::new()?;
    let service = SyncService::open(dir.path().join("sync.db"), cloud.clone(), settings)?;
    service.start()?;
    for seq in 0..12 {
        service.add_telemetry("gw", json!({"seq": seq}))?;
    }
    assert!(service.stats().overflowed > 0);

    assert!(wait_until(Duration::from_secs(10), || cloud.posted().len() >= 12));
    service.stop();

    let counts = cloud.count_by_seq();
    assert_eq!(counts.len(), 12);
    assert!(counts.values().all(|&n| n == 1));
    Ok(())
}
