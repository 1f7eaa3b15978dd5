//! Wildlife Edge Gateway
//!
//! This crate implements the concurrency and protocol-bridging engine of an edge
//! gateway that sits between field camera/sensor nodes and a cloud backend.
//!
//! # Architecture
//!
//! Five components, composed by [`Gateway`]:
//!
//! 1. **Detector** (`detect`): stateless-per-call inference wrapper with NMS post-processing.
//! 2. **CameraStream** (`ingest`): one capture source, reconnect state machine,
//!    backpressure-by-drop into a bounded queue.
//! 3. **StreamCoordinator** (`coordinator`): per-camera consumer threads feeding the detector.
//! 4. **ProtocolBridge** (`bridge`): HTTP, WebSocket and LoRa radio transports sharing one
//!    node registry.
//! 5. **SyncService** (`sync`): durable, retrying delivery of items to the cloud.
//!
//! Failure domains are isolated: a stuck camera, an offline node or an unreachable cloud
//! never halts the other components.

use anyhow::Result;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod detect;
pub mod error;
pub mod frame;
pub mod gateway;
pub mod ingest;
pub mod sync;

pub use bridge::{
    Esp32Node, NodeEvent, NodeRegistry, NodeStatus, ProtocolBridge, RadioPacket,
    RadioPacketKind,
};
pub use config::GatewayConfig;
pub use coordinator::{CoordinatorSettings, StreamCoordinator};
pub use detect::{BoundingBox, Detection, DetectionResult, Detector, DetectorSettings};
pub use error::{BridgeError, CloudError};
pub use frame::{CameraConfig, CapturedFrame, TransportKind};
pub use gateway::{Gateway, GatewayParts, GatewayStats, GatewayStatus};
pub use ingest::{CameraState, CameraStats, CameraStream, StreamSettings};
pub use sync::{SyncItem, SyncItemType, SyncService, SyncSettings, SyncStatus};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> Result<u64> {
    Ok(SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as u64)
}

/// Wall-clock milliseconds, falling back to zero if the clock is before the epoch.
///
/// Used on hot paths (frame capture, node liveness) where a clock error must not
/// abort the loop.
pub(crate) fn now_ms_lossy() -> u64 {
    now_ms().unwrap_or(0)
}

/// Sleep in short slices until `total` has elapsed or `stop` returns true.
///
/// Returns true when interrupted by `stop`.
pub(crate) fn sleep_interruptible(
    total: std::time::Duration,
    stop: impl Fn() -> bool,
) -> bool {
    const SLICE: std::time::Duration = std::time::Duration::from_millis(20);
    let deadline = std::time::Instant::now() + total;
    loop {
        if stop() {
            return true;
        }
        let now = std::time::Instant::now();
        if now >= deadline {
            return false;
        }
        std::thread::sleep(SLICE.min(deadline - now));
    }
}

/// Join a worker thread, waiting at most `timeout` for its exit signal.
///
/// Worker threads send on `done` as their final act. A thread that does not signal
/// in time is abandoned: its handle is dropped and shutdown continues.
pub(crate) fn join_with_timeout(
    name: &str,
    handle: std::thread::JoinHandle<()>,
    done: &std::sync::mpsc::Receiver<()>,
    timeout: std::time::Duration,
) -> bool {
    match done.recv_timeout(timeout) {
        Ok(()) | Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
            if handle.join().is_err() {
                log::error!("{} thread panicked", name);
            }
            true
        }
        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
            log::warn!(
                "{} thread did not stop within {:?}; abandoning it",
                name,
                timeout
            );
            false
        }
    }
}
