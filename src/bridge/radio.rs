//! LoRa-style binary link.
//!
//! Wire format, little-endian:
//!
//! ```text
//! [16-byte node id, ASCII, NUL-padded][u16 kind][u16 payload length][payload][u16 checksum]
//! ```
//!
//! The checksum is the unsigned sum of the payload bytes modulo 65536. Corrupt or
//! unknown packets are discarded and counted, and the decoder rescans byte by byte so
//! a damaged length field cannot swallow the packets behind it. Lost packets are
//! recovered by the next beacon, never retried here.

use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::registry::{NodeInfo, NodeRegistry, NodeTransport};
use super::{EventSink, NodeEvent};

pub const NODE_ID_LEN: usize = 16;
pub const HEADER_LEN: usize = NODE_ID_LEN + 4;
pub const CHECKSUM_LEN: usize = 2;
/// Largest payload a single radio frame can carry.
pub const MAX_PAYLOAD_LEN: usize = 235;

const READ_CHUNK: usize = 256;
const IDLE_SLEEP: Duration = Duration::from_millis(20);
const ERROR_BACKOFF: Duration = Duration::from_millis(500);
/// Beacon battery byte meaning "not reported".
const BATTERY_UNKNOWN: u8 = 0xFF;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u16)]
pub enum RadioPacketKind {
    Beacon = 1,
    Data = 2,
    Alert = 3,
    Ack = 4,
}

impl RadioPacketKind {
    pub fn from_wire(value: u16) -> Option<Self> {
        match value {
            1 => Some(Self::Beacon),
            2 => Some(Self::Data),
            3 => Some(Self::Alert),
            4 => Some(Self::Ack),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RadioPacket {
    pub node_id: String,
    pub kind: RadioPacketKind,
    pub payload: Vec<u8>,
}

pub fn checksum(payload: &[u8]) -> u16 {
    payload
        .iter()
        .fold(0u16, |acc, byte| acc.wrapping_add(*byte as u16))
}

/// Serialize a packet for the outbound direction.
pub fn encode_packet(packet: &RadioPacket) -> Result<Vec<u8>> {
    let id = packet.node_id.as_bytes();
    if id.is_empty() || id.len() > NODE_ID_LEN || !packet.node_id.is_ascii() {
        return Err(anyhow!(
            "radio node id '{}' must be 1..={} ASCII bytes",
            packet.node_id,
            NODE_ID_LEN
        ));
    }
    if packet.payload.len() > MAX_PAYLOAD_LEN {
        return Err(anyhow!(
            "radio payload of {} bytes exceeds {}",
            packet.payload.len(),
            MAX_PAYLOAD_LEN
        ));
    }
    let mut out = Vec::with_capacity(HEADER_LEN + packet.payload.len() + CHECKSUM_LEN);
    out.extend_from_slice(id);
    out.resize(NODE_ID_LEN, 0);
    out.extend_from_slice(&(packet.kind as u16).to_le_bytes());
    out.extend_from_slice(&(packet.payload.len() as u16).to_le_bytes());
    out.extend_from_slice(&packet.payload);
    out.extend_from_slice(&checksum(&packet.payload).to_le_bytes());
    Ok(out)
}

/// Battery and firmware carried by a beacon: `[battery %, 0xFF = unknown][firmware ASCII]`.
pub fn decode_beacon(payload: &[u8]) -> NodeInfo {
    let battery_level = payload
        .first()
        .filter(|b| **b != BATTERY_UNKNOWN)
        .map(|b| (*b).min(100) as f32);
    let firmware_version = payload
        .get(1..)
        .map(|rest| String::from_utf8_lossy(rest).trim_end_matches('\0').trim().to_string())
        .filter(|s| !s.is_empty());
    NodeInfo {
        battery_level,
        firmware_version,
        ..NodeInfo::default()
    }
}

/// Data and alert payloads are JSON when they parse as JSON, otherwise hex.
pub fn payload_to_json(payload: &[u8]) -> Value {
    match serde_json::from_slice::<Value>(payload) {
        Ok(value) => value,
        Err(_) => json!({ "raw": hex::encode(payload) }),
    }
}

#[derive(Default)]
pub(crate) struct RadioCounters {
    pub bytes_read: AtomicU64,
    pub packets: AtomicU64,
    pub checksum_errors: AtomicU64,
    pub unknown_kind: AtomicU64,
    pub oversize: AtomicU64,
    pub bad_node_id: AtomicU64,
    pub resync_bytes: AtomicU64,
    pub read_errors: AtomicU64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RadioStats {
    pub bytes_read: u64,
    pub packets: u64,
    pub checksum_errors: u64,
    pub unknown_kind: u64,
    pub oversize: u64,
    pub bad_node_id: u64,
    /// Bytes discarded while looking for a frame boundary.
    pub resync_bytes: u64,
    pub read_errors: u64,
}

impl RadioCounters {
    pub fn snapshot(&self) -> RadioStats {
        RadioStats {
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            packets: self.packets.load(Ordering::Relaxed),
            checksum_errors: self.checksum_errors.load(Ordering::Relaxed),
            unknown_kind: self.unknown_kind.load(Ordering::Relaxed),
            oversize: self.oversize.load(Ordering::Relaxed),
            bad_node_id: self.bad_node_id.load(Ordering::Relaxed),
            resync_bytes: self.resync_bytes.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}

/// Why a candidate frame at the head of the buffer was rejected.
#[derive(Clone, Copy, Debug)]
enum Reject {
    Oversize,
    UnknownKind,
    BadNodeId,
    Checksum,
}

/// Incremental frame decoder over a byte stream.
///
/// A rejected frame never consumes more than one byte: its length field is part of
/// what may be corrupt, so the decoder slides forward and rescans instead of
/// trusting it.
pub struct RadioDecoder {
    buffer: Vec<u8>,
    counters: Arc<RadioCounters>,
    /// False while sliding over garbage after a rejected frame.
    in_sync: bool,
}

impl RadioDecoder {
    pub(crate) fn new(counters: Arc<RadioCounters>) -> Self {
        Self {
            buffer: Vec::with_capacity(READ_CHUNK * 2),
            counters,
            in_sync: true,
        }
    }

    pub fn stats(&self) -> RadioStats {
        self.counters.snapshot()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.counters
            .bytes_read
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.buffer.extend_from_slice(bytes);
    }

    /// Next valid packet in the buffer, or `None` when more bytes are needed.
    pub fn next_packet(&mut self) -> Option<RadioPacket> {
        loop {
            if self.buffer.len() < HEADER_LEN {
                return None;
            }
            let len = u16::from_le_bytes([self.buffer[18], self.buffer[19]]) as usize;
            if len > MAX_PAYLOAD_LEN {
                self.resync(Reject::Oversize);
                continue;
            }
            let raw_kind = u16::from_le_bytes([self.buffer[16], self.buffer[17]]);
            let Some(kind) = RadioPacketKind::from_wire(raw_kind) else {
                self.resync(Reject::UnknownKind);
                continue;
            };
            let Some(node_id) = decode_node_id(&self.buffer[..NODE_ID_LEN]) else {
                self.resync(Reject::BadNodeId);
                continue;
            };
            let frame_len = HEADER_LEN + len + CHECKSUM_LEN;
            if self.buffer.len() < frame_len {
                return None;
            }

            let payload = &self.buffer[HEADER_LEN..HEADER_LEN + len];
            let expected =
                u16::from_le_bytes([self.buffer[frame_len - 2], self.buffer[frame_len - 1]]);
            if checksum(payload) != expected {
                self.resync(Reject::Checksum);
                continue;
            }
            let payload = payload.to_vec();
            self.buffer.drain(..frame_len);
            self.in_sync = true;
            self.counters.packets.fetch_add(1, Ordering::Relaxed);
            return Some(RadioPacket {
                node_id,
                kind,
                payload,
            });
        }
    }

    /// Drop one byte and look for the next frame boundary. Only the first rejection
    /// after a good frame is counted; the bytes slid over while hunting are counted
    /// separately.
    fn resync(&mut self, reason: Reject) {
        if self.in_sync {
            self.in_sync = false;
            let counter = match reason {
                Reject::Oversize => &self.counters.oversize,
                Reject::UnknownKind => &self.counters.unknown_kind,
                Reject::BadNodeId => &self.counters.bad_node_id,
                Reject::Checksum => &self.counters.checksum_errors,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            log::debug!("radio frame rejected ({:?}); resyncing", reason);
        }
        self.counters.resync_bytes.fetch_add(1, Ordering::Relaxed);
        self.buffer.drain(..1);
    }
}

fn decode_node_id(raw: &[u8]) -> Option<String> {
    let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    let id = &raw[..end];
    if id.is_empty() || !id.iter().all(|b| b.is_ascii_graphic()) {
        return None;
    }
    Some(String::from_utf8_lossy(id).into_owned())
}

/// Apply one decoded packet to the registry and event stream.
pub(crate) fn dispatch(packet: RadioPacket, registry: &NodeRegistry, events: &EventSink) {
    match packet.kind {
        RadioPacketKind::Beacon => {
            registry.register(&packet.node_id, decode_beacon(&packet.payload), NodeTransport::Radio);
        }
        RadioPacketKind::Data => {
            registry.touch(&packet.node_id, NodeTransport::Radio);
            let event = NodeEvent::Data {
                node_id: packet.node_id,
                transport: NodeTransport::Radio,
                payload: payload_to_json(&packet.payload),
            };
            if let Err(err) = events.emit(event) {
                log::warn!("radio data dropped: {}", err);
            }
        }
        RadioPacketKind::Alert => {
            registry.touch(&packet.node_id, NodeTransport::Radio);
            log::info!("radio alert from node '{}'", packet.node_id);
            let event = NodeEvent::Alert {
                node_id: packet.node_id,
                payload: payload_to_json(&packet.payload),
            };
            if let Err(err) = events.emit(event) {
                log::warn!("radio alert dropped: {}", err);
            }
        }
        RadioPacketKind::Ack => {
            registry.touch(&packet.node_id, NodeTransport::Radio);
            log::debug!("radio ack from node '{}'", packet.node_id);
        }
    }
}

/// Reader loop. Runs until `stop` is set or the link reports end of stream forever.
pub(crate) fn read_loop(
    mut link: Box<dyn Read + Send>,
    registry: NodeRegistry,
    events: EventSink,
    counters: Arc<RadioCounters>,
    stop: Arc<AtomicBool>,
) {
    let mut decoder = RadioDecoder::new(counters.clone());
    let mut chunk = [0u8; READ_CHUNK];
    while !stop.load(Ordering::SeqCst) {
        match link.read(&mut chunk) {
            Ok(0) => std::thread::sleep(IDLE_SLEEP),
            Ok(n) => {
                decoder.feed(&chunk[..n]);
                while let Some(packet) = decoder.next_packet() {
                    dispatch(packet, &registry, &events);
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                ) =>
            {
                std::thread::sleep(IDLE_SLEEP);
            }
            Err(err) => {
                counters.read_errors.fetch_add(1, Ordering::Relaxed);
                log::warn!("radio link read failed: {}", err);
                std::thread::sleep(ERROR_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(node: &str, kind: RadioPacketKind, payload: &[u8]) -> RadioPacket {
        RadioPacket {
            node_id: node.to_string(),
            kind,
            payload: payload.to_vec(),
        }
    }

    fn decoder() -> RadioDecoder {
        RadioDecoder::new(Arc::new(RadioCounters::default()))
    }

    #[test]
    fn encodes_header_little_endian() {
        let bytes = encode_packet(&packet("n1", RadioPacketKind::Data, &[1, 2, 3])).unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + 3 + CHECKSUM_LEN);
        assert_eq!(&bytes[..2], b"n1");
        assert!(bytes[2..16].iter().all(|b| *b == 0));
        assert_eq!(&bytes[16..18], &[2, 0]);
        assert_eq!(&bytes[18..20], &[3, 0]);
        assert_eq!(&bytes[23..], &[6, 0]);
    }

    #[test]
    fn checksum_wraps_at_u16() {
        let payload = vec![0xFF; 300];
        assert_eq!(checksum(&payload), ((0xFF * 300) % 65536) as u16);
    }

    #[test]
    fn rejects_long_node_id() {
        let long = "x".repeat(NODE_ID_LEN + 1);
        assert!(encode_packet(&packet(&long, RadioPacketKind::Beacon, &[])).is_err());
    }

    #[test]
    fn decodes_split_reads() {
        let bytes = encode_packet(&packet("gate-01", RadioPacketKind::Beacon, &[77, b'2'])).unwrap();
        let mut dec = decoder();
        dec.feed(&bytes[..10]);
        assert!(dec.next_packet().is_none());
        dec.feed(&bytes[10..]);
        let got = dec.next_packet().unwrap();
        assert_eq!(got.node_id, "gate-01");
        assert_eq!(got.kind, RadioPacketKind::Beacon);
        assert_eq!(dec.stats().packets, 1);
    }

    #[test]
    fn corrupt_checksum_is_counted_and_skipped() {
        let mut bad = encode_packet(&packet("n1", RadioPacketKind::Data, b"{\"t\":1}")).unwrap();
        let last = bad.len() - 1;
        bad[last] ^= 0x5A;
        let good = encode_packet(&packet("n2", RadioPacketKind::Data, b"{\"t\":2}")).unwrap();

        let mut dec = decoder();
        dec.feed(&bad);
        dec.feed(&good);
        let got = dec.next_packet().unwrap();
        assert_eq!(got.node_id, "n2");
        assert!(dec.next_packet().is_none());
        assert_eq!(dec.stats().checksum_errors, 1);
    }

    #[test]
    fn unknown_kind_is_counted() {
        let mut bytes = encode_packet(&packet("n1", RadioPacketKind::Ack, &[])).unwrap();
        bytes[16] = 99;
        let mut dec = decoder();
        dec.feed(&bytes);
        assert!(dec.next_packet().is_none());
        assert_eq!(dec.stats().unknown_kind, 1);
    }

    #[test]
    fn stray_byte_resyncs_on_next_frame() {
        // One stray byte shifts the header so the length field reads 0x0100.
        let good = encode_packet(&packet("n3", RadioPacketKind::Ack, &[9])).unwrap();
        let mut dec = decoder();
        dec.feed(&[0xAA]);
        dec.feed(&good);
        let got = dec.next_packet().unwrap();
        assert_eq!(got.node_id, "n3");
        assert_eq!(got.payload, vec![9]);
        assert_eq!(dec.stats().oversize, 1);
    }

    #[test]
    fn corrupt_length_does_not_swallow_following_packets() {
        let mut bad = encode_packet(&packet("n1", RadioPacketKind::Data, b"xyz")).unwrap();
        bad[18] = 11;
        let mut dec = decoder();
        dec.feed(&bad);
        dec.feed(&encode_packet(&packet("n2", RadioPacketKind::Data, b"{\"t\":2}")).unwrap());
        dec.feed(&encode_packet(&packet("n3", RadioPacketKind::Ack, &[])).unwrap());

        let first = dec.next_packet().unwrap();
        assert_eq!(first.node_id, "n2");
        assert_eq!(first.payload, b"{\"t\":2}".to_vec());
        assert_eq!(dec.next_packet().unwrap().node_id, "n3");
        assert!(dec.next_packet().is_none());

        let stats = dec.stats();
        assert_eq!(stats.packets, 2);
        assert_eq!(stats.checksum_errors, 1);
        assert_eq!(stats.oversize, 0);
        assert_eq!(stats.resync_bytes, bad.len() as u64);
    }

    #[test]
    fn beacon_carries_battery_and_firmware() {
        let info = decode_beacon(&[64, b'v', b'1', b'.', b'2', 0, 0]);
        assert_eq!(info.battery_level, Some(64.0));
        assert_eq!(info.firmware_version.as_deref(), Some("v1.2"));

        let info = decode_beacon(&[BATTERY_UNKNOWN]);
        assert!(info.battery_level.is_none());
        assert!(info.firmware_version.is_none());
    }

    #[test]
    fn non_json_payload_becomes_hex() {
        assert_eq!(payload_to_json(&[0xde, 0xad]), json!({ "raw": "dead" }));
        assert_eq!(payload_to_json(b"{\"temp\":4}"), json!({ "temp": 4 }));
    }
}
