//! Structured log client for the ECS logging server.
//!
//! Records are JSON (schema v1) framed as:
//!
//! ```text
//! b"IECS" [type:1 = 0x01] [version:1 = 0x01] [utf8 json]
//! ```
//!
//! one record per transport message. The client is fire-and-forget: a
//! missing or dead logging server never affects the caller, the record is
//! simply dropped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

/// Frame magic.
pub const LOG_MAGIC: &[u8; 4] = b"IECS";
/// Frame type: one log record.
pub const LOG_TYPE_LOG: u8 = 0x01;
/// Protocol version.
pub const LOG_PROTO_V1: u8 = 0x01;
/// Magic + type + version.
pub const LOG_HEADER_LEN: usize = 6;

/// Encode one schema-v1 record into a framed message.
pub fn encode_log_record(record: &Value) -> Vec<u8> {
    let payload = record.to_string();
    let mut out = Vec::with_capacity(LOG_HEADER_LEN + payload.len());
    out.extend_from_slice(LOG_MAGIC);
    out.push(LOG_TYPE_LOG);
    out.push(LOG_PROTO_V1);
    out.extend_from_slice(payload.as_bytes());
    out
}

/// Split a framed message into `(type, version, payload)`.
///
/// # Errors
///
/// Rejects short messages and bad magic.
pub fn decode_log_message(msg: &[u8]) -> Result<(u8, u8, &[u8])> {
    if msg.len() < LOG_HEADER_LEN {
        bail!("log message too short: {} bytes", msg.len());
    }
    if &msg[..4] != LOG_MAGIC {
        bail!("bad log magic");
    }
    Ok((msg[4], msg[5], &msg[LOG_HEADER_LEN..]))
}

/// Emits schema-v1 records through any message sink.
///
/// The sink is a transport outgoing queue; each `log` call enqueues exactly
/// one framed record.
#[derive(Debug)]
pub struct LogClient {
    sink: UnboundedSender<Vec<u8>>,
    origin: Uuid,
    seq: AtomicU64,
}

impl LogClient {
    /// New client stamping records with `origin`.
    pub fn new(sink: UnboundedSender<Vec<u8>>, origin: Uuid) -> Self {
        Self { sink, origin, seq: AtomicU64::new(0) }
    }

    /// Origin UUID stamped on every record.
    pub fn origin(&self) -> Uuid {
        self.origin
    }

    /// Send one record with extra `data` fields.
    ///
    /// `l_type` distinguishes software records (`"SW"`) from experiment
    /// records; `data` carries event-specific fields for replay.
    pub fn log_with_data(&self, level: &str, msg: &str, l_type: &str, data: Value) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let ts_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        // Schema v1. Field names are load-bearing for the journal indexer.
        let record = json!({
            "v": 1,
            "origin": { "uuid": self.origin.to_string(), "ts_ns": ts_ns as u64 },
            "seq": seq,
            "level": level,
            "msg": msg,
            "l_type": l_type,
            "data": data,
        });
        let _ = self.sink.send(encode_log_record(&record));
    }

    /// Send one plain software record.
    pub fn log(&self, level: &str, msg: &str) {
        self.log_with_data(level, msg, "SW", json!({}));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn frame_round_trip() {
        let record = json!({"v": 1, "msg": "hello"});
        let framed = encode_log_record(&record);
        let (ty, ver, payload) = decode_log_message(&framed).unwrap();
        assert_eq!(ty, LOG_TYPE_LOG);
        assert_eq!(ver, LOG_PROTO_V1);
        let parsed: Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn bad_magic_rejected() {
        assert!(decode_log_message(b"XXXX\x01\x01{}").is_err());
        assert!(decode_log_message(b"IEC").is_err());
    }

    #[test]
    fn records_carry_schema_v1_fields_and_increment_seq() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let origin = Uuid::new_v4();
        let client = LogClient::new(tx, origin);

        client.log("INFO", "first");
        client.log_with_data("WARN", "second", "EXP", json!({"event": "CONN"}));

        let first = rx.try_recv().unwrap();
        let (_, _, payload) = decode_log_message(&first).unwrap();
        let record: Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(record["v"], 1);
        assert_eq!(record["seq"], 1);
        assert_eq!(record["level"], "INFO");
        assert_eq!(record["l_type"], "SW");
        assert_eq!(record["origin"]["uuid"], origin.to_string());

        let second = rx.try_recv().unwrap();
        let (_, _, payload) = decode_log_message(&second).unwrap();
        let record: Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(record["seq"], 2);
        assert_eq!(record["data"]["event"], "CONN");
    }

    #[test]
    fn dead_sink_is_not_an_error() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let client = LogClient::new(tx, Uuid::new_v4());
        client.log("INFO", "dropped on the floor");
    }
}
