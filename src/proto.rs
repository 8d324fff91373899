//! DDS message envelope.
//!
//! Every message on a DDS connection starts with one dispatch byte:
//!
//! ```text
//! 0x01  HANDSHAKE        single byte, echoed by the server
//! 0x02  TRANSACT         remainder is a transaction frame (see `txn`)
//! 0x03  REQ_SUBSCRIBE    seg([target_uuid, key])                        C→S
//! 0x04  SUBSCRIBED_UPD   seg([target_uuid, key, value])                 S→C
//! 0x05  SYSTEM_UPD       seg([seg([info, alive:1]), …])                 S→C
//! 0x06  EVENT_RET        seg([target, originator, event, status:1, v])  S→C
//! ```
//!
//! Decoding rejects unknown dispatch bytes and malformed segment payloads;
//! both are connection-fatal protocol errors for the receiver.

use anyhow::{anyhow, bail, Context, Result};
use uuid::Uuid;

use crate::magics::{
    MAGIC_EVENT_RET, MAGIC_HANDSHAKE_CLIENT, MAGIC_REQ_SUBSCRIBE, MAGIC_SUBSCRIBED_UPD,
    MAGIC_SYSTEM_UPD, MAGIC_TRANSACT,
};
use crate::seg;
use crate::subsystem::{decode_uuid, SubsystemInfo};

/// One decoded DDS message.
#[derive(Debug, Clone, PartialEq)]
pub enum DdsMessage {
    /// Hello byte; both directions use the same value.
    Handshake,
    /// A transaction frame, opaque at this layer.
    Transact(Vec<u8>),
    /// Client asks to follow `(target, key)` updates.
    ReqSubscribe {
        /// Target subsystem.
        target: Uuid,
        /// KV key bytes.
        key: Vec<u8>,
    },
    /// Broker pushes the latest published value to a subscriber.
    SubscribedUpd {
        /// Owning subsystem.
        target: Uuid,
        /// KV key bytes.
        key: Vec<u8>,
        /// Latest value bytes.
        value: Vec<u8>,
    },
    /// Full registry snapshot with per-subsystem alive flags.
    SystemUpd {
        /// `(info, alive)` per registered subsystem.
        entries: Vec<(SubsystemInfo, bool)>,
    },
    /// One per-target event result forwarded to the originator.
    EventRet {
        /// Subsystem that produced the return.
        target: Uuid,
        /// Subsystem that called the event.
        originator: Uuid,
        /// Event instance UUID.
        event: Uuid,
        /// `EVENT_*` status byte.
        status: u8,
        /// Return value or rejection reason bytes.
        value: Vec<u8>,
    },
}

impl DdsMessage {
    /// Encode into transport payload bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(match self {
            DdsMessage::Handshake => vec![MAGIC_HANDSHAKE_CLIENT],
            DdsMessage::Transact(frame) => {
                let mut out = Vec::with_capacity(1 + frame.len());
                out.push(MAGIC_TRANSACT);
                out.extend_from_slice(frame);
                out
            }
            DdsMessage::ReqSubscribe { target, key } => prefixed(
                MAGIC_REQ_SUBSCRIBE,
                seg::encode(&[target.as_bytes().as_slice(), key.as_slice()])?,
            ),
            DdsMessage::SubscribedUpd { target, key, value } => prefixed(
                MAGIC_SUBSCRIBED_UPD,
                seg::encode(&[target.as_bytes().as_slice(), key.as_slice(), value.as_slice()])?,
            ),
            DdsMessage::SystemUpd { entries } => {
                let mut encoded = Vec::with_capacity(entries.len());
                for (info, alive) in entries {
                    encoded.push(seg::encode(&[info.encode()?, vec![u8::from(*alive)]])?);
                }
                prefixed(MAGIC_SYSTEM_UPD, seg::encode(&encoded)?)
            }
            DdsMessage::EventRet { target, originator, event, status, value } => {
                let status = [*status];
                prefixed(
                    MAGIC_EVENT_RET,
                    seg::encode(&[
                        target.as_bytes().as_slice(),
                        originator.as_bytes().as_slice(),
                        event.as_bytes().as_slice(),
                        status.as_slice(),
                        value.as_slice(),
                    ])?,
                )
            }
        })
    }

    /// Decode a transport payload.
    ///
    /// # Errors
    ///
    /// Rejects empty messages, unknown dispatch bytes and malformed
    /// segmented payloads.
    pub fn decode(data: &[u8]) -> Result<DdsMessage> {
        let (magic, rest) = data
            .split_first()
            .ok_or_else(|| anyhow!("empty DDS message"))?;
        match *magic {
            MAGIC_HANDSHAKE_CLIENT if rest.is_empty() => Ok(DdsMessage::Handshake),
            MAGIC_HANDSHAKE_CLIENT => bail!("handshake byte with trailing data"),
            MAGIC_TRANSACT => Ok(DdsMessage::Transact(rest.to_vec())),
            MAGIC_REQ_SUBSCRIBE => {
                let [target, key] = seg::decode_exact::<2>(rest).context("REQ_SUBSCRIBE")?;
                Ok(DdsMessage::ReqSubscribe { target: decode_uuid(&target)?, key })
            }
            MAGIC_SUBSCRIBED_UPD => {
                let [target, key, value] =
                    seg::decode_exact::<3>(rest).context("SUBSCRIBED_UPD")?;
                Ok(DdsMessage::SubscribedUpd { target: decode_uuid(&target)?, key, value })
            }
            MAGIC_SYSTEM_UPD => {
                let mut entries = Vec::new();
                for entry in seg::decode(rest).context("SYSTEM_UPD")? {
                    let [info, alive] = seg::decode_exact::<2>(&entry)?;
                    let alive = match alive.as_slice() {
                        [0] => false,
                        [1] => true,
                        _ => bail!("SYSTEM_UPD alive flag must be a single 0/1 byte"),
                    };
                    entries.push((SubsystemInfo::decode(&info)?, alive));
                }
                Ok(DdsMessage::SystemUpd { entries })
            }
            MAGIC_EVENT_RET => {
                let [target, originator, event, status, value] =
                    seg::decode_exact::<5>(rest).context("EVENT_RET")?;
                let status = match status.as_slice() {
                    [s] => *s,
                    _ => bail!("EVENT_RET status must be a single byte"),
                };
                Ok(DdsMessage::EventRet {
                    target: decode_uuid(&target)?,
                    originator: decode_uuid(&originator)?,
                    event: decode_uuid(&event)?,
                    status,
                    value,
                })
            }
            other => bail!("unknown DDS dispatch byte: 0x{other:02x}"),
        }
    }
}

fn prefixed(magic: u8, payload: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + payload.len());
    out.push(magic);
    out.extend_from_slice(&payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::magics::EVENT_OK;

    #[test]
    fn handshake_is_a_single_byte() {
        let msg = DdsMessage::Handshake;
        let encoded = msg.encode().unwrap();
        assert_eq!(encoded, vec![MAGIC_HANDSHAKE_CLIENT]);
        assert_eq!(DdsMessage::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn transact_payload_is_opaque() {
        let msg = DdsMessage::Transact(vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(DdsMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn req_subscribe_round_trip() {
        let msg = DdsMessage::ReqSubscribe { target: Uuid::new_v4(), key: b"kv".to_vec() };
        assert_eq!(DdsMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn subscribed_upd_round_trip() {
        let msg = DdsMessage::SubscribedUpd {
            target: Uuid::new_v4(),
            key: b"pressure".to_vec(),
            value: b"\x00\x00\x00\x2a".to_vec(),
        };
        assert_eq!(DdsMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn system_upd_round_trip() {
        let msg = DdsMessage::SystemUpd {
            entries: vec![
                (SubsystemInfo::new(Uuid::new_v4(), "alpha", false), true),
                (SubsystemInfo::new(Uuid::new_v4(), "beta", true), false),
            ],
        };
        assert_eq!(DdsMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn empty_system_upd_is_legal() {
        let msg = DdsMessage::SystemUpd { entries: Vec::new() };
        assert_eq!(DdsMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn event_ret_round_trip() {
        let msg = DdsMessage::EventRet {
            target: Uuid::new_v4(),
            originator: Uuid::new_v4(),
            event: Uuid::new_v4(),
            status: EVENT_OK,
            value: b"result".to_vec(),
        };
        assert_eq!(DdsMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn empty_message_rejected() {
        assert!(DdsMessage::decode(&[]).is_err());
    }

    #[test]
    fn unknown_magic_rejected() {
        assert!(DdsMessage::decode(&[0x7f, 1, 2, 3]).is_err());
    }

    #[test]
    fn truncated_segments_rejected() {
        // REQ_SUBSCRIBE promising a 16-byte UUID but delivering 3 bytes.
        let bad = [MAGIC_REQ_SUBSCRIBE, 0x00, 0x10, 0xaa, 0xbb, 0xcc];
        assert!(DdsMessage::decode(&bad).is_err());
    }
}
