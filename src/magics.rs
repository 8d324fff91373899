//! Wire-constant vocabulary for the DDS protocol.
//!
//! Every magic byte, transaction opcode, state byte and reason string used
//! on the wire lives here so the broker, the client runtime and the tests
//! all agree on a single source of truth.
//!
//! Message layout on a DDS connection:
//!
//! ```text
//! [magic:1] [payload…]
//! ```
//!
//! where `TRANSACT` payloads are transaction frames
//! (`[opcode:1][txn_uuid:16][payload…]`, see `txn`), and the remaining
//! magics carry segmented byte arrays (see `seg`).

use std::time::Duration;

// ============================================================================
// Connection-level dispatch bytes
// ============================================================================

/// Client hello; the server echoes the same byte back.
pub const MAGIC_HANDSHAKE_CLIENT: u8 = 0x01;
/// Server hello (alias of the echoed client byte).
pub const MAGIC_HANDSHAKE_SERVER: u8 = MAGIC_HANDSHAKE_CLIENT;
/// The rest of the message is a transaction frame.
pub const MAGIC_TRANSACT: u8 = 0x02;
/// `seg([target_uuid, key])` — client asks to follow a published KV.
pub const MAGIC_REQ_SUBSCRIBE: u8 = 0x03;
/// `seg([target_uuid, key, value])` — broker pushes a subscribed update.
pub const MAGIC_SUBSCRIBED_UPD: u8 = 0x04;
/// `seg([seg([info, alive:1]), …])` — full registry snapshot broadcast.
pub const MAGIC_SYSTEM_UPD: u8 = 0x05;
/// `seg([target, originator, event_uuid, status:1, value])` — event return.
pub const MAGIC_EVENT_RET: u8 = 0x06;

// ============================================================================
// Transaction frame opcodes
// ============================================================================

/// Open a transaction with a fresh UUID.
pub const TXN_NEW: u8 = 0x10;
/// Peer accepted the transaction; work in progress.
pub const TXN_ACK: u8 = 0x11;
/// Terminal result payload.
pub const TXN_RET: u8 = 0x12;
/// Terminal rejection (optional UTF-8 reason payload).
pub const TXN_NAK: u8 = 0x13;
/// Non-terminal progress payload between ACK and RET.
pub const TXN_FEEDBACK: u8 = 0x14;

// ============================================================================
// Transaction opcodes (first payload byte of a NEW frame)
// ============================================================================

/// S→C: ask the client for its 16-byte UUID.
pub const TRANSACT_REQ_UUID: u8 = 0x20;
/// S→C: connection configured; client echoes its UUID when processed.
pub const TRANSACT_CONN_READY: u8 = 0x21;
/// C→S: register a subsystem (`SubsystemInfo` payload).
pub const TRANSACT_REG_SUBSYSTEM: u8 = 0x22;
/// C→S: `seg([target, origin, key, value])`.
pub const TRANSACT_SET_KV: u8 = 0x23;
/// C→S: `seg([target, origin, key])`.
pub const TRANSACT_GET_KV: u8 = 0x24;
/// C→S: `seg([target, origin, key])`.
pub const TRANSACT_GET_KV_DESC: u8 = 0x25;
/// C→S: `seg([name])`.
pub const TRANSACT_RESOLVE: u8 = 0x26;
/// C→S: `seg([target])`.
pub const TRANSACT_GET_SUBSYSTEM: u8 = 0x27;
/// C→S: `seg([seg([t_uuid, …]), origin, name, param])`.
pub const TRANSACT_CALL_EVENT: u8 = 0x28;
/// S→C forward of `SET_KV` to the owning client.
pub const TRANSACT_RSET_KV: u8 = 0x29;
/// S→C forward of `GET_KV` to the owning client.
pub const TRANSACT_RGET_KV: u8 = 0x2A;
/// S→C forward of `GET_KV_DESC` to the owning client.
pub const TRANSACT_RGET_KV_DESC: u8 = 0x2B;
/// S→C: `seg([target, origin, event_uuid, name, param])`.
pub const TRANSACT_RCALL_EVENT: u8 = 0x2C;

// ============================================================================
// Result state bytes
// ============================================================================

/// Remote operation succeeded; the rest of the payload is the value.
pub const TRANSOP_STATE_OK: u8 = 0x00;
/// Remote operation rejected; the rest of the payload is a UTF-8 reason.
pub const TRANSOP_STATE_REJ: u8 = 0x01;

/// Event target not yet contacted.
pub const EVENT_PENDING: u8 = 0x00;
/// Event target accepted the call and has not returned yet.
pub const EVENT_IN_PROGRESS: u8 = 0x01;
/// Event target returned a value.
pub const EVENT_OK: u8 = 0x02;
/// Event target rejected the call.
pub const EVENT_REJ: u8 = 0x03;

// ============================================================================
// Type-specifier tags
// ============================================================================

/// No declared type.
pub const TYPE_UNSPEC: u8 = 0x00;
/// Raw byte string.
pub const TYPE_BYTES: u8 = 0x01;
/// 32-bit signed big-endian integer, optional inclusive range.
pub const TYPE_INT: u8 = 0x02;

// ============================================================================
// Well-known reason strings
// ============================================================================

/// Soft rejection recognized by orchestrators: the target subsystem exists
/// but does not implement the named event.
pub const E_DOES_NOT_HANDLE_EVENT: &str = "Subsystem does not handle specified event.";
/// Soft rejection recognized by orchestrators: the target subsystem is
/// registered but its owning client is not connected.
pub const E_SUBSYSTEM_DISCONNECTED: &str = "Subsystem client is disconnected";

// ============================================================================
// Defaults
// ============================================================================

/// Default broker TCP port.
pub const SERVER_PORT: u16 = 11751;
/// Environment variable overriding the broker port.
pub const ENV_DDS_PORT: &str = "IPI_ECS_DDS_PORT";
/// Default deadline applied by client-side `wait` helpers on remote
/// operations. Feedback from the peer resets the idle clock, not this cap.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(30);
