//! Two-peer transaction layer.
//!
//! Provides correlated request/response on top of a message-preserving
//! transport. One transaction message is:
//!
//! ```text
//! [opcode:1] [txn_uuid:16] [payload…]
//! ```
//!
//! with opcodes `NEW`, `ACK`, `RET`, `NAK` and `FEEDBACK` (non-terminal
//! progress between ACK and RET). Outgoing transactions move
//! `Sent → Acked → Returned | Failed`; `RET` is accepted from either
//! non-terminal state and duplicates after a terminal are ignored.
//!
//! The manager emits encoded frames through a synchronous sink supplied by
//! the owning connection, which wraps them in its dispatch byte and queues
//! them on the transport — synchronously, so transaction replies keep their
//! order relative to other messages queued on the same connection.
//! Transactions are independent: there is no ordering across distinct UUIDs
//! and no built-in wall-clock timeout — callers watch `last_update_at` and
//! impose their own deadlines.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{bail, Result};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::magics::{TXN_ACK, TXN_FEEDBACK, TXN_NAK, TXN_NEW, TXN_RET};

/// Synchronous sink for encoded transaction frames.
pub type WireSink = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Observable state of an outgoing transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    /// `NEW` emitted, no peer reply yet.
    Sent,
    /// Peer acknowledged; work in progress.
    Acked,
    /// Terminal: peer returned a result payload.
    Returned,
    /// Terminal: peer rejected, or the connection was lost.
    Failed,
}

impl TxnState {
    /// True for `Returned` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Returned | TxnState::Failed)
    }
}

#[derive(Debug)]
struct OutgoingInner {
    state: TxnState,
    result: Option<Vec<u8>>,
    reason: Option<String>,
    initiated_at: Instant,
    last_update_at: Instant,
}

/// Originator-side handle on one transaction.
///
/// Cloneable; all clones observe the same state. Completion is a future
/// ([`OutgoingTransaction::wait`]), not a callback chain.
#[derive(Debug, Clone)]
pub struct OutgoingTransaction {
    uuid: Uuid,
    inner: Arc<Mutex<OutgoingInner>>,
    changed: Arc<Notify>,
}

impl OutgoingTransaction {
    fn new(uuid: Uuid) -> Self {
        let now = Instant::now();
        Self {
            uuid,
            inner: Arc::new(Mutex::new(OutgoingInner {
                state: TxnState::Sent,
                result: None,
                reason: None,
                initiated_at: now,
                last_update_at: now,
            })),
            changed: Arc::new(Notify::new()),
        }
    }

    /// Correlation UUID of this transaction.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Current state.
    pub fn state(&self) -> TxnState {
        self.lock().state
    }

    /// `RET` payload, once terminal.
    pub fn result(&self) -> Option<Vec<u8>> {
        self.lock().result.clone()
    }

    /// Failure reason, once failed.
    pub fn reason(&self) -> Option<String> {
        self.lock().reason.clone()
    }

    /// When the transaction was sent.
    pub fn initiated_at(&self) -> Instant {
        self.lock().initiated_at
    }

    /// Last peer activity (ACK, FEEDBACK or terminal). Age beyond a
    /// caller-chosen threshold is the timeout signal.
    pub fn last_update_at(&self) -> Instant {
        self.lock().last_update_at
    }

    /// Resolve once the transaction reaches a terminal state.
    pub async fn wait(&self) -> TxnState {
        loop {
            let notified = self.changed.notified();
            {
                let inner = self.lock();
                if inner.state.is_terminal() {
                    return inner.state;
                }
            }
            notified.await;
        }
    }

    /// Resolve once the state differs from `seen` (terminal states always
    /// qualify). Used to observe the ACK edge before awaiting the result.
    pub async fn wait_past(&self, seen: TxnState) -> TxnState {
        loop {
            let notified = self.changed.notified();
            {
                let inner = self.lock();
                if inner.state != seen || inner.state.is_terminal() {
                    return inner.state;
                }
            }
            notified.await;
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, OutgoingInner> {
        self.inner.lock().expect("transaction state poisoned")
    }
}

/// Receiver-side handle on one transaction.
///
/// The owner must finish it with exactly one of [`ret`](Self::ret) or
/// [`nak`](Self::nak); both consume the handle. [`ack`](Self::ack) and
/// [`feedback`](Self::feedback) are optional and non-terminal.
pub struct IncomingTransaction {
    uuid: Uuid,
    data: Vec<u8>,
    wire: WireSink,
}

impl std::fmt::Debug for IncomingTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingTransaction")
            .field("uuid", &self.uuid)
            .field("data_len", &self.data.len())
            .finish_non_exhaustive()
    }
}

impl IncomingTransaction {
    /// Correlation UUID assigned by the peer.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Request payload (first byte is the transaction opcode).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Accept the transaction; the originator sees `Acked`.
    pub fn ack(&self) {
        (self.wire)(frame(TXN_ACK, self.uuid, &[]));
    }

    /// Send a progress payload; resets the originator's idle clock.
    pub fn feedback(&self, data: &[u8]) {
        (self.wire)(frame(TXN_FEEDBACK, self.uuid, data));
    }

    /// Finish with a result payload.
    pub fn ret(self, data: &[u8]) {
        (self.wire)(frame(TXN_RET, self.uuid, data));
    }

    /// Reject, with an optional UTF-8 reason.
    pub fn nak(self, reason: &str) {
        (self.wire)(frame(TXN_NAK, self.uuid, reason.as_bytes()));
    }
}

/// Per-connection duplex transaction state.
pub struct TransactionManager {
    wire: WireSink,
    outgoing: Mutex<HashMap<Uuid, OutgoingTransaction>>,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("in_flight", &self.lock_outgoing().len())
            .finish_non_exhaustive()
    }
}

impl TransactionManager {
    /// New manager emitting encoded frames through `wire`.
    pub fn new(wire: WireSink) -> Self {
        Self { wire, outgoing: Mutex::new(HashMap::new()) }
    }

    /// Open a transaction with a fresh UUID and emit its `NEW` frame.
    pub fn send(&self, payload: &[u8]) -> OutgoingTransaction {
        let uuid = Uuid::new_v4();
        let handle = OutgoingTransaction::new(uuid);
        self.lock_outgoing().insert(uuid, handle.clone());
        (self.wire)(frame(TXN_NEW, uuid, payload));
        handle
    }

    /// Process one transaction frame from the peer.
    ///
    /// Returns `Some(handle)` for a `NEW` frame; replies to outgoing
    /// transactions update their handles and return `None`.
    ///
    /// # Errors
    ///
    /// Rejects frames too short for the header or with an unknown opcode.
    pub fn receive(&self, data: &[u8]) -> Result<Option<IncomingTransaction>> {
        if data.len() < 17 {
            bail!("transaction frame too short: {} bytes", data.len());
        }
        let opcode = data[0];
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&data[1..17]);
        let uuid = Uuid::from_bytes(raw);
        let payload = &data[17..];

        match opcode {
            TXN_NEW => Ok(Some(IncomingTransaction {
                uuid,
                data: payload.to_vec(),
                wire: Arc::clone(&self.wire),
            })),
            TXN_ACK => {
                if let Some(handle) = self.peek(uuid) {
                    let mut inner = handle.lock();
                    if inner.state == TxnState::Sent {
                        inner.state = TxnState::Acked;
                    }
                    inner.last_update_at = Instant::now();
                    drop(inner);
                    handle.changed.notify_waiters();
                }
                Ok(None)
            }
            TXN_FEEDBACK => {
                if let Some(handle) = self.peek(uuid) {
                    handle.lock().last_update_at = Instant::now();
                    handle.changed.notify_waiters();
                }
                Ok(None)
            }
            TXN_RET => {
                if let Some(handle) = self.take(uuid) {
                    let mut inner = handle.lock();
                    if !inner.state.is_terminal() {
                        inner.state = TxnState::Returned;
                        inner.result = Some(payload.to_vec());
                        inner.last_update_at = Instant::now();
                    }
                    drop(inner);
                    handle.changed.notify_waiters();
                } else {
                    log::debug!("[Txn] RET for unknown transaction {uuid}");
                }
                Ok(None)
            }
            TXN_NAK => {
                if let Some(handle) = self.take(uuid) {
                    let reason = if payload.is_empty() {
                        "Transaction rejected".to_string()
                    } else {
                        String::from_utf8_lossy(payload).into_owned()
                    };
                    fail(&handle, &reason);
                }
                Ok(None)
            }
            other => bail!("unknown transaction opcode: 0x{other:02x}"),
        }
    }

    /// Fail every in-flight outgoing transaction (connection lost).
    pub fn fail_all(&self, reason: &str) {
        let drained: Vec<OutgoingTransaction> =
            self.lock_outgoing().drain().map(|(_, h)| h).collect();
        for handle in drained {
            fail(&handle, reason);
        }
    }

    fn peek(&self, uuid: Uuid) -> Option<OutgoingTransaction> {
        self.lock_outgoing().get(&uuid).cloned()
    }

    fn take(&self, uuid: Uuid) -> Option<OutgoingTransaction> {
        self.lock_outgoing().remove(&uuid)
    }

    fn lock_outgoing(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, OutgoingTransaction>> {
        self.outgoing.lock().expect("transaction map poisoned")
    }
}

fn fail(handle: &OutgoingTransaction, reason: &str) {
    let mut inner = handle.lock();
    if !inner.state.is_terminal() {
        inner.state = TxnState::Failed;
        inner.reason = Some(reason.to_string());
        inner.last_update_at = Instant::now();
    }
    drop(inner);
    handle.changed.notify_waiters();
}

fn frame(opcode: u8, uuid: Uuid, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(17 + payload.len());
    out.push(opcode);
    out.extend_from_slice(uuid.as_bytes());
    out.extend_from_slice(payload);
    out
}
