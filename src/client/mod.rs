//! DDS client runtime.
//!
//! A [`DdsClient`] owns one connection to the broker (with automatic
//! reconnect), the local subsystem registry, and the client side of the
//! transaction protocol.
//!
//! # Lifecycle
//!
//! ```text
//! connect ──► send HANDSHAKE ──► answer REQ_UUID with our UUID
//!         ──► CONN_READY ──► replay registrations, replay subscriptions,
//!                            mark ready; user operations may proceed
//! disconnect ──► clear handshake/ready, NAK in-flight transactions,
//!                keep subsystems/subscriptions/events, reconnect and replay
//! ```
//!
//! One dispatch task per connection consumes the transport event stream, so
//! all observable client state transitions are serialized there. Incoming
//! provider callbacks (`RGET_KV`, `RSET_KV`, `RCALL_EVENT`) run
//! synchronously in that task.

mod event;
mod property;
mod subsystem;

pub use event::{EventHandler, EventProvider, InProgressEvent, IncomingEventHandle};
pub use property::{KvHandler, LocalProperty, RemoteProperty};
pub use subsystem::RegisteredSubsystem;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ClientConfig;
use crate::logging::LogClient;
use crate::magics::{
    EVENT_REJ, MAGIC_HANDSHAKE_CLIENT, MAGIC_TRANSACT, TRANSACT_CONN_READY,
    TRANSACT_GET_SUBSYSTEM, TRANSACT_RCALL_EVENT, TRANSACT_REQ_UUID, TRANSACT_RESOLVE,
    TRANSACT_RGET_KV, TRANSACT_RGET_KV_DESC, TRANSACT_RSET_KV, TRANSOP_STATE_OK,
    TRANSOP_STATE_REJ,
};
use crate::proto::DdsMessage;
use crate::seg;
use crate::subsystem::{decode_uuid, SubsystemInfo};
use crate::transport::{ConnEvent, Connection};
use crate::txn::{IncomingTransaction, OutgoingTransaction, TransactionManager, TxnState, WireSink};

use property::RemotePropertyInner;
use subsystem::SubsystemInner;

/// Registration progress of this client's subsystems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    /// No registration acknowledged yet.
    NotRegistered,
    /// The broker accepted the latest registration.
    Registered,
    /// The broker refused the latest registration.
    Refused,
}

pub(crate) struct ActiveConn {
    conn: Connection,
    txns: Arc<TransactionManager>,
}

/// Shared client state; public API handles hold an `Arc`, children hold a
/// `Weak` (ownership flows client → subsystem → provider only).
pub(crate) struct ClientInner {
    pub(crate) uuid: Uuid,
    pub(crate) config: ClientConfig,
    conn: Mutex<Option<ActiveConn>>,
    ready: AtomicBool,
    shutdown: AtomicBool,
    registration: Mutex<RegistrationState>,
    pub(crate) subsystems: Mutex<HashMap<Uuid, Arc<SubsystemInner>>>,
    /// Weak subscriptions replayed on every reconnect.
    active_subs: Mutex<Vec<Weak<RemotePropertyInner>>>,
    system: Mutex<Vec<(SubsystemInfo, bool)>>,
    ready_changed: Notify,
    registration_changed: Notify,
    system_changed: Notify,
    run_task: Mutex<Option<JoinHandle<()>>>,
    logger: Mutex<Option<Arc<LogClient>>>,
}

/// Handle on a running DDS client. Cheap to clone.
#[derive(Clone)]
pub struct DdsClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for DdsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DdsClient")
            .field("uuid", &self.inner.uuid)
            .field("ready", &self.inner.ready.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl DdsClient {
    /// Start a client identified by `uuid`, connecting (and reconnecting)
    /// to the broker named in `config`.
    pub fn connect(uuid: Uuid, config: ClientConfig) -> Self {
        let inner = Arc::new(ClientInner {
            uuid,
            config,
            conn: Mutex::new(None),
            ready: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            registration: Mutex::new(RegistrationState::NotRegistered),
            subsystems: Mutex::new(HashMap::new()),
            active_subs: Mutex::new(Vec::new()),
            system: Mutex::new(Vec::new()),
            ready_changed: Notify::new(),
            registration_changed: Notify::new(),
            system_changed: Notify::new(),
            run_task: Mutex::new(None),
            logger: Mutex::new(None),
        });
        let task = tokio::spawn(run_loop(Arc::clone(&inner)));
        *inner.run_task.lock().expect("run task poisoned") = Some(task);
        Self { inner }
    }

    /// This client's UUID.
    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// Attach a structured-log client for journal records.
    pub fn set_logger(&self, logger: Arc<LogClient>) {
        *self.inner.logger.lock().expect("logger poisoned") = Some(logger);
    }

    /// True between `CONN_READY` and the next disconnect.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Registration progress of the latest `REG_SUBSYSTEM`.
    pub fn registration(&self) -> RegistrationState {
        *self.inner.registration.lock().expect("registration poisoned")
    }

    /// Declare a subsystem owned by this client.
    ///
    /// Providers and handlers can be attached to the returned handle right
    /// away; the registration (and every descriptor change) is pushed to
    /// the broker as soon as the connection is ready.
    pub fn register_subsystem(
        &self,
        name: impl Into<String>,
        uuid: Uuid,
        temporary: bool,
    ) -> RegisteredSubsystem {
        let sub = Arc::new(SubsystemInner::new(
            uuid,
            name.into(),
            temporary,
            Arc::downgrade(&self.inner),
        ));
        self.inner
            .subsystems
            .lock()
            .expect("subsystems poisoned")
            .insert(uuid, Arc::clone(&sub));
        if self.is_ready() {
            send_registration(&self.inner, &sub);
        }
        RegisteredSubsystem::from_inner(sub)
    }

    /// Wait until the connection is ready.
    ///
    /// # Errors
    ///
    /// Errors on timeout.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        tokio::time::timeout(timeout, async {
            loop {
                let notified = inner.ready_changed.notified();
                if inner.ready.load(Ordering::SeqCst) {
                    return;
                }
                notified.await;
            }
        })
        .await
        .map_err(|_| anyhow!("client did not become ready within {timeout:?}"))
    }

    /// Wait until the broker acknowledges a subsystem registration.
    ///
    /// # Errors
    ///
    /// Errors on timeout or if the broker refused the registration.
    pub async fn wait_registered(&self, timeout: Duration) -> Result<()> {
        let inner = &self.inner;
        tokio::time::timeout(timeout, async {
            loop {
                let notified = inner.registration_changed.notified();
                match *inner.registration.lock().expect("registration poisoned") {
                    RegistrationState::Registered => return Ok(()),
                    RegistrationState::Refused => bail!("registration was refused"),
                    RegistrationState::NotRegistered => {}
                }
                notified.await;
            }
        })
        .await
        .map_err(|_| anyhow!("registration not acknowledged within {timeout:?}"))?
    }

    /// Latest registry snapshot received from the broker.
    pub fn system(&self) -> Vec<(SubsystemInfo, bool)> {
        self.inner.system.lock().expect("system poisoned").clone()
    }

    /// Wait for the next registry snapshot broadcast.
    ///
    /// # Errors
    ///
    /// Errors on timeout.
    pub async fn wait_system_update(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.inner.system_changed.notified())
            .await
            .map_err(|_| anyhow!("no system update within {timeout:?}"))
    }

    /// Resolve a subsystem name to its UUID (first match).
    ///
    /// # Errors
    ///
    /// Errors if the client is not ready, the operation times out, or the
    /// broker rejects with a reason.
    pub async fn resolve(&self, name: &[u8]) -> Result<Uuid> {
        let payload = op_payload(TRANSACT_RESOLVE, &seg::encode(&[name])?);
        let value = self.inner.transop_await(payload).await?;
        decode_uuid(&value)
    }

    /// Fetch the descriptor set of a remote subsystem.
    ///
    /// # Errors
    ///
    /// Errors if the client is not ready, the operation times out, or the
    /// broker rejects with a reason.
    pub async fn get_subsystem(&self, target: Uuid) -> Result<SubsystemInfo> {
        let payload =
            op_payload(TRANSACT_GET_SUBSYSTEM, &seg::encode(&[target.as_bytes().as_slice()])?);
        let value = self.inner.transop_await(payload).await?;
        SubsystemInfo::decode(&value)
    }

    /// Shut down the connection and stop the runtime.
    pub fn close(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(task) = self.inner.run_task.lock().expect("run task poisoned").take() {
            task.abort();
        }
        *self.inner.conn.lock().expect("conn poisoned") = None;
        self.inner.ready.store(false, Ordering::SeqCst);
        log::info!("[Client] {} closed", self.inner.uuid);
    }
}

impl ClientInner {
    /// Queue one DDS message on the current connection.
    pub(crate) fn send_message(&self, msg: &DdsMessage) -> bool {
        let conn = self.conn.lock().expect("conn poisoned");
        match (&*conn, msg.encode()) {
            (Some(ctx), Ok(bytes)) => ctx.conn.put(bytes),
            (None, _) => false,
            (_, Err(e)) => {
                log::error!("[Client] failed to encode message: {e}");
                false
            }
        }
    }

    /// Open a transaction on the current connection, ready or not.
    /// Used for the registration/subscription replay during `CONN_READY`.
    fn transop_raw(&self, payload: &[u8]) -> Result<OutgoingTransaction> {
        let conn = self.conn.lock().expect("conn poisoned");
        let ctx = conn.as_ref().context("not connected to broker")?;
        Ok(ctx.txns.send(payload))
    }

    /// Open a transaction; requires the connection to be ready.
    pub(crate) fn transop(&self, payload: &[u8]) -> Result<OutgoingTransaction> {
        if !self.ready.load(Ordering::SeqCst) {
            bail!("client is not ready");
        }
        self.transop_raw(payload)
    }

    /// Run one remote operation to completion and unpack the
    /// `[state][value_or_reason]` result.
    pub(crate) async fn transop_await(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        let out = self.transop(&payload)?;
        let state = tokio::time::timeout(self.config.op_timeout, out.wait())
            .await
            .map_err(|_| anyhow!("remote operation timed out"))?;
        match state {
            TxnState::Returned => {
                let result = out.result().unwrap_or_default();
                match result.split_first() {
                    Some((&TRANSOP_STATE_OK, value)) => Ok(value.to_vec()),
                    Some((_, reason)) => bail!("{}", String::from_utf8_lossy(reason)),
                    None => bail!("empty operation result"),
                }
            }
            _ => bail!(
                "{}",
                out.reason().unwrap_or_else(|| "Transaction rejected".to_string())
            ),
        }
    }

    /// Install a remote-KV proxy subscription and request updates.
    pub(crate) fn add_active_subscriber(&self, prop: &Arc<RemotePropertyInner>) {
        self.active_subs
            .lock()
            .expect("subscriptions poisoned")
            .push(Arc::downgrade(prop));
        self.send_message(&DdsMessage::ReqSubscribe {
            target: prop.remote,
            key: prop.key.clone(),
        });
    }

    pub(crate) fn journal(&self, level: &str, msg: &str) {
        if let Some(logger) = &*self.logger.lock().expect("logger poisoned") {
            logger.log(level, msg);
        }
    }

    fn on_subscribed_upd(&self, target: Uuid, key: &[u8], value: &[u8]) {
        let mut subs = self.active_subs.lock().expect("subscriptions poisoned");
        subs.retain(|weak| weak.strong_count() > 0);
        let live: Vec<Arc<RemotePropertyInner>> =
            subs.iter().filter_map(Weak::upgrade).collect();
        drop(subs);
        for prop in live {
            if prop.remote == target && prop.key == key {
                prop.remote_update(value);
            }
        }
    }

    fn on_event_ret(&self, originator: Uuid, event: Uuid, target: Uuid, status: u8, value: Vec<u8>) {
        let sub = self
            .subsystems
            .lock()
            .expect("subsystems poisoned")
            .get(&originator)
            .cloned();
        match sub {
            Some(sub) => sub.on_event_return(event, target, status, &value),
            None => {
                log::warn!("[Client] event return for unknown originating subsystem {originator}");
            }
        }
    }
}

async fn run_loop(inner: Arc<ClientInner>) {
    let addr = inner.config.broker_addr();
    while !inner.shutdown.load(Ordering::SeqCst) {
        let stream = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                log::debug!("[Client] connect to {addr} failed: {e}");
                tokio::time::sleep(inner.config.reconnect_delay).await;
                continue;
            }
        };
        log::info!("[Client] {} connected to {addr}", inner.uuid);

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let conn = Connection::spawn(stream, event_tx);
        let out_tx = conn.sender();
        let sink: WireSink = Arc::new(move |frame| {
            let mut msg = Vec::with_capacity(1 + frame.len());
            msg.push(MAGIC_TRANSACT);
            msg.extend_from_slice(&frame);
            let _ = out_tx.send(msg);
        });
        let txns = Arc::new(TransactionManager::new(sink));

        conn.put(vec![MAGIC_HANDSHAKE_CLIENT]);
        *inner.conn.lock().expect("conn poisoned") =
            Some(ActiveConn { conn, txns: Arc::clone(&txns) });

        dispatch(&inner, &mut event_rx, &txns).await;

        // Connection lost: clear handshake/ready state but keep subsystems,
        // subscriptions and in-progress events for the replay.
        inner.ready.store(false, Ordering::SeqCst);
        txns.fail_all("connection lost");
        *inner.conn.lock().expect("conn poisoned") = None;
        inner.journal("WARN", "Connection to broker lost");
        log::warn!("[Client] {} lost connection to {addr}", inner.uuid);

        if inner.shutdown.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(inner.config.reconnect_delay).await;
    }
}

/// Consume transport events for one connection until it drops.
async fn dispatch(
    inner: &Arc<ClientInner>,
    event_rx: &mut UnboundedReceiver<ConnEvent>,
    txns: &Arc<TransactionManager>,
) {
    let mut handshaken = false;
    while let Some(event) = event_rx.recv().await {
        match event {
            ConnEvent::Message(msg) => {
                if msg.is_empty() {
                    continue;
                }
                let msg = match DdsMessage::decode(&msg) {
                    Ok(msg) => msg,
                    Err(e) => {
                        log::error!("[Client] protocol error: {e}");
                        return;
                    }
                };
                if !handshaken {
                    if msg == DdsMessage::Handshake {
                        handshaken = true;
                        continue;
                    }
                    log::error!("[Client] message before handshake");
                    return;
                }
                match msg {
                    DdsMessage::Handshake => {
                        log::error!("[Client] second handshake on open connection");
                        return;
                    }
                    DdsMessage::Transact(frame) => match txns.receive(&frame) {
                        Ok(Some(incoming)) => handle_incoming(inner, incoming),
                        Ok(None) => {}
                        Err(e) => {
                            log::error!("[Client] bad transaction frame: {e}");
                            return;
                        }
                    },
                    DdsMessage::SubscribedUpd { target, key, value } => {
                        inner.on_subscribed_upd(target, &key, &value);
                    }
                    DdsMessage::SystemUpd { entries } => {
                        *inner.system.lock().expect("system poisoned") = entries;
                        inner.system_changed.notify_waiters();
                    }
                    DdsMessage::EventRet { target, originator, event, status, value } => {
                        inner.on_event_ret(originator, event, target, status, value);
                    }
                    DdsMessage::ReqSubscribe { .. } => {
                        log::error!("[Client] unexpected broker message");
                        return;
                    }
                }
            }
            ConnEvent::Disconnected => return,
        }
    }
}

/// Dispatch one incoming broker transaction.
fn handle_incoming(inner: &Arc<ClientInner>, t: IncomingTransaction) {
    let data = t.data().to_vec();
    let Some((&op, payload)) = data.split_first() else {
        t.nak("empty transaction payload");
        return;
    };

    match op {
        TRANSACT_REQ_UUID => t.ret(inner.uuid.as_bytes()),
        TRANSACT_CONN_READY => {
            if inner.ready.load(Ordering::SeqCst) {
                log::error!("[Client] received CONN_READY twice");
                t.nak("connection is already ready");
                return;
            }
            become_ready(inner);
            t.ret(inner.uuid.as_bytes());
        }
        TRANSACT_RGET_KV => match seg::decode_exact::<3>(payload) {
            Ok([target, requester, key]) => {
                match (decode_uuid(&target), decode_uuid(&requester)) {
                    (Ok(target), Ok(requester)) => {
                        let (state, body) = with_subsystem(inner, target, |sub| {
                            sub.kv_remote_get(requester, &key)
                        });
                        t.ret(&status_payload(state, &body));
                    }
                    _ => t.nak("malformed RGET_KV payload"),
                }
            }
            Err(e) => t.nak(&format!("malformed RGET_KV payload: {e}")),
        },
        TRANSACT_RSET_KV => match seg::decode_exact::<4>(payload) {
            Ok([target, requester, key, value]) => {
                match (decode_uuid(&target), decode_uuid(&requester)) {
                    (Ok(target), Ok(requester)) => {
                        let (state, body) = with_subsystem(inner, target, |sub| {
                            sub.kv_remote_set(requester, &key, &value)
                        });
                        t.ret(&status_payload(state, &body));
                    }
                    _ => t.nak("malformed RSET_KV payload"),
                }
            }
            Err(e) => t.nak(&format!("malformed RSET_KV payload: {e}")),
        },
        TRANSACT_RGET_KV_DESC => match seg::decode_exact::<3>(payload) {
            Ok([target, _requester, key]) => match decode_uuid(&target) {
                Ok(target) => {
                    let (state, body) =
                        with_subsystem(inner, target, |sub| sub.kv_descriptor(&key));
                    t.ret(&status_payload(state, &body));
                }
                Err(e) => t.nak(&format!("malformed RGET_KV_DESC payload: {e}")),
            },
            Err(e) => t.nak(&format!("malformed RGET_KV_DESC payload: {e}")),
        },
        TRANSACT_RCALL_EVENT => match seg::decode_exact::<5>(payload) {
            Ok([target, sender, event, name, param]) => {
                match (decode_uuid(&target), decode_uuid(&sender), decode_uuid(&event)) {
                    (Ok(target), Ok(sender), Ok(event)) => {
                        let sub = inner
                            .subsystems
                            .lock()
                            .expect("subsystems poisoned")
                            .get(&target)
                            .cloned();
                        match sub {
                            Some(sub) => sub.incoming_event(event, t, sender, &name, &param),
                            None => {
                                let mut body = vec![EVENT_REJ];
                                body.extend_from_slice(b"Specified subsystem not found.");
                                t.ret(&body);
                            }
                        }
                    }
                    _ => t.nak("malformed RCALL_EVENT payload"),
                }
            }
            Err(e) => t.nak(&format!("malformed RCALL_EVENT payload: {e}")),
        },
        _ => t.nak("unsupported transaction opcode"),
    }
}

/// Run `f` on the addressed subsystem, with the standard rejections.
fn with_subsystem(
    inner: &Arc<ClientInner>,
    target: Uuid,
    f: impl FnOnce(&Arc<SubsystemInner>) -> (u8, Vec<u8>),
) -> (u8, Vec<u8>) {
    let sub = inner
        .subsystems
        .lock()
        .expect("subsystems poisoned")
        .get(&target)
        .cloned();
    match sub {
        Some(sub) => f(&sub),
        None => (TRANSOP_STATE_REJ, b"Specified subsystem not found.".to_vec()),
    }
}

/// Replay registrations and subscriptions, then unblock user operations.
fn become_ready(inner: &Arc<ClientInner>) {
    let subs: Vec<Arc<SubsystemInner>> = inner
        .subsystems
        .lock()
        .expect("subsystems poisoned")
        .values()
        .cloned()
        .collect();
    for sub in &subs {
        send_registration(inner, sub);
    }

    let subscriptions: Vec<Weak<RemotePropertyInner>> =
        inner.active_subs.lock().expect("subscriptions poisoned").clone();
    for weak in subscriptions {
        if let Some(prop) = weak.upgrade() {
            inner.send_message(&DdsMessage::ReqSubscribe {
                target: prop.remote,
                key: prop.key.clone(),
            });
        }
    }

    inner.ready.store(true, Ordering::SeqCst);
    inner.ready_changed.notify_waiters();
    inner.journal("DEBUG", "Connection ready");
    log::info!("[Client] {} is ready", inner.uuid);
}

/// Push one subsystem registration and track its outcome.
pub(crate) fn send_registration(inner: &Arc<ClientInner>, sub: &Arc<SubsystemInner>) {
    let encoded = match sub.build_info().and_then(|info| info.encode()) {
        Ok(encoded) => encoded,
        Err(e) => {
            log::error!("[Client] cannot encode subsystem info: {e}");
            return;
        }
    };
    let payload = op_payload(crate::magics::TRANSACT_REG_SUBSYSTEM, &encoded);
    let out = match inner.transop_raw(&payload) {
        Ok(out) => out,
        Err(_) => return,
    };
    let inner = Arc::clone(inner);
    let name = sub.name.clone();
    tokio::spawn(async move {
        let state = match out.wait().await {
            TxnState::Returned => RegistrationState::Registered,
            _ => {
                log::warn!(
                    "[Client] registration of {name} refused: {}",
                    out.reason().unwrap_or_default()
                );
                RegistrationState::Refused
            }
        };
        *inner.registration.lock().expect("registration poisoned") = state;
        inner.registration_changed.notify_waiters();
    });
}

pub(crate) fn op_payload(opcode: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(opcode);
    out.extend_from_slice(body);
    out
}

fn status_payload(state: u8, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(state);
    out.extend_from_slice(body);
    out
}
