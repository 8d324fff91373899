//! Broker-side handler for one client connection.
//!
//! # Lifecycle
//!
//! ```text
//! accept ──► Connection::spawn (read/write tasks)
//!   client sends HANDSHAKE ──► broker echoes it
//!   broker ──REQ_UUID txn──► client returns its UUID
//!   broker indexes the connection, ──CONN_READY txn──► client
//!   client RETs ──► connection is ready; registrations and transactions flow
//!   disconnect ──► in-flight transactions NAK, registry unbinds/removes
//! ```
//!
//! Each connection runs one dispatch task that consumes the transport event
//! stream plus an internal control channel, so every observable state
//! transition for the connection is serialized here. Cross-connection state
//! lives in the shared [`Registry`] and is only touched under its lock,
//! never across an await.

use std::sync::{Arc, Mutex};

use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedSender};
use uuid::Uuid;

use crate::magics::{
    E_SUBSYSTEM_DISCONNECTED, EVENT_IN_PROGRESS, EVENT_REJ, MAGIC_TRANSACT,
    TRANSACT_CALL_EVENT, TRANSACT_CONN_READY, TRANSACT_GET_KV, TRANSACT_GET_KV_DESC,
    TRANSACT_GET_SUBSYSTEM, TRANSACT_RCALL_EVENT, TRANSACT_REG_SUBSYSTEM, TRANSACT_REQ_UUID,
    TRANSACT_RESOLVE, TRANSACT_RGET_KV, TRANSACT_RGET_KV_DESC, TRANSACT_RSET_KV,
    TRANSACT_SET_KV, TRANSOP_STATE_OK, TRANSOP_STATE_REJ,
};
use crate::proto::DdsMessage;
use crate::seg;
use crate::subsystem::{decode_uuid, SubsystemInfo};
use crate::transport::{ConnEvent, Connection};
use crate::txn::{IncomingTransaction, OutgoingTransaction, TransactionManager, TxnState, WireSink};

use super::registry::{ClientHandle, GetKvAction, Registry, SetKvAction};

/// Internal control events produced by the handshake driver tasks.
enum Ctl {
    /// `REQ_UUID` returned; index the connection under this UUID.
    GotUuid(Uuid),
    /// `CONN_READY` returned.
    Ready,
    /// Handshake sequence failed; close the connection.
    Fatal(String),
}

/// Drive one accepted client connection to completion.
pub(crate) async fn handle_connection(stream: TcpStream, registry: Arc<Mutex<Registry>>) {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ConnEvent>();
    let conn = Connection::spawn(stream, event_tx);
    let peer = conn.peer().to_string();

    // Transaction frames are queued on the transport synchronously, in
    // dispatch order with every other message on this connection.
    let out_tx = conn.sender();
    let sink: WireSink = {
        let out_tx = out_tx.clone();
        Arc::new(move |frame| {
            let mut msg = Vec::with_capacity(1 + frame.len());
            msg.push(MAGIC_TRANSACT);
            msg.extend_from_slice(&frame);
            let _ = out_tx.send(msg);
        })
    };
    let txns = Arc::new(TransactionManager::new(sink));

    let (ctl_tx, mut ctl_rx) = mpsc::unbounded_channel::<Ctl>();

    let mut handshaken = false;
    let mut client_uuid: Option<Uuid> = None;

    loop {
        tokio::select! {
            event = event_rx.recv() => {
                match event {
                    Some(ConnEvent::Message(msg)) => {
                        if msg.is_empty() {
                            continue;
                        }
                        let msg = match DdsMessage::decode(&msg) {
                            Ok(msg) => msg,
                            Err(e) => {
                                log::error!("[Broker] protocol error from {peer}: {e}");
                                break;
                            }
                        };
                        if !handshaken {
                            if msg == DdsMessage::Handshake {
                                handshaken = true;
                                conn.put(vec![crate::magics::MAGIC_HANDSHAKE_SERVER]);
                                start_configure(&txns, &ctl_tx);
                            } else {
                                log::error!("[Broker] message before handshake from {peer}");
                                break;
                            }
                            continue;
                        }
                        match msg {
                            DdsMessage::Handshake => {
                                log::error!("[Broker] second handshake from {peer}");
                                break;
                            }
                            DdsMessage::Transact(frame) => match txns.receive(&frame) {
                                Ok(Some(incoming)) => {
                                    handle_transaction(incoming, client_uuid, &registry);
                                }
                                Ok(None) => {}
                                Err(e) => {
                                    log::error!("[Broker] bad transaction frame from {peer}: {e}");
                                    break;
                                }
                            },
                            DdsMessage::ReqSubscribe { target, key } => {
                                if let Some(uuid) = client_uuid {
                                    lock(&registry).subscribe(uuid, target, key);
                                } else {
                                    log::warn!("[Broker] subscribe before configuration from {peer}");
                                }
                            }
                            other => {
                                log::error!("[Broker] unexpected message from {peer}: {other:?}");
                                break;
                            }
                        }
                    }
                    Some(ConnEvent::Disconnected) | None => {
                        break;
                    }
                }
            }
            ctl = ctl_rx.recv() => {
                match ctl {
                    Some(Ctl::GotUuid(uuid)) => {
                        client_uuid = Some(uuid);
                        let handle = ClientHandle::new(uuid, out_tx.clone(), Arc::clone(&txns));
                        lock(&registry).register_client(handle);
                        start_ready(&txns, &ctl_tx);
                    }
                    Some(Ctl::Ready) => {
                        log::debug!("[Broker] connection {peer} is ready");
                    }
                    Some(Ctl::Fatal(reason)) => {
                        log::warn!("[Broker] closing {peer}: {reason}");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    txns.fail_all("connection lost");
    if let Some(uuid) = client_uuid {
        let mut reg = lock(&registry);
        reg.disconnect_client(uuid);
        reg.broadcast_system_upd();
        log::info!("[Broker] client {uuid} disconnected ({} remain)", reg.client_count());
    } else {
        log::debug!("[Broker] {peer} disconnected before configuration finished");
    }
    // Dropping the connection aborts its read/write tasks.
    drop(conn);
}

/// Ask the freshly handshaken client for its UUID.
fn start_configure(txns: &Arc<TransactionManager>, ctl_tx: &UnboundedSender<Ctl>) {
    let out = txns.send(&[TRANSACT_REQ_UUID]);
    let ctl_tx = ctl_tx.clone();
    tokio::spawn(async move {
        let ctl = match out.wait().await {
            TxnState::Returned => match decode_uuid(&out.result().unwrap_or_default()) {
                Ok(uuid) => Ctl::GotUuid(uuid),
                Err(e) => Ctl::Fatal(format!("bad REQ_UUID result: {e}")),
            },
            _ => Ctl::Fatal("REQ_UUID was rejected".to_string()),
        };
        let _ = ctl_tx.send(ctl);
    });
}

/// Tell the client its connection is configured.
fn start_ready(txns: &Arc<TransactionManager>, ctl_tx: &UnboundedSender<Ctl>) {
    let out = txns.send(&[TRANSACT_CONN_READY]);
    let ctl_tx = ctl_tx.clone();
    tokio::spawn(async move {
        let ctl = match out.wait().await {
            TxnState::Returned => Ctl::Ready,
            _ => Ctl::Fatal("CONN_READY was rejected".to_string()),
        };
        let _ = ctl_tx.send(ctl);
    });
}

/// Dispatch one incoming transaction by its opcode.
fn handle_transaction(
    t: IncomingTransaction,
    client_uuid: Option<Uuid>,
    registry: &Arc<Mutex<Registry>>,
) {
    let data = t.data().to_vec();
    let Some((&op, payload)) = data.split_first() else {
        t.nak("empty transaction payload");
        return;
    };

    match op {
        TRANSACT_REG_SUBSYSTEM => {
            let Some(c_uuid) = client_uuid else {
                t.nak("connection is not configured");
                return;
            };
            match SubsystemInfo::decode(payload) {
                Ok(info) => {
                    let ok = lock(registry).register_subsystem(c_uuid, info);
                    if ok {
                        t.ret(&[]);
                    } else {
                        t.nak("subsystem is bound to another client");
                    }
                    lock(registry).broadcast_system_upd();
                }
                Err(e) => t.nak(&format!("malformed subsystem info: {e}")),
            }
        }
        TRANSACT_SET_KV => match seg::decode_exact::<4>(payload) {
            Ok([target, origin, key, value]) => {
                match (decode_uuid(&target), decode_uuid(&origin)) {
                    (Ok(target), Ok(origin)) => {
                        handle_set_kv(registry, t, origin, target, &key, &value);
                    }
                    _ => t.nak("malformed SET_KV payload"),
                }
            }
            Err(e) => t.nak(&format!("malformed SET_KV payload: {e}")),
        },
        TRANSACT_GET_KV => match decode_target_key(payload) {
            Ok((target, origin, key)) => handle_get_kv(registry, t, target, origin, &key),
            Err(e) => t.nak(&format!("malformed GET_KV payload: {e}")),
        },
        TRANSACT_GET_KV_DESC => match decode_target_key(payload) {
            Ok((target, origin, key)) => {
                let action = lock(registry).prepare_forward(target);
                forward_kv_action(
                    t,
                    action,
                    TRANSACT_RGET_KV_DESC,
                    &[target.as_bytes().to_vec(), origin.as_bytes().to_vec(), key],
                );
            }
            Err(e) => t.nak(&format!("malformed GET_KV_DESC payload: {e}")),
        },
        TRANSACT_RESOLVE => match seg::decode_exact::<1>(payload) {
            Ok([name]) => {
                let name = String::from_utf8_lossy(&name).into_owned();
                match lock(registry).resolve(&name) {
                    Some(uuid) => t.ret(&ok_payload(uuid.as_bytes())),
                    None => t.ret(&rej_payload("Not found")),
                }
            }
            Err(e) => t.nak(&format!("malformed RESOLVE payload: {e}")),
        },
        TRANSACT_GET_SUBSYSTEM => match seg::decode_exact::<1>(payload) {
            Ok([target]) => match decode_uuid(&target) {
                Ok(target) => {
                    let info = lock(registry).subsystem_info(target);
                    match info.map(|i| i.encode()) {
                        Some(Ok(encoded)) => t.ret(&ok_payload(&encoded)),
                        Some(Err(e)) => t.nak(&format!("failed to encode subsystem: {e}")),
                        None => t.ret(&rej_payload("Not found")),
                    }
                }
                Err(e) => t.nak(&format!("malformed GET_SUBSYSTEM payload: {e}")),
            },
            Err(e) => t.nak(&format!("malformed GET_SUBSYSTEM payload: {e}")),
        },
        TRANSACT_CALL_EVENT => match seg::decode_exact::<4>(payload) {
            Ok([targets_blob, origin, name, param]) => {
                let targets = match decode_uuid_list(&targets_blob) {
                    Ok(t) => t,
                    Err(e) => {
                        t.nak(&format!("malformed CALL_EVENT targets: {e}"));
                        return;
                    }
                };
                match decode_uuid(&origin) {
                    Ok(origin) => handle_call_event(registry, t, origin, &targets, &name, &param),
                    Err(e) => t.nak(&format!("malformed CALL_EVENT origin: {e}")),
                }
            }
            Err(e) => t.nak(&format!("malformed CALL_EVENT payload: {e}")),
        },
        _ => t.nak("unsupported transaction opcode"),
    }
}

fn handle_set_kv(
    registry: &Arc<Mutex<Registry>>,
    t: IncomingTransaction,
    origin: Uuid,
    target: Uuid,
    key: &[u8],
    value: &[u8],
) {
    let action = lock(registry).prepare_set_kv(origin, target, key, value);
    match action {
        SetKvAction::NotFound => t.ret(&rej_payload("Target subsystem not found")),
        SetKvAction::Disconnected => t.ret(&rej_payload(E_SUBSYSTEM_DISCONNECTED)),
        SetKvAction::OwnerCached(subscribers) => {
            let upd = DdsMessage::SubscribedUpd {
                target: origin,
                key: key.to_vec(),
                value: value.to_vec(),
            };
            for sub in subscribers {
                sub.send(&upd);
            }
            t.ret(&[TRANSOP_STATE_OK]);
        }
        SetKvAction::Forward(client) => {
            forward(
                t,
                &client,
                TRANSACT_RSET_KV,
                &[
                    target.as_bytes().to_vec(),
                    origin.as_bytes().to_vec(),
                    key.to_vec(),
                    value.to_vec(),
                ],
            );
        }
    }
}

fn handle_get_kv(
    registry: &Arc<Mutex<Registry>>,
    t: IncomingTransaction,
    target: Uuid,
    origin: Uuid,
    key: &[u8],
) {
    let action = lock(registry).prepare_get_kv(target, key);
    forward_kv_action(
        t,
        action,
        TRANSACT_RGET_KV,
        &[target.as_bytes().to_vec(), origin.as_bytes().to_vec(), key.to_vec()],
    );
}

/// Complete a KV routing decision that either rejects or forwards.
fn forward_kv_action(
    t: IncomingTransaction,
    action: GetKvAction,
    opcode: u8,
    fields: &[Vec<u8>],
) {
    match action {
        GetKvAction::NotFound => t.ret(&rej_payload("Target subsystem not found")),
        GetKvAction::Disconnected => t.ret(&rej_payload(E_SUBSYSTEM_DISCONNECTED)),
        GetKvAction::Cached(value) => t.ret(&ok_payload(&value)),
        GetKvAction::Forward(client) => forward(t, &client, opcode, fields),
    }
}

/// Forward a request to the owning client and relay its result verbatim.
fn forward(t: IncomingTransaction, client: &ClientHandle, opcode: u8, fields: &[Vec<u8>]) {
    let payload = match seg::encode(fields) {
        Ok(p) => p,
        Err(e) => {
            t.ret(&rej_payload(&format!("oversized field: {e}")));
            return;
        }
    };
    let mut frame = Vec::with_capacity(1 + payload.len());
    frame.push(opcode);
    frame.extend_from_slice(&payload);
    let out = client.txns.send(&frame);
    tokio::spawn(async move {
        match out.wait().await {
            TxnState::Returned => t.ret(&out.result().unwrap_or_default()),
            _ => t.ret(&rej_payload("Transaction rejected")),
        }
    });
}

fn handle_call_event(
    registry: &Arc<Mutex<Registry>>,
    t: IncomingTransaction,
    origin: Uuid,
    targets: &[Uuid],
    name: &[u8],
    param: &[u8],
) {
    let prepared = match lock(registry).prepare_call_event(targets) {
        Ok(list) => list,
        Err(()) => {
            t.ret(&rej_payload("One targeted subsystem was not found."));
            return;
        }
    };

    let event = Uuid::new_v4();
    let reachable = prepared.iter().filter(|(_, h)| h.is_some()).count();
    // Record before dispatching so an instant return cannot outrun it.
    lock(registry).record_event(event, origin, reachable);

    let mut status_entries = Vec::with_capacity(prepared.len());
    for (target, handle) in prepared {
        let ok = handle.is_some();
        if let Some(client) = handle {
            let fields = [
                target.as_bytes().to_vec(),
                origin.as_bytes().to_vec(),
                event.as_bytes().to_vec(),
                name.to_vec(),
                param.to_vec(),
            ];
            match seg::encode(&fields) {
                Ok(payload) => {
                    let mut frame = Vec::with_capacity(1 + payload.len());
                    frame.push(TRANSACT_RCALL_EVENT);
                    frame.extend_from_slice(&payload);
                    let out = client.txns.send(&frame);
                    tokio::spawn(watch_event_target(Arc::clone(registry), out, target, event));
                }
                Err(e) => {
                    log::error!("[Broker] cannot dispatch event to {target}: {e}");
                    deliver_event_return(registry, target, event, EVENT_REJ, &[]);
                }
            }
        }
        match seg::encode(&[target.as_bytes().to_vec(), vec![u8::from(ok)]]) {
            Ok(entry) => status_entries.push(entry),
            Err(e) => log::error!("[Broker] event status entry: {e}"),
        }
    }

    let reply = seg::encode(&status_entries)
        .and_then(|statuses| seg::encode(&[event.as_bytes().to_vec(), statuses]));
    match reply {
        Ok(body) => t.ret(&ok_payload(&body)),
        Err(e) => t.ret(&rej_payload(&format!("event reply too large: {e}"))),
    }
}

/// Track one forwarded `RCALL_EVENT` and relay its progress to the
/// originator as unsolicited `EVENT_RET` messages.
async fn watch_event_target(
    registry: Arc<Mutex<Registry>>,
    out: OutgoingTransaction,
    target: Uuid,
    event: Uuid,
) {
    let mut state = out.wait_past(TxnState::Sent).await;
    if state == TxnState::Acked {
        deliver_event_return(&registry, target, event, EVENT_IN_PROGRESS, &[]);
        state = out.wait().await;
    }
    match state {
        TxnState::Returned => {
            let result = out.result().unwrap_or_default();
            match result.split_first() {
                Some((&status, value)) => {
                    deliver_event_return(&registry, target, event, status, value);
                }
                None => deliver_event_return(&registry, target, event, EVENT_REJ, &[]),
            }
        }
        _ => deliver_event_return(&registry, target, event, EVENT_REJ, &[]),
    }
}

fn deliver_event_return(
    registry: &Arc<Mutex<Registry>>,
    target: Uuid,
    event: Uuid,
    status: u8,
    value: &[u8],
) {
    let route = lock(registry).event_return_route(event, status);
    match route {
        Some((originator, client)) => {
            client.send(&DdsMessage::EventRet {
                target,
                originator,
                event,
                status,
                value: value.to_vec(),
            });
        }
        None => log::error!("[Broker] event return for unknown event {event}"),
    }
}

fn decode_target_key(payload: &[u8]) -> anyhow::Result<(Uuid, Uuid, Vec<u8>)> {
    let [target, origin, key] = seg::decode_exact::<3>(payload)?;
    Ok((decode_uuid(&target)?, decode_uuid(&origin)?, key))
}

fn decode_uuid_list(blob: &[u8]) -> anyhow::Result<Vec<Uuid>> {
    seg::decode(blob)?.iter().map(|b| decode_uuid(b)).collect()
}

fn ok_payload(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + value.len());
    out.push(TRANSOP_STATE_OK);
    out.extend_from_slice(value);
    out
}

fn rej_payload(reason: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + reason.len());
    out.push(TRANSOP_STATE_REJ);
    out.extend_from_slice(reason.as_bytes());
    out
}

fn lock(registry: &Arc<Mutex<Registry>>) -> std::sync::MutexGuard<'_, Registry> {
    registry.lock().expect("registry poisoned")
}
