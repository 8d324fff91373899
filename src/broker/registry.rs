//! Broker-side registry: subsystems, bindings, KV caches, subscriptions and
//! in-flight event records.
//!
//! The registry is shared across per-connection dispatch tasks behind one
//! mutex; every method takes `&mut self` and returns quickly. Anything that
//! needs to await (forwarded transactions, event watchers) extracts the
//! client handles it needs and releases the lock first.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::magics::{EVENT_OK, EVENT_REJ};
use crate::proto::DdsMessage;
use crate::subsystem::SubsystemInfo;
use crate::txn::TransactionManager;

/// Broker-side handle on one configured client connection.
///
/// Cheap to clone; holds the connection's outgoing queue and its
/// transaction manager so registry callers can route without touching the
/// connection task.
#[derive(Debug, Clone)]
pub(crate) struct ClientHandle {
    /// Client UUID reported by `REQ_UUID`.
    pub uuid: Uuid,
    out_tx: UnboundedSender<Vec<u8>>,
    /// Transaction manager of the client's connection.
    pub txns: Arc<TransactionManager>,
}

impl ClientHandle {
    pub fn new(uuid: Uuid, out_tx: UnboundedSender<Vec<u8>>, txns: Arc<TransactionManager>) -> Self {
        Self { uuid, out_tx, txns }
    }

    /// Queue one DDS message on the client's connection.
    pub fn send(&self, msg: &DdsMessage) -> bool {
        match msg.encode() {
            Ok(bytes) => self.out_tx.send(bytes).is_ok(),
            Err(e) => {
                log::error!("[Broker] failed to encode message for {}: {e}", self.uuid);
                false
            }
        }
    }

    /// True once the connection's write side is gone.
    pub fn is_closed(&self) -> bool {
        self.out_tx.is_closed()
    }
}

/// One registered subsystem with its broker-side state.
#[derive(Debug)]
struct SubsystemEntry {
    info: SubsystemInfo,
    /// Bound owning connection; `None` after the owner disconnects.
    client: Option<ClientHandle>,
    /// Latest value per published key, populated by owner self-SETs.
    kv_store: HashMap<Vec<u8>, Vec<u8>>,
    /// Ordered, de-duplicated subscribers per key.
    subscribers: HashMap<Vec<u8>, Vec<ClientHandle>>,
}

impl SubsystemEntry {
    fn alive(&self) -> bool {
        self.client.as_ref().is_some_and(|c| !c.is_closed())
    }
}

/// Broker-side record of an event with outstanding targets.
#[derive(Debug)]
struct EventRecord {
    originator: Uuid,
    outstanding: usize,
}

/// Routing decision for a `SET_KV` request.
pub(crate) enum SetKvAction {
    /// Target unknown.
    NotFound,
    /// Owner wrote its own published KV; value cached, push to these
    /// subscribers.
    OwnerCached(Vec<ClientHandle>),
    /// Forward to the owner over this handle.
    Forward(ClientHandle),
    /// Target known but its client is gone.
    Disconnected,
}

/// Routing decision for a `GET_KV` request.
pub(crate) enum GetKvAction {
    NotFound,
    /// Broker-side cache hit.
    Cached(Vec<u8>),
    Forward(ClientHandle),
    Disconnected,
}

/// The broker registry. Protect with a single mutex.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    subsystems: HashMap<Uuid, SubsystemEntry>,
    /// Registration order, so name resolution is first-match.
    order: Vec<Uuid>,
    clients: HashMap<Uuid, ClientHandle>,
    /// `(requester client, target subsystem, key)` awaiting registration.
    pending_subs: Vec<(Uuid, Uuid, Vec<u8>)>,
    events: HashMap<Uuid, EventRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a configured connection by its client UUID.
    pub fn register_client(&mut self, handle: ClientHandle) {
        log::debug!("[Broker] client {} connected", handle.uuid);
        self.clients.insert(handle.uuid, handle);
    }

    /// Register (or re-register) a subsystem for client `c_uuid`.
    ///
    /// Creating a new entry installs any pending subscriptions for its
    /// UUID. Binding fails if a different, still-alive connection already
    /// owns the subsystem.
    pub fn register_subsystem(&mut self, c_uuid: Uuid, info: SubsystemInfo) -> bool {
        let Some(client) = self.clients.get(&c_uuid).cloned() else {
            log::warn!("[Broker] registration from unconfigured client {c_uuid}");
            return false;
        };

        if !self.subsystems.contains_key(&info.uuid) {
            log::info!("[Broker] registered subsystem: {}({})", info.name, info.uuid);
            self.subsystems.insert(info.uuid, SubsystemEntry {
                info: info.clone(),
                client: None,
                kv_store: HashMap::new(),
                subscribers: HashMap::new(),
            });
            self.order.push(info.uuid);
            self.install_pending_subscriptions(info.uuid);
        }

        let entry = self
            .subsystems
            .get_mut(&info.uuid)
            .expect("entry inserted above");
        if let Some(bound) = &entry.client {
            if !bound.is_closed() && bound.uuid != c_uuid {
                log::warn!(
                    "[Broker] refusing to bind {}({}) to {c_uuid}: owned by {}",
                    info.name,
                    info.uuid,
                    bound.uuid
                );
                return false;
            }
        }
        entry.info = info;
        entry.client = Some(client);
        true
    }

    fn install_pending_subscriptions(&mut self, target: Uuid) {
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_subs)
            .into_iter()
            .partition(|(_, t, _)| *t == target);
        self.pending_subs = rest;
        for (requester, target, key) in matching {
            self.subscribe(requester, target, key);
        }
    }

    /// Add a `(target, key)` subscription for a client; parked as pending if
    /// the target is not registered yet.
    pub fn subscribe(&mut self, requester: Uuid, target: Uuid, key: Vec<u8>) {
        let Some(handle) = self.clients.get(&requester).cloned() else {
            log::error!("[Broker] subscribe from unknown client {requester}");
            return;
        };
        let Some(entry) = self.subsystems.get_mut(&target) else {
            self.pending_subs.push((requester, target, key));
            return;
        };
        let subs = entry.subscribers.entry(key).or_default();
        if !subs.iter().any(|s| s.uuid == requester) {
            subs.push(handle);
        }
    }

    /// Route a `SET_KV`, caching owner self-writes.
    pub fn prepare_set_kv(
        &mut self,
        origin: Uuid,
        target: Uuid,
        key: &[u8],
        value: &[u8],
    ) -> SetKvAction {
        let Some(entry) = self.subsystems.get_mut(&target) else {
            return SetKvAction::NotFound;
        };
        if origin == target {
            entry.kv_store.insert(key.to_vec(), value.to_vec());
            // Prune closed subscribers before fan-out, never mid-iteration.
            let subs = entry.subscribers.entry(key.to_vec()).or_default();
            subs.retain(|s| !s.is_closed());
            return SetKvAction::OwnerCached(subs.clone());
        }
        match &entry.client {
            Some(c) if !c.is_closed() => SetKvAction::Forward(c.clone()),
            _ => SetKvAction::Disconnected,
        }
    }

    /// Route a `GET_KV`, serving cache hits locally.
    pub fn prepare_get_kv(&mut self, target: Uuid, key: &[u8]) -> GetKvAction {
        let Some(entry) = self.subsystems.get(&target) else {
            return GetKvAction::NotFound;
        };
        if let Some(value) = entry.kv_store.get(key) {
            return GetKvAction::Cached(value.clone());
        }
        match &entry.client {
            Some(c) if !c.is_closed() => GetKvAction::Forward(c.clone()),
            _ => GetKvAction::Disconnected,
        }
    }

    /// Route a request that always hits the owner (`GET_KV_DESC`).
    pub fn prepare_forward(&mut self, target: Uuid) -> GetKvAction {
        let Some(entry) = self.subsystems.get(&target) else {
            return GetKvAction::NotFound;
        };
        match &entry.client {
            Some(c) if !c.is_closed() => GetKvAction::Forward(c.clone()),
            _ => GetKvAction::Disconnected,
        }
    }

    /// Resolve `CALL_EVENT` targets.
    ///
    /// An empty list fans out to every registered subsystem, including the
    /// originator. Returns `Err(())` if an enumerated target is unknown;
    /// each returned handle is `None` when the target is unreachable.
    pub fn prepare_call_event(
        &self,
        targets: &[Uuid],
    ) -> Result<Vec<(Uuid, Option<ClientHandle>)>, ()> {
        let uuids: Vec<Uuid> = if targets.is_empty() {
            self.order.clone()
        } else {
            for t in targets {
                if !self.subsystems.contains_key(t) {
                    return Err(());
                }
            }
            targets.to_vec()
        };
        Ok(uuids
            .into_iter()
            .map(|uuid| {
                let handle = self
                    .subsystems
                    .get(&uuid)
                    .and_then(|e| e.client.clone())
                    .filter(|c| !c.is_closed());
                (uuid, handle)
            })
            .collect())
    }

    /// Remember an event with `outstanding` reachable targets.
    pub fn record_event(&mut self, event: Uuid, originator: Uuid, outstanding: usize) {
        if outstanding > 0 {
            self.events.insert(event, EventRecord { originator, outstanding });
        }
    }

    /// Route one per-target return to the originator's connection.
    ///
    /// Terminal statuses decrement the outstanding count; the record is
    /// dropped once every target has replied.
    pub fn event_return_route(&mut self, event: Uuid, status: u8) -> Option<(Uuid, ClientHandle)> {
        let record = self.events.get_mut(&event)?;
        let originator = record.originator;
        if status == EVENT_OK || status == EVENT_REJ {
            record.outstanding = record.outstanding.saturating_sub(1);
            if record.outstanding == 0 {
                self.events.remove(&event);
            }
        }
        let handle = self.subsystems.get(&originator)?.client.clone()?;
        Some((originator, handle))
    }

    /// First registered subsystem with this name.
    pub fn resolve(&self, name: &str) -> Option<Uuid> {
        self.order
            .iter()
            .find(|uuid| self.subsystems.get(uuid).is_some_and(|e| e.info.name == name))
            .copied()
    }

    /// Descriptor snapshot for one subsystem.
    pub fn subsystem_info(&self, uuid: Uuid) -> Option<SubsystemInfo> {
        self.subsystems.get(&uuid).map(|e| e.info.clone())
    }

    /// Full registry snapshot message.
    pub fn snapshot(&self) -> DdsMessage {
        DdsMessage::SystemUpd {
            entries: self
                .order
                .iter()
                .filter_map(|uuid| self.subsystems.get(uuid))
                .map(|e| (e.info.clone(), e.alive()))
                .collect(),
        }
    }

    /// Push the current snapshot to every connected client.
    pub fn broadcast_system_upd(&mut self) {
        let snapshot = self.snapshot();
        for client in self.clients.values() {
            client.send(&snapshot);
        }
    }

    /// Handle a connection close for client `c_uuid`: unbind its
    /// subsystems and delete the temporary ones.
    pub fn disconnect_client(&mut self, c_uuid: Uuid) {
        self.clients.remove(&c_uuid);
        let mut removed = Vec::new();
        for (uuid, entry) in &mut self.subsystems {
            if entry.client.as_ref().is_some_and(|c| c.uuid == c_uuid) {
                log::info!("[Broker] subsystem {} has disconnected", entry.info.name);
                entry.client = None;
                if entry.info.temporary {
                    removed.push(*uuid);
                }
            }
        }
        for uuid in removed {
            self.subsystems.remove(&uuid);
            self.order.retain(|u| *u != uuid);
        }
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}
