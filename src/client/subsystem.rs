//! Client-side registered subsystem: provider maps and event routing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use anyhow::{Context, Result};
use uuid::Uuid;

use crate::magics::{
    EVENT_REJ, E_DOES_NOT_HANDLE_EVENT, TRANSACT_GET_KV, TRANSACT_GET_KV_DESC, TRANSACT_SET_KV,
    TRANSOP_STATE_REJ,
};
use crate::seg;
use crate::subsystem::{KvDescriptor, SubsystemInfo};
use crate::txn::IncomingTransaction;

use super::event::{
    EventHandler, EventHandlerInner, EventProvider, EventProviderInner, InProgressEvent,
    IncomingEventHandle,
};
use super::property::{
    KvHandler, KvHandlerInner, KvProvider, LocalProperty, LocalPropertyInner, RemoteProperty,
    RemotePropertyInner,
};
use super::{op_payload, send_registration, ClientInner};

/// Upper bound on buffered event returns that raced ahead of their
/// `CALL_EVENT` acknowledgement.
const MAX_PENDING_EVENT_RETURNS: usize = 256;

/// Shared state of one locally declared subsystem.
pub(crate) struct SubsystemInner {
    pub(crate) uuid: Uuid,
    pub(crate) name: String,
    pub(crate) temporary: bool,
    pub(crate) client: Weak<ClientInner>,
    kv_providers: Mutex<HashMap<Vec<u8>, KvProvider>>,
    event_providers: Mutex<HashMap<Vec<u8>, Arc<EventProviderInner>>>,
    event_handlers: Mutex<HashMap<Vec<u8>, Arc<EventHandlerInner>>>,
    /// Events this subsystem called, by event UUID.
    in_progress: Mutex<HashMap<Uuid, InProgressEvent>>,
    /// Returns that arrived before the call acknowledgement seeded the
    /// in-progress record.
    pending_returns: Mutex<Vec<(Uuid, Uuid, u8, Vec<u8>)>>,
    /// Open incoming event transactions, awaiting a handler `ret`/`fail`.
    incoming_events: Mutex<HashMap<Uuid, IncomingTransaction>>,
}

impl SubsystemInner {
    pub(crate) fn new(uuid: Uuid, name: String, temporary: bool, client: Weak<ClientInner>) -> Self {
        Self {
            uuid,
            name,
            temporary,
            client,
            kv_providers: Mutex::new(HashMap::new()),
            event_providers: Mutex::new(HashMap::new()),
            event_handlers: Mutex::new(HashMap::new()),
            in_progress: Mutex::new(HashMap::new()),
            pending_returns: Mutex::new(Vec::new()),
            incoming_events: Mutex::new(HashMap::new()),
        }
    }

    /// Rebuild the full `SubsystemInfo` from the current provider set.
    pub(crate) fn build_info(&self) -> Result<SubsystemInfo> {
        let mut info = SubsystemInfo::new(self.uuid, self.name.clone(), self.temporary);
        info.kvs = self
            .kv_providers
            .lock()
            .expect("kv providers poisoned")
            .values()
            .map(KvProvider::describe)
            .collect();
        info.provided_events = self
            .event_providers
            .lock()
            .expect("event providers poisoned")
            .values()
            .map(|p| p.describe())
            .collect();
        info.handled_events = self
            .event_handlers
            .lock()
            .expect("event handlers poisoned")
            .values()
            .map(|h| h.describe())
            .collect();
        Ok(info)
    }

    /// Re-send the registration after any descriptor change so the broker
    /// snapshot and consuming clients see the new shape.
    pub(crate) fn invalidate(self: &Arc<Self>) {
        if let Some(client) = self.client.upgrade() {
            send_registration(&client, self);
        }
    }

    pub(crate) fn insert_kv_provider(self: &Arc<Self>, key: Vec<u8>, provider: KvProvider) {
        self.kv_providers
            .lock()
            .expect("kv providers poisoned")
            .insert(key, provider);
        self.invalidate();
    }

    pub(crate) fn kv_remote_get(&self, requester: Uuid, key: &[u8]) -> (u8, Vec<u8>) {
        match self.kv_providers.lock().expect("kv providers poisoned").get(key) {
            Some(provider) => provider.remote_get(requester),
            None => (TRANSOP_STATE_REJ, b"Specified value not found.".to_vec()),
        }
    }

    pub(crate) fn kv_remote_set(&self, requester: Uuid, key: &[u8], value: &[u8]) -> (u8, Vec<u8>) {
        match self.kv_providers.lock().expect("kv providers poisoned").get(key) {
            Some(provider) => provider.remote_set(requester, value),
            None => (TRANSOP_STATE_REJ, b"Specified value not found.".to_vec()),
        }
    }

    pub(crate) fn kv_descriptor(&self, key: &[u8]) -> (u8, Vec<u8>) {
        let descriptor = self
            .kv_providers
            .lock()
            .expect("kv providers poisoned")
            .get(key)
            .map(KvProvider::describe);
        match descriptor.map(|d| d.encode()) {
            Some(Ok(encoded)) => (crate::magics::TRANSOP_STATE_OK, encoded),
            Some(Err(e)) => (TRANSOP_STATE_REJ, format!("descriptor encoding failed: {e}").into_bytes()),
            None => (
                TRANSOP_STATE_REJ,
                b"Specified subsystem does not contain specified key.".to_vec(),
            ),
        }
    }

    /// Route an incoming `RCALL_EVENT` to the named handler.
    pub(crate) fn incoming_event(
        self: &Arc<Self>,
        event: Uuid,
        t: IncomingTransaction,
        sender: Uuid,
        name: &[u8],
        param: &[u8],
    ) {
        let handler = self
            .event_handlers
            .lock()
            .expect("event handlers poisoned")
            .get(name)
            .cloned();
        let Some(handler) = handler else {
            t.ret(&event_reject(E_DOES_NOT_HANDLE_EVENT));
            return;
        };
        let Some(callback) = handler.callback() else {
            t.ret(&event_reject(E_DOES_NOT_HANDLE_EVENT));
            return;
        };
        let parsed = match handler.param_ty().parse(param) {
            Ok(value) => value,
            Err(_) => {
                t.ret(&event_reject("Value is not valid for property type"));
                return;
            }
        };

        t.ack();
        self.incoming_events
            .lock()
            .expect("incoming events poisoned")
            .insert(event, t);
        let handle = IncomingEventHandle::new(event, handler.return_ty(), Arc::downgrade(self));
        callback(sender, parsed, handle);
    }

    /// Finish an incoming event: `[status][value]` terminates the broker's
    /// forwarded transaction.
    pub(crate) fn send_event_return(&self, event: Uuid, status: u8, value: &[u8]) {
        let t = self
            .incoming_events
            .lock()
            .expect("incoming events poisoned")
            .remove(&event);
        match t {
            Some(t) => {
                let mut body = Vec::with_capacity(1 + value.len());
                body.push(status);
                body.extend_from_slice(value);
                t.ret(&body);
            }
            None => {
                log::warn!("[Client] return for an event this subsystem did not receive: {event}");
            }
        }
    }

    /// Send handler progress without terminating the event.
    pub(crate) fn feedback_event(&self, event: Uuid, data: &[u8]) {
        if let Some(t) = self
            .incoming_events
            .lock()
            .expect("incoming events poisoned")
            .get(&event)
        {
            t.feedback(data);
        }
    }

    /// Track an event this subsystem called, draining any returns that
    /// arrived before the call acknowledgement.
    pub(crate) fn register_in_progress(&self, event: Uuid, handle: InProgressEvent) {
        self.in_progress
            .lock()
            .expect("in-progress events poisoned")
            .insert(event, handle.clone());
        let buffered: Vec<(Uuid, Uuid, u8, Vec<u8>)> = {
            let mut pending = self.pending_returns.lock().expect("pending returns poisoned");
            let (matching, rest): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *pending).into_iter().partition(|(e, ..)| *e == event);
            *pending = rest;
            matching
        };
        for (_, target, status, value) in buffered {
            handle.set_result(target, status, &value);
        }
    }

    /// Route one `EVENT_RET` to the matching in-progress event.
    pub(crate) fn on_event_return(&self, event: Uuid, target: Uuid, status: u8, value: &[u8]) {
        let handle = self
            .in_progress
            .lock()
            .expect("in-progress events poisoned")
            .get(&event)
            .cloned();
        match handle {
            Some(handle) => handle.set_result(target, status, value),
            None => {
                let mut pending = self.pending_returns.lock().expect("pending returns poisoned");
                if pending.len() >= MAX_PENDING_EVENT_RETURNS {
                    pending.remove(0);
                }
                pending.push((event, target, status, value.to_vec()));
            }
        }
    }
}

fn event_reject(reason: &str) -> Vec<u8> {
    let mut body = vec![EVENT_REJ];
    body.extend_from_slice(reason.as_bytes());
    body
}

/// Public handle on a subsystem registered by this client.
#[derive(Clone)]
pub struct RegisteredSubsystem {
    inner: Arc<SubsystemInner>,
}

impl std::fmt::Debug for RegisteredSubsystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredSubsystem")
            .field("uuid", &self.inner.uuid)
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl RegisteredSubsystem {
    pub(crate) fn from_inner(inner: Arc<SubsystemInner>) -> Self {
        Self { inner }
    }

    /// Subsystem UUID.
    pub fn uuid(&self) -> Uuid {
        self.inner.uuid
    }

    /// Subsystem name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current descriptor snapshot.
    ///
    /// # Errors
    ///
    /// Errors if a descriptor fails to encode.
    pub fn info(&self) -> Result<SubsystemInfo> {
        self.inner.build_info()
    }

    /// Declare a stored local property.
    ///
    /// `publish` makes writes broadcast through the broker cache (and
    /// forces the slot remotely read-only).
    pub fn add_property(
        &self,
        key: &[u8],
        readable: bool,
        writable: bool,
        publish: bool,
    ) -> LocalProperty {
        let inner = Arc::new(LocalPropertyInner::new(
            key.to_vec(),
            readable,
            writable,
            publish,
            Arc::downgrade(&self.inner),
        ));
        self.inner
            .insert_kv_provider(key.to_vec(), KvProvider::Local(Arc::clone(&inner)));
        LocalProperty::from_inner(inner)
    }

    /// Declare a callback-backed KV slot.
    pub fn add_kv_handler(&self, key: &[u8]) -> KvHandler {
        let inner = Arc::new(KvHandlerInner::new(key.to_vec(), Arc::downgrade(&self.inner)));
        self.inner
            .insert_kv_provider(key.to_vec(), KvProvider::Handler(Arc::clone(&inner)));
        KvHandler::from_inner(inner)
    }

    /// Build a remote-KV proxy from a known descriptor.
    ///
    /// Published descriptors install a subscription that is replayed on
    /// every reconnect.
    pub fn add_remote_kv(&self, target: Uuid, descriptor: &KvDescriptor) -> RemoteProperty {
        let inner = Arc::new(RemotePropertyInner::from_descriptor(
            descriptor,
            target,
            Arc::downgrade(&self.inner),
        ));
        if descriptor.published {
            if let Some(client) = self.inner.client.upgrade() {
                client.add_active_subscriber(&inner);
            }
        }
        RemoteProperty::from_inner(inner)
    }

    /// Fetch a remote KV's descriptor and build its proxy.
    ///
    /// # Errors
    ///
    /// Errors if the descriptor fetch fails.
    pub async fn open_remote_kv(&self, target: Uuid, key: &[u8]) -> Result<RemoteProperty> {
        let descriptor = self.get_kv_desc(target, key).await?;
        Ok(self.add_remote_kv(target, &descriptor))
    }

    /// Declare an event this subsystem can call.
    pub fn add_event_provider(&self, name: &[u8]) -> EventProvider {
        let inner = Arc::new(EventProviderInner::new(name.to_vec(), Arc::downgrade(&self.inner)));
        self.inner
            .event_providers
            .lock()
            .expect("event providers poisoned")
            .insert(name.to_vec(), Arc::clone(&inner));
        self.inner.invalidate();
        EventProvider::from_inner(inner)
    }

    /// Declare an event this subsystem implements.
    pub fn add_event_handler(&self, name: &[u8]) -> EventHandler {
        let inner = Arc::new(EventHandlerInner::new(name.to_vec(), Arc::downgrade(&self.inner)));
        self.inner
            .event_handlers
            .lock()
            .expect("event handlers poisoned")
            .insert(name.to_vec(), Arc::clone(&inner));
        self.inner.invalidate();
        EventHandler::from_inner(inner)
    }

    /// Remote GET against another subsystem, raw value bytes.
    ///
    /// # Errors
    ///
    /// Errors on rejection, timeout, or when the client is not ready.
    pub async fn get_kv(&self, target: Uuid, key: &[u8]) -> Result<Vec<u8>> {
        let client = self.client()?;
        let body = seg::encode(&[
            target.as_bytes().as_slice(),
            self.inner.uuid.as_bytes().as_slice(),
            key,
        ])?;
        client.transop_await(op_payload(TRANSACT_GET_KV, &body)).await
    }

    /// Remote SET against another subsystem.
    ///
    /// # Errors
    ///
    /// Errors on rejection, timeout, or when the client is not ready.
    pub async fn set_kv(&self, target: Uuid, key: &[u8], value: &[u8]) -> Result<()> {
        let client = self.client()?;
        let body = seg::encode(&[
            target.as_bytes().as_slice(),
            self.inner.uuid.as_bytes().as_slice(),
            key,
            value,
        ])?;
        client.transop_await(op_payload(TRANSACT_SET_KV, &body)).await?;
        Ok(())
    }

    /// Fetch a remote KV descriptor (never broker-cached).
    ///
    /// # Errors
    ///
    /// Errors on rejection, timeout, or when the client is not ready.
    pub async fn get_kv_desc(&self, target: Uuid, key: &[u8]) -> Result<KvDescriptor> {
        let client = self.client()?;
        let body = seg::encode(&[
            target.as_bytes().as_slice(),
            self.inner.uuid.as_bytes().as_slice(),
            key,
        ])?;
        let value = client.transop_await(op_payload(TRANSACT_GET_KV_DESC, &body)).await?;
        KvDescriptor::decode(&value)
    }

    fn client(&self) -> Result<Arc<ClientInner>> {
        self.inner.client.upgrade().context("client runtime is gone")
    }

    #[cfg(test)]
    pub(crate) fn inner_for_tests(&self) -> &Arc<SubsystemInner> {
        &self.inner
    }
}
