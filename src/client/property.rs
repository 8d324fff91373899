//! KV providers and proxies.
//!
//! Three shapes sit behind a subsystem's KV map:
//! - [`LocalProperty`] — a stored, typed value; optionally *published*
//!   (writes broadcast through the broker cache to subscribers).
//! - [`KvHandler`] — no stored value; `on_get`/`on_set` callbacks run
//!   synchronously in the connection's dispatch task.
//! - [`RemoteProperty`] — a proxy for another subsystem's KV, either
//!   subscription-cached or read on demand with a bounded wait.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{bail, Result};
use uuid::Uuid;

use crate::magics::{TRANSACT_GET_KV, TRANSACT_SET_KV, TRANSOP_STATE_OK, TRANSOP_STATE_REJ};
use crate::seg;
use crate::subsystem::KvDescriptor;
use crate::txn::TxnState;
use crate::types::{PropertyValue, TypeSpecifier};

use super::subsystem::SubsystemInner;
use super::op_payload;

/// Bounded wait for an on-demand (non-subscribed) remote read.
const ON_DEMAND_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Callback invoked with each accepted new value.
pub type NewDataCallback = Arc<dyn Fn(PropertyValue) + Send + Sync>;
/// `on_get` callback: requester → value or rejection reason.
pub type GetCallback = Arc<dyn Fn(Uuid) -> Result<PropertyValue, String> + Send + Sync>;
/// `on_set` callback: (requester, value) → accept or rejection reason.
pub type SetCallback = Arc<dyn Fn(Uuid, PropertyValue) -> Result<(), String> + Send + Sync>;

/// One entry in a subsystem's KV provider map.
pub(crate) enum KvProvider {
    Local(Arc<LocalPropertyInner>),
    Handler(Arc<KvHandlerInner>),
}

impl KvProvider {
    pub(crate) fn remote_get(&self, requester: Uuid) -> (u8, Vec<u8>) {
        match self {
            KvProvider::Local(p) => p.remote_get(),
            KvProvider::Handler(h) => h.remote_get(requester),
        }
    }

    pub(crate) fn remote_set(&self, requester: Uuid, value: &[u8]) -> (u8, Vec<u8>) {
        match self {
            KvProvider::Local(p) => p.remote_set(value),
            KvProvider::Handler(h) => h.remote_set(requester, value),
        }
    }

    pub(crate) fn describe(&self) -> KvDescriptor {
        match self {
            KvProvider::Local(p) => p.describe(),
            KvProvider::Handler(h) => h.describe(),
        }
    }
}

// ─── LocalProperty ─────────────────────────────────────────────────────────

pub(crate) struct LocalPropertyInner {
    key: Vec<u8>,
    readable: bool,
    /// Effective writability; published slots are remotely read-only.
    writable: bool,
    publish: bool,
    ty: Mutex<TypeSpecifier>,
    value: Mutex<Option<Vec<u8>>>,
    on_new_data: Mutex<Option<NewDataCallback>>,
    subsystem: Weak<SubsystemInner>,
}

impl LocalPropertyInner {
    pub(crate) fn new(
        key: Vec<u8>,
        readable: bool,
        writable: bool,
        publish: bool,
        subsystem: Weak<SubsystemInner>,
    ) -> Self {
        Self {
            key,
            readable,
            // Published values are owner-originated only.
            writable: writable && !publish,
            publish,
            ty: Mutex::new(TypeSpecifier::Bytes),
            value: Mutex::new(None),
            on_new_data: Mutex::new(None),
            subsystem,
        }
    }

    fn ty(&self) -> TypeSpecifier {
        self.ty.lock().expect("type poisoned").clone()
    }

    fn remote_set(&self, value: &[u8]) -> (u8, Vec<u8>) {
        if !self.writable {
            return (TRANSOP_STATE_REJ, b"Value is read-only".to_vec());
        }
        let parsed = match self.ty().parse(value) {
            Ok(parsed) => parsed,
            Err(_) => return (TRANSOP_STATE_REJ, b"Value is not valid for property type".to_vec()),
        };
        if let Some(callback) = self.on_new_data.lock().expect("callback poisoned").clone() {
            callback(parsed);
        }
        *self.value.lock().expect("value poisoned") = Some(value.to_vec());
        (TRANSOP_STATE_OK, Vec::new())
    }

    fn remote_get(&self) -> (u8, Vec<u8>) {
        if !self.readable {
            return (TRANSOP_STATE_REJ, b"Value is write-only".to_vec());
        }
        match &*self.value.lock().expect("value poisoned") {
            Some(value) => (TRANSOP_STATE_OK, value.clone()),
            None => (TRANSOP_STATE_REJ, b"Value has not been set yet!".to_vec()),
        }
    }

    fn describe(&self) -> KvDescriptor {
        KvDescriptor {
            ty: self.ty(),
            key: self.key.clone(),
            published: self.publish,
            readable: self.readable,
            writable: self.writable,
        }
    }
}

/// Handle on a stored local property.
#[derive(Clone)]
pub struct LocalProperty {
    inner: Arc<LocalPropertyInner>,
}

impl std::fmt::Debug for LocalProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProperty").field("key", &self.inner.key).finish_non_exhaustive()
    }
}

impl LocalProperty {
    pub(crate) fn from_inner(inner: Arc<LocalPropertyInner>) -> Self {
        Self { inner }
    }

    /// Key bytes.
    pub fn key(&self) -> &[u8] {
        &self.inner.key
    }

    /// Change the declared type; re-registers the subsystem.
    pub fn set_type(&self, ty: TypeSpecifier) {
        *self.inner.ty.lock().expect("type poisoned") = ty;
        if let Some(sub) = self.inner.subsystem.upgrade() {
            sub.invalidate();
        }
    }

    /// Write a typed value.
    ///
    /// For published slots the write is also sent to the broker, which
    /// caches it and fans it out to subscribers.
    ///
    /// # Errors
    ///
    /// Errors if the value violates the declared type (before any wire
    /// activity).
    pub fn write(&self, value: &PropertyValue) -> Result<()> {
        let encoded = self.inner.ty().encode(value)?;
        *self.inner.value.lock().expect("value poisoned") = Some(encoded.clone());

        if self.inner.publish {
            let Some(sub) = self.inner.subsystem.upgrade() else { return Ok(()) };
            let Some(client) = sub.client.upgrade() else { return Ok(()) };
            let body = seg::encode(&[
                sub.uuid.as_bytes().as_slice(),
                sub.uuid.as_bytes().as_slice(),
                self.inner.key.as_slice(),
                encoded.as_slice(),
            ])?;
            // Fire and forget; a lost connection is recovered by replaying
            // the next write after reconnect.
            let _ = client.transop(&op_payload(TRANSACT_SET_KV, &body));
        }
        Ok(())
    }

    /// Read back the stored value.
    ///
    /// # Errors
    ///
    /// Errors if the stored bytes no longer parse under the declared type.
    pub fn read(&self) -> Result<Option<PropertyValue>> {
        match &*self.inner.value.lock().expect("value poisoned") {
            Some(raw) => Ok(Some(self.inner.ty().parse(raw)?)),
            None => Ok(None),
        }
    }

    /// Invoke `callback` whenever a remote SET stores a new value.
    pub fn on_new_data(&self, callback: impl Fn(PropertyValue) + Send + Sync + 'static) {
        *self.inner.on_new_data.lock().expect("callback poisoned") = Some(Arc::new(callback));
    }
}

// ─── KvHandler ─────────────────────────────────────────────────────────────

pub(crate) struct KvHandlerInner {
    key: Vec<u8>,
    ty: Mutex<TypeSpecifier>,
    on_get: Mutex<Option<GetCallback>>,
    on_set: Mutex<Option<SetCallback>>,
    subsystem: Weak<SubsystemInner>,
}

impl KvHandlerInner {
    pub(crate) fn new(key: Vec<u8>, subsystem: Weak<SubsystemInner>) -> Self {
        Self {
            key,
            ty: Mutex::new(TypeSpecifier::Bytes),
            on_get: Mutex::new(None),
            on_set: Mutex::new(None),
            subsystem,
        }
    }

    fn ty(&self) -> TypeSpecifier {
        self.ty.lock().expect("type poisoned").clone()
    }

    fn remote_get(&self, requester: Uuid) -> (u8, Vec<u8>) {
        let Some(callback) = self.on_get.lock().expect("on_get poisoned").clone() else {
            return (TRANSOP_STATE_REJ, b"Value is write-only".to_vec());
        };
        match callback(requester) {
            Ok(value) => match self.ty().encode(&value) {
                Ok(encoded) => (TRANSOP_STATE_OK, encoded),
                Err(_) => (
                    TRANSOP_STATE_REJ,
                    b"Internal error, handler returned invalid data!".to_vec(),
                ),
            },
            Err(reason) => (TRANSOP_STATE_REJ, reason.into_bytes()),
        }
    }

    fn remote_set(&self, requester: Uuid, value: &[u8]) -> (u8, Vec<u8>) {
        let Some(callback) = self.on_set.lock().expect("on_set poisoned").clone() else {
            return (TRANSOP_STATE_REJ, b"Value is read-only".to_vec());
        };
        let parsed = match self.ty().parse(value) {
            Ok(parsed) => parsed,
            Err(_) => return (TRANSOP_STATE_REJ, b"Value is not valid for property type".to_vec()),
        };
        match callback(requester, parsed) {
            Ok(()) => (TRANSOP_STATE_OK, Vec::new()),
            Err(reason) => (TRANSOP_STATE_REJ, reason.into_bytes()),
        }
    }

    fn describe(&self) -> KvDescriptor {
        KvDescriptor {
            ty: self.ty(),
            key: self.key.clone(),
            published: false,
            readable: self.on_get.lock().expect("on_get poisoned").is_some(),
            writable: self.on_set.lock().expect("on_set poisoned").is_some(),
        }
    }
}

/// Handle on a callback-backed KV slot.
#[derive(Clone)]
pub struct KvHandler {
    inner: Arc<KvHandlerInner>,
}

impl std::fmt::Debug for KvHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvHandler").field("key", &self.inner.key).finish_non_exhaustive()
    }
}

impl KvHandler {
    pub(crate) fn from_inner(inner: Arc<KvHandlerInner>) -> Self {
        Self { inner }
    }

    /// Key bytes.
    pub fn key(&self) -> &[u8] {
        &self.inner.key
    }

    /// Change the declared type; re-registers the subsystem.
    pub fn set_type(&self, ty: TypeSpecifier) {
        *self.inner.ty.lock().expect("type poisoned") = ty;
        self.invalidate();
    }

    /// Serve remote GETs; also marks the slot readable.
    pub fn on_get(
        &self,
        callback: impl Fn(Uuid) -> Result<PropertyValue, String> + Send + Sync + 'static,
    ) {
        *self.inner.on_get.lock().expect("on_get poisoned") = Some(Arc::new(callback));
        self.invalidate();
    }

    /// Serve remote SETs; also marks the slot writable.
    pub fn on_set(
        &self,
        callback: impl Fn(Uuid, PropertyValue) -> Result<(), String> + Send + Sync + 'static,
    ) {
        *self.inner.on_set.lock().expect("on_set poisoned") = Some(Arc::new(callback));
        self.invalidate();
    }

    fn invalidate(&self) {
        if let Some(sub) = self.inner.subsystem.upgrade() {
            sub.invalidate();
        }
    }
}

// ─── RemoteProperty ────────────────────────────────────────────────────────

pub(crate) struct RemotePropertyInner {
    pub(crate) key: Vec<u8>,
    pub(crate) remote: Uuid,
    subscribe: bool,
    readable: bool,
    writable: bool,
    ty: Mutex<TypeSpecifier>,
    value: Mutex<Option<Vec<u8>>>,
    on_new_data: Mutex<Option<NewDataCallback>>,
    subsystem: Weak<SubsystemInner>,
}

impl RemotePropertyInner {
    pub(crate) fn from_descriptor(
        descriptor: &KvDescriptor,
        remote: Uuid,
        subsystem: Weak<SubsystemInner>,
    ) -> Self {
        Self {
            key: descriptor.key.clone(),
            remote,
            subscribe: descriptor.published,
            readable: descriptor.readable,
            writable: descriptor.writable,
            ty: Mutex::new(descriptor.ty.clone()),
            value: Mutex::new(None),
            on_new_data: Mutex::new(None),
            subsystem,
        }
    }

    fn ty(&self) -> TypeSpecifier {
        self.ty.lock().expect("type poisoned").clone()
    }

    /// Accept one `SUBSCRIBED_UPD` value.
    pub(crate) fn remote_update(&self, value: &[u8]) {
        let parsed = match self.ty().parse(value) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::debug!("[Client] dropping mistyped subscription update: {e}");
                return;
            }
        };
        *self.value.lock().expect("value poisoned") = Some(value.to_vec());
        if let Some(callback) = self.on_new_data.lock().expect("callback poisoned").clone() {
            callback(parsed);
        }
    }
}

/// Proxy for a KV owned by another subsystem.
#[derive(Clone)]
pub struct RemoteProperty {
    inner: Arc<RemotePropertyInner>,
}

impl std::fmt::Debug for RemoteProperty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProperty")
            .field("remote", &self.inner.remote)
            .field("key", &self.inner.key)
            .finish_non_exhaustive()
    }
}

impl RemoteProperty {
    pub(crate) fn from_inner(inner: Arc<RemotePropertyInner>) -> Self {
        Self { inner }
    }

    /// Key bytes.
    pub fn key(&self) -> &[u8] {
        &self.inner.key
    }

    /// Owning subsystem.
    pub fn remote(&self) -> Uuid {
        self.inner.remote
    }

    /// True when backed by a broker subscription rather than on-demand
    /// reads.
    pub fn is_cached(&self) -> bool {
        self.inner.subscribe
    }

    /// Override the declared type.
    pub fn set_type(&self, ty: TypeSpecifier) {
        *self.inner.ty.lock().expect("type poisoned") = ty;
    }

    /// Invoke `callback` on every accepted subscription update.
    pub fn on_new_data(&self, callback: impl Fn(PropertyValue) + Send + Sync + 'static) {
        *self.inner.on_new_data.lock().expect("callback poisoned") = Some(Arc::new(callback));
    }

    /// Read the value.
    ///
    /// Subscription-backed proxies return the cached value (`None` until
    /// the first update arrives). Others issue a `GET_KV` and wait up to
    /// one second; failures surface as `None`.
    ///
    /// # Errors
    ///
    /// Errors if the proxy is write-only or the received bytes violate the
    /// declared type.
    pub async fn read(&self) -> Result<Option<PropertyValue>> {
        if !self.inner.readable {
            bail!("Property is write-only");
        }
        let ty = self.inner.ty();
        let cached = self.inner.value.lock().expect("value poisoned").clone();
        if let Some(raw) = cached {
            return Ok(Some(ty.parse(&raw)?));
        }
        if self.inner.subscribe {
            return Ok(None);
        }

        let Some(sub) = self.inner.subsystem.upgrade() else { return Ok(None) };
        let Some(client) = sub.client.upgrade() else { return Ok(None) };
        let body = seg::encode(&[
            self.inner.remote.as_bytes().as_slice(),
            sub.uuid.as_bytes().as_slice(),
            self.inner.key.as_slice(),
        ])?;
        let Ok(out) = client.transop(&op_payload(TRANSACT_GET_KV, &body)) else {
            return Ok(None);
        };
        match tokio::time::timeout(ON_DEMAND_READ_TIMEOUT, out.wait()).await {
            Ok(TxnState::Returned) => {
                let result = out.result().unwrap_or_default();
                match result.split_first() {
                    Some((&TRANSOP_STATE_OK, value)) => Ok(Some(ty.parse(value)?)),
                    _ => Ok(None),
                }
            }
            _ => Ok(None),
        }
    }

    /// Write a typed value to the remote owner.
    ///
    /// # Errors
    ///
    /// Errors if the proxy is read-only, the value violates the declared
    /// type, or the client is not ready.
    pub fn write(&self, value: &PropertyValue) -> Result<()> {
        if !self.inner.writable {
            bail!("Property is read-only");
        }
        let encoded = self.inner.ty().encode(value)?;
        let sub = self.inner.subsystem.upgrade().ok_or_else(|| anyhow::anyhow!("subsystem is gone"))?;
        let client = sub.client.upgrade().ok_or_else(|| anyhow::anyhow!("client runtime is gone"))?;
        let body = seg::encode(&[
            self.inner.remote.as_bytes().as_slice(),
            sub.uuid.as_bytes().as_slice(),
            self.inner.key.as_slice(),
            encoded.as_slice(),
        ])?;
        client.transop(&op_payload(TRANSACT_SET_KV, &body))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::DdsClient;
    use crate::config::ClientConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A client pointed at a dead address: never connects, but its local
    /// subsystem state is fully usable.
    fn offline_client() -> DdsClient {
        let config = ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 9, // discard port, nothing listens in tests
            reconnect_delay: Duration::from_secs(3600),
            ..ClientConfig::default()
        };
        DdsClient::connect(Uuid::new_v4(), config)
    }

    #[tokio::test]
    async fn local_property_remote_set_respects_flags_and_type() {
        let client = offline_client();
        let sub = client.register_subsystem("unit", Uuid::new_v4(), false);
        let prop = sub.add_property(b"limit", true, true, false);
        prop.set_type(TypeSpecifier::int_range(0, 10));

        let requester = Uuid::new_v4();
        let (state, _) = sub.inner_for_tests().kv_remote_set(requester, b"limit", &5i32.to_be_bytes());
        assert_eq!(state, TRANSOP_STATE_OK);

        let (state, reason) =
            sub.inner_for_tests().kv_remote_set(requester, b"limit", &42i32.to_be_bytes());
        assert_eq!(state, TRANSOP_STATE_REJ);
        assert_eq!(reason, b"Value is not valid for property type");

        assert_eq!(prop.read().unwrap(), Some(PropertyValue::Int(5)));
        client.close();
    }

    #[tokio::test]
    async fn local_property_remote_get_requires_a_value() {
        let client = offline_client();
        let sub = client.register_subsystem("unit", Uuid::new_v4(), false);
        let prop = sub.add_property(b"slot", true, true, false);

        let (state, reason) = sub.inner_for_tests().kv_remote_get(Uuid::new_v4(), b"slot");
        assert_eq!(state, TRANSOP_STATE_REJ);
        assert_eq!(reason, b"Value has not been set yet!");

        prop.write(&PropertyValue::Bytes(b"v".to_vec())).unwrap();
        let (state, value) = sub.inner_for_tests().kv_remote_get(Uuid::new_v4(), b"slot");
        assert_eq!(state, TRANSOP_STATE_OK);
        assert_eq!(value, b"v");
        client.close();
    }

    #[tokio::test]
    async fn published_property_is_remotely_read_only() {
        let client = offline_client();
        let sub = client.register_subsystem("unit", Uuid::new_v4(), false);
        let prop = sub.add_property(b"published", true, true, true);

        let (state, reason) = sub.inner_for_tests().kv_remote_set(Uuid::new_v4(), b"published", b"x");
        assert_eq!(state, TRANSOP_STATE_REJ);
        assert_eq!(reason, b"Value is read-only");

        let desc = sub.info().unwrap().kvs.into_iter().next().unwrap();
        assert!(desc.published);
        assert!(!desc.writable);
        drop(prop);
        client.close();
    }

    #[tokio::test]
    async fn kv_handler_capabilities_follow_callbacks() {
        let client = offline_client();
        let sub = client.register_subsystem("unit", Uuid::new_v4(), false);
        let handler = sub.add_kv_handler(b"h");

        // No callbacks yet: both directions rejected, descriptor says so.
        let (state, reason) = sub.inner_for_tests().kv_remote_get(Uuid::new_v4(), b"h");
        assert_eq!(state, TRANSOP_STATE_REJ);
        assert_eq!(reason, b"Value is write-only");
        let desc = sub.info().unwrap().kvs.into_iter().next().unwrap();
        assert!(!desc.readable && !desc.writable);

        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        handler.on_get(move |_requester| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            Ok(PropertyValue::Bytes(b"42".to_vec()))
        });

        let (state, value) = sub.inner_for_tests().kv_remote_get(Uuid::new_v4(), b"h");
        assert_eq!(state, TRANSOP_STATE_OK);
        assert_eq!(value, b"42");
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        let desc = sub.info().unwrap().kvs.into_iter().next().unwrap();
        assert!(desc.readable && !desc.writable);
        client.close();
    }

    #[tokio::test]
    async fn missing_key_is_rejected_with_reason() {
        let client = offline_client();
        let sub = client.register_subsystem("unit", Uuid::new_v4(), false);
        let (state, reason) = sub.inner_for_tests().kv_remote_get(Uuid::new_v4(), b"missing");
        assert_eq!(state, TRANSOP_STATE_REJ);
        assert_eq!(reason, b"Specified value not found.");
        client.close();
    }
}
