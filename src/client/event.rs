//! Event providers, handlers and in-progress event tracking.
//!
//! Calling an event is a two-stage protocol: the `CALL_EVENT` transaction
//! returns immediately with the event UUID and a per-target reachability
//! vector; per-target results then stream in as unsolicited `EVENT_RET`
//! messages until no target remains in progress.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use uuid::Uuid;

use crate::magics::{
    EVENT_IN_PROGRESS, EVENT_OK, EVENT_PENDING, EVENT_REJ, TRANSACT_CALL_EVENT, TRANSOP_STATE_OK,
};
use crate::seg;
use crate::subsystem::{decode_uuid, EventDescriptor};
use crate::txn::TxnState;
use crate::types::{PropertyValue, TypeSpecifier};

use super::subsystem::SubsystemInner;
use super::op_payload;

/// Callback invoked for each incoming event call:
/// `(sender, parsed parameter, completion handle)`.
pub(crate) type EventCallback =
    Arc<dyn Fn(Uuid, PropertyValue, IncomingEventHandle) + Send + Sync>;

// ─── EventProvider ─────────────────────────────────────────────────────────

pub(crate) struct EventProviderInner {
    name: Vec<u8>,
    param_ty: Mutex<TypeSpecifier>,
    return_ty: Mutex<TypeSpecifier>,
    subsystem: Weak<SubsystemInner>,
}

impl EventProviderInner {
    pub(crate) fn new(name: Vec<u8>, subsystem: Weak<SubsystemInner>) -> Self {
        Self {
            name,
            param_ty: Mutex::new(TypeSpecifier::Bytes),
            return_ty: Mutex::new(TypeSpecifier::Bytes),
            subsystem,
        }
    }

    pub(crate) fn describe(&self) -> EventDescriptor {
        EventDescriptor {
            param_ty: self.param_ty.lock().expect("type poisoned").clone(),
            return_ty: self.return_ty.lock().expect("type poisoned").clone(),
            name: self.name.clone(),
        }
    }
}

/// Handle for calling a named event.
#[derive(Clone)]
pub struct EventProvider {
    inner: Arc<EventProviderInner>,
}

impl std::fmt::Debug for EventProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProvider").field("name", &self.inner.name).finish_non_exhaustive()
    }
}

impl EventProvider {
    pub(crate) fn from_inner(inner: Arc<EventProviderInner>) -> Self {
        Self { inner }
    }

    /// Event name bytes.
    pub fn name(&self) -> &[u8] {
        &self.inner.name
    }

    /// Declare parameter and return types; re-registers the subsystem.
    pub fn set_types(&self, param: TypeSpecifier, ret: TypeSpecifier) {
        *self.inner.param_ty.lock().expect("type poisoned") = param;
        *self.inner.return_ty.lock().expect("type poisoned") = ret;
        if let Some(sub) = self.inner.subsystem.upgrade() {
            sub.invalidate();
        }
    }

    /// Call the event on `targets` (empty = every registered subsystem,
    /// the caller included).
    ///
    /// Returns immediately with an [`InProgressEvent`] seeded from the
    /// broker's reachability vector; per-target results stream in
    /// afterwards.
    ///
    /// # Errors
    ///
    /// Errors if the parameter violates the declared type (before any wire
    /// activity) or the client is not ready.
    pub fn call(&self, value: &PropertyValue, targets: &[Uuid]) -> Result<InProgressEvent> {
        let param = self.inner.param_ty.lock().expect("type poisoned").encode(value)?;
        let sub = self.inner.subsystem.upgrade().context("subsystem is gone")?;
        let client = sub.client.upgrade().context("client runtime is gone")?;

        let target_list: Vec<Vec<u8>> =
            targets.iter().map(|t| t.as_bytes().to_vec()).collect();
        let body = seg::encode(&[
            seg::encode(&target_list)?,
            sub.uuid.as_bytes().to_vec(),
            self.inner.name.clone(),
            param,
        ])?;
        let out = client.transop(&op_payload(TRANSACT_CALL_EVENT, &body))?;

        let return_ty = self.inner.return_ty.lock().expect("type poisoned").clone();
        let event = InProgressEvent::new(self.inner.name.clone(), return_ty);

        let seeded = event.clone();
        tokio::spawn(async move {
            match out.wait().await {
                TxnState::Returned => {
                    let result = out.result().unwrap_or_default();
                    match result.split_first() {
                        Some((&TRANSOP_STATE_OK, body)) => match parse_call_reply(body) {
                            Ok((uuid, statuses)) => {
                                seeded.seed(uuid, &statuses);
                                sub.register_in_progress(uuid, seeded);
                            }
                            Err(e) => seeded.reject(&format!("malformed event reply: {e}")),
                        },
                        Some((_, reason)) => {
                            seeded.reject(&String::from_utf8_lossy(reason));
                        }
                        None => seeded.reject("empty event reply"),
                    }
                }
                _ => seeded.reject(
                    &out.reason().unwrap_or_else(|| "Transaction rejected".to_string()),
                ),
            }
        });

        Ok(event)
    }
}

/// Decode `seg([event_uuid, seg([seg([target, ok:1]), …])])`.
fn parse_call_reply(body: &[u8]) -> Result<(Uuid, Vec<(Uuid, bool)>)> {
    let [event, statuses_blob] = seg::decode_exact::<2>(body)?;
    let event = decode_uuid(&event)?;
    let mut statuses = Vec::new();
    for entry in seg::decode(&statuses_blob)? {
        let [target, ok] = seg::decode_exact::<2>(&entry)?;
        let ok = match ok.as_slice() {
            [0] => false,
            [1] => true,
            _ => return Err(anyhow!("reachability flag must be a single 0/1 byte")),
        };
        statuses.push((decode_uuid(&target)?, ok));
    }
    Ok((event, statuses))
}

// ─── InProgressEvent ───────────────────────────────────────────────────────

#[derive(Debug)]
struct EventCore {
    status: u8,
    reason: Option<String>,
    uuid: Option<Uuid>,
    results: HashMap<Uuid, (u8, Vec<u8>)>,
}

#[derive(Debug)]
struct InProgressEventInner {
    name: Vec<u8>,
    return_ty: TypeSpecifier,
    core: Mutex<EventCore>,
    changed: tokio::sync::Notify,
}

/// Observable state of one called event.
///
/// Terminal once no target remains in progress (or the call itself was
/// rejected). Completion is observed with [`wait`](InProgressEvent::wait).
#[derive(Debug, Clone)]
pub struct InProgressEvent {
    inner: Arc<InProgressEventInner>,
}

impl InProgressEvent {
    pub(crate) fn new(name: Vec<u8>, return_ty: TypeSpecifier) -> Self {
        Self {
            inner: Arc::new(InProgressEventInner {
                name,
                return_ty,
                core: Mutex::new(EventCore {
                    status: EVENT_PENDING,
                    reason: None,
                    uuid: None,
                    results: HashMap::new(),
                }),
                changed: tokio::sync::Notify::new(),
            }),
        }
    }

    /// Event name bytes.
    pub fn name(&self) -> &[u8] {
        &self.inner.name
    }

    /// Event UUID, once the broker has acknowledged the call.
    pub fn event_uuid(&self) -> Option<Uuid> {
        self.lock().uuid
    }

    /// Overall event status byte.
    pub fn status(&self) -> u8 {
        self.lock().status
    }

    /// Rejection reason, if the call itself was rejected.
    pub fn reason(&self) -> Option<String> {
        self.lock().reason.clone()
    }

    /// Status byte of one target.
    pub fn target_state(&self, target: Uuid) -> Option<u8> {
        self.lock().results.get(&target).map(|(s, _)| *s)
    }

    /// Return payload (or rejection reason bytes) of one target.
    pub fn target_result(&self, target: Uuid) -> Option<Vec<u8>> {
        self.lock().results.get(&target).map(|(_, v)| v.clone())
    }

    /// True while any target may still produce a return.
    pub fn is_in_progress(&self) -> bool {
        let core = self.lock();
        if core.status == EVENT_REJ {
            return false;
        }
        if core.results.is_empty() {
            return true;
        }
        core.results.values().any(|(s, _)| *s == EVENT_IN_PROGRESS)
    }

    /// Wait until the event is terminal.
    ///
    /// # Errors
    ///
    /// Errors on timeout; the event keeps accumulating returns regardless.
    pub async fn wait(&self, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.inner.changed.notified();
                if !self.is_in_progress() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .map_err(|_| anyhow!("event did not complete within {timeout:?}"))
    }

    /// Install the broker's initial reachability vector.
    pub(crate) fn seed(&self, uuid: Uuid, statuses: &[(Uuid, bool)]) {
        {
            let mut core = self.lock();
            core.uuid = Some(uuid);
            core.status = EVENT_IN_PROGRESS;
            for (target, ok) in statuses {
                let entry = if *ok {
                    (EVENT_IN_PROGRESS, Vec::new())
                } else {
                    (EVENT_REJ, b"Subsystem disconnected".to_vec())
                };
                core.results.insert(*target, entry);
            }
        }
        self.inner.changed.notify_waiters();
    }

    /// Record one per-target return.
    pub(crate) fn set_result(&self, target: Uuid, status: u8, value: &[u8]) {
        let entry = if status == EVENT_OK {
            // Validate against the declared return type; a mismatch turns
            // the target result into a rejection.
            match self.inner.return_ty.parse(value) {
                Ok(_) => (EVENT_OK, value.to_vec()),
                Err(_) => (
                    EVENT_REJ,
                    b"Returned value is incompatible with expected return type".to_vec(),
                ),
            }
        } else {
            (status, value.to_vec())
        };
        self.lock().results.insert(target, entry);
        self.inner.changed.notify_waiters();
    }

    /// The call itself failed; terminal.
    pub(crate) fn reject(&self, reason: &str) {
        {
            let mut core = self.lock();
            core.status = EVENT_REJ;
            core.reason = Some(reason.to_string());
        }
        self.inner.changed.notify_waiters();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EventCore> {
        self.inner.core.lock().expect("event state poisoned")
    }
}

// ─── EventHandler ──────────────────────────────────────────────────────────

pub(crate) struct EventHandlerInner {
    name: Vec<u8>,
    param_ty: Mutex<TypeSpecifier>,
    return_ty: Mutex<TypeSpecifier>,
    on_called: Mutex<Option<EventCallback>>,
    subsystem: Weak<SubsystemInner>,
}

impl EventHandlerInner {
    pub(crate) fn new(name: Vec<u8>, subsystem: Weak<SubsystemInner>) -> Self {
        Self {
            name,
            param_ty: Mutex::new(TypeSpecifier::Bytes),
            return_ty: Mutex::new(TypeSpecifier::Bytes),
            on_called: Mutex::new(None),
            subsystem,
        }
    }

    pub(crate) fn callback(&self) -> Option<EventCallback> {
        self.on_called.lock().expect("callback poisoned").clone()
    }

    pub(crate) fn param_ty(&self) -> TypeSpecifier {
        self.param_ty.lock().expect("type poisoned").clone()
    }

    pub(crate) fn return_ty(&self) -> TypeSpecifier {
        self.return_ty.lock().expect("type poisoned").clone()
    }

    pub(crate) fn describe(&self) -> EventDescriptor {
        EventDescriptor {
            param_ty: self.param_ty(),
            return_ty: self.return_ty(),
            name: self.name.clone(),
        }
    }
}

/// Handle for implementing a named event.
#[derive(Clone)]
pub struct EventHandler {
    inner: Arc<EventHandlerInner>,
}

impl std::fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandler").field("name", &self.inner.name).finish_non_exhaustive()
    }
}

impl EventHandler {
    pub(crate) fn from_inner(inner: Arc<EventHandlerInner>) -> Self {
        Self { inner }
    }

    /// Event name bytes.
    pub fn name(&self) -> &[u8] {
        &self.inner.name
    }

    /// Declare parameter and return types; re-registers the subsystem.
    pub fn set_types(&self, param: TypeSpecifier, ret: TypeSpecifier) {
        *self.inner.param_ty.lock().expect("type poisoned") = param;
        *self.inner.return_ty.lock().expect("type poisoned") = ret;
        if let Some(sub) = self.inner.subsystem.upgrade() {
            sub.invalidate();
        }
    }

    /// Install the call handler. The application must eventually finish
    /// each received handle with `ret` or `fail`.
    pub fn on_called(
        &self,
        callback: impl Fn(Uuid, PropertyValue, IncomingEventHandle) + Send + Sync + 'static,
    ) {
        *self.inner.on_called.lock().expect("callback poisoned") = Some(Arc::new(callback));
    }
}

/// Completion handle for one received event call.
///
/// Consumed by [`ret`](IncomingEventHandle::ret) or
/// [`fail`](IncomingEventHandle::fail); [`feedback`](IncomingEventHandle::feedback)
/// may be sent any number of times before that.
pub struct IncomingEventHandle {
    event: Uuid,
    return_ty: TypeSpecifier,
    subsystem: Weak<SubsystemInner>,
}

impl std::fmt::Debug for IncomingEventHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingEventHandle").field("event", &self.event).finish_non_exhaustive()
    }
}

impl IncomingEventHandle {
    pub(crate) fn new(event: Uuid, return_ty: TypeSpecifier, subsystem: Weak<SubsystemInner>) -> Self {
        Self { event, return_ty, subsystem }
    }

    /// Event instance UUID.
    pub fn event_uuid(&self) -> Uuid {
        self.event
    }

    /// Finish the event with a typed return value.
    ///
    /// # Errors
    ///
    /// Errors if the value violates the declared return type; the caller
    /// then sees an internal-error rejection instead of a value.
    pub fn ret(self, value: &PropertyValue) -> Result<()> {
        let Some(sub) = self.subsystem.upgrade() else { return Ok(()) };
        match self.return_ty.encode(value) {
            Ok(encoded) => {
                sub.send_event_return(self.event, EVENT_OK, &encoded);
                Ok(())
            }
            Err(e) => {
                sub.send_event_return(
                    self.event,
                    EVENT_REJ,
                    b"Internal error, handler returned invalid data!",
                );
                Err(e)
            }
        }
    }

    /// Finish the event with a rejection reason.
    pub fn fail(self, reason: &str) {
        if let Some(sub) = self.subsystem.upgrade() {
            sub.send_event_return(self.event, EVENT_REJ, reason.as_bytes());
        }
    }

    /// Send partial progress without finishing the event.
    pub fn feedback(&self, data: &[u8]) {
        if let Some(sub) = self.subsystem.upgrade() {
            sub.feedback_event(self.event, data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_event_is_pending_and_in_progress() {
        let event = InProgressEvent::new(b"e".to_vec(), TypeSpecifier::Bytes);
        assert_eq!(event.status(), EVENT_PENDING);
        assert!(event.is_in_progress());
        assert!(event.event_uuid().is_none());
    }

    #[test]
    fn seeded_event_tracks_targets_to_completion() {
        let event = InProgressEvent::new(b"e".to_vec(), TypeSpecifier::Bytes);
        let uuid = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        event.seed(uuid, &[(a, true), (b, false)]);

        assert_eq!(event.event_uuid(), Some(uuid));
        assert_eq!(event.target_state(a), Some(EVENT_IN_PROGRESS));
        assert_eq!(event.target_state(b), Some(EVENT_REJ));
        assert!(event.is_in_progress());

        event.set_result(a, EVENT_OK, b"done");
        assert!(!event.is_in_progress());
        assert_eq!(event.target_result(a).unwrap(), b"done");
    }

    #[test]
    fn rejected_call_is_terminal() {
        let event = InProgressEvent::new(b"e".to_vec(), TypeSpecifier::Bytes);
        event.reject("One targeted subsystem was not found.");
        assert!(!event.is_in_progress());
        assert_eq!(event.status(), EVENT_REJ);
        assert_eq!(event.reason().unwrap(), "One targeted subsystem was not found.");
    }

    #[test]
    fn mistyped_return_becomes_a_rejection() {
        let event = InProgressEvent::new(b"e".to_vec(), TypeSpecifier::int());
        let target = Uuid::new_v4();
        event.seed(Uuid::new_v4(), &[(target, true)]);
        event.set_result(target, EVENT_OK, b"not four bytes");
        assert_eq!(event.target_state(target), Some(EVENT_REJ));
    }

    #[tokio::test]
    async fn wait_resolves_when_last_target_returns() {
        let event = InProgressEvent::new(b"e".to_vec(), TypeSpecifier::Bytes);
        let target = Uuid::new_v4();
        event.seed(Uuid::new_v4(), &[(target, true)]);

        let waiter = {
            let event = event.clone();
            tokio::spawn(async move { event.wait(Duration::from_secs(1)).await })
        };
        tokio::task::yield_now().await;

        event.set_result(target, EVENT_OK, b"v");
        waiter.await.expect("task panicked").expect("wait failed");
    }

    #[test]
    fn call_reply_parser_round_trips() {
        let event = Uuid::new_v4();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let entries = vec![
            seg::encode(&[a.as_bytes().to_vec(), vec![1]]).unwrap(),
            seg::encode(&[b.as_bytes().to_vec(), vec![0]]).unwrap(),
        ];
        let body = seg::encode(&[
            event.as_bytes().to_vec(),
            seg::encode(&entries).unwrap(),
        ])
        .unwrap();
        let (parsed_event, statuses) = parse_call_reply(&body).unwrap();
        assert_eq!(parsed_event, event);
        assert_eq!(statuses, vec![(a, true), (b, false)]);
    }
}
