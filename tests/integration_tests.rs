//! End-to-end tests driving a real broker and real TCP clients.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use uuid::Uuid;

use ipi_ecs_dds::magics::{
    EVENT_IN_PROGRESS, EVENT_OK, EVENT_REJ, MAGIC_HANDSHAKE_CLIENT, MAGIC_TRANSACT,
    TRANSACT_CONN_READY, TRANSACT_REG_SUBSYSTEM, TRANSACT_REQ_UUID, TXN_NEW, TXN_RET,
};
use ipi_ecs_dds::transport::{encode_message, MessageDecoder};
use ipi_ecs_dds::{
    Broker, BrokerConfig, DdsClient, DdsMessage, ClientConfig, IncomingEventHandle, KvDescriptor,
    PropertyValue, SubsystemInfo, TypeSpecifier,
};

const WAIT: Duration = Duration::from_secs(5);

async fn start_broker() -> Broker {
    let config = BrokerConfig { host: "127.0.0.1".to_string(), port: 0 };
    Broker::bind(&config).await.expect("broker bind failed")
}

fn client_config(broker: &Broker) -> ClientConfig {
    ClientConfig {
        host: "127.0.0.1".to_string(),
        port: broker.local_addr().port(),
        reconnect_delay: Duration::from_millis(100),
        op_timeout: WAIT,
    }
}

async fn ready_client(broker: &Broker) -> DdsClient {
    let client = DdsClient::connect(Uuid::new_v4(), client_config(broker));
    client.wait_ready(WAIT).await.expect("client never became ready");
    client
}

/// Poll `predicate` until it holds or the deadline passes.
async fn eventually(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if predicate() {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ─── Raw wire-level handshake and registration ─────────────────────────────

/// A test client speaking the wire protocol byte for byte.
struct RawClient {
    stream: TcpStream,
    decoder: MessageDecoder,
    queued: Vec<Vec<u8>>,
}

impl RawClient {
    async fn connect(broker: &Broker) -> Self {
        let stream = TcpStream::connect(broker.local_addr()).await.expect("connect failed");
        Self { stream, decoder: MessageDecoder::new(), queued: Vec::new() }
    }

    async fn send(&mut self, payload: &[u8]) {
        self.stream
            .write_all(&encode_message(payload))
            .await
            .expect("raw write failed");
    }

    async fn recv(&mut self) -> Vec<u8> {
        loop {
            if !self.queued.is_empty() {
                return self.queued.remove(0);
            }
            let mut buf = [0u8; 4096];
            let n = tokio::time::timeout(WAIT, self.stream.read(&mut buf))
                .await
                .expect("raw read timed out")
                .expect("raw read failed");
            assert!(n > 0, "broker closed the connection");
            self.queued.extend(self.decoder.feed(&buf[..n]).expect("bad frame"));
        }
    }

    /// Receive one transaction frame: `(opcode, txn_uuid, payload)`.
    async fn recv_txn(&mut self) -> (u8, [u8; 16], Vec<u8>) {
        let msg = self.recv().await;
        assert_eq!(msg[0], MAGIC_TRANSACT, "expected transaction, got {msg:?}");
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&msg[2..18]);
        (msg[1], uuid, msg[18..].to_vec())
    }

    async fn send_txn(&mut self, opcode: u8, uuid: [u8; 16], payload: &[u8]) {
        let mut msg = vec![MAGIC_TRANSACT, opcode];
        msg.extend_from_slice(&uuid);
        msg.extend_from_slice(payload);
        self.send(&msg).await;
    }
}

#[tokio::test]
async fn handshake_and_registration_on_the_wire() {
    let broker = start_broker().await;
    let mut raw = RawClient::connect(&broker).await;
    let client_uuid = Uuid::new_v4();

    // Handshake byte is echoed back verbatim.
    raw.send(&[MAGIC_HANDSHAKE_CLIENT]).await;
    assert_eq!(raw.recv().await, vec![MAGIC_HANDSHAKE_CLIENT]);

    // Broker asks for our UUID.
    let (op, u1, payload) = raw.recv_txn().await;
    assert_eq!(op, TXN_NEW);
    assert_eq!(payload, [TRANSACT_REQ_UUID]);
    raw.send_txn(TXN_RET, u1, client_uuid.as_bytes()).await;

    // Broker marks the connection ready.
    let (op, u2, payload) = raw.recv_txn().await;
    assert_eq!(op, TXN_NEW);
    assert_eq!(payload, [TRANSACT_CONN_READY]);
    raw.send_txn(TXN_RET, u2, client_uuid.as_bytes()).await;

    // Register a bare subsystem.
    let sub_uuid = Uuid::new_v3(&Uuid::NAMESPACE_OID, b"echo");
    let info = SubsystemInfo::new(sub_uuid, "echo", false);
    let mut reg = vec![TRANSACT_REG_SUBSYSTEM];
    reg.extend_from_slice(&info.encode().expect("encode failed"));
    let reg_txn = *Uuid::new_v4().as_bytes();
    raw.send_txn(TXN_NEW, reg_txn, &reg).await;

    // First the empty RET, then the snapshot including the new subsystem.
    let (op, uuid, payload) = raw.recv_txn().await;
    assert_eq!(op, TXN_RET);
    assert_eq!(uuid, reg_txn);
    assert!(payload.is_empty());

    let snapshot = raw.recv().await;
    match DdsMessage::decode(&snapshot).expect("bad SYSTEM_UPD") {
        DdsMessage::SystemUpd { entries } => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].0.uuid, sub_uuid);
            assert_eq!(entries[0].0.name, "echo");
            assert!(entries[0].1, "subsystem should be alive");
        }
        other => panic!("expected SystemUpd, got {other:?}"),
    }
}

#[tokio::test]
async fn second_handshake_closes_the_connection() {
    let broker = start_broker().await;
    let mut raw = RawClient::connect(&broker).await;

    raw.send(&[MAGIC_HANDSHAKE_CLIENT]).await;
    assert_eq!(raw.recv().await, vec![MAGIC_HANDSHAKE_CLIENT]);
    raw.send(&[MAGIC_HANDSHAKE_CLIENT]).await;

    // The broker drops the connection; reads return 0 eventually.
    let mut buf = [0u8; 64];
    loop {
        match tokio::time::timeout(WAIT, raw.stream.read(&mut buf))
            .await
            .expect("timed out waiting for close")
        {
            Ok(0) | Err(_) => break,
            Ok(_) => {} // drain whatever was in flight
        }
    }
}

// ─── Published KV fan-out ──────────────────────────────────────────────────

#[tokio::test]
async fn published_kv_fans_out_in_order() {
    let broker = start_broker().await;

    let owner = ready_client(&broker).await;
    let owner_sub = owner.register_subsystem("alpha", Uuid::new_v4(), false);
    let prop = owner_sub.add_property(b"k", true, true, true);
    owner.wait_registered(WAIT).await.expect("owner registration failed");

    let observer = ready_client(&broker).await;
    let observer_sub = observer.register_subsystem("beta", Uuid::new_v4(), false);
    observer.wait_registered(WAIT).await.expect("observer registration failed");

    let descriptor = KvDescriptor {
        ty: TypeSpecifier::Bytes,
        key: b"k".to_vec(),
        published: true,
        readable: true,
        writable: false,
    };
    let remote = observer_sub.add_remote_kv(owner_sub.uuid(), &descriptor);
    let (upd_tx, mut upd_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    remote.on_new_data(move |value| {
        if let PropertyValue::Bytes(bytes) = value {
            let _ = upd_tx.send(bytes);
        }
    });
    // Give the broker a moment to install the subscription.
    tokio::time::sleep(Duration::from_millis(200)).await;

    prop.write(&PropertyValue::Bytes(b"v1".to_vec())).expect("write v1");
    prop.write(&PropertyValue::Bytes(b"v2".to_vec())).expect("write v2");

    let first = tokio::time::timeout(WAIT, upd_rx.recv()).await.expect("no v1").expect("closed");
    let second = tokio::time::timeout(WAIT, upd_rx.recv()).await.expect("no v2").expect("closed");
    assert_eq!(first, b"v1");
    assert_eq!(second, b"v2");

    // Exactly one update per SET.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(upd_rx.try_recv().is_err(), "unexpected extra update");

    assert_eq!(
        remote.read().await.expect("read failed"),
        Some(PropertyValue::Bytes(b"v2".to_vec()))
    );
}

// ─── On-demand GET through a KV handler ────────────────────────────────────

#[tokio::test]
async fn on_demand_get_hits_the_owner() {
    let broker = start_broker().await;

    let owner = ready_client(&broker).await;
    let owner_sub = owner.register_subsystem("alpha", Uuid::new_v4(), false);
    let handler = owner_sub.add_kv_handler(b"h");
    handler.on_get(|_requester| Ok(PropertyValue::Bytes(b"42".to_vec())));
    owner.wait_registered(WAIT).await.expect("owner registration failed");

    let requester = ready_client(&broker).await;
    let requester_sub = requester.register_subsystem("beta", Uuid::new_v4(), false);
    requester.wait_registered(WAIT).await.expect("requester registration failed");

    let value = requester_sub
        .get_kv(owner_sub.uuid(), b"h")
        .await
        .expect("GET should succeed");
    assert_eq!(value, b"42");

    let err = requester_sub
        .get_kv(owner_sub.uuid(), b"missing")
        .await
        .expect_err("GET of a missing key must fail");
    assert_eq!(err.to_string(), "Specified value not found.");
}

#[tokio::test]
async fn set_kv_routes_to_owner_handler() {
    let broker = start_broker().await;

    let owner = ready_client(&broker).await;
    let owner_sub = owner.register_subsystem("alpha", Uuid::new_v4(), false);
    let handler = owner_sub.add_kv_handler(b"setter");
    let seen = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
    let seen_clone = Arc::clone(&seen);
    handler.on_set(move |_requester, value| {
        if let PropertyValue::Bytes(bytes) = value {
            seen_clone.lock().expect("poisoned").push(bytes);
        }
        Ok(())
    });
    owner.wait_registered(WAIT).await.expect("owner registration failed");

    let requester = ready_client(&broker).await;
    let requester_sub = requester.register_subsystem("beta", Uuid::new_v4(), false);
    requester.wait_registered(WAIT).await.expect("requester registration failed");

    requester_sub
        .set_kv(owner_sub.uuid(), b"setter", b"payload")
        .await
        .expect("SET should succeed");
    assert_eq!(seen.lock().expect("poisoned").as_slice(), &[b"payload".to_vec()]);

    // Unknown target subsystem is rejected with a reason.
    let err = requester_sub
        .set_kv(Uuid::new_v4(), b"setter", b"payload")
        .await
        .expect_err("SET to unknown target must fail");
    assert_eq!(err.to_string(), "Target subsystem not found");
}

// ─── Event fan-out ─────────────────────────────────────────────────────────

type HeldHandle = Arc<Mutex<Option<IncomingEventHandle>>>;

fn answering_handler(sub: &ipi_ecs_dds::RegisteredSubsystem, name: &[u8], reply: &'static [u8]) {
    let handler = sub.add_event_handler(name);
    handler.on_called(move |_sender, _param, handle| {
        let _ = handle.ret(&PropertyValue::Bytes(reply.to_vec()));
    });
}

#[tokio::test]
async fn event_fan_out_with_per_target_status() {
    let broker = start_broker().await;

    let c_a = ready_client(&broker).await;
    let sub_a = c_a.register_subsystem("a", Uuid::new_v4(), false);
    answering_handler(&sub_a, b"e", b"a");
    c_a.wait_registered(WAIT).await.expect("a registration");

    let c_b = ready_client(&broker).await;
    let sub_b = c_b.register_subsystem("b", Uuid::new_v4(), false);
    let handler_b = sub_b.add_event_handler(b"e");
    handler_b.on_called(|_sender, _param, handle| handle.fail("nope"));
    c_b.wait_registered(WAIT).await.expect("b registration");

    let c_d = ready_client(&broker).await;
    let sub_d = c_d.register_subsystem("d", Uuid::new_v4(), false);
    let provider = sub_d.add_event_provider(b"e");
    let held: HeldHandle = Arc::new(Mutex::new(None));
    let held_clone = Arc::clone(&held);
    let handler_d = sub_d.add_event_handler(b"e");
    handler_d.on_called(move |_sender, _param, handle| {
        // Never answers until the test releases it.
        *held_clone.lock().expect("poisoned") = Some(handle);
    });
    c_d.wait_registered(WAIT).await.expect("d registration");

    // Make sure the caller's broker snapshot covers all three subsystems.
    eventually("all subsystems visible", || c_d.system().len() == 3).await;

    let event = provider
        .call(&PropertyValue::Bytes(Vec::new()), &[])
        .expect("event call failed");

    // Empty target list fans out to everyone, the originator included.
    eventually("event seeded with all targets", || {
        event.event_uuid().is_some()
            && [sub_a.uuid(), sub_b.uuid(), sub_d.uuid()]
                .iter()
                .all(|t| event.target_state(*t).is_some())
    })
    .await;

    eventually("a returns ok", || event.target_state(sub_a.uuid()) == Some(EVENT_OK)).await;
    assert_eq!(event.target_result(sub_a.uuid()).expect("a result"), b"a");

    eventually("b returns rejection", || event.target_state(sub_b.uuid()) == Some(EVENT_REJ)).await;
    assert_eq!(event.target_result(sub_b.uuid()).expect("b result"), b"nope");

    // D holds its handle: the event must stay in progress.
    assert_eq!(event.target_state(sub_d.uuid()), Some(EVENT_IN_PROGRESS));
    assert!(event.is_in_progress());

    // Release D; now the event completes.
    let handle = held.lock().expect("poisoned").take().expect("d never got the call");
    handle.ret(&PropertyValue::Bytes(b"d".to_vec())).expect("d ret failed");
    event.wait(WAIT).await.expect("event never completed");
    assert_eq!(event.target_result(sub_d.uuid()).expect("d result"), b"d");
}

#[tokio::test]
async fn event_call_with_unknown_target_is_rejected_whole() {
    let broker = start_broker().await;

    let c = ready_client(&broker).await;
    let sub = c.register_subsystem("caller", Uuid::new_v4(), false);
    let provider = sub.add_event_provider(b"e");
    c.wait_registered(WAIT).await.expect("registration");

    let event = provider
        .call(&PropertyValue::Bytes(Vec::new()), &[Uuid::new_v4()])
        .expect("call itself is queued fine");
    eventually("whole-event rejection", || !event.is_in_progress()).await;
    assert_eq!(event.status(), EVENT_REJ);
    assert_eq!(event.reason().expect("reason"), "One targeted subsystem was not found.");
}

#[tokio::test]
async fn unhandled_event_rejects_softly() {
    let broker = start_broker().await;

    let c_a = ready_client(&broker).await;
    let sub_a = c_a.register_subsystem("silent", Uuid::new_v4(), false);
    c_a.wait_registered(WAIT).await.expect("a registration");

    let c_b = ready_client(&broker).await;
    let sub_b = c_b.register_subsystem("caller", Uuid::new_v4(), false);
    let provider = sub_b.add_event_provider(b"e");
    c_b.wait_registered(WAIT).await.expect("b registration");

    let event = provider
        .call(&PropertyValue::Bytes(Vec::new()), &[sub_a.uuid()])
        .expect("event call failed");
    eventually("soft rejection arrives", || {
        event.target_state(sub_a.uuid()) == Some(EVENT_REJ)
    })
    .await;
    assert_eq!(
        event.target_result(sub_a.uuid()).expect("result"),
        b"Subsystem does not handle specified event."
    );
}

// ─── Temporary subsystem removal ───────────────────────────────────────────

#[tokio::test]
async fn temporary_subsystem_is_removed_on_disconnect() {
    let broker = start_broker().await;

    let observer = ready_client(&broker).await;
    let _observer_sub = observer.register_subsystem("observer", Uuid::new_v4(), false);
    observer.wait_registered(WAIT).await.expect("observer registration");

    let ephemeral = ready_client(&broker).await;
    let tmp_sub = ephemeral.register_subsystem("tmp", Uuid::new_v4(), true);
    ephemeral.wait_registered(WAIT).await.expect("tmp registration");

    eventually("tmp visible to observer", || {
        observer.system().iter().any(|(info, _)| info.uuid == tmp_sub.uuid())
    })
    .await;
    observer.resolve(b"tmp").await.expect("resolve while connected");

    ephemeral.close();

    eventually("tmp removed from snapshot", || {
        let system = observer.system();
        !system.is_empty() && system.iter().all(|(info, _)| info.uuid != tmp_sub.uuid())
    })
    .await;
    let err = observer.resolve(b"tmp").await.expect_err("resolve after removal must fail");
    assert_eq!(err.to_string(), "Not found");
}

// ─── Reconnection replay ───────────────────────────────────────────────────

#[tokio::test]
async fn reconnect_replays_registrations_and_subscriptions() {
    let broker = start_broker().await;
    let addr = broker.local_addr();

    let owner = ready_client(&broker).await;
    let owner_sub = owner.register_subsystem("x", Uuid::new_v4(), false);
    let prop = owner_sub.add_property(b"k", true, true, true);
    owner.wait_registered(WAIT).await.expect("owner registration");

    let subscriber = ready_client(&broker).await;
    let subscriber_sub = subscriber.register_subsystem("s", Uuid::new_v4(), false);
    subscriber.wait_registered(WAIT).await.expect("subscriber registration");
    let descriptor = KvDescriptor {
        ty: TypeSpecifier::Bytes,
        key: b"k".to_vec(),
        published: true,
        readable: true,
        writable: false,
    };
    let remote = subscriber_sub.add_remote_kv(owner_sub.uuid(), &descriptor);
    let (upd_tx, mut upd_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    remote.on_new_data(move |value| {
        if let PropertyValue::Bytes(bytes) = value {
            let _ = upd_tx.send(bytes);
        }
    });
    tokio::time::sleep(Duration::from_millis(200)).await;

    prop.write(&PropertyValue::Bytes(b"v1".to_vec())).expect("write v1");
    let first = tokio::time::timeout(WAIT, upd_rx.recv()).await.expect("no v1").expect("closed");
    assert_eq!(first, b"v1");

    // Bounce the broker.
    broker.shutdown();
    drop(broker);
    let config = BrokerConfig { host: "127.0.0.1".to_string(), port: addr.port() };
    let rebound = Broker::bind(&config).await.expect("rebind failed");

    // Both clients reconnect and replay registrations + subscriptions. A
    // successful resolve implies the subscriber is ready again, the owner
    // re-registered, and (by per-connection FIFO) the replayed subscription
    // was processed before it.
    let deadline = tokio::time::Instant::now() + WAIT;
    while subscriber.resolve(b"x").await.is_err() {
        assert!(tokio::time::Instant::now() < deadline, "owner never re-registered");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    eventually("owner ready again", || owner.is_ready()).await;

    prop.write(&PropertyValue::Bytes(b"v2".to_vec())).expect("write v2");
    let second = tokio::time::timeout(WAIT, upd_rx.recv()).await.expect("no v2").expect("closed");
    assert_eq!(second, b"v2");

    rebound.shutdown();
}

// ─── Descriptor discovery ──────────────────────────────────────────────────

#[tokio::test]
async fn descriptor_fetch_and_remote_proxy() {
    let broker = start_broker().await;

    let owner = ready_client(&broker).await;
    let owner_sub = owner.register_subsystem("typed", Uuid::new_v4(), false);
    let prop = owner_sub.add_property(b"level", true, true, false);
    prop.set_type(TypeSpecifier::int_range(0, 100));
    prop.write(&PropertyValue::Int(17)).expect("local write");
    owner.wait_registered(WAIT).await.expect("owner registration");

    let requester = ready_client(&broker).await;
    let requester_sub = requester.register_subsystem("reader", Uuid::new_v4(), false);
    requester.wait_registered(WAIT).await.expect("requester registration");

    let descriptor = requester_sub
        .get_kv_desc(owner_sub.uuid(), b"level")
        .await
        .expect("descriptor fetch failed");
    assert_eq!(descriptor.ty, TypeSpecifier::int_range(0, 100));
    assert!(!descriptor.published);

    // On-demand read through the proxy (not a published KV, so a GET).
    let remote = requester_sub.add_remote_kv(owner_sub.uuid(), &descriptor);
    assert!(!remote.is_cached());
    let value = remote.read().await.expect("proxy read failed");
    assert_eq!(value, Some(PropertyValue::Int(17)));

    // Remote write lands on the owner.
    remote.write(&PropertyValue::Int(55)).expect("proxy write failed");
    eventually("owner sees remote write", || {
        prop.read().expect("owner read") == Some(PropertyValue::Int(55))
    })
    .await;

    // Range violations fail before any wire activity.
    assert!(remote.write(&PropertyValue::Int(1000)).is_err());

    // get_subsystem surfaces the full descriptor set.
    let info = requester.get_subsystem(owner_sub.uuid()).await.expect("get_subsystem failed");
    assert_eq!(info.name, "typed");
    assert_eq!(info.kvs.len(), 1);
}
