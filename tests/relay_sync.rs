//! End-to-end: a real relay on an ephemeral port with WebSocket clients.

use futures_util::{SinkExt, StreamExt};
use pairsync::config::RelayConfig;
use pairsync::gateway::{serve, AppState};
use pairsync::store::{Record, RecordStore, SqliteRecordStore, SyncStatus};
use pairsync::sync::protocol::{ErrorPayload, MessageType, SyncMessage};
use pairsync::sync::{run_sync, ClientOptions, EngineOptions, SyncEngine, SyncError, SyncState};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::Message as WsMessage;

struct TestRelay {
    addr: SocketAddr,
    state: AppState,
    shutdown: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl TestRelay {
    async fn start() -> Self {
        let config = RelayConfig {
            host: "127.0.0.1".into(),
            port: 0,
            join_timeout_secs: 1,
            idle_timeout_secs: 30,
            ..RelayConfig::default()
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::new(config);
        let (tx, rx) = oneshot::channel::<()>();
        let serve_state = state.clone();
        let task = tokio::spawn(async move {
            serve(listener, serve_state, async {
                let _ = rx.await;
            })
            .await
            .unwrap();
        });
        Self {
            addr,
            state,
            shutdown: Some(tx),
            task,
        }
    }

    fn url(&self) -> String {
        format!("ws://{}/sync", self.addr)
    }

    async fn wait_until_empty(&self) {
        for _ in 0..100 {
            if self.state.registry.stats().sessions == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("relay still holds sessions: {:?}", self.state.registry.stats());
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), self.task).await;
    }
}

fn store_with(records: &[Record]) -> Arc<SqliteRecordStore> {
    let store = Arc::new(SqliteRecordStore::open_in_memory().unwrap());
    for r in records {
        store.upsert(r).unwrap();
    }
    store
}

fn rec(id: &str, origin: &str, updated_at: i64, payload: serde_json::Value) -> Record {
    Record {
        id: id.into(),
        payload,
        device_id: origin.into(),
        created_at: 1,
        updated_at,
        deleted: false,
    }
}

fn options() -> ClientOptions {
    ClientOptions {
        ping_interval: Duration::from_secs(1),
        sync_timeout: Duration::from_secs(15),
        chunk_delay: Duration::ZERO,
        device_name: None,
    }
}

/// Run one device's sync in its own task; returns the engine afterwards.
fn spawn_device(
    store: &Arc<SqliteRecordStore>,
    device_id: &str,
    session_id: &str,
    expected_peers: usize,
    url: String,
) -> tokio::task::JoinHandle<(SyncEngine, Result<(), String>)> {
    let mut engine = SyncEngine::new(
        Arc::clone(store) as Arc<dyn RecordStore>,
        device_id,
        session_id,
        EngineOptions {
            chunk_size: 2,
            expected_peers,
            ..EngineOptions::default()
        },
    );
    tokio::spawn(async move {
        let result = run_sync(&mut engine, &url, &options())
            .await
            .map(|_| ())
            .map_err(|e| e.to_string());
        (engine, result)
    })
}

/// Content that must match across replicas. `device_id` records where a
/// record was created and is not part of the merge.
fn snapshot(store: &SqliteRecordStore) -> Vec<(String, serde_json::Value, i64, bool)> {
    store
        .list_records(true)
        .unwrap()
        .into_iter()
        .map(|r| (r.id, r.payload, r.updated_at, r.deleted))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_devices_converge_through_relay() {
    let relay = TestRelay::start().await;

    let x = store_with(&[
        rec("a", "x", 10, json!("a@x")),
        rec("b", "x", 20, json!("b@x")),
        rec("d", "x", 5, json!("d")),
    ]);
    let y = store_with(&[
        rec("b", "y", 15, json!("b@y")),
        rec("c", "y", 30, json!("c@y")),
        rec("e", "y", 6, json!("e")),
    ]);

    let hx = spawn_device(&x, "x", "s-two", 1, relay.url());
    let hy = spawn_device(&y, "y", "s-two", 1, relay.url());
    let (ex, rx) = hx.await.unwrap();
    let (ey, ry) = hy.await.unwrap();

    assert_eq!(rx, Ok(()));
    assert_eq!(ry, Ok(()));
    assert!(ex.is_complete());
    assert!(ey.is_complete());

    assert_eq!(snapshot(&x), snapshot(&y));
    let b = y.get("b").unwrap().unwrap();
    assert_eq!(b.updated_at, 20);
    assert_eq!(b.payload, json!("b@x"));
    assert_eq!(x.list_ids().unwrap().len(), 5);

    let log = x.sync_history(5).unwrap();
    assert_eq!(log[0].status, SyncStatus::Complete);
    assert_eq!(log[0].remote_device_id, "y");
    assert!(x.get_device("y").unwrap().unwrap().last_sync_at.is_some());

    relay.wait_until_empty().await;
    relay.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_devices_converge_through_relay() {
    let relay = TestRelay::start().await;

    let mut gone = rec("gone", "c", 70, json!("gone"));
    gone.deleted = true;
    let a = store_with(&[
        rec("a1", "a", 10, json!("a1")),
        rec("shared", "a", 100, json!("from-a")),
    ]);
    let b = store_with(&[
        rec("b1", "b", 20, json!("b1")),
        rec("shared", "b", 100, json!("from-b")),
        rec("gone", "b", 60, json!("gone")),
    ]);
    let c = store_with(&[rec("c1", "c", 30, json!("c1")), gone]);

    let ha = spawn_device(&a, "a", "s-three", 2, relay.url());
    let hb = spawn_device(&b, "b", "s-three", 2, relay.url());
    let hc = spawn_device(&c, "c", "s-three", 2, relay.url());
    for handle in [ha, hb, hc] {
        let (engine, result) = handle.await.unwrap();
        assert_eq!(result, Ok(()), "device {} failed", engine.device_id());
        assert_eq!(engine.state(), &SyncState::Complete);
    }

    let expected = snapshot(&a);
    assert_eq!(snapshot(&b), expected);
    assert_eq!(snapshot(&c), expected);
    assert_eq!(expected.len(), 5);
    // Equal timestamps: the smaller device id wins on every replica.
    assert_eq!(c.get("shared").unwrap().unwrap().payload, json!("from-a"));
    assert!(a.get("gone").unwrap().unwrap().deleted);

    relay.wait_until_empty().await;
    relay.stop().await;
}

#[tokio::test]
async fn relay_answers_ping_and_rejects_bad_frames() {
    let relay = TestRelay::start().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(relay.url()).await.unwrap();

    let ping = SyncMessage::new(MessageType::Ping, "s-ping", "dev-a", json!({}));
    ws.send(WsMessage::Text(ping.to_json().unwrap().into()))
        .await
        .unwrap();
    let pong = next_message(&mut ws).await;
    assert_eq!(pong.kind, MessageType::Pong);

    ws.send(WsMessage::Text("{not json".into())).await.unwrap();
    let error = next_message(&mut ws).await;
    assert_eq!(error.kind, MessageType::Error);
    assert_eq!(error.payload_as::<ErrorPayload>().unwrap().code, "malformed");

    let early = SyncMessage::new(MessageType::SyncData, "s-ping", "dev-a", json!({}));
    ws.send(WsMessage::Text(early.to_json().unwrap().into()))
        .await
        .unwrap();
    let error = next_message(&mut ws).await;
    assert_eq!(error.payload_as::<ErrorPayload>().unwrap().code, "not_joined");

    relay.stop().await;
}

#[tokio::test]
async fn relay_closes_connection_without_join() {
    let relay = TestRelay::start().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(relay.url()).await.unwrap();

    // Join grace period is one second in the test relay.
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "relay kept an unjoined connection open");

    relay.stop().await;
}

#[tokio::test]
async fn expired_pairing_code_is_rejected_before_connecting() {
    use pairsync::sync::protocol::MetadataPayload;
    use pairsync::sync::PairingPayload;

    let payload = PairingPayload::create(
        "dev-a",
        &MetadataPayload::default(),
        // Nothing listens here; validation must fail first.
        "ws://127.0.0.1:9/sync",
        Duration::from_secs(300),
        1_000,
    );
    let decoded = PairingPayload::decode(&payload.encode().unwrap()).unwrap();
    assert!(matches!(
        decoded.validate(1_000 + 300_000),
        Err(SyncError::ExpiredPairing { .. })
    ));
    assert!(decoded.validate(1_000 + 299_999).is_ok());
}

async fn next_message<S>(ws: &mut S) -> SyncMessage
where
    S: futures_util::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    let frame = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return SyncMessage::parse(text.as_str()).unwrap();
                }
                Some(Ok(_)) => {}
                other => panic!("connection ended: {other:?}"),
            }
        }
    })
    .await;
    frame.expect("no frame from relay")
}
