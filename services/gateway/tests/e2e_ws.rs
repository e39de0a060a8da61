//! End-to-end: real axum server, real WebSocket client, mocked Redis.
//!
//! Drives the whole path a production subscriber takes: upgrade, subscribe
//! frame, publish over HTTP, fan-out frame on the socket, ack frame, and
//! store-state convergence.

use futures_util::{SinkExt, StreamExt};
use gateway::delivery::{Delivery, DeliveryOptions};
use gateway::keys;
use gateway::registry::{EventRegistry, forward_to_endpoint};
use gateway::router::Router;
use gateway::store::DeliveryStore;
use gateway::{GatewayState, api_router};
use rp_protocol::{Event, split_coalesced};
use rp_test_utils::{MemoryBackbone, MemoryStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::protocol::Message;

struct TestGateway {
    addr: SocketAddr,
    store: Arc<MemoryStore>,
    backbone: Arc<MemoryBackbone>,
}

/// Boot a gateway on an ephemeral port with `"Room"` resolving to channel
/// `"room"` and every upgrade assigned subscriber id `"s1"`.
async fn start_gateway() -> TestGateway {
    let store = Arc::new(MemoryStore::new());
    let backbone = Arc::new(MemoryBackbone::new());
    let delivery = Arc::new(Delivery::new(
        Arc::clone(&store) as Arc<dyn DeliveryStore>,
        DeliveryOptions {
            expire: Duration::from_secs(3600),
            resend_interval: Duration::from_secs(3),
        },
    ));
    let registry = Arc::new(EventRegistry::new());
    registry
        .register(
            "Room",
            Some(Arc::new(|_: &str| "room".to_owned())),
            forward_to_endpoint(),
        )
        .expect("register");

    let router = Router::new(
        Arc::clone(&backbone) as _,
        Arc::clone(&delivery),
        Arc::clone(&registry),
    );
    let state = GatewayState::new(router, delivery, registry)
        .with_id_generator(Arc::new(|_| "s1".to_owned()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, api_router(state)).await.expect("serve");
    });

    TestGateway {
        addr,
        store,
        backbone,
    }
}

async fn wait_until(condition: impl AsyncFn() -> bool) {
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

/// Read text frames until one contains the event with `id`, splitting
/// coalesced frames on newline.
async fn read_until_event(
    read: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
    id: &str,
) -> Event {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let msg = tokio::time::timeout_at(deadline, read.next())
            .await
            .expect("frame within deadline")
            .expect("stream open")
            .expect("transport ok");
        let Message::Text(text) = msg else { continue };
        for segment in split_coalesced(text.as_bytes()) {
            if let Ok(event) = Event::from_bytes(segment) {
                if event.id == id {
                    return event;
                }
            }
        }
    }
}

#[tokio::test]
async fn subscribe_publish_deliver_ack_round_trip() {
    let gw = start_gateway().await;
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", gw.addr))
        .await
        .expect("connect");
    let (mut write, mut read) = ws.split();

    // Subscribe via the "Room" event.
    write
        .send(Message::Text(
            r#"{"id":"e1","eventName":"Room","data":"","time":1000}"#.into(),
        ))
        .await
        .expect("send subscribe");
    wait_until(async || gw.backbone.current_channels() == vec!["room".to_owned()]).await;

    // Publish over HTTP.
    let response = reqwest::Client::new()
        .post(format!("http://{}/publish", gw.addr))
        .json(&serde_json::json!({
            "channel": "room",
            "event": {"id": "e2", "eventName": "msg", "data": "hi", "time": 2000},
        }))
        .send()
        .await
        .expect("publish request");
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    // The payload arrives on the socket and is parked in the waiter.
    let delivered = read_until_event(&mut read, "e2").await;
    assert_eq!(delivered.data, "hi");
    let waiter = keys::waiter_key("room", "s1");
    wait_until(async || {
        gw.store
            .hget(&waiter, "e2")
            .await
            .expect("hget")
            .is_some()
    })
    .await;

    // Ack it; waiter drains, receiver records it, offset advances.
    let ack = serde_json::json!({
        "eventName": "ack",
        "data": delivered.to_bytes().map(|b| String::from_utf8(b).expect("utf8")).expect("encode"),
    });
    write
        .send(Message::Text(ack.to_string().into()))
        .await
        .expect("send ack");

    wait_until(async || {
        gw.store
            .hget(&waiter, "e2")
            .await
            .expect("hget")
            .is_none()
    })
    .await;
    assert!(
        gw.store
            .hget(&keys::receiver_key("room", "s1"), "e2")
            .await
            .expect("hget")
            .is_some()
    );
    assert_eq!(
        gw.store
            .get(&keys::offset_key("room", "s1"))
            .await
            .expect("get"),
        Some("2000".to_owned())
    );
}

#[tokio::test]
async fn disconnect_unwinds_the_backbone_union() {
    let gw = start_gateway().await;
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", gw.addr))
        .await
        .expect("connect");
    let (mut write, _read) = ws.split();

    write
        .send(Message::Text(
            r#"{"eventName":"Room","data":"","time":1}"#.into(),
        ))
        .await
        .expect("send subscribe");
    wait_until(async || gw.backbone.current_channels() == vec!["room".to_owned()]).await;

    write.send(Message::Close(None)).await.expect("close");
    drop(write);
    wait_until(async || gw.backbone.current_channels().is_empty()).await;
}

#[tokio::test]
async fn garbage_and_unknown_frames_do_not_kill_the_connection() {
    let gw = start_gateway().await;
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", gw.addr))
        .await
        .expect("connect");
    let (mut write, _read) = ws.split();

    write
        .send(Message::Text("{definitely-not-json".into()))
        .await
        .expect("send garbage");
    write
        .send(Message::Text(
            r#"{"eventName":"NobodyRegisteredThis","data":"x"}"#.into(),
        ))
        .await
        .expect("send unknown event");

    // The connection is still alive: a real subscribe still goes through.
    write
        .send(Message::Text(
            r#"{"eventName":"Room","data":"","time":1}"#.into(),
        ))
        .await
        .expect("send subscribe");
    wait_until(async || gw.backbone.current_channels() == vec!["room".to_owned()]).await;
}

#[tokio::test]
async fn publish_fills_in_missing_id_and_time() {
    let gw = start_gateway().await;

    let response = reqwest::Client::new()
        .post(format!("http://{}/publish", gw.addr))
        .json(&serde_json::json!({
            "channel": "room",
            "event": {"eventName": "msg", "data": "hi"},
        }))
        .send()
        .await
        .expect("publish request");
    assert_eq!(response.status(), reqwest::StatusCode::ACCEPTED);

    let members = gw
        .store
        .zrange_by_score(&keys::offline_key("room"), 0, i64::MAX)
        .await
        .expect("zrange");
    assert_eq!(members.len(), 1);
    let event = Event::from_bytes(&members[0]).expect("offline entry decodes");
    assert!(!event.id.is_empty(), "id generated");
    assert!(event.time > 0, "time stamped");
}

#[tokio::test]
async fn publish_without_channel_is_rejected() {
    let gw = start_gateway().await;
    let response = reqwest::Client::new()
        .post(format!("http://{}/publish", gw.addr))
        .json(&serde_json::json!({"channel": "", "event": {}}))
        .send()
        .await
        .expect("publish request");
    assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
}
