//! Delivery-engine state machine tests against the in-memory store.
//!
//! Covers the waiter/receiver/offset bookkeeping: ack transitions, offset
//! monotonicity, idempotence, the cross-channel ack broadcast, and ack
//! after TTL expiry.

use gateway::delivery::{Delivery, DeliveryOptions};
use gateway::endpoint::Endpoint;
use gateway::keys;
use gateway::store::DeliveryStore;
use rp_protocol::Event;
use rp_test_utils::MemoryStore;
use std::sync::Arc;
use std::time::Duration;

fn engine(store: &Arc<MemoryStore>) -> Delivery {
    Delivery::new(
        Arc::clone(store) as Arc<dyn DeliveryStore>,
        DeliveryOptions {
            expire: Duration::from_secs(3600),
            resend_interval: Duration::from_secs(3),
        },
    )
}

fn event(id: &str, time: i64) -> (Event, Vec<u8>) {
    let event = Event {
        id: id.to_owned(),
        event_name: "msg".to_owned(),
        data: "hi".to_owned(),
        time,
    };
    let raw = event.to_bytes().expect("encode");
    (event, raw)
}

#[tokio::test]
async fn push_records_waiter_entry_with_ttl() {
    let store = Arc::new(MemoryStore::new());
    let delivery = engine(&store);
    let (e2, raw) = event("e2", 2000);

    delivery.push("room", "s1", &e2, &raw).await;

    let waiter = keys::waiter_key("room", "s1");
    assert_eq!(
        store.hget(&waiter, "e2").await.expect("hget"),
        Some(raw.clone())
    );
    assert!(store.has_ttl(&waiter), "waiter key must carry a TTL");
}

#[tokio::test]
async fn ack_moves_id_from_waiter_to_receiver_and_advances_offset() {
    let store = Arc::new(MemoryStore::new());
    let delivery = engine(&store);
    let (endpoint, _rx) = Endpoint::new("s1".to_owned());
    endpoint.subscribe("room").expect("subscribe");

    let (e2, raw) = event("e2", 2000);
    delivery.push("room", "s1", &e2, &raw).await;
    delivery.ack(&endpoint, &e2).await;

    let waiter = keys::waiter_key("room", "s1");
    let receiver = keys::receiver_key("room", "s1");
    // The id lives in exactly one of the two hashes once the ack returns.
    assert_eq!(store.hget(&waiter, "e2").await.expect("hget"), None);
    assert!(
        store
            .hget(&receiver, "e2")
            .await
            .expect("hget")
            .is_some()
    );
    assert!(store.has_ttl(&receiver));

    let offset = keys::offset_key("room", "s1");
    assert_eq!(store.get(&offset).await.expect("get"), Some("2000".to_owned()));
    assert!(store.has_ttl(&offset));
}

#[tokio::test]
async fn offset_never_regresses() {
    let store = Arc::new(MemoryStore::new());
    let delivery = engine(&store);
    let (endpoint, _rx) = Endpoint::new("s1".to_owned());
    endpoint.subscribe("room").expect("subscribe");

    let (late, _) = event("late", 2000);
    let (early, _) = event("early", 1000);
    delivery.ack(&endpoint, &late).await;
    delivery.ack(&endpoint, &early).await;

    let offset = keys::offset_key("room", "s1");
    assert_eq!(
        store.get(&offset).await.expect("get"),
        Some("2000".to_owned()),
        "an older ack must not move the offset backwards"
    );
}

#[tokio::test]
async fn ack_is_idempotent() {
    let store = Arc::new(MemoryStore::new());
    let delivery = engine(&store);
    let (endpoint, _rx) = Endpoint::new("s1".to_owned());
    endpoint.subscribe("room").expect("subscribe");

    let (e2, raw) = event("e2", 2000);
    delivery.push("room", "s1", &e2, &raw).await;
    delivery.ack(&endpoint, &e2).await;

    let receiver = keys::receiver_key("room", "s1");
    let first = store.hgetall(&receiver).await.expect("hgetall");
    let offset_key = keys::offset_key("room", "s1");
    let first_offset = store.get(&offset_key).await.expect("get");

    delivery.ack(&endpoint, &e2).await;

    assert_eq!(store.hgetall(&receiver).await.expect("hgetall"), first);
    assert_eq!(store.get(&offset_key).await.expect("get"), first_offset);
}

#[tokio::test]
async fn ack_broadcasts_across_all_subscribed_channels() {
    let store = Arc::new(MemoryStore::new());
    let delivery = engine(&store);
    let (endpoint, _rx) = Endpoint::new("s1".to_owned());
    endpoint.subscribe("room").expect("subscribe room");
    endpoint.subscribe("lobby").expect("subscribe lobby");

    // Delivered on one channel only; the ack carries no channel.
    let (e2, raw) = event("e2", 2000);
    delivery.push("room", "s1", &e2, &raw).await;
    delivery.ack(&endpoint, &e2).await;

    assert_eq!(
        store
            .hget(&keys::waiter_key("room", "s1"), "e2")
            .await
            .expect("hget"),
        None
    );
    // Both channels record the ack; the waiter of the channel that never
    // held the id was simply never created.
    for channel in ["room", "lobby"] {
        assert!(
            store
                .hget(&keys::receiver_key(channel, "s1"), "e2")
                .await
                .expect("hget")
                .is_some(),
            "receiver entry on {channel}"
        );
    }
}

#[tokio::test]
async fn ack_after_waiter_ttl_expiry_still_lands() {
    let store = Arc::new(MemoryStore::new());
    let delivery = engine(&store);
    let (endpoint, _rx) = Endpoint::new("s1".to_owned());
    endpoint.subscribe("room").expect("subscribe");

    let (e5, raw) = event("e5", 5000);
    delivery.push("room", "s1", &e5, &raw).await;
    store.force_expire(&keys::waiter_key("room", "s1"));

    delivery.ack(&endpoint, &e5).await;

    assert!(
        store
            .hget(&keys::receiver_key("room", "s1"), "e5")
            .await
            .expect("hget")
            .is_some()
    );
    assert_eq!(
        store
            .get(&keys::offset_key("room", "s1"))
            .await
            .expect("get"),
        Some("5000".to_owned())
    );
}
