//! Fan-out router: owns the gateway's single backbone subscription.
//!
//! The subscription's channel set is always the union of every live
//! listener's channel. Membership changes publish a fresh union snapshot to
//! the dispatcher, which swaps the backbone subscription only when the set
//! actually changed — a subscribe to an already-covered channel is a no-op
//! at the broker. Messages in flight during a swap may be lost from the
//! backbone's perspective; the offline log guarantees replay.
//!
//! The router never owns endpoints: listeners hold weak references, and
//! endpoint teardown is the only path that unwinds router state.

use crate::backbone::{Backbone, BackboneStream, IdleStream};
use crate::delivery::Delivery;
use crate::endpoint::Endpoint;
use crate::registry::{DeliveryCallback, EventRegistry};
use crate::task::spawn_guarded;
use rp_protocol::Event;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tracing::{debug, warn};

struct Listener {
    endpoint: Weak<Endpoint>,
    channel: String,
    callback: DeliveryCallback,
}

#[derive(Default)]
struct RouterInner {
    subs: HashMap<i64, Listener>,
    channel_subs: HashMap<String, Vec<i64>>,
}

impl RouterInner {
    fn union(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channel_subs.keys().cloned().collect();
        channels.sort_unstable();
        channels
    }
}

pub struct Router {
    backbone: Arc<dyn Backbone>,
    delivery: Arc<Delivery>,
    registry: Arc<EventRegistry>,
    inner: Mutex<RouterInner>,
    next_sub_id: AtomicI64,
    union_tx: watch::Sender<Vec<String>>,
}

impl Router {
    /// Build the router and start its dispatcher task.
    pub fn new(
        backbone: Arc<dyn Backbone>,
        delivery: Arc<Delivery>,
        registry: Arc<EventRegistry>,
    ) -> Arc<Self> {
        let (union_tx, union_rx) = watch::channel(Vec::new());
        let router = Arc::new(Self {
            backbone: Arc::clone(&backbone),
            delivery,
            registry,
            inner: Mutex::new(RouterInner::default()),
            next_sub_id: AtomicI64::new(0),
            union_tx,
        });
        let weak = Arc::downgrade(&router);
        spawn_guarded("dispatcher", dispatch_loop(weak, backbone, union_rx));
        router
    }

    /// Register `endpoint` as a listener on `channel` and return the token
    /// that tears the subscription down again.
    pub fn subscribe(
        &self,
        endpoint: &Arc<Endpoint>,
        channel: &str,
        callback: DeliveryCallback,
    ) -> i64 {
        self.registry.freeze();
        let mut inner = self.inner.lock().expect("router lock poisoned");
        let sub_id = loop {
            let candidate = self.bump_sub_id();
            // A very old subscription may still hold a wrapped-around id.
            if !inner.subs.contains_key(&candidate) {
                break candidate;
            }
        };
        inner.subs.insert(
            sub_id,
            Listener {
                endpoint: Arc::downgrade(endpoint),
                channel: channel.to_owned(),
                callback,
            },
        );
        inner
            .channel_subs
            .entry(channel.to_owned())
            .or_default()
            .push(sub_id);
        let union = inner.union();
        drop(inner);
        self.union_tx.send_replace(union);
        sub_id
    }

    /// Remove a listener. Unknown ids are a no-op. Dropping the last
    /// listener of a channel removes the channel from the backbone union.
    pub fn unsubscribe(&self, sub_id: i64) {
        let mut inner = self.inner.lock().expect("router lock poisoned");
        let Some(listener) = inner.subs.remove(&sub_id) else {
            return;
        };
        if let Some(ids) = inner.channel_subs.get_mut(&listener.channel) {
            ids.retain(|id| *id != sub_id);
            if ids.is_empty() {
                inner.channel_subs.remove(&listener.channel);
            }
        }
        let union = inner.union();
        drop(inner);
        self.union_tx.send_replace(union);
    }

    /// Publish a payload: append to the channel's offline log first, then
    /// broadcast on the backbone. Replay must never lose a message the
    /// backbone already carried, so the durable step comes first; the
    /// receiver hash absorbs the resulting replay/live duplicates. Both
    /// steps are best-effort.
    pub async fn publish(&self, channel: &str, payload: &[u8]) {
        match Event::from_bytes(payload) {
            Ok(event) => self.delivery.append_offline(channel, &event, payload).await,
            Err(e) => warn!(channel, error = %e, "unscorable payload; skipping offline log"),
        }
        if let Err(e) = self.backbone.publish(channel, payload).await {
            warn!(channel, error = %e, "backbone publish failed");
        }
    }

    /// Fan one backbone message out to every listener of its channel.
    ///
    /// The waiter push happens after the outbound enqueue attempt so that a
    /// slow writer cannot lose the waiter record.
    async fn dispatch(&self, channel: &str, payload: &[u8]) {
        let mut targets = Vec::new();
        let mut dead = Vec::new();
        {
            let inner = self.inner.lock().expect("router lock poisoned");
            if let Some(ids) = inner.channel_subs.get(channel) {
                for id in ids {
                    let Some(listener) = inner.subs.get(id) else {
                        continue;
                    };
                    match listener.endpoint.upgrade() {
                        Some(endpoint) => {
                            targets.push((endpoint, Arc::clone(&listener.callback)));
                        }
                        None => dead.push(*id),
                    }
                }
            }
        }
        for id in dead {
            self.unsubscribe(id);
        }

        let event = Event::from_bytes(payload).ok();
        for (endpoint, callback) in targets {
            callback(&endpoint, payload);
            if let Some(event) = &event {
                self.delivery
                    .push(channel, endpoint.id(), event, payload)
                    .await;
            }
        }
    }

    fn bump_sub_id(&self) -> i64 {
        let previous = self
            .next_sub_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(if v == i64::MAX { 1 } else { v + 1 })
            })
            .expect("update closure is total");
        if previous == i64::MAX { 1 } else { previous + 1 }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher loop
// ---------------------------------------------------------------------------

/// Single consumer of the backbone stream.
///
/// Swaps the subscription when the channel union changes and routes every
/// inbound message through [`Router::dispatch`]. Exits when the router is
/// dropped.
async fn dispatch_loop(
    router: Weak<Router>,
    backbone: Arc<dyn Backbone>,
    mut union_rx: watch::Receiver<Vec<String>>,
) {
    let mut stream: Box<dyn BackboneStream> = Box::new(IdleStream);
    let mut subscribed: Vec<String> = Vec::new();

    loop {
        tokio::select! {
            changed = union_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let wanted = union_rx.borrow_and_update().clone();
                if wanted == subscribed {
                    continue;
                }
                match backbone.subscribe(&wanted).await {
                    Ok(new_stream) => {
                        debug!(channels = wanted.len(), "backbone subscription swapped");
                        stream = new_stream;
                        subscribed = wanted;
                    }
                    Err(e) => {
                        // Retried on the next membership change or stream end.
                        warn!(error = %e, "backbone re-subscribe failed");
                        stream = Box::new(IdleStream);
                        subscribed.clear();
                    }
                }
            }
            message = stream.next_message() => {
                match message {
                    Some((channel, payload)) => {
                        let Some(router) = router.upgrade() else { break };
                        router.dispatch(&channel, &payload).await;
                    }
                    None => {
                        warn!("backbone stream ended; re-subscribing");
                        let wanted = union_rx.borrow().clone();
                        subscribed.clear();
                        match backbone.subscribe(&wanted).await {
                            Ok(new_stream) => {
                                stream = new_stream;
                                subscribed = wanted;
                            }
                            Err(e) => {
                                warn!(error = %e, "backbone re-subscribe failed");
                                stream = Box::new(IdleStream);
                            }
                        }
                    }
                }
            }
        }
    }
}
