//! Connection endpoint: one per live subscriber.
//!
//! All writes to the socket are funneled through the write loop; nothing
//! else touches the transport. The read loop parses inbound frames, offloads
//! subscribe requests so they never block reading, and handles acks inline.
//! Teardown is idempotent and is triggered by whichever loop exits first.
//!
//! Outbound messages may be coalesced: several queued payloads are packed
//! into one text frame separated by `\n`, so clients must split frames on
//! newline before decoding.

use crate::delivery::Delivery;
use crate::registry::EventRegistry;
use crate::router::Router;
use crate::task::spawn_guarded;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rp_protocol::{Event, FRAME_SEPARATOR};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time allowed to write one frame to the peer.
pub(crate) const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Time allowed between inbound frames (pongs included) before the
/// connection is considered dead.
pub(crate) const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping cadence; must stay under `PONG_WAIT`.
pub(crate) const PING_PERIOD: Duration = Duration::from_secs(54);

/// Maximum inbound frame size in bytes.
pub(crate) const MAX_MESSAGE_SIZE: usize = 2048;

/// Outbound queue capacity per connection.
pub(crate) const SEND_BUFFER: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubscribeError {
    #[error("duplicate subscribe")]
    Duplicate,
}

/// In-process representation of one connected subscriber.
pub struct Endpoint {
    id: String,
    channels: Mutex<Vec<String>>,
    sub_ids: Mutex<HashMap<String, i64>>,
    outbound: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl Endpoint {
    /// Create an endpoint and hand back the consumer side of its outbound
    /// queue (owned by the write loop).
    pub fn new(id: String) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (outbound, rx) = mpsc::channel(SEND_BUFFER);
        let endpoint = Arc::new(Self {
            id,
            channels: Mutex::new(Vec::new()),
            sub_ids: Mutex::new(HashMap::new()),
            outbound,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        });
        (endpoint, rx)
    }

    /// Stable subscriber identity assigned at upgrade.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Add `channel` to the subscription set.
    pub fn subscribe(&self, channel: &str) -> Result<(), SubscribeError> {
        let mut channels = self.channels.lock().expect("channels lock poisoned");
        if channels.iter().any(|c| c == channel) {
            return Err(SubscribeError::Duplicate);
        }
        channels.push(channel.to_owned());
        Ok(())
    }

    /// Record the router token needed to tear this subscription down later.
    pub fn bind_sub_id(&self, channel: &str, sub_id: i64) {
        self.sub_ids
            .lock()
            .expect("sub_ids lock poisoned")
            .insert(channel.to_owned(), sub_id);
    }

    /// Snapshot of the currently subscribed channels.
    pub fn channels(&self) -> Vec<String> {
        self.channels.lock().expect("channels lock poisoned").clone()
    }

    /// Non-blocking enqueue of an outbound frame.
    ///
    /// Returns `false` when the frame was dropped (queue full or connection
    /// closing); the waiter entry keeps the message alive for the resend
    /// monitor either way.
    pub fn try_send(&self, payload: &[u8]) -> bool {
        match self.outbound.try_send(payload.to_vec()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    subscriber = %self.id,
                    "outbound queue full; dropping fast-path delivery"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Drain all router tokens, emptying the subscription set.
    pub fn take_sub_ids(&self) -> Vec<i64> {
        self.channels.lock().expect("channels lock poisoned").clear();
        self.sub_ids
            .lock()
            .expect("sub_ids lock poisoned")
            .drain()
            .map(|(_, sub_id)| sub_id)
            .collect()
    }

    /// Token observed by the write loop and the resend monitor.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn begin_teardown(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }
}

/// Unwind one endpoint: hand every subscription back to the router and stop
/// the write loop and resend monitor. Safe to call from both loops.
pub fn teardown(endpoint: &Endpoint, router: &Router) {
    if !endpoint.begin_teardown() {
        return;
    }
    for sub_id in endpoint.take_sub_ids() {
        router.unsubscribe(sub_id);
    }
    endpoint.cancel.cancel();
    info!(subscriber = %endpoint.id, "endpoint closed");
}

// ---------------------------------------------------------------------------
// Read loop
// ---------------------------------------------------------------------------

/// Consume inbound frames until the transport fails, the peer goes silent
/// past the read deadline, or the peer closes.
pub async fn read_loop(
    mut stream: SplitStream<WebSocket>,
    endpoint: Arc<Endpoint>,
    router: Arc<Router>,
    delivery: Arc<Delivery>,
    registry: Arc<EventRegistry>,
) {
    loop {
        // Any inbound traffic, pongs included, rearms the deadline.
        let message = match tokio::time::timeout(PONG_WAIT, stream.next()).await {
            Err(_) => {
                debug!(subscriber = %endpoint.id, "read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(subscriber = %endpoint.id, error = %e, "transport error");
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        let frame: Vec<u8> = match message {
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Binary(bytes) => bytes.to_vec(),
            Message::Close(_) => break,
            // Ping replies are handled by the transport; pongs only rearm.
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        handle_frame(&frame, &endpoint, &router, &delivery, &registry).await;
    }

    teardown(&endpoint, &router);
}

async fn handle_frame(
    frame: &[u8],
    endpoint: &Arc<Endpoint>,
    router: &Arc<Router>,
    delivery: &Arc<Delivery>,
    registry: &Arc<EventRegistry>,
) {
    let trimmed = frame.trim_ascii();
    let Ok(event) = Event::from_bytes(trimmed) else {
        debug!(subscriber = %endpoint.id, "dropping undecodable frame");
        return;
    };

    if let Some((channel, callback)) = registry.resolve(&event.event_name, &event.data) {
        // Subscribing touches the router and the store; keep it off the
        // read loop.
        let endpoint = Arc::clone(endpoint);
        let router = Arc::clone(router);
        let delivery = Arc::clone(delivery);
        spawn_guarded("subscribe", async move {
            if endpoint.subscribe(&channel).is_err() {
                return;
            }
            let sub_id = router.subscribe(&endpoint, &channel, callback);
            endpoint.bind_sub_id(&channel, sub_id);
            delivery.pull_offline(&endpoint).await;
        });
    }

    if event.is_ack() {
        match event.ack_payload() {
            Some(inner) => delivery.ack(endpoint, &inner).await,
            None => debug!(subscriber = %endpoint.id, "dropping malformed ack"),
        }
    }
}

// ---------------------------------------------------------------------------
// Write loop
// ---------------------------------------------------------------------------

/// Sole writer to the socket: drains the outbound queue (coalescing queued
/// messages into one frame) and emits pings. Any write error is terminal.
pub async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut queue: mpsc::Receiver<Vec<u8>>,
    endpoint: Arc<Endpoint>,
    router: Arc<Router>,
) {
    let cancel = endpoint.cancel_token();
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.tick().await; // interval fires immediately; the first ping waits a full period

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            first = queue.recv() => {
                let Some(first) = first else { break };
                let frame = coalesce_queued(first, &mut queue);
                let Ok(text) = String::from_utf8(frame) else {
                    warn!(subscriber = %endpoint.id, "dropping non-UTF-8 outbound frame");
                    continue;
                };
                match tokio::time::timeout(WRITE_WAIT, sink.send(Message::Text(text.into()))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(subscriber = %endpoint.id, error = %e, "write failed");
                        break;
                    }
                    Err(_) => {
                        debug!(subscriber = %endpoint.id, "write deadline expired");
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                let ping_frame = Message::Ping(Vec::new().into());
                match tokio::time::timeout(WRITE_WAIT, sink.send(ping_frame)).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }

    teardown(&endpoint, &router);
}

/// Fold already-queued messages into `first`, newline separated, bounded by
/// the queue depth observed at wake.
fn coalesce_queued(mut first: Vec<u8>, queue: &mut mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
    let depth = queue.len();
    for _ in 0..depth {
        match queue.try_recv() {
            Ok(next) => {
                first.push(FRAME_SEPARATOR);
                first.extend_from_slice(&next);
            }
            Err(_) => break,
        }
    }
    first
}
