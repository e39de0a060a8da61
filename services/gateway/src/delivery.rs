//! Reliable-delivery engine.
//!
//! Tracks, per (channel, subscriber), which messages have been delivered but
//! not acked (waiter), which have been acked (receiver), and the acked-time
//! high-water mark (offset). Publishes land in a per-channel offline log so
//! subscribers that were away — or that lost a message to a full queue or a
//! re-subscribe swap — converge via replay and periodic resend.
//!
//! Store failures are logged and swallowed: the waiter and offset may drift,
//! and the next replay or resend pass repairs them. Nothing here propagates
//! an error to a connection.
//!
//! Message lifecycle per (channel, subscriber): queued → delivered (waiter
//! entry) → acked (receiver entry, offset advanced). TTL expiry is the only
//! collector; there is no explicit terminal state.

use crate::endpoint::Endpoint;
use crate::keys;
use crate::store::DeliveryStore;
use crate::task::spawn_guarded;
use rp_protocol::{Event, now_millis};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Tuning for the engine; one value shared by every connection.
#[derive(Debug, Clone, Copy)]
pub struct DeliveryOptions {
    /// TTL applied to every delivery-state key on write.
    pub expire: Duration,
    /// Resend tick and freshness window. Zero disables the monitor.
    pub resend_interval: Duration,
}

/// Process-wide engine handle; all operations are keyed by
/// (channel, subscriber id).
pub struct Delivery {
    store: Arc<dyn DeliveryStore>,
    opts: DeliveryOptions,
}

impl Delivery {
    pub fn new(store: Arc<dyn DeliveryStore>, opts: DeliveryOptions) -> Self {
        Self { store, opts }
    }

    /// Record a fanned-out payload as delivered-but-unacked.
    ///
    /// Called by the dispatcher after the outbound enqueue attempt, so a
    /// slow writer can never lose the waiter record.
    pub async fn push(&self, channel: &str, subscriber: &str, event: &Event, raw: &[u8]) {
        let key = keys::waiter_key(channel, subscriber);
        if let Err(e) = self.store.hset(&key, &event.id, raw).await {
            warn!(error = %e, key, "waiter append failed");
            return;
        }
        self.refresh_ttl(&key).await;
    }

    /// Process an acknowledgement of `inner` from this endpoint.
    ///
    /// The ack carries no channel, so it is applied against every channel
    /// the endpoint is subscribed to; the store only has keys where the id
    /// was actually held, so stray deletes are no-ops.
    pub async fn ack(&self, endpoint: &Endpoint, inner: &Event) {
        let raw = match inner.to_bytes() {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "unencodable ack payload");
                return;
            }
        };
        for channel in endpoint.channels() {
            let waiter = keys::waiter_key(&channel, endpoint.id());
            if let Err(e) = self.store.hdel(&waiter, &inner.id).await {
                warn!(error = %e, key = waiter, "waiter delete failed");
            }

            let receiver = keys::receiver_key(&channel, endpoint.id());
            match self.store.hset(&receiver, &inner.id, &raw).await {
                Ok(()) => self.refresh_ttl(&receiver).await,
                Err(e) => warn!(error = %e, key = receiver, "receiver append failed"),
            }

            self.update_offset(&channel, endpoint.id(), inner.time).await;
        }
    }

    /// Advance the offset to `t` if `t` exceeds the stored value.
    ///
    /// An unreadable store leaves the offset untouched rather than risking
    /// a regression.
    async fn update_offset(&self, channel: &str, subscriber: &str, t: i64) {
        let key = keys::offset_key(channel, subscriber);
        let current = match self.store.get(&key).await {
            Ok(value) => value.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0),
            Err(e) => {
                warn!(error = %e, key, "offset read failed; skipping update");
                return;
            }
        };
        if current >= t {
            return;
        }
        match self.store.set(&key, &t.to_string()).await {
            Ok(()) => self.refresh_ttl(&key).await,
            Err(e) => warn!(error = %e, key, "offset write failed"),
        }
    }

    /// Replay the offline log for every channel this endpoint is on.
    ///
    /// Entries scored in `[offset, now]` that are not already acked are
    /// re-marked as waiting and enqueued to the connection.
    pub async fn pull_offline(&self, endpoint: &Arc<Endpoint>) {
        for channel in endpoint.channels() {
            let offset_key = keys::offset_key(&channel, endpoint.id());
            let offset = match self.store.get(&offset_key).await {
                Ok(value) => value.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0),
                Err(e) => {
                    warn!(error = %e, key = offset_key, "offset read failed; replaying from 0");
                    0
                }
            };

            let offline = keys::offline_key(&channel);
            let members = match self
                .store
                .zrange_by_score(&offline, offset, now_millis())
                .await
            {
                Ok(members) => members,
                Err(e) => {
                    warn!(error = %e, key = offline, "offline range failed");
                    continue;
                }
            };

            for raw in members {
                let Ok(event) = Event::from_bytes(&raw) else {
                    debug!(channel, "skipping undecodable offline entry");
                    continue;
                };
                if self.already_received(&channel, endpoint.id(), &event.id).await {
                    continue;
                }
                self.push(&channel, endpoint.id(), &event, &raw).await;
                endpoint.try_send(&raw);
            }
        }
    }

    async fn already_received(&self, channel: &str, subscriber: &str, id: &str) -> bool {
        let key = keys::receiver_key(channel, subscriber);
        match self.store.hget(&key, id).await {
            Ok(value) => value.is_some(),
            Err(e) => {
                // Err on the side of redelivery; clients dedupe by id.
                warn!(error = %e, key, "receiver lookup failed");
                false
            }
        }
    }

    /// Append a published payload to the channel's offline log.
    pub async fn append_offline(&self, channel: &str, event: &Event, raw: &[u8]) {
        let key = keys::offline_key(channel);
        match self.store.zadd(&key, event.time, raw).await {
            Ok(()) => self.refresh_ttl(&key).await,
            Err(e) => warn!(error = %e, key, "offline append failed"),
        }
    }

    async fn refresh_ttl(&self, key: &str) {
        if let Err(e) = self.store.expire(key, self.opts.expire).await {
            warn!(error = %e, key, "ttl refresh failed");
        }
    }

    // -----------------------------------------------------------------------
    // Resend monitor
    // -----------------------------------------------------------------------

    /// Start this endpoint's resend monitor, or do nothing when the
    /// interval is zero.
    ///
    /// Each tick re-enqueues every waiter entry old enough to have left the
    /// freshness window, oldest first. Entries stay in the waiter until
    /// acked or TTL-expired, so resending continues until one of those
    /// happens.
    pub fn spawn_resend_monitor(self: &Arc<Self>, endpoint: Arc<Endpoint>) {
        if self.opts.resend_interval.is_zero() {
            debug!(subscriber = %endpoint.id(), "resend monitor disabled");
            return;
        }
        let engine = Arc::clone(self);
        let cancel = endpoint.cancel_token();
        spawn_guarded("resend-monitor", async move {
            let mut ticker = tokio::time::interval(engine.opts.resend_interval);
            ticker.tick().await; // consume the immediate first fire
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => engine.resend_pass(&endpoint).await,
                }
            }
        });
    }

    async fn resend_pass(&self, endpoint: &Endpoint) {
        for channel in endpoint.channels() {
            let key = keys::waiter_key(&channel, endpoint.id());
            let pairs = match self.store.hgetall(&key).await {
                Ok(pairs) => pairs,
                Err(e) => {
                    warn!(error = %e, key, "waiter scan failed");
                    continue;
                }
            };

            // Undecodable entries sort first and are always resent; TTL is
            // their only way out.
            let mut entries: Vec<(i64, Vec<u8>)> = pairs
                .into_iter()
                .map(|(_, raw)| {
                    let time = Event::from_bytes(&raw).map(|e| e.time).unwrap_or(0);
                    (time, raw)
                })
                .collect();
            entries.sort_by_key(|(time, _)| *time);

            let now = now_millis();
            for (time, raw) in entries {
                if self.is_fresh(time, now) {
                    continue;
                }
                endpoint.try_send(&raw);
            }
        }
    }

    /// A message is fresh while the client still has a reasonable chance to
    /// ack the original delivery.
    fn is_fresh(&self, event_time: i64, now: i64) -> bool {
        now - (self.opts.resend_interval.as_millis() as i64) < event_time
    }
}
