// rp-protocol: Wire types for the relaypub gateway.
//
// Every frame on the wire — inbound subscribe/ack frames, outbound fan-out
// payloads, offline-log members — is the JSON encoding of a single `Event`.
// The field names are frozen; changing them breaks deployed clients.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Reserved event name carrying an acknowledgement.
///
/// An ack frame's `data` field holds the JSON encoding of the *inner* event
/// being acknowledged. The name can never be registered as an application
/// event.
pub const ACK_EVENT: &str = "ack";

/// Separator between messages coalesced into one WebSocket frame.
///
/// The write side may pack several queued messages into a single text frame;
/// clients must split frames on this byte before JSON-decoding.
pub const FRAME_SEPARATOR: u8 = b'\n';

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// The one message shape of the protocol.
///
/// `id` is a globally unique opaque string (see [`next_event_id`]) and the
/// basis for ack matching and replay dedup. `time` is wall-clock
/// milliseconds; it scores the offline log and drives the resend freshness
/// window. All fields default so that partial frames (e.g. acks without an
/// outer `id`) still decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub event_name: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub time: i64,
}

impl Event {
    /// Decode an event from raw frame bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Encode to the wire representation.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Whether this is the reserved ack frame.
    pub fn is_ack(&self) -> bool {
        self.event_name == ACK_EVENT
    }

    /// Decode the inner event of an ack frame.
    ///
    /// Returns `None` when this frame is not an ack or its `data` is not a
    /// JSON-encoded event — malformed acks are dropped, not surfaced.
    pub fn ack_payload(&self) -> Option<Event> {
        if !self.is_ack() {
            return None;
        }
        serde_json::from_str(&self.data).ok()
    }
}

// ---------------------------------------------------------------------------
// Frame coalescing
// ---------------------------------------------------------------------------

/// Split a possibly-coalesced frame into individual message payloads.
///
/// Empty segments (e.g. a trailing separator) are skipped.
pub fn split_coalesced(frame: &[u8]) -> impl Iterator<Item = &[u8]> {
    frame
        .split(|b| *b == FRAME_SEPARATOR)
        .filter(|seg| !seg.is_empty())
}

// ---------------------------------------------------------------------------
// Event id generation
// ---------------------------------------------------------------------------

static ID_COUNTER: AtomicI64 = AtomicI64::new(0);

/// Generate a time-prefixed, process-unique event id.
///
/// Layout: `YYYYmmddHHMMSS` + milliseconds (3 digits) + pid mod 1000
/// (3 digits) + per-process counter mod 10000 (4 digits). Time-prefixed ids
/// sort roughly by creation time, which keeps offline-log members readable
/// when debugging against a live store.
pub fn next_event_id() -> String {
    next_event_id_at(chrono::Utc::now())
}

fn next_event_id_at(now: chrono::DateTime<chrono::Utc>) -> String {
    let millis = now.timestamp_subsec_millis() % 1000;
    let pid = std::process::id() % 1000;
    let count = ID_COUNTER.fetch_add(1, Ordering::Relaxed).rem_euclid(10_000);
    format!(
        "{}{:03}{:03}{:04}",
        now.format("%Y%m%d%H%M%S"),
        millis,
        pid,
        count
    )
}

/// Current wall-clock time in milliseconds, the `Event::time` dimension.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
