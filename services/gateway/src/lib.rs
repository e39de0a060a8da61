// gateway: Reliable WebSocket pub/sub gateway over a Redis backbone.
//
// Subscribers hold persistent WebSocket connections; publishers push to
// named channels; every message eventually reaches every subscriber that
// was subscribed at or after publication, across disconnects, via acks,
// an offline replay log, and a periodic resend loop.

pub mod backbone;
pub mod config;
pub mod delivery;
pub mod endpoint;
pub mod keys;
pub mod registry;
pub mod router;
pub mod store;
pub mod task;
pub mod ws;

pub use ws::{GatewayState, api_router};
