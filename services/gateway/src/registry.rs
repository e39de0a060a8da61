//! Event registry: `event name → (channel resolver, delivery callback)`.
//!
//! Application code registers its events once at startup; the read loop
//! consults the registry for every inbound frame. Lookups vastly outnumber
//! registrations, and registration is rejected outright once the first
//! subscription has gone through — a handler appearing mid-flight would see
//! only some of the connected endpoints.

use crate::endpoint::Endpoint;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Maps an inbound frame's `data` to the channel to subscribe.
pub type ChannelResolver = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Invoked by the dispatcher for every fanned-out payload.
pub type DeliveryCallback = Arc<dyn Fn(&Endpoint, &[u8]) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry is frozen; register events before the first subscription")]
    Frozen,
    #[error("event name is reserved")]
    Reserved,
}

struct Registration {
    resolver: Option<ChannelResolver>,
    callback: DeliveryCallback,
}

/// Process-wide event registry, shared by the router and every endpoint.
pub struct EventRegistry {
    handlers: RwLock<HashMap<String, Registration>>,
    frozen: AtomicBool,
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EventRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            frozen: AtomicBool::new(false),
        }
    }

    /// Register an event. Re-registering an existing name is a no-op.
    ///
    /// A `None` resolver means the channel equals the event name.
    pub fn register(
        &self,
        event_name: &str,
        resolver: Option<ChannelResolver>,
        callback: DeliveryCallback,
    ) -> Result<(), RegistryError> {
        if event_name == rp_protocol::ACK_EVENT {
            return Err(RegistryError::Reserved);
        }
        if self.frozen.load(Ordering::Acquire) {
            return Err(RegistryError::Frozen);
        }
        let mut handlers = self.handlers.write().expect("registry lock poisoned");
        handlers
            .entry(event_name.to_owned())
            .or_insert(Registration {
                resolver,
                callback,
            });
        Ok(())
    }

    /// Resolve an inbound frame to its target channel and callback.
    ///
    /// Returns `None` for unknown event names, which the read loop ignores.
    pub fn resolve(&self, event_name: &str, data: &str) -> Option<(String, DeliveryCallback)> {
        let handlers = self.handlers.read().expect("registry lock poisoned");
        let registration = handlers.get(event_name)?;
        let channel = match &registration.resolver {
            Some(resolver) => resolver(data),
            None => event_name.to_owned(),
        };
        Some((channel, Arc::clone(&registration.callback)))
    }

    /// Stop accepting registrations. Called by the router on the first
    /// subscription; calling it again is harmless.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }
}

/// The standard delivery callback: enqueue the payload to the endpoint's
/// outbound queue (non-blocking; a full queue drops the fast path and the
/// resend monitor picks the message up from the waiter).
pub fn forward_to_endpoint() -> DeliveryCallback {
    Arc::new(|endpoint, payload| {
        endpoint.try_send(payload);
    })
}
