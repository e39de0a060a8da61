//! In-memory [`Backbone`] built on a broadcast channel.
//!
//! Preserves the contract the router relies on: per-channel ordering, no
//! persistence, and wholesale subscription swaps. Tests can inspect the
//! channel set of the most recent subscription to assert union maintenance.

use async_trait::async_trait;
use gateway::backbone::{Backbone, BackboneError, BackboneStream};
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::broadcast;

pub struct MemoryBackbone {
    tx: broadcast::Sender<(String, Vec<u8>)>,
    current: Mutex<Vec<String>>,
    subscribe_calls: Mutex<u64>,
}

impl Default for MemoryBackbone {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackbone {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self {
            tx,
            current: Mutex::new(Vec::new()),
            subscribe_calls: Mutex::new(0),
        }
    }

    /// Channel set of the most recent `subscribe` call.
    pub fn current_channels(&self) -> Vec<String> {
        self.current.lock().expect("lock poisoned").clone()
    }

    /// How many times a subscription has been (re)opened.
    pub fn subscribe_count(&self) -> u64 {
        *self.subscribe_calls.lock().expect("lock poisoned")
    }
}

#[async_trait]
impl Backbone for MemoryBackbone {
    async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), BackboneError> {
        // No receiver connected is not an error; the message just vanishes,
        // exactly like a broker with no subscribers.
        let _ = self.tx.send((channel.to_owned(), payload.to_vec()));
        Ok(())
    }

    async fn subscribe(
        &self,
        channels: &[String],
    ) -> Result<Box<dyn BackboneStream>, BackboneError> {
        let mut sorted = channels.to_vec();
        sorted.sort_unstable();
        *self.current.lock().expect("lock poisoned") = sorted;
        *self.subscribe_calls.lock().expect("lock poisoned") += 1;
        Ok(Box::new(MemoryBackboneStream {
            rx: self.tx.subscribe(),
            channels: channels.iter().cloned().collect(),
        }))
    }
}

struct MemoryBackboneStream {
    rx: broadcast::Receiver<(String, Vec<u8>)>,
    channels: HashSet<String>,
}

#[async_trait]
impl BackboneStream for MemoryBackboneStream {
    async fn next_message(&mut self) -> Option<(String, Vec<u8>)> {
        loop {
            match self.rx.recv().await {
                Ok((channel, payload)) if self.channels.contains(&channel) => {
                    return Some((channel, payload));
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
