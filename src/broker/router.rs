//! Message Router
//!
//! Fans accepted publishes out to connected local subscribers.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::protocol::Publish;
use crate::topic::SubscriptionStore;

/// Capacity of each client's outbound queue
pub const OUTBOUND_CAPACITY: usize = 1024;

/// Routes messages between local publishers and subscribers
#[derive(Default)]
pub struct MessageRouter {
    subscriptions: SubscriptionStore,
    /// Connected clients by id
    clients: DashMap<Arc<str>, ClientHandle>,
}

/// Outbound queue of a connected client plus the token that ends its session
#[derive(Clone)]
pub struct ClientHandle {
    pub sender: mpsc::Sender<Publish>,
    pub kick: CancellationToken,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriptions(&self) -> &SubscriptionStore {
        &self.subscriptions
    }

    /// Register a client, ending any previous session with the same id.
    /// The new session starts without subscriptions.
    pub fn register(&self, client_id: &Arc<str>, handle: ClientHandle) {
        self.subscriptions.remove_client(client_id);
        if let Some(previous) = self.clients.insert(client_id.clone(), handle) {
            debug!(client_id = %client_id, "Session taken over by new connection");
            previous.kick.cancel();
        }
    }

    /// Remove a client if `sender` still belongs to its current session.
    /// Returns false when a newer connection has taken over the id.
    pub fn unregister(&self, client_id: &str, sender: &mpsc::Sender<Publish>) -> bool {
        let removed = self
            .clients
            .remove_if(client_id, |_, current| current.sender.same_channel(sender))
            .is_some();
        if removed {
            self.subscriptions.remove_client(client_id);
        }
        removed
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Deliver a publish to every matching subscriber; returns the number of
    /// clients the message was queued for
    pub fn route(&self, publish: &Publish) -> usize {
        let mut delivered = 0;
        for (client_id, granted) in self.subscriptions.matches(&publish.topic) {
            let Some(client) = self.clients.get(&client_id) else {
                continue;
            };

            let outgoing = Publish {
                dup: false,
                qos: publish.qos.min(granted),
                retain: false,
                topic: publish.topic.clone(),
                packet_id: None,
                payload: publish.payload.clone(),
            };

            match client.sender.try_send(outgoing) {
                Ok(()) => delivered += 1,
                Err(e) => trace!(client_id = %client_id, "Dropping message: {}", e),
            }
        }
        delivered
    }
}
