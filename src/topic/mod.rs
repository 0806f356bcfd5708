//! Topic matching and subscription management
//!
//! Local subscriptions are kept per client; routing walks every client's
//! filters, which is adequate for the small client population a bridge
//! serves.

use std::sync::Arc;

use dashmap::DashMap;

use crate::protocol::QoS;

/// Check whether a topic name matches a topic filter
///
/// Supports the `+` single-level and `#` multi-level wildcards. Topics
/// starting with `$` are never matched by a filter starting with a wildcard.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            // # matches everything remaining, including the parent level
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A local subscription entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub filter: String,
    pub qos: QoS,
}

/// Thread-safe subscription store keyed by client id
#[derive(Default)]
pub struct SubscriptionStore {
    clients: DashMap<Arc<str>, Vec<Subscription>>,
}

impl SubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a subscription for a client
    pub fn subscribe(&self, client_id: &Arc<str>, filter: &str, qos: QoS) {
        let mut subs = self.clients.entry(client_id.clone()).or_default();
        subs.retain(|s| s.filter != filter);
        subs.push(Subscription {
            filter: filter.to_string(),
            qos,
        });
    }

    /// Remove a subscription, returning whether it existed
    pub fn unsubscribe(&self, client_id: &str, filter: &str) -> bool {
        match self.clients.get_mut(client_id) {
            Some(mut subs) => {
                let before = subs.len();
                subs.retain(|s| s.filter != filter);
                subs.len() != before
            }
            None => false,
        }
    }

    /// Drop every subscription of a client
    pub fn remove_client(&self, client_id: &str) {
        self.clients.remove(client_id);
    }

    /// Clients subscribed to a topic, with the highest granted QoS per client
    pub fn matches(&self, topic: &str) -> Vec<(Arc<str>, QoS)> {
        self.clients
            .iter()
            .filter_map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|s| topic_matches_filter(topic, &s.filter))
                    .map(|s| s.qos)
                    .max()
                    .map(|qos| (entry.key().clone(), qos))
            })
            .collect()
    }

    /// Number of clients holding at least one subscription
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}
