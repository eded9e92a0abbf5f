//! Registry of active subscriptions.
//!
//! The registry is the source of truth for what the bridge should be
//! subscribed to. It is consulted on every inbound message (to find the
//! handlers) and on every reconnect (to replay subscriptions). Entries are
//! keyed by topic filter, so subscribing to the same filter again replaces
//! the earlier entry.
//!
//! The registry does no locking of its own. The bridge keeps it, together
//! with the pending-reconnect flag, behind a single `tokio::sync::Mutex`.

use std::{collections::BTreeMap, fmt, sync::Arc};

use rumqttc::mqttbytes::matches;

use crate::dispatcher::MessageHandler;

/// Action run once when a subscription is removed or replaced.
pub type CancelAction = Box<dyn FnOnce() + Send + 'static>;

/// One registered subscription.
pub struct Subscription {
    handler: Arc<dyn MessageHandler>,
    cancel: Option<CancelAction>,
}

impl Subscription {
    pub fn new(handler: Arc<dyn MessageHandler>, cancel: Option<CancelAction>) -> Self {
        Self { handler, cancel }
    }

    /// Consumes the subscription, running its cancel action if it has one.
    pub fn cancel(self) {
        if let Some(cancel) = self.cancel {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("has_cancel", &self.cancel.is_some())
            .finish_non_exhaustive()
    }
}

/// Subscriptions by topic filter, in lexical order.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<String, Subscription>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry for `topic`, returning the replaced one.
    pub fn add(&mut self, topic: impl Into<String>, subscription: Subscription) -> Option<Subscription> {
        self.entries.insert(topic.into(), subscription)
    }

    /// Removes the entry for `topic`. The caller decides whether to cancel it.
    pub fn remove(&mut self, topic: &str) -> Option<Subscription> {
        self.entries.remove(topic)
    }

    /// Point-in-time copy of every topic and its handler.
    pub fn snapshot(&self) -> Vec<(String, Arc<dyn MessageHandler>)> {
        self.entries
            .iter()
            .map(|(topic, sub)| (topic.clone(), Arc::clone(&sub.handler)))
            .collect()
    }

    /// Handlers whose filter matches the concrete `topic`.
    pub fn matching(&self, topic: &str) -> Vec<Arc<dyn MessageHandler>> {
        self.entries
            .iter()
            .filter(|(filter, _)| matches(topic, filter))
            .map(|(_, sub)| Arc::clone(&sub.handler))
            .collect()
    }

    /// Whether the entry for `topic` is the one registered with `handler`.
    pub fn is_current(&self, topic: &str, handler: &Arc<dyn MessageHandler>) -> bool {
        self.entries.get(topic).is_some_and(|sub| {
            std::ptr::eq(
                Arc::as_ptr(&sub.handler) as *const (),
                Arc::as_ptr(handler) as *const (),
            )
        })
    }

    pub fn topics(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.entries.contains_key(topic)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
