//! Fan-out of every inbound frame to independent listeners.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock, Weak};

use log::{debug, error};
use uuid::Uuid;

use crate::common::protocol::InboundMessage;

/// A listener for inbound frames. Returning an error only gets it logged.
pub trait Subscriber: Send + Sync {
    fn on_message(&self, message: &InboundMessage) -> anyhow::Result<()>;
}

impl<F> Subscriber for F
where
    F: Fn(&InboundMessage) -> anyhow::Result<()> + Send + Sync,
{
    fn on_message(&self, message: &InboundMessage) -> anyhow::Result<()> {
        self(message)
    }
}

type Entries = RwLock<Vec<(Uuid, Arc<dyn Subscriber>)>>;

#[derive(Clone, Default)]
pub struct SubscriberRegistry {
    entries: Arc<Entries>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<S>(&self, subscriber: S) -> Subscription
    where
        S: Subscriber + 'static,
    {
        let id = Uuid::new_v4();
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(subscriber)));
        debug!("Subscriber {} registered", id);
        Subscription {
            id,
            registry: Arc::downgrade(&self.entries),
        }
    }

    /// Deliver `message` to a snapshot of the current subscribers.
    pub fn publish(&self, message: &InboundMessage) {
        // Snapshot so callbacks may (un)subscribe while we iterate.
        let snapshot: Vec<(Uuid, Arc<dyn Subscriber>)> = self
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for (id, subscriber) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| subscriber.on_message(message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Subscriber {} failed on {}: {:#}", id, message.kind, e),
                Err(_) => error!("Subscriber {} panicked on {}", id, message.kind),
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle returned by [`SubscriberRegistry::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: Uuid,
    registry: Weak<Entries>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn unsubscribe(self) {}

    /// Keep the subscriber registered for the lifetime of the registry.
    pub fn detach(mut self) {
        self.registry = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(entries) = self.registry.upgrade() {
            entries
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|(id, _)| *id != self.id);
            debug!("Subscriber {} removed", self.id);
        }
    }
}
