//! Process-wide subscriber registry.
//!
//! Tracks every active subscriber so server shutdown can close them all,
//! and exposes the count for logging. Lookups and removals are O(1).

use std::sync::Arc;

use dashmap::DashMap;
use log::*;

use crate::subscriber::Subscriber;

#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: DashMap<String, Arc<Subscriber>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, subscriber: Arc<Subscriber>) {
        self.subscribers
            .insert(subscriber.id().to_owned(), subscriber);
        debug!("{} subscriber(s) connected", self.subscribers.len());
    }

    pub fn remove(&self, subscriber_id: &str) {
        self.subscribers.remove(subscriber_id);
        debug!("{} subscriber(s) connected", self.subscribers.len());
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Closes every subscriber; their streams terminate within one poll.
    pub fn shutdown(&self) {
        info!("Closing {} subscriber(s)", self.subscribers.len());
        for entry in self.subscribers.iter() {
            entry.value().close();
        }
        self.subscribers.clear();
    }
}
