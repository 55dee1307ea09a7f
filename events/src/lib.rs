//! Event system infrastructure for the hub.
//!
//! This crate provides the typed event bus that enables loose coupling
//! between the HTTP handlers and the transport adapters:
//!
//! - **HubEvent**: enum representing everything that flows through the hub
//!   (updates plus connection lifecycle events)
//! - **Transport**: the contract every event-log adapter implements
//! - **Hub**: thin facade over a shared transport; the single process-wide
//!   event bus higher layers depend on
//!
//! This crate depends only on `domain`, avoiding circular dependencies;
//! adapters live in the `transport` crate and implement [`Transport`].

use std::error::Error as StdError;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::stream::BoxStream;
use log::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use domain::Update;

/// Sentinel `Last-Event-ID` value meaning "replay from the beginning of the
/// retention window".
pub const EARLIEST: &str = "earliest";

/// Everything that can be dispatched on the hub bus.
///
/// Updates are shared behind `Arc` so a single publication fans out to any
/// number of listeners without copying the payload.
#[derive(Clone, Debug)]
pub enum HubEvent {
    Update(Arc<Update>),
    Connect(ConnectionEvent),
    Disconnect(ConnectionEvent),
    Subscribe(SubscriptionEvent),
    Unsubscribe(SubscriptionEvent),
}

/// Payload of `connect` / `disconnect` events.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub subscriber: String,
}

/// Payload of `subscribe` / `unsubscribe` events, one per subscription.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    pub subscriber: String,
    pub subscription: String,
    pub topic: String,
}

/// Discriminant of a [`HubEvent`]; doubles as the stream name in the
/// distributed transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Update,
    Connect,
    Disconnect,
    Subscribe,
    Unsubscribe,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Update,
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::Subscribe,
        EventKind::Unsubscribe,
    ];

    pub fn stream_name(&self) -> &'static str {
        match self {
            EventKind::Update => "update",
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::Subscribe => "subscribe",
            EventKind::Unsubscribe => "unsubscribe",
        }
    }
}

impl HubEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HubEvent::Update(_) => EventKind::Update,
            HubEvent::Connect(_) => EventKind::Connect,
            HubEvent::Disconnect(_) => EventKind::Disconnect,
            HubEvent::Subscribe(_) => EventKind::Subscribe,
            HubEvent::Unsubscribe(_) => EventKind::Unsubscribe,
        }
    }
}

/// Errors surfaced by transport adapters.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,

    #[error("failed to serialize event payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid transport URL \"{0}\"")]
    InvalidUrl(String),

    #[error("unsupported transport scheme \"{0}\"")]
    UnsupportedScheme(String),

    #[error("transport backend error: {0}")]
    Backend(#[source] Box<dyn StdError + Send + Sync>),
}

/// The ordered, replayable event log behind the hub.
///
/// Guarantees, for a single transport instance:
///
/// 1. listeners observe updates in publication order;
/// 2. `events_after(id)` yields every update published strictly after `id`;
///    an id outside the retention window yields an empty replay (the caller
///    joins live-only);
/// 3. a publication reaches each currently attached listener exactly once;
///    listeners attached afterwards only see it through `events_after`;
/// 4. a slow listener never blocks the publisher: its bounded sink is
///    dropped instead (disconnect-on-overflow).
#[async_trait]
pub trait Transport: Send + Sync {
    /// URL scheme this adapter handles.
    fn protocol(&self) -> &'static str;

    /// Durably appends the update and notifies listeners.
    ///
    /// Returns the stored update so callers can read the possibly
    /// server-assigned id.
    async fn publish(&self, update: Update) -> Result<Arc<Update>, TransportError>;

    /// Replays updates published after `last_event_id` (or all of them for
    /// [`EARLIEST`]).
    async fn events_after(
        &self,
        last_event_id: &str,
    ) -> Result<BoxStream<'static, Arc<Update>>, TransportError>;

    /// Registers a listener sink for every subsequent event.
    fn attach(&self, sink: mpsc::Sender<HubEvent>) -> ListenerId;

    /// Removes a listener; safe to call for an already removed id.
    fn detach(&self, listener: ListenerId);

    /// Dispatches a lifecycle event (everything but `Update`) to listeners.
    async fn dispatch(&self, event: HubEvent) -> Result<(), TransportError>;

    /// Releases resources; safe to call once.
    async fn close(&self);
}

/// Opaque handle to an attached listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(Uuid);

impl ListenerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ListenerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener bookkeeping shared by transport adapters.
///
/// Fan-out uses `try_send` so a publisher is never parked on a slow
/// consumer; a listener whose sink is full or gone is removed and will
/// observe the closed channel as its disconnect signal.
#[derive(Default)]
pub struct ListenerRegistry {
    sinks: DashMap<ListenerId, mpsc::Sender<HubEvent>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, sink: mpsc::Sender<HubEvent>) -> ListenerId {
        let id = ListenerId::new();
        self.sinks.insert(id, sink);
        id
    }

    pub fn detach(&self, id: ListenerId) {
        self.sinks.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Drops every sink; their receivers observe a closed channel.
    pub fn clear(&self) {
        self.sinks.clear();
    }

    /// Delivers `event` to every attached sink exactly once.
    pub fn fan_out(&self, event: &HubEvent) {
        let mut dead = Vec::new();
        for entry in self.sinks.iter() {
            if let Err(e) = entry.value().try_send(event.clone()) {
                warn!(
                    "Dropping listener {:?}: {e}. Its subscriber will be disconnected.",
                    entry.key()
                );
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.sinks.remove(&id);
        }
    }
}

/// Thin facade over the shared transport.
///
/// Exists so higher layers depend on a small, stable surface; cloneable and
/// stored in the application state.
#[derive(Clone)]
pub struct Hub {
    transport: Arc<dyn Transport>,
}

impl Hub {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Appends the update to the log and fans it out to listeners.
    pub async fn publish(&self, update: Update) -> Result<Arc<Update>, TransportError> {
        self.transport.publish(update).await
    }

    /// Replays updates published after `last_event_id`.
    pub async fn events_after(
        &self,
        last_event_id: &str,
    ) -> Result<BoxStream<'static, Arc<Update>>, TransportError> {
        self.transport.events_after(last_event_id).await
    }

    /// Attaches a listener with a bounded buffer and returns a guard that
    /// detaches it on drop.
    pub fn subscribe_events(&self, capacity: usize) -> EventListener {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = self.transport.attach(tx);
        EventListener {
            id,
            receiver: rx,
            transport: Arc::clone(&self.transport),
        }
    }

    /// Emits a lifecycle event; failures are logged, not propagated, since
    /// lifecycle notification must never fail a request.
    pub async fn notify(&self, event: HubEvent) {
        if let Err(e) = self.transport.dispatch(event).await {
            warn!("Failed to dispatch lifecycle event: {e}");
        }
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

/// A registered hub listener; detaches itself when dropped.
pub struct EventListener {
    id: ListenerId,
    receiver: mpsc::Receiver<HubEvent>,
    transport: Arc<dyn Transport>,
}

impl EventListener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Receives the next event; `None` once the transport dropped this
    /// listener (overflow or shutdown).
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.receiver.recv().await
    }
}

impl Drop for EventListener {
    fn drop(&mut self) {
        self.transport.detach(self.id);
    }
}
