//! In-memory transport.
//!
//! The event log is a ring buffer guarded by a mutex; the append and the
//! listener notification happen under the same lock so every listener
//! observes updates in publication order. Notification is `try_send` only,
//! so the lock is never held across an SSE write and a slow subscriber
//! cannot delay a publisher.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, Mutex};

use domain::Update;
use events::{HubEvent, ListenerId, ListenerRegistry, Transport, TransportError, EARLIEST};

pub struct LocalTransport {
    /// Ring buffer of published updates, oldest first. `capacity` 0 means
    /// unbounded; otherwise the oldest update is evicted on overflow.
    log: Mutex<VecDeque<Arc<Update>>>,
    capacity: usize,
    listeners: ListenerRegistry,
    closed: AtomicBool,
}

impl LocalTransport {
    pub fn new(capacity: usize) -> Self {
        Self {
            log: Mutex::new(VecDeque::new()),
            capacity,
            listeners: ListenerRegistry::new(),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn protocol(&self) -> &'static str {
        "local"
    }

    async fn publish(&self, update: Update) -> Result<Arc<Update>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let update = Arc::new(update);

        let mut log = self.log.lock().await;
        if self.capacity > 0 && log.len() == self.capacity {
            log.pop_front();
        }
        log.push_back(Arc::clone(&update));
        // Notify while the log is locked so concurrent publications cannot
        // reorder between listeners.
        self.listeners.fan_out(&HubEvent::Update(Arc::clone(&update)));
        drop(log);

        Ok(update)
    }

    async fn events_after(
        &self,
        last_event_id: &str,
    ) -> Result<BoxStream<'static, Arc<Update>>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let log = self.log.lock().await;
        let replay: Vec<Arc<Update>> = if last_event_id == EARLIEST {
            log.iter().cloned().collect()
        } else {
            match log.iter().position(|u| u.id() == last_event_id) {
                Some(idx) => log.iter().skip(idx + 1).cloned().collect(),
                // Out of the retention window: the subscriber joins live-only.
                None => Vec::new(),
            }
        };
        drop(log);

        Ok(stream::iter(replay).boxed())
    }

    fn attach(&self, sink: mpsc::Sender<HubEvent>) -> ListenerId {
        self.listeners.attach(sink)
    }

    fn detach(&self, listener: ListenerId) {
        self.listeners.detach(listener);
    }

    async fn dispatch(&self, event: HubEvent) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.listeners.fan_out(&event);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::PublishForm;

    fn update(topic: &str, data: &str) -> Update {
        Update::from_form(PublishForm {
            topics: vec![topic.to_owned()],
            data: Some(data.to_owned()),
            ..Default::default()
        })
        .unwrap()
    }

    async fn collect_ids(stream: BoxStream<'static, Arc<Update>>) -> Vec<String> {
        stream.map(|u| u.id().to_owned()).collect().await
    }

    #[tokio::test]
    async fn listeners_observe_updates_in_publication_order() {
        let transport = LocalTransport::new(0);
        let (tx, mut rx) = mpsc::channel(8);
        transport.attach(tx);

        let first = transport
            .publish(update("https://example.com/a", "1"))
            .await
            .unwrap();
        let second = transport
            .publish(update("https://example.com/a", "2"))
            .await
            .unwrap();

        for expected in [first, second] {
            match rx.recv().await {
                Some(HubEvent::Update(u)) => assert_eq!(u.id(), expected.id()),
                other => panic!("expected update, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn replays_everything_after_the_given_id() {
        let transport = LocalTransport::new(0);
        let mut ids = Vec::new();
        for n in 0..3 {
            let stored = transport
                .publish(update("https://example.com/a", &n.to_string()))
                .await
                .unwrap();
            ids.push(stored.id().to_owned());
        }

        let replayed = collect_ids(transport.events_after(&ids[0]).await.unwrap()).await;
        assert_eq!(replayed, ids[1..]);
    }

    #[tokio::test]
    async fn earliest_replays_the_whole_retention_window() {
        let transport = LocalTransport::new(0);
        let mut ids = Vec::new();
        for n in 0..3 {
            let stored = transport
                .publish(update("https://example.com/a", &n.to_string()))
                .await
                .unwrap();
            ids.push(stored.id().to_owned());
        }

        let replayed = collect_ids(transport.events_after(EARLIEST).await.unwrap()).await;
        assert_eq!(replayed, ids);
    }

    #[tokio::test]
    async fn unknown_id_yields_an_empty_replay() {
        let transport = LocalTransport::new(0);
        transport
            .publish(update("https://example.com/a", "1"))
            .await
            .unwrap();

        let replayed =
            collect_ids(transport.events_after("urn:uuid:unknown").await.unwrap()).await;
        assert!(replayed.is_empty());
    }

    #[tokio::test]
    async fn bounded_log_evicts_the_oldest_update() {
        let transport = LocalTransport::new(2);
        let first = transport
            .publish(update("https://example.com/a", "1"))
            .await
            .unwrap();
        transport
            .publish(update("https://example.com/a", "2"))
            .await
            .unwrap();
        transport
            .publish(update("https://example.com/a", "3"))
            .await
            .unwrap();

        let replayed = collect_ids(transport.events_after(EARLIEST).await.unwrap()).await;
        assert_eq!(replayed.len(), 2);
        // The evicted id is no longer a valid cursor.
        let after_evicted = collect_ids(transport.events_after(first.id()).await.unwrap()).await;
        assert!(after_evicted.is_empty());
    }

    #[tokio::test]
    async fn listeners_attached_after_publication_only_see_history_via_replay() {
        let transport = LocalTransport::new(0);
        let stored = transport
            .publish(update("https://example.com/a", "1"))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        transport.attach(tx);
        assert!(rx.try_recv().is_err());

        let replayed = collect_ids(transport.events_after(EARLIEST).await.unwrap()).await;
        assert_eq!(replayed, vec![stored.id().to_owned()]);
    }

    #[tokio::test]
    async fn closed_transport_rejects_publications() {
        let transport = LocalTransport::new(0);
        transport.close().await;
        let err = transport
            .publish(update("https://example.com/a", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }
}
