//! Redis Streams transport.
//!
//! One append-only stream per event kind (`mercure:update`,
//! `mercure:connect`, ...). Publications are `XADD`ed and *not* fanned out
//! locally: a background reader tails every stream with a per-stream cursor
//! (starting at `$`, new entries only) and re-dispatches each received entry
//! to the local listeners, so every hub instance sharing the Redis server
//! sees every event exactly once.
//!
//! The reader survives transient errors by logging, backing off, and
//! reconnecting; it stops when the transport is closed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ::redis::streams::{StreamRangeReply, StreamReadOptions, StreamReadReply};
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use log::*;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use domain::Update;
use events::{
    ConnectionEvent, EventKind, HubEvent, ListenerId, ListenerRegistry, SubscriptionEvent,
    Transport, TransportError, EARLIEST,
};

const STREAM_PREFIX: &str = "mercure:";
/// How long one blocking read waits before the loop re-checks cancellation.
const READ_BLOCK_MS: usize = 5_000;
const READ_BATCH: usize = 64;
const RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct RedisTransport {
    connection: ::redis::aio::MultiplexedConnection,
    listeners: Arc<ListenerRegistry>,
    cancel: CancellationToken,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

fn backend(err: ::redis::RedisError) -> TransportError {
    TransportError::Backend(Box::new(err))
}

fn stream_key(kind: EventKind) -> String {
    format!("{STREAM_PREFIX}{}", kind.stream_name())
}

impl RedisTransport {
    /// Establishes the publishing connection and starts the stream reader.
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = Client::open(url).map_err(|_| TransportError::InvalidUrl(url.to_owned()))?;
        let connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(backend)?;
        let reader_connection = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(backend)?;

        let listeners = Arc::new(ListenerRegistry::new());
        let cancel = CancellationToken::new();
        let reader = tokio::spawn(reader_loop(
            client,
            reader_connection,
            Arc::clone(&listeners),
            cancel.clone(),
        ));

        Ok(Self {
            connection,
            listeners,
            cancel,
            reader: std::sync::Mutex::new(Some(reader)),
        })
    }
}

#[async_trait]
impl Transport for RedisTransport {
    fn protocol(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, update: Update) -> Result<Arc<Update>, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let update = Arc::new(update);
        let payload = serde_json::to_string(&*update)?;

        let mut connection = self.connection.clone();
        let _entry: String = connection
            .xadd(
                stream_key(EventKind::Update),
                "*",
                &[("id", update.id()), ("payload", payload.as_str())],
            )
            .await
            .map_err(backend)?;

        // Local listeners are notified by the stream reader, which tails the
        // update stream we just appended to.
        Ok(update)
    }

    async fn events_after(
        &self,
        last_event_id: &str,
    ) -> Result<BoxStream<'static, Arc<Update>>, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let mut connection = self.connection.clone();
        let reply: StreamRangeReply = connection
            .xrange(stream_key(EventKind::Update), "-", "+")
            .await
            .map_err(backend)?;

        let mut replay = Vec::new();
        let mut found = last_event_id == EARLIEST;
        for entry in reply.ids {
            let Some(payload) = entry.get::<String>("payload") else {
                warn!("Skipping malformed update stream entry {}", entry.id);
                continue;
            };
            let update: Update = match serde_json::from_str(&payload) {
                Ok(update) => update,
                Err(e) => {
                    warn!("Skipping undecodable update stream entry {}: {e}", entry.id);
                    continue;
                }
            };
            if found {
                replay.push(Arc::new(update));
            } else if update.id() == last_event_id {
                found = true;
            }
        }
        // When the id was never found the replay stays empty and the
        // subscriber joins live-only, matching the in-memory adapter.

        Ok(stream::iter(replay).boxed())
    }

    fn attach(&self, sink: mpsc::Sender<HubEvent>) -> ListenerId {
        self.listeners.attach(sink)
    }

    fn detach(&self, listener: ListenerId) {
        self.listeners.detach(listener);
    }

    async fn dispatch(&self, event: HubEvent) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let (entry_id, payload) = match &event {
            HubEvent::Update(update) => (update.id().to_owned(), serde_json::to_string(&**update)?),
            HubEvent::Connect(connection) | HubEvent::Disconnect(connection) => {
                (connection.subscriber.clone(), serde_json::to_string(connection)?)
            }
            HubEvent::Subscribe(subscription) | HubEvent::Unsubscribe(subscription) => (
                subscription.subscription.clone(),
                serde_json::to_string(subscription)?,
            ),
        };

        let mut connection = self.connection.clone();
        let _entry: String = connection
            .xadd(
                stream_key(event.kind()),
                "*",
                &[("id", entry_id.as_str()), ("payload", payload.as_str())],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn close(&self) {
        self.cancel.cancel();
        let reader = self.reader.lock().ok().and_then(|mut guard| guard.take());
        if let Some(reader) = reader {
            if let Err(e) = reader.await {
                warn!("Stream reader ended abnormally: {e}");
            }
        }
        self.listeners.clear();
        debug!("Redis transport closed");
    }
}

/// Tails every event stream and re-dispatches entries to local listeners.
async fn reader_loop(
    client: Client,
    mut connection: ::redis::aio::MultiplexedConnection,
    listeners: Arc<ListenerRegistry>,
    cancel: CancellationToken,
) {
    let keys: Vec<String> = EventKind::ALL.iter().map(|kind| stream_key(*kind)).collect();
    // `$` means "entries appended after this read starts".
    let mut cursors: HashMap<String, String> = keys
        .iter()
        .map(|key| (key.clone(), "$".to_owned()))
        .collect();

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let ids: Vec<String> = keys.iter().map(|key| cursors[key].clone()).collect();
        let options = StreamReadOptions::default()
            .block(READ_BLOCK_MS)
            .count(READ_BATCH);

        let reply = tokio::select! {
            _ = cancel.cancelled() => break,
            reply = connection.xread_options::<_, _, StreamReadReply>(&keys, &ids, &options) => reply,
        };

        match reply {
            Ok(reply) => {
                for stream in reply.keys {
                    let kind = match kind_for_key(&stream.key) {
                        Some(kind) => kind,
                        None => continue,
                    };
                    for entry in stream.ids {
                        cursors.insert(stream.key.clone(), entry.id.clone());
                        match decode_entry(kind, &entry) {
                            Some(event) => listeners.fan_out(&event),
                            None => warn!(
                                "Skipping undecodable {} stream entry {}",
                                kind.stream_name(),
                                entry.id
                            ),
                        }
                    }
                }
            }
            Err(e) => {
                error!("Stream read failed: {e}; reconnecting");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
                match client.get_multiplexed_tokio_connection().await {
                    Ok(fresh) => connection = fresh,
                    Err(e) => warn!("Reconnect failed: {e}; will retry"),
                }
            }
        }
    }
    debug!("Stream reader stopped");
}

fn kind_for_key(key: &str) -> Option<EventKind> {
    let name = key.strip_prefix(STREAM_PREFIX)?;
    EventKind::ALL
        .iter()
        .copied()
        .find(|kind| kind.stream_name() == name)
}

fn decode_entry(kind: EventKind, entry: &::redis::streams::StreamId) -> Option<HubEvent> {
    let payload: String = entry.get("payload")?;
    match kind {
        EventKind::Update => {
            let update: Update = serde_json::from_str(&payload).ok()?;
            Some(HubEvent::Update(Arc::new(update)))
        }
        EventKind::Connect => {
            let event: ConnectionEvent = serde_json::from_str(&payload).ok()?;
            Some(HubEvent::Connect(event))
        }
        EventKind::Disconnect => {
            let event: ConnectionEvent = serde_json::from_str(&payload).ok()?;
            Some(HubEvent::Disconnect(event))
        }
        EventKind::Subscribe => {
            let event: SubscriptionEvent = serde_json::from_str(&payload).ok()?;
            Some(HubEvent::Subscribe(event))
        }
        EventKind::Unsubscribe => {
            let event: SubscriptionEvent = serde_json::from_str(&payload).ok()?;
            Some(HubEvent::Unsubscribe(event))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_keys_carry_the_hub_prefix() {
        assert_eq!(stream_key(EventKind::Update), "mercure:update");
        assert_eq!(kind_for_key("mercure:disconnect"), Some(EventKind::Disconnect));
        assert_eq!(kind_for_key("other:update"), None);
        assert_eq!(kind_for_key("mercure:unknown"), None);
    }
}
