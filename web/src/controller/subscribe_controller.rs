//! `GET /.well-known/mercure`: the subscription endpoint.
//!
//! Opens the SSE stream, replays history from `Last-Event-ID`, then follows
//! the live feed. The hub listener is attached before the replay starts so
//! concurrent publications buffer in the subscriber's channel; ids seen
//! during the replay are skipped when the buffer drains, which keeps the
//! client's sequence monotonic in transport order with no duplicates.

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;

use async_stream::stream;
use axum::extract::{RawQuery, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use log::*;

use domain::TopicSelector;
use events::{ConnectionEvent, Hub, HubEvent, SubscriptionEvent};
use sse::{Subscriber, SubscriberRegistry};

use crate::error::{Error, ResponseFormat, Result, WebErrorKind};
use crate::{request_base_url, AppState};

use super::publish_controller::query_param;

/// Subscribes to one or more topic selectors as a Server-Sent Events
/// stream.
pub async fn subscribe(
    State(app_state): State<AppState>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Result<Response> {
    let format = ResponseFormat::negotiate(&headers);
    let fail = |error: Error| error.with_format(format);
    let query = query.unwrap_or_default();

    let query_token = query_param(&query, "authorization");
    let base = request_base_url(&headers);
    let auth = app_state
        .authorizer
        .authorize_subscriber(&headers, query_token.as_deref(), base.as_ref())
        .await
        .map_err(fail)?;
    let (authorized_topics, payload) = match auth {
        Some(subscriber_auth) => (subscriber_auth.selectors, subscriber_auth.payload),
        None => (Vec::new(), None),
    };

    let topics: Vec<String> = url::form_urlencoded::parse(query.as_bytes())
        .filter(|(key, _)| key == "topic")
        .map(|(_, value)| value.into_owned())
        .collect();
    if topics.is_empty() {
        return Err(fail(Error::new(WebErrorKind::MalformedRequest(
            "at least one topic is required".to_owned(),
        ))));
    }
    let max_topics = app_state.config().max_topics;
    if max_topics > 0 && topics.len() > max_topics {
        return Err(fail(Error::new(WebErrorKind::MalformedRequest(format!(
            "too many topics: at most {max_topics} are allowed"
        )))));
    }

    let selectors: Vec<(String, TopicSelector)> = topics
        .into_iter()
        .map(|topic| {
            TopicSelector::compile(&topic, base.as_ref())
                .map(|selector| (topic, selector))
                .map_err(Error::from)
        })
        .collect::<Result<_>>()
        .map_err(fail)?;

    let last_event_id = headers
        .get("last-event-id")
        .and_then(|value| value.to_str().ok())
        .map(ToOwned::to_owned)
        .or_else(|| query_param(&query, "lastEventId"))
        .or_else(|| query_param(&query, "last-event-id"));

    let subscriber = Arc::new(Subscriber::new(
        selectors,
        authorized_topics,
        payload,
        last_event_id.clone(),
    ));
    debug!(
        "Subscriber {} opening with {} subscription(s)",
        subscriber.id(),
        subscriber.subscriptions().len()
    );

    // Attach before the replay: live updates buffer in the listener channel
    // while history streams out.
    let mut listener = app_state.hub().subscribe_events(app_state.config().subscriber_buffer);
    app_state.subscribers().insert(Arc::clone(&subscriber));
    announce(app_state.hub(), &subscriber).await;

    let guard = ConnectionGuard {
        subscriber: Arc::clone(&subscriber),
        hub: app_state.hub().clone(),
        registry: Arc::clone(app_state.subscribers()),
    };

    let hub = app_state.hub().clone();
    let anonymous = app_state.authorizer.anonymous();
    let resume_cursor = last_event_id.clone();
    let event_stream = stream! {
        let _guard = guard;
        subscriber.mark_active();

        let mut replayed: HashSet<String> = HashSet::new();
        if let Some(cursor) = &resume_cursor {
            match hub.events_after(cursor).await {
                Ok(mut history) => {
                    while let Some(update) = history.next().await {
                        if subscriber.can_access(&update, anonymous) {
                            if let Some(frame) = subscriber.dispatch(&update) {
                                replayed.insert(update.id().to_owned());
                                yield Ok::<Event, Infallible>(frame);
                            }
                        }
                    }
                }
                // A failed replay is logged; the subscriber joins live-only.
                Err(e) => warn!("Replay from {cursor} failed: {e}"),
            }
        }

        loop {
            let event = tokio::select! {
                _ = subscriber.closed() => None,
                event = listener.recv() => event,
            };
            match event {
                Some(HubEvent::Update(update)) => {
                    if replayed.contains(update.id()) {
                        continue;
                    }
                    if subscriber.can_access(&update, anonymous) {
                        if let Some(frame) = subscriber.dispatch(&update) {
                            yield Ok(frame);
                        }
                    }
                }
                // Lifecycle events are hub-internal.
                Some(_) => {}
                // Closed, or dropped by the transport on overflow.
                None => break,
            }
        }
    };

    let mut sse = Sse::new(event_stream);
    if let Some(interval) = app_state.config().heartbeat() {
        sse = sse.keep_alive(KeepAlive::new().interval(interval).text(""));
    }

    let mut response = sse.into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("private, no-cache, no-store, must-revalidate, max-age=0"),
    );
    response_headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    response_headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    // Echo the resume cursor so proxies and clients can observe it; it
    // advances with each `id:` field in the body.
    if let Some(cursor) = &last_event_id {
        if let Ok(value) = HeaderValue::from_str(cursor) {
            response_headers.insert("last-event-id", value);
        }
    }
    Ok(response)
}

async fn announce(hub: &Hub, subscriber: &Subscriber) {
    for subscription in subscriber.subscriptions() {
        hub.notify(HubEvent::Subscribe(SubscriptionEvent {
            subscriber: subscriber.id().to_owned(),
            subscription: subscription.id().to_owned(),
            topic: subscription.topic().to_owned(),
        }))
        .await;
    }
    hub.notify(HubEvent::Connect(ConnectionEvent {
        subscriber: subscriber.id().to_owned(),
    }))
    .await;
}

/// Tears the connection down when the response stream is dropped: closes
/// the subscriber, removes it from the registry, and emits the
/// `unsubscribe` / `disconnect` events.
struct ConnectionGuard {
    subscriber: Arc<Subscriber>,
    hub: Hub,
    registry: Arc<SubscriberRegistry>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.subscriber.close();
        self.registry.remove(self.subscriber.id());
        debug!("Subscriber {} closed", self.subscriber.id());

        let hub = self.hub.clone();
        let subscriber = Arc::clone(&self.subscriber);
        tokio::spawn(async move {
            for subscription in subscriber.subscriptions() {
                hub.notify(HubEvent::Unsubscribe(SubscriptionEvent {
                    subscriber: subscriber.id().to_owned(),
                    subscription: subscription.id().to_owned(),
                    topic: subscription.topic().to_owned(),
                }))
                .await;
            }
            hub.notify(HubEvent::Disconnect(ConnectionEvent {
                subscriber: subscriber.id().to_owned(),
            }))
            .await;
        });
    }
}
