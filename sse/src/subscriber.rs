//! The per-connection subscriber state machine.

use std::sync::Mutex;

use serde_json::Value;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use domain::{TopicSelector, Update};

use crate::frame;

/// Lifecycle of a subscriber.
///
/// - `Opening`: the request is parsed and authorized but the response head
///   has not been written yet.
/// - `Active`: receiving dispatched updates.
/// - `Closing`: peer abort, server shutdown, or a write failure; no further
///   dispatches happen.
/// - `Closed`: resources released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriberState {
    Opening,
    Active,
    Closing,
    Closed,
}

/// One `topic` query parameter of a subscriber.
///
/// Holds the subscriber's id rather than a reference, breaking the
/// subscriber/subscription cycle; the subscriber owns its subscriptions.
#[derive(Clone, Debug)]
pub struct Subscription {
    id: String,
    subscriber: String,
    topic: String,
    selector: TopicSelector,
}

impl Subscription {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the owning subscriber.
    pub fn subscriber(&self) -> &str {
        &self.subscriber
    }

    /// The selector expression as the client sent it.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn selector(&self) -> &TopicSelector {
        &self.selector
    }
}

/// A connected SSE client.
pub struct Subscriber {
    id: String,
    subscriptions: Vec<Subscription>,
    authorized_topics: Vec<TopicSelector>,
    payload: Option<Value>,
    last_event_id: Mutex<Option<String>>,
    state: Mutex<SubscriberState>,
    cancel: CancellationToken,
}

impl Subscriber {
    /// Creates a subscriber in the `Opening` state with one subscription per
    /// requested topic.
    pub fn new(
        topics: Vec<(String, TopicSelector)>,
        authorized_topics: Vec<TopicSelector>,
        payload: Option<Value>,
        last_event_id: Option<String>,
    ) -> Self {
        let id = format!("urn:uuid:{}", Uuid::new_v4());
        let subscriptions = topics
            .into_iter()
            .map(|(topic, selector)| Subscription {
                id: format!("urn:uuid:{}", Uuid::new_v4()),
                subscriber: id.clone(),
                topic,
                selector,
            })
            .collect();
        Self {
            id,
            subscriptions,
            authorized_topics,
            payload,
            last_event_id: Mutex::new(last_event_id),
            state: Mutex::new(SubscriberState::Opening),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    /// The id of the most recently dispatched update (or the resume cursor
    /// the client connected with).
    pub fn last_event_id(&self) -> Option<String> {
        self.last_event_id.lock().expect("state lock poisoned").clone()
    }

    pub fn state(&self) -> SubscriberState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn is_active(&self) -> bool {
        self.state() == SubscriberState::Active
    }

    /// Marks the response head as written; dispatching may begin.
    pub fn mark_active(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == SubscriberState::Opening {
            *state = SubscriberState::Active;
        }
    }

    /// Transitions to `Closing` then `Closed`, cancelling the connection's
    /// pending work. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock().expect("state lock poisoned");
        if *state == SubscriberState::Closed {
            return;
        }
        *state = SubscriberState::Closing;
        self.cancel.cancel();
        *state = SubscriberState::Closed;
    }

    /// Resolves when the subscriber is asked to close (server shutdown).
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Whether this subscriber may receive `update`.
    ///
    /// True iff one of its subscriptions matches the update's topic set,
    /// and the update is public or one of the token's `subscribe` selectors
    /// matches the same set. With anonymous access disabled, a subscriber
    /// without authorized topics receives nothing at all.
    pub fn can_access(&self, update: &Update, anonymous_allowed: bool) -> bool {
        if !anonymous_allowed && self.authorized_topics.is_empty() {
            return false;
        }
        let topics: Vec<&str> = update.topics().collect();
        if !self
            .subscriptions
            .iter()
            .any(|subscription| subscription.selector.matches_any(topics.iter().copied()))
        {
            return false;
        }
        if !update.private() {
            return true;
        }
        self.authorized_topics
            .iter()
            .any(|selector| selector.matches_any(topics.iter().copied()))
    }

    /// Produces the SSE frame for `update`, recording the new
    /// `last_event_id` before the write is attempted. Returns `None` once
    /// the subscriber is no longer active.
    pub fn dispatch(&self, update: &Update) -> Option<axum::response::sse::Event> {
        if !self.is_active() {
            return None;
        }
        *self.last_event_id.lock().expect("state lock poisoned") = Some(update.id().to_owned());
        Some(frame::update_frame(update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::PublishForm;

    fn selector(expr: &str) -> TopicSelector {
        TopicSelector::compile(expr, None).unwrap()
    }

    fn subscriber(topics: &[&str], authorized: &[&str]) -> Subscriber {
        Subscriber::new(
            topics
                .iter()
                .map(|t| (t.to_string(), selector(t)))
                .collect(),
            authorized.iter().map(|t| selector(t)).collect(),
            None,
            None,
        )
    }

    fn update(topics: &[&str], private: bool) -> Update {
        Update::from_form(PublishForm {
            topics: topics.iter().map(|t| t.to_string()).collect(),
            data: Some("data".to_owned()),
            private,
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn public_update_needs_only_a_matching_subscription() {
        let s = subscriber(&["https://example.com/books/{id}"], &[]);
        assert!(s.can_access(&update(&["https://example.com/books/1"], false), true));
        assert!(!s.can_access(&update(&["https://example.com/movies/1"], false), true));
    }

    #[test]
    fn private_update_needs_an_authorized_selector() {
        let s = subscriber(
            &["https://example.com/books/{id}"],
            &["https://example.com/books/{id}"],
        );
        assert!(s.can_access(&update(&["https://example.com/books/1"], true), true));

        let unauthorized = subscriber(
            &["https://example.com/books/{id}"],
            &["https://other.example.com/{rest}"],
        );
        assert!(!unauthorized.can_access(&update(&["https://example.com/books/1"], true), true));
    }

    #[test]
    fn alternate_topics_also_grant_access() {
        let s = subscriber(&["https://example.com/alt"], &[]);
        let u = update(&["https://example.com/canonical", "https://example.com/alt"], false);
        assert!(s.can_access(&u, true));
    }

    #[test]
    fn unauthorized_subscriber_receives_nothing_without_anonymous_access() {
        let s = subscriber(&["*"], &[]);
        let public = update(&["https://example.com/a"], false);
        assert!(!s.can_access(&public, false));
        assert!(s.can_access(&public, true));
    }

    #[test]
    fn dispatch_records_last_event_id_and_requires_active() {
        let s = subscriber(&["*"], &[]);
        let u = update(&["https://example.com/a"], false);

        assert!(s.dispatch(&u).is_none(), "opening subscribers do not dispatch");
        s.mark_active();
        assert!(s.dispatch(&u).is_some());
        assert_eq!(s.last_event_id().as_deref(), Some(u.id()));

        s.close();
        assert!(s.dispatch(&u).is_none(), "closed subscribers do not dispatch");
    }

    #[test]
    fn close_is_idempotent_and_terminal() {
        let s = subscriber(&["*"], &[]);
        s.mark_active();
        s.close();
        s.close();
        assert_eq!(s.state(), SubscriberState::Closed);
        s.mark_active();
        assert_eq!(s.state(), SubscriberState::Closed, "closed is terminal");
    }

    #[test]
    fn subscriptions_point_back_at_their_subscriber() {
        let s = subscriber(&["https://example.com/a", "https://example.com/b"], &[]);
        assert_eq!(s.subscriptions().len(), 2);
        for subscription in s.subscriptions() {
            assert_eq!(subscription.subscriber(), s.id());
            assert!(subscription.id().starts_with("urn:uuid:"));
        }
    }
}
