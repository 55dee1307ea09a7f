//! The Mercure update record.
//!
//! An update is immutable once constructed. Its id doubles as the SSE
//! `Last-Event-ID` resume cursor, so it is globally unique; server-minted ids
//! use the `urn:uuid:<v4>` form.

use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{Error, RequestErrorKind};

/// A single Mercure update.
///
/// The first `topic` form field is the canonical IRI; any further `topic`
/// fields are alternate IRIs the update is also associated with for matching
/// purposes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Update {
    id: String,
    topic: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    alternate_topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry: Option<u64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    private: bool,
}

/// The raw fields of a `POST /.well-known/mercure` form body.
///
/// Built from the decoded key/value pairs so that repeated `topic` fields
/// keep their order. `private` is truthy when the field is present with any
/// non-empty value.
#[derive(Clone, Debug, Default)]
pub struct PublishForm {
    pub topics: Vec<String>,
    pub data: Option<String>,
    pub id: Option<String>,
    pub event_type: Option<String>,
    pub retry: Option<String>,
    pub private: bool,
}

impl PublishForm {
    /// Collects form fields from decoded urlencoded pairs, in order.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut form = PublishForm::default();
        for (key, value) in pairs {
            let value = value.into();
            match key.as_ref() {
                "topic" => form.topics.push(value),
                "data" => form.data = Some(value),
                "id" => form.id = Some(value),
                "type" => form.event_type = Some(value),
                "retry" => form.retry = Some(value),
                "private" => {
                    if !value.is_empty() {
                        form.private = true;
                    }
                }
                // Unknown fields are ignored, per the protocol.
                _ => {}
            }
        }
        form
    }
}

impl Update {
    /// Builds an update from a publication form.
    ///
    /// Mints a `urn:uuid:<v4>` id when the publisher supplied none. Whether a
    /// supplied id is *authorized* is the publish handler's concern; here it
    /// only has to be a valid IRI.
    pub fn from_form(form: PublishForm) -> Result<Self, Error> {
        let mut topics = form.topics.into_iter();
        let topic = topics
            .next()
            .ok_or_else(|| Error::request(RequestErrorKind::MissingTopic))?;

        let id = match form.id {
            Some(id) => {
                // The URL parser silently strips tabs and newlines, so the
                // raw string is checked for control characters itself: the
                // id is written verbatim into an SSE field line.
                if id.chars().any(|c| c.is_ascii_control()) || Url::parse(&id).is_err() {
                    return Err(Error::request(RequestErrorKind::InvalidId(id)));
                }
                id
            }
            None => Self::mint_id(),
        };

        let event_type = form.event_type.filter(|t| !t.is_empty());
        if let Some(event_type) = &event_type {
            if event_type.chars().any(|c| c.is_ascii_control()) {
                return Err(Error::request(RequestErrorKind::InvalidType(
                    event_type.clone(),
                )));
            }
        }

        let retry = match form.retry {
            Some(raw) => Some(
                raw.parse::<u64>()
                    .map_err(|_| Error::request(RequestErrorKind::InvalidRetry(raw)))?,
            ),
            None => None,
        };

        Ok(Update {
            id,
            topic,
            alternate_topics: topics.collect(),
            data: form.data,
            event_type,
            retry,
            private: form.private,
        })
    }

    /// Generates a fresh server-assigned update id.
    pub fn mint_id() -> String {
        format!("urn:uuid:{}", Uuid::new_v4())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The canonical topic IRI.
    pub fn canonical_topic(&self) -> &str {
        &self.topic
    }

    pub fn alternate_topics(&self) -> &[String] {
        &self.alternate_topics
    }

    /// Iterates over the canonical topic followed by the alternate topics.
    pub fn topics(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.topic.as_str()).chain(self.alternate_topics.iter().map(String::as_str))
    }

    pub fn data(&self) -> Option<&str> {
        self.data.as_deref()
    }

    pub fn event_type(&self) -> Option<&str> {
        self.event_type.as_deref()
    }

    /// Client reconnection delay hint, in milliseconds.
    pub fn retry(&self) -> Option<u64> {
        self.retry
    }

    pub fn private(&self) -> bool {
        self.private
    }
}
