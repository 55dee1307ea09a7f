//! The `mercure` JWT claim.
//!
//! Both publisher and subscriber tokens carry a private claim named
//! `mercure` whose `publish` and `subscribe` keys hold arrays of topic
//! selector expressions. The optional `payload` key is opaque data the hub
//! attaches to the subscriber without interpreting it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::error::Error;
use crate::topic_selector::TopicSelector;

/// The private claim set of a Mercure JWT.
///
/// A token without the `mercure` claim is rejected by the authorization
/// layer even when its signature is valid.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct TokenClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mercure: Option<MercureClaim>,
}

/// The value of the `mercure` claim.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct MercureClaim {
    /// Topic selectors the bearer may publish under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<Vec<String>>,
    /// Topic selectors the bearer may receive private updates for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscribe: Option<Vec<String>>,
    /// Opaque data attached to the subscriber.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl MercureClaim {
    /// Compiles the `publish` selector list, resolving relative expressions
    /// against `base` (the request URL).
    pub fn publish_selectors(&self, base: Option<&Url>) -> Result<Vec<TopicSelector>, Error> {
        compile_all(self.publish.as_deref().unwrap_or_default(), base)
    }

    /// Compiles the `subscribe` selector list.
    pub fn subscribe_selectors(&self, base: Option<&Url>) -> Result<Vec<TopicSelector>, Error> {
        compile_all(self.subscribe.as_deref().unwrap_or_default(), base)
    }
}

fn compile_all(exprs: &[String], base: Option<&Url>) -> Result<Vec<TopicSelector>, Error> {
    exprs
        .iter()
        .map(|expr| TopicSelector::compile(expr, base))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_a_publisher_claim() {
        let claims: TokenClaims =
            serde_json::from_str(r#"{"mercure":{"publish":["*"]}}"#).unwrap();
        let mercure = claims.mercure.unwrap();
        let selectors = mercure.publish_selectors(None).unwrap();
        assert_eq!(selectors, vec![TopicSelector::Wildcard]);
        assert!(mercure.subscribe.is_none());
    }

    #[test]
    fn deserializes_a_subscriber_claim_with_payload() {
        let claims: TokenClaims = serde_json::from_str(
            r#"{"mercure":{"subscribe":["https://example.com/users/1/{id}"],"payload":{"user":"1"}}}"#,
        )
        .unwrap();
        let mercure = claims.mercure.unwrap();
        let selectors = mercure.subscribe_selectors(None).unwrap();
        assert!(selectors[0].matches("https://example.com/users/1/42"));
        assert_eq!(mercure.payload.unwrap()["user"], "1");
    }

    #[test]
    fn missing_mercure_claim_is_none() {
        let claims: TokenClaims = serde_json::from_str(r#"{"sub":"someone"}"#).unwrap();
        assert!(claims.mercure.is_none());
    }

    #[test]
    fn selectors_resolve_against_the_request_url() {
        let base = Url::parse("https://hub.example.com/.well-known/mercure").unwrap();
        let claim = MercureClaim {
            subscribe: Some(vec!["/books/{id}".to_owned()]),
            ..Default::default()
        };
        let selectors = claim.subscribe_selectors(Some(&base)).unwrap();
        assert!(selectors[0].matches("https://hub.example.com/books/9"));
    }
}
