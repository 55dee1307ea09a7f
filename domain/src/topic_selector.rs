//! Topic selectors.
//!
//! > A topic selector is an expression intended to be matched by one or
//! > several topics. A topic selector can also be used to match other topic
//! > selectors for authorization purposes.
//!
//! Three forms exist: the `*` wildcard, a literal IRI compared for equality,
//! and a URI template used as a pattern. Selectors are immutable once
//! compiled and are freely shareable across subscriptions and claims.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::Error;
use crate::template::{self, CompiledTemplate};

#[derive(Clone, Debug)]
pub enum TopicSelector {
    /// Matches every topic.
    Wildcard,
    /// Matches one topic IRI by equality (host compared case-insensitively,
    /// path case-sensitively, per URL semantics).
    Literal(String),
    /// Matches every possible expansion of a URI template.
    Template(Arc<CompiledTemplate>),
}

impl TopicSelector {
    /// Compiles a selector expression.
    ///
    /// A relative expression is resolved against `base` (normally the
    /// request URL) before compilation. Any expression containing `{` is
    /// treated as a URI template; compilation failures surface as invalid
    /// selector errors.
    pub fn compile(expr: &str, base: Option<&Url>) -> Result<Self, Error> {
        if expr == "*" {
            return Ok(TopicSelector::Wildcard);
        }

        let resolved = match base {
            Some(base) if !has_scheme(expr) => resolve_relative(expr, base),
            _ => expr.to_owned(),
        };

        if resolved.contains('{') {
            let normalized = lowercase_authority(&resolved);
            Ok(TopicSelector::Template(template::compile(&normalized)?))
        } else {
            Ok(TopicSelector::Literal(canonicalize(&resolved)))
        }
    }

    /// Whether this selector matches a single topic IRI.
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicSelector::Wildcard => true,
            TopicSelector::Literal(literal) => *literal == canonicalize(topic),
            TopicSelector::Template(template) => template.matches(&canonicalize(topic)),
        }
    }

    /// Whether this selector matches any of a set of candidate topics
    /// (canonical plus alternates).
    pub fn matches_any<'a, I>(&self, topics: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        topics.into_iter().any(|topic| self.matches(topic))
    }
}

impl fmt::Display for TopicSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicSelector::Wildcard => write!(f, "*"),
            TopicSelector::Literal(literal) => write!(f, "{literal}"),
            TopicSelector::Template(template) => write!(f, "{}", template.source()),
        }
    }
}

impl PartialEq for TopicSelector {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (TopicSelector::Wildcard, TopicSelector::Wildcard) => true,
            (TopicSelector::Literal(a), TopicSelector::Literal(b)) => a == b,
            (TopicSelector::Template(a), TopicSelector::Template(b)) => a.source() == b.source(),
            _ => false,
        }
    }
}

impl Eq for TopicSelector {}

impl Serialize for TopicSelector {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TopicSelector {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let expr = String::deserialize(deserializer)?;
        TopicSelector::compile(&expr, None).map_err(serde::de::Error::custom)
    }
}

/// Whether the expression starts with a URI scheme (`scheme:`).
fn has_scheme(expr: &str) -> bool {
    let mut chars = expr.char_indices();
    match chars.next() {
        Some((_, c)) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    for (_, c) in chars {
        match c {
            ':' => return true,
            c if c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.') => {}
            _ => return false,
        }
    }
    false
}

/// Resolves a relative expression against a base URL without touching the
/// template syntax (`Url::join` would percent-encode the braces).
fn resolve_relative(expr: &str, base: &Url) -> String {
    let origin = base.origin().ascii_serialization();
    if let Some(rest) = expr.strip_prefix("//") {
        format!("{}://{}", base.scheme(), rest)
    } else if expr.starts_with('/') {
        format!("{origin}{expr}")
    } else {
        // Resolve against the directory of the base path.
        let path = base.path();
        let dir = match path.rfind('/') {
            Some(idx) => &path[..=idx],
            None => "/",
        };
        format!("{origin}{dir}{expr}")
    }
}

/// Normalizes an IRI through the URL parser when possible, which lowercases
/// the scheme and host and strips default ports. Non-URL strings compare
/// verbatim.
fn canonicalize(iri: &str) -> String {
    match Url::parse(iri) {
        Ok(url) => url.to_string(),
        Err(_) => iri.to_owned(),
    }
}

/// Lowercases the `scheme://authority` prefix of a template, when the prefix
/// holds no expression, so host matching stays case-insensitive.
fn lowercase_authority(template: &str) -> String {
    let Some(scheme_end) = template.find("://") else {
        return template.to_owned();
    };
    let authority_start = scheme_end + 3;
    let authority_end = template[authority_start..]
        .find(['/', '?', '#'])
        .map(|idx| authority_start + idx)
        .unwrap_or(template.len());
    let prefix = &template[..authority_end];
    if prefix.contains('{') {
        return template.to_owned();
    }
    format!("{}{}", prefix.to_ascii_lowercase(), &template[authority_end..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DomainErrorKind, RequestErrorKind};

    #[test]
    fn wildcard_matches_everything() {
        let selector = TopicSelector::compile("*", None).unwrap();
        assert!(selector.matches("https://example.com/a"));
        assert!(selector.matches("not-even-an-iri"));
    }

    #[test]
    fn literal_matches_itself() {
        let selector = TopicSelector::compile("https://example.com/books/1", None).unwrap();
        assert!(selector.matches("https://example.com/books/1"));
        assert!(!selector.matches("https://example.com/books/2"));
    }

    #[test]
    fn host_is_case_insensitive_path_is_not() {
        let selector = TopicSelector::compile("https://EXAMPLE.com/Books/1", None).unwrap();
        assert!(selector.matches("https://example.COM/Books/1"));
        assert!(!selector.matches("https://example.com/books/1"));
    }

    #[test]
    fn template_matches_expansions_only() {
        let selector = TopicSelector::compile("https://example.com/books/{id}", None).unwrap();
        assert!(selector.matches("https://example.com/books/42"));
        assert!(!selector.matches("https://example.com/movies/42"));
    }

    #[test]
    fn template_host_is_case_insensitive() {
        let selector = TopicSelector::compile("https://EXAMPLE.com/books/{id}", None).unwrap();
        assert!(selector.matches("https://example.com/books/42"));
    }

    #[test]
    fn relative_expressions_resolve_against_the_base() {
        let base = Url::parse("https://hub.example.com/.well-known/mercure").unwrap();
        let selector = TopicSelector::compile("/books/{id}", Some(&base)).unwrap();
        assert!(selector.matches("https://hub.example.com/books/42"));

        let literal = TopicSelector::compile("/feed", Some(&base)).unwrap();
        assert!(literal.matches("https://hub.example.com/feed"));

        let sibling = TopicSelector::compile("demo", Some(&base)).unwrap();
        assert!(sibling.matches("https://hub.example.com/.well-known/demo"));
    }

    #[test]
    fn absolute_expressions_ignore_the_base() {
        let base = Url::parse("https://hub.example.com/.well-known/mercure").unwrap();
        let selector = TopicSelector::compile("https://other.example.com/a", Some(&base)).unwrap();
        assert!(selector.matches("https://other.example.com/a"));
    }

    #[test]
    fn matches_any_covers_alternate_topics() {
        let selector = TopicSelector::compile("https://example.com/books/{id}", None).unwrap();
        let topics = ["https://example.com/authors/7", "https://example.com/books/7"];
        assert!(selector.matches_any(topics));
        assert!(!selector.matches_any(["https://example.com/authors/7"]));
    }

    #[test]
    fn invalid_template_is_an_invalid_selector() {
        let err = TopicSelector::compile("https://example.com/{broken", None).unwrap_err();
        assert!(matches!(
            err.error_kind,
            DomainErrorKind::Request(RequestErrorKind::InvalidSelector(_))
        ));
    }

    #[test]
    fn serializes_as_its_expression() {
        let selector = TopicSelector::compile("https://example.com/books/{id}", None).unwrap();
        assert_eq!(
            serde_json::to_string(&selector).unwrap(),
            "\"https://example.com/books/{id}\""
        );
        assert_eq!(
            serde_json::to_string(&TopicSelector::Wildcard).unwrap(),
            "\"*\""
        );
    }

    #[test]
    fn deserializes_from_an_expression() {
        let selector: TopicSelector = serde_json::from_str("\"*\"").unwrap();
        assert_eq!(selector, TopicSelector::Wildcard);
        let selector: TopicSelector =
            serde_json::from_str("\"https://example.com/books/{id}\"").unwrap();
        assert!(selector.matches("https://example.com/books/42"));
    }
}
