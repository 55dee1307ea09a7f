//! Error types for the `domain` layer.
//!
//! Errors are modeled as a root [`Error`] holding a tree of `error_kind`
//! enums. Lower-level causes are kept in the `source` field so that layers
//! above (`web` in particular) can translate kinds into HTTP status codes
//! without depending on the failing module directly.
use std::error::Error as StdError;
use std::fmt;

use crate::template::TemplateError;

/// Top-level domain error type.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: DomainErrorKind,
}

/// Major categories of errors that can occur in the `domain` layer.
#[derive(Debug, PartialEq)]
pub enum DomainErrorKind {
    /// The caller supplied input the protocol rejects.
    Request(RequestErrorKind),
    Internal(InternalErrorKind),
}

/// Kinds of invalid protocol input.
#[derive(Debug, PartialEq)]
pub enum RequestErrorKind {
    /// A publication or subscription carried no `topic` parameter.
    MissingTopic,
    /// A client-supplied update id is not a valid IRI.
    InvalidId(String),
    /// The `retry` field is not a non-negative integer.
    InvalidRetry(String),
    /// The `type` field cannot be written as an SSE field value.
    InvalidType(String),
    /// A topic selector expression could not be compiled.
    InvalidSelector(String),
}

#[derive(Debug, PartialEq)]
pub enum InternalErrorKind {
    Other(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            DomainErrorKind::Request(kind) => match kind {
                RequestErrorKind::MissingTopic => {
                    write!(f, "at least one topic is required")
                }
                RequestErrorKind::InvalidId(id) => {
                    write!(f, "invalid update id \"{id}\": must be an IRI")
                }
                RequestErrorKind::InvalidRetry(retry) => {
                    write!(f, "invalid retry \"{retry}\": must be a non-negative integer")
                }
                RequestErrorKind::InvalidType(event_type) => {
                    write!(f, "invalid type \"{event_type}\"")
                }
                RequestErrorKind::InvalidSelector(selector) => {
                    write!(f, "invalid topic selector \"{selector}\"")
                }
            },
            DomainErrorKind::Internal(InternalErrorKind::Other(description)) => {
                write!(f, "internal domain error: {description}")
            }
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<TemplateError> for Error {
    fn from(err: TemplateError) -> Self {
        let selector = err.template().to_owned();
        Error {
            source: Some(Box::new(err)),
            error_kind: DomainErrorKind::Request(RequestErrorKind::InvalidSelector(selector)),
        }
    }
}

impl Error {
    pub fn request(kind: RequestErrorKind) -> Self {
        Error {
            source: None,
            error_kind: DomainErrorKind::Request(kind),
        }
    }
}
