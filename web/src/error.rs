//! Error handling for the web layer.
//! Errors from lower layers are translated through `domain` to `web`
//! so that `web` can return appropriate HTTP status codes and messages to the client.
use std::error::Error as StdError;

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use domain::error::{DomainErrorKind, Error as DomainError};
use events::TransportError;

use log::*;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    pub error_kind: WebErrorKind,
    format: ResponseFormat,
}

#[derive(Debug)]
pub enum WebErrorKind {
    /// Missing required parameter, malformed body, invalid id format.
    MalformedRequest(String),
    /// No token on an endpoint that requires one.
    AuthRequired,
    /// Invalid token, disallowed origin, or publication outside the
    /// publisher's selectors.
    Forbidden(String),
    NotFound,
    /// Route matched but the method did not; carries the `Allow` list.
    MethodNotAllowed(&'static str),
    /// Publication with a content type other than the form encoding.
    UnsupportedMediaType,
    /// Anything else; the cause is logged, never exposed.
    Internal(Option<Box<dyn StdError + Send + Sync>>),
}

/// Body encoding of an error response, negotiated from `Accept`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}

impl ResponseFormat {
    /// Prefers JSON when the client lists `application/json` ahead of
    /// `text/plain`; plain text otherwise.
    pub fn negotiate(headers: &HeaderMap) -> Self {
        let Some(accept) = headers
            .get(header::ACCEPT)
            .and_then(|value| value.to_str().ok())
        else {
            return ResponseFormat::Text;
        };
        for entry in accept.split(',') {
            let media_type = entry.split(';').next().unwrap_or("").trim();
            match media_type {
                "application/json" => return ResponseFormat::Json,
                "text/plain" | "text/*" => return ResponseFormat::Text,
                _ => {}
            }
        }
        ResponseFormat::Text
    }
}

impl Error {
    pub fn new(error_kind: WebErrorKind) -> Self {
        Self {
            error_kind,
            format: ResponseFormat::default(),
        }
    }

    pub fn with_format(mut self, format: ResponseFormat) -> Self {
        self.format = format;
        self
    }

    fn status(&self) -> StatusCode {
        match self.error_kind {
            WebErrorKind::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            WebErrorKind::AuthRequired => StatusCode::UNAUTHORIZED,
            WebErrorKind::Forbidden(_) => StatusCode::FORBIDDEN,
            WebErrorKind::NotFound => StatusCode::NOT_FOUND,
            WebErrorKind::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            WebErrorKind::UnsupportedMediaType => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            WebErrorKind::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> String {
        match &self.error_kind {
            WebErrorKind::MalformedRequest(message) => message.clone(),
            WebErrorKind::AuthRequired => "authorization required".to_owned(),
            WebErrorKind::Forbidden(message) => message.clone(),
            WebErrorKind::NotFound => "not found".to_owned(),
            WebErrorKind::MethodNotAllowed(_) => "method not allowed".to_owned(),
            WebErrorKind::UnsupportedMediaType => {
                "the content type must be application/x-www-form-urlencoded".to_owned()
            }
            WebErrorKind::Internal(_) => "internal server error".to_owned(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self.error_kind {
            WebErrorKind::Internal(cause) => {
                warn!(
                    "WebErrorKind::Internal: Responding with 500 Internal Server Error. Cause: {cause:?}"
                );
            }
            kind => {
                warn!("{kind:?}: Responding with {status}");
            }
        }

        let mut headers = HeaderMap::new();
        match &self.error_kind {
            WebErrorKind::AuthRequired => {
                headers.insert(
                    header::WWW_AUTHENTICATE,
                    HeaderValue::from_static("Bearer realm=\"mercure\""),
                );
            }
            WebErrorKind::MethodNotAllowed(allow) => {
                if let Ok(value) = HeaderValue::from_str(allow) {
                    headers.insert(header::ALLOW, value);
                }
            }
            WebErrorKind::UnsupportedMediaType => {
                headers.insert(
                    header::ACCEPT,
                    HeaderValue::from_static("application/x-www-form-urlencoded"),
                );
            }
            _ => {}
        }

        match self.format {
            ResponseFormat::Json => (
                status,
                headers,
                Json(json!({
                    "status": status.as_u16(),
                    "error": self.message(),
                })),
            )
                .into_response(),
            ResponseFormat::Text => (status, headers, self.message()).into_response(),
        }
    }
}

// This is where we translate errors from the `domain` layer to the `web` layer.
impl From<DomainError> for Error {
    fn from(err: DomainError) -> Self {
        if matches!(err.error_kind, DomainErrorKind::Request(_)) {
            Error::new(WebErrorKind::MalformedRequest(err.to_string()))
        } else {
            Error::new(WebErrorKind::Internal(Some(Box::new(err))))
        }
    }
}

impl From<TransportError> for Error {
    fn from(err: TransportError) -> Self {
        Error::new(WebErrorKind::Internal(Some(Box::new(err))))
    }
}
