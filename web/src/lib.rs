//! HTTP layer of the hub.
//!
//! Exposes the well-known Mercure endpoint (`GET` to subscribe, `POST` to
//! publish), the authorization extractor that turns bearer tokens into
//! capability selectors, and the router wiring including security headers
//! and CORS.

use std::sync::Arc;

use axum::http::HeaderMap;
use url::Url;

pub mod controller;
pub mod error;
pub mod extractors;
pub mod router;

use extractors::authorization::{AuthInitError, Authorizer};

/// Web-level state: the service state plus the compiled authorizer.
/// Needs to implement Clone to be able to be passed into Router as State.
#[derive(Clone)]
pub struct AppState {
    pub service: service::AppState,
    pub authorizer: Arc<Authorizer>,
}

impl AppState {
    /// Builds the web state; fetches configured JWK Sets once at startup,
    /// which is fatal on failure.
    pub async fn new(service: service::AppState) -> Result<Self, AuthInitError> {
        let authorizer = Authorizer::from_config(service.config_ref()).await?;
        Ok(Self {
            service,
            authorizer: Arc::new(authorizer),
        })
    }

    pub fn config(&self) -> &service::config::Config {
        self.service.config_ref()
    }

    pub fn hub(&self) -> &events::Hub {
        &self.service.hub
    }

    pub fn subscribers(&self) -> &Arc<sse::SubscriberRegistry> {
        &self.service.subscribers
    }
}

/// Reconstructs the request URL of the well-known endpoint, used as the base
/// for resolving relative topic selectors. Honors `X-Forwarded-Proto` when
/// the hub sits behind a proxy.
pub(crate) fn request_base_url(headers: &HeaderMap) -> Option<Url> {
    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok())?;
    let scheme = headers
        .get("x-forwarded-proto")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("http");
    Url::parse(&format!("{scheme}://{host}/.well-known/mercure")).ok()
}
