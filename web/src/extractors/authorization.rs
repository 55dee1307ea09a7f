//! Authorization for the Mercure endpoints.
//!
//! Turns the request's credentials into capability selectors. The token is
//! looked up in this order, per the protocol:
//!
//! 1. `Authorization: Bearer <token>` header;
//! 2. the `authorization` query parameter, when enabled in configuration
//!    (for `EventSource` clients that cannot set headers);
//! 3. the authorization cookie (default name `mercureAuthorization`).
//!
//! Verification keys come either from static configuration or from a JWK
//! Set URL. JWK Sets are fetched once at startup (fatal on failure) and
//! refreshed after a verification failure to pick up rotated keys; a failed
//! refresh fails closed.

use std::str::FromStr;

use axum::http::{header, HeaderMap};
use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::*;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::RwLock;
use url::Url;

use domain::claims::TokenClaims;
use domain::TopicSelector;
use service::config::{Config, ConfigError};

use crate::error::{Error, WebErrorKind};

/// Errors building the authorizer at startup.
#[derive(Debug, Error)]
pub enum AuthInitError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unsupported JWT algorithm \"{0}\"")]
    InvalidAlgorithm(String),

    #[error("invalid JWT verification key: {0}")]
    InvalidKey(#[from] jsonwebtoken::errors::Error),

    #[error("failed to fetch JWK Set from {url}: {source}")]
    JwksFetch {
        url: String,
        source: reqwest::Error,
    },
}

/// A verified subscriber: its `subscribe` selectors and opaque payload.
#[derive(Debug)]
pub struct SubscriberAuth {
    pub selectors: Vec<TopicSelector>,
    pub payload: Option<Value>,
}

/// A verified publisher: its `publish` selectors.
#[derive(Debug)]
pub struct PublisherAuth {
    pub selectors: Vec<TopicSelector>,
}

enum KeySource {
    Static {
        key: DecodingKey,
        validation: Validation,
    },
    Remote(JwksCache),
}

/// JWK Set fetched from a URL, refreshed on verification failure.
struct JwksCache {
    url: String,
    client: reqwest::Client,
    keys: RwLock<Vec<(DecodingKey, Validation)>>,
}

pub struct Authorizer {
    publisher: Option<KeySource>,
    subscriber: Option<KeySource>,
    cookie_name: String,
    query_param: bool,
    anonymous: bool,
    allowed_origins: Vec<String>,
}

impl Authorizer {
    pub async fn from_config(config: &Config) -> Result<Self, AuthInitError> {
        let publisher = Self::key_source(
            config.publisher_jwks(),
            config.publisher_key()?,
            config.publisher_algorithm(),
        )
        .await?;
        let subscriber = Self::key_source(
            config.subscriber_jwks(),
            config.subscriber_key()?,
            config.subscriber_algorithm(),
        )
        .await?;

        Ok(Self {
            publisher,
            subscriber,
            cookie_name: config.cookie_name.clone(),
            query_param: config.query_param_authorization,
            anonymous: config.anonymous,
            allowed_origins: config.allowed_origins.clone(),
        })
    }

    async fn key_source(
        jwks_url: Option<&str>,
        key_material: Option<Vec<u8>>,
        algorithm: &str,
    ) -> Result<Option<KeySource>, AuthInitError> {
        if let Some(url) = jwks_url {
            return Ok(Some(KeySource::Remote(JwksCache::bootstrap(url).await?)));
        }
        let Some(material) = key_material else {
            return Ok(None);
        };
        let algorithm = Algorithm::from_str(algorithm)
            .map_err(|_| AuthInitError::InvalidAlgorithm(algorithm.to_owned()))?;
        Ok(Some(KeySource::Static {
            key: decoding_key(algorithm, &material)?,
            validation: validation(algorithm),
        }))
    }

    /// Whether anonymous subscribers are admitted.
    pub fn anonymous(&self) -> bool {
        self.anonymous
    }

    /// Authorizes a subscriber request.
    ///
    /// `Ok(None)` means an admitted anonymous subscriber (no token and
    /// anonymous access enabled).
    pub async fn authorize_subscriber(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
        base: Option<&Url>,
    ) -> Result<Option<SubscriberAuth>, Error> {
        self.check_origin(headers)?;
        let Some(token) = self.extract_token(headers, query_token) else {
            return if self.anonymous {
                Ok(None)
            } else {
                Err(Error::new(WebErrorKind::AuthRequired))
            };
        };
        let mercure = self.verify(self.subscriber.as_ref(), &token).await?;
        let selectors = mercure.subscribe_selectors(base).map_err(|e| {
            Error::new(WebErrorKind::Forbidden(format!(
                "invalid subscribe selector in token: {e}"
            )))
        })?;
        Ok(Some(SubscriberAuth {
            selectors,
            payload: mercure.payload,
        }))
    }

    /// Authorizes a publisher request. Anonymous publication is never
    /// allowed and the token must carry a `mercure.publish` list.
    pub async fn authorize_publisher(
        &self,
        headers: &HeaderMap,
        query_token: Option<&str>,
        base: Option<&Url>,
    ) -> Result<PublisherAuth, Error> {
        self.check_origin(headers)?;
        let Some(token) = self.extract_token(headers, query_token) else {
            return Err(Error::new(WebErrorKind::AuthRequired));
        };
        let mercure = self.verify(self.publisher.as_ref(), &token).await?;
        if mercure.publish.is_none() {
            return Err(Error::new(WebErrorKind::Forbidden(
                "the token has no mercure.publish claim".to_owned(),
            )));
        }
        let selectors = mercure.publish_selectors(base).map_err(|e| {
            Error::new(WebErrorKind::Forbidden(format!(
                "invalid publish selector in token: {e}"
            )))
        })?;
        Ok(PublisherAuth { selectors })
    }

    async fn verify(
        &self,
        source: Option<&KeySource>,
        token: &str,
    ) -> Result<domain::MercureClaim, Error> {
        let forbidden =
            |message: &str| Error::new(WebErrorKind::Forbidden(message.to_owned()));
        let Some(source) = source else {
            // A token was presented but no key is configured for the role.
            return Err(forbidden("no verification key configured for this token"));
        };
        let claims = match source {
            KeySource::Static { key, validation } => {
                decode::<TokenClaims>(token, key, validation)
                    .map(|data| data.claims)
                    .map_err(|e| {
                        debug!("Token rejected: {e}");
                        forbidden("invalid or expired token")
                    })?
            }
            KeySource::Remote(cache) => cache
                .verify(token)
                .await
                .ok_or_else(|| forbidden("invalid or expired token"))?,
        };
        claims
            .mercure
            .ok_or_else(|| forbidden("the token has no mercure claim"))
    }

    /// Token extraction order: header, then query parameter (opt-in), then
    /// cookie.
    fn extract_token(&self, headers: &HeaderMap, query_token: Option<&str>) -> Option<String> {
        if let Some(token) = bearer_token(headers) {
            return Some(token);
        }
        if self.query_param {
            if let Some(token) = query_token {
                return Some(token.to_owned());
            }
        }
        self.cookie_token(headers)
    }

    fn cookie_token(&self, headers: &HeaderMap) -> Option<String> {
        for value in headers.get_all(header::COOKIE) {
            let Ok(cookies) = value.to_str() else {
                continue;
            };
            for pair in cookies.split(';') {
                if let Some((name, value)) = pair.trim().split_once('=') {
                    if name == self.cookie_name {
                        return Some(value.to_owned());
                    }
                }
            }
        }
        None
    }

    /// Rejects requests whose `Origin` (falling back to `Referer`) is
    /// non-empty and not in the allowed list; `*` allows every origin.
    fn check_origin(&self, headers: &HeaderMap) -> Result<(), Error> {
        let origin = headers
            .get(header::ORIGIN)
            .and_then(|value| value.to_str().ok())
            .map(ToOwned::to_owned)
            .or_else(|| {
                headers
                    .get(header::REFERER)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|referer| Url::parse(referer).ok())
                    .map(|url| url.origin().ascii_serialization())
            });
        let Some(origin) = origin else {
            return Ok(());
        };
        if origin.is_empty() {
            return Ok(());
        }
        let allowed = self.allowed_origins.iter().any(|allowed| {
            allowed == "*" || allowed.trim_end_matches('/') == origin.trim_end_matches('/')
        });
        if allowed {
            Ok(())
        } else {
            Err(Error::new(WebErrorKind::Forbidden(format!(
                "origin \"{origin}\" is not allowed"
            ))))
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_owned())
}

fn decoding_key(
    algorithm: Algorithm,
    material: &[u8],
) -> Result<DecodingKey, AuthInitError> {
    let key = match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            DecodingKey::from_secret(material)
        }
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512 => DecodingKey::from_rsa_pem(material)?,
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(material)?,
        Algorithm::EdDSA => DecodingKey::from_ed_pem(material)?,
    };
    Ok(key)
}

/// Mercure tokens often have no registered claims; `exp` stays optional but
/// is enforced when present.
fn validation(algorithm: Algorithm) -> Validation {
    let mut validation = Validation::new(algorithm);
    validation.validate_aud = false;
    validation.required_spec_claims = Default::default();
    validation
}

impl JwksCache {
    async fn bootstrap(url: &str) -> Result<Self, AuthInitError> {
        let client = reqwest::Client::new();
        let keys = Self::fetch(&client, url).await?;
        info!("Loaded {} key(s) from JWK Set {url}", keys.len());
        Ok(Self {
            url: url.to_owned(),
            client,
            keys: RwLock::new(keys),
        })
    }

    async fn fetch(
        client: &reqwest::Client,
        url: &str,
    ) -> Result<Vec<(DecodingKey, Validation)>, AuthInitError> {
        let fetch_err = |source| AuthInitError::JwksFetch {
            url: url.to_owned(),
            source,
        };
        let set: JwkSet = client
            .get(url)
            .send()
            .await
            .map_err(fetch_err)?
            .error_for_status()
            .map_err(fetch_err)?
            .json()
            .await
            .map_err(fetch_err)?;

        let mut keys = Vec::new();
        for jwk in &set.keys {
            let Some(key_algorithm) = jwk.common.key_algorithm else {
                warn!("Skipping JWK without an alg field");
                continue;
            };
            let Ok(algorithm) = Algorithm::from_str(&key_algorithm.to_string()) else {
                warn!("Skipping JWK with unsupported algorithm {key_algorithm}");
                continue;
            };
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => keys.push((key, validation(algorithm))),
                Err(e) => warn!("Skipping undecodable JWK: {e}"),
            }
        }
        Ok(keys)
    }

    /// Tries every cached key; on failure refreshes the set once (key
    /// rotation) and retries. A failed refresh fails closed.
    async fn verify(&self, token: &str) -> Option<TokenClaims> {
        if let Some(claims) = self.try_cached(token).await {
            return Some(claims);
        }
        match Self::fetch(&self.client, &self.url).await {
            Ok(fresh) => *self.keys.write().await = fresh,
            Err(e) => {
                warn!("JWK Set refresh failed, failing closed: {e}");
                return None;
            }
        }
        self.try_cached(token).await
    }

    async fn try_cached(&self, token: &str) -> Option<TokenClaims> {
        for (key, validation) in self.keys.read().await.iter() {
            if let Ok(data) = decode::<TokenClaims>(token, key, validation) {
                return Some(data.claims);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &[u8] = b"!ChangeThisMercureHubJWTSecretKey!";

    async fn authorizer(extra_args: &[&str]) -> Authorizer {
        let args = ["mercure", "--jwt-key", "!ChangeThisMercureHubJWTSecretKey!"]
            .into_iter()
            .chain(extra_args.iter().copied());
        let config = Config::parse_from_args(args);
        Authorizer::from_config(&config).await.unwrap()
    }

    fn token(mercure: Value) -> String {
        #[derive(serde::Serialize)]
        struct Claims {
            mercure: Value,
        }
        encode(
            &Header::default(),
            &Claims { mercure },
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    fn bearer_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[tokio::test]
    async fn bearer_header_wins_over_cookie() {
        let auth = authorizer(&[]).await;
        let mut headers = bearer_headers("header-token");
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("mercureAuthorization=cookie-token"),
        );
        assert_eq!(
            auth.extract_token(&headers, None).as_deref(),
            Some("header-token")
        );
    }

    #[tokio::test]
    async fn query_token_requires_opt_in() {
        let auth = authorizer(&[]).await;
        assert_eq!(auth.extract_token(&HeaderMap::new(), Some("query-token")), None);

        let auth = authorizer(&["--query-param-authorization", "true"]).await;
        assert_eq!(
            auth.extract_token(&HeaderMap::new(), Some("query-token"))
                .as_deref(),
            Some("query-token")
        );
    }

    #[tokio::test]
    async fn cookie_is_the_fallback_source() {
        let auth = authorizer(&[]).await;
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("other=1; mercureAuthorization=cookie-token"),
        );
        assert_eq!(
            auth.extract_token(&headers, None).as_deref(),
            Some("cookie-token")
        );
    }

    #[tokio::test]
    async fn valid_subscriber_token_yields_selectors_and_payload() {
        let auth = authorizer(&[]).await;
        let token = token(json!({
            "subscribe": ["https://example.com/books/{id}"],
            "payload": {"user": "1"}
        }));
        let result = auth
            .authorize_subscriber(&bearer_headers(&token), None, None)
            .await
            .unwrap()
            .unwrap();
        assert!(result.selectors[0].matches("https://example.com/books/42"));
        assert_eq!(result.payload.unwrap()["user"], "1");
    }

    #[tokio::test]
    async fn missing_token_is_unauthorized_unless_anonymous() {
        let auth = authorizer(&[]).await;
        let err = auth
            .authorize_subscriber(&HeaderMap::new(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err.error_kind, WebErrorKind::AuthRequired));

        let auth = authorizer(&["--anonymous", "true"]).await;
        let result = auth
            .authorize_subscriber(&HeaderMap::new(), None, None)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn garbage_token_is_forbidden() {
        let auth = authorizer(&["--anonymous", "true"]).await;
        let err = auth
            .authorize_subscriber(&bearer_headers("not-a-jwt"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err.error_kind, WebErrorKind::Forbidden(_)));
    }

    #[tokio::test]
    async fn token_without_mercure_claim_is_forbidden() {
        let auth = authorizer(&[]).await;
        #[derive(serde::Serialize)]
        struct Claims {
            sub: String,
        }
        let bare = encode(
            &Header::default(),
            &Claims {
                sub: "someone".to_owned(),
            },
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();
        let err = auth
            .authorize_subscriber(&bearer_headers(&bare), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err.error_kind, WebErrorKind::Forbidden(_)));
    }

    #[tokio::test]
    async fn publisher_requires_the_publish_claim() {
        let auth = authorizer(&[]).await;
        let subscribe_only = token(json!({"subscribe": ["*"]}));
        let err = auth
            .authorize_publisher(&bearer_headers(&subscribe_only), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err.error_kind, WebErrorKind::Forbidden(_)));

        let publisher = token(json!({"publish": ["*"]}));
        let result = auth
            .authorize_publisher(&bearer_headers(&publisher), None, None)
            .await
            .unwrap();
        assert_eq!(result.selectors, vec![TopicSelector::Wildcard]);
    }

    #[tokio::test]
    async fn anonymous_publication_is_never_allowed() {
        let auth = authorizer(&["--anonymous", "true"]).await;
        let err = auth
            .authorize_publisher(&HeaderMap::new(), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err.error_kind, WebErrorKind::AuthRequired));
    }

    #[tokio::test]
    async fn disallowed_origin_is_forbidden() {
        let auth = authorizer(&["--allowed-origins", "https://app.example.com"]).await;

        let mut headers = bearer_headers(&token(json!({"subscribe": ["*"]})));
        headers.insert(header::ORIGIN, HeaderValue::from_static("https://evil.example.com"));
        let err = auth
            .authorize_subscriber(&headers, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err.error_kind, WebErrorKind::Forbidden(_)));

        headers.insert(
            header::ORIGIN,
            HeaderValue::from_static("https://app.example.com"),
        );
        assert!(auth.authorize_subscriber(&headers, None, None).await.is_ok());
    }

    #[tokio::test]
    async fn referer_stands_in_for_a_missing_origin() {
        let auth = authorizer(&["--allowed-origins", "https://app.example.com"]).await;
        let mut headers = bearer_headers(&token(json!({"subscribe": ["*"]})));
        headers.insert(
            header::REFERER,
            HeaderValue::from_static("https://evil.example.com/page"),
        );
        let err = auth
            .authorize_subscriber(&headers, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err.error_kind, WebErrorKind::Forbidden(_)));
    }
}
