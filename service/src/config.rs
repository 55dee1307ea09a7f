use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use clap::builder::TypedValueParser as _;
use clap::Parser;
use dotenvy::dotenv;
use log::{warn, LevelFilter};
use std::time::Duration;
use thiserror::Error;

/// Cookie the hub reads the authorization JWT from when neither the
/// `Authorization` header nor the query parameter carries one.
pub const DEFAULT_COOKIE_NAME: &str = "mercureAuthorization";

/// Prefix marking base64-encoded key material in any key option.
const BASE64_KEY_PREFIX: &str = "base64:";

/// Errors produced while validating or decoding the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "JWT key configuration groups are mutually exclusive: set only one of \
         jwt_key, publisher/subscriber keys, jwks_url, or publisher/subscriber JWKS URLs"
    )]
    ConflictingKeys,

    #[error("no JWT verification key configured")]
    NoKeyConfigured,

    #[error("failed to decode base64 key material: {0}")]
    KeyDecode(#[from] base64::DecodeError),
}

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// The host interface to listen for incoming connections
    #[arg(short, long, env = "MERCURE_INTERFACE", default_value = "127.0.0.1")]
    pub interface: String,

    /// The host TCP port to listen for incoming connections
    #[arg(short, long, env = "MERCURE_PORT", default_value_t = 3000)]
    pub port: u16,

    /// URL of the transport backing the event log (local:// or redis://)
    #[arg(long, env = "MERCURE_TRANSPORT_URL", default_value = "local://hub")]
    pub transport_url: String,

    /// Maximum number of updates retained for replay by the in-memory
    /// transport (0 = unbounded)
    #[arg(long, env = "MERCURE_TRANSPORT_SIZE", default_value_t = 0)]
    pub transport_size: usize,

    /// JWT verification key shared by publishers and subscribers.
    /// Prefix with "base64:" for binary keys.
    #[arg(long, env = "MERCURE_JWT_KEY")]
    jwt_key: Option<String>,

    /// Signature algorithm of the shared JWT key
    #[arg(long, env = "MERCURE_JWT_ALGORITHM", default_value = "HS256")]
    pub jwt_algorithm: String,

    /// JWT verification key for publishers only
    #[arg(long, env = "MERCURE_PUBLISHER_JWT_KEY")]
    publisher_jwt_key: Option<String>,

    /// Signature algorithm of the publisher JWT key
    #[arg(long, env = "MERCURE_PUBLISHER_JWT_ALGORITHM", default_value = "HS256")]
    pub publisher_jwt_algorithm: String,

    /// JWT verification key for subscribers only
    #[arg(long, env = "MERCURE_SUBSCRIBER_JWT_KEY")]
    subscriber_jwt_key: Option<String>,

    /// Signature algorithm of the subscriber JWT key
    #[arg(long, env = "MERCURE_SUBSCRIBER_JWT_ALGORITHM", default_value = "HS256")]
    pub subscriber_jwt_algorithm: String,

    /// URL of a JWK Set shared by publishers and subscribers
    #[arg(long, env = "MERCURE_JWKS_URL")]
    pub jwks_url: Option<String>,

    /// URL of the publisher JWK Set
    #[arg(long, env = "MERCURE_PUBLISHER_JWKS_URL")]
    pub publisher_jwks_url: Option<String>,

    /// URL of the subscriber JWK Set
    #[arg(long, env = "MERCURE_SUBSCRIBER_JWKS_URL")]
    pub subscriber_jwks_url: Option<String>,

    /// A list of origins allowed to connect ("*" allows all)
    #[arg(
        long,
        env = "MERCURE_ALLOWED_ORIGINS",
        value_delimiter = ',',
        default_value = "*"
    )]
    pub allowed_origins: Vec<String>,

    /// Allow subscribing without a token (never applies to publishing)
    #[arg(
        long,
        env = "MERCURE_ANONYMOUS",
        action = clap::ArgAction::Set,
        default_value = "false"
    )]
    pub anonymous: bool,

    /// Name of the cookie the authorization JWT is read from
    #[arg(long, env = "MERCURE_COOKIE_NAME", default_value = DEFAULT_COOKIE_NAME)]
    pub cookie_name: String,

    /// Seconds between SSE heartbeat comments (0 disables them)
    #[arg(long, env = "MERCURE_HEARTBEAT_INTERVAL", default_value_t = 40)]
    pub heartbeat_interval: u64,

    /// Accept the authorization JWT from the "authorization" query
    /// parameter (for EventSource clients that cannot set headers)
    #[arg(
        long,
        env = "MERCURE_QUERY_PARAM_AUTHORIZATION",
        action = clap::ArgAction::Set,
        default_value = "false"
    )]
    pub query_param_authorization: bool,

    /// Maximum number of topic parameters per subscription (0 = unlimited)
    #[arg(long, env = "MERCURE_MAX_TOPICS", default_value_t = 20)]
    pub max_topics: usize,

    /// Per-subscriber live event buffer; a subscriber that falls this far
    /// behind is disconnected rather than delaying publishers
    #[arg(long, env = "MERCURE_SUBSCRIBER_BUFFER", default_value_t = 256)]
    pub subscriber_buffer: usize,

    /// Set the log level verbosity threshold (level) to control what gets displayed on console output
    #[arg(
        short,
        long,
        env = "MERCURE_LOG_LEVEL",
        default_value_t = LevelFilter::Info,
        value_parser = clap::builder::PossibleValuesParser::new(["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"])
            .map(|s| s.parse::<LevelFilter>().unwrap()),
        )]
    pub log_level_filter: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        bootstrap_env();
        Config::parse()
    }

    /// Socket address string to bind.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.interface, self.port)
    }

    /// Heartbeat interval; `None` when heartbeats are disabled.
    pub fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_interval > 0).then(|| Duration::from_secs(self.heartbeat_interval))
    }

    pub fn jwt_key(&self) -> Option<&str> {
        self.jwt_key.as_deref()
    }

    /// Key material for verifying publisher tokens, decoded.
    pub fn publisher_key(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        self.publisher_jwt_key
            .as_deref()
            .or(self.jwt_key.as_deref())
            .map(decode_key_material)
            .transpose()
    }

    /// Key material for verifying subscriber tokens, decoded.
    pub fn subscriber_key(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        self.subscriber_jwt_key
            .as_deref()
            .or(self.jwt_key.as_deref())
            .map(decode_key_material)
            .transpose()
    }

    /// Signature algorithm for publisher tokens.
    pub fn publisher_algorithm(&self) -> &str {
        if self.publisher_jwt_key.is_some() {
            &self.publisher_jwt_algorithm
        } else {
            &self.jwt_algorithm
        }
    }

    /// Signature algorithm for subscriber tokens.
    pub fn subscriber_algorithm(&self) -> &str {
        if self.subscriber_jwt_key.is_some() {
            &self.subscriber_jwt_algorithm
        } else {
            &self.jwt_algorithm
        }
    }

    /// JWK Set URL for publisher tokens, when that group is configured.
    pub fn publisher_jwks(&self) -> Option<&str> {
        self.publisher_jwks_url.as_deref().or(self.jwks_url.as_deref())
    }

    /// JWK Set URL for subscriber tokens, when that group is configured.
    pub fn subscriber_jwks(&self) -> Option<&str> {
        self.subscriber_jwks_url.as_deref().or(self.jwks_url.as_deref())
    }

    /// Rejects configurations mixing mutually exclusive key groups.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let groups = [
            self.jwt_key.is_some(),
            self.publisher_jwt_key.is_some() || self.subscriber_jwt_key.is_some(),
            self.jwks_url.is_some(),
            self.publisher_jwks_url.is_some() || self.subscriber_jwks_url.is_some(),
        ];
        match groups.iter().filter(|set| **set).count() {
            0 => Err(ConfigError::NoKeyConfigured),
            1 => Ok(()),
            _ => Err(ConfigError::ConflictingKeys),
        }
    }

    /// Used by tests and the key tooling to build a config without touching
    /// the process environment.
    pub fn parse_from_args<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Config::parse_from(args)
    }
}

/// Loads `.env` and resolves `*_FILE` indirections; must run before the
/// command line is parsed so the env-backed options see the result.
pub fn bootstrap_env() {
    dotenv().ok();
    resolve_env_files();
}

/// Resolves `MERCURE_*_FILE` indirections: each such variable points at a
/// file whose contents become the value of the variable without the suffix.
/// An already-set variable wins over its `_FILE` companion.
pub fn resolve_env_files() {
    let vars: Vec<(String, String)> = std::env::vars().collect();
    for (name, path) in vars {
        let Some(base) = name.strip_suffix("_FILE") else {
            continue;
        };
        if !base.starts_with("MERCURE_") || std::env::var_os(base).is_some() {
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                std::env::set_var(base, contents.trim_end_matches(['\r', '\n']));
            }
            Err(e) => warn!("Ignoring {name}: cannot read {path}: {e}"),
        }
    }
}

/// Decodes key material, honoring the `base64:` prefix.
pub fn decode_key_material(raw: &str) -> Result<Vec<u8>, ConfigError> {
    match raw.strip_prefix(BASE64_KEY_PREFIX) {
        Some(encoded) => Ok(BASE64.decode(encoded)?),
        None => Ok(raw.as_bytes().to_vec()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec!["mercure"]
    }

    #[test]
    fn defaults_match_the_documented_options() {
        let config =
            Config::parse_from_args(base_args().into_iter().chain(["--jwt-key", "secret"]));
        assert_eq!(config.listen_addr(), "127.0.0.1:3000");
        assert_eq!(config.cookie_name, DEFAULT_COOKIE_NAME);
        assert_eq!(config.heartbeat(), Some(Duration::from_secs(40)));
        assert!(!config.anonymous);
        assert_eq!(config.allowed_origins, vec!["*"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_heartbeat_disables_heartbeats() {
        let config = Config::parse_from_args(base_args().into_iter().chain([
            "--jwt-key",
            "secret",
            "--heartbeat-interval",
            "0",
        ]));
        assert_eq!(config.heartbeat(), None);
    }

    #[test]
    fn key_groups_are_mutually_exclusive() {
        let config = Config::parse_from_args(base_args().into_iter().chain([
            "--jwt-key",
            "secret",
            "--jwks-url",
            "https://example.com/jwks.json",
        ]));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ConflictingKeys)
        ));

        let config = Config::parse_from_args(base_args().into_iter().chain([
            "--publisher-jwt-key",
            "pub-secret",
            "--subscriber-jwks-url",
            "https://example.com/jwks.json",
        ]));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ConflictingKeys)
        ));
    }

    #[test]
    fn split_keys_are_one_group() {
        let config = Config::parse_from_args(base_args().into_iter().chain([
            "--publisher-jwt-key",
            "pub-secret",
            "--subscriber-jwt-key",
            "sub-secret",
        ]));
        assert!(config.validate().is_ok());
        assert_eq!(
            config.publisher_key().unwrap().unwrap(),
            b"pub-secret".to_vec()
        );
        assert_eq!(
            config.subscriber_key().unwrap().unwrap(),
            b"sub-secret".to_vec()
        );
    }

    #[test]
    fn missing_keys_are_rejected() {
        let config = Config::parse_from_args(base_args());
        assert!(matches!(config.validate(), Err(ConfigError::NoKeyConfigured)));
    }

    #[test]
    fn shared_key_serves_both_roles() {
        let config =
            Config::parse_from_args(base_args().into_iter().chain(["--jwt-key", "secret"]));
        assert_eq!(config.publisher_key().unwrap().unwrap(), b"secret".to_vec());
        assert_eq!(config.subscriber_key().unwrap().unwrap(), b"secret".to_vec());
        assert_eq!(config.publisher_algorithm(), "HS256");
    }

    #[test]
    fn base64_key_material_is_decoded() {
        assert_eq!(decode_key_material("base64:aGVsbG8=").unwrap(), b"hello");
        assert_eq!(decode_key_material("plain").unwrap(), b"plain");
        assert!(decode_key_material("base64:!!!").is_err());
    }

    #[test]
    fn boolean_options_accept_literal_true_and_false() {
        let config = Config::parse_from_args(base_args().into_iter().chain([
            "--jwt-key",
            "secret",
            "--anonymous",
            "true",
            "--query-param-authorization",
            "false",
        ]));
        assert!(config.anonymous);
        assert!(!config.query_param_authorization);
    }
}
