//! Event log adapters backing the hub.
//!
//! Two adapters implement the [`events::Transport`] contract:
//!
//! - [`LocalTransport`]: a single-process ring buffer, the default;
//! - [`RedisTransport`]: Redis Streams, one append-only stream per event
//!   kind, shared by every hub instance pointed at the same server.
//!
//! The adapter is selected by the scheme of the configured transport URL.

use std::sync::Arc;

use events::{Transport, TransportError};
use url::Url;

pub mod local;
pub mod redis;

pub use self::local::LocalTransport;
pub use self::redis::RedisTransport;

/// Builds the transport for a configured URL.
///
/// `local://` takes an optional in-memory ring capacity (`size` query
/// parameter overrides `capacity`; `0` means unbounded). `redis://` and
/// `rediss://` URLs are handed to the Redis adapter as-is.
pub async fn new_transport(
    url: &str,
    capacity: usize,
) -> Result<Arc<dyn Transport>, TransportError> {
    let parsed = Url::parse(url).map_err(|_| TransportError::InvalidUrl(url.to_owned()))?;
    match parsed.scheme() {
        "local" => {
            let capacity = parsed
                .query_pairs()
                .find(|(key, _)| key == "size")
                .and_then(|(_, value)| value.parse().ok())
                .unwrap_or(capacity);
            Ok(Arc::new(LocalTransport::new(capacity)))
        }
        "redis" | "rediss" => Ok(Arc::new(RedisTransport::connect(url).await?)),
        scheme => Err(TransportError::UnsupportedScheme(scheme.to_owned())),
    }
}
