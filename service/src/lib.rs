use config::{Config, ConfigError};
use events::{Hub, Transport, TransportError};
use log::info;
use sse::SubscriberRegistry;
use std::sync::Arc;

pub mod config;
pub mod logging;

/// Builds the transport the hub runs on, from the configured URL.
pub async fn init_transport(config: &Config) -> Result<Arc<dyn Transport>, TransportError> {
    info!(
        "Transport config: url={}, size={}",
        config.transport_url, config.transport_size
    );
    transport::new_transport(&config.transport_url, config.transport_size).await
}

// Service-level state containing only infrastructure concerns
// Needs to implement Clone to be able to be passed into Router as State
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub hub: Hub,
    pub subscribers: Arc<SubscriberRegistry>,
}

impl AppState {
    pub fn new(app_config: Config, transport: Arc<dyn Transport>) -> Result<Self, ConfigError> {
        app_config.validate()?;
        Ok(Self {
            config: Arc::new(app_config),
            hub: Hub::new(transport),
            subscribers: Arc::new(SubscriberRegistry::new()),
        })
    }

    pub fn config_ref(&self) -> &Config {
        self.config.as_ref()
    }
}
