use rdkafka::config::ClientConfig;
use std::collections::HashMap;
use std::time::Duration;

/// Builder mapping this library's configuration onto an rdkafka
/// `ClientConfig`.
///
/// Custom properties are applied last so callers can override any modeled
/// field.
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Create a new client config builder
    pub fn new() -> Self {
        Self {
            config: ClientConfig::new(),
        }
    }

    /// Set bootstrap servers (brokers)
    pub fn bootstrap_servers(mut self, brokers: &str) -> Self {
        self.config.set("bootstrap.servers", brokers);
        self
    }

    /// Set client ID if provided
    pub fn client_id(mut self, client_id: Option<&str>) -> Self {
        if let Some(id) = client_id {
            self.config.set("client.id", id);
        }
        self
    }

    /// Set request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config
            .set("request.timeout.ms", timeout.as_millis().to_string());
        self
    }

    /// Set retry backoff
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config
            .set("retry.backoff.ms", backoff.as_millis().to_string());
        self
    }

    /// Add a single property
    pub fn property(mut self, key: &str, value: impl Into<String>) -> Self {
        self.config.set(key, value.into());
        self
    }

    /// Add custom configuration properties
    pub fn custom_properties(mut self, custom_config: &HashMap<String, String>) -> Self {
        for (key, value) in custom_config {
            self.config.set(key, value);
        }
        self
    }

    /// Build the final ClientConfig
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
