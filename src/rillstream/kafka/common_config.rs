use std::collections::HashMap;
use std::time::Duration;

/// Configuration fields shared by every Kafka client this library creates.
///
/// Anything rdkafka understands but this struct does not model goes through
/// the custom property passthrough map, which is applied last and therefore
/// wins over the modeled fields.
#[derive(Debug, Clone)]
pub struct CommonKafkaConfig {
    /// Kafka broker list (e.g., "localhost:9092" or "broker1:9092,broker2:9092")
    pub brokers: String,
    /// Client ID for this consumer instance
    pub client_id: Option<String>,
    /// Request timeout for Kafka operations
    pub request_timeout: Duration,
    /// Retry backoff time between failed requests
    pub retry_backoff: Duration,
    /// Additional custom configuration properties
    pub custom_config: HashMap<String, String>,
}

impl Default for CommonKafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            client_id: None,
            request_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_millis(100),
            custom_config: HashMap::new(),
        }
    }
}

impl CommonKafkaConfig {
    /// Create a new common configuration with brokers
    pub fn new(brokers: impl Into<String>) -> Self {
        Self {
            brokers: brokers.into(),
            ..Default::default()
        }
    }

    /// Set client ID
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set retry backoff
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Add custom configuration property
    pub fn custom_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom_config.insert(key.into(), value.into());
        self
    }

    /// Add multiple custom properties
    pub fn custom_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.custom_config.extend(properties);
        self
    }
}
