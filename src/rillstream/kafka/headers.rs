use rdkafka::message::Headers as KafkaHeaders;
use std::collections::HashMap;

/// Kafka message headers with support for null-valued entries.
///
/// Wraps a `HashMap<String, Option<String>>` behind builder-style insert
/// methods. Header values arriving from the wire are decoded with lossy UTF-8
/// conversion.
///
/// # Examples
///
/// ```rust
/// use rillstream::Headers;
///
/// let headers = Headers::new()
///     .insert("source", "web-api")
///     .insert("trace-id", "abc-123")
///     .insert_null("optional-field");
///
/// assert_eq!(headers.get("source"), Some("web-api"));
/// assert!(headers.contains_key("optional-field"));
/// assert_eq!(headers.get("optional-field"), None);
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Headers {
    inner: HashMap<String, Option<String>>,
}

impl Headers {
    /// Creates a new empty headers collection
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    /// Creates a new headers collection with specified capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: HashMap::with_capacity(capacity),
        }
    }

    /// Inserts a header with a value
    pub fn insert(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.insert(key.into(), Some(value.into()));
        self
    }

    /// Inserts a header with no value (null header)
    pub fn insert_null(mut self, key: impl Into<String>) -> Self {
        self.inner.insert(key.into(), None);
        self
    }

    /// Gets a header value by key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(key).and_then(|v| v.as_deref())
    }

    /// Gets a header entry by key, including null values
    pub fn get_optional(&self, key: &str) -> Option<&Option<String>> {
        self.inner.get(key)
    }

    /// Checks if a header exists (regardless of value)
    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// Returns the number of headers
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if there are no headers
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Iterates over all headers
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Option<String>)> {
        self.inner.iter()
    }

    /// Creates Headers from rdkafka headers
    pub(crate) fn from_rdkafka_headers<H: KafkaHeaders>(kafka_headers: &H) -> Self {
        let mut headers = HashMap::with_capacity(kafka_headers.count());

        for i in 0..kafka_headers.count() {
            let header = kafka_headers.get(i);
            let key = header.key.to_string();
            let value = header
                .value
                .map(|v| String::from_utf8_lossy(v).into_owned());
            headers.insert(key, value);
        }

        Self { inner: headers }
    }
}
