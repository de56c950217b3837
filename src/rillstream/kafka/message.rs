use crate::rillstream::kafka::commit::CommittableOffset;
use crate::rillstream::kafka::headers::Headers;

/// A message with deserialized key, value, and headers plus partition
/// coordinates.
///
/// - **Key**: Optional deserialized key of type `K`
/// - **Value**: Deserialized message payload of type `V`
/// - **Headers**: Message metadata as a `Headers` collection
#[derive(Debug)]
pub struct Message<K, V> {
    pub key: Option<K>,
    pub value: V,
    pub headers: Headers,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: Option<i64>,
}

impl<K, V> Message<K, V> {
    /// Creates a new message
    pub fn new(
        key: Option<K>,
        value: V,
        headers: Headers,
        partition: i32,
        offset: i64,
        timestamp: Option<i64>,
    ) -> Self {
        Self {
            key,
            value,
            headers,
            partition,
            offset,
            timestamp,
        }
    }

    /// Returns a reference to the message key
    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    /// Returns a reference to the message value
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Returns a reference to the message headers
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Partition this message was read from
    pub fn partition(&self) -> i32 {
        self.partition
    }

    /// Offset of this message within its partition
    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Broker or producer timestamp in epoch milliseconds, when available
    pub fn timestamp(&self) -> Option<i64> {
        self.timestamp
    }

    /// Consumes the message and returns the owned value
    pub fn into_value(self) -> V {
        self.value
    }

    /// Consumes the message and returns all components as a tuple
    pub fn into_parts(self) -> (Option<K>, V, Headers) {
        (self.key, self.value, self.headers)
    }
}

/// A delivered record: the deserialized message plus the handle used to
/// commit its offset back to the broker.
#[derive(Debug)]
pub struct CommittableMessage<K, V> {
    message: Message<K, V>,
    committable: CommittableOffset,
}

impl<K, V> CommittableMessage<K, V> {
    pub(crate) fn new(message: Message<K, V>, committable: CommittableOffset) -> Self {
        Self {
            message,
            committable,
        }
    }

    pub fn message(&self) -> &Message<K, V> {
        &self.message
    }

    pub fn topic(&self) -> &str {
        &self.committable.topic_partition().topic
    }

    pub fn partition(&self) -> i32 {
        self.message.partition
    }

    pub fn offset(&self) -> i64 {
        self.message.offset
    }

    pub fn key(&self) -> Option<&K> {
        self.message.key()
    }

    pub fn value(&self) -> &V {
        self.message.value()
    }

    pub fn headers(&self) -> &Headers {
        self.message.headers()
    }

    /// The commit handle for this record's next offset
    pub fn committable_offset(&self) -> &CommittableOffset {
        &self.committable
    }

    /// Splits into the message and its commit handle
    pub fn into_parts(self) -> (Message<K, V>, CommittableOffset) {
        (self.message, self.committable)
    }
}
